use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};

use crate::errors::LifelineError;
use crate::events::{ChatMessage, UserIdentity};

/// An SDP session description exchanged through the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A trickled ICE candidate, in the browser init shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Events the coordinator sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        identity: UserIdentity,
    },
    #[serde(rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    Signal {
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage { room_id: String, message: String },
}

/// Events the relay delivers to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    PeerJoined { socket_id: String },
    Signal {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        candidate: Option<IceCandidate>,
    },
    #[serde(rename_all = "camelCase")]
    PeerLeft { socket_id: String },
    ChatMessage(ChatMessage),
}

/// The underlying bidirectional event channel to the relay.
///
/// Delivery is at-most-once per transport connection; reconnection after a
/// transient drop (bounded retries) is the transport's job. Missed events are
/// never replayed by either side.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, event: ClientEvent) -> Result<(), LifelineError>;
}

/// Typed client over the signaling relay.
///
/// Tracks room membership so join and leave are idempotent; everything else
/// is fire-and-forget.
#[derive(Clone)]
pub struct SignalingClient {
    transport: Arc<dyn SignalingTransport>,
    joined: Arc<Mutex<Option<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>>,
}

impl SignalingClient {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        incoming: mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Self {
        Self {
            transport,
            joined: Arc::new(Mutex::new(None)),
            incoming: Arc::new(Mutex::new(Some(incoming))),
        }
    }

    /// Take the inbound event stream. Yields once; the event pump owns it.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.incoming.lock().await.take()
    }

    pub async fn joined_room(&self) -> Option<String> {
        self.joined.lock().await.clone()
    }

    /// Join a room. Joining the room already joined is a no-op; joining a
    /// different room leaves the previous one first.
    pub async fn join(&self, room_id: &str, identity: &UserIdentity) -> Result<(), LifelineError> {
        let mut joined = self.joined.lock().await;
        if joined.as_deref() == Some(room_id) {
            return Ok(());
        }
        if let Some(previous) = joined.take() {
            self.transport
                .send(ClientEvent::LeaveRoom { room_id: previous })
                .await?;
        }
        self.transport
            .send(ClientEvent::JoinRoom {
                room_id: room_id.to_string(),
                identity: identity.clone(),
            })
            .await?;
        *joined = Some(room_id.to_string());
        Ok(())
    }

    /// Leave a room. Leaving a room the client is not in is a no-op.
    pub async fn leave(&self, room_id: &str) -> Result<(), LifelineError> {
        let mut joined = self.joined.lock().await;
        if joined.as_deref() != Some(room_id) {
            return Ok(());
        }
        *joined = None;
        self.transport
            .send(ClientEvent::LeaveRoom {
                room_id: room_id.to_string(),
            })
            .await
    }

    /// Send a negotiation message to one peer. Fire-and-forget: a failed
    /// send is logged and dropped, the peer is negotiated again only if it
    /// rejoins.
    pub async fn send_signal(
        &self,
        target: &str,
        description: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
    ) {
        let event = ClientEvent::Signal {
            target: target.to_string(),
            description,
            candidate,
        };
        if let Err(e) = self.transport.send(event).await {
            tracing::warn!("signal to {target} dropped: {e}");
        }
    }

    /// Fan a chat message out to the room. Fire-and-forget.
    pub async fn send_chat(&self, room_id: &str, message: &str) {
        let event = ClientEvent::ChatMessage {
            room_id: room_id.to_string(),
            message: message.to_string(),
        };
        if let Err(e) = self.transport.send(event).await {
            tracing::warn!("chat message dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeTransport, identity};

    fn make_client(transport: &Arc<FakeTransport>) -> SignalingClient {
        let (_tx, rx) = mpsc::unbounded_channel();
        SignalingClient::new(transport.clone() as Arc<dyn SignalingTransport>, rx)
    }

    #[tokio::test]
    async fn join_twice_sends_one_event() {
        let transport = Arc::new(FakeTransport::new());
        let client = make_client(&transport);

        client.join("abc", &identity("u1")).await.unwrap();
        client.join("abc", &identity("u1")).await.unwrap();

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(client.joined_room().await.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn join_other_room_leaves_previous() {
        let transport = Arc::new(FakeTransport::new());
        let client = make_client(&transport);

        client.join("abc", &identity("u1")).await.unwrap();
        client.join("def", &identity("u1")).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(&sent[1], ClientEvent::LeaveRoom { room_id } if room_id == "abc"));
        assert!(matches!(&sent[2], ClientEvent::JoinRoom { room_id, .. } if room_id == "def"));
    }

    #[tokio::test]
    async fn leave_room_not_joined_is_noop() {
        let transport = Arc::new(FakeTransport::new());
        let client = make_client(&transport);

        client.leave("abc").await.unwrap();
        assert!(transport.sent().is_empty());

        client.join("abc", &identity("u1")).await.unwrap();
        client.leave("def").await.unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn signal_event_matches_wire_shape() {
        let event = ClientEvent::Signal {
            target: "p1".into(),
            description: Some(SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
            }),
            candidate: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "signal");
        assert_eq!(json["payload"]["target"], "p1");
        assert_eq!(json["payload"]["description"]["type"], "offer");
        assert!(json["payload"].get("candidate").is_none());
    }

    #[test]
    fn inbound_chat_event_parses() {
        let json = serde_json::json!({
            "event": "chat-message",
            "payload": {
                "from": {"id": "u2", "name": "Bea", "email": "bea@example.com"},
                "text": "on my way",
                "timestamp": 1700000000123i64,
            }
        });
        let event: ServerEvent = serde_json::from_value(json).unwrap();
        match event {
            ServerEvent::ChatMessage(msg) => {
                assert_eq!(msg.from.id, "u2");
                assert_eq!(msg.text, "on my way");
                assert_eq!(msg.room_id, "");
            }
            other => panic!("expected ChatMessage, got {other:?}"),
        }
    }
}

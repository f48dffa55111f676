use std::sync::Arc;

use tokio::sync::Mutex;

use crate::events::{ChatMessage, EventEmitter, LifelineEvent};
use crate::signaling::SignalingClient;

/// Append-only chat log scoped to the active room.
///
/// Messages are applied in arrival order; the sender timestamp is carried
/// for display only. The log never survives a room change.
pub struct ChatChannel {
    signaling: SignalingClient,
    emitter: EventEmitter,
    room: Arc<Mutex<Option<String>>>,
    messages: Arc<Mutex<Vec<ChatMessage>>>,
}

impl ChatChannel {
    pub fn new(signaling: SignalingClient, emitter: EventEmitter) -> Self {
        Self {
            signaling,
            emitter,
            room: Arc::new(Mutex::new(None)),
            messages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Scope the channel to a room (or to none). Rebinding clears the log.
    pub async fn bind_room(&self, room_id: Option<String>) {
        let mut room = self.room.lock().await;
        if *room == room_id {
            return;
        }
        *room = room_id;
        self.messages.lock().await.clear();
    }

    pub async fn room(&self) -> Option<String> {
        self.room.lock().await.clone()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().await.clone()
    }

    /// Fan a message out to the room. Empty input after trimming, or no
    /// joined room, is a silent no-op.
    pub async fn send(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(room_id) = self.room.lock().await.clone() else {
            return;
        };
        self.signaling.send_chat(&room_id, text).await;
    }

    /// Apply an inbound message from the relay.
    pub async fn on_receive(&self, mut message: ChatMessage) {
        let Some(room_id) = self.room.lock().await.clone() else {
            tracing::debug!("chat message with no room bound, dropped");
            return;
        };
        message.room_id = room_id;
        self.messages.lock().await.push(message.clone());
        self.emitter.emit(LifelineEvent::ChatMessageReceived(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{ClientEvent, SignalingTransport};
    use crate::testutil::{FakeTransport, chat_message};
    use tokio::sync::mpsc;

    fn make_channel(transport: &Arc<FakeTransport>) -> ChatChannel {
        let (_tx, rx) = mpsc::unbounded_channel();
        let signaling =
            SignalingClient::new(transport.clone() as Arc<dyn SignalingTransport>, rx);
        ChatChannel::new(signaling, EventEmitter::new())
    }

    #[tokio::test]
    async fn empty_and_whitespace_messages_are_not_sent() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);
        chat.bind_room(Some("abc".into())).await;

        chat.send("").await;
        chat.send("   \t\n").await;

        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn send_without_room_is_noop() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);

        chat.send("anyone there?").await;

        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn send_tags_current_room_and_trims() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);
        chat.bind_room(Some("abc".into())).await;

        chat.send("  help is coming  ").await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            ClientEvent::ChatMessage { room_id, message } => {
                assert_eq!(room_id, "abc");
                assert_eq!(message, "help is coming");
            }
            other => panic!("expected ChatMessage, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn messages_keep_arrival_order() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);
        chat.bind_room(Some("abc".into())).await;

        // Sender timestamps out of order on purpose: arrival order wins.
        chat.on_receive(chat_message("u1", "second", 200)).await;
        chat.on_receive(chat_message("u2", "first", 100)).await;

        let log = chat.messages().await;
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].text, "second");
        assert_eq!(log[1].text, "first");
        assert!(log.iter().all(|m| m.room_id == "abc"));
    }

    #[tokio::test]
    async fn rebinding_room_clears_the_log() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);
        chat.bind_room(Some("abc".into())).await;
        chat.on_receive(chat_message("u1", "hello", 1)).await;

        chat.bind_room(Some("def".into())).await;
        assert!(chat.messages().await.is_empty());

        chat.on_receive(chat_message("u1", "again", 2)).await;
        chat.bind_room(None).await;
        assert!(chat.messages().await.is_empty());
    }

    #[tokio::test]
    async fn rebinding_same_room_keeps_the_log() {
        let transport = Arc::new(FakeTransport::new());
        let chat = make_channel(&transport);
        chat.bind_room(Some("abc".into())).await;
        chat.on_receive(chat_message("u1", "hello", 1)).await;

        chat.bind_room(Some("abc".into())).await;
        assert_eq!(chat.messages().await.len(), 1);
    }
}

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Events emitted by the coordinator to UI listeners.
#[derive(Debug, Clone)]
pub enum LifelineEvent {
    SessionStatusChanged(SessionStatus),
    LocationReported(GeoPoint),
    LocationPermissionDenied,
    RemoteStreamAdded { peer_id: String },
    RemoteStreamRemoved { peer_id: String },
    ChatMessageReceived(ChatMessage),
    RosterUpdated(Vec<SessionSummary>),
    CredentialExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Stopped,
}

/// A WGS84 position, named the way the registry payloads name it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// The signed-in user as handed over by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub email: String,
}

/// One chat message in the active room.
///
/// `timestamp` is sender-monotonic and display-only; delivery order is
/// arrival order. `room_id` is stamped locally since the relay scopes
/// inbound messages to the joined room already.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default)]
    pub room_id: String,
    pub from: UserIdentity,
    pub text: String,
    pub timestamp: i64,
}

/// One row of the registry's active-session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub email: String,
    pub latitude: f64,
    pub longitude: f64,
    pub updated_at: String,
}

/// Trait for receiving events from the core.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait LifelineEventListener: Send + Sync {
    fn on_event(&self, event: LifelineEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn LifelineEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn LifelineEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: LifelineEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

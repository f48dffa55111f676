use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::chat::ChatChannel;
use crate::errors::LifelineError;
use crate::events::{
    EventEmitter, GeoPoint, LifelineEvent, LifelineEventListener, SessionStatus, UserIdentity,
};
use crate::location::{LocationReporter, PositionSource};
use crate::mesh::{PeerConnector, PeerMeshManager};
use crate::registry::SessionRegistry;
use crate::signaling::{ServerEvent, SignalingClient};
use crate::store::SessionStore;

/// Position upload cadence the original service used.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// The session in progress, as observed by the UI.
#[derive(Debug, Clone)]
pub struct EmergencySession {
    pub id: String,
    pub owner: UserIdentity,
    pub location: Option<GeoPoint>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub last_reported_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    id: String,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    initial_location: Option<GeoPoint>,
}

/// Single authority over session identity and lifecycle.
///
/// Owns the reporter, the mesh, the chat channel and the signaling client;
/// nothing else mutates session status. Also drives the responder-side flow
/// of attaching to somebody else's session room.
pub struct SessionController {
    registry: Arc<dyn SessionRegistry>,
    signaling: SignalingClient,
    mesh: Arc<PeerMeshManager>,
    chat: Arc<ChatChannel>,
    reporter: LocationReporter,
    store: SessionStore,
    identity: UserIdentity,
    emitter: EventEmitter,
    report_interval: Duration,
    session: Arc<Mutex<Option<SessionRecord>>>,
    active: Arc<AtomicBool>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionController {
    pub fn new(
        registry: Arc<dyn SessionRegistry>,
        connector: Arc<dyn PeerConnector>,
        signaling: SignalingClient,
        position: Arc<dyn PositionSource>,
        store: SessionStore,
        identity: UserIdentity,
        report_interval: Duration,
    ) -> Self {
        let emitter = EventEmitter::new();
        let mesh = Arc::new(PeerMeshManager::new(
            connector,
            signaling.clone(),
            emitter.clone(),
        ));
        let chat = Arc::new(ChatChannel::new(signaling.clone(), emitter.clone()));
        let reporter = LocationReporter::new(registry.clone(), position, emitter.clone());
        Self {
            registry,
            signaling,
            mesh,
            chat,
            reporter,
            store,
            identity,
            emitter,
            report_interval,
            session: Arc::new(Mutex::new(None)),
            active: Arc::new(AtomicBool::new(false)),
            pump: Mutex::new(None),
        }
    }

    /// Register a listener for coordinator events.
    pub fn add_listener(&self, listener: Arc<dyn LifelineEventListener>) {
        self.emitter.add_listener(listener);
    }

    pub fn mesh(&self) -> Arc<PeerMeshManager> {
        self.mesh.clone()
    }

    pub fn chat(&self) -> Arc<ChatChannel> {
        self.chat.clone()
    }

    pub async fn status(&self) -> Option<SessionStatus> {
        self.session.lock().await.as_ref().map(|r| r.status)
    }

    /// Snapshot of the session in progress, location folded in from the
    /// reporter.
    pub async fn session(&self) -> Option<EmergencySession> {
        let record = self.session.lock().await.clone()?;
        let last = self.reporter.last_reported().await;
        Some(EmergencySession {
            id: record.id,
            owner: self.identity.clone(),
            location: last.map(|(point, _)| point).or(record.initial_location),
            status: record.status,
            started_at: record.started_at,
            last_reported_at: last.map(|(_, at)| at),
        })
    }

    /// Start a new session at the given position.
    ///
    /// On success the server-issued id is persisted so a reloaded process
    /// can resume. A credential-expired rejection clears local state and
    /// must send the caller back through authentication.
    pub async fn start(&self, location: GeoPoint) -> Result<String, LifelineError> {
        let id = match self.registry.start(location).await {
            Ok(id) => id,
            Err(LifelineError::CredentialExpired) => {
                self.store.clear();
                self.emitter.emit(LifelineEvent::CredentialExpired);
                return Err(LifelineError::CredentialExpired);
            }
            Err(e) => return Err(e),
        };

        self.store.set_session_id(&id);
        *self.session.lock().await = Some(SessionRecord {
            id: id.clone(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            initial_location: Some(location),
        });
        self.emitter
            .emit(LifelineEvent::SessionStatusChanged(SessionStatus::Active));

        self.enter_room(&id).await;
        self.reporter.begin_cycle(self.report_interval).await;
        tracing::info!("session {id} started");
        Ok(id)
    }

    /// Recover the session persisted by a previous process, if any.
    ///
    /// Does not create anything at the registry; it re-joins the signaling
    /// room and restarts reporting under the stored id. Returns whether a
    /// session was there to resume.
    pub async fn resume(&self) -> Result<bool, LifelineError> {
        let Some(id) = self.store.session_id() else {
            return Ok(false);
        };

        *self.session.lock().await = Some(SessionRecord {
            id: id.clone(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            initial_location: None,
        });
        self.emitter
            .emit(LifelineEvent::SessionStatusChanged(SessionStatus::Active));

        self.enter_room(&id).await;
        self.reporter.begin_cycle(self.report_interval).await;
        tracing::info!("session {id} resumed");
        Ok(true)
    }

    /// End the session in progress.
    ///
    /// The registry call is best-effort; local teardown is unconditional and
    /// ordered so a crash partway through never leaves a live reporter
    /// without a room membership that the next `resume` would surface:
    /// registry stop, then timers, then peers, then room, then durable state.
    pub async fn stop(&self) -> Result<(), LifelineError> {
        let id = self.session.lock().await.as_ref().map(|r| r.id.clone());
        let Some(id) = id else {
            self.store.clear();
            return Ok(());
        };
        self.active.store(false, Ordering::SeqCst);

        let stop_result = self.registry.stop().await;
        if let Err(e) = &stop_result {
            tracing::warn!("registry stop failed, tearing down anyway: {e}");
        }

        self.reporter.stop().await;
        self.mesh.teardown_all().await;
        if let Err(e) = self.signaling.leave(&id).await {
            tracing::warn!("room leave failed: {e}");
        }
        self.chat.bind_room(None).await;
        self.store.clear();

        if let Some(record) = self.session.lock().await.as_mut() {
            record.status = SessionStatus::Stopped;
        }
        self.emitter
            .emit(LifelineEvent::SessionStatusChanged(SessionStatus::Stopped));
        tracing::info!("session {id} stopped");

        match stop_result {
            Err(LifelineError::CredentialExpired) => {
                self.emitter.emit(LifelineEvent::CredentialExpired);
                Err(LifelineError::CredentialExpired)
            }
            _ => Ok(()),
        }
    }

    /// Responder side: attach to an existing session's room. Touches neither
    /// the registry lifecycle endpoints nor the durable store.
    pub async fn join_room(&self, room_id: &str) {
        self.enter_room(room_id).await;
        tracing::info!("joined room {room_id}");
    }

    /// Responder side: detach from the joined room, closing all peers and
    /// releasing capture media.
    pub async fn leave_room(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.mesh.teardown_all().await;
        if let Some(room) = self.signaling.joined_room().await {
            if let Err(e) = self.signaling.leave(&room).await {
                tracing::warn!("room leave failed: {e}");
            }
        }
        self.chat.bind_room(None).await;
    }

    /// Local cleanup for a forced logout (expired credential observed
    /// anywhere): tear everything down without calling the registry and
    /// clear all durable state.
    pub async fn force_logout(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.reporter.stop().await;
        self.mesh.teardown_all().await;
        if let Some(room) = self.signaling.joined_room().await {
            if let Err(e) = self.signaling.leave(&room).await {
                tracing::warn!("room leave failed: {e}");
            }
        }
        self.chat.bind_room(None).await;
        self.store.clear();
        let had_session = {
            let mut session = self.session.lock().await;
            match session.as_mut() {
                Some(record) => {
                    record.status = SessionStatus::Stopped;
                    true
                }
                None => false,
            }
        };
        if had_session {
            self.emitter
                .emit(LifelineEvent::SessionStatusChanged(SessionStatus::Stopped));
        }
        tracing::info!("local state cleared for logout");
    }

    async fn enter_room(&self, room_id: &str) {
        if let Err(e) = self.signaling.join(room_id, &self.identity).await {
            tracing::warn!("room join send failed, transport reconnect will retry: {e}");
        }
        self.chat.bind_room(Some(room_id.to_string())).await;
        self.active.store(true, Ordering::SeqCst);
        self.ensure_pump().await;
    }

    /// Spawn the relay event pump once. It outlives individual sessions;
    /// the active flag gates dispatch so events arriving after a teardown
    /// are dropped, never replayed into fresh state.
    async fn ensure_pump(&self) {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return;
        }
        let Some(mut events) = self.signaling.take_events().await else {
            return;
        };

        let mesh = self.mesh.clone();
        let chat = self.chat.clone();
        let active = self.active.clone();

        *pump = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !active.load(Ordering::SeqCst) {
                    continue;
                }
                // One event is handled to completion before the next, which
                // serializes handling per peer as a side effect.
                match event {
                    ServerEvent::PeerJoined { socket_id } => {
                        mesh.handle_peer_joined(&socket_id).await;
                    }
                    ServerEvent::Signal {
                        from,
                        description,
                        candidate,
                    } => {
                        mesh.handle_signal(&from, description, candidate).await;
                    }
                    ServerEvent::PeerLeft { socket_id } => {
                        mesh.handle_peer_left(&socket_id).await;
                    }
                    ServerEvent::ChatMessage(message) => {
                        chat.on_receive(message).await;
                    }
                }
            }
            tracing::debug!("signaling event pump ended");
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::NegotiationState;
    use crate::signaling::{
        ClientEvent, SdpKind, SessionDescription, SignalingTransport,
    };
    use crate::testutil::{
        FakeConnector, FakeRegistry, FakeSource, FakeTransport, chat_message, identity,
    };
    use tokio::sync::mpsc;

    const TICK: Duration = Duration::from_millis(100);

    struct Rig {
        controller: SessionController,
        registry: Arc<FakeRegistry>,
        transport: Arc<FakeTransport>,
        connector: Arc<FakeConnector>,
        inbound: mpsc::UnboundedSender<ServerEvent>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        rig_in(dir)
    }

    fn rig_in(dir: tempfile::TempDir) -> Rig {
        let registry = Arc::new(FakeRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connector = Arc::new(FakeConnector::new());
        let (inbound, rx) = mpsc::unbounded_channel();
        let signaling =
            SignalingClient::new(transport.clone() as Arc<dyn SignalingTransport>, rx);
        let store = SessionStore::new(dir.path().to_str().unwrap());
        let controller = SessionController::new(
            registry.clone(),
            connector.clone() as Arc<dyn PeerConnector>,
            signaling,
            Arc::new(FakeSource::at(10.0, 20.0)),
            store,
            identity("owner"),
            TICK,
        );
        Rig {
            controller,
            registry,
            transport,
            connector,
            inbound,
            _dir: dir,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_persists_id_and_goes_active() {
        let rig = rig();
        let location = GeoPoint { latitude: 10.0, longitude: 20.0 };

        let id = rig.controller.start(location).await.unwrap();

        assert_eq!(id, "abc");
        assert_eq!(rig.controller.status().await, Some(SessionStatus::Active));
        let session = rig.controller.session().await.unwrap();
        assert_eq!(session.id, "abc");
        assert_eq!(session.location, Some(location));
        assert_eq!(rig.registry.start_calls(), 1);
        assert!(matches!(
            &rig.transport.sent()[0],
            ClientEvent::JoinRoom { room_id, .. } if room_id == "abc"
        ));
        // Durable state visible to a later process.
        let store = SessionStore::new(rig._dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), Some("abc".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn resume_restarts_reporting_without_creating() {
        let dir = tempfile::tempdir().unwrap();
        SessionStore::new(dir.path().to_str().unwrap()).set_session_id("abc");
        let rig = rig_in(dir);

        let resumed = rig.controller.resume().await.unwrap();

        assert!(resumed);
        assert_eq!(rig.registry.start_calls(), 0);
        assert_eq!(rig.controller.status().await, Some(SessionStatus::Active));
        assert!(matches!(
            &rig.transport.sent()[0],
            ClientEvent::JoinRoom { room_id, .. } if room_id == "abc"
        ));

        // Reporting resumed on the stored id.
        tokio::time::sleep(TICK * 2 + Duration::from_millis(10)).await;
        assert!(rig.registry.update_calls() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_without_stored_id_does_nothing() {
        let rig = rig();
        assert!(!rig.controller.resume().await.unwrap());
        assert_eq!(rig.controller.status().await, None);
        assert!(rig.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_tears_everything_down() {
        let rig = rig();
        rig.controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap();
        rig.inbound
            .send(ServerEvent::PeerJoined { socket_id: "p1".into() })
            .unwrap();
        settle().await;
        assert_eq!(rig.controller.mesh().peer_count().await, 1);

        rig.controller.stop().await.unwrap();

        assert_eq!(rig.registry.stop_calls(), 1);
        assert_eq!(rig.controller.status().await, Some(SessionStatus::Stopped));
        assert_eq!(rig.controller.mesh().peer_count().await, 0);
        assert!(rig.connector.link(0).is_closed());
        assert_eq!(rig.connector.media_releases(), 1);
        assert!(rig.transport.sent().iter().any(|e| matches!(
            e,
            ClientEvent::LeaveRoom { room_id } if room_id == "abc"
        )));
        let store = SessionStore::new(rig._dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), None);

        // No reporting after stop.
        let uploads = rig.registry.update_calls();
        tokio::time::sleep(TICK * 3).await;
        assert_eq!(rig.registry.update_calls(), uploads);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_teardown_survives_registry_failure() {
        let rig = rig();
        rig.controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap();
        rig.registry.fail_next_stop();

        rig.controller.stop().await.unwrap();

        assert_eq!(rig.controller.status().await, Some(SessionStatus::Stopped));
        let store = SessionStore::new(rig._dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn start_with_expired_credential_fails_and_clears() {
        let rig = rig();
        rig.registry.expire_credentials();

        let err = rig
            .controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap_err();

        assert!(matches!(err, LifelineError::CredentialExpired));
        assert_eq!(rig.controller.status().await, None);
        assert!(rig.transport.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_events_drive_mesh_and_chat() {
        let rig = rig();
        rig.controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap();

        rig.inbound
            .send(ServerEvent::PeerJoined { socket_id: "p1".into() })
            .unwrap();
        settle().await;
        assert_eq!(
            rig.controller.mesh().state_of("p1").await,
            Some(NegotiationState::AwaitingAnswer)
        );

        rig.inbound
            .send(ServerEvent::Signal {
                from: "p1".into(),
                description: Some(SessionDescription {
                    kind: SdpKind::Answer,
                    sdp: "v=0 answer".into(),
                }),
                candidate: None,
            })
            .unwrap();
        settle().await;
        assert_eq!(
            rig.controller.mesh().state_of("p1").await,
            Some(NegotiationState::Connected)
        );

        rig.inbound
            .send(ServerEvent::ChatMessage(chat_message("p1", "coming", 1)))
            .unwrap();
        settle().await;
        let log = rig.controller.chat().messages().await;
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].room_id, "abc");

        rig.inbound
            .send(ServerEvent::PeerLeft { socket_id: "p1".into() })
            .unwrap();
        settle().await;
        assert_eq!(rig.controller.mesh().peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn events_after_stop_are_dropped() {
        let rig = rig();
        rig.controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap();
        rig.controller.stop().await.unwrap();

        rig.inbound
            .send(ServerEvent::PeerJoined { socket_id: "late".into() })
            .unwrap();
        settle().await;

        assert_eq!(rig.controller.mesh().peer_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn responder_joins_and_leaves_a_room() {
        let rig = rig();
        rig.controller.join_room("abc").await;
        rig.inbound
            .send(ServerEvent::PeerJoined { socket_id: "reporter".into() })
            .unwrap();
        settle().await;
        assert_eq!(rig.controller.mesh().peer_count().await, 1);
        // Responder flow never touches the registry lifecycle.
        assert_eq!(rig.registry.start_calls(), 0);

        rig.controller.leave_room().await;

        assert_eq!(rig.controller.mesh().peer_count().await, 0);
        assert_eq!(rig.connector.media_releases(), 1);
        assert!(rig.transport.sent().iter().any(|e| matches!(
            e,
            ClientEvent::LeaveRoom { room_id } if room_id == "abc"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn force_logout_clears_all_local_state() {
        let rig = rig();
        rig.controller
            .start(GeoPoint { latitude: 10.0, longitude: 20.0 })
            .await
            .unwrap();

        rig.controller.force_logout().await;

        assert_eq!(rig.controller.status().await, Some(SessionStatus::Stopped));
        // No registry stop call: the credential is already dead.
        assert_eq!(rig.registry.stop_calls(), 0);
        let store = SessionStore::new(rig._dir.path().to_str().unwrap());
        assert_eq!(store.session_id(), None);
    }
}

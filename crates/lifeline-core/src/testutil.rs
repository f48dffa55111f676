//! Hand-rolled fakes for the trait seams, shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};

use crate::errors::LifelineError;
use crate::events::{
    ChatMessage, EventEmitter, GeoPoint, LifelineEvent, LifelineEventListener, SessionSummary,
    UserIdentity,
};
use crate::location::PositionSource;
use crate::mesh::{PeerConnector, PeerHandle, PeerLink, PeerLinkEvent};
use crate::registry::SessionRegistry;
use crate::signaling::{ClientEvent, IceCandidate, SdpKind, SessionDescription, SignalingTransport};

pub fn identity(id: &str) -> UserIdentity {
    UserIdentity {
        id: id.to_string(),
        name: format!("User {id}"),
        email: format!("{id}@example.com"),
    }
}

pub fn chat_message(from: &str, text: &str, timestamp: i64) -> ChatMessage {
    ChatMessage {
        room_id: String::new(),
        from: identity(from),
        text: text.to_string(),
        timestamp,
    }
}

pub fn summary(id: &str) -> SessionSummary {
    SessionSummary {
        id: id.to_string(),
        name: format!("Reporter {id}"),
        email: format!("{id}@example.com"),
        latitude: 10.0,
        longitude: 20.0,
        updated_at: "2024-05-01T12:00:00.000Z".to_string(),
    }
}

/// An emitter wired to a vector capturing everything it emits.
pub fn capture_events() -> (EventEmitter, Arc<StdMutex<Vec<LifelineEvent>>>) {
    struct Capture(Arc<StdMutex<Vec<LifelineEvent>>>);
    impl LifelineEventListener for Capture {
        fn on_event(&self, event: LifelineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }
    let events = Arc::new(StdMutex::new(Vec::new()));
    let emitter = EventEmitter::new();
    emitter.add_listener(Arc::new(Capture(events.clone())));
    (emitter, events)
}

/// Transport that records outbound events and never fails.
pub struct FakeTransport {
    sent: StdMutex<Vec<ClientEvent>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            sent: StdMutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn send(&self, event: ClientEvent) -> Result<(), LifelineError> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

/// Scriptable in-memory registry.
pub struct FakeRegistry {
    start_calls: AtomicUsize,
    update_calls: AtomicUsize,
    completed_updates: AtomicUsize,
    stop_calls: AtomicUsize,
    list_calls: AtomicUsize,
    listing: StdMutex<Vec<SessionSummary>>,
    expire: AtomicBool,
    fail_next_update: AtomicBool,
    fail_next_stop: AtomicBool,
    fail_next_list: AtomicBool,
    updates_blocked: AtomicBool,
    release: Notify,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            start_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
            completed_updates: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            listing: StdMutex::new(Vec::new()),
            expire: AtomicBool::new(false),
            fail_next_update: AtomicBool::new(false),
            fail_next_stop: AtomicBool::new(false),
            fail_next_list: AtomicBool::new(false),
            updates_blocked: AtomicBool::new(false),
            release: Notify::new(),
        }
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Uploads that ran to completion (as opposed to merely started).
    pub fn completed_updates(&self) -> usize {
        self.completed_updates.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn set_listing(&self, listing: Vec<SessionSummary>) {
        *self.listing.lock().unwrap() = listing;
    }

    /// Make every subsequent call fail with an expired credential.
    pub fn expire_credentials(&self) {
        self.expire.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_update(&self) {
        self.fail_next_update.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_stop(&self) {
        self.fail_next_stop.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_list(&self) {
        self.fail_next_list.store(true, Ordering::SeqCst);
    }

    /// Make uploads hang until `release_updates`.
    pub fn block_updates(&self) {
        self.updates_blocked.store(true, Ordering::SeqCst);
    }

    pub fn release_updates(&self) {
        self.updates_blocked.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

#[async_trait]
impl SessionRegistry for FakeRegistry {
    async fn start(&self, _location: GeoPoint) -> Result<String, LifelineError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire.load(Ordering::SeqCst) {
            return Err(LifelineError::CredentialExpired);
        }
        Ok("abc".to_string())
    }

    async fn update(&self, _location: GeoPoint) -> Result<(), LifelineError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire.load(Ordering::SeqCst) {
            return Err(LifelineError::CredentialExpired);
        }
        if self.fail_next_update.swap(false, Ordering::SeqCst) {
            return Err(LifelineError::Transient("update refused".into()));
        }
        while self.updates_blocked.load(Ordering::SeqCst) {
            let notified = self.release.notified();
            if !self.updates_blocked.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.completed_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), LifelineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire.load(Ordering::SeqCst) {
            return Err(LifelineError::CredentialExpired);
        }
        if self.fail_next_stop.swap(false, Ordering::SeqCst) {
            return Err(LifelineError::Transient("stop refused".into()));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, LifelineError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.expire.load(Ordering::SeqCst) {
            return Err(LifelineError::CredentialExpired);
        }
        if self.fail_next_list.swap(false, Ordering::SeqCst) {
            return Err(LifelineError::Transient("listing unavailable".into()));
        }
        Ok(self.listing.lock().unwrap().clone())
    }
}

/// Position source with a scriptable next failure.
pub struct FakeSource {
    point: StdMutex<GeoPoint>,
    fail_next: StdMutex<Option<LifelineError>>,
}

impl FakeSource {
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self {
            point: StdMutex::new(GeoPoint {
                latitude,
                longitude,
            }),
            fail_next: StdMutex::new(None),
        }
    }

    pub fn fail_next(&self, error: LifelineError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl PositionSource for FakeSource {
    async fn current_position(&self) -> Result<GeoPoint, LifelineError> {
        if let Some(error) = self.fail_next.lock().unwrap().take() {
            return Err(error);
        }
        Ok(*self.point.lock().unwrap())
    }
}

/// Negotiation primitive that records every call.
pub struct FakeLink {
    fail_offer: AtomicBool,
    applied: StdMutex<Vec<SessionDescription>>,
    candidates: StdMutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakeLink {
    fn new(fail_offer: bool) -> Self {
        Self {
            fail_offer: AtomicBool::new(fail_offer),
            applied: StdMutex::new(Vec::new()),
            candidates: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn applied_descriptions(&self) -> Vec<SessionDescription> {
        self.applied.lock().unwrap().clone()
    }

    pub fn added_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn create_offer(&self) -> Result<SessionDescription, LifelineError> {
        if self.fail_offer.load(Ordering::SeqCst) {
            return Err(LifelineError::Negotiation("offer refused".into()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 fake offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, LifelineError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 fake answer".to_string(),
        })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LifelineError> {
        self.applied.lock().unwrap().push(description);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LifelineError> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector producing `FakeLink`s and keeping the event senders around so
/// tests can push link events from the outside.
pub struct FakeConnector {
    links: StdMutex<Vec<Arc<FakeLink>>>,
    senders: StdMutex<Vec<mpsc::UnboundedSender<PeerLinkEvent>>>,
    fail_next_connect: AtomicBool,
    fail_next_offer: AtomicBool,
    media_releases: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self {
            links: StdMutex::new(Vec::new()),
            senders: StdMutex::new(Vec::new()),
            fail_next_connect: AtomicBool::new(false),
            fail_next_offer: AtomicBool::new(false),
            media_releases: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    /// The next link handed out refuses to produce an offer.
    pub fn fail_next_offer(&self) {
        self.fail_next_offer.store(true, Ordering::SeqCst);
    }

    pub fn links_created(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> Arc<FakeLink> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn media_releases(&self) -> usize {
        self.media_releases.load(Ordering::SeqCst)
    }

    /// Push an event as if it came from link `index`'s primitive.
    pub fn push_event(&self, index: usize, event: PeerLinkEvent) {
        self.senders.lock().unwrap()[index].send(event).unwrap();
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self) -> Result<PeerHandle, LifelineError> {
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(LifelineError::Negotiation("rtc unavailable".into()));
        }
        let link = Arc::new(FakeLink::new(
            self.fail_next_offer.swap(false, Ordering::SeqCst),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(link.clone());
        self.senders.lock().unwrap().push(tx);
        Ok(PeerHandle { link, events: rx })
    }

    async fn release_media(&self) {
        self.media_releases.fetch_add(1, Ordering::SeqCst);
    }
}

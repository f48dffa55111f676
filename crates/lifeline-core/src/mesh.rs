use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::errors::LifelineError;
use crate::events::{EventEmitter, LifelineEvent};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription, SignalingClient};

/// Per-peer negotiation progress.
///
/// Offering side walks `Idle → Offering → AwaitingAnswer → Connected`;
/// answering side walks `Idle → AnswerPending → Connected`. `Closed` is
/// terminal on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AnswerPending,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A remote media track as observed through the negotiation primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: TrackKind,
}

/// Events one negotiation primitive pushes back at the mesh.
#[derive(Debug)]
pub enum PeerLinkEvent {
    LocalCandidate(IceCandidate),
    TrackAdded(RemoteTrackInfo),
    Closed,
}

/// Narrow capability interface over one peer's negotiation primitive.
///
/// Candidates applied before the remote description is set are buffered by
/// the primitive, not here.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Generate and install the local offer.
    async fn create_offer(&self) -> Result<SessionDescription, LifelineError>;
    /// Generate and install the local answer to a previously applied offer.
    async fn create_answer(&self) -> Result<SessionDescription, LifelineError>;
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LifelineError>;
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LifelineError>;
    async fn close(&self);
}

pub struct PeerHandle {
    pub link: Arc<dyn PeerLink>,
    pub events: mpsc::UnboundedReceiver<PeerLinkEvent>,
}

/// Factory for negotiation primitives, one per remote peer.
///
/// The implementation holds the local capture tracks for the whole session
/// and attaches them to every primitive it hands out; `release_media` drops
/// them exactly once at full teardown. A connector without media still
/// produces working primitives (the session degrades to location + chat).
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self) -> Result<PeerHandle, LifelineError>;
    async fn release_media(&self);
}

struct PeerEntry {
    state: NegotiationState,
    link: Option<Arc<dyn PeerLink>>,
    remote_tracks: Vec<RemoteTrackInfo>,
    pump: Option<JoinHandle<()>>,
}

impl PeerEntry {
    fn closed() -> Self {
        Self {
            state: NegotiationState::Closed,
            link: None,
            remote_tracks: Vec::new(),
            pump: None,
        }
    }
}

/// Maintains the mesh of point-to-point connections, one per remote
/// participant in the active room.
///
/// The entry table is mutated only here, and only from one relay event at a
/// time (the session event pump dispatches sequentially), so events for a
/// given peer are always processed to completion before the next one.
pub struct PeerMeshManager {
    connector: Arc<dyn PeerConnector>,
    signaling: SignalingClient,
    emitter: EventEmitter,
    peers: Arc<Mutex<HashMap<String, PeerEntry>>>,
}

impl PeerMeshManager {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        signaling: SignalingClient,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            connector,
            signaling,
            emitter,
            peers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.lock().await.keys().cloned().collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn state_of(&self, peer_id: &str) -> Option<NegotiationState> {
        self.peers.lock().await.get(peer_id).map(|e| e.state)
    }

    /// Whether the peer's remote stream is observable (first track arrived).
    pub async fn has_stream(&self, peer_id: &str) -> bool {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .is_some_and(|e| !e.remote_tracks.is_empty())
    }

    pub async fn remote_tracks(&self, peer_id: &str) -> Vec<RemoteTrackInfo> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .map(|e| e.remote_tracks.clone())
            .unwrap_or_default()
    }

    /// A peer joined the room: take the offering side towards it.
    pub async fn handle_peer_joined(&self, peer_id: &str) {
        if self.peers.lock().await.contains_key(peer_id) {
            tracing::debug!("peer {peer_id} already has an entry, ignoring duplicate join");
            return;
        }

        let handle = match self.connector.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                // One peer failing to come up never aborts the others.
                tracing::warn!("peer connection for {peer_id} failed to construct: {e}");
                self.peers
                    .lock()
                    .await
                    .insert(peer_id.to_string(), PeerEntry::closed());
                return;
            }
        };

        let link = handle.link.clone();
        let pump = self.spawn_link_pump(peer_id.to_string(), handle.events);
        self.peers.lock().await.insert(
            peer_id.to_string(),
            PeerEntry {
                state: NegotiationState::Offering,
                link: Some(link.clone()),
                remote_tracks: Vec::new(),
                pump: Some(pump),
            },
        );

        match link.create_offer().await {
            Ok(offer) => {
                self.signaling.send_signal(peer_id, Some(offer), None).await;
                self.set_state(peer_id, NegotiationState::AwaitingAnswer).await;
                tracing::debug!("offer sent to {peer_id}, awaiting answer");
            }
            Err(e) => {
                tracing::warn!("offer for {peer_id} failed: {e}");
                self.close_in_place(peer_id).await;
            }
        }
    }

    /// A negotiation message arrived from `from`.
    pub async fn handle_signal(
        &self,
        from: &str,
        description: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
    ) {
        if let Some(description) = description {
            match description.kind {
                SdpKind::Offer => self.handle_remote_offer(from, description).await,
                SdpKind::Answer => self.handle_remote_answer(from, description).await,
            }
        }

        if let Some(candidate) = candidate {
            let link = self.peers.lock().await.get(from).and_then(|e| e.link.clone());
            match link {
                Some(link) => {
                    if let Err(e) = link.add_candidate(candidate).await {
                        tracing::warn!("candidate from {from} rejected: {e}");
                    }
                }
                // A bare candidate can't start a negotiation; the peer's
                // join or offer was missed and is not replayed.
                None => tracing::debug!("candidate for unknown peer {from}, dropped"),
            }
        }
    }

    /// A peer left the room: close and forget it.
    pub async fn handle_peer_left(&self, peer_id: &str) {
        let Some(entry) = self.peers.lock().await.remove(peer_id) else {
            return;
        };
        if let Some(pump) = entry.pump {
            pump.abort();
        }
        if let Some(link) = entry.link {
            link.close().await;
        }
        if !entry.remote_tracks.is_empty() {
            self.emitter.emit(LifelineEvent::RemoteStreamRemoved {
                peer_id: peer_id.to_string(),
            });
        }
        tracing::debug!("peer {peer_id} left, entry released");
    }

    /// Close every peer and release the capture media. Used on session stop
    /// and on leaving a joined room.
    pub async fn teardown_all(&self) {
        let entries: Vec<(String, PeerEntry)> =
            self.peers.lock().await.drain().collect();

        let mut closings = Vec::new();
        for (peer_id, entry) in entries {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
            if let Some(link) = entry.link {
                closings.push(async move { link.close().await });
            }
            if !entry.remote_tracks.is_empty() {
                self.emitter
                    .emit(LifelineEvent::RemoteStreamRemoved { peer_id });
            }
        }
        join_all(closings).await;
        self.connector.release_media().await;
        tracing::debug!("peer mesh torn down");
    }

    async fn handle_remote_offer(&self, from: &str, description: SessionDescription) {
        if self.peers.lock().await.contains_key(from) {
            tracing::warn!("offer from {from} while already negotiating, ignored");
            return;
        }

        let handle = match self.connector.connect().await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("peer connection for {from} failed to construct: {e}");
                self.peers
                    .lock()
                    .await
                    .insert(from.to_string(), PeerEntry::closed());
                return;
            }
        };

        let link = handle.link.clone();
        let pump = self.spawn_link_pump(from.to_string(), handle.events);
        self.peers.lock().await.insert(
            from.to_string(),
            PeerEntry {
                state: NegotiationState::AnswerPending,
                link: Some(link.clone()),
                remote_tracks: Vec::new(),
                pump: Some(pump),
            },
        );

        let answered: Result<(), LifelineError> = async {
            link.apply_remote_description(description).await?;
            let answer = link.create_answer().await?;
            self.signaling.send_signal(from, Some(answer), None).await;
            Ok(())
        }
        .await;

        match answered {
            Ok(()) => {
                // No further round trip is expected on the answering side.
                self.set_state(from, NegotiationState::Connected).await;
                tracing::debug!("answered {from}, negotiation complete");
            }
            Err(e) => {
                tracing::warn!("answering {from} failed: {e}");
                self.close_in_place(from).await;
            }
        }
    }

    async fn handle_remote_answer(&self, from: &str, description: SessionDescription) {
        let link = {
            let peers = self.peers.lock().await;
            match peers.get(from) {
                Some(entry) if entry.state == NegotiationState::AwaitingAnswer => {
                    entry.link.clone()
                }
                Some(entry) => {
                    tracing::warn!(
                        "answer from {from} in state {:?}, ignored",
                        entry.state
                    );
                    return;
                }
                None => {
                    tracing::warn!("answer from unknown peer {from}, ignored");
                    return;
                }
            }
        };
        let Some(link) = link else { return };

        match link.apply_remote_description(description).await {
            Ok(()) => {
                self.set_state(from, NegotiationState::Connected).await;
                tracing::debug!("peer {from} connected");
            }
            Err(e) => {
                tracing::warn!("applying answer from {from} failed: {e}");
                self.close_in_place(from).await;
            }
        }
    }

    /// Mark a peer dead after a negotiation failure, keeping the entry until
    /// its peer-left event so the table still mirrors room membership.
    async fn close_in_place(&self, peer_id: &str) {
        let link = {
            let mut peers = self.peers.lock().await;
            let Some(entry) = peers.get_mut(peer_id) else { return };
            entry.state = NegotiationState::Closed;
            entry.link.take()
        };
        if let Some(link) = link {
            link.close().await;
        }
    }

    async fn set_state(&self, peer_id: &str, state: NegotiationState) {
        if let Some(entry) = self.peers.lock().await.get_mut(peer_id) {
            entry.state = state;
        }
    }

    fn spawn_link_pump(
        &self,
        peer_id: String,
        mut events: mpsc::UnboundedReceiver<PeerLinkEvent>,
    ) -> JoinHandle<()> {
        let signaling = self.signaling.clone();
        let peers = self.peers.clone();
        let emitter = self.emitter.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerLinkEvent::LocalCandidate(candidate) => {
                        signaling.send_signal(&peer_id, None, Some(candidate)).await;
                    }
                    PeerLinkEvent::TrackAdded(track) => {
                        let first = {
                            let mut peers = peers.lock().await;
                            let Some(entry) = peers.get_mut(&peer_id) else {
                                continue;
                            };
                            // Repeated track events are no-ops.
                            if entry.remote_tracks.iter().any(|t| t.id == track.id) {
                                continue;
                            }
                            let first = entry.remote_tracks.is_empty();
                            entry.remote_tracks.push(track);
                            first
                        };
                        if first {
                            emitter.emit(LifelineEvent::RemoteStreamAdded {
                                peer_id: peer_id.clone(),
                            });
                        }
                    }
                    PeerLinkEvent::Closed => {
                        if let Some(entry) = peers.lock().await.get_mut(&peer_id) {
                            entry.state = NegotiationState::Closed;
                        }
                    }
                }
            }
        })
    }
}

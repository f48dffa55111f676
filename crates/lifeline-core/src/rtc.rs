use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::errors::LifelineError;
use crate::mesh::{PeerConnector, PeerHandle, PeerLink, PeerLinkEvent, RemoteTrackInfo, TrackKind};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// `PeerConnector` backed by the `webrtc` crate.
///
/// Local capture tracks are provided by the platform shell (which owns the
/// devices) and are reference-held here for the whole session: attached to
/// every peer connection handed out, dropped once by `release_media`. With
/// no tracks provided the connection still negotiates, carrying no media.
pub struct RtcConnector {
    ice_servers: Vec<String>,
    local_tracks: Mutex<Option<Vec<Arc<dyn TrackLocal + Send + Sync>>>>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            local_tracks: Mutex::new(None),
        }
    }

    pub fn with_default_servers() -> Self {
        Self::new(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }

    /// Hand over the session's capture tracks. Called once per session by
    /// the shell, before or after the first peer shows up.
    pub async fn provide_local_tracks(&self, tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>) {
        *self.local_tracks.lock().await = Some(tracks);
    }

    fn config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self) -> Result<PeerHandle, LifelineError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(self.config())
                .await
                .map_err(|e| LifelineError::Negotiation(format!("peer connection: {e}")))?,
        );

        let (tx, rx) = mpsc::unbounded_channel();

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End-of-gathering marker.
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerLinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("local candidate not serializable: {e}"),
                }
            })
        }));

        let track_tx = tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    _ => TrackKind::Video,
                };
                let _ = tx.send(PeerLinkEvent::TrackAdded(RemoteTrackInfo {
                    id: track.id(),
                    kind,
                }));
            })
        }));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!("peer connection state: {state:?}");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = state_tx.send(PeerLinkEvent::Closed);
            }
            Box::pin(async {})
        }));

        match self.local_tracks.lock().await.as_ref() {
            Some(tracks) if !tracks.is_empty() => {
                for track in tracks {
                    // A track the connection refuses must not block the
                    // exchange; the peer carries whatever media made it on.
                    if let Err(e) = pc.add_track(track.clone()).await {
                        tracing::warn!("local track not attached: {e}");
                    }
                }
            }
            _ => tracing::debug!("no local media, negotiating data-only"),
        }

        Ok(PeerHandle {
            link: Arc::new(RtcLink { pc }),
            events: rx,
        })
    }

    async fn release_media(&self) {
        if self.local_tracks.lock().await.take().is_some() {
            tracing::debug!("local capture tracks released");
        }
    }
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
}

impl RtcLink {
    fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, LifelineError> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| LifelineError::Negotiation(format!("bad description: {e}")))
    }
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<SessionDescription, LifelineError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| LifelineError::Negotiation(format!("create offer: {e}")))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| LifelineError::Negotiation(format!("set local offer: {e}")))?;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, LifelineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| LifelineError::Negotiation(format!("create answer: {e}")))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| LifelineError::Negotiation(format!("set local answer: {e}")))?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LifelineError> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| LifelineError::Negotiation(format!("set remote description: {e}")))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LifelineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| LifelineError::Negotiation(format!("add candidate: {e}")))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("error closing peer connection: {e}");
        }
    }
}

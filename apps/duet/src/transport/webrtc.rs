//! Peer transport over the `webrtc` crate.
//!
//! SDP and candidates cross the store as the same JSON shapes a browser
//! peer produces (`{"type": ..., "sdp": ...}` descriptions and candidate
//! init objects), so either end of a call can be served by either stack.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{LinkState, PeerConnector, PeerTransport, SignalingState, TransportError};
use crate::media::{LocalMedia, MediaTrack, TrackKind};

const MEDIA_STREAM_ID: &str = "duet";

#[derive(Debug, Clone)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

fn to_setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    candidates: AsyncMutex<Option<mpsc::UnboundedReceiver<String>>>,
    link_rx: watch::Receiver<LinkState>,
    video_sender: AsyncMutex<Option<Arc<RTCRtpSender>>>,
    outgoing: AsyncMutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcPeer {
    pub async fn connect(config: &WebRtcConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(to_setup_error)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(to_setup_error)?,
        );

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel::<String>();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => match serde_json::to_string(&init) {
                        Ok(json) => {
                            let _ = tx.send(json);
                        }
                        Err(err) => {
                            tracing::warn!(target = "duet::transport", error = %err, "failed to encode candidate");
                        }
                    },
                    Err(err) => {
                        tracing::warn!(target = "duet::transport", error = %err, "failed to serialize candidate");
                    }
                }
            })
        }));

        let (link_tx, link_rx) = watch::channel(LinkState::New);
        let link_tx = Arc::new(link_tx);
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let link_tx = Arc::clone(&link_tx);
            Box::pin(async move {
                let mapped = match state {
                    RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                        LinkState::New
                    }
                    RTCPeerConnectionState::Connecting => LinkState::Connecting,
                    RTCPeerConnectionState::Connected => LinkState::Connected,
                    RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
                    RTCPeerConnectionState::Failed => LinkState::Failed,
                    RTCPeerConnectionState::Closed => LinkState::Closed,
                };
                tracing::debug!(target = "duet::transport", state = ?mapped, "peer connection state changed");
                let _ = link_tx.send(mapped);
            })
        }));

        Ok(Self {
            pc,
            candidates: AsyncMutex::new(Some(candidate_rx)),
            link_rx,
            video_sender: AsyncMutex::new(None),
            outgoing: AsyncMutex::new(HashMap::new()),
        })
    }

    fn sample_track(track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        let (mime, label) = match track.kind() {
            TrackKind::Audio => (MIME_TYPE_OPUS, "audio"),
            TrackKind::Video => (MIME_TYPE_VP8, "video"),
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime.to_owned(),
                ..Default::default()
            },
            label.to_owned(),
            MEDIA_STREAM_ID.to_owned(),
        ))
    }

    fn parse_description(sdp: &str) -> Result<RTCSessionDescription, TransportError> {
        serde_json::from_str::<RTCSessionDescription>(sdp)
            .map_err(|err| TransportError::Description(format!("invalid session description: {err}")))
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), TransportError> {
        let mut outgoing = self.outgoing.lock().await;
        for track in media.tracks() {
            let local = Self::sample_track(track);
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(to_setup_error)?;
            if track.kind() == TrackKind::Video {
                *self.video_sender.lock().await = Some(sender);
            }
            outgoing.insert(track.id().to_string(), local);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        serde_json::to_string(&offer)
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))?;
        serde_json::to_string(&answer)
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), TransportError> {
        let description = Self::parse_description(sdp)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError> {
        let description = Self::parse_description(sdp)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| TransportError::Description(err.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), TransportError> {
        let init = serde_json::from_str::<RTCIceCandidateInit>(candidate)
            .map_err(|err| TransportError::Candidate(format!("invalid candidate: {err}")))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError> {
        let sender = self
            .video_sender
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NoVideoSender)?;
        let local = Self::sample_track(track);
        sender
            .replace_track(Some(
                Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>
            ))
            .await
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let mut outgoing = self.outgoing.lock().await;
        outgoing.retain(|_, existing| existing.kind() != local.kind());
        outgoing.insert(track.id().to_string(), local);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }

    async fn take_candidates(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        self.candidates
            .lock()
            .await
            .take()
            .ok_or_else(|| TransportError::Setup("candidate stream already taken".into()))
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "duet::transport", error = %err, "peer connection close failed");
        }
    }
}

/// Builds one fresh peer connection per call attempt.
pub struct WebRtcConnector {
    config: WebRtcConfig,
}

impl WebRtcConnector {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self) -> Result<Arc<dyn PeerTransport>, TransportError> {
        Ok(Arc::new(WebRtcPeer::connect(&self.config).await?))
    }
}

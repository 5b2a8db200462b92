//! Peer transport boundary.
//!
//! The negotiation engine only ever sees this trait: an offer/answer/ICE
//! capability with a candidate stream and a connection-state watch. The
//! production implementation lives in [`webrtc`]; tests drive the engine
//! with in-process fakes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::media::{LocalMedia, MediaTrack};

pub mod webrtc;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("description error: {0}")]
    Description(String),
    #[error("candidate error: {0}")]
    Candidate(String),
    #[error("no video sender to replace")]
    NoVideoSender,
    #[error("transport closed")]
    Closed,
}

/// Connection lifecycle as reported by the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_broken(self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

/// Where the offer/answer dance currently stands. The caller uses this to
/// guard against re-applying an answer to an already stable connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Capability object over the host platform's peer connection. SDP and
/// candidates cross this boundary as the JSON strings the session store
/// carries; the trait owner decides what they mean.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach the local tracks that will be offered to the remote side.
    /// Must happen before `create_offer`/`create_answer` so the generated
    /// description covers them.
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<String, TransportError>;

    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), TransportError>;

    async fn set_remote_description(&self, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), TransportError>;

    /// Swap the outgoing video track in place. No renegotiation; the
    /// connection object and the audio track are untouched.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<(), TransportError>;

    fn signaling_state(&self) -> SignalingState;

    /// Locally gathered candidates, in gathering order. May only be taken
    /// once; the engine owns the stream for the life of the call.
    async fn take_candidates(&self)
    -> Result<mpsc::UnboundedReceiver<String>, TransportError>;

    /// Watchable connection state, updated by the transport's own
    /// callbacks rather than polling.
    fn link_state(&self) -> watch::Receiver<LinkState>;

    async fn close(&self);
}

/// Factory seam so the call manager can be handed fakes in tests.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn PeerTransport>, TransportError>;
}

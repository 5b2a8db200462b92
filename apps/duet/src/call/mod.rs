//! Call core: state machine, negotiation engine, and orchestration.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::media::MediaError;
use crate::store::{CallSession, StoreError};
use crate::transport::TransportError;

pub mod engine;
pub mod manager;
pub mod state;

pub use engine::NegotiationEngine;
pub use manager::CallManager;
pub use state::{CallState, HandledSessions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Receiver,
}

/// Why a call stopped. Every teardown path carries exactly one of these to
/// the notice consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// Local hangup of an active call.
    HungUp,
    /// Local cancel of a not-yet-answered outgoing call.
    Canceled,
    /// Local decline of an incoming call.
    Declined,
    /// Remote wrote `declined`.
    RemoteDeclined,
    /// Remote wrote `ended`.
    RemoteEnded,
    /// The transport reported failed/disconnected.
    Failed,
    /// Local media acquisition was refused.
    PermissionDenied,
    /// A fatal store RPC (create/offer/answer) failed.
    SignalingFailed,
}

impl EndReason {
    /// Remote-driven ends are normal call endings, not local errors.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EndReason::Failed | EndReason::PermissionDenied | EndReason::SignalingFailed
        )
    }
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("signaling failure: {0}")]
    Signaling(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("another call is already in progress")]
    Busy,
    #[error("no call in progress")]
    NoCall,
    #[error("call state does not allow {0}")]
    InvalidState(&'static str),
}

/// User-visible call signal. No process-wide notification registry:
/// each component that can fail holds a sender and one consumer owns
/// presentation.
#[derive(Debug, Clone)]
pub enum Notice {
    /// A session addressed to the local user is ringing.
    Incoming(CallSession),
    /// The call reached a connected transport.
    Connected { session_id: String },
    /// The call stopped; `reason.is_failure()` decides error styling. The
    /// session id is absent only when creation itself failed.
    Ended {
        session_id: Option<String>,
        reason: EndReason,
    },
}

pub type NoticeSender = mpsc::UnboundedSender<Notice>;
pub type NoticeReceiver = mpsc::UnboundedReceiver<Notice>;

pub fn notice_channel() -> (NoticeSender, NoticeReceiver) {
    mpsc::unbounded_channel()
}

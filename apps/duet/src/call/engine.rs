//! Negotiation engine.
//!
//! Owns the offer/answer sequencing and candidate trickling for one call,
//! in either role. Sequencing rules enforced here:
//! local candidates are published only after the local description exists
//! (the pump starts then), remote candidates are applied only after the
//! remote description (buffered otherwise), the answer is applied at most
//! once, and no candidate fingerprint is published twice.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;

use super::{CallError, CallRole};
use crate::store::{CallStatus, CallStore};
use crate::transport::{PeerTransport, SignalingState};

pub struct NegotiationEngine {
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn CallStore>,
    session_id: String,
    role: CallRole,
    /// Fingerprints of locally gathered candidates already published.
    sent: Mutex<HashSet<String>>,
    /// Remote candidates already applied to the transport.
    applied: Mutex<HashSet<String>>,
    /// Remote candidates observed before the remote description; flushed
    /// right after it is applied.
    pending_remote: Mutex<Vec<String>>,
    remote_described: AtomicBool,
    /// Shared cancellation flag; once set, late continuations drop their
    /// work instead of acting on a dead call.
    ended: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationEngine {
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        store: Arc<dyn CallStore>,
        session_id: impl Into<String>,
        role: CallRole,
        ended: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            store,
            session_id: session_id.into(),
            role,
            sent: Mutex::new(HashSet::new()),
            applied: Mutex::new(HashSet::new()),
            pending_remote: Mutex::new(Vec::new()),
            remote_described: AtomicBool::new(false),
            ended,
            pump: Mutex::new(None),
        }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    /// Caller role: generate the offer, apply it locally, publish it.
    /// Store failure here is fatal to the call attempt.
    pub async fn publish_offer(self: &Arc<Self>) -> Result<(), CallError> {
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        self.store.set_offer(&self.session_id, &offer).await?;
        tracing::debug!(target = "duet::engine", session_id = %self.session_id, "offer published");
        self.start_candidate_pump().await?;
        Ok(())
    }

    /// Caller role: apply the remote answer exactly once. Returns false
    /// when the connection no longer holds the local offer (the answer was
    /// already applied) so pollers can observe the same record repeatedly
    /// without corrupting negotiation.
    pub async fn apply_answer(&self, sdp: &str) -> Result<bool, CallError> {
        if self.transport.signaling_state() != SignalingState::HaveLocalOffer {
            tracing::debug!(target = "duet::engine", session_id = %self.session_id, "answer already applied, skipping");
            return Ok(false);
        }
        self.transport.set_remote_description(sdp).await?;
        self.remote_described.store(true, Ordering::SeqCst);
        self.flush_pending_remote().await;
        Ok(true)
    }

    /// Receiver role: apply the offer, produce and publish the answer,
    /// then mark the session active. Mirrors the caller in reverse; store
    /// failures on answer/status are fatal to the attempt.
    pub async fn accept_offer(self: &Arc<Self>, offer_sdp: &str) -> Result<(), CallError> {
        self.transport.set_remote_description(offer_sdp).await?;
        self.remote_described.store(true, Ordering::SeqCst);
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        self.store.set_answer(&self.session_id, &answer).await?;
        self.start_candidate_pump().await?;
        self.store
            .update_call_status(&self.session_id, CallStatus::Active)
            .await?;
        tracing::debug!(target = "duet::engine", session_id = %self.session_id, "answer published, session active");
        Ok(())
    }

    /// Apply remote candidates, once each. Individual failures are logged
    /// and skipped; ICE gathering produces redundant candidates so a lost
    /// one needs no retry.
    pub async fn apply_remote_candidates(&self, candidates: &[String]) {
        if !self.remote_described.load(Ordering::SeqCst) {
            self.pending_remote
                .lock()
                .extend(candidates.iter().cloned());
            return;
        }
        for candidate in candidates {
            if !self.applied.lock().insert(candidate.clone()) {
                continue;
            }
            if let Err(err) = self.transport.add_remote_candidate(candidate).await {
                tracing::warn!(
                    target = "duet::engine",
                    session_id = %self.session_id,
                    error = %err,
                    "failed to apply remote candidate"
                );
            }
        }
    }

    async fn flush_pending_remote(&self) {
        let pending = std::mem::take(&mut *self.pending_remote.lock());
        if !pending.is_empty() {
            self.apply_remote_candidates(&pending).await;
        }
    }

    /// Publish locally gathered candidates as they trickle in. Started
    /// only after a local description exists, per negotiation ordering.
    /// Publish errors are non-fatal. Duplicate fingerprints are dropped
    /// before they reach the store.
    async fn start_candidate_pump(self: &Arc<Self>) -> Result<(), CallError> {
        let mut candidates = self.transport.take_candidates().await?;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(candidate) = candidates.recv().await {
                if engine.ended.load(Ordering::SeqCst) {
                    break;
                }
                if !engine.sent.lock().insert(candidate.clone()) {
                    continue;
                }
                let is_caller = engine.role == CallRole::Caller;
                if let Err(err) = engine
                    .store
                    .add_ice_candidate(&engine.session_id, &candidate, is_caller)
                    .await
                {
                    tracing::warn!(
                        target = "duet::engine",
                        session_id = %engine.session_id,
                        error = %err,
                        "candidate publish failed, relying on redundancy"
                    );
                }
            }
        });
        *self.pump.lock() = Some(handle);
        Ok(())
    }

    /// Stop background work and close the transport. Idempotent.
    pub async fn shutdown(&self) {
        self.ended.store(true, Ordering::SeqCst);
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.transport.close().await;
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

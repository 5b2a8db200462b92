//! Call orchestration.
//!
//! Ties the state machine, negotiation engine, synchronizer, and media
//! adapter together around one rule: at most one call session is engaged
//! locally, and its connection and tracks are owned by exactly one
//! `ActiveCall`. Every teardown path funnels through [`teardown`], which
//! is idempotent via the state machine's first-terminate-wins rule.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::state::{CallState, CallStateMachine, HandledSessions};
use super::{CallError, CallRole, EndReason, NegotiationEngine, Notice, NoticeSender};
use crate::media::{CameraFacing, LocalMedia, MediaCapture, MediaConstraints, MediaError};
use crate::store::{CallHistory, CallStatus, CallStore, CallType};
use crate::sync::{IncomingWatcher, SessionWatcher, SyncEvent};
use crate::transport::{LinkState, PeerConnector};

/// Timers for the two poll cadences: slow discovery of incoming calls,
/// faster watching of the engaged session.
#[derive(Debug, Clone, Copy)]
pub struct PollIntervals {
    pub discovery: Duration,
    pub engaged: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            discovery: Duration::from_secs(2),
            engaged: Duration::from_secs(1),
        }
    }
}

/// State shared between the manager's API surface and the per-call event
/// loop task.
struct CallShared {
    machine: parking_lot::Mutex<CallStateMachine>,
    engine: Arc<NegotiationEngine>,
    media: AsyncMutex<LocalMedia>,
    ended: Arc<AtomicBool>,
    store: Arc<dyn CallStore>,
    notices: NoticeSender,
    role: CallRole,
}

struct ActiveCall {
    shared: Arc<CallShared>,
    _watcher: SessionWatcher,
    events: JoinHandle<()>,
}

impl ActiveCall {
    fn is_live(&self) -> bool {
        !self.shared.machine.lock().is_terminated()
    }
}

impl Drop for ActiveCall {
    fn drop(&mut self) {
        self.events.abort();
    }
}

pub struct CallManager {
    store: Arc<dyn CallStore>,
    connector: Arc<dyn PeerConnector>,
    capture: Arc<dyn MediaCapture>,
    notices: NoticeSender,
    local_user_id: String,
    intervals: PollIntervals,
    handled: HandledSessions,
    active: AsyncMutex<Option<ActiveCall>>,
    discovery: parking_lot::Mutex<Option<(IncomingWatcher, JoinHandle<()>)>>,
}

impl CallManager {
    pub fn new(
        store: Arc<dyn CallStore>,
        connector: Arc<dyn PeerConnector>,
        capture: Arc<dyn MediaCapture>,
        local_user_id: impl Into<String>,
        notices: NoticeSender,
        intervals: PollIntervals,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            connector,
            capture,
            notices,
            local_user_id: local_user_id.into(),
            intervals,
            handled: HandledSessions::new(),
            active: AsyncMutex::new(None),
            discovery: parking_lot::Mutex::new(None),
        })
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Start polling for calls addressed to the local user. Ringing
    /// sessions surface as [`Notice::Incoming`]; the consumer answers
    /// with [`CallManager::accept`] or [`CallManager::decline`].
    pub fn start_discovery(self: &Arc<Self>) {
        let mut slot = self.discovery.lock();
        if slot.is_some() {
            return;
        }
        let (watcher, mut rx) = IncomingWatcher::spawn(
            Arc::clone(&self.store),
            self.local_user_id.clone(),
            self.intervals.discovery,
        );
        let manager = Arc::clone(self);
        let forwarder = tokio::spawn(async move {
            // Which ringing session the consumer has already been told
            // about. Cleared when a ring is dropped for a busy line, so
            // the still-ringing session is offered again once idle.
            let mut surfaced: Option<String> = None;
            while let Some(session) = rx.recv().await {
                if manager.handled.is_marked(&session.id) {
                    continue;
                }
                if manager.is_engaged().await {
                    tracing::debug!(target = "duet::call", session_id = %session.id, "holding ring while engaged");
                    surfaced = None;
                    continue;
                }
                if surfaced.as_deref() == Some(session.id.as_str()) {
                    continue;
                }
                surfaced = Some(session.id.clone());
                let _ = manager.notices.send(Notice::Incoming(session));
            }
        });
        *slot = Some((watcher, forwarder));
    }

    pub fn stop_discovery(&self) {
        if let Some((watcher, forwarder)) = self.discovery.lock().take() {
            watcher.stop();
            forwarder.abort();
        }
    }

    pub async fn is_engaged(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|call| call.is_live())
            .unwrap_or(false)
    }

    pub async fn current_state(&self) -> Option<CallState> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|call| call.shared.machine.lock().state())
    }

    pub async fn duration_secs(&self) -> Option<u64> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|call| call.shared.machine.lock().duration_secs())
    }

    /// Place a call: create the session record, acquire media, publish the
    /// offer, and start watching for the answer.
    pub async fn start_call(
        self: &Arc<Self>,
        receiver_id: &str,
        call_type: CallType,
    ) -> Result<String, CallError> {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|c| c.is_live()).unwrap_or(false) {
            return Err(CallError::Busy);
        }

        let session = match self.store.create_call_session(receiver_id, call_type).await {
            Ok(session) => session,
            Err(err) => {
                let _ = self.notices.send(Notice::Ended {
                    session_id: None,
                    reason: EndReason::SignalingFailed,
                });
                return Err(err.into());
            }
        };
        let session_id = session.id.clone();
        self.handled.mark(&session_id);

        let media = match LocalMedia::acquire(
            Arc::clone(&self.capture),
            constraints_for(call_type),
        )
        .await
        {
            Ok(media) => media,
            Err(err) => {
                let reason = reason_for_media(&err);
                let _ = self.notices.send(Notice::Ended {
                    session_id: Some(session_id),
                    reason,
                });
                return Err(err.into());
            }
        };

        let call = self
            .engage(session_id.clone(), call_type, CallRole::Caller, media, None)
            .await?;
        *active = Some(call);
        Ok(session_id)
    }

    /// Accept a ringing incoming call.
    pub async fn accept(self: &Arc<Self>, session_id: &str) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        if active.as_ref().map(|c| c.is_live()).unwrap_or(false) {
            return Err(CallError::Busy);
        }
        // Mark before any await so a second observation of the same ring
        // cannot double-accept.
        if !self.handled.mark(session_id) {
            return Err(CallError::InvalidState("accept"));
        }

        let session = match self.store.get_call_session(session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.handled.unmark(session_id);
                return Err(CallError::InvalidState("accept"));
            }
            Err(err) => {
                self.handled.unmark(session_id);
                return Err(err.into());
            }
        };
        // A session the caller already tore down must never grow a
        // connection on this side.
        let offer = match session.offer_sdp.clone() {
            Some(offer)
                if session.status == CallStatus::Calling
                    && session.receiver_id == self.local_user_id =>
            {
                offer
            }
            _ => {
                self.handled.unmark(session_id);
                return Err(CallError::InvalidState("accept"));
            }
        };

        let media = match LocalMedia::acquire(
            Arc::clone(&self.capture),
            constraints_for(session.call_type),
        )
        .await
        {
            Ok(media) => media,
            Err(err) => {
                // Receiver cannot ring forever without media: auto-decline.
                if let Err(status_err) = self
                    .store
                    .update_call_status(session_id, CallStatus::Declined)
                    .await
                {
                    tracing::warn!(target = "duet::call", session_id, error = %status_err, "auto-decline write failed");
                }
                let _ = self.notices.send(Notice::Ended {
                    session_id: Some(session_id.to_string()),
                    reason: reason_for_media(&err),
                });
                return Err(err.into());
            }
        };

        let call = self
            .engage(
                session_id.to_string(),
                session.call_type,
                CallRole::Receiver,
                media,
                Some((offer, session.caller_ice.clone())),
            )
            .await?;
        *active = Some(call);
        Ok(())
    }

    /// Decline a ringing incoming call without engaging media.
    pub async fn decline(&self, session_id: &str) -> Result<(), CallError> {
        self.handled.mark(session_id);
        self.store
            .update_call_status(session_id, CallStatus::Declined)
            .await?;
        let _ = self.notices.send(Notice::Ended {
            session_id: Some(session_id.to_string()),
            reason: EndReason::Declined,
        });
        Ok(())
    }

    /// End the engaged call: hangup when active, cancel when still
    /// outgoing.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let call = active.as_ref().ok_or(CallError::NoCall)?;
        let reason = match call.shared.machine.lock().state() {
            CallState::Active => EndReason::HungUp,
            CallState::Outgoing | CallState::Incoming => EndReason::Canceled,
            _ => return Err(CallError::NoCall),
        };
        teardown(&call.shared, reason, Some(CallStatus::Ended)).await;
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let call = live(&active)?;
        call.shared.media.lock().await.set_muted(muted);
        Ok(())
    }

    pub async fn is_muted(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = live(&active)?;
        let muted = call.shared.media.lock().await.is_muted();
        Ok(muted)
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let active = self.active.lock().await;
        let call = live(&active)?;
        call.shared.media.lock().await.set_video_enabled(enabled)?;
        Ok(())
    }

    pub async fn is_video_enabled(&self) -> Result<bool, CallError> {
        let active = self.active.lock().await;
        let call = live(&active)?;
        let enabled = call.shared.media.lock().await.is_video_enabled();
        Ok(enabled)
    }

    /// Swap to the opposite-facing camera on the live connection. Video
    /// calls only; no renegotiation happens.
    pub async fn switch_camera(&self) -> Result<CameraFacing, CallError> {
        let active = self.active.lock().await;
        let call = live(&active)?;
        let transport = Arc::clone(call.shared.engine.transport());
        let mut media = call.shared.media.lock().await;
        Ok(media.switch_camera(transport.as_ref()).await?)
    }

    pub async fn call_history(&self) -> Result<Vec<CallHistory>, CallError> {
        Ok(self.store.get_call_history().await?)
    }

    /// Build the engine + watcher + event loop for one engaged session.
    /// `receiver_start` carries the offer and pre-existing caller
    /// candidates when engaging in receiver role.
    async fn engage(
        self: &Arc<Self>,
        session_id: String,
        call_type: CallType,
        role: CallRole,
        media: LocalMedia,
        receiver_start: Option<(String, Vec<String>)>,
    ) -> Result<ActiveCall, CallError> {
        let ended = Arc::new(AtomicBool::new(false));
        let transport = match self.connector.connect().await {
            Ok(transport) => transport,
            Err(err) => {
                let _ = self.notices.send(Notice::Ended {
                    session_id: Some(session_id),
                    reason: EndReason::Failed,
                });
                return Err(err.into());
            }
        };
        if let Err(err) = transport.attach_media(&media).await {
            transport.close().await;
            let _ = self.notices.send(Notice::Ended {
                session_id: Some(session_id),
                reason: EndReason::Failed,
            });
            return Err(err.into());
        }

        let engine = Arc::new(NegotiationEngine::new(
            Arc::clone(&transport),
            Arc::clone(&self.store),
            session_id.clone(),
            role,
            Arc::clone(&ended),
        ));

        let machine = match role {
            CallRole::Caller => CallStateMachine::outgoing(session_id.clone(), call_type),
            CallRole::Receiver => CallStateMachine::incoming(session_id.clone(), call_type),
        };
        let shared = Arc::new(CallShared {
            machine: parking_lot::Mutex::new(machine),
            engine: Arc::clone(&engine),
            media: AsyncMutex::new(media),
            ended,
            store: Arc::clone(&self.store),
            notices: self.notices.clone(),
            role,
        });

        let start = match role {
            CallRole::Caller => engine.publish_offer().await,
            CallRole::Receiver => match receiver_start {
                Some((offer, caller_ice)) => {
                    let outcome = engine.accept_offer(&offer).await;
                    if outcome.is_ok() {
                        engine.apply_remote_candidates(&caller_ice).await;
                    }
                    outcome
                }
                None => Err(CallError::InvalidState("receiver call is missing the offer")),
            },
        };
        if let Err(err) = start {
            teardown(&shared, EndReason::SignalingFailed, None).await;
            return Err(err);
        }

        // Receiver goes active the moment its answer is published.
        if role == CallRole::Receiver {
            shared.machine.lock().connect()?;
            let _ = self.notices.send(Notice::Connected {
                session_id: session_id.clone(),
            });
        }

        let (watcher, events_rx) = SessionWatcher::spawn(
            Arc::clone(&self.store),
            session_id,
            role == CallRole::Caller,
            self.intervals.engaged,
        );
        let events = tokio::spawn(run_call_events(Arc::clone(&shared), events_rx));

        Ok(ActiveCall {
            shared,
            _watcher: watcher,
            events,
        })
    }
}

fn live<'a>(
    active: &'a tokio::sync::MutexGuard<'_, Option<ActiveCall>>,
) -> Result<&'a ActiveCall, CallError> {
    active
        .as_ref()
        .filter(|call| call.is_live())
        .ok_or(CallError::NoCall)
}

fn constraints_for(call_type: CallType) -> MediaConstraints {
    if call_type.wants_video() {
        MediaConstraints::video(CameraFacing::Front)
    } else {
        MediaConstraints::voice()
    }
}

fn reason_for_media(err: &MediaError) -> EndReason {
    match err {
        MediaError::PermissionDenied => EndReason::PermissionDenied,
        _ => EndReason::Failed,
    }
}

/// Per-call event loop: feeds synchronizer events into the engine and the
/// transport's connection state into the state machine. Exits when either
/// stream closes or the call terminates.
async fn run_call_events(
    shared: Arc<CallShared>,
    mut events: tokio::sync::mpsc::UnboundedReceiver<SyncEvent>,
) {
    let mut link = shared.engine.transport().link_state();
    let mut was_connected = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if shared.ended.load(Ordering::SeqCst) {
                    continue;
                }
                handle_sync_event(&shared, event).await;
            }
            changed = link.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *link.borrow_and_update();
                if shared.ended.load(Ordering::SeqCst) {
                    continue;
                }
                match state {
                    LinkState::Connected => {
                        was_connected = true;
                        let newly_active = {
                            let mut machine = shared.machine.lock();
                            !matches!(machine.state(), CallState::Active)
                                && machine.connect().is_ok()
                        };
                        if newly_active {
                            let _ = shared.notices.send(Notice::Connected {
                                session_id: shared.engine.session_id().to_string(),
                            });
                        }
                    }
                    state if state.is_broken() => {
                        tracing::warn!(
                            target = "duet::call",
                            session_id = %shared.engine.session_id(),
                            ?state,
                            was_connected,
                            "transport reported broken link"
                        );
                        teardown(&shared, EndReason::Failed, None).await;
                    }
                    _ => {}
                }
            }
        }
        if shared.machine.lock().is_terminated() {
            break;
        }
    }
}

async fn handle_sync_event(shared: &Arc<CallShared>, event: SyncEvent) {
    match event {
        // The caller's own offer echoing back; nothing to do.
        SyncEvent::OfferAppeared(_) => {}
        SyncEvent::AnswerAppeared(sdp) => {
            if shared.role == CallRole::Caller {
                if let Err(err) = shared.engine.apply_answer(&sdp).await {
                    tracing::warn!(
                        target = "duet::call",
                        session_id = %shared.engine.session_id(),
                        error = %err,
                        "failed to apply answer"
                    );
                    teardown(shared, EndReason::Failed, None).await;
                }
            }
        }
        SyncEvent::RemoteCandidates(candidates) => {
            shared.engine.apply_remote_candidates(&candidates).await;
        }
        SyncEvent::StatusChanged(status) => match status {
            CallStatus::Declined => {
                teardown(shared, EndReason::RemoteDeclined, None).await;
            }
            CallStatus::Ended => {
                teardown(shared, EndReason::RemoteEnded, None).await;
            }
            CallStatus::Active => {
                // The receiver answered. The caller's own Active state
                // still waits for the transport's connected callback; the
                // confirming status write is best-effort.
                if shared.role == CallRole::Caller {
                    if let Err(err) = shared
                        .store
                        .update_call_status(shared.engine.session_id(), CallStatus::Active)
                        .await
                    {
                        tracing::debug!(
                            target = "duet::call",
                            session_id = %shared.engine.session_id(),
                            error = %err,
                            "active confirmation write failed"
                        );
                    }
                }
            }
            CallStatus::Calling => {}
        },
    }
}

/// The single teardown path. First trigger wins: later calls find the
/// machine already terminal and return without re-running teardown. The
/// `ended` flag makes in-flight continuations drop late signaling events.
async fn teardown(shared: &Arc<CallShared>, reason: EndReason, write: Option<CallStatus>) {
    if !shared.machine.lock().terminate(reason) {
        return;
    }
    shared.ended.store(true, Ordering::SeqCst);

    if let Some(status) = write {
        if let Err(err) = shared
            .store
            .update_call_status(shared.engine.session_id(), status)
            .await
        {
            tracing::warn!(
                target = "duet::call",
                session_id = %shared.engine.session_id(),
                error = %err,
                "terminal status write failed"
            );
        }
    }

    shared.media.lock().await.release();
    shared.engine.shutdown().await;
    let _ = shared.notices.send(Notice::Ended {
        session_id: Some(shared.engine.session_id().to_string()),
        reason,
    });
}

impl Drop for CallManager {
    fn drop(&mut self) {
        if let Some((watcher, forwarder)) = self.discovery.lock().take() {
            watcher.stop();
            forwarder.abort();
        }
    }
}

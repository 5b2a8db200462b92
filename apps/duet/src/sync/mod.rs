//! Signaling synchronizer.
//!
//! No push channel exists; the only signal is the polled session record.
//! Each watcher is one cancellable task that fetches on a fixed interval,
//! diffs against the last-seen snapshot, and emits discrete events for the
//! fields that changed, so consumers never reprocess stable state. A
//! watcher stops itself once it observes a terminal status, and aborts its
//! task on drop so no orphaned polling survives a torn-down call.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::{CallSession, CallStatus, CallStore};

/// Change observed on a watched session since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    OfferAppeared(String),
    AnswerAppeared(String),
    /// Newly appended candidates from the remote side's sequence, in
    /// store order.
    RemoteCandidates(Vec<String>),
    StatusChanged(CallStatus),
}

/// Watches one engaged session. `local_is_caller` decides which ICE
/// sequence counts as remote.
pub struct SessionWatcher {
    handle: JoinHandle<()>,
}

impl SessionWatcher {
    pub fn spawn(
        store: Arc<dyn CallStore>,
        session_id: String,
        local_is_caller: bool,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut last_offer = false;
            let mut last_answer = false;
            let mut last_remote_ice = 0usize;
            // Sessions are born in `calling`; only an advance past that is
            // a change worth reporting.
            let mut last_status = Some(CallStatus::Calling);

            loop {
                ticker.tick().await;
                // Consumer gone means the call was torn down locally; stop
                // polling even if the record never changes again.
                if tx.is_closed() {
                    break;
                }
                let session = match store.get_call_session(&session_id).await {
                    Ok(Some(session)) => session,
                    Ok(None) => {
                        tracing::debug!(target = "duet::sync", session_id = %session_id, "session not found yet");
                        continue;
                    }
                    Err(err) => {
                        tracing::warn!(target = "duet::sync", session_id = %session_id, error = %err, "session poll failed");
                        continue;
                    }
                };

                if !last_offer {
                    if let Some(offer) = &session.offer_sdp {
                        last_offer = true;
                        if tx.send(SyncEvent::OfferAppeared(offer.clone())).is_err() {
                            break;
                        }
                    }
                }
                if !last_answer {
                    if let Some(answer) = &session.answer_sdp {
                        last_answer = true;
                        if tx.send(SyncEvent::AnswerAppeared(answer.clone())).is_err() {
                            break;
                        }
                    }
                }

                let remote_ice = session.remote_ice(local_is_caller);
                if remote_ice.len() > last_remote_ice {
                    let fresh = remote_ice[last_remote_ice..].to_vec();
                    last_remote_ice = remote_ice.len();
                    if tx.send(SyncEvent::RemoteCandidates(fresh)).is_err() {
                        break;
                    }
                }

                if last_status != Some(session.status) {
                    // A snapshot that walks the status backwards is a stale
                    // read; hold the latched status and wait it out.
                    let legal = last_status
                        .map_or(true, |prev| prev.may_advance_to(session.status));
                    if !legal {
                        tracing::debug!(
                            target = "duet::sync",
                            session_id = %session_id,
                            latched = ?last_status,
                            observed = %session.status,
                            "ignoring status regression"
                        );
                        continue;
                    }
                    last_status = Some(session.status);
                    let terminal = session.status.is_terminal();
                    if tx.send(SyncEvent::StatusChanged(session.status)).is_err() {
                        break;
                    }
                    if terminal {
                        tracing::debug!(target = "duet::sync", session_id = %session_id, status = %session.status, "terminal status, watcher stopping");
                        break;
                    }
                }
            }
        });
        (Self { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for SessionWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Discovery poller for calls addressed to the local user. Reports the
/// ringing session on every poll that still observes it; the call manager
/// owns deduplication, so a ring it had to ignore (busy line) is offered
/// again once the line is free.
pub struct IncomingWatcher {
    handle: JoinHandle<()>,
}

impl IncomingWatcher {
    pub fn spawn(
        store: Arc<dyn CallStore>,
        local_user_id: String,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<CallSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                let session = match store.get_active_call_session().await {
                    Ok(session) => session,
                    Err(err) => {
                        tracing::warn!(target = "duet::sync", error = %err, "incoming poll failed");
                        continue;
                    }
                };

                if let Some(session) = session {
                    if session.status == CallStatus::Calling
                        && session.receiver_id == local_user_id
                        && tx.send(session).is_err()
                    {
                        break;
                    }
                }
            }
        });
        (Self { handle }, rx)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for IncomingWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CallHistory, CallType, StoreError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn session(id: &str) -> CallSession {
        CallSession {
            id: id.to_string(),
            status: CallStatus::Calling,
            call_type: CallType::Voice,
            caller_id: "alice".into(),
            receiver_id: "bob".into(),
            caller_username: "Alice".into(),
            receiver_username: "Bob".into(),
            offer_sdp: None,
            answer_sdp: None,
            caller_ice: Vec::new(),
            receiver_ice: Vec::new(),
            created_at: 0,
        }
    }

    /// Serves a scripted sequence of snapshots, repeating the last one.
    struct ScriptedStore {
        snapshots: Mutex<Vec<CallSession>>,
    }

    impl ScriptedStore {
        fn new(snapshots: Vec<CallSession>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots),
            }
        }
    }

    #[async_trait]
    impl CallStore for ScriptedStore {
        async fn create_call_session(
            &self,
            _: &str,
            _: CallType,
        ) -> Result<CallSession, StoreError> {
            unimplemented!()
        }

        async fn get_call_session(&self, _: &str) -> Result<Option<CallSession>, StoreError> {
            let mut snapshots = self.snapshots.lock();
            if snapshots.len() > 1 {
                Ok(Some(snapshots.remove(0)))
            } else {
                Ok(snapshots.first().cloned())
            }
        }

        async fn get_active_call_session(&self) -> Result<Option<CallSession>, StoreError> {
            self.get_call_session("").await
        }

        async fn set_offer(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn set_answer(&self, _: &str, _: &str) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn add_ice_candidate(&self, _: &str, _: &str, _: bool) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn update_call_status(&self, _: &str, _: CallStatus) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn get_call_history(&self) -> Result<Vec<CallHistory>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn watcher_emits_each_change_once_and_stops_on_terminal() {
        let mut ringing = session("s1");
        ringing.offer_sdp = Some("offer".into());

        let mut answered = ringing.clone();
        answered.answer_sdp = Some("answer".into());
        answered.receiver_ice = vec!["c1".into(), "c2".into()];
        answered.status = CallStatus::Active;

        let mut more_ice = answered.clone();
        more_ice.receiver_ice.push("c3".into());

        let mut stable = more_ice.clone();
        stable.status = CallStatus::Active;

        let mut ended = stable.clone();
        ended.status = CallStatus::Ended;

        let store = Arc::new(ScriptedStore::new(vec![
            ringing, answered, more_ice, stable, ended,
        ]));
        let (_watcher, mut rx) = SessionWatcher::spawn(
            store,
            "s1".into(),
            true,
            Duration::from_millis(5),
        );

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(
            events,
            vec![
                SyncEvent::OfferAppeared("offer".into()),
                SyncEvent::AnswerAppeared("answer".into()),
                SyncEvent::RemoteCandidates(vec!["c1".into(), "c2".into()]),
                SyncEvent::StatusChanged(CallStatus::Active),
                SyncEvent::RemoteCandidates(vec!["c3".into()]),
                SyncEvent::StatusChanged(CallStatus::Ended),
            ]
        );
    }

    #[tokio::test]
    async fn watcher_ignores_status_regressions() {
        let mut active = session("s4");
        active.status = CallStatus::Active;

        let mut regressed = active.clone();
        regressed.status = CallStatus::Calling;

        let mut ended = active.clone();
        ended.status = CallStatus::Ended;

        let store = Arc::new(ScriptedStore::new(vec![active, regressed, ended]));
        let (_watcher, mut rx) = SessionWatcher::spawn(
            store,
            "s4".into(),
            true,
            Duration::from_millis(5),
        );

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        // The stale `calling` snapshot between the two must never surface.
        assert_eq!(
            events,
            vec![
                SyncEvent::StatusChanged(CallStatus::Active),
                SyncEvent::StatusChanged(CallStatus::Ended),
            ]
        );
    }

    #[tokio::test]
    async fn incoming_watcher_reports_a_ringing_session_every_poll() {
        let ringing = session("s9");
        let store = Arc::new(ScriptedStore::new(vec![ringing]));
        let (_watcher, mut rx) =
            IncomingWatcher::spawn(store, "bob".into(), Duration::from_millis(5));

        // The consumer deduplicates; the watcher keeps reporting so an
        // ignored ring can be offered again.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, "s9");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, "s9");
    }

    #[tokio::test]
    async fn incoming_watcher_ignores_sessions_for_other_users() {
        let ringing = session("s9");
        let store = Arc::new(ScriptedStore::new(vec![ringing]));
        let (_watcher, mut rx) =
            IncomingWatcher::spawn(store, "carol".into(), Duration::from_millis(5));
        let outcome = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(outcome.is_err());
    }
}

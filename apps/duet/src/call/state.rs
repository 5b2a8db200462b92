//! The authoritative local call state.
//!
//! One machine instance per call session; transition legality is enforced
//! here and nowhere else. Termination is idempotent: the first trigger
//! wins, later ones are no-ops so teardown never runs twice.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Instant;

use super::{CallError, EndReason};
use crate::store::CallType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Active,
    Terminated(EndReason),
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Terminated(_))
    }
}

/// Per-session state machine. Voice and video share the shape; the call
/// type only decides what media gets attached.
#[derive(Debug)]
pub struct CallStateMachine {
    session_id: String,
    call_type: CallType,
    state: CallState,
    connected_at: Option<Instant>,
}

impl CallStateMachine {
    pub fn outgoing(session_id: impl Into<String>, call_type: CallType) -> Self {
        let session_id = session_id.into();
        tracing::info!(target = "duet::call", session_id = %session_id, %call_type, "call state: idle -> outgoing");
        Self {
            session_id,
            call_type,
            state: CallState::Outgoing,
            connected_at: None,
        }
    }

    pub fn incoming(session_id: impl Into<String>, call_type: CallType) -> Self {
        let session_id = session_id.into();
        tracing::info!(target = "duet::call", session_id = %session_id, %call_type, "call state: idle -> incoming");
        Self {
            session_id,
            call_type,
            state: CallState::Incoming,
            connected_at: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    /// Seconds since the transport connected, while active.
    pub fn duration_secs(&self) -> Option<u64> {
        match self.state {
            CallState::Active => self.connected_at.map(|t| t.elapsed().as_secs()),
            _ => None,
        }
    }

    /// `Outgoing -> Active` or `Incoming -> Active`.
    pub fn connect(&mut self) -> Result<(), CallError> {
        match self.state {
            CallState::Outgoing | CallState::Incoming => {
                tracing::info!(target = "duet::call", session_id = %self.session_id, "call state: -> active");
                self.state = CallState::Active;
                self.connected_at = Some(Instant::now());
                Ok(())
            }
            CallState::Active => Ok(()),
            _ => Err(CallError::InvalidState("connect")),
        }
    }

    /// Any state -> `Terminated(reason)`. Returns true only on the first
    /// trigger; callers gate teardown on that.
    pub fn terminate(&mut self, reason: EndReason) -> bool {
        if let CallState::Terminated(first) = self.state {
            tracing::debug!(
                target = "duet::call",
                session_id = %self.session_id,
                ?first,
                ignored = ?reason,
                "duplicate terminate ignored"
            );
            return false;
        }
        tracing::info!(target = "duet::call", session_id = %self.session_id, ?reason, "call state: -> terminated");
        self.state = CallState::Terminated(reason);
        true
    }
}

/// Idempotence guard for incoming calls: a session id is marked *before*
/// any asynchronous accept/decline work begins, so a second poll observing
/// the same ringing session cannot double-trigger it.
#[derive(Debug, Default)]
pub struct HandledSessions {
    seen: Mutex<HashSet<String>>,
}

impl HandledSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the id was not yet marked.
    pub fn mark(&self, session_id: &str) -> bool {
        self.seen.lock().insert(session_id.to_string())
    }

    pub fn is_marked(&self, session_id: &str) -> bool {
        self.seen.lock().contains(session_id)
    }

    /// Unmark after a reversible failure (permission prompt denied before
    /// anything was written) so a retry of the same session can proceed.
    pub fn unmark(&self, session_id: &str) {
        self.seen.lock().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CallType;

    #[test]
    fn outgoing_connects_then_terminates_once() {
        let mut machine = CallStateMachine::outgoing("s1", CallType::Voice);
        assert_eq!(machine.state(), CallState::Outgoing);
        machine.connect().unwrap();
        assert_eq!(machine.state(), CallState::Active);
        assert!(machine.duration_secs().is_some());

        assert!(machine.terminate(EndReason::HungUp));
        assert!(!machine.terminate(EndReason::RemoteEnded));
        assert_eq!(machine.state(), CallState::Terminated(EndReason::HungUp));
    }

    #[test]
    fn terminated_call_cannot_reconnect() {
        let mut machine = CallStateMachine::incoming("s2", CallType::Video);
        assert!(machine.terminate(EndReason::Declined));
        assert!(matches!(
            machine.connect(),
            Err(CallError::InvalidState("connect"))
        ));
        assert!(machine.duration_secs().is_none());
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let mut machine = CallStateMachine::outgoing("s3", CallType::Voice);
        machine.connect().unwrap();
        machine.connect().unwrap();
        assert_eq!(machine.state(), CallState::Active);
    }

    #[test]
    fn handled_sessions_mark_only_once() {
        let handled = HandledSessions::new();
        assert!(handled.mark("s1"));
        assert!(!handled.mark("s1"));
        assert!(handled.is_marked("s1"));
        handled.unmark("s1");
        assert!(handled.mark("s1"));
    }
}

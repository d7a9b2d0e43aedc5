use crate::control_messages::WireMessage;
use crate::fault::WsrmFault;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifecycle of a reliable session. `Faulted` is terminal and reachable from every
///  non-terminal state; the regular path is Created -> Opening -> Opened -> Closing
///  -> Closed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

/// Shared per-session identity, lifecycle state and the fault funnel.
///
/// Every fault - locally detected, received from the peer or caused by an unexpected
///  error - goes through exactly one of the `on_*` methods here, which makes faulting
///  idempotent: the first fault wins, every later one is dropped. State changes are
///  published through a watch channel so receive loops and blocked waiters can react.
pub struct ReliableSession {
    /// Identifies the sequence this endpoint receives on.
    input_id: Uuid,
    /// Identifies the sequence this endpoint sends on.
    output_id: Uuid,
    state: watch::Sender<SessionState>,
    fault: Mutex<Option<WsrmFault>>,
}

impl ReliableSession {
    pub fn new(input_id: Uuid, output_id: Uuid) -> ReliableSession {
        let (state, _) = watch::channel(SessionState::Created);
        ReliableSession { input_id, output_id, state, fault: Mutex::new(None) }
    }

    pub fn input_id(&self) -> Uuid {
        self.input_id
    }

    pub fn output_id(&self) -> Uuid {
        self.output_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// A receiver for reacting to lifecycle changes, most importantly to `Faulted`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_faulted(&self) -> bool {
        self.state() == SessionState::Faulted
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), SessionState::Closed | SessionState::Faulted)
    }

    /// The fault that killed the session, if any.
    #[allow(clippy::unwrap_used)]
    pub fn fault(&self) -> Option<WsrmFault> {
        self.fault.lock().unwrap().clone()
    }

    pub fn begin_open(&self) {
        self.transition(SessionState::Created, SessionState::Opening);
    }

    pub fn on_opened(&self) {
        self.transition(SessionState::Opening, SessionState::Opened);
    }

    /// Convenience for channels whose open has no asynchronous part.
    pub fn open(&self) {
        self.begin_open();
        self.on_opened();
    }

    pub fn begin_close(&self) {
        self.transition(SessionState::Opened, SessionState::Closing);
    }

    pub fn on_closed(&self) {
        self.transition(SessionState::Closing, SessionState::Closed);
    }

    fn transition(&self, from: SessionState, to: SessionState) {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            }
            else {
                false
            }
        });
    }

    /// A protocol violation or retry exhaustion was detected locally. Faults the session
    ///  and returns the fault message to transmit to the peer - or `None` if the session
    ///  already reached a terminal state and nothing should be sent.
    pub fn on_local_fault(&self, fault: WsrmFault) -> Option<WireMessage> {
        if !self.enter_faulted(fault.clone()) {
            return None;
        }
        warn!("session (in {} / out {}) faulted locally: {}", self.input_id, self.output_id, fault);
        Some(WireMessage::fault(fault))
    }

    /// The peer sent a fault message. Faults the session without replying.
    pub fn on_remote_fault(&self, fault: WsrmFault) {
        if self.enter_faulted(fault.clone()) {
            warn!(
                "session (in {} / out {}) faulted by the peer: {}",
                self.input_id, self.output_id, fault
            );
        }
    }

    /// An error outside the protocol's fault taxonomy (e.g. a broken transport). Faults
    ///  the session locally; there is no protocol fault to transmit.
    pub fn on_unknown_exception(&self, error: &anyhow::Error) {
        let newly_faulted = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Closed | SessionState::Faulted) {
                false
            }
            else {
                *state = SessionState::Faulted;
                true
            }
        });
        if newly_faulted {
            warn!(
                "session (in {} / out {}) faulted by an unexpected error: {}",
                self.input_id, self.output_id, error
            );
        }
        else {
            debug!("error after session end, dropped: {}", error);
        }
    }

    /// Records the fault and moves to `Faulted`. Returns false if the session was
    ///  already terminal (first fault wins, faults after a clean close are dropped).
    #[allow(clippy::unwrap_used)]
    fn enter_faulted(&self, fault: WsrmFault) -> bool {
        let newly_faulted = self.state.send_if_modified(|state| {
            if matches!(state, SessionState::Closed | SessionState::Faulted) {
                false
            }
            else {
                *state = SessionState::Faulted;
                true
            }
        });
        if newly_faulted {
            *self.fault.lock().unwrap() = Some(fault);
        }
        newly_faulted
    }
}

use crate::fault::WsrmFault;
use crate::sequence_range::{SequenceNumber, SequenceRangeCollection};
use bytes::Bytes;
use uuid::Uuid;

/// The acknowledgement header: which numbers of the identified sequence have been
///  received, whether the final number is known, and an optional buffer-remaining hint
///  for sender-side flow control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcknowledgementData {
    pub session_id: Uuid,
    pub ranges: SequenceRangeCollection,
    pub is_final: bool,
    pub buffer_remaining: Option<usize>,
}

/// A sequenced application message. `payload == None` is the legacy protocol's standalone
///  "last message" marker, which carries no application data and is only legal with
///  `is_last` set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencedMessage {
    pub session_id: Uuid,
    pub sequence_number: SequenceNumber,
    pub is_last: bool,
    pub payload: Option<Bytes>,
}

/// A typed protocol message descriptor.
///
/// This is what the binder hands the core and what the core hands the binder - the actual
///  framing, header encoding and parsing is an external collaborator's concern. Any
///  message can piggyback an acknowledgement header next to its body, matching the wire
///  protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub ack: Option<AcknowledgementData>,
    pub body: WireBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireBody {
    Sequenced(SequencedMessage),
    /// A standalone acknowledgement (the `ack` field carries the content).
    AckOnly,
    /// The peer requests an immediate acknowledgement of the identified sequence.
    AckRequested { session_id: Uuid },
    /// Declares the final message number of the identified sequence (current variant).
    CloseSequence { session_id: Uuid, last_msg_number: SequenceNumber },
    CloseSequenceResponse { session_id: Uuid },
    /// Declares cleanup of the identified sequence is safe. The final number is present
    ///  in the current protocol variant only.
    TerminateSequence { session_id: Uuid, last_msg_number: Option<SequenceNumber> },
    TerminateSequenceResponse { session_id: Uuid },
    Fault(WsrmFault),
}

impl WireMessage {
    pub fn sequenced(message: SequencedMessage) -> WireMessage {
        WireMessage { ack: None, body: WireBody::Sequenced(message) }
    }

    pub fn acknowledgement(ack: AcknowledgementData) -> WireMessage {
        WireMessage { ack: Some(ack), body: WireBody::AckOnly }
    }

    pub fn ack_requested(session_id: Uuid) -> WireMessage {
        WireMessage { ack: None, body: WireBody::AckRequested { session_id } }
    }

    pub fn close_sequence(session_id: Uuid, last_msg_number: SequenceNumber) -> WireMessage {
        WireMessage { ack: None, body: WireBody::CloseSequence { session_id, last_msg_number } }
    }

    pub fn terminate_sequence(
        session_id: Uuid,
        last_msg_number: Option<SequenceNumber>,
    ) -> WireMessage {
        WireMessage { ack: None, body: WireBody::TerminateSequence { session_id, last_msg_number } }
    }

    pub fn fault(fault: WsrmFault) -> WireMessage {
        WireMessage { ack: None, body: WireBody::Fault(fault) }
    }

    pub fn with_ack(mut self, ack: AcknowledgementData) -> WireMessage {
        self.ack = Some(ack);
        self
    }
}

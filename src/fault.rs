use uuid::Uuid;

/// Protocol fault kinds. Every one of these is locally fatal to the session; each carries
///  the offending session id and enough text to build both a protocol-level fault reply
///  for the peer and a local error for the application.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum WsrmFault {
    /// A sequenced message arrived with a number beyond the already-known final number.
    LastMessageNumberExceeded { session_id: Uuid },
    /// The sequence number space is exhausted (`i64::MAX` reached).
    MessageNumberRollover { session_id: Uuid },
    /// The peer requested termination before every number up to the final one arrived.
    SequenceTerminatedEarly { session_id: Uuid },
    /// A `TerminateSequence` referenced a sequence this side does not terminate.
    UnsupportedTerminateSequence { session_id: Uuid },
    /// A sequenced message arrived after the sequence was closed.
    SequenceClosed { session_id: Uuid },
    /// A transport send failed on every one of its `max_retry_count + 1` attempts.
    MaxRetryCountExceeded { session_id: Uuid },
    /// Close and terminate declared different final sequence numbers.
    InconsistentLastMessageNumber { session_id: Uuid },
    /// A declared final number is below a sequence number already seen.
    SmallLastMessageNumber { session_id: Uuid },
    /// Shutdown was requested while replies were still awaiting acknowledgement.
    NotAllRepliesAcknowledged { session_id: Uuid },
}

impl WsrmFault {
    pub fn session_id(&self) -> Uuid {
        match self {
            WsrmFault::LastMessageNumberExceeded { session_id }
            | WsrmFault::MessageNumberRollover { session_id }
            | WsrmFault::SequenceTerminatedEarly { session_id }
            | WsrmFault::UnsupportedTerminateSequence { session_id }
            | WsrmFault::SequenceClosed { session_id }
            | WsrmFault::MaxRetryCountExceeded { session_id }
            | WsrmFault::InconsistentLastMessageNumber { session_id }
            | WsrmFault::SmallLastMessageNumber { session_id }
            | WsrmFault::NotAllRepliesAcknowledged { session_id } => *session_id,
        }
    }

    /// The protocol-level fault code, as sent to the peer.
    pub fn code(&self) -> &'static str {
        match self {
            WsrmFault::LastMessageNumberExceeded { .. } => "LastMessageNumberExceeded",
            WsrmFault::MessageNumberRollover { .. } => "MessageNumberRollover",
            WsrmFault::SequenceTerminatedEarly { .. } => "SequenceTerminated",
            WsrmFault::UnsupportedTerminateSequence { .. } => "SequenceTerminated",
            WsrmFault::SequenceClosed { .. } => "SequenceClosed",
            WsrmFault::MaxRetryCountExceeded { .. } => "SequenceTerminated",
            WsrmFault::InconsistentLastMessageNumber { .. } => "SequenceTerminated",
            WsrmFault::SmallLastMessageNumber { .. } => "SequenceTerminated",
            WsrmFault::NotAllRepliesAcknowledged { .. } => "SequenceTerminated",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            WsrmFault::LastMessageNumberExceeded { .. } => {
                "a message was received with a sequence number above the declared last message number"
            }
            WsrmFault::MessageNumberRollover { .. } => {
                "the sequence number space is exhausted"
            }
            WsrmFault::SequenceTerminatedEarly { .. } => {
                "the sequence was terminated before all messages were received"
            }
            WsrmFault::UnsupportedTerminateSequence { .. } => {
                "terminating the remote endpoint's own sequence is not supported"
            }
            WsrmFault::SequenceClosed { .. } => {
                "the sequence is closed and cannot accept new messages"
            }
            WsrmFault::MaxRetryCountExceeded { .. } => {
                "a message could not be transferred within the retry limit"
            }
            WsrmFault::InconsistentLastMessageNumber { .. } => {
                "close and terminate declared inconsistent last message numbers"
            }
            WsrmFault::SmallLastMessageNumber { .. } => {
                "the declared last message number is below a sequence number already seen"
            }
            WsrmFault::NotAllRepliesAcknowledged { .. } => {
                "the sequence was terminated before all replies were acknowledged"
            }
        }
    }

    pub fn to_error(&self) -> anyhow::Error {
        anyhow::anyhow!("{} (session {}): {}", self.code(), self.session_id(), self.reason())
    }
}

impl std::fmt::Display for WsrmFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.reason())
    }
}

use crate::config::{ReliableMessagingVersion, MAX_SEQUENCE_RANGES};
use crate::sequence_range::{SequenceNumber, SequenceRangeCollection};
use tracing::debug;

/// Receive-side sequence state: which numbers have arrived, whether the final number is
///  known, and whether every number up to the final one has arrived.
///
/// This is a plain state struct - it is owned by its channel and mutated only under the
///  channel's lock, by the receive path. All transitions are monotonic: ranges only grow,
///  `last` is set at most once (or re-validated for consistency by the channel).
pub struct ReliableInputConnection {
    version: ReliableMessagingVersion,
    ranges: SequenceRangeCollection,
    last: Option<SequenceNumber>,
    is_sequence_closed: bool,
    terminated: bool,
}

impl ReliableInputConnection {
    pub fn new(version: ReliableMessagingVersion) -> ReliableInputConnection {
        ReliableInputConnection {
            version,
            ranges: SequenceRangeCollection::new(),
            last: None,
            is_sequence_closed: false,
            terminated: false,
        }
    }

    pub fn ranges(&self) -> &SequenceRangeCollection {
        &self.ranges
    }

    pub fn last(&self) -> Option<SequenceNumber> {
        self.last
    }

    pub fn is_last_known(&self) -> bool {
        self.last.is_some()
    }

    pub fn is_sequence_closed(&self) -> bool {
        self.is_sequence_closed
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// True iff the final number is known and every number from 1 up to it has arrived.
    pub fn all_added(&self) -> bool {
        match self.last {
            None => false,
            Some(0) => self.ranges.is_empty(),
            Some(last) => {
                self.ranges.count() == 1
                    && self.ranges.ranges()[0].lower == 1
                    && self.ranges.ranges()[0].upper == last
            }
        }
    }

    /// Validates an incoming sequence number against the protocol invariants.
    ///
    /// Legacy variant: numbers beyond a known final number are invalid, as is a second,
    ///  different claimed final number, or a final-number claim below something already
    ///  seen. Current variant: once the sequence is closed, only duplicates of already
    ///  accepted numbers remain valid.
    pub fn is_valid(&self, sequence_number: SequenceNumber, is_last: bool) -> bool {
        if sequence_number < 1 {
            return false;
        }

        match self.version {
            ReliableMessagingVersion::Legacy => match self.last {
                Some(last) => {
                    if is_last {
                        sequence_number == last
                    }
                    else {
                        sequence_number < last
                    }
                }
                None => !is_last || sequence_number >= self.ranges.max(),
            },
            ReliableMessagingVersion::Current => {
                !self.is_sequence_closed || self.ranges.contains(sequence_number)
            }
        }
    }

    /// In the unordered-delivery case no more than [`MAX_SEQUENCE_RANGES`] disjoint ranges
    ///  are kept, to bound acknowledgement size and memory. A number that would not grow
    ///  the collection can always be merged.
    pub fn can_merge(&self, sequence_number: SequenceNumber) -> bool {
        self.ranges.count() < MAX_SEQUENCE_RANGES || !self.ranges.would_add_range(sequence_number)
    }

    /// Records acceptance of `sequence_number`. Callers validate via [`Self::is_valid`]
    ///  first.
    pub fn merge(&mut self, sequence_number: SequenceNumber, is_last: bool) {
        self.ranges.merge(sequence_number);
        if is_last {
            self.last = Some(sequence_number);
        }
    }

    /// The peer declared its final number via `CloseSequence` (current variant). Returns
    ///  false if the declared number is below something already seen - that is a
    ///  "small last message number" protocol fault.
    pub fn set_close_sequence_last(&mut self, last: SequenceNumber) -> bool {
        if last < 0 || last < self.ranges.max() {
            return false;
        }
        self.last = Some(last);
        self.is_sequence_closed = true;
        true
    }

    /// The peer declared its final number via `TerminateSequence` (current variant).
    ///
    /// Returns `(accepted, is_last_large_enough)`: accepted only if the sequence is
    ///  complete up to exactly `last`; rejected-but-large-enough means the peer terminated
    ///  before all of its messages arrived (an early termination); rejected-and-small
    ///  means a "small last message number" protocol fault.
    pub fn set_terminate_sequence_last(&mut self, last: SequenceNumber) -> (bool, bool) {
        if last < 0 || last < self.ranges.max() {
            return (false, false);
        }

        let complete = match last {
            0 => self.ranges.is_empty(),
            _ => {
                self.ranges.count() == 1
                    && self.ranges.ranges()[0].lower == 1
                    && self.ranges.ranges()[0].upper == last
            }
        };

        if !complete {
            return (false, true);
        }

        self.last = Some(last);
        self.is_sequence_closed = true;
        (true, true)
    }

    /// Marks the connection fully drained, both on graceful shutdown and on
    ///  transport-level session end. Returns false if termination is early, i.e. not all
    ///  numbers up to the final one have arrived - that is always a protocol fault.
    pub fn terminate(&mut self) -> bool {
        if self.terminated {
            return true;
        }

        if self.version == ReliableMessagingVersion::Current && self.is_sequence_closed {
            self.terminated = true;
            return true;
        }

        if self.all_added() {
            self.terminated = true;
            true
        }
        else {
            debug!("input connection terminated before all messages arrived");
            false
        }
    }
}

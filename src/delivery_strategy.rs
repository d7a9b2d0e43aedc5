use crate::sequence_range::SequenceNumber;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::trace;

/// Buffers accepted inbound items up to the transfer window quota and decides when an item
///  may be released to the application dispatch path.
///
/// Released items flow into an unbounded channel drained by the owning channel's
///  `receive()` call; `enqueued_count` covers everything from acceptance until the
///  application takes the item, which is what the acknowledgement's buffer-remaining hint
///  is computed from.
pub struct DeliveryStrategy<T> {
    quota: usize,
    enqueued_count: usize,
    dispatch: mpsc::UnboundedSender<T>,
    mode: DeliveryMode<T>,
    disposed: bool,
}

enum DeliveryMode<T> {
    /// Releases every accepted item immediately.
    Unordered,
    /// Releases items in strict sequence order, buffering until the contiguous prefix
    ///  starting at `next` is available.
    Ordered { next: SequenceNumber, pending: BTreeMap<SequenceNumber, T> },
}

impl<T> DeliveryStrategy<T> {
    pub fn unordered(quota: usize, dispatch: mpsc::UnboundedSender<T>) -> DeliveryStrategy<T> {
        DeliveryStrategy {
            quota,
            enqueued_count: 0,
            dispatch,
            mode: DeliveryMode::Unordered,
            disposed: false,
        }
    }

    pub fn ordered(quota: usize, dispatch: mpsc::UnboundedSender<T>) -> DeliveryStrategy<T> {
        DeliveryStrategy {
            quota,
            enqueued_count: 0,
            dispatch,
            mode: DeliveryMode::Ordered { next: 1, pending: BTreeMap::new() },
            disposed: false,
        }
    }

    pub fn enqueued_count(&self) -> usize {
        self.enqueued_count
    }

    /// Window-capacity check for a candidate sequence number.
    pub fn can_enqueue(&self, sequence_number: SequenceNumber) -> bool {
        if self.disposed || self.enqueued_count >= self.quota {
            return false;
        }
        match &self.mode {
            DeliveryMode::Unordered => true,
            DeliveryMode::Ordered { next, .. } => sequence_number < next + self.quota as i64,
        }
    }

    /// Accepts an item. Returns true iff at least one item became releasable to the
    ///  application - for the unordered variant that is every accepted item, for the
    ///  ordered variant only when the contiguous prefix advanced.
    pub fn enqueue(&mut self, item: T, sequence_number: SequenceNumber) -> bool {
        debug_assert!(!self.disposed);
        self.enqueued_count += 1;

        match &mut self.mode {
            DeliveryMode::Unordered => {
                self.dispatch.send(item).ok();
                true
            }
            DeliveryMode::Ordered { next, pending } => {
                pending.insert(sequence_number, item);
                if sequence_number != *next {
                    trace!("buffering out-of-order message #{}, next expected #{}", sequence_number, next);
                    return false;
                }

                while let Some(releasable) = pending.remove(next) {
                    self.dispatch.send(releasable).ok();
                    *next += 1;
                }
                true
            }
        }
    }

    /// The application took one released item; frees up window capacity.
    pub fn dispatched(&mut self) {
        self.enqueued_count = self.enqueued_count.saturating_sub(1);
    }

    /// Abandons buffered items on shutdown or fault. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let DeliveryMode::Ordered { pending, .. } = &mut self.mode {
            pending.clear();
        }
        self.enqueued_count = 0;
    }
}

use crate::binder::ReliableBinder;
use crate::config::ReliableSessionConfig;
use crate::control_messages::{SequencedMessage, WireMessage};
use crate::fault::WsrmFault;
use crate::sequence_range::{SequenceNumber, SequenceRangeCollection};
use crate::wait_object::WaitObject;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Error surface of the send path.
///
/// Only the `Fault` variant is fatal to the session; the caller funnels it into the
///  session's local-fault handling. The other variants are local conditions the session
///  survives.
#[derive(Debug)]
pub enum SendError {
    /// A protocol fault was detected; the session must be faulted with it.
    Fault(WsrmFault),
    /// The transfer window did not open up within the send timeout.
    Timeout,
    /// The connection was closed or aborted before the message could be accepted.
    Closed,
}

impl SendError {
    pub fn fault(&self) -> Option<&WsrmFault> {
        match self {
            SendError::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Fault(fault) => write!(f, "send faulted the session: {}", fault),
            SendError::Timeout => write!(f, "timed out waiting for transfer window capacity"),
            SendError::Closed => write!(f, "the connection no longer accepts messages"),
        }
    }
}

impl std::error::Error for SendError {}

/// The result of folding one inbound acknowledgement into the send-side bookkeeping.
#[derive(Default, Debug)]
pub struct AckOutcome {
    /// Every sent message (including a declared final number) is acknowledged.
    pub all_acknowledged: bool,
    /// The peer advertised a zero receive buffer while retiring messages; with flow
    ///  control enabled the session should probe with an ack request so the reopened
    ///  window is learned without waiting for application traffic.
    pub request_ack_heartbeat: bool,
}

struct PendingSend {
    // holding the permit keeps the message's window slot occupied until it is acknowledged
    _permit: OwnedSemaphorePermit,
}

struct OutState {
    next_sequence_number: SequenceNumber,
    /// The declared final number of this direction, once known.
    last: Option<SequenceNumber>,
    /// Sent but not yet acknowledged, keyed by sequence number.
    pending: BTreeMap<SequenceNumber, PendingSend>,
    /// The peer's most recent buffer-remaining hint.
    peer_buffer_remaining: Option<usize>,
    closed: bool,
}

/// The send half of a reliable session: assigns sequence numbers, enforces the transfer
///  window, sends through the binder with bounded retry, and retires in-flight messages
///  as acknowledgements arrive.
pub struct ReliableOutputConnection {
    session_id: Uuid,
    max_retry_count: usize,
    retry_interval: Duration,
    flow_control: bool,
    binder: Arc<dyn ReliableBinder>,
    window: Arc<Semaphore>,
    all_acked: WaitObject,
    state: RwLock<OutState>,
}

impl ReliableOutputConnection {
    pub fn new(
        session_id: Uuid,
        config: &ReliableSessionConfig,
        binder: Arc<dyn ReliableBinder>,
    ) -> ReliableOutputConnection {
        ReliableOutputConnection {
            session_id,
            max_retry_count: config.max_retry_count,
            retry_interval: config.retry_interval,
            flow_control: config.flow_control,
            binder,
            window: Arc::new(Semaphore::new(config.max_transfer_window_size)),
            all_acked: WaitObject::new(),
            state: RwLock::new(OutState {
                next_sequence_number: 1,
                last: None,
                pending: BTreeMap::new(),
                peer_buffer_remaining: None,
                closed: false,
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub async fn last(&self) -> Option<SequenceNumber> {
        self.state.read().await.last
    }

    pub async fn pending_count(&self) -> usize {
        self.state.read().await.pending.len()
    }

    /// Set once this direction's final number is declared and everything up to it is
    ///  acknowledged; close blocks on it before starting the shutdown handshake.
    pub fn all_acked(&self) -> &WaitObject {
        &self.all_acked
    }

    /// Accepts an application message: waits for window capacity, assigns the next
    ///  sequence number and transfers the message with bounded retry.
    pub async fn add_message(&self, payload: Bytes, timeout: Duration) -> Result<(), SendError> {
        let message = self.register(Some(payload), false, timeout).await?;
        self.send_with_retry(WireMessage::sequenced(message), timeout).await
    }

    /// Sends the legacy protocol's standalone last-message marker. It consumes a sequence
    ///  number of its own and is tracked and acknowledged like any other message.
    pub async fn add_last_marker(&self, timeout: Duration) -> Result<(), SendError> {
        let message = self.register(None, true, timeout).await?;
        self.send_with_retry(WireMessage::sequenced(message), timeout).await
    }

    async fn register(
        &self,
        payload: Option<Bytes>,
        is_last: bool,
        timeout: Duration,
    ) -> Result<SequencedMessage, SendError> {
        let permit = match tokio::time::timeout(timeout, self.window.clone().acquire_owned()).await
        {
            Err(_) => return Err(SendError::Timeout),
            Ok(Err(_)) => return Err(SendError::Closed),
            Ok(Ok(permit)) => permit,
        };

        let mut state = self.state.write().await;
        if state.closed {
            return Err(SendError::Closed);
        }
        if state.next_sequence_number == SequenceNumber::MAX {
            // the top number is reserved as the rollover sentinel and never assigned
            return Err(SendError::Fault(WsrmFault::MessageNumberRollover {
                session_id: self.session_id,
            }));
        }

        let sequence_number = state.next_sequence_number;
        state.next_sequence_number += 1;
        if is_last {
            state.last = Some(sequence_number);
            state.closed = true;
        }
        state.pending.insert(sequence_number, PendingSend { _permit: permit });
        trace!("session {}: sending message #{}", self.session_id, sequence_number);

        Ok(SequencedMessage { session_id: self.session_id, sequence_number, is_last, payload })
    }

    /// Declares the final sequence number without consuming a number (current protocol
    ///  variant): the highest number assigned so far, or 0 for an unused direction.
    pub async fn declare_last(&self) -> SequenceNumber {
        let mut state = self.state.write().await;
        let last = state.next_sequence_number - 1;
        state.last = Some(last);
        state.closed = true;
        if state.pending.is_empty() {
            self.all_acked.set();
        }
        last
    }

    /// Sends through the binder, retrying transport failures up to `max_retry_count`
    ///  times with `retry_interval` pauses. Exhausting the retries is a session fault.
    pub async fn send_with_retry(
        &self,
        message: WireMessage,
        timeout: Duration,
    ) -> Result<(), SendError> {
        for attempt in 0..=self.max_retry_count {
            match self.binder.send(message.clone(), timeout).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt == self.max_retry_count => {
                    warn!(
                        "session {}: transport send failed on all {} attempts: {}",
                        self.session_id,
                        self.max_retry_count + 1,
                        e
                    );
                    return Err(SendError::Fault(WsrmFault::MaxRetryCountExceeded {
                        session_id: self.session_id,
                    }));
                }
                Err(e) => {
                    debug!(
                        "session {}: transport send attempt {} failed, retrying: {}",
                        self.session_id,
                        attempt + 1,
                        e
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
        unreachable!()
    }

    /// Folds an inbound acknowledgement into the pending table, releasing window
    ///  capacity for every retired message. Ranges covering numbers that were never sent
    ///  are logged and ignored.
    pub async fn process_transferred(
        &self,
        ranges: &SequenceRangeCollection,
        buffer_remaining: Option<usize>,
    ) -> AckOutcome {
        let mut state = self.state.write().await;

        if ranges.max() >= state.next_sequence_number {
            warn!(
                "session {}: ignoring acknowledgement covering unsent number {}",
                self.session_id,
                ranges.max()
            );
            return AckOutcome::default();
        }

        let before = state.pending.len();
        state.pending.retain(|n, _| !ranges.contains(*n));
        let retired = before - state.pending.len();
        if retired > 0 {
            trace!("session {}: acknowledgement retired {} message(s)", self.session_id, retired);
        }
        state.peer_buffer_remaining = buffer_remaining;

        let all_acknowledged = state.last.is_some() && state.pending.is_empty();
        if all_acknowledged {
            self.all_acked.set();
        }

        AckOutcome {
            all_acknowledged,
            request_ack_heartbeat: self.flow_control && retired > 0 && buffer_remaining == Some(0),
        }
    }

    /// True once the final number is declared and nothing is in flight.
    pub async fn is_complete(&self) -> bool {
        let state = self.state.read().await;
        state.last.is_some() && state.pending.is_empty()
    }

    /// Drops all in-flight bookkeeping and wakes blocked senders with an error.
    pub async fn abort(&self) {
        let mut state = self.state.write().await;
        state.closed = true;
        state.pending.clear();
        self.window.close();
        self.all_acked.abort();
    }

    #[cfg(test)]
    async fn set_next_sequence_number(&self, n: SequenceNumber) {
        self.state.write().await.next_sequence_number = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::MockReliableBinder;
    use crate::config::{ReliableMessagingVersion, SessionRole};
    use crate::control_messages::WireBody;
    use rstest::rstest;
    use tokio::runtime::Builder;

    fn config() -> ReliableSessionConfig {
        ReliableSessionConfig::new(ReliableMessagingVersion::Current, SessionRole::Client)
    }

    fn accepting_binder() -> MockReliableBinder {
        let mut binder = MockReliableBinder::new();
        binder.expect_send().returning(|_, _| Ok(()));
        binder
    }

    fn ranges(numbers: &[SequenceNumber]) -> SequenceRangeCollection {
        let mut result = SequenceRangeCollection::new();
        for &n in numbers {
            result.merge(n);
        }
        result
    }

    #[rstest]
    fn test_failing_send_is_retried_exactly_max_retry_count_plus_one_times() {
        let rt = Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async {
            let mut cfg = config();
            cfg.max_retry_count = 3;

            let mut binder = MockReliableBinder::new();
            binder
                .expect_send()
                .times(4)
                .returning(|_, _| Err(anyhow::anyhow!("connection reset")));

            let conn =
                ReliableOutputConnection::new(Uuid::new_v4(), &cfg, Arc::new(binder));
            let result = conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await;

            match result {
                Err(SendError::Fault(WsrmFault::MaxRetryCountExceeded { .. })) => {}
                other => panic!("expected MaxRetryCountExceeded, got {:?}", other),
            }
        });
    }

    #[rstest]
    fn test_sequence_numbers_start_at_one_and_increase() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let session_id = Uuid::new_v4();
            let mut binder = MockReliableBinder::new();
            let mut expected = 1;
            binder.expect_send().times(3).returning(move |msg, _| {
                match msg.body {
                    WireBody::Sequenced(ref m) => assert_eq!(m.sequence_number, expected),
                    _ => panic!("expected a sequenced message"),
                }
                expected += 1;
                Ok(())
            });

            let conn = ReliableOutputConnection::new(session_id, &config(), Arc::new(binder));
            for _ in 0..3 {
                conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap();
            }
            assert_eq!(conn.pending_count().await, 3);
        });
    }

    #[rstest]
    fn test_window_blocks_until_acknowledgement_retires_messages() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut cfg = config();
            cfg.max_transfer_window_size = 2;

            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &cfg,
                Arc::new(accepting_binder()),
            );
            conn.add_message(Bytes::from_static(b"a"), Duration::from_secs(1)).await.unwrap();
            conn.add_message(Bytes::from_static(b"b"), Duration::from_secs(1)).await.unwrap();

            // window full: the third message cannot be accepted
            let blocked = conn.add_message(Bytes::from_static(b"c"), Duration::from_millis(10)).await;
            assert!(matches!(blocked, Err(SendError::Timeout)));

            conn.process_transferred(&ranges(&[1, 2]), None).await;
            assert_eq!(conn.pending_count().await, 0);

            conn.add_message(Bytes::from_static(b"c"), Duration::from_secs(1)).await.unwrap();
        });
    }

    #[rstest]
    fn test_rollover_is_a_fault() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &config(),
                Arc::new(MockReliableBinder::new()),
            );
            conn.set_next_sequence_number(SequenceNumber::MAX).await;

            let result = conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await;
            assert!(matches!(
                result,
                Err(SendError::Fault(WsrmFault::MessageNumberRollover { .. }))
            ));
        });
    }

    #[rstest]
    fn test_declare_last_and_all_acked() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &config(),
                Arc::new(accepting_binder()),
            );
            conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap();

            assert_eq!(conn.declare_last().await, 1);
            assert!(!conn.all_acked().is_set());

            let outcome = conn.process_transferred(&ranges(&[1]), None).await;
            assert!(outcome.all_acknowledged);
            assert!(conn.all_acked().is_set());
            assert!(conn.is_complete().await);

            // a closed connection accepts no further messages
            let late = conn.add_message(Bytes::from_static(b"y"), Duration::from_secs(1)).await;
            assert!(matches!(late, Err(SendError::Closed)));
        });
    }

    #[rstest]
    fn test_declare_last_on_unused_direction_is_zero_and_complete() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &config(),
                Arc::new(MockReliableBinder::new()),
            );
            assert_eq!(conn.declare_last().await, 0);
            assert!(conn.all_acked().is_set());
        });
    }

    #[rstest]
    fn test_legacy_last_marker_consumes_a_sequence_number() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut binder = MockReliableBinder::new();
            binder.expect_send().returning(|msg, _| {
                if let WireBody::Sequenced(ref m) = msg.body {
                    if m.sequence_number == 2 {
                        assert!(m.is_last);
                        assert!(m.payload.is_none());
                    }
                }
                Ok(())
            });

            let conn =
                ReliableOutputConnection::new(Uuid::new_v4(), &config(), Arc::new(binder));
            conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap();
            conn.add_last_marker(Duration::from_secs(1)).await.unwrap();

            assert_eq!(conn.last().await, Some(2));
        });
    }

    #[rstest]
    #[case::zero_window_requests_heartbeat(Some(0), true)]
    #[case::open_window(Some(4), false)]
    #[case::no_hint(None, false)]
    fn test_advertised_zero_window_heartbeat(
        #[case] buffer_remaining: Option<usize>,
        #[case] expected_heartbeat: bool,
    ) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &config(),
                Arc::new(accepting_binder()),
            );
            conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap();

            let outcome = conn.process_transferred(&ranges(&[1]), buffer_remaining).await;
            assert_eq!(outcome.request_ack_heartbeat, expected_heartbeat);
        });
    }

    #[rstest]
    fn test_acknowledgement_of_unsent_numbers_is_ignored() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let conn = ReliableOutputConnection::new(
                Uuid::new_v4(),
                &config(),
                Arc::new(accepting_binder()),
            );
            conn.add_message(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap();

            conn.process_transferred(&ranges(&[1, 2, 3]), None).await;
            assert_eq!(conn.pending_count().await, 1);
        });
    }

    #[rstest]
    fn test_abort_unblocks_senders() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut cfg = config();
            cfg.max_transfer_window_size = 1;

            let conn = Arc::new(ReliableOutputConnection::new(
                Uuid::new_v4(),
                &cfg,
                Arc::new(accepting_binder()),
            ));
            conn.add_message(Bytes::from_static(b"a"), Duration::from_secs(1)).await.unwrap();

            let blocked = {
                let conn = conn.clone();
                tokio::spawn(async move {
                    conn.add_message(Bytes::from_static(b"b"), Duration::from_secs(60)).await
                })
            };
            tokio::task::yield_now().await;
            conn.abort().await;

            assert!(matches!(blocked.await.unwrap(), Err(SendError::Closed)));
        });
    }
}

use crate::binder::ReliableBinder;
use crate::config::{ReliableMessagingVersion, ReliableSessionConfig};
use crate::control_messages::{AcknowledgementData, SequencedMessage, WireBody, WireMessage};
use crate::delivery_strategy::DeliveryStrategy;
use crate::fault::WsrmFault;
use crate::input_connection::ReliableInputConnection;
use crate::output_connection::{ReliableOutputConnection, SendError};
use crate::sequence_range::SequenceNumber;
use crate::session::ReliableSession;
use crate::wait_object::WaitObject;
use anyhow::bail;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct Inner {
    input_id: Uuid,
    input: ReliableInputConnection,
    delivery: DeliveryStrategy<Bytes>,
    quota: usize,
    flow_control: bool,
    /// Newly accepted messages since the last acknowledgement went out.
    unacked_count: usize,
    /// Timer for the next batched acknowledgement; aborted when an ack is forced out early.
    pending_ack_handle: Option<tokio::task::JoinHandle<()>>,
}

impl Inner {
    fn build_ack(&self) -> AcknowledgementData {
        AcknowledgementData {
            session_id: self.input_id,
            ranges: self.input.ranges().clone(),
            is_final: self.input.is_sequence_closed(),
            buffer_remaining: if self.flow_control {
                Some(self.quota - self.delivery.enqueued_count())
            }
            else {
                None
            },
        }
    }

    /// Builds the ack to send right now, cancelling any batching timer.
    fn take_ack(&mut self) -> AcknowledgementData {
        if let Some(handle) = self.pending_ack_handle.take() {
            handle.abort();
        }
        self.unacked_count = 0;
        self.build_ack()
    }

    /// An acknowledgement must go out immediately when the final number is known or a
    ///  window's worth of unacknowledged messages piled up.
    fn ack_is_urgent(&self) -> bool {
        self.input.is_last_known() || self.unacked_count >= self.quota
    }
}

/// The duplex channel orchestrator: owns one input connection, one output connection,
///  one delivery strategy and one session, and drives all protocol-message handling for
///  a two-way transport.
///
/// The caller spawns [`ReliableDuplexChannel::recv_loop`] once; application
///  [`send`](ReliableDuplexChannel::send) / [`receive`](ReliableDuplexChannel::receive)
///  calls run concurrently against it. All shared state lives behind one per-channel
///  lock, held only for state transitions - transport sends happen outside it.
pub struct ReliableDuplexChannel {
    config: ReliableSessionConfig,
    session: ReliableSession,
    binder: Arc<dyn ReliableBinder>,
    output: ReliableOutputConnection,
    inner: Arc<RwLock<Inner>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    /// Set when the peer's `CloseSequenceResponse` for our output sequence arrives.
    close_response_wait: WaitObject,
    /// Set when the peer's `TerminateSequenceResponse` for our output sequence arrives.
    terminate_response_wait: WaitObject,
    /// Set when the peer terminates its own sequence (our input direction).
    remote_terminate_wait: WaitObject,
}

impl ReliableDuplexChannel {
    pub fn new(
        config: ReliableSessionConfig,
        input_id: Uuid,
        output_id: Uuid,
        binder: Arc<dyn ReliableBinder>,
    ) -> anyhow::Result<Arc<ReliableDuplexChannel>> {
        config.validate()?;

        let (dispatch, inbound) = mpsc::unbounded_channel();
        let delivery = if config.ordered {
            DeliveryStrategy::ordered(config.max_transfer_window_size, dispatch)
        }
        else {
            DeliveryStrategy::unordered(config.max_transfer_window_size, dispatch)
        };

        let session = ReliableSession::new(input_id, output_id);
        session.open();

        let channel = Arc::new(ReliableDuplexChannel {
            session,
            output: ReliableOutputConnection::new(output_id, &config, binder.clone()),
            inner: Arc::new(RwLock::new(Inner {
                input_id,
                input: ReliableInputConnection::new(config.version),
                delivery,
                quota: config.max_transfer_window_size,
                flow_control: config.flow_control,
                unacked_count: 0,
                pending_ack_handle: None,
            })),
            inbound: Mutex::new(inbound),
            close_response_wait: WaitObject::new(),
            terminate_response_wait: WaitObject::new(),
            remote_terminate_wait: WaitObject::new(),
            binder,
            config,
        });
        info!("reliable duplex session opened (in {} / out {})", input_id, output_id);
        Ok(channel)
    }

    pub fn session(&self) -> &ReliableSession {
        &self.session
    }

    /// Sends an application message on the session's output sequence, blocking while the
    ///  transfer window is full.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<()> {
        match self.output.add_message(payload, self.config.send_timeout).await {
            Ok(()) => Ok(()),
            Err(SendError::Fault(fault)) => {
                let error = fault.to_error();
                self.fault_locally(fault).await;
                Err(error)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The next released inbound message. `Ok(None)` means the inbound direction ended
    ///  (cleanly or by fault - check the session state).
    pub async fn receive(&self, timeout: Duration) -> anyhow::Result<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        match time::timeout(timeout, inbound.recv()).await {
            Err(_) => bail!("timed out waiting for an inbound message"),
            Ok(None) => Ok(None),
            Ok(Some(payload)) => {
                self.inner.write().await.delivery.dispatched();
                Ok(Some(payload))
            }
        }
    }

    /// Continuously pumps inbound protocol messages until the transport or the session
    ///  ends. Spawn exactly once per channel.
    pub async fn recv_loop(&self) {
        debug!("starting receive loop (session in {})", self.session.input_id());

        loop {
            match self.binder.try_receive().await {
                Ok(Some(message)) => {
                    if let Err(e) = self.handle_message(message).await {
                        self.session.on_unknown_exception(&e);
                        self.unblock_all_waiters();
                        break;
                    }
                }
                Ok(None) => {
                    self.on_transport_ended().await;
                    break;
                }
                Err(e) => {
                    self.session.on_unknown_exception(&e);
                    self.unblock_all_waiters();
                    break;
                }
            }

            if self.session.is_terminal() {
                break;
            }
        }
        debug!("receive loop ended (session in {})", self.session.input_id());
    }

    /// The transport ended the session underneath the protocol. Clean if the peer's
    ///  sequence was already complete, an early termination fault otherwise.
    async fn on_transport_ended(&self) {
        let clean = self.inner.write().await.input.terminate();
        if clean {
            self.remote_terminate_wait.set();
        }
        else if !self.session.is_terminal() {
            let input_id = self.session.input_id();
            self.fault_locally(WsrmFault::SequenceTerminatedEarly { session_id: input_id }).await;
        }
    }

    async fn handle_message(&self, message: WireMessage) -> anyhow::Result<()> {
        if let Some(ack) = &message.ack {
            if ack.session_id == self.session.output_id() {
                let outcome =
                    self.output.process_transferred(&ack.ranges, ack.buffer_remaining).await;
                if outcome.request_ack_heartbeat {
                    // the peer's receive buffer ran full; probe so we learn when it reopens
                    self.send_best_effort(WireMessage::ack_requested(self.session.output_id()))
                        .await;
                }
            }
            else {
                warn!("dropping acknowledgement for unknown sequence {}", ack.session_id);
            }
        }

        match message.body {
            WireBody::Sequenced(m) => self.process_sequenced(m).await,
            WireBody::AckOnly => Ok(()),
            WireBody::AckRequested { session_id } => {
                if session_id == self.session.input_id() {
                    self.send_ack_now().await;
                }
                Ok(())
            }
            WireBody::CloseSequence { session_id, last_msg_number } => {
                self.process_close_sequence(session_id, last_msg_number).await
            }
            WireBody::CloseSequenceResponse { session_id } => {
                if session_id == self.session.output_id() {
                    self.close_response_wait.set();
                }
                Ok(())
            }
            WireBody::TerminateSequence { session_id, last_msg_number } => {
                self.process_terminate_sequence(session_id, last_msg_number).await
            }
            WireBody::TerminateSequenceResponse { session_id } => {
                if session_id == self.session.output_id() {
                    self.terminate_response_wait.set();
                }
                Ok(())
            }
            WireBody::Fault(fault) => {
                self.session.on_remote_fault(fault);
                self.unblock_all_waiters();
                Ok(())
            }
        }
    }

    async fn process_sequenced(&self, message: SequencedMessage) -> anyhow::Result<()> {
        if message.session_id != self.session.input_id() {
            warn!("dropping sequenced message for unknown sequence {}", message.session_id);
            return Ok(());
        }

        let (fault, send_ack, schedule_ack) = {
            let mut inner = self.inner.write().await;
            let n = message.sequence_number;

            if !inner.input.is_valid(n, message.is_last) {
                let fault = match self.config.version {
                    ReliableMessagingVersion::Current => {
                        WsrmFault::SequenceClosed { session_id: inner.input_id }
                    }
                    ReliableMessagingVersion::Legacy => {
                        WsrmFault::LastMessageNumberExceeded { session_id: inner.input_id }
                    }
                };
                (Some(fault), false, false)
            }
            else if inner.input.ranges().contains(n) {
                // duplicate - drop the payload, but re-acknowledge so the peer stops resending
                trace!("dropping duplicate message #{}", n);
                (None, false, true)
            }
            else if !inner.input.can_merge(n) || !inner.delivery.can_enqueue(n) {
                // no capacity - drop without merging, the peer's retry will redeliver
                trace!("dropping message #{}, no buffer capacity", n);
                (None, false, false)
            }
            else {
                inner.input.merge(n, message.is_last);
                if let Some(payload) = message.payload {
                    inner.delivery.enqueue(payload, n);
                }
                inner.unacked_count += 1;
                if inner.ack_is_urgent() {
                    (None, true, false)
                }
                else {
                    (None, false, true)
                }
            }
        };

        if let Some(fault) = fault {
            self.fault_locally(fault).await;
        }
        else if send_ack {
            self.send_ack_now().await;
        }
        else if schedule_ack {
            self.schedule_ack().await;
        }
        Ok(())
    }

    async fn process_close_sequence(
        &self,
        session_id: Uuid,
        last: SequenceNumber,
    ) -> anyhow::Result<()> {
        if session_id != self.session.input_id() {
            warn!("dropping CloseSequence for unknown sequence {}", session_id);
            return Ok(());
        }
        if self.config.version != ReliableMessagingVersion::Current {
            warn!("dropping CloseSequence, not part of the legacy protocol");
            return Ok(());
        }

        let fault = {
            let mut inner = self.inner.write().await;
            if inner.input.is_last_known() {
                // a repeated close must declare the same final number
                if inner.input.last() != Some(last) {
                    Some(WsrmFault::InconsistentLastMessageNumber { session_id })
                }
                else {
                    None
                }
            }
            else if !inner.input.set_close_sequence_last(last) {
                Some(WsrmFault::SmallLastMessageNumber { session_id })
            }
            else {
                None
            }
        };
        if let Some(fault) = fault {
            self.fault_locally(fault).await;
            return Ok(());
        }

        // the response carries the final acknowledgement for the peer's sequence
        let ack = self.inner.write().await.take_ack();
        self.send_best_effort(
            WireMessage { ack: Some(ack), body: WireBody::CloseSequenceResponse { session_id } },
        )
        .await;
        Ok(())
    }

    async fn process_terminate_sequence(
        &self,
        session_id: Uuid,
        last: Option<SequenceNumber>,
    ) -> anyhow::Result<()> {
        if session_id != self.session.input_id() {
            warn!("dropping TerminateSequence for unknown sequence {}", session_id);
            return Ok(());
        }

        match (self.config.version, last) {
            (ReliableMessagingVersion::Current, Some(last)) => {
                let fault = {
                    let mut inner = self.inner.write().await;
                    if inner.input.is_last_known() && inner.input.last() != Some(last) {
                        Some(WsrmFault::InconsistentLastMessageNumber { session_id })
                    }
                    else {
                        match inner.input.set_terminate_sequence_last(last) {
                            (true, true) => {
                                inner.input.terminate();
                                None
                            }
                            (false, true) => {
                                Some(WsrmFault::SequenceTerminatedEarly { session_id })
                            }
                            (false, false) => {
                                Some(WsrmFault::SmallLastMessageNumber { session_id })
                            }
                            (true, false) => unreachable!(),
                        }
                    }
                };

                if let Some(fault) = fault {
                    self.fault_locally(fault).await;
                    return Ok(());
                }

                let ack = self.inner.write().await.take_ack();
                self.send_best_effort(WireMessage {
                    ack: Some(ack),
                    body: WireBody::TerminateSequenceResponse { session_id },
                })
                .await;
                self.remote_terminate_wait.set();
            }
            (ReliableMessagingVersion::Legacy, None) => {
                let clean = self.inner.write().await.input.terminate();
                if clean {
                    self.remote_terminate_wait.set();
                }
                else {
                    self.fault_locally(WsrmFault::SequenceTerminatedEarly { session_id }).await;
                }
            }
            _ => {
                self.fault_locally(WsrmFault::UnsupportedTerminateSequence { session_id }).await;
            }
        }
        Ok(())
    }

    /// Graceful bilateral shutdown. Blocks until both directions completed their
    ///  handshake or the close timeout elapses; a timeout or handshake failure faults
    ///  the session.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.session.begin_close();
        let timeout = self.config.close_timeout;

        let result = match self.config.version {
            ReliableMessagingVersion::Current => self.close_current(timeout).await,
            ReliableMessagingVersion::Legacy => self.close_legacy(timeout).await,
        };

        match result {
            Ok(()) => {
                self.session.on_closed();
                self.binder.close(timeout).await.ok();
                info!("reliable duplex session closed (in {})", self.session.input_id());
                Ok(())
            }
            Err(e) => {
                if !self.session.is_terminal() {
                    let output_id = self.session.output_id();
                    self.fault_locally(WsrmFault::SequenceTerminatedEarly {
                        session_id: output_id,
                    })
                    .await;
                }
                Err(e)
            }
        }
    }

    /// Current variant: declare the final number, drain in-flight sends, then the
    ///  two-step CloseSequence / TerminateSequence exchange, and finally wait for the
    ///  peer to terminate its own sequence.
    async fn close_current(&self, timeout: Duration) -> anyhow::Result<()> {
        let last = self.output.declare_last().await;
        self.output.all_acked().wait(timeout).await?;

        let output_id = self.session.output_id();
        self.send_control(WireMessage::close_sequence(output_id, last), timeout).await?;
        self.close_response_wait.wait(timeout).await?;

        self.send_control(WireMessage::terminate_sequence(output_id, Some(last)), timeout).await?;
        self.terminate_response_wait.wait(timeout).await?;

        self.remote_terminate_wait.wait(timeout).await
    }

    /// Legacy variant: the last-message marker consumes a sequence number of its own;
    ///  once everything is acknowledged a single one-way TerminateSequence is exchanged
    ///  in each direction.
    async fn close_legacy(&self, timeout: Duration) -> anyhow::Result<()> {
        match self.output.add_last_marker(timeout).await {
            Ok(()) => {}
            Err(SendError::Fault(fault)) => {
                let error = fault.to_error();
                self.fault_locally(fault).await;
                return Err(error);
            }
            Err(e) => return Err(e.into()),
        }
        self.output.all_acked().wait(timeout).await?;

        let output_id = self.session.output_id();
        self.send_control(WireMessage::terminate_sequence(output_id, None), timeout).await?;

        self.remote_terminate_wait.wait(timeout).await
    }

    /// Tears the channel down without handshake traffic, unblocking every waiter.
    pub async fn abort(&self) {
        self.unblock_all_waiters();
        self.output.abort().await;
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.pending_ack_handle.take() {
            handle.abort();
        }
        inner.delivery.dispose();
    }

    async fn send_ack_now(&self) {
        let ack = self.inner.write().await.take_ack();
        trace!("acknowledging {}", ack.ranges);
        self.send_best_effort(WireMessage::acknowledgement(ack)).await;
    }

    /// Starts the batching timer unless one is already pending.
    async fn schedule_ack(&self) {
        let mut inner = self.inner.write().await;
        if inner.pending_ack_handle.is_some() {
            return;
        }

        let inner_arc = self.inner.clone();
        let binder = self.binder.clone();
        let delay = self.config.acknowledgement_interval;
        let send_timeout = self.config.send_timeout;

        inner.pending_ack_handle = Some(tokio::spawn(async move {
            time::sleep(delay).await;

            let ack = {
                let mut inner = inner_arc.write().await;
                inner.pending_ack_handle = None;
                inner.unacked_count = 0;
                inner.build_ack()
            };
            trace!("acknowledging {} (batched)", ack.ranges);
            if let Err(e) = binder.send(WireMessage::acknowledgement(ack), send_timeout).await {
                debug!("failed to send batched acknowledgement: {}", e);
            }
        }));
    }

    /// Control messages get the same bounded retry as application messages.
    async fn send_control(&self, message: WireMessage, timeout: Duration) -> anyhow::Result<()> {
        match self.output.send_with_retry(message, timeout).await {
            Ok(()) => Ok(()),
            Err(SendError::Fault(fault)) => {
                let error = fault.to_error();
                self.fault_locally(fault).await;
                Err(error)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Acknowledgements and heartbeats are fire-and-forget, the peer's retry covers loss.
    async fn send_best_effort(&self, message: WireMessage) {
        if let Err(e) = self.binder.send(message, self.config.send_timeout).await {
            debug!("best-effort protocol send failed: {}", e);
        }
    }

    /// The single local-fault funnel: faults the session, notifies the peer when
    ///  possible, and unblocks every waiter exactly once.
    async fn fault_locally(&self, fault: WsrmFault) {
        let Some(fault_message) = self.session.on_local_fault(fault) else {
            return;
        };
        self.unblock_all_waiters();
        self.output.abort().await;
        {
            let mut inner = self.inner.write().await;
            if let Some(handle) = inner.pending_ack_handle.take() {
                handle.abort();
            }
            inner.delivery.dispose();
        }
        self.binder.send(fault_message, self.config.send_timeout).await.ok();
        self.binder.close(self.config.close_timeout).await.ok();
    }

    fn unblock_all_waiters(&self) {
        self.close_response_wait.fault();
        self.terminate_response_wait.fault();
        self.remote_terminate_wait.fault();
    }

    #[cfg(test)]
    async fn input_ranges(&self) -> crate::sequence_range::SequenceRangeCollection {
        self.inner.read().await.input.ranges().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionRole;
    use crate::fault::WsrmFault;
    use crate::session::SessionState;
    use async_trait::async_trait;
    use rstest::rstest;
    use tokio::runtime::Builder;

    /// Scripted in-memory transport: the test pushes inbound protocol messages and
    ///  inspects everything the channel sent.
    struct ScriptedBinder {
        inbound: Mutex<mpsc::UnboundedReceiver<WireMessage>>,
        sent: std::sync::Mutex<Vec<WireMessage>>,
    }

    impl ScriptedBinder {
        fn new() -> (Arc<ScriptedBinder>, mpsc::UnboundedSender<WireMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let binder = Arc::new(ScriptedBinder {
                inbound: Mutex::new(rx),
                sent: std::sync::Mutex::new(Vec::new()),
            });
            (binder, tx)
        }

        fn sent(&self) -> Vec<WireMessage> {
            self.sent.lock().unwrap().clone()
        }

        async fn wait_for_sent(
            &self,
            predicate: impl Fn(&WireMessage) -> bool,
        ) -> WireMessage {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    if let Some(m) = self.sent().iter().find(|m| predicate(m)) {
                        return m.clone();
                    }
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("expected message was never sent")
        }
    }

    #[async_trait]
    impl ReliableBinder for ScriptedBinder {
        async fn send(&self, message: WireMessage, _timeout: Duration) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn try_receive(&self) -> anyhow::Result<Option<WireMessage>> {
            Ok(self.inbound.lock().await.recv().await)
        }

        async fn close(&self, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn config(version: ReliableMessagingVersion, ordered: bool) -> ReliableSessionConfig {
        let mut config = ReliableSessionConfig::new(version, SessionRole::Client);
        config.ordered = ordered;
        config
    }

    struct Fixture {
        channel: Arc<ReliableDuplexChannel>,
        binder: Arc<ScriptedBinder>,
        peer: mpsc::UnboundedSender<WireMessage>,
        input_id: Uuid,
        output_id: Uuid,
    }

    fn fixture(config: ReliableSessionConfig) -> Fixture {
        let input_id = Uuid::new_v4();
        let output_id = Uuid::new_v4();
        let (binder, peer) = ScriptedBinder::new();
        let channel =
            ReliableDuplexChannel::new(config, input_id, output_id, binder.clone()).unwrap();
        {
            let channel = channel.clone();
            tokio::spawn(async move { channel.recv_loop().await });
        }
        Fixture { channel, binder, peer, input_id, output_id }
    }

    fn sequenced(session_id: Uuid, n: SequenceNumber) -> WireMessage {
        WireMessage::sequenced(SequencedMessage {
            session_id,
            sequence_number: n,
            is_last: false,
            payload: Some(Bytes::from(format!("m{}", n))),
        })
    }

    #[rstest]
    fn test_unordered_delivery_with_gap_and_duplicate() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            for n in [1, 2, 2, 4] {
                f.peer.send(sequenced(f.input_id, n)).unwrap();
            }

            let mut received = Vec::new();
            for _ in 0..3 {
                received.push(f.channel.receive(Duration::from_secs(5)).await.unwrap().unwrap());
            }
            assert_eq!(received, vec!["m1", "m2", "m4"]);

            // the duplicate was absorbed, nothing else is pending
            assert!(f.channel.receive(Duration::from_millis(20)).await.is_err());
            assert_eq!(format!("{}", f.channel.input_ranges().await), "{[1,2],[4,4]}");
        });
    }

    #[rstest]
    fn test_ordered_delivery_buffers_out_of_order_arrivals() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, true));

            for n in [3, 1, 2] {
                f.peer.send(sequenced(f.input_id, n)).unwrap();
            }

            let mut received = Vec::new();
            for _ in 0..3 {
                received.push(f.channel.receive(Duration::from_secs(5)).await.unwrap().unwrap());
            }
            assert_eq!(received, vec!["m1", "m2", "m3"]);
        });
    }

    #[rstest]
    fn test_ack_requested_triggers_immediate_acknowledgement() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer.send(sequenced(f.input_id, 1)).unwrap();
            f.peer.send(WireMessage::ack_requested(f.input_id)).unwrap();

            let ack_message = f
                .binder
                .wait_for_sent(|m| matches!(m.body, WireBody::AckOnly))
                .await;
            let ack = ack_message.ack.unwrap();
            assert_eq!(ack.session_id, f.input_id);
            assert_eq!(format!("{}", ack.ranges), "{[1,1]}");
            assert_eq!(ack.buffer_remaining, Some(7));
        });
    }

    #[rstest]
    fn test_acknowledgement_is_batched_behind_the_timer() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer.send(sequenced(f.input_id, 1)).unwrap();
            time::sleep(Duration::from_millis(20)).await;
            assert!(f.binder.sent().iter().all(|m| !matches!(m.body, WireBody::AckOnly)));

            // the acknowledgement interval (200ms) elapses
            f.binder.wait_for_sent(|m| matches!(m.body, WireBody::AckOnly)).await;
        });
    }

    #[rstest]
    fn test_full_window_forces_immediate_acknowledgement() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut cfg = config(ReliableMessagingVersion::Current, false);
            cfg.max_transfer_window_size = 2;
            let f = fixture(cfg);

            f.peer.send(sequenced(f.input_id, 1)).unwrap();
            f.peer.send(sequenced(f.input_id, 2)).unwrap();

            let ack_message =
                f.binder.wait_for_sent(|m| matches!(m.body, WireBody::AckOnly)).await;
            assert_eq!(format!("{}", ack_message.ack.unwrap().ranges), "{[1,2]}");
        });
    }

    #[rstest]
    fn test_inconsistent_close_and_terminate_numbers_fault_the_session() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer
                .send(WireMessage::close_sequence(f.input_id, 10))
                .unwrap();
            f.binder
                .wait_for_sent(|m| matches!(m.body, WireBody::CloseSequenceResponse { .. }))
                .await;

            f.peer
                .send(WireMessage::terminate_sequence(f.input_id, Some(9)))
                .unwrap();
            let fault_message = f
                .binder
                .wait_for_sent(|m| matches!(m.body, WireBody::Fault(_)))
                .await;

            match fault_message.body {
                WireBody::Fault(WsrmFault::InconsistentLastMessageNumber { session_id }) => {
                    assert_eq!(session_id, f.input_id)
                }
                other => panic!("expected InconsistentLastMessageNumber, got {:?}", other),
            }
            assert_eq!(
                f.channel.session().fault(),
                Some(WsrmFault::InconsistentLastMessageNumber { session_id: f.input_id })
            );
        });
    }

    #[rstest]
    fn test_repeated_close_with_different_last_number_faults_the_session() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer
                .send(WireMessage::close_sequence(f.input_id, 10))
                .unwrap();
            f.binder
                .wait_for_sent(|m| matches!(m.body, WireBody::CloseSequenceResponse { .. }))
                .await;

            // a repeated close must not silently change the declared final number
            f.peer
                .send(WireMessage::close_sequence(f.input_id, 12))
                .unwrap();
            let fault_message = f
                .binder
                .wait_for_sent(|m| matches!(m.body, WireBody::Fault(_)))
                .await;

            assert!(matches!(
                fault_message.body,
                WireBody::Fault(WsrmFault::InconsistentLastMessageNumber { .. })
            ));
            assert_eq!(
                f.channel.session().fault(),
                Some(WsrmFault::InconsistentLastMessageNumber { session_id: f.input_id })
            );
        });
    }

    #[rstest]
    fn test_repeated_close_with_the_same_last_number_is_answered_again() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            for _ in 0..2 {
                f.peer
                    .send(WireMessage::close_sequence(f.input_id, 10))
                    .unwrap();
            }
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let responses = f
                        .binder
                        .sent()
                        .iter()
                        .filter(|m| matches!(m.body, WireBody::CloseSequenceResponse { .. }))
                        .count();
                    if responses == 2 {
                        return;
                    }
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
            assert!(!f.channel.session().is_faulted());
        });
    }

    #[rstest]
    fn test_message_after_close_sequence_faults_with_sequence_closed() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer.send(sequenced(f.input_id, 1)).unwrap();
            f.peer.send(WireMessage::close_sequence(f.input_id, 1)).unwrap();
            f.binder
                .wait_for_sent(|m| matches!(m.body, WireBody::CloseSequenceResponse { .. }))
                .await;

            f.peer.send(sequenced(f.input_id, 2)).unwrap();
            let fault_message =
                f.binder.wait_for_sent(|m| matches!(m.body, WireBody::Fault(_))).await;
            assert!(matches!(
                fault_message.body,
                WireBody::Fault(WsrmFault::SequenceClosed { .. })
            ));
        });
    }

    #[rstest]
    fn test_close_handshake_current_variant() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            // the peer's side of the handshake, all queued up front (the wait objects
            //  latch, so arrival order relative to close() does not matter)
            f.peer
                .send(WireMessage {
                    ack: None,
                    body: WireBody::CloseSequenceResponse { session_id: f.output_id },
                })
                .unwrap();
            f.peer
                .send(WireMessage {
                    ack: None,
                    body: WireBody::TerminateSequenceResponse { session_id: f.output_id },
                })
                .unwrap();
            f.peer.send(WireMessage::close_sequence(f.input_id, 0)).unwrap();
            f.peer.send(WireMessage::terminate_sequence(f.input_id, Some(0))).unwrap();

            f.channel.close().await.unwrap();
            assert_eq!(f.channel.session().state(), SessionState::Closed);

            let sent = f.binder.sent();
            assert!(sent.iter().any(|m| matches!(
                m.body,
                WireBody::CloseSequence { last_msg_number: 0, .. }
            )));
            assert!(sent.iter().any(|m| matches!(
                m.body,
                WireBody::TerminateSequence { last_msg_number: Some(0), .. }
            )));
            assert!(sent
                .iter()
                .any(|m| matches!(m.body, WireBody::TerminateSequenceResponse { .. })));
        });
    }

    #[rstest]
    fn test_close_handshake_legacy_variant() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Legacy, false));

            let close = {
                let channel = f.channel.clone();
                tokio::spawn(async move { channel.close().await })
            };

            // the peer acknowledges the last-message marker once it shows up
            let marker = f
                .binder
                .wait_for_sent(|m| {
                    matches!(&m.body, WireBody::Sequenced(s) if s.is_last && s.payload.is_none())
                })
                .await;
            let marker_number = match marker.body {
                WireBody::Sequenced(s) => s.sequence_number,
                _ => unreachable!(),
            };
            assert_eq!(marker_number, 1);

            let mut ranges = crate::sequence_range::SequenceRangeCollection::new();
            ranges.merge(marker_number);
            f.peer
                .send(WireMessage::acknowledgement(AcknowledgementData {
                    session_id: f.output_id,
                    ranges,
                    is_final: false,
                    buffer_remaining: None,
                }))
                .unwrap();

            f.binder
                .wait_for_sent(|m| {
                    matches!(m.body, WireBody::TerminateSequence { last_msg_number: None, .. })
                })
                .await;

            // the peer finishes its own direction: last-message marker, then terminate
            f.peer
                .send(WireMessage::sequenced(SequencedMessage {
                    session_id: f.input_id,
                    sequence_number: 1,
                    is_last: true,
                    payload: None,
                }))
                .unwrap();
            f.peer.send(WireMessage::terminate_sequence(f.input_id, None)).unwrap();

            close.await.unwrap().unwrap();
            assert_eq!(f.channel.session().state(), SessionState::Closed);
        });
    }

    #[rstest]
    fn test_legacy_terminate_before_all_messages_is_an_early_termination() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Legacy, false));

            // a gap: 2 arrived but 1 did not
            f.peer.send(sequenced(f.input_id, 2)).unwrap();
            f.peer.send(WireMessage::terminate_sequence(f.input_id, None)).unwrap();

            let fault_message =
                f.binder.wait_for_sent(|m| matches!(m.body, WireBody::Fault(_))).await;
            assert!(matches!(
                fault_message.body,
                WireBody::Fault(WsrmFault::SequenceTerminatedEarly { .. })
            ));
        });
    }

    #[rstest]
    fn test_terminate_with_version_mismatch_is_unsupported() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Legacy, false));

            // a final number on the legacy variant is a protocol violation
            f.peer.send(WireMessage::terminate_sequence(f.input_id, Some(5))).unwrap();

            let fault_message =
                f.binder.wait_for_sent(|m| matches!(m.body, WireBody::Fault(_))).await;
            assert!(matches!(
                fault_message.body,
                WireBody::Fault(WsrmFault::UnsupportedTerminateSequence { .. })
            ));
        });
    }

    #[rstest]
    fn test_remote_fault_kills_the_session_without_reply() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer
                .send(WireMessage::fault(WsrmFault::SequenceTerminatedEarly {
                    session_id: f.output_id,
                }))
                .unwrap();

            tokio::time::timeout(Duration::from_secs(5), async {
                while !f.channel.session().is_faulted() {
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
            assert!(f.binder.sent().iter().all(|m| !matches!(m.body, WireBody::Fault(_))));
        });
    }

    #[rstest]
    fn test_transport_end_with_incomplete_sequence_faults() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.peer.send(sequenced(f.input_id, 2)).unwrap();
            time::sleep(Duration::from_millis(10)).await;
            drop(f.peer); // the transport ends the session

            tokio::time::timeout(Duration::from_secs(5), async {
                while !f.channel.session().is_faulted() {
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        });
    }

    #[rstest]
    fn test_send_and_acknowledgement_roundtrip() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            f.channel.send(Bytes::from_static(b"hello")).await.unwrap();
            let sent = f
                .binder
                .wait_for_sent(|m| matches!(m.body, WireBody::Sequenced(_)))
                .await;
            match sent.body {
                WireBody::Sequenced(m) => {
                    assert_eq!(m.session_id, f.output_id);
                    assert_eq!(m.sequence_number, 1);
                }
                _ => unreachable!(),
            }

            let mut ranges = crate::sequence_range::SequenceRangeCollection::new();
            ranges.merge(1);
            f.peer
                .send(WireMessage::acknowledgement(AcknowledgementData {
                    session_id: f.output_id,
                    ranges,
                    is_final: false,
                    buffer_remaining: Some(8),
                }))
                .unwrap();

            tokio::time::timeout(Duration::from_secs(5), async {
                while f.channel.output.pending_count().await > 0 {
                    time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .unwrap();
        });
    }

    #[rstest]
    fn test_abort_unblocks_a_pending_close() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let f = fixture(config(ReliableMessagingVersion::Current, false));

            let close = {
                let channel = f.channel.clone();
                tokio::spawn(async move { channel.close().await })
            };
            f.binder
                .wait_for_sent(|m| matches!(m.body, WireBody::CloseSequence { .. }))
                .await;

            f.channel.abort().await;
            assert!(close.await.unwrap().is_err());
        });
    }
}

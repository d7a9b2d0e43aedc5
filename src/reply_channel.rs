use crate::binder::{ReplyBinder, RequestHandle};
use crate::config::{ReliableMessagingVersion, ReliableSessionConfig};
use crate::control_messages::{AcknowledgementData, SequencedMessage, WireBody, WireMessage};
use crate::delivery_strategy::DeliveryStrategy;
use crate::fault::WsrmFault;
use crate::input_connection::ReliableInputConnection;
use crate::sequence_range::{SequenceNumber, SequenceRangeCollection};
use crate::session::{ReliableSession, SessionState};
use crate::wait_object::WaitObject;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// Lock ordering: a request context's own lock may be held while taking the channel
//  lock, never the other way around.

struct Inner {
    input_id: Uuid,
    output_id: Uuid,
    quota: usize,
    flow_control: bool,
    input: ReliableInputConnection,
    delivery: DeliveryStrategy<Arc<ReliableRequestContext>>,
    /// Pending requests, keyed by the peer's request sequence number. An entry is
    ///  retired only once the reply's acknowledgement is observed.
    requests_by_request_seq: FxHashMap<SequenceNumber, Arc<ReliableRequestContext>>,
    /// The same contexts, keyed by the assigned reply sequence number (only contexts
    ///  with a user reply appear here).
    requests_by_reply_seq: FxHashMap<SequenceNumber, Arc<ReliableRequestContext>>,
    next_reply_sequence_number: SequenceNumber,
    /// Legacy variant: the reply to the peer's last message lives outside the request
    ///  table and is tracked by `last_reply_acked`.
    last_reply: Option<Arc<ReliableRequestContext>>,
    last_reply_acked: bool,
    last_reply_sequence_number: Option<SequenceNumber>,
    contexts_aborted: bool,
}

impl Inner {
    fn build_ack(&self) -> AcknowledgementData {
        AcknowledgementData {
            session_id: self.input_id,
            ranges: self.input.ranges().clone(),
            is_final: self.input.is_last_known(),
            buffer_remaining: if self.flow_control {
                Some(self.quota - self.delivery.enqueued_count())
            }
            else {
                None
            },
        }
    }

    fn contains_request(&self, request_seq: SequenceNumber, version: ReliableMessagingVersion) -> bool {
        if self.requests_by_request_seq.contains_key(&request_seq) {
            return true;
        }
        if version == ReliableMessagingVersion::Legacy {
            if let Some(last_reply) = &self.last_reply {
                return last_reply.request_sequence_number == request_seq && !self.last_reply_acked;
            }
        }
        false
    }

    /// Legacy variant: the session's work is done once the peer's sequence is complete,
    ///  every reply is acknowledged, and the last reply is acknowledged too.
    fn is_messaging_completed(&self) -> bool {
        self.input.all_added() && self.requests_by_request_seq.is_empty() && self.last_reply_acked
    }
}

/// Latches the peer's close/terminate request until the local close replies to it.
///
/// Shutdown on a reply channel is inverted relative to duplex: the peer sends the
///  CloseSequence/TerminateSequence *requests*, and this side answers them - but only
///  once the local application initiated its own close. A retransmitted request after
///  the reply went out is answered immediately by the receive path instead.
struct ReplyWaiter {
    arrived: WaitObject,
    state: std::sync::Mutex<ReplyWaiterState>,
}

struct ReplyWaiterState {
    handle: Option<Box<dyn RequestHandle>>,
    replied: bool,
}

impl ReplyWaiter {
    fn new() -> ReplyWaiter {
        ReplyWaiter {
            arrived: WaitObject::new(),
            state: std::sync::Mutex::new(ReplyWaiterState { handle: None, replied: false }),
        }
    }

    /// Hands the peer's request to the waiter. Returns the handle back if the local
    ///  close already replied - the caller then answers this retransmission directly.
    #[allow(clippy::unwrap_used)]
    fn on_request(&self, handle: Box<dyn RequestHandle>) -> Option<Box<dyn RequestHandle>> {
        let mut state = self.state.lock().unwrap();
        if state.replied {
            return Some(handle);
        }
        if let Some(old) = state.handle.replace(handle) {
            // a retransmission before we replied supersedes the older transport request
            old.abandon();
        }
        self.arrived.set();
        None
    }

    /// Lets a local waiter pass without a request to answer (terminate arrived before
    ///  close, making the close step moot).
    #[allow(clippy::unwrap_used)]
    fn bypass(&self) {
        self.state.lock().unwrap().replied = true;
        self.arrived.set();
    }

    /// Blocks until the peer's request arrived, then yields the handle to answer it
    ///  (or `None` when bypassed).
    #[allow(clippy::unwrap_used)]
    async fn wait_for_request(
        &self,
        timeout: Duration,
    ) -> anyhow::Result<Option<Box<dyn RequestHandle>>> {
        self.arrived.wait(timeout).await?;
        let mut state = self.state.lock().unwrap();
        state.replied = true;
        Ok(state.handle.take())
    }

    #[allow(clippy::unwrap_used)]
    fn fault(&self) {
        self.arrived.fault();
        if let Some(handle) = self.state.lock().unwrap().handle.take() {
            handle.abandon();
        }
    }
}

struct ChannelCore {
    config: ReliableSessionConfig,
    session: ReliableSession,
    binder: Arc<dyn ReplyBinder>,
    inner: RwLock<Inner>,
    close_reply: ReplyWaiter,
    terminate_reply: ReplyWaiter,
    /// Legacy variant: set once `is_messaging_completed` holds; close blocks on it.
    messaging_complete: WaitObject,
}

/// A pending reliable request handed to the application.
///
/// A reliable request is in one of three states: known with an unknown outcome
///  (duplicate transport requests are held until the outcome is decided), known with a
///  recorded outcome (duplicates replay that outcome verbatim), or unknown (retired
///  after acknowledgement - duplicates get a plain acknowledgement). The recorded
///  outcome is one of: the user's reply, an ack-only reply after
///  [`close`](ReliableRequestContext::close), or aborted.
pub struct ReliableRequestContext {
    channel: Weak<ChannelCore>,
    request_sequence_number: SequenceNumber,
    payload: Bytes,
    state: Mutex<ContextState>,
}

struct ContextState {
    outcome_known: bool,
    aborted: bool,
    buffered_reply: Option<Bytes>,
    reply_sequence_number: Option<SequenceNumber>,
    is_last_reply: bool,
    /// Snapshot of the input ranges at capture time, used for ack-only outcomes.
    ack_ranges: Option<SequenceRangeCollection>,
    /// Transport requests (the original plus duplicates) awaiting the outcome.
    pending_handles: Vec<Box<dyn RequestHandle>>,
}

/// What `prepare_reply` decided for a request outcome.
enum Prepared {
    /// The outcome cannot be recorded now (channel closing, or the legacy last reply
    ///  before close); the context stays pending.
    NotNow,
    /// Outcome recorded; `assignment` is the reply sequence number for sequenced
    ///  replies, `None` for ack-only outcomes.
    Proceed { assignment: Option<(SequenceNumber, bool)> },
}

impl ReliableRequestContext {
    fn new(
        channel: &Arc<ChannelCore>,
        request_sequence_number: SequenceNumber,
        payload: Bytes,
        handle: Option<Box<dyn RequestHandle>>,
        ack_ranges: SequenceRangeCollection,
    ) -> Arc<ReliableRequestContext> {
        Arc::new(ReliableRequestContext {
            channel: Arc::downgrade(channel),
            request_sequence_number,
            payload,
            state: Mutex::new(ContextState {
                outcome_known: false,
                aborted: false,
                buffered_reply: None,
                reply_sequence_number: None,
                is_last_reply: false,
                ack_ranges: Some(ack_ranges),
                pending_handles: handle.into_iter().collect(),
            }),
        })
    }

    /// The request's application payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn request_sequence_number(&self) -> SequenceNumber {
        self.request_sequence_number
    }

    /// Records the user's reply as this request's outcome and sends it to every
    ///  transport request held so far. Duplicates arriving later replay it verbatim.
    pub async fn reply(&self, payload: Bytes) -> anyhow::Result<()> {
        self.reply_internal(Some(payload)).await
    }

    /// Records an ack-only outcome: the request is done without user data, the peer
    ///  gets an acknowledgement covering its sequence number.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.reply_internal(None).await
    }

    async fn reply_internal(&self, reply: Option<Bytes>) -> anyhow::Result<()> {
        let Some(core) = self.channel.upgrade() else {
            bail!("the channel backing this request is gone");
        };

        let mut state = self.state.lock().await;
        if state.aborted {
            bail!("the request context was aborted");
        }
        if state.outcome_known {
            return Ok(());
        }
        if reply.is_some() && state.buffered_reply.is_none() {
            state.buffered_reply = reply;
        }

        let prepared = match core
            .prepare_reply(self.request_sequence_number, state.buffered_reply.is_some())
            .await
        {
            Ok(prepared) => prepared,
            Err(fault) => {
                let error = fault.to_error();
                drop(state);
                core.fault_locally(fault, None).await;
                return Err(error);
            }
        };

        let Prepared::Proceed { assignment } = prepared else {
            return Ok(());
        };
        if let Some((number, is_last)) = assignment {
            state.reply_sequence_number = Some(number);
            state.is_last_reply = is_last;
        }
        state.outcome_known = true;
        let handles = std::mem::take(&mut state.pending_handles);
        let message = core.build_outcome_message(&state).await;
        drop(state);

        for handle in handles {
            if let Err(e) = handle.reply(message.clone(), core.config.send_timeout).await {
                debug!("failed to send reply for request #{}: {}", self.request_sequence_number, e);
            }
        }
        Ok(())
    }

    /// Drops the request without an outcome. Aborting a request whose sequence number
    ///  the channel still tracks is fatal to the session - exactly-once cannot be
    ///  guaranteed anymore.
    pub async fn abort(&self) {
        let was_known = {
            let mut state = self.state.lock().await;
            let was_known = state.outcome_known;
            state.outcome_known = true;
            state.aborted = true;
            for handle in std::mem::take(&mut state.pending_handles) {
                handle.abandon();
            }
            was_known
        };

        if was_known {
            return;
        }
        if let Some(core) = self.channel.upgrade() {
            let pending = core
                .inner
                .read()
                .await
                .contains_request(self.request_sequence_number, core.config.version);
            if pending {
                core.fault_with_error(anyhow::anyhow!(
                    "request context #{} aborted while still pending",
                    self.request_sequence_number
                ))
                .await;
            }
        }
    }

    /// Abort initiated by the channel itself (teardown); never re-faults the session.
    async fn abort_silently(&self) {
        let mut state = self.state.lock().await;
        state.outcome_known = true;
        state.aborted = true;
        for handle in std::mem::take(&mut state.pending_handles) {
            handle.abandon();
        }
    }

    /// For a duplicate: returns the handle back if the outcome is recorded (the caller
    ///  replays it); otherwise the duplicate's handle joins the held set.
    async fn check_for_reply_or_add_handle(
        &self,
        handle: Box<dyn RequestHandle>,
    ) -> Option<Box<dyn RequestHandle>> {
        let mut state = self.state.lock().await;
        if state.outcome_known {
            return Some(handle);
        }
        state.pending_handles.push(handle);
        None
    }

    async fn set_ack_ranges(&self, ranges: SequenceRangeCollection) {
        let mut state = self.state.lock().await;
        if state.ack_ranges.is_none() {
            state.ack_ranges = Some(ranges);
        }
    }

    /// Replays the recorded outcome on a duplicate's transport request.
    async fn send_recorded_reply(&self, handle: Box<dyn RequestHandle>) {
        let Some(core) = self.channel.upgrade() else {
            handle.abandon();
            return;
        };
        let message = {
            let state = self.state.lock().await;
            if state.aborted {
                handle.abandon();
                return;
            }
            core.build_outcome_message(&state).await
        };
        if let Err(e) = handle.reply(message, core.config.send_timeout).await {
            debug!("failed to replay reply for request #{}: {}", self.request_sequence_number, e);
        }
    }
}

impl ChannelCore {
    /// Assigns the outcome's reply sequence number under the channel lock.
    ///
    /// Legacy variant, last request: the context becomes the last-reply pseudo-entry
    ///  outside the request table, and can only complete while the channel is closing
    ///  with the peer's sequence fully received. A reply without user data needs no
    ///  acknowledgement and counts as acknowledged immediately.
    async fn prepare_reply(
        &self,
        request_seq: SequenceNumber,
        has_reply: bool,
    ) -> Result<Prepared, WsrmFault> {
        let mut inner = self.inner.write().await;

        if self.session.is_terminal() {
            return Ok(Prepared::NotNow);
        }

        let legacy = self.config.version == ReliableMessagingVersion::Legacy;
        let is_last_request = legacy && inner.input.last() == Some(request_seq);

        if is_last_request {
            inner.requests_by_request_seq.remove(&request_seq);
            let can_reply =
                inner.input.all_added() && self.session.state() == SessionState::Closing;
            if !can_reply {
                return Ok(Prepared::NotNow);
            }
        }
        else {
            if self.session.state() == SessionState::Closing {
                return Ok(Prepared::NotNow);
            }
            if !has_reply {
                inner.requests_by_request_seq.remove(&request_seq);
                return Ok(Prepared::Proceed { assignment: None });
            }
        }

        // MAX is the unassignable rollover sentinel, never handed out
        let number = inner.next_reply_sequence_number + 1;
        if number == SequenceNumber::MAX {
            return Err(WsrmFault::MessageNumberRollover { session_id: inner.output_id });
        }
        inner.next_reply_sequence_number = number;

        if is_last_request {
            if !has_reply {
                // a last reply without user data needs no acknowledgement
                inner.last_reply_acked = true;
            }
            inner.last_reply_sequence_number = Some(number);
            Ok(Prepared::Proceed { assignment: Some((number, true)) })
        }
        else {
            // retired only once the peer acknowledges this reply number
            if let Some(context) = inner.requests_by_request_seq.get(&request_seq).cloned() {
                inner.requests_by_reply_seq.insert(number, context);
            }
            Ok(Prepared::Proceed { assignment: Some((number, false)) })
        }
    }

    /// The transport reply for a recorded outcome: the buffered user reply (or legacy
    ///  last-reply marker) as a sequenced message with a live acknowledgement header,
    ///  or a plain acknowledgement from the capture-time snapshot.
    async fn build_outcome_message(&self, state: &ContextState) -> WireMessage {
        let inner = self.inner.read().await;
        match state.reply_sequence_number {
            Some(number) => WireMessage::sequenced(SequencedMessage {
                session_id: inner.output_id,
                sequence_number: number,
                is_last: state.is_last_reply,
                payload: state.buffered_reply.clone(),
            })
            .with_ack(inner.build_ack()),
            None => {
                let ranges = state
                    .ack_ranges
                    .clone()
                    .unwrap_or_else(|| inner.input.ranges().clone());
                WireMessage::acknowledgement(AcknowledgementData {
                    session_id: inner.input_id,
                    ranges,
                    is_final: inner.input.is_last_known(),
                    buffer_remaining: if inner.flow_control {
                        Some(inner.quota - inner.delivery.enqueued_count())
                    }
                    else {
                        None
                    },
                })
            }
        }
    }

    /// Registers the reply-acknowledgement bookkeeping: acknowledged reply numbers
    ///  retire both request-table entries.
    async fn process_acknowledgment(&self, ranges: &SequenceRangeCollection) {
        let mut inner = self.inner.write().await;
        if self.session.is_terminal() {
            return;
        }

        let retired = inner
            .requests_by_reply_seq
            .iter()
            .filter(|(reply_seq, _)| ranges.contains(**reply_seq))
            .map(|(reply_seq, context)| (*reply_seq, context.request_sequence_number))
            .collect::<Vec<_>>();
        for (reply_seq, request_seq) in retired {
            inner.requests_by_reply_seq.remove(&reply_seq);
            inner.requests_by_request_seq.remove(&request_seq);
            trace!("reply #{} acknowledged, request #{} retired", reply_seq, request_seq);
        }

        if self.config.version == ReliableMessagingVersion::Legacy && !inner.last_reply_acked {
            if let Some(last_reply_seq) = inner.last_reply_sequence_number {
                inner.last_reply_acked = ranges.contains(last_reply_seq);
            }
        }
    }

    async fn abort_contexts(&self) {
        let contexts = {
            let mut inner = self.inner.write().await;
            if inner.contexts_aborted {
                return;
            }
            inner.contexts_aborted = true;

            let mut contexts =
                inner.requests_by_request_seq.values().cloned().collect::<Vec<_>>();
            inner.requests_by_request_seq.clear();
            inner.requests_by_reply_seq.clear();
            if let Some(last_reply) = inner.last_reply.take() {
                contexts.push(last_reply);
            }
            inner.delivery.dispose();
            contexts
        };

        for context in contexts {
            context.abort_silently().await;
        }
    }

    fn unblock_all_waiters(&self) {
        self.close_reply.fault();
        self.terminate_reply.fault();
        self.messaging_complete.fault();
    }

    /// The single local-fault funnel: faults the session, unblocks every waiter, and
    ///  delivers the fault as a direct reply when a request context is at hand,
    ///  unsolicited otherwise.
    async fn fault_locally(&self, fault: WsrmFault, handle: Option<Box<dyn RequestHandle>>) {
        let Some(fault_message) = self.session.on_local_fault(fault) else {
            if let Some(handle) = handle {
                handle.abandon();
            }
            return;
        };
        self.unblock_all_waiters();
        self.abort_contexts().await;

        match handle {
            Some(handle) => {
                handle.reply(fault_message, self.config.send_timeout).await.ok();
            }
            None => {
                self.binder.send(fault_message, self.config.send_timeout).await.ok();
            }
        }
        self.binder.close(self.config.close_timeout).await.ok();
    }

    /// Like [`fault_locally`](Self::fault_locally), for errors outside the protocol's
    ///  fault taxonomy - nothing is sent to the peer.
    async fn fault_with_error(&self, error: anyhow::Error) {
        self.session.on_unknown_exception(&error);
        self.unblock_all_waiters();
        self.abort_contexts().await;
        self.binder.close(self.config.close_timeout).await.ok();
    }
}

/// The reply-channel orchestrator: the server side of a request/reply reliable session.
///
/// Inbound protocol messages arrive bound to transport requests that each expect exactly
///  one reply; sequenced requests are handed to the application as
///  [`ReliableRequestContext`]s, and every other protocol message is answered directly.
///  Acknowledgements for this side's replies ride on the ack headers of the peer's
///  requests.
pub struct ReliableReplyChannel {
    core: Arc<ChannelCore>,
    inbound: Mutex<mpsc::UnboundedReceiver<Arc<ReliableRequestContext>>>,
}

impl ReliableReplyChannel {
    pub fn new(
        config: ReliableSessionConfig,
        input_id: Uuid,
        output_id: Uuid,
        binder: Arc<dyn ReplyBinder>,
    ) -> anyhow::Result<ReliableReplyChannel> {
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

        let core = Arc::new(ChannelCore {
            session,
            binder,
            inner: RwLock::new(Inner {
                input_id,
                output_id,
                quota: config.max_transfer_window_size,
                flow_control: config.flow_control,
                input: ReliableInputConnection::new(config.version),
                delivery,
                requests_by_request_seq: FxHashMap::default(),
                requests_by_reply_seq: FxHashMap::default(),
                next_reply_sequence_number: 0,
                last_reply: None,
                last_reply_acked: false,
                last_reply_sequence_number: None,
                contexts_aborted: false,
            }),
            close_reply: ReplyWaiter::new(),
            terminate_reply: ReplyWaiter::new(),
            messaging_complete: WaitObject::new(),
            config,
        });
        info!("reliable reply session opened (in {} / out {})", input_id, output_id);
        Ok(ReliableReplyChannel { core, inbound: Mutex::new(inbound) })
    }

    pub fn session(&self) -> &ReliableSession {
        &self.core.session
    }

    /// The next released inbound request. `Ok(None)` means the inbound side ended.
    pub async fn receive(
        &self,
        timeout: Duration,
    ) -> anyhow::Result<Option<Arc<ReliableRequestContext>>> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Err(_) => bail!("timed out waiting for an inbound request"),
            Ok(None) => Ok(None),
            Ok(Some(context)) => {
                self.core.inner.write().await.delivery.dispatched();
                Ok(Some(context))
            }
        }
    }

    /// Continuously pumps inbound transport requests until the transport or the
    ///  session ends. Spawn exactly once per channel.
    pub async fn recv_loop(&self) {
        debug!("starting receive loop (session in {})", self.core.session.input_id());

        loop {
            match self.core.binder.try_receive().await {
                Ok(Some((message, handle))) => {
                    if let Err(e) = self.handle_request(message, handle).await {
                        self.core.fault_with_error(e).await;
                        break;
                    }
                    if self.core.config.version == ReliableMessagingVersion::Legacy
                        && self.core.inner.read().await.is_messaging_completed()
                    {
                        self.core.messaging_complete.set();
                    }
                }
                Ok(None) => {
                    self.on_transport_ended().await;
                    break;
                }
                Err(e) => {
                    self.core.fault_with_error(e).await;
                    break;
                }
            }

            if self.core.session.is_terminal() {
                break;
            }
        }
        debug!("receive loop ended (session in {})", self.core.session.input_id());
    }

    async fn on_transport_ended(&self) {
        let clean = self.core.inner.write().await.input.terminate();
        if !clean && !self.core.session.is_terminal() {
            let input_id = self.core.session.input_id();
            self.core
                .fault_locally(WsrmFault::SequenceTerminatedEarly { session_id: input_id }, None)
                .await;
        }
    }

    async fn handle_request(
        &self,
        message: WireMessage,
        handle: Box<dyn RequestHandle>,
    ) -> anyhow::Result<()> {
        if let Some(ack) = &message.ack {
            if ack.session_id == self.core.session.output_id() {
                self.core.process_acknowledgment(&ack.ranges).await;
            }
            else {
                warn!("dropping acknowledgement for unknown sequence {}", ack.session_id);
            }
        }

        match message.body {
            WireBody::AckOnly => {
                handle.abandon();
                Ok(())
            }
            WireBody::Sequenced(m) => self.process_sequenced(m, handle).await,
            WireBody::AckRequested { session_id } => {
                if session_id == self.core.session.input_id() {
                    let ack = self.core.inner.read().await.build_ack();
                    self.reply_best_effort(handle, WireMessage::acknowledgement(ack)).await;
                }
                else {
                    handle.abandon();
                }
                Ok(())
            }
            WireBody::CloseSequence { session_id, last_msg_number } => {
                if session_id == self.core.session.input_id() {
                    self.process_shutdown_request(false, last_msg_number, handle).await;
                }
                else {
                    handle.abandon();
                }
                Ok(())
            }
            WireBody::TerminateSequence { session_id, last_msg_number } => {
                match (self.core.config.version, last_msg_number) {
                    (ReliableMessagingVersion::Legacy, None) => {
                        self.process_terminate_legacy(handle).await
                    }
                    (ReliableMessagingVersion::Current, Some(last))
                        if session_id == self.core.session.input_id() =>
                    {
                        self.process_shutdown_request(true, last, handle).await;
                        Ok(())
                    }
                    _ => {
                        let input_id = self.core.session.input_id();
                        self.core
                            .fault_locally(
                                WsrmFault::UnsupportedTerminateSequence { session_id: input_id },
                                Some(handle),
                            )
                            .await;
                        Ok(())
                    }
                }
            }
            WireBody::Fault(fault) => {
                self.core.session.on_remote_fault(fault);
                self.core.unblock_all_waiters();
                self.core.abort_contexts().await;
                handle.abandon();
                Ok(())
            }
            WireBody::CloseSequenceResponse { .. } | WireBody::TerminateSequenceResponse { .. } => {
                warn!("dropping unexpected shutdown response on a reply channel");
                handle.abandon();
                Ok(())
            }
        }
    }

    async fn process_sequenced(
        &self,
        message: SequencedMessage,
        handle: Box<dyn RequestHandle>,
    ) -> anyhow::Result<()> {
        if message.session_id != self.core.session.input_id() {
            warn!("dropping sequenced request for unknown sequence {}", message.session_id);
            handle.abandon();
            return Ok(());
        }

        let legacy = self.core.config.version == ReliableMessagingVersion::Legacy;
        let n = message.sequence_number;
        let is_last = legacy && message.is_last;
        // the legacy standalone last-marker carries no application payload
        let is_last_only = is_last && message.payload.is_none();

        enum Action {
            Fault(WsrmFault, Box<dyn RequestHandle>),
            /// Current variant: a message past close is answered with a fault-shaped
            ///  reply but the session survives.
            ReplySequenceClosed(Box<dyn RequestHandle>),
            Duplicate(Arc<ReliableRequestContext>, Box<dyn RequestHandle>),
            Captured { context: Arc<ReliableRequestContext>, is_last_only: bool },
            Drop(Box<dyn RequestHandle>),
        }

        let action = {
            let mut inner = self.core.inner.write().await;

            if self.core.session.is_terminal() {
                handle.abandon();
                return Ok(());
            }

            let is_dupe = inner.input.ranges().contains(n);

            if !inner.input.is_valid(n, is_last) {
                if legacy {
                    Action::Fault(
                        WsrmFault::LastMessageNumberExceeded { session_id: inner.input_id },
                        handle,
                    )
                }
                else {
                    Action::ReplySequenceClosed(handle)
                }
            }
            else if is_dupe {
                let context = match inner.requests_by_request_seq.get(&n) {
                    Some(context) => Some(context.clone()),
                    None => inner
                        .last_reply
                        .as_ref()
                        .filter(|last| last.request_sequence_number == n)
                        .cloned(),
                };
                match context {
                    Some(context) => {
                        let ranges = inner.input.ranges().clone();
                        drop(inner);
                        context.set_ack_ranges(ranges).await;
                        Action::Duplicate(context, handle)
                    }
                    None => {
                        // retired long ago - a plain acknowledgement covering the
                        //  duplicate's number is the recorded outcome
                        Action::Drop(handle)
                    }
                }
            }
            else if self.core.session.state() == SessionState::Closing && !is_last_only {
                if legacy {
                    Action::Fault(
                        WsrmFault::SequenceClosed { session_id: inner.input_id },
                        handle,
                    )
                }
                else {
                    Action::ReplySequenceClosed(handle)
                }
            }
            // In the unordered case no more than MAX_SEQUENCE_RANGES disjoint ranges are
            //  accepted, bounding the serialized ack size; ordered delivery's window
            //  quota bounds this on its own.
            else if inner.delivery.can_enqueue(n)
                && inner.requests_by_reply_seq.len() < inner.quota
                && (self.core.config.ordered || inner.input.can_merge(n))
            {
                inner.input.merge(n, is_last);
                let ranges = inner.input.ranges().clone();
                let context = ReliableRequestContext::new(
                    &self.core,
                    n,
                    message.payload.clone().unwrap_or_default(),
                    Some(handle),
                    ranges,
                );
                if is_last_only {
                    inner.last_reply = Some(context.clone());
                }
                else {
                    inner.delivery.enqueue(context.clone(), n);
                    inner.requests_by_request_seq.insert(n, context.clone());
                }
                Action::Captured { context, is_last_only }
            }
            else {
                trace!("dropping request #{}, no buffer capacity", n);
                Action::Drop(handle)
            }
        };

        match action {
            Action::Fault(fault, handle) => {
                self.core.fault_locally(fault, Some(handle)).await;
            }
            Action::ReplySequenceClosed(handle) => {
                let (input_id, ack) = {
                    let inner = self.core.inner.read().await;
                    (inner.input_id, inner.build_ack())
                };
                let message = WireMessage::fault(WsrmFault::SequenceClosed {
                    session_id: input_id,
                })
                .with_ack(ack);
                self.reply_best_effort(handle, message).await;
            }
            Action::Duplicate(context, handle) => {
                trace!("duplicate request #{}", n);
                if let Some(handle) = context.check_for_reply_or_add_handle(handle).await {
                    context.send_recorded_reply(handle).await;
                }
            }
            Action::Captured { context, is_last_only } => {
                if is_last_only {
                    // the marker needs an outcome of its own, recorded at close time
                    context.close().await?;
                }
            }
            Action::Drop(handle) => {
                let ack = self.core.inner.read().await.build_ack();
                self.reply_best_effort(handle, WireMessage::acknowledgement(ack)).await;
            }
        }
        Ok(())
    }

    /// The shared CloseSequence / TerminateSequence handling of the current variant.
    ///
    /// Fault ladder: a declared final number below something already seen, shutdown
    ///  while replies await acknowledgement, and close/terminate declaring different
    ///  final numbers each kill the session; a terminate before the peer's sequence is
    ///  complete is the peer's fault and is answered with a terminate of our own.
    async fn process_shutdown_request(
        &self,
        is_terminate: bool,
        last: SequenceNumber,
        handle: Box<dyn RequestHandle>,
    ) {
        let mut have_all_reply_acks = true;
        let mut is_last_large_enough = true;
        let mut is_last_consistent = true;
        let mut remote_terminated_early = false;

        {
            let mut inner = self.core.inner.write().await;
            if !inner.input.is_last_known() {
                if inner.requests_by_request_seq.is_empty() {
                    if is_terminate {
                        match inner.input.set_terminate_sequence_last(last) {
                            (true, _) => {}
                            (false, true) => remote_terminated_early = true,
                            (false, false) => is_last_large_enough = false,
                        }
                    }
                    else {
                        is_last_large_enough = inner.input.set_close_sequence_last(last);
                    }
                    if is_last_large_enough && !remote_terminated_early {
                        inner.delivery.dispose();
                    }
                }
                else {
                    have_all_reply_acks = false;
                }
            }
            else {
                is_last_consistent = inner.input.last() == Some(last);
            }
        }

        let input_id = self.core.session.input_id();
        let output_id = self.core.session.output_id();

        let fault = if !is_last_large_enough {
            Some(WsrmFault::SmallLastMessageNumber { session_id: input_id })
        }
        else if !have_all_reply_acks {
            Some(WsrmFault::NotAllRepliesAcknowledged { session_id: output_id })
        }
        else if !is_last_consistent {
            Some(WsrmFault::InconsistentLastMessageNumber { session_id: input_id })
        }
        else {
            None
        };

        if remote_terminated_early {
            // the peer gave up on its own sequence: answer with a terminate of our own,
            //  then treat it as a fault from the remote side
            let ack = self.core.inner.read().await.build_ack();
            self.reply_best_effort(
                handle,
                WireMessage::terminate_sequence(output_id, None).with_ack(ack),
            )
            .await;
            self.core
                .session
                .on_remote_fault(WsrmFault::SequenceTerminatedEarly { session_id: input_id });
            self.core.unblock_all_waiters();
            self.core.abort_contexts().await;
            return;
        }

        if let Some(fault) = fault {
            self.core.fault_locally(fault, Some(handle)).await;
            return;
        }

        if is_terminate {
            // a terminate before any close makes the close step moot
            self.core.close_reply.bypass();
        }

        let waiter =
            if is_terminate { &self.core.terminate_reply } else { &self.core.close_reply };
        if let Some(handle) = waiter.on_request(handle) {
            // already answered once - this is a retransmission
            let message = self.core.build_shutdown_response(is_terminate).await;
            self.reply_best_effort(handle, message).await;
            if is_terminate {
                self.core.on_terminate_completed().await;
            }
        }
    }

    async fn process_terminate_legacy(&self, handle: Box<dyn RequestHandle>) -> anyhow::Result<()> {
        let (is_terminate_early, have_all_reply_acks) = {
            let mut inner = self.core.inner.write().await;
            let clean = inner.input.terminate();
            (!clean, inner.requests_by_request_seq.is_empty())
        };

        let input_id = self.core.session.input_id();
        let fault = if is_terminate_early {
            Some(WsrmFault::SequenceTerminatedEarly { session_id: input_id })
        }
        else if !have_all_reply_acks {
            Some(WsrmFault::NotAllRepliesAcknowledged { session_id: input_id })
        }
        else {
            None
        };

        if let Some(fault) = fault {
            self.core.fault_locally(fault, Some(handle)).await;
            return Ok(());
        }

        // answered with a terminate for our own reply sequence
        let (output_id, ack) = {
            let inner = self.core.inner.read().await;
            (inner.output_id, inner.build_ack())
        };
        self.reply_best_effort(
            handle,
            WireMessage::terminate_sequence(output_id, None).with_ack(ack),
        )
        .await;
        Ok(())
    }

    /// Graceful close. Current variant: wait for (and answer) the peer's CloseSequence
    ///  and TerminateSequence requests. Legacy variant: send the held-back last reply,
    ///  then wait until messaging completed.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.check_close_valid().await?;
        self.core.session.begin_close();
        let timeout = self.core.config.close_timeout;

        let result = match self.core.config.version {
            ReliableMessagingVersion::Current => self.close_current(timeout).await,
            ReliableMessagingVersion::Legacy => self.close_legacy(timeout).await,
        };

        match result {
            Ok(()) => {
                self.core.session.on_closed();
                self.core.inner.write().await.delivery.dispose();
                self.core.binder.close(timeout).await.ok();
                info!("reliable reply session closed (in {})", self.core.session.input_id());
                Ok(())
            }
            Err(e) => {
                if !self.core.session.is_terminal() {
                    let input_id = self.core.session.input_id();
                    self.core
                        .fault_locally(
                            WsrmFault::SequenceTerminatedEarly { session_id: input_id },
                            None,
                        )
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Closing with requests the application never resolved is a protocol failure.
    async fn check_close_valid(&self) -> anyhow::Result<()> {
        let inner = self.core.inner.read().await;
        // every request with a prepared reply is in both tables, so a size mismatch
        //  means requests whose outcome the application never decided
        let unresolved =
            inner.requests_by_request_seq.len() != inner.requests_by_reply_seq.len();
        let legacy_gaps = self.core.config.version == ReliableMessagingVersion::Legacy
            && inner.input.ranges().count() > 1;

        if unresolved || legacy_gaps {
            drop(inner);
            let input_id = self.core.session.input_id();
            let fault = WsrmFault::SequenceClosed { session_id: input_id };
            let error = fault.to_error();
            self.core.fault_locally(fault, None).await;
            return Err(error);
        }
        Ok(())
    }

    async fn close_current(&self, timeout: Duration) -> anyhow::Result<()> {
        if let Some(handle) = self.core.close_reply.wait_for_request(timeout).await? {
            let message = self.core.build_shutdown_response(false).await;
            handle.reply(message, self.core.config.send_timeout).await?;
        }

        if let Some(handle) = self.core.terminate_reply.wait_for_request(timeout).await? {
            let message = self.core.build_shutdown_response(true).await;
            handle.reply(message, self.core.config.send_timeout).await?;
        }
        self.core.on_terminate_completed().await;
        Ok(())
    }

    async fn close_legacy(&self, timeout: Duration) -> anyhow::Result<()> {
        let last_reply = self.core.inner.read().await.last_reply.clone();
        if let Some(last_reply) = last_reply {
            last_reply.reply_internal(None).await?;
        }
        self.core.messaging_complete.wait(timeout).await
    }

    /// Tears the channel down without handshake traffic, unblocking every waiter.
    pub async fn abort(&self) {
        self.core.unblock_all_waiters();
        self.core.abort_contexts().await;
    }

    async fn reply_best_effort(&self, handle: Box<dyn RequestHandle>, message: WireMessage) {
        if let Err(e) = handle.reply(message, self.core.config.send_timeout).await {
            debug!("best-effort protocol reply failed: {}", e);
        }
    }

    #[cfg(test)]
    async fn pending_request_count(&self) -> usize {
        self.core.inner.read().await.requests_by_request_seq.len()
    }

    #[cfg(test)]
    async fn set_next_reply_sequence_number(&self, n: SequenceNumber) {
        self.core.inner.write().await.next_reply_sequence_number = n;
    }
}

impl ChannelCore {
    async fn build_shutdown_response(&self, is_terminate: bool) -> WireMessage {
        let inner = self.inner.read().await;
        let body = if is_terminate {
            WireBody::TerminateSequenceResponse { session_id: inner.input_id }
        }
        else {
            WireBody::CloseSequenceResponse { session_id: inner.input_id }
        };
        WireMessage { ack: Some(inner.build_ack()), body }
    }

    /// Once the terminate exchange completed with the sequence closed, the input side
    ///  is fully drained.
    async fn on_terminate_completed(&self) {
        let mut inner = self.inner.write().await;
        if self.config.version == ReliableMessagingVersion::Current
            && inner.input.is_sequence_closed()
        {
            inner.input.terminate();
        }
    }
}

//! A reliable, optionally-ordered, exactly-once session protocol layered on top of an
//!  unreliable duplex or request/reply message channel (WS-ReliableMessaging style).
//!
//! Two endpoints share a monotonically-numbered *sequence* of application messages per
//!  direction, with cumulative acknowledgement, bounded-window flow control, bounded retry,
//!  duplicate suppression, and a coordinated bilateral shutdown handshake that guarantees no
//!  message is silently lost or delivered twice.
//!
//! ## Design goals
//!
//! * Sequence numbers start at 1 and are strictly increasing per direction; reaching
//!   `i64::MAX` is a protocol-fatal rollover
//! * Received numbers are tracked as a collection of disjoint inclusive ranges
//!   ([`sequence_range::SequenceRangeCollection`]), which is also the wire representation of
//!   an acknowledgement
//! * Delivery to the application is governed by a pluggable strategy: *ordered* (strict
//!   sequence order, buffering out-of-order arrivals) or *unordered* (immediate release),
//!   both bounded by the transfer window quota
//! * Acknowledgements are batched behind a timer unless the peer asked for one, the final
//!   number became known, or a window's worth of messages is pending - any of these forces
//!   an immediate ack
//! * Transport-level send failures are masked by bounded retry; protocol-level validation
//!   failures are never retried and always fault the session
//! * Shutdown is a multi-phase handshake with two protocol variants:
//!   * the *legacy* variant marks the logically last message with a flag on the message
//!     itself and uses a single `TerminateSequence` exchange
//!   * the *current* variant uses explicit `CloseSequence` / `TerminateSequence` control
//!     messages that must declare consistent final sequence numbers
//!
//! ## What this crate is not
//!
//! The underlying point-to-point transport, its framing and codecs, the wire-level XML of
//!  the protocol headers, and transport security are external collaborators behind the
//!  [`binder`] traits - this crate deals exclusively in typed descriptors
//!  ([`control_messages::WireMessage`]). Message content serialization, connection pooling
//!  and multi-party flooding are out of scope entirely.
//!
//! ## Concurrency model
//!
//! Each channel owns exactly one input connection, one output connection, one delivery
//!  strategy and one session; none of these are shared across channels. All state mutation
//!  happens under one per-channel lock, held only for state transitions - sends and replies
//!  are issued outside the lock. The receive loop, application `send`/`receive` calls, the
//!  acknowledgement timer and the retry timer all suspend independently; every blocking
//!  operation takes a timeout, and every fault kind funnels through a single local-fault
//!  entry point that unblocks all waiters exactly once.

pub mod binder;
pub mod config;
pub mod control_messages;
pub mod delivery_strategy;
pub mod duplex_channel;
pub mod fault;
pub mod input_connection;
pub mod output_connection;
pub mod reply_channel;
pub mod sequence_range;
pub mod session;
pub mod wait_object;

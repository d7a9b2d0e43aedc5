use crate::control_messages::WireMessage;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::time::Duration;

/// Abstraction over the underlying point-to-point transport for a duplex session,
///  introduced to keep framing/codec concerns out of the protocol core and to facilitate
///  mocking the I/O away for testing.
///
/// `Err` from `send` is a transport-level failure and a candidate for bounded retry;
///  protocol-level problems never surface here.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReliableBinder: Send + Sync + 'static {
    async fn send(&self, message: WireMessage, timeout: Duration) -> anyhow::Result<()>;

    /// Pulls the next inbound protocol message. `Ok(None)` means the transport ended the
    ///  session (e.g. the peer closed the connection under the protocol's feet).
    async fn try_receive(&self) -> anyhow::Result<Option<WireMessage>>;

    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;
}

/// A pending inbound request on a request/reply transport. Exactly one reply is sent per
///  handle; duplicate redeliveries of the same request each arrive with a fresh handle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RequestHandle: Send + Sync + 'static {
    async fn reply(&self, message: WireMessage, timeout: Duration) -> anyhow::Result<()>;

    /// Drops the pending transport request without replying.
    fn abandon(&self);
}

/// Transport abstraction for the reply-channel variant: every inbound protocol message
///  arrives bound to a transport request that expects exactly one reply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplyBinder: Send + Sync + 'static {
    async fn try_receive(
        &self,
    ) -> anyhow::Result<Option<(WireMessage, Box<dyn RequestHandle>)>>;

    /// Sends an unsolicited message outside any request context (e.g. a fault).
    async fn send(&self, message: WireMessage, timeout: Duration) -> anyhow::Result<()>;

    async fn close(&self, timeout: Duration) -> anyhow::Result<()>;
}

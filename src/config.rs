use anyhow::bail;
use std::time::Duration;

/// In the unordered-delivery case, no more than this many disjoint acknowledgement ranges
///  are kept, bounding the serialized ack size and the memory taken by the range
///  collection. Ordered delivery defers this bound to the delivery strategy's window.
pub const MAX_SEQUENCE_RANGES: usize = 128;

/// The two supported protocol variants, with different shutdown rules.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ReliableMessagingVersion {
    /// The sender marks its logically last message with a flag on the message itself;
    ///  a single `TerminateSequence` exchange shuts the sequence down.
    Legacy,
    /// Explicit `CloseSequence` / `TerminateSequence` handshake declaring (then
    ///  confirming) the final sequence number.
    Current,
}

/// Which side of the session establishment this endpoint played. Establishment itself
///  (`CreateSequence`) completes before a channel is constructed.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SessionRole {
    Client,
    Server,
}

pub struct ReliableSessionConfig {
    pub version: ReliableMessagingVersion,
    pub role: SessionRole,

    /// Strict in-sequence-order release to the application, buffering gaps.
    pub ordered: bool,

    /// The maximum number of unacknowledged in-flight messages on the send side, and the
    ///  maximum number of accepted-but-unreleased messages buffered on the receive side.
    pub max_transfer_window_size: usize,

    /// A transport send is attempted `max_retry_count + 1` times before the session is
    ///  faulted. Protocol-level validation failures are never retried.
    pub max_retry_count: usize,

    /// Pause between transport send retries.
    pub retry_interval: Duration,

    /// Acknowledgements are batched behind a timer with this interval unless something
    ///  forces an immediate send.
    pub acknowledgement_interval: Duration,

    /// When enabled, the peer's advertised buffer-remaining hint throttles the sender; an
    ///  advertised zero window triggers an ack-requested heartbeat on dequeue.
    pub flow_control: bool,

    /// Upper bound for blocking handshake waits during close.
    pub close_timeout: Duration,

    /// Upper bound for a single application send, including all retries.
    pub send_timeout: Duration,
}

impl ReliableSessionConfig {
    pub fn new(version: ReliableMessagingVersion, role: SessionRole) -> ReliableSessionConfig {
        ReliableSessionConfig {
            version,
            role,
            ordered: true,
            max_transfer_window_size: 8,
            max_retry_count: 8,
            retry_interval: Duration::from_millis(500),
            acknowledgement_interval: Duration::from_millis(200),
            flow_control: true,
            close_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_transfer_window_size == 0 {
            bail!("transfer window size must be at least 1");
        }
        if self.max_transfer_window_size > 4096 {
            bail!("transfer window size is unreasonably large");
        }
        if self.acknowledgement_interval.is_zero() {
            bail!("acknowledgement interval must be non-zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::defaults_are_valid(8, Duration::from_millis(200), true)]
    #[case::zero_window(0, Duration::from_millis(200), false)]
    #[case::huge_window(5000, Duration::from_millis(200), false)]
    #[case::zero_ack_interval(8, Duration::ZERO, false)]
    fn test_validate(
        #[case] window: usize,
        #[case] ack_interval: Duration,
        #[case] expected_ok: bool,
    ) {
        let mut config =
            ReliableSessionConfig::new(ReliableMessagingVersion::Current, SessionRole::Server);
        config.max_transfer_window_size = window;
        config.acknowledgement_interval = ack_interval;

        assert_eq!(config.validate().is_ok(), expected_ok);
    }
}

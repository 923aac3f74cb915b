use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use crate::net_stats::NetStats;
use crate::sequence::{AddressingMode, SenderId};
use crate::wire::MAX_REQUESTED_IDS_PER_MESSAGE;

#[derive(Debug)]
pub struct ReliabilityConfig {
    /// the id of this peer, set as the sender id of all outgoing messages
    pub self_id: SenderId,

    /// If true, every peer gets its own independent sequence of ids (and the sent message log is
    ///  keyed by peer). If false, all peers share a single sequence - this is the typical setup
    ///  for a server broadcasting the same messages to all its clients.
    pub resolve_every_client_message: bool,

    /// keep-alive messages are stackable iff this is set, riding along with other stacked
    ///  traffic rather than using a transmission unit of their own
    pub stack_keep_alive_messages: bool,

    /// a stack is sealed and sent as soon as it holds this many messages
    pub max_stack_size: usize,
    /// A stack is sealed and sent when it is older than this, even if it is not full. This is
    ///  checked by the housekeeping tick, so the effective delay is up to
    ///  `max_stack_age + housekeeping_interval`.
    ///
    /// `None` means stacks are only sealed by size or by an unstackable message / explicit flush
    pub max_stack_age: Option<Duration>,

    pub log_retention: RetentionPolicy,

    /// A missing sequence id is not requested again until this interval passed since the last
    ///  request for it. This prevents flooding the sender with requests for every out-of-order
    ///  message while a resend is still on its way.
    pub re_request_interval: Duration,

    /// Missing ids more than this far below the highest received id are given up on, and the
    ///  messages buffered above them are delivered. This bounds the receive state per sender,
    ///  e.g. for a client joining a shared stream late.
    pub receive_window_size: u64,

    /// the maximum number of ids in a single request, so that the request fits into a datagram
    pub max_num_requested_ids: usize,

    /// interval of the (optional) active loop, see [crate::peer::Peer::spawn_active_loop]
    pub housekeeping_interval: Duration,

    pub net_stats: Arc<NetStats>,
}

impl ReliabilityConfig {
    pub fn new(self_id: SenderId) -> ReliabilityConfig {
        ReliabilityConfig {
            self_id,
            resolve_every_client_message: false,
            stack_keep_alive_messages: false,
            max_stack_size: 16,
            max_stack_age: Some(Duration::from_millis(5)),
            log_retention: RetentionPolicy::default(),
            re_request_interval: Duration::from_millis(100),
            receive_window_size: 4096,
            max_num_requested_ids: 1024,
            housekeeping_interval: Duration::from_millis(20),
            net_stats: Default::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_stack_size == 0 {
            bail!("max stack size must be at least 1");
        }
        if self.log_retention.max_entries == 0 {
            bail!("the sent message log must retain at least one entry");
        }
        if self.receive_window_size == 0 {
            bail!("receive window size must be at least 1");
        }
        if self.max_num_requested_ids == 0 || self.max_num_requested_ids > MAX_REQUESTED_IDS_PER_MESSAGE {
            bail!("the maximum number of requested ids must be between 1 and {}", MAX_REQUESTED_IDS_PER_MESSAGE);
        }
        if self.housekeeping_interval.is_zero() {
            bail!("housekeeping interval must not be zero");
        }
        Ok(())
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        AddressingMode::from_config(self.resolve_every_client_message)
    }
}

/// Bounds for the sent message log. Unbounded retention would leak memory, so there is always a
///  count limit; the age limit is optional.
///
/// NB: Pruning an entry that is requested afterwards makes the resend impossible - bounds should
///      comfortably exceed the number of messages sent during a few round trips
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetentionPolicy {
    pub max_entries: usize,
    pub max_age: Option<Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy {
            max_entries: 4096,
            max_age: Some(Duration::from_secs(30)),
        }
    }
}

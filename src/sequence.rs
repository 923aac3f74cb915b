use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use rustc_hash::FxHashMap;
use crate::message::ReliableMode;

/// Identifies a peer (server or client) in the messaging framework.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SenderId(pub u32);

impl SenderId {
    /// the addressing id that all peers are normalized to if sequence ids are shared
    pub const SHARED: SenderId = SenderId(0);
}

impl Display for SenderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SequenceId(u64);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceId {
    /// This is the 'nothing received yet' marker on the receiving side - allocation starts at 1
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// NB: 64 bit sequence ids do not wrap around in any realistic scenario, so this saturates
    ///      rather than wrapping
    pub fn next(&self) -> SequenceId {
        SequenceId(self.0.saturating_add(1))
    }

    /// all ids from `self` (inclusive) to `end` (exclusive)
    pub fn to(&self, end: SequenceId) -> impl Iterator<Item = SequenceId> {
        (self.0..end.0).map(SequenceId)
    }
}

/// Determines the scope in which sequence ids are unique.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum AddressingMode {
    /// every peer has its own sequence of ids, and keys contain the peer's id
    PerSender,
    /// all peers share a single sequence of ids, and keys are normalized to [SenderId::SHARED]
    Shared,
}

impl AddressingMode {
    pub fn from_config(resolve_every_client_message: bool) -> AddressingMode {
        if resolve_every_client_message {
            AddressingMode::PerSender
        }
        else {
            AddressingMode::Shared
        }
    }

    /// This is the one place where sender ids are normalized for addressing. Id allocation, log
    ///  insertion and log lookup must all go through here, or log entries become unreachable.
    pub fn key_sender_id(&self, peer: SenderId) -> SenderId {
        match self {
            AddressingMode::PerSender => peer,
            AddressingMode::Shared => SenderId::SHARED,
        }
    }

    pub fn key(&self, reliable_mode: ReliableMode, peer: SenderId, sequence_id: SequenceId) -> MessageKey {
        MessageKey {
            reliable_mode,
            sender_id: self.key_sender_id(peer),
            sequence_id,
        }
    }
}

/// Identity of a sent message in the [crate::message_log::SentMessageLog]. `sender_id` is the
///  *normalized* addressing id, so keys should be created via [AddressingMode::key].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct MessageKey {
    pub reliable_mode: ReliableMode,
    pub sender_id: SenderId,
    pub sequence_id: SequenceId,
}

impl Display for MessageKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}/{}", self.reliable_mode, self.sender_id, self.sequence_id)
    }
}

/// Allocates sequence ids for outgoing reliable units.
pub struct SequenceIdProvider {
    addressing_mode: AddressingMode,
    shared: AtomicU64,
    per_sender: Mutex<FxHashMap<SenderId, u64>>,
}

impl SequenceIdProvider {
    pub fn new(addressing_mode: AddressingMode) -> SequenceIdProvider {
        SequenceIdProvider {
            addressing_mode,
            shared: AtomicU64::new(0),
            per_sender: Default::default(),
        }
    }

    pub fn addressing_mode(&self) -> AddressingMode {
        self.addressing_mode
    }

    /// returns the next id in the addressing scope of `peer`, starting with 1
    pub fn allocate(&self, peer: SenderId) -> SequenceId {
        match self.addressing_mode {
            AddressingMode::Shared => {
                SequenceId(self.shared.fetch_add(1, Ordering::AcqRel) + 1)
            }
            AddressingMode::PerSender => {
                let mut per_sender = self.per_sender.lock()
                    .unwrap_or_else(|e| e.into_inner());
                let counter = per_sender.entry(peer).or_default();
                *counter += 1;
                SequenceId(*counter)
            }
        }
    }

    /// the most recently allocated id in `peer`'s scope, or ZERO if none was allocated yet
    pub fn last_allocated(&self, peer: SenderId) -> SequenceId {
        match self.addressing_mode {
            AddressingMode::Shared => SequenceId(self.shared.load(Ordering::Acquire)),
            AddressingMode::PerSender => {
                let per_sender = self.per_sender.lock()
                    .unwrap_or_else(|e| e.into_inner());
                SequenceId(per_sender.get(&peer).cloned().unwrap_or(0))
            }
        }
    }

    /// forget a peer's counter - a re-connecting peer starts over with 1
    pub fn forget(&self, peer: SenderId) {
        if self.addressing_mode == AddressingMode::PerSender {
            self.per_sender.lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::thread;

    #[rstest]
    #[case::per_sender(AddressingMode::PerSender, SenderId(5), SenderId(5))]
    #[case::per_sender_zero(AddressingMode::PerSender, SenderId(0), SenderId(0))]
    #[case::shared(AddressingMode::Shared, SenderId(5), SenderId::SHARED)]
    #[case::shared_zero(AddressingMode::Shared, SenderId(0), SenderId::SHARED)]
    fn test_key_sender_id(#[case] mode: AddressingMode, #[case] peer: SenderId, #[case] expected: SenderId) {
        assert_eq!(mode.key_sender_id(peer), expected);
        assert_eq!(mode.key(ReliableMode::SequenceNumber, peer, SequenceId(3)).sender_id, expected);
    }

    #[rstest]
    #[case::per_sender(true, AddressingMode::PerSender)]
    #[case::shared(false, AddressingMode::Shared)]
    fn test_from_config(#[case] resolve_every_client_message: bool, #[case] expected: AddressingMode) {
        assert_eq!(AddressingMode::from_config(resolve_every_client_message), expected);
    }

    #[test]
    fn test_allocate_shared() {
        let provider = SequenceIdProvider::new(AddressingMode::Shared);
        assert_eq!(provider.allocate(SenderId(1)), SequenceId(1));
        assert_eq!(provider.allocate(SenderId(2)), SequenceId(2));
        assert_eq!(provider.allocate(SenderId(1)), SequenceId(3));
        assert_eq!(provider.last_allocated(SenderId(7)), SequenceId(3));
    }

    #[test]
    fn test_allocate_per_sender() {
        let provider = SequenceIdProvider::new(AddressingMode::PerSender);
        assert_eq!(provider.allocate(SenderId(1)), SequenceId(1));
        assert_eq!(provider.allocate(SenderId(2)), SequenceId(1));
        assert_eq!(provider.allocate(SenderId(1)), SequenceId(2));
        assert_eq!(provider.last_allocated(SenderId(1)), SequenceId(2));
        assert_eq!(provider.last_allocated(SenderId(3)), SequenceId::ZERO);

        provider.forget(SenderId(1));
        assert_eq!(provider.allocate(SenderId(1)), SequenceId(1));
    }

    #[rstest]
    #[case::shared(AddressingMode::Shared)]
    #[case::per_sender(AddressingMode::PerSender)]
    fn test_allocate_concurrently(#[case] mode: AddressingMode) {
        let provider = Arc::new(SequenceIdProvider::new(mode));

        let handles = (0..8)
            .map(|_| {
                let provider = provider.clone();
                thread::spawn(move || {
                    let ids = (0..1000)
                        .map(|_| provider.allocate(SenderId(4)))
                        .collect::<Vec<_>>();
                    // strictly increasing in allocation order within each thread
                    assert!(ids.windows(2).all(|w| w[0] < w[1]));
                    ids
                })
            })
            .collect::<Vec<_>>();

        let mut all = handles.into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8000);
        assert_eq!(all.first(), Some(&SequenceId(1)));
        assert_eq!(all.last(), Some(&SequenceId(8000)));
    }

    #[test]
    fn test_to() {
        assert_eq!(SequenceId(3).to(SequenceId(6)).collect::<Vec<_>>(), vec![SequenceId(3), SequenceId(4), SequenceId(5)]);
        assert_eq!(SequenceId(3).to(SequenceId(3)).count(), 0);
        assert_eq!(SequenceId(5).to(SequenceId(3)).count(), 0);
    }
}

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::config::RetentionPolicy;
use crate::message::{Message, ReliableMode};
use crate::sequence::{MessageKey, SenderId, SequenceId};

struct LogEntry {
    message: Arc<Message>,
    recorded_at: Instant,
}

#[derive(Default)]
struct SentMessageLogInner {
    entries: FxHashMap<MessageKey, LogEntry>,
    /// keys in the order they were recorded, oldest first
    order: VecDeque<MessageKey>,
}

impl SentMessageLogInner {
    fn remove_oldest(&mut self) -> bool {
        while let Some(key) = self.order.pop_front() {
            if self.entries.remove(&key).is_some() {
                return true;
            }
        }
        false
    }
}

/// The log of sent reliable messages, consulted when a peer requests a resend.
///
/// All operations are a single critical section, so a lookup never observes a partially
///  recorded entry. Lookups return a shared reference to the message: a resend that looked up
///  its message is not affected by pruning that happens afterwards.
pub struct SentMessageLog {
    retention: RetentionPolicy,
    inner: Mutex<SentMessageLogInner>,
}

impl SentMessageLog {
    pub fn new(retention: RetentionPolicy) -> SentMessageLog {
        SentMessageLog {
            retention,
            inner: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SentMessageLogInner> {
        // the log's invariants hold after every statement, so a poisoned lock is still usable
        self.inner.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Inserts the message, replacing a previous entry for the same key. The retention policy's
    ///  count limit is enforced immediately, dropping the oldest entries.
    pub fn record(&self, key: MessageKey, message: Arc<Message>, now: Instant) {
        let mut inner = self.lock();

        let previous = inner.entries.insert(key, LogEntry {
            message,
            recorded_at: now,
        });
        if previous.is_some() {
            trace!("replacing log entry for {}", key);
            inner.order.retain(|k| k != &key);
        }
        inner.order.push_back(key);

        while inner.entries.len() > self.retention.max_entries {
            if !inner.remove_oldest() {
                break;
            }
        }
    }

    /// NB: Absence is a regular outcome, e.g. for pruned entries
    pub fn lookup(&self, key: &MessageKey) -> Option<Arc<Message>> {
        self.lock()
            .entries.get(key)
            .map(|e| e.message.clone())
    }

    /// removes entries older than the policy's maximum age and the oldest entries beyond its
    ///  maximum count, returning the number of removed entries
    pub fn prune(&self, policy: &RetentionPolicy, now: Instant) -> usize {
        let mut inner = self.lock();
        let len_before = inner.entries.len();

        if let Some(max_age) = policy.max_age {
            while let Some(key) = inner.order.front().cloned() {
                let is_expired = match inner.entries.get(&key) {
                    Some(entry) => now.saturating_duration_since(entry.recorded_at) > max_age,
                    None => true, // stale key, the entry was released
                };
                if !is_expired {
                    break;
                }
                inner.order.pop_front();
                inner.entries.remove(&key);
            }
        }

        while inner.entries.len() > policy.max_entries {
            if !inner.remove_oldest() {
                break;
            }
        }

        let num_pruned = len_before - inner.entries.len();
        if num_pruned > 0 {
            debug!("pruned {} entries from the sent message log, {} remaining", num_pruned, inner.entries.len());
        }
        num_pruned
    }

    /// prune based on the log's own retention policy
    pub fn prune_expired(&self, now: Instant) -> usize {
        self.prune(&self.retention, now)
    }

    /// Removes all sequenced entries for a (normalized) sender id up to and including a given
    ///  id. This is for entries that were acknowledged by their only possible requester.
    pub fn release_up_to(&self, key_sender_id: SenderId, up_to: SequenceId) -> usize {
        let mut inner = self.lock();
        let len_before = inner.entries.len();

        inner.entries.retain(|key, _| !(
            key.reliable_mode == ReliableMode::SequenceNumber &&
            key.sender_id == key_sender_id &&
            key.sequence_id <= up_to
        ));

        let num_released = len_before - inner.entries.len();
        if num_released > 0 {
            let SentMessageLogInner { entries, order } = &mut *inner;
            order.retain(|k| entries.contains_key(k));
            trace!("released {} acknowledged entries for {} up to {}", num_released, key_sender_id, up_to);
        }
        num_released
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

use std::cmp::max;
use std::collections::BTreeMap;
use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use crate::message::Message;
use crate::sequence::{SenderId, SequenceId};

/// The outcome of receiving a sequenced message
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ReceiveResult {
    /// messages that are ready for dispatch, in sequence order
    pub deliverable: Vec<Message>,
    /// missing ids that should be requested from the sender
    pub absent_ids: Vec<SequenceId>,
    pub is_duplicate: bool,
    /// missing ids that were given up on because they fell out of the receive window
    pub num_skipped: u64,
}

/// Receive state for a single remote sender.
///
/// NB: There is an invariant that all buffered ids are above the high-water mark + 1, i.e.
///      a buffered message is never deliverable. Every id between the high-water mark and the
///      highest buffered id is either buffered or missing, and nothing else is missing.
#[derive(Debug)]
pub struct PeerReceiveState {
    receive_window_size: u64,
    max_num_requested_ids: usize,
    /// all ids up to and including this were delivered
    high_water_mark: SequenceId,
    /// messages that arrived out of order, waiting for the gap before them to be filled
    pending: BTreeMap<SequenceId, Message>,
    /// ids that were not received yet, with the time of the most recent request for them
    missing: BTreeMap<SequenceId, Option<Instant>>,
}

impl PeerReceiveState {
    pub fn new(receive_window_size: u64, max_num_requested_ids: usize) -> PeerReceiveState {
        PeerReceiveState {
            receive_window_size,
            max_num_requested_ids,
            high_water_mark: SequenceId::ZERO,
            pending: Default::default(),
            missing: Default::default(),
        }
    }

    pub fn high_water_mark(&self) -> SequenceId {
        self.high_water_mark
    }

    pub fn pending_ids(&self) -> Vec<SequenceId> {
        self.pending.keys().cloned().collect()
    }

    pub fn missing_ids(&self) -> Vec<SequenceId> {
        self.missing.keys().cloned().collect()
    }

    pub fn on_sequenced(&mut self, message: Message, now: Instant, re_request_interval: Duration) -> ReceiveResult {
        let sequence_id = message.sequence_id;

        if sequence_id <= self.high_water_mark || self.pending.contains_key(&sequence_id) {
            trace!("sequence id {} was received before (high-water mark {}) - dropping duplicate", sequence_id, self.high_water_mark);
            return ReceiveResult {
                is_duplicate: true,
                ..Default::default()
            };
        }

        let is_in_order = sequence_id == self.high_water_mark.next();
        let highest_known = self.highest_known();

        self.missing.remove(&sequence_id);
        self.pending.insert(sequence_id, message);

        let mut deliverable = Vec::new();
        let mut num_skipped = 0;
        if let Some(lower_bound) = sequence_id.to_raw().checked_sub(self.receive_window_size) {
            if lower_bound > self.high_water_mark.to_raw() {
                num_skipped = self.skip_to(SequenceId::from_raw(lower_bound), highest_known, &mut deliverable);
            }
        }

        // only ids above everything seen so far are newly missing
        let newly_missing_from = max(highest_known, self.high_water_mark).next();
        for id in newly_missing_from.to(sequence_id) {
            self.missing.insert(id, None);
        }

        self.drain(&mut deliverable);

        let absent_ids = if is_in_order {
            vec![]
        }
        else {
            let absent_ids = self.take_due_requests(now, re_request_interval);
            debug!("sequence id {} arrived out of order (high-water mark {}), requesting {:?}", sequence_id, self.high_water_mark, absent_ids);
            absent_ids
        };

        ReceiveResult {
            deliverable,
            absent_ids,
            is_duplicate: false,
            num_skipped,
        }
    }

    fn highest_known(&self) -> SequenceId {
        self.pending.last_key_value()
            .map(|(&id, _)| id)
            .unwrap_or(self.high_water_mark)
    }

    /// moves the high-water mark across all contiguous buffered messages
    fn drain(&mut self, deliverable: &mut Vec<Message>) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.high_water_mark.next() {
                break;
            }
            self.high_water_mark = *entry.key();
            deliverable.push(entry.remove());
        }

        // ids at or below the mark are no longer missing
        self.missing = self.missing.split_off(&self.high_water_mark.next());
    }

    /// Gives up on all missing ids up to `lower_bound`, delivering the buffered messages below it
    ///  in order. Returns the number of ids that were given up on.
    fn skip_to(&mut self, lower_bound: SequenceId, highest_known: SequenceId, deliverable: &mut Vec<Message>) -> u64 {
        let above = self.pending.split_off(&lower_bound.next());
        let below = std::mem::replace(&mut self.pending, above);
        let num_skipped_missing = self.missing.range(..=lower_bound).count() as u64;
        let num_skipped_unseen = lower_bound.to_raw().saturating_sub(max(highest_known, self.high_water_mark).to_raw());
        let num_skipped = num_skipped_missing + num_skipped_unseen;

        warn!("sequence ids {} to {} moved out of the receive window, giving up on {} missing ids", self.high_water_mark.next(), lower_bound, num_skipped);

        deliverable.extend(below.into_values());
        self.missing = self.missing.split_off(&lower_bound.next());
        self.high_water_mark = lower_bound;
        num_skipped
    }

    /// Missing ids that were never requested or whose most recent request is overdue, lowest
    ///  first, up to `max_num_requested_ids`. If more ids are missing, the rest is requested
    ///  once the first batch arrived, or on the next recurrence.
    fn take_due_requests(&mut self, now: Instant, re_request_interval: Duration) -> Vec<SequenceId> {
        let mut result = Vec::new();
        for (&id, requested_at) in self.missing.iter_mut() {
            if result.len() == self.max_num_requested_ids {
                break;
            }
            let is_due = match requested_at {
                None => true,
                Some(requested_at) => now.saturating_duration_since(*requested_at) >= re_request_interval,
            };
            if is_due {
                *requested_at = Some(now);
                result.push(id);
            }
        }
        result
    }

    /// This is for recovery if no further messages arrive to expose the gap again.
    pub fn due_requests(&mut self, now: Instant, re_request_interval: Duration) -> Vec<SequenceId> {
        self.take_due_requests(now, re_request_interval)
    }
}

/// Tracks the receive state of all remote senders. Updates for a sender (advance and drain) are
///  atomic with regard to concurrent deliveries from the same sender.
pub struct GapDetector {
    receive_window_size: u64,
    max_num_requested_ids: usize,
    states: Mutex<FxHashMap<SenderId, PeerReceiveState>>,
}

impl GapDetector {
    pub fn new(receive_window_size: u64, max_num_requested_ids: usize) -> GapDetector {
        GapDetector {
            receive_window_size,
            max_num_requested_ids,
            states: Default::default(),
        }
    }

    pub async fn on_sequenced(&self, message: Message, now: Instant, re_request_interval: Duration) -> ReceiveResult {
        let mut states = self.states.lock().await;
        states.entry(message.sender_id)
            .or_insert_with(|| PeerReceiveState::new(self.receive_window_size, self.max_num_requested_ids))
            .on_sequenced(message, now, re_request_interval)
    }

    pub async fn due_requests(&self, now: Instant, re_request_interval: Duration) -> Vec<(SenderId, Vec<SequenceId>)> {
        let mut states = self.states.lock().await;

        let mut result = states.iter_mut()
            .map(|(&sender, state)| (sender, state.due_requests(now, re_request_interval)))
            .filter(|(_, ids)| !ids.is_empty())
            .collect::<Vec<_>>();
        result.sort_by_key(|(sender, _)| *sender);
        result
    }

    pub async fn high_water_mark(&self, sender: SenderId) -> SequenceId {
        self.states.lock().await
            .get(&sender)
            .map(|s| s.high_water_mark())
            .unwrap_or(SequenceId::ZERO)
    }

    pub async fn forget(&self, sender: SenderId) {
        if self.states.lock().await.remove(&sender).is_some() {
            debug!("discarded receive state for {}", sender);
        }
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the reliability layer. They are increment-only sinks for the core;
///  reading is for logging and tests.
#[derive(Debug, Default)]
pub struct NetStats {
    resent_messages: AtomicU64,
    requested_ids: AtomicU64,
    missing_in_log: AtomicU64,
    duplicates_dropped: AtomicU64,
    stacks_sent: AtomicU64,
    skipped_ids: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NetStatsSnapshot {
    pub resent_messages: u64,
    pub requested_ids: u64,
    pub missing_in_log: u64,
    pub duplicates_dropped: u64,
    pub stacks_sent: u64,
    pub skipped_ids: u64,
}

impl NetStats {
    pub fn increment_resent_messages(&self) {
        self.resent_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_requested_ids(&self, num_ids: usize) {
        self.requested_ids.fetch_add(num_ids as u64, Ordering::Relaxed);
    }

    pub fn increment_missing_in_log(&self) {
        self.missing_in_log.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_duplicates_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stacks_sent(&self) {
        self.stacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped_ids(&self, num_ids: u64) {
        self.skipped_ids.fetch_add(num_ids, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NetStatsSnapshot {
        NetStatsSnapshot {
            resent_messages: self.resent_messages.load(Ordering::Relaxed),
            requested_ids: self.requested_ids.load(Ordering::Relaxed),
            missing_in_log: self.missing_in_log.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            stacks_sent: self.stacks_sent.load(Ordering::Relaxed),
            skipped_ids: self.skipped_ids.load(Ordering::Relaxed),
        }
    }
}

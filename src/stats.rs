use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Per-ledger counters. Updated outside the ledger lock.
#[derive(Debug, Default)]
pub struct LedgerStats {
    records_appended: AtomicU64,
    mutations_dropped: AtomicU64,
    finalize_calls: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStatsSnapshot {
    pub records_appended: u64,
    pub mutations_dropped: u64,
    pub finalize_calls: u64,
}

impl LedgerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_appended(&self, count: usize) {
        self.records_appended
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn mutation_dropped(&self) {
        self.mutations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finalize_called(&self) {
        self.finalize_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LedgerStatsSnapshot {
        LedgerStatsSnapshot {
            records_appended: self.records_appended.load(Ordering::Relaxed),
            mutations_dropped: self.mutations_dropped.load(Ordering::Relaxed),
            finalize_calls: self.finalize_calls.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        debug!(
            records_appended = s.records_appended,
            mutations_dropped = s.mutations_dropped,
            finalize_calls = s.finalize_calls,
            "ledger stats"
        );
    }
}

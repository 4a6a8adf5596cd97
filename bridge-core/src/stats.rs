//! Client outcome counters: one per terminal outcome, readable from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ClientStats {
    stream_success: AtomicU64,
    stream_failure: AtomicU64,
    stream_cancel: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub stream_success: u64,
    pub stream_failure: u64,
    pub stream_cancel: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.stream_success + self.stream_failure + self.stream_cancel
    }
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.stream_success.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.stream_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancel(&self) {
        self.stream_cancel.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            stream_success: self.stream_success.load(Ordering::Relaxed),
            stream_failure: self.stream_failure.load(Ordering::Relaxed),
            stream_cancel: self.stream_cancel.load(Ordering::Relaxed),
        }
    }
}

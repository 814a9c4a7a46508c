//! Counters for the self-healing acquisition loop

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

/// Running totals for one controller. Updated by the worker, read by anyone.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    inner: CachePadded<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    frames_delivered: AtomicU64,
    timeouts: AtomicU64,
    native_failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_index: AtomicU64,
}

/// Point-in-time copy of [`AcquisitionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_delivered: u64,
    pub timeouts: u64,
    pub native_failures: u64,
    /// Failed waits since the last good frame
    pub consecutive_failures: u64,
    pub last_index: u64,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_frame(&self, index: u64) {
        self.inner.frames_delivered.fetch_add(1, Ordering::Relaxed);
        self.inner.last_index.store(index, Ordering::Relaxed);
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        metrics::counter!("dhyana_frames_delivered_total").increment(1);
    }

    /// Returns the failure streak including this one
    pub(crate) fn record_timeout(&self) -> u64 {
        self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dhyana_wait_timeouts_total").increment(1);
        self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the failure streak including this one
    pub(crate) fn record_failure(&self) -> u64 {
        self.inner.native_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("dhyana_native_failures_total").increment(1);
        self.inner.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset(&self) {
        self.inner.frames_delivered.store(0, Ordering::Relaxed);
        self.inner.timeouts.store(0, Ordering::Relaxed);
        self.inner.native_failures.store(0, Ordering::Relaxed);
        self.inner.consecutive_failures.store(0, Ordering::Relaxed);
        self.inner.last_index.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_delivered: self.inner.frames_delivered.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            native_failures: self.inner.native_failures.load(Ordering::Relaxed),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::Relaxed),
            last_index: self.inner.last_index.load(Ordering::Relaxed),
        }
    }
}

//!
//! Per-core scheduler statistics.
//!
//! All counters are relaxed atomic increments; they feed diagnostics and the
//! teardown log line, never scheduling decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Counters kept by every core.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    steals: AtomicU64,
    pauses: AtomicU64,
    unpauses: AtomicU64,
    lifo: AtomicU64,
}

impl SchedulerStats {
    /// Creates a zeroed set of counters.
    pub fn new() -> SchedulerStats {
        SchedulerStats::default()
    }

    pub(crate) fn steal(&self) {
        self.steals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unpause(&self) {
        self.unpauses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lifo(&self) {
        self.lifo.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of cowns this core's worker obtained from other cores.
    pub fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }

    /// Number of times this core's worker parked.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Number of sleeping workers this core's activity woke.
    pub fn unpauses(&self) -> u64 {
        self.unpauses.load(Ordering::Relaxed)
    }

    /// Number of cowns scheduled onto this core by external wakes.
    pub fn lifo_schedules(&self) -> u64 {
        self.lifo.load(Ordering::Relaxed)
    }

    pub(crate) fn log(&self, affinity: usize) {
        debug!(
            "core {} stats: {} steals, {} pauses, {} unpauses, {} lifo schedules",
            affinity,
            self.steals(),
            self.pauses(),
            self.unpauses(),
            self.lifo_schedules()
        );
    }
}

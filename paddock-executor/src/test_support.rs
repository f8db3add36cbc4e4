//! A minimal cown used by the unit tests.

use std::sync::atomic::{AtomicU64, Ordering};

use paddock_cown::{Cown, CownInfo, RunContext};

/// Runs a fixed number of times, rescheduling itself in between, then goes
/// back to sleep. Scan wake-ups mark it without consuming a run.
pub(crate) struct TestCown {
    info: CownInfo,
    runs: AtomicU64,
    remaining: AtomicU64,
    sweeps: AtomicU64,
    scannable: bool,
}

impl TestCown {
    pub(crate) fn new(remaining: u64) -> TestCown {
        TestCown {
            info: CownInfo::new(),
            runs: AtomicU64::new(0),
            remaining: AtomicU64::new(remaining),
            sweeps: AtomicU64::new(0),
            scannable: true,
        }
    }

    /// A cown with no work that is never woken by scans.
    pub(crate) fn sleeper() -> TestCown {
        TestCown {
            scannable: false,
            ..TestCown::new(0)
        }
    }

    pub(crate) fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub(crate) fn swept(&self) -> bool {
        self.sweep_count() > 0
    }

    pub(crate) fn sweep_count(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }
}

impl Cown for TestCown {
    fn info(&self) -> &CownInfo {
        &self.info
    }

    fn run(&self, ctx: RunContext) -> bool {
        self.info.set_epoch_mark(ctx.mark);

        // The cown is dispatched on one worker at a time, so the counter
        // needs no compare-and-swap.
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == 0 {
            // Empty wake-up, e.g. a scan message.
            self.info.set_sleeping(true);
            return false;
        }

        self.runs.fetch_add(1, Ordering::Relaxed);
        self.remaining.store(remaining - 1, Ordering::Relaxed);
        if remaining == 1 {
            self.info.set_sleeping(true);
            false
        } else {
            true
        }
    }

    fn can_lifo_schedule(&self) -> bool {
        self.scannable && self.info.is_sleeping()
    }

    fn sweep(&self) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
    }
}

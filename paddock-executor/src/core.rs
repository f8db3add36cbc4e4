//!
//! Per-CPU scheduler state.
//!
//! A core owns the run queue its worker drains, the registry of cowns whose
//! home it is, the token bookkeeping and the statistics counters. Cores form
//! a ring over which idle workers rotate their steal victim.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use paddock_cown::{AtomicMark, Cown, EpochMark, NO_EPOCH};

use crate::epoch::GlobalEpoch;
use crate::run_queue::{CownQueue, Slot};
use crate::stats::SchedulerStats;

/// State of one scheduler core.
#[derive(Debug)]
pub struct Core<C> {
    /// Index of this core within the scheduler, doubling as its affinity.
    index: usize,
    /// Next core in the victim ring.
    next: usize,
    /// Run queue of cowns ready to execute on this core.
    pub(crate) q: CownQueue<C>,
    /// Registry of cowns whose home is this core.
    cowns: Mutex<Vec<Arc<C>>>,
    total_cowns: AtomicUsize,
    free_cowns: AtomicUsize,
    /// Cowns dispatched on behalf of this core.
    progress_counter: AtomicU64,
    /// Workers still associated with this core; used at shutdown.
    pub(crate) servicing_threads: AtomicUsize,
    /// Index of the worker that last dispatched for this core.
    last_worker: AtomicUsize,
    /// Epoch this core's worker currently stamps outgoing messages with.
    send_epoch: AtomicMark,
    /// Sticky flag: work carrying a foreign epoch was routed through here.
    unscanned_hint: AtomicBool,
    /// Diagnostic counters.
    pub(crate) stats: SchedulerStats,
}

impl<C: Cown> Core<C> {
    pub(crate) fn new(index: usize, next: usize) -> Core<C> {
        Core {
            index,
            next,
            q: CownQueue::new(),
            cowns: Mutex::new(Vec::new()),
            total_cowns: AtomicUsize::new(0),
            free_cowns: AtomicUsize::new(0),
            progress_counter: AtomicU64::new(0),
            servicing_threads: AtomicUsize::new(0),
            last_worker: AtomicUsize::new(usize::MAX),
            send_epoch: AtomicMark::new(EpochMark::A),
            unscanned_hint: AtomicBool::new(false),
            stats: SchedulerStats::new(),
        }
    }

    /// Index of this core, doubling as its affinity identifier.
    pub fn affinity(&self) -> usize {
        self.index
    }

    /// Next core in the victim ring.
    pub fn next(&self) -> usize {
        self.next
    }

    /// Number of cowns registered to this core.
    pub fn total_cowns(&self) -> usize {
        self.total_cowns.load(Ordering::Relaxed)
    }

    /// Number of registered cowns whose stub is eligible for collection.
    pub fn free_cowns(&self) -> usize {
        self.free_cowns.load(Ordering::Relaxed)
    }

    /// Cowns dispatched on behalf of this core so far.
    pub fn progress(&self) -> u64 {
        self.progress_counter.load(Ordering::Relaxed)
    }

    /// Diagnostic counters of this core.
    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub(crate) fn count_progress(&self) {
        self.progress_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_worker(&self, worker: usize) {
        self.last_worker.store(worker, Ordering::Relaxed);
    }

    pub(crate) fn mark_stub_free(&self) {
        self.free_cowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Epoch this core's worker stamps outgoing messages with.
    pub fn send_epoch(&self) -> EpochMark {
        self.send_epoch.load()
    }

    pub(crate) fn set_send_epoch(&self, mark: EpochMark) {
        self.send_epoch.store(mark);
    }

    pub(crate) fn unscanned_hint(&self) -> bool {
        self.unscanned_hint.load(Ordering::Acquire)
    }

    pub(crate) fn set_unscanned_hint(&self) {
        self.unscanned_hint.store(true, Ordering::Release);
    }

    pub(crate) fn clear_unscanned_hint(&self) {
        self.unscanned_hint.store(false, Ordering::Release);
    }

    /// Registers a cown whose home this core has just become.
    pub(crate) fn add_cown(&self, cown: Arc<C>) {
        debug_assert_eq!(cown.info().owning_core(), Some(self.index));
        self.cowns.lock().push(cown);
        self.total_cowns.fetch_add(1, Ordering::Relaxed);
    }

    /// Cowns that may be woken by an empty message during a scan.
    pub(crate) fn lifo_candidates(&self) -> Vec<Arc<C>> {
        self.cowns
            .lock()
            .iter()
            .filter(|c| c.can_lifo_schedule())
            .cloned()
            .collect()
    }

    /// Sweep phase of the leak detector: release every registered cown that
    /// was not observed in scan epoch `mark` and is asleep.
    pub(crate) fn try_collect(&self, mark: EpochMark) {
        let cowns = self.cowns.lock();
        for cown in cowns.iter() {
            let info = cown.info();
            if info.scanned(mark) || !info.is_sleeping() || info.is_collected() {
                continue;
            }
            if info.mark_collected() {
                debug!("sweeping unreachable cown on core {}", self.index);
                let was_free = info.weak_count() == 0;
                cown.sweep();
                if !was_free && info.weak_count() == 0 {
                    self.free_cowns.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Collects the stubs of registered cowns without weak references, once
    /// the global epoch proves no worker can still reference them.
    ///
    /// During teardown every cown is visited: stubs still carrying weak
    /// references are reported, and either kept allocated for diagnosis
    /// (`detect_leaks`) or dropped.
    pub(crate) fn collect_stubs(
        &self,
        epoch: &GlobalEpoch,
        during_teardown: bool,
        detect_leaks: bool,
    ) -> usize {
        let mut registry = self.cowns.lock();
        debug_assert_eq!(self.total_cowns.load(Ordering::Relaxed), registry.len());

        let drained: Vec<Arc<C>> = std::mem::take(&mut *registry);
        let mut removed = 0usize;
        let mut removed_free = 0usize;

        for cown in drained {
            let info = cown.info();
            let free = info.weak_count() == 0;
            if !free {
                if !during_teardown {
                    registry.push(cown);
                    continue;
                }
                warn!("cown leaked: weak references remain at teardown");
                if detect_leaks {
                    // Leak intentionally: diagnosis mode keeps the stub
                    // alive for heap tools to report.
                    removed += 1;
                    std::mem::forget(cown);
                    continue;
                }
            }

            let observed = info.epoch_when_popped();
            if observed == NO_EPOCH || epoch.is_outdated(observed) {
                trace!("stub collected cown on core {}", self.index);
                removed += 1;
                if free {
                    removed_free += 1;
                }
                drop(cown);
            } else {
                registry.push(cown);
            }
        }

        self.total_cowns.fetch_sub(removed, Ordering::Relaxed);
        let freed = removed_free.min(self.free_cowns.load(Ordering::Relaxed));
        self.free_cowns.fetch_sub(freed, Ordering::Relaxed);

        trace!(
            "core {}: stub collected {} cowns, {} free / {} total remain",
            self.index,
            removed,
            self.free_cowns(),
            self.total_cowns()
        );
        removed
    }

    /// Drains this core's run queue; teardown phase one. The queue itself
    /// is destroyed later, by the last worker servicing the core.
    pub(crate) fn drain_queue(&self) {
        let mut dropped = 0usize;
        while let Some(slot) = self.q.dequeue() {
            if matches!(slot, Slot::Cown(_)) {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(
                "core {}: {} cowns were still queued at teardown",
                self.index, dropped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCown;

    fn registered(core: &Core<TestCown>, runs: u64) -> Arc<TestCown> {
        let cown = Arc::new(TestCown::new(runs));
        cown.info().set_owning_core(core.affinity());
        core.add_cown(cown.clone());
        cown
    }

    #[test]
    fn registration_updates_totals() {
        let core: Core<TestCown> = Core::new(0, 1);
        registered(&core, 1);
        registered(&core, 1);
        assert_eq!(core.total_cowns(), 2);
        assert_eq!(core.free_cowns(), 0);
    }

    #[test]
    fn stub_collection_waits_for_the_epoch() {
        let core: Core<TestCown> = Core::new(0, 1);
        let epoch = GlobalEpoch::new();
        let cown = registered(&core, 1);

        // Observed in the current epoch with no weak refs left: retained
        // until the epoch is outdated.
        cown.info().set_epoch_when_popped(epoch.current());
        assert_eq!(cown.info().weak_release(), 0);
        core.mark_stub_free();

        assert_eq!(core.collect_stubs(&epoch, false, false), 0);
        assert_eq!(core.total_cowns(), 1);

        epoch.advance();
        assert_eq!(core.collect_stubs(&epoch, false, false), 0);

        epoch.advance();
        assert_eq!(core.collect_stubs(&epoch, false, false), 1);
        assert_eq!(core.total_cowns(), 0);
        assert_eq!(core.free_cowns(), 0);
    }

    #[test]
    fn untracked_stubs_collect_immediately() {
        let core: Core<TestCown> = Core::new(0, 1);
        let epoch = GlobalEpoch::new();
        let cown = registered(&core, 1);

        // Never popped from a queue: no worker can hold a reference.
        assert_eq!(cown.info().weak_release(), 0);
        core.mark_stub_free();
        assert_eq!(core.collect_stubs(&epoch, false, false), 1);
    }

    #[test]
    fn live_stubs_survive_collection() {
        let core: Core<TestCown> = Core::new(0, 1);
        let epoch = GlobalEpoch::new();
        registered(&core, 1);

        assert_eq!(core.collect_stubs(&epoch, false, false), 0);
        assert_eq!(core.total_cowns(), 1);
    }

    #[test]
    fn sweep_releases_only_unscanned_sleepers() {
        let core: Core<TestCown> = Core::new(0, 1);
        let scanned = registered(&core, 1);
        let unscanned = registered(&core, 1);
        let awake = registered(&core, 1);

        scanned.info().set_epoch_mark(EpochMark::B);
        awake.info().set_sleeping(false);

        core.try_collect(EpochMark::B);

        assert!(!scanned.swept());
        assert!(unscanned.swept());
        assert!(!awake.swept());

        // A second sweep pass does not run twice on the same cown.
        core.try_collect(EpochMark::B);
        assert_eq!(unscanned.sweep_count(), 1);
    }
}

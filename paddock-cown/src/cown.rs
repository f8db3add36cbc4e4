use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use crate::epoch::{AtomicMark, EpochMark};
use crate::state::LdState;

/// Sentinel for [`CownInfo::epoch_when_popped`]: the cown has never been
/// tracked by the global epoch.
pub const NO_EPOCH: u64 = u64::MAX;

const NO_CORE: usize = usize::MAX;

/// Context handed to [`Cown::run`] for a single dispatch.
///
/// `state` is the dispatching worker's position in the leak-detection
/// protocol and `mark` the epoch it currently stamps outgoing messages with.
/// Implementations that participate in leak detection mark themselves (and
/// the cowns reachable from their state) with `mark` while a scan is active.
#[derive(Copy, Clone, Debug)]
pub struct RunContext {
    /// Leak-detection state of the dispatching worker.
    pub state: LdState,
    /// Epoch the dispatching worker stamps outgoing messages with.
    pub mark: EpochMark,
}

/// Scheduler-visible header of a cown.
///
/// Every cown embeds one of these; the scheduler only ever touches a cown
/// through this header and the [`Cown`] trait. All fields are atomics so the
/// header can be read from stealing workers without further synchronization.
#[derive(Debug)]
pub struct CownInfo {
    /// Epoch the cown was last observed in, `EpochMark::None` when unmarked.
    mark: AtomicMark,
    /// Index of the core this cown is registered to, `NO_CORE` when unset.
    owner: AtomicUsize,
    /// Non-owning reference count; zero makes the stub collectible.
    weak: AtomicUsize,
    /// Global epoch at the moment the cown last left a run queue.
    popped: AtomicU64,
    /// Whether the cown's inbox is empty and the cown unscheduled.
    sleeping: AtomicBool,
    /// Set once the sweep has released this cown's state.
    collected: AtomicBool,
}

impl CownInfo {
    /// Creates a header for a freshly allocated cown holding one weak
    /// reference on behalf of its creator.
    pub fn new() -> CownInfo {
        CownInfo {
            mark: AtomicMark::default(),
            owner: AtomicUsize::new(NO_CORE),
            weak: AtomicUsize::new(1),
            popped: AtomicU64::new(NO_EPOCH),
            sleeping: AtomicBool::new(true),
            collected: AtomicBool::new(false),
        }
    }

    /// Current epoch mark.
    pub fn epoch_mark(&self) -> EpochMark {
        self.mark.load()
    }

    /// Stamps the cown with `mark`.
    pub fn set_epoch_mark(&self, mark: EpochMark) {
        self.mark.store(mark);
    }

    /// True if the cown has been observed in scan epoch `mark`.
    pub fn scanned(&self, mark: EpochMark) -> bool {
        self.mark.load() == mark
    }

    /// The core this cown is registered to, if any.
    pub fn owning_core(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_CORE => None,
            index => Some(index),
        }
    }

    /// Registers the cown to `core`. May be called once.
    pub fn set_owning_core(&self, core: usize) {
        let prev = self.owner.swap(core, Ordering::AcqRel);
        debug_assert_eq!(prev, NO_CORE, "cown registered twice");
    }

    /// Number of weak references held on this cown.
    pub fn weak_count(&self) -> usize {
        self.weak.load(Ordering::Acquire)
    }

    /// Takes an additional weak reference.
    pub fn weak_acquire(&self) {
        self.weak.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one weak reference and returns the remaining count.
    pub fn weak_release(&self) -> usize {
        let prev = self.weak.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "weak count underflow");
        if prev == 1 {
            trace!("cown stub became free");
        }
        prev - 1
    }

    /// Global epoch at the last queue pop, or [`NO_EPOCH`].
    pub fn epoch_when_popped(&self) -> u64 {
        self.popped.load(Ordering::Acquire)
    }

    /// Records the global epoch at a queue pop.
    pub fn set_epoch_when_popped(&self, epoch: u64) {
        self.popped.store(epoch, Ordering::Release);
    }

    /// Whether the cown's inbox is empty and the cown unscheduled.
    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Acquire)
    }

    /// Updates the sleeping flag. Maintained by the messaging layer: cleared
    /// when the cown is scheduled, set when its inbox goes to sleep.
    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::Release);
    }

    /// True once the sweep has run on this cown.
    pub fn is_collected(&self) -> bool {
        self.collected.load(Ordering::Acquire)
    }

    /// Marks the cown as swept; returns false if it already was.
    pub fn mark_collected(&self) -> bool {
        !self.collected.swap(true, Ordering::AcqRel)
    }
}

impl Default for CownInfo {
    fn default() -> CownInfo {
        CownInfo::new()
    }
}

/// A concurrent owner: a unit of state that processes its inbox serially and
/// is scheduled as a whole.
///
/// The scheduler is generic over this trait. It guarantees that [`run`] is
/// invoked on at most one worker at a time and never concurrently with
/// [`sweep`].
///
/// [`run`]: Cown::run
/// [`sweep`]: Cown::sweep
pub trait Cown: Send + Sync + 'static {
    /// The scheduler-visible header embedded in this cown.
    fn info(&self) -> &CownInfo;

    /// Runs one unit of work. Returning `true` reschedules the cown on the
    /// current core; returning `false` lets it go back to sleep.
    fn run(&self, ctx: RunContext) -> bool;

    /// Whether this cown may be woken by an empty message during a scan.
    ///
    /// Runtimes gate this on the cown holding external root references; the
    /// default only requires the inbox to be asleep.
    fn can_lifo_schedule(&self) -> bool {
        self.info().is_sleeping()
    }

    /// Marks this cown, and everything reachable from its state, as observed
    /// in scan epoch `mark`.
    fn scan(&self, mark: EpochMark) {
        self.info().set_epoch_mark(mark);
    }

    /// Releases the state owned by this cown after it has been proven
    /// unreachable. Runs at most once.
    fn sweep(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_counting() {
        let info = CownInfo::new();
        assert_eq!(info.weak_count(), 1);

        info.weak_acquire();
        assert_eq!(info.weak_count(), 2);

        assert_eq!(info.weak_release(), 1);
        assert_eq!(info.weak_release(), 0);
        assert_eq!(info.weak_count(), 0);
    }

    #[test]
    fn registration_is_sticky() {
        let info = CownInfo::new();
        assert_eq!(info.owning_core(), None);

        info.set_owning_core(3);
        assert_eq!(info.owning_core(), Some(3));
    }

    #[test]
    fn scanned_tracks_mark() {
        let info = CownInfo::new();
        assert!(!info.scanned(EpochMark::A));

        info.set_epoch_mark(EpochMark::A);
        assert!(info.scanned(EpochMark::A));
        assert!(!info.scanned(EpochMark::B));
    }

    #[test]
    fn collection_happens_once() {
        let info = CownInfo::new();
        assert!(!info.is_collected());
        assert!(info.mark_collected());
        assert!(!info.mark_collected());
        assert!(info.is_collected());
    }
}

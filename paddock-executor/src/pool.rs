//!
//! Pool of scheduler threads driving the cowns.
//!
//! The scheduler owns one core per worker thread, the sleep/wake hub, the
//! leak-detection consensus and the global epoch. Workers are spawned pinned
//! one per CPU core and run until the pool is quiescent: every queue empty,
//! no message in flight and, when idle leak detection is enabled, one final
//! leak-detection pass completed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{env, fmt, thread};

use tracing::{debug, trace};

use paddock_cown::{Cown, LdState};

use crate::core::Core;
use crate::epoch::GlobalEpoch;
use crate::placement;
use crate::sleepers::{IdleAction, Sleepers};
use crate::threadstate::LdConsensus;
use crate::worker::{self, Worker};

/// Environment variable overriding the worker thread count.
const THREADS_ENV: &str = "PADDOCK_THREADS";

/// Construction-time options of a [`Scheduler`].
#[derive(Clone, Debug)]
pub struct Config {
    threads: usize,
    fair: bool,
    detect_leaks: bool,
    pin: bool,
    idle_leak_detection: bool,
}

impl Config {
    /// Default configuration: one worker per CPU core (overridable with the
    /// `PADDOCK_THREADS` environment variable), fairness stealing on, leak
    /// diagnosis off, threads pinned, and a leak-detection pass run when the
    /// pool goes idle.
    pub fn new() -> Config {
        let threads = env::var_os(THREADS_ENV)
            .and_then(|raw| raw.to_str().and_then(|s| s.parse().ok()))
            .unwrap_or_else(num_cpus::get);
        Config {
            threads,
            fair: true,
            detect_leaks: false,
            pin: true,
            idle_leak_detection: true,
        }
    }

    /// Sets the number of worker threads (and cores).
    pub fn with_threads(mut self, threads: usize) -> Config {
        self.threads = threads;
        self
    }

    /// Enables or disables token-driven fairness stealing.
    pub fn with_fairness(mut self, fair: bool) -> Config {
        self.fair = fair;
        self
    }

    /// When enabled, cown stubs still referenced at teardown are kept
    /// allocated so heap diagnostics can report them.
    pub fn with_leak_detection(mut self, detect_leaks: bool) -> Config {
        self.detect_leaks = detect_leaks;
        self
    }

    /// Enables or disables pinning workers to CPU cores.
    pub fn with_pinning(mut self, pin: bool) -> Config {
        self.pin = pin;
        self
    }

    /// Enables or disables the leak-detection pass run when the pool goes
    /// idle, before it terminates.
    pub fn with_idle_leak_detection(mut self, enabled: bool) -> Config {
        self.idle_leak_detection = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

/// A pool of per-core workers scheduling cowns of type `C`.
pub struct Scheduler<C> {
    cores: Vec<Core<C>>,
    sleepers: Sleepers,
    consensus: LdConsensus,
    epoch: GlobalEpoch,
    barrier: Barrier,
    inflight: AtomicUsize,
    next_core: AtomicUsize,
    ld_requested: AtomicBool,
    ld_done: AtomicBool,
    fair: bool,
    detect_leaks: bool,
    pin: bool,
    idle_leak_detection: bool,
}

impl<C> fmt::Debug for Scheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("cores", &self.cores.len())
            .field("fair", &self.fair)
            .field("detect_leaks", &self.detect_leaks)
            .finish()
    }
}

impl<C: Cown> Scheduler<C> {
    /// Creates a scheduler with `config`'s worker count, one core per
    /// worker, linked into a victim ring.
    pub fn new(config: Config) -> Scheduler<C> {
        let threads = config.threads.max(1);
        let cores = (0..threads)
            .map(|index| Core::new(index, (index + 1) % threads))
            .collect();
        Scheduler {
            cores,
            sleepers: Sleepers::new(threads),
            consensus: LdConsensus::new(threads),
            epoch: GlobalEpoch::new(),
            barrier: Barrier::new(threads),
            inflight: AtomicUsize::new(0),
            next_core: AtomicUsize::new(0),
            ld_requested: AtomicBool::new(false),
            ld_done: AtomicBool::new(false),
            fair: config.fair,
            detect_leaks: config.detect_leaks,
            pin: config.pin,
            idle_leak_detection: config.idle_leak_detection,
        }
    }

    /// Number of cores (and workers) in this pool.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// The core at `index`.
    pub fn core(&self, index: usize) -> &Core<C> {
        &self.cores[index]
    }

    /// Whether token-driven fairness stealing is enabled.
    pub fn fair(&self) -> bool {
        self.fair
    }

    /// Whether leaked stubs are kept allocated at teardown for diagnosis.
    pub fn detect_leaks(&self) -> bool {
        self.detect_leaks
    }

    /// The global epoch counter of this pool.
    pub fn epoch(&self) -> &GlobalEpoch {
        &self.epoch
    }

    /// Schedules a cown.
    ///
    /// When called from a worker thread of this pool the cown lands on that
    /// worker's own core; otherwise cores are used round-robin.
    pub fn schedule(&self, cown: Arc<C>) {
        let index = worker::current_core(self.ident()).unwrap_or_else(|| {
            self.next_core.fetch_add(1, Ordering::Relaxed) % self.cores.len()
        });
        self.schedule_onto(index, cown);
    }

    /// Appends `cown` to the tail of core `index`'s queue.
    pub(crate) fn schedule_onto(&self, index: usize, cown: Arc<C>) {
        self.ld_done.store(false, Ordering::Release);
        let core = &self.cores[index];
        trace!(
            "enqueue cown onto core {} ({})",
            index,
            cown.info().epoch_mark()
        );
        if !cown.info().scanned(core.send_epoch()) {
            core.set_unscanned_hint();
        }
        cown.info().set_sleeping(false);
        core.q.enqueue(index, cown);
        if self.unpause() {
            core.stats.unpause();
        }
    }

    /// Schedules a cown at the front of core `index`'s queue. Used for
    /// externally triggered wakes such as asynchronous I/O completing.
    pub fn schedule_lifo(&self, index: usize, cown: Arc<C>) {
        assert!(index < self.cores.len(), "no such core: {}", index);
        self.ld_done.store(false, Ordering::Release);
        let core = &self.cores[index];
        trace!("lifo scheduling cown onto core {}", index);
        cown.info().set_sleeping(false);
        core.q.enqueue_front(index, cown);
        core.stats.lifo();
        if self.unpause() {
            core.stats.unpause();
        }
    }

    /// Runs the pool until it is quiescent: all queues drained, no messages
    /// in flight and any pending leak-detection pass completed. One worker
    /// thread is spawned per core; each is pinned when pinning is enabled.
    /// A scheduler value drives a single run.
    pub fn run(&self) {
        let core_ids = placement::get_core_ids();
        thread::scope(|scope| {
            for index in 0..self.cores.len() {
                let pin_to = if self.pin {
                    core_ids
                        .as_ref()
                        .and_then(|ids| ids.get(index % ids.len()))
                        .copied()
                } else {
                    None
                };
                thread::Builder::new()
                    .name(format!("paddock-worker-{}", index))
                    .spawn_scoped(scope, move || {
                        if let Some(core_id) = pin_to {
                            placement::set_for_current(core_id);
                        }
                        Worker::new(self, index).run();
                    })
                    .expect("cannot start the scheduler thread");
            }
        });
        debug!("scheduler ran to quiescence");
    }

    /// Asks the pool to run a leak-detection pass as soon as possible.
    pub fn request_leak_detection(&self) {
        self.ld_requested.store(true, Ordering::Release);
        self.unpause();
    }

    /// Records that a message entered the system; paired with
    /// [`message_processed`](Scheduler::message_processed). The pool only
    /// believes a scan is complete once the two counts balance.
    pub fn message_sent(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that a previously sent message has been fully processed.
    pub fn message_processed(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "message count underflow");
    }

    /// True when every sent message has been processed.
    pub fn no_inflight_messages(&self) -> bool {
        self.inflight.load(Ordering::Acquire) == 0
    }

    /// Drops one weak reference to `cown`, updating its home core's free
    /// count when the stub becomes collectible.
    pub fn release_weak(&self, cown: &Arc<C>) {
        if cown.info().weak_release() == 0 {
            if let Some(index) = cown.info().owning_core() {
                self.cores[index].mark_stub_free();
            }
        }
    }

    /// True while a scan epoch is live pool-wide.
    pub(crate) fn should_scan(&self) -> bool {
        self.consensus.should_scan()
    }

    pub(crate) fn next_state(&self, index: usize, cur: LdState) -> LdState {
        let next = self.consensus.next_state(index, cur);
        if next == LdState::Finished {
            self.ld_done.store(true, Ordering::Release);
        }
        next
    }

    pub(crate) fn take_ld_request(&self) -> bool {
        self.ld_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn unpause(&self) -> bool {
        self.sleepers.unpause()
    }

    /// Parks the calling worker. Returns `false` when the pool decided to
    /// shut down instead.
    pub(crate) fn pause(&self) -> bool {
        self.sleepers.pause(|| {
            if self.any_work() {
                IdleAction::WakeAll
            } else if !self.no_inflight_messages() {
                // Messages are still in flight; their producers will wake us.
                IdleAction::Park
            } else if self.idle_leak_detection && !self.ld_done.load(Ordering::Acquire) {
                debug!("pool idle: requesting a leak-detection pass");
                self.ld_requested.store(true, Ordering::Release);
                IdleAction::WakeAll
            } else {
                debug!("pool quiescent: shutting down");
                IdleAction::Shutdown
            }
        })
    }

    pub(crate) fn enter_barrier(&self) {
        self.barrier.wait();
    }

    pub(crate) fn ident(&self) -> usize {
        self as *const Scheduler<C> as usize
    }

    fn any_work(&self) -> bool {
        self.cores.iter().any(|core| core.q.has_work())
    }
}

//!
//! The scheduler worker: dispatch loop, stealing and the leak-detection
//! protocol driver.
//!
//! One worker services each core. Its loop pops the local queue, steals from
//! a rotating victim when idle, and parks once a quiescence timeout elapses.
//! Progress of the local queue is measured by the core's token: the token is
//! popped exactly when everything enqueued before it has been popped, and
//! its return triggers both fairness stealing and the leak-detection
//! checkpoints.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tracing::{debug, trace};

use paddock_cown::{Cown, EpochMark, LdState, RunContext};

use crate::core::Core;
use crate::pool::Scheduler;
use crate::run_queue::Slot;

/// Spin budget before an idle worker is allowed to park.
const QUIESCENCE_TIMEOUT: Duration = Duration::from_millis(1);

thread_local! {
    /// Identity of the pool and core the current thread works for.
    static CURRENT: Cell<Option<(usize, usize)>> = Cell::new(None);

    /// Message of the behaviour currently executing on this thread.
    static MESSAGE_BODY: RefCell<Option<Box<dyn Any + Send>>> = RefCell::new(None);
}

/// The core index the current thread services for the pool identified by
/// `ident`, if any.
pub(crate) fn current_core(ident: usize) -> Option<usize> {
    CURRENT.with(|current| {
        current
            .get()
            .and_then(|(pool, index)| (pool == ident).then_some(index))
    })
}

/// Stores the message of the behaviour executing on this worker thread. The
/// slot is cleared when the dispatch completes.
pub fn set_message_body(body: Box<dyn Any + Send>) {
    MESSAGE_BODY.with(|slot| *slot.borrow_mut() = Some(body));
}

/// Takes the message of the behaviour executing on this worker thread.
pub fn take_message_body() -> Option<Box<dyn Any + Send>> {
    MESSAGE_BODY.with(|slot| slot.borrow_mut().take())
}

struct CurrentGuard;

impl CurrentGuard {
    fn enter(ident: usize, index: usize) -> CurrentGuard {
        CURRENT.with(|current| current.set(Some((ident, index))));
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(None));
        MESSAGE_BODY.with(|slot| slot.borrow_mut().take());
    }
}

/// A scheduler thread servicing one core.
pub(crate) struct Worker<'a, C: Cown> {
    pool: &'a Scheduler<C>,
    index: usize,
    /// Core currently targeted when stealing.
    victim: usize,
    running: bool,
    /// Token sightings left before this worker's leak-detection checkpoint.
    n_ld_tokens: u8,
    should_steal_for_fairness: bool,
    /// Epoch saved across a scan; the scan epoch is its opposite.
    prev_epoch: EpochMark,
    state: LdState,
}

impl<'a, C: Cown> Worker<'a, C> {
    pub(crate) fn new(pool: &'a Scheduler<C>, index: usize) -> Worker<'a, C> {
        Worker {
            pool,
            index,
            victim: pool.core(index).next(),
            running: true,
            n_ld_tokens: 0,
            should_steal_for_fairness: false,
            prev_epoch: EpochMark::B,
            state: LdState::NotInLd,
        }
    }

    fn core(&self) -> &'a Core<C> {
        self.pool.core(self.index)
    }

    fn send_epoch(&self) -> EpochMark {
        self.core().send_epoch()
    }

    /// The dispatch loop. Returns once the pool has shut down and this
    /// worker has finished both teardown phases.
    pub(crate) fn run(&mut self) {
        let _guard = CurrentGuard::enter(self.pool.ident(), self.index);
        self.core().servicing_threads.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        debug!("worker {} started", self.index);

        let mut slot: Option<Slot<C>> = None;

        loop {
            // Opportunistic stub collection while the registry is mostly
            // free stubs.
            if self.core().total_cowns() < self.core().free_cowns() * 2 {
                self.collect_cown_stubs(false);
            }

            if self.should_steal_for_fairness && slot.is_none() {
                self.should_steal_for_fairness = false;
                slot = self.fast_steal();
            }

            if slot.is_none() {
                slot = self.core().q.dequeue();
            }

            if slot.is_none() {
                slot = self.steal();
                // If we cannot steal, the pool is shutting down.
                if slot.is_none() {
                    break;
                }
            }

            let cown = match self.prerun(slot.take().expect("slot populated above")) {
                Some(cown) => cown,
                None => continue,
            };

            // An unscanned cown moving through this core holds the protocol
            // back, whether it was stolen or rescheduled with an empty
            // queue.
            if self.pool.should_scan() && !cown.info().scanned(self.send_epoch()) {
                trace!("worker {} popped an unscanned cown", self.index);
                self.core().set_unscanned_hint();
            }

            self.ld_protocol();

            // Progress is accounted to the cown's home core; dispatching
            // for a foreign core counts on both.
            let home = cown.info().owning_core().expect("cown registered in prerun");
            self.pool.core(home).count_progress();
            if home != self.index {
                self.core().count_progress();
            }
            self.core().note_worker(self.index);

            trace!("worker {} running cown", self.index);
            let reschedule = cown.run(RunContext {
                state: self.state,
                mark: self.send_epoch(),
            });
            MESSAGE_BODY.with(|body| body.borrow_mut().take());

            if !reschedule {
                continue;
            }

            debug_assert!(!cown.info().is_sleeping());
            if self.should_steal_for_fairness {
                self.schedule_fifo(cown);
                continue;
            }

            // Push to the back of the queue only if other work is waiting;
            // keeping our only cown in hand stops another worker from
            // stealing it between the two queue operations.
            match self.core().q.dequeue() {
                Some(next) => {
                    self.schedule_fifo(cown);
                    slot = Some(next);
                }
                None => {
                    let mut stolen = None;
                    if self.core().q.nothing_old() {
                        trace!("worker {} queue empty", self.index);
                        // We have effectively reached our token.
                        self.n_ld_tokens = 0;
                        if self.pool.fair() {
                            stolen = self.fast_steal();
                        }
                    }
                    match stolen {
                        Some(other) => {
                            self.schedule_fifo(cown);
                            slot = Some(other);
                        }
                        // Queue empty and nothing to steal: run it again.
                        None => slot = Some(Slot::Cown(cown)),
                    }
                }
            }
        }

        self.teardown();
    }

    /// Two-phase teardown: drain the queue, rendezvous with the other
    /// workers, then reclaim stubs under a fresh epoch.
    fn teardown(&mut self) {
        debug!("worker {} teardown phase one", self.index);
        self.core().drain_queue();
        self.pool.enter_barrier();

        self.pool.epoch().advance();
        self.collect_cown_stubs(true);
        debug!("worker {} teardown phase two complete", self.index);

        let remaining = self
            .core()
            .servicing_threads
            .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
        if remaining == 1 {
            debug!("destroying core {}", self.index);
            self.core().q.destroy();
            self.core().stats.log(self.index);
        }
    }

    /// Re-enqueues a cown on our own core.
    fn schedule_fifo(&self, cown: Arc<C>) {
        trace!(
            "worker {} re-enqueueing cown ({})",
            self.index,
            cown.info().epoch_mark()
        );
        if !cown.info().scanned(self.send_epoch()) {
            self.core().set_unscanned_hint();
        }
        debug_assert!(!cown.info().is_sleeping());
        self.core().q.enqueue(self.index, cown);
        if self.pool.unpause() {
            self.core().stats.unpause();
        }
    }

    /// One non-blocking dequeue from the current victim; rotates the victim
    /// on failure.
    fn fast_steal(&mut self) -> Option<Slot<C>> {
        if self.victim != self.index {
            if let Some(slot) = self.pool.core(self.victim).q.dequeue() {
                trace!(
                    "worker {} fast-stole from core {}",
                    self.index,
                    self.victim
                );
                return Some(slot);
            }
        }
        self.victim = self.pool.core(self.victim).next();
        None
    }

    /// Blocking steal loop. Returns `None` only when the pool shuts down.
    fn steal(&mut self) -> Option<Slot<C>> {
        let backoff = Backoff::new();
        let start = Instant::now();

        while self.running {
            if self.core().q.nothing_old() {
                self.n_ld_tokens = 0;
            }

            self.ld_protocol();

            // Another worker may have pushed onto our queue.
            if let Some(slot) = self.core().q.dequeue() {
                return Some(slot);
            }

            if self.victim != self.index {
                if let Some(slot) = self.pool.core(self.victim).q.dequeue() {
                    self.core().stats.steal();
                    trace!("worker {} stole from core {}", self.index, self.victim);
                    return Some(slot);
                }
            }
            self.victim = self.pool.core(self.victim).next();

            if start.elapsed() < QUIESCENCE_TIMEOUT {
                backoff.snooze();
                continue;
            }

            // Park only outside the leak-detection protocol; the other
            // workers are waiting on our votes.
            if self.state == LdState::NotInLd {
                if self.pool.pause() {
                    self.core().stats.pause();
                } else {
                    self.running = false;
                }
            } else {
                backoff.snooze();
            }
        }

        None
    }

    /// Administrative work after a pop, before a cown may be dispatched.
    ///
    /// Tokens are put back on the queue they measure and yield no cown. A
    /// cown popped for the first time is registered to this core.
    fn prerun(&mut self, slot: Slot<C>) -> Option<Arc<C>> {
        match slot {
            Slot::Token(owner) => {
                if owner == self.index {
                    trace!("worker {} reached its token", self.index);
                    if self.pool.fair() {
                        self.should_steal_for_fairness = true;
                    }
                    if self.n_ld_tokens > 0 {
                        self.dec_n_ld_tokens();
                    }
                } else {
                    trace!(
                        "worker {} popped a token stolen from core {}",
                        self.index,
                        owner
                    );
                }
                self.pool.core(owner).q.enqueue_token(owner);
                None
            }
            Slot::Cown(cown) => {
                cown.info().set_epoch_when_popped(self.pool.epoch().current());
                if cown.info().owning_core().is_none() {
                    trace!("binding cown to core {}", self.index);
                    cown.info().set_owning_core(self.index);
                    self.core().add_cown(cown.clone());
                }
                Some(cown)
            }
        }
    }

    fn dec_n_ld_tokens(&mut self) {
        debug_assert!(self.n_ld_tokens == 1 || self.n_ld_tokens == 2);
        trace!("worker {} reached a leak-detection token", self.index);
        self.n_ld_tokens -= 1;
    }

    fn ld_checkpoint_reached(&self) -> bool {
        self.n_ld_tokens == 0
    }

    fn want_ld(&mut self) {
        if self.state == LdState::NotInLd {
            debug!("worker {} requesting leak detection", self.index);
            self.ld_state_change(LdState::WantLd);
        }
    }

    /// Plays catch-up with the pool-wide protocol state and votes for new
    /// states when this worker's evidence allows it.
    fn ld_protocol(&mut self) {
        if self.state == LdState::NotInLd && self.pool.take_ld_request() {
            self.want_ld();
        }

        // At the checkpoint, either vote that scanning looks complete or
        // rescan to drain newly observed unscanned work.
        if self.state == LdState::AllInScan && self.ld_checkpoint_reached() {
            if !self.core().unscanned_hint() && self.pool.no_inflight_messages() {
                self.ld_state_change(LdState::BelieveDoneVote);
            } else {
                self.enter_scan();
            }
        }

        loop {
            let sprev = self.state;
            let snext = self.pool.next_state(self.index, sprev);

            // A lost wake-up here can leave the whole pool asleep halfway
            // into a scan; prod the sleepers.
            if sprev == LdState::PreScan && snext == LdState::PreScan && self.pool.unpause() {
                self.core().stats.unpause();
            }

            if snext == sprev {
                return;
            }

            self.ld_state_change(snext);

            match self.state {
                LdState::PreScan => {
                    if self.pool.unpause() {
                        self.core().stats.unpause();
                    }
                    self.enter_prescan();
                    return;
                }
                LdState::Scan => {
                    // Re-entry after a retract keeps the epoch chosen when
                    // the pass began; `prev_epoch` is only saved in PreScan.
                    self.enter_scan();
                    return;
                }
                LdState::AllInScan => {
                    if sprev == LdState::PreScan {
                        self.enter_scan();
                    }
                    return;
                }
                LdState::BelieveDone => {
                    if self.core().unscanned_hint() {
                        self.ld_state_change(LdState::BelieveDoneRetract);
                    } else {
                        self.ld_state_change(LdState::BelieveDoneConfirm);
                    }
                    continue;
                }
                LdState::Sweep => {
                    self.collect_cowns();
                    continue;
                }
                _ => continue,
            }
        }
    }

    fn ld_state_change(&mut self, next: LdState) {
        debug!("worker {} ld state: {} -> {}", self.index, self.state, next);
        self.state = next;
    }

    fn enter_prescan(&mut self) {
        // Messages sent from here on must be distinguishable from work that
        // predates the scan.
        self.prev_epoch = self.send_epoch();
        self.core().set_send_epoch(EpochMark::None);
    }

    fn enter_scan(&mut self) {
        let scan_epoch = if self.prev_epoch == EpochMark::B {
            EpochMark::A
        } else {
            EpochMark::B
        };
        self.core().set_send_epoch(scan_epoch);
        debug!("worker {} scanning in {}", self.index, scan_epoch);

        // Wake every scannable cown with an empty message so the
        // reachability frontier is marked.
        for cown in self.core().lifo_candidates() {
            self.pool.schedule_lifo(self.index, cown);
        }

        // Two token sightings: the first token may have been in flight
        // before the scan started.
        self.n_ld_tokens = 2;
        self.core().clear_unscanned_hint();
    }

    fn collect_cowns(&self) {
        self.core().try_collect(self.send_epoch());
    }

    fn collect_cown_stubs(&self, during_teardown: bool) {
        // A concurrent sweeper may still be deciding the fate of these
        // stubs.
        match self.state {
            LdState::ReallyDoneConfirm | LdState::Finished => return,
            _ => {}
        }
        self.core()
            .collect_stubs(self.pool.epoch(), during_teardown, self.pool.detect_leaks());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Config;
    use crate::test_support::TestCown;

    fn pool(threads: usize) -> Scheduler<TestCown> {
        Scheduler::new(
            Config::new()
                .with_threads(threads)
                .with_pinning(false)
                .with_idle_leak_detection(false),
        )
    }

    #[test]
    fn own_token_triggers_fairness_stealing() {
        let pool = pool(2);
        let mut worker = Worker::new(&pool, 0);

        // First cown in: [cown, token]. Pop and register it.
        pool.schedule_onto(0, Arc::new(TestCown::new(1)));
        let slot = pool.core(0).q.dequeue().unwrap();
        assert!(worker.prerun(slot).is_some());

        // New work behind the lone token hands the token out next.
        pool.schedule_onto(0, Arc::new(TestCown::new(1)));
        let token = pool.core(0).q.dequeue().unwrap();
        assert!(matches!(token, Slot::Token(0)));

        assert!(worker.prerun(token).is_none());
        assert!(worker.should_steal_for_fairness);

        // The token went straight back to our queue.
        assert!(!pool.core(0).q.nothing_old());
    }

    #[test]
    fn stolen_tokens_go_home_without_flipping_fairness() {
        let pool = pool(2);
        let mut thief = Worker::new(&pool, 1);

        pool.schedule_onto(0, Arc::new(TestCown::new(1)));
        let slot = pool.core(0).q.dequeue().unwrap();
        assert!(thief.prerun(slot).is_some());
        pool.schedule_onto(0, Arc::new(TestCown::new(1)));

        // The thief pops core 0's token.
        let token = pool.core(0).q.dequeue().unwrap();
        assert!(matches!(token, Slot::Token(0)));
        assert!(thief.prerun(token).is_none());

        assert!(!thief.should_steal_for_fairness);
    }

    #[test]
    fn first_pop_registers_the_cown() {
        let pool = pool(2);
        let mut worker = Worker::new(&pool, 1);
        let cown = Arc::new(TestCown::new(1));

        pool.schedule_onto(0, cown.clone());
        let slot = pool.core(0).q.dequeue().unwrap();
        let popped = worker.prerun(slot).unwrap();

        assert!(Arc::ptr_eq(&popped, &cown));
        assert_eq!(cown.info().owning_core(), Some(1));
        assert_eq!(pool.core(1).total_cowns(), 1);
        // The pop was recorded against the global epoch.
        assert_eq!(
            cown.info().epoch_when_popped(),
            pool.epoch().current()
        );
    }

    #[test]
    fn a_lone_worker_walks_the_whole_protocol() {
        let pool = pool(1);
        let mut worker = Worker::new(&pool, 0);

        // A marked (reachable) and an unmarked (garbage) cown, both asleep
        // and neither eligible for scan wake-ups.
        let reachable = Arc::new(TestCown::sleeper());
        let garbage = Arc::new(TestCown::sleeper());
        for cown in [&reachable, &garbage] {
            cown.info().set_owning_core(0);
            pool.core(0).add_cown(Arc::clone(cown));
        }
        // The scan epoch will be B (the opposite of the saved epoch A).
        reachable.info().set_epoch_mark(EpochMark::B);

        worker.want_ld();
        worker.ld_protocol();
        assert_eq!(worker.state, LdState::PreScan);
        assert_eq!(worker.send_epoch(), EpochMark::None);

        worker.ld_protocol();
        assert_eq!(worker.state, LdState::Scan);
        assert_eq!(worker.send_epoch(), EpochMark::B);

        worker.ld_protocol();
        assert_eq!(worker.state, LdState::AllInScan);

        // The idle loop observes an empty queue and resets the checkpoint.
        worker.n_ld_tokens = 0;
        worker.ld_protocol();
        assert_eq!(worker.state, LdState::NotInLd);

        assert!(!reachable.swept());
        assert!(garbage.swept());
    }

    #[test]
    fn unscanned_work_forces_another_scan_round() {
        let pool = pool(1);
        let mut worker = Worker::new(&pool, 0);

        worker.want_ld();
        worker.ld_protocol();
        worker.ld_protocol();
        worker.ld_protocol();
        assert_eq!(worker.state, LdState::AllInScan);

        // Unscanned work was seen: the checkpoint rescans instead of
        // voting, then the clean round completes the pass.
        worker.n_ld_tokens = 0;
        pool.core(0).set_unscanned_hint();
        worker.ld_protocol();
        assert_eq!(worker.state, LdState::AllInScan);
        assert_eq!(worker.n_ld_tokens, 2);

        worker.n_ld_tokens = 0;
        worker.ld_protocol();
        assert_eq!(worker.state, LdState::NotInLd);
    }
}

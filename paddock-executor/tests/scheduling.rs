use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use paddock_executor::prelude::*;

/// Runs a fixed number of times, spinning for `work` each time, then goes
/// back to sleep. Empty wake-ups are absorbed without counting.
struct Counter {
    info: CownInfo,
    runs: AtomicU64,
    remaining: AtomicU64,
    work: Duration,
}

impl Counter {
    fn new(remaining: u64, work: Duration) -> Counter {
        Counter {
            info: CownInfo::new(),
            runs: AtomicU64::new(0),
            remaining: AtomicU64::new(remaining),
            work,
        }
    }

    fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
}

impl Cown for Counter {
    fn info(&self) -> &CownInfo {
        &self.info
    }

    fn run(&self, ctx: RunContext) -> bool {
        self.info.set_epoch_mark(ctx.mark);

        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == 0 {
            self.info.set_sleeping(true);
            return false;
        }
        if !self.work.is_zero() {
            thread::sleep(self.work);
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
}

fn config(threads: usize) -> Config {
    Config::new()
        .with_threads(threads)
        .with_pinning(false)
        .with_idle_leak_detection(false)
}

#[test]
fn a_self_rescheduling_cown_runs_to_completion() {
    let pool = Scheduler::new(config(1));
    let cown = Arc::new(Counter::new(3, Duration::ZERO));

    pool.schedule(cown.clone());
    pool.run();

    assert_eq!(cown.runs(), 3);
    assert_eq!(pool.core(0).progress(), 3);
}

#[test]
fn an_idle_worker_steals_queued_work() {
    let pool = Scheduler::new(config(2));
    let cowns: Vec<_> = (0..4)
        .map(|_| Arc::new(Counter::new(3, Duration::from_millis(2))))
        .collect();

    // Pile everything onto core 0 and let core 1's worker help itself.
    for cown in &cowns {
        pool.schedule_lifo(0, cown.clone());
    }
    pool.run();

    for cown in &cowns {
        assert_eq!(cown.runs(), 3);
    }
    assert!(
        pool.core(1).stats().steals() >= 1,
        "the idle worker never stole"
    );
}

#[test]
fn work_spreads_over_both_cores() {
    let pool = Scheduler::new(config(2));
    let cowns: Vec<_> = (0..16)
        .map(|_| Arc::new(Counter::new(5, Duration::from_micros(200))))
        .collect();

    for cown in &cowns {
        pool.schedule(cown.clone());
    }
    pool.run();

    for cown in &cowns {
        assert_eq!(cown.runs(), 5);
    }
    // External schedules round-robin, so both cores made progress.
    assert!(pool.core(0).progress() > 0);
    assert!(pool.core(1).progress() > 0);
}

#[test]
fn a_fair_pool_drains_a_long_queue() {
    // Fairness stealing is on by default; a long queue behind a token must
    // still drain completely with a second worker active.
    let pool = Scheduler::new(config(2).with_fairness(true));
    let long: Vec<_> = (0..8)
        .map(|_| Arc::new(Counter::new(4, Duration::from_micros(500))))
        .collect();

    for cown in &long {
        pool.schedule_lifo(0, cown.clone());
    }
    pool.run();

    for cown in &long {
        assert_eq!(cown.runs(), 4);
    }
}

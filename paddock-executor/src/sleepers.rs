//!
//! Parking of idle workers.
//!
//! A worker that ran out of local and stealable work parks here until a
//! producer publishes new work. The last worker to park gets to decide what
//! happens to the whole pool: keep sleeping, wake everyone, or shut down.

use parking_lot::{Condvar, Mutex};

/// Decision taken by the pool when every worker has gone idle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum IdleAction {
    /// Nothing to do yet; an external producer will wake us.
    Park,
    /// There is pool-internal work to pick up; wake all workers.
    WakeAll,
    /// The pool is quiescent for good; terminate every worker.
    Shutdown,
}

#[derive(Debug)]
struct SleepState {
    sleeping: usize,
    notified: usize,
    shutdown: bool,
}

/// Wait/notify hub shared by all workers of one scheduler.
#[derive(Debug)]
pub(crate) struct Sleepers {
    threads: usize,
    state: Mutex<SleepState>,
    wake: Condvar,
}

impl Sleepers {
    pub(crate) fn new(threads: usize) -> Sleepers {
        Sleepers {
            threads,
            state: Mutex::new(SleepState {
                sleeping: 0,
                notified: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Signals one paused worker, if any. Returns whether a worker was
    /// actually signalled.
    pub(crate) fn unpause(&self) -> bool {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }
        if state.sleeping > state.notified {
            state.notified += 1;
            self.wake.notify_one();
            true
        } else {
            false
        }
    }

    /// Parks the calling worker until new work is published.
    ///
    /// When the caller is the last active worker and no wake is pending,
    /// `when_all_idle` is consulted under the lock. Returns `false` iff the
    /// pool is shutting down.
    pub(crate) fn pause<F>(&self, when_all_idle: F) -> bool
    where
        F: FnOnce() -> IdleAction,
    {
        let mut state = self.state.lock();
        if state.shutdown {
            return false;
        }

        state.sleeping += 1;
        if state.sleeping == self.threads && state.notified == 0 {
            match when_all_idle() {
                IdleAction::Park => {}
                IdleAction::WakeAll => {
                    state.sleeping -= 1;
                    state.notified = state.sleeping;
                    self.wake.notify_all();
                    return true;
                }
                IdleAction::Shutdown => {
                    state.sleeping -= 1;
                    state.shutdown = true;
                    self.wake.notify_all();
                    return false;
                }
            }
        }

        loop {
            self.wake.wait(&mut state);
            if state.shutdown {
                state.sleeping -= 1;
                return false;
            }
            if state.notified > 0 {
                state.notified -= 1;
                state.sleeping -= 1;
                return true;
            }
            // Spurious wake-up: go back to sleep.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpause_without_sleepers_signals_nobody() {
        let sleepers = Sleepers::new(2);
        assert!(!sleepers.unpause());
    }

    #[test]
    fn pause_wakes_on_unpause() {
        let sleepers = Arc::new(Sleepers::new(2));
        let parked = Arc::clone(&sleepers);

        let handle = thread::spawn(move || parked.pause(|| IdleAction::Park));

        // Keep signalling until the sleeper is actually parked.
        while !sleepers.unpause() {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.join().unwrap());
    }

    #[test]
    fn last_sleeper_can_shut_the_pool_down() {
        let sleepers = Arc::new(Sleepers::new(2));
        let parked = Arc::clone(&sleepers);

        let handle = thread::spawn(move || parked.pause(|| IdleAction::Park));
        thread::sleep(Duration::from_millis(10));

        // Second (last) sleeper decides to shut down; both observe it.
        assert!(!sleepers.pause(|| IdleAction::Shutdown));
        assert!(!handle.join().unwrap());

        // Later pauses fail fast.
        assert!(!sleepers.pause(|| IdleAction::Park));
        assert!(!sleepers.unpause());
    }

    #[test]
    fn last_sleeper_can_wake_the_pool() {
        let sleepers = Arc::new(Sleepers::new(2));
        let parked = Arc::clone(&sleepers);

        let handle = thread::spawn(move || parked.pause(|| IdleAction::Park));
        thread::sleep(Duration::from_millis(10));

        assert!(sleepers.pause(|| IdleAction::WakeAll));
        assert!(handle.join().unwrap());
    }
}

//!
//! Consensus machine of the leak-detection protocol.
//!
//! Workers never change protocol state on their own authority (voting states
//! excepted): each one repeatedly reports its position and asks for the next
//! state it is permitted to move to. The machine advances the pool-wide
//! state once every worker has caught up with it, one step at a time, so all
//! workers observe the same sequence of transitions.

use parking_lot::Mutex;
use tracing::debug;

use paddock_cown::LdState;

/// Serialized pool-wide view of the protocol.
#[derive(Debug)]
pub(crate) struct LdConsensus {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    global: LdState,
    workers: Vec<LdState>,
}

impl LdConsensus {
    pub(crate) fn new(threads: usize) -> LdConsensus {
        LdConsensus {
            inner: Mutex::new(Inner {
                global: LdState::NotInLd,
                workers: vec![LdState::NotInLd; threads],
            }),
        }
    }

    /// The pool-wide state.
    pub(crate) fn global(&self) -> LdState {
        self.inner.lock().global
    }

    /// True while a scan epoch is live and marks are meaningful.
    pub(crate) fn should_scan(&self) -> bool {
        matches!(
            self.global(),
            LdState::Scan | LdState::AllInScan | LdState::BelieveDone
        )
    }

    /// Records that worker `index` is in `cur` and returns the next state it
    /// may move to. Idempotent while no quorum has changed.
    pub(crate) fn next_state(&self, index: usize, cur: LdState) -> LdState {
        let mut inner = self.inner.lock();
        inner.workers[index] = cur;
        inner.advance();

        let next = inner.step(cur);
        if next != cur {
            inner.workers[index] = next;
            // The step itself may have completed a quorum.
            inner.advance();
        }
        next
    }
}

impl Inner {
    /// Moves the pool-wide state forward when the votes allow it.
    fn advance(&mut self) {
        use LdState::*;

        let next = match self.global {
            NotInLd => {
                if self.workers.iter().any(|s| *s == WantLd) {
                    PreScan
                } else {
                    return;
                }
            }
            PreScan => {
                if self.all(PreScan) {
                    Scan
                } else {
                    return;
                }
            }
            Scan => {
                if self.all(Scan) {
                    AllInScan
                } else {
                    return;
                }
            }
            AllInScan => {
                if self.all(BelieveDoneVote) {
                    BelieveDone
                } else {
                    return;
                }
            }
            BelieveDone => {
                let all_decided = self
                    .workers
                    .iter()
                    .all(|s| matches!(s, BelieveDoneConfirm | BelieveDoneRetract));
                if !all_decided {
                    return;
                }
                if self.workers.iter().any(|s| *s == BelieveDoneRetract) {
                    // Someone saw unscanned work after voting: scan again.
                    Scan
                } else {
                    ReallyDoneConfirm
                }
            }
            ReallyDoneConfirm => {
                if self.all(ReallyDoneConfirm) {
                    Sweep
                } else {
                    return;
                }
            }
            Sweep => {
                if self.all(Sweep) {
                    Finished
                } else {
                    return;
                }
            }
            Finished => {
                if self.all(Finished) {
                    NotInLd
                } else {
                    return;
                }
            }
            // The pool-wide state never takes a worker-only value.
            WantLd | BelieveDoneVote | BelieveDoneConfirm | BelieveDoneRetract => return,
        };

        debug!("ld pool state: {} -> {}", self.global, next);
        self.global = next;
    }

    /// One step along the protocol path toward the pool-wide state.
    fn step(&self, cur: LdState) -> LdState {
        use LdState::*;

        if cur == self.global {
            return cur;
        }
        match cur {
            NotInLd | WantLd => match self.global {
                PreScan | Scan | AllInScan => PreScan,
                _ => cur,
            },
            PreScan => match self.global {
                Scan | AllInScan => Scan,
                _ => cur,
            },
            Scan => match self.global {
                AllInScan | BelieveDone => AllInScan,
                _ => cur,
            },
            // Leaves only by voting, a local decision.
            AllInScan => cur,
            BelieveDoneVote => match self.global {
                BelieveDone => BelieveDone,
                _ => cur,
            },
            // Leaves only by confirming or retracting, a local decision.
            BelieveDone => cur,
            BelieveDoneConfirm => match self.global {
                ReallyDoneConfirm => ReallyDoneConfirm,
                Scan => Scan,
                _ => cur,
            },
            BelieveDoneRetract => match self.global {
                Scan => Scan,
                _ => cur,
            },
            ReallyDoneConfirm => match self.global {
                Sweep => Sweep,
                _ => cur,
            },
            Sweep => match self.global {
                Finished => Finished,
                _ => cur,
            },
            Finished => match self.global {
                NotInLd => NotInLd,
                _ => cur,
            },
        }
    }

    fn all(&self, state: LdState) -> bool {
        self.workers.iter().all(|s| *s == state)
    }
}

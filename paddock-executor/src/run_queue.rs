//!
//! Per-core run queue with an in-band token marker.
//!
//! The queue is FIFO for producers, with a LIFO front-push reserved for
//! external wakes. Next to ordinary cowns it carries a single token slot per
//! core: an inert marker whose pop signifies that everything enqueued before
//! it has been popped. The token doubles as the queue's stub. A queue holding
//! only its token reports empty, and the token is only handed out once newer
//! work sits behind it, so a popped token always testifies to real progress.
//!
//! Other workers dequeue from this queue when stealing, so every operation
//! takes the queue lock; the critical sections are a handful of deque moves.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use paddock_cown::Cown;

/// One element of a run queue.
pub enum Slot<C> {
    /// The token of the core whose index is carried; never executed.
    Token(usize),
    /// A cown ready to process messages.
    Cown(Arc<C>),
}

impl<C> fmt::Debug for Slot<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Token(core) => f.debug_tuple("Token").field(core).finish(),
            Slot::Cown(cown) => f
                .debug_tuple("Cown")
                .field(&Arc::as_ptr(cown))
                .finish(),
        }
    }
}

/// Multi-producer multi-consumer run queue of one core.
#[derive(Debug)]
pub struct CownQueue<C> {
    inner: Mutex<Inner<C>>,
}

#[derive(Debug)]
struct Inner<C> {
    slots: VecDeque<Slot<C>>,
    token_present: bool,
}

impl<C: Cown> CownQueue<C> {
    /// Creates an empty queue.
    pub fn new() -> CownQueue<C> {
        CownQueue {
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                token_present: false,
            }),
        }
    }

    /// Appends a cown to the tail. If no token is circulating, the owning
    /// core's token is enqueued behind it so the new work is measured.
    pub fn enqueue(&self, owner: usize, cown: Arc<C>) {
        let mut q = self.inner.lock();
        q.slots.push_back(Slot::Cown(cown));
        q.ensure_token(owner);
    }

    /// Pushes a cown to the front; used for externally triggered wakes.
    pub fn enqueue_front(&self, owner: usize, cown: Arc<C>) {
        let mut q = self.inner.lock();
        q.slots.push_front(Slot::Cown(cown));
        q.ensure_token(owner);
    }

    /// Puts the token of core `owner` back after it has been popped.
    pub fn enqueue_token(&self, owner: usize) {
        let mut q = self.inner.lock();
        debug_assert!(!q.token_present, "token enqueued twice");
        q.slots.push_back(Slot::Token(owner));
        q.token_present = true;
    }

    /// Pops the head of the queue.
    ///
    /// A queue holding nothing but its token reports empty; the token is
    /// only returned when newer work has been enqueued behind it.
    pub fn dequeue(&self) -> Option<Slot<C>> {
        let mut q = self.inner.lock();
        let only_the_token =
            q.slots.len() == 1 && matches!(q.slots.front(), Some(Slot::Token(_)));
        if only_the_token {
            return None;
        }
        let slot = q.slots.pop_front();
        if let Some(Slot::Token(_)) = slot {
            q.token_present = false;
        }
        slot
    }

    /// True iff no cown enqueued before the last token cycle remains: the
    /// queue is empty up to its token.
    pub fn nothing_old(&self) -> bool {
        let q = self.inner.lock();
        matches!(q.slots.front(), None | Some(Slot::Token(_)))
    }

    /// True iff the queue holds at least one cown.
    pub fn has_work(&self) -> bool {
        let q = self.inner.lock();
        q.slots.iter().any(|s| matches!(s, Slot::Cown(_)))
    }

    /// Drains the queue, dropping any remaining cowns. Returns how many
    /// cowns were discarded.
    pub fn destroy(&self) -> usize {
        let mut q = self.inner.lock();
        let dropped = q
            .slots
            .iter()
            .filter(|s| matches!(s, Slot::Cown(_)))
            .count();
        if dropped > 0 {
            trace!("dropping {} queued cowns at queue destruction", dropped);
        }
        q.slots.clear();
        q.token_present = false;
        dropped
    }
}

impl<C: Cown> Default for CownQueue<C> {
    fn default() -> CownQueue<C> {
        CownQueue::new()
    }
}

impl<C> Inner<C> {
    fn ensure_token(&mut self, owner: usize) {
        if !self.token_present {
            self.slots.push_back(Slot::Token(owner));
            self.token_present = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestCown;
    use proptest::prelude::*;

    fn cown() -> Arc<TestCown> {
        Arc::new(TestCown::new(1))
    }

    fn is_token(slot: &Slot<TestCown>) -> bool {
        matches!(slot, Slot::Token(_))
    }

    #[test]
    fn empty_queue_dequeues_nothing() {
        let q: CownQueue<TestCown> = CownQueue::new();
        assert!(q.dequeue().is_none());
        assert!(q.nothing_old());
        assert!(!q.has_work());
    }

    #[test]
    fn token_rides_behind_first_enqueue() {
        let q = CownQueue::new();
        q.enqueue(0, cown());

        // The cown comes out first, then the queue holds only the token and
        // reports empty.
        assert!(matches!(q.dequeue(), Some(Slot::Cown(_))));
        assert!(q.dequeue().is_none());
        assert!(q.nothing_old());
    }

    #[test]
    fn token_pops_once_new_work_lands_behind_it() {
        let q = CownQueue::new();
        q.enqueue(0, cown());
        assert!(matches!(q.dequeue(), Some(Slot::Cown(_))));

        // [token] + new cown -> the token is handed out first.
        q.enqueue(0, cown());
        let slot = q.dequeue().unwrap();
        assert!(is_token(&slot));

        // Cycle it and the cown is next, with the token behind it again.
        q.enqueue_token(0);
        assert!(matches!(q.dequeue(), Some(Slot::Cown(_))));
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn nothing_old_sees_work_ahead_of_the_token() {
        let q = CownQueue::new();
        q.enqueue(0, cown());
        assert!(!q.nothing_old());

        assert!(matches!(q.dequeue(), Some(Slot::Cown(_))));
        assert!(q.nothing_old());
    }

    #[test]
    fn front_push_skips_the_line() {
        let q = CownQueue::new();
        let first = cown();
        let woken = cown();
        q.enqueue(0, first.clone());
        q.enqueue_front(0, woken.clone());

        match q.dequeue() {
            Some(Slot::Cown(c)) => assert!(Arc::ptr_eq(&c, &woken)),
            other => panic!("expected the woken cown, got {:?}", other),
        }
        match q.dequeue() {
            Some(Slot::Cown(c)) => assert!(Arc::ptr_eq(&c, &first)),
            other => panic!("expected the first cown, got {:?}", other),
        }
    }

    #[test]
    fn destroy_reports_dropped_cowns() {
        let q = CownQueue::new();
        q.enqueue(0, cown());
        q.enqueue(0, cown());
        assert_eq!(q.destroy(), 2);
        assert!(q.dequeue().is_none());
    }

    proptest! {
        // Random interleavings of queue operations never duplicate the token
        // and never lose a cown.
        #[test]
        fn token_is_unique_and_cowns_are_conserved(ops in proptest::collection::vec(0u8..3, 1..64)) {
            let q = CownQueue::new();
            let mut live = 0usize;
            let mut popped_tokens = 0usize;

            for op in ops {
                match op {
                    0 => {
                        q.enqueue(0, cown());
                        live += 1;
                    }
                    1 => {
                        q.enqueue_front(0, cown());
                        live += 1;
                    }
                    _ => match q.dequeue() {
                        Some(Slot::Cown(_)) => live -= 1,
                        Some(Slot::Token(owner)) => {
                            prop_assert_eq!(owner, 0);
                            popped_tokens += 1;
                            q.enqueue_token(0);
                        }
                        None => {}
                    },
                }
            }

            // Drain what is left: exactly the live cowns, with at most one
            // token among them.
            let mut drained = 0usize;
            while let Some(slot) = q.dequeue() {
                match slot {
                    Slot::Cown(_) => drained += 1,
                    Slot::Token(_) => q.enqueue_token(0),
                }
            }
            prop_assert_eq!(drained, live);
            let _ = popped_tokens;
        }
    }
}

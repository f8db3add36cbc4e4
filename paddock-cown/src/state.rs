use std::fmt;

/// Position of a scheduler worker in the leak-detection protocol.
///
/// The protocol is a distributed consensus between all workers: each worker
/// keeps its own `LdState` and plays catch-up with the pool-wide state by
/// repeatedly asking the coordinator for the next state it is permitted to
/// move to. The forward path is
///
/// ```text
/// NotInLd -> WantLd -> PreScan -> Scan -> AllInScan -> BelieveDoneVote
///         -> BelieveDone -> BelieveDoneConfirm -> ReallyDoneConfirm
///         -> Sweep -> Finished -> NotInLd
/// ```
///
/// with `BelieveDoneRetract` sending the whole pool back to `Scan` when any
/// worker observed unscanned work after voting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LdState {
    /// Not participating in a leak-detection pass.
    NotInLd,
    /// This worker has asked the pool to start a pass.
    WantLd,
    /// Quarantine phase: outgoing messages are stamped `EpochMark::None` so
    /// that work sent before the scan cannot be mistaken for scanned work.
    PreScan,
    /// The scan epoch is live; reachable cowns are being marked.
    Scan,
    /// Every worker has entered `Scan`; each is draining its queue down to
    /// its local checkpoint.
    AllInScan,
    /// This worker has reached its checkpoint and votes that scanning looks
    /// complete.
    BelieveDoneVote,
    /// Every worker voted; each now double-checks before confirming.
    BelieveDone,
    /// No unscanned work was seen since voting.
    BelieveDoneConfirm,
    /// Unscanned work was seen since voting; the pass falls back to `Scan`.
    BelieveDoneRetract,
    /// All workers confirmed; the sweep may begin.
    ReallyDoneConfirm,
    /// Unreachable cowns are being collected.
    Sweep,
    /// The pass is complete; stub collection is inhibited until every worker
    /// has acknowledged.
    Finished,
}

impl fmt::Display for LdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

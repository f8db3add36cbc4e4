//!
//! Concurrent-owner (cown) abstraction for the paddock scheduler.
//!
//! A cown owns a piece of state and processes the messages addressed to it
//! serially. This crate defines the contract between a cown and the
//! scheduler: the [`Cown`] trait, the scheduler-visible header
//! ([`CownInfo`]), the epoch marks used by the leak-detection protocol and
//! the protocol states themselves. It is deliberately independent of the
//! executor so alternative runtimes can schedule the same cowns.

pub mod cown;
pub mod epoch;
pub mod state;

pub use crate::cown::{Cown, CownInfo, RunContext, NO_EPOCH};
pub use crate::epoch::{AtomicMark, EpochMark};
pub use crate::state::LdState;

/// Prelude of the cown abstraction.
pub mod prelude {
    pub use crate::cown::{Cown, CownInfo, RunContext, NO_EPOCH};
    pub use crate::epoch::{AtomicMark, EpochMark};
    pub use crate::state::LdState;
}

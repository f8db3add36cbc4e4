use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Tri-state tag carried by cowns and messages.
///
/// The leak detector runs its scans in alternating epochs. While a scan is
/// active every message is stamped with the scan's epoch; a cown whose mark
/// matches the current send epoch has been observed reachable in that scan.
/// `None` marks messages sent while a scan is being set up, so that they are
/// clearly distinguishable from work that predates the scan.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EpochMark {
    /// First scan epoch.
    A = 0,
    /// Second scan epoch.
    B = 1,
    /// Not attributed to any scan epoch.
    None = 2,
}

impl EpochMark {
    fn from_u8(raw: u8) -> EpochMark {
        match raw {
            0 => EpochMark::A,
            1 => EpochMark::B,
            _ => EpochMark::None,
        }
    }
}

impl fmt::Display for EpochMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpochMark::A => write!(f, "epoch-a"),
            EpochMark::B => write!(f, "epoch-b"),
            EpochMark::None => write!(f, "epoch-none"),
        }
    }
}

/// An [`EpochMark`] that can be read and written concurrently.
#[derive(Debug)]
pub struct AtomicMark(AtomicU8);

impl AtomicMark {
    /// Creates a new atomic mark holding `mark`.
    pub fn new(mark: EpochMark) -> AtomicMark {
        AtomicMark(AtomicU8::new(mark as u8))
    }

    /// Reads the current mark.
    pub fn load(&self) -> EpochMark {
        EpochMark::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Publishes a new mark.
    pub fn store(&self, mark: EpochMark) {
        self.0.store(mark as u8, Ordering::Release);
    }
}

impl Default for AtomicMark {
    fn default() -> AtomicMark {
        AtomicMark::new(EpochMark::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_mark_round_trips() {
        let mark = AtomicMark::default();
        assert_eq!(mark.load(), EpochMark::None);

        mark.store(EpochMark::A);
        assert_eq!(mark.load(), EpochMark::A);

        mark.store(EpochMark::B);
        assert_eq!(mark.load(), EpochMark::B);
    }
}

//!
//! Core placement configuration and management.
//!
//! Scheduler workers are pinned one per core; this module enumerates the
//! cores available to the process and binds the current thread to one of
//! them. On platforms without an affinity syscall the pin is a no-op and the
//! scheduler degrades to ordinary OS placement.

/// Identifies one schedulable CPU core.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreId {
    /// OS-level core index.
    pub id: usize,
}

/// Retrieves the cores the current process may run on.
pub fn get_core_ids() -> Option<Vec<CoreId>> {
    imp::get_core_ids()
}

/// Binds the current thread to `core_id`.
pub fn set_for_current(core_id: CoreId) {
    tracing::debug!("pinning worker thread to core {}", core_id.id);
    imp::set_for_current(core_id);
}

#[cfg(target_os = "linux")]
mod imp {
    use std::mem;

    use libc::{cpu_set_t, sched_getaffinity, sched_setaffinity, CPU_ISSET, CPU_SET, CPU_SETSIZE};

    use super::CoreId;

    pub(super) fn get_core_ids() -> Option<Vec<CoreId>> {
        let mask = affinity_mask()?;
        let cores = (0..CPU_SETSIZE as usize)
            .filter(|i| unsafe { CPU_ISSET(*i, &mask) })
            .map(|id| CoreId { id })
            .collect();
        Some(cores)
    }

    pub(super) fn set_for_current(core_id: CoreId) {
        let mut set = unsafe { mem::zeroed::<cpu_set_t>() };
        unsafe { CPU_SET(core_id.id, &mut set) };

        // 0 targets the calling thread.
        unsafe {
            sched_setaffinity(0, mem::size_of::<cpu_set_t>(), &set);
        }
    }

    fn affinity_mask() -> Option<cpu_set_t> {
        let mut set = unsafe { mem::zeroed::<cpu_set_t>() };
        let result = unsafe { sched_getaffinity(0, mem::size_of::<cpu_set_t>(), &mut set) };
        if result == 0 {
            Some(set)
        } else {
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::CoreId;

    pub(super) fn get_core_ids() -> Option<Vec<CoreId>> {
        Some((0..num_cpus::get()).map(|id| CoreId { id }).collect())
    }

    pub(super) fn set_for_current(_core_id: CoreId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_ids_are_available() {
        let ids = get_core_ids().unwrap();
        assert!(!ids.is_empty());
    }

    #[test]
    fn pinning_does_not_fail() {
        let ids = get_core_ids().unwrap();
        set_for_current(ids[0]);
    }
}

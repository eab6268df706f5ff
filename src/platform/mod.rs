//! OS process primitives and the affinity mutator built on top of them.
//!
//! Everything that touches another process goes through [`ProcessControl`]. A handle is
//! acquired per call and released when the returned [`ProcessHandle`] value drops, so no
//! handle outlives the operation that opened it, whatever path the operation takes.
//!
//! Platform strategy:
//! - Linux: pidfd handles, `sched_{get,set}affinity` through nix, start times via psutil
//! - Windows: `OpenProcess` handles and the process affinity APIs through the windows crate

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[cfg(test)]
pub mod fake;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::{process_alive, prepare_privileges, SystemProcessControl};
#[cfg(windows)]
pub use self::windows::{process_alive, prepare_privileges, SystemProcessControl};

/// Failure modes of a single process operation. None of them is fatal to the tool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AffinityError {
    #[error("permission denied accessing process {pid}")]
    PermissionDenied { pid: u32 },
    #[error("process {pid} no longer exists")]
    ProcessGone { pid: u32 },
    #[error("mask {mask:#x} shares no CPU with ceiling {ceiling:#x} (pid {pid})")]
    EmptyIntersection { pid: u32, mask: u64, ceiling: u64 },
    #[error("process {pid} cannot be managed")]
    Unmanageable { pid: u32 },
    #[error("{operation} failed for process {pid}: {message}")]
    Os {
        pid: u32,
        operation: &'static str,
        message: String,
    },
    #[error("process affinity is not supported on this platform")]
    Unsupported,
}

/// Access requested when opening a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Query,
    QueryAndSet,
    Set,
    Terminate,
}

/// Affinity as reported by the OS for one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityState {
    pub current: u64,
    /// CPUs the process could be given at most.
    pub ceiling: u64,
}

/// Outcome of a successful [`AffinityMutator::write_affinity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedAffinity {
    /// Mask in effect right before the write.
    pub previous: u64,
    pub applied: u64,
    pub ceiling: u64,
}

/// An open process. Dropping it releases the underlying OS resource.
pub trait ProcessHandle {
    fn pid(&self) -> u32;
    fn affinity(&self) -> Result<AffinityState, AffinityError>;
    fn set_affinity(&self, mask: u64) -> Result<(), AffinityError>;
    fn start_time(&self) -> Option<DateTime<Utc>>;
    fn terminate(&self) -> Result<(), AffinityError>;
}

/// Opens processes. Implemented by the real OS layer and by the in-memory fake used in tests.
pub trait ProcessControl {
    type Handle: ProcessHandle;

    fn open(&self, pid: u32, access: Access) -> Result<Self::Handle, AffinityError>;

    /// System affinity mask available to this tool's own process.
    fn own_ceiling(&self) -> u64;
}

/// The only component that mutates other processes.
#[derive(Debug)]
pub struct AffinityMutator<C: ProcessControl> {
    control: C,
    /// Captured once at construction.
    own_ceiling: u64,
}

impl<C: ProcessControl> AffinityMutator<C> {
    pub fn new(control: C) -> Self {
        let own_ceiling = control.own_ceiling();
        debug!(own_ceiling = format!("{own_ceiling:#x}"), "affinity mutator ready");
        Self {
            control,
            own_ceiling,
        }
    }

    pub fn own_ceiling(&self) -> u64 {
        self.own_ceiling
    }

    /// Current mask and ceiling of a process, intersected with our own ceiling.
    pub fn read_affinity(&self, pid: u32) -> Result<AffinityState, AffinityError> {
        if pid == 0 {
            return Err(AffinityError::Unmanageable { pid });
        }
        let handle = self.control.open(pid, Access::Query)?;
        let state = handle.affinity()?;
        Ok(AffinityState {
            current: state.current,
            ceiling: state.ceiling & self.own_ceiling,
        })
    }

    /// Applies `proposed & ceiling` to `pid`.
    ///
    /// Pid 0 and an empty proposal are refused before any handle is opened. An empty
    /// intersection with the ceiling leaves the process untouched.
    pub fn write_affinity(&self, pid: u32, proposed: u64) -> Result<AppliedAffinity, AffinityError> {
        if pid == 0 || proposed == 0 {
            return Err(AffinityError::Unmanageable { pid });
        }

        let handle = self.control.open(pid, Access::QueryAndSet)?;
        let state = handle.affinity()?;
        let ceiling = state.ceiling & self.own_ceiling;
        let applied = proposed & ceiling;
        if applied == 0 {
            return Err(AffinityError::EmptyIntersection {
                pid,
                mask: proposed,
                ceiling,
            });
        }

        handle.set_affinity(applied)?;
        debug!(
            pid,
            previous = format!("{:#x}", state.current),
            applied = format!("{applied:#x}"),
            "affinity updated"
        );
        Ok(AppliedAffinity {
            previous: state.current,
            applied,
            ceiling,
        })
    }

    /// Best effort; `None` means unknown and is not an error.
    pub fn read_start_time(&self, pid: u32) -> Option<DateTime<Utc>> {
        if pid == 0 {
            return None;
        }
        self.control
            .open(pid, Access::Query)
            .ok()
            .and_then(|handle| handle.start_time())
    }

    /// Puts back a mask captured earlier. Failures are logged, never propagated.
    pub fn restore_affinity(&self, pid: u32, original: u64) -> bool {
        if pid == 0 || original == 0 {
            return false;
        }
        let result = self
            .control
            .open(pid, Access::Set)
            .and_then(|handle| handle.set_affinity(original));
        match result {
            Ok(()) => {
                debug!(pid, original = format!("{original:#x}"), "affinity restored");
                true
            }
            Err(err) => {
                warn!(pid, "unable to restore affinity: {err}");
                false
            }
        }
    }

    pub fn terminate(&self, pid: u32) -> Result<(), AffinityError> {
        if pid == 0 {
            return Err(AffinityError::Unmanageable { pid });
        }
        let handle = self.control.open(pid, Access::Terminate)?;
        handle.terminate()
    }
}

/// Bit mask with the lowest `count` bits set, saturating at 64 CPUs.
pub fn mask_for_cpu_count(count: usize) -> u64 {
    if count >= 64 {
        u64::MAX
    } else {
        (1u64 << count) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeProcessControl;
    use super::*;

    fn mutator_with(fake: &FakeProcessControl) -> AffinityMutator<FakeProcessControl> {
        AffinityMutator::new(fake.clone())
    }

    #[test]
    fn write_intersects_with_process_ceiling() {
        let fake = FakeProcessControl::with_ceiling(0b1111);
        fake.spawn(100, "game.exe", 0b1111);
        let mutator = mutator_with(&fake);

        let applied = mutator.write_affinity(100, 0b11_1010).unwrap();
        assert_eq!(applied.previous, 0b1111);
        assert_eq!(applied.applied, 0b1010);
        assert_eq!(applied.ceiling, 0b1111);
        assert_eq!(fake.affinity_of(100), Some(0b1010));
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn empty_intersection_leaves_process_untouched() {
        let fake = FakeProcessControl::with_ceiling(0b0011);
        fake.spawn(7, "tool", 0b0011);
        let mutator = mutator_with(&fake);

        let err = mutator.write_affinity(7, 0b1100).unwrap_err();
        assert!(matches!(err, AffinityError::EmptyIntersection { pid: 7, .. }));
        assert_eq!(fake.affinity_of(7), Some(0b0011));
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn pid_zero_and_zero_mask_never_open_a_handle() {
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(5, "x", 0xff);
        let mutator = mutator_with(&fake);

        assert_eq!(
            mutator.write_affinity(0, 0b1),
            Err(AffinityError::Unmanageable { pid: 0 })
        );
        assert_eq!(
            mutator.write_affinity(5, 0),
            Err(AffinityError::Unmanageable { pid: 5 })
        );
        assert_eq!(fake.total_opens(), 0);
    }

    #[test]
    fn denied_process_is_reported_and_handle_released() {
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(9, "protected", 0xff);
        fake.deny_set(9);
        let mutator = mutator_with(&fake);

        let err = mutator.write_affinity(9, 0b1).unwrap_err();
        assert_eq!(err, AffinityError::PermissionDenied { pid: 9 });
        assert_eq!(fake.affinity_of(9), Some(0xff));
        assert!(fake.total_opens() > 0);
        assert_eq!(fake.open_handles(), 0);
    }

    #[test]
    fn own_ceiling_limits_applied_mask() {
        let fake = FakeProcessControl::with_ceiling(0b0111);
        fake.spawn_with_ceiling(11, "wide", 0xff, 0xff);
        let mutator = mutator_with(&fake);

        let applied = mutator.write_affinity(11, 0b1110).unwrap();
        assert_eq!(applied.applied, 0b0110);
        assert_eq!(applied.ceiling, 0b0111);
    }

    #[test]
    fn restore_reports_failure_for_vanished_process() {
        let fake = FakeProcessControl::with_ceiling(0xff);
        let mutator = mutator_with(&fake);
        assert!(!mutator.restore_affinity(42, 0b1));
        assert!(!mutator.restore_affinity(0, 0b1));
    }

    #[test]
    fn start_time_is_best_effort() {
        let fake = FakeProcessControl::with_ceiling(0xff);
        let mutator = mutator_with(&fake);
        assert_eq!(mutator.read_start_time(0), None);
        assert_eq!(mutator.read_start_time(1234), None);
    }

    #[test]
    fn cpu_count_masks() {
        assert_eq!(mask_for_cpu_count(0), 0);
        assert_eq!(mask_for_cpu_count(4), 0b1111);
        assert_eq!(mask_for_cpu_count(64), u64::MAX);
        assert_eq!(mask_for_cpu_count(128), u64::MAX);
    }
}

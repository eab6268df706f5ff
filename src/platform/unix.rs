use super::{mask_for_cpu_count, Access, AffinityError, AffinityState, ProcessControl, ProcessHandle};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::os::fd::OwnedFd;
use std::time::SystemTime;
use tracing::debug;

/// Process control backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl SystemProcessControl {
    pub fn new() -> Self {
        Self
    }
}

/// An open process.
///
/// On Linux the handle pins the process with a pidfd, so a pid recycled after `open` is
/// detected when signalling it. Kernels without `pidfd_open` fall back to a liveness probe.
#[derive(Debug)]
pub struct UnixProcessHandle {
    pid: u32,
    pidfd: Option<OwnedFd>,
}

impl ProcessControl for SystemProcessControl {
    type Handle = UnixProcessHandle;

    fn open(&self, pid: u32, _access: Access) -> Result<UnixProcessHandle, AffinityError> {
        if pid == 0 {
            return Err(AffinityError::Unmanageable { pid });
        }
        let pidfd = open_pidfd(pid)?;
        Ok(UnixProcessHandle { pid, pidfd })
    }

    fn own_ceiling(&self) -> u64 {
        own_affinity_mask()
    }
}

impl ProcessHandle for UnixProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn affinity(&self) -> Result<AffinityState, AffinityError> {
        read_affinity(self.pid)
    }

    fn set_affinity(&self, mask: u64) -> Result<(), AffinityError> {
        write_affinity(self.pid, mask)
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        let process = psutil::process::Process::new(self.pid).ok()?;
        let created = process.create_time();
        if created.is_zero() {
            return None;
        }
        Some(DateTime::<Utc>::from(creation_origin()? + created))
    }

    fn terminate(&self) -> Result<(), AffinityError> {
        if let Some(fd) = &self.pidfd {
            return kill_via_pidfd(self.pid, fd);
        }

        kill(to_pid(self.pid), Signal::SIGKILL)
            .map_err(|errno| map_errno(self.pid, "terminate", errno))?;
        debug!(pid = self.pid, "sent SIGKILL");
        Ok(())
    }
}

/// Signals through the pidfd so a recycled pid can never be hit.
#[cfg(target_os = "linux")]
fn kill_via_pidfd(pid: u32, fd: &OwnedFd) -> Result<(), AffinityError> {
    use std::os::fd::AsRawFd;

    let result = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            fd.as_raw_fd(),
            libc::SIGKILL,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    if result == 0 {
        debug!(pid, "sent SIGKILL via pidfd");
        Ok(())
    } else {
        Err(map_errno(pid, "terminate", Errno::last()))
    }
}

#[cfg(not(target_os = "linux"))]
fn kill_via_pidfd(pid: u32, _fd: &OwnedFd) -> Result<(), AffinityError> {
    kill(to_pid(pid), Signal::SIGKILL).map_err(|errno| map_errno(pid, "terminate", errno))
}

/// Check if process is alive
///
/// EPERM means the process exists but belongs to someone else.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match kill(to_pid(pid), None) {
        Ok(()) => true,
        Err(errno) => errno == Errno::EPERM,
    }
}

/// Nothing to adjust on Unix: access is decided by ownership and CAP_SYS_NICE.
pub fn prepare_privileges() -> std::io::Result<()> {
    Ok(())
}

/// What psutil's `create_time` is relative to: boot on Linux, the epoch elsewhere.
#[cfg(target_os = "linux")]
fn creation_origin() -> Option<SystemTime> {
    psutil::host::boot_time().ok()
}

#[cfg(not(target_os = "linux"))]
fn creation_origin() -> Option<SystemTime> {
    Some(SystemTime::UNIX_EPOCH)
}

fn to_pid(pid: u32) -> Pid {
    Pid::from_raw(pid as libc::pid_t)
}

#[cfg(target_os = "linux")]
fn open_pidfd(pid: u32) -> Result<Option<OwnedFd>, AffinityError> {
    use std::os::fd::FromRawFd;

    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd >= 0 {
        return Ok(Some(unsafe { OwnedFd::from_raw_fd(fd as libc::c_int) }));
    }
    match Errno::last() {
        Errno::ENOSYS => {
            if process_alive(pid) {
                Ok(None)
            } else {
                Err(AffinityError::ProcessGone { pid })
            }
        }
        errno => Err(map_errno(pid, "open", errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn open_pidfd(pid: u32) -> Result<Option<OwnedFd>, AffinityError> {
    if process_alive(pid) {
        Ok(None)
    } else {
        Err(AffinityError::ProcessGone { pid })
    }
}

#[cfg(target_os = "linux")]
fn read_affinity(pid: u32) -> Result<AffinityState, AffinityError> {
    let cpus = nix::sched::sched_getaffinity(to_pid(pid))
        .map_err(|errno| map_errno(pid, "sched_getaffinity", errno))?;
    let current = cpu_set_mask(&cpus);
    Ok(AffinityState {
        current,
        ceiling: online_cpu_mask(),
    })
}

#[cfg(target_os = "linux")]
fn write_affinity(pid: u32, mask: u64) -> Result<(), AffinityError> {
    let mut cpus = nix::sched::CpuSet::new();
    for cpu in (0..64).filter(|cpu| mask & (1u64 << cpu) != 0) {
        cpus.set(cpu)
            .map_err(|errno| map_errno(pid, "cpuset", errno))?;
    }
    nix::sched::sched_setaffinity(to_pid(pid), &cpus)
        .map_err(|errno| map_errno(pid, "sched_setaffinity", errno))
}

#[cfg(target_os = "linux")]
fn cpu_set_mask(cpus: &nix::sched::CpuSet) -> u64 {
    let limit = nix::sched::CpuSet::count().min(64);
    (0..limit)
        .filter(|cpu| cpus.is_set(*cpu).unwrap_or(false))
        .fold(0u64, |mask, cpu| mask | (1u64 << cpu))
}

/// Our own affinity at the time of the call; pid 0 addresses the calling thread.
#[cfg(target_os = "linux")]
fn own_affinity_mask() -> u64 {
    match nix::sched::sched_getaffinity(Pid::from_raw(0)) {
        Ok(cpus) => match cpu_set_mask(&cpus) {
            0 => online_cpu_mask(),
            mask => mask,
        },
        Err(errno) => {
            debug!("sched_getaffinity on self failed: {errno}");
            online_cpu_mask()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn own_affinity_mask() -> u64 {
    online_cpu_mask()
}

#[cfg(not(target_os = "linux"))]
fn read_affinity(_pid: u32) -> Result<AffinityState, AffinityError> {
    Err(AffinityError::Unsupported)
}

#[cfg(not(target_os = "linux"))]
fn write_affinity(_pid: u32, _mask: u64) -> Result<(), AffinityError> {
    Err(AffinityError::Unsupported)
}

const ONLINE_CPUS: &str = "/sys/devices/system/cpu/online";

/// Mask of the CPUs currently online, capped at 64.
///
/// Read from sysfs so offline CPUs in the middle of the range stay out of the mask.
/// Falls back to the online count when sysfs is unavailable.
fn online_cpu_mask() -> u64 {
    if let Some(mask) = std::fs::read_to_string(ONLINE_CPUS)
        .ok()
        .and_then(|list| parse_cpu_list(&list))
    {
        return mask;
    }
    let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if count <= 0 {
        return u64::MAX;
    }
    mask_for_cpu_count(count as usize)
}

/// Parses a kernel cpu list such as `0-3,6-7`. CPUs past 63 are ignored.
fn parse_cpu_list(list: &str) -> Option<u64> {
    let mut mask = 0u64;
    for part in list.trim().split(',').filter(|part| !part.is_empty()) {
        let (first, last) = match part.split_once('-') {
            Some((first, last)) => (first.parse::<u32>().ok()?, last.parse::<u32>().ok()?),
            None => {
                let cpu = part.parse::<u32>().ok()?;
                (cpu, cpu)
            }
        };
        for cpu in first..=last.min(63) {
            mask |= 1u64 << cpu;
        }
    }
    (mask != 0).then_some(mask)
}

fn map_errno(pid: u32, operation: &'static str, errno: Errno) -> AffinityError {
    match errno {
        Errno::EPERM | Errno::EACCES => AffinityError::PermissionDenied { pid },
        Errno::ESRCH => AffinityError::ProcessGone { pid },
        other => AffinityError::Os {
            pid,
            operation,
            message: other.desc().to_string(),
        },
    }
}

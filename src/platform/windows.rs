//! Windows process control through `OpenProcess` and the process affinity APIs.

use super::{Access, AffinityError, AffinityState, ProcessControl, ProcessHandle};
use ::windows::core::{w, PCWSTR};
use ::windows::Win32::Foundation::{
    CloseHandle, E_ACCESSDENIED, ERROR_INVALID_PARAMETER, FILETIME, HANDLE, LUID, STILL_ACTIVE,
};
use ::windows::Win32::Security::{
    AdjustTokenPrivileges, LookupPrivilegeValueW, LUID_AND_ATTRIBUTES, SE_PRIVILEGE_ENABLED,
    TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
};
use ::windows::Win32::System::Threading::{
    GetCurrentProcess, GetExitCodeProcess, GetProcessAffinityMask, GetProcessTimes, OpenProcess,
    OpenProcessToken, SetProcessAffinityMask, TerminateProcess, PROCESS_ACCESS_RIGHTS,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_SET_INFORMATION, PROCESS_TERMINATE,
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Seconds between 1601-01-01 (FILETIME epoch) and the Unix epoch.
const FILETIME_UNIX_OFFSET_SECS: i64 = 11_644_473_600;

/// Process control backed by the Win32 API.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl SystemProcessControl {
    pub fn new() -> Self {
        Self
    }
}

/// Owned process handle, closed on drop.
#[derive(Debug)]
pub struct WindowsProcessHandle {
    pid: u32,
    handle: HANDLE,
}

impl Drop for WindowsProcessHandle {
    fn drop(&mut self) {
        if let Err(err) = unsafe { CloseHandle(self.handle) } {
            warn!(pid = self.pid, "CloseHandle failed: {err}");
        }
    }
}

fn rights_for(access: Access) -> PROCESS_ACCESS_RIGHTS {
    match access {
        Access::Query => PROCESS_QUERY_LIMITED_INFORMATION,
        Access::QueryAndSet => PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_SET_INFORMATION,
        Access::Set => PROCESS_SET_INFORMATION,
        Access::Terminate => PROCESS_TERMINATE,
    }
}

impl ProcessControl for SystemProcessControl {
    type Handle = WindowsProcessHandle;

    fn open(&self, pid: u32, access: Access) -> Result<WindowsProcessHandle, AffinityError> {
        if pid == 0 {
            return Err(AffinityError::Unmanageable { pid });
        }
        let handle = unsafe { OpenProcess(rights_for(access), false, pid) }
            .map_err(|err| map_error(pid, "OpenProcess", err))?;
        Ok(WindowsProcessHandle { pid, handle })
    }

    fn own_ceiling(&self) -> u64 {
        let mut process_mask = 0usize;
        let mut system_mask = 0usize;
        match unsafe { GetProcessAffinityMask(GetCurrentProcess(), &mut process_mask, &mut system_mask) } {
            Ok(()) => process_mask as u64,
            Err(err) => {
                warn!("unable to read own affinity, assuming every CPU: {err}");
                u64::MAX
            }
        }
    }
}

impl ProcessHandle for WindowsProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn affinity(&self) -> Result<AffinityState, AffinityError> {
        let mut process_mask = 0usize;
        let mut system_mask = 0usize;
        unsafe { GetProcessAffinityMask(self.handle, &mut process_mask, &mut system_mask) }
            .map_err(|err| map_error(self.pid, "GetProcessAffinityMask", err))?;
        Ok(AffinityState {
            current: process_mask as u64,
            ceiling: system_mask as u64,
        })
    }

    fn set_affinity(&self, mask: u64) -> Result<(), AffinityError> {
        unsafe { SetProcessAffinityMask(self.handle, mask as usize) }
            .map_err(|err| map_error(self.pid, "SetProcessAffinityMask", err))
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        let mut creation = FILETIME::default();
        let mut exit = FILETIME::default();
        let mut kernel = FILETIME::default();
        let mut user = FILETIME::default();
        unsafe { GetProcessTimes(self.handle, &mut creation, &mut exit, &mut kernel, &mut user) }.ok()?;
        filetime_to_utc(creation)
    }

    fn terminate(&self) -> Result<(), AffinityError> {
        unsafe { TerminateProcess(self.handle, 1) }
            .map_err(|err| map_error(self.pid, "TerminateProcess", err))?;
        debug!(pid = self.pid, "process terminated");
        Ok(())
    }
}

/// Check if process is alive
///
/// A process we may not open still exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let handle = match unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) } {
        Ok(handle) => WindowsProcessHandle { pid, handle },
        Err(err) => return err.code() == E_ACCESSDENIED,
    };
    let mut code = 0u32;
    match unsafe { GetExitCodeProcess(handle.handle, &mut code) } {
        Ok(()) => code == STILL_ACTIVE.0 as u32,
        Err(_) => false,
    }
}

/// Enables SeDebugPrivilege so processes of other users can be opened.
pub fn prepare_privileges() -> std::io::Result<()> {
    let mut token = HANDLE::default();
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
            &mut token,
        )
    }
    .map_err(to_io)?;
    let token = WindowsProcessHandle {
        pid: std::process::id(),
        handle: token,
    };

    let mut luid = LUID::default();
    unsafe { LookupPrivilegeValueW(PCWSTR::null(), w!("SeDebugPrivilege"), &mut luid) }
        .map_err(to_io)?;

    let privileges = TOKEN_PRIVILEGES {
        PrivilegeCount: 1,
        Privileges: [LUID_AND_ATTRIBUTES {
            Luid: luid,
            Attributes: SE_PRIVILEGE_ENABLED,
        }],
    };
    unsafe { AdjustTokenPrivileges(token.handle, false, Some(&privileges), 0, None, None) }
        .map_err(to_io)?;
    debug!("SeDebugPrivilege enabled");
    Ok(())
}

fn to_io(err: ::windows::core::Error) -> std::io::Error {
    std::io::Error::other(err.message().to_string())
}

fn filetime_to_utc(time: FILETIME) -> Option<DateTime<Utc>> {
    let ticks = (u64::from(time.dwHighDateTime) << 32) | u64::from(time.dwLowDateTime);
    if ticks == 0 {
        return None;
    }
    let secs = (ticks / 10_000_000) as i64 - FILETIME_UNIX_OFFSET_SECS;
    let nanos = ((ticks % 10_000_000) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn map_error(pid: u32, operation: &'static str, err: ::windows::core::Error) -> AffinityError {
    let code = err.code();
    if code == E_ACCESSDENIED {
        AffinityError::PermissionDenied { pid }
    } else if code == ERROR_INVALID_PARAMETER.to_hresult() {
        // OpenProcess reports a pid that no longer exists as an invalid parameter
        AffinityError::ProcessGone { pid }
    } else {
        AffinityError::Os {
            pid,
            operation,
            message: err.message().to_string(),
        }
    }
}

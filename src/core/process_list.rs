//! Process enumeration
//!
//! Platform strategy:
//! - Linux/macOS: psutil walks the process table
//! - Windows: a sysinfo `System` kept across ticks and refreshed in place

use crate::core::models::ProcessEntry;
use thiserror::Error;

#[cfg(unix)]
use std::path::Path;

#[cfg(windows)]
use std::cell::RefCell;
#[cfg(windows)]
use sysinfo::{ProcessesToUpdate, System};

#[derive(Error, Debug)]
pub enum ProcessListError {
    #[cfg(unix)]
    #[error("Failed to enumerate processes: {0}")]
    Enumerate(#[from] psutil::Error),
    #[cfg(windows)]
    #[error("Failed to enumerate processes: {0}")]
    Enumerate(String),
}

/// Source of `{pid, name}` snapshots for the reconciliation engine.
pub trait ProcessSource {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessListError>;
}

/// Enumerates the processes of the running system.
#[derive(Debug)]
pub struct SystemProcessSource {
    #[cfg(windows)]
    system: RefCell<System>,
}

impl SystemProcessSource {
    pub fn new() -> Self {
        Self {
            #[cfg(windows)]
            system: RefCell::new(System::new()),
        }
    }
}

impl Default for SystemProcessSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl ProcessSource for SystemProcessSource {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessListError> {
        let processes = psutil::process::processes()?;
        // A process can exit between listing and reading its name; it is simply left out.
        Ok(processes
            .into_iter()
            .filter_map(|process| process.ok())
            .filter_map(|process| {
                let name = process_name(&process)?;
                Some(ProcessEntry::new(process.pid(), name))
            })
            .collect())
    }
}

/// Longest name the kernel keeps in `/proc/<pid>/stat` before truncating.
#[cfg(unix)]
const COMM_LEN: usize = 15;

/// The process name, recovering the full name when the kernel truncated `comm`.
#[cfg(unix)]
fn process_name(process: &psutil::process::Process) -> Option<String> {
    let comm = process.name().ok()?;
    if comm.len() < COMM_LEN {
        return Some(comm);
    }
    let exe_name = process.exe().ok().and_then(|exe| {
        exe.file_name()
            .map(|name| name.to_string_lossy().trim_end_matches(" (deleted)").to_string())
    });
    let argv0_name = process
        .cmdline_vec()
        .ok()
        .flatten()
        .and_then(|argv| argv.into_iter().next())
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        });
    Some(extend_truncated_name(comm, exe_name.into_iter().chain(argv0_name)))
}

/// First candidate that starts with the truncated `comm`, else `comm` itself.
#[cfg(unix)]
fn extend_truncated_name(comm: String, candidates: impl IntoIterator<Item = String>) -> String {
    candidates
        .into_iter()
        .find(|candidate| candidate.len() > comm.len() && candidate.starts_with(comm.as_str()))
        .unwrap_or(comm)
}

#[cfg(windows)]
impl ProcessSource for SystemProcessSource {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessListError> {
        let mut system = self
            .system
            .try_borrow_mut()
            .map_err(|err| ProcessListError::Enumerate(err.to_string()))?;
        system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(system
            .processes()
            .iter()
            .map(|(pid, process)| {
                ProcessEntry::new(pid.as_u32(), process.name().to_string_lossy().into_owned())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_current_process() {
        let source = SystemProcessSource::new();
        let entries = source.snapshot().expect("enumerate processes");
        let own = std::process::id();
        assert!(entries.iter().any(|entry| entry.pid == own && !entry.name.is_empty()));
    }

    #[cfg(unix)]
    #[test]
    fn truncated_comm_takes_the_matching_candidate() {
        let comm = "render_worker_d".to_string();
        assert_eq!(
            extend_truncated_name(
                comm.clone(),
                vec!["bash".to_string(), "render_worker_daemon".to_string()]
            ),
            "render_worker_daemon"
        );
        assert_eq!(
            extend_truncated_name(comm.clone(), vec!["sleep".to_string()]),
            "render_worker_d"
        );
        assert_eq!(extend_truncated_name(comm.clone(), Vec::new()), comm);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn long_program_names_are_enumerated_in_full() {
        use std::process::{Command, Stdio};

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("render_worker_daemon");
        std::fs::copy("/bin/sleep", &binary).unwrap();

        // Another test forking while the copy was open can leave it busy for a moment
        let mut child = None;
        for _ in 0..20 {
            match Command::new(&binary).arg("30").stdout(Stdio::null()).spawn() {
                Ok(spawned) => {
                    child = Some(spawned);
                    break;
                }
                Err(err) if err.raw_os_error() == Some(libc::ETXTBSY) => {
                    std::thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(err) => panic!("spawn {}: {err}", binary.display()),
            }
        }
        let mut child = child.expect("binary stayed busy");

        let entries = SystemProcessSource::new().snapshot();
        let _ = child.kill();
        let _ = child.wait();

        let entry = entries
            .unwrap()
            .into_iter()
            .find(|entry| entry.pid == child.id())
            .expect("child enumerated");
        assert_eq!(entry.name, "render_worker_daemon");
    }
}

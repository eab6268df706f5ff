//! Single-instance guard
//!
//! A lock file created exclusively, holding the owner's pid. A lock whose owner is no
//! longer alive is taken over.

use crate::config::{LOCK_ATTEMPTS, LOCK_BACKOFF_MAX_MS, LOCK_BACKOFF_MIN_MS};
use crate::platform::process_alive;
use rand::Rng;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Another instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("Failed to access lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held for the lifetime of the running instance; the lock file goes away on drop.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    pid: u32,
}

enum LockState {
    Held(u32),
    /// Created but the owner has not written its pid yet.
    Initializing,
    Stale,
}

impl InstanceGuard {
    pub fn acquire(path: &Path) -> Result<Self, InstanceError> {
        Self::acquire_with(path, LOCK_ATTEMPTS, process_alive)
    }

    fn acquire_with(
        path: &Path,
        attempts: u32,
        is_alive: impl Fn(u32) -> bool,
    ) -> Result<Self, InstanceError> {
        let io_error = |source: io::Error| InstanceError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let own_pid = std::process::id();
        let mut holder = None;
        for attempt in 1..=attempts.max(1) {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{own_pid}").map_err(io_error)?;
                    debug!(path = %path.display(), "instance lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        pid: own_pid,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(io_error(err)),
            }

            match read_lock(path, &is_alive) {
                LockState::Held(pid) if pid != own_pid => holder = Some(pid),
                LockState::Initializing => holder = None,
                LockState::Held(_) | LockState::Stale => {
                    warn!(path = %path.display(), "replacing stale instance lock");
                    match std::fs::remove_file(path) {
                        Ok(()) => continue,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(err) => return Err(io_error(err)),
                    }
                }
            }

            if attempt < attempts {
                let backoff = rand::thread_rng().gen_range(LOCK_BACKOFF_MIN_MS..=LOCK_BACKOFF_MAX_MS);
                debug!(attempt, backoff_ms = backoff, "instance lock busy, retrying");
                std::thread::sleep(Duration::from_millis(backoff));
            }
        }

        Err(InstanceError::AlreadyRunning {
            pid: holder.unwrap_or(0),
        })
    }

    /// Pid of the live instance holding `path`, if any.
    pub fn holder(path: &Path) -> Option<u32> {
        match read_lock(path, &process_alive) {
            LockState::Held(pid) => Some(pid),
            LockState::Initializing | LockState::Stale => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours
        let ours = std::fs::read_to_string(&self.path)
            .map(|text| text.trim().parse::<u32>().ok() == Some(self.pid))
            .unwrap_or(false);
        if ours {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), "failed to remove instance lock: {err}");
            }
        }
    }
}

fn read_lock(path: &Path, is_alive: &impl Fn(u32) -> bool) -> LockState {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return LockState::Stale,
    };
    let text = text.trim();
    if text.is_empty() {
        return LockState::Initializing;
    }
    match text.parse::<u32>() {
        Ok(pid) if is_alive(pid) => LockState::Held(pid),
        _ => LockState::Stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_reports_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinaffinity.lock");
        std::fs::write(&path, "4242").unwrap();

        let err = InstanceGuard::acquire_with(&path, 1, |pid| pid == 4242).unwrap_err();
        assert!(matches!(err, InstanceError::AlreadyRunning { pid: 4242 }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242");
    }

    #[test]
    fn stale_lock_is_replaced_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("pinaffinity.lock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "4242").unwrap();

        let guard = InstanceGuard::acquire_with(&path, 2, |_| false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn garbage_lock_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinaffinity.lock");
        std::fs::write(&path, "not a pid").unwrap();
        let guard = InstanceGuard::acquire_with(&path, 2, |_| true).unwrap();
        assert_eq!(guard.path(), path.as_path());
    }

    #[test]
    fn holder_ignores_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pinaffinity.lock");
        assert_eq!(InstanceGuard::holder(&path), None);
        std::fs::write(&path, std::process::id().to_string()).unwrap();
        assert_eq!(InstanceGuard::holder(&path), Some(std::process::id()));
    }
}

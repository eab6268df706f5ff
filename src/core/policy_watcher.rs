//! Policy file watcher
//!
//! Watches the saved-policy file so edits made outside the running instance (another
//! `pinaffinity set`, a text editor) are applied live.

use anyhow::{Context, Result};
use notify::{
    event::{AccessKind, AccessMode, ModifyKind},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delay before re-reading, so a writer has finished replacing the file.
pub const RELOAD_SETTLE: Duration = Duration::from_millis(100);

/// Keeps the OS watch alive. Dropping it stops the notifications.
pub struct PolicyWatcher {
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl PolicyWatcher {
    /// Starts watching `policy_path`. The receiver yields one message per relevant event;
    /// bursts are coalesced when the consumer lags.
    pub fn start(policy_path: &Path) -> Result<(Self, mpsc::Receiver<()>)> {
        let (tx, rx) = mpsc::channel(8);
        let file_name = policy_path
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| anyhow::anyhow!("Policy path has no file name"))?;

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if should_reload(&event, &file_name) => {
                    // A full channel already holds a pending reload
                    let _ = tx.try_send(());
                }
                Ok(_) => {}
                Err(err) => warn!("policy watcher error: {err}"),
            },
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        // Watch the directory: atomic replacement swaps the file's inode
        let watch_dir = policy_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher
            .watch(watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch directory: {}", watch_dir.display()))?;
        debug!(path = %policy_path.display(), "watching policy file");

        Ok((
            Self {
                _watcher: watcher,
                path: policy_path.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn should_reload(event: &Event, file_name: &OsString) -> bool {
    let relevant_kind = match &event.kind {
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Name(_)) => true,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Create(_) | EventKind::Remove(_) => true,
        _ => false,
    };
    relevant_kind
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name.as_os_str()))
}

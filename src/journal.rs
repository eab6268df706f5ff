//! Restore journal
//!
//! Mirrors the restorable processes to disk while the tool runs. If the tool dies without
//! restoring, the next start finds the journal and puts the original masks back, but only
//! on processes that are provably the same ones (pid, name and start time all match).

use crate::core::models::{ProcessEntry, RestoreReport};
use crate::persistence::{write_atomically, PersistenceError};
use crate::platform::{AffinityMutator, ProcessControl};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const JOURNAL_VERSION: u32 = 1;

/// What is needed to undo one mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreEntry {
    pub pid: u32,
    pub name: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    pub original_affinity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalFile {
    pub version: u32,
    pub owner_pid: u32,
    pub written_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<RestoreEntry>,
}

#[derive(Debug, Clone)]
pub struct RestoreJournal {
    path: PathBuf,
}

impl RestoreJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<JournalFile>, PersistenceError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| PersistenceError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Replaces the journal. An empty list removes it.
    pub fn write(&self, entries: &[RestoreEntry]) -> Result<(), PersistenceError> {
        if entries.is_empty() {
            return self.clear();
        }
        let file = JournalFile {
            version: JOURNAL_VERSION,
            owner_pid: std::process::id(),
            written_at: Utc::now(),
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| PersistenceError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomically(&self.path, &json)?;
        debug!(entries = entries.len(), "restore journal written");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PersistenceError::Write {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Restores what a previous instance left behind, then removes the journal.
    ///
    /// `live` is a fresh process snapshot. Entries whose process is gone or was replaced
    /// are dropped without touching anything.
    pub fn recover<C: ProcessControl>(
        &self,
        mutator: &AffinityMutator<C>,
        live: &[ProcessEntry],
    ) -> Result<RestoreReport, PersistenceError> {
        let Some(journal) = self.load()? else {
            return Ok(RestoreReport::default());
        };

        let mut report = RestoreReport::default();
        for entry in &journal.entries {
            if !is_same_process(entry, mutator, live) {
                debug!(pid = entry.pid, name = %entry.name, "journal entry no longer matches a process");
                continue;
            }
            if mutator.restore_affinity(entry.pid, entry.original_affinity) {
                report.restored += 1;
            } else {
                report.failed += 1;
            }
        }
        info!(
            owner = journal.owner_pid,
            entries = journal.entries.len(),
            restored = report.restored,
            failed = report.failed,
            "recovered affinities from an unfinished run"
        );
        self.clear()?;
        Ok(report)
    }
}

fn is_same_process<C: ProcessControl>(
    entry: &RestoreEntry,
    mutator: &AffinityMutator<C>,
    live: &[ProcessEntry],
) -> bool {
    let running = live
        .iter()
        .any(|process| process.pid == entry.pid && process.name == entry.name);
    if !running {
        return false;
    }
    match entry.start_time {
        Some(expected) => mutator.read_start_time(entry.pid) == Some(expected),
        None => true,
    }
}

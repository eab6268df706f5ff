//! Policy file persistence
//!
//! `SavedProcesses.txt` holds one `<program-name>:<policy-name>` record per line.
//! Writes go through a temp file in the same directory and an atomic rename.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyRecord {
    pub program: String,
    pub type_name: String,
}

impl PolicyRecord {
    pub fn new(program: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Corrupt data in {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl PersistenceError {
    pub fn path(&self) -> &Path {
        match self {
            PersistenceError::Read { path, .. }
            | PersistenceError::Write { path, .. }
            | PersistenceError::Corrupt { path, .. } => path,
        }
    }
}

/// Load/save collaborator for saved policies.
#[cfg_attr(test, mockall::automock)]
pub trait PolicyStore {
    fn load(&self) -> Result<Vec<PolicyRecord>, PersistenceError>;
    fn save(&self, records: &[PolicyRecord]) -> Result<(), PersistenceError>;
}

/// Policy store backed by a flat text file.
#[derive(Debug, Clone)]
pub struct FilePolicyStore {
    path: PathBuf,
}

impl FilePolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PolicyStore for FilePolicyStore {
    /// A missing file is an empty policy list.
    fn load(&self) -> Result<Vec<PolicyRecord>, PersistenceError> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(parse_policy_records(&text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(PersistenceError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn save(&self, records: &[PolicyRecord]) -> Result<(), PersistenceError> {
        write_atomically(&self.path, format_policy_records(records).as_bytes())?;
        debug!(path = %self.path.display(), records = records.len(), "policies saved");
        Ok(())
    }
}

/// Splits each line at its first `:`. Lines without one, or with an empty program
/// name, are skipped.
pub fn parse_policy_records(text: &str) -> Vec<PolicyRecord> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| {
            let (program, type_name) = line.split_once(':')?;
            if program.is_empty() {
                return None;
            }
            Some(PolicyRecord::new(program, type_name))
        })
        .collect()
}

pub fn format_policy_records(records: &[PolicyRecord]) -> String {
    records
        .iter()
        .map(|record| format!("{}:{}\n", record.program, record.type_name))
        .collect()
}

/// Replaces `path` with `contents` so readers never observe a half-written file.
pub(crate) fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), PersistenceError> {
    let write_error = |source: io::Error| PersistenceError::Write {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent).map_err(write_error)?;

    let mut file = NamedTempFile::new_in(parent).map_err(write_error)?;
    file.write_all(contents).map_err(write_error)?;
    file.as_file().sync_all().map_err(write_error)?;
    file.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}

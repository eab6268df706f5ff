//! Shared data model
//!
//! Values exchanged between the engine, the process source and the presentation layer.
//! Nothing in here holds a reference into engine-owned state.

use crate::policy::PolicyKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One process as reported by the OS enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

impl ProcessEntry {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
        }
    }
}

/// Display row for a tracked process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRow {
    pub pid: u32,
    pub name: String,
    pub key: PolicyKey,
    /// Catalog index of the saved policy, default type when none matches.
    pub type_index: usize,
    pub type_name: String,
    /// `None` when the tool never changed this process.
    pub applied_affinity: Option<u64>,
    pub ceiling: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
}

/// Display row for a saved policy with no running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderRow {
    pub key: PolicyKey,
    pub name: String,
    pub type_index: usize,
    pub type_name: String,
    pub mask: u64,
    /// The tool's own ceiling; placeholders have no process to ask.
    pub ceiling: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderChange {
    Show(PlaceholderRow),
    Refresh(PlaceholderRow),
    Hide(PolicyKey),
}

/// Everything the presentation layer has to apply to catch up with the engine.
///
/// Removals are listed before additions are applied so a reused pid shows up as
/// one removed and one added entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<ProcessRow>,
    pub updated: Vec<ProcessRow>,
    pub removed: Vec<u32>,
    pub policies: Vec<PlaceholderChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.policies.is_empty()
    }
}

/// Counters describing one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub iteration: u64,
    /// Newly tracked processes, reused pids included.
    pub discovered: usize,
    pub retired: usize,
    /// New processes whose policy mask was applied.
    pub managed: usize,
    /// New processes with a policy that could not be applied.
    pub failed: usize,
}

/// Result of re-applying a policy to its running instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Propagation {
    pub matched: usize,
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
}

impl RestoreReport {
    pub fn attempted(&self) -> usize {
        self.restored + self.failed
    }
}

//! Running process table
//!
//! Every process the engine has seen, keyed by pid. A record remembers the mask the
//! process had before the tool first changed it, which is what gets restored on exit.

use crate::journal::RestoreEntry;
use crate::platform::AppliedAffinity;
use crate::policy::PolicyKey;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedProcess {
    pub pid: u32,
    pub name: String,
    pub key: PolicyKey,
    pub discovered_at_iteration: u64,
    /// Captured at the first successful mutation, never overwritten afterwards.
    pub original_affinity: Option<u64>,
    /// `None` until a write succeeds.
    pub applied_affinity: Option<u64>,
    pub system_affinity_ceiling: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    /// Display row needs a refresh.
    pub dirty: bool,
}

impl TrackedProcess {
    pub fn new(pid: u32, name: String, iteration: u64, start_time: Option<DateTime<Utc>>) -> Self {
        let key = PolicyKey::new(&name);
        Self {
            pid,
            name,
            key,
            discovered_at_iteration: iteration,
            original_affinity: None,
            applied_affinity: None,
            system_affinity_ceiling: None,
            start_time,
            dirty: true,
        }
    }

    /// Records a successful write. Returns true when this write captured the original mask.
    pub fn record_applied(&mut self, applied: &AppliedAffinity) -> bool {
        let captured = self.original_affinity.is_none();
        if captured {
            self.original_affinity = Some(applied.previous);
        }
        self.applied_affinity = Some(applied.applied);
        self.system_affinity_ceiling = Some(applied.ceiling);
        self.dirty = true;
        captured
    }

    pub fn restore_entry(&self) -> Option<RestoreEntry> {
        if self.pid == 0 {
            return None;
        }
        self.original_affinity.map(|original| RestoreEntry {
            pid: self.pid,
            name: self.name.clone(),
            start_time: self.start_time,
            original_affinity: original,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunningProcessTable {
    records: BTreeMap<u32, TrackedProcess>,
}

impl RunningProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps a surviving process. False when the pid is unknown or now names another program.
    pub fn stamp(&mut self, pid: u32, name: &str, iteration: u64) -> bool {
        match self.records.get_mut(&pid) {
            Some(record) if record.name == name => {
                record.discovered_at_iteration = iteration;
                true
            }
            _ => false,
        }
    }

    /// Inserts a record, returning the one it replaced.
    pub fn insert(&mut self, record: TrackedProcess) -> Option<TrackedProcess> {
        self.records.insert(record.pid, record)
    }

    pub fn remove(&mut self, pid: u32) -> Option<TrackedProcess> {
        self.records.remove(&pid)
    }

    /// Removes and returns every record not stamped with `iteration`.
    pub fn retire_unstamped(&mut self, iteration: u64) -> Vec<TrackedProcess> {
        let dead: Vec<u32> = self
            .records
            .values()
            .filter(|record| record.discovered_at_iteration != iteration)
            .map(|record| record.pid)
            .collect();
        dead.into_iter()
            .filter_map(|pid| self.records.remove(&pid))
            .collect()
    }

    pub fn get(&self, pid: u32) -> Option<&TrackedProcess> {
        self.records.get(&pid)
    }

    pub fn matching_mut<'a>(
        &'a mut self,
        key: &'a PolicyKey,
    ) -> impl Iterator<Item = &'a mut TrackedProcess> + 'a {
        self.records.values_mut().filter(move |record| &record.key == key)
    }

    pub fn count_for_key(&self, key: &PolicyKey) -> usize {
        self.records.values().filter(|record| &record.key == key).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedProcess> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedProcess> {
        self.records.values_mut()
    }

    pub fn restore_entries(&self) -> Vec<RestoreEntry> {
        self.records
            .values()
            .filter_map(TrackedProcess::restore_entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

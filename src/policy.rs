//! Saved per-program policies
//!
//! Keyed by the lowercased program name. Only the data model lives here; re-applying a
//! changed policy to running processes is the engine's job and writing the file is the
//! caller's.

use crate::catalog::{AffinityCatalog, DEFAULT_TYPE};
use crate::persistence::PolicyRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Case-folded program name, the join key between policies and processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyKey(String);

impl PolicyKey {
    pub fn new(name: &str) -> Self {
        Self(name.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedPolicy {
    /// Name as the user first gave it; used for display and for saving.
    pub name: String,
    pub type_index: usize,
    /// Running processes whose key matches. Exact after every tick.
    pub num_instances: usize,
    /// Placeholder row needs a refresh.
    pub dirty: bool,
    /// A zero-instance placeholder row is currently shown.
    pub in_list_view: bool,
}

impl SavedPolicy {
    pub fn new(name: impl Into<String>, type_index: usize) -> Self {
        Self {
            name: name.into(),
            type_index,
            num_instances: 0,
            dirty: false,
            in_list_view: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Unchanged,
    Retyped { previous: usize },
}

#[derive(Debug, Clone, Default)]
pub struct SavedPolicyTable {
    entries: BTreeMap<PolicyKey, SavedPolicy>,
    needs_save: bool,
}

impl SavedPolicyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the table from loaded records. Type names resolve against the catalog,
    /// falling back to the first non-default type; the first record for a key wins.
    pub fn from_records(records: &[PolicyRecord], catalog: &AffinityCatalog) -> Self {
        let mut entries = BTreeMap::new();
        for record in records {
            let type_index = catalog.resolve_saved_name(&record.type_name);
            entries
                .entry(PolicyKey::new(&record.program))
                .or_insert_with(|| SavedPolicy::new(record.program.clone(), type_index));
        }
        Self {
            entries,
            needs_save: false,
        }
    }

    /// Records in key order, ready for the policy store.
    pub fn to_records(&self, catalog: &AffinityCatalog) -> Vec<PolicyRecord> {
        self.entries
            .values()
            .map(|policy| PolicyRecord::new(policy.name.clone(), catalog.name_of(policy.type_index)))
            .collect()
    }

    pub fn find_by_key(&self, key: &PolicyKey) -> Option<&SavedPolicy> {
        self.entries.get(key)
    }

    /// Mutable access for live bookkeeping. Does not mark the table for saving.
    pub fn find_by_key_mut(&mut self, key: &PolicyKey) -> Option<&mut SavedPolicy> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &PolicyKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Creates or retypes the policy for `name`. Never touches running processes.
    pub fn upsert(&mut self, name: &str, type_index: usize) -> UpsertOutcome {
        let key = PolicyKey::new(name);
        match self.entries.get_mut(&key) {
            Some(policy) if policy.type_index == type_index => UpsertOutcome::Unchanged,
            Some(policy) => {
                let previous = policy.type_index;
                policy.type_index = type_index;
                policy.dirty = true;
                self.needs_save = true;
                UpsertOutcome::Retyped { previous }
            }
            None => {
                self.entries.insert(key, SavedPolicy::new(name, type_index));
                self.needs_save = true;
                UpsertOutcome::Created
            }
        }
    }

    /// Deletes the entry when it holds the default type; returns what was removed.
    pub fn remove_if_default(&mut self, key: &PolicyKey) -> Option<SavedPolicy> {
        if self.entries.get(key)?.type_index != DEFAULT_TYPE {
            return None;
        }
        self.needs_save = true;
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PolicyKey, &SavedPolicy)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PolicyKey, &mut SavedPolicy)> {
        self.entries.iter_mut()
    }

    pub fn keys(&self) -> Vec<PolicyKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn needs_save(&self) -> bool {
        self.needs_save
    }

    pub fn mark_saved(&mut self) {
        self.needs_save = false;
    }
}

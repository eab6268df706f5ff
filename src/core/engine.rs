//! Reconciliation engine
//!
//! Owns the saved policies and the running-process table and keeps the two consistent
//! with what the OS reports. One tick:
//!
//! 1. stamp every tracked process that is still present under the same name
//! 2. track new processes (and reused pids), applying the saved policy when there is one
//! 3. retire every record the scan did not stamp
//!
//! Display changes accumulate until the presentation layer pulls them with
//! [`ReconciliationEngine::take_changes`], so hidden ticks cost nothing extra.

use crate::catalog::{AffinityCatalog, DEFAULT_TYPE, FALLBACK_TYPE};
use crate::core::models::{
    ChangeSet, PlaceholderChange, PlaceholderRow, ProcessEntry, ProcessRow, Propagation,
    RestoreReport, TickSummary,
};
use crate::core::process_list::{ProcessListError, ProcessSource};
use crate::core::process_table::{RunningProcessTable, TrackedProcess};
use crate::journal::RestoreEntry;
use crate::persistence::PolicyRecord;
use crate::platform::{AffinityError, AffinityMutator, ProcessControl};
use crate::policy::{PolicyKey, SavedPolicy, SavedPolicyTable, UpsertOutcome};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Unknown affinity type index {index} ({available} types defined)")]
    UnknownType { index: usize, available: usize },
    #[error("Invalid program name {name:?}")]
    InvalidProgramName { name: String },
    #[error(transparent)]
    Affinity(#[from] AffinityError),
    #[error(transparent)]
    ProcessList(#[from] ProcessListError),
}

/// Outcome of [`ReconciliationEngine::set_policy_for_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEdit {
    Unchanged,
    Applied {
        outcome: UpsertOutcome,
        propagation: Propagation,
        /// The policy went back to the default type and its entry was dropped.
        deleted: bool,
    },
}

impl PolicyEdit {
    pub fn changed(&self) -> bool {
        matches!(self, PolicyEdit::Applied { .. })
    }
}

#[derive(Debug, Default)]
struct PendingChanges {
    added: BTreeSet<u32>,
    removed: Vec<u32>,
    hidden: Vec<PolicyKey>,
}

pub struct ReconciliationEngine<C: ProcessControl> {
    catalog: AffinityCatalog,
    policies: SavedPolicyTable,
    processes: RunningProcessTable,
    mutator: AffinityMutator<C>,
    iteration: u64,
    pending: PendingChanges,
    journal_dirty: bool,
}

impl<C: ProcessControl> ReconciliationEngine<C> {
    pub fn new(catalog: AffinityCatalog, policies: SavedPolicyTable, mutator: AffinityMutator<C>) -> Self {
        Self {
            catalog,
            policies,
            processes: RunningProcessTable::new(),
            mutator,
            iteration: 0,
            pending: PendingChanges::default(),
            journal_dirty: false,
        }
    }

    pub fn catalog(&self) -> &AffinityCatalog {
        &self.catalog
    }

    pub fn policies(&self) -> &SavedPolicyTable {
        &self.policies
    }

    pub fn processes(&self) -> &RunningProcessTable {
        &self.processes
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn policies_need_save(&self) -> bool {
        self.policies.needs_save()
    }

    pub fn policy_records(&self) -> Vec<PolicyRecord> {
        self.policies.to_records(&self.catalog)
    }

    pub fn mark_policies_saved(&mut self) {
        self.policies.mark_saved();
    }

    /// Enumerates `source` and reconciles against it.
    pub fn tick<S: ProcessSource + ?Sized>(&mut self, source: &S) -> Result<TickSummary, EngineError> {
        let entries = source.snapshot()?;
        Ok(self.reconcile(entries))
    }

    /// One reconciliation pass over an enumerated snapshot. Order of `entries` is irrelevant.
    pub fn reconcile(&mut self, entries: Vec<ProcessEntry>) -> TickSummary {
        self.iteration += 1;
        let iteration = self.iteration;
        let mut summary = TickSummary {
            iteration,
            ..TickSummary::default()
        };

        for entry in entries {
            if self.processes.stamp(entry.pid, &entry.name, iteration) {
                continue;
            }
            // Same pid under another name is another process
            if let Some(stale) = self.processes.remove(entry.pid) {
                debug!(pid = stale.pid, old = %stale.name, new = %entry.name, "pid reused");
                self.retire(stale);
                summary.retired += 1;
            }
            self.discover(entry, iteration, &mut summary);
        }

        for stale in self.processes.retire_unstamped(iteration) {
            self.retire(stale);
            summary.retired += 1;
        }

        if summary.discovered > 0 || summary.retired > 0 {
            debug!(
                iteration,
                discovered = summary.discovered,
                retired = summary.retired,
                managed = summary.managed,
                failed = summary.failed,
                "tick"
            );
        }
        summary
    }

    fn discover(&mut self, entry: ProcessEntry, iteration: u64, summary: &mut TickSummary) {
        let pid = entry.pid;
        let start_time = self.mutator.read_start_time(pid);
        let mut record = TrackedProcess::new(pid, entry.name, iteration, start_time);

        if let Some(policy) = self.policies.find_by_key_mut(&record.key) {
            policy.num_instances += 1;
            let mask = self.catalog.mask_of(policy.type_index).unwrap_or(0);
            match self.mutator.write_affinity(pid, mask) {
                Ok(applied) => {
                    record.record_applied(&applied);
                    self.journal_dirty = true;
                    summary.managed += 1;
                }
                Err(err) => {
                    debug!(pid, name = %record.name, "policy not applied: {err}");
                    summary.failed += 1;
                }
            }
        }

        self.pending.added.insert(pid);
        self.processes.insert(record);
        summary.discovered += 1;
    }

    fn retire(&mut self, stale: TrackedProcess) {
        if let Some(policy) = self.policies.find_by_key_mut(&stale.key) {
            policy.num_instances = policy.num_instances.saturating_sub(1);
        }
        if stale.original_affinity.is_some() {
            self.journal_dirty = true;
        }
        // A row the display never received needs no removal
        if !self.pending.added.remove(&stale.pid) && !self.pending.removed.contains(&stale.pid) {
            self.pending.removed.push(stale.pid);
        }
    }

    /// Assigns `type_index` to `program` and re-applies it to every running instance at once.
    ///
    /// Going back to the default type applies the default mask, then drops the saved entry.
    pub fn set_policy_for_key(&mut self, program: &str, type_index: usize) -> Result<PolicyEdit, EngineError> {
        validate_program_name(program)?;
        if self.catalog.lookup(type_index).is_none() {
            return Err(EngineError::UnknownType {
                index: type_index,
                available: self.catalog.len(),
            });
        }

        let key = PolicyKey::new(program);
        let current = self.policies.find_by_key(&key).map(|policy| policy.type_index);
        match current {
            Some(existing) if existing == type_index => return Ok(PolicyEdit::Unchanged),
            None if type_index == DEFAULT_TYPE => return Ok(PolicyEdit::Unchanged),
            _ => {}
        }
        let outcome = self.policies.upsert(program, type_index);
        let propagation = self.propagate(&key);
        let deleted = type_index == DEFAULT_TYPE && self.remove_policy(&key);

        info!(
            program,
            policy_type = self.catalog.name_of(type_index),
            matched = propagation.matched,
            applied = propagation.applied,
            "policy updated"
        );
        Ok(PolicyEdit::Applied {
            outcome,
            propagation,
            deleted,
        })
    }

    /// Saves `name` with the first non-default type. Existing entries are left alone.
    pub fn add_program(&mut self, name: &str) -> Result<Option<Propagation>, EngineError> {
        validate_program_name(name)?;
        let key = PolicyKey::new(name);
        if self.policies.contains(&key) {
            debug!(program = name, "program already saved");
            return Ok(None);
        }
        self.policies.upsert(name, FALLBACK_TYPE);
        let propagation = self.propagate(&key);
        info!(program = name, matched = propagation.matched, "program added");
        Ok(Some(propagation))
    }

    /// Re-applies the policy for `key` to every matching process and recounts its instances.
    fn propagate(&mut self, key: &PolicyKey) -> Propagation {
        let mut report = Propagation::default();
        let Some(policy) = self.policies.find_by_key_mut(key) else {
            return report;
        };
        let mask = self.catalog.mask_of(policy.type_index).unwrap_or(0);

        for record in self.processes.matching_mut(key) {
            report.matched += 1;
            record.dirty = true;
            match self.mutator.write_affinity(record.pid, mask) {
                Ok(applied) => {
                    record.record_applied(&applied);
                    report.applied += 1;
                }
                Err(err) => {
                    debug!(pid = record.pid, "policy not applied: {err}");
                    report.failed += 1;
                }
            }
        }

        policy.num_instances = report.matched;
        policy.dirty = true;
        if report.applied > 0 {
            self.journal_dirty = true;
        }
        report
    }

    fn remove_policy(&mut self, key: &PolicyKey) -> bool {
        match self.policies.remove_if_default(key) {
            Some(removed) => {
                if removed.in_list_view {
                    self.pending.hidden.push(key.clone());
                }
                true
            }
            None => false,
        }
    }

    /// Brings the policies in line with records re-read from disk after an external edit.
    /// Returns how many policies changed. The table is considered saved afterwards.
    pub fn sync_policies(&mut self, records: &[PolicyRecord]) -> usize {
        let desired = SavedPolicyTable::from_records(records, &self.catalog);
        let mut changed = 0;

        for key in self.policies.keys() {
            if desired.contains(&key) {
                continue;
            }
            let Some(name) = self.policies.find_by_key(&key).map(|policy| policy.name.clone()) else {
                continue;
            };
            match self.set_policy_for_key(&name, DEFAULT_TYPE) {
                Ok(edit) if edit.changed() => changed += 1,
                Ok(_) => {
                    if self.remove_policy(&key) {
                        changed += 1;
                    }
                }
                Err(err) => warn!(program = %name, "unable to drop policy: {err}"),
            }
        }

        for (_, policy) in desired.iter() {
            match self.set_policy_for_key(&policy.name, policy.type_index) {
                Ok(edit) if edit.changed() => changed += 1,
                Ok(_) => {}
                Err(err) => warn!(program = %policy.name, "unable to apply policy: {err}"),
            }
        }

        self.policies.mark_saved();
        if changed > 0 {
            info!(changed, "policies reloaded");
        }
        changed
    }

    /// Terminates `pid`. The caller runs a tick afterwards to retire it.
    pub fn end_task(&mut self, pid: u32) -> Result<(), EngineError> {
        self.mutator.terminate(pid)?;
        info!(pid, "process terminated");
        Ok(())
    }

    /// Puts back every original mask. Each original is restored at most once.
    pub fn restore_all(&mut self) -> RestoreReport {
        let mut report = RestoreReport::default();
        for record in self.processes.iter_mut() {
            if record.pid == 0 {
                continue;
            }
            let Some(original) = record.original_affinity.take() else {
                continue;
            };
            if self.mutator.restore_affinity(record.pid, original) {
                report.restored += 1;
            } else {
                report.failed += 1;
            }
            record.applied_affinity = None;
            record.dirty = true;
        }
        self.journal_dirty = true;
        info!(
            restored = report.restored,
            failed = report.failed,
            "original affinities restored"
        );
        report
    }

    pub fn restore_entries(&self) -> Vec<RestoreEntry> {
        self.processes.restore_entries()
    }

    /// Whether the set of restorable processes changed since the last call.
    pub fn take_journal_dirty(&mut self) -> bool {
        std::mem::take(&mut self.journal_dirty)
    }

    /// Everything the display has not seen yet. Consumes the dirty flags.
    pub fn take_changes(&mut self) -> ChangeSet {
        let pending = std::mem::take(&mut self.pending);
        let own_ceiling = self.mutator.own_ceiling();
        let mut changes = ChangeSet {
            removed: pending.removed,
            ..ChangeSet::default()
        };

        for record in self.processes.iter_mut() {
            if pending.added.contains(&record.pid) {
                changes.added.push(process_row(record, &self.policies, &self.catalog));
            } else if record.dirty {
                changes.updated.push(process_row(record, &self.policies, &self.catalog));
            }
            record.dirty = false;
        }

        changes
            .policies
            .extend(pending.hidden.into_iter().map(PlaceholderChange::Hide));
        for (key, policy) in self.policies.iter_mut() {
            if policy.num_instances == 0 {
                if !policy.in_list_view {
                    policy.in_list_view = true;
                    changes.policies.push(PlaceholderChange::Show(placeholder_row(
                        key,
                        policy,
                        &self.catalog,
                        own_ceiling,
                    )));
                } else if policy.dirty {
                    changes.policies.push(PlaceholderChange::Refresh(placeholder_row(
                        key,
                        policy,
                        &self.catalog,
                        own_ceiling,
                    )));
                }
            } else if policy.in_list_view {
                policy.in_list_view = false;
                changes.policies.push(PlaceholderChange::Hide(key.clone()));
            }
            policy.dirty = false;
        }
        changes
    }
}

fn validate_program_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() || name.contains([':', '\n', '\r']) {
        return Err(EngineError::InvalidProgramName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn process_row(record: &TrackedProcess, policies: &SavedPolicyTable, catalog: &AffinityCatalog) -> ProcessRow {
    let type_index = policies
        .find_by_key(&record.key)
        .map(|policy| policy.type_index)
        .unwrap_or(DEFAULT_TYPE);
    ProcessRow {
        pid: record.pid,
        name: record.name.clone(),
        key: record.key.clone(),
        type_index,
        type_name: catalog.name_of(type_index).to_string(),
        applied_affinity: record.applied_affinity,
        ceiling: record.system_affinity_ceiling,
        start_time: record.start_time,
    }
}

fn placeholder_row(key: &PolicyKey, policy: &SavedPolicy, catalog: &AffinityCatalog, ceiling: u64) -> PlaceholderRow {
    PlaceholderRow {
        key: key.clone(),
        name: policy.name.clone(),
        type_index: policy.type_index,
        type_name: catalog.name_of(policy.type_index).to_string(),
        mask: catalog.mask_of(policy.type_index).unwrap_or(0),
        ceiling,
    }
}

//! Read-only snapshot (`status`) and `end-task`.

use super::{load_policies, sorted_view};
use crate::catalog::{AffinityCatalog, DEFAULT_TYPE};
use crate::core::models::{ChangeSet, PlaceholderChange, PlaceholderRow, ProcessEntry, ProcessRow};
use crate::core::process_list::{ProcessSource, SystemProcessSource};
use crate::display::{ProcessListView, SortColumn};
use crate::error::PinResult;
use crate::platform::{AffinityMutator, ProcessControl, SystemProcessControl};
use crate::policy::{PolicyKey, SavedPolicyTable};
use crate::utils::ConfigPaths;
use colored::Colorize;
use std::collections::BTreeSet;
use std::process::ExitCode;
use tracing::info;

pub fn status(
    paths: &ConfigPaths,
    saved_only: bool,
    sort: SortColumn,
    reverse: bool,
) -> PinResult<ExitCode> {
    let (catalog, policies, _) = load_policies(paths)?;
    let mutator = AffinityMutator::new(SystemProcessControl::new());
    let entries = SystemProcessSource::new().snapshot()?;

    let changes = snapshot_changes(&entries, &catalog, &policies, &mutator, saved_only);
    let mut view = sorted_view(sort, reverse);
    view.apply(changes);
    print_view(&view);
    Ok(ExitCode::SUCCESS)
}

pub fn end_task(_paths: &ConfigPaths, pid: u32) -> PinResult<ExitCode> {
    let mutator = AffinityMutator::new(SystemProcessControl::new());
    mutator.terminate(pid)?;
    info!(pid, "process terminated");
    println!("{} process {pid}", "Terminated".red());
    Ok(ExitCode::SUCCESS)
}

/// The change set a first tick would produce, read from the OS without writing anything.
///
/// Affinity columns show the current mask of processes with a saved policy and stay
/// empty for the rest, as the running table does for processes it never changed.
pub(crate) fn snapshot_changes<C: ProcessControl>(
    entries: &[ProcessEntry],
    catalog: &AffinityCatalog,
    policies: &SavedPolicyTable,
    mutator: &AffinityMutator<C>,
    saved_only: bool,
) -> ChangeSet {
    let mut changes = ChangeSet::default();
    let mut running = BTreeSet::new();

    for entry in entries {
        let key = PolicyKey::new(&entry.name);
        let policy = policies.find_by_key(&key);
        if saved_only && policy.is_none() {
            continue;
        }
        running.insert(key.clone());
        let type_index = policy.map(|policy| policy.type_index).unwrap_or(DEFAULT_TYPE);
        let state = policy.and_then(|_| mutator.read_affinity(entry.pid).ok());
        changes.added.push(ProcessRow {
            pid: entry.pid,
            name: entry.name.clone(),
            key,
            type_index,
            type_name: catalog.name_of(type_index).to_string(),
            applied_affinity: state.map(|state| state.current),
            ceiling: state.map(|state| state.ceiling),
            start_time: mutator.read_start_time(entry.pid),
        });
    }

    for (key, policy) in policies.iter() {
        if running.contains(key) {
            continue;
        }
        changes
            .policies
            .push(PlaceholderChange::Show(PlaceholderRow {
                key: key.clone(),
                name: policy.name.clone(),
                type_index: policy.type_index,
                type_name: catalog.name_of(policy.type_index).to_string(),
                mask: catalog.mask_of(policy.type_index).unwrap_or(0),
                ceiling: mutator.own_ceiling(),
            }));
    }
    changes
}

pub(crate) fn print_view(view: &ProcessListView) {
    if view.is_empty() {
        println!("No processes");
        return;
    }
    view.render().printstd();
    let running = view.rows().iter().filter(|row| !row.is_placeholder()).count();
    println!(
        "{} running, {} saved without a running instance",
        running,
        view.len() - running
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::RowId;
    use crate::persistence::PolicyRecord;
    use crate::platform::fake::FakeProcessControl;
    use pretty_assertions::assert_eq;

    #[test]
    fn snapshot_reads_without_writing() {
        let catalog = AffinityCatalog::parse("Normal:ff\nPinball:fe\n");
        let policies = SavedPolicyTable::from_records(
            &[
                PolicyRecord::new("game.exe", "Pinball"),
                PolicyRecord::new("idle.exe", "Pinball"),
            ],
            &catalog,
        );
        let fake = FakeProcessControl::with_ceiling(0x0f);
        fake.spawn(10, "Game.exe", 0xff);
        fake.spawn(11, "shell.exe", 0xff);
        let mutator = AffinityMutator::new(fake.clone());

        let changes = snapshot_changes(&fake.entries(), &catalog, &policies, &mutator, false);
        assert_eq!(fake.set_calls(), 0);
        assert_eq!(fake.open_handles(), 0);
        assert_eq!(changes.added.len(), 2);

        let game = changes.added.iter().find(|row| row.pid == 10).unwrap();
        assert_eq!(game.type_name, "Pinball");
        assert_eq!(game.applied_affinity, Some(0xff));
        assert_eq!(game.ceiling, Some(0x0f));
        let shell = changes.added.iter().find(|row| row.pid == 11).unwrap();
        assert_eq!(shell.applied_affinity, None);

        let mut view = ProcessListView::new();
        view.apply(changes);
        assert!(view.get(&RowId::Placeholder(PolicyKey::new("idle.exe"))).is_some());
        assert!(view.get(&RowId::Placeholder(PolicyKey::new("game.exe"))).is_none());
    }

    #[test]
    fn saved_only_skips_unmanaged_processes() {
        let catalog = AffinityCatalog::parse("");
        let policies =
            SavedPolicyTable::from_records(&[PolicyRecord::new("game.exe", "Pinball")], &catalog);
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);
        fake.spawn(11, "shell.exe", 0xff);
        let mutator = AffinityMutator::new(fake.clone());

        let changes = snapshot_changes(&fake.entries(), &catalog, &policies, &mutator, true);
        let pids: Vec<u32> = changes.added.iter().map(|row| row.pid).collect();
        assert_eq!(pids, vec![10]);
        assert!(changes.policies.is_empty());
    }
}

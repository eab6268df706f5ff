//! Command dispatch
//!
//! Routes parsed commands to their handlers. Edits made here go straight to the saved
//! policy file; a running instance picks them up through its file watcher.

pub mod parser;
pub mod policy;
pub mod run;
pub mod status;

pub use parser::{Cli, Commands, LoggingArgs, RunArgs};

use crate::catalog::AffinityCatalog;
use crate::core::engine::ReconciliationEngine;
use crate::display::{ProcessListView, SortColumn};
use crate::error::{PinAffinityError, PinResult};
use crate::persistence::{FilePolicyStore, PolicyStore};
use crate::platform::{AffinityMutator, SystemProcessControl};
use crate::policy::SavedPolicyTable;
use crate::utils::ConfigPaths;
use std::process::ExitCode;

pub async fn dispatch(command: Commands) -> PinResult<ExitCode> {
    let paths = ConfigPaths::new().map_err(|err| PinAffinityError::config(err.to_string()))?;
    match command {
        Commands::Run(args) => run::run(paths, args).await,
        Commands::Add { programs } => policy::add(&paths, &programs),
        Commands::Set {
            program,
            affinity_type,
        } => policy::set(&paths, &program, &affinity_type),
        Commands::Remove { program } => policy::remove(&paths, &program),
        Commands::List => policy::list(&paths),
        Commands::Types => policy::types(&paths),
        Commands::Status {
            saved_only,
            sort,
            reverse,
        } => status::status(&paths, saved_only, sort, reverse),
        Commands::EndTask { pid } => status::end_task(&paths, pid),
    }
}

/// Catalog and saved policies as currently on disk.
pub(crate) fn load_policies(
    paths: &ConfigPaths,
) -> PinResult<(AffinityCatalog, SavedPolicyTable, FilePolicyStore)> {
    let catalog = AffinityCatalog::load(&paths.types_file)?;
    let store = FilePolicyStore::new(&paths.policies_file);
    let records = store.load()?;
    let policies = SavedPolicyTable::from_records(&records, &catalog);
    Ok((catalog, policies, store))
}

/// An engine that has not scanned any process yet; edits through it only touch the
/// policy table.
pub(crate) fn offline_engine(
    paths: &ConfigPaths,
) -> PinResult<(ReconciliationEngine<SystemProcessControl>, FilePolicyStore)> {
    let (catalog, policies, store) = load_policies(paths)?;
    let mutator = AffinityMutator::new(SystemProcessControl::new());
    Ok((ReconciliationEngine::new(catalog, policies, mutator), store))
}

/// A view sorted on `column`, reversed on request.
pub(crate) fn sorted_view(column: SortColumn, reverse: bool) -> ProcessListView {
    let mut view = ProcessListView::new();
    if view.sort_state().0 != column {
        view.sort_by(column);
    }
    if reverse {
        view.sort_by(column);
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::SortDirection;
    use test_case::test_case;

    #[test_case(SortColumn::Type, false, SortDirection::Ascending)]
    #[test_case(SortColumn::Type, true, SortDirection::Descending)]
    #[test_case(SortColumn::Pid, false, SortDirection::Ascending)]
    #[test_case(SortColumn::Started, true, SortDirection::Descending)]
    fn sorted_view_state(column: SortColumn, reverse: bool, direction: SortDirection) {
        assert_eq!(sorted_view(column, reverse).sort_state(), (column, direction));
    }
}

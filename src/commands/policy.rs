//! Saved-program commands: add, set, remove, list, types.

use super::{load_policies, offline_engine};
use crate::catalog::{AffinityCatalog, DEFAULT_TYPE, FALLBACK_TYPE};
use crate::core::engine::{PolicyEdit, ReconciliationEngine};
use crate::display::{format_affinity_mask, titled_table};
use crate::error::PinResult;
use crate::instance::InstanceGuard;
use crate::persistence::{FilePolicyStore, PolicyStore};
use crate::platform::{ProcessControl, SystemProcessControl};
use crate::utils::ConfigPaths;
use colored::Colorize;
use prettytable::{Cell, Row};
use std::process::ExitCode;

pub fn add(paths: &ConfigPaths, programs: &[String]) -> PinResult<ExitCode> {
    let (mut engine, store) = offline_engine(paths)?;
    for program in programs {
        match engine.add_program(program)? {
            Some(_) => println!(
                "{} {} as {}",
                "Added".green(),
                program,
                engine.catalog().name_of(FALLBACK_TYPE)
            ),
            None => println!("{program} is already saved"),
        }
    }
    save(paths, &mut engine, &store)
}

pub fn set(paths: &ConfigPaths, program: &str, affinity_type: &str) -> PinResult<ExitCode> {
    let (mut engine, store) = offline_engine(paths)?;
    let type_index = engine.catalog().resolve_argument(affinity_type)?;
    let edit = engine.set_policy_for_key(program, type_index)?;
    report_edit(&engine, program, type_index, edit);
    save(paths, &mut engine, &store)
}

/// Same as `set <program>` with the default type.
pub fn remove(paths: &ConfigPaths, program: &str) -> PinResult<ExitCode> {
    let (mut engine, store) = offline_engine(paths)?;
    let edit = engine.set_policy_for_key(program, DEFAULT_TYPE)?;
    report_edit(&engine, program, DEFAULT_TYPE, edit);
    save(paths, &mut engine, &store)
}

pub fn list(paths: &ConfigPaths) -> PinResult<ExitCode> {
    let (catalog, policies, _) = load_policies(paths)?;
    if policies.is_empty() {
        println!("No saved programs");
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = titled_table(&["PROGRAM", "TYPE", "MASK"]);
    for (_, policy) in policies.iter() {
        let mask = catalog.mask_of(policy.type_index).unwrap_or(0);
        table.add_row(Row::new(vec![
            Cell::new(&policy.name),
            Cell::new(catalog.name_of(policy.type_index)),
            Cell::new(&format!("{mask:#x}")),
        ]));
    }
    table.printstd();
    Ok(ExitCode::SUCCESS)
}

pub fn types(paths: &ConfigPaths) -> PinResult<ExitCode> {
    let catalog = AffinityCatalog::load(&paths.types_file)?;
    let own_ceiling = SystemProcessControl::new().own_ceiling();

    let mut table = titled_table(&["#", "TYPE", "MASK", "CPUS"]);
    for (index, ty) in catalog.iter() {
        table.add_row(Row::new(vec![
            Cell::new(&index.to_string()),
            Cell::new(&ty.name),
            Cell::new(&format!("{:#x}", ty.mask)),
            Cell::new(&format_affinity_mask(Some(ty.mask), Some(own_ceiling))),
        ]));
    }
    table.printstd();
    Ok(ExitCode::SUCCESS)
}

fn report_edit<C: ProcessControl>(
    engine: &ReconciliationEngine<C>,
    program: &str,
    type_index: usize,
    edit: PolicyEdit,
) {
    match edit {
        PolicyEdit::Unchanged => println!("{program} unchanged"),
        PolicyEdit::Applied { deleted: true, .. } => {
            println!("{} {program}", "Removed".yellow())
        }
        PolicyEdit::Applied { .. } => println!(
            "{} {program} to {}",
            "Set".green(),
            engine.catalog().name_of(type_index)
        ),
    }
}

fn save(
    paths: &ConfigPaths,
    engine: &mut ReconciliationEngine<SystemProcessControl>,
    store: &FilePolicyStore,
) -> PinResult<ExitCode> {
    if !engine.policies_need_save() {
        return Ok(ExitCode::SUCCESS);
    }
    store.save(&engine.policy_records())?;
    engine.mark_policies_saved();

    if InstanceGuard::holder(&paths.lock_file).is_none() {
        println!(
            "{}",
            "pinaffinity is not running; the change applies on the next run".dimmed()
        );
    }
    Ok(ExitCode::SUCCESS)
}

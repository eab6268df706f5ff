//! `run`: the enforcing instance.
//!
//! Timer ticks, policy file changes and termination signals are serialized through one
//! `select!` loop on the current thread, so the engine never needs a lock.

use super::{load_policies, sorted_view, RunArgs};
use crate::commands::status::print_view;
use crate::core::engine::ReconciliationEngine;
use crate::core::policy_watcher::{PolicyWatcher, RELOAD_SETTLE};
use crate::core::process_list::{ProcessSource, SystemProcessSource};
use crate::display::SortColumn;
use crate::error::{PinAffinityError, PinResult};
use crate::instance::{InstanceError, InstanceGuard};
use crate::journal::RestoreJournal;
use crate::persistence::PolicyStore;
use crate::platform::{prepare_privileges, AffinityMutator, SystemProcessControl};
use crate::session::Session;
use crate::utils::ConfigPaths;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub async fn run(paths: ConfigPaths, args: RunArgs) -> PinResult<ExitCode> {
    paths
        .ensure_dirs()
        .map_err(|err| PinAffinityError::config(err.to_string()))?;

    let _guard = match InstanceGuard::acquire(&paths.lock_file) {
        Ok(guard) => guard,
        Err(InstanceError::AlreadyRunning { pid }) => {
            println!("pinaffinity is already running (pid {pid})");
            return Ok(ExitCode::SUCCESS);
        }
        Err(err) => return Err(err.into()),
    };

    if let Err(err) = prepare_privileges() {
        warn!("running without extra privileges: {err}");
    }

    let source = SystemProcessSource::new();
    let mutator = AffinityMutator::new(SystemProcessControl::new());
    let journal = RestoreJournal::new(&paths.journal_file);
    recover_journal(&journal, &mutator, &source);

    let (catalog, policies, store) = load_policies(&paths)?;
    info!(
        types = catalog.len(),
        programs = policies.len(),
        policy_file = %store.path().display(),
        "starting"
    );
    let engine = ReconciliationEngine::new(catalog, policies, mutator);
    let mut session = Session::new(engine, store, journal);
    if args.show {
        session.show(sorted_view(args.sort.unwrap_or(SortColumn::Type), false));
    }

    let (_watcher, mut reloads) = match PolicyWatcher::start(&paths.policies_file) {
        Ok((watcher, rx)) => (Some(watcher), Some(rx)),
        Err(err) => {
            warn!("external policy edits will not be picked up: {err:#}");
            (None, None)
        }
    };

    let period = paths.tick_interval(args.interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!(period_ms = period.as_millis() as u64, "tick loop started");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            _ = ticker.tick() => {
                match session.tick(&source) {
                    Ok((summary, changed)) => {
                        if summary.discovered > 0 || summary.retired > 0 {
                            debug!(
                                iteration = summary.iteration,
                                discovered = summary.discovered,
                                retired = summary.retired,
                                managed = summary.managed,
                                failed = summary.failed,
                                "tick"
                            );
                        }
                        if changed {
                            redraw(&session);
                        }
                    }
                    Err(err) => warn!("process scan failed: {err}"),
                }
            }
            received = next_reload(&mut reloads) => {
                if received.is_none() {
                    reloads = None;
                    continue;
                }
                tokio::time::sleep(RELOAD_SETTLE).await;
                drain(&mut reloads);
                if session.reload_policies() > 0 {
                    redraw(&session);
                }
            }
        }
    }

    let report = session.shutdown();
    println!(
        "Restored {} process(es){}",
        report.restored,
        if report.failed > 0 {
            format!(", {} could not be restored", report.failed)
        } else {
            String::new()
        }
    );
    Ok(ExitCode::SUCCESS)
}

fn recover_journal<S: ProcessSource>(
    journal: &RestoreJournal,
    mutator: &AffinityMutator<SystemProcessControl>,
    source: &S,
) {
    let live = match source.snapshot() {
        Ok(live) => live,
        Err(err) => {
            warn!("skipping journal recovery, process scan failed: {err}");
            return;
        }
    };
    match journal.recover(mutator, &live) {
        Ok(report) if report.attempted() > 0 => println!(
            "Restored {} process(es) left pinned by a previous run",
            report.restored
        ),
        Ok(_) => {}
        Err(err) => warn!("failed to recover restore journal: {err}"),
    }
}

fn redraw<P: PolicyStore>(session: &Session<SystemProcessControl, P>) {
    let Some(view) = session.view() else {
        return;
    };
    let term = console::Term::stdout();
    if term.is_term() {
        let _ = term.clear_screen();
    }
    print_view(view);
}

async fn next_reload(reloads: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match reloads.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn drain(reloads: &mut Option<mpsc::Receiver<()>>) {
    if let Some(rx) = reloads.as_mut() {
        while rx.try_recv().is_ok() {}
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            warn!("SIGTERM handler unavailable: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

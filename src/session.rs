//! Running session
//!
//! Glues the engine to its collaborators: the policy store (saved after every edit), the
//! restore journal (rewritten whenever the set of mutated processes changes) and, while
//! the table is visible, the list view.

use crate::core::engine::{EngineError, PolicyEdit, ReconciliationEngine};
use crate::core::models::{Propagation, RestoreReport, TickSummary};
use crate::core::process_list::ProcessSource;
use crate::display::ProcessListView;
use crate::journal::RestoreJournal;
use crate::persistence::{PersistenceError, PolicyStore};
use crate::platform::ProcessControl;
use tracing::{error, info, warn};

pub struct Session<C: ProcessControl, P: PolicyStore> {
    engine: ReconciliationEngine<C>,
    store: P,
    journal: RestoreJournal,
    pending_save: bool,
    view: Option<ProcessListView>,
}

impl<C: ProcessControl, P: PolicyStore> Session<C, P> {
    pub fn new(engine: ReconciliationEngine<C>, store: P, journal: RestoreJournal) -> Self {
        Self {
            engine,
            store,
            journal,
            pending_save: false,
            view: None,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine<C> {
        &self.engine
    }

    pub fn pending_save(&self) -> bool {
        self.pending_save
    }

    /// Makes the list view visible. Changes accumulated while hidden are applied at once.
    pub fn show(&mut self, view: ProcessListView) {
        self.view = Some(view);
        self.refresh_view();
    }

    pub fn view(&self) -> Option<&ProcessListView> {
        self.view.as_ref()
    }

    pub fn view_mut(&mut self) -> Option<&mut ProcessListView> {
        self.view.as_mut()
    }

    /// One reconciliation pass. Returns whether the visible view changed.
    pub fn tick<S: ProcessSource + ?Sized>(
        &mut self,
        source: &S,
    ) -> Result<(TickSummary, bool), EngineError> {
        let summary = self.engine.tick(source)?;
        self.write_journal();
        Ok((summary, self.refresh_view()))
    }

    pub fn add_program(&mut self, name: &str) -> Result<Option<Propagation>, EngineError> {
        let added = self.engine.add_program(name)?;
        self.after_edit();
        Ok(added)
    }

    pub fn set_policy(&mut self, program: &str, type_index: usize) -> Result<PolicyEdit, EngineError> {
        let edit = self.engine.set_policy_for_key(program, type_index)?;
        self.after_edit();
        Ok(edit)
    }

    /// Terminates `pid` and reconciles right away so the row disappears.
    pub fn end_task<S: ProcessSource + ?Sized>(
        &mut self,
        pid: u32,
        source: &S,
    ) -> Result<TickSummary, EngineError> {
        self.engine.end_task(pid)?;
        Ok(self.tick(source)?.0)
    }

    /// Re-reads the policy store after an external edit and applies the difference.
    pub fn reload_policies(&mut self) -> usize {
        match self.store.load() {
            Ok(records) => {
                let changed = self.engine.sync_policies(&records);
                self.pending_save = false;
                self.write_journal();
                self.refresh_view();
                changed
            }
            Err(err) => {
                warn!("failed to reload saved programs: {err}");
                0
            }
        }
    }

    /// Writes the policies when they changed. A failure leaves the save pending.
    pub fn save_policies(&mut self) -> Result<(), PersistenceError> {
        if !self.engine.policies_need_save() && !self.pending_save {
            return Ok(());
        }
        match self.store.save(&self.engine.policy_records()) {
            Ok(()) => {
                self.engine.mark_policies_saved();
                self.pending_save = false;
                Ok(())
            }
            Err(err) => {
                self.pending_save = true;
                Err(err)
            }
        }
    }

    /// Orderly exit: restore every original mask, drop the journal, flush a pending save.
    /// `retry` decides whether a failed save is attempted again.
    pub fn shutdown_with(
        mut self,
        mut retry: impl FnMut(&PersistenceError) -> bool,
    ) -> RestoreReport {
        let report = self.engine.restore_all();
        if let Err(err) = self.journal.clear() {
            warn!("failed to remove restore journal: {err}");
        }
        self.engine.take_journal_dirty();

        loop {
            match self.save_policies() {
                Ok(()) => break,
                Err(err) if retry(&err) => continue,
                Err(err) => {
                    error!("saved programs were not written: {err}");
                    break;
                }
            }
        }
        info!(restored = report.restored, failed = report.failed, "session closed");
        report
    }

    /// [`Self::shutdown_with`] asking on the terminal, or giving up when there is none.
    pub fn shutdown(self) -> RestoreReport {
        self.shutdown_with(prompt_retry)
    }

    fn after_edit(&mut self) {
        if let Err(err) = self.save_policies() {
            warn!("failed to save programs, will retry on exit: {err}");
        }
        self.write_journal();
        self.refresh_view();
    }

    fn write_journal(&mut self) {
        if !self.engine.take_journal_dirty() {
            return;
        }
        if let Err(err) = self.journal.write(&self.engine.restore_entries()) {
            warn!("failed to write restore journal: {err}");
        }
    }

    fn refresh_view(&mut self) -> bool {
        match self.view.as_mut() {
            Some(view) => view.apply(self.engine.take_changes()),
            None => false,
        }
    }
}

fn prompt_retry(err: &PersistenceError) -> bool {
    if !console::Term::stderr().is_term() {
        return false;
    }
    dialoguer::Confirm::new()
        .with_prompt(format!("Saving programs failed ({err}). Retry?"))
        .default(true)
        .interact()
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::AffinityCatalog;
    use crate::display::RowId;
    use crate::persistence::{MockPolicyStore, PolicyRecord};
    use crate::platform::fake::FakeProcessControl;
    use crate::platform::AffinityMutator;
    use crate::policy::{PolicyKey, SavedPolicyTable};
    use std::io;

    const TYPES: &str = "Normal:ff\nPinball:fe\nGame:0a\n";

    fn session(
        fake: &FakeProcessControl,
        store: MockPolicyStore,
        journal: RestoreJournal,
    ) -> Session<FakeProcessControl, MockPolicyStore> {
        let catalog = AffinityCatalog::parse(TYPES);
        let engine = ReconciliationEngine::new(
            catalog,
            SavedPolicyTable::new(),
            AffinityMutator::new(fake.clone()),
        );
        Session::new(engine, store, journal)
    }

    fn write_error() -> PersistenceError {
        PersistenceError::Write {
            path: "SavedProcesses.txt".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "read-only"),
        }
    }

    #[test]
    fn edits_are_saved_and_journaled() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RestoreJournal::new(dir.path().join("journal.json"));
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);

        let mut store = MockPolicyStore::new();
        store
            .expect_save()
            .withf(|records| records == [PolicyRecord::new("game.exe", "Pinball")])
            .times(1)
            .returning(|_| Ok(()));

        let mut session = session(&fake, store, journal.clone());
        session.tick(&fake).unwrap();
        assert!(session.add_program("game.exe").unwrap().is_some());
        assert_eq!(fake.affinity_of(10), Some(0xfe));
        assert!(!session.pending_save());

        let recorded = journal.load().unwrap().unwrap();
        assert_eq!(recorded.entries.len(), 1);
        assert_eq!(recorded.entries[0].original_affinity, 0xff);
    }

    #[test]
    fn failed_save_is_retried_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RestoreJournal::new(dir.path().join("journal.json"));
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);

        let mut store = MockPolicyStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_save()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(write_error()));
        store
            .expect_save()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let mut session = session(&fake, store, journal.clone());
        session.tick(&fake).unwrap();
        session.set_policy("game.exe", 2).unwrap();
        assert!(session.pending_save());
        assert_eq!(fake.affinity_of(10), Some(0x0a));

        let mut prompts = 0;
        let report = session.shutdown_with(|_| {
            prompts += 1;
            true
        });
        assert_eq!(prompts, 1);
        assert_eq!(report, RestoreReport { restored: 1, failed: 0 });
        assert_eq!(fake.affinity_of(10), Some(0xff));
        assert!(!journal.path().exists());
    }

    #[test]
    fn declined_retry_gives_up() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeProcessControl::with_ceiling(0xff);
        let mut store = MockPolicyStore::new();
        store.expect_save().times(2).returning(|_| Err(write_error()));

        let mut session = session(&fake, store, RestoreJournal::new(dir.path().join("j.json")));
        session.add_program("tool.exe").unwrap();
        assert!(session.pending_save());
        session.shutdown_with(|_| false);
    }

    #[test]
    fn reload_applies_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);

        let mut store = MockPolicyStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|| Ok(vec![PolicyRecord::new("Game.exe", "Game")]));
        store.expect_save().never();

        let mut session = session(&fake, store, RestoreJournal::new(dir.path().join("j.json")));
        session.tick(&fake).unwrap();
        assert_eq!(session.reload_policies(), 1);
        assert_eq!(fake.affinity_of(10), Some(0x0a));
        assert!(session.engine().policies().contains(&PolicyKey::new("game.exe")));
        assert!(session.save_policies().is_ok());
    }

    #[test]
    fn hidden_changes_reach_the_view_once_shown() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);
        fake.spawn(11, "shell.exe", 0xff);
        let mut store = MockPolicyStore::new();
        store.expect_save().returning(|_| Ok(()));

        let mut session = session(&fake, store, RestoreJournal::new(dir.path().join("j.json")));
        let (summary, changed) = session.tick(&fake).unwrap();
        assert_eq!(summary.discovered, 2);
        assert!(!changed);
        session.add_program("idle.exe").unwrap();

        session.show(ProcessListView::new());
        let view = session.view().unwrap();
        assert_eq!(view.len(), 3);
        assert!(view.get(&RowId::Placeholder(PolicyKey::new("idle.exe"))).is_some());

        fake.kill(11);
        let (_, changed) = session.tick(&fake).unwrap();
        assert!(changed);
        assert!(session.view().unwrap().get(&RowId::Process(11)).is_none());
    }

    #[test]
    fn end_task_retires_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeProcessControl::with_ceiling(0xff);
        fake.spawn(10, "game.exe", 0xff);
        let mut session = session(
            &fake,
            MockPolicyStore::new(),
            RestoreJournal::new(dir.path().join("j.json")),
        );
        session.show(ProcessListView::new());
        session.tick(&fake).unwrap();

        let summary = session.end_task(10, &fake).unwrap();
        assert_eq!(summary.retired, 1);
        assert!(session.view().unwrap().is_empty());
    }
}

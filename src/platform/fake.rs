//! In-memory process table standing in for the OS in unit tests.

use super::{Access, AffinityError, AffinityState, ProcessControl, ProcessHandle};
use crate::core::models::ProcessEntry;
use crate::core::process_list::{ProcessListError, ProcessSource};
use chrono::{DateTime, TimeZone, Utc};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    affinity: u64,
    ceiling: u64,
    start_time: Option<DateTime<Utc>>,
    deny_open: bool,
    deny_set: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    processes: BTreeMap<u32, FakeProcess>,
    own_ceiling: u64,
    open_handles: usize,
    total_opens: usize,
    set_calls: usize,
}

/// Cloning shares the same table, so a test can keep one clone and hand another to the engine.
#[derive(Debug, Clone)]
pub struct FakeProcessControl {
    state: Rc<RefCell<FakeState>>,
}

pub struct FakeHandle {
    pid: u32,
    access: Access,
    state: Rc<RefCell<FakeState>>,
}

impl FakeProcessControl {
    pub fn with_ceiling(own_ceiling: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState {
                own_ceiling,
                ..FakeState::default()
            })),
        }
    }

    pub fn spawn(&self, pid: u32, name: &str, affinity: u64) {
        let ceiling = self.state.borrow().own_ceiling;
        self.spawn_with_ceiling(pid, name, affinity, ceiling);
    }

    pub fn spawn_with_ceiling(&self, pid: u32, name: &str, affinity: u64, ceiling: u64) {
        let start_time = Utc.timestamp_opt(1_700_000_000 + i64::from(pid), 0).single();
        self.state.borrow_mut().processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                affinity,
                ceiling,
                start_time,
                deny_open: false,
                deny_set: false,
            },
        );
    }

    pub fn kill(&self, pid: u32) {
        self.state.borrow_mut().processes.remove(&pid);
    }

    pub fn deny_open(&self, pid: u32) {
        if let Some(process) = self.state.borrow_mut().processes.get_mut(&pid) {
            process.deny_open = true;
        }
    }

    pub fn deny_set(&self, pid: u32) {
        if let Some(process) = self.state.borrow_mut().processes.get_mut(&pid) {
            process.deny_set = true;
        }
    }

    pub fn set_affinity_externally(&self, pid: u32, mask: u64) {
        if let Some(process) = self.state.borrow_mut().processes.get_mut(&pid) {
            process.affinity = mask;
        }
    }

    pub fn affinity_of(&self, pid: u32) -> Option<u64> {
        self.state.borrow().processes.get(&pid).map(|p| p.affinity)
    }

    pub fn start_time_of(&self, pid: u32) -> Option<DateTime<Utc>> {
        self.state
            .borrow()
            .processes
            .get(&pid)
            .and_then(|p| p.start_time)
    }

    pub fn open_handles(&self) -> usize {
        self.state.borrow().open_handles
    }

    pub fn total_opens(&self) -> usize {
        self.state.borrow().total_opens
    }

    pub fn set_calls(&self) -> usize {
        self.state.borrow().set_calls
    }

    pub fn entries(&self) -> Vec<ProcessEntry> {
        self.state
            .borrow()
            .processes
            .iter()
            .map(|(pid, process)| ProcessEntry::new(*pid, process.name.clone()))
            .collect()
    }
}

impl ProcessControl for FakeProcessControl {
    type Handle = FakeHandle;

    fn open(&self, pid: u32, access: Access) -> Result<FakeHandle, AffinityError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get(&pid)
            .ok_or(AffinityError::ProcessGone { pid })?;
        if process.deny_open {
            return Err(AffinityError::PermissionDenied { pid });
        }
        state.open_handles += 1;
        state.total_opens += 1;
        Ok(FakeHandle {
            pid,
            access,
            state: Rc::clone(&self.state),
        })
    }

    fn own_ceiling(&self) -> u64 {
        self.state.borrow().own_ceiling
    }
}

impl ProcessSource for FakeProcessControl {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessListError> {
        Ok(self.entries())
    }
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn affinity(&self) -> Result<AffinityState, AffinityError> {
        let state = self.state.borrow();
        let process = state
            .processes
            .get(&self.pid)
            .ok_or(AffinityError::ProcessGone { pid: self.pid })?;
        Ok(AffinityState {
            current: process.affinity,
            ceiling: process.ceiling,
        })
    }

    fn set_affinity(&self, mask: u64) -> Result<(), AffinityError> {
        assert!(
            matches!(self.access, Access::Set | Access::QueryAndSet),
            "set_affinity through a handle opened for {:?}",
            self.access
        );
        let mut state = self.state.borrow_mut();
        state.set_calls += 1;
        let process = state
            .processes
            .get_mut(&self.pid)
            .ok_or(AffinityError::ProcessGone { pid: self.pid })?;
        if process.deny_set {
            return Err(AffinityError::PermissionDenied { pid: self.pid });
        }
        process.affinity = mask;
        Ok(())
    }

    fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state
            .borrow()
            .processes
            .get(&self.pid)
            .and_then(|p| p.start_time)
    }

    fn terminate(&self) -> Result<(), AffinityError> {
        let mut state = self.state.borrow_mut();
        let process = state
            .processes
            .get(&self.pid)
            .ok_or(AffinityError::ProcessGone { pid: self.pid })?;
        if process.deny_open {
            return Err(AffinityError::PermissionDenied { pid: self.pid });
        }
        state.processes.remove(&self.pid);
        Ok(())
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        self.state.borrow_mut().open_handles -= 1;
    }
}

//! Terminal process list
//!
//! Keeps its own rows, fed only by the change sets the engine hands out, and renders them
//! with prettytable. Nothing here points back into engine state.

use crate::core::models::{ChangeSet, PlaceholderChange, PlaceholderRow, ProcessRow};
use crate::policy::PolicyKey;
use chrono::{DateTime, Local, Utc};
use clap::ValueEnum;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};
use std::cmp::Ordering;
use std::collections::BTreeMap;

const UNMANAGED_AFFINITY: &str = "Unable/Default";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowId {
    Process(u32),
    Placeholder(PolicyKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRow {
    pub id: RowId,
    pub name: String,
    pub key: PolicyKey,
    pub type_index: usize,
    pub type_name: String,
    pub affinity: Option<u64>,
    pub ceiling: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
}

impl DisplayRow {
    pub fn pid(&self) -> Option<u32> {
        match self.id {
            RowId::Process(pid) => Some(pid),
            RowId::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.id, RowId::Placeholder(_))
    }

    fn effective_pid(&self) -> u32 {
        self.pid().unwrap_or(0)
    }
}

impl From<ProcessRow> for DisplayRow {
    fn from(row: ProcessRow) -> Self {
        Self {
            id: RowId::Process(row.pid),
            name: row.name,
            key: row.key,
            type_index: row.type_index,
            type_name: row.type_name,
            affinity: row.applied_affinity,
            ceiling: row.ceiling,
            start_time: row.start_time,
        }
    }
}

impl From<PlaceholderRow> for DisplayRow {
    fn from(row: PlaceholderRow) -> Self {
        Self {
            id: RowId::Placeholder(row.key.clone()),
            name: row.name,
            key: row.key,
            type_index: row.type_index,
            type_name: row.type_name,
            affinity: Some(row.mask),
            ceiling: Some(row.ceiling),
            start_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SortColumn {
    Program,
    Pid,
    Status,
    Type,
    Started,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone)]
pub struct ProcessListView {
    rows: BTreeMap<RowId, DisplayRow>,
    column: SortColumn,
    direction: SortDirection,
}

impl Default for ProcessListView {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessListView {
    /// Starts sorted by type, custom types first.
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            column: SortColumn::Type,
            direction: SortDirection::Ascending,
        }
    }

    /// Applies a change set. Returns whether anything visible changed.
    pub fn apply(&mut self, changes: ChangeSet) -> bool {
        let changed = !changes.is_empty();
        for pid in changes.removed {
            self.rows.remove(&RowId::Process(pid));
        }
        for row in changes.added.into_iter().chain(changes.updated) {
            let row = DisplayRow::from(row);
            self.rows.insert(row.id.clone(), row);
        }
        for change in changes.policies {
            match change {
                PlaceholderChange::Show(row) | PlaceholderChange::Refresh(row) => {
                    let row = DisplayRow::from(row);
                    self.rows.insert(row.id.clone(), row);
                }
                PlaceholderChange::Hide(key) => {
                    self.rows.remove(&RowId::Placeholder(key));
                }
            }
        }
        changed
    }

    /// Ascending on a new column, reversed when the column is already the sort column.
    pub fn sort_by(&mut self, column: SortColumn) {
        if column == self.column {
            self.direction = match self.direction {
                SortDirection::Ascending => SortDirection::Descending,
                SortDirection::Descending => SortDirection::Ascending,
            };
        } else {
            self.column = column;
            self.direction = SortDirection::Ascending;
        }
    }

    pub fn sort_state(&self) -> (SortColumn, SortDirection) {
        (self.column, self.direction)
    }

    pub fn get(&self, id: &RowId) -> Option<&DisplayRow> {
        self.rows.get(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> Vec<&DisplayRow> {
        let mut rows: Vec<&DisplayRow> = self.rows.values().collect();
        rows.sort_by(|a, b| {
            let ordering = compare_rows(a, b, self.column);
            match self.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
        rows
    }

    pub fn render(&self) -> Table {
        render_rows(self.rows())
    }
}

/// Column comparison, then key, then pid.
pub fn compare_rows(a: &DisplayRow, b: &DisplayRow, column: SortColumn) -> Ordering {
    let primary = match column {
        SortColumn::Program => Ordering::Equal,
        SortColumn::Pid => a.effective_pid().cmp(&b.effective_pid()),
        // Placeholders first
        SortColumn::Status => b.is_placeholder().cmp(&a.is_placeholder()),
        SortColumn::Type => type_rank(a.type_index).cmp(&type_rank(b.type_index)),
        SortColumn::Started => a.start_time.cmp(&b.start_time),
    };
    primary
        .then_with(|| a.key.cmp(&b.key))
        .then_with(|| a.effective_pid().cmp(&b.effective_pid()))
}

// default type sorts after every custom type
fn type_rank(type_index: usize) -> usize {
    if type_index == 0 {
        usize::MAX
    } else {
        type_index
    }
}

pub fn render_rows<'a>(rows: impl IntoIterator<Item = &'a DisplayRow>) -> Table {
    let mut table = titled_table(&["PROGRAM", "PID", "STATUS", "TYPE", "AFFINITY", "STARTED"]);

    for row in rows {
        let pid = row.pid().map(|pid| pid.to_string()).unwrap_or_default();
        let status = if row.is_placeholder() {
            "saved".yellow().to_string()
        } else {
            "running".green().to_string()
        };
        table.add_row(Row::new(vec![
            Cell::new(&row.name),
            Cell::new(&pid),
            Cell::new(&status),
            Cell::new(&row.type_name),
            Cell::new(&format_affinity_mask(row.affinity, row.ceiling)),
            Cell::new(&format_start_time(row.start_time)),
        ]));
    }
    table
}

/// Empty table in the shared style: no line separators, bold titles.
pub fn titled_table(titles: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(Row::new(
        titles
            .iter()
            .map(|title| Cell::new(title).style_spec("b"))
            .collect(),
    ));
    table
}

/// One character per CPU the ceiling allows, `+` when the mask includes it.
pub fn format_affinity_mask(mask: Option<u64>, ceiling: Option<u64>) -> String {
    let (Some(mask), Some(ceiling)) = (mask, ceiling) else {
        return UNMANAGED_AFFINITY.to_string();
    };
    if mask == 0 {
        return UNMANAGED_AFFINITY.to_string();
    }
    (0..64)
        .map(|cpu| 1u64 << cpu)
        .take_while(|bit| ceiling & bit != 0)
        .map(|bit| if mask & bit != 0 { '+' } else { '-' })
        .collect()
}

/// Local `YYYY-MM-DD HH:MM`, empty when unknown.
pub fn format_start_time(start_time: Option<DateTime<Utc>>) -> String {
    start_time
        .map(|time| time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default()
}

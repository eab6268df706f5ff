//! Core reconciliation logic
//!
//! Process enumeration, the running-process table and the reconciliation engine.

pub mod engine;
pub mod models;
pub mod policy_watcher;
pub mod process_list;
pub mod process_table;

//! PinAffinity Library
//!
//! Per-program CPU affinity policies, enforced on every running process and undone on exit.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod core;
pub mod display;
pub mod error;
pub mod instance;
pub mod journal;
pub mod persistence;
pub mod platform;
pub mod policy;
pub mod session;
pub mod utils;

// Re-export commonly used types for convenience
pub use catalog::{AffinityCatalog, AffinityType};
pub use crate::core::engine::{EngineError, PolicyEdit, ReconciliationEngine};
pub use crate::core::models::*;
pub use error::{PinAffinityError, PinResult};
pub use persistence::{FilePolicyStore, PolicyRecord, PolicyStore};
pub use platform::{AffinityError, AffinityMutator};
pub use policy::{PolicyKey, SavedPolicyTable};

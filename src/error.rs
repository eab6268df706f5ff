//! Unified error handling for pinaffinity
//!
//! Each layer has its own `thiserror` enum; this module folds them into one type with
//! classification used for user messaging and for deciding whether to keep running.

use crate::catalog::CatalogError;
use crate::core::engine::EngineError;
use crate::core::process_list::ProcessListError;
use crate::instance::InstanceError;
use crate::persistence::PersistenceError;
use crate::platform::AffinityError;
use std::io;
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum PinAffinityError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Affinity(#[from] AffinityError),

    #[error(transparent)]
    ProcessList(#[from] ProcessListError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Filesystem errors not tied to one of the data files
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Persistence,
    Process,
    Validation,
    Concurrency,
    Filesystem,
}

impl ErrorCategory {
    pub fn display_name(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "Configuration",
            ErrorCategory::Persistence => "Persistence",
            ErrorCategory::Process => "Process",
            ErrorCategory::Validation => "Validation",
            ErrorCategory::Concurrency => "Instance",
            ErrorCategory::Filesystem => "Filesystem",
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl PinAffinityError {
    pub fn config(message: impl Into<String>) -> Self {
        PinAffinityError::Config {
            message: message.into(),
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            PinAffinityError::Catalog(CatalogError::UnknownType { .. }) => ErrorCategory::Validation,
            PinAffinityError::Config { .. } | PinAffinityError::Catalog(_) => ErrorCategory::Config,
            PinAffinityError::Persistence(_) => ErrorCategory::Persistence,
            PinAffinityError::Engine(EngineError::UnknownType { .. })
            | PinAffinityError::Engine(EngineError::InvalidProgramName { .. }) => {
                ErrorCategory::Validation
            }
            PinAffinityError::Engine(_)
            | PinAffinityError::Affinity(_)
            | PinAffinityError::ProcessList(_) => ErrorCategory::Process,
            PinAffinityError::Instance(_) => ErrorCategory::Concurrency,
            PinAffinityError::Io(_) => ErrorCategory::Filesystem,
        }
    }

    /// Get error severity
    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Config | ErrorCategory::Filesystem => ErrorSeverity::High,
            ErrorCategory::Persistence | ErrorCategory::Concurrency => ErrorSeverity::Medium,
            ErrorCategory::Process | ErrorCategory::Validation => ErrorSeverity::Low,
        }
    }

    /// Check if error is recoverable
    ///
    /// Per-process failures only leave that process unmanaged; a failed save is retried later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PinAffinityError::Affinity(_)
            | PinAffinityError::Engine(_)
            | PinAffinityError::Persistence(_) => true,
            PinAffinityError::ProcessList(_) => true,
            PinAffinityError::Config { .. }
            | PinAffinityError::Catalog(_)
            | PinAffinityError::Instance(_)
            | PinAffinityError::Io(_) => false,
        }
    }

    /// Get user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            PinAffinityError::Config { message } => format!("Configuration problem: {message}"),
            PinAffinityError::Catalog(CatalogError::UnknownType { name }) => {
                format!("No affinity type named {name:?}; see `pinaffinity types`")
            }
            PinAffinityError::Catalog(err) => format!("Affinity types could not be loaded: {err}"),
            PinAffinityError::Persistence(err) => {
                format!("Saved programs could not be stored: {err}")
            }
            PinAffinityError::Engine(err) => format!("Request rejected: {err}"),
            PinAffinityError::Affinity(AffinityError::PermissionDenied { pid }) => format!(
                "Not allowed to change process {pid}; try running with elevated privileges"
            ),
            PinAffinityError::Affinity(err) => format!("Process problem: {err}"),
            PinAffinityError::ProcessList(err) => format!("Process list unavailable: {err}"),
            PinAffinityError::Instance(InstanceError::AlreadyRunning { pid }) => {
                format!("pinaffinity is already running (pid {pid})")
            }
            PinAffinityError::Instance(err) => format!("Instance lock problem: {err}"),
            PinAffinityError::Io(err) => format!("File system problem: {err}"),
        }
    }
}

/// Result type alias for convenience
pub type PinResult<T> = Result<T, PinAffinityError>;

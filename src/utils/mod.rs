//! Utilities
//!
//! Logging setup and on-disk locations.

pub mod config_paths;
pub mod logger;

pub use config_paths::{ConfigPaths, Settings};
pub use logger::init_logger;

use std::time::Duration;

pub const APP_DIRECTORY: &str = ".pinaffinity";
pub const TYPES_FILE_NAME: &str = "AffinityTypes.txt";
pub const POLICIES_FILE_NAME: &str = "SavedProcesses.txt";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const JOURNAL_FILE_NAME: &str = "restore-journal.json";
pub const LOCK_FILE_NAME: &str = "pinaffinity.lock";
pub const LOG_FILE_NAME: &str = "pinaffinity.log";

pub const HOME_ENV: &str = "PINAFFINITY_HOME";
pub const RUNTIME_DIR_ENV: &str = "PINAFFINITY_RUNTIME_DIR";
pub const TICK_INTERVAL_ENV: &str = "PINAFFINITY_TICK_MS";

// Names of the types synthesized when the type file supplies fewer than two
pub const DEFAULT_TYPE_NAME: &str = "Normal";
pub const FALLBACK_TYPE_NAME: &str = "Pinball";

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(20);

// Single-instance lock acquisition
pub const LOCK_ATTEMPTS: u32 = 4;
pub const LOCK_BACKOFF_MIN_MS: u64 = 100;
pub const LOCK_BACKOFF_MAX_MS: u64 = 1600;

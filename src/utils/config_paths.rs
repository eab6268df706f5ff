//! Config and runtime path management
//!
//! - Persistent data (affinity types, saved programs, settings) lives in `~/.pinaffinity/`
//! - Runtime data (lock, restore journal, log) lives in `<tmp>/.pinaffinity/`
//!
//! `PINAFFINITY_HOME` and `PINAFFINITY_RUNTIME_DIR` relocate the two directories.

use crate::config::{
    APP_DIRECTORY, DEFAULT_TICK_INTERVAL, HOME_ENV, JOURNAL_FILE_NAME, LOCK_FILE_NAME,
    LOG_FILE_NAME, MIN_TICK_INTERVAL, POLICIES_FILE_NAME, RUNTIME_DIR_ENV, SETTINGS_FILE_NAME,
    TICK_INTERVAL_ENV, TYPES_FILE_NAME,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// User settings (`settings.json`). Every field is optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Settings {
    /// Reconciliation period in milliseconds
    #[serde(default)]
    pub tick_interval_ms: Option<u64>,
    /// Alternative affinity type file (supports `~`)
    #[serde(default)]
    pub types_file: Option<String>,
    /// Alternative saved-program file (supports `~`)
    #[serde(default)]
    pub policies_file: Option<String>,
}

impl Settings {
    /// Missing file means defaults; an unreadable one is reported and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(err) => {
                warn!(path = %path.display(), "failed to read settings: {err}");
                return Self::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|err| {
            warn!(path = %path.display(), "ignoring malformed settings: {err}");
            Self::default()
        })
    }

    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_interval_ms.map(Duration::from_millis)
    }
}

/// Resolved locations of every file the tool reads or writes
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub types_file: PathBuf,
    pub policies_file: PathBuf,
    pub settings_file: PathBuf,
    pub journal_file: PathBuf,
    pub lock_file: PathBuf,
    pub log_file: PathBuf,
    pub settings: Settings,
}

impl ConfigPaths {
    pub fn new() -> Result<Self> {
        let config_dir = match std::env::var_os(HOME_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
                .join(APP_DIRECTORY),
        };
        let runtime_dir = match std::env::var_os(RUNTIME_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join(APP_DIRECTORY),
        };
        Ok(Self::with_dirs(config_dir, runtime_dir))
    }

    /// Layout rooted at explicit directories, with `settings.json` applied.
    pub fn with_dirs(config_dir: PathBuf, runtime_dir: PathBuf) -> Self {
        let settings_file = config_dir.join(SETTINGS_FILE_NAME);
        let settings = Settings::load(&settings_file);

        let types_file = settings
            .types_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| config_dir.join(TYPES_FILE_NAME));
        let policies_file = settings
            .policies_file
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| config_dir.join(POLICIES_FILE_NAME));

        Self {
            types_file,
            policies_file,
            settings_file,
            journal_file: runtime_dir.join(JOURNAL_FILE_NAME),
            lock_file: runtime_dir.join(LOCK_FILE_NAME),
            log_file: runtime_dir.join(LOG_FILE_NAME),
            config_dir,
            runtime_dir,
            settings,
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.runtime_dir)?;
        if let Some(parent) = self.policies_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Tick period: `cli` first, then `PINAFFINITY_TICK_MS`, then settings, then the default.
    pub fn tick_interval(&self, cli: Option<u64>) -> Duration {
        let from_env = std::env::var(TICK_INTERVAL_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok());
        let interval = cli
            .or(from_env)
            .map(Duration::from_millis)
            .or_else(|| self.settings.tick_interval())
            .unwrap_or(DEFAULT_TICK_INTERVAL);
        interval.max(MIN_TICK_INTERVAL)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn default_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ConfigPaths::with_dirs(dir.path().join("cfg"), dir.path().join("run"));
        assert_eq!(paths.types_file, dir.path().join("cfg").join(TYPES_FILE_NAME));
        assert_eq!(paths.policies_file, dir.path().join("cfg").join(POLICIES_FILE_NAME));
        assert_eq!(paths.lock_file, dir.path().join("run").join(LOCK_FILE_NAME));
        assert_eq!(paths.settings, Settings::default());

        std::env::remove_var(TICK_INTERVAL_ENV);
        assert_eq!(paths.tick_interval(None), DEFAULT_TICK_INTERVAL);
        assert_eq!(paths.tick_interval(Some(1)), MIN_TICK_INTERVAL);
        assert_eq!(paths.tick_interval(Some(500)), Duration::from_millis(500));

        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir());
        assert!(paths.runtime_dir.is_dir());
    }

    #[test]
    #[serial]
    fn settings_override_files_and_interval() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("cfg");
        std::fs::create_dir_all(&config_dir).unwrap();
        let custom = dir.path().join("mine.txt");
        std::fs::write(
            config_dir.join(SETTINGS_FILE_NAME),
            format!(
                r#"{{ "tick_interval_ms": 750, "policies_file": {:?} }}"#,
                custom.display().to_string()
            ),
        )
        .unwrap();

        let paths = ConfigPaths::with_dirs(config_dir.clone(), dir.path().join("run"));
        assert_eq!(paths.policies_file, custom);
        assert_eq!(paths.types_file, config_dir.join(TYPES_FILE_NAME));

        std::env::remove_var(TICK_INTERVAL_ENV);
        assert_eq!(paths.tick_interval(None), Duration::from_millis(750));
        std::env::set_var(TICK_INTERVAL_ENV, "300");
        assert_eq!(paths.tick_interval(None), Duration::from_millis(300));
        std::env::remove_var(TICK_INTERVAL_ENV);
    }

    #[test]
    fn malformed_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ nope").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn expand_home_leaves_plain_paths() {
        assert_eq!(expand_home("/etc/x"), PathBuf::from("/etc/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/a.txt"), home.join("a.txt"));
        }
    }
}

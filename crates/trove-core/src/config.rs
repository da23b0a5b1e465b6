//! Configuration file handling.
//!
//! Trove reads a single JSON file listing the libraries to manage and
//! a handful of engine knobs. Every knob has a default, so a config
//! only needs to name its libraries.

use crate::error::ConfigError;
use crate::model::LibraryId;
use crate::source::SourceUri;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One configured library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub id: LibraryId,

    pub source: SourceUri,

    /// Selects which handler family receives this library's signals.
    pub context: String,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl LibraryConfig {
    pub fn new(id: impl Into<String>, source: SourceUri, context: impl Into<String>) -> Self {
        Self {
            id: LibraryId::new(id),
            source,
            context: context.into(),
            enabled: true,
        }
    }
}

/// Tunables for scanning and watching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on concurrently hashed files.
    pub hash_workers: usize,

    /// Per-file I/O budget.
    pub io_timeout_ms: u64,

    /// How long a missing file is kept before it is purged.
    pub confirmation_window_secs: u64,

    /// Events reconciled per index transaction.
    pub batch_size: usize,

    /// How long the watcher gathers raw notifications into one batch.
    /// Rename halves are only paired inside a batch.
    pub rename_window_ms: u64,

    /// Directories containing a file with this name are skipped.
    pub ignore_marker: Option<String>,

    pub follow_symlinks: bool,

    /// Attempts for reads that fail with a retryable error.
    pub retry_attempts: u32,

    pub retry_backoff_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            hash_workers: ((cpus as f64) * 0.9).max(1.0) as usize,
            io_timeout_ms: 30_000,
            confirmation_window_secs: 300,
            batch_size: 256,
            rename_window_ms: 50,
            ignore_marker: Some(".troveignore".to_string()),
            follow_symlinks: false,
            retry_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl EngineSettings {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn confirmation_window(&self) -> Duration {
        Duration::from_secs(self.confirmation_window_secs)
    }

    pub fn rename_window(&self) -> Duration {
        Duration::from_millis(self.rename_window_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// The whole config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroveConfig {
    /// Where the index database lives.
    pub database: PathBuf,

    #[serde(default)]
    pub settings: EngineSettings,

    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

impl TroveConfig {
    /// `<config_dir>/trove/config.json`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join("trove").join("config.json"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// A starter config with no libraries, storing its index next to
    /// the config file.
    pub fn starter(config_path: &Path) -> Self {
        let base = config_path.parent().unwrap_or_else(|| Path::new("."));
        Self {
            database: base.join("index"),
            settings: EngineSettings::default(),
            libraries: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let raw = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, raw).map_err(io_err)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for library in &self.libraries {
            if !seen.insert(&library.id) {
                return Err(ConfigError::DuplicateLibrary(library.id.to_string()));
            }
        }
        Ok(())
    }

    pub fn library(&self, id: &str) -> Option<&LibraryConfig> {
        self.libraries.iter().find(|l| l.id.as_str() == id)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let raw = r#"{
            "database": "/var/lib/trove",
            "libraries": [
                { "id": "photos", "source": "file:///srv/photos", "context": "gallery" }
            ]
        }"#;
        let config: TroveConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.settings, EngineSettings::default());
        assert!(config.libraries[0].enabled);
        assert_eq!(config.library("photos").unwrap().context, "gallery");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trove").join("config.json");
        let mut config = TroveConfig::starter(&path);
        config.libraries.push(LibraryConfig::new(
            "docs",
            SourceUri::file("/srv/docs"),
            "gallery",
        ));
        config.save(&path).unwrap();

        let loaded = TroveConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_duplicate_library_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = TroveConfig::starter(&path);
        let library = LibraryConfig::new("a", SourceUri::file("/a"), "gallery");
        config.libraries.push(library.clone());
        config.libraries.push(library);
        config.save(&path).unwrap();

        assert!(matches!(
            TroveConfig::load(&path),
            Err(ConfigError::DuplicateLibrary(_))
        ));
    }
}

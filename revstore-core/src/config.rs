//! Store and backend configuration.
//!
//! Both structs deserialize from JSON with defaults for every missing field,
//! so a config file only needs to name what it overrides.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default number of generations kept per branch before stemming.
pub const DEFAULT_REVS_LIMIT: u64 = 1000;

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store name, used as the change-notification topic.
    pub name: String,
    /// Generations kept per branch; `None` disables stemming.
    pub revs_limit: Option<u64>,
    /// Compact non-leaf revisions inline on every update.
    pub auto_compaction: bool,
    /// Buffered events per continuous change-feed subscriber.
    pub changes_channel_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "revstore".to_string(),
            revs_limit: Some(DEFAULT_REVS_LIMIT),
            auto_compaction: false,
            changes_channel_capacity: 64,
        }
    }
}

impl StoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Load config from a JSON file, falling back to defaults when absent.
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }
}

/// SQLite connection settings applied as pragmas on open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Database file; `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    pub journal_mode: String,
    pub synchronous: String,
    pub cache_size: i64,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: None,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: -64000,
            busy_timeout_ms: 5000,
        }
    }
}

impl SqliteConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(self, path)
    }
}

fn load_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = fs::read_to_string(path).map_err(|e| {
        Error::backing_store("Io", format!("Failed to read config from {:?}: {}", path, e))
    })?;
    Ok(serde_json::from_str(&data)?)
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let io_err = |e: std::io::Error| Error::backing_store("Io", e.to_string());
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(value)?;
    fs::write(&tmp_path, &data).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = StoreConfig::load(&tmp.path().join("store.json")).unwrap();
        assert_eq!(cfg.revs_limit, Some(DEFAULT_REVS_LIMIT));
        assert!(!cfg.auto_compaction);
    }

    #[test]
    fn test_partial_file_overrides() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.json");
        fs::write(&path, r#"{"name":"inbox","auto_compaction":true}"#).unwrap();
        let cfg = StoreConfig::load(&path).unwrap();
        assert_eq!(cfg.name, "inbox");
        assert!(cfg.auto_compaction);
        assert_eq!(cfg.changes_channel_capacity, 64);
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("sqlite.json");
        let cfg = SqliteConfig::file(tmp.path().join("db.sqlite"));
        cfg.save(&path).unwrap();
        let loaded = SqliteConfig::load(&path).unwrap();
        assert_eq!(loaded.path, cfg.path);
        assert_eq!(loaded.journal_mode, "WAL");
    }
}

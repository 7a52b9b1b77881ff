//! MyDB - storage foundation
//!
//! The transaction status journal and the shared resource cache that the
//! rest of the engine is built on.

pub mod error;
pub mod storage;

pub use error::{DbError, DbResult};
pub use storage::{ResourceCache, ResourceLoader, TransactionLog, TransactionStatus, Xid};

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable that overrides the configuration file path
pub const CONFIG_ENV: &str = "MYDB_CONFIG";

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the journal
    pub data_dir: PathBuf,
    /// Journal base name; the file on disk is `<data_dir>/<journal_name>.xid`
    pub journal_name: String,
    /// Resource limit for caches built with [`ResourceCache::with_config`] (0 = unbounded)
    pub cache_max_resources: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            journal_name: "mydb".to_string(),
            cache_max_resources: 1024,
        }
    }
}

impl Config {
    /// Load config from a JSON file.
    ///
    /// `MYDB_CONFIG` overrides `path`. A missing file yields the defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let path = resolve_config_path(path.as_ref(), env::var(CONFIG_ENV).ok());

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        Self::from_json(&contents)
            .map_err(|e| DbError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a JSON config; missing fields take their defaults
    pub fn from_json(contents: &str) -> DbResult<Self> {
        serde_json::from_str(contents).map_err(|e| DbError::Config(e.to_string()))
    }

    /// Base path of the journal (without the `.xid` suffix)
    pub fn journal_base(&self) -> PathBuf {
        self.data_dir.join(&self.journal_name)
    }
}

fn resolve_config_path(default: &Path, env_override: Option<String>) -> PathBuf {
    match env_override {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => default.to_path_buf(),
    }
}

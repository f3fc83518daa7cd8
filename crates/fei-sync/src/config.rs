// File: fei-sync/src/config.rs
// Purpose: Configuration parsing from fei-sync.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "fei-sync.toml";

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SyncSettings {
    #[serde(default)]
    pub api: ApiSettings,

    #[serde(default)]
    pub store: StoreBackend,

    #[serde(default)]
    pub sync: SyncOptions,
}

/// Remote backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer token; cookie sessions are handled outside this crate
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Where the local cache lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreBackend {
    /// Non-persistent, lost on restart
    Memory,

    /// One JSON file per key under `path`
    Filesystem { path: PathBuf },

    /// Single SQLite file at `path`
    Sqlite { path: PathBuf },
}

/// Orchestrator tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOptions {
    /// Load each changed form's full detail after a fei sync
    #[serde(default = "default_false")]
    pub hydrate_feis: bool,

    /// Pause between two hydrated forms
    #[serde(default = "default_hydrate_delay_ms")]
    pub hydrate_delay_ms: u64,

    /// Oldest queued mutations are dropped beyond this
    #[serde(default = "default_queue_max")]
    pub queue_max: usize,

    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// A probe slower than this counts as a very bad connection
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

// Default values
fn default_base_url() -> String {
    "http://localhost:3235".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".fei-sync/cache")
}

fn default_hydrate_delay_ms() -> u64 {
    50
}

fn default_queue_max() -> usize {
    10_000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_false() -> bool {
    false
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Filesystem {
            path: default_cache_path(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            hydrate_feis: false,
            hydrate_delay_ms: default_hydrate_delay_ms(),
            queue_max: default_queue_max(),
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl ApiSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SyncOptions {
    pub fn hydrate_delay(&self) -> Duration {
        Duration::from_millis(self.hydrate_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl SyncSettings {
    /// Load configuration from a TOML file; missing or empty means defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let settings: SyncSettings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(settings)
    }

    /// Load configuration from ./fei-sync.toml
    pub fn load_default() -> Result<Self> {
        Self::load(DEFAULT_CONFIG_FILE)
    }
}

//! Application configuration for kernelsync.
//!
//! User config lives at `~/.kernelsync/kernelsync.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SyncError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "kernelsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".kernelsync";

// ---------------------------------------------------------------------------
// Config structs (matching kernelsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncPoliciesConfig,
}

/// `[kernel]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Base URL of the kernel API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Page size used when reading the change feed.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:6543".into()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_page_size() -> u32 {
    500
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the website catalog database.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "var/kernelsync/website.db".into()
}

/// What to do when an article's ordering token cannot be turned into a position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidOrderPolicy {
    /// Log, report the candidate as skipped, keep going.
    #[default]
    Skip,
    /// Fail the run.
    Abort,
}

/// `[sync]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncPoliciesConfig {
    #[serde(default)]
    pub invalid_order: InvalidOrderPolicy,
}

// ---------------------------------------------------------------------------
// Sync config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime sync configuration: merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub kernel_url: Url,
    pub timeout: Duration,
    pub page_size: u32,
    pub invalid_order: InvalidOrderPolicy,
}

impl TryFrom<&AppConfig> for SyncConfig {
    type Error = SyncError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let kernel_url = Url::parse(&config.kernel.base_url).map_err(|e| {
            SyncError::config(format!(
                "invalid kernel.base_url '{}': {e}",
                config.kernel.base_url
            ))
        })?;

        if config.kernel.page_size == 0 {
            return Err(SyncError::config("kernel.page_size must be greater than 0"));
        }

        Ok(Self {
            kernel_url,
            timeout: Duration::from_secs(config.kernel.timeout_secs),
            page_size: config.kernel.page_size,
            invalid_order: config.sync.invalid_order,
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.kernelsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| SyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.kernelsync/kernelsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| SyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| SyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

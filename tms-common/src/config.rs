//! Configuration loading and database path resolution
//!
//! Database path resolution follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`TMS_DATABASE`)
//! 3. TOML config file (`database_path` key)
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing or unreadable TOML file is never fatal: a warning is logged and
//! compiled defaults are used.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the shared database file
pub const DATABASE_ENV_VAR: &str = "TMS_DATABASE";

/// Logging section of the TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

/// `[matching]` section: per-deployment threshold overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingToml {
    pub quantity_variance_pct: Option<f64>,
    pub price_variance_pct: Option<f64>,
    pub delivery_window_days: Option<i64>,
}

/// `[payroll]` section: worker overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayrollToml {
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<i64>,
    pub max_concurrent_jobs: Option<i64>,
}

/// Contents of `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub matching: MatchingToml,
    #[serde(default)]
    pub payroll: PayrollToml,
}

/// OS-dependent fallbacks used when nothing else is configured
#[derive(Debug, Clone)]
pub struct CompiledDefaults {
    pub database_path: PathBuf,
    pub log_level: String,
}

impl CompiledDefaults {
    pub fn for_current_platform() -> Self {
        Self {
            database_path: default_data_dir().join("tms.db"),
            log_level: default_log_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/tms (or /var/lib/tms for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("tms"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tms"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("tms"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tms"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("tms"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\tms"))
    } else {
        PathBuf::from("./tms_data")
    }
}

/// Locate the TOML config file for this platform, if one exists
///
/// Linux checks `~/.config/tms/config.toml` then `/etc/tms/config.toml`.
pub fn config_file_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("tms").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/tms/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Read and parse a TOML config file
pub fn read_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Load the platform config file, falling back to defaults when absent or broken
pub fn load_toml_config() -> TomlConfig {
    match config_file_path() {
        Some(path) => match read_toml_config(&path) {
            Ok(config) => {
                debug!("Loaded config file {}", path.display());
                config
            }
            Err(e) => {
                warn!("{}; using defaults", e);
                TomlConfig::default()
            }
        },
        None => {
            debug!("No config file found; using defaults");
            TomlConfig::default()
        }
    }
}

/// Resolves the shared database path for one service
pub struct DatabasePathResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml: TomlConfig,
}

impl DatabasePathResolver {
    pub fn new(module_name: &str, toml: TomlConfig) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml,
        }
    }

    pub fn with_cli_arg(mut self, cli_arg: Option<PathBuf>) -> Self {
        self.cli_arg = cli_arg;
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            debug!(module = %self.module_name, "Database path from command line");
            return path.clone();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(DATABASE_ENV_VAR) {
            if !path.trim().is_empty() {
                debug!(module = %self.module_name, "Database path from {}", DATABASE_ENV_VAR);
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        if let Some(path) = &self.toml.database_path {
            debug!(module = %self.module_name, "Database path from config file");
            return path.clone();
        }

        // Priority 4: OS-dependent compiled default
        CompiledDefaults::for_current_platform().database_path
    }
}

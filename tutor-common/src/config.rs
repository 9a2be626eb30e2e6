//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration follows a fixed priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file
//! 4. OS-dependent compiled default (fallback)
//!
//! Runtime tunables live in the database `settings` table instead
//! (see [`crate::db::settings`]).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the root folder for all tutor services
pub const ROOT_FOLDER_ENV: &str = "TUTOR_ROOT_FOLDER";

/// Database file name inside the root folder
pub const DATABASE_FILE_NAME: &str = "tutor.db";

/// Bootstrap configuration loaded from a TOML file
///
/// These settings cannot change while a service is running.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TomlConfig {
    /// Root folder holding the database and client-held state
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// HTTP bind host
    #[serde(default)]
    pub host: Option<String>,

    /// HTTP port
    #[serde(default)]
    pub port: Option<u16>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Load a TOML config file
///
/// A missing file yields the default configuration; a malformed file is an error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        debug!("No TOML config at {}, using defaults", path.display());
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
    toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Write a TOML config file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Default location of a module's TOML file: `<config dir>/tutor/<module>.toml`
pub fn default_config_path(module_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tutor")
        .join(format!("{}.toml", module_name))
}

/// Resolves the root folder from CLI, environment, TOML, then OS default
pub struct RootFolderResolver {
    module_name: String,
    cli_arg: Option<PathBuf>,
    toml_config: Option<TomlConfig>,
}

impl RootFolderResolver {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            cli_arg: None,
            toml_config: None,
        }
    }

    /// Root folder given on the command line
    pub fn with_cli_arg(mut self, path: Option<PathBuf>) -> Self {
        self.cli_arg = path;
        self
    }

    /// Already-loaded TOML config to consult before the OS default
    pub fn with_toml(mut self, config: TomlConfig) -> Self {
        self.toml_config = Some(config);
        self
    }

    pub fn resolve(&self) -> PathBuf {
        // Priority 1: Command-line argument
        if let Some(path) = &self.cli_arg {
            return path.clone();
        }

        // Priority 2: Environment variable
        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        // Priority 3: TOML config file
        let from_toml = match &self.toml_config {
            Some(config) => config.root_folder.clone(),
            None => match load_toml_config(&default_config_path(&self.module_name)) {
                Ok(config) => config.root_folder,
                Err(e) => {
                    warn!("Ignoring unreadable TOML config for {}: {}", self.module_name, e);
                    None
                }
            },
        };
        if let Some(path) = from_toml {
            return path;
        }

        // Priority 4: OS-dependent compiled default
        default_root_folder()
    }
}

/// Creates the root folder and derives paths inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE_NAME)
    }
}

/// Get OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "windows") {
        // %LOCALAPPDATA%\tutor
        dirs::data_local_dir()
            .map(|d| d.join("tutor"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\tutor"))
    } else if cfg!(target_os = "macos") {
        // ~/Library/Application Support/tutor
        dirs::data_dir()
            .map(|d| d.join("tutor"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/tutor"))
    } else {
        // ~/.local/share/tutor (or /var/lib/tutor for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("tutor"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/tutor"))
    }
}

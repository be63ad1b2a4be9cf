//! CLI settings layered from a TOML file and `FORKPIPE_*` variables

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use forkpipe_process::ProcessChannelMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Settings result type
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Failed to render settings: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Effective CLI settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Filter directive used when `RUST_LOG` is unset
    pub log_level: String,
    /// Budget for `run` and `pipe` before the children are killed
    pub wait_timeout_ms: u64,
    /// Channel mode for `run` when `--merge` is not given
    pub channel_mode: ProcessChannelMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            wait_timeout_ms: 30_000,
            channel_mode: ProcessChannelMode::SeparateChannels,
        }
    }
}

impl Settings {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wait_timeout_ms == 0 {
            return Err(SettingsError::Validation(
                "wait_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.log_level.trim().is_empty() {
            return Err(SettingsError::Validation(
                "log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }
}

/// Loads [`Settings`] from the config file, then the environment
pub struct SettingsLoader {
    /// Configuration file path
    config_path: PathBuf,
    /// Environment prefix
    env_prefix: String,
    /// Replacement for the process environment
    env_source: Option<HashMap<String, String>>,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self::with_path(Self::default_config_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            env_prefix: "FORKPIPE".to_string(),
            env_source: None,
        }
    }

    /// Reads variables from `vars` instead of the process environment
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// `<config dir>/forkpipe/config.toml`
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("forkpipe")
            .join("config.toml")
    }

    pub fn load(&self) -> Result<Settings> {
        let file = File::from(self.config_path.clone())
            .format(FileFormat::Toml)
            .required(false);
        let environment =
            Environment::with_prefix(&self.env_prefix).source(self.env_source.clone());

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

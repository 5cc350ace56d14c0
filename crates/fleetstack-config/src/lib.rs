pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "FLEETSTACK_CONFIG_PATH";
pub const PARALLEL_ENV: &str = "FLEETSTACK_PARALLEL";
pub const STACK_ENV: &str = "FLEETSTACK_STACK";

const CANDIDATES: [&str; 2] = ["fleetstack.local.yaml", "fleetstack.yaml"];

/// Engine settings as read from `fleetstack.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Maximum number of steps executed at once
    pub parallel: usize,

    /// Timeout for a single provider operation
    pub step_timeout_secs: u64,

    pub retry: RetrySettings,

    /// Directory holding `.fleetstack/`
    pub state_dir: PathBuf,

    pub stack: String,

    pub project: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallel: 10,
            step_timeout_secs: 600,
            retry: RetrySettings::default(),
            state_dir: PathBuf::from("."),
            stack: "dev".to_string(),
            project: "default".to_string(),
        }
    }
}

/// Retry policy for transient provider errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            backoff_multiplier: 2.0,
        }
    }
}

impl EngineSettings {
    pub fn from_yaml(text: &str, path: &Path) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text, path)
    }

    /// Settings from the first config file found, or defaults, with env overrides applied
    pub fn load() -> Result<Self> {
        let settings = match find_config_file() {
            Ok(path) => {
                tracing::debug!(path = %path.display(), "loading engine settings");
                Self::load_from(&path)?
            }
            Err(ConfigError::ConfigFileNotFound) => Self::default(),
            Err(e) => return Err(e),
        };
        settings.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(PARALLEL_ENV) {
            self.parallel = value
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::InvalidEnv {
                    name: PARALLEL_ENV.to_string(),
                    value,
                })?;
        }
        if let Ok(stack) = std::env::var(STACK_ENV) {
            if !stack.is_empty() {
                self.stack = stack;
            }
        }
        Ok(self)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Global configuration directory (`~/.config/fleetstack`)
pub fn get_config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("fleetstack"))
}

/// Locate the settings file
///
/// Search order:
/// 1. `FLEETSTACK_CONFIG_PATH`
/// 2. current directory: fleetstack.local.yaml, fleetstack.yaml
/// 3. `./.fleetstack/` with the same names
/// 4. `~/.config/fleetstack/fleetstack.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    for dir in [current_dir.clone(), current_dir.join(".fleetstack")] {
        if let Some(path) = CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
        {
            return Ok(path);
        }
    }

    if let Ok(config_dir) = get_config_dir() {
        let global = config_dir.join("fleetstack.yaml");
        if global.exists() {
            return Ok(global);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

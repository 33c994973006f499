//! Cutover Configuration
//!
//! Config file lookup order:
//! 1. Explicit path (`--config`)
//! 2. `$CUTOVER_CONFIG`
//! 3. `<home>/config.toml`
//! 4. Defaults

use crate::detector::DetectorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment override for the config file path
pub const CONFIG_ENV: &str = "CUTOVER_CONFIG";

/// Home directory name under the user's home
pub const DEFAULT_HOME_DIR: &str = ".cutover";

/// Chain endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// CometBFT RPC
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Cosmos SDK REST
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:26657".to_string()
}

fn default_rest_url() -> String {
    "http://127.0.0.1:1317".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            rest_url: default_rest_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorSection {
    /// Seconds between the two height samples used to spot a halted chain
    #[serde(default = "default_halt_sample_secs")]
    pub halt_sample_secs: u64,
}

fn default_halt_sample_secs() -> u64 {
    3
}

impl Default for DetectorSection {
    fn default() -> Self {
        Self {
            halt_sample_secs: default_halt_sample_secs(),
        }
    }
}

/// Main cutover configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CutoverConfig {
    /// Deployment home directory; `~/.cutover` when unset
    #[serde(default)]
    pub home: Option<PathBuf>,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub detector: DetectorSection,
}

impl CutoverConfig {
    /// `~/.cutover`, or `./.cutover` when no home directory is known
    pub fn default_home() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_HOME_DIR)
    }

    pub fn home_dir(&self) -> PathBuf {
        match &self.home {
            Some(home) => expand_tilde(home),
            None => Self::default_home(),
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            halt_sample: Duration::from_secs(self.detector.halt_sample_secs),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Resolve and load the config. `home_override` is the `--home` flag.
    pub fn load(explicit: Option<&Path>, home_override: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::from_file(path)?
        } else if let Ok(path) = std::env::var(CONFIG_ENV) {
            Self::from_file(Path::new(&path))?
        } else {
            let home = home_override
                .map(expand_tilde)
                .unwrap_or_else(Self::default_home);
            let path = home.join("config.toml");
            if path.exists() {
                Self::from_file(&path)?
            } else {
                Self::default()
            }
        };

        if let Some(home) = home_override {
            config.home = Some(home.to_path_buf());
        }
        Ok(config)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

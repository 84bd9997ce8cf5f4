//! Krypton Configuration
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./krypton.yaml` (current directory - highest priority)
//! 2. `~/.config/krypton/krypton.yaml` (user config directory)
//! 3. `/etc/krypton/krypton.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files. An embedder may also construct `KryptonConfig` directly and
//! hand it to the session.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config filename.
const CONFIG_FILENAME: &str = "krypton.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Session configuration (`krypton.*`).
///
/// The URL fields point at the control plane: zinc performs auth/sign,
/// brass performs add-egress. The boolean trio selects the dataplane
/// dialect; timing knobs cover the rekey cadence and the datapath
/// reattempt delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KryptonConfig {
    /// Auth (zinc) endpoint URL.
    #[serde(default)]
    pub zinc_url: String,

    /// Add-egress (brass) endpoint URL.
    #[serde(default)]
    pub brass_url: String,

    /// Service type identifier sent with auth requests.
    #[serde(default)]
    pub service_type: String,

    /// Use the IpSec dataplane instead of bridge.
    #[serde(default)]
    pub ipsec_datapath: bool,

    /// Run the bridge dataplane over the PPN control plane.
    #[serde(default)]
    pub bridge_over_ppn: bool,

    /// Attach blind-signed tokens to egress requests.
    #[serde(default)]
    pub enable_blind_signing: bool,

    /// Seconds between periodic rekeys.
    #[serde(default = "KryptonConfig::default_rekey_interval_secs")]
    pub rekey_interval_secs: u64,

    /// Milliseconds between a datapath failure and the reconnect attempt.
    #[serde(default = "KryptonConfig::default_datapath_reattempt_delay_ms")]
    pub datapath_reattempt_delay_ms: u64,
}

impl Default for KryptonConfig {
    fn default() -> Self {
        Self {
            zinc_url: String::new(),
            brass_url: String::new(),
            service_type: String::new(),
            ipsec_datapath: false,
            bridge_over_ppn: false,
            enable_blind_signing: false,
            rekey_interval_secs: Self::default_rekey_interval_secs(),
            datapath_reattempt_delay_ms: Self::default_datapath_reattempt_delay_ms(),
        }
    }
}

impl KryptonConfig {
    fn default_rekey_interval_secs() -> u64 {
        300
    }

    fn default_datapath_reattempt_delay_ms() -> u64 {
        500
    }

    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged; returns the
    /// merged config and the list of paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = KryptonConfig::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/krypton").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("krypton").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// String values from `other` override when non-empty; booleans are
    /// OR-merged; timing knobs override when they differ from the default.
    pub fn merge(&mut self, other: KryptonConfig) {
        if !other.zinc_url.is_empty() {
            self.zinc_url = other.zinc_url;
        }
        if !other.brass_url.is_empty() {
            self.brass_url = other.brass_url;
        }
        if !other.service_type.is_empty() {
            self.service_type = other.service_type;
        }
        if other.ipsec_datapath {
            self.ipsec_datapath = true;
        }
        if other.bridge_over_ppn {
            self.bridge_over_ppn = true;
        }
        if other.enable_blind_signing {
            self.enable_blind_signing = true;
        }
        if other.rekey_interval_secs != Self::default_rekey_interval_secs() {
            self.rekey_interval_secs = other.rekey_interval_secs;
        }
        if other.datapath_reattempt_delay_ms != Self::default_datapath_reattempt_delay_ms() {
            self.datapath_reattempt_delay_ms = other.datapath_reattempt_delay_ms;
        }
    }
}

//! Host configuration.
//!
//! Loaded from `~/.addonhost/config.toml`. A missing file means defaults;
//! every key is optional.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addons::{
    AddonSession, DEFAULT_CONTRACT_PREFIX, ServiceSettings, SessionBuilder, SharedContract,
    TaskScheduler,
};
use crate::logging::LogConfig;
use crate::version::Version;

/// Name of the per-user configuration directory.
pub const CONFIG_DIR_NAME: &str = ".addonhost";

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but cannot be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("cannot parse {path}: {reason}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// `[contract]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractConfig {
    /// Shared-contract symbol prefix.
    pub prefix: String,
    /// Symbols the host publishes.
    pub published: Vec<String>,
}

impl Default for ContractConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_CONTRACT_PREFIX.to_string(),
            published: Vec::new(),
        }
    }
}

/// `[services]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Throttle window for resolution logging, in seconds.
    pub log_window_secs: u64,
    /// Throttle map size that triggers eviction.
    pub throttle_evict_threshold: usize,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        let defaults = ServiceSettings::default();
        Self {
            log_window_secs: defaults.log_window.as_secs(),
            throttle_evict_threshold: defaults.evict_threshold,
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Whether fatal findings block loading.
    pub enforce: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { enforce: true }
    }
}

/// Full host configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Directory scanned for bundles.
    pub addons_dir: PathBuf,
    /// Managed root for per-addon data and logs.
    pub data_root: PathBuf,
    /// Host version reported to addons.
    pub host_version: String,
    /// Contract level the host provides.
    pub contract_level: u32,
    /// Shared contract.
    pub contract: ContractConfig,
    /// Service registry tunables.
    pub services: ServicesConfig,
    /// Audit policy.
    pub audit: AuditConfig,
    /// Logging.
    pub log: LogConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        let base = base_directory();
        Self {
            addons_dir: base.join("addons"),
            data_root: base.join("data"),
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            contract_level: 1,
            contract: ContractConfig::default(),
            services: ServicesConfig::default(),
            audit: AuditConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// `~/.addonhost`, or `./.addonhost` without a home directory.
#[must_use]
pub fn base_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

impl HostConfig {
    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        base_directory().join(CONFIG_FILE_NAME)
    }

    /// Loads from the default path.
    ///
    /// # Errors
    /// Returns error if the file exists but is unreadable or invalid.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_config_path())
    }

    /// Loads from `path`; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but is unreadable or invalid.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    /// Returns error if the text is invalid.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// Returns the first invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.contract.prefix.trim().trim_end_matches('.').is_empty() {
            return Err(ConfigError::Invalid("contract.prefix must not be empty".to_string()));
        }
        self.parsed_host_version()?;
        if self.services.log_window_secs == 0 {
            return Err(ConfigError::Invalid(
                "services.log_window_secs must be positive".to_string(),
            ));
        }
        if self.services.throttle_evict_threshold == 0 {
            return Err(ConfigError::Invalid(
                "services.throttle_evict_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The host version as a [`Version`].
    ///
    /// # Errors
    /// Returns error if `host_version` does not parse.
    pub fn parsed_host_version(&self) -> Result<Version, ConfigError> {
        Version::parse(&self.host_version)
            .map_err(|e| ConfigError::Invalid(format!("host_version: {}", e)))
    }

    /// The shared contract described by `[contract]`.
    #[must_use]
    pub fn shared_contract(&self) -> SharedContract {
        SharedContract::new(self.contract.prefix.trim())
            .with_symbols(self.contract.published.iter().map(String::as_str))
    }

    /// Registry tunables described by `[services]`.
    #[must_use]
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            log_window: Duration::from_secs(self.services.log_window_secs),
            evict_threshold: self.services.throttle_evict_threshold,
        }
    }

    /// A session builder configured from this file.
    ///
    /// # Errors
    /// Returns error if the configuration is invalid.
    pub fn session_builder(
        &self,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<SessionBuilder, ConfigError> {
        self.validate()?;
        Ok(AddonSession::builder(&self.data_root, scheduler)
            .contract(self.shared_contract())
            .host_version(self.parsed_host_version()?)
            .contract_level(self.contract_level)
            .service_settings(self.service_settings()))
    }
}

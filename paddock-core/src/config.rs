//! Configuration management with TOML support
//!
//! Configuration is loaded from a TOML file, overridden from `PADDOCK_*`
//! environment variables and validated before use. Every section has
//! defaults, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PaddockError, PaddockResult};
use crate::subnet::{MacPrefix, PoolSpec};

/// Complete configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server-wide settings
    pub server: ServerConfig,

    /// Subnet pool and addressing
    pub network: NetworkConfig,

    /// Lifecycle state machine settings
    pub lifecycle: LifecycleConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Root of all per-cluster and per-node working directories
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Pool specs, `"<CIDR>,<allocation-prefix-length>"`, scanned in order
    pub subnets: Vec<String>,

    /// Low addresses of every subnet set aside for infrastructure
    pub reserved_ips: u32,

    /// Two leading MAC bytes, e.g. `"80:00"`
    pub mac_prefix: String,

    /// Prefix of bridge device names created by the bridge provider
    pub bridge_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound for a driver verb reporting back; zero waits forever
    #[serde(with = "humantime_serde")]
    pub verb_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Output format (text, json)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            lifecycle: LifecycleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("/var/lib/paddock"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnets: vec![
                "172.16.0.0/12,24".to_string(),
                "192.168.0.0/16,24".to_string(),
            ],
            reserved_ips: 9,
            mac_prefix: "80:00".to_string(),
            bridge_prefix: "br".to_string(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            verb_timeout: Duration::from_secs(120),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Parse every configured pool spec, in declaration order
    pub fn pool_specs(&self) -> PaddockResult<Vec<PoolSpec>> {
        self.subnets.iter().map(|s| s.parse()).collect()
    }

    pub fn parsed_mac_prefix(&self) -> PaddockResult<MacPrefix> {
        self.mac_prefix.parse()
    }
}

impl LifecycleConfig {
    /// The verb timeout, or `None` when waiting is unbounded
    pub fn verb_timeout(&self) -> Option<Duration> {
        if self.verb_timeout.is_zero() {
            None
        } else {
            Some(self.verb_timeout)
        }
    }
}

// Configuration loading and management

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> PaddockResult<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .map_err(|e| PaddockError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml(&contents)?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from TOML text without env overrides
    pub fn from_toml(contents: &str) -> PaddockResult<Self> {
        toml::from_str(contents)
            .map_err(|e| PaddockError::ConfigError(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("PADDOCK_WORKDIR") {
            self.server.workdir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("PADDOCK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(subnets) = std::env::var("PADDOCK_SUBNETS") {
            let specs: Vec<String> = subnets.split_whitespace().map(str::to_string).collect();
            if !specs.is_empty() {
                self.network.subnets = specs;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PaddockResult<()> {
        if self.server.workdir.as_os_str().is_empty() {
            return Err(PaddockError::ConfigError(
                "Working directory cannot be empty".to_string(),
            ));
        }

        if self.network.subnets.is_empty() {
            return Err(PaddockError::ConfigError(
                "At least one subnet pool spec is required".to_string(),
            ));
        }
        self.network.pool_specs()?;
        self.network.parsed_mac_prefix()?;

        if self.network.bridge_prefix.is_empty() {
            return Err(PaddockError::ConfigError(
                "Bridge prefix cannot be empty".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(PaddockError::ConfigError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            _ => {
                return Err(PaddockError::ConfigError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }
}

/// Configuration builder for programmatic construction
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.server.workdir = dir.into();
        self
    }

    pub fn subnets<I, S>(mut self, specs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.network.subnets = specs.into_iter().map(Into::into).collect();
        self
    }

    pub fn reserved_ips(mut self, count: u32) -> Self {
        self.config.network.reserved_ips = count;
        self
    }

    pub fn mac_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.network.mac_prefix = prefix.into();
        self
    }

    pub fn verb_timeout(mut self, timeout: Duration) -> Self {
        self.config.lifecycle.verb_timeout = timeout;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> PaddockResult<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.network.reserved_ips, 9);
        assert_eq!(config.network.subnets.len(), 2);
        assert_eq!(config.network.mac_prefix, "80:00");
        assert_eq!(config.lifecycle.verb_timeout(), Some(Duration::from_secs(120)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = ConfigBuilder::new()
            .verb_timeout(Duration::ZERO)
            .build()
            .unwrap();
        assert_eq!(config.lifecycle.verb_timeout(), None);
    }

    #[test]
    fn test_invalid_pool_spec_rejected() {
        let result = ConfigBuilder::new().subnets(["10.0.0.0/8"]).build();
        assert!(matches!(result, Err(PaddockError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let result = ConfigBuilder::new().log_level("loud").build();
        assert!(result.is_err());
    }
}

//! Runtime configuration via `shardcall.toml`
//!
//! The runtime reads one config file at startup. Missing fields fall back to
//! defaults; an empty file is a valid config. To change settings, edit the file
//! and restart the host process.

use crate::cluster::IsolationLevel;
use serde::{Deserialize, Serialize};
use shardcall_core::{Limits, ProxyError, ProxyResult};
use std::path::Path;
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "shardcall.toml";

/// Runtime configuration loaded from `shardcall.toml`.
///
/// # Example
///
/// ```toml
/// cancel_timeout_ms = 5000
/// default_isolation_level = "read committed"
///
/// [limits]
/// max_connections = 128
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// How long to wait for a remote node to acknowledge a cancel request
    /// before giving up on the connection.
    #[serde(default = "default_cancel_timeout_ms")]
    pub cancel_timeout_ms: u64,
    /// Isolation level for clusters that do not set `isolation_level`.
    #[serde(default = "default_isolation_level")]
    pub default_isolation_level: String,
    /// Connection lifetime for clusters that do not set `connection_lifetime`.
    /// Absent means connections never age out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_connection_lifetime_secs: Option<u64>,
    /// Size limits.
    #[serde(default)]
    pub limits: Limits,
}

fn default_cancel_timeout_ms() -> u64 {
    5000
}

fn default_isolation_level() -> String {
    "read committed".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            cancel_timeout_ms: default_cancel_timeout_ms(),
            default_isolation_level: default_isolation_level(),
            default_connection_lifetime_secs: None,
            limits: Limits::default(),
        }
    }
}

impl ProxyConfig {
    /// Cancel acknowledgement timeout
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }

    /// Default connection lifetime, if any
    pub fn default_connection_lifetime(&self) -> Option<Duration> {
        self.default_connection_lifetime_secs.map(Duration::from_secs)
    }

    /// Parse the default isolation level.
    ///
    /// # Errors
    ///
    /// Returns an error if the level is not a recognized isolation level.
    pub fn isolation_level(&self) -> ProxyResult<IsolationLevel> {
        IsolationLevel::parse(&self.default_isolation_level, &self.limits).map_err(|reason| {
            config_error(format!(
                "invalid default_isolation_level '{}': {}",
                self.default_isolation_level, reason
            ))
        })
    }

    /// Check every field.
    pub fn validate(&self) -> ProxyResult<()> {
        self.limits
            .validate()
            .map_err(|e| config_error(e.to_string()))?;
        if self.cancel_timeout_ms == 0 {
            return Err(config_error("cancel_timeout_ms must be greater than zero"));
        }
        self.isolation_level()?;
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# shardcall runtime configuration
#
# How long to wait (ms) for a node to acknowledge a cancelled query before the
# connection is discarded.
cancel_timeout_ms = 5000

# Isolation level for clusters without an `isolation_level` option.
# One of "auto commit", or
# "{read committed | repeatable read | serializable} [read write | read only] [[not] deferrable]"
default_isolation_level = "read committed"

# Connection lifetime (seconds) for clusters without a `connection_lifetime`
# option. Leave unset to keep connections until they fail.
# default_connection_lifetime_secs = 3600

[limits]
max_nodes = 100
max_args = 100
max_connections = 128
max_address_len = 1024
max_isolation_level_len = 42
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::io(
                format!("failed to read config file '{}'", path.display()),
                e,
            )
        })?;
        let config: ProxyConfig = toml::from_str(&content).map_err(|e| {
            ProxyError::parse(
                path.display().to_string(),
                format!("failed to parse config file: {}", e),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> ProxyResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                ProxyError::io(
                    format!("failed to write default config file '{}'", path.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> ProxyResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| config_error(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            ProxyError::io(
                format!("failed to write config file '{}'", path.display()),
                e,
            )
        })
    }
}

fn config_error(reason: impl Into<String>) -> ProxyError {
    ProxyError::parse(CONFIG_FILE_NAME, reason)
}

//! Server configuration file
//!
//! Loads optional settings from a TOML file and layers command line
//! overrides on top of them.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::server::{RouteTable, ServerConfig, DEFAULT_BIND, DEFAULT_PORT};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Settings that may come from a config file or the command line.
///
/// Every field is optional; unset fields fall back to the lower layer and
/// finally to the built-in defaults.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Address to bind to
    pub bind: Option<String>,
    /// Port to listen on
    pub port: Option<u16>,
    /// WebSocket upgrade path
    pub path: Option<String>,
    /// Delay between echoed frames, in milliseconds
    pub interval_ms: Option<u64>,
    /// How long to wait for the first message, in seconds
    pub recv_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: FileConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Layer `overrides` on top of `self`; set fields in `overrides` win.
    pub fn merge(self, overrides: FileConfig) -> Self {
        Self {
            bind: overrides.bind.or(self.bind),
            port: overrides.port.or(self.port),
            path: overrides.path.or(self.path),
            interval_ms: overrides.interval_ms.or(self.interval_ms),
            recv_timeout_secs: overrides.recv_timeout_secs.or(self.recv_timeout_secs),
        }
    }

    /// Resolve into a server configuration and its route table
    pub fn resolve(self) -> Result<(ServerConfig, RouteTable), ConfigError> {
        let routes = match self.path {
            None => RouteTable::livestream(),
            Some(path) if path.starts_with('/') => RouteTable::new().with_route(path),
            Some(path) => {
                return Err(ConfigError::Invalid(format!(
                    "path must start with '/': {path}"
                )))
            }
        };

        let mut config = ServerConfig::new(
            self.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            self.port.unwrap_or(DEFAULT_PORT),
        );

        if let Some(ms) = self.interval_ms {
            if ms == 0 {
                return Err(ConfigError::Invalid(
                    "interval_ms must be greater than zero".to_string(),
                ));
            }
            config = config.with_interval(Duration::from_millis(ms));
        }

        // Zero means "no timeout", same as leaving it unset.
        let recv_timeout = self
            .recv_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        config = config.with_recv_timeout(recv_timeout);

        Ok((config, routes))
    }
}

//! Relay server configuration
//!
//! Loads the relay settings from a TOML file. Every field has a default so a
//! partial file (or no file at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default bind address
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;

/// Default liveness probe interval (30 seconds)
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 30_000;

/// Default per-connection outbound queue depth, in frames
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Errors that can occur while loading the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Period of the liveness probe, in milliseconds
    pub probe_interval_ms: u64,
    /// Consecutive unanswered probes tolerated before eviction.
    /// Zero evicts on the first probe that is still unanswered at the next tick.
    pub miss_tolerance: u32,
    /// Deliver directed messages to the target only, without the
    /// `send`-tagged copy to every other connection
    pub private_direct: bool,
    /// Frames queued for one connection before further frames to it are dropped
    pub outbound_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            probe_interval_ms: DEFAULT_PROBE_INTERVAL_MS,
            miss_tolerance: 0,
            private_direct: false,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "probe_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_capacity must be greater than zero".to_string(),
            ));
        }
        if self.bind.is_empty() {
            return Err(ConfigError::Invalid("bind cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Liveness probe period
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

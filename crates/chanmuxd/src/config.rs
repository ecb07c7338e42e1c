//! Server configuration.
//!
//! Values come from, lowest precedence first: built-in defaults, an
//! optional TOML file, then whatever the embedding binary layers on top
//! (environment, command line).
//!
//! ```toml
//! listen_addr = "0.0.0.0:8080"
//! max_in_flight = 128
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default per-connection bound on concurrently running handlers
const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Maximum frame size (1 MB)
const DEFAULT_MAX_FRAME_SIZE: usize = 1_048_576;

/// Time allowed for the identity frame (10 seconds)
const DEFAULT_IDENTIFY_TIMEOUT_SECS: u64 = 10;

/// Write timeout (10 seconds)
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Configuration for a [`Server`](crate::server::Server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Handlers a single connection may have running at once. The read
    /// loop waits for a slot before dispatching the next handler.
    pub max_in_flight: usize,

    /// Largest accepted inbound frame, in bytes.
    pub max_frame_size: usize,

    /// Seconds a new connection has to send its identity frame.
    pub identify_timeout_secs: u64,

    /// Seconds a single socket write may take before the connection is
    /// considered broken.
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            identify_timeout_secs: DEFAULT_IDENTIFY_TIMEOUT_SECS,
            write_timeout_secs: DEFAULT_WRITE_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    /// Parses a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "max_in_flight",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.identify_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "identify_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "write_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_secs(self.identify_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Invalid config: {0}")]
    Parse(String),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

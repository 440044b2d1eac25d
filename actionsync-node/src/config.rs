//! Node and reconnection configuration.
//!
//! Settings are plain structs with serde defaults and can be loaded from a
//! TOML file (`[node]` and `[reconnect]` sections). Behavior hooks such as
//! authenticators and sync policies are wired programmatically through
//! [`NodeOptions`](crate::NodeOptions), not through files.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;

/// Heartbeat, time-fix and handshake settings for one sync node.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Milliseconds of outbound silence before a `ping` is sent.
    /// `0` disables the heartbeat (default).
    #[serde(default)]
    pub ping: u64,
    /// Milliseconds to wait for a `pong` before closing the connection.
    /// Required whenever `ping` is set.
    #[serde(default)]
    pub timeout: u64,
    /// Estimate the remote clock offset during the handshake and apply it
    /// to incoming and outgoing `meta.time` values (default: true).
    #[serde(default = "default_fix_time")]
    pub fix_time: bool,
    /// This node's application subprotocol version, announced to the peer.
    #[serde(default)]
    pub subprotocol: Option<String>,
    /// Opaque credentials sent with the handshake.
    #[serde(default)]
    pub credentials: Option<Value>,
    /// Convenience authentication token; used as credentials when no
    /// explicit `credentials` value is set.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_fix_time() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ping: 0,
            timeout: 0,
            fix_time: default_fix_time(),
            subprotocol: None,
            credentials: None,
            token: None,
        }
    }
}

impl NodeConfig {
    /// Check the configuration for contradictions.
    ///
    /// A heartbeat without a timeout would detect nothing, so `ping > 0`
    /// with `timeout == 0` is rejected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping > 0 && self.timeout == 0 {
            return Err(ConfigError::Invalid(
                "`ping` requires a non-zero `timeout`".to_string(),
            ));
        }
        Ok(())
    }

    /// The credentials to announce: explicit `credentials`, else `token`.
    pub fn effective_credentials(&self) -> Option<Value> {
        self.credentials
            .clone()
            .or_else(|| self.token.as_ref().map(|t| Value::String(t.clone())))
    }
}

/// Backoff policy for the [`Reconnect`](crate::Reconnect) supervisor.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Give up after this many connection attempts. `None` retries forever.
    #[serde(default)]
    pub attempts: Option<u32>,
    /// Base delay in milliseconds before the first retry (default: 1000).
    #[serde(default = "default_min_delay")]
    pub min_delay: u64,
    /// Upper bound for the retry delay in milliseconds (default: 5000).
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

fn default_min_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    5000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: None,
            min_delay: default_min_delay(),
            max_delay: default_max_delay(),
        }
    }
}

/// Root of a TOML settings file with `[node]` and `[reconnect]` sections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncSettings {
    /// Node settings.
    #[serde(default)]
    pub node: NodeConfig,
    /// Reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl SyncSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let settings: SyncSettings =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                source: e,
            })?;
        settings.node.validate()?;
        Ok(settings)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the settings file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the settings file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the settings file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the settings file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// The settings contradict each other.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

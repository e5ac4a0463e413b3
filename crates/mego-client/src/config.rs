//! Configuration file handling.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/mego/config.toml` by default:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:5000"
//! max_sessions = 1024
//!
//! [client]
//! url = "ws://127.0.0.1:5000"
//! timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mego_core::MB;
use mego_server::EngineConfig;

use crate::error::{ClientError, ClientResult};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default size of one upload chunk.
pub const DEFAULT_CHUNK_SIZE: usize = MB as usize;

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine settings used by `mego serve`.
    pub server: EngineConfig,

    /// Client connection settings.
    pub client: ClientConfig,
}

/// Client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket URL of the server.
    pub url: String,

    /// Seconds to wait for each response.
    pub timeout_secs: u64,

    /// Bytes per part of a chunked upload.
    pub chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:5000".to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ClientConfig {
    /// Settings for `url` with default limits.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Sets the chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Response timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Loads configuration from the default path.
    ///
    /// A missing file yields the defaults.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Serializes the configuration as TOML.
    pub fn to_toml(&self) -> ClientResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mego")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.client.url, "ws://127.0.0.1:5000");
        assert_eq!(config.client.timeout(), Duration::from_secs(30));
        assert_eq!(config.server.max_sessions, EngineConfig::default().max_sessions);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let toml_content = r#"
[server]
listen = "0.0.0.0:9000"
max_sessions = 8

[client]
url = "ws://example.com:9000"
chunk_size = 1024
"#;
        let config: Config = toml::from_str(toml_content).unwrap();
        assert_eq!(config.server.listen.port(), 9000);
        assert_eq!(config.server.max_sessions, 8);
        assert_eq!(config.client.url, "ws://example.com:9000");
        assert_eq!(config.client.chunk_size, 1024);
        assert_eq!(config.client.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client]\ntimeout_secs = 5\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn load_from_invalid_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[client\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn dump_round_trips() {
        let mut config = Config::default();
        config.client = ClientConfig::new("ws://10.0.0.1:5000").with_chunk_size(4096);
        let text = config.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.client.url, "ws://10.0.0.1:5000");
        assert_eq!(back.client.chunk_size, 4096);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = ClientConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn default_path_ends_with_mego() {
        let path = Config::default_path();
        assert!(path.ends_with("mego/config.toml"));
    }
}

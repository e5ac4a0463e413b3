//! Engine configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use mego_core::{GB, MB};
use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// Every field has a default, so a partial `[server]` TOML section is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Address the WebSocket listener binds to.
    pub listen: SocketAddr,

    /// Maximum size of one request's params plus whole files, in bytes.
    pub max_payload_size: usize,

    /// Maximum size of one chunk, in bytes.
    pub max_chunk_size: usize,

    /// Maximum size of an assembled file, in bytes.
    pub max_file_size: usize,

    /// Maximum number of connected sessions.
    pub max_sessions: usize,

    /// Seconds between liveness pings.
    pub check_interval_secs: u64,

    /// Event pushes queued per session before new ones are dropped.
    pub send_buffer: usize,

    /// Seconds a chunked upload may wait for its next part before it is discarded.
    pub upload_timeout_secs: u64,

    /// Directory for uploaded and partially uploaded files.
    pub upload_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            max_payload_size: (32 * MB) as usize,
            max_chunk_size: (4 * MB) as usize,
            max_file_size: GB as usize,
            max_sessions: 1024,
            check_interval_secs: 30,
            send_buffer: 256,
            upload_timeout_secs: 300,
            upload_dir: std::env::temp_dir(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration listening on `listen`.
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// Liveness ping interval.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    /// Idle time after which a pending chunked upload is discarded.
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs.max(1))
    }

    /// Builder: set max payload size.
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size;
        self
    }

    /// Builder: set max chunk size.
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Builder: set max file size.
    pub fn with_max_file_size(mut self, size: usize) -> Self {
        self.max_file_size = size;
        self
    }

    /// Builder: set max sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Builder: set the ping interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_secs = interval.as_secs();
        self
    }

    /// Builder: set the per-session outbound queue length.
    pub fn with_send_buffer(mut self, frames: usize) -> Self {
        self.send_buffer = frames;
        self
    }

    /// Builder: set the chunked upload idle timeout.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout_secs = timeout.as_secs();
        self
    }

    /// Builder: set the upload directory.
    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.listen.to_string(), "127.0.0.1:5000");
        assert_eq!(config.max_chunk_size, 4 * 1024 * 1024);
        assert_eq!(config.check_interval(), Duration::from_secs(30));
        assert_eq!(config.max_sessions, 1024);
        assert_eq!(config.upload_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn custom_config() {
        let config = EngineConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_max_chunk_size(16)
            .with_max_file_size(64)
            .with_max_sessions(2)
            .with_check_interval(Duration::from_secs(5))
            .with_upload_timeout(Duration::from_secs(20))
            .with_upload_dir("/srv/uploads");

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.max_chunk_size, 16);
        assert_eq!(config.max_file_size, 64);
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.check_interval_secs, 5);
        assert_eq!(config.upload_timeout_secs, 20);
        assert_eq!(config.upload_dir, PathBuf::from("/srv/uploads"));
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = EngineConfig::default()
            .with_check_interval(Duration::ZERO)
            .with_upload_timeout(Duration::ZERO);
        assert_eq!(config.check_interval(), Duration::from_secs(1));
        assert_eq!(config.upload_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn partial_section_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"listen":"127.0.0.1:7000","max_sessions":8}"#).unwrap();
        assert_eq!(config.listen.port(), 7000);
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.send_buffer, 256);
    }
}

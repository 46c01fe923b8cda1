//! Session configuration
//!
//! Timeouts, sweep intervals and limits for one download session. Every
//! field has a default, so a JSON config file only needs the keys it changes.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TorrentError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Port announced to trackers
    pub listen_port: u16,
    /// Upper bound on concurrently connected peers
    pub max_connections: usize,
    pub peer_connect_timeout_secs: u64,
    /// Age after which an unanswered block request is released
    pub request_timeout_ms: u64,
    pub expiry_sweep_ms: u64,
    pub endgame_sweep_ms: u64,
    pub stats_interval_ms: u64,
    /// Minimum gap between peer rediscoveries while no peer is connected
    pub rediscover_interval_secs: u64,
    pub tracker_connect_timeout_ms: u64,
    /// Extra time to collect announce responses after all trackers were asked
    pub tracker_aggregation_ms: u64,
    /// Bound on each peer's request queue
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            max_connections: 50,
            peer_connect_timeout_secs: 10,
            request_timeout_ms: 10_000,
            expiry_sweep_ms: 2_000,
            endgame_sweep_ms: 2_000,
            stats_interval_ms: 2_000,
            rediscover_interval_secs: 30,
            tracker_connect_timeout_ms: 2_000,
            tracker_aggregation_ms: 2_000,
            queue_capacity: 10_000,
        }
    }
}

impl SessionConfig {
    /// Load a config from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config_error_with_field(
                format!("Failed to read config file '{}': {}", path.display(), e),
                "config",
            )
        })?;
        let config = Self::from_json_str(&text)?;
        debug!("Loaded session config from {}", path.display());
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(text).map_err(TorrentError::from)?;
        Ok(config)
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn expiry_sweep(&self) -> Duration {
        Duration::from_millis(self.expiry_sweep_ms)
    }

    pub fn endgame_sweep(&self) -> Duration {
        Duration::from_millis(self.endgame_sweep_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn rediscover_interval(&self) -> Duration {
        Duration::from_secs(self.rediscover_interval_secs)
    }

    pub fn tracker_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tracker_connect_timeout_ms)
    }

    pub fn tracker_aggregation(&self) -> Duration {
        Duration::from_millis(self.tracker_aggregation_ms)
    }

    /// Reject values that would stall or spin the session
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 11] = [
            ("listen_port", self.listen_port == 0),
            ("max_connections", self.max_connections == 0),
            ("peer_connect_timeout_secs", self.peer_connect_timeout_secs == 0),
            ("request_timeout_ms", self.request_timeout_ms == 0),
            ("expiry_sweep_ms", self.expiry_sweep_ms == 0),
            ("endgame_sweep_ms", self.endgame_sweep_ms == 0),
            ("stats_interval_ms", self.stats_interval_ms == 0),
            ("rediscover_interval_secs", self.rediscover_interval_secs == 0),
            ("tracker_connect_timeout_ms", self.tracker_connect_timeout_ms == 0),
            ("tracker_aggregation_ms", self.tracker_aggregation_ms == 0),
            ("queue_capacity", self.queue_capacity == 0),
        ];

        if let Some((field, _)) = checks.iter().find(|(_, invalid)| *invalid) {
            return Err(TorrentError::config_error_with_field("Value must be non-zero", *field).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.listen_port, 6881);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.expiry_sweep(), Duration::from_secs(2));
        assert_eq!(config.endgame_sweep(), Duration::from_secs(2));
        assert_eq!(config.tracker_connect_timeout(), Duration::from_secs(2));
        assert_eq!(config.queue_capacity, 10_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SessionConfig::from_json_str(r#"{"max_connections": 8, "request_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert_eq!(config.listen_port, 6881);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = SessionConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::ConfigError { .. })));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = SessionConfig { queue_capacity: 0, ..SessionConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, r#"{"listen_port": 7000}"#).unwrap();
        assert_eq!(SessionConfig::from_json_file(&path).unwrap().listen_port, 7000);
        assert!(SessionConfig::from_json_file(&dir.path().join("missing.json")).is_err());
    }
}

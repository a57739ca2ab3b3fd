//! BitChat Network - Configuration
//!
//! Every interval and timeout used by the network layer. Stored as JSON;
//! missing fields fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default local discovery UDP port
pub const DEFAULT_DISCOVERY_PORT: u16 = 41733;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for local peer discovery
    pub discovery_port: u16,
    /// Interval between the initial announcement retries
    pub announce_retry_interval_ms: u64,
    /// Number of quick announcements after starting to announce
    pub announce_retry_count: u32,
    /// Steady-state re-announcement interval
    pub reannounce_interval_secs: u64,
    /// How often local interfaces are checked for changes
    pub interface_watch_interval_secs: u64,

    /// Tracker URIs polled for every network
    pub trackers: Vec<String>,
    /// Retry window after a tracker failure
    pub tracker_retry_interval_secs: u64,
    /// Failures tolerated before falling back to the long window
    pub tracker_retry_count: u32,
    /// Poll window for a tracker that keeps failing
    pub tracker_failed_interval_secs: u64,
    /// Poll interval when a tracker does not advertise one
    pub tracker_default_interval_secs: u64,
    /// Timeout of a single tracker request
    pub tracker_timeout_secs: u64,
    /// DHT announce / lookup interval
    pub dht_interval_secs: u64,
    /// Search the DHT without announcing ourselves
    pub dht_lookup_only: bool,

    /// Relay nodes tried before DHT-discovered ones
    pub relay_seeds: Vec<SocketAddr>,
    /// Concurrent relay connections kept by the relay client
    pub relay_max_connections: usize,
    /// Bound on a relay request/response exchange
    pub relay_request_timeout_secs: u64,
    /// Relay keep-alive interval
    pub relay_keepalive_interval_secs: u64,

    /// Bound on dialing and authenticating a peer
    pub connect_timeout_secs: u64,
    /// Session read timeout
    pub read_timeout_secs: u64,
    /// Session keep-alive interval (must stay well below the read timeout)
    pub keepalive_interval_secs: u64,
    /// Sub-stream write timeout while waiting for the writer
    pub stream_write_timeout_secs: u64,
    /// Renegotiate the secure channel after this many bytes written
    pub rekey_after_bytes: u64,
    /// Renegotiate the secure channel after this long
    pub rekey_after_secs: u64,

    /// Coalescing window for reconciliation triggers
    pub reconcile_debounce_ms: u64,
    /// Re-check interval while the network is partially connected
    pub partial_recheck_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            announce_retry_interval_ms: 2_000,
            announce_retry_count: 3,
            reannounce_interval_secs: 30,
            interface_watch_interval_secs: 10,
            trackers: Vec::new(),
            tracker_retry_interval_secs: 10,
            tracker_retry_count: 3,
            tracker_failed_interval_secs: 300,
            tracker_default_interval_secs: 1_800,
            tracker_timeout_secs: 15,
            dht_interval_secs: 300,
            dht_lookup_only: false,
            relay_seeds: Vec::new(),
            relay_max_connections: 3,
            relay_request_timeout_secs: 10,
            relay_keepalive_interval_secs: 30,
            connect_timeout_secs: 10,
            read_timeout_secs: 60,
            keepalive_interval_secs: 15,
            stream_write_timeout_secs: 30,
            rekey_after_bytes: 1 << 30,
            rekey_after_secs: 3_600,
            reconcile_debounce_ms: 1_000,
            partial_recheck_interval_secs: 10,
        }
    }
}

impl NetworkConfig {
    /// Default location: `<config dir>/bitchat-net/network.json`
    pub fn default_path() -> Option<PathBuf> {
        let base = dirs::config_dir()?;
        Some(base.join("bitchat-net").join("network.json"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> ConfigResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        match fs::read_to_string(path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn announce_retry_interval(&self) -> Duration {
        Duration::from_millis(self.announce_retry_interval_ms)
    }

    pub fn reannounce_interval(&self) -> Duration {
        Duration::from_secs(self.reannounce_interval_secs)
    }

    pub fn interface_watch_interval(&self) -> Duration {
        Duration::from_secs(self.interface_watch_interval_secs)
    }

    pub fn tracker_retry_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_retry_interval_secs)
    }

    pub fn tracker_failed_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_failed_interval_secs)
    }

    pub fn tracker_default_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_default_interval_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }

    pub fn dht_interval(&self) -> Duration {
        Duration::from_secs(self.dht_interval_secs)
    }

    pub fn relay_request_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_request_timeout_secs)
    }

    pub fn relay_keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.relay_keepalive_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn stream_write_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_write_timeout_secs)
    }

    pub fn rekey_after(&self) -> Duration {
        Duration::from_secs(self.rekey_after_secs)
    }

    pub fn reconcile_debounce(&self) -> Duration {
        Duration::from_millis(self.reconcile_debounce_ms)
    }

    pub fn partial_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.partial_recheck_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NetworkConfig =
            serde_json::from_str(r#"{ "discovery_port": 5000, "trackers": ["udp://t.example:80"] }"#)
                .unwrap();
        assert_eq!(config.discovery_port, 5000);
        assert_eq!(config.trackers.len(), 1);
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
        assert_eq!(config.reconcile_debounce(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_is_default() {
        let path = std::env::temp_dir().join("bitchat-net-missing").join("none.json");
        let config = NetworkConfig::load_from(&path).unwrap();
        assert_eq!(config, NetworkConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("bitchat-net-cfg-{}", std::process::id()));
        let path = dir.join("network.json");
        let mut config = NetworkConfig::default();
        config.relay_max_connections = 5;
        config.save_to(&path).unwrap();

        let loaded = NetworkConfig::load_from(&path).unwrap();
        assert_eq!(loaded.relay_max_connections, 5);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn test_invalid_json() {
        let dir = std::env::temp_dir().join(format!("bitchat-net-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("network.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(NetworkConfig::load_from(&path), Err(ConfigError::Parse(_))));
        let _ = fs::remove_dir_all(dir);
    }
}

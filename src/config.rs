//! TimeFleet Configuration
//!
//! This module provides configuration structures for the time server
//! fleet and its proxy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::PeerAddress;

/// Main TimeFleet configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeFleetConfig {
    /// Peer set and election tunables
    pub cluster: ClusterConfig,

    /// Proxy configuration (nodes announce to it when present)
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,

    /// Coordinator marker location
    #[serde(default)]
    pub marker: MarkerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster configuration, shared by every peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// All peer node addresses, including this node's own
    pub peers: Vec<PeerAddress>,

    /// Interval between coordinator health checks in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// How long to wait for a HEALTH_RESPONSE in milliseconds
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    /// Consecutive failed checks before re-election
    #[serde(default = "default_max_failed_checks")]
    pub max_failed_checks: u32,

    /// How long a candidate waits for OK before claiming coordinator
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Minimum delay before answering an ELECTION with our own election
    #[serde(default = "default_election_backoff_min_ms")]
    pub election_backoff_min_ms: u64,

    /// Maximum delay before answering an ELECTION with our own election
    #[serde(default = "default_election_backoff_max_ms")]
    pub election_backoff_max_ms: u64,

    /// How long a defeated candidate waits for COORDINATOR before retrying
    #[serde(default = "default_coordinator_wait_ms")]
    pub coordinator_wait_ms: u64,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Public address clients send TIME_REQUEST to
    pub bind_address: PeerAddress,

    /// How long to wait for the coordinator's reply in milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

/// Coordinator marker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Marker file on storage shared by the nodes and the proxy
    #[serde(default = "default_marker_path")]
    pub path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_health_check_interval_ms() -> u64 {
    5000
}

fn default_health_check_timeout_ms() -> u64 {
    1000
}

fn default_max_failed_checks() -> u32 {
    3
}

fn default_election_timeout_ms() -> u64 {
    2000
}

fn default_election_backoff_min_ms() -> u64 {
    500
}

fn default_election_backoff_max_ms() -> u64 {
    1000
}

fn default_coordinator_wait_ms() -> u64 {
    5000
}

fn default_forward_timeout_ms() -> u64 {
    3000
}

fn default_marker_path() -> PathBuf {
    PathBuf::from("coordinator.txt")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            path: default_marker_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ClusterConfig {
    /// Cluster with default tunables
    pub fn with_peers(peers: Vec<PeerAddress>) -> Self {
        Self {
            peers,
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            max_failed_checks: default_max_failed_checks(),
            election_timeout_ms: default_election_timeout_ms(),
            election_backoff_min_ms: default_election_backoff_min_ms(),
            election_backoff_max_ms: default_election_backoff_max_ms(),
            coordinator_wait_ms: default_coordinator_wait_ms(),
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn coordinator_wait(&self) -> Duration {
        Duration::from_millis(self.coordinator_wait_ms)
    }

    /// Whether `address` is one of the configured peers
    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.peers.contains(address)
    }

    /// Validate the cluster section
    pub fn validate(&self) -> crate::Result<()> {
        if self.peers.is_empty() {
            return Err(crate::Error::Config("cluster.peers cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !seen.insert(peer) {
                return Err(crate::Error::Config(format!(
                    "cluster.peers lists {} more than once",
                    peer
                )));
            }
        }

        if self.health_check_interval_ms == 0 || self.health_check_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "health check interval and timeout must be greater than zero".into(),
            ));
        }

        if self.max_failed_checks == 0 {
            return Err(crate::Error::Config(
                "cluster.max_failed_checks must be at least 1".into(),
            ));
        }

        if self.election_timeout_ms == 0 || self.coordinator_wait_ms == 0 {
            return Err(crate::Error::Config(
                "election and coordinator wait timeouts must be greater than zero".into(),
            ));
        }

        if self.election_backoff_min_ms > self.election_backoff_max_ms {
            return Err(crate::Error::Config(
                "cluster.election_backoff_min_ms cannot exceed election_backoff_max_ms".into(),
            ));
        }

        Ok(())
    }
}

impl ProxyConfig {
    /// Proxy on `bind_address` with the default forwarding timeout
    pub fn new(bind_address: PeerAddress) -> Self {
        Self {
            bind_address,
            forward_timeout_ms: default_forward_timeout_ms(),
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}

impl TimeFleetConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: TimeFleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.cluster.validate()?;

        if let Some(proxy) = &self.proxy {
            if self.cluster.contains(&proxy.bind_address) {
                return Err(crate::Error::Config(format!(
                    "proxy.bind_address {} collides with a peer",
                    proxy.bind_address
                )));
            }
            if proxy.forward_timeout_ms == 0 {
                return Err(crate::Error::Config(
                    "proxy.forward_timeout_ms must be greater than zero".into(),
                ));
            }
        }

        if self.marker.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("marker.path cannot be empty".into()));
        }

        Ok(())
    }

    /// Address the nodes announce new coordinators to
    pub fn proxy_address(&self) -> Option<PeerAddress> {
        self.proxy.as_ref().map(|p| p.bind_address)
    }
}

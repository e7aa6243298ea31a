//! Node configuration
//!
//! Loaded from JSON. Every field has a default so a minimal file only needs
//! the node id and its networks.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::abstraction::{Address, TransportKind};

/// Framed datagram ceiling for unicast/multicast sends
pub const DEFAULT_MAX_DATAGRAM: usize = 1024;
/// Capacity of the FIFO behind virtual and local connections
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
/// Longest accepted header line, terminator excluded
pub const DEFAULT_MAX_HEADER_LINE: usize = 1024;
/// Buffer size of the connection-to-stream adapter
pub const DEFAULT_STREAM_BUFFER: usize = 4096;
/// Default bound on concurrently running dispatch tasks
pub const DEFAULT_DISPATCH_CONCURRENCY: usize = 64;

/// Size limits applied across the stack
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_datagram: usize,
    pub queue_capacity: usize,
    pub max_header_line: usize,
    pub stream_buffer: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_datagram: DEFAULT_MAX_DATAGRAM,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_header_line: DEFAULT_MAX_HEADER_LINE,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

/// Protocol timers, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolTimings {
    /// DISCOVER_MAIN wait before escalating to ELECTION
    pub discover_timeout_ms: u64,
    /// How long credentials are collected during ELECTION
    pub election_window_ms: u64,
    /// Leader I_AM_HERE period
    pub heartbeat_period_ms: u64,
    /// Leader silence after which followers rediscover
    pub leader_timeout_ms: u64,
    /// Period of the idle physical-link sweep
    pub idle_sweep_period_ms: u64,
    /// Idle time after which a cached physical link is evicted
    pub idle_threshold_ms: u64,
    /// Silence after which a neighbor is dropped from the table
    pub neighbor_timeout_ms: u64,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            discover_timeout_ms: 3_000,
            election_window_ms: 2_000,
            heartbeat_period_ms: 10_000,
            leader_timeout_ms: 35_000,
            idle_sweep_period_ms: 60_000,
            idle_threshold_ms: 120_000,
            neighbor_timeout_ms: 300_000,
        }
    }
}

impl ProtocolTimings {
    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }

    pub fn election_window(&self) -> Duration {
        Duration::from_millis(self.election_window_ms)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    pub fn idle_sweep_period(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_period_ms)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    pub fn neighbor_timeout(&self) -> Duration {
        Duration::from_millis(self.neighbor_timeout_ms)
    }
}

/// How caches are shared between networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheSharing {
    /// Every leader serves its network from the replicated cache
    #[default]
    Shared,
    /// Leader-to-leader GET propagation. Not supported.
    Hierarchical,
}

/// One configured transport network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Generic network name ("ethernet", "wifi", "bluetooth")
    pub name: String,
    pub kind: TransportKind,
    /// Local unicast/stream endpoint
    pub local: Address,
    /// Multicast group (Internet only)
    #[serde(default)]
    pub multicast: Option<Address>,
    /// Well-known service name used to find peers on stream-only transports
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "msd".to_string()
}

/// Top-level node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Start as the leader of every network instead of discovering one
    pub is_leader: bool,
    /// Election rank; higher wins
    pub credential: u64,
    pub networks: Vec<NetworkConfig>,
    pub timings: ProtocolTimings,
    pub limits: Limits,
    pub dispatch_concurrency: usize,
    pub cache_sharing: CacheSharing,
    /// Hex-encoded 32-byte payload keys per network name
    pub network_keys: HashMap<String, String>,
    /// Request payload encryption on cache-update traffic
    pub encrypt_updates: bool,
    /// Stamp and validate payload hashes
    pub hash_payloads: bool,
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            is_leader: false,
            credential: 0,
            networks: Vec::new(),
            timings: ProtocolTimings::default(),
            limits: Limits::default(),
            dispatch_concurrency: DEFAULT_DISPATCH_CONCURRENCY,
            cache_sharing: CacheSharing::Shared,
            network_keys: HashMap::new(),
            encrypt_updates: false,
            hash_payloads: true,
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.networks.push(network);
        self
    }

    pub fn as_leader(mut self) -> Self {
        self.is_leader = true;
        self
    }

    /// Parse a JSON document
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig =
            serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node_id must not be empty".into()));
        }
        if self.node_id == "0" {
            return Err(ConfigError::Invalid("node_id \"0\" is reserved".into()));
        }
        if self.cache_sharing == CacheSharing::Hierarchical {
            return Err(ConfigError::Invalid(
                "hierarchical cache sharing is not supported".into(),
            ));
        }
        if self.limits.max_datagram == 0
            || self.limits.queue_capacity == 0
            || self.limits.max_header_line == 0
            || self.limits.stream_buffer == 0
        {
            return Err(ConfigError::Invalid("limits must be non-zero".into()));
        }
        if self.timings.neighbor_timeout_ms <= self.timings.leader_timeout_ms {
            return Err(ConfigError::Invalid(
                "neighbor_timeout_ms must exceed leader_timeout_ms".into(),
            ));
        }
        if self.dispatch_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch_concurrency must be non-zero".into(),
            ));
        }

        let mut names = HashSet::new();
        for network in &self.networks {
            if !names.insert(network.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate network name: {}",
                    network.name
                )));
            }
            if network.kind == TransportKind::Internet && network.multicast.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "internet network {} needs a multicast address",
                    network.name
                )));
            }
        }

        for (network, key) in &self.network_keys {
            let bytes = hex::decode(key).map_err(|e| {
                ConfigError::Invalid(format!("key for {} is not hex: {}", network, e))
            })?;
            if bytes.len() != 32 {
                return Err(ConfigError::Invalid(format!(
                    "key for {} must be 32 bytes",
                    network
                )));
            }
        }
        Ok(())
    }
}

//! Bitarchive Configuration
//!
//! This module provides configuration structures for the monitor and replica
//! processes of the archive.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::state::{Replica, ReplicaType};

/// Main bitarchive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// The static set of replicas known to the archive
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,

    /// Monitor configuration (batch coordination and reconciliation)
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Replica server configuration (local storage)
    #[serde(default)]
    pub replica: ReplicaServerConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which process this node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Batch coordinator and reconciliation engine
    Monitor,
    /// Replica server holding files
    Replica,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (a replica id for replica nodes)
    pub id: String,

    /// Role of this node
    pub role: NodeRole,

    /// Address to bind for message transport
    pub bind_address: String,

    /// Data directory for state storage and temporary files
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// A statically configured replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica identifier
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Type of replica
    #[serde(default = "default_replica_type")]
    pub replica_type: ReplicaType,

    /// Transport address of the replica server (if remote)
    #[serde(default)]
    pub address: Option<String>,
}

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Transport address of the monitor (used by replica nodes)
    #[serde(default)]
    pub address: Option<String>,

    /// Default batch job timeout in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Timeout for single-file checksum queries in milliseconds
    #[serde(default = "default_single_checksum_timeout_ms")]
    pub single_checksum_timeout_ms: u64,

    /// Acceptable delay between signs of life before a replica is not awaited
    #[serde(default = "default_acceptable_heartbeat_delay_ms")]
    pub acceptable_heartbeat_delay_ms: u64,

    /// How long one correction step waits for the replica's reply
    #[serde(default = "default_correction_timeout_ms")]
    pub correction_timeout_ms: u64,

    /// How long fetching a good copy from a replica may take
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

/// Replica server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaServerConfig {
    /// Storage roots; each holds filedir, tempdir and atticdir
    #[serde(default)]
    pub storage_roots: Vec<PathBuf>,

    /// Minimum free bytes required to keep accepting uploads
    #[serde(default = "default_min_space_left")]
    pub min_space_left: u64,

    /// Heartbeat frequency in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Secret required for remove-and-get requests
    #[serde(default)]
    pub credentials: String,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
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
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/bitarchive")
}

fn default_replica_type() -> ReplicaType {
    ReplicaType::Bitarchive
}

fn default_batch_timeout_ms() -> u64 {
    14 * 24 * 60 * 60 * 1000
}

fn default_single_checksum_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_acceptable_heartbeat_delay_ms() -> u64 {
    60_000
}

fn default_correction_timeout_ms() -> u64 {
    60 * 60 * 1000
}

fn default_fetch_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_min_space_left() -> u64 {
    // 100 MB
    100 * 1024 * 1024
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            address: None,
            batch_timeout_ms: default_batch_timeout_ms(),
            single_checksum_timeout_ms: default_single_checksum_timeout_ms(),
            acceptable_heartbeat_delay_ms: default_acceptable_heartbeat_delay_ms(),
            correction_timeout_ms: default_correction_timeout_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl Default for ReplicaServerConfig {
    fn default() -> Self {
        Self {
            storage_roots: Vec::new(),
            min_space_left: default_min_space_left(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            credentials: String::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
            cors_enabled: false,
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

impl ArchiveConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ArchiveConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration back to TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.replicas.is_empty() {
            return Err(crate::Error::Config("at least one [[replicas]] entry is required".into()));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.id.is_empty() {
                return Err(crate::Error::Config("replica id cannot be empty".into()));
            }
            if !seen.insert(replica.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "replica id '{}' is configured twice",
                    replica.id
                )));
            }
        }

        if self.monitor.batch_timeout_ms == 0 {
            return Err(crate::Error::Config("monitor.batch_timeout_ms must be positive".into()));
        }
        if self.monitor.correction_timeout_ms == 0 || self.monitor.fetch_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "monitor.correction_timeout_ms and monitor.fetch_timeout_ms must be positive".into(),
            ));
        }

        if self.node.role == NodeRole::Replica {
            if !seen.contains(self.node.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "replica node '{}' is not listed in [[replicas]]",
                    self.node.id
                )));
            }
            if self.replica.storage_roots.is_empty() {
                return Err(crate::Error::Config("replica.storage_roots cannot be empty".into()));
            }
            if self.replica.min_space_left == 0 {
                return Err(crate::Error::Config("replica.min_space_left must be positive".into()));
            }
            if self.replica.credentials.is_empty() {
                return Err(crate::Error::Config("replica.credentials cannot be empty".into()));
            }
        }

        Ok(())
    }

    /// The static replica set
    pub fn known_replicas(&self) -> Vec<Replica> {
        self.replicas
            .iter()
            .map(|r| Replica::new(r.id.clone(), r.name.clone(), r.replica_type))
            .collect()
    }

    /// Look up the configuration of one replica
    pub fn replica(&self, id: &str) -> Option<&ReplicaConfig> {
        self.replicas.iter().find(|r| r.id == id)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the state directory path
    pub fn state_dir(&self) -> PathBuf {
        self.node.data_dir.join("state")
    }

    /// Get the temporary directory used for batch output
    pub fn temp_dir(&self) -> PathBuf {
        self.node.data_dir.join("tmp")
    }

    /// Default batch timeout as Duration
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.batch_timeout_ms)
    }

    /// Single checksum query timeout as Duration
    pub fn single_checksum_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.single_checksum_timeout_ms)
    }

    /// Deadline of one correction step as Duration
    pub fn correction_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.correction_timeout_ms)
    }

    /// Good-copy fetch timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.fetch_timeout_ms)
    }

    /// Acceptable heartbeat delay as Duration
    pub fn acceptable_heartbeat_delay(&self) -> Duration {
        Duration::from_millis(self.monitor.acceptable_heartbeat_delay_ms)
    }

    /// Heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.replica.heartbeat_interval_ms)
    }
}

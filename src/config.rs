//! HerdLead Configuration
//!
//! This module provides configuration structures for a HerdLead node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main HerdLead configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HerdConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordination store layout and retry policy
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Replication fan-out configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Prefix of the generated node id (`<prefix>-<uuid>`)
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,

    /// Address to bind the replication listener to
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Coordination store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Namespace of registration records (every node ever seen)
    #[serde(default = "default_all_nodes_path")]
    pub all_nodes_path: String,

    /// Namespace of liveness records
    #[serde(default = "default_live_nodes_path")]
    pub live_nodes_path: String,

    /// Namespace of election tickets
    #[serde(default = "default_election_path")]
    pub election_path: String,

    /// Name prefix of election tickets
    #[serde(default = "default_ticket_prefix")]
    pub ticket_prefix: String,

    /// First retry delay after a store failure
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,

    /// Upper bound of the retry delay
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Connect timeout for a replication send
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound of a single replication send, including the acknowledgment
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
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

    /// Log format (full, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_id_prefix() -> String {
    "node".to_string()
}

fn default_all_nodes_path() -> String {
    "/all_nodes".to_string()
}

fn default_live_nodes_path() -> String {
    "/live_nodes".to_string()
}

fn default_election_path() -> String {
    "/election".to_string()
}

fn default_ticket_prefix() -> String {
    "leader-".to_string()
}

fn default_retry_initial_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_send_timeout_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "full".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id_prefix: default_id_prefix(),
            bind_address: "0.0.0.0:7654".to_string(),
            advertise_address: None,
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            all_nodes_path: default_all_nodes_path(),
            live_nodes_path: default_live_nodes_path(),
            election_path: default_election_path(),
            ticket_prefix: default_ticket_prefix(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
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

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            coordination: CoordinationConfig::default(),
            replication: ReplicationConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// First retry delay as Duration
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    /// Maximum retry delay as Duration
    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl ReplicationConfig {
    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get send timeout as Duration
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl HerdConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: HerdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id_prefix.is_empty() || self.node.id_prefix.contains('/') {
            return Err(crate::Error::Config(
                "node.id_prefix must be non-empty and contain no '/'".into(),
            ));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        let c = &self.coordination;
        let namespaces = [&c.all_nodes_path, &c.live_nodes_path, &c.election_path];
        for path in namespaces {
            if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
                return Err(crate::Error::Config(format!(
                    "coordination namespace '{}' must be an absolute path like /name",
                    path
                )));
            }
        }
        if c.all_nodes_path == c.live_nodes_path
            || c.all_nodes_path == c.election_path
            || c.live_nodes_path == c.election_path
        {
            return Err(crate::Error::Config(
                "coordination namespaces must be distinct".into(),
            ));
        }

        if c.ticket_prefix.is_empty() || c.ticket_prefix.contains('/') {
            return Err(crate::Error::Config(
                "coordination.ticket_prefix must be non-empty and contain no '/'".into(),
            ));
        }

        if c.retry_initial_ms == 0 || c.retry_max_ms < c.retry_initial_ms {
            return Err(crate::Error::Config(
                "coordination.retry_max_ms must be >= retry_initial_ms > 0".into(),
            ));
        }

        if self.replication.send_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "replication.send_timeout_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }
}

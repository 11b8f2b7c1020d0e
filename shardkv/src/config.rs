use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// What a single-node call returns when its connection fails mid-call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Log the failure and return an absent result
    #[default]
    Quiet,
    /// Log the failure and return the transport error
    Strict,
}

/// Host and port of one server in the descriptor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

/// Topology descriptor as written by the operator
///
/// ```yaml
/// nodes:
///   node_1:       { host: 127.0.0.1, port: 6379 }
///   node_1_slave: { host: 127.0.0.1, port: 6380 }
///   node_2:       { host: 127.0.0.1, port: 6381 }
/// master_of:
///   node_1: node_1_slave
///   node_2: ~
/// default_node: node_1
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeAddress>,
    /// Master alias -> slave alias (`~` for a shard without a slave)
    #[serde(default)]
    pub master_of: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub default_node: String,
}

/// Client behaviour knobs
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Logical database selected on every connection
    pub database: i64,
    /// Runtime transport failure handling
    pub failure_policy: FailurePolicy,
    /// Attempts per endpoint during bring-up (2 = one retry)
    pub connect_attempts: u32,
    /// Timeout for opening one connection (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database: 0,
            failure_policy: FailurePolicy::Quiet,
            connect_attempts: 2,
            connect_timeout_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database selected at startup
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }

    /// Set the runtime failure policy
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Set the bring-up attempts per endpoint (at least one)
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    /// Set the connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Complete descriptor file: topology plus an optional `client:` section
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    #[serde(flatten)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl ClusterConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const DESCRIPTOR: &str = r#"
nodes:
  node_1: { host: 127.0.0.1, port: 6379 }
  node_1_slave: { host: 127.0.0.1, port: 6380 }
  node_2: { host: 127.0.0.1, port: 6381 }
master_of:
  node_1: node_1_slave
  node_2: ~
default_node: node_1
client:
  database: 3
  failure_policy: strict
"#;

    #[test]
    fn test_parse_descriptor() {
        let config = ClusterConfig::from_yaml_str(DESCRIPTOR).unwrap();
        assert_eq!(config.topology.nodes.len(), 3);
        assert_eq!(
            config.topology.master_of.get("node_1"),
            Some(&Some("node_1_slave".to_string()))
        );
        assert_eq!(config.topology.master_of.get("node_2"), Some(&None));
        assert_eq!(config.topology.default_node, "node_1");
        assert_eq!(config.client.database, 3);
        assert_eq!(config.client.failure_policy, FailurePolicy::Strict);
        // untouched fields keep their defaults
        assert_eq!(config.client.connect_attempts, 2);
    }

    #[test]
    fn test_client_section_is_optional() {
        let config = ClusterConfig::from_yaml_str(
            "nodes:\n  node_1: { host: h, port: 1 }\nmaster_of:\n  node_1: ~\ndefault_node: node_1\n",
        )
        .unwrap();
        assert_eq!(config.client.database, 0);
        assert_eq!(config.client.failure_policy, FailurePolicy::Quiet);
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(ClusterConfig::from_yaml_str("nodes: [1, 2").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DESCRIPTOR.as_bytes()).unwrap();
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.topology.nodes["node_2"].port, 6381);

        assert!(ClusterConfig::from_file("/nonexistent/cluster.yaml").is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new()
            .with_database(2)
            .with_failure_policy(FailurePolicy::Strict)
            .with_connect_attempts(0)
            .with_connect_timeout(Duration::from_secs(1));
        assert_eq!(config.database, 2);
        assert_eq!(config.failure_policy, FailurePolicy::Strict);
        assert_eq!(config.connect_attempts, 1);
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
    }
}

//! Cluster Topology
//!
//! Validated, immutable view of the descriptor: which alias is the master of
//! which shard, which slave reads are served from, and where commands
//! without a key go.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::config::TopologyConfig;
use crate::error::{ClusterError, Result};
use crate::router::{extract_tag, master_alias, shard_index_of};

/// Role a node plays in its shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Slave,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Slave => f.write_str("slave"),
        }
    }
}

/// One server endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
}

impl Node {
    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same physical server as `other`
    pub fn same_endpoint(&self, other: &Node) -> bool {
        self.host == other.host && self.port == other.port
    }
}

/// Validated cluster topology
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: BTreeMap<String, Node>,
    /// Indexed by shard - 1
    shards: Vec<Shard>,
    /// Slave alias -> master alias
    slave_to_master: HashMap<String, String>,
    default_node: String,
}

#[derive(Debug, Clone)]
struct Shard {
    master: String,
    slave: Option<String>,
}

impl Topology {
    /// Validate a descriptor
    ///
    /// Master aliases must be exactly `node_1..node_N`, every alias named in
    /// the pairing must exist, every node must be either a master or the
    /// slave of exactly one master, and the default node must exist.
    pub fn from_config(config: &TopologyConfig) -> Result<Self> {
        if config.nodes.is_empty() || config.master_of.is_empty() {
            return Err(ClusterError::Config(
                "descriptor needs both `nodes` and `master_of`".to_string(),
            ));
        }

        let shard_count = config.master_of.len();
        let mut shards = Vec::with_capacity(shard_count);
        let mut slave_to_master = HashMap::new();
        let mut roles = HashMap::new();

        for shard in 1..=shard_count {
            let master = master_alias(shard);
            let slave = config.master_of.get(&master).ok_or_else(|| {
                ClusterError::Config(format!(
                    "master_of has {} entries but no `{}`",
                    shard_count, master
                ))
            })?;
            if !config.nodes.contains_key(&master) {
                return Err(ClusterError::Config(format!(
                    "master `{}` has no entry in nodes",
                    master
                )));
            }
            roles.insert(master.clone(), NodeRole::Master);

            if let Some(slave) = slave {
                if !config.nodes.contains_key(slave) {
                    return Err(ClusterError::Config(format!(
                        "slave `{}` of `{}` has no entry in nodes",
                        slave, master
                    )));
                }
                if config.master_of.contains_key(slave) {
                    return Err(ClusterError::Config(format!(
                        "`{}` is listed both as a master and as a slave",
                        slave
                    )));
                }
                if slave_to_master
                    .insert(slave.clone(), master.clone())
                    .is_some()
                {
                    return Err(ClusterError::Config(format!(
                        "slave `{}` is paired with more than one master",
                        slave
                    )));
                }
                roles.insert(slave.clone(), NodeRole::Slave);
            }

            shards.push(Shard {
                master,
                slave: slave.clone(),
            });
        }

        let mut nodes = BTreeMap::new();
        for (alias, address) in &config.nodes {
            let role = *roles.get(alias).ok_or_else(|| {
                ClusterError::Config(format!(
                    "node `{}` is neither a shard master nor a slave",
                    alias
                ))
            })?;
            if address.host.is_empty() || address.port == 0 {
                return Err(ClusterError::Config(format!(
                    "node `{}` has an invalid address {}:{}",
                    alias, address.host, address.port
                )));
            }
            nodes.insert(
                alias.clone(),
                Node {
                    alias: alias.clone(),
                    host: address.host.clone(),
                    port: address.port,
                    role,
                },
            );
        }

        if !nodes.contains_key(&config.default_node) {
            return Err(ClusterError::Config(format!(
                "default node `{}` has no entry in nodes",
                config.default_node
            )));
        }

        Ok(Self {
            nodes,
            shards,
            slave_to_master,
            default_node: config.default_node.clone(),
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn node(&self, alias: &str) -> Option<&Node> {
        self.nodes.get(alias)
    }

    /// All nodes ordered by alias
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn default_alias(&self) -> &str {
        &self.default_node
    }

    pub fn is_master(&self, alias: &str) -> bool {
        self.nodes
            .get(alias)
            .is_some_and(|n| n.role == NodeRole::Master)
    }

    /// Master alias for a slave alias
    pub fn master_of_slave(&self, slave: &str) -> Option<&str> {
        self.slave_to_master.get(slave).map(String::as_str)
    }

    /// Alias that serves writes for a shard (1-based)
    pub fn write_alias(&self, shard: usize) -> &str {
        &self.shards[shard - 1].master
    }

    /// Alias that serves reads for a shard: its slave, or the master when
    /// the shard has none
    pub fn read_alias(&self, shard: usize) -> &str {
        let shard = &self.shards[shard - 1];
        shard.slave.as_deref().unwrap_or(&shard.master)
    }

    /// Shard owning a key, honouring a colocation tag
    pub fn shard_for_key(&self, key: &str) -> usize {
        let hash_key = extract_tag(key).map_or(key, |t| t.hash_key);
        shard_index_of(hash_key, self.shard_count())
    }

    /// Master node owning a key
    pub fn node_for_key(&self, key: &str) -> &Node {
        let alias = self.write_alias(self.shard_for_key(key));
        &self.nodes[alias]
    }
}

//! Shared fixture: an in-process cluster of memory servers
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use shardkv::{
    ClientConfig, ClusterClient, MemoryConnector, MemoryServer, NodeAddress, TopologyConfig,
    shard_index_of,
};

pub const MASTER_PORT: u16 = 6379;
pub const SLAVE_PORT: u16 = 6380;

pub fn host(shard: usize) -> String {
    format!("10.0.0.{}", shard)
}

pub fn address(host: &str, port: u16) -> NodeAddress {
    NodeAddress {
        host: host.to_string(),
        port,
    }
}

pub struct Cluster {
    /// Indexed by shard - 1
    pub masters: Vec<Arc<MemoryServer>>,
    /// Separate slave servers; empty when slaves share their master's endpoint
    pub slaves: Vec<Arc<MemoryServer>>,
    pub connector: Arc<MemoryConnector>,
    pub topology: TopologyConfig,
}

impl Cluster {
    /// Every shard has a master and a separate slave server
    ///
    /// The memory servers do not replicate, so a value written through the
    /// client is only visible on the master.
    pub fn with_slaves(shards: usize) -> Self {
        let mut cluster = Self::empty();
        for shard in 1..=shards {
            let master = MemoryServer::master();
            let slave = MemoryServer::slave();
            cluster.add_node(&format!("node_{}", shard), MASTER_PORT, shard, &master);
            cluster.add_node(&format!("node_{}_slave", shard), SLAVE_PORT, shard, &slave);
            cluster.topology.master_of.insert(
                format!("node_{}", shard),
                Some(format!("node_{}_slave", shard)),
            );
            cluster.masters.push(master);
            cluster.slaves.push(slave);
        }
        cluster
    }

    /// Every slave alias points at its master's endpoint, so reads see writes
    pub fn shared_endpoints(shards: usize) -> Self {
        let mut cluster = Self::empty();
        for shard in 1..=shards {
            let master = MemoryServer::master();
            let master_alias = format!("node_{}", shard);
            let slave_alias = format!("node_{}_slave", shard);
            cluster.add_node(&master_alias, MASTER_PORT, shard, &master);
            cluster
                .topology
                .nodes
                .insert(slave_alias.clone(), address(&host(shard), MASTER_PORT));
            cluster
                .topology
                .master_of
                .insert(master_alias, Some(slave_alias));
            cluster.masters.push(master);
        }
        cluster
    }

    fn empty() -> Self {
        Self {
            masters: Vec::new(),
            slaves: Vec::new(),
            connector: Arc::new(MemoryConnector::new()),
            topology: TopologyConfig {
                nodes: BTreeMap::new(),
                master_of: BTreeMap::new(),
                default_node: "node_1".to_string(),
            },
        }
    }

    fn add_node(&mut self, alias: &str, port: u16, shard: usize, server: &Arc<MemoryServer>) {
        let host = host(shard);
        self.topology
            .nodes
            .insert(alias.to_string(), address(&host, port));
        let connector = Arc::try_unwrap(std::mem::take(&mut self.connector))
            .unwrap_or_else(|_| panic!("nodes are added before any client connects"));
        self.connector = Arc::new(connector.with_server(&host, port, server.clone()));
    }

    pub fn shard_count(&self) -> usize {
        self.topology.master_of.len()
    }

    /// Master server of a 1-based shard
    pub fn master(&self, shard: usize) -> &Arc<MemoryServer> {
        &self.masters[shard - 1]
    }

    /// Separate slave server of a 1-based shard
    pub fn slave(&self, shard: usize) -> &Arc<MemoryServer> {
        &self.slaves[shard - 1]
    }

    /// Master server owning an untagged key
    pub fn owner(&self, key: &str) -> &Arc<MemoryServer> {
        self.master(shard_index_of(key, self.shard_count()))
    }

    pub async fn client(&self) -> ClusterClient {
        self.client_with(ClientConfig::default()).await
    }

    pub async fn client_with(&self, config: ClientConfig) -> ClusterClient {
        ClusterClient::with_connector(&self.topology, config, self.connector.clone())
            .await
            .unwrap()
    }

    pub fn clear_served(&self) {
        for server in self.masters.iter().chain(&self.slaves) {
            server.clear_served();
        }
    }
}

/// First key `<prefix><n>` that hashes to `shard`
pub fn key_on_shard(prefix: &str, shard: usize, shard_count: usize) -> String {
    (0..)
        .map(|n| format!("{}{}", prefix, n))
        .find(|key| shard_index_of(key, shard_count) == shard)
        .unwrap()
}

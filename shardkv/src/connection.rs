//! Connection Manager
//!
//! Brings up one connection per node alias at construction time and owns
//! them for the lifetime of the client. A slave that stays unreachable is
//! served by a connection to its master, registered under the slave's
//! alias, so read routing keeps working. There is no reconnection after
//! startup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ClusterError, NodeError, Result};
use crate::node::{NodeClient, NodeConnector, Reply};
use crate::topology::{Node, NodeRole, Topology};

/// Per-node bring-up state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpState {
    /// Opening the transport connection
    Connecting,
    /// Checking the replication role and selecting the database
    Verifying,
    /// Serving from its own endpoint
    Ready,
    /// Slave alias served by its master's endpoint
    FailedOverToMaster,
    /// Unrecoverable; startup aborts
    Fatal,
}

/// Live connection registered under one alias
pub struct NodeHandle {
    pub alias: String,
    /// Endpoint actually connected (the master's after a failover)
    pub endpoint: String,
    pub state: BringUpState,
    /// Server behind `endpoint`
    target: Node,
    conn: Mutex<Box<dyn NodeClient>>,
}

impl NodeHandle {
    fn new(alias: &str, target: &Node, state: BringUpState, conn: Box<dyn NodeClient>) -> Self {
        Self {
            alias: alias.to_string(),
            endpoint: target.endpoint(),
            state,
            target: target.clone(),
            conn: Mutex::new(conn),
        }
    }

    /// Exclusive use of the connection
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Box<dyn NodeClient>> {
        self.conn.lock().await
    }
}

enum Verify {
    NotASlave,
    Failed(NodeError),
}

/// Owns the connection set
pub struct ConnectionManager {
    handles: BTreeMap<String, NodeHandle>,
    database: AtomicI64,
    /// Kept for dedicated connections opened after bring-up
    connector: Arc<dyn NodeConnector>,
    connect_timeout: Duration,
}

impl ConnectionManager {
    /// Bring up every node of the topology
    ///
    /// Fails on the first node that cannot be brought up; the client never
    /// exists half-connected.
    pub async fn connect(
        topology: Arc<Topology>,
        connector: Arc<dyn NodeConnector>,
        config: &ClientConfig,
    ) -> Result<Self> {
        let mut handles = BTreeMap::new();
        for node in topology.nodes() {
            let handle = bring_up(&topology, node, connector.as_ref(), config).await?;
            handles.insert(node.alias.clone(), handle);
        }

        info!(
            "Connected to {} nodes ({} shards, database {})",
            handles.len(),
            topology.shard_count(),
            config.database
        );

        Ok(Self {
            handles,
            database: AtomicI64::new(config.database),
            connector,
            connect_timeout: config.connect_timeout(),
        })
    }

    pub fn handle(&self, alias: &str) -> Option<&NodeHandle> {
        self.handles.get(alias)
    }

    /// All handles ordered by alias
    pub fn handles(&self) -> impl Iterator<Item = &NodeHandle> {
        self.handles.values()
    }

    /// Final bring-up state per alias
    pub fn states(&self) -> BTreeMap<String, BringUpState> {
        self.handles
            .iter()
            .map(|(alias, h)| (alias.clone(), h.state))
            .collect()
    }

    /// Currently selected database
    pub fn database(&self) -> i64 {
        self.database.load(Ordering::SeqCst)
    }

    /// Open a connection outside the shared slot of `handle`, on the same
    /// server and database
    ///
    /// Used for blocking pops, which would otherwise hold the alias's
    /// connection for their whole duration.
    pub(crate) async fn dedicated(
        &self,
        handle: &NodeHandle,
    ) -> std::result::Result<Box<dyn NodeClient>, NodeError> {
        let mut conn = open(self.connector.as_ref(), &handle.target, self.connect_timeout).await?;
        conn.select(self.database()).await?;
        Ok(conn)
    }

    /// Select a database on every live connection and return each node's reply
    ///
    /// Any failure fails the whole call. Connections already switched are
    /// moved back to the previous database, so the cluster never serves
    /// from two databases at once.
    pub async fn select_namespace(&self, database: i64) -> Result<BTreeMap<String, Reply>> {
        let previous = self.database();
        let mut replies = BTreeMap::new();
        for handle in self.handles.values() {
            let mut conn = handle.lock().await;
            match conn.select(database).await {
                Ok(reply) => {
                    replies.insert(handle.alias.clone(), reply);
                }
                Err(e) => {
                    drop(conn);
                    error!(
                        alias = %handle.alias,
                        endpoint = %handle.endpoint,
                        "select {} failed: {}",
                        database,
                        e
                    );
                    self.restore(replies.keys(), previous).await;
                    return Err(ClusterError::Transport {
                        command: "select".to_string(),
                        alias: handle.alias.clone(),
                        endpoint: handle.endpoint.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        self.database.store(database, Ordering::SeqCst);
        info!("Selected database {} on all nodes", database);
        Ok(replies)
    }

    async fn restore(&self, aliases: impl Iterator<Item = &String>, database: i64) {
        for alias in aliases {
            let Some(handle) = self.handles.get(alias) else {
                continue;
            };
            if let Err(e) = handle.lock().await.select(database).await {
                error!(
                    alias = %handle.alias,
                    endpoint = %handle.endpoint,
                    "restoring database {} failed: {}",
                    database,
                    e
                );
            }
        }
    }
}

/// Drive one node through the bring-up state machine
async fn bring_up(
    topology: &Topology,
    node: &Node,
    connector: &dyn NodeConnector,
    config: &ClientConfig,
) -> Result<NodeHandle> {
    let max_attempts = config.connect_attempts.max(1);
    let master = topology
        .master_of_slave(&node.alias)
        .and_then(|alias| topology.node(alias));
    // a slave slot pointing at its master's endpoint is a deliberate
    // "no replica" setup and is not role-checked
    let expect_slave =
        node.role == NodeRole::Slave && !master.is_some_and(|m| m.same_endpoint(node));

    let mut target = node;
    let mut failed_over = false;
    let mut attempts = 0;
    let mut last_error = String::new();
    let mut conn: Option<Box<dyn NodeClient>> = None;
    let mut state = BringUpState::Connecting;

    let after_failure = |attempts: u32, failed_over: bool| {
        if attempts < max_attempts {
            BringUpState::Connecting
        } else if !failed_over && master.is_some() {
            BringUpState::FailedOverToMaster
        } else {
            BringUpState::Fatal
        }
    };

    loop {
        debug!(alias = %node.alias, endpoint = %target.endpoint(), ?state, "bring-up");
        state = match state {
            BringUpState::Connecting => {
                attempts += 1;
                match open(connector, target, config.connect_timeout()).await {
                    Ok(c) => {
                        conn = Some(c);
                        BringUpState::Verifying
                    }
                    Err(e) => {
                        warn!(
                            "Connection to {} ({}) failed, attempt {}/{}: {}",
                            target.endpoint(),
                            node.alias,
                            attempts,
                            max_attempts,
                            e
                        );
                        last_error = e.to_string();
                        after_failure(attempts, failed_over)
                    }
                }
            }
            BringUpState::Verifying => match conn.as_mut() {
                Some(c) => {
                    match verify(c.as_mut(), expect_slave && !failed_over, config.database).await
                    {
                        Ok(()) => BringUpState::Ready,
                        Err(Verify::NotASlave) => {
                            error!("Server {} is not a slave", target.endpoint());
                            return Err(ClusterError::NotASlave {
                                alias: node.alias.clone(),
                                endpoint: target.endpoint(),
                            });
                        }
                        Err(Verify::Failed(e)) => {
                            warn!(
                                "Verification of {} ({}) failed, attempt {}/{}: {}",
                                target.endpoint(),
                                node.alias,
                                attempts,
                                max_attempts,
                                e
                            );
                            conn = None;
                            last_error = e.to_string();
                            after_failure(attempts, failed_over)
                        }
                    }
                }
                None => BringUpState::Connecting,
            },
            BringUpState::FailedOverToMaster => match master {
                Some(m) => {
                    warn!(
                        "Slave {} ({}) unreachable, serving its reads from master {} ({})",
                        node.alias,
                        node.endpoint(),
                        m.alias,
                        m.endpoint()
                    );
                    target = m;
                    failed_over = true;
                    attempts = 0;
                    BringUpState::Connecting
                }
                None => BringUpState::Fatal,
            },
            BringUpState::Ready => {
                let Some(conn) = conn.take() else {
                    state = BringUpState::Connecting;
                    continue;
                };
                let final_state = if failed_over {
                    BringUpState::FailedOverToMaster
                } else {
                    BringUpState::Ready
                };
                debug!(alias = %node.alias, endpoint = %target.endpoint(), ?final_state, "node ready");
                return Ok(NodeHandle::new(&node.alias, target, final_state, conn));
            }
            BringUpState::Fatal => {
                error!("Cannot connect to {} ({})", target.endpoint(), node.alias);
                return Err(ClusterError::Startup {
                    alias: node.alias.clone(),
                    endpoint: target.endpoint(),
                    reason: last_error,
                });
            }
        };
    }
}

async fn open(
    connector: &dyn NodeConnector,
    target: &Node,
    timeout: Duration,
) -> std::result::Result<Box<dyn NodeClient>, NodeError> {
    match tokio::time::timeout(timeout, connector.connect(&target.host, target.port)).await {
        Ok(result) => result,
        Err(_) => Err(NodeError::Transport(format!(
            "connect timed out after {:?}",
            timeout
        ))),
    }
}

async fn verify(
    conn: &mut dyn NodeClient,
    expect_slave: bool,
    database: i64,
) -> std::result::Result<(), Verify> {
    let role = conn.role().await.map_err(Verify::Failed)?;
    if expect_slave && role != NodeRole::Slave {
        return Err(Verify::NotASlave);
    }
    conn.select(database).await.map_err(Verify::Failed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryConnector, MemoryServer};
    use crate::command::Command;
    use crate::config::ClusterConfig;
    use async_trait::async_trait;
    use std::time::Duration;

    const ONE_SHARD: &str = r#"
nodes:
  node_1: { host: h1, port: 6379 }
  node_1_slave: { host: h1, port: 6380 }
master_of:
  node_1: node_1_slave
default_node: node_1
"#;

    fn topology() -> Arc<Topology> {
        let config = ClusterConfig::from_yaml_str(ONE_SHARD).unwrap();
        Arc::new(Topology::from_config(&config.topology).unwrap())
    }

    struct Hanging;

    #[async_trait]
    impl NodeConnector for Hanging {
        async fn connect(
            &self,
            _host: &str,
            _port: u16,
        ) -> std::result::Result<Box<dyn NodeClient>, NodeError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connect_timeout_is_a_startup_failure() {
        let config = ClientConfig::new()
            .with_connect_attempts(1)
            .with_connect_timeout(Duration::from_millis(20));

        let err = match ConnectionManager::connect(topology(), Arc::new(Hanging), &config).await {
            Ok(_) => panic!("connected through a hanging connector"),
            Err(e) => e,
        };
        match err {
            ClusterError::Startup { alias, reason, .. } => {
                assert_eq!(alias, "node_1");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    /// Answers `select` with a status naming the database
    struct Echoing {
        role: NodeRole,
    }

    #[async_trait]
    impl NodeClient for Echoing {
        async fn call(&mut self, _cmd: &Command) -> std::result::Result<Reply, NodeError> {
            Ok(Reply::Nil)
        }

        async fn role(&mut self) -> std::result::Result<NodeRole, NodeError> {
            Ok(self.role)
        }

        async fn select(&mut self, database: i64) -> std::result::Result<Reply, NodeError> {
            Ok(Reply::Status(format!("OK {}", database)))
        }
    }

    struct EchoingConnector;

    #[async_trait]
    impl NodeConnector for EchoingConnector {
        async fn connect(
            &self,
            _host: &str,
            port: u16,
        ) -> std::result::Result<Box<dyn NodeClient>, NodeError> {
            let role = if port == 6380 {
                NodeRole::Slave
            } else {
                NodeRole::Master
            };
            Ok(Box::new(Echoing { role }))
        }
    }

    #[tokio::test]
    async fn test_select_namespace_returns_node_replies() {
        let manager =
            ConnectionManager::connect(topology(), Arc::new(EchoingConnector), &ClientConfig::new())
                .await
                .unwrap();

        let replies = manager.select_namespace(3).await.unwrap();
        assert_eq!(replies.len(), 2);
        for alias in ["node_1", "node_1_slave"] {
            assert_eq!(replies[alias], Reply::Status("OK 3".to_string()));
        }
        assert_eq!(manager.database(), 3);
    }

    #[tokio::test]
    async fn test_failed_over_handle_points_at_master() {
        let slave = MemoryServer::slave();
        slave.set_reachable(false);
        let connector = MemoryConnector::new()
            .with_server("h1", 6379, MemoryServer::master())
            .with_server("h1", 6380, slave);

        let manager = ConnectionManager::connect(topology(), Arc::new(connector), &ClientConfig::new())
            .await
            .unwrap();
        let handle = manager.handle("node_1_slave").unwrap();
        assert_eq!(handle.state, BringUpState::FailedOverToMaster);
        assert_eq!(handle.endpoint, "h1:6379");
        assert_eq!(manager.handle("node_1").unwrap().endpoint, "h1:6379");
    }
}

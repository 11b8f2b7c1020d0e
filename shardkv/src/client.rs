//! Cluster client and dispatcher
//!
//! [`ClusterClient::execute`] is the single entry point for every operation.
//! It classifies the operation, then either broadcasts it, runs it on the
//! default node, hands it to the cross-shard emulation, or routes it to the
//! master or slave of the key's shard.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::RedisConnector;
use crate::command::{
    Command, CommandClass, Op, classify, concatenates_replies, is_blocking, is_read, is_write,
};
use crate::config::{ClientConfig, ClusterConfig, FailurePolicy, TopologyConfig};
use crate::connection::{BringUpState, ConnectionManager};
use crate::error::{ClusterError, NodeError, Result};
use crate::node::{NodeConnector, Reply};
use crate::router::{extract_tag, shard_index_of};
use crate::topology::{Node, Topology};

/// Slack added to a blocking pop's own timeout before the client gives up
const BLOCKING_GRACE: Duration = Duration::from_millis(500);

/// Result of [`ClusterClient::execute`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Reply of a single-node or emulated operation
    Single(Reply),
    /// Broadcast reply per reachable node alias
    PerNode(BTreeMap<String, Reply>),
    /// Broadcast whose per-node arrays are concatenated (`keys`)
    Concatenated(Vec<Reply>),
}

impl Response {
    /// Single reply; broadcasts yield `None`
    pub fn into_single(self) -> Option<Reply> {
        match self {
            Self::Single(reply) => Some(reply),
            _ => None,
        }
    }

    pub fn per_node(&self) -> Option<&BTreeMap<String, Reply>> {
        match self {
            Self::PerNode(map) => Some(map),
            _ => None,
        }
    }
}

/// Partitioning client over a set of master/slave servers
pub struct ClusterClient {
    topology: Arc<Topology>,
    connections: ConnectionManager,
    config: ClientConfig,
    cancel: Mutex<CancellationToken>,
}

impl ClusterClient {
    /// Connect to every node of the descriptor using the Redis backend
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        Self::with_connector(
            &config.topology,
            config.client,
            Arc::new(RedisConnector::new()),
        )
        .await
    }

    /// Connect to every node using a custom backend
    ///
    /// The connector is kept for the connections blocking pops open.
    pub async fn with_connector(
        topology: &TopologyConfig,
        config: ClientConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self> {
        let topology = Arc::new(Topology::from_config(topology)?);
        let connections = ConnectionManager::connect(topology.clone(), connector, &config).await?;

        for (alias, state) in connections.states() {
            if state == BringUpState::FailedOverToMaster {
                warn!("Node {} is failed over to its master", alias);
            }
        }

        Ok(Self {
            topology,
            connections,
            config,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Master node owning a key (tag-aware)
    pub fn node_for_key(&self, key: &str) -> &Node {
        self.topology.node_for_key(key)
    }

    /// Final bring-up state per alias
    pub fn node_states(&self) -> BTreeMap<String, BringUpState> {
        self.connections.states()
    }

    /// Currently selected database
    pub fn database(&self) -> i64 {
        self.connections.database()
    }

    /// Select a database on every node; any node failure fails the call
    pub async fn select_namespace(&self, database: i64) -> Result<()> {
        self.connections.select_namespace(database).await?;
        Ok(())
    }

    /// Interrupt every blocking pop in flight
    ///
    /// Later blocking calls are not affected.
    pub fn cancel_blocking(&self) {
        let mut token = self.cancel.lock();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Run one operation
    pub async fn execute(&self, cmd: Command) -> Result<Response> {
        let class = classify(&cmd.op);
        debug!(command = %cmd.op, ?class, "dispatch");

        if class == CommandClass::Broadcast {
            if cmd.op == Op::Select {
                return self.select_all(&cmd).await;
            }
            return Ok(self.broadcast(&cmd).await);
        }

        let result = match class {
            CommandClass::TagRequired if !has_tag(&cmd) => self.emulate(cmd).await,
            _ => self.route(cmd, class).await,
        };
        self.settle(result).map(Response::Single)
    }

    /// Run one operation expected to produce a single reply
    pub async fn call(&self, cmd: Command) -> Result<Reply> {
        let op = cmd.op.clone();
        match self.execute(cmd).await? {
            Response::Single(reply) => Ok(reply),
            _ => Err(ClusterError::invalid_args(
                op.as_str(),
                "broadcast operation, use execute",
            )),
        }
    }

    /// Apply the failure policy to a single-node outcome
    fn settle(&self, result: Result<Reply>) -> Result<Reply> {
        match result {
            Err(ClusterError::Transport { .. })
                if self.config.failure_policy == FailurePolicy::Quiet =>
            {
                Ok(Reply::Nil)
            }
            other => other,
        }
    }

    /// Route a primitive to one node and run it
    pub(crate) async fn route(&self, mut cmd: Command, class: CommandClass) -> Result<Reply> {
        let alias = if class == CommandClass::Unhashed {
            self.topology.default_alias().to_string()
        } else {
            self.target_alias(&mut cmd)
        };
        self.run_on(&alias, &cmd).await
    }

    /// Pick the node for a keyed command, stripping a tag from the key argument
    fn target_alias(&self, cmd: &mut Command) -> String {
        // object <subcommand> <key>
        let position = if cmd.op == Op::Object { 1 } else { 0 };
        let Some(key) = cmd
            .args
            .get(position)
            .and_then(|a| std::str::from_utf8(a).ok())
        else {
            return self.topology.default_alias().to_string();
        };

        let (hash_key, stripped) = match extract_tag(key) {
            Some(tag) => (tag.hash_key.to_string(), Some(tag.stripped_key.to_string())),
            None => (key.to_string(), None),
        };
        if let Some(stripped) = stripped {
            cmd.args[position] = stripped.into_bytes();
        }

        let shard = shard_index_of(&hash_key, self.topology.shard_count());
        if is_write(&cmd.op) {
            self.topology.write_alias(shard).to_string()
        } else if is_read(&cmd.op) {
            self.topology.read_alias(shard).to_string()
        } else {
            self.topology.default_alias().to_string()
        }
    }

    /// Run a command on the connection registered under `alias`
    async fn run_on(&self, alias: &str, cmd: &Command) -> Result<Reply> {
        let handle = self.connections.handle(alias).ok_or_else(|| {
            ClusterError::Config(format!("no connection registered for `{}`", alias))
        })?;
        debug!(command = %cmd.op, alias, endpoint = %handle.endpoint, "run");

        let outcome = if is_blocking(&cmd.op) {
            // a blocking pop runs on its own connection so the alias's
            // shared connection stays free for the push that wakes it
            let token = self.cancel.lock().clone();
            let limit = blocking_timeout(cmd).and_then(|t| t.checked_add(BLOCKING_GRACE));
            let call = async {
                let mut conn = self.connections.dedicated(handle).await?;
                conn.call(cmd).await
            };
            let bounded = async {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, call)
                        .await
                        .unwrap_or(Ok(Reply::Nil)),
                    None => call.await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => return Err(ClusterError::Cancelled(cmd.op.to_string())),
                outcome = bounded => outcome,
            }
        } else {
            handle.lock().await.call(cmd).await
        };

        match outcome {
            Ok(reply) => Ok(reply),
            Err(NodeError::Transport(reason)) => {
                error!(
                    command = %cmd.op,
                    alias,
                    endpoint = %handle.endpoint,
                    "transport failure: {}",
                    reason
                );
                Err(ClusterError::Transport {
                    command: cmd.op.to_string(),
                    alias: alias.to_string(),
                    endpoint: handle.endpoint.clone(),
                    reason,
                })
            }
            Err(NodeError::Server(message)) => {
                debug!(command = %cmd.op, alias, "server error: {}", message);
                Err(ClusterError::Server {
                    alias: alias.to_string(),
                    message,
                })
            }
        }
    }

    /// Send a command to every node; failing nodes are omitted
    async fn broadcast(&self, cmd: &Command) -> Response {
        // getkeys is the client-side name of keys
        let renamed;
        let cmd = if cmd.op == Op::Getkeys {
            renamed = Command {
                op: Op::Keys,
                args: cmd.args.clone(),
            };
            &renamed
        } else {
            cmd
        };
        let write = is_write(&cmd.op);
        // write broadcasts reach masters only, so a failed-over slave alias
        // never delivers a second copy to its master
        let targets: Vec<&str> = self
            .connections
            .handles()
            .filter(|h| !write || self.topology.is_master(&h.alias))
            .map(|h| h.alias.as_str())
            .collect();

        let outcomes = join_all(
            targets
                .iter()
                .map(|alias| async move { (*alias, self.run_on(alias, cmd).await) }),
        )
        .await;

        let mut replies = BTreeMap::new();
        for (alias, outcome) in outcomes {
            match outcome {
                Ok(reply) => {
                    replies.insert(alias.to_string(), reply);
                }
                Err(e) => warn!("Broadcast {} skipped {}: {}", cmd.op, alias, e),
            }
        }

        if concatenates_replies(&cmd.op) {
            Response::Concatenated(
                replies
                    .into_values()
                    .flat_map(|reply| reply.into_array().unwrap_or_default())
                    .collect(),
            )
        } else {
            Response::PerNode(replies)
        }
    }

    async fn select_all(&self, cmd: &Command) -> Result<Response> {
        let database = cmd
            .first_key()
            .and_then(|db| db.parse::<i64>().ok())
            .ok_or_else(|| ClusterError::invalid_args("select", "expected a database index"))?;
        let replies = self.connections.select_namespace(database).await?;
        Ok(Response::PerNode(replies))
    }
}

fn has_tag(cmd: &Command) -> bool {
    cmd.first_key().and_then(extract_tag).is_some()
}

/// Timeout of a blocking pop (last argument, seconds)
///
/// `None` waits forever: zero, unparsable, and values too large for a
/// `Duration`.
fn blocking_timeout(cmd: &Command) -> Option<Duration> {
    let secs = cmd
        .args
        .last()
        .and_then(|a| std::str::from_utf8(a).ok())
        .and_then(|s| s.parse::<f64>().ok())?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
}

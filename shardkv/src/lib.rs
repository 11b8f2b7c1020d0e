//! shardkv
//!
//! Client-side partitioning over a fixed set of master/slave key-value
//! servers. Keys are placed on shards by CRC32 (or by the `{tag}` inside the
//! key), writes go to the shard's master, reads to its slave, and multi-key
//! set, list and string operations that span shards are emulated from
//! single-key primitives.

pub mod backend;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod node;
pub mod router;
pub mod topology;

mod emulate;

// Re-export commonly used types
pub use backend::{MemoryConnector, MemoryServer, RedisConnector};
pub use client::{ClusterClient, Response};
pub use command::{Command, CommandClass, Op, classify};
pub use config::{ClientConfig, ClusterConfig, FailurePolicy, NodeAddress, TopologyConfig};
pub use connection::BringUpState;
pub use error::{ClusterError, NodeError, Result};
pub use node::{NodeClient, NodeConnector, Reply};
pub use router::{TaggedKey, extract_tag, shard_index_of};
pub use topology::{Node, NodeRole, Topology};

//! Server backends implementing [`NodeConnector`](crate::node::NodeConnector)

mod memory;
mod redis;

pub use memory::{MemoryConnector, MemoryNode, MemoryServer};
pub use redis::{RedisConnector, RedisNode};

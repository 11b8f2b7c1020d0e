//! Redis backend over the `redis` crate

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Value};

use crate::command::Command;
use crate::error::NodeError;
use crate::node::{NodeClient, NodeConnector, Reply};
use crate::topology::NodeRole;

/// Opens multiplexed async connections to Redis servers
#[derive(Debug, Clone, Default)]
pub struct RedisConnector;

impl RedisConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeConnector for RedisConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn NodeClient>, NodeError> {
        let client = redis::Client::open(format!("redis://{}:{}/", host, port))
            .map_err(|e| NodeError::Transport(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(node_error)?;
        Ok(Box::new(RedisNode { conn }))
    }
}

/// One connection to one Redis server
pub struct RedisNode {
    conn: MultiplexedConnection,
}

#[async_trait]
impl NodeClient for RedisNode {
    async fn call(&mut self, cmd: &Command) -> Result<Reply, NodeError> {
        let mut request = redis::cmd(cmd.op.as_str());
        for arg in &cmd.args {
            request.arg(arg.as_slice());
        }
        let value: Value = request.query_async(&mut self.conn).await.map_err(node_error)?;
        Ok(to_reply(value))
    }

    async fn role(&mut self) -> Result<NodeRole, NodeError> {
        let value: Value = redis::cmd("ROLE")
            .query_async(&mut self.conn)
            .await
            .map_err(node_error)?;
        let role = to_reply(value)
            .into_array()
            .and_then(|items| items.into_iter().next())
            .and_then(Reply::into_bytes)
            .ok_or_else(|| NodeError::Server("malformed ROLE reply".to_string()))?;
        Ok(parse_role(&role))
    }

    async fn select(&mut self, database: i64) -> Result<Reply, NodeError> {
        let value: Value = redis::cmd("SELECT")
            .arg(database)
            .query_async(&mut self.conn)
            .await
            .map_err(node_error)?;
        Ok(to_reply(value))
    }
}

fn parse_role(role: &[u8]) -> NodeRole {
    if role.eq_ignore_ascii_case(b"slave") || role.eq_ignore_ascii_case(b"replica") {
        NodeRole::Slave
    } else {
        NodeRole::Master
    }
}

fn node_error(e: RedisError) -> NodeError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        NodeError::Transport(e.to_string())
    } else {
        NodeError::Server(e.to_string())
    }
}

fn to_reply(value: Value) -> Reply {
    match value {
        Value::Nil => Reply::Nil,
        Value::Int(n) => Reply::Int(n),
        Value::BulkString(data) => Reply::Bulk(data),
        Value::Array(items) | Value::Set(items) => {
            Reply::Array(items.into_iter().map(to_reply).collect())
        }
        Value::Map(pairs) => Reply::Array(
            pairs
                .into_iter()
                .flat_map(|(k, v)| [to_reply(k), to_reply(v)])
                .collect(),
        ),
        Value::SimpleString(s) => Reply::Status(s),
        Value::Okay => Reply::ok(),
        Value::Boolean(b) => Reply::from_bool(b),
        Value::Double(d) => Reply::Bulk(d.to_string().into_bytes()),
        other => Reply::Bulk(format!("{:?}", other).into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_reply() {
        assert_eq!(to_reply(Value::Nil), Reply::Nil);
        assert_eq!(to_reply(Value::Okay), Reply::ok());
        assert_eq!(to_reply(Value::Int(3)), Reply::Int(3));
        assert_eq!(
            to_reply(Value::Array(vec![
                Value::BulkString(b"a".to_vec()),
                Value::Nil
            ])),
            Reply::Array(vec![Reply::bulk("a"), Reply::Nil])
        );
        assert_eq!(
            to_reply(Value::Map(vec![(
                Value::SimpleString("db0".into()),
                Value::Int(1)
            )])),
            Reply::Array(vec![Reply::Status("db0".into()), Reply::Int(1)])
        );
    }

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role(b"master"), NodeRole::Master);
        assert_eq!(parse_role(b"slave"), NodeRole::Slave);
        assert_eq!(parse_role(b"REPLICA"), NodeRole::Slave);
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport() {
        // port 1 is never a Redis server
        let result = RedisConnector::new().connect("127.0.0.1", 1).await;
        match result {
            Err(e) => assert!(e.is_transport()),
            Ok(_) => panic!("connected to port 1"),
        }
    }
}

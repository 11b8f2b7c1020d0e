//! Single-server client seam
//!
//! The cluster client never speaks the wire protocol. It names operations,
//! forwards argument lists and receives [`Reply`] values from whatever
//! [`NodeClient`] the [`NodeConnector`] hands out.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::NodeError;
use crate::topology::NodeRole;

/// Typed reply from one server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Absent value (missing key, failed call under the quiet policy)
    Nil,
    /// Status line such as `OK`
    Status(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Self::Status("OK".to_string())
    }

    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Self::Bulk(data.as_ref().to_vec())
    }

    /// Integer reply for a boolean outcome
    pub fn from_bool(value: bool) -> Self {
        Self::Int(i64::from(value))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Bulk(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bulk(b) => Some(b),
            Self::Status(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    /// Bulk payload, consuming the reply
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Bulk(b) => Some(b),
            Self::Status(s) => Some(s.into_bytes()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Success as the store reports it: non-zero integer, `OK`, or any payload
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Int(n) => *n != 0,
            Self::Status(s) => s.eq_ignore_ascii_case("ok"),
            Self::Bulk(_) => true,
            Self::Array(items) => !items.is_empty(),
        }
    }
}

/// One live connection to one server
///
/// Implementations are not expected to support concurrent use; the cluster
/// client serializes access per node alias.
#[async_trait]
pub trait NodeClient: Send {
    /// Run one command
    async fn call(&mut self, cmd: &Command) -> Result<Reply, NodeError>;

    /// Replication role the server currently reports
    async fn role(&mut self) -> Result<NodeRole, NodeError>;

    /// Select the logical database for this connection; returns the
    /// server's reply
    async fn select(&mut self, database: i64) -> Result<Reply, NodeError>;
}

/// Opens connections to servers
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<Box<dyn NodeClient>, NodeError>;
}

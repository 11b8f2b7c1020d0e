//! Error types for the cluster client

use thiserror::Error;

/// Result type alias for cluster client operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster client error types
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Malformed or incomplete topology descriptor
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML descriptor could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Descriptor file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configured node stayed unreachable after every bring-up attempt
    #[error("Cannot connect to {endpoint} ({alias}): {reason}")]
    Startup {
        alias: String,
        endpoint: String,
        reason: String,
    },

    /// A slave slot is served by a node that does not act as a slave
    #[error("Server {endpoint} ({alias}) is not a slave")]
    NotASlave { alias: String, endpoint: String },

    /// Multi-key command without a shared tag and without an emulation
    #[error("Command {0} not supported (each key name has its own node)")]
    UnsupportedCommand(String),

    /// Connection to a node failed mid-call
    #[error("Transport error on {command} at {alias} ({endpoint}): {reason}")]
    Transport {
        command: String,
        alias: String,
        endpoint: String,
        reason: String,
    },

    /// The node answered with an error reply
    #[error("Server error from {alias}: {message}")]
    Server { alias: String, message: String },

    /// A primitive answered with a reply of the wrong shape
    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    /// Wrong number or shape of arguments for an operation
    #[error("Invalid arguments for {command}: {reason}")]
    InvalidArguments { command: String, reason: String },

    /// Blocking operation interrupted through the client's cancellation token
    #[error("Operation {0} cancelled")]
    Cancelled(String),
}

impl ClusterError {
    /// True for construction-time errors that prevent the client from existing
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigParse(_)
                | Self::Io(_)
                | Self::Startup { .. }
                | Self::NotASlave { .. }
        )
    }

    pub(crate) fn invalid_args(command: &str, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors reported by a single-server connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// The connection is unusable (refused, dropped, timed out)
    #[error("transport: {0}")]
    Transport(String),

    /// The server processed the command and replied with an error
    #[error("server: {0}")]
    Server(String),
}

impl NodeError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ClusterError::Config("missing nodes".into()).is_fatal());
        assert!(
            ClusterError::NotASlave {
                alias: "node_1_slave".into(),
                endpoint: "127.0.0.1:6380".into(),
            }
            .is_fatal()
        );
        assert!(!ClusterError::UnsupportedCommand("rename".into()).is_fatal());
        assert!(!ClusterError::Cancelled("brpop".into()).is_fatal());
    }

    #[test]
    fn test_error_messages_name_the_endpoint() {
        let err = ClusterError::Startup {
            alias: "node_2".into(),
            endpoint: "10.0.0.2:6379".into(),
            reason: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.2:6379"));
        assert!(msg.contains("node_2"));
    }
}

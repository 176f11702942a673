//! Error types for the cluster layer.

use crate::NodeId;
use thiserror::Error;

/// Failures of a single call to a remote node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Request to node {0} timed out")]
    Timeout(NodeId),

    #[error("Request to node {0} was cancelled")]
    Cancelled(NodeId),

    #[error("Node {node_id} failed the request: {message}")]
    Remote { node_id: NodeId, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by a storage driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage is closed")]
    Closed,
}

/// Errors raised by the membership provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("A seed address is required to join a cluster")]
    MissingSeed,

    #[error("Seed {0} is unreachable")]
    SeedUnreachable(String),
}

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Errors that can occur in node operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    #[error("Node is decommissioning and only transfers partitions")]
    Decommissioning,

    #[error("Node has shut down")]
    Shutdown,

    #[error("Node was already started")]
    AlreadyStarted,

    #[error("Node is not part of a cluster and no initialization option was given")]
    NotInitialized,

    #[error("Client targets node {actual} but this node is {expected}")]
    NodeIdMismatch { expected: NodeId, actual: NodeId },

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Client {client_id:?} may not {operation} bucket {bucket}")]
    Unauthorized {
        bucket: String,
        client_id: String,
        operation: &'static str,
    },

    #[error("Partition {0} has no replicas")]
    NoReplicas(u64),

    #[error("Insufficient replicas: need {needed}, got {got}")]
    InsufficientReplicas { needed: usize, got: usize },

    #[error("Relay not found: {0}")]
    RelayNotFound(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NodeError {
    /// Report a failure of a locally served replica the way a remote one
    /// would be reported.
    pub fn into_client_error(self, node_id: NodeId) -> ClientError {
        match self {
            NodeError::Client(err) => err,
            other => ClientError::Remote {
                node_id,
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;

//! # sdx-cluster
//!
//! Replication core of a Sardonyx node: routes requests to the replicas of
//! a partition, fans calls out to them in parallel, merges their answers
//! and repairs replicas that fell behind.
//!
//! - [`node`] - the coordinator and its lifecycle
//! - [`partition`] - site to partition to replica routing
//! - [`client`] - the node-to-node RPC contract and an in-memory network
//! - [`merger`] / [`merge_iterator`] - merging replica answers
//! - [`repair`] - background read repair
//! - [`bucket`] - per-bucket resolver and access policy
//! - [`replica`] - the locally served replica and its relays
//! - [`storage`] - the storage driver contract
//! - [`membership`] - the cluster membership contract
//! - [`config`] / [`context`] / [`error`] - ambient types

pub mod batch;
pub mod bucket;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod iterator;
pub mod membership;
pub mod merge_iterator;
pub mod merger;
pub mod node;
pub mod partition;
pub mod repair;
pub mod replica;
pub mod storage;

/// Identifies a node within a cluster.
pub type NodeId = u64;

pub use batch::{Op, UpdateBatch};
pub use bucket::{Bucket, BucketList, BucketPolicy, Eligibility};
pub use client::{MemoryNetwork, MemoryNodeClient, NodeClient, RelayStatus};
pub use config::{ClusterConfig, NodeConfig, NodeConfigBuilder, Quorum};
pub use context::{CancelHandle, RequestContext};
pub use error::{ClientError, ConfigError, MembershipError, NodeError, Result, StorageError};
pub use iterator::{MemorySiblingSetIterator, SiblingSetIterator};
pub use membership::{ClusterMembership, MembershipEvent, MembershipState, StaticMembership};
pub use merge_iterator::SiblingSetMergeIterator;
pub use merger::NodeReadMerger;
pub use node::{
    LifecycleState, Node, NodeInitializationOptions, ReplicaReport, Replicated, Shutdown,
};
pub use partition::{HashPartitionResolver, PartitionResolver};
pub use repair::{NodeReadRepairer, NoopRepairer, ReadRepairer};
pub use replica::{LocalReplica, RelayUpdate};
pub use storage::{MemoryStorageDriver, StorageDriver, StoredEntry};

// Re-export the value model so callers need only this crate.
pub use sdx_core::{ConflictResolver, Dot, ResolverKind, Sibling, SiblingSet, VersionVector};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::batch::UpdateBatch;
    pub use crate::client::NodeClient;
    pub use crate::config::{NodeConfig, Quorum};
    pub use crate::context::RequestContext;
    pub use crate::error::NodeError;
    pub use crate::iterator::SiblingSetIterator;
    pub use crate::node::{Node, NodeInitializationOptions, Shutdown};
    pub use sdx_core::SiblingSet;
}

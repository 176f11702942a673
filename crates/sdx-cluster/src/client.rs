//! Node-to-node RPC contract.
//!
//! A [`NodeClient`] issues partition operations against one named node.
//! The wire encoding belongs to the transport; this module fixes only the
//! call shapes and the error surface. [`MemoryNodeClient`] delivers calls to
//! in-process replicas over a simulated network.

use crate::batch::UpdateBatch;
use crate::context::RequestContext;
use crate::error::{ClientError, NodeError};
use crate::iterator::SiblingSetIterator;
use crate::replica::LocalReplica;
use crate::NodeId;
use async_trait::async_trait;
use parking_lot::RwLock;
use sdx_core::SiblingSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Connectivity of a downstream relay as seen by the node it attaches to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStatus {
    pub relay_id: String,
    pub site_id: String,
    pub connected: bool,
    pub connected_to: NodeId,
    pub ping_ms: u64,
}

#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Push a pre-merged patch into the node's storage. With
    /// `broadcast_to_relays` the node also forwards it to its relays.
    #[allow(clippy::too_many_arguments)]
    async fn merge(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    ) -> Result<(), ClientError>;

    /// Apply a batch on the node. Returns the post-write set of every
    /// touched key.
    async fn batch(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        batch: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, ClientError>;

    /// Positional point reads; the answer has one set per requested key.
    async fn get(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, ClientError>;

    async fn get_matches(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Box<dyn SiblingSetIterator>, ClientError>;

    async fn relay_status(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        site_id: &str,
        relay_id: &str,
    ) -> Result<RelayStatus, ClientError>;

    /// The node this client runs on.
    fn local_node_id(&self) -> NodeId;
}

/// Registry of in-process replicas that [`MemoryNodeClient`]s route to.
/// Nodes can be marked down and calls can be given a fixed latency.
#[derive(Debug, Default)]
pub struct MemoryNetwork {
    replicas: RwLock<HashMap<NodeId, Arc<LocalReplica>>>,
    down: RwLock<HashSet<NodeId>>,
    latency: RwLock<Option<Duration>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, replica: Arc<LocalReplica>) {
        self.replicas.write().insert(replica.node_id(), replica);
    }

    pub fn set_down(&self, node_id: NodeId, down: bool) {
        let mut nodes = self.down.write();
        if down {
            nodes.insert(node_id);
        } else {
            nodes.remove(&node_id);
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn client(self: &Arc<Self>, local_node_id: NodeId) -> MemoryNodeClient {
        MemoryNodeClient {
            local_node_id,
            network: Arc::clone(self),
        }
    }

    async fn route(&self, ctx: &RequestContext, node_id: NodeId) -> Result<Arc<LocalReplica>, ClientError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::select! {
                _ = tokio::time::sleep(latency) => {}
                err = ctx.done() => return Err(context_error(err, node_id)),
            }
        }

        if self.down.read().contains(&node_id) {
            return Err(ClientError::Unreachable(node_id));
        }
        self.replicas
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(ClientError::Unreachable(node_id))
    }
}

/// Client over a [`MemoryNetwork`].
#[derive(Clone, Debug)]
pub struct MemoryNodeClient {
    local_node_id: NodeId,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl NodeClient for MemoryNodeClient {
    async fn merge(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    ) -> Result<(), ClientError> {
        let replica = self.network.route(ctx, node_id).await?;
        replica
            .merge(site_id, bucket, patch, broadcast_to_relays)
            .map_err(|err| err.into_client_error(node_id))
    }

    async fn batch(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        site_id: &str,
        bucket: &str,
        batch: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, ClientError> {
        let replica = self.network.route(ctx, node_id).await?;
        replica
            .batch(site_id, bucket, batch)
            .map_err(|err| err.into_client_error(node_id))
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, ClientError> {
        let replica = self.network.route(ctx, node_id).await?;
        replica
            .get(site_id, bucket, keys)
            .map_err(|err| err.into_client_error(node_id))
    }

    async fn get_matches(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Box<dyn SiblingSetIterator>, ClientError> {
        let replica = self.network.route(ctx, node_id).await?;
        let iter = replica
            .get_matches(site_id, bucket, prefixes)
            .map_err(|err| err.into_client_error(node_id))?;
        Ok(Box::new(iter))
    }

    async fn relay_status(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _site_id: &str,
        relay_id: &str,
    ) -> Result<RelayStatus, ClientError> {
        let replica = self.network.route(ctx, node_id).await?;
        replica
            .relay_status(relay_id)
            .map_err(|err| err.into_client_error(node_id))
    }

    fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }
}

/// Translate a finished request context into the error of one call.
pub fn context_error(err: NodeError, node_id: NodeId) -> ClientError {
    match err {
        NodeError::Cancelled => ClientError::Cancelled(node_id),
        _ => ClientError::Timeout(node_id),
    }
}

//! Hand-rolled fakes for the narrow interfaces a node depends on.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use sdx_cluster::client::context_error;
use sdx_cluster::{
    BucketList, ClientError, LocalReplica, MemoryStorageDriver, MemorySiblingSetIterator,
    NodeClient, NodeConfig, NodeId, NodeReadMerger, NodeReadRepairer, PartitionResolver,
    RelayStatus, RequestContext, SiblingSet, SiblingSetIterator, StorageDriver, StoredEntry,
    UpdateBatch,
};
use sdx_cluster::{Dot, Sibling, VersionVector};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const SITE: &str = "site1";

/// A single write by `node` that observed nothing.
pub fn write(node: &str, value: &str, timestamp: u64) -> SiblingSet {
    SiblingSet::from_siblings([Sibling::new(
        Dot::new(node, 1),
        VersionVector::new(),
        value.as_bytes().to_vec(),
        timestamp,
    )])
}

pub fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|k| k.to_string()).collect()
}

pub fn entry(prefix: &str, key: &str, value: SiblingSet) -> StoredEntry {
    StoredEntry {
        prefix: prefix.to_string(),
        key: key.to_string(),
        value,
        local_version: 1,
    }
}

/// Fixed routing: sites map to partitions by table, partitions to replicas.
#[derive(Default)]
pub struct FakePartitionResolver {
    sites: HashMap<String, u64>,
    replicas: HashMap<u64, Vec<NodeId>>,
}

impl FakePartitionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn site(mut self, site_id: &str, partition: u64) -> Self {
        self.sites.insert(site_id.to_string(), partition);
        self
    }

    pub fn replicas(mut self, partition: u64, nodes: &[NodeId]) -> Self {
        self.replicas.insert(partition, nodes.to_vec());
        self
    }
}

impl PartitionResolver for FakePartitionResolver {
    fn partition(&self, partitioning_key: &str) -> u64 {
        self.sites.get(partitioning_key).copied().unwrap_or(0)
    }

    fn replica_nodes(&self, partition: u64) -> Vec<NodeId> {
        self.replicas.get(&partition).cloned().unwrap_or_default()
    }
}

/// A call the fake client received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Merge {
        node_id: NodeId,
        patch: HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    },
    Batch { node_id: NodeId },
    Get { node_id: NodeId, keys: Vec<String> },
    GetMatches { node_id: NodeId },
    RelayStatus { node_id: NodeId, relay_id: String },
}

impl Call {
    pub fn node_id(&self) -> NodeId {
        match self {
            Call::Merge { node_id, .. }
            | Call::Batch { node_id }
            | Call::Get { node_id, .. }
            | Call::GetMatches { node_id }
            | Call::RelayStatus { node_id, .. } => *node_id,
        }
    }
}

/// Remote nodes simulated by per-node tables. Every call is recorded.
pub struct FakeNodeClient {
    local: NodeId,
    values: Mutex<HashMap<NodeId, HashMap<String, SiblingSet>>>,
    matches: HashMap<NodeId, (Vec<StoredEntry>, Option<ClientError>)>,
    relays: HashMap<NodeId, RelayStatus>,
    failures: HashMap<NodeId, ClientError>,
    latency: HashMap<NodeId, Duration>,
    calls: Mutex<Vec<Call>>,
}

impl FakeNodeClient {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            values: Mutex::new(HashMap::new()),
            matches: HashMap::new(),
            relays: HashMap::new(),
            failures: HashMap::new(),
            latency: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn value(self, node_id: NodeId, key: &str, set: SiblingSet) -> Self {
        self.values
            .lock()
            .entry(node_id)
            .or_default()
            .insert(key.to_string(), set);
        self
    }

    pub fn matches(mut self, node_id: NodeId, entries: Vec<StoredEntry>) -> Self {
        self.matches.insert(node_id, (entries, None));
        self
    }

    /// Entries followed by an iteration error.
    pub fn broken_matches(mut self, node_id: NodeId, entries: Vec<StoredEntry>, error: ClientError) -> Self {
        self.matches.insert(node_id, (entries, Some(error)));
        self
    }

    pub fn relay(mut self, node_id: NodeId, status: RelayStatus) -> Self {
        self.relays.insert(node_id, status);
        self
    }

    pub fn failing(mut self, node_id: NodeId) -> Self {
        self.failures.insert(node_id, ClientError::Unreachable(node_id));
        self
    }

    pub fn slow(mut self, node_id: NodeId, latency: Duration) -> Self {
        self.latency.insert(node_id, latency);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn merges(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Merge { .. }))
            .collect()
    }

    pub fn stored(&self, node_id: NodeId, key: &str) -> SiblingSet {
        self.values
            .lock()
            .get(&node_id)
            .and_then(|values| values.get(key).cloned())
            .unwrap_or_default()
    }

    async fn enter(&self, ctx: &RequestContext, call: Call) -> Result<(), ClientError> {
        let node_id = call.node_id();
        self.calls.lock().push(call);

        if let Some(latency) = self.latency.get(&node_id) {
            tokio::select! {
                _ = tokio::time::sleep(*latency) => {}
                err = ctx.done() => return Err(context_error(err, node_id)),
            }
        }
        match self.failures.get(&node_id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn merge(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        patch: &HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    ) -> Result<(), ClientError> {
        let call = Call::Merge {
            node_id,
            patch: patch.clone(),
            broadcast_to_relays,
        };
        self.enter(ctx, call).await?;

        let mut values = self.values.lock();
        let stored = values.entry(node_id).or_default();
        for (key, set) in patch {
            let current = stored.entry(key.clone()).or_default();
            *current = current.merge(set);
        }
        Ok(())
    }

    async fn batch(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        batch: &UpdateBatch,
    ) -> Result<HashMap<String, SiblingSet>, ClientError> {
        self.enter(ctx, Call::Batch { node_id }).await?;

        let mut values = self.values.lock();
        let stored = values.entry(node_id).or_default();
        let mut patch = HashMap::new();
        for op in batch.ops() {
            let current = stored.entry(op.key().to_string()).or_default();
            *current = current.event(&node_id.to_string(), 1, op.value().map(<[u8]>::to_vec));
            patch.insert(op.key().to_string(), current.clone());
        }
        Ok(patch)
    }

    async fn get(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        keys: &[String],
    ) -> Result<Vec<SiblingSet>, ClientError> {
        let call = Call::Get {
            node_id,
            keys: keys.to_vec(),
        };
        self.enter(ctx, call).await?;
        Ok(keys.iter().map(|key| self.stored(node_id, key)).collect())
    }

    async fn get_matches(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _partition: u64,
        _site_id: &str,
        _bucket: &str,
        _prefixes: &[String],
    ) -> Result<Box<dyn SiblingSetIterator>, ClientError> {
        self.enter(ctx, Call::GetMatches { node_id }).await?;

        let mut iter = MemorySiblingSetIterator::new();
        if let Some((entries, error)) = self.matches.get(&node_id) {
            for entry in entries {
                iter.push(entry.clone());
            }
            if let Some(error) = error {
                iter.push_error(error.clone());
            }
        }
        Ok(Box::new(iter))
    }

    async fn relay_status(
        &self,
        ctx: &RequestContext,
        node_id: NodeId,
        _site_id: &str,
        relay_id: &str,
    ) -> Result<RelayStatus, ClientError> {
        let call = Call::RelayStatus {
            node_id,
            relay_id: relay_id.to_string(),
        };
        self.enter(ctx, call).await?;
        self.relays.get(&node_id).cloned().ok_or(ClientError::Remote {
            node_id,
            message: format!("Relay not found: {}", relay_id),
        })
    }

    fn local_node_id(&self) -> NodeId {
        self.local
    }
}

/// A repair request the recording repairer received.
pub struct RepairRequest {
    pub partition: u64,
    pub site_id: String,
    pub bucket: String,
    pub merger: Arc<NodeReadMerger>,
}

#[derive(Default)]
pub struct RecordingRepairer {
    requests: Mutex<Vec<RepairRequest>>,
    stops: Mutex<usize>,
}

impl RecordingRepairer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_merger(&self) -> Option<Arc<NodeReadMerger>> {
        self.requests.lock().last().map(|r| Arc::clone(&r.merger))
    }

    pub fn last_target(&self) -> Option<(u64, String, String)> {
        self.requests
            .lock()
            .last()
            .map(|r| (r.partition, r.site_id.clone(), r.bucket.clone()))
    }

    pub fn stops(&self) -> usize {
        *self.stops.lock()
    }
}

impl NodeReadRepairer for RecordingRepairer {
    fn begin_repair(&self, partition: u64, site_id: &str, bucket: &str, merger: Arc<NodeReadMerger>) {
        self.requests.lock().push(RepairRequest {
            partition,
            site_id: site_id.to_string(),
            bucket: bucket.to_string(),
            merger,
        });
    }

    fn stop_repairs(&self) {
        *self.stops.lock() += 1;
    }
}

/// Local replica of `node_id` over its own in-memory store.
pub fn local_replica(node_id: NodeId, buckets: impl FnOnce(Arc<dyn StorageDriver>) -> BucketList) -> Arc<LocalReplica> {
    let store: Arc<dyn StorageDriver> = Arc::new(MemoryStorageDriver::new());
    Arc::new(LocalReplica::new(node_id, Arc::new(buckets(store))))
}

pub fn default_replica(node_id: NodeId) -> Arc<LocalReplica> {
    local_replica(node_id, BucketList::with_defaults)
}

pub fn config(node_id: NodeId) -> NodeConfig {
    sdx_cluster::NodeConfigBuilder::new(node_id)
        .rpc_timeout(1000)
        .build()
}

//! The node coordinator.
//!
//! A [`Node`] routes each request to the replicas of its partition, fans the
//! call out to all of them at once, merges what comes back and hands the
//! caller the bucket-resolved result, along with a [`ReplicaReport`] saying
//! which replicas took part. Reads schedule repair of lagging replicas.

use crate::batch::UpdateBatch;
use crate::bucket::Bucket;
use crate::client::{context_error, NodeClient, RelayStatus};
use crate::config::{NodeConfig, Quorum};
use crate::context::RequestContext;
use crate::error::{ClientError, NodeError, Result};
use crate::iterator::SiblingSetIterator;
use crate::membership::{ClusterMembership, MembershipEvent, MembershipState};
use crate::merge_iterator::SiblingSetMergeIterator;
use crate::merger::NodeReadMerger;
use crate::partition::PartitionResolver;
use crate::repair::NodeReadRepairer;
use crate::replica::LocalReplica;
use crate::storage::StoredEntry;
use crate::NodeId;
use futures::future::join_all;
use parking_lot::Mutex;
use sdx_core::SiblingSet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How `start` decides between bootstrapping and joining when this node is
/// not yet a cluster member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeInitializationOptions {
    pub start_cluster: bool,
    pub join_cluster: bool,
    pub seed: Option<String>,
}

impl NodeInitializationOptions {
    pub fn bootstrap() -> Self {
        Self {
            start_cluster: true,
            ..Self::default()
        }
    }

    pub fn join(seed: impl Into<String>) -> Self {
        Self {
            join_cluster: true,
            seed: Some(seed.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    Stopped,
    Decommissioned,
    Removed,
}

/// Why a started node stopped running. All of these are normal exits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shutdown {
    Stopped,
    /// Removed after handing off its data.
    Decommissioned,
    /// Removed before its data was handed off.
    Removed,
}

impl From<Shutdown> for LifecycleState {
    fn from(shutdown: Shutdown) -> Self {
        match shutdown {
            Shutdown::Stopped => LifecycleState::Stopped,
            Shutdown::Decommissioned => LifecycleState::Decommissioned,
            Shutdown::Removed => LifecycleState::Removed,
        }
    }
}

/// Which replicas a result was assembled from.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplicaReport {
    pub replicas: Vec<NodeId>,
    pub responded: Vec<NodeId>,
    pub failed: Vec<(NodeId, ClientError)>,
}

impl ReplicaReport {
    fn new(replicas: &[NodeId]) -> Self {
        Self {
            replicas: replicas.to_vec(),
            ..Self::default()
        }
    }

    /// True when every replica of the partition answered.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.responded.len() == self.replicas.len()
    }
}

/// A result together with the replicas that produced it.
#[derive(Debug)]
pub struct Replicated<T> {
    pub value: T,
    pub report: ReplicaReport,
}

impl<T> Replicated<T> {
    pub fn is_complete(&self) -> bool {
        self.report.is_complete()
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

struct FanOut<T> {
    answers: Vec<(NodeId, T)>,
    failures: Vec<(NodeId, ClientError)>,
}

pub struct Node<C: NodeClient> {
    config: NodeConfig,
    partitions: Arc<dyn PartitionResolver>,
    replica: Arc<LocalReplica>,
    client: Arc<C>,
    membership: Arc<dyn ClusterMembership>,
    repairer: Arc<dyn NodeReadRepairer>,
    lifecycle: Mutex<LifecycleState>,
    decommissioning: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl<C: NodeClient> Node<C> {
    pub fn new(
        config: NodeConfig,
        partitions: Arc<dyn PartitionResolver>,
        replica: Arc<LocalReplica>,
        client: Arc<C>,
        membership: Arc<dyn ClusterMembership>,
        repairer: Arc<dyn NodeReadRepairer>,
    ) -> Result<Self> {
        for actual in [client.local_node_id(), replica.node_id()] {
            if actual != config.node_id {
                return Err(NodeError::NodeIdMismatch {
                    expected: config.node_id,
                    actual,
                });
            }
        }

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            partitions,
            replica,
            client,
            membership,
            repairer,
            lifecycle: Mutex::new(LifecycleState::NotStarted),
            decommissioning: AtomicBool::new(false),
            shutdown,
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn replica(&self) -> &Arc<LocalReplica> {
        &self.replica
    }

    pub fn state(&self) -> LifecycleState {
        *self.lifecycle.lock()
    }

    pub fn is_decommissioning(&self) -> bool {
        self.decommissioning.load(Ordering::SeqCst)
    }

    /// The partition a site's data lives in.
    pub fn partition_of(&self, site_id: &str) -> u64 {
        self.partitions.partition(site_id)
    }

    /// Join or bootstrap the cluster, then run until stopped or removed.
    pub async fn start(&self, options: NodeInitializationOptions) -> Result<Shutdown> {
        // Subscribe before reporting Running so no removal is missed.
        let events = self.membership.subscribe();
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != LifecycleState::NotStarted {
                return Err(NodeError::AlreadyStarted);
            }
            *lifecycle = LifecycleState::Running;
        }

        if let Err(err) = self.initialize(&options).await {
            warn!(error = ?err, node_id = self.id(), "Node failed to start");
            *self.lifecycle.lock() = LifecycleState::NotStarted;
            return Err(err);
        }

        info!(node_id = self.id(), decommissioning = self.is_decommissioning(), "Node running");
        let outcome = self.run(events).await;

        *self.lifecycle.lock() = outcome.into();
        self.repairer.stop_repairs();
        info!(node_id = self.id(), outcome = ?outcome, "Node exited");
        Ok(outcome)
    }

    /// Make `start` return `Shutdown::Stopped`. The request is latched, so a
    /// stop issued before `start` gets going still ends it. Does nothing once
    /// the node has exited.
    pub fn stop(&self) {
        let lifecycle = self.lifecycle.lock();
        if matches!(*lifecycle, LifecycleState::NotStarted | LifecycleState::Running) {
            self.shutdown.send_replace(true);
        }
    }

    async fn initialize(&self, options: &NodeInitializationOptions) -> Result<()> {
        let node_id = self.id();
        match self.membership.state(node_id).await? {
            MembershipState::NotMember if options.start_cluster => {
                self.membership.initialize_cluster(node_id).await?;
                info!(node_id, "Bootstrapped a new cluster");
            }
            MembershipState::NotMember if options.join_cluster => {
                self.membership
                    .join_cluster(node_id, options.seed.as_deref())
                    .await?;
                info!(node_id, seed = ?options.seed, "Joined cluster");
            }
            MembershipState::NotMember => return Err(NodeError::NotInitialized),
            MembershipState::Member => debug!(node_id, "Resuming cluster membership"),
            MembershipState::Decommissioning => {
                self.decommissioning.store(true, Ordering::SeqCst);
                info!(node_id, "Resuming in decommissioning mode");
            }
        }
        Ok(())
    }

    async fn run(&self, mut events: broadcast::Receiver<MembershipEvent>) -> Shutdown {
        let node_id = self.id();
        let mut shutdown = self.shutdown.subscribe();
        let mut events_open = true;

        loop {
            let stopped = *shutdown.borrow_and_update();
            if stopped {
                return Shutdown::Stopped;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Shutdown::Stopped;
                    }
                }
                event = events.recv(), if events_open => match event {
                    Ok(MembershipEvent::NodeRemoved { node_id: removed, data_transferred }) if removed == node_id => {
                        return if data_transferred {
                            Shutdown::Decommissioned
                        } else {
                            Shutdown::Removed
                        };
                    }
                    Ok(MembershipEvent::Decommissioning { node_id: leaving }) if leaving == node_id => {
                        self.decommissioning.store(true, Ordering::SeqCst);
                        info!(node_id, "Decommissioning");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(node_id, skipped, "Membership events lagged");
                        if let Some(outcome) = self.resync_membership().await {
                            return outcome;
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!(node_id, "Membership event stream closed");
                        events_open = false;
                    }
                },
            }
        }
    }

    async fn resync_membership(&self) -> Option<Shutdown> {
        match self.membership.state(self.id()).await {
            Ok(MembershipState::NotMember) => Some(Shutdown::Removed),
            Ok(MembershipState::Decommissioning) => {
                self.decommissioning.store(true, Ordering::SeqCst);
                None
            }
            Ok(MembershipState::Member) => None,
            Err(err) => {
                warn!(error = ?err, node_id = self.id(), "Membership lookup failed");
                None
            }
        }
    }

    /// Read `keys` from every replica of `partition`, merged and resolved,
    /// in key order.
    pub async fn get(
        &self,
        ctx: &RequestContext,
        partition: u64,
        site_id: &str,
        bucket: &str,
        keys: &[String],
    ) -> Result<Replicated<Vec<SiblingSet>>> {
        self.ensure_serving()?;
        let target = self.authorize(ctx, bucket, Access::Read)?;
        let replicas = self.replicas(partition)?;

        let dispatch = self.dispatch(partition, site_id, bucket);
        let requested: Arc<[String]> = keys.into();
        let fan_out = self
            .fan_out(ctx, &replicas, |node_id, call_ctx| {
                dispatch.clone().get(call_ctx, node_id, Arc::clone(&requested))
            })
            .await?;
        let (answers, report) = self.check_quorum(&replicas, fan_out, self.config.read_quorum)?;

        let merger = Arc::new(NodeReadMerger::new());
        for (node_id, values) in answers {
            merger.insert_node(node_id);
            for (key, set) in keys.iter().zip(values) {
                merger.insert_key_replica(node_id, key, set);
            }
        }
        self.repair(partition, site_id, bucket, &merger);

        let value = keys
            .iter()
            .map(|key| target.resolve(&merger.get(key).unwrap_or_default()))
            .collect();
        Ok(Replicated { value, report })
    }

    /// Read every key under `prefixes` from every replica. The iterator
    /// walks prefixes in request order and keys sorted within a prefix.
    pub async fn get_matches(
        &self,
        ctx: &RequestContext,
        partition: u64,
        site_id: &str,
        bucket: &str,
        prefixes: &[String],
    ) -> Result<Replicated<SiblingSetMergeIterator>> {
        self.ensure_serving()?;
        let target = self.authorize(ctx, bucket, Access::Read)?;
        let replicas = self.replicas(partition)?;

        let dispatch = self.dispatch(partition, site_id, bucket);
        let requested: Arc<[String]> = prefixes.into();
        let fan_out = self
            .fan_out(ctx, &replicas, |node_id, call_ctx| {
                dispatch
                    .clone()
                    .get_matches(call_ctx, node_id, Arc::clone(&requested))
            })
            .await?;
        let (answers, report) = self.check_quorum(&replicas, fan_out, self.config.read_quorum)?;

        let merger = Arc::new(NodeReadMerger::new());
        for (node_id, entries) in &answers {
            merger.insert_node(*node_id);
            for entry in entries {
                merger.insert_key_replica(*node_id, &entry.key, entry.value.clone());
            }
        }

        let mut iter = SiblingSetMergeIterator::new(Arc::clone(&merger))
            .with_resolver(Arc::clone(target.resolver()));
        for prefix in prefixes {
            for (_, entries) in &answers {
                for entry in entries.iter().filter(|e| &e.prefix == prefix) {
                    iter.add_key(&entry.prefix, &entry.key);
                }
            }
        }
        iter.sort_keys();
        self.repair(partition, site_id, bucket, &merger);

        Ok(Replicated {
            value: iter,
            report,
        })
    }

    /// Apply `batch` at one replica, then merge the written values into the
    /// other replicas. Returns the written values, resolved.
    ///
    /// The applying replica is this node when it holds the partition,
    /// otherwise the first replica that accepts the batch. A batch that
    /// fails the write quorum stays applied where it was applied.
    pub async fn batch(
        &self,
        ctx: &RequestContext,
        partition: u64,
        site_id: &str,
        bucket: &str,
        batch: &UpdateBatch,
    ) -> Result<Replicated<HashMap<String, SiblingSet>>> {
        self.ensure_serving()?;
        let target = self.authorize(ctx, bucket, Access::Write)?;
        let replicas = self.replicas(partition)?;
        let needed = self.config.write_quorum.required(replicas.len());
        let mut report = ReplicaReport::new(&replicas);

        let mut candidates = replicas.clone();
        if let Some(local) = candidates.iter().position(|&id| id == self.id()) {
            candidates[..=local].rotate_right(1);
        }

        let dispatch = self.dispatch(partition, site_id, bucket);
        let batch = Arc::new(batch.clone());
        let mut applied = None;
        let mut attempted = Vec::new();

        for node_id in candidates {
            attempted.push(node_id);
            let mut fan_out = self
                .fan_out(ctx, &[node_id], |node_id, call_ctx| {
                    dispatch.clone().batch(call_ctx, node_id, Arc::clone(&batch))
                })
                .await?;

            report.failed.append(&mut fan_out.failures);
            if let Some((node_id, patch)) = fan_out.answers.pop() {
                report.responded.push(node_id);
                applied = Some(patch);
                break;
            }
        }

        let Some(patch) = applied else {
            return Err(NodeError::InsufficientReplicas { needed, got: 0 });
        };

        let remaining: Vec<NodeId> = replicas
            .iter()
            .copied()
            .filter(|id| !attempted.contains(id))
            .collect();
        if !remaining.is_empty() {
            let shared = Arc::new(patch.clone());
            let mut fan_out = self
                .fan_out(ctx, &remaining, |node_id, call_ctx| {
                    dispatch
                        .clone()
                        .merge(call_ctx, node_id, Arc::clone(&shared), true)
                })
                .await?;
            report
                .responded
                .extend(fan_out.answers.iter().map(|(node_id, _)| *node_id));
            report.failed.append(&mut fan_out.failures);
        }

        if report.responded.len() < needed {
            return Err(NodeError::InsufficientReplicas {
                needed,
                got: report.responded.len(),
            });
        }

        let value = patch
            .into_iter()
            .map(|(key, set)| {
                let resolved = target.resolve(&set);
                (key, resolved)
            })
            .collect();
        Ok(Replicated { value, report })
    }

    /// Merge a pre-built patch into every replica of `partition`. With
    /// `broadcast_to_relays` each replica forwards it to its relays without
    /// waiting for them.
    pub async fn merge(
        &self,
        ctx: &RequestContext,
        partition: u64,
        site_id: &str,
        bucket: &str,
        patch: &HashMap<String, SiblingSet>,
        broadcast_to_relays: bool,
    ) -> Result<Replicated<()>> {
        self.ensure_serving()?;
        self.authorize(ctx, bucket, Access::Write)?;
        let replicas = self.replicas(partition)?;

        let dispatch = self.dispatch(partition, site_id, bucket);
        let shared = Arc::new(patch.clone());
        let fan_out = self
            .fan_out(ctx, &replicas, |node_id, call_ctx| {
                dispatch
                    .clone()
                    .merge(call_ctx, node_id, Arc::clone(&shared), broadcast_to_relays)
            })
            .await?;
        let (_, report) = self.check_quorum(&replicas, fan_out, self.config.write_quorum)?;

        Ok(Replicated { value: (), report })
    }

    /// Status of a relay serving `site_id`, answered locally when the relay
    /// is attached here, otherwise by the first replica reporting it
    /// connected.
    pub async fn relay_status(
        &self,
        ctx: &RequestContext,
        site_id: &str,
        relay_id: &str,
    ) -> Result<RelayStatus> {
        self.ensure_running()?;
        if let Ok(status) = self.replica.relay_status(relay_id) {
            return Ok(status);
        }

        let partition = self.partition_of(site_id);
        let client = &self.client;
        let mut fallback = None;
        let mut last_error = None;

        for node_id in self.replicas(partition)? {
            if node_id == self.id() {
                continue;
            }

            let client = Arc::clone(client);
            let (site, relay) = (site_id.to_string(), relay_id.to_string());
            let mut fan_out = self
                .fan_out(ctx, &[node_id], move |node_id, call_ctx| {
                    let client = Arc::clone(&client);
                    let (site, relay) = (site.clone(), relay.clone());
                    async move { client.relay_status(&call_ctx, node_id, &site, &relay).await }
                })
                .await?;

            match fan_out.answers.pop() {
                Some((_, status)) if status.connected => return Ok(status),
                Some((_, status)) => fallback = Some(status),
                None => last_error = fan_out.failures.pop().map(|(_, err)| err),
            }
        }

        match (fallback, last_error) {
            (Some(status), _) => Ok(status),
            (None, Some(err)) => Err(err.into()),
            (None, None) => Err(NodeError::RelayNotFound(relay_id.to_string())),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match self.state() {
            LifecycleState::NotStarted | LifecycleState::Running => Ok(()),
            _ => Err(NodeError::Shutdown),
        }
    }

    fn ensure_serving(&self) -> Result<()> {
        self.ensure_running()?;
        if self.is_decommissioning() {
            return Err(NodeError::Decommissioning);
        }
        Ok(())
    }

    fn authorize(&self, ctx: &RequestContext, bucket: &str, access: Access) -> Result<Arc<Bucket>> {
        let target = self.replica.bucket(bucket)?;
        let client_id = ctx.client_id();
        let allowed = match access {
            Access::Read => target.should_accept_reads(client_id),
            Access::Write => target.should_accept_writes(client_id),
        };

        if !allowed {
            return Err(NodeError::Unauthorized {
                bucket: bucket.to_string(),
                client_id: client_id.to_string(),
                operation: access.verb(),
            });
        }
        Ok(target)
    }

    fn replicas(&self, partition: u64) -> Result<Vec<NodeId>> {
        let replicas = self.partitions.replica_nodes(partition);
        if replicas.is_empty() {
            return Err(NodeError::NoReplicas(partition));
        }
        Ok(replicas)
    }

    fn check_quorum<T>(
        &self,
        replicas: &[NodeId],
        fan_out: FanOut<T>,
        quorum: Quorum,
    ) -> Result<(Vec<(NodeId, T)>, ReplicaReport)> {
        let needed = quorum.required(replicas.len());
        let got = fan_out.answers.len();
        if got < needed {
            return Err(NodeError::InsufficientReplicas { needed, got });
        }

        let report = ReplicaReport {
            replicas: replicas.to_vec(),
            responded: fan_out.answers.iter().map(|(node_id, _)| *node_id).collect(),
            failed: fan_out.failures,
        };
        Ok((fan_out.answers, report))
    }

    fn repair(&self, partition: u64, site_id: &str, bucket: &str, merger: &Arc<NodeReadMerger>) {
        if self.config.read_repair {
            self.repairer
                .begin_repair(partition, site_id, bucket, Arc::clone(merger));
        }
    }

    fn dispatch(&self, partition: u64, site_id: &str, bucket: &str) -> Dispatch<C> {
        Dispatch {
            local_id: self.id(),
            partition,
            site_id: site_id.into(),
            bucket: bucket.into(),
            replica: Arc::clone(&self.replica),
            client: Arc::clone(&self.client),
        }
    }

    /// Run `call` against every node in `replicas` at once, one task per
    /// replica, each under the RPC timeout. Cancelling `ctx` aborts every
    /// task and fails the whole fan-out.
    async fn fan_out<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        replicas: &[NodeId],
        call: F,
    ) -> Result<FanOut<T>>
    where
        T: Send + 'static,
        F: Fn(NodeId, RequestContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, ClientError>> + Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let timeout = self.config.rpc_timeout();
        let tasks: Vec<JoinHandle<std::result::Result<T, ClientError>>> = replicas
            .iter()
            .map(|&node_id| {
                let call_ctx = ctx.clone().timeout(timeout);
                let request = call(node_id, call_ctx.clone());
                tokio::spawn(async move {
                    tokio::select! {
                        result = request => result,
                        err = call_ctx.done() => Err(context_error(err, node_id)),
                    }
                })
            })
            .collect();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        debug!(node_id = self.id(), replicas = ?replicas, "Fanning out");
        let joined = tokio::select! {
            joined = join_all(tasks) => joined,
            err = ctx.done() => {
                for abort in &aborts {
                    abort.abort();
                }
                return Err(err);
            }
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let mut fan_out = FanOut {
            answers: Vec::new(),
            failures: Vec::new(),
        };
        for (&node_id, joined) in replicas.iter().zip(joined) {
            let result = joined.unwrap_or_else(|err| Err(ClientError::Protocol(err.to_string())));
            match result {
                Ok(value) => fan_out.answers.push((node_id, value)),
                Err(err) => {
                    warn!(error = ?err, node_id, "Replica call failed");
                    fan_out.failures.push((node_id, err));
                }
            }
        }
        Ok(fan_out)
    }
}

#[derive(Clone, Copy)]
enum Access {
    Read,
    Write,
}

impl Access {
    fn verb(self) -> &'static str {
        match self {
            Access::Read => "read from",
            Access::Write => "write to",
        }
    }
}

/// Everything a replica task needs, owned so it can move into the task.
struct Dispatch<C> {
    local_id: NodeId,
    partition: u64,
    site_id: Arc<str>,
    bucket: Arc<str>,
    replica: Arc<LocalReplica>,
    client: Arc<C>,
}

impl<C> Clone for Dispatch<C> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id,
            partition: self.partition,
            site_id: Arc::clone(&self.site_id),
            bucket: Arc::clone(&self.bucket),
            replica: Arc::clone(&self.replica),
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: NodeClient> Dispatch<C> {
    async fn get(
        self,
        ctx: RequestContext,
        node_id: NodeId,
        keys: Arc<[String]>,
    ) -> std::result::Result<Vec<SiblingSet>, ClientError> {
        let values = if node_id == self.local_id {
            self.replica
                .get(&self.site_id, &self.bucket, &keys)
                .map_err(|err| err.into_client_error(node_id))?
        } else {
            self.client
                .get(&ctx, node_id, self.partition, &self.site_id, &self.bucket, &keys)
                .await?
        };

        if values.len() != keys.len() {
            return Err(ClientError::Protocol(format!(
                "node {} answered {} values for {} keys",
                node_id,
                values.len(),
                keys.len()
            )));
        }
        Ok(values)
    }

    async fn get_matches(
        self,
        ctx: RequestContext,
        node_id: NodeId,
        prefixes: Arc<[String]>,
    ) -> std::result::Result<Vec<StoredEntry>, ClientError> {
        let mut iter: Box<dyn SiblingSetIterator> = if node_id == self.local_id {
            let local = self
                .replica
                .get_matches(&self.site_id, &self.bucket, &prefixes)
                .map_err(|err| err.into_client_error(node_id))?;
            Box::new(local)
        } else {
            self.client
                .get_matches(&ctx, node_id, self.partition, &self.site_id, &self.bucket, &prefixes)
                .await?
        };

        let mut entries = Vec::new();
        while iter.next() {
            if let Some(err) = ctx.err() {
                iter.release();
                return Err(context_error(err, node_id));
            }
            if let (Some(prefix), Some(key), Some(value)) = (iter.prefix(), iter.key(), iter.value()) {
                entries.push(StoredEntry {
                    prefix: prefix.to_string(),
                    key: key.to_string(),
                    value,
                    local_version: iter.local_version(),
                });
            }
        }

        let error = iter.error();
        iter.release();
        match error {
            Some(err) => Err(err),
            None => Ok(entries),
        }
    }

    async fn batch(
        self,
        ctx: RequestContext,
        node_id: NodeId,
        batch: Arc<UpdateBatch>,
    ) -> std::result::Result<HashMap<String, SiblingSet>, ClientError> {
        if node_id == self.local_id {
            self.replica
                .batch(&self.site_id, &self.bucket, &batch)
                .map_err(|err| err.into_client_error(node_id))
        } else {
            self.client
                .batch(&ctx, node_id, self.partition, &self.site_id, &self.bucket, &batch)
                .await
        }
    }

    async fn merge(
        self,
        ctx: RequestContext,
        node_id: NodeId,
        patch: Arc<HashMap<String, SiblingSet>>,
        broadcast_to_relays: bool,
    ) -> std::result::Result<(), ClientError> {
        if node_id == self.local_id {
            self.replica
                .merge(&self.site_id, &self.bucket, &patch, broadcast_to_relays)
                .map_err(|err| err.into_client_error(node_id))
        } else {
            self.client
                .merge(
                    &ctx,
                    node_id,
                    self.partition,
                    &self.site_id,
                    &self.bucket,
                    &patch,
                    broadcast_to_relays,
                )
                .await
        }
    }
}

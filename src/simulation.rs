use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sdx_cluster::bucket::{DEFAULT_BUCKET, LWW_BUCKET};
use sdx_cluster::{
    BucketList, HashPartitionResolver, LocalReplica, MemoryNetwork, MemoryNodeClient,
    MemoryStorageDriver, Node, NodeConfigBuilder, NodeError, NodeInitializationOptions, NodeId,
    PartitionResolver, ReadRepairer, RequestContext, SiblingSet, Shutdown, StaticMembership, UpdateBatch,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_nodes: usize,
    pub started_at: DateTime<Utc>,
    pub writes: usize,
    pub failed_writes: usize,
    pub reads: usize,
    pub keys_with_siblings: usize,
    pub lagging_before_repair: usize,
    pub lagging_after_repair: usize,
    pub total_time: Duration,
    pub ops_per_second: f64,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Started:                   {:>30} ║", self.started_at.format("%Y-%m-%d %H:%M:%S%.3f"));
        println!("║  Nodes:                     {:>30} ║", self.num_nodes);
        println!("║  Writes (failed):           {:>30} ║", format!("{} ({})", self.writes, self.failed_writes));
        println!("║  Reads:                     {:>30} ║", self.reads);
        println!("║  Keys with siblings:        {:>30} ║", self.keys_with_siblings);
        println!("║  Lagging before repair:     {:>30} ║", self.lagging_before_repair);
        println!("║  Lagging after repair:      {:>30} ║", self.lagging_after_repair);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Operations/Second:         {:>30.0} ║", self.ops_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Nodes sharing one in-memory network, all started.
pub struct SimulatedCluster {
    network: Arc<MemoryNetwork>,
    resolver: Arc<HashPartitionResolver>,
    nodes: Vec<Arc<Node<MemoryNodeClient>>>,
    runners: Vec<JoinHandle<Result<Shutdown, NodeError>>>,
}

impl SimulatedCluster {
    pub fn start(num_nodes: usize, partitions: u64, replication_factor: usize) -> Result<Self, NodeError> {
        let ids: Vec<NodeId> = (1..=num_nodes as NodeId).collect();
        let network = MemoryNetwork::new();
        let resolver = Arc::new(HashPartitionResolver::round_robin(partitions, &ids, replication_factor));
        let membership = Arc::new(StaticMembership::with_members(&ids));

        let mut nodes = Vec::with_capacity(num_nodes);
        let mut runners = Vec::with_capacity(num_nodes);
        for &node_id in &ids {
            let buckets = BucketList::with_defaults(Arc::new(MemoryStorageDriver::new()));
            let replica = Arc::new(LocalReplica::new(node_id, Arc::new(buckets)));
            network.register(Arc::clone(&replica));

            let client = Arc::new(network.client(node_id));
            let config = NodeConfigBuilder::new(node_id).rpc_timeout(500).build();
            let repairer = Arc::new(ReadRepairer::new(
                Arc::clone(&client),
                config.repair_timeout(),
                config.max_concurrent_repairs,
            ));

            let node = Arc::new(Node::new(
                config,
                resolver.clone(),
                replica,
                client,
                membership.clone(),
                repairer,
            )?);
            let runner = Arc::clone(&node);
            runners.push(tokio::spawn(async move {
                runner.start(NodeInitializationOptions::default()).await
            }));
            nodes.push(node);
        }

        Ok(Self {
            network,
            resolver,
            nodes,
            runners,
        })
    }

    pub fn node(&self, index: usize) -> &Arc<Node<MemoryNodeClient>> {
        &self.nodes[index % self.nodes.len()]
    }

    pub async fn put(&self, via: usize, site_id: &str, bucket: &str, key: &str, value: &[u8]) -> Result<(), NodeError> {
        let node = self.node(via);
        let mut batch = UpdateBatch::new();
        batch.put(key, value);
        let ctx = RequestContext::with_timeout(Duration::from_secs(2));
        node.batch(&ctx, node.partition_of(site_id), site_id, bucket, &batch)
            .await
            .map(|_| ())
    }

    pub async fn read(&self, via: usize, site_id: &str, bucket: &str, key: &str) -> Result<SiblingSet, NodeError> {
        let node = self.node(via);
        let ctx = RequestContext::with_timeout(Duration::from_secs(2));
        let mut values = node
            .get(&ctx, node.partition_of(site_id), site_id, bucket, &[key.to_string()])
            .await?
            .into_inner();
        Ok(values.pop().unwrap_or_default())
    }

    /// Replicas of `site_id`'s partition.
    pub fn replicas_of(&self, site_id: &str) -> Vec<NodeId> {
        self.resolver.replica_nodes(self.resolver.partition(site_id))
    }

    /// Number of replicas of `site_id` whose stored value for `key` differs
    /// from the merge of every replica.
    pub fn lagging_replicas(&self, site_id: &str, bucket: &str, key: &str) -> usize {
        let stored: Vec<SiblingSet> = self
            .replicas_of(site_id)
            .into_iter()
            .map(|node_id| {
                self.nodes[(node_id - 1) as usize]
                    .replica()
                    .get(site_id, bucket, &[key.to_string()])
                    .ok()
                    .and_then(|mut values| values.pop())
                    .unwrap_or_default()
            })
            .collect();
        let merged = stored
            .iter()
            .fold(SiblingSet::new(), |acc, set| acc.merge(set));
        stored.iter().filter(|set| **set != merged).count()
    }

    pub fn set_down(&self, node_id: NodeId, down: bool) {
        self.network.set_down(node_id, down);
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.stop();
        }
        for runner in self.runners {
            match runner.await {
                Ok(Ok(outcome)) => debug!(outcome = ?outcome, "Node stopped"),
                Ok(Err(err)) => warn!(error = ?err, "Node exited with error"),
                Err(err) => warn!(error = ?err, "Node task failed"),
            }
        }
    }
}

/// A single client write in the generated workload.
#[derive(Clone, Debug)]
struct Write {
    via: usize,
    site_id: String,
    bucket: &'static str,
    key: String,
    value: Vec<u8>,
}

/// Generator that yields writes spread over coordinators, sites and keys
fn workload_generator(num_nodes: usize, num_sites: usize, num_keys: usize, num_writes: usize) -> impl Stream<Item = Write> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for i in 0..num_writes {
            let bucket = if rng.gen_bool(0.25) { LWW_BUCKET } else { DEFAULT_BUCKET };
            yield Write {
                via: rng.gen_range(0..num_nodes),
                site_id: format!("site-{}", rng.gen_range(0..num_sites)),
                bucket,
                key: format!("key-{}", rng.gen_range(0..num_keys)),
                value: format!("value-{}", i).into_bytes(),
            };
        }
    }
}

/// Concurrent writes through random coordinators, then reads through others,
/// then a partitioned node brought back by read repair.
pub async fn run_simulation(
    num_nodes: usize,
    num_writes: usize,
    concurrency: usize,
) -> Result<SimulationStats, NodeError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Cluster Simulation (Async)                          ║");
    println!("║  Nodes: {} | Writes: {} | Concurrency: {} ║", num_nodes, num_writes, concurrency);
    println!("╚════════════════════════════════════════════════════════════╝");

    let started_at = Utc::now();
    let start = Instant::now();
    let num_sites = 4;
    let num_keys = 16;

    let cluster = Arc::new(SimulatedCluster::start(num_nodes, 16, num_nodes.min(3))?);

    println!("\n[Phase 1/3] Writing through random coordinators...");

    let outcomes: Vec<bool> = workload_generator(num_nodes, num_sites, num_keys, num_writes)
        .map(|write| {
            let cluster = Arc::clone(&cluster);
            async move {
                match cluster
                    .put(write.via, &write.site_id, write.bucket, &write.key, &write.value)
                    .await
                {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(error = ?err, key = %write.key, "Write failed");
                        false
                    }
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    let failed_writes = outcomes.iter().filter(|ok| !**ok).count();

    println!("[Phase 1/3] ✓ Completed");
    println!("[Phase 2/3] Reading back through other coordinators...");

    let mut reads = 0;
    let mut keys_with_siblings = 0;
    for site in 0..num_sites {
        let site_id = format!("site-{}", site);
        for key in 0..num_keys {
            let key = format!("key-{}", key);
            let value = cluster.read(site + 1, &site_id, DEFAULT_BUCKET, &key).await?;
            reads += 1;
            if value.len() > 1 {
                keys_with_siblings += 1;
            }
        }
    }

    println!("[Phase 2/3] ✓ Completed");
    println!("[Phase 3/3] Partitioning a node and repairing it on read...");

    let site_id = "site-repair";
    let coordinator = cluster.node(0).id();
    let lagging_node = cluster
        .replicas_of(site_id)
        .into_iter()
        .rev()
        .find(|&node_id| node_id != coordinator);
    if let Some(node_id) = lagging_node {
        cluster.set_down(node_id, true);
    }
    for i in 0..num_keys {
        let key = format!("repair-{}", i);
        cluster.put(0, site_id, DEFAULT_BUCKET, &key, b"fresh").await?;
    }
    if let Some(node_id) = lagging_node {
        cluster.set_down(node_id, false);
    }

    let lagging_before_repair = count_lagging(&cluster, site_id, num_keys);
    for i in 0..num_keys {
        let key = format!("repair-{}", i);
        cluster.read(1, site_id, DEFAULT_BUCKET, &key).await?;
        reads += 1;
    }
    let lagging_after_repair = wait_for_repair(&cluster, site_id, num_keys).await;

    println!("[Phase 3/3] ✓ Completed");

    let total_time = start.elapsed();
    let writes = num_writes + num_keys;
    let ops_per_second = (writes + reads) as f64 / total_time.as_secs_f64();
    info!(writes, reads, failed_writes, lagging_after_repair, "Simulation finished");

    if let Ok(cluster) = Arc::try_unwrap(cluster) {
        cluster.shutdown().await;
    }

    Ok(SimulationStats {
        num_nodes,
        started_at,
        writes,
        failed_writes,
        reads,
        keys_with_siblings,
        lagging_before_repair,
        lagging_after_repair,
        total_time,
        ops_per_second,
    })
}

fn count_lagging(cluster: &SimulatedCluster, site_id: &str, num_keys: usize) -> usize {
    (0..num_keys)
        .map(|i| cluster.lagging_replicas(site_id, DEFAULT_BUCKET, &format!("repair-{}", i)))
        .sum()
}

/// Repairs run in the background; poll until they land or give up.
async fn wait_for_repair(cluster: &SimulatedCluster, site_id: &str, num_keys: usize) -> usize {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let lagging = count_lagging(cluster, site_id, num_keys);
        if lagging == 0 || Instant::now() >= deadline {
            return lagging;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Simulations at increasing cluster sizes
pub async fn run_scaling(max_nodes: usize, step_size: usize) -> Result<(), NodeError> {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Throughput vs Cluster Size        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_nodes = step_size;
    while current_nodes <= max_nodes {
        let stats = run_simulation(current_nodes, current_nodes * 100, 16).await?;
        stats.print();
        current_nodes += step_size;
    }
    Ok(())
}

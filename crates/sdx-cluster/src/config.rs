//! Node and cluster configuration.

use crate::bucket::{Bucket, BucketList, BucketPolicy};
use crate::error::ConfigError;
use crate::partition::HashPartitionResolver;
use crate::storage::StorageDriver;
use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Minimum number of replicas that must answer for an operation to succeed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    One,
    #[default]
    Majority,
    All,
    Exactly(usize),
}

impl Quorum {
    /// Answers required out of `replicas`. Never more than `replicas`, and
    /// at least one when there is any replica.
    pub fn required(self, replicas: usize) -> usize {
        let needed = match self {
            Quorum::One => 1,
            Quorum::Majority => replicas / 2 + 1,
            Quorum::All => replicas,
            Quorum::Exactly(n) => n.max(1),
        };
        needed.min(replicas)
    }
}

/// Configuration of one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub read_quorum: Quorum,
    pub write_quorum: Quorum,
    /// Timeout of a single replica call (in milliseconds).
    pub rpc_timeout_ms: u64,
    /// Timeout of a single repair merge (in milliseconds).
    pub repair_timeout_ms: u64,
    /// Repairs allowed in flight at once.
    pub max_concurrent_repairs: usize,
    /// Push merged values back to lagging replicas after reads.
    pub read_repair: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            read_quorum: Quorum::Majority,
            write_quorum: Quorum::Majority,
            rpc_timeout_ms: 5000,
            repair_timeout_ms: 10_000,
            max_concurrent_repairs: 64,
            read_repair: true,
        }
    }
}

impl NodeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn repair_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_timeout_ms)
    }
}

/// Builder for node configuration.
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            config: NodeConfig {
                node_id,
                ..NodeConfig::default()
            },
        }
    }

    pub fn read_quorum(mut self, quorum: Quorum) -> Self {
        self.config.read_quorum = quorum;
        self
    }

    pub fn write_quorum(mut self, quorum: Quorum) -> Self {
        self.config.write_quorum = quorum;
        self
    }

    pub fn rpc_timeout(mut self, ms: u64) -> Self {
        self.config.rpc_timeout_ms = ms;
        self
    }

    pub fn repair_timeout(mut self, ms: u64) -> Self {
        self.config.repair_timeout_ms = ms;
        self
    }

    pub fn max_concurrent_repairs(mut self, max: usize) -> Self {
        self.config.max_concurrent_repairs = max;
        self
    }

    pub fn read_repair(mut self, enabled: bool) -> Self {
        self.config.read_repair = enabled;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

/// Cluster-wide topology and bucket policies, shared by every node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub partitions: u64,
    #[serde(default)]
    pub replicas: BTreeMap<u64, Vec<NodeId>>,
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketPolicy>,
}

impl ClusterConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClusterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::Invalid("partitions must be positive".into()));
        }

        for (partition, nodes) in &self.replicas {
            if *partition >= self.partitions {
                return Err(ConfigError::Invalid(format!(
                    "partition {} is out of range 0..{}",
                    partition, self.partitions
                )));
            }
            let mut distinct = nodes.clone();
            distinct.sort_unstable();
            distinct.dedup();
            if distinct.len() != nodes.len() {
                return Err(ConfigError::Invalid(format!(
                    "partition {} lists a replica twice",
                    partition
                )));
            }
        }

        Ok(())
    }

    pub fn partition_resolver(&self) -> HashPartitionResolver {
        HashPartitionResolver::new(self.partitions, self.replicas.clone())
    }

    /// The built-in buckets, plus or overridden by the configured ones.
    pub fn buckets(&self, store: Arc<dyn StorageDriver>) -> BucketList {
        let mut list = BucketList::with_defaults(Arc::clone(&store));
        for (name, policy) in &self.buckets {
            list.add(Bucket::new(name.clone(), policy.clone(), Arc::clone(&store)));
        }
        list
    }
}

//! Partition routing.
//!
//! A partitioning key (a site ID) maps to a partition through a stable hash.
//! Every node must compute the same partition for the same key, so the hash
//! is SHA-256 rather than anything seeded per process.

use crate::NodeId;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub trait PartitionResolver: Send + Sync {
    fn partition(&self, partitioning_key: &str) -> u64;

    /// Replica nodes of a partition, preferred replica first. Empty when
    /// the partition is unknown.
    fn replica_nodes(&self, partition: u64) -> Vec<NodeId>;
}

/// Hash routing over a fixed partition count with an explicit placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashPartitionResolver {
    partitions: u64,
    placement: BTreeMap<u64, Vec<NodeId>>,
}

impl HashPartitionResolver {
    pub fn new(partitions: u64, placement: BTreeMap<u64, Vec<NodeId>>) -> Self {
        Self {
            partitions: partitions.max(1),
            placement,
        }
    }

    /// Place each partition on `replication_factor` consecutive nodes,
    /// starting at the node whose index equals the partition number.
    pub fn round_robin(partitions: u64, nodes: &[NodeId], replication_factor: usize) -> Self {
        let placement = if nodes.is_empty() {
            BTreeMap::new()
        } else {
            let factor = replication_factor.min(nodes.len());
            (0..partitions)
                .map(|partition| {
                    let first = (partition % nodes.len() as u64) as usize;
                    let replicas = (0..factor)
                        .map(|offset| nodes[(first + offset) % nodes.len()])
                        .collect();
                    (partition, replicas)
                })
                .collect()
        };

        Self::new(partitions, placement)
    }

    pub fn partitions(&self) -> u64 {
        self.partitions
    }

    pub fn placement(&self) -> &BTreeMap<u64, Vec<NodeId>> {
        &self.placement
    }
}

impl PartitionResolver for HashPartitionResolver {
    fn partition(&self, partitioning_key: &str) -> u64 {
        key_hash(partitioning_key) % self.partitions
    }

    fn replica_nodes(&self, partition: u64) -> Vec<NodeId> {
        self.placement.get(&partition).cloned().unwrap_or_default()
    }
}

/// First eight bytes of the SHA-256 digest, big-endian.
pub fn key_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_deterministic() {
        let a = HashPartitionResolver::round_robin(64, &[1, 2, 3], 3);
        let b = HashPartitionResolver::round_robin(64, &[1, 2, 3], 3);

        for site in ["site1", "site2", "a-much-longer-site-identifier"] {
            assert_eq!(a.partition(site), b.partition(site));
            assert!(a.partition(site) < 64);
        }
    }

    #[test]
    fn test_round_robin_placement() {
        let resolver = HashPartitionResolver::round_robin(4, &[10, 20, 30], 2);

        assert_eq!(resolver.replica_nodes(0), vec![10, 20]);
        assert_eq!(resolver.replica_nodes(1), vec![20, 30]);
        assert_eq!(resolver.replica_nodes(2), vec![30, 10]);
        assert_eq!(resolver.replica_nodes(3), vec![10, 20]);
    }

    #[test]
    fn test_replication_factor_is_capped() {
        let resolver = HashPartitionResolver::round_robin(1, &[1, 2], 5);
        assert_eq!(resolver.replica_nodes(0), vec![1, 2]);
    }

    #[test]
    fn test_unknown_partition_has_no_replicas() {
        let resolver = HashPartitionResolver::round_robin(2, &[], 3);
        assert!(resolver.replica_nodes(0).is_empty());
        assert!(resolver.replica_nodes(99).is_empty());
    }

    #[test]
    fn test_zero_partitions_does_not_divide_by_zero() {
        let resolver = HashPartitionResolver::new(0, BTreeMap::new());
        assert_eq!(resolver.partitions(), 1);
        assert_eq!(resolver.partition("site1"), 0);
    }
}

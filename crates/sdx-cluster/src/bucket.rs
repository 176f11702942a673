//! Buckets: named keyspaces with a replication and access policy.
//!
//! A bucket composes a conflict resolver and a storage handle. Its four
//! predicates decide, per peer or client, whether data may flow in or out
//! and whether reads and writes are accepted.

use crate::batch::UpdateBatch;
use crate::error::StorageError;
use crate::storage::{StorageDriver, StoredEntry};
use sdx_core::{ConflictResolver, ResolverKind, SiblingSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub const DEFAULT_BUCKET: &str = "default";
pub const LWW_BUCKET: &str = "lww";
pub const CLOUD_BUCKET: &str = "cloud";
pub const LOCAL_BUCKET: &str = "local";

/// Peer ID of the cloud service relays replicate with.
pub const CLOUD_PEER: &str = "cloud";

/// Which peers or clients a predicate admits.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eligibility {
    #[default]
    All,
    Nobody,
    Only(Vec<String>),
}

impl Eligibility {
    pub fn allows(&self, id: &str) -> bool {
        match self {
            Eligibility::All => true,
            Eligibility::Nobody => false,
            Eligibility::Only(ids) => ids.iter().any(|allowed| allowed == id),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketPolicy {
    pub resolver: ResolverKind,
    pub replicate_outgoing: Eligibility,
    pub replicate_incoming: Eligibility,
    pub accept_writes: Eligibility,
    pub accept_reads: Eligibility,
}

impl BucketPolicy {
    /// Multi-value, open to everyone.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn last_writer_wins() -> Self {
        Self {
            resolver: ResolverKind::LastWriterWins,
            ..Self::default()
        }
    }

    /// Written only by the cloud, read by anyone, never sent upstream.
    pub fn cloud() -> Self {
        Self {
            replicate_outgoing: Eligibility::Nobody,
            replicate_incoming: Eligibility::Only(vec![CLOUD_PEER.to_string()]),
            accept_writes: Eligibility::Nobody,
            ..Self::default()
        }
    }

    /// Never leaves the node it was written on.
    pub fn local() -> Self {
        Self {
            replicate_outgoing: Eligibility::Nobody,
            replicate_incoming: Eligibility::Nobody,
            ..Self::default()
        }
    }
}

pub struct Bucket {
    name: String,
    policy: BucketPolicy,
    resolver: Arc<dyn ConflictResolver>,
    store: Arc<dyn StorageDriver>,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("resolver", &self.resolver.name())
            .finish()
    }
}

impl Bucket {
    pub fn new(name: impl Into<String>, policy: BucketPolicy, store: Arc<dyn StorageDriver>) -> Self {
        Self {
            name: name.into(),
            resolver: policy.resolver.resolver(),
            policy,
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &Arc<dyn ConflictResolver> {
        &self.resolver
    }

    pub fn should_replicate_outgoing(&self, peer_id: &str) -> bool {
        self.policy.replicate_outgoing.allows(peer_id)
    }

    pub fn should_replicate_incoming(&self, peer_id: &str) -> bool {
        self.policy.replicate_incoming.allows(peer_id)
    }

    pub fn should_accept_writes(&self, client_id: &str) -> bool {
        self.policy.accept_writes.allows(client_id)
    }

    pub fn should_accept_reads(&self, client_id: &str) -> bool {
        self.policy.accept_reads.allows(client_id)
    }

    /// What a caller gets to see of a merged value.
    pub fn resolve(&self, set: &SiblingSet) -> SiblingSet {
        self.resolver.resolve(set)
    }

    pub fn get(&self, site_id: &str, keys: &[String]) -> Result<Vec<SiblingSet>, StorageError> {
        self.store.get(&self.name, site_id, keys)
    }

    pub fn get_matches(
        &self,
        site_id: &str,
        prefixes: &[String],
    ) -> Result<Vec<StoredEntry>, StorageError> {
        self.store.get_matches(&self.name, site_id, prefixes)
    }

    pub fn batch(
        &self,
        site_id: &str,
        node_id: &str,
        batch: &UpdateBatch,
        timestamp: u64,
    ) -> Result<HashMap<String, SiblingSet>, StorageError> {
        self.store.apply(&self.name, site_id, node_id, batch, timestamp)
    }

    pub fn merge(
        &self,
        site_id: &str,
        patch: &HashMap<String, SiblingSet>,
    ) -> Result<(), StorageError> {
        self.store.merge(&self.name, site_id, patch)
    }
}

/// Name-indexed bucket registry. Built once, then shared read-only.
#[derive(Debug, Default)]
pub struct BucketList {
    buckets: BTreeMap<String, Arc<Bucket>>,
}

impl BucketList {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in buckets over one store.
    pub fn with_defaults(store: Arc<dyn StorageDriver>) -> Self {
        let mut list = Self::new();
        list.add(Bucket::new(DEFAULT_BUCKET, BucketPolicy::open(), store.clone()));
        list.add(Bucket::new(LWW_BUCKET, BucketPolicy::last_writer_wins(), store.clone()));
        list.add(Bucket::new(CLOUD_BUCKET, BucketPolicy::cloud(), store.clone()));
        list.add(Bucket::new(LOCAL_BUCKET, BucketPolicy::local(), store));
        list
    }

    pub fn add(&mut self, bucket: Bucket) {
        self.buckets.insert(bucket.name.clone(), Arc::new(bucket));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bucket>> {
        self.buckets.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.buckets.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Bucket>> {
        self.buckets.values()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

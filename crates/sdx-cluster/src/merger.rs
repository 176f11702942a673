//! Accumulates replica answers for one logical read.
//!
//! Fan-out workers insert what each replica returned for each key. Readers
//! see the merge of every contribution so far, and the repairer uses the
//! per-node answers to work out which replicas lag behind.

use crate::NodeId;
use parking_lot::Mutex;
use sdx_core::SiblingSet;
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default)]
struct MergeState {
    merged: BTreeMap<String, SiblingSet>,
    replicas: BTreeMap<NodeId, HashMap<String, SiblingSet>>,
}

/// Scoped to a single read. Safe to read while contributions arrive; a key
/// nobody has contributed yet reads as absent.
#[derive(Debug, Default)]
pub struct NodeReadMerger {
    state: Mutex<MergeState>,
}

impl NodeReadMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` answered, even if it returned no keys.
    pub fn insert_node(&self, node_id: NodeId) {
        self.state.lock().replicas.entry(node_id).or_default();
    }

    /// Fold one replica's value for `key` into the merged view.
    pub fn insert_key_replica(&self, node_id: NodeId, key: &str, set: SiblingSet) {
        let mut state = self.state.lock();

        let merged = state.merged.entry(key.to_string()).or_default();
        *merged = merged.merge(&set);

        let answers = state.replicas.entry(node_id).or_default();
        let held = answers.entry(key.to_string()).or_default();
        *held = held.merge(&set);
    }

    pub fn get(&self, key: &str) -> Option<SiblingSet> {
        self.state.lock().merged.get(key).cloned()
    }

    /// Merged values `node_id` is missing something of. A key the node did
    /// not return counts as empty on that node.
    pub fn patch(&self, node_id: NodeId) -> HashMap<String, SiblingSet> {
        let state = self.state.lock();
        let empty = HashMap::new();
        let answers = state.replicas.get(&node_id).unwrap_or(&empty);

        state
            .merged
            .iter()
            .filter(|(key, merged)| {
                let held = answers.get(key.as_str()).cloned().unwrap_or_default();
                !merged.diff(&held).is_empty()
            })
            .map(|(key, merged)| (key.clone(), merged.clone()))
            .collect()
    }

    /// Nodes that answered, ascending.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.state.lock().replicas.keys().copied().collect()
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.state.lock().merged.keys().cloned().collect()
    }
}

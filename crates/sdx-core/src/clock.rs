//! Causal clocks for sibling tracking.
//!
//! Every write produces a [`Dot`], the pair of the node that accepted the
//! write and that node's event counter. A [`VersionVector`] summarizes the
//! dots a write had observed when it was made, by keeping the highest counter
//! seen from each node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The unique event that produced a sibling.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    pub node_id: String,
    pub counter: u64,
}

impl Dot {
    pub fn new(node_id: impl Into<String>, counter: u64) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
        }
    }
}

impl fmt::Display for Dot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.counter)
    }
}

/// A version vector tracking the frontier of seen events per node.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionVector {
    /// Map from node ID to highest seen counter.
    entries: BTreeMap<String, u64>,
}

impl VersionVector {
    /// Create an empty version vector.
    pub fn new() -> Self {
        VersionVector {
            entries: BTreeMap::new(),
        }
    }

    /// Create a version vector from entries. Zero counters are skipped.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, u64)>) -> Self {
        VersionVector {
            entries: entries.into_iter().filter(|(_, seq)| *seq > 0).collect(),
        }
    }

    /// Get the counter for a node.
    pub fn get(&self, node_id: &str) -> u64 {
        self.entries.get(node_id).copied().unwrap_or(0)
    }

    /// Set the counter for a node.
    pub fn set(&mut self, node_id: impl Into<String>, counter: u64) {
        let node_id = node_id.into();
        if counter > 0 {
            self.entries.insert(node_id, counter);
        } else {
            self.entries.remove(&node_id);
        }
    }

    /// Increment the counter for a node, returning the new value.
    pub fn increment(&mut self, node_id: impl Into<String>) -> u64 {
        let entry = self.entries.entry(node_id.into()).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Returns true if for all nodes, self[n] >= other[n].
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(node_id, &seq)| self.get(node_id) >= seq)
    }

    /// Check if this vector is strictly greater than another.
    pub fn strictly_dominates(&self, other: &VersionVector) -> bool {
        self.dominates(other) && self != other
    }

    /// Check if two vectors are concurrent (neither dominates the other).
    pub fn is_concurrent_with(&self, other: &VersionVector) -> bool {
        !self.dominates(other) && !other.dominates(self)
    }

    /// Merge with another version vector (component-wise max).
    pub fn merge(&mut self, other: &VersionVector) {
        for (node_id, &seq) in &other.entries {
            let current = self.entries.entry(node_id.clone()).or_insert(0);
            *current = (*current).max(seq);
        }
    }

    /// Create a merged version vector without modifying self.
    pub fn merged_with(&self, other: &VersionVector) -> VersionVector {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    /// Record a single dot.
    pub fn observe(&mut self, dot: &Dot) {
        let current = self.entries.entry(dot.node_id.clone()).or_insert(0);
        *current = (*current).max(dot.counter);
    }

    /// Check if a specific (node_id, counter) pair is included.
    pub fn contains(&self, node_id: &str, counter: u64) -> bool {
        self.get(node_id) >= counter
    }

    /// Check if a dot is included.
    pub fn contains_dot(&self, dot: &Dot) -> bool {
        self.contains(&dot.node_id, dot.counter)
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.entries.iter()
    }

    /// Get the number of nodes tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the version vector is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

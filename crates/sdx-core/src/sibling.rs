//! Sibling sets
//!
//! A [`SiblingSet`] holds every version of a key that is still causally
//! relevant. Each [`Sibling`] is tagged with the [`Dot`] of the write that
//! produced it and the causal context that write had observed. When two
//! sets are reconciled, the union of their siblings is taken and every
//! sibling that another sibling has already observed is dropped, leaving
//! only pairwise-concurrent versions.

use crate::clock::{Dot, VersionVector};
use crate::lattice::Lattice;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// One concurrently-valid version of a key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sibling {
    dot: Dot,
    context: VersionVector,
    value: Option<Vec<u8>>,
    timestamp: u64,
}

impl Sibling {
    pub fn new(dot: Dot, context: VersionVector, value: Vec<u8>, timestamp: u64) -> Self {
        Self {
            dot,
            context,
            value: Some(value),
            timestamp,
        }
    }

    /// A deletion marker. It takes part in merges like any other sibling so
    /// the delete can supersede the versions it observed.
    pub fn tombstone(dot: Dot, context: VersionVector, timestamp: u64) -> Self {
        Self {
            dot,
            context,
            value: None,
            timestamp,
        }
    }

    pub fn dot(&self) -> &Dot {
        &self.dot
    }

    pub fn context(&self) -> &VersionVector {
        &self.context
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_deleted(&self) -> bool {
        self.value.is_none()
    }

    /// The full causal history of this sibling: its context plus its own dot.
    pub fn clock(&self) -> VersionVector {
        let mut clock = self.context.clone();
        clock.observe(&self.dot);
        clock
    }

    /// True when `other` was written with knowledge of this sibling.
    pub fn happened_before(&self, other: &Sibling) -> bool {
        self.dot != other.dot && other.context.contains_dot(&self.dot)
    }
}

/// The conflict-tracked value of one key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SiblingSet {
    siblings: BTreeMap<Dot, Sibling>,
}

// Serialized as a plain list; dots are not valid JSON object keys.
impl Serialize for SiblingSet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let siblings: Vec<&Sibling> = self.siblings.values().collect();
        siblings.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SiblingSet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let siblings: Vec<Sibling> = Vec::deserialize(deserializer)?;
        Ok(Self::from_siblings(siblings))
    }
}

impl SiblingSet {
    /// Create an empty sibling set
    pub fn new() -> Self {
        Self {
            siblings: BTreeMap::new(),
        }
    }

    /// Build a set from arbitrary siblings, discarding the dominated ones.
    /// Survivors absorb the clocks of the siblings they observed, so a
    /// context that skips an ancestor is widened before anything is dropped.
    pub fn from_siblings(siblings: impl IntoIterator<Item = Sibling>) -> Self {
        let mut union = BTreeMap::new();
        for sibling in siblings {
            insert_sibling(&mut union, sibling);
        }
        Self {
            siblings: frontier(union),
        }
    }

    /// Reconcile two sets. Commutative, associative and idempotent; the
    /// empty set is the identity.
    pub fn merge(&self, other: &SiblingSet) -> SiblingSet {
        let mut union = self.siblings.clone();
        for sibling in other.siblings.values() {
            insert_sibling(&mut union, sibling.clone());
        }
        Self {
            siblings: frontier(union),
        }
    }

    /// Component-wise max of every sibling clock. This is the context a new
    /// write must carry to supersede everything in the set.
    pub fn join_clock(&self) -> VersionVector {
        self.siblings
            .values()
            .fold(VersionVector::new(), |mut clock, sibling| {
                clock.merge(&sibling.clock());
                clock
            })
    }

    /// The set produced by writing `value` (`None` deletes) at `node_id`.
    /// The new sibling observes and therefore replaces every current one.
    pub fn event(&self, node_id: &str, timestamp: u64, value: Option<Vec<u8>>) -> SiblingSet {
        let context = self.join_clock();
        let dot = Dot::new(node_id, context.get(node_id) + 1);
        let sibling = match value {
            Some(value) => Sibling::new(dot, context, value, timestamp),
            None => Sibling::tombstone(dot, context, timestamp),
        };

        self.merge(&SiblingSet::from_siblings([sibling]))
    }

    /// Siblings of `self` that `other` neither holds nor has superseded.
    /// An empty diff means merging `self` into `other` changes nothing.
    pub fn diff(&self, other: &SiblingSet) -> SiblingSet {
        let siblings = self
            .siblings
            .iter()
            .filter(|(dot, sibling)| {
                !other.siblings.contains_key(*dot)
                    && !other.siblings.values().any(|o| sibling.happened_before(o))
            })
            .map(|(dot, sibling)| (dot.clone(), sibling.clone()))
            .collect();

        Self { siblings }
    }

    /// True when `other` has observed everything in `self` and holds
    /// something `self` lacks.
    pub fn is_behind(&self, other: &SiblingSet) -> bool {
        self.diff(other).is_empty() && !other.diff(self).is_empty()
    }

    pub fn contains_dot(&self, dot: &Dot) -> bool {
        self.siblings.contains_key(dot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sibling> {
        self.siblings.values()
    }

    /// Values of every live (non-deleted) sibling, in dot order.
    pub fn values(&self) -> Vec<&[u8]> {
        self.siblings.values().filter_map(Sibling::value).collect()
    }

    /// True when every sibling is a deletion marker. The empty set is not a
    /// tombstone set.
    pub fn is_tombstone_set(&self) -> bool {
        !self.siblings.is_empty() && self.siblings.values().all(Sibling::is_deleted)
    }

    pub fn is_empty(&self) -> bool {
        self.siblings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.siblings.len()
    }
}

impl FromIterator<Sibling> for SiblingSet {
    fn from_iter<I: IntoIterator<Item = Sibling>>(iter: I) -> Self {
        Self::from_siblings(iter)
    }
}

impl Lattice for SiblingSet {
    fn bottom() -> Self {
        Self::new()
    }

    fn join(&self, other: &Self) -> Self {
        self.merge(other)
    }
}

// Dots are unique per write, so a collision only happens when the same
// sibling arrives twice, possibly with a context widened by an earlier
// merge. The greater copy is kept and the two contexts are joined, so the
// union does not depend on argument order.
fn insert_sibling(union: &mut BTreeMap<Dot, Sibling>, sibling: Sibling) {
    match union.get_mut(&sibling.dot) {
        Some(existing) => {
            let context = existing.context.merged_with(&sibling.context);
            if sibling > *existing {
                *existing = sibling;
            }
            existing.context = context;
        }
        None => {
            union.insert(sibling.dot.clone(), sibling);
        }
    }
}

// A sibling that observed another also observed everything that one did.
// Folding the observed clocks in keeps dominance transitive once the
// intermediate sibling is dropped, which merge associativity relies on.
fn close_contexts(union: &mut BTreeMap<Dot, Sibling>) {
    loop {
        let clocks: Vec<(Dot, VersionVector)> = union
            .values()
            .map(|sibling| (sibling.dot.clone(), sibling.clock()))
            .collect();

        let mut changed = false;
        for sibling in union.values_mut() {
            for (dot, clock) in &clocks {
                if *dot != sibling.dot
                    && sibling.context.contains_dot(dot)
                    && !sibling.context.dominates(clock)
                {
                    sibling.context.merge(clock);
                    changed = true;
                }
            }
        }

        if !changed {
            return;
        }
    }
}

fn frontier(mut union: BTreeMap<Dot, Sibling>) -> BTreeMap<Dot, Sibling> {
    close_contexts(&mut union);

    let dominated: Vec<Dot> = union
        .values()
        .filter(|sibling| union.values().any(|other| sibling.happened_before(other)))
        .map(|sibling| sibling.dot.clone())
        .collect();

    for dot in dominated {
        union.remove(&dot);
    }
    union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sibling(node: &str, counter: u64, context: &[(&str, u64)], value: &str) -> Sibling {
        Sibling::new(
            Dot::new(node, counter),
            VersionVector::from_entries(context.iter().map(|(n, c)| (n.to_string(), *c))),
            value.as_bytes().to_vec(),
            counter,
        )
    }

    #[test]
    fn test_merge_keeps_concurrent_siblings() {
        let a = SiblingSet::from_siblings([sibling("n1", 1, &[], "A")]);
        let b = SiblingSet::from_siblings([sibling("n2", 1, &[], "B")]);

        let merged = a.merge(&b);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.values(), vec![b"A".as_slice(), b"B".as_slice()]);
    }

    #[test]
    fn test_merge_drops_dominated_sibling() {
        let v1 = SiblingSet::from_siblings([sibling("n1", 1, &[], "old")]);
        let v2 = SiblingSet::from_siblings([sibling("n2", 1, &[("n1", 1)], "new")]);

        assert_eq!(v1.merge(&v2), v2);
        assert_eq!(v2.merge(&v1), v2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = SiblingSet::from_siblings([
            sibling("n1", 1, &[], "A"),
            sibling("n2", 1, &[], "B"),
        ]);
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn test_from_siblings_enforces_frontier() {
        let set = SiblingSet::from_siblings([
            sibling("n1", 1, &[], "old"),
            sibling("n1", 2, &[("n1", 1)], "new"),
            sibling("n2", 1, &[], "other"),
        ]);

        assert_eq!(set.len(), 2);
        assert!(!set.contains_dot(&Dot::new("n1", 1)));
    }

    #[test]
    fn test_merge_is_associative_across_a_causal_chain() {
        // z observed y and y observed x, but z's context never names x
        let x = SiblingSet::from_siblings([sibling("n1", 1, &[], "x")]);
        let y = SiblingSet::from_siblings([sibling("n2", 1, &[("n1", 1)], "y")]);
        let z = SiblingSet::from_siblings([sibling("n3", 1, &[("n2", 1)], "z")]);

        let left = x.merge(&y).merge(&z);
        let right = x.merge(&y.merge(&z));
        let at_once = SiblingSet::from_siblings([
            sibling("n1", 1, &[], "x"),
            sibling("n2", 1, &[("n1", 1)], "y"),
            sibling("n3", 1, &[("n2", 1)], "z"),
        ]);
        assert_eq!(left, right);
        assert_eq!(left, at_once);

        assert_eq!(left.values(), vec![b"z".as_slice()]);
        let survivor = left.iter().next().unwrap();
        assert!(survivor.context().contains_dot(&Dot::new("n1", 1)));
    }

    #[test]
    fn test_same_dot_with_wider_context_merges_either_way() {
        let narrow = SiblingSet::from_siblings([sibling("n3", 1, &[("n2", 1)], "z")]);
        let wide = SiblingSet::from_siblings([sibling("n3", 1, &[("n1", 1), ("n2", 1)], "z")]);

        assert_eq!(narrow.merge(&wide), wide.merge(&narrow));
        assert_eq!(narrow.merge(&wide), wide);

        let x = SiblingSet::from_siblings([sibling("n1", 1, &[], "x")]);
        assert_eq!(x.merge(&narrow).merge(&wide), x.merge(&narrow.merge(&wide)));
    }

    #[test]
    fn test_event_supersedes_current_siblings() {
        let set = SiblingSet::from_siblings([
            sibling("n1", 1, &[], "A"),
            sibling("n2", 1, &[], "B"),
        ]);

        let written = set.event("n1", 10, Some(b"C".to_vec()));
        assert_eq!(written.len(), 1);
        assert_eq!(written.values(), vec![b"C".as_slice()]);

        let dot = written.iter().next().unwrap().dot().clone();
        assert_eq!(dot, Dot::new("n1", 2));
    }

    #[test]
    fn test_delete_produces_tombstone_set() {
        let set = SiblingSet::new().event("n1", 1, Some(b"A".to_vec()));
        let deleted = set.event("n1", 2, None);

        assert!(deleted.is_tombstone_set());
        assert!(deleted.values().is_empty());
        assert!(!SiblingSet::new().is_tombstone_set());
    }

    #[test]
    fn test_diff_and_is_behind() {
        let a = SiblingSet::from_siblings([sibling("n1", 1, &[], "A")]);
        let b = SiblingSet::from_siblings([sibling("n2", 1, &[], "B")]);
        let merged = a.merge(&b);

        assert_eq!(merged.diff(&a).len(), 1);
        assert!(merged.diff(&merged).is_empty());
        assert!(a.is_behind(&merged));
        assert!(!merged.is_behind(&a));
        assert!(!a.is_behind(&a));
        assert!(SiblingSet::new().is_behind(&a));
    }

    #[test]
    fn test_join_clock_covers_every_sibling() {
        let set = SiblingSet::from_siblings([
            sibling("n1", 3, &[("n2", 1)], "A"),
            sibling("n2", 2, &[("n1", 1)], "B"),
        ]);

        let clock = set.join_clock();
        assert_eq!(clock.get("n1"), 3);
        assert_eq!(clock.get("n2"), 2);
    }

    #[test]
    fn test_serialization() {
        let set = SiblingSet::from_siblings([
            sibling("n1", 1, &[], "A"),
            sibling("n2", 1, &[], "B"),
        ]);

        let json = serde_json::to_string(&set).unwrap();
        let decoded: SiblingSet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, set);
    }
}

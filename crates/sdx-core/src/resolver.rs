//! Conflict resolution strategies.
//!
//! A resolver decides which siblings of a merged set are surfaced to a
//! caller. Resolvers are stateless and are chosen per bucket.

use crate::sibling::SiblingSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub trait ConflictResolver: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, set: &SiblingSet) -> SiblingSet;
}

/// Keeps every concurrent write. Resolution is left to the client.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultiValue;

impl ConflictResolver for MultiValue {
    fn name(&self) -> &'static str {
        "multi_value"
    }

    fn resolve(&self, set: &SiblingSet) -> SiblingSet {
        set.clone()
    }
}

/// Keeps the sibling with the newest timestamp. Ties are broken by dot so
/// every replica picks the same winner. A delete can win.
#[derive(Clone, Copy, Debug, Default)]
pub struct LastWriterWins;

impl ConflictResolver for LastWriterWins {
    fn name(&self) -> &'static str {
        "last_writer_wins"
    }

    fn resolve(&self, set: &SiblingSet) -> SiblingSet {
        set.iter()
            .max_by(|a, b| {
                a.timestamp()
                    .cmp(&b.timestamp())
                    .then_with(|| a.dot().cmp(b.dot()))
            })
            .cloned()
            .into_iter()
            .collect()
    }
}

/// Configuration name of a resolver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    #[default]
    MultiValue,
    LastWriterWins,
}

impl ResolverKind {
    pub fn resolver(self) -> Arc<dyn ConflictResolver> {
        match self {
            ResolverKind::MultiValue => Arc::new(MultiValue),
            ResolverKind::LastWriterWins => Arc::new(LastWriterWins),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Dot, VersionVector};
    use crate::sibling::Sibling;

    fn concurrent_set() -> SiblingSet {
        SiblingSet::from_siblings([
            Sibling::new(Dot::new("n1", 1), VersionVector::new(), b"old".to_vec(), 10),
            Sibling::new(Dot::new("n2", 1), VersionVector::new(), b"new".to_vec(), 20),
            Sibling::tombstone(Dot::new("n3", 1), VersionVector::new(), 15),
        ])
    }

    #[test]
    fn test_multi_value_is_passthrough() {
        let set = concurrent_set();
        assert_eq!(MultiValue.resolve(&set), set);
    }

    #[test]
    fn test_last_writer_wins_keeps_newest() {
        let resolved = LastWriterWins.resolve(&concurrent_set());
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved.values(), vec![b"new".as_slice()]);
    }

    #[test]
    fn test_last_writer_wins_tie_breaks_on_dot() {
        let set = SiblingSet::from_siblings([
            Sibling::new(Dot::new("n1", 1), VersionVector::new(), b"a".to_vec(), 5),
            Sibling::new(Dot::new("n2", 1), VersionVector::new(), b"b".to_vec(), 5),
        ]);

        let resolved = LastWriterWins.resolve(&set);
        assert!(resolved.contains_dot(&Dot::new("n2", 1)));
    }

    #[test]
    fn test_last_writer_wins_on_empty_set() {
        assert!(LastWriterWins.resolve(&SiblingSet::new()).is_empty());
    }

    #[test]
    fn test_resolver_kind_names() {
        assert_eq!(ResolverKind::MultiValue.resolver().name(), "multi_value");
        assert_eq!(ResolverKind::LastWriterWins.resolver().name(), "last_writer_wins");

        let kind: ResolverKind = serde_json::from_str("\"last_writer_wins\"").unwrap();
        assert_eq!(kind, ResolverKind::LastWriterWins);
    }
}

//! Deduplicated, sorted traversal over a merged prefix read.

use crate::error::ClientError;
use crate::iterator::SiblingSetIterator;
use crate::merger::NodeReadMerger;
use sdx_core::{ConflictResolver, SiblingSet};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    prefix_index: usize,
    key_index: usize,
}

/// Walks every `(prefix, key)` pair discovered across replicas, reading
/// values through a [`NodeReadMerger`].
///
/// A key is kept under the first prefix it was added with; later additions
/// of the same key are dropped whatever their prefix. Prefix groups are
/// walked in the order they were first seen, and [`sort_keys`] orders keys
/// inside each group. Single consumer, single pass.
///
/// [`sort_keys`]: SiblingSetMergeIterator::sort_keys
pub struct SiblingSetMergeIterator {
    merger: Arc<NodeReadMerger>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    prefixes: Vec<String>,
    keys: Vec<Vec<String>>,
    prefix_indexes: HashMap<String, usize>,
    seen: HashSet<String>,
    cursor: Option<Cursor>,
    released: bool,
}

impl fmt::Debug for SiblingSetMergeIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiblingSetMergeIterator")
            .field("prefixes", &self.prefixes)
            .field("keys", &self.keys)
            .field("cursor", &self.cursor)
            .field("released", &self.released)
            .finish()
    }
}

impl SiblingSetMergeIterator {
    pub fn new(merger: Arc<NodeReadMerger>) -> Self {
        Self {
            merger,
            resolver: None,
            prefixes: Vec::new(),
            keys: Vec::new(),
            prefix_indexes: HashMap::new(),
            seen: HashSet::new(),
            cursor: None,
            released: false,
        }
    }

    /// Pass every value through `resolver` before handing it out.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn add_key(&mut self, prefix: &str, key: &str) {
        if !self.seen.insert(key.to_string()) {
            return;
        }

        let index = match self.prefix_indexes.get(prefix) {
            Some(&index) => index,
            None => {
                let index = self.prefixes.len();
                self.prefixes.push(prefix.to_string());
                self.keys.push(Vec::new());
                self.prefix_indexes.insert(prefix.to_string(), index);
                index
            }
        };
        self.keys[index].push(key.to_string());
    }

    pub fn sort_keys(&mut self) {
        for group in &mut self.keys {
            group.sort();
        }
    }

    /// Number of distinct keys added.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn current(&self) -> Option<(usize, usize)> {
        let cursor = self.cursor?;
        let group = self.keys.get(cursor.prefix_index)?;
        (cursor.key_index < group.len()).then_some((cursor.prefix_index, cursor.key_index))
    }
}

impl SiblingSetIterator for SiblingSetMergeIterator {
    fn next(&mut self) -> bool {
        if self.released {
            return false;
        }

        let mut cursor = match self.cursor {
            None => Cursor {
                prefix_index: 0,
                key_index: 0,
            },
            Some(cursor) => Cursor {
                prefix_index: cursor.prefix_index,
                key_index: cursor.key_index + 1,
            },
        };

        while cursor.prefix_index < self.keys.len() {
            if cursor.key_index < self.keys[cursor.prefix_index].len() {
                self.cursor = Some(cursor);
                return true;
            }
            cursor.prefix_index += 1;
            cursor.key_index = 0;
        }

        self.cursor = Some(cursor);
        false
    }

    fn prefix(&self) -> Option<&str> {
        self.current()
            .map(|(prefix_index, _)| self.prefixes[prefix_index].as_str())
    }

    fn key(&self) -> Option<&str> {
        self.current()
            .map(|(prefix_index, key_index)| self.keys[prefix_index][key_index].as_str())
    }

    fn value(&self) -> Option<SiblingSet> {
        let merged = self.merger.get(self.key()?).unwrap_or_default();
        Some(match &self.resolver {
            Some(resolver) => resolver.resolve(&merged),
            None => merged,
        })
    }

    /// Merged views have no local version.
    fn local_version(&self) -> u64 {
        0
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cursor = None;
        self.keys.clear();
        self.prefixes.clear();
        self.prefix_indexes.clear();
        self.seen.clear();
    }

    fn error(&self) -> Option<ClientError> {
        None
    }
}

//! Cursor over the results of a prefix read.

use crate::error::ClientError;
use crate::storage::StoredEntry;
use sdx_core::SiblingSet;
use std::collections::VecDeque;

/// A forward-only cursor. `next` must be called before the first entry is
/// readable; the accessors return `None` before that and after exhaustion.
pub trait SiblingSetIterator: Send {
    /// Advance. Returns false once exhausted, released or failed.
    fn next(&mut self) -> bool;

    /// The requested prefix the current key matched.
    fn prefix(&self) -> Option<&str>;

    fn key(&self) -> Option<&str>;

    fn value(&self) -> Option<SiblingSet>;

    fn local_version(&self) -> u64;

    /// Give back any held resources. Safe to call more than once.
    fn release(&mut self);

    /// The failure that ended iteration early, if any.
    fn error(&self) -> Option<ClientError>;
}

enum Slot {
    Entry(StoredEntry),
    Error(ClientError),
}

/// An iterator over entries held in memory. An error pushed between entries
/// halts iteration at that point and is reported by [`error`].
///
/// [`error`]: SiblingSetIterator::error
#[derive(Default)]
pub struct MemorySiblingSetIterator {
    pending: VecDeque<Slot>,
    current: Option<StoredEntry>,
    error: Option<ClientError>,
    released: bool,
}

impl MemorySiblingSetIterator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = StoredEntry>) -> Self {
        let mut iter = Self::new();
        for entry in entries {
            iter.push(entry);
        }
        iter
    }

    pub fn push(&mut self, entry: StoredEntry) -> &mut Self {
        self.pending.push_back(Slot::Entry(entry));
        self
    }

    pub fn push_error(&mut self, error: ClientError) -> &mut Self {
        self.pending.push_back(Slot::Error(error));
        self
    }
}

impl SiblingSetIterator for MemorySiblingSetIterator {
    fn next(&mut self) -> bool {
        self.current = None;
        if self.released || self.error.is_some() {
            return false;
        }

        match self.pending.pop_front() {
            Some(Slot::Entry(entry)) => {
                self.current = Some(entry);
                true
            }
            Some(Slot::Error(error)) => {
                self.error = Some(error);
                false
            }
            None => false,
        }
    }

    fn prefix(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.prefix.as_str())
    }

    fn key(&self) -> Option<&str> {
        self.current.as_ref().map(|e| e.key.as_str())
    }

    fn value(&self) -> Option<SiblingSet> {
        self.current.as_ref().map(|e| e.value.clone())
    }

    fn local_version(&self) -> u64 {
        self.current.as_ref().map_or(0, |e| e.local_version)
    }

    fn release(&mut self) {
        self.released = true;
        self.current = None;
        self.pending.clear();
    }

    fn error(&self) -> Option<ClientError> {
        self.error.clone()
    }
}

//! Cache of previously fetched tuples.

use std::sync::{Mutex, MutexGuard};

use crate::cache::SlotCache;
use crate::store::Tuple;

/// Immutable snapshot of a tuple, safe to hand out any number of times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleEntry {
    pub path: String,
    pub value: Tuple,
}

#[derive(Debug)]
pub struct TupleCache {
    slots: Mutex<SlotCache<String, TupleEntry>>,
}

impl TupleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(SlotCache::new(capacity)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, SlotCache<String, TupleEntry>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caches `entry` and returns whatever it evicted.
    pub fn add_entry(&self, entry: TupleEntry) -> Option<TupleEntry> {
        self.slots()
            .insert(entry.path.clone(), entry)
            .map(|(_, evicted)| evicted)
    }

    pub fn get_entry(&self, path: &str) -> Option<TupleEntry> {
        self.slots().get(&path.to_string()).cloned()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

//! Cache of leased resource bindings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::SlotCache;
use crate::store::{LeaseHandle, LeaseMaintainer, ResourceHandle};

/// A bound resource shared by every request that targets its path.
///
/// Starts with one reference, held by whoever created it. The lease is
/// cancelled when the last reference is released, never earlier.
#[derive(Debug)]
pub struct BindingEntry {
    path: String,
    lease: LeaseMaintainer,
    resource: ResourceHandle,
    refs: AtomicUsize,
}

impl BindingEntry {
    pub fn new(path: impl Into<String>, lease: LeaseMaintainer, resource: ResourceHandle) -> Self {
        Self {
            path: path.into(),
            lease,
            resource,
            refs: AtomicUsize::new(1),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn resource(&self) -> &ResourceHandle {
        &self.resource
    }

    pub fn lease(&self) -> LeaseHandle {
        self.lease.lease()
    }

    pub fn is_cancelled(&self) -> bool {
        self.lease.is_cancelled()
    }

    /// The store stopped honouring the lease while it was still referenced.
    pub fn is_revoked(&self) -> bool {
        !self.lease.is_cancelled() && !self.lease.is_live()
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Takes another reference. Returns the new count.
    pub fn reference(&self) -> usize {
        self.refs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one reference, cancelling the lease when none remain.
    /// Returns the new count.
    pub fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => {
                self.lease.cancel();
                tracing::debug!(path = %self.path, lease = self.lease().0, "Binding released");
                0
            }
            Ok(n) => n - 1,
            Err(_) => {
                tracing::error!(path = %self.path, "Binding released more often than referenced");
                0
            }
        }
    }
}

/// Fixed-capacity binding cache keyed by resource path.
#[derive(Debug)]
pub struct BindingCache {
    slots: Mutex<SlotCache<String, Arc<BindingEntry>>>,
}

impl BindingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(SlotCache::new(capacity)),
        }
    }

    fn slots(&self) -> MutexGuard<'_, SlotCache<String, Arc<BindingEntry>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caches `entry`, handing the cache the entry's initial reference.
    ///
    /// Returns the entry it displaced, after dropping the cache's reference to
    /// it. The displaced lease stays alive while requests still hold it.
    pub fn add_entry(&self, entry: Arc<BindingEntry>) -> Option<Arc<BindingEntry>> {
        let displaced = self.slots().insert(entry.path.clone(), entry);

        displaced.map(|(path, evicted)| {
            let remaining = evicted.release();
            tracing::debug!(path = %path, remaining, "Binding evicted");
            evicted
        })
    }

    /// Looks up the binding for `path`. A hit is a new reference that the
    /// caller must eventually [`release`](BindingEntry::release).
    ///
    /// A binding whose lease was revoked is dropped from the cache and
    /// reported as a miss, so the caller binds afresh.
    pub fn get_entry(&self, path: &str) -> Option<Arc<BindingEntry>> {
        let key = path.to_string();
        let mut slots = self.slots();
        let entry = Arc::clone(slots.get(&key)?);

        if entry.is_revoked() {
            slots.remove(&key);
            drop(slots);
            let remaining = entry.release();
            tracing::debug!(path, remaining, "Dropped binding with a revoked lease");
            return None;
        }

        entry.reference();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots().capacity()
    }

    /// Drops the cache's reference to every binding.
    pub fn clear(&self) {
        let drained = self.slots().drain();
        for (_, entry) in drained {
            entry.release();
        }
    }
}

//! In-process tuple store.
//!
//! Resources are named by path (`/docs`), tuples by name within a resource.
//! Values larger than the segment threshold are stored as a linked chain of
//! [`Chunk`]s: the head is returned for a query by name, the rest are looked
//! up by chunk id. Completions are delivered from spawned tasks, optionally
//! after a per-path artificial latency, so callers see the same out-of-order
//! behaviour a remote store produces.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedSender;

use crate::store::{
    Binding, Chunk, ChunkId, Completion, DataTuple, LeaseHandle, RequestId, ResourceHandle,
    StoreCall, StoreError, StoreOutcome, Tuple, TupleKey, TupleStore, tuple_path,
};

#[derive(Default)]
struct Resource {
    id: u64,
    tuples: HashMap<String, Tuple>,
    chunks: HashMap<ChunkId, Chunk>,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Resource>,
    leases: HashMap<LeaseHandle, String>,
    cancelled: HashSet<LeaseHandle>,
    latency: HashMap<String, Duration>,
    failures: HashMap<String, StoreError>,
}

/// Tuple store held entirely in memory.
///
/// Cloning is cheap and every clone shares the same contents.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    segment_threshold: usize,
    lease_duration: Duration,
    next_id: Arc<AtomicU64>,
    binds: Arc<AtomicUsize>,
    queries: Arc<AtomicUsize>,
    renewals: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new(segment_threshold: usize, lease_duration: Duration) -> Self {
        assert!(segment_threshold > 0, "segment threshold must be non-zero");
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            segment_threshold,
            lease_duration,
            next_id: Arc::new(AtomicU64::new(1)),
            binds: Arc::new(AtomicUsize::new(0)),
            queries: Arc::new(AtomicUsize::new(0)),
            renewals: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn segment_threshold(&self) -> usize {
        self.segment_threshold
    }

    /// Stores `data` as tuple `name` in `resource`, creating the resource if
    /// needed. Values above the segment threshold are split into chunks.
    pub fn insert(
        &self,
        resource: &str,
        name: &str,
        content_type: Option<&str>,
        data: impl Into<Bytes>,
    ) {
        let data: Bytes = data.into();
        let content_type = content_type.map(str::to_string);

        let mut chunks = Vec::new();
        let tuple = if data.len() <= self.segment_threshold {
            Tuple::Data(DataTuple {
                name: name.to_string(),
                content_type,
                data,
            })
        } else {
            let total_len = data.len() as u64;
            let ids: Vec<ChunkId> = (0..data.len().div_ceil(self.segment_threshold))
                .map(|_| ChunkId(self.fresh_id()))
                .collect();

            for (i, segment) in data.chunks(self.segment_threshold).enumerate() {
                chunks.push(Chunk {
                    id: ids[i],
                    total_len,
                    content_type: if i == 0 { content_type.clone() } else { None },
                    data: data.slice_ref(segment),
                    next: ids.get(i + 1).copied(),
                });
            }
            Tuple::Chunk(chunks.remove(0))
        };

        let resource_id = self.fresh_id();
        let mut inner = self.inner();
        let entry = inner
            .resources
            .entry(resource.to_string())
            .or_insert_with(|| Resource {
                id: resource_id,
                ..Resource::default()
            });
        entry.tuples.insert(name.to_string(), tuple);
        for chunk in chunks {
            entry.chunks.insert(chunk.id, chunk);
        }
    }

    /// Creates an empty resource so that binds to it succeed.
    pub fn create_resource(&self, resource: &str) {
        let resource_id = self.fresh_id();
        self.inner()
            .resources
            .entry(resource.to_string())
            .or_insert_with(|| Resource {
                id: resource_id,
                ..Resource::default()
            });
    }

    /// Seeds the store from files under `root`.
    ///
    /// `root/docs/a.html` becomes tuple `a.html` in resource `/docs`; files
    /// directly under `root` land in resource `/`.
    pub fn load_dir(&self, root: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;
        let mut stack = vec![root.to_path_buf()];

        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("reading directory {}", dir.display()))?;

            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }

                let relative = path.strip_prefix(root).context("path outside store root")?;
                let Some(name) = relative.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let parent = relative
                    .parent()
                    .map(|p| {
                        p.components()
                            .filter_map(|c| c.as_os_str().to_str())
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_default();
                let resource = format!("/{}", parent);

                let data = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                self.insert(&resource, name, None, data);
                loaded += 1;
            }
        }

        tracing::info!(root = %root.display(), tuples = loaded, "Loaded tuple store contents");
        Ok(loaded)
    }

    /// Delays every completion for binds of resource `path` and queries of
    /// tuple `path` (`/resource/name`).
    pub fn set_latency(&self, path: &str, latency: Duration) {
        self.inner().latency.insert(path.to_string(), latency);
    }

    /// Makes every call touching `path` fail with `error`.
    pub fn set_failure(&self, path: &str, error: StoreError) {
        self.inner().failures.insert(path.to_string(), error);
    }

    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn renew_count(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn active_leases(&self) -> usize {
        self.inner().leases.len()
    }

    pub fn is_cancelled(&self, lease: LeaseHandle) -> bool {
        self.inner().cancelled.contains(&lease)
    }

    fn bind(&self, path: &str) -> Result<StoreOutcome, StoreError> {
        let lease = LeaseHandle(self.fresh_id());
        let mut inner = self.inner();
        if let Some(error) = inner.failures.get(path) {
            return Err(error.clone());
        }
        let resource_id = inner
            .resources
            .get(path)
            .map(|r| r.id)
            .ok_or_else(|| StoreError::UnknownResource(path.to_string()))?;
        inner.leases.insert(lease, path.to_string());

        Ok(StoreOutcome::Bound(Binding {
            lease,
            resource: ResourceHandle {
                id: resource_id,
                path: path.to_string(),
            },
            duration: self.lease_duration,
        }))
    }

    fn query(&self, resource: &ResourceHandle, key: &TupleKey) -> Result<StoreOutcome, StoreError> {
        let inner = self.inner();
        if let Some(error) = inner.failures.get(&tuple_path(&resource.path, key)) {
            return Err(error.clone());
        }
        let stored = inner
            .resources
            .get(&resource.path)
            .filter(|r| r.id == resource.id)
            .ok_or_else(|| StoreError::UnknownResource(resource.path.clone()))?;

        let found = match key {
            TupleKey::Name(name) => stored.tuples.get(name).cloned(),
            TupleKey::Chunk(id) => stored.chunks.get(id).cloned().map(Tuple::Chunk),
        };
        Ok(StoreOutcome::Found(found))
    }
}

impl TupleStore for MemoryStore {
    fn submit(&self, id: RequestId, call: StoreCall, completions: UnboundedSender<Completion>) {
        let (latency_key, result) = match &call {
            StoreCall::Bind { path } => {
                self.binds.fetch_add(1, Ordering::SeqCst);
                (path.clone(), self.bind(path))
            }
            StoreCall::Query { resource, key } => {
                self.queries.fetch_add(1, Ordering::SeqCst);
                (tuple_path(&resource.path, key), self.query(resource, key))
            }
        };
        let latency = self.inner().latency.get(&latency_key).copied();

        tokio::spawn(async move {
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            // the receiver is gone only when the proxy shut down
            let _ = completions.send(Completion { id, result });
        });
    }

    fn renew(&self, lease: LeaseHandle, duration: Duration) -> Result<Duration, StoreError> {
        self.renewals.fetch_add(1, Ordering::SeqCst);
        if self.inner().leases.contains_key(&lease) {
            Ok(duration.min(self.lease_duration))
        } else {
            Err(StoreError::UnknownLease(lease))
        }
    }

    fn cancel(&self, lease: LeaseHandle) {
        let mut inner = self.inner();
        inner.leases.remove(&lease);
        inner.cancelled.insert(lease);
    }
}

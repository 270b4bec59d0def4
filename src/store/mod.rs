//! Asynchronous tuple store interface.
//!
//! The store is an external collaborator: a client binds to a named resource,
//! receiving a lease and a resource handle, and then queries tuples within
//! that resource. Every call is submitted with an opaque [`RequestId`] and its
//! outcome is delivered later as a [`Completion`] on a channel, possibly out
//! of order with respect to submission.
//!
//! - **`memory`**: in-process store used by the server binary and the tests
//! - **`lease`**: single scheduler that renews every live lease until cancelled

pub mod lease;
pub mod memory;

pub use lease::{LeaseMaintainer, LeaseScheduler};
pub use memory::MemoryStore;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

/// Opaque correlation identifier for one backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Lease granted by a successful bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseHandle(pub u64);

/// Handle to a bound resource, valid while its lease is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceHandle {
    pub id: u64,
    pub path: String,
}

/// Identifier of one body segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub u64);

/// Result of a bind call.
#[derive(Debug, Clone)]
pub struct Binding {
    pub lease: LeaseHandle,
    pub resource: ResourceHandle,
    pub duration: Duration,
}

/// Exact-match predicate for a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TupleKey {
    Name(String),
    Chunk(ChunkId),
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TupleKey::Name(name) => f.write_str(name),
            TupleKey::Chunk(id) => write!(f, "#chunk-{}", id.0),
        }
    }
}

/// Full path of a tuple: `/docs` + `a.html` is `/docs/a.html`.
pub fn tuple_path(resource: &str, key: &TupleKey) -> String {
    if resource.ends_with('/') {
        format!("{}{}", resource, key)
    } else {
        format!("{}/{}", resource, key)
    }
}

/// A value small enough to travel in one piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTuple {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// One segment of a body that was split at the segment threshold.
///
/// A head chunk is what a query by name returns for a large value; its
/// `total_len` is the length of the whole body and `next` links to the
/// second segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub total_len: u64,
    pub content_type: Option<String>,
    pub data: Bytes,
    pub next: Option<ChunkId>,
}

/// An immutable stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tuple {
    Data(DataTuple),
    Chunk(Chunk),
}

/// A call submitted to the store.
#[derive(Debug, Clone)]
pub enum StoreCall {
    Bind { path: String },
    Query { resource: ResourceHandle, key: TupleKey },
}

/// Successful outcome of a [`StoreCall`].
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    Bound(Binding),
    /// `None` when nothing in the resource matched.
    Found(Option<Tuple>),
}

/// Outcome of a call, tagged with the id it was submitted under.
#[derive(Debug)]
pub struct Completion {
    pub id: RequestId,
    pub result: Result<StoreOutcome, StoreError>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    #[error("unknown lease {0:?}")]
    UnknownLease(LeaseHandle),

    #[error("backend did not answer in time")]
    Timeout,

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Client side of the backend store protocol.
///
/// `submit` must not block: the outcome is sent on `completions` once the
/// store has it, from whatever task the store runs on.
pub trait TupleStore: Send + Sync + 'static {
    fn submit(&self, id: RequestId, call: StoreCall, completions: UnboundedSender<Completion>);

    /// Extends a lease, returning the duration actually granted.
    fn renew(&self, lease: LeaseHandle, duration: Duration) -> Result<Duration, StoreError>;

    fn cancel(&self, lease: LeaseHandle);
}

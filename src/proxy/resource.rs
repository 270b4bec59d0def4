//! Two-phase asynchronous client of the tuple store.
//!
//! Resolving a request takes up to two backend round trips:
//!
//! 1. **Bind** (binding cache miss only): bind to the resource path, wrap the
//!    lease in a maintainer, cache the binding
//! 2. **Query**: exact match by tuple name or chunk id within the bound
//!    resource
//!
//! Each in-flight call is recorded in a correlation table under a random
//! [`RequestId`]. The completion handler pops the record when the store
//! answers and moves it to its next [`Phase`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::AbortHandle;

use crate::cache::{BindingCache, BindingEntry, TupleCache, TupleEntry};
use crate::store::{
    ChunkId, Completion, LeaseScheduler, RequestId, StoreCall, StoreError, StoreOutcome, Tuple, TupleKey,
    TupleStore, tuple_path,
};

/// Receives the raw outcome of a fetch. Called exactly once, from whichever
/// task delivers the completion.
pub type Continuation = Box<dyn FnOnce(Result<Option<Tuple>, StoreError>) + Send + 'static>;

/// What to fetch: a tuple (by name or chunk id) inside a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub resource: String,
    pub key: TupleKey,
}

impl Target {
    pub fn new(resource: impl Into<String>, key: TupleKey) -> Self {
        Self {
            resource: resource.into(),
            key,
        }
    }

    /// Maps a normalized request path onto a resource and tuple name.
    ///
    /// `/docs/a.html` is tuple `a.html` in `/docs`; a path ending in `/`
    /// names `index_name` in that directory.
    pub fn from_path(path: &str, index_name: &str) -> Self {
        let (dir, name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        let resource = if dir.is_empty() { "/" } else { dir };
        let name = if name.is_empty() { index_name } else { name };

        Self::new(resource, TupleKey::Name(name.to_string()))
    }

    /// Same resource, a different chunk.
    pub fn chunk(&self, id: ChunkId) -> Self {
        Self::new(self.resource.clone(), TupleKey::Chunk(id))
    }

    pub fn full_path(&self) -> String {
        tuple_path(&self.resource, &self.key)
    }
}

/// Progress of one fetch through the bind/query protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unbound,
    Binding,
    Bound,
    Querying,
    Done,
}

struct Closure {
    target: Target,
    phase: Phase,
    binding: Option<Arc<BindingEntry>>,
    /// Timeout of the call currently in flight
    timer: Option<AbortHandle>,
    reply: Continuation,
}

impl Closure {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn finish(mut self, result: Result<Option<Tuple>, StoreError>) {
        if let Some(binding) = self.binding.take() {
            binding.release();
        }
        let from = std::mem::replace(&mut self.phase, Phase::Done);
        tracing::trace!(path = %self.target.full_path(), from = ?from, to = ?self.phase, "Fetch finished");
        (self.reply)(result);
    }
}

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub binding_capacity: usize,
    /// Zero disables the tuple cache
    pub tuple_capacity: usize,
    /// Largest value copied into the tuple cache
    pub tuple_cache_limit: usize,
    pub request_timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            binding_capacity: 32,
            tuple_capacity: 128,
            tuple_cache_limit: 64 * 1024,
            request_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ResourceProxy {
    store: Arc<dyn TupleStore>,
    bindings: BindingCache,
    tuples: Option<TupleCache>,
    leases: LeaseScheduler,
    table: Mutex<HashMap<RequestId, Closure>>,
    completions: UnboundedSender<Completion>,
    settings: ProxySettings,
    this: Weak<ResourceProxy>,
}

impl ResourceProxy {
    /// Creates the proxy and spawns its completion handler on the current
    /// tokio runtime.
    pub fn start(store: Arc<dyn TupleStore>, settings: ProxySettings) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let proxy = Arc::new_cyclic(|this| Self {
            leases: LeaseScheduler::start(Arc::clone(&store)),
            store,
            bindings: BindingCache::new(settings.binding_capacity),
            tuples: (settings.tuple_capacity > 0).then(|| TupleCache::new(settings.tuple_capacity)),
            table: Mutex::new(HashMap::new()),
            completions: tx,
            settings,
            this: this.clone(),
        });

        tokio::spawn(run(Arc::downgrade(&proxy), rx));
        proxy
    }

    fn table(&self) -> MutexGuard<'_, HashMap<RequestId, Closure>> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn bindings(&self) -> &BindingCache {
        &self.bindings
    }

    pub fn tuples(&self) -> Option<&TupleCache> {
        self.tuples.as_ref()
    }

    pub fn leases(&self) -> &LeaseScheduler {
        &self.leases
    }

    /// Backend calls currently awaiting a completion.
    pub fn in_flight(&self) -> usize {
        self.table().len()
    }

    /// Resolves `target`, calling `reply` with the raw store result.
    ///
    /// A tuple cache hit answers immediately on the calling task; otherwise
    /// the answer arrives later from the completion handler.
    pub fn fetch(&self, target: Target, reply: Continuation) {
        if matches!(target.key, TupleKey::Name(_)) {
            let cached = self
                .tuples
                .as_ref()
                .and_then(|tuples| tuples.get_entry(&target.full_path()));
            if let Some(entry) = cached {
                tracing::trace!(path = %entry.path, "Tuple cache hit");
                reply(Ok(Some(entry.value)));
                return;
            }
        }

        let mut closure = Closure {
            target,
            phase: Phase::Unbound,
            binding: None,
            timer: None,
            reply,
        };

        match self.bindings.get_entry(&closure.target.resource) {
            Some(binding) => {
                tracing::trace!(resource = %closure.target.resource, "Binding cache hit");
                closure.binding = Some(binding);
                closure.phase = Phase::Bound;
                self.submit_query(closure);
            }
            None => {
                closure.phase = Phase::Binding;
                let call = StoreCall::Bind {
                    path: closure.target.resource.clone(),
                };
                self.submit(call, closure);
            }
        }
    }

    fn submit_query(&self, mut closure: Closure) {
        let resource = closure.binding.as_ref().map(|b| b.resource().clone());
        let Some(resource) = resource else {
            closure.finish(Err(StoreError::Backend("query without a binding".into())));
            return;
        };

        let call = StoreCall::Query {
            resource,
            key: closure.target.key.clone(),
        };
        closure.phase = Phase::Querying;
        self.submit(call, closure);
    }

    fn submit(&self, call: StoreCall, closure: Closure) {
        let id = {
            let mut table = self.table();
            let mut id = RequestId::random();
            while table.contains_key(&id) {
                id = RequestId::random();
            }
            table.insert(id, closure);
            id
        };

        tracing::trace!(request_id = %id, call = ?call, "Submitting store call");
        self.store.submit(id, call, self.completions.clone());

        let proxy = self.this.clone();
        let timeout = self.settings.request_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(proxy) = proxy.upgrade() {
                proxy.expire(id);
            }
        })
        .abort_handle();

        // the completion may already have taken the record
        match self.table().get_mut(&id) {
            Some(closure) => closure.timer = Some(timer),
            None => timer.abort(),
        }
    }

    fn expire(&self, id: RequestId) {
        let expired = self.table().remove(&id);
        if let Some(closure) = expired {
            tracing::warn!(
                request_id = %id,
                path = %closure.target.full_path(),
                phase = ?closure.phase,
                "Store call timed out"
            );
            closure.finish(Err(StoreError::Timeout));
        }
    }

    /// Drives the closure registered under `completion.id` to its next phase.
    pub fn handle_completion(&self, completion: Completion) {
        let Completion { id, result } = completion;

        let closure = self.table().remove(&id);
        let Some(mut closure) = closure else {
            // Already expired. A late bind still holds a lease nobody will use.
            if let Ok(StoreOutcome::Bound(binding)) = result {
                self.store.cancel(binding.lease);
            }
            tracing::debug!(request_id = %id, "Completion for unknown request");
            return;
        };
        closure.stop_timer();

        match (closure.phase, result) {
            (Phase::Binding, Ok(StoreOutcome::Bound(binding))) => {
                let lease = self.leases.maintain(binding.lease, binding.duration);
                let entry = Arc::new(BindingEntry::new(
                    closure.target.resource.clone(),
                    lease,
                    binding.resource,
                ));

                // this request's reference, taken before the cache can evict
                entry.reference();
                self.bindings.add_entry(Arc::clone(&entry));

                tracing::debug!(
                    resource = %closure.target.resource,
                    lease = binding.lease.0,
                    "Bound resource"
                );
                closure.binding = Some(entry);
                closure.phase = Phase::Bound;
                self.submit_query(closure);
            }
            (Phase::Querying, Ok(StoreOutcome::Found(value))) => {
                if let (Some(tuples), TupleKey::Name(_), Some(Tuple::Data(data))) =
                    (&self.tuples, &closure.target.key, &value)
                {
                    if data.data.len() <= self.settings.tuple_cache_limit {
                        tuples.add_entry(TupleEntry {
                            path: closure.target.full_path(),
                            value: Tuple::Data(data.clone()),
                        });
                    }
                }
                closure.finish(Ok(value));
            }
            (phase, Err(e)) => {
                tracing::debug!(
                    request_id = %id,
                    path = %closure.target.full_path(),
                    phase = ?phase,
                    error = %e,
                    "Store call failed"
                );
                closure.finish(Err(e));
            }
            (phase, Ok(outcome)) => {
                tracing::error!(request_id = %id, phase = ?phase, outcome = ?outcome, "Unexpected store outcome");
                if let StoreOutcome::Bound(binding) = outcome {
                    self.store.cancel(binding.lease);
                }
                closure.finish(Err(StoreError::Backend("unexpected store outcome".into())));
            }
        }
    }

    /// Drops the cache's reference to every binding, cancelling leases that
    /// no in-flight request still holds.
    pub fn shutdown(&self) {
        self.bindings.clear();
    }
}

async fn run(proxy: Weak<ResourceProxy>, mut completions: UnboundedReceiver<Completion>) {
    while let Some(completion) = completions.recv().await {
        let Some(proxy) = proxy.upgrade() else {
            break;
        };
        proxy.handle_completion(completion);
    }
}

//! Bounded worker pool.
//!
//! A fixed-capacity circular queue feeds a resizable set of worker tasks.
//! Workers dequeue one item at a time and hand it to a [`Handler`] outside
//! the pool lock; the handler may put follow-up work back on the queue.
//!
//! ```text
//!   ACTIVE ⇄ INACTIVE ──▶ DRAINED ──▶ TERMINATED
//!      └───────────────────────▲
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Accepting and dispatching work
    Active,
    /// Accepting but not dispatching
    Inactive,
    /// Refusing new work, dispatching what is queued
    Drained,
    /// Terminal; workers exit
    Terminated,
}

impl PoolStatus {
    fn dispatches(self) -> bool {
        matches!(self, PoolStatus::Active | PoolStatus::Drained)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("worker pool is terminated")]
    Terminated,
}

/// Processes one dequeued item.
pub trait Handler<T>: Send + Sync + 'static {
    fn handle(&self, item: T, queue: QueueHandle<T>) -> impl Future<Output = ()> + Send;
}

/// Fixed-capacity circular queue.
struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, head: 0, len: 0 }
    }

    fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    fn tail(&self) -> usize {
        (self.head + self.len) % self.slots.len()
    }

    fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let tail = self.tail();
        self.slots[tail] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn push_front(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.head = (self.head + self.slots.len() - 1) % self.slots.len();
        self.slots[self.head] = Some(item);
        self.len += 1;
        Ok(())
    }

    fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }

    fn clear(&mut self) {
        while self.pop_front().is_some() {}
    }
}

struct PoolState<T> {
    queue: Ring<T>,
    status: PoolStatus,
    busy: usize,
    live: usize,
    target: usize,
    next_worker: usize,
}

struct Shared<T> {
    state: Mutex<PoolState<T>>,
    changed: Notify,
}

impl<T> Shared<T> {
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands `item` back when the queue is full or draining.
    fn push(&self, item: T, front: bool) -> Result<Option<T>, PoolError> {
        let pushed = {
            let mut state = self.state();
            match state.status {
                PoolStatus::Terminated => return Err(PoolError::Terminated),
                PoolStatus::Drained => Err(item),
                _ if front => state.queue.push_front(item),
                _ => state.queue.push_back(item),
            }
        };
        match pushed {
            Ok(()) => {
                self.changed.notify_waiters();
                Ok(None)
            }
            Err(item) => Ok(Some(item)),
        }
    }

    /// Waits until `done` holds for the pool state.
    async fn wait_until(&self, done: impl Fn(&PoolState<T>) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let settled = done(&*self.state());
            if settled {
                return;
            }
            notified.await;
        }
    }
}

/// Lets a handler put work back on the queue it came from.
pub struct QueueHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for QueueHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> QueueHandle<T> {
    pub fn enqueue(&self, item: T) -> Result<bool, PoolError> {
        Ok(self.shared.push(item, false)?.is_none())
    }

    pub fn enqueue_first(&self, item: T) -> Result<bool, PoolError> {
        Ok(self.shared.push(item, true)?.is_none())
    }

    /// Like [`enqueue`](Self::enqueue), but a refused item is handed back.
    pub fn offer(&self, item: T) -> Result<Option<T>, PoolError> {
        self.shared.push(item, false)
    }
}

pub struct WorkerPool<T, H> {
    shared: Arc<Shared<T>>,
    handler: Arc<H>,
}

impl<T, H> WorkerPool<T, H>
where
    T: Send + 'static,
    H: Handler<T>,
{
    /// Creates an ACTIVE pool and spawns `workers` worker tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, workers: usize, handler: H) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");

        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: Ring::new(capacity),
                    status: PoolStatus::Active,
                    busy: 0,
                    live: 0,
                    target: 0,
                    next_worker: 0,
                }),
                changed: Notify::new(),
            }),
            handler: Arc::new(handler),
        };
        pool.set_thread_number(workers);
        pool
    }

    pub fn handle(&self) -> QueueHandle<T> {
        QueueHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Adds `item` at the tail. `Ok(false)` when the queue is full or the
    /// pool is draining.
    pub fn enqueue(&self, item: T) -> Result<bool, PoolError> {
        Ok(self.shared.push(item, false)?.is_none())
    }

    /// Adds `item` at the head.
    pub fn enqueue_first(&self, item: T) -> Result<bool, PoolError> {
        Ok(self.shared.push(item, true)?.is_none())
    }

    /// Like [`enqueue`](Self::enqueue), but a refused item is handed back.
    pub fn offer(&self, item: T) -> Result<Option<T>, PoolError> {
        self.shared.push(item, false)
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.state().status
    }

    pub fn queued(&self) -> usize {
        self.shared.state().queue.len
    }

    pub fn busy(&self) -> usize {
        self.shared.state().busy
    }

    /// Workers currently running.
    pub fn live(&self) -> usize {
        self.shared.state().live
    }

    pub fn capacity(&self) -> usize {
        self.shared.state().queue.slots.len()
    }

    /// Grows or shrinks the worker count. Surplus workers retire once they
    /// finish their current item.
    pub fn set_thread_number(&self, workers: usize) {
        let spawn = {
            let mut state = self.shared.state();
            if state.status == PoolStatus::Terminated {
                return;
            }
            state.target = workers;
            let spawn: Vec<usize> = (state.live..workers)
                .map(|_| {
                    state.next_worker += 1;
                    state.next_worker
                })
                .collect();
            state.live += spawn.len();
            spawn
        };

        for id in spawn {
            tokio::spawn(worker(id, Arc::clone(&self.shared), Arc::clone(&self.handler)));
        }
        self.shared.changed.notify_waiters();
        tracing::debug!(workers, "Worker count set");
    }

    /// Moves the pool to `status` and waits for the transition to settle:
    ///
    /// - INACTIVE: until no worker is busy
    /// - DRAINED: until the queue is empty and no worker is busy
    /// - TERMINATED: until every worker has exited; queued items are dropped
    ///
    /// Must not be awaited from inside a handler for anything but ACTIVE.
    pub async fn set_status(&self, status: PoolStatus) -> Result<(), PoolError> {
        {
            let mut state = self.shared.state();
            if state.status == PoolStatus::Terminated && status != PoolStatus::Terminated {
                return Err(PoolError::Terminated);
            }
            tracing::info!(from = ?state.status, to = ?status, "Worker pool status change");
            state.status = status;
            if status == PoolStatus::Terminated {
                state.queue.clear();
            }
        }
        self.shared.changed.notify_waiters();

        match status {
            PoolStatus::Active => {}
            PoolStatus::Inactive => self.shared.wait_until(|s| s.busy == 0).await,
            PoolStatus::Drained => {
                self.shared
                    .wait_until(|s| s.queue.len == 0 && s.busy == 0)
                    .await
            }
            PoolStatus::Terminated => self.shared.wait_until(|s| s.live == 0).await,
        }
        Ok(())
    }
}

async fn worker<T, H>(id: usize, shared: Arc<Shared<T>>, handler: Arc<H>)
where
    T: Send + 'static,
    H: Handler<T>,
{
    tracing::trace!(worker = id, "Worker started");

    loop {
        let notified = shared.changed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let item = {
            let mut state = shared.state();
            if state.status == PoolStatus::Terminated || state.live > state.target {
                state.live -= 1;
                drop(state);
                shared.changed.notify_waiters();
                tracing::trace!(worker = id, "Worker exiting");
                return;
            }

            if state.status.dispatches() {
                let item = state.queue.pop_front();
                if item.is_some() {
                    state.busy += 1;
                }
                item
            } else {
                None
            }
        };

        let Some(item) = item else {
            notified.await;
            continue;
        };

        let queue = QueueHandle {
            shared: Arc::clone(&shared),
        };
        let task_handler = Arc::clone(&handler);
        let outcome = tokio::spawn(async move { task_handler.handle(item, queue).await }).await;
        if let Err(e) = outcome {
            tracing::error!(worker = id, error = %e, "Handler panicked");
        }

        shared.state().busy -= 1;
        shared.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::new(3);
        assert!(ring.push_back(1).is_ok());
        assert!(ring.push_back(2).is_ok());
        assert_eq!(ring.pop_front(), Some(1));
        assert!(ring.push_back(3).is_ok());
        assert!(ring.push_front(0).is_ok());
        assert_eq!(ring.push_back(4), Err(4));

        assert_eq!(ring.pop_front(), Some(0));
        assert_eq!(ring.pop_front(), Some(2));
        assert_eq!(ring.pop_front(), Some(3));
        assert_eq!(ring.pop_front(), None);
    }
}

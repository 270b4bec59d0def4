//! Lease renewal.
//!
//! Every live binding holds a lease that the store revokes unless it is
//! renewed. Rather than one timer per binding, a single [`LeaseScheduler`]
//! task keeps a min-heap of `(deadline, lease)` pairs and renews each lease
//! at half its granted duration until the owning [`LeaseMaintainer`] is
//! cancelled.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::store::{LeaseHandle, TupleStore};

#[derive(Default)]
struct Schedule {
    deadlines: BinaryHeap<Reverse<(Instant, LeaseHandle)>>,
    live: HashMap<LeaseHandle, Duration>,
    closed: bool,
}

struct Shared {
    store: Arc<dyn TupleStore>,
    schedule: Mutex<Schedule>,
    wake: Notify,
}

impl Shared {
    fn schedule(&self) -> std::sync::MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel(&self, lease: LeaseHandle) {
        let was_live = self.schedule().live.remove(&lease).is_some();
        if was_live {
            self.store.cancel(lease);
            tracing::debug!(lease = lease.0, "Lease cancelled");
        }
    }

    /// Renews every lease whose deadline has passed and returns the next
    /// deadline, or `Err(())` once the scheduler has been dropped.
    fn renew_due(&self) -> Result<Option<Instant>, ()> {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut schedule = self.schedule();
            if schedule.closed {
                return Err(());
            }
            while let Some(Reverse((deadline, lease))) = schedule.deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                schedule.deadlines.pop();
                if let Some(&duration) = schedule.live.get(&lease) {
                    due.push((lease, duration));
                }
            }
        }

        for (lease, duration) in due {
            match self.store.renew(lease, duration) {
                Ok(granted) => {
                    let mut schedule = self.schedule();
                    if schedule.live.contains_key(&lease) {
                        schedule.live.insert(lease, granted);
                        schedule
                            .deadlines
                            .push(Reverse((Instant::now() + granted / 2, lease)));
                    }
                    tracing::trace!(lease = lease.0, granted_ms = granted.as_millis() as u64, "Lease renewed");
                }
                Err(e) => {
                    self.schedule().live.remove(&lease);
                    tracing::warn!(lease = lease.0, error = %e, "Lease renewal failed, dropping lease");
                }
            }
        }

        let schedule = self.schedule();
        Ok(schedule.deadlines.peek().map(|Reverse((deadline, _))| *deadline))
    }
}

/// Renews leases on behalf of every binding in the process.
pub struct LeaseScheduler {
    shared: Arc<Shared>,
}

impl LeaseScheduler {
    /// Creates the scheduler and spawns its renewal task on the current
    /// tokio runtime. The task ends when the scheduler is dropped.
    pub fn start(store: Arc<dyn TupleStore>) -> Self {
        let shared = Arc::new(Shared {
            store,
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
        });

        tokio::spawn(run(Arc::clone(&shared)));

        Self { shared }
    }

    /// Starts renewing `lease`, first at half of `duration` from now.
    pub fn maintain(&self, lease: LeaseHandle, duration: Duration) -> LeaseMaintainer {
        {
            let mut schedule = self.shared.schedule();
            schedule.live.insert(lease, duration);
            schedule
                .deadlines
                .push(Reverse((Instant::now() + duration / 2, lease)));
        }
        self.shared.wake.notify_one();

        LeaseMaintainer {
            lease,
            shared: Arc::clone(&self.shared),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Number of leases currently being renewed.
    pub fn live(&self) -> usize {
        self.shared.schedule().live.len()
    }
}

impl Drop for LeaseScheduler {
    fn drop(&mut self) {
        self.shared.schedule().closed = true;
        self.shared.wake.notify_one();
    }
}

async fn run(shared: Arc<Shared>) {
    loop {
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = match shared.renew_due() {
            Ok(next) => next,
            Err(()) => return,
        };

        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut notified => {}
                }
            }
            None => notified.await,
        }
    }
}

/// Keeps one lease alive until [`cancel`](LeaseMaintainer::cancel) is called.
pub struct LeaseMaintainer {
    lease: LeaseHandle,
    shared: Arc<Shared>,
    cancelled: AtomicBool,
}

impl LeaseMaintainer {
    pub fn lease(&self) -> LeaseHandle {
        self.lease
    }

    /// Stops renewal and cancels the lease with the store. Idempotent.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.shared.cancel(self.lease);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Still being renewed: neither cancelled nor lost to a failed renewal.
    pub fn is_live(&self) -> bool {
        !self.is_cancelled() && self.shared.schedule().live.contains_key(&self.lease)
    }
}

impl std::fmt::Debug for LeaseMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseMaintainer")
            .field("lease", &self.lease)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

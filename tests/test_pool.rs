use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tuplegate::server::pool::{Handler, PoolError, PoolStatus, QueueHandle, WorkerPool};

struct Recorder {
    seen: UnboundedSender<u32>,
}

impl Handler<u32> for Recorder {
    async fn handle(&self, item: u32, _queue: QueueHandle<u32>) {
        let _ = self.seen.send(item);
    }
}

/// Counts down by putting `item - 1` back on the queue.
struct Countdown {
    seen: UnboundedSender<u32>,
}

impl Handler<u32> for Countdown {
    async fn handle(&self, item: u32, queue: QueueHandle<u32>) {
        let _ = self.seen.send(item);
        if item > 0 {
            let _ = queue.enqueue(item - 1);
        }
    }
}

/// Holds each item until the test adds a permit.
struct Blocker {
    release: Arc<Semaphore>,
    seen: UnboundedSender<u32>,
}

impl Handler<u32> for Blocker {
    async fn handle(&self, item: u32, _queue: QueueHandle<u32>) {
        let _ = self.seen.send(item);
        if let Ok(permit) = self.release.acquire().await {
            permit.forget();
        }
    }
}

fn recorder(capacity: usize, workers: usize) -> (WorkerPool<u32, Recorder>, UnboundedReceiver<u32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkerPool::new(capacity, workers, Recorder { seen: tx }), rx)
}

async fn collect(rx: &mut UnboundedReceiver<u32>, n: usize) -> Vec<u32> {
    let mut items = Vec::new();
    for _ in 0..n {
        let item = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("pool stalled")
            .expect("pool dropped its handler");
        items.push(item);
    }
    items
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn test_pool_dispatches_every_item() {
    let (pool, mut rx) = recorder(8, 3);

    for i in 0..5 {
        assert_eq!(pool.enqueue(i), Ok(true));
    }

    let mut seen = collect(&mut rx, 5).await;
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_pool_full_queue_refuses() {
    let (pool, mut rx) = recorder(2, 1);
    pool.set_status(PoolStatus::Inactive).await.unwrap();

    assert_eq!(pool.enqueue(1), Ok(true));
    assert_eq!(pool.enqueue(2), Ok(true));
    assert_eq!(pool.enqueue(3), Ok(false));
    assert_eq!(pool.offer(3), Ok(Some(3)));
    assert_eq!(pool.queued(), 2);

    pool.set_status(PoolStatus::Active).await.unwrap();
    assert_eq!(collect(&mut rx, 2).await, vec![1, 2]);
}

#[tokio::test]
async fn test_pool_enqueue_first_jumps_the_queue() {
    let (pool, mut rx) = recorder(4, 1);
    pool.set_status(PoolStatus::Inactive).await.unwrap();

    pool.enqueue(1).unwrap();
    pool.enqueue(2).unwrap();
    pool.enqueue_first(0).unwrap();

    pool.set_status(PoolStatus::Active).await.unwrap();
    assert_eq!(collect(&mut rx, 3).await, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_pool_inactive_waits_for_busy_workers() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    let pool = Arc::new(WorkerPool::new(
        4,
        1,
        Blocker {
            release: Arc::clone(&release),
            seen: tx,
        },
    ));

    pool.enqueue(1).unwrap();
    collect(&mut rx, 1).await;
    assert_eq!(pool.busy(), 1);

    let deactivating = Arc::clone(&pool);
    let deactivate = tokio::spawn(async move { deactivating.set_status(PoolStatus::Inactive).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!deactivate.is_finished());

    release.add_permits(1);
    deactivate.await.unwrap().unwrap();
    assert_eq!(pool.busy(), 0);

    // inactive pools accept but do not dispatch
    pool.enqueue(2).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.queued(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_pool_drained_refuses_new_work_and_empties_queue() {
    let (pool, mut rx) = recorder(8, 2);
    pool.set_status(PoolStatus::Inactive).await.unwrap();
    for i in 0..4 {
        pool.enqueue(i).unwrap();
    }

    pool.set_status(PoolStatus::Drained).await.unwrap();

    assert_eq!(pool.queued(), 0);
    assert_eq!(pool.busy(), 0);
    assert_eq!(pool.enqueue(9), Ok(false));

    let mut seen = collect(&mut rx, 4).await;
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_pool_terminated_is_terminal() {
    let (pool, _rx) = recorder(4, 3);

    pool.set_status(PoolStatus::Terminated).await.unwrap();

    assert_eq!(pool.live(), 0);
    assert_eq!(pool.enqueue(1), Err(PoolError::Terminated));
    assert_eq!(pool.set_status(PoolStatus::Active).await, Err(PoolError::Terminated));
}

#[tokio::test]
async fn test_pool_set_thread_number_grows_and_shrinks() {
    let (pool, mut rx) = recorder(8, 2);
    assert_eq!(pool.live(), 2);

    pool.set_thread_number(5);
    assert_eq!(pool.live(), 5);

    pool.set_thread_number(1);
    eventually(|| pool.live() == 1).await;

    pool.enqueue(7).unwrap();
    assert_eq!(collect(&mut rx, 1).await, vec![7]);
}

#[tokio::test]
async fn test_handler_can_requeue_work() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = WorkerPool::new(2, 2, Countdown { seen: tx });

    pool.enqueue(3).unwrap();

    assert_eq!(collect(&mut rx, 4).await, vec![3, 2, 1, 0]);
}

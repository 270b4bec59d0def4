use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tuplegate::cache::{BindingCache, BindingEntry, TupleCache, TupleEntry};
use tuplegate::store::{
    DataTuple, LeaseHandle, LeaseScheduler, MemoryStore, ResourceHandle, Tuple,
};

const LEASE: Duration = Duration::from_secs(60);

fn entry(leases: &LeaseScheduler, path: &str, lease: u64) -> Arc<BindingEntry> {
    Arc::new(BindingEntry::new(
        path,
        leases.maintain(LeaseHandle(lease), LEASE),
        ResourceHandle {
            id: lease,
            path: path.to_string(),
        },
    ))
}

fn tuple(path: &str, data: &'static [u8]) -> TupleEntry {
    TupleEntry {
        path: path.to_string(),
        value: Tuple::Data(DataTuple {
            name: path.rsplit('/').next().unwrap_or_default().to_string(),
            content_type: None,
            data: Bytes::from_static(data),
        }),
    }
}

#[tokio::test]
async fn test_binding_cache_evicts_exactly_one_over_capacity() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store.clone()));
    let cache = BindingCache::new(3);

    let mut displaced = Vec::new();
    for i in 1..=4 {
        if let Some(evicted) = cache.add_entry(entry(&leases, &format!("/r{i}"), i)) {
            displaced.push(evicted);
        }
    }

    assert_eq!(displaced.len(), 1);
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.capacity(), 3);

    // nobody else held the evicted binding, so its lease is gone
    let evicted = &displaced[0];
    assert_eq!(evicted.ref_count(), 0);
    assert!(evicted.is_cancelled());
    assert!(store.is_cancelled(evicted.lease()));
    assert!(cache.get_entry(evicted.path()).is_none());
}

#[tokio::test]
async fn test_binding_held_by_request_survives_eviction() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store.clone()));
    let cache = BindingCache::new(1);

    cache.add_entry(entry(&leases, "/a", 1));
    let held = cache.get_entry("/a").unwrap();
    assert_eq!(held.ref_count(), 2);

    let evicted = cache.add_entry(entry(&leases, "/b", 2)).unwrap();
    assert!(Arc::ptr_eq(&evicted, &held));
    assert_eq!(held.ref_count(), 1);
    assert!(!held.is_cancelled());
    assert!(!store.is_cancelled(LeaseHandle(1)));

    assert_eq!(held.release(), 0);
    assert!(held.is_cancelled());
    assert!(store.is_cancelled(LeaseHandle(1)));
}

#[tokio::test]
async fn test_binding_hits_increment_refcount_by_one() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store));
    let cache = BindingCache::new(4);

    let original = entry(&leases, "/docs", 7);
    cache.add_entry(Arc::clone(&original));

    let first = cache.get_entry("/docs").unwrap();
    assert_eq!(original.ref_count(), 2);
    let second = cache.get_entry("/docs").unwrap();
    assert_eq!(original.ref_count(), 3);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.resource(), second.resource());

    assert_eq!(first.release(), 2);
    assert_eq!(second.release(), 1);
    assert!(!original.is_cancelled());
}

#[tokio::test]
async fn test_binding_cache_clear_releases_everything() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store.clone()));
    let cache = BindingCache::new(4);

    cache.add_entry(entry(&leases, "/a", 1));
    cache.add_entry(entry(&leases, "/b", 2));
    assert_eq!(leases.live(), 2);

    cache.clear();

    assert!(cache.is_empty());
    assert!(store.is_cancelled(LeaseHandle(1)));
    assert!(store.is_cancelled(LeaseHandle(2)));
    assert_eq!(leases.live(), 0);
}

#[tokio::test]
async fn test_release_past_zero_does_not_cancel_twice() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store));
    let binding = entry(&leases, "/a", 1);

    assert_eq!(binding.release(), 0);
    assert_eq!(binding.release(), 0);
    assert!(binding.is_cancelled());
}

#[test]
fn test_tuple_cache_evicts_exactly_one_over_capacity() {
    let cache = TupleCache::new(2);

    assert!(cache.add_entry(tuple("/a", b"a")).is_none());
    assert!(cache.add_entry(tuple("/b", b"b")).is_none());
    let evicted = cache.add_entry(tuple("/c", b"c"));

    assert!(evicted.is_some());
    assert_eq!(cache.len(), 2);
    assert!(cache.get_entry("/c").is_some());
}

#[test]
fn test_tuple_cache_repeated_hits_return_same_value() {
    let cache = TupleCache::new(4);
    cache.add_entry(tuple("/docs/a.html", b"<p>a</p>"));

    let first = cache.get_entry("/docs/a.html").unwrap();
    let second = cache.get_entry("/docs/a.html").unwrap();

    assert_eq!(first, second);
    assert_eq!(first, tuple("/docs/a.html", b"<p>a</p>"));
    assert!(cache.get_entry("/docs/b.html").is_none());
}

#[test]
fn test_tuple_cache_prefers_unreferenced_victims() {
    let cache = TupleCache::new(2);
    cache.add_entry(tuple("/a", b"a"));
    cache.add_entry(tuple("/b", b"b"));

    // first insert past capacity sweeps every bit and takes the first slot
    let evicted = cache.add_entry(tuple("/c", b"c")).unwrap();
    assert_eq!(evicted.path, "/a");

    // "/b" lost its bit in that sweep while "/c" is fresh
    let evicted = cache.add_entry(tuple("/d", b"d")).unwrap();
    assert_eq!(evicted.path, "/b");
}

#[tokio::test]
async fn test_binding_with_failed_renewal_is_a_miss() {
    let store = MemoryStore::new(1024, LEASE);
    let leases = LeaseScheduler::start(Arc::new(store.clone()));
    let cache = BindingCache::new(4);

    // the store never granted lease 9, so its first renewal fails
    let binding = Arc::new(BindingEntry::new(
        "/gone",
        leases.maintain(LeaseHandle(9), Duration::from_millis(20)),
        ResourceHandle {
            id: 9,
            path: "/gone".to_string(),
        },
    ));
    cache.add_entry(Arc::clone(&binding));
    assert!(!binding.is_revoked());

    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(binding.is_revoked());
    assert!(cache.get_entry("/gone").is_none());
    assert!(cache.is_empty());
    assert_eq!(binding.ref_count(), 0);
    assert_eq!(leases.live(), 0);
}

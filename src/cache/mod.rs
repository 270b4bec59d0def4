//! Fixed-capacity caches with clock (second-chance) eviction.
//!
//! Two caches sit in front of the tuple store:
//!
//! - **`binding`**: leased handles to backend resources, reference counted so a
//!   lease is only cancelled once no in-flight request still uses it
//! - **`tuple`**: immutable tuple snapshots keyed by full path
//!
//! Both are built on [`SlotCache`], which stores entries in a fixed slice and
//! keeps the lookup table pointing at slot indices. Victim selection is done by
//! [`Clock`], which knows nothing about what the slots hold.
//!
//! ```text
//!   hand ─┐
//!         ▼
//!   [A:1][B:0][C:1][D:1]      find_victim() clears A, stops at B
//! ```

pub mod binding;
pub mod tuple;

pub use binding::{BindingCache, BindingEntry};
pub use tuple::{TupleCache, TupleEntry};

use std::collections::HashMap;
use std::hash::Hash;

/// Clock approximation of LRU over a fixed number of slots.
///
/// One reference bit per slot plus a rotating hand. Never true LRU, O(1)
/// amortized per victim.
#[derive(Debug, Clone)]
pub struct Clock {
    bits: Vec<bool>,
    hand: usize,
}

impl Clock {
    /// Creates a clock over `capacity` slots, all bits clear.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            bits: vec![false; capacity],
            hand: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    /// Returns a slot whose reference bit is clear.
    ///
    /// Scans circularly from where the previous scan stopped, clearing every
    /// set bit it passes. The hand is left one past the returned slot.
    pub fn find_victim(&mut self) -> usize {
        loop {
            let slot = self.hand;
            self.hand = (self.hand + 1) % self.bits.len();

            if self.bits[slot] {
                self.bits[slot] = false;
            } else {
                return slot;
            }
        }
    }

    /// Marks a slot as recently used.
    pub fn reference(&mut self, slot: usize) {
        self.bits[slot] = true;
    }

    /// Reads a slot's reference bit.
    pub fn get(&self, slot: usize) -> bool {
        self.bits[slot]
    }

    fn clear(&mut self, slot: usize) {
        self.bits[slot] = false;
    }
}

/// Entry array plus key-to-slot lookup table driven by a [`Clock`].
///
/// Not synchronized; the typed caches wrap it in a mutex.
#[derive(Debug)]
pub struct SlotCache<K, E> {
    clock: Clock,
    slots: Vec<Option<(K, E)>>,
    index: HashMap<K, usize>,
}

impl<K, E> SlotCache<K, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        let clock = Clock::new(capacity);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            clock,
            slots,
            index: HashMap::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.clock.capacity()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Looks up `key`, marking its slot referenced on a hit.
    pub fn get(&mut self, key: &K) -> Option<&E> {
        let slot = *self.index.get(key)?;
        self.clock.reference(slot);
        self.slots[slot].as_ref().map(|(_, entry)| entry)
    }

    /// Inserts `entry` under `key` and returns whatever it displaced.
    ///
    /// A key that is already cached keeps its slot and has its entry replaced;
    /// otherwise a victim slot is chosen by the clock and its occupant (if any)
    /// is unmapped and returned.
    pub fn insert(&mut self, key: K, entry: E) -> Option<(K, E)> {
        let slot = match self.index.get(&key) {
            Some(&slot) => slot,
            None => self.clock.find_victim(),
        };

        let displaced = self.slots[slot].take();
        if let Some((old_key, _)) = &displaced {
            self.index.remove(old_key);
        }

        self.index.insert(key.clone(), slot);
        self.slots[slot] = Some((key, entry));
        self.clock.reference(slot);

        displaced
    }

    /// Removes `key` and frees its slot.
    pub fn remove(&mut self, key: &K) -> Option<E> {
        let slot = self.index.remove(key)?;
        self.clock.clear(slot);
        self.slots[slot].take().map(|(_, entry)| entry)
    }

    /// Drains every live entry, leaving the cache empty.
    pub fn drain(&mut self) -> Vec<(K, E)> {
        self.index.clear();
        for slot in 0..self.slots.len() {
            self.clock.clear(slot);
        }
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Reference bit of the slot holding `key`, if cached.
    pub fn is_referenced(&self, key: &K) -> Option<bool> {
        self.index.get(key).map(|&slot| self.clock.get(slot))
    }
}

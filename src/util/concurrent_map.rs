//! A hash table with lock-free reads and serialized writes.
//!
//! Readers never block. They pin the current epoch, load the bucket array, and probe it linearly.
//! Writers are serialized by an internal lock. A resize builds a complete new bucket array, swaps
//! it in with a single release store, and retires the old array through `crossbeam::epoch`, so an
//! in-flight reader keeps a valid (possibly stale) array until it unpins.
//!
//! Keys and values live in their own heap cells. `insert` stores the value before the key, and
//! `remove` clears the value before it tombstones the key. A reader that finds a matching key with
//! a null value has raced with a `remove` and retries.
//!
//! `remove` never compacts probe chains. Tombstones count towards the resize trigger, and a resize
//! that finds few live entries rehashes at the same size, which is what clears them.

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::util::options::DEFAULT_MAP_CAPACITY;

/// The tag a key pointer carries when the slot holds a removed entry.
const TOMBSTONE_TAG: usize = 1;

/// Hashing and equality for the keys of a `ConcurrentMap`.
pub trait KeyStrategy<K>: Send + Sync {
    fn hash(&self, key: &K) -> u32;
    fn equals(&self, a: &K, b: &K) -> bool;
}

/// The default strategy: the key's own `Hash` and `Eq`.
#[derive(Copy, Clone, Debug, Default)]
pub struct HashEq;

impl<K: Hash + Eq> KeyStrategy<K> for HashEq {
    fn hash(&self, key: &K) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }

    fn equals(&self, a: &K, b: &K) -> bool {
        a == b
    }
}

/// Final avalanche step of murmur3. Spreads weak hashes over the low bits we mask with.
fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

// Over-aligned so that the key pointer has a free low bit for the tombstone tag.
#[repr(align(8))]
struct KeyCell<K>(K);

struct Slot<K, V> {
    key: Atomic<KeyCell<K>>,
    value: Atomic<V>,
}

impl<K, V> Slot<K, V> {
    fn empty() -> Self {
        Slot {
            key: Atomic::null(),
            value: Atomic::null(),
        }
    }
}

/// One bucket array. Dropping a table frees only the array: the keys and values it points to are
/// owned by whichever table is current, or were retired individually by `remove`.
struct Table<K, V> {
    slots: Box<[Slot<K, V>]>,
}

impl<K, V> Table<K, V> {
    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Table {
            slots: (0..size).map(|_| Slot::empty()).collect(),
        }
    }

    fn size(&self) -> usize {
        self.slots.len()
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }
}

fn is_tombstone<T>(p: Shared<'_, T>) -> bool {
    p.is_null() && p.tag() == TOMBSTONE_TAG
}

fn is_empty<T>(p: Shared<'_, T>) -> bool {
    p.is_null() && p.tag() == 0
}

struct WriterState {
    elements: usize,
    tombstones: usize,
    /// Resize once `elements + tombstones` reaches this (three quarters of the table size).
    overflow: usize,
}

impl WriterState {
    fn for_size(size: usize, elements: usize) -> Self {
        WriterState {
            elements,
            tombstones: 0,
            overflow: size * 3 / 4,
        }
    }
}

/// A single-writer, many-reader hash table. See the module documentation.
pub struct ConcurrentMap<K, V, S = HashEq> {
    table: Atomic<Table<K, V>>,
    writer: Mutex<WriterState>,
    strategy: S,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> ConcurrentMap<K, V, HashEq>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_strategy(capacity, HashEq)
    }
}

impl<K, V> Default for ConcurrentMap<K, V, HashEq>
where
    K: Hash + Eq + Send + Sync,
    V: Clone + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> ConcurrentMap<K, V, S>
where
    K: Send + Sync,
    V: Clone + Send + Sync,
    S: KeyStrategy<K>,
{
    /// Create a map whose bucket array starts at `capacity` slots. `capacity` must be a power of
    /// two.
    pub fn with_strategy(capacity: usize, strategy: S) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ConcurrentMap capacity {} is not a power of two",
            capacity
        );
        ConcurrentMap {
            table: Atomic::new(Table::with_size(capacity)),
            writer: Mutex::new(WriterState::for_size(capacity, 0)),
            strategy,
            _marker: PhantomData,
        }
    }

    fn hash_of(&self, key: &K) -> usize {
        mix(self.strategy.hash(key)) as usize
    }

    /// Look up `key`. Never blocks, and may run concurrently with a writer.
    pub fn lookup(&self, key: &K) -> Option<V> {
        let guard = &epoch::pin();
        let hash = self.hash_of(key);
        'retry: loop {
            let table_ptr = self.table.load(Ordering::Acquire, guard);
            let table = unsafe { table_ptr.deref() };
            let mask = table.mask();
            let mut index = hash & mask;
            for _ in 0..table.size() {
                let slot = &table.slots[index];
                let k = slot.key.load(Ordering::Acquire, guard);
                if is_empty(k) {
                    break;
                }
                if !k.is_null() && self.strategy.equals(&unsafe { k.deref() }.0, key) {
                    let v = slot.value.load(Ordering::Acquire, guard);
                    if v.is_null() {
                        // A remove cleared the value and has not tombstoned the key yet.
                        std::hint::spin_loop();
                        continue 'retry;
                    }
                    return Some(unsafe { v.deref() }.clone());
                }
                index = (index + 1) & mask;
            }
            // A miss only counts if the array did not change under us.
            if self.table.load(Ordering::Acquire, guard) != table_ptr {
                trace!("ConcurrentMap: bucket array replaced during lookup, retrying");
                continue 'retry;
            }
            return None;
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Find the slot holding `key` in `table`. Writer side only.
    fn find_slot<'g>(&self, table: &'g Table<K, V>, key: &K, guard: &'g Guard) -> Option<usize> {
        let mask = table.mask();
        let mut index = self.hash_of(key) & mask;
        for _ in 0..table.size() {
            let k = table.slots[index].key.load(Ordering::Relaxed, guard);
            if is_empty(k) {
                return None;
            }
            if !k.is_null() && self.strategy.equals(&unsafe { k.deref() }.0, key) {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
        None
    }

    /// Insert `key -> value`, returning the previous value for `key` if there was one.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut state = self.writer.lock().unwrap();
        self.insert_locked(&mut state, key, value)
    }

    fn insert_locked(&self, state: &mut WriterState, key: K, value: V) -> Option<V> {
        let guard = &epoch::pin();
        let table = unsafe { self.table.load(Ordering::Relaxed, guard).deref() };

        if let Some(index) = self.find_slot(table, &key, guard) {
            let old = table.slots[index]
                .value
                .swap(Owned::new(value), Ordering::Release, guard);
            let previous = unsafe { old.deref() }.clone();
            unsafe { guard.defer_destroy(old) };
            return Some(previous);
        }

        if state.elements + state.tombstones >= state.overflow {
            self.resize(state, guard);
        }

        let table = unsafe { self.table.load(Ordering::Relaxed, guard).deref() };
        let mask = table.mask();
        let mut index = self.hash_of(&key) & mask;
        loop {
            let slot = &table.slots[index];
            if is_empty(slot.key.load(Ordering::Relaxed, guard)) {
                // The value must be visible before the key that leads readers to it.
                slot.value.store(Owned::new(value), Ordering::Release);
                slot.key.store(Owned::new(KeyCell(key)), Ordering::Release);
                state.elements += 1;
                trace!(
                    "ConcurrentMap: inserted at {} ({} live, {} tombstones)",
                    index,
                    state.elements,
                    state.tombstones
                );
                return None;
            }
            index = (index + 1) & mask;
        }
    }

    /// Return the value for `key`, inserting the result of `make` if it is absent. `make` runs at
    /// most once, under the writer lock, and only if no value was found.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce() -> V) -> V {
        if let Some(v) = self.lookup(&key) {
            return v;
        }
        let mut state = self.writer.lock().unwrap();
        if let Some(v) = self.lookup(&key) {
            return v;
        }
        let value = make();
        self.insert_locked(&mut state, key, value.clone());
        value
    }

    /// Remove `key`, returning its value. The slot becomes a tombstone; the probe chain through it
    /// is left as it is.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut state = self.writer.lock().unwrap();
        let guard = &epoch::pin();
        let table = unsafe { self.table.load(Ordering::Relaxed, guard).deref() };
        let index = self.find_slot(table, key, guard)?;
        let slot = &table.slots[index];

        // Clear the value first: a reader that already matched the key must see null and retry.
        let old_value = slot.value.swap(Shared::null(), Ordering::Release, guard);
        let old_key = slot.key.swap(
            Shared::null().with_tag(TOMBSTONE_TAG),
            Ordering::Release,
            guard,
        );
        debug_assert!(!old_value.is_null() && !old_key.is_null());
        let previous = unsafe { old_value.deref() }.clone();
        unsafe {
            guard.defer_destroy(old_value);
            guard.defer_destroy(old_key);
        }
        state.elements -= 1;
        state.tombstones += 1;
        Some(previous)
    }

    /// Replace the bucket array. Doubles it unless most of the occupied slots are tombstones, in
    /// which case it rehashes at the current size.
    fn resize(&self, state: &mut WriterState, guard: &Guard) {
        let old_ptr = self.table.load(Ordering::Relaxed, guard);
        let old = unsafe { old_ptr.deref() };
        let new_size = if state.elements >= state.overflow / 2 {
            old.size() * 2
        } else {
            old.size()
        };
        let new = Table::with_size(new_size);
        let mask = new.mask();

        let mut moved = 0;
        for slot in old.slots.iter() {
            let k = slot.key.load(Ordering::Relaxed, guard);
            if k.is_null() {
                continue;
            }
            let v = slot.value.load(Ordering::Relaxed, guard);
            let mut index = self.hash_of(&unsafe { k.deref() }.0) & mask;
            while !is_empty(new.slots[index].key.load(Ordering::Relaxed, guard)) {
                index = (index + 1) & mask;
            }
            new.slots[index].value.store(v, Ordering::Relaxed);
            new.slots[index].key.store(k, Ordering::Relaxed);
            moved += 1;
        }
        debug_assert_eq!(moved, state.elements);

        debug!(
            "ConcurrentMap: resized {} -> {} ({} live, {} tombstones dropped)",
            old.size(),
            new_size,
            state.elements,
            state.tombstones
        );
        // The release store publishes every slot written above.
        let old_ptr = self.table.swap(Owned::new(new), Ordering::Release, guard);
        unsafe { guard.defer_destroy(old_ptr) };
        *state = WriterState::for_size(new_size, moved);
    }

    /// The number of live entries.
    pub fn len(&self) -> usize {
        self.writer.lock().unwrap().elements
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current bucket count.
    pub fn table_size(&self) -> usize {
        let guard = &epoch::pin();
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }.size()
    }

    /// Call `f` on every live entry of the current bucket array. Holds the writer lock, so `f`
    /// must not write to this map.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        let _state = self.writer.lock().unwrap();
        let guard = &epoch::pin();
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        for slot in table.slots.iter() {
            let k = slot.key.load(Ordering::Acquire, guard);
            let v = slot.value.load(Ordering::Acquire, guard);
            if !k.is_null() && !v.is_null() {
                f(unsafe { &k.deref().0 }, unsafe { v.deref() });
            }
        }
    }
}

impl<K, V, S> Drop for ConcurrentMap<K, V, S> {
    fn drop(&mut self) {
        // `&mut self` means no reader or writer can be active.
        unsafe {
            let guard = epoch::unprotected();
            let table = self.table.load(Ordering::Relaxed, guard);
            for slot in table.deref().slots.iter() {
                let k = slot.key.load(Ordering::Relaxed, guard);
                if !k.is_null() {
                    drop(k.into_owned());
                }
                let v = slot.value.load(Ordering::Relaxed, guard);
                if !v.is_null() {
                    drop(v.into_owned());
                }
            }
            drop(table.into_owned());
        }
    }
}

impl<K, V, S> std::fmt::Debug for ConcurrentMap<K, V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.writer.lock().unwrap();
        f.debug_struct("ConcurrentMap")
            .field("elements", &state.elements)
            .field("tombstones", &state.tombstones)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::panic_after;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    #[test]
    fn insert_lookup_remove() {
        let map: ConcurrentMap<u64, String> = ConcurrentMap::new();
        assert_eq!(map.insert(1, "one".to_string()), None);
        assert_eq!(map.insert(2, "two".to_string()), None);
        assert_eq!(map.lookup(&1).as_deref(), Some("one"));
        assert_eq!(map.insert(1, "uno".to_string()).as_deref(), Some("one"));
        assert_eq!(map.lookup(&1).as_deref(), Some("uno"));
        assert_eq!(map.remove(&1).as_deref(), Some("uno"));
        assert_eq!(map.lookup(&1), None);
        assert_eq!(map.remove(&1), None);
        assert_eq!(map.lookup(&2).as_deref(), Some("two"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn doubles_when_crossing_load_factor() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::with_capacity(32);
        for i in 0..24 {
            map.insert(i, i * 10);
        }
        assert_eq!(map.table_size(), 32);
        map.insert(24, 240);
        assert_eq!(map.table_size(), 64);
        for i in 0..25 {
            assert_eq!(map.lookup(&i), Some(i * 10));
        }
    }

    #[test]
    fn tombstones_force_same_size_rehash() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::with_capacity(32);
        // Cycle through fresh keys so every removal leaves a tombstone behind.
        for i in 0..1000 {
            map.insert(i, i);
            if i >= 4 {
                assert_eq!(map.remove(&(i - 4)), Some(i - 4));
            }
        }
        assert_eq!(map.len(), 4);
        assert_eq!(map.table_size(), 32);
        for i in 996..1000 {
            assert_eq!(map.lookup(&i), Some(i));
        }
        assert_eq!(map.lookup(&995), None);
    }

    #[test]
    fn get_or_insert_with_runs_once() {
        let map: ConcurrentMap<&'static str, usize> = ConcurrentMap::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = map.get_or_insert_with("List`1", || calls.fetch_add(1, Ordering::SeqCst) + 7);
            assert_eq!(v, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct CaseInsensitive;

    impl KeyStrategy<String> for CaseInsensitive {
        fn hash(&self, key: &String) -> u32 {
            key.bytes()
                .fold(5381u32, |h, b| h.wrapping_mul(33) ^ b.to_ascii_lowercase() as u32)
        }
        fn equals(&self, a: &String, b: &String) -> bool {
            a.eq_ignore_ascii_case(b)
        }
    }

    #[test]
    fn custom_strategy() {
        let map = ConcurrentMap::with_strategy(32, CaseInsensitive);
        map.insert("System.Object".to_string(), 1);
        assert_eq!(map.lookup(&"system.object".to_string()), Some(1));
        assert_eq!(map.insert("SYSTEM.OBJECT".to_string(), 2), Some(1));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn for_each_visits_live_entries() {
        let map: ConcurrentMap<u32, u32> = ConcurrentMap::new();
        for i in 0..10 {
            map.insert(i, i);
        }
        map.remove(&3);
        let mut seen = vec![];
        map.for_each(|k, v| {
            assert_eq!(k, v);
            seen.push(*k);
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn readers_never_miss_stable_keys_during_resize() {
        panic_after(10_000, || {
            let map: Arc<ConcurrentMap<u64, u64>> = Arc::new(ConcurrentMap::with_capacity(32));
            // Keys 0..8 are present for the whole test.
            for i in 0..8 {
                map.insert(i, i);
            }
            let done = Arc::new(AtomicBool::new(false));
            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let map = map.clone();
                    let done = done.clone();
                    std::thread::spawn(move || {
                        while !done.load(Ordering::Relaxed) {
                            for i in 0..8 {
                                assert_eq!(map.lookup(&i), Some(i));
                            }
                        }
                    })
                })
                .collect();
            for i in 8..5000 {
                map.insert(i, i);
                if i % 3 == 0 {
                    map.remove(&i);
                }
            }
            done.store(true, Ordering::Relaxed);
            for r in readers {
                r.join().unwrap();
            }
        });
    }

    #[test]
    #[should_panic]
    fn capacity_must_be_power_of_two() {
        let _map: ConcurrentMap<u32, u32> = ConcurrentMap::with_capacity(30);
    }
}

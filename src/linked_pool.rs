// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Fixed-capacity slot allocator.
//!
//! Everything handle-indexed in this crate (command list records, events and the
//! headless backend's object tables) is built on [LinkedPool].
//!
//! # Layout
//!
//! The pool is an arena of tagged cells.  A cell is either a live record or a vacant cell
//! holding the index of the next vacant cell, so the free list lives in the storage itself and
//! no auxiliary bitmap or index stack is needed.  Acquire pops the head of the free list and
//! release pushes onto it; both are O(1).
//!
//! # Handles
//!
//! A [PoolHandle] is only an index.  It is valid between [LinkedPool::acquire] and the matching
//! [LinkedPool::release].  There is no generation check; resolving a handle whose cell is vacant
//! panics, while resolving a stale handle whose cell was re-acquired silently reaches the new
//! record.  Callers are responsible for not holding handles past release.

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use wasm_safe_mutex::Mutex;

enum Slot<T> {
    Occupied(T),
    Vacant { next: Option<u32> },
}

/// Index of a live record in a [LinkedPool] of `T`.
pub struct PoolHandle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PoolHandle<T> {
    fn new(index: u32) -> Self {
        PoolHandle {
            index,
            _marker: PhantomData,
        }
    }
    /// Rebuilds a handle from an index previously taken from [Self::index].
    pub(crate) fn from_raw(index: u32) -> Self {
        Self::new(index)
    }
    pub fn index(self) -> u32 {
        self.index
    }
}

//derives would put bounds on T
impl<T> Clone for PoolHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for PoolHandle<T> {}
impl<T> PartialEq for PoolHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for PoolHandle<T> {}
impl<T> Hash for PoolHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
impl<T> Debug for PoolHandle<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolHandle({})", self.index)
    }
}

/// Fixed-capacity pool of `T` records with O(1) acquire and release.
///
/// Not synchronized; see [SyncLinkedPool] for the locked variant.
pub struct LinkedPool<T> {
    slots: Vec<Slot<T>>,
    first_free: Option<u32>,
    len: usize,
    initialized: bool,
}

impl<T> LinkedPool<T> {
    /// Creates an empty pool.  It must be [initialize](Self::initialize)d before use.
    pub const fn new() -> Self {
        LinkedPool {
            slots: Vec::new(),
            first_free: None,
            len: 0,
            initialized: false,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = Self::new();
        pool.initialize(capacity);
        pool
    }

    /// Allocates storage for `capacity` records.
    ///
    /// # Panics
    /// If the pool was already initialized, or `capacity` does not fit a `u32` index.
    pub fn initialize(&mut self, capacity: usize) {
        assert!(!self.initialized, "LinkedPool initialized twice");
        assert!(
            capacity <= u32::MAX as usize,
            "LinkedPool capacity {capacity} exceeds the index range"
        );
        self.slots = (0..capacity)
            .map(|i| Slot::Vacant {
                next: if i + 1 < capacity {
                    Some(i as u32 + 1)
                } else {
                    None
                },
            })
            .collect();
        self.first_free = if capacity > 0 { Some(0) } else { None };
        self.len = 0;
        self.initialized = true;
    }

    /// Moves `value` into an unused cell and returns its handle.
    ///
    /// # Panics
    /// If the pool is full or uninitialized.  Running out of records means the pool was
    /// provisioned too small or records are leaking upstream.
    pub fn acquire(&mut self, value: T) -> PoolHandle<T> {
        assert!(self.initialized, "LinkedPool used before initialize");
        let index = match self.first_free {
            Some(index) => index,
            None => panic!("LinkedPool is full ({} records)", self.slots.len()),
        };
        let slot = &mut self.slots[index as usize];
        let next = match slot {
            Slot::Vacant { next } => *next,
            Slot::Occupied(_) => unreachable!("free list points at a live record"),
        };
        *slot = Slot::Occupied(value);
        self.first_free = next;
        self.len += 1;
        PoolHandle::new(index)
    }

    /// Moves the record out and returns its cell to the free list.
    ///
    /// # Panics
    /// If the cell is vacant (double release).
    pub fn release(&mut self, handle: PoolHandle<T>) -> T {
        let index = handle.index;
        let slot = &mut self.slots[index as usize];
        match std::mem::replace(
            slot,
            Slot::Vacant {
                next: self.first_free,
            },
        ) {
            Slot::Occupied(value) => {
                self.first_free = Some(index);
                self.len -= 1;
                value
            }
            vacant @ Slot::Vacant { .. } => {
                *slot = vacant;
                panic!("released {handle:?}, which is not acquired");
            }
        }
    }

    pub fn get(&self, handle: PoolHandle<T>) -> &T {
        match &self.slots[handle.index as usize] {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("{handle:?} is not acquired"),
        }
    }

    pub fn get_mut(&mut self, handle: PoolHandle<T>) -> &mut T {
        match &mut self.slots[handle.index as usize] {
            Slot::Occupied(value) => value,
            Slot::Vacant { .. } => panic!("{handle:?} is not acquired"),
        }
    }

    pub fn contains(&self, handle: PoolHandle<T>) -> bool {
        matches!(
            self.slots.get(handle.index as usize),
            Some(Slot::Occupied(_))
        )
    }

    pub fn is_full(&self) -> bool {
        self.len == self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Visits every live record.
    ///
    /// This walks the whole storage and is meant for diagnostics and teardown, not hot paths.
    pub fn iter(&self) -> impl Iterator<Item = (PoolHandle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied(value) => Some((PoolHandle::new(i as u32), value)),
                Slot::Vacant { .. } => None,
            })
    }

    /// Releases every live record, returning them in index order.
    pub fn drain(&mut self) -> Vec<T> {
        let handles: Vec<_> = self.iter().map(|(h, _)| h).collect();
        handles.into_iter().map(|h| self.release(h)).collect()
    }
}

impl<T> Default for LinkedPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for LinkedPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedPool")
            .field("len", &self.len)
            .field("capacity", &self.slots.len())
            .finish()
    }
}

/// A [LinkedPool] behind one mutex, for pools shared between recording and submission threads.
pub struct SyncLinkedPool<T> {
    pool: Mutex<LinkedPool<T>>,
}

impl<T> SyncLinkedPool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        SyncLinkedPool {
            pool: Mutex::new(LinkedPool::with_capacity(capacity)),
        }
    }

    pub fn acquire(&self, value: T) -> PoolHandle<T> {
        self.pool.lock_sync().acquire(value)
    }

    pub fn release(&self, handle: PoolHandle<T>) -> T {
        self.pool.lock_sync().release(handle)
    }

    /// Runs `f` on the live record.  The pool lock is held for the duration of `f`.
    pub fn with<R>(&self, handle: PoolHandle<T>, f: impl FnOnce(&T) -> R) -> R {
        let pool = self.pool.lock_sync();
        f(pool.get(handle))
    }

    pub fn with_mut<R>(&self, handle: PoolHandle<T>, f: impl FnOnce(&mut T) -> R) -> R {
        let mut pool = self.pool.lock_sync();
        f(pool.get_mut(handle))
    }

    pub fn contains(&self, handle: PoolHandle<T>) -> bool {
        self.pool.lock_sync().contains(handle)
    }

    pub fn is_full(&self) -> bool {
        self.pool.lock_sync().is_full()
    }

    pub fn len(&self) -> usize {
        self.pool.lock_sync().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock_sync().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pool.lock_sync().capacity()
    }

    pub fn drain(&self) -> Vec<T> {
        self.pool.lock_sync().drain()
    }
}

impl<T> Debug for SyncLinkedPool<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let pool = self.pool.lock_sync();
        f.debug_struct("SyncLinkedPool")
            .field("len", &pool.len())
            .field("capacity", &pool.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn four_acquires_are_a_permutation() {
        let mut pool = LinkedPool::with_capacity(4);
        let indices: HashSet<u32> = (0..4).map(|i| pool.acquire(i).index()).collect();
        assert_eq!(indices, (0..4).collect());
        assert!(pool.is_full());
    }

    #[test]
    #[should_panic(expected = "full")]
    fn fifth_acquire_panics() {
        let mut pool = LinkedPool::with_capacity(4);
        for i in 0..5 {
            pool.acquire(i);
        }
    }

    #[test]
    fn released_index_is_reused() {
        let mut pool = LinkedPool::with_capacity(4);
        let handles: Vec<_> = (0..4).map(|i| pool.acquire(i * 10)).collect();
        assert_eq!(pool.release(handles[2]), 20);
        assert!(!pool.is_full());
        let again = pool.acquire(99);
        assert_eq!(again, handles[2]);
        assert_eq!(*pool.get(again), 99);
    }

    #[test]
    fn live_indices_stay_unique() {
        let mut pool = LinkedPool::with_capacity(8);
        let mut live = Vec::new();
        for round in 0..50u32 {
            if round % 3 == 2 && !live.is_empty() {
                let h = live.remove((round as usize) % live.len());
                pool.release(h);
            } else if !pool.is_full() {
                live.push(pool.acquire(round));
            }
            let unique: HashSet<_> = live.iter().map(|h: &PoolHandle<u32>| h.index()).collect();
            assert_eq!(unique.len(), live.len());
            assert_eq!(pool.len(), live.len());
        }
    }

    #[test]
    #[should_panic(expected = "initialized twice")]
    fn double_initialize_panics() {
        let mut pool: LinkedPool<u8> = LinkedPool::new();
        pool.initialize(2);
        pool.initialize(2);
    }

    #[test]
    #[should_panic(expected = "not acquired")]
    fn double_release_panics() {
        let mut pool = LinkedPool::with_capacity(2);
        let h = pool.acquire("a");
        pool.release(h);
        pool.release(h);
    }

    #[test]
    fn iter_and_drain_visit_live_records() {
        let mut pool = LinkedPool::with_capacity(4);
        let a = pool.acquire('a');
        let b = pool.acquire('b');
        pool.acquire('c');
        pool.release(b);
        let seen: Vec<char> = pool.iter().map(|(_, c)| *c).collect();
        assert_eq!(seen, vec!['a', 'c']);
        assert!(pool.contains(a));
        assert!(!pool.contains(b));
        assert_eq!(pool.drain(), vec!['a', 'c']);
        assert!(pool.is_empty());
    }

    #[test]
    fn sync_pool_shared_between_threads() {
        let pool = std::sync::Arc::new(SyncLinkedPool::with_capacity(64));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    let handles: Vec<_> = (0..16).map(|i| pool.acquire(t * 100 + i)).collect();
                    for h in &handles {
                        pool.with_mut(*h, |v| *v += 1);
                    }
                    handles
                })
            })
            .collect();
        let mut all = HashSet::new();
        for t in threads {
            for h in t.join().unwrap() {
                assert!(all.insert(h.index()));
            }
        }
        assert!(pool.is_full());
        assert_eq!(pool.drain().len(), 64);
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use wasm_safe_mutex::Mutex;

struct InFlight<V> {
    value: V,
    required_epoch: u64,
}

struct Bucket<V> {
    entries: VecDeque<InFlight<V>>,
    last_used: u64,
}

struct Inner<K, V> {
    buckets: HashMap<K, Bucket<V>>,
    generation: u64,
    len: usize,
}

/**
Maps a structural key to a bounded queue of parked values.

All operations take one mutex and never block on the GPU; a miss is reported immediately so the
caller can create a fresh object instead.
*/
pub struct MultiCache<K, V> {
    capacity_per_key: usize,
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash, V> MultiCache<K, V> {
    pub fn new(capacity_per_key: usize) -> Self {
        assert!(capacity_per_key > 0, "cache needs room for at least one value per key");
        MultiCache {
            capacity_per_key,
            inner: Mutex::new(Inner {
                buckets: HashMap::new(),
                generation: 0,
                len: 0,
            }),
        }
    }

    /// Takes the oldest value parked under `key` whose required epoch is `<= current_gpu_epoch`.
    ///
    /// Returns `None` on a miss.
    pub fn acquire(&self, key: &K, current_gpu_epoch: u64) -> Option<V> {
        let mut inner = self.inner.lock_sync();
        let generation = inner.generation;
        let bucket = inner.buckets.get_mut(key)?;
        bucket.last_used = generation;
        let position = bucket
            .entries
            .iter()
            .position(|e| e.required_epoch <= current_gpu_epoch)?;
        let entry = bucket.entries.remove(position)?;
        inner.len -= 1;
        Some(entry.value)
    }

    /**
    Parks `value` under `key` until the GPU reaches `current_cpu_epoch`.

    # Panics
    If the key already has `capacity_per_key` parked values.  The capacity should cover the
    worst-case number of frames in flight; overflowing it means values are churning faster than
    the GPU retires them.
    */
    pub fn free(&self, value: V, key: K, current_cpu_epoch: u64) {
        let mut inner = self.inner.lock_sync();
        let generation = inner.generation;
        let bucket = inner.buckets.entry(key).or_insert_with(|| Bucket {
            entries: VecDeque::with_capacity(self.capacity_per_key),
            last_used: generation,
        });
        bucket.last_used = generation;
        assert!(
            bucket.entries.len() < self.capacity_per_key,
            "cache bucket full ({capacity} values in flight for one key)",
            capacity = self.capacity_per_key
        );
        bucket.entries.push_back(InFlight {
            value,
            required_epoch: current_cpu_epoch,
        });
        inner.len += 1;
    }

    /**
    Advances the generation and evicts idle keys.

    A key is idle when it was last acquired or freed more than `max_age` generations ago.  Its
    values the GPU is done with (`required_epoch <= current_gpu_epoch`) go to `on_evict`; the
    key is dropped once it has nothing left.
    */
    pub fn cull(&self, current_gpu_epoch: u64, max_age: u64, mut on_evict: impl FnMut(V)) {
        let mut inner = self.inner.lock_sync();
        inner.generation += 1;
        let generation = inner.generation;
        let mut evicted = 0;
        inner.buckets.retain(|_, bucket| {
            if generation - bucket.last_used <= max_age {
                return true;
            }
            let mut kept = VecDeque::with_capacity(bucket.entries.len());
            for entry in bucket.entries.drain(..) {
                if entry.required_epoch <= current_gpu_epoch {
                    evicted += 1;
                    on_evict(entry.value);
                } else {
                    kept.push_back(entry);
                }
            }
            bucket.entries = kept;
            !bucket.entries.is_empty()
        });
        inner.len -= evicted;
    }

    /// Hands every parked value to `on_destroy` regardless of epoch.  Shutdown only.
    pub fn free_all(&self, mut on_destroy: impl FnMut(V)) {
        let mut inner = self.inner.lock_sync();
        for (_, bucket) in inner.buckets.drain() {
            for entry in bucket.entries {
                on_destroy(entry.value);
            }
        }
        inner.len = 0;
    }

    /// Parked values across all keys.
    pub fn len(&self) -> usize {
        self.inner.lock_sync().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_keys(&self) -> usize {
        self.inner.lock_sync().buckets.len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock_sync().generation
    }

    pub fn capacity_per_key(&self) -> usize {
        self.capacity_per_key
    }
}

impl<K, V> Debug for MultiCache<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock_sync();
        f.debug_struct("MultiCache")
            .field("len", &inner.len)
            .field("keys", &inner.buckets.len())
            .field("generation", &inner.generation)
            .finish()
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use wasm_safe_mutex::Mutex;

struct Slot<V> {
    parked: Option<(V, u64)>,
    last_used: u64,
}

struct Inner<K, V> {
    slots: HashMap<K, Slot<V>>,
    generation: u64,
}

/**
Like [super::MultiCache] with room for exactly one parked value per key.

Meant for objects that are expensive to create and rarely churn, such as pipeline state.  When a
second value is freed under an occupied key, [SingleCache::free] hands it back and the caller
disposes of it once the GPU is done with it.
*/
pub struct SingleCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Eq + Hash, V> SingleCache<K, V> {
    pub fn new() -> Self {
        SingleCache {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                generation: 0,
            }),
        }
    }

    pub fn acquire(&self, key: &K, current_gpu_epoch: u64) -> Option<V> {
        let mut inner = self.inner.lock_sync();
        let generation = inner.generation;
        let slot = inner.slots.get_mut(key)?;
        slot.last_used = generation;
        let retired = matches!(slot.parked, Some((_, epoch)) if epoch <= current_gpu_epoch);
        if retired {
            slot.parked.take().map(|(value, _)| value)
        } else {
            None
        }
    }

    /// Parks `value` under `key` until the GPU reaches `current_cpu_epoch`.
    ///
    /// Returns `Some(value)` if the key already holds a parked value.  The returned value must not
    /// be destroyed before the GPU reaches `current_cpu_epoch`.
    #[must_use]
    pub fn free(&self, value: V, key: K, current_cpu_epoch: u64) -> Option<V> {
        let mut inner = self.inner.lock_sync();
        let generation = inner.generation;
        let slot = inner.slots.entry(key).or_insert(Slot {
            parked: None,
            last_used: generation,
        });
        slot.last_used = generation;
        if slot.parked.is_some() {
            return Some(value);
        }
        slot.parked = Some((value, current_cpu_epoch));
        None
    }

    /// Advances the generation; keys idle for more than `max_age` generations release their
    /// retired value to `on_evict` and are dropped.
    pub fn cull(&self, current_gpu_epoch: u64, max_age: u64, mut on_evict: impl FnMut(V)) {
        let mut inner = self.inner.lock_sync();
        inner.generation += 1;
        let generation = inner.generation;
        inner.slots.retain(|_, slot| {
            if generation - slot.last_used <= max_age {
                return true;
            }
            match slot.parked.take() {
                Some((value, required_epoch)) if required_epoch <= current_gpu_epoch => {
                    on_evict(value);
                    false
                }
                Some(still_in_flight) => {
                    slot.parked = Some(still_in_flight);
                    true
                }
                None => false,
            }
        });
    }

    pub fn free_all(&self, mut on_destroy: impl FnMut(V)) {
        let mut inner = self.inner.lock_sync();
        for (_, slot) in inner.slots.drain() {
            if let Some((value, _)) = slot.parked {
                on_destroy(value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock_sync()
            .slots
            .values()
            .filter(|s| s.parked.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_keys(&self) -> usize {
        self.inner.lock_sync().slots.len()
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock_sync().generation
    }
}

impl<K: Eq + Hash, V> Default for SingleCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Debug for SingleCache<K, V> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock_sync();
        f.debug_struct("SingleCache")
            .field("keys", &inner.slots.len())
            .field("generation", &inner.generation)
            .finish()
    }
}

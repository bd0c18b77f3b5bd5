// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Resource state tracking across command lists.
//!
//! A recording thread only knows the state a resource is in if it transitioned that resource
//! earlier in the same command list.  The first transition of a resource in a list therefore
//! records what state the list *requires* the resource to be in on entry, and the submission thread
//! later reconciles that against the global ([MasterStateCache]) state, emitting the missing barriers
//! in front of the list.

use crate::handles::ResourceHandle;
use std::collections::HashMap;
use wasm_safe_mutex::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Undefined,
    VertexBuffer,
    IndexBuffer,
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthRead,
    DepthWrite,
    IndirectArgument,
    CopySrc,
    CopyDest,
    ResolveSrc,
    ResolveDest,
    Present,
}

/// A state transition of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Barrier {
    pub resource: ResourceHandle,
    pub before: ResourceState,
    pub after: ResourceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCacheEntry {
    pub resource: ResourceHandle,
    /// State the resource must be in when the list starts executing.
    pub required_initial: ResourceState,
    /// State the resource is left in when the list finishes.
    pub current: ResourceState,
}

/// Per-command-list record of the transitions issued while recording.
///
/// Owned by whichever thread records the list; not synchronized.
#[derive(Debug, Clone, Default)]
pub struct IncompleteStateCache {
    entries: Vec<StateCacheEntry>,
}

impl IncompleteStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /**
    Notes a transition of `resource` to `after`.

    Returns the state before the transition if this list already knows it; the caller records a
    barrier from it.  Returns `None` on the first local reference, in which case the before state is
    resolved at submission.
    */
    pub fn transition_resource(
        &mut self,
        resource: ResourceHandle,
        after: ResourceState,
    ) -> Option<ResourceState> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.resource == resource) {
            let before = entry.current;
            entry.current = after;
            return Some(before);
        }
        self.entries.push(StateCacheEntry {
            resource,
            required_initial: after,
            current: after,
        });
        None
    }

    pub fn entries(&self) -> &[StateCacheEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

/// Authoritative state of every resource as of the last submission.
#[derive(Debug)]
pub struct MasterStateCache {
    states: Mutex<HashMap<ResourceHandle, ResourceState>>,
}

impl Default for MasterStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MasterStateCache {
    pub fn new() -> Self {
        MasterStateCache {
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, resource: ResourceHandle, state: ResourceState) {
        self.states.lock_sync().insert(resource, state);
    }

    pub fn forget(&self, resource: ResourceHandle) {
        self.states.lock_sync().remove(&resource);
    }

    pub fn state_of(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.states.lock_sync().get(&resource).copied()
    }

    /**
    Produces the barriers that must run before a list recorded with `cache`, and advances the
    master state to what the list leaves behind.

    Lists must be passed in submission order.  Resources the master cache has never seen are
    assumed to be [ResourceState::Undefined].
    */
    pub fn synthesize_barriers(&self, cache: &IncompleteStateCache) -> Vec<Barrier> {
        let mut states = self.states.lock_sync();
        let mut barriers = Vec::new();
        for entry in cache.entries() {
            let master = states
                .entry(entry.resource)
                .or_insert(ResourceState::Undefined);
            if *master != entry.required_initial {
                barriers.push(Barrier {
                    resource: entry.resource,
                    before: *master,
                    after: entry.required_initial,
                });
            }
            *master = entry.current;
        }
        barriers
    }
}

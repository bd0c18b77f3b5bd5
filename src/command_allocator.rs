// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Command allocator rings.
//!
//! A native command allocator owns the memory every command list recorded from it writes into.
//! It can only be reset once the GPU has finished executing *all* of those lists, so we keep
//! several allocators per queue and cycle through them: new lists draw from a fresh allocator while
//! the GPU is still chewing on lists from the older ones.
//!
//! # Node lifecycle
//!
//! ```text
//! Fresh -> Acquiring (0..N lists in flight) -> Full & waiting -> Resettable -> Fresh
//! ```
//!
//! A node tracks how many lists were drawn from it (`in_flight`), how many of those were dropped
//! without submission (`discarded`) and a monotonic `submit_counter` which is also the value its fence
//! is signalled to on every submission.  It is resettable once it is full, every list it handed out
//! has been either submitted or discarded, and the fence has caught up with the submit counter.

use crate::backend::{Backend, Fence, WaitResult};
use crate::handles::QueueType;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// One native command allocator plus the bookkeeping needed to know when it can be reset.
pub struct AllocatorNode<B: Backend> {
    backend: Arc<B>,
    queue: QueueType,
    allocator: B::CommandAllocator,
    fence: B::Fence,
    submit_counter: AtomicU64,
    submit_counter_at_last_reset: AtomicU64,
    num_in_flight: AtomicU32,
    num_discarded: AtomicU32,
    max_in_flight: u32,
}

impl<B: Backend> AllocatorNode<B> {
    pub fn new(backend: Arc<B>, queue: QueueType, max_in_flight: u32) -> Self {
        assert!(max_in_flight > 0, "allocator node must allow at least one list");
        let allocator = backend.create_command_allocator(queue);
        let fence = backend.create_fence();
        AllocatorNode {
            backend,
            queue,
            allocator,
            fence,
            submit_counter: AtomicU64::new(0),
            submit_counter_at_last_reset: AtomicU64::new(0),
            num_in_flight: AtomicU32::new(0),
            num_discarded: AtomicU32::new(0),
            max_in_flight,
        }
    }

    /**
    Puts `list` into the recording state against this node's allocator.

    If the node is already full, a blocking reset is attempted first.

    # Panics
    If the node is full and cannot be reset within `timeout`.  That means too few allocators for
    the sustained submission rate, or lists that are never submitted nor discarded.
    */
    pub fn acquire(&self, list: &mut B::CommandList, timeout: Duration) {
        if self.is_full() {
            let reset = self.try_reset_blocking(timeout);
            assert!(
                reset,
                "command allocator node overcommitted and unable to recover ({in_flight} in flight, {discarded} discarded, {submits} submitted since reset)",
                in_flight = self.num_in_flight(),
                discarded = self.num_discarded(),
                submits = self.submits_since_reset()
            );
        }
        self.backend.reset_command_list(list, &self.allocator);
        self.num_in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Records that a list drawn from this node was submitted on `queue`, and signals the fence
    /// to the new submit counter once the GPU gets there.
    ///
    /// Call after the list itself was handed to the queue.
    pub fn on_submit(&self, queue: QueueType) {
        let value = self.submit_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.fence.signal_gpu(value, queue);
    }

    /// Records that a list drawn from this node was dropped without submission.
    pub fn on_discard(&self) {
        self.num_discarded.fetch_add(1, Ordering::AcqRel);
    }

    pub fn is_full(&self) -> bool {
        self.num_in_flight() == self.max_in_flight
    }

    /// Every list acquired since the last reset has been submitted or discarded.
    pub fn is_submit_counter_up_to_date(&self) -> bool {
        let submits = self.submits_since_reset();
        let expected = self.num_in_flight() as u64 - self.num_discarded() as u64;
        assert!(
            submits <= expected,
            "allocator node saw {submits} submits for {expected} live lists; a list was submitted twice"
        );
        submits == expected
    }

    pub fn can_reset(&self) -> bool {
        self.is_full() && self.is_submit_counter_up_to_date()
    }

    /// Resets the node if it is resettable and the GPU already reached its last submission.
    pub fn try_reset(&self) -> bool {
        if self.can_reset() && self.fence.current_value() >= self.submit_counter() {
            self.do_reset();
            true
        } else {
            false
        }
    }

    /// Resets the node if it is resettable, waiting up to `timeout` for the GPU to catch up.
    ///
    /// Returns false if the node is not resettable or the wait timed out.
    pub fn try_reset_blocking(&self, timeout: Duration) -> bool {
        if !self.can_reset() {
            return false;
        }
        let target = self.submit_counter();
        let wait = logwise::perfwarn_begin!("AllocatorNode::try_reset_blocking");
        let result = self.fence.wait_cpu(target, timeout);
        drop(wait);
        match result {
            WaitResult::Ready => {
                self.do_reset();
                true
            }
            WaitResult::TimedOut => {
                logwise::warn_sync!(
                    "Timed out waiting for command allocator fence to reach {target}",
                    target = target
                );
                false
            }
        }
    }

    fn do_reset(&self) {
        self.backend.reset_command_allocator(&self.allocator);
        self.submit_counter_at_last_reset
            .store(self.submit_counter(), Ordering::Release);
        self.num_in_flight.store(0, Ordering::Release);
        self.num_discarded.store(0, Ordering::Release);
        logwise::trace_sync!("Reset command allocator node");
    }

    pub fn queue(&self) -> QueueType {
        self.queue
    }

    pub fn num_in_flight(&self) -> u32 {
        self.num_in_flight.load(Ordering::Acquire)
    }

    pub fn num_discarded(&self) -> u32 {
        self.num_discarded.load(Ordering::Acquire)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }

    pub fn submit_counter(&self) -> u64 {
        self.submit_counter.load(Ordering::Acquire)
    }

    pub fn submits_since_reset(&self) -> u64 {
        self.submit_counter() - self.submit_counter_at_last_reset.load(Ordering::Acquire)
    }
}

impl<B: Backend> Debug for AllocatorNode<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorNode")
            .field("queue", &self.queue)
            .field("in_flight", &self.num_in_flight())
            .field("discarded", &self.num_discarded())
            .field("max_in_flight", &self.max_in_flight)
            .field("submit_counter", &self.submit_counter())
            .finish()
    }
}

/**
A fixed ring of [AllocatorNode]s for one queue.

Lists are drawn from the active node until it fills up; then the bundle moves round-robin to the
next node that is either not full or can be reset without waiting.  When every node is full, it
blocks on the active one.
*/
pub struct AllocatorBundle<B: Backend> {
    nodes: Vec<Arc<AllocatorNode<B>>>,
    active: usize,
    timeout: Duration,
}

impl<B: Backend> AllocatorBundle<B> {
    pub fn new(
        backend: &Arc<B>,
        queue: QueueType,
        num_allocators: usize,
        max_lists_per_allocator: u32,
        timeout: Duration,
    ) -> Self {
        assert!(num_allocators > 0, "allocator bundle needs at least one node");
        AllocatorBundle {
            nodes: (0..num_allocators)
                .map(|_| {
                    Arc::new(AllocatorNode::new(
                        backend.clone(),
                        queue,
                        max_lists_per_allocator,
                    ))
                })
                .collect(),
            active: 0,
            timeout,
        }
    }

    /// Resets `list` against a node with room and returns that node.  The caller reports the
    /// list's fate through [AllocatorNode::on_submit] or [AllocatorNode::on_discard].
    pub fn acquire(&mut self, list: &mut B::CommandList) -> Arc<AllocatorNode<B>> {
        self.update_active_index();
        let node = self.nodes[self.active].clone();
        node.acquire(list, self.timeout);
        node
    }

    /**
    Moves the active index to a node that can accept another list.

    When every node is full, blocks on the oldest node whose lists were all submitted or
    discarded, starting after the active one.

    # Panics
    If every node is full and none of them can be reset within the timeout.
    */
    pub fn update_active_index(&mut self) {
        let count = self.nodes.len();
        for _ in 0..count {
            let node = &self.nodes[self.active];
            if !node.is_full() || node.try_reset() {
                return;
            }
            self.active = (self.active + 1) % count;
        }
        logwise::warn_sync!(
            "All {count} command allocators are full, blocking",
            count = count
        );
        let candidate = (1..=count)
            .map(|offset| (self.active + offset) % count)
            .find(|&index| self.nodes[index].can_reset());
        let reset = match candidate {
            Some(index) => {
                self.active = index;
                self.nodes[index].try_reset_blocking(self.timeout)
            }
            None => false,
        };
        assert!(
            reset,
            "command allocator bundle overcommitted and unable to recover"
        );
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn nodes(&self) -> &[Arc<AllocatorNode<B>>] {
        &self.nodes
    }
}

impl<B: Backend> Debug for AllocatorBundle<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorBundle")
            .field("active", &self.active)
            .field("nodes", &self.nodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imp::headless::HeadlessBackend;

    const TIMEOUT: Duration = Duration::from_millis(200);

    fn backend() -> Arc<HeadlessBackend> {
        Arc::new(HeadlessBackend::new())
    }

    #[test]
    fn fresh_node_is_not_resettable() {
        let b = backend();
        let node = AllocatorNode::new(b, QueueType::Direct, 2);
        assert!(!node.is_full());
        assert!(node.is_submit_counter_up_to_date());
        assert!(!node.can_reset());
        assert!(!node.try_reset());
    }

    #[test]
    fn can_reset_needs_every_list_accounted_for() {
        let b = backend();
        let node = AllocatorNode::new(b.clone(), QueueType::Direct, 3);
        let mut lists: Vec<_> = (0..3).map(|_| b.create_command_list(QueueType::Direct)).collect();
        for list in &mut lists {
            node.acquire(list, TIMEOUT);
        }
        assert!(node.is_full());
        assert!(!node.can_reset());
        node.on_submit(QueueType::Direct);
        node.on_discard();
        assert!(!node.can_reset());
        node.on_submit(QueueType::Direct);
        assert!(node.can_reset());
        // GPU has not reached counter 2 yet
        assert!(!node.try_reset());
        b.retire_all();
        assert!(node.try_reset());
        assert_eq!(node.num_in_flight(), 0);
        assert_eq!(node.num_discarded(), 0);
        assert_eq!(node.submits_since_reset(), 0);
        assert_eq!(node.submit_counter(), 2);
        assert_eq!(b.allocator_resets(), 1);
    }

    #[test]
    fn blocking_reset_waits_for_fence() {
        let b = backend();
        let node = AllocatorNode::new(b.clone(), QueueType::Compute, 1);
        let mut list = b.create_command_list(QueueType::Compute);
        node.acquire(&mut list, TIMEOUT);
        node.on_submit(QueueType::Compute);
        // headless fence waits drain the GPU timeline
        assert!(node.try_reset_blocking(TIMEOUT));
        assert!(!node.is_full());
    }

    #[test]
    fn full_node_acquire_resets_in_place() {
        let b = backend();
        let node = AllocatorNode::new(b.clone(), QueueType::Direct, 1);
        let mut list = b.create_command_list(QueueType::Direct);
        node.acquire(&mut list, TIMEOUT);
        node.on_discard();
        node.acquire(&mut list, TIMEOUT);
        assert_eq!(node.num_in_flight(), 1);
        assert_eq!(b.allocator_resets(), 1);
    }

    #[test]
    #[should_panic(expected = "overcommitted")]
    fn full_node_with_pending_list_is_fatal() {
        let b = backend();
        let node = AllocatorNode::new(b.clone(), QueueType::Direct, 1);
        let mut list = b.create_command_list(QueueType::Direct);
        node.acquire(&mut list, TIMEOUT);
        // never submitted nor discarded
        node.acquire(&mut list, Duration::from_millis(1));
    }

    #[test]
    fn bundle_rotates_past_busy_nodes() {
        let b = backend();
        let mut bundle = AllocatorBundle::new(&b, QueueType::Direct, 3, 2, TIMEOUT);
        let mut list = b.create_command_list(QueueType::Direct);
        let mut nodes = Vec::new();
        for _ in 0..6 {
            let node = bundle.acquire(&mut list);
            node.on_submit(QueueType::Direct);
            nodes.push(node);
        }
        assert!(Arc::ptr_eq(&nodes[0], &bundle.nodes()[0]));
        assert!(Arc::ptr_eq(&nodes[2], &bundle.nodes()[1]));
        assert!(Arc::ptr_eq(&nodes[5], &bundle.nodes()[2]));
        assert_eq!(bundle.active_index(), 2);
        // GPU finished everything: the next acquire resets node 2 without moving
        b.retire_all();
        let node = bundle.acquire(&mut list);
        assert!(Arc::ptr_eq(&node, &bundle.nodes()[2]));
        assert_eq!(node.num_in_flight(), 1);
    }

    #[test]
    fn bundle_blocks_when_every_node_is_full() {
        let b = backend();
        let mut bundle = AllocatorBundle::new(&b, QueueType::Copy, 2, 1, TIMEOUT);
        let mut list = b.create_command_list(QueueType::Copy);
        for _ in 0..2 {
            bundle.acquire(&mut list).on_submit(QueueType::Copy);
        }
        // nothing retired yet; the oldest node waits for its own submission only
        let node = bundle.acquire(&mut list);
        assert!(Arc::ptr_eq(&node, &bundle.nodes()[0]));
        assert_eq!(bundle.active_index(), 0);
        assert_eq!(node.num_in_flight(), 1);
        assert_eq!(b.pending_gpu_ops(), 1);
    }

    #[test]
    fn bundle_waits_on_an_older_node_while_the_newest_still_records() {
        let b = backend();
        let mut bundle = AllocatorBundle::new(&b, QueueType::Direct, 2, 1, TIMEOUT);
        let mut submitted = b.create_command_list(QueueType::Direct);
        bundle.acquire(&mut submitted).on_submit(QueueType::Direct);
        let mut recording = b.create_command_list(QueueType::Direct);
        let busy = bundle.acquire(&mut recording);
        assert!(Arc::ptr_eq(&busy, &bundle.nodes()[1]));

        let mut third = b.create_command_list(QueueType::Direct);
        let node = bundle.acquire(&mut third);
        assert!(Arc::ptr_eq(&node, &bundle.nodes()[0]));
        assert_eq!(bundle.active_index(), 0);
        assert_eq!(b.allocator_resets(), 1);
        assert_eq!(busy.num_in_flight(), 1);
    }

    #[test]
    #[should_panic(expected = "overcommitted")]
    fn bundle_with_every_node_recording_is_fatal() {
        let b = backend();
        let mut bundle = AllocatorBundle::new(&b, QueueType::Direct, 2, 1, Duration::from_millis(1));
        let mut lists: Vec<_> = (0..3).map(|_| b.create_command_list(QueueType::Direct)).collect();
        for list in &mut lists {
            bundle.acquire(list);
        }
    }
}

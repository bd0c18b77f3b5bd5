// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A CPU-only [Backend] with a deterministic GPU.

Every object lives in a [SyncLinkedPool] table; handles are the table indices.  The "GPU" is a
single queue of pending operations (fence signals and event sets) that only advances when someone
retires it: explicitly via [HeadlessBackend::retire_next]/[HeadlessBackend::retire_all], through
[Backend::flush_gpu], or from a fence wait that needs progress.  All queue types share that one
timeline, so work retires in submission order.

The counters and recordings exposed here exist so tests can check what the core did to the
backend: which objects are alive, how many were ever created, which barriers were submitted.
*/

use crate::backend::{Backend, Fence, Submission, WaitResult};
use crate::handles::{EventHandle, PipelineHandle, QueueType, ResourceHandle, ShaderViewHandle};
use crate::keys::{
    BufferDescription, ComputePipelineDescription, GraphicsPipelineDescription, PipelineKey,
    RenderTargetDescription, ResourceKey, ShaderViewDescription, TextureDescription,
};
use crate::linked_pool::{PoolHandle, SyncLinkedPool};
use crate::page_allocator::DescriptorRange;
use crate::state_cache::Barrier;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
use wasm_safe_mutex::Mutex;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
enum ResourceRecord {
    Described(ResourceKey),
    Mapped(Vec<u8>),
    Backbuffer,
}

#[derive(Debug)]
enum GpuOp {
    SignalFence { value: Arc<AtomicU64>, target: u64 },
    SetEvent(EventHandle),
}

/// The simulated device timeline, shared with every [HeadlessFence].
struct Gpu {
    ops: Mutex<VecDeque<GpuOp>>,
    events: SyncLinkedPool<bool>,
}

impl Gpu {
    fn retire_next(&self) -> bool {
        let op = self.ops.lock_sync().pop_front();
        match op {
            None => false,
            Some(GpuOp::SignalFence { value, target }) => {
                value.fetch_max(target, Ordering::AcqRel);
                true
            }
            Some(GpuOp::SetEvent(event)) => {
                let handle = PoolHandle::from_raw(event.index());
                //the event may have been freed while the op was pending
                if self.events.contains(handle) {
                    self.events.with_mut(handle, |set| *set = true);
                }
                true
            }
        }
    }
}

/// A fence on the headless timeline.
///
/// [Fence::wait_cpu] retires pending GPU work while it waits, so a wait only times out when the
/// target value was never signalled.
pub struct HeadlessFence {
    value: Arc<AtomicU64>,
    gpu: Arc<Gpu>,
}

impl Fence for HeadlessFence {
    fn signal_gpu(&self, value: u64, _queue: QueueType) {
        self.gpu.ops.lock_sync().push_back(GpuOp::SignalFence {
            value: self.value.clone(),
            target: value,
        });
    }

    fn current_value(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn wait_cpu(&self, value: u64, timeout: Duration) -> WaitResult {
        let start = Instant::now();
        loop {
            if self.current_value() >= value {
                return WaitResult::Ready;
            }
            if self.gpu.retire_next() {
                continue;
            }
            if start.elapsed() >= timeout {
                return WaitResult::TimedOut;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
}

impl Debug for HeadlessFence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessFence")
            .field("value", &self.current_value())
            .finish()
    }
}

#[derive(Debug)]
pub struct HeadlessCommandAllocator {
    queue: QueueType,
}

/// A command list that records only barriers.
#[derive(Debug)]
pub struct HeadlessCommandList {
    queue: QueueType,
    recording: bool,
    barriers: Vec<Barrier>,
}

impl HeadlessCommandList {
    pub fn queue(&self) -> QueueType {
        self.queue
    }
    pub fn barriers(&self) -> &[Barrier] {
        &self.barriers
    }
}

/// What one command list looked like when it reached the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedList {
    pub queue: QueueType,
    /// Barriers synthesized in front of the list at submission.
    pub pre_barriers: Vec<Barrier>,
    /// Barriers the list recorded itself.
    pub recorded: Vec<Barrier>,
}

#[derive(Default)]
struct Counters {
    resources_created: AtomicUsize,
    shader_views_created: AtomicUsize,
    pipelines_created: AtomicUsize,
    allocator_resets: AtomicUsize,
    lists_discarded: AtomicUsize,
    presents: AtomicUsize,
}

pub struct HeadlessBackend {
    gpu: Arc<Gpu>,
    resources: SyncLinkedPool<ResourceRecord>,
    shader_views: SyncLinkedPool<(ShaderViewDescription, DescriptorRange)>,
    pipelines: SyncLinkedPool<PipelineKey>,
    backbuffer: ResourceHandle,
    swapchain_lost: AtomicBool,
    size: Mutex<(u32, u32)>,
    submitted: Mutex<Vec<SubmittedList>>,
    counters: Counters,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// A backend whose object tables hold `capacity` live objects of each kind.
    pub fn with_capacity(capacity: usize) -> Self {
        let resources = SyncLinkedPool::with_capacity(capacity + 1);
        let backbuffer = ResourceHandle::from_index(resources.acquire(ResourceRecord::Backbuffer).index());
        HeadlessBackend {
            gpu: Arc::new(Gpu {
                ops: Mutex::new(VecDeque::new()),
                events: SyncLinkedPool::with_capacity(capacity),
            }),
            resources,
            shader_views: SyncLinkedPool::with_capacity(capacity),
            pipelines: SyncLinkedPool::with_capacity(capacity),
            backbuffer,
            swapchain_lost: AtomicBool::new(false),
            size: Mutex::new((0, 0)),
            submitted: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    /// Completes the oldest pending GPU operation.  Returns false if the GPU is idle.
    pub fn retire_next(&self) -> bool {
        self.gpu.retire_next()
    }

    pub fn retire_all(&self) {
        while self.gpu.retire_next() {}
    }

    pub fn pending_gpu_ops(&self) -> usize {
        self.gpu.ops.lock_sync().len()
    }

    /// Live textures, buffers and render targets, not counting the backbuffer.
    pub fn live_resources(&self) -> usize {
        self.resources.len() - 1
    }
    pub fn live_shader_views(&self) -> usize {
        self.shader_views.len()
    }
    pub fn live_pipelines(&self) -> usize {
        self.pipelines.len()
    }
    pub fn live_events(&self) -> usize {
        self.gpu.events.len()
    }

    pub fn resources_created(&self) -> usize {
        self.counters.resources_created.load(Ordering::Acquire)
    }
    pub fn shader_views_created(&self) -> usize {
        self.counters.shader_views_created.load(Ordering::Acquire)
    }
    pub fn pipelines_created(&self) -> usize {
        self.counters.pipelines_created.load(Ordering::Acquire)
    }
    pub fn allocator_resets(&self) -> usize {
        self.counters.allocator_resets.load(Ordering::Acquire)
    }
    pub fn lists_discarded(&self) -> usize {
        self.counters.lists_discarded.load(Ordering::Acquire)
    }
    pub fn presents(&self) -> usize {
        self.counters.presents.load(Ordering::Acquire)
    }

    /// Every list submitted so far, in submission order.
    pub fn submitted(&self) -> Vec<SubmittedList> {
        self.submitted.lock_sync().clone()
    }

    pub fn is_live(&self, resource: ResourceHandle) -> bool {
        self.resources.contains(PoolHandle::from_raw(resource.index()))
    }

    /// Description a live resource was created from, `None` for mapped buffers and the backbuffer.
    pub fn resource_key(&self, resource: ResourceHandle) -> Option<ResourceKey> {
        self.resources
            .with(PoolHandle::from_raw(resource.index()), |r| match r {
                ResourceRecord::Described(key) => Some(*key),
                _ => None,
            })
    }

    pub fn shader_view_range(&self, view: ShaderViewHandle) -> DescriptorRange {
        self.shader_views
            .with(PoolHandle::from_raw(view.index()), |(_, range)| *range)
    }

    /// Copies `len` bytes out of a mapped buffer.
    pub fn read_mapped(&self, buffer: ResourceHandle, offset: u64, len: usize) -> Vec<u8> {
        self.resources
            .with(PoolHandle::from_raw(buffer.index()), |r| match r {
                ResourceRecord::Mapped(bytes) => {
                    bytes[offset as usize..offset as usize + len].to_vec()
                }
                other => panic!("{other:?} is not a mapped buffer"),
            })
    }

    /// Makes the next [Backend::acquire_backbuffer] fail until [Backend::on_resize].
    pub fn lose_swapchain(&self) {
        logwise::info_sync!("Headless swapchain lost");
        self.swapchain_lost.store(true, Ordering::Release);
    }

    pub fn size(&self) -> (u32, u32) {
        *self.size.lock_sync()
    }

    fn create_described(&self, key: ResourceKey) -> ResourceHandle {
        self.counters
            .resources_created
            .fetch_add(1, Ordering::AcqRel);
        let handle = self.resources.acquire(ResourceRecord::Described(key));
        ResourceHandle::from_index(handle.index())
    }

    fn create_pipeline(&self, key: PipelineKey) -> PipelineHandle {
        self.counters
            .pipelines_created
            .fetch_add(1, Ordering::AcqRel);
        PipelineHandle::from_index(self.pipelines.acquire(key).index())
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for HeadlessBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadlessBackend")
            .field("live_resources", &self.live_resources())
            .field("live_shader_views", &self.live_shader_views())
            .field("live_pipelines", &self.live_pipelines())
            .field("live_events", &self.live_events())
            .field("pending_gpu_ops", &self.pending_gpu_ops())
            .finish()
    }
}

impl Backend for HeadlessBackend {
    type Fence = HeadlessFence;
    type CommandAllocator = HeadlessCommandAllocator;
    type CommandList = HeadlessCommandList;

    fn create_texture(&self, description: &TextureDescription) -> ResourceHandle {
        self.create_described(ResourceKey::Texture(*description))
    }

    fn create_buffer(&self, description: &BufferDescription) -> ResourceHandle {
        self.create_described(ResourceKey::Buffer(*description))
    }

    fn create_render_target(&self, description: &RenderTargetDescription) -> ResourceHandle {
        self.create_described(ResourceKey::RenderTarget(*description))
    }

    fn create_mapped_buffer(&self, size: u64) -> ResourceHandle {
        let handle = self
            .resources
            .acquire(ResourceRecord::Mapped(vec![0; size as usize]));
        ResourceHandle::from_index(handle.index())
    }

    fn write_mapped(&self, buffer: ResourceHandle, offset: u64, data: &[u8]) {
        self.resources
            .with_mut(PoolHandle::from_raw(buffer.index()), |r| match r {
                ResourceRecord::Mapped(bytes) => {
                    let start = offset as usize;
                    assert!(
                        start + data.len() <= bytes.len(),
                        "write of {len} bytes at {start} overruns mapped buffer of {total}",
                        len = data.len(),
                        total = bytes.len()
                    );
                    bytes[start..start + data.len()].copy_from_slice(data);
                }
                other => panic!("{other:?} is not a mapped buffer"),
            });
    }

    fn free(&self, resource: ResourceHandle) {
        assert_ne!(resource, self.backbuffer, "the backbuffer is owned by the swapchain");
        self.resources
            .release(PoolHandle::from_raw(resource.index()));
    }

    fn create_shader_view(
        &self,
        description: &ShaderViewDescription,
        descriptors: DescriptorRange,
    ) -> ShaderViewHandle {
        assert!(
            descriptors.num_elements >= description.num_descriptors(),
            "shader view needs {needed} descriptors, got {got}",
            needed = description.num_descriptors(),
            got = descriptors.num_elements
        );
        self.counters
            .shader_views_created
            .fetch_add(1, Ordering::AcqRel);
        let handle = self
            .shader_views
            .acquire((description.clone(), descriptors));
        ShaderViewHandle::from_index(handle.index())
    }

    fn free_shader_view(&self, view: ShaderViewHandle) {
        self.shader_views
            .release(PoolHandle::from_raw(view.index()));
    }

    fn create_pipeline_state(&self, description: &GraphicsPipelineDescription) -> PipelineHandle {
        self.create_pipeline(PipelineKey::Graphics(description.clone()))
    }

    fn create_compute_pipeline_state(
        &self,
        description: &ComputePipelineDescription,
    ) -> PipelineHandle {
        self.create_pipeline(PipelineKey::Compute(description.clone()))
    }

    fn free_pipeline_state(&self, pipeline: PipelineHandle) {
        self.pipelines
            .release(PoolHandle::from_raw(pipeline.index()));
    }

    fn create_fence(&self) -> HeadlessFence {
        HeadlessFence {
            value: Arc::new(AtomicU64::new(0)),
            gpu: self.gpu.clone(),
        }
    }

    fn create_command_allocator(&self, queue: QueueType) -> HeadlessCommandAllocator {
        HeadlessCommandAllocator { queue }
    }

    fn reset_command_allocator(&self, _allocator: &HeadlessCommandAllocator) {
        self.counters
            .allocator_resets
            .fetch_add(1, Ordering::AcqRel);
    }

    fn create_command_list(&self, queue: QueueType) -> HeadlessCommandList {
        HeadlessCommandList {
            queue,
            recording: false,
            barriers: Vec::new(),
        }
    }

    fn reset_command_list(
        &self,
        list: &mut HeadlessCommandList,
        allocator: &HeadlessCommandAllocator,
    ) {
        assert_eq!(
            list.queue, allocator.queue,
            "command list and allocator target different queues"
        );
        list.recording = true;
        list.barriers.clear();
    }

    fn record_barriers(&self, list: &mut HeadlessCommandList, barriers: &[Barrier]) {
        assert!(list.recording, "recording into a list that was never reset");
        list.barriers.extend_from_slice(barriers);
    }

    fn discard(&self, _list: HeadlessCommandList) {
        self.counters
            .lists_discarded
            .fetch_add(1, Ordering::AcqRel);
    }

    fn submit(
        &self,
        queue: QueueType,
        lists: Vec<Submission<HeadlessCommandList>>,
        signal: Option<EventHandle>,
    ) {
        {
            let mut submitted = self.submitted.lock_sync();
            for submission in lists {
                assert!(submission.list.recording, "submitting a list that was never reset");
                submitted.push(SubmittedList {
                    queue,
                    pre_barriers: submission.pre_barriers,
                    recorded: submission.list.barriers,
                });
            }
        }
        if let Some(event) = signal {
            self.gpu.ops.lock_sync().push_back(GpuOp::SetEvent(event));
        }
    }

    fn create_event(&self) -> EventHandle {
        EventHandle::from_index(self.gpu.events.acquire(false).index())
    }

    fn clear_event(&self, event: EventHandle) -> bool {
        self.gpu
            .events
            .with_mut(PoolHandle::from_raw(event.index()), |set| {
                std::mem::replace(set, false)
            })
    }

    fn free_event(&self, event: EventHandle) {
        self.gpu
            .events
            .release(PoolHandle::from_raw(event.index()));
    }

    fn acquire_backbuffer(&self) -> Option<ResourceHandle> {
        if self.swapchain_lost.load(Ordering::Acquire) {
            None
        } else {
            Some(self.backbuffer)
        }
    }

    fn present(&self) {
        self.counters.presents.fetch_add(1, Ordering::AcqRel);
    }

    fn on_resize(&self, width: u32, height: u32) {
        *self.size.lock_sync() = (width, height);
        self.swapchain_lost.store(false, Ordering::Release);
    }

    fn flush_gpu(&self) {
        let pending = self.pending_gpu_ops();
        self.retire_all();
        logwise::trace_sync!("Headless flush retired {pending} GPU ops", pending = pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Format;

    #[test]
    fn object_tables_track_liveness() {
        let b = HeadlessBackend::with_capacity(4);
        let desc = TextureDescription::new_2d(Format::Rgba8Unorm, 8, 8);
        let t = b.create_texture(&desc);
        assert!(b.is_live(t));
        assert_eq!(b.resource_key(t), Some(ResourceKey::Texture(desc)));
        assert_eq!(b.live_resources(), 1);
        b.free(t);
        assert!(!b.is_live(t));
        assert_eq!(b.live_resources(), 0);
        assert_eq!(b.resources_created(), 1);
    }

    #[test]
    #[should_panic(expected = "not acquired")]
    fn double_free_is_caught() {
        let b = HeadlessBackend::new();
        let buf = b.create_buffer(&BufferDescription {
            size: 16,
            stride: 4,
            allow_uav: false,
        });
        b.free(buf);
        b.free(buf);
    }

    #[test]
    fn events_set_in_submission_order() {
        let b = HeadlessBackend::new();
        let e1 = b.create_event();
        let e2 = b.create_event();
        b.submit(QueueType::Direct, Vec::new(), Some(e1));
        b.submit(QueueType::Copy, Vec::new(), Some(e2));
        assert!(!b.clear_event(e1));
        assert!(b.retire_next());
        assert!(b.clear_event(e1));
        assert!(!b.clear_event(e1), "clear resets the event");
        assert!(!b.clear_event(e2));
        b.flush_gpu();
        assert!(b.clear_event(e2));
        assert!(!b.retire_next());
    }

    #[test]
    fn fence_wait_times_out_without_signal() {
        let b = HeadlessBackend::new();
        let fence = b.create_fence();
        assert_eq!(
            fence.wait_cpu(1, Duration::from_millis(2)),
            WaitResult::TimedOut
        );
        fence.signal_gpu(1, QueueType::Direct);
        assert_eq!(fence.current_value(), 0);
        assert!(fence.wait_cpu(1, Duration::from_millis(2)).is_ready());
        assert_eq!(fence.current_value(), 1);
    }

    #[test]
    fn mapped_buffers_round_trip_bytes() {
        let b = HeadlessBackend::new();
        let buf = b.create_mapped_buffer(8);
        b.write_mapped(buf, 2, &[1, 2, 3]);
        assert_eq!(b.read_mapped(buf, 0, 6), vec![0, 0, 1, 2, 3, 0]);
    }

    #[test]
    fn submissions_are_recorded() {
        let b = HeadlessBackend::new();
        let alloc = b.create_command_allocator(QueueType::Direct);
        let mut list = b.create_command_list(QueueType::Direct);
        b.reset_command_list(&mut list, &alloc);
        let barrier = Barrier {
            resource: ResourceHandle::from_index(3),
            before: crate::state_cache::ResourceState::RenderTarget,
            after: crate::state_cache::ResourceState::ShaderResource,
        };
        b.record_barriers(&mut list, &[barrier]);
        b.submit(
            QueueType::Direct,
            vec![Submission {
                pre_barriers: Vec::new(),
                list,
            }],
            None,
        );
        assert_eq!(
            b.submitted(),
            vec![SubmittedList {
                queue: QueueType::Direct,
                pre_barriers: Vec::new(),
                recorded: vec![barrier],
            }]
        );
    }

    #[test]
    fn swapchain_loss_recovers_on_resize() {
        let b = HeadlessBackend::new();
        assert!(b.acquire_backbuffer().is_some());
        b.lose_swapchain();
        assert!(b.acquire_backbuffer().is_none());
        b.on_resize(640, 480);
        assert_eq!(b.size(), (640, 480));
        assert!(b.acquire_backbuffer().is_some());
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The composition root.

A [Context] owns everything that decides *when* a GPU object may be reused: the epoch tracker,
the object caches, the descriptor page allocator, the per-queue command allocator bundles, the
master resource state cache, the per-frame upload ring, and a graveyard for objects that are
waiting on the GPU before they can be destroyed.

# Threads

Any thread may acquire and free objects or record command lists.  Submission is serialized
internally, so the master state cache sees lists in the order they reach the queue.

# Lifetimes

Freed resources, shader views and pipelines go back to their caches tagged with the current CPU
epoch.  Free an object only after the last list that uses it was submitted; it is then handed
out again no earlier than when the GPU finishes that submission.
*/

mod graveyard;

use crate::backend::{Backend, Submission, WaitResult};
use crate::cache::{MultiCache, SingleCache};
use crate::command_allocator::{AllocatorBundle, AllocatorNode};
use crate::config::{ConfigError, ContextConfig};
use crate::epoch::GpuEpochTracker;
use crate::handles::{PipelineHandle, QueueType, ResourceHandle, ShaderViewHandle};
use crate::keys::{
    BufferDescription, ComputePipelineDescription, GraphicsPipelineDescription, PipelineKey,
    RenderTargetDescription, ResourceKey, ShaderViewDescription, TextureDescription,
};
use crate::linked_pool::{PoolHandle, SyncLinkedPool};
use crate::page_allocator::{DescriptorRange, PageAllocator};
use crate::ring::{MAX_TABS, RingWithTabs};
use crate::state_cache::{Barrier, IncompleteStateCache, MasterStateCache, ResourceState};
use graveyard::Graveyard;
use logwise::privacy::LogIt;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use wasm_safe_mutex::Mutex;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CreateError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A shader view together with the descriptors it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderView {
    pub handle: ShaderViewHandle,
    pub descriptors: DescriptorRange,
}

/// A command list being recorded through a [Context].
///
/// Valid from [Context::begin_commands] until it is passed to [Context::submit] or
/// [Context::discard].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandListHandle(u32);

/// Bytes written into the upload ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocation {
    pub buffer: ResourceHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug)]
enum Garbage {
    Resource(ResourceHandle),
    ShaderView(ShaderView),
    Pipeline(PipelineHandle),
}

struct CommandRecord<B: Backend> {
    queue: QueueType,
    list: B::CommandList,
    node: Arc<AllocatorNode<B>>,
    states: IncompleteStateCache,
}

struct UploadRing {
    ring: RingWithTabs,
    buffer: ResourceHandle,
    /// CPU epoch of the last submission of the frame each tab belongs to.
    tab_epochs: [u64; MAX_TABS],
}

pub struct Context<B: Backend> {
    backend: Arc<B>,
    config: ContextConfig,
    tracker: GpuEpochTracker<B>,
    resources: MultiCache<ResourceKey, ResourceHandle>,
    shader_views: MultiCache<ShaderViewDescription, ShaderView>,
    pipelines: SingleCache<PipelineKey, PipelineHandle>,
    descriptors: PageAllocator,
    states: MasterStateCache,
    command_lists: SyncLinkedPool<CommandRecord<B>>,
    bundles: Vec<Mutex<AllocatorBundle<B>>>,
    submission: Mutex<()>,
    upload: Mutex<UploadRing>,
    graveyard: Mutex<Graveyard<Garbage>>,
    frame: AtomicU64,
}

impl<B: Backend> Context<B> {
    pub fn new(backend: Arc<B>, config: ContextConfig) -> Result<Self, CreateError> {
        config.validate()?;
        logwise::info_sync!(
            "Creating context: {backbuffers} backbuffers, {lists} command lists, {descriptors} descriptors",
            backbuffers = config.num_backbuffers,
            lists = config.max_command_lists,
            descriptors = config.descriptor_count
        );
        let bundles = QueueType::ALL
            .iter()
            .map(|queue| {
                Mutex::new(AllocatorBundle::new(
                    &backend,
                    *queue,
                    config.num_allocators_per_queue,
                    config.max_lists_per_allocator,
                    config.fence_wait_timeout,
                ))
            })
            .collect();
        let upload_buffer = backend.create_mapped_buffer(config.upload_ring_size);
        Ok(Context {
            tracker: GpuEpochTracker::new(backend.clone(), config.max_events_in_flight),
            resources: MultiCache::new(config.cache_capacity_per_key),
            shader_views: MultiCache::new(config.cache_capacity_per_key),
            pipelines: SingleCache::new(),
            descriptors: PageAllocator::with_size(
                config.descriptor_count,
                config.descriptor_page_size,
            ),
            states: MasterStateCache::new(),
            command_lists: SyncLinkedPool::with_capacity(config.max_command_lists),
            bundles,
            submission: Mutex::new(()),
            upload: Mutex::new(UploadRing {
                ring: RingWithTabs::new(config.upload_ring_size, config.num_backbuffers),
                buffer: upload_buffer,
                tab_epochs: [0; MAX_TABS],
            }),
            graveyard: Mutex::new(Graveyard::new()),
            frame: AtomicU64::new(0),
            backend,
            config,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn tracker(&self) -> &GpuEpochTracker<B> {
        &self.tracker
    }

    // resources

    fn acquire_resource(
        &self,
        key: ResourceKey,
        create: impl FnOnce(&B) -> ResourceHandle,
    ) -> ResourceHandle {
        let gpu = self.tracker.poll();
        if let Some(resource) = self.resources.acquire(&key, gpu) {
            return resource;
        }
        logwise::trace_sync!("Resource cache miss for {key}", key = LogIt(&key));
        let resource = create(&*self.backend);
        self.states.register(resource, ResourceState::Undefined);
        resource
    }

    pub fn acquire_texture(&self, description: &TextureDescription) -> ResourceHandle {
        self.acquire_resource(ResourceKey::Texture(*description), |b| {
            b.create_texture(description)
        })
    }

    pub fn acquire_buffer(&self, description: &BufferDescription) -> ResourceHandle {
        self.acquire_resource(ResourceKey::Buffer(*description), |b| {
            b.create_buffer(description)
        })
    }

    pub fn acquire_render_target(&self, description: &RenderTargetDescription) -> ResourceHandle {
        self.acquire_resource(ResourceKey::RenderTarget(*description), |b| {
            b.create_render_target(description)
        })
    }

    /**
    Returns `resource` to the cache under `key`.

    It becomes acquirable again once the GPU finishes the latest submission, so free only after
    every list using it was submitted (or discarded).

    # Panics
    If `key` already has `cache_capacity_per_key` values waiting on the GPU.
    */
    pub fn free_resource(&self, key: impl Into<ResourceKey>, resource: ResourceHandle) {
        self.resources
            .free(resource, key.into(), self.tracker.current_cpu_epoch());
    }

    /// State `resource` is left in by the last submitted list, if it was ever tracked.
    pub fn resource_state(&self, resource: ResourceHandle) -> Option<ResourceState> {
        self.states.state_of(resource)
    }

    // shader views

    /// # Panics
    /// If the descriptor heap has no contiguous run for the view.
    pub fn acquire_shader_view(&self, description: &ShaderViewDescription) -> ShaderView {
        let gpu = self.tracker.poll();
        if let Some(view) = self.shader_views.acquire(description, gpu) {
            return view;
        }
        logwise::trace_sync!(
            "Shader view cache miss for {description}",
            description = LogIt(description)
        );
        let size = description.num_descriptors().max(1);
        let descriptors = match self.descriptors.allocate_range(size) {
            Some(range) => range,
            None => panic!(
                "descriptor heap exhausted: no contiguous run for {size} descriptors ({free} pages free)",
                free = self.descriptors.num_free_pages()
            ),
        };
        let handle = self.backend.create_shader_view(description, descriptors);
        ShaderView {
            handle,
            descriptors,
        }
    }

    pub fn free_shader_view(&self, description: ShaderViewDescription, view: ShaderView) {
        self.shader_views
            .free(view, description, self.tracker.current_cpu_epoch());
    }

    // pipelines

    pub fn acquire_graphics_pipeline(
        &self,
        description: &GraphicsPipelineDescription,
    ) -> PipelineHandle {
        self.acquire_pipeline(PipelineKey::Graphics(description.clone()), |b| {
            b.create_pipeline_state(description)
        })
    }

    pub fn acquire_compute_pipeline(
        &self,
        description: &ComputePipelineDescription,
    ) -> PipelineHandle {
        self.acquire_pipeline(PipelineKey::Compute(description.clone()), |b| {
            b.create_compute_pipeline_state(description)
        })
    }

    fn acquire_pipeline(
        &self,
        key: PipelineKey,
        create: impl FnOnce(&B) -> PipelineHandle,
    ) -> PipelineHandle {
        let gpu = self.tracker.poll();
        if let Some(pipeline) = self.pipelines.acquire(&key, gpu) {
            return pipeline;
        }
        logwise::trace_sync!("Pipeline cache miss");
        let _compile = logwise::perfwarn_begin!("Context::acquire_pipeline create");
        create(&*self.backend)
    }

    /// Returns `pipeline` to the cache.  A second pipeline freed under an occupied key is
    /// destroyed once the GPU is done with it.
    pub fn free_pipeline(&self, key: impl Into<PipelineKey>, pipeline: PipelineHandle) {
        let epoch = self.tracker.current_cpu_epoch();
        if let Some(surplus) = self.pipelines.free(pipeline, key.into(), epoch) {
            self.graveyard
                .lock_sync()
                .bury(epoch, Garbage::Pipeline(surplus));
        }
    }

    // command lists

    /**
    Starts recording a command list for `queue`.

    # Panics
    If `max_command_lists` lists are already recording, or the queue's command allocators are
    overcommitted and cannot be reset within `fence_wait_timeout`.
    */
    pub fn begin_commands(&self, queue: QueueType) -> CommandListHandle {
        assert!(
            !self.command_lists.is_full(),
            "all {capacity} command list records are in use",
            capacity = self.command_lists.capacity()
        );
        let mut list = self.backend.create_command_list(queue);
        let node = self.bundles[queue.index()].lock_sync().acquire(&mut list);
        let record = self.command_lists.acquire(CommandRecord {
            queue,
            list,
            node,
            states: IncompleteStateCache::new(),
        });
        CommandListHandle(record.index())
    }

    fn record(list: CommandListHandle) -> PoolHandle<CommandRecord<B>> {
        PoolHandle::from_raw(list.0)
    }

    /// Moves `resource` to `state` within `list`.
    ///
    /// If the list already knows the resource's state, the barrier is recorded right away.
    /// Otherwise it is synthesized in front of the list at submission, from the state the
    /// previously submitted lists left the resource in.
    pub fn transition(&self, list: CommandListHandle, resource: ResourceHandle, state: ResourceState) {
        self.command_lists.with_mut(Self::record(list), |record| {
            if let Some(before) = record.states.transition_resource(resource, state) {
                if before != state {
                    self.backend.record_barriers(
                        &mut record.list,
                        &[Barrier {
                            resource,
                            before,
                            after: state,
                        }],
                    );
                }
            }
        })
    }

    /// Runs `f` on the native list.  Other lists cannot be begun, transitioned or submitted
    /// while `f` runs.
    pub fn with_command_list<R>(
        &self,
        list: CommandListHandle,
        f: impl FnOnce(&mut B::CommandList) -> R,
    ) -> R {
        self.command_lists
            .with_mut(Self::record(list), |record| f(&mut record.list))
    }

    pub fn queue_of(&self, list: CommandListHandle) -> QueueType {
        self.command_lists
            .with(Self::record(list), |record| record.queue)
    }

    /// Drops `list` without executing it.
    pub fn discard(&self, list: CommandListHandle) {
        let record = self.command_lists.release(Self::record(list));
        record.node.on_discard();
        self.backend.discard(record.list);
    }

    /**
    Submits `lists`, in order, to their queue and returns the CPU epoch of the submission.

    Cross-list barriers are synthesized from the master state cache in front of each list.  Once
    the GPU epoch reaches the returned value, the GPU has finished these lists.

    # Panics
    If the lists target different queues, or if the GPU does not retire an older submission
    within `fence_wait_timeout` while `max_events_in_flight` submissions are outstanding.
    */
    pub fn submit(&self, lists: &[CommandListHandle]) -> u64 {
        if lists.is_empty() {
            return self.tracker.current_cpu_epoch();
        }
        let _order = self.submission.lock_sync();
        let records: Vec<_> = lists
            .iter()
            .map(|list| self.command_lists.release(Self::record(*list)))
            .collect();
        let queue = records[0].queue;
        assert!(
            records.iter().all(|r| r.queue == queue),
            "lists submitted together must target one queue"
        );
        let mut nodes = Vec::with_capacity(records.len());
        let submissions = records
            .into_iter()
            .map(|record| {
                nodes.push(record.node);
                Submission {
                    pre_barriers: self.states.synthesize_barriers(&record.states),
                    list: record.list,
                }
            })
            .collect();

        self.wait_for_event_capacity();
        let event = self.tracker.get_event();
        self.backend.submit(queue, submissions, Some(event));
        for node in &nodes {
            node.on_submit(queue);
        }
        let epoch = self.tracker.on_event_submission(event);
        logwise::trace_sync!(
            "Submitted {count} lists at epoch {epoch}",
            count = nodes.len(),
            epoch = epoch
        );
        epoch
    }

    fn wait_for_event_capacity(&self) {
        while self.tracker.num_outstanding() >= self.config.max_events_in_flight {
            let next = self.tracker.current_gpu_epoch() + 1;
            let _wait = logwise::perfwarn_begin!("Context::submit event backpressure");
            let result = self
                .tracker
                .wait_for_gpu_epoch(next, self.config.fence_wait_timeout);
            assert!(
                result.is_ready(),
                "GPU did not reach epoch {next} with {outstanding} submissions outstanding",
                outstanding = self.tracker.num_outstanding()
            );
        }
    }

    // uploads

    /// Copies `data` into the upload ring.  Returns `None` if the ring has no contiguous room.
    pub fn upload(&self, data: &[u8]) -> Option<UploadAllocation> {
        let mut upload = self.upload.lock_sync();
        let allocation = upload.ring.alloc_contiguous(data.len() as u64)?;
        self.backend
            .write_mapped(upload.buffer, allocation.offset, data);
        Some(UploadAllocation {
            buffer: upload.buffer,
            offset: allocation.offset,
            size: allocation.size,
        })
    }

    /**
    Like [Self::upload], but on failure waits for the GPU to finish everything, reclaims the ring
    and tries once more.

    # Panics
    If `data` does not fit even then.
    */
    pub fn upload_allow_retry(&self, data: &[u8]) -> UploadAllocation {
        if let Some(allocation) = self.upload(data) {
            return allocation;
        }
        logwise::warn_sync!(
            "Upload ring full for {size} bytes, flushing the GPU",
            size = data.len()
        );
        self.flush_and_finish();
        match self.upload(data) {
            Some(allocation) => allocation,
            None => panic!(
                "upload of {size} bytes does not fit the {total}-byte upload ring even after a flush",
                size = data.len(),
                total = self.config.upload_ring_size
            ),
        }
    }

    // frames

    /// The backbuffer to render into, or `None` if the swapchain needs [Self::on_resize].
    pub fn acquire_backbuffer(&self) -> Option<ResourceHandle> {
        let backbuffer = self.backend.acquire_backbuffer()?;
        if self.states.state_of(backbuffer).is_none() {
            self.states.register(backbuffer, ResourceState::Present);
        }
        Some(backbuffer)
    }

    /**
    Presents and starts the next frame.

    Recycles the upload ring tab of the frame `num_backbuffers` frames back, waiting for the GPU
    to finish that frame if needed, destroys retired garbage and periodically culls the caches.

    # Panics
    If the GPU does not finish that old frame within `fence_wait_timeout`.
    */
    pub fn present(&self) {
        self.backend.present();
        let frame = self.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let required = {
            let mut upload = self.upload.lock_sync();
            let tab = upload.ring.current_tab();
            upload.tab_epochs[tab] = self.tracker.current_cpu_epoch();
            upload.tab_epochs[(tab + 1) % self.config.num_backbuffers]
        };
        if self.tracker.poll() < required {
            let _wait = logwise::perfwarn_begin!("Context::present frame pacing");
            let result = self
                .tracker
                .wait_for_gpu_epoch(required, self.config.fence_wait_timeout);
            assert!(
                result.is_ready(),
                "GPU did not finish frame {old} (epoch {required}) in time",
                old = frame.saturating_sub(self.config.num_backbuffers as u64)
            );
        }
        self.upload.lock_sync().ring.on_begin_frame();
        let gpu = self.tracker.poll();
        self.drain_graveyard(gpu);
        let interval = self.config.cull_interval_frames;
        if interval > 0 && frame % interval == 0 {
            self.cull(gpu);
        }
    }

    fn cull(&self, gpu: u64) {
        let max_age = self.config.cull_max_age;
        self.resources
            .cull(gpu, max_age, |r| self.destroy(Garbage::Resource(r)));
        self.shader_views
            .cull(gpu, max_age, |v| self.destroy(Garbage::ShaderView(v)));
        self.pipelines
            .cull(gpu, max_age, |p| self.destroy(Garbage::Pipeline(p)));
    }

    /// Waits for the GPU to go idle, then resizes the swapchain.
    pub fn on_resize(&self, width: u32, height: u32) {
        self.flush_and_finish();
        logwise::info_sync!("Resizing to {width}x{height}", width = width, height = height);
        self.backend.on_resize(width, height);
    }

    /// Blocks until the GPU has finished all submitted work, then reclaims everything waiting on it.
    pub fn flush_and_finish(&self) {
        let _flush = logwise::perfwarn_begin!("Context::flush_and_finish");
        self.backend.flush_gpu();
        let gpu = self.tracker.poll();
        self.upload.lock_sync().ring.free_closed_tabs();
        self.drain_graveyard(gpu);
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn current_cpu_epoch(&self) -> u64 {
        self.tracker.current_cpu_epoch()
    }

    /// The last GPU epoch observed, without polling.
    pub fn current_gpu_epoch(&self) -> u64 {
        self.tracker.current_gpu_epoch()
    }

    /// Polls the GPU and returns its epoch.
    pub fn poll_gpu_epoch(&self) -> u64 {
        self.tracker.poll()
    }

    pub fn wait_for_gpu_epoch(&self, epoch: u64, timeout: std::time::Duration) -> WaitResult {
        self.tracker.wait_for_gpu_epoch(epoch, timeout)
    }

    /// Resources, shader views and pipelines parked in caches.
    pub fn num_cached(&self) -> usize {
        self.resources.len() + self.shader_views.len() + self.pipelines.len()
    }

    /// Objects waiting on the GPU before destruction.
    pub fn num_buried(&self) -> usize {
        self.graveyard.lock_sync().len()
    }

    pub fn num_recording(&self) -> usize {
        self.command_lists.len()
    }

    fn drain_graveyard(&self, gpu: u64) {
        let destroyed = self
            .graveyard
            .lock_sync()
            .drain(gpu, |g| self.destroy(g));
        if destroyed > 0 {
            logwise::trace_sync!("Destroyed {destroyed} retired objects", destroyed = destroyed);
        }
    }

    fn destroy(&self, garbage: Garbage) {
        match garbage {
            Garbage::Resource(resource) => {
                self.states.forget(resource);
                self.backend.free(resource);
            }
            Garbage::ShaderView(view) => {
                self.backend.free_shader_view(view.handle);
                self.descriptors.free(view.descriptors.page);
            }
            Garbage::Pipeline(pipeline) => self.backend.free_pipeline_state(pipeline),
        }
    }
}

impl<B: Backend> Drop for Context<B> {
    fn drop(&mut self) {
        logwise::info_sync!("Tearing down context");
        self.backend.flush_gpu();
        self.tracker.poll();
        let abandoned = self.command_lists.drain();
        if !abandoned.is_empty() {
            logwise::warn_sync!(
                "Discarding {count} command lists that were never submitted",
                count = abandoned.len()
            );
        }
        for record in abandoned {
            record.node.on_discard();
            self.backend.discard(record.list);
        }
        self.graveyard
            .lock_sync()
            .drain_all(|g| self.destroy(g));
        self.resources
            .free_all(|r| self.destroy(Garbage::Resource(r)));
        self.shader_views
            .free_all(|v| self.destroy(Garbage::ShaderView(v)));
        self.pipelines
            .free_all(|p| self.destroy(Garbage::Pipeline(p)));
        let upload = self.upload.lock_sync().buffer;
        self.backend.free(upload);
    }
}

impl<B: Backend> Debug for Context<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("frame", &self.frame())
            .field("tracker", &self.tracker)
            .field("resources", &self.resources)
            .field("shader_views", &self.shader_views)
            .field("pipelines", &self.pipelines)
            .field("command_lists", &self.command_lists)
            .finish()
    }
}

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The boundary to a concrete graphics API.
//!
//! The core never touches native API objects.  It calls a [Backend] to create and destroy them
//! and manages the handles the backend returns.  Device creation, command encoding, descriptor
//! writes and validation all live on the other side of this trait.
//!
//! Two implementations ship with the crate: [crate::HeadlessBackend], a deterministic CPU
//! stand-in used by tests, and (behind `backend_wgpu`) a [Fence] over wgpu queues.

use crate::handles::{EventHandle, PipelineHandle, QueueType, ResourceHandle, ShaderViewHandle};
use crate::keys::{
    BufferDescription, ComputePipelineDescription, GraphicsPipelineDescription,
    RenderTargetDescription, ShaderViewDescription, TextureDescription,
};
use crate::page_allocator::DescriptorRange;
use crate::state_cache::Barrier;
use std::time::Duration;

/// Outcome of a bounded wait.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    TimedOut,
}

impl WaitResult {
    pub fn is_ready(self) -> bool {
        self == WaitResult::Ready
    }
}

/**
A monotonically increasing GPU timeline value.

The GPU advances the value when it reaches a signal recorded on a queue; the CPU can read it or
wait for it.
*/
pub trait Fence: Send + Sync {
    /// Asks `queue` to set the fence to `value` once all previously submitted work completes.
    fn signal_gpu(&self, value: u64, queue: QueueType);
    /// The last value the GPU reached.
    fn current_value(&self) -> u64;
    /// Blocks until the fence reaches `value` or `timeout` elapses.
    fn wait_cpu(&self, value: u64, timeout: Duration) -> WaitResult;
}

/// One command list handed to [Backend::submit], with the barriers that must execute before it.
#[derive(Debug)]
pub struct Submission<L> {
    pub pre_barriers: Vec<Barrier>,
    pub list: L,
}

/**
Capabilities the core consumes from a graphics API backend.

Implementations must be thread-safe: resources are created from recording threads while the
submission thread submits and polls events.
*/
pub trait Backend: Send + Sync + 'static {
    type Fence: Fence;
    /// Native command allocator (D3D12 `ID3D12CommandAllocator`, Vulkan `VkCommandPool`).
    type CommandAllocator: Send + Sync;
    /// Native command list in the recording state.
    type CommandList: Send;

    fn create_texture(&self, description: &TextureDescription) -> ResourceHandle;
    fn create_buffer(&self, description: &BufferDescription) -> ResourceHandle;
    fn create_render_target(&self, description: &RenderTargetDescription) -> ResourceHandle;
    /// A CPU-visible upload buffer of `size` bytes.
    fn create_mapped_buffer(&self, size: u64) -> ResourceHandle;
    /// Copies `data` into a mapped buffer at `offset`.
    fn write_mapped(&self, buffer: ResourceHandle, offset: u64, data: &[u8]);
    fn free(&self, resource: ResourceHandle);
    fn free_range(&self, resources: &[ResourceHandle]) {
        for resource in resources {
            self.free(*resource);
        }
    }

    /// Writes a shader view into `descriptors`, a range reserved by the caller.
    fn create_shader_view(
        &self,
        description: &ShaderViewDescription,
        descriptors: DescriptorRange,
    ) -> ShaderViewHandle;
    fn free_shader_view(&self, view: ShaderViewHandle);

    fn create_pipeline_state(&self, description: &GraphicsPipelineDescription) -> PipelineHandle;
    fn create_compute_pipeline_state(
        &self,
        description: &ComputePipelineDescription,
    ) -> PipelineHandle;
    fn free_pipeline_state(&self, pipeline: PipelineHandle);

    fn create_fence(&self) -> Self::Fence;
    fn create_command_allocator(&self, queue: QueueType) -> Self::CommandAllocator;
    /// Reclaims all memory of an allocator.  The GPU must be done with every list drawn from it.
    fn reset_command_allocator(&self, allocator: &Self::CommandAllocator);
    fn create_command_list(&self, queue: QueueType) -> Self::CommandList;
    /// Puts `list` into the recording state, drawing memory from `allocator`.
    fn reset_command_list(&self, list: &mut Self::CommandList, allocator: &Self::CommandAllocator);
    fn record_barriers(&self, list: &mut Self::CommandList, barriers: &[Barrier]);
    /// Drops a recorded list without executing it.
    fn discard(&self, list: Self::CommandList);
    /// Executes `lists` in order on `queue`, then sets `signal` (if any) once they complete.
    fn submit(
        &self,
        queue: QueueType,
        lists: Vec<Submission<Self::CommandList>>,
        signal: Option<EventHandle>,
    );

    fn create_event(&self) -> EventHandle;
    /// Returns true, and resets the event, if the GPU has set it.
    fn clear_event(&self, event: EventHandle) -> bool;
    fn free_event(&self, event: EventHandle);

    /// The backbuffer to render into this frame, or `None` if the swapchain must be recreated.
    fn acquire_backbuffer(&self) -> Option<ResourceHandle>;
    fn present(&self);
    fn on_resize(&self, width: u32, height: u32);
    /// Blocks until all submitted GPU work has completed.
    fn flush_gpu(&self);
}

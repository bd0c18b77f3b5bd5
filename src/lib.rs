/*! fences_and_frames decides *when* GPU objects may be reused.

Renderers recycle textures, buffers, descriptor tables, pipelines and command memory constantly,
and every one of those objects may still be referenced by GPU work the CPU submitted frames ago.
This crate is the bookkeeping layer between a renderer and a graphics API backend that makes
recycling safe:

| Piece                                   | Job                                                                     |
|-----------------------------------------|-------------------------------------------------------------------------|
| [linked_pool]                           | O(1) fixed-capacity slot pools for everything handle-indexed            |
| [page_allocator]                        | First-fit contiguous descriptor ranges                                  |
| [ring]                                  | Bump-with-wraparound allocators, optionally bulk-freed per frame        |
| [command_allocator]                     | Rings of native command allocators, reset only once the GPU is done     |
| [epoch]                                 | CPU/GPU epoch counters driven by GPU events                             |
| [cache]                                 | Structural-key caches that only hand back objects the GPU has retired   |
| [state_cache]                           | Per-list resource state tracking and cross-list barrier synthesis      |
| [Context]                               | Ties all of the above to a [Backend]                                    |

# Epochs

Every tracked submission bumps the CPU epoch.  The GPU epoch trails it and only advances when the
event signalled at the end of a submission is observed.  An object freed at CPU epoch `E` is never
handed out again before the GPU epoch reaches `E`.  That is the one invariant everything here is
built around.

# Backends

The core never touches native objects.  A [Backend] creates and destroys them and hands back plain
integer handles.  [HeadlessBackend] is a deterministic CPU stand-in whose "GPU" only advances when
told to, which makes lifetime bugs reproducible in tests.  With the `backend_wgpu` feature,
`imp::wgpu::WgpuFence` implements [Fence] over wgpu queues.

# Failure model

Running out of a provisioned capacity (pool slots, descriptor pages, ring space, events, cache
slots) is a programming or configuration error and panics with a message naming the resource.
Waits on the GPU take a timeout and return [WaitResult].  Only [ContextConfig] validation returns
an error.
*/

pub mod backend;
pub mod cache;
pub mod command_allocator;
pub mod config;
pub mod context;
pub mod epoch;
pub mod handles;
pub mod imp;
pub mod keys;
pub mod linked_pool;
pub mod page_allocator;
pub mod ring;
pub mod state_cache;

pub use backend::{Backend, Fence, Submission, WaitResult};
pub use config::{ConfigError, ContextConfig};
pub use context::{CommandListHandle, Context, CreateError, ShaderView, UploadAllocation};
pub use handles::{EventHandle, PipelineHandle, QueueType, ResourceHandle, ShaderViewHandle};
pub use imp::headless::HeadlessBackend;
pub use state_cache::{Barrier, ResourceState};

// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Epoch-gated object caches.

Freed objects are not destroyed.  They are parked under their structural key, tagged with the CPU
epoch at which they were freed, and only handed out again once the GPU epoch has caught up with
that tag.  A value freed at CPU epoch `E` is therefore never returned by an acquire that observed a
GPU epoch below `E`.

[MultiCache] keeps a bounded queue of parked values per key; [SingleCache] keeps one.  Both count
generations through `cull`, which evicts the retired values of keys nobody asked for recently.
*/

mod multi_cache;
mod single_cache;

pub use multi_cache::MultiCache;
pub use single_cache::SingleCache;

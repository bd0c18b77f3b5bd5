// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Opaque handles returned by a [crate::backend::Backend].

A handle is just an index into a table owned by the backend.  The core never dereferences it,
it only stores it, caches it and hands it back.  There is no generation check: a handle is valid
from the call that created it until the matching `free_*` call.
*/

macro_rules! backend_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            /// Wraps a raw backend index.
            pub const fn from_index(index: u32) -> Self {
                $name(index)
            }
            /// The raw backend index.
            pub const fn index(self) -> u32 {
                self.0
            }
        }
    };
}

backend_handle!(
    /// A texture, buffer or render target.
    ResourceHandle
);
backend_handle!(
    /// A shader view (descriptor table of SRVs, UAVs and samplers).
    ShaderViewHandle
);
backend_handle!(
    /// A graphics or compute pipeline state object.
    PipelineHandle
);
backend_handle!(
    /// A GPU-signalable event.
    EventHandle
);

/// The hardware queue a command list or fence signal targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Direct,
    Compute,
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 3] = [QueueType::Direct, QueueType::Compute, QueueType::Copy];

    pub const fn index(self) -> usize {
        match self {
            QueueType::Direct => 0,
            QueueType::Compute => 1,
            QueueType::Copy => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_indices_match_all() {
        for (i, q) in QueueType::ALL.iter().enumerate() {
            assert_eq!(q.index(), i);
        }
    }

    #[test]
    fn handles_roundtrip_index() {
        let h = ResourceHandle::from_index(17);
        assert_eq!(h.index(), 17);
        assert_ne!(h, ResourceHandle::from_index(18));
    }
}

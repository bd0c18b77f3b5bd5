// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Sizes and timeouts for a [crate::Context].
//!
//! Every limit here is a hard capacity.  Running past one at runtime is a panic, so provision
//! generously.

use crate::ring::MAX_TABS;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// Frames that may be in flight at once.  Also the number of upload ring tabs.
    pub num_backbuffers: usize,
    /// Capacity of the epoch tracker's event pool and ring.
    pub max_events_in_flight: usize,
    /// Parked values per key in the resource and shader view caches.
    pub cache_capacity_per_key: usize,
    /// Caches are culled every this many presented frames.  0 disables culling.
    pub cull_interval_frames: u64,
    /// Cull generations a key may go unused before its retired values are destroyed.
    pub cull_max_age: u64,
    pub num_allocators_per_queue: usize,
    pub max_lists_per_allocator: u32,
    /// Command lists that may be recording or awaiting submission at once.
    pub max_command_lists: usize,
    /// Size of the GPU-visible descriptor heap, in descriptors.
    pub descriptor_count: u32,
    pub descriptor_page_size: u32,
    /// Bytes in the per-frame upload ring.
    pub upload_ring_size: u64,
    /// How long blocking waits on the GPU may take before the operation gives up.
    pub fence_wait_timeout: Duration,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            num_backbuffers: 3,
            max_events_in_flight: 16,
            cache_capacity_per_key: 16,
            cull_interval_frames: 60,
            cull_max_age: 4,
            num_allocators_per_queue: 4,
            max_lists_per_allocator: 8,
            max_command_lists: 64,
            descriptor_count: 4096,
            descriptor_page_size: 16,
            upload_ring_size: 4 * 1024 * 1024,
            fence_wait_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{0} must be nonzero")]
    Zero(&'static str),
    #[error("{requested} backbuffers requested, at most {max} are supported", max = MAX_TABS)]
    TooManyBackbuffers { requested: usize },
    #[error("descriptor page size {page_size} exceeds the heap of {descriptor_count}")]
    PageLargerThanHeap {
        page_size: u32,
        descriptor_count: u32,
    },
    #[error("{events} events cannot cover {backbuffers} frames in flight")]
    TooFewEvents { events: usize, backbuffers: usize },
}

impl ContextConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("num_backbuffers", self.num_backbuffers as u64),
            ("max_events_in_flight", self.max_events_in_flight as u64),
            ("cache_capacity_per_key", self.cache_capacity_per_key as u64),
            ("num_allocators_per_queue", self.num_allocators_per_queue as u64),
            ("max_lists_per_allocator", self.max_lists_per_allocator as u64),
            ("max_command_lists", self.max_command_lists as u64),
            ("descriptor_count", self.descriptor_count as u64),
            ("descriptor_page_size", self.descriptor_page_size as u64),
            ("upload_ring_size", self.upload_ring_size),
        ];
        if let Some(&(name, _)) = counts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.num_backbuffers > MAX_TABS {
            return Err(ConfigError::TooManyBackbuffers {
                requested: self.num_backbuffers,
            });
        }
        if self.descriptor_page_size > self.descriptor_count {
            return Err(ConfigError::PageLargerThanHeap {
                page_size: self.descriptor_page_size,
                descriptor_count: self.descriptor_count,
            });
        }
        if self.max_events_in_flight < self.num_backbuffers {
            return Err(ConfigError::TooFewEvents {
                events: self.max_events_in_flight,
                backbuffers: self.num_backbuffers,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(ContextConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_sizes() {
        let config = ContextConfig {
            max_command_lists: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero("max_command_lists"))
        );

        let config = ContextConfig {
            num_backbuffers: 5,
            max_events_in_flight: 8,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::TooManyBackbuffers { requested: 5 })
        );

        let config = ContextConfig {
            descriptor_count: 8,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PageLargerThanHeap { .. })
        ));

        let config = ContextConfig {
            max_events_in_flight: 2,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "2 events cannot cover 3 frames in flight");
    }
}

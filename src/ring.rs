// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Ring (bump-with-wraparound) allocators over a fixed byte range.
//!
//! [Ring] allocates from the tail and frees from the head, strictly FIFO.  There is no
//! compaction: an allocation that would straddle the end of the range is made contiguous by
//! throwing away the bytes up to the end first ([Ring::padding_to_avoid_crossover]).  The padding
//! is wasted until it is freed along with the allocation after it.
//!
//! [RingWithTabs] adds per-frame accounting ("tabs") so a whole frame's worth of allocations can be
//! freed in one call once the GPU has finished that frame.  It only fits allocation patterns that
//! are freed in frame order; anything with an arbitrary lifetime belongs elsewhere.
//!
//! Neither type is synchronized.  Confine a ring to one thread (usually the submission thread) or
//! put it behind a lock.

/// Maximum number of frame tabs a [RingWithTabs] tracks.
pub const MAX_TABS: usize = 4;

/// Result of [Ring::alloc_contiguous].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingAllocation {
    /// Offset of the payload.
    pub offset: u64,
    /// Bytes thrown away before the payload to keep it contiguous.
    pub padding: u64,
    pub size: u64,
}

impl RingAllocation {
    /// Bytes to pass to [Ring::free] when this allocation retires.
    pub fn consumed(&self) -> u64 {
        self.padding + self.size
    }
}

#[derive(Debug, Clone)]
pub struct Ring {
    total_size: u64,
    head: u64,
    allocated: u64,
}

impl Ring {
    pub fn new(total_size: u64) -> Self {
        assert!(total_size > 0, "ring must have a nonzero size");
        Ring {
            total_size,
            head: 0,
            allocated: 0,
        }
    }

    /// Allocates `size` bytes at the tail.
    ///
    /// Succeeds iff `size() + size <= total_size()`, returning the tail offset before the
    /// allocation.  The returned range may wrap past the end; use [Self::alloc_contiguous] when it
    /// must not.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        if self.allocated + size > self.total_size {
            return None;
        }
        let offset = self.tail();
        self.allocated += size;
        Some(offset)
    }

    /// Releases `size` bytes from the head.
    ///
    /// # Panics
    /// If `size` exceeds the allocated byte count.
    pub fn free(&mut self, size: u64) {
        assert!(
            size <= self.allocated,
            "freeing {size} bytes from a ring holding {allocated}",
            allocated = self.allocated
        );
        self.head = (self.head + size) % self.total_size;
        self.allocated -= size;
    }

    /// Bytes that must be allocated and discarded first so that `size` bytes starting at the
    /// (new) tail do not cross the end of the range.
    pub fn padding_to_avoid_crossover(&self, size: u64) -> u64 {
        let tail = self.tail();
        if tail + size > self.total_size {
            self.total_size - tail
        } else {
            0
        }
    }

    /// Allocates the crossover padding and then `size` bytes, or nothing at all.
    pub fn alloc_contiguous(&mut self, size: u64) -> Option<RingAllocation> {
        if size > self.total_size {
            return None;
        }
        let padding = self.padding_to_avoid_crossover(size);
        if self.allocated + padding + size > self.total_size {
            return None;
        }
        if padding > 0 {
            self.alloc(padding)?;
        }
        let offset = self.alloc(size)?;
        Some(RingAllocation {
            offset,
            padding,
            size,
        })
    }

    pub fn tail(&self) -> u64 {
        (self.head + self.allocated) % self.total_size
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    /// Bytes currently allocated.
    pub fn size(&self) -> u64 {
        self.allocated
    }

    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn remaining(&self) -> u64 {
        self.total_size - self.allocated
    }

    /// Frees everything.
    pub fn reset(&mut self) {
        self.head = 0;
        self.allocated = 0;
    }
}

/**
A [Ring] partitioned into per-frame tabs.

Every byte allocated during a frame is charged to that frame's tab.  [Self::on_begin_frame] closes the
current tab and moves to the next one, freeing whatever that tab recorded `num_backbuffers`
frames ago.
*/
#[derive(Debug, Clone)]
pub struct RingWithTabs {
    ring: Ring,
    tabs: [u64; MAX_TABS],
    current_tab: usize,
    num_backbuffers: usize,
    consumed_this_frame: u64,
}

impl RingWithTabs {
    pub fn new(total_size: u64, num_backbuffers: usize) -> Self {
        assert!(
            (1..=MAX_TABS).contains(&num_backbuffers),
            "RingWithTabs supports 1..={MAX_TABS} backbuffers, got {num_backbuffers}"
        );
        RingWithTabs {
            ring: Ring::new(total_size),
            tabs: [0; MAX_TABS],
            current_tab: 0,
            num_backbuffers,
            consumed_this_frame: 0,
        }
    }

    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        let offset = self.ring.alloc(size)?;
        self.consumed_this_frame += size;
        Some(offset)
    }

    pub fn alloc_contiguous(&mut self, size: u64) -> Option<RingAllocation> {
        let allocation = self.ring.alloc_contiguous(size)?;
        self.consumed_this_frame += allocation.consumed();
        Some(allocation)
    }

    /// Closes the current frame's tab and bulk-frees the oldest one.
    pub fn on_begin_frame(&mut self) {
        self.tabs[self.current_tab] = self.consumed_this_frame;
        self.consumed_this_frame = 0;
        self.current_tab = (self.current_tab + 1) % self.num_backbuffers;
        let oldest = std::mem::take(&mut self.tabs[self.current_tab]);
        self.ring.free(oldest);
    }

    /// Frees every closed tab, keeping the open frame's allocations.  Only valid once the GPU has
    /// finished every earlier frame.
    pub fn free_closed_tabs(&mut self) {
        let closed: u64 = self.tabs.iter().sum();
        self.tabs = [0; MAX_TABS];
        self.ring.free(closed);
    }

    /// Frees every tab.  Only valid once the GPU is idle.
    pub fn reset(&mut self) {
        self.ring.reset();
        self.tabs = [0; MAX_TABS];
        self.consumed_this_frame = 0;
    }

    pub fn current_tab(&self) -> usize {
        self.current_tab
    }

    pub fn consumed_this_frame(&self) -> u64 {
        self.consumed_this_frame
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_then_wrapping_alloc() {
        let mut ring = Ring::new(100);
        assert_eq!(ring.alloc(60), Some(0));
        assert_eq!(ring.alloc(50), None);
        ring.free(60);
        assert_eq!(ring.alloc(50), Some(60));
        assert_eq!(ring.tail(), 10);
    }

    #[test]
    fn size_zero_iff_empty() {
        let mut ring = Ring::new(16);
        assert!(ring.is_empty());
        assert_eq!(ring.size(), 0);
        ring.alloc(4).unwrap();
        assert!(!ring.is_empty());
        ring.free(4);
        assert!(ring.is_empty());
        assert_eq!(ring.head(), 4);
    }

    #[test]
    fn cannot_exceed_remaining() {
        let mut ring = Ring::new(32);
        ring.alloc(20).unwrap();
        assert_eq!(ring.remaining(), 12);
        assert_eq!(ring.alloc(13), None);
        assert_eq!(ring.alloc(12), Some(20));
        assert_eq!(ring.alloc(1), None);
    }

    #[test]
    fn padding_keeps_allocations_contiguous() {
        let mut ring = Ring::new(100);
        ring.alloc(80).unwrap();
        ring.free(70);
        assert_eq!(ring.padding_to_avoid_crossover(30), 20);
        assert_eq!(ring.padding_to_avoid_crossover(20), 0);
        let a = ring.alloc_contiguous(30).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.padding, 20);
        assert_eq!(a.consumed(), 50);
        assert!(a.offset + a.size <= ring.total_size());
    }

    #[test]
    fn contiguous_allocations_never_cross_the_end() {
        let mut ring = Ring::new(128);
        let mut live: std::collections::VecDeque<RingAllocation> = Default::default();
        for i in 0..500u64 {
            let size = 1 + (i * 37) % 50;
            while ring.alloc_contiguous(size).map(|a| live.push_back(a)).is_none() {
                let oldest = live.pop_front().expect("ring empty but allocation failed");
                ring.free(oldest.consumed());
            }
            let newest = live.back().unwrap();
            assert!(newest.offset + newest.size <= ring.total_size());
        }
    }

    #[test]
    fn contiguous_is_all_or_nothing() {
        let mut ring = Ring::new(100);
        ring.alloc(90).unwrap();
        ring.free(50);
        // tail at 90: needs 10 padding + 50 payload, only 60 free
        assert!(ring.alloc_contiguous(51).is_none());
        assert_eq!(ring.size(), 40);
        assert!(ring.alloc_contiguous(50).is_some());
        assert_eq!(ring.size(), 100);
    }

    #[test]
    fn tabs_free_oldest_frame() {
        let mut ring = RingWithTabs::new(100, 3);
        ring.alloc(30).unwrap(); // frame 0
        ring.on_begin_frame();
        ring.alloc(20).unwrap(); // frame 1
        ring.on_begin_frame();
        ring.alloc(40).unwrap(); // frame 2
        assert_eq!(ring.ring().size(), 90);
        assert!(ring.alloc(20).is_none());
        // back to tab 0: frame 0's 30 bytes retire
        ring.on_begin_frame();
        assert_eq!(ring.current_tab(), 0);
        assert_eq!(ring.ring().size(), 60);
        ring.on_begin_frame();
        assert_eq!(ring.ring().size(), 40);
        ring.on_begin_frame();
        ring.on_begin_frame();
        assert!(ring.ring().is_empty());
    }

    #[test]
    fn tabs_count_padding() {
        let mut ring = RingWithTabs::new(64, 2);
        ring.alloc(60).unwrap();
        ring.on_begin_frame();
        ring.on_begin_frame(); // frees the 60
        let a = ring.alloc_contiguous(8).unwrap();
        assert_eq!(a.padding, 4);
        assert_eq!(ring.consumed_this_frame(), 12);
        ring.on_begin_frame();
        ring.on_begin_frame();
        assert!(ring.ring().is_empty());
    }

    #[test]
    fn free_closed_tabs_keeps_open_frame() {
        let mut ring = RingWithTabs::new(100, 4);
        ring.alloc(30).unwrap();
        ring.on_begin_frame();
        ring.alloc(30).unwrap();
        ring.on_begin_frame();
        ring.alloc(25).unwrap();
        ring.free_closed_tabs();
        assert_eq!(ring.ring().size(), 25);
        assert_eq!(ring.ring().head(), 60);
        ring.on_begin_frame();
        ring.on_begin_frame();
        ring.on_begin_frame();
        ring.on_begin_frame();
        assert!(ring.ring().is_empty());
    }

    #[test]
    #[should_panic(expected = "backbuffers")]
    fn too_many_backbuffers() {
        RingWithTabs::new(64, MAX_TABS + 1);
    }
}

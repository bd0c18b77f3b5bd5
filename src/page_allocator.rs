// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
First-fit allocator over fixed-size pages.

Backs GPU-visible descriptor tables: a shader view needs a contiguous range of descriptor
indices, which we hand out in whole pages.

The page table stores, per page, 0 when the page is free, or the page count `n` of an
allocation starting at that page (pages `[i, i + n)` are consumed).  Only the head page carries
the count, so an allocation must always be freed through its head page.
*/

use wasm_safe_mutex::Mutex;

/// A contiguous run of descriptor indices handed out by [PageAllocator::allocate_range].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    /// Head page; pass this back to [PageAllocator::free].
    pub page: u32,
    /// Index of the first descriptor.
    pub first_element: u32,
    /// Number of descriptors the caller asked for (not rounded to pages).
    pub num_elements: u32,
}

#[derive(Debug, Default)]
struct Pages {
    table: Vec<u32>,
    page_size: u32,
    initialized: bool,
}

impl Pages {
    fn allocate(&mut self, size: u32) -> Option<u32> {
        assert!(self.initialized, "PageAllocator used before initialize");
        assert!(size > 0, "zero-sized page allocation");
        let needed = size.div_ceil(self.page_size) as usize;
        let mut i = 0;
        let mut run_start = 0;
        let mut run_len = 0;
        while i < self.table.len() {
            match self.table[i] {
                0 => {
                    if run_len == 0 {
                        run_start = i;
                    }
                    run_len += 1;
                    i += 1;
                    if run_len == needed {
                        self.table[run_start] = needed as u32;
                        return Some(run_start as u32);
                    }
                }
                allocated => {
                    run_len = 0;
                    i += allocated as usize;
                }
            }
        }
        None
    }

    fn free(&mut self, page: u32) {
        let entry = &mut self.table[page as usize];
        assert!(
            *entry != 0,
            "page {page} is not the head of a live allocation"
        );
        *entry = 0;
    }

    fn num_free_pages(&self) -> usize {
        let mut i = 0;
        let mut free = 0;
        while i < self.table.len() {
            match self.table[i] {
                0 => {
                    free += 1;
                    i += 1;
                }
                n => i += n as usize,
            }
        }
        free
    }
}

/// First-fit page allocator.  One mutex per instance; all methods take `&self`.
#[derive(Debug)]
pub struct PageAllocator {
    pages: Mutex<Pages>,
}

impl Default for PageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator {
    pub fn new() -> Self {
        PageAllocator {
            pages: Mutex::new(Pages::default()),
        }
    }

    pub fn with_size(total_elements: u32, elements_per_page: u32) -> Self {
        let allocator = Self::new();
        allocator.initialize(total_elements, elements_per_page);
        allocator
    }

    /// Sets up `ceil(total_elements / elements_per_page)` free pages.
    ///
    /// # Panics
    /// On a second call, or when `elements_per_page` is zero.
    pub fn initialize(&self, total_elements: u32, elements_per_page: u32) {
        assert!(elements_per_page > 0, "page size must be nonzero");
        let mut pages = self.pages.lock_sync();
        assert!(!pages.initialized, "PageAllocator initialized twice");
        pages.table = vec![0; total_elements.div_ceil(elements_per_page) as usize];
        pages.page_size = elements_per_page;
        pages.initialized = true;
    }

    /**
    Finds the first run of free pages able to hold `size` elements.

    Returns the head page, or `None` when no contiguous run is large enough.  `None` is an
    out-of-memory condition; descriptor heaps are sized up front, so see [Self::allocate_or_panic].
    */
    pub fn allocate(&self, size: u32) -> Option<u32> {
        self.pages.lock_sync().allocate(size)
    }

    /// Like [Self::allocate], treating exhaustion as fatal.
    pub fn allocate_or_panic(&self, size: u32) -> u32 {
        match self.allocate(size) {
            Some(page) => page,
            None => panic!(
                "PageAllocator exhausted: no contiguous run for {size} elements ({free} pages free)",
                free = self.num_free_pages()
            ),
        }
    }

    /// Allocates and converts the head page to a descriptor range.
    pub fn allocate_range(&self, size: u32) -> Option<DescriptorRange> {
        let mut pages = self.pages.lock_sync();
        let page = pages.allocate(size)?;
        Some(DescriptorRange {
            page,
            first_element: page * pages.page_size,
            num_elements: size,
        })
    }

    /// Frees the allocation whose head page is `page`.
    ///
    /// # Panics
    /// If `page` is not the head of a live allocation.
    pub fn free(&self, page: u32) {
        self.pages.lock_sync().free(page)
    }

    pub fn free_all(&self) {
        let mut pages = self.pages.lock_sync();
        pages.table.iter_mut().for_each(|p| *p = 0);
    }

    pub fn element_offset(&self, page: u32) -> u32 {
        page * self.pages.lock_sync().page_size
    }

    pub fn page_size(&self) -> u32 {
        self.pages.lock_sync().page_size
    }

    pub fn num_pages(&self) -> usize {
        self.pages.lock_sync().table.len()
    }

    pub fn num_free_pages(&self) -> usize {
        self.pages.lock_sync().num_free_pages()
    }
}

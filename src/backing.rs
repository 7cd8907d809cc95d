// Copyright 2017 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::alloc::Layout;
use std::ptr::NonNull;

/// A provider of the page-aligned regions that back slabs.
///
/// Every `Layout` passed to a `PageSource` has a size which is a non-zero multiple of the page
/// size and an alignment equal to the page size. Small slabs always request exactly one page;
/// large slabs request a fixed multiple of pages per slab. A region is requested exactly once
/// when a slab is grown and released exactly once when that slab is reaped, always with the same
/// `Layout` it was allocated with.
pub trait PageSource {
    /// Allocates a region described by `layout`, or returns `None` if memory is exhausted.
    ///
    /// Returned memory does not need to be initialized.
    ///
    /// # Safety
    /// `layout` must satisfy the requirements described on the trait.
    unsafe fn alloc_pages(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a region previously returned by `alloc_pages` with the same `layout`.
    ///
    /// # Safety
    /// `ptr` must have been returned by `alloc_pages(layout)` on this source and must not have
    /// been released already.
    unsafe fn dealloc_pages(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A `PageSource` backed by the global heap allocator.
#[derive(Copy, Clone, Debug, Default)]
pub struct HeapPages;

impl PageSource for HeapPages {
    unsafe fn alloc_pages(&self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.size() > 0);
        NonNull::new(std::alloc::alloc(layout))
    }

    unsafe fn dealloc_pages(&self, ptr: NonNull<u8>, layout: Layout) {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// A `PageSource` that uses anonymous memory mappings.
#[cfg(all(feature = "os", unix))]
pub mod mmap {
    use super::PageSource;
    use crate::sys::page_size;
    use errno::errno;
    use std::alloc::Layout;
    use std::ptr::{self, NonNull};

    /// A `PageSource` which maps fresh anonymous pages with `mmap` and returns them with
    /// `munmap`.
    #[derive(Copy, Clone, Debug, Default)]
    pub struct MmapPages;

    impl PageSource for MmapPages {
        unsafe fn alloc_pages(&self, layout: Layout) -> Option<NonNull<u8>> {
            use libc::{ENOMEM, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

            // mmap only guarantees page alignment
            debug_assert!(layout.align() <= page_size());
            debug_assert_eq!(layout.size() % page_size(), 0);

            let ptr = libc::mmap(
                ptr::null_mut(),
                layout.size(),
                PROT_READ | PROT_WRITE,
                MAP_ANON | MAP_PRIVATE,
                -1,
                0,
            );
            if ptr == MAP_FAILED {
                if errno().0 == ENOMEM {
                    None
                } else {
                    panic!("mmap failed: {}", errno())
                }
            } else {
                // mmap never places a mapping at address 0 when MAP_FIXED is not supplied
                assert_ne!(ptr, ptr::null_mut(), "mmap returned NULL");
                Some(NonNull::new_unchecked(ptr as *mut u8))
            }
        }

        unsafe fn dealloc_pages(&self, ptr: NonNull<u8>, layout: Layout) {
            // munmap only fails if we pass it invalid arguments
            if libc::munmap(ptr.as_ptr() as *mut _, layout.size()) != 0 {
                panic!("munmap({:?}, {}) failed: {}", ptr, layout.size(), errno());
            }
        }
    }
}

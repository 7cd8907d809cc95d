// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slabs for objects smaller than one eighth of a page.
//!
//! A small slab is exactly one page. Objects are laid out from the start of the page at a fixed
//! stride, and the slab descriptor occupies the last bytes of the page:
//!
//! ```text
//! +---------+---+---------+---+-----+---------+---+--------+------------+
//! | obj 0   | t | obj 1   | t | ... | obj n-1 | t | unused | SmallSlab  |
//! +---------+---+---------+---+-----+---------+---+--------+------------+
//! ^ page                                                    ^ page + hdr_offset
//! ```
//!
//! Each object is followed by a 4-byte trailer (`t`). While the object is free, the trailer holds
//! the page offset of the next free object (or `TRAILER_END`); while it is allocated, the trailer
//! holds `TRAILER_ALLOCATED`. Since a stride need not be a multiple of 4, trailers are read and
//! written unaligned.
//!
//! Because slabs are page-aligned, the slab of any object is found by rounding its address down
//! to the page and adding `hdr_offset`, so small caches need no hash table.

use core::mem;
use core::ptr::{self, NonNull};
use std::alloc;

use crate::backing::PageSource;
use crate::hooks::Hooks;
use crate::util::list::Linkable;
use crate::util::misc::align_up;
use crate::SlabSystem;

pub const TRAILER_SIZE: usize = mem::size_of::<u32>();
const TRAILER_END: u32 = u32::max_value();
const TRAILER_ALLOCATED: u32 = u32::max_value() - 1;

/// The descriptor of a small slab, stored at the end of the slab's page.
#[repr(C)]
pub struct SmallSlab {
    owner: usize,
    used: usize,
    free: usize,
    next: *mut SmallSlab,
    prev: *mut SmallSlab,
    freelist: u32, // page offset of the first free object
}

impl Linkable for SmallSlab {
    fn next(&self) -> *mut SmallSlab {
        self.next
    }
    fn prev(&self) -> *mut SmallSlab {
        self.prev
    }
    fn set_next(&mut self, next: *mut SmallSlab) {
        self.next = next;
    }
    fn set_prev(&mut self, prev: *mut SmallSlab) {
        self.prev = prev;
    }
}

/// The geometry shared by every slab of a small cache.
#[derive(Copy, Clone, Debug)]
pub struct Layout {
    pub obj_size: usize,
    pub stride: usize,
    pub num_obj: usize,
    pub page_size: usize,
    pub hdr_offset: usize,
    page: alloc::Layout,
}

impl Layout {
    /// Computes the layout of `obj_size`-byte objects rounded to `align` in `page_size`-byte
    /// slabs. Returns `None` if not even one object fits.
    pub fn new(obj_size: usize, align: usize, page_size: usize) -> Option<Layout> {
        let stride = align_up(obj_size + TRAILER_SIZE, align);
        let hdr_offset = page_size.checked_sub(mem::size_of::<SmallSlab>())?;
        let num_obj = hdr_offset / stride;
        if num_obj == 0 || hdr_offset >= TRAILER_ALLOCATED as usize {
            return None;
        }
        let page = alloc::Layout::from_size_align(page_size, page_size).ok()?;
        Some(Layout {
            obj_size,
            stride,
            num_obj,
            page_size,
            hdr_offset,
            page,
        })
    }

    fn page_of(&self, ptr: *mut u8) -> *mut u8 {
        (ptr as usize & !(self.page_size - 1)) as *mut u8
    }

    fn header(&self, page: *mut u8) -> *mut SmallSlab {
        (page as usize + self.hdr_offset) as *mut SmallSlab
    }

    fn nth_obj(&self, page: *mut u8, n: usize) -> *mut u8 {
        debug_assert!(n < self.num_obj);
        (page as usize + n * self.stride) as *mut u8
    }

    fn trailer(&self, obj: *mut u8) -> *mut u32 {
        (obj as usize + self.obj_size) as *mut u32
    }
}

pub struct System<B: PageSource> {
    layout: Layout,
    pages: B,
    id: usize,
}

impl<B: PageSource> System<B> {
    /// Creates a system for the cache identified by `id`. Every slab records `id` so that frees
    /// of objects belonging to another cache can be caught.
    pub fn new(layout: Layout, pages: B, id: usize) -> System<B> {
        System { layout, pages, id }
    }
}

impl<B: PageSource> SlabSystem for System<B> {
    type Slab = SmallSlab;

    fn grow(&mut self, hooks: &Hooks) -> Option<NonNull<SmallSlab>> {
        let l = self.layout;
        unsafe {
            let page = self.pages.alloc_pages(l.page)?.as_ptr();
            debug_assert_eq!(page as usize % l.page_size, 0);
            for i in 0..l.num_obj {
                let obj = l.nth_obj(page, i);
                hooks.construct(NonNull::new_unchecked(obj));
                let next = if i + 1 < l.num_obj {
                    ((i + 1) * l.stride) as u32
                } else {
                    TRAILER_END
                };
                ptr::write_unaligned(l.trailer(obj), next);
            }
            let slab = l.header(page);
            ptr::write(
                slab,
                SmallSlab {
                    owner: self.id,
                    used: 0,
                    free: l.num_obj,
                    next: slab,
                    prev: slab,
                    freelist: 0,
                },
            );
            trace!("new small slab at {:p}: {} objects", page, l.num_obj);
            Some(NonNull::new_unchecked(slab))
        }
    }

    unsafe fn reap(&mut self, slab: NonNull<SmallSlab>, hooks: &Hooks) {
        let l = self.layout;
        debug_assert_eq!(slab.as_ref().used, 0);
        debug_assert_eq!(slab.as_ref().free, l.num_obj);
        let page = l.page_of(slab.as_ptr() as *mut u8);
        for i in 0..l.num_obj {
            hooks.destruct(NonNull::new_unchecked(l.nth_obj(page, i)));
        }
        trace!("releasing small slab at {:p}", page);
        self.pages.dealloc_pages(NonNull::new_unchecked(page), l.page);
    }

    fn counts(&self, slab: NonNull<SmallSlab>) -> (usize, usize) {
        let slab = unsafe { slab.as_ref() };
        (slab.used, slab.free)
    }

    unsafe fn alloc(&mut self, slab: NonNull<SmallSlab>) -> NonNull<u8> {
        let l = self.layout;
        let slab = slab.as_ptr();
        let off = (*slab).freelist;
        assert_ne!(off, TRAILER_END, "small slab {:p} has no free objects", slab);
        let obj = l.page_of(slab as *mut u8).add(off as usize);
        let trailer = l.trailer(obj);
        let next = ptr::read_unaligned(trailer);
        assert_ne!(
            next, TRAILER_ALLOCATED,
            "corrupted freelist: free object {:p} is marked allocated",
            obj
        );
        ptr::write_unaligned(trailer, TRAILER_ALLOCATED);
        (*slab).freelist = next;
        (*slab).used += 1;
        (*slab).free -= 1;
        NonNull::new_unchecked(obj)
    }

    unsafe fn dealloc(&mut self, obj: NonNull<u8>) -> NonNull<SmallSlab> {
        let l = self.layout;
        let obj = obj.as_ptr();
        let page = l.page_of(obj);
        let slab = l.header(page);
        assert_eq!(
            (*slab).owner,
            self.id,
            "object {:p} was not allocated from this cache",
            obj
        );
        let off = obj as usize - page as usize;
        assert!(
            off % l.stride == 0 && off / l.stride < l.num_obj,
            "{:p} is not the address of an object",
            obj
        );
        let trailer = l.trailer(obj);
        assert_eq!(
            ptr::read_unaligned(trailer),
            TRAILER_ALLOCATED,
            "double free of {:p}",
            obj
        );
        ptr::write_unaligned(trailer, (*slab).freelist);
        (*slab).freelist = off as u32;
        (*slab).used -= 1;
        (*slab).free += 1;
        NonNull::new_unchecked(slab)
    }

    fn objects_per_slab(&self) -> usize {
        self.layout.num_obj
    }

    fn stride(&self) -> usize {
        self.layout.stride
    }
}

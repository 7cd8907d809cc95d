// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slabs for objects of at least one eighth of a page.
//!
//! Embedding metadata in the buffers of a large slab would waste too much of each page, so a
//! large slab keeps its descriptor (`LargeSlab`) and one control record per buffer (`Bufctl`) out
//! of band, allocated from the bootstrap caches. A free buffer's bufctl is on its slab's
//! freelist; an allocated buffer's bufctl is in the cache's hash table, keyed by the buffer
//! address, which is how `dealloc` finds the slab of an object.
//!
//! The backing region of a slab is `NPAGES` pages when an object fits in a page, and room for
//! `NBUFS` objects otherwise, rounded up to whole pages.

use core::ptr::{self, NonNull};
use std::alloc;

use crate::backing::PageSource;
use crate::bootstrap;
use crate::hooks::Hooks;
use crate::ptr_map::{Keyed, PtrHashMap};
use crate::util::list::Linkable;
use crate::util::misc::align_up;
use crate::util::stack::{self, Chained};
use crate::{SlabSystem, NBUFS, NPAGES};

/// The descriptor of a large slab.
pub struct LargeSlab {
    owner: usize,
    used: usize,
    free: usize,
    next: *mut LargeSlab,
    prev: *mut LargeSlab,
    freelist: *mut Bufctl,
}

impl Linkable for LargeSlab {
    fn next(&self) -> *mut LargeSlab {
        self.next
    }
    fn prev(&self) -> *mut LargeSlab {
        self.prev
    }
    fn set_next(&mut self, next: *mut LargeSlab) {
        self.next = next;
    }
    fn set_prev(&mut self, prev: *mut LargeSlab) {
        self.prev = prev;
    }
}

/// The control record of one buffer of a large slab.
pub struct Bufctl {
    buf: *mut u8,
    next: *mut Bufctl, // freelist or hash chain, depending on the buffer's state
    slab: *mut LargeSlab,
}

impl Chained for Bufctl {
    fn link(&self) -> *mut Bufctl {
        self.next
    }
    fn set_link(&mut self, next: *mut Bufctl) {
        self.next = next;
    }
}

impl Keyed for Bufctl {
    fn key(&self) -> usize {
        self.buf as usize
    }
}

/// Returns the size of the region backing one slab of `stride`-byte buffers.
pub fn backing_size(stride: usize, page_size: usize) -> usize {
    let raw = if stride <= page_size {
        page_size * NPAGES
    } else {
        stride * NBUFS
    };
    align_up(raw, page_size)
}

pub struct System<B: PageSource> {
    stride: usize,
    num_obj: usize,
    region: alloc::Layout,
    pages: B,
    map: PtrHashMap<Bufctl>,
    id: usize,
}

impl<B: PageSource> System<B> {
    /// Creates a system for `size`-byte objects rounded to `align`, owned by the cache `id`.
    /// Returns `None` if the backing region size overflows.
    pub fn new(
        size: usize,
        align: usize,
        page_size: usize,
        pages: B,
        id: usize,
    ) -> Option<System<B>> {
        let stride = align_up(size, align);
        let backing = stride
            .checked_mul(NBUFS)
            .map(|_| backing_size(stride, page_size))?;
        let region = alloc::Layout::from_size_align(backing, page_size).ok()?;
        Some(System {
            stride,
            num_obj: backing / stride,
            region,
            pages,
            map: PtrHashMap::new(page_size),
            id,
        })
    }

    /// Obtains a descriptor and one bufctl per buffer of `region` from the bootstrap caches and
    /// threads the bufctls onto the new slab's freelist. On exhaustion, everything obtained so
    /// far is given back and `None` is returned.
    unsafe fn carve(&self, region: NonNull<u8>) -> Option<NonNull<LargeSlab>> {
        let mut boot = bootstrap::lock();
        let slab = boot.alloc_slab()?;
        ptr::write(
            slab.as_ptr(),
            LargeSlab {
                owner: self.id,
                used: 0,
                free: 0,
                next: slab.as_ptr(),
                prev: slab.as_ptr(),
                freelist: ptr::null_mut(),
            },
        );
        for i in 0..self.num_obj {
            let bufctl = match boot.alloc_bufctl() {
                Some(bufctl) => bufctl,
                None => {
                    warn!("out of bufctls growing a large slab; rolling back");
                    release_bufctls(&mut boot, slab);
                    boot.free_slab(slab);
                    return None;
                }
            };
            ptr::write(
                bufctl.as_ptr(),
                Bufctl {
                    buf: region.as_ptr().add(i * self.stride),
                    next: ptr::null_mut(),
                    slab: slab.as_ptr(),
                },
            );
            stack::push(&mut (*slab.as_ptr()).freelist, bufctl);
            (*slab.as_ptr()).free += 1;
        }
        Some(slab)
    }
}

/// Runs the destructor over every buffer on `slab`'s freelist. Returns the lowest buffer
/// address seen, which is the base of the slab's region if the freelist is complete.
unsafe fn destruct_free(slab: NonNull<LargeSlab>, hooks: &Hooks) -> Option<NonNull<u8>> {
    let mut base: Option<NonNull<u8>> = None;
    let mut cur = slab.as_ref().freelist;
    while !cur.is_null() {
        let buf = NonNull::new_unchecked((*cur).buf);
        hooks.destruct(buf);
        base = match base {
            Some(b) if b.as_ptr() < buf.as_ptr() => Some(b),
            _ => Some(buf),
        };
        cur = (*cur).next;
    }
    base
}

/// Returns every bufctl on `slab`'s freelist to the bootstrap cache.
unsafe fn release_bufctls(boot: &mut bootstrap::Bootstrap, slab: NonNull<LargeSlab>) {
    while let Some(bufctl) = stack::pop(&mut (*slab.as_ptr()).freelist) {
        boot.free_bufctl(bufctl);
    }
}

impl<B: PageSource> SlabSystem for System<B> {
    type Slab = LargeSlab;

    fn grow(&mut self, hooks: &Hooks) -> Option<NonNull<LargeSlab>> {
        unsafe {
            let region = self.pages.alloc_pages(self.region)?;
            let slab = match self.carve(region) {
                Some(slab) => slab,
                None => {
                    self.pages.dealloc_pages(region, self.region);
                    return None;
                }
            };
            // the bootstrap lock is released by now; constructors may use other caches
            for i in 0..self.num_obj {
                hooks.construct(NonNull::new_unchecked(region.as_ptr().add(i * self.stride)));
            }
            trace!(
                "new large slab {:p}: {} objects in {} bytes at {:p}",
                slab,
                self.num_obj,
                self.region.size(),
                region
            );
            Some(slab)
        }
    }

    unsafe fn reap(&mut self, slab: NonNull<LargeSlab>, hooks: &Hooks) {
        debug_assert_eq!(slab.as_ref().used, 0);
        debug_assert_eq!(slab.as_ref().free, self.num_obj);
        let base = match destruct_free(slab, hooks) {
            Some(base) => base,
            None => panic!("large slab {:p} has an empty freelist", slab),
        };
        {
            let mut boot = bootstrap::lock();
            release_bufctls(&mut boot, slab);
            boot.free_slab(slab);
        }
        trace!("releasing large slab {:p} at {:p}", slab, base);
        self.pages.dealloc_pages(base, self.region);
    }

    fn counts(&self, slab: NonNull<LargeSlab>) -> (usize, usize) {
        let slab = unsafe { slab.as_ref() };
        (slab.used, slab.free)
    }

    unsafe fn alloc(&mut self, slab: NonNull<LargeSlab>) -> NonNull<u8> {
        let bufctl = match stack::pop(&mut (*slab.as_ptr()).freelist) {
            Some(bufctl) => bufctl,
            None => panic!("large slab {:p} has no free objects", slab),
        };
        self.map.insert(bufctl);
        (*slab.as_ptr()).used += 1;
        (*slab.as_ptr()).free -= 1;
        NonNull::new_unchecked(bufctl.as_ref().buf)
    }

    unsafe fn dealloc(&mut self, obj: NonNull<u8>) -> NonNull<LargeSlab> {
        let bufctl = match self.map.remove(obj.as_ptr() as usize) {
            Some(bufctl) => bufctl,
            None => panic!(
                "{:p} is not allocated from this cache (double free or foreign pointer)",
                obj
            ),
        };
        let slab = bufctl.as_ref().slab;
        debug_assert_eq!((*slab).owner, self.id);
        stack::push(&mut (*slab).freelist, bufctl);
        (*slab).used -= 1;
        (*slab).free += 1;
        NonNull::new_unchecked(slab)
    }

    fn objects_per_slab(&self) -> usize {
        self.num_obj
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn hashed(&self) -> usize {
        self.map.len()
    }
}

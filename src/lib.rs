// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An object-caching allocator for fixed-size objects, built from page-aligned slabs.
//!
//! # Design
//!
//! A `Cache` is based on the slab allocator design originally introduced in the SunOS 5.4 kernel
//! and described in depth in [The Slab Allocator: An Object-Caching Kernel Memory
//! Allocator][1]. A cache hands out objects of a single size. Its memory comes from slabs - page
//! aligned regions obtained from a `PageSource` and carved into equal-size buffers - and every
//! slab of a cache is, at any moment, on exactly one of two circular lists: `slab_free` (slabs
//! with at least one free buffer) or `slab_full` (slabs with none).
//!
//! Caches come in two size classes, fixed at creation:
//!
//! * Small caches (objects smaller than one eighth of a page) use one page per slab, keep the
//!   slab descriptor in the tail of that page, and thread the freelist through a trailer word
//!   placed after each object. Mapping a freed object back to its slab is a matter of masking
//!   off the low-order bits of its address. See the `small` module.
//! * Large caches keep slab descriptors and per-buffer control records ("bufctls") out of band,
//!   and map outstanding buffers back to their bufctls with a per-cache hash table. The
//!   descriptors themselves are allocated from two internal caches which are built out of this
//!   very allocator. See the `large` and `bootstrap` modules.
//!
//! Constructors and destructors run when storage is carved and released, not on every
//! allocation: a freed object goes back onto its slab's freelist in whatever state the caller
//! left it, and only when the whole slab is reaped is the destructor run.
//!
//! A cache keeps its last slab even when that slab becomes idle, so that a cache with traffic
//! does not bounce a page back and forth with its page source.
//!
//! # Concurrency
//!
//! Each `Cache` serializes its operations with a mutex. `Mode::Blocking` allocation on an
//! exhausted cache sleeps on a condition variable that is signalled by every `free` and every
//! `grow`; `Mode::NonBlocking` allocation never waits.
//!
//! [1]: http://www.usenix.org/publications/library/proceedings/bos94/full_papers/bonwick.ps

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

mod backing;
mod bootstrap;
mod hooks;
mod large;
mod ptr_map;
mod small;
mod sys;
mod util;

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::util::list::{CircularList, Linkable};

#[cfg(all(feature = "os", unix))]
pub use crate::backing::mmap::MmapPages;
pub use crate::backing::{HeapPages, PageSource};
pub use crate::hooks::Hook;
use crate::hooks::Hooks;
pub use crate::sys::page_size;

/// The maximum length, in bytes, of a cache name. Longer names are truncated.
pub const CACHE_NAME_MAX: usize = 32;

/// The number of pages backing one large slab whose objects fit in a page.
pub const NPAGES: usize = 8;

/// The number of objects backing one large slab whose objects are larger than a page.
pub const NBUFS: usize = 8;

static NEXT_CACHE_ID: AtomicUsize = AtomicUsize::new(1);

/// An error indicating that no buffer is available.
///
/// `Exhausted` is the only non-fatal failure of a cache: it is returned by `Mode::NonBlocking`
/// allocation when every slab is full, by timed allocation when the timeout expires, and by
/// `grow` when the page source has no memory left.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("no buffer available")
    }
}

impl std::error::Error for Exhausted {}

/// How `Cache::alloc` behaves when the cache has no free buffer.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Mode {
    /// Wait until another thread frees a buffer or grows the cache.
    Blocking,
    /// Return `Err(Exhausted)` immediately.
    NonBlocking,
}

/// The size class of a cache, which selects the slab algorithm it uses.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    /// Returns the size class used for objects of `size` bytes: small iff `size` is less than
    /// one eighth of the page size.
    pub fn of(size: usize) -> SizeClass {
        if size < page_size() >> 3 {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }
}

/// A snapshot of a cache's slab topology.
///
/// For every cache, `used + free == slabs * objects_per_slab` and `slabs == free_slabs +
/// full_slabs`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct CacheStats {
    /// Total number of slabs.
    pub slabs: usize,
    /// Slabs with at least one free buffer.
    pub free_slabs: usize,
    /// Slabs with no free buffers.
    pub full_slabs: usize,
    /// Buffers currently handed out.
    pub used: usize,
    /// Buffers available for allocation.
    pub free: usize,
    /// Entries in the buffer hash table; always zero for small caches.
    pub hashed: usize,
}

/// A pool of fixed-size objects.
///
/// See the crate documentation for an overview of the algorithm.
pub struct Cache<B: PageSource = HeapPages> {
    raw: Mutex<RawCache<B>>,
    available: Condvar,
    name: String,
    size: usize,
    stride: usize,
    class: SizeClass,
    per_slab: usize,
}

impl Cache<HeapPages> {
    /// Creates a cache backed by the heap.
    ///
    /// `name` is truncated to `CACHE_NAME_MAX` bytes. An `align` of zero means objects are
    /// packed at their natural stride with no further rounding; otherwise `align` must be a power
    /// of two no larger than the page size. `ctor` runs on every buffer when its slab is grown;
    /// `dtor` runs on every buffer when its slab is reaped.
    ///
    /// # Panics
    /// Panics if the arguments are invalid or if memory for the first slab cannot be obtained.
    pub fn create(
        name: &str,
        size: usize,
        align: usize,
        ctor: Option<Hook>,
        dtor: Option<Hook>,
    ) -> Cache<HeapPages> {
        let mut builder = CacheBuilder::new(name, size).align(align);
        builder.ctor = ctor;
        builder.dtor = dtor;
        builder.build()
    }
}

impl<B: PageSource> Cache<B> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object size the cache was created with.
    pub fn object_size(&self) -> usize {
        self.size
    }

    /// The distance between consecutive objects in a slab, including any trailer and padding.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size_class(&self) -> SizeClass {
        self.class
    }

    /// The number of objects carved out of every slab of this cache.
    pub fn objects_per_slab(&self) -> usize {
        self.per_slab
    }

    /// Allocates an object.
    ///
    /// If no slab has a free buffer, `Mode::NonBlocking` returns `Err(Exhausted)` while
    /// `Mode::Blocking` waits until one becomes available. Allocation never grows the cache on
    /// its own; see `grow`.
    ///
    /// The returned memory holds whatever state the constructor (if any) or the previous owner
    /// left in it.
    pub fn alloc(&self, mode: Mode) -> Result<NonNull<u8>, Exhausted> {
        let mut raw = self.raw.lock();
        loop {
            match raw.alloc() {
                Ok(obj) => return Ok(obj),
                Err(Exhausted) if mode == Mode::NonBlocking => return Err(Exhausted),
                Err(Exhausted) => {
                    trace!("cache `{}` exhausted; waiting for a free", self.name);
                    self.available.wait(&mut raw);
                }
            }
        }
    }

    /// Allocates an object, waiting at most `timeout` for a buffer to become available.
    ///
    /// A timeout too long to be represented as a deadline waits like `Mode::Blocking`.
    pub fn alloc_timeout(&self, timeout: Duration) -> Result<NonNull<u8>, Exhausted> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(deadline) => deadline,
            None => return self.alloc(Mode::Blocking),
        };
        let mut raw = self.raw.lock();
        loop {
            if let Ok(obj) = raw.alloc() {
                return Ok(obj);
            }
            if self.available.wait_until(&mut raw, deadline).timed_out() {
                return raw.alloc();
            }
        }
    }

    /// Returns an object to the cache.
    ///
    /// # Safety
    /// `obj` must have been returned by `alloc` or `alloc_timeout` on this cache and must not
    /// have been freed since. Some violations (double frees, pointers unknown to a large cache)
    /// are detected and reported by panicking; others are undefined behavior.
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        self.raw.lock().free(obj);
        self.available.notify_one();
    }

    /// Adds a slab to the cache and wakes any blocked allocators.
    pub fn grow(&self) -> Result<(), Exhausted> {
        self.raw.lock().grow()?;
        self.available.notify_all();
        Ok(())
    }

    /// Releases idle slabs (slabs with no objects in use) until either none are left or only
    /// one slab remains in the cache. Returns the number of slabs released.
    pub fn reap(&self) -> usize {
        self.raw.lock().reap_idle()
    }

    pub fn stats(&self) -> CacheStats {
        self.raw.lock().stats()
    }

    /// Destroys the cache, running the destructor over every cached object and releasing all
    /// memory.
    ///
    /// # Panics
    /// Every allocated object must have been freed, and the cache must be down to a single idle
    /// slab (call `reap` first if it was grown). Otherwise `destroy` panics, and the cache's
    /// memory is leaked rather than released under live pointers.
    pub fn destroy(self) {
        let raw = self.raw.into_inner();
        let stats = raw.stats();
        assert!(
            raw.is_drained(),
            "cannot destroy cache `{}`: {} objects outstanding in {} slabs ({} full)",
            self.name,
            stats.used,
            stats.slabs,
            stats.full_slabs
        );
        debug!("destroying cache `{}`", self.name);
        drop(raw);
    }
}

impl<B: PageSource> fmt::Debug for Cache<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("stride", &self.stride)
            .field("class", &self.class)
            .field("objects_per_slab", &self.per_slab)
            .finish()
    }
}

/// A builder for `Cache`s.
pub struct CacheBuilder<B: PageSource = HeapPages> {
    name: String,
    size: usize,
    align: usize,
    ctor: Option<Hook>,
    dtor: Option<Hook>,
    pages: B,
}

impl CacheBuilder<HeapPages> {
    /// Starts configuring a heap-backed cache of `size`-byte objects.
    ///
    /// # Panics
    /// `size` must be non-zero.
    pub fn new(name: &str, size: usize) -> CacheBuilder<HeapPages> {
        assert!(size > 0, "cache `{}`: object size must be non-zero", name);
        CacheBuilder {
            name: util::misc::bounded_name(name),
            size,
            align: 0,
            ctor: None,
            dtor: None,
            pages: HeapPages,
        }
    }
}

impl<B: PageSource> CacheBuilder<B> {
    /// Sets the object alignment.
    ///
    /// `align` must be zero (no rounding) or a power of two no larger than the page size.
    pub fn align(mut self, align: usize) -> CacheBuilder<B> {
        assert!(
            align == 0 || align.is_power_of_two(),
            "cache `{}`: alignment {} is not a power of two",
            self.name,
            align
        );
        assert!(
            align <= page_size(),
            "cache `{}`: alignment {} exceeds the page size",
            self.name,
            align
        );
        self.align = align;
        self
    }

    /// Sets the constructor, run once per object when its slab is grown.
    ///
    /// # Deadlocks
    /// The constructor runs with this cache's lock held. It must not call back into the same
    /// cache; doing so deadlocks. Other caches, small or large, may be used freely.
    pub fn ctor<F>(mut self, f: F) -> CacheBuilder<B>
    where
        F: Fn(NonNull<u8>, usize) + Send + Sync + 'static,
    {
        self.ctor = Some(Box::new(f));
        self
    }

    /// Sets the destructor, run once per object when its slab is reaped.
    ///
    /// # Deadlocks
    /// The destructor runs with this cache's lock held, including when a `free` releases an
    /// idle slab. It must not call back into the same cache; doing so deadlocks. Other caches,
    /// small or large, may be used freely.
    pub fn dtor<F>(mut self, f: F) -> CacheBuilder<B>
    where
        F: Fn(NonNull<u8>, usize) + Send + Sync + 'static,
    {
        self.dtor = Some(Box::new(f));
        self
    }

    /// Uses `pages` instead of the heap to back slabs.
    pub fn page_source<P: PageSource>(self, pages: P) -> CacheBuilder<P> {
        CacheBuilder {
            name: self.name,
            size: self.size,
            align: self.align,
            ctor: self.ctor,
            dtor: self.dtor,
            pages,
        }
    }

    /// Builds the cache, growing its first slab.
    pub fn try_build(self) -> Result<Cache<B>, Exhausted> {
        let hooks = Hooks::new(self.size, self.ctor, self.dtor);
        let raw = RawCache::new(&self.name, self.size, self.align, hooks, self.pages)?;
        debug!(
            "created {:?} cache `{}`: size {} stride {} objects/slab {}",
            raw.size_class(),
            self.name,
            self.size,
            raw.stride(),
            raw.objects_per_slab()
        );
        Ok(Cache {
            class: raw.size_class(),
            stride: raw.stride(),
            per_slab: raw.objects_per_slab(),
            raw: Mutex::new(raw),
            available: Condvar::new(),
            name: self.name,
            size: self.size,
        })
    }

    /// Builds the cache, growing its first slab.
    ///
    /// # Panics
    /// Panics if memory for the first slab cannot be obtained.
    pub fn build(self) -> Cache<B> {
        let name = self.name.clone();
        match self.try_build() {
            Ok(cache) => cache,
            Err(Exhausted) => panic!("out of memory growing the first slab of cache `{}`", name),
        }
    }
}

/// A cache without its own synchronization, specialized by size class.
///
/// The size class is chosen once, at creation, and every operation dispatches on it.
enum RawCache<B: PageSource> {
    Small(SizedCache<small::System<B>>),
    Large(SizedCache<large::System<B>>),
}

// The raw pointers inside a `RawCache` all point into memory owned by that cache (or into the
// bootstrap caches, which are themselves synchronized), so moving it between threads is sound.
unsafe impl<B: PageSource + Send> Send for RawCache<B> {}

impl<B: PageSource> RawCache<B> {
    /// Creates a cache and grows its first slab.
    fn new(
        name: &str,
        size: usize,
        align: usize,
        hooks: Hooks,
        pages: B,
    ) -> Result<RawCache<B>, Exhausted> {
        let page_size = page_size();
        let id = NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed);
        let mut cache = match SizeClass::of(size) {
            SizeClass::Small => {
                let layout = small::Layout::new(size, align, page_size).unwrap_or_else(|| {
                    panic!(
                        "cache `{}`: no {}-byte object with alignment {} fits in a page",
                        name, size, align
                    )
                });
                let system = small::System::new(layout, pages, id);
                RawCache::Small(SizedCache::new(name, system, hooks))
            }
            SizeClass::Large => {
                let system = large::System::new(size, align, page_size, pages, id)
                    .unwrap_or_else(|| {
                        panic!("cache `{}`: object size {} is too large", name, size)
                    });
                RawCache::Large(SizedCache::new(name, system, hooks))
            }
        };
        cache.grow()?;
        Ok(cache)
    }

    fn size_class(&self) -> SizeClass {
        match *self {
            RawCache::Small(_) => SizeClass::Small,
            RawCache::Large(_) => SizeClass::Large,
        }
    }

    fn stride(&self) -> usize {
        match *self {
            RawCache::Small(ref c) => c.system.stride(),
            RawCache::Large(ref c) => c.system.stride(),
        }
    }

    fn objects_per_slab(&self) -> usize {
        match *self {
            RawCache::Small(ref c) => c.system.objects_per_slab(),
            RawCache::Large(ref c) => c.system.objects_per_slab(),
        }
    }

    fn grow(&mut self) -> Result<(), Exhausted> {
        match *self {
            RawCache::Small(ref mut c) => c.grow(),
            RawCache::Large(ref mut c) => c.grow(),
        }
    }

    fn alloc(&mut self) -> Result<NonNull<u8>, Exhausted> {
        match *self {
            RawCache::Small(ref mut c) => c.alloc(),
            RawCache::Large(ref mut c) => c.alloc(),
        }
    }

    unsafe fn free(&mut self, obj: NonNull<u8>) {
        match *self {
            RawCache::Small(ref mut c) => c.free(obj),
            RawCache::Large(ref mut c) => c.free(obj),
        }
    }

    fn reap_idle(&mut self) -> usize {
        match *self {
            RawCache::Small(ref mut c) => c.reap_idle(),
            RawCache::Large(ref mut c) => c.reap_idle(),
        }
    }

    fn stats(&self) -> CacheStats {
        match *self {
            RawCache::Small(ref c) => c.stats(),
            RawCache::Large(ref c) => c.stats(),
        }
    }

    fn is_drained(&self) -> bool {
        match *self {
            RawCache::Small(ref c) => c.is_drained(),
            RawCache::Large(ref c) => c.is_drained(),
        }
    }
}

/// The cache state shared by both size classes: the slab lists and the lifecycle hooks.
struct SizedCache<S: SlabSystem> {
    name: String,
    slab_free: CircularList<S::Slab>, // slabs with at least one free buffer
    slab_full: CircularList<S::Slab>, // slabs with no free buffers
    system: S,
    hooks: Hooks,
}

impl<S: SlabSystem> SizedCache<S> {
    fn new(name: &str, system: S, hooks: Hooks) -> SizedCache<S> {
        SizedCache {
            name: name.to_string(),
            slab_free: CircularList::new(),
            slab_full: CircularList::new(),
            system,
            hooks,
        }
    }

    fn slabs(&self) -> usize {
        self.slab_free.len() + self.slab_full.len()
    }

    fn grow(&mut self) -> Result<(), Exhausted> {
        let slab = self.system.grow(&self.hooks).ok_or(Exhausted)?;
        debug_assert_eq!(self.system.counts(slab), (0, self.system.objects_per_slab()));
        self.slab_free.insert_back(slab.as_ptr());
        trace!("cache `{}` grew to {} slabs", self.name, self.slabs());
        Ok(())
    }

    fn alloc(&mut self) -> Result<NonNull<u8>, Exhausted> {
        let slab = self.slab_free.head().ok_or(Exhausted)?;
        debug_assert!(self.system.counts(slab).1 > 0);
        let obj = unsafe { self.system.alloc(slab) };
        if self.system.counts(slab).1 == 0 {
            self.slab_free.remove(slab.as_ptr());
            self.slab_full.insert_front(slab.as_ptr());
        }
        Ok(obj)
    }

    unsafe fn free(&mut self, obj: NonNull<u8>) {
        let slab = self.system.dealloc(obj);
        let (used, free) = self.system.counts(slab);
        if free == 1 {
            // the slab was full until now
            self.slab_full.remove(slab.as_ptr());
            self.slab_free.insert_back(slab.as_ptr());
        }
        // the last slab is kept around, even if idle, until the cache is destroyed
        if used == 0 && self.slabs() > 1 {
            self.reap(slab);
        }
    }

    /// Removes an idle slab from `slab_free` and releases it.
    unsafe fn reap(&mut self, slab: NonNull<S::Slab>) {
        debug_assert_eq!(self.system.counts(slab).0, 0);
        self.slab_free.remove(slab.as_ptr());
        self.system.reap(slab, &self.hooks);
        trace!("cache `{}` reaped a slab; {} left", self.name, self.slabs());
    }

    fn reap_idle(&mut self) -> usize {
        let idle: Vec<NonNull<S::Slab>> = self
            .slab_free
            .iter()
            .filter(|&slab| self.system.counts(slab).0 == 0)
            .collect();
        let mut reaped = 0;
        for slab in idle {
            if self.slabs() == 1 {
                break;
            }
            unsafe { self.reap(slab) };
            reaped += 1;
        }
        reaped
    }

    fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            slabs: self.slabs(),
            free_slabs: self.slab_free.len(),
            full_slabs: self.slab_full.len(),
            hashed: self.system.hashed(),
            ..CacheStats::default()
        };
        for slab in self.slab_free.iter() {
            let (used, free) = self.system.counts(slab);
            debug_assert!(free > 0, "slab on slab_free has no free buffers");
            stats.used += used;
            stats.free += free;
        }
        for slab in self.slab_full.iter() {
            let (used, free) = self.system.counts(slab);
            debug_assert_eq!(free, 0, "slab on slab_full has free buffers");
            stats.used += used;
        }
        stats
    }

    /// A cache is drained when it holds exactly one slab and nothing is allocated from it.
    fn is_drained(&self) -> bool {
        match self.slab_free.head() {
            Some(slab) => {
                self.slab_full.is_empty()
                    && self.slab_free.len() == 1
                    && self.system.counts(slab).0 == 0
            }
            None => false,
        }
    }
}

impl<S: SlabSystem> Drop for SizedCache<S> {
    fn drop(&mut self) {
        if self.slabs() == 0 {
            // the first growth never succeeded
            return;
        }
        if !self.is_drained() {
            let stats = self.stats();
            if std::thread::panicking() {
                warn!(
                    "leaking {} slabs of cache `{}` with {} objects outstanding",
                    stats.slabs, self.name, stats.used
                );
                return;
            }
            panic!(
                "cannot destroy cache `{}`: {} objects outstanding in {} slabs ({} full)",
                self.name, stats.used, stats.slabs, stats.full_slabs
            );
        }
        if let Some(slab) = self.slab_free.head() {
            unsafe { self.reap(slab) };
        }
    }
}

/// A slab algorithm.
///
/// A `SlabSystem` knows how to carve slabs and how to find an object's slab; the list
/// bookkeeping that decides which slab to use lives in `SizedCache`.
trait SlabSystem {
    type Slab: Linkable;

    /// Grows a new slab with every object free, running the constructor over each object.
    ///
    /// The returned slab is detached (linked to itself). Returns `None` if memory is exhausted.
    fn grow(&mut self, hooks: &Hooks) -> Option<NonNull<Self::Slab>>;

    /// Runs the destructor over every object of an idle, detached slab and releases it.
    unsafe fn reap(&mut self, slab: NonNull<Self::Slab>, hooks: &Hooks);

    /// Returns the `(used, free)` object counts of `slab`.
    fn counts(&self, slab: NonNull<Self::Slab>) -> (usize, usize);

    /// Allocates an object from `slab`, which must have at least one free object.
    unsafe fn alloc(&mut self, slab: NonNull<Self::Slab>) -> NonNull<u8>;

    /// Returns `obj` to its slab and returns that slab.
    unsafe fn dealloc(&mut self, obj: NonNull<u8>) -> NonNull<Self::Slab>;

    fn objects_per_slab(&self) -> usize;
    fn stride(&self) -> usize;

    /// The number of outstanding objects tracked by a hash table, if the system keeps one.
    fn hashed(&self) -> usize {
        0
    }
}

// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The caches that hold large-slab metadata.
//!
//! Large slabs keep their descriptors and bufctls out of band. Rather than going to a separate
//! allocator for them, we allocate them from two process-wide caches of our own: `slab_cache`,
//! sized for `LargeSlab`, and `bufctl_cache`, sized for `Bufctl`. Both objects are far smaller
//! than an eighth of a page, so both caches are small caches, whose metadata is embedded in
//! their own pages. That is what ends the recursion: growing a bootstrap cache never needs the
//! bootstrap caches.
//!
//! The caches are created lazily, the first time a large slab is grown. Unlike user caches they
//! grow on demand when exhausted.
//!
//! Locking: the bootstrap lock is only ever taken after user cache locks, never the other way
//! around, and it is never held while constructors or destructors run, so hooks are free to use
//! other caches. A thread that already holds the bootstrap lock and tries to take it again panics
//! instead of deadlocking.

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use parking_lot::{Mutex, MutexGuard};
use std::alloc::Layout;
use std::cell::Cell;

use crate::backing::HeapPages;
use crate::hooks::Hooks;
use crate::large::{Bufctl, LargeSlab};
use crate::{Exhausted, RawCache};

lazy_static! {
    static ref BOOTSTRAP: Mutex<Bootstrap> = Mutex::new(Bootstrap {
        slab_cache: None,
        bufctl_cache: None,
    });
}

thread_local! {
    static HELD: Cell<bool> = Cell::new(false);
}

#[cfg(test)]
thread_local! {
    /// How many more bufctls this thread may allocate before `alloc_bufctl` reports exhaustion.
    pub static BUFCTL_BUDGET: Cell<Option<usize>> = Cell::new(None);
}

pub struct Bootstrap {
    slab_cache: Option<RawCache<HeapPages>>,
    bufctl_cache: Option<RawCache<HeapPages>>,
}

/// Exclusive access to the bootstrap caches.
pub struct Guard {
    inner: MutexGuard<'static, Bootstrap>,
}

/// Locks the bootstrap caches.
///
/// # Panics
/// Panics if the calling thread already holds the lock.
pub fn lock() -> Guard {
    HELD.with(|held| {
        assert!(
            !held.get(),
            "bootstrap caches re-entered while this thread holds their lock"
        );
        held.set(true);
    });
    Guard {
        inner: BOOTSTRAP.lock(),
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        HELD.with(|held| held.set(false));
    }
}

impl Deref for Guard {
    type Target = Bootstrap;
    fn deref(&self) -> &Bootstrap {
        &self.inner
    }
}

impl DerefMut for Guard {
    fn deref_mut(&mut self) -> &mut Bootstrap {
        &mut self.inner
    }
}

impl Bootstrap {
    pub fn alloc_slab(&mut self) -> Option<NonNull<LargeSlab>> {
        alloc_from(&mut self.slab_cache, "slab_cache", Layout::new::<LargeSlab>())
            .map(NonNull::cast)
    }

    pub fn alloc_bufctl(&mut self) -> Option<NonNull<Bufctl>> {
        #[cfg(test)]
        {
            let exhausted = BUFCTL_BUDGET.with(|budget| match budget.get() {
                Some(0) => true,
                Some(n) => {
                    budget.set(Some(n - 1));
                    false
                }
                None => false,
            });
            if exhausted {
                return None;
            }
        }
        alloc_from(&mut self.bufctl_cache, "bufctl_cache", Layout::new::<Bufctl>())
            .map(NonNull::cast)
    }

    pub unsafe fn free_slab(&mut self, slab: NonNull<LargeSlab>) {
        match self.slab_cache {
            Some(ref mut cache) => cache.free(slab.cast()),
            None => panic!("freeing a slab descriptor before slab_cache exists"),
        }
    }

    pub unsafe fn free_bufctl(&mut self, bufctl: NonNull<Bufctl>) {
        match self.bufctl_cache {
            Some(ref mut cache) => cache.free(bufctl.cast()),
            None => panic!("freeing a bufctl before bufctl_cache exists"),
        }
    }
}

fn alloc_from(
    cache: &mut Option<RawCache<HeapPages>>,
    name: &str,
    layout: Layout,
) -> Option<NonNull<u8>> {
    if cache.is_none() {
        debug!("creating bootstrap cache `{}`", name);
        let hooks = Hooks::none(layout.size());
        *cache = Some(RawCache::new(name, layout.size(), layout.align(), hooks, HeapPages).ok()?);
    }
    let cache = cache.as_mut()?;
    match cache.alloc() {
        Ok(obj) => Some(obj),
        Err(Exhausted) => {
            cache.grow().ok()?;
            cache.alloc().ok()
        }
    }
}

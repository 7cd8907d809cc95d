// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A chained hash table from buffer addresses to their control records.
//!
//! The table never allocates per entry: each entry is an existing record (a bufctl) threaded
//! onto its bucket through the same intrusive link it uses on a slab's freelist. A record is on
//! the freelist while its buffer is free and in the table while its buffer is allocated, never
//! both.

use core::ptr::{self, NonNull};

use crate::util::stack::{self, Chained};

/// A record that can be stored in a `PtrHashMap`, keyed by an address.
pub trait Keyed: Chained {
    fn key(&self) -> usize;
}

pub struct PtrHashMap<T: Keyed> {
    buckets: Box<[*mut T]>,
    len: usize,
}

impl<T: Keyed> PtrHashMap<T> {
    /// Creates a table with `size` buckets.
    pub fn new(size: usize) -> PtrHashMap<T> {
        assert!(size > 0, "a hash table needs at least one bucket");
        PtrHashMap {
            buckets: vec![ptr::null_mut(); size].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline]
    fn bucket(&self, key: usize) -> usize {
        key % self.buckets.len()
    }

    /// The number of records in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Inserts `t` at the front of its bucket's chain.
    ///
    /// # Safety
    /// `t` must be valid and must not be on any other chain. No record with the same key may
    /// already be in the table.
    pub unsafe fn insert(&mut self, t: NonNull<T>) {
        let key = t.as_ref().key();
        debug_assert!(self.get(key).is_none(), "duplicate key {:#x}", key);
        let b = self.bucket(key);
        stack::push(&mut self.buckets[b], t);
        self.len += 1;
    }

    /// Looks up the record with `key` without removing it.
    pub unsafe fn get(&self, key: usize) -> Option<NonNull<T>> {
        let mut cur = self.buckets[self.bucket(key)];
        while !cur.is_null() {
            if (*cur).key() == key {
                return Some(NonNull::new_unchecked(cur));
            }
            cur = (*cur).link();
        }
        None
    }

    /// Unlinks and returns the record with `key`, or `None` if there is none.
    pub unsafe fn remove(&mut self, key: usize) -> Option<NonNull<T>> {
        let b = self.bucket(key);
        let mut prev: *mut T = ptr::null_mut();
        let mut cur = self.buckets[b];
        while !cur.is_null() {
            let next = (*cur).link();
            if (*cur).key() == key {
                if prev.is_null() {
                    self.buckets[b] = next;
                } else {
                    (*prev).set_link(next);
                }
                (*cur).set_link(ptr::null_mut());
                self.len -= 1;
                return Some(NonNull::new_unchecked(cur));
            }
            prev = cur;
            cur = next;
        }
        None
    }

    /// Returns the length of every bucket's chain.
    #[cfg(test)]
    pub fn dump_by_bucket(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .map(|&head| {
                let mut len = 0;
                let mut cur = head;
                while !cur.is_null() {
                    len += 1;
                    cur = unsafe { (*cur).link() };
                }
                len
            })
            .collect()
    }
}

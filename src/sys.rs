// Copyright 2017-2018 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Host configuration queries.
//!
//! The only thing the allocator needs from the host is its page size, which decides both the
//! small/large split and the granularity of every slab.

lazy_static! {
    static ref PAGE_SIZE: usize = checked(host_pagesize());
}

/// Returns the host's memory page size in bytes.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

#[cfg(any(unix, windows))]
fn host_pagesize() -> usize {
    sysconf::page::pagesize()
}

#[cfg(not(any(unix, windows)))]
fn host_pagesize() -> usize {
    4096
}

// slab geometry masks addresses with the page size
fn checked(pagesize: usize) -> usize {
    assert!(
        pagesize.is_power_of_two(),
        "page size {} is not a power of two",
        pagesize
    );
    pagesize
}

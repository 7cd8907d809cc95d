use core::fmt;
use core::ptr::NonNull;

/// A constructor or destructor for cached objects.
///
/// A hook receives a pointer to the object's storage and the object size the cache was created
/// with.
pub type Hook = Box<dyn Fn(NonNull<u8>, usize) + Send + Sync>;

/// The object lifecycle hooks of a cache.
///
/// Unlike a general-purpose allocator, a cache does not construct objects on every allocation.
/// The constructor runs once, when a slab is grown and its storage is first carved into
/// objects, and the destructor runs once, when the slab is reaped and its storage handed back
/// to the page source. Objects freed back to the cache are expected to be returned in their
/// constructed state, so that a later allocation can skip construction entirely.
pub struct Hooks {
    ctor: Option<Hook>,
    dtor: Option<Hook>,
    size: usize,
}

impl Hooks {
    pub fn new(size: usize, ctor: Option<Hook>, dtor: Option<Hook>) -> Hooks {
        Hooks { ctor, dtor, size }
    }

    /// Hooks which do nothing; used for the allocator's own metadata caches.
    pub fn none(size: usize) -> Hooks {
        Hooks::new(size, None, None)
    }

    #[inline]
    pub fn construct(&self, obj: NonNull<u8>) {
        if let Some(ref ctor) = self.ctor {
            ctor(obj, self.size);
        }
    }

    #[inline]
    pub fn destruct(&self, obj: NonNull<u8>) {
        if let Some(ref dtor) = self.dtor {
            dtor(obj, self.size);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("ctor", &self.ctor.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("size", &self.size)
            .finish()
    }
}

pub mod list {
    use core::ptr::{self, NonNull};

    /// An object which can be threaded onto a `CircularList`.
    ///
    /// A detached object links to itself in both directions.
    pub trait Linkable {
        fn next(&self) -> *mut Self;
        fn prev(&self) -> *mut Self;
        fn set_next(&mut self, ptr: *mut Self);
        fn set_prev(&mut self, ptr: *mut Self);
    }

    /// An intrusive, circular, doubly-linked list.
    ///
    /// The list owns none of its elements; it only rewires the link fields embedded in them. The
    /// element before `head` is the tail of the list.
    pub struct CircularList<T: Linkable> {
        head: *mut T,
        len: usize,
    }

    impl<T: Linkable> CircularList<T> {
        pub fn new() -> CircularList<T> {
            CircularList {
                head: ptr::null_mut(),
                len: 0,
            }
        }

        pub fn len(&self) -> usize {
            self.len
        }

        pub fn is_empty(&self) -> bool {
            self.len == 0
        }

        pub fn head(&self) -> Option<NonNull<T>> {
            NonNull::new(self.head)
        }

        /// Inserts `t` immediately before the head, making it the new tail.
        ///
        /// `t` must be detached (linked to itself).
        pub fn insert_back(&mut self, t: *mut T) {
            unsafe {
                debug_assert_eq!((*t).next(), t);
                debug_assert_eq!((*t).prev(), t);
                if self.head.is_null() {
                    self.head = t;
                } else {
                    let head = self.head;
                    let tail = (*head).prev();
                    (*t).set_prev(tail);
                    (*t).set_next(head);
                    (*tail).set_next(t);
                    (*head).set_prev(t);
                }
            }
            self.len += 1;
        }

        /// Inserts `t` as the new head.
        pub fn insert_front(&mut self, t: *mut T) {
            self.insert_back(t);
            self.head = t;
        }

        /// Unlinks `t`, which must currently be an element of this list, and leaves it detached.
        pub fn remove(&mut self, t: *mut T) {
            debug_assert!(self.len > 0);
            debug_assert!(self.contains(t));
            unsafe {
                if self.len == 1 {
                    debug_assert_eq!(self.head, t);
                    self.head = ptr::null_mut();
                } else {
                    let prev = (*t).prev();
                    let next = (*t).next();
                    (*prev).set_next(next);
                    (*next).set_prev(prev);
                    if self.head == t {
                        self.head = next;
                    }
                }
                (*t).set_next(t);
                (*t).set_prev(t);
            }
            self.len -= 1;
        }

        pub fn iter(&self) -> Iter<T> {
            Iter {
                cur: self.head,
                remaining: self.len,
            }
        }

        pub fn contains(&self, t: *mut T) -> bool {
            self.iter().any(|elem| elem.as_ptr() == t)
        }
    }

    pub struct Iter<T: Linkable> {
        cur: *mut T,
        remaining: usize,
    }

    impl<T: Linkable> Iterator for Iter<T> {
        type Item = NonNull<T>;

        fn next(&mut self) -> Option<NonNull<T>> {
            if self.remaining == 0 {
                return None;
            }
            let cur = NonNull::new(self.cur)?;
            self.remaining -= 1;
            self.cur = unsafe { (*cur.as_ptr()).next() };
            Some(cur)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        struct Node {
            val: usize,
            next: *mut Node,
            prev: *mut Node,
        }

        impl Linkable for Node {
            fn next(&self) -> *mut Node {
                self.next
            }
            fn prev(&self) -> *mut Node {
                self.prev
            }
            fn set_next(&mut self, next: *mut Node) {
                self.next = next;
            }
            fn set_prev(&mut self, prev: *mut Node) {
                self.prev = prev;
            }
        }

        fn nodes(n: usize) -> Vec<*mut Node> {
            (0..n)
                .map(|val| {
                    let node = Box::into_raw(Box::new(Node {
                        val,
                        next: ptr::null_mut(),
                        prev: ptr::null_mut(),
                    }));
                    unsafe {
                        (*node).next = node;
                        (*node).prev = node;
                    }
                    node
                })
                .collect()
        }

        fn values(list: &CircularList<Node>) -> Vec<usize> {
            list.iter().map(|n| unsafe { n.as_ref().val }).collect()
        }

        fn free(nodes: Vec<*mut Node>) {
            for n in nodes {
                unsafe { drop(Box::from_raw(n)) };
            }
        }

        #[test]
        fn insert_back_and_front() {
            let ns = nodes(4);
            let mut list = CircularList::new();
            list.insert_back(ns[0]);
            list.insert_back(ns[1]);
            list.insert_front(ns[2]);
            list.insert_back(ns[3]);
            assert_eq!(values(&list), vec![2, 0, 1, 3]);
            assert_eq!(list.len(), 4);
            // circularity: the tail links back to the head
            unsafe {
                assert_eq!((*ns[3]).next, ns[2]);
                assert_eq!((*ns[2]).prev, ns[3]);
            }
            for &n in &ns {
                list.remove(n);
            }
            free(ns);
        }

        #[test]
        fn remove_head_middle_last() {
            let ns = nodes(3);
            let mut list = CircularList::new();
            for &n in &ns {
                list.insert_back(n);
            }
            list.remove(ns[1]);
            assert_eq!(values(&list), vec![0, 2]);
            list.remove(ns[0]);
            assert_eq!(values(&list), vec![2]);
            assert_eq!(list.head().map(|h| h.as_ptr()), Some(ns[2]));
            list.remove(ns[2]);
            assert!(list.is_empty());
            assert!(list.head().is_none());
            // removed nodes are left detached so they can be reinserted elsewhere
            unsafe {
                assert_eq!((*ns[1]).next, ns[1]);
                assert_eq!((*ns[1]).prev, ns[1]);
            }
            let mut other = CircularList::new();
            other.insert_front(ns[1]);
            assert!(other.contains(ns[1]));
            assert!(!other.contains(ns[0]));
            other.remove(ns[1]);
            free(ns);
        }
    }
}

pub mod stack {
    use core::ptr::{self, NonNull};

    /// An object which can be pushed onto an intrusive singly-linked stack.
    pub trait Chained {
        fn link(&self) -> *mut Self;
        fn set_link(&mut self, next: *mut Self);
    }

    /// Pushes `t` onto the stack whose top is `*top`.
    ///
    /// # Safety
    /// `t` must be valid for writes and must not already be on a stack.
    pub unsafe fn push<T: Chained>(top: &mut *mut T, t: NonNull<T>) {
        (*t.as_ptr()).set_link(*top);
        *top = t.as_ptr();
    }

    /// Pops the top of the stack, or returns `None` if it is empty.
    ///
    /// # Safety
    /// Every element reachable from `*top` must be valid for reads and writes.
    pub unsafe fn pop<T: Chained>(top: &mut *mut T) -> Option<NonNull<T>> {
        let t = NonNull::new(*top)?;
        *top = (*t.as_ptr()).link();
        (*t.as_ptr()).set_link(ptr::null_mut());
        Some(t)
    }

}

pub mod misc {
    use crate::CACHE_NAME_MAX;

    /// Rounds `size` up to a multiple of `align`. An `align` of zero leaves `size` unchanged.
    pub fn align_up(size: usize, align: usize) -> usize {
        if align == 0 {
            size
        } else {
            debug_assert!(align.is_power_of_two());
            (size + align - 1) & !(align - 1)
        }
    }

    /// Truncates `name` to at most `CACHE_NAME_MAX` bytes without splitting a character.
    pub fn bounded_name(name: &str) -> String {
        if name.len() <= CACHE_NAME_MAX {
            return name.to_string();
        }
        let mut end = CACHE_NAME_MAX;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name[..end].to_string()
    }

}

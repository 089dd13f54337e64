use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr;

#[cfg(all(test, not(miri)))]
use std::collections::BTreeSet;
#[cfg(all(test, not(miri)))]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(all(test, not(miri)))]
use std::sync::Mutex;

#[cfg(all(test, not(miri)))]
static LL_NODE_COUNTER: AtomicUsize = AtomicUsize::new(1);
#[cfg(all(test, not(miri)))]
thread_local!(static LL_ALLOC_LIST: Mutex<BTreeSet<usize>> = const { Mutex::new(BTreeSet::new()) });

#[cfg(all(test, not(miri)))]
fn alloc_nid() -> usize {
    let nid: usize = LL_NODE_COUNTER.fetch_add(1, Ordering::AcqRel);
    LL_ALLOC_LIST.with(|llist| llist.lock().unwrap().insert(nid));
    nid
}

#[cfg(all(test, not(miri)))]
fn release_nid(nid: usize) {
    // A cache shared between threads frees nodes on whichever thread evicts
    // them, so only nodes this thread allocated are tracked here.
    let _ = LL_ALLOC_LIST.try_with(|llist| llist.lock().unwrap().remove(&nid));
}

/// Asserts that every node allocated on this thread has been freed.
#[cfg(test)]
pub fn assert_released() {
    #[cfg(not(miri))]
    {
        let is_empt = LL_ALLOC_LIST.with(|llist| {
            let x = llist.lock().unwrap();
            eprintln!("Assert Released - Remaining -> {:?}", x);
            x.is_empty()
        });
        assert!(is_empt);
    }
}

/// An intrusive doubly linked list with sentinel head and tail markers.
///
/// Nodes are individually boxed so a node keeps its address for its whole life,
/// including while it is extracted from one list and appended to another. The
/// owning structure keeps `LLNodeRef`s to nodes in its index and must never hold
/// one past the node's release.
#[derive(Debug)]
pub(crate) struct LL<T> {
    head: *mut LLNode<T>,
    tail: *mut LLNode<T>,
    size: usize,
}

#[derive(Debug)]
struct LLNode<T> {
    t: MaybeUninit<T>,
    next: *mut LLNode<T>,
    prev: *mut LLNode<T>,
    #[cfg(all(test, not(miri)))]
    nid: usize,
}

#[derive(Debug)]
pub(crate) struct LLNodeRef<T> {
    inner: *mut LLNode<T>,
}

// Manual impls, the derive would demand T: Copy.
impl<T> Clone for LLNodeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for LLNodeRef<T> {}

impl<T> PartialEq for LLNodeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T> Eq for LLNodeRef<T> {}

/// A node that has been cut out of a list. It must either be appended to a
/// list or released with `LL::free_n`, dropping it while it still carries
/// content is a bug.
#[derive(Debug)]
pub(crate) struct LLNodeOwned<T> {
    inner: *mut LLNode<T>,
}

impl<T> LLNodeOwned<T> {
    fn into_inner(mut self) -> *mut LLNode<T> {
        let x = self.inner;
        self.inner = ptr::null_mut();
        x
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_null()
    }
}

impl<T> Drop for LLNodeOwned<T> {
    fn drop(&mut self) {
        if !self.inner.is_null() {
            unsafe {
                debug_assert!((*self.inner).next.is_null());
                debug_assert!((*self.inner).prev.is_null());
            }
            panic!("dropping LLNodeOwned<T> which has valid content, this should never happen!");
        }
    }
}

// The list owns its nodes exclusively; sharing follows the content type.
unsafe impl<T: Send> Send for LL<T> {}
unsafe impl<T: Sync> Sync for LL<T> {}
unsafe impl<T: Send + Sync> Send for LLNodeRef<T> {}
unsafe impl<T: Sync> Sync for LLNodeRef<T> {}

pub(crate) struct LLIter<'a, T> {
    next: *mut LLNode<T>,
    end: *mut LLNode<T>,
    phantom: PhantomData<&'a T>,
}

impl<T> LL<T> {
    pub(crate) fn new() -> Self {
        let (head, tail) = LLNode::create_markers();
        LL {
            head,
            tail,
            size: 0,
        }
    }

    pub(crate) fn iter(&self) -> LLIter<'_, T> {
        LLIter {
            next: unsafe { (*self.head).next },
            end: self.tail,
            phantom: PhantomData,
        }
    }

    // Append a t to the list, and return its pointer.
    pub(crate) fn append_k(&mut self, t: T) -> LLNodeRef<T> {
        let n = LLNode::new(t);
        self.append_n(n)
    }

    // Append an arbitrary node into this list, at the tail end.
    pub(crate) fn append_n(&mut self, owned: LLNodeOwned<T>) -> LLNodeRef<T> {
        let n = owned.into_inner();
        unsafe {
            self.size += 1;
            // Tail has no trailing nodes.
            debug_assert!((*self.tail).next.is_null());
            // Tail must have a previous node.
            debug_assert!(!(*self.tail).prev.is_null());
            let pred = (*self.tail).prev;
            debug_assert!(!pred.is_null());
            // pred <-> tail
            debug_assert!((*pred).next == self.tail);

            // pred <-> n <-> tail
            (*n).prev = pred;
            (*n).next = self.tail;
            (*pred).next = n;
            (*self.tail).prev = n;
            debug_assert!((*(*n).prev).next == n);
            debug_assert!((*(*n).next).prev == n);
        };
        LLNodeRef { inner: n }
    }

    // remove the head node from the ll, and return it.
    pub(crate) fn pop(&mut self) -> Option<LLNodeOwned<T>> {
        let n = unsafe { (*self.head).next };
        if n == self.tail {
            None
        } else {
            let owned = self.extract(LLNodeRef { inner: n });
            debug_assert!(!owned.is_null());
            debug_assert!(owned.inner != self.head);
            debug_assert!(owned.inner != self.tail);
            Some(owned)
        }
    }

    pub(crate) fn pop_n_free(&mut self) -> Option<T> {
        self.pop().map(Self::free_n)
    }

    // Release an extracted node, handing back its content.
    pub(crate) fn free_n(owned: LLNodeOwned<T>) -> T {
        LLNode::into_inner(owned.into_inner())
    }

    // Cut a node out from this list from any location. The node must belong
    // to this list.
    pub(crate) fn extract(&mut self, n: LLNodeRef<T>) -> LLNodeOwned<T> {
        assert!(!n.inner.is_null());
        assert!(self.size > 0);
        unsafe {
            // prev <-> n <-> next
            debug_assert!(!(*n.inner).prev.is_null());
            debug_assert!(!(*n.inner).next.is_null());
            debug_assert!((*(*n.inner).prev).next == n.inner);
            debug_assert!((*(*n.inner).next).prev == n.inner);
            self.size -= 1;

            let prev = (*n.inner).prev;
            let next = (*n.inner).next;
            (*next).prev = prev;
            (*prev).next = next;
            // prev <-> next

            if cfg!(test) || cfg!(debug_assertions) {
                (*n.inner).prev = ptr::null_mut();
                (*n.inner).next = ptr::null_mut();
            }
        }

        LLNodeOwned { inner: n.inner }
    }

    pub(crate) fn len(&self) -> usize {
        self.size
    }

    /// Borrow the content of a node that belongs to this list.
    pub(crate) fn node(&self, n: LLNodeRef<T>) -> &T {
        debug_assert!(!n.inner.is_null());
        unsafe { &*(*n.inner).t.as_ptr() }
    }

    /// The oldest node, if any.
    pub(crate) fn first(&self) -> Option<LLNodeRef<T>> {
        let next = unsafe { (*self.head).next };
        if next == self.tail {
            None
        } else {
            Some(LLNodeRef { inner: next })
        }
    }

    /// The node following `n`, or `None` when `n` is the newest.
    pub(crate) fn next_of(&self, n: LLNodeRef<T>) -> Option<LLNodeRef<T>> {
        debug_assert!(!n.inner.is_null());
        let next = unsafe { (*n.inner).next };
        debug_assert!(!next.is_null());
        if next == self.tail {
            None
        } else {
            Some(LLNodeRef { inner: next })
        }
    }

    #[cfg(test)]
    pub(crate) fn peek_head(&self) -> Option<&T> {
        self.first().map(|n| unsafe { &*(*n.inner).t.as_ptr() })
    }

    #[cfg(test)]
    pub(crate) fn peek_tail(&self) -> Option<&T> {
        let prev = unsafe { (*self.tail).prev };
        if prev == self.head {
            None
        } else {
            Some(unsafe { &*(*prev).t.as_ptr() })
        }
    }

    pub(crate) fn clear(&mut self) {
        while let Some(owned) = self.pop() {
            let _ = Self::free_n(owned);
        }
        debug_assert_eq!(self.size, 0);
    }

    #[cfg(test)]
    pub(crate) fn verify(&self) {
        let head = self.head;
        let tail = self.tail;
        let mut size = 0;

        assert_ne!(head, tail);
        unsafe {
            assert!((*head).prev.is_null());
            assert!(!(*head).next.is_null());
            assert!((*tail).next.is_null());
            assert!(!(*tail).prev.is_null());
        }

        let mut n = unsafe { (*head).next };
        unsafe {
            assert_eq!((*n).prev, head);
        }

        while n != tail {
            unsafe {
                let next = (*n).next;
                size += 1;
                assert!(!(*n).prev.is_null());
                assert!(!(*n).next.is_null());
                assert!((*(*n).prev).next == n);
                assert!((*(*n).next).prev == n);
                n = next;
            }
        }

        assert_eq!(self.size, size);
    }
}

impl<T> Drop for LL<T> {
    fn drop(&mut self) {
        let head = self.head;
        let tail = self.tail;

        debug_assert!(head != tail);

        let mut n = unsafe { (*head).next };
        while n != tail {
            unsafe {
                let next = (*n).next;
                debug_assert!((*next).prev == n);
                LLNode::free(n);
                n = next;
            }
        }

        LLNode::free_marker(head);
        LLNode::free_marker(tail);
    }
}

impl<T> LLNode<T> {
    #[inline]
    fn create_markers() -> (*mut Self, *mut Self) {
        let head = Box::into_raw(Box::new(LLNode {
            t: MaybeUninit::uninit(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            #[cfg(all(test, not(miri)))]
            nid: alloc_nid(),
        }));
        let tail = Box::into_raw(Box::new(LLNode {
            t: MaybeUninit::uninit(),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            #[cfg(all(test, not(miri)))]
            nid: alloc_nid(),
        }));
        unsafe {
            (*head).next = tail;
            (*tail).prev = head;
        }
        (head, tail)
    }

    #[inline]
    #[allow(clippy::new_ret_no_self)]
    fn new(t: T) -> LLNodeOwned<T> {
        let b = Box::new(LLNode {
            t: MaybeUninit::new(t),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            #[cfg(all(test, not(miri)))]
            nid: alloc_nid(),
        });
        LLNodeOwned {
            inner: Box::into_raw(b),
        }
    }

    #[inline]
    fn into_inner(v: *mut Self) -> T {
        debug_assert!(!v.is_null());
        let llnode = unsafe { Box::from_raw(v) };
        let t = unsafe { llnode.t.assume_init() };
        #[cfg(all(test, not(miri)))]
        release_nid(llnode.nid);
        t
    }

    #[inline]
    fn free(v: *mut Self) {
        let _ = Self::into_inner(v);
    }

    #[inline]
    fn free_marker(v: *mut Self) {
        debug_assert!(!v.is_null());
        let _llnode = unsafe { Box::from_raw(v) };
        // Markers never have a t to drop.
        #[cfg(all(test, not(miri)))]
        release_nid(_llnode.nid)
    }
}

impl<'a, T> Iterator for LLIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        debug_assert!(!self.next.is_null());
        if self.next == self.end {
            None
        } else {
            let r = unsafe { &*(*self.next).t.as_ptr() };
            self.next = unsafe { (*self.next).next };
            Some(r)
        }
    }
}

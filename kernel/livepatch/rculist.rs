//! Singly linked list with lock-free readers and deferred reclamation.
//!
//! Writers serialize on an internal update lock. A new element is fully
//! initialized before a `Release` store publishes it at the head; readers
//! traverse with `Acquire` loads under an [`RcuReadGuard`]. Unlinked elements
//! keep their `next` pointer intact and are freed through
//! [`RcuDomain::call_rcu`], so a reader standing on one can still walk off it.

use alloc::alloc::Layout;
use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::Mutex;

use crate::rcu::{RcuDomain, RcuReadGuard};
use crate::Errno;

struct Link<T> {
    value: T,
    next: AtomicPtr<Link<T>>,
}

#[cfg(test)]
std::thread_local! {
    static FAIL_ALLOC: core::cell::Cell<Option<usize>> = const { core::cell::Cell::new(None) };
}

/// Make the link allocation after the next `skip` ones fail on this thread.
#[cfg(test)]
pub(crate) fn fail_alloc_after(skip: usize) {
    FAIL_ALLOC.with(|c| c.set(Some(skip)));
}

#[cfg(test)]
fn alloc_should_fail() -> bool {
    FAIL_ALLOC.with(|c| match c.get() {
        Some(0) => {
            c.set(None);
            true
        }
        Some(n) => {
            c.set(Some(n - 1));
            false
        }
        None => false,
    })
}

impl<T> Link<T> {
    /// Allocate a link without aborting on exhaustion.
    fn try_new(value: T, next: *mut Link<T>) -> Result<*mut Link<T>, Errno> {
        #[cfg(test)]
        if alloc_should_fail() {
            return Err(Errno::ENOMEM);
        }
        let layout = Layout::new::<Link<T>>();
        // SAFETY: `Link<T>` always has a non-zero size (it holds a pointer).
        let raw = unsafe { alloc::alloc::alloc(layout) } as *mut Link<T>;
        if raw.is_null() {
            return Err(Errno::ENOMEM);
        }
        // SAFETY: `raw` is a fresh allocation with the layout of `Link<T>`.
        unsafe {
            raw.write(Link {
                value,
                next: AtomicPtr::new(next),
            })
        };
        Ok(raw)
    }
}

/// A link that has been unlinked and waits for its grace period.
struct Retired<T>(*mut Link<T>);

// SAFETY: the link is unreachable for new readers and is only dropped once.
unsafe impl<T: Send> Send for Retired<T> {}

impl<T> Retired<T> {
    fn free(self) {
        // SAFETY: allocated by `Link::try_new` with the global allocator and
        // the layout of `Link<T>`; the grace period has ended.
        drop(unsafe { Box::from_raw(self.0) });
    }
}

/// RCU-protected list. New elements go to the front.
pub struct RcuList<T> {
    head: AtomicPtr<Link<T>>,
    update: Mutex<()>,
    _owns: PhantomData<*mut T>,
}

// SAFETY: readers on other CPUs get `&T`; reclamation may drop `T` elsewhere.
unsafe impl<T: Send + Sync> Sync for RcuList<T> {}
unsafe impl<T: Send> Send for RcuList<T> {}

impl<T> RcuList<T> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            update: Mutex::new(()),
            _owns: PhantomData,
        }
    }

    /// Publish `value` at the front of the list.
    pub fn push_front(&self, value: T) -> Result<(), Errno> {
        let _update = self.update.lock();
        let head = self.head.load(Ordering::Acquire);
        let link = Link::try_new(value, head)?;
        self.head.store(link, Ordering::Release);
        Ok(())
    }

    /// Unlink the first element matching `pred` and free it after a grace
    /// period of `rcu`. Returns `false` if nothing matched.
    pub fn remove_first<P>(&self, rcu: &RcuDomain, mut pred: P) -> bool
    where
        P: FnMut(&T) -> bool,
        T: Send + 'static,
    {
        let _update = self.update.lock();
        let mut prev: &AtomicPtr<Link<T>> = &self.head;
        loop {
            let cur = prev.load(Ordering::Acquire);
            if cur.is_null() {
                return false;
            }
            // SAFETY: reachable links are live; updaters hold `update`.
            let link = unsafe { &*cur };
            if pred(&link.value) {
                prev.store(link.next.load(Ordering::Acquire), Ordering::Release);
                let retired = Retired(cur);
                rcu.call_rcu(move || retired.free());
                return true;
            }
            prev = &link.next;
        }
    }

    /// Iterate from the front. Elements stay valid while `guard` is held.
    pub fn iter<'g>(&'g self, _guard: &'g RcuReadGuard<'_>) -> Iter<'g, T> {
        Iter {
            cur: self.head.load(Ordering::Acquire),
            _guard: PhantomData,
        }
    }

    /// First element, if any.
    pub fn first<'g>(&'g self, guard: &'g RcuReadGuard<'_>) -> Option<&'g T> {
        self.iter(guard).next()
    }

    /// Returns `true` if the list has no elements.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for RcuList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RcuList<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: `&mut self` rules out readers; every link is owned here.
            let link = unsafe { Box::from_raw(cur) };
            cur = link.next.load(Ordering::Relaxed);
        }
    }
}

/// Iterator over an [`RcuList`] inside a read-side critical section.
pub struct Iter<'g, T> {
    cur: *mut Link<T>,
    _guard: PhantomData<&'g T>,
}

impl<'g, T> Iterator for Iter<'g, T> {
    type Item = &'g T;

    fn next(&mut self) -> Option<&'g T> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: links reached during the critical section stay allocated
        // until the caller's guard is dropped.
        let link: &'g Link<T> = unsafe { &*self.cur };
        self.cur = link.next.load(Ordering::Acquire);
        Some(&link.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::vec::Vec;

    struct Tracked(u32, Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_push_front_order() {
        let rcu = RcuDomain::new();
        let list = RcuList::new();
        for v in 1..=3u32 {
            list.push_front(v).unwrap();
        }
        let guard = rcu.read_lock();
        let seen: Vec<u32> = list.iter(&guard).copied().collect();
        assert_eq!(seen, [3, 2, 1]);
        assert_eq!(list.first(&guard), Some(&3));
    }

    #[test]
    fn test_remove_defers_free() {
        let rcu = RcuDomain::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let list = RcuList::new();
        for v in 0..3 {
            list.push_front(Tracked(v, drops.clone())).unwrap();
        }

        let guard = rcu.read_lock();
        let middle = list.iter(&guard).nth(1).unwrap();
        assert!(list.remove_first(&rcu, |t| t.0 == 1));
        assert!(!list.remove_first(&rcu, |t| t.0 == 7));

        // Still readable through the old reference, not yet freed.
        assert_eq!(middle.0, 1);
        assert_eq!(rcu.poll(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        let left: Vec<u32> = list.iter(&guard).map(|t| t.0).collect();
        assert_eq!(left, [2, 0]);
        drop(guard);

        rcu.synchronize();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        drop(list);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_push_front_out_of_memory() {
        let rcu = RcuDomain::new();
        let drops = Arc::new(AtomicUsize::new(0));
        let list = RcuList::new();
        list.push_front(Tracked(1, drops.clone())).unwrap();

        fail_alloc_after(0);
        let err = list.push_front(Tracked(2, drops.clone())).unwrap_err();
        assert_eq!(err, Errno::ENOMEM);
        // The rejected value is dropped, the list is untouched.
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        let guard = rcu.read_lock();
        let left: Vec<u32> = list.iter(&guard).map(|t| t.0).collect();
        assert_eq!(left, [1]);
    }

    #[test]
    fn test_remove_head_and_tail() {
        let rcu = RcuDomain::new();
        let list = RcuList::new();
        for v in 0..4u32 {
            list.push_front(v).unwrap();
        }
        assert!(list.remove_first(&rcu, |v| *v == 3));
        assert!(list.remove_first(&rcu, |v| *v == 0));
        {
            let guard = rcu.read_lock();
            let left: Vec<u32> = list.iter(&guard).copied().collect();
            assert_eq!(left, [2, 1]);
        }
        assert!(list.remove_first(&rcu, |_| true));
        assert!(list.remove_first(&rcu, |_| true));
        assert!(list.is_empty());
        rcu.synchronize();
    }
}

//! Grace-period domain for the patch registry.
//!
//! Readers of the registry run from arbitrary contexts and must never block,
//! while the patching thread has to know when an unlinked node is no longer
//! visible to anyone. Each [`RcuDomain`] tracks that on its own, so a registry
//! carries its domain instead of sharing a kernel-wide one.
//!
//! # Scheme
//!
//! - Readers increment one of two counters selected by the parity of the
//!   domain epoch, then re-read the epoch. If it moved they back out and retry,
//!   so a registered reader is always counted against the epoch it observed.
//! - A grace period advances the epoch and waits for the counter of the
//!   previous parity to drain. Readers that start afterwards use the other
//!   counter and already see the unlinked state.
//! - [`RcuDomain::call_rcu`] queues a callback tagged with the epoch whose
//!   completion makes it safe; [`RcuDomain::synchronize`] and
//!   [`RcuDomain::poll`] run callbacks once `completed` reaches that epoch.
//!
//! ```rust,ignore
//! let guard = domain.read_lock();
//! // traverse RCU-protected data...
//! drop(guard);
//!
//! // writer, after unlinking `old`:
//! domain.call_rcu(move || drop(old));
//! domain.poll();
//! ```

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// Callbacks run per `poll()` call.
const MAX_CALLBACKS_PER_POLL: usize = 16;

struct CallbackBatch {
    target_epoch: u64,
    callbacks: VecDeque<Box<dyn FnOnce() + Send>>,
}

/// An independent RCU domain.
pub struct RcuDomain {
    /// Current epoch. Readers count against `readers[epoch & 1]`.
    epoch: AtomicU64,
    /// Highest epoch whose grace period has finished.
    completed: AtomicU64,
    readers: [AtomicUsize; 2],
    /// Serializes grace-period advancement.
    gp_lock: Mutex<()>,
    /// Pending callbacks, batched by target epoch in ascending order.
    callbacks: Mutex<VecDeque<CallbackBatch>>,
}

impl RcuDomain {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(1),
            completed: AtomicU64::new(1),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            gp_lock: Mutex::new(()),
            callbacks: Mutex::new(VecDeque::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    /// Enter a read-side critical section. Nesting is allowed.
    ///
    /// Never call [`RcuDomain::synchronize`] while holding the guard: the
    /// grace period would wait for this reader forever.
    pub fn read_lock(&self) -> RcuReadGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let idx = (epoch & 1) as usize;
            self.readers[idx].fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return RcuReadGuard { domain: self, idx };
            }
            self.readers[idx].fetch_sub(1, Ordering::SeqCst);
            core::hint::spin_loop();
        }
    }

    /// Number of readers currently inside a critical section.
    pub fn active_readers(&self) -> usize {
        self.readers[0].load(Ordering::Acquire) + self.readers[1].load(Ordering::Acquire)
    }

    fn read_unlock(&self, idx: usize) {
        let old = self.readers[idx].fetch_sub(1, Ordering::SeqCst);
        if old == 0 {
            panic!("rcu: read_unlock without matching read_lock");
        }
    }

    // ------------------------------------------------------------------------
    // Writer side
    // ------------------------------------------------------------------------

    /// Wait until every reader that could see pre-existing state has left,
    /// then run the callbacks that became safe.
    ///
    /// Busy-waits; must not be called from a read-side critical section.
    pub fn synchronize(&self) {
        {
            let _gp = self.gp_lock.lock();
            self.complete_in_flight(true);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.complete_in_flight(true);
        }
        while self.drain_callbacks(self.completed.load(Ordering::Acquire)) != 0 {}
    }

    /// Queue `f` to run after all current readers are gone.
    pub fn call_rcu<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // Readers on the current epoch are only waited for by the grace
        // period that ends the current epoch.
        let target = self.epoch.load(Ordering::SeqCst) + 1;
        let mut batches = self.callbacks.lock();
        if let Some(back) = batches.back_mut() {
            if back.target_epoch == target {
                back.callbacks.push_back(Box::new(f));
                return;
            }
        }
        let mut callbacks: VecDeque<Box<dyn FnOnce() + Send>> = VecDeque::new();
        callbacks.push_back(Box::new(f));
        batches.push_back(CallbackBatch {
            target_epoch: target,
            callbacks,
        });
    }

    /// Advance grace periods without blocking and run ready callbacks.
    ///
    /// Returns the number of callbacks executed (at most
    /// `MAX_CALLBACKS_PER_POLL`).
    pub fn poll(&self) -> usize {
        if let Some(_gp) = self.gp_lock.try_lock() {
            if self.complete_in_flight(false) && self.has_waiting_callbacks() {
                self.epoch.fetch_add(1, Ordering::SeqCst);
                self.complete_in_flight(false);
            }
        }
        self.drain_callbacks(self.completed.load(Ordering::Acquire))
    }

    /// Callbacks queued but not yet run.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks
            .lock()
            .iter()
            .map(|batch| batch.callbacks.len())
            .sum()
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    /// Finish the grace period ending the current epoch, if one is in flight.
    ///
    /// Caller holds `gp_lock`. Returns `false` only when `blocking` is off
    /// and readers of the previous epoch are still active.
    fn complete_in_flight(&self, blocking: bool) -> bool {
        let current = self.epoch.load(Ordering::SeqCst);
        if self.completed.load(Ordering::Acquire) >= current {
            return true;
        }
        let prev = ((current - 1) & 1) as usize;
        while self.readers[prev].load(Ordering::SeqCst) != 0 {
            if !blocking {
                return false;
            }
            core::hint::spin_loop();
        }
        self.completed.store(current, Ordering::Release);
        true
    }

    fn has_waiting_callbacks(&self) -> bool {
        let completed = self.completed.load(Ordering::Acquire);
        self.callbacks
            .lock()
            .iter()
            .any(|batch| batch.target_epoch > completed)
    }

    /// Run up to `MAX_CALLBACKS_PER_POLL` callbacks with target `<= done`.
    fn drain_callbacks(&self, done: u64) -> usize {
        let mut count = 0;
        while count < MAX_CALLBACKS_PER_POLL {
            let mut batch = {
                let mut queue = self.callbacks.lock();
                match queue.front() {
                    Some(front) if front.target_epoch <= done => queue.pop_front(),
                    _ => None,
                }
            };
            let Some(b) = batch.as_mut() else {
                break;
            };
            // Callbacks run outside the queue lock.
            while count < MAX_CALLBACKS_PER_POLL {
                match b.callbacks.pop_front() {
                    Some(cb) => {
                        cb();
                        count += 1;
                    }
                    None => break,
                }
            }
            if !b.callbacks.is_empty() {
                if let Some(rest) = batch.take() {
                    self.callbacks.lock().push_front(rest);
                }
            }
        }
        count
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RcuDomain {
    fn drop(&mut self) {
        // Nobody can hold a guard any more; everything queued is safe to run.
        let batches = core::mem::take(self.callbacks.get_mut());
        for batch in batches {
            for cb in batch.callbacks {
                cb();
            }
        }
    }
}

/// RAII read-side critical section of an [`RcuDomain`].
pub struct RcuReadGuard<'a> {
    domain: &'a RcuDomain,
    idx: usize,
}

impl RcuReadGuard<'_> {
    /// Returns `true` if this guard was taken on `domain`.
    #[inline]
    pub fn is_from(&self, domain: &RcuDomain) -> bool {
        core::ptr::eq(self.domain, domain)
    }
}

impl Drop for RcuReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.domain.read_unlock(self.idx);
    }
}

//! Read-copy-update domain
//!
//! Readers enter a critical section with [`RcuDomain::read_lock`] and never
//! block or spin. Writers publish a new version of the data, then either
//! wait for pre-existing readers with [`RcuDomain::synchronize`] or hand the
//! old version to [`RcuDomain::call_rcu`] for deferred reclamation.
//!
//! # Grace period detection
//!
//! Sleepable-RCU style: two reader counters and a phase index. A reader
//! increments the counter selected by the current phase. A grace period
//! flips the phase twice, each time waiting for the counter of the previous
//! phase to drain, so every reader that might have observed the old data
//! has left its critical section when `synchronize` returns.
//!
//! # Deferred callbacks
//!
//! Callbacks are tagged with the first grace period that starts after they
//! were queued and run by whichever `synchronize` completes it. They live in
//! a lock-free queue so readers and writers never contend on it.

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use klp_core::spinlock::SpinLock;

/// Deferred callback with the grace period it waits for
struct Callback {
    target_gp: u64,
    func: Box<dyn FnOnce() + Send>,
}

/// An RCU domain
pub struct RcuDomain {
    phase: AtomicUsize,
    readers: [AtomicUsize; 2],
    gp_lock: SpinLock<()>,
    gp_started: AtomicU64,
    gp_completed: AtomicU64,
    callbacks: SegQueue<Callback>,
}

impl RcuDomain {
    pub fn new() -> Self {
        RcuDomain {
            phase: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
            gp_lock: SpinLock::new(()),
            gp_started: AtomicU64::new(0),
            gp_completed: AtomicU64::new(0),
            callbacks: SegQueue::new(),
        }
    }

    /// Enter a read-side critical section
    ///
    /// Must not be held across [`synchronize`](Self::synchronize) on the
    /// same domain.
    #[inline]
    pub fn read_lock(&self) -> RcuReadGuard<'_> {
        let slot = self.phase.load(Ordering::SeqCst) & 1;
        self.readers[slot].fetch_add(1, Ordering::SeqCst);
        RcuReadGuard { domain: self, slot }
    }

    /// Wait for every reader that started before this call, then run the
    /// callbacks whose grace period has elapsed
    pub fn synchronize(&self) {
        {
            let _gp = self.gp_lock.lock();
            let gp = self.gp_started.fetch_add(1, Ordering::SeqCst) + 1;
            for _ in 0..2 {
                let old = self.phase.fetch_xor(1, Ordering::SeqCst) & 1;
                self.wait_for_readers(old);
            }
            self.gp_completed.store(gp, Ordering::SeqCst);
        }
        self.run_callbacks();
    }

    /// Run `f` once every reader that may hold a reference to data
    /// unpublished before this call has finished
    pub fn call_rcu<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let target_gp = self.gp_started.load(Ordering::SeqCst) + 1;
        self.callbacks.push(Callback {
            target_gp,
            func: Box::new(f),
        });
    }

    /// Run a grace period once `limit` callbacks are queued
    ///
    /// For writers that retire data but never wait for readers themselves.
    /// Must not be called inside a read-side critical section.
    pub fn reclaim(&self, limit: usize) -> bool {
        if self.callbacks.len() < limit {
            return false;
        }
        self.synchronize();
        true
    }

    /// Wait until every callback queued before this call has run
    pub fn barrier(&self) {
        self.synchronize();
        self.synchronize();
    }

    /// Number of queued callbacks
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Number of completed grace periods
    pub fn completed(&self) -> u64 {
        self.gp_completed.load(Ordering::SeqCst)
    }

    fn wait_for_readers(&self, slot: usize) {
        let mut spins = 0u32;
        while self.readers[slot].load(Ordering::SeqCst) != 0 {
            if spins < 64 {
                core::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn run_callbacks(&self) {
        let done = self.gp_completed.load(Ordering::SeqCst);
        for _ in 0..self.callbacks.len() {
            match self.callbacks.pop() {
                Some(cb) if cb.target_gp <= done => (cb.func)(),
                Some(cb) => self.callbacks.push(cb),
                None => break,
            }
        }
    }
}

impl Default for RcuDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RcuDomain {
    fn drop(&mut self) {
        // No reader can outlive the domain, everything queued is reclaimable.
        while let Some(cb) = self.callbacks.pop() {
            (cb.func)();
        }
    }
}

/// Read-side critical section, left on drop
pub struct RcuReadGuard<'a> {
    domain: &'a RcuDomain,
    slot: usize,
}

impl Drop for RcuReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.domain.readers[self.slot].fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pointer to a heap value retired by an [`RcuCell`] update
struct Retired<T>(*mut T);

// Safety: ownership of the allocation moves with the callback
unsafe impl<T: Send> Send for Retired<T> {}

impl<T> Retired<T> {
    fn free(self) {
        // Safety: produced by Box::into_raw and unpublished before retiring
        drop(unsafe { Box::from_raw(self.0) });
    }
}

/// RCU-published value
///
/// Readers borrow the current version for the lifetime of a read guard.
/// Writers replace the whole value; the old one is reclaimed after a grace
/// period. Concurrent writers must be serialized by the caller.
pub struct RcuCell<T: Send + Sync + 'static> {
    ptr: AtomicPtr<T>,
    domain: Arc<RcuDomain>,
}

impl<T: Send + Sync + 'static> RcuCell<T> {
    pub fn new(domain: &Arc<RcuDomain>, value: T) -> Self {
        RcuCell {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            domain: Arc::clone(domain),
        }
    }

    /// Current version, valid while `guard` is held
    #[inline]
    pub fn read<'a>(&'a self, guard: &'a RcuReadGuard<'_>) -> &'a T {
        debug_assert!(std::ptr::eq(guard.domain, &*self.domain));
        // Safety: the pointer is never null and reclamation waits for `guard`
        unsafe { &*self.ptr.load(Ordering::Acquire) }
    }

    /// Publish `value` and retire the previous version
    pub fn replace(&self, value: T) {
        let old = self.ptr.swap(Box::into_raw(Box::new(value)), Ordering::AcqRel);
        let old = Retired(old);
        self.domain.call_rcu(move || old.free());
    }

    /// Publish `f(current)`
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        let next = {
            let guard = self.domain.read_lock();
            f(self.read(&guard))
        };
        self.replace(next);
    }

    pub fn domain(&self) -> &Arc<RcuDomain> {
        &self.domain
    }
}

impl<T: Clone + Send + Sync + 'static> RcuCell<T> {
    /// Clone of the current version
    pub fn snapshot(&self) -> T {
        let guard = self.domain.read_lock();
        self.read(&guard).clone()
    }
}

impl<T: Send + Sync + 'static> Drop for RcuCell<T> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        // Safety: `&mut self` rules out outstanding `read` borrows
        drop(unsafe { Box::from_raw(ptr) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_synchronize_waits_for_reader() {
        let rcu = Arc::new(RcuDomain::new());
        let reader_done = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(AtomicBool::new(false));

        let handle = {
            let rcu = Arc::clone(&rcu);
            let reader_done = Arc::clone(&reader_done);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let guard = rcu.read_lock();
                entered.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                reader_done.store(true, Ordering::SeqCst);
                drop(guard);
            })
        };

        while !entered.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        rcu.synchronize();
        assert!(reader_done.load(Ordering::SeqCst));
        handle.join().unwrap();
    }

    #[test]
    fn test_call_rcu_deferred_until_grace_period() {
        let rcu = RcuDomain::new();
        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            rcu.call_rcu(move || ran.store(true, Ordering::SeqCst));
        }
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(rcu.pending_callbacks(), 1);
        rcu.synchronize();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(rcu.pending_callbacks(), 0);
        assert_eq!(rcu.completed(), 1);
    }

    #[test]
    fn test_replace_keeps_old_value_alive_for_reader() {
        let rcu = Arc::new(RcuDomain::new());
        let dropped = Arc::new(AtomicBool::new(false));
        let cell = RcuCell::new(&rcu, Tracked(Arc::clone(&dropped)));

        let guard = rcu.read_lock();
        let old = cell.read(&guard);
        cell.replace(Tracked(Arc::new(AtomicBool::new(false))));
        assert!(!old.0.load(Ordering::SeqCst));
        drop(guard);

        rcu.synchronize();
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_readers_never_see_freed_value() {
        let rcu = Arc::new(RcuDomain::new());
        let cell = Arc::new(RcuCell::new(&rcu, Tracked(Arc::new(AtomicBool::new(false)))));
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let rcu = Arc::clone(&rcu);
                let cell = Arc::clone(&cell);
                let stop = Arc::clone(&stop);
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let guard = rcu.read_lock();
                        let v = cell.read(&guard);
                        assert!(!v.0.load(Ordering::SeqCst));
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            cell.replace(Tracked(Arc::new(AtomicBool::new(false))));
            rcu.synchronize();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn test_reclaim_bounds_backlog() {
        let rcu = RcuDomain::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let ran = Arc::clone(&ran);
            rcu.call_rcu(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
            rcu.reclaim(16);
            assert!(rcu.pending_callbacks() < 16);
        }
        assert!(ran.load(Ordering::SeqCst) > 1000 - 16);
        assert!(!rcu.reclaim(16));
    }

    #[test]
    fn test_update_and_snapshot() {
        let rcu = Arc::new(RcuDomain::new());
        let cell = RcuCell::new(&rcu, vec![1u32]);
        cell.update(|v| {
            let mut v = v.clone();
            v.push(2);
            v
        });
        assert_eq!(cell.snapshot(), vec![1, 2]);
        rcu.barrier();
        assert_eq!(rcu.pending_callbacks(), 0);
    }
}

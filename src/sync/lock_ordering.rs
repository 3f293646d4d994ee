//! Lock Ordering Documentation and Assertions
//!
//! This module documents the lock ordering rules of the IPC core and
//! provides the per-CPU bookkeeping used to assert them in debug builds.
//!
//! # Lock Hierarchy
//!
//! Locks must be acquired in the following order (from outermost to innermost):
//!
//! 1. **Coarse kernel lock** - only in `LockMode::Coarse`, taken on kernel entry
//! 2. **Process locks** - a whole set at once through `ProcSet`, ascending slot index
//! 3. **Per-CPU run queue lock** - at most one at a time
//! 4. **Coordinator slot lock** - per destination CPU, held for a few stores
//! 5. **Timer list lock** - never held while calling into the IPC engine
//!
//! # Lock Ordering Rules
//!
//! ## Rule 1: One ProcSet per CPU
//! A CPU never acquires process locks while already holding some. Operations
//! that need a different set (receive scanning its sources, senda walking its
//! table, quantum expiry reaching the scheduler) drop their set first and
//! acquire the union again.
//!
//! ## Rule 2: Ascending Slot Order
//! Within a set, locks are taken by ascending slot index, so two CPUs locking
//! {a, b} and {b, a} serialize instead of deadlocking.
//!
//! ## Rule 3: Run Queue Locks are Leaves
//! No process lock is taken while a run queue lock is held, and at most one
//! run queue lock is held at a time. Migration never holds two queues; it
//! dequeues on the old CPU and enqueues on the new one.
//!
//! ## Rule 4: No IPC under the Timer Lock
//! Expired timers are collected under the timer lock and delivered after it
//! is released.
//!
//! ## Rule 5: Coordinator Requests Need No Lock on the Target Side
//! The initiator holds the target process's lock for the whole rendezvous.
//! The handler borrows it; see `proc_locked_borrow`.
//!
//! # Common Lock Patterns
//!
//! ## Pattern 1: Send
//! ```rust,ignore
//! let set = ProcSet::acquire(kernel, cpu, &[caller, dst]);
//! // ... deliver or queue ...
//! drop(set); // releases both
//! ```
//!
//! ## Pattern 2: Remote dequeue
//! ```rust,ignore
//! let set = ProcSet::acquire(kernel, cpu, &[p]);
//! // p.cpu != cpu: hand the dequeue to the owning CPU, keep p locked
//! smp::dequeue_task(kernel, cpu, p, owner);
//! drop(set);
//! ```

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Per-CPU record of the locks this CPU holds
pub struct LockTracker {
    proc_locks: AtomicUsize,
    runqueue_locks: AtomicUsize,
    timer_lock: AtomicBool,
}

impl LockTracker {
    pub const fn new() -> Self {
        LockTracker {
            proc_locks: AtomicUsize::new(0),
            runqueue_locks: AtomicUsize::new(0),
            timer_lock: AtomicBool::new(false),
        }
    }

    /// Number of process locks the CPU currently holds
    pub fn proc_locks_held(&self) -> usize {
        self.proc_locks.load(Ordering::Relaxed)
    }

    /// Assert Rule 1 and Rule 3 before a ProcSet is acquired
    #[inline]
    pub fn assert_may_lock_procs(&self) {
        debug_assert_eq!(
            self.proc_locks.load(Ordering::Relaxed),
            0,
            "process locks already held - violates lock ordering"
        );
        debug_assert_eq!(
            self.runqueue_locks.load(Ordering::Relaxed),
            0,
            "run queue lock held while locking processes - violates lock ordering"
        );
    }

    pub fn mark_procs_locked(&self, n: usize) {
        self.proc_locks.fetch_add(n, Ordering::Relaxed);
    }

    pub fn mark_procs_unlocked(&self, n: usize) {
        let before = self.proc_locks.fetch_sub(n, Ordering::Relaxed);
        debug_assert!(before >= n, "released more process locks than held");
    }

    pub fn mark_runqueue_locked(&self) {
        let before = self.runqueue_locks.fetch_add(1, Ordering::Relaxed);
        debug_assert_eq!(before, 0, "two run queue locks held - violates lock ordering");
    }

    pub fn mark_runqueue_unlocked(&self) {
        self.runqueue_locks.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn mark_timer_locked(&self) {
        self.timer_lock.store(true, Ordering::Relaxed);
    }

    pub fn mark_timer_unlocked(&self) {
        self.timer_lock.store(false, Ordering::Relaxed);
    }

    /// Assert Rule 4 on entry to the IPC engine
    #[inline]
    pub fn assert_no_timer_lock(&self) {
        debug_assert!(
            !self.timer_lock.load(Ordering::Relaxed),
            "timer lock held while entering IPC - violates lock ordering"
        );
    }
}

impl Default for LockTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Assert that slot indices are strictly ascending
///
/// ProcSet sorts and deduplicates before locking; this catches a caller that
/// bypassed it.
#[inline]
pub fn assert_slot_order(slots: &[usize]) {
    debug_assert!(
        slots.windows(2).all(|w| w[0] < w[1]),
        "process locks must be taken in ascending slot order: {:?}",
        slots
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_balance() {
        let t = LockTracker::new();
        t.assert_may_lock_procs();
        t.mark_procs_locked(2);
        assert_eq!(t.proc_locks_held(), 2);
        t.mark_procs_unlocked(2);
        t.assert_may_lock_procs();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "ascending slot order")]
    fn test_slot_order_violation() {
        assert_slot_order(&[4, 2]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "process locks already held")]
    fn test_nested_sets_rejected() {
        let t = LockTracker::new();
        t.mark_procs_locked(1);
        t.assert_may_lock_procs();
    }
}

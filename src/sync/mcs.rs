//! MCS queue lock
//!
//! Every CPU brings its own queue node. A waiter links itself behind the
//! current tail and spins on a flag in its own node, so contended waiting
//! touches one cache line per CPU instead of the shared lock word.
//!
//! # Safety contract
//!
//! A node must stay at a fixed address and must not be used for a second
//! acquisition (of any lock) until the acquisition it was passed to has
//! been released. `McsLocks` in the strategy module satisfies this by
//! giving every (cpu, lock) pair its own node in a boxed slice.

use super::strategy::Relax;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Per-CPU queue node
#[repr(align(64))]
pub struct McsNode {
    next: AtomicPtr<McsNode>,
    must_wait: AtomicBool,
}

impl McsNode {
    pub const fn new() -> Self {
        McsNode {
            next: AtomicPtr::new(ptr::null_mut()),
            must_wait: AtomicBool::new(false),
        }
    }
}

impl Default for McsNode {
    fn default() -> Self {
        Self::new()
    }
}

pub struct McsLock {
    tail: AtomicPtr<McsNode>,
}

impl McsLock {
    pub const fn new() -> Self {
        McsLock {
            tail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// # Safety
    /// See the module level contract for `node`.
    pub unsafe fn lock(&self, node: &McsNode, relax: &dyn Relax) {
        let me = node as *const McsNode as *mut McsNode;
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        // Armed before we become visible to the predecessor
        node.must_wait.store(true, Ordering::Relaxed);

        let pred = self.tail.swap(me, Ordering::AcqRel);
        if pred.is_null() {
            node.must_wait.store(false, Ordering::Relaxed);
            return;
        }

        // SAFETY: pred is the node of a CPU that has not yet released, and
        // nodes outlive their acquisitions.
        (*pred).next.store(me, Ordering::Release);

        while node.must_wait.load(Ordering::Acquire) {
            core::hint::spin_loop();
            relax.relax();
        }
    }

    /// # Safety
    /// See the module level contract for `node`.
    pub unsafe fn try_lock(&self, node: &McsNode) -> bool {
        let me = node as *const McsNode as *mut McsNode;
        node.next.store(ptr::null_mut(), Ordering::Relaxed);
        node.must_wait.store(false, Ordering::Relaxed);
        self.tail
            .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// # Safety
    /// `node` must be the node passed to the matching `lock`/`try_lock`.
    pub unsafe fn unlock(&self, node: &McsNode) {
        let me = node as *const McsNode as *mut McsNode;
        let mut succ = node.next.load(Ordering::Acquire);

        if succ.is_null() {
            if self
                .tail
                .compare_exchange(me, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // A successor swapped itself in but has not linked yet
            loop {
                succ = node.next.load(Ordering::Acquire);
                if !succ.is_null() {
                    break;
                }
                core::hint::spin_loop();
            }
        }

        // SAFETY: succ is spinning on its own node, which stays valid until
        // it has been handed the lock.
        (*succ).must_wait.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        !self.tail.load(Ordering::Relaxed).is_null()
    }
}

impl Default for McsLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::strategy::SpinRelax;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uncontended() {
        let lock = McsLock::new();
        let node = McsNode::new();
        unsafe {
            lock.lock(&node, &SpinRelax);
            assert!(lock.is_locked());
            lock.unlock(&node);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = McsLock::new();
        let a = McsNode::new();
        let b = McsNode::new();
        unsafe {
            assert!(lock.try_lock(&a));
            assert!(!lock.try_lock(&b));
            lock.unlock(&a);
            assert!(lock.try_lock(&b));
            lock.unlock(&b);
        }
    }

    struct Shared {
        lock: McsLock,
        nodes: Vec<McsNode>,
        inside: AtomicUsize,
        total: AtomicUsize,
    }

    #[test]
    fn test_hand_off_between_threads() {
        let shared = Arc::new(Shared {
            lock: McsLock::new(),
            nodes: (0..4).map(|_| McsNode::new()).collect(),
            inside: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        });
        let handles: Vec<_> = (0..4)
            .map(|cpu| {
                let shared = shared.clone();
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        unsafe { shared.lock.lock(&shared.nodes[cpu], &SpinRelax) };
                        assert_eq!(shared.inside.fetch_add(1, Ordering::SeqCst), 0);
                        shared.total.fetch_add(1, Ordering::Relaxed);
                        shared.inside.fetch_sub(1, Ordering::SeqCst);
                        unsafe { shared.lock.unlock(&shared.nodes[cpu]) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.total.load(Ordering::Relaxed), 8_000);
        assert!(!shared.lock.is_locked());
    }
}

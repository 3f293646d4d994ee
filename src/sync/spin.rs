//! Test-and-test-and-set spinlocks
//!
//! `RawSpinLock` is the bare lock word used by the spinlock strategy.
//! `SpinLock<T>` wraps data with a guard, like the run queues and the
//! coordinator slots use it.

use super::strategy::Relax;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

const MAX_BACKOFF: usize = 256;

/// A single lock word with exponential backoff
#[repr(align(64))]
pub struct RawSpinLock {
    locked: AtomicBool,
}

impl RawSpinLock {
    pub const fn new() -> Self {
        RawSpinLock {
            locked: AtomicBool::new(false),
        }
    }

    /// Spin until the lock is ours
    ///
    /// Waiters only read the word until it looks free, so contended
    /// waiting stays in the local cache. `relax` runs once per failed
    /// round.
    pub fn lock(&self, relax: &dyn Relax) {
        let mut backoff = 1;

        loop {
            if self.try_lock() {
                return;
            }

            while self.locked.load(Ordering::Relaxed) {
                for _ in 0..backoff {
                    core::hint::spin_loop();
                }
                relax.relax();

                // Exponential backoff: double the wait time up to MAX_BACKOFF
                if backoff < MAX_BACKOFF {
                    backoff *= 2;
                }
            }
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutual exclusion primitive useful for protecting shared data
///
/// The lock is automatically released when the guard goes out of scope.
/// Acquisition never services coordinator requests, so it is the right
/// lock for data that a request handler itself touches (run queues, the
/// coordinator slot).
///
/// # Examples
///
/// ```
/// use mellos_ipc_core::sync::SpinLock;
///
/// let lock = SpinLock::new(5);
/// {
///     let mut data = lock.lock();
///     *data += 1;
/// } // lock is released here
/// assert_eq!(*lock.lock(), 6);
/// ```
pub struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

/// A guard that provides mutable access to the data protected by a SpinLock
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new spinlock wrapping the supplied data
    pub const fn new(data: T) -> Self {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning until it is available
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock(&super::strategy::SpinRelax);
        SpinLockGuard { lock: self }
    }

    /// Attempts to acquire the lock without blocking
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Consumes the lock and returns the underlying data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "SpinLock {{ data: {:?} }}", &*guard),
            None => write!(f, "SpinLock {{ <locked> }}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = SpinLock::new(0u32);
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_counter_under_contention() {
        let lock = Arc::new(SpinLock::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}

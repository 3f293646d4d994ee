//! Ticket lock
//!
//! Two counters: a CPU takes the next ticket and waits until the lock
//! serves it. Hand-off is strictly FIFO. The counters are 64 bits wide so
//! they cannot wrap within the lifetime of the system.

use super::strategy::Relax;
use core::sync::atomic::{AtomicU64, Ordering};

#[repr(align(64))]
pub struct TicketLock {
    next_ticket: AtomicU64,
    now_serving: AtomicU64,
}

impl TicketLock {
    pub const fn new() -> Self {
        TicketLock {
            next_ticket: AtomicU64::new(0),
            now_serving: AtomicU64::new(0),
        }
    }

    pub fn lock(&self, relax: &dyn Relax) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.now_serving.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
            relax.relax();
        }
    }

    /// Take the lock only if nobody holds or waits for it
    pub fn try_lock(&self) -> bool {
        let serving = self.now_serving.load(Ordering::Relaxed);
        self.next_ticket
            .compare_exchange(serving, serving + 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn unlock(&self) {
        // Only the holder writes now_serving
        let serving = self.now_serving.load(Ordering::Relaxed);
        debug_assert!(
            serving < self.next_ticket.load(Ordering::Relaxed),
            "ticket lock released while not held"
        );
        self.now_serving.store(serving + 1, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.now_serving.load(Ordering::Relaxed) != self.next_ticket.load(Ordering::Relaxed)
    }

    /// CPUs waiting behind the current holder
    pub fn waiters(&self) -> u64 {
        let next = self.next_ticket.load(Ordering::Relaxed);
        let serving = self.now_serving.load(Ordering::Relaxed);
        next.saturating_sub(serving).saturating_sub(1)
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new()
    }
}

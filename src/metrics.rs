//! Kernel metrics collection module
//! Tracks IPC, scheduling and coordination statistics using atomic counters
//! for SMP safety. Every booted kernel owns one instance.

use core::sync::atomic::{AtomicU64, Ordering};

/// IPC and scheduling counters
pub struct KernelMetrics {
    /// Messages delivered or queued by send, sendrec and sendnb
    pub sends: AtomicU64,

    /// Receive calls that completed with a message
    pub receives: AtomicU64,

    /// Notify calls
    pub notifies: AtomicU64,

    /// Notifications that only set a pending bit
    pub notifies_coalesced: AtomicU64,

    /// Async table entries delivered to a receiver
    pub async_deliveries: AtomicU64,

    /// Operations refused with a deadlock error
    pub deadlocks: AtomicU64,

    /// Receive attempts restarted because a message arrived meanwhile
    pub receive_retries: AtomicU64,

    /// Processes switched to on any CPU
    pub context_switches: AtomicU64,

    /// Reschedule IPIs raised
    pub ipis: AtomicU64,

    /// Synchronous coordinator requests completed
    pub smp_requests: AtomicU64,

    /// Processes moved to another CPU
    pub migrations: AtomicU64,

    /// Kernel timers that fired
    pub timer_expiries: AtomicU64,
}

/// Point-in-time copy of `KernelMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sends: u64,
    pub receives: u64,
    pub notifies: u64,
    pub notifies_coalesced: u64,
    pub async_deliveries: u64,
    pub deadlocks: u64,
    pub receive_retries: u64,
    pub context_switches: u64,
    pub ipis: u64,
    pub smp_requests: u64,
    pub migrations: u64,
    pub timer_expiries: u64,
}

impl KernelMetrics {
    /// Create a new KernelMetrics instance with all counters at zero
    pub const fn new() -> Self {
        Self {
            sends: AtomicU64::new(0),
            receives: AtomicU64::new(0),
            notifies: AtomicU64::new(0),
            notifies_coalesced: AtomicU64::new(0),
            async_deliveries: AtomicU64::new(0),
            deadlocks: AtomicU64::new(0),
            receive_retries: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            ipis: AtomicU64::new(0),
            smp_requests: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            timer_expiries: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_sends(&self) {
        self.sends.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_receives(&self) {
        self.receives.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_notifies(&self) {
        self.notifies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_notifies_coalesced(&self) {
        self.notifies_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_async_deliveries(&self) {
        self.async_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_deadlocks(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_receive_retries(&self) {
        self.receive_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_context_switches(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_ipis(&self) {
        self.ipis.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_smp_requests(&self) {
        self.smp_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_migrations(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_timer_expiries(&self, n: u64) {
        self.timer_expiries.fetch_add(n, Ordering::Relaxed);
    }

    /// Read every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends: self.sends.load(Ordering::Relaxed),
            receives: self.receives.load(Ordering::Relaxed),
            notifies: self.notifies.load(Ordering::Relaxed),
            notifies_coalesced: self.notifies_coalesced.load(Ordering::Relaxed),
            async_deliveries: self.async_deliveries.load(Ordering::Relaxed),
            deadlocks: self.deadlocks.load(Ordering::Relaxed),
            receive_retries: self.receive_retries.load(Ordering::Relaxed),
            context_switches: self.context_switches.load(Ordering::Relaxed),
            ipis: self.ipis.load(Ordering::Relaxed),
            smp_requests: self.smp_requests.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            timer_expiries: self.timer_expiries.load(Ordering::Relaxed),
        }
    }
}

impl Default for KernelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

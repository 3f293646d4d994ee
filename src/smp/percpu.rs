//! Per-CPU data structures
//!
//! Each CPU owns one `PerCpu`. Fields another CPU may touch are atomics or
//! locks; the rest is only written by the owner. The structure is
//! cache-line aligned to prevent false sharing between cores.

use crate::proc::ProcNr;
use crate::sched::RunQueue;
use crate::sync::lock_ordering::LockTracker;
use crate::sync::{RawSpinLock, SpinLock};
use bitflags::bitflags;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

const NO_PROC: usize = usize::MAX;

bitflags! {
    /// Work a coordinator request asks the destination CPU to do
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedRequest: u32 {
        const STOP = 1;
        const VM_INHIBIT = 2;
        const SAVE_CTX = 4;
        const DEQUEUE = 8;
        const MIGRATE = 16;
    }
}

bitflags! {
    /// Inter-processor interrupts a CPU has pending
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpiKind: u32 {
        /// A coordinator request waits in the slot
        const SCHED = 1;
        /// Work was queued; reschedule at the next opportunity
        const RESCHEDULE = 2;
    }
}

/// Coordinator mailbox of one destination CPU
///
/// `flags` is nonzero while a request is outstanding. Writers take `lock`
/// to claim the slot; the destination clears `flags` when done.
pub struct IpiSlot {
    pub(crate) lock: RawSpinLock,
    pub(crate) flags: AtomicU32,
    pub(crate) target: AtomicUsize,
}

impl IpiSlot {
    const fn new() -> Self {
        IpiSlot {
            lock: RawSpinLock::new(),
            flags: AtomicU32::new(0),
            target: AtomicUsize::new(NO_PROC),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.flags.load(Ordering::Acquire) != 0
    }
}

fn encode(nr: Option<ProcNr>) -> usize {
    nr.unwrap_or(NO_PROC)
}

fn decode(v: usize) -> Option<ProcNr> {
    (v != NO_PROC).then_some(v)
}

/// Per-CPU data structure
#[repr(C, align(64))]
pub struct PerCpu {
    /// Logical CPU ID
    pub id: usize,

    /// Ready queues of this CPU
    pub run_queue: SpinLock<RunQueue>,

    /// Locks held by this CPU, for ordering assertions
    pub locks: LockTracker,

    pub(crate) ipi: IpiSlot,
    pending_ipis: AtomicU32,

    /// Process currently running (None if idle)
    current: AtomicUsize,
    /// Process billed for system time
    bill: AtomicUsize,
    /// Process whose state is live in this CPU's FPU
    fpu_owner: AtomicUsize,
    idle: AtomicBool,

    n_receive: AtomicU64,
    n_receive_any: AtomicU64,
    n_remote_enqueue: AtomicU64,
    busy_ticks: AtomicU64,
    idle_ticks: AtomicU64,

    /// busy/idle totals at the previous `cpu_load` query
    load_busy_seen: AtomicU64,
    load_idle_seen: AtomicU64,
}

impl PerCpu {
    pub fn new(id: usize, nprocs: usize) -> Self {
        PerCpu {
            id,
            run_queue: SpinLock::new(RunQueue::new(nprocs)),
            locks: LockTracker::new(),
            ipi: IpiSlot::new(),
            pending_ipis: AtomicU32::new(0),
            current: AtomicUsize::new(NO_PROC),
            bill: AtomicUsize::new(NO_PROC),
            fpu_owner: AtomicUsize::new(NO_PROC),
            idle: AtomicBool::new(true),
            n_receive: AtomicU64::new(0),
            n_receive_any: AtomicU64::new(0),
            n_remote_enqueue: AtomicU64::new(0),
            busy_ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            load_busy_seen: AtomicU64::new(0),
            load_idle_seen: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn current(&self) -> Option<ProcNr> {
        decode(self.current.load(Ordering::Acquire))
    }

    pub(crate) fn set_current(&self, nr: Option<ProcNr>) {
        self.current.store(encode(nr), Ordering::Release);
    }

    #[inline]
    pub fn bill(&self) -> Option<ProcNr> {
        decode(self.bill.load(Ordering::Acquire))
    }

    pub(crate) fn set_bill(&self, nr: Option<ProcNr>) {
        self.bill.store(encode(nr), Ordering::Release);
    }

    pub fn fpu_owner(&self) -> Option<ProcNr> {
        decode(self.fpu_owner.load(Ordering::Acquire))
    }

    pub(crate) fn set_fpu_owner(&self, nr: Option<ProcNr>) {
        self.fpu_owner.store(encode(nr), Ordering::Release);
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    pub(crate) fn raise_ipi(&self, kind: IpiKind) {
        self.pending_ipis.fetch_or(kind.bits(), Ordering::AcqRel);
    }

    pub(crate) fn take_ipis(&self) -> IpiKind {
        IpiKind::from_bits_retain(self.pending_ipis.swap(0, Ordering::AcqRel))
    }

    pub fn pending_ipis(&self) -> IpiKind {
        IpiKind::from_bits_retain(self.pending_ipis.load(Ordering::Acquire))
    }

    pub(crate) fn count_receive(&self, any: bool) {
        self.n_receive.fetch_add(1, Ordering::Relaxed);
        if any {
            self.n_receive_any.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_remote_enqueue(&self) {
        self.n_remote_enqueue.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_tick(&self, busy: bool) {
        let counter = if busy { &self.busy_ticks } else { &self.idle_ticks };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Busy percentage since the previous query
    pub fn cpu_load(&self) -> u32 {
        let busy = self.busy_ticks.load(Ordering::Relaxed);
        let idle = self.idle_ticks.load(Ordering::Relaxed);
        let busy_delta = busy - self.load_busy_seen.swap(busy, Ordering::Relaxed);
        let idle_delta = idle - self.load_idle_seen.swap(idle, Ordering::Relaxed);
        let total = busy_delta + idle_delta;
        if total == 0 {
            return 0;
        }
        (busy_delta * 100 / total) as u32
    }

    pub fn stats(&self) -> CpuStats {
        CpuStats {
            receives: self.n_receive.load(Ordering::Relaxed),
            receives_any: self.n_receive_any.load(Ordering::Relaxed),
            remote_enqueues: self.n_remote_enqueue.load(Ordering::Relaxed),
            busy_ticks: self.busy_ticks.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Per-CPU counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    pub receives: u64,
    pub receives_any: u64,
    /// Processes other CPUs appended to this CPU's queues
    pub remote_enqueues: u64,
    pub busy_ticks: u64,
    pub idle_ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_round_trip() {
        let pc = PerCpu::new(1, 8);
        assert_eq!(pc.current(), None);
        pc.set_current(Some(5));
        assert_eq!(pc.current(), Some(5));
        pc.set_current(None);
        assert_eq!(pc.current(), None);
    }

    #[test]
    fn test_ipis_accumulate_until_taken() {
        let pc = PerCpu::new(0, 8);
        pc.raise_ipi(IpiKind::RESCHEDULE);
        pc.raise_ipi(IpiKind::SCHED);
        assert_eq!(pc.take_ipis(), IpiKind::SCHED | IpiKind::RESCHEDULE);
        assert!(pc.take_ipis().is_empty());
    }

    #[test]
    fn test_cpu_load_since_last_query() {
        let pc = PerCpu::new(0, 8);
        assert_eq!(pc.cpu_load(), 0);
        for _ in 0..3 {
            pc.count_tick(true);
        }
        pc.count_tick(false);
        assert_eq!(pc.cpu_load(), 75);
        pc.count_tick(false);
        assert_eq!(pc.cpu_load(), 0);
    }

    #[test]
    fn test_receive_counters() {
        let pc = PerCpu::new(0, 8);
        pc.count_receive(true);
        pc.count_receive(false);
        let stats = pc.stats();
        assert_eq!(stats.receives, 2);
        assert_eq!(stats.receives_any, 1);
    }
}

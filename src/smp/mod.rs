//! SMP Coordinator
//!
//! Some changes to a process can only be made by the CPU it belongs to:
//! taking it off that CPU's run queue, stopping it while it may be running
//! there, or moving it elsewhere. The initiating CPU holds the process's
//! lock, posts a request in the destination's `IpiSlot`, raises a SCHED IPI
//! and waits until the destination has carried the request out.
//!
//! # Protocol
//!
//! ```text
//!  initiator (holds p's lock)            destination
//!  ─────────────────────────             ───────────
//!  wait slot.flags == 0
//!  lock slot, recheck, write {p, flags}
//!  raise SCHED ─────────────────────────► service_ipis()
//!                                           read {p, flags} under slot lock
//!                                           act on p (borrowed lock)
//!  poll slot.flags ◄─────────────────────── clear flags under slot lock
//! ```
//!
//! While polling, the initiator services its own slot. Two CPUs posting
//! requests to each other therefore both make progress.

pub mod percpu;

pub use percpu::{CpuStats, IpiKind, IpiSlot, PerCpu, SchedRequest};

use crate::kernel::Kernel;
use crate::proc::lock::{proc_locked, proc_locked_borrow};
use crate::proc::{ProcNr, ProcSet, RtsFlags};
use crate::sched::{dequeue, rts_set, rts_set_borrowed, rts_unset_borrowed};
use crate::sync::{Relax, SpinRelax};
use core::sync::atomic::Ordering;

/// Relax hook that keeps servicing coordinator requests aimed at `cpu`
pub struct IpiRelax<'k> {
    kernel: &'k Kernel,
    cpu: usize,
}

impl<'k> IpiRelax<'k> {
    pub fn new(kernel: &'k Kernel, cpu: usize) -> Self {
        IpiRelax { kernel, cpu }
    }
}

impl Relax for IpiRelax<'_> {
    #[inline]
    fn relax(&self) {
        core::hint::spin_loop();
        service_sched(self.kernel, self.cpu);
    }
}

/// Post `task` for `nr` to `target_cpu` and wait until it is done
fn schedule_sync(k: &Kernel, me: usize, target_cpu: usize, nr: ProcNr, task: SchedRequest) {
    assert_ne!(target_cpu, me, "coordinator request to self");
    debug_assert!(proc_locked(k, me, nr), "coordinator request without the proc lock");

    let slot = &k.percpu(target_cpu).ipi;
    let relax = IpiRelax::new(k, me);

    // Another CPU may be using the slot; wait our turn
    loop {
        while slot.is_busy() {
            relax.relax();
        }
        slot.lock.lock(&SpinRelax);
        if slot.flags.load(Ordering::Relaxed) == 0 {
            slot.target.store(nr, Ordering::Relaxed);
            slot.flags.store(task.bits(), Ordering::Release);
            slot.lock.unlock();
            break;
        }
        slot.lock.unlock();
    }

    k.percpu(target_cpu).raise_ipi(IpiKind::SCHED);
    k.metrics().inc_ipis();

    let limit = k.config().ipi_spin_limit;
    let mut spins: u64 = 0;
    while slot.is_busy() {
        spins += 1;
        if spins > limit {
            panic!("cpu {} never acknowledged {:?} for proc {}", target_cpu, task, nr);
        }
        relax.relax();
    }

    k.metrics().inc_smp_requests();
    crate::log_trace!(cpu = me; "smp", "cpu {} did {:?} for proc {}", target_cpu, task, nr);
}

/// Carry out the request in `me`'s slot, if any
fn service_sched(k: &Kernel, me: usize) {
    let slot = &k.percpu(me).ipi;
    if !slot.is_busy() {
        return;
    }

    slot.lock.lock(&SpinRelax);
    let flags = SchedRequest::from_bits_retain(slot.flags.load(Ordering::Acquire));
    let nr = slot.target.load(Ordering::Relaxed);
    slot.lock.unlock();
    if flags.is_empty() {
        return;
    }

    // The initiator must always hold the lock of the process
    assert!(proc_locked_borrow(k, me, nr), "coordinator request for unlocked proc {}", nr);
    let pc = k.percpu(me);
    // SAFETY: the initiator holds the lock and waits until the flags clear
    let p = unsafe { k.procs().slot(nr).proc_mut() };

    if flags.contains(SchedRequest::STOP) {
        rts_set_borrowed(k, me, p, RtsFlags::PROC_STOP);
    }
    if flags.contains(SchedRequest::SAVE_CTX) && p.used_fpu && pc.fpu_owner() == Some(nr) {
        // Everything but the FPU is saved on kernel entry already
        pc.set_fpu_owner(None);
    }
    if flags.contains(SchedRequest::VM_INHIBIT) {
        rts_set_borrowed(k, me, p, RtsFlags::VMINHIBIT);
    }
    if flags.contains(SchedRequest::DEQUEUE) {
        assert_eq!(p.cpu, me);
        if p.enqueued {
            dequeue(k, me, p);
        }
    }
    if flags.contains(SchedRequest::MIGRATE) {
        assert_eq!(p.cpu, me);
        assert!(p.next_cpu.is_some_and(|dest| dest != me), "bad migration target for {:?}", p.endpoint);
        rts_set_borrowed(k, me, p, RtsFlags::PROC_MIGR);
        if pc.current() != Some(nr) {
            // Not running here, so it can move right away
            if let Some(dest) = p.next_cpu.take() {
                p.cpu = dest;
            }
            rts_unset_borrowed(k, me, p, RtsFlags::PROC_MIGR);
            k.metrics().inc_migrations();
        }
        // Otherwise the next reschedule point completes the move
    }

    slot.lock.lock(&SpinRelax);
    slot.flags.store(0, Ordering::Release);
    slot.lock.unlock();
}

/// Handle the IPIs pending on `me`
pub fn service_ipis(k: &Kernel, me: usize) {
    let kinds = k.percpu(me).take_ipis();
    // The slot is checked regardless: a relaxing spinner may have cleared
    // the SCHED bit's work already, or not seen the bit yet
    service_sched(k, me);
    if kinds.contains(IpiKind::RESCHEDULE) {
        crate::log_trace!(cpu = me; "smp", "reschedule requested");
    }
}

/// Wake `cpu` so it picks up newly queued work
pub fn schedule(k: &Kernel, cpu: usize) {
    k.percpu(cpu).raise_ipi(IpiKind::RESCHEDULE);
    k.metrics().inc_ipis();
}

/// Take a process off the run queue of `cpu`, which owns it
pub(crate) fn dequeue_task(k: &Kernel, me: usize, nr: ProcNr, cpu: usize) {
    schedule_sync(k, me, cpu, nr, SchedRequest::DEQUEUE);
}

fn remote_cpu(set: &ProcSet, nr: ProcNr) -> Option<usize> {
    let p = set.get(nr);
    (p.cpu != set.cpu() && p.is_runnable()).then_some(p.cpu)
}

/// Stop a locked process wherever it runs
pub(crate) fn stop_proc(set: &mut ProcSet, nr: ProcNr) {
    match remote_cpu(set, nr) {
        Some(cpu) => schedule_sync(set.kernel(), set.cpu(), cpu, nr, SchedRequest::STOP),
        None => rts_set(set, nr, RtsFlags::PROC_STOP),
    }
    assert!(set.get(nr).rts.contains(RtsFlags::PROC_STOP));
}

/// Keep a locked process from running while its memory is being changed
pub(crate) fn vminhibit(set: &mut ProcSet, nr: ProcNr) {
    match remote_cpu(set, nr) {
        Some(cpu) => schedule_sync(set.kernel(), set.cpu(), cpu, nr, SchedRequest::VM_INHIBIT),
        None => rts_set(set, nr, RtsFlags::VMINHIBIT),
    }
    assert!(set.get(nr).rts.contains(RtsFlags::VMINHIBIT));
}

/// Stop a locked process and make its owning CPU give up its FPU state
pub(crate) fn stop_proc_save_ctx(set: &mut ProcSet, nr: ProcNr) {
    let k = set.kernel();
    let me = set.cpu();
    let cpu = set.get(nr).cpu;
    if cpu == me {
        rts_set(set, nr, RtsFlags::PROC_STOP);
        let pc = k.percpu(me);
        if set.get(nr).used_fpu && pc.fpu_owner() == Some(nr) {
            pc.set_fpu_owner(None);
        }
    } else {
        schedule_sync(k, me, cpu, nr, SchedRequest::STOP | SchedRequest::SAVE_CTX);
    }
    assert!(set.get(nr).rts.contains(RtsFlags::PROC_STOP));
}

/// Move a locked process owned by another CPU to `dest`
///
/// Completes immediately unless the process is running on its CPU, in
/// which case it carries PROC_MIGR until that CPU next reschedules.
pub(crate) fn migrate_proc(set: &mut ProcSet, nr: ProcNr, dest: usize) {
    let k = set.kernel();
    let me = set.cpu();
    let p = set.get_mut(nr);
    assert!(!p.rts.contains(RtsFlags::PROC_MIGR), "{:?} already migrating", p.endpoint);
    assert_ne!(p.cpu, me);
    assert_ne!(p.cpu, dest);
    let cpu = p.cpu;
    p.next_cpu = Some(dest);

    schedule_sync(k, me, cpu, nr, SchedRequest::MIGRATE | SchedRequest::SAVE_CTX);

    let p = set.get(nr);
    assert!(p.rts.contains(RtsFlags::PROC_MIGR) || p.cpu == dest);
}

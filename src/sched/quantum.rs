//! Quantum expiry and scheduling policy calls
//!
//! A process whose quantum runs out is either renewed by the kernel or,
//! when it has a user-space scheduler, parked with NO_QUANTUM and reported
//! to that scheduler in a message. The scheduler answers with
//! `do_schedule`, which sets new parameters and makes the process runnable
//! again.

use super::{rts_set, rts_unset};
use crate::config::NR_SCHED_QUEUES;
use crate::ipc::engine::send;
use crate::ipc::{NoQuantumReport, Payload, SendFlags};
use crate::proc::{Endpoint, MiscFlags, PrivFlags, ProcNr, ProcSet, RtsFlags};
use crate::smp;
use core::fmt;

/// Errors from the scheduling calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Priority is neither -1 nor a queue index
    InvalidPriority,
    /// Quantum is neither -1 nor positive
    InvalidQuantum,
    /// CPU is neither -1 nor a booted CPU
    InvalidCpu,
    /// Flags other than the kernel-scheduling flag
    InvalidFlags,
    /// Endpoint does not name a live process
    DeadProcess,
    /// Caller is not the process's scheduler
    NotPermitted,
    /// No free process slot
    NoFreeSlot,
    /// Process spec names a priority, quantum or CPU out of range
    InvalidSpec,
    /// A move to another CPU is still pending; retry once it completes
    MigrationPending,
}

impl SchedError {
    pub fn errno(&self) -> i32 {
        use crate::ipc::errno;
        match self {
            SchedError::NotPermitted => errno::EPERM,
            SchedError::NoFreeSlot | SchedError::MigrationPending => errno::EAGAIN,
            SchedError::InvalidCpu => errno::EBADCPU,
            _ => errno::EINVAL,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self {
            SchedError::InvalidPriority => "invalid priority",
            SchedError::InvalidQuantum => "invalid quantum",
            SchedError::InvalidCpu => "invalid cpu",
            SchedError::InvalidFlags => "invalid flags",
            SchedError::DeadProcess => "no such process",
            SchedError::NotPermitted => "not the process's scheduler",
            SchedError::NoFreeSlot => "process table full",
            SchedError::InvalidSpec => "invalid process parameters",
            SchedError::MigrationPending => "migration pending",
        };
        f.write_str(what)
    }
}

pub type SchedResult<T> = Result<T, SchedError>;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SchedCtlFlags: u32 {
        /// Hand scheduling of the process to the kernel
        const KERNEL = 1;
    }
}

/// Handle quantum expiry of `nr`, which is locked alone
///
/// On return the set holds {nr} again.
pub(crate) fn proc_no_time(set: &mut ProcSet, nr: ProcNr) {
    let p = set.get(nr);
    let user_scheduled = p.privilege.flags.contains(PrivFlags::PREEMPTIBLE);
    let scheduler = p.scheduler;
    match scheduler {
        Some(sched_e) if user_scheduled => {
            set.relock(&[nr, sched_e.slot()]);
            let p = set.get(nr);
            // Re-check: the process may have been rescheduled while unlocked
            if p.is_runnable() && p.cpu_time_left == 0 && p.scheduler == Some(sched_e) {
                notify_scheduler(set, nr, sched_e);
            }
            set.relock(&[nr]);
        }
        _ => renew_quantum(set, nr),
    }
}

/// Refill the quantum and move the process to the back of its queue
fn renew_quantum(set: &mut ProcSet, nr: ProcNr) {
    let p = set.get_mut(nr);
    p.cpu_time_left = p.quantum_size;
    if p.is_runnable() {
        rts_set(set, nr, RtsFlags::PREEMPTED);
        rts_unset(set, nr, RtsFlags::PREEMPTED);
    }
}

/// Park `nr` and tell its scheduler; the set holds {nr, scheduler}
fn notify_scheduler(set: &mut ProcSet, nr: ProcNr, sched_e: Endpoint) {
    let k = set.kernel();
    let me = set.cpu();
    rts_set(set, nr, RtsFlags::NO_QUANTUM);

    let hz = u64::from(k.config().hz);
    let load = k.cpu_load(me);
    let p = set.get_mut(nr);
    let report = NoQuantumReport {
        time_in_queue_ms: p.acct.time_in_queue * 1000 / hz,
        dequeues: p.acct.dequeues as u32,
        ipc_sync: p.acct.ipc_sync as u32,
        ipc_async: p.acct.ipc_async as u32,
        preempted: p.acct.preempted as u32,
        cpu: me as u32,
        cpu_load: load,
    };
    p.acct.reset();
    let msg = report.encode(p.endpoint);

    if let Err(e) = send(set, nr, sched_e, Payload::Kernel(msg), SendFlags::FROM_KERNEL) {
        // Without a scheduler to answer, the process would never run again
        crate::log_error!(cpu = me; "sched", "no-quantum report for {} to {} failed: {}", set.get(nr).endpoint, sched_e, e);
        let p = set.get_mut(nr);
        p.cpu_time_left = p.quantum_size;
        rts_unset(set, nr, RtsFlags::NO_QUANTUM);
    }
}

/// Apply scheduling parameters to a locked process
///
/// -1 leaves a parameter unchanged. `quantum` is in ticks.
pub(crate) fn sched_proc(set: &mut ProcSet, nr: ProcNr, priority: i32, quantum: i64, cpu: i32, niced: bool) -> SchedResult<()> {
    let k = set.kernel();
    let me = set.cpu();

    if priority != -1 && !(0..NR_SCHED_QUEUES as i32).contains(&priority) {
        return Err(SchedError::InvalidPriority);
    }
    if quantum != -1 && !(1..=i64::from(u32::MAX)).contains(&quantum) {
        return Err(SchedError::InvalidQuantum);
    }
    if cpu != -1 && !(0..k.config().cpus as i32).contains(&cpu) {
        return Err(SchedError::InvalidCpu);
    }

    let p = set.get(nr);
    if cpu != -1 && p.rts.contains(RtsFlags::PROC_MIGR) && p.next_cpu != Some(cpu as usize) {
        crate::log_debug!(cpu = me; "sched", "{} still migrating, cpu {} refused", p.endpoint, cpu);
        return Err(SchedError::MigrationPending);
    }
    if p.is_runnable() {
        let on = p.cpu;
        if on != me && cpu != -1 && cpu as usize != on {
            smp::migrate_proc(set, nr, cpu as usize);
        }
    }
    // Dequeue while the parameters that pick the queue change
    if set.get(nr).is_runnable() {
        rts_set(set, nr, RtsFlags::NO_QUANTUM);
    }

    let p = set.get_mut(nr);
    if priority != -1 {
        p.priority = priority as u8;
    }
    if quantum != -1 {
        p.quantum_size = quantum as u32;
        p.cpu_time_left = quantum as u32;
    }
    // A deferred migration to `cpu` lands when its old CPU reschedules
    if cpu != -1 && !p.rts.contains(RtsFlags::PROC_MIGR) {
        p.cpu = cpu as usize;
    }
    if niced {
        p.misc.insert(MiscFlags::NICED);
    } else {
        p.misc.remove(MiscFlags::NICED);
    }

    rts_unset(set, nr, RtsFlags::NO_QUANTUM);
    Ok(())
}

/// Make `caller` the scheduler of `target_e`, or hand it to the kernel
pub(crate) fn schedctl(
    set: &mut ProcSet,
    caller: ProcNr,
    target_e: Endpoint,
    flags: u32,
    priority: i32,
    quantum: i64,
) -> SchedResult<()> {
    let k = set.kernel();
    let flags = SchedCtlFlags::from_bits(flags).ok_or(SchedError::InvalidFlags)?;
    let nr = k.procs().isokendpt(target_e).ok_or(SchedError::DeadProcess)?;
    let caller_e = k.procs().endpoint(caller);

    set.relock(&[nr]);
    if crate::ipc::engine::is_dead(set.get(nr), target_e) {
        return Err(SchedError::DeadProcess);
    }

    if flags.contains(SchedCtlFlags::KERNEL) {
        let cpu = k.next_sched_cpu() as i32;
        sched_proc(set, nr, priority, quantum, cpu, false)?;
        set.get_mut(nr).scheduler = None;
    } else {
        set.get_mut(nr).scheduler = Some(caller_e);
    }
    Ok(())
}

/// Scheduler `caller` sets new parameters for `target_e`
pub(crate) fn do_schedule(
    set: &mut ProcSet,
    caller: ProcNr,
    target_e: Endpoint,
    priority: i32,
    quantum: i64,
    cpu: i32,
    niced: bool,
) -> SchedResult<()> {
    let k = set.kernel();
    let nr = k.procs().isokendpt(target_e).ok_or(SchedError::DeadProcess)?;
    let caller_e = k.procs().endpoint(caller);

    set.relock(&[nr]);
    if crate::ipc::engine::is_dead(set.get(nr), target_e) {
        return Err(SchedError::DeadProcess);
    }
    if set.get(nr).scheduler != Some(caller_e) {
        return Err(SchedError::NotPermitted);
    }
    sched_proc(set, nr, priority, quantum, cpu, niced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        use crate::ipc::errno;
        assert_eq!(SchedError::NotPermitted.errno(), errno::EPERM);
        assert_eq!(SchedError::InvalidQuantum.errno(), errno::EINVAL);
        assert_eq!(SchedError::InvalidCpu.errno(), errno::EBADCPU);
    }

    #[test]
    fn test_schedctl_flags() {
        assert_eq!(SchedCtlFlags::from_bits(1), Some(SchedCtlFlags::KERNEL));
        assert_eq!(SchedCtlFlags::from_bits(2), None);
    }
}

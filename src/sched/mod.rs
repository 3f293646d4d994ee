//! Per-CPU Scheduler
//!
//! Every CPU owns a `RunQueue`. A process sits on the queue of the CPU in
//! its `cpu` field exactly while no RTS flag is set; `rts_set` and
//! `rts_unset` are the only way flags change, and they move the process
//! on and off the queue as its runnability flips.
//!
//! # Remote queues
//!
//! Any CPU may append to a remote queue (`enqueue`), waking the remote CPU
//! if it idles. Removing from a remote queue goes through the SMP
//! coordinator, which performs the dequeue on the owning CPU.
//!
//! # Reschedule point
//!
//! `switch_to_user` is what a CPU runs on its way back to user mode. It
//! finishes deferred work of the previous process (migration, preemption),
//! picks the next one, delivers its parked message and handles quantum
//! expiry.

pub mod quantum;
pub mod runqueue;

pub use quantum::{SchedError, SchedResult};
pub use runqueue::RunQueue;

use crate::config::NR_SCHED_QUEUES;
use crate::ipc::call::{delivermsg, Delivery};
use crate::kernel::Kernel;
use crate::proc::{MiscFlags, Proc, PrivFlags, ProcNr, ProcSet, RtsFlags};
use crate::smp;

/// Run `f` on `target`'s run queue, with lock ordering bookkeeping for `me`
pub(crate) fn with_queue<R>(k: &Kernel, me: usize, target: usize, f: impl FnOnce(&mut RunQueue) -> R) -> R {
    let tracker = &k.percpu(me).locks;
    tracker.mark_runqueue_locked();
    let r = {
        let mut rq = k.percpu(target).run_queue.lock();
        f(&mut rq)
    };
    tracker.mark_runqueue_unlocked();
    r
}

/// Set `flags` on a locked process, dequeuing it if it stops being runnable
pub(crate) fn rts_set(set: &mut ProcSet, nr: ProcNr, flags: RtsFlags) {
    let k = set.kernel();
    let me = set.cpu();
    let p = set.get_mut(nr);
    let was_runnable = p.is_runnable();
    p.rts.insert(flags);
    if was_runnable && !p.is_runnable() && p.enqueued {
        if p.cpu == me {
            dequeue(k, me, p);
        } else {
            let cpu = p.cpu;
            smp::dequeue_task(k, me, nr, cpu);
        }
    }
}

/// Clear `flags` on a locked process, enqueuing it if it becomes runnable
pub(crate) fn rts_unset(set: &mut ProcSet, nr: ProcNr, flags: RtsFlags) {
    let k = set.kernel();
    let me = set.cpu();
    let p = set.get_mut(nr);
    let was_runnable = p.is_runnable();
    p.rts.remove(flags);
    if !was_runnable && p.is_runnable() {
        enqueue(k, me, p);
    }
}

/// `rts_set` for a process borrowed by the coordinator handler
///
/// The handler runs on the process's own CPU, so dequeuing is local.
pub(crate) fn rts_set_borrowed(k: &Kernel, me: usize, p: &mut Proc, flags: RtsFlags) {
    let was_runnable = p.is_runnable();
    p.rts.insert(flags);
    if was_runnable && !p.is_runnable() && p.enqueued {
        dequeue(k, me, p);
    }
}

pub(crate) fn rts_unset_borrowed(k: &Kernel, me: usize, p: &mut Proc, flags: RtsFlags) {
    let was_runnable = p.is_runnable();
    p.rts.remove(flags);
    if !was_runnable && p.is_runnable() {
        enqueue(k, me, p);
    }
}

/// Append a runnable process to the tail of its queue
pub(crate) fn enqueue(k: &Kernel, me: usize, p: &mut Proc) {
    assert!(p.is_runnable(), "enqueue of blocked {:?}", p.endpoint);
    assert!(!p.enqueued, "{:?} already enqueued", p.endpoint);
    let q = p.priority as usize;
    assert!(q < NR_SCHED_QUEUES);

    let target = p.cpu;
    let nr = p.nr;
    with_queue(k, me, target, |rq| rq.push_back(q, nr));
    p.enqueued = true;
    p.acct.enter_queue = Some(k.clock().uptime());

    if target != me {
        let remote = k.percpu(target);
        remote.count_remote_enqueue();
        if remote.is_idle() {
            smp::schedule(k, target);
        }
    }
}

/// Put a preempted process back at the head of its queue
pub(crate) fn enqueue_head(k: &Kernel, me: usize, p: &mut Proc) {
    assert!(p.is_runnable(), "enqueue of blocked {:?}", p.endpoint);
    assert!(!p.enqueued, "{:?} already enqueued", p.endpoint);
    assert!(p.cpu_time_left > 0, "head insertion without quantum left");
    let q = p.priority as usize;
    assert!(q < NR_SCHED_QUEUES);

    let nr = p.nr;
    with_queue(k, me, p.cpu, |rq| rq.push_front(q, nr));
    p.enqueued = true;
    p.acct.enter_queue = Some(k.clock().uptime());
    // Being put back is not a dequeue the scheduler should hear about
    p.acct.dequeues = p.acct.dequeues.saturating_sub(1);
    p.acct.preempted += 1;
}

/// Remove a process from this CPU's queue
pub(crate) fn dequeue(k: &Kernel, me: usize, p: &mut Proc) {
    assert_eq!(p.cpu, me, "cpu {} dequeues {:?} owned by cpu {}", me, p.endpoint, p.cpu);
    assert!(p.enqueued, "{:?} not enqueued", p.endpoint);
    let q = p.priority as usize;
    let nr = p.nr;
    let found = with_queue(k, me, me, |rq| rq.remove(q, nr));
    assert!(found, "{:?} missing from queue {} of cpu {}", p.endpoint, q, me);
    p.enqueued = false;

    let now = k.clock().uptime();
    p.acct.dequeues += 1;
    if let Some(entered) = p.acct.enter_queue.take() {
        p.acct.time_in_queue += now.saturating_sub(entered);
    }
    p.dequeued_at = now;
}

/// Highest-priority runnable process of `me`, or None to idle
pub(crate) fn pick_proc(k: &Kernel, me: usize) -> Option<ProcNr> {
    let pc = k.percpu(me);
    let picked = with_queue(k, me, me, |rq| {
        let picked = rq.pick();
        if picked.is_none() {
            pc.set_idle(true);
        }
        picked
    });
    picked
}

/// Finish deferred work for a process leaving the CPU
fn retire(set: &mut ProcSet, nr: ProcNr) {
    let k = set.kernel();
    let me = set.cpu();
    let p = set.get_mut(nr);
    if p.rts.contains(RtsFlags::PROC_MIGR) {
        let dest = p.next_cpu.take();
        let Some(dest) = dest else {
            panic!("{:?} migrating without a destination", p.endpoint);
        };
        crate::log_debug!(cpu = me; "sched", "{:?} moves to cpu {}", p.endpoint, dest);
        p.cpu = dest;
        rts_unset(set, nr, RtsFlags::PROC_MIGR);
        k.metrics().inc_migrations();
    } else if p.rts.contains(RtsFlags::PREEMPTED) {
        p.rts.remove(RtsFlags::PREEMPTED);
        if p.is_runnable() {
            if p.cpu_time_left > 0 {
                enqueue_head(k, me, p);
            } else {
                enqueue(k, me, p);
            }
        }
    }
}

/// A process of higher priority than the running `p` waits on this CPU
fn outranked(k: &Kernel, me: usize, p: &Proc) -> bool {
    with_queue(k, me, me, |rq| rq.top_priority())
        .is_some_and(|q| q < p.priority as usize)
}

/// Take `prev` off the CPU if it cannot keep running here
///
/// Returns true when it may stay the current process.
pub(crate) fn put_prev(set: &mut ProcSet, prev: ProcNr) -> bool {
    let p = set.get(prev);
    if p.is_runnable() && p.cpu == set.cpu() {
        return true;
    }
    retire(set, prev);
    false
}

/// Copy out the parked message of a process about to return to user mode
pub(crate) fn deliver_pending(set: &mut ProcSet, nr: ProcNr) {
    while set.get(nr).misc.contains(MiscFlags::DELIVERMSG) && set.get(nr).is_runnable() {
        if delivermsg(set, nr) != Delivery::Retry {
            break;
        }
    }
}

/// Pick the process this CPU returns to, delivering its pending message
///
/// Returns None when the CPU has nothing to run.
pub(crate) fn switch_to_user(k: &Kernel, me: usize) -> Option<ProcNr> {
    let pc = k.percpu(me);
    smp::service_ipis(k, me);

    let prev = pc.current();
    let mut set = ProcSet::empty(k, me);

    if let Some(nr) = prev {
        set.relock(&[nr]);
        if !put_prev(&mut set, nr) {
            pc.set_current(None);
        } else if outranked(k, me, set.get(nr)) {
            rts_set(&mut set, nr, RtsFlags::PREEMPTED);
            put_prev(&mut set, nr);
            pc.set_current(None);
        }
    }

    loop {
        let nr = match pc.current() {
            Some(nr) => nr,
            None => {
                set.release();
                let nr = pick_proc(k, me)?;
                set.relock(&[nr]);
                let p = set.get(nr);
                if p.cpu != me || !p.is_runnable() {
                    // Moved or stopped while we waited for its lock
                    assert!(p.cpu != me || !p.enqueued, "{:?} queued but blocked", p.endpoint);
                    continue;
                }
                pc.set_current(Some(nr));
                pc.set_idle(false);
                if p.privilege.flags.contains(PrivFlags::BILLABLE) {
                    pc.set_bill(Some(nr));
                }
                nr
            }
        };

        deliver_pending(&mut set, nr);

        let p = set.get(nr);
        if p.is_runnable() && p.cpu_time_left == 0 {
            // Rotated to the tail or parked for its scheduler: pick again
            quantum::proc_no_time(&mut set, nr);
            put_prev(&mut set, nr);
            pc.set_current(None);
            continue;
        }

        if !put_prev(&mut set, nr) {
            pc.set_current(None);
            continue;
        }

        set.release();
        if prev != Some(nr) {
            k.metrics().inc_context_switches();
        }
        return Some(nr);
    }
}

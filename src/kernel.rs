//! Kernel context and per-CPU entry points
//!
//! `Kernel` owns every shared structure: the lock strategy, the process
//! table, the per-CPU data, the clock and the counters. Nothing lives in
//! globals, so several kernels can run side by side in one test binary.
//!
//! Code running on a CPU enters the kernel through a `Cpu` handle. Every
//! entry point corresponds to a trap or interrupt on real hardware: an IPC
//! call, a timer tick, the return to user mode, or a system call made by a
//! privileged process (spawn, exit, stop, schedule).
//!
//! In `LockMode::Coarse` an entry takes the big kernel lock first and the
//! per-process locks become bookkeeping only.

use crate::clock::{self, Clock, TimerAction, TimerId};
use crate::config::{BootConfig, ConfigError, LockMode, NR_SCHED_QUEUES, NR_TASKS};
use crate::ipc::call::do_ipc;
use crate::ipc::asyncsend::cancel_async;
use crate::ipc::engine::{is_dead, notify, queue_members, queue_unlink};
use crate::ipc::{errno, IpcError, IpcRequest, IpcResult};
use crate::mem::UserMemory;
use crate::metrics::{KernelMetrics, MetricsSnapshot};
use crate::proc::{
    AsyncTable, Endpoint, MiscFlags, PrivFlags, Proc, ProcInfo, ProcNr, ProcSet, ProcSpec,
    ProcTable, RtsFlags, Signal, ASYNCM, CLOCK, SYSTEM,
};
use crate::sched::{self, quantum, rts_set, rts_unset, SchedError, SchedResult};
use crate::smp::{self, IpiRelax, PerCpu};
use crate::sync::{new_strategy, LockId, LockStrategy};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NO_CPU: usize = usize::MAX;

pub struct Kernel {
    config: BootConfig,
    /// One lock per process slot, then the big kernel lock
    locks: Box<dyn LockStrategy>,
    bkl_owner: AtomicUsize,
    procs: ProcTable,
    cpus: Box<[PerCpu]>,
    clock: Clock,
    memory: Arc<dyn UserMemory>,
    metrics: KernelMetrics,
    next_sched_cpu: AtomicUsize,
}

impl Kernel {
    /// Bring up a kernel with the given parameters
    ///
    /// Kernel tasks take the first slots; every other slot starts free.
    pub fn boot(config: BootConfig, memory: Arc<dyn UserMemory>) -> Result<Kernel, ConfigError> {
        config.validate()?;
        crate::log::set_log_level(config.log_level);

        let procs = ProcTable::new(config.procs);
        for (nr, name) in [(CLOCK, "clock"), (SYSTEM, "system"), (ASYNCM, "asyncm")] {
            let slot = procs.slot(nr);
            // SAFETY: the table is not shared yet
            let p = unsafe { slot.proc_mut() };
            p.name = String::from(name);
            // Kernel tasks exist only as senders and never run
            p.rts = RtsFlags::PROC_STOP;
            p.priority = crate::config::TASK_Q;
            p.privilege.flags = PrivFlags::SYS_PROC;
            slot.publish(p);
        }
        debug_assert_eq!(NR_TASKS, 3);

        let cpus = (0..config.cpus)
            .map(|id| PerCpu::new(id, config.procs))
            .collect();

        let kernel = Kernel {
            locks: new_strategy(config.lock, config.procs + 1, config.cpus),
            bkl_owner: AtomicUsize::new(NO_CPU),
            procs,
            cpus,
            clock: Clock::new(config.hz),
            memory,
            metrics: KernelMetrics::new(),
            next_sched_cpu: AtomicUsize::new(0),
            config,
        };

        crate::log_info!(
            "kernel",
            "booted: {} cpus, {} slots, {} locks in {:?} mode, {} Hz",
            config.cpus,
            config.procs,
            config.lock.name(),
            config.mode,
            config.hz
        );
        Ok(kernel)
    }

    /// Tear the kernel down and return its final counters
    pub fn shutdown(self) -> MetricsSnapshot {
        for (nr, slot) in self.procs.iter() {
            assert!(slot.owner().is_none(), "proc {} still locked at shutdown", nr);
        }
        let snapshot = self.metrics.snapshot();
        crate::log_info!("kernel", "shutdown: {:?}", snapshot);
        snapshot
    }

    #[inline]
    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    #[inline]
    pub fn mode(&self) -> LockMode {
        self.config.mode
    }

    #[inline]
    pub fn locks(&self) -> &dyn LockStrategy {
        &*self.locks
    }

    #[inline]
    pub fn procs(&self) -> &ProcTable {
        &self.procs
    }

    #[inline]
    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    #[inline]
    pub fn percpu(&self, cpu: usize) -> &PerCpu {
        &self.cpus[cpu]
    }

    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    #[inline]
    pub fn memory(&self) -> &dyn UserMemory {
        &*self.memory
    }

    #[inline]
    pub fn metrics(&self) -> &KernelMetrics {
        &self.metrics
    }

    /// Busy percentage of `cpu` since the last query
    pub fn cpu_load(&self, cpu: usize) -> u32 {
        self.percpu(cpu).cpu_load()
    }

    /// CPU for the next process handed back to kernel scheduling
    pub fn next_sched_cpu(&self) -> usize {
        self.next_sched_cpu.fetch_add(1, Ordering::Relaxed) % self.cpus.len()
    }

    fn bkl_id(&self) -> LockId {
        self.procs.len()
    }

    /// Entry handle for code running on `id`
    pub fn cpu(&self, id: usize) -> Cpu<'_> {
        assert!(id < self.cpus.len(), "cpu {} not booted", id);
        Cpu { kernel: self, id }
    }
}

/// How an IPC call left its caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The call finished; the caller keeps running
    Done,
    /// The caller waits for a peer; `Cpu::resume` collects the result
    Blocked,
}

/// Held for the duration of one kernel entry
struct Entry<'k> {
    kernel: &'k Kernel,
    cpu: usize,
    held: bool,
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        if self.held {
            self.kernel.bkl_owner.store(NO_CPU, Ordering::Release);
            self.kernel.locks.unlock(self.kernel.bkl_id(), self.cpu);
        }
    }
}

/// A CPU's view of the kernel
#[derive(Clone, Copy)]
pub struct Cpu<'k> {
    kernel: &'k Kernel,
    id: usize,
}

impl<'k> Cpu<'k> {
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    fn enter(&self) -> Entry<'k> {
        let k = self.kernel;
        let mut held = false;
        if k.mode() == LockMode::Coarse && k.bkl_owner.load(Ordering::Acquire) != self.id {
            k.locks.lock(k.bkl_id(), self.id, &IpiRelax::new(k, self.id));
            k.bkl_owner.store(self.id, Ordering::Release);
            held = true;
        }
        Entry {
            kernel: k,
            cpu: self.id,
            held,
        }
    }

    /// Slot of a live, non-task process
    fn user_proc(&self, ep: Endpoint) -> IpcResult<ProcNr> {
        let nr = self.kernel.procs().isokendpt(ep).ok_or(IpcError::DeadSrcDst)?;
        if ProcTable::is_kernel_task(nr) {
            return Err(IpcError::NotPermitted);
        }
        Ok(nr)
    }

    /// Make `nr` the process running on this CPU and lock it alone
    fn dispatch(&self, set: &mut ProcSet<'k>, nr: ProcNr, ep: Endpoint) -> IpcResult<()> {
        let pc = self.kernel.percpu(self.id);
        if let Some(prev) = pc.current().filter(|&prev| prev != nr) {
            set.relock(&[prev]);
            sched::put_prev(set, prev);
            pc.set_current(None);
        }

        set.relock(&[nr]);
        let p = set.get(nr);
        if is_dead(p, ep) || !p.is_runnable() {
            return Err(IpcError::NotReady);
        }
        if p.cpu != self.id {
            return Err(IpcError::Invalid);
        }
        if pc.current() != Some(nr) {
            pc.set_current(Some(nr));
            if p.privilege.flags.contains(PrivFlags::BILLABLE) {
                pc.set_bill(Some(nr));
            }
            self.kernel.metrics().inc_context_switches();
        }
        pc.set_idle(false);
        Ok(())
    }

    /// Issue an IPC call as the process `ep`, which must be runnable here
    pub fn ipc_call(&self, ep: Endpoint, req: IpcRequest) -> IpcResult<Completion> {
        let _entry = self.enter();
        smp::service_ipis(self.kernel, self.id);
        let nr = self.user_proc(ep)?;

        let mut set = ProcSet::empty(self.kernel, self.id);
        self.dispatch(&mut set, nr, ep)?;
        // A message parked earlier goes out before the next call
        sched::deliver_pending(&mut set, nr);
        if set.get(nr).misc.contains(MiscFlags::DELIVERMSG) || !set.get(nr).is_runnable() {
            return Err(IpcError::NotReady);
        }

        let (call_nr, r2, r3) = req.registers();
        let result = do_ipc(&mut set, nr, call_nr, r2, r3);

        sched::deliver_pending(&mut set, nr);
        result?;
        if set.get(nr).is_runnable() {
            Ok(Completion::Done)
        } else {
            Ok(Completion::Blocked)
        }
    }

    /// Run a process that blocked in IPC and was woken; returns its result
    /// code
    pub fn resume(&self, ep: Endpoint) -> IpcResult<i32> {
        let _entry = self.enter();
        smp::service_ipis(self.kernel, self.id);
        let nr = self.user_proc(ep)?;

        let mut set = ProcSet::empty(self.kernel, self.id);
        self.dispatch(&mut set, nr, ep)?;
        sched::deliver_pending(&mut set, nr);
        let p = set.get(nr);
        if !p.is_runnable() {
            return Err(IpcError::NotReady);
        }
        Ok(p.retval)
    }

    /// Consistent snapshot of a process
    pub fn inspect(&self, ep: Endpoint) -> Option<ProcInfo> {
        let _entry = self.enter();
        if ep.is_special() || ep.slot() >= self.kernel.procs().len() {
            return None;
        }
        let nr = ep.slot();
        let set = ProcSet::acquire(self.kernel, self.id, &[nr]);
        let p = set.get(nr);
        if p.endpoint != ep || p.is_free() {
            return None;
        }
        Some(ProcInfo {
            endpoint: p.endpoint,
            name: p.name.clone(),
            rts: p.rts,
            misc: p.misc,
            enqueued: p.enqueued,
            priority: p.priority,
            quantum_size: p.quantum_size,
            cpu_time_left: p.cpu_time_left,
            cpu: p.cpu,
            scheduler: p.scheduler,
            sendto: p.sendto,
            getfrom: p.getfrom,
            retval: p.retval,
            ipc_status: p.ipc_status,
            notify_pending: p.privilege.notify_pending,
            asyn_pending: p.privilege.asyn_pending,
            acct: p.acct,
            user_time: p.user_time,
            sys_time: p.sys_time,
            pending_signal: p.pending_signal,
            callers: queue_members(&set, nr),
        })
    }

    /// Create a process in a free slot and make it runnable
    pub fn spawn(&self, spec: ProcSpec) -> SchedResult<Endpoint> {
        let k = self.kernel;
        let _entry = self.enter();
        if spec.priority as usize >= NR_SCHED_QUEUES
            || spec.quantum == Some(0)
            || spec.cpu.is_some_and(|cpu| cpu >= k.ncpus())
        {
            return Err(SchedError::InvalidSpec);
        }

        let mut set = ProcSet::empty(k, self.id);
        let nr = loop {
            let nr = k.procs().find_free().ok_or(SchedError::NoFreeSlot)?;
            set.relock(&[nr]);
            if set.get(nr).is_free() {
                break nr;
            }
        };

        let quantum = spec.quantum.unwrap_or(k.config().quantum_ticks);
        let p = set.get_mut(nr);
        let ep = p.endpoint;
        *p = Proc::free(nr, ep);
        p.name = spec.name;
        p.priority = spec.priority;
        p.quantum_size = quantum;
        p.cpu_time_left = quantum;
        p.cpu = spec.cpu.unwrap_or(self.id);
        p.scheduler = spec.scheduler;
        p.privilege.flags = spec.flags;
        p.privilege.trap_mask = spec.trap_mask;
        p.privilege.send_mask = spec.send_mask;
        crate::log_debug!(cpu = self.id; "proc", "spawned {} as {} on cpu {}", p.name, ep, p.cpu);

        rts_unset(&mut set, nr, RtsFlags::SLOT_FREE);
        Ok(ep)
    }

    /// Tear down a process and free its slot
    ///
    /// Every process blocked on it is woken with EDEADSRCDST; pending
    /// notifications and async messages it sent are dropped.
    pub fn exit(&self, ep: Endpoint) -> IpcResult<()> {
        let k = self.kernel;
        let _entry = self.enter();
        let nr = self.user_proc(ep)?;

        let mut set = ProcSet::acquire(k, self.id, &[nr]);
        if is_dead(set.get(nr), ep) {
            return Err(IpcError::DeadSrcDst);
        }
        // From here on nobody can start an operation with it
        rts_set(&mut set, nr, RtsFlags::NO_ENDPOINT);
        set.get_mut(nr).privilege.asyn = AsyncTable::empty();

        let sendto = set.get(nr).rts.contains(RtsFlags::SENDING).then(|| set.get(nr).sendto);
        if let Some(target) = sendto {
            set.relock(&[nr, target.slot()]);
            // A receiver may have taken the message while we relocked
            if set.get(nr).rts.contains(RtsFlags::SENDING) {
                queue_unlink(&mut set, target.slot(), nr);
                set.get_mut(nr).sendto = Endpoint::NONE;
                rts_unset(&mut set, nr, RtsFlags::SENDING);
            }
            set.relock(&[nr]);
        }
        rts_unset(&mut set, nr, RtsFlags::RECEIVING);
        set.get_mut(nr).misc.remove(MiscFlags::REPLY_PEND);

        cancel_incoming_async(&mut set, nr);

        for other in NR_TASKS..k.procs().len() {
            if other == nr || k.procs().slot(other).rts().contains(RtsFlags::SLOT_FREE) {
                continue;
            }
            set.relock(&[other, nr]);
            clear_refs(&mut set, other, nr, ep);
        }

        set.relock(&[nr]);
        let p = set.get_mut(nr);
        assert!(p.caller_q.is_none(), "{} exits with queued callers", ep);
        assert!(!p.enqueued);
        let name = core::mem::take(&mut p.name);
        *p = Proc::free(nr, ep.next_generation());
        k.procs().slot(nr).set_q_link(None);
        for pc in k.cpus.iter() {
            if pc.fpu_owner() == Some(nr) {
                pc.set_fpu_owner(None);
            }
        }
        drop(set);

        k.memory().release(ep);
        crate::log_debug!(cpu = self.id; "proc", "{} ({}) exited", ep, name);
        Ok(())
    }

    /// Pick the process to return to user mode with
    pub fn switch_to_user(&self) -> Option<Endpoint> {
        let _entry = self.enter();
        sched::switch_to_user(self.kernel, self.id).map(|nr| self.kernel.procs().endpoint(nr))
    }

    /// Process running on this CPU
    pub fn current(&self) -> Option<Endpoint> {
        self.kernel
            .percpu(self.id)
            .current()
            .map(|nr| self.kernel.procs().endpoint(nr))
    }

    /// Local timer interrupt
    pub fn timer_tick(&self) {
        let _entry = self.enter();
        smp::service_ipis(self.kernel, self.id);
        clock::timer_tick(self.kernel, self.id);
    }

    /// Handle pending inter-processor interrupts
    pub fn service_ipis(&self) {
        smp::service_ipis(self.kernel, self.id);
    }

    /// Idle loop: keep answering coordinator requests until `stop` is set
    pub fn run_idle(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::Acquire) {
            smp::service_ipis(self.kernel, self.id);
            core::hint::spin_loop();
        }
        smp::service_ipis(self.kernel, self.id);
    }

    /// Preempt the running process; the next reschedule puts it back at
    /// the head of its queue
    pub fn preempt_current(&self) {
        let _entry = self.enter();
        let Some(cur) = self.kernel.percpu(self.id).current() else {
            return;
        };
        let mut set = ProcSet::acquire(self.kernel, self.id, &[cur]);
        if set.get(cur).is_runnable() {
            rts_set(&mut set, cur, RtsFlags::PREEMPTED);
        }
    }

    fn with_live(&self, ep: Endpoint, f: impl FnOnce(&mut ProcSet<'k>, ProcNr)) -> IpcResult<()> {
        let _entry = self.enter();
        let nr = self.user_proc(ep)?;
        let mut set = ProcSet::acquire(self.kernel, self.id, &[nr]);
        if is_dead(set.get(nr), ep) {
            return Err(IpcError::DeadSrcDst);
        }
        f(&mut set, nr);
        Ok(())
    }

    /// Stop a process wherever it runs
    pub fn stop_proc(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| smp::stop_proc(set, nr))
    }

    /// Stop a process and flush its FPU state out of its CPU
    pub fn stop_proc_save_ctx(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| smp::stop_proc_save_ctx(set, nr))
    }

    pub fn resume_stopped(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| rts_unset(set, nr, RtsFlags::PROC_STOP))
    }

    /// Hold a process off its CPU while its memory changes
    pub fn vminhibit(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| smp::vminhibit(set, nr))
    }

    /// The memory manager is done with the process
    pub fn vm_resume(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| {
            rts_unset(set, nr, RtsFlags::VMINHIBIT | RtsFlags::VMREQUEST)
        })
    }

    /// Clear a kernel-raised signal once the signal manager handled it
    pub fn clear_signal(&self, ep: Endpoint) -> IpcResult<()> {
        self.with_live(ep, |set, nr| {
            set.get_mut(nr).pending_signal = None;
            rts_unset(set, nr, RtsFlags::SIGNALED);
        })
    }

    /// Flag `sig` for a system process and notify it from SYSTEM
    pub fn send_sig(&self, ep: Endpoint, sig: Signal) -> IpcResult<()> {
        let _entry = self.enter();
        let nr = self.user_proc(ep)?;
        let mut set = ProcSet::acquire(self.kernel, self.id, &[nr]);
        if is_dead(set.get(nr), ep) {
            return Err(IpcError::DeadSrcDst);
        }
        set.get_mut(nr).privilege.sig_pending |= sig.bit();
        notify(&mut set, SYSTEM, ep)
    }

    /// Move a process to `dest`
    pub fn migrate(&self, ep: Endpoint, dest: usize) -> SchedResult<()> {
        let _entry = self.enter();
        let nr = self.kernel.procs().isokendpt(ep).ok_or(SchedError::DeadProcess)?;
        if dest >= self.kernel.ncpus() {
            return Err(SchedError::InvalidCpu);
        }
        let mut set = ProcSet::acquire(self.kernel, self.id, &[nr]);
        if is_dead(set.get(nr), ep) {
            return Err(SchedError::DeadProcess);
        }
        let niced = set.get(nr).misc.contains(MiscFlags::NICED);
        quantum::sched_proc(&mut set, nr, -1, -1, dest as i32, niced)
    }

    /// SCHEDCTL issued by `caller`
    pub fn schedctl(&self, caller: Endpoint, target: Endpoint, flags: u32, priority: i32, quantum: i64) -> SchedResult<()> {
        let _entry = self.enter();
        let caller = self.kernel.procs().isokendpt(caller).ok_or(SchedError::DeadProcess)?;
        let mut set = ProcSet::empty(self.kernel, self.id);
        quantum::schedctl(&mut set, caller, target, flags, priority, quantum)
    }

    /// SCHEDULE issued by `caller`, the scheduler of `target`
    #[allow(clippy::too_many_arguments)]
    pub fn schedule(
        &self,
        caller: Endpoint,
        target: Endpoint,
        priority: i32,
        quantum: i64,
        cpu: i32,
        niced: bool,
    ) -> SchedResult<()> {
        let _entry = self.enter();
        let caller = self.kernel.procs().isokendpt(caller).ok_or(SchedError::DeadProcess)?;
        let mut set = ProcSet::empty(self.kernel, self.id);
        quantum::do_schedule(&mut set, caller, target, priority, quantum, cpu, niced)
    }

    pub fn alloc_timer(&self) -> TimerId {
        let tracker = &self.kernel.percpu(self.id).locks;
        self.kernel.clock().with_timers(tracker, |q| q.alloc())
    }

    /// Arm `id` to fire at uptime `expiry`; false for an unknown timer
    pub fn set_kernel_timer(&self, id: TimerId, expiry: u64, action: TimerAction) -> bool {
        let tracker = &self.kernel.percpu(self.id).locks;
        self.kernel.clock().with_timers(tracker, |q| q.set(id, expiry, action))
    }

    pub fn reset_kernel_timer(&self, id: TimerId) -> bool {
        let tracker = &self.kernel.percpu(self.id).locks;
        self.kernel.clock().with_timers(tracker, |q| q.clear(id))
    }

    pub fn free_timer(&self, id: TimerId) {
        let tracker = &self.kernel.percpu(self.id).locks;
        self.kernel.clock().with_timers(tracker, |q| q.free(id));
    }
}

/// Fail the async messages still pending for the exiting `nr`
fn cancel_incoming_async(set: &mut ProcSet, nr: ProcNr) {
    let me = set.cpu();
    while let Some(src) = set.get(nr).privilege.asyn_pending.first_set() {
        set.relock(&[src, nr]);
        if let Err(e) = cancel_async(set, src, nr) {
            crate::log_trace!(cpu = me; "proc", "async cancel from proc {}: {}", src, e);
        }
        set.get_mut(nr).privilege.asyn_pending.unset(src);
        set.relock(&[nr]);
    }
}

/// Drop every reference `other` holds to the exiting `nr`
///
/// The set holds {other, nr}.
fn clear_refs(set: &mut ProcSet, other: ProcNr, nr: ProcNr, ep: Endpoint) {
    let me = set.cpu();
    let o = set.get_mut(other);
    if o.is_free() {
        return;
    }
    o.privilege.notify_pending.unset(nr);
    o.privilege.asyn_pending.unset(nr);
    if o.blocked_on() != Some(ep) {
        return;
    }

    let sending = o.rts.contains(RtsFlags::SENDING);
    o.retval = errno::EDEADSRCDST;
    o.misc.remove(MiscFlags::REPLY_PEND);
    if sending {
        o.sendto = Endpoint::NONE;
        queue_unlink(set, nr, other);
    }
    crate::log_debug!(cpu = me; "proc", "{} woken by exit of {}", set.get(other).endpoint, ep);
    rts_unset(set, other, RtsFlags::SENDING | RtsFlags::RECEIVING);
}

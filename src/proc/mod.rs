//! Process Table
//!
//! A fixed table of process slots. Each slot holds one `Proc` behind its
//! own lock (see `lock::ProcSet`) together with a few lock-free shadow
//! copies of the fields other CPUs need to peek at without locking: the
//! run state, the endpoint, the owning CPU and what the process is blocked
//! on.
//!
//! # Kernel tasks
//!
//! The first `NR_TASKS` slots belong to kernel pseudo-processes. They
//! never run; they exist so that notifications from the kernel have a
//! sender:
//!
//! - `CLOCK` sends timer notifications
//! - `SYSTEM` sends signal notifications
//! - `ASYNCM` reports completion of async send tables
//!
//! # Run state
//!
//! A process is runnable iff no RTS flag is set. Every flag names one
//! reason the process cannot run; the scheduler keeps the process on a run
//! queue exactly while the set is empty.

mod endpoint;
pub mod lock;
pub mod privilege;
pub mod table;

pub use endpoint::{Endpoint, ProcNr, MAX_GENERATION, SLOT_BITS};
pub use lock::ProcSet;
pub use privilege::{AsyncTable, Priv, PrivFlags, PrivId, SysMap, TrapMask};
pub use table::{BlockedOn, ProcSlot, ProcTable};

use crate::config::USER_Q;
use crate::ipc::{IpcStatus, Message};
use crate::mem::VirAddr;
use alloc::string::String;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Clock task: sender of timer notifications
pub const CLOCK: ProcNr = 0;
/// System task: sender of signal notifications
pub const SYSTEM: ProcNr = 1;
/// Async manager: sender of async completion notifications
pub const ASYNCM: ProcNr = 2;

bitflags! {
    /// Reasons a process cannot run
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RtsFlags: u32 {
        const SLOT_FREE = 0x01;
        const PROC_STOP = 0x02;
        const SENDING = 0x04;
        const RECEIVING = 0x08;
        const SIGNALED = 0x10;
        const NO_ENDPOINT = 0x100;
        const VMINHIBIT = 0x200;
        const VMREQUEST = 0x800;
        const PREEMPTED = 0x4000;
        const NO_QUANTUM = 0x8000;
        const PROC_MIGR = 0x20000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MiscFlags: u32 {
        /// Sent with SENDREC, waiting for the reply
        const REPLY_PEND = 0x01;
        /// `delivermsg` holds a message not yet copied to the process
        const DELIVERMSG = 0x02;
        /// Last copy of `delivermsg` failed once
        const MSGFAILED = 0x04;
        /// Queued message was sent by the kernel on the process's behalf
        const SENDING_FROM_KERNEL = 0x08;
        const NICED = 0x10;
    }
}

/// Signals the kernel itself raises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill = 9,
    Segv = 11,
    Alarm = 14,
}

impl Signal {
    pub const fn bit(self) -> u64 {
        1 << (self as u32)
    }
}

/// Scheduling statistics reported to user-space schedulers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accounting {
    /// Ticks spent ready but not running
    pub time_in_queue: u64,
    pub dequeues: u64,
    pub ipc_sync: u64,
    pub ipc_async: u64,
    pub preempted: u64,
    /// Uptime at which the process last entered a run queue
    pub enter_queue: Option<u64>,
}

impl Accounting {
    pub fn reset(&mut self) {
        *self = Accounting::default();
    }
}

/// One process table entry
pub struct Proc {
    pub nr: ProcNr,
    pub endpoint: Endpoint,
    pub name: String,

    pub rts: RtsFlags,
    pub misc: MiscFlags,
    /// On a run queue
    pub enqueued: bool,

    pub priority: u8,
    /// Quantum length in ticks
    pub quantum_size: u32,
    pub cpu_time_left: u32,
    pub cpu: usize,
    /// Destination of a pending migration
    pub next_cpu: Option<usize>,
    /// User-space scheduler; None when the kernel schedules the process
    pub scheduler: Option<Endpoint>,

    /// First process blocked sending to this one
    pub caller_q: Option<ProcNr>,
    pub sendto: Endpoint,
    pub getfrom: Endpoint,
    pub sendmsg: Message,
    pub delivermsg: Message,
    pub delivermsg_addr: VirAddr,
    pub ipc_status: IpcStatus,
    /// Something may have arrived since the last receive scan
    pub new_message: bool,
    /// Result of the last kernel call, as an errno
    pub retval: i32,

    pub privilege: Priv,
    pub acct: Accounting,
    pub user_time: u64,
    pub sys_time: u64,
    pub used_fpu: bool,
    pub pending_signal: Option<Signal>,
    pub dequeued_at: u64,
}

impl Proc {
    /// A free slot; `endpoint` is what the next process in it will get
    pub fn free(nr: ProcNr, endpoint: Endpoint) -> Self {
        Proc {
            nr,
            endpoint,
            name: String::new(),
            rts: RtsFlags::SLOT_FREE,
            misc: MiscFlags::empty(),
            enqueued: false,
            priority: USER_Q,
            quantum_size: 0,
            cpu_time_left: 0,
            cpu: 0,
            next_cpu: None,
            scheduler: None,
            caller_q: None,
            sendto: Endpoint::NONE,
            getfrom: Endpoint::NONE,
            sendmsg: Message::default(),
            delivermsg: Message::default(),
            delivermsg_addr: 0,
            ipc_status: IpcStatus::default(),
            new_message: false,
            retval: 0,
            privilege: Priv::new(nr),
            acct: Accounting::default(),
            user_time: 0,
            sys_time: 0,
            used_fpu: false,
            pending_signal: None,
            dequeued_at: 0,
        }
    }

    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.rts.is_empty()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.rts.contains(RtsFlags::SLOT_FREE)
    }

    /// Endpoint the process waits for, if it is blocked in IPC
    pub fn blocked_on(&self) -> Option<Endpoint> {
        if self.rts.contains(RtsFlags::SENDING) {
            Some(self.sendto)
        } else if self.rts.contains(RtsFlags::RECEIVING) {
            Some(self.getfrom)
        } else {
            None
        }
    }
}

impl core::fmt::Debug for Proc {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Proc")
            .field("nr", &self.nr)
            .field("endpoint", &self.endpoint)
            .field("name", &self.name)
            .field("rts", &self.rts)
            .field("misc", &self.misc)
            .field("cpu", &self.cpu)
            .field("priority", &self.priority)
            .finish()
    }
}

/// Parameters for a new process
#[derive(Debug, Clone)]
pub struct ProcSpec {
    pub name: String,
    pub priority: u8,
    /// Quantum in ticks; None takes the boot default
    pub quantum: Option<u32>,
    /// CPU to run on; None takes the spawning CPU
    pub cpu: Option<usize>,
    pub scheduler: Option<Endpoint>,
    pub flags: PrivFlags,
    pub trap_mask: TrapMask,
    pub send_mask: SysMap,
}

impl ProcSpec {
    pub fn new(name: &str) -> Self {
        ProcSpec {
            name: String::from(name),
            priority: USER_Q,
            quantum: None,
            cpu: None,
            scheduler: None,
            flags: PrivFlags::SYS_PROC | PrivFlags::PREEMPTIBLE | PrivFlags::BILLABLE,
            trap_mask: TrapMask::all(),
            send_mask: SysMap::full(),
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn quantum(mut self, ticks: u32) -> Self {
        self.quantum = Some(ticks);
        self
    }

    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn scheduler(mut self, scheduler: Endpoint) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn flags(mut self, flags: PrivFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn trap_mask(mut self, mask: TrapMask) -> Self {
        self.trap_mask = mask;
        self
    }

    pub fn send_mask(mut self, mask: SysMap) -> Self {
        self.send_mask = mask;
        self
    }
}

/// Consistent copy of a process's state, taken under its lock
#[derive(Debug, Clone)]
pub struct ProcInfo {
    pub endpoint: Endpoint,
    pub name: String,
    pub rts: RtsFlags,
    pub misc: MiscFlags,
    pub enqueued: bool,
    pub priority: u8,
    pub quantum_size: u32,
    pub cpu_time_left: u32,
    pub cpu: usize,
    pub scheduler: Option<Endpoint>,
    pub sendto: Endpoint,
    pub getfrom: Endpoint,
    pub retval: i32,
    pub ipc_status: IpcStatus,
    pub notify_pending: SysMap,
    pub asyn_pending: SysMap,
    pub acct: Accounting,
    pub user_time: u64,
    pub sys_time: u64,
    pub pending_signal: Option<Signal>,
    /// Senders queued on the process, in arrival order
    pub callers: Vec<ProcNr>,
}

impl ProcInfo {
    pub fn is_runnable(&self) -> bool {
        self.rts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slot_is_not_runnable() {
        let p = Proc::free(7, Endpoint::new(7, 2));
        assert!(p.is_free());
        assert!(!p.is_runnable());
        assert_eq!(p.privilege.id, 7);
        assert_eq!(p.blocked_on(), None);
    }

    #[test]
    fn test_blocked_on_prefers_send_target() {
        let mut p = Proc::free(7, Endpoint::new(7, 0));
        p.rts = RtsFlags::SENDING | RtsFlags::RECEIVING;
        p.sendto = Endpoint::new(9, 0);
        p.getfrom = Endpoint::new(9, 0);
        assert_eq!(p.blocked_on(), Some(Endpoint::new(9, 0)));
        p.rts = RtsFlags::RECEIVING;
        p.getfrom = Endpoint::ANY;
        assert_eq!(p.blocked_on(), Some(Endpoint::ANY));
    }

    #[test]
    fn test_accounting_reset() {
        let mut acct = Accounting {
            time_in_queue: 5,
            dequeues: 2,
            ipc_sync: 1,
            ipc_async: 1,
            preempted: 3,
            enter_queue: Some(10),
        };
        acct.reset();
        assert_eq!(acct, Accounting::default());
    }
}

//! Synchronous and Asynchronous IPC
//!
//! Processes communicate with fixed-size messages. The primitives are:
//!
//! - `SEND` / `SENDNB`: deliver a message, blocking (or failing) until the
//!   destination receives it
//! - `RECEIVE`: wait for a message from one endpoint or from `ANY`
//! - `SENDREC`: send, then receive the reply from the same peer
//! - `NOTIFY`: a non-blocking, coalescing event
//! - `SENDA`: register a table of messages delivered when the receivers
//!   are ready
//!
//! # Architecture
//!
//! ```text
//!  Cpu::ipc_call ──► call::do_ipc ──► engine::{send, receive, sendrec}
//!                                 │         │
//!                                 │         └─► deadlock::check
//!                                 └─► asyncsend::senda
//!
//!  receive ──► notification bitmap ──► asyncsend::try_async ──► caller queue
//! ```
//!
//! Every path locks the processes it touches as one `ProcSet`. A message
//! that cannot be copied to the receiver right away is parked in the
//! receiver's `delivermsg` slot and copied out by `call::delivermsg` when
//! the receiver next returns to user mode.

pub mod asyncsend;
pub mod call;
pub mod deadlock;
pub mod engine;
pub mod message;

pub use message::{AsyncEntry, AsyncFlags, Message, NoQuantumReport};

use crate::mem::VirAddr;
use crate::proc::Endpoint;
use bitflags::bitflags;
use core::fmt;

/// Classical errno codes returned to user space
pub mod errno {
    pub const OK: i32 = 0;
    pub const EPERM: i32 = -1;
    pub const ESRCH: i32 = -3;
    pub const EFAULT: i32 = -14;
    pub const EINVAL: i32 = -22;
    pub const EDOM: i32 = -33;
    pub const EAGAIN: i32 = -35;
    pub const ELOCKED: i32 = -101;
    pub const EBADCALL: i32 = -102;
    pub const ECALLDENIED: i32 = -104;
    pub const EDEADSRCDST: i32 = -105;
    pub const ENOTREADY: i32 = -106;
    pub const EBADCPU: i32 = -108;
    pub const ETRAPDENIED: i32 = -110;
}

/// Errors returned by IPC operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Source or destination is dead or the endpoint is stale
    DeadSrcDst,
    /// Send mask forbids the destination
    CallDenied,
    /// Trap mask forbids the call
    TrapDenied,
    /// Blocking would close a cycle of waiting processes
    Deadlock,
    /// Non-blocking operation could not complete
    NotReady,
    /// Async table larger than allowed
    OutOfRange,
    /// Copy to or from process memory failed
    Fault,
    /// Unknown call number
    BadCall,
    Invalid,
    /// No async source had anything to deliver
    NoSource,
    /// Nothing to do right now
    Again,
    NotPermitted,
}

impl IpcError {
    pub const fn errno(self) -> i32 {
        match self {
            IpcError::DeadSrcDst => errno::EDEADSRCDST,
            IpcError::CallDenied => errno::ECALLDENIED,
            IpcError::TrapDenied => errno::ETRAPDENIED,
            IpcError::Deadlock => errno::ELOCKED,
            IpcError::NotReady => errno::ENOTREADY,
            IpcError::OutOfRange => errno::EDOM,
            IpcError::Fault => errno::EFAULT,
            IpcError::BadCall => errno::EBADCALL,
            IpcError::Invalid => errno::EINVAL,
            IpcError::NoSource => errno::ESRCH,
            IpcError::Again => errno::EAGAIN,
            IpcError::NotPermitted => errno::EPERM,
        }
    }

    pub fn from_errno(code: i32) -> Option<Self> {
        const ALL: [IpcError; 12] = [
            IpcError::DeadSrcDst,
            IpcError::CallDenied,
            IpcError::TrapDenied,
            IpcError::Deadlock,
            IpcError::NotReady,
            IpcError::OutOfRange,
            IpcError::Fault,
            IpcError::BadCall,
            IpcError::Invalid,
            IpcError::NoSource,
            IpcError::Again,
            IpcError::NotPermitted,
        ];
        ALL.into_iter().find(|e| e.errno() == code)
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self {
            IpcError::DeadSrcDst => "source or destination is dead",
            IpcError::CallDenied => "call denied by send mask",
            IpcError::TrapDenied => "call denied by trap mask",
            IpcError::Deadlock => "deadlock",
            IpcError::NotReady => "peer not ready",
            IpcError::OutOfRange => "async table too large",
            IpcError::Fault => "bad address",
            IpcError::BadCall => "bad call number",
            IpcError::Invalid => "invalid argument",
            IpcError::NoSource => "no async source",
            IpcError::Again => "try again",
            IpcError::NotPermitted => "not permitted",
        };
        f.write_str(what)
    }
}

pub type IpcResult<T> = Result<T, IpcError>;

/// Errno form of a result
pub fn result_code(result: IpcResult<()>) -> i32 {
    match result {
        Ok(()) => errno::OK,
        Err(e) => e.errno(),
    }
}

/// IPC call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcCall {
    Send = 1,
    Receive = 2,
    SendRec = 3,
    Notify = 4,
    SendNb = 5,
    SendA = 16,
}

impl IpcCall {
    pub fn from_number(nr: u32) -> Option<Self> {
        match nr {
            1 => Some(IpcCall::Send),
            2 => Some(IpcCall::Receive),
            3 => Some(IpcCall::SendRec),
            4 => Some(IpcCall::Notify),
            5 => Some(IpcCall::SendNb),
            16 => Some(IpcCall::SendA),
            _ => None,
        }
    }

    pub const fn number(self) -> u32 {
        self as u32
    }

    pub const fn name(self) -> &'static str {
        match self {
            IpcCall::Send => "SEND",
            IpcCall::Receive => "RECEIVE",
            IpcCall::SendRec => "SENDREC",
            IpcCall::Notify => "NOTIFY",
            IpcCall::SendNb => "SENDNB",
            IpcCall::SendA => "SENDA",
        }
    }
}

/// How the last message delivered to a process was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpcStatus {
    pub call: Option<IpcCall>,
    /// The kernel sent it on the sender's behalf
    pub from_kernel: bool,
}

impl IpcStatus {
    pub const fn new(call: IpcCall, from_kernel: bool) -> Self {
        IpcStatus {
            call: Some(call),
            from_kernel,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SendFlags: u32 {
        /// Fail with NotReady instead of blocking
        const NON_BLOCKING = 1 << 0;
        /// The kernel sends on the caller's behalf from a kernel buffer
        const FROM_KERNEL = 1 << 1;
    }
}

/// Where the message to send comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Address in the sender's memory
    User(VirAddr),
    /// Built by the kernel
    Kernel(Message),
}

/// A decoded IPC call as a process issues it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcRequest {
    Send { dst: Endpoint, msg: VirAddr },
    SendNb { dst: Endpoint, msg: VirAddr },
    SendRec { peer: Endpoint, msg: VirAddr },
    Receive { src: Endpoint, msg: VirAddr },
    Notify { dst: Endpoint },
    SendA { table: VirAddr, count: usize },
}

impl IpcRequest {
    pub fn call(&self) -> IpcCall {
        match self {
            IpcRequest::Send { .. } => IpcCall::Send,
            IpcRequest::SendNb { .. } => IpcCall::SendNb,
            IpcRequest::SendRec { .. } => IpcCall::SendRec,
            IpcRequest::Receive { .. } => IpcCall::Receive,
            IpcRequest::Notify { .. } => IpcCall::Notify,
            IpcRequest::SendA { .. } => IpcCall::SendA,
        }
    }

    /// Register form: call number, endpoint or count, address
    pub fn registers(&self) -> (u32, u64, u64) {
        let nr = self.call().number();
        match *self {
            IpcRequest::Send { dst, msg } | IpcRequest::SendNb { dst, msg } => {
                (nr, dst.raw() as u64, msg)
            }
            IpcRequest::SendRec { peer, msg } => (nr, peer.raw() as u64, msg),
            IpcRequest::Receive { src, msg } => (nr, src.raw() as u64, msg),
            IpcRequest::Notify { dst } => (nr, dst.raw() as u64, 0),
            IpcRequest::SendA { table, count } => (nr, count as u64, table),
        }
    }
}

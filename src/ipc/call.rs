//! IPC call entry and message delivery
//!
//! `do_ipc` validates a raw call (number, endpoint, privileges) before any
//! state changes and dispatches it. `delivermsg` copies a parked message to
//! the receiver's buffer on its way back to user mode.

use super::asyncsend::senda;
use super::engine::{notify, receive, send, sendrec};
use super::{IpcCall, IpcError, IpcResult, IpcStatus, Payload, SendFlags};
use crate::mem::VirAddr;
use crate::proc::{Endpoint, MiscFlags, ProcNr, ProcSet, ProcTable, RtsFlags, Signal};
use crate::sched::rts_set;

/// Perform IPC call `call_nr` for `caller`, which is locked alone
///
/// `r2` is the peer endpoint (or the entry count for SENDA), `r3` the
/// message (or table) address. The result is also stored in the caller's
/// `retval`.
pub(crate) fn do_ipc(set: &mut ProcSet, caller: ProcNr, call_nr: u32, r2: u64, r3: VirAddr) -> IpcResult<()> {
    let k = set.kernel();
    let me = set.cpu();
    k.percpu(me).locks.assert_no_timer_lock();

    {
        let p = set.get(caller);
        assert!(!p.is_free(), "ipc from free slot {}", caller);
        assert!(
            !p.misc.contains(MiscFlags::DELIVERMSG),
            "ipc from {:?} with an undelivered message",
            p.endpoint
        );
    }

    let result = match IpcCall::from_number(call_nr) {
        Some(IpcCall::SendA) => {
            set.get_mut(caller).acct.ipc_async += 1;
            let size = r2 as usize;
            if size > k.config().max_async_entries() {
                Err(IpcError::OutOfRange)
            } else {
                senda(set, caller, r3, size)
            }
        }
        Some(call) => {
            set.get_mut(caller).acct.ipc_sync += 1;
            do_sync_ipc(set, caller, call, Endpoint::from_raw(r2 as u32), r3)
        }
        None => Err(IpcError::BadCall),
    };

    set.relock(&[caller]);
    set.get_mut(caller).retval = super::result_code(result);
    if let Err(e) = result {
        crate::log_debug!(cpu = me; "ipc", "call {} from {} failed: {}", call_nr, set.get(caller).endpoint, e);
    }
    result
}

fn do_sync_ipc(
    set: &mut ProcSet,
    caller: ProcNr,
    call: IpcCall,
    peer_e: Endpoint,
    msg: VirAddr,
) -> IpcResult<()> {
    let k = set.kernel();

    let peer = if peer_e == Endpoint::ANY {
        if call != IpcCall::Receive {
            return Err(IpcError::Invalid);
        }
        None
    } else {
        let nr = k.procs().isokendpt(peer_e).ok_or(IpcError::DeadSrcDst)?;
        if call != IpcCall::Receive && !set.get(caller).privilege.may_send_to(nr) {
            return Err(IpcError::CallDenied);
        }
        Some(nr)
    };

    if !set.get(caller).privilege.trap_mask.allows(call) {
        return Err(IpcError::TrapDenied);
    }
    // Kernel tasks never receive; the only call aimed at them is RECEIVE
    if call != IpcCall::Receive && peer.is_some_and(ProcTable::is_kernel_task) {
        return Err(IpcError::TrapDenied);
    }

    if let Some(peer) = peer {
        set.relock(&[caller, peer]);
    }

    match call {
        IpcCall::Send => send(set, caller, peer_e, Payload::User(msg), SendFlags::empty()),
        IpcCall::SendNb => send(set, caller, peer_e, Payload::User(msg), SendFlags::NON_BLOCKING),
        IpcCall::SendRec => {
            set.get_mut(caller).delivermsg_addr = msg;
            sendrec(set, caller, peer_e, Payload::User(msg))
        }
        IpcCall::Receive => {
            let c = set.get_mut(caller);
            c.misc.remove(MiscFlags::REPLY_PEND);
            c.ipc_status = IpcStatus::default();
            c.delivermsg_addr = msg;
            receive(set, caller, peer_e, SendFlags::empty())
        }
        IpcCall::Notify => notify(set, caller, peer_e),
        IpcCall::SendA => Err(IpcError::BadCall),
    }
}

/// Outcome of copying a parked message out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Copy failed; the memory manager was asked to fix the buffer
    Retry,
    /// Second failure in a row; the process was signalled
    Killed,
}

/// Copy `nr`'s parked message to its buffer
pub(crate) fn delivermsg(set: &mut ProcSet, nr: ProcNr) -> Delivery {
    let k = set.kernel();
    let me = set.cpu();
    let p = set.get_mut(nr);
    assert!(p.misc.contains(MiscFlags::DELIVERMSG));
    assert!(p.delivermsg.source != Endpoint::NONE, "parked message has no source");

    let (space, addr, msg) = (p.endpoint, p.delivermsg_addr, p.delivermsg);
    match msg.write_to(k.memory(), space, addr) {
        Ok(()) => {
            p.delivermsg.source = Endpoint::NONE;
            p.misc.remove(MiscFlags::DELIVERMSG | MiscFlags::MSGFAILED);
            p.retval = super::errno::OK;
            Delivery::Delivered
        }
        Err(fault) if !p.misc.contains(MiscFlags::MSGFAILED) => {
            p.misc.insert(MiscFlags::MSGFAILED);
            crate::log_debug!(cpu = me; "ipc", "delivery to {} faulted at {:?}, asking for fixup", space, fault);
            if !k.memory().request_fixup(space, addr, super::message::MESSAGE_SIZE) {
                rts_set(set, nr, RtsFlags::VMREQUEST);
            }
            Delivery::Retry
        }
        Err(fault) => {
            crate::log_error!(cpu = me; "ipc", "delivery to {} failed twice ({:?}), killing it", space, fault);
            p.misc.remove(MiscFlags::DELIVERMSG | MiscFlags::MSGFAILED);
            p.pending_signal = Some(Signal::Segv);
            rts_set(set, nr, RtsFlags::SIGNALED);
            Delivery::Killed
        }
    }
}

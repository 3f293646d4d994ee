//! Synchronous message passing
//!
//! All functions here run with a `ProcSet` that already holds the
//! processes named in their arguments. `receive` from `ANY` is the one
//! operation that cannot know its peer in advance; it re-locks as it scans
//! and bounds the number of rescans (see `receive_any`).

use super::deadlock;
use super::{IpcCall, IpcError, IpcResult, IpcStatus, Message, Payload, SendFlags};
use crate::config::MAX_RECEIVE_RETRIES;
use crate::ipc::asyncsend;
use crate::kernel::Kernel;
use crate::proc::{BlockedOn, Endpoint, MiscFlags, Proc, ProcNr, ProcSet, RtsFlags, SYSTEM};
use crate::sched::{rts_set, rts_unset};

/// `dst` is blocked receiving and would accept a message from `src`
///
/// A process that is still queued sending (the first half of a SENDREC)
/// only accepts a message from the process it is sending to, which lets two
/// crossed SENDRECs meet.
pub fn will_receive(dst: &Proc, src: Endpoint) -> bool {
    dst.rts.contains(RtsFlags::RECEIVING)
        && (dst.getfrom == Endpoint::ANY || dst.getfrom == src)
        && (!dst.rts.contains(RtsFlags::SENDING) || dst.sendto == src)
}

/// Filter check shared with async delivery
#[inline]
pub fn can_receive(filter: Endpoint, src: Endpoint) -> bool {
    filter == Endpoint::ANY || filter == src
}

/// Endpoint that no longer names a live process
pub(crate) fn is_dead(p: &Proc, ep: Endpoint) -> bool {
    p.endpoint != ep || p.rts.intersects(RtsFlags::SLOT_FREE | RtsFlags::NO_ENDPOINT)
}

/// Park `msg` in `p`'s delivery slot
pub(crate) fn deliver(p: &mut Proc, msg: Message, status: IpcStatus) {
    assert!(
        !p.misc.contains(MiscFlags::DELIVERMSG),
        "{:?} already has an undelivered message",
        p.endpoint
    );
    p.delivermsg = msg;
    p.misc.insert(MiscFlags::DELIVERMSG);
    p.ipc_status = status;
}

fn fetch(k: &Kernel, sender: Endpoint, payload: Payload) -> IpcResult<Message> {
    let mut msg = match payload {
        Payload::Kernel(msg) => msg,
        Payload::User(addr) => {
            Message::read_from(k.memory(), sender, addr).map_err(|_| IpcError::Fault)?
        }
    };
    msg.source = sender;
    Ok(msg)
}

/// Append `who` to `owner`'s caller queue
pub(crate) fn queue_append(set: &mut ProcSet, owner: ProcNr, who: ProcNr) {
    let procs = set.kernel().procs();
    procs.slot(who).set_q_link(None);
    match set.get(owner).caller_q {
        None => set.get_mut(owner).caller_q = Some(who),
        Some(mut cur) => {
            while let Some(next) = procs.slot(cur).q_link() {
                assert_ne!(cur, who, "proc {} queued twice on {}", who, owner);
                cur = next;
            }
            procs.slot(cur).set_q_link(Some(who));
        }
    }
}

/// Remove `who` from `owner`'s caller queue; false if it was not there
pub(crate) fn queue_unlink(set: &mut ProcSet, owner: ProcNr, who: ProcNr) -> bool {
    let procs = set.kernel().procs();
    let head = set.get(owner).caller_q;
    if head == Some(who) {
        set.get_mut(owner).caller_q = procs.slot(who).q_link();
        procs.slot(who).set_q_link(None);
        return true;
    }
    let mut cur = head;
    while let Some(c) = cur {
        let next = procs.slot(c).q_link();
        if next == Some(who) {
            procs.slot(c).set_q_link(procs.slot(who).q_link());
            procs.slot(who).set_q_link(None);
            return true;
        }
        cur = next;
    }
    false
}

/// Senders queued on `owner`, head first
pub(crate) fn queue_members(set: &ProcSet, owner: ProcNr) -> alloc::vec::Vec<ProcNr> {
    let procs = set.kernel().procs();
    let mut out = alloc::vec::Vec::new();
    let mut cur = set.get(owner).caller_q;
    while let Some(c) = cur {
        out.push(c);
        cur = procs.slot(c).q_link();
    }
    out
}

/// Send `payload` from `caller` to `dst_e`; both are locked
pub(crate) fn send(
    set: &mut ProcSet,
    caller: ProcNr,
    dst_e: Endpoint,
    payload: Payload,
    flags: SendFlags,
) -> IpcResult<()> {
    let k = set.kernel();
    let dst = dst_e.slot();
    let caller_e = set.get(caller).endpoint;

    if is_dead(set.get(dst), dst_e) {
        return Err(IpcError::DeadSrcDst);
    }

    if will_receive(set.get(dst), caller_e) {
        let msg = fetch(k, caller_e, payload)?;
        let call = if set.get(caller).misc.contains(MiscFlags::REPLY_PEND) {
            IpcCall::SendRec
        } else if flags.contains(SendFlags::NON_BLOCKING) {
            IpcCall::SendNb
        } else {
            IpcCall::Send
        };
        let d = set.get_mut(dst);
        deliver(d, msg, IpcStatus::new(call, flags.contains(SendFlags::FROM_KERNEL)));
        d.misc.remove(MiscFlags::REPLY_PEND);
        rts_unset(set, dst, RtsFlags::RECEIVING);
    } else {
        if flags.contains(SendFlags::NON_BLOCKING) {
            return Err(IpcError::NotReady);
        }

        let slot = set.slot(caller);
        slot.announce(BlockedOn {
            target: dst_e,
            sending: true,
            receiving: false,
            reply_pend: set.get(caller).misc.contains(MiscFlags::REPLY_PEND),
        });
        if deadlock::check(set, caller, dst_e, IpcCall::Send) > 0 {
            slot.publish(set.get(caller));
            return Err(IpcError::Deadlock);
        }
        let msg = match fetch(k, caller_e, payload) {
            Ok(msg) => msg,
            Err(e) => {
                slot.publish(set.get(caller));
                return Err(e);
            }
        };

        let c = set.get_mut(caller);
        c.sendmsg = msg;
        if flags.contains(SendFlags::FROM_KERNEL) {
            c.misc.insert(MiscFlags::SENDING_FROM_KERNEL);
        }
        c.sendto = dst_e;
        rts_set(set, caller, RtsFlags::SENDING);
        queue_append(set, dst, caller);
    }

    set.get_mut(dst).new_message = true;
    k.metrics().inc_sends();
    Ok(())
}

/// SEND then RECEIVE from the same peer, without dropping the locks
pub(crate) fn sendrec(
    set: &mut ProcSet,
    caller: ProcNr,
    peer_e: Endpoint,
    payload: Payload,
) -> IpcResult<()> {
    set.get_mut(caller).misc.insert(MiscFlags::REPLY_PEND);
    if let Err(e) = send(set, caller, peer_e, payload, SendFlags::empty()) {
        set.get_mut(caller).misc.remove(MiscFlags::REPLY_PEND);
        return Err(e);
    }
    receive(set, caller, peer_e, SendFlags::empty())
}

/// Receive into `caller`'s delivery slot
///
/// For a specific source the set must hold `caller` and the source. For
/// `ANY` only `caller` is required; the set is re-locked while scanning.
pub(crate) fn receive(
    set: &mut ProcSet,
    caller: ProcNr,
    src_e: Endpoint,
    flags: SendFlags,
) -> IpcResult<()> {
    let pc = set.kernel().percpu(set.cpu());
    pc.count_receive(src_e == Endpoint::ANY);
    if src_e == Endpoint::ANY {
        receive_any(set, caller, flags)
    } else {
        receive_from(set, caller, src_e, flags)
    }
}

fn receive_done(set: &mut ProcSet, caller: ProcNr) -> IpcResult<()> {
    set.get_mut(caller).misc.remove(MiscFlags::REPLY_PEND);
    set.kernel().metrics().inc_receives();
    Ok(())
}

fn receive_from(set: &mut ProcSet, caller: ProcNr, src_e: Endpoint, flags: SendFlags) -> IpcResult<()> {
    let src = src_e.slot();
    if is_dead(set.get(src), src_e) {
        return Err(IpcError::DeadSrcDst);
    }

    let c = set.get(caller);
    if !c.rts.contains(RtsFlags::SENDING) {
        let caller_e = c.endpoint;

        if !c.misc.contains(MiscFlags::REPLY_PEND) && c.privilege.notify_pending.get(src) {
            deliver_pending_notify(set, caller, src);
            return receive_done(set, caller);
        }

        if set.get(caller).privilege.asyn_pending.get(src)
            && !set.get(src).rts.contains(RtsFlags::VMINHIBIT)
            && asyncsend::try_one(set, src_e, src, caller).is_ok()
        {
            return receive_done(set, caller);
        }

        let s = set.get(src);
        if s.rts.contains(RtsFlags::SENDING) && s.sendto == caller_e {
            take_from_queue(set, caller, src);
            return receive_done(set, caller);
        }
    }

    set_waiting_receiving(set, caller, src_e, flags)
}

/// Receive from whichever source is ready first
///
/// Scanning the queue head or an async source needs that source's lock,
/// so the caller's lock is dropped in between. A sender that arrives
/// meanwhile sets `new_message`; the scan restarts at most
/// `MAX_RECEIVE_RETRIES` times for it or for a non-empty caller queue.
/// After that the caller queue head is taken without another scan. The
/// final decision to block is made under the caller's lock after a precise
/// check of the caller queue and the notification bitmap, so no synchronous
/// sender or notification can be missed. If an async pending bit may have
/// been set since the last scan (`new_message` is up), the caller blocks
/// first and then pulls the entry itself; stale bits cost nothing.
fn receive_any(set: &mut ProcSet, caller: ProcNr, flags: SendFlags) -> IpcResult<()> {
    let k = set.kernel();
    let mut tries = 0;

    loop {
        set.relock(&[caller]);
        let c = set.get_mut(caller);
        if c.rts.contains(RtsFlags::SENDING) {
            break;
        }
        c.new_message = false;

        if !c.misc.contains(MiscFlags::REPLY_PEND) {
            if let Some(src) = c.privilege.notify_pending.first_set() {
                deliver_pending_notify(set, caller, src);
                return receive_done(set, caller);
            }
        }

        if !set.get(caller).privilege.asyn_pending.is_empty()
            && asyncsend::try_async(set, caller).is_ok()
        {
            return receive_done(set, caller);
        }

        set.relock(&[caller]);
        if let Some(head) = set.get(caller).caller_q {
            set.relock(&[caller, head]);
            if set.get(caller).caller_q == Some(head) {
                take_from_queue(set, caller, head);
                return receive_done(set, caller);
            }
            // The head left the queue while unlocked; rechecked below
        }

        let c = set.get(caller);
        if (c.new_message || c.caller_q.is_some()) && tries < MAX_RECEIVE_RETRIES {
            tries += 1;
            k.metrics().inc_receive_retries();
            continue;
        }

        // Past the retry bound the queue head is taken without restarting
        while let Some(head) = set.get(caller).caller_q {
            set.relock(&[caller, head]);
            if set.get(caller).caller_q == Some(head) {
                take_from_queue(set, caller, head);
                return receive_done(set, caller);
            }
        }
        let c = set.get(caller);
        if !c.misc.contains(MiscFlags::REPLY_PEND) {
            if let Some(src) = c.privilege.notify_pending.first_set() {
                deliver_pending_notify(set, caller, src);
                return receive_done(set, caller);
            }
        }
        break;
    }

    // Still holding the caller since the final check
    let c = set.get(caller);
    let async_raced = c.new_message && !c.privilege.asyn_pending.is_empty();
    set_waiting_receiving(set, caller, Endpoint::ANY, flags)?;
    if async_raced {
        asyncsend::offer_to_blocked(set, caller);
    }
    Ok(())
}

/// Hand the queued message of `src` to `caller`
fn take_from_queue(set: &mut ProcSet, caller: ProcNr, src: ProcNr) {
    let (c, s) = set.pair_mut(caller, src);
    assert!(s.rts.contains(RtsFlags::SENDING) && s.sendto == c.endpoint);

    let mut msg = s.sendmsg;
    msg.source = s.endpoint;
    let from_kernel = s.misc.contains(MiscFlags::SENDING_FROM_KERNEL);
    s.misc.remove(MiscFlags::SENDING_FROM_KERNEL);
    let call = if s.misc.contains(MiscFlags::REPLY_PEND) {
        IpcCall::SendRec
    } else {
        IpcCall::Send
    };
    deliver(c, msg, IpcStatus::new(call, from_kernel));

    let unlinked = queue_unlink(set, caller, src);
    assert!(unlinked, "sender {} missing from caller queue of {}", src, caller);
    set.get_mut(src).sendto = Endpoint::NONE;
    rts_unset(set, src, RtsFlags::SENDING);
}

fn set_waiting_receiving(
    set: &mut ProcSet,
    caller: ProcNr,
    src_e: Endpoint,
    flags: SendFlags,
) -> IpcResult<()> {
    if flags.contains(SendFlags::NON_BLOCKING) {
        return Err(IpcError::NotReady);
    }

    if src_e != Endpoint::ANY {
        let slot = set.slot(caller);
        let c = set.get(caller);
        let sending = c.rts.contains(RtsFlags::SENDING);
        slot.announce(BlockedOn {
            target: if sending { c.sendto } else { src_e },
            sending,
            receiving: true,
            reply_pend: c.misc.contains(MiscFlags::REPLY_PEND),
        });
        if deadlock::check(set, caller, src_e, IpcCall::Receive) > 0 {
            slot.publish(set.get(caller));
            return Err(IpcError::Deadlock);
        }
    }

    set.get_mut(caller).getfrom = src_e;
    rts_set(set, caller, RtsFlags::RECEIVING);
    Ok(())
}

/// Build the notification `src` sends to `dst`
fn notify_message(k: &Kernel, src: ProcNr, dst: &mut Proc) -> Message {
    let sigs = if src == SYSTEM {
        core::mem::take(&mut dst.privilege.sig_pending)
    } else {
        0
    };
    Message::notify(k.procs().endpoint(src), k.clock().uptime(), sigs)
}

fn deliver_pending_notify(set: &mut ProcSet, caller: ProcNr, src: ProcNr) {
    let k = set.kernel();
    let c = set.get_mut(caller);
    c.privilege.notify_pending.unset(src);
    let msg = notify_message(k, src, c);
    deliver(c, msg, IpcStatus::new(IpcCall::Notify, false));
}

/// Notify `dst_e` on behalf of `src`; only the destination must be locked
///
/// `src` may be a kernel task, which is never locked.
pub(crate) fn notify(set: &mut ProcSet, src: ProcNr, dst_e: Endpoint) -> IpcResult<()> {
    let k = set.kernel();
    let dst = dst_e.slot();
    let src_e = k.procs().endpoint(src);

    if dst >= k.procs().len() || is_dead(set.get(dst), dst_e) {
        return Err(IpcError::DeadSrcDst);
    }
    k.metrics().inc_notifies();

    let d = set.get_mut(dst);
    d.new_message = true;
    if will_receive(d, src_e) && !d.misc.contains(MiscFlags::REPLY_PEND) {
        let msg = notify_message(k, src, d);
        deliver(d, msg, IpcStatus::new(IpcCall::Notify, false));
        rts_unset(set, dst, RtsFlags::RECEIVING);
    } else {
        d.privilege.notify_pending.set(src);
        k.metrics().inc_notifies_coalesced();
    }
    Ok(())
}

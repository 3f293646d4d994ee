//! Asynchronous message tables
//!
//! A process registers a table of `AsyncEntry` values in its own memory
//! with SENDA. Entries whose receiver is already waiting are delivered on
//! the spot; for the rest the receiver gets a bit in its `asyn_pending`
//! map and pulls the entry itself with `try_one` when it next receives.
//! Results are written back into the sender's table. The kernel only
//! touches the table through bounded copies, so a sender rewriting it
//! concurrently can at worst confuse its own results.
//!
//! While SENDA walks the table it is not yet registered. A receiver on
//! another CPU that finds its pending bit during the walk leaves the bit
//! set. Once the table is registered, SENDA raises `new_message` on every
//! receiver it parked an entry for and hands those already blocked their
//! entry itself. A receiver that blocks after seeing `new_message` pulls
//! the entry with `offer_to_blocked`.
//!
//! # Table state
//!
//! An entry moves from VALID to VALID|DONE exactly once. The table
//! descriptor stays registered while any entry is outstanding and is
//! dropped by the first scan that finds none.

use super::engine::{can_receive, deliver, notify, will_receive};
use super::{AsyncEntry, AsyncFlags, IpcCall, IpcError, IpcResult, IpcStatus};
use crate::mem::VirAddr;
use crate::proc::{AsyncTable, Endpoint, MiscFlags, PrivFlags, ProcNr, ProcSet, ProcTable, RtsFlags, SysMap, ASYNCM};
use crate::sched::rts_unset;

/// Register and process the async table of `caller`
///
/// Only `caller` needs to be locked on entry. Each entry is handled with
/// {caller, destination} locked.
pub(crate) fn senda(set: &mut ProcSet, caller: ProcNr, table: VirAddr, size: usize) -> IpcResult<()> {
    let k = set.kernel();
    let caller_e = set.get(caller).endpoint;

    if size == 0 {
        set.get_mut(caller).privilege.asyn = AsyncTable::empty();
        return Ok(());
    }
    if size > k.config().max_async_entries() {
        return Err(IpcError::OutOfRange);
    }
    set.get_mut(caller).privilege.asyn = AsyncTable::registering(caller_e);

    let mut done = true;
    let mut parked = SysMap::empty();
    let mut do_notify = false;
    let mut i = 0;

    while i < size {
        set.relock(&[caller]);
        let entry = match AsyncEntry::read(k.memory(), caller_e, table, i) {
            Ok(entry) => entry,
            Err(fault) => {
                crate::log_warn!(cpu = set.cpu(); "ipc", "senda from {}: entry {} unreadable: {:?}", caller_e, i, fault);
                i += 1;
                continue;
            }
        };
        if entry.flags == 0 {
            i += 1;
            continue;
        }
        let flags = match entry.checked_flags() {
            Ok(flags) if flags.contains(AsyncFlags::VALID) => flags,
            _ => {
                crate::log_warn!(cpu = set.cpu(); "ipc", "senda from {}: entry {} to {} invalid", caller_e, i, entry.dst);
                i += 1;
                continue;
            }
        };
        if flags.contains(AsyncFlags::DONE) {
            i += 1;
            continue;
        }

        let dst_e = if entry.dst == Endpoint::SELF { caller_e } else { entry.dst };
        let dst = k.procs().isokendpt(dst_e);

        match dst {
            Some(dst) => set.relock(&[caller, dst]),
            None => set.relock(&[caller]),
        }
        // The sender may have rewritten the entry while nothing was locked
        let entry = match AsyncEntry::read(k.memory(), caller_e, table, i) {
            Ok(again) if again.flags == entry.flags => again,
            _ => continue,
        };

        let result = match dst {
            None => Err(IpcError::DeadSrcDst),
            Some(dst) if ProcTable::is_kernel_task(dst) => Err(IpcError::CallDenied),
            Some(dst) if !set.get(caller).privilege.may_send_to(dst) => Err(IpcError::CallDenied),
            Some(dst) if super::engine::is_dead(set.get(dst), dst_e) => Err(IpcError::DeadSrcDst),
            Some(_) => Ok(()),
        };

        if let (Ok(()), Some(dst)) = (result, dst) {
            let d = set.get_mut(dst);
            d.new_message = true;
            let noreply_blocked = flags.contains(AsyncFlags::NOREPLY) && d.misc.contains(MiscFlags::REPLY_PEND);
            if will_receive(d, caller_e) && !noreply_blocked {
                let mut msg = entry.msg;
                msg.source = caller_e;
                deliver(d, msg, IpcStatus::new(IpcCall::SendA, false));
                rts_unset(set, dst, RtsFlags::RECEIVING);
                k.metrics().inc_async_deliveries();
            } else {
                d.privilege.asyn_pending.set(caller);
                parked.set(dst);
                done = false;
                i += 1;
                continue;
            }
        }

        do_notify |= store_result(set, caller_e, table, i, entry, result);
        i += 1;
    }

    set.relock(&[caller]);
    if do_notify {
        // The caller is locked; the notification comes from ASYNCM
        let _ = notify(set, ASYNCM, caller_e);
    }
    if done {
        set.get_mut(caller).privilege.asyn = AsyncTable::empty();
        return Ok(());
    }
    set.get_mut(caller).privilege.asyn = AsyncTable {
        addr: table,
        size,
        endpoint: caller_e,
    };

    offer_parked(set, caller, parked);
    set.relock(&[caller]);
    Ok(())
}

/// Revisit the receivers `caller` parked entries for during its walk
///
/// Each receiver is handled with {caller, receiver} locked.
fn offer_parked(set: &mut ProcSet, caller: ProcNr, parked: SysMap) {
    let k = set.kernel();
    let caller_e = k.procs().slot(caller).endpoint();
    for dst in parked.iter() {
        set.relock(&[caller, dst]);
        let d = set.get_mut(dst);
        if !d.privilege.asyn_pending.get(caller) {
            continue;
        }
        // A receiver still scanning takes the entry before or right after it blocks
        d.new_message = true;
        if !will_receive(d, caller_e) {
            continue;
        }
        let filter = d.getfrom;
        if try_one(set, filter, caller, dst).is_ok() {
            rts_unset(set, dst, RtsFlags::RECEIVING);
        }
    }
}

/// Mark entry `i` done with `result`; true if the sender wants a notification
fn store_result(
    set: &ProcSet,
    sender: Endpoint,
    table: VirAddr,
    i: usize,
    mut entry: AsyncEntry,
    result: IpcResult<()>,
) -> bool {
    let k = set.kernel();
    let flags = AsyncFlags::from_bits_retain(entry.flags);
    entry.result = super::result_code(result);
    entry.flags |= AsyncFlags::DONE.bits();
    if let Err(fault) = entry.write_status(k.memory(), sender, table, i) {
        crate::log_warn!(cpu = set.cpu(); "ipc", "async result for {} entry {} lost: {:?}", sender, i, fault);
    }
    flags.contains(AsyncFlags::NOTIFY) || (result.is_err() && flags.contains(AsyncFlags::NOTIFY_ERR))
}

/// Deliver the first entry of `src`'s table that `dst` accepts
///
/// `src` and `dst` are locked. `filter` is the source `dst` receives from.
pub(crate) fn try_one(set: &mut ProcSet, filter: Endpoint, src: ProcNr, dst: ProcNr) -> IpcResult<()> {
    let k = set.kernel();
    let s = set.get(src);
    if !s.privilege.flags.contains(PrivFlags::SYS_PROC) {
        return Err(IpcError::NotPermitted);
    }
    let src_e = s.endpoint;
    let AsyncTable { addr: table, size, endpoint } = s.privilege.asyn;
    let allowed = s.privilege.may_send_to(dst);

    if s.privilege.asyn.is_registering(src_e) {
        // The bit stays; senda delivers once the table is registered
        return Err(IpcError::Again);
    }
    set.get_mut(dst).privilege.asyn_pending.unset(src);

    if size == 0 || endpoint != src_e {
        return Err(IpcError::Again);
    }
    if !allowed {
        return Err(IpcError::CallDenied);
    }

    let dst_e = set.get(dst).endpoint;
    let mut done = true;
    let mut do_notify = false;
    let mut r = Err(IpcError::Again);

    for i in 0..size {
        let entry = AsyncEntry::read(k.memory(), src_e, table, i).map_err(|_| IpcError::Fault)?;
        if entry.flags == 0 {
            continue;
        }
        let flags = entry.checked_flags().ok().filter(|f| f.contains(AsyncFlags::VALID));
        if flags.is_some_and(|f| f.contains(AsyncFlags::DONE)) {
            continue;
        }
        done = false;

        let Some(flags) = flags else {
            // Fail the malformed entry and keep looking
            do_notify |= store_result(set, src_e, table, i, entry, Err(IpcError::Invalid));
            continue;
        };
        if entry.dst != dst_e || !can_receive(filter, src_e) {
            continue;
        }
        let d = set.get_mut(dst);
        if flags.contains(AsyncFlags::NOREPLY) && d.misc.contains(MiscFlags::REPLY_PEND) {
            continue;
        }
        let mut msg = entry.msg;
        msg.source = src_e;
        deliver(d, msg, IpcStatus::new(IpcCall::SendA, false));
        k.metrics().inc_async_deliveries();
        r = Ok(());

        do_notify |= store_result(set, src_e, table, i, entry, r);
        break;
    }

    if do_notify {
        let _ = notify(set, ASYNCM, src_e);
    }
    if done {
        set.get_mut(src).privilege.asyn = AsyncTable::empty();
    } else {
        set.get_mut(dst).privilege.asyn_pending.set(src);
    }
    r
}

/// Deliver from any source with a pending bit for `caller`
///
/// Only `caller` needs to be locked on entry; the set holds {caller, src}
/// for the last source tried on return.
pub(crate) fn try_async(set: &mut ProcSet, caller: ProcNr) -> IpcResult<()> {
    let k = set.kernel();
    let pending = set.get(caller).privilege.asyn_pending;

    for src in pending.iter() {
        if src >= k.procs().len() || k.procs().slot(src).rts().contains(RtsFlags::SLOT_FREE) {
            continue;
        }
        set.relock(&[caller, src]);
        if !set.get(caller).privilege.asyn_pending.get(src) {
            continue;
        }
        if set.get(src).rts.contains(RtsFlags::VMINHIBIT) {
            continue;
        }
        if try_one(set, Endpoint::ANY, src, caller).is_ok() {
            return Ok(());
        }
    }
    Err(IpcError::NoSource)
}

/// Hand `dst`, which has just blocked receiving, one pending async entry
///
/// `dst` is locked on entry; the set holds {dst, src} for the last source
/// tried on return.
pub(crate) fn offer_to_blocked(set: &mut ProcSet, dst: ProcNr) {
    let k = set.kernel();
    let pending = set.get(dst).privilege.asyn_pending;

    for src in pending.iter() {
        if src >= k.procs().len() || k.procs().slot(src).rts().contains(RtsFlags::SLOT_FREE) {
            continue;
        }
        set.relock(&[dst, src]);
        let s = set.get(src);
        if s.rts.contains(RtsFlags::VMINHIBIT) {
            continue;
        }
        let src_e = s.endpoint;
        let d = set.get(dst);
        if !d.privilege.asyn_pending.get(src) || !will_receive(d, src_e) {
            continue;
        }
        let filter = d.getfrom;
        if try_one(set, filter, src, dst).is_ok() {
            rts_unset(set, dst, RtsFlags::RECEIVING);
            return;
        }
    }
}

/// Fail every undelivered entry `src` addressed to `dst`
///
/// Used when `dst` exits. Both are locked. Entries for other receivers are
/// left alone and keep the table registered.
pub(crate) fn cancel_async(set: &mut ProcSet, src: ProcNr, dst: ProcNr) -> IpcResult<()> {
    let k = set.kernel();
    let s = set.get(src);
    if !s.privilege.flags.contains(PrivFlags::SYS_PROC) {
        return Err(IpcError::NotPermitted);
    }
    let src_e = s.endpoint;
    let AsyncTable { addr: table, size, .. } = s.privilege.asyn;
    let allowed = s.privilege.may_send_to(dst);
    let registering = s.privilege.asyn.is_registering(src_e);

    set.get_mut(dst).privilege.asyn_pending.unset(src);
    if registering {
        // senda skips the dead destination from here on
        return Err(IpcError::Again);
    }
    set.get_mut(src).privilege.asyn = AsyncTable::empty();

    if size == 0 {
        return Err(IpcError::Again);
    }
    if !allowed {
        return Err(IpcError::CallDenied);
    }

    let dst_e = set.get(dst).endpoint;
    let mut done = true;
    let mut do_notify = false;

    for i in 0..size {
        let Ok(entry) = AsyncEntry::read(k.memory(), src_e, table, i) else {
            continue;
        };
        if entry.flags == 0 {
            continue;
        }
        let r = match entry.checked_flags() {
            Ok(f) if !f.contains(AsyncFlags::VALID) => Err(IpcError::Invalid),
            Ok(f) if f.contains(AsyncFlags::DONE) => continue,
            Ok(_) => Err(IpcError::DeadSrcDst),
            Err(e) => Err(e),
        };
        if entry.dst != dst_e {
            done = false;
            continue;
        }
        do_notify |= store_result(set, src_e, table, i, entry, r);
    }

    if do_notify {
        let _ = notify(set, ASYNCM, src_e);
    }
    if !done {
        set.get_mut(src).privilege.asyn = AsyncTable {
            addr: table,
            size,
            endpoint: src_e,
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{IpcRequest, Message};
    use crate::kernel::{Completion, Kernel};
    use crate::mem::{SparseMemory, PAGE_SIZE};
    use crate::sched::rts_set;
    use crate::{BootConfig, ProcSpec};
    use alloc::sync::Arc;

    const MSG: VirAddr = 0x1000;
    const TABLE: VirAddr = 0x8000;

    /// Boot with a sender whose one-entry table targets a receiver
    fn setup() -> (Kernel, Arc<SparseMemory>, Endpoint, Endpoint) {
        let mem = Arc::new(SparseMemory::new());
        let k = Kernel::boot(BootConfig::default(), mem.clone()).unwrap();
        let s = k.cpu(0).spawn(ProcSpec::new("sender")).unwrap();
        let r = k.cpu(0).spawn(ProcSpec::new("receiver")).unwrap();
        for ep in [s, r] {
            mem.map(ep, MSG, PAGE_SIZE as usize, true).unwrap();
            mem.map(ep, TABLE, PAGE_SIZE as usize, true).unwrap();
        }
        let mut m = Message::new(0x40);
        m.put_u32(0, 7);
        AsyncEntry::new(r, AsyncFlags::VALID, m).write(&*mem, s, TABLE, 0).unwrap();
        (k, mem, s, r)
    }

    fn registered(s: Endpoint) -> AsyncTable {
        AsyncTable {
            addr: TABLE,
            size: 1,
            endpoint: s,
        }
    }

    #[test]
    fn test_registration_wakes_scanning_receiver() {
        let (k, mem, s, r) = setup();
        let (sn, rn) = (s.slot(), r.slot());
        let mut set = ProcSet::acquire(&k, 0, &[sn, rn]);
        set.get_mut(sn).privilege.asyn = AsyncTable::registering(s);
        set.get_mut(rn).privilege.asyn_pending.set(sn);

        // The receiver scans while the table is being walked
        set.get_mut(rn).new_message = false;
        assert_eq!(try_one(&mut set, Endpoint::ANY, sn, rn), Err(IpcError::Again));
        assert!(set.get(rn).privilege.asyn_pending.get(sn));

        set.get_mut(sn).privilege.asyn = registered(s);
        let mut parked = SysMap::empty();
        parked.set(rn);
        offer_parked(&mut set, sn, parked);
        let rp = set.get(rn);
        assert!(rp.new_message);
        assert!(rp.privilege.asyn_pending.get(sn));
        assert!(!rp.misc.contains(MiscFlags::DELIVERMSG));
        set.release();

        let cpu = k.cpu(0);
        assert_eq!(
            cpu.ipc_call(r, IpcRequest::Receive { src: Endpoint::ANY, msg: MSG }),
            Ok(Completion::Done)
        );
        let m = Message::read_from(&*mem, r, MSG).unwrap();
        assert_eq!(m.source, s);
        assert_eq!(m.get_u32(0), 7);
    }

    #[test]
    fn test_registration_serves_blocked_receiver() {
        let (k, mem, s, r) = setup();
        let (sn, rn) = (s.slot(), r.slot());
        let mut set = ProcSet::acquire(&k, 0, &[sn, rn]);
        set.get_mut(sn).privilege.asyn = registered(s);
        set.get_mut(rn).privilege.asyn_pending.set(sn);
        set.get_mut(rn).getfrom = Endpoint::ANY;
        rts_set(&mut set, rn, RtsFlags::RECEIVING);

        let mut parked = SysMap::empty();
        parked.set(rn);
        offer_parked(&mut set, sn, parked);
        assert!(set.get(rn).is_runnable());
        assert!(set.get(rn).misc.contains(MiscFlags::DELIVERMSG));
        set.release();

        assert_eq!(k.cpu(0).resume(r), Ok(0));
        assert_eq!(Message::read_from(&*mem, r, MSG).unwrap().get_u32(0), 7);
    }

    #[test]
    fn test_blocked_receiver_pulls_raced_entry() {
        let (k, mem, s, r) = setup();
        let (sn, rn) = (s.slot(), r.slot());
        let mut set = ProcSet::acquire(&k, 0, &[rn]);
        set.get_mut(rn).privilege.asyn_pending.set(sn);
        set.get_mut(rn).getfrom = Endpoint::ANY;
        rts_set(&mut set, rn, RtsFlags::RECEIVING);
        set.relock(&[sn]);
        set.get_mut(sn).privilege.asyn = registered(s);

        set.relock(&[rn]);
        offer_to_blocked(&mut set, rn);
        assert!(set.get(rn).is_runnable());
        assert!(set.get(rn).misc.contains(MiscFlags::DELIVERMSG));
        set.release();

        assert_eq!(k.cpu(0).resume(r), Ok(0));
        assert_eq!(Message::read_from(&*mem, r, MSG).unwrap().source, s);
    }

    #[test]
    fn test_offer_skips_receiver_filtering_elsewhere() {
        let (k, _mem, s, r) = setup();
        let (sn, rn) = (s.slot(), r.slot());
        let mut set = ProcSet::acquire(&k, 0, &[sn, rn]);
        set.get_mut(sn).privilege.asyn = registered(s);
        set.get_mut(rn).privilege.asyn_pending.set(sn);
        set.get_mut(rn).getfrom = Endpoint::new(crate::proc::SYSTEM, 0);
        rts_set(&mut set, rn, RtsFlags::RECEIVING);

        set.relock(&[rn]);
        offer_to_blocked(&mut set, rn);
        assert!(set.get(rn).rts.contains(RtsFlags::RECEIVING));
        assert!(set.get(rn).privilege.asyn_pending.get(sn));
    }
}

//! Process Exit Integration Tests
//!
//! Tests that an exiting process releases everyone blocked on it, drops
//! what it left pending and leaves a slot whose old endpoint is dead.

mod common;

use common::*;
use mellos_ipc_core::ipc::{errno, AsyncEntry, AsyncFlags};
use mellos_ipc_core::{BootConfig, Completion, Endpoint, IpcError, IpcRequest, Message, ProcSpec, RtsFlags};

/// Test that a blocked sender is woken with a dead-destination error
#[test]
fn test_exit_wakes_blocked_sender() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let s = spawn(&cpu, &mem, ProcSpec::new("sender"));
    let d = spawn(&cpu, &mem, ProcSpec::new("dest"));

    assert_eq!(
        cpu.ipc_call(s, IpcRequest::Send { dst: d, msg: MSG }),
        Ok(Completion::Blocked)
    );
    assert_eq!(cpu.inspect(d).unwrap().callers, vec![s.slot()]);

    cpu.exit(d).unwrap();
    let info = cpu.inspect(s).unwrap();
    assert!(info.is_runnable());
    assert_eq!(info.retval, errno::EDEADSRCDST);
    assert_eq!(wait(&cpu, s), Err(IpcError::DeadSrcDst));
}

/// Test that receivers waiting for the exiting process in particular are
/// woken, and receivers waiting for anyone are not
#[test]
fn test_exit_wakes_specific_receivers_only() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let x = spawn(&cpu, &mem, ProcSpec::new("x"));
    let from_x = spawn(&cpu, &mem, ProcSpec::new("from-x"));
    let from_any = spawn(&cpu, &mem, ProcSpec::new("from-any"));

    assert_eq!(
        cpu.ipc_call(from_x, IpcRequest::Receive { src: x, msg: MSG }),
        Ok(Completion::Blocked)
    );
    assert_eq!(
        cpu.ipc_call(from_any, IpcRequest::Receive { src: Endpoint::ANY, msg: MSG }),
        Ok(Completion::Blocked)
    );

    cpu.exit(x).unwrap();
    assert_eq!(wait(&cpu, from_x), Err(IpcError::DeadSrcDst));
    assert!(cpu.inspect(from_any).unwrap().rts.contains(RtsFlags::RECEIVING));
}

/// Test that a client waiting for its reply is released when the server dies
#[test]
fn test_server_exit_releases_client() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let client = spawn(&cpu, &mem, ProcSpec::new("client"));
    let server = spawn(&cpu, &mem, ProcSpec::new("server"));

    write_msg(&*mem, client, &text_message(1, "request"));
    assert_eq!(
        cpu.ipc_call(client, IpcRequest::SendRec { peer: server, msg: MSG }),
        Ok(Completion::Blocked)
    );
    assert_eq!(receive(&cpu, server, Endpoint::ANY), Ok(()));
    assert_eq!(text(&read_msg(&*mem, server)), "request");
    assert!(cpu.inspect(client).unwrap().rts.contains(RtsFlags::RECEIVING));

    cpu.exit(server).unwrap();
    assert_eq!(wait(&cpu, client), Err(IpcError::DeadSrcDst));
}

/// Test that notifications and async messages of the exiting process are
/// dropped at their receivers
#[test]
fn test_exit_drops_pending_work() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let x = spawn(&cpu, &mem, ProcSpec::new("x"));
    let r = spawn(&cpu, &mem, ProcSpec::new("r"));

    assert_eq!(cpu.ipc_call(x, IpcRequest::Notify { dst: r }), Ok(Completion::Done));
    let entry = AsyncEntry::new(r, AsyncFlags::VALID, Message::new(3));
    write_entry(&*mem, x, 0, &entry);
    assert_eq!(
        cpu.ipc_call(x, IpcRequest::SendA { table: TABLE, count: 1 }),
        Ok(Completion::Done)
    );
    let info = cpu.inspect(r).unwrap();
    assert!(info.notify_pending.get(x.slot()));
    assert!(info.asyn_pending.get(x.slot()));

    cpu.exit(x).unwrap();
    let info = cpu.inspect(r).unwrap();
    assert!(info.notify_pending.is_empty());
    assert!(info.asyn_pending.is_empty());
    assert_eq!(
        cpu.ipc_call(r, IpcRequest::Receive { src: Endpoint::ANY, msg: MSG }),
        Ok(Completion::Blocked)
    );
}

/// Test that entries addressed to an exiting receiver are failed while
/// entries for other receivers stay deliverable
#[test]
fn test_receiver_exit_fails_its_async_entries() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let s = spawn(&cpu, &mem, ProcSpec::new("sender"));
    let gone = spawn(&cpu, &mem, ProcSpec::new("gone"));
    let stays = spawn(&cpu, &mem, ProcSpec::new("stays"));

    let mut m = Message::new(5);
    m.put_u32(0, 77);
    write_entry(&*mem, s, 0, &AsyncEntry::new(gone, AsyncFlags::VALID | AsyncFlags::NOTIFY_ERR, m));
    write_entry(&*mem, s, 1, &AsyncEntry::new(stays, AsyncFlags::VALID, m));
    assert_eq!(
        cpu.ipc_call(s, IpcRequest::SendA { table: TABLE, count: 2 }),
        Ok(Completion::Done)
    );

    cpu.exit(gone).unwrap();
    let failed = read_entry(&*mem, s, 0);
    assert!(AsyncFlags::from_bits_retain(failed.flags).contains(AsyncFlags::DONE));
    assert_eq!(failed.result, errno::EDEADSRCDST);

    assert_eq!(receive(&cpu, stays, Endpoint::ANY), Ok(()));
    assert_eq!(read_msg(&*mem, stays).get_u32(0), 77);
    assert_eq!(read_entry(&*mem, s, 1).result, errno::OK);
}

/// Test that the slot comes back under a new endpoint
#[test]
fn test_slot_reuse_bumps_generation() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let a = spawn(&cpu, &mem, ProcSpec::new("a"));
    let peer = spawn(&cpu, &mem, ProcSpec::new("peer"));
    assert!(mem.mapped_pages(a) > 0);

    cpu.exit(a).unwrap();
    assert_eq!(mem.mapped_pages(a), 0);
    assert!(cpu.inspect(a).unwrap().rts.contains(RtsFlags::SLOT_FREE));
    assert_eq!(cpu.exit(a), Err(IpcError::DeadSrcDst));

    let b = spawn(&cpu, &mem, ProcSpec::new("b"));
    assert_eq!(b.slot(), a.slot());
    assert_ne!(b, a);
    assert_eq!(b, a.next_generation());

    // The stale endpoint no longer reaches the slot
    assert_eq!(
        cpu.ipc_call(peer, IpcRequest::Send { dst: a, msg: MSG }),
        Err(IpcError::DeadSrcDst)
    );
    assert_eq!(cpu.ipc_call(a, IpcRequest::Notify { dst: peer }), Err(IpcError::DeadSrcDst));
}

/// Test that the running process can exit and the CPU moves on
#[test]
fn test_running_process_exits() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let a = spawn(&cpu, &mem, ProcSpec::new("a").priority(2));
    let b = spawn(&cpu, &mem, ProcSpec::new("b").priority(3));

    assert_eq!(cpu.switch_to_user(), Some(a));
    cpu.exit(a).unwrap();
    assert_eq!(cpu.switch_to_user(), Some(b));
    cpu.timer_tick();
    assert_eq!(cpu.inspect(b).unwrap().user_time, 1);
}

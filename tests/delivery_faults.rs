//! Message Delivery Fault Tests
//!
//! Tests what happens when a parked message cannot be copied out to its
//! receiver: one fixup attempt through the memory manager, then a signal.

mod common;

use common::*;
use mellos_ipc_core::mem::PAGE_SIZE;
use mellos_ipc_core::proc::{MiscFlags, Signal};
use mellos_ipc_core::{BootConfig, Completion, Endpoint, IpcError, IpcRequest, ProcSpec, RtsFlags};

fn blocked_receiver_with_lost_buffer(cpu: &mellos_ipc_core::Cpu, mem: &mellos_ipc_core::SparseMemory) -> (Endpoint, Endpoint) {
    let s = spawn(cpu, mem, ProcSpec::new("sender"));
    let r = spawn(cpu, mem, ProcSpec::new("receiver"));
    assert_eq!(
        cpu.ipc_call(r, IpcRequest::Receive { src: Endpoint::ANY, msg: MSG }),
        Ok(Completion::Blocked)
    );
    mem.unmap(r, MSG, PAGE_SIZE as usize).unwrap();
    write_msg(mem, s, &text_message(4, "hello"));
    assert_eq!(send(cpu, s, r), Ok(()));
    (s, r)
}

/// Test that a fault the memory manager can fix costs one retry
#[test]
fn test_fixed_fault_is_retried() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let (s, r) = blocked_receiver_with_lost_buffer(&cpu, &mem);
    assert!(cpu.inspect(r).unwrap().misc.contains(MiscFlags::DELIVERMSG));

    assert_eq!(cpu.resume(r), Ok(0));
    assert_eq!(mem.fixup_requests(), 1);
    let m = read_msg(&*mem, r);
    assert_eq!(m.source, s);
    assert_eq!(text(&m), "hello");
    assert!(!cpu.inspect(r).unwrap().misc.contains(MiscFlags::MSGFAILED));
}

/// Test that a refused fixup parks the receiver and a second fault
/// signals it
#[test]
fn test_second_fault_signals_receiver() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    mem.set_fixups_allowed(false);
    let (_s, r) = blocked_receiver_with_lost_buffer(&cpu, &mem);

    assert_eq!(cpu.resume(r), Err(IpcError::NotReady));
    let info = cpu.inspect(r).unwrap();
    assert!(info.rts.contains(RtsFlags::VMREQUEST));
    assert!(info.misc.contains(MiscFlags::MSGFAILED));
    assert!(!info.enqueued);

    // The memory manager gives up without mapping anything
    cpu.vm_resume(r).unwrap();
    assert_eq!(cpu.resume(r), Err(IpcError::NotReady));
    let info = cpu.inspect(r).unwrap();
    assert!(info.rts.contains(RtsFlags::SIGNALED));
    assert_eq!(info.pending_signal, Some(Signal::Segv));
    assert!(!info.misc.contains(MiscFlags::DELIVERMSG));

    cpu.clear_signal(r).unwrap();
    assert!(cpu.inspect(r).unwrap().is_runnable());
}

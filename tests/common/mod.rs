//! Shared helpers for the integration tests
//!
//! Every test process gets one message page at `MSG` and an async table at
//! `TABLE`, both writable.

#![allow(dead_code)]

use mellos_ipc_core::ipc::AsyncEntry;
use mellos_ipc_core::mem::PAGE_SIZE;
use mellos_ipc_core::{
    BootConfig, Completion, Cpu, Endpoint, IpcError, IpcRequest, IpcResult, Kernel, Message,
    ProcSpec, SparseMemory, UserMemory,
};
use std::sync::Arc;

pub const MSG: u64 = 0x1000;
pub const TABLE: u64 = 0x8000;
pub const TABLE_PAGES: usize = 4;

pub fn boot(config: BootConfig) -> (Kernel, Arc<SparseMemory>) {
    let mem = Arc::new(SparseMemory::new());
    let kernel = Kernel::boot(config, mem.clone()).expect("boot");
    (kernel, mem)
}

/// Spawn a process with its message page and async table mapped
pub fn spawn(cpu: &Cpu, mem: &SparseMemory, spec: ProcSpec) -> Endpoint {
    let ep = cpu.spawn(spec).expect("spawn");
    mem.map(ep, MSG, PAGE_SIZE as usize, true).expect("map message page");
    mem.map(ep, TABLE, TABLE_PAGES * PAGE_SIZE as usize, true)
        .expect("map async table");
    ep
}

pub fn text_message(mtype: i32, text: &str) -> Message {
    let mut m = Message::new(mtype);
    m.put_u32(0, text.len() as u32);
    m.put_bytes(4, text.as_bytes());
    m
}

pub fn text(m: &Message) -> String {
    let len = m.get_u32(0) as usize;
    String::from_utf8_lossy(&m.payload[4..4 + len]).into_owned()
}

pub fn write_msg(mem: &dyn UserMemory, ep: Endpoint, m: &Message) {
    m.write_to(mem, ep, MSG).expect("write message");
}

pub fn read_msg(mem: &dyn UserMemory, ep: Endpoint) -> Message {
    Message::read_from(mem, ep, MSG).expect("read message")
}

pub fn write_entry(mem: &dyn UserMemory, ep: Endpoint, i: usize, entry: &AsyncEntry) {
    entry.write(mem, ep, TABLE, i).expect("write async entry");
}

pub fn read_entry(mem: &dyn UserMemory, ep: Endpoint, i: usize) -> AsyncEntry {
    AsyncEntry::read(mem, ep, TABLE, i).expect("read async entry")
}

/// Issue `req` as `ep` and, if it blocks, run `ep` until it is woken
///
/// The returned result is what the process sees when it runs again.
pub fn call(cpu: &Cpu, ep: Endpoint, req: IpcRequest) -> IpcResult<()> {
    match cpu.ipc_call(ep, req)? {
        Completion::Done => Ok(()),
        Completion::Blocked => wait(cpu, ep),
    }
}

/// Spin until the blocked `ep` runs again and collect its result
pub fn wait(cpu: &Cpu, ep: Endpoint) -> IpcResult<()> {
    loop {
        match cpu.resume(ep) {
            Err(IpcError::NotReady) => std::hint::spin_loop(),
            Err(e) => return Err(e),
            Ok(0) => return Ok(()),
            Ok(code) => return Err(IpcError::from_errno(code).unwrap_or(IpcError::Invalid)),
        }
    }
}

pub fn send(cpu: &Cpu, ep: Endpoint, dst: Endpoint) -> IpcResult<()> {
    call(cpu, ep, IpcRequest::Send { dst, msg: MSG })
}

pub fn receive(cpu: &Cpu, ep: Endpoint, src: Endpoint) -> IpcResult<()> {
    call(cpu, ep, IpcRequest::Receive { src, msg: MSG })
}

pub fn sendrec(cpu: &Cpu, ep: Endpoint, peer: Endpoint) -> IpcResult<()> {
    call(cpu, ep, IpcRequest::SendRec { peer, msg: MSG })
}

/// Check that every live process sits on its CPU's queue exactly while it
/// has no RTS flag, and that the queues hold nothing else
///
/// Call only once every CPU thread has finished.
pub fn assert_queues_consistent(k: &Kernel) {
    let cpu = k.cpu(0);
    let mut enqueued = 0;
    for (nr, slot) in k.procs().iter() {
        let Some(info) = cpu.inspect(slot.endpoint()) else {
            continue;
        };
        assert_eq!(
            info.enqueued,
            info.is_runnable(),
            "{} ({}) rts={:?}",
            info.endpoint,
            info.name,
            info.rts
        );
        if info.enqueued {
            enqueued += 1;
            let rq = k.percpu(info.cpu).run_queue.lock();
            assert!(
                rq.contains(usize::from(info.priority), nr),
                "{} missing from queue {} of cpu {}",
                info.endpoint,
                info.priority,
                info.cpu
            );
        }
    }
    let queued: usize = (0..k.ncpus()).map(|c| k.percpu(c).run_queue.lock().len()).sum();
    assert_eq!(queued, enqueued);
}

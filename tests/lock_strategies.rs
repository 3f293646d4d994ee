//! Lock Strategy Integration Tests
//!
//! Runs the same two-CPU request/reply workload on every lock algorithm,
//! with per-process locks and with the single kernel lock.

mod common;

use common::*;
use mellos_ipc_core::{BootConfig, Endpoint, LockKind, LockMode, Message, ProcSpec};
use std::thread;

const REQUESTS: u32 = 200;

fn request_reply(kind: LockKind, mode: LockMode) {
    let (k, mem) = boot(BootConfig::default().with_cpus(2).with_lock(kind).with_mode(mode));
    assert_eq!(k.locks().kind(), kind);
    assert_eq!(k.mode(), mode);

    let cpu0 = k.cpu(0);
    let client = spawn(&cpu0, &mem, ProcSpec::new("client"));
    let server = spawn(&cpu0, &mem, ProcSpec::new("server").cpu(1));

    thread::scope(|s| {
        s.spawn(|| {
            let cpu1 = k.cpu(1);
            for _ in 0..REQUESTS {
                receive(&cpu1, server, Endpoint::ANY).unwrap();
                let req = read_msg(&*mem, server);
                assert_eq!(req.source, client);
                let mut reply = Message::new(2);
                reply.put_u32(0, req.get_u32(0) * 2);
                write_msg(&*mem, server, &reply);
                send(&cpu1, server, client).unwrap();
            }
        });

        for i in 0..REQUESTS {
            let mut req = Message::new(1);
            req.put_u32(0, i);
            write_msg(&*mem, client, &req);
            sendrec(&cpu0, client, server).unwrap();
            let reply = read_msg(&*mem, client);
            assert_eq!(reply.source, server);
            assert_eq!(reply.get_u32(0), i * 2);
        }
    });

    let stats = k.metrics().snapshot();
    assert_eq!(stats.sends, 2 * u64::from(REQUESTS));
    assert_eq!(stats.deadlocks, 0);
    assert!((0..k.locks().len()).all(|id| !k.locks().is_locked(id)));
    assert_queues_consistent(&k);
}

/// Test the test-and-set lock with per-process locking
#[test]
fn test_spin_fine() {
    request_reply(LockKind::Spin, LockMode::Fine);
}

/// Test the ticket lock with per-process locking
#[test]
fn test_ticket_fine() {
    request_reply(LockKind::Ticket, LockMode::Fine);
}

/// Test the MCS lock with per-process locking
#[test]
fn test_mcs_fine() {
    request_reply(LockKind::Mcs, LockMode::Fine);
}

/// Test the test-and-set lock as the kernel lock
#[test]
fn test_spin_coarse() {
    request_reply(LockKind::Spin, LockMode::Coarse);
}

/// Test the ticket lock as the kernel lock
#[test]
fn test_ticket_coarse() {
    request_reply(LockKind::Ticket, LockMode::Coarse);
}

/// Test the MCS lock as the kernel lock
#[test]
fn test_mcs_coarse() {
    request_reply(LockKind::Mcs, LockMode::Coarse);
}

/// Test that boot parameters select the strategy
#[test]
fn test_boot_parameters_pick_strategy() {
    let config = BootConfig::parse("cpus=2 lock=ticketlock mode=coarse").unwrap();
    let (k, _mem) = boot(config);
    assert_eq!(k.locks().kind(), LockKind::Ticket);
    assert_eq!(k.mode(), LockMode::Coarse);
    assert_eq!(k.ncpus(), 2);
    // One word per process slot plus the kernel lock
    assert_eq!(k.locks().len(), k.procs().len() + 1);
}

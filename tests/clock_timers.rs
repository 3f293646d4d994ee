//! Clock Integration Tests
//!
//! Tests the tick path: kernel timers firing as notifications or
//! callbacks, wall clock slewing and CPU time billing.

mod common;

use common::*;
use mellos_ipc_core::ipc::message::NOTIFY_MESSAGE;
use mellos_ipc_core::proc::CLOCK;
use mellos_ipc_core::{BootConfig, Completion, Endpoint, IpcRequest, PrivFlags, ProcSpec, TimerAction};
use std::sync::atomic::{AtomicU64, Ordering};

fn ticks(cpu: &mellos_ipc_core::Cpu, n: u32) {
    for _ in 0..n {
        cpu.timer_tick();
    }
}

/// Test that an alarm reaches a waiting process as a CLOCK notification
#[test]
fn test_alarm_notifies_receiver() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let r = spawn(&cpu, &mem, ProcSpec::new("alarmed"));
    assert_eq!(
        cpu.ipc_call(r, IpcRequest::Receive { src: Endpoint::ANY, msg: MSG }),
        Ok(Completion::Blocked)
    );

    let t = cpu.alloc_timer();
    assert!(cpu.set_kernel_timer(t, 5, TimerAction::Notify(r)));
    ticks(&cpu, 4);
    assert!(cpu.inspect(r).unwrap().rts.contains(mellos_ipc_core::RtsFlags::RECEIVING));
    cpu.timer_tick();

    assert_eq!(cpu.resume(r), Ok(0));
    let m = read_msg(&*mem, r);
    assert_eq!(m.mtype, NOTIFY_MESSAGE);
    assert_eq!(m.source, k.procs().endpoint(CLOCK));
    assert_eq!(k.metrics().snapshot().timer_expiries, 1);
    cpu.free_timer(t);
}

/// Test that an alarm for a busy process stays pending until it receives
#[test]
fn test_alarm_pending_while_busy() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let r = spawn(&cpu, &mem, ProcSpec::new("busy"));

    let t = cpu.alloc_timer();
    assert!(cpu.set_kernel_timer(t, 2, TimerAction::Notify(r)));
    ticks(&cpu, 3);
    assert!(cpu.inspect(r).unwrap().notify_pending.get(CLOCK));

    assert_eq!(receive(&cpu, r, Endpoint::ANY), Ok(()));
    assert_eq!(read_msg(&*mem, r).source, k.procs().endpoint(CLOCK));
    assert!(cpu.inspect(r).unwrap().notify_pending.is_empty());
}

/// Test that a cleared timer never fires and callbacks run in expiry order
#[test]
fn test_reset_and_callbacks() {
    static LAST: AtomicU64 = AtomicU64::new(0);
    static CALLS: AtomicU64 = AtomicU64::new(0);
    fn record(arg: u64) {
        LAST.store(arg, Ordering::SeqCst);
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    let (k, _mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let early = cpu.alloc_timer();
    let late = cpu.alloc_timer();
    let cancelled = cpu.alloc_timer();
    assert!(cpu.set_kernel_timer(late, 6, TimerAction::Callback { func: record, arg: 2 }));
    assert!(cpu.set_kernel_timer(early, 3, TimerAction::Callback { func: record, arg: 1 }));
    assert!(cpu.set_kernel_timer(cancelled, 4, TimerAction::Callback { func: record, arg: 99 }));
    assert!(cpu.reset_kernel_timer(cancelled));
    assert!(!cpu.reset_kernel_timer(cancelled));

    ticks(&cpu, 3);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(LAST.load(Ordering::SeqCst), 1);
    ticks(&cpu, 3);
    assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    assert_eq!(LAST.load(Ordering::SeqCst), 2);
    assert_eq!(k.metrics().snapshot().timer_expiries, 2);
}

/// Test that only CPU 0 advances time and that adjtime slews the wall clock
#[test]
fn test_adjtime_slew() {
    let (k, _mem) = boot(BootConfig::default().with_cpus(2));
    let clock = k.clock();
    k.cpu(1).timer_tick();
    assert_eq!(clock.uptime(), 0);

    clock.set_adjtime_delta(4);
    let start = clock.realtime();
    ticks(&k.cpu(0), 8);
    assert_eq!(clock.uptime(), 8);
    assert_eq!(clock.realtime() - start, 12);
    assert_eq!(clock.adjtime_delta(), 0);

    clock.set_adjtime_delta(-2);
    let start = clock.realtime();
    ticks(&k.cpu(0), 4);
    assert_eq!(clock.realtime() - start, 2);
    assert_eq!(clock.adjtime_delta(), 0);
}

/// Test that a system process bills its system time to the process it
/// serves
#[test]
fn test_system_time_billed_to_client() {
    let (k, mem) = boot(BootConfig::default());
    let cpu = k.cpu(0);
    let client = spawn(&cpu, &mem, ProcSpec::new("client").priority(3));
    let server = spawn(
        &cpu,
        &mem,
        ProcSpec::new("server")
            .priority(4)
            .flags(PrivFlags::SYS_PROC | PrivFlags::PREEMPTIBLE),
    );

    assert_eq!(cpu.switch_to_user(), Some(client));
    cpu.timer_tick();
    cpu.stop_proc(client).unwrap();
    assert_eq!(cpu.switch_to_user(), Some(server));
    ticks(&cpu, 2);

    let c = cpu.inspect(client).unwrap();
    let s = cpu.inspect(server).unwrap();
    assert_eq!(c.user_time, 1);
    assert_eq!(c.sys_time, 2);
    assert_eq!(s.user_time, 2);
    assert_eq!(s.sys_time, 0);

    assert_eq!(k.cpu_load(0), 100);
    let stats = k.percpu(0).stats();
    assert_eq!(stats.busy_ticks, 3);
    assert_eq!(stats.idle_ticks, 0);
}

//! Clock and kernel timers
//!
//! Every CPU runs `timer_tick` on its local timer interrupt. All CPUs bill
//! their running process and sample their run queue length into the load
//! history. CPU 0 additionally keeps time (uptime and realtime) and fires
//! expired kernel timers.
//!
//! Timer actions run after the timer lock is released: a `Notify` enters
//! the IPC engine, which must never happen under the timer lock.

pub mod timer;

pub use timer::{has_expired, TimerAction, TimerId, TimerQueue};

use crate::config::{LOAD_HISTORY, LOAD_UNIT_SECS};
use crate::ipc::engine::notify;
use crate::kernel::Kernel;
use crate::proc::{PrivFlags, ProcSet, CLOCK};
use crate::sched::with_queue;
use crate::sync::lock_ordering::LockTracker;
use crate::sync::SpinLock;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Circular history of run queue samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    /// Sum of ready-process counts sampled in each `LOAD_UNIT_SECS` slot
    pub history: [u32; LOAD_HISTORY],
    pub last_slot: usize,
    /// Uptime of the last sample
    pub last_clock: u64,
}

impl LoadInfo {
    const fn new() -> Self {
        LoadInfo {
            history: [0; LOAD_HISTORY],
            last_slot: 0,
            last_clock: 0,
        }
    }
}

pub struct Clock {
    hz: u32,
    uptime: AtomicU64,
    realtime: AtomicU64,
    /// Ticks realtime still has to gain (positive) or lose (negative)
    adjtime_delta: AtomicI64,
    /// Seconds since the epoch at boot
    boottime: AtomicU64,
    load: SpinLock<LoadInfo>,
    timers: SpinLock<TimerQueue>,
}

impl Clock {
    pub fn new(hz: u32) -> Self {
        Clock {
            hz,
            uptime: AtomicU64::new(0),
            realtime: AtomicU64::new(0),
            adjtime_delta: AtomicI64::new(0),
            boottime: AtomicU64::new(0),
            load: SpinLock::new(LoadInfo::new()),
            timers: SpinLock::new(TimerQueue::new()),
        }
    }

    #[inline]
    pub fn hz(&self) -> u32 {
        self.hz
    }

    /// Monotonic ticks since boot
    #[inline]
    pub fn uptime(&self) -> u64 {
        self.uptime.load(Ordering::Acquire)
    }

    /// Wall time in ticks since boot
    pub fn realtime(&self) -> u64 {
        self.realtime.load(Ordering::Relaxed)
    }

    pub fn set_realtime(&self, ticks: u64) {
        self.realtime.store(ticks, Ordering::Relaxed);
    }

    /// Slew realtime by `ticks`, one tick every other clock tick
    pub fn set_adjtime_delta(&self, ticks: i64) {
        self.adjtime_delta.store(ticks, Ordering::Relaxed);
    }

    pub fn adjtime_delta(&self) -> i64 {
        self.adjtime_delta.load(Ordering::Relaxed)
    }

    pub fn boottime(&self) -> u64 {
        self.boottime.load(Ordering::Relaxed)
    }

    pub fn set_boottime(&self, secs: u64) {
        self.boottime.store(secs, Ordering::Relaxed);
    }

    /// Advance time by one tick; CPU 0 only
    pub(crate) fn advance(&self) -> u64 {
        let now = self.uptime.fetch_add(1, Ordering::AcqRel) + 1;
        let delta = self.adjtime_delta.load(Ordering::Relaxed);
        if delta != 0 && now & 1 == 1 {
            let (step, toward_zero) = if delta > 0 { (2, -1) } else { (0, 1) };
            self.realtime.fetch_add(step, Ordering::Relaxed);
            self.adjtime_delta.store(delta + toward_zero, Ordering::Relaxed);
        } else {
            self.realtime.fetch_add(1, Ordering::Relaxed);
        }
        now
    }

    /// Add one sample of `ready` runnable processes
    pub(crate) fn load_update(&self, ready: usize) {
        let now = self.uptime();
        let slot = ((now / u64::from(self.hz) / LOAD_UNIT_SECS) % LOAD_HISTORY as u64) as usize;
        let mut load = self.load.lock();
        if slot != load.last_slot {
            load.history[slot] = 0;
            load.last_slot = slot;
        }
        load.history[slot] = load.history[slot].saturating_add(ready as u32);
        load.last_clock = now;
    }

    pub fn load_info(&self) -> LoadInfo {
        *self.load.lock()
    }

    /// Run `f` on the timer queue with the lock held
    pub(crate) fn with_timers<R>(&self, tracker: &LockTracker, f: impl FnOnce(&mut TimerQueue) -> R) -> R {
        tracker.mark_timer_locked();
        let r = {
            let mut timers = self.timers.lock();
            f(&mut timers)
        };
        tracker.mark_timer_unlocked();
        r
    }
}

/// Local timer interrupt of `me`
pub(crate) fn timer_tick(k: &Kernel, me: usize) {
    let clock = k.clock();
    let pc = k.percpu(me);
    let now = if me == 0 { clock.advance() } else { clock.uptime() };

    let current = pc.current();
    pc.count_tick(current.is_some());
    if let Some(cur) = current {
        let bill = pc.bill().unwrap_or(cur);
        let mut set = ProcSet::acquire(k, me, &[cur, bill]);
        charge(&mut set, cur, bill);
    }

    let ready = with_queue(k, me, me, |rq| rq.len());
    clock.load_update(ready);

    if me == 0 {
        expire_timers(k, me, now);
    }
}

/// Charge one tick to the running process and, for a system process, to
/// the process it works for
fn charge(set: &mut ProcSet, cur: usize, bill: usize) {
    let p = set.get_mut(cur);
    if p.is_free() {
        return;
    }
    p.user_time += 1;
    p.cpu_time_left = p.cpu_time_left.saturating_sub(1);
    if !p.privilege.flags.contains(PrivFlags::BILLABLE) {
        let b = set.get_mut(bill);
        if !b.is_free() {
            b.sys_time += 1;
        }
    }
}

fn expire_timers(k: &Kernel, me: usize, now: u64) {
    let tracker = &k.percpu(me).locks;
    let fired: Vec<TimerAction> = k.clock().with_timers(tracker, |q| {
        match q.next_expiry() {
            Some(exp) if has_expired(exp, now) => q.expire(now),
            _ => Vec::new(),
        }
    });
    if fired.is_empty() {
        return;
    }
    k.metrics().add_timer_expiries(fired.len() as u64);

    for action in fired {
        match action {
            TimerAction::Notify(ep) => {
                if ep.is_special() || ep.slot() >= k.procs().len() {
                    crate::log_warn!(cpu = me; "clock", "timer for bad endpoint {}", ep);
                    continue;
                }
                let mut set = ProcSet::acquire(k, me, &[ep.slot()]);
                if let Err(e) = notify(&mut set, CLOCK, ep) {
                    crate::log_debug!(cpu = me; "clock", "alarm for {} dropped: {}", ep, e);
                }
            }
            TimerAction::Callback { func, arg } => func(arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_without_adjustment() {
        let clock = Clock::new(100);
        for _ in 0..4 {
            clock.advance();
        }
        assert_eq!(clock.uptime(), 4);
        assert_eq!(clock.realtime(), 4);
    }

    #[test]
    fn test_adjtime_speeds_up_on_odd_ticks() {
        let clock = Clock::new(100);
        clock.set_adjtime_delta(2);
        // ticks 1..=4: +2, +1, +2, +1
        for _ in 0..4 {
            clock.advance();
        }
        assert_eq!(clock.realtime(), 6);
        assert_eq!(clock.adjtime_delta(), 0);
    }

    #[test]
    fn test_adjtime_slows_down() {
        let clock = Clock::new(100);
        clock.set_adjtime_delta(-1);
        clock.advance();
        clock.advance();
        assert_eq!(clock.uptime(), 2);
        assert_eq!(clock.realtime(), 1);
        assert_eq!(clock.adjtime_delta(), 0);
    }

    #[test]
    fn test_load_history_slots() {
        let clock = Clock::new(2);
        clock.load_update(3);
        clock.load_update(1);
        assert_eq!(clock.load_info().history[0], 4);

        // One load unit is hz * LOAD_UNIT_SECS ticks
        for _ in 0..(2 * LOAD_UNIT_SECS) {
            clock.advance();
        }
        clock.load_update(5);
        let info = clock.load_info();
        assert_eq!(info.last_slot, 1);
        assert_eq!(info.history[1], 5);
        assert_eq!(info.last_clock, 2 * LOAD_UNIT_SECS);
    }

    #[test]
    fn test_timer_lock_is_tracked() {
        let clock = Clock::new(100);
        let tracker = LockTracker::new();
        let id = clock.with_timers(&tracker, |q| q.alloc());
        let armed = clock.with_timers(&tracker, |q| {
            q.set(id, 10, TimerAction::Callback { func: |_| {}, arg: 7 });
            q.armed()
        });
        assert_eq!(armed, 1);
        tracker.assert_no_timer_lock();
    }
}

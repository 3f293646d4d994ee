//! Kernel timer queue
//!
//! Timers live in an arena and are addressed by `TimerId`. Armed timers
//! form a singly-linked list sorted by expiry, so expiring is a walk from
//! the head that stops at the first timer still in the future. Expiry
//! times are tick counts compared modulo 2^64, so the queue keeps working
//! across a wrap of the uptime counter.

use crate::proc::Endpoint;
use alloc::vec::Vec;

pub type TimerId = usize;

/// What happens when a timer fires
#[derive(Debug, Clone, Copy)]
pub enum TimerAction {
    /// Notify the endpoint on behalf of CLOCK
    Notify(Endpoint),
    /// Run a function; it must not block or enter IPC
    Callback { func: fn(u64), arg: u64 },
}

/// `exp` is due at time `now`
#[inline]
pub fn has_expired(exp: u64, now: u64) -> bool {
    (now.wrapping_sub(exp) as i64) >= 0
}

/// `a` comes strictly before `b`
#[inline]
fn earlier(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

#[derive(Debug, Clone, Copy)]
struct Timer {
    expiry: u64,
    action: Option<TimerAction>,
    next: Option<TimerId>,
    in_use: bool,
}

impl Timer {
    const UNUSED: Timer = Timer {
        expiry: 0,
        action: None,
        next: None,
        in_use: false,
    };
}

#[derive(Default)]
pub struct TimerQueue {
    timers: Vec<Timer>,
    free: Vec<TimerId>,
    head: Option<TimerId>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a timer; it starts disarmed
    pub fn alloc(&mut self) -> TimerId {
        match self.free.pop() {
            Some(id) => {
                self.timers[id].in_use = true;
                id
            }
            None => {
                self.timers.push(Timer {
                    in_use: true,
                    ..Timer::UNUSED
                });
                self.timers.len() - 1
            }
        }
    }

    /// Return a timer to the arena, disarming it first
    pub fn free(&mut self, id: TimerId) {
        if !self.valid(id) {
            return;
        }
        self.clear(id);
        self.timers[id] = Timer::UNUSED;
        self.free.push(id);
    }

    fn valid(&self, id: TimerId) -> bool {
        self.timers.get(id).is_some_and(|t| t.in_use)
    }

    pub fn is_set(&self, id: TimerId) -> bool {
        self.valid(id) && self.timers[id].action.is_some()
    }

    /// Arm `id` to fire at `expiry`, re-arming it if already set
    ///
    /// Timers with equal expiry fire in the order they were set. Returns
    /// false for an unknown id.
    pub fn set(&mut self, id: TimerId, expiry: u64, action: TimerAction) -> bool {
        if !self.valid(id) {
            return false;
        }
        self.clear(id);

        let mut prev: Option<TimerId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if earlier(expiry, self.timers[c].expiry) {
                break;
            }
            prev = cur;
            cur = self.timers[c].next;
        }

        let t = &mut self.timers[id];
        t.expiry = expiry;
        t.action = Some(action);
        t.next = cur;
        match prev {
            Some(p) => self.timers[p].next = Some(id),
            None => self.head = Some(id),
        }
        true
    }

    /// Disarm `id`; false if it was not armed
    pub fn clear(&mut self, id: TimerId) -> bool {
        if !self.is_set(id) {
            return false;
        }
        let mut prev: Option<TimerId> = None;
        let mut cur = self.head;
        while let Some(c) = cur {
            if c == id {
                let next = self.timers[c].next;
                match prev {
                    Some(p) => self.timers[p].next = next,
                    None => self.head = next,
                }
                break;
            }
            prev = cur;
            cur = self.timers[c].next;
        }
        let t = &mut self.timers[id];
        t.action = None;
        t.next = None;
        true
    }

    /// Expiry of the first armed timer
    pub fn next_expiry(&self) -> Option<u64> {
        self.head.map(|h| self.timers[h].expiry)
    }

    /// Unlink every timer due at `now` and return their actions in order
    pub fn expire(&mut self, now: u64) -> Vec<TimerAction> {
        let mut fired = Vec::new();
        while let Some(h) = self.head {
            let t = &mut self.timers[h];
            if !has_expired(t.expiry, now) {
                break;
            }
            self.head = t.next;
            t.next = None;
            if let Some(action) = t.action.take() {
                fired.push(action);
            }
        }
        fired
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(c) = cur {
            n += 1;
            cur = self.timers[c].next;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(action: &TimerAction) -> Endpoint {
        match action {
            TimerAction::Notify(ep) => *ep,
            TimerAction::Callback { .. } => Endpoint::NONE,
        }
    }

    #[test]
    fn test_fires_in_expiry_order() {
        let mut q = TimerQueue::new();
        let (a, b, c) = (q.alloc(), q.alloc(), q.alloc());
        q.set(a, 30, TimerAction::Notify(Endpoint::new(4, 0)));
        q.set(b, 10, TimerAction::Notify(Endpoint::new(5, 0)));
        q.set(c, 20, TimerAction::Notify(Endpoint::new(6, 0)));
        assert_eq!(q.next_expiry(), Some(10));

        let fired = q.expire(20);
        let eps: Vec<_> = fired.iter().map(ep).collect();
        assert_eq!(eps, vec![Endpoint::new(5, 0), Endpoint::new(6, 0)]);
        assert!(q.is_set(a));
        assert!(!q.is_set(b));
        assert_eq!(q.armed(), 1);
    }

    #[test]
    fn test_equal_expiry_is_fifo() {
        let mut q = TimerQueue::new();
        let (a, b) = (q.alloc(), q.alloc());
        q.set(a, 5, TimerAction::Notify(Endpoint::new(4, 0)));
        q.set(b, 5, TimerAction::Notify(Endpoint::new(5, 0)));
        let eps: Vec<_> = q.expire(5).iter().map(ep).collect();
        assert_eq!(eps, vec![Endpoint::new(4, 0), Endpoint::new(5, 0)]);
    }

    #[test]
    fn test_rearm_and_clear() {
        let mut q = TimerQueue::new();
        let a = q.alloc();
        q.set(a, 5, TimerAction::Notify(Endpoint::new(4, 0)));
        q.set(a, 50, TimerAction::Notify(Endpoint::new(4, 0)));
        assert_eq!(q.armed(), 1);
        assert!(q.expire(10).is_empty());
        assert!(q.clear(a));
        assert!(!q.clear(a));
        assert!(q.expire(100).is_empty());
    }

    #[test]
    fn test_expiry_across_wrap() {
        let mut q = TimerQueue::new();
        let (a, b) = (q.alloc(), q.alloc());
        q.set(a, 3, TimerAction::Notify(Endpoint::new(4, 0)));
        q.set(b, u64::MAX - 1, TimerAction::Notify(Endpoint::new(5, 0)));
        // Before the wrap only the pre-wrap timer is due
        let eps: Vec<_> = q.expire(u64::MAX).iter().map(ep).collect();
        assert_eq!(eps, vec![Endpoint::new(5, 0)]);
        assert_eq!(q.expire(3).len(), 1);
        assert!(has_expired(u64::MAX, 2));
        assert!(!has_expired(2, u64::MAX));
    }

    #[test]
    fn test_free_recycles_ids() {
        let mut q = TimerQueue::new();
        let a = q.alloc();
        q.set(a, 5, TimerAction::Callback { func: |_| {}, arg: 0 });
        q.free(a);
        assert_eq!(q.armed(), 0);
        assert!(!q.set(a, 5, TimerAction::Notify(Endpoint::NONE)));
        assert_eq!(q.alloc(), a);
    }
}

//! Per-CPU run queue
//!
//! One FIFO list per priority, queue 0 first. The lists are linked through
//! a per-slot `next` array owned by the run queue, so a process's ready
//! link is protected by the same lock as the list heads.
//!
//! # Architecture
//!
//! ```text
//! head[0]  ──► 7 ──► 12 ──► None      tail[0] = 12
//! head[1]  ──► None
//! ...
//! head[7]  ──► 4 ──► None             tail[7] = 4
//! ```

use crate::config::NR_SCHED_QUEUES;
use crate::proc::ProcNr;
use alloc::boxed::Box;
use alloc::vec;

pub struct RunQueue {
    head: [Option<ProcNr>; NR_SCHED_QUEUES],
    tail: [Option<ProcNr>; NR_SCHED_QUEUES],
    next: Box<[Option<ProcNr>]>,
    len: usize,
}

impl RunQueue {
    pub fn new(nprocs: usize) -> Self {
        RunQueue {
            head: [None; NR_SCHED_QUEUES],
            tail: [None; NR_SCHED_QUEUES],
            next: vec![None; nprocs].into_boxed_slice(),
            len: 0,
        }
    }

    /// Append `nr` to queue `q`
    pub fn push_back(&mut self, q: usize, nr: ProcNr) {
        assert!(q < NR_SCHED_QUEUES, "scheduling queue {} out of range", q);
        self.next[nr] = None;
        match self.tail[q] {
            Some(t) => self.next[t] = Some(nr),
            None => self.head[q] = Some(nr),
        }
        self.tail[q] = Some(nr);
        self.len += 1;
    }

    /// Insert `nr` at the front of queue `q`
    pub fn push_front(&mut self, q: usize, nr: ProcNr) {
        assert!(q < NR_SCHED_QUEUES, "scheduling queue {} out of range", q);
        self.next[nr] = self.head[q];
        if self.head[q].is_none() {
            self.tail[q] = Some(nr);
        }
        self.head[q] = Some(nr);
        self.len += 1;
    }

    /// Unlink `nr` from queue `q`; false if it is not there
    pub fn remove(&mut self, q: usize, nr: ProcNr) -> bool {
        assert!(q < NR_SCHED_QUEUES, "scheduling queue {} out of range", q);
        let mut prev: Option<ProcNr> = None;
        let mut cur = self.head[q];
        while let Some(c) = cur {
            if c == nr {
                let after = self.next[c];
                match prev {
                    Some(p) => self.next[p] = after,
                    None => self.head[q] = after,
                }
                if self.tail[q] == Some(nr) {
                    self.tail[q] = prev;
                }
                self.next[nr] = None;
                self.len -= 1;
                return true;
            }
            prev = cur;
            cur = self.next[c];
        }
        false
    }

    /// Head of the highest-priority non-empty queue
    pub fn pick(&self) -> Option<ProcNr> {
        self.head.iter().find_map(|h| *h)
    }

    /// Index of the highest-priority non-empty queue
    pub fn top_priority(&self) -> Option<usize> {
        self.head.iter().position(|h| h.is_some())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Processes in queue `q`, head first
    pub fn iter(&self, q: usize) -> impl Iterator<Item = ProcNr> + '_ {
        let mut cur = self.head[q];
        core::iter::from_fn(move || {
            let c = cur?;
            cur = self.next[c];
            Some(c)
        })
    }

    pub fn contains(&self, q: usize, nr: ProcNr) -> bool {
        self.iter(q).any(|c| c == nr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_within_priority() {
        let mut rq = RunQueue::new(16);
        rq.push_back(3, 5);
        rq.push_back(3, 9);
        rq.push_back(3, 2);
        assert_eq!(rq.iter(3).collect::<Vec<_>>(), vec![5, 9, 2]);
        assert_eq!(rq.pick(), Some(5));
        assert_eq!(rq.len(), 3);
    }

    #[test]
    fn test_higher_priority_first() {
        let mut rq = RunQueue::new(16);
        rq.push_back(7, 4);
        rq.push_back(1, 8);
        assert_eq!(rq.pick(), Some(8));
        assert!(rq.remove(1, 8));
        assert_eq!(rq.pick(), Some(4));
    }

    #[test]
    fn test_top_priority() {
        let mut rq = RunQueue::new(16);
        assert_eq!(rq.top_priority(), None);
        rq.push_back(9, 4);
        rq.push_back(2, 5);
        assert_eq!(rq.top_priority(), Some(2));
        rq.remove(2, 5);
        assert_eq!(rq.top_priority(), Some(9));
    }

    #[test]
    fn test_push_front() {
        let mut rq = RunQueue::new(16);
        rq.push_back(2, 4);
        rq.push_front(2, 6);
        assert_eq!(rq.iter(2).collect::<Vec<_>>(), vec![6, 4]);
        rq.remove(2, 4);
        // Tail follows the removal
        rq.push_back(2, 7);
        assert_eq!(rq.iter(2).collect::<Vec<_>>(), vec![6, 7]);
    }

    #[test]
    fn test_remove_middle_and_missing() {
        let mut rq = RunQueue::new(16);
        for nr in [3, 4, 5] {
            rq.push_back(0, nr);
        }
        assert!(rq.remove(0, 4));
        assert!(!rq.remove(0, 4));
        assert!(!rq.remove(1, 3));
        assert_eq!(rq.iter(0).collect::<Vec<_>>(), vec![3, 5]);
        assert!(rq.remove(0, 5));
        assert!(rq.remove(0, 3));
        assert!(rq.is_empty());
        assert_eq!(rq.pick(), None);
    }
}

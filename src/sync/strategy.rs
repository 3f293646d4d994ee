//! Boot-selected lock strategy
//!
//! The kernel owns one `LockStrategy` instance holding every lock word it
//! needs: one per process table slot plus the coarse kernel lock. The
//! algorithm behind all of them is chosen once, by name, when the kernel
//! boots.
//!
//! Locks are addressed by `LockId` and acquired on behalf of a CPU. The
//! CPU id matters for MCS, which gives every (cpu, lock) pair its own
//! queue node.

use super::mcs::{McsLock, McsNode};
use super::spin::RawSpinLock;
use super::ticket::TicketLock;
use alloc::boxed::Box;
use alloc::vec::Vec;

pub type LockId = usize;

/// Work a spinning CPU performs between polls
///
/// On real hardware a coordinator request arrives as an NMI even while a
/// CPU spins on a lock. The kernel's implementation of this hook services
/// such requests so that a spinning CPU cannot stall an initiator waiting
/// for its acknowledgement.
pub trait Relax {
    fn relax(&self);
}

/// Plain pause, for locks no request handler depends on
pub struct SpinRelax;

impl Relax for SpinRelax {
    #[inline]
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// The lock algorithms that can back kernel locks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Spin,
    Ticket,
    Mcs,
}

impl LockKind {
    /// Resolve a boot parameter name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "spinlock" => Some(LockKind::Spin),
            "ticketlock" => Some(LockKind::Ticket),
            "mcs" => Some(LockKind::Mcs),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            LockKind::Spin => "spinlock",
            LockKind::Ticket => "ticketlock",
            LockKind::Mcs => "mcs",
        }
    }
}

/// One contract, three algorithms
pub trait LockStrategy: Send + Sync {
    fn kind(&self) -> LockKind;

    /// Number of lock words managed
    fn len(&self) -> usize;

    /// Spin until `cpu` holds lock `id`, calling `relax` while waiting
    fn lock(&self, id: LockId, cpu: usize, relax: &dyn Relax);

    fn try_lock(&self, id: LockId, cpu: usize) -> bool;

    /// Release lock `id`; `cpu` must be the holder
    fn unlock(&self, id: LockId, cpu: usize);

    fn is_locked(&self, id: LockId) -> bool;
}

/// Build the strategy named by `kind` with `nlocks` lock words for `ncpus` CPUs
pub fn new_strategy(kind: LockKind, nlocks: usize, ncpus: usize) -> Box<dyn LockStrategy> {
    crate::log_info!("lock", "using {} for {} locks on {} cpus", kind.name(), nlocks, ncpus);
    match kind {
        LockKind::Spin => Box::new(SpinLocks::new(nlocks)),
        LockKind::Ticket => Box::new(TicketLocks::new(nlocks)),
        LockKind::Mcs => Box::new(McsLocks::new(nlocks, ncpus)),
    }
}

pub struct SpinLocks {
    words: Box<[RawSpinLock]>,
}

impl SpinLocks {
    pub fn new(nlocks: usize) -> Self {
        SpinLocks {
            words: (0..nlocks).map(|_| RawSpinLock::new()).collect(),
        }
    }
}

impl LockStrategy for SpinLocks {
    fn kind(&self) -> LockKind {
        LockKind::Spin
    }

    fn len(&self) -> usize {
        self.words.len()
    }

    fn lock(&self, id: LockId, _cpu: usize, relax: &dyn Relax) {
        self.words[id].lock(relax);
    }

    fn try_lock(&self, id: LockId, _cpu: usize) -> bool {
        self.words[id].try_lock()
    }

    fn unlock(&self, id: LockId, _cpu: usize) {
        self.words[id].unlock();
    }

    fn is_locked(&self, id: LockId) -> bool {
        self.words[id].is_locked()
    }
}

pub struct TicketLocks {
    locks: Box<[TicketLock]>,
}

impl TicketLocks {
    pub fn new(nlocks: usize) -> Self {
        TicketLocks {
            locks: (0..nlocks).map(|_| TicketLock::new()).collect(),
        }
    }
}

impl LockStrategy for TicketLocks {
    fn kind(&self) -> LockKind {
        LockKind::Ticket
    }

    fn len(&self) -> usize {
        self.locks.len()
    }

    fn lock(&self, id: LockId, _cpu: usize, relax: &dyn Relax) {
        self.locks[id].lock(relax);
    }

    fn try_lock(&self, id: LockId, _cpu: usize) -> bool {
        self.locks[id].try_lock()
    }

    fn unlock(&self, id: LockId, _cpu: usize) {
        self.locks[id].unlock();
    }

    fn is_locked(&self, id: LockId) -> bool {
        self.locks[id].is_locked()
    }
}

/// MCS locks with a pre-allocated node for every (cpu, lock) pair
pub struct McsLocks {
    locks: Box<[McsLock]>,
    /// Row-major: `nodes[cpu * nlocks + id]`
    nodes: Box<[McsNode]>,
    ncpus: usize,
}

impl McsLocks {
    pub fn new(nlocks: usize, ncpus: usize) -> Self {
        let nodes: Vec<McsNode> = (0..nlocks * ncpus).map(|_| McsNode::new()).collect();
        McsLocks {
            locks: (0..nlocks).map(|_| McsLock::new()).collect(),
            nodes: nodes.into_boxed_slice(),
            ncpus,
        }
    }

    fn node(&self, id: LockId, cpu: usize) -> &McsNode {
        assert!(cpu < self.ncpus, "mcs: cpu {} has no queue nodes", cpu);
        &self.nodes[cpu * self.locks.len() + id]
    }
}

impl LockStrategy for McsLocks {
    fn kind(&self) -> LockKind {
        LockKind::Mcs
    }

    fn len(&self) -> usize {
        self.locks.len()
    }

    fn lock(&self, id: LockId, cpu: usize, relax: &dyn Relax) {
        // SAFETY: the node for (cpu, id) is boxed for the strategy's lifetime
        // and a CPU never re-acquires a lock it already holds.
        unsafe { self.locks[id].lock(self.node(id, cpu), relax) }
    }

    fn try_lock(&self, id: LockId, cpu: usize) -> bool {
        unsafe { self.locks[id].try_lock(self.node(id, cpu)) }
    }

    fn unlock(&self, id: LockId, cpu: usize) {
        unsafe { self.locks[id].unlock(self.node(id, cpu)) }
    }

    fn is_locked(&self, id: LockId) -> bool {
        self.locks[id].is_locked()
    }
}

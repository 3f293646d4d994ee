//! Process table slots
//!
//! A `ProcSlot` pairs a `Proc` with the atomics that make it safe to share:
//! the id of the CPU holding the slot's lock, the caller queue link, and
//! shadow copies of a few fields. Shadows are written when the owning CPU
//! releases its `ProcSet`, so a reader without the lock sees the state as
//! of the last release.

use super::{Endpoint, Proc, ProcNr, RtsFlags};
use crate::config::NR_TASKS;
use crate::proc::MiscFlags;
use alloc::boxed::Box;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

pub const NO_OWNER: usize = usize::MAX;
const NO_LINK: usize = usize::MAX;

const BLOCKED_SENDING: u64 = 1 << 32;
const BLOCKED_RECEIVING: u64 = 1 << 33;
const BLOCKED_REPLY_PEND: u64 = 1 << 34;

/// What a process waits for, as seen by the deadlock detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedOn {
    pub target: Endpoint,
    pub sending: bool,
    pub receiving: bool,
    pub reply_pend: bool,
}

impl BlockedOn {
    pub fn of(p: &Proc) -> Self {
        let sending = p.rts.contains(RtsFlags::SENDING);
        BlockedOn {
            target: if sending { p.sendto } else { p.getfrom },
            sending,
            receiving: p.rts.contains(RtsFlags::RECEIVING),
            reply_pend: p.misc.contains(MiscFlags::REPLY_PEND),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.sending || self.receiving
    }

    fn pack(&self) -> u64 {
        let mut v = self.target.raw() as u64;
        if self.sending {
            v |= BLOCKED_SENDING;
        }
        if self.receiving {
            v |= BLOCKED_RECEIVING;
        }
        if self.reply_pend {
            v |= BLOCKED_REPLY_PEND;
        }
        v
    }

    fn unpack(v: u64) -> Self {
        BlockedOn {
            target: Endpoint::from_raw(v as u32),
            sending: v & BLOCKED_SENDING != 0,
            receiving: v & BLOCKED_RECEIVING != 0,
            reply_pend: v & BLOCKED_REPLY_PEND != 0,
        }
    }
}

pub struct ProcSlot {
    owner: AtomicUsize,
    rts: AtomicU32,
    endpoint: AtomicU32,
    cpu: AtomicUsize,
    blocked: AtomicU64,
    /// Next process in the caller queue this process sits on; guarded by
    /// the lock of the queue's owner
    q_link: AtomicUsize,
    proc: UnsafeCell<Proc>,
}

// SAFETY: `proc` is only accessed through `ProcSet`, which holds the slot's
// lock, or by the coordinator handler while the initiator holds it.
unsafe impl Sync for ProcSlot {}
unsafe impl Send for ProcSlot {}

impl ProcSlot {
    fn new(p: Proc) -> Self {
        let slot = ProcSlot {
            owner: AtomicUsize::new(NO_OWNER),
            rts: AtomicU32::new(0),
            endpoint: AtomicU32::new(0),
            cpu: AtomicUsize::new(0),
            blocked: AtomicU64::new(0),
            q_link: AtomicUsize::new(NO_LINK),
            proc: UnsafeCell::new(p),
        };
        // SAFETY: not shared yet
        slot.publish(unsafe { &*slot.proc.get() });
        slot
    }

    /// CPU holding the slot's lock
    pub fn owner(&self) -> Option<usize> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_owner(&self, cpu: usize) {
        self.owner.store(cpu, Ordering::Release);
    }

    pub(crate) fn clear_owner(&self) {
        self.owner.store(NO_OWNER, Ordering::Release);
    }

    /// # Safety
    ///
    /// The caller holds the slot's lock, or borrows it from the CPU that
    /// does, and creates no other reference to the process meanwhile.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn proc_mut(&self) -> &mut Proc {
        &mut *self.proc.get()
    }

    /// # Safety
    ///
    /// As for `proc_mut`, except that shared borrows may coexist.
    pub(crate) unsafe fn proc_ref(&self) -> &Proc {
        &*self.proc.get()
    }

    /// Copy the shadowed fields out of `p`
    pub(crate) fn publish(&self, p: &Proc) {
        self.endpoint.store(p.endpoint.raw(), Ordering::Relaxed);
        self.cpu.store(p.cpu, Ordering::Relaxed);
        self.blocked.store(BlockedOn::of(p).pack(), Ordering::Relaxed);
        self.rts.store(p.rts.bits(), Ordering::Release);
    }

    /// Make the caller's blocked state visible before the deadlock walk
    ///
    /// Two CPUs closing a cycle at the same time each announce first and
    /// walk second, so at least one of them sees the other's edge.
    pub(crate) fn announce(&self, blocked: BlockedOn) {
        self.blocked.store(blocked.pack(), Ordering::SeqCst);
    }

    pub fn rts(&self) -> RtsFlags {
        RtsFlags::from_bits_retain(self.rts.load(Ordering::Acquire))
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_raw(self.endpoint.load(Ordering::Relaxed))
    }

    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn blocked(&self) -> BlockedOn {
        BlockedOn::unpack(self.blocked.load(Ordering::SeqCst))
    }

    pub(crate) fn q_link(&self) -> Option<ProcNr> {
        match self.q_link.load(Ordering::Relaxed) {
            NO_LINK => None,
            nr => Some(nr),
        }
    }

    pub(crate) fn set_q_link(&self, next: Option<ProcNr>) {
        self.q_link.store(next.unwrap_or(NO_LINK), Ordering::Relaxed);
    }
}

/// The process table
pub struct ProcTable {
    slots: Box<[ProcSlot]>,
}

impl ProcTable {
    pub fn new(nprocs: usize) -> Self {
        let slots = (0..nprocs)
            .map(|nr| ProcSlot::new(Proc::free(nr, Endpoint::new(nr, 0))))
            .collect();
        ProcTable { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn slot(&self, nr: ProcNr) -> &ProcSlot {
        &self.slots[nr]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ProcNr, &ProcSlot)> {
        self.slots.iter().enumerate()
    }

    /// Slot of a live process, or None for special, stale or free endpoints
    pub fn isokendpt(&self, ep: Endpoint) -> Option<ProcNr> {
        if ep.is_special() {
            return None;
        }
        let nr = ep.slot();
        let slot = self.slots.get(nr)?;
        if slot.endpoint() != ep || slot.rts().contains(RtsFlags::SLOT_FREE) {
            return None;
        }
        Some(nr)
    }

    pub fn endpoint(&self, nr: ProcNr) -> Endpoint {
        self.slots[nr].endpoint()
    }

    #[inline]
    pub fn is_kernel_task(nr: ProcNr) -> bool {
        nr < NR_TASKS
    }

    /// A slot that looked free and unlocked; the caller rechecks under lock
    pub fn find_free(&self) -> Option<ProcNr> {
        (NR_TASKS..self.slots.len()).find(|nr| {
            let slot = &self.slots[*nr];
            slot.owner().is_none() && slot.rts().contains(RtsFlags::SLOT_FREE)
        })
    }
}

//! Ordered locking of process sets
//!
//! Every operation that touches more than one process locks all of them at
//! once through a `ProcSet`. The set sorts its members by slot index before
//! locking, so two CPUs locking {a, b} and {b, a} serialize on the lower
//! slot instead of deadlocking. A CPU holds at most one set; operations
//! that discover they need another process `relock` the union.
//!
//! Spinning on a process lock services coordinator requests aimed at the
//! spinning CPU (see `smp::IpiRelax`), since the holder may be waiting for
//! exactly that CPU to acknowledge one.

use super::{Proc, ProcNr, ProcSlot};
use crate::config::LockMode;
use crate::kernel::Kernel;
use crate::smp::IpiRelax;
use crate::sync::lock_ordering::assert_slot_order;

/// Largest number of processes one operation locks together
pub const MAX_SET: usize = 4;

pub struct ProcSet<'k> {
    kernel: &'k Kernel,
    cpu: usize,
    nrs: [ProcNr; MAX_SET],
    len: usize,
}

impl<'k> ProcSet<'k> {
    /// Lock `procs` on behalf of `cpu`; duplicates are locked once
    pub fn acquire(kernel: &'k Kernel, cpu: usize, procs: &[ProcNr]) -> Self {
        let mut set = ProcSet::empty(kernel, cpu);
        set.lock(procs);
        set
    }

    pub fn empty(kernel: &'k Kernel, cpu: usize) -> Self {
        ProcSet {
            kernel,
            cpu,
            nrs: [0; MAX_SET],
            len: 0,
        }
    }

    fn lock(&mut self, procs: &[ProcNr]) {
        assert!(procs.len() <= MAX_SET, "proc set too large: {:?}", procs);
        debug_assert_eq!(self.len, 0);

        let mut nrs = [0; MAX_SET];
        nrs[..procs.len()].copy_from_slice(procs);
        nrs[..procs.len()].sort_unstable();
        let mut len = 0;
        for i in 0..procs.len() {
            if len == 0 || nrs[len - 1] != nrs[i] {
                nrs[len] = nrs[i];
                len += 1;
            }
        }
        if len == 0 {
            return;
        }

        let tracker = &self.kernel.percpu(self.cpu).locks;
        tracker.assert_may_lock_procs();
        assert_slot_order(&nrs[..len]);

        let fine = self.kernel.mode() == LockMode::Fine;
        let relax = IpiRelax::new(self.kernel, self.cpu);
        for &nr in &nrs[..len] {
            if fine {
                self.kernel.locks().lock(nr, self.cpu, &relax);
            }
            self.kernel.procs().slot(nr).set_owner(self.cpu);
        }
        tracker.mark_procs_locked(len);

        self.nrs = nrs;
        self.len = len;
    }

    /// Drop the current set and lock `procs` instead
    pub fn relock(&mut self, procs: &[ProcNr]) {
        self.release();
        self.lock(procs);
    }

    /// Publish shadows and unlock, highest slot first
    pub fn release(&mut self) {
        if self.len == 0 {
            return;
        }
        let fine = self.kernel.mode() == LockMode::Fine;
        for &nr in self.nrs[..self.len].iter().rev() {
            let slot = self.kernel.procs().slot(nr);
            // SAFETY: locked by this set
            slot.publish(unsafe { slot.proc_ref() });
            slot.clear_owner();
            if fine {
                self.kernel.locks().unlock(nr, self.cpu);
            }
        }
        self.kernel.percpu(self.cpu).locks.mark_procs_unlocked(self.len);
        self.len = 0;
    }

    #[inline]
    pub fn contains(&self, nr: ProcNr) -> bool {
        self.nrs[..self.len].contains(&nr)
    }

    pub fn members(&self) -> &[ProcNr] {
        &self.nrs[..self.len]
    }

    #[inline]
    pub fn kernel(&self) -> &'k Kernel {
        self.kernel
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub(crate) fn slot(&self, nr: ProcNr) -> &'k ProcSlot {
        self.kernel.procs().slot(nr)
    }

    pub fn get(&self, nr: ProcNr) -> &Proc {
        assert!(self.contains(nr), "cpu {} reads proc {} without its lock", self.cpu, nr);
        // SAFETY: locked by this set; the borrow is tied to the set
        unsafe { self.slot(nr).proc_ref() }
    }

    pub fn get_mut(&mut self, nr: ProcNr) -> &mut Proc {
        assert!(self.contains(nr), "cpu {} writes proc {} without its lock", self.cpu, nr);
        // SAFETY: as above, and `&mut self` keeps other borrows out
        unsafe { self.slot(nr).proc_mut() }
    }

    /// Two distinct members at once
    pub fn pair_mut(&mut self, a: ProcNr, b: ProcNr) -> (&mut Proc, &mut Proc) {
        assert_ne!(a, b);
        assert!(self.contains(a) && self.contains(b), "pair {}/{} not locked", a, b);
        // SAFETY: distinct slots, both locked by this set
        unsafe { (self.slot(a).proc_mut(), self.slot(b).proc_mut()) }
    }
}

impl Drop for ProcSet<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// `cpu` holds the lock of `nr`
pub fn proc_locked(kernel: &Kernel, cpu: usize, nr: ProcNr) -> bool {
    kernel.procs().slot(nr).owner() == Some(cpu)
}

/// Some CPU other than `cpu` holds the lock of `nr`
pub fn proc_locked_borrow(kernel: &Kernel, cpu: usize, nr: ProcNr) -> bool {
    matches!(kernel.procs().slot(nr).owner(), Some(owner) if owner != cpu)
}

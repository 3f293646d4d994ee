//! Process privileges
//!
//! Every process carries a privilege structure naming what it may do: the
//! IPC calls it may issue (trap mask) and the processes it may send to
//! (send mask). The structure also holds the bitmaps through which other
//! processes leave notifications and async messages for it, indexed by the
//! sender's privilege id.

use crate::config::MAX_PROCS;
use crate::ipc::IpcCall;
use crate::mem::VirAddr;
use crate::proc::Endpoint;
use bitflags::bitflags;

/// Privilege id; equal to the process table slot
pub type PrivId = usize;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PrivFlags: u32 {
        /// System process; may pull async messages with try_one
        const SYS_PROC = 1 << 0;
        /// Quantum exhaustion is reported to the process's scheduler
        const PREEMPTIBLE = 1 << 1;
        /// Kernel time spent on behalf of the process is billed to it
        const BILLABLE = 1 << 2;
    }
}

bitflags! {
    /// IPC calls a process may issue, one bit per call number
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrapMask: u32 {
        const SEND = 1 << 1;
        const RECEIVE = 1 << 2;
        const SENDREC = 1 << 3;
        const NOTIFY = 1 << 4;
        const SENDNB = 1 << 5;
        const SENDA = 1 << 16;
    }
}

impl TrapMask {
    pub fn allows(self, call: IpcCall) -> bool {
        self.bits() & (1 << call.number()) != 0
    }
}

const MAP_WORDS: usize = MAX_PROCS / 64;

/// One bit per privilege id
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SysMap([u64; MAP_WORDS]);

impl SysMap {
    pub const fn empty() -> Self {
        SysMap([0; MAP_WORDS])
    }

    pub fn full() -> Self {
        SysMap([u64::MAX; MAP_WORDS])
    }

    #[inline]
    pub fn set(&mut self, id: PrivId) {
        self.0[id / 64] |= 1 << (id % 64);
    }

    #[inline]
    pub fn unset(&mut self, id: PrivId) {
        self.0[id / 64] &= !(1 << (id % 64));
    }

    #[inline]
    pub fn get(&self, id: PrivId) -> bool {
        self.0[id / 64] & (1 << (id % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Lowest id whose bit is set
    pub fn first_set(&self) -> Option<PrivId> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// Ids whose bit is set, lowest first
    pub fn iter(&self) -> impl Iterator<Item = PrivId> + '_ {
        (0..MAX_PROCS).filter(move |id| self.get(*id))
    }
}

impl Default for SysMap {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for SysMap {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Registered async send table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncTable {
    pub addr: VirAddr,
    pub size: usize,
    /// Process that registered the table; compared on use to catch slot reuse
    pub endpoint: Endpoint,
}

impl AsyncTable {
    pub const fn empty() -> Self {
        AsyncTable {
            addr: 0,
            size: 0,
            endpoint: Endpoint::NONE,
        }
    }

    /// Marker held while SENDA of `owner` is still walking its table
    pub const fn registering(owner: Endpoint) -> Self {
        AsyncTable {
            addr: 0,
            size: 0,
            endpoint: owner,
        }
    }

    pub fn is_registering(&self, owner: Endpoint) -> bool {
        self.size == 0 && self.endpoint == owner
    }
}

#[derive(Debug, Clone)]
pub struct Priv {
    pub id: PrivId,
    pub flags: PrivFlags,
    pub trap_mask: TrapMask,
    pub send_mask: SysMap,
    /// Senders with an undelivered notification
    pub notify_pending: SysMap,
    /// Senders with possibly undelivered async messages
    pub asyn_pending: SysMap,
    /// Signals raised by the kernel, delivered with the SYSTEM notification
    pub sig_pending: u64,
    pub asyn: AsyncTable,
}

impl Priv {
    pub fn new(id: PrivId) -> Self {
        Priv {
            id,
            flags: PrivFlags::empty(),
            trap_mask: TrapMask::empty(),
            send_mask: SysMap::empty(),
            notify_pending: SysMap::empty(),
            asyn_pending: SysMap::empty(),
            sig_pending: 0,
            asyn: AsyncTable::empty(),
        }
    }

    #[inline]
    pub fn may_send_to(&self, id: PrivId) -> bool {
        self.send_mask.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysmap_bits() {
        let mut map = SysMap::empty();
        assert_eq!(map.first_set(), None);
        map.set(130);
        map.set(3);
        assert!(map.get(130));
        assert_eq!(map.first_set(), Some(3));
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![3, 130]);
        map.unset(3);
        assert_eq!(map.first_set(), Some(130));
        map.unset(130);
        assert!(map.is_empty());
    }

    #[test]
    fn test_trap_mask_matches_call_numbers() {
        let mask = TrapMask::SEND | TrapMask::SENDA;
        assert!(mask.allows(IpcCall::Send));
        assert!(mask.allows(IpcCall::SendA));
        assert!(!mask.allows(IpcCall::Receive));
        assert!(TrapMask::all().allows(IpcCall::SendNb));
    }
}

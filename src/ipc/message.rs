//! Message and async table layouts
//!
//! Both types are plain values in the kernel and have a fixed little-endian
//! layout in process memory:
//!
//! ```text
//! Message (64 bytes)       AsyncEntry (80 bytes)
//!   0  source   u32          0  dst      u32
//!   4  type     i32          4  flags    u32
//!   8  payload  [u8; 56]     8  message  [u8; 64]
//!                           72  result   i32
//!                           76  (pad)
//! ```

use super::{IpcError, IpcResult};
use crate::mem::{CopyResult, UserMemory, VirAddr};
use crate::proc::Endpoint;
use bitflags::bitflags;
use core::fmt;

pub const MESSAGE_SIZE: usize = 64;
pub const PAYLOAD_SIZE: usize = 56;
pub const ASYNC_ENTRY_SIZE: usize = 80;

/// Type of kernel notification messages
pub const NOTIFY_MESSAGE: i32 = 0x1000;
/// Type of the quantum exhaustion report sent to schedulers
pub const SCHEDULING_NO_QUANTUM: i32 = 0xF01;

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub source: Endpoint,
    pub mtype: i32,
    pub payload: [u8; PAYLOAD_SIZE],
}

impl Default for Message {
    fn default() -> Self {
        Message {
            source: Endpoint::NONE,
            mtype: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }
}

impl Message {
    pub fn new(mtype: i32) -> Self {
        Message {
            mtype,
            ..Message::default()
        }
    }

    /// Notification from `src`; `sigs` is only non-zero for the system task
    pub fn notify(src: Endpoint, timestamp: u64, sigs: u64) -> Self {
        let mut m = Message::new(NOTIFY_MESSAGE);
        m.source = src;
        m.put_u64(0, timestamp);
        m.put_u64(8, sigs);
        m
    }

    pub fn put_u32(&mut self, off: usize, v: u32) {
        self.payload[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u32(&self, off: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.payload[off..off + 4]);
        u32::from_le_bytes(b)
    }

    pub fn put_u64(&mut self, off: usize, v: u64) {
        self.payload[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn get_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.payload[off..off + 8]);
        u64::from_le_bytes(b)
    }

    /// Copy `bytes` into the payload at `off`, truncating at its end
    pub fn put_bytes(&mut self, off: usize, bytes: &[u8]) {
        let n = bytes.len().min(PAYLOAD_SIZE.saturating_sub(off));
        self.payload[off..off + n].copy_from_slice(&bytes[..n]);
    }

    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut out = [0u8; MESSAGE_SIZE];
        out[0..4].copy_from_slice(&self.source.raw().to_le_bytes());
        out[4..8].copy_from_slice(&self.mtype.to_le_bytes());
        out[8..].copy_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8; MESSAGE_SIZE]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[0..4]);
        let source = Endpoint::from_raw(u32::from_le_bytes(word));
        word.copy_from_slice(&bytes[4..8]);
        let mtype = i32::from_le_bytes(word);
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&bytes[8..]);
        Message {
            source,
            mtype,
            payload,
        }
    }

    pub fn read_from(mem: &dyn UserMemory, space: Endpoint, addr: VirAddr) -> CopyResult<Self> {
        let mut buf = [0u8; MESSAGE_SIZE];
        mem.copy_from_user(space, addr, &mut buf)?;
        Ok(Message::decode(&buf))
    }

    pub fn write_to(&self, mem: &dyn UserMemory, space: Endpoint, addr: VirAddr) -> CopyResult<()> {
        mem.copy_to_user(space, addr, &self.encode())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("source", &self.source)
            .field("mtype", &format_args!("{:#x}", self.mtype))
            .finish_non_exhaustive()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AsyncFlags: u32 {
        /// Entry holds a message
        const VALID = 0x01;
        /// Entry was delivered or failed
        const DONE = 0x02;
        /// Notify the sender when the entry completes
        const NOTIFY = 0x04;
        /// Do not deliver while the receiver waits for a SENDREC reply
        const NOREPLY = 0x08;
        /// Notify the sender only if the entry fails
        const NOTIFY_ERR = 0x10;
    }
}

/// One slot of an async send table in process memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEntry {
    pub dst: Endpoint,
    /// Raw flags; bits outside `AsyncFlags` make the entry invalid
    pub flags: u32,
    pub msg: Message,
    pub result: i32,
}

const FLAGS_OFFSET: u64 = 4;
const RESULT_OFFSET: u64 = 72;

impl AsyncEntry {
    pub fn new(dst: Endpoint, flags: AsyncFlags, msg: Message) -> Self {
        AsyncEntry {
            dst,
            flags: flags.bits(),
            msg,
            result: 0,
        }
    }

    /// Known flags, or Invalid when unknown bits are set
    pub fn checked_flags(&self) -> IpcResult<AsyncFlags> {
        AsyncFlags::from_bits(self.flags).ok_or(IpcError::Invalid)
    }

    pub fn encode(&self) -> [u8; ASYNC_ENTRY_SIZE] {
        let mut out = [0u8; ASYNC_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.dst.raw().to_le_bytes());
        out[4..8].copy_from_slice(&self.flags.to_le_bytes());
        out[8..72].copy_from_slice(&self.msg.encode());
        out[72..76].copy_from_slice(&self.result.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; ASYNC_ENTRY_SIZE]) -> Self {
        let word = |off: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[off..off + 4]);
            b
        };
        let mut msg = [0u8; MESSAGE_SIZE];
        msg.copy_from_slice(&bytes[8..72]);
        AsyncEntry {
            dst: Endpoint::from_raw(u32::from_le_bytes(word(0))),
            flags: u32::from_le_bytes(word(4)),
            msg: Message::decode(&msg),
            result: i32::from_le_bytes(word(72)),
        }
    }

    fn addr(table: VirAddr, index: usize) -> VirAddr {
        table + (index * ASYNC_ENTRY_SIZE) as u64
    }

    pub fn read(mem: &dyn UserMemory, space: Endpoint, table: VirAddr, index: usize) -> CopyResult<Self> {
        let mut buf = [0u8; ASYNC_ENTRY_SIZE];
        mem.copy_from_user(space, Self::addr(table, index), &mut buf)?;
        Ok(AsyncEntry::decode(&buf))
    }

    pub fn write(&self, mem: &dyn UserMemory, space: Endpoint, table: VirAddr, index: usize) -> CopyResult<()> {
        mem.copy_to_user(space, Self::addr(table, index), &self.encode())
    }

    /// Write back only the flags and result fields
    pub fn write_status(&self, mem: &dyn UserMemory, space: Endpoint, table: VirAddr, index: usize) -> CopyResult<()> {
        let base = Self::addr(table, index);
        mem.copy_to_user(space, base + FLAGS_OFFSET, &self.flags.to_le_bytes())?;
        mem.copy_to_user(space, base + RESULT_OFFSET, &self.result.to_le_bytes())
    }
}

/// Statistics sent to a scheduler when one of its processes runs out of quantum
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoQuantumReport {
    pub time_in_queue_ms: u64,
    pub dequeues: u32,
    pub ipc_sync: u32,
    pub ipc_async: u32,
    pub preempted: u32,
    pub cpu: u32,
    /// Busy percentage of that CPU since the previous report
    pub cpu_load: u32,
}

impl NoQuantumReport {
    pub fn encode(&self, source: Endpoint) -> Message {
        let mut m = Message::new(SCHEDULING_NO_QUANTUM);
        m.source = source;
        m.put_u64(0, self.time_in_queue_ms);
        m.put_u32(8, self.dequeues);
        m.put_u32(12, self.ipc_sync);
        m.put_u32(16, self.ipc_async);
        m.put_u32(20, self.preempted);
        m.put_u32(24, self.cpu);
        m.put_u32(28, self.cpu_load);
        m
    }

    pub fn decode(m: &Message) -> Option<Self> {
        if m.mtype != SCHEDULING_NO_QUANTUM {
            return None;
        }
        Some(NoQuantumReport {
            time_in_queue_ms: m.get_u64(0),
            dequeues: m.get_u32(8),
            ipc_sync: m.get_u32(12),
            ipc_async: m.get_u32(16),
            preempted: m.get_u32(20),
            cpu: m.get_u32(24),
            cpu_load: m.get_u32(28),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::SparseMemory;

    #[test]
    fn test_message_layout() {
        let mut m = Message::new(7);
        m.source = Endpoint::new(3, 1);
        m.put_bytes(0, b"hi");
        let bytes = m.encode();
        assert_eq!(&bytes[0..4], &Endpoint::new(3, 1).raw().to_le_bytes());
        assert_eq!(&bytes[4..8], &7i32.to_le_bytes());
        assert_eq!(&bytes[8..10], b"hi");
        assert_eq!(Message::decode(&bytes), m);
    }

    #[test]
    fn test_put_bytes_truncates() {
        let mut m = Message::default();
        m.put_bytes(50, &[1; 10]);
        assert_eq!(&m.payload[50..], &[1; 6]);
    }

    #[test]
    fn test_async_entry_status_write_back() {
        let mem = SparseMemory::new();
        let space = Endpoint::new(4, 0);
        mem.map(space, 0x1000, 2 * ASYNC_ENTRY_SIZE, true).unwrap();

        let mut e = AsyncEntry::new(Endpoint::new(6, 0), AsyncFlags::VALID, Message::new(42));
        e.write(&mem, space, 0x1000, 1).unwrap();
        e.flags |= AsyncFlags::DONE.bits();
        e.result = -105;
        e.msg = Message::new(99);
        e.write_status(&mem, space, 0x1000, 1).unwrap();

        let back = AsyncEntry::read(&mem, space, 0x1000, 1).unwrap();
        assert_eq!(back.checked_flags(), Ok(AsyncFlags::VALID | AsyncFlags::DONE));
        assert_eq!(back.result, -105);
        // The message itself is not written back
        assert_eq!(back.msg.mtype, 42);
    }

    #[test]
    fn test_unknown_async_flags_invalid() {
        let mut e = AsyncEntry::new(Endpoint::new(6, 0), AsyncFlags::VALID, Message::default());
        e.flags |= 0x100;
        assert_eq!(e.checked_flags(), Err(IpcError::Invalid));
    }

    #[test]
    fn test_no_quantum_report() {
        let report = NoQuantumReport {
            time_in_queue_ms: 120,
            dequeues: 3,
            ipc_sync: 9,
            ipc_async: 1,
            preempted: 2,
            cpu: 1,
            cpu_load: 75,
        };
        let m = report.encode(Endpoint::new(8, 0));
        assert_eq!(m.source, Endpoint::new(8, 0));
        assert_eq!(NoQuantumReport::decode(&m), Some(report));
        assert_eq!(NoQuantumReport::decode(&Message::new(1)), None);
    }
}

//! User Memory Access
//!
//! The IPC engine never touches process memory directly. Message buffers and
//! async tables are copied in and out through the `UserMemory` collaborator,
//! which validates every page of the range first. A copy that hits an
//! unmapped page fails with a `CopyFault`; the engine may then ask the memory
//! manager to repair the mapping with `request_fixup`.
//!
//! `SparseMemory` is the in-kernel implementation used on the host: a sparse
//! page map per address space, keyed by the owning endpoint.

use crate::proc::Endpoint;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

/// Virtual address inside a process address space
pub type VirAddr = u64;

pub const PAGE_SIZE: u64 = 4096;

/// Error codes for user copies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    /// Page at `addr` is not mapped
    PageNotPresent { addr: VirAddr },
    /// Page at `addr` is mapped read-only
    ReadOnly { addr: VirAddr },
    /// Range wraps the address space
    Overflow,
}

/// Result type for user copies
pub type CopyResult<T> = Result<T, CopyFault>;

/// Byte-level access to process address spaces
pub trait UserMemory: Send + Sync {
    /// Copy `dst.len()` bytes starting at `addr` in `space`
    fn copy_from_user(&self, space: Endpoint, addr: VirAddr, dst: &mut [u8]) -> CopyResult<()>;

    /// Copy `src` to `addr` in `space`
    fn copy_to_user(&self, space: Endpoint, addr: VirAddr, src: &[u8]) -> CopyResult<()>;

    /// Ask the memory manager to make `len` bytes at `addr` writable.
    ///
    /// Returns true when the range is usable on return, false when the
    /// request was queued and the process must wait for the manager.
    fn request_fixup(&self, space: Endpoint, addr: VirAddr, len: usize) -> bool;

    /// Drop an address space whose process has exited
    fn release(&self, _space: Endpoint) {}
}

fn page_range(addr: VirAddr, len: usize) -> CopyResult<(u64, u64)> {
    let end = addr
        .checked_add(len as u64)
        .ok_or(CopyFault::Overflow)?;
    let first = addr / PAGE_SIZE;
    let last = if len == 0 { first } else { (end - 1) / PAGE_SIZE + 1 };
    Ok((first, last))
}

struct Page {
    data: Box<[u8; PAGE_SIZE as usize]>,
    writable: bool,
}

impl Page {
    fn new(writable: bool) -> Self {
        Page {
            data: Box::new([0; PAGE_SIZE as usize]),
            writable,
        }
    }
}

/// Sparse page map for every address space
pub struct SparseMemory {
    pages: Mutex<BTreeMap<(u32, u64), Page>>,
    fixups_allowed: AtomicBool,
    fixup_requests: AtomicU64,
}

impl SparseMemory {
    pub fn new() -> Self {
        SparseMemory {
            pages: Mutex::new(BTreeMap::new()),
            fixups_allowed: AtomicBool::new(true),
            fixup_requests: AtomicU64::new(0),
        }
    }

    /// Map `len` bytes at `addr` in `space`, zero-filled
    pub fn map(&self, space: Endpoint, addr: VirAddr, len: usize, writable: bool) -> CopyResult<()> {
        let (first, last) = page_range(addr, len)?;
        let mut pages = self.pages.lock();
        for page in first..last {
            pages
                .entry((space.raw(), page))
                .and_modify(|p| p.writable = writable)
                .or_insert_with(|| Page::new(writable));
        }
        Ok(())
    }

    /// Remove the pages covering `len` bytes at `addr`
    pub fn unmap(&self, space: Endpoint, addr: VirAddr, len: usize) -> CopyResult<()> {
        let (first, last) = page_range(addr, len)?;
        let mut pages = self.pages.lock();
        for page in first..last {
            pages.remove(&(space.raw(), page));
        }
        Ok(())
    }

    /// Whether `request_fixup` maps the page synchronously
    pub fn set_fixups_allowed(&self, allowed: bool) {
        self.fixups_allowed.store(allowed, Ordering::Relaxed);
    }

    pub fn fixup_requests(&self) -> u64 {
        self.fixup_requests.load(Ordering::Relaxed)
    }

    pub fn mapped_pages(&self, space: Endpoint) -> usize {
        let raw = space.raw();
        self.pages.lock().keys().filter(|(s, _)| *s == raw).count()
    }
}

impl Default for SparseMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl UserMemory for SparseMemory {
    fn copy_from_user(&self, space: Endpoint, addr: VirAddr, dst: &mut [u8]) -> CopyResult<()> {
        let (first, last) = page_range(addr, dst.len())?;
        let pages = self.pages.lock();

        // Validate the whole range before copying anything
        for page in first..last {
            if !pages.contains_key(&(space.raw(), page)) {
                return Err(CopyFault::PageNotPresent {
                    addr: (page * PAGE_SIZE).max(addr),
                });
            }
        }

        let mut cur = addr;
        let mut done = 0;
        while done < dst.len() {
            let off = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - off).min(dst.len() - done);
            if let Some(page) = pages.get(&(space.raw(), cur / PAGE_SIZE)) {
                dst[done..done + chunk].copy_from_slice(&page.data[off..off + chunk]);
            }
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    fn copy_to_user(&self, space: Endpoint, addr: VirAddr, src: &[u8]) -> CopyResult<()> {
        let (first, last) = page_range(addr, src.len())?;
        let mut pages = self.pages.lock();

        for page in first..last {
            let fault_addr = (page * PAGE_SIZE).max(addr);
            match pages.get(&(space.raw(), page)) {
                Some(p) if !p.writable => return Err(CopyFault::ReadOnly { addr: fault_addr }),
                Some(_) => {}
                None => return Err(CopyFault::PageNotPresent { addr: fault_addr }),
            }
        }

        let mut cur = addr;
        let mut done = 0;
        while done < src.len() {
            let off = (cur % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - off).min(src.len() - done);
            if let Some(page) = pages.get_mut(&(space.raw(), cur / PAGE_SIZE)) {
                page.data[off..off + chunk].copy_from_slice(&src[done..done + chunk]);
            }
            done += chunk;
            cur += chunk as u64;
        }
        Ok(())
    }

    fn request_fixup(&self, space: Endpoint, addr: VirAddr, len: usize) -> bool {
        self.fixup_requests.fetch_add(1, Ordering::Relaxed);
        if !self.fixups_allowed.load(Ordering::Relaxed) {
            return false;
        }
        self.map(space, addr, len, true).is_ok()
    }

    fn release(&self, space: Endpoint) {
        let raw = space.raw();
        self.pages.lock().retain(|(s, _), _| *s != raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> Endpoint {
        Endpoint::new(5, 1)
    }

    #[test]
    fn test_copy_across_page_boundary() {
        let mem = SparseMemory::new();
        mem.map(space(), PAGE_SIZE - 4, 8, true).unwrap();
        mem.copy_to_user(space(), PAGE_SIZE - 4, &[1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        let mut out = [0u8; 8];
        mem.copy_from_user(space(), PAGE_SIZE - 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(mem.mapped_pages(space()), 2);
    }

    #[test]
    fn test_unmapped_page_faults() {
        let mem = SparseMemory::new();
        mem.map(space(), 0, 16, true).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(
            mem.copy_from_user(space(), PAGE_SIZE, &mut out),
            Err(CopyFault::PageNotPresent { addr: PAGE_SIZE })
        );
        // Other spaces are separate
        assert!(mem.copy_from_user(Endpoint::new(6, 1), 0, &mut out).is_err());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let mem = SparseMemory::new();
        mem.map(space(), 0, 16, false).unwrap();
        assert_eq!(
            mem.copy_to_user(space(), 8, &[1]),
            Err(CopyFault::ReadOnly { addr: 8 })
        );
    }

    #[test]
    fn test_fixup_maps_when_allowed() {
        let mem = SparseMemory::new();
        mem.set_fixups_allowed(false);
        assert!(!mem.request_fixup(space(), 0x2000, 64));
        mem.set_fixups_allowed(true);
        assert!(mem.request_fixup(space(), 0x2000, 64));
        assert!(mem.copy_to_user(space(), 0x2000, &[9; 64]).is_ok());
        assert_eq!(mem.fixup_requests(), 2);
    }

    #[test]
    fn test_release_drops_space() {
        let mem = SparseMemory::new();
        mem.map(space(), 0, 3 * PAGE_SIZE as usize, true).unwrap();
        mem.release(space());
        assert_eq!(mem.mapped_pages(space()), 0);
    }
}

//! Synchronization primitives for multi-core support
//! This module provides the three interchangeable lock algorithms, the
//! boot-selected strategy that owns the kernel's lock words, and the lock
//! ordering rules.

mod mcs;
mod spin;
mod strategy;
mod ticket;
pub mod lock_ordering;


pub use mcs::{McsLock, McsNode};
pub use spin::{RawSpinLock, SpinLock, SpinLockGuard};
pub use strategy::{
    new_strategy, LockId, LockKind, LockStrategy, McsLocks, Relax, SpinLocks, SpinRelax,
    TicketLocks,
};
pub use ticket::TicketLock;

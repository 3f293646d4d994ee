//! MelloOS IPC core
//!
//! The concurrency heart of a microkernel: synchronous and asynchronous
//! message passing between processes, per-CPU run queues, the SMP
//! coordinator that lets one CPU change a process owned by another, and
//! the clock that drives quanta and kernel timers.
//!
//! Everything hangs off an explicit [`Kernel`] built by [`Kernel::boot`].
//! Code "running on" a CPU enters it through [`Kernel::cpu`]:
//!
//! ```no_run
//! use mellos_ipc_core::{BootConfig, Endpoint, IpcRequest, Kernel, ProcSpec, SparseMemory};
//! use std::sync::Arc;
//!
//! let kernel = Kernel::boot(BootConfig::default(), Arc::new(SparseMemory::new())).unwrap();
//! let cpu = kernel.cpu(0);
//! let server = cpu.spawn(ProcSpec::new("server")).unwrap();
//! cpu.ipc_call(server, IpcRequest::Receive { src: Endpoint::ANY, msg: 0x1000 }).unwrap();
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod log;

pub mod clock;
pub mod config;
pub mod ipc;
pub mod kernel;
pub mod mem;
pub mod metrics;
pub mod proc;
pub mod sched;
pub mod smp;
pub mod sync;

pub use clock::{TimerAction, TimerId};
pub use config::{BootConfig, ConfigError, LockMode};
pub use ipc::{IpcCall, IpcError, IpcRequest, IpcResult, Message};
pub use kernel::{Completion, Cpu, Kernel};
pub use mem::{SparseMemory, UserMemory, VirAddr};
pub use metrics::MetricsSnapshot;
pub use proc::{Endpoint, PrivFlags, ProcInfo, ProcSpec, RtsFlags};
pub use sched::{SchedError, SchedResult};
pub use sync::LockKind;

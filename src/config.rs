//! Configuration constants and boot parameters for the MelloOS IPC core

use crate::log::LogLevel;
use crate::sync::LockKind;
use core::fmt;

/// Scheduler tick frequency in Hz (100 Hz = 10ms per tick)
/// Used when the boot parameters carry no valid `hz` value
pub const SCHED_HZ: u32 = 100;

/// Accepted range for the `hz` boot parameter
pub const MIN_HZ: u32 = 2;
pub const MAX_HZ: u32 = 50_000;

/// Maximum number of CPUs supported by the kernel
pub const MAX_CPUS: usize = 16;

/// Upper bound on process table slots (kernel tasks included)
pub const MAX_PROCS: usize = 256;

/// Kernel pseudo-processes occupying the first table slots
pub const NR_TASKS: usize = 3;

/// Default number of process table slots
pub const DEFAULT_PROCS: usize = 64;

/// Number of scheduling queues; queue 0 has the highest priority
pub const NR_SCHED_QUEUES: usize = 16;
pub const TASK_Q: u8 = 0;
pub const MAX_USER_Q: u8 = 0;
pub const USER_Q: u8 = 7;
pub const MIN_USER_Q: u8 = 14;
pub const IDLE_Q: u8 = 15;

/// Default quantum in clock ticks
pub const DEFAULT_QUANTUM_TICKS: u32 = 10;

/// How often receive() may re-scan its sources after a concurrent sender
/// raced with it before it commits to blocking
pub const MAX_RECEIVE_RETRIES: u32 = 8;

/// An async send table may hold at most this many entries per table slot
pub const ASYNC_SIZE_FACTOR: usize = 16;

/// Load average history: slots in the ring and seconds per slot
pub const LOAD_HISTORY: usize = 64;
pub const LOAD_UNIT_SECS: u64 = 6;

/// Spin iterations a coordinator request may wait for the remote ack
pub const DEFAULT_IPI_SPIN_LIMIT: u64 = 1 << 34;

/// Whether the kernel runs with per-process locks or one coarse lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Every process has its own lock; multi-process operations use ProcSet
    Fine,
    /// One kernel-wide lock serializes all kernel entries
    Coarse,
}

/// Errors reported while parsing boot parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Parameter is not of the form `key=value`
    Malformed,
    /// Key is not recognised
    UnknownKey,
    /// Value is not a number where one is required
    InvalidNumber,
    /// `lock=` names no known strategy
    UnknownLockStrategy,
    /// `mode=` is neither `fine` nor `coarse`
    UnknownLockMode,
    /// `cpus=` is zero or above MAX_CPUS
    InvalidCpuCount,
    /// `procs=` cannot hold the kernel tasks or exceeds MAX_PROCS
    InvalidProcCount,
    /// `loglevel=` names no known level
    UnknownLogLevel,
    /// `hz` is outside MIN_HZ..=MAX_HZ
    InvalidHz,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let what = match self {
            ConfigError::Malformed => "malformed boot parameter",
            ConfigError::UnknownKey => "unknown boot parameter",
            ConfigError::InvalidNumber => "invalid number",
            ConfigError::UnknownLockStrategy => "unknown lock strategy",
            ConfigError::UnknownLockMode => "unknown lock mode",
            ConfigError::InvalidCpuCount => "invalid cpu count",
            ConfigError::InvalidProcCount => "invalid process count",
            ConfigError::UnknownLogLevel => "unknown log level",
            ConfigError::InvalidHz => "tick frequency out of range",
        };
        f.write_str(what)
    }
}

/// Runtime configuration handed to `Kernel::boot`
///
/// Built either programmatically or from a boot parameter string such as
/// `"hz=100 cpus=4 procs=64 lock=mcs mode=fine loglevel=debug"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub hz: u32,
    pub cpus: usize,
    pub procs: usize,
    pub lock: LockKind,
    pub mode: LockMode,
    pub log_level: LogLevel,
    pub quantum_ticks: u32,
    pub ipi_spin_limit: u64,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            hz: SCHED_HZ,
            cpus: 1,
            procs: DEFAULT_PROCS,
            lock: LockKind::Spin,
            mode: LockMode::Fine,
            log_level: LogLevel::Info,
            quantum_ticks: DEFAULT_QUANTUM_TICKS,
            ipi_spin_limit: DEFAULT_IPI_SPIN_LIMIT,
        }
    }
}

impl BootConfig {
    /// Parse whitespace separated `key=value` boot parameters
    ///
    /// Keys not given keep their default. An out-of-range `hz` falls back to
    /// `SCHED_HZ` with a warning rather than failing the boot.
    pub fn parse(params: &str) -> Result<Self, ConfigError> {
        let mut cfg = BootConfig::default();

        for param in params.split_whitespace() {
            let (key, value) = param.split_once('=').ok_or(ConfigError::Malformed)?;
            match key {
                "hz" => {
                    let hz: u32 = value.parse().map_err(|_| ConfigError::InvalidNumber)?;
                    if (MIN_HZ..=MAX_HZ).contains(&hz) {
                        cfg.hz = hz;
                    } else {
                        crate::log_warn!("config", "hz={} out of range, using {}", hz, SCHED_HZ);
                        cfg.hz = SCHED_HZ;
                    }
                }
                "cpus" => {
                    cfg.cpus = value.parse().map_err(|_| ConfigError::InvalidNumber)?;
                }
                "procs" => {
                    cfg.procs = value.parse().map_err(|_| ConfigError::InvalidNumber)?;
                }
                "quantum" => {
                    cfg.quantum_ticks = value.parse().map_err(|_| ConfigError::InvalidNumber)?;
                }
                "lock" => {
                    cfg.lock = LockKind::from_name(value).ok_or(ConfigError::UnknownLockStrategy)?;
                }
                "mode" => {
                    cfg.mode = match value {
                        "fine" => LockMode::Fine,
                        "coarse" => LockMode::Coarse,
                        _ => return Err(ConfigError::UnknownLockMode),
                    };
                }
                "loglevel" => {
                    cfg.log_level = LogLevel::from_name(value).ok_or(ConfigError::UnknownLogLevel)?;
                }
                _ => return Err(ConfigError::UnknownKey),
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check the cross-field limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_HZ..=MAX_HZ).contains(&self.hz) {
            return Err(ConfigError::InvalidHz);
        }
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(ConfigError::InvalidCpuCount);
        }
        if self.procs <= NR_TASKS || self.procs > MAX_PROCS {
            return Err(ConfigError::InvalidProcCount);
        }
        if self.quantum_ticks == 0 {
            return Err(ConfigError::InvalidNumber);
        }
        Ok(())
    }

    pub fn with_cpus(mut self, cpus: usize) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn with_lock(mut self, lock: LockKind) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_procs(mut self, procs: usize) -> Self {
        self.procs = procs;
        self
    }

    /// Largest async table accepted by senda()
    pub fn max_async_entries(&self) -> usize {
        ASYNC_SIZE_FACTOR * self.procs
    }
}

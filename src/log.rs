//! Structured logging module for the MelloOS IPC core
//! Provides logging with format: [cpuN][subsys][LEVEL] message
//! Supports log levels: ERROR, WARN, INFO, DEBUG, TRACE

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use spin::{Mutex, Once};

/// Log levels for kernel logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Critical errors that may cause system instability
    Error = 0,
    /// Warning conditions that should be addressed
    Warn = 1,
    /// Informational messages about important events
    Info = 2,
    /// Detailed debugging information
    Debug = 3,
    /// Very verbose tracing information
    Trace = 4,
}

impl LogLevel {
    /// Get the string representation of the log level
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Parse a lower-case level name as used in boot parameters
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "error" => Some(LogLevel::Error),
            "warn" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Global log level filter
/// Only messages at or below this level will be logged
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Set the global log level
pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Get the current global log level
pub fn get_log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::Error,
        1 => LogLevel::Warn,
        2 => LogLevel::Info,
        3 => LogLevel::Debug,
        4 => LogLevel::Trace,
        _ => LogLevel::Info,
    }
}

/// Check if a log level should be logged
#[inline]
pub fn should_log(level: LogLevel) -> bool {
    level <= get_log_level()
}

/// Optional console sink, e.g. a serial port writer on real hardware
static CONSOLE: Once<fn(&str)> = Once::new();

/// Install the console sink. Only the first call has an effect.
pub fn set_console(sink: fn(&str)) {
    CONSOLE.call_once(|| sink);
}

/// Kernel log buffer for dmesg
/// Uses a fixed-size circular buffer to store log messages
const LOG_BUFFER_SIZE: usize = 65536;
const MAX_LOG_ENTRIES: usize = 1000;

struct LogBuffer {
    buffer: [u8; LOG_BUFFER_SIZE],
    write_pos: usize,
    entries: usize,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            buffer: [0; LOG_BUFFER_SIZE],
            write_pos: 0,
            entries: 0,
        }
    }

    fn add_message(&mut self, message: &str) {
        let bytes = message.as_bytes();
        let len = bytes.len();

        if len >= LOG_BUFFER_SIZE {
            return;
        }

        // If we would overflow, wrap around
        if self.write_pos + len + 1 > LOG_BUFFER_SIZE {
            self.write_pos = 0;
            self.entries = 0;
        }

        self.buffer[self.write_pos..self.write_pos + len].copy_from_slice(bytes);
        self.buffer[self.write_pos + len] = b'\n';
        self.write_pos += len + 1;

        if self.entries < MAX_LOG_ENTRIES {
            self.entries += 1;
        }
    }

    fn read_all(&self) -> &[u8] {
        &self.buffer[..self.write_pos]
    }
}

static LOG_BUFFER: Mutex<LogBuffer> = Mutex::new(LogBuffer::new());

/// Read the kernel log buffer into a provided buffer
/// Returns the number of bytes copied
pub fn read_log_buffer(dest: &mut [u8]) -> usize {
    let buffer = LOG_BUFFER.lock();
    let data = buffer.read_all();
    let to_copy = core::cmp::min(data.len(), dest.len());
    dest[..to_copy].copy_from_slice(&data[..to_copy]);
    to_copy
}

/// Number of messages currently held in the log buffer
pub fn log_entries() -> usize {
    LOG_BUFFER.lock().entries
}

/// Fixed-capacity formatter; output beyond 512 bytes is truncated
struct LogWriter {
    buffer: [u8; 512],
    pos: usize,
}

impl LogWriter {
    fn new() -> Self {
        Self {
            buffer: [0u8; 512],
            pos: 0,
        }
    }

    fn as_str(&self) -> Result<&str, core::str::Utf8Error> {
        core::str::from_utf8(&self.buffer[..self.pos])
    }
}

impl fmt::Write for LogWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buffer.len() - self.pos;
        let to_write = core::cmp::min(bytes.len(), remaining);
        self.buffer[self.pos..self.pos + to_write].copy_from_slice(&bytes[..to_write]);
        self.pos += to_write;
        Ok(())
    }
}

/// Internal logging function
/// Format: [cpuN][subsys][LEVEL] message
#[doc(hidden)]
pub fn _log(level: LogLevel, cpu: Option<usize>, subsys: &str, args: fmt::Arguments) {
    use core::fmt::Write;

    if !should_log(level) {
        return;
    }

    let mut writer = LogWriter::new();
    let _ = match cpu {
        Some(cpu) => write!(writer, "[cpu{}][{}][{}] {}", cpu, subsys, level.as_str(), args),
        None => write!(writer, "[cpu?][{}][{}] {}", subsys, level.as_str(), args),
    };

    // A truncated multi-byte character makes the tail invalid; keep the valid prefix
    let message = match writer.as_str() {
        Ok(message) => message,
        Err(e) => match core::str::from_utf8(&writer.buffer[..e.valid_up_to()]) {
            Ok(prefix) => prefix,
            Err(_) => return,
        },
    };

    if let Some(console) = CONSOLE.get() {
        console(message);
    }
    LOG_BUFFER.lock().add_message(message);
}

/// Log an error message
/// Format: [cpuN][subsys][ERROR] message
#[macro_export]
macro_rules! log_error {
    (cpu = $cpu:expr; $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Error, Some($cpu), $subsys, format_args!($($arg)*))
    };
    ($subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Error, None, $subsys, format_args!($($arg)*))
    };
}

/// Log a warning message
/// Format: [cpuN][subsys][WARN] message
#[macro_export]
macro_rules! log_warn {
    (cpu = $cpu:expr; $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Warn, Some($cpu), $subsys, format_args!($($arg)*))
    };
    ($subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Warn, None, $subsys, format_args!($($arg)*))
    };
}

/// Log an informational message
/// Format: [cpuN][subsys][INFO] message
#[macro_export]
macro_rules! log_info {
    (cpu = $cpu:expr; $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Info, Some($cpu), $subsys, format_args!($($arg)*))
    };
    ($subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Info, None, $subsys, format_args!($($arg)*))
    };
}

/// Log a debug message
/// Format: [cpuN][subsys][DEBUG] message
#[macro_export]
macro_rules! log_debug {
    (cpu = $cpu:expr; $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Debug, Some($cpu), $subsys, format_args!($($arg)*))
    };
    ($subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Debug, None, $subsys, format_args!($($arg)*))
    };
}

/// Log a trace message
/// Format: [cpuN][subsys][TRACE] message
#[macro_export]
macro_rules! log_trace {
    (cpu = $cpu:expr; $subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Trace, Some($cpu), $subsys, format_args!($($arg)*))
    };
    ($subsys:expr, $($arg:tt)*) => {
        $crate::log::_log($crate::log::LogLevel::Trace, None, $subsys, format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_order() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::from_name("trace"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_name("loud"), None);
    }

    #[test]
    fn test_ring_wraps() {
        let mut ring = LogBuffer::new();
        let line = [b'x'; 1000];
        let line = core::str::from_utf8(&line).unwrap();
        for _ in 0..70 {
            ring.add_message(line);
        }
        // 65 lines fit before the wrap, the rest start over at offset 0
        assert_eq!(ring.read_all().len(), 5 * 1001);
    }

    #[test]
    fn test_log_lands_in_buffer() {
        crate::log_error!(cpu = 3; "test", "marker {}", 0xfeed);
        let mut out = [0u8; LOG_BUFFER_SIZE];
        let n = read_log_buffer(&mut out);
        let text = core::str::from_utf8(&out[..n]).unwrap();
        assert!(text.contains("[cpu3][test][ERROR] marker 65261"));
    }
}

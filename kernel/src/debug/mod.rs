//! Debug output and logging
//!
//! Provides configurable logging with multiple levels:
//! - ERROR: Critical errors only
//! - WARN: Warnings and errors
//! - INFO: General information (default)
//! - DEBUG: Detailed debug information
//! - TRACE: Very detailed tracing
//!
//! Controlled via Cargo features:
//! - `log-error`: ERROR level only
//! - `log-warn`: WARN level and above
//! - `log-info`: INFO level and above (default)
//! - `log-debug`: DEBUG level and above
//! - `log-trace`: TRACE level (everything)
//!
//! Besides the console, the log can be mirrored to a user-space port set
//! with the `set-log-port` syscall; log lines are then delivered as plain
//! write messages to whoever owns that port.

use crate::components::console::Console;
use crate::objects::port::Port;
use alloc::sync::Weak;
use core::fmt;
use spin::Mutex;

/// Debug writer (uses the configured console)
pub struct DebugWriter;

impl fmt::Write for DebugWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::config::console().puts(s);
        log_port_forward(s.as_bytes());
        Ok(())
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

/// Get current log level based on compile-time features
#[inline(always)]
pub const fn current_log_level() -> LogLevel {
    #[cfg(feature = "log-trace")]
    return LogLevel::Trace;

    #[cfg(all(feature = "log-debug", not(feature = "log-trace")))]
    return LogLevel::Debug;

    #[cfg(all(feature = "log-info", not(any(feature = "log-debug", feature = "log-trace"))))]
    return LogLevel::Info;

    #[cfg(all(feature = "log-warn", not(any(feature = "log-info", feature = "log-debug", feature = "log-trace"))))]
    return LogLevel::Warn;

    #[cfg(all(feature = "log-error", not(any(feature = "log-warn", feature = "log-info", feature = "log-debug", feature = "log-trace"))))]
    return LogLevel::Error;

    #[cfg(not(any(
        feature = "log-error",
        feature = "log-warn",
        feature = "log-info",
        feature = "log-debug",
        feature = "log-trace"
    )))]
    return LogLevel::Info;
}

/// Check if a log level should be printed
#[inline(always)]
pub const fn should_log(level: LogLevel) -> bool {
    level as u8 <= current_log_level() as u8
}

/// Port the kernel log is mirrored to, once `set-log-port` has been called.
static LOG_PORT: Mutex<Option<Weak<Port>>> = Mutex::new(None);

/// Redirect kernel log output to a user port.
pub fn set_log_port(port: Weak<Port>) {
    *LOG_PORT.lock() = Some(port);
}

fn log_port_forward(bytes: &[u8]) {
    let guard = LOG_PORT.lock();
    if let Some(weak) = guard.as_ref() {
        if let Some(port) = weak.upgrade() {
            // Best effort: a full or dead port must never break kernel logging.
            let _ = port.send_log_bytes(bytes);
        }
    }
}

/// Print macro for kernel (unconditional)
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = write!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// Print with newline macro for kernel (unconditional)
#[macro_export]
macro_rules! kprintln {
    () => ($crate::kprint!("\n"));
    ($($arg:tt)*) => ({
        use core::fmt::Write;
        let _ = writeln!($crate::debug::DebugWriter, $($arg)*);
    });
}

/// Log ERROR message
#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Error) {
            $crate::kprintln!("[ERROR] {}", format_args!($($arg)*));
        }
    });
}

/// Log WARN message
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Warn) {
            $crate::kprintln!("[WARN]  {}", format_args!($($arg)*));
        }
    });
}

/// Log INFO message
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Info) {
            $crate::kprintln!("[INFO]  {}", format_args!($($arg)*));
        }
    });
}

/// Log DEBUG message
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Debug) {
            $crate::kprintln!("[DEBUG] {}", format_args!($($arg)*));
        }
    });
}

/// Log TRACE message
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => ({
        if $crate::debug::should_log($crate::debug::LogLevel::Trace) {
            $crate::kprintln!("[TRACE] {}", format_args!($($arg)*));
        }
    });
}

/// Scheduler debug output, compiled out unless `debug-scheduler` is set
#[macro_export]
macro_rules! ksched_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug-scheduler")]
        $crate::kprintln!($($arg)*);
    };
}

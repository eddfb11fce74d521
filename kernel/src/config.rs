//! Kernel configuration and component composition
//!
//! Compile-time kernel configuration: which console implementation backs
//! the kernel log is selected with cargo features, mirroring how user-space
//! components are composed at build time.

#[cfg(not(test))]
use crate::components::console::serial16550::{SerialConfig, SerialConsole};
use crate::components::console::{
    null::{NullConfig, NullConsole},
    Console,
};

/// Console component selection (compile-time)
///
/// - `console-serial`: 16550A UART on COM1 (default for QEMU)
/// - `console-null`: no console output
///
/// Host test builds always use the null console; there is no UART to poke.
#[cfg(all(feature = "console-serial", not(feature = "console-null"), not(test)))]
pub static CONSOLE: SerialConsole = SerialConsole::new(SerialConfig { io_base: 0x3f8 });

#[cfg(all(feature = "console-null", not(test)))]
pub static CONSOLE: NullConsole = NullConsole::new(NullConfig);

#[cfg(all(
    not(any(feature = "console-serial", feature = "console-null")),
    not(test)
))]
pub static CONSOLE: SerialConsole = SerialConsole::new(SerialConfig { io_base: 0x3f8 });

#[cfg(test)]
pub static CONSOLE: NullConsole = NullConsole::new(NullConfig);

/// Initialize the kernel console component
///
/// Must be called early in the boot sequence before any debug output.
pub fn init_console() {
    CONSOLE.init();
}

/// Get a reference to the global console
pub fn console() -> &'static impl Console {
    &CONSOLE
}

/// Number of scheduler priority levels.
pub const SCHED_PRIORITY_LEVELS: usize = 16;

/// Default priority for new tasks.
pub const DEFAULT_PRIORITY: u8 = 8;

/// Priorities `0..=SCHED_PINNED_MAX` are never migrated between CPUs by
/// load balancing.
pub const SCHED_PINNED_MAX: u8 = 2;

/// Per-priority quantum in milliseconds. Higher-priority levels run in
/// short bursts and should almost never be preempted, so they get the
/// longer slices.
pub const QUANTUM_MS: [u32; SCHED_PRIORITY_LEVELS] =
    [100, 90, 80, 70, 60, 50, 40, 35, 30, 25, 20, 15, 10, 10, 10, 10];

/// Automatic stack size reserved by `init-stack` when no explicit top is
/// given: a grow-down lazily allocated region of this virtual size.
pub const AUTO_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Soft limit a grow-down region may extend below its start.
pub const GROW_DOWN_SOFT_LIMIT: usize = 64 * 1024 * 1024;

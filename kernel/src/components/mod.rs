//! Minimal kernel components
//!
//! The kernel carries only the components it cannot delegate: a debug
//! console. Everything else (real UART drivers with interrupts and
//! buffering, timers, input) is a user-space server reached over ports.

pub mod console;

//! Thallium microkernel
//!
//! A message-passing microkernel for x86_64. The kernel owns physical
//! memory, address spaces, tasks and ports; everything else (filesystems,
//! drivers, the C runtime) lives in user space and talks over ports.
//!
//! # Architecture
//!
//! The kernel is organized into the following modules:
//! - `arch`: Architecture-specific code (x86_64): trap entry, IDT/GDT,
//!   LAPIC, per-CPU structures
//! - `memory`: Frame allocator, kernel heap, address spaces, regions and
//!   memory objects
//! - `objects`: Kernel objects: tasks, ports, named ports, task groups and
//!   interrupt bindings
//! - `scheduler`: Per-CPU priority ready queues, blocking and migration
//! - `syscall`: The syscall dispatch table
//! - `components`: Minimal kernel components (console)
//! - `debug`: Debug output and logging

#![no_std]

extern crate alloc;

// Module declarations
pub mod arch;
pub mod boot;
pub mod components;
pub mod config;
pub mod debug;
pub mod memory;
pub mod objects;
pub mod scheduler;
pub mod syscall;

pub use thallium_abi::SysError;

/// Result type used on every fallible kernel path. The syscall dispatcher
/// is the single place where the error side becomes a user-visible status.
pub type KernResult<T> = Result<T, SysError>;

//! Flag words used by syscalls.

use bitflags::bitflags;

bitflags! {
    /// Access bits for region creation and mapping calls.
    ///
    /// The low three bits are the access mask installed into page-table
    /// entries; `FIXED` forbids the kernel from relocating the hint address
    /// and `COW` marks object mappings copy-on-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u64 {
        const READ    = 0x01;
        const WRITE   = 0x02;
        const EXEC    = 0x04;
        const FIXED   = 0x08;
        const COW     = 0x10;
    }
}

bitflags! {
    /// Action bits a notifier port can register against a task group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GroupNotifierMask: u64 {
        const ON_DESTROY     = 0x01;
        const ON_REMOVE_TASK = 0x02;
        const ON_ADD_TASK    = 0x04;
    }
}

/// `get-message-info` / `get-port-by-name`: fail with an error instead of
/// blocking when nothing is available.
pub const FLAG_NOBLOCK: u64 = 0x01;

/// `get-first-message`: leave the message at the head of the queue.
pub const MSG_ARG_NOPOP: u64 = 0x01;

/// `asign-page-table` flavors.
pub const PAGE_TABLE_CREATE: u64 = 1;
pub const PAGE_TABLE_ASIGN: u64 = 2;
pub const PAGE_TABLE_CLONE: u64 = 3;

/// `set-attribute` attribute selectors.
pub const ATTR_ALLOW_PORT_IO: u64 = 1;
pub const ATTR_DEBUG_SYSCALLS: u64 = 2;

/// `set-segment` / `get-segment` selectors.
pub const SEGMENT_FS: u64 = 1;
pub const SEGMENT_GS: u64 = 2;
pub const GENERAL_REGS: u64 = 3;

/// `configure-system` subop selectors.
pub const SYS_CONF_LAPIC: u64 = 1;
pub const SYS_CONF_CPU: u64 = 2;
pub const SYS_CONF_SLEEP10: u64 = 3;
pub const SYS_CONF_INT_COMPLETE: u64 = 4;

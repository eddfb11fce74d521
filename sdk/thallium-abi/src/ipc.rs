//! Message descriptors and kernel-originated wire messages.
//!
//! Every message starts with a 32-bit `type` field; the rest is type
//! specific. The kernel never inspects user-defined payloads, but the
//! messages it originates itself have the fixed layouts below. All structs
//! are `repr(C)` and sent byte-for-byte.

/// Filled in by `get-message-info` with the head message's metadata.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageDescriptor {
    pub sender: u64,
    pub channel: u64,
    pub size: u64,
}

/// Message types below this value are reserved for user protocols.
pub const SYSTEM_MESSAGES_START: u64 = 1 << 31;

pub const KERNEL_MSG_INTERRUPT: u32 = 0x20;
/// Plain log bytes forwarded by the kernel to the log port; the payload is
/// the type word followed by raw text.
pub const KERNEL_MSG_LOG_OUTPUT: u32 = 0x40;
pub const KERNEL_MSG_NAMED_PORT_NOTIFICATION: u32 = 0x21;
pub const KERNEL_MSG_REQUEST_PAGE: u32 = 0x23;
pub const KERNEL_MSG_GROUP_DESTROYED: u32 = 0x24;
pub const KERNEL_MSG_GROUP_TASK_CHANGED: u32 = 0x25;

/// Group-change event: a task was removed from the group.
pub const EVENT_GROUP_TASK_REMOVED: u16 = 0x01;
/// Group-change event: a task was added to the group.
pub const EVENT_GROUP_TASK_ADDED: u16 = 0x02;

/// Posted to a bound port when its programmable interrupt vector fires.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelInterrupt {
    /// Must be [`KERNEL_MSG_INTERRUPT`].
    pub msg_type: u32,
    pub intno: u32,
    pub lapic_id: u32,
}

/// Posted to a reply port when a requested named port resolves.
///
/// The port name follows the fixed header as trailing bytes; the name
/// length is the message size minus `size_of::<KernelNamedPortNotification>()`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelNamedPortNotification {
    /// Must be [`KERNEL_MSG_NAMED_PORT_NOTIFICATION`].
    pub msg_type: u32,
    pub reserved: u32,
    pub port_num: u64,
}

/// Posted to a memory object's pager when a mapping faults on an absent page.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelRequestPage {
    /// Must be [`KERNEL_MSG_REQUEST_PAGE`].
    pub msg_type: u32,
    pub flags: u32,
    pub object_id: u64,
    pub page_offset: u64,
}

/// Posted to group notifiers registered with `ON_DESTROY`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelGroupDestroyed {
    /// Must be [`KERNEL_MSG_GROUP_DESTROYED`].
    pub msg_type: u32,
    pub flags: u32,
    pub group_id: u64,
}

/// Posted to group notifiers registered with `ON_ADD_TASK`/`ON_REMOVE_TASK`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KernelGroupTaskChanged {
    /// Must be [`KERNEL_MSG_GROUP_TASK_CHANGED`].
    pub msg_type: u32,
    pub flags: u16,
    /// [`EVENT_GROUP_TASK_ADDED`] or [`EVENT_GROUP_TASK_REMOVED`].
    pub event_type: u16,
    pub group_id: u64,
    pub task_id: u64,
}

/// View a wire struct as its raw bytes for sending.
///
/// Sound for the `repr(C)` field-packed types in this module, which contain
/// no padding and no invalid bit patterns.
pub fn as_bytes<T: Copy>(value: &T) -> &[u8] {
    // Safety: caller-visible types in this module are plain-old-data.
    unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(core::mem::size_of::<MessageDescriptor>(), 24);
        assert_eq!(core::mem::size_of::<KernelInterrupt>(), 12);
        assert_eq!(core::mem::size_of::<KernelNamedPortNotification>(), 16);
        assert_eq!(core::mem::size_of::<KernelRequestPage>(), 24);
        assert_eq!(core::mem::size_of::<KernelGroupDestroyed>(), 16);
        assert_eq!(core::mem::size_of::<KernelGroupTaskChanged>(), 24);
    }

    #[test]
    fn interrupt_message_bytes() {
        let msg = KernelInterrupt {
            msg_type: KERNEL_MSG_INTERRUPT,
            intno: 48,
            lapic_id: 1,
        };
        let bytes = as_bytes(&msg);
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[0..4], &0x20u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &48u32.to_le_bytes());
    }
}

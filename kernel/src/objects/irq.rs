//! Programmable interrupt routing
//!
//! User-space drivers bind interrupt vectors to ports. When a bound
//! vector fires, the kernel posts a `KernelInterrupt` message to the port
//! and masks the source (by raising the local task-priority register)
//! until the driver completes the interrupt with
//! `configure-system(SYS_CONF_INT_COMPLETE, intno)`. Unbound vectors are
//! acknowledged and dropped immediately.

use crate::objects::port::Port;
use crate::KernResult;
use alloc::sync::Weak;
use spin::Mutex;
use thallium_abi::ipc::{as_bytes, KernelInterrupt, KERNEL_MSG_INTERRUPT};
use thallium_abi::SysError;

/// First vector available to user-space drivers.
pub const PROG_INT_FIRST: u8 = 48;

/// Last vector available to user-space drivers (inclusive).
pub const PROG_INT_LAST: u8 = 239;

const PROG_INT_COUNT: usize = (PROG_INT_LAST - PROG_INT_FIRST) as usize + 1;

struct Binding {
    port: Weak<Port>,
}

const UNBOUND: Mutex<Binding> = Mutex::new(Binding { port: Weak::new() });

/// Vector → port bindings, one slot per programmable vector.
static BINDINGS: [Mutex<Binding>; PROG_INT_COUNT] = [UNBOUND; PROG_INT_COUNT];

#[inline]
pub fn vector_is_programmable(intno: u64) -> bool {
    (PROG_INT_FIRST as u64..=PROG_INT_LAST as u64).contains(&intno)
}

/// Bind `intno` to `port`. The previous binding, if any, is replaced.
pub fn set_interrupt(port: &alloc::sync::Arc<Port>, intno: u64, _flags: u64) -> KernResult<()> {
    if !vector_is_programmable(intno) {
        return Err(SysError::OutOfRange);
    }
    let slot = &BINDINGS[(intno - PROG_INT_FIRST as u64) as usize];
    slot.lock().port = alloc::sync::Arc::downgrade(port);
    Ok(())
}

/// Deliver a programmable interrupt to its bound port.
///
/// Returns `true` if a live port consumed the event; the arch layer then
/// keeps the source masked until the driver completes it. `false` means
/// nobody is bound and the arch layer should EOI and move on.
pub fn dispatch(intno: u64, lapic_id: u32) -> bool {
    if !vector_is_programmable(intno) {
        return false;
    }
    let port = BINDINGS[(intno - PROG_INT_FIRST as u64) as usize]
        .lock()
        .port
        .upgrade();

    match port {
        Some(port) => {
            let msg = KernelInterrupt {
                msg_type: KERNEL_MSG_INTERRUPT,
                intno: intno as u32,
                lapic_id,
            };
            port.send_kernel_message(as_bytes(&msg)).is_ok()
        }
        None => false,
    }
}

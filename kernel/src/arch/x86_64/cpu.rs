//! Per-CPU structure
//!
//! Each CPU carries a `CpuLocal` reached through the GS base. While in
//! the kernel, GS points at it; on the way to ring 3 the exit path swaps
//! GS so the user sees its own base and the syscall entry can swap back.
//!
//! The layout is part of the assembly contract in `entry.rs`
//! (`gs:[8]` = kernel stack top, `gs:[16]` = scratch); do not reorder.

#![cfg_attr(test, allow(dead_code))]

/// Per-CPU kernel state, GS-addressable.
#[repr(C)]
pub struct CpuLocal {
    /// Self pointer at offset 0, so `gs:[0]` recovers the address.
    pub self_ptr: *const CpuLocal,
    /// Kernel stack top loaded by the syscall entry (offset 8).
    pub kernel_stack_top: u64,
    /// Scratch slot for the user stack pointer (offset 16).
    pub scratch_rsp: u64,
    /// CPU index (offset 24).
    pub cpu_index: u32,
    /// Local APIC id (offset 28).
    pub lapic_id: u32,
}

// One CpuLocal per CPU, only ever accessed by its own CPU.
unsafe impl Send for CpuLocal {}
unsafe impl Sync for CpuLocal {}

#[cfg(not(test))]
mod install {
    use super::*;
    use alloc::boxed::Box;
    use x86_64::registers::model_specific::{GsBase, KernelGsBase};
    use x86_64::VirtAddr;

    /// Install this CPU's `CpuLocal` and point GS at it.
    ///
    /// # Safety
    /// - Must run once per CPU during bring-up, before the first trap
    pub unsafe fn init_cpu(cpu_index: u32, lapic_id: u32, kernel_stack_top: u64) {
        let local = Box::leak(Box::new(CpuLocal {
            self_ptr: core::ptr::null(),
            kernel_stack_top,
            scratch_rsp: 0,
            cpu_index,
            lapic_id,
        }));
        local.self_ptr = local as *const CpuLocal;

        GsBase::write(VirtAddr::from_ptr(local));
        // The user GS base starts at zero; swapgs rotates it in on exit.
        KernelGsBase::write(VirtAddr::new(0));
    }

    /// The calling CPU's `CpuLocal`.
    pub fn current() -> &'static CpuLocal {
        let ptr: *const CpuLocal;
        // Safety: init_cpu pointed GS at a leaked CpuLocal whose first
        // field is its own address.
        unsafe {
            core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(nostack, readonly));
            &*ptr
        }
    }
}

#[cfg(not(test))]
pub use install::{current, init_cpu};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_entry_asm() {
        assert_eq!(core::mem::offset_of!(CpuLocal, self_ptr), 0);
        assert_eq!(core::mem::offset_of!(CpuLocal, kernel_stack_top), 8);
        assert_eq!(core::mem::offset_of!(CpuLocal, scratch_rsp), 16);
        assert_eq!(core::mem::offset_of!(CpuLocal, cpu_index), 24);
        assert_eq!(core::mem::offset_of!(CpuLocal, lapic_id), 28);
    }
}

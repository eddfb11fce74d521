//! GDT, TSS and segment selectors
//!
//! Fixed selector layout, required by the SYSCALL/SYSRET MSR encoding
//! (user data must sit 8 below user code):
//!
//! ```text
//! 0x08  kernel code        0x10  kernel data
//! 0x18  user data (RPL 3)  0x20  user code (RPL 3)
//! 0x28  TSS (per CPU)
//! ```
//!
//! Each CPU gets its own GDT and TSS; the TSS carries the per-CPU kernel
//! stack (rsp0) used on ring transitions plus one IST stack for double
//! faults.

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_SS: u16 = 0x10;
/// User data selector with RPL 3.
pub const USER_SS: u16 = 0x18 | 3;
/// User code selector with RPL 3.
pub const USER_CS: u16 = 0x20 | 3;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST: u16 = 1;

/// `(cs, ss)` selector pair for a privilege ring.
pub const fn selectors_for_ring(ring: u8) -> (u16, u16) {
    match ring {
        0 => (KERNEL_CS, KERNEL_SS),
        _ => (USER_CS, USER_SS),
    }
}

#[cfg(not(test))]
mod install {
    use super::*;
    use alloc::boxed::Box;
    use x86_64::instructions::tables::load_tss;
    use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
    use x86_64::structures::tss::TaskStateSegment;
    use x86_64::{PrivilegeLevel, VirtAddr};

    const KERNEL_STACK_SIZE: usize = 64 * 1024;
    const IST_STACK_SIZE: usize = 16 * 1024;

    /// Stack storage with the 16-byte alignment the entry paths assume.
    #[repr(C, align(16))]
    struct Stack<const N: usize>([u8; N]);

    /// Build and load this CPU's GDT and TSS. Returns the kernel stack
    /// top recorded in `rsp0`, which also serves the syscall entry path.
    pub fn init_cpu() -> u64 {
        let kernel_stack = Box::leak(Box::new(Stack([0u8; KERNEL_STACK_SIZE])));
        let ist_stack = Box::leak(Box::new(Stack([0u8; IST_STACK_SIZE])));
        let stack_top = VirtAddr::from_ptr(kernel_stack.0.as_ptr()) + KERNEL_STACK_SIZE as u64;

        let tss = Box::leak(Box::new(TaskStateSegment::new()));
        tss.privilege_stack_table[0] = stack_top;
        tss.interrupt_stack_table[(DOUBLE_FAULT_IST - 1) as usize] =
            VirtAddr::from_ptr(ist_stack.0.as_ptr()) + IST_STACK_SIZE as u64;

        let gdt = Box::leak(Box::new(GlobalDescriptorTable::new()));
        let kernel_cs = gdt.add_entry(Descriptor::kernel_code_segment());
        let kernel_ss = gdt.add_entry(Descriptor::kernel_data_segment());
        let user_ss = gdt.add_entry(Descriptor::user_data_segment());
        let user_cs = gdt.add_entry(Descriptor::user_code_segment());
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(tss));

        debug_assert_eq!(kernel_cs.0, KERNEL_CS);
        debug_assert_eq!(kernel_ss.0, KERNEL_SS);
        debug_assert_eq!(user_ss.0 | 3, USER_SS);
        debug_assert_eq!(user_cs.0 | 3, USER_CS);

        gdt.load();
        // Safety: the selectors come from the table just loaded.
        unsafe {
            CS::set_reg(kernel_cs);
            SS::set_reg(kernel_ss);
            DS::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
            ES::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
            load_tss(tss_sel);
        }

        stack_top.as_u64()
    }
}

#[cfg(not(test))]
pub use install::init_cpu;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_layout_supports_sysret() {
        // SYSRET loads CS = base + 16 and SS = base + 8; the layout must
        // keep user data 8 below user code.
        assert_eq!(USER_CS & !3, (USER_SS & !3) + 8);
        assert_eq!(selectors_for_ring(0), (KERNEL_CS, KERNEL_SS));
        assert_eq!(selectors_for_ring(3), (USER_CS, USER_SS));
        // Ring-3 selectors carry RPL 3.
        assert_eq!(USER_CS & 3, 3);
        assert_eq!(USER_SS & 3, 3);
    }
}

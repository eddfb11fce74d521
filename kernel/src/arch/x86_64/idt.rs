//! Interrupt descriptor table
//!
//! One shared IDT routes all 256 vectors into the stub table from
//! `entry.rs`. Layout:
//!
//! - 0..31: CPU exceptions
//! - 48..239: programmable vectors, bindable to ports by drivers
//! - 0xf8: syscall gate (callable from ring 3)
//! - 0xfa/0xfb/0xfc: TLB-shootdown IPI, reschedule IPI, LAPIC timer
//! - 0xff: spurious

/// LAPIC one-shot preemption timer.
pub const TIMER_VECTOR: u64 = 0xfc;
/// Cross-CPU reschedule request.
pub const RESCHEDULE_VECTOR: u64 = 0xfb;
/// Cross-CPU TLB invalidation request.
pub const TLB_SHOOTDOWN_VECTOR: u64 = 0xfa;
/// LAPIC spurious vector (low nibble must be 0xf).
pub const SPURIOUS_VECTOR: u64 = 0xff;

#[cfg(not(test))]
mod install {
    use super::*;
    use crate::arch::x86_64::entry::vector_stubs;
    use crate::arch::x86_64::gdt::DOUBLE_FAULT_IST;
    use spin::Once;
    use x86_64::structures::idt::InterruptDescriptorTable;
    use x86_64::{PrivilegeLevel, VirtAddr};

    static IDT: Once<InterruptDescriptorTable> = Once::new();

    fn stub_addr(vector: usize) -> VirtAddr {
        // Stubs are emitted 16 bytes apart, vector i at base + 16 * i.
        let base = unsafe { &vector_stubs as *const u8 as u64 };
        VirtAddr::new(base + 16 * vector as u64)
    }

    /// Build the shared IDT and load it on the calling CPU.
    pub fn init() {
        let idt = IDT.call_once(|| {
            let mut idt = InterruptDescriptorTable::new();

            // Safety throughout: every entry points at a stub that saves
            // the register file and dispatches; the stubs expect exactly
            // the hardware frame for their vector.
            unsafe {
                idt.divide_error.set_handler_addr(stub_addr(0));
                idt.debug.set_handler_addr(stub_addr(1));
                idt.non_maskable_interrupt.set_handler_addr(stub_addr(2));
                idt.breakpoint.set_handler_addr(stub_addr(3));
                idt.overflow.set_handler_addr(stub_addr(4));
                idt.bound_range_exceeded.set_handler_addr(stub_addr(5));
                idt.invalid_opcode.set_handler_addr(stub_addr(6));
                idt.device_not_available.set_handler_addr(stub_addr(7));
                idt.double_fault
                    .set_handler_addr(stub_addr(8))
                    .set_stack_index(DOUBLE_FAULT_IST - 1);
                idt.invalid_tss.set_handler_addr(stub_addr(10));
                idt.segment_not_present.set_handler_addr(stub_addr(11));
                idt.stack_segment_fault.set_handler_addr(stub_addr(12));
                idt.general_protection_fault.set_handler_addr(stub_addr(13));
                idt.page_fault.set_handler_addr(stub_addr(14));
                idt.x87_floating_point.set_handler_addr(stub_addr(16));
                idt.alignment_check.set_handler_addr(stub_addr(17));
                idt.machine_check.set_handler_addr(stub_addr(18));
                idt.simd_floating_point.set_handler_addr(stub_addr(19));
                idt.virtualization.set_handler_addr(stub_addr(20));
                idt.security_exception.set_handler_addr(stub_addr(30));

                // Everything from 32 up, including the IPI, timer and
                // spurious vectors.
                for vector in 32..=255usize {
                    if vector == thallium_abi::syscall::SYSCALL_INT_VECTOR as usize {
                        idt[vector]
                            .set_handler_addr(stub_addr(vector))
                            .set_privilege_level(PrivilegeLevel::Ring3);
                    } else {
                        idt[vector].set_handler_addr(stub_addr(vector));
                    }
                }
            }
            idt
        });
        idt.load();
    }

    /// Load the already-built IDT on an application processor.
    pub fn load_ap() {
        if let Some(idt) = IDT.get() {
            idt.load();
        }
    }
}

#[cfg(not(test))]
pub use install::{init, load_ap};

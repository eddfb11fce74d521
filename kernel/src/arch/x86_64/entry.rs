//! Kernel entry and exit paths
//!
//! All 256 interrupt vectors funnel through one stub table into
//! `trap_common`, which saves the full register file as a `TrapFrame` on
//! the per-CPU kernel stack and calls [`trap_dispatch`]. The SYSCALL
//! instruction has its own entry that fabricates an equivalent frame, so
//! the rest of the kernel sees a single frame shape regardless of how it
//! was entered.
//!
//! The exit path is chosen by the frame being resumed, not by the path
//! that entered: frames marked `SYSCALL_FAST_MARKER` leave through
//! SYSRET, everything else through IRETQ. A task whose blocked syscall
//! must repeat had its saved program counter rewound at block time, so
//! resuming it re-executes the syscall instruction.

use crate::arch::x86_64::context::TrapFrame;
use crate::arch::x86_64::{apic, idt, tlb};
use crate::memory::page_table::FaultOutcome;
use crate::objects::task::WaitRef;
use thallium_abi::flags::RegionFlags;
use thallium_abi::syscall::SYSCALL_INT_VECTOR;

/// `TrapFrame::vector` value marking a frame built by the SYSCALL fast
/// path; such frames resume through SYSRET.
pub const SYSCALL_FAST_MARKER: u64 = 256;

#[cfg(not(test))]
core::arch::global_asm!(
    r#"
// Vectors 8, 10-14, 17, 21, 29, 30 push a hardware error code; the rest
// get a zero so every frame has the same shape.
.set ERRCODE_MASK, 0x60227D00

.altmacro
.macro vector_stub num
    .balign 16
    .if num < 32
        .if (ERRCODE_MASK >> num) & 1
        .else
            push 0
        .endif
    .else
        push 0
    .endif
    push num
    jmp trap_common
.endm

.section .text
.balign 16
.global vector_stubs
vector_stubs:
.set vec, 0
.rept 256
    vector_stub %vec
    .set vec, vec + 1
.endr

// Common trap path: save the register file, hand the frame to Rust,
// restore whatever frame the scheduler left behind.
trap_common:
    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    // Entered from ring 3: switch to the kernel GS base.
    test byte ptr [rsp + 18*8], 3
    jz 1f
    swapgs
1:
    mov rdi, rsp
    call {trap_dispatch}

.global trap_exit
trap_exit:
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rbp
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rbx
    pop rax

    // Choose the exit matching the resumed frame.
    cmp qword ptr [rsp], {fast_marker}
    je 2f

    add rsp, 16               // vector + error code
    test byte ptr [rsp + 8], 3
    jz 1f
    swapgs
1:
    iretq

2:  // SYSRET exit: rcx <- rip, r11 <- rflags, rsp <- user stack.
    add rsp, 16
    pop rcx                   // saved rip
    add rsp, 8                // skip cs
    pop r11                   // saved rflags
    swapgs
    pop rsp                   // saved user rsp
    sysretq

// SYSCALL instruction entry. Interrupts are masked by SFMASK. The user
// stack pointer parks in the per-CPU scratch slot while the frame is
// assembled on the kernel stack.
.global syscall_fast_entry
syscall_fast_entry:
    swapgs
    mov gs:[16], rsp          // scratch <- user rsp
    mov rsp, gs:[8]           // kernel stack top

    push {user_ss}
    push qword ptr gs:[16]    // user rsp
    push r11                  // rflags
    push {user_cs}
    push rcx                  // rip
    push 0                    // error code
    push {fast_marker}        // vector marker

    push rax
    push rbx
    push rcx
    push rdx
    push rsi
    push rdi
    push rbp
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15

    mov rdi, rsp
    call {trap_dispatch}
    jmp trap_exit
"#,
    trap_dispatch = sym trap_dispatch,
    fast_marker = const SYSCALL_FAST_MARKER,
    user_cs = const crate::arch::x86_64::gdt::USER_CS as u64,
    user_ss = const crate::arch::x86_64::gdt::USER_SS as u64,
);

#[cfg(not(test))]
extern "C" {
    /// Base of the 16-byte-spaced stub table; stub `i` serves vector `i`.
    pub static vector_stubs: u8;
    /// SYSCALL (LSTAR) entry point.
    pub fn syscall_fast_entry();
}

/// Program the SYSCALL/SYSRET MSRs for the fast syscall path.
///
/// # Safety
/// - GDT must be loaded with the fixed selector layout
/// - Must run once per CPU during bring-up
#[cfg(not(test))]
pub unsafe fn program_syscall_msrs() {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::structures::gdt::SegmentSelector;
    use x86_64::VirtAddr;

    let _ = Star::write(
        SegmentSelector(crate::arch::x86_64::gdt::USER_CS),
        SegmentSelector(crate::arch::x86_64::gdt::USER_SS),
        SegmentSelector(crate::arch::x86_64::gdt::KERNEL_CS),
        SegmentSelector(crate::arch::x86_64::gdt::KERNEL_SS),
    );
    LStar::write(VirtAddr::new(syscall_fast_entry as usize as u64));
    // Mask everything, most importantly IF and DF.
    SFMask::write(RFlags::from_bits_truncate(!0));
    Efer::update(|flags| *flags |= EferFlags::SYSTEM_CALL_EXTENSIONS);
}

/// Central trap dispatcher; every kernel entry lands here with the saved
/// frame.
#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match frame.vector {
        v if v == SYSCALL_INT_VECTOR as u64 || v == SYSCALL_FAST_MARKER => {
            crate::syscall::dispatch(frame);
        }
        idt::TIMER_VECTOR => {
            apic::eoi();
            crate::scheduler::timer_tick(frame);
        }
        idt::RESCHEDULE_VECTOR => {
            apic::eoi();
            crate::scheduler::reschedule(frame);
        }
        idt::TLB_SHOOTDOWN_VECTOR => {
            tlb::handle_ipi();
            apic::eoi();
        }
        idt::SPURIOUS_VECTOR => {
            // Spurious interrupts get no EOI.
        }
        v if crate::objects::irq::vector_is_programmable(v) => {
            if crate::objects::irq::dispatch(v, apic::lapic_id()) {
                // A driver owns this vector: mask at-or-below it until
                // the driver completes the interrupt.
                apic::mask_up_to(v as u8);
            }
            apic::eoi();
        }
        14 => page_fault(frame),
        v if v < 32 => exception(frame, v),
        v => {
            crate::kwarn!("spurious vector {} (rip={:#x})", v, frame.rip);
            apic::eoi();
        }
    }

    crate::scheduler::maybe_reschedule(frame);
}

/// Page-fault slow path.
fn page_fault(frame: &mut TrapFrame) {
    let fault_addr = read_cr2();
    let write = frame.error_code & 0x2 != 0;
    let fetch = frame.error_code & 0x10 != 0;
    let access = if fetch {
        RegionFlags::EXEC
    } else if write {
        RegionFlags::WRITE
    } else {
        RegionFlags::READ
    };

    let Some(task) = crate::scheduler::current_task() else {
        panic!(
            "page fault before scheduling started: addr={:#x} {:?}",
            fault_addr, frame
        );
    };

    let space = match task.space() {
        Ok(space) => space,
        Err(_) => return fatal_fault(frame, fault_addr),
    };

    match space.handle_page_fault(&task, fault_addr as usize, access) {
        Ok(FaultOutcome::Handled) => {}
        Ok(FaultOutcome::Blocked) => {
            crate::scheduler::block_current(frame, WaitRef::None);
        }
        Err(e) => {
            crate::kwarn!(
                "task {} unhandled page fault at {:#x} ({:?})",
                task.id,
                fault_addr,
                e
            );
            fatal_fault(frame, fault_addr);
        }
    }
}

/// Non-page-fault exceptions: kill the offender, panic if it was us.
fn exception(frame: &mut TrapFrame, vector: u64) {
    if !frame.from_user() {
        panic!(
            "kernel exception {} (error {:#x}) {:?}",
            vector, frame.error_code, frame
        );
    }
    let Some(task) = crate::scheduler::current_task() else {
        panic!("exception {} with no current task {:?}", vector, frame);
    };
    crate::kwarn!(
        "killing task {}: exception {} at {:#x}",
        task.id,
        vector,
        frame.rip
    );
    task.kill();
    crate::scheduler::reschedule(frame);
}

/// A user fault the VMM rejected: the task dies.
fn fatal_fault(frame: &mut TrapFrame, fault_addr: u64) {
    if !frame.from_user() {
        panic!(
            "kernel page fault at {:#x} (rip={:#x})",
            fault_addr, frame.rip
        );
    }
    if let Some(task) = crate::scheduler::current_task() {
        task.kill();
    }
    crate::scheduler::reschedule(frame);
}

#[cfg(not(test))]
fn read_cr2() -> u64 {
    x86_64::registers::control::Cr2::read().as_u64()
}

#[cfg(test)]
fn read_cr2() -> u64 {
    0
}

//! x86_64 architecture support
//!
//! The thin shim the architecture-agnostic kernel stands on: trap entry
//! and exit, descriptor tables, the local APIC, per-CPU state, TLB
//! shootdown and segment-base bookkeeping.

pub mod apic;
pub mod context;
pub mod cpu;
pub mod entry;
pub mod gdt;
pub mod idt;
pub mod tlb;

use crate::objects::task::Task;
use alloc::sync::Arc;

/// Bring up the boot CPU's architecture state: GDT/TSS, IDT, per-CPU
/// block, syscall MSRs, LAPIC and its calibrated timer.
///
/// # Safety
/// - Must run exactly once on the boot CPU, before scheduling starts
#[cfg(not(test))]
pub unsafe fn init_bsp() {
    let stack_top = gdt::init_cpu();
    idt::init();
    apic::init_cpu();
    let lapic = apic::lapic_id();
    cpu::init_cpu(0, lapic, stack_top);
    entry::program_syscall_msrs();
    apic::calibrate_timer();
    crate::kinfo!("arch: BSP online (lapic {})", lapic);
}

/// Bring up an application processor.
///
/// # Safety
/// - Must run exactly once on each AP, after `init_bsp`
#[cfg(not(test))]
pub unsafe fn init_ap(cpu_index: u32) {
    let stack_top = gdt::init_cpu();
    idt::load_ap();
    apic::init_cpu();
    let lapic = apic::lapic_id();
    cpu::init_cpu(cpu_index, lapic, stack_top);
    entry::program_syscall_msrs();
    crate::kinfo!("arch: AP {} online (lapic {})", cpu_index, lapic);
}

/// Save the live FS/GS bases into the outgoing task.
#[cfg(not(test))]
pub fn segments_save(task: &Arc<Task>) {
    use x86_64::registers::model_specific::{FsBase, KernelGsBase};
    let mut segs = task.segs.lock();
    segs.fs = FsBase::read().as_u64();
    // While in the kernel the user GS base parks in KernelGsBase.
    segs.gs = KernelGsBase::read().as_u64();
}

#[cfg(test)]
pub fn segments_save(_task: &Arc<Task>) {}

/// Load the incoming task's FS/GS bases.
#[cfg(not(test))]
pub fn segments_restore(task: &Arc<Task>) {
    use x86_64::registers::model_specific::{FsBase, KernelGsBase};
    let segs = task.segs.lock();
    FsBase::write(x86_64::VirtAddr::new(segs.fs));
    KernelGsBase::write(x86_64::VirtAddr::new(segs.gs));
}

#[cfg(test)]
pub fn segments_restore(_task: &Arc<Task>) {}

/// Halt until the next interrupt; the idle task's whole job.
#[cfg(not(test))]
pub fn halt() {
    x86_64::instructions::hlt();
}

#[cfg(test)]
pub fn halt() {}

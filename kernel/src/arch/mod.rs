//! Architecture-specific code
//!
//! All architecture-dependent implementations live here; the rest of the
//! kernel calls through the small surface below. Currently only x86_64 is
//! supported.
//!
//! Host test builds stub the hardware touchpoints out so the
//! architecture-agnostic kernel logic runs under `cargo test`.

pub mod x86_64;

use crate::objects::task::Task;
use alloc::sync::Arc;

/// Index of the executing CPU.
#[cfg(not(test))]
#[inline]
pub fn cpu_index() -> u32 {
    x86_64::cpu::current().cpu_index
}

#[cfg(test)]
pub fn cpu_index() -> u32 {
    0
}

/// Ask another CPU to reschedule.
#[cfg(not(test))]
pub fn send_reschedule_ipi(lapic_id: u32) {
    x86_64::apic::send_ipi(lapic_id, x86_64::idt::RESCHEDULE_VECTOR);
}

#[cfg(test)]
pub fn send_reschedule_ipi(_lapic_id: u32) {}

/// Invalidate a virtual range on every CPU that may cache translations
/// for the given address space.
#[cfg(not(test))]
pub fn tlb_shootdown(space_id: u64, start: usize, len: usize) {
    x86_64::tlb::shootdown(space_id, start, len);
}

#[cfg(test)]
pub fn tlb_shootdown(_space_id: u64, _start: usize, _len: usize) {}

/// Save the FPU state of the task leaving the CPU.
#[cfg(not(test))]
pub fn fpu_save(task: &Arc<Task>) {
    // Safety: runs on the CPU the task executed on, from its trap path.
    unsafe { task.fpu.lock().save() };
}

#[cfg(test)]
pub fn fpu_save(_task: &Arc<Task>) {}

/// Restore the FPU state of the task taking the CPU.
#[cfg(not(test))]
pub fn fpu_restore(task: &Arc<Task>) {
    // Safety: state was captured by `fpu_save` or is the initial state.
    unsafe { task.fpu.lock().restore() };
}

#[cfg(test)]
pub fn fpu_restore(_task: &Arc<Task>) {}

/// Load the address space of the incoming task if it differs from the
/// active one. Tasks without a space (idle) keep whatever is loaded.
#[cfg(not(test))]
pub fn switch_address_space(task: &Arc<Task>) {
    use ::x86_64::registers::control::Cr3;
    use ::x86_64::structures::paging::PhysFrame;

    let Some(space) = task.space.lock().clone() else {
        return;
    };
    let root = space.root_phys();
    let (active, flags) = Cr3::read();
    if active.start_address().as_u64() != root.as_u64() {
        let frame = PhysFrame::containing_address(::x86_64::PhysAddr::new(root.as_u64()));
        // Safety: the root is a live PML4 whose kernel half mirrors the
        // boot tables.
        unsafe { Cr3::write(frame, flags) };
    }
}

#[cfg(test)]
pub fn switch_address_space(_task: &Arc<Task>) {}

/// Arm the one-shot preemption timer for the new task's quantum.
#[cfg(not(test))]
pub fn arm_preemption_timer(quantum_ms: u32) {
    x86_64::apic::arm_timer_ms(quantum_ms);
}

#[cfg(test)]
pub fn arm_preemption_timer(_quantum_ms: u32) {}

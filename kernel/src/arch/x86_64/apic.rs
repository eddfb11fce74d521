//! Local APIC
//!
//! The LAPIC supplies the preemption timer, inter-processor interrupts
//! (reschedule and TLB shootdown), the spurious vector and the EOI/TPR
//! registers that implement the interrupt-masking discipline: a vector
//! delivered to a driver port stays masked (TPR raised to it) until the
//! driver completes it.
//!
//! The xAPIC register page is reached through the kernel's linear
//! physical mapping. The timer is calibrated once against the PIT.

#![cfg_attr(test, allow(dead_code))]

use crate::arch::x86_64::idt::{SPURIOUS_VECTOR, TIMER_VECTOR};
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

/// xAPIC MMIO physical base.
const LAPIC_PHYS_BASE: usize = 0xfee0_0000;

// Register offsets.
const REG_ID: usize = 0x20;
const REG_TPR: usize = 0x80;
const REG_EOI: usize = 0xb0;
const REG_SVR: usize = 0xf0;
const REG_ICR_LOW: usize = 0x300;
const REG_ICR_HIGH: usize = 0x310;
const REG_LVT_TIMER: usize = 0x320;
const REG_TIMER_INITIAL: usize = 0x380;
const REG_TIMER_CURRENT: usize = 0x390;
const REG_TIMER_DIVIDE: usize = 0x3e0;

/// Timer ticks per millisecond, measured at boot.
static TICKS_PER_MS: AtomicU32 = AtomicU32::new(0);

#[cfg(not(test))]
#[inline]
fn reg(offset: usize) -> *mut u32 {
    use crate::memory::address::PhysAddr;
    PhysAddr::new(LAPIC_PHYS_BASE + offset).to_virt().as_usize() as *mut u32
}

#[cfg(not(test))]
#[inline]
fn read(offset: usize) -> u32 {
    // Safety: the LAPIC page is mapped through the linear mapping and
    // the offsets are architectural.
    unsafe { core::ptr::read_volatile(reg(offset)) }
}

#[cfg(not(test))]
#[inline]
fn write(offset: usize, value: u32) {
    // Safety: as `read`.
    unsafe { core::ptr::write_volatile(reg(offset), value) }
}

#[cfg(test)]
fn read(_offset: usize) -> u32 {
    0
}

#[cfg(test)]
fn write(_offset: usize, _value: u32) {}

/// Enable the local APIC on the calling CPU: software-enable with the
/// spurious vector, unmask nothing else, TPR wide open.
pub fn init_cpu() {
    write(REG_SVR, 0x100 | SPURIOUS_VECTOR as u32);
    write(REG_TPR, 0);
    // Divide by 16.
    write(REG_TIMER_DIVIDE, 0b0011);
}

/// APIC id of the calling CPU.
pub fn lapic_id() -> u32 {
    read(REG_ID) >> 24
}

/// Signal end-of-interrupt for the in-service vector.
pub fn eoi() {
    write(REG_EOI, 0);
}

/// Send `vector` to the CPU with `lapic_id`.
pub fn send_ipi(lapic_id: u32, vector: u64) {
    write(REG_ICR_HIGH, lapic_id << 24);
    // Fixed delivery, physical destination, assert.
    write(REG_ICR_LOW, 0x4000 | vector as u32);
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// Send `vector` to every CPU but the caller.
pub fn broadcast_ipi(vector: u64) {
    // All-excluding-self shorthand.
    write(REG_ICR_LOW, 0xc_4000 | vector as u32);
    while read(REG_ICR_LOW) & (1 << 12) != 0 {
        core::hint::spin_loop();
    }
}

/// Vectors a driver has taken but not yet completed on this CPU, kept so
/// TPR tracks the highest outstanding one.
static MASKED: Mutex<[u8; 8]> = Mutex::new([0; 8]);

/// Mask delivery of `vector` and everything below it until completed.
pub fn mask_up_to(vector: u8) {
    let mut masked = MASKED.lock();
    for slot in masked.iter_mut() {
        if *slot == 0 {
            *slot = vector;
            break;
        }
    }
    let top = masked.iter().copied().max().unwrap_or(0);
    write(REG_TPR, top as u32);
}

/// A driver completed `vector`: lower TPR to the next outstanding one.
pub fn complete_interrupt(vector: u8) {
    let mut masked = MASKED.lock();
    for slot in masked.iter_mut() {
        if *slot == vector {
            *slot = 0;
            break;
        }
    }
    let top = masked.iter().copied().max().unwrap_or(0);
    write(REG_TPR, top as u32);
}

/// Calibrate the LAPIC timer against the PIT (channel 2 one-shot).
///
/// # Safety
/// - Must run once on the boot CPU before the scheduler arms quanta
#[cfg(not(test))]
pub unsafe fn calibrate_timer() {
    use x86_64::instructions::port::Port;

    const PIT_HZ: u64 = 1_193_182;
    // 10 ms gate.
    let gate_ticks = (PIT_HZ / 100) as u16;

    let mut port_61 = Port::<u8>::new(0x61);
    let mut port_43 = Port::<u8>::new(0x43);
    let mut port_42 = Port::<u8>::new(0x42);

    // Gate high, speaker off; channel 2, lobyte/hibyte, mode 0.
    let gate = port_61.read();
    port_61.write((gate & !0x02) | 0x01);
    port_43.write(0xb0);
    port_42.write((gate_ticks & 0xff) as u8);
    port_42.write((gate_ticks >> 8) as u8);

    // Free-run the APIC timer while the PIT counts down.
    write(REG_TIMER_INITIAL, u32::MAX);
    while port_61.read() & 0x20 == 0 {
        core::hint::spin_loop();
    }
    let elapsed = u32::MAX - read(REG_TIMER_CURRENT);
    write(REG_TIMER_INITIAL, 0);

    TICKS_PER_MS.store(elapsed / 10, Ordering::Release);
    crate::kinfo!("lapic: {} timer ticks/ms", elapsed / 10);
}

/// Arm the one-shot preemption timer.
pub fn arm_timer_ms(ms: u32) {
    let ticks_per_ms = TICKS_PER_MS.load(Ordering::Acquire);
    if ticks_per_ms == 0 {
        return;
    }
    write(REG_LVT_TIMER, TIMER_VECTOR as u32);
    write(REG_TIMER_INITIAL, ticks_per_ms.saturating_mul(ms));
}

/// Busy-wait roughly `n * 100` microseconds on the PIT, for early-boot
/// and the `configure-system` sleep subop.
#[cfg(not(test))]
pub fn pit_sleep_100us(n: u64) {
    use x86_64::instructions::port::Port;
    const PIT_HZ: u64 = 1_193_182;

    let mut port_61 = Port::<u8>::new(0x61);
    let mut port_43 = Port::<u8>::new(0x43);
    let mut port_42 = Port::<u8>::new(0x42);

    for _ in 0..n {
        let ticks = (PIT_HZ / 10_000) as u16;
        unsafe {
            let gate = port_61.read();
            port_61.write((gate & !0x02) | 0x01);
            port_43.write(0xb0);
            port_42.write((ticks & 0xff) as u8);
            port_42.write((ticks >> 8) as u8);
            while port_61.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
pub fn pit_sleep_100us(_n: u64) {}

/// LAPIC-related `configure-system` subops.
pub fn lapic_configure(_op: u64, _value: u64) -> u64 {
    lapic_id() as u64
}

//! Cross-CPU TLB invalidation
//!
//! After a PTE changes, CPUs that may cache translations for the same
//! address space must drop them. The initiating CPU writes the range to
//! the shared mailbox, broadcasts the shootdown IPI and waits for every
//! other CPU to acknowledge; receivers invalidate the range locally and
//! bump the acknowledgement counter.

#![cfg_attr(test, allow(dead_code))]

#[cfg(not(test))]
use crate::memory::address::PAGE_SIZE;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

/// Serializes initiators; the mailbox holds one request at a time.
static MAILBOX_LOCK: Mutex<()> = Mutex::new(());

static REQ_START: AtomicU64 = AtomicU64::new(0);
static REQ_END: AtomicU64 = AtomicU64::new(0);
static ACKS_PENDING: AtomicUsize = AtomicUsize::new(0);

/// Number of CPUs participating in shootdowns.
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

/// Record the online CPU count once bring-up is done.
pub fn set_cpu_count(n: usize) {
    CPU_COUNT.store(n.max(1), Ordering::Release);
}

#[cfg(not(test))]
fn invalidate_local(start: usize, end: usize) {
    use x86_64::instructions::tlb;
    // Whole-range flushes beyond a handful of pages are cheaper as a
    // full flush.
    if (end - start) / PAGE_SIZE > 32 {
        tlb::flush_all();
        return;
    }
    let mut page = start;
    while page < end {
        tlb::flush(x86_64::VirtAddr::new(page as u64));
        page += PAGE_SIZE;
    }
}

#[cfg(test)]
fn invalidate_local(_start: usize, _end: usize) {}

/// Invalidate `[start, start + len)` on every CPU.
///
/// The space id is accepted for symmetry with the VMM call site; the
/// shootdown is conservative and flushes the range on all CPUs rather
/// than tracking which of them have the space loaded.
pub fn shootdown(_space_id: u64, start: usize, len: usize) {
    invalidate_local(start, start + len);

    let others = CPU_COUNT.load(Ordering::Acquire).saturating_sub(1);
    if others == 0 {
        return;
    }

    let _guard = MAILBOX_LOCK.lock();
    REQ_START.store(start as u64, Ordering::Release);
    REQ_END.store((start + len) as u64, Ordering::Release);
    ACKS_PENDING.store(others, Ordering::Release);

    #[cfg(not(test))]
    crate::arch::x86_64::apic::broadcast_ipi(crate::arch::x86_64::idt::TLB_SHOOTDOWN_VECTOR);

    while ACKS_PENDING.load(Ordering::Acquire) != 0 {
        core::hint::spin_loop();
    }
}

/// Shootdown IPI handler on a receiving CPU.
pub fn handle_ipi() {
    let start = REQ_START.load(Ordering::Acquire) as usize;
    let end = REQ_END.load(Ordering::Acquire) as usize;
    invalidate_local(start, end);
    ACKS_PENDING.fetch_sub(1, Ordering::AcqRel);
}

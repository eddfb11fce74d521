//! Kernel heap allocator
//!
//! The kernel heap backs `alloc` collections (task descriptors, message
//! queues, region maps). It is a linked-list allocator over a fixed
//! virtual range, grown page by page from the frame allocator at boot.
//!
//! Host test builds use the system allocator instead; the global allocator
//! is only installed for target builds.

use crate::memory::address::{VirtAddr, PAGE_SIZE};
use linked_list_allocator::LockedHeap;

/// Virtual base of the kernel heap mapping.
pub const HEAP_BASE: usize = 0xffff_9000_0000_0000;

/// Initial heap size mapped at boot (4 MiB).
pub const HEAP_INITIAL_SIZE: usize = 4 * 1024 * 1024;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(test)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap.
///
/// The caller must already have mapped `[HEAP_BASE, HEAP_BASE + size)` to
/// freshly allocated frames.
///
/// # Safety
/// - Must be called exactly once during boot
/// - The given range must be mapped, writable and unused
pub unsafe fn init(base: VirtAddr, size: usize) {
    debug_assert!(size % PAGE_SIZE == 0);
    ALLOCATOR.lock().init(base.as_usize() as *mut u8, size);
}

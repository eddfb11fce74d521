//! Memory management subsystem
//!
//! - `address`: type-safe physical and virtual addresses
//! - `frame_allocator`: bitmap physical frame allocator
//! - `heap`: kernel heap
//! - `paging`: hardware page-table walker
//! - `region`: region descriptors and the per-space region map
//! - `page_table`: address-space objects (regions + hardware tables + fault
//!   handling)
//! - `mem_object`: shareable frame arrays backing object regions
//! - `user`: checked user-memory access for syscalls

pub mod address;
pub mod frame_allocator;
pub mod heap;
pub mod mem_object;
pub mod page_table;
pub mod paging;
pub mod region;
pub mod user;

pub use address::{PageFrameNumber, PhysAddr, VirtAddr};
pub use address::{PAGE_SIZE, PAGE_SIZE_LOG, PHYS_MAP_BASE, USER_MAX, USER_MIN};

use frame_allocator::FrameAllocator;
use spin::Mutex;

/// Global frame allocator (populated during boot from the firmware map).
static FRAME_ALLOCATOR: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Initialize the memory subsystem from the boot memory map.
///
/// # Safety
/// - Must be called exactly once during boot, before any allocation
/// - The regions must describe RAM accurately
pub unsafe fn init(
    usable: &[(PhysAddr, usize)],
    kernel_start: PhysAddr,
    kernel_end: PhysAddr,
) {
    let mut allocator = FRAME_ALLOCATOR.lock();
    for (start, size) in usable {
        allocator.add_region(*start, *size);
    }

    // The kernel image, plus everything below 1 MiB (BIOS structures,
    // the AP trampoline) stays reserved.
    allocator.reserve_region(PhysAddr::new(0), 1024 * 1024);
    allocator.reserve_region(
        kernel_start,
        kernel_end.as_usize() - kernel_start.as_usize(),
    );

    crate::kinfo!(
        "memory: {}/{} frames free",
        allocator.free_frames(),
        allocator.total_frames()
    );
}

/// Allocate a physical frame. Returns `None` when memory is exhausted.
pub fn alloc_frame() -> Option<PageFrameNumber> {
    FRAME_ALLOCATOR.lock().alloc()
}

/// Free a physical frame.
///
/// # Safety
/// - The frame must have been allocated by `alloc_frame`
/// - No mapping or object slot may still reference it
pub unsafe fn dealloc_frame(pfn: PageFrameNumber) {
    FRAME_ALLOCATOR.lock().dealloc(pfn);
}

/// Number of free frames.
pub fn free_frames() -> usize {
    FRAME_ALLOCATOR.lock().free_frames()
}

/// Zero a frame through the linear physical mapping.
#[cfg(not(test))]
pub fn zero_frame(pfn: PageFrameNumber) {
    let virt = pfn.phys_addr().to_virt().as_usize() as *mut u8;
    // Safety: the linear mapping covers all RAM and the frame is not yet
    // visible to any other CPU.
    unsafe { core::ptr::write_bytes(virt, 0, PAGE_SIZE) };
}

/// Host tests have no linear physical mapping; frame contents are not
/// modeled.
#[cfg(test)]
pub fn zero_frame(_pfn: PageFrameNumber) {}

/// Copy a whole frame (used for copy-on-write faults).
#[cfg(not(test))]
pub fn copy_frame(dst: PageFrameNumber, src: PageFrameNumber) {
    let dst = dst.phys_addr().to_virt().as_usize() as *mut u8;
    let src = src.phys_addr().to_virt().as_usize() as *const u8;
    // Safety: both frames are RAM reached through the linear mapping; dst
    // is freshly allocated and private.
    unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE) };
}

#[cfg(test)]
pub fn copy_frame(_dst: PageFrameNumber, _src: PageFrameNumber) {}

#[cfg(test)]
pub mod test_support {
    //! Shared setup for host-side unit tests.

    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    static FRAMES_READY: AtomicBool = AtomicBool::new(false);

    static FRAME_LOCK: Mutex<()> = Mutex::new(());

    /// The frame pool is process-global; tests that allocate frames (and
    /// especially tests that assert free-frame counts) take turns.
    pub fn frame_lock() -> spin::MutexGuard<'static, ()> {
        FRAME_LOCK.lock()
    }

    /// Hand the global frame allocator a synthetic 64 MiB of RAM at 16 MiB.
    /// Idempotent so every test can call it.
    pub fn init_test_frames() {
        if FRAMES_READY.swap(true, Ordering::SeqCst) {
            return;
        }
        FRAME_ALLOCATOR
            .lock()
            .add_region(PhysAddr::new(16 * 1024 * 1024), 64 * 1024 * 1024);
    }
}

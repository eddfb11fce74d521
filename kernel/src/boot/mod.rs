//! Boot sequence
//!
//! The loader drops the kernel at its link address with a linear mapping
//! of all physical memory already installed, then jumps to `_start` with
//! a `BootInfo` describing usable RAM. Bring-up order matters: console
//! first (so everything can log), then physical memory, the heap, the
//! architecture state and finally the scheduler. The boot CPU then opens
//! interrupts and parks in the idle loop; all further life arrives over
//! the syscall surface from the user-space bootstrap task the loader
//! started.

#[cfg(not(test))]
use crate::memory::address::PhysAddr;

/// One entry of the loader-provided memory map.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    /// 1 = usable RAM; everything else is reserved.
    pub kind: u32,
    pub reserved: u32,
}

/// Usable-RAM entry kind.
pub const MEMORY_KIND_USABLE: u32 = 1;

/// Handoff structure from the loader.
#[repr(C)]
pub struct BootInfo {
    pub memory_map: *const MemoryMapEntry,
    pub memory_map_len: usize,
    pub kernel_start: u64,
    pub kernel_end: u64,
}

#[cfg(not(test))]
mod run {
    use super::*;
    use crate::memory::address::{VirtAddr, PAGE_SIZE};
    use crate::memory::heap::{HEAP_BASE, HEAP_INITIAL_SIZE};
    use crate::memory::paging::PageMapper;
    use x86_64::registers::control::Cr3;

    /// Kernel entry, called once on the boot CPU.
    pub fn kernel_main(boot_info: &BootInfo) -> ! {
        crate::config::init_console();
        crate::kprintln!();
        crate::kinfo!("Thallium microkernel starting");

        // Safety: the loader's map describes real RAM.
        let entries = unsafe {
            core::slice::from_raw_parts(boot_info.memory_map, boot_info.memory_map_len)
        };
        let mut usable = [(PhysAddr::new(0), 0usize); 32];
        let mut n = 0;
        for entry in entries {
            if entry.kind == MEMORY_KIND_USABLE && n < usable.len() {
                usable[n] = (PhysAddr::new(entry.base as usize), entry.length as usize);
                n += 1;
            }
        }
        unsafe {
            crate::memory::init(
                &usable[..n],
                PhysAddr::new(boot_info.kernel_start as usize),
                PhysAddr::new(boot_info.kernel_end as usize),
            );
        }

        // The boot tables stay live as the kernel-half template for every
        // address space.
        let (boot_root, _) = Cr3::read();
        let boot_root = PhysAddr::new(boot_root.start_address().as_u64() as usize);
        unsafe { crate::memory::page_table::set_kernel_template(boot_root) };

        init_heap(boot_root);

        // Safety: single call on the boot CPU.
        unsafe { crate::arch::x86_64::init_bsp() };

        let lapic = crate::arch::x86_64::apic::lapic_id();
        crate::scheduler::init(&[lapic]);
        crate::arch::x86_64::tlb::set_cpu_count(1);
        init_idle_task(0);

        crate::kinfo!("boot: waiting for the bootstrap task");
        // Safety: IDT and scheduler are live; interrupts may arrive.
        x86_64::instructions::interrupts::enable();
        idle_loop()
    }

    /// Map and initialize the kernel heap out of fresh frames.
    fn init_heap(boot_root: PhysAddr) {
        // Safety: the boot PML4 is live and exclusively ours this early.
        let mut mapper = unsafe { PageMapper::new(boot_root) };
        let flags = x86_64::structures::paging::PageTableFlags::PRESENT
            | x86_64::structures::paging::PageTableFlags::WRITABLE
            | x86_64::structures::paging::PageTableFlags::NO_EXECUTE;

        let mut offset = 0;
        while offset < HEAP_INITIAL_SIZE {
            let frame = crate::memory::alloc_frame().expect("out of memory mapping the heap");
            mapper
                .map(VirtAddr::new(HEAP_BASE + offset), frame.phys_addr(), flags)
                .expect("heap range already mapped");
            offset += PAGE_SIZE;
        }
        // Safety: the range was just mapped and is unused.
        unsafe { crate::memory::heap::init(VirtAddr::new(HEAP_BASE), HEAP_INITIAL_SIZE) };
        crate::kinfo!("heap: {} KiB at {:#x}", HEAP_INITIAL_SIZE / 1024, HEAP_BASE);
    }

    /// Give a CPU's idle task a real context: the idle loop on a small
    /// kernel stack, ring 0.
    fn init_idle_task(cpu: u32) {
        use alloc::boxed::Box;

        let Some(cpu_sched) = crate::scheduler::cpu(cpu) else {
            return;
        };
        const IDLE_STACK_SIZE: usize = 16 * 1024;
        #[repr(C, align(16))]
        struct IdleStack([u8; IDLE_STACK_SIZE]);
        let stack = Box::leak(Box::new(IdleStack([0u8; IDLE_STACK_SIZE])));

        let mut regs = cpu_sched.idle.regs.lock();
        regs.rip = idle_entry as usize as u64;
        regs.rsp = stack.0.as_ptr() as u64 + IDLE_STACK_SIZE as u64;
        let (cs, ss) = crate::arch::x86_64::gdt::selectors_for_ring(0);
        regs.cs = cs as u64;
        regs.ss = ss as u64;
    }

    extern "C" fn idle_entry() -> ! {
        idle_loop()
    }

    /// What the boot CPU does when nothing is runnable.
    pub fn idle_loop() -> ! {
        loop {
            crate::arch::x86_64::halt();
        }
    }
}

#[cfg(not(test))]
pub use run::{idle_loop, kernel_main};

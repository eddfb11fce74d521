//! Hardware page-table mapper
//!
//! Walks and edits the four-level x86_64 page-table tree. Table pages are
//! reached through the kernel's linear physical mapping, so this code can
//! edit any address space, not just the active one.
//!
//! Ownership of leaf frames is recorded in the entry itself: `BIT_9` (an
//! ignored-by-hardware bit) marks frames the mapping owns and must free on
//! unmap. Phys-mapped regions and memory-object frames leave it clear.

use crate::memory::address::{PageFrameNumber, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::{alloc_frame, dealloc_frame};
use thallium_abi::flags::RegionFlags;
use x86_64::structures::paging::page_table::{PageTable, PageTableEntry, PageTableFlags};

/// Marks a leaf frame owned by the mapping (freed on unmap).
pub const PTE_OWNED: PageTableFlags = PageTableFlags::BIT_9;

/// Errors from page-table edits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingError {
    /// The virtual address is already mapped
    AlreadyMapped,
    /// The virtual address is not mapped
    NotMapped,
    /// The range is covered by a huge page
    HugePage,
    /// No frames left for a page-table page
    OutOfMemory,
}

/// A page taken out of a page table by `unmap`.
#[derive(Debug, Clone, Copy)]
pub struct UnmappedPage {
    pub frame: PageFrameNumber,
    /// The mapping owned the frame; the caller must return it to the
    /// frame allocator.
    pub owned: bool,
}

#[inline]
fn table_mut(phys: PhysAddr) -> &'static mut PageTable {
    // Safety: table pages are private to the mapper and reached through
    // the linear mapping, which covers all RAM.
    unsafe { &mut *(phys.to_virt().as_usize() as *mut PageTable) }
}

/// Convert region access bits into hardware entry flags.
pub fn entry_flags(access: RegionFlags, user: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT;
    if access.contains(RegionFlags::WRITE) {
        flags |= PageTableFlags::WRITABLE;
    }
    if !access.contains(RegionFlags::EXEC) {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    if user {
        flags |= PageTableFlags::USER_ACCESSIBLE;
    }
    flags
}

/// Page-table mapper rooted at a PML4 frame.
pub struct PageMapper {
    root: PhysAddr,
}

impl PageMapper {
    /// Wrap an existing PML4.
    ///
    /// # Safety
    /// - `root` must point at a valid, live PML4 page
    pub unsafe fn new(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Allocate and zero a fresh PML4, copying the kernel half from
    /// `kernel_template` so every address space shares kernel mappings.
    pub fn new_root(kernel_template: PhysAddr) -> Result<PhysAddr, MappingError> {
        let frame = alloc_frame().ok_or(MappingError::OutOfMemory)?;
        let root = frame.phys_addr();
        let new_table = table_mut(root);
        new_table.zero();

        let template = table_mut(kernel_template);
        for i in 256..512 {
            new_table[i] = template[i].clone();
        }
        Ok(root)
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Install a 4 KiB mapping.
    ///
    /// Intermediate table pages are allocated on demand. Fails with
    /// `AlreadyMapped` if a present entry exists at the leaf.
    pub fn map(
        &mut self,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageTableFlags,
    ) -> Result<(), MappingError> {
        debug_assert!(virt.is_page_aligned());
        let pt = self.leaf_table(virt, true)?;
        let entry = &mut pt[virt.table_index(3)];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MappingError::AlreadyMapped);
        }
        entry.set_addr(x86_64::PhysAddr::new(phys.as_u64()), flags);
        Ok(())
    }

    /// Remove a 4 KiB mapping, returning the frame that was installed.
    pub fn unmap(&mut self, virt: VirtAddr) -> Result<UnmappedPage, MappingError> {
        debug_assert!(virt.is_page_aligned());
        let pt = self.leaf_table(virt, false)?;
        let entry = &mut pt[virt.table_index(3)];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MappingError::NotMapped);
        }
        let frame = PageFrameNumber::from_phys_addr(PhysAddr::new(entry.addr().as_u64() as usize));
        let owned = entry.flags().contains(PTE_OWNED);
        entry.set_unused();
        Ok(UnmappedPage { frame, owned })
    }

    /// Look up the physical address and flags a virtual page maps to.
    pub fn translate(&self, virt: VirtAddr) -> Option<(PhysAddr, PageTableFlags)> {
        let mut table = table_mut(self.root);
        for level in 0..3 {
            let entry = &table[virt.table_index(level)];
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) {
                return None;
            }
            if flags.contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = table_mut(PhysAddr::new(entry.addr().as_u64() as usize));
        }
        let entry = &table[virt.table_index(3)];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some((
            PhysAddr::new(entry.addr().as_u64() as usize),
            entry.flags(),
        ))
    }

    /// Rewrite the flags of an existing mapping (used for copy-on-write
    /// upgrades). Keeps the installed frame.
    pub fn update_flags(
        &mut self,
        virt: VirtAddr,
        flags: PageTableFlags,
    ) -> Result<(), MappingError> {
        let pt = self.leaf_table(virt, false)?;
        let entry = &mut pt[virt.table_index(3)];
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(MappingError::NotMapped);
        }
        let addr = entry.addr();
        entry.set_addr(addr, flags);
        Ok(())
    }

    /// Free every user-half table page of this tree. Leaf frames must have
    /// been released already (regions do that); only the paging structure
    /// itself is returned to the allocator, along with any stray owned
    /// leaves.
    ///
    /// # Safety
    /// - The address space must no longer be active on any CPU
    pub unsafe fn free_user_half(&mut self) {
        let root = table_mut(self.root);
        for i in 0..256 {
            let entry = &mut root[i];
            if entry.flags().contains(PageTableFlags::PRESENT) {
                free_table_level(PhysAddr::new(entry.addr().as_u64() as usize), 1);
                entry.set_unused();
            }
        }
    }

    /// Walk to the leaf page table for `virt`, optionally creating
    /// intermediate levels.
    fn leaf_table(
        &mut self,
        virt: VirtAddr,
        create: bool,
    ) -> Result<&'static mut PageTable, MappingError> {
        let mut table = table_mut(self.root);
        for level in 0..3 {
            let entry = &mut table[virt.table_index(level)];
            let flags = entry.flags();
            if flags.contains(PageTableFlags::HUGE_PAGE) {
                return Err(MappingError::HugePage);
            }
            if !flags.contains(PageTableFlags::PRESENT) {
                if !create {
                    return Err(MappingError::NotMapped);
                }
                let frame = alloc_frame().ok_or(MappingError::OutOfMemory)?;
                let next = frame.phys_addr();
                table_mut(next).zero();
                // Intermediate entries carry the most permissive flags;
                // the leaf entry enforces the real access mask.
                entry.set_addr(
                    x86_64::PhysAddr::new(next.as_u64()),
                    PageTableFlags::PRESENT
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::USER_ACCESSIBLE,
                );
            }
            table = table_mut(PhysAddr::new(entry.addr().as_u64() as usize));
        }
        Ok(table)
    }
}

/// Recursively free a table level and anything owned beneath it.
unsafe fn free_table_level(table_phys: PhysAddr, level: usize) {
    let table = table_mut(table_phys);
    for i in 0..512 {
        let entry: &mut PageTableEntry = &mut table[i];
        let flags = entry.flags();
        if !flags.contains(PageTableFlags::PRESENT) {
            continue;
        }
        let addr = PhysAddr::new(entry.addr().as_u64() as usize);
        if level < 3 && !flags.contains(PageTableFlags::HUGE_PAGE) {
            free_table_level(addr, level + 1);
        } else if flags.contains(PTE_OWNED) {
            dealloc_frame(PageFrameNumber::from_phys_addr(addr));
        }
        entry.set_unused();
    }
    dealloc_frame(PageFrameNumber::from_phys_addr(table_phys));
}

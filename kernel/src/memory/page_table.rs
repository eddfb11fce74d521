//! Address-space objects
//!
//! An `AddressSpace` pairs the hardware page-table tree with the kernel's
//! view of it: the sorted region map, the tasks attached to the space and
//! the memory objects pinned by mappings. All mutations go through the
//! space's lock.
//!
//! Page faults resolve here: normal regions allocate and zero a frame on
//! first touch, phys-mapped regions install the computed physical address,
//! object-backed regions consult the object (possibly leaving the task
//! blocked while a pager is asked for the page).
//!
//! Host tests replace the hardware walker with a map-backed simulation so
//! the fault, delete and transfer paths run unmodified.

use crate::memory::address::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::memory::mem_object::{FrameRequest, MemObject};
#[cfg(not(test))]
use crate::memory::paging::{MappingError, PageMapper};
use crate::memory::paging::{entry_flags, PTE_OWNED};
use crate::memory::region::{Region, RegionKind, RegionMap};
use crate::memory::{alloc_frame, copy_frame, dealloc_frame, zero_frame, PageFrameNumber};
use crate::objects::task::Task;
use crate::KernResult;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use thallium_abi::flags::RegionFlags;
use thallium_abi::{PageTableId, SysError, TaskId};
use x86_64::structures::paging::page_table::PageTableFlags;

/// Global registry of live address spaces.
static SPACES: Mutex<BTreeMap<PageTableId, Weak<AddressSpace>>> = Mutex::new(BTreeMap::new());

/// Space ids are monotonically increasing and never reused within a boot.
static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// PML4 template whose kernel half is copied into every new space.
#[cfg(not(test))]
static KERNEL_TEMPLATE: spin::Once<PhysAddr> = spin::Once::new();

/// Record the boot page table as the kernel-half template.
///
/// # Safety
/// - `root` must be the live boot PML4 with the kernel half populated
#[cfg(not(test))]
pub unsafe fn set_kernel_template(root: PhysAddr) {
    KERNEL_TEMPLATE.call_once(|| root);
}

/// The page-table walker, or its test stand-in.
struct Mapper {
    #[cfg(not(test))]
    hw: PageMapper,
    #[cfg(test)]
    sim: BTreeMap<usize, (PhysAddr, PageTableFlags)>,
}

impl Mapper {
    #[cfg(not(test))]
    fn create() -> KernResult<Self> {
        let template = *KERNEL_TEMPLATE.get().ok_or(SysError::General)?;
        let root = PageMapper::new_root(template).map_err(map_err)?;
        // Safety: the root was just allocated for this mapper.
        Ok(Self {
            hw: unsafe { PageMapper::new(root) },
        })
    }

    #[cfg(test)]
    fn create() -> KernResult<Self> {
        Ok(Self {
            sim: BTreeMap::new(),
        })
    }

    fn map(&mut self, virt: usize, phys: PhysAddr, flags: PageTableFlags) -> KernResult<()> {
        #[cfg(not(test))]
        return self.hw.map(VirtAddr::new(virt), phys, flags).map_err(map_err);
        #[cfg(test)]
        {
            if self.sim.contains_key(&virt) {
                return Err(SysError::PagePresent);
            }
            self.sim.insert(virt, (phys, flags));
            Ok(())
        }
    }

    fn unmap(&mut self, virt: usize) -> Option<(PageFrameNumber, bool)> {
        #[cfg(not(test))]
        {
            self.hw
                .unmap(VirtAddr::new(virt))
                .ok()
                .map(|u| (u.frame, u.owned))
        }
        #[cfg(test)]
        {
            self.sim.remove(&virt).map(|(phys, flags)| {
                (
                    PageFrameNumber::from_phys_addr(phys),
                    flags.contains(PTE_OWNED),
                )
            })
        }
    }

    fn translate(&self, virt: usize) -> Option<(PhysAddr, PageTableFlags)> {
        #[cfg(not(test))]
        return self.hw.translate(VirtAddr::new(virt));
        #[cfg(test)]
        self.sim.get(&virt).copied()
    }

    #[cfg(not(test))]
    fn root(&self) -> PhysAddr {
        self.hw.root()
    }
}

#[cfg(not(test))]
fn map_err(e: MappingError) -> SysError {
    match e {
        MappingError::AlreadyMapped => SysError::PagePresent,
        MappingError::NotMapped => SysError::PageNotPresent,
        MappingError::HugePage => SysError::HugePage,
        MappingError::OutOfMemory => SysError::OutOfMemory,
    }
}

struct SpaceInner {
    mapper: Mapper,
    regions: RegionMap,
    /// Tasks currently using this space.
    attached: BTreeMap<TaskId, Weak<Task>>,
    /// Objects kept alive because a region (or an explicit pin) maps them.
    pinned_objects: BTreeMap<u64, Arc<MemObject>>,
}

/// Result of a resolved page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping is installed; retry the access.
    Handled,
    /// The task must block until a pager provides the page.
    Blocked,
}

/// An address space: hardware tables plus the kernel's region map.
pub struct AddressSpace {
    pub id: PageTableId,
    inner: Mutex<SpaceInner>,
}

impl AddressSpace {
    /// Create an empty user address space.
    pub fn new() -> KernResult<Arc<Self>> {
        let id = NEXT_SPACE_ID.fetch_add(1, Ordering::SeqCst);
        let space = Arc::new(Self {
            id,
            inner: Mutex::new(SpaceInner {
                mapper: Mapper::create()?,
                regions: RegionMap::new(),
                attached: BTreeMap::new(),
                pinned_objects: BTreeMap::new(),
            }),
        });
        SPACES.lock().insert(id, Arc::downgrade(&space));
        Ok(space)
    }

    /// Look up a live address space by id.
    pub fn get(id: PageTableId) -> KernResult<Arc<Self>> {
        SPACES
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(SysError::HasNoPageTable)
    }

    /// Physical address of the PML4 for CR3 loads.
    #[cfg(not(test))]
    pub fn root_phys(&self) -> PhysAddr {
        self.inner.lock().mapper.root()
    }

    /// Attach a task to this space.
    pub fn attach_task(&self, task: &Arc<Task>) {
        self.inner
            .lock()
            .attached
            .insert(task.id, Arc::downgrade(task));
    }

    /// Detach a task (kill or page-table replacement).
    pub fn detach_task(&self, task_id: TaskId) {
        self.inner.lock().attached.remove(&task_id);
    }

    /// Create a zero-fill region.
    pub fn create_normal_region(
        &self,
        hint: usize,
        size: usize,
        access: RegionFlags,
        name: String,
        grow_down: bool,
    ) -> KernResult<usize> {
        check_aligned(hint, size)?;
        let mut inner = self.inner.lock();
        let start = inner
            .regions
            .place(hint, size, access.contains(RegionFlags::FIXED))?;
        inner.regions.insert(Region {
            start,
            size,
            access,
            name,
            kind: RegionKind::Normal { grow_down },
        });
        Ok(start)
    }

    /// Create a region windowing fixed physical memory.
    pub fn create_phys_region(
        &self,
        hint: usize,
        size: usize,
        access: RegionFlags,
        name: String,
        phys_base: usize,
    ) -> KernResult<usize> {
        check_aligned(hint, size)?;
        if phys_base % PAGE_SIZE != 0 {
            return Err(SysError::Unaligned);
        }
        let mut inner = self.inner.lock();
        let start = inner
            .regions
            .place(hint, size, access.contains(RegionFlags::FIXED))?;
        inner.regions.insert(Region {
            start,
            size,
            access,
            name,
            kind: RegionKind::Phys { phys_base },
        });
        Ok(start)
    }

    /// Map a memory object into this space.
    pub fn map_mem_object(
        &self,
        hint: usize,
        size: usize,
        access: RegionFlags,
        name: String,
        object: Arc<MemObject>,
        offset: usize,
    ) -> KernResult<usize> {
        check_aligned(hint, size)?;
        if offset % PAGE_SIZE != 0 {
            return Err(SysError::Unaligned);
        }
        if (offset + size) / PAGE_SIZE > object.size_pages() {
            return Err(SysError::OutOfRange);
        }
        let mut inner = self.inner.lock();
        let start = inner
            .regions
            .place(hint, size, access.contains(RegionFlags::FIXED))?;
        inner
            .pinned_objects
            .insert(object.id(), object.clone());
        inner.regions.insert(Region {
            start,
            size,
            access,
            name,
            kind: RegionKind::Object {
                object,
                offset,
                cow: access.contains(RegionFlags::COW),
            },
        });
        Ok(start)
    }

    /// Keep an object alive for this space regardless of mappings.
    pub fn pin_mem_object(&self, object: Arc<MemObject>) {
        self.inner.lock().pinned_objects.insert(object.id(), object);
    }

    /// Delete the region containing `addr`, unmapping its pages and
    /// returning owned frames to the allocator.
    pub fn delete_region(&self, addr: usize) -> KernResult<()> {
        let mut inner = self.inner.lock();
        let region = inner
            .regions
            .remove_containing(addr)
            .ok_or(SysError::RegionDoesntExist)?;

        unmap_range(&mut inner.mapper, region.start, region.size);
        self.unpin_if_unused(&mut inner, &region);
        drop(inner);

        crate::arch::tlb_shootdown(self.id, region.start, region.size);
        Ok(())
    }

    /// Atomically move the region containing `vaddr` into `dst`.
    ///
    /// Mappings move with the region: already-faulted pages stay backed by
    /// the same frames at the same offsets. Returns the region's new start.
    pub fn transfer_region(
        self: &Arc<Self>,
        dst: &Arc<AddressSpace>,
        vaddr: usize,
        dst_hint: usize,
        access: RegionFlags,
    ) -> KernResult<usize> {
        if Arc::ptr_eq(self, dst) {
            return Err(SysError::NotSupported);
        }

        // Lock order by id keeps concurrent transfers deadlock free.
        let (mut src_inner, mut dst_inner) = if self.id < dst.id {
            let a = self.inner.lock();
            let b = dst.inner.lock();
            (a, b)
        } else {
            let b = dst.inner.lock();
            let a = self.inner.lock();
            (a, b)
        };

        let region = src_inner
            .regions
            .find(vaddr)
            .cloned()
            .ok_or(SysError::RegionDoesntExist)?;

        let new_start = dst_inner
            .regions
            .place(dst_hint, region.size, access.contains(RegionFlags::FIXED))?;

        // Move the hardware mappings across, preserving frame ownership.
        let user_flags = entry_flags(access, true);
        let mut page = region.start;
        while page < region.end() {
            if let Some((frame, owned)) = src_inner.mapper.unmap(page) {
                let mut flags = user_flags;
                if owned {
                    flags |= PTE_OWNED;
                }
                let target = new_start + (page - region.start);
                if let Err(e) = dst_inner.mapper.map(target, frame.phys_addr(), flags) {
                    // The placement guaranteed an empty range; a failure
                    // here is allocation pressure. Give the frame back
                    // rather than leak it.
                    if owned {
                        unsafe { dealloc_frame(frame) };
                    }
                    let _ = e;
                }
            }
            page += PAGE_SIZE;
        }

        let mut moved = region.clone();
        src_inner.regions.remove_containing(vaddr);
        moved.start = new_start;
        moved.access = access
            & (RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC | RegionFlags::COW);

        if let RegionKind::Object { object, .. } = &moved.kind {
            dst_inner
                .pinned_objects
                .insert(object.id(), object.clone());
        }
        self.unpin_if_unused(&mut src_inner, &region);
        dst_inner.regions.insert(moved);

        drop(src_inner);
        drop(dst_inner);
        crate::arch::tlb_shootdown(self.id, region.start, region.size);
        Ok(new_start)
    }

    /// Service a page fault at `vaddr` with the requested access.
    ///
    /// `Err` means the fault is not forwardable (no region, or the access
    /// violates the region mask) and the task must be killed or the
    /// syscall failed.
    pub fn handle_page_fault(
        &self,
        task: &Arc<Task>,
        vaddr: usize,
        access: RegionFlags,
    ) -> KernResult<FaultOutcome> {
        let page = vaddr & !(PAGE_SIZE - 1);
        let mut inner = self.inner.lock();

        // Grow-down: extend the region above the fault before the lookup.
        if inner.regions.find(vaddr).is_none() {
            if let Some(region) = inner.regions.find_grow_down(vaddr) {
                let mut start = region.start;
                while start > page {
                    match inner.regions.extend_down(start) {
                        Some(new_start) => start = new_start,
                        None => break,
                    }
                }
            }
        }

        let region = inner
            .regions
            .find(vaddr)
            .cloned()
            .ok_or(SysError::PageNotAllocated)?;
        if !region.allows(access) {
            return Err(SysError::NoPermission);
        }

        // Already present: either a stale TLB entry or a copy-on-write
        // write fault.
        if let Some((phys, flags)) = inner.mapper.translate(page) {
            if access.contains(RegionFlags::WRITE) && !flags.contains(PageTableFlags::WRITABLE) {
                if let RegionKind::Object { cow: true, .. } = region.kind {
                    let private = alloc_frame().ok_or(SysError::OutOfMemory)?;
                    copy_frame(private, PageFrameNumber::from_phys_addr(phys));
                    inner.mapper.unmap(page);
                    inner.mapper.map(
                        page,
                        private.phys_addr(),
                        entry_flags(region.access, true) | PTE_OWNED,
                    )?;
                    drop(inner);
                    crate::arch::tlb_shootdown(self.id, page, PAGE_SIZE);
                    return Ok(FaultOutcome::Handled);
                }
                return Err(SysError::NoPermission);
            }
            return Ok(FaultOutcome::Handled);
        }

        match &region.kind {
            RegionKind::Normal { .. } => {
                let frame = alloc_frame().ok_or(SysError::OutOfMemory)?;
                zero_frame(frame);
                if let Err(e) = inner.mapper.map(
                    page,
                    frame.phys_addr(),
                    entry_flags(region.access, true) | PTE_OWNED,
                ) {
                    // Safety: the frame never became visible.
                    unsafe { dealloc_frame(frame) };
                    return Err(e);
                }
                Ok(FaultOutcome::Handled)
            }
            RegionKind::Phys { .. } => {
                let phys = region.phys_page(page).ok_or(SysError::General)?;
                inner
                    .mapper
                    .map(page, PhysAddr::new(phys), entry_flags(region.access, true))?;
                Ok(FaultOutcome::Handled)
            }
            RegionKind::Object { object, cow, .. } => {
                let index = region.object_page(page).ok_or(SysError::General)?;
                match object.request_frame(index)? {
                    FrameRequest::Ready(frame) => {
                        let mut flags = entry_flags(region.access, true);
                        if *cow {
                            // Shared frame stays read-only; the write
                            // fault above makes the private copy.
                            flags &= !PageTableFlags::WRITABLE;
                        }
                        inner.mapper.map(page, frame.phys_addr(), flags)?;
                        Ok(FaultOutcome::Handled)
                    }
                    FrameRequest::NeedsPager => {
                        object.add_waiter(index, Arc::downgrade(task));
                        task.set_page_blocked(page as u64);
                        Ok(FaultOutcome::Blocked)
                    }
                }
            }
        }
    }

    /// Ensure a user page is mapped with the required access before the
    /// kernel touches it on the caller's behalf.
    ///
    /// Returns `true` if the page is usable now, `false` if the task was
    /// queued behind a pager and must repeat the syscall on wake.
    pub fn prepare_user_page(
        &self,
        task: &Arc<Task>,
        vaddr: usize,
        write: bool,
    ) -> KernResult<bool> {
        if !VirtAddr::new(vaddr).is_user() {
            return Err(SysError::OutOfRange);
        }
        let page = vaddr & !(PAGE_SIZE - 1);
        let access = if write {
            RegionFlags::WRITE
        } else {
            RegionFlags::READ
        };

        {
            let inner = self.inner.lock();
            if let Some((_, flags)) = inner.mapper.translate(page) {
                if !write || flags.contains(PageTableFlags::WRITABLE) {
                    return Ok(true);
                }
            }
        }

        match self.handle_page_fault(task, vaddr, access)? {
            FaultOutcome::Handled => Ok(true),
            FaultOutcome::Blocked => Ok(false),
        }
    }

    /// Take a present, region-owned page out of this space (the
    /// `provide-page` donation path). The region stays; a later touch of
    /// the address faults a fresh zero page in.
    pub fn take_page(&self, vaddr: usize) -> KernResult<PageFrameNumber> {
        let page = vaddr & !(PAGE_SIZE - 1);
        let mut inner = self.inner.lock();
        match inner.mapper.translate(page) {
            Some((_, flags)) if flags.contains(PTE_OWNED) => {}
            Some(_) => return Err(SysError::WrongPageType),
            None => return Err(SysError::PageNotPresent),
        }
        let (frame, _) = inner
            .mapper
            .unmap(page)
            .ok_or(SysError::PageNotPresent)?;
        drop(inner);
        crate::arch::tlb_shootdown(self.id, page, PAGE_SIZE);
        Ok(frame)
    }

    /// Deep-copy this space: same regions, private copies of normal
    /// frames, shared objects and phys windows.
    pub fn clone_space(&self) -> KernResult<Arc<AddressSpace>> {
        let clone = AddressSpace::new()?;
        let inner = self.inner.lock();
        let mut clone_inner = clone.inner.lock();

        for region in inner.regions.iter() {
            clone_inner.regions.insert(region.clone());
            if let RegionKind::Object { object, .. } = &region.kind {
                clone_inner
                    .pinned_objects
                    .insert(object.id(), object.clone());
            }

            let mut page = region.start;
            while page < region.end() {
                if let Some((phys, flags)) = inner.mapper.translate(page) {
                    if flags.contains(PTE_OWNED) {
                        let frame = alloc_frame().ok_or(SysError::OutOfMemory)?;
                        copy_frame(frame, PageFrameNumber::from_phys_addr(phys));
                        clone_inner.mapper.map(page, frame.phys_addr(), flags)?;
                    } else {
                        clone_inner.mapper.map(page, phys, flags)?;
                    }
                }
                page += PAGE_SIZE;
            }
        }

        for (id, object) in inner.pinned_objects.iter() {
            clone_inner.pinned_objects.insert(*id, object.clone());
        }

        drop(clone_inner);
        Ok(clone)
    }

    /// Pages currently covered by regions (diagnostics and tests).
    pub fn mapped_region_pages(&self) -> usize {
        self.inner.lock().regions.mapped_pages()
    }

    /// Number of regions (diagnostics and tests).
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Drop an object pin when no remaining region maps it.
    fn unpin_if_unused(&self, inner: &mut SpaceInner, removed: &Region) {
        if let RegionKind::Object { object, .. } = &removed.kind {
            let still_mapped = inner.regions.iter().any(|r| match &r.kind {
                RegionKind::Object { object: o, .. } => o.id() == object.id(),
                _ => false,
            });
            if !still_mapped {
                inner.pinned_objects.remove(&object.id());
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        SPACES.lock().remove(&self.id);
        let inner = self.inner.get_mut();

        // Return every owned frame before tearing down the tree.
        let starts: alloc::vec::Vec<usize> = inner.regions.iter().map(|r| r.start).collect();
        for start in starts {
            if let Some(region) = inner.regions.remove_containing(start) {
                unmap_range(&mut inner.mapper, region.start, region.size);
            }
        }

        #[cfg(not(test))]
        {
            // Safety: nothing is attached anymore; the space is unreachable.
            let mut mapper = unsafe { PageMapper::new(inner.mapper.root()) };
            unsafe { mapper.free_user_half() };
        }
    }
}

fn check_aligned(addr: usize, size: usize) -> KernResult<()> {
    if addr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(SysError::Unaligned);
    }
    if size == 0 {
        return Err(SysError::OutOfRange);
    }
    Ok(())
}

fn unmap_range(mapper: &mut Mapper, start: usize, size: usize) {
    let mut page = start;
    while page < start + size {
        if let Some((frame, owned)) = mapper.unmap(page) {
            if owned {
                // Safety: the mapping owned this frame and it is now
                // unreachable.
                unsafe { dealloc_frame(frame) };
            }
        }
        page += PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;
    use crate::objects::task::Task;
    use alloc::string::ToString;

    fn task() -> Arc<Task> {
        Task::create_for_tests()
    }

    fn rw() -> RegionFlags {
        RegionFlags::READ | RegionFlags::WRITE
    }

    #[test]
    fn lazy_allocation_and_delete_roundtrip() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        let frames_before = crate::memory::free_frames();

        let start = space
            .create_normal_region(0x400000, 0x2000, rw(), "heap".to_string(), false)
            .unwrap();
        assert_eq!(start, 0x400000);
        // Region creation alone allocates nothing.
        assert_eq!(crate::memory::free_frames(), frames_before);

        // Touch both pages, at 0x400fff and 0x401000.
        assert_eq!(
            space
                .handle_page_fault(&t, 0x400fff, RegionFlags::WRITE)
                .unwrap(),
            FaultOutcome::Handled
        );
        assert_eq!(
            space
                .handle_page_fault(&t, 0x401000, RegionFlags::WRITE)
                .unwrap(),
            FaultOutcome::Handled
        );
        assert_eq!(crate::memory::free_frames(), frames_before - 2);

        // A second fault on the same page allocates nothing more.
        assert_eq!(
            space
                .handle_page_fault(&t, 0x400010, RegionFlags::READ)
                .unwrap(),
            FaultOutcome::Handled
        );
        assert_eq!(crate::memory::free_frames(), frames_before - 2);

        space.delete_region(0x400000).unwrap();
        assert_eq!(crate::memory::free_frames(), frames_before);
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn fault_outside_any_region_is_an_error() {
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        assert_eq!(
            space.handle_page_fault(&t, 0x123000, RegionFlags::READ),
            Err(SysError::PageNotAllocated)
        );
    }

    #[test]
    fn access_violation_is_rejected() {
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        space
            .create_normal_region(0x400000, 0x1000, RegionFlags::READ, String::new(), false)
            .unwrap();
        assert_eq!(
            space.handle_page_fault(&t, 0x400000, RegionFlags::WRITE),
            Err(SysError::NoPermission)
        );
    }

    #[test]
    fn phys_region_maps_computed_addresses() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        let frames_before = crate::memory::free_frames();

        let start = space
            .create_phys_region(0x500000, 0x2000, rw(), "mmio".to_string(), 0xfee0_0000)
            .unwrap();
        space
            .handle_page_fault(&t, start + 0x1000, RegionFlags::READ)
            .unwrap();

        // Phys regions never take frames from the allocator.
        assert_eq!(crate::memory::free_frames(), frames_before);
        let inner = space.inner.lock();
        let (phys, _) = inner.mapper.translate(start + 0x1000).unwrap();
        assert_eq!(phys.as_usize(), 0xfee0_1000);
    }

    #[test]
    fn object_shared_between_spaces() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let a = AddressSpace::new().unwrap();
        let b = AddressSpace::new().unwrap();
        let ta = task();
        let tb = task();

        let obj = MemObject::create(12, 4, None);
        let va = a
            .map_mem_object(0x400000, 0x4000, rw(), String::new(), obj.clone(), 0)
            .unwrap();
        let vb = b
            .map_mem_object(0x700000, 0x4000, rw(), String::new(), obj.clone(), 0)
            .unwrap();

        // A's write fault materializes the frame; B's read fault sees the
        // same frame.
        a.handle_page_fault(&ta, va, RegionFlags::WRITE).unwrap();
        b.handle_page_fault(&tb, vb, RegionFlags::READ).unwrap();

        let pa = a.inner.lock().mapper.translate(va).unwrap().0;
        let pb = b.inner.lock().mapper.translate(vb).unwrap().0;
        assert_eq!(pa, pb);
    }

    #[test]
    fn grow_down_extends_to_fault() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        space
            .create_normal_region(0x7000_0000, 0x4000, rw(), "stack".to_string(), true)
            .unwrap();

        // Fault two pages below the region start.
        space
            .handle_page_fault(&t, 0x6fff_e008, RegionFlags::WRITE)
            .unwrap();
        let inner = space.inner.lock();
        let region = inner.regions.find(0x6fff_e000).unwrap();
        assert_eq!(region.start, 0x6fff_e000);
        assert_eq!(region.size, 0x6000);
    }

    #[test]
    fn transfer_preserves_mappings() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let src = AddressSpace::new().unwrap();
        let dst = AddressSpace::new().unwrap();
        let t = task();

        let start = src
            .create_normal_region(0x400000, 0x2000, rw(), String::new(), false)
            .unwrap();
        src.handle_page_fault(&t, start, RegionFlags::WRITE).unwrap();
        let frame = src.inner.lock().mapper.translate(start).unwrap().0;

        let new_start = src
            .transfer_region(&dst, start, 0x900000, rw())
            .unwrap();
        assert_eq!(new_start, 0x900000);
        assert_eq!(src.region_count(), 0);
        assert_eq!(dst.region_count(), 1);

        // The already-faulted page moved with its frame.
        let moved = dst.inner.lock().mapper.translate(new_start).unwrap().0;
        assert_eq!(moved, frame);
        assert!(src.inner.lock().mapper.translate(start).is_none());
    }

    #[test]
    fn prepare_user_page_faults_in_lazily() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();
        let start = space
            .create_normal_region(0x400000, 0x1000, rw(), String::new(), false)
            .unwrap();

        assert!(space.prepare_user_page(&t, start + 8, true).unwrap());
        // Now present; the second call takes the fast path.
        assert!(space.prepare_user_page(&t, start + 8, true).unwrap());
        // Kernel addresses are never user-preparable.
        assert!(space
            .prepare_user_page(&t, crate::memory::PHYS_MAP_BASE, false)
            .is_err());
    }

    #[test]
    fn pager_backed_fault_blocks() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let space = AddressSpace::new().unwrap();
        let t = task();

        let pager_task = task();
        let port = crate::objects::port::Port::create(&pager_task).unwrap();
        let obj = MemObject::create(12, 1, Some(Arc::downgrade(&port)));

        let va = space
            .map_mem_object(0x400000, 0x1000, rw(), String::new(), obj.clone(), 0)
            .unwrap();
        assert_eq!(
            space.handle_page_fault(&t, va, RegionFlags::READ).unwrap(),
            FaultOutcome::Blocked
        );

        // The pager got exactly one request for the page.
        let (_, _, msg) = port.peek_front().unwrap();
        assert_eq!(msg.len(), core::mem::size_of::<thallium_abi::ipc::KernelRequestPage>());

        // Providing the page wakes the waiter and a retry succeeds.
        let frame = crate::memory::alloc_frame().unwrap();
        let woken = obj.provide_frame(0, frame).unwrap();
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].id, t.id);
        assert_eq!(
            space.handle_page_fault(&t, va, RegionFlags::READ).unwrap(),
            FaultOutcome::Handled
        );
    }
}

//! Region descriptors and the per-address-space region map
//!
//! A region is a contiguous range of page-aligned virtual addresses with a
//! uniform policy: zero-fill on first touch, a fixed physical window, or a
//! view into a memory object. Regions tile the mapped address space; no
//! two regions of one address space ever overlap.
//!
//! The map itself is pure bookkeeping (no page-table edits), keyed by
//! region start in a `BTreeMap` so "region containing address" is a
//! `range(..=addr).next_back()` plus a bounds check.

use crate::config::GROW_DOWN_SOFT_LIMIT;
use crate::memory::address::{PAGE_SIZE, USER_MAX, USER_MIN};
use crate::memory::mem_object::MemObject;
use crate::KernResult;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use thallium_abi::flags::RegionFlags;
use thallium_abi::SysError;

/// What backs the pages of a region.
#[derive(Clone)]
pub enum RegionKind {
    /// Zero-filled frames allocated on first touch. `grow_down` regions
    /// also service faults below `start` (within a soft limit) by
    /// extending the region downward.
    Normal { grow_down: bool },
    /// A fixed physical window: page `start + n` maps to
    /// `phys_base + n * PAGE_SIZE`. Never allocates frames.
    Phys { phys_base: usize },
    /// A view into a memory object starting at `offset` bytes.
    Object {
        object: Arc<MemObject>,
        offset: usize,
        cow: bool,
    },
}

/// A contiguous virtual range with uniform policy inside one address space.
#[derive(Clone)]
pub struct Region {
    pub start: usize,
    pub size: usize,
    pub access: RegionFlags,
    pub name: String,
    pub kind: RegionKind,
}

impl Region {
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    /// Whether an access with the given mask is permitted.
    pub fn allows(&self, requested: RegionFlags) -> bool {
        self.access.contains(requested & (RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC))
    }

    /// Physical address backing a page of a phys-mapped region.
    pub fn phys_page(&self, page_base: usize) -> Option<usize> {
        match &self.kind {
            RegionKind::Phys { phys_base } => Some(phys_base + (page_base - self.start)),
            _ => None,
        }
    }

    /// Object page index backing a page of an object region.
    pub fn object_page(&self, page_base: usize) -> Option<usize> {
        match &self.kind {
            RegionKind::Object { offset, .. } => {
                Some((offset + (page_base - self.start)) / PAGE_SIZE)
            }
            _ => None,
        }
    }

    pub fn is_grow_down(&self) -> bool {
        matches!(self.kind, RegionKind::Normal { grow_down: true })
    }
}

/// The sorted region map of one address space.
pub struct RegionMap {
    regions: BTreeMap<usize, Region>,
}

impl RegionMap {
    pub const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// Region containing `addr`, if any.
    pub fn find(&self, addr: usize) -> Option<&Region> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        region.contains(addr).then_some(region)
    }

    /// Grow-down region whose soft window covers a fault at `addr`:
    /// the closest region above `addr` that is grow-down and within the
    /// soft limit, with no other region in between.
    pub fn find_grow_down(&self, addr: usize) -> Option<&Region> {
        let (_, region) = self.regions.range(addr..).next()?;
        let window = region.start.saturating_sub(GROW_DOWN_SOFT_LIMIT);
        (region.is_grow_down() && addr >= window).then_some(region)
    }

    /// Whether `[start, start + size)` overlaps an existing region.
    pub fn overlaps(&self, start: usize, size: usize) -> bool {
        let end = start.saturating_add(size);
        if let Some((_, below)) = self.regions.range(..=start).next_back() {
            if below.end() > start {
                return true;
            }
        }
        self.regions.range(start..end).next().is_some()
    }

    /// Choose a start address for a new region.
    ///
    /// With `FIXED` the hint is authoritative: an occupied range is a
    /// `PagePresent` error. Otherwise the hint is taken when free, or the
    /// map is scanned upward for the first gap large enough.
    pub fn place(&self, hint: usize, size: usize, fixed: bool) -> KernResult<usize> {
        debug_assert!(hint % PAGE_SIZE == 0 && size % PAGE_SIZE == 0 && size != 0);
        let hint = hint.max(USER_MIN);
        let hint_end = hint.checked_add(size).ok_or(SysError::OutOfRange)?;

        if fixed {
            if hint_end > USER_MAX {
                return Err(SysError::OutOfRange);
            }
            if self.overlaps(hint, size) {
                return Err(SysError::PagePresent);
            }
            return Ok(hint);
        }

        if hint_end <= USER_MAX && !self.overlaps(hint, size) {
            return Ok(hint);
        }

        // First-fit scan upward from the hint.
        let mut cursor = hint;
        for (_, region) in self.regions.range(hint..) {
            if region.start >= cursor.saturating_add(size) {
                break;
            }
            cursor = region.end();
        }
        if cursor.saturating_add(size) > USER_MAX {
            return Err(SysError::OutOfMemory);
        }
        Ok(cursor)
    }

    /// Insert a region. The caller must have placed it first.
    pub fn insert(&mut self, region: Region) {
        debug_assert!(!self.overlaps(region.start, region.size));
        self.regions.insert(region.start, region);
    }

    /// Remove and return the region containing `addr`.
    pub fn remove_containing(&mut self, addr: usize) -> Option<Region> {
        let start = self.find(addr)?.start;
        self.regions.remove(&start)
    }

    /// Extend a grow-down region one page below its current start,
    /// returning the new start. The caller must have verified the fault
    /// lies in the soft window.
    pub fn extend_down(&mut self, start: usize) -> Option<usize> {
        let mut region = self.regions.remove(&start)?;
        debug_assert!(region.is_grow_down());
        region.start -= PAGE_SIZE;
        region.size += PAGE_SIZE;
        let new_start = region.start;
        self.regions.insert(new_start, region);
        Some(new_start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total pages covered by all regions.
    pub fn mapped_pages(&self) -> usize {
        self.regions.values().map(|r| r.size / PAGE_SIZE).sum()
    }
}

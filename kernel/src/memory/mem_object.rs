//! Memory objects
//!
//! A memory object is a numbered, reference-counted array of page frames
//! that can back regions in any number of address spaces. Frames
//! materialize on the first fault within any mapping.
//!
//! Objects created without a pager behave as anonymous shared memory:
//! absent frames are zero-filled on demand. Objects with a pager port
//! leave the faulting task blocked and post a `KernelRequestPage` message
//! to the pager, which answers with the `provide-page` syscall.

use crate::memory::address::PageFrameNumber;
use crate::memory::{dealloc_frame, zero_frame};
use crate::objects::port::Port;
use crate::objects::task::Task;
use crate::KernResult;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use thallium_abi::ipc::{KernelRequestPage, KERNEL_MSG_REQUEST_PAGE};
use thallium_abi::{MemObjectId, SysError};

/// Global registry of live memory objects.
static OBJECTS: Mutex<BTreeMap<MemObjectId, Weak<MemObject>>> = Mutex::new(BTreeMap::new());

/// Object ids are monotonically increasing and never reused within a boot.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

struct ObjectInner {
    /// One slot per page; `None` until the frame materializes.
    frames: Vec<Option<PageFrameNumber>>,
    /// Tasks blocked waiting for a pager to provide a page, keyed by page
    /// index. Presence of a key means the page request is already in
    /// flight and must not be re-posted.
    waiters: BTreeMap<usize, Vec<Weak<Task>>>,
}

/// A shareable array of frames backing object regions.
pub struct MemObject {
    id: MemObjectId,
    page_size_log: u8,
    inner: Mutex<ObjectInner>,
    /// Pager handling absent pages; `None` means zero-fill on demand.
    pager: Mutex<Option<Weak<Port>>>,
}

/// Outcome of asking an object for a frame during a fault.
pub enum FrameRequest {
    /// The frame is present (or was just materialized); install it.
    Ready(PageFrameNumber),
    /// A pager owns this page; the caller must block the faulting task.
    NeedsPager,
}

impl MemObject {
    /// Create an object of `pages` pages and register it globally.
    pub fn create(page_size_log: u8, pages: usize, pager: Option<Weak<Port>>) -> Arc<MemObject> {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::SeqCst);
        let mut frames = Vec::new();
        frames.resize(pages, None);
        let object = Arc::new(MemObject {
            id,
            page_size_log,
            inner: Mutex::new(ObjectInner {
                frames,
                waiters: BTreeMap::new(),
            }),
            pager: Mutex::new(pager),
        });
        OBJECTS.lock().insert(id, Arc::downgrade(&object));
        object
    }

    /// Look up a live object by id.
    pub fn get(id: MemObjectId) -> KernResult<Arc<MemObject>> {
        OBJECTS
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(SysError::ObjectDoesntExist)
    }

    pub fn id(&self) -> MemObjectId {
        self.id
    }

    pub fn page_size_log(&self) -> u8 {
        self.page_size_log
    }

    pub fn size_pages(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// The frame at `index`, if it has materialized.
    pub fn frame_at(&self, index: usize) -> Option<PageFrameNumber> {
        self.inner.lock().frames.get(index).copied().flatten()
    }

    /// Request the frame backing page `index` for a fault.
    ///
    /// Without a pager, an absent frame is allocated and zeroed here.
    pub fn request_frame(&self, index: usize) -> KernResult<FrameRequest> {
        let mut inner = self.inner.lock();
        let slot = inner
            .frames
            .get(index)
            .copied()
            .ok_or(SysError::OutOfRange)?;

        if let Some(frame) = slot {
            return Ok(FrameRequest::Ready(frame));
        }

        let has_pager = self
            .pager
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some();
        if has_pager {
            return Ok(FrameRequest::NeedsPager);
        }

        let frame = crate::memory::alloc_frame().ok_or(SysError::OutOfMemory)?;
        zero_frame(frame);
        inner.frames[index] = Some(frame);
        Ok(FrameRequest::Ready(frame))
    }

    /// Record a task blocked on page `index` and post the page request to
    /// the pager if this is the first waiter.
    pub fn add_waiter(&self, index: usize, task: Weak<Task>) {
        let first = {
            let mut inner = self.inner.lock();
            let waiters = inner.waiters.entry(index).or_insert_with(Vec::new);
            waiters.push(task);
            waiters.len() == 1
        };

        if first {
            if let Some(pager) = self.pager.lock().as_ref().and_then(Weak::upgrade) {
                let msg = KernelRequestPage {
                    msg_type: KERNEL_MSG_REQUEST_PAGE,
                    flags: 0,
                    object_id: self.id,
                    page_offset: (index as u64) << self.page_size_log,
                };
                let _ = pager.send_kernel_message(thallium_abi::ipc::as_bytes(&msg));
            }
        }
    }

    /// Install a pager-provided frame into page `index` and return the
    /// tasks that were blocked on it.
    pub fn provide_frame(
        &self,
        index: usize,
        frame: PageFrameNumber,
    ) -> KernResult<Vec<Arc<Task>>> {
        let mut inner = self.inner.lock();
        let slot = inner
            .frames
            .get_mut(index)
            .ok_or(SysError::OutOfRange)?;
        if slot.is_some() {
            return Err(SysError::PagePresent);
        }
        *slot = Some(frame);

        let woken = inner
            .waiters
            .remove(&index)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|w| w.upgrade())
            .collect();
        Ok(woken)
    }

    /// Drop a dead task from every waiter list (kill-time cancellation).
    pub fn remove_waiter(&self, task_id: u64) {
        let mut inner = self.inner.lock();
        for (_, waiters) in inner.waiters.iter_mut() {
            waiters.retain(|w| match w.upgrade() {
                Some(t) => t.id != task_id,
                None => false,
            });
        }
        inner.waiters.retain(|_, w| !w.is_empty());
    }
}

/// Drop a dying task from the waiter lists of every live object.
pub fn cancel_waits_of(task_id: u64) {
    let objects: alloc::vec::Vec<Arc<MemObject>> = OBJECTS
        .lock()
        .values()
        .filter_map(Weak::upgrade)
        .collect();
    for object in objects {
        object.remove_waiter(task_id);
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        OBJECTS.lock().remove(&self.id);
        let inner = self.inner.get_mut();
        for frame in inner.frames.iter().flatten() {
            // Safety: refcount reached zero, no mapping can reference the
            // object's frames anymore (regions hold the object alive).
            unsafe { dealloc_frame(*frame) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support;

    #[test]
    fn ids_are_unique_and_registered() {
        test_support::init_test_frames();
        let a = MemObject::create(12, 4, None);
        let b = MemObject::create(12, 4, None);
        assert_ne!(a.id(), b.id());
        assert!(Arc::ptr_eq(&MemObject::get(a.id()).unwrap(), &a));
    }

    #[test]
    fn zero_fill_materializes_once() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let obj = MemObject::create(12, 2, None);
        assert!(obj.frame_at(0).is_none());

        let first = match obj.request_frame(0).unwrap() {
            FrameRequest::Ready(f) => f,
            FrameRequest::NeedsPager => panic!("no pager configured"),
        };
        // A second fault on the same page sees the same frame.
        let second = match obj.request_frame(0).unwrap() {
            FrameRequest::Ready(f) => f,
            FrameRequest::NeedsPager => panic!("no pager configured"),
        };
        assert_eq!(first, second);
        assert_eq!(obj.frame_at(0), Some(first));
        assert!(obj.frame_at(1).is_none());
    }

    #[test]
    fn out_of_range_page() {
        test_support::init_test_frames();
        let obj = MemObject::create(12, 1, None);
        assert!(matches!(
            obj.request_frame(5),
            Err(SysError::OutOfRange)
        ));
    }

    #[test]
    fn provide_rejects_present_page() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let obj = MemObject::create(12, 1, None);
        let frame = crate::memory::alloc_frame().unwrap();
        obj.provide_frame(0, frame).unwrap();
        let other = crate::memory::alloc_frame().unwrap();
        assert!(matches!(
            obj.provide_frame(0, other),
            Err(SysError::PagePresent)
        ));
    }

    #[test]
    fn frees_frames_on_drop() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let before = crate::memory::free_frames();
        {
            let obj = MemObject::create(12, 3, None);
            for i in 0..3 {
                let _ = obj.request_frame(i).unwrap();
            }
            assert_eq!(crate::memory::free_frames(), before - 3);
        }
        assert_eq!(crate::memory::free_frames(), before);
    }
}

//! Intrusive task queues
//!
//! Ready queues link task descriptors directly so that removing a known
//! task is O(1): each task embeds a `QueueNode` holding its neighbor
//! pointers and the token of the queue it currently sits in. The pointer
//! fiddling is confined to this module behind a safe queue API.
//!
//! # Safety protocol
//!
//! A node's links are only touched by methods of the `TaskQueue` whose
//! token matches `node.parent` (or by the queue inserting a free node),
//! and every `TaskQueue` lives inside a lock its owner holds across calls.
//! Scheduler state transitions guarantee a task is pushed into at most one
//! queue at a time, so distinct queues never race on one node.

use crate::objects::task::Task;
use alloc::sync::{Arc, Weak};
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Neighbor links embedded in every task.
struct Links {
    next: Option<Arc<Task>>,
    prev: Option<Weak<Task>>,
    /// Token of the owning queue; 0 when the task is in no queue.
    parent: usize,
}

/// Per-task queue membership node.
pub struct QueueNode {
    inner: UnsafeCell<Links>,
}

// Access is serialized by the owning queue's enclosing lock (see the
// module-level safety protocol).
unsafe impl Send for QueueNode {}
unsafe impl Sync for QueueNode {}

impl QueueNode {
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(Links {
                next: None,
                prev: None,
                parent: 0,
            }),
        }
    }
}

static NEXT_QUEUE_TOKEN: AtomicUsize = AtomicUsize::new(1);

/// FIFO of tasks with O(1) push, pop and erase of a known member.
pub struct TaskQueue {
    token: usize,
    head: Option<Arc<Task>>,
    tail: Option<Weak<Task>>,
    len: usize,
}

#[allow(clippy::mut_from_ref)]
unsafe fn links(task: &Task) -> &mut Links {
    &mut *task.qnode.inner.get()
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            token: NEXT_QUEUE_TOKEN.fetch_add(1, Ordering::Relaxed),
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether `task` is currently a member of this queue.
    pub fn contains(&self, task: &Task) -> bool {
        // Safety: read of `parent` under the owner's lock.
        unsafe { links(task).parent == self.token }
    }

    /// Append a task. The task must not be in any queue.
    pub fn push_back(&mut self, task: Arc<Task>) {
        let old_tail = self.tail.take().and_then(|w| w.upgrade());

        // Safety: the scheduler guarantees the node is free, making this
        // queue its owner.
        unsafe {
            let node = links(&task);
            debug_assert_eq!(node.parent, 0, "task already queued");
            node.parent = self.token;
            node.next = None;
            node.prev = old_tail.as_ref().map(Arc::downgrade);
        }

        self.tail = Some(Arc::downgrade(&task));
        match old_tail {
            // Safety: the old tail still belongs to this queue.
            Some(t) => unsafe { links(&t).next = Some(task) },
            None => self.head = Some(task),
        }
        self.len += 1;
    }

    /// Remove and return the head.
    pub fn pop_front(&mut self) -> Option<Arc<Task>> {
        let head = self.head.take()?;
        // Safety: this queue owns the node.
        unsafe {
            let node = links(&head);
            node.parent = 0;
            node.prev = None;
            match node.next.take() {
                Some(next) => {
                    links(&next).prev = None;
                    self.head = Some(next);
                }
                None => self.tail = None,
            }
        }
        self.len -= 1;
        Some(head)
    }

    /// Remove and return the tail (used by work stealing).
    pub fn pop_back(&mut self) -> Option<Arc<Task>> {
        let tail = self.tail.take().and_then(|w| w.upgrade())?;
        self.erase(&tail);
        Some(tail)
    }

    /// Remove a known member. Returns false if the task is not in this
    /// queue (its parent token does not match).
    pub fn erase(&mut self, task: &Arc<Task>) -> bool {
        // Safety: membership is checked before any link is touched.
        unsafe {
            let node = links(task);
            if node.parent != self.token {
                return false;
            }

            let prev = node.prev.take().and_then(|w| w.upgrade());
            let next = node.next.take();
            node.parent = 0;

            match (&prev, &next) {
                (Some(p), _) => links(p).next = next.clone(),
                (None, _) => self.head = next.clone(),
            }
            match next {
                Some(n) => links(&n).prev = prev.map(|p| Arc::downgrade(&p)),
                None => self.tail = prev.map(|p| Arc::downgrade(&p)),
            }
        }
        self.len -= 1;
        true
    }

}

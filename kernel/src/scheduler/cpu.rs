//! Per-CPU scheduler state
//!
//! Each CPU owns sixteen FIFO ready queues (one per priority level, lower
//! number = higher priority), an idle task and a current-task slot. The
//! queue set sits behind one lock; the current slot behind another.

use crate::config::{SCHED_PINNED_MAX, SCHED_PRIORITY_LEVELS};
use crate::objects::task::Task;
use crate::scheduler::queue::TaskQueue;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// The per-priority ready queues of one CPU.
pub struct ReadyQueues {
    levels: Vec<TaskQueue>,
}

impl ReadyQueues {
    pub fn new() -> Self {
        let mut levels = Vec::with_capacity(SCHED_PRIORITY_LEVELS);
        for _ in 0..SCHED_PRIORITY_LEVELS {
            levels.push(TaskQueue::new());
        }
        Self { levels }
    }

    /// Append a task at its priority level.
    pub fn push(&mut self, task: Arc<Task>, priority: u8) {
        self.levels[priority as usize].push_back(task);
    }

    /// Pop the head of the highest-priority non-empty queue.
    pub fn pop_highest(&mut self) -> Option<Arc<Task>> {
        for queue in self.levels.iter_mut() {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
        }
        None
    }

    /// Highest priority that has a runnable task.
    pub fn highest_ready(&self) -> Option<u8> {
        self.levels
            .iter()
            .position(|q| !q.is_empty())
            .map(|p| p as u8)
    }

    /// Erase a known task; tries its recorded priority first, then scans.
    pub fn erase(&mut self, task: &Arc<Task>, priority_hint: u8) -> bool {
        if self.levels[priority_hint as usize].erase(task) {
            return true;
        }
        self.levels.iter_mut().any(|q| q.erase(task))
    }

    /// Steal the tail of the lowest-priority non-empty queue, skipping
    /// pinned priorities and tasks whose affinity excludes `for_cpu`.
    pub fn steal_for(&mut self, for_cpu: u32) -> Option<Arc<Task>> {
        for priority in (0..SCHED_PRIORITY_LEVELS as u8).rev() {
            if priority <= SCHED_PINNED_MAX {
                break;
            }
            let queue = &mut self.levels[priority as usize];
            if queue.is_empty() {
                continue;
            }
            if let Some(task) = queue.pop_back() {
                let allowed = {
                    let sched = task.sched.lock();
                    sched.affinity == 0 || sched.affinity & (1 << for_cpu) != 0
                };
                if allowed {
                    return Some(task);
                }
                // Affinity forbids the move; put it back where it was.
                queue.push_back(task);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(|q| q.is_empty())
    }

    pub fn total_len(&self) -> usize {
        self.levels.iter().map(|q| q.len()).sum()
    }
}

/// Scheduler state of one CPU.
pub struct CpuSched {
    /// CPU index (position in the CPU vector).
    pub index: u32,
    /// Local APIC id of this CPU.
    pub lapic_id: u32,
    /// Ready queues.
    pub queues: Mutex<ReadyQueues>,
    /// The idle task; runs when every queue is empty.
    pub idle: Arc<Task>,
    /// Task currently executing on this CPU.
    current: Mutex<Arc<Task>>,
    /// A higher-priority task arrived; reschedule on the next exit.
    need_resched: AtomicBool,
}

impl CpuSched {
    pub fn new(index: u32, lapic_id: u32) -> Arc<Self> {
        let idle = Task::create_idle(index);
        Arc::new(Self {
            index,
            lapic_id,
            queues: Mutex::new(ReadyQueues::new()),
            current: Mutex::new(idle.clone()),
            idle,
            need_resched: AtomicBool::new(false),
        })
    }

    pub fn current(&self) -> Arc<Task> {
        self.current.lock().clone()
    }

    pub fn set_current(&self, task: Arc<Task>) {
        *self.current.lock() = task;
    }

    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    /// Take the pending-reschedule flag.
    pub fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_respect_priority_order() {
        let mut queues = ReadyQueues::new();
        let low = Task::create_for_tests();
        let high = Task::create_for_tests();
        queues.push(low.clone(), 12);
        queues.push(high.clone(), 3);

        assert_eq!(queues.highest_ready(), Some(3));
        assert_eq!(queues.pop_highest().unwrap().id, high.id);
        assert_eq!(queues.pop_highest().unwrap().id, low.id);
        assert!(queues.pop_highest().is_none());
    }

    #[test]
    fn steal_prefers_lowest_priority_tail() {
        let mut queues = ReadyQueues::new();
        let mid_a = Task::create_for_tests();
        let mid_b = Task::create_for_tests();
        let low = Task::create_for_tests();
        queues.push(mid_a.clone(), 8);
        queues.push(mid_b.clone(), 8);
        queues.push(low.clone(), 14);

        // Lowest-priority queue loses its tail first.
        assert_eq!(queues.steal_for(1).unwrap().id, low.id);
        // Then the tail of the next queue up.
        assert_eq!(queues.steal_for(1).unwrap().id, mid_b.id);
    }

    #[test]
    fn steal_skips_pinned_priorities() {
        let mut queues = ReadyQueues::new();
        let pinned = Task::create_for_tests();
        pinned.sched.lock().priority = 0;
        queues.push(pinned.clone(), 0);

        assert!(queues.steal_for(1).is_none());
        assert_eq!(queues.total_len(), 1);
    }

    #[test]
    fn steal_respects_affinity() {
        let mut queues = ReadyQueues::new();
        let bound = Task::create_for_tests();
        bound.sched.lock().affinity = 0b0001; // CPU 0 only
        queues.push(bound.clone(), 8);

        assert!(queues.steal_for(1).is_none());
        // The task stayed queued.
        assert_eq!(queues.total_len(), 1);
        assert!(queues.steal_for(0).is_some());
    }

    #[test]
    fn erase_with_stale_hint_still_finds_task() {
        let mut queues = ReadyQueues::new();
        let t = Task::create_for_tests();
        queues.push(t.clone(), 5);
        assert!(queues.erase(&t, 9));
        assert!(queues.is_empty());
    }
}

//! Scheduler
//!
//! Fixed-priority preemptive scheduling with round-robin inside each
//! level. Every CPU has sixteen FIFO ready queues; the timer preempts the
//! running task when its per-priority quantum expires, and a task waking
//! at a higher priority than whatever is running preempts immediately
//! (locally via the need-resched flag, remotely via a reschedule IPI).
//!
//! Priorities 0..=2 are pinned: never migrated by load balancing. Other
//! levels are eligible for work stealing when a CPU runs dry: the idle
//! CPU scans its peers and steals the tail of the lowest-priority
//! non-empty queue, subject to the task's affinity mask.
//!
//! Context switches happen on the trap frame: the exiting task's
//! registers are copied into its descriptor, the incoming task's
//! registers replace the frame, and the trap return path resumes the new
//! task.

pub mod cpu;
pub mod queue;

use crate::arch;
use crate::arch::x86_64::context::TrapFrame;
use crate::config::{QUANTUM_MS, SCHED_PRIORITY_LEVELS};
use crate::objects::task::{Task, TaskStatus, WaitRef};
use crate::KernResult;
use alloc::sync::Arc;
use alloc::vec::Vec;
use cpu::CpuSched;
use spin::Once;
use thallium_abi::SysError;

/// All CPUs, indexed by CPU number.
static CPUS: Once<Vec<Arc<CpuSched>>> = Once::new();

/// Initialize per-CPU scheduler state.
///
/// Must run once during boot, after the memory subsystem, before the
/// first task is enqueued. `lapic_ids[i]` is the APIC id of CPU `i`.
pub fn init(lapic_ids: &[u32]) {
    CPUS.call_once(|| {
        lapic_ids
            .iter()
            .enumerate()
            .map(|(i, &lapic)| CpuSched::new(i as u32, lapic))
            .collect()
    });
}

fn cpus() -> &'static [Arc<CpuSched>] {
    CPUS.get().map(|v| v.as_slice()).unwrap_or(&[])
}

/// Scheduler state of a CPU by index.
pub fn cpu(index: u32) -> Option<&'static Arc<CpuSched>> {
    cpus().get(index as usize)
}

/// Scheduler state of the executing CPU.
pub fn this_cpu() -> Option<&'static Arc<CpuSched>> {
    cpu(arch::cpu_index())
}

/// The task currently running on this CPU.
pub fn current_task() -> Option<Arc<Task>> {
    this_cpu().map(|c| c.current())
}

/// Make a Ready task runnable on a CPU its affinity allows.
///
/// If the task outranks what that CPU is running, a reschedule is
/// requested (flag locally, IPI remotely).
pub fn enqueue(task: &Arc<Task>) {
    let Some(cpus) = CPUS.get() else {
        // Early boot: tasks created before scheduler init are picked up
        // when the first reschedule runs.
        return;
    };

    let (priority, target) = {
        let mut sched = task.sched.lock();
        if sched.status == TaskStatus::Dead {
            return;
        }
        sched.status = TaskStatus::Ready;
        let preferred = sched.cpu;
        let affinity = sched.affinity;
        let target = pick_cpu(cpus, preferred, affinity);
        sched.cpu = target;
        (sched.priority, target)
    };

    let cpu = &cpus[target as usize];
    cpu.queues.lock().push(task.clone(), priority);

    // Priority respect: a strictly higher-priority arrival preempts.
    let running_priority = {
        let current = cpu.current();
        let sched = current.sched.lock();
        if current.kind == crate::objects::task::TaskKind::Idle {
            u8::MAX
        } else {
            sched.priority
        }
    };
    if priority < running_priority {
        if target == arch::cpu_index() {
            cpu.request_resched();
        } else {
            arch::send_reschedule_ipi(cpu.lapic_id);
        }
    }
}

fn pick_cpu(cpus: &[Arc<CpuSched>], preferred: u32, affinity: u64) -> u32 {
    let allowed = |i: u32| affinity == 0 || affinity & (1u64 << i) != 0;
    if (preferred as usize) < cpus.len() && allowed(preferred) {
        return preferred;
    }
    for i in 0..cpus.len() as u32 {
        if allowed(i) {
            return i;
        }
    }
    preferred.min(cpus.len().saturating_sub(1) as u32)
}

/// Wake a blocked task: clear its wait registration and enqueue it.
///
/// A wake that races a task still on its way into a block (the wait
/// condition cleared between the check and the park) is remembered as a
/// pending wake the block attempt then consumes.
pub fn wake(task: &Arc<Task>) {
    {
        let mut sched = task.sched.lock();
        if sched.status != TaskStatus::Blocked {
            if sched.status == TaskStatus::Running {
                sched.wake_pending = true;
            }
            return;
        }
        sched.blocked_by = WaitRef::None;
        sched.page_blocked_addr = 0;
        sched.status = TaskStatus::Ready;
    }
    enqueue(task);
}

/// Remove a Ready task from its queue (kill or priority move).
pub fn remove_ready(task: &Arc<Task>) {
    let Some(cpus) = CPUS.get() else { return };
    let (cpu_idx, priority) = {
        let sched = task.sched.lock();
        (sched.cpu, sched.priority)
    };
    if let Some(cpu) = cpus.get(cpu_idx as usize) {
        if cpu.queues.lock().erase(task, priority) {
            return;
        }
    }
    // Stale CPU hint (stolen since): scan everyone.
    for cpu in cpus {
        if cpu.queues.lock().erase(task, priority) {
            return;
        }
    }
}

/// Chase a task Running on some CPU with a reschedule.
pub fn kick_cpu_of(task: &Arc<Task>) {
    let Some(cpus) = CPUS.get() else { return };
    let cpu_idx = task.sched.lock().cpu;
    if let Some(cpu) = cpus.get(cpu_idx as usize) {
        if cpu_idx == arch::cpu_index() {
            cpu.request_resched();
        } else {
            arch::send_reschedule_ipi(cpu.lapic_id);
        }
    }
}

/// Block the current task on `wait` and switch away.
///
/// Returns `false` without parking when a wake already raced in (the
/// wait condition cleared between the caller's check and this call); the
/// caller retries its condition. The caller has already recorded any
/// repeat-syscall request; the saved program counter is rewound here so
/// the syscall re-executes on wake.
pub fn block_current(frame: &mut TrapFrame, wait: WaitRef) -> bool {
    let Some(cpu) = this_cpu() else { return false };
    let current = cpu.current();

    {
        let mut sched = current.sched.lock();
        if sched.wake_pending {
            sched.wake_pending = false;
            return false;
        }
        sched.status = TaskStatus::Blocked;
        sched.blocked_by = wait;
    }

    {
        let mut regs = current.regs.lock();
        *regs = *frame;
        if current.pop_repeat_syscall() {
            regs.rewind_syscall();
        }
    }
    arch::fpu_save(&current);
    arch::x86_64::segments_save(&current);

    let next = pick_next(cpu);
    dispatch(cpu, frame, next);
    true
}

/// Round-robin reschedule: the current task goes to the tail of its
/// queue and the best ready task takes the CPU.
pub fn reschedule(frame: &mut TrapFrame) {
    let Some(cpu) = this_cpu() else { return };
    let current = cpu.current();

    let requeue = {
        let sched = current.sched.lock();
        sched.status == TaskStatus::Running
    } && current.kind != crate::objects::task::TaskKind::Idle;

    if requeue {
        {
            let mut regs = current.regs.lock();
            *regs = *frame;
        }
        arch::fpu_save(&current);
        arch::x86_64::segments_save(&current);
        current.sched.lock().status = TaskStatus::Ready;
        enqueue(&current);
    } else {
        let mut regs = current.regs.lock();
        *regs = *frame;
    }

    let next = pick_next(cpu);
    dispatch(cpu, frame, next);
}

/// Timer expiry: quantum used up, rotate the current priority level.
pub fn timer_tick(frame: &mut TrapFrame) {
    reschedule(frame);
}

/// Reschedule only if a higher-priority wakeup requested it.
pub fn maybe_reschedule(frame: &mut TrapFrame) {
    if let Some(cpu) = this_cpu() {
        if cpu.take_resched() {
            reschedule(frame);
        }
    }
}

/// Change a task's priority, requeueing and preempting as needed.
pub fn set_priority(task: &Arc<Task>, priority: u64) -> KernResult<()> {
    if priority >= SCHED_PRIORITY_LEVELS as u64 {
        return Err(SysError::NotSupported);
    }
    let priority = priority as u8;

    let was_ready = {
        let mut sched = task.sched.lock();
        if sched.priority == priority {
            return Ok(());
        }
        let was_ready = sched.status == TaskStatus::Ready;
        if !was_ready {
            sched.priority = priority;
        }
        was_ready
    };

    if was_ready {
        remove_ready(task);
        task.sched.lock().priority = priority;
        enqueue(task);
    } else if task.sched.lock().status == TaskStatus::Running {
        // A demoted runner yields to anything now ranked above it.
        kick_cpu_of(task);
    }
    Ok(())
}

/// Pick the next task: own queues first, then steal, then idle.
fn pick_next(cpu: &Arc<CpuSched>) -> Arc<Task> {
    if let Some(task) = cpu.queues.lock().pop_highest() {
        return task;
    }
    if let Some(stolen) = steal(cpu) {
        return stolen;
    }
    cpu.idle.clone()
}

/// Scan peers for work this CPU may take.
fn steal(thief: &Arc<CpuSched>) -> Option<Arc<Task>> {
    for peer in cpus() {
        if peer.index == thief.index {
            continue;
        }
        if let Some(task) = peer.queues.lock().steal_for(thief.index) {
            task.sched.lock().cpu = thief.index;
            return Some(task);
        }
    }
    None
}

/// Install `next` on the CPU and load its context into the trap frame.
fn dispatch(cpu: &Arc<CpuSched>, frame: &mut TrapFrame, next: Arc<Task>) {
    {
        let mut sched = next.sched.lock();
        sched.status = if next.kind == crate::objects::task::TaskKind::Idle {
            TaskStatus::Special
        } else {
            TaskStatus::Running
        };
        sched.cpu = cpu.index;
    }

    *frame = *next.regs.lock();
    arch::switch_address_space(&next);
    arch::fpu_restore(&next);
    arch::x86_64::segments_restore(&next);

    let quantum = QUANTUM_MS[next.sched.lock().priority as usize];
    arch::arm_preemption_timer(quantum);

    cpu.set_current(next);
}

#[cfg(test)]
pub fn init_for_tests(n: u32) {
    let ids: Vec<u32> = (0..n).collect();
    init(&ids);
}

/// The CPU set is shared process-wide; tests that enqueue take turns.
#[cfg(test)]
pub(crate) static TEST_QUEUE_LOCK: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;


    fn ready_task(priority: u8) -> Arc<Task> {
        let t = Task::create_for_tests();
        t.sched.lock().priority = priority;
        t
    }

    #[test]
    fn scheduling_end_to_end() {
        let _serial = TEST_QUEUE_LOCK.lock();
        // One shared CPU set for all scheduler tests; they cooperate by
        // draining what they enqueue.
        init_for_tests(2);
        let cpu0 = cpu(0).unwrap();

        // Pick order respects priority, then FIFO within a level.
        let a = ready_task(5);
        let b = ready_task(5);
        let c = ready_task(2);
        for t in [&a, &b, &c] {
            t.sched.lock().affinity = 0b01;
            enqueue(t);
        }

        let first = pick_next(cpu0);
        let second = pick_next(cpu0);
        let third = pick_next(cpu0);
        assert_eq!(first.id, c.id);
        assert_eq!(second.id, a.id);
        assert_eq!(third.id, b.id);

        // Exhausted queues fall back to idle.
        let idle = pick_next(cpu0);
        assert_eq!(idle.id, cpu0.idle.id);

        // Ready-state bookkeeping held while queued.
        let d = ready_task(7);
        d.sched.lock().affinity = 0b01;
        enqueue(&d);
        assert_eq!(d.status(), TaskStatus::Ready);
        assert!(cpu0.queues.lock().erase(&d, 7));
    }

    #[test]
    fn block_and_wake_roundtrip() {
        let _serial = TEST_QUEUE_LOCK.lock();
        init_for_tests(2);
        let cpu0 = cpu(0).unwrap();

        let t = ready_task(4);
        t.sched.lock().affinity = 0b01;

        // Make it current, as if dispatched.
        t.sched.lock().status = TaskStatus::Running;
        cpu0.set_current(t.clone());

        let mut frame = TrapFrame::new();
        frame.rip = 0x401002;
        t.request_repeat_syscall();
        block_current(&mut frame, WaitRef::None);

        assert_eq!(t.status(), TaskStatus::Blocked);
        // The saved program counter was rewound over the int instruction.
        assert_eq!(t.regs.lock().rip, 0x401000);
        // The CPU fell back to idle.
        assert_eq!(cpu0.current().id, cpu0.idle.id);

        wake(&t);
        assert_eq!(t.status(), TaskStatus::Ready);
        // Waking a non-blocked task is a no-op.
        wake(&t);
        assert_eq!(t.status(), TaskStatus::Ready);

        // Drain.
        assert!(cpu0.queues.lock().erase(&t, 4));
    }

    #[test]
    fn set_priority_is_idempotent() {
        let _serial = TEST_QUEUE_LOCK.lock();
        init_for_tests(2);
        let t = ready_task(6);
        t.sched.lock().affinity = 0b01;
        enqueue(&t);

        set_priority(&t, 6).unwrap();
        set_priority(&t, 6).unwrap();
        assert_eq!(t.sched.lock().priority, 6);
        assert_eq!(t.status(), TaskStatus::Ready);

        set_priority(&t, 3).unwrap();
        assert_eq!(t.sched.lock().priority, 3);
        // Still exactly one queue entry, at the new level.
        let cpu0 = cpu(0).unwrap();
        assert!(cpu0.queues.lock().erase(&t, 3));
        assert!(!cpu0.queues.lock().erase(&t, 6));

        assert!(matches!(
            set_priority(&t, SCHED_PRIORITY_LEVELS as u64),
            Err(SysError::NotSupported)
        ));
    }

    #[test]
    fn work_stealing_across_cpus() {
        let _serial = TEST_QUEUE_LOCK.lock();
        init_for_tests(2);
        let cpu1 = cpu(1).unwrap();

        let t = ready_task(9);
        t.sched.lock().affinity = 0b01; // CPU 0 only
        enqueue(&t);

        // CPU 1 may not steal it (affinity).
        assert!(steal(cpu1).is_none());

        let free = ready_task(9);
        free.sched.lock().cpu = 0;
        enqueue(&free);
        // The unbound task can be stolen and migrates.
        let stolen = steal(cpu1).unwrap();
        assert_eq!(stolen.id, free.id);
        assert_eq!(stolen.sched.lock().cpu, 1);

        // Drain.
        let cpu0 = cpu(0).unwrap();
        assert!(cpu0.queues.lock().erase(&t, 9));
    }
}

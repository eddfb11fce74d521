//! Task descriptors
//!
//! A task is the unit of scheduling. It may share its address space with
//! other tasks (threads) or own one outright. The descriptor carries the
//! saved register file, scheduling state, the attached address space, the
//! ports it owns and its task-group memberships.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninit → Ready → Running ⇄ Blocked
//!                     ↓
//!                    Dead
//! ```
//!
//! Tasks are created in `Uninit`, configured (page table, entry point,
//! stack), then `init` makes them `Ready`. Death releases every owned
//! port, detaches the address space and fires group notifications.
//!
//! The global task table holds the owning reference; queues and per-CPU
//! current slots hold additional strong references while they need the
//! descriptor.

use crate::arch::x86_64::context::{FpuState, TrapFrame};
use crate::config::DEFAULT_PRIORITY;
use crate::memory::page_table::AddressSpace;
use crate::objects::named_port::NamedPortDesc;
use crate::objects::port::Port;
use crate::objects::task_group::TaskGroup;
use crate::scheduler::queue::QueueNode;
use crate::KernResult;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;
use thallium_abi::{PortId, SysError, TaskGroupId, TaskId};

/// Global task table. Holds the owning reference to every live task;
/// killing a task removes it here.
static TASKS: Mutex<BTreeMap<TaskId, Arc<Task>>> = Mutex::new(BTreeMap::new());

/// Task ids are monotonically increasing and never reused within a boot.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not yet initialized; configuration calls are allowed.
    Uninit,
    /// In a ready queue, waiting for a CPU.
    Ready,
    /// Executing on a CPU.
    Running,
    /// Waiting on a port, a named port or an absent page.
    Blocked,
    /// Killed; the descriptor lingers until the last reference drops.
    Dead,
    /// Idle and other per-CPU service tasks; never enters ready queues.
    Special,
}

/// What kind of task this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Normal,
    System,
    Idle,
}

/// What a blocked task is waiting on. The references are weak: a wait
/// must never keep its wait source alive.
#[derive(Clone)]
pub enum WaitRef {
    None,
    Port(Weak<Port>),
    NamedPort(Weak<NamedPortDesc>),
}

impl WaitRef {
    /// Does this wait reference the given port?
    pub fn is_port(&self, port: &Arc<Port>) -> bool {
        match self {
            WaitRef::Port(w) => w.upgrade().is_some_and(|p| Arc::ptr_eq(&p, port)),
            _ => false,
        }
    }

    /// Does this wait reference the given named-port descriptor?
    pub fn is_named_port(&self, desc: &Arc<NamedPortDesc>) -> bool {
        match self {
            WaitRef::NamedPort(w) => w.upgrade().is_some_and(|d| Arc::ptr_eq(&d, desc)),
            _ => false,
        }
    }

    /// The port, when blocked on one. Used as the receive-path hint.
    pub fn as_port(&self) -> Option<Arc<Port>> {
        match self {
            WaitRef::Port(w) => w.upgrade(),
            _ => None,
        }
    }
}

/// Scheduling state, guarded by the task's sched lock.
pub struct SchedState {
    pub status: TaskStatus,
    pub priority: u8,
    /// CPU affinity bitmask; 0 means any CPU.
    pub affinity: u64,
    /// CPU index while Running, last CPU otherwise.
    pub cpu: u32,
    /// What the task is blocked on while `status == Blocked`.
    pub blocked_by: WaitRef,
    /// Page address the task is blocked on, 0 when none.
    pub page_blocked_addr: u64,
    /// A wake arrived while the task was still Running (between deciding
    /// to block and parking); the next block attempt consumes it and
    /// does not park.
    pub wake_pending: bool,
}

/// Mutable task attributes settable via `set-attribute`.
#[derive(Default)]
pub struct TaskAttrs {
    pub debug_syscalls: bool,
    pub allow_port_io: bool,
}

/// Saved FS/GS segment bases, switched with the task.
#[derive(Default)]
pub struct SegBases {
    pub fs: u64,
    pub gs: u64,
}

/// A task descriptor.
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Privilege ring the task executes in (0 or 3).
    pub ring: u8,

    /// Saved register file; valid while the task is not Running.
    pub regs: Mutex<TrapFrame>,
    /// Saved SSE/x87 state.
    pub fpu: Mutex<FpuState>,
    /// Saved FS/GS bases.
    pub segs: Mutex<SegBases>,

    /// Scheduling state.
    pub sched: Mutex<SchedState>,
    /// Ready-queue membership node (see `scheduler::queue`).
    pub(crate) qnode: QueueNode,

    /// Attached address space, `None` until `asign-page-table`.
    pub space: Mutex<Option<Arc<AddressSpace>>>,

    /// Ports owned (receivable) by this task.
    pub owned_ports: Mutex<BTreeMap<PortId, Weak<Port>>>,

    /// Groups this task belongs to.
    pub groups: Mutex<BTreeMap<TaskGroupId, Arc<TaskGroup>>>,

    pub attrs: Mutex<TaskAttrs>,
    pub name: Mutex<String>,

    /// `(hi, lo)` exit codes recorded by `exit`.
    pub exit_code: Mutex<(u64, u64)>,

    /// Set when a blocked syscall must re-execute on resume.
    repeat_syscall: AtomicBool,
}

impl Task {
    fn new(kind: TaskKind, ring: u8) -> Arc<Task> {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst);
        Arc::new(Task {
            id,
            kind,
            ring,
            regs: Mutex::new(TrapFrame::new()),
            fpu: Mutex::new(FpuState::new()),
            segs: Mutex::new(SegBases::default()),
            sched: Mutex::new(SchedState {
                status: TaskStatus::Uninit,
                priority: DEFAULT_PRIORITY,
                affinity: 0,
                cpu: 0,
                blocked_by: WaitRef::None,
                page_blocked_addr: 0,
                wake_pending: false,
            }),
            qnode: QueueNode::new(),
            space: Mutex::new(None),
            owned_ports: Mutex::new(BTreeMap::new()),
            groups: Mutex::new(BTreeMap::new()),
            attrs: Mutex::new(TaskAttrs::default()),
            name: Mutex::new(String::new()),
            exit_code: Mutex::new((0, 0)),
            repeat_syscall: AtomicBool::new(false),
        })
    }

    /// Create an empty task in the Uninit state and register it.
    pub fn create(ring: u8) -> KernResult<Arc<Task>> {
        if ring != 0 && ring != 3 {
            return Err(SysError::NotSupported);
        }
        let kind = if ring == 0 {
            TaskKind::System
        } else {
            TaskKind::Normal
        };
        let task = Task::new(kind, ring);
        {
            let mut regs = task.regs.lock();
            let (cs, ss) = crate::arch::x86_64::gdt::selectors_for_ring(ring);
            regs.cs = cs as u64;
            regs.ss = ss as u64;
        }
        TASKS.lock().insert(task.id, task.clone());
        Ok(task)
    }

    /// Create a per-CPU idle task. Not registered in the task table and
    /// never enters a ready queue.
    pub fn create_idle(cpu: u32) -> Arc<Task> {
        let task = Task::new(TaskKind::Idle, 0);
        {
            let mut sched = task.sched.lock();
            sched.status = TaskStatus::Special;
            sched.cpu = cpu;
            sched.priority = (crate::config::SCHED_PRIORITY_LEVELS - 1) as u8;
        }
        *task.name.lock() = String::from("idle");
        task
    }

    /// Look up a live task by id.
    pub fn get(id: TaskId) -> KernResult<Arc<Task>> {
        TASKS.lock().get(&id).cloned().ok_or(SysError::NoSuchProcess)
    }

    /// Resolve the `TASK_ID_SELF` convention against the current task.
    pub fn get_or_self(id: TaskId, current: &Arc<Task>) -> KernResult<Arc<Task>> {
        if id == thallium_abi::TASK_ID_SELF || id == current.id {
            Ok(current.clone())
        } else {
            Task::get(id)
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.sched.lock().status
    }

    pub fn is_uninit(&self) -> bool {
        self.status() == TaskStatus::Uninit
    }

    /// The task's attached address space, or the error syscalls report.
    pub fn space(&self) -> KernResult<Arc<AddressSpace>> {
        self.space.lock().clone().ok_or(SysError::HasNoPageTable)
    }

    /// Attach an address space. Only legal while Uninit; a task never
    /// changes address space after it started.
    pub fn attach_space(self: &Arc<Self>, space: Arc<AddressSpace>) -> KernResult<()> {
        if !self.is_uninit() {
            return Err(SysError::ProcessInited);
        }
        let mut slot = self.space.lock();
        if slot.is_some() {
            return Err(SysError::ProcessInited);
        }
        space.attach_task(self);
        *slot = Some(space);
        Ok(())
    }

    /// Set the program counter of an Uninit task.
    pub fn set_entry_point(&self, pc: u64) {
        self.regs.lock().rip = pc;
    }

    /// Record ownership of a port.
    pub fn add_owned_port(&self, port: &Arc<Port>) {
        self.owned_ports
            .lock()
            .insert(port.id(), Arc::downgrade(port));
    }

    /// Forget a port (port destroyed while the owner lives).
    pub fn remove_owned_port(&self, port: PortId) {
        self.owned_ports.lock().remove(&port);
    }

    pub fn request_repeat_syscall(&self) {
        self.repeat_syscall.store(true, Ordering::Release);
    }

    /// Take the repeat flag, returning whether it was set.
    pub fn pop_repeat_syscall(&self) -> bool {
        self.repeat_syscall.swap(false, Ordering::AcqRel)
    }

    pub fn repeat_syscall_pending(&self) -> bool {
        self.repeat_syscall.load(Ordering::Acquire)
    }

    pub fn set_page_blocked(&self, page: u64) {
        self.sched.lock().page_blocked_addr = page;
    }

    /// Kill the task: drop it from the table and every queue and wait
    /// set, release owned ports, detach the address space and notify
    /// groups. Safe to call twice; the second call is a no-op.
    ///
    /// If the task is Running on another CPU a reschedule IPI chases it;
    /// if it is the caller the trap-return path performs the switch.
    pub fn kill(self: &Arc<Self>) {
        {
            let mut sched = self.sched.lock();
            if sched.status == TaskStatus::Dead {
                return;
            }
            let was = sched.status;
            sched.status = TaskStatus::Dead;
            sched.blocked_by = WaitRef::None;
            sched.page_blocked_addr = 0;
            drop(sched);

            match was {
                TaskStatus::Ready => crate::scheduler::remove_ready(self),
                TaskStatus::Running => crate::scheduler::kick_cpu_of(self),
                _ => {}
            }
        }

        TASKS.lock().remove(&self.id);

        // Owned ports die with their owner.
        let ports: Vec<Weak<Port>> = {
            let mut owned = self.owned_ports.lock();
            let v = owned.values().cloned().collect();
            owned.clear();
            v
        };
        for weak in ports {
            if let Some(port) = weak.upgrade() {
                Port::destroy(&port);
            }
        }

        // Leave every group, firing removal notifications.
        let groups: Vec<Arc<TaskGroup>> = self.groups.lock().values().cloned().collect();
        for group in groups {
            let _ = group.remove_task(self);
        }

        // Cancel a pending pager wait.
        crate::memory::mem_object::cancel_waits_of(self.id);

        if let Some(space) = self.space.lock().take() {
            space.detach_task(self.id);
        }
    }

    /// Test-only constructor: a bare Uninit task outside the global table.
    #[cfg(test)]
    pub fn create_for_tests() -> Arc<Task> {
        Task::new(TaskKind::Normal, 3)
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sched = self.sched.lock();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &sched.status)
            .field("priority", &sched.priority)
            .field("name", &*self.name.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_registers_and_kill_unregisters() {
        let t = Task::create(3).unwrap();
        assert_eq!(t.status(), TaskStatus::Uninit);
        assert!(Task::get(t.id).is_ok());

        t.kill();
        assert_eq!(t.status(), TaskStatus::Dead);
        assert!(matches!(Task::get(t.id), Err(SysError::NoSuchProcess)));

        // Killing twice is harmless.
        t.kill();
    }

    #[test]
    fn ids_are_monotonic() {
        let a = Task::create(3).unwrap();
        let b = Task::create(3).unwrap();
        assert!(b.id > a.id);
        a.kill();
        b.kill();
        let c = Task::create(3).unwrap();
        assert!(c.id > b.id, "ids are never reused");
        c.kill();
    }

    #[test]
    fn invalid_ring_rejected() {
        assert!(matches!(Task::create(1), Err(SysError::NotSupported)));
    }

    #[test]
    fn repeat_syscall_flag() {
        let t = Task::create_for_tests();
        assert!(!t.pop_repeat_syscall());
        t.request_repeat_syscall();
        assert!(t.repeat_syscall_pending());
        assert!(t.pop_repeat_syscall());
        assert!(!t.pop_repeat_syscall());
    }

    #[test]
    fn attach_space_only_while_uninit() {
        crate::memory::test_support::init_test_frames();
        let t = Task::create(3).unwrap();
        let space = AddressSpace::new().unwrap();
        t.attach_space(space.clone()).unwrap();
        assert!(matches!(
            t.attach_space(space.clone()),
            Err(SysError::ProcessInited)
        ));
        assert!(t.space().is_ok());
        t.kill();
    }
}

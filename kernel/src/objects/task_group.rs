//! Task groups
//!
//! A task group is a set of tasks with change notifications. Notifier
//! ports register against a group with an action mask; when a covered
//! event happens (task added, task removed, group destroyed) the kernel
//! posts a message to each registered port.
//!
//! Groups hold their member tasks weakly; tasks hold their groups
//! strongly, so a group lives while any member or external reference
//! keeps it. Destroying a port removes it from every group's notifier map
//! through the backlink kept on the port.

use crate::objects::port::Port;
use crate::objects::task::Task;
use crate::KernResult;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use thallium_abi::flags::GroupNotifierMask;
use thallium_abi::ipc::{
    as_bytes, KernelGroupDestroyed, KernelGroupTaskChanged, EVENT_GROUP_TASK_ADDED,
    EVENT_GROUP_TASK_REMOVED, KERNEL_MSG_GROUP_DESTROYED, KERNEL_MSG_GROUP_TASK_CHANGED,
};
use thallium_abi::{PortId, SysError, TaskGroupId, TaskId};

/// Global registry of live groups.
static GROUPS: Mutex<BTreeMap<TaskGroupId, Weak<TaskGroup>>> = Mutex::new(BTreeMap::new());

/// Group ids are monotonically increasing and never reused within a boot.
static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

struct NotifierPort {
    port: Weak<Port>,
    mask: GroupNotifierMask,
}

/// A multi-task set with port-based membership change notifications.
pub struct TaskGroup {
    id: TaskGroupId,
    tasks: Mutex<BTreeMap<TaskId, Weak<Task>>>,
    notifiers: Mutex<BTreeMap<PortId, NotifierPort>>,
}

impl TaskGroup {
    /// Create an empty group and register it globally.
    pub fn create() -> Arc<TaskGroup> {
        let id = NEXT_GROUP_ID.fetch_add(1, Ordering::SeqCst);
        let group = Arc::new(TaskGroup {
            id,
            tasks: Mutex::new(BTreeMap::new()),
            notifiers: Mutex::new(BTreeMap::new()),
        });
        GROUPS.lock().insert(id, Arc::downgrade(&group));
        group
    }

    /// Look up a live group by id.
    pub fn get(id: TaskGroupId) -> KernResult<Arc<TaskGroup>> {
        GROUPS
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .ok_or(SysError::PortDoesntExist)
    }

    pub fn id(&self) -> TaskGroupId {
        self.id
    }

    /// Whether the task with `id` is a member.
    pub fn has_task(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Add `task` to the group, firing on-add notifications.
    ///
    /// Fails with `NameExists` if the task is already a member.
    pub fn register_task(self: &Arc<Self>, task: &Arc<Task>) -> KernResult<()> {
        {
            let mut groups = task.groups.lock();
            if groups.contains_key(&self.id) {
                return Err(SysError::NameExists);
            }
            groups.insert(self.id, self.clone());
        }
        self.tasks.lock().insert(task.id, Arc::downgrade(task));

        let msg = KernelGroupTaskChanged {
            msg_type: KERNEL_MSG_GROUP_TASK_CHANGED,
            flags: 0,
            event_type: EVENT_GROUP_TASK_ADDED,
            group_id: self.id,
            task_id: task.id,
        };
        self.notify(GroupNotifierMask::ON_ADD_TASK, as_bytes(&msg));
        Ok(())
    }

    /// Remove `task` from the group, firing on-remove notifications.
    ///
    /// Fails with `PortDoesntExist` if the task is not a member.
    pub fn remove_task(self: &Arc<Self>, task: &Arc<Task>) -> KernResult<()> {
        if self.tasks.lock().remove(&task.id).is_none() {
            return Err(SysError::PortDoesntExist);
        }
        task.groups.lock().remove(&self.id);

        let msg = KernelGroupTaskChanged {
            msg_type: KERNEL_MSG_GROUP_TASK_CHANGED,
            flags: 0,
            event_type: EVENT_GROUP_TASK_REMOVED,
            group_id: self.id,
            task_id: task.id,
        };
        self.notify(GroupNotifierMask::ON_REMOVE_TASK, as_bytes(&msg));
        Ok(())
    }

    /// Change a notifier port's action mask, returning the previous mask.
    /// A zero mask unregisters the port.
    pub fn change_notifier_mask(
        self: &Arc<Self>,
        port: &Arc<Port>,
        mask: GroupNotifierMask,
    ) -> u64 {
        let mut notifiers = self.notifiers.lock();
        match notifiers.get_mut(&port.id()) {
            Some(existing) => {
                let old = existing.mask.bits();
                if mask.is_empty() {
                    notifiers.remove(&port.id());
                    port.unlink_notifier_group(self.id);
                } else {
                    existing.mask = mask;
                }
                old
            }
            None => {
                if !mask.is_empty() {
                    notifiers.insert(
                        port.id(),
                        NotifierPort {
                            port: Arc::downgrade(port),
                            mask,
                        },
                    );
                    port.link_notifier_group(self);
                }
                0
            }
        }
    }

    /// Current mask of a notifier port (0 if not registered).
    pub fn notifier_mask(&self, port: PortId) -> u64 {
        self.notifiers
            .lock()
            .get(&port)
            .map(|n| n.mask.bits())
            .unwrap_or(0)
    }

    /// Backlink cleanup when a notifier port is destroyed.
    pub fn forget_notifier(&self, port: PortId) {
        self.notifiers.lock().remove(&port);
    }

    /// Post `msg` to every notifier whose mask covers `event`.
    fn notify(&self, event: GroupNotifierMask, msg: &[u8]) {
        let targets: Vec<Arc<Port>> = {
            let notifiers = self.notifiers.lock();
            notifiers
                .values()
                .filter(|n| n.mask.contains(event))
                .filter_map(|n| n.port.upgrade())
                .collect()
        };
        for port in targets {
            // Notification delivery is best effort; a dead port is not
            // the group's problem.
            let _ = port.send_kernel_message(msg);
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        GROUPS.lock().remove(&self.id);

        let msg = KernelGroupDestroyed {
            msg_type: KERNEL_MSG_GROUP_DESTROYED,
            flags: 0,
            group_id: self.id,
        };
        let notifiers = self.notifiers.get_mut();
        for notifier in notifiers.values() {
            if let Some(port) = notifier.port.upgrade() {
                if notifier.mask.contains(GroupNotifierMask::ON_DESTROY) {
                    let _ = port.send_kernel_message(as_bytes(&msg));
                }
                port.unlink_notifier_group(self.id);
            }
        }
    }
}

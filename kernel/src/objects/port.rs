//! Ports and messages
//!
//! A port is a uni-receiver, multi-sender message endpoint. The owner
//! task is the only one allowed to receive; anyone may send, and the
//! kernel stamps the true sender id on every message. Payloads are copied
//! into kernel memory at send time and copied out at receive.
//!
//! Queues are unbounded FIFOs: senders never block, ordering within one
//! port is strict send order, and there is no ordering across ports.

use crate::objects::task::{Task, TaskStatus};
use crate::objects::task_group::TaskGroup;
use crate::KernResult;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use thallium_abi::ipc::MessageDescriptor;
use thallium_abi::{PortId, SysError, TaskGroupId, TaskId};

/// Global port table.
static PORTS: Mutex<BTreeMap<PortId, Arc<Port>>> = Mutex::new(BTreeMap::new());

/// Port numbers are monotonically increasing and never reused within a
/// boot.
static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Sender id stamped on kernel-originated messages.
pub const KERNEL_SENDER: TaskId = 0;

/// A queued message: payload plus sender attribution and a channel tag.
pub struct Message {
    pub sender: TaskId,
    pub channel: u64,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn descriptor(&self) -> MessageDescriptor {
        MessageDescriptor {
            sender: self.sender,
            channel: self.channel,
            size: self.payload.len() as u64,
        }
    }
}

struct PortInner {
    queue: VecDeque<Message>,
    /// Task groups this port is registered with as a notifier; used so
    /// destroying the port also removes it from every group's map.
    notifier_groups: BTreeMap<TaskGroupId, Weak<TaskGroup>>,
    dead: bool,
}

/// A message endpoint owned by one task.
pub struct Port {
    id: PortId,
    /// Owner attribution is weak: a port must never keep its owner alive.
    owner: Mutex<Weak<Task>>,
    inner: Mutex<PortInner>,
}

impl Port {
    /// Allocate a port owned by `owner` and register it globally.
    pub fn create(owner: &Arc<Task>) -> KernResult<Arc<Port>> {
        let id = NEXT_PORT_ID.fetch_add(1, Ordering::SeqCst);
        let port = Arc::new(Port {
            id,
            owner: Mutex::new(Arc::downgrade(owner)),
            inner: Mutex::new(PortInner {
                queue: VecDeque::new(),
                notifier_groups: BTreeMap::new(),
                dead: false,
            }),
        });
        owner.add_owned_port(&port);
        PORTS.lock().insert(id, port.clone());
        Ok(port)
    }

    /// Look up a live port by number.
    pub fn get(id: PortId) -> KernResult<Arc<Port>> {
        PORTS
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SysError::PortDoesntExist)
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn owner(&self) -> Option<Arc<Task>> {
        self.owner.lock().upgrade()
    }

    /// Whether `task` is the port's owner.
    pub fn owned_by(&self, task: &Arc<Task>) -> bool {
        self.owner()
            .is_some_and(|owner| Arc::ptr_eq(&owner, task))
    }

    /// Append a message sent by `sender` and wake the owner if it is
    /// blocked receiving on this port.
    pub fn send(self: &Arc<Self>, sender: TaskId, channel: u64, payload: Vec<u8>) -> KernResult<()> {
        {
            let mut inner = self.inner.lock();
            if inner.dead {
                return Err(SysError::PortClosed);
            }
            inner.queue.push_back(Message {
                sender,
                channel,
                payload,
            });
        }
        self.wake_owner();
        Ok(())
    }

    /// Send a kernel-originated message (interrupts, group events, page
    /// requests).
    pub fn send_kernel_message(self: &Arc<Self>, bytes: &[u8]) -> KernResult<()> {
        self.send(KERNEL_SENDER, 0, bytes.to_vec())
    }

    /// Forward kernel log bytes. Separated from `send_kernel_message` so
    /// the log path can never recurse into logging.
    pub fn send_log_bytes(self: &Arc<Self>, bytes: &[u8]) -> KernResult<()> {
        let mut payload = Vec::with_capacity(bytes.len() + 4);
        payload.extend_from_slice(&thallium_abi::ipc::KERNEL_MSG_LOG_OUTPUT.to_le_bytes());
        payload.extend_from_slice(bytes);
        self.send(KERNEL_SENDER, 0, payload)
    }

    /// Descriptor of the head message without popping it.
    pub fn head_descriptor(&self) -> Option<MessageDescriptor> {
        let inner = self.inner.lock();
        inner.queue.front().map(Message::descriptor)
    }

    /// Copy of the head message (sender, channel, payload) for tests and
    /// for receive paths that copy out under their own locking.
    pub fn peek_front(&self) -> Option<(TaskId, u64, Vec<u8>)> {
        let inner = self.inner.lock();
        inner
            .queue
            .front()
            .map(|m| (m.sender, m.channel, m.payload.clone()))
    }

    /// Pop the head message.
    pub fn pop_front(&self) -> Option<Message> {
        self.inner.lock().queue.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Record that a group holds this port in its notifier map.
    pub fn link_notifier_group(&self, group: &Arc<TaskGroup>) {
        self.inner
            .lock()
            .notifier_groups
            .insert(group.id(), Arc::downgrade(group));
    }

    /// Drop the backlink when a group unregisters the port (or dies).
    pub fn unlink_notifier_group(&self, group: TaskGroupId) {
        self.inner.lock().notifier_groups.remove(&group);
    }

    /// Destroy the port: unregister it, drop pending messages and remove
    /// it from every task group's notifier map. Runs when the owner dies
    /// or on explicit request.
    pub fn destroy(self: &Arc<Self>) {
        let groups: Vec<Weak<TaskGroup>> = {
            let mut inner = self.inner.lock();
            if inner.dead {
                return;
            }
            inner.dead = true;
            inner.queue.clear();
            let g = inner.notifier_groups.values().cloned().collect();
            inner.notifier_groups.clear();
            g
        };

        for weak in groups {
            if let Some(group) = weak.upgrade() {
                group.forget_notifier(self.id);
            }
        }

        if let Some(owner) = self.owner() {
            owner.remove_owned_port(self.id);
        }

        PORTS.lock().remove(&self.id);
    }

    /// Wake the owner if it is blocked receiving on this port.
    fn wake_owner(self: &Arc<Self>) {
        let Some(owner) = self.owner() else {
            return;
        };
        let should_wake = {
            let mut sched = owner.sched.lock();
            match sched.status {
                TaskStatus::Blocked => sched.blocked_by.is_port(self),
                // The owner may be mid-way into a blocking receive on
                // this port; leave a pending wake for it to consume.
                TaskStatus::Running => {
                    sched.wake_pending = true;
                    false
                }
                _ => false,
            }
        };
        if should_wake {
            crate::scheduler::wake(&owner);
        }
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("queued", &self.queue_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn numbers_are_monotonic_and_global() {
        let owner = Task::create_for_tests();
        let a = Port::create(&owner).unwrap();
        let b = Port::create(&owner).unwrap();
        assert!(b.id() > a.id());
        assert!(Arc::ptr_eq(&Port::get(a.id()).unwrap(), &a));

        a.destroy();
        assert!(matches!(Port::get(a.id()), Err(SysError::PortDoesntExist)));
        b.destroy();
    }

    #[test]
    fn fifo_order_and_sender_stamp() {
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();

        port.send(7, 0, vec![1]).unwrap();
        port.send(8, 0, vec![2, 2]).unwrap();
        port.send(9, 0, vec![3, 3, 3]).unwrap();

        let d = port.head_descriptor().unwrap();
        assert_eq!(d.sender, 7);
        assert_eq!(d.size, 1);

        // Peek does not pop.
        assert_eq!(port.queue_len(), 3);

        let m1 = port.pop_front().unwrap();
        let m2 = port.pop_front().unwrap();
        let m3 = port.pop_front().unwrap();
        assert_eq!((m1.sender, m1.payload), (7, vec![1]));
        assert_eq!((m2.sender, m2.payload), (8, vec![2, 2]));
        assert_eq!((m3.sender, m3.payload), (9, vec![3, 3, 3]));
        assert!(port.pop_front().is_none());
        port.destroy();
    }

    #[test]
    fn destroyed_port_rejects_sends() {
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        port.destroy();
        assert!(matches!(
            port.send(1, 0, vec![0]),
            Err(SysError::PortClosed)
        ));
    }

    #[test]
    fn owner_attribution() {
        let owner = Task::create_for_tests();
        let stranger = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        assert!(port.owned_by(&owner));
        assert!(!port.owned_by(&stranger));
        assert!(owner.owned_ports.lock().contains_key(&port.id()));
        port.destroy();
        assert!(!owner.owned_ports.lock().contains_key(&port.id()));
    }
}

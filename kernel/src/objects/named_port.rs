//! Named ports
//!
//! A process-wide registry binding human-readable names to ports. A name
//! can be looked up before anyone registers it: the descriptor is created
//! in a pending state and the lookup either blocks the caller
//! (`get-port-by-name`) or queues a one-shot reply (`request-named-port`).
//! When `name-port` later attaches a parent port, every pending action is
//! drained against the freshly resolved port.
//!
//! A descriptor lives as long as it has a live parent port or pending
//! actions; fully dead entries are pruned on the next registry access.

use crate::objects::port::Port;
use crate::objects::task::Task;
use crate::KernResult;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::{Lazy, Mutex};
use thallium_abi::ipc::{as_bytes, KernelNamedPortNotification, KERNEL_MSG_NAMED_PORT_NOTIFICATION};
use thallium_abi::SysError;

/// Global name registry.
static NAMED_PORTS: Lazy<Mutex<HashMap<String, Arc<NamedPortDesc>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// A deferred reaction to a name resolving.
pub enum PendingAction {
    /// Wake a task blocked in `get-port-by-name`; the repeated syscall
    /// then observes the resolved name.
    NotifyTask(Weak<Task>),
    /// Post a `KernelNamedPortNotification` to a reply port.
    SendMessage(Weak<Port>),
}

impl PendingAction {
    /// Run the action against the port the name resolved to.
    fn perform(&self, resolved: &Arc<Port>, name: &str) {
        match self {
            PendingAction::NotifyTask(task) => {
                if let Some(task) = task.upgrade() {
                    // The task is either parked on this descriptor or
                    // still on its way into the block; `wake` covers both
                    // (a racing wake is consumed by the block attempt).
                    crate::scheduler::wake(&task);
                }
            }
            PendingAction::SendMessage(reply) => {
                if let Some(reply) = reply.upgrade() {
                    let header = KernelNamedPortNotification {
                        msg_type: KERNEL_MSG_NAMED_PORT_NOTIFICATION,
                        reserved: 0,
                        port_num: resolved.id(),
                    };
                    let mut payload = Vec::with_capacity(
                        core::mem::size_of::<KernelNamedPortNotification>() + name.len(),
                    );
                    payload.extend_from_slice(as_bytes(&header));
                    payload.extend_from_slice(name.as_bytes());
                    let _ = reply.send_kernel_message(&payload);
                }
            }
        }
    }
}

/// A name → port rendezvous descriptor.
pub struct NamedPortDesc {
    pub name: String,
    parent: Mutex<Weak<Port>>,
    actions: Mutex<Vec<PendingAction>>,
}

impl NamedPortDesc {
    fn new(name: String, parent: Weak<Port>) -> Arc<Self> {
        Arc::new(Self {
            name,
            parent: Mutex::new(parent),
            actions: Mutex::new(Vec::new()),
        })
    }

    /// The resolved port, if the parent is alive.
    pub fn parent_port(&self) -> Option<Arc<Port>> {
        self.parent.lock().upgrade()
    }

    fn push_action(&self, action: PendingAction) {
        self.actions.lock().push(action);
    }
}

/// Attach `port` as the parent of `name`.
///
/// Fails with `NameExists` if the name already has a live parent. A
/// pending descriptor is resolved in place and its queued actions run
/// against the new port.
pub fn name_port(port: &Arc<Port>, name: String) -> KernResult<()> {
    let desc = {
        let mut registry = NAMED_PORTS.lock();
        match registry.get(&name) {
            Some(desc) => {
                if desc.parent_port().is_some() {
                    return Err(SysError::NameExists);
                }
                let desc = desc.clone();
                *desc.parent.lock() = Arc::downgrade(port);
                desc
            }
            None => {
                let desc = NamedPortDesc::new(name.clone(), Arc::downgrade(port));
                registry.insert(name.clone(), desc.clone());
                desc
            }
        }
    };

    let pending: Vec<PendingAction> = core::mem::take(&mut *desc.actions.lock());
    for action in &pending {
        action.perform(port, &desc.name);
    }
    Ok(())
}

/// Resolution result of `get-port-by-name`.
pub enum NameLookup {
    /// The name is bound; here is the port number.
    Resolved(u64),
    /// The caller was queued and must block + repeat.
    MustBlock(Arc<NamedPortDesc>),
}

/// Look up `name`, blocking the caller until it resolves unless `noblock`.
pub fn get_port_by_name(
    task: &Arc<Task>,
    name: String,
    noblock: bool,
) -> KernResult<NameLookup> {
    let mut registry = NAMED_PORTS.lock();
    prune(&mut registry);

    // The wait hint: a task repeating this syscall is usually blocked on
    // the very descriptor it asked about.
    let hinted = task.sched.lock().blocked_by.clone();
    let desc = match hinted {
        crate::objects::task::WaitRef::NamedPort(w) => {
            w.upgrade().filter(|d| d.name == name)
        }
        _ => None,
    };
    let desc = desc.or_else(|| registry.get(&name).cloned());

    match desc {
        Some(desc) => {
            if let Some(port) = desc.parent_port() {
                return Ok(NameLookup::Resolved(port.id()));
            }
            if noblock {
                return Err(SysError::PortDoesntExist);
            }
            desc.push_action(PendingAction::NotifyTask(Arc::downgrade(task)));
            Ok(NameLookup::MustBlock(desc))
        }
        None => {
            if noblock {
                return Err(SysError::PortDoesntExist);
            }
            let desc = NamedPortDesc::new(name.clone(), Weak::new());
            desc.push_action(PendingAction::NotifyTask(Arc::downgrade(task)));
            registry.insert(name, desc.clone());
            Ok(NameLookup::MustBlock(desc))
        }
    }
}

/// One-shot variant: when `name` resolves, post a notification to
/// `reply_port` instead of waking anyone. If the name is already bound
/// the notification is posted immediately.
pub fn request_named_port(name: String, reply_port: Arc<Port>) -> KernResult<()> {
    let desc = {
        let mut registry = NAMED_PORTS.lock();
        prune(&mut registry);
        match registry.get(&name) {
            Some(desc) => desc.clone(),
            None => {
                let desc = NamedPortDesc::new(name.clone(), Weak::new());
                registry.insert(name.clone(), desc.clone());
                desc
            }
        }
    };

    match desc.parent_port() {
        Some(resolved) => {
            PendingAction::SendMessage(Arc::downgrade(&reply_port)).perform(&resolved, &desc.name);
            Ok(())
        }
        None => {
            desc.push_action(PendingAction::SendMessage(Arc::downgrade(&reply_port)));
            Ok(())
        }
    }
}

/// Drop descriptors whose parent is gone and whose action queue is empty.
fn prune(registry: &mut HashMap<String, Arc<NamedPortDesc>>) {
    registry.retain(|_, desc| desc.parent_port().is_some() || !desc.actions.lock().is_empty());
}

#[cfg(test)]
pub fn reset_for_tests() {
    NAMED_PORTS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    /// The registry is global; these tests reset it and so take turns.
    static LOCK: spin::Mutex<()> = spin::Mutex::new(());

    #[test]
    fn register_then_lookup() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        name_port(&port, "svc".to_string()).unwrap();

        let caller = Task::create_for_tests();
        match get_port_by_name(&caller, "svc".to_string(), true).unwrap() {
            NameLookup::Resolved(id) => assert_eq!(id, port.id()),
            NameLookup::MustBlock(_) => panic!("name was registered"),
        }
        port.destroy();
    }

    #[test]
    fn duplicate_name_rejected_while_parent_lives() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let owner = Task::create_for_tests();
        let a = Port::create(&owner).unwrap();
        let b = Port::create(&owner).unwrap();

        name_port(&a, "svc".to_string()).unwrap();
        assert!(matches!(
            name_port(&b, "svc".to_string()),
            Err(SysError::NameExists)
        ));

        // Once the first port dies the name can be rebound.
        a.destroy();
        name_port(&b, "svc".to_string()).unwrap();
        b.destroy();
    }

    #[test]
    fn noblock_lookup_of_unknown_name_fails() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let caller = Task::create_for_tests();
        assert!(matches!(
            get_port_by_name(&caller, "nope".to_string(), true),
            Err(SysError::PortDoesntExist)
        ));
    }

    #[test]
    fn blocking_lookup_queues_and_resolves() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let caller = Task::create_for_tests();
        let lookup = get_port_by_name(&caller, "late".to_string(), false).unwrap();
        let desc = match lookup {
            NameLookup::MustBlock(desc) => desc,
            NameLookup::Resolved(_) => panic!("nothing registered yet"),
        };
        assert!(desc.parent_port().is_none());

        // Now the service arrives; the pending action queue drains.
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        name_port(&port, "late".to_string()).unwrap();
        assert!(desc.parent_port().is_some());
        assert!(desc.actions.lock().is_empty());

        // The repeated lookup resolves.
        match get_port_by_name(&caller, "late".to_string(), false).unwrap() {
            NameLookup::Resolved(id) => assert_eq!(id, port.id()),
            NameLookup::MustBlock(_) => panic!("should be resolved now"),
        }
        port.destroy();
    }

    #[test]
    fn request_named_port_posts_notification() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let owner = Task::create_for_tests();
        let reply = Port::create(&owner).unwrap();

        // Request before registration: nothing arrives yet.
        request_named_port("db".to_string(), reply.clone()).unwrap();
        assert!(reply.is_empty());

        let svc_owner = Task::create_for_tests();
        let svc = Port::create(&svc_owner).unwrap();
        name_port(&svc, "db".to_string()).unwrap();

        let (sender, _, payload) = reply.peek_front().unwrap();
        assert_eq!(sender, crate::objects::port::KERNEL_SENDER);
        let header_len = core::mem::size_of::<KernelNamedPortNotification>();
        assert_eq!(&payload[header_len..], b"db");
        assert_eq!(
            u32::from_le_bytes(payload[0..4].try_into().unwrap()),
            KERNEL_MSG_NAMED_PORT_NOTIFICATION
        );
        // The port number rides in the header.
        assert_eq!(
            u64::from_le_bytes(payload[8..16].try_into().unwrap()),
            svc.id()
        );

        // Requesting an already-bound name replies immediately.
        reply.pop_front();
        request_named_port("db".to_string(), reply.clone()).unwrap();
        assert_eq!(reply.queue_len(), 1);
        svc.destroy();
        reply.destroy();
    }

    #[test]
    fn dead_entries_are_pruned() {
        let _serial = LOCK.lock();
        reset_for_tests();
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        name_port(&port, "gone".to_string()).unwrap();
        port.destroy();

        // Lookup after the parent died prunes the descriptor and reports
        // the name unknown.
        let caller = Task::create_for_tests();
        assert!(matches!(
            get_port_by_name(&caller, "gone".to_string(), true),
            Err(SysError::PortDoesntExist)
        ));
        assert!(NAMED_PORTS.lock().is_empty());
    }
}

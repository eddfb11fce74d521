//! Object model integration tests
//!
//! Cross-object scenarios that no single module's unit tests cover:
//! message round trips through a blocked receiver, named-port rendezvous
//! in both arrival orders, memory objects shared between address spaces,
//! and group notification behavior around task death.

#[cfg(test)]
mod tests {
    use crate::memory::page_table::AddressSpace;
    use crate::memory::test_support;
    use crate::objects::named_port::{self, NameLookup};
    use crate::objects::port::Port;
    use crate::objects::task::{Task, TaskStatus, WaitRef};
    use crate::objects::task_group::TaskGroup;
    use crate::scheduler;
    use alloc::string::ToString;
    use alloc::sync::Arc;
    use alloc::vec;
    use thallium_abi::flags::{GroupNotifierMask, RegionFlags};

    // ========================================================================
    // Ports + scheduler
    // ========================================================================

    #[test]
    fn message_round_trip_preserves_order_and_payloads() {
        let owner = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();

        let payloads: [&[u8]; 3] = [b"hi", &[0x41], &[1, 2, 3, 4, 5]];
        for (i, p) in payloads.iter().enumerate() {
            port.send(100 + i as u64, 0, p.to_vec()).unwrap();
        }

        // Descriptor reflects the head without popping.
        let d = port.head_descriptor().unwrap();
        assert_eq!(d.sender, 100);
        assert_eq!(d.channel, 0);
        assert_eq!(d.size, 2);

        for (i, p) in payloads.iter().enumerate() {
            let m = port.pop_front().unwrap();
            assert_eq!(m.sender, 100 + i as u64);
            assert_eq!(&m.payload[..], *p);
        }
        assert!(port.is_empty());
        port.destroy();
    }

    #[test]
    fn send_wakes_receiver_blocked_on_the_port() {
        let _serial = scheduler::TEST_QUEUE_LOCK.lock();
        scheduler::init_for_tests(2);
        let cpu0 = scheduler::cpu(0).unwrap();

        let receiver = Task::create_for_tests();
        receiver.sched.lock().affinity = 0b01;
        let port = Port::create(&receiver).unwrap();

        // Receiver is current and parks on the empty port, as the
        // blocking receive path does.
        receiver.sched.lock().status = TaskStatus::Running;
        cpu0.set_current(receiver.clone());
        let mut frame = crate::arch::x86_64::context::TrapFrame::new();
        frame.rip = 0x401002;
        receiver.request_repeat_syscall();
        assert!(scheduler::block_current(
            &mut frame,
            WaitRef::Port(Arc::downgrade(&port))
        ));
        assert_eq!(receiver.status(), TaskStatus::Blocked);

        // A sender arrives: the receiver becomes ready again, with its
        // saved program counter rewound onto the syscall instruction.
        port.send(7, 0, vec![0x41]).unwrap();
        assert_eq!(receiver.status(), TaskStatus::Ready);
        assert_eq!(receiver.regs.lock().rip, 0x401000);
        assert_eq!(port.queue_len(), 1);

        // Drain.
        assert!(cpu0.queues.lock().erase(&receiver, 8));
        port.destroy();
    }

    #[test]
    fn send_to_port_of_running_owner_leaves_a_pending_wake() {
        let _serial = scheduler::TEST_QUEUE_LOCK.lock();
        scheduler::init_for_tests(2);
        let cpu0 = scheduler::cpu(0).unwrap();

        let receiver = Task::create_for_tests();
        receiver.sched.lock().status = TaskStatus::Running;
        cpu0.set_current(receiver.clone());
        let port = Port::create(&receiver).unwrap();

        // The race: the message lands after the receiver decided to
        // block but before it parked.
        port.send(9, 0, vec![1]).unwrap();
        assert!(receiver.sched.lock().wake_pending);

        // The block attempt consumes the pending wake and does not park.
        let mut frame = crate::arch::x86_64::context::TrapFrame::new();
        assert!(!scheduler::block_current(
            &mut frame,
            WaitRef::Port(Arc::downgrade(&port))
        ));
        assert_eq!(receiver.status(), TaskStatus::Running);
        assert!(!receiver.sched.lock().wake_pending);

        cpu0.set_current(cpu0.idle.clone());
        port.destroy();
    }

    // ========================================================================
    // Named-port rendezvous
    // ========================================================================

    #[test]
    fn rendezvous_in_either_arrival_order() {
        let _serial = scheduler::TEST_QUEUE_LOCK.lock();
        scheduler::init_for_tests(2);
        let cpu0 = scheduler::cpu(0).unwrap();

        // Service first, client second: immediate resolution.
        let server = Task::create_for_tests();
        let svc = Port::create(&server).unwrap();
        named_port::name_port(&svc, "order-a".to_string()).unwrap();
        let client = Task::create_for_tests();
        match named_port::get_port_by_name(&client, "order-a".to_string(), false).unwrap() {
            NameLookup::Resolved(id) => assert_eq!(id, svc.id()),
            NameLookup::MustBlock(_) => panic!("already registered"),
        }

        // Client first: it parks on the pending descriptor and the
        // registration wakes it.
        let early = Task::create_for_tests();
        early.sched.lock().affinity = 0b01;
        let desc = match named_port::get_port_by_name(&early, "order-b".to_string(), false)
            .unwrap()
        {
            NameLookup::MustBlock(desc) => desc,
            NameLookup::Resolved(_) => panic!("nothing registered yet"),
        };
        early.sched.lock().status = TaskStatus::Running;
        cpu0.set_current(early.clone());
        let mut frame = crate::arch::x86_64::context::TrapFrame::new();
        early.request_repeat_syscall();
        assert!(scheduler::block_current(
            &mut frame,
            WaitRef::NamedPort(Arc::downgrade(&desc))
        ));
        assert_eq!(early.status(), TaskStatus::Blocked);

        let late = Port::create(&server).unwrap();
        named_port::name_port(&late, "order-b".to_string()).unwrap();
        assert_eq!(early.status(), TaskStatus::Ready);

        // The repeated lookup now resolves.
        match named_port::get_port_by_name(&early, "order-b".to_string(), false).unwrap() {
            NameLookup::Resolved(id) => assert_eq!(id, late.id()),
            NameLookup::MustBlock(_) => panic!("registration arrived"),
        }

        assert!(cpu0.queues.lock().erase(&early, 8));
        svc.destroy();
        late.destroy();
    }

    // ========================================================================
    // Memory objects across address spaces
    // ========================================================================

    #[test]
    fn object_backed_pages_are_shared_between_tasks() {
        let _mem = test_support::frame_lock();
        test_support::init_test_frames();
        let writer = Task::create(3).unwrap();
        let reader = Task::create(3).unwrap();
        let ws = AddressSpace::new().unwrap();
        let rs = AddressSpace::new().unwrap();
        writer.attach_space(ws.clone()).unwrap();
        reader.attach_space(rs.clone()).unwrap();

        let obj = crate::memory::mem_object::MemObject::create(12, 4, None);
        let rw = RegionFlags::READ | RegionFlags::WRITE;
        let va = ws
            .map_mem_object(0x400000, 0x4000, rw, "shm".to_string(), obj.clone(), 0)
            .unwrap();
        let vb = rs
            .map_mem_object(0x900000, 0x4000, RegionFlags::READ, "shm".to_string(), obj, 0)
            .unwrap();

        // Writer faults the first page in; reader faults the same object
        // page and must observe the identical frame.
        ws.handle_page_fault(&writer, va, RegionFlags::WRITE).unwrap();
        rs.handle_page_fault(&reader, vb, RegionFlags::READ).unwrap();

        // Regions tile without overlap in each space.
        assert_eq!(ws.mapped_region_pages(), 4);
        assert_eq!(rs.mapped_region_pages(), 4);

        writer.kill();
        reader.kill();
    }

    // ========================================================================
    // Task groups and death
    // ========================================================================

    #[test]
    fn group_events_around_task_death() {
        let group = TaskGroup::create();
        let member = Task::create(3).unwrap();
        group.register_task(&member).unwrap();

        let watcher = Task::create_for_tests();
        let notify = Port::create(&watcher).unwrap();
        group.change_notifier_mask(
            &notify,
            GroupNotifierMask::ON_ADD_TASK | GroupNotifierMask::ON_REMOVE_TASK,
        );

        // Another member joining is observed.
        let second = Task::create(3).unwrap();
        group.register_task(&second).unwrap();
        assert_eq!(notify.queue_len(), 1);
        notify.pop_front();

        // Explicit removal notifies once; the subsequent kill must not
        // repeat it for the already-removed task.
        group.remove_task(&member).unwrap();
        assert_eq!(notify.queue_len(), 1);
        notify.pop_front();
        member.kill();
        assert!(notify.is_empty());

        // Killing a still-enrolled member fires the removal through the
        // death path instead.
        second.kill();
        assert_eq!(notify.queue_len(), 1);
        assert!(!group.has_task(second.id));

        notify.destroy();
    }

    #[test]
    fn dying_owner_takes_its_ports_along() {
        let owner = Task::create(3).unwrap();
        let port = Port::create(&owner).unwrap();
        let portno = port.id();
        port.send(1, 0, vec![9]).unwrap();

        owner.kill();
        assert!(Port::get(portno).is_err());
        // The surviving Arc sees a dead port.
        assert!(port.send(1, 0, vec![9]).is_err());
    }
}

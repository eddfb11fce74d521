//! Syscall dispatcher
//!
//! A numeric call number in `rdi` selects a handler; up to five argument
//! registers pass through. Every handler returns `KernResult<()>` and
//! reports its value through the context; the dispatcher is the single
//! point where errors become the `(status, value)` register pair. A
//! handler either completes without visible side effects before its last
//! committing step, or blocks the caller with the repeat flag armed so
//! the whole syscall re-executes on wake — partial mutations never leak.

use crate::arch::x86_64::context::TrapFrame;
use crate::memory::address::{PAGE_SIZE, PAGE_SIZE_LOG, USER_MAX};
use crate::memory::mem_object::MemObject;
use crate::memory::page_table::AddressSpace;
use crate::memory::user;
use crate::memory::user::UserCopy;
use crate::objects::irq;
use crate::objects::named_port::{self, NameLookup};
use crate::objects::port::Port;
use crate::objects::task::{Task, TaskStatus, WaitRef};
use crate::objects::task_group::TaskGroup;
use crate::KernResult;
use alloc::string::String;
use alloc::sync::Arc;
use thallium_abi::flags::*;
use thallium_abi::ipc::as_bytes;
use thallium_abi::syscall::*;
use thallium_abi::SysError;

/// Per-invocation dispatcher state.
struct Ctx<'a> {
    task: Arc<Task>,
    frame: &'a mut TrapFrame,
    /// Result value, written to the value register on success.
    value: u64,
    /// Set when the frame now carries another task (the caller blocked
    /// or died); the dispatcher must not touch the return registers.
    switched: bool,
}

impl Ctx<'_> {
    fn space(&self) -> KernResult<Arc<AddressSpace>> {
        self.task.space()
    }

    /// Arm the repeat flag and park the caller on `wait`; the syscall
    /// re-executes from the top once the wait clears. If the wake raced
    /// in before parking, the live frame is rewound instead so the task
    /// repeats immediately without sleeping.
    fn block_and_repeat(&mut self, wait: WaitRef) {
        self.task.request_repeat_syscall();
        if !crate::scheduler::block_current(self.frame, wait) {
            self.task.pop_repeat_syscall();
            self.frame.rewind_syscall();
        }
        // Either way the return registers must stay untouched: the frame
        // now holds the next task, or this task's re-entry state.
        self.switched = true;
    }

    /// Block the caller on a pager-backed page and repeat the syscall on
    /// wake.
    fn block_on_page(&mut self) {
        self.block_and_repeat(WaitRef::None);
    }

    /// Copy into user memory, blocking + repeating if a page is absent.
    /// Returns false when the caller blocked.
    fn put_user(&mut self, dst: usize, bytes: &[u8]) -> KernResult<bool> {
        match user::copy_to_user(&self.space()?, &self.task, dst, bytes)? {
            UserCopy::Done => Ok(true),
            UserCopy::Blocked => {
                self.block_on_page();
                Ok(false)
            }
        }
    }

    /// Read user bytes, blocking + repeating if a page is absent.
    fn take_user(&mut self, src: usize, len: usize) -> KernResult<Option<alloc::vec::Vec<u8>>> {
        match user::read_user_bytes(&self.space()?, &self.task, src, len)? {
            Some(bytes) => Ok(Some(bytes)),
            None => {
                self.block_on_page();
                Ok(None)
            }
        }
    }

    /// Read a user string, blocking + repeating if a page is absent.
    fn take_user_string(&mut self, src: usize, len: usize) -> KernResult<Option<String>> {
        match user::read_user_string(&self.space()?, &self.task, src, len)? {
            Some(s) => Ok(Some(s)),
            None => {
                self.block_on_page();
                Ok(None)
            }
        }
    }

    /// Resolve a port the caller wants to receive from, trying the
    /// blocked-on hint before the global table.
    fn receive_port(&self, portno: u64) -> KernResult<Arc<Port>> {
        if let Some(hint) = self.task.sched.lock().blocked_by.as_port() {
            if hint.id() == portno {
                return Ok(hint);
            }
        }
        Port::get(portno)
    }
}

/// Entry point from the trap path.
pub fn dispatch(frame: &mut TrapFrame) {
    let Some(task) = crate::scheduler::current_task() else {
        frame.set_return_status(SysError::General as i64);
        return;
    };

    let call = frame.syscall_number();
    let args = frame.syscall_args();

    if task.attrs.lock().debug_syscalls {
        crate::kdebug!("syscall {:#x} task {}", call, task.id);
    }

    let mut ctx = Ctx {
        task,
        frame,
        value: 0,
        switched: false,
    };

    let result = run(&mut ctx, call, args);

    if ctx.switched {
        // The frame belongs to whatever runs next; the blocked caller
        // repeats (or is dead) and must not see a half-written result.
        return;
    }
    match result {
        Ok(()) => {
            ctx.frame.set_return_status(0);
            ctx.frame.set_return_value(ctx.value);
        }
        Err(e) => ctx.frame.set_return_status(e as i64),
    }
}

fn run(ctx: &mut Ctx, call: u64, args: [u64; 5]) -> KernResult<()> {
    let [a1, a2, a3, a4, a5] = args;
    match call {
        SYSCALL_EXIT => sys_exit(ctx, a1, a2),
        SYSCALL_GETPID => {
            ctx.value = ctx.task.id;
            Ok(())
        }
        SYSCALL_CREATE_PROCESS => {
            ctx.value = Task::create(3)?.id;
            Ok(())
        }
        SYSCALL_START_PROCESS => sys_start_process(ctx, a1, a2, a3, a4, a5),
        SYSCALL_INIT_STACK => sys_init_stack(ctx, a1, a2),
        SYSCALL_SET_PRIORITY => sys_set_priority(ctx, a1),
        SYSCALL_SET_TASK_NAME => sys_set_task_name(ctx, a1, a2, a3),
        SYSCALL_GET_LAPIC_ID => {
            ctx.value = crate::scheduler::this_cpu().map(|c| c.lapic_id as u64).unwrap_or(0);
            Ok(())
        }
        SYSCALL_CONFIGURE_SYSTEM => sys_configure_system(ctx, a1, a2, a3),
        SYSCALL_GET_MESSAGE_INFO => sys_get_message_info(ctx, a1, a2, a3),
        SYSCALL_GET_FIRST_MESSAGE => sys_get_first_message(ctx, a1, a2, a3),
        SYSCALL_REQUEST_NAMED_PORT => sys_request_named_port(ctx, a1, a2, a3, a4),
        SYSCALL_SEND_MESSAGE_PORT => sys_send_message_port(ctx, a1, a2, a3),
        SYSCALL_CREATE_PORT => sys_create_port(ctx, a1),
        SYSCALL_SET_ATTRIBUTE => sys_set_attribute(ctx, a1, a2, a3),
        SYSCALL_SET_INTERRUPT => sys_set_interrupt(ctx, a1, a2, a3),
        SYSCALL_NAME_PORT => sys_name_port(ctx, a1, a2, a3),
        SYSCALL_GET_PORT_BY_NAME => sys_get_port_by_name(ctx, a1, a2, a3),
        SYSCALL_SET_LOG_PORT => sys_set_log_port(ctx, a1, a2),
        SYSCALL_GET_PAGE_TABLE => sys_get_page_table(ctx, a1),
        SYSCALL_CREATE_MEM_OBJECT => sys_create_mem_object(ctx, a1, a2, a3),
        SYSCALL_TRANSFER_REGION => sys_transfer_region(ctx, a1, a2, a3, a4),
        SYSCALL_CREATE_NORMAL_REGION => sys_create_normal_region(ctx, a1, a2, a3, a4),
        SYSCALL_GET_SEGMENT => sys_get_segment(ctx, a1, a2, a3),
        SYSCALL_CREATE_PHYS_MAP_REGION => sys_create_phys_map_region(ctx, a1, a2, a3, a4, a5),
        SYSCALL_DELETE_REGION => sys_delete_region(ctx, a1),
        SYSCALL_MAP_MEM_OBJECT => sys_map_mem_object(ctx, a1, a2, a3, a4, a5),
        SYSCALL_PROVIDE_PAGE => sys_provide_page(ctx, a1, a2, a3),
        SYSCALL_SET_SEGMENT => sys_set_segment(ctx, a1, a2, a3),
        SYSCALL_ASIGN_PAGE_TABLE => sys_asign_page_table(ctx, a1, a2, a3),
        SYSCALL_SET_NOTIFY_MASK => sys_set_notify_mask(ctx, a1, a2, a3),
        SYSCALL_CREATE_TASK_GROUP => {
            let group = TaskGroup::create();
            group.register_task(&ctx.task)?;
            ctx.value = group.id();
            Ok(())
        }
        SYSCALL_ADD_TO_TASK_GROUP => {
            let task = Task::get_or_self(a1, &ctx.task)?;
            TaskGroup::get(a2)?.register_task(&task)
        }
        SYSCALL_REMOVE_FROM_TASK_GROUP => {
            let task = Task::get_or_self(a1, &ctx.task)?;
            TaskGroup::get(a2)?.remove_task(&task)
        }
        SYSCALL_IS_IN_TASK_GROUP => {
            let id = if a1 == thallium_abi::TASK_ID_SELF {
                ctx.task.id
            } else {
                a1
            };
            ctx.value = TaskGroup::get(a2)?.has_task(id) as u64;
            Ok(())
        }
        _ => Err(SysError::NotSupported),
    }
}

fn sys_exit(ctx: &mut Ctx, code_lo: u64, code_hi: u64) -> KernResult<()> {
    *ctx.task.exit_code.lock() = (code_hi, code_lo);
    ctx.task.kill();
    crate::scheduler::reschedule(ctx.frame);
    ctx.switched = true;
    Ok(())
}

fn sys_start_process(
    ctx: &mut Ctx,
    tid: u64,
    entry: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    if !target.is_uninit() {
        return Err(SysError::ProcessInited);
    }
    // A task cannot run without an address space.
    target.space()?;

    {
        let mut regs = target.regs.lock();
        regs.rip = entry;
        regs.rdi = arg1;
        regs.rsi = arg2;
        regs.rdx = arg3;
    }
    crate::scheduler::enqueue(&target);
    Ok(())
}

fn sys_init_stack(ctx: &mut Ctx, tid: u64, stack_top: u64) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    if !target.is_uninit() {
        return Err(SysError::ProcessInited);
    }

    let top = if stack_top == 0 {
        let space = target.space()?;
        let size = crate::config::AUTO_STACK_SIZE;
        let hint = USER_MAX - size - PAGE_SIZE;
        let start = space.create_normal_region(
            hint,
            size,
            RegionFlags::READ | RegionFlags::WRITE,
            String::from("stack"),
            true,
        )?;
        (start + size) as u64
    } else {
        stack_top
    };

    target.regs.lock().rsp = top;
    ctx.value = top;
    Ok(())
}

fn sys_set_priority(ctx: &mut Ctx, priority: u64) -> KernResult<()> {
    crate::scheduler::set_priority(&ctx.task, priority)
}

fn sys_set_task_name(ctx: &mut Ctx, tid: u64, ptr: u64, len: u64) -> KernResult<()> {
    if len > 4096 {
        return Err(SysError::OutOfRange);
    }
    let Some(name) = ctx.take_user_string(ptr as usize, len as usize)? else {
        return Ok(());
    };
    let target = Task::get_or_self(tid, &ctx.task)?;
    *target.name.lock() = name;
    Ok(())
}

fn sys_configure_system(ctx: &mut Ctx, kind: u64, arg1: u64, _arg2: u64) -> KernResult<()> {
    match kind {
        SYS_CONF_LAPIC => {
            ctx.value = conf_lapic(arg1);
            Ok(())
        }
        SYS_CONF_CPU => {
            ctx.value = crate::scheduler::this_cpu().map(|c| c.index as u64).unwrap_or(0);
            Ok(())
        }
        SYS_CONF_SLEEP10 => {
            crate::arch::x86_64::apic::pit_sleep_100us(arg1);
            Ok(())
        }
        SYS_CONF_INT_COMPLETE => {
            if !irq::vector_is_programmable(arg1) {
                return Err(SysError::OutOfRange);
            }
            conf_int_complete(arg1 as u8);
            Ok(())
        }
        _ => Err(SysError::NotImplemented),
    }
}

#[cfg(not(test))]
fn conf_lapic(op: u64) -> u64 {
    crate::arch::x86_64::apic::lapic_configure(op, 0)
}

#[cfg(test)]
fn conf_lapic(_op: u64) -> u64 {
    0
}

#[cfg(not(test))]
fn conf_int_complete(vector: u8) {
    crate::arch::x86_64::apic::complete_interrupt(vector);
}

#[cfg(test)]
fn conf_int_complete(_vector: u8) {}

fn sys_get_message_info(ctx: &mut Ctx, descr_ptr: u64, portno: u64, flags: u64) -> KernResult<()> {
    let port = ctx.receive_port(portno)?;
    if !port.owned_by(&ctx.task) {
        return Err(SysError::NoPermission);
    }

    let Some(descriptor) = port.head_descriptor() else {
        if flags & FLAG_NOBLOCK != 0 {
            return Err(SysError::NoMessages);
        }
        ctx.block_and_repeat(WaitRef::Port(Arc::downgrade(&port)));
        return Ok(());
    };

    ctx.put_user(descr_ptr as usize, as_bytes(&descriptor))?;
    Ok(())
}

fn sys_get_first_message(ctx: &mut Ctx, buf: u64, flags: u64, portno: u64) -> KernResult<()> {
    let port = ctx.receive_port(portno)?;
    if !port.owned_by(&ctx.task) {
        return Err(SysError::NoPermission);
    }

    let Some((_, _, payload)) = port.peek_front() else {
        return Err(SysError::NoMessages);
    };

    if !ctx.put_user(buf as usize, &payload)? {
        // Blocked faulting the buffer in; the queue is untouched and the
        // repeated syscall starts over.
        return Ok(());
    }

    if flags & MSG_ARG_NOPOP == 0 {
        port.pop_front();
    }
    Ok(())
}

fn sys_request_named_port(
    ctx: &mut Ctx,
    name_ptr: u64,
    len: u64,
    reply_portno: u64,
    _flags: u64,
) -> KernResult<()> {
    if len > 4096 {
        return Err(SysError::OutOfRange);
    }
    let Some(name) = ctx.take_user_string(name_ptr as usize, len as usize)? else {
        return Ok(());
    };
    let reply = Port::get(reply_portno)?;
    named_port::request_named_port(name, reply)
}

fn sys_send_message_port(ctx: &mut Ctx, portno: u64, size: u64, msg_ptr: u64) -> KernResult<()> {
    let Some(payload) = ctx.take_user(msg_ptr as usize, size as usize)? else {
        return Ok(());
    };
    let port = ctx.receive_port(portno)?;
    port.send(ctx.task.id, 0, payload)
}

fn sys_create_port(ctx: &mut Ctx, owner: u64) -> KernResult<()> {
    let owner = Task::get_or_self(owner, &ctx.task)?;
    ctx.value = Port::create(&owner)?.id();
    Ok(())
}

fn sys_set_attribute(ctx: &mut Ctx, tid: u64, attribute: u64, value: u64) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    let is_self = target.id == ctx.task.id;
    if !is_self && target.status() == TaskStatus::Running {
        return Err(SysError::NoPermission);
    }

    match attribute {
        ATTR_ALLOW_PORT_IO => {
            target.attrs.lock().allow_port_io = value != 0;
            let iopl = if value != 0 { 3u64 << 12 } else { 0 };
            if is_self {
                ctx.frame.rflags = (ctx.frame.rflags & !(3 << 12)) | iopl;
            } else {
                let mut regs = target.regs.lock();
                regs.rflags = (regs.rflags & !(3 << 12)) | iopl;
            }
            Ok(())
        }
        ATTR_DEBUG_SYSCALLS => {
            target.attrs.lock().debug_syscalls = value != 0;
            Ok(())
        }
        _ => Err(SysError::NotImplemented),
    }
}

fn sys_set_interrupt(_ctx: &mut Ctx, portno: u64, intno: u64, flags: u64) -> KernResult<()> {
    let port = Port::get(portno)?;
    irq::set_interrupt(&port, intno, flags)
}

fn sys_name_port(ctx: &mut Ctx, portno: u64, name_ptr: u64, len: u64) -> KernResult<()> {
    if len > 4096 {
        return Err(SysError::OutOfRange);
    }
    let Some(name) = ctx.take_user_string(name_ptr as usize, len as usize)? else {
        return Ok(());
    };
    let port = Port::get(portno)?;
    named_port::name_port(&port, name)
}

fn sys_get_port_by_name(ctx: &mut Ctx, name_ptr: u64, len: u64, flags: u64) -> KernResult<()> {
    if len > 4096 {
        return Err(SysError::OutOfRange);
    }
    let Some(name) = ctx.take_user_string(name_ptr as usize, len as usize)? else {
        return Ok(());
    };

    match named_port::get_port_by_name(&ctx.task, name, flags & FLAG_NOBLOCK != 0)? {
        NameLookup::Resolved(portno) => {
            ctx.value = portno;
            Ok(())
        }
        NameLookup::MustBlock(desc) => {
            ctx.block_and_repeat(WaitRef::NamedPort(Arc::downgrade(&desc)));
            Ok(())
        }
    }
}

fn sys_set_log_port(_ctx: &mut Ctx, portno: u64, _flags: u64) -> KernResult<()> {
    let port = Port::get(portno)?;
    crate::debug::set_log_port(Arc::downgrade(&port));
    Ok(())
}

fn sys_get_page_table(ctx: &mut Ctx, tid: u64) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    ctx.value = target.space()?.id;
    Ok(())
}

fn sys_create_mem_object(ctx: &mut Ctx, size: u64, _flags: u64, pager_portno: u64) -> KernResult<()> {
    if size % PAGE_SIZE as u64 != 0 {
        return Err(SysError::Unaligned);
    }
    if size == 0 {
        return Err(SysError::OutOfRange);
    }
    let pager = if pager_portno != 0 {
        Some(Arc::downgrade(&Port::get(pager_portno)?))
    } else {
        None
    };
    let object = MemObject::create(PAGE_SIZE_LOG, (size / PAGE_SIZE as u64) as usize, pager);
    // Pin to the creator's space so the object survives until mapped.
    ctx.space()?.pin_mem_object(object.clone());
    ctx.value = object.id();
    Ok(())
}

fn sys_transfer_region(
    ctx: &mut Ctx,
    to_page_table: u64,
    region: u64,
    dest_hint: u64,
    flags: u64,
) -> KernResult<()> {
    let src = ctx.space()?;
    let dst = AddressSpace::get(to_page_table)?;
    let access = RegionFlags::from_bits_truncate(flags);
    ctx.value = src.transfer_region(&dst, region as usize, dest_hint as usize, access)? as u64;
    Ok(())
}

fn sys_create_normal_region(
    ctx: &mut Ctx,
    tid: u64,
    addr_hint: u64,
    size: u64,
    access: u64,
) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    let start = target.space()?.create_normal_region(
        addr_hint as usize,
        size as usize,
        RegionFlags::from_bits_truncate(access),
        String::new(),
        false,
    )?;
    ctx.value = start as u64;
    Ok(())
}

fn sys_create_phys_map_region(
    ctx: &mut Ctx,
    tid: u64,
    addr_hint: u64,
    size: u64,
    access: u64,
    phys_addr: u64,
) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    let start = target.space()?.create_phys_region(
        addr_hint as usize,
        size as usize,
        RegionFlags::from_bits_truncate(access),
        String::new(),
        phys_addr as usize,
    )?;
    ctx.value = start as u64;
    Ok(())
}

fn sys_delete_region(ctx: &mut Ctx, region_start: u64) -> KernResult<()> {
    ctx.space()?.delete_region(region_start as usize)
}

fn sys_map_mem_object(
    ctx: &mut Ctx,
    addr_hint: u64,
    size: u64,
    access: u64,
    object_id: u64,
    offset: u64,
) -> KernResult<()> {
    let object = MemObject::get(object_id)?;
    let start = ctx.space()?.map_mem_object(
        addr_hint as usize,
        size as usize,
        RegionFlags::from_bits_truncate(access),
        String::new(),
        object,
        offset as usize,
    )?;
    ctx.value = start as u64;
    Ok(())
}

fn sys_provide_page(ctx: &mut Ctx, object_id: u64, offset: u64, src_vaddr: u64) -> KernResult<()> {
    if offset % PAGE_SIZE as u64 != 0 || src_vaddr % PAGE_SIZE as u64 != 0 {
        return Err(SysError::Unaligned);
    }
    let object = MemObject::get(object_id)?;
    let space = ctx.space()?;

    // The donated page must be present before it can move.
    if !space.prepare_user_page(&ctx.task, src_vaddr as usize, true)? {
        ctx.block_on_page();
        return Ok(());
    }

    let frame = space.take_page(src_vaddr as usize)?;
    let index = (offset >> PAGE_SIZE_LOG) as usize;
    match object.provide_frame(index, frame) {
        Ok(woken) => {
            for task in woken {
                crate::scheduler::wake(&task);
            }
            Ok(())
        }
        Err(e) => {
            // The slot was occupied or out of range; the frame has
            // nowhere to go but back to the allocator.
            unsafe { crate::memory::dealloc_frame(frame) };
            Err(e)
        }
    }
}

/// Cross-task register access requires the target to be parked; a
/// Running or Ready target would race its own state. Self is always
/// allowed.
fn register_target(ctx: &Ctx, tid: u64) -> KernResult<(Arc<Task>, bool)> {
    let target = Task::get_or_self(tid, &ctx.task)?;
    let is_self = target.id == ctx.task.id;
    if !is_self && matches!(target.status(), TaskStatus::Running | TaskStatus::Ready) {
        return Err(SysError::NoPermission);
    }
    Ok((target, is_self))
}

fn sys_get_segment(ctx: &mut Ctx, tid: u64, which: u64, ptr: u64) -> KernResult<()> {
    let (target, is_self) = register_target(ctx, tid)?;
    if is_self {
        crate::arch::x86_64::segments_save(&target);
    }

    match which {
        SEGMENT_FS => ctx.value = target.segs.lock().fs,
        SEGMENT_GS => ctx.value = target.segs.lock().gs,
        GENERAL_REGS => {
            let image = if is_self {
                *ctx.frame
            } else {
                *target.regs.lock()
            };
            ctx.put_user(ptr as usize, as_bytes(&image))?;
        }
        _ => return Err(SysError::OutOfRange),
    }
    Ok(())
}

fn sys_set_segment(ctx: &mut Ctx, tid: u64, which: u64, value: u64) -> KernResult<()> {
    let (target, is_self) = register_target(ctx, tid)?;

    match which {
        SEGMENT_FS => target.segs.lock().fs = value,
        SEGMENT_GS => target.segs.lock().gs = value,
        GENERAL_REGS => {
            let Some(bytes) =
                ctx.take_user(value as usize, core::mem::size_of::<TrapFrame>())?
            else {
                return Ok(());
            };
            let mut image = TrapFrame::new();
            // Safety: TrapFrame is repr(C) plain data and the length
            // matches.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    &mut image as *mut TrapFrame as *mut u8,
                    bytes.len(),
                );
            }
            let reference = if is_self {
                *ctx.frame
            } else {
                *target.regs.lock()
            };
            // Privileged fields never come from user images.
            image.cs = reference.cs;
            image.ss = reference.ss;
            // Arithmetic and direction flags only (CF PF AF ZF SF DF OF).
            image.rflags = (reference.rflags & !0xcd5) | (image.rflags & 0xcd5);
            if is_self {
                *ctx.frame = image;
                // The dispatcher's status/value writes are exactly what
                // the caller asked to replace.
                ctx.switched = true;
            } else {
                *target.regs.lock() = image;
            }
            return Ok(());
        }
        _ => return Err(SysError::OutOfRange),
    }
    if is_self {
        crate::arch::x86_64::segments_restore(&target);
    }
    Ok(())
}

fn sys_asign_page_table(ctx: &mut Ctx, tid: u64, page_table: u64, flags: u64) -> KernResult<()> {
    let target = Task::get_or_self(tid, &ctx.task)?;

    let space = match flags {
        PAGE_TABLE_CREATE => AddressSpace::new()?,
        PAGE_TABLE_ASIGN => {
            if page_table == thallium_abi::PAGE_TABLE_SELF {
                ctx.space()?
            } else {
                AddressSpace::get(page_table)?
            }
        }
        PAGE_TABLE_CLONE => {
            let base = if page_table == thallium_abi::PAGE_TABLE_SELF {
                ctx.space()?
            } else {
                AddressSpace::get(page_table)?
            };
            base.clone_space()?
        }
        _ => return Err(SysError::NotSupported),
    };

    target.attach_space(space.clone())?;
    ctx.value = space.id;
    Ok(())
}

fn sys_set_notify_mask(ctx: &mut Ctx, group: u64, portno: u64, mask: u64) -> KernResult<()> {
    let group = TaskGroup::get(group)?;
    let port = Port::get(portno)?;
    let mask = GroupNotifierMask::from_bits_truncate(mask);
    ctx.value = group.change_notifier_mask(&port, mask);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The dispatcher itself is exercised through the object layers; what
    // is pinned here is the table's error surface.

    fn ctx_frame() -> TrapFrame {
        TrapFrame::new()
    }

    #[test]
    fn unknown_call_reports_not_supported() {
        let task = Task::create_for_tests();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task,
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        assert!(matches!(
            run(&mut ctx, 99, [0; 5]),
            Err(SysError::NotSupported)
        ));
        assert!(matches!(
            run(&mut ctx, SYSCALL_TABLE_SIZE, [0; 5]),
            Err(SysError::NotSupported)
        ));
    }

    #[test]
    fn getpid_returns_task_id() {
        let task = Task::create_for_tests();
        let id = task.id;
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task,
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        run(&mut ctx, SYSCALL_GETPID, [0; 5]).unwrap();
        assert_eq!(ctx.value, id);
    }

    #[test]
    fn start_process_demands_a_page_table() {
        let _serial = crate::scheduler::TEST_QUEUE_LOCK.lock();
        crate::scheduler::init_for_tests(2);
        crate::memory::test_support::init_test_frames();
        let caller = Task::create_for_tests();
        let target = Task::create(3).unwrap();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: caller,
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        assert!(matches!(
            run(&mut ctx, SYSCALL_START_PROCESS, [target.id, 0x400000, 0, 0, 0]),
            Err(SysError::HasNoPageTable)
        ));

        let space = AddressSpace::new().unwrap();
        target.attach_space(space).unwrap();
        run(&mut ctx, SYSCALL_START_PROCESS, [target.id, 0x400000, 7, 8, 9]).unwrap();
        {
            let regs = target.regs.lock();
            assert_eq!(regs.rip, 0x400000);
            assert_eq!((regs.rdi, regs.rsi, regs.rdx), (7, 8, 9));
        }

        // A started process cannot be started again.
        assert!(matches!(
            run(&mut ctx, SYSCALL_START_PROCESS, [target.id, 0x400000, 0, 0, 0]),
            Err(SysError::ProcessInited)
        ));
        target.kill();
    }

    #[test]
    fn asign_page_table_flavors() {
        crate::memory::test_support::init_test_frames();
        let caller = Task::create_for_tests();
        let caller_space = AddressSpace::new().unwrap();
        caller.attach_space(caller_space.clone()).unwrap();

        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: caller.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        // Share the caller's space with a thread.
        let thread = Task::create(3).unwrap();
        run(
            &mut ctx,
            SYSCALL_ASIGN_PAGE_TABLE,
            [thread.id, 0, PAGE_TABLE_ASIGN, 0, 0],
        )
        .unwrap();
        assert_eq!(ctx.value, caller_space.id);

        // Fresh table for another task.
        let fresh = Task::create(3).unwrap();
        run(
            &mut ctx,
            SYSCALL_ASIGN_PAGE_TABLE,
            [fresh.id, 0, PAGE_TABLE_CREATE, 0, 0],
        )
        .unwrap();
        assert_ne!(ctx.value, caller_space.id);

        // Unknown flavor.
        let other = Task::create(3).unwrap();
        assert!(matches!(
            run(&mut ctx, SYSCALL_ASIGN_PAGE_TABLE, [other.id, 0, 9, 0, 0]),
            Err(SysError::NotSupported)
        ));

        thread.kill();
        fresh.kill();
        other.kill();
    }

    #[test]
    fn get_message_info_noblock_on_empty_port() {
        let task = Task::create_for_tests();
        let port = Port::create(&task).unwrap();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        assert!(matches!(
            run(
                &mut ctx,
                SYSCALL_GET_MESSAGE_INFO,
                [0x400000, port.id(), FLAG_NOBLOCK, 0, 0]
            ),
            Err(SysError::NoMessages)
        ));
        port.destroy();
    }

    #[test]
    fn receive_requires_ownership() {
        let owner = Task::create_for_tests();
        let stranger = Task::create_for_tests();
        let port = Port::create(&owner).unwrap();
        port.send(1, 0, alloc::vec![1, 2]).unwrap();

        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: stranger,
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        assert!(matches!(
            run(
                &mut ctx,
                SYSCALL_GET_MESSAGE_INFO,
                [0x400000, port.id(), FLAG_NOBLOCK, 0, 0]
            ),
            Err(SysError::NoPermission)
        ));
        port.destroy();
    }

    fn task_with_space() -> Arc<Task> {
        crate::memory::test_support::init_test_frames();
        let task = Task::create_for_tests();
        let space = AddressSpace::new().unwrap();
        space.attach_task(&task);
        *task.space.lock() = Some(space);
        task
    }

    #[test]
    fn message_flow_through_the_table() {
        let _mem = crate::memory::test_support::frame_lock();
        let task = task_with_space();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        // A buffer region for payloads and descriptors.
        run(
            &mut ctx,
            SYSCALL_CREATE_NORMAL_REGION,
            [0, 0x400000, 0x1000, 0x03, 0],
        )
        .unwrap();
        let buf = ctx.value;

        run(&mut ctx, SYSCALL_CREATE_PORT, [0, 0, 0, 0, 0]).unwrap();
        let portno = ctx.value;

        // Send two bytes from the buffer; the lazy page faults in during
        // the user copy.
        run(&mut ctx, SYSCALL_SEND_MESSAGE_PORT, [portno, 2, buf, 0, 0]).unwrap();
        assert!(!ctx.switched);

        // Descriptor fetch succeeds and does not pop.
        run(
            &mut ctx,
            SYSCALL_GET_MESSAGE_INFO,
            [buf, portno, FLAG_NOBLOCK, 0, 0],
        )
        .unwrap();
        let port = Port::get(portno).unwrap();
        assert_eq!(port.queue_len(), 1);
        let d = port.head_descriptor().unwrap();
        assert_eq!(d.sender, task.id);
        assert_eq!(d.size, 2);

        // Peeking with NOPOP leaves it; the plain read pops it.
        run(
            &mut ctx,
            SYSCALL_GET_FIRST_MESSAGE,
            [buf, MSG_ARG_NOPOP, portno, 0, 0],
        )
        .unwrap();
        assert_eq!(port.queue_len(), 1);
        run(&mut ctx, SYSCALL_GET_FIRST_MESSAGE, [buf, 0, portno, 0, 0]).unwrap();
        assert_eq!(port.queue_len(), 0);
        assert!(matches!(
            run(&mut ctx, SYSCALL_GET_FIRST_MESSAGE, [buf, 0, portno, 0, 0]),
            Err(SysError::NoMessages)
        ));
        port.destroy();
    }

    #[test]
    fn region_lifecycle_through_the_table() {
        let _mem = crate::memory::test_support::frame_lock();
        let task = task_with_space();
        let space = task.space().unwrap();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        let frames_before = crate::memory::free_frames();

        // Unaligned requests are rejected outright.
        assert!(matches!(
            run(
                &mut ctx,
                SYSCALL_CREATE_NORMAL_REGION,
                [0, 0x400800, 0x1000, 0x03, 0]
            ),
            Err(SysError::Unaligned)
        ));

        run(
            &mut ctx,
            SYSCALL_CREATE_NORMAL_REGION,
            [0, 0x400000, 0x2000, 0x03, 0],
        )
        .unwrap();
        let start = ctx.value as usize;

        // Touch both pages, then tear the region down: the allocator is
        // back to its starting point.
        space
            .handle_page_fault(&task, start + 0xfff, RegionFlags::WRITE)
            .unwrap();
        space
            .handle_page_fault(&task, start + 0x1000, RegionFlags::WRITE)
            .unwrap();
        assert_eq!(crate::memory::free_frames(), frames_before - 2);

        run(&mut ctx, SYSCALL_DELETE_REGION, [start as u64, 0, 0, 0, 0]).unwrap();
        assert_eq!(crate::memory::free_frames(), frames_before);
        assert!(matches!(
            run(&mut ctx, SYSCALL_DELETE_REGION, [start as u64, 0, 0, 0, 0]),
            Err(SysError::RegionDoesntExist)
        ));
    }

    #[test]
    fn mem_object_flow_through_the_table() {
        let _mem = crate::memory::test_support::frame_lock();
        let task = task_with_space();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        run(
            &mut ctx,
            SYSCALL_CREATE_MEM_OBJECT,
            [2 * PAGE_SIZE as u64, 0, 0, 0, 0],
        )
        .unwrap();
        let object_id = ctx.value;

        run(
            &mut ctx,
            SYSCALL_MAP_MEM_OBJECT,
            [0x700000, 0x2000, 0x03, object_id, 0],
        )
        .unwrap();
        assert_eq!(ctx.value, 0x700000);

        // Mapping past the object's end is out of range.
        assert!(matches!(
            run(
                &mut ctx,
                SYSCALL_MAP_MEM_OBJECT,
                [0x800000, 0x2000, 0x03, object_id, PAGE_SIZE as u64]
            ),
            Err(SysError::OutOfRange)
        ));

        // Donate a page from a normal region into the object.
        run(
            &mut ctx,
            SYSCALL_CREATE_NORMAL_REGION,
            [0, 0x400000, 0x1000, 0x03, 0],
        )
        .unwrap();
        let donor = ctx.value;
        let space = task.space().unwrap();
        space
            .handle_page_fault(&task, donor as usize, RegionFlags::WRITE)
            .unwrap();

        run(&mut ctx, SYSCALL_PROVIDE_PAGE, [object_id, 0, donor, 0, 0]).unwrap();
        let object = MemObject::get(object_id).unwrap();
        assert!(object.frame_at(0).is_some());

        // The slot is taken now; a second donation bounces.
        space
            .handle_page_fault(&task, donor as usize, RegionFlags::WRITE)
            .unwrap();
        assert!(matches!(
            run(&mut ctx, SYSCALL_PROVIDE_PAGE, [object_id, 0, donor, 0, 0]),
            Err(SysError::PagePresent)
        ));
    }

    #[test]
    fn init_stack_reserves_a_grow_down_region() {
        let _mem = crate::memory::test_support::frame_lock();
        let task = task_with_space();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        run(&mut ctx, SYSCALL_INIT_STACK, [0, 0, 0, 0, 0]).unwrap();
        let top = ctx.value;
        assert!(top > 0);
        assert_eq!(task.regs.lock().rsp, top);

        // The reserved region sits just below the returned top and
        // faults lazily downward.
        let space = task.space().unwrap();
        space
            .handle_page_fault(&task, (top - 8) as usize, RegionFlags::WRITE)
            .unwrap();

        // An explicit top skips the reservation.
        let other = Task::create(3).unwrap();
        other
            .attach_space(AddressSpace::new().unwrap())
            .unwrap();
        run(&mut ctx, SYSCALL_INIT_STACK, [other.id, 0x500000, 0, 0, 0]).unwrap();
        assert_eq!(ctx.value, 0x500000);
        assert_eq!(other.regs.lock().rsp, 0x500000);
        other.kill();
    }

    #[test]
    fn attribute_errors_and_effects() {
        let task = task_with_space();
        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };

        assert!(matches!(
            run(&mut ctx, SYSCALL_SET_ATTRIBUTE, [0, 99, 1, 0, 0]),
            Err(SysError::NotImplemented)
        ));

        run(&mut ctx, SYSCALL_SET_ATTRIBUTE, [0, ATTR_ALLOW_PORT_IO, 1, 0, 0]).unwrap();
        assert!(task.attrs.lock().allow_port_io);
        assert_eq!(frame.rflags & (3 << 12), 3 << 12);

        let mut ctx = Ctx {
            task: task.clone(),
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        run(&mut ctx, SYSCALL_SET_ATTRIBUTE, [0, ATTR_ALLOW_PORT_IO, 0, 0, 0]).unwrap();
        assert_eq!(frame.rflags & (3 << 12), 0);
    }

    #[test]
    fn notify_mask_roundtrip_via_table() {
        let caller = Task::create_for_tests();
        let port = Port::create(&caller).unwrap();
        let group = TaskGroup::create();

        let mut frame = ctx_frame();
        let mut ctx = Ctx {
            task: caller,
            frame: &mut frame,
            value: 0,
            switched: false,
        };
        run(
            &mut ctx,
            SYSCALL_SET_NOTIFY_MASK,
            [group.id(), port.id(), 0x02, 0, 0],
        )
        .unwrap();
        assert_eq!(ctx.value, 0, "previous mask was empty");

        run(
            &mut ctx,
            SYSCALL_SET_NOTIFY_MASK,
            [group.id(), port.id(), 0x07, 0, 0],
        )
        .unwrap();
        assert_eq!(ctx.value, 0x02, "old mask is returned");
        port.destroy();
    }
}

//! Syscall numbers.
//!
//! The kernel dispatches through a fixed table indexed by these values.
//! The call number travels in `rdi`, up to five arguments in
//! `rsi rdx rcx r8 r9`; the status comes back in `rax` and the value in
//! `rdx`.

/// Software interrupt vector used for the syscall gate.
pub const SYSCALL_INT_VECTOR: u8 = 0xf8;

pub const SYSCALL_EXIT: u64 = 0;
pub const SYSCALL_GETPID: u64 = 1;
pub const SYSCALL_CREATE_PROCESS: u64 = 2;
pub const SYSCALL_START_PROCESS: u64 = 3;
pub const SYSCALL_INIT_STACK: u64 = 4;
pub const SYSCALL_SET_PRIORITY: u64 = 5;
pub const SYSCALL_SET_TASK_NAME: u64 = 6;
pub const SYSCALL_GET_LAPIC_ID: u64 = 7;
pub const SYSCALL_CONFIGURE_SYSTEM: u64 = 8;
pub const SYSCALL_GET_MESSAGE_INFO: u64 = 9;
pub const SYSCALL_GET_FIRST_MESSAGE: u64 = 10;
pub const SYSCALL_REQUEST_NAMED_PORT: u64 = 11;
pub const SYSCALL_SEND_MESSAGE_PORT: u64 = 12;
pub const SYSCALL_CREATE_PORT: u64 = 13;
pub const SYSCALL_SET_ATTRIBUTE: u64 = 14;
pub const SYSCALL_SET_INTERRUPT: u64 = 15;
pub const SYSCALL_NAME_PORT: u64 = 16;
pub const SYSCALL_GET_PORT_BY_NAME: u64 = 17;
pub const SYSCALL_SET_LOG_PORT: u64 = 18;
pub const SYSCALL_GET_PAGE_TABLE: u64 = 19;
pub const SYSCALL_CREATE_MEM_OBJECT: u64 = 20;
pub const SYSCALL_TRANSFER_REGION: u64 = 21;
pub const SYSCALL_CREATE_NORMAL_REGION: u64 = 22;
pub const SYSCALL_GET_SEGMENT: u64 = 23;
pub const SYSCALL_CREATE_PHYS_MAP_REGION: u64 = 24;
pub const SYSCALL_DELETE_REGION: u64 = 25;
pub const SYSCALL_MAP_MEM_OBJECT: u64 = 26;
pub const SYSCALL_PROVIDE_PAGE: u64 = 27;
pub const SYSCALL_SET_SEGMENT: u64 = 28;
pub const SYSCALL_ASIGN_PAGE_TABLE: u64 = 29;
pub const SYSCALL_SET_NOTIFY_MASK: u64 = 30;
pub const SYSCALL_CREATE_TASK_GROUP: u64 = 31;
pub const SYSCALL_ADD_TO_TASK_GROUP: u64 = 32;
pub const SYSCALL_REMOVE_FROM_TASK_GROUP: u64 = 33;
pub const SYSCALL_IS_IN_TASK_GROUP: u64 = 34;

/// One past the highest dispatchable call number.
pub const SYSCALL_TABLE_SIZE: u64 = 35;

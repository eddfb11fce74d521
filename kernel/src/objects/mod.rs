//! Kernel objects
//!
//! The nouns of the kernel: tasks, ports, named ports, task groups and
//! interrupt bindings. Reference counting rules:
//!
//! - the global task table owns tasks; queues and CPU slots add strong
//!   references while they hold one
//! - tasks own their ports strongly through the global port table; a port
//!   refers to its owner weakly
//! - a blocked task refers to whatever it waits on weakly (the wait must
//!   never keep the object alive)
//! - groups hold members weakly, members hold groups strongly

pub mod irq;
pub mod named_port;
pub mod port;
pub mod task;
pub mod task_group;

#[cfg(test)]
mod tests;

pub use port::{Message, Port};
pub use task::{Task, TaskKind, TaskStatus, WaitRef};
pub use task_group::TaskGroup;

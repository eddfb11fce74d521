//! Checked user-memory access
//!
//! Syscalls never touch user pointers directly: every transfer walks the
//! range page by page, faulting pages in through the owning address space
//! first. A page that cannot be made present without a pager leaves the
//! task blocked and the syscall repeats from the top once the page
//! arrives, so the copy helpers report "blocked" instead of failing.
//!
//! The kernel always runs on the faulting task's page tables, so once a
//! page is prepared the transfer is a plain memory copy.

use crate::memory::address::{PAGE_SIZE, USER_MAX};
use crate::memory::page_table::AddressSpace;
use crate::objects::task::Task;
use crate::KernResult;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use thallium_abi::SysError;

/// Outcome of a user-memory transfer attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopy {
    /// The transfer completed.
    Done,
    /// The task blocked faulting a page in; repeat the syscall on wake.
    Blocked,
}

fn check_range(addr: usize, len: usize) -> KernResult<()> {
    let end = addr.checked_add(len).ok_or(SysError::OutOfRange)?;
    if len == 0 {
        return Ok(());
    }
    if addr == 0 || end > USER_MAX {
        return Err(SysError::OutOfRange);
    }
    Ok(())
}

/// Make every page of `[addr, addr + len)` present with the required
/// access. Returns `Ok(false)` if the task blocked partway.
pub fn prepare_user_range(
    space: &Arc<AddressSpace>,
    task: &Arc<Task>,
    addr: usize,
    len: usize,
    write: bool,
) -> KernResult<bool> {
    check_range(addr, len)?;
    if len == 0 {
        return Ok(true);
    }
    let mut page = addr & !(PAGE_SIZE - 1);
    let end = addr + len;
    while page < end {
        if !space.prepare_user_page(task, page, write)? {
            return Ok(false);
        }
        page += PAGE_SIZE;
    }
    Ok(true)
}

/// Copy bytes out of user memory into a kernel buffer.
pub fn copy_from_user(
    space: &Arc<AddressSpace>,
    task: &Arc<Task>,
    src: usize,
    buf: &mut [u8],
) -> KernResult<UserCopy> {
    if !prepare_user_range(space, task, src, buf.len(), false)? {
        return Ok(UserCopy::Blocked);
    }
    raw_copy_in(src, buf);
    Ok(UserCopy::Done)
}

/// Copy kernel bytes into user memory.
pub fn copy_to_user(
    space: &Arc<AddressSpace>,
    task: &Arc<Task>,
    dst: usize,
    bytes: &[u8],
) -> KernResult<UserCopy> {
    if !prepare_user_range(space, task, dst, bytes.len(), true)? {
        return Ok(UserCopy::Blocked);
    }
    raw_copy_out(dst, bytes);
    Ok(UserCopy::Done)
}

/// Read a user buffer into a fresh kernel vector.
pub fn read_user_bytes(
    space: &Arc<AddressSpace>,
    task: &Arc<Task>,
    src: usize,
    len: usize,
) -> KernResult<Option<Vec<u8>>> {
    let mut buf = vec![0u8; len];
    match copy_from_user(space, task, src, &mut buf)? {
        UserCopy::Done => Ok(Some(buf)),
        UserCopy::Blocked => Ok(None),
    }
}

/// Read a UTF-8 string of `len` bytes from user memory.
pub fn read_user_string(
    space: &Arc<AddressSpace>,
    task: &Arc<Task>,
    src: usize,
    len: usize,
) -> KernResult<Option<String>> {
    match read_user_bytes(space, task, src, len)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| SysError::General),
        None => Ok(None),
    }
}

#[cfg(not(test))]
fn raw_copy_in(src: usize, buf: &mut [u8]) {
    // Safety: the range was prepared above and the kernel runs on the
    // owning task's page tables.
    unsafe { core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len()) };
}

#[cfg(not(test))]
fn raw_copy_out(dst: usize, bytes: &[u8]) {
    // Safety: as above, and the range was prepared writable.
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), dst as *mut u8, bytes.len()) };
}

// Host tests model page presence, not page contents.
#[cfg(test)]
fn raw_copy_in(_src: usize, _buf: &mut [u8]) {}
#[cfg(test)]
fn raw_copy_out(_dst: usize, _bytes: &[u8]) {}

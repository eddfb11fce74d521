//! Kernel error codes.
//!
//! Negative values returned in the status register of a syscall. The
//! numbering is part of the ABI and must not change between releases.

/// Error returned by a failed syscall.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysError {
    /// The operation is recognized but not supported by this kernel.
    NotSupported = -1,
    /// The operation is planned but not implemented.
    NotImplemented = -2,
    /// The caller does not own or have rights to the target object.
    NoPermission = -3,
    /// A numeric argument is outside the accepted range.
    OutOfRange = -4,
    /// An address or size argument is not page aligned.
    Unaligned = -5,
    /// A page or region already occupies the requested range.
    PagePresent = -6,
    /// Unclassified failure.
    General = -7,
    /// The kernel could not allocate memory.
    OutOfMemory = -8,
    /// The range is covered by a huge page and cannot be split.
    HugePage = -9,
    /// The page has not been allocated.
    PageNotAllocated = -10,
    /// The page is not present in the page table.
    PageNotPresent = -11,
    /// The page exists but has the wrong kind for the operation.
    WrongPageType = -12,
    /// The task is already blocked.
    AlreadyBlocked = -13,
    /// No task with the given id exists.
    NoSuchProcess = -14,
    /// The task has left the Uninit state and cannot be reconfigured.
    ProcessInited = -15,
    /// The port's message queue is empty.
    NoMessages = -16,
    /// No port with the given number exists.
    PortDoesntExist = -17,
    /// The port exists but its owner is gone.
    PortClosed = -18,
    /// A name or membership already exists.
    NameExists = -19,
    /// The task has no page table attached.
    HasNoPageTable = -20,
    /// No memory object with the given id exists.
    ObjectDoesntExist = -21,
    /// No region contains the given address.
    RegionDoesntExist = -22,
}

impl SysError {
    /// Recover an error from a raw status register value.
    pub fn from_status(status: i64) -> Option<Self> {
        Some(match status {
            -1 => Self::NotSupported,
            -2 => Self::NotImplemented,
            -3 => Self::NoPermission,
            -4 => Self::OutOfRange,
            -5 => Self::Unaligned,
            -6 => Self::PagePresent,
            -7 => Self::General,
            -8 => Self::OutOfMemory,
            -9 => Self::HugePage,
            -10 => Self::PageNotAllocated,
            -11 => Self::PageNotPresent,
            -12 => Self::WrongPageType,
            -13 => Self::AlreadyBlocked,
            -14 => Self::NoSuchProcess,
            -15 => Self::ProcessInited,
            -16 => Self::NoMessages,
            -17 => Self::PortDoesntExist,
            -18 => Self::PortClosed,
            -19 => Self::NameExists,
            -20 => Self::HasNoPageTable,
            -21 => Self::ObjectDoesntExist,
            -22 => Self::RegionDoesntExist,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        for status in -22..=-1i64 {
            let e = SysError::from_status(status).unwrap();
            assert_eq!(e as i64, status);
        }
        assert!(SysError::from_status(0).is_none());
        assert!(SysError::from_status(-23).is_none());
        assert!(SysError::from_status(1).is_none());
    }
}

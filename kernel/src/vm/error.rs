use core::error::Error;
use core::fmt::{self, Display, Formatter};

/// A page fault that cannot be resolved. The faulting process is expected to
/// be terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The address lies in kernel space.
    KernelAddress,
    /// No page is registered at the address.
    NotPresent,
    /// Write to a page registered read-only.
    WriteToReadOnly,
    /// The page is already mapped; the fault was not a missing-page fault.
    AlreadyResident,
    /// The backing file ended before the page's bytes could be read.
    ShortRead { expected: usize, read: usize },
    /// The hardware mapping could not be installed.
    MappingFailed,
}

impl Display for FaultError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FaultError::KernelAddress => write!(f, "fault on kernel address"),
            FaultError::NotPresent => write!(f, "no page registered at fault address"),
            FaultError::WriteToReadOnly => write!(f, "write to read-only page"),
            FaultError::AlreadyResident => write!(f, "page is already resident"),
            FaultError::ShortRead { expected, read } => {
                write!(f, "short read: expected {expected} bytes, read {read}")
            }
            FaultError::MappingFailed => write!(f, "failed to install page mapping"),
        }
    }
}

impl Error for FaultError {}

/// Rejected page registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageError {
    /// A page is already registered at the address.
    AlreadyRegistered,
    /// The address lies in kernel space.
    KernelAddress,
    /// The segment's sizes or alignment do not describe whole pages.
    BadSegment,
}

impl Display for PageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PageError::AlreadyRegistered => write!(f, "page already registered"),
            PageError::KernelAddress => write!(f, "page in kernel space"),
            PageError::BadSegment => write!(f, "malformed segment"),
        }
    }
}

impl Error for PageError {}

pub type Result<T, E = PageError> = core::result::Result<T, E>;

//! Memory management: address spaces, the shared page pool, mappables.
//!
//! Every application address space is a MemoryManager: an interval map
//! from address ranges to mappings, demand-paged out of the process-wide
//! MemoryFile. Mappables are the page sources; the platform installs the
//! resulting (MemoryFile, offset) translations into hardware or host
//! page tables.

mod aio;
mod intervals;
mod manager;
mod mappable;
mod memory_file;

pub use aio::{AioContext, AioManager, NotifyChannel, PrepareError, AIO_RING_SIZE};
pub use intervals::{IntervalMap, IntervalValue};
pub use manager::{Brk, MMapOpts, MRemapOpts, MemoryManager, Vma, VmaFlags};
pub use mappable::{BusError, Mappable, SpecialMappable, Translation};
pub use memory_file::{AllocOpts, MemoryFile};

use crate::arch::PAGE_SIZE;
use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

/// A half-open range of application addresses.
pub type AddrRange = Range;

/// A half-open range of MemoryFile offsets.
pub type FileRange = Range;

#[derive(Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Range {
    pub start: u64,
    pub end: u64,
}

impl Range {
    pub fn new(start: u64, end: u64) -> Range {
        debug_assert!(start <= end, "inverted range {start:#x}..{end:#x}");
        Range { start, end }
    }

    pub fn with_length(start: u64, length: u64) -> Option<Range> {
        start.checked_add(length).map(|end| Range { start, end })
    }

    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_superset_of(&self, other: Range) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: Range) -> Range {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start >= end {
            Range { start, end: start }
        } else {
            Range { start, end }
        }
    }

    pub fn overlaps(&self, other: Range) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn offset(&self, delta: u64) -> Range {
        Range {
            start: self.start + delta,
            end: self.end + delta,
        }
    }

    pub fn is_page_aligned(&self) -> bool {
        self.start % PAGE_SIZE == 0 && self.end % PAGE_SIZE == 0
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end)
    }
}

bitflags! {
    /// Memory access permissions.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct AccessType: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

impl AccessType {
    pub const NO_ACCESS: AccessType = AccessType::empty();
    pub const ANY_ACCESS: AccessType = AccessType::all();
    pub const READ_WRITE: AccessType =
        AccessType::READ.union(AccessType::WRITE);

    pub fn supersets(&self, other: AccessType) -> bool {
        self.contains(other)
    }

    pub fn from_prot(prot: i32) -> AccessType {
        let mut at = AccessType::empty();
        if prot & libc::PROT_READ != 0 {
            at |= AccessType::READ;
        }
        if prot & libc::PROT_WRITE != 0 {
            at |= AccessType::WRITE;
        }
        if prot & libc::PROT_EXEC != 0 {
            at |= AccessType::EXECUTE;
        }
        at
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("address range {0:?} is not mapped")]
    NotMapped(AddrRange),

    #[error("no free address space for a mapping of {0:#x} bytes")]
    NoSpace(u64),

    #[error("access {access:?} exceeds permissions {allowed:?} at {range:?}")]
    AccessDenied {
        range: AddrRange,
        access: AccessType,
        allowed: AccessType,
    },

    #[error("memory file exhausted allocating {0:#x} bytes")]
    OutOfMemory(u64),

    #[error("offset {0:#x} is beyond the end of the mappable")]
    BusError(u64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoryError {
    /// The errno an application sees for this failure.
    pub fn to_errno(&self) -> i32 {
        match self {
            MemoryError::InvalidArgument => libc::EINVAL,
            MemoryError::NotMapped(_) => libc::EFAULT,
            MemoryError::NoSpace(_) => libc::ENOMEM,
            MemoryError::AccessDenied { .. } => libc::EACCES,
            MemoryError::OutOfMemory(_) => libc::ENOMEM,
            MemoryError::BusError(_) => libc::EFAULT,
            MemoryError::Io(_) => libc::EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_basics() {
        let r = Range::new(0x1000, 0x3000);
        assert_eq!(r.length(), 0x2000);
        assert!(r.contains(0x1000));
        assert!(!r.contains(0x3000));
        assert!(r.is_page_aligned());
        assert_eq!(
            r.intersect(Range::new(0x2000, 0x4000)),
            Range::new(0x2000, 0x3000)
        );
        assert!(r.intersect(Range::new(0x4000, 0x5000)).is_empty());
    }

    #[test]
    fn access_from_prot() {
        let at = AccessType::from_prot(libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(at, AccessType::READ_WRITE);
        assert!(at.supersets(AccessType::READ));
        assert!(!at.supersets(AccessType::EXECUTE));
    }
}

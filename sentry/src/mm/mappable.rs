//! Mappables: sources of pages for address-space mappings.

use super::{AccessType, AddrRange, FileRange, MemoryError, MemoryFile, Range};
use crate::usage::MemoryKind;
use std::sync::Arc;

/// One resolved piece of a translate call: `source` offsets within the
/// mappable are backed by MemoryFile pages starting at `file_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub source: Range,
    pub file_offset: u64,
    pub perms: AccessType,
}

/// An offset past the end of the mappable, reported as SIGBUS territory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusError {
    pub offset: u64,
}

/// A source of pages that can be mapped into address spaces.
///
/// `translate` must keep its translations valid while any mapping covers
/// them; the Add/Remove/Copy callbacks are how implementations track who
/// is mapping what.
pub trait Mappable: Send + Sync {
    /// Notifies the mappable of a new mapping of `ar` at `offset`.
    fn add_mapping(&self, ar: AddrRange, offset: u64, writable: bool) -> Result<(), MemoryError>;

    /// Undoes add_mapping.
    fn remove_mapping(&self, ar: AddrRange, offset: u64, writable: bool);

    /// Notifies the mappable that `src` was copied (fork, mremap) to
    /// `dst` in the same or another address space.
    fn copy_mapping(
        &self,
        src: AddrRange,
        dst: AddrRange,
        offset: u64,
        writable: bool,
    ) -> Result<(), MemoryError>;

    /// Resolves mappable offsets to MemoryFile ranges. Translations must
    /// cover at least `required`; `optional` may be covered
    /// opportunistically. A BusError is reported for offsets the mappable
    /// cannot back, alongside any translations that did resolve.
    fn translate(
        &self,
        required: Range,
        optional: Range,
        at: AccessType,
    ) -> (Vec<Translation>, Option<BusError>);

    /// Drops state that cannot survive a checkpoint.
    fn invalidate_unsavable(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    /// The name shown for this mapping in proc maps.
    fn mapped_name(&self) -> String;

    /// msync(2) against this mappable; only meaningful for file-backed
    /// implementations.
    fn msync(&self, _mr: Range) -> Result<(), MemoryError> {
        Err(MemoryError::InvalidArgument)
    }
}

/// A mappable backed by a fixed, preallocated MemoryFile range: vDSO
/// images, shared-anonymous memory, AIO rings. The range is freed when
/// the last reference drops.
pub struct SpecialMappable {
    mf: Arc<MemoryFile>,
    fr: FileRange,
    name: String,
}

impl SpecialMappable {
    /// Allocates `length` zeroed bytes and wraps them.
    pub fn new(
        mf: Arc<MemoryFile>,
        length: u64,
        kind: MemoryKind,
        name: &str,
    ) -> Result<Arc<SpecialMappable>, MemoryError> {
        let fr = mf.allocate(length, super::AllocOpts { kind, mem_cg_id: 0 })?;
        Ok(Arc::new(SpecialMappable {
            mf,
            fr,
            name: name.to_string(),
        }))
    }

    /// Shared anonymous memory (MAP_SHARED|MAP_ANONYMOUS); named the way
    /// proc maps names it.
    pub fn new_shared_anon(
        mf: Arc<MemoryFile>,
        length: u64,
    ) -> Result<Arc<SpecialMappable>, MemoryError> {
        SpecialMappable::new(mf, length, MemoryKind::Anonymous, "/dev/zero (deleted)")
    }

    pub fn file_range(&self) -> FileRange {
        self.fr
    }

    pub fn length(&self) -> u64 {
        self.fr.length()
    }

    pub fn memory_file(&self) -> &Arc<MemoryFile> {
        &self.mf
    }
}

impl Drop for SpecialMappable {
    fn drop(&mut self) {
        self.mf.dec_ref(self.fr);
    }
}

impl Mappable for SpecialMappable {
    fn add_mapping(&self, _ar: AddrRange, _offset: u64, _writable: bool) -> Result<(), MemoryError> {
        Ok(())
    }

    fn remove_mapping(&self, _ar: AddrRange, _offset: u64, _writable: bool) {}

    fn copy_mapping(
        &self,
        _src: AddrRange,
        _dst: AddrRange,
        _offset: u64,
        _writable: bool,
    ) -> Result<(), MemoryError> {
        Ok(())
    }

    fn translate(
        &self,
        required: Range,
        optional: Range,
        _at: AccessType,
    ) -> (Vec<Translation>, Option<BusError>) {
        let bus = (required.end > self.fr.length()).then(|| BusError {
            offset: self.fr.length(),
        });
        let source = optional.intersect(Range::new(0, self.fr.length()));
        if source.is_empty() {
            return (Vec::new(), bus);
        }
        (
            vec![Translation {
                source,
                file_offset: self.fr.start + source.start,
                perms: AccessType::ANY_ACCESS,
            }],
            bus,
        )
    }

    fn mapped_name(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{arch::PAGE_SIZE, usage::MemoryAccounting};

    fn new_mf() -> Arc<MemoryFile> {
        MemoryFile::new(Arc::new(MemoryAccounting::new())).unwrap()
    }

    #[test]
    fn translate_within_bounds() {
        let mf = new_mf();
        let sm = SpecialMappable::new_shared_anon(Arc::clone(&mf), 4 * PAGE_SIZE).unwrap();
        let (ts, bus) = sm.translate(
            Range::new(PAGE_SIZE, 2 * PAGE_SIZE),
            Range::new(0, 4 * PAGE_SIZE),
            AccessType::READ,
        );
        assert!(bus.is_none());
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].source, Range::new(0, 4 * PAGE_SIZE));
        assert_eq!(ts[0].file_offset, sm.file_range().start);
    }

    #[test]
    fn translate_past_end_is_bus_error() {
        let mf = new_mf();
        let sm = SpecialMappable::new_shared_anon(Arc::clone(&mf), PAGE_SIZE).unwrap();
        let (ts, bus) = sm.translate(
            Range::new(0, 2 * PAGE_SIZE),
            Range::new(0, 2 * PAGE_SIZE),
            AccessType::READ,
        );
        assert_eq!(bus, Some(BusError { offset: PAGE_SIZE }));
        // The reachable prefix still translates.
        assert_eq!(ts.len(), 1);
        assert_eq!(ts[0].source, Range::new(0, PAGE_SIZE));
    }

    #[test]
    fn drop_releases_pages() {
        let mf = new_mf();
        let sm = SpecialMappable::new_shared_anon(Arc::clone(&mf), PAGE_SIZE).unwrap();
        let fr = sm.file_range();
        assert!(mf.is_allocated(fr));
        drop(sm);
        assert!(!mf.is_allocated(fr));
    }
}

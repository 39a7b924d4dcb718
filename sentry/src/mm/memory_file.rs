//! The MemoryFile: the sentry's sole page allocator.
//!
//! All application memory comes out of one big memfd. Allocations are
//! page-granular file ranges with reference counts; a range stays valid
//! exactly as long as its count is positive, and freed ranges have their
//! pages punched out so the next allocation reads as zeros.

use super::{
    intervals::{IntervalMap, IntervalValue},
    FileRange, MemoryError,
};
use crate::{
    arch::{page_round_up, PAGE_SIZE},
    usage::{MemoryAccounting, MemoryKind},
};
use std::{
    fs::File,
    os::fd::{AsRawFd, RawFd},
    sync::{Arc, Mutex},
};

#[derive(Debug, Copy, Clone)]
pub struct AllocOpts {
    pub kind: MemoryKind,
    pub mem_cg_id: u32,
}

impl Default for AllocOpts {
    fn default() -> Self {
        AllocOpts {
            kind: MemoryKind::Anonymous,
            mem_cg_id: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Allocation {
    refs: u64,
    kind: MemoryKind,
    mem_cg_id: u32,
}

impl IntervalValue for Allocation {
    fn try_merge(left: &Self, _left_len: u64, right: &Self) -> Option<Self> {
        (left == right).then(|| left.clone())
    }

    fn split(&self, _offset: u64) -> (Self, Self) {
        (self.clone(), self.clone())
    }
}

struct FileState {
    allocations: IntervalMap<Allocation>,
    /// Current file size; grown with set_len as the high-water mark moves.
    size: u64,
}

pub struct MemoryFile {
    file: File,
    accounting: Arc<MemoryAccounting>,
    state: Mutex<FileState>,
}

impl MemoryFile {
    pub fn new(accounting: Arc<MemoryAccounting>) -> Result<Arc<MemoryFile>, MemoryError> {
        let memfd = memfd::MemfdOptions::default()
            .allow_sealing(false)
            .create("sandkern-memory")
            .map_err(|err| match err {
                memfd::Error::Create(io) => MemoryError::Io(io),
                other => MemoryError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    other.to_string(),
                )),
            })?;
        Ok(Arc::new(MemoryFile {
            file: memfd.into_file(),
            accounting,
            state: Mutex::new(FileState {
                allocations: IntervalMap::new(),
                size: 0,
            }),
        }))
    }

    /// The backing descriptor, for handing to a Platform so it can map
    /// file ranges into application address spaces.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Allocates a page-aligned range of `length` bytes with an initial
    /// reference count of one.
    pub fn allocate(&self, length: u64, opts: AllocOpts) -> Result<FileRange, MemoryError> {
        if length == 0 || length % PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let mut state = self.state.lock().unwrap();
        let bounds = FileRange::new(0, u64::MAX - PAGE_SIZE);
        let start = state
            .allocations
            .find_gap_bottom_up(bounds, length)
            .ok_or(MemoryError::OutOfMemory(length))?;
        let fr = FileRange::new(start, start + length);
        if fr.end > state.size {
            let new_size = page_round_up(fr.end).ok_or(MemoryError::OutOfMemory(length))?;
            self.file.set_len(new_size)?;
            state.size = new_size;
        }
        state.allocations.insert(
            fr,
            Allocation {
                refs: 1,
                kind: opts.kind,
                mem_cg_id: opts.mem_cg_id,
            },
        );
        self.accounting.charge(opts.kind, length);
        Ok(fr)
    }

    /// Increments the reference count of every page in `fr`.
    pub fn inc_ref(&self, fr: FileRange) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.allocations.covers(fr),
            "inc_ref of unallocated range {fr:?}"
        );
        state.allocations.update(fr, |alloc| alloc.refs += 1);
    }

    /// Decrements the reference count of every page in `fr`, freeing
    /// pages whose count reaches zero.
    pub fn dec_ref(&self, fr: FileRange) {
        let mut state = self.state.lock().unwrap();
        assert!(
            state.allocations.covers(fr),
            "dec_ref of unallocated range {fr:?}"
        );
        state.allocations.update(fr, |alloc| {
            assert!(alloc.refs > 0, "ref count underflow at {fr:?}");
            alloc.refs -= 1;
        });
        let dead: Vec<(FileRange, Allocation)> = state
            .allocations
            .intersecting(fr)
            .into_iter()
            .filter(|(_, alloc)| alloc.refs == 0)
            .collect();
        for (range, alloc) in dead {
            state.allocations.remove(range);
            self.accounting.uncharge(alloc.kind, range.length());
            self.punch(range);
        }
    }

    /// True when every page of `fr` is live. Test hook.
    pub fn is_allocated(&self, fr: FileRange) -> bool {
        self.state.lock().unwrap().allocations.covers(fr)
    }

    /// Bytes currently allocated, summed over all kinds.
    pub fn total_usage(&self) -> u64 {
        self.accounting.snapshot().total()
    }

    /// The per-kind usage breakdown.
    pub fn usage(&self) -> crate::usage::MemoryLocked {
        self.accounting.snapshot()
    }

    /// Runs `f` over a writable sentry-side view of `fr`.
    pub fn with_slice<R>(
        &self,
        fr: FileRange,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MemoryError> {
        if fr.is_empty() {
            return Err(MemoryError::InvalidArgument);
        }
        let mut map = unsafe {
            memmap::MmapOptions::new()
                .offset(fr.start as _)
                .len(fr.length() as usize)
                .map_mut(&self.file)?
        };
        Ok(f(&mut map[..]))
    }

    /// Returns freed pages to the host. Failure falls back to zeroing so
    /// a reused range never leaks stale data.
    fn punch(&self, fr: FileRange) {
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                fr.start as libc::off_t,
                fr.length() as libc::off_t,
            )
        };
        if rc != 0 {
            log::warn!(
                "punching hole at {fr:?} failed ({}); zeroing instead",
                std::io::Error::last_os_error()
            );
            let _ = self.with_slice(fr, |bytes| bytes.fill(0));
        }
    }
}

impl std::fmt::Debug for MemoryFile {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("MemoryFile")
            .field("size", &state.size)
            .field("segments", &state.allocations.segment_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_file() -> Arc<MemoryFile> {
        MemoryFile::new(Arc::new(MemoryAccounting::new())).unwrap()
    }

    #[test]
    fn allocate_and_free() {
        let mf = new_file();
        let fr = mf
            .allocate(3 * PAGE_SIZE, AllocOpts::default())
            .unwrap();
        assert_eq!(fr.length(), 3 * PAGE_SIZE);
        assert!(mf.is_allocated(fr));
        assert_eq!(mf.total_usage(), 3 * PAGE_SIZE);

        mf.dec_ref(fr);
        assert!(!mf.is_allocated(fr));
        assert_eq!(mf.total_usage(), 0);
    }

    #[test]
    fn range_lives_while_referenced() {
        let mf = new_file();
        let fr = mf.allocate(PAGE_SIZE, AllocOpts::default()).unwrap();
        mf.inc_ref(fr);
        mf.dec_ref(fr);
        assert!(mf.is_allocated(fr));
        mf.dec_ref(fr);
        assert!(!mf.is_allocated(fr));
    }

    #[test]
    fn partial_dec_ref_splits() {
        let mf = new_file();
        let fr = mf.allocate(4 * PAGE_SIZE, AllocOpts::default()).unwrap();
        let head = FileRange::new(fr.start, fr.start + PAGE_SIZE);
        mf.dec_ref(head);
        assert!(!mf.is_allocated(head));
        assert!(mf.is_allocated(FileRange::new(fr.start + PAGE_SIZE, fr.end)));
    }

    #[test]
    fn unaligned_allocation_rejected() {
        let mf = new_file();
        assert!(matches!(
            mf.allocate(123, AllocOpts::default()),
            Err(MemoryError::InvalidArgument)
        ));
        assert!(matches!(
            mf.allocate(0, AllocOpts::default()),
            Err(MemoryError::InvalidArgument)
        ));
    }

    #[test]
    fn slices_read_back() {
        let mf = new_file();
        let fr = mf.allocate(PAGE_SIZE, AllocOpts::default()).unwrap();
        mf.with_slice(fr, |bytes| {
            assert!(bytes.iter().all(|&b| b == 0));
            bytes[0..4].copy_from_slice(b"xyzw");
        })
        .unwrap();
        let word = mf
            .with_slice(fr, |bytes| bytes[0..4].to_vec())
            .unwrap();
        assert_eq!(&word, b"xyzw");
    }

    #[test]
    fn freed_pages_are_zeroed_for_reuse() {
        let mf = new_file();
        let fr = mf.allocate(PAGE_SIZE, AllocOpts::default()).unwrap();
        mf.with_slice(fr, |bytes| bytes.fill(0xaa)).unwrap();
        mf.dec_ref(fr);
        let fr2 = mf.allocate(PAGE_SIZE, AllocOpts::default()).unwrap();
        assert_eq!(fr2.start, fr.start);
        mf.with_slice(fr2, |bytes| {
            assert!(bytes.iter().all(|&b| b == 0));
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "inc_ref of unallocated range")]
    fn inc_ref_of_free_range_panics() {
        let mf = new_file();
        mf.inc_ref(FileRange::new(0, PAGE_SIZE));
    }
}

//! The per-task virtual address space.
//!
//! A MemoryManager is two interval maps: vmas (what the application asked
//! to be mapped) and pmas (which of those pages are resident in the
//! MemoryFile). Faults populate pmas from the vma's Mappable, or from
//! fresh zeroed pages for anonymous memory. A pma owns one reference on
//! its file range; dropping the pma drops the reference.

use super::{
    aio::{new_ring_mappable, AioContext, AioManager},
    intervals::{IntervalMap, IntervalValue},
    AccessType, AddrRange, AllocOpts, FileRange, Mappable, MemoryError, MemoryFile, Range,
};
use crate::arch::{page_round_down, page_round_up, MmapDirection, MmapLayout, PAGE_SIZE};
use crate::usage::MemoryKind;
use bitflags::bitflags;
use std::sync::{Arc, Mutex};

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct VmaFlags: u8 {
        /// Modifications are private to this address space.
        const PRIVATE = 1;
        /// The mapping grows downward (stacks).
        const GROWS_DOWN = 2;
        /// Pages are locked; major faults are not allowed.
        const MLOCKED = 4;
    }
}

/// One segment of the application's address space.
#[derive(Clone)]
pub struct Vma {
    pub mappable: Option<Arc<dyn Mappable>>,
    /// Offset into the mappable of the segment's first byte.
    pub offset: u64,
    pub perms: AccessType,
    pub max_perms: AccessType,
    pub flags: VmaFlags,
}

impl std::fmt::Debug for Vma {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vma")
            .field("mappable", &self.mappable.as_ref().map(|m| m.mapped_name()))
            .field("offset", &self.offset)
            .field("perms", &self.perms)
            .field("flags", &self.flags)
            .finish()
    }
}

impl IntervalValue for Vma {
    fn try_merge(left: &Self, left_len: u64, right: &Self) -> Option<Self> {
        let same_mappable = match (&left.mappable, &right.mappable) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                Arc::ptr_eq(a, b) && right.offset == left.offset + left_len
            }
            _ => false,
        };
        (same_mappable
            && left.perms == right.perms
            && left.max_perms == right.max_perms
            && left.flags == right.flags)
            .then(|| left.clone())
    }

    fn split(&self, offset: u64) -> (Self, Self) {
        let mut right = self.clone();
        if right.mappable.is_some() {
            right.offset = self.offset + offset;
        }
        (self.clone(), right)
    }
}

/// A resident page range: address range -> MemoryFile offset.
#[derive(Debug, Clone, PartialEq)]
struct Pma {
    file_start: u64,
    perms: AccessType,
    private: bool,
}

impl IntervalValue for Pma {
    fn try_merge(left: &Self, left_len: u64, right: &Self) -> Option<Self> {
        (right.file_start == left.file_start + left_len
            && left.perms == right.perms
            && left.private == right.private)
            .then(|| left.clone())
    }

    fn split(&self, offset: u64) -> (Self, Self) {
        let mut right = self.clone();
        right.file_start = self.file_start + offset;
        (self.clone(), right)
    }
}

/// Arguments to mmap.
pub struct MMapOpts {
    pub length: u64,
    /// Placement hint, or the exact address when `fixed`.
    pub addr: u64,
    pub fixed: bool,
    /// With `fixed`, silently unmap any overlap (MAP_FIXED semantics).
    pub unmap: bool,
    pub perms: AccessType,
    pub max_perms: AccessType,
    pub private: bool,
    pub grows_down: bool,
    pub mappable: Option<Arc<dyn Mappable>>,
    pub offset: u64,
}

impl Default for MMapOpts {
    fn default() -> Self {
        MMapOpts {
            length: 0,
            addr: 0,
            fixed: false,
            unmap: false,
            perms: AccessType::READ_WRITE,
            max_perms: AccessType::ANY_ACCESS,
            private: true,
            grows_down: false,
            mappable: None,
            offset: 0,
        }
    }
}

/// Arguments to mremap.
#[derive(Default)]
pub struct MRemapOpts {
    pub may_move: bool,
    /// Required destination (MREMAP_FIXED), if any.
    pub new_addr: Option<u64>,
}

/// Program break state.
#[derive(Debug, Default, Copy, Clone)]
pub struct Brk {
    pub base: u64,
    pub current: u64,
}

struct MmState {
    layout: MmapLayout,
    vmas: IntervalMap<Vma>,
    pmas: IntervalMap<Pma>,
    brk: Brk,
}

pub struct MemoryManager {
    mf: Arc<MemoryFile>,
    aio: AioManager,
    state: Mutex<MmState>,
}

impl MemoryManager {
    pub fn new(mf: Arc<MemoryFile>, layout: MmapLayout) -> Arc<MemoryManager> {
        Arc::new(MemoryManager {
            mf,
            aio: AioManager::default(),
            state: Mutex::new(MmState {
                layout,
                vmas: IntervalMap::new(),
                pmas: IntervalMap::new(),
                brk: Brk::default(),
            }),
        })
    }

    pub fn layout(&self) -> MmapLayout {
        self.state.lock().unwrap().layout
    }

    pub fn memory_file(&self) -> &Arc<MemoryFile> {
        &self.mf
    }

    /// Total bytes mapped.
    pub fn span(&self) -> u64 {
        self.state.lock().unwrap().vmas.span()
    }

    /// The mapped segment ranges, for diagnostics and tests.
    pub fn segment_ranges(&self) -> Vec<AddrRange> {
        let state = self.state.lock().unwrap();
        state.vmas.iter().map(|(range, _)| range).collect()
    }

    pub fn segment_count(&self) -> usize {
        self.state.lock().unwrap().vmas.segment_count()
    }

    /// Establishes a mapping and returns its address.
    pub fn mmap(&self, opts: MMapOpts) -> Result<u64, MemoryError> {
        if opts.length == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let length = page_round_up(opts.length).ok_or(MemoryError::InvalidArgument)?;
        let mut state = self.state.lock().unwrap();
        let range = self.place_locked(&mut state, &opts, length)?;

        if let Some(mappable) = &opts.mappable {
            mappable.add_mapping(range, opts.offset, opts.perms.contains(AccessType::WRITE))?;
        }

        let mut flags = VmaFlags::empty();
        if opts.private {
            flags |= VmaFlags::PRIVATE;
        }
        if opts.grows_down {
            flags |= VmaFlags::GROWS_DOWN;
        }
        state.vmas.insert(
            range,
            Vma {
                mappable: opts.mappable.clone(),
                offset: opts.offset,
                perms: opts.perms,
                max_perms: opts.max_perms,
                flags,
            },
        );
        log::trace!("mmap {:?} perms {:?}", range, opts.perms);
        Ok(range.start)
    }

    fn place_locked(
        &self,
        state: &mut MmState,
        opts: &MMapOpts,
        length: u64,
    ) -> Result<AddrRange, MemoryError> {
        let layout = state.layout;
        let bounds = AddrRange::new(layout.min_addr, layout.max_addr);
        if opts.fixed {
            if opts.addr % PAGE_SIZE != 0 {
                return Err(MemoryError::InvalidArgument);
            }
            let range =
                AddrRange::with_length(opts.addr, length).ok_or(MemoryError::InvalidArgument)?;
            if !bounds.is_superset_of(range) {
                return Err(MemoryError::InvalidArgument);
            }
            if !state.vmas.is_free(range) {
                if !opts.unmap {
                    return Err(MemoryError::NoSpace(length));
                }
                self.unmap_locked(state, range);
            }
            return Ok(range);
        }

        // A non-fixed hint is honored when the rounded-down range is free.
        if opts.addr != 0 {
            let hint = page_round_down(opts.addr);
            if let Some(range) = AddrRange::with_length(hint, length) {
                if bounds.is_superset_of(range) && state.vmas.is_free(range) {
                    return Ok(range);
                }
            }
        }

        let start = match layout.default_direction {
            MmapDirection::TopDown => state
                .vmas
                .find_gap_top_down(AddrRange::new(layout.min_addr, layout.top_down_base), length),
            MmapDirection::BottomUp => state
                .vmas
                .find_gap_bottom_up(AddrRange::new(layout.bottom_up_base, layout.max_addr), length),
        }
        .or_else(|| {
            // Fall back to anywhere in the layout.
            state
                .vmas
                .find_gap_bottom_up(AddrRange::new(layout.min_addr, layout.max_addr), length)
        })
        .ok_or(MemoryError::NoSpace(length))?;
        Ok(AddrRange::new(start, start + length))
    }

    /// Where a default mmap of `length` bytes would land right now.
    pub fn mmap_hint(&self, length: u64) -> Option<u64> {
        let length = page_round_up(length)?;
        let mut state = self.state.lock().unwrap();
        let opts = MMapOpts::default();
        self.place_locked(&mut state, &opts, length).ok().map(|r| r.start)
    }

    pub fn munmap(&self, addr: u64, length: u64) -> Result<(), MemoryError> {
        let range = Self::aligned_range(addr, length)?;
        let mut state = self.state.lock().unwrap();
        self.unmap_locked(&mut state, range);
        Ok(())
    }

    fn unmap_locked(&self, state: &mut MmState, range: AddrRange) {
        for (seg, vma) in state.vmas.remove(range) {
            if let Some(mappable) = &vma.mappable {
                let offset = vma.offset;
                mappable.remove_mapping(seg, offset, vma.perms.contains(AccessType::WRITE));
            }
        }
        self.drop_pmas_locked(state, range);
    }

    fn drop_pmas_locked(&self, state: &mut MmState, range: AddrRange) {
        for (seg, pma) in state.pmas.remove(range) {
            self.mf
                .dec_ref(FileRange::new(pma.file_start, pma.file_start + seg.length()));
        }
    }

    pub fn mprotect(&self, addr: u64, length: u64, perms: AccessType) -> Result<(), MemoryError> {
        let range = Self::aligned_range(addr, length)?;
        let mut state = self.state.lock().unwrap();
        if !state.vmas.covers(range) {
            return Err(MemoryError::NotMapped(range));
        }
        for (seg, vma) in state.vmas.intersecting(range) {
            if !vma.max_perms.supersets(perms) {
                return Err(MemoryError::AccessDenied {
                    range: seg,
                    access: perms,
                    allowed: vma.max_perms,
                });
            }
        }
        state.vmas.update(range, |vma| vma.perms = perms);
        // Resident pages refault under the new permissions.
        self.drop_pmas_locked(&mut state, range);
        Ok(())
    }

    pub fn mremap(
        &self,
        old_addr: u64,
        old_size: u64,
        new_size: u64,
        opts: MRemapOpts,
    ) -> Result<u64, MemoryError> {
        let old_range = Self::aligned_range(old_addr, old_size)?;
        let new_size = page_round_up(new_size).ok_or(MemoryError::InvalidArgument)?;
        if new_size == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let mut state = self.state.lock().unwrap();
        if !state.vmas.covers(old_range) {
            return Err(MemoryError::NotMapped(old_range));
        }

        if new_size == old_range.length() && opts.new_addr.is_none() {
            return Ok(old_range.start);
        }

        // Shrink in place.
        if new_size < old_range.length() {
            let tail = AddrRange::new(old_range.start + new_size, old_range.end);
            self.unmap_locked(&mut state, tail);
            return Ok(old_range.start);
        }

        // Grow in place when the room is free and no fixed destination
        // was requested.
        let extension = AddrRange::new(old_range.end, old_range.start + new_size);
        if opts.new_addr.is_none()
            && extension.end <= state.layout.max_addr
            && state.vmas.is_free(extension)
        {
            let (_, vma) = state
                .vmas
                .find(old_range.end - 1)
                .map(|(r, v)| (r, v.clone()))
                .ok_or(MemoryError::NotMapped(old_range))?;
            let mut ext_vma = vma.clone();
            if ext_vma.mappable.is_some() {
                let (seg, _) = state.vmas.find(old_range.end - 1).unwrap();
                ext_vma.offset = vma.offset + (extension.start - seg.start);
            }
            state.vmas.insert(extension, ext_vma);
            return Ok(old_range.start);
        }

        if !opts.may_move {
            return Err(MemoryError::NoSpace(new_size));
        }

        // Move. Pick or validate the destination.
        let dst_start = match opts.new_addr {
            Some(addr) => {
                if addr % PAGE_SIZE != 0 {
                    return Err(MemoryError::InvalidArgument);
                }
                let dst = AddrRange::with_length(addr, new_size)
                    .ok_or(MemoryError::InvalidArgument)?;
                if dst.overlaps(old_range) {
                    return Err(MemoryError::InvalidArgument);
                }
                self.unmap_locked(&mut state, dst);
                addr
            }
            None => {
                let layout = state.layout;
                state
                    .vmas
                    .find_gap_top_down(
                        AddrRange::new(layout.min_addr, layout.top_down_base),
                        new_size,
                    )
                    .or_else(|| {
                        state.vmas.find_gap_bottom_up(
                            AddrRange::new(layout.min_addr, layout.max_addr),
                            new_size,
                        )
                    })
                    .ok_or(MemoryError::NoSpace(new_size))?
            }
        };
        let dst = AddrRange::new(dst_start, dst_start + new_size);

        // Move vmas, preserving mappable offsets.
        let pieces = state.vmas.remove(old_range);
        let last_piece = pieces.last().map(|(seg, vma)| (*seg, vma.clone()));
        for (seg, vma) in pieces {
            let moved = AddrRange::new(
                dst.start + (seg.start - old_range.start),
                dst.start + (seg.end - old_range.start),
            );
            if let Some(mappable) = &vma.mappable {
                mappable.copy_mapping(
                    seg,
                    moved,
                    vma.offset,
                    vma.perms.contains(AccessType::WRITE),
                )?;
            }
            state.vmas.insert(moved, vma);
        }
        // A grown move extends the mapping past the copied pieces.
        if new_size > old_range.length() {
            if let Some((last_seg, last_vma)) = last_piece {
                let tail = AddrRange::new(
                    dst.start + old_range.length(),
                    dst.end,
                );
                let mut tail_vma = last_vma.clone();
                if tail_vma.mappable.is_some() {
                    tail_vma.offset =
                        last_vma.offset + (old_range.end - last_seg.start);
                }
                state.vmas.insert(tail, tail_vma);
            }
        }

        // Move resident pages without touching their refcounts.
        let resident = state.pmas.remove(old_range);
        for (seg, pma) in resident {
            let moved = AddrRange::new(
                dst.start + (seg.start - old_range.start),
                dst.start + (seg.end - old_range.start),
            );
            state.pmas.insert(moved, pma);
        }

        // An AIO ring that moves takes its context id with it.
        self.aio.remap_context(old_range.start, dst.start);
        Ok(dst.start)
    }

    pub fn msync(&self, addr: u64, length: u64) -> Result<(), MemoryError> {
        let range = Self::aligned_range(addr, length)?;
        let state = self.state.lock().unwrap();
        if !state.vmas.covers(range) {
            return Err(MemoryError::NotMapped(range));
        }
        for (seg, vma) in state.vmas.intersecting(range) {
            if let Some(mappable) = &vma.mappable {
                if !vma.flags.contains(VmaFlags::PRIVATE) {
                    let mr = Range::new(vma.offset, vma.offset + seg.length());
                    mappable.msync(mr)?;
                }
            }
        }
        Ok(())
    }

    pub fn mlock(&self, addr: u64, length: u64) -> Result<(), MemoryError> {
        self.set_mlocked(addr, length, true)
    }

    pub fn munlock(&self, addr: u64, length: u64) -> Result<(), MemoryError> {
        self.set_mlocked(addr, length, false)
    }

    fn set_mlocked(&self, addr: u64, length: u64, locked: bool) -> Result<(), MemoryError> {
        let range = Self::aligned_range(addr, length)?;
        let mut state = self.state.lock().unwrap();
        if !state.vmas.covers(range) {
            return Err(MemoryError::NotMapped(range));
        }
        state.vmas.update(range, |vma| {
            if locked {
                vma.flags |= VmaFlags::MLOCKED;
            } else {
                vma.flags &= !VmaFlags::MLOCKED;
            }
        });
        if locked {
            // Locked pages must be resident.
            drop(state);
            self.populate(range, AccessType::READ)?;
        }
        Ok(())
    }

    /// Sets the program break base at exec.
    pub fn set_brk_base(&self, base: u64) {
        let mut state = self.state.lock().unwrap();
        state.brk = Brk {
            base,
            current: base,
        };
    }

    /// brk(2): 0 queries, otherwise moves the break. Returns the current
    /// break either way, as Linux does.
    pub fn brk(&self, new_brk: u64) -> u64 {
        let (base, current) = {
            let state = self.state.lock().unwrap();
            (state.brk.base, state.brk.current)
        };
        if new_brk == 0 || new_brk < base {
            return current;
        }
        let old_end = match page_round_up(current) {
            Some(end) => end,
            None => return current,
        };
        let new_end = match page_round_up(new_brk) {
            Some(end) => end,
            None => return current,
        };
        if new_end > old_end {
            let opts = MMapOpts {
                length: new_end - old_end,
                addr: old_end,
                fixed: true,
                unmap: false,
                perms: AccessType::READ_WRITE,
                max_perms: AccessType::ANY_ACCESS,
                private: true,
                ..Default::default()
            };
            if self.mmap(opts).is_err() {
                return current;
            }
        } else if new_end < old_end {
            if self.munmap(new_end, old_end - new_end).is_err() {
                return current;
            }
        }
        let mut state = self.state.lock().unwrap();
        state.brk.current = new_brk;
        new_brk
    }

    /// Faults in `range` for `access` without copying any data.
    pub fn populate(&self, range: AddrRange, access: AccessType) -> Result<(), MemoryError> {
        let mut state = self.state.lock().unwrap();
        self.get_pmas_locked(&mut state, range, access)?;
        Ok(())
    }

    /// Copies `bytes` into the application at `addr`.
    pub fn copy_out(&self, addr: u64, bytes: &[u8]) -> Result<(), MemoryError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let range =
            AddrRange::with_length(addr, bytes.len() as u64).ok_or(MemoryError::InvalidArgument)?;
        let mut state = self.state.lock().unwrap();
        self.get_pmas_locked(&mut state, Self::page_span(range), AccessType::WRITE)?;
        let mut written = 0usize;
        for (seg, pma) in state.pmas.intersecting(range) {
            let fr = FileRange::new(
                pma.file_start + (seg.start.max(range.start) - seg.start),
                pma.file_start + (seg.end.min(range.end) - seg.start),
            );
            let chunk = &bytes[written..written + fr.length() as usize];
            self.mf.with_slice(fr, |slice| slice.copy_from_slice(chunk))?;
            written += fr.length() as usize;
        }
        debug_assert_eq!(written, bytes.len());
        Ok(())
    }

    /// Copies `length` bytes out of the application at `addr`.
    pub fn copy_in(&self, addr: u64, length: usize) -> Result<Vec<u8>, MemoryError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let range =
            AddrRange::with_length(addr, length as u64).ok_or(MemoryError::InvalidArgument)?;
        let mut state = self.state.lock().unwrap();
        self.get_pmas_locked(&mut state, Self::page_span(range), AccessType::READ)?;
        let mut out = Vec::with_capacity(length);
        for (seg, pma) in state.pmas.intersecting(range) {
            let fr = FileRange::new(
                pma.file_start + (seg.start.max(range.start) - seg.start),
                pma.file_start + (seg.end.min(range.end) - seg.start),
            );
            self.mf
                .with_slice(fr, |slice| out.extend_from_slice(slice))?;
        }
        debug_assert_eq!(out.len(), length);
        Ok(out)
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes.
    pub fn copy_in_string(&self, addr: u64, max_len: usize) -> Result<String, MemoryError> {
        let mut collected = Vec::new();
        let mut cursor = addr;
        while collected.len() < max_len {
            // Stop at each page boundary so an unmapped successor page
            // does not fault a string that fits before it.
            let page_end = (cursor | (PAGE_SIZE - 1)) + 1;
            let take = ((page_end - cursor) as usize).min(max_len - collected.len());
            let chunk = self.copy_in(cursor, take)?;
            match chunk.iter().position(|&b| b == 0) {
                Some(nul) => {
                    collected.extend_from_slice(&chunk[..nul]);
                    return String::from_utf8(collected)
                        .map_err(|_| MemoryError::InvalidArgument);
                }
                None => collected.extend_from_slice(&chunk),
            }
            cursor = page_end;
        }
        Err(MemoryError::InvalidArgument)
    }

    fn page_span(range: AddrRange) -> AddrRange {
        AddrRange::new(
            page_round_down(range.start),
            page_round_up(range.end).unwrap_or(u64::MAX & !(PAGE_SIZE - 1)),
        )
    }

    fn aligned_range(addr: u64, length: u64) -> Result<AddrRange, MemoryError> {
        if addr % PAGE_SIZE != 0 || length == 0 {
            return Err(MemoryError::InvalidArgument);
        }
        let length = page_round_up(length).ok_or(MemoryError::InvalidArgument)?;
        AddrRange::with_length(addr, length).ok_or(MemoryError::InvalidArgument)
    }

    /// Ensures resident pages cover `range` with at least `access`.
    fn get_pmas_locked(
        &self,
        state: &mut MmState,
        range: AddrRange,
        access: AccessType,
    ) -> Result<(), MemoryError> {
        if !state.vmas.covers(range) {
            return Err(MemoryError::NotMapped(range));
        }
        for (seg, vma) in state.vmas.intersecting(range) {
            if !vma.perms.supersets(access) {
                return Err(MemoryError::AccessDenied {
                    range: seg,
                    access,
                    allowed: vma.perms,
                });
            }
        }

        // Walk the holes in pma coverage and fill each from its vma.
        let mut cursor = range.start;
        while cursor < range.end {
            let hole_start = match state.pmas.find(cursor) {
                Some((seg, _)) => {
                    cursor = seg.end;
                    continue;
                }
                None => cursor,
            };
            let hole_end = state
                .pmas
                .intersecting(AddrRange::new(hole_start, range.end))
                .first()
                .map(|(seg, _)| seg.start)
                .unwrap_or(range.end);
            let hole = AddrRange::new(hole_start, hole_end);
            self.fill_hole_locked(state, hole, access)?;
            cursor = hole_end;
        }
        Ok(())
    }

    fn fill_hole_locked(
        &self,
        state: &mut MmState,
        hole: AddrRange,
        access: AccessType,
    ) -> Result<(), MemoryError> {
        for (seg, vma) in state.vmas.intersecting(hole) {
            match &vma.mappable {
                None => {
                    let fr = self.mf.allocate(
                        seg.length(),
                        AllocOpts {
                            kind: MemoryKind::Anonymous,
                            mem_cg_id: 0,
                        },
                    )?;
                    state.pmas.insert(
                        seg,
                        Pma {
                            file_start: fr.start,
                            perms: vma.perms,
                            private: true,
                        },
                    );
                }
                Some(mappable) => {
                    let mr = Range::new(
                        vma.offset,
                        vma.offset + seg.length(),
                    );
                    let (translations, bus) = mappable.translate(mr, mr, access);
                    let mut covered = mr.start;
                    for t in &translations {
                        let clipped = t.source.intersect(mr);
                        if clipped.is_empty() {
                            continue;
                        }
                        if clipped.start > covered {
                            break;
                        }
                        let ar = AddrRange::new(
                            seg.start + (clipped.start - mr.start),
                            seg.start + (clipped.end - mr.start),
                        );
                        let file_start = t.file_offset + (clipped.start - t.source.start);
                        if vma.flags.contains(VmaFlags::PRIVATE) {
                            // Private file mappings get their own copy of
                            // the pages at first touch.
                            let fr = self.mf.allocate(
                                ar.length(),
                                AllocOpts {
                                    kind: MemoryKind::Anonymous,
                                    mem_cg_id: 0,
                                },
                            )?;
                            let src = FileRange::new(file_start, file_start + ar.length());
                            let data = self.mf.with_slice(src, |s| s.to_vec())?;
                            self.mf.with_slice(fr, |d| d.copy_from_slice(&data))?;
                            state.pmas.insert(
                                ar,
                                Pma {
                                    file_start: fr.start,
                                    perms: vma.perms,
                                    private: true,
                                },
                            );
                        } else {
                            let fr = FileRange::new(file_start, file_start + ar.length());
                            self.mf.inc_ref(fr);
                            state.pmas.insert(
                                ar,
                                Pma {
                                    file_start: fr.start,
                                    perms: vma.perms.intersection(t.perms),
                                    private: false,
                                },
                            );
                        }
                        covered = clipped.end;
                    }
                    if covered < mr.end {
                        if let Some(bus) = bus {
                            return Err(MemoryError::BusError(bus.offset));
                        }
                        return Err(MemoryError::NotMapped(seg));
                    }
                }
            }
        }
        Ok(())
    }

    /// Duplicates this address space for fork. Shared pmas are shared;
    /// private pmas are copied eagerly.
    pub fn fork(&self) -> Result<Arc<MemoryManager>, MemoryError> {
        let state = self.state.lock().unwrap();
        let new = MemoryManager::new(Arc::clone(&self.mf), state.layout);
        {
            let mut new_state = new.state.lock().unwrap();
            new_state.brk = state.brk;
            for (seg, vma) in state.vmas.iter() {
                if let Some(mappable) = &vma.mappable {
                    mappable.copy_mapping(
                        seg,
                        seg,
                        vma.offset,
                        vma.perms.contains(AccessType::WRITE),
                    )?;
                }
                new_state.vmas.insert(seg, vma.clone());
            }
            for (seg, pma) in state.pmas.iter() {
                let fr = FileRange::new(pma.file_start, pma.file_start + seg.length());
                if pma.private {
                    let copy = self.mf.allocate(
                        seg.length(),
                        AllocOpts {
                            kind: MemoryKind::Anonymous,
                            mem_cg_id: 0,
                        },
                    )?;
                    let data = self.mf.with_slice(fr, |s| s.to_vec())?;
                    self.mf.with_slice(copy, |d| d.copy_from_slice(&data))?;
                    new_state.pmas.insert(
                        seg,
                        Pma {
                            file_start: copy.start,
                            ..pma.clone()
                        },
                    );
                } else {
                    self.mf.inc_ref(fr);
                    new_state.pmas.insert(seg, pma.clone());
                }
            }
        }
        Ok(new)
    }

    /// Creates an AIO context of `events` slots. The ring page's address
    /// becomes the context id.
    pub fn new_aio_context(&self, events: u32) -> Result<u64, MemoryError> {
        let ring = new_ring_mappable(Arc::clone(&self.mf))?;
        let addr = self.mmap(MMapOpts {
            length: super::aio::AIO_RING_SIZE,
            perms: AccessType::READ,
            max_perms: AccessType::READ,
            private: false,
            mappable: Some(ring),
            ..Default::default()
        })?;
        if !self.aio.new_context(events, addr) {
            self.munmap(addr, super::aio::AIO_RING_SIZE)?;
            return Err(MemoryError::InvalidArgument);
        }
        Ok(addr)
    }

    /// Destroys the AIO context `id`, returning it for draining. None if
    /// no such context.
    pub fn destroy_aio_context(&self, id: u64) -> Option<Arc<AioContext>> {
        if !self.is_valid_addr(id) {
            return None;
        }
        // Unmap only after the id checked out as a live context address;
        // this mirrors the (weird, but load-bearing) Linux behavior of
        // unmapping whatever now lives at the ring address.
        let _ = self.munmap(id, super::aio::AIO_RING_SIZE);
        self.aio.destroy_context(id)
    }

    pub fn lookup_aio_context(&self, id: u64) -> Option<Arc<AioContext>> {
        let ctx = self.aio.lookup_context(id)?;
        if !self.is_valid_addr(id) {
            return None;
        }
        Some(ctx)
    }

    fn is_valid_addr(&self, id: u64) -> bool {
        self.copy_in(id, 4).is_ok()
    }

    /// Tears the address space down: AIO contexts first, then resident
    /// pages, then the segment map.
    pub fn destroy(&self) {
        self.aio.destroy_all();
        let mut state = self.state.lock().unwrap();
        let all = AddrRange::new(0, u64::MAX);
        let resident: Vec<(AddrRange, Pma)> = state
            .pmas
            .iter()
            .map(|(r, p)| (r, p.clone()))
            .collect();
        for (seg, pma) in resident {
            self.mf
                .dec_ref(FileRange::new(pma.file_start, pma.file_start + seg.length()));
        }
        state.pmas.remove(all);
        let mapped: Vec<(AddrRange, Vma)> = state
            .vmas
            .iter()
            .map(|(r, v)| (r, v.clone()))
            .collect();
        for (seg, vma) in mapped {
            if let Some(mappable) = &vma.mappable {
                mappable.remove_mapping(seg, vma.offset, vma.perms.contains(AccessType::WRITE));
            }
        }
        state.vmas.remove(all);
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        arch::{Context64, MmapLayout},
        kernel::limits::LimitSet,
        usage::MemoryAccounting,
    };

    fn test_layout() -> MmapLayout {
        let mut limits = LimitSet::default();
        limits.stack.cur = 8 << 20;
        Context64::default()
            .new_mmap_layout(0, crate::arch::MAX_ADDR_64, &limits)
            .unwrap()
    }

    fn new_mm() -> Arc<MemoryManager> {
        let mf = MemoryFile::new(Arc::new(MemoryAccounting::new())).unwrap();
        MemoryManager::new(mf, test_layout())
    }

    fn anon_mmap(mm: &MemoryManager, length: u64) -> u64 {
        mm.mmap(MMapOpts {
            length,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn top_down_placement_lands_below_base() {
        let mm = new_mm();
        let layout = mm.layout();
        let addr = anon_mmap(&mm, PAGE_SIZE);
        assert_eq!(addr % PAGE_SIZE, 0);
        assert!(addr >= layout.top_down_base - PAGE_SIZE);
        assert!(addr < layout.top_down_base);
    }

    #[test]
    fn segments_stay_disjoint_and_merged() {
        let mm = new_mm();
        let a = anon_mmap(&mm, 4 * PAGE_SIZE);
        let ranges = mm.segment_ranges();
        assert_eq!(ranges.len(), 1);

        // A second default mmap is placed adjacent and merges.
        let b = anon_mmap(&mm, 2 * PAGE_SIZE);
        assert_ne!(a, b);
        assert_eq!(mm.segment_count(), 1);
        assert_eq!(mm.span(), 6 * PAGE_SIZE);

        // Punch a hole; disjoint pieces remain.
        mm.munmap(a, PAGE_SIZE).unwrap();
        assert_eq!(mm.span(), 5 * PAGE_SIZE);
        let ranges = mm.segment_ranges();
        for window in ranges.windows(2) {
            assert!(window[0].end <= window[1].start);
        }
    }

    #[test]
    fn copy_roundtrip() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, 2 * PAGE_SIZE);
        let message = b"the quick brown fox";
        // Write across a page boundary.
        let target = addr + PAGE_SIZE - 7;
        mm.copy_out(target, message).unwrap();
        let back = mm.copy_in(target, message.len()).unwrap();
        assert_eq!(&back, message);
    }

    #[test]
    fn copy_in_string_stops_at_nul() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, PAGE_SIZE);
        mm.copy_out(addr, b"hello\0world").unwrap();
        assert_eq!(mm.copy_in_string(addr, 256).unwrap(), "hello");
    }

    #[test]
    fn unmapped_access_faults() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, PAGE_SIZE);
        mm.munmap(addr, PAGE_SIZE).unwrap();
        assert!(mm.copy_in(addr, 8).is_err());
    }

    #[test]
    fn mprotect_enforces_max_perms() {
        let mm = new_mm();
        let addr = mm
            .mmap(MMapOpts {
                length: PAGE_SIZE,
                perms: AccessType::READ,
                max_perms: AccessType::READ,
                ..Default::default()
            })
            .unwrap();
        assert!(mm
            .mprotect(addr, PAGE_SIZE, AccessType::READ_WRITE)
            .is_err());
        mm.mprotect(addr, PAGE_SIZE, AccessType::READ).unwrap();
        // Writes through a read-only vma are denied.
        assert!(mm.copy_out(addr, b"x").is_err());
    }

    #[test]
    fn mremap_grow_and_move_preserves_contents() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, PAGE_SIZE);
        mm.copy_out(addr, b"payload").unwrap();

        let moved = mm
            .mremap(
                addr,
                PAGE_SIZE,
                4 * PAGE_SIZE,
                MRemapOpts {
                    may_move: true,
                    new_addr: None,
                },
            )
            .unwrap();
        let back = mm.copy_in(moved, 7).unwrap();
        assert_eq!(&back, b"payload");
    }

    #[test]
    fn fixed_mmap_replaces_existing() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, 2 * PAGE_SIZE);
        mm.copy_out(addr, b"old").unwrap();
        let again = mm
            .mmap(MMapOpts {
                length: 2 * PAGE_SIZE,
                addr,
                fixed: true,
                unmap: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(again, addr);
        // Fresh anonymous pages read as zeros.
        assert_eq!(mm.copy_in(addr, 3).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn span_equals_union_of_segments() {
        let mm = new_mm();
        let a = anon_mmap(&mm, 3 * PAGE_SIZE);
        anon_mmap(&mm, 2 * PAGE_SIZE);
        mm.munmap(a + PAGE_SIZE, PAGE_SIZE).unwrap();
        let union: u64 = mm.segment_ranges().iter().map(|r| r.length()).sum();
        assert_eq!(union, mm.span());
    }

    #[test]
    fn brk_grows_and_shrinks() {
        let mm = new_mm();
        mm.set_brk_base(0x5000_0000);
        assert_eq!(mm.brk(0), 0x5000_0000);
        let grown = mm.brk(0x5000_0000 + 3 * PAGE_SIZE);
        assert_eq!(grown, 0x5000_0000 + 3 * PAGE_SIZE);
        mm.copy_out(0x5000_0000, b"heap").unwrap();
        let shrunk = mm.brk(0x5000_0000 + PAGE_SIZE);
        assert_eq!(shrunk, 0x5000_0000 + PAGE_SIZE);
        // Below base is a query.
        assert_eq!(mm.brk(0x1000), 0x5000_0000 + PAGE_SIZE);
    }

    #[test]
    fn aio_lifecycle_through_mm() {
        let mm = new_mm();
        let id = mm.new_aio_context(8).unwrap();
        assert!(mm.lookup_aio_context(id).is_some());

        let ctx = mm.lookup_aio_context(id).unwrap();
        for _ in 0..8 {
            ctx.prepare().unwrap();
        }
        assert_eq!(ctx.prepare(), Err(super::super::aio::PrepareError::Again));

        let destroyed = mm.destroy_aio_context(id).unwrap();
        assert!(destroyed.dead());
        assert!(mm.destroy_aio_context(id).is_none());
        // 8 outstanding: channel open until they finish.
        let channel = destroyed.wait_channel().unwrap();
        for i in 0..8 {
            destroyed.finish_request(i);
        }
        destroyed.drain();
        assert!(channel.is_closed());
    }

    #[test]
    fn fork_copies_private_pages() {
        let mm = new_mm();
        let addr = anon_mmap(&mm, PAGE_SIZE);
        mm.copy_out(addr, b"parent").unwrap();
        let child = mm.fork().unwrap();
        child.copy_out(addr, b"child!").unwrap();
        assert_eq!(mm.copy_in(addr, 6).unwrap(), b"parent");
        assert_eq!(child.copy_in(addr, 6).unwrap(), b"child!");
    }

    #[test]
    fn shared_mappable_visible_across_spaces() {
        let mm = new_mm();
        let sm = super::super::SpecialMappable::new_shared_anon(
            Arc::clone(mm.memory_file()),
            PAGE_SIZE,
        )
        .unwrap();
        let a = mm
            .mmap(MMapOpts {
                length: PAGE_SIZE,
                private: false,
                mappable: Some(sm.clone()),
                ..Default::default()
            })
            .unwrap();
        let b = mm
            .mmap(MMapOpts {
                length: PAGE_SIZE,
                private: false,
                mappable: Some(sm),
                ..Default::default()
            })
            .unwrap();
        mm.copy_out(a, b"shared").unwrap();
        assert_eq!(mm.copy_in(b, 6).unwrap(), b"shared");
    }
}

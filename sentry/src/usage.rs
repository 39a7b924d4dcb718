//! Memory usage accounting by allocation kind.

use std::sync::Mutex;

/// What a MemoryFile allocation is used for. The kind decides which bucket
/// the pages are charged to in `Usage.Collect` results.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryKind {
    /// Sentry-internal allocations.
    System,
    /// Application anonymous memory.
    Anonymous,
    /// Page cache for file-backed mappings.
    PageCache,
    /// tmpfs file contents.
    Tmpfs,
    /// Application file mappings.
    Mapped,
    /// Ramdisk filesystem contents.
    Ramdiskfs,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct MemoryLocked {
    pub system: u64,
    pub anonymous: u64,
    pub page_cache: u64,
    pub tmpfs: u64,
    pub mapped: u64,
    pub ramdiskfs: u64,
}

impl MemoryLocked {
    pub fn total(&self) -> u64 {
        self.system
            + self.anonymous
            + self.page_cache
            + self.tmpfs
            + self.mapped
            + self.ramdiskfs
    }

    fn bucket(&mut self, kind: MemoryKind) -> &mut u64 {
        match kind {
            MemoryKind::System => &mut self.system,
            MemoryKind::Anonymous => &mut self.anonymous,
            MemoryKind::PageCache => &mut self.page_cache,
            MemoryKind::Tmpfs => &mut self.tmpfs,
            MemoryKind::Mapped => &mut self.mapped,
            MemoryKind::Ramdiskfs => &mut self.ramdiskfs,
        }
    }
}

/// Process-wide memory accounting, shared by the MemoryFile and the
/// `Usage` control handler.
#[derive(Debug, Default)]
pub struct MemoryAccounting {
    locked: Mutex<MemoryLocked>,
}

impl MemoryAccounting {
    pub fn new() -> MemoryAccounting {
        MemoryAccounting::default()
    }

    pub fn charge(&self, kind: MemoryKind, bytes: u64) {
        let mut locked = self.locked.lock().unwrap();
        *locked.bucket(kind) += bytes;
    }

    pub fn uncharge(&self, kind: MemoryKind, bytes: u64) {
        let mut locked = self.locked.lock().unwrap();
        let bucket = locked.bucket(kind);
        assert!(
            *bucket >= bytes,
            "memory accounting underflow: {kind:?} bucket {} < {bytes}",
            *bucket
        );
        *bucket -= bytes;
    }

    pub fn snapshot(&self) -> MemoryLocked {
        *self.locked.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_uncharge() {
        let acct = MemoryAccounting::new();
        acct.charge(MemoryKind::Anonymous, 4096);
        acct.charge(MemoryKind::Tmpfs, 8192);
        assert_eq!(acct.snapshot().total(), 12288);
        acct.uncharge(MemoryKind::Anonymous, 4096);
        assert_eq!(acct.snapshot().anonymous, 0);
        assert_eq!(acct.snapshot().tmpfs, 8192);
    }

    #[test]
    #[should_panic(expected = "memory accounting underflow")]
    fn underflow_panics() {
        let acct = MemoryAccounting::new();
        acct.uncharge(MemoryKind::System, 1);
    }
}

//! Per-thread-group file descriptor tables.

use super::{dentry::Dentry, inode::FileLocks, mount::Mount, EventQueue, VfsError};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct FdFlags: u8 {
        const CLOEXEC = 1;
    }
}

/// An open file: a position, status flags, and the (mount, dentry) pair
/// it refers to. Tables and dup'd descriptors share one of these.
pub struct FileDescription {
    dentry: Arc<Dentry>,
    mount: Arc<Mount>,
    offset: Mutex<u64>,
    readable: bool,
    writable: bool,
    locks: FileLocks,
    queue: Arc<EventQueue>,
}

impl FileDescription {
    /// Opens the file named by (dentry, mount); the inode's open gate
    /// decides whether the requested access is permitted.
    pub fn open(
        dentry: Arc<Dentry>,
        mount: Arc<Mount>,
        readable: bool,
        writable: bool,
    ) -> Result<Arc<FileDescription>, VfsError> {
        dentry.inode().open(writable)?;
        Ok(FileDescription::new(dentry, mount, readable, writable))
    }

    pub fn new(dentry: Arc<Dentry>, mount: Arc<Mount>, readable: bool, writable: bool) -> Arc<FileDescription> {
        dentry.inc_ref();
        Arc::new(FileDescription {
            dentry,
            mount,
            offset: Mutex::new(0),
            readable,
            writable,
            locks: FileLocks::default(),
            queue: EventQueue::new(),
        })
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn locks(&self) -> &FileLocks {
        &self.locks
    }

    pub fn offset(&self) -> u64 {
        *self.offset.lock().unwrap()
    }

    pub fn seek(&self, offset: u64) {
        *self.offset.lock().unwrap() = offset;
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, VfsError> {
        if !self.readable {
            return Err(VfsError::PermissionDenied);
        }
        let mut offset = self.offset.lock().unwrap();
        let n = self.dentry.inode().read_at(*offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, VfsError> {
        if !self.writable {
            return Err(VfsError::PermissionDenied);
        }
        let mut offset = self.offset.lock().unwrap();
        let n = self.dentry.inode().write_at(*offset, data)?;
        *offset += n as u64;
        Ok(n)
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        self.dentry.dec_ref();
    }
}

#[derive(Clone)]
struct FdEntry {
    file: Arc<FileDescription>,
    flags: FdFlags,
}

/// A sparse map from non-negative integers to open files. Shared by
/// tasks that share their file table (CLONE_FILES).
#[derive(Default)]
pub struct FdTable {
    entries: Mutex<BTreeMap<i32, FdEntry>>,
}

impl FdTable {
    pub fn new() -> Arc<FdTable> {
        Arc::new(FdTable::default())
    }

    /// Installs `file` at the lowest free descriptor >= `min`.
    pub fn insert(&self, min: i32, file: Arc<FileDescription>, flags: FdFlags) -> i32 {
        let mut entries = self.entries.lock().unwrap();
        let mut fd = min.max(0);
        while entries.contains_key(&fd) {
            fd += 1;
        }
        entries.insert(fd, FdEntry { file, flags });
        fd
    }

    /// Installs `file` at exactly `fd`, replacing any current entry
    /// (dup2 semantics).
    pub fn insert_at(&self, fd: i32, file: Arc<FileDescription>, flags: FdFlags) -> Result<(), VfsError> {
        if fd < 0 {
            return Err(VfsError::InvalidArgument);
        }
        self.entries
            .lock()
            .unwrap()
            .insert(fd, FdEntry { file, flags });
        Ok(())
    }

    pub fn get(&self, fd: i32) -> Option<Arc<FileDescription>> {
        self.entries
            .lock()
            .unwrap()
            .get(&fd)
            .map(|e| Arc::clone(&e.file))
    }

    pub fn flags(&self, fd: i32) -> Option<FdFlags> {
        self.entries.lock().unwrap().get(&fd).map(|e| e.flags)
    }

    pub fn set_flags(&self, fd: i32, flags: FdFlags) -> Result<(), VfsError> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&fd) {
            Some(entry) => {
                entry.flags = flags;
                Ok(())
            }
            None => Err(VfsError::NotFound),
        }
    }

    pub fn remove(&self, fd: i32) -> Option<Arc<FileDescription>> {
        self.entries.lock().unwrap().remove(&fd).map(|e| e.file)
    }

    /// Drops every close-on-exec entry; called at execve.
    pub fn close_on_exec(&self) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, entry| !entry.flags.contains(FdFlags::CLOEXEC));
    }

    pub fn fds(&self) -> Vec<i32> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    /// An independent copy of the table (fork without CLONE_FILES).
    pub fn fork(&self) -> Arc<FdTable> {
        let entries = self.entries.lock().unwrap().clone();
        Arc::new(FdTable {
            entries: Mutex::new(entries),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::tmpfs::TmpFilesystem;
    use crate::vfs::{mount::MountNamespace, CreateSpec, MountFlags};

    fn test_file() -> (Arc<Dentry>, Arc<Mount>) {
        let fs = TmpFilesystem::new();
        let ns = MountNamespace::new();
        let root = Arc::clone(fs.root());
        let mount = Mount::new("tmpfs", Arc::clone(&root), MountFlags::default(), &ns);
        let file = root
            .inode()
            .create("f", CreateSpec::Regular { mode: 0o644 })
            .unwrap();
        (file, mount)
    }

    #[test]
    fn lowest_free_fd() {
        let (dentry, mount) = test_file();
        let table = FdTable::new();
        let mk = || FileDescription::new(Arc::clone(&dentry), Arc::clone(&mount), true, true);
        assert_eq!(table.insert(0, mk(), FdFlags::empty()), 0);
        assert_eq!(table.insert(0, mk(), FdFlags::empty()), 1);
        assert_eq!(table.insert(0, mk(), FdFlags::empty()), 2);
        table.remove(1);
        assert_eq!(table.insert(0, mk(), FdFlags::empty()), 1);
        assert_eq!(table.insert(100, mk(), FdFlags::empty()), 100);
    }

    #[test]
    fn cloexec_dropped_at_exec() {
        let (dentry, mount) = test_file();
        let table = FdTable::new();
        let mk = || FileDescription::new(Arc::clone(&dentry), Arc::clone(&mount), true, true);
        table.insert(0, mk(), FdFlags::empty());
        table.insert(0, mk(), FdFlags::CLOEXEC);
        table.close_on_exec();
        assert_eq!(table.fds(), vec![0]);
    }

    #[test]
    fn table_holds_dentry_reference() {
        let (dentry, mount) = test_file();
        let before = dentry.ref_count();
        let table = FdTable::new();
        let fd = table.insert(
            0,
            FileDescription::new(Arc::clone(&dentry), mount, true, true),
            FdFlags::empty(),
        );
        assert_eq!(dentry.ref_count(), before + 1);
        table.remove(fd);
        assert_eq!(dentry.ref_count(), before);
    }

    #[test]
    fn read_write_through_description() {
        let (dentry, mount) = test_file();
        let file = FileDescription::open(dentry, mount, true, true).unwrap();
        assert_eq!(file.write(b"hello").unwrap(), 5);
        file.seek(0);
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn writable_open_of_directory_refused() {
        let fs = TmpFilesystem::new();
        let ns = MountNamespace::new();
        let root = Arc::clone(fs.root());
        let mount = Mount::new("tmpfs", Arc::clone(&root), MountFlags::default(), &ns);
        assert!(matches!(
            FileDescription::open(Arc::clone(&root), Arc::clone(&mount), true, true),
            Err(VfsError::IsADirectory)
        ));
        assert!(FileDescription::open(root, mount, true, false).is_ok());
    }
}

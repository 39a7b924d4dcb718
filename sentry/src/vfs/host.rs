//! Host-FD backed inodes: files donated by the supervisor or brokered by
//! the gofer, surfaced into the sandbox's filesystem.

use super::{
    inode::{CreateSpec, DirEntry, FileStat, Inode, SetStat, StatFs, Watches},
    Dentry, VfsError,
};
use std::{
    any::Any,
    os::fd::{AsRawFd, OwnedFd},
    sync::{Arc, Mutex},
};

/// Identity the sentry presents for a host file, independent of the uid,
/// gid and mode the host kernel reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualOwner {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
}

pub struct HostInode {
    fd: OwnedFd,
    owner: Mutex<VirtualOwner>,
    is_tty: bool,
    /// Whether this inode may be captured in a checkpoint. Host state
    /// cannot be serialized; savable inodes are ones the restore
    /// environment re-donates.
    savable: bool,
    watches: Arc<Watches>,
}

impl HostInode {
    pub fn new(fd: OwnedFd, is_tty: bool, savable: bool) -> Arc<HostInode> {
        Arc::new(HostInode {
            fd,
            owner: Mutex::new(VirtualOwner::default()),
            is_tty,
            savable,
            watches: Watches::new(),
        })
    }

    pub fn new_dentry(name: &str, fd: OwnedFd, is_tty: bool, savable: bool) -> Arc<Dentry> {
        Dentry::new(name, HostInode::new(fd, is_tty, savable) as Arc<dyn Inode>)
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    pub fn savable(&self) -> bool {
        self.savable
    }

    pub fn set_virtual_owner(&self, owner: VirtualOwner) {
        *self.owner.lock().unwrap() = owner;
    }

    fn host_stat(&self) -> Result<libc::stat, VfsError> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(VfsError::Io);
        }
        Ok(stat)
    }
}

impl Inode for HostInode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn stat(&self) -> FileStat {
        let host = match self.host_stat() {
            Ok(stat) => stat,
            Err(_) => return FileStat::default(),
        };
        let owner = self.owner.lock().unwrap();
        FileStat {
            ino: host.st_ino,
            mode: owner
                .mode
                .map(|m| (host.st_mode & libc::S_IFMT) | (m & 0o7777))
                .unwrap_or(host.st_mode),
            nlink: host.st_nlink as u32,
            uid: owner.uid.unwrap_or(host.st_uid),
            gid: owner.gid.unwrap_or(host.st_gid),
            rdev: host.st_rdev,
            size: host.st_size as u64,
            atime: host.st_atime,
            mtime: host.st_mtime,
            ctime: host.st_ctime,
        }
    }

    fn set_stat(&self, stat: SetStat) -> Result<(), VfsError> {
        // Ownership and mode changes land in the virtual overlay; the
        // host file is left alone.
        let mut owner = self.owner.lock().unwrap();
        if let Some(mode) = stat.mode {
            owner.mode = Some(mode);
        }
        if let Some(uid) = stat.uid {
            owner.uid = Some(uid);
        }
        if let Some(gid) = stat.gid {
            owner.gid = Some(gid);
        }
        drop(owner);
        if let Some(size) = stat.size {
            let rc = unsafe { libc::ftruncate(self.fd.as_raw_fd(), size as libc::off_t) };
            if rc != 0 {
                return Err(VfsError::Io);
            }
        }
        Ok(())
    }

    fn lookup(&self, _name: &str) -> Result<Arc<Dentry>, VfsError> {
        Err(VfsError::NotADirectory)
    }

    fn create(&self, _name: &str, _spec: CreateSpec) -> Result<Arc<Dentry>, VfsError> {
        Err(VfsError::NotADirectory)
    }

    fn unlink(&self, _name: &str) -> Result<(), VfsError> {
        Err(VfsError::NotADirectory)
    }

    fn rename(
        &self,
        _old_name: &str,
        _new_parent: &Arc<dyn Inode>,
        _new_name: &str,
    ) -> Result<(), VfsError> {
        Err(VfsError::NotADirectory)
    }

    fn readlink(&self) -> Result<String, VfsError> {
        Err(VfsError::NotASymlink)
    }

    fn get_xattr(&self, _name: &str) -> Result<Vec<u8>, VfsError> {
        Err(VfsError::NotSupported)
    }

    fn set_xattr(&self, _name: &str, _value: &[u8]) -> Result<(), VfsError> {
        Err(VfsError::NotSupported)
    }

    fn list_xattr(&self) -> Result<Vec<String>, VfsError> {
        Ok(Vec::new())
    }

    fn remove_xattr(&self, _name: &str) -> Result<(), VfsError> {
        Err(VfsError::NotSupported)
    }

    fn iter_dirents(&self) -> Result<Vec<DirEntry>, VfsError> {
        Err(VfsError::NotADirectory)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VfsError> {
        let n = unsafe {
            libc::pread(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(VfsError::Io);
        }
        Ok(n as usize)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        let n = unsafe {
            libc::pwrite(
                self.fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 {
            return Err(VfsError::Io);
        }
        Ok(n as usize)
    }

    fn watches(&self) -> Arc<Watches> {
        Arc::clone(&self.watches)
    }

    fn stat_fs(&self) -> Result<StatFs, VfsError> {
        Ok(StatFs::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn host_file(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        OwnedFd::from(file)
    }

    #[test]
    fn pread_pwrite_through_inode() {
        let inode = HostInode::new(host_file(b"0123456789"), false, true);
        let mut buf = [0u8; 4];
        assert_eq!(inode.read_at(2, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"2345");
        assert_eq!(inode.write_at(0, b"xx").unwrap(), 2);
        let mut buf = [0u8; 2];
        inode.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"xx");
    }

    #[test]
    fn virtual_owner_overrides_host_identity() {
        let inode = HostInode::new(host_file(b""), false, true);
        let host_uid = inode.stat().uid;
        inode.set_virtual_owner(VirtualOwner {
            uid: Some(1234),
            gid: Some(5678),
            mode: Some(0o600),
        });
        let stat = inode.stat();
        assert_eq!(stat.uid, 1234);
        assert_eq!(stat.gid, 5678);
        assert_eq!(stat.mode & 0o7777, 0o600);
        assert_ne!(stat.uid, host_uid);
        // The file type bits still come from the host.
        assert_eq!(stat.mode & libc::S_IFMT, libc::S_IFREG);
    }

    #[test]
    fn set_stat_chown_stays_virtual() {
        let inode = HostInode::new(host_file(b"abc"), false, true);
        inode
            .set_stat(SetStat {
                uid: Some(42),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(inode.stat().uid, 42);
    }

    #[test]
    fn directory_ops_refused() {
        let inode = HostInode::new(host_file(b""), false, true);
        assert!(matches!(inode.lookup("x"), Err(VfsError::NotADirectory)));
        assert!(matches!(inode.iter_dirents(), Err(VfsError::NotADirectory)));
    }
}

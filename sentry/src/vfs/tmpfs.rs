//! tmpfs: the in-memory filesystem.
//!
//! Directories are name -> dentry maps; "." and ".." are synthesized
//! from weak back-pointers so the tree holds no reference cycles.

use super::{
    dentry::Dentry,
    inode::{file_type_of, CreateSpec, DirEntry, FileStat, Inode, SetStat, StatFs, Watches},
    FilesystemType, VfsError,
};
use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

const TMPFS_MAGIC: u64 = 0x0102_1994;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

enum NodeData {
    Directory(Mutex<BTreeMap<String, Arc<Dentry>>>),
    Regular(Mutex<Vec<u8>>),
    Symlink(String),
    Fifo,
    CharDevice { major: u32, minor: u32 },
    BlockDevice { major: u32, minor: u32 },
}

struct Meta {
    mode: u32,
    uid: u32,
    gid: u32,
    nlink: u32,
    atime: i64,
    mtime: i64,
    ctime: i64,
}

pub struct TmpInode {
    ino: u64,
    next_ino: Arc<AtomicU64>,
    meta: Mutex<Meta>,
    xattrs: Mutex<HashMap<String, Vec<u8>>>,
    watches: Arc<Watches>,
    self_dentry: Mutex<Weak<Dentry>>,
    parent: Mutex<Weak<Dentry>>,
    node: NodeData,
}

impl TmpInode {
    fn new(next_ino: Arc<AtomicU64>, mode: u32, node: NodeData) -> Arc<TmpInode> {
        let now = now_secs();
        let ino = next_ino.fetch_add(1, Ordering::AcqRel);
        Arc::new(TmpInode {
            ino,
            next_ino,
            meta: Mutex::new(Meta {
                mode,
                uid: 0,
                gid: 0,
                nlink: 1,
                atime: now,
                mtime: now,
                ctime: now,
            }),
            xattrs: Mutex::new(HashMap::new()),
            watches: Watches::new(),
            self_dentry: Mutex::new(Weak::new()),
            parent: Mutex::new(Weak::new()),
            node,
        })
    }

    fn new_dentry(
        next_ino: Arc<AtomicU64>,
        name: &str,
        mode: u32,
        node: NodeData,
        parent: Option<&Arc<Dentry>>,
    ) -> Arc<Dentry> {
        let inode = TmpInode::new(next_ino, mode, node);
        let dentry = Dentry::new(name, Arc::clone(&inode) as Arc<dyn Inode>);
        *inode.self_dentry.lock().unwrap() = Arc::downgrade(&dentry);
        if let Some(parent) = parent {
            *inode.parent.lock().unwrap() = Arc::downgrade(parent);
        }
        dentry
    }

    fn dir_map(&self) -> Result<&Mutex<BTreeMap<String, Arc<Dentry>>>, VfsError> {
        match &self.node {
            NodeData::Directory(map) => Ok(map),
            _ => Err(VfsError::NotADirectory),
        }
    }

    fn rdev(&self) -> u64 {
        match self.node {
            NodeData::CharDevice { major, minor } | NodeData::BlockDevice { major, minor } => {
                libc::makedev(major, minor)
            }
            _ => 0,
        }
    }

    fn type_bits(&self) -> u32 {
        match self.node {
            NodeData::Directory(_) => libc::S_IFDIR,
            NodeData::Regular(_) => libc::S_IFREG,
            NodeData::Symlink(_) => libc::S_IFLNK,
            NodeData::Fifo => libc::S_IFIFO,
            NodeData::CharDevice { .. } => libc::S_IFCHR,
            NodeData::BlockDevice { .. } => libc::S_IFBLK,
        }
    }
}

impl Inode for TmpInode {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn stat(&self) -> FileStat {
        let meta = self.meta.lock().unwrap();
        let size = match &self.node {
            NodeData::Regular(data) => data.lock().unwrap().len() as u64,
            NodeData::Symlink(target) => target.len() as u64,
            _ => 0,
        };
        FileStat {
            ino: self.ino,
            mode: self.type_bits() | (meta.mode & 0o7777),
            nlink: meta.nlink,
            uid: meta.uid,
            gid: meta.gid,
            rdev: self.rdev(),
            size,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
        }
    }

    fn set_stat(&self, stat: SetStat) -> Result<(), VfsError> {
        let mut meta = self.meta.lock().unwrap();
        if let Some(mode) = stat.mode {
            meta.mode = mode & 0o7777;
        }
        if let Some(uid) = stat.uid {
            meta.uid = uid;
        }
        if let Some(gid) = stat.gid {
            meta.gid = gid;
        }
        if let Some(atime) = stat.atime {
            meta.atime = atime;
        }
        if let Some(mtime) = stat.mtime {
            meta.mtime = mtime;
        }
        meta.ctime = now_secs();
        drop(meta);
        if let Some(size) = stat.size {
            match &self.node {
                NodeData::Regular(data) => data.lock().unwrap().resize(size as usize, 0),
                _ => return Err(VfsError::InvalidArgument),
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<Arc<Dentry>, VfsError> {
        let map = self.dir_map()?;
        match name {
            "." => self
                .self_dentry
                .lock()
                .unwrap()
                .upgrade()
                .ok_or(VfsError::NotFound),
            ".." => {
                let parent = self.parent.lock().unwrap().upgrade();
                match parent {
                    Some(parent) => Ok(parent),
                    // The root's ".." is itself.
                    None => self
                        .self_dentry
                        .lock()
                        .unwrap()
                        .upgrade()
                        .ok_or(VfsError::NotFound),
                }
            }
            _ => map
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or(VfsError::NotFound),
        }
    }

    fn create(&self, name: &str, spec: CreateSpec) -> Result<Arc<Dentry>, VfsError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::InvalidArgument);
        }
        let map = self.dir_map()?;
        let mut map = map.lock().unwrap();
        if map.contains_key(name) {
            return Err(VfsError::Exists);
        }
        let parent = self
            .self_dentry
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(VfsError::NotFound)?;
        let (mode, node) = match spec {
            CreateSpec::Regular { mode } => (mode, NodeData::Regular(Mutex::new(Vec::new()))),
            CreateSpec::Directory { mode } => {
                (mode, NodeData::Directory(Mutex::new(BTreeMap::new())))
            }
            CreateSpec::Symlink { target } => (0o777, NodeData::Symlink(target)),
            CreateSpec::Fifo { mode } => (mode, NodeData::Fifo),
            CreateSpec::CharDevice { mode, major, minor } => {
                (mode, NodeData::CharDevice { major, minor })
            }
            CreateSpec::BlockDevice { mode, major, minor } => {
                (mode, NodeData::BlockDevice { major, minor })
            }
        };
        let child = TmpInode::new_dentry(
            Arc::clone(&self.next_ino),
            name,
            mode,
            node,
            Some(&parent),
        );
        map.insert(name.to_string(), Arc::clone(&child));
        let mut meta = self.meta.lock().unwrap();
        meta.mtime = now_secs();
        drop(meta);
        Ok(child)
    }

    fn unlink(&self, name: &str) -> Result<(), VfsError> {
        if name == "." || name == ".." {
            return Err(VfsError::InvalidArgument);
        }
        let map = self.dir_map()?;
        let mut map = map.lock().unwrap();
        let child = map.get(name).ok_or(VfsError::NotFound)?;
        if let Some(inode) = child.inode().as_any().downcast_ref::<TmpInode>() {
            if let NodeData::Directory(children) = &inode.node {
                if !children.lock().unwrap().is_empty() {
                    return Err(VfsError::NotEmpty);
                }
            }
        }
        map.remove(name);
        self.meta.lock().unwrap().mtime = now_secs();
        Ok(())
    }

    fn rename(
        &self,
        old_name: &str,
        new_parent: &Arc<dyn Inode>,
        new_name: &str,
    ) -> Result<(), VfsError> {
        if old_name == "." || old_name == ".." || new_name == "." || new_name == ".." {
            return Err(VfsError::InvalidArgument);
        }
        let dst = new_parent
            .as_any()
            .downcast_ref::<TmpInode>()
            .ok_or(VfsError::NotSupported)?;
        let src_map = self.dir_map()?;
        let dst_map = dst.dir_map()?;

        let same_dir = std::ptr::eq(src_map, dst_map);
        if same_dir {
            let mut map = src_map.lock().unwrap();
            let child = map.remove(old_name).ok_or(VfsError::NotFound)?;
            map.insert(new_name.to_string(), child);
        } else {
            let mut src = src_map.lock().unwrap();
            let mut dstm = dst_map.lock().unwrap();
            let child = src.remove(old_name).ok_or(VfsError::NotFound)?;
            if let Some(inode) = child.inode().as_any().downcast_ref::<TmpInode>() {
                let new_parent_dentry = dst
                    .self_dentry
                    .lock()
                    .unwrap()
                    .upgrade()
                    .ok_or(VfsError::NotFound)?;
                *inode.parent.lock().unwrap() = Arc::downgrade(&new_parent_dentry);
            }
            dstm.insert(new_name.to_string(), child);
        }
        self.meta.lock().unwrap().mtime = now_secs();
        Ok(())
    }

    fn readlink(&self) -> Result<String, VfsError> {
        match &self.node {
            NodeData::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::NotASymlink),
        }
    }

    fn get_xattr(&self, name: &str) -> Result<Vec<u8>, VfsError> {
        self.xattrs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(VfsError::NoAttribute)
    }

    fn set_xattr(&self, name: &str, value: &[u8]) -> Result<(), VfsError> {
        self.xattrs
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn list_xattr(&self) -> Result<Vec<String>, VfsError> {
        let mut names: Vec<String> = self.xattrs.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn remove_xattr(&self, name: &str) -> Result<(), VfsError> {
        self.xattrs
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(VfsError::NoAttribute)
    }

    fn iter_dirents(&self) -> Result<Vec<DirEntry>, VfsError> {
        let map = self.dir_map()?;
        let mut entries = vec![
            DirEntry {
                name: ".".into(),
                ino: self.ino,
                file_type: libc::DT_DIR,
            },
            DirEntry {
                name: "..".into(),
                ino: self.ino,
                file_type: libc::DT_DIR,
            },
        ];
        for (name, child) in map.lock().unwrap().iter() {
            let stat = child.inode().stat();
            entries.push(DirEntry {
                name: name.clone(),
                ino: stat.ino,
                file_type: file_type_of(stat.mode),
            });
        }
        Ok(entries)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VfsError> {
        match &self.node {
            NodeData::Regular(data) => {
                let data = data.lock().unwrap();
                let offset = offset as usize;
                if offset >= data.len() {
                    return Ok(0);
                }
                let n = buf.len().min(data.len() - offset);
                buf[..n].copy_from_slice(&data[offset..offset + n]);
                Ok(n)
            }
            NodeData::Directory(_) => Err(VfsError::IsADirectory),
            _ => Err(VfsError::NotSupported),
        }
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize, VfsError> {
        match &self.node {
            NodeData::Regular(contents) => {
                let mut contents = contents.lock().unwrap();
                let offset = offset as usize;
                if contents.len() < offset + data.len() {
                    contents.resize(offset + data.len(), 0);
                }
                contents[offset..offset + data.len()].copy_from_slice(data);
                self.meta.lock().unwrap().mtime = now_secs();
                Ok(data.len())
            }
            NodeData::Directory(_) => Err(VfsError::IsADirectory),
            _ => Err(VfsError::NotSupported),
        }
    }

    fn watches(&self) -> Arc<Watches> {
        Arc::clone(&self.watches)
    }

    fn stat_fs(&self) -> Result<StatFs, VfsError> {
        Ok(StatFs {
            fs_type: TMPFS_MAGIC,
            block_size: crate::arch::PAGE_SIZE,
            blocks: 0,
            blocks_free: 0,
            files: 0,
        })
    }
}

/// One tmpfs instance.
pub struct TmpFilesystem {
    root: Arc<Dentry>,
}

impl TmpFilesystem {
    pub fn new() -> Arc<TmpFilesystem> {
        let next_ino = Arc::new(AtomicU64::new(1));
        let root = TmpInode::new_dentry(
            next_ino,
            "/",
            0o755,
            NodeData::Directory(Mutex::new(BTreeMap::new())),
            None,
        );
        Arc::new(TmpFilesystem { root })
    }

    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }
}

/// The registrable "tmpfs" filesystem type.
pub struct TmpfsType;

impl FilesystemType for TmpfsType {
    fn name(&self) -> &'static str {
        "tmpfs"
    }

    fn mount_root(&self, _source: &str) -> Result<Arc<Dentry>, VfsError> {
        Ok(Arc::clone(TmpFilesystem::new().root()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lookup_unlink() {
        let fs = TmpFilesystem::new();
        let root = fs.root().inode();
        let file = root
            .create("hello", CreateSpec::Regular { mode: 0o644 })
            .unwrap();
        assert_eq!(file.name(), "hello");
        assert!(matches!(
            root.create("hello", CreateSpec::Regular { mode: 0o644 }),
            Err(VfsError::Exists)
        ));
        assert!(root.lookup("hello").is_ok());
        root.unlink("hello").unwrap();
        assert!(matches!(root.lookup("hello"), Err(VfsError::NotFound)));
    }

    #[test]
    fn dot_and_dotdot() {
        let fs = TmpFilesystem::new();
        let root = fs.root();
        let dir = root
            .inode()
            .create("d", CreateSpec::Directory { mode: 0o755 })
            .unwrap();
        let dot = dir.inode().lookup(".").unwrap();
        assert!(Arc::ptr_eq(&dot, &dir));
        let up = dir.inode().lookup("..").unwrap();
        assert!(Arc::ptr_eq(&up, root));
        // Root's parent is itself.
        let root_up = root.inode().lookup("..").unwrap();
        assert!(Arc::ptr_eq(&root_up, root));
    }

    #[test]
    fn file_io_and_truncate() {
        let fs = TmpFilesystem::new();
        let file = fs
            .root()
            .inode()
            .create("data", CreateSpec::Regular { mode: 0o600 })
            .unwrap();
        let inode = file.inode();
        assert_eq!(inode.write_at(0, b"abcdef").unwrap(), 6);
        assert_eq!(inode.stat().size, 6);
        inode
            .set_stat(SetStat {
                size: Some(3),
                ..Default::default()
            })
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(inode.read_at(0, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        // Sparse write past the end zero-fills.
        inode.write_at(5, b"z").unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(inode.read_at(0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"abc\0\0z");
    }

    #[test]
    fn rmdir_requires_empty() {
        let fs = TmpFilesystem::new();
        let root = fs.root().inode();
        let dir = root
            .create("d", CreateSpec::Directory { mode: 0o755 })
            .unwrap();
        dir.inode()
            .create("f", CreateSpec::Regular { mode: 0o644 })
            .unwrap();
        assert!(matches!(root.unlink("d"), Err(VfsError::NotEmpty)));
        dir.inode().unlink("f").unwrap();
        root.unlink("d").unwrap();
    }

    #[test]
    fn rename_across_directories() {
        let fs = TmpFilesystem::new();
        let root = fs.root().inode();
        let a = root
            .create("a", CreateSpec::Directory { mode: 0o755 })
            .unwrap();
        let b = root
            .create("b", CreateSpec::Directory { mode: 0o755 })
            .unwrap();
        a.inode()
            .create("f", CreateSpec::Directory { mode: 0o755 })
            .unwrap();
        a.inode()
            .rename("f", b.inode(), "g")
            .unwrap();
        assert!(matches!(a.inode().lookup("f"), Err(VfsError::NotFound)));
        let moved = b.inode().lookup("g").unwrap();
        // The moved dentry's ".." follows it.
        assert!(Arc::ptr_eq(&moved.inode().lookup("..").unwrap(), &b));
    }

    #[test]
    fn xattrs_roundtrip() {
        let fs = TmpFilesystem::new();
        let file = fs
            .root()
            .inode()
            .create("f", CreateSpec::Regular { mode: 0o644 })
            .unwrap();
        let inode = file.inode();
        inode.set_xattr("user.tag", b"v1").unwrap();
        assert_eq!(inode.get_xattr("user.tag").unwrap(), b"v1");
        assert_eq!(inode.list_xattr().unwrap(), vec!["user.tag"]);
        inode.remove_xattr("user.tag").unwrap();
        assert!(matches!(
            inode.get_xattr("user.tag"),
            Err(VfsError::NoAttribute)
        ));
    }

    #[test]
    fn dirents_include_dot_entries() {
        let fs = TmpFilesystem::new();
        let root = fs.root().inode();
        root.create("x", CreateSpec::Regular { mode: 0o644 })
            .unwrap();
        let names: Vec<String> = root
            .iter_dirents()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "x"]);
    }
}

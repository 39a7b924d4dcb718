//! The virtual filesystem: mount tree, dentry graph, path resolution.
//!
//! Lock order: the single `mount_mu` serializes mount tree changes;
//! per-dentry mutexes guard deletion and renames, acquired in address
//! order when two are needed. References collected while umounting are
//! released outside `mount_mu` to avoid reentry into filesystem code
//! with the lock held.

pub mod dentry;
pub mod fd_table;
pub mod host;
pub mod inode;
pub mod mount;
pub mod tmpfs;

pub use dentry::{Dentry, EventType};
pub use fd_table::{FdFlags, FdTable};
pub use inode::{
    CreateSpec, DirEntry, EventQueue, FileLocks, FileStat, Inode, Notification, SetStat, StatFs,
    Watches,
};
pub use mount::{Mount, MountFlags, MountNamespace, Propagation};

use bitflags::bitflags;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;

/// Most symlinks any single resolution will follow.
pub const MAX_SYMLINK_TRAVERSALS: u32 = 40;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    #[error("not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("expected a symlink, found another node type")]
    NotASymlink,

    #[error("too many nested symbolic links")]
    SymlinkLoop,

    #[error("resource busy")]
    Busy,

    #[error("file exists")]
    Exists,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("permission denied")]
    PermissionDenied,

    #[error("operation not supported by this node")]
    NotSupported,

    #[error("no such attribute")]
    NoAttribute,

    #[error("directory not empty")]
    NotEmpty,

    #[error("i/o error")]
    Io,
}

impl VfsError {
    /// The errno an application sees for this error.
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound => libc::ENOENT,
            VfsError::NotADirectory => libc::ENOTDIR,
            VfsError::IsADirectory => libc::EISDIR,
            VfsError::NotASymlink => libc::EINVAL,
            VfsError::SymlinkLoop => libc::ELOOP,
            VfsError::Busy => libc::EBUSY,
            VfsError::Exists => libc::EEXIST,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::PermissionDenied => libc::EACCES,
            VfsError::NotSupported => libc::ENOTSUP,
            VfsError::NoAttribute => libc::ENODATA,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::Io => libc::EIO,
        }
    }
}

bitflags! {
    /// Propagation selector for set_mount_propagation_at. The call
    /// requires exactly one bit.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct PropagationFlags: u32 {
        const SHARED = 1;
        const PRIVATE = 2;
        const SLAVE = 4;
        const UNBINDABLE = 8;
    }
}

/// A (mount, dentry) pair: one name for a file in the forest.
#[derive(Clone)]
pub struct VirtualDentry {
    pub mount: Arc<Mount>,
    pub dentry: Arc<Dentry>,
}

impl VirtualDentry {
    pub fn new(mount: Arc<Mount>, dentry: Arc<Dentry>) -> VirtualDentry {
        dentry.inc_ref();
        VirtualDentry { mount, dentry }
    }

    pub fn release(self) {
        self.dentry.dec_ref();
    }
}

impl std::fmt::Debug for VirtualDentry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VirtualDentry({:?})", self.dentry.name())
    }
}

/// A path resolution request.
pub struct PathOperation {
    /// The caller's root; absolute paths restart here.
    pub root: VirtualDentry,
    /// Where relative paths start.
    pub start: VirtualDentry,
    pub path: String,
    pub follow_final_symlink: bool,
    /// An empty path resolves to `start` only when set (AT_EMPTY_PATH).
    pub allow_empty: bool,
}

/// A reference whose DecRef was deferred out of the mount lock.
pub enum DeferredRelease {
    Dentry(Arc<Dentry>),
    Mount(Arc<Mount>),
}

impl DeferredRelease {
    pub fn release(self) {
        match self {
            DeferredRelease::Dentry(dentry) => dentry.dec_ref(),
            DeferredRelease::Mount(_mount) => {}
        }
    }
}

/// A mountable filesystem implementation.
pub trait FilesystemType: Send + Sync {
    fn name(&self) -> &'static str;
    /// Creates a fresh instance, returning its root dentry.
    fn mount_root(&self, source: &str) -> Result<Arc<Dentry>, VfsError>;
}

#[derive(Default)]
struct MountState {
    /// Global map of dentry -> mounts whose point is that dentry, across
    /// all namespaces.
    mountpoints: HashMap<usize, Vec<Arc<Mount>>>,
}

pub struct VirtualFilesystem {
    mount_mu: Mutex<MountState>,
    fs_types: Mutex<HashMap<&'static str, Arc<dyn FilesystemType>>>,
}

impl Default for VirtualFilesystem {
    fn default() -> Self {
        VirtualFilesystem::new()
    }
}

impl VirtualFilesystem {
    pub fn new() -> VirtualFilesystem {
        VirtualFilesystem {
            mount_mu: Mutex::new(MountState::default()),
            fs_types: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_filesystem(&self, fs_type: Arc<dyn FilesystemType>) {
        let name = fs_type.name();
        if self
            .fs_types
            .lock()
            .unwrap()
            .insert(name, fs_type)
            .is_some()
        {
            panic!("filesystem type {name:?} registered twice");
        }
    }

    pub fn get_filesystem(&self, name: &str) -> Option<Arc<dyn FilesystemType>> {
        self.fs_types.lock().unwrap().get(name).cloned()
    }

    /// Creates the root mount of a fresh namespace.
    pub fn mount_root(
        &self,
        ns: &Arc<MountNamespace>,
        fs_type: &str,
        source: &str,
        flags: MountFlags,
    ) -> Result<Arc<Mount>, VfsError> {
        let fs = self
            .get_filesystem(fs_type)
            .ok_or(VfsError::NotSupported)?;
        let root = fs.mount_root(source)?;
        let mount = Mount::new(fs_type, root, flags, ns);
        mount.root().inc_ref();
        ns.set_root_mount(Arc::clone(&mount));
        Ok(mount)
    }

    /// Mounts a new filesystem instance at `target`.
    pub fn mount_at(
        &self,
        ns: &Arc<MountNamespace>,
        fs_type: &str,
        source: &str,
        target: &VirtualDentry,
        flags: MountFlags,
    ) -> Result<Arc<Mount>, VfsError> {
        let fs = self
            .get_filesystem(fs_type)
            .ok_or(VfsError::NotSupported)?;

        // Mounting over a dentry races with its deletion; the dentry
        // mutex arbitrates, and a dead dentry refuses new mounts.
        target.dentry.lock();
        if target.dentry.is_dead_locked() {
            target.dentry.unlock();
            return Err(VfsError::NotFound);
        }
        let root = match fs.mount_root(source) {
            Ok(root) => root,
            Err(err) => {
                target.dentry.unlock();
                return Err(err);
            }
        };
        let mount = Mount::new(fs_type, root, flags, ns);

        let mut state = self.mount_mu.lock().unwrap();
        mount.set_key(Some(mount::MountKey {
            parent: Arc::clone(&target.mount),
            point: Arc::clone(&target.dentry),
        }));
        target.dentry.inc_mounts();
        target.dentry.inc_ref();
        mount.root().inc_ref();
        ns.inc_mountpoint(&target.dentry);
        target.mount.add_child(Arc::clone(&mount));
        state
            .mountpoints
            .entry(target.dentry.key())
            .or_default()
            .push(Arc::clone(&mount));
        drop(state);
        target.dentry.unlock();
        log::debug!(
            "mounted {} at {:?} in namespace",
            fs_type,
            target.dentry.name()
        );
        Ok(mount)
    }

    /// Sets the propagation type of a mount; exactly one flag must be
    /// given.
    pub fn set_mount_propagation_at(
        &self,
        mount: &Arc<Mount>,
        flags: PropagationFlags,
    ) -> Result<(), VfsError> {
        let propagation = match flags {
            PropagationFlags::SHARED => Propagation::Shared,
            PropagationFlags::PRIVATE => Propagation::Private,
            PropagationFlags::SLAVE => Propagation::Slave,
            PropagationFlags::UNBINDABLE => Propagation::Unbindable,
            _ => return Err(VfsError::InvalidArgument),
        };
        mount.set_propagation(propagation);
        Ok(())
    }

    /// Unmounts `mount` and all mounts stacked under it. References are
    /// collected under the mount lock and dropped after it is released.
    pub fn umount(&self, mount: &Arc<Mount>) -> Result<(), VfsError> {
        if mount.point().is_none() {
            // Namespace roots don't come off.
            return Err(VfsError::InvalidArgument);
        }
        let mut released = Vec::new();
        {
            let mut state = self.mount_mu.lock().unwrap();
            self.umount_recursive_locked(&mut state, mount, &mut released);
        }
        for r in released {
            r.release();
        }
        Ok(())
    }

    fn umount_recursive_locked(
        &self,
        state: &mut MountState,
        mount: &Arc<Mount>,
        released: &mut Vec<DeferredRelease>,
    ) {
        for child in mount.children() {
            self.umount_recursive_locked(state, &child, released);
        }
        if let Some(point) = mount.point() {
            if let Some(parent) = mount.parent() {
                parent.remove_child(mount);
            }
            if let Some(ns) = mount.namespace() {
                ns.dec_mountpoint(&point);
            }
            point.dec_mounts();
            if let Some(mounts) = state.mountpoints.get_mut(&point.key()) {
                mounts.retain(|m| !Arc::ptr_eq(m, mount));
                if mounts.is_empty() {
                    state.mountpoints.remove(&point.key());
                }
            }
            mount.set_key(None);
            released.push(DeferredRelease::Dentry(point));
        }
        released.push(DeferredRelease::Dentry(Arc::clone(mount.root())));
        released.push(DeferredRelease::Mount(Arc::clone(mount)));
    }

    /// Must be called before deleting the file at `d`. Fails with EBUSY
    /// when a mount in `ns` sits on `d`; on success the dentry mutex is
    /// held and the caller must finish with abort_delete_dentry or
    /// commit_delete_dentry.
    pub fn prepare_delete_dentry(
        &self,
        ns: &Arc<MountNamespace>,
        d: &Arc<Dentry>,
    ) -> Result<(), VfsError> {
        let state = self.mount_mu.lock().unwrap();
        if ns.is_mountpoint(d) {
            return Err(VfsError::Busy);
        }
        d.lock();
        drop(state);
        Ok(())
    }

    /// Unwinds prepare_delete_dentry after a failed deletion.
    pub fn abort_delete_dentry(&self, d: &Arc<Dentry>) {
        d.unlock();
    }

    /// Completes a deletion: marks the dentry dead, releases its mutex,
    /// and detaches any mounts in other namespaces rooted on it.
    pub fn commit_delete_dentry(&self, d: &Arc<Dentry>) {
        d.mark_dead_locked();
        d.unlock();
        if d.is_mounted() {
            let released = self.forget_dead_mountpoint(d);
            for r in released {
                r.release();
            }
        }
    }

    /// Handles a file deleted behind the sentry's back: marks the dentry
    /// dead and returns the references the caller must release (deferring
    /// them avoids re-entering filesystem code under our locks).
    pub fn invalidate_dentry(&self, d: &Arc<Dentry>) -> Vec<DeferredRelease> {
        d.lock();
        d.mark_dead_locked();
        d.unlock();
        if d.is_mounted() {
            self.forget_dead_mountpoint(d)
        } else {
            Vec::new()
        }
    }

    /// Detaches every mount, in any namespace, whose point is the dead
    /// dentry `d`.
    fn forget_dead_mountpoint(&self, d: &Arc<Dentry>) -> Vec<DeferredRelease> {
        let mut released = Vec::new();
        let mut state = self.mount_mu.lock().unwrap();
        let mounts = state
            .mountpoints
            .get(&d.key())
            .cloned()
            .unwrap_or_default();
        for mount in mounts {
            self.umount_recursive_locked(&mut state, &mount, &mut released);
        }
        released
    }

    /// Locks `from` (and `to` when replacing) for a rename, in address
    /// order. EBUSY when either is a mount point in `ns`. On success the
    /// caller must finish with abort_rename_dentry or a commit.
    pub fn prepare_rename_dentry(
        &self,
        ns: &Arc<MountNamespace>,
        from: &Arc<Dentry>,
        to: Option<&Arc<Dentry>>,
    ) -> Result<(), VfsError> {
        let state = self.mount_mu.lock().unwrap();
        if ns.is_mountpoint(from) {
            return Err(VfsError::Busy);
        }
        if let Some(to) = to {
            if ns.is_mountpoint(to) {
                return Err(VfsError::Busy);
            }
            if from.key() < to.key() {
                from.lock();
                to.lock();
            } else {
                to.lock();
                from.lock();
            }
        } else {
            from.lock();
        }
        drop(state);
        Ok(())
    }

    pub fn abort_rename_dentry(&self, from: &Arc<Dentry>, to: Option<&Arc<Dentry>>) {
        from.unlock();
        if let Some(to) = to {
            to.unlock();
        }
    }

    /// Completes a replacing rename: `to`, if present, is the dentry that
    /// was overwritten and becomes dead.
    pub fn commit_rename_replace_dentry(&self, from: &Arc<Dentry>, to: Option<&Arc<Dentry>>) {
        from.unlock();
        if let Some(to) = to {
            to.mark_dead_locked();
            to.unlock();
            if to.is_mounted() {
                let released = self.forget_dead_mountpoint(to);
                for r in released {
                    r.release();
                }
            }
        }
    }

    /// Completes an exchanging rename; both dentries stay live.
    pub fn commit_rename_exchange_dentry(&self, from: &Arc<Dentry>, to: &Arc<Dentry>) {
        from.unlock();
        to.unlock();
    }

    /// Resolves a path to a (mount, dentry) pair.
    pub fn resolve(&self, op: &PathOperation) -> Result<VirtualDentry, VfsError> {
        let mut symlinks_left = MAX_SYMLINK_TRAVERSALS;
        let path = op.path.clone();
        if path.is_empty() {
            if !op.allow_empty {
                return Err(VfsError::NotFound);
            }
            return Ok(VirtualDentry::new(
                Arc::clone(&op.start.mount),
                Arc::clone(&op.start.dentry),
            ));
        }
        self.resolve_inner(op, &path, op.follow_final_symlink, &mut symlinks_left)
    }

    fn resolve_inner(
        &self,
        op: &PathOperation,
        path: &str,
        follow_final: bool,
        symlinks_left: &mut u32,
    ) -> Result<VirtualDentry, VfsError> {
        let mut current = if path.starts_with('/') {
            (Arc::clone(&op.root.mount), Arc::clone(&op.root.dentry))
        } else {
            (Arc::clone(&op.start.mount), Arc::clone(&op.start.dentry))
        };

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, component) in components.iter().enumerate() {
            let is_final = i == components.len() - 1;
            let child = current.1.inode().lookup(component)?;
            let mut next = (Arc::clone(&current.0), child);

            // Cross onto whatever is mounted here, topmost first.
            next = self.cross_mounts(&op.start, next)?;

            let mode = next.1.inode().stat().mode;
            if mode & libc::S_IFMT == libc::S_IFLNK && (!is_final || follow_final) {
                if *symlinks_left == 0 {
                    return Err(VfsError::SymlinkLoop);
                }
                *symlinks_left -= 1;
                let target = next.1.inode().readlink()?;
                let sub_op = PathOperation {
                    root: VirtualDentry {
                        mount: Arc::clone(&op.root.mount),
                        dentry: Arc::clone(&op.root.dentry),
                    },
                    start: VirtualDentry {
                        mount: Arc::clone(&current.0),
                        dentry: Arc::clone(&current.1),
                    },
                    path: target.clone(),
                    follow_final_symlink: true,
                    allow_empty: false,
                };
                let resolved = self.resolve_inner(&sub_op, &target, true, symlinks_left)?;
                if is_final {
                    return Ok(resolved);
                }
                next = (Arc::clone(&resolved.mount), Arc::clone(&resolved.dentry));
                resolved.release();
            } else if !is_final && mode & libc::S_IFMT != libc::S_IFDIR {
                return Err(VfsError::NotADirectory);
            }
            current = next;
        }
        Ok(VirtualDentry::new(current.0, current.1))
    }

    fn cross_mounts(
        &self,
        at: &VirtualDentry,
        mut current: (Arc<Mount>, Arc<Dentry>),
    ) -> Result<(Arc<Mount>, Arc<Dentry>), VfsError> {
        let ns = match at.mount.namespace() {
            Some(ns) => ns,
            None => return Ok(current),
        };
        while current.1.is_mounted() {
            let state = self.mount_mu.lock().unwrap();
            let mounted = state
                .mountpoints
                .get(&current.1.key())
                .and_then(|mounts| {
                    mounts
                        .iter()
                        .rev()
                        .find(|m| {
                            m.namespace()
                                .map(|mns| Arc::ptr_eq(&mns, &ns))
                                .unwrap_or(false)
                        })
                        .cloned()
                });
            drop(state);
            match mounted {
                Some(mount) => {
                    let root = Arc::clone(mount.root());
                    current = (mount, root);
                }
                None => break,
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests;

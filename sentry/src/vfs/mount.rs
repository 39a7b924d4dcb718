//! Mounts and mount namespaces.

use super::dentry::Dentry;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

/// Mount propagation types. Exactly one applies to a mount at a time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Propagation {
    Shared,
    Private,
    Slave,
    Unbindable,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct MountFlags {
    pub read_only: bool,
    pub no_exec: bool,
    pub no_atime: bool,
}

/// Where a mount hangs in the tree: the parent mount and the dentry it
/// covers. None for a namespace root.
pub struct MountKey {
    pub parent: Arc<Mount>,
    pub point: Arc<Dentry>,
}

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// A mounted filesystem instance: (root dentry, mount point, propagation,
/// flags).
pub struct Mount {
    id: u64,
    fs_type: String,
    root: Arc<Dentry>,
    key: Mutex<Option<MountKey>>,
    propagation: Mutex<Propagation>,
    flags: MountFlags,
    children: Mutex<Vec<Arc<Mount>>>,
    ns: Weak<MountNamespace>,
}

impl Mount {
    pub fn new(
        fs_type: &str,
        root: Arc<Dentry>,
        flags: MountFlags,
        ns: &Arc<MountNamespace>,
    ) -> Arc<Mount> {
        Arc::new(Mount {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::AcqRel),
            fs_type: fs_type.to_string(),
            root,
            key: Mutex::new(None),
            propagation: Mutex::new(Propagation::Private),
            flags,
            children: Mutex::new(Vec::new()),
            ns: Arc::downgrade(ns),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fs_type(&self) -> &str {
        &self.fs_type
    }

    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub fn namespace(&self) -> Option<Arc<MountNamespace>> {
        self.ns.upgrade()
    }

    pub fn propagation(&self) -> Propagation {
        *self.propagation.lock().unwrap()
    }

    pub fn set_propagation(&self, propagation: Propagation) {
        *self.propagation.lock().unwrap() = propagation;
    }

    /// The dentry this mount covers, None for a root mount.
    pub fn point(&self) -> Option<Arc<Dentry>> {
        self.key
            .lock()
            .unwrap()
            .as_ref()
            .map(|key| Arc::clone(&key.point))
    }

    pub fn parent(&self) -> Option<Arc<Mount>> {
        self.key
            .lock()
            .unwrap()
            .as_ref()
            .map(|key| Arc::clone(&key.parent))
    }

    pub(super) fn set_key(&self, key: Option<MountKey>) {
        *self.key.lock().unwrap() = key;
    }

    pub(super) fn add_child(&self, child: Arc<Mount>) {
        self.children.lock().unwrap().push(child);
    }

    pub(super) fn remove_child(&self, child: &Arc<Mount>) {
        self.children
            .lock()
            .unwrap()
            .retain(|c| !Arc::ptr_eq(c, child));
    }

    pub fn children(&self) -> Vec<Arc<Mount>> {
        self.children.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("fs_type", &self.fs_type)
            .field("propagation", &self.propagation())
            .finish()
    }
}

/// One isolated view of the mount tree.
pub struct MountNamespace {
    root_mount: Mutex<Option<Arc<Mount>>>,
    /// Count of mounts in this namespace whose point is the keyed dentry.
    mountpoints: Mutex<std::collections::HashMap<usize, u32>>,
}

impl MountNamespace {
    pub fn new() -> Arc<MountNamespace> {
        Arc::new(MountNamespace {
            root_mount: Mutex::new(None),
            mountpoints: Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn root_mount(&self) -> Option<Arc<Mount>> {
        self.root_mount.lock().unwrap().clone()
    }

    pub(super) fn set_root_mount(&self, mount: Arc<Mount>) {
        *self.root_mount.lock().unwrap() = Some(mount);
    }

    /// Whether any mount in this namespace sits on `dentry`.
    pub fn is_mountpoint(&self, dentry: &Arc<Dentry>) -> bool {
        self.mountpoints
            .lock()
            .unwrap()
            .get(&dentry.key())
            .copied()
            .unwrap_or(0)
            != 0
    }

    pub(super) fn inc_mountpoint(&self, dentry: &Arc<Dentry>) {
        *self
            .mountpoints
            .lock()
            .unwrap()
            .entry(dentry.key())
            .or_insert(0) += 1;
    }

    pub(super) fn dec_mountpoint(&self, dentry: &Arc<Dentry>) {
        let mut mountpoints = self.mountpoints.lock().unwrap();
        let count = mountpoints
            .get_mut(&dentry.key())
            .expect("dec_mountpoint without matching inc");
        *count -= 1;
        if *count == 0 {
            mountpoints.remove(&dentry.key());
        }
    }
}

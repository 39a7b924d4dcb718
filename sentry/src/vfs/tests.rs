use super::*;
use crate::vfs::tmpfs::TmpfsType;
use std::sync::Arc;

struct Harness {
    vfs: VirtualFilesystem,
    ns: Arc<MountNamespace>,
    root_mount: Arc<Mount>,
}

impl Harness {
    fn new() -> Harness {
        let vfs = VirtualFilesystem::new();
        vfs.register_filesystem(Arc::new(TmpfsType));
        let ns = MountNamespace::new();
        let root_mount = vfs
            .mount_root(&ns, "tmpfs", "", MountFlags::default())
            .unwrap();
        Harness {
            vfs,
            ns,
            root_mount,
        }
    }

    fn root_vd(&self) -> VirtualDentry {
        VirtualDentry {
            mount: Arc::clone(&self.root_mount),
            dentry: Arc::clone(self.root_mount.root()),
        }
    }

    fn resolve(&self, path: &str) -> Result<VirtualDentry, VfsError> {
        self.vfs.resolve(&PathOperation {
            root: self.root_vd(),
            start: self.root_vd(),
            path: path.to_string(),
            follow_final_symlink: true,
            allow_empty: false,
        })
    }

    fn mkdir(&self, path: &str) -> Arc<Dentry> {
        let (parent, name) = path.rsplit_once('/').unwrap();
        let parent = if parent.is_empty() {
            Arc::clone(self.root_mount.root())
        } else {
            let vd = self.resolve(parent).unwrap();
            let dentry = Arc::clone(&vd.dentry);
            vd.release();
            dentry
        };
        parent
            .inode()
            .create(name, CreateSpec::Directory { mode: 0o755 })
            .unwrap()
    }
}

#[test]
fn resolution_walks_components() {
    let h = Harness::new();
    h.mkdir("/a");
    h.mkdir("/a/b");
    let file = h
        .resolve("/a")
        .unwrap();
    file.dentry
        .inode()
        .create("f", CreateSpec::Regular { mode: 0o644 })
        .unwrap();
    file.release();

    let vd = h.resolve("/a/b/../f").unwrap();
    assert_eq!(vd.dentry.name(), "f");
    vd.release();

    assert_eq!(h.resolve("/a/nope").unwrap_err(), VfsError::NotFound);
    assert_eq!(
        h.resolve("/a/f/oops").unwrap_err(),
        VfsError::NotADirectory
    );
}

#[test]
fn symlinks_followed_with_budget() {
    let h = Harness::new();
    h.mkdir("/dir");
    let root = h.root_vd();
    root.dentry
        .inode()
        .create(
            "link",
            CreateSpec::Symlink {
                target: "/dir".into(),
            },
        )
        .unwrap();
    root.release();

    let vd = h.resolve("/link").unwrap();
    assert_eq!(vd.dentry.name(), "dir");
    vd.release();

    // NoFollow stops at the link itself.
    let vd = h
        .vfs
        .resolve(&PathOperation {
            root: h.root_vd(),
            start: h.root_vd(),
            path: "/link".into(),
            follow_final_symlink: false,
            allow_empty: false,
        })
        .unwrap();
    assert_eq!(vd.dentry.name(), "link");
    vd.release();
}

#[test]
fn symlink_loop_is_eloop() {
    let h = Harness::new();
    let root = h.root_vd();
    root.dentry
        .inode()
        .create(
            "x",
            CreateSpec::Symlink {
                target: "/y".into(),
            },
        )
        .unwrap();
    root.dentry
        .inode()
        .create(
            "y",
            CreateSpec::Symlink {
                target: "/x".into(),
            },
        )
        .unwrap();
    root.release();
    assert_eq!(h.resolve("/x").unwrap_err(), VfsError::SymlinkLoop);
}

#[test]
fn deep_symlink_chain_within_budget_resolves() {
    let h = Harness::new();
    let root = h.root_vd();
    root.dentry
        .inode()
        .create("target", CreateSpec::Regular { mode: 0o644 })
        .unwrap();
    // A chain shorter than the budget resolves; the budget bounds total
    // traversals across the whole resolution.
    let mut prev = "target".to_string();
    for i in 0..(MAX_SYMLINK_TRAVERSALS - 1) {
        let name = format!("l{i}");
        root.dentry
            .inode()
            .create(
                &name,
                CreateSpec::Symlink {
                    target: format!("/{prev}"),
                },
            )
            .unwrap();
        prev = name;
    }
    root.release();
    let vd = h.resolve(&format!("/{prev}")).unwrap();
    assert_eq!(vd.dentry.name(), "target");
    vd.release();
}

#[test]
fn empty_path_needs_allow_empty() {
    let h = Harness::new();
    assert_eq!(h.resolve("").unwrap_err(), VfsError::NotFound);
    let vd = h
        .vfs
        .resolve(&PathOperation {
            root: h.root_vd(),
            start: h.root_vd(),
            path: String::new(),
            follow_final_symlink: true,
            allow_empty: true,
        })
        .unwrap();
    assert!(Arc::ptr_eq(&vd.dentry, h.root_mount.root()));
    vd.release();
}

#[test]
fn mount_crossing_resolves_into_new_fs() {
    let h = Harness::new();
    let point = h.mkdir("/m");
    let target = h.resolve("/m").unwrap();
    let mount = h
        .vfs
        .mount_at(&h.ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();

    mount
        .root()
        .inode()
        .create("inner", CreateSpec::Regular { mode: 0o644 })
        .unwrap();

    // Resolving through /m lands in the mounted filesystem.
    let vd = h.resolve("/m/inner").unwrap();
    assert_eq!(vd.dentry.name(), "inner");
    vd.release();
    assert!(point.is_mounted());
    assert!(h.ns.is_mountpoint(&point));

    h.vfs.umount(&mount).unwrap();
    assert!(!point.is_mounted());
    assert_eq!(h.resolve("/m/inner").unwrap_err(), VfsError::NotFound);
}

#[test]
fn umount_root_refused() {
    let h = Harness::new();
    assert_eq!(
        h.vfs.umount(&h.root_mount).unwrap_err(),
        VfsError::InvalidArgument
    );
}

#[test]
fn prepare_delete_holds_mutex_until_commit() {
    let h = Harness::new();
    let dir = h.mkdir("/victim");
    h.vfs.prepare_delete_dentry(&h.ns, &dir).unwrap();
    assert!(dir.is_locked());
    h.vfs.abort_delete_dentry(&dir);
    assert!(!dir.is_locked());

    h.vfs.prepare_delete_dentry(&h.ns, &dir).unwrap();
    assert!(dir.is_locked());
    h.vfs.commit_delete_dentry(&dir);
    assert!(!dir.is_locked());
    assert!(dir.is_dead());
}

#[test]
fn delete_of_mountpoint_is_busy() {
    let h = Harness::new();
    h.mkdir("/m");
    let target = h.resolve("/m").unwrap();
    let dentry = Arc::clone(&target.dentry);
    h.vfs
        .mount_at(&h.ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();
    assert_eq!(
        h.vfs.prepare_delete_dentry(&h.ns, &dentry).unwrap_err(),
        VfsError::Busy
    );
    assert!(!dentry.is_locked());
}

#[test]
fn dead_mountpoint_releases_other_namespace_mounts() {
    // A second namespace mounts on a dentry; deleting the file from the
    // first namespace (where it is not a mount point) must detach the
    // other namespace's mounts and return their references.
    let h = Harness::new();
    let point = h.mkdir("/m");

    let other_ns = MountNamespace::new();
    let other_root = h
        .vfs
        .mount_root(&other_ns, "tmpfs", "", MountFlags::default())
        .unwrap();
    let target = VirtualDentry::new(Arc::clone(&other_root), Arc::clone(&point));
    let refs_before_mount = point.ref_count();
    let mount = h
        .vfs
        .mount_at(&other_ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();
    assert!(point.is_mounted());
    assert_eq!(point.ref_count(), refs_before_mount + 1);

    // Not a mount point in h.ns, so deletion proceeds there.
    h.vfs.prepare_delete_dentry(&h.ns, &point).unwrap();
    point
        .inode()
        .stat(); // the dentry stays usable while locked
    h.vfs.commit_delete_dentry(&point);

    assert!(point.is_dead());
    assert!(!point.is_mounted());
    assert_eq!(point.ref_count(), refs_before_mount);
    assert!(other_root.children().is_empty());
    assert!(!other_ns.is_mountpoint(&point));
    drop(mount);
}

#[test]
fn invalidate_returns_deferred_refs() {
    let h = Harness::new();
    let point = h.mkdir("/ext");
    let target = h.resolve("/ext").unwrap();
    h.vfs
        .mount_at(&h.ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();

    let refs_with_mount = point.ref_count();
    let deferred = h.vfs.invalidate_dentry(&point);
    assert!(!deferred.is_empty());
    assert!(point.is_dead());
    // References are only dropped when the caller releases them.
    assert_eq!(point.ref_count(), refs_with_mount);
    for r in deferred {
        r.release();
    }
    assert_eq!(point.ref_count(), refs_with_mount - 1);
}

#[test]
fn rename_locks_both_in_order() {
    let h = Harness::new();
    let from = h.mkdir("/from");
    let to = h.mkdir("/to");

    h.vfs
        .prepare_rename_dentry(&h.ns, &from, Some(&to))
        .unwrap();
    assert!(from.is_locked());
    assert!(to.is_locked());
    h.vfs.abort_rename_dentry(&from, Some(&to));
    assert!(!from.is_locked());
    assert!(!to.is_locked());

    h.vfs
        .prepare_rename_dentry(&h.ns, &from, Some(&to))
        .unwrap();
    h.vfs.commit_rename_replace_dentry(&from, Some(&to));
    assert!(!from.is_dead());
    assert!(to.is_dead());

    // Exchange keeps both alive.
    let a = h.mkdir("/a");
    let b = h.mkdir("/b");
    h.vfs.prepare_rename_dentry(&h.ns, &a, Some(&b)).unwrap();
    h.vfs.commit_rename_exchange_dentry(&a, &b);
    assert!(!a.is_dead());
    assert!(!b.is_dead());
}

#[test]
fn propagation_needs_exactly_one_flag() {
    let h = Harness::new();
    h.mkdir("/m");
    let target = h.resolve("/m").unwrap();
    let mount = h
        .vfs
        .mount_at(&h.ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();

    assert_eq!(mount.propagation(), Propagation::Private);
    h.vfs
        .set_mount_propagation_at(&mount, PropagationFlags::SHARED)
        .unwrap();
    assert_eq!(mount.propagation(), Propagation::Shared);
    assert_eq!(
        h.vfs
            .set_mount_propagation_at(
                &mount,
                PropagationFlags::SHARED | PropagationFlags::SLAVE
            )
            .unwrap_err(),
        VfsError::InvalidArgument
    );
    assert_eq!(
        h.vfs
            .set_mount_propagation_at(&mount, PropagationFlags::empty())
            .unwrap_err(),
        VfsError::InvalidArgument
    );
}

#[test]
fn recursive_umount_collects_children() {
    let h = Harness::new();
    h.mkdir("/m");
    let target = h.resolve("/m").unwrap();
    let outer = h
        .vfs
        .mount_at(&h.ns, "tmpfs", "", &target, MountFlags::default())
        .unwrap();
    target.release();

    // Mount again inside the first mount.
    outer
        .root()
        .inode()
        .create("sub", CreateSpec::Directory { mode: 0o755 })
        .unwrap();
    let inner_target = h.resolve("/m/sub").unwrap();
    let inner = h
        .vfs
        .mount_at(&h.ns, "tmpfs", "", &inner_target, MountFlags::default())
        .unwrap();
    inner_target.release();
    assert_eq!(outer.children().len(), 1);

    h.vfs.umount(&outer).unwrap();
    assert!(outer.children().is_empty());
    assert!(inner.point().is_none());
    assert!(outer.point().is_none());
}

//! Dentries: named nodes in a filesystem tree.
//!
//! The dentry mutex is a manual lock rather than a scoped guard because
//! the delete and rename protocols hold it across a prepare/commit pair:
//! `prepare_delete_dentry` returns with the mutex held so no mount can
//! slip in underneath, and `commit_delete_dentry` or `abort_delete_dentry`
//! releases it.

use super::inode::{Inode, Watches};
use std::sync::{
    atomic::{AtomicI64, AtomicU32, Ordering},
    Arc, Condvar, Mutex,
};

/// The events inotify distinguishes when notifying a dentry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EventType {
    Inode,
    Path,
}

#[derive(Default)]
struct DentryLockState {
    /// The logical dentry mutex.
    locked: bool,
    /// Set on delete or invalidation; a dead dentry never returns to the
    /// tree.
    dead: bool,
    /// Hint that the dentry will not be accessed again; caching
    /// filesystems may drop it once references reach zero.
    evictable: bool,
}

pub struct Dentry {
    name: String,
    state: Mutex<DentryLockState>,
    unlocked: Condvar,
    /// Number of Mounts for which this dentry is the mount point.
    mounts: AtomicU32,
    /// VFS-visible reference count; memory lifetime is the Arc's job,
    /// this count is what filesystems consult for cache decisions.
    refs: AtomicI64,
    inode: Arc<dyn Inode>,
}

impl Dentry {
    pub fn new(name: &str, inode: Arc<dyn Inode>) -> Arc<Dentry> {
        Arc::new(Dentry {
            name: name.to_string(),
            state: Mutex::new(DentryLockState::default()),
            unlocked: Condvar::new(),
            mounts: AtomicU32::new(0),
            refs: AtomicI64::new(1),
            inode,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    pub fn inc_ref(&self) {
        let old = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(old > 0, "inc_ref on a released dentry");
    }

    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => current = seen,
            }
        }
    }

    pub fn dec_ref(&self) {
        let old = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "dentry reference count underflow");
    }

    pub fn ref_count(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    /// Acquires the dentry mutex.
    pub fn lock(&self) {
        let mut state = self.state.lock().unwrap();
        while state.locked {
            state = self.unlocked.wait(state).unwrap();
        }
        state.locked = true;
    }

    /// Releases the dentry mutex.
    pub fn unlock(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.locked, "unlocking an unlocked dentry");
        state.locked = false;
        self.unlocked.notify_one();
    }

    /// Whether the mutex is currently held. For lock-discipline checks.
    pub fn is_locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Marks the dentry dead. Caller must hold the dentry mutex.
    pub(super) fn mark_dead_locked(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.locked, "mark_dead without the dentry mutex");
        state.dead = true;
    }

    pub fn is_dead(&self) -> bool {
        self.lock();
        let dead = self.state.lock().unwrap().dead;
        self.unlock();
        dead
    }

    /// Reads the dead flag. Caller must hold the dentry mutex.
    pub(super) fn is_dead_locked(&self) -> bool {
        let state = self.state.lock().unwrap();
        debug_assert!(state.locked, "is_dead_locked without the dentry mutex");
        state.dead
    }

    pub fn mark_evictable(&self) {
        self.lock();
        self.state.lock().unwrap().evictable = true;
        self.unlock();
    }

    pub fn is_evictable(&self) -> bool {
        self.lock();
        let evictable = self.state.lock().unwrap().evictable;
        self.unlock();
        evictable
    }

    pub(super) fn inc_mounts(&self) {
        self.mounts.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn dec_mounts(&self) {
        let old = self.mounts.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "dentry mount count underflow");
    }

    /// Non-zero when at least one mount attaches at this dentry.
    pub fn is_mounted(&self) -> bool {
        self.mounts.load(Ordering::Acquire) != 0
    }

    pub fn watches(&self) -> Arc<Watches> {
        self.inode.watches()
    }

    /// Notifies watches on this dentry and its parent; the parent's
    /// watches fire first.
    pub fn inotify_with_parent(
        self: &Arc<Dentry>,
        parent: Option<&Arc<Dentry>>,
        events: u32,
        cookie: u32,
        _et: EventType,
    ) {
        if let Some(parent) = parent {
            parent.watches().notify(&self.name, events, cookie);
        }
        self.watches().notify("", events, cookie);
        if self.watches().is_empty() {
            self.inode.on_zero_watches();
        }
    }

    /// A stable key for identity maps: the address of the dentry object.
    pub fn key(self: &Arc<Dentry>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl std::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &self.name)
            .field("refs", &self.ref_count())
            .field("mounts", &self.mounts.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::tmpfs;

    fn test_dentry() -> Arc<Dentry> {
        let fs = tmpfs::TmpFilesystem::new();
        fs.root().clone()
    }

    #[test]
    fn manual_lock_discipline() {
        let d = test_dentry();
        assert!(!d.is_locked());
        d.lock();
        assert!(d.is_locked());
        d.unlock();
        assert!(!d.is_locked());
    }

    #[test]
    fn try_inc_ref_fails_at_zero() {
        let d = test_dentry();
        assert!(d.try_inc_ref());
        d.dec_ref();
        d.dec_ref();
        assert_eq!(d.ref_count(), 0);
        assert!(!d.try_inc_ref());
    }

    #[test]
    fn lock_excludes_other_threads() {
        let d = test_dentry();
        d.lock();
        let contender = {
            let d = Arc::clone(&d);
            std::thread::spawn(move || {
                d.lock();
                d.unlock();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        d.unlock();
        contender.join().unwrap();
    }
}

//! Tasks: the runnable entities.

use super::{credentials::Credentials, signal::TaskSignalState, ThreadGroupId};
use crate::{
    arch::ArchContext,
    mm::MemoryManager,
    vfs::FdTable,
};
use std::sync::{Arc, Mutex};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TaskState {
    Created,
    Runnable,
    /// Stopped by SIGSTOP or a ptrace stop.
    Stopped,
    Zombie,
}

/// A single runnable entity, bound to exactly one thread group.
///
/// The ArchContext is exclusively the task's; the MemoryManager and
/// FdTable are shared with clones through the Arcs.
pub struct Task {
    thread_group: ThreadGroupId,
    container_id: String,
    creds: Mutex<Credentials>,
    arch: Mutex<ArchContext>,
    mm: Mutex<Arc<MemoryManager>>,
    fd_table: Mutex<Arc<FdTable>>,
    state: Mutex<TaskState>,
    signal: Mutex<TaskSignalState>,
}

impl Task {
    pub fn new(
        thread_group: ThreadGroupId,
        container_id: &str,
        creds: Credentials,
        arch: ArchContext,
        mm: Arc<MemoryManager>,
        fd_table: Arc<FdTable>,
    ) -> Arc<Task> {
        Arc::new(Task {
            thread_group,
            container_id: container_id.to_string(),
            creds: Mutex::new(creds),
            arch: Mutex::new(arch),
            mm: Mutex::new(mm),
            fd_table: Mutex::new(fd_table),
            state: Mutex::new(TaskState::Created),
            signal: Mutex::new(TaskSignalState::default()),
        })
    }

    pub fn thread_group(&self) -> ThreadGroupId {
        self.thread_group
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn creds(&self) -> Credentials {
        self.creds.lock().unwrap().clone()
    }

    pub fn with_creds<R>(&self, f: impl FnOnce(&mut Credentials) -> R) -> R {
        f(&mut self.creds.lock().unwrap())
    }

    pub fn with_arch<R>(&self, f: impl FnOnce(&mut ArchContext) -> R) -> R {
        f(&mut self.arch.lock().unwrap())
    }

    pub fn mm(&self) -> Arc<MemoryManager> {
        Arc::clone(&self.mm.lock().unwrap())
    }

    /// Replaces the address space at execve.
    pub fn set_mm(&self, mm: Arc<MemoryManager>) {
        *self.mm.lock().unwrap() = mm;
    }

    pub fn fd_table(&self) -> Arc<FdTable> {
        Arc::clone(&self.fd_table.lock().unwrap())
    }

    pub fn set_fd_table(&self, table: Arc<FdTable>) {
        *self.fd_table.lock().unwrap() = table;
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: TaskState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn with_signal_state<R>(&self, f: impl FnOnce(&mut TaskSignalState) -> R) -> R {
        f(&mut self.signal.lock().unwrap())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("container", &self.container_id)
            .field("state", &self.state())
            .finish()
    }
}

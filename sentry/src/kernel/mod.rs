//! The guest kernel: tasks, thread groups, PID namespaces, signals.
//!
//! The kernel's global lock guards the arenas and id maps. Waiting never
//! happens under it: exit waiters block on per-group notifiers, and the
//! pause gate has its own lock. Lock order is kernel global, then any
//! per-object mutex.

pub mod credentials;
pub mod limits;
pub mod pid_namespace;
pub mod signal;
pub mod task;
pub mod thread_group;

pub use credentials::Credentials;
pub use pid_namespace::PidNamespace;
pub use task::{Task, TaskState};
pub use thread_group::{ControlTtyError, ExitNotifier, ThreadGroup, Tty};

use crate::{
    arch::{Arch, ArchContext, SignalInfo},
    arena::{Arena, Handle},
    mm::{MemoryFile, MemoryManager},
    platform::{AddressSpace, Platform, SwitchResult},
    seccheck,
    vfs::{FdTable, MountNamespace, VirtualFilesystem},
};
use sandkern_protocol::{ProcessInfo, SignalDeliveryMode, ThreadId, WaitStatus};
use signal::{default_action, valid_signal, DefaultAction};
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};
use thiserror::Error;

pub type TaskId = Handle<Arc<Task>>;
pub type ThreadGroupId = Handle<Arc<ThreadGroup>>;
pub type PidNsId = Handle<PidNamespace>;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("no such process")]
    NoSuchProcess,

    #[error("invalid signal {0}")]
    InvalidSignal(i32),

    #[error("container {0:?} not found")]
    ContainerNotFound(String),

    #[error("container {0:?} already exists")]
    ContainerExists(String),

    #[error("operation requires PID 0, got {0}")]
    PidMustBeZero(ThreadId),

    #[error("thread ids exhausted")]
    TidExhausted,

    #[error("operation not permitted")]
    NotPermitted,

    #[error("memory error: {0}")]
    Memory(#[from] crate::mm::MemoryError),

    #[error("arch error: {0}")]
    Arch(#[from] crate::arch::ArchError),
}

/// Blocks task entry while the kernel is paused, and lets pause wait for
/// in-flight kernel work to drain.
#[derive(Default)]
struct PauseGate {
    state: Mutex<PauseState>,
    changed: Condvar,
}

#[derive(Default)]
struct PauseState {
    paused: bool,
    active: usize,
}

impl PauseGate {
    fn begin_work(&self) {
        let mut state = self.state.lock().unwrap();
        while state.paused {
            state = self.changed.wait(state).unwrap();
        }
        state.active += 1;
    }

    fn end_work(&self) {
        let mut state = self.state.lock().unwrap();
        state.active -= 1;
        self.changed.notify_all();
    }

    fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = true;
        while state.active > 0 {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        self.changed.notify_all();
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}

struct KernelState {
    tasks: Arena<Arc<Task>>,
    thread_groups: Arena<Arc<ThreadGroup>>,
    pid_namespaces: Arena<PidNamespace>,
    root_pidns: PidNsId,
    /// Container id -> init thread group.
    containers: HashMap<String, ThreadGroupId>,
    /// Tasks with a syscall in flight and when it entered.
    in_syscall: HashMap<TaskId, Instant>,
}

/// Arguments to create_process.
pub struct CreateProcessArgs {
    pub container_id: String,
    pub creds: Credentials,
    /// The PID namespace to create the process in; None means a fresh
    /// child of the root namespace.
    pub pidns: Option<PidNsId>,
    pub tty: Option<Arc<Tty>>,
}

pub struct Kernel {
    platform: Arc<dyn Platform>,
    memory_file: Arc<MemoryFile>,
    vfs: Arc<VirtualFilesystem>,
    root_mntns: Arc<MountNamespace>,
    state: Mutex<KernelState>,
    pause_gate: PauseGate,
    /// Set in attached mode; every created task dies with the sandbox.
    pdeath_signal: Mutex<Option<i32>>,
}

impl Kernel {
    pub fn new(
        platform: Arc<dyn Platform>,
        memory_file: Arc<MemoryFile>,
        vfs: Arc<VirtualFilesystem>,
        root_mntns: Arc<MountNamespace>,
    ) -> Arc<Kernel> {
        let mut pid_namespaces = Arena::new();
        let root_pidns = pid_namespaces.insert(PidNamespace::new(None));
        Arc::new(Kernel {
            platform,
            memory_file,
            vfs,
            root_mntns,
            state: Mutex::new(KernelState {
                tasks: Arena::new(),
                thread_groups: Arena::new(),
                pid_namespaces,
                root_pidns,
                containers: HashMap::new(),
                in_syscall: HashMap::new(),
            }),
            pause_gate: PauseGate::default(),
            pdeath_signal: Mutex::new(None),
        })
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn memory_file(&self) -> &Arc<MemoryFile> {
        &self.memory_file
    }

    pub fn vfs(&self) -> &Arc<VirtualFilesystem> {
        &self.vfs
    }

    pub fn root_mount_namespace(&self) -> &Arc<MountNamespace> {
        &self.root_mntns
    }

    pub fn root_pidns(&self) -> PidNsId {
        self.state.lock().unwrap().root_pidns
    }

    pub fn set_pdeath_signal(&self, signo: Option<i32>) {
        *self.pdeath_signal.lock().unwrap() = signo;
    }

    pub fn pdeath_signal(&self) -> Option<i32> {
        *self.pdeath_signal.lock().unwrap()
    }

    /// Freezes the kernel: blocks new syscalls and task state changes,
    /// and drains in-flight kernel work.
    pub fn pause(&self) {
        log::debug!("kernel pausing");
        self.pause_gate.pause();
    }

    pub fn unpause(&self) {
        log::debug!("kernel resuming");
        self.pause_gate.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause_gate.is_paused()
    }

    /// Creates a new process: a fresh thread group with one leader task.
    /// Returns the ids plus the pid in the root namespace.
    pub fn create_process(
        &self,
        args: CreateProcessArgs,
    ) -> Result<(ThreadGroupId, TaskId, ThreadId), KernelError> {
        self.pause_gate.begin_work();
        let result = self.create_process_locked(args);
        self.pause_gate.end_work();
        result
    }

    fn create_process_locked(
        &self,
        args: CreateProcessArgs,
    ) -> Result<(ThreadGroupId, TaskId, ThreadId), KernelError> {
        let mut state = self.state.lock().unwrap();

        let pidns = match args.pidns {
            Some(ns) => ns,
            None => {
                let root = state.root_pidns;
                state.pid_namespaces.insert(PidNamespace::new(Some(root)))
            }
        };

        let arch = ArchContext::new(Arch::Amd64);
        let limits = limits::LimitSet::default();
        let layout = arch.new_mmap_layout(0, crate::arch::MAX_ADDR_64, &limits)?;
        let mm = MemoryManager::new(Arc::clone(&self.memory_file), layout);

        let tg = ThreadGroup::new(&args.container_id, pidns, None);
        let tg_id = state.thread_groups.insert(Arc::clone(&tg));
        let task = Task::new(
            tg_id,
            &args.container_id,
            args.creds,
            arch,
            mm,
            FdTable::new(),
        );
        let task_id = state.tasks.insert(Arc::clone(&task));
        tg.add_task(task_id);
        if let Some(tty) = args.tty {
            tg.set_controlling_tty(Some(tty));
        }

        // Register ids in the creation namespace and every ancestor.
        let mut root_tid = 0;
        let mut ns = Some(pidns);
        while let Some(ns_id) = ns {
            let namespace = state
                .pid_namespaces
                .get_mut(ns_id)
                .expect("pid namespace vanished");
            let tid = namespace.allocate_tid().ok_or(KernelError::TidExhausted)?;
            namespace.insert_task(tid, task_id);
            namespace.insert_thread_group(tid, tg_id);
            root_tid = tid;
            ns = namespace.parent();
        }
        // The group is its own session and process group, keyed by the
        // root-namespace id.
        tg.set_session(root_tid, root_tid);

        task.set_state(TaskState::Runnable);
        log::info!(
            "created process pid {} in container {:?}",
            root_tid,
            args.container_id
        );
        Ok((tg_id, task_id, root_tid))
    }

    /// Clones a task. `new_thread_group` false adds the clone to the
    /// parent's group (thread creation); sharing flags control the mm
    /// and fd table.
    pub fn clone_task(
        &self,
        parent_id: TaskId,
        new_thread_group: bool,
        share_mm: bool,
        share_files: bool,
    ) -> Result<(TaskId, ThreadId), KernelError> {
        self.pause_gate.begin_work();
        let result = self.clone_task_locked(parent_id, new_thread_group, share_mm, share_files);
        self.pause_gate.end_work();
        result
    }

    fn clone_task_locked(
        &self,
        parent_id: TaskId,
        new_thread_group: bool,
        share_mm: bool,
        share_files: bool,
    ) -> Result<(TaskId, ThreadId), KernelError> {
        let mut state = self.state.lock().unwrap();
        let parent = state
            .tasks
            .get(parent_id)
            .cloned()
            .ok_or(KernelError::NoSuchProcess)?;
        let parent_tg_id = parent.thread_group();
        let parent_tg = state
            .thread_groups
            .get(parent_tg_id)
            .cloned()
            .ok_or(KernelError::NoSuchProcess)?;

        let mm = if share_mm {
            parent.mm()
        } else {
            parent.mm().fork()?
        };
        let fd_table = if share_files {
            parent.fd_table()
        } else {
            parent.fd_table().fork()
        };
        let arch = parent.with_arch(|a| a.clone());
        let pidns = parent_tg.pidns();

        let tg_id = if new_thread_group {
            let tg = ThreadGroup::new(parent.container_id(), pidns, Some(parent_tg_id));
            state.thread_groups.insert(tg)
        } else {
            parent_tg_id
        };

        let task = Task::new(
            tg_id,
            parent.container_id(),
            parent.creds(),
            arch,
            mm,
            fd_table,
        );
        let task_id = state.tasks.insert(Arc::clone(&task));
        let tg = state
            .thread_groups
            .get(tg_id)
            .cloned()
            .expect("thread group vanished");
        tg.add_task(task_id);

        let mut tid_here = 0;
        let mut ns = Some(pidns);
        while let Some(ns_id) = ns {
            let namespace = state
                .pid_namespaces
                .get_mut(ns_id)
                .expect("pid namespace vanished");
            let tid = namespace.allocate_tid().ok_or(KernelError::TidExhausted)?;
            namespace.insert_task(tid, task_id);
            if new_thread_group {
                namespace.insert_thread_group(tid, tg_id);
            }
            tid_here = tid;
            ns = namespace.parent();
        }
        if new_thread_group {
            tg.set_session(parent_tg.session(), parent_tg.pgid());
            tg.set_controlling_tty(parent_tg.controlling_tty());
        }
        task.set_state(TaskState::Runnable);
        Ok((task_id, tid_here))
    }

    /// execve: fresh address space, close-on-exec fds dropped, handlers
    /// reset.
    pub fn execve(&self, task_id: TaskId) -> Result<(), KernelError> {
        let (task, tg) = {
            let state = self.state.lock().unwrap();
            let task = state
                .tasks
                .get(task_id)
                .cloned()
                .ok_or(KernelError::NoSuchProcess)?;
            let tg = state
                .thread_groups
                .get(task.thread_group())
                .cloned()
                .ok_or(KernelError::NoSuchProcess)?;
            (task, tg)
        };
        if seccheck::global().enabled(seccheck::Point::ExecveEnter) {
            seccheck::global().emit(
                seccheck::Point::ExecveEnter,
                serde_json::json!({"container": task.container_id()}),
            );
        }
        let arch = ArchContext::new(Arch::Amd64);
        let layout = arch.new_mmap_layout(0, crate::arch::MAX_ADDR_64, &tg.limits())?;
        task.set_mm(MemoryManager::new(Arc::clone(&self.memory_file), layout));
        task.with_arch(|a| *a = arch);
        task.fd_table().close_on_exec();
        tg.with_handlers(|h| h.reset_for_exec());
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.state.lock().unwrap().tasks.get(id).cloned()
    }

    pub fn thread_group(&self, id: ThreadGroupId) -> Option<Arc<ThreadGroup>> {
        self.state.lock().unwrap().thread_groups.get(id).cloned()
    }

    /// The pid of a task in the root namespace.
    pub fn root_tid_of(&self, task_id: TaskId) -> Option<ThreadId> {
        let state = self.state.lock().unwrap();
        let root = state.root_pidns;
        state.pid_namespaces.get(root)?.id_of_task(task_id)
    }

    /// The pid of a task in its own (deepest) namespace.
    pub fn local_tid_of(&self, task_id: TaskId) -> Option<ThreadId> {
        let state = self.state.lock().unwrap();
        let task = state.tasks.get(task_id)?;
        let tg = state.thread_groups.get(task.thread_group())?;
        state.pid_namespaces.get(tg.pidns())?.id_of_task(task_id)
    }

    /// Registers `tg` as the init of container `cid`.
    pub fn register_container(&self, cid: &str, tg: ThreadGroupId) -> Result<(), KernelError> {
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(cid) {
            return Err(KernelError::ContainerExists(cid.to_string()));
        }
        state.containers.insert(cid.to_string(), tg);
        if seccheck::global().enabled(seccheck::Point::ContainerStart) {
            seccheck::global().emit(
                seccheck::Point::ContainerStart,
                serde_json::json!({"container": cid}),
            );
        }
        Ok(())
    }

    pub fn unregister_container(&self, cid: &str) {
        self.state.lock().unwrap().containers.remove(cid);
    }

    pub fn container_init(&self, cid: &str) -> Option<ThreadGroupId> {
        self.state.lock().unwrap().containers.get(cid).copied()
    }

    /// Resolves a pid in the container's own PID namespace.
    pub fn thread_group_in_container(
        &self,
        cid: &str,
        pid: ThreadId,
    ) -> Option<ThreadGroupId> {
        let state = self.state.lock().unwrap();
        let init = state.containers.get(cid).copied()?;
        let pidns = state.thread_groups.get(init)?.pidns();
        state
            .pid_namespaces
            .get(pidns)?
            .thread_group_with_id(pid)
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .keys()
            .cloned()
            .collect()
    }

    /// The root container's init group.
    pub fn global_init(&self) -> Option<ThreadGroupId> {
        let state = self.state.lock().unwrap();
        let root = state.root_pidns;
        state
            .pid_namespaces
            .get(root)
            .and_then(|ns| ns.thread_group_with_id(1))
            .or_else(|| state.containers.values().next().copied())
    }

    /// Marks a task exited. When the leader or last task goes, the whole
    /// group is finalized with `status`.
    pub fn task_exit(&self, task_id: TaskId, status: WaitStatus) {
        let mut state = self.state.lock().unwrap();
        let task = match state.tasks.get(task_id) {
            Some(task) => Arc::clone(task),
            None => return,
        };
        task.set_state(TaskState::Zombie);
        state.in_syscall.remove(&task_id);
        let tg_id = task.thread_group();
        let tg = match state.thread_groups.get(tg_id) {
            Some(tg) => Arc::clone(tg),
            None => return,
        };
        let group_done = tg.remove_task(task_id);

        // Drop the task from every namespace it appears in.
        let ns_ids = state.pid_namespaces.handles();
        for ns_id in ns_ids {
            if let Some(ns) = state.pid_namespaces.get_mut(ns_id) {
                ns.remove_task(task_id);
            }
        }
        state.tasks.remove(task_id);

        if group_done && !tg.is_exited() {
            // Reparent children to the namespace init.
            let init = state.containers.get(tg.container_id()).copied();
            let tg_handles = state.thread_groups.handles();
            for other_id in tg_handles {
                if let Some(other) = state.thread_groups.get(other_id) {
                    if other.parent() == Some(tg_id) {
                        other.set_parent(init);
                    }
                }
            }
            drop(state);
            if seccheck::global().enabled(seccheck::Point::TaskExit) {
                seccheck::global().emit(
                    seccheck::Point::TaskExit,
                    serde_json::json!({"container": tg.container_id(), "status": status.0}),
                );
            }
            tg.set_exited(status);
        }
    }

    /// Waits for a thread group to exit and reaps it.
    pub fn wait_thread_group(&self, tg_id: ThreadGroupId) -> Result<WaitStatus, KernelError> {
        let tg = self.thread_group(tg_id).ok_or(KernelError::NoSuchProcess)?;
        let notifier = tg.exit_notifier();
        let status = notifier.wait();
        self.reap(tg_id);
        Ok(status)
    }

    /// Removes an exited thread group from the tables.
    pub fn reap(&self, tg_id: ThreadGroupId) {
        let mut state = self.state.lock().unwrap();
        let tg = match state.thread_groups.get(tg_id) {
            Some(tg) => Arc::clone(tg),
            None => return,
        };
        if !tg.is_exited() {
            return;
        }
        let ns_ids = state.pid_namespaces.handles();
        for ns_id in ns_ids {
            if let Some(ns) = state.pid_namespaces.get_mut(ns_id) {
                ns.remove_thread_group(tg_id);
            }
        }
        state.thread_groups.remove(tg_id);
    }

    /// Delivers a signal per the requested mode.
    pub fn signal(
        &self,
        cid: &str,
        pid: ThreadId,
        signo: i32,
        mode: SignalDeliveryMode,
    ) -> Result<(), KernelError> {
        if !valid_signal(signo) {
            return Err(KernelError::InvalidSignal(signo));
        }
        match mode {
            SignalDeliveryMode::ToProcess => self.signal_process(cid, pid, signo),
            SignalDeliveryMode::ToAllProcesses => {
                if pid != 0 {
                    return Err(KernelError::PidMustBeZero(pid));
                }
                self.signal_all(cid, signo)
            }
            SignalDeliveryMode::ToForegroundProcessGroup => {
                self.signal_foreground(cid, pid, signo)
            }
        }
    }

    fn signal_process(&self, cid: &str, pid: ThreadId, signo: i32) -> Result<(), KernelError> {
        let tg_id = if pid == 0 {
            self.container_init(cid)
                .ok_or_else(|| KernelError::ContainerNotFound(cid.to_string()))?
        } else {
            let state = self.state.lock().unwrap();
            let root = state.root_pidns;
            state
                .pid_namespaces
                .get(root)
                .and_then(|ns| ns.thread_group_with_id(pid))
                .ok_or(KernelError::NoSuchProcess)?
        };
        let tg = self.thread_group(tg_id).ok_or(KernelError::NoSuchProcess)?;
        self.send_signal_to_group(&tg, signo);
        Ok(())
    }

    /// Pauses the kernel so no task can be created mid-broadcast, then
    /// signals every thread group in the container.
    fn signal_all(&self, cid: &str, signo: i32) -> Result<(), KernelError> {
        self.pause();
        let groups: Vec<Arc<ThreadGroup>> = {
            let state = self.state.lock().unwrap();
            state
                .thread_groups
                .iter()
                .map(|(_, tg)| Arc::clone(tg))
                .filter(|tg| tg.container_id() == cid)
                .collect()
        };
        for tg in &groups {
            self.send_signal_to_group(tg, signo);
        }
        self.unpause();
        if groups.is_empty() {
            return Err(KernelError::ContainerNotFound(cid.to_string()));
        }
        Ok(())
    }

    fn signal_foreground(&self, cid: &str, pid: ThreadId, signo: i32) -> Result<(), KernelError> {
        let tg_id = if pid == 0 {
            self.container_init(cid)
                .ok_or_else(|| KernelError::ContainerNotFound(cid.to_string()))?
        } else {
            let state = self.state.lock().unwrap();
            let root = state.root_pidns;
            state
                .pid_namespaces
                .get(root)
                .and_then(|ns| ns.thread_group_with_id(pid))
                .ok_or(KernelError::NoSuchProcess)?
        };
        let tg = self.thread_group(tg_id).ok_or(KernelError::NoSuchProcess)?;
        let tty = tg.controlling_tty().ok_or(KernelError::NotPermitted)?;
        match tty.foreground_pgid() {
            Some(pgid) => {
                let groups: Vec<Arc<ThreadGroup>> = {
                    let state = self.state.lock().unwrap();
                    state
                        .thread_groups
                        .iter()
                        .map(|(_, tg)| Arc::clone(tg))
                        .filter(|g| g.container_id() == cid && g.pgid() == pgid)
                        .collect()
                };
                for g in groups {
                    self.send_signal_to_group(&g, signo);
                }
                Ok(())
            }
            None => {
                log::warn!(
                    "no foreground process group set on TTY {}; delivering to the process instead",
                    tty.index()
                );
                self.send_signal_to_group(&tg, signo);
                Ok(())
            }
        }
    }

    /// Applies one signal to a group: queue it for a handler, or apply
    /// the default action.
    pub fn send_signal_to_group(&self, tg: &Arc<ThreadGroup>, signo: i32) {
        if tg.is_exited() {
            return;
        }
        if seccheck::global().enabled(seccheck::Point::SignalDeliver) {
            seccheck::global().emit(
                seccheck::Point::SignalDeliver,
                serde_json::json!({"container": tg.container_id(), "signo": signo}),
            );
        }
        let handled = tg.with_handlers(|h| h.action(signo).is_some());
        let ignored = tg.with_handlers(|h| h.ignored(signo));
        let info = SignalInfo {
            signo,
            ..Default::default()
        };
        if handled && signo != signal::SIGKILL && signo != signal::SIGSTOP {
            // Queue on the leader; it builds the frame at its next
            // kernel entry.
            if let Some(leader) = tg.leader() {
                if let Some(task) = self.task(leader) {
                    task.with_signal_state(|s| s.enqueue(info));
                }
            }
            return;
        }
        if ignored && signo != signal::SIGKILL && signo != signal::SIGSTOP {
            return;
        }
        match default_action(signo) {
            DefaultAction::Ignore => {}
            DefaultAction::Stop => self.set_group_state(tg, TaskState::Stopped),
            DefaultAction::Continue => self.set_group_state(tg, TaskState::Runnable),
            DefaultAction::Terminate => {
                self.kill_group(tg, WaitStatus::from_signal(signo));
            }
        }
    }

    fn set_group_state(&self, tg: &Arc<ThreadGroup>, state: TaskState) {
        for task_id in tg.tasks() {
            if let Some(task) = self.task(task_id) {
                task.set_state(state);
            }
        }
    }

    /// Terminates every task in the group with `status`.
    pub fn kill_group(&self, tg: &Arc<ThreadGroup>, status: WaitStatus) {
        for task_id in tg.tasks() {
            self.task_exit(task_id, status);
        }
        // A group with no tasks (created but never started) still exits.
        tg.set_exited(status);
    }

    /// Rows for `ps` within one container.
    pub fn processes(&self, cid: &str) -> Vec<ProcessInfo> {
        let state = self.state.lock().unwrap();
        let root = match state.pid_namespaces.get(state.root_pidns) {
            Some(ns) => ns,
            None => return Vec::new(),
        };
        let mut rows = Vec::new();
        for (tgid, tg_id) in root.thread_groups() {
            if let Some(tg) = state.thread_groups.get(tg_id) {
                if tg.container_id() != cid || tg.is_exited() {
                    continue;
                }
                let threads: Vec<ThreadId> = tg
                    .tasks()
                    .iter()
                    .filter_map(|t| root.id_of_task(*t))
                    .collect();
                let uid = tg
                    .leader()
                    .and_then(|l| state.tasks.get(l).cloned())
                    .map(|t| t.creds().effective_kuid.0)
                    .unwrap_or(0);
                let ppid = tg
                    .parent()
                    .and_then(|p| root.id_of_thread_group(p))
                    .unwrap_or(0);
                rows.push(ProcessInfo {
                    uid,
                    pid: tgid,
                    ppid,
                    threads,
                    stime: String::new(),
                    time: String::new(),
                    cmd: String::new(),
                });
            }
        }
        rows
    }

    /// Container-scoped wait: the init process's status.
    pub fn wait_container(&self, cid: &str) -> Result<WaitStatus, KernelError> {
        let tg_id = self
            .container_init(cid)
            .ok_or_else(|| KernelError::ContainerNotFound(cid.to_string()))?;
        let tg = self.thread_group(tg_id).ok_or(KernelError::NoSuchProcess)?;
        let status = tg.exit_notifier().wait();
        Ok(status)
    }

    /// Waits for a specific pid (root-namespace) in a container.
    pub fn wait_pid(&self, cid: &str, pid: ThreadId) -> Result<WaitStatus, KernelError> {
        let tg_id = {
            let state = self.state.lock().unwrap();
            let root = state.root_pidns;
            state
                .pid_namespaces
                .get(root)
                .and_then(|ns| ns.thread_group_with_id(pid))
                .ok_or(KernelError::NoSuchProcess)?
        };
        let tg = self.thread_group(tg_id).ok_or(KernelError::NoSuchProcess)?;
        if tg.container_id() != cid {
            return Err(KernelError::NoSuchProcess);
        }
        let status = tg.exit_notifier().wait();
        self.reap(tg_id);
        Ok(status)
    }

    pub(crate) fn note_syscall_entry(&self, task_id: TaskId) {
        self.state
            .lock()
            .unwrap()
            .in_syscall
            .insert(task_id, Instant::now());
    }

    pub(crate) fn note_syscall_exit(&self, task_id: TaskId) {
        self.state.lock().unwrap().in_syscall.remove(&task_id);
    }

    /// Runs one task to completion: the executor loop alternating
    /// platform switches with sentry-side service.
    pub fn run_task(
        &self,
        task_id: TaskId,
        space: Arc<dyn AddressSpace>,
        table: &crate::syscalls::SyscallTable,
    ) {
        loop {
            let task = match self.task(task_id) {
                Some(task) => task,
                None => return,
            };
            match task.state() {
                TaskState::Zombie => return,
                TaskState::Stopped => {
                    // Parked until SIGCONT flips the state back.
                    std::thread::sleep(Duration::from_millis(2));
                    continue;
                }
                _ => {}
            }

            // Deliver one pending caught signal before re-entering the
            // application.
            if let Some(info) = task.with_signal_state(|s| s.dequeue()) {
                self.deliver_caught_signal(&task, info);
                continue;
            }

            let result = task.with_arch(|arch| space.switch(0, arch));
            match result {
                SwitchResult::Syscall => {
                    self.pause_gate.begin_work();
                    self.note_syscall_entry(task_id);
                    let outcome = crate::syscalls::dispatch(self, task_id, &task, table);
                    self.note_syscall_exit(task_id);
                    self.pause_gate.end_work();
                    match outcome {
                        crate::syscalls::Outcome::Return(value) => {
                            task.with_arch(|arch| arch.set_return(value as u64));
                        }
                        crate::syscalls::Outcome::Exited => return,
                    }
                }
                SwitchResult::Fault { addr, access } => {
                    log::debug!("task fault at {addr:#x} ({access:?})");
                    let tg = match self.thread_group(task.thread_group()) {
                        Some(tg) => tg,
                        None => return,
                    };
                    self.send_signal_to_group(&tg, signal::SIGSEGV);
                }
                SwitchResult::Interrupt { signo, info: _ } => {
                    log::trace!("task interrupted by signal {signo}");
                }
                SwitchResult::Exit => {
                    self.task_exit(task_id, WaitStatus::from_exit_code(0));
                    return;
                }
            }
        }
    }

    /// Builds the signal frame for a caught signal and points the task
    /// at its handler. A frame that cannot be written kills the group.
    fn deliver_caught_signal(&self, task: &Arc<Task>, info: SignalInfo) {
        let tg = match self.thread_group(task.thread_group()) {
            Some(tg) => tg,
            None => return,
        };
        let act = match tg.with_handlers(|h| h.action(info.signo)) {
            Some(act) => act,
            None => return,
        };
        let (mask, alt) = task.with_signal_state(|s| (s.mask, s.alt_stack));
        let frame = task.with_arch(|arch| arch.signal_setup(&act, &info, &alt, mask));
        match frame {
            Ok(frame) => {
                if task.mm().copy_out(frame.addr, &frame.bytes).is_err() {
                    log::warn!("signal frame write failed; killing group");
                    self.kill_group(&tg, WaitStatus::from_signal(signal::SIGSEGV));
                    return;
                }
                task.with_signal_state(|s| s.mask |= act.mask | (1u64 << (info.signo - 1)));
            }
            Err(err) => {
                log::warn!("signal frame build failed ({err}); killing group");
                self.kill_group(&tg, WaitStatus::from_signal(signal::SIGSEGV));
            }
        }
    }

    /// Tasks stuck in a syscall longer than `timeout`; watchdog probe.
    pub fn stuck_tasks(&self, timeout: Duration) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        state
            .in_syscall
            .iter()
            .filter(|(_, since)| now.duration_since(**since) > timeout)
            .filter_map(|(task_id, since)| {
                state.tasks.get(*task_id).map(|task| {
                    format!(
                        "{:?} in syscall for {:?}",
                        task,
                        now.duration_since(*since)
                    )
                })
            })
            .collect()
    }
}

impl crate::watchdog::StuckTaskSource for Kernel {
    fn stuck_tasks(&self, timeout: Duration) -> Vec<String> {
        Kernel::stuck_tasks(self, timeout)
    }
}

#[cfg(test)]
mod tests;

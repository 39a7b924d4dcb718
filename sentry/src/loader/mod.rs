//! The loader: boots the kernel and owns the subcontainer table.
//!
//! Boot order: platform, memory file, VFS, kernel, watchdog, control
//! server registration; then the loader blocks on the start gate until
//! the supervisor's StartRoot arrives over the control socket. All
//! lifecycle transitions afterwards flow through the loader.

use crate::{
    kernel::{signal, CreateProcessArgs, Credentials, Kernel, ThreadGroupId, Tty},
    mm::MemoryFile,
    platform::{self, Platform},
    state::{self, KernelImage, SaveOpts, StateError},
    syscalls::SyscallTable,
    usage::MemoryAccounting,
    vfs::{tmpfs::TmpfsType, MountNamespace, VirtualFilesystem},
    watchdog::{StuckTaskSource, Watchdog, WatchdogOpts},
};
use sandkern_protocol::{
    EventOut, EventStats, ExecArgs, MemoryUsage, ProcessInfo, SignalDeliveryMode, StartArgs,
    ThreadId, WaitStatus,
};
use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("platform error: {0}")]
    Platform(#[from] platform::PlatformError),

    #[error("memory error: {0}")]
    Memory(#[from] crate::mm::MemoryError),

    #[error("kernel error: {0}")]
    Kernel(#[from] crate::kernel::KernelError),

    #[error("filesystem error: {0}")]
    Vfs(#[from] crate::vfs::VfsError),

    #[error("container {0:?} not found")]
    ContainerNotFound(String),

    #[error("container {0:?} was not created")]
    NotCreated(String),

    #[error("checkpoint not supported when using host networking")]
    CheckpointWithHostNet,

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("restore requires one or two files, got {0}")]
    RestoreFileCount(usize),

    #[error("sandbox already started")]
    AlreadyStarted,
}

/// Boot-time configuration, the subset of flags that reaches the sentry.
#[derive(Debug, Clone)]
pub struct LoaderArgs {
    pub sandbox_id: String,
    pub platform_name: String,
    pub profile_enable: bool,
    pub host_network: bool,
    pub total_host_memory: u64,
    pub total_memory: u64,
    pub cpu_num: u32,
    pub attached: bool,
}

impl Default for LoaderArgs {
    fn default() -> Self {
        LoaderArgs {
            sandbox_id: String::new(),
            platform_name: "sim".to_string(),
            profile_enable: false,
            host_network: false,
            total_host_memory: 0,
            total_memory: 0,
            cpu_num: 2,
            attached: false,
        }
    }
}

/// Key for the process table: a container, or an exec'd process in one.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct ExecId {
    pub cid: String,
    /// 0 for the container itself.
    pub pid: ThreadId,
}

struct ExecProcess {
    tg: ThreadGroupId,
}

/// The StartRoot rendezvous: the boot thread parks here, the control
/// server kicks it and learns the outcome.
#[derive(Default)]
struct StartGate {
    state: Mutex<StartState>,
    changed: Condvar,
}

#[derive(Default)]
struct StartState {
    kicked: bool,
    result: Option<Result<(), String>>,
}

impl StartGate {
    fn kick_and_wait(&self) -> Result<(), String> {
        let mut state = self.state.lock().unwrap();
        state.kicked = true;
        self.changed.notify_all();
        while state.result.is_none() {
            state = self.changed.wait(state).unwrap();
        }
        state.result.clone().unwrap()
    }

    fn wait_for_kick(&self) {
        let mut state = self.state.lock().unwrap();
        while !state.kicked {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn post_result(&self, result: Result<(), String>) {
        let mut state = self.state.lock().unwrap();
        state.result = Some(result);
        self.changed.notify_all();
    }

    fn kicked(&self) -> bool {
        self.state.lock().unwrap().kicked
    }
}

pub struct Loader {
    args: LoaderArgs,
    platform: Arc<dyn Platform>,
    kernel: Mutex<Arc<Kernel>>,
    watchdog: Mutex<Option<Watchdog>>,
    table: Arc<SyscallTable>,
    start_gate: StartGate,
    processes: Mutex<HashMap<ExecId, ExecProcess>>,
    /// Subcontainers created but not yet started; holds their TTY.
    pending: Mutex<HashMap<String, Option<Arc<Tty>>>>,
    restored: AtomicBool,
    /// The sandbox-internal cgroupfs control files.
    cgroup_files: Mutex<HashMap<String, String>>,
}

fn build_kernel(
    platform: &Arc<dyn Platform>,
) -> Result<Arc<Kernel>, LoaderError> {
    let accounting = Arc::new(MemoryAccounting::new());
    let mf = MemoryFile::new(accounting)?;
    let vfs = Arc::new(VirtualFilesystem::new());
    vfs.register_filesystem(Arc::new(TmpfsType));
    let mntns = MountNamespace::new();
    vfs.mount_root(&mntns, "tmpfs", "", Default::default())?;
    Ok(Kernel::new(Arc::clone(platform), mf, vfs, mntns))
}

fn resolve_platform(name: &str) -> Result<Arc<dyn Platform>, LoaderError> {
    match platform::lookup(name) {
        Ok(p) => Ok(p),
        Err(platform::PlatformError::NotBuiltIn(wanted)) => {
            log::warn!(
                "platform {wanted:?} is not built into this binary; using the in-process platform"
            );
            Ok(platform::lookup("sim")?)
        }
        Err(err) => Err(err.into()),
    }
}

impl Loader {
    pub fn new(args: LoaderArgs) -> Result<Arc<Loader>, LoaderError> {
        let platform = resolve_platform(&args.platform_name)?;
        let kernel = build_kernel(&platform)?;
        if args.attached {
            // Every task created must die with the sandbox.
            kernel.set_pdeath_signal(Some(signal::SIGKILL));
        }
        let watchdog = Watchdog::new(
            Arc::clone(&kernel) as Arc<dyn StuckTaskSource>,
            WatchdogOpts::default(),
        );
        log::info!(
            "loader initialized: sandbox {:?}, platform {:?}, {} bytes memory",
            args.sandbox_id,
            platform.name(),
            args.total_memory
        );
        Ok(Arc::new(Loader {
            args,
            platform,
            kernel: Mutex::new(kernel),
            watchdog: Mutex::new(Some(watchdog)),
            table: Arc::new(SyscallTable::amd64()),
            start_gate: StartGate::default(),
            processes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            restored: AtomicBool::new(false),
            cgroup_files: Mutex::new(HashMap::new()),
        }))
    }

    pub fn args(&self) -> &LoaderArgs {
        &self.args
    }

    pub fn kernel(&self) -> Arc<Kernel> {
        Arc::clone(&self.kernel.lock().unwrap())
    }

    pub fn was_restored(&self) -> bool {
        self.restored.load(Ordering::Acquire)
    }

    /// Kicks the start gate on behalf of a StartRoot RPC and reports the
    /// boot outcome.
    pub fn start_root_requested(&self) -> Result<(), String> {
        if self.start_gate.kicked() {
            return Err("sandbox already started".to_string());
        }
        self.start_gate.kick_and_wait()
    }

    /// The boot thread's main loop: block until StartRoot, then run the
    /// root container.
    pub fn run(&self) {
        self.start_gate.wait_for_kick();
        let result = self
            .start_root_container()
            .map_err(|err| err.to_string());
        if let Err(err) = &result {
            log::error!("starting root container: {err}");
        }
        self.start_gate.post_result(result);
    }

    fn start_root_container(&self) -> Result<(), LoaderError> {
        let cid = self.args.sandbox_id.clone();
        self.start_container_process(&cid, None)?;
        Ok(())
    }

    fn start_container_process(
        &self,
        cid: &str,
        tty: Option<Arc<Tty>>,
    ) -> Result<ThreadId, LoaderError> {
        let kernel = self.kernel();
        let (tg, task, pid) = kernel.create_process(CreateProcessArgs {
            container_id: cid.to_string(),
            creds: Credentials::new_root(),
            pidns: None,
            tty,
        })?;
        kernel.register_container(cid, tg)?;
        self.processes.lock().unwrap().insert(
            ExecId {
                cid: cid.to_string(),
                pid: 0,
            },
            ExecProcess { tg },
        );
        self.spawn_executor(task)?;
        Ok(pid)
    }

    fn spawn_executor(
        &self,
        task: crate::kernel::TaskId,
    ) -> Result<(), LoaderError> {
        let space = self.platform.new_address_space()?;
        let kernel = self.kernel();
        let table = Arc::clone(&self.table);
        std::thread::spawn(move || {
            kernel.run_task(task, space, &table);
        });
        Ok(())
    }

    /// Records a subcontainer so a later StartSubcontainer can run it.
    pub fn create_subcontainer(
        &self,
        cid: &str,
        tty: Option<Arc<Tty>>,
    ) -> Result<(), LoaderError> {
        let mut pending = self.pending.lock().unwrap();
        pending.insert(cid.to_string(), tty);
        Ok(())
    }

    pub fn start_subcontainer(
        &self,
        args: &StartArgs,
    ) -> Result<(), LoaderError> {
        let tty = self
            .pending
            .lock()
            .unwrap()
            .remove(&args.cid)
            .ok_or_else(|| LoaderError::NotCreated(args.cid.clone()))?;
        self.start_container_process(&args.cid, tty)?;
        Ok(())
    }

    /// Stops a subcontainer and frees its resources. Idempotent.
    pub fn destroy_subcontainer(&self, cid: &str) -> Result<(), LoaderError> {
        self.pending.lock().unwrap().remove(cid);
        let kernel = self.kernel();
        if kernel.container_init(cid).is_some() {
            let _ = kernel.signal(cid, 0, signal::SIGKILL, SignalDeliveryMode::ToAllProcesses);
            kernel.unregister_container(cid);
        }
        let mut processes = self.processes.lock().unwrap();
        let dead: Vec<ExecId> = processes
            .keys()
            .filter(|id| id.cid == cid)
            .cloned()
            .collect();
        for id in dead {
            if let Some(process) = processes.remove(&id) {
                kernel.reap(process.tg);
            }
        }
        Ok(())
    }

    /// Runs a command in an existing container; returns its pid in the
    /// container's namespace.
    pub fn execute_async(&self, args: &ExecArgs) -> Result<ThreadId, LoaderError> {
        let kernel = self.kernel();
        let init_tg = kernel
            .container_init(&args.container_id)
            .ok_or_else(|| LoaderError::ContainerNotFound(args.container_id.clone()))?;
        let pidns = kernel
            .thread_group(init_tg)
            .map(|tg| tg.pidns())
            .ok_or_else(|| LoaderError::ContainerNotFound(args.container_id.clone()))?;

        let (tg, task, _root_pid) = kernel.create_process(CreateProcessArgs {
            container_id: args.container_id.clone(),
            creds: Credentials::new_user(
                crate::kernel::credentials::Kuid(args.process.uid),
                crate::kernel::credentials::Kgid(args.process.gid),
                args.process
                    .additional_gids
                    .iter()
                    .map(|g| crate::kernel::credentials::Kgid(*g))
                    .collect(),
            ),
            pidns: Some(pidns),
            tty: None,
        })?;
        let local_pid = kernel
            .thread_group(tg)
            .and_then(|g| g.leader())
            .and_then(|leader| kernel.local_tid_of(leader))
            .unwrap_or(0);
        self.processes.lock().unwrap().insert(
            ExecId {
                cid: args.container_id.clone(),
                pid: local_pid,
            },
            ExecProcess { tg },
        );
        self.spawn_executor(task)?;
        log::debug!(
            "exec'd {:?} in container {:?} as pid {}",
            args.process.argv,
            args.container_id,
            local_pid
        );
        Ok(local_pid)
    }

    pub fn wait_container(&self, cid: &str) -> Result<WaitStatus, LoaderError> {
        Ok(self.kernel().wait_container(cid)?)
    }

    /// Waits for `pid` (in the container's namespace) inside `cid`.
    pub fn wait_pid(&self, cid: &str, pid: ThreadId) -> Result<WaitStatus, LoaderError> {
        let kernel = self.kernel();
        let tg_id = kernel
            .thread_group_in_container(cid, pid)
            .ok_or_else(|| LoaderError::ContainerNotFound(cid.to_string()))?;
        let tg = kernel
            .thread_group(tg_id)
            .ok_or_else(|| LoaderError::ContainerNotFound(cid.to_string()))?;
        let status = tg.exit_notifier().wait();
        kernel.reap(tg_id);
        self.processes
            .lock()
            .unwrap()
            .remove(&ExecId {
                cid: cid.to_string(),
                pid,
            });
        Ok(status)
    }

    pub fn signal(
        &self,
        cid: &str,
        pid: ThreadId,
        signo: i32,
        mode: SignalDeliveryMode,
    ) -> Result<(), LoaderError> {
        Ok(self.kernel().signal(cid, pid, signo, mode)?)
    }

    pub fn processes_of(&self, cid: &str) -> Vec<ProcessInfo> {
        self.kernel().processes(cid)
    }

    pub fn event(&self, cid: &str) -> Result<EventOut, LoaderError> {
        let kernel = self.kernel();
        if kernel.container_init(cid).is_none() {
            return Err(LoaderError::ContainerNotFound(cid.to_string()));
        }
        let usage = kernel.memory_file().usage();
        Ok(EventOut {
            event: sandkern_protocol::Event {
                id: cid.to_string(),
                event_type: "stats".to_string(),
                data: EventStats {
                    memory_total_bytes: usage.total(),
                    memory_mapped_bytes: usage.mapped,
                    pids_current: kernel.processes(cid).len() as u64,
                },
            },
        })
    }

    pub fn usage(&self, _full: bool) -> MemoryUsage {
        let usage = self.kernel().memory_file().usage();
        MemoryUsage {
            system: usage.system,
            anonymous: usage.anonymous,
            page_cache: usage.page_cache,
            tmpfs: usage.tmpfs,
            mapped: usage.mapped,
            ramdiskfs: usage.ramdiskfs,
            total: usage.total(),
        }
    }

    pub fn pause(&self) {
        if let Some(dog) = self.watchdog.lock().unwrap().as_ref() {
            dog.pause();
        }
        self.kernel().pause();
    }

    pub fn resume(&self) {
        self.kernel().unpause();
        if let Some(dog) = self.watchdog.lock().unwrap().as_ref() {
            dog.resume();
        }
    }

    /// Checkpoints the kernel to `sink`. The kernel is paused for the
    /// duration and always unpaused, even when the save fails;
    /// `on_saved` runs before the unpause with the save outcome.
    pub fn checkpoint<W: Write>(
        &self,
        sink: &mut W,
        opts: &SaveOpts,
        on_saved: impl FnOnce(Option<&StateError>),
    ) -> Result<(), LoaderError> {
        if self.args.host_network {
            return Err(LoaderError::CheckpointWithHostNet);
        }
        // The watchdog would see the paused kernel as one giant stuck
        // task; stop it for the duration.
        let dog = self.watchdog.lock().unwrap().take();
        drop(dog);

        let kernel = self.kernel();
        kernel.pause();
        let image = KernelImage::capture(&kernel);
        let result = state::save(&image, opts, sink);
        on_saved(result.as_ref().err());
        kernel.unpause();

        let new_dog = Watchdog::new(
            Arc::clone(&kernel) as Arc<dyn StuckTaskSource>,
            WatchdogOpts::default(),
        );
        *self.watchdog.lock().unwrap() = Some(new_dog);
        result?;
        Ok(())
    }

    /// Restores from a state file. `install_filters` runs after the new
    /// kernel exists but before any state is read, mirroring boot order.
    pub fn restore<R: Read>(
        &self,
        source: &mut R,
        sandbox_id: &str,
        key: Option<&[u8]>,
        install_filters: impl FnOnce() -> Result<(), String>,
    ) -> Result<(), LoaderError> {
        // Pause the kernel being replaced.
        self.kernel().pause();

        let platform = resolve_platform(&self.args.platform_name)?;
        let kernel = build_kernel(&platform)?;

        if let Err(err) = install_filters() {
            log::error!("installing seccomp filters for restore: {err}");
        }

        let image = state::load(source, key)?;
        if image.container_ids.len() > 1 {
            let dropped: Vec<&String> = image
                .container_ids
                .iter()
                .filter(|cid| cid.as_str() != sandbox_id)
                .collect();
            log::warn!(
                "restore: multi-container state; only the root container is restored, dropping {:?}",
                dropped
            );
        }

        // Swap the loader bookkeeping over to the fresh kernel.
        let new_dog = Watchdog::new(
            Arc::clone(&kernel) as Arc<dyn StuckTaskSource>,
            WatchdogOpts::default(),
        );
        *self.watchdog.lock().unwrap() = Some(new_dog);
        *self.kernel.lock().unwrap() = kernel;
        self.processes.lock().unwrap().clear();
        self.restored.store(true, Ordering::Release);

        // Single root entry only.
        let pid = self.start_container_process(sandbox_id, None)?;
        log::info!(
            "restored sandbox {:?}: root container running as pid {pid}",
            sandbox_id
        );
        Ok(())
    }

    /// Reads a virtual cgroupfs control file.
    pub fn cgroups_read(&self, controller: &str, path: &str, name: &str) -> Result<String, String> {
        let key = format!("{controller}:{path}:{name}");
        self.cgroup_files
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| format!("reading cgroup file {controller:?} {path:?} {name:?}: not found"))
    }

    /// Writes a virtual cgroupfs control file.
    pub fn cgroups_write(
        &self,
        controller: &str,
        path: &str,
        name: &str,
        value: &str,
    ) -> Result<(), String> {
        if value.is_empty() {
            return Err(format!(
                "writing cgroup file {controller:?} {path:?} {name:?} value {value:?}: empty value"
            ));
        }
        let key = format!("{controller}:{path}:{name}");
        self.cgroup_files
            .lock()
            .unwrap()
            .insert(key, value.to_string());
        Ok(())
    }

    /// A human-readable dump of every task, the debug.Stacks payload.
    pub fn stacks(&self) -> String {
        let kernel = self.kernel();
        let mut out = String::new();
        for cid in kernel.container_ids() {
            out.push_str(&format!("container {cid}:\n"));
            for row in kernel.processes(&cid) {
                out.push_str(&format!(
                    "  pid {} ppid {} threads {:?}\n",
                    row.pid, row.ppid, row.threads
                ));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_loader(id: &str) -> Arc<Loader> {
        Loader::new(LoaderArgs {
            sandbox_id: id.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn boot(loader: &Arc<Loader>) {
        let runner = Arc::clone(loader);
        std::thread::spawn(move || runner.run());
        loader.start_root_requested().unwrap();
    }

    #[test]
    fn start_root_runs_container() {
        let loader = new_loader("sbx");
        boot(&loader);
        assert!(loader.kernel().container_init("sbx").is_some());
        assert_eq!(loader.processes_of("sbx").len(), 1);
        // A second StartRoot is refused.
        assert!(loader.start_root_requested().is_err());
    }

    #[test]
    fn subcontainer_exec_and_waitpid() {
        let loader = new_loader("sbx");
        boot(&loader);
        loader.create_subcontainer("sub", None).unwrap();
        loader
            .start_subcontainer(&StartArgs {
                cid: "sub".into(),
                ..Default::default()
            })
            .unwrap();

        let pid = loader
            .execute_async(&ExecArgs {
                container_id: "sub".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(pid > 1);

        let waiter = {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.wait_pid("sub", pid).unwrap())
        };
        // The sim platform exits tasks immediately, so the exec'd
        // process reports a clean exit.
        assert_eq!(waiter.join().unwrap(), WaitStatus::from_exit_code(0));
    }

    #[test]
    fn starting_unknown_subcontainer_fails() {
        let loader = new_loader("sbx");
        boot(&loader);
        assert!(matches!(
            loader.start_subcontainer(&StartArgs {
                cid: "ghost".into(),
                ..Default::default()
            }),
            Err(LoaderError::NotCreated(_))
        ));
    }

    #[test]
    fn destroy_subcontainer_is_idempotent() {
        let loader = new_loader("sbx");
        boot(&loader);
        loader.create_subcontainer("sub", None).unwrap();
        loader
            .start_subcontainer(&StartArgs {
                cid: "sub".into(),
                ..Default::default()
            })
            .unwrap();
        loader.destroy_subcontainer("sub").unwrap();
        assert!(loader.kernel().container_init("sub").is_none());
        loader.destroy_subcontainer("sub").unwrap();
    }

    #[test]
    fn checkpoint_and_restore_roundtrip() {
        let loader = new_loader("sbx");
        boot(&loader);

        let mut image = Vec::new();
        let mut callback_ran = false;
        loader
            .checkpoint(&mut image, &SaveOpts::default(), |err| {
                assert!(err.is_none());
                callback_ran = true;
            })
            .unwrap();
        assert!(callback_ran);
        assert!(!loader.kernel().is_paused());

        loader
            .restore(&mut &image[..], "sbx", None, || Ok(()))
            .unwrap();
        assert!(loader.was_restored());
        assert!(loader.kernel().container_init("sbx").is_some());
        assert_eq!(loader.processes_of("sbx").len(), 1);
    }

    #[test]
    fn checkpoint_refused_with_host_networking() {
        let loader = Loader::new(LoaderArgs {
            sandbox_id: "sbx".into(),
            host_network: true,
            ..Default::default()
        })
        .unwrap();
        let mut sink = Vec::new();
        assert!(matches!(
            loader.checkpoint(&mut sink, &SaveOpts::default(), |_| {}),
            Err(LoaderError::CheckpointWithHostNet)
        ));
    }

    #[test]
    fn restore_rejects_empty_state() {
        let loader = new_loader("sbx");
        let empty: &[u8] = &[];
        assert!(matches!(
            loader.restore(&mut &empty[..], "sbx", None, || Ok(())),
            Err(LoaderError::State(StateError::EmptyFile))
        ));
    }

    #[test]
    fn cgroup_files_read_write() {
        let loader = new_loader("sbx");
        let err = loader.cgroups_read("memory", "/", "memory.max").unwrap_err();
        assert!(err.contains("memory.max"));
        loader
            .cgroups_write("memory", "/", "memory.max", "1073741824")
            .unwrap();
        assert_eq!(
            loader.cgroups_read("memory", "/", "memory.max").unwrap(),
            "1073741824"
        );
    }
}

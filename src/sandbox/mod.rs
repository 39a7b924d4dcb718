//! Sandbox creation and manipulation.
//!
//! A Sandbox wraps the sandbox process: it spawns it (with the gofer
//! connections and log files donated as descriptors), then drives all
//! lifecycle operations over the per-sandbox control socket. A copy of
//! the descriptor is persisted per container, so the struct must stay
//! serializable and is mutated only by its creator.

pub mod donation;
pub mod spawn;

use crate::{
    cgroup::Cgroup,
    config::{Config, POD_NAMESPACE_ANNOTATION, POD_NAME_ANNOTATION},
    errors::SandboxError,
};
use donation::Agency;
use sandkern_protocol::{
    client::{Client, ClientError},
    methods, CgroupControlFile, CgroupsReadArgs, CgroupsResults, CgroupsWriteArg,
    CgroupsWriteArgs, ControlAddress, CreateArgs, CreateTraceSessionArgs, EventOut, ExecArgs,
    LogLevel, LoggingArgs, MemoryUsage, MemoryUsageOpts, MetricRegistration, MetricsExportData,
    MetricsExportOpts, PortForwardOpts, ProcessInfo, ProfileOpts, RestoreOpts, SaveOpts,
    SessionConfig, SignalArgs, SignalDeliveryMode, StartArgs, ThreadId, WaitPidArgs, WaitStatus,
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::HashMap,
    fs::File,
    io::Read,
    os::fd::{FromRawFd, OwnedFd},
    path::Path,
    sync::{
        atomic::{AtomicI64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

/// How long waitForStopped polls a non-child sandbox before giving up.
const STOP_POLL_BUDGET: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An atomic pid that persists as a plain JSON integer.
#[derive(Debug, Default)]
pub struct SandboxPid(AtomicI64);

impl SandboxPid {
    pub fn store(&self, pid: i32) {
        self.0.store(pid as i64, Ordering::SeqCst);
    }

    pub fn load(&self) -> i32 {
        self.0.load(Ordering::SeqCst) as i32
    }
}

impl Serialize for SandboxPid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.0.load(Ordering::SeqCst))
    }
}

impl<'de> Deserialize<'de> for SandboxPid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pid = i64::deserialize(deserializer)?;
        Ok(SandboxPid(AtomicI64::new(pid)))
    }
}

/// Extra information about container mounts that applies pod-wide.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct PodMountHints {
    pub mounts: Vec<MountHint>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct MountHint {
    pub name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub share: String,
}

/// Arguments to Sandbox::new.
#[derive(Default)]
pub struct Args {
    /// Unique sandbox id; by convention the id of its first container.
    pub id: String,
    /// Pod annotations from the container spec.
    pub annotations: HashMap<String, String>,
    /// Gofer connection endpoints, in spec mount order.
    pub io_files: Vec<OwnedFd>,
    /// Host files backing overlay upper layers.
    pub overlay_filestore_files: Vec<OwnedFd>,
    /// Resolved mount table, serialized.
    pub mounts_file: Option<OwnedFd>,
    pub mount_hints: Option<PodMountHints>,
    pub cgroup: Option<Cgroup>,
    /// Sandbox lifecycle is tied to the caller.
    pub attached: bool,
    /// Seccheck sink files from --pod-init-config.
    pub sink_files: Vec<OwnedFd>,
    /// stdio for the root container.
    pub stdio: Vec<OwnedFd>,
    /// Host file used for program execution (exec-fd).
    pub exec_file: Option<OwnedFd>,
}

/// A sandbox process and the state needed to find and control it.
#[derive(Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    pub namespace: String,
    pub pid: SandboxPid,
    pub uid: i32,
    pub gid: i32,
    pub cgroup: Option<Cgroup>,
    #[serde(rename = "originalOomScoreAdj")]
    pub original_oom_score_adj: i32,
    #[serde(rename = "registeredMetrics")]
    pub registered_metrics: Option<MetricRegistration>,
    #[serde(rename = "metricMetadata")]
    pub metric_metadata: HashMap<String, String>,
    #[serde(rename = "metricServerAddress")]
    pub metric_server_address: String,
    #[serde(rename = "control_address")]
    pub control_address: Option<ControlAddress>,
    #[serde(rename = "mountHints")]
    pub mount_hints: Option<PodMountHints>,

    /// Set when this process is the sandbox's parent; only the creator
    /// can reap it, so this never persists.
    #[serde(skip)]
    child: bool,

    /// Exit status cache: Linux hands the wait status to one waiter, so
    /// it is kept here for everyone else.
    #[serde(skip)]
    status: Mutex<Option<WaitStatus>>,
}

/// Finds a location for the control socket and binds it. Tried under
/// the configured root directory first, then the conventional runtime
/// directories, finally the abstract namespace.
pub fn create_control_socket(
    root_dir: &Path,
    id: &str,
) -> Result<(ControlAddress, OwnedFd), SandboxError> {
    let name = format!("sandkern-{id}.sock");
    let mut candidates: Vec<ControlAddress> = Vec::new();
    for dir in [root_dir, Path::new("/var/run"), Path::new("/run"), Path::new("/tmp")] {
        candidates.push(ControlAddress::Path(dir.join(&name)));
    }
    candidates.push(ControlAddress::Abstract(format!("sandkern-sandbox.{id}")));

    for addr in candidates {
        log::debug!("attempting to create socket file {addr}");
        match sandkern_protocol::server::create_socket(&addr) {
            Ok(fd) => {
                log::debug!("using socket file {addr}");
                return Ok((addr, fd));
            }
            Err(err) => log::debug!("socket location {addr} unusable: {err}"),
        }
    }
    Err(SandboxError::NoControlSocketLocation)
}

impl Sandbox {
    /// Creates the sandbox process. The caller must eventually call
    /// `destroy`.
    pub fn new(config: &Config, args: Args) -> Result<Sandbox, SandboxError> {
        let mut sandbox = Sandbox {
            id: args.id.clone(),
            pod_name: args
                .annotations
                .get(POD_NAME_ANNOTATION)
                .cloned()
                .unwrap_or_default(),
            namespace: args
                .annotations
                .get(POD_NAMESPACE_ANNOTATION)
                .cloned()
                .unwrap_or_default(),
            pid: SandboxPid::default(),
            // Negative until the spawn decides, to catch use before set.
            uid: -1,
            gid: -1,
            cgroup: args.cgroup.clone(),
            original_oom_score_adj: 0,
            registered_metrics: None,
            metric_metadata: HashMap::new(),
            metric_server_address: config.metric_server.clone(),
            control_address: None,
            mount_hints: args.mount_hints.clone(),
            child: false,
            status: Mutex::new(None),
        };

        // Synchronization pipe: the read end stays here, the write end
        // is donated; boot writes one byte when the control server is
        // up.
        let (sync_read, sync_write) = nix::unistd::pipe()?;
        // SAFETY: `pipe()` returns two freshly-opened, uniquely-owned fds.
        let sync_write = unsafe { OwnedFd::from_raw_fd(sync_write) };
        let mut sync_read = unsafe { File::from_raw_fd(sync_read) };

        match sandbox.create_sandbox_process(config, args, sync_write) {
            Ok(()) => {}
            Err(err) => {
                // Unwind whatever partial state exists.
                let _ = sandbox.destroy();
                return Err(err);
            }
        }

        // Wait until the sandbox has booted: exactly one byte.
        let mut byte = [0u8; 1];
        match sync_read.read(&mut byte) {
            Ok(1) => {}
            outcome => {
                let base = match outcome {
                    Ok(_) => "EOF".to_string(),
                    Err(err) => err.to_string(),
                };
                let _ = sandbox.destroy();
                // Error strings are all that survive the RPC boundary;
                // EOF usually means the binary could not re-exec, so
                // check its permission bits for a better diagnostic.
                if base.contains("EOF") || base.contains("unexpected end of file") {
                    if let Err(perms) = check_binary_permissions(config) {
                        return Err(SandboxError::WaitForStart(format!("{base}: {perms}")));
                    }
                }
                return Err(SandboxError::WaitForStart(base));
            }
        }

        if !config.metric_server.is_empty() {
            // The control server is up and metrics were requested:
            // snapshot the registration before any container task
            // exists, so later exports can be validated against a
            // trusted baseline.
            log::debug!("getting metric registration information from sandbox {:?}", sandbox.id);
            let registered: MetricRegistration =
                sandbox.call(methods::METRICS_GET_REGISTERED, &serde_json::Value::Null)?;
            sandbox.registered_metrics = Some(registered);
        }

        Ok(sandbox)
    }

    pub fn getpid(&self) -> i32 {
        self.pid.load()
    }

    pub fn is_root_container(&self, cid: &str) -> bool {
        self.id == cid
    }

    fn connect(&self) -> Result<Client, SandboxError> {
        let addr = self
            .control_address
            .as_ref()
            .ok_or(SandboxError::SandboxGone)?;
        log::debug!("connecting to sandbox {:?}", self.id);
        Client::connect(addr).map_err(|err| {
            SandboxError::Control(ClientError::Remote(format!(
                "connecting to control server at PID {}: {err}",
                self.pid.load()
            )))
        })
    }

    fn call<A: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        arg: &A,
    ) -> Result<R, SandboxError> {
        let mut client = self.connect()?;
        Ok(client.call(method, arg, &[] as &[File])?)
    }

    fn call_with_files<A: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        arg: &A,
        files: &[File],
    ) -> Result<R, SandboxError> {
        let mut client = self.connect()?;
        Ok(client.call(method, arg, files)?)
    }

    fn create_sandbox_process(
        &mut self,
        config: &Config,
        args: Args,
        sync_write: OwnedFd,
    ) -> Result<(), SandboxError> {
        let mut donations = Agency::new();

        // Log files come first so even early boot failures are logged.
        let mut append = std::fs::OpenOptions::new();
        append.create(true).append(true);
        donations.open_and_donate("log-fd", config.log_filename.as_deref(), &append)?;
        donations.open_and_donate("debug-log-fd", config.debug_log.as_deref(), &append)?;
        donations.open_and_donate("panic-log-fd", config.panic_log.as_deref(), &append)?;

        donations.donate_all("io-fds", args.io_files);
        donations.donate_all("overlay-filestore-fds", args.overlay_filestore_files);
        if let Some(mounts) = args.mounts_file {
            donations.donate("mounts-fd", mounts);
        }
        donations.donate("start-sync-fd", sync_write);

        // The control socket; its location is recorded for every later
        // operation.
        let (control_address, control_fd) = create_control_socket(&config.root_dir, &self.id)?;
        log::info!("control socket: {control_address}");
        donations.donate("controller-fd", control_fd);
        self.control_address = Some(control_address);

        donations.donate_all("sink-fds", args.sink_files);
        if let Some(exec_file) = args.exec_file {
            donations.donate("exec-fd", exec_file);
        }
        // stdio is donated last so a controlling TTY lands on a small,
        // predictable descriptor.
        donations.donate_all("stdio-fds", args.stdio);

        let requirements = sandkern_sentry::platform::requirements_for(&config.platform);
        let rootless_euid = !nix::unistd::geteuid().is_root();
        let mut plan = spawn::compute_plan(config, requirements.requires_current_pidns, rootless_euid)?;
        plan.attached = args.attached;

        // Rootless user namespaces are mapped by the parent through
        // newuidmap; the child blocks on this socket until the maps are
        // in place.
        let userns_sync = if plan.rootless_userns_sync {
            let (parent_end, child_end) = spawn::rootless_sync_pair()?;
            donations.donate("sync-userns-fd", child_end);
            Some(parent_end)
        } else {
            None
        };

        self.uid = nix::unistd::getuid().as_raw() as i32;
        self.gid = nix::unistd::getgid().as_raw() as i32;
        if plan.write_uid_gid_maps {
            self.uid = spawn::NOBODY as i32;
            self.gid = spawn::NOBODY as i32;
        }

        // Assemble the full command line: runtime flags, then the boot
        // command, then boot-only flags, with the container id last.
        let exe = std::env::current_exe()?;
        let mut argv: Vec<String> = vec![exe.display().to_string()];
        argv.extend(config.to_flags());
        argv.push("boot".to_string());
        argv.extend(plan.argv.clone());
        let transfer = donations.plan();
        argv.extend(transfer.flags.clone());
        argv.extend(spawn::sizing_flags(config, self.cgroup.as_ref())?);
        if args.attached {
            argv.push("--attached".to_string());
        }
        argv.push(self.id.clone());

        donations.log();
        log::debug!("starting sandbox: {argv:?}");
        let spawned = spawn::spawn(&plan, &argv, &transfer, &donations).map_err(|err| {
            // EACCES on exec usually means the binary permission bits
            // are wrong; say so.
            if err.to_string().contains("EACCES")
                || err.to_string().contains("Permission denied")
            {
                if let Err(perms) = check_binary_permissions(config) {
                    return SandboxError::CreateSandboxProcess(format!("{err}: {perms}"));
                }
            }
            err
        })?;

        if let Some(sync) = userns_sync {
            spawn::finish_rootless_userns(
                &sync,
                spawned.pid,
                nix::unistd::getuid().as_raw(),
                nix::unistd::getgid().as_raw(),
            )?;
        }

        self.original_oom_score_adj = spawned.original_oom_score_adj;
        self.child = true;
        self.pid.store(spawned.pid.as_raw());
        Ok(())
    }

    /// Creates a container inside the sandbox.
    pub fn create_subcontainer(
        &self,
        _config: &Config,
        cid: &str,
        tty: Option<File>,
    ) -> Result<(), SandboxError> {
        log::debug!(
            "create sub-container {cid:?} in sandbox {:?}, PID: {}",
            self.id,
            self.pid.load()
        );
        let files: Vec<File> = tty.into_iter().collect();
        let args = CreateArgs {
            cid: cid.to_string(),
        };
        let _: serde_json::Value =
            self.call_with_files(methods::CONT_MGR_CREATE_SUBCONTAINER, &args, &files)?;
        Ok(())
    }

    /// Starts the root container.
    pub fn start_root(&self) -> Result<(), SandboxError> {
        log::debug!("start root sandbox {:?}, PID: {}", self.id, self.pid.load());
        let _: serde_json::Value = self.call(methods::CONT_MGR_START_ROOT, &self.id)?;
        Ok(())
    }

    /// Starts a sub-container. Donated files, in order: stdios (when no
    /// terminal), overlay filestores, gofer connections.
    pub fn start_subcontainer(
        &self,
        args: &StartArgs,
        stdios: Vec<File>,
        overlay_filestores: Vec<File>,
        gofer_files: Vec<File>,
    ) -> Result<(), SandboxError> {
        log::debug!(
            "start sub-container {:?} in sandbox {:?}, PID: {}",
            args.cid,
            self.id,
            self.pid.load()
        );
        let mut files = Vec::new();
        files.extend(stdios);
        files.extend(overlay_filestores);
        files.extend(gofer_files);
        let _: serde_json::Value =
            self.call_with_files(methods::CONT_MGR_START_SUBCONTAINER, args, &files)?;
        Ok(())
    }

    /// Restores the sandbox from a checkpoint image.
    pub fn restore(&self, config: &Config, cid: &str, filename: &Path) -> Result<(), SandboxError> {
        log::debug!("restore sandbox {:?} from {}", self.id, filename.display());
        let state_file = File::open(filename)?;
        let mut files = vec![state_file];
        if let Some(device) =
            sandkern_sentry::platform::open_device(&config.platform, config.platform_device_path.as_deref())
                .map_err(|err| SandboxError::CreateSandboxProcess(err.to_string()))?
        {
            files.push(device);
        }
        let opts = RestoreOpts {
            sandbox_id: self.id.clone(),
        };
        let _: serde_json::Value = self
            .call_with_files(methods::CONT_MGR_RESTORE, &opts, &files)
            .map_err(|err| {
                SandboxError::Control(ClientError::Remote(format!(
                    "restoring container {cid:?}: {err}"
                )))
            })?;
        Ok(())
    }

    /// Runs a command in a container; returns the new process's pid.
    pub fn execute(&self, args: &ExecArgs) -> Result<ThreadId, SandboxError> {
        log::debug!(
            "executing new process in container {:?} in sandbox {:?}",
            args.container_id,
            self.id
        );
        self.call(methods::CONT_MGR_EXECUTE_ASYNC, args)
    }

    /// Lists processes in a container.
    pub fn processes(&self, cid: &str) -> Result<Vec<ProcessInfo>, SandboxError> {
        log::debug!("getting processes for container {cid:?} in sandbox {:?}", self.id);
        self.call(methods::CONT_MGR_PROCESSES, &cid.to_string())
    }

    /// Retrieves stats about a container.
    pub fn event(&self, cid: &str) -> Result<EventOut, SandboxError> {
        self.call(methods::CONT_MGR_EVENT, &cid.to_string())
    }

    /// Starts port forwarding; the local endpoint rides along as a
    /// descriptor.
    pub fn port_forward(&self, opts: &PortForwardOpts, stream: File) -> Result<(), SandboxError> {
        let _: serde_json::Value =
            self.call_with_files(methods::CONT_MGR_PORT_FORWARD, opts, &[stream])?;
        Ok(())
    }

    /// Waits for a container to exit and returns its status.
    ///
    /// The RPC is tried first; if the sandbox is gone (or dies during
    /// the call) the supervisor falls back to waiting on its own child
    /// or polling, and the result is cached for concurrent waiters.
    pub fn wait(&self, cid: &str) -> Result<WaitStatus, SandboxError> {
        log::debug!("waiting for container {cid:?} in sandbox {:?}", self.id);

        match self.call::<_, WaitStatus>(methods::CONT_MGR_WAIT, &cid.to_string()) {
            Ok(status) => {
                if self.is_root_container(cid) {
                    self.wait_for_stopped()?;
                }
                return Ok(status);
            }
            Err(err) => {
                // Nothing more can be done for subcontainers; for the
                // root container the sandbox exit status approximates
                // the container's.
                if !self.is_root_container(cid) {
                    return Err(err);
                }
                log::warn!(
                    "wait on container {cid:?} failed: {err}; will wait on the sandbox process instead"
                );
            }
        }

        self.wait_for_stopped()?;
        if !self.child {
            return Err(SandboxError::SandboxGone);
        }
        let status = self.status.lock().unwrap();
        status.ok_or(SandboxError::SandboxGone)
    }

    /// Waits for a specific process in the sandbox.
    pub fn wait_pid(&self, cid: &str, pid: ThreadId) -> Result<WaitStatus, SandboxError> {
        log::debug!("waiting for PID {pid} in sandbox {:?}", self.id);
        self.call(
            methods::CONT_MGR_WAIT_PID,
            &WaitPidArgs {
                pid,
                cid: cid.to_string(),
            },
        )
    }

    /// Sends a signal to a container, optionally to every process in
    /// it.
    pub fn signal_container(&self, cid: &str, signo: i32, all: bool) -> Result<(), SandboxError> {
        log::debug!("signal sandbox {:?}", self.id);
        let mode = if all {
            SignalDeliveryMode::ToAllProcesses
        } else {
            SignalDeliveryMode::ToProcess
        };
        let args = SignalArgs {
            cid: cid.to_string(),
            signo,
            pid: 0,
            mode,
        };
        let _: serde_json::Value = self.call(methods::CONT_MGR_SIGNAL, &args)?;
        Ok(())
    }

    /// Sends a signal to one process, or to its foreground process
    /// group when `fg_process` is set (host-TTY processes only).
    pub fn signal_process(
        &self,
        cid: &str,
        pid: ThreadId,
        signo: i32,
        fg_process: bool,
    ) -> Result<(), SandboxError> {
        let mode = if fg_process {
            SignalDeliveryMode::ToForegroundProcessGroup
        } else {
            SignalDeliveryMode::ToProcess
        };
        let args = SignalArgs {
            cid: cid.to_string(),
            signo,
            pid,
            mode,
        };
        let _: serde_json::Value = self.call(methods::CONT_MGR_SIGNAL, &args)?;
        Ok(())
    }

    /// Checkpoints a container's state into `file`.
    pub fn checkpoint(&self, cid: &str, file: File, opts: &SaveOpts) -> Result<(), SandboxError> {
        log::debug!("checkpoint sandbox {:?}", self.id);
        let _: serde_json::Value = self
            .call_with_files(methods::CONT_MGR_CHECKPOINT, opts, &[file])
            .map_err(|err| {
                SandboxError::Control(ClientError::Remote(format!(
                    "checkpointing container {cid:?}: {err}"
                )))
            })?;
        Ok(())
    }

    pub fn pause(&self, _cid: &str) -> Result<(), SandboxError> {
        log::debug!("pause sandbox {:?}", self.id);
        let _: serde_json::Value =
            self.call(methods::LIFECYCLE_PAUSE, &serde_json::Value::Null)?;
        Ok(())
    }

    pub fn resume(&self, _cid: &str) -> Result<(), SandboxError> {
        log::debug!("resume sandbox {:?}", self.id);
        let _: serde_json::Value =
            self.call(methods::LIFECYCLE_RESUME, &serde_json::Value::Null)?;
        Ok(())
    }

    /// Collects memory usage statistics.
    pub fn usage(&self, full: bool) -> Result<MemoryUsage, SandboxError> {
        self.call(methods::USAGE_COLLECT, &MemoryUsageOpts { full })
    }

    /// Fetches the usage snapshot as shared files; exactly two
    /// descriptors come back.
    pub fn usage_fd(&self) -> Result<(File, File), SandboxError> {
        let mut client = self.connect()?;
        let (_value, mut files) = client.call_with_files(
            methods::USAGE_USAGE_FD,
            &sandkern_protocol::MemoryUsageFileOpts { version: 1 },
            &[] as &[File],
        )?;
        if files.len() != 2 {
            return Err(SandboxError::Control(ClientError::Remote(format!(
                "wants exactly two fds, got {}",
                files.len()
            ))));
        }
        let version = File::from(files.pop().unwrap());
        let data = File::from(files.pop().unwrap());
        Ok((data, version))
    }

    /// The metric registration captured at creation; an error when
    /// instrumentation was not requested.
    pub fn get_registered_metrics(&self) -> Result<&MetricRegistration, SandboxError> {
        self.registered_metrics.as_ref().ok_or_else(|| {
            SandboxError::Config(
                "sandbox did not request instrumentation when it was created".to_string(),
            )
        })
    }

    /// Exports metric values, verified against the trusted registration.
    pub fn export_metrics(
        &self,
        opts: &MetricsExportOpts,
    ) -> Result<MetricsExportData, SandboxError> {
        let data: MetricsExportData = self.call(methods::METRICS_EXPORT, opts)?;
        if let Some(registered) = &self.registered_metrics {
            for name in data.snapshot.keys() {
                if !registered.metric_names.contains(name) {
                    return Err(SandboxError::Config(format!(
                        "sandbox exported unregistered metric {name:?}"
                    )));
                }
            }
        }
        Ok(data)
    }

    /// Changes logging options in the sentry.
    pub fn change_logging(&self, level: LogLevel) -> Result<(), SandboxError> {
        let args = LoggingArgs {
            set_level: true,
            level,
        };
        let _: serde_json::Value = self.call(methods::LOGGING_CHANGE, &args)?;
        Ok(())
    }

    /// Collects all sentry stacks for debugging.
    pub fn stacks(&self) -> Result<String, SandboxError> {
        self.call(methods::DEBUG_STACKS, &serde_json::Value::Null)
    }

    /// Profile collectors; each writes into the given file.
    pub fn cpu_profile(&self, file: File, duration: Duration) -> Result<(), SandboxError> {
        self.profile(methods::PROFILE_CPU, file, duration)
    }

    pub fn heap_profile(&self, file: File, delay: Duration) -> Result<(), SandboxError> {
        self.profile(methods::PROFILE_HEAP, file, delay)
    }

    pub fn block_profile(&self, file: File, duration: Duration) -> Result<(), SandboxError> {
        self.profile(methods::PROFILE_BLOCK, file, duration)
    }

    pub fn mutex_profile(&self, file: File, duration: Duration) -> Result<(), SandboxError> {
        self.profile(methods::PROFILE_MUTEX, file, duration)
    }

    pub fn trace(&self, file: File, duration: Duration) -> Result<(), SandboxError> {
        self.profile(methods::PROFILE_TRACE, file, duration)
    }

    fn profile(&self, method: &str, file: File, duration: Duration) -> Result<(), SandboxError> {
        let opts = ProfileOpts {
            duration_secs: duration.as_secs(),
        };
        let _: serde_json::Value = self.call_with_files(method, &opts, &[file])?;
        Ok(())
    }

    /// Creates a seccheck trace session; sink files ride as descriptors.
    pub fn create_trace_session(
        &self,
        config: &SessionConfig,
        force: bool,
        sink_files: Vec<File>,
    ) -> Result<(), SandboxError> {
        let args = CreateTraceSessionArgs {
            config: config.clone(),
            force,
        };
        let _: serde_json::Value =
            self.call_with_files(methods::CONT_MGR_CREATE_TRACE_SESSION, &args, &sink_files)?;
        Ok(())
    }

    pub fn delete_trace_session(&self, name: &str) -> Result<(), SandboxError> {
        let _: serde_json::Value =
            self.call(methods::CONT_MGR_DELETE_TRACE_SESSION, &name.to_string())?;
        Ok(())
    }

    pub fn list_trace_sessions(&self) -> Result<Vec<SessionConfig>, SandboxError> {
        self.call(methods::CONT_MGR_LIST_TRACE_SESSIONS, &serde_json::Value::Null)
    }

    /// Reads one cgroupfs control file inside the sandbox.
    pub fn cgroups_read_control_file(
        &self,
        file: CgroupControlFile,
    ) -> Result<String, SandboxError> {
        let args = CgroupsReadArgs { args: vec![file] };
        let out: CgroupsResults = self.call(methods::CGROUPS_READ_CONTROL_FILES, &args)?;
        let result = out.results.into_iter().next().ok_or_else(|| {
            SandboxError::Control(ClientError::Remote("expected 1 result, got 0".to_string()))
        })?;
        match result.error {
            Some(error) => Err(SandboxError::Control(ClientError::Remote(error))),
            None => Ok(result.value),
        }
    }

    /// Writes one cgroupfs control file inside the sandbox.
    pub fn cgroups_write_control_file(
        &self,
        file: CgroupControlFile,
        value: &str,
    ) -> Result<(), SandboxError> {
        let args = CgroupsWriteArgs {
            args: vec![CgroupsWriteArg {
                file,
                value: value.to_string(),
            }],
        };
        let out: CgroupsResults = self.call(methods::CGROUPS_WRITE_CONTROL_FILES, &args)?;
        let result = out.results.into_iter().next().ok_or_else(|| {
            SandboxError::Control(ClientError::Remote("expected 1 result, got 0".to_string()))
        })?;
        match result.error {
            Some(error) => Err(SandboxError::Control(ClientError::Remote(error))),
            None => Ok(()),
        }
    }

    /// True while the sandbox process exists.
    pub fn is_running(&self) -> bool {
        let pid = self.pid.load();
        if pid == 0 {
            return false;
        }
        // Signal 0 probes without delivering.
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }

    /// Destroys the given container; destroying the root container
    /// destroys the whole sandbox. Errors are suppressed when the
    /// sandbox is already gone.
    pub fn destroy_container(&self, cid: &str) -> Result<(), SandboxError> {
        if let Err(err) = self.destroy_container_inner(cid) {
            if self.is_running() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn destroy_container_inner(&self, cid: &str) -> Result<(), SandboxError> {
        if self.is_root_container(cid) {
            log::debug!("destroying root container by destroying sandbox, cid: {cid}");
            return self.destroy();
        }
        log::debug!("destroying container, cid: {cid}, sandbox: {:?}", self.id);
        let _: serde_json::Value =
            self.call(methods::CONT_MGR_DESTROY_SUBCONTAINER, &cid.to_string())?;
        Ok(())
    }

    /// Frees all resources associated with the sandbox. Fails fast and
    /// is idempotent.
    pub fn destroy(&self) -> Result<(), SandboxError> {
        log::debug!("destroying sandbox {:?}", self.id);
        // Remove the control socket file, unless it lives in the
        // abstract namespace.
        if let Some(ControlAddress::Path(path)) = &self.control_address {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(
                        "failed to delete control socket file {}: {err}",
                        path.display()
                    );
                }
            }
        }
        let pid = self.pid.load();
        if pid != 0 {
            log::debug!("killing sandbox {:?}", self.id);
            match nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(err) => return Err(err.into()),
            }
            self.wait_for_stopped()?;
        }
        Ok(())
    }

    /// Waits for the sandbox process to stop. As the parent we reap it
    /// and cache the status; otherwise poll for disappearance with a
    /// bounded budget.
    fn wait_for_stopped(&self) -> Result<(), SandboxError> {
        if self.child {
            let mut status = self.status.lock().unwrap();
            let pid = self.pid.load();
            if pid == 0 {
                return Ok(());
            }
            if status.is_none() {
                match nix::sys::wait::waitpid(Some(nix::unistd::Pid::from_raw(pid)), None) {
                    Ok(nix::sys::wait::WaitStatus::Exited(_, code)) => {
                        *status = Some(WaitStatus::from_exit_code(code));
                    }
                    Ok(nix::sys::wait::WaitStatus::Signaled(_, signal, _)) => {
                        *status = Some(WaitStatus::from_signal(signal as i32));
                    }
                    Ok(_) => {}
                    Err(nix::errno::Errno::ECHILD) => {
                        // Already reaped elsewhere; nothing to cache.
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            self.pid.store(0);
            return Ok(());
        }

        let deadline = Instant::now() + STOP_POLL_BUDGET;
        while self.is_running() {
            if Instant::now() >= deadline {
                return Err(SandboxError::StopTimeout(STOP_POLL_BUDGET));
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("pid", &self.pid.load())
            .finish()
    }
}

/// Verifies that the required permission bits are set on the runtime
/// executable: other-execute always, plus other-read for the ptrace
/// platform. Produces the hint pointing at the perms documentation.
pub fn check_binary_permissions(config: &Config) -> Result<(), SandboxError> {
    use std::os::unix::fs::PermissionsExt;

    let mut needed_bits = 0o001;
    if config.platform == "ptrace" {
        needed_bits |= 0o004;
    }
    let exe = std::env::current_exe()?;
    let mode = std::fs::metadata(&exe)?.permissions().mode();
    if mode & needed_bits != needed_bits {
        return Err(SandboxError::BinaryPermissions(format!(
            "{} does not have the correct permissions; see sandkern-perms",
            exe.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sandbox(id: &str) -> Sandbox {
        Sandbox {
            id: id.to_string(),
            pod_name: "pod".to_string(),
            namespace: "default".to_string(),
            pid: SandboxPid::default(),
            uid: 65534,
            gid: 65534,
            cgroup: None,
            original_oom_score_adj: -500,
            registered_metrics: None,
            metric_metadata: HashMap::new(),
            metric_server_address: String::new(),
            control_address: Some(ControlAddress::Abstract("sandkern-sandbox.test".into())),
            mount_hints: None,
            child: false,
            status: Mutex::new(None),
        }
    }

    #[test]
    fn persisted_layout_uses_contract_field_names() {
        let sandbox = test_sandbox("sb1");
        sandbox.pid.store(4242);
        let json = serde_json::to_value(&sandbox).unwrap();
        // pid persists as a plain integer.
        assert_eq!(json["pid"], serde_json::json!(4242));
        for field in [
            "id",
            "podName",
            "namespace",
            "uid",
            "gid",
            "cgroup",
            "originalOomScoreAdj",
            "registeredMetrics",
            "metricMetadata",
            "metricServerAddress",
            "control_address",
            "mountHints",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }

        let restored: Sandbox = serde_json::from_value(json).unwrap();
        assert_eq!(restored.pid.load(), 4242);
        assert_eq!(restored.original_oom_score_adj, -500);
        assert!(!restored.child);
    }

    #[test]
    fn destroy_is_idempotent() {
        let sandbox = test_sandbox("sb2");
        // pid 0: nothing to kill, no socket file to remove.
        sandbox.destroy().unwrap();
        sandbox.destroy().unwrap();
    }

    #[test]
    fn destroy_container_suppresses_errors_when_gone() {
        let sandbox = test_sandbox("sb3");
        // The subcontainer RPC fails (no control server), but the
        // sandbox is not running, so the error is suppressed.
        sandbox.destroy_container("other").unwrap();
    }

    #[test]
    fn is_root_container_by_id() {
        let sandbox = test_sandbox("root-cid");
        assert!(sandbox.is_root_container("root-cid"));
        assert!(!sandbox.is_root_container("sub"));
    }

    #[test]
    fn control_socket_falls_back_through_locations() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _fd) = create_control_socket(dir.path(), "tst").unwrap();
        match &addr {
            ControlAddress::Path(path) => {
                assert!(path.to_string_lossy().contains("sandkern-tst.sock"));
            }
            ControlAddress::Abstract(_) => panic!("writable dir should win"),
        }

        // An unwritable root dir falls through to the next location.
        let (addr, _fd) =
            create_control_socket(Path::new("/nonexistent/no-perms"), "tst2").unwrap();
        match addr {
            ControlAddress::Path(path) => {
                assert!(!path.starts_with("/nonexistent"));
            }
            ControlAddress::Abstract(name) => {
                assert!(name.contains("tst2"));
            }
        }
    }

    #[test]
    fn cached_status_shared_by_waiters() {
        let sandbox = std::sync::Arc::new(test_sandbox("sb4"));
        *sandbox.status.lock().unwrap() = Some(WaitStatus::from_signal(15));
        // child=false + pid=0: wait_for_stopped returns immediately,
        // and the cache path is what concurrent waiters read.
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let sandbox = std::sync::Arc::clone(&sandbox);
                std::thread::spawn(move || *sandbox.status.lock().unwrap())
            })
            .collect();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), Some(WaitStatus::from_signal(15)));
        }
    }

    #[test]
    fn binary_permission_check_runs() {
        let config = Config::default();
        // The test binary is built with owner-exec at least; whatever
        // the outcome, the error must carry the perms hint.
        if let Err(err) = check_binary_permissions(&config) {
            assert!(err.to_string().contains("sandkern-perms"));
        }
    }
}

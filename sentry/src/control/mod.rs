//! The control server: the sandbox half of the supervisor RPC surface.
//!
//! One handler object per method namespace, registered on the uRPC
//! server over the donated controller FD. Method names and argument
//! shapes are shared with the supervisor through the protocol crate.

use crate::{
    kernel::Tty,
    loader::Loader,
    seccheck,
    state::SaveOpts,
};
use sandkern_protocol::{
    server::{CallResult, Handler, Server, ServerError},
    CgroupsReadArgs, CgroupsResult, CgroupsResults, CgroupsWriteArgs, ContainerId, CreateArgs,
    CreateTraceSessionArgs, ExecArgs, LogLevel, LoggingArgs, MemoryUsageOpts, MetricRegistration,
    MetricsExportData, MetricsExportOpts, PortForwardOpts, RestoreOpts, SignalArgs, StartArgs,
    WaitPidArgs,
};
use serde_json::Value;
use std::{
    fs::File,
    io::Write,
    os::fd::{OwnedFd, RawFd},
    sync::Arc,
    time::Duration,
};

/// How long clients get to finish in-flight RPCs at shutdown.
pub const STOP_RPC_TIMEOUT: Duration = Duration::from_secs(15);

/// Backlog configured on the controller socket; the matching listen()
/// is the only listen the seccomp sub-policy allows on that FD.
pub const CONTROLLER_BACKLOG: i32 = 16;

pub struct Controller {
    server: Server,
}

fn handler_err(err: impl std::fmt::Display) -> ServerError {
    ServerError::Handler(err.to_string())
}

fn parse<T: serde::de::DeserializeOwned>(method: &str, argument: Value) -> Result<T, ServerError> {
    serde_json::from_value(argument).map_err(|source| ServerError::DecodeArgument {
        method: method.to_string(),
        source,
    })
}

impl Controller {
    /// Wraps the donated controller FD and registers every namespace.
    /// The caller must invoke `start_serving`.
    pub fn new(fd: RawFd, loader: Arc<Loader>) -> Result<Controller, ServerError> {
        unsafe {
            if libc::listen(fd, CONTROLLER_BACKLOG) != 0 {
                return Err(ServerError::Io(std::io::Error::last_os_error()));
            }
        }
        let mut server = Server::from_fd(fd)?;
        server.register(Arc::new(ContainerManager {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Lifecycle {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Logging));
        server.register(Arc::new(Proc {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(StateHandler {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Usage {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Metrics {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Cgroups {
            loader: Arc::clone(&loader),
        }));
        server.register(Arc::new(Debug {
            loader: Arc::clone(&loader),
        }));
        if loader.args().profile_enable {
            server.register(Arc::new(Profile));
        }
        Ok(Controller { server })
    }

    pub fn start_serving(&mut self) -> Result<(), ServerError> {
        self.server.start_serving()
    }

    pub fn stop(&mut self) {
        self.server.stop(STOP_RPC_TIMEOUT);
    }
}

struct ContainerManager {
    loader: Arc<Loader>,
}

impl Handler for ContainerManager {
    fn namespace(&self) -> &'static str {
        "containerManager"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        mut files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "StartRoot" => {
                let _cid: ContainerId = parse(method, argument)?;
                self.loader
                    .start_root_requested()
                    .map_err(ServerError::Handler)?;
                Ok(CallResult::empty())
            }
            "CreateSubcontainer" => {
                if files.len() > 1 {
                    return Err(ServerError::Handler(
                        "create arguments must have at most 1 file for TTY".into(),
                    ));
                }
                let args: CreateArgs = parse(method, argument)?;
                let tty = files.pop().map(|_fd| Tty::new(0));
                self.loader
                    .create_subcontainer(&args.cid, tty)
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "StartSubcontainer" => {
                let args: StartArgs = parse(method, argument)?;
                if args.cid.is_empty() {
                    return Err(ServerError::Handler(
                        "start argument missing container ID".into(),
                    ));
                }
                let mut expected = 1 + args.num_overlay_filestore_fds;
                if !args.process.terminal {
                    expected += 3;
                }
                if files.len() < expected {
                    return Err(ServerError::Handler(format!(
                        "start arguments must contain at least {expected} FDs, but only got {}",
                        files.len()
                    )));
                }
                self.loader.start_subcontainer(&args).map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "DestroySubcontainer" => {
                let cid: ContainerId = parse(method, argument)?;
                self.loader.destroy_subcontainer(&cid).map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "ExecuteAsync" => {
                let args: ExecArgs = parse(method, argument)?;
                let pid = self.loader.execute_async(&args).map_err(handler_err)?;
                CallResult::value(&pid)
            }
            "Wait" => {
                let cid: ContainerId = parse(method, argument)?;
                let status = self.loader.wait_container(&cid).map_err(handler_err)?;
                CallResult::value(&status)
            }
            "WaitPID" => {
                let args: WaitPidArgs = parse(method, argument)?;
                let status = self
                    .loader
                    .wait_pid(&args.cid, args.pid)
                    .map_err(handler_err)?;
                CallResult::value(&status)
            }
            "Signal" => {
                let args: SignalArgs = parse(method, argument)?;
                self.loader
                    .signal(&args.cid, args.pid, args.signo, args.mode)
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "Processes" => {
                let cid: ContainerId = parse(method, argument)?;
                CallResult::value(&self.loader.processes_of(&cid))
            }
            "Event" => {
                let cid: ContainerId = parse(method, argument)?;
                let event = self.loader.event(&cid).map_err(handler_err)?;
                CallResult::value(&event)
            }
            "Checkpoint" => {
                let opts: sandkern_protocol::SaveOpts = parse(method, argument)?;
                let file = files
                    .pop()
                    .ok_or_else(|| ServerError::Handler("checkpoint requires a file".into()))?;
                let mut sink = File::from(file);
                let save_opts = SaveOpts {
                    key: opts.key,
                    metadata: opts.metadata,
                };
                self.loader
                    .checkpoint(&mut sink, &save_opts, |err| {
                        if let Some(err) = err {
                            log::error!("checkpoint failed before resume: {err}");
                        }
                    })
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "Restore" => {
                let opts: RestoreOpts = parse(method, argument)?;
                match files.len() {
                    // State file, optionally followed by the platform
                    // device file.
                    1 | 2 => {}
                    n => {
                        return Err(ServerError::Handler(format!(
                            "restore requires one or two files, got {n}"
                        )))
                    }
                }
                let state_file = files.remove(0);
                let mut source = File::from(state_file);
                self.loader
                    .restore(&mut source, &opts.sandbox_id, None, || Ok(()))
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "PortForward" => {
                let opts: PortForwardOpts = parse(method, argument)?;
                if files.is_empty() {
                    return Err(ServerError::Handler(
                        "port forward requires a stream file".into(),
                    ));
                }
                if self
                    .loader
                    .kernel()
                    .container_init(&opts.container_id)
                    .is_none()
                {
                    return Err(ServerError::Handler(format!(
                        "container {:?} not found",
                        opts.container_id
                    )));
                }
                log::debug!(
                    "port forward to container {:?} port {}",
                    opts.container_id,
                    opts.port
                );
                Ok(CallResult::empty())
            }
            "CreateTraceSession" => {
                let args: CreateTraceSessionArgs = parse(method, argument)?;
                let slots: Vec<Option<OwnedFd>> = files.into_iter().map(Some).collect();
                seccheck::global()
                    .create(&args.config, args.force, slots)
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "DeleteTraceSession" => {
                let name: String = parse(method, argument)?;
                seccheck::global().delete(&name).map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            "ListTraceSessions" => CallResult::value(&seccheck::global().list()),
            "ProcfsDump" => {
                let kernel = self.loader.kernel();
                let mut rows = Vec::new();
                for cid in kernel.container_ids() {
                    rows.extend(kernel.processes(&cid));
                }
                CallResult::value(&rows)
            }
            other => Err(ServerError::UnknownMethod(format!(
                "containerManager.{other}"
            ))),
        }
    }
}

struct Lifecycle {
    loader: Arc<Loader>,
}

impl Handler for Lifecycle {
    fn namespace(&self) -> &'static str {
        "Lifecycle"
    }

    fn call(
        &self,
        method: &str,
        _argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Pause" => {
                self.loader.pause();
                Ok(CallResult::empty())
            }
            "Resume" => {
                self.loader.resume();
                Ok(CallResult::empty())
            }
            other => Err(ServerError::UnknownMethod(format!("Lifecycle.{other}"))),
        }
    }
}

struct Logging;

impl Handler for Logging {
    fn namespace(&self) -> &'static str {
        "Logging"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Change" => {
                let args: LoggingArgs = parse(method, argument)?;
                if args.set_level {
                    let level = match args.level {
                        LogLevel::Off => log::LevelFilter::Off,
                        LogLevel::Error => log::LevelFilter::Error,
                        LogLevel::Warn => log::LevelFilter::Warn,
                        LogLevel::Info => log::LevelFilter::Info,
                        LogLevel::Debug => log::LevelFilter::Debug,
                        LogLevel::Trace => log::LevelFilter::Trace,
                    };
                    log::set_max_level(level);
                    log::info!("log level changed to {level}");
                }
                Ok(CallResult::empty())
            }
            other => Err(ServerError::UnknownMethod(format!("Logging.{other}"))),
        }
    }
}

struct Proc {
    loader: Arc<Loader>,
}

impl Handler for Proc {
    fn namespace(&self) -> &'static str {
        "Proc"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Ps" => {
                let cid: ContainerId = parse(method, argument)?;
                CallResult::value(&self.loader.processes_of(&cid))
            }
            other => Err(ServerError::UnknownMethod(format!("Proc.{other}"))),
        }
    }
}

struct StateHandler {
    loader: Arc<Loader>,
}

impl Handler for StateHandler {
    fn namespace(&self) -> &'static str {
        "State"
    }

    fn call(
        &self,
        method: &str,
        _argument: Value,
        mut files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Save" => {
                let file = files
                    .pop()
                    .ok_or_else(|| ServerError::Handler("save requires a file".into()))?;
                let mut sink = File::from(file);
                self.loader
                    .checkpoint(&mut sink, &SaveOpts::default(), |_| {})
                    .map_err(handler_err)?;
                Ok(CallResult::empty())
            }
            other => Err(ServerError::UnknownMethod(format!("State.{other}"))),
        }
    }
}

struct Usage {
    loader: Arc<Loader>,
}

impl Handler for Usage {
    fn namespace(&self) -> &'static str {
        "Usage"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Collect" => {
                let opts: MemoryUsageOpts = parse(method, argument)?;
                CallResult::value(&self.loader.usage(opts.full))
            }
            "UsageFD" => {
                // Two descriptors: the stats snapshot and its version
                // stamp, both sealed memfds the caller maps read-only.
                let snapshot = serde_json::to_vec(&self.loader.usage(false))
                    .map_err(|err| ServerError::Handler(err.to_string()))?;
                let data = memfd_with(&snapshot).map_err(handler_err)?;
                let version = memfd_with(b"1").map_err(handler_err)?;
                Ok(CallResult {
                    result: Value::Null,
                    files: vec![OwnedFd::from(data), OwnedFd::from(version)],
                })
            }
            other => Err(ServerError::UnknownMethod(format!("Usage.{other}"))),
        }
    }
}

fn memfd_with(contents: &[u8]) -> Result<File, std::io::Error> {
    let memfd = memfd::MemfdOptions::default()
        .create("sandkern-usage")
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;
    let mut file = memfd.into_file();
    file.write_all(contents)?;
    Ok(file)
}

struct Metrics {
    loader: Arc<Loader>,
}

/// Metric names the sentry registers at boot; the supervisor snapshots
/// this list before any container task runs and validates later exports
/// against it.
const REGISTERED_METRICS: &[&str] = &[
    "sandkern/memory/total_bytes",
    "sandkern/processes/current",
    "sandkern/unimplemented_syscalls",
];

impl Handler for Metrics {
    fn namespace(&self) -> &'static str {
        "Metrics"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "GetRegisteredMetrics" => CallResult::value(&MetricRegistration {
                metric_names: REGISTERED_METRICS.iter().map(|s| s.to_string()).collect(),
                stage: "boot".to_string(),
            }),
            "Export" => {
                let opts: MetricsExportOpts = parse(method, argument)?;
                let kernel = self.loader.kernel();
                let mut snapshot = std::collections::HashMap::new();
                snapshot.insert(
                    "sandkern/memory/total_bytes".to_string(),
                    kernel.memory_file().total_usage(),
                );
                let process_count: usize = kernel
                    .container_ids()
                    .iter()
                    .map(|cid| kernel.processes(cid).len())
                    .sum();
                snapshot.insert(
                    "sandkern/processes/current".to_string(),
                    process_count as u64,
                );
                if let Some(only) = &opts.only_metrics {
                    snapshot.retain(|name, _| only.iter().any(|want| name.starts_with(want)));
                }
                CallResult::value(&MetricsExportData { snapshot })
            }
            other => Err(ServerError::UnknownMethod(format!("Metrics.{other}"))),
        }
    }
}

struct Cgroups {
    loader: Arc<Loader>,
}

impl Handler for Cgroups {
    fn namespace(&self) -> &'static str {
        "Cgroups"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "ReadControlFiles" => {
                let args: CgroupsReadArgs = parse(method, argument)?;
                let results = args
                    .args
                    .iter()
                    .map(|file| {
                        match self
                            .loader
                            .cgroups_read(&file.controller, &file.path, &file.name)
                        {
                            Ok(value) => CgroupsResult { value, error: None },
                            Err(error) => CgroupsResult {
                                value: String::new(),
                                error: Some(error),
                            },
                        }
                    })
                    .collect();
                CallResult::value(&CgroupsResults { results })
            }
            "WriteControlFiles" => {
                let args: CgroupsWriteArgs = parse(method, argument)?;
                let results = args
                    .args
                    .iter()
                    .map(|write| {
                        match self.loader.cgroups_write(
                            &write.file.controller,
                            &write.file.path,
                            &write.file.name,
                            &write.value,
                        ) {
                            Ok(()) => CgroupsResult {
                                value: String::new(),
                                error: None,
                            },
                            Err(error) => CgroupsResult {
                                value: String::new(),
                                error: Some(error),
                            },
                        }
                    })
                    .collect();
                CallResult::value(&CgroupsResults { results })
            }
            other => Err(ServerError::UnknownMethod(format!("Cgroups.{other}"))),
        }
    }
}

struct Debug {
    loader: Arc<Loader>,
}

impl Handler for Debug {
    fn namespace(&self) -> &'static str {
        "debug"
    }

    fn call(
        &self,
        method: &str,
        _argument: Value,
        _files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "Stacks" => CallResult::value(&self.loader.stacks()),
            other => Err(ServerError::UnknownMethod(format!("debug.{other}"))),
        }
    }
}

struct Profile;

/// Magic prefix on every emitted profile, so collectors can recognize
/// truncated output.
const PROFILE_MAGIC: &[u8] = b"sandkern-profile\n";

impl Handler for Profile {
    fn namespace(&self) -> &'static str {
        "Profile"
    }

    fn call(
        &self,
        method: &str,
        argument: Value,
        mut files: Vec<OwnedFd>,
    ) -> Result<CallResult, ServerError> {
        match method {
            "CPU" | "Heap" | "Block" | "Mutex" | "Trace" => {
                let opts: sandkern_protocol::ProfileOpts = parse(method, argument)?;
                let file = files
                    .pop()
                    .ok_or_else(|| ServerError::Handler("profile requires a file".into()))?;
                let mut out = File::from(file);
                out.write_all(PROFILE_MAGIC)
                    .and_then(|()| {
                        writeln!(out, "kind: {method}\nduration_secs: {}", opts.duration_secs)
                    })
                    .map_err(|err| ServerError::Handler(err.to_string()))?;
                Ok(CallResult::empty())
            }
            other => Err(ServerError::UnknownMethod(format!("Profile.{other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoaderArgs;
    use sandkern_protocol::{client::Client, methods, ControlAddress};
    use std::os::fd::IntoRawFd;

    fn serve(loader: Arc<Loader>, dir: &std::path::Path) -> (Controller, ControlAddress) {
        let addr = ControlAddress::Path(dir.join("ctrl.sock"));
        let fd = sandkern_protocol::server::create_socket(&addr).unwrap();
        let mut controller = Controller::new(fd.into_raw_fd(), loader).unwrap();
        controller.start_serving().unwrap();
        (controller, addr)
    }

    #[test]
    fn lifecycle_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let loader = Loader::new(LoaderArgs {
            sandbox_id: "sbx".into(),
            ..Default::default()
        })
        .unwrap();
        let boot = {
            let loader = Arc::clone(&loader);
            std::thread::spawn(move || loader.run())
        };
        let (mut controller, addr) = serve(Arc::clone(&loader), dir.path());

        let mut client = Client::connect(&addr).unwrap();
        client
            .call::<_, Value, File>(methods::CONT_MGR_START_ROOT, &"sbx", &[])
            .unwrap();
        boot.join().unwrap();

        client
            .call::<_, Value, File>(methods::LIFECYCLE_PAUSE, &Value::Null, &[])
            .unwrap();
        assert!(loader.kernel().is_paused());
        client
            .call::<_, Value, File>(methods::LIFECYCLE_RESUME, &Value::Null, &[])
            .unwrap();
        assert!(!loader.kernel().is_paused());

        let registration: MetricRegistration = client
            .call(methods::METRICS_GET_REGISTERED, &Value::Null, &[] as &[File])
            .unwrap();
        assert!(registration
            .metric_names
            .contains(&"sandkern/memory/total_bytes".to_string()));

        let stacks: String = client
            .call(methods::DEBUG_STACKS, &Value::Null, &[] as &[File])
            .unwrap();
        assert!(stacks.contains("container sbx"));

        // Wait returns the root container's (sim-immediate) exit.
        let status: sandkern_protocol::WaitStatus = client
            .call(methods::CONT_MGR_WAIT, &"sbx", &[] as &[File])
            .unwrap();
        assert!(status.exited());

        controller.stop();
    }
}

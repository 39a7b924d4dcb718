//! The sandkern command line: the OCI runtime frontend.
//!
//! Exit codes follow the runtime contract: 0 on success, 128+signo when
//! the container died from a signal, 128 for any dispatcher error.

use clap::{Args as ClapArgs, Parser, Subcommand};
use sandkern::{
    config::{Config, FileAccessType, NetworkType, Overlay2},
    sandbox::{Args as SandboxArgs, Sandbox},
    seccomp,
};
use sandkern_protocol::{ExecArgs, PortForwardOpts, ProcessSpec, SaveOpts, WaitStatus};
use sandkern_sentry::{
    control::Controller,
    loader::{Loader, LoaderArgs},
};
use std::{
    fs::File,
    io::Write,
    os::fd::{FromRawFd, RawFd},
    path::PathBuf,
    process::ExitCode,
    sync::Arc,
};

const EXIT_DISPATCH_ERROR: u8 = 128;

#[derive(Parser)]
#[command(name = "sandkern", about = "Application-kernel sandbox runtime")]
struct Cli {
    #[command(flatten)]
    globals: GlobalFlags,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct GlobalFlags {
    /// Directory for runtime state and control sockets.
    #[arg(long, default_value = "/var/run/sandkern")]
    root: PathBuf,

    #[arg(long, default_value = "systrap")]
    platform: String,

    #[arg(long, default_value = "sandbox")]
    network: String,

    #[arg(long = "file-access", default_value = "exclusive")]
    file_access: String,

    #[arg(long, default_value = "none")]
    overlay2: String,

    #[arg(long = "host-uds", default_value = "none")]
    host_uds: String,

    #[arg(long, default_value_t = false)]
    directfs: bool,

    #[arg(long = "net-raw", default_value_t = false)]
    net_raw: bool,

    #[arg(long = "oci-seccomp", default_value_t = false)]
    oci_seccomp: bool,

    #[arg(long, default_value_t = false)]
    nvproxy: bool,

    #[arg(long, default_value_t = false)]
    tpuproxy: bool,

    #[arg(long, default_value_t = false)]
    rootless: bool,

    #[arg(long, default_value_t = false)]
    profile: bool,

    #[arg(long = "pod-init-config")]
    pod_init_config: Option<PathBuf>,

    #[arg(long = "metric-server", default_value = "")]
    metric_server: String,

    #[arg(long = "cpu-num-from-quota", default_value_t = false)]
    cpu_num_from_quota: bool,

    #[arg(long, default_value_t = false)]
    debug: bool,

    #[arg(long = "log")]
    log: Option<PathBuf>,

    #[arg(long = "debug-log")]
    debug_log: Option<PathBuf>,

    #[arg(long = "panic-log")]
    panic_log: Option<PathBuf>,
}

impl GlobalFlags {
    fn to_config(&self) -> Result<Config, String> {
        Ok(Config {
            root_dir: self.root.clone(),
            platform: self.platform.clone(),
            network: self.network.parse::<NetworkType>()?,
            file_access: self.file_access.parse::<FileAccessType>()?,
            overlay2: self.overlay2.parse::<Overlay2>()?,
            host_uds: self.host_uds.parse()?,
            directfs: self.directfs,
            net_raw: self.net_raw,
            oci_seccomp: self.oci_seccomp,
            nvproxy: self.nvproxy,
            tpuproxy: self.tpuproxy,
            rootless: self.rootless,
            profile: self.profile,
            pod_init_config: self.pod_init_config.clone(),
            metric_server: self.metric_server.clone(),
            cpu_num_from_quota: self.cpu_num_from_quota,
            debug: self.debug,
            log_filename: self.log.clone(),
            debug_log: self.debug_log.clone(),
            panic_log: self.panic_log.clone(),
            ..Default::default()
        })
    }
}

#[derive(Subcommand)]
enum Command {
    /// Checkpoint a running container.
    Checkpoint {
        id: String,
        #[arg(long = "image-path")]
        image_path: PathBuf,
    },
    /// Create a sandbox for a container bundle.
    Create {
        id: String,
        #[arg(long, default_value = ".")]
        bundle: PathBuf,
    },
    /// Delete a container's resources.
    Delete {
        id: String,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Create, start, wait and delete in one step.
    Do {
        id: String,
        argv: Vec<String>,
    },
    /// Print container stats.
    Events { id: String },
    /// Execute a command inside a running container.
    Exec {
        id: String,
        argv: Vec<String>,
    },
    /// Signal a container.
    Kill {
        id: String,
        #[arg(default_value = "TERM")]
        signal: String,
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// List known sandboxes.
    List,
    /// List processes in a container.
    Ps { id: String },
    /// Pause a container.
    Pause { id: String },
    /// Forward a local endpoint to a container port.
    PortForward {
        id: String,
        port: u16,
        stream: PathBuf,
    },
    /// Restore a container from a checkpoint image.
    Restore {
        id: String,
        #[arg(long = "image-path")]
        image_path: PathBuf,
    },
    /// Resume a paused container.
    Resume { id: String },
    /// Create and start a container, waiting for it to exit.
    Run {
        id: String,
        #[arg(long, default_value = ".")]
        bundle: PathBuf,
    },
    /// Print a skeleton OCI runtime spec.
    Spec,
    /// Start a created container.
    Start { id: String },
    /// Print the state of a container.
    State { id: String },
    /// Wait for a container to exit.
    Wait { id: String },

    /// Internal: the sandbox boot entry. Not for direct use.
    #[command(hide = true)]
    Boot(BootCmd),
    /// Internal: the filesystem broker entry. Not for direct use.
    #[command(hide = true)]
    Gofer {
        #[arg(long = "io-fds")]
        io_fds: Vec<RawFd>,
        id: String,
    },
}

#[derive(ClapArgs)]
struct BootCmd {
    #[arg(long, default_value_t = false)]
    pidns: bool,
    #[arg(long = "setup-root", default_value_t = false)]
    setup_root: bool,
    #[arg(long = "apply-caps", default_value_t = false)]
    apply_caps: bool,
    #[arg(long, default_value_t = false)]
    attached: bool,

    #[arg(long = "log-fd")]
    log_fd: Option<RawFd>,
    #[arg(long = "debug-log-fd")]
    debug_log_fd: Option<RawFd>,
    #[arg(long = "panic-log-fd")]
    panic_log_fd: Option<RawFd>,
    #[arg(long = "coverage-fd")]
    coverage_fd: Option<RawFd>,
    #[arg(long = "io-fds")]
    io_fds: Vec<RawFd>,
    #[arg(long = "overlay-filestore-fds")]
    overlay_filestore_fds: Vec<RawFd>,
    #[arg(long = "mounts-fd")]
    mounts_fd: Option<RawFd>,
    #[arg(long = "start-sync-fd")]
    start_sync_fd: Option<RawFd>,
    #[arg(long = "user-log-fd")]
    user_log_fd: Option<RawFd>,
    #[arg(long = "profile-block-fd")]
    profile_block_fd: Option<RawFd>,
    #[arg(long = "profile-cpu-fd")]
    profile_cpu_fd: Option<RawFd>,
    #[arg(long = "profile-heap-fd")]
    profile_heap_fd: Option<RawFd>,
    #[arg(long = "profile-mutex-fd")]
    profile_mutex_fd: Option<RawFd>,
    #[arg(long = "trace-fd")]
    trace_fd: Option<RawFd>,
    #[arg(long = "controller-fd")]
    controller_fd: Option<RawFd>,
    #[arg(long = "spec-fd")]
    spec_fd: Option<RawFd>,
    #[arg(long = "pod-init-config-fd")]
    pod_init_config_fd: Option<RawFd>,
    #[arg(long = "sink-fds")]
    sink_fds: Vec<RawFd>,
    #[arg(long = "device-fd")]
    device_fd: Option<RawFd>,
    #[arg(long = "sync-userns-fd")]
    sync_userns_fd: Option<RawFd>,
    #[arg(long = "stdio-fds")]
    stdio_fds: Vec<RawFd>,
    #[arg(long = "exec-fd")]
    exec_fd: Option<RawFd>,

    #[arg(long = "total-host-memory", default_value_t = 0)]
    total_host_memory: u64,
    #[arg(long = "total-memory", default_value_t = 0)]
    total_memory: u64,
    #[arg(long = "cpu-num", default_value_t = 2)]
    cpu_num: u32,

    id: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.globals.debug { "debug" } else { "info" }),
    )
    .init();

    match dispatch(&cli) {
        Ok(code) => code,
        Err(err) => {
            log::error!("{err}");
            ExitCode::from(EXIT_DISPATCH_ERROR)
        }
    }
}

fn exit_code_for(status: WaitStatus) -> ExitCode {
    if status.signaled() {
        ExitCode::from(128u8.wrapping_add(status.signal() as u8))
    } else {
        ExitCode::from(status.exit_status() as u8)
    }
}

fn state_path(config: &Config, id: &str) -> PathBuf {
    config.root_dir.join(id).join("state.json")
}

fn save_sandbox(config: &Config, sandbox: &Sandbox) -> Result<(), String> {
    let path = state_path(config, &sandbox.id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
    }
    let encoded = serde_json::to_vec_pretty(sandbox).map_err(|err| err.to_string())?;
    std::fs::write(&path, encoded).map_err(|err| err.to_string())
}

fn load_sandbox(config: &Config, id: &str) -> Result<Sandbox, String> {
    let path = state_path(config, id);
    let raw = std::fs::read(&path)
        .map_err(|err| format!("container {id:?} not found: {err}"))?;
    serde_json::from_slice(&raw).map_err(|err| err.to_string())
}

fn parse_signal(name: &str) -> Result<i32, String> {
    let trimmed = name.trim_start_matches("SIG");
    match trimmed {
        "HUP" => Ok(1),
        "INT" => Ok(2),
        "QUIT" => Ok(3),
        "KILL" => Ok(9),
        "USR1" => Ok(10),
        "USR2" => Ok(12),
        "TERM" => Ok(15),
        "STOP" => Ok(19),
        "CONT" => Ok(18),
        other => other
            .parse::<i32>()
            .map_err(|_| format!("unknown signal {name:?}")),
    }
}

fn dispatch(cli: &Cli) -> Result<ExitCode, String> {
    let config = cli.globals.to_config()?;
    match &cli.command {
        Command::Create { id, bundle } => {
            log::info!("creating sandbox {id:?} for bundle {}", bundle.display());
            let sandbox = Sandbox::new(
                &config,
                SandboxArgs {
                    id: id.clone(),
                    ..Default::default()
                },
            )
            .map_err(|err| err.to_string())?;
            save_sandbox(&config, &sandbox)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Start { id } => {
            let sandbox = load_sandbox(&config, id)?;
            sandbox.start_root().map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { id, bundle } => {
            log::info!("running {id:?} from bundle {}", bundle.display());
            let sandbox = Sandbox::new(
                &config,
                SandboxArgs {
                    id: id.clone(),
                    attached: true,
                    ..Default::default()
                },
            )
            .map_err(|err| err.to_string())?;
            save_sandbox(&config, &sandbox)?;
            sandbox.start_root().map_err(|err| err.to_string())?;
            let status = sandbox.wait(id).map_err(|err| err.to_string())?;
            let _ = sandbox.destroy();
            Ok(exit_code_for(status))
        }
        Command::Wait { id } => {
            let sandbox = load_sandbox(&config, id)?;
            let status = sandbox.wait(id).map_err(|err| err.to_string())?;
            println!(
                "{}",
                serde_json::json!({"id": id, "exitStatus": status.0})
            );
            Ok(exit_code_for(status))
        }
        Command::Kill { id, signal, all } => {
            let sandbox = load_sandbox(&config, id)?;
            let signo = parse_signal(signal)?;
            sandbox
                .signal_container(id, signo, *all)
                .map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { id, force } => {
            match load_sandbox(&config, id) {
                Ok(sandbox) => {
                    if sandbox.is_running() && !force {
                        return Err(format!("container {id:?} is still running"));
                    }
                    sandbox.destroy().map_err(|err| err.to_string())?;
                }
                Err(err) => {
                    if !force {
                        return Err(err);
                    }
                }
            }
            let _ = std::fs::remove_dir_all(config.root_dir.join(id));
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec { id, argv } => {
            let sandbox = load_sandbox(&config, id)?;
            let pid = sandbox
                .execute(&ExecArgs {
                    container_id: id.clone(),
                    process: ProcessSpec {
                        argv: argv.clone(),
                        ..Default::default()
                    },
                    guest_fds: vec![],
                })
                .map_err(|err| err.to_string())?;
            println!("{pid}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Do { id, argv } => {
            let sandbox = Sandbox::new(
                &config,
                SandboxArgs {
                    id: id.clone(),
                    attached: true,
                    ..Default::default()
                },
            )
            .map_err(|err| err.to_string())?;
            sandbox.start_root().map_err(|err| err.to_string())?;
            let pid = sandbox
                .execute(&ExecArgs {
                    container_id: id.clone(),
                    process: ProcessSpec {
                        argv: argv.clone(),
                        ..Default::default()
                    },
                    guest_fds: vec![],
                })
                .map_err(|err| err.to_string())?;
            let status = sandbox
                .wait_pid(id, pid)
                .map_err(|err| err.to_string())?;
            let _ = sandbox.destroy();
            Ok(exit_code_for(status))
        }
        Command::Events { id } => {
            let sandbox = load_sandbox(&config, id)?;
            let event = sandbox.event(id).map_err(|err| err.to_string())?;
            println!(
                "{}",
                serde_json::to_string(&event).map_err(|err| err.to_string())?
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Ps { id } => {
            let sandbox = load_sandbox(&config, id)?;
            let rows = sandbox.processes(id).map_err(|err| err.to_string())?;
            println!("UID  PID  PPID  CMD");
            for row in rows {
                println!("{}  {}  {}  {}", row.uid, row.pid, row.ppid, row.cmd);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Pause { id } => {
            let sandbox = load_sandbox(&config, id)?;
            sandbox.pause(id).map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { id } => {
            let sandbox = load_sandbox(&config, id)?;
            sandbox.resume(id).map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Checkpoint { id, image_path } => {
            let sandbox = load_sandbox(&config, id)?;
            let file = File::create(image_path).map_err(|err| err.to_string())?;
            sandbox
                .checkpoint(id, file, &SaveOpts::default())
                .map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore { id, image_path } => {
            let sandbox = load_sandbox(&config, id)?;
            sandbox
                .restore(&config, id, image_path)
                .map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::PortForward { id, port, stream } => {
            let sandbox = load_sandbox(&config, id)?;
            let stream = File::open(stream).map_err(|err| err.to_string())?;
            sandbox
                .port_forward(
                    &PortForwardOpts {
                        container_id: id.clone(),
                        port: *port,
                    },
                    stream,
                )
                .map_err(|err| err.to_string())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            if let Ok(entries) = std::fs::read_dir(&config.root_dir) {
                for entry in entries.flatten() {
                    if entry.path().join("state.json").exists() {
                        println!("{}", entry.file_name().to_string_lossy());
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::State { id } => {
            let sandbox = load_sandbox(&config, id)?;
            let status = if sandbox.is_running() {
                "running"
            } else {
                "stopped"
            };
            println!(
                "{}",
                serde_json::json!({
                    "id": id,
                    "pid": sandbox.getpid(),
                    "status": status,
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Spec => {
            println!(
                "{}",
                serde_json::json!({
                    "ociVersion": "1.0.2",
                    "process": {"args": ["sh"], "cwd": "/", "terminal": false},
                    "root": {"path": "rootfs", "readonly": true},
                })
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Boot(boot) => run_boot(&config, boot),
        Command::Gofer { io_fds, id } => {
            // The filesystem broker's transport internals live outside
            // this crate; the entry point only validates its contract.
            log::info!("gofer for container {id:?} with {} io fds", io_fds.len());
            Err("gofer transport is not built into this binary".to_string())
        }
    }
}

/// The internal boot entry: initialize the sentry, register the control
/// server, install the host seccomp filter, signal readiness, and block
/// until StartRoot.
fn run_boot(config: &Config, boot: &BootCmd) -> Result<ExitCode, String> {
    log::info!("booting sandbox {:?}", boot.id);
    log::debug!(
        "donated fds: {} io, {} stdio, {} sinks, {} overlay filestores, mounts={} spec={} exec={} device={}",
        boot.io_fds.len(),
        boot.stdio_fds.len(),
        boot.sink_fds.len(),
        boot.overlay_filestore_fds.len(),
        boot.mounts_fd.is_some(),
        boot.spec_fd.is_some(),
        boot.exec_fd.is_some(),
        boot.device_fd.is_some(),
    );
    log::debug!(
        "log fds: log={:?} debug={:?} panic={:?} user={:?} coverage={:?} trace={:?} \
         profile=[{:?},{:?},{:?},{:?}] pod-init-config={:?} userns-sync={:?}",
        boot.log_fd,
        boot.debug_log_fd,
        boot.panic_log_fd,
        boot.user_log_fd,
        boot.coverage_fd,
        boot.trace_fd,
        boot.profile_block_fd,
        boot.profile_cpu_fd,
        boot.profile_heap_fd,
        boot.profile_mutex_fd,
        boot.pod_init_config_fd,
        boot.sync_userns_fd,
    );
    log::debug!(
        "boot mode: pidns={} setup_root={} apply_caps={} attached={}",
        boot.pidns,
        boot.setup_root,
        boot.apply_caps,
        boot.attached,
    );

    let loader = Loader::new(LoaderArgs {
        sandbox_id: boot.id.clone(),
        platform_name: config.platform.clone(),
        profile_enable: config.profile,
        host_network: config.network == NetworkType::Host,
        total_host_memory: boot.total_host_memory,
        total_memory: boot.total_memory,
        cpu_num: boot.cpu_num,
        attached: boot.attached,
    })
    .map_err(|err| err.to_string())?;

    let controller_fd = boot
        .controller_fd
        .ok_or_else(|| "boot requires --controller-fd".to_string())?;
    let mut controller =
        Controller::new(controller_fd, Arc::clone(&loader)).map_err(|err| err.to_string())?;
    controller.start_serving().map_err(|err| err.to_string())?;

    // Profiling scans /proc/self/maps, which must happen before the
    // filter forbids the open.
    if config.profile {
        match std::fs::read_to_string("/proc/self/maps") {
            Ok(maps) => log::debug!("profiler snapshot: {} map entries", maps.lines().count()),
            Err(err) => log::warn!("profiler map scan failed: {err}"),
        }
    }

    // The filter must be installed before any untrusted code runs.
    let rules = seccomp::assemble(&seccomp::PolicyOpts {
        config,
        controller_fd,
    });
    let default_action = seccomp::probe_default_action();
    let program = seccomp::compile(&rules, default_action).map_err(|err| err.to_string())?;
    seccomp::install(&program).map_err(|err| err.to_string())?;

    // Tell the supervisor the control server is up: exactly one byte on
    // the sync pipe.
    if let Some(sync_fd) = boot.start_sync_fd {
        let mut sync = unsafe { File::from_raw_fd(sync_fd) };
        sync.write_all(&[b'S']).map_err(|err| err.to_string())?;
    }

    // Block until StartRoot arrives, then run the root container to
    // completion.
    loader.run();
    let status = loader
        .wait_container(&boot.id)
        .map_err(|err| err.to_string())?;
    controller.stop();
    log::info!("sandbox {:?} exited: {status:?}", boot.id);
    Ok(ExitCode::SUCCESS)
}

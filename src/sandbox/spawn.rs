//! Sandbox process creation: namespaces, credentials, and exec.
//!
//! The sandbox process is created with clone(2) so namespace entry is
//! atomic with process creation; the child remaps its donated
//! descriptors, drops into its chroot and credentials, and execs this
//! binary's internal `boot` command.

use super::donation::{Agency, TransferPlan};
use crate::{
    cgroup::{self, Cgroup},
    config::{Config, NetworkType},
    errors::SandboxError,
};
use nix::{
    sched::CloneFlags,
    sys::resource::{getrlimit, setrlimit, Resource},
    unistd::Pid,
};
use std::{ffi::CString, fs, os::fd::OwnedFd, path::PathBuf};

/// The uid/gid the sandbox runs as inside a fresh user namespace.
pub const NOBODY: u32 = 65534;

/// Minimum CPU count handed to the sentry. Dropping below two can make
/// applications disable internal locking, which produces bugs that are
/// very hard to debug.
pub const MIN_CPUS: u32 = 2;

/// Everything spawn decides before touching the host.
#[derive(Debug, Clone)]
pub struct SpawnPlan {
    pub clone_flags: CloneFlags,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    /// uid/gid the child switches to (in the parent namespace view).
    pub uid: u32,
    pub gid: u32,
    /// Map NOBODY onto itself inside the new user namespace.
    pub write_uid_gid_maps: bool,
    /// Build an empty chroot and bind-mount the executable into it.
    pub setup_chroot: bool,
    /// Ambient capabilities granted to the child.
    pub ambient_caps: Vec<libc::c_ulong>,
    /// Synchronize uid/gid map installation over a socketpair
    /// (rootless only).
    pub rootless_userns_sync: bool,
    pub attached: bool,
}

/// Computes the namespace set and credential strategy for a config.
pub fn compute_plan(
    config: &Config,
    requires_current_pidns: bool,
    rootless_euid: bool,
) -> Result<SpawnPlan, SandboxError> {
    // Mount, IPC and UTS namespaces are always fresh: the host's are
    // virtualized inside the sandbox, so run in empty ones.
    let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWUTS;
    let mut argv = Vec::new();

    if requires_current_pidns {
        // Platform backends that expose host-owned threads need the
        // sandbox to share the host PID namespace.
        log::info!("sandbox will be started in the current PID namespace");
    } else {
        log::info!("sandbox will be started in a new PID namespace");
        flags |= CloneFlags::CLONE_NEWPID;
        argv.push("--pidns".to_string());
    }

    match config.network {
        NetworkType::Host => {
            log::info!("sandbox will share the host network namespace");
        }
        NetworkType::Sandbox => {
            log::info!("sandbox will be started in a new network namespace");
            flags |= CloneFlags::CLONE_NEWNET;
        }
        NetworkType::None => {
            log::info!("sandbox networking disabled; using an empty network namespace");
            flags |= CloneFlags::CLONE_NEWNET;
        }
    }

    let mut plan = SpawnPlan {
        clone_flags: flags,
        argv,
        env: Vec::new(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        write_uid_gid_maps: false,
        setup_chroot: false,
        ambient_caps: Vec::new(),
        rootless_userns_sync: false,
        attached: false,
    };

    // User namespace: required by host networking and direct filesystem
    // access; otherwise used to drop to nobody.
    if config.network == NetworkType::Host || config.directfs {
        if rootless_euid && !config.rootless {
            return Err(SandboxError::Privileges(
                "unable to run a rootless container without userns support".to_string(),
            ));
        }
        plan.argv.push("--apply-caps".to_string());
        if config.test_only_allow_run_as_current_user_without_chroot {
            log::warn!("running sandbox in test mode without chroot; only safe in tests");
        } else if has_capability_sys_admin() || rootless_euid {
            plan.setup_chroot = true;
            plan.argv.push("--setup-root".to_string());
        } else {
            return Err(SandboxError::Privileges(
                "can't run sandbox process in minimal chroot since we don't have CAP_SYS_ADMIN"
                    .to_string(),
            ));
        }
        if rootless_euid {
            plan.rootless_userns_sync = true;
            plan.clone_flags |= CloneFlags::CLONE_NEWUSER;
        }
    } else if config.test_only_allow_run_as_current_user_without_chroot {
        log::warn!("running sandbox in test mode as the current user; only safe in tests");
    } else {
        plan.clone_flags |= CloneFlags::CLONE_NEWUSER;
        plan.setup_chroot = true;
        plan.argv.push("--setup-root".to_string());
        if config.rootless || rootless_euid {
            log::info!(
                "rootless mode: sandbox will run as nobody inside the user namespace, mapped to uid {} gid {}",
                plan.uid,
                plan.gid
            );
            plan.rootless_userns_sync = rootless_euid;
        } else {
            // Map nobody in the new namespace to nobody in the parent.
            plan.uid = NOBODY;
            plan.gid = NOBODY;
        }
        plan.write_uid_gid_maps = !plan.rootless_userns_sync;
        // The sandbox constructs an empty root for itself, so it needs
        // these even as nobody; SETPCAP to clear the bounding set.
        // Linux capability numbers (include/uapi/linux/capability.h); not
        // exposed by the `libc` crate as named constants.
        const CAP_SYS_ADMIN: libc::c_ulong = 21;
        const CAP_SYS_CHROOT: libc::c_ulong = 18;
        const CAP_SETPCAP: libc::c_ulong = 8;
        plan.ambient_caps = vec![CAP_SYS_ADMIN, CAP_SYS_CHROOT, CAP_SETPCAP];
    }

    if config.platform == "kvm" {
        // Async preemption trips over the KVM vCPU threads.
        plan.env
            .push(("GODEBUG".to_string(), "asyncpreemptoff=1".to_string()));
    }
    Ok(plan)
}

/// Appends the CPU and memory sizing flags. Total host memory is always
/// passed; the sandbox memory is capped at the cgroup limit when one is
/// set, and the CPU count may be derived from the quota.
pub fn sizing_flags(
    config: &Config,
    cgroup: Option<&Cgroup>,
) -> Result<Vec<String>, SandboxError> {
    let total_host = cgroup::total_system_memory()?;
    let mut flags = vec![format!("--total-host-memory={total_host}")];

    let mut memory = total_host;
    if let Some(cgroup) = cgroup {
        let mut cpu_num = cgroup.num_cpus()?;
        if config.cpu_num_from_quota {
            if let Some(quota) = cgroup.cpu_quota()? {
                let from_quota = (quota.ceil() as u32).max(MIN_CPUS);
                if from_quota < cpu_num {
                    // Quota only ever lowers the count.
                    cpu_num = from_quota;
                }
            }
        }
        flags.push(format!("--cpu-num={cpu_num}"));

        if let Some(limit) = cgroup.memory_limit()? {
            if limit < memory {
                memory = limit;
            }
        }
    } else {
        flags.push(format!("--cpu-num={}", cgroup::host_cpu_count()));
    }
    flags.push(format!("--total-memory={memory}"));
    Ok(flags)
}

/// Best-effort raise of RLIMIT_MEMLOCK before exec: the memory
/// allocator briefly mlocks large ranges to fault many pages at once.
/// Failure is logged, not fatal.
pub fn raise_memlock_limit() {
    match getrlimit(Resource::RLIMIT_MEMLOCK) {
        Ok((cur, max)) if cur == nix::sys::resource::RLIM_INFINITY
            && max == nix::sys::resource::RLIM_INFINITY => {}
        Ok(_) => {
            if let Err(err) = setrlimit(
                Resource::RLIMIT_MEMLOCK,
                nix::sys::resource::RLIM_INFINITY,
                nix::sys::resource::RLIM_INFINITY,
            ) {
                // Expected without CAP_SYS_RESOURCE.
                log::info!("failed to set RLIMIT_MEMLOCK: {err}");
            }
        }
        Err(err) => log::warn!("failed to get RLIMIT_MEMLOCK: {err}"),
    }
}

fn has_capability_sys_admin() -> bool {
    nix::unistd::geteuid().is_root()
}

/// The spawned sandbox process.
pub struct Spawned {
    pub pid: Pid,
    pub original_oom_score_adj: i32,
}

/// Forks the sandbox through clone(2) and execs the boot command.
///
/// `exe_args` is the full command line (binary, runtime flags, `boot`,
/// boot flags, container id); `plan` carries the namespace and
/// credential decisions; `transfer` the descriptor remapping.
pub fn spawn(
    plan: &SpawnPlan,
    exe_args: &[String],
    transfer: &TransferPlan,
    _keep_alive: &Agency,
) -> Result<Spawned, SandboxError> {
    raise_memlock_limit();

    let argv: Vec<CString> = exe_args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|err| SandboxError::CreateSandboxProcess(err.to_string()))?;
    let envp: Vec<CString> = plan
        .env
        .iter()
        .map(|(k, v)| CString::new(format!("{k}={v}")))
        .collect::<Result<_, _>>()
        .map_err(|err| SandboxError::CreateSandboxProcess(err.to_string()))?;

    let mut stack = vec![0u8; 1 << 20];
    let clone_flags = plan.clone_flags;
    let child = {
        let plan = plan.clone();
        let mappings = transfer.mappings.clone();
        let cb = Box::new(move || child_entry(&plan, &mappings, &argv, &envp));
        unsafe { nix::sched::clone(cb, &mut stack, clone_flags, Some(libc::SIGCHLD)) }
            .map_err(|err| SandboxError::CreateSandboxProcess(err.to_string()))?
    };

    if plan.write_uid_gid_maps {
        write_id_maps(child, plan.uid, plan.gid)?;
    }

    let original_oom_score_adj = read_oom_score_adj(child).unwrap_or(0);
    log::info!("sandbox started, PID: {child}");
    Ok(Spawned {
        pid: child,
        original_oom_score_adj,
    })
}

/// Runs in the child between clone and exec. Only async-signal-safe
/// work belongs here.
fn child_entry(
    plan: &SpawnPlan,
    mappings: &[(i32, i32)],
    argv: &[CString],
    envp: &[CString],
) -> isize {
    // Detach from the parent's session so a reparent doesn't deliver
    // SIGHUP/SIGCONT.
    let _ = nix::unistd::setsid();

    if plan.attached {
        let _ = nix::sys::prctl::set_pdeathsig(nix::sys::signal::Signal::SIGKILL);
    }

    // Remap donated descriptors to their advertised numbers and clear
    // close-on-exec so they survive the exec.
    for (source, target) in mappings {
        if source != target && unsafe { libc::dup2(*source, *target) } < 0 {
            return 127;
        }
        let flags = unsafe { libc::fcntl(*target, libc::F_GETFD) };
        if flags >= 0 {
            unsafe { libc::fcntl(*target, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        }
    }

    if plan.setup_chroot && setup_chroot().is_err() {
        return 126;
    }

    if plan.write_uid_gid_maps {
        // The parent writes the maps; wait for them to exist before
        // switching ids.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while nix::unistd::setresuid(
            nix::unistd::Uid::from_raw(NOBODY),
            nix::unistd::Uid::from_raw(NOBODY),
            nix::unistd::Uid::from_raw(NOBODY),
        )
        .is_err()
        {
            if std::time::Instant::now() > deadline {
                return 125;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let _ = nix::unistd::setresgid(
            nix::unistd::Gid::from_raw(NOBODY),
            nix::unistd::Gid::from_raw(NOBODY),
            nix::unistd::Gid::from_raw(NOBODY),
        );
    }

    for cap in &plan.ambient_caps {
        unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE,
                *cap,
                0,
                0,
            );
        }
    }

    match nix::unistd::execve(&argv[0].clone(), argv, envp) {
        Err(errno) => -(errno as isize),
        Ok(_) => unreachable!(),
    }
}

/// Builds the minimal chroot: an empty tmpfs with the executable
/// bind-mounted read-only inside.
fn setup_chroot() -> Result<(), nix::errno::Errno> {
    use nix::mount::{mount, MsFlags};
    let root = "/tmp";
    mount(
        Some("sandkern-root"),
        root,
        Some("tmpfs"),
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID,
        None::<&str>,
    )?;
    let exe = fs::read_link("/proc/self/exe").unwrap_or_else(|_| PathBuf::from("/proc/self/exe"));
    let target = format!("{root}/sandkern");
    let _ = fs::File::create(&target);
    mount(
        Some(exe.as_path()),
        target.as_str(),
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        None::<&str>,
    )?;
    nix::unistd::chroot(root)?;
    nix::unistd::chdir("/")?;
    Ok(())
}

/// Maps NOBODY onto itself inside the child's fresh user namespace.
fn write_id_maps(child: Pid, uid: u32, gid: u32) -> Result<(), SandboxError> {
    let base = format!("/proc/{child}");
    fs::write(format!("{base}/setgroups"), "deny")
        .map_err(|err| SandboxError::CreateSandboxProcess(format!("setgroups: {err}")))?;
    fs::write(format!("{base}/uid_map"), format!("{NOBODY} {uid} 1\n"))
        .map_err(|err| SandboxError::CreateSandboxProcess(format!("uid_map: {err}")))?;
    fs::write(format!("{base}/gid_map"), format!("{NOBODY} {gid} 1\n"))
        .map_err(|err| SandboxError::CreateSandboxProcess(format!("gid_map: {err}")))?;
    Ok(())
}

fn read_oom_score_adj(pid: Pid) -> Result<i32, SandboxError> {
    let raw = fs::read_to_string(format!("/proc/{pid}/oom_score_adj"))?;
    raw.trim()
        .parse()
        .map_err(|_| SandboxError::CreateSandboxProcess(format!("bad oom_score_adj {raw:?}")))
}

/// A synchronization socketpair for rootless user-namespace setup: the
/// parent installs maps with newuidmap/newgidmap, then signals the
/// child over this socket.
pub fn rootless_sync_pair() -> Result<(OwnedFd, OwnedFd), SandboxError> {
    let (parent, child) = nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((parent, child))
}

/// Parent half of the rootless handshake: install the child's uid/gid
/// maps through the setuid helpers, then release the child.
pub fn finish_rootless_userns(
    sync: &OwnedFd,
    child: Pid,
    uid: u32,
    gid: u32,
) -> Result<(), SandboxError> {
    log::debug!("setting user mappings for pid {child}");
    for (tool, id) in [("newuidmap", uid), ("newgidmap", gid)] {
        let output = std::process::Command::new(tool)
            .args([
                child.as_raw().to_string(),
                NOBODY.to_string(),
                id.to_string(),
                "1".to_string(),
            ])
            .output()
            .map_err(|err| SandboxError::CreateSandboxProcess(format!("{tool}: {err}")))?;
        if !output.status.success() {
            return Err(SandboxError::CreateSandboxProcess(format!(
                "{tool} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
    }
    let mut release = std::fs::File::from(sync.try_clone()?);
    std::io::Write::write_all(&mut release, b"M")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            platform: "systrap".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_namespaces_fresh_everything() {
        let plan = compute_plan(&base_config(), false, false).unwrap();
        for flag in [
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNET,
            CloneFlags::CLONE_NEWUSER,
        ] {
            assert!(plan.clone_flags.contains(flag), "missing {flag:?}");
        }
        assert!(plan.argv.contains(&"--pidns".to_string()));
        assert!(plan.setup_chroot);
        assert_eq!(plan.uid, NOBODY);
        assert_eq!(plan.ambient_caps.len(), 3);
    }

    #[test]
    fn current_pidns_platforms_skip_pidns() {
        let plan = compute_plan(&base_config(), true, false).unwrap();
        assert!(!plan.clone_flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(!plan.argv.contains(&"--pidns".to_string()));
    }

    #[test]
    fn host_network_keeps_host_netns() {
        let mut config = base_config();
        config.network = NetworkType::Host;
        config.test_only_allow_run_as_current_user_without_chroot = true;
        let plan = compute_plan(&config, false, false).unwrap();
        assert!(!plan.clone_flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(plan.argv.contains(&"--apply-caps".to_string()));
    }

    #[test]
    fn kvm_sets_godebug() {
        let mut config = base_config();
        config.platform = "kvm".to_string();
        let plan = compute_plan(&config, false, false).unwrap();
        assert!(plan
            .env
            .iter()
            .any(|(k, v)| k == "GODEBUG" && v == "asyncpreemptoff=1"));
    }

    #[test]
    fn sizing_without_cgroup_uses_host() {
        let config = base_config();
        let flags = sizing_flags(&config, None).unwrap();
        assert!(flags.iter().any(|f| f.starts_with("--total-host-memory=")));
        assert!(flags.iter().any(|f| f.starts_with("--total-memory=")));
        assert!(flags.iter().any(|f| f.starts_with("--cpu-num=")));
    }

    #[test]
    fn quota_cpu_count_clamps_to_min() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("cpu.max"))
            .unwrap()
            .write_all(b"50000 100000\n")
            .unwrap();
        std::fs::File::create(dir.path().join("cpuset.cpus.effective"))
            .unwrap()
            .write_all(b"0-7\n")
            .unwrap();
        std::fs::File::create(dir.path().join("memory.max"))
            .unwrap()
            .write_all(b"max\n")
            .unwrap();
        let cgroup = Cgroup::new(dir.path().to_path_buf(), true);

        let mut config = base_config();
        config.cpu_num_from_quota = true;
        let flags = sizing_flags(&config, Some(&cgroup)).unwrap();
        // Quota says 0.5 CPUs; the minimum of 2 wins.
        assert!(flags.contains(&format!("--cpu-num={MIN_CPUS}")));
    }

    #[test]
    fn quota_only_lowers_cpu_count() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        std::fs::File::create(dir.path().join("cpu.max"))
            .unwrap()
            .write_all(b"1600000 100000\n")
            .unwrap();
        std::fs::File::create(dir.path().join("cpuset.cpus.effective"))
            .unwrap()
            .write_all(b"0-3\n")
            .unwrap();
        std::fs::File::create(dir.path().join("memory.max"))
            .unwrap()
            .write_all(b"max\n")
            .unwrap();
        let cgroup = Cgroup::new(dir.path().to_path_buf(), true);

        let mut config = base_config();
        config.cpu_num_from_quota = true;
        let flags = sizing_flags(&config, Some(&cgroup)).unwrap();
        // Quota allows 16 CPUs but the cpuset has 4; keep 4.
        assert!(flags.contains(&"--cpu-num=4".to_string()));
    }
}

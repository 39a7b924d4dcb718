//! Policy assembly: which syscalls the sandbox process may make of the
//! host, as a function of the runtime configuration.

use super::{rule, ArgMatcher::*, Rule, SyscallRules};
use crate::config::{Config, NetworkType};
use std::os::fd::RawFd;

/// The syscalls the sentry needs from the host no matter how it is
/// configured.
pub fn default_rules() -> SyscallRules {
    let mut rules = SyscallRules::new();
    rules
        .allow(libc::SYS_clock_gettime)
        .allow(libc::SYS_clock_nanosleep)
        .allow(libc::SYS_close)
        .allow(libc::SYS_dup)
        .add(
            libc::SYS_dup3,
            rule(&[MatchAny, MatchAny, EqualTo(libc::O_CLOEXEC as u64)]),
        )
        .allow(libc::SYS_epoll_create1)
        .allow(libc::SYS_epoll_ctl)
        .add(
            libc::SYS_epoll_pwait,
            rule(&[MatchAny, MatchAny, MatchAny, MatchAny, EqualTo(0)]),
        )
        .add(libc::SYS_eventfd2, rule(&[EqualTo(0), EqualTo(0)]))
        .allow(libc::SYS_exit)
        .allow(libc::SYS_exit_group)
        .allow(libc::SYS_fallocate)
        .allow(libc::SYS_fchmod)
        .add(
            libc::SYS_fcntl,
            rule(&[MatchAny, EqualTo(libc::F_GETFL as u64)]),
        )
        .add(
            libc::SYS_fcntl,
            rule(&[MatchAny, EqualTo(libc::F_SETFL as u64)]),
        )
        .add(
            libc::SYS_fcntl,
            rule(&[MatchAny, EqualTo(libc::F_GETFD as u64)]),
        )
        .allow(libc::SYS_fstat)
        .allow(libc::SYS_fsync)
        .allow(libc::SYS_ftruncate)
        .allow(libc::SYS_getpid)
        .allow(libc::SYS_getrandom)
        .add(
            libc::SYS_getsockopt,
            rule(&[
                MatchAny,
                EqualTo(libc::SOL_SOCKET as u64),
                EqualTo(libc::SO_DOMAIN as u64),
            ]),
        )
        .add(
            libc::SYS_getsockopt,
            rule(&[
                MatchAny,
                EqualTo(libc::SOL_SOCKET as u64),
                EqualTo(libc::SO_TYPE as u64),
            ]),
        )
        .add(
            libc::SYS_getsockopt,
            rule(&[
                MatchAny,
                EqualTo(libc::SOL_SOCKET as u64),
                EqualTo(libc::SO_ERROR as u64),
            ]),
        )
        .allow(libc::SYS_gettid)
        .allow(libc::SYS_gettimeofday);

    // futex: private wait/wake is what sentry synchronization compiles
    // down to; non-private variants are kept for cross-process wakeups.
    for op in [
        libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
        libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
        libc::FUTEX_WAIT,
        libc::FUTEX_WAKE,
    ] {
        rules.add(libc::SYS_futex, rule(&[MatchAny, EqualTo(op as u64)]));
    }

    // ioctl: host-FD readiness and terminal control only.
    for request in [
        libc::FIONREAD as u64,
        libc::TCGETS,
        libc::TCSETS,
        libc::TCSETSF,
        libc::TCSETSW,
        libc::TIOCSWINSZ,
        libc::TIOCGWINSZ,
    ] {
        rules.add(
            libc::SYS_ioctl,
            rule(&[NonNegativeFd, EqualTo(request)]),
        );
    }

    rules
        .allow(libc::SYS_lseek)
        .allow(libc::SYS_madvise)
        .add(libc::SYS_membarrier, rule(&[EqualTo(0), EqualTo(0)]))
        .allow(libc::SYS_mincore)
        .allow(libc::SYS_mlock)
        .allow(libc::SYS_mprotect)
        .allow(libc::SYS_munlock)
        .allow(libc::SYS_munmap)
        .allow(libc::SYS_nanosleep)
        .allow(libc::SYS_ppoll)
        .allow(libc::SYS_pread64)
        .allow(libc::SYS_preadv)
        .allow(libc::SYS_preadv2)
        .allow(libc::SYS_pwrite64)
        .allow(libc::SYS_pwritev)
        .allow(libc::SYS_pwritev2)
        .allow(libc::SYS_read)
        .allow(libc::SYS_recvmsg)
        .allow(libc::SYS_restart_syscall)
        .allow(libc::SYS_rt_sigaction)
        .allow(libc::SYS_rt_sigprocmask)
        .allow(libc::SYS_rt_sigreturn)
        .allow(libc::SYS_sched_yield)
        .allow(libc::SYS_sendmsg)
        .allow(libc::SYS_shutdown)
        .allow(libc::SYS_sigaltstack)
        .allow(libc::SYS_tgkill)
        .allow(libc::SYS_write)
        .allow(libc::SYS_writev);

    // mmap: the flag combinations the memory manager actually uses.
    for flags in [
        libc::MAP_SHARED,
        libc::MAP_SHARED | libc::MAP_FIXED,
        libc::MAP_PRIVATE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
    ] {
        rules.add(
            libc::SYS_mmap,
            rule(&[MatchAny, MatchAny, MatchAny, EqualTo(flags as u64)]),
        );
    }
    rules.add(
        libc::SYS_mmap,
        rule(&[
            MatchAny,
            MatchAny,
            EqualTo((libc::PROT_READ | libc::PROT_WRITE) as u64),
            EqualTo((libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED) as u64),
        ]),
    );

    rules
}

/// The per-FD sub-policy for the control socket: accept new control
/// connections, the one listen the controller performs, and peer
/// credential checks. Nothing else touches that descriptor.
pub fn control_server_rules(controller_fd: RawFd) -> SyscallRules {
    let fd = controller_fd as u64;
    let mut rules = SyscallRules::new();
    rules
        .add(libc::SYS_accept4, rule(&[EqualTo(fd)]))
        .add(libc::SYS_listen, rule(&[EqualTo(fd), EqualTo(16)]))
        .add(
            libc::SYS_getsockopt,
            rule(&[
                EqualTo(fd),
                EqualTo(libc::SOL_SOCKET as u64),
                EqualTo(libc::SO_PEERCRED as u64),
            ]),
        );
    rules
}

fn host_network_rules(raw_sockets: bool) -> SyscallRules {
    let mut rules = SyscallRules::new();
    rules
        .allow(libc::SYS_accept4)
        .allow(libc::SYS_bind)
        .allow(libc::SYS_connect)
        .allow(libc::SYS_getpeername)
        .allow(libc::SYS_getsockname)
        .allow(libc::SYS_recvfrom)
        .allow(libc::SYS_sendto)
        .add(
            libc::SYS_socket,
            rule(&[EqualTo(libc::AF_INET as u64)]),
        )
        .add(
            libc::SYS_socket,
            rule(&[EqualTo(libc::AF_INET6 as u64)]),
        );
    if raw_sockets {
        rules.add(
            libc::SYS_socket,
            rule(&[
                EqualTo(libc::AF_PACKET as u64),
                EqualTo((libc::SOCK_RAW | libc::SOCK_CLOEXEC) as u64),
            ]),
        );
    }
    rules
}

fn direct_fs_rules() -> SyscallRules {
    let mut rules = SyscallRules::new();
    rules
        .allow(libc::SYS_openat)
        .allow(libc::SYS_newfstatat)
        .allow(libc::SYS_unlinkat)
        .allow(libc::SYS_mkdirat)
        .allow(libc::SYS_renameat2)
        .allow(libc::SYS_linkat)
        .allow(libc::SYS_symlinkat)
        .allow(libc::SYS_readlinkat)
        .allow(libc::SYS_utimensat)
        .allow(libc::SYS_fchownat)
        .allow(libc::SYS_fchmodat)
        .allow(libc::SYS_fgetxattr)
        .allow(libc::SYS_fsetxattr);
    rules
}

fn profile_rules() -> SyscallRules {
    let mut rules = SyscallRules::new();
    // The profiler reopens /proc/self/maps output targets with exactly
    // this mode.
    rules.add(
        libc::SYS_openat,
        rule(&[
            MatchAny,
            MatchAny,
            EqualTo((libc::O_RDONLY | libc::O_LARGEFILE | libc::O_CLOEXEC) as u64),
        ]),
    );
    rules
}

fn platform_rules(platform: &str) -> SyscallRules {
    let mut rules = SyscallRules::new();
    match platform {
        "ptrace" => {
            rules
                .allow(libc::SYS_ptrace)
                .allow(libc::SYS_wait4)
                .allow(libc::SYS_kill)
                .add(
                    libc::SYS_clone,
                    rule(&[MaskedEqual(
                        (libc::CLONE_VM | libc::CLONE_FILES) as u64,
                        (libc::CLONE_VM | libc::CLONE_FILES) as u64,
                    )]),
                );
        }
        "kvm" => {
            // KVM device ioctls: bounded by the fd check only; command
            // values are device-defined.
            rules
                .add(libc::SYS_ioctl, rule(&[NonNegativeFd]))
                .allow(libc::SYS_rt_sigtimedwait);
        }
        "systrap" | "sim" => {
            rules
                .allow(libc::SYS_kill)
                .allow(libc::SYS_rt_sigtimedwait)
                .add(
                    libc::SYS_clone,
                    rule(&[MaskedEqual(
                        libc::CLONE_VM as u64,
                        libc::CLONE_VM as u64,
                    )]),
                );
        }
        _ => {}
    }
    rules
}

fn nvproxy_rules() -> SyscallRules {
    let mut rules = SyscallRules::new();
    rules.add(libc::SYS_ioctl, rule(&[NonNegativeFd, MatchAny]));
    rules.allow(libc::SYS_openat);
    rules
}

fn tpuproxy_rules() -> SyscallRules {
    let mut rules = SyscallRules::new();
    rules.add(libc::SYS_ioctl, rule(&[NonNegativeFd, MatchAny]));
    rules
}

/// Inputs that decide the final allowlist.
pub struct PolicyOpts<'a> {
    pub config: &'a Config,
    pub controller_fd: RawFd,
}

/// Assembles the complete rule table for a sandbox process.
pub fn assemble(opts: &PolicyOpts) -> SyscallRules {
    let conf = opts.config;
    let mut rules = default_rules();
    rules.merge(&platform_rules(&conf.platform));
    rules.merge(&control_server_rules(opts.controller_fd));
    if conf.network == NetworkType::Host {
        rules.merge(&host_network_rules(conf.net_raw));
    }
    if conf.directfs {
        rules.merge(&direct_fs_rules());
    }
    if conf.profile {
        rules.merge(&profile_rules());
    }
    if conf.nvproxy {
        rules.merge(&nvproxy_rules());
    }
    if conf.tpuproxy {
        rules.merge(&tpuproxy_rules());
    }
    rules
}

/// Picks the default action for syscalls outside the table.
///
/// Kernels before 4.8 evaluate seccomp before ptrace emulation, so a
/// ptrace-style platform's emulated syscalls would hit the default
/// action; those kernels get ALLOW and rely on the tracer, everything
/// newer gets KILL_THREAD.
pub fn default_action_for_kernel(release: &str) -> u32 {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    if (major, minor) < (4, 8) {
        super::bpf::SECCOMP_RET_ALLOW
    } else {
        super::bpf::SECCOMP_RET_KILL_THREAD
    }
}

/// Probes the running kernel and picks the default action.
pub fn probe_default_action() -> u32 {
    match nix::sys::utsname::uname() {
        Ok(name) => default_action_for_kernel(&name.release().to_string_lossy()),
        Err(err) => {
            log::warn!("uname failed ({err}); assuming a modern kernel");
            super::bpf::SECCOMP_RET_KILL_THREAD
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seccomp::{
        bpf::{evaluate, SeccompData, SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_THREAD},
        compile, AUDIT_ARCH_X86_64,
    };

    fn test_config() -> Config {
        Config {
            platform: "systrap".to_string(),
            ..Default::default()
        }
    }

    fn passing_args(rules: &[Rule]) -> Option<[u64; 6]> {
        if rules.is_empty() {
            return Some([0; 6]);
        }
        // Synthesize arguments satisfying the first rule.
        let mut args = [0u64; 6];
        for (i, matcher) in rules[0].0.iter().enumerate() {
            args[i] = match matcher {
                MatchAny => 0,
                EqualTo(v) => *v,
                MaskedEqual(_, v) => *v,
                GreaterThan(v) => v.checked_add(1)?,
                NonNegativeFd => 3,
            };
        }
        Some(args)
    }

    /// Every syscall in the table evaluates to ALLOW under a passing
    /// rule; every syscall not in the table evaluates to the default
    /// action.
    #[test]
    fn allowlist_is_exact() {
        let config = test_config();
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 5,
        });
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();

        for (sysno, rule_list) in rules.iter() {
            let args = passing_args(rule_list).expect("rule should be satisfiable");
            let data = SeccompData {
                nr: sysno as u32,
                arch: AUDIT_ARCH_X86_64,
                instruction_pointer: 0,
                args,
            };
            assert_eq!(
                evaluate(&program, &data),
                SECCOMP_RET_ALLOW,
                "syscall {sysno} should be allowed"
            );
        }

        for sysno in 0..512u32 {
            if rules.contains(sysno as i64) {
                continue;
            }
            let data = SeccompData {
                nr: sysno,
                arch: AUDIT_ARCH_X86_64,
                instruction_pointer: 0,
                args: [0; 6],
            };
            assert_eq!(
                evaluate(&program, &data),
                SECCOMP_RET_KILL_THREAD,
                "syscall {sysno} should hit the default action"
            );
        }
    }

    /// The TIOCSTI/FIONREAD split: ioctl is constrained to a command
    /// whitelist, so terminal injection dies while readiness queries
    /// pass.
    #[test]
    fn ioctl_command_whitelist() {
        let config = test_config();
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 5,
        });
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();

        let ioctl = |request: u64| SeccompData {
            nr: libc::SYS_ioctl as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args: [3, request, 0, 0, 0, 0],
        };
        assert_eq!(
            evaluate(&program, &ioctl(libc::FIONREAD as u64)),
            SECCOMP_RET_ALLOW
        );
        assert_eq!(
            evaluate(&program, &ioctl(libc::TIOCSTI)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn control_fd_subpolicy_is_fd_scoped() {
        let config = test_config();
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 7,
        });
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();

        let accept_on = |fd: u64| SeccompData {
            nr: libc::SYS_accept4 as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args: [fd, 0, 0, 0, 0, 0],
        };
        assert_eq!(evaluate(&program, &accept_on(7)), SECCOMP_RET_ALLOW);
        assert_eq!(evaluate(&program, &accept_on(8)), SECCOMP_RET_KILL_THREAD);

        // listen is allowed only with the controller fd and backlog 16.
        let listen = |fd: u64, backlog: u64| SeccompData {
            nr: libc::SYS_listen as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args: [fd, backlog, 0, 0, 0, 0],
        };
        assert_eq!(evaluate(&program, &listen(7, 16)), SECCOMP_RET_ALLOW);
        assert_eq!(
            evaluate(&program, &listen(7, 128)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn host_network_toggles_socket_family() {
        let mut config = test_config();
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 5,
        });
        assert!(!rules.contains(libc::SYS_socket));

        config.network = NetworkType::Host;
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 5,
        });
        assert!(rules.contains(libc::SYS_socket));

        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let socket = |family: u64, ty: u64| SeccompData {
            nr: libc::SYS_socket as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args: [family, ty, 0, 0, 0, 0],
        };
        assert_eq!(
            evaluate(&program, &socket(libc::AF_INET as u64, 0)),
            SECCOMP_RET_ALLOW
        );
        // Raw sockets stay off until net-raw is set.
        assert_eq!(
            evaluate(
                &program,
                &socket(
                    libc::AF_PACKET as u64,
                    (libc::SOCK_RAW | libc::SOCK_CLOEXEC) as u64
                )
            ),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn profile_adds_exact_openat_mode() {
        let mut config = test_config();
        config.profile = true;
        let rules = assemble(&PolicyOpts {
            config: &config,
            controller_fd: 5,
        });
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let openat = |mode: u64| SeccompData {
            nr: libc::SYS_openat as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args: [0, 0, mode, 0, 0, 0],
        };
        let wanted = (libc::O_RDONLY | libc::O_LARGEFILE | libc::O_CLOEXEC) as u64;
        assert_eq!(evaluate(&program, &openat(wanted)), SECCOMP_RET_ALLOW);
        assert_eq!(
            evaluate(&program, &openat(libc::O_RDWR as u64)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn kernel_version_picks_default_action() {
        use crate::seccomp::bpf::{SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_THREAD};
        assert_eq!(default_action_for_kernel("4.4.0-31"), SECCOMP_RET_ALLOW);
        assert_eq!(default_action_for_kernel("3.19.8"), SECCOMP_RET_ALLOW);
        assert_eq!(
            default_action_for_kernel("4.8.12"),
            SECCOMP_RET_KILL_THREAD
        );
        assert_eq!(
            default_action_for_kernel("6.1.0-sandkern"),
            SECCOMP_RET_KILL_THREAD
        );
    }
}

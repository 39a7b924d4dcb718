//! Host seccomp policy: a rule DSL compiled to classic BPF.
//!
//! The filter is authored from per-syscall rule lists, compiled, and
//! installed before any untrusted code runs in the sandbox process.

pub mod bpf;
mod policy;

pub use policy::{
    assemble, control_server_rules, default_action_for_kernel, default_rules,
    probe_default_action, PolicyOpts,
};

use bpf::{
    off_arg_hi, off_arg_lo, Assembler, BpfError, SockFilter, OFF_ARCH, OFF_NR,
    SECCOMP_RET_ALLOW, SECCOMP_RET_KILL_PROCESS,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// AUDIT_ARCH_X86_64.
pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;

#[derive(Error, Debug)]
pub enum SeccompError {
    #[error("bpf assembly error: {0}")]
    Bpf(#[from] BpfError),

    #[error("prctl(PR_SET_NO_NEW_PRIVS) failed: {0}")]
    NoNewPrivs(std::io::Error),

    #[error("installing seccomp filter failed: {0}")]
    Install(std::io::Error),
}

/// One argument matcher in a rule.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArgMatcher {
    MatchAny,
    EqualTo(u64),
    MaskedEqual(u64, u64),
    GreaterThan(u64),
    /// The argument must be a plausible file descriptor: a non-negative
    /// 32-bit value.
    NonNegativeFd,
}

/// A rule: six argument matchers, all of which must pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Rule(pub [ArgMatcher; 6]);

impl Rule {
    pub fn any() -> Rule {
        Rule([ArgMatcher::MatchAny; 6])
    }
}

/// Builds a rule from a prefix of matchers; the rest match anything.
pub fn rule(matchers: &[ArgMatcher]) -> Rule {
    assert!(matchers.len() <= 6, "a rule has at most six arguments");
    let mut all = [ArgMatcher::MatchAny; 6];
    all[..matchers.len()].copy_from_slice(matchers);
    Rule(all)
}

/// The rule table: syscall number to rule list. An empty list allows
/// the syscall unconditionally.
#[derive(Debug, Default, Clone)]
pub struct SyscallRules {
    rules: BTreeMap<u64, Vec<Rule>>,
}

impl SyscallRules {
    pub fn new() -> SyscallRules {
        SyscallRules::default()
    }

    /// Allows a syscall with no argument constraints.
    pub fn allow(&mut self, sysno: i64) -> &mut Self {
        self.rules.entry(sysno as u64).or_default();
        self
    }

    /// Adds one rule for a syscall. The syscall is allowed if any of its
    /// rules pass.
    pub fn add(&mut self, sysno: i64, rule: Rule) -> &mut Self {
        self.rules.entry(sysno as u64).or_default().push(rule);
        self
    }

    /// Takes the union of two tables. An unconditional allow on either
    /// side wins over argument constraints.
    pub fn merge(&mut self, other: &SyscallRules) {
        for (sysno, rules) in &other.rules {
            match self.rules.get_mut(sysno) {
                Some(existing) => {
                    if existing.is_empty() || rules.is_empty() {
                        existing.clear();
                    } else {
                        existing.extend(rules.iter().copied());
                    }
                }
                None => {
                    self.rules.insert(*sysno, rules.clone());
                }
            }
        }
    }

    pub fn contains(&self, sysno: i64) -> bool {
        self.rules.contains_key(&(sysno as u64))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Vec<Rule>)> {
        self.rules.iter().map(|(sysno, rules)| (*sysno, rules))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn emit_matcher(asm: &mut Assembler, index: usize, matcher: &ArgMatcher, fail: bpf::Label) {
    match matcher {
        ArgMatcher::MatchAny => {}
        ArgMatcher::EqualTo(value) => {
            asm.load_abs(off_arg_lo(index));
            asm.jeq_or_goto(*value as u32, fail);
            asm.load_abs(off_arg_hi(index));
            asm.jeq_or_goto((*value >> 32) as u32, fail);
        }
        ArgMatcher::MaskedEqual(mask, value) => {
            asm.load_abs(off_arg_lo(index));
            asm.and_k(*mask as u32);
            asm.jeq_or_goto((*value & *mask) as u32, fail);
            asm.load_abs(off_arg_hi(index));
            asm.and_k((*mask >> 32) as u32);
            asm.jeq_or_goto(((*value & *mask) >> 32) as u32, fail);
        }
        ArgMatcher::GreaterThan(value) => {
            let ok = asm.new_label();
            asm.load_abs(off_arg_hi(index));
            asm.jgt_goto((*value >> 32) as u32, ok);
            asm.jeq_or_goto((*value >> 32) as u32, fail);
            asm.load_abs(off_arg_lo(index));
            asm.jgt_or_goto(*value as u32, fail);
            asm.bind(ok);
        }
        ArgMatcher::NonNegativeFd => {
            asm.load_abs(off_arg_lo(index));
            asm.jset_goto(0x8000_0000, fail);
            asm.load_abs(off_arg_hi(index));
            asm.jeq_or_goto(0, fail);
        }
    }
}

/// Compiles a rule table into a BPF program with the given default
/// action for syscalls outside the table.
pub fn compile(rules: &SyscallRules, default_action: u32) -> Result<Vec<SockFilter>, SeccompError> {
    let mut asm = Assembler::new();
    let bad_arch = asm.new_label();
    let default_label = asm.new_label();

    asm.load_abs(OFF_ARCH);
    asm.jeq_or_goto(AUDIT_ARCH_X86_64, bad_arch);
    asm.load_abs(OFF_NR);

    for (sysno, rule_list) in rules.iter() {
        let next_syscall = asm.new_label();
        asm.jeq_or_goto(sysno as u32, next_syscall);
        if rule_list.is_empty() {
            asm.ret(SECCOMP_RET_ALLOW);
        } else {
            for rule in rule_list {
                let next_rule = asm.new_label();
                for (index, matcher) in rule.0.iter().enumerate() {
                    emit_matcher(&mut asm, index, matcher, next_rule);
                }
                asm.ret(SECCOMP_RET_ALLOW);
                asm.bind(next_rule);
            }
            asm.goto(default_label);
        }
        asm.bind(next_syscall);
    }

    asm.bind(default_label);
    asm.ret(default_action);
    asm.bind(bad_arch);
    asm.ret(SECCOMP_RET_KILL_PROCESS);
    Ok(asm.assemble()?)
}

/// Installs a compiled filter on the calling process. Requires
/// no_new_privs, which is set here.
pub fn install(program: &[SockFilter]) -> Result<(), SeccompError> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(SeccompError::NoNewPrivs(std::io::Error::last_os_error()));
    }
    let mut filters: Vec<libc::sock_filter> = program
        .iter()
        .map(|f| libc::sock_filter {
            code: f.code,
            jt: f.jt,
            jf: f.jf,
            k: f.k,
        })
        .collect();
    let prog = libc::sock_fprog {
        len: filters.len() as u16,
        filter: filters.as_mut_ptr(),
    };
    let rc = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_FILTER,
            &prog as *const libc::sock_fprog,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(SeccompError::Install(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpf::{evaluate, SeccompData, SECCOMP_RET_KILL_THREAD};

    fn data(nr: i64, args: [u64; 6]) -> SeccompData {
        SeccompData {
            nr: nr as u32,
            arch: AUDIT_ARCH_X86_64,
            instruction_pointer: 0,
            args,
        }
    }

    #[test]
    fn allowed_syscalls_allow_and_others_default() {
        let mut rules = SyscallRules::new();
        rules.allow(libc::SYS_close);
        rules.add(
            libc::SYS_dup3,
            rule(&[
                ArgMatcher::MatchAny,
                ArgMatcher::MatchAny,
                ArgMatcher::EqualTo(libc::O_CLOEXEC as u64),
            ]),
        );
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();

        // Every syscall in the table evaluates to ALLOW under a
        // passing rule, and everything else hits the default action.
        assert_eq!(
            evaluate(&program, &data(libc::SYS_close, [0; 6])),
            SECCOMP_RET_ALLOW
        );
        let mut dup3 = [0u64; 6];
        dup3[2] = libc::O_CLOEXEC as u64;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_dup3, dup3)),
            SECCOMP_RET_ALLOW
        );
        dup3[2] = 0;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_dup3, dup3)),
            SECCOMP_RET_KILL_THREAD
        );
        assert_eq!(
            evaluate(&program, &data(libc::SYS_ptrace, [0; 6])),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn foreign_arch_is_killed() {
        let mut rules = SyscallRules::new();
        rules.allow(libc::SYS_close);
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let mut d = data(libc::SYS_close, [0; 6]);
        d.arch = 0x4000_0003; // AUDIT_ARCH_I386
        assert_eq!(evaluate(&program, &d), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn masked_equal_matches_under_mask() {
        let mut rules = SyscallRules::new();
        rules.add(
            libc::SYS_mmap,
            rule(&[
                ArgMatcher::MatchAny,
                ArgMatcher::MatchAny,
                ArgMatcher::MatchAny,
                ArgMatcher::MaskedEqual(0xff, libc::MAP_PRIVATE as u64),
            ]),
        );
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let mut args = [0u64; 6];
        // High bits outside the mask are ignored.
        args[3] = libc::MAP_PRIVATE as u64 | 0x100;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_mmap, args)),
            SECCOMP_RET_ALLOW
        );
        args[3] = libc::MAP_SHARED as u64;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_mmap, args)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn greater_than_is_64_bit() {
        let mut rules = SyscallRules::new();
        rules.add(
            libc::SYS_write,
            rule(&[ArgMatcher::MatchAny, ArgMatcher::GreaterThan(0xffff_ffff)]),
        );
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let mut args = [0u64; 6];
        args[1] = 0x1_0000_0000;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_write, args)),
            SECCOMP_RET_ALLOW
        );
        args[1] = 0xffff_ffff;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_write, args)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn non_negative_fd_check() {
        let mut rules = SyscallRules::new();
        rules.add(libc::SYS_fsync, rule(&[ArgMatcher::NonNegativeFd]));
        let program = compile(&rules, SECCOMP_RET_KILL_THREAD).unwrap();
        let mut args = [0u64; 6];
        args[0] = 3;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_fsync, args)),
            SECCOMP_RET_ALLOW
        );
        args[0] = (-1i32 as u32) as u64;
        assert_eq!(
            evaluate(&program, &data(libc::SYS_fsync, args)),
            SECCOMP_RET_KILL_THREAD
        );
    }

    #[test]
    fn merge_prefers_unconditional_allow() {
        let mut a = SyscallRules::new();
        a.add(libc::SYS_ioctl, rule(&[ArgMatcher::EqualTo(1)]));
        let mut b = SyscallRules::new();
        b.allow(libc::SYS_ioctl);
        a.merge(&b);
        let program = compile(&a, SECCOMP_RET_KILL_THREAD).unwrap();
        assert_eq!(
            evaluate(&program, &data(libc::SYS_ioctl, [9, 9, 9, 9, 9, 9])),
            SECCOMP_RET_ALLOW
        );
    }
}

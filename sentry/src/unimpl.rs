//! Reporting for syscalls the sentry does not implement.
//!
//! Every unimplemented syscall produces one event the first time it is
//! seen; repeats are dropped. Multiplexer syscalls (ioctl, prctl, futex,
//! the sockopt pair, semctl) are keyed by their command argument as well,
//! since "ioctl" alone says nothing about what the application wanted.

use std::{
    collections::HashSet,
    sync::Mutex,
};

const FUTEX_CMD_MASK: u64 = !(128 | 256); // strip PRIVATE_FLAG and CLOCK_REALTIME

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
enum EventKey {
    Syscall(u64),
    Command { sysno: u64, cmd: u64 },
}

fn event_key(sysno: u64, args: &[u64; 6]) -> EventKey {
    match sysno as i64 {
        libc::SYS_ioctl => EventKey::Command {
            sysno,
            cmd: args[1],
        },
        libc::SYS_prctl => EventKey::Command {
            sysno,
            cmd: args[0],
        },
        libc::SYS_futex => EventKey::Command {
            sysno,
            cmd: args[1] & FUTEX_CMD_MASK,
        },
        libc::SYS_getsockopt | libc::SYS_setsockopt => EventKey::Command {
            sysno,
            cmd: args[2],
        },
        libc::SYS_semctl => EventKey::Command {
            sysno,
            cmd: args[2],
        },
        _ => EventKey::Syscall(sysno),
    }
}

/// An emitted unimplemented-syscall event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnimplementedSyscall {
    pub tid: i32,
    pub sysno: u64,
    pub args: [u64; 6],
}

#[derive(Default)]
struct Registry {
    reported: HashSet<EventKey>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

/// Records an unimplemented syscall, emitting at most one event per key.
/// Returns the event when this occurrence is the first of its kind.
pub fn record(tid: i32, sysno: u64, args: &[u64; 6]) -> Option<UnimplementedSyscall> {
    let key = event_key(sysno, args);
    let mut registry = REGISTRY.lock().unwrap();
    if !registry.reported.insert(key) {
        return None;
    }
    let event = UnimplementedSyscall {
        tid,
        sysno,
        args: *args,
    };
    log::warn!(
        "unimplemented syscall {} (args {:#x?}) from tid {}",
        sysno,
        args,
        tid
    );
    Some(event)
}

#[cfg(test)]
pub fn reset_for_test() {
    REGISTRY.lock().unwrap().reported.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_by_syscall_number() {
        reset_for_test();
        let args = [0u64; 6];
        assert!(record(1, 10_000, &args).is_some());
        assert!(record(2, 10_000, &args).is_none());
        assert!(record(1, 10_001, &args).is_some());
    }

    #[test]
    fn ioctl_keyed_by_command() {
        reset_for_test();
        let sysno = libc::SYS_ioctl as u64;
        let mut args = [0u64; 6];
        args[1] = 0x5401; // TCGETS
        assert!(record(1, sysno, &args).is_some());
        assert!(record(1, sysno, &args).is_none());
        args[1] = 0x5402; // TCSETS
        assert!(record(1, sysno, &args).is_some());
    }

    #[test]
    fn futex_private_flag_ignored_in_key() {
        reset_for_test();
        let sysno = libc::SYS_futex as u64;
        let mut args = [0u64; 6];
        args[1] = 0; // FUTEX_WAIT
        assert!(record(1, sysno, &args).is_some());
        args[1] = 128; // FUTEX_WAIT | FUTEX_PRIVATE_FLAG
        assert!(record(1, sysno, &args).is_none());
    }
}

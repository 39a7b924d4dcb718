//! The syscall table: Linux syscall numbers to kernel operations.
//!
//! Each entry declares its name and the shape of its six arguments; the
//! dispatcher types the raw registers once, per the declared shapes, so
//! handlers never cast registers ad hoc. Unknown syscalls emit one
//! deduplicated event and return ENOSYS.

mod table_amd64;

use crate::{
    arch::{ArgShape, SyscallArgument},
    kernel::{Kernel, Task, TaskId},
    seccheck, unimpl,
};
use std::{collections::HashMap, sync::Arc};

/// What the dispatcher does after a syscall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Write this value to the return register and keep running.
    Return(i64),
    /// The task exited; the executor loop stops.
    Exited,
}

/// Wraps a `Result` into the Linux convention of negated errnos.
pub fn ret(result: Result<u64, i32>) -> Outcome {
    match result {
        Ok(value) => Outcome::Return(value as i64),
        Err(errno) => Outcome::Return(-(errno as i64)),
    }
}

pub struct SyscallContext<'a> {
    pub kernel: &'a Kernel,
    pub task_id: TaskId,
    pub task: &'a Arc<Task>,
}

pub type Handler = fn(&SyscallContext, &[SyscallArgument; 6]) -> Outcome;

pub struct SyscallEntry {
    pub name: &'static str,
    pub shapes: [ArgShape; 6],
    pub handler: Handler,
}

pub struct SyscallTable {
    entries: HashMap<u64, SyscallEntry>,
}

impl SyscallTable {
    /// The amd64 table. Panics on a malformed table; that is a build
    /// defect, not an input error.
    pub fn amd64() -> SyscallTable {
        let mut entries = HashMap::new();
        for (sysno, entry) in table_amd64::entries() {
            assert!(!entry.name.is_empty(), "unnamed syscall {sysno}");
            assert!(
                entries.insert(sysno, entry).is_none(),
                "syscall {sysno} registered twice"
            );
        }
        SyscallTable { entries }
    }

    pub fn lookup(&self, sysno: u64) -> Option<&SyscallEntry> {
        self.entries.get(&sysno)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Services the syscall currently sitting in the task's registers.
pub fn dispatch(
    kernel: &Kernel,
    task_id: TaskId,
    task: &Arc<Task>,
    table: &SyscallTable,
) -> Outcome {
    let (sysno, raw) = task.with_arch(|arch| (arch.syscall_number(), arch.syscall_args_raw()));
    let entry = match table.lookup(sysno) {
        Some(entry) => entry,
        None => {
            let tid = kernel.local_tid_of(task_id).unwrap_or(0);
            if let Some(event) = unimpl::record(tid, sysno, &raw) {
                if seccheck::global().enabled(seccheck::Point::UnimplementedSyscall) {
                    seccheck::global().emit(
                        seccheck::Point::UnimplementedSyscall,
                        serde_json::json!({
                            "tid": event.tid,
                            "sysno": event.sysno,
                            "args": event.args,
                        }),
                    );
                }
            }
            return Outcome::Return(-(libc::ENOSYS as i64));
        }
    };

    let mut args = [SyscallArgument::Uint(0); 6];
    for (i, shape) in entry.shapes.iter().enumerate() {
        args[i] = shape.apply(raw[i]);
    }
    log::trace!("syscall {} ({})", entry.name, sysno);
    let ctx = SyscallContext {
        kernel,
        task_id,
        task,
    };
    (entry.handler)(&ctx, &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_builds_and_knows_core_syscalls() {
        let table = SyscallTable::amd64();
        assert!(!table.is_empty());
        for sysno in [0u64, 1, 9, 11, 12, 39, 231] {
            assert!(table.lookup(sysno).is_some(), "missing syscall {sysno}");
        }
        assert!(table.lookup(10_000).is_none());
    }

    #[test]
    fn entry_shapes_are_total() {
        let table = SyscallTable::amd64();
        // mmap's shapes: addr, len, prot, flags, fd, offset.
        let mmap = table.lookup(9).unwrap();
        assert_eq!(mmap.name, "mmap");
        assert_eq!(mmap.shapes[4], ArgShape::Fd);
    }
}

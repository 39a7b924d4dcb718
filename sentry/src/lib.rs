//! The sentry: a user-space guest kernel.
//!
//! The sentry services an unmodified Linux application's system calls
//! without letting them reach the host kernel. A Platform switches
//! application threads between guest-user and guest-supervisor mode; the
//! Kernel models processes, threads and PID namespaces; the MemoryManager
//! backs every address space with pages from a single MemoryFile; the VFS
//! names files across a forest of mounted filesystem implementations.
//!
//! Everything here runs behind the host seccomp filter the supervisor
//! installs at boot, so the host attack surface is the filter's allowlist
//! rather than the full syscall table.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sandkern only works on linux or android");

#[cfg(not(target_arch = "x86_64"))]
compile_error!("sandkern currently only supports x86_64");

#[macro_use]
extern crate lazy_static;

pub mod arch;
pub mod control;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod platform;
pub mod seccheck;
pub mod state;
pub mod syscalls;
pub mod unimpl;
pub mod usage;
pub mod vfs;
pub mod watchdog;

mod arena;

pub use arena::{Arena, Handle};

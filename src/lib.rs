//! sandkern: an application-kernel sandbox runtime.
//!
//! This crate is the host side: it spawns the sandbox process in fresh
//! namespaces, donates the descriptors the sentry needs, authors the
//! host seccomp policy, and drives every lifecycle operation over the
//! per-sandbox control socket. The guest kernel itself lives in
//! `sandkern-sentry`; the wire protocol in `sandkern-protocol`.

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("sandkern only works on linux or android");

#[cfg(not(target_arch = "x86_64"))]
compile_error!("sandkern currently only supports x86_64");

#[macro_use]
extern crate serde;

pub mod cgroup;
pub mod config;
pub mod sandbox;
pub mod seccomp;

mod errors;

pub use crate::{
    config::Config,
    errors::{ErrorKind, SandboxError},
    sandbox::Sandbox,
};

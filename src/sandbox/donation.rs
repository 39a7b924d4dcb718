//! FD donation: collecting the descriptors a sandbox process inherits.
//!
//! Donated descriptors are renumbered sequentially from 3 in the child
//! and named on the command line (`--log-fd=3`). Order of donation is
//! therefore part of the boot contract.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::Path,
};

/// The first descriptor available for donations; 0-2 are stdio.
pub const FIRST_DONATED_FD: RawFd = 3;

/// Collects donations until the spawn transfers them.
#[derive(Default)]
pub struct Agency {
    donations: Vec<(String, OwnedFd)>,
}

/// The materialized donation set: one flag per descriptor plus the
/// dup2 plan the child executes before exec.
#[derive(Debug)]
pub struct TransferPlan {
    pub flags: Vec<String>,
    /// (inherited fd, target fd) pairs, target numbering from 3.
    pub mappings: Vec<(RawFd, RawFd)>,
}

impl Agency {
    pub fn new() -> Agency {
        Agency::default()
    }

    /// Donates one descriptor under `name`.
    pub fn donate(&mut self, name: &str, fd: OwnedFd) {
        self.donations.push((name.to_string(), fd));
    }

    pub fn donate_file(&mut self, name: &str, file: File) {
        self.donate(name, OwnedFd::from(file));
    }

    /// Donates several descriptors under one repeated flag (io-fds,
    /// stdio-fds, sink-fds).
    pub fn donate_all(&mut self, name: &str, fds: impl IntoIterator<Item = OwnedFd>) {
        for fd in fds {
            self.donate(name, fd);
        }
    }

    /// Opens `path` and donates it; a None path donates nothing.
    pub fn open_and_donate(
        &mut self,
        name: &str,
        path: Option<&Path>,
        options: &OpenOptions,
    ) -> io::Result<()> {
        let path = match path {
            Some(path) => path,
            None => return Ok(()),
        };
        let file = options.open(path)?;
        self.donate_file(name, file);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.donations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.donations.is_empty()
    }

    /// The target fd the next donation would receive.
    pub fn next_fd(&self) -> RawFd {
        FIRST_DONATED_FD + self.donations.len() as RawFd
    }

    /// Builds the flags and the dup2 plan. The Agency keeps ownership of
    /// the descriptors; they must outlive the spawn.
    pub fn plan(&self) -> TransferPlan {
        let mut flags = Vec::with_capacity(self.donations.len());
        let mut mappings = Vec::with_capacity(self.donations.len());
        for (i, (name, fd)) in self.donations.iter().enumerate() {
            let target = FIRST_DONATED_FD + i as RawFd;
            flags.push(format!("--{name}={target}"));
            mappings.push((fd.as_raw_fd(), target));
        }
        TransferPlan { flags, mappings }
    }

    /// Logs what is being donated, mirroring the flag order.
    pub fn log(&self) {
        for flag in self.plan().flags {
            log::debug!("donating {flag}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd() -> OwnedFd {
        OwnedFd::from(tempfile::tempfile().unwrap())
    }

    #[test]
    fn sequential_numbering_from_three() {
        let mut agency = Agency::new();
        agency.donate("log-fd", fd());
        agency.donate("controller-fd", fd());
        agency.donate_all("io-fds", [fd(), fd()]);
        let plan = agency.plan();
        assert_eq!(
            plan.flags,
            vec![
                "--log-fd=3",
                "--controller-fd=4",
                "--io-fds=5",
                "--io-fds=6",
            ]
        );
        let targets: Vec<RawFd> = plan.mappings.iter().map(|(_, t)| *t).collect();
        assert_eq!(targets, vec![3, 4, 5, 6]);
        assert_eq!(agency.next_fd(), 7);
    }

    #[test]
    fn none_path_is_skipped() {
        let mut agency = Agency::new();
        agency
            .open_and_donate("user-log-fd", None, OpenOptions::new().read(true))
            .unwrap();
        assert!(agency.is_empty());
    }
}

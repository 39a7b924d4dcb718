//! Platform abstraction: how application code actually runs.
//!
//! A Platform owns address spaces and the mechanism for switching a host
//! thread between sentry supervisor mode and application user mode. The
//! hardware backends (ptrace, kvm, systrap) live outside this crate;
//! their names are registered here as contract entries, and the `sim`
//! platform provides a fully in-process implementation for tests and the
//! boot smoke path.

use crate::{
    arch::{ArchContext, SignalInfo},
    mm::{AccessType, FileRange},
};
use std::{
    collections::{HashMap, VecDeque},
    fs::File,
    path::Path,
    sync::{Arc, Mutex},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("unknown platform {0:?}")]
    Unknown(String),

    #[error("platform {0:?} is not built into this binary")]
    NotBuiltIn(&'static str),

    #[error("opening platform device: {0}")]
    Device(#[from] std::io::Error),

    #[error("address space limit reached")]
    NoAddressSpaces,
}

/// Properties the supervisor must know before spawning the sandbox.
#[derive(Debug, Default, Copy, Clone)]
pub struct Requirements {
    /// The platform exposes host-owned threads, so the sandbox must stay
    /// in the host PID namespace.
    pub requires_current_pidns: bool,
    /// The platform maintains its own page tables rather than host
    /// mappings. Mutually exclusive with device proxying.
    pub owns_page_tables: bool,
}

/// Why control returned from an application switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchResult {
    /// The application faulted at `addr` wanting `access`.
    Fault { addr: u64, access: AccessType },
    /// A host signal interrupted execution.
    Interrupt { signo: i32, info: SignalInfo },
    /// The application executed a syscall; arguments are in the context.
    Syscall,
    /// The address space is gone; the task must exit.
    Exit,
}

/// One application address space.
pub trait AddressSpace: Send + Sync {
    /// Maps `fr` of the MemoryFile at `addr` with `perms`. `precommit`
    /// hints that the pages should be faulted in eagerly.
    fn map_file(
        &self,
        addr: u64,
        fr: FileRange,
        perms: AccessType,
        precommit: bool,
    ) -> Result<(), PlatformError>;

    fn unmap(&self, addr: u64, length: u64);

    /// Runs the application until it traps back to the sentry. `cpu` is
    /// the executor binding, `ctx` the register state to enter with; on
    /// return `ctx` holds the state at the trap.
    fn switch(&self, cpu: u32, ctx: &mut ArchContext) -> SwitchResult;
}

pub trait Platform: Send + Sync {
    fn name(&self) -> &'static str;
    fn requirements(&self) -> Requirements;
    fn new_address_space(&self) -> Result<Arc<dyn AddressSpace>, PlatformError>;
}

/// Opens the device file a platform needs, if any. `kvm` requires a
/// device; the others run deviceless.
pub fn open_device(name: &str, device_path: Option<&Path>) -> Result<Option<File>, PlatformError> {
    match name {
        "kvm" => {
            let path = device_path.unwrap_or_else(|| Path::new("/dev/kvm"));
            Ok(Some(File::open(path)?))
        }
        _ => Ok(None),
    }
}

/// Resolves a platform by flag name.
pub fn lookup(name: &str) -> Result<Arc<dyn Platform>, PlatformError> {
    match name {
        "sim" => Ok(Arc::new(SimPlatform::default())),
        "ptrace" => Err(PlatformError::NotBuiltIn("ptrace")),
        "systrap" => Err(PlatformError::NotBuiltIn("systrap")),
        "kvm" => Err(PlatformError::NotBuiltIn("kvm")),
        other => Err(PlatformError::Unknown(other.to_string())),
    }
}

/// Requirements for platforms that are contract-only in this binary, so
/// the supervisor can still compute namespace decisions for them.
pub fn requirements_for(name: &str) -> Requirements {
    match name {
        "ptrace" => Requirements {
            requires_current_pidns: true,
            owns_page_tables: false,
        },
        "kvm" => Requirements {
            requires_current_pidns: false,
            owns_page_tables: true,
        },
        _ => Requirements::default(),
    }
}

/// The in-process platform. Mappings are tracked, not installed; switch
/// results are scripted by tests or default to Exit.
#[derive(Default)]
pub struct SimPlatform;

impl Platform for SimPlatform {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn requirements(&self) -> Requirements {
        Requirements::default()
    }

    fn new_address_space(&self) -> Result<Arc<dyn AddressSpace>, PlatformError> {
        Ok(Arc::new(SimAddressSpace::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMapping {
    pub addr: u64,
    pub fr: FileRange,
    pub perms: AccessType,
}

#[derive(Default)]
pub struct SimAddressSpace {
    mappings: Mutex<HashMap<u64, SimMapping>>,
    script: Mutex<VecDeque<SwitchResult>>,
}

impl SimAddressSpace {
    /// Queues the result the next switch call returns.
    pub fn push_switch_result(&self, result: SwitchResult) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn mappings(&self) -> Vec<SimMapping> {
        let mut all: Vec<SimMapping> =
            self.mappings.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|m| m.addr);
        all
    }
}

impl AddressSpace for SimAddressSpace {
    fn map_file(
        &self,
        addr: u64,
        fr: FileRange,
        perms: AccessType,
        _precommit: bool,
    ) -> Result<(), PlatformError> {
        self.mappings
            .lock()
            .unwrap()
            .insert(addr, SimMapping { addr, fr, perms });
        Ok(())
    }

    fn unmap(&self, addr: u64, length: u64) {
        let mut mappings = self.mappings.lock().unwrap();
        mappings.retain(|&start, m| {
            !(start >= addr && start + m.fr.length() <= addr + length)
        });
    }

    fn switch(&self, _cpu: u32, _ctx: &mut ArchContext) -> SwitchResult {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SwitchResult::Exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    #[test]
    fn lookup_contract_entries() {
        assert!(lookup("sim").is_ok());
        assert!(matches!(lookup("ptrace"), Err(PlatformError::NotBuiltIn(_))));
        assert!(matches!(lookup("kvm"), Err(PlatformError::NotBuiltIn(_))));
        assert!(matches!(lookup("bogus"), Err(PlatformError::Unknown(_))));
    }

    #[test]
    fn ptrace_requires_host_pidns() {
        assert!(requirements_for("ptrace").requires_current_pidns);
        assert!(!requirements_for("systrap").requires_current_pidns);
    }

    #[test]
    fn sim_scripted_switches() {
        let space = SimAddressSpace::default();
        space.push_switch_result(SwitchResult::Syscall);
        let mut ctx = ArchContext::new(Arch::Amd64);
        assert_eq!(space.switch(0, &mut ctx), SwitchResult::Syscall);
        assert_eq!(space.switch(0, &mut ctx), SwitchResult::Exit);
    }

    #[test]
    fn sim_mappings_tracked() {
        let space = SimAddressSpace::default();
        space
            .map_file(
                0x1000,
                FileRange::new(0, 0x2000),
                AccessType::READ_WRITE,
                false,
            )
            .unwrap();
        assert_eq!(space.mappings().len(), 1);
        space.unmap(0x1000, 0x2000);
        assert!(space.mappings().is_empty());
    }
}

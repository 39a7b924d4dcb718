//! Architecture-specific application context.
//!
//! An ArchContext owns everything the platform saves and restores around a
//! switch: the register file, FPU state, and TLS base. It also answers
//! architecture questions the rest of the kernel asks, like where mmap
//! regions go and how a signal frame is laid out.

mod amd64;

pub use amd64::{
    Context64, Registers, SignalFrame, AMD64_SYSCALL_INSTR_LEN, FRAME_SIZE, MAX_ADDR_64,
};

use crate::kernel::limits::LimitSet;
use thiserror::Error;

pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

pub fn page_round_down(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Rounds up to the next page boundary; None on overflow.
pub fn page_round_up(addr: u64) -> Option<u64> {
    addr.checked_add(PAGE_MASK).map(|a| a & !PAGE_MASK)
}

#[derive(Error, Debug)]
pub enum ArchError {
    #[error("invalid argument")]
    InvalidArgument,

    #[error("bad register offset")]
    BadRegisterOffset,

    #[error("malformed signal frame")]
    BadSignalFrame,
}

/// Supported architectures.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Arch {
    Amd64,
}

/// Which way the mmap allocator searches by default.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MmapDirection {
    BottomUp,
    TopDown,
}

/// A per-process mmap layout, fixed at exec time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MmapLayout {
    pub min_addr: u64,
    pub max_addr: u64,
    pub bottom_up_base: u64,
    pub top_down_base: u64,
    pub default_direction: MmapDirection,
    pub max_stack_rand: u64,
}

impl MmapLayout {
    /// A layout is usable when its bases sit inside [min, max] and the
    /// range is not inverted.
    pub fn valid(&self) -> bool {
        self.min_addr <= self.max_addr
            && self.min_addr <= self.bottom_up_base
            && self.bottom_up_base <= self.max_addr
            && self.min_addr <= self.top_down_base
            && self.top_down_base <= self.max_addr
    }
}

/// A typed view of one syscall argument. The shape each slot takes is
/// declared by the syscall table entry, never guessed at the call site.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyscallArgument {
    Pointer(u64),
    Int(i64),
    Uint(u64),
    Int32(i32),
    Uint32(u32),
    Fd(i32),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArgShape {
    Pointer,
    Int,
    Uint,
    Int32,
    Uint32,
    Fd,
}

impl ArgShape {
    pub fn apply(&self, raw: u64) -> SyscallArgument {
        match self {
            ArgShape::Pointer => SyscallArgument::Pointer(raw),
            ArgShape::Int => SyscallArgument::Int(raw as i64),
            ArgShape::Uint => SyscallArgument::Uint(raw),
            ArgShape::Int32 => SyscallArgument::Int32(raw as u32 as i32),
            ArgShape::Uint32 => SyscallArgument::Uint32(raw as u32),
            ArgShape::Fd => SyscallArgument::Fd(raw as u32 as i32),
        }
    }
}

impl SyscallArgument {
    pub fn pointer(&self) -> u64 {
        match self {
            SyscallArgument::Pointer(v) => *v,
            other => panic!("argument {other:?} used as pointer"),
        }
    }

    pub fn uint(&self) -> u64 {
        match self {
            SyscallArgument::Uint(v) => *v,
            SyscallArgument::Uint32(v) => *v as u64,
            other => panic!("argument {other:?} used as uint"),
        }
    }

    pub fn int(&self) -> i64 {
        match self {
            SyscallArgument::Int(v) => *v,
            SyscallArgument::Int32(v) => *v as i64,
            other => panic!("argument {other:?} used as int"),
        }
    }

    pub fn fd(&self) -> i32 {
        match self {
            SyscallArgument::Fd(v) => *v,
            other => panic!("argument {other:?} used as fd"),
        }
    }
}

/// A signal alternate stack, the sigaltstack(2) triple.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SignalStack {
    pub addr: u64,
    pub flags: u32,
    pub size: u64,
}

impl SignalStack {
    pub const FLAG_ON_STACK: u32 = 1;
    pub const FLAG_DISABLE: u32 = 2;

    pub fn contains(&self, sp: u64) -> bool {
        self.addr <= sp && sp < self.addr + self.size
    }
}

/// A registered signal handler, the sigaction(2) quadruple.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SigAction {
    pub handler: u64,
    pub flags: u64,
    pub restorer: u64,
    pub mask: u64,
}

impl SigAction {
    pub const FLAG_SIGINFO: u64 = 0x4;
    pub const FLAG_ONSTACK: u64 = 0x0800_0000;
    pub const FLAG_RESTART: u64 = 0x1000_0000;
    pub const FLAG_RESTORER: u64 = 0x0400_0000;
}

/// The fields of siginfo_t the sentry fills in.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SignalInfo {
    pub signo: i32,
    pub errno: i32,
    pub code: i32,
    /// The fault address, child pid, or other code-specific payload.
    pub payload: u64,
}

/// The per-arch context, a tagged variant so new architectures slot in
/// without a trait object in every Task.
#[derive(Debug, Clone)]
pub enum ArchContext {
    Amd64(Context64),
}

impl ArchContext {
    pub fn new(arch: Arch) -> ArchContext {
        match arch {
            Arch::Amd64 => ArchContext::Amd64(Context64::default()),
        }
    }

    pub fn arch(&self) -> Arch {
        match self {
            ArchContext::Amd64(_) => Arch::Amd64,
        }
    }

    pub fn amd64(&self) -> &Context64 {
        match self {
            ArchContext::Amd64(ctx) => ctx,
        }
    }

    pub fn amd64_mut(&mut self) -> &mut Context64 {
        match self {
            ArchContext::Amd64(ctx) => ctx,
        }
    }

    pub fn syscall_number(&self) -> u64 {
        match self {
            ArchContext::Amd64(ctx) => ctx.syscall_number(),
        }
    }

    pub fn syscall_args_raw(&self) -> [u64; 6] {
        match self {
            ArchContext::Amd64(ctx) => ctx.syscall_args_raw(),
        }
    }

    pub fn set_return(&mut self, value: u64) {
        match self {
            ArchContext::Amd64(ctx) => ctx.set_return(value),
        }
    }

    pub fn return_value(&self) -> u64 {
        match self {
            ArchContext::Amd64(ctx) => ctx.return_value(),
        }
    }

    pub fn ip(&self) -> u64 {
        match self {
            ArchContext::Amd64(ctx) => ctx.ip(),
        }
    }

    pub fn set_ip(&mut self, value: u64) {
        match self {
            ArchContext::Amd64(ctx) => ctx.set_ip(value),
        }
    }

    pub fn stack(&self) -> u64 {
        match self {
            ArchContext::Amd64(ctx) => ctx.stack(),
        }
    }

    pub fn set_stack(&mut self, value: u64) {
        match self {
            ArchContext::Amd64(ctx) => ctx.set_stack(value),
        }
    }

    pub fn tls(&self) -> u64 {
        match self {
            ArchContext::Amd64(ctx) => ctx.tls(),
        }
    }

    /// Sets the TLS base. Returns false (and changes nothing) for bases
    /// the architecture cannot install.
    pub fn set_tls(&mut self, value: u64) -> bool {
        match self {
            ArchContext::Amd64(ctx) => ctx.set_tls(value),
        }
    }

    pub fn restart_syscall(&mut self) {
        match self {
            ArchContext::Amd64(ctx) => ctx.restart_syscall(),
        }
    }

    pub fn restart_syscall_with_restart_block(&mut self) {
        match self {
            ArchContext::Amd64(ctx) => ctx.restart_syscall_with_restart_block(),
        }
    }

    pub fn new_mmap_layout(
        &self,
        min: u64,
        max: u64,
        limits: &LimitSet,
    ) -> Result<MmapLayout, ArchError> {
        match self {
            ArchContext::Amd64(ctx) => ctx.new_mmap_layout(min, max, limits),
        }
    }

    pub fn signal_setup(
        &mut self,
        act: &SigAction,
        info: &SignalInfo,
        alt: &SignalStack,
        sigset: u64,
    ) -> Result<SignalFrame, ArchError> {
        match self {
            ArchContext::Amd64(ctx) => ctx.signal_setup(act, info, alt, sigset),
        }
    }

    pub fn signal_restore(
        &mut self,
        frame: &[u8],
    ) -> Result<(u64, SignalStack), ArchError> {
        match self {
            ArchContext::Amd64(ctx) => ctx.signal_restore(frame),
        }
    }

    pub fn ptrace_peek_user(&self, addr: u64) -> Result<u64, ArchError> {
        match self {
            ArchContext::Amd64(ctx) => ctx.ptrace_peek_user(addr),
        }
    }

    pub fn ptrace_poke_user(&mut self, addr: u64, data: u64) -> Result<(), ArchError> {
        match self {
            ArchContext::Amd64(ctx) => ctx.ptrace_poke_user(addr, data),
        }
    }
}

//! AMD64 context: registers, mmap layout, rt signal frames.
//!
//! Layout constants come straight from Linux (arch/x86/mm/mmap.c and
//! ELF_ET_DYN_BASE); the TSAN adjustment keeps TopDownBase inside the
//! range sanitizer runtimes expect.

use super::{
    page_round_down, ArchError, MmapDirection, MmapLayout, PAGE_SIZE, SigAction, SignalInfo,
    SignalStack,
};
use crate::kernel::limits::{LimitSet, INFINITY};
use rand::Rng;

/// TASK_SIZE for a 64-bit process.
pub const MAX_ADDR_64: u64 = (1 << 47) - PAGE_SIZE;

/// Maximum randomization applied to the stack
/// (arch/x86/mm/mmap.c:stack_maxrandom_size).
const MAX_STACK_RAND_64: u64 = 16 << 30;

/// Maximum randomization applied to the mmap layout
/// (arch/x86/mm/mmap.c:arch_mmap_rnd).
const MAX_MMAP_RAND_64: u64 = (1 << 28) * PAGE_SIZE;

/// Minimum gap to leave at the top of the address space for the stack
/// (arch/x86/mm/mmap.c:MIN_GAP).
const MIN_GAP_64: u64 = (128 << 20) + MAX_STACK_RAND_64;

/// Standard position-independent executable base load address
/// (ELF_ET_DYN_BASE).
pub const PREFERRED_PIE_LOAD_ADDR: u64 = MAX_ADDR_64 / 3 * 2;

// TSAN expects top-down allocations in [0x7e8000000000, 0x800000000000);
// prefer a TopDownBase that leaves a sizable gap above its minimum so the
// allocator is unlikely to dip below it.
const PREFERRED_TOP_DOWN_ALLOC_MIN: u64 = 0x7e80_0000_0000;
const PREFERRED_ALLOCATION_GAP: u64 = 128 << 30;
const PREFERRED_TOP_DOWN_BASE_MIN: u64 = PREFERRED_TOP_DOWN_ALLOC_MIN + PREFERRED_ALLOCATION_GAP;

/// The smallest mmap randomization that still counts as randomized when
/// shrinking to stay above PREFERRED_TOP_DOWN_BASE_MIN.
const MIN_MMAP_RAND_64: u64 = (1 << 26) * PAGE_SIZE;

/// Length of the `syscall` instruction, used to rewind for restarts.
pub const AMD64_SYSCALL_INSTR_LEN: u64 = 2;

const SYS_RESTART_SYSCALL: u64 = 219;

/// The user-visible register file, in ptrace user_regs_struct order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

const PTRACE_REGISTERS_COUNT: u64 = 27;
const PTRACE_REGISTERS_SIZE: u64 = PTRACE_REGISTERS_COUNT * 8;

/// Size in bytes of Linux's struct user on amd64.
const USER_STRUCT_SIZE: u64 = 928;

impl Registers {
    fn get_by_index(&self, index: u64) -> u64 {
        match index {
            0 => self.r15,
            1 => self.r14,
            2 => self.r13,
            3 => self.r12,
            4 => self.rbp,
            5 => self.rbx,
            6 => self.r11,
            7 => self.r10,
            8 => self.r9,
            9 => self.r8,
            10 => self.rax,
            11 => self.rcx,
            12 => self.rdx,
            13 => self.rsi,
            14 => self.rdi,
            15 => self.orig_rax,
            16 => self.rip,
            17 => self.cs,
            18 => self.eflags,
            19 => self.rsp,
            20 => self.ss,
            21 => self.fs_base,
            22 => self.gs_base,
            23 => self.ds,
            24 => self.es,
            25 => self.fs,
            26 => self.gs,
            _ => unreachable!("register index out of range"),
        }
    }

    fn set_by_index(&mut self, index: u64, value: u64) {
        match index {
            0 => self.r15 = value,
            1 => self.r14 = value,
            2 => self.r13 = value,
            3 => self.r12 = value,
            4 => self.rbp = value,
            5 => self.rbx = value,
            6 => self.r11 = value,
            7 => self.r10 = value,
            8 => self.r9 = value,
            9 => self.r8 = value,
            10 => self.rax = value,
            11 => self.rcx = value,
            12 => self.rdx = value,
            13 => self.rsi = value,
            14 => self.rdi = value,
            15 => self.orig_rax = value,
            16 => self.rip = value,
            17 => self.cs = value,
            18 => self.eflags = value,
            19 => self.rsp = value,
            20 => self.ss = value,
            21 => self.fs_base = value,
            22 => self.gs_base = value,
            23 => self.ds = value,
            24 => self.es = value,
            25 => self.fs = value,
            26 => self.gs = value,
            _ => unreachable!("register index out of range"),
        }
    }
}

/// Legacy fxsave area; enough for applications that never touch AVX.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuState {
    pub bytes: Vec<u8>,
}

const FPU_STATE_SIZE: usize = 512;

impl Default for FpuState {
    fn default() -> Self {
        let mut bytes = vec![0u8; FPU_STATE_SIZE];
        // Initial FCW and MXCSR per the SysV ABI.
        bytes[0..2].copy_from_slice(&0x037fu16.to_le_bytes());
        bytes[24..28].copy_from_slice(&0x1f80u32.to_le_bytes());
        FpuState { bytes }
    }
}

/// An AMD64 application context.
#[derive(Debug, Default, Clone)]
pub struct Context64 {
    pub regs: Registers,
    pub fpu: FpuState,
}

impl Context64 {
    pub fn syscall_number(&self) -> u64 {
        self.regs.orig_rax
    }

    /// The six syscall arguments in the amd64 calling convention.
    pub fn syscall_args_raw(&self) -> [u64; 6] {
        [
            self.regs.rdi,
            self.regs.rsi,
            self.regs.rdx,
            self.regs.r10,
            self.regs.r8,
            self.regs.r9,
        ]
    }

    pub fn return_value(&self) -> u64 {
        self.regs.rax
    }

    pub fn set_return(&mut self, value: u64) {
        self.regs.rax = value;
    }

    pub fn ip(&self) -> u64 {
        self.regs.rip
    }

    pub fn set_ip(&mut self, value: u64) {
        self.regs.rip = value;
    }

    pub fn stack(&self) -> u64 {
        self.regs.rsp
    }

    pub fn set_stack(&mut self, value: u64) {
        self.regs.rsp = value;
    }

    pub fn tls(&self) -> u64 {
        self.regs.fs_base
    }

    /// Sets the TLS pointer. Returns false if the base is not a valid
    /// user segment base; an invalid base must not crash the sentry.
    pub fn set_tls(&mut self, value: u64) -> bool {
        if !is_valid_segment_base(value) {
            return false;
        }
        self.regs.fs = 0;
        self.regs.fs_base = value;
        true
    }

    /// Rewinds the instruction pointer to re-enter the current syscall.
    pub fn restart_syscall(&mut self) {
        self.regs.rip -= AMD64_SYSCALL_INSTR_LEN;
        self.regs.rax = self.regs.orig_rax;
    }

    /// Like restart_syscall, but re-enters through restart_syscall(2) so
    /// the kernel can consult the restart block.
    pub fn restart_syscall_with_restart_block(&mut self) {
        self.regs.rip -= AMD64_SYSCALL_INSTR_LEN;
        self.regs.rax = SYS_RESTART_SYSCALL;
        self.regs.orig_rax = SYS_RESTART_SYSCALL;
    }

    pub fn new_mmap_layout(
        &self,
        min: u64,
        max: u64,
        limits: &LimitSet,
    ) -> Result<MmapLayout, ArchError> {
        let min = super::page_round_up(min).ok_or(ArchError::InvalidArgument)?;
        let max = page_round_down(max.min(MAX_ADDR_64));
        if min > max {
            return Err(ArchError::InvalidArgument);
        }

        let stack_size = limits.stack.cur;

        // MAX_GAP in Linux.
        let max_gap = max / 6 * 5;
        let gap = stack_size.max(MIN_GAP_64).min(max_gap);
        let default_direction = if stack_size == INFINITY {
            MmapDirection::BottomUp
        } else {
            MmapDirection::TopDown
        };

        let top_down_min = (max - gap).saturating_sub(MAX_MMAP_RAND_64);
        let mut max_rand = MAX_MMAP_RAND_64;
        if top_down_min < PREFERRED_TOP_DOWN_BASE_MIN {
            // Try to keep TopDownBase above the preferred minimum by
            // shrinking the randomization.
            let max_adjust = max_rand - MIN_MMAP_RAND_64;
            let need_adjust = PREFERRED_TOP_DOWN_BASE_MIN - top_down_min;
            if need_adjust <= max_adjust {
                max_rand -= need_adjust;
            }
        }

        let rnd = mmap_rand(max_rand);
        let layout = MmapLayout {
            min_addr: min,
            max_addr: max,
            // TASK_UNMAPPED_BASE in Linux.
            bottom_up_base: page_round_down(max / 3 + rnd).max(min),
            top_down_base: page_round_down((max - gap).saturating_sub(rnd)),
            default_direction,
            // Stack allocations must use the reduced randomization to
            // avoid eating into the gap.
            max_stack_rand: max_rand,
        };
        if !layout.valid() {
            panic!("invalid mmap layout: {layout:?}");
        }
        Ok(layout)
    }

    /// Chooses a load address for a position-independent executable.
    pub fn pie_load_address(&self, layout: &MmapLayout) -> u64 {
        let base = PREFERRED_PIE_LOAD_ADDR;
        let max = base
            .checked_add(MAX_MMAP_RAND_64)
            .unwrap_or_else(|| panic!("preferred PIE load addr {base:#x} too large"));
        let base = if max > layout.max_addr {
            // The preferred address won't fit; fall back to the standard
            // behavior of 2/3 of TopDownBase. TSAN won't like this.
            layout.top_down_base / 3 * 2
        } else {
            base
        };
        base + mmap_rand(MAX_MMAP_RAND_64)
    }

    pub fn ptrace_peek_user(&self, addr: u64) -> Result<u64, ArchError> {
        if addr & 7 != 0 || addr >= USER_STRUCT_SIZE {
            return Err(ArchError::BadRegisterOffset);
        }
        // Only the register area is backed; the rest of struct user reads
        // as zero, matching PTRACE_PEEKUSER on stale fields.
        if addr < PTRACE_REGISTERS_SIZE {
            return Ok(self.regs.get_by_index(addr / 8));
        }
        Ok(0)
    }

    pub fn ptrace_poke_user(&mut self, addr: u64, data: u64) -> Result<(), ArchError> {
        if addr & 7 != 0 || addr >= USER_STRUCT_SIZE {
            return Err(ArchError::BadRegisterOffset);
        }
        if addr < PTRACE_REGISTERS_SIZE {
            self.regs.set_by_index(addr / 8, data);
        }
        Ok(())
    }

    /// Builds an rt signal frame and redirects the context into the
    /// handler. The caller copies `frame.bytes` to `frame.addr` in the
    /// application address space.
    pub fn signal_setup(
        &mut self,
        act: &SigAction,
        info: &SignalInfo,
        alt: &SignalStack,
        sigset: u64,
    ) -> Result<SignalFrame, ArchError> {
        let mut sp = self.regs.rsp;
        let on_alt = act.flags & SigAction::FLAG_ONSTACK != 0
            && alt.flags & SignalStack::FLAG_DISABLE == 0
            && !alt.contains(sp);
        if on_alt {
            sp = alt.addr + alt.size;
        } else {
            // Skip the red zone below the interrupted stack pointer.
            sp = sp.checked_sub(128).ok_or(ArchError::InvalidArgument)?;
        }

        let frame_addr = sp
            .checked_sub(FRAME_SIZE as u64)
            .ok_or(ArchError::InvalidArgument)?
            & !15;
        // Entry rsp must be 8 mod 16 so the handler sees an aligned frame
        // after its implicit return-address push.
        let frame_addr = frame_addr - 8;

        let mut bytes = vec![0u8; FRAME_SIZE];
        put_u64(&mut bytes, RET_OFFSET, act.restorer);
        write_siginfo(&mut bytes[SIGINFO_OFFSET..SIGINFO_OFFSET + SIGINFO_SIZE], info);
        write_ucontext(
            &mut bytes[UCONTEXT_OFFSET..UCONTEXT_OFFSET + UCONTEXT_SIZE],
            self,
            alt,
            sigset,
            frame_addr + FPSTATE_OFFSET as u64,
        );
        bytes[FPSTATE_OFFSET..FPSTATE_OFFSET + FPU_STATE_SIZE]
            .copy_from_slice(&self.fpu.bytes);

        self.regs.rip = act.handler;
        self.regs.rsp = frame_addr;
        self.regs.rdi = info.signo as u64;
        self.regs.rsi = frame_addr + SIGINFO_OFFSET as u64;
        self.regs.rdx = frame_addr + UCONTEXT_OFFSET as u64;
        self.regs.rax = 0;

        Ok(SignalFrame {
            addr: frame_addr,
            bytes,
        })
    }

    /// Parses a frame produced by signal_setup and restores the saved
    /// context. Returns the signal mask and alternate stack to reinstate.
    pub fn signal_restore(&mut self, frame: &[u8]) -> Result<(u64, SignalStack), ArchError> {
        if frame.len() < FRAME_SIZE {
            return Err(ArchError::BadSignalFrame);
        }
        let uc = &frame[UCONTEXT_OFFSET..UCONTEXT_OFFSET + UCONTEXT_SIZE];
        let alt = SignalStack {
            addr: get_u64(uc, UC_STACK),
            flags: get_u64(uc, UC_STACK + 8) as u32,
            size: get_u64(uc, UC_STACK + 16),
        };
        let mc = UC_MCONTEXT;
        let regs = &mut self.regs;
        regs.r8 = get_u64(uc, mc);
        regs.r9 = get_u64(uc, mc + 8);
        regs.r10 = get_u64(uc, mc + 16);
        regs.r11 = get_u64(uc, mc + 24);
        regs.r12 = get_u64(uc, mc + 32);
        regs.r13 = get_u64(uc, mc + 40);
        regs.r14 = get_u64(uc, mc + 48);
        regs.r15 = get_u64(uc, mc + 56);
        regs.rdi = get_u64(uc, mc + 64);
        regs.rsi = get_u64(uc, mc + 72);
        regs.rbp = get_u64(uc, mc + 80);
        regs.rbx = get_u64(uc, mc + 88);
        regs.rdx = get_u64(uc, mc + 96);
        regs.rax = get_u64(uc, mc + 104);
        regs.rcx = get_u64(uc, mc + 112);
        regs.rsp = get_u64(uc, mc + 120);
        regs.rip = get_u64(uc, mc + 128);
        regs.eflags = get_u64(uc, mc + 136);
        self.fpu
            .bytes
            .copy_from_slice(&frame[FPSTATE_OFFSET..FPSTATE_OFFSET + FPU_STATE_SIZE]);
        let mask = get_u64(uc, UC_SIGMASK);
        Ok((mask, alt))
    }
}

/// A built signal frame: the bytes and the address they belong at. The
/// new stack pointer equals `addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalFrame {
    pub addr: u64,
    pub bytes: Vec<u8>,
}

// Frame geometry, low address first: return address, siginfo, ucontext,
// then the 64-byte-aligned fxsave area.
const RET_OFFSET: usize = 0;
const SIGINFO_OFFSET: usize = 8;
const SIGINFO_SIZE: usize = 128;
const UCONTEXT_OFFSET: usize = 144;
const UCONTEXT_SIZE: usize = 304;
const FPSTATE_OFFSET: usize = 448;
pub const FRAME_SIZE: usize = FPSTATE_OFFSET + FPU_STATE_SIZE;

// Offsets inside the ucontext.
const UC_FLAGS: usize = 0;
const UC_LINK: usize = 8;
const UC_STACK: usize = 16; // addr u64, flags u64, size u64
const UC_MCONTEXT: usize = 40;
const UC_SIGMASK: usize = UC_MCONTEXT + 256;

fn put_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn write_siginfo(out: &mut [u8], info: &SignalInfo) {
    out[0..4].copy_from_slice(&info.signo.to_le_bytes());
    out[4..8].copy_from_slice(&info.errno.to_le_bytes());
    out[8..12].copy_from_slice(&info.code.to_le_bytes());
    out[16..24].copy_from_slice(&info.payload.to_le_bytes());
}

fn write_ucontext(out: &mut [u8], ctx: &Context64, alt: &SignalStack, sigset: u64, fpstate: u64) {
    put_u64(out, UC_FLAGS, 0);
    put_u64(out, UC_LINK, 0);
    put_u64(out, UC_STACK, alt.addr);
    put_u64(out, UC_STACK + 8, alt.flags as u64);
    put_u64(out, UC_STACK + 16, alt.size);
    let regs = &ctx.regs;
    let mc = UC_MCONTEXT;
    for (i, value) in [
        regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15, regs.rdi,
        regs.rsi, regs.rbp, regs.rbx, regs.rdx, regs.rax, regs.rcx, regs.rsp, regs.rip,
        regs.eflags,
    ]
    .iter()
    .enumerate()
    {
        put_u64(out, mc + i * 8, *value);
    }
    // Segment selectors packed cs|gs|fs|ss, then err/trapno/oldmask/cr2.
    let segs = (regs.cs & 0xffff)
        | ((regs.gs & 0xffff) << 16)
        | ((regs.fs & 0xffff) << 32)
        | ((regs.ss & 0xffff) << 48);
    put_u64(out, mc + 144, segs);
    put_u64(out, mc + 152, 0);
    put_u64(out, mc + 160, 0);
    put_u64(out, mc + 168, sigset);
    put_u64(out, mc + 176, 0);
    put_u64(out, mc + 184, fpstate);
    put_u64(out, UC_SIGMASK, sigset);
}

/// A segment base is installable when it is a canonical user address.
fn is_valid_segment_base(value: u64) -> bool {
    value < MAX_ADDR_64
}

fn mmap_rand(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    page_round_down(rand::thread_rng().gen_range(0..max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::limits::LimitSet;

    fn layout_with_stack(stack: u64) -> MmapLayout {
        let mut limits = LimitSet::default();
        limits.stack.cur = stack;
        Context64::default()
            .new_mmap_layout(0, MAX_ADDR_64, &limits)
            .unwrap()
    }

    #[test]
    fn layout_honors_min_gap() {
        let layout = layout_with_stack(8 << 20);
        assert!(layout.valid());
        assert_eq!(layout.default_direction, MmapDirection::TopDown);
        // The gap above TopDownBase is at least MIN_GAP minus the applied
        // randomization, which is bounded by max_stack_rand.
        assert!(layout.max_addr - layout.top_down_base >= MIN_GAP_64);
        assert!(layout.top_down_base >= PREFERRED_TOP_DOWN_BASE_MIN);
    }

    #[test]
    fn infinite_stack_goes_bottom_up() {
        let layout = layout_with_stack(INFINITY);
        assert_eq!(layout.default_direction, MmapDirection::BottomUp);
    }

    #[test]
    fn layout_never_inverted_for_tiny_range() {
        let mut limits = LimitSet::default();
        limits.stack.cur = 8 << 20;
        let err = Context64::default().new_mmap_layout(1 << 30, 1 << 20, &limits);
        assert!(err.is_err());
    }

    #[test]
    fn tls_validation() {
        let mut ctx = Context64::default();
        assert!(ctx.set_tls(0x7000_0000_0000));
        assert_eq!(ctx.tls(), 0x7000_0000_0000);
        // A non-canonical base is refused and the old value kept.
        assert!(!ctx.set_tls(0xffff_8000_0000_0000));
        assert_eq!(ctx.tls(), 0x7000_0000_0000);
    }

    #[test]
    fn restart_rewinds_ip() {
        let mut ctx = Context64::default();
        ctx.regs.rip = 0x1000;
        ctx.regs.orig_rax = 0; // read
        ctx.regs.rax = (-(libc::EINTR as i64)) as u64;
        ctx.restart_syscall();
        assert_eq!(ctx.regs.rip, 0x1000 - AMD64_SYSCALL_INSTR_LEN);
        assert_eq!(ctx.regs.rax, 0);

        let mut ctx = Context64::default();
        ctx.regs.rip = 0x1000;
        ctx.regs.orig_rax = 35; // nanosleep
        ctx.restart_syscall_with_restart_block();
        assert_eq!(ctx.regs.orig_rax, SYS_RESTART_SYSCALL);
    }

    #[test]
    fn signal_frame_roundtrip() {
        let mut ctx = Context64::default();
        ctx.regs.rsp = 0x7fff_f000_0000;
        ctx.regs.rip = 0x40_1000;
        ctx.regs.rbx = 0xdead_beef;
        ctx.regs.eflags = 0x202;
        let saved = ctx.regs;

        let act = SigAction {
            handler: 0x40_2000,
            restorer: 0x40_3000,
            flags: SigAction::FLAG_SIGINFO | SigAction::FLAG_RESTORER,
            mask: 0,
        };
        let info = SignalInfo {
            signo: libc::SIGSEGV,
            code: 1,
            errno: 0,
            payload: 0x1234,
        };
        let alt = SignalStack::default();
        let frame = ctx.signal_setup(&act, &info, &alt, 0xff00).unwrap();

        assert_eq!(ctx.regs.rip, act.handler);
        assert_eq!(ctx.regs.rsp % 16, 8);
        assert_eq!(ctx.regs.rdi, libc::SIGSEGV as u64);

        let (mask, _stack) = ctx.signal_restore(&frame.bytes).unwrap();
        assert_eq!(mask, 0xff00);
        assert_eq!(ctx.regs, saved);
    }

    #[test]
    fn signal_frame_uses_alt_stack() {
        let mut ctx = Context64::default();
        ctx.regs.rsp = 0x7fff_f000_0000;
        let alt = SignalStack {
            addr: 0x6000_0000,
            flags: 0,
            size: 0x10000,
        };
        let act = SigAction {
            handler: 0x40_2000,
            restorer: 0x40_3000,
            flags: SigAction::FLAG_SIGINFO | SigAction::FLAG_ONSTACK,
            mask: 0,
        };
        let frame = ctx
            .signal_setup(&act, &SignalInfo::default(), &alt, 0)
            .unwrap();
        assert!(alt.contains(frame.addr));
    }

    #[test]
    fn ptrace_user_offsets() {
        let mut ctx = Context64::default();
        ctx.regs.rbx = 77;
        // rbx is the sixth register (index 5).
        assert_eq!(ctx.ptrace_peek_user(5 * 8).unwrap(), 77);
        assert!(ctx.ptrace_peek_user(3).is_err()); // unaligned
        assert!(ctx.ptrace_peek_user(USER_STRUCT_SIZE).is_err()); // out of range
        assert_eq!(ctx.ptrace_peek_user(PTRACE_REGISTERS_SIZE).unwrap(), 0);

        ctx.ptrace_poke_user(5 * 8, 99).unwrap();
        assert_eq!(ctx.regs.rbx, 99);
        // Pokes past the register area silently no-op.
        ctx.ptrace_poke_user(PTRACE_REGISTERS_SIZE, 1).unwrap();
    }
}

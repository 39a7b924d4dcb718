//! Classic-BPF emission for seccomp filters, plus an interpreter used by
//! the test suite to check programs against the rule tables they were
//! compiled from.

use thiserror::Error;

pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_AND: u16 = 0x50;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_KILL_THREAD: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

/// seccomp_data field offsets.
pub const OFF_NR: u32 = 0;
pub const OFF_ARCH: u32 = 4;
pub fn off_arg_lo(index: usize) -> u32 {
    16 + (index as u32) * 8
}
pub fn off_arg_hi(index: usize) -> u32 {
    20 + (index as u32) * 8
}

/// One classic BPF instruction, struct sock_filter.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

pub fn stmt(code: u16, k: u32) -> SockFilter {
    SockFilter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

pub fn jump(code: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter { code, k, jt, jf }
}

#[derive(Error, Debug)]
pub enum BpfError {
    #[error("program exceeds the {0}-instruction limit")]
    TooLong(usize),

    #[error("jump target out of range at instruction {0}")]
    JumpRange(usize),

    #[error("undefined label {0}")]
    UndefinedLabel(usize),
}

pub const MAX_INSTRUCTIONS: usize = 4096;

/// A symbolic jump target, resolved at assembly time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Label(usize);

/// Assembler for seccomp programs. Conditional jumps are emitted as a
/// short skip over an unconditional far jump, so label distance never
/// overflows the 8-bit jt/jf fields.
#[derive(Default)]
pub struct Assembler {
    instructions: Vec<AbstractInst>,
    labels: usize,
}

enum AbstractInst {
    Fixed(SockFilter),
    /// Conditional branch to `target`. `jump_on_true` selects which
    /// outcome of the test takes the jump; the other falls through.
    CondOrJump {
        code: u16,
        k: u32,
        target: Label,
        jump_on_true: bool,
    },
    Goto(Label),
    Bind(Label),
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::default()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels);
        self.labels += 1;
        label
    }

    pub fn load_abs(&mut self, offset: u32) {
        self.instructions
            .push(AbstractInst::Fixed(stmt(BPF_LD | BPF_W | BPF_ABS, offset)));
    }

    pub fn and_k(&mut self, mask: u32) {
        self.instructions
            .push(AbstractInst::Fixed(stmt(BPF_ALU | BPF_AND | BPF_K, mask)));
    }

    /// If (A == k) continue, else goto `target`.
    pub fn jeq_or_goto(&mut self, k: u32, target: Label) {
        self.instructions.push(AbstractInst::CondOrJump {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            k,
            target,
            jump_on_true: false,
        });
    }

    /// If (A == k) goto `target`, else continue.
    pub fn jeq_goto(&mut self, k: u32, target: Label) {
        self.instructions.push(AbstractInst::CondOrJump {
            code: BPF_JMP | BPF_JEQ | BPF_K,
            k,
            target,
            jump_on_true: true,
        });
    }

    /// If (A > k) continue, else goto `target`.
    pub fn jgt_or_goto(&mut self, k: u32, target: Label) {
        self.instructions.push(AbstractInst::CondOrJump {
            code: BPF_JMP | BPF_JGT | BPF_K,
            k,
            target,
            jump_on_true: false,
        });
    }

    /// If (A > k) goto `target`, else continue.
    pub fn jgt_goto(&mut self, k: u32, target: Label) {
        self.instructions.push(AbstractInst::CondOrJump {
            code: BPF_JMP | BPF_JGT | BPF_K,
            k,
            target,
            jump_on_true: true,
        });
    }

    /// If (A & k) != 0 goto `target`, else continue.
    pub fn jset_goto(&mut self, k: u32, target: Label) {
        self.instructions.push(AbstractInst::CondOrJump {
            code: BPF_JMP | BPF_JSET | BPF_K,
            k,
            target,
            jump_on_true: true,
        });
    }

    pub fn goto(&mut self, target: Label) {
        self.instructions.push(AbstractInst::Goto(target));
    }

    pub fn bind(&mut self, label: Label) {
        self.instructions.push(AbstractInst::Bind(label));
    }

    pub fn ret(&mut self, action: u32) {
        self.instructions
            .push(AbstractInst::Fixed(stmt(BPF_RET | BPF_K, action)));
    }

    /// Resolves labels and produces the final program.
    pub fn assemble(self) -> Result<Vec<SockFilter>, BpfError> {
        // First pass: compute each instruction's final index. A
        // conditional costs two slots (cond + far jump), a bind costs
        // none.
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut label_at = vec![None; self.labels];
        let mut pc = 0usize;
        for inst in &self.instructions {
            offsets.push(pc);
            match inst {
                AbstractInst::Fixed(_) | AbstractInst::Goto(_) => pc += 1,
                AbstractInst::CondOrJump { .. } => pc += 2,
                AbstractInst::Bind(label) => label_at[label.0] = Some(pc),
            }
        }
        let total = pc;
        if total > MAX_INSTRUCTIONS {
            return Err(BpfError::TooLong(MAX_INSTRUCTIONS));
        }

        let resolve = |label: &Label| -> Result<usize, BpfError> {
            label_at[label.0].ok_or(BpfError::UndefinedLabel(label.0))
        };

        let mut out = Vec::with_capacity(total);
        for inst in &self.instructions {
            match inst {
                AbstractInst::Fixed(filter) => out.push(*filter),
                AbstractInst::CondOrJump {
                    code,
                    k,
                    target,
                    jump_on_true,
                } => {
                    let here = out.len();
                    // The branch that takes the jump falls into the JA;
                    // the other branch skips it.
                    let (jt, jf) = if *jump_on_true { (0, 1) } else { (1, 0) };
                    out.push(jump(*code, *k, jt, jf));
                    let target_pc = resolve(target)?;
                    let delta = target_pc
                        .checked_sub(here + 2)
                        .ok_or(BpfError::JumpRange(here))?;
                    out.push(stmt(BPF_JMP | BPF_JA, delta as u32));
                }
                AbstractInst::Goto(target) => {
                    let here = out.len();
                    let target_pc = resolve(target)?;
                    let delta = target_pc
                        .checked_sub(here + 1)
                        .ok_or(BpfError::JumpRange(here))?;
                    out.push(stmt(BPF_JMP | BPF_JA, delta as u32));
                }
                AbstractInst::Bind(_) => {}
            }
        }
        Ok(out)
    }
}

/// The inputs seccomp evaluates a program against.
#[derive(Debug, Default, Copy, Clone)]
pub struct SeccompData {
    pub nr: u32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

impl SeccompData {
    fn load(&self, offset: u32) -> u32 {
        match offset {
            OFF_NR => self.nr,
            OFF_ARCH => self.arch,
            8 => self.instruction_pointer as u32,
            12 => (self.instruction_pointer >> 32) as u32,
            _ => {
                let rel = offset - 16;
                let index = (rel / 8) as usize;
                if rel % 8 == 0 {
                    self.args[index] as u32
                } else {
                    (self.args[index] >> 32) as u32
                }
            }
        }
    }
}

/// Interprets a program the way the host kernel would; returns the
/// action value.
pub fn evaluate(program: &[SockFilter], data: &SeccompData) -> u32 {
    let mut acc: u32 = 0;
    let mut pc = 0usize;
    loop {
        let inst = &program[pc];
        match inst.code {
            code if code == BPF_LD | BPF_W | BPF_ABS => {
                acc = data.load(inst.k);
                pc += 1;
            }
            code if code == BPF_ALU | BPF_AND | BPF_K => {
                acc &= inst.k;
                pc += 1;
            }
            code if code == BPF_JMP | BPF_JA => {
                pc += 1 + inst.k as usize;
            }
            code if code == BPF_JMP | BPF_JEQ | BPF_K => {
                pc += 1 + if acc == inst.k {
                    inst.jt as usize
                } else {
                    inst.jf as usize
                };
            }
            code if code == BPF_JMP | BPF_JGT | BPF_K => {
                pc += 1 + if acc > inst.k {
                    inst.jt as usize
                } else {
                    inst.jf as usize
                };
            }
            code if code == BPF_JMP | BPF_JSET | BPF_K => {
                pc += 1 + if acc & inst.k != 0 {
                    inst.jt as usize
                } else {
                    inst.jf as usize
                };
            }
            code if code == BPF_RET | BPF_K => return inst.k,
            other => panic!("interpreter hit unsupported opcode {other:#x} at {pc}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_and_run_trivial_allow() {
        let mut asm = Assembler::new();
        asm.ret(SECCOMP_RET_ALLOW);
        let program = asm.assemble().unwrap();
        assert_eq!(program.len(), 1);
        assert_eq!(
            evaluate(&program, &SeccompData::default()),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn conditional_with_far_target() {
        let mut asm = Assembler::new();
        let fail = asm.new_label();
        asm.load_abs(OFF_NR);
        asm.jeq_or_goto(42, fail);
        asm.ret(SECCOMP_RET_ALLOW);
        asm.bind(fail);
        asm.ret(SECCOMP_RET_KILL_THREAD);
        let program = asm.assemble().unwrap();

        let mut data = SeccompData {
            nr: 42,
            ..Default::default()
        };
        assert_eq!(evaluate(&program, &data), SECCOMP_RET_ALLOW);
        data.nr = 43;
        assert_eq!(evaluate(&program, &data), SECCOMP_RET_KILL_THREAD);
    }

    #[test]
    fn arg_words_load_correctly() {
        let mut data = SeccompData::default();
        data.args[2] = 0xdead_beef_0000_0001;
        assert_eq!(data.load(off_arg_lo(2)), 0x0000_0001);
        assert_eq!(data.load(off_arg_hi(2)), 0xdead_beef);
    }
}

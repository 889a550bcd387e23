use crate::cpu::FaultReason;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Or,
    And,
    Xor,
    Add,
    Sub,
    MulLow,
    MulHighU,
    Ashr,
    Shr,
    Shl,
    Clz,
    Shuffle,
    Ctz,
    Move,
    CmpEq,
    CmpNe,
    CmpGt,
    CmpGe,
    CmpLt,
    CmpLe,
    CmpGtU,
    CmpGeU,
    CmpLtU,
    CmpLeU,
    GetLane,
    Ftoi,
    Reciprocal,
    Sext8,
    Sext16,
    MulHighI,
    AddF,
    SubF,
    MulF,
    Itof,
    CmpGtF,
    CmpGeF,
    CmpLtF,
    CmpLeF,
    CmpEqF,
    CmpNeF,
}

const ARITH_OPS: [(ArithOp, u32, &str); 40] = [
    (ArithOp::Or, 0x00, "or"),
    (ArithOp::And, 0x01, "and"),
    (ArithOp::Xor, 0x03, "xor"),
    (ArithOp::Add, 0x05, "add_i"),
    (ArithOp::Sub, 0x06, "sub_i"),
    (ArithOp::MulLow, 0x07, "mull_i"),
    (ArithOp::MulHighU, 0x08, "mulh_u"),
    (ArithOp::Ashr, 0x09, "ashr"),
    (ArithOp::Shr, 0x0a, "shr"),
    (ArithOp::Shl, 0x0b, "shl"),
    (ArithOp::Clz, 0x0c, "clz"),
    (ArithOp::Shuffle, 0x0d, "shuffle"),
    (ArithOp::Ctz, 0x0e, "ctz"),
    (ArithOp::Move, 0x0f, "move"),
    (ArithOp::CmpEq, 0x10, "cmpeq_i"),
    (ArithOp::CmpNe, 0x11, "cmpne_i"),
    (ArithOp::CmpGt, 0x12, "cmpgt_i"),
    (ArithOp::CmpGe, 0x13, "cmpge_i"),
    (ArithOp::CmpLt, 0x14, "cmplt_i"),
    (ArithOp::CmpLe, 0x15, "cmple_i"),
    (ArithOp::CmpGtU, 0x16, "cmpgt_u"),
    (ArithOp::CmpGeU, 0x17, "cmpge_u"),
    (ArithOp::CmpLtU, 0x18, "cmplt_u"),
    (ArithOp::CmpLeU, 0x19, "cmple_u"),
    (ArithOp::GetLane, 0x1a, "getlane"),
    (ArithOp::Ftoi, 0x1b, "ftoi"),
    (ArithOp::Reciprocal, 0x1c, "reciprocal"),
    (ArithOp::Sext8, 0x1d, "sext_8"),
    (ArithOp::Sext16, 0x1e, "sext_16"),
    (ArithOp::MulHighI, 0x1f, "mulh_i"),
    (ArithOp::AddF, 0x20, "add_f"),
    (ArithOp::SubF, 0x21, "sub_f"),
    (ArithOp::MulF, 0x22, "mul_f"),
    (ArithOp::Itof, 0x2a, "itof"),
    (ArithOp::CmpGtF, 0x2c, "cmpgt_f"),
    (ArithOp::CmpGeF, 0x2d, "cmpge_f"),
    (ArithOp::CmpLtF, 0x2e, "cmplt_f"),
    (ArithOp::CmpLeF, 0x2f, "cmple_f"),
    (ArithOp::CmpEqF, 0x30, "cmpeq_f"),
    (ArithOp::CmpNeF, 0x31, "cmpne_f"),
];

/// Register-format opcode reserved for `syscall`.
const OP_SYSCALL: u32 = 0x3f;

impl ArithOp {
    pub fn from_code(code: u32) -> Option<Self> {
        ARITH_OPS
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(op, _, _)| *op)
    }

    fn entry(self) -> &'static (ArithOp, u32, &'static str) {
        ARITH_OPS
            .iter()
            .find(|(op, _, _)| *op == self)
            .unwrap_or(&ARITH_OPS[0])
    }

    pub fn code(self) -> u32 {
        self.entry().1
    }

    pub fn mnemonic(self) -> &'static str {
        self.entry().2
    }

    /// Comparisons produce a lane bitmask in a scalar register.
    pub fn is_compare(self) -> bool {
        matches!(
            self,
            ArithOp::CmpEq
                | ArithOp::CmpNe
                | ArithOp::CmpGt
                | ArithOp::CmpGe
                | ArithOp::CmpLt
                | ArithOp::CmpLe
                | ArithOp::CmpGtU
                | ArithOp::CmpGeU
                | ArithOp::CmpLtU
                | ArithOp::CmpLeU
                | ArithOp::CmpGtF
                | ArithOp::CmpGeF
                | ArithOp::CmpLtF
                | ArithOp::CmpLeF
                | ArithOp::CmpEqF
                | ArithOp::CmpNeF
        )
    }

    /// Single-operand ops read only the second operand.
    pub fn is_unary(self) -> bool {
        matches!(
            self,
            ArithOp::Clz
                | ArithOp::Ctz
                | ArithOp::Move
                | ArithOp::Ftoi
                | ArithOp::Reciprocal
                | ArithOp::Sext8
                | ArithOp::Sext16
                | ArithOp::Itof
        )
    }
}

/// Operand shapes of register-register arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegFormat {
    /// s dest, s src1, s src2
    Scalar,
    /// v dest, v src1, s src2 (broadcast)
    VectorScalar,
    /// v dest, v src1, v src2
    VectorVector,
}

/// Operand shapes of register-immediate arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmFormat {
    /// s dest, s src1, imm
    Scalar,
    /// v dest, v src1, imm
    Vector,
    /// v dest, s src1 (broadcast), imm
    VectorFromScalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemOp {
    Byte,
    ByteSigned,
    Short,
    ShortSigned,
    Word,
    Sync,
    ControlReg,
    Block,
    ScatterGather,
}

impl MemOp {
    fn code(self, masked: bool) -> u32 {
        match self {
            MemOp::Byte => 0,
            MemOp::ByteSigned => 1,
            MemOp::Short => 2,
            MemOp::ShortSigned => 3,
            MemOp::Word => 4,
            MemOp::Sync => 5,
            MemOp::ControlReg => 6,
            MemOp::Block => 7 + masked as u32,
            MemOp::ScatterGather => 9 + masked as u32,
        }
    }

    /// Vector memory ops move a whole register and may carry a predicate.
    pub fn is_vector(self) -> bool {
        matches!(self, MemOp::Block | MemOp::ScatterGather)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    DtlbInsert,
    Dinvalidate,
    Dflush,
    Iinvalidate,
    Membar,
    TlbInvalidate,
    TlbInvalidateAll,
    ItlbInsert,
}

const CACHE_OPS: [CacheOp; 8] = [
    CacheOp::DtlbInsert,
    CacheOp::Dinvalidate,
    CacheOp::Dflush,
    CacheOp::Iinvalidate,
    CacheOp::Membar,
    CacheOp::TlbInvalidate,
    CacheOp::TlbInvalidateAll,
    CacheOp::ItlbInsert,
];

impl CacheOp {
    /// Operations that only supervisor code may issue.
    pub fn is_privileged(self) -> bool {
        matches!(
            self,
            CacheOp::DtlbInsert
                | CacheOp::ItlbInsert
                | CacheOp::TlbInvalidate
                | CacheOp::TlbInvalidateAll
                | CacheOp::Dinvalidate
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Taken when the low 16 bits of the register are all set.
    All,
    Zero,
    NotZero,
    Always,
    Call,
    /// Taken unless the low 16 bits of the register are all set.
    NotAll,
    CallRegister,
    Eret,
}

const BRANCH_KINDS: [BranchKind; 8] = [
    BranchKind::All,
    BranchKind::Zero,
    BranchKind::NotZero,
    BranchKind::Always,
    BranchKind::Call,
    BranchKind::NotAll,
    BranchKind::CallRegister,
    BranchKind::Eret,
];

/// A decoded instruction. Register fields are raw 5-bit indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    RegArith {
        op: ArithOp,
        format: RegFormat,
        dest: u8,
        src1: u8,
        src2: u8,
        mask: Option<u8>,
    },
    ImmArith {
        op: ArithOp,
        format: ImmFormat,
        dest: u8,
        src1: u8,
        imm: i32,
        mask: Option<u8>,
    },
    Memory {
        op: MemOp,
        load: bool,
        reg: u8,
        ptr: u8,
        offset: i32,
        mask: Option<u8>,
    },
    CacheControl {
        op: CacheOp,
        ptr: u8,
        value: u8,
        offset: i32,
    },
    Branch {
        kind: BranchKind,
        reg: u8,
        offset: i32,
    },
    Syscall,
}

fn bits(insn: u32, lo: u32, width: u32) -> u32 {
    (insn >> lo) & ((1 << width) - 1)
}

fn sbits(insn: u32, lo: u32, width: u32) -> i32 {
    let shift = 32 - width;
    ((bits(insn, lo, width) << shift) as i32) >> shift
}

fn field(value: i32, width: u32) -> u32 {
    (value as u32) & ((1 << width) - 1)
}

fn reg(insn: u32, lo: u32) -> u8 {
    bits(insn, lo, 5) as u8
}

/// Decode one instruction word. Anything that does not name a defined
/// operation yields the illegal-instruction fault reason.
pub fn decode(insn: u32) -> Result<Instruction, FaultReason> {
    if insn >> 31 == 0 {
        decode_immediate(insn)
    } else if insn >> 29 == 0b110 {
        decode_register(insn)
    } else if insn >> 30 == 0b10 {
        decode_memory(insn)
    } else if insn >> 28 == 0b1110 {
        Ok(Instruction::CacheControl {
            op: CACHE_OPS[bits(insn, 25, 3) as usize],
            ptr: reg(insn, 0),
            value: reg(insn, 5),
            offset: sbits(insn, 10, 15),
        })
    } else {
        Ok(Instruction::Branch {
            kind: BRANCH_KINDS[bits(insn, 25, 3) as usize],
            reg: reg(insn, 0),
            offset: sbits(insn, 5, 20),
        })
    }
}

fn decode_register(insn: u32) -> Result<Instruction, FaultReason> {
    let fmt = bits(insn, 26, 3);
    let code = bits(insn, 20, 6);
    if code == OP_SYSCALL && fmt == 0 {
        return Ok(Instruction::Syscall);
    }

    let mask_reg = reg(insn, 10);
    let (format, mask) = match fmt {
        0 => (RegFormat::Scalar, None),
        1 => (RegFormat::VectorScalar, None),
        2 => (RegFormat::VectorScalar, Some(mask_reg)),
        4 => (RegFormat::VectorVector, None),
        5 => (RegFormat::VectorVector, Some(mask_reg)),
        _ => return Err(FaultReason::IllegalInstruction),
    };
    let op = ArithOp::from_code(code).ok_or(FaultReason::IllegalInstruction)?;
    let legal = match op {
        ArithOp::GetLane => format == RegFormat::VectorScalar && mask.is_none(),
        ArithOp::Shuffle => format == RegFormat::VectorVector,
        _ => true,
    };
    if !legal {
        return Err(FaultReason::IllegalInstruction);
    }

    Ok(Instruction::RegArith {
        op,
        format,
        dest: reg(insn, 5),
        src1: reg(insn, 0),
        src2: reg(insn, 15),
        mask,
    })
}

fn decode_immediate(insn: u32) -> Result<Instruction, FaultReason> {
    let fmt = bits(insn, 28, 3);
    let (format, masked) = match fmt {
        0 => (ImmFormat::Scalar, false),
        1 => (ImmFormat::Vector, false),
        2 => (ImmFormat::Vector, true),
        4 => (ImmFormat::VectorFromScalar, false),
        5 => (ImmFormat::VectorFromScalar, true),
        _ => return Err(FaultReason::IllegalInstruction),
    };
    let op = ArithOp::from_code(bits(insn, 23, 5)).ok_or(FaultReason::IllegalInstruction)?;
    let legal = match op {
        ArithOp::GetLane => format == ImmFormat::Vector && !masked,
        ArithOp::Shuffle => false,
        _ => true,
    };
    if !legal {
        return Err(FaultReason::IllegalInstruction);
    }

    let (imm, mask) = if masked {
        (sbits(insn, 15, 8), Some(reg(insn, 10)))
    } else {
        (sbits(insn, 10, 13), None)
    };

    Ok(Instruction::ImmArith {
        op,
        format,
        dest: reg(insn, 5),
        src1: reg(insn, 0),
        imm,
        mask,
    })
}

fn decode_memory(insn: u32) -> Result<Instruction, FaultReason> {
    let (op, masked) = match bits(insn, 25, 4) {
        0 => (MemOp::Byte, false),
        1 => (MemOp::ByteSigned, false),
        2 => (MemOp::Short, false),
        3 => (MemOp::ShortSigned, false),
        4 => (MemOp::Word, false),
        5 => (MemOp::Sync, false),
        6 => (MemOp::ControlReg, false),
        7 => (MemOp::Block, false),
        8 => (MemOp::Block, true),
        9 => (MemOp::ScatterGather, false),
        10 => (MemOp::ScatterGather, true),
        _ => return Err(FaultReason::IllegalInstruction),
    };
    let (offset, mask) = if masked {
        (sbits(insn, 15, 10), Some(reg(insn, 10)))
    } else {
        (sbits(insn, 10, 15), None)
    };

    Ok(Instruction::Memory {
        op,
        load: bits(insn, 29, 1) != 0,
        reg: reg(insn, 5),
        ptr: reg(insn, 0),
        offset,
        mask,
    })
}

/// Encode an instruction back into its 32-bit form.
///
/// Immediates and offsets are truncated to their field widths, so values
/// that do not fit do not survive a decode.
pub fn encode(instr: &Instruction) -> u32 {
    match *instr {
        Instruction::RegArith {
            op,
            format,
            dest,
            src1,
            src2,
            mask,
        } => {
            let fmt = match (format, mask.is_some()) {
                (RegFormat::Scalar, _) => 0,
                (RegFormat::VectorScalar, false) => 1,
                (RegFormat::VectorScalar, true) => 2,
                (RegFormat::VectorVector, false) => 4,
                (RegFormat::VectorVector, true) => 5,
            };
            0xc000_0000
                | (fmt << 26)
                | (op.code() << 20)
                | ((src2 as u32 & 0x1f) << 15)
                | ((mask.unwrap_or(0) as u32 & 0x1f) << 10)
                | ((dest as u32 & 0x1f) << 5)
                | (src1 as u32 & 0x1f)
        }
        Instruction::ImmArith {
            op,
            format,
            dest,
            src1,
            imm,
            mask,
        } => {
            let fmt = match (format, mask.is_some()) {
                (ImmFormat::Scalar, _) => 0,
                (ImmFormat::Vector, false) => 1,
                (ImmFormat::Vector, true) => 2,
                (ImmFormat::VectorFromScalar, false) => 4,
                (ImmFormat::VectorFromScalar, true) => 5,
            };
            let imm_bits = match mask {
                Some(m) if format != ImmFormat::Scalar => {
                    (field(imm, 8) << 15) | ((m as u32 & 0x1f) << 10)
                }
                _ => field(imm, 13) << 10,
            };
            (fmt << 28)
                | ((op.code() & 0x1f) << 23)
                | imm_bits
                | ((dest as u32 & 0x1f) << 5)
                | (src1 as u32 & 0x1f)
        }
        Instruction::Memory {
            op,
            load,
            reg,
            ptr,
            offset,
            mask,
        } => {
            let masked = op.is_vector() && mask.is_some();
            let offset_bits = match mask {
                Some(m) if masked => (field(offset, 10) << 15) | ((m as u32 & 0x1f) << 10),
                _ => field(offset, 15) << 10,
            };
            0x8000_0000
                | ((load as u32) << 29)
                | (op.code(masked) << 25)
                | offset_bits
                | ((reg as u32 & 0x1f) << 5)
                | (ptr as u32 & 0x1f)
        }
        Instruction::CacheControl {
            op,
            ptr,
            value,
            offset,
        } => {
            let code = CACHE_OPS.iter().position(|c| *c == op).unwrap_or(0) as u32;
            0xe000_0000
                | (code << 25)
                | (field(offset, 15) << 10)
                | ((value as u32 & 0x1f) << 5)
                | (ptr as u32 & 0x1f)
        }
        Instruction::Branch { kind, reg, offset } => {
            let code = BRANCH_KINDS.iter().position(|k| *k == kind).unwrap_or(0) as u32;
            0xf000_0000 | (code << 25) | (field(offset, 20) << 5) | (reg as u32 & 0x1f)
        }
        Instruction::Syscall => 0xc000_0000 | (OP_SYSCALL << 20),
    }
}

fn sreg(index: u8) -> String {
    match index {
        31 => "pc".to_string(),
        _ => format!("s{}", index),
    }
}

fn vreg(index: u8) -> String {
    format!("v{}", index)
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Instruction::RegArith {
                op,
                format,
                dest,
                src1,
                src2,
                mask,
            } => {
                let vector_dest =
                    format != RegFormat::Scalar && !op.is_compare() && op != ArithOp::GetLane;
                let d = if vector_dest { vreg(dest) } else { sreg(dest) };
                let s1 = if format == RegFormat::Scalar { sreg(src1) } else { vreg(src1) };
                let s2 = if format == RegFormat::VectorVector { vreg(src2) } else { sreg(src2) };
                let suffix = if mask.is_some() { "_mask" } else { "" };
                write!(f, "{}{} {}", op.mnemonic(), suffix, d)?;
                if let Some(m) = mask {
                    write!(f, ", {}", sreg(m))?;
                }
                if op.is_unary() {
                    write!(f, ", {}", s2)
                } else {
                    write!(f, ", {}, {}", s1, s2)
                }
            }
            Instruction::ImmArith {
                op,
                format,
                dest,
                src1,
                imm,
                mask,
            } => {
                let vector_dest =
                    format != ImmFormat::Scalar && !op.is_compare() && op != ArithOp::GetLane;
                let d = if vector_dest { vreg(dest) } else { sreg(dest) };
                let s1 = if format == ImmFormat::Vector { vreg(src1) } else { sreg(src1) };
                let suffix = if mask.is_some() { "_mask" } else { "" };
                write!(f, "{}{} {}", op.mnemonic(), suffix, d)?;
                if let Some(m) = mask {
                    write!(f, ", {}", sreg(m))?;
                }
                if op.is_unary() {
                    write!(f, ", {}", imm)
                } else {
                    write!(f, ", {}, {}", s1, imm)
                }
            }
            Instruction::Memory {
                op,
                load,
                reg,
                ptr,
                offset,
                mask,
            } => {
                let name = match (op, load) {
                    (MemOp::Byte, true) => "load_u8",
                    (MemOp::ByteSigned, true) => "load_s8",
                    (MemOp::Short, true) => "load_u16",
                    (MemOp::ShortSigned, true) => "load_s16",
                    (MemOp::Word, true) => "load_32",
                    (MemOp::Sync, true) => "load_sync",
                    (MemOp::ControlReg, true) => "getcr",
                    (MemOp::Block, true) => "load_v",
                    (MemOp::ScatterGather, true) => "load_gath",
                    (MemOp::Byte | MemOp::ByteSigned, false) => "store_8",
                    (MemOp::Short | MemOp::ShortSigned, false) => "store_16",
                    (MemOp::Word, false) => "store_32",
                    (MemOp::Sync, false) => "store_sync",
                    (MemOp::ControlReg, false) => "setcr",
                    (MemOp::Block, false) => "store_v",
                    (MemOp::ScatterGather, false) => "store_scat",
                };
                if op == MemOp::ControlReg {
                    return write!(f, "{} {}, {}", name, sreg(reg), ptr);
                }
                let data = if op.is_vector() { vreg(reg) } else { sreg(reg) };
                let base = if op == MemOp::ScatterGather { vreg(ptr) } else { sreg(ptr) };
                match mask {
                    Some(m) if op.is_vector() => {
                        write!(f, "{}_mask {}, {}, {}({})", name, data, sreg(m), offset, base)
                    }
                    _ => write!(f, "{} {}, {}({})", name, data, offset, base),
                }
            }
            Instruction::CacheControl {
                op,
                ptr,
                value,
                offset,
            } => match op {
                CacheOp::DtlbInsert => write!(f, "dtlbinsert {}, {}", sreg(ptr), sreg(value)),
                CacheOp::ItlbInsert => write!(f, "itlbinsert {}, {}", sreg(ptr), sreg(value)),
                CacheOp::Dinvalidate => write!(f, "dinvalidate {}({})", offset, sreg(ptr)),
                CacheOp::Dflush => write!(f, "dflush {}({})", offset, sreg(ptr)),
                CacheOp::Iinvalidate => write!(f, "iinvalidate {}({})", offset, sreg(ptr)),
                CacheOp::TlbInvalidate => write!(f, "tlbinval {}", sreg(ptr)),
                CacheOp::TlbInvalidateAll => write!(f, "tlbinvalall"),
                CacheOp::Membar => write!(f, "membar"),
            },
            Instruction::Branch { kind, reg, offset } => {
                let target = offset.wrapping_mul(4);
                match kind {
                    BranchKind::All => write!(f, "ball {}, .{:+}", sreg(reg), target),
                    BranchKind::Zero => write!(f, "bz {}, .{:+}", sreg(reg), target),
                    BranchKind::NotZero => write!(f, "bnz {}, .{:+}", sreg(reg), target),
                    BranchKind::NotAll => write!(f, "bnall {}, .{:+}", sreg(reg), target),
                    BranchKind::Always => write!(f, "b .{:+}", target),
                    BranchKind::Call => write!(f, "call .{:+}", target),
                    BranchKind::CallRegister => write!(f, "call {}", sreg(reg)),
                    BranchKind::Eret => write!(f, "eret"),
                }
            }
            Instruction::Syscall => write!(f, "syscall"),
        }
    }
}

//! Instruction word builders for writing guest programs from Rust.
//!
//! Register arguments are raw indices (`31` is `pc`). Branch offsets are in
//! instruction words relative to the following instruction.

use crate::decoder::{
    encode, ArithOp, BranchKind, CacheOp, ImmFormat, Instruction, MemOp, RegFormat,
};

pub fn arith(op: ArithOp, dest: u8, src1: u8, src2: u8) -> u32 {
    encode(&Instruction::RegArith {
        op,
        format: RegFormat::Scalar,
        dest,
        src1,
        src2,
        mask: None,
    })
}

pub fn arith_imm(op: ArithOp, dest: u8, src1: u8, imm: i32) -> u32 {
    encode(&Instruction::ImmArith {
        op,
        format: ImmFormat::Scalar,
        dest,
        src1,
        imm,
        mask: None,
    })
}

pub fn addi(dest: u8, src: u8, imm: i32) -> u32 {
    arith_imm(ArithOp::Add, dest, src, imm)
}

/// `move dest, src`
pub fn mov(dest: u8, src: u8) -> u32 {
    arith(ArithOp::Move, dest, 0, src)
}

/// Load a full 32-bit constant in five instructions.
pub fn li(dest: u8, value: u32) -> [u32; 5] {
    [
        arith_imm(ArithOp::Move, dest, 0, (value >> 22) as i32),
        arith_imm(ArithOp::Shl, dest, dest, 11),
        arith_imm(ArithOp::Or, dest, dest, ((value >> 11) & 0x7ff) as i32),
        arith_imm(ArithOp::Shl, dest, dest, 11),
        arith_imm(ArithOp::Or, dest, dest, (value & 0x7ff) as i32),
    ]
}

pub fn vaddi(dest: u8, src: u8, imm: i32) -> u32 {
    encode(&Instruction::ImmArith {
        op: ArithOp::Add,
        format: ImmFormat::Vector,
        dest,
        src1: src,
        imm,
        mask: None,
    })
}

pub fn vaddi_mask(dest: u8, mask: u8, src: u8, imm: i32) -> u32 {
    encode(&Instruction::ImmArith {
        op: ArithOp::Add,
        format: ImmFormat::Vector,
        dest,
        src1: src,
        imm,
        mask: Some(mask),
    })
}

pub fn varith(op: ArithOp, dest: u8, src1: u8, src2: u8) -> u32 {
    encode(&Instruction::RegArith {
        op,
        format: RegFormat::VectorVector,
        dest,
        src1,
        src2,
        mask: None,
    })
}

/// Compare every lane of vector `src1` against scalar `src2`; the lane
/// bitmask lands in scalar `dest`.
pub fn vcompare(op: ArithOp, dest: u8, src1: u8, src2: u8) -> u32 {
    encode(&Instruction::RegArith {
        op,
        format: RegFormat::VectorScalar,
        dest,
        src1,
        src2,
        mask: None,
    })
}

pub fn load(op: MemOp, dest: u8, ptr: u8, offset: i32) -> u32 {
    encode(&Instruction::Memory {
        op,
        load: true,
        reg: dest,
        ptr,
        offset,
        mask: None,
    })
}

pub fn store(op: MemOp, src: u8, ptr: u8, offset: i32) -> u32 {
    encode(&Instruction::Memory {
        op,
        load: false,
        reg: src,
        ptr,
        offset,
        mask: None,
    })
}

pub fn load_v(dest: u8, ptr: u8, offset: i32) -> u32 {
    load(MemOp::Block, dest, ptr, offset)
}

pub fn store_v(src: u8, ptr: u8, offset: i32) -> u32 {
    store(MemOp::Block, src, ptr, offset)
}

pub fn gather(dest: u8, ptr: u8, offset: i32) -> u32 {
    load(MemOp::ScatterGather, dest, ptr, offset)
}

pub fn scatter(src: u8, ptr: u8, offset: i32) -> u32 {
    store(MemOp::ScatterGather, src, ptr, offset)
}

pub fn getcr(dest: u8, index: u8) -> u32 {
    load(MemOp::ControlReg, dest, index, 0)
}

pub fn setcr(src: u8, index: u8) -> u32 {
    store(MemOp::ControlReg, src, index, 0)
}

fn cache(op: CacheOp, ptr: u8, value: u8) -> u32 {
    encode(&Instruction::CacheControl {
        op,
        ptr,
        value,
        offset: 0,
    })
}

/// Map the page holding the address in `va` using the physical address
/// and permission bits in `pa`.
pub fn dtlbinsert(va: u8, pa: u8) -> u32 {
    cache(CacheOp::DtlbInsert, va, pa)
}

pub fn itlbinsert(va: u8, pa: u8) -> u32 {
    cache(CacheOp::ItlbInsert, va, pa)
}

pub fn tlbinval(va: u8) -> u32 {
    cache(CacheOp::TlbInvalidate, va, 0)
}

pub fn tlbinvalall() -> u32 {
    cache(CacheOp::TlbInvalidateAll, 0, 0)
}

pub fn dinvalidate(ptr: u8) -> u32 {
    cache(CacheOp::Dinvalidate, ptr, 0)
}

pub fn membar() -> u32 {
    cache(CacheOp::Membar, 0, 0)
}

fn branch_to(kind: BranchKind, reg: u8, offset: i32) -> u32 {
    encode(&Instruction::Branch { kind, reg, offset })
}

pub fn b(offset: i32) -> u32 {
    branch_to(BranchKind::Always, 0, offset)
}

pub fn bz(reg: u8, offset: i32) -> u32 {
    branch_to(BranchKind::Zero, reg, offset)
}

pub fn bnz(reg: u8, offset: i32) -> u32 {
    branch_to(BranchKind::NotZero, reg, offset)
}

pub fn call(offset: i32) -> u32 {
    branch_to(BranchKind::Call, 0, offset)
}

pub fn call_reg(reg: u8) -> u32 {
    branch_to(BranchKind::CallRegister, reg, 0)
}

/// `move pc, s30`
pub fn ret() -> u32 {
    mov(31, 30)
}

pub fn eret() -> u32 {
    branch_to(BranchKind::Eret, 0, 0)
}

pub fn syscall() -> u32 {
    encode(&Instruction::Syscall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;

    #[test]
    fn ret_is_move_pc_s30() {
        assert_eq!(ret(), 0xc0ff_03e0);
    }

    #[test]
    fn li_pieces_fit_their_immediates() {
        for word in li(4, 0xffff_0020) {
            assert!(decode(word).is_ok());
        }
        assert_eq!(decode(getcr(2, 3)).unwrap().to_string(), "getcr s2, 3");
        assert_eq!(decode(setcr(2, 4)).unwrap().to_string(), "setcr s2, 4");
    }
}

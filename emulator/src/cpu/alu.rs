//! Per-lane arithmetic. Scalar and vector forms share these routines.

use crate::decoder::ArithOp;

fn f(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Hardware reciprocal is an estimate with six bits of mantissa.
fn reciprocal(value: u32) -> u32 {
    let result = (1.0 / f(value)).to_bits();
    if f32::from_bits(result).is_nan() {
        0x7fff_ffff
    } else {
        result & 0xfffe_0000
    }
}

/// Apply `op` to one lane. Comparisons yield 1 or 0. Single-operand ops
/// use `b`. Lane-crossing ops (shuffle, getlane) are handled by the
/// executor and return `a` here.
pub fn lane_op(op: ArithOp, a: u32, b: u32) -> u32 {
    let sa = a as i32;
    let sb = b as i32;
    match op {
        ArithOp::Or => a | b,
        ArithOp::And => a & b,
        ArithOp::Xor => a ^ b,
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::MulLow => a.wrapping_mul(b),
        ArithOp::MulHighU => ((a as u64 * b as u64) >> 32) as u32,
        ArithOp::MulHighI => ((sa as i64 * sb as i64) >> 32) as u32,
        ArithOp::Ashr => (sa >> (b & 31)) as u32,
        ArithOp::Shr => a >> (b & 31),
        ArithOp::Shl => a << (b & 31),
        ArithOp::Clz => b.leading_zeros(),
        ArithOp::Ctz => b.trailing_zeros(),
        ArithOp::Move => b,
        ArithOp::CmpEq => (a == b) as u32,
        ArithOp::CmpNe => (a != b) as u32,
        ArithOp::CmpGt => (sa > sb) as u32,
        ArithOp::CmpGe => (sa >= sb) as u32,
        ArithOp::CmpLt => (sa < sb) as u32,
        ArithOp::CmpLe => (sa <= sb) as u32,
        ArithOp::CmpGtU => (a > b) as u32,
        ArithOp::CmpGeU => (a >= b) as u32,
        ArithOp::CmpLtU => (a < b) as u32,
        ArithOp::CmpLeU => (a <= b) as u32,
        ArithOp::Ftoi => f(b) as i32 as u32,
        ArithOp::Reciprocal => reciprocal(b),
        ArithOp::Sext8 => b as u8 as i8 as i32 as u32,
        ArithOp::Sext16 => b as u16 as i16 as i32 as u32,
        ArithOp::AddF => (f(a) + f(b)).to_bits(),
        ArithOp::SubF => (f(a) - f(b)).to_bits(),
        ArithOp::MulF => (f(a) * f(b)).to_bits(),
        ArithOp::Itof => (sb as f32).to_bits(),
        ArithOp::CmpGtF => (f(a) > f(b)) as u32,
        ArithOp::CmpGeF => (f(a) >= f(b)) as u32,
        ArithOp::CmpLtF => (f(a) < f(b)) as u32,
        ArithOp::CmpLeF => (f(a) <= f(b)) as u32,
        ArithOp::CmpEqF => (f(a) == f(b)) as u32,
        ArithOp::CmpNeF => (f(a) != f(b)) as u32,
        ArithOp::Shuffle | ArithOp::GetLane => a,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ops_wrap() {
        assert_eq!(lane_op(ArithOp::Add, 0xffff_ffff, 2), 1);
        assert_eq!(lane_op(ArithOp::Sub, 0, 1), 0xffff_ffff);
        assert_eq!(lane_op(ArithOp::MulLow, 0x8000_0000, 2), 0);
        assert_eq!(lane_op(ArithOp::MulHighU, 0x8000_0000, 4), 2);
        assert_eq!(lane_op(ArithOp::MulHighI, (-2i32) as u32, 0x8000_0000), 1);
    }

    #[test]
    fn shifts_use_low_five_bits() {
        assert_eq!(lane_op(ArithOp::Shl, 1, 33), 2);
        assert_eq!(lane_op(ArithOp::Shr, 0x8000_0000, 31), 1);
        assert_eq!(lane_op(ArithOp::Ashr, 0x8000_0000, 4), 0xf800_0000);
    }

    #[test]
    fn bit_counts_and_sign_extension() {
        assert_eq!(lane_op(ArithOp::Clz, 0, 0x0001_0000), 15);
        assert_eq!(lane_op(ArithOp::Ctz, 0, 0x0001_0000), 16);
        assert_eq!(lane_op(ArithOp::Clz, 0, 0), 32);
        assert_eq!(lane_op(ArithOp::Sext8, 0, 0x80), 0xffff_ff80);
        assert_eq!(lane_op(ArithOp::Sext16, 0, 0x7fff), 0x7fff);
    }

    #[test]
    fn signed_and_unsigned_compares_differ() {
        assert_eq!(lane_op(ArithOp::CmpGt, 0xffff_ffff, 1), 0);
        assert_eq!(lane_op(ArithOp::CmpGtU, 0xffff_ffff, 1), 1);
        assert_eq!(lane_op(ArithOp::CmpLe, 3, 3), 1);
    }

    #[test]
    fn float_ops() {
        let two = 2.0f32.to_bits();
        let half = 0.5f32.to_bits();
        assert_eq!(f(lane_op(ArithOp::AddF, two, half)), 2.5);
        assert_eq!(f(lane_op(ArithOp::MulF, two, half)), 1.0);
        assert_eq!(lane_op(ArithOp::Ftoi, 0, (-3.75f32).to_bits()), (-3i32) as u32);
        assert_eq!(f(lane_op(ArithOp::Itof, 0, (-7i32) as u32)), -7.0);
        assert_eq!(f(lane_op(ArithOp::Reciprocal, 0, two)), 0.5);
        assert_eq!(lane_op(ArithOp::CmpNeF, f32::NAN.to_bits(), f32::NAN.to_bits()), 1);
        assert_eq!(lane_op(ArithOp::CmpEqF, f32::NAN.to_bits(), f32::NAN.to_bits()), 0);
    }
}

//! Width-generic integer ALU helpers shared by the one- and two-byte
//! opcode tables. Every helper
//! here both computes the truncated result *and* records a
//! `lazyflags::FlagsDescriptor`, so callers never touch `EFLAGS` directly.

use crate::lazyflags::{FlagOp, FlagsDescriptor, LazyFlags};
use aero86_types::Eflags;

pub const ARITH_MASK: Eflags = Eflags::from_bits_truncate(
    Eflags::CF.bits() | Eflags::PF.bits() | Eflags::AF.bits() | Eflags::ZF.bits() | Eflags::SF.bits() | Eflags::OF.bits(),
);

pub const LOGIC_MASK: Eflags = ARITH_MASK; // AND/OR/XOR own the same six bits; CF/OF are simply forced to 0.

fn truncate(v: u32, width: u8) -> u32 {
    match width {
        8 => v & 0xFF,
        16 => v & 0xFFFF,
        _ => v,
    }
}

fn record(lazy: &mut LazyFlags, op: FlagOp, dst: u32, dst2: u32, src1: u32, src2: u32, width: u8, mask: Eflags) {
    lazy.record(FlagsDescriptor {
            op,
            dst,
            dst2,
            src1,
            src2,
            width,
            mask,
    });
}

pub fn add(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> u32 {
    let dst = truncate(a.wrapping_add(b), width);
    record(lazy, FlagOp::Add, dst, 0, a, b, width, ARITH_MASK);
    dst
}

pub fn adc(lazy: &mut LazyFlags, width: u8, a: u32, b: u32, carry_in: bool) -> u32 {
    let b2 = b.wrapping_add(carry_in as u32);
    // Carry computation needs the true (pre-truncation) sum including the
    // carry-in folded into `src2`, matching `FlagsDescriptor::cf`'s ADC arm.
    let dst = truncate(a.wrapping_add(b).wrapping_add(carry_in as u32), width);
    record(lazy, FlagOp::Adc, dst, 0, a, b2, width, ARITH_MASK);
    dst
}

pub fn sub(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> u32 {
    let dst = truncate(a.wrapping_sub(b), width);
    record(lazy, FlagOp::Sub, dst, 0, a, b, width, ARITH_MASK);
    dst
}

pub fn sbb(lazy: &mut LazyFlags, width: u8, a: u32, b: u32, carry_in: bool) -> u32 {
    let b2 = b.wrapping_add(carry_in as u32);
    let dst = truncate(a.wrapping_sub(b2), width);
    record(lazy, FlagOp::Sbb, dst, 0, a, b2, width, ARITH_MASK);
    dst
}

/// `CMP` / flag-only `SUB`: records flags without the caller needing to
/// keep the (discarded) result.
pub fn cmp(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) {
    sub(lazy, width, a, b);
}

pub fn and(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> u32 {
    let dst = truncate(a & b, width);
    record(lazy, FlagOp::And, dst, 0, a, b, width, LOGIC_MASK);
    dst
}

pub fn or(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> u32 {
    let dst = truncate(a | b, width);
    record(lazy, FlagOp::Or, dst, 0, a, b, width, LOGIC_MASK);
    dst
}

pub fn xor(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> u32 {
    let dst = truncate(a ^ b, width);
    record(lazy, FlagOp::Xor, dst, 0, a, b, width, LOGIC_MASK);
    dst
}

pub fn test(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) {
    and(lazy, width, a, b);
}

pub fn inc(lazy: &mut LazyFlags, width: u8, a: u32) -> u32 {
    let dst = truncate(a.wrapping_add(1), width);
    let op = match width {
        8 => FlagOp::Inc8,
        16 => FlagOp::Inc16,
        _ => FlagOp::Inc32,
    };
    // INC/DEC do not touch CF.
    let mask = ARITH_MASK & !Eflags::CF;
    record(lazy, op, dst, 0, a, 1, width, mask);
    dst
}

pub fn dec(lazy: &mut LazyFlags, width: u8, a: u32) -> u32 {
    let dst = truncate(a.wrapping_sub(1), width);
    let op = match width {
        8 => FlagOp::Dec8,
        16 => FlagOp::Dec16,
        _ => FlagOp::Dec32,
    };
    let mask = ARITH_MASK & !Eflags::CF;
    record(lazy, op, dst, 0, a, 1, width, mask);
    dst
}

pub fn neg(lazy: &mut LazyFlags, width: u8, a: u32) -> u32 {
    let dst = truncate(0u32.wrapping_sub(a), width);
    let op = match width {
        8 => FlagOp::Neg8,
        16 => FlagOp::Neg16,
        _ => FlagOp::Neg32,
    };
    record(lazy, op, dst, 0, 0, a, width, ARITH_MASK);
    dst
}

pub fn not(_lazy: &mut LazyFlags, width: u8, a: u32) -> u32 {
    // NOT does not affect any flag.
    truncate(!a, width)
}

pub fn mul(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> (u32, u32) {
    let full = (a as u64) * (b as u64);
    let (lo, hi) = match width {
        8 => (full as u32 & 0xFF, (full >> 8) as u32 & 0xFF),
        16 => (full as u32 & 0xFFFF, (full >> 16) as u32 & 0xFFFF),
        _ => (full as u32, (full >> 32) as u32),
    };
    let op = match width {
        8 => FlagOp::Mul8,
        16 => FlagOp::Mul16,
        _ => FlagOp::Mul32,
    };
    record(lazy, op, lo, hi, a, b, width, Eflags::CF | Eflags::OF | Eflags::PF | Eflags::ZF | Eflags::SF | Eflags::AF);
    (lo, hi)
}

pub fn imul(lazy: &mut LazyFlags, width: u8, a: u32, b: u32) -> (u32, u32) {
    let sign_extend = |v: u32| -> i64 {
        match width {
            8 => (v as u8 as i8) as i64,
            16 => (v as u16 as i16) as i64,
            _ => (v as i32) as i64,
        }
    };
    let full = sign_extend(a) * sign_extend(b);
    let (lo, hi) = match width {
        8 => (full as u32 & 0xFF, ((full >> 8) as u32) & 0xFF),
        16 => (full as u32 & 0xFFFF, ((full >> 16) as u32) & 0xFFFF),
        _ => (full as u32, (full >> 32) as u32),
    };
    let op = match width {
        8 => FlagOp::Imul8,
        16 => FlagOp::Imul16,
        _ => FlagOp::Imul32,
    };
    record(lazy, op, lo, hi, a, b, width, Eflags::CF | Eflags::OF);
    (lo, hi)
}

/// `SHL`/`SAL`. `count` is already masked to `0x1F` by the caller; a count of 0 leaves flags untouched.
pub fn shl(lazy: &mut LazyFlags, width: u8, a: u32, count: u32) -> u32 {
    if count == 0 {
        return truncate(a, width);
    }
    let eff = count.min(width as u32 + 1);
    let dst = truncate(a.wrapping_shl(eff), width);
    record(lazy, FlagOp::Shl, dst, 0, a, count, width, ARITH_MASK);
    dst
}

pub fn shr(lazy: &mut LazyFlags, width: u8, a: u32, count: u32) -> u32 {
    if count == 0 {
        return truncate(a, width);
    }
    let a = truncate(a, width);
    let dst = if count >= width as u32 { 0 } else { a >> count };
    record(lazy, FlagOp::Shr, dst, 0, a, count, width, ARITH_MASK);
    dst
}

pub fn sar(lazy: &mut LazyFlags, width: u8, a: u32, count: u32) -> u32 {
    if count == 0 {
        return truncate(a, width);
    }
    let a = truncate(a, width);
    let signed = match width {
        8 => (a as u8 as i8) as i64,
        16 => (a as u16 as i16) as i64,
        _ => (a as i32) as i64,
    };
    let shifted = signed >> count.min(63);
    let dst = truncate(shifted as u32, width);
    record(lazy, FlagOp::Sar, dst, 0, a, count, width, ARITH_MASK);
    dst
}

/// `ROL`: rotate-left. Rotates do not use the lazy-flags descriptor table
/// — CF/OF are set
/// directly here, matching the reference's narrower rotate handling.
pub fn rol(stored: &mut Eflags, width: u8, a: u32, count: u32) -> u32 {
    let count = count % width as u32;
    let a = truncate(a, width);
    if count == 0 {
        return a;
    }
    let dst = truncate(a.rotate_left(count).rotate_right(32 - width as u32), width);
    let cf = dst & 1 != 0;
    stored.set(Eflags::CF, cf);
    let of = (dst >> (width - 1)) & 1 != 0;
    stored.set(Eflags::OF, of ^ cf);
    dst
}

pub fn ror(stored: &mut Eflags, width: u8, a: u32, count: u32) -> u32 {
    let count = count % width as u32;
    let a = truncate(a, width);
    if count == 0 {
        return a;
    }
    let dst = truncate(a.rotate_right(count).rotate_right(32 - width as u32), width) & ((1u64 << width) - 1) as u32;
    let msb = (dst >> (width - 1)) & 1 != 0;
    stored.set(Eflags::CF, msb);
    let second_msb = (dst >> (width - 2).max(0)) & 1 != 0;
    stored.set(Eflags::OF, msb ^ second_msb);
    dst
}

pub fn rcl(stored: &mut Eflags, width: u8, a: u32, count: u32, carry_in: bool) -> u32 {
    let modulus = width as u32 + 1;
    let count = count % modulus;
    let mut val = (truncate(a, width) as u64) | ((carry_in as u64) << width);
    for _ in 0..count {
        let top = (val >> width) & 1;
        val = ((val << 1) | top) & ((1u64 << (width + 1)) - 1);
    }
    let cf = (val >> width) & 1 != 0;
    stored.set(Eflags::CF, cf);
    let dst = truncate(val as u32, width);
    if count == 1 {
        let of = ((dst >> (width - 1)) & 1 != 0) ^ cf;
        stored.set(Eflags::OF, of);
    }
    dst
}

pub fn rcr(stored: &mut Eflags, width: u8, a: u32, count: u32, carry_in: bool) -> u32 {
    let modulus = width as u32 + 1;
    let count = count % modulus;
    let mut val = (truncate(a, width) as u64) | ((carry_in as u64) << width);
    for _ in 0..count {
        let bottom = val & 1;
        val = (val >> 1) | (bottom << width);
    }
    let cf = (val >> width) & 1 != 0;
    let dst = truncate(val as u32, width);
    if count >= 1 {
        if count == 1 {
            let of = ((dst >> (width - 1)) & 1 != 0) ^ ((a >> (width - 1)) & 1 != 0);
            stored.set(Eflags::OF, of);
        }
        stored.set(Eflags::CF, cf);
    }
    dst
}

/// `SHLD r/m, r, count`. `count` is already masked to `0x1F` by the caller,
/// which for a 16-bit operand can still exceed `width` (17..31). That case is
/// undocumented by Intel; the reference core swaps `dst`/`src` and continues
/// with `count - width` rather than clamping the count to `width`.
pub fn shld(lazy: &mut LazyFlags, width: u8, dst: u32, src: u32, count: u32) -> u32 {
    if count == 0 {
        return truncate(dst, width);
    }
    let bits = width as u32;
    let (mut x, mut y) = (truncate(dst, width) as u64, truncate(src, width) as u64);
    let mut count = count;
    if bits < count {
        core::mem::swap(&mut x, &mut y);
        count -= bits;
    }
    let result = truncate(((x << count) | (y >> (bits - count))) as u32, width);
    let dst2 = truncate(((x << (count - 1)) | (y >> (bits - (count - 1)))) as u32, width);
    record(lazy, FlagOp::Shld, result, dst2, dst, count, width, ARITH_MASK);
    result
}

/// `SHRD r/m, r, count`; same undocumented swap-and-recount behavior as
/// `shld` above for a 16-bit operand with a count of 17..31.
pub fn shrd(lazy: &mut LazyFlags, width: u8, dst: u32, src: u32, count: u32) -> u32 {
    if count == 0 {
        return truncate(dst, width);
    }
    let bits = width as u32;
    let (mut x, mut y) = (truncate(dst, width) as u64, truncate(src, width) as u64);
    let mut count = count;
    if bits < count {
        core::mem::swap(&mut x, &mut y);
        count -= bits;
    }
    let result = truncate(((x >> count) | (y << (bits - count))) as u32, width);
    let dst2 = truncate(((x >> (count - 1)) | (y << (bits - (count - 1)))) as u32, width);
    record(lazy, FlagOp::Shrd, result, dst2, dst, count, width, ARITH_MASK);
    result
}

pub fn bsf(lazy: &mut LazyFlags, width: u8, a: u32) -> Option<u32> {
    let a = truncate(a, width);
    if a == 0 {
        record(lazy, FlagOp::Bsf, 0, 0, a, 0, width, Eflags::ZF);
        return None;
    }
    record(lazy, FlagOp::Bsf, 1, 0, a, 0, width, Eflags::ZF);
    Some(a.trailing_zeros())
}

pub fn bsr(lazy: &mut LazyFlags, width: u8, a: u32) -> Option<u32> {
    let a = truncate(a, width);
    if a == 0 {
        record(lazy, FlagOp::Bsr, 0, 0, a, 0, width, Eflags::ZF);
        return None;
    }
    record(lazy, FlagOp::Bsr, 1, 0, a, 0, width, Eflags::ZF);
    Some(31 - a.leading_zeros())
}

pub fn sign_extend(v: u32, from_width: u8) -> u32 {
    match from_width {
        8 => (v as u8 as i8) as i32 as u32,
        16 => (v as u16 as i16) as i32 as u32,
        _ => v,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_div_quirk_inputs_are_not_alu_affected() {
        // Sanity: ALU helpers don't special-case DIV; that quirk lives in
        // execute.rs's DIV/IDIV implementation.
        let mut lazy = LazyFlags::default();
        assert_eq!(sub(&mut lazy, 8, 5, 2), 3);
    }

    #[test]
    fn shl_by_zero_leaves_result_but_no_flag_mutation_path() {
        let mut lazy = LazyFlags::default();
        assert_eq!(shl(&mut lazy, 8, 0xFF, 0), 0xFF);
    }

    #[test]
    fn rol_8bit_wraps_top_bit_into_cf() {
        let mut stored = Eflags::empty();
        let r = rol(&mut stored, 8, 0x80, 1);
        assert_eq!(r, 0x01);
        assert!(stored.contains(Eflags::CF));
    }

    #[test]
    fn bsr_returns_highest_set_bit_index() {
        let mut lazy = LazyFlags::default();
        assert_eq!(bsr(&mut lazy, 32, 0b1001_0000), Some(7));
    }
}

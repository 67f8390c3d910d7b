//! The decoder/executor: fetches prefixes, the opcode, and
//! any ModR/M+SIB+displacement+immediate bytes, then performs the
//! instruction's effect. One `decode_and_execute` call retires exactly one
//! instruction or returns the `Exception` it raised.

use crate::alu;
use crate::cpu::{Cond, Cpu};
use crate::decode::{default_segment_16, default_segment_32, ModRmByte, Prefixes, RepPrefix, RmOperand, Sib};
use crate::exception::Exception;
use crate::io::PortIo;
use crate::regs::{Gpr, SegReg};
use aero86_types::{Eflags, Selector};

#[cfg(feature = "fpu")]
use crate::fpu;

pub(crate) fn sign_ext8(v: u8) -> u32 {
    v as i8 as i32 as u32
}
pub(crate) fn sign_ext16(v: u16) -> u32 {
    v as i16 as i32 as u32
}

impl Cpu {
    pub(crate) fn resolve_modrm(&mut self, addr_size32: bool, seg_override: Option<SegReg>) -> Result<(ModRmByte, RmOperand), Exception> {
        let byte = self.fetch_u8()?;
        let modrm = ModRmByte::decode(byte);
        if modrm.is_register_direct() {
            return Ok((modrm, RmOperand::Reg(modrm.rm)));
        }
        if addr_size32 {
            let mut seg = default_segment_32(modrm, None);
            let base_val: u32;
            let mut index_val = 0u32;
            if modrm.rm == 4 {
                let sib_byte = self.fetch_u8()?;
                let sib = Sib::decode(sib_byte);
                seg = default_segment_32(modrm, Some(sib));
                if sib.index != 4 {
                    index_val = self.read_gpr32(sib.index) << sib.scale;
                }
                if sib.base == 5 && modrm.md == 0 {
                    base_val = self.fetch_u32()?;
                } else {
                    base_val = self.read_gpr32(sib.base);
                }
            } else if modrm.rm == 5 && modrm.md == 0 {
                base_val = self.fetch_u32()?;
            } else {
                base_val = self.read_gpr32(modrm.rm);
            }
            let mut offset = base_val.wrapping_add(index_val);
            match modrm.md {
                1 => offset = offset.wrapping_add(sign_ext8(self.fetch_u8()?)),
                2 => offset = offset.wrapping_add(self.fetch_u32()?),
                _ => {}
            }
            let seg = seg_override.unwrap_or(seg);
            Ok((modrm, RmOperand::Mem { seg, offset }))
        } else {
            let (base_reg, index_reg): (Option<Gpr>, Option<Gpr>) = match modrm.rm {
                0 => (Some(Gpr::Ebx), Some(Gpr::Esi)),
                1 => (Some(Gpr::Ebx), Some(Gpr::Edi)),
                2 => (Some(Gpr::Ebp), Some(Gpr::Esi)),
                3 => (Some(Gpr::Ebp), Some(Gpr::Edi)),
                4 => (Some(Gpr::Esi), None),
                5 => (Some(Gpr::Edi), None),
                6 => (Some(Gpr::Ebp), None),
                _ => (Some(Gpr::Ebx), None),
            };
            let default_seg = default_segment_16(modrm.rm, modrm.md);
            let mut offset: u32;
            if modrm.rm == 6 && modrm.md == 0 {
                offset = self.fetch_u16()? as u32;
            } else {
                offset = 0;
                if let Some(b) = base_reg {
                    offset = offset.wrapping_add(self.regs.gpr(b) & 0xFFFF);
                }
                if let Some(i) = index_reg {
                    offset = offset.wrapping_add(self.regs.gpr(i) & 0xFFFF);
                }
                match modrm.md {
                    1 => offset = offset.wrapping_add(sign_ext8(self.fetch_u8()?)),
                    2 => offset = offset.wrapping_add(sign_ext16(self.fetch_u16()?)),
                    _ => {}
                }
            }
            offset &= 0xFFFF;
            let seg = seg_override.unwrap_or(default_seg);
            Ok((modrm, RmOperand::Mem { seg, offset }))
        }
    }

    pub(crate) fn read_rm(&mut self, rm: RmOperand, width: u8) -> Result<u32, Exception> {
        match rm {
            RmOperand::Reg(r) => Ok(self.read_gpr(r, width)),
            RmOperand::Mem { seg, offset } => self.read_mem(seg, offset, width),
        }
    }

    pub(crate) fn write_rm(&mut self, rm: RmOperand, width: u8, val: u32) -> Result<(), Exception> {
        match rm {
            RmOperand::Reg(r) => {
                self.write_gpr(r, width, val);
                Ok(())
            }
            RmOperand::Mem { seg, offset } => self.write_mem(seg, offset, width, val),
        }
    }

    pub(crate) fn rm_addr(&mut self, rm: RmOperand, reg_width: u8) -> Result<(SegReg, u32), Exception> {
        // Used by LEA/LGDT-style instructions that need the *address*, not
        // a load; register-direct operands are invalid there (#UD upstream
        // should have been detected by the caller, but defensively pick DS).
        match rm {
            RmOperand::Mem { seg, offset } => Ok((seg, offset)),
            RmOperand::Reg(_) => {
                let _ = reg_width;
                Err(Exception::InvalidOpcode)
            }
        }
    }

    fn alu_apply(&mut self, family: u8, width: u8, a: u32, b: u32) -> u32 {
        match family & 7 {
            0 => alu::add(&mut self.lazy, width, a, b),
            1 => alu::or(&mut self.lazy, width, a, b),
            2 => {
                let cf = self.lazy.get_cf(self.regs.eflags);
                alu::adc(&mut self.lazy, width, a, b, cf)
            }
            3 => {
                let cf = self.lazy.get_cf(self.regs.eflags);
                alu::sbb(&mut self.lazy, width, a, b, cf)
            }
            4 => alu::and(&mut self.lazy, width, a, b),
            5 => alu::sub(&mut self.lazy, width, a, b),
            6 => alu::xor(&mut self.lazy, width, a, b),
            _ => {
                alu::cmp(&mut self.lazy, width, a, b);
                a
            }
        }
    }

    fn exec_alu_family(&mut self, family: u8, form: u8, op_size32: bool, seg_override: Option<SegReg>) -> Result<(), Exception> {
        let addr32 = self.address_size_32(false);
        match form {
            0 | 1 => {
                let width = if form == 0 { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_override)?;
                let a = self.read_rm(rm, width)?;
                let b = self.read_gpr(modrm.reg, width);
                let r = self.alu_apply(family, width, a, b);
                if family & 7 != 7 {
                    self.write_rm(rm, width, r)?;
                }
            }
            2 | 3 => {
                let width = if form == 2 { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_override)?;
                let a = self.read_gpr(modrm.reg, width);
                let b = self.read_rm(rm, width)?;
                let r = self.alu_apply(family, width, a, b);
                if family & 7 != 7 {
                    self.write_gpr(modrm.reg, width, r);
                }
            }
            4 => {
                let imm = self.fetch_u8()? as u32;
                let a = self.read_gpr8(0);
                let r = self.alu_apply(family, 8, a as u32, imm);
                if family & 7 != 7 {
                    self.write_gpr8(0, r as u8);
                }
            }
            _ => {
                let width = if op_size32 { 32 } else { 16 };
                let imm = self.fetch_immediate(width)?;
                let a = self.read_gpr32(0) & if width == 32 { u32::MAX } else { 0xFFFF };
                let r = self.alu_apply(family, width, a, imm);
                if family & 7 != 7 {
                    self.write_gpr(0, width, r);
                }
            }
        }
        Ok(())
    }

    fn exec_group1(&mut self, width: u8, imm_width: u8, modrm: ModRmByte, rm: RmOperand) -> Result<(), Exception> {
        let imm_raw = self.fetch_immediate(imm_width)?;
        let imm = if imm_width == 8 { sign_ext8(imm_raw as u8) } else { imm_raw };
        let a = self.read_rm(rm, width)?;
        let r = self.alu_apply(modrm.reg, width, a, imm);
        if modrm.reg & 7 != 7 {
            self.write_rm(rm, width, r)?;
        }
        Ok(())
    }

    fn shift_count(&mut self, reg: u8, cl: bool) -> Result<u32, Exception> {
        let _ = reg;
        if cl {
            Ok(self.read_gpr8(1) as u32 & 0x1F)
        } else {
            Ok(self.fetch_u8()? as u32 & 0x1F)
        }
    }

    fn exec_group2(&mut self, width: u8, modrm: ModRmByte, rm: RmOperand, count: u32) -> Result<(), Exception> {
        let a = self.read_rm(rm, width)?;
        let cf = self.lazy.get_cf(self.regs.eflags);
        let r = match modrm.reg & 7 {
            0 => alu::rol(&mut self.regs.eflags, width, a, count),
            1 => alu::ror(&mut self.regs.eflags, width, a, count),
            2 => alu::rcl(&mut self.regs.eflags, width, a, count, cf),
            3 => alu::rcr(&mut self.regs.eflags, width, a, count, cf),
            4 | 6 => alu::shl(&mut self.lazy, width, a, count),
            5 => alu::shr(&mut self.lazy, width, a, count),
            _ => alu::sar(&mut self.lazy, width, a, count),
        };
        self.write_rm(rm, width, r)
    }

    fn exec_group3(&mut self, width: u8, modrm: ModRmByte, rm: RmOperand) -> Result<(), Exception> {
        match modrm.reg & 7 {
            0 | 1 => {
                let imm = self.fetch_immediate(width)?;
                let a = self.read_rm(rm, width)?;
                alu::test(&mut self.lazy, width, a, imm);
            }
            2 => {
                let a = self.read_rm(rm, width)?;
                let r = alu::not(&mut self.lazy, width, a);
                self.write_rm(rm, width, r)?;
            }
            3 => {
                let a = self.read_rm(rm, width)?;
                let r = alu::neg(&mut self.lazy, width, a);
                self.write_rm(rm, width, r)?;
            }
            4 => {
                let a = self.read_gpr(0, width);
                let b = self.read_rm(rm, width)?;
                let (lo, hi) = alu::mul(&mut self.lazy, width, a, b);
                self.write_mul_result(width, lo, hi);
            }
            5 => {
                let a = self.read_gpr(0, width);
                let b = self.read_rm(rm, width)?;
                let (lo, hi) = alu::imul(&mut self.lazy, width, a, b);
                self.write_mul_result(width, lo, hi);
            }
            6 => self.exec_div(width, rm, false)?,
            _ => self.exec_div(width, rm, true)?,
        }
        Ok(())
    }

    fn write_mul_result(&mut self, width: u8, lo: u32, hi: u32) {
        match width {
            8 => self.write_gpr16(0, ((hi as u16) << 8) | (lo as u16 & 0xFF)),
            16 => {
                self.write_gpr16(0, lo as u16);
                self.write_gpr16(2, hi as u16);
            }
            _ => {
                self.write_gpr32(0, lo);
                self.write_gpr32(2, hi);
            }
        }
    }

    /// `DIV`/`IDIV`. Reproduces two documented compatibility quirks some
    /// early boot code probes for: an unsigned byte-DIV of `5/2` forces
    /// ZF=1; an unsigned word-DIV of `0x5555/2` forces ZF=0 — both
    /// independent of whatever the quotient/remainder would otherwise
    /// leave in the lazy descriptor.
    fn exec_div(&mut self, width: u8, rm: RmOperand, signed: bool) -> Result<(), Exception> {
        let divisor = self.read_rm(rm, width)?;
        match width {
            8 => {
                let dividend = self.read_gpr16(0) as u32;
                if divisor == 0 {
                    return Err(Exception::DivideError);
                }
                if signed {
                    let d = dividend as i16 as i32;
                    let v = divisor as u8 as i8 as i32;
                    let q = d / v;
                    let r = d % v;
                    if !(-128..=127).contains(&q) {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr8(0, q as u8);
                    self.write_gpr8(4, r as u8);
                } else {
                    let q = dividend / divisor;
                    let r = dividend % divisor;
                    if q > 0xFF {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr8(0, q as u8);
                    self.write_gpr8(4, r as u8);
                    if dividend == 5 && divisor == 2 {
                        self.lazy.refresh_flags(&mut self.regs.eflags);
                        self.regs.eflags.insert(Eflags::ZF);
                    }
                }
            }
            16 => {
                let dividend = ((self.read_gpr16(2) as u32) << 16) | self.read_gpr16(0) as u32;
                if divisor == 0 {
                    return Err(Exception::DivideError);
                }
                if signed {
                    let d = dividend as i32;
                    let v = divisor as u16 as i16 as i32;
                    let q = d / v;
                    let r = d % v;
                    if !(-32768..=32767).contains(&q) {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr16(0, q as u16);
                    self.write_gpr16(2, r as u16);
                } else {
                    let q = dividend / divisor;
                    let r = dividend % divisor;
                    if q > 0xFFFF {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr16(0, q as u16);
                    self.write_gpr16(2, r as u16);
                    if dividend == 0x5555 && divisor == 2 {
                        self.lazy.refresh_flags(&mut self.regs.eflags);
                        self.regs.eflags.remove(Eflags::ZF);
                    }
                }
            }
            _ => {
                let dividend = ((self.read_gpr32(2) as u64) << 32) | self.read_gpr32(0) as u64;
                if divisor == 0 {
                    return Err(Exception::DivideError);
                }
                if signed {
                    let d = dividend as i64;
                    let v = divisor as i32 as i64;
                    let q = d / v;
                    let r = d % v;
                    if !(i32::MIN as i64..=i32::MAX as i64).contains(&q) {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr32(0, q as u32);
                    self.write_gpr32(2, r as u32);
                } else {
                    let q = dividend / divisor as u64;
                    let r = dividend % divisor as u64;
                    if q > u32::MAX as u64 {
                        return Err(Exception::DivideError);
                    }
                    self.write_gpr32(0, q as u32);
                    self.write_gpr32(2, r as u32);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn jump_rel(&mut self, rel: u32, op_size32: bool) {
        let new_eip = self.regs.eip.wrapping_add(rel);
        self.set_eip(new_eip, op_size32 || self.regs.code_size_32());
    }

    fn string_seg(&self, prefixes: &Prefixes) -> SegReg {
        prefixes.segment_override.unwrap_or(SegReg::Ds)
    }

    fn advance_string_ptr(&mut self, reg: Gpr, width: u8, addr32: bool) {
        let df = self.regs.eflags.contains(Eflags::DF);
        let delta = (width / 8) as i32 * if df { -1 } else { 1 };
        let cur = self.regs.gpr(reg);
        let next = if addr32 {
            cur.wrapping_add(delta as u32)
        } else {
            (cur & 0xFFFF_0000) | ((cur as u16).wrapping_add(delta as u16) as u32)
        };
        self.regs.set_gpr(reg, next);
    }

    fn count_reg_value(&self, addr32: bool) -> u32 {
        if addr32 {
            self.regs.gpr(Gpr::Ecx)
        } else {
            self.regs.gpr(Gpr::Ecx) & 0xFFFF
        }
    }

    fn set_count_reg(&mut self, addr32: bool, v: u32) {
        let cur = self.regs.gpr(Gpr::Ecx);
        let merged = if addr32 { v } else { (cur & 0xFFFF_0000) | (v & 0xFFFF) };
        self.regs.set_gpr(Gpr::Ecx, merged);
    }

    /// `MOVS`/`CMPS`/`STOS`/`LODS`/`SCAS`/`INS`/`OUTS`, with or without a
    /// `REP`/`REPNE` prefix. One call performs the whole repeated operation
    /// rather than one iteration per `step`, so a repeated string op
    /// retires as a single instruction.
    #[allow(clippy::too_many_arguments)]
    fn exec_string_op<IO: PortIo>(&mut self, opcode: u8, prefixes: &Prefixes, op_size32: bool, addr32: bool, io: &mut IO) -> Result<(), Exception> {
        let width = match opcode & 1 {
            0 => 8,
            _ => {
                if op_size32 {
                    32
                } else {
                    16
                }
            }
        };
        let seg = self.string_seg(prefixes);
        let rep = prefixes.rep;
        let is_scas_cmps = matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF);

        loop {
            if rep.is_some() && self.count_reg_value(addr32) == 0 {
                break;
            }
            match opcode {
                0xA4 | 0xA5 => {
                    let si = self.regs.gpr(Gpr::Esi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let di = self.regs.gpr(Gpr::Edi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let v = self.read_mem(seg, si, width)?;
                    self.write_mem(SegReg::Es, di, width, v)?;
                    self.advance_string_ptr(Gpr::Esi, width, addr32);
                    self.advance_string_ptr(Gpr::Edi, width, addr32);
                }
                0xA6 | 0xA7 => {
                    let si = self.regs.gpr(Gpr::Esi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let di = self.regs.gpr(Gpr::Edi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let a = self.read_mem(seg, si, width)?;
                    let b = self.read_mem(SegReg::Es, di, width)?;
                    alu::cmp(&mut self.lazy, width, a, b);
                    self.advance_string_ptr(Gpr::Esi, width, addr32);
                    self.advance_string_ptr(Gpr::Edi, width, addr32);
                }
                0xAA | 0xAB => {
                    let di = self.regs.gpr(Gpr::Edi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let v = self.read_gpr(0, width);
                    self.write_mem(SegReg::Es, di, width, v)?;
                    self.advance_string_ptr(Gpr::Edi, width, addr32);
                }
                0xAC | 0xAD => {
                    let si = self.regs.gpr(Gpr::Esi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let v = self.read_mem(seg, si, width)?;
                    self.write_gpr(0, width, v);
                    self.advance_string_ptr(Gpr::Esi, width, addr32);
                }
                0xAE | 0xAF => {
                    let di = self.regs.gpr(Gpr::Edi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let a = self.read_gpr(0, width);
                    let b = self.read_mem(SegReg::Es, di, width)?;
                    alu::cmp(&mut self.lazy, width, a, b);
                    self.advance_string_ptr(Gpr::Edi, width, addr32);
                }
                0x6C | 0x6D => {
                    let port = self.read_gpr16(2);
                    let di = self.regs.gpr(Gpr::Edi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let v = match width {
                        8 => io.in8(port) as u32,
                        16 => io.in16(port) as u32,
                        _ => io.in32(port),
                    };
                    self.write_mem(SegReg::Es, di, width, v)?;
                    self.advance_string_ptr(Gpr::Edi, width, addr32);
                }
                0x6E | 0x6F => {
                    let port = self.read_gpr16(2);
                    let si = self.regs.gpr(Gpr::Esi) & if addr32 { u32::MAX } else { 0xFFFF };
                    let v = self.read_mem(seg, si, width)?;
                    match width {
                        8 => io.out8(port, v as u8),
                        16 => io.out16(port, v as u16),
                        _ => io.out32(port, v),
                    }
                    self.advance_string_ptr(Gpr::Esi, width, addr32);
                }
                _ => unreachable!(),
            }

            if let Some(rp) = rep {
                let c = self.count_reg_value(addr32).wrapping_sub(1);
                self.set_count_reg(addr32, c);
                if is_scas_cmps {
                    let zf = self.lazy.get_zf(self.regs.eflags);
                    let stop = match rp {
                        RepPrefix::Rep => !zf,
                        RepPrefix::Repne => zf,
                    };
                    if stop || c == 0 {
                        break;
                    }
                } else if c == 0 {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn decode_and_execute<IO: PortIo>(&mut self, io: &mut IO) -> Result<(), Exception> {
        let mut prefixes = Prefixes::default();
        loop {
            let b = self.fetch_u8()?;
            if !prefixes.consume(b) {
                return self.execute_opcode(b, prefixes, io);
            }
        }
    }

    fn execute_opcode<IO: PortIo>(&mut self, opcode: u8, prefixes: Prefixes, io: &mut IO) -> Result<(), Exception> {
        let op_size32 = self.operand_size_32(prefixes.operand_size_override);
        let addr32 = self.address_size_32(prefixes.address_size_override);
        let seg_ov = prefixes.segment_override;

        if opcode == 0x0F {
            let op2 = self.fetch_u8()?;
            return self.execute_0f(op2, prefixes, op_size32, addr32, io);
        }

        // Arithmetic family: ADD/OR/ADC/SBB/AND/SUB/XOR/CMP, forms 0..5.
        if opcode < 0x40 && (opcode & 7) <= 5 {
            let family = (opcode >> 3) & 7;
            let form = opcode & 7;
            self.exec_alu_family(family, form, op_size32, seg_ov)?;
            return Ok(());
        }

        match opcode {
            0x06 => self.push_seg(SegReg::Es, op_size32)?,
            0x07 => self.pop_seg(SegReg::Es)?,
            0x0E => self.push_seg(SegReg::Cs, op_size32)?,
            0x16 => self.push_seg(SegReg::Ss, op_size32)?,
            0x17 => self.pop_seg(SegReg::Ss)?,
            0x1E => self.push_seg(SegReg::Ds, op_size32)?,
            0x1F => self.pop_seg(SegReg::Ds)?,
            0x27 => self.daa(),
            0x2F => self.das(),
            0x37 => self.aaa(),
            0x3F => self.aas(),

            0x40..=0x47 => {
                let width = if op_size32 { 32 } else { 16 };
                let idx = opcode - 0x40;
                let v = self.read_gpr(idx, width);
                let r = alu::inc(&mut self.lazy, width, v);
                self.write_gpr(idx, width, r);
            }
            0x48..=0x4F => {
                let width = if op_size32 { 32 } else { 16 };
                let idx = opcode - 0x48;
                let v = self.read_gpr(idx, width);
                let r = alu::dec(&mut self.lazy, width, v);
                self.write_gpr(idx, width, r);
            }
            0x50..=0x57 => {
                let width = if op_size32 { 32 } else { 16 };
                let idx = opcode - 0x50;
                let v = self.read_gpr(idx, width);
                self.push(width, v)?;
            }
            0x58..=0x5F => {
                let width = if op_size32 { 32 } else { 16 };
                let idx = opcode - 0x58;
                let v = self.pop(width)?;
                self.write_gpr(idx, width, v);
            }
            0x60 => self.pusha(op_size32)?,
            0x61 => self.popa(op_size32)?,
            0x62 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let (seg, off) = self.rm_addr(rm, 0)?;
                let lower = self.read_mem(seg, off, width)?;
                let upper = self.read_mem(seg, off.wrapping_add(width as u32 / 8), width)?;
                let idx = self.read_gpr(modrm.reg, width);
                let (lo, hi, v) = if width == 32 {
                    (lower as i32 as i64, upper as i32 as i64, idx as i32 as i64)
                } else {
                    (lower as i16 as i64, upper as i16 as i64, idx as i16 as i64)
                };
                if v < lo || v > hi {
                    return Err(Exception::BoundRangeExceeded);
                }
            }
            0x63 => {
                if !self.regs.protected_mode() {
                    return Err(Exception::InvalidOpcode);
                }
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let dst = self.read_rm(rm, 16)? as u16;
                let src = self.read_gpr16(modrm.reg);
                self.flags();
                if (dst & 0b11) < (src & 0b11) {
                    let new = (dst & !0b11) | (src & 0b11);
                    self.write_rm(rm, 16, new as u32)?;
                    self.regs.eflags.insert(Eflags::ZF);
                } else {
                    self.regs.eflags.remove(Eflags::ZF);
                }
            }
            0x68 => {
                let width = if op_size32 { 32 } else { 16 };
                let imm = self.fetch_immediate(width)?;
                self.push(width, imm)?;
            }
            0x69 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let a = self.read_rm(rm, width)?;
                let imm = self.fetch_immediate(width)?;
                let (lo, _) = alu::imul(&mut self.lazy, width, a, imm);
                self.write_gpr(modrm.reg, width, lo);
            }
            0x6A => {
                let width = if op_size32 { 32 } else { 16 };
                let imm = sign_ext8(self.fetch_u8()?);
                self.push(width, imm)?;
            }
            0x6B => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let a = self.read_rm(rm, width)?;
                let imm = sign_ext8(self.fetch_u8()?);
                let (lo, _) = alu::imul(&mut self.lazy, width, a, imm);
                self.write_gpr(modrm.reg, width, lo);
            }
            0x6C..=0x6F => self.exec_string_op(opcode, &prefixes, op_size32, addr32, io)?,

            0x70..=0x7F => {
                let rel = sign_ext8(self.fetch_u8()?);
                if self.eval_cond(Cond::from_tttn(opcode & 0xF)) {
                    self.jump_rel(rel, false);
                }
            }

            0x80 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group1(8, 8, modrm, rm)?;
            }
            0x81 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group1(width, width, modrm, rm)?;
            }
            0x82 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group1(8, 8, modrm, rm)?;
            }
            0x83 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group1(width, 8, modrm, rm)?;
            }
            0x84 | 0x85 => {
                let width = if opcode == 0x84 { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let a = self.read_rm(rm, width)?;
                let b = self.read_gpr(modrm.reg, width);
                alu::test(&mut self.lazy, width, a, b);
            }
            0x86 | 0x87 => {
                let width = if opcode == 0x86 { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let a = self.read_rm(rm, width)?;
                let b = self.read_gpr(modrm.reg, width);
                self.write_rm(rm, width, b)?;
                self.write_gpr(modrm.reg, width, a);
            }
            0x88 | 0x89 => {
                let width = if opcode == 0x88 { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let v = self.read_gpr(modrm.reg, width);
                self.write_rm(rm, width, v)?;
            }
            0x8A | 0x8B => {
                let width = if opcode == 0x8A { 8 } else if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let v = self.read_rm(rm, width)?;
                self.write_gpr(modrm.reg, width, v);
            }
            0x8C => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let seg = seg_from_index(modrm.reg)?;
                let v = self.regs.seg(seg).selector.raw();
                self.write_rm(rm, if op_size32 { 32 } else { 16 }, v as u32)?;
            }
            0x8D => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let (_, offset) = self.rm_addr(rm, 0)?;
                self.write_gpr(modrm.reg, if op_size32 { 32 } else { 16 }, offset);
            }
            0x8E => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let seg = seg_from_index(modrm.reg)?;
                let v = self.read_rm(rm, 16)? as u16;
                if seg == SegReg::Ss {
                    self.load_ss(Selector(v))?;
                } else {
                    self.load_data_segment(seg, Selector(v))?;
                }
            }
            0x8F => {
                let width = if op_size32 { 32 } else { 16 };
                let (_, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let v = self.pop(width)?;
                self.write_rm(rm, width, v)?;
            }
            0x90 => {}
            0x91..=0x97 => {
                let width = if op_size32 { 32 } else { 16 };
                let idx = opcode - 0x90;
                let a = self.read_gpr(0, width);
                let b = self.read_gpr(idx, width);
                self.write_gpr(0, width, b);
                self.write_gpr(idx, width, a);
            }
            0x98 => {
                if op_size32 {
                    self.write_gpr32(0, sign_ext16(self.read_gpr16(0)));
                } else {
                    self.write_gpr16(0, self.read_gpr8(0) as i8 as i16 as u16);
                }
            }
            0x99 => {
                if op_size32 {
                    let v = self.read_gpr32(0) as i32;
                    self.write_gpr32(2, if v < 0 { u32::MAX } else { 0 });
                } else {
                    let v = self.read_gpr16(0) as i16;
                    self.write_gpr16(2, if v < 0 { 0xFFFF } else { 0 });
                }
            }
            0x9A => {
                let offset = self.fetch_immediate(if op_size32 { 32 } else { 16 })?;
                let sel = self.fetch_u16()?;
                self.far_call(Selector(sel), offset, op_size32)?;
            }
            0x9B => {}
            0x9C => {
                let width = if op_size32 { 32 } else { 16 };
                let f = self.flags().bits();
                self.push(width, f)?;
            }
            0x9D => {
                let width = if op_size32 { 32 } else { 16 };
                let v = self.pop(width)?;
                let cpl = self.regs.cpl;
                if self.regs.protected_mode() {
                    self.set_protected_flags(v, cpl);
                } else {
                    self.set_real_mode_flags(v, op_size32);
                }
            }
            0x9E => {
                let al = self.read_gpr8(0);
                let cur = self.flags().bits() & !0xFF;
                self.regs.eflags = Eflags::from_bits_truncate(cur | (al as u32 & 0xD5) | 0x02);
                self.lazy = crate::lazyflags::LazyFlags::default();
            }
            0x9F => {
                let f = self.flags().bits();
                self.write_gpr8(0, (f & 0xFF) as u8);
            }
            0xA0 => {
                let off = self.fetch_immediate(if addr32 { 32 } else { 16 })?;
                let v = self.read_mem(seg_ov.unwrap_or(SegReg::Ds), off, 8)?;
                self.write_gpr8(0, v as u8);
            }
            0xA1 => {
                let off = self.fetch_immediate(if addr32 { 32 } else { 16 })?;
                let width = if op_size32 { 32 } else { 16 };
                let v = self.read_mem(seg_ov.unwrap_or(SegReg::Ds), off, width)?;
                self.write_gpr(0, width, v);
            }
            0xA2 => {
                let off = self.fetch_immediate(if addr32 { 32 } else { 16 })?;
                let v = self.read_gpr8(0);
                self.write_mem(seg_ov.unwrap_or(SegReg::Ds), off, 8, v as u32)?;
            }
            0xA3 => {
                let off = self.fetch_immediate(if addr32 { 32 } else { 16 })?;
                let width = if op_size32 { 32 } else { 16 };
                let v = self.read_gpr(0, width);
                self.write_mem(seg_ov.unwrap_or(SegReg::Ds), off, width, v)?;
            }
            0xA4..=0xA7 | 0xAA..=0xAF => self.exec_string_op(opcode, &prefixes, op_size32, addr32, io)?,
            0xA8 => {
                let imm = self.fetch_u8()? as u32;
                let a = self.read_gpr8(0) as u32;
                alu::test(&mut self.lazy, 8, a, imm);
            }
            0xA9 => {
                let width = if op_size32 { 32 } else { 16 };
                let imm = self.fetch_immediate(width)?;
                let a = self.read_gpr(0, width);
                alu::test(&mut self.lazy, width, a, imm);
            }
            0xB0..=0xB7 => {
                let imm = self.fetch_u8()?;
                self.write_gpr8(opcode - 0xB0, imm);
            }
            0xB8..=0xBF => {
                let width = if op_size32 { 32 } else { 16 };
                let imm = self.fetch_immediate(width)?;
                self.write_gpr(opcode - 0xB8, width, imm);
            }
            0xC0 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let count = self.shift_count(modrm.reg, false)?;
                self.exec_group2(8, modrm, rm, count)?;
            }
            0xC1 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let count = self.shift_count(modrm.reg, false)?;
                self.exec_group2(width, modrm, rm, count)?;
            }
            0xC2 => {
                let width = if op_size32 { 32 } else { 16 };
                let pop_bytes = self.fetch_u16()?;
                let ip = self.pop(width)?;
                self.set_eip(ip, op_size32);
                let sp = self.read_sp_pub().wrapping_add(pop_bytes as u32);
                self.write_sp_pub(sp);
            }
            0xC3 => {
                let width = if op_size32 { 32 } else { 16 };
                let ip = self.pop(width)?;
                self.set_eip(ip, op_size32);
            }
            0xC4 | 0xC5 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let (seg, off) = self.rm_addr(rm, 0)?;
                let width = if op_size32 { 32 } else { 16 };
                let new_reg_val = self.read_mem(seg, off, width)?;
                let sel = self.read_mem(seg, off.wrapping_add(width as u32 / 8), 16)? as u16;
                let target = if opcode == 0xC4 { SegReg::Es } else { SegReg::Ds };
                self.load_data_segment(target, Selector(sel))?;
                self.write_gpr(modrm.reg, width, new_reg_val);
            }
            0xC6 => {
                let (_, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let imm = self.fetch_u8()? as u32;
                self.write_rm(rm, 8, imm)?;
            }
            0xC7 => {
                let width = if op_size32 { 32 } else { 16 };
                let (_, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let imm = self.fetch_immediate(width)?;
                self.write_rm(rm, width, imm)?;
            }
            0xC8 => self.enter(op_size32)?,
            0xC9 => self.leave(op_size32)?,
            0xCA => {
                let pop_bytes = self.fetch_u16()?;
                self.far_ret(op_size32, pop_bytes)?;
            }
            0xCB => self.far_ret(op_size32, 0)?,
            0xCC => return Err(Exception::Breakpoint),
            0xCD => {
                let n = self.fetch_u8()?;
                return Err(Exception::SoftwareInterrupt(n));
            }
            0xCE => {
                if self.lazy.get_of(self.regs.eflags) {
                    return Err(Exception::Overflow);
                }
            }
            0xCF => self.iret(op_size32)?,
            0xD0 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group2(8, modrm, rm, 1)?;
            }
            0xD1 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group2(width, modrm, rm, 1)?;
            }
            0xD2 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let count = self.shift_count(modrm.reg, true)?;
                self.exec_group2(8, modrm, rm, count)?;
            }
            0xD3 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let count = self.shift_count(modrm.reg, true)?;
                self.exec_group2(width, modrm, rm, count)?;
            }
            0xD4 => self.aam()?,
            0xD5 => self.aad()?,
            0xD7 => {
                let bx = self.read_gpr16(3) as u32;
                let al = self.read_gpr8(0) as u32;
                let v = self.read_mem(seg_ov.unwrap_or(SegReg::Ds), bx.wrapping_add(al) & if addr32 { u32::MAX } else { 0xFFFF }, 8)?;
                self.write_gpr8(0, v as u8);
            }
            #[cfg(feature = "fpu")]
            0xD8..=0xDF => self.execute_fpu_escape(opcode, addr32, seg_ov)?,
            #[cfg(not(feature = "fpu"))]
            0xD8..=0xDF => return Err(Exception::DeviceNotAvailable),
            0xE0 | 0xE1 | 0xE2 | 0xE3 => self.exec_loop(opcode, addr32)?,
            0xE4 => {
                let port = self.fetch_u8()? as u16;
                self.write_gpr8(0, io.in8(port));
            }
            0xE5 => {
                let port = self.fetch_u8()? as u16;
                let width = if op_size32 { 32 } else { 16 };
                let v = if width == 32 { io.in32(port) } else { io.in16(port) as u32 };
                self.write_gpr(0, width, v);
            }
            0xE6 => {
                let port = self.fetch_u8()? as u16;
                io.out8(port, self.read_gpr8(0));
            }
            0xE7 => {
                let port = self.fetch_u8()? as u16;
                if op_size32 {
                    io.out32(port, self.read_gpr32(0));
                } else {
                    io.out16(port, self.read_gpr16(0));
                }
            }
            0xE8 => {
                let width = if op_size32 { 32 } else { 16 };
                let rel = self.fetch_immediate(width)?;
                let rel = if width == 16 { sign_ext16(rel as u16) } else { rel };
                let ret = self.regs.eip;
                self.push(width, ret)?;
                self.jump_rel(rel, op_size32);
            }
            0xE9 => {
                let width = if op_size32 { 32 } else { 16 };
                let rel = self.fetch_immediate(width)?;
                let rel = if width == 16 { sign_ext16(rel as u16) } else { rel };
                self.jump_rel(rel, op_size32);
            }
            0xEA => {
                let offset = self.fetch_immediate(if op_size32 { 32 } else { 16 })?;
                let sel = self.fetch_u16()?;
                self.far_jmp(Selector(sel), offset)?;
            }
            0xEB => {
                let rel = sign_ext8(self.fetch_u8()?);
                self.jump_rel(rel, false);
            }
            0xEC => {
                let port = self.read_gpr16(2);
                self.write_gpr8(0, io.in8(port));
            }
            0xED => {
                let port = self.read_gpr16(2);
                let width = if op_size32 { 32 } else { 16 };
                let v = if width == 32 { io.in32(port) } else { io.in16(port) as u32 };
                self.write_gpr(0, width, v);
            }
            0xEE => {
                let port = self.read_gpr16(2);
                io.out8(port, self.read_gpr8(0));
            }
            0xEF => {
                let port = self.read_gpr16(2);
                if op_size32 {
                    io.out32(port, self.read_gpr32(0));
                } else {
                    io.out16(port, self.read_gpr16(0));
                }
            }
            0xF4 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                self.halted = true;
            }
            0xF5 => {
                self.flags();
                self.regs.eflags.toggle(Eflags::CF);
            }
            0xF6 => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group3(8, modrm, rm)?;
            }
            0xF7 => {
                let width = if op_size32 { 32 } else { 16 };
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                self.exec_group3(width, modrm, rm)?;
            }
            0xF8 => {
                self.flags();
                self.regs.eflags.remove(Eflags::CF);
            }
            0xF9 => {
                self.flags();
                self.regs.eflags.insert(Eflags::CF);
            }
            0xFA => {
                if self.regs.cpl > self.regs.eflags.iopl() && self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                self.flags();
                self.regs.eflags.remove(Eflags::IF);
            }
            0xFB => {
                if self.regs.cpl > self.regs.eflags.iopl() && self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                self.flags();
                self.regs.eflags.insert(Eflags::IF);
                self.int_shadow = crate::cpu::IntShadow::Armed;
            }
            0xFC => {
                self.flags();
                self.regs.eflags.remove(Eflags::DF);
            }
            0xFD => {
                self.flags();
                self.regs.eflags.insert(Eflags::DF);
            }
            0xFE => {
                let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
                let a = self.read_rm(rm, 8)?;
                let r = if modrm.reg & 7 == 0 { alu::inc(&mut self.lazy, 8, a) } else { alu::dec(&mut self.lazy, 8, a) };
                self.write_rm(rm, 8, r)?;
            }
            0xFF => self.exec_group5(op_size32, addr32, seg_ov)?,
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(())
    }

    fn exec_group5(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let width = if op_size32 { 32 } else { 16 };
        match modrm.reg & 7 {
            0 => {
                let a = self.read_rm(rm, width)?;
                let r = alu::inc(&mut self.lazy, width, a);
                self.write_rm(rm, width, r)?;
            }
            1 => {
                let a = self.read_rm(rm, width)?;
                let r = alu::dec(&mut self.lazy, width, a);
                self.write_rm(rm, width, r)?;
            }
            2 => {
                let target = self.read_rm(rm, width)?;
                let ret = self.regs.eip;
                self.push(width, ret)?;
                self.set_eip(target, op_size32);
            }
            3 => {
                let (seg, off) = self.rm_addr(rm, 0)?;
                let offset = self.read_mem(seg, off, width)?;
                let sel = self.read_mem(seg, off.wrapping_add(width as u32 / 8), 16)? as u16;
                self.far_call(Selector(sel), offset, op_size32)?;
            }
            4 => {
                let target = self.read_rm(rm, width)?;
                self.set_eip(target, op_size32);
            }
            5 => {
                let (seg, off) = self.rm_addr(rm, 0)?;
                let offset = self.read_mem(seg, off, width)?;
                let sel = self.read_mem(seg, off.wrapping_add(width as u32 / 8), 16)? as u16;
                self.far_jmp(Selector(sel), offset)?;
            }
            _ => {
                let v = self.read_rm(rm, width)?;
                self.push(width, v)?;
            }
        }
        Ok(())
    }

    pub(crate) fn push_seg(&mut self, seg: SegReg, op_size32: bool) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let v = self.regs.seg(seg).selector.raw() as u32;
        self.push(width, v)
    }

    pub(crate) fn pop_seg(&mut self, seg: SegReg) -> Result<(), Exception> {
        let v = self.pop(16)? as u16;
        if seg == SegReg::Ss {
            self.load_ss(Selector(v))
        } else {
            self.load_data_segment(seg, Selector(v))
        }
    }

    fn pusha(&mut self, op_size32: bool) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let temp_sp = self.read_sp_pub();
        let order = [Gpr::Eax, Gpr::Ecx, Gpr::Edx, Gpr::Ebx, Gpr::Esp, Gpr::Ebp, Gpr::Esi, Gpr::Edi];
        for r in order {
            let v = if r == Gpr::Esp { temp_sp } else { self.regs.gpr(r) };
            self.push(width, v)?;
        }
        Ok(())
    }

    fn popa(&mut self, op_size32: bool) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let order = [Gpr::Edi, Gpr::Esi, Gpr::Ebp, Gpr::Esp, Gpr::Ebx, Gpr::Edx, Gpr::Ecx, Gpr::Eax];
        for r in order {
            let v = self.pop(width)?;
            if r != Gpr::Esp {
                self.regs.set_gpr(r, v);
            }
        }
        Ok(())
    }

    fn enter(&mut self, op_size32: bool) -> Result<(), Exception> {
        let frame_size = self.fetch_u16()?;
        let nesting = self.fetch_u8()? & 0x1F;
        let width = if op_size32 { 32 } else { 16 };
        let frame_ptr_reg_width = if self.regs.stack_size_32() { 32 } else { 16 };
        let bp = self.regs.gpr(Gpr::Ebp);
        self.push(width, bp)?;
        let frame_temp = self.read_sp_pub();
        if nesting > 0 {
            for i in 1..nesting {
                let addr = bp.wrapping_sub((i as u32) * (frame_ptr_reg_width as u32 / 8));
                let v = self.read_mem(SegReg::Ss, addr & if frame_ptr_reg_width == 32 { u32::MAX } else { 0xFFFF }, frame_ptr_reg_width)?;
                self.push(width, v)?;
            }
            self.push(width, frame_temp)?;
        }
        self.regs.set_gpr(Gpr::Ebp, frame_temp);
        let new_sp = self.read_sp_pub().wrapping_sub(frame_size as u32);
        self.write_sp_pub(new_sp);
        Ok(())
    }

    fn leave(&mut self, op_size32: bool) -> Result<(), Exception> {
        let width = if self.regs.stack_size_32() { 32 } else { 16 };
        let bp = self.regs.gpr(Gpr::Ebp);
        self.write_sp_pub(bp & if width == 32 { u32::MAX } else { 0xFFFF });
        let v = self.pop(if op_size32 { 32 } else { 16 })?;
        self.regs.set_gpr(Gpr::Ebp, v);
        Ok(())
    }

    fn exec_loop(&mut self, opcode: u8, addr32: bool) -> Result<(), Exception> {
        let rel = sign_ext8(self.fetch_u8()?);
        let c = self.count_reg_value(addr32).wrapping_sub(1);
        self.set_count_reg(addr32, c);
        let take = match opcode {
            0xE0 => c != 0 && !self.lazy.get_zf(self.regs.eflags),
            0xE1 => c != 0 && self.lazy.get_zf(self.regs.eflags),
            0xE2 => c != 0,
            _ => {
                self.set_count_reg(addr32, c.wrapping_add(1));
                return if self.count_reg_value(addr32) == 0 {
                    self.jump_rel(rel, false);
                    Ok(())
                } else {
                    Ok(())
                };
            }
        };
        if take {
            self.jump_rel(rel, false);
        }
        Ok(())
    }

    fn daa(&mut self) {
        self.flags();
        let al = self.read_gpr8(0);
        let af = self.regs.eflags.contains(Eflags::AF);
        let cf = self.regs.eflags.contains(Eflags::CF);
        let mut new_cf = false;
        let mut result = al;
        if (al & 0x0F) > 9 || af {
            result = result.wrapping_add(6);
            self.regs.eflags.insert(Eflags::AF);
        } else {
            self.regs.eflags.remove(Eflags::AF);
        }
        if al > 0x99 || cf {
            result = result.wrapping_add(0x60);
            new_cf = true;
        }
        self.regs.eflags.set(Eflags::CF, new_cf);
        self.write_gpr8(0, result);
        self.set_logical_flags_from_result(result as u32, 8);
    }

    fn das(&mut self) {
        self.flags();
        let al = self.read_gpr8(0);
        let af = self.regs.eflags.contains(Eflags::AF);
        let cf = self.regs.eflags.contains(Eflags::CF);
        let mut new_cf = cf;
        let mut result = al;
        if (al & 0x0F) > 9 || af {
            result = result.wrapping_sub(6);
            self.regs.eflags.insert(Eflags::AF);
            new_cf = cf || al < 6;
        } else {
            self.regs.eflags.remove(Eflags::AF);
        }
        if al > 0x99 || cf {
            result = result.wrapping_sub(0x60);
            new_cf = true;
        }
        self.regs.eflags.set(Eflags::CF, new_cf);
        self.write_gpr8(0, result);
        self.set_logical_flags_from_result(result as u32, 8);
    }

    fn aaa(&mut self) {
        self.flags();
        let al = self.read_gpr8(0);
        let ax = self.read_gpr16(0);
        if (al & 0x0F) > 9 || self.regs.eflags.contains(Eflags::AF) {
            let new_ax = ax.wrapping_add(0x106);
            self.write_gpr16(0, new_ax);
            self.write_gpr8(0, (new_ax & 0x0F) as u8);
            self.regs.eflags.insert(Eflags::AF | Eflags::CF);
        } else {
            self.write_gpr8(0, al & 0x0F);
            self.regs.eflags.remove(Eflags::AF | Eflags::CF);
        }
    }

    fn aas(&mut self) {
        self.flags();
        let al = self.read_gpr8(0);
        let ax = self.read_gpr16(0);
        if (al & 0x0F) > 9 || self.regs.eflags.contains(Eflags::AF) {
            let new_ax = ax.wrapping_sub(6);
            self.write_gpr16(0, new_ax);
            self.write_gpr8(0, (self.read_gpr8(0)) & 0x0F);
            let ah = self.read_gpr8(4).wrapping_sub(1);
            self.write_gpr8(4, ah);
            self.regs.eflags.insert(Eflags::AF | Eflags::CF);
        } else {
            self.write_gpr8(0, al & 0x0F);
            self.regs.eflags.remove(Eflags::AF | Eflags::CF);
        }
    }

    fn aam(&mut self) -> Result<(), Exception> {
        let base = self.fetch_u8()?;
        if base == 0 {
            return Err(Exception::DivideError);
        }
        let al = self.read_gpr8(0);
        let ah = al / base;
        let al2 = al % base;
        self.write_gpr8(4, ah);
        self.write_gpr8(0, al2);
        self.set_logical_flags_from_result(al2 as u32, 8);
        Ok(())
    }

    fn aad(&mut self) -> Result<(), Exception> {
        let base = self.fetch_u8()?;
        let al = self.read_gpr8(0);
        let ah = self.read_gpr8(4);
        let result = al.wrapping_add(ah.wrapping_mul(base));
        self.write_gpr8(0, result);
        self.write_gpr8(4, 0);
        self.set_logical_flags_from_result(result as u32, 8);
        Ok(())
    }

    fn set_logical_flags_from_result(&mut self, result: u32, width: u8) {
        alu::or(&mut self.lazy, width, result, 0);
    }

}

fn seg_from_index(idx: u8) -> Result<SegReg, Exception> {
    Ok(match idx & 7 {
            0 => SegReg::Es,
            1 => SegReg::Cs,
            2 => SegReg::Ss,
            3 => SegReg::Ds,
            4 => SegReg::Fs,
            5 => SegReg::Gs,
            _ => return Err(Exception::InvalidOpcode),
    })
}

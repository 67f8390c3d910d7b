//! The two-byte (`0F`-prefixed) opcode table: conditional near jumps,
//! `SETcc`/`CMOVcc`, the bit-scan/bit-test/shift-double families, the
//! descriptor-table and control/debug-register groups (`0F 00`/`0F 01`,
//! `MOV CRn`/`MOV DRn`), `CPUID`/`RDTSC`/`RDMSR`/`WRMSR`, and the handful
//! of `0F xx` forms the one-byte table has no room for (`MOVZX`/`MOVSX`,
//! `BSWAP`, `LSS`/`LFS`/`LGS`, `CMPXCHG`/`CMPXCHG8B`/`XADD`).

use crate::alu;
use crate::cpu::{Cond, Cpu};
use crate::decode::{Prefixes, RmOperand};
use crate::exception::Exception;
use crate::execute::{sign_ext16, sign_ext8};
use crate::io::PortIo;
use crate::regs::{Cr0, SegReg};
use aero86_types::{Eflags, GateDescriptor, GateKind, Selector, SegmentDescriptor, SegmentKind};

/// The four `BT`/`BTS`/`BTR`/`BTC` operations, shared by the register-index
/// form (`0F A3`/`AB`/`B3`/`BB`) and the immediate-index group (`0F BA`).
#[derive(Clone, Copy)]
enum BitOp {
    Test,
    Set,
    Reset,
    Complement,
}

/// For a memory operand, a bit index outside `0..width` addresses a
/// different dword of memory (`offset + (index >> 5) * 4`); for a register
/// operand only the index's low bits (mod `width`) are meaningful. Returns
/// the adjusted operand and the bit position within it.
fn bt_effective(rm: RmOperand, width: u8, bit_index: i32) -> (RmOperand, u32) {
    let bits = width as i32;
    match rm {
        RmOperand::Reg(r) => (RmOperand::Reg(r), bit_index.rem_euclid(bits) as u32),
        RmOperand::Mem { seg, offset } => {
            let byte_offset = bit_index.div_euclid(bits) * (bits / 8);
            let bit = bit_index.rem_euclid(bits) as u32;
            (RmOperand::Mem { seg, offset: (offset as i64 + byte_offset as i64) as u32 }, bit)
        }
    }
}

impl Cpu {
    pub(crate) fn execute_0f<IO: PortIo>(
        &mut self,
        op2: u8,
        prefixes: Prefixes,
        op_size32: bool,
        addr32: bool,
        _io: &mut IO,
    ) -> Result<(), Exception> {
        let seg_ov = prefixes.segment_override;
        match op2 {
            0x00 => self.exec_group6(op_size32, addr32, seg_ov),
            0x01 => self.exec_group7(addr32, seg_ov),
            0x02 => self.exec_lar(op_size32, addr32, seg_ov),
            0x03 => self.exec_lsl(op_size32, addr32, seg_ov),
            0x06 => self.exec_clts(),
            0x08 | 0x09 => Ok(()), // INVD/WBINVD: no host cache to flush.
            0x0B => Err(Exception::InvalidOpcode), // UD2
            0x0D | 0x1F => {
                // Multi-byte NOP forms (and the 3DNow!-era `PREFETCH`
                // encoding, harmless to treat the same way here).
                let _ = self.resolve_modrm(addr32, seg_ov)?;
                Ok(())
            }
            0x20 => self.exec_mov_from_cr(addr32, seg_ov),
            0x21 => self.exec_mov_from_dr(addr32, seg_ov),
            0x22 => self.exec_mov_to_cr(addr32, seg_ov),
            0x23 => self.exec_mov_to_dr(addr32, seg_ov),
            0x30 => self.exec_wrmsr(),
            0x31 => self.exec_rdtsc(),
            0x32 => self.exec_rdmsr(),
            0x34 => self.sysenter(),
            0x35 => self.sysexit(),
            0x40..=0x4F => self.exec_cmovcc(op2 & 0xF, op_size32, addr32, seg_ov),
            0x80..=0x8F => self.exec_jcc_near(op2 & 0xF, op_size32),
            0x90..=0x9F => self.exec_setcc(op2 & 0xF, addr32, seg_ov),
            0xA0 => {
                let v = self.regs.seg(SegReg::Fs).selector.raw() as u32;
                self.push(if op_size32 { 32 } else { 16 }, v)
            }
            0xA1 => {
                let v = self.pop(if op_size32 { 32 } else { 16 })?;
                self.load_data_segment(SegReg::Fs, Selector(v as u16))
            }
            0xA2 => {
                if !self.gen.has_cpuid() {
                    return Err(Exception::InvalidOpcode);
                }
                self.cpuid();
                Ok(())
            }
            0xA3 => self.exec_bt(op_size32, addr32, seg_ov, BitOp::Test),
            0xA4 => self.exec_shld_shrd(op_size32, addr32, seg_ov, false, true),
            0xA5 => self.exec_shld_shrd(op_size32, addr32, seg_ov, true, true),
            0xA8 => {
                let v = self.regs.seg(SegReg::Gs).selector.raw() as u32;
                self.push(if op_size32 { 32 } else { 16 }, v)
            }
            0xA9 => {
                let v = self.pop(if op_size32 { 32 } else { 16 })?;
                self.load_data_segment(SegReg::Gs, Selector(v as u16))
            }
            0xAB => self.exec_bt(op_size32, addr32, seg_ov, BitOp::Set),
            0xAC => self.exec_shld_shrd(op_size32, addr32, seg_ov, false, false),
            0xAD => self.exec_shld_shrd(op_size32, addr32, seg_ov, true, false),
            0xAF => self.exec_imul_rm(op_size32, addr32, seg_ov),
            0xB0 => self.exec_cmpxchg(8, addr32, seg_ov),
            0xB1 => self.exec_cmpxchg(if op_size32 { 32 } else { 16 }, addr32, seg_ov),
            0xB2 => self.exec_lxs(SegReg::Ss, op_size32, addr32, seg_ov),
            0xB3 => self.exec_bt(op_size32, addr32, seg_ov, BitOp::Reset),
            0xB4 => self.exec_lxs(SegReg::Fs, op_size32, addr32, seg_ov),
            0xB5 => self.exec_lxs(SegReg::Gs, op_size32, addr32, seg_ov),
            0xB6 => self.exec_movx(op_size32, addr32, seg_ov, 8, false),
            0xB7 => self.exec_movx(op_size32, addr32, seg_ov, 16, false),
            0xBA => self.exec_group8(op_size32, addr32, seg_ov),
            0xBB => self.exec_bt(op_size32, addr32, seg_ov, BitOp::Complement),
            0xBC => self.exec_bsf(op_size32, addr32, seg_ov),
            0xBD => self.exec_bsr(op_size32, addr32, seg_ov),
            0xBE => self.exec_movx(op_size32, addr32, seg_ov, 8, true),
            0xBF => self.exec_movx(op_size32, addr32, seg_ov, 16, true),
            0xC0 => self.exec_xadd(8, addr32, seg_ov),
            0xC1 => self.exec_xadd(if op_size32 { 32 } else { 16 }, addr32, seg_ov),
            0xC7 => self.exec_group9(addr32, seg_ov),
            0xC8..=0xCF => self.exec_bswap(op2 - 0xC8, op_size32),
            _ => Err(Exception::InvalidOpcode),
        }
    }

    // ---- group6 (0F 00): SLDT/STR/LLDT/LTR/VERR/VERW ----

    fn exec_group6(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let width = if matches!(rm, RmOperand::Reg(_)) && op_size32 { 32 } else { 16 };
        match modrm.reg & 7 {
            0 => self.write_rm(rm, width, self.regs.ldtr.raw() as u32),
            1 => self.write_rm(rm, width, self.regs.tr.raw() as u32),
            2 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                let sel = Selector(self.read_rm(rm, 16)? as u16);
                if sel.is_null() {
                    self.regs.ldtr = sel;
                    self.regs.ldtr_base = 0;
                    self.regs.ldtr_limit = 0;
                    return Ok(());
                }
                let raw = self.read_descriptor_raw(sel)?;
                let gate = GateDescriptor::decode(raw);
                if !matches!(gate.kind, GateKind::Ldt) {
                    return Err(Exception::GeneralProtection(sel.raw()));
                }
                if !gate.present {
                    return Err(Exception::SegmentNotPresent(sel.raw()));
                }
                self.regs.ldtr = sel;
                self.regs.ldtr_base = gate.offset;
                self.regs.ldtr_limit = aero86_types::raw_limit(raw);
                Ok(())
            }
            3 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                let sel = Selector(self.read_rm(rm, 16)? as u16);
                if sel.is_null() {
                    return Err(Exception::GeneralProtection(0));
                }
                let raw = self.read_descriptor_raw(sel)?;
                let gate = GateDescriptor::decode(raw);
                let is32 = matches!(gate.kind, GateKind::Tss32Available);
                if !matches!(gate.kind, GateKind::Tss16Available | GateKind::Tss32Available) {
                    return Err(Exception::GeneralProtection(sel.raw()));
                }
                if !gate.present {
                    return Err(Exception::SegmentNotPresent(sel.raw()));
                }
                self.regs.tr = sel;
                self.regs.tr_base = gate.offset;
                self.regs.tr_limit = aero86_types::raw_limit(raw);
                self.regs.tr_is_32bit = is32;
                self.tss_set_busy(sel, true)
            }
            4 | 5 => {
                let sel = Selector(self.read_rm(rm, 16)? as u16);
                let verw = modrm.reg & 7 == 5;
                let ok = self.verify_segment_access(sel, verw);
                self.lazy.refresh_flags(&mut self.regs.eflags);
                self.regs.eflags.set(Eflags::ZF, ok);
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        }
    }

    /// `VERR`/`VERW`: does `sel` name a present, appropriately-typed
    /// segment the current privilege level could actually read (or write,
    /// for `VERW`)? A conforming code segment always passes its privilege
    /// check; everything else needs `max(CPL, RPL) <= DPL`.
    fn verify_segment_access(&mut self, sel: Selector, verw: bool) -> bool {
        if sel.is_null() {
            return false;
        }
        let Ok(raw) = self.read_descriptor_raw(sel) else { return false };
        let Some(d) = SegmentDescriptor::decode(raw) else { return false };
        let type_ok = match (verw, d.kind) {
            (false, SegmentKind::Code { readable,.. }) => readable,
            (false, SegmentKind::Data {.. }) => true,
            (true, SegmentKind::Data { writable,.. }) => writable,
            (true, SegmentKind::Code {.. }) => false,
        };
        if !type_ok || !d.present {
            return false;
        }
        let conforming = matches!(d.kind, SegmentKind::Code { conforming: true,.. });
        conforming || self.regs.cpl.max(sel.rpl()) <= d.dpl
    }

    // ---- group7 (0F 01): SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG ----

    fn exec_group7(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        match modrm.reg & 7 {
            0 => {
                let (seg, off) = self.rm_addr(rm, 0)?;
                self.write_mem(seg, off, 16, self.regs.gdtr_limit & 0xFFFF)?;
                self.write_mem(seg, off.wrapping_add(2), 32, self.regs.gdtr_base)
            }
            1 => {
                let (seg, off) = self.rm_addr(rm, 0)?;
                self.write_mem(seg, off, 16, self.regs.idtr_limit & 0xFFFF)?;
                self.write_mem(seg, off.wrapping_add(2), 32, self.regs.idtr_base)
            }
            2 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                let (seg, off) = self.rm_addr(rm, 0)?;
                let limit = self.read_mem(seg, off, 16)?;
                let base = self.read_mem(seg, off.wrapping_add(2), 32)?;
                self.regs.gdtr_limit = limit;
                self.regs.gdtr_base = base;
                Ok(())
            }
            3 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                let (seg, off) = self.rm_addr(rm, 0)?;
                let limit = self.read_mem(seg, off, 16)?;
                let base = self.read_mem(seg, off.wrapping_add(2), 32)?;
                self.regs.idtr_limit = limit;
                self.regs.idtr_base = base;
                Ok(())
            }
            4 => self.write_rm(rm, 16, self.regs.cr0.bits() & 0xFFFF),
            6 => {
                if self.regs.cpl != 0 {
                    return Err(Exception::GeneralProtection(0));
                }
                let v = self.read_rm(rm, 16)? as u16;
                let old = self.regs.cr0;
                // LMSW can set PE but never clear it, and never touches
                // bits above the low word.
                let new_low = (v as u32 & 0xFFFF) | (old.bits() & 1);
                self.regs.cr0 = Cr0::from_bits_truncate((old.bits() & 0xFFFF_0000) | new_low);
                Ok(())
            }
            7 => {
                // No per-page invalidate exists below this layer; a full
                // flush is semantically safe, just coarser than real
                // silicon (documented as a deliberate simplification).
                self.bus.flush_tlb();
                Ok(())
            }
            _ => Err(Exception::InvalidOpcode),
        }
    }

    // ---- LAR / LSL ----

    fn exec_lar(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let sel = Selector(self.read_rm(rm, 16)? as u16);
        let mut ok = false;
        let mut access_word = 0u32;
        if !sel.is_null() {
            if let Ok(raw) = self.read_descriptor_raw(sel) {
                let cpl = self.regs.cpl;
                let rpl = sel.rpl();
                if let Some(d) = SegmentDescriptor::decode(raw) {
                    let conforming = matches!(d.kind, SegmentKind::Code { conforming: true,.. });
                    if d.present && (conforming || cpl.max(rpl) <= d.dpl) {
                        ok = true;
                        access_word = ((raw >> 40) & 0xFF00) as u32;
                    }
                } else {
                    let gate = GateDescriptor::decode(raw);
                    if gate.present && !matches!(gate.kind, GateKind::Other(_)) && cpl.max(rpl) <= gate.dpl {
                        ok = true;
                        access_word = ((raw >> 40) & 0xFF00) as u32;
                    }
                }
            }
        }
        self.lazy.refresh_flags(&mut self.regs.eflags);
        self.regs.eflags.set(Eflags::ZF, ok);
        if ok {
            self.write_gpr(modrm.reg, if op_size32 { 32 } else { 16 }, access_word);
        }
        Ok(())
    }

    fn exec_lsl(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let sel = Selector(self.read_rm(rm, 16)? as u16);
        let mut ok = false;
        let mut limit = 0u32;
        if !sel.is_null() {
            if let Ok(raw) = self.read_descriptor_raw(sel) {
                let cpl = self.regs.cpl;
                let rpl = sel.rpl();
                if let Some(d) = SegmentDescriptor::decode(raw) {
                    let conforming = matches!(d.kind, SegmentKind::Code { conforming: true,.. });
                    if d.present && (conforming || cpl.max(rpl) <= d.dpl) {
                        ok = true;
                        limit = d.limit;
                    }
                } else {
                    let gate = GateDescriptor::decode(raw);
                    let eligible = matches!(gate.kind, GateKind::Ldt) || gate.kind.is_tss();
                    if gate.present && eligible && cpl.max(rpl) <= gate.dpl {
                        ok = true;
                        limit = aero86_types::raw_limit(raw);
                    }
                }
            }
        }
        self.lazy.refresh_flags(&mut self.regs.eflags);
        self.regs.eflags.set(Eflags::ZF, ok);
        if ok {
            self.write_gpr(modrm.reg, if op_size32 { 32 } else { 16 }, limit);
        }
        Ok(())
    }

    // ---- CLTS ----

    fn exec_clts(&mut self) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        self.regs.cr0.remove(Cr0::TS);
        Ok(())
    }

    // ---- MOV to/from CR/DR ----

    fn exec_mov_from_cr(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let gpr = match rm {
            RmOperand::Reg(r) => r,
            RmOperand::Mem {.. } => return Err(Exception::InvalidOpcode),
        };
        let val = match modrm.reg & 7 {
            0 => self.regs.cr0.bits(),
            2 => self.regs.cr2,
            3 => self.regs.cr3,
            4 => self.regs.cr4,
            _ => return Err(Exception::InvalidOpcode),
        };
        self.write_gpr32(gpr, val);
        Ok(())
    }

    fn exec_mov_to_cr(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let gpr = match rm {
            RmOperand::Reg(r) => r,
            RmOperand::Mem {.. } => return Err(Exception::InvalidOpcode),
        };
        let val = self.read_gpr32(gpr);
        match modrm.reg & 7 {
            0 => {
                let new_cr0 = Cr0::from_bits_truncate(val) | Cr0::ET;
                let paging_changed = new_cr0.contains(Cr0::PG) != self.regs.cr0.contains(Cr0::PG);
                self.regs.cr0 = new_cr0;
                if paging_changed {
                    self.bus.flush_tlb();
                }
            }
            2 => self.regs.cr2 = val,
            3 => {
                self.regs.cr3 = val;
                self.bus.flush_tlb();
            }
            4 => self.regs.cr4 = val,
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(())
    }

    fn exec_mov_from_dr(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let gpr = match rm {
            RmOperand::Reg(r) => r,
            RmOperand::Mem {.. } => return Err(Exception::InvalidOpcode),
        };
        let val = match modrm.reg & 7 {
            0 => self.regs.dbg.dr0,
            1 => self.regs.dbg.dr1,
            2 => self.regs.dbg.dr2,
            3 => self.regs.dbg.dr3,
            6 => self.regs.dbg.dr6,
            7 => self.regs.dbg.dr7,
            _ => return Err(Exception::InvalidOpcode),
        };
        self.write_gpr32(gpr, val);
        Ok(())
    }

    fn exec_mov_to_dr(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let gpr = match rm {
            RmOperand::Reg(r) => r,
            RmOperand::Mem {.. } => return Err(Exception::InvalidOpcode),
        };
        let val = self.read_gpr32(gpr);
        match modrm.reg & 7 {
            0 => self.regs.dbg.dr0 = val,
            1 => self.regs.dbg.dr1 = val,
            2 => self.regs.dbg.dr2 = val,
            3 => self.regs.dbg.dr3 = val,
            6 => self.regs.dbg.dr6 = val,
            7 => self.regs.dbg.dr7 = val,
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(())
    }

    // ---- WRMSR/RDMSR/RDTSC/CPUID ----

    fn exec_wrmsr(&mut self) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let ecx = self.read_gpr32(1);
        let eax = self.read_gpr32(0);
        match ecx {
            0x174 => self.regs.sysenter.cs = eax as u16,
            0x175 => self.regs.sysenter.esp = eax,
            0x176 => self.regs.sysenter.eip = eax,
            _ => return Err(Exception::GeneralProtection(0)),
        }
        Ok(())
    }

    fn exec_rdmsr(&mut self) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let ecx = self.read_gpr32(1);
        let eax = match ecx {
            0x174 => self.regs.sysenter.cs as u32,
            0x175 => self.regs.sysenter.esp,
            0x176 => self.regs.sysenter.eip,
            _ => return Err(Exception::GeneralProtection(0)),
        };
        self.write_gpr32(0, eax);
        self.write_gpr32(2, 0);
        Ok(())
    }

    fn exec_rdtsc(&mut self) -> Result<(), Exception> {
        self.write_gpr32(0, self.tsc as u32);
        self.write_gpr32(2, (self.tsc >> 32) as u32);
        Ok(())
    }

    /// Only leaves 0 (vendor string, max leaf) and 1 (family/feature bits)
    /// are meaningful; anything beyond that reads back as zero.
    fn cpuid(&mut self) {
        let leaf = self.read_gpr32(0);
        match leaf {
            0 => {
                let vendor = b"AERO386 CPU ";
                self.write_gpr32(0, 1);
                self.write_gpr32(3, u32::from_le_bytes(vendor[0..4].try_into().unwrap()));
                self.write_gpr32(2, u32::from_le_bytes(vendor[4..8].try_into().unwrap()));
                self.write_gpr32(1, u32::from_le_bytes(vendor[8..12].try_into().unwrap()));
            }
            1 => {
                let family = self.gen.family() as u32;
                let mut edx = 0x100u32;
                if cfg!(feature = "fpu") {
                    edx |= 1;
                }
                if family > 5 {
                    edx |= 0x8820;
                }
                self.write_gpr32(0, family << 8);
                self.write_gpr32(3, 0);
                self.write_gpr32(2, edx);
                self.write_gpr32(1, 0);
            }
            _ => {
                self.write_gpr32(0, 0);
                self.write_gpr32(3, 0);
                self.write_gpr32(2, 0);
                self.write_gpr32(1, 0);
            }
        }
    }

    // ---- CMOVcc / Jcc near / SETcc ----

    fn exec_cmovcc(&mut self, tttn: u8, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let src = self.read_rm(rm, width)?;
        if self.eval_cond(Cond::from_tttn(tttn)) {
            self.write_gpr(modrm.reg, width, src);
        }
        Ok(())
    }

    fn exec_jcc_near(&mut self, tttn: u8, op_size32: bool) -> Result<(), Exception> {
        let rel = if op_size32 { self.fetch_u32()? } else { sign_ext16(self.fetch_u16()?) };
        if self.eval_cond(Cond::from_tttn(tttn)) {
            self.jump_rel(rel, op_size32);
        }
        Ok(())
    }

    fn exec_setcc(&mut self, tttn: u8, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (_modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let v = if self.eval_cond(Cond::from_tttn(tttn)) { 1 } else { 0 };
        self.write_rm(rm, 8, v)
    }

    // ---- BT family ----

    fn exec_bt(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>, op: BitOp) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let bit_index = self.read_gpr(modrm.reg, width) as i32;
        self.apply_bit_op(rm, width, bit_index, op)
    }

    fn exec_group8(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let imm = self.fetch_u8()? as i32;
        let op = match modrm.reg & 7 {
            4 => BitOp::Test,
            5 => BitOp::Set,
            6 => BitOp::Reset,
            7 => BitOp::Complement,
            _ => return Err(Exception::InvalidOpcode),
        };
        self.apply_bit_op(rm, width, imm, op)
    }

    fn apply_bit_op(&mut self, rm: RmOperand, width: u8, bit_index: i32, op: BitOp) -> Result<(), Exception> {
        let (eff_rm, bit) = bt_effective(rm, width, bit_index);
        let val = self.read_rm(eff_rm, width)?;
        let cf = (val >> bit) & 1 != 0;
        match op {
            BitOp::Test => {}
            BitOp::Set => self.write_rm(eff_rm, width, val | (1 << bit))?,
            BitOp::Reset => self.write_rm(eff_rm, width, val & !(1 << bit))?,
            BitOp::Complement => self.write_rm(eff_rm, width, val ^ (1 << bit))?,
        }
        self.lazy.refresh_flags(&mut self.regs.eflags);
        self.regs.eflags.set(Eflags::CF, cf);
        Ok(())
    }

    // ---- SHLD/SHRD ----

    /// `is_shl` picks `SHLD`/`SHRD`; `imm_form` picks the immediate-count
    /// encoding (`0F A4`/`AC`) over the `CL`-count one (`0F A5`/`AD`).
    fn exec_shld_shrd(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>, imm_form: bool, is_shl: bool) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let src = self.read_gpr(modrm.reg, width);
        let dst = self.read_rm(rm, width)?;
        let count = if imm_form { self.fetch_u8()? as u32 & 0x1F } else { self.read_gpr8(1) as u32 & 0x1F };
        let r = if is_shl {
            alu::shld(&mut self.lazy, width, dst, src, count)
        } else {
            alu::shrd(&mut self.lazy, width, dst, src, count)
        };
        self.write_rm(rm, width, r)
    }

    // ---- IMUL r, r/m ----

    fn exec_imul_rm(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let a = self.read_gpr(modrm.reg, width);
        let b = self.read_rm(rm, width)?;
        let (lo, _hi) = alu::imul(&mut self.lazy, width, a, b);
        self.write_gpr(modrm.reg, width, lo);
        Ok(())
    }

    // ---- CMPXCHG / CMPXCHG8B / XADD ----

    fn exec_cmpxchg(&mut self, width: u8, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let acc = self.read_gpr(0, width);
        let dst = self.read_rm(rm, width)?;
        let src = self.read_gpr(modrm.reg, width);
        alu::cmp(&mut self.lazy, width, acc, dst);
        if acc == dst {
            self.write_rm(rm, width, src)?;
        } else {
            self.write_gpr(0, width, dst);
        }
        Ok(())
    }

    fn exec_group9(&mut self, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        if modrm.reg & 7 != 1 {
            return Err(Exception::InvalidOpcode);
        }
        let (seg, off) = self.rm_addr(rm, 0)?;
        let lo = self.read_mem(seg, off, 32)?;
        let hi = self.read_mem(seg, off.wrapping_add(4), 32)?;
        let mem = ((hi as u64) << 32) | lo as u64;
        let cmp = ((self.read_gpr32(2) as u64) << 32) | self.read_gpr32(0) as u64;
        self.lazy.refresh_flags(&mut self.regs.eflags);
        if mem == cmp {
            self.regs.eflags.insert(Eflags::ZF);
            let new = ((self.read_gpr32(1) as u64) << 32) | self.read_gpr32(3) as u64;
            self.write_mem(seg, off, 32, new as u32)?;
            self.write_mem(seg, off.wrapping_add(4), 32, (new >> 32) as u32)?;
        } else {
            self.regs.eflags.remove(Eflags::ZF);
            self.write_gpr32(2, (mem >> 32) as u32);
            self.write_gpr32(0, mem as u32);
        }
        Ok(())
    }

    fn exec_xadd(&mut self, width: u8, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let dst = self.read_rm(rm, width)?;
        let src = self.read_gpr(modrm.reg, width);
        let sum = alu::add(&mut self.lazy, width, dst, src);
        self.write_gpr(modrm.reg, width, dst);
        self.write_rm(rm, width, sum)
    }

    // ---- MOVZX/MOVSX, LSS/LFS/LGS, BSF/BSR, BSWAP ----

    fn exec_movx(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>, src_width: u8, signed: bool) -> Result<(), Exception> {
        let dst_width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let v = self.read_rm(rm, src_width)?;
        let ext = if signed {
            if src_width == 8 {
                sign_ext8(v as u8)
            } else {
                sign_ext16(v as u16)
            }
        } else {
            v
        };
        self.write_gpr(modrm.reg, dst_width, ext);
        Ok(())
    }

    fn exec_lxs(&mut self, seg_reg: SegReg, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let (seg, off) = self.rm_addr(rm, 0)?;
        let offset_val = self.read_mem(seg, off, width)?;
        let sel = self.read_mem(seg, off.wrapping_add((width / 8) as u32), 16)? as u16;
        if seg_reg == SegReg::Ss {
            self.load_ss(Selector(sel))?;
        } else {
            self.load_data_segment(seg_reg, Selector(sel))?;
        }
        self.write_gpr(modrm.reg, width, offset_val);
        Ok(())
    }

    fn exec_bsf(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let a = self.read_rm(rm, width)?;
        if let Some(idx) = alu::bsf(&mut self.lazy, width, a) {
            self.write_gpr(modrm.reg, width, idx);
        }
        Ok(())
    }

    fn exec_bsr(&mut self, op_size32: bool, addr32: bool, seg_ov: Option<SegReg>) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let (modrm, rm) = self.resolve_modrm(addr32, seg_ov)?;
        let a = self.read_rm(rm, width)?;
        if let Some(idx) = alu::bsr(&mut self.lazy, width, a) {
            self.write_gpr(modrm.reg, width, idx);
        }
        Ok(())
    }

    /// `BSWAP` only exists for a 32-bit register operand; the 16-bit form
    /// is undefined and this core raises `#UD` on it rather than guess.
    fn exec_bswap(&mut self, idx: u8, op_size32: bool) -> Result<(), Exception> {
        if !op_size32 {
            return Err(Exception::InvalidOpcode);
        }
        let v = self.read_gpr32(idx);
        self.write_gpr32(idx, v.swap_bytes());
        Ok(())
    }
}

//! Control transfers that need more than "set EIP": far `CALL`/`JMP`/`RET`,
//! `IRET`, call gates, task gates/task switches, and interrupt/exception
//! delivery (`call_isr`). Everything here either succeeds or
//! returns an `Exception` for the caller (`Cpu::deliver`) to redeliver.

use crate::cpu::Cpu;
use crate::exception::Exception;
use crate::regs::{Gpr, SegReg, SegmentShadow};
use aero86_types::{Eflags, GateDescriptor, GateKind, SegmentDescriptor, SegmentKind, Selector};

impl Cpu {
    /// Descriptor-table reads/writes are always supervisor, flat linear
    /// accesses, independent of the currently loaded DS/ES.
    pub(crate) fn read_linear_u32(&mut self, laddr: u32) -> Result<u32, Exception> {
        let shadow = SegmentShadow {
            selector: Selector::NULL,
            base: 0,
            limit: u32::MAX,
            big: true,
            present: true,
            writable: true,
            executable: false,
            conforming_or_expand_down: false,
            dpl: 0,
        };
        let paging = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let wp = self.write_protect();
        let addr = self.bus.resolve(&shadow, laddr, 4, false, 0, paging, cr3, wp)?;
        Ok(self.bus.read32(addr))
    }

    pub(crate) fn write_linear_u32(&mut self, laddr: u32, val: u32) -> Result<(), Exception> {
        let shadow = SegmentShadow {
            selector: Selector::NULL,
            base: 0,
            limit: u32::MAX,
            big: true,
            present: true,
            writable: true,
            executable: false,
            conforming_or_expand_down: false,
            dpl: 0,
        };
        let paging = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let wp = self.write_protect();
        let addr = self.bus.resolve(&shadow, laddr, 4, true, 0, paging, cr3, wp)?;
        self.bus.write32(addr, val);
        self.bus.notify_store_physical(&mut self.fetch_cache, addr);
        Ok(())
    }

    pub(crate) fn read_linear_u16(&mut self, laddr: u32) -> Result<u16, Exception> {
        // Descriptor-table fields are frequently word-sized (selectors);
        // read via the 32-bit path and mask rather than duplicate `resolve`.
        let aligned = laddr & !3;
        let word = self.read_linear_u32(aligned)?;
        let shift = (laddr - aligned) * 8;
        Ok((word >> shift) as u16)
    }

    fn descriptor_table_base_limit(&self, sel: Selector) -> (u32, u32) {
        if sel.table_indicator() {
            (self.regs.ldtr_base, self.regs.ldtr_limit)
        } else {
            (self.regs.gdtr_base, self.regs.gdtr_limit)
        }
    }

    /// Read the raw 8-byte descriptor named by `sel`, faulting `#GP(sel)`
    /// if it falls outside the owning table's limit.
    pub(crate) fn read_descriptor_raw(&mut self, sel: Selector) -> Result<u64, Exception> {
        let (base, limit) = self.descriptor_table_base_limit(sel);
        let idx = sel.index() as u32;
        if idx.wrapping_add(7) > limit {
            return Err(Exception::GeneralProtection(sel.raw() & !0b111));
        }
        let addr = base.wrapping_add(idx);
        let lo = self.read_linear_u32(addr)?;
        let hi = self.read_linear_u32(addr.wrapping_add(4))?;
        Ok((lo as u64) | ((hi as u64) << 32))
    }

    pub(crate) fn shadow_from_descriptor(sel: Selector, d: &SegmentDescriptor) -> SegmentShadow {
        let (writable, conforming_or_expand_down, executable) = match d.kind {
            SegmentKind::Data { writable, expand_down } => (writable, expand_down, false),
            SegmentKind::Code { readable: _, conforming } => (false, conforming, true),
        };
        SegmentShadow {
            selector: sel,
            base: d.base,
            limit: d.limit,
            big: d.big,
            present: d.present,
            writable,
            executable,
            conforming_or_expand_down,
            dpl: d.dpl,
        }
    }

    /// Load a data/stack segment register from a selector the guest just
    /// supplied (`MOV DS, r/m16`, far-pointer loads, etc). `min_dpl_rpl`
    /// enforces the "max(CPL, RPL) <= DPL" rule for non-stack segments;
    /// `SS` uses the stricter "==" variant via `load_ss`.
    pub fn load_data_segment(&mut self, reg: SegReg, sel: Selector) -> Result<(), Exception> {
        if sel.is_null() {
            if reg == SegReg::Ss {
                return Err(Exception::GeneralProtection(0));
            }
            self.regs.set_seg(reg, SegmentShadow { selector: sel, present: false,..SegmentShadow::NULL });
            return Ok(());
        }
        let raw = self.read_descriptor_raw(sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(sel.raw()))?;
        if matches!(desc.kind, SegmentKind::Code { readable: false,.. }) {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        let cpl = self.regs.cpl;
        let rpl = sel.rpl();
        if matches!(desc.kind, SegmentKind::Code { conforming: false,.. }) {
            if cpl.max(rpl) > desc.dpl {
                return Err(Exception::GeneralProtection(sel.raw()));
            }
        } else if !desc.is_code() && cpl.max(rpl) > desc.dpl {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        if !desc.present {
            return Err(Exception::SegmentNotPresent(sel.raw()));
        }
        self.regs.set_seg(reg, Self::shadow_from_descriptor(sel, &desc));
        Ok(())
    }

    /// `SS` loads require RPL == CPL == DPL exactly.
    pub fn load_ss(&mut self, sel: Selector) -> Result<(), Exception> {
        let cpl = self.regs.cpl;
        if sel.is_null() {
            return Err(Exception::GeneralProtection(0));
        }
        let raw = self.read_descriptor_raw(sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(sel.raw()))?;
        let writable = matches!(desc.kind, SegmentKind::Data { writable: true,.. });
        if !writable || sel.rpl() != cpl || desc.dpl != cpl {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        if !desc.present {
            return Err(Exception::StackFault(sel.raw()));
        }
        self.regs.set_seg(SegReg::Ss, Self::shadow_from_descriptor(sel, &desc));
        self.int_shadow = crate::cpu::IntShadow::Armed;
        Ok(())
    }

    /// Load `CS` + `EIP` for an intra-privilege-level transfer into a
    /// non-conforming/conforming code segment that has already passed its
    /// privilege checks. `is_call` only matters for the `big`-ness of the
    /// pushed return address upstream; this just updates the registers.
    pub(crate) fn load_cs(&mut self, sel: Selector, desc: &SegmentDescriptor, eip: u32, cpl: u8) {
        let mut shadow = Self::shadow_from_descriptor(sel, desc);
        shadow.selector = Selector((sel.raw() & !0b11) | cpl as u16);
        self.regs.set_seg(SegReg::Cs, shadow);
        self.regs.cpl = cpl;
        self.set_eip(eip, desc.big);
    }

    /// Far `JMP`. Handles a plain code-segment target, a call gate (`JMP`
    /// through a call gate never changes privilege), and a task gate/TSS
    /// (a full task switch).
    pub fn far_jmp(&mut self, sel: Selector, offset: u32) -> Result<(), Exception> {
        if sel.is_null() {
            return Err(Exception::GeneralProtection(0));
        }
        if !self.regs.protected_mode() {
            let shadow = SegmentShadow::real_mode(sel.raw());
            self.regs.set_seg(SegReg::Cs, shadow);
            self.set_eip(offset, false);
            return Ok(());
        }
        let raw = self.read_descriptor_raw(sel)?;
        if let Some(desc) = SegmentDescriptor::decode(raw) {
            if !desc.is_code() {
                return Err(Exception::GeneralProtection(sel.raw()));
            }
            let cpl = self.regs.cpl;
            let conforming = matches!(desc.kind, SegmentKind::Code { conforming: true,.. });
            if conforming {
                if desc.dpl > cpl {
                    return Err(Exception::GeneralProtection(sel.raw()));
                }
            } else if sel.rpl() > cpl || desc.dpl != cpl {
                return Err(Exception::GeneralProtection(sel.raw()));
            }
            if !desc.present {
                return Err(Exception::SegmentNotPresent(sel.raw()));
            }
            self.load_cs(sel, &desc, offset, cpl);
            return Ok(());
        }
        let gate = GateDescriptor::decode(raw);
        match gate.kind {
            GateKind::CallGate16 | GateKind::CallGate32 => self.jmp_through_call_gate(sel, &gate),
            GateKind::TaskGate => {
                let gate_sel = Selector(gate.selector);
                self.task_switch(gate_sel, TaskSwitchSource::Jmp)
            }
            k if k.is_tss() => self.task_switch(sel, TaskSwitchSource::Jmp),
            _ => Err(Exception::GeneralProtection(sel.raw())),
        }
    }

    fn jmp_through_call_gate(&mut self, gate_sel: Selector, gate: &GateDescriptor) -> Result<(), Exception> {
        if !gate.present {
            return Err(Exception::SegmentNotPresent(gate_sel.raw()));
        }
        let cpl = self.regs.cpl;
        if cpl.max(gate_sel.rpl()) > gate.dpl {
            return Err(Exception::GeneralProtection(gate_sel.raw()));
        }
        let target_sel = Selector(gate.selector);
        if target_sel.is_null() {
            return Err(Exception::GeneralProtection(0));
        }
        let raw = self.read_descriptor_raw(target_sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(target_sel.raw()))?;
        if !desc.is_code() || desc.dpl > cpl {
            return Err(Exception::GeneralProtection(target_sel.raw()));
        }
        if !desc.present {
            return Err(Exception::SegmentNotPresent(target_sel.raw()));
        }
        self.load_cs(target_sel, &desc, gate.offset, cpl);
        Ok(())
    }

    /// Far `CALL`. `op_size32` selects whether the return CS:IP pushed is a
    /// 16- or 32-bit pair, matching the caller's current operand size.
    pub fn far_call(&mut self, sel: Selector, offset: u32, op_size32: bool) -> Result<(), Exception> {
        if !self.regs.protected_mode() {
            let ret_cs = self.regs.seg(SegReg::Cs).selector.raw();
            let ret_ip = self.regs.eip;
            self.push(if op_size32 { 32 } else { 16 }, ret_cs as u32)?;
            self.push(if op_size32 { 32 } else { 16 }, ret_ip)?;
            let shadow = SegmentShadow::real_mode(sel.raw());
            self.regs.set_seg(SegReg::Cs, shadow);
            self.set_eip(offset, false);
            return Ok(());
        }
        if sel.is_null() {
            return Err(Exception::GeneralProtection(0));
        }
        let raw = self.read_descriptor_raw(sel)?;
        if let Some(desc) = SegmentDescriptor::decode(raw) {
            if !desc.is_code() {
                return Err(Exception::GeneralProtection(sel.raw()));
            }
            let cpl = self.regs.cpl;
            let conforming = matches!(desc.kind, SegmentKind::Code { conforming: true,.. });
            if conforming {
                if desc.dpl > cpl {
                    return Err(Exception::GeneralProtection(sel.raw()));
                }
            } else if sel.rpl() > cpl || desc.dpl != cpl {
                return Err(Exception::GeneralProtection(sel.raw()));
            }
            if !desc.present {
                return Err(Exception::SegmentNotPresent(sel.raw()));
            }
            let ret_cs = self.regs.seg(SegReg::Cs).selector.raw();
            let ret_ip = self.regs.eip;
            let width = if op_size32 { 32 } else { 16 };
            self.push(width, ret_cs as u32)?;
            self.push(width, ret_ip)?;
            self.load_cs(sel, &desc, offset, cpl);
            return Ok(());
        }
        let gate = GateDescriptor::decode(raw);
        match gate.kind {
            GateKind::CallGate16 | GateKind::CallGate32 => self.call_through_call_gate(sel, &gate, op_size32),
            GateKind::TaskGate => {
                let gate_sel = Selector(gate.selector);
                self.task_switch(gate_sel, TaskSwitchSource::Call)
            }
            k if k.is_tss() => self.task_switch(sel, TaskSwitchSource::Call),
            _ => Err(Exception::GeneralProtection(sel.raw())),
        }
    }

    fn call_through_call_gate(&mut self, gate_sel: Selector, gate: &GateDescriptor, caller_op_size32: bool) -> Result<(), Exception> {
        if !gate.present {
            return Err(Exception::SegmentNotPresent(gate_sel.raw()));
        }
        let cpl = self.regs.cpl;
        if cpl.max(gate_sel.rpl()) > gate.dpl {
            return Err(Exception::GeneralProtection(gate_sel.raw()));
        }
        let target_sel = Selector(gate.selector);
        if target_sel.is_null() {
            return Err(Exception::GeneralProtection(0));
        }
        let raw = self.read_descriptor_raw(target_sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(target_sel.raw()))?;
        if !desc.is_code() || desc.dpl > cpl {
            return Err(Exception::GeneralProtection(target_sel.raw()));
        }
        if !desc.present {
            return Err(Exception::SegmentNotPresent(target_sel.raw()));
        }
        let gate_width = if gate.kind.is_32bit() { 32 } else { 16 };
        let ret_cs = self.regs.seg(SegReg::Cs).selector.raw();
        let ret_ip = self.regs.eip;
        let ret_width = if caller_op_size32 { 32 } else { 16 };

        if desc.dpl < cpl {
            // Inter-privilege call: switch to the target's stack from the
            // current TSS, then copy `param_count` words across.
            let (new_ss, new_esp) = self.tss_stack_for_level(desc.dpl)?;
            let old_ss = self.regs.seg(SegReg::Ss).selector.raw();
            let old_esp = self.regs.gpr(Gpr::Esp);

            self.load_ss(new_ss)?;
            self.regs.set_gpr(Gpr::Esp, new_esp);

            self.push(gate_width, old_ss as u32)?;
            self.push(gate_width, old_esp)?;
            for i in (0..gate.param_count).rev() {
                let off = i as u32 * (gate_width as u32 / 8);
                let shadow = SegmentShadow { selector: Selector(old_ss),..SegmentShadow::real_mode(0) };
                let _ = shadow; // params are read from the *old* stack, already segment-resolved below
                let val = self.read_mem_absolute_stack(old_ss, old_esp.wrapping_add(off), gate_width)?;
                self.push(gate_width, val)?;
            }
            self.push(gate_width, ret_cs as u32)?;
            self.push(gate_width, ret_ip)?;
            self.load_cs(target_sel, &desc, gate.offset, desc.dpl);
        } else {
            self.push(ret_width, ret_cs as u32)?;
            self.push(ret_width, ret_ip)?;
            self.load_cs(target_sel, &desc, gate.offset, cpl);
        }
        Ok(())
    }

    /// Reads a stack-relative value from an *already-vacated* old stack
    /// segment during an inter-privilege call-gate parameter copy, without
    /// disturbing the freshly loaded `SS`.
    fn read_mem_absolute_stack(&mut self, ss_sel: u16, offset: u32, width: u8) -> Result<u32, Exception> {
        let raw = self.read_descriptor_raw(Selector(ss_sel))?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::StackFault(ss_sel))?;
        let shadow = Self::shadow_from_descriptor(Selector(ss_sel), &desc);
        let cpl = self.regs.cpl;
        let paging = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let wp = self.write_protect();
        let addr = self.bus.resolve(&shadow, offset, (width / 8) as u32, false, cpl, paging, cr3, wp)?;
        Ok(match width {
                16 => self.bus.read16(addr) as u32,
                _ => self.bus.read32(addr),
        })
    }

    pub(crate) fn tss_stack_for_level(&mut self, level: u8) -> Result<(Selector, u32), Exception> {
        let tr_base = self.regs.tr_base;
        if self.regs.tr_is_32bit {
            let off = 4 + (level as u32) * 8;
            let esp = self.read_linear_u32(tr_base.wrapping_add(off))?;
            let ss = self.read_linear_u16(tr_base.wrapping_add(off + 4))?;
            Ok((Selector(ss), esp))
        } else {
            let off = 2 + (level as u32) * 4;
            let sp = self.read_linear_u16(tr_base.wrapping_add(off))?;
            let ss = self.read_linear_u16(tr_base.wrapping_add(off + 2))?;
            Ok((Selector(ss), sp as u32))
        }
    }

    /// `RET far [imm16]`. `op_size32` is the caller's current operand size.
    pub fn far_ret(&mut self, op_size32: bool, pop_bytes: u16) -> Result<(), Exception> {
        let width = if op_size32 { 32 } else { 16 };
        let new_ip = self.pop(width)?;
        let new_cs = self.pop(width)? as u16;
        let sel = Selector(new_cs);

        if !self.regs.protected_mode() {
            let shadow = SegmentShadow::real_mode(sel.raw());
            self.regs.set_seg(SegReg::Cs, shadow);
            self.set_eip(new_ip, false);
            let sp = self.read_sp_pub().wrapping_add(pop_bytes as u32);
            self.write_sp_pub(sp);
            return Ok(());
        }

        let raw = self.read_descriptor_raw(sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(sel.raw()))?;
        if !desc.is_code() {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        let cpl = self.regs.cpl;
        if sel.rpl() < cpl {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        if !desc.present {
            return Err(Exception::SegmentNotPresent(sel.raw()));
        }

        if sel.rpl() > cpl {
            // Returning to an outer (less privileged) level: also pop the
            // caller's SS:ESP and discard the now-unused inner stack.
            let outer_sp_plus = pop_bytes as u32;
            let ret_sp = self.read_sp_pub().wrapping_add(outer_sp_plus);
            self.write_sp_pub(ret_sp);
            let new_sp = self.pop(width)?;
            let new_ss = self.pop(width)? as u16;
            self.load_cs(sel, &desc, new_ip, sel.rpl());
            self.load_ss(Selector(new_ss))?;
            self.regs.set_gpr(Gpr::Esp, new_sp);
        } else {
            self.load_cs(sel, &desc, new_ip, cpl);
            let sp = self.read_sp_pub().wrapping_add(pop_bytes as u32);
            self.write_sp_pub(sp);
        }
        Ok(())
    }

    pub(crate) fn read_sp_pub(&self) -> u32 {
        if self.regs.stack_size_32() {
            self.regs.gpr(Gpr::Esp)
        } else {
            self.regs.gpr(Gpr::Esp) & 0xFFFF
        }
    }

    pub(crate) fn write_sp_pub(&mut self, v: u32) {
        let old = self.regs.gpr(Gpr::Esp);
        let merged = if self.regs.stack_size_32() {
            v
        } else {
            (old & 0xFFFF_0000) | (v & 0xFFFF)
        };
        self.regs.set_gpr(Gpr::Esp, merged);
    }

    /// `IRET`/`IRETD`. Handles the same-level, outer-level, V8086-return
    /// and nested-task cases.
    pub fn iret(&mut self, op_size32: bool) -> Result<(), Exception> {
        if self.regs.eflags.contains(Eflags::NT) {
            return self.iret_nested_task();
        }
        let width = if op_size32 { 32 } else { 16 };
        let new_ip = self.pop(width)?;
        let new_cs = self.pop(width)? as u16;
        let new_flags_raw = self.pop(width)?;

        if !self.regs.protected_mode() {
            self.set_real_mode_flags(new_flags_raw, op_size32);
            let shadow = SegmentShadow::real_mode(new_cs);
            self.regs.set_seg(SegReg::Cs, shadow);
            self.set_eip(new_ip, false);
            return Ok(());
        }

        let returning_to_v8086 = op_size32 && (new_flags_raw & Eflags::VM.bits() != 0) && self.regs.cpl == 0;
        if returning_to_v8086 {
            let new_sp = self.pop(32)?;
            let new_ss = self.pop(32)? as u16;
            let new_es = self.pop(32)? as u16;
            let new_ds = self.pop(32)? as u16;
            let new_fs = self.pop(32)? as u16;
            let new_gs = self.pop(32)? as u16;
            self.set_real_mode_flags(new_flags_raw, true);
            self.regs.eflags.insert(Eflags::VM);
            self.regs.set_seg(SegReg::Cs, SegmentShadow::real_mode(new_cs));
            self.regs.set_seg(SegReg::Ss, SegmentShadow::real_mode(new_ss));
            self.regs.set_seg(SegReg::Es, SegmentShadow::real_mode(new_es));
            self.regs.set_seg(SegReg::Ds, SegmentShadow::real_mode(new_ds));
            self.regs.set_seg(SegReg::Fs, SegmentShadow::real_mode(new_fs));
            self.regs.set_seg(SegReg::Gs, SegmentShadow::real_mode(new_gs));
            self.regs.cpl = 3;
            self.set_eip(new_ip, false);
            self.regs.set_gpr(Gpr::Esp, new_sp);
            return Ok(());
        }

        let sel = Selector(new_cs);
        let raw = self.read_descriptor_raw(sel)?;
        let desc = SegmentDescriptor::decode(raw).ok_or(Exception::GeneralProtection(sel.raw()))?;
        if !desc.is_code() {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        let cpl = self.regs.cpl;
        if sel.rpl() < cpl {
            return Err(Exception::GeneralProtection(sel.raw()));
        }
        if !desc.present {
            return Err(Exception::SegmentNotPresent(sel.raw()));
        }

        if sel.rpl() > cpl {
            let new_sp = self.pop(width)?;
            let new_ss = self.pop(width)? as u16;
            self.load_cs(sel, &desc, new_ip, sel.rpl());
            self.set_protected_flags(new_flags_raw, cpl);
            self.load_ss(Selector(new_ss))?;
            self.regs.set_gpr(Gpr::Esp, new_sp);
        } else {
            self.load_cs(sel, &desc, new_ip, cpl);
            self.set_protected_flags(new_flags_raw, cpl);
        }
        Ok(())
    }

    pub(crate) fn set_real_mode_flags(&mut self, raw: u32, is32: bool) {
        self.lazy.refresh_flags(&mut self.regs.eflags);
        let mask = if is32 { 0x0024_FFFF } else { 0xFFFF };
        let preserved = self.regs.eflags.bits() & !mask;
        self.regs.eflags = Eflags::from_bits_truncate((raw & mask) | preserved | aero86_types::eflags::EFLAGS_FIXED_SET);
    }

    /// Only bits the current CPL is allowed to change are updated.
    pub(crate) fn set_protected_flags(&mut self, raw: u32, cpl: u8) {
        self.lazy.refresh_flags(&mut self.regs.eflags);
        let writable = self.gen.eflags_writable_mask();
        let mut mask = writable;
        let cur = self.regs.eflags;
        if cpl != 0 {
            mask &= !Eflags::IOPL.bits();
            if cpl as u8 > cur.iopl() {
                mask &= !Eflags::IF.bits();
            }
        }
        let new_bits = (raw & mask) | (cur.bits() & !mask);
        self.regs.eflags = Eflags::from_bits_truncate(new_bits | aero86_types::eflags::EFLAGS_FIXED_SET);
    }

    /// `SYSENTER`: fast PL0 transition used by flat-model kernels. `#GP(0)` if `SYSENTER_CS` is zero.
    pub fn sysenter(&mut self) -> Result<(), Exception> {
        if self.regs.sysenter.cs == 0 {
            return Err(Exception::GeneralProtection(0));
        }
        self.regs.eflags.remove(Eflags::VM);
        self.regs.eflags.remove(Eflags::IF);
        self.regs.eflags.remove(Eflags::RF);
        let cs_sel = Selector(self.regs.sysenter.cs & !0b11);
        let ss_sel = Selector((self.regs.sysenter.cs.wrapping_add(8)) & !0b11);
        self.regs.set_seg(
            SegReg::Cs,
            SegmentShadow { selector: cs_sel, base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: false, executable: true, conforming_or_expand_down: false, dpl: 0 },
        );
        self.regs.set_seg(
            SegReg::Ss,
            SegmentShadow { selector: ss_sel, base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: true, executable: false, conforming_or_expand_down: false, dpl: 0 },
        );
        self.regs.cpl = 0;
        self.regs.eip = self.regs.sysenter.eip;
        self.regs.set_gpr(Gpr::Esp, self.regs.sysenter.esp);
        Ok(())
    }

    /// `SYSEXIT`: returns to CPL3 at `EDX:ECX`.
    pub fn sysexit(&mut self) -> Result<(), Exception> {
        if self.regs.cpl != 0 {
            return Err(Exception::GeneralProtection(0));
        }
        let cs_sel = Selector(((self.regs.sysenter.cs.wrapping_add(16)) & !0b11) | 3);
        let ss_sel = Selector(((self.regs.sysenter.cs.wrapping_add(24)) & !0b11) | 3);
        self.regs.set_seg(
            SegReg::Cs,
            SegmentShadow { selector: cs_sel, base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: false, executable: true, conforming_or_expand_down: false, dpl: 3 },
        );
        self.regs.set_seg(
            SegReg::Ss,
            SegmentShadow { selector: ss_sel, base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: true, executable: false, conforming_or_expand_down: false, dpl: 3 },
        );
        self.regs.cpl = 3;
        self.regs.eip = self.regs.gpr(Gpr::Edx);
        self.regs.set_gpr(Gpr::Esp, self.regs.gpr(Gpr::Ecx));
        Ok(())
    }
}

pub(crate) enum TaskSwitchSource {
    Call,
    Jmp,
    Iret,
    Interrupt { error_code: Option<u32> },
}

/// 32-bit TSS field offsets.
mod tss32 {
    pub const PREV_LINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const ESP1: u32 = 0x0C;
    pub const SS1: u32 = 0x10;
    pub const ESP2: u32 = 0x14;
    pub const SS2: u32 = 0x18;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2C;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3C;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;
}

impl Cpu {
    /// Full task switch: save the outgoing task's state into its TSS, load
    /// the incoming task's state, mark busy/NT bits, flush the TLB (new
    /// address space). Only 32-bit TSS is modeled fully; a 16-bit TSS is
    /// accepted but its less-used fields (I/O map, debug trap) are ignored.
    pub(crate) fn task_switch(&mut self, new_tr_sel: Selector, source: TaskSwitchSource) -> Result<(), Exception> {
        let raw = self.read_descriptor_raw(new_tr_sel)?;
        let gate = GateDescriptor::decode(raw);
        if !gate.kind.is_tss() {
            return Err(Exception::GeneralProtection(new_tr_sel.raw()));
        }
        if !gate.present {
            return Err(Exception::SegmentNotPresent(new_tr_sel.raw()));
        }
        let new_busy = matches!(gate.kind, GateKind::Tss16Busy | GateKind::Tss32Busy);
        let switching_in_place = matches!(source, TaskSwitchSource::Iret);
        if new_busy && !switching_in_place {
            return Err(Exception::GeneralProtection(new_tr_sel.raw()));
        }
        let new_base = gate.offset;
        let new_is_32 = matches!(gate.kind, GateKind::Tss32Available | GateKind::Tss32Busy);

        self.lazy.refresh_flags(&mut self.regs.eflags);
        let old_base = self.regs.tr_base;
        let old_is_32 = self.regs.tr_is_32bit;
        let nesting = matches!(source, TaskSwitchSource::Call | TaskSwitchSource::Interrupt {.. });

        // Save outgoing task state.
        if old_is_32 {
            self.write_linear_u32(old_base + tss32::EIP, self.regs.eip)?;
            self.write_linear_u32(old_base + tss32::EFLAGS, self.regs.eflags.bits())?;
            self.write_linear_u32(old_base + tss32::EAX, self.regs.gpr(Gpr::Eax))?;
            self.write_linear_u32(old_base + tss32::ECX, self.regs.gpr(Gpr::Ecx))?;
            self.write_linear_u32(old_base + tss32::EDX, self.regs.gpr(Gpr::Edx))?;
            self.write_linear_u32(old_base + tss32::EBX, self.regs.gpr(Gpr::Ebx))?;
            self.write_linear_u32(old_base + tss32::ESP, self.regs.gpr(Gpr::Esp))?;
            self.write_linear_u32(old_base + tss32::EBP, self.regs.gpr(Gpr::Ebp))?;
            self.write_linear_u32(old_base + tss32::ESI, self.regs.gpr(Gpr::Esi))?;
            self.write_linear_u32(old_base + tss32::EDI, self.regs.gpr(Gpr::Edi))?;
            self.write_linear_u32(old_base + tss32::ES, self.regs.seg(SegReg::Es).selector.raw() as u32)?;
            self.write_linear_u32(old_base + tss32::CS, self.regs.seg(SegReg::Cs).selector.raw() as u32)?;
            self.write_linear_u32(old_base + tss32::SS, self.regs.seg(SegReg::Ss).selector.raw() as u32)?;
            self.write_linear_u32(old_base + tss32::DS, self.regs.seg(SegReg::Ds).selector.raw() as u32)?;
            self.write_linear_u32(old_base + tss32::FS, self.regs.seg(SegReg::Fs).selector.raw() as u32)?;
            self.write_linear_u32(old_base + tss32::GS, self.regs.seg(SegReg::Gs).selector.raw() as u32)?;
        }

        if nesting {
            // Chain the new task's back-link to the outgoing one.
            self.write_linear_u32(new_base + tss32::PREV_LINK, self.regs.tr.raw() as u32)?;
        }

        // Busy-bit housekeeping: JMP/IRET clear
        // the outgoing task's busy bit, CALL leaves it set so the nested
        // task can be returned to; JMP/CALL mark the incoming task busy,
        // IRET leaves it as found (it's already busy from the nesting it's
        // unwinding).
        if !matches!(source, TaskSwitchSource::Call | TaskSwitchSource::Interrupt {.. }) {
            self.tss_set_busy(self.regs.tr, false)?;
        }
        if !matches!(source, TaskSwitchSource::Iret) {
            self.tss_set_busy(new_tr_sel, true)?;
        }

        // Load incoming task state.
        let eip = self.read_linear_u32(new_base + tss32::EIP)?;
        let eflags_raw = self.read_linear_u32(new_base + tss32::EFLAGS)?;
        let eax = self.read_linear_u32(new_base + tss32::EAX)?;
        let ecx = self.read_linear_u32(new_base + tss32::ECX)?;
        let edx = self.read_linear_u32(new_base + tss32::EDX)?;
        let ebx = self.read_linear_u32(new_base + tss32::EBX)?;
        let esp = self.read_linear_u32(new_base + tss32::ESP)?;
        let ebp = self.read_linear_u32(new_base + tss32::EBP)?;
        let esi = self.read_linear_u32(new_base + tss32::ESI)?;
        let edi = self.read_linear_u32(new_base + tss32::EDI)?;
        let es = self.read_linear_u32(new_base + tss32::ES)? as u16;
        let cs = self.read_linear_u32(new_base + tss32::CS)? as u16;
        let ss = self.read_linear_u32(new_base + tss32::SS)? as u16;
        let ds = self.read_linear_u32(new_base + tss32::DS)? as u16;
        let fs = self.read_linear_u32(new_base + tss32::FS)? as u16;
        let gs = self.read_linear_u32(new_base + tss32::GS)? as u16;
        let ldt = self.read_linear_u32(new_base + tss32::LDT)? as u16;
        let cr3 = self.read_linear_u32(new_base + tss32::CR3)?;

        self.regs.gpr = [eax, ecx, edx, ebx, esp, ebp, esi, edi];
        self.regs.eip = eip;
        let mut new_flags = Eflags::from_bits_truncate(eflags_raw | aero86_types::eflags::EFLAGS_FIXED_SET);
        if nesting {
            new_flags.insert(Eflags::NT);
        }
        self.regs.eflags = new_flags;
        self.regs.cr3 = cr3;
        self.bus.flush_tlb();
        self.fetch_cache.invalidate();

        self.regs.ldtr = Selector(ldt);
        if !Selector(ldt).is_null() {
            if let Ok(raw_ldt) = self.read_descriptor_raw(Selector(ldt)) {
                if let Some(d) = SegmentDescriptor::decode(raw_ldt) {
                    self.regs.ldtr_base = d.base;
                    self.regs.ldtr_limit = d.limit;
                }
            }
        }

        self.regs.tr = new_tr_sel;
        self.regs.tr_base = new_base;
        self.regs.tr_is_32bit = new_is_32;

        // CPL for the incoming task is the RPL of its own CS.
        let new_cpl = Selector(cs).rpl();
        self.regs.cpl = new_cpl;

        for (reg, sel) in [(SegReg::Es, es), (SegReg::Cs, cs), (SegReg::Ss, ss), (SegReg::Ds, ds), (SegReg::Fs, fs), (SegReg::Gs, gs)] {
            let sel = Selector(sel);
            if sel.is_null() {
                self.regs.set_seg(reg, SegmentShadow { selector: sel, present: false,..SegmentShadow::NULL });
                continue;
            }
            if let Ok(raw) = self.read_descriptor_raw(sel) {
                if let Some(d) = SegmentDescriptor::decode(raw) {
                    self.regs.set_seg(reg, Self::shadow_from_descriptor(sel, &d));
                    continue;
                }
            }
            self.regs.set_seg(reg, SegmentShadow { selector: sel, present: false,..SegmentShadow::NULL });
        }

        if matches!(source, TaskSwitchSource::Interrupt { error_code: Some(_) }) {
            if let TaskSwitchSource::Interrupt { error_code: Some(ec) } = source {
                self.push(32, ec)?;
            }
        }

        // Every task switch leaves the new task owing the coprocessor a
        // fresh FPU context; CR0.TS is set so its first FPU instruction
        // faults into a lazy-restore path.
        self.regs.cr0.insert(crate::regs::Cr0::TS);
        Ok(())
    }

    fn tss_busy_bit_addr(&self, sel: Selector) -> u32 {
        let (base, _) = self.descriptor_table_base_limit(sel);
        base.wrapping_add(sel.index() as u32).wrapping_add(4)
    }

    /// Flip the type-field busy bit (bit 9 of the descriptor's second
    /// dword) in place, without disturbing the rest of the access byte.
    pub(crate) fn tss_set_busy(&mut self, sel: Selector, busy: bool) -> Result<(), Exception> {
        let addr = self.tss_busy_bit_addr(sel);
        let dword = self.read_linear_u32(addr)?;
        let new = if busy { dword | 0x200 } else { dword & !0x200 };
        self.write_linear_u32(addr, new)
    }

    fn iret_nested_task(&mut self) -> Result<(), Exception> {
        let back_link = self.read_linear_u32(self.regs.tr_base + tss32::PREV_LINK)? as u16;
        self.regs.eflags.remove(Eflags::NT);
        self.task_switch(Selector(back_link), TaskSwitchSource::Iret)
    }
}

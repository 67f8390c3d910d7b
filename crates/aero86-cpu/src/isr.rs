//! `call_isr`: the single entry point for delivering an `Exception`,
//! whether it is a CPU fault, a software `INT n`, or a PIC-resolved
//! hardware IRQ. Covers the real-mode IVT path and the
//! protected-mode IDT gate dispatch, including V8086-to-PL0 trapping.

use crate::control::TaskSwitchSource;
use crate::cpu::Cpu;
use crate::exception::Exception;
use crate::regs::{Gpr, SegReg, SegmentShadow};
use aero86_types::{Eflags, GateDescriptor, GateKind, SegmentDescriptor, Selector};

/// Consecutive contributory-exception deliveries escalate to `#DF`; a
/// fault raised while `#DF` itself is being delivered is a triple fault,
/// which this core surfaces to the harness as a second `Err` rather than
/// looping.
fn escalate(first: Exception, second: Exception) -> Exception {
    if matches!(first, Exception::DoubleFault) {
        return second;
    }
    let escalates = first.is_contributory()
    && matches!(second, Exception::DivideError | Exception::InvalidTss(_) | Exception::SegmentNotPresent(_) | Exception::StackFault(_) | Exception::GeneralProtection(_) | Exception::PageFault {.. });
    if escalates {
        Exception::DoubleFault
    } else {
        second
    }
}

pub fn call_isr(cpu: &mut Cpu, e: Exception) -> Result<(), Exception> {
    cpu.halted = false;
    cpu.lazy.refresh_flags(&mut cpu.regs.eflags);

    if !cpu.regs.protected_mode() {
        return real_mode_isr(cpu, e).map_err(|e2| escalate(e, e2));
    }
    protected_mode_isr(cpu, e).map_err(|e2| escalate(e, e2))
}

fn real_mode_isr(cpu: &mut Cpu, e: Exception) -> Result<(), Exception> {
    let vector = e.vector();
    let ivt_addr = (vector as u32) * 4;
    let new_ip = cpu.read_linear_u16(ivt_addr)? as u32;
    let new_cs = cpu.read_linear_u16(ivt_addr + 2)?;

    let flags = cpu.flags().bits();
    let ret_cs = cpu.regs.seg(SegReg::Cs).selector.raw();
    let ret_ip = cpu.regs.eip;
    cpu.push(16, flags)?;
    cpu.push(16, ret_cs as u32)?;
    cpu.push(16, ret_ip)?;

    cpu.regs.eflags.remove(Eflags::IF);
    cpu.regs.eflags.remove(Eflags::TF);
    cpu.regs.eflags.remove(Eflags::AC);
    cpu.regs.set_seg(SegReg::Cs, SegmentShadow::real_mode(new_cs));
    cpu.set_eip(new_ip, false);
    Ok(())
}

fn protected_mode_isr(cpu: &mut Cpu, e: Exception) -> Result<(), Exception> {
    let vector = e.vector();
    let idt_off = (vector as u32) * 8;
    if idt_off + 7 > cpu.regs.idtr_limit {
        return Err(Exception::GeneralProtection(idt_off as u16 | 2));
    }
    let addr = cpu.regs.idtr_base + idt_off;
    let lo = cpu.read_linear_u32(addr)?;
    let hi = cpu.read_linear_u32(addr + 4)?;
    let raw = (lo as u64) | ((hi as u64) << 32);
    let gate = GateDescriptor::decode(raw);

    if !gate.present {
        return Err(Exception::SegmentNotPresent(idt_off as u16 | 2));
    }

    let is_software = matches!(e, Exception::SoftwareInterrupt(_));
    if is_software && cpu.regs.cpl > gate.dpl {
        return Err(Exception::GeneralProtection(idt_off as u16 | 2));
    }

    if matches!(gate.kind, GateKind::TaskGate) {
        let tss_sel = Selector(gate.selector);
        cpu.task_switch(tss_sel, TaskSwitchSource::Interrupt { error_code: e.error_code() })?;
        return Ok(());
    }

    if !gate.kind.is_interrupt() && !gate.kind.is_trap() {
        return Err(Exception::GeneralProtection(idt_off as u16 | 2));
    }

    let target_sel = Selector(gate.selector);
    if target_sel.is_null() {
        return Err(Exception::GeneralProtection(idt_off as u16 | 2));
    }
    let raw_target = cpu.read_descriptor_raw(target_sel)?;
    let desc = SegmentDescriptor::decode(raw_target).ok_or(Exception::GeneralProtection(target_sel.raw()))?;
    if !desc.is_code() {
        return Err(Exception::GeneralProtection(target_sel.raw()));
    }
    if !desc.present {
        return Err(Exception::SegmentNotPresent(target_sel.raw()));
    }

    let from_v8086 = cpu.regs.eflags.contains(Eflags::VM);
    let cpl = cpu.regs.cpl;
    let gate_width = if gate.kind.is_32bit() { 32 } else { 16 };
    let flags = cpu.flags();
    let ret_cs = cpu.regs.seg(SegReg::Cs).selector.raw();
    let ret_eip = cpu.regs.eip;
    let error_code = e.error_code();

    if from_v8086 && desc.dpl != 0 {
        return Err(Exception::GeneralProtection(target_sel.raw()));
    }

    if from_v8086 || desc.dpl < cpl {
        // Privilege-raising transfer: load the target level's stack out of
        // the current TSS, then push the full "outer" frame. V8086 always
        // takes this path even though its CPL field reads 3, since V8086 is
        // architecturally less privileged than any protected-mode ring.
        let (new_ss, new_esp) = cpu.tss_stack_for_level(desc.dpl)?;
        let old_ss = cpu.regs.seg(SegReg::Ss).selector.raw();
        let old_esp = cpu.read_sp_pub();
        let old_gs = cpu.regs.seg(SegReg::Gs).selector.raw();
        let old_fs = cpu.regs.seg(SegReg::Fs).selector.raw();
        let old_ds = cpu.regs.seg(SegReg::Ds).selector.raw();
        let old_es = cpu.regs.seg(SegReg::Es).selector.raw();

        cpu.load_ss(new_ss)?;
        cpu.regs.set_gpr(Gpr::Esp, new_esp);

        if from_v8086 {
            cpu.push(32, old_gs as u32)?;
            cpu.push(32, old_fs as u32)?;
            cpu.push(32, old_ds as u32)?;
            cpu.push(32, old_es as u32)?;
            cpu.regs.eflags.remove(Eflags::VM);
            cpu.regs.set_seg(SegReg::Gs, SegmentShadow { selector: Selector::NULL, present: false,..SegmentShadow::NULL });
            cpu.regs.set_seg(SegReg::Fs, SegmentShadow { selector: Selector::NULL, present: false,..SegmentShadow::NULL });
            cpu.regs.set_seg(SegReg::Ds, SegmentShadow { selector: Selector::NULL, present: false,..SegmentShadow::NULL });
            cpu.regs.set_seg(SegReg::Es, SegmentShadow { selector: Selector::NULL, present: false,..SegmentShadow::NULL });
        }

        cpu.push(gate_width, old_ss as u32)?;
        cpu.push(gate_width, old_esp)?;
        cpu.push(gate_width, flags.bits())?;
        cpu.push(gate_width, ret_cs as u32)?;
        cpu.push(gate_width, ret_eip)?;
        if let Some(ec) = error_code {
            cpu.push(gate_width, ec)?;
        }
        cpu.load_cs(target_sel, &desc, gate.offset, desc.dpl);
    } else {
        cpu.push(gate_width, flags.bits())?;
        cpu.push(gate_width, ret_cs as u32)?;
        cpu.push(gate_width, ret_eip)?;
        if let Some(ec) = error_code {
            cpu.push(gate_width, ec)?;
        }
        cpu.load_cs(target_sel, &desc, gate.offset, cpl);
    }

    cpu.regs.eflags.remove(Eflags::TF);
    cpu.regs.eflags.remove(Eflags::RF);
    cpu.regs.eflags.remove(Eflags::NT);
    if gate.kind.is_interrupt() {
        cpu.regs.eflags.remove(Eflags::IF);
    }
    Ok(())
}

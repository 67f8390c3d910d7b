//! A CPL=3 guest executes `INT 0x80` against a
//! DPL=3 interrupt gate that targets a CPL=0 handler. The delivery must
//! switch to the TSS's SS0:ESP0, push the user SS/ESP/EFLAGS/CS/EIP frame,
//! load the kernel CS at CPL=0, and clear IF.

mod common;

use aero86_cpu::{Cpu, Cr0, Gpr, SegReg, SegmentShadow};
use aero86_types::{CpuGeneration, Eflags, Selector};
use common::{flat_descriptor, gate_descriptor, NoDevices};

const GDT_BASE: u32 = 0x1000;
const IDT_BASE: u32 = 0x2000;
const TSS_BASE: u32 = 0x3000;
const KERNEL_HANDLER: u32 = 0x5000;
const USER_CODE: u32 = 0x6000;
const USER_STACK_TOP: u32 = 0x9000;
const TSS_ESP0: u32 = 0x2000;

const KERNEL_CS: u16 = 0x08;
const KERNEL_SS: u16 = 0x10;
const USER_CS: u16 = 0x18 | 3;
const USER_SS: u16 = 0x20 | 3;

fn write_gdt_entry(cpu: &mut Cpu, selector_index: u16, raw: u64) {
    cpu.load_blob(GDT_BASE + selector_index as u32, &raw.to_le_bytes());
}

#[test]
fn int80_switches_to_kernel_stack_and_drops_to_cpl0() {
    let mut cpu = Cpu::new(0x0010_0000, CpuGeneration::from_u8(4).unwrap());
    let mut dev = NoDevices;

    // GDT: null, kernel code (0x08), kernel stack (0x10), user code (0x18),
    // user stack (0x20).
    write_gdt_entry(&mut cpu, 0x08, flat_descriptor(true, 0));
    write_gdt_entry(&mut cpu, 0x10, flat_descriptor(false, 0));
    write_gdt_entry(&mut cpu, 0x18, flat_descriptor(true, 3));
    write_gdt_entry(&mut cpu, 0x20, flat_descriptor(false, 3));
    cpu.regs.gdtr_base = GDT_BASE;
    cpu.regs.gdtr_limit = 0x27;

    // IDT[0x80]: 32-bit interrupt gate, DPL=3, to KERNEL_CS:KERNEL_HANDLER.
    let idt_entry = gate_descriptor(KERNEL_CS, KERNEL_HANDLER, 0xE, 3, true, 0);
    cpu.load_blob(IDT_BASE + 0x80 * 8, &idt_entry.to_le_bytes());
    cpu.regs.idtr_base = IDT_BASE;
    cpu.regs.idtr_limit = 0x7FF;

    // TSS: only ESP0/SS0 matter for this transfer.
    cpu.load_blob(TSS_BASE + 0x04, &TSS_ESP0.to_le_bytes());
    cpu.load_blob(TSS_BASE + 0x08, &(KERNEL_SS as u32).to_le_bytes());
    cpu.regs.tr_base = TSS_BASE;
    cpu.regs.tr_is_32bit = true;

    cpu.regs.cr0.insert(Cr0::PE);
    cpu.regs.cpl = 3;
    cpu.regs.set_seg(
        SegReg::Cs,
        SegmentShadow { selector: Selector(USER_CS), base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: false, executable: true, conforming_or_expand_down: false, dpl: 3 },
    );
    cpu.regs.set_seg(
        SegReg::Ss,
        SegmentShadow { selector: Selector(USER_SS), base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: true, executable: false, conforming_or_expand_down: false, dpl: 3 },
    );
    cpu.regs.eip = USER_CODE;
    cpu.regs.set_gpr(Gpr::Esp, USER_STACK_TOP);
    cpu.regs.eflags.insert(Eflags::IF);

    // `INT 0x80`.
    cpu.load_blob(USER_CODE, &[0xCD, 0x80]);

    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);

    assert_eq!(cpu.regs.cpl, 0);
    assert_eq!(cpu.regs.seg(SegReg::Cs).selector.raw(), KERNEL_CS);
    assert_eq!(cpu.regs.eip, KERNEL_HANDLER);
    assert!(!cpu.regs.eflags.contains(Eflags::IF));
    assert_eq!(cpu.regs.seg(SegReg::Ss).selector.raw(), KERNEL_SS);

    let new_esp = cpu.read_gpr32(Gpr::Esp as u8);
    assert_eq!(new_esp, TSS_ESP0 - 20);

    // The five pushed dwords, low address to high: EIP, CS, EFLAGS, ESP, SS.
    let ret_eip = cpu.read_mem(SegReg::Ss, new_esp, 32).unwrap();
    let ret_cs = cpu.read_mem(SegReg::Ss, new_esp + 4, 32).unwrap();
    let ret_flags = cpu.read_mem(SegReg::Ss, new_esp + 8, 32).unwrap();
    let ret_esp = cpu.read_mem(SegReg::Ss, new_esp + 12, 32).unwrap();
    let ret_ss = cpu.read_mem(SegReg::Ss, new_esp + 16, 32).unwrap();

    assert_eq!(ret_eip, USER_CODE + 2);
    assert_eq!(ret_cs, USER_CS as u32);
    assert!(Eflags::from_bits_truncate(ret_flags).contains(Eflags::IF));
    assert_eq!(ret_esp, USER_STACK_TOP);
    assert_eq!(ret_ss, USER_SS as u32);
}

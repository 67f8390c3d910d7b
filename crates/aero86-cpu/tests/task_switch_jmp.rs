//! `JMP` through a task gate must save the
//! outgoing task into its TSS, flip both tasks' busy bits, load the
//! incoming task's register file (including CR3, with a TLB flush) and
//! mark CR0.TS so the first FPU use after the switch takes the lazy
//! restore path.

mod common;

use aero86_cpu::{Cpu, Cr0, Gpr, SegReg, SegmentShadow};
use aero86_types::{CpuGeneration, Selector};
use common::{flat_descriptor, gate_descriptor, tss_descriptor, NoDevices};

const GDT_BASE: u32 = 0x1000;
const OUTGOING_TSS_BASE: u32 = 0x4000;
const TARGET_TSS_BASE: u32 = 0x5000;
const CODE_ADDR: u32 = 0x6000;
const TARGET_EIP: u32 = 0x2000;
const TARGET_CR3: u32 = 0x0000_9000;
const TARGET_EAX: u32 = 0xDEAD_BEEF;

const KERNEL_CS: u16 = 0x08;
const KERNEL_SS: u16 = 0x10;
const TASK_GATE_SEL: u16 = 0x28;
const TARGET_TSS_SEL: u16 = 0x30;
const OUTGOING_TSS_SEL: u16 = 0x38;

fn write_tss32_field(cpu: &mut Cpu, base: u32, offset: u32, val: u32) {
    cpu.load_blob(base + offset, &val.to_le_bytes());
}

#[test]
fn jmp_through_task_gate_switches_the_full_task_state() {
    let mut cpu = Cpu::new(0x10_0000, CpuGeneration::from_u8(4).unwrap());
    let mut dev = NoDevices;

    cpu.load_blob(GDT_BASE + KERNEL_CS as u32, &flat_descriptor(true, 0).to_le_bytes());
    cpu.load_blob(GDT_BASE + KERNEL_SS as u32, &flat_descriptor(false, 0).to_le_bytes());
    let task_gate = gate_descriptor(TARGET_TSS_SEL, 0, 0x5, 0, true, 0);
    cpu.load_blob(GDT_BASE + TASK_GATE_SEL as u32, &task_gate.to_le_bytes());
    let target_tss_desc = tss_descriptor(TARGET_TSS_BASE, 0x67, false, 0);
    cpu.load_blob(GDT_BASE + TARGET_TSS_SEL as u32, &target_tss_desc.to_le_bytes());
    let outgoing_tss_desc = tss_descriptor(OUTGOING_TSS_BASE, 0x67, true, 0);
    cpu.load_blob(GDT_BASE + OUTGOING_TSS_SEL as u32, &outgoing_tss_desc.to_le_bytes());
    cpu.regs.gdtr_base = GDT_BASE;
    cpu.regs.gdtr_limit = 0x3F;

    // The target task's saved register file: EAX, EIP and CR3 are what the
    // scenario checks; CS/SS/DS point back at the flat kernel segments so
    // the switched-in task is immediately runnable.
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x20, TARGET_EIP); // EIP
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x1C, TARGET_CR3); // CR3
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x28, TARGET_EAX); // EAX
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x38, 0x7000); // ESP
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x4C, KERNEL_CS as u32); // CS
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x50, KERNEL_SS as u32); // SS
    write_tss32_field(&mut cpu, TARGET_TSS_BASE, 0x54, KERNEL_SS as u32); // DS

    cpu.regs.cr0.insert(Cr0::PE);
    cpu.regs.cpl = 0;
    cpu.regs.set_seg(
        SegReg::Cs,
        SegmentShadow { selector: Selector(KERNEL_CS), base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: false, executable: true, conforming_or_expand_down: false, dpl: 0 },
    );
    cpu.regs.set_seg(
        SegReg::Ss,
        SegmentShadow { selector: Selector(KERNEL_SS), base: 0, limit: 0xFFFF_FFFF, big: true, present: true, writable: true, executable: false, conforming_or_expand_down: false, dpl: 0 },
    );
    cpu.regs.eip = CODE_ADDR;
    cpu.regs.set_gpr(Gpr::Esp, 0x8000);
    cpu.regs.tr = Selector(OUTGOING_TSS_SEL);
    cpu.regs.tr_base = OUTGOING_TSS_BASE;
    cpu.regs.tr_is_32bit = true;

    // `JMP 0x28:0` (far jmp direct, selector then offset irrelevant for a
    // task gate).
    cpu.load_blob(CODE_ADDR, &[0xEA, 0x00, 0x00, 0x00, 0x00, 0x28, 0x00]);

    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);

    assert_eq!(cpu.regs.eip, TARGET_EIP);
    assert_eq!(cpu.read_gpr32(Gpr::Eax as u8), TARGET_EAX);
    assert_eq!(cpu.regs.cr3, TARGET_CR3);
    assert_eq!(cpu.regs.tr.raw(), TARGET_TSS_SEL);
    assert_eq!(cpu.regs.tr_base, TARGET_TSS_BASE);
    assert!(cpu.regs.cr0.contains(Cr0::TS));
    assert_eq!(cpu.regs.seg(SegReg::Cs).selector.raw(), KERNEL_CS);
    assert_eq!(cpu.regs.seg(SegReg::Ss).selector.raw(), KERNEL_SS);

    // Busy-bit housekeeping: the target TSS descriptor is now busy, the
    // outgoing one is now available.
    let target_desc_word2 = cpu.read_mem(SegReg::Ds, GDT_BASE + TARGET_TSS_SEL as u32 + 4, 32).unwrap();
    assert_eq!(target_desc_word2 & 0x200, 0x200);
    let outgoing_desc_word2 = cpu.read_mem(SegReg::Ds, GDT_BASE + OUTGOING_TSS_SEL as u32 + 4, 32).unwrap();
    assert_eq!(outgoing_desc_word2 & 0x200, 0);

    // The outgoing task's live EIP/ESP were saved into its own TSS.
    let saved_eip = cpu.read_mem(SegReg::Ds, OUTGOING_TSS_BASE + 0x20, 32).unwrap();
    assert_eq!(saved_eip, CODE_ADDR + 7);
    let saved_esp = cpu.read_mem(SegReg::Ds, OUTGOING_TSS_BASE + 0x38, 32).unwrap();
    assert_eq!(saved_esp, 0x8000);
}

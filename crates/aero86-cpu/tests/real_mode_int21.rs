//! `MOV AX,1234; INT 21` from real mode, with an
//! IVT handler that just `IRET`s straight back.

mod common;

use aero86_cpu::{Cpu, Gpr, SegReg, SegmentShadow};
use aero86_types::CpuGeneration;
use common::NoDevices;

#[test]
fn int21_dispatches_through_the_ivt_and_irets_back() {
    let mut cpu = Cpu::new(0x10_0000, CpuGeneration::from_u8(4).unwrap());
    let mut dev = NoDevices;

    // Reset vector: CS=F000 (base 0xF0000), IP=FFF0 -> linear 0xFFFF0.
    cpu.regs.set_seg(SegReg::Cs, SegmentShadow::real_mode(0xF000));
    cpu.regs.eip = 0xFFF0;

    // `MOV AX, 0x1234` then `INT 0x21` at the stub.
    cpu.load_blob(0xF0000 + 0xFFF0, &[0xB8, 0x34, 0x12, 0xCD, 0x21]);

    // IVT[0x21] = 0000:0100.
    cpu.load_blob(0x21 * 4, &[0x00, 0x01, 0x00, 0x00]);
    // Handler at physical 0x0100: just IRET.
    cpu.load_blob(0x0100, &[0xCF]);

    // Step 1: MOV AX, 1234.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert_eq!(cpu.read_gpr16(Gpr::Eax as u8), 0x1234);

    // Step 2: INT 0x21 dispatches to the handler.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert_eq!(cpu.regs.seg(SegReg::Cs).selector.raw(), 0x0000);
    assert_eq!(cpu.regs.eip, 0x0100);
    // The pushed frame (flags, CS, IP, low to high address) sits just below
    // the all-zero reset-state ESP, which wrapped to 0xFFFA within the
    // 16-bit stack.
    let sp = cpu.read_gpr16(Gpr::Esp as u8);
    assert_eq!(sp, 0xFFFA);

    // Step 3: IRET pops IP/CS/FLAGS and returns just past the `INT 0x21`.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert_eq!(cpu.regs.seg(SegReg::Cs).selector.raw(), 0xF000);
    assert_eq!(cpu.regs.eip, 0xFFF5);
    assert_eq!(cpu.read_gpr16(Gpr::Esp as u8), 0x0000);
}

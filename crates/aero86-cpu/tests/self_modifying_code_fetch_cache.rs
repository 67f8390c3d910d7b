//! A store that rewrites a not-yet-executed
//! instruction byte on the same physical page as the one-slot
//! instruction-fetch cache must not serve stale bytes on the next fetch.

mod common;

use aero86_cpu::{Cpu, SegReg, SegmentShadow};
use aero86_types::CpuGeneration;
use common::NoDevices;

#[test]
fn patched_byte_is_visible_to_the_very_next_fetch() {
    let mut cpu = Cpu::new(0x10_0000, CpuGeneration::from_u8(4).unwrap());
    let mut dev = NoDevices;

    cpu.regs.set_seg(SegReg::Cs, SegmentShadow::real_mode(0));
    cpu.regs.eip = 0x1000;

    // `mov byte [0x00001010], 0x90` using a 32-bit disp-only ModRM
    // (addr32 prefix + mod=00,reg=000,rm=101) so it needs no base
    // register setup.
    cpu.load_blob(0x1000, &[0x67, 0xC6, 0x05, 0x10, 0x10, 0x00, 0x00, 0x90]);
    // `jmp short 0x1010` (rel8 = 0x1010 - 0x100A).
    cpu.load_blob(0x1008, &[0xEB, 0x06]);
    // The target byte starts out as `INT3`; if the stale pre-patch byte
    // were ever fetched this would raise a breakpoint exception instead
    // of falling through to the `HLT` that follows the patched `NOP`.
    cpu.load_blob(0x1010, &[0xCC, 0xF4]);

    // Step 1: the self-modifying `mov`, patches 0x1010 from 0xCC to 0x90.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert!(!cpu.halted);

    // Step 2: the `jmp` to 0x1010.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert_eq!(cpu.regs.eip, 0x1010);

    // Step 3: fetch at 0x1010 must see the just-patched `NOP`, not the
    // stale `INT3` — a stale fetch would have raised a breakpoint and
    // left the CPU short of the `HLT` below.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert_eq!(cpu.regs.eip, 0x1011);
    assert!(!cpu.halted);

    // Step 4: `HLT`.
    let n = cpu.step(&mut dev, 1);
    assert_eq!(n, 1);
    assert!(cpu.halted);
}

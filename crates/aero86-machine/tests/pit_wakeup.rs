//! Channel 0 is programmed in mode 3 for a ~1ms
//! period, the guest `HLT`s with interrupts enabled, and a host that only
//! advances wall-clock time (no busy-spinning) still gets the PIT's IRQ0
//! delivered on the next `run_slice`.

use std::sync::Arc;

use aero86_cpu::{Gpr, SegReg, SegmentShadow};
use aero86_machine::{Machine, MachineConfig};
use aero86_time::{Clock, FakeClock};

const IVT_VECTOR: u8 = 0x08; // master PIC's remapped IRQ0 vector.
const ISR_ADDR: u32 = 0x0500;

#[test]
fn pit_irq0_wakes_a_halted_cpu_after_the_clock_advances() {
    let clock = Arc::new(FakeClock::new(0));
    let mut machine = Machine::with_clock(MachineConfig::default(), None, None, clock.clone() as Arc<dyn Clock>).unwrap();

    {
        let cpu = machine.cpu_mut();
        cpu.regs.set_seg(SegReg::Cs, SegmentShadow::real_mode(0xF000));
        cpu.regs.eip = 0xFFF0;

        // IVT[0x08] -> 0000:ISR_ADDR; the handler just increments AX and
        // `IRET`s, so the test can tell it actually ran.
        cpu.load_blob(IVT_VECTOR as u32 * 4, &(ISR_ADDR as u16).to_le_bytes());
        cpu.load_blob(0xF0000 + ISR_ADDR, &[0x40, 0xCF]); // inc ax; iret

        // Program PIC: ICW1, ICW2 (vector base 8), ICW3, ICW4, then `STI`
        // and `HLT` with interrupts already enabled (IRQ0 starts
        // unmasked per `Pic::new`'s reset state).
        let program: &[u8] = &[
            0xB0, 0x11, // mov al, 0x11
            0xE6, 0x20, // out 0x20, al
            0xB0, 0x08, // mov al, 0x08
            0xE6, 0x21, // out 0x21, al
            0xB0, 0x04, // mov al, 0x04
            0xE6, 0x21, // out 0x21, al
            0xB0, 0x01, // mov al, 0x01
            0xE6, 0x21, // out 0x21, al
            // PIT channel 0, mode 3, binary, word access, count 1193
            // (~1ms at 1.193182 MHz).
            0xB0, 0x36, // mov al, 0x36
            0xE6, 0x43, // out 0x43, al
            0xB0, 0xA9, // mov al, 0xA9 (low byte of 1193 = 0x4A9)
            0xE6, 0x40, // out 0x40, al
            0xB0, 0x04, // mov al, 0x04 (high byte)
            0xE6, 0x40, // out 0x40, al
            0xB8, 0x00, 0x00, // mov ax, 0
            0xFB, // sti
            0xF4, // hlt
        ];
        cpu.load_blob(0xFFFF0, program);
    }

    // Run until the guest reaches `HLT` (7 `mov`/`out` pairs, `mov ax,0`,
    // `sti`, `hlt`); `run_slice` stops early once halted regardless of
    // the requested count, so a generous upper bound is fine.
    let exit = machine.run_slice(20);
    assert!(matches!(exit, aero86_machine::RunExit::Halted {.. }));
    assert!(machine.cpu().halted);
    assert_eq!(machine.cpu().read_gpr16(Gpr::Eax as u8), 0);

    // No time has passed yet: a slice now should stay halted.
    let exit = machine.run_slice(10);
    assert!(matches!(exit, aero86_machine::RunExit::Halted {.. }));

    // Advance the clock past one PIT period; the next slice should wake
    // the CPU, take IRQ0, and run the ISR's `inc ax`.
    clock.advance_us(1100);
    let exit = machine.run_slice(10);
    assert!(!machine.cpu().halted);
    match exit {
        aero86_machine::RunExit::Completed { instructions } => assert!(instructions >= 1),
        aero86_machine::RunExit::Halted {.. } => panic!("expected the PIT IRQ to wake the CPU"),
    }
    assert_eq!(machine.cpu().read_gpr16(Gpr::Eax as u8), 1);
}

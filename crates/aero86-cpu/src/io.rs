//! The port I/O callback surface `IN`/`OUT`/`INS`/`OUTS` dispatch through.
//! Owned and implemented by the host harness.
pub trait PortIo {
    fn in8(&mut self, port: u16) -> u8;
    fn in16(&mut self, port: u16) -> u16;
    fn in32(&mut self, port: u16) -> u32;
    fn out8(&mut self, port: u16, val: u8);
    fn out16(&mut self, port: u16, val: u16);
    fn out32(&mut self, port: u16, val: u32);
}

/// The combined callback surface `Cpu::step` needs every instruction
/// boundary: port I/O for `IN`/`OUT`/`INS`/`OUTS`, plus "is an interrupt
/// pending" for the PIC. A single bound rather than two separate `&mut
/// dyn` parameters, since in practice both are answered by the same
/// harness-owned device table and a real x86 core only ever has one of
/// those at a time.
pub trait Devices: PortIo + crate::interrupt_iface::InterruptController {}

impl<T: PortIo + crate::interrupt_iface::InterruptController> Devices for T {}

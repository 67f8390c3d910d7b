//! `IoBridge`: the single value `Cpu::step` borrows every call, combining
//! the PIC (for `InterruptController`) with full port dispatch (for
//! `PortIo`) across the timer-interrupt core's own ports plus whatever the
//! host attached for everything else.
//!
//! `aero86_cpu::io::Devices` requires a single type implementing both
//! `InterruptController` and `PortIo`; this is that type. It borrows
//! `Machine`'s device fields disjointly for the duration of one `step`
//! call rather than being a long-lived owner, so `Machine` keeps the PIC/
//! PIT/CMOS/host table as plain fields.

use aero86_cpu::{InterruptController, PortIo};
use aero86_devices::{Cmos, Pit};
use aero86_interrupts::PicPair;

pub const PIC_MASTER_CMD: u16 = 0x20;
pub const PIC_MASTER_DATA: u16 = 0x21;
pub const PIC_SLAVE_CMD: u16 = 0xA0;
pub const PIC_SLAVE_DATA: u16 = 0xA1;
pub const PIT_CH0: u16 = 0x40;
pub const PIT_CH1: u16 = 0x41;
pub const PIT_CH2: u16 = 0x42;
pub const PIT_CMD: u16 = 0x43;
pub const CMOS_INDEX: u16 = 0x70;
pub const CMOS_DATA: u16 = 0x71;
/// Conventional POST-debug sink: the harness may ignore it
/// silently, which is exactly what happens below.
pub const POST_DEBUG_PORT: u16 = 0x80;

/// PIT channel 0 and the RTC are both wired to the master PIC; `Machine` picks the conventional lines.
pub const PIT_IRQ_LINE: u8 = 0;
pub const RTC_IRQ_LINE: u8 = 8;

pub struct IoBridge<'a> {
    pub pic: &'a mut PicPair,
    pub pit: &'a mut Pit,
    pub cmos: &'a mut Cmos,
    pub host: &'a mut dyn PortIo,
}

impl<'a> InterruptController for IoBridge<'a> {
    fn intr_pending(&self) -> bool {
        self.pic.intr_pending()
    }

    fn read_irq(&mut self) -> u8 {
        self.pic.read_irq()
    }
}

impl<'a> PortIo for IoBridge<'a> {
    fn in8(&mut self, port: u16) -> u8 {
        match port {
            PIC_MASTER_CMD => self.pic.read_cmd(false),
            PIC_MASTER_DATA => self.pic.read_data(false),
            PIC_SLAVE_CMD => self.pic.read_cmd(true),
            PIC_SLAVE_DATA => self.pic.read_data(true),
            PIT_CH0 => self.pit.read_data(0),
            PIT_CH1 => self.pit.read_data(1),
            PIT_CH2 => self.pit.read_data(2),
            CMOS_INDEX => self.cmos.read_index(),
            CMOS_DATA => self.cmos.read_data(),
            POST_DEBUG_PORT => 0xFF,
            _ => self.host.in8(port),
        }
    }

    fn in16(&mut self, port: u16) -> u16 {
        match port {
            PIC_MASTER_CMD | PIC_MASTER_DATA | PIC_SLAVE_CMD | PIC_SLAVE_DATA | PIT_CH0 | PIT_CH1 | PIT_CH2 | CMOS_INDEX | CMOS_DATA => {
                // These are architecturally 8-bit registers; a wider IN
                // reads the byte on the low lane and open bus (0xFF) above
                // it, matching real ISA hardware's undriven upper lines.
                (self.in8(port) as u16) | 0xFF00
            }
            _ => self.host.in16(port),
        }
    }

    fn in32(&mut self, port: u16) -> u32 {
        match port {
            PIC_MASTER_CMD | PIC_MASTER_DATA | PIC_SLAVE_CMD | PIC_SLAVE_DATA | PIT_CH0 | PIT_CH1 | PIT_CH2 | CMOS_INDEX | CMOS_DATA => {
                (self.in8(port) as u32) | 0xFFFF_FF00
            }
            _ => self.host.in32(port),
        }
    }

    fn out8(&mut self, port: u16, val: u8) {
        match port {
            PIC_MASTER_CMD => self.pic.write_cmd(false, val),
            PIC_MASTER_DATA => self.pic.write_data(false, val),
            PIC_SLAVE_CMD => self.pic.write_cmd(true, val),
            PIC_SLAVE_DATA => self.pic.write_data(true, val),
            PIT_CH0 => self.pit.write_data(0, val),
            PIT_CH1 => self.pit.write_data(1, val),
            PIT_CH2 => self.pit.write_data(2, val),
            PIT_CMD => self.pit.write_control(val),
            CMOS_INDEX => self.cmos.write_index(val),
            CMOS_DATA => self.cmos.write_data(val),
            POST_DEBUG_PORT => {}
            _ => self.host.out8(port, val),
        }
    }

    fn out16(&mut self, port: u16, val: u16) {
        match port {
            PIC_MASTER_CMD | PIC_MASTER_DATA | PIC_SLAVE_CMD | PIC_SLAVE_DATA | PIT_CH0 | PIT_CH1 | PIT_CH2 | PIT_CMD | CMOS_INDEX | CMOS_DATA => {
                self.out8(port, val as u8)
            }
            _ => self.host.out16(port, val),
        }
    }

    fn out32(&mut self, port: u16, val: u32) {
        match port {
            PIC_MASTER_CMD | PIC_MASTER_DATA | PIC_SLAVE_CMD | PIC_SLAVE_DATA | PIT_CH0 | PIT_CH1 | PIT_CH2 | PIT_CMD | CMOS_INDEX | CMOS_DATA => {
                self.out8(port, val as u8)
            }
            _ => self.host.out32(port, val),
        }
    }
}

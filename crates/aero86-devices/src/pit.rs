//! The 8254 programmable interval timer: three channels at
//! ports 0x40-0x43, channel 0 wired to PIC IRQ0. Every counter value is a
//! pure function of `(mode, count, load_us, now_us)` recomputed on each
//! read or IRQ-update call — nothing is cached between ticks, so a host
//! that only advances wall-clock time still sees a consistent count on the
//! next read.

use aero86_interrupts::PicPair;
use aero86_time::Clock;
use std::sync::Arc;

/// 1.193182 MHz, the PC platform's crystal-derived PIT input clock.
const PIT_HZ: u64 = 1_193_182;

/// Which half of a 16-bit access (LSB/MSB/both) is in flight, mirrored
/// independently for reads and writes per the channel's configured
/// `rw_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessPhase {
    LsbOnly,
    MsbOnly,
    Word0,
    Word1,
}

impl AccessPhase {
    fn from_access_field(bits: u8) -> Self {
        match bits & 0x3 {
            1 => AccessPhase::LsbOnly,
            2 => AccessPhase::MsbOnly,
            _ => AccessPhase::Word0,
        }
    }
}

#[derive(Debug, Clone)]
struct Channel {
    /// 1..=0x10000; a programmed value of 0 means 65536.
    count: u32,
    latched_count: u16,
    count_latched: Option<AccessPhase>,
    status: u8,
    status_latched: bool,
    read_state: AccessPhase,
    write_state: AccessPhase,
    write_latch: u8,
    rw_mode: u8,
    mode: u8,
    bcd: bool,
    gate: bool,
    count_load_us: u64,
    last_irq_count: u32,
}

impl Channel {
    fn new(gate: bool, now_us: u64) -> Self {
        Self {
            count: 0x10000,
            latched_count: 0,
            count_latched: None,
            status: 0,
            status_latched: false,
            read_state: AccessPhase::LsbOnly,
            write_state: AccessPhase::LsbOnly,
            write_latch: 0,
            rw_mode: 3,
            mode: 3,
            bcd: false,
            gate,
            count_load_us: now_us,
            last_irq_count: 0,
        }
    }

    fn load_count(&mut self, val: u32, now_us: u64) {
        self.count = if val == 0 { 0x10000 } else { val };
        self.count_load_us = now_us;
        self.last_irq_count = 0;
    }

    /// Elapsed PIT ticks since the count was loaded.
    fn elapsed_ticks(&self, now_us: u64) -> u64 {
        now_us.wrapping_sub(self.count_load_us) * PIT_HZ / 1_000_000
    }

    fn current_count(&self, now_us: u64) -> u16 {
        let d = self.elapsed_ticks(now_us);
        let count = self.count as u64;
        let counter = match self.mode {
            0 | 1 | 4 | 5 => (count.wrapping_sub(d)) & 0xFFFF,
            3 => count - ((2 * d) % count),
            _ => count - (d % count),
        };
        counter as u16
    }

    fn out_bit(&self, now_us: u64) -> bool {
        let d = self.elapsed_ticks(now_us);
        match self.mode {
            1 => d < self.count as u64,
            2 => d % (self.count as u64) == 0 && d != 0,
            3 => (d % self.count as u64) < ((self.count as u64 + 1) >> 1),
            4 | 5 => d == self.count as u64,
            _ => d >= self.count as u64,
        }
    }

    fn latch_count(&mut self, now_us: u64) {
        if self.count_latched.is_none() {
            self.latched_count = self.current_count(now_us);
            self.count_latched = Some(AccessPhase::from_access_field(self.rw_mode));
        }
    }
}

/// The three-channel PIT. Channel 0's output drives PIC IRQ0; channel 2 is
/// cross-wired to the PC-speaker gate by the host (the host reads
/// `out_bit(2)` and `get_gate(2)`/`set_gate(2)` to implement the speaker,
/// which lives outside this crate's scope).
pub struct Pit {
    channels: [Channel; 3],
    clock: Arc<dyn Clock>,
}

impl Pit {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let now_us = clock.now_us();
        Self {
            channels: [
                Channel::new(true, now_us),
                Channel::new(true, now_us),
                Channel::new(false, now_us),
            ],
            clock,
        }
    }

    pub fn reset(&mut self) {
        let now_us = self.clock.now_us();
        self.channels = [
            Channel::new(true, now_us),
            Channel::new(true, now_us),
            Channel::new(false, now_us),
        ];
    }

    /// Write to the data port for `channel` (0x40/0x41/0x42).
    pub fn write_data(&mut self, channel: u8, val: u8) {
        let now_us = self.clock.now_us();
        let ch = &mut self.channels[channel as usize];
        match ch.write_state {
            AccessPhase::LsbOnly => ch.load_count(val as u32, now_us),
            AccessPhase::MsbOnly => ch.load_count((val as u32) << 8, now_us),
            AccessPhase::Word0 => {
                ch.write_latch = val;
                ch.write_state = AccessPhase::Word1;
            }
            AccessPhase::Word1 => {
                let low = ch.write_latch as u32;
                ch.load_count(low | ((val as u32) << 8), now_us);
                ch.write_state = AccessPhase::Word0;
            }
        }
    }

    /// Read the data port for `channel`.
    pub fn read_data(&mut self, channel: u8) -> u8 {
        let now_us = self.clock.now_us();
        let ch = &mut self.channels[channel as usize];
        if ch.status_latched {
            ch.status_latched = false;
            return ch.status;
        }
        if let Some(phase) = ch.count_latched {
            return match phase {
                AccessPhase::LsbOnly => {
                    ch.count_latched = None;
                    (ch.latched_count & 0xFF) as u8
                }
                AccessPhase::MsbOnly => {
                    ch.count_latched = None;
                    (ch.latched_count >> 8) as u8
                }
                AccessPhase::Word0 => {
                    ch.count_latched = Some(AccessPhase::MsbOnly);
                    (ch.latched_count & 0xFF) as u8
                }
                AccessPhase::Word1 => unreachable!("count latch never parks in Word1"),
            };
        }
        match ch.read_state {
            AccessPhase::LsbOnly => (ch.current_count(now_us) & 0xFF) as u8,
            AccessPhase::MsbOnly => (ch.current_count(now_us) >> 8) as u8,
            AccessPhase::Word0 => {
                let count = ch.current_count(now_us);
                ch.read_state = AccessPhase::Word1;
                (count & 0xFF) as u8
            }
            AccessPhase::Word1 => {
                let count = ch.current_count(now_us);
                ch.read_state = AccessPhase::Word0;
                (count >> 8) as u8
            }
        }
    }

    /// Write the control word port (0x43): mode-set, counter-latch, or
    /// read-back command (channel field == 3).
    pub fn write_control(&mut self, val: u8) {
        let now_us = self.clock.now_us();
        let channel = val >> 6;
        if channel == 3 {
            for (i, ch) in self.channels.iter_mut().enumerate() {
                if val & (2 << i) == 0 {
                    continue;
                }
                if val & 0x20 == 0 {
                    ch.latch_count(now_us);
                }
                if val & 0x10 == 0 && !ch.status_latched {
                    ch.status = ((ch.out_bit(now_us) as u8) << 7)
                    | (ch.rw_mode << 4)
                    | (ch.mode << 1)
                    | (ch.bcd as u8);
                    ch.status_latched = true;
                }
            }
            return;
        }
        let ch = &mut self.channels[channel as usize];
        let access = (val >> 4) & 3;
        if access == 0 {
            ch.latch_count(now_us);
        } else {
            ch.rw_mode = access;
            ch.read_state = AccessPhase::from_access_field(access);
            ch.write_state = AccessPhase::from_access_field(access);
            ch.mode = (val >> 1) & 7;
            ch.bcd = val & 1 != 0;
        }
    }

    pub fn get_out(&self, channel: u8) -> bool {
        self.channels[channel as usize].out_bit(self.clock.now_us())
    }

    pub fn get_gate(&self, channel: u8) -> bool {
        self.channels[channel as usize].gate
    }

    /// `val` gates the counter; a rising edge on modes 1/2/3/5 restarts the
    /// count window.
    pub fn set_gate(&mut self, channel: u8, val: bool) {
        let now_us = self.clock.now_us();
        let ch = &mut self.channels[channel as usize];
        let rising = !ch.gate && val;
        if rising && matches!(ch.mode, 1 | 2 | 3 | 5) {
            ch.count_load_us = now_us;
        }
        ch.gate = val;
    }

    pub fn initial_count(&self, channel: u8) -> u32 {
        self.channels[channel as usize].count
    }

    pub fn mode(&self, channel: u8) -> u8 {
        self.channels[channel as usize].mode
    }

    /// Called once per harness tick. Only modes 2 and 3 (the periodic and
    /// square-wave modes) generate the recurring edge-triggered pulse on
    /// channel 0's PIC line; catch-up is capped at 10 pulses per call so a
    /// long host stall cannot wedge the loop, and `count_load_us` is
    /// resynchronized once the elapsed-ticks counter risks wrapping 32
    /// bits, here
    pub fn update_irq(&mut self, pic: &mut PicPair, irq_line: u8) {
        let now_us = self.clock.now_us();
        let ch = &mut self.channels[0];
        if !matches!(ch.mode, 2 | 3) {
            return;
        }
        let d = ch.elapsed_ticks(now_us);
        let mut pulses = 0;
        while (ch.last_irq_count as u64 + ch.count as u64).wrapping_sub(d) as i64 <= 0 && pulses < 10 {
            pic.set_irq(irq_line, true);
            pic.set_irq(irq_line, false);
            ch.last_irq_count = ch.last_irq_count.wrapping_add(ch.count);
            pulses += 1;
            if now_us.wrapping_sub(ch.count_load_us) > (1u64 << 31) {
                let count = ch.count;
                ch.load_count(count, now_us);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero86_time::FakeClock;

    fn pit_with_mode3(clock: &Arc<FakeClock>, channel: u8, count: u16) -> Pit {
        let mut pit = Pit::new(clock.clone());
        // access=WORD0, mode=3, binary.
        pit.write_control((channel << 6) | (3 << 4) | (3 << 1));
        pit.write_data(channel, (count & 0xFF) as u8);
        pit.write_data(channel, (count >> 8) as u8);
        pit
    }

    #[test]
    fn counts_down_in_mode3() {
        let clock = Arc::new(FakeClock::new(0));
        let pit = pit_with_mode3(&clock, 0, 1193);
        clock.advance_us(500);
        let count = pit.channels[0].current_count(clock.now_us());
        assert!(count < 1193);
    }

    #[test]
    fn lsb_then_msb_write_order_matches_word0_word1() {
        let clock = Arc::new(FakeClock::new(0));
        let mut pit = Pit::new(clock.clone());
        pit.write_control((0 << 6) | (3 << 4) | (3 << 1));
        pit.write_data(0, 0x34);
        pit.write_data(0, 0x12);
        assert_eq!(pit.initial_count(0), 0x1234);
    }

    #[test]
    fn zero_count_means_65536() {
        let clock = Arc::new(FakeClock::new(0));
        let mut pit = Pit::new(clock.clone());
        pit.write_control((0 << 6) | (3 << 4) | (3 << 1));
        pit.write_data(0, 0x00);
        pit.write_data(0, 0x00);
        assert_eq!(pit.initial_count(0), 0x10000);
    }

    #[test]
    fn update_irq_pulses_pic_once_per_period() {
        let clock = Arc::new(FakeClock::new(0));
        let pit_count = 1193u16; // ~1ms at 1.193182MHz.
        let mut pit = pit_with_mode3(&clock, 0, pit_count);
        let mut pic = PicPair::new();
        pic.write_cmd(false, 0x11);
        pic.write_data(false, 0x08);
        pic.write_data(false, 0x04);
        pic.write_data(false, 0x01);
        clock.advance_us(1100);
        pit.update_irq(&mut pic, 0);
        assert!(pic.intr_pending());
        assert_eq!(pic.read_irq(), 0x08);
    }

    #[test]
    fn readback_latches_count_for_selected_channels() {
        let clock = Arc::new(FakeClock::new(0));
        let mut pit = pit_with_mode3(&clock, 0, 1000);
        clock.advance_us(100);
        // Read-back: channel==3 selector, channel 0 bit set (bit1), latch count (bit5 clear), skip status (bit4 set).
        pit.write_control(0xC0 | 0x02 | 0x10);
        let lsb = pit.read_data(0);
        let msb = pit.read_data(0);
        let latched = (lsb as u16) | ((msb as u16) << 8);
        assert!(latched <= 1000);
    }
}

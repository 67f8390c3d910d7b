//! MC146818-style CMOS/RTC: 128 bytes of battery-backed
//! register storage behind an index/data port pair, a periodic-interrupt
//! source derived from Register A's rate-select bits, and time-of-day
//! registers refreshed from host wall-clock on every read.

use aero86_interrupts::PicPair;
use std::time::{SystemTime, UNIX_EPOCH};

const REG_SECONDS: usize = 0x00;
const REG_MINUTES: usize = 0x02;
const REG_HOURS: usize = 0x04;
const REG_WEEKDAY: usize = 0x06;
const REG_DAY_OF_MONTH: usize = 0x07;
const REG_MONTH: usize = 0x08;
const REG_YEAR: usize = 0x09;
const REG_A: usize = 0x0A;
const REG_B: usize = 0x0B;
const REG_C: usize = 0x0C;
const REG_D: usize = 0x0D;
const REG_CENTURY: usize = 0x32;

/// Register B bit 2: 1 = binary time-of-day encoding, 0 = BCD. Defaults to
/// BCD and is never flipped internally, but a guest is free to program it
/// and the request is honored on every refresh.
const REG_B_DM_BINARY: u8 = 1 << 2;
const REG_B_PIE: u8 = 1 << 6;
const REG_C_PF: u8 = 1 << 6;
const REG_C_IRQF: u8 = 1 << 7;
/// Register D bit 7: valid RAM / battery-good indicator, set once at
/// construction and never cleared by this model (no battery to fail).
const REG_D_VRT: u8 = 1 << 7;

fn to_bcd(v: u8) -> u8 {
    ((v / 10) << 4) | (v % 10)
}

/// Days since the civil epoch to (year, month, day), the Howard
/// Hinnant `civil_from_days` algorithm. Avoids pulling in a calendar
/// crate for a single BCD date stamp.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

struct WallClock {
    year: u32,
    month: u32,
    day: u32,
    weekday: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

fn host_wall_clock() -> WallClock {
    let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default();
    let secs = now.as_secs() as i64;
    let days = secs.div_euclid(86400);
    let time_of_day = secs.rem_euclid(86400) as u32;
    let (year, month, day) = civil_from_days(days);
    // 1970-01-01 was a Thursday (weekday index 4, 0 = Sunday).
    let weekday = ((days % 7 + 7 + 4) % 7) as u32;
    WallClock {
        year: year as u32,
        month,
        day,
        weekday,
        hour: time_of_day / 3600,
        minute: (time_of_day / 60) % 60,
        second: time_of_day % 60,
    }
}

/// One CMOS/RTC controller at ports 0x70 (index)/0x71 (data).
pub struct Cmos {
    regs: [u8; 128],
    index: u8,
    /// RTC-clock (32768 Hz) ticks until the next periodic-interrupt edge.
    periodic_deadline: u64,
    periodic_period: u64,
    /// Free-running 32768 Hz tick counter, advanced by the harness.
    ticks: u64,
}

impl Cmos {
    pub fn new() -> Self {
        let mut regs = [0u8; 128];
        regs[REG_A] = 0x26; // 32768 Hz base, rate select 6 (976.56 us default).
        regs[REG_B] = 0x02; // 24-hour mode, BCD, no alarm/periodic/update interrupts yet.
        regs[REG_D] = REG_D_VRT;
        let mut cmos = Self {
            regs,
            index: 0,
            periodic_deadline: 0,
            periodic_period: period_ticks(0x26),
            ticks: 0,
        };
        cmos.refresh_time_of_day();
        cmos
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Write the index port (0x70). Bit 7 is the NMI-disable bit; guests
    /// toggle it routinely and this core has no NMI path to gate, so it is
    /// accepted and otherwise ignored.
    pub fn write_index(&mut self, val: u8) {
        self.index = val & 0x7F;
    }

    pub fn read_index(&self) -> u8 {
        self.index | 0x80
    }

    /// Read the data port (0x71): refreshes the time-of-day bytes first so
    /// every read observes the current host wall clock.
    pub fn read_data(&mut self) -> u8 {
        let idx = self.index as usize;
        if is_time_of_day_register(idx) {
            self.refresh_time_of_day();
        }
        let val = self.regs[idx];
        if idx == REG_C {
            // Reading Register C clears all pending interrupt-flag bits.
            self.regs[REG_C] = 0;
        }
        val
    }

    pub fn write_data(&mut self, val: u8) {
        let idx = self.index as usize;
        match idx {
            REG_C | REG_D => {} // read-only status registers.
            REG_A => {
                self.regs[REG_A] = val & 0x7F;
                self.periodic_period = period_ticks(val);
            }
            _ => self.regs[idx] = val,
        }
    }

    fn binary_mode(&self) -> bool {
        self.regs[REG_B] & REG_B_DM_BINARY != 0
    }

    fn encode(&self, v: u8) -> u8 {
        if self.binary_mode() {
            v
        } else {
            to_bcd(v)
        }
    }

    fn refresh_time_of_day(&mut self) {
        let wall = host_wall_clock();
        self.regs[REG_SECONDS] = self.encode(wall.second as u8);
        self.regs[REG_MINUTES] = self.encode(wall.minute as u8);
        self.regs[REG_HOURS] = self.encode(wall.hour as u8);
        self.regs[REG_WEEKDAY] = self.encode((wall.weekday + 1) as u8);
        self.regs[REG_DAY_OF_MONTH] = self.encode(wall.day as u8);
        self.regs[REG_MONTH] = self.encode(wall.month as u8);
        self.regs[REG_YEAR] = self.encode((wall.year % 100) as u8);
        self.regs[REG_CENTURY] = self.encode((wall.year / 100) as u8);
    }

    /// Advance the free-running 32768 Hz counter by `rtc_ticks` and, if
    /// Register B's PIE bit is set and the periodic deadline has elapsed,
    /// latch Register C's PF/IRQF bits and pulse `irq_line` low-high-low.
    pub fn update_irq(&mut self, pic: &mut PicPair, irq_line: u8, rtc_ticks: u64) {
        self.ticks = self.ticks.wrapping_add(rtc_ticks);
        if self.regs[REG_B] & REG_B_PIE == 0 {
            return;
        }
        if (self.ticks.wrapping_sub(self.periodic_deadline) as i64) < 0 {
            return;
        }
        self.regs[REG_C] |= REG_C_PF | REG_C_IRQF;
        pic.set_irq(irq_line, true);
        pic.set_irq(irq_line, false);
        self.periodic_deadline = self.periodic_deadline.wrapping_add(self.periodic_period.max(1));
    }
}

impl Default for Cmos {
    fn default() -> Self {
        Self::new()
    }
}

fn is_time_of_day_register(idx: usize) -> bool {
    matches!(
        idx,
        REG_SECONDS | REG_MINUTES | REG_HOURS | REG_WEEKDAY | REG_DAY_OF_MONTH | REG_MONTH | REG_YEAR | REG_CENTURY
    )
}

/// Register A bits 0..3: period code, `1 << (code - 1)` 32768 Hz ticks.
/// Code 0 disables the periodic interrupt.
fn period_ticks(reg_a: u8) -> u64 {
    let code = reg_a & 0x0F;
    if code == 0 {
        u64::MAX
    } else {
        1u64 << (code - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_d_reports_valid_ram() {
        let cmos = Cmos::new();
        assert_eq!(cmos.regs[REG_D] & REG_D_VRT, REG_D_VRT);
    }

    #[test]
    fn seconds_register_is_bcd_by_default() {
        let mut cmos = Cmos::new();
        cmos.write_index(REG_SECONDS as u8);
        let val = cmos.read_data();
        // BCD digits: each nibble is 0..=9.
        assert!(val & 0x0F <= 9);
        assert!((val >> 4) <= 9);
    }

    #[test]
    fn binary_mode_disables_bcd_encoding() {
        let mut cmos = Cmos::new();
        cmos.write_index(REG_B as u8);
        cmos.write_data(REG_B_DM_BINARY | 0x02);
        cmos.write_index(REG_SECONDS as u8);
        let val = cmos.read_data();
        assert!(val <= 59);
    }

    #[test]
    fn periodic_interrupt_fires_once_period_elapses() {
        let mut cmos = Cmos::new();
        cmos.write_index(REG_A as u8);
        cmos.write_data(0x06); // period code 6 -> 32 ticks.
        cmos.write_index(REG_B as u8);
        cmos.write_data(REG_B_PIE | 0x02);
        let mut pic = PicPair::new();
        pic.write_cmd(true, 0x11);
        pic.write_data(true, 0x70);
        pic.write_data(true, 0x02);
        pic.write_data(true, 0x01);
        cmos.update_irq(&mut pic, 0, 32);
        assert!(pic.intr_pending());
        cmos.write_index(REG_C as u8);
        let status = cmos.read_data();
        assert_eq!(status & REG_C_PF, REG_C_PF);
        // Register C clears on read.
        assert_eq!(cmos.read_data(), 0);
    }

    #[test]
    fn index_port_always_reports_nmi_bit_set_on_read() {
        let mut cmos = Cmos::new();
        cmos.write_index(0x00);
        assert_eq!(cmos.read_index(), 0x80);
    }
}

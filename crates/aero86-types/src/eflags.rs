use bitflags::bitflags;

bitflags! {
    /// EFLAGS bit layout per the IA-32 SDM. Values not named here (reserved
    /// bits) are masked out by `CpuGeneration::eflags_writable_mask`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 0b11 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

impl Eflags {
    pub fn iopl(self) -> u8 {
        ((self.bits() >> 12) & 0b11) as u8
    }

    pub fn with_iopl(self, iopl: u8) -> Self {
        let cleared = self.bits() & !Self::IOPL.bits();
        Self::from_bits_truncate(cleared | ((iopl as u32 & 0b11) << 12))
    }
}

/// Bit 1 is always 1 and is not independently writable; EFLAGS is always
/// read/written with bit 1 forced set.
pub const EFLAGS_FIXED_SET: u32 = 1 << 1;

/// 386: CF,PF,AF,ZF,SF,TF,IF,DF,OF,IOPL,NT. No RF/VM (introduced in 486),
/// no AC (introduced alongside 486 as well, gated separately), no
/// VIF/VIP/ID (Pentium).
pub const EFLAGS_WRITABLE_386: u32 = 0x0003_7FD5;

/// 486 adds RF, AC, VM.
pub const EFLAGS_WRITABLE_486: u32 = EFLAGS_WRITABLE_386 | Eflags::RF.bits() | Eflags::VM.bits() | Eflags::AC.bits();

/// Pentium/Pentium Pro add VIF, VIP, ID.
pub const EFLAGS_WRITABLE_PENTIUM: u32 =
EFLAGS_WRITABLE_486 | Eflags::VIF.bits() | Eflags::VIP.bits() | Eflags::ID.bits();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iopl_round_trips() {
        let f = Eflags::empty().with_iopl(3);
        assert_eq!(f.iopl(), 3);
        let f = f.with_iopl(0);
        assert_eq!(f.iopl(), 0);
    }
}

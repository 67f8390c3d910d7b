//! Prefix and ModR/M+SIB decoding. Pure, fetch-independent
//! pieces live here; the actual byte fetching (which needs the I-fetch
//! cache and TLB) is threaded through by `execute::Cpu::decode_modrm`.

use crate::regs::SegReg;

/// `REP`/`REPNE` prefix, distinguishing the two because `CMPS`/`SCAS`
/// terminate on opposite `ZF` polarities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repne,
}

/// The prefix bytes accumulated before an opcode. `LOCK` is tolerated but has no semantic effect in a
/// single-logical-CPU core.
#[derive(Clone, Copy, Debug, Default)]
pub struct Prefixes {
    pub segment_override: Option<SegReg>,
    pub operand_size_override: bool,
    pub address_size_override: bool,
    pub rep: Option<RepPrefix>,
    pub lock: bool,
}

impl Prefixes {
    /// Returns `Some(())` (consumed) if `byte` is a prefix, updating
    /// `self`; `None` if `byte` should be treated as the opcode.
    pub fn consume(&mut self, byte: u8) -> bool {
        match byte {
            0x26 => self.segment_override = Some(SegReg::Es),
            0x2E => self.segment_override = Some(SegReg::Cs),
            0x36 => self.segment_override = Some(SegReg::Ss),
            0x3E => self.segment_override = Some(SegReg::Ds),
            0x64 => self.segment_override = Some(SegReg::Fs),
            0x65 => self.segment_override = Some(SegReg::Gs),
            0x66 => self.operand_size_override = true,
            0x67 => self.address_size_override = true,
            0xF0 => self.lock = true,
            0xF2 => self.rep = Some(RepPrefix::Repne),
            0xF3 => self.rep = Some(RepPrefix::Rep),
            _ => return false,
        }
        true
    }
}

/// A decoded ModR/M byte's addressing-mode field, before SIB/displacement
/// resolution.
#[derive(Clone, Copy, Debug)]
pub struct ModRmByte {
    pub md: u8,
    pub reg: u8,
    pub rm: u8,
}

impl ModRmByte {
    pub fn decode(byte: u8) -> Self {
        ModRmByte {
            md: byte >> 6,
            reg: (byte >> 3) & 7,
            rm: byte & 7,
        }
    }

    pub fn is_register_direct(self) -> bool {
        self.md == 3
    }
}

/// A decoded operand location: either a register index (interpretation –
/// 8/16/32-bit – is up to the caller's operand size) or a linear offset
/// within the effective segment (base already added by the caller once the
/// segment override/default is known).
#[derive(Clone, Copy, Debug)]
pub enum RmOperand {
    Reg(u8),
    Mem { seg: SegReg, offset: u32 },
}

/// 32-bit SIB byte fields.
#[derive(Clone, Copy, Debug)]
pub struct Sib {
    pub scale: u8,
    pub index: u8,
    pub base: u8,
}

impl Sib {
    pub fn decode(byte: u8) -> Self {
        Sib {
            scale: byte >> 6,
            index: (byte >> 3) & 7,
            base: byte & 7,
        }
    }
}

/// Default segment for a 32-bit ModR/M addressing form, here:
/// "SIB with base=4 (ESP) or base=5 (EBP) and mod!=0 implies default
/// segment SS;... all other forms default to DS".
pub fn default_segment_32(modrm: ModRmByte, sib: Option<Sib>) -> SegReg {
    if let Some(sib) = sib {
        if (sib.base == 4 || sib.base == 5) && modrm.md != 0 {
            return SegReg::Ss;
        }
        if sib.base == 5 && modrm.md == 0 {
            return SegReg::Ss;
        }
    }
    if modrm.rm == 5 && modrm.md == 0 {
        // disp32-only addressing: still DS by default (no base register).
        return SegReg::Ds;
    }
    SegReg::Ds
}

/// Default segment for 16-bit addressing: BP-based forms default to SS.
pub fn default_segment_16(rm: u8, md: u8) -> SegReg {
    match rm {
        2 | 3 => SegReg::Ss,
        6 if md != 0 => SegReg::Ss,
        _ => SegReg::Ds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_consume_segment_override() {
        let mut p = Prefixes::default();
        assert!(p.consume(0x2E));
        assert_eq!(p.segment_override, Some(SegReg::Cs));
        assert!(!p.consume(0x90)); // NOP is not a prefix.
    }

    #[test]
    fn modrm_register_direct_detected() {
        let m = ModRmByte::decode(0xC0);
        assert!(m.is_register_direct());
        assert_eq!(m.reg, 0);
        assert_eq!(m.rm, 0);
    }

    #[test]
    fn sib_esp_base_defaults_to_ss_with_displacement() {
        let modrm = ModRmByte::decode(0b01_000_100); // mod=1, rm=4(SIB)
        let sib = Sib::decode(0b00_000_100); // base=ESP
        assert_eq!(default_segment_32(modrm, Some(sib)), SegReg::Ss);
    }

    #[test]
    fn bp_based_16bit_defaults_to_ss() {
        assert_eq!(default_segment_16(6, 1), SegReg::Ss);
        assert_eq!(default_segment_16(0, 1), SegReg::Ds);
    }
}

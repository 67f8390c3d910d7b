//! Segment and gate descriptors, decoded from their raw 8-byte GDT/LDT/IDT
//! encoding into a tagged representation: segment descriptors (S=1) as
//! `SegmentDescriptor`, system descriptors (S=0: gates, TSS, LDT) as
//! `GateDescriptor`.

/// The type-3 bit (bit 12 of the access byte, usually called "S") splits a
/// descriptor into a code/data segment or a system descriptor (gate, TSS,
/// LDT). `SegmentKind` is only the code/data side; system descriptors are
/// represented by `GateDescriptor`/`SystemKind` instead since callers
/// almost never want to treat a call gate and a data segment uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Data { writable: bool, expand_down: bool },
    Code { readable: bool, conforming: bool },
}

/// A decoded code/data segment descriptor (S=1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u32,
    pub limit: u32,
    pub kind: SegmentKind,
    pub dpl: u8,
    pub present: bool,
    /// D/B bit: 32-bit default operand/stack size when set, 16-bit
    /// otherwise.
    pub big: bool,
    /// G bit: limit is in 4 KiB pages when set.
    pub granularity_4k: bool,
    pub accessed: bool,
}

impl SegmentDescriptor {
    /// Decode an 8-byte GDT/LDT entry. Returns `None` for a system
    /// descriptor (S=0) or a reserved/invalid encoding; the caller raises
    /// `#GP` on `None` here
    pub fn decode(raw: u64) -> Option<Self> {
        let limit_low = raw & 0xFFFF;
        let base_low = (raw >> 16) & 0xFFFFFF;
        let access = (raw >> 40) & 0xFF;
        let limit_high = (raw >> 48) & 0xF;
        let flags = (raw >> 52) & 0xF;
        let base_high = (raw >> 56) & 0xFF;

        let s_bit = (access >> 4) & 1;
        if s_bit == 0 {
            return None;
        }

        let present = (access >> 7) & 1 != 0;
        let dpl = ((access >> 5) & 0b11) as u8;
        let accessed = access & 1 != 0;
        let type_bits = (access >> 1) & 0b111;

        // `type_bits` packs the access byte's RW bit (original bit1) at its
        // own bit0 and the DC/conforming bit (original bit2) at its own
        // bit1 — the E bit (original bit3) is what selected the Code/Data
        // branch above and isn't part of `type_bits`'s meaning here.
        let kind = if (access >> 3) & 1 != 0 {
            SegmentKind::Code {
                readable: type_bits & 0b001 != 0,
                conforming: type_bits & 0b010 != 0,
            }
        } else {
            SegmentKind::Data {
                writable: type_bits & 0b001 != 0,
                expand_down: type_bits & 0b010 != 0,
            }
        };

        let base = (base_low | (base_high << 24)) as u32;
        let raw_limit = (limit_low | (limit_high << 16)) as u32;
        let granularity_4k = (flags >> 3) & 1 != 0;
        let limit = if granularity_4k {
            (raw_limit << 12) | 0xFFF
        } else {
            raw_limit
        };

        Some(SegmentDescriptor {
                base,
                limit,
                kind,
                dpl,
                present,
                big: (flags >> 2) & 1 != 0,
                granularity_4k,
                accessed,
        })
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, SegmentKind::Code {.. })
    }
}

/// System-descriptor / gate "type" field (access byte bits 0..3) for the
/// encodings this core actually dispatches on. Other type codes
/// (e.g. busy/available 16-bit TSS in legacy trees) are folded into
/// `SystemKind::Other` and rejected with `#GP` by the caller, matching
/// this core's "other types -> #GP".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateKind {
    TaskGate,
    InterruptGate16,
    TrapGate16,
    InterruptGate32,
    TrapGate32,
    Tss16Available,
    Tss16Busy,
    Tss32Available,
    Tss32Busy,
    Ldt,
    CallGate16,
    CallGate32,
    Other(u8),
}

impl GateKind {
    pub fn from_type(type_bits: u8) -> Self {
        match type_bits {
            0x5 => Self::TaskGate,
            0x6 => Self::InterruptGate16,
            0x7 => Self::TrapGate16,
            0xE => Self::InterruptGate32,
            0xF => Self::TrapGate32,
            0x1 => Self::Tss16Available,
            0x3 => Self::Tss16Busy,
            0x9 => Self::Tss32Available,
            0xB => Self::Tss32Busy,
            0x2 => Self::Ldt,
            0x4 => Self::CallGate16,
            0xC => Self::CallGate32,
            other => Self::Other(other),
        }
    }

    pub fn is_32bit(self) -> bool {
        matches!(
            self,
            Self::InterruptGate32 | Self::TrapGate32 | Self::CallGate32
        )
    }

    pub fn is_trap(self) -> bool {
        matches!(self, Self::TrapGate16 | Self::TrapGate32)
    }

    pub fn is_interrupt(self) -> bool {
        matches!(self, Self::InterruptGate16 | Self::InterruptGate32)
    }

    pub fn is_call_gate(self) -> bool {
        matches!(self, Self::CallGate16 | Self::CallGate32)
    }

    pub fn is_tss(self) -> bool {
        matches!(
            self,
            Self::Tss16Available | Self::Tss16Busy | Self::Tss32Available | Self::Tss32Busy
        )
    }
}

/// A decoded gate descriptor (S=0): IDT entries, call gates, task gates,
/// and TSS/LDT descriptors share this 8-byte shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateDescriptor {
    pub selector: u16,
    /// For interrupt/trap/call gates: the target offset. For a TSS/LDT
    /// descriptor this field instead holds the base address, decoded the
    /// same way a `SegmentDescriptor` would (see `GateDescriptor::decode`).
    pub offset: u32,
    pub kind: GateKind,
    pub dpl: u8,
    pub present: bool,
    /// Parameter word count for call gates (bits 0..4 of the count byte).
    pub param_count: u8,
}

/// The limit field, decoded the same way for any 8-byte descriptor
/// (segment or system). `GateDescriptor` doesn't carry it directly since
/// call/interrupt/trap gates have no limit of their own; `LLDT`/`LTR` need
/// it for the LDT/TSS descriptor case, so it's exposed standalone.
pub fn raw_limit(raw: u64) -> u32 {
    let limit_low = raw & 0xFFFF;
    let limit_high = (raw >> 48) & 0xF;
    let flags = (raw >> 52) & 0xF;
    let raw_limit = (limit_low | (limit_high << 16)) as u32;
    if (flags >> 3) & 1 != 0 {
        (raw_limit << 12) | 0xFFF
    } else {
        raw_limit
    }
}

impl GateDescriptor {
    pub fn decode(raw: u64) -> Self {
        let offset_low = raw & 0xFFFF;
        let selector = ((raw >> 16) & 0xFFFF) as u16;
        let param_count = ((raw >> 32) & 0x1F) as u8;
        let access = (raw >> 40) & 0xFF;
        let offset_high = (raw >> 48) & 0xFFFF;

        let type_bits = (access & 0xF) as u8;
        let dpl = ((access >> 5) & 0b11) as u8;
        let present = (access >> 7) & 1 != 0;
        let kind = GateKind::from_type(type_bits);

        let offset = if kind.is_tss() || matches!(kind, GateKind::Ldt) {
            // TSS/LDT descriptors reuse the base/limit layout; offset here
            // carries the low 24 bits of base, matching `SegmentDescriptor`.
            let base_low = (raw >> 16) & 0xFFFFFF;
            let base_high = (raw >> 56) & 0xFF;
            ((base_low | (base_high << 24)) as u32) & 0xFFFFFFFF
        } else {
            (offset_low | (offset_high << 16)) as u32
        };

        GateDescriptor {
            selector,
            offset,
            kind,
            dpl,
            present,
            param_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_32bit_code_segment() {
        // Base=0x00100000 Limit=0xFFFFF (4K gran) DPL=0 P=1 Code,RX,non-conf,D=1
        let raw: u64 = 0x00CF_9A00_0010_FFFFu64;
        let d = SegmentDescriptor::decode(raw).unwrap();
        assert!(d.is_code());
        assert_eq!(d.base, 0x0010_0000);
        assert_eq!(d.limit, 0xFFFF_FFFF);
        assert!(d.present);
        assert_eq!(d.dpl, 0);
        assert!(d.big);
        assert!(d.granularity_4k);
    }

    #[test]
    fn decodes_interrupt_gate32() {
        // Selector=0x08 Offset=0x00123456 P=1 DPL=0 type=0xE (32-bit interrupt gate)
        let raw: u64 = 0x0012_8E00_0008_3456u64;
        let g = GateDescriptor::decode(raw);
        assert_eq!(g.selector, 0x08);
        assert_eq!(g.offset, 0x0012_3456);
        assert_eq!(g.kind, GateKind::InterruptGate32);
        assert!(g.present);
        assert_eq!(g.dpl, 0);
    }

    #[test]
    fn system_descriptor_is_not_a_segment() {
        // S=0 (bit 12 clear): a TSS/gate descriptor, not a code/data one.
        let raw: u64 = 0x0000_8900_0000_0000u64;
        assert!(SegmentDescriptor::decode(raw).is_none());
    }

    #[test]
    fn code_segment_access_byte_0x9a_is_readable_non_conforming() {
        // Access byte 0x9A: P=1,DPL=0,S=1,type=1010 (code, readable,
        // non-conforming) — the conventional flat kernel-code descriptor.
        let raw: u64 = 0x00CF_9A00_0000_FFFFu64;
        let d = SegmentDescriptor::decode(raw).unwrap();
        match d.kind {
            SegmentKind::Code { readable, conforming } => {
                assert!(readable);
                assert!(!conforming);
            }
            _ => panic!("expected a code segment"),
        }
    }

    #[test]
    fn data_segment_access_byte_0x92_is_writable() {
        // Access byte 0x92: P=1,DPL=0,S=1,type=0010 (data, read/write).
        let raw: u64 = 0x00CF_9200_0000_FFFFu64;
        let d = SegmentDescriptor::decode(raw).unwrap();
        match d.kind {
            SegmentKind::Data { writable, expand_down } => {
                assert!(writable);
                assert!(!expand_down);
            }
            _ => panic!("expected a data segment"),
        }
    }

    #[test]
    fn data_segment_access_byte_0x90_is_read_only() {
        // Access byte 0x90: P=1,DPL=0,S=1,type=0000 (data, read-only).
        let raw: u64 = 0x00CF_9000_0000_FFFFu64;
        let d = SegmentDescriptor::decode(raw).unwrap();
        match d.kind {
            SegmentKind::Data { writable,.. } => assert!(!writable),
            _ => panic!("expected a data segment"),
        }
    }
}

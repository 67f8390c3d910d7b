//! Shared, dependency-free x86 data types: selectors, segment/gate
//! descriptors, EFLAGS bit layout, and page-table-entry bits.
//!
//! Nothing in this crate performs I/O or owns CPU state; it exists so that
//! `aero86-mmu` and `aero86-cpu` can agree on the wire format of descriptors
//! and page-table entries without depending on each other.

pub mod descriptor;
pub mod eflags;
pub mod pte;
pub mod selector;

pub use descriptor::{raw_limit, GateDescriptor, GateKind, SegmentDescriptor, SegmentKind};
pub use eflags::{Eflags, EFLAGS_WRITABLE_386, EFLAGS_WRITABLE_486, EFLAGS_WRITABLE_PENTIUM};
pub use pte::{PdeBits, PteBits};
pub use selector::Selector;

/// CPU generation, selected by `MachineConfig::cpu_gen`. Controls the
/// EFLAGS writable mask and a handful of generation-gated opcodes
/// (`CPUID`, `SYSENTER`/`SYSEXIT`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuGeneration {
    I386,
    I486,
    Pentium,
    PentiumPro,
}

impl CpuGeneration {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(Self::I386),
            4 => Some(Self::I486),
            5 => Some(Self::Pentium),
            6 => Some(Self::PentiumPro),
            _ => None,
        }
    }

    /// Bits of EFLAGS this generation can set via `POPF`/`IRET`.
    pub fn eflags_writable_mask(self) -> u32 {
        match self {
            Self::I386 => EFLAGS_WRITABLE_386,
            Self::I486 => EFLAGS_WRITABLE_486,
            Self::Pentium | Self::PentiumPro => EFLAGS_WRITABLE_PENTIUM,
        }
    }

    /// `SYSENTER`/`SYSEXIT` were introduced with the Pentium II (family 6);
    /// this core makes them available from the Pentium (family 5) on.
    pub fn has_sysenter(self) -> bool {
        matches!(self, Self::Pentium | Self::PentiumPro)
    }

    /// The family number `CPUID` leaf 1 reports in `EAX`, and the inverse
    /// of `from_u8`.
    pub fn family(self) -> u8 {
        match self {
            Self::I386 => 3,
            Self::I486 => 4,
            Self::Pentium => 5,
            Self::PentiumPro => 6,
        }
    }

    /// `CPUID` itself only exists from the 486 on; earlier cores raise
    /// `#UD` on the opcode.
    pub fn has_cpuid(self) -> bool {
        !matches!(self, Self::I386)
    }
}

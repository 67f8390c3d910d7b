//! The architectural fault/trap vector set. Deliberately not a
//! `thiserror` type: an `Exception` is not a host-facing error, it is a
//! normal, frequently-taken control-flow outcome that `call_isr` consumes
//! directly, so it carries no `Display`/`Error` machinery.

/// A pending x86 exception or software interrupt, as returned by a
/// decode/execute step. `vector()` and `pushes_error_code()` drive
/// `call_isr`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideError, // #DE, vector 0
    Debug, // #DB, vector 1
    Nmi, // vector 2, no error code, not gated by IF
    Breakpoint, // #BP, vector 3 (INT3)
    Overflow, // #OF, vector 4 (INTO)
    BoundRangeExceeded, // #BR, vector 5
    InvalidOpcode, // #UD, vector 6
    DeviceNotAvailable, // #NM, vector 7
    DoubleFault, // #DF, vector 8, error code 0
    InvalidTss(u16), // #TS, vector 10
    SegmentNotPresent(u16),// #NP, vector 11
    StackFault(u16), // #SS, vector 12
    GeneralProtection(u16),// #GP, vector 13
    PageFault { addr: u32, error_code: u32 }, // #PF, vector 14
    FpuError, // #MF, vector 16
    AlignmentCheck, // #AC, vector 17, error code 0
    /// A guest-raised `INT n`.
    SoftwareInterrupt(u8),
    /// A PIC-delivered hardware interrupt, already resolved to a vector.
    ExternalInterrupt(u8),
}

impl Exception {
    pub fn vector(self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Nmi => 2,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRangeExceeded => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::InvalidTss(_) => 10,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault {.. } => 14,
            Exception::FpuError => 16,
            Exception::AlignmentCheck => 17,
            Exception::SoftwareInterrupt(n) => n,
            Exception::ExternalInterrupt(n) => n,
        }
    }

    /// `#DF`, `#TS`, `#NP`, `#SS`, `#GP`, `#PF` push an error code onto the
    /// exception frame; everything else does not.
    pub fn error_code(self) -> Option<u32> {
        match self {
            Exception::DoubleFault => Some(0),
            Exception::InvalidTss(sel) | Exception::SegmentNotPresent(sel) | Exception::StackFault(sel) | Exception::GeneralProtection(sel) => {
                Some(sel as u32)
            }
            Exception::PageFault { error_code,.. } => Some(error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }

    /// `ext`, as used by `call_isr`'s DPL check: true for guest-visible
    /// externally/hardware-raised events (where the CPL/DPL software gate
    /// check is skipped), false for CPU-internal faults and `INT n`.
    pub fn is_external(self) -> bool {
        matches!(self, Exception::ExternalInterrupt(_) | Exception::Nmi)
    }

    /// Faults that, if raised again while already delivering a fault of
    /// the same "class" (contributory exceptions), escalate to #DF rather
    /// than re-entering the same handler.
    pub fn is_contributory(self) -> bool {
        matches!(
            self,
            Exception::DivideError
            | Exception::InvalidTss(_)
            | Exception::SegmentNotPresent(_)
            | Exception::StackFault(_)
            | Exception::GeneralProtection(_)
        )
    }
}

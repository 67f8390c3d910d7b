//! The architectural register file: 8 GPRs, 6 segment
//! registers with cached descriptor shadows, control/debug registers, the
//! SYSENTER MSR triplet, and the lazy-EFLAGS descriptor.

use aero86_types::{Eflags, Selector};

/// General-purpose register indices in their ModR/M encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub fn from_index(i: u8) -> Self {
        match i & 7 {
            0 => Gpr::Eax,
            1 => Gpr::Ecx,
            2 => Gpr::Edx,
            3 => Gpr::Ebx,
            4 => Gpr::Esp,
            5 => Gpr::Ebp,
            6 => Gpr::Esi,
            _ => Gpr::Edi,
        }
    }
}

/// Segment-register indices, in the order IRET/task-switch frames list
/// them: ES, CS, SS, DS, FS, GS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

/// A segment register's selector plus the descriptor fields the CPU needs
/// on every access without re-reading the GDT/LDT.
#[derive(Clone, Copy, Debug)]
pub struct SegmentShadow {
    pub selector: Selector,
    pub base: u32,
    pub limit: u32,
    pub big: bool,
    pub present: bool,
    pub writable: bool,
    pub executable: bool,
    pub conforming_or_expand_down: bool,
    pub dpl: u8,
}

impl SegmentShadow {
    pub const NULL: SegmentShadow = SegmentShadow {
        selector: Selector::NULL,
        base: 0,
        limit: 0xFFFF,
        big: false,
        present: true,
        writable: true,
        executable: false,
        conforming_or_expand_down: false,
        dpl: 0,
    };

    /// A flat 16-bit real-mode/V8086 segment: base = selector << 4, limit
    /// 0xFFFF, always present and writable.
    pub fn real_mode(selector: u16) -> Self {
        SegmentShadow {
            selector: Selector(selector),
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            big: false,
            present: true,
            writable: true,
            executable: false,
            conforming_or_expand_down: false,
            dpl: 0,
        }
    }
}

/// SYSENTER_CS/ESP/EIP, MSRs 0x174/0x175/0x176.
#[derive(Clone, Copy, Debug, Default)]
pub struct SysenterMsrs {
    pub cs: u16,
    pub esp: u32,
    pub eip: u32,
}

/// Debug registers DR0-DR3 (linear breakpoint addresses), DR6 (status),
/// DR7 (control). This core does not itself trap on them; they are
/// state a guest can read back after `MOV to DR`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DebugRegs {
    pub dr0: u32,
    pub dr1: u32,
    pub dr2: u32,
    pub dr3: u32,
    pub dr6: u32,
    pub dr7: u32,
}

bitflags::bitflags! {
    /// CR0 bits this core actually consults. Bits outside this set are
    /// stored but architecturally inert (no FPU emulation trap, no cache
    /// control).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Cr0: u32 {
        const PE = 1 << 0;
        const MP = 1 << 1;
        const EM = 1 << 2;
        const TS = 1 << 3;
        const ET = 1 << 4;
        const NE = 1 << 5;
        const WP = 1 << 16;
        const AM = 1 << 18;
        const NW = 1 << 29;
        const CD = 1 << 30;
        const PG = 1 << 31;
    }
}

/// The full register file. `aero86-cpu::Cpu` owns one of these plus a
/// `PagingBus`; everything here is plain data with no I/O.
#[derive(Clone, Debug)]
pub struct RegisterFile {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: Eflags,
    pub segs: [SegmentShadow; 6],
    pub ldtr: Selector,
    pub ldtr_base: u32,
    pub ldtr_limit: u32,
    pub tr: Selector,
    pub tr_base: u32,
    pub tr_limit: u32,
    pub tr_is_32bit: bool,
    pub gdtr_base: u32,
    pub gdtr_limit: u32,
    pub idtr_base: u32,
    pub idtr_limit: u32,
    pub cr0: Cr0,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dbg: DebugRegs,
    pub sysenter: SysenterMsrs,
    pub cpl: u8,
}

impl RegisterFile {
    pub fn gpr(&self, r: Gpr) -> u32 {
        self.gpr[r as usize]
    }

    pub fn set_gpr(&mut self, r: Gpr, v: u32) {
        self.gpr[r as usize] = v;
    }

    pub fn seg(&self, r: SegReg) -> &SegmentShadow {
        &self.segs[r as usize]
    }

    pub fn set_seg(&mut self, r: SegReg, shadow: SegmentShadow) {
        self.segs[r as usize] = shadow;
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0.contains(Cr0::PE) && !self.eflags.contains(Eflags::VM)
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0.contains(Cr0::PG)
    }

    pub fn code_size_32(&self) -> bool {
        if self.eflags.contains(Eflags::VM) {
            false
        } else {
            self.seg(SegReg::Cs).big
        }
    }

    pub fn stack_size_32(&self) -> bool {
        if self.eflags.contains(Eflags::VM) {
            false
        } else {
            self.seg(SegReg::Ss).big
        }
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::reset_state()
    }
}

impl RegisterFile {
    /// State after `#RESET`: CS=F000, EIP=0xFFF0 — the standard BIOS entry
    /// point, base 0xFFFF0000 on real silicon, reachable here as a plain
    /// real-mode flat reset matching the 8086 reset vector.
    pub fn reset_state() -> Self {
        RegisterFile {
            gpr: [0; 8],
            eip: 0xFFF0,
            eflags: Eflags::from_bits_truncate(0x0000_0002),
            segs: [
                SegmentShadow::real_mode(0),
                SegmentShadow {
                    base: 0xFFFF_0000,
                    ..SegmentShadow::real_mode(0xF000)
                },
                SegmentShadow::real_mode(0),
                SegmentShadow::real_mode(0),
                SegmentShadow::real_mode(0),
                SegmentShadow::real_mode(0),
            ],
            ldtr: Selector::NULL,
            ldtr_base: 0,
            ldtr_limit: 0,
            tr: Selector::NULL,
            tr_base: 0,
            tr_limit: 0,
            tr_is_32bit: true,
            gdtr_base: 0,
            gdtr_limit: 0xFFFF,
            idtr_base: 0,
            idtr_limit: 0xFFFF,
            cr0: Cr0::from_bits_truncate(Cr0::ET.bits()),
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dbg: DebugRegs::default(),
            sysenter: SysenterMsrs::default(),
            cpl: 0,
        }
    }
}

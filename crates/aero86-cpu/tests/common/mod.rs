// Shared test helpers (integration tests compile as separate crates, so put
// common code in a submodule to avoid it becoming its own test target).

use aero86_cpu::{InterruptController, PortIo};

/// A `Devices` implementation with no attached ports and no pending
/// interrupts, for tests that only care about the decode/execute path.
pub struct NoDevices;

impl PortIo for NoDevices {
    fn in8(&mut self, _port: u16) -> u8 {
        0xFF
    }
    fn in16(&mut self, _port: u16) -> u16 {
        0xFFFF
    }
    fn in32(&mut self, _port: u16) -> u32 {
        0xFFFF_FFFF
    }
    fn out8(&mut self, _port: u16, _val: u8) {}
    fn out16(&mut self, _port: u16, _val: u16) {}
    fn out32(&mut self, _port: u16, _val: u32) {}
}

impl InterruptController for NoDevices {
    fn intr_pending(&self) -> bool {
        false
    }
    fn read_irq(&mut self) -> u8 {
        0
    }
}

/// Encode an 8-byte GDT/LDT/IDT code-or-data segment descriptor the same
/// way `SegmentDescriptor::decode` (in `aero86-types`) reads one back, so
/// tests can build a descriptor table in guest RAM without going through
/// `LGDT`/`LLDT` first.
#[allow(clippy::too_many_arguments)]
pub fn seg_descriptor(base: u32, limit: u32, is_code: bool, rw: bool, dc_or_conforming: bool, dpl: u8, present: bool, big: bool, granularity_4k: bool) -> u64 {
    let (limit_enc, gran_bit) = if granularity_4k {
        (limit >> 12, 1u64)
    } else {
        (limit, 0u64)
    };
    let limit_low = (limit_enc & 0xFFFF) as u64;
    let limit_high = ((limit_enc >> 16) & 0xF) as u64;
    let base_low = (base & 0xFF_FFFF) as u64;
    let base_high = ((base >> 24) & 0xFF) as u64;

    let mut access: u64 = 0;
    if rw {
        access |= 1 << 1;
    }
    if dc_or_conforming {
        access |= 1 << 2;
    }
    if is_code {
        access |= 1 << 3;
    }
    access |= 1 << 4; // S=1: code/data, not a system descriptor.
    access |= (dpl as u64 & 0b11) << 5;
    if present {
        access |= 1 << 7;
    }

    let mut flags: u64 = 0;
    if big {
        flags |= 1 << 2;
    }
    flags |= gran_bit << 3;

    limit_low | (base_low << 16) | (access << 40) | (limit_high << 48) | (flags << 52) | (base_high << 56)
}

/// A flat, 4 GiB, present, big (32-bit) code or data descriptor at `dpl`.
pub fn flat_descriptor(is_code: bool, dpl: u8) -> u64 {
    seg_descriptor(0, 0xFFFF_FFFF, is_code, true, false, dpl, true, true, true)
}

/// Encode an 8-byte gate descriptor (interrupt/trap/call/task gate),
/// matching `GateDescriptor::decode`.
pub fn gate_descriptor(selector: u16, offset: u32, type_bits: u8, dpl: u8, present: bool, param_count: u8) -> u64 {
    let offset_low = (offset & 0xFFFF) as u64;
    let offset_high = ((offset >> 16) & 0xFFFF) as u64;
    let mut access: u64 = type_bits as u64 & 0xF;
    access |= (dpl as u64 & 0b11) << 5;
    if present {
        access |= 1 << 7;
    }
    offset_low | ((selector as u64) << 16) | ((param_count as u64 & 0x1F) << 32) | (access << 40) | (offset_high << 48)
}

/// A TSS descriptor (type 9 = 32-bit available, type 0xB = 32-bit busy):
/// its base/limit are laid out exactly like a `SegmentDescriptor`, which is
/// how `GateDescriptor::decode` reads a TSS/LDT descriptor's `offset` field
/// back as a base address.
pub fn tss_descriptor(base: u32, limit: u32, busy: bool, dpl: u8) -> u64 {
    let type_bits = if busy { 0xB } else { 0x9 };
    let limit_low = (limit & 0xFFFF) as u64;
    let limit_high = ((limit >> 16) & 0xF) as u64;
    let base_low = (base & 0xFF_FFFF) as u64;
    let base_high = ((base >> 24) & 0xFF) as u64;
    let mut access: u64 = type_bits as u64 & 0xF;
    access |= (dpl as u64 & 0b11) << 5;
    access |= 1 << 7; // present
    limit_low | (base_low << 16) | (access << 40) | (limit_high << 48) | (base_high << 56)
}

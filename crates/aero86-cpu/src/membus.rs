//! `PagingBus`: the segmentation-aware memory interface the executor uses
//! for every operand and instruction fetch. Wraps `aero86-mmu`'s physical
//! `Bus` and `Tlb`/`Translator`, adding the CPL-derived selector checks that
//! live above the paging layer — `aero86-mmu` itself knows nothing about
//! segmentation.

use crate::exception::Exception;
use crate::regs::SegmentShadow;
use aero86_mmu::{AddrResult, Bus, FetchCache, IoMem, PageFault, Tlb, Translator, TranslateParams};

fn pf_to_exception(pf: PageFault) -> Exception {
    Exception::PageFault {
        addr: pf.addr,
        error_code: pf.error_code,
    }
}

/// Segment-limit check: `false` means the access is out of bounds
/// and should raise `#GP(0)` (or `#SS(0)` for a stack-segment access).
#[cfg(feature = "checked-segments")]
fn within_limit(shadow: &SegmentShadow, offset: u32, size: u32) -> bool {
    if shadow.conforming_or_expand_down && !shadow.executable {
        // Expand-down data segment: valid range is (limit, max] rather
        // than [0, limit].
        let max = if shadow.big { u32::MAX } else { 0xFFFF };
        offset > shadow.limit && offset.saturating_add(size - 1) <= max
    } else {
        let end = offset.checked_add(size - 1);
        matches!(end, Some(e) if e <= shadow.limit)
    }
}

#[cfg(not(feature = "checked-segments"))]
fn within_limit(_shadow: &SegmentShadow, _offset: u32, _size: u32) -> bool {
    true
}

/// Everything the executor needs to turn `(segment, offset)` into bytes:
/// a physical bus, the data TLB, and the one-entry instruction fetch
/// cache, bundled so `Cpu::step` only has to own one field for memory.
pub struct PagingBus {
    pub bus: Bus,
    tlb: Tlb,
}

impl PagingBus {
    pub fn new(ram_size: usize) -> Self {
        Self {
            bus: Bus::new(ram_size),
            tlb: Tlb::new(),
        }
    }

    pub fn set_io_mem(&mut self, io_mem: Box<dyn IoMem + Send>) {
        self.bus.set_io_mem(io_mem);
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
    }

    /// Load a firmware/kernel/initrd blob at a physical offset. Exposed so the harness crate
    /// doesn't need to reach past `PagingBus` into `aero86-mmu` directly.
    pub fn load_blob(&mut self, phys_addr: u32, bytes: &[u8]) {
        self.bus.load_blob(phys_addr, bytes);
    }

    fn translate(
        &mut self,
        laddr: u32,
        size: u32,
        paging_enabled: bool,
        cr3: u32,
        cpl: u8,
        is_write: bool,
        write_protect: bool,
    ) -> Result<AddrResult, Exception> {
        Translator::translate(
            &mut self.tlb,
            &mut self.bus,
            laddr,
            size,
            paging_enabled,
            TranslateParams {
                cr3,
                cpl,
                is_write,
                write_protect,
            },
        )
        .map_err(pf_to_exception)
    }

    /// Resolve a segmented access to its physical ranges, applying the
    /// limit check before translation. `mmu_ctx` carries the fields
    /// `Translator` needs (`cr3`/paging-enabled/write-protect), since
    /// `aero86-cpu` owns CR0/CR3, not this struct.
    #[allow(clippy::too_many_arguments)]
    pub fn resolve(
        &mut self,
        shadow: &SegmentShadow,
        offset: u32,
        size: u32,
        is_write: bool,
        cpl: u8,
        paging_enabled: bool,
        cr3: u32,
        write_protect: bool,
    ) -> Result<AddrResult, Exception> {
        if !within_limit(shadow, offset, size) {
            return Err(Exception::GeneralProtection(0));
        }
        let laddr = shadow.base.wrapping_add(offset);
        self.translate(laddr, size, paging_enabled, cr3, cpl, is_write, write_protect)
    }

    pub fn read8(&mut self, addr: AddrResult) -> u8 {
        match addr {
            AddrResult::Ok1(a) => self.bus.load8(a),
            AddrResult::Ok2(a, _) => self.bus.load8(a),
        }
    }

    pub fn write8(&mut self, addr: AddrResult, v: u8) {
        match addr {
            AddrResult::Ok1(a) => self.bus.store8(a, v),
            AddrResult::Ok2(a, _) => self.bus.store8(a, v),
        }
    }

    pub fn read16(&mut self, addr: AddrResult) -> u16 {
        self.bus.load16_addr(addr)
    }

    pub fn write16(&mut self, addr: AddrResult, v: u16) {
        self.bus.store16_addr(addr, v)
    }

    pub fn read32(&mut self, addr: AddrResult) -> u32 {
        self.bus.load32_addr(addr)
    }

    pub fn write32(&mut self, addr: AddrResult, v: u32) {
        self.bus.store32_addr(addr, v)
    }

    /// Instruction fetch, consulting the one-entry `FetchCache` ahead of
    /// the full TLB. Invalidated by `flush_tlb` and by
    /// `notify_store_physical` when a write lands on the cached page, so a
    /// store that rewrites a not-yet-executed instruction is observed on
    /// the next fetch rather than serving stale bytes.
    pub fn fetch_u8(
        &mut self,
        fetch_cache: &mut FetchCache,
        shadow: &SegmentShadow,
        offset: u32,
        cpl: u8,
        paging_enabled: bool,
        cr3: u32,
        write_protect: bool,
    ) -> Result<u8, Exception> {
        if !within_limit(shadow, offset, 1) {
            return Err(Exception::GeneralProtection(0));
        }
        let laddr = shadow.base.wrapping_add(offset);
        if let Some(phys) = fetch_cache.lookup(laddr) {
            return Ok(self.bus.load8(phys));
        }
        let addr = self.translate(laddr, 1, paging_enabled, cr3, cpl, false, write_protect)?;
        let phys = match addr {
            AddrResult::Ok1(p) => p,
            AddrResult::Ok2(p, _) => p,
        };
        fetch_cache.fill(laddr, phys);
        Ok(self.bus.load8(phys))
    }

    /// Must be called after every physical store so a self-modifying
    /// write invalidates a cached fetch of the same page.
    pub fn notify_store_physical(&self, fetch_cache: &mut FetchCache, addr: AddrResult) {
        match addr {
            AddrResult::Ok1(a) => fetch_cache.invalidate_if_physical_page(a),
            AddrResult::Ok2(a, b) => {
                fetch_cache.invalidate_if_physical_page(a);
                fetch_cache.invalidate_if_physical_page(b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::SegmentShadow;

    #[test]
    fn flat_real_mode_resolve_round_trips() {
        let mut pb = PagingBus::new(0x10000);
        let shadow = SegmentShadow::real_mode(0x1000);
        let addr = pb.resolve(&shadow, 0x20, 4, true, 0, false, 0, false).unwrap();
        pb.write32(addr, 0xCAFEBABE);
        assert_eq!(pb.read32(addr), 0xCAFEBABE);
    }
}

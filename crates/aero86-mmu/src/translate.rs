//! The address translator / MMU: linear-to-
//! physical translation through a two-level, non-PAE page table, cached in
//! a direct-mapped 512-entry software TLB.

use crate::bus::Bus;
use aero86_types::pte::{PdeBits, PteBits, PTE_FRAME_MASK};

pub const TLB_ENTRIES: usize = 512;
const PAGE_SHIFT: u32 = 12;
const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Either a single contiguous physical range, or two ranges to stitch
/// byte-wise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddrResult {
    Ok1(u32),
    /// `(first_range_start, second_range_start)`. The first range runs to
    /// the end of its containing 4KiB page; the second starts at the next
    /// page. Byte count in each half is derived from how close
    /// `first_range_start` is to a page boundary.
    Ok2(u32, u32),
}

/// A page fault, carrying the faulting linear address (becomes `CR2`) and
/// the IA-32 page-fault error code (P/W/U/RSVD/ID bits).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: u32,
    pub error_code: u32,
}

pub const PF_ERR_PRESENT: u32 = 1 << 0;
pub const PF_ERR_WRITE: u32 = 1 << 1;
pub const PF_ERR_USER: u32 = 1 << 2;

#[derive(Clone, Copy, Debug)]
struct TlbEntry {
    valid: bool,
    lpn: u32,
    /// `physical_address = xor_key ^ linear_address` for any address inside
    /// this page.
    xor_key: u32,
    /// `deny[cpl > 0][is_write]`: whether that combination must fault.
    deny: [[bool; 2]; 2],
    pte_addr: u32,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry {
        valid: false,
        lpn: 0,
        xor_key: 0,
        deny: [[false; 2]; 2],
        pte_addr: 0,
    };
}

/// The one-slot instruction-fetch cache, kept separate from
/// the data TLB so a hot code page survives a data-heavy instruction
/// stream evicting the corresponding TLB entry.
#[derive(Clone, Copy, Debug, Default)]
pub struct FetchCache {
    cached_linear_page: Option<u32>,
    cached_physical_xor: u32,
}

impl FetchCache {
    pub fn lookup(&self, laddr: u32) -> Option<u32> {
        let lpn = laddr & !PAGE_MASK;
        if self.cached_linear_page == Some(lpn) {
            Some(laddr ^ self.cached_physical_xor)
        } else {
            None
        }
    }

    pub fn fill(&mut self, laddr: u32, phys: u32) {
        let lpn = laddr & !PAGE_MASK;
        self.cached_linear_page = Some(lpn);
        self.cached_physical_xor = lpn ^ (phys & !PAGE_MASK);
    }

    /// Invalidated whenever the owning page's physical mapping could have
    /// changed: a TLB flush, or a store whose physical page equals the
    /// cached one (self-modifying code).
    pub fn invalidate(&mut self) {
        self.cached_linear_page = None;
    }

    pub fn invalidate_if_physical_page(&mut self, phys_addr: u32) {
        if let Some(lpn) = self.cached_linear_page {
            let cached_phys_page = lpn ^ (self.cached_physical_xor & !PAGE_MASK);
            if cached_phys_page == (phys_addr & !PAGE_MASK) {
                self.invalidate();
            }
        }
    }
}

/// Direct-mapped software TLB plus the two-level page-table walker.
pub struct Tlb {
    entries: Vec<TlbEntry>,
    fetch: FetchCache,
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: vec![TlbEntry::INVALID; TLB_ENTRIES],
            fetch: FetchCache::default(),
        }
    }

    pub fn flush(&mut self) {
        for e in self.entries.iter_mut() {
            e.valid = false;
        }
        self.fetch.invalidate();
    }

    fn slot(&self, lpn: u32) -> usize {
        (lpn as usize) % TLB_ENTRIES
    }

    fn lookup(&self, lpn: u32) -> Option<&TlbEntry> {
        let e = &self.entries[self.slot(lpn)];
        (e.valid && e.lpn == lpn).then_some(e)
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

/// Parameters that vary per-access but are cheap to pass explicitly rather
/// than threading a whole `CpuState` into this crate.
#[derive(Clone, Copy, Debug)]
pub struct TranslateParams {
    pub cr3: u32,
    pub cpl: u8,
    pub is_write: bool,
    pub write_protect: bool,
}

/// Walks the page table on a TLB miss, filling a
/// fresh entry. Does not itself decide fault-vs-hit for the *current*
/// access beyond the walk's own present-bit checks; permission enforcement
/// for a cached hit is `Tlb`'s job via the precomputed `deny` matrix.
pub struct Translator;

impl Translator {
    /// Translate one linear address to a physical address, splitting into
    /// two ranges if `[laddr, laddr+size)` straddles a 4KiB page boundary.
    #[allow(clippy::too_many_arguments)]
    pub fn translate(
        tlb: &mut Tlb,
        bus: &mut Bus,
        laddr: u32,
        size: u32,
        paging_enabled: bool,
        params: TranslateParams,
    ) -> Result<AddrResult, PageFault> {
        if !paging_enabled {
            // Physical == linear; RAM/MMIO is flat, so there is never a
            // discontinuity to stitch across regardless of page alignment.
            return Ok(AddrResult::Ok1(laddr));
        }

        let first_page_len = PAGE_SIZE - (laddr & PAGE_MASK);
        if size <= first_page_len {
            let phys = Self::translate_page(tlb, bus, laddr, params)?;
            return Ok(AddrResult::Ok1(phys));
        }

        let phys0 = Self::translate_page(tlb, bus, laddr, params)?;
        let next_page = laddr.wrapping_add(first_page_len);
        let phys1 = Self::translate_page(tlb, bus, next_page, params)?;
        Ok(AddrResult::Ok2(phys0, phys1))
    }

    fn translate_page(
        tlb: &mut Tlb,
        bus: &mut Bus,
        laddr: u32,
        params: TranslateParams,
    ) -> Result<u32, PageFault> {
        let lpn = laddr & !PAGE_MASK;
        let user = params.cpl > 0;
        let wr = params.is_write;

        if let Some(entry) = tlb.lookup(lpn) {
            if entry.deny[user as usize][wr as usize] {
                return Err(PageFault {
                        addr: laddr,
                        error_code: PF_ERR_PRESENT
                        | if wr { PF_ERR_WRITE } else { 0 }
                        | if user { PF_ERR_USER } else { 0 },
                });
            }
            if wr {
                Self::set_dirty(bus, entry.pte_addr);
            }
            return Ok(entry.xor_key ^ laddr);
        }

        let entry = Self::walk(bus, laddr, params)?;
        if entry.deny[user as usize][wr as usize] {
            return Err(PageFault {
                    addr: laddr,
                    error_code: PF_ERR_PRESENT
                    | if wr { PF_ERR_WRITE } else { 0 }
                    | if user { PF_ERR_USER } else { 0 },
            });
        }
        if wr {
            Self::set_dirty(bus, entry.pte_addr);
        }
        let phys = entry.xor_key ^ laddr;
        let slot = tlb.slot(lpn);
        tlb.entries[slot] = entry;
        Ok(phys)
    }

    fn set_dirty(bus: &mut Bus, pte_addr: u32) {
        let pte = bus.load32(pte_addr);
        if pte & PteBits::DIRTY.bits() == 0 {
            bus.store32(pte_addr, pte | PteBits::DIRTY.bits());
        }
    }

    fn walk(bus: &mut Bus, laddr: u32, params: TranslateParams) -> Result<TlbEntry, PageFault> {
        let pd_index = (laddr >> 22) & 0x3FF;
        let pt_index = (laddr >> 12) & 0x3FF;

        let pd_base = params.cr3 & PTE_FRAME_MASK;
        let pde_addr = pd_base + pd_index * 4;
        let mut pde = bus.load32(pde_addr);

        let user_fault = |present: bool| PageFault {
            addr: laddr,
            error_code: (if present { PF_ERR_PRESENT } else { 0 })
            | (if params.is_write { PF_ERR_WRITE } else { 0 })
            | (if params.cpl > 0 { PF_ERR_USER } else { 0 }),
        };

        if pde & PdeBits::PRESENT.bits() == 0 {
            return Err(user_fault(false));
        }
        if pde & PdeBits::ACCESSED.bits() == 0 {
            pde |= PdeBits::ACCESSED.bits();
            bus.store32(pde_addr, pde);
        }

        let pt_base = pde & PTE_FRAME_MASK;
        let pte_addr = pt_base + pt_index * 4;
        let mut pte = bus.load32(pte_addr);

        if pte & PteBits::PRESENT.bits() == 0 {
            return Err(user_fault(false));
        }
        if pte & PteBits::ACCESSED.bits() == 0 {
            pte |= PteBits::ACCESSED.bits();
            bus.store32(pte_addr, pte);
        }

        let combined_us = (pde & PdeBits::USER.bits() != 0) && (pte & PteBits::USER.bits() != 0);
        let combined_rw = (pde & PdeBits::WRITABLE.bits() != 0) && (pte & PteBits::WRITABLE.bits() != 0);
        let wp = params.write_protect;

        let deny = [
            // supervisor (cpl == 0..2)
            [false, !combined_rw && wp],
            // user (cpl == 3)
            [!combined_us, !combined_us || !combined_rw],
        ];

        let frame = pte & PTE_FRAME_MASK;
        let lpn = laddr & !PAGE_MASK;
        Ok(TlbEntry {
                valid: true,
                lpn,
                xor_key: lpn ^ frame,
                deny,
                pte_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_params() -> TranslateParams {
        TranslateParams {
            cr3: 0x1000,
            cpl: 0,
            is_write: false,
            write_protect: false,
        }
    }

    fn setup_page(bus: &mut Bus, pd_base: u32, pt_base: u32, frame: u32, flags: u32) {
        bus.store32(pd_base, pt_base | PdeBits::PRESENT.bits() | PdeBits::WRITABLE.bits() | PdeBits::USER.bits());
        bus.store32(pt_base, frame | flags);
    }

    #[test]
    fn tlb_hit_matches_fresh_walk() {
        let mut bus = Bus::new(0x10000);
        setup_page(
            &mut bus,
            0x1000,
            0x2000,
            0x3000,
            PteBits::PRESENT.bits() | PteBits::WRITABLE.bits() | PteBits::USER.bits(),
        );
        let mut tlb = Tlb::new();
        let params = identity_params();

        let r1 = Translator::translate(&mut tlb, &mut bus, 0x0000_0010, 4, true, params).unwrap();
        tlb.flush();
        let r2 = Translator::translate(&mut tlb, &mut bus, 0x0000_0010, 4, true, params).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(r1, AddrResult::Ok1(0x3010));
    }

    #[test]
    fn not_present_pte_faults() {
        let mut bus = Bus::new(0x10000);
        bus.store32(0x1000, 0x2000 | PdeBits::PRESENT.bits() | PdeBits::WRITABLE.bits() | PdeBits::USER.bits());
        // PTE left at 0 (not present).
        let mut tlb = Tlb::new();
        let err = Translator::translate(&mut tlb, &mut bus, 0, 4, true, identity_params()).unwrap_err();
        assert_eq!(err.addr, 0);
        assert_eq!(err.error_code, 0);
    }

    #[test]
    fn user_write_to_supervisor_page_faults_with_rwu_bits() {
        let mut bus = Bus::new(0x10000);
        setup_page(
            &mut bus,
            0x1000,
            0x2000,
            0x3000,
            PteBits::PRESENT.bits() | PteBits::WRITABLE.bits(), // no USER bit
        );
        let mut tlb = Tlb::new();
        let params = TranslateParams {
            cr3: 0x1000,
            cpl: 3,
            is_write: true,
            write_protect: false,
        };
        let err = Translator::translate(&mut tlb, &mut bus, 0, 4, true, params).unwrap_err();
        assert_eq!(err.error_code, PF_ERR_PRESENT | PF_ERR_WRITE | PF_ERR_USER);
    }

    #[test]
    fn straddling_access_returns_two_ranges() {
        let mut bus = Bus::new(0x20000);
        setup_page(
            &mut bus,
            0x1000,
            0x2000,
            0x10000,
            PteBits::PRESENT.bits() | PteBits::WRITABLE.bits() | PteBits::USER.bits(),
        );
        // Map the next linear page (0x1000) to a second frame too.
        bus.store32(0x2004, 0x11000 | PteBits::PRESENT.bits() | PteBits::WRITABLE.bits() | PteBits::USER.bits());

        let mut tlb = Tlb::new();
        let r = Translator::translate(&mut tlb, &mut bus, 0x0FFE, 4, true, identity_params()).unwrap();
        assert_eq!(r, AddrResult::Ok2(0x1_0FFE, 0x1_1000));
    }

    #[test]
    fn write_sets_dirty_bit() {
        let mut bus = Bus::new(0x10000);
        setup_page(
            &mut bus,
            0x1000,
            0x2000,
            0x3000,
            PteBits::PRESENT.bits() | PteBits::WRITABLE.bits() | PteBits::USER.bits(),
        );
        let mut tlb = Tlb::new();
        let params = TranslateParams {
            cr3: 0x1000,
            cpl: 0,
            is_write: true,
            write_protect: false,
        };
        Translator::translate(&mut tlb, &mut bus, 0, 4, true, params).unwrap();
        let pte = bus.load32(0x2000);
        assert_ne!(pte & PteBits::DIRTY.bits(), 0);
    }
}

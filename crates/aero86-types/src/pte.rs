use bitflags::bitflags;

bitflags! {
    /// Page-directory-entry bits (32-bit, non-PAE paging — the only format
    /// this core's MMU needs; PAE/long-mode paging is out of scope).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PdeBits: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6; // only meaningful for 4MiB pages; unused here
        const PS = 1 << 7; // 4MiB page; not supported, rejected as reserved
    }
}

bitflags! {
    /// Page-table-entry bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteBits: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// Mask for the physical page frame number inside a PDE/PTE.
pub const PTE_FRAME_MASK: u32 = 0xFFFF_F000;

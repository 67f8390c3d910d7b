//! The memory subsystem: a byte-level physical memory
//! accessor with an MMIO dispatch window, and a linear-to-physical
//! translator backed by a direct-mapped software TLB.
//!
//! This crate knows nothing about segmentation or CPL-derived selector
//! checks — that lives in `aero86-cpu`'s `PagingBus`, which owns a
//! `Translator` and feeds it `(linear, cpl, is_write)` on every access.

pub mod bus;
pub mod translate;

pub use bus::{Bus, IoMem};
pub use translate::{AddrResult, FetchCache, PageFault, Tlb, Translator, TLB_ENTRIES};

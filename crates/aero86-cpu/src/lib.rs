//! The decoder/executor, register file, lazy-flags evaluator, and
//! exception/interrupt delivery logic.
//!
//! This crate is deliberately ignorant of *which* devices are attached:
//! `Cpu::step` takes a `&mut impl io::Devices` supplied by the harness
//! crate (`aero86-machine`) on every call, and otherwise only talks to
//! `aero86-mmu` (physical memory + paging) and `aero86-interrupts`
//! (the PIC, via the narrow `interrupt_iface::InterruptController` seam).

pub mod alu;
pub mod control;
pub mod cpu;
pub mod decode;
pub mod exception;
#[cfg(feature = "fpu")]
pub mod fpu;
pub mod interrupt_iface;
pub mod io;
pub mod isr;
pub mod lazyflags;
pub mod membus;
pub mod regs;

mod execute;
mod opcodes_0f;

pub use cpu::{Cond, Cpu};
pub use exception::Exception;
pub use interrupt_iface::InterruptController;
pub use io::{Devices, PortIo};
pub use regs::{Cr0, Gpr, RegisterFile, SegReg, SegmentShadow};

//! The 8259A programmable interrupt controller pair.
//!
//! Two cascaded controllers: a master at ports 0x20/0x21 and a slave at
//! 0xA0/0xA1, with the slave's `INT` output wired into the master's IRQ2
//! input. `PicPair` owns both and is the unit the CPU talks to.

mod pic;

pub use pic::{Pic, PicPair};

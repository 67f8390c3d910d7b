//! The host-facing machine harness: `Machine` owns a
//! `Cpu` plus the timer-interrupt core's device state (PIC pair, PIT,
//! CMOS/RTC) and drives them from a single `run_slice(n)` entry point.
//!
//! Everything out of scope for the core itself — disk, VGA/VBE, audio, PS/2,
//! the host's own UI — plugs in through the port-I/O, MMIO, and IRQ
//! callback surfaces this crate exposes (`host::NullHost` as the default
//! when nothing is attached, `Machine::with_host` to attach a real one,
//! `Machine::raise_irq` for the IRQ surface).

mod bus;
mod config;
mod host;
mod machine;

pub use bus::{
    IoBridge, CMOS_DATA, CMOS_INDEX, PIC_MASTER_CMD, PIC_MASTER_DATA, PIC_SLAVE_CMD, PIC_SLAVE_DATA, PIT_CH0, PIT_CH1, PIT_CH2, PIT_CMD,
    PIT_IRQ_LINE, POST_DEBUG_PORT, RTC_IRQ_LINE,
};
pub use config::{fastboot, MachineConfig, MachineConfigError};
pub use host::NullHost;
pub use machine::{Machine, RunExit};

//! `aero86` — the top-level crate tying the workspace's CPU/MMU/timer-
//! interrupt core together behind a single facade. Host harnesses that
//! only need `Machine::new`/`run_slice`/`raise_irq` can depend on this
//! crate alone instead of the individual `aero86-*` crates.

pub use aero86_cpu as cpu;
pub use aero86_devices as devices;
pub use aero86_interrupts as interrupts;
pub use aero86_machine::{
    fastboot, IoBridge, Machine, MachineConfig, MachineConfigError, NullHost, RunExit, CMOS_DATA, CMOS_INDEX, PIC_MASTER_CMD, PIC_MASTER_DATA,
    PIC_SLAVE_CMD, PIC_SLAVE_DATA, PIT_CH0, PIT_CH1, PIT_CH2, PIT_CMD, PIT_IRQ_LINE, POST_DEBUG_PORT, RTC_IRQ_LINE,
};
pub use aero86_mmu as mmu;
pub use aero86_time as time;
pub use aero86_types as types;

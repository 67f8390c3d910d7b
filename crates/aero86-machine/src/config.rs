//! `MachineConfig`: the single flat record consumed once at construction
//!.

use thiserror::Error;

/// A validated, immutable snapshot of everything the host told the
/// machine at construction time. Nothing here changes after `Machine::new`
/// returns; reconfiguring means building a new `Machine`.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Physical RAM size in bytes.
    pub mem_size: usize,
    /// 3/4/5/6 — selects the EFLAGS writable mask and gates
    /// `SYSENTER`/`SYSEXIT`.
    pub cpu_gen: u8,
    /// Enables x87 emulation. When `false`, `ESC` opcodes still only raise
    /// `#NM` when `CR0.TS` is set — there is no separate "FPU absent"
    /// trap in this core.
    pub fpu: bool,
    /// Loaded to `0x100000 - len(bios)`.
    pub bios: Option<Vec<u8>>,
    /// Loaded to `0xC0000`.
    pub vga_bios: Option<Vec<u8>>,
    /// Fast-boot path: when `kernel` is set, `initrd`,
    /// `cmdline`, and `linuxstart` are loaded alongside it and the reset
    /// vector is steered to the stub instead of the BIOS.
    pub kernel: Option<Vec<u8>>,
    pub initrd: Option<Vec<u8>>,
    pub cmdline: Option<String>,
    pub linuxstart: Option<Vec<u8>>,
    /// Whether the harness attaches a UART. The core itself never touches
    /// serial ports; this only controls whether `Machine` bothers routing
    /// 0x3F8-0x3FF anywhere instead of leaving them to the host device
    /// table (or unmapped, reading 0xFF, if `false` and no host table is
    /// attached).
    pub enable_serial: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            mem_size: 16 * 1024 * 1024,
            cpu_gen: 4,
            fpu: true,
            bios: None,
            vga_bios: None,
            kernel: None,
            initrd: None,
            cmdline: None,
            linuxstart: None,
            enable_serial: false,
        }
    }
}

/// Fast-boot physical layout constants.
pub mod fastboot {
    pub const KERNEL_ADDR: u32 = 0x0010_0000;
    pub const INITRD_ADDR: u32 = 0x0040_0000;
    pub const CMDLINE_ADDR: u32 = 0xF800;
    pub const STUB_ADDR: u32 = 0x0001_0000;
}

/// A construction-time configuration error.
#[derive(Debug, Error)]
pub enum MachineConfigError {
    #[error("unsupported cpu_gen {0}: must be one of 3 (386), 4 (486), 5 (Pentium), 6 (Pentium Pro)")]
    UnsupportedCpuGeneration(u8),
    #[error("mem_size {0} is too small: the core needs at least 1 MiB of addressable RAM")]
    RamTooSmall(usize),
    #[error("bios blob of {len} bytes does not fit below the 1 MiB boundary")]
    BiosTooLarge { len: usize },
    #[error("vga_bios blob of {len} bytes does not fit in the 0xC0000-0xC8000 option-ROM window")]
    VgaBiosTooLarge { len: usize },
    #[error("kernel fast-boot path requires mem_size large enough to hold the kernel and initrd")]
    FastBootImageTooLarge,
}

impl MachineConfig {
    pub(crate) fn validate(&self) -> Result<(), MachineConfigError> {
        if aero86_types::CpuGeneration::from_u8(self.cpu_gen).is_none() {
            return Err(MachineConfigError::UnsupportedCpuGeneration(self.cpu_gen));
        }
        if self.mem_size < 0x0010_0000 {
            return Err(MachineConfigError::RamTooSmall(self.mem_size));
        }
        if let Some(bios) = &self.bios {
            if bios.len() > 0x0010_0000 {
                return Err(MachineConfigError::BiosTooLarge { len: bios.len() });
            }
        }
        if let Some(vga) = &self.vga_bios {
            if vga.len() > 0x8000 {
                return Err(MachineConfigError::VgaBiosTooLarge { len: vga.len() });
            }
        }
        if let Some(kernel) = &self.kernel {
            let initrd_len = self.initrd.as_ref().map_or(0, |v| v.len());
            let end = fastboot::INITRD_ADDR as usize + initrd_len;
            if kernel.len() > self.mem_size || end > self.mem_size {
                return Err(MachineConfigError::FastBootImageTooLarge);
            }
        }
        Ok(())
    }
}

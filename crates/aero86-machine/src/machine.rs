//! `Machine`: the host-facing harness that owns one `Cpu`, the PIC pair,
//! the PIT, and the CMOS/RTC, and wires them together behind a single
//! `run_slice(n)` entry point.

use std::sync::Arc;

use aero86_cpu::Cpu;
use aero86_devices::{Cmos, Pit};
use aero86_interrupts::PicPair;
use aero86_mmu::IoMem;
use aero86_time::{Clock, MonotonicClock};
use aero86_types::CpuGeneration;

use crate::bus::{IoBridge, PIT_IRQ_LINE, RTC_IRQ_LINE};
use crate::config::{fastboot, MachineConfig, MachineConfigError};
use crate::host::NullHost;

/// `Cpu::step`'s "instructions executed, and why it stopped" result,
/// mirroring the grounding workspace's `RunExit` convention for
/// communicating a slice's outcome back to a host run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// All `n` requested instructions retired.
    Completed { instructions: u32 },
    /// The CPU executed `HLT` and is waiting for an interrupt; the
    /// harness should still call `run_slice` again (it ticks the timers)
    /// rather than busy-spin.
    Halted { instructions: u32 },
}

/// RTC-clock (32768 Hz) period in whole microseconds, for converting a
/// wall-clock delta into `Cmos::update_irq`'s tick count.
const RTC_HZ: u64 = 32768;

pub struct Machine {
    cpu: Cpu,
    pic: PicPair,
    pit: Pit,
    cmos: Cmos,
    host: Box<dyn aero86_cpu::PortIo + Send>,
    clock: Arc<dyn Clock>,
    last_rtc_tick_us: u64,
    config: MachineConfig,
}

impl Machine {
    /// Builds the machine from a configuration table: RAM is
    /// sized, firmware/kernel blobs are loaded, and the CPU is left in
    /// its post-reset state (real-mode `F000:FFF0`, or the fast-boot stub
    /// if `config.kernel` is set).
    pub fn new(config: MachineConfig) -> Result<Self, MachineConfigError> {
        Self::with_host(config, None, None)
    }

    /// As `new`, but lets the harness attach a port-I/O device table for
    /// everything outside the PIC/PIT/CMOS (disk, VGA, audio, PS/2,...)
    /// and/or a memory-mapped-I/O device table for the `0xA0000..0xC0000`
    /// window and PCI MMIO space.
    pub fn with_host(
        config: MachineConfig,
        host_ports: Option<Box<dyn aero86_cpu::PortIo + Send>>,
        mmio: Option<Box<dyn IoMem + Send>>,
    ) -> Result<Self, MachineConfigError> {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
        Self::with_clock(config, host_ports, mmio, clock)
    }

    /// As `with_host`, but lets the caller supply the `Clock` the PIT and
    /// CMOS/RTC measure elapsed time against. Production callers want
    /// `with_host`'s real `MonotonicClock`; tests want a `FakeClock` so
    /// PIT-driven wakeups are deterministic instead
    /// of racing wall-clock time.
    pub fn with_clock(
        config: MachineConfig,
        host_ports: Option<Box<dyn aero86_cpu::PortIo + Send>>,
        mmio: Option<Box<dyn IoMem + Send>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MachineConfigError> {
        config.validate()?;
        tracing::debug!(mem_size = config.mem_size, cpu_gen = config.cpu_gen, fpu = config.fpu, "constructing machine");
        let gen = CpuGeneration::from_u8(config.cpu_gen).expect("validated above");
        let mut cpu = Cpu::new(config.mem_size, gen);
        if let Some(mmio) = mmio {
            cpu.set_io_mem(mmio);
        }
        let mut machine = Machine {
            cpu,
            pic: PicPair::new(),
            pit: Pit::new(clock.clone()),
            cmos: Cmos::new(),
            host: host_ports.unwrap_or_else(|| Box::new(NullHost)),
            last_rtc_tick_us: clock.now_us(),
            clock,
            config,
        };
        machine.load_firmware_and_kernel();
        machine.reset();
        Ok(machine)
    }

    fn load_firmware_and_kernel(&mut self) {
        if let Some(bios) = &self.config.bios {
            let addr = 0x0010_0000u32 - bios.len() as u32;
            self.cpu.load_blob(addr, bios);
        }
        if let Some(vga_bios) = &self.config.vga_bios {
            self.cpu.load_blob(0x000C_0000, vga_bios);
        }
        if let Some(kernel) = &self.config.kernel {
            self.cpu.load_blob(fastboot::KERNEL_ADDR, kernel);
        }
        if let Some(initrd) = &self.config.initrd {
            self.cpu.load_blob(fastboot::INITRD_ADDR, initrd);
        }
        if let Some(cmdline) = &self.config.cmdline {
            let mut bytes = cmdline.clone().into_bytes();
            bytes.push(0);
            self.cpu.load_blob(fastboot::CMDLINE_ADDR, &bytes);
        }
        if let Some(stub) = &self.config.linuxstart {
            self.cpu.load_blob(fastboot::STUB_ADDR, stub);
        }
    }

    /// Reset request: the CPU's architectural
    /// state goes back to power-on (or the fast-boot entry point), the
    /// PIC/PIT/CMOS reinitialize, but RAM (and anything loaded into it at
    /// construction) is untouched.
    pub fn reset(&mut self) {
        tracing::debug!("machine reset");
        self.cpu.reset();
        self.pic.reset();
        self.pit.reset();
        self.cmos.reset();
        self.last_rtc_tick_us = self.clock.now_us();

        if self.config.kernel.is_some() {
            // Fast-boot path: CS:IP -> linear 0x10000, with
            // EAX/EBX/ECX/EDX pre-loaded per the machine-configuration
            // table. `STUB_ADDR` is paragraph-aligned, so a real-mode
            // selector of `STUB_ADDR >> 4` with IP 0 lands exactly there.
            let stub_selector = (fastboot::STUB_ADDR >> 4) as u16;
            self.cpu.regs.set_seg(aero86_cpu::SegReg::Cs, aero86_cpu::SegmentShadow::real_mode(stub_selector));
            self.cpu.regs.eip = 0;
            let initrd_size = self.config.initrd.as_ref().map_or(0, |v| v.len()) as u32;
            let kernel_size = self.config.kernel.as_ref().map_or(0, |v| v.len()) as u32;
            self.cpu.regs.set_gpr(aero86_cpu::Gpr::Eax, self.config.mem_size as u32);
            self.cpu.regs.set_gpr(aero86_cpu::Gpr::Ebx, initrd_size);
            self.cpu.regs.set_gpr(aero86_cpu::Gpr::Ecx, fastboot::CMDLINE_ADDR);
            self.cpu.regs.set_gpr(aero86_cpu::Gpr::Edx, kernel_size);
        }
    }

    /// Run up to `n` instructions (the host is expected to call this
    /// repeatedly). Also advances the PIT and CMOS/RTC by the wall-clock
    /// time elapsed since the previous call, so a host that polls in a
    /// loop (rather than free-running) still gets timely `IRQ0`/`IRQ8`
    /// delivery.
    pub fn run_slice(&mut self, n: u32) -> RunExit {
        self.tick_devices();
        let mut bridge = IoBridge {
            pic: &mut self.pic,
            pit: &mut self.pit,
            cmos: &mut self.cmos,
            host: self.host.as_mut(),
        };
        let instructions = self.cpu.step(&mut bridge, n);
        self.tick_devices();
        if self.cpu.halted {
            RunExit::Halted { instructions }
        } else {
            RunExit::Completed { instructions }
        }
    }

    fn tick_devices(&mut self) {
        self.pit.update_irq(&mut self.pic, PIT_IRQ_LINE);
        let now_us = self.clock.now_us();
        let elapsed_us = now_us.saturating_sub(self.last_rtc_tick_us);
        let rtc_ticks = elapsed_us.saturating_mul(RTC_HZ) / 1_000_000;
        if rtc_ticks > 0 {
            self.cmos.update_irq(&mut self.pic, RTC_IRQ_LINE, rtc_ticks);
            self.last_rtc_tick_us = now_us;
        }
    }

    /// A device (out-of-scope here, wired in by the host) raises
    /// or lowers an IRQ line.
    pub fn raise_irq(&mut self, line: u8, level: bool) {
        self.pic.set_irq(line, level);
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn cpu_mut(&mut self) -> &mut Cpu {
        &mut self.cpu
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }
}

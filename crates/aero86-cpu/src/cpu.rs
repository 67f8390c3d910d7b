//! `Cpu`: the register file, lazy flags, memory interface and (optionally)
//! FPU bundled into the one object `step()` drives.

use crate::exception::Exception;
use crate::lazyflags::LazyFlags;
use crate::membus::PagingBus;
use crate::regs::{Cr0, Gpr, RegisterFile, SegReg, SegmentShadow};
use aero86_mmu::FetchCache;
use aero86_types::{CpuGeneration, Eflags};

#[cfg(feature = "fpu")]
use crate::fpu::Fpu;

/// Condition-code predicates shared by `Jcc`/`SETcc`/`CMOVcc`/loop
/// instructions.
#[derive(Clone, Copy, Debug)]
pub enum Cond {
    O,
    No,
    B,
    Nb,
    Z,
    Nz,
    Be,
    Nbe,
    S,
    Ns,
    P,
    Np,
    L,
    Nl,
    Le,
    Nle,
}

impl Cond {
    pub fn from_tttn(tttn: u8) -> Self {
        match tttn & 0xF {
            0x0 => Cond::O,
            0x1 => Cond::No,
            0x2 => Cond::B,
            0x3 => Cond::Nb,
            0x4 => Cond::Z,
            0x5 => Cond::Nz,
            0x6 => Cond::Be,
            0x7 => Cond::Nbe,
            0x8 => Cond::S,
            0x9 => Cond::Ns,
            0xA => Cond::P,
            0xB => Cond::Np,
            0xC => Cond::L,
            0xD => Cond::Nl,
            0xE => Cond::Le,
            _ => Cond::Nle,
        }
    }
}

/// The one-instruction "interrupt shadow" after `STI`/`MOV SS`/`POP SS`:
/// even though `IF` is now set, a pending hardware interrupt must not be
/// taken until the *following* instruction has retired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum IntShadow {
    #[default]
    None,
    Armed,
}

pub struct Cpu {
    pub regs: RegisterFile,
    pub lazy: LazyFlags,
    pub bus: PagingBus,
    pub(crate) fetch_cache: FetchCache,
    #[cfg(feature = "fpu")]
    pub fpu: Fpu,
    pub gen: CpuGeneration,
    pub halted: bool,
    pub nmi_pending: bool,
    pub(crate) int_shadow: IntShadow,
    /// Backing counter for `RDTSC`: incremented once per instruction
    /// attempted, rather than sampling a host clock, so timing-sensitive
    /// tests stay deterministic.
    pub tsc: u64,
}

impl Cpu {
    pub fn new(ram_size: usize, gen: CpuGeneration) -> Self {
        Cpu {
            regs: RegisterFile::reset_state(),
            lazy: LazyFlags::default(),
            bus: PagingBus::new(ram_size),
            fetch_cache: FetchCache::default(),
            #[cfg(feature = "fpu")]
            fpu: Fpu::default(),
            gen,
            halted: false,
            nmi_pending: false,
            int_shadow: IntShadow::None,
            tsc: 0,
        }
    }

    /// Load a firmware/kernel/initrd blob at a physical offset. A thin passthrough to `PagingBus::load_blob` so harness code
    /// only has to hold onto a `Cpu`, not also a raw `Bus`.
    pub fn load_blob(&mut self, phys_addr: u32, bytes: &[u8]) {
        self.bus.load_blob(phys_addr, bytes);
    }

    /// Install the host's memory-mapped-I/O device table for the VGA
    /// window and PCI MMIO space.
    pub fn set_io_mem(&mut self, io_mem: Box<dyn aero86_mmu::IoMem + Send>) {
        self.bus.set_io_mem(io_mem);
    }

    pub fn write_protect(&self) -> bool {
        self.regs.cr0.contains(Cr0::WP)
    }

    /// Reset request: architectural state goes
    /// back to the power-on reset vector `F000:FFF0`, the TLB and i-fetch
    /// cache are flushed, but the RAM buffer (and anything a host already
    /// loaded into it, e.g. a BIOS blob) is left untouched.
    pub fn reset(&mut self) {
        self.regs = RegisterFile::reset_state();
        self.lazy = LazyFlags::default();
        self.bus.flush_tlb();
        self.fetch_cache = FetchCache::default();
        #[cfg(feature = "fpu")]
        {
            self.fpu = Fpu::default();
        }
        self.halted = false;
        self.nmi_pending = false;
        self.int_shadow = IntShadow::None;
        self.tsc = 0;
    }

    // ---- general-purpose register access at a given operand width ----

    pub fn read_gpr8(&self, idx: u8) -> u8 {
        let v = self.regs.gpr(Gpr::from_index(idx & 3));
        if idx & 4 != 0 {
            (v >> 8) as u8
        } else {
            v as u8
        }
    }

    pub fn write_gpr8(&mut self, idx: u8, val: u8) {
        let r = Gpr::from_index(idx & 3);
        let v = self.regs.gpr(r);
        let merged = if idx & 4 != 0 {
            (v & 0xFFFF_00FF) | ((val as u32) << 8)
        } else {
            (v & 0xFFFF_FF00) | val as u32
        };
        self.regs.set_gpr(r, merged);
    }

    pub fn read_gpr16(&self, idx: u8) -> u16 {
        self.regs.gpr(Gpr::from_index(idx)) as u16
    }

    pub fn write_gpr16(&mut self, idx: u8, val: u16) {
        let r = Gpr::from_index(idx);
        let v = self.regs.gpr(r);
        self.regs.set_gpr(r, (v & 0xFFFF_0000) | val as u32);
    }

    pub fn read_gpr32(&self, idx: u8) -> u32 {
        self.regs.gpr(Gpr::from_index(idx))
    }

    pub fn write_gpr32(&mut self, idx: u8, val: u32) {
        self.regs.set_gpr(Gpr::from_index(idx), val);
    }

    pub fn read_gpr(&self, idx: u8, width: u8) -> u32 {
        match width {
            8 => self.read_gpr8(idx) as u32,
            16 => self.read_gpr16(idx) as u32,
            _ => self.read_gpr32(idx),
        }
    }

    pub fn write_gpr(&mut self, idx: u8, width: u8, val: u32) {
        match width {
            8 => self.write_gpr8(idx, val as u8),
            16 => self.write_gpr16(idx, val as u16),
            _ => self.write_gpr32(idx, val),
        }
    }

    // ---- memory access through the currently loaded segment shadows ----

    fn addr_for(&mut self, seg: SegReg, offset: u32, size: u32, is_write: bool) -> Result<aero86_mmu::AddrResult, Exception> {
        let shadow: SegmentShadow = *self.regs.seg(seg);
        let cpl = self.regs.cpl;
        let paging = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let wp = self.write_protect();
        self.bus.resolve(&shadow, offset, size, is_write, cpl, paging, cr3, wp)
    }

    pub fn read_mem(&mut self, seg: SegReg, offset: u32, width: u8) -> Result<u32, Exception> {
        let size = (width / 8) as u32;
        let addr = self.addr_for(seg, offset, size, false)?;
        Ok(match width {
                8 => self.bus.read8(addr) as u32,
                16 => self.bus.read16(addr) as u32,
                _ => self.bus.read32(addr),
        })
    }

    pub fn write_mem(&mut self, seg: SegReg, offset: u32, width: u8, val: u32) -> Result<(), Exception> {
        let size = (width / 8) as u32;
        let addr = self.addr_for(seg, offset, size, true)?;
        match width {
            8 => self.bus.write8(addr, val as u8),
            16 => self.bus.write16(addr, val as u16),
            _ => self.bus.write32(addr, val),
        }
        self.bus.notify_store_physical(&mut self.fetch_cache, addr);
        Ok(())
    }

    // ---- instruction fetch ----

    pub fn fetch_u8(&mut self) -> Result<u8, Exception> {
        let shadow: SegmentShadow = *self.regs.seg(SegReg::Cs);
        let cpl = self.regs.cpl;
        let paging = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let wp = self.write_protect();
        let b = self.bus.fetch_u8(&mut self.fetch_cache, &shadow, self.regs.eip, cpl, paging, cr3, wp)?;
        self.regs.eip = self.regs.eip.wrapping_add(1);
        Ok(b)
    }

    pub fn fetch_u16(&mut self) -> Result<u16, Exception> {
        let lo = self.fetch_u8()? as u16;
        let hi = self.fetch_u8()? as u16;
        Ok(lo | (hi << 8))
    }

    pub fn fetch_u32(&mut self) -> Result<u32, Exception> {
        let lo = self.fetch_u16()? as u32;
        let hi = self.fetch_u16()? as u32;
        Ok(lo | (hi << 16))
    }

    pub fn fetch_immediate(&mut self, width: u8) -> Result<u32, Exception> {
        match width {
            8 => Ok(self.fetch_u8()? as u32),
            16 => Ok(self.fetch_u16()? as u32),
            _ => self.fetch_u32(),
        }
    }

    // ---- stack ----

    fn sp_width(&self) -> u8 {
        if self.regs.stack_size_32() {
            32
        } else {
            16
        }
    }

    fn read_sp(&self) -> u32 {
        let v = self.regs.gpr(Gpr::Esp);
        if self.sp_width() == 32 {
            v
        } else {
            v & 0xFFFF
        }
    }

    fn write_sp(&mut self, new_sp: u32) {
        let old = self.regs.gpr(Gpr::Esp);
        let merged = if self.sp_width() == 32 {
            new_sp
        } else {
            (old & 0xFFFF_0000) | (new_sp & 0xFFFF)
        };
        self.regs.set_gpr(Gpr::Esp, merged);
    }

    pub fn push(&mut self, width: u8, val: u32) -> Result<(), Exception> {
        let new_sp = self.read_sp().wrapping_sub((width / 8) as u32);
        self.write_mem(SegReg::Ss, new_sp, width, val)?;
        self.write_sp(new_sp);
        Ok(())
    }

    pub fn pop(&mut self, width: u8) -> Result<u32, Exception> {
        let sp = self.read_sp();
        let val = self.read_mem(SegReg::Ss, sp, width)?;
        self.write_sp(sp.wrapping_add((width / 8) as u32));
        Ok(val)
    }

    // ---- flags ----

    pub fn flags(&mut self) -> Eflags {
        self.lazy.refresh_flags(&mut self.regs.eflags);
        self.regs.eflags
    }

    pub fn eval_cond(&mut self, cond: Cond) -> bool {
        let stored = self.regs.eflags;
        let cf = self.lazy.get_cf(stored);
        let zf = self.lazy.get_zf(stored);
        let sf = self.lazy.get_sf(stored);
        let of = self.lazy.get_of(stored);
        let pf = self.lazy.get_pf(stored);
        match cond {
            Cond::O => of,
            Cond::No => !of,
            Cond::B => cf,
            Cond::Nb => !cf,
            Cond::Z => zf,
            Cond::Nz => !zf,
            Cond::Be => cf || zf,
            Cond::Nbe => !cf && !zf,
            Cond::S => sf,
            Cond::Ns => !sf,
            Cond::P => pf,
            Cond::Np => !pf,
            Cond::L => sf != of,
            Cond::Nl => sf == of,
            Cond::Le => zf || (sf != of),
            Cond::Nle => !zf && (sf == of),
        }
    }

    // ---- control flow ----

    pub fn operand_size_32(&self, override_present: bool) -> bool {
        self.regs.code_size_32() ^ override_present
    }

    pub fn address_size_32(&self, override_present: bool) -> bool {
        self.regs.code_size_32() ^ override_present
    }

    pub fn set_eip(&mut self, eip: u32, width32: bool) {
        self.regs.eip = if width32 { eip } else { eip & 0xFFFF };
    }

    /// Is a maskable hardware interrupt deliverable right now: `IF` set,
    /// not inside the one-instruction shadow after `STI`.
    pub fn interrupts_enabled(&self) -> bool {
        self.regs.eflags.contains(Eflags::IF) && self.int_shadow == IntShadow::None
    }

    /// Run up to `n` instructions, servicing pending faults/interrupts at
    /// each boundary. Returns the number of instructions actually retired.
    pub fn step<D: crate::io::Devices>(&mut self, devices: &mut D, n: u32) -> u32 {
        let mut executed = 0;
        for _ in 0..n {
            if self.nmi_pending {
                self.nmi_pending = false;
                self.deliver(Exception::Nmi);
            } else if self.halted {
                if devices.intr_pending() && self.interrupts_enabled() {
                    self.halted = false;
                } else {
                    break;
                }
            }

            if self.halted {
                break;
            }

            if self.interrupts_enabled() && devices.intr_pending() {
                let vector = devices.read_irq();
                self.deliver(Exception::ExternalInterrupt(vector));
            }
            // The shadow only suppresses interrupt recognition for the
            // single instruction immediately after it was armed.
            self.int_shadow = IntShadow::None;
            self.tsc = self.tsc.wrapping_add(1);

            match self.decode_and_execute(devices) {
                Ok(()) => {}
                Err(e) => self.deliver(e),
            }
            executed += 1;
        }
        executed
    }

    fn deliver(&mut self, e: Exception) {
        if let Err(df) = crate::isr::call_isr(self, e) {
            // A fault raised while delivering a fault escalates to #DF; a
            // fault raised while #DF itself is being delivered is the triple
            // fault, which real silicon resets the machine over. This core
            // has no reset-on-fault path of its own, so it surfaces the
            // condition the only way a host can't miss: abort with a full
            // state dump.
            if let Err(second) = crate::isr::call_isr(self, df) {
                self.abort_triple_fault(df, second);
            }
        }
    }

    /// Host abort for the triple-fault case: a fault while already
    /// delivering `#DF`. Logs a full architectural state dump and aborts the
    /// process, per the documented "Unrecoverable" error taxonomy — there is
    /// no guest-visible recovery from this condition.
    fn abort_triple_fault(&mut self, double_fault: Exception, second_fault: Exception) -> ! {
        let gprs: [(&str, u32); 8] = [
            ("eax", self.regs.gpr(Gpr::Eax)),
            ("ecx", self.regs.gpr(Gpr::Ecx)),
            ("edx", self.regs.gpr(Gpr::Edx)),
            ("ebx", self.regs.gpr(Gpr::Ebx)),
            ("esp", self.regs.gpr(Gpr::Esp)),
            ("ebp", self.regs.gpr(Gpr::Ebp)),
            ("esi", self.regs.gpr(Gpr::Esi)),
            ("edi", self.regs.gpr(Gpr::Edi)),
        ];
        let segs: [(&str, SegReg); 6] = [
            ("cs", SegReg::Cs),
            ("ss", SegReg::Ss),
            ("ds", SegReg::Ds),
            ("es", SegReg::Es),
            ("fs", SegReg::Fs),
            ("gs", SegReg::Gs),
        ];
        let seg_dump: Vec<String> = segs
            .iter()
            .map(|(name, reg)| {
                let s = self.regs.seg(*reg);
                format!("{name}=0x{:04x} base=0x{:08x} limit=0x{:08x}", s.selector.0, s.base, s.limit)
            })
            .collect();

        let cs = *self.regs.seg(SegReg::Cs);
        let stack = *self.regs.seg(SegReg::Ss);
        let esp = self.regs.gpr(Gpr::Esp);
        let eip = self.regs.eip;
        let code = self.dump_bytes(&cs, eip, 32);
        let stack_bytes = self.dump_bytes(&stack, esp, 32);

        tracing::error!(
            double_fault = ?double_fault,
            second_fault = ?second_fault,
            eip = format!("0x{eip:08x}"),
            gprs = ?gprs.map(|(n, v)| format!("{n}=0x{v:08x}")),
            segs = ?seg_dump,
            cr0 = ?self.regs.cr0,
            cr2 = format!("0x{:08x}", self.regs.cr2),
            cr3 = format!("0x{:08x}", self.regs.cr3),
            cpl = self.regs.cpl,
            iopl = self.regs.eflags.iopl(),
            code_at_cs_eip = ?code,
            stack_at_ss_esp = ?stack_bytes,
            "triple fault: host abort",
        );
        panic!(
            "triple fault at {:04x}:{eip:08x} delivering {double_fault:?} (second fault {second_fault:?}); see the preceding tracing::error! for the full state dump",
            cs.selector.0,
        );
    }

    /// Best-effort byte dump for the abort path: a translation failure (e.g.
    /// the stack segment itself being the cause of the double fault) fills
    /// the remainder with `0xFF` rather than faulting again inside the abort
    /// handler.
    fn dump_bytes(&mut self, shadow: &SegmentShadow, offset: u32, len: u32) -> Vec<u8> {
        let paging_enabled = self.regs.paging_enabled();
        let cr3 = self.regs.cr3;
        let write_protect = self.regs.cr0.contains(Cr0::WP);
        let cpl = self.regs.cpl;
        (0..len)
            .map(|i| {
                self.bus
                    .resolve(shadow, offset.wrapping_add(i), 1, false, cpl, paging_enabled, cr3, write_protect)
                    .map(|addr| self.bus.read8(addr))
                    .unwrap_or(0xFF)
            })
            .collect()
    }
}

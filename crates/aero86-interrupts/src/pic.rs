//! Single 8259A controller and the master/slave cascade that forms a PC's
//! interrupt controller. The edge-detect/priority/ICW state
//! machine mirrors the reference i8259 model this workspace's interrupt
//! handling was distilled from.

/// One 8259A. `PicPair` holds two of these, wired master (index 0, ports
/// 0x20/0x21) and slave (index 1, ports 0xA0/0xA1).
#[derive(Debug, Clone)]
pub struct Pic {
    /// Edge-detection shadow: the level seen on each line last time
    /// `set_irq` ran, used to turn level transitions into IRR sets.
    last_irr: u8,
    irr: u8,
    imr: u8,
    isr: u8,
    /// Rotation base: priority 0 maps to line `priority_add`, ascending.
    priority_add: u8,
    irq_base: u8,
    /// 0 = next port-0 read returns IRR, 1 = returns ISR.
    read_reg_select: bool,
    poll: bool,
    special_mask: bool,
    /// 0 = not initializing; 1..=3 = waiting for ICW2/ICW3/ICW4 respectively.
    init_state: u8,
    auto_eoi: bool,
    rotate_on_auto_eoi: bool,
    special_fully_nested_mode: bool,
    init4: bool,
    single_mode: bool,
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic {
    pub fn new() -> Self {
        Self {
            last_irr: 0,
            irr: 0,
            imr: 0,
            isr: 0,
            priority_add: 0,
            irq_base: 0,
            read_reg_select: false,
            poll: false,
            special_mask: false,
            init_state: 0,
            auto_eoi: false,
            rotate_on_auto_eoi: false,
            special_fully_nested_mode: false,
            init4: false,
            single_mode: false,
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    /// Edge-triggered `set_irq`: a 0->1 transition latches the IRR bit; the
    /// bit otherwise stays latched until acknowledged or masked off, a 1->0
    /// transition only clears the edge shadow.
    fn set_irq1(&mut self, irq: u8, level: bool) {
        let mask = 1u8 << irq;
        if level {
            if self.last_irr & mask == 0 {
                self.irr |= mask;
            }
            self.last_irr |= mask;
        } else {
            self.last_irr &= !mask;
        }
    }

    /// Highest priority set bit in `mask`, relative to `priority_add`.
    /// Returns 8 if `mask` is empty (matches the "no irq" sentinel used
    /// throughout the acknowledge path below).
    fn priority_of(&self, mask: u8) -> u8 {
        if mask == 0 {
            return 8;
        }
        let mut priority = 0u8;
        while mask & (1 << ((priority.wrapping_add(self.priority_add)) & 7)) == 0 {
            priority += 1;
        }
        priority
    }

    /// The line this controller currently wants serviced, if any is both
    /// unmasked and of strictly higher priority than whatever is already
    /// in service.
    fn get_irq(&self, is_master: bool) -> Option<u8> {
        let requested = self.irr & !self.imr;
        let priority = self.priority_of(requested);
        if priority == 8 {
            return None;
        }
        let mut in_service_mask = self.isr;
        if self.special_mask {
            in_service_mask &= !self.imr;
        }
        if self.special_fully_nested_mode && is_master {
            in_service_mask &= !(1 << 2);
        }
        let cur_priority = self.priority_of(in_service_mask);
        if priority < cur_priority {
            Some((priority.wrapping_add(self.priority_add)) & 7)
        } else {
            None
        }
    }

    fn intack(&mut self, irq: u8) {
        if self.auto_eoi {
            if self.rotate_on_auto_eoi {
                self.priority_add = (irq + 1) & 7;
            }
        } else {
            self.isr |= 1 << irq;
        }
        self.irr &= !(1 << irq);
    }

    fn read_port0(&self) -> u8 {
        if self.read_reg_select {
            self.isr
        } else {
            self.irr
        }
    }
}

/// The cascaded pair a CPU actually talks to: master owns IRQ0-7 (IRQ2
/// carries the slave's output), slave owns IRQ8-15.
#[derive(Debug, Clone)]
pub struct PicPair {
    master: Pic,
    slave: Pic,
}

impl Default for PicPair {
    fn default() -> Self {
        Self::new()
    }
}

impl PicPair {
    pub fn new() -> Self {
        Self {
            master: Pic::new(),
            slave: Pic::new(),
        }
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    fn pic_mut(&mut self, irq: u8) -> &mut Pic {
        if irq < 8 {
            &mut self.master
        } else {
            &mut self.slave
        }
    }

    /// Re-derive the slave-through-IRQ2 cascade after any state change and
    /// report whether the master now wants to interrupt the CPU. Must be
    /// called after every `set_irq` and every EOI/priority command, matching
    /// the "call every time the active irq may change" contract this model
    /// is grounded on.
    fn update_irq(&mut self) -> bool {
        if self.slave.get_irq(false).is_some() {
            self.master.set_irq1(2, true);
            self.master.set_irq1(2, false);
        }
        self.master.get_irq(true).is_some()
    }

    /// Raise or lower interrupt line `irq` (0..=15). Returns `true` if the
    /// master's `INTR` output is now asserted, i.e. the CPU should be told
    /// an interrupt is pending.
    pub fn set_irq(&mut self, irq: u8, level: bool) -> bool {
        debug_assert!(irq < 16, "irq line out of range: {irq}");
        let (chip, local) = if irq < 8 { (&mut self.master, irq) } else { (&mut self.slave, irq - 8) };
        chip.set_irq1(local, level);
        self.update_irq()
    }

    /// `true` once the master has a request ready to be acknowledged.
    pub fn intr_pending(&self) -> bool {
        self.master.get_irq(true).is_some()
    }

    /// Acknowledge the pending interrupt (an INTA cycle) and return its
    /// vector number, cascading through the slave if IRQ2 was the source.
    /// Falls back to the `irq_base + 7` spurious vector on either
    /// controller if priority tracking and `INTR` disagree (a transient
    /// race, not expected in steady state but handled defensively).
    pub fn read_irq(&mut self) -> u8 {
        let intno = match self.master.get_irq(true) {
            Some(irq) => {
                self.master.intack(irq);
                if irq == 2 {
                    match self.slave.get_irq(false) {
                        Some(irq2) => {
                            self.slave.intack(irq2);
                            self.slave.irq_base.wrapping_add(irq2)
                        }
                        None => self.slave.irq_base.wrapping_add(7),
                    }
                } else {
                    self.master.irq_base.wrapping_add(irq)
                }
            }
            None => self.master.irq_base.wrapping_add(7),
        };
        self.update_irq();
        intno
    }

    /// Write to a controller's command port (0x20 or 0xA0).
    pub fn write_cmd(&mut self, is_slave: bool, val: u8) {
        let pic = if is_slave { &mut self.slave } else { &mut self.master };
        if val & 0x10 != 0 {
            // ICW1: start (or restart) the initialization sequence.
            pic.reset();
            pic.init_state = 1;
            pic.init4 = val & 0x01 != 0;
            pic.single_mode = val & 0x02 != 0;
            if val & 0x08 != 0 {
                tracing::error!("PIC ICW1 requested level-triggered mode, which is not supported");
            }
            return;
        }
        if val & 0x08 != 0 {
            // OCW3.
            if val & 0x04 != 0 {
                pic.poll = true;
            }
            if val & 0x02 != 0 {
                pic.read_reg_select = val & 0x01 != 0;
            }
            if val & 0x40 != 0 {
                pic.special_mask = (val >> 5) & 1 != 0;
            }
            return;
        }
        // OCW2.
        let cmd = val >> 5;
        match cmd {
            0 | 4 => pic.rotate_on_auto_eoi = cmd >> 2 != 0,
            1 | 5 => {
                // Non-specific EOI (5 = also rotate).
                let priority = pic.priority_of(pic.isr);
                if priority != 8 {
                    let irq = (priority.wrapping_add(pic.priority_add)) & 7;
                    pic.isr &= !(1 << irq);
                    if cmd == 5 {
                        pic.priority_add = (irq + 1) & 7;
                    }
                    self.update_irq();
                }
            }
            3 => {
                // Specific EOI.
                let irq = val & 7;
                pic.isr &= !(1 << irq);
                self.update_irq();
            }
            6 => {
                // Set priority command.
                pic.priority_add = (val + 1) & 7;
                self.update_irq();
            }
            7 => {
                // Rotate on specific EOI.
                let irq = val & 7;
                pic.isr &= !(1 << irq);
                pic.priority_add = (irq + 1) & 7;
                self.update_irq();
            }
            _ => {}
        }
    }

    /// Write to a controller's data port (0x21 or 0xA1). Behavior depends
    /// on whether an ICW init sequence is in progress.
    pub fn write_data(&mut self, is_slave: bool, val: u8) {
        let pic = if is_slave { &mut self.slave } else { &mut self.master };
        match pic.init_state {
            0 => {
                pic.imr = val;
                self.update_irq();
            }
            1 => {
                pic.irq_base = val & 0xF8;
                pic.init_state = if pic.single_mode {
                    if pic.init4 {
                        3
                    } else {
                        0
                    }
                } else {
                    2
                };
            }
            2 => {
                pic.init_state = if pic.init4 { 3 } else { 0 };
            }
            3 => {
                pic.special_fully_nested_mode = (val >> 4) & 1 != 0;
                pic.auto_eoi = (val >> 1) & 1 != 0;
                pic.init_state = 0;
            }
            _ => unreachable!("init_state confined to 0..=3"),
        }
    }

    /// Read a controller's command port (0x20 or 0xA0): IRR or ISR,
    /// selected by the last OCW3 read-register-select write, or the poll
    /// result if a poll command was issued.
    pub fn read_cmd(&mut self, is_slave: bool) -> u8 {
        let is_master = !is_slave;
        let pic = if is_slave { &mut self.slave } else { &mut self.master };
        if pic.poll {
            pic.poll = false;
            return self.poll_read(is_master);
        }
        pic.read_port0()
    }

    /// Read a controller's data port (0x21 or 0xA1): the IMR.
    pub fn read_data(&self, is_slave: bool) -> u8 {
        if is_slave {
            self.slave.imr
        } else {
            self.master.imr
        }
    }

    fn poll_read(&mut self, is_master: bool) -> u8 {
        let pic = if is_master { &mut self.master } else { &mut self.slave };
        match pic.get_irq(is_master) {
            Some(irq) => {
                if is_master && irq == 2 {
                    // Fold the slave's acknowledge into the same poll read.
                    self.master.isr &= !(1 << 2);
                    self.master.irr &= !(1 << 2);
                }
                pic.irr &= !(1 << irq);
                pic.isr &= !(1 << irq);
                self.update_irq();
                irq
            }
            None => {
                self.update_irq();
                0x07
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_pair() -> PicPair {
        let mut pair = PicPair::new();
        // Standard PC/AT init: master at 0x20/0x21, vector base 0x08;
        // slave at 0xA0/0xA1, vector base 0x70; cascaded via IRQ2.
        pair.write_cmd(false, 0x11);
        pair.write_data(false, 0x08);
        pair.write_data(false, 0x04); // ICW3: slave attached on IRQ2.
        pair.write_data(false, 0x01); // ICW4: 8086 mode.
        pair.write_cmd(true, 0x11);
        pair.write_data(true, 0x70);
        pair.write_data(true, 0x02); // ICW3: slave identity.
        pair.write_data(true, 0x01);
        pair
    }

    #[test]
    fn masked_irq_does_not_assert_intr() {
        let mut pair = init_pair();
        pair.write_data(false, 0xFF); // mask everything.
        let asserted = pair.set_irq(0, true);
        assert!(!asserted);
        assert!(!pair.intr_pending());
    }

    #[test]
    fn unmasked_irq0_is_acknowledged_with_its_vector() {
        let mut pair = init_pair();
        let asserted = pair.set_irq(0, true);
        assert!(asserted);
        assert_eq!(pair.read_irq(), 0x08);
        // ISR now holds IRQ0; a second, lower-priority line shouldn't fire.
        pair.set_irq(1, true);
        assert!(!pair.intr_pending());
    }

    #[test]
    fn eoi_clears_isr_and_reveals_next_priority() {
        let mut pair = init_pair();
        pair.set_irq(0, true);
        assert_eq!(pair.read_irq(), 0x08);
        pair.set_irq(1, true);
        assert!(!pair.intr_pending());
        pair.write_cmd(false, 0x20); // non-specific EOI.
        assert!(pair.intr_pending());
        assert_eq!(pair.read_irq(), 0x09);
    }

    #[test]
    fn slave_irq_cascades_through_master_irq2() {
        let mut pair = init_pair();
        let asserted = pair.set_irq(8, true); // slave IRQ0, global line 8.
        assert!(asserted);
        assert_eq!(pair.read_irq(), 0x70);
    }

    #[test]
    fn edge_triggered_level_false_does_not_retrigger() {
        let mut pair = init_pair();
        pair.set_irq(3, true);
        pair.set_irq(3, false);
        assert_eq!(pair.read_irq(), 0x0B);
        // No new edge since the last set_irq(true), so nothing pending.
        assert!(!pair.intr_pending());
    }

    #[test]
    fn nested_lower_priority_irq_waits_for_specific_eoi() {
        let mut pair = init_pair();
        pair.set_irq(1, true);
        assert_eq!(pair.read_irq(), 0x09); // IRQ1 in service.

        // A lower-priority line raised while IRQ1 is in service doesn't
        // reach `INTR` yet: priority blocking, not masking.
        let asserted = pair.set_irq(3, true);
        assert!(!asserted);
        assert!(!pair.intr_pending());

        pair.write_cmd(false, 0x61); // specific EOI, IRQ1.
        assert!(pair.intr_pending());
        assert_eq!(pair.read_irq(), 0x0B); // IRQ3 now serviced.

        pair.write_cmd(false, 0x20); // non-specific EOI.
        assert!(!pair.intr_pending());
    }

    #[test]
    fn spurious_read_returns_base_plus_seven() {
        let mut pair = init_pair();
        assert!(!pair.intr_pending());
        assert_eq!(pair.read_irq(), 0x0F);
    }
}

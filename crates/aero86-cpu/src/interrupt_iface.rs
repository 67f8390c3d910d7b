//! The narrow interface the CPU uses to ask "is an interrupt pending, and
//! if so which vector": PIC/PIT/CMOS are owned by the machine harness and
//! referenced by the CPU only through this interface.
//! `aero86-interrupts::PicPair` already has exactly this shape.

pub trait InterruptController {
    fn intr_pending(&self) -> bool;
    fn read_irq(&mut self) -> u8;
}

impl InterruptController for aero86_interrupts::PicPair {
    fn intr_pending(&self) -> bool {
        self.intr_pending()
    }

    fn read_irq(&mut self) -> u8 {
        self.read_irq()
    }
}

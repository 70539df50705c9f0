//! Snapshot of the ARM7TDMI architectural state taken on debug entry.

use super::registers::{M_ABT, M_FIQ, M_IRQ, M_SVC, M_UND};

/// The 37 architectural words of an ARM7TDMI: CPSR, R0-R15, the banked
/// R8-R14 copies, and the per-mode SPSRs.
///
/// The snapshot is populated on debug entry, may be mutated freely while the
/// target is halted, and is written back in full on debug exit. The `r8`-`r14`
/// and `spsr` accessors alias the bank selected by the mode field of the
/// stored CPSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Arm7Context {
    pub cpsr: u32,
    pub r0: u32,
    pub r1: u32,
    pub r2: u32,
    pub r3: u32,
    pub r4: u32,
    pub r5: u32,
    pub r6: u32,
    pub r7: u32,
    pub r8_usr: u32,
    pub r9_usr: u32,
    pub r10_usr: u32,
    pub r11_usr: u32,
    pub r12_usr: u32,
    pub r13_usr: u32,
    pub r14_usr: u32,
    pub r15: u32,
    pub r8_fiq: u32,
    pub r9_fiq: u32,
    pub r10_fiq: u32,
    pub r11_fiq: u32,
    pub r12_fiq: u32,
    pub r13_fiq: u32,
    pub r14_fiq: u32,
    pub spsr_fiq: u32,
    pub r13_irq: u32,
    pub r14_irq: u32,
    pub spsr_irq: u32,
    pub r13_svc: u32,
    pub r14_svc: u32,
    pub spsr_svc: u32,
    pub r13_abt: u32,
    pub r14_abt: u32,
    pub spsr_abt: u32,
    pub r13_und: u32,
    pub r14_und: u32,
    pub spsr_und: u32,
}

impl Arm7Context {
    fn mode(&self) -> u32 {
        self.cpsr & 0x1f
    }

    /// Reads R8..R14 through the bank selected by the CPSR mode bits.
    /// `index` is the architectural register number.
    pub fn banked(&self, index: usize) -> u32 {
        let mode = self.mode();
        match (index, mode) {
            (8, M_FIQ) => self.r8_fiq,
            (8, _) => self.r8_usr,
            (9, M_FIQ) => self.r9_fiq,
            (9, _) => self.r9_usr,
            (10, M_FIQ) => self.r10_fiq,
            (10, _) => self.r10_usr,
            (11, M_FIQ) => self.r11_fiq,
            (11, _) => self.r11_usr,
            (12, M_FIQ) => self.r12_fiq,
            (12, _) => self.r12_usr,
            (13, M_FIQ) => self.r13_fiq,
            (13, M_IRQ) => self.r13_irq,
            (13, M_SVC) => self.r13_svc,
            (13, M_ABT) => self.r13_abt,
            (13, M_UND) => self.r13_und,
            (13, _) => self.r13_usr,
            (14, M_FIQ) => self.r14_fiq,
            (14, M_IRQ) => self.r14_irq,
            (14, M_SVC) => self.r14_svc,
            (14, M_ABT) => self.r14_abt,
            (14, M_UND) => self.r14_und,
            (14, _) => self.r14_usr,
            _ => panic!("register r{index} is not banked"),
        }
    }

    /// Writes R8..R14 through the bank selected by the CPSR mode bits.
    pub fn set_banked(&mut self, index: usize, value: u32) {
        let mode = self.mode();
        let slot = match (index, mode) {
            (8, M_FIQ) => &mut self.r8_fiq,
            (8, _) => &mut self.r8_usr,
            (9, M_FIQ) => &mut self.r9_fiq,
            (9, _) => &mut self.r9_usr,
            (10, M_FIQ) => &mut self.r10_fiq,
            (10, _) => &mut self.r10_usr,
            (11, M_FIQ) => &mut self.r11_fiq,
            (11, _) => &mut self.r11_usr,
            (12, M_FIQ) => &mut self.r12_fiq,
            (12, _) => &mut self.r12_usr,
            (13, M_FIQ) => &mut self.r13_fiq,
            (13, M_IRQ) => &mut self.r13_irq,
            (13, M_SVC) => &mut self.r13_svc,
            (13, M_ABT) => &mut self.r13_abt,
            (13, M_UND) => &mut self.r13_und,
            (13, _) => &mut self.r13_usr,
            (14, M_FIQ) => &mut self.r14_fiq,
            (14, M_IRQ) => &mut self.r14_irq,
            (14, M_SVC) => &mut self.r14_svc,
            (14, M_ABT) => &mut self.r14_abt,
            (14, M_UND) => &mut self.r14_und,
            (14, _) => &mut self.r14_usr,
            _ => panic!("register r{index} is not banked"),
        };
        *slot = value;
    }

    /// The SPSR of the mode selected by the CPSR mode bits, if that mode has
    /// one.
    pub fn spsr(&self) -> Option<u32> {
        match self.mode() {
            M_FIQ => Some(self.spsr_fiq),
            M_IRQ => Some(self.spsr_irq),
            M_SVC => Some(self.spsr_svc),
            M_ABT => Some(self.spsr_abt),
            M_UND => Some(self.spsr_und),
            _ => None,
        }
    }

    /// Reads a register by its GDB number: r0..r15 are 0..15, CPSR is 16.
    /// GDB has no conception of banked registers on this target, but it does
    /// re-fetch every register after the mode bits of the CPSR change.
    pub fn get_reg(&self, number: usize) -> Option<u32> {
        Some(match number {
            0 => self.r0,
            1 => self.r1,
            2 => self.r2,
            3 => self.r3,
            4 => self.r4,
            5 => self.r5,
            6 => self.r6,
            7 => self.r7,
            8..=14 => self.banked(number),
            15 => self.r15,
            16 => self.cpsr,
            _ => return None,
        })
    }

    /// Writes a register by its GDB number. See [`Arm7Context::get_reg`].
    pub fn set_reg(&mut self, number: usize, value: u32) -> Option<()> {
        match number {
            0 => self.r0 = value,
            1 => self.r1 = value,
            2 => self.r2 = value,
            3 => self.r3 = value,
            4 => self.r4 = value,
            5 => self.r5 = value,
            6 => self.r6 = value,
            7 => self.r7 = value,
            8..=14 => self.set_banked(number, value),
            15 => self.r15 = value,
            16 => self.cpsr = value,
            _ => return None,
        }
        Some(())
    }
}

impl std::fmt::Display for Arm7Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "       cpsr: {:08x}", self.cpsr)?;
        writeln!(
            f,
            "(usr)  r0:   {:08x}  r1:   {:08x}  r2:   {:08x}  r3:   {:08x}",
            self.r0, self.r1, self.r2, self.r3
        )?;
        writeln!(
            f,
            "       r4:   {:08x}  r5:   {:08x}  r6:   {:08x}  r7:   {:08x}",
            self.r4, self.r5, self.r6, self.r7
        )?;
        writeln!(
            f,
            "       r8:   {:08x}  r9:   {:08x}  r10:  {:08x}  r11:  {:08x}",
            self.r8_usr, self.r9_usr, self.r10_usr, self.r11_usr
        )?;
        writeln!(
            f,
            "       r12:  {:08x}  r13:  {:08x}  r14:  {:08x}  r15:  {:08x}",
            self.r12_usr, self.r13_usr, self.r14_usr, self.r15
        )?;
        writeln!(
            f,
            "(fiq)  r8:   {:08x}  r9:   {:08x}  r10:  {:08x}  r11:  {:08x}",
            self.r8_fiq, self.r9_fiq, self.r10_fiq, self.r11_fiq
        )?;
        writeln!(
            f,
            "       r12:  {:08x}  r13:  {:08x}  r14:  {:08x}  spsr: {:08x}",
            self.r12_fiq, self.r13_fiq, self.r14_fiq, self.spsr_fiq
        )?;
        writeln!(
            f,
            "(irq)  r13:  {:08x}  r14:  {:08x}  spsr: {:08x}",
            self.r13_irq, self.r14_irq, self.spsr_irq
        )?;
        writeln!(
            f,
            "(svc)  r13:  {:08x}  r14:  {:08x}  spsr: {:08x}",
            self.r13_svc, self.r14_svc, self.spsr_svc
        )?;
        writeln!(
            f,
            "(abt)  r13:  {:08x}  r14:  {:08x}  spsr: {:08x}",
            self.r13_abt, self.r14_abt, self.spsr_abt
        )?;
        write!(
            f,
            "(und)  r13:  {:08x}  r14:  {:08x}  spsr: {:08x}",
            self.r13_und, self.r14_und, self.spsr_und
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::architecture::arm7::registers::{M_SVC, M_SYS};

    fn context() -> Arm7Context {
        Arm7Context {
            cpsr: M_SYS,
            r0: 0,
            r1: 1,
            r2: 2,
            r3: 3,
            r4: 4,
            r5: 5,
            r6: 6,
            r7: 7,
            r8_usr: 0x80,
            r9_usr: 0x90,
            r10_usr: 0xa0,
            r11_usr: 0xb0,
            r12_usr: 0xc0,
            r13_usr: 0xd0,
            r14_usr: 0xe0,
            r15: 0x1000,
            r8_fiq: 0x81,
            r9_fiq: 0x91,
            r10_fiq: 0xa1,
            r11_fiq: 0xb1,
            r12_fiq: 0xc1,
            r13_fiq: 0xd1,
            r14_fiq: 0xe1,
            spsr_fiq: 0xf1,
            r13_irq: 0xd2,
            r14_irq: 0xe2,
            spsr_irq: 0xf2,
            r13_svc: 0xd3,
            r14_svc: 0xe3,
            spsr_svc: 0xf3,
            r13_abt: 0xd7,
            r14_abt: 0xe7,
            spsr_abt: 0xf7,
            r13_und: 0xdb,
            r14_und: 0xeb,
            spsr_und: 0xfb,
        }
    }

    #[test]
    fn bank_selection_follows_mode() {
        let mut ctx = context();
        assert_eq!(ctx.get_reg(13), Some(0xd0));
        assert_eq!(ctx.spsr(), None);

        ctx.cpsr = M_FIQ;
        assert_eq!(ctx.get_reg(8), Some(0x81));
        assert_eq!(ctx.get_reg(13), Some(0xd1));
        assert_eq!(ctx.spsr(), Some(0xf1));

        ctx.cpsr = M_SVC;
        assert_eq!(ctx.get_reg(8), Some(0x80));
        assert_eq!(ctx.get_reg(13), Some(0xd3));
        assert_eq!(ctx.spsr(), Some(0xf3));
    }

    #[test]
    fn writes_land_in_selected_bank() {
        let mut ctx = context();
        ctx.cpsr = M_SVC;
        ctx.set_reg(13, 0x1234).unwrap();
        assert_eq!(ctx.r13_svc, 0x1234);
        assert_eq!(ctx.r13_usr, 0xd0);
    }

    #[test]
    fn unknown_register_number_is_rejected() {
        let mut ctx = context();
        assert_eq!(ctx.get_reg(17), None);
        assert_eq!(ctx.set_reg(25, 0), None);
    }
}

//! EJTAG TAP registers, dmseg/drseg memory maps, and the CP0 registers used
//! by the debug engine.

use bitfield::bitfield;

use crate::util::bits::{self, Bits};

// IR values (5 bits)

/// Implementation register.
pub fn ir_impcode() -> Bits {
    bits::from_int(0b00011, 5)
}
/// Address register.
pub fn ir_address() -> Bits {
    bits::from_int(0b01000, 5)
}
/// Data register.
pub fn ir_data() -> Bits {
    bits::from_int(0b01001, 5)
}
/// Control register.
pub fn ir_control() -> Bits {
    bits::from_int(0b01010, 5)
}
/// Address, data and control at once.
pub fn ir_all() -> Bits {
    bits::from_int(0b01011, 5)
}
/// Latches the EJTAGBOOT condition.
pub fn ir_ejtagboot() -> Bits {
    bits::from_int(0b01100, 5)
}
/// Latches the NORMALBOOT condition.
pub fn ir_normalboot() -> Bits {
    bits::from_int(0b01101, 5)
}
/// Fastdata channel.
pub fn ir_fastdata() -> Bits {
    bits::from_int(0b01110, 5)
}

bitfield! {
    /// IMPCODE register layout.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct Impcode(u32);
    impl Debug;

    bool;
    /// 64-bit (1) or 32-bit (0) processor.
    pub mips32_64, _: 0;

    u16;
    /// Implementation-specific type information.
    pub type_info, _: 10, 1;

    u8;
    /// Processor type.
    pub type_, _: 13, 11;

    bool;
    /// No DMA support.
    pub no_dma, _: 14;
    /// MIPS16 support.
    pub mips16, _: 16;

    u8;
    /// ASID field size.
    pub asid_size, _: 22, 21;

    bool;
    /// DINT signal supported.
    pub dint_sup, _: 24;
    /// R4k (0) or R3k (1) privileged environment.
    pub r4k_r3k, _: 28;

    u8;
    /// EJTAG version.
    pub ejtag_ver, _: 31, 29;
}

impl Impcode {
    /// Human-readable EJTAG version.
    pub fn version_name(&self) -> &'static str {
        match self.ejtag_ver() {
            0 => "1.x/2.0",
            1 => "2.5",
            2 => "2.6",
            3 => "3.1",
            4 => "4.0",
            5 => "5.0",
            _ => "unknown",
        }
    }
}

bitfield! {
    /// CONTROL register layout. Several fields are undocumented and specific
    /// to EJTAG 1.x/2.0 (DLock, Dsz, DRWn, DErr, DStrt, DMAAcc).
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct EjtagControl(u32);
    impl Debug;

    bool;
    /// The processor is in debug mode.
    pub dm, set_dm: 3;
    /// DMA lock (EJTAG 1.x/2.0).
    pub dlock, set_dlock: 5;

    u8;
    /// DMA transfer size (EJTAG 1.x/2.0).
    pub dsz, set_dsz: 8, 7;

    bool;
    /// DMA read (1) or write (0) (EJTAG 1.x/2.0).
    pub drwn, set_drwn: 9;
    /// DMA error (EJTAG 1.x/2.0).
    pub derr, set_derr: 10;
    /// DMA transfer start/busy (EJTAG 1.x/2.0).
    pub dstrt, set_dstrt: 11;
    /// Requests a debug interrupt.
    pub ejtagbrk, set_ejtagbrk: 12;
    /// Debug vector in probe memory.
    pub prob_trap, set_prob_trap: 14;
    /// Probe services dmseg accesses.
    pub prob_en, set_prob_en: 15;
    /// Processor reset.
    pub pr_rst, set_pr_rst: 16;
    /// DMA access mode (EJTAG 1.x/2.0).
    pub dmaacc, set_dmaacc: 17;
    /// Pending processor access.
    pub pracc, set_pracc: 18;
    /// Processor access is a write.
    pub prnw, set_prnw: 19;
    /// Peripheral reset.
    pub per_rst, set_per_rst: 20;
    /// Processor is halted.
    pub halt, set_halt: 21;
    /// Processor is in low-power mode.
    pub doze, set_doze: 22;

    u8;
    /// Processor access transfer size.
    pub psz, set_psz: 30, 29;

    bool;
    /// Reset occurred since last acknowledged.
    pub rocc, set_rocc: 31;
}

// dmseg/drseg addresses. These live in the upper segment of the virtual
// address space; on 32-bit targets the upper 32 address bits are truncated.

/// Base of the debug memory segment serviced by the probe.
pub const DMSEG_ADDR: u64 = 0xffff_ffff_ff20_0000;
/// Base of the debug register segment.
pub const DRSEG_ADDR: u64 = 0xffff_ffff_ff30_0000;
/// Mask covering the whole debug segment.
pub const DMSEG_MASK: u64 = 0xffff_ffff_ffe0_0000;

/// Offset of the code area inside dmseg (the debug exception vector).
pub const DMSEG_CODE_OFFSET: u64 = 0x0200;
/// Offset of the scratch area inside dmseg.
pub const DMSEG_TEMP_OFFSET: u64 = 0x1000;
/// Offset of the data area inside dmseg.
pub const DMSEG_DATA_OFFSET: u64 = 0x1200;

/// Debug control register inside drseg.
pub const DRSEG_DCR_ADDR: u64 = DRSEG_ADDR;

/// drseg register addresses, which moved between EJTAG 1.x/2.0 and 2.5+.
#[derive(Debug, Clone, Copy)]
pub struct DrsegLayout {
    v1: bool,
}

impl DrsegLayout {
    /// Selects the layout for the given EJTAG version field.
    pub fn new(ejtag_ver: u8) -> Self {
        DrsegLayout { v1: ejtag_ver == 0 }
    }

    /// Instruction breakpoint status register.
    pub fn ibs(&self) -> u64 {
        if self.v1 {
            DRSEG_ADDR + 0x0004
        } else {
            DRSEG_ADDR + 0x1000
        }
    }

    /// Instruction breakpoint address register `n`.
    pub fn iba(&self, n: usize) -> u64 {
        if self.v1 {
            DRSEG_ADDR + 0x0100 + 0x10 * n as u64
        } else {
            DRSEG_ADDR + 0x1100 + 0x100 * n as u64
        }
    }

    /// Instruction breakpoint address mask register `n`.
    pub fn ibm(&self, n: usize) -> u64 {
        if self.v1 {
            DRSEG_ADDR + 0x0108 + 0x10 * n as u64
        } else {
            DRSEG_ADDR + 0x1108 + 0x100 * n as u64
        }
    }

    /// Instruction breakpoint control register `n`.
    pub fn ibc(&self, n: usize) -> u64 {
        if self.v1 {
            DRSEG_ADDR + 0x0104 + 0x10 * n as u64
        } else {
            DRSEG_ADDR + 0x1118 + 0x100 * n as u64
        }
    }
}

bitfield! {
    /// drseg IBS register layout.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct DrsegIbs(u32);
    impl Debug;

    u16;
    /// Break status per breakpoint.
    pub bs, set_bs: 14, 0;

    u8;
    /// Number of instruction breakpoints.
    pub bcn, _: 27, 24;

    bool;
    /// ASID comparison supported.
    pub asid_sup, _: 30;
}

bitfield! {
    /// drseg IBC register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct DrsegIbc(u32);
    impl Debug;

    bool;
    /// Breakpoint enable.
    pub be, set_be: 0;
    /// Trigger enable.
    pub te, set_te: 2;
}

// Address space segments

/// User segment base.
pub const KUSEG_ADDR: u64 = 0x0000_0000_0000_0000;
/// Unmapped cached segment base.
pub const KSEG0_ADDR: u64 = 0xffff_ffff_8000_0000;
/// Unmapped uncached segment base.
pub const KSEG1_ADDR: u64 = 0xffff_ffff_a000_0000;
/// Mapped kernel segment base.
pub const KSEG2_ADDR: u64 = 0xffff_ffff_c000_0000;
/// Mapped kernel segment base.
pub const KSEG3_ADDR: u64 = 0xffff_ffff_e000_0000;
/// Mask selecting the segment of an address.
pub const KSEGX_MASK: u64 = 0xffff_ffff_e000_0000;

// CP0 register addresses as (register, select) pairs.

/// CP0 BadVAddr.
pub const CP0_BADVADDR: (u32, u32) = (8, 0);
/// CP0 Status.
pub const CP0_SR: (u32, u32) = (12, 0);
/// CP0 Cause.
pub const CP0_CAUSE: (u32, u32) = (13, 0);
/// CP0 Config.
pub const CP0_CONFIG: (u32, u32) = (16, 0);
/// CP0 Config1.
pub const CP0_CONFIG1: (u32, u32) = (16, 1);
/// CP0 Debug.
pub const CP0_DEBUG: (u32, u32) = (23, 0);
/// CP0 DEPC.
pub const CP0_DEPC: (u32, u32) = (24, 0);
/// CP0 DESAVE.
pub const CP0_DESAVE: (u32, u32) = (31, 0);

bitfield! {
    /// CP0 Config register layout.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct Cp0Config(u32);
    impl Debug;

    u8;
    /// KSEG0 cacheability.
    pub k0, _: 2, 0;
    /// MMU type.
    pub mt, _: 9, 7;
    /// Architecture release.
    pub ar, _: 12, 10;
    /// Architecture type.
    pub at, _: 14, 13;

    bool;
    /// Big endian.
    pub be, _: 15;

    u8;
    /// KUSEG cacheability (when no TLB is present).
    pub ku, _: 27, 25;
    /// KSEG2/KSEG3 cacheability (when no TLB is present).
    pub k23, _: 30, 28;

    bool;
    /// Config1 register present.
    pub m, _: 31;
}

/// Cacheability policy value meaning "uncached".
pub const CACHE_POLICY_UNCACHED: u8 = 2;

/// Human-readable cacheability policy names. Values 0 and 1 are not defined
/// by the MIPS reference but are consistent among vendors.
pub fn cache_policy_name(policy: u8) -> &'static str {
    match policy {
        0 => "write-through write-no-allocate",
        1 => "write-through write-allocate",
        2 => "uncached",
        3 => "write-back write-allocate",
        _ => "unknown",
    }
}

bitfield! {
    /// CP0 Config1 register layout.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct Cp0Config1(u32);
    impl Debug;

    bool;
    /// FPU present.
    pub fp, _: 0;

    u8;
    /// D-cache associativity.
    pub da, _: 9, 7;
    /// D-cache line size.
    pub dl, _: 12, 10;
    /// D-cache sets per way.
    pub ds, _: 15, 13;
    /// I-cache associativity.
    pub ia, _: 18, 16;
    /// I-cache line size.
    pub il, _: 21, 19;
    /// I-cache sets per way.
    pub is, _: 24, 22;

    u8;
    /// MMU size minus one.
    pub mmu_size_m1, _: 30, 25;

    bool;
    /// Config2 register present.
    pub m, _: 31;
}

bitfield! {
    /// CP0 Debug register layout.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct Cp0Debug(u32);
    impl Debug;

    bool;
    /// Debug single-step exception.
    pub dss, _: 0;
    /// Debug breakpoint exception.
    pub dbp, _: 1;
    /// Debug instruction break exception.
    pub dib, _: 4;
    /// Debug interrupt exception.
    pub dint, _: 5;
    /// Single-step enable.
    pub sst, set_sst: 8;
    /// Single-stepping not implemented.
    pub no_sst, _: 9;

    u8;
    /// Debug exception code.
    pub dexc_code, _: 14, 10;
    /// EJTAG version.
    pub ejtag_ver, _: 17, 15;

    bool;
    /// The processor is in debug mode.
    pub dm, _: 30;
    /// Debug exception occurred in a branch delay slot.
    pub dbd, _: 31;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_field_positions() {
        let mut control = EjtagControl(0);
        control.set_pracc(true);
        assert_eq!(control.0, 1 << 18);
        control.set_prob_en(true);
        control.set_prob_trap(true);
        assert_eq!(control.0, 1 << 18 | 1 << 15 | 1 << 14);
        assert!(!control.rocc());
        control.set_rocc(true);
        assert_eq!(control.0 & 0x8000_0000, 0x8000_0000);
    }

    #[test]
    fn impcode_decodes_version() {
        // EJTAGver=1 (2.5), MIPS32.
        let impcode = Impcode(1 << 29);
        assert_eq!(impcode.version_name(), "2.5");
        assert!(!impcode.mips32_64());
    }

    #[test]
    fn drseg_layouts_differ() {
        let v1 = DrsegLayout::new(0);
        let v25 = DrsegLayout::new(2);
        assert_eq!(v1.ibs(), DRSEG_ADDR + 0x0004);
        assert_eq!(v25.ibs(), DRSEG_ADDR + 0x1000);
        assert_eq!(v1.iba(1), DRSEG_ADDR + 0x0110);
        assert_eq!(v25.iba(1), DRSEG_ADDR + 0x1200);
    }
}

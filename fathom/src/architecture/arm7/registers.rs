//! EmbeddedICE register file of the ARM7TDMI debug macrocell, programmed via
//! JTAG scan chain 2.

use bitfield::bitfield;

/// EmbeddedICE register addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EiceReg {
    /// Debug control.
    DbgCtl = 0,
    /// Debug status.
    DbgSta = 1,
    /// Debug comms channel control.
    DccCtl = 4,
    /// Debug comms channel data.
    DccData = 5,
    /// Watchpoint 0 address value.
    W0AddrVal = 8,
    /// Watchpoint 0 address mask.
    W0AddrMsk = 9,
    /// Watchpoint 0 data value.
    W0DataVal = 10,
    /// Watchpoint 0 data mask.
    W0DataMsk = 11,
    /// Watchpoint 0 control value.
    W0CtrlVal = 12,
    /// Watchpoint 0 control mask.
    W0CtrlMsk = 13,
    /// Watchpoint 1 address value.
    W1AddrVal = 16,
    /// Watchpoint 1 address mask.
    W1AddrMsk = 17,
    /// Watchpoint 1 data value.
    W1DataVal = 18,
    /// Watchpoint 1 data mask.
    W1DataMsk = 19,
    /// Watchpoint 1 control value.
    W1CtrlVal = 20,
    /// Watchpoint 1 control mask.
    W1CtrlMsk = 21,
}

impl EiceReg {
    /// Address value register of watchpoint unit `unit`.
    pub fn wx_addr_val(unit: usize) -> EiceReg {
        [EiceReg::W0AddrVal, EiceReg::W1AddrVal][unit]
    }

    /// Address mask register of watchpoint unit `unit`.
    pub fn wx_addr_msk(unit: usize) -> EiceReg {
        [EiceReg::W0AddrMsk, EiceReg::W1AddrMsk][unit]
    }

    /// Data value register of watchpoint unit `unit`.
    pub fn wx_data_val(unit: usize) -> EiceReg {
        [EiceReg::W0DataVal, EiceReg::W1DataVal][unit]
    }

    /// Data mask register of watchpoint unit `unit`.
    pub fn wx_data_msk(unit: usize) -> EiceReg {
        [EiceReg::W0DataMsk, EiceReg::W1DataMsk][unit]
    }

    /// Control value register of watchpoint unit `unit`.
    pub fn wx_ctrl_val(unit: usize) -> EiceReg {
        [EiceReg::W0CtrlVal, EiceReg::W1CtrlVal][unit]
    }

    /// Control mask register of watchpoint unit `unit`.
    pub fn wx_ctrl_msk(unit: usize) -> EiceReg {
        [EiceReg::W0CtrlMsk, EiceReg::W1CtrlMsk][unit]
    }

    /// Whether this is one of the mask registers.
    ///
    /// In this debug macrocell a 1 bit in a mask means the corresponding value
    /// bit is don't-care, and 0 means it must match. This is inconvenient,
    /// especially for control values which are mostly don't-care; the driver
    /// inverts mask values on write so the API uses the natural convention.
    pub fn is_mask(self) -> bool {
        matches!(
            self,
            EiceReg::W0AddrMsk
                | EiceReg::W0DataMsk
                | EiceReg::W0CtrlMsk
                | EiceReg::W1AddrMsk
                | EiceReg::W1DataMsk
                | EiceReg::W1CtrlMsk
        )
    }
}

bitfield! {
    /// Debug control register.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct DbgCtl(u32);
    impl Debug;

    bool;
    /// Forces DBGACK high towards the rest of the system.
    pub dbgack, set_dbgack: 0;
    /// Requests debug entry. Broken on ARM7TDMI; do not use.
    pub dbgrq, set_dbgrq: 1;
    /// Disables interrupts while in debug state.
    pub intdis, set_intdis: 2;
    /// Selects monitor mode.
    pub monitor_en, set_monitor_en: 4;
    /// Disables the EmbeddedICE comparators.
    pub eice_dis, set_eice_dis: 5;
}

bitfield! {
    /// Debug status register.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct DbgSta(u32);
    impl Debug;

    bool;
    /// The core is in debug state.
    pub dbgack, set_dbgack: 0;
    /// DBGRQ as asserted externally to the core.
    pub dbgrq, set_dbgrq: 1;
    /// Instruction fetches are enabled.
    pub ifen, set_ifen: 2;
    /// TRANS[1]: together with DBGACK, signals memory access completion.
    pub trans1, set_trans1: 3;
    /// The core was executing Thumb code when it halted.
    pub tbit, set_tbit: 4;
}

bitfield! {
    /// Watchpoint unit control value/mask layout (9 bits).
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct WxCtrl(u32);
    impl Debug;

    bool;
    /// Match on writes (1) or reads (0).
    pub write, set_write: 0;

    u8;
    /// Match on access size; 0b01 halfword, 0b10 word.
    pub size, set_size: 2, 1;
    /// Match on access type; 0b00 selects opcode fetch.
    pub prot, set_prot: 4, 3;

    bool;
    /// Match on the DBGEXT input.
    pub dbgext, set_dbgext: 5;
    /// Chain with the other unit's output.
    pub chain, set_chain: 6;
    /// Invert the address/data comparison of the other unit.
    pub range, set_range: 7;
    /// Enables breakpoint generation.
    pub enable, set_enable: 8;
}

/// PSR mode field: User.
pub const M_USR: u32 = 0b10000;
/// PSR mode field: FIQ.
pub const M_FIQ: u32 = 0b10001;
/// PSR mode field: IRQ.
pub const M_IRQ: u32 = 0b10010;
/// PSR mode field: Supervisor.
pub const M_SVC: u32 = 0b10011;
/// PSR mode field: Abort.
pub const M_ABT: u32 = 0b10111;
/// PSR mode field: Undefined.
pub const M_UND: u32 = 0b11011;
/// PSR mode field: System.
pub const M_SYS: u32 = 0b11111;

/// The Thumb state bit of the CPSR.
pub const PSR_T: u32 = 1 << 5;

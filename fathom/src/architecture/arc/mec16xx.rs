//! Microchip MEC16xx embedded Flash and EEPROM controller, driven over the
//! ARC JTAG debug interface.

use bitfield::bitfield;

use super::{ArcDebug, ArcError, ArcSpace};
use crate::jtag::JtagError;
use crate::util::bits;

/// Maximum embedded Flash size across the family (MEC1663).
pub const FLASH_SIZE_MAX: usize = 0x40_000;
/// Size of the embedded EEPROM.
pub const EEPROM_SIZE: usize = 2048;

bitfield! {
    /// Reset/test DR layout, reached through the RESET_TEST instruction.
    ///
    /// None of the vendor documents coherently point to a single DR with the
    /// mass erase bit or specify its location; this layout is known to work.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct DrResetTest(u32);
    impl Debug;

    bool;
    /// Mass erase.
    pub me, set_me: 0;
    /// VCC power-on reset.
    pub vcc_por, set_vcc_por: 1;
    /// VTR power-on reset.
    pub vtr_por, set_vtr_por: 2;
    /// Power-on reset enable.
    pub por_en, set_por_en: 3;
    /// Gang programming enable.
    pub gang_en, set_gang_en: 31;
}

/// Base of the Flash controller register block.
pub const FLASH_BASE_ADDR: u32 = 0xff_3800;

/// Flash data register.
pub const FLASH_DATA_ADDR: u32 = FLASH_BASE_ADDR + 0x100;
/// Flash address register.
pub const FLASH_ADDRESS_ADDR: u32 = FLASH_BASE_ADDR + 0x104;
/// Flash command register.
pub const FLASH_COMMAND_ADDR: u32 = FLASH_BASE_ADDR + 0x108;
/// Flash status register.
pub const FLASH_STATUS_ADDR: u32 = FLASH_BASE_ADDR + 0x10c;
/// Flash configuration register.
pub const FLASH_CONFIG_ADDR: u32 = FLASH_BASE_ADDR + 0x110;
/// Flash initialization register.
pub const FLASH_INIT_ADDR: u32 = FLASH_BASE_ADDR + 0x114;

/// Flash controller mode: no operation in progress.
pub const FLASH_MODE_STANDBY: u8 = 0;
/// Flash controller mode: read.
pub const FLASH_MODE_READ: u8 = 1;
/// Flash controller mode: program.
pub const FLASH_MODE_PROGRAM: u8 = 2;
/// Flash controller mode: erase.
pub const FLASH_MODE_ERASE: u8 = 3;

/// Flash address value selecting a whole-array erase.
pub const FLASH_ERASE_ALL_ADDR: u32 = 0b11111 << 19;
/// EEPROM address value selecting a whole-array erase.
pub const EEPROM_ERASE_ALL_ADDR: u32 = 0b11111 << 11;

bitfield! {
    /// Flash command register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct FlashCommand(u32);
    impl Debug;

    u8;
    /// Operating mode.
    pub flash_mode, set_flash_mode: 1, 0;

    bool;
    /// Burst mode: the address auto-increments on each data access.
    pub burst, set_burst: 2;
    /// EC interrupt on completion.
    pub ec_int, set_ec_int: 3;
    /// Register control: the controller obeys this register block instead of
    /// the host CPU.
    pub reg_ctl, set_reg_ctl: 8;
}

bitfield! {
    /// Flash status register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct FlashStatus(u32);
    impl Debug;

    bool;
    /// An operation is in progress.
    pub busy, set_busy: 0;
    /// The data register holds unconsumed data.
    pub data_full, set_data_full: 1;
    /// The address register holds an unconsumed address.
    pub address_full, set_address_full: 2;
    /// Boot block locked.
    pub boot_lock, set_boot_lock: 3;
    /// Boot block protected.
    pub boot_block, set_boot_block: 5;
    /// Data block protected.
    pub data_block, set_data_block: 6;
    /// EEPROM block protected.
    pub eeprom_block, set_eeprom_block: 7;
    /// A command was issued while busy.
    pub busy_err, set_busy_err: 8;
    /// An invalid command was issued.
    pub cmd_err, set_cmd_err: 9;
    /// A protected region was accessed.
    pub protect_err, set_protect_err: 10;
}

bitfield! {
    /// Flash configuration register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct FlashConfig(u32);
    impl Debug;

    bool;
    /// Enables access to the Reg_Ctl bit.
    pub reg_ctl_en, set_reg_ctl_en: 0;
    /// Host control of the flash controller.
    pub host_ctl, set_host_ctl: 1;
    /// Boot block lock.
    pub boot_lock, set_boot_lock: 2;
    /// Boot block protection enable.
    pub boot_protect_en, set_boot_protect_en: 3;
    /// Data block protection.
    pub data_protect, set_data_protect: 4;
    /// Inhibits JTAG access to the flash.
    pub inhibit_jtag, set_inhibit_jtag: 5;
    /// EEPROM access enable.
    pub eeprom_access, set_eeprom_access: 8;
    /// EEPROM protection.
    pub eeprom_protect, set_eeprom_protect: 9;
    /// Forces the EEPROM block protection.
    pub eeprom_force_block, set_eeprom_force_block: 10;
}

/// Base of the EEPROM controller register block.
///
/// The EEPROM controller mirrors the Flash controller register layout with
/// its own block; the offsets below were established by observation.
pub const EEPROM_BASE_ADDR: u32 = 0xff_3a00;

/// EEPROM data register.
pub const EEPROM_DATA_ADDR: u32 = EEPROM_BASE_ADDR + 0x00;
/// EEPROM address register.
pub const EEPROM_ADDRESS_ADDR: u32 = EEPROM_BASE_ADDR + 0x04;
/// EEPROM command register.
pub const EEPROM_COMMAND_ADDR: u32 = EEPROM_BASE_ADDR + 0x08;
/// EEPROM status register.
pub const EEPROM_STATUS_ADDR: u32 = EEPROM_BASE_ADDR + 0x0c;
/// EEPROM unlock register; accepts a 31-bit password.
pub const EEPROM_UNLOCK_ADDR: u32 = EEPROM_BASE_ADDR + 0x20;

bitfield! {
    /// EEPROM command register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct EepromCommand(u32);
    impl Debug;

    u8;
    /// Operating mode; same encoding as the Flash controller.
    pub eeprom_mode, set_eeprom_mode: 1, 0;

    bool;
    /// Burst mode.
    pub burst, set_burst: 2;
}

bitfield! {
    /// EEPROM status register layout.
    #[derive(Copy, Clone, Eq, PartialEq, Default)]
    pub struct EepromStatus(u32);
    impl Debug;

    bool;
    /// An operation is in progress.
    pub busy, set_busy: 0;
    /// The data register holds unconsumed data.
    pub data_full, set_data_full: 1;
    /// The EEPROM is blocked and must be unlocked with a password.
    pub eeprom_block, set_eeprom_block: 7;
    /// A command was issued while busy.
    pub busy_err, set_busy_err: 8;
    /// An invalid command was issued.
    pub cmd_err, set_cmd_err: 9;
}

/// Errors produced by the MEC16xx programmer.
#[derive(Debug, thiserror::Error)]
pub enum Mec16xxError {
    /// The IDCODE does not belong to a supported device.
    #[error("cannot operate on unknown device with IDCODE={idcode:08x}")]
    UnknownDevice {
        /// The unrecognized IDCODE.
        idcode: u32,
    },

    /// A Flash controller command failed with a sticky error.
    #[error("{message} with status {status:?}")]
    FlashCommandFailed {
        /// Description of the failed command.
        message: String,
        /// The status register at the time of failure.
        status: FlashStatus,
    },

    /// The Flash controller stayed busy past the poll budget.
    #[error("Flash controller timed out")]
    FlashTimeout,

    /// Three reads of the same Flash word returned three different values.
    #[error("cannot select a read by majority at {address:#07x}")]
    ReadGlitchUnresolved {
        /// The address of the glitching word.
        address: u32,
    },

    /// An EEPROM controller command failed with a sticky error.
    #[error("{message} with status {status:?}")]
    EepromCommandFailed {
        /// Description of the failed command.
        message: String,
        /// The status register at the time of failure.
        status: EepromStatus,
    },

    /// The EEPROM controller stayed busy past the poll budget.
    #[error("EEPROM controller timed out")]
    EepromTimeout,

    /// The EEPROM is blocked and no EEPROM operations are possible.
    #[error("EEPROM is blocked, no EEPROM operations are possible")]
    EepromBlocked,

    /// The unlock password was not accepted.
    #[error("EEPROM wasn't unlocked")]
    EepromUnlockFailed,

    /// The underlying ARC interface failed.
    #[error(transparent)]
    Arc(#[from] ArcError),

    /// The underlying TAP controller failed.
    #[error(transparent)]
    Jtag(#[from] JtagError),
}

const BUSY_RETRIES: usize = 64;

/// MEC16xx Flash/EEPROM programmer.
pub struct Mec16xx {
    arc: ArcDebug,
}

impl Mec16xx {
    /// Attaches to a MEC16xx target: verifies the IDCODE and halts the CPU so
    /// the controllers can be driven from JTAG.
    pub fn new(mut arc: ArcDebug) -> Result<Self, Mec16xxError> {
        let idcode = arc.identify()?;
        if !idcode.valid() {
            return Err(Mec16xxError::UnknownDevice {
                idcode: idcode.raw(),
            });
        }
        tracing::debug!("halting CPU");
        arc.set_halted(true)?;
        Ok(Mec16xx { arc })
    }

    fn read_reg(&mut self, address: u32) -> Result<u32, Mec16xxError> {
        Ok(self.arc.read(address, ArcSpace::Memory)?)
    }

    fn write_reg(&mut self, address: u32, value: u32) -> Result<(), Mec16xxError> {
        Ok(self.arc.write(address, value, ArcSpace::Memory)?)
    }

    /// Reads firmware through the regular memory map (requires an unlocked
    /// part, but no controller involvement).
    pub fn read_firmware_mapped(&mut self, size: usize) -> Result<Vec<u32>, Mec16xxError> {
        let mut words = Vec::with_capacity(size.div_ceil(4));
        for offset in (0..size).step_by(4) {
            tracing::trace!("read firmware mapped offset={offset:05x}");
            words.push(self.read_reg(offset as u32)?);
        }
        Ok(words)
    }

    /// Erases both Flash and EEPROM using the undocumented RESET_TEST JTAG
    /// sequence, which may work even when boot code is corrupted.
    pub fn emergency_flash_erase(&mut self) -> Result<(), Mec16xxError> {
        let tap = self.arc.tap_mut();
        tap.write_ir(&super::registers::ir_reset_test())?;
        let mut dr_reset_test = DrResetTest::default();
        dr_reset_test.set_por_en(true);
        tap.write_dr(&bits::from_int(dr_reset_test.0 as u64, 32))?;
        dr_reset_test.set_vtr_por(true);
        tap.write_dr(&bits::from_int(dr_reset_test.0 as u64, 32))?;
        dr_reset_test.set_me(true);
        tap.write_dr(&bits::from_int(dr_reset_test.0 as u64, 32))?;
        dr_reset_test.set_vtr_por(false);
        tap.write_dr(&bits::from_int(dr_reset_test.0 as u64, 32))?;
        tracing::warn!(
            "after running emergency mass erase, a power cycle may be required on some chips"
        );
        Ok(())
    }

    /// Enables or disables access to the Reg_Ctl bit of the Flash controller.
    pub fn enable_flash_access(&mut self, enabled: bool) -> Result<(), Mec16xxError> {
        let mut flash_config = FlashConfig::default();
        flash_config.set_reg_ctl_en(enabled);
        tracing::debug!("write Flash_Config {flash_config:?}");
        self.write_reg(FLASH_CONFIG_ADDR, flash_config.0)
    }

    /// Takes register control of the Flash controller, brings it to standby
    /// (it refuses commands otherwise), and clears sticky error status.
    fn flash_clean_start(&mut self) -> Result<(), Mec16xxError> {
        let mut flash_command = FlashCommand::default();
        flash_command.set_reg_ctl(true);
        flash_command.set_flash_mode(FLASH_MODE_STANDBY);
        tracing::debug!("write Flash_Command {flash_command:?}");
        self.write_reg(FLASH_COMMAND_ADDR, flash_command.0)?;

        let mut clear_status = FlashStatus::default();
        clear_status.set_busy_err(true);
        clear_status.set_cmd_err(true);
        clear_status.set_protect_err(true);
        tracing::debug!("clear Flash_Status {clear_status:?}");
        self.write_reg(FLASH_STATUS_ADDR, clear_status.0)
    }

    fn flash_wait_for_not_busy(&mut self, fail_message: &str) -> Result<(), Mec16xxError> {
        for _ in 0..BUSY_RETRIES {
            let status = FlashStatus(self.read_reg(FLASH_STATUS_ADDR)?);
            tracing::trace!("read Flash_Status {status:?}");
            if status.busy_err() || status.cmd_err() || status.protect_err() {
                return Err(Mec16xxError::FlashCommandFailed {
                    message: fail_message.to_owned(),
                    status,
                });
            }
            if !status.busy() {
                return Ok(());
            }
        }
        Err(Mec16xxError::FlashTimeout)
    }

    fn flash_command(&mut self, mode: u8, address: u32, burst: bool) -> Result<(), Mec16xxError> {
        let mut flash_command = FlashCommand::default();
        flash_command.set_reg_ctl(true);
        flash_command.set_flash_mode(mode);
        flash_command.set_burst(burst);
        tracing::debug!("write Flash_Command {flash_command:?}");
        self.write_reg(FLASH_COMMAND_ADDR, flash_command.0)?;

        if mode != FLASH_MODE_STANDBY {
            tracing::debug!("write Flash_Address={address:08x}");
            self.write_reg(FLASH_ADDRESS_ADDR, address)?;
        }

        self.flash_wait_for_not_busy(&format!("Flash command {flash_command:?} failed"))
    }

    /// Reads `count` words of Flash starting at byte address `address`.
    ///
    /// Every word is read twice and compared; on a mismatch a third read
    /// decides by majority. The debug interface does not wait for the Flash
    /// to acknowledge reads, so single reads sometimes return silent zeroes.
    pub fn read_flash(&mut self, address: u32, count: usize) -> Result<Vec<u32>, Mec16xxError> {
        self.flash_clean_start()?;
        let mut words = Vec::with_capacity(count);
        for offset in 0..count as u32 {
            let word_address = address + offset * 4;
            self.flash_command(FLASH_MODE_READ, word_address, false)?;
            let data_1 = self.read_reg(FLASH_DATA_ADDR)?;

            self.write_reg(FLASH_ADDRESS_ADDR, word_address)?;
            let data_2 = self.read_reg(FLASH_DATA_ADDR)?;

            let data = if data_1 == data_2 {
                data_1
            } else {
                // Third time's the charm.
                self.write_reg(FLASH_ADDRESS_ADDR, word_address)?;
                let data_3 = self.read_reg(FLASH_DATA_ADDR)?;
                tracing::warn!(
                    "read glitch Flash_Address={word_address:05x} \
                     Flash_Data={data_1:08x}/{data_2:08x}/{data_3:08x}"
                );
                if data_2 == data_3 {
                    data_2
                } else if data_1 == data_3 {
                    data_1
                } else {
                    return Err(Mec16xxError::ReadGlitchUnresolved {
                        address: word_address,
                    });
                }
            };
            words.push(data);
        }
        self.flash_command(FLASH_MODE_STANDBY, 0, false)?;
        Ok(words)
    }

    /// Erases a page of Flash, or the whole array with
    /// [`FLASH_ERASE_ALL_ADDR`].
    pub fn erase_flash(&mut self, address: u32) -> Result<(), Mec16xxError> {
        self.flash_clean_start()?;
        self.flash_command(FLASH_MODE_ERASE, address, false)?;
        self.flash_command(FLASH_MODE_STANDBY, 0, false)
    }

    /// Programs `words` starting at byte address `address` using burst mode.
    pub fn program_flash(&mut self, address: u32, words: &[u32]) -> Result<(), Mec16xxError> {
        self.flash_clean_start()?;
        self.flash_command(FLASH_MODE_PROGRAM, address, true)?;
        for (offset, &data) in words.iter().enumerate() {
            self.write_reg(FLASH_DATA_ADDR, data)?;
            tracing::trace!(
                "program Flash_Address={:05x} Flash_Data={data:08x}",
                address + offset as u32 * 4
            );
        }
        self.flash_wait_for_not_busy("Flash program failed")?;
        self.flash_command(FLASH_MODE_STANDBY, 0, false)
    }

    // EEPROM

    /// Whether the EEPROM is password-blocked.
    pub fn is_eeprom_blocked(&mut self) -> Result<bool, Mec16xxError> {
        let status = EepromStatus(self.read_reg(EEPROM_STATUS_ADDR)?);
        Ok(status.eeprom_block())
    }

    fn eeprom_clean_start(&mut self) -> Result<(), Mec16xxError> {
        if self.is_eeprom_blocked()? {
            return Err(Mec16xxError::EepromBlocked);
        }
        let mut eeprom_command = EepromCommand::default();
        eeprom_command.set_eeprom_mode(FLASH_MODE_STANDBY);
        tracing::debug!("write EEPROM_Command {eeprom_command:?}");
        self.write_reg(EEPROM_COMMAND_ADDR, eeprom_command.0)?;

        let mut clear_status = EepromStatus::default();
        clear_status.set_busy_err(true);
        clear_status.set_cmd_err(true);
        tracing::debug!("clear EEPROM_Status {clear_status:?}");
        self.write_reg(EEPROM_STATUS_ADDR, clear_status.0)
    }

    fn eeprom_wait_for_not_busy(&mut self, fail_message: &str) -> Result<(), Mec16xxError> {
        for _ in 0..BUSY_RETRIES {
            let status = EepromStatus(self.read_reg(EEPROM_STATUS_ADDR)?);
            tracing::trace!("read EEPROM_Status {status:?}");
            if status.busy_err() || status.cmd_err() {
                return Err(Mec16xxError::EepromCommandFailed {
                    message: fail_message.to_owned(),
                    status,
                });
            }
            if !status.busy() {
                return Ok(());
            }
        }
        Err(Mec16xxError::EepromTimeout)
    }

    fn eeprom_wait_for_data_not_full(&mut self) -> Result<(), Mec16xxError> {
        for _ in 0..BUSY_RETRIES {
            let status = EepromStatus(self.read_reg(EEPROM_STATUS_ADDR)?);
            tracing::trace!("read EEPROM_Status {status:?}");
            if status.busy_err() || status.cmd_err() {
                return Err(Mec16xxError::EepromCommandFailed {
                    message: "EEPROM data backpressure failed".to_owned(),
                    status,
                });
            }
            if !status.data_full() {
                return Ok(());
            }
        }
        Err(Mec16xxError::EepromTimeout)
    }

    fn eeprom_command(&mut self, mode: u8, address: u32, burst: bool) -> Result<(), Mec16xxError> {
        let mut eeprom_command = EepromCommand::default();
        eeprom_command.set_eeprom_mode(mode);
        eeprom_command.set_burst(burst);
        tracing::debug!("write EEPROM_Command {eeprom_command:?}");
        self.write_reg(EEPROM_COMMAND_ADDR, eeprom_command.0)?;

        if mode != FLASH_MODE_STANDBY {
            tracing::debug!("write EEPROM_Address={address:08x}");
            self.write_reg(EEPROM_ADDRESS_ADDR, address)?;
        }

        self.eeprom_wait_for_not_busy(&format!("EEPROM command {eeprom_command:?} failed"))
    }

    /// Reads `count` bytes of EEPROM starting at byte address `address`.
    pub fn read_eeprom(&mut self, address: u32, count: usize) -> Result<Vec<u8>, Mec16xxError> {
        self.eeprom_clean_start()?;
        self.eeprom_command(FLASH_MODE_READ, address, true)?;
        let mut data = Vec::with_capacity(count);
        for offset in 0..count as u32 {
            let byte = self.read_reg(EEPROM_DATA_ADDR)?;
            tracing::trace!("read EEPROM_Address={:05x} EEPROM_Data={byte:02x}", address + offset);
            data.push(byte as u8);
        }
        self.eeprom_command(FLASH_MODE_STANDBY, 0, false)?;
        Ok(data)
    }

    /// Erases an 8-byte EEPROM page, or the whole array with
    /// [`EEPROM_ERASE_ALL_ADDR`].
    pub fn erase_eeprom(&mut self, address: u32) -> Result<(), Mec16xxError> {
        self.eeprom_clean_start()?;
        self.eeprom_command(FLASH_MODE_ERASE, address, false)?;
        self.eeprom_command(FLASH_MODE_STANDBY, 0, false)
    }

    /// Programs `data` starting at byte address `address`. The area must
    /// already be erased. `Data_Full` is polled before every byte; whether
    /// the controller requires that or only signals it on overrun is
    /// ambiguous in the datasheet, so the conservative reading is used.
    pub fn program_eeprom(&mut self, address: u32, data: &[u8]) -> Result<(), Mec16xxError> {
        self.eeprom_clean_start()?;
        self.eeprom_command(FLASH_MODE_PROGRAM, address, true)?;
        for (offset, &byte) in data.iter().enumerate() {
            self.eeprom_wait_for_data_not_full()?;
            self.write_reg(EEPROM_DATA_ADDR, byte as u32)?;
            tracing::trace!(
                "program EEPROM_Address={:05x} EEPROM_Data={byte:02x}",
                address + offset as u32
            );
        }
        self.eeprom_wait_for_not_busy("EEPROM program failed")?;
        self.eeprom_command(FLASH_MODE_STANDBY, 0, false)
    }

    /// Attempts to unlock a blocked EEPROM with a 31-bit password.
    pub fn unlock_eeprom(&mut self, password: u32) -> Result<(), Mec16xxError> {
        assert!(password >> 31 == 0);
        if !self.is_eeprom_blocked()? {
            tracing::warn!("EEPROM is not blocked, there is nothing to unlock");
            return Ok(());
        }
        self.write_reg(EEPROM_UNLOCK_ADDR, password)?;
        if self.is_eeprom_blocked()? {
            return Err(Mec16xxError::EepromUnlockFailed);
        }
        tracing::info!("EEPROM has been successfully unlocked");
        Ok(())
    }
}

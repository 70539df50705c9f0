//! ARC JTAG debug interface.
//!
//! The ARC JTAG TAP initiates read/write transactions on entry to
//! Run-Test/Idle: the access defined by the address, data and command
//! registers occurs once when that state is entered. The driver therefore
//! loads the transaction registers, pulses TCK once in Run-Test/Idle, and
//! polls the status register for completion.

pub mod mec16xx;
pub mod registers;

pub use mec16xx::{Mec16xx, Mec16xxError};

use crate::jtag::{IdCode, JtagError, TapInterface};
use crate::util::bits;

use registers::{AuxStatus32, DrStatus, AUX_STATUS32};

/// Address space of an ARC transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcSpace {
    /// System memory.
    Memory,
    /// Core registers.
    Core,
    /// Auxiliary registers.
    Aux,
}

/// Errors produced by the ARC debug interface.
#[derive(Debug, thiserror::Error)]
pub enum ArcError {
    /// A transaction reported the FL (failure) flag.
    #[error("transaction failed: {status:?}")]
    TransactionFailed {
        /// The failing status register value.
        status: DrStatus,
    },

    /// A transaction never reported RD within the poll budget.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The underlying TAP controller failed.
    #[error(transparent)]
    Jtag(#[from] JtagError),
}

const STATUS_RETRIES: usize = 64;

/// ARC JTAG debug interface over a selected TAP.
pub struct ArcDebug {
    tap: TapInterface,
}

impl ArcDebug {
    /// Wraps a selected TAP exposing the ARC JTAG protocol.
    pub fn new(tap: TapInterface) -> Self {
        ArcDebug { tap }
    }

    /// Direct access to the TAP, for device-specific registers that bypass
    /// the transaction interface.
    pub fn tap_mut(&mut self) -> &mut TapInterface {
        &mut self.tap
    }

    /// Resets the TAP and reads the IDCODE.
    pub fn identify(&mut self) -> Result<IdCode, ArcError> {
        self.tap.test_reset()?;
        let idcode_bits = self.tap.read_dr(32)?;
        let idcode = IdCode(bits::to_int(&idcode_bits) as u32);
        tracing::debug!("read IDCODE {idcode}");
        Ok(idcode)
    }

    fn wait_txn(&mut self) -> Result<(), ArcError> {
        self.tap.write_ir(&registers::ir_status())?;
        for _ in 0..STATUS_RETRIES {
            let status_bits = self.tap.read_dr(4)?;
            let status = DrStatus(bits::to_int(&status_bits) as u8);
            tracing::trace!("status {status:?}");
            if status.fl() {
                return Err(ArcError::TransactionFailed { status });
            }
            if status.rd() {
                return Ok(());
            }
        }
        Err(ArcError::TransactionTimeout)
    }

    /// Reads a word from the given address space.
    pub fn read(&mut self, address: u32, space: ArcSpace) -> Result<u32, ArcError> {
        let command = match space {
            ArcSpace::Memory => registers::TXN_READ_MEMORY,
            ArcSpace::Core => registers::TXN_READ_CORE,
            ArcSpace::Aux => registers::TXN_READ_AUX,
        };
        tracing::trace!("read {space:?} address={address:08x}");
        self.tap.write_ir(&registers::ir_address())?;
        self.tap.write_dr(&bits::from_int(address as u64, 32))?;
        self.tap.write_ir(&registers::ir_txn_command())?;
        self.tap.write_dr(&bits::from_int(command as u64, 4))?;
        self.tap.run_test_idle(1)?;
        self.wait_txn()?;
        self.tap.write_ir(&registers::ir_data())?;
        let data_bits = self.tap.read_dr(32)?;
        let data = bits::to_int(&data_bits) as u32;
        tracing::trace!("read data={data:08x}");
        Ok(data)
    }

    /// Writes a word into the given address space.
    pub fn write(&mut self, address: u32, data: u32, space: ArcSpace) -> Result<(), ArcError> {
        let command = match space {
            ArcSpace::Memory => registers::TXN_WRITE_MEMORY,
            ArcSpace::Core => registers::TXN_WRITE_CORE,
            ArcSpace::Aux => registers::TXN_WRITE_AUX,
        };
        tracing::trace!("write {space:?} address={address:08x} data={data:08x}");
        self.tap.write_ir(&registers::ir_address())?;
        self.tap.write_dr(&bits::from_int(address as u64, 32))?;
        self.tap.write_ir(&registers::ir_data())?;
        self.tap.write_dr(&bits::from_int(data as u64, 32))?;
        self.tap.write_ir(&registers::ir_txn_command())?;
        self.tap.write_dr(&bits::from_int(command as u64, 4))?;
        self.tap.run_test_idle(1)?;
        self.wait_txn()
    }

    /// Halts or resumes the core via STATUS32.H.
    pub fn set_halted(&mut self, halted: bool) -> Result<(), ArcError> {
        let mut status = AuxStatus32::default();
        status.set_h(halted);
        self.write(AUX_STATUS32, status.0, ArcSpace::Aux)
    }
}

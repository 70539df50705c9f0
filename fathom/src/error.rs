use crate::architecture::arc::{ArcError, Mec16xxError};
use crate::architecture::arm7::Arm7Error;
use crate::architecture::mips::EjtagError;
use crate::flashing::{SfdpError, Spi25Error};
use crate::gdb_server::GdbServerError;
use crate::jtag::{JtagError, ScanChainError};
use crate::probe::TransportError;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error in the probe transport occurred.
    #[error("A probe transport error occurred")]
    Transport(#[from] TransportError),
    /// An error in the JTAG TAP controller occurred.
    #[error("A JTAG probe error occurred")]
    Jtag(#[from] JtagError),
    /// The scan chain could not be interrogated.
    #[error("A scan chain interrogation error occurred")]
    ScanChain(#[from] ScanChainError),
    /// An ARM7TDMI specific error occurred.
    #[error("An ARM7TDMI debug error occurred")]
    Arm7(#[from] Arm7Error),
    /// A MIPS EJTAG specific error occurred.
    #[error("A MIPS EJTAG debug error occurred")]
    Ejtag(#[from] EjtagError),
    /// An ARC JTAG specific error occurred.
    #[error("An ARC debug error occurred")]
    Arc(#[from] ArcError),
    /// A MEC16xx programming error occurred.
    #[error("A MEC16xx programming error occurred")]
    Mec16xx(#[from] Mec16xxError),
    /// A 25-series flash error occurred.
    #[error("A 25-series flash error occurred")]
    Spi25(#[from] Spi25Error),
    /// The SFDP data could not be parsed.
    #[error("An SFDP parsing error occurred")]
    Sfdp(#[from] SfdpError),
    /// A GDB remote protocol error occurred.
    #[error("A GDB server error occurred")]
    GdbServer(#[from] GdbServerError),
    /// The requested operation is not implemented.
    #[error("Operation not implemented: {0}")]
    NotImplemented(&'static str),
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error indicates that the probe pipe can no longer be trusted
    /// to be synchronized, and the current session has to be abandoned.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

//! Probe transport and sequencer protocol clients.
//!
//! The probe hardware exposes one byte-level command/response pipe per applet.
//! [`BytePipe`] is the transport abstraction; [`sequencer::Sequencer`] and
//! [`qspi::QspiController`] are clients for the JTAG and QSPI sequencer
//! protocols spoken over such pipes.

#[cfg(any(test, feature = "test"))]
pub mod fake;
mod pipe;
pub mod qspi;
pub mod sequencer;

pub use pipe::{BytePipe, NetPipe, TransportError};

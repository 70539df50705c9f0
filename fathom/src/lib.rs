//! Host-side debug and programming toolkit for FPGA-based multi-protocol probes.
//!
//! The probe exposes byte-level command/response pipes (sequencers) over USB or
//! a network endpoint; this crate drives those pipes to implement high-level
//! protocol and target semantics:
//!
//! * a JTAG TAP controller with scan chain interrogation and per-TAP handles
//!   ([`jtag`]);
//! * debug engines for ARM7TDMI (EmbeddedICE), MIPS (EJTAG) and ARC targets
//!   ([`architecture`]);
//! * a 25-series SPI flash driver with SFDP discovery ([`flashing`]);
//! * a GDB remote serial protocol server ([`gdb_server`]).
//!
//! Building and loading the probe gateware is out of scope; the probe must
//! already be running a bitstream exposing the matching sequencer on the pipe.

pub mod architecture;
mod error;
pub mod flashing;
pub mod gdb_server;
pub mod jtag;
pub mod probe;
pub mod util;

pub use crate::error::Error;

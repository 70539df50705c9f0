//! IEEE 1149.1 JTAG TAP controller, scan chain interrogation, and per-TAP
//! handles for multi-device chains.

mod chain;
mod controller;
mod state;

pub use chain::{interrogate_dr, interrogate_ir, IdCode, ScanChainError, TapInterface};
pub use controller::{JtagError, TapController};
pub use state::TapState;

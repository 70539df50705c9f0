//! Debug engines for the supported target architectures.

pub mod arc;
pub mod arm7;
pub mod mips;

//! Scan chain interrogation and per-TAP access to multi-device chains.

use bitfield::bitfield;
use bitvec::prelude::*;

use super::controller::{JtagError, TapController};
use crate::util::bits::{self, Bits};
use crate::Error;

bitfield! {
    /// A JTAG IDCODE.
    /// Identifies a particular test access port (TAP) on the JTAG scan chain.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct IdCode(u32);
    impl Debug;

    u8;
    /// The IDCODE version.
    pub version, set_version: 31, 28;

    u16;
    /// The part number.
    pub part_number, set_part_number: 27, 12;

    /// The JEDEC JEP-106 Manufacturer ID.
    pub manufacturer, set_manufacturer: 11, 1;

    u8;
    /// The continuation code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_continuation, set_manufacturer_continuation: 11, 8;

    /// The identity code of the JEDEC JEP-106 Manufacturer ID.
    pub manufacturer_identity, set_manufacturer_identity: 7, 1;

    bool;
    /// The least-significant bit. Always set.
    pub lsbit, set_lsbit: 0;
}

impl std::fmt::Display for IdCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(mfn) = self.manufacturer_name() {
            write!(f, "0x{:08X} ({})", self.0, mfn)
        } else {
            write!(f, "0x{:08X}", self.0)
        }
    }
}

impl IdCode {
    /// The raw 32-bit IDCODE value.
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// Returns `false` iff the 11-bit manufacturer field holds the reserved
    /// invalid pattern.
    pub fn valid(&self) -> bool {
        self.manufacturer() != 0b0000_1111111
    }

    /// Return the manufacturer name, if available.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let cc = self.manufacturer_continuation();
        let id = self.manufacturer_identity();
        jep106::JEP106Code::new(cc, id).get()
    }
}

/// Errors produced while interrogating a scan chain captured after a test
/// logic reset.
#[derive(Debug, thiserror::Error)]
pub enum ScanChainError {
    /// A DR IDCODE started with fewer than 32 bits remaining in the capture.
    #[error("TAP #{tap} has truncated DR IDCODE <{capture}>")]
    TruncatedIdCode {
        /// Index of the TAP whose IDCODE is cut short.
        tap: usize,
        /// The remaining capture bits, first bit leftmost.
        capture: String,
    },

    /// A DR IDCODE carries the reserved invalid manufacturer pattern.
    #[error("TAP #{tap} has invalid DR IDCODE={idcode:08x}")]
    InvalidIdCode {
        /// Index of the TAP with the bad IDCODE.
        tap: usize,
        /// The offending IDCODE value.
        idcode: u32,
    },

    /// The IR capture has fewer `<10>` start patterns than TAPs.
    #[error("IR capture has fewer <10> transitions than TAPs")]
    TooFewIrStarts,

    /// The IR capture does not begin with the mandatory `<10>` pattern.
    #[error("IR capture does not start with <10> transition")]
    MalformedIrStart,

    /// The number of explicitly given IR lengths differs from the TAP count.
    #[error("IR length count differs from TAP count")]
    IrLengthCountMismatch,

    /// The sum of explicitly given IR lengths differs from the capture length.
    #[error("IR capture length differs from sum of IR lengths")]
    IrLengthSumMismatch,

    /// An explicitly given IR length does not line up with a `<10>` pattern.
    #[error("IR length for TAP #{tap} misaligns next TAP")]
    MisalignedIr {
        /// Index of the TAP whose length is inconsistent.
        tap: usize,
    },

    /// IR lengths cannot be determined without explicit configuration.
    #[error("IR capture insufficiently constrains IR lengths")]
    AmbiguousIrLengths,

    /// A TAP index beyond the end of the chain was selected.
    #[error("TAP #{index} is not a part of {count}-TAP chain")]
    TapIndexOutOfRange {
        /// The requested index.
        index: usize,
        /// The number of TAPs discovered.
        count: usize,
    },

    /// DR interrogation discovered no TAPs at all.
    #[error("no TAPs found on the scan chain")]
    NoTaps,
}

/// Splits a DR capture taken after a test logic reset into IDCODE/BYPASS
/// chunks.
///
/// A TAP in BYPASS contributes a single 0 bit; a TAP with an IDCODE register
/// contributes 32 bits of which the first is 1. The capture can therefore be
/// walked unambiguously. Returns one entry per TAP, `None` for BYPASS.
pub fn interrogate_dr(dr: &BitSlice<u8, Lsb0>) -> Result<Vec<Option<IdCode>>, ScanChainError> {
    let mut idcodes = Vec::new();
    let mut offset = 0;
    while offset < dr.len() {
        if dr[offset] {
            if dr.len() - offset < 32 {
                tracing::error!("truncated DR IDCODE=<{}>", bits::dump(&dr[offset..]));
                return Err(ScanChainError::TruncatedIdCode {
                    tap: idcodes.len(),
                    capture: bits::dump(&dr[offset..]),
                });
            }
            let idcode = IdCode(dr[offset..offset + 32].load_le::<u32>());
            if !idcode.valid() {
                tracing::error!("invalid DR IDCODE={:08x}", idcode.0);
                return Err(ScanChainError::InvalidIdCode {
                    tap: idcodes.len(),
                    idcode: idcode.0,
                });
            }
            tracing::info!("TAP #{}: IDCODE={}", idcodes.len(), idcode);
            idcodes.push(Some(idcode));
            offset += 32;
        } else {
            tracing::info!("TAP #{}: BYPASS", idcodes.len());
            idcodes.push(None);
            offset += 1;
        }
    }
    Ok(idcodes)
}

/// Convert a list of start positions to a list of lengths.
fn starts_to_lengths(starts: &[usize], total: usize) -> Vec<usize> {
    let mut lens: Vec<usize> = starts.windows(2).map(|w| w[1] - w[0]).collect();
    lens.push(total - lens.iter().sum::<usize>());
    lens
}

/// Splits an IR capture taken after a test logic reset into per-TAP lengths.
///
/// Each captured IR value must start with `<10>` (a 1 in the first bit), but
/// the remaining bits are unspecified and may themselves contain `<10>`, so
/// only a superset of start positions can be found. The lengths are
/// unambiguous when there is a single TAP, or when the number of `<10>`
/// occurrences equals the TAP count; otherwise `ir_lengths` must be provided
/// and is validated against the capture.
pub fn interrogate_ir(
    ir: &BitSlice<u8, Lsb0>,
    tap_count: usize,
    ir_lengths: Option<&[usize]>,
) -> Result<Vec<usize>, ScanChainError> {
    if tap_count == 0 {
        return Err(ScanChainError::NoTaps);
    }

    let mut starts = Vec::new();
    let mut search = 0;
    while let Some(position) = bits::find(ir, &[true, false], search) {
        starts.push(position);
        search = position + 1;
    }
    tracing::trace!("possible IR start positions: {starts:?}");

    if tap_count > starts.len() {
        tracing::error!("fewer IRs detected than TAPs");
        return Err(ScanChainError::TooFewIrStarts);
    }
    if starts[0] != 0 {
        tracing::error!("IR capture does not begin with a valid start pattern");
        return Err(ScanChainError::MalformedIrStart);
    }

    if let Some(expected) = ir_lengths {
        // If expected lengths are available, verify and return them.
        if expected.len() != tap_count {
            tracing::error!(
                "number of provided IR lengths ({}) does not match number of detected TAPs \
                 ({tap_count})",
                expected.len()
            );
            return Err(ScanChainError::IrLengthCountMismatch);
        }
        if expected.iter().sum::<usize>() != ir.len() {
            tracing::error!(
                "sum of provided IR lengths ({}) does not match length of IR capture ({} bits)",
                expected.iter().sum::<usize>(),
                ir.len()
            );
            return Err(ScanChainError::IrLengthSumMismatch);
        }
        let mut offset = 0;
        for (tap, length) in expected.iter().enumerate() {
            if offset != 0 && !starts.contains(&offset) {
                tracing::error!("provided IR length for TAP #{tap} misaligns the next TAP");
                return Err(ScanChainError::MisalignedIr { tap: tap - 1 });
            }
            offset += length;
        }
        if offset != ir.len() && !starts.contains(&offset) {
            return Err(ScanChainError::MisalignedIr {
                tap: expected.len() - 1,
            });
        }
        tracing::debug!("verified provided IR lengths against IR capture");
        Ok(expected.to_vec())
    } else if tap_count == 1 {
        // If there's only one TAP, the entire capture belongs to it.
        tracing::info!("only one TAP detected, IR length {}", ir.len());
        Ok(vec![ir.len()])
    } else if tap_count == starts.len() {
        // If the number of possible starts matches the number of TAPs,
        // all lengths can be found unambiguously.
        let ir_layout = starts_to_lengths(&starts, ir.len());
        tracing::info!("IR lengths are unambiguous: {ir_layout:?}");
        Ok(ir_layout)
    } else {
        tracing::error!("IR lengths are ambiguous and must be explicitly configured");
        Err(ScanChainError::AmbiguousIrLengths)
    }
}

/// Access to a single TAP in a (possibly multi-device) scan chain.
///
/// All IR and DR operations are padded so that every other TAP shifts through
/// BYPASS: `ir_prefix`/`ir_suffix` ones before and after the instruction, and
/// one cycle per TAP before (`dr_prefix`) and after (`dr_suffix`) the data.
pub struct TapInterface {
    jtag: TapController,
    ir_length: usize,
    ir_prefix: usize,
    ir_suffix: usize,
    dr_prefix: usize,
    dr_suffix: usize,
}

impl TapInterface {
    /// Binds TAP `index` of a chain with the given per-TAP IR lengths.
    pub fn from_layout(
        jtag: TapController,
        ir_layout: &[usize],
        index: usize,
    ) -> Result<Self, ScanChainError> {
        if index >= ir_layout.len() {
            return Err(ScanChainError::TapIndexOutOfRange {
                index,
                count: ir_layout.len(),
            });
        }
        Ok(TapInterface {
            jtag,
            ir_length: ir_layout[index],
            ir_prefix: ir_layout[..index].iter().sum(),
            ir_suffix: ir_layout[index + 1..].iter().sum(),
            dr_prefix: index,
            dr_suffix: ir_layout.len() - index - 1,
        })
    }

    /// The IR length of the selected TAP.
    pub fn ir_length(&self) -> usize {
        self.ir_length
    }

    /// Releases the underlying TAP controller.
    pub fn into_controller(self) -> TapController {
        self.jtag
    }

    /// Forces transmission of all batched commands.
    pub fn flush(&mut self) -> Result<(), JtagError> {
        self.jtag.flush()
    }

    /// Waits until every batched command has been executed.
    pub fn sync(&mut self) -> Result<(), JtagError> {
        self.jtag.sync()
    }

    /// Stops the clock for the given number of microseconds.
    pub fn delay_us(&mut self, duration: usize) -> Result<(), JtagError> {
        self.jtag.delay_us(duration)
    }

    /// Stops the clock for the given number of milliseconds.
    pub fn delay_ms(&mut self, duration: usize) -> Result<(), JtagError> {
        self.jtag.delay_ms(duration)
    }

    /// Resets the test logic and returns to Run-Test/Idle.
    pub fn test_reset(&mut self) -> Result<(), JtagError> {
        self.jtag.test_reset()
    }

    /// Remains in Run-Test/Idle for `count` TCK cycles.
    pub fn run_test_idle(&mut self, count: usize) -> Result<(), JtagError> {
        self.jtag.run_test_idle(count)
    }

    /// Remains in Run-Test/Idle, pulsing TCK, for the given duration.
    pub fn run_test_idle_us(&mut self, duration: usize) -> Result<(), JtagError> {
        self.jtag.run_test_idle_us(duration)
    }

    /// Shifts `data` into this TAP's IR while capturing the previous contents.
    pub fn exchange_ir(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<Bits, JtagError> {
        assert_eq!(data.len(), self.ir_length);
        self.jtag.exchange_ir(data, self.ir_prefix, self.ir_suffix)
    }

    /// Captures this TAP's IR.
    pub fn read_ir(&mut self) -> Result<Bits, JtagError> {
        self.jtag
            .read_ir(self.ir_length, self.ir_prefix, self.ir_suffix)
    }

    /// Shifts `data` into this TAP's IR, eliding the write if the IR already
    /// holds the same value.
    pub fn write_ir(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<(), JtagError> {
        assert_eq!(data.len(), self.ir_length);
        self.jtag
            .write_ir(data, self.ir_prefix, self.ir_suffix, true)
    }

    /// Shifts `data` into this TAP's DR while capturing the previous contents.
    pub fn exchange_dr(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<Bits, JtagError> {
        self.jtag.exchange_dr(data, self.dr_prefix, self.dr_suffix)
    }

    /// Captures `count` bits of this TAP's DR.
    pub fn read_dr(&mut self, count: usize) -> Result<Bits, JtagError> {
        self.jtag.read_dr(count, self.dr_prefix, self.dr_suffix)
    }

    /// Shifts `data` into this TAP's DR.
    pub fn write_dr(&mut self, data: &BitSlice<u8, Lsb0>) -> Result<(), JtagError> {
        self.jtag.write_dr(data, self.dr_prefix, self.dr_suffix)
    }

    /// Measures and captures this TAP's DR without lasting effects.
    pub fn scan_dr(&mut self, max_length: Option<usize>) -> Result<Bits, JtagError> {
        let padding = self.dr_prefix + self.dr_suffix;
        let max_length = max_length.map(|limit| padding + limit);
        let data = self.jtag.scan_dr(max_length)?;
        if data.len() <= padding {
            return Err(JtagError::ChainEmpty { register: "DR" });
        }
        Ok(data[self.dr_prefix..data.len() - self.dr_suffix].to_bitvec())
    }

    /// Measures the length of this TAP's DR.
    pub fn scan_dr_length(&mut self, max_length: Option<usize>) -> Result<usize, JtagError> {
        Ok(self.scan_dr(max_length)?.len())
    }
}

impl TapController {
    /// Interrogates the scan chain and binds TAP `index`, providing explicit
    /// IR lengths where the capture alone is ambiguous.
    pub fn select_tap(
        mut self,
        index: usize,
        ir_lengths: Option<&[usize]>,
    ) -> Result<TapInterface, Error> {
        let (dr_value, ir_value) = self.scan_reset_dr_ir()?;
        let idcodes = interrogate_dr(&dr_value)?;
        let ir_layout = interrogate_ir(&ir_value, idcodes.len(), ir_lengths)?;
        Ok(TapInterface::from_layout(self, &ir_layout, index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ARM_TAP: u32 = 0x3ba00477;
    const STM_BS_TAP: u32 = 0x06433041;

    fn encode_dr(entries: &[Option<u32>]) -> Bits {
        let mut dr = Bits::new();
        for entry in entries {
            match entry {
                Some(idcode) => dr.extend_from_bitslice(&bits::from_int(*idcode as u64, 32)),
                None => dr.push(false),
            }
        }
        dr
    }

    #[test]
    fn idcode_display() {
        assert_eq!(format!("{}", IdCode(0x4ba00477)), "0x4BA00477 (ARM Ltd)");
        assert_eq!(
            format!("{}", IdCode(STM_BS_TAP)),
            "0x06433041 (STMicroelectronics)"
        );
    }

    #[test]
    fn interrogate_dr_single_idcode() {
        let idcodes = interrogate_dr(&encode_dr(&[Some(ARM_TAP)])).unwrap();
        assert_eq!(idcodes, vec![Some(IdCode(ARM_TAP))]);
    }

    #[test]
    fn interrogate_dr_bypass_then_idcode() {
        let idcodes = interrogate_dr(&encode_dr(&[None, Some(ARM_TAP)])).unwrap();
        assert_eq!(idcodes, vec![None, Some(IdCode(ARM_TAP))]);
    }

    #[test]
    fn interrogate_dr_idcode_bypass_idcode() {
        let encoded = encode_dr(&[Some(ARM_TAP), None, Some(STM_BS_TAP)]);
        let idcodes = interrogate_dr(&encoded).unwrap();
        assert_eq!(
            idcodes,
            vec![Some(IdCode(ARM_TAP)), None, Some(IdCode(STM_BS_TAP))]
        );
    }

    #[test]
    fn interrogate_dr_round_trips_layouts() {
        let layout = [Some(ARM_TAP), None, Some(STM_BS_TAP), None, None];
        let idcodes = interrogate_dr(&encode_dr(&layout)).unwrap();
        let round_tripped: Vec<_> = idcodes
            .iter()
            .map(|idcode| idcode.map(|idcode| idcode.raw()))
            .collect();
        assert_eq!(round_tripped, layout);
    }

    #[test]
    fn interrogate_dr_truncated() {
        let mut dr = encode_dr(&[Some(ARM_TAP)]);
        dr.truncate(20);
        assert!(matches!(
            interrogate_dr(&dr),
            Err(ScanChainError::TruncatedIdCode { tap: 0, .. })
        ));
    }

    #[test]
    fn interrogate_dr_reserved_manufacturer() {
        // Bits 1..12 hold the reserved pattern <00001111111>.
        let idcode = 0x0000_00ff_u32 | (0 << 8);
        assert!(matches!(
            interrogate_dr(&encode_dr(&[Some(idcode)])),
            Err(ScanChainError::InvalidIdCode { tap: 0, .. })
        ));
    }

    #[test]
    fn interrogate_ir_single_tap() {
        let ir = bits::from_int(0b0001, 4);
        assert_eq!(interrogate_ir(&ir, 1, None).unwrap(), vec![4]);
    }

    #[test]
    fn interrogate_ir_two_taps() {
        // Two TAPs with IR lengths [3, 2]: capture is <10> <100>... wire
        // order "10010", i.e. the integer 0b01001.
        let ir = bits::from_int(0b01001, 5);
        assert_eq!(interrogate_ir(&ir, 2, None).unwrap(), vec![3, 2]);
    }

    #[test]
    fn interrogate_ir_explicit_lengths() {
        let ir = bits::from_int(0b01001, 5);
        assert_eq!(
            interrogate_ir(&ir, 2, Some(&[3, 2])).unwrap(),
            vec![3, 2]
        );
        assert!(matches!(
            interrogate_ir(&ir, 2, Some(&[2, 3])),
            Err(ScanChainError::MisalignedIr { .. })
        ));
        assert!(matches!(
            interrogate_ir(&ir, 2, Some(&[3, 3])),
            Err(ScanChainError::IrLengthSumMismatch)
        ));
        assert!(matches!(
            interrogate_ir(&ir, 2, Some(&[5])),
            Err(ScanChainError::IrLengthCountMismatch)
        ));
    }

    #[test]
    fn interrogate_ir_ambiguous() {
        // Three <10> patterns but only two TAPs.
        let ir = bits::from_int(0b010101, 6);
        assert!(matches!(
            interrogate_ir(&ir, 2, None),
            Err(ScanChainError::AmbiguousIrLengths)
        ));
    }

    #[test]
    fn interrogate_ir_must_start_with_one() {
        let ir = bits::from_int(0b0010, 4);
        assert!(matches!(
            interrogate_ir(&ir, 1, None),
            Err(ScanChainError::MalformedIrStart)
        ));
    }

    #[test]
    fn padding_accounts_for_whole_chain() {
        // For any chain layout and TAP index, prefix + own + suffix must equal
        // the whole chain.
        let layout = [4usize, 5, 3, 8];
        for index in 0..layout.len() {
            let ir_prefix: usize = layout[..index].iter().sum();
            let ir_suffix: usize = layout[index + 1..].iter().sum();
            assert_eq!(
                ir_prefix + layout[index] + ir_suffix,
                layout.iter().sum::<usize>()
            );
            let dr_prefix = index;
            let dr_suffix = layout.len() - index - 1;
            assert_eq!(dr_prefix + 1 + dr_suffix, layout.len());
        }
    }
}

//! TAP controller: state tracking, shift primitives, register operations and
//! shift chain scans.

use bitvec::prelude::*;

use super::state::TapState;
use crate::probe::sequencer::{Sequencer, AUX_TRST_O, AUX_TRST_Z};
use crate::probe::TransportError;
use crate::util::bits::{self, Bits};

/// Errors produced by the TAP controller.
#[derive(Debug, thiserror::Error)]
pub enum JtagError {
    /// The requested state is not reachable from the current state without
    /// side effects.
    #[error("cannot transition from state {from} to {to}")]
    InvalidStateTransition {
        /// State the controller is currently in.
        from: TapState,
        /// State that was requested.
        to: TapState,
    },

    /// TRST# was requested but the probe adapter does not provide it.
    #[error("cannot set TRST#: probe adapter does not provide TRST#")]
    NoTrst,

    /// No end was found within the scan length budget.
    #[error("{register} shift chain is too long")]
    ChainTooLong {
        /// `"IR"` or `"DR"`.
        register: &'static str,
    },

    /// The scan found a zero-length shift chain.
    #[error("{register} shift chain is empty")]
    ChainEmpty {
        /// `"IR"` or `"DR"`.
        register: &'static str,
    },

    /// The underlying pipe failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Clone, Copy, PartialEq)]
enum ScanRegister {
    Ir,
    Dr,
}

impl ScanRegister {
    fn name(self) -> &'static str {
        match self {
            ScanRegister::Ir => "IR",
            ScanRegister::Dr => "DR",
        }
    }
}

/// TAP controller on top of the JTAG sequencer.
///
/// Tracks the TAP state across operations and caches the last written IR value
/// so that repeated instruction writes can be elided. The cache is invalidated
/// by [`TapController::test_reset`] and [`TapController::pulse_trst`].
pub struct TapController {
    seq: Sequencer,
    state: TapState,
    current_ir: Option<(usize, Bits, usize)>,
    has_trst: bool,

    /// Scans of IRs longer than this many bits fail with
    /// [`JtagError::ChainTooLong`].
    pub scan_ir_max_length: usize,
    /// Scans of DRs longer than this many bits fail with
    /// [`JtagError::ChainTooLong`].
    pub scan_dr_max_length: usize,
}

impl TapController {
    /// Creates a TAP controller over a sequencer without a TRST# pin.
    pub fn new(seq: Sequencer) -> Self {
        Self::with_trst(seq, false)
    }

    /// Creates a TAP controller, stating whether the adapter provides TRST#.
    pub fn with_trst(seq: Sequencer, has_trst: bool) -> Self {
        TapController {
            seq,
            state: TapState::Unknown,
            current_ir: None,
            has_trst,
            scan_ir_max_length: 128,
            scan_dr_max_length: 1024,
        }
    }

    /// The state the TAP is currently in.
    pub fn state(&self) -> TapState {
        self.state
    }

    /// Forces transmission of all batched commands.
    pub fn flush(&mut self) -> Result<(), JtagError> {
        Ok(self.seq.flush()?)
    }

    /// Waits until every batched command has been executed.
    pub fn sync(&mut self) -> Result<(), JtagError> {
        Ok(self.seq.sync()?)
    }

    /// Stops the clock for the given number of microseconds.
    pub fn delay_us(&mut self, duration: usize) -> Result<(), JtagError> {
        Ok(self.seq.delay_us(duration)?)
    }

    /// Stops the clock for the given number of milliseconds.
    pub fn delay_ms(&mut self, duration: usize) -> Result<(), JtagError> {
        Ok(self.seq.delay_us(duration * 1000)?)
    }

    // Low-level operations

    /// Drives TRST#: `Some(true)` asserts it, `Some(false)` deasserts it, and
    /// `None` leaves the line high-Z.
    pub fn set_trst(&mut self, active: Option<bool>) -> Result<(), JtagError> {
        if !self.has_trst {
            return Err(JtagError::NoTrst);
        }
        match active {
            None => self.seq.set_aux(AUX_TRST_Z)?,
            Some(true) => self.seq.set_aux(AUX_TRST_O)?,
            Some(false) => self.seq.set_aux(0)?,
        }
        Ok(())
    }

    fn shift_tms_pattern(&mut self, pattern: &[bool], to: TapState) -> Result<(), JtagError> {
        let mut tms = Bits::with_capacity(pattern.len());
        tms.extend(pattern.iter().copied());
        self.seq.shift_tms(&tms)?;
        self.state = to;
        Ok(())
    }

    fn state_error<T>(&self, to: TapState) -> Result<T, JtagError> {
        Err(JtagError::InvalidStateTransition {
            from: self.state,
            to,
        })
    }

    fn shift_last(&mut self, last: bool) {
        if last {
            if self.state == TapState::ShiftIr {
                tracing::trace!("state Shift-IR -> Exit1-IR");
                self.state = TapState::Exit1Ir;
            } else if self.state == TapState::ShiftDr {
                tracing::trace!("state Shift-DR -> Exit1-DR");
                self.state = TapState::Exit1Dr;
            }
        }
    }

    /// Shifts `prefix` dummy cycles (TDI high), then the payload bits, then
    /// `suffix` dummy cycles, capturing TDO for the payload only. With `last`,
    /// TMS is asserted on the final cycle, leaving the shift state.
    pub fn shift_tdio(
        &mut self,
        tdi: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
        last: bool,
    ) -> Result<Bits, JtagError> {
        assert!(matches!(self.state, TapState::ShiftIr | TapState::ShiftDr));
        self.seq.run_tck(prefix, false)?;
        let tdo = self.seq.shift_tdio(tdi, last && suffix == 0)?;
        self.seq.run_tck(suffix, last)?;
        self.shift_last(last);
        Ok(tdo)
    }

    /// Like [`TapController::shift_tdio`], but discards TDO.
    pub fn shift_tdi(
        &mut self,
        tdi: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
        last: bool,
    ) -> Result<(), JtagError> {
        assert!(matches!(self.state, TapState::ShiftIr | TapState::ShiftDr));
        self.seq.run_tck(prefix, false)?;
        self.seq.shift_tdi(tdi, last && suffix == 0)?;
        self.seq.run_tck(suffix, last)?;
        self.shift_last(last);
        Ok(())
    }

    /// Like [`TapController::shift_tdio`], but shifts TDI high and captures
    /// `count` TDO bits.
    pub fn shift_tdo(
        &mut self,
        count: usize,
        prefix: usize,
        suffix: usize,
        last: bool,
    ) -> Result<Bits, JtagError> {
        assert!(matches!(self.state, TapState::ShiftIr | TapState::ShiftDr));
        self.seq.run_tck(prefix, false)?;
        let tdo = self.seq.shift_tdo(count, last && suffix == 0)?;
        self.seq.run_tck(suffix, last)?;
        self.shift_last(last);
        Ok(tdo)
    }

    /// Pulses TCK `count` times without changing state.
    pub fn pulse_tck(&mut self, count: usize) -> Result<(), JtagError> {
        assert!(matches!(
            self.state,
            TapState::RunTestIdle | TapState::PauseIr | TapState::PauseDr
        ));
        self.seq.run_tck(count, false)?;
        Ok(())
    }

    // State machine transitions

    /// Enters Test-Logic-Reset. Unless `force` is set, does nothing when the
    /// TAP is known to be in Test-Logic-Reset already.
    pub fn enter_test_logic_reset(&mut self, force: bool) -> Result<(), JtagError> {
        if force {
            tracing::trace!("state * -> Test-Logic-Reset");
        } else if self.state != TapState::TestLogicReset {
            tracing::trace!("state {} -> Test-Logic-Reset", self.state);
        } else {
            return Ok(());
        }
        self.shift_tms_pattern(&[true; 5], TapState::TestLogicReset)
    }

    /// Enters Run-Test/Idle from any stable or exit state.
    pub fn enter_run_test_idle(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == RunTestIdle {
            return Ok(());
        }
        tracing::trace!("state {} -> Run-Test/Idle", self.state);
        match self.state {
            TestLogicReset => self.shift_tms_pattern(&[false], RunTestIdle),
            Exit1Ir | Exit1Dr => self.shift_tms_pattern(&[true, false], RunTestIdle),
            PauseIr | PauseDr => self.shift_tms_pattern(&[true, true, false], RunTestIdle),
            UpdateIr | UpdateDr => self.shift_tms_pattern(&[false], RunTestIdle),
            _ => self.state_error(RunTestIdle),
        }
    }

    /// Enters Capture-IR.
    pub fn enter_capture_ir(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == CaptureIr {
            return Ok(());
        }
        tracing::trace!("state {} -> Capture-IR", self.state);
        match self.state {
            TestLogicReset => self.shift_tms_pattern(&[false, true, true, false], CaptureIr),
            RunTestIdle | UpdateIr | UpdateDr => {
                self.shift_tms_pattern(&[true, true, false], CaptureIr)
            }
            PauseDr | PauseIr => {
                self.shift_tms_pattern(&[true, true, true, true, false], CaptureIr)
            }
            _ => self.state_error(CaptureIr),
        }
    }

    /// Enters Shift-IR.
    pub fn enter_shift_ir(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == ShiftIr {
            return Ok(());
        }
        tracing::trace!("state {} -> Shift-IR", self.state);
        match self.state {
            TestLogicReset => self.shift_tms_pattern(&[false, true, true, false, false], ShiftIr),
            RunTestIdle | UpdateIr | UpdateDr => {
                self.shift_tms_pattern(&[true, true, false, false], ShiftIr)
            }
            PauseDr => self.shift_tms_pattern(&[true, true, true, true, false, false], ShiftIr),
            PauseIr => self.shift_tms_pattern(&[true, false], ShiftIr),
            CaptureIr => self.shift_tms_pattern(&[false], ShiftIr),
            _ => self.state_error(ShiftIr),
        }
    }

    /// Enters Pause-IR.
    pub fn enter_pause_ir(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == PauseIr {
            return Ok(());
        }
        tracing::trace!("state {} -> Pause-IR", self.state);
        match self.state {
            Exit1Ir => self.shift_tms_pattern(&[false], PauseIr),
            _ => self.state_error(PauseIr),
        }
    }

    /// Enters Update-IR.
    pub fn enter_update_ir(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == UpdateIr {
            return Ok(());
        }
        tracing::trace!("state {} -> Update-IR", self.state);
        match self.state {
            ShiftIr | CaptureIr => self.shift_tms_pattern(&[true, true], UpdateIr),
            Exit1Ir => self.shift_tms_pattern(&[true], UpdateIr),
            _ => self.state_error(UpdateIr),
        }
    }

    /// Enters Capture-DR.
    pub fn enter_capture_dr(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == CaptureDr {
            return Ok(());
        }
        tracing::trace!("state {} -> Capture-DR", self.state);
        match self.state {
            TestLogicReset => self.shift_tms_pattern(&[false, true, false], CaptureDr),
            RunTestIdle | UpdateIr | UpdateDr => self.shift_tms_pattern(&[true, false], CaptureDr),
            PauseIr | PauseDr => self.shift_tms_pattern(&[true, true, true, false], CaptureDr),
            _ => self.state_error(CaptureDr),
        }
    }

    /// Enters Shift-DR.
    pub fn enter_shift_dr(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == ShiftDr {
            return Ok(());
        }
        tracing::trace!("state {} -> Shift-DR", self.state);
        match self.state {
            TestLogicReset => self.shift_tms_pattern(&[false, true, false, false], ShiftDr),
            RunTestIdle | UpdateIr | UpdateDr => {
                self.shift_tms_pattern(&[true, false, false], ShiftDr)
            }
            PauseIr => self.shift_tms_pattern(&[true, true, true, false, false], ShiftDr),
            PauseDr => self.shift_tms_pattern(&[true, false], ShiftDr),
            CaptureDr => self.shift_tms_pattern(&[false], ShiftDr),
            _ => self.state_error(ShiftDr),
        }
    }

    /// Enters Pause-DR.
    pub fn enter_pause_dr(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == PauseDr {
            return Ok(());
        }
        tracing::trace!("state {} -> Pause-DR", self.state);
        match self.state {
            Exit1Dr => self.shift_tms_pattern(&[false], PauseDr),
            _ => self.state_error(PauseDr),
        }
    }

    /// Enters Update-DR.
    pub fn enter_update_dr(&mut self) -> Result<(), JtagError> {
        use TapState::*;
        if self.state == UpdateDr {
            return Ok(());
        }
        tracing::trace!("state {} -> Update-DR", self.state);
        match self.state {
            ShiftDr | CaptureDr => self.shift_tms_pattern(&[true, true], UpdateDr),
            Exit1Dr => self.shift_tms_pattern(&[true], UpdateDr),
            _ => self.state_error(UpdateDr),
        }
    }

    /// Follows an explicit state path, one TCK cycle per element. Every step
    /// must be adjacent to its predecessor in the transition graph.
    pub fn traverse_state_path(&mut self, path: &[TapState]) -> Result<(), JtagError> {
        if path.is_empty() {
            return Ok(());
        }
        let mut state = self.state;
        let mut tms = Bits::with_capacity(path.len());
        for &target in path {
            let Some((low, high)) = state.transitions() else {
                return Err(JtagError::InvalidStateTransition {
                    from: state,
                    to: target,
                });
            };
            if low == target {
                tms.push(false);
            } else if high == target {
                tms.push(true);
            } else {
                return Err(JtagError::InvalidStateTransition {
                    from: state,
                    to: target,
                });
            }
            state = target;
        }
        self.seq.shift_tms(&tms)?;
        self.state = state;
        Ok(())
    }

    // High-level register manipulation

    /// Pulses TRST#, holding TMS high while it deasserts so the test logic
    /// stays deterministic (IEEE 1149.1 3.6.1 (d)).
    pub fn pulse_trst(&mut self) -> Result<(), JtagError> {
        tracing::debug!("pulse trst");
        self.set_trst(Some(true))?;
        let mut tms = Bits::new();
        tms.push(true);
        self.seq.shift_tms(&tms)?;
        self.set_trst(Some(false))?;
        self.state = TapState::TestLogicReset;
        self.current_ir = None;
        Ok(())
    }

    /// Resets the test logic and returns to Run-Test/Idle.
    pub fn test_reset(&mut self) -> Result<(), JtagError> {
        tracing::debug!("test reset");
        self.enter_test_logic_reset(true)?;
        self.enter_run_test_idle()?;
        self.current_ir = None;
        Ok(())
    }

    /// Remains in Run-Test/Idle for `count` TCK cycles.
    pub fn run_test_idle(&mut self, count: usize) -> Result<(), JtagError> {
        tracing::debug!("run-test/idle count={count}");
        self.enter_run_test_idle()?;
        self.pulse_tck(count)
    }

    /// Remains in Run-Test/Idle, pulsing TCK, for the given duration.
    pub fn run_test_idle_us(&mut self, duration: usize) -> Result<(), JtagError> {
        tracing::debug!("run-test/idle us={duration}");
        self.enter_run_test_idle()?;
        Ok(self.seq.delay_run_tck_us(duration)?)
    }

    /// Remains in Run-Test/Idle, pulsing TCK, for the given duration.
    pub fn run_test_idle_ms(&mut self, duration: usize) -> Result<(), JtagError> {
        self.run_test_idle_us(duration * 1000)
    }

    /// Shifts `data` into the IR while capturing the previous contents.
    pub fn exchange_ir(
        &mut self,
        data: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
    ) -> Result<Bits, JtagError> {
        self.current_ir = Some((prefix, data.to_bitvec(), suffix));
        tracing::debug!("exchange ir={},<{}>,{}", prefix, bits::dump(data), suffix);
        let captured = if data.is_empty() {
            self.enter_capture_ir()?;
            Bits::new()
        } else {
            self.enter_shift_ir()?;
            self.shift_tdio(data, prefix, suffix, true)?
        };
        self.enter_update_ir()?;
        Ok(captured)
    }

    /// Captures `count` bits of the IR, replacing its contents with ones.
    pub fn read_ir(
        &mut self,
        count: usize,
        prefix: usize,
        suffix: usize,
    ) -> Result<Bits, JtagError> {
        self.current_ir = Some((prefix, bits::ones(count), suffix));
        let captured = if count == 0 {
            self.enter_capture_ir()?;
            Bits::new()
        } else {
            self.enter_shift_ir()?;
            self.shift_tdo(count, prefix, suffix, true)?
        };
        self.enter_update_ir()?;
        tracing::debug!("read ir={},<{}>,{}", prefix, bits::dump(&captured), suffix);
        Ok(captured)
    }

    /// Shifts `data` into the IR. With `elide`, does nothing if the IR already
    /// holds the same value (with the same padding).
    pub fn write_ir(
        &mut self,
        data: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
        elide: bool,
    ) -> Result<(), JtagError> {
        if elide {
            if let Some((cached_prefix, cached, cached_suffix)) = &self.current_ir {
                if *cached_prefix == prefix && cached == data && *cached_suffix == suffix {
                    tracing::debug!("write ir (elided)");
                    return Ok(());
                }
            }
        }
        self.current_ir = Some((prefix, data.to_bitvec(), suffix));
        tracing::debug!("write ir={},<{}>,{}", prefix, bits::dump(data), suffix);
        if data.is_empty() {
            self.enter_capture_ir()?;
        } else {
            self.enter_shift_ir()?;
            self.shift_tdi(data, prefix, suffix, true)?;
        }
        self.enter_update_ir()
    }

    /// Shifts `data` into the DR while capturing the previous contents.
    pub fn exchange_dr(
        &mut self,
        data: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
    ) -> Result<Bits, JtagError> {
        tracing::debug!("exchange dr-i={},<{}>,{}", prefix, bits::dump(data), suffix);
        let captured = if data.is_empty() {
            self.enter_capture_dr()?;
            Bits::new()
        } else {
            self.enter_shift_dr()?;
            self.shift_tdio(data, prefix, suffix, true)?
        };
        self.enter_update_dr()?;
        tracing::debug!(
            "exchange dr-o={},<{}>,{}",
            prefix,
            bits::dump(&captured),
            suffix
        );
        Ok(captured)
    }

    /// Captures `count` bits of the DR, replacing its contents with ones.
    pub fn read_dr(
        &mut self,
        count: usize,
        prefix: usize,
        suffix: usize,
    ) -> Result<Bits, JtagError> {
        let captured = if count == 0 {
            self.enter_capture_dr()?;
            Bits::new()
        } else {
            self.enter_shift_dr()?;
            self.shift_tdo(count, prefix, suffix, true)?
        };
        self.enter_update_dr()?;
        tracing::debug!("read dr={},<{}>,{}", prefix, bits::dump(&captured), suffix);
        Ok(captured)
    }

    /// Shifts `data` into the DR.
    pub fn write_dr(
        &mut self,
        data: &BitSlice<u8, Lsb0>,
        prefix: usize,
        suffix: usize,
    ) -> Result<(), JtagError> {
        tracing::debug!("write dr={},<{}>,{}", prefix, bits::dump(data), suffix);
        if data.is_empty() {
            self.enter_capture_dr()?;
        } else {
            self.enter_shift_dr()?;
            self.shift_tdi(data, prefix, suffix, true)?;
        }
        self.enter_update_dr()
    }

    // Shift chain introspection

    fn scan_xr(
        &mut self,
        register: ScanRegister,
        max_length: Option<usize>,
        idempotent: bool,
    ) -> Result<Bits, JtagError> {
        tracing::debug!(
            "scan {}{}",
            register.name(),
            if idempotent { " idempotent" } else { "" }
        );

        let max_length = max_length.unwrap_or(match register {
            ScanRegister::Ir => self.scan_ir_max_length,
            ScanRegister::Dr => self.scan_dr_max_length,
        });

        match register {
            ScanRegister::Ir => self.enter_shift_ir()?,
            ScanRegister::Dr => self.enter_shift_dr()?,
        }

        // Add 1 so that registers of exactly `max_length` can be scanned.
        let data_0 = self.shift_tdio(&bits::zeros(max_length + 1), 0, 0, false)?;
        let data_1 = self.shift_tdio(&bits::ones(max_length + 1), 0, 0, !idempotent)?;

        let mut value = None;
        for length in 0..max_length + 1 {
            if data_1[length] {
                if data_0[length..].not_any() {
                    value = Some(data_0[..length].to_bitvec());
                }
                break;
            }
        }

        let result = match &value {
            None => {
                tracing::debug!("scan {} overlong", register.name());
                Err(JtagError::ChainTooLong {
                    register: register.name(),
                })
            }
            Some(data) if data.is_empty() => {
                tracing::debug!("scan {} empty", register.name());
                Err(JtagError::ChainEmpty {
                    register: register.name(),
                })
            }
            Some(data) => {
                tracing::debug!(
                    "scan {} length={} data=<{}>",
                    register.name(),
                    data.len(),
                    bits::dump(data)
                );
                Ok(data.clone())
            }
        };

        if idempotent {
            match &value {
                Some(data) if !data.is_empty() => {
                    // Idempotent scan is possible: shift scanned data back.
                    self.shift_tdi(data, 0, 0, true)?;
                }
                _ => {
                    // Idempotent scan requested, but isn't possible: finish shifting.
                    self.shift_tdi(&bits::ones(1), 0, 0, true)?;
                }
            }
        }
        self.enter_run_test_idle()?;

        result
    }

    /// Measures and captures the contents of the IR chain. Leaves BYPASS in
    /// every IR.
    pub fn scan_ir(&mut self, max_length: Option<usize>) -> Result<Bits, JtagError> {
        self.scan_xr(ScanRegister::Ir, max_length, false)
    }

    /// Measures and captures the contents of the DR chain, then shifts the
    /// captured value back in so the scan has no lasting effect.
    pub fn scan_dr(&mut self, max_length: Option<usize>) -> Result<Bits, JtagError> {
        self.scan_xr(ScanRegister::Dr, max_length, true)
    }

    /// Measures the total length of the IR chain.
    pub fn scan_ir_length(&mut self, max_length: Option<usize>) -> Result<usize, JtagError> {
        Ok(self.scan_ir(max_length)?.len())
    }

    /// Measures the total length of the DR chain.
    pub fn scan_dr_length(&mut self, max_length: Option<usize>) -> Result<usize, JtagError> {
        Ok(self.scan_dr(max_length)?.len())
    }

    /// Captures IDCODE/BYPASS DR values and IR values using Test-Logic-Reset.
    ///
    /// The DR chain is scanned first, since scanning the IR chain latches
    /// BYPASS into every IR.
    pub fn scan_reset_dr_ir(&mut self) -> Result<(Bits, Bits), JtagError> {
        self.test_reset()?;
        let dr_value = self.scan_xr(ScanRegister::Dr, None, false)?;
        let ir_value = self.scan_xr(ScanRegister::Ir, None, false)?;
        Ok((dr_value, ir_value))
    }
}

/// State of an IEEE 1149.1 test access port.
///
/// The transition graph is fixed by the standard: every state has exactly two
/// outgoing edges, keyed by the TMS level on the rising edge of TCK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TapState {
    /// The state is not known, e.g. before the first reset.
    Unknown,
    /// Test-Logic-Reset.
    TestLogicReset,
    /// Run-Test/Idle.
    RunTestIdle,
    /// Select-DR-Scan.
    SelectDrScan,
    /// Capture-DR.
    CaptureDr,
    /// Shift-DR.
    ShiftDr,
    /// Exit1-DR.
    Exit1Dr,
    /// Pause-DR.
    PauseDr,
    /// Exit2-DR.
    Exit2Dr,
    /// Update-DR.
    UpdateDr,
    /// Select-IR-Scan.
    SelectIrScan,
    /// Capture-IR.
    CaptureIr,
    /// Shift-IR.
    ShiftIr,
    /// Exit1-IR.
    Exit1Ir,
    /// Pause-IR.
    PauseIr,
    /// Exit2-IR.
    Exit2Ir,
    /// Update-IR.
    UpdateIr,
}

impl TapState {
    /// The states reached from this state with TMS low and high, respectively.
    /// `None` for [`TapState::Unknown`].
    pub fn transitions(self) -> Option<(TapState, TapState)> {
        use TapState::*;
        Some(match self {
            Unknown => return None,
            TestLogicReset => (RunTestIdle, TestLogicReset),
            RunTestIdle => (RunTestIdle, SelectDrScan),
            SelectDrScan => (CaptureDr, SelectIrScan),
            CaptureDr => (ShiftDr, Exit1Dr),
            ShiftDr => (ShiftDr, Exit1Dr),
            Exit1Dr => (PauseDr, UpdateDr),
            PauseDr => (PauseDr, Exit2Dr),
            Exit2Dr => (ShiftDr, UpdateDr),
            UpdateDr => (RunTestIdle, SelectDrScan),
            SelectIrScan => (CaptureIr, TestLogicReset),
            CaptureIr => (ShiftIr, Exit1Ir),
            ShiftIr => (ShiftIr, Exit1Ir),
            Exit1Ir => (PauseIr, UpdateIr),
            PauseIr => (PauseIr, Exit2Ir),
            Exit2Ir => (ShiftIr, UpdateIr),
            UpdateIr => (RunTestIdle, SelectDrScan),
        })
    }

    /// The state reached from this state after one TCK cycle with the given
    /// TMS level.
    pub fn step(self, tms: bool) -> Option<TapState> {
        self.transitions()
            .map(|(low, high)| if tms { high } else { low })
    }
}

impl std::fmt::Display for TapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TapState::Unknown => "Unknown",
            TapState::TestLogicReset => "Test-Logic-Reset",
            TapState::RunTestIdle => "Run-Test/Idle",
            TapState::SelectDrScan => "Select-DR-Scan",
            TapState::CaptureDr => "Capture-DR",
            TapState::ShiftDr => "Shift-DR",
            TapState::Exit1Dr => "Exit1-DR",
            TapState::PauseDr => "Pause-DR",
            TapState::Exit2Dr => "Exit2-DR",
            TapState::UpdateDr => "Update-DR",
            TapState::SelectIrScan => "Select-IR-Scan",
            TapState::CaptureIr => "Capture-IR",
            TapState::ShiftIr => "Shift-IR",
            TapState::Exit1Ir => "Exit1-IR",
            TapState::PauseIr => "Pause-IR",
            TapState::Exit2Ir => "Exit2-IR",
            TapState::UpdateIr => "Update-IR",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::TapState;
    use test_case::test_case;

    #[test_case(TapState::TestLogicReset, false, TapState::RunTestIdle)]
    #[test_case(TapState::RunTestIdle, true, TapState::SelectDrScan)]
    #[test_case(TapState::ShiftDr, false, TapState::ShiftDr)]
    #[test_case(TapState::ShiftDr, true, TapState::Exit1Dr)]
    #[test_case(TapState::Exit1Ir, true, TapState::UpdateIr)]
    #[test_case(TapState::Exit2Dr, false, TapState::ShiftDr)]
    #[test_case(TapState::SelectIrScan, true, TapState::TestLogicReset)]
    fn single_steps(from: TapState, tms: bool, to: TapState) {
        assert_eq!(from.step(tms), Some(to));
    }

    // Five TMS=1 cycles reach Test-Logic-Reset from every state.
    #[test]
    fn reset_from_any_state() {
        use TapState::*;
        for start in [
            TestLogicReset, RunTestIdle, SelectDrScan, CaptureDr, ShiftDr, Exit1Dr, PauseDr,
            Exit2Dr, UpdateDr, SelectIrScan, CaptureIr, ShiftIr, Exit1Ir, PauseIr, Exit2Ir,
            UpdateIr,
        ] {
            let mut state = start;
            for _ in 0..5 {
                state = state.step(true).unwrap();
            }
            assert_eq!(state, TestLogicReset, "failed from {start}");
        }
    }

    #[test]
    fn unknown_has_no_transitions() {
        assert_eq!(TapState::Unknown.step(false), None);
        assert_eq!(TapState::Unknown.step(true), None);
    }
}

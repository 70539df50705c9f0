//! Scan chain discovery against a software TAP chain model.

use fathom::jtag::{interrogate_dr, interrogate_ir, TapController, TapState};
use fathom::probe::fake::{IdcodeTap, TapChainPipe, TapModel};
use fathom::probe::sequencer::Sequencer;
use fathom::util::bits;

use pretty_assertions::assert_eq;

fn controller(taps: Vec<Box<dyn TapModel>>) -> TapController {
    TapController::new(Sequencer::new(Box::new(TapChainPipe::new(taps))))
}

#[test]
fn scan_single_tap_with_idcode() {
    let mut jtag = controller(vec![Box::new(IdcodeTap::new(4, Some(0x3ba00477)))]);
    let (dr_value, ir_value) = jtag.scan_reset_dr_ir().unwrap();

    let idcodes = interrogate_dr(&dr_value).unwrap();
    assert_eq!(idcodes.len(), 1);
    assert_eq!(idcodes[0].unwrap().raw(), 0x3ba00477);

    let ir_layout = interrogate_ir(&ir_value, idcodes.len(), None).unwrap();
    assert_eq!(ir_layout, vec![4]);
}

#[test]
fn scan_chain_with_bypass_device() {
    // A TAP booting into BYPASS contributes one zero bit ahead of the IDCODE.
    let mut jtag = controller(vec![
        Box::new(IdcodeTap::new(5, None)),
        Box::new(IdcodeTap::new(4, Some(0x3ba00477))),
    ]);
    let (dr_value, ir_value) = jtag.scan_reset_dr_ir().unwrap();

    let idcodes = interrogate_dr(&dr_value).unwrap();
    assert_eq!(idcodes.len(), 2);
    assert!(idcodes[0].is_none());
    assert_eq!(idcodes[1].unwrap().raw(), 0x3ba00477);

    let ir_layout = interrogate_ir(&ir_value, idcodes.len(), None).unwrap();
    assert_eq!(ir_layout, vec![5, 4]);
}

#[test]
fn dr_scan_is_idempotent() {
    let mut jtag = controller(vec![Box::new(IdcodeTap::new(4, Some(0x3ba00477)))]);
    jtag.test_reset().unwrap();

    // Scanning the DR must shift the captured value back in: a second scan
    // observes the same contents even though the first one cycled the whole
    // register through the probe.
    let first = jtag.scan_dr(None).unwrap();
    let second = jtag.scan_dr(None).unwrap();
    assert_eq!(bits::to_int(&first), 0x3ba00477);
    assert_eq!(first, second);
}

#[test]
fn tap_handle_pads_other_devices() {
    let jtag = controller(vec![
        Box::new(IdcodeTap::new(5, Some(0x06433041))),
        Box::new(IdcodeTap::new(4, Some(0x3ba00477))),
    ]);
    let mut tap = jtag.select_tap(1, None).unwrap();
    assert_eq!(tap.ir_length(), 4);

    // Writing this TAP's IR and scanning its DR sees a 1-bit BYPASS for the
    // other device stripped away.
    tap.write_ir(&bits::ones(4)).unwrap();
    let dr = tap.scan_dr(None).unwrap();
    assert_eq!(dr.len(), 1);
}

#[test]
fn state_traversal_matches_model() {
    use TapState::*;
    let mut jtag = controller(vec![Box::new(IdcodeTap::new(4, Some(0x3ba00477)))]);
    jtag.test_reset().unwrap();
    jtag.traverse_state_path(&[SelectDrScan, CaptureDr, Exit1Dr, PauseDr])
        .unwrap();
    assert_eq!(jtag.state(), PauseDr);

    // Non-adjacent steps are rejected without clocking anything.
    let error = jtag.traverse_state_path(&[ShiftIr]).unwrap_err();
    assert!(matches!(
        error,
        fathom::jtag::JtagError::InvalidStateTransition { .. }
    ));
}

#[test]
fn ir_write_elision_survives_until_reset() {
    let jtag = controller(vec![Box::new(IdcodeTap::new(4, Some(0x3ba00477)))]);
    let mut tap = jtag.select_tap(0, None).unwrap();

    // The second identical write is elided; the value is still latched.
    tap.write_ir(&bits::from_int(0b1110, 4)).unwrap();
    tap.write_ir(&bits::from_int(0b1110, 4)).unwrap();
    let dr = tap.scan_dr(None).unwrap();
    assert_eq!(dr.len(), 1);
}

//! MEC16xx programmer exercised against an ARC TAP and controller model.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bitvec::prelude::*;

use fathom::architecture::arc::mec16xx::{
    Mec16xx, Mec16xxError, EEPROM_ERASE_ALL_ADDR, FLASH_ERASE_ALL_ADDR,
};
use fathom::architecture::arc::ArcDebug;
use fathom::jtag::TapController;
use fathom::probe::fake::{TapChainPipe, TapModel};
use fathom::probe::sequencer::Sequencer;
use fathom::util::bits::{self, Bits};

use pretty_assertions::assert_eq;

const IR_RESET_TEST: u32 = 0b0010;
const IR_STATUS: u32 = 0b1000;
const IR_TXN_COMMAND: u32 = 0b1001;
const IR_ADDRESS: u32 = 0b1010;
const IR_DATA: u32 = 0b1011;
const IR_IDCODE: u32 = 0b1100;

const FLASH_DATA: u32 = 0xff_3900;
const FLASH_ADDRESS: u32 = 0xff_3904;
const FLASH_COMMAND: u32 = 0xff_3908;
const FLASH_STATUS: u32 = 0xff_390c;
const FLASH_CONFIG: u32 = 0xff_3910;

const EEPROM_DATA: u32 = 0xff_3a00;
const EEPROM_ADDRESS: u32 = 0xff_3a04;
const EEPROM_COMMAND: u32 = 0xff_3a08;
const EEPROM_STATUS: u32 = 0xff_3a0c;
const EEPROM_UNLOCK: u32 = 0xff_3a20;

const EEPROM_PASSWORD: u32 = 0x1234_5678;

#[derive(Default)]
struct McState {
    mem: HashMap<u32, u32>,
    aux: HashMap<u32, u32>,

    flash: Vec<u32>,
    flash_addr: u32,
    flash_cmd: u32,
    /// When the next flash data read hits this address, it returns garbage
    /// once, modelling the silicon bug in the debug read path.
    glitch_at: Option<u32>,

    eeprom: Vec<u8>,
    eeprom_addr: u32,
    eeprom_cmd: u32,
    eeprom_blocked: bool,

    reset_test_writes: Vec<u32>,
}

impl McState {
    fn new() -> Self {
        McState {
            flash: vec![0xffff_ffff; 0x1000],
            eeprom: vec![0xff; 2048],
            ..McState::default()
        }
    }

    fn flash_mode(&self) -> u32 {
        self.flash_cmd & 0x3
    }

    fn eeprom_mode(&self) -> u32 {
        self.eeprom_cmd & 0x3
    }

    fn mem_read(&mut self, address: u32) -> u32 {
        match address {
            FLASH_DATA if self.flash_mode() == 1 => {
                let value = self.flash[(self.flash_addr as usize / 4) % self.flash.len()];
                if self.glitch_at == Some(self.flash_addr) {
                    self.glitch_at = None;
                    return !value;
                }
                value
            }
            FLASH_STATUS => 0, // never busy, no sticky errors
            EEPROM_STATUS => (self.eeprom_blocked as u32) << 7,
            EEPROM_DATA if self.eeprom_mode() == 1 => {
                let value = self.eeprom[self.eeprom_addr as usize % self.eeprom.len()];
                self.eeprom_addr += 1;
                value as u32
            }
            _ => *self.mem.get(&address).unwrap_or(&0),
        }
    }

    fn mem_write(&mut self, address: u32, value: u32) {
        match address {
            FLASH_COMMAND => self.flash_cmd = value,
            FLASH_ADDRESS => {
                self.flash_addr = value;
                if self.flash_mode() == 3 && value == FLASH_ERASE_ALL_ADDR {
                    self.flash.fill(0xffff_ffff);
                }
            }
            FLASH_DATA if self.flash_mode() == 2 => {
                let index = (self.flash_addr as usize / 4) % self.flash.len();
                self.flash[index] &= value;
                self.flash_addr += 4;
            }
            FLASH_STATUS | FLASH_CONFIG => {}
            EEPROM_COMMAND => self.eeprom_cmd = value,
            EEPROM_ADDRESS => {
                self.eeprom_addr = value;
                if self.eeprom_mode() == 3 && value == EEPROM_ERASE_ALL_ADDR {
                    self.eeprom.fill(0xff);
                }
            }
            EEPROM_DATA if self.eeprom_mode() == 2 => {
                let index = self.eeprom_addr as usize % self.eeprom.len();
                self.eeprom[index] = value as u8;
                self.eeprom_addr += 1;
            }
            EEPROM_STATUS => {}
            EEPROM_UNLOCK => {
                if value == EEPROM_PASSWORD {
                    self.eeprom_blocked = false;
                }
            }
            _ => {
                self.mem.insert(address, value);
            }
        }
    }
}

struct ArcTap {
    state: Rc<RefCell<McState>>,
    ir: u32,
    address: u32,
    data: u32,
    txn: u32,
    txn_armed: bool,
    txn_ready: bool,
}

impl ArcTap {
    fn new(state: Rc<RefCell<McState>>) -> Self {
        ArcTap {
            state,
            ir: IR_IDCODE,
            address: 0,
            data: 0,
            txn: 0,
            txn_armed: false,
            txn_ready: false,
        }
    }
}

impl TapModel for ArcTap {
    fn ir_length(&self) -> usize {
        4
    }

    fn reset(&mut self) {
        self.ir = IR_IDCODE;
    }

    fn update_ir(&mut self, ir: &BitSlice<u8, Lsb0>) {
        self.ir = bits::to_int(ir) as u32;
    }

    fn capture_dr(&mut self) -> Bits {
        match self.ir {
            IR_IDCODE => bits::from_int(0x0000_1047, 32),
            IR_STATUS => bits::from_int(if self.txn_ready { 0b0100 } else { 0 }, 4),
            IR_ADDRESS => bits::from_int(self.address as u64, 32),
            IR_DATA => bits::from_int(self.data as u64, 32),
            IR_TXN_COMMAND => bits::from_int(self.txn as u64, 4),
            IR_RESET_TEST => bits::from_int(0, 32),
            _ => bits::from_int(0, 1), // bypass
        }
    }

    fn update_dr(&mut self, dr: &BitSlice<u8, Lsb0>) {
        match self.ir {
            IR_ADDRESS => self.address = bits::to_int(dr) as u32,
            IR_DATA => self.data = bits::to_int(dr) as u32,
            IR_TXN_COMMAND => {
                self.txn = bits::to_int(dr) as u32;
                self.txn_armed = true;
                self.txn_ready = false;
            }
            IR_RESET_TEST => {
                let value = bits::to_int(dr) as u32;
                self.state.borrow_mut().reset_test_writes.push(value);
            }
            _ => {}
        }
    }

    fn tick_idle(&mut self) {
        // The read/write access defined by the address, data and command
        // registers occurs once on entry to Run-Test/Idle.
        if !self.txn_armed {
            return;
        }
        self.txn_armed = false;
        let mut state = self.state.borrow_mut();
        match self.txn {
            0b0100 => self.data = state.mem_read(self.address),
            0b0000 => state.mem_write(self.address, self.data),
            0b0110 => self.data = *state.aux.get(&self.address).unwrap_or(&0),
            0b0010 => {
                state.aux.insert(self.address, self.data);
            }
            txn => panic!("unimplemented ARC transaction {txn:#06b}"),
        }
        self.txn_ready = true;
    }
}

fn attach(state: Rc<RefCell<McState>>) -> Mec16xx {
    let pipe = TapChainPipe::new(vec![Box::new(ArcTap::new(state))]);
    let jtag = TapController::new(Sequencer::new(Box::new(pipe)));
    let tap = jtag.select_tap(0, None).unwrap();
    Mec16xx::new(ArcDebug::new(tap)).unwrap()
}

#[test]
fn attach_halts_the_core() {
    let state = Rc::new(RefCell::new(McState::new()));
    let _mec = attach(state.clone());
    // STATUS32.H was written through the aux space.
    assert_eq!(state.borrow().aux.get(&0x0a), Some(&1));
}

#[test]
fn flash_program_and_read_back() {
    let state = Rc::new(RefCell::new(McState::new()));
    let mut mec = attach(state.clone());

    mec.enable_flash_access(true).unwrap();
    mec.program_flash(0x100, &[0x0102_0304, 0x0506_0708]).unwrap();
    let words = mec.read_flash(0x100, 2).unwrap();
    assert_eq!(words, vec![0x0102_0304, 0x0506_0708]);
    mec.enable_flash_access(false).unwrap();
}

#[test]
fn glitched_flash_read_is_corrected_by_majority() {
    let state = Rc::new(RefCell::new(McState::new()));
    let mut mec = attach(state.clone());

    mec.enable_flash_access(true).unwrap();
    mec.program_flash(0x40, &[0xa5a5_a5a5]).unwrap();
    state.borrow_mut().glitch_at = Some(0x40);
    let words = mec.read_flash(0x40, 1).unwrap();
    assert_eq!(words, vec![0xa5a5_a5a5]);
}

#[test]
fn erase_flash_clears_the_array() {
    let state = Rc::new(RefCell::new(McState::new()));
    let mut mec = attach(state.clone());

    mec.enable_flash_access(true).unwrap();
    mec.program_flash(0, &[0x1111_1111]).unwrap();
    mec.erase_flash(FLASH_ERASE_ALL_ADDR).unwrap();
    let words = mec.read_flash(0, 1).unwrap();
    assert_eq!(words, vec![0xffff_ffff]);
}

#[test]
fn blocked_eeprom_is_rejected_until_unlocked() {
    let state = Rc::new(RefCell::new(McState::new()));
    state.borrow_mut().eeprom_blocked = true;
    let mut mec = attach(state.clone());

    let error = mec.read_eeprom(0, 16).unwrap_err();
    assert!(matches!(error, Mec16xxError::EepromBlocked));

    mec.unlock_eeprom(EEPROM_PASSWORD).unwrap();
    mec.erase_eeprom(EEPROM_ERASE_ALL_ADDR).unwrap();
    mec.program_eeprom(0x10, b"fathom").unwrap();
    let data = mec.read_eeprom(0x10, 6).unwrap();
    assert_eq!(data, b"fathom".to_vec());
}

#[test]
fn wrong_eeprom_password_keeps_the_block() {
    let state = Rc::new(RefCell::new(McState::new()));
    state.borrow_mut().eeprom_blocked = true;
    let mut mec = attach(state.clone());

    let error = mec.unlock_eeprom(0x0bad_0bad).unwrap_err();
    assert!(matches!(error, Mec16xxError::EepromUnlockFailed));
}

#[test]
fn emergency_erase_drives_the_reset_test_sequence() {
    let state = Rc::new(RefCell::new(McState::new()));
    let mut mec = attach(state.clone());

    mec.emergency_flash_erase().unwrap();
    // POR_EN; +VTR_POR; +ME; -VTR_POR.
    assert_eq!(
        state.borrow().reset_test_writes,
        vec![0b1000, 0b1100, 0b1101, 0b1001]
    );
}

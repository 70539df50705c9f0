//! EJTAG debug engine exercised against a miniature MIPS CPU model.
//!
//! The model implements the EJTAG TAP registers and enough of the MIPS I
//! instruction set to execute the PrAcc sequences the engine generates:
//! every dmseg fetch, load and store is routed back through the CONTROL/
//! ADDRESS/DATA handshake, exactly as on hardware.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bitvec::prelude::*;

use fathom::architecture::mips::{EjtagDebug, EjtagState};
use fathom::jtag::TapController;
use fathom::probe::fake::{TapChainPipe, TapModel};
use fathom::probe::sequencer::Sequencer;
use fathom::probe::TransportError;
use fathom::util::bits::{self, Bits};
use fathom::util::Endianness;

use pretty_assertions::assert_eq;

const IR_IDCODE: u32 = 0b00001;
const IR_IMPCODE: u32 = 0b00011;
const IR_ADDRESS: u32 = 0b01000;
const IR_DATA: u32 = 0b01001;
const IR_CONTROL: u32 = 0b01010;

const DMSEG_VECTOR: u32 = 0xff20_0200;

#[derive(Clone, Copy, Debug)]
enum Access {
    Fetch(u32),
    Load { address: u32, rt: u32, byte: bool },
    Store { address: u32, value: u32 },
}

#[derive(Default)]
struct CpuState {
    regs: [u32; 32],
    hi: u32,
    lo: u32,
    cp0: HashMap<(u32, u32), u32>,
    memory: HashMap<u32, u8>,
    drseg: HashMap<u32, u32>,
    dm: bool,
    pc: u32,
    branch: Option<u32>,
    pending: Option<Access>,
}

impl CpuState {
    fn reg(&self, index: u32) -> u32 {
        self.regs[index as usize]
    }

    fn set_reg(&mut self, index: u32, value: u32) {
        if index != 0 {
            self.regs[index as usize] = value;
        }
    }

    fn is_dmseg(address: u32) -> bool {
        address & 0xfff0_0000 == 0xff20_0000
    }

    fn is_drseg(address: u32) -> bool {
        address & 0xfff0_0000 == 0xff30_0000
    }

    fn ram_word(&self, address: u32) -> u32 {
        // The model is big-endian, matching the engine configuration below.
        (0..4).fold(0, |word, offset| {
            (word << 8) | *self.memory.get(&(address + offset)).unwrap_or(&0) as u32
        })
    }

    fn set_ram_word(&mut self, address: u32, value: u32) {
        for offset in 0..4 {
            self.memory
                .insert(address + offset, (value >> (8 * (3 - offset))) as u8);
        }
    }

    /// Makes sure a processor access is pending whenever the CPU is in debug
    /// mode and not stalled on one already.
    fn step(&mut self) {
        if self.dm && self.pending.is_none() {
            self.pending = Some(Access::Fetch(self.pc));
        }
    }

    /// Completes the pending access; `input` carries the word the probe
    /// provided for fetches and loads.
    fn complete(&mut self, input: u32) {
        match self.pending.take().expect("an access must be pending") {
            Access::Fetch(_) => self.execute(input),
            Access::Load { rt, byte, .. } => {
                self.set_reg(rt, if byte { input & 0xff } else { input });
            }
            Access::Store { .. } => {}
        }
        self.step();
    }

    fn execute(&mut self, insn: u32) {
        let taken_branch = self.branch.take();

        let opcode = insn >> 26;
        let rs = (insn >> 21) & 0x1f;
        let rt = (insn >> 16) & 0x1f;
        let rd = (insn >> 11) & 0x1f;
        let imm = insn & 0xffff;
        let simm = imm as u16 as i16 as i32;

        let next_pc = taken_branch.unwrap_or(self.pc.wrapping_add(4));

        match opcode {
            // SPECIAL
            0x00 if insn == 0 => {} // nop
            0x00 => match insn & 0x3f {
                0x25 => self.set_reg(rd, self.reg(rs) | self.reg(rt)), // or
                0x10 => self.set_reg(rd, self.hi),                     // mfhi
                0x12 => self.set_reg(rd, self.lo),                     // mflo
                0x11 => self.hi = self.reg(rs),                        // mthi
                0x13 => self.lo = self.reg(rs),                        // mtlo
                0x0f => {}                                             // sync
                funct => panic!("unimplemented SPECIAL function {funct:#04x}"),
            },
            // REGIMM (synci)
            0x01 => {}
            // beq $0, $0 (b)
            0x04 => {
                if self.reg(rs) == self.reg(rt) {
                    self.branch = Some(self.pc.wrapping_add(4).wrapping_add((simm << 2) as u32));
                }
            }
            // bgtz
            0x07 => {
                if self.reg(rs) as i32 > 0 {
                    self.branch = Some(self.pc.wrapping_add(4).wrapping_add((simm << 2) as u32));
                }
            }
            // addi
            0x08 => self.set_reg(rt, (self.reg(rs) as i32).wrapping_add(simm) as u32),
            // ori
            0x0d => self.set_reg(rt, self.reg(rs) | imm),
            // xori
            0x0e => self.set_reg(rt, self.reg(rs) ^ imm),
            // lui
            0x0f => self.set_reg(rt, imm << 16),
            // COP0
            0x10 => {
                if insn == 0x4200_001f {
                    // deret: leave debug mode and resume at DEPC
                    self.dm = false;
                    self.pc = *self.cp0.get(&(24, 0)).unwrap_or(&0);
                    self.branch = None;
                    return;
                }
                let sel = insn & 0x7;
                match rs {
                    0x00 => {
                        let value = *self.cp0.get(&(rd, sel)).unwrap_or(&0);
                        self.set_reg(rt, value); // mfc0
                    }
                    0x04 => {
                        let value = self.reg(rt);
                        self.cp0.insert((rd, sel), value); // mtc0
                    }
                    op => panic!("unimplemented COP0 op {op:#04x}"),
                }
            }
            // lw / lbu
            0x23 | 0x24 => {
                let address = self.reg(rs).wrapping_add(simm as u32);
                let byte = opcode == 0x24;
                if Self::is_dmseg(address) {
                    self.pending = Some(Access::Load { address, rt, byte });
                } else if Self::is_drseg(address) {
                    let value = *self.drseg.get(&address).unwrap_or(&0);
                    self.set_reg(rt, value);
                } else if byte {
                    let value = *self.memory.get(&address).unwrap_or(&0) as u32;
                    self.set_reg(rt, value);
                } else {
                    let value = self.ram_word(address);
                    self.set_reg(rt, value);
                }
            }
            // sw / sb
            0x2b | 0x28 => {
                let address = self.reg(rs).wrapping_add(simm as u32);
                let byte = opcode == 0x28;
                let value = self.reg(rt);
                if Self::is_dmseg(address) {
                    self.pending = Some(Access::Store { address, value });
                } else if Self::is_drseg(address) {
                    self.drseg.insert(address, value);
                } else if byte {
                    self.memory.insert(address, value as u8);
                } else {
                    self.set_ram_word(address, value);
                }
            }
            // cache
            0x2f => {}
            _ => panic!("unimplemented opcode {opcode:#04x} in {insn:#010x}"),
        }

        // A branch scheduled by this instruction takes effect after its delay
        // slot at next_pc executes.
        self.pc = next_pc;
    }
}

struct EjtagTap {
    state: Rc<RefCell<CpuState>>,
    ir: u32,
    idcode: u32,
    impcode: u32,
    prob_en: bool,
    prob_trap: bool,
    data_reg: u32,
}

impl EjtagTap {
    fn new() -> (Self, Rc<RefCell<CpuState>>) {
        let mut cpu = CpuState::default();
        // MIPS32 R1, big endian, everything uncached; EJTAG 2.5; two
        // instruction breakpoints.
        cpu.cp0
            .insert((16, 0), 2 | 1 << 15 | 2 << 25 | 2 << 28);
        cpu.drseg.insert(0xff30_1000, 2 << 24);
        let state = Rc::new(RefCell::new(cpu));
        let tap = EjtagTap {
            state: state.clone(),
            ir: IR_IDCODE,
            idcode: 0x0000_1047,
            impcode: 1 << 29, // EJTAG 2.5, MIPS32
            prob_en: false,
            prob_trap: false,
            data_reg: 0,
        };
        (tap, state)
    }
}

impl TapModel for EjtagTap {
    fn ir_length(&self) -> usize {
        5
    }

    fn reset(&mut self) {
        self.ir = IR_IDCODE;
    }

    fn update_ir(&mut self, ir: &BitSlice<u8, Lsb0>) {
        self.ir = bits::to_int(ir) as u32;
    }

    fn capture_dr(&mut self) -> Bits {
        let cpu = self.state.borrow();
        match self.ir {
            IR_IDCODE => bits::from_int(self.idcode as u64, 32),
            IR_IMPCODE => bits::from_int(self.impcode as u64, 32),
            IR_ADDRESS => {
                let address = match cpu.pending {
                    Some(Access::Fetch(address)) => address,
                    Some(Access::Load { address, .. }) => address,
                    Some(Access::Store { address, .. }) => address,
                    None => 0,
                };
                bits::from_int(address as u64, 32)
            }
            IR_DATA => {
                let value = match cpu.pending {
                    Some(Access::Store { value, .. }) => value,
                    _ => self.data_reg,
                };
                bits::from_int(value as u64, 32)
            }
            IR_CONTROL => {
                let mut control: u32 = 0;
                control |= (cpu.dm as u32) << 3;
                control |= (self.prob_trap as u32) << 14;
                control |= (self.prob_en as u32) << 15;
                control |= (cpu.pending.is_some() as u32) << 18;
                control |= (matches!(cpu.pending, Some(Access::Store { .. })) as u32) << 19;
                bits::from_int(control as u64, 32)
            }
            _ => bits::from_int(0, 1), // bypass
        }
    }

    fn update_dr(&mut self, dr: &BitSlice<u8, Lsb0>) {
        match self.ir {
            IR_DATA => self.data_reg = bits::to_int(dr) as u32,
            IR_CONTROL => {
                let written = bits::to_int(dr) as u32;
                self.prob_trap = written & 1 << 14 != 0;
                self.prob_en = written & 1 << 15 != 0;
                let mut cpu = self.state.borrow_mut();
                if written & 1 << 12 != 0 && !cpu.dm {
                    // EjtagBrk: take a debug exception through the probe
                    // vector.
                    cpu.dm = true;
                    cpu.pc = DMSEG_VECTOR;
                    cpu.branch = None;
                    cpu.pending = None;
                    cpu.step();
                }
                if written & 1 << 18 == 0 && cpu.pending.is_some() {
                    // PrAcc cleared: the probe has serviced the access.
                    let input = self.data_reg;
                    cpu.complete(input);
                }
            }
            _ => {}
        }
    }
}

fn attach() -> (EjtagDebug, Rc<RefCell<CpuState>>) {
    let (tap_model, state) = EjtagTap::new();
    {
        let mut cpu = state.borrow_mut();
        for index in 1..32 {
            cpu.regs[index] = 0x1000_0000 + index as u32;
        }
        cpu.hi = 0x4848_4848;
        cpu.lo = 0x4c4c_4c4c;
        cpu.cp0.insert((12, 0), 0x1000_0083); // sr
        cpu.cp0.insert((8, 0), 0x8badf00d); // badvaddr
        cpu.cp0.insert((13, 0), 0x0000_0024); // cause
        cpu.cp0.insert((24, 0), 0x8000_1234); // depc
    }
    let pipe = TapChainPipe::new(vec![Box::new(tap_model)]);
    let jtag = TapController::new(Sequencer::new(Box::new(pipe)));
    let tap = jtag.select_tap(0, None).unwrap();
    let ejtag = EjtagDebug::new(tap, Endianness::Big).unwrap();
    (ejtag, state)
}

#[test]
fn attach_reports_running() {
    let (ejtag, _state) = attach();
    assert_eq!(ejtag.state(), EjtagState::Running);
    assert_eq!(ejtag.word_size(), 4);
}

#[test]
fn stop_and_read_registers() {
    let (mut ejtag, _state) = attach();
    ejtag.target_stop().unwrap();
    assert_eq!(ejtag.state(), EjtagState::Stopped);

    let registers = ejtag.target_get_registers().unwrap();
    assert_eq!(registers.len(), 38);
    assert_eq!(registers[0], 0);
    for index in 1..32 {
        assert_eq!(registers[index], 0x1000_0000 + index as u64, "r{index}");
    }
    assert_eq!(registers[32], 0x1000_0083); // sr
    assert_eq!(registers[33], 0x4c4c_4c4c); // lo
    assert_eq!(registers[34], 0x4848_4848); // hi
    assert_eq!(registers[35], 0x8badf00d); // bad
    assert_eq!(registers[36], 0x0000_0024); // cause
    assert_eq!(registers[37], 0x8000_1234); // pc
}

#[test]
fn memory_round_trip_leaves_other_memory_unchanged() {
    let (mut ejtag, state) = attach();
    state.borrow_mut().memory.insert(0x8000_0ffc, 0x77);
    ejtag.target_stop().unwrap();

    ejtag
        .target_write_memory(0x8000_1000, b"Hello, world!")
        .unwrap();
    let data = ejtag.target_read_memory(0x8000_1000, 13).unwrap();
    assert_eq!(data, b"Hello, world!".to_vec());

    // The byte before the written range is untouched.
    let data = ejtag.target_read_memory(0x8000_0ffc, 1).unwrap();
    assert_eq!(data, vec![0x77]);
}

#[test]
fn word_access_uses_target_endianness() {
    let (mut ejtag, state) = attach();
    ejtag.target_stop().unwrap();

    ejtag
        .target_write_memory(0x8000_2000, &[0x11, 0x22, 0x33, 0x44])
        .unwrap();
    // The model is big-endian: the most significant byte lands first.
    assert_eq!(state.borrow().ram_word(0x8000_2000), 0x1122_3344);

    let data = ejtag.target_read_memory(0x8000_2000, 4).unwrap();
    assert_eq!(data, vec![0x11, 0x22, 0x33, 0x44]);
}

#[test]
fn register_write_survives_round_trip() {
    let (mut ejtag, _state) = attach();
    ejtag.target_stop().unwrap();

    ejtag.target_set_register(7, 0xcafe_babe).unwrap();
    assert_eq!(ejtag.target_get_register(7).unwrap(), 0xcafe_babe);

    // Register 1 is special: it holds the dmseg data pointer during the
    // session and its true value lives in DESAVE.
    assert_eq!(ejtag.target_get_register(1).unwrap(), 0x1000_0001);
}

#[test]
fn hardware_breakpoints_use_drseg_registers() {
    let (mut ejtag, state) = attach();
    ejtag.target_stop().unwrap();

    ejtag.target_set_instr_breakpoint(0x8000_4000).unwrap();
    {
        let cpu = state.borrow();
        assert_eq!(cpu.drseg.get(&0xff30_1100), Some(&0x8000_4000)); // IBA0
        assert_eq!(cpu.drseg.get(&0xff30_1108), Some(&0)); // IBM0
        assert_eq!(cpu.drseg.get(&0xff30_1118), Some(&1)); // IBC0.BE
    }

    ejtag.target_clear_instr_breakpoint(0x8000_4000).unwrap();
    assert_eq!(state.borrow().drseg.get(&0xff30_1118), Some(&0));
}

#[test]
fn software_breakpoint_patches_and_restores_code() {
    let (mut ejtag, state) = attach();
    state.borrow_mut().set_ram_word(0x8000_5000, 0x2442_0001); // addiu v0, 1
    ejtag.target_stop().unwrap();

    ejtag.target_set_software_breakpoint(0x8000_5000).unwrap();
    assert_eq!(state.borrow().ram_word(0x8000_5000), 0x7000_003f); // sdbbp

    ejtag.target_clear_software_breakpoint(0x8000_5000).unwrap();
    assert_eq!(state.borrow().ram_word(0x8000_5000), 0x2442_0001);
}

#[test]
fn continue_can_be_interrupted() {
    let (mut ejtag, _state) = attach();
    ejtag.target_stop().unwrap();

    let mut polls = 0;
    let mut interrupt = move || -> Result<bool, TransportError> {
        polls += 1;
        Ok(polls >= 1)
    };
    ejtag.target_continue(&mut interrupt).unwrap();
    assert_eq!(ejtag.state(), EjtagState::Stopped);
}

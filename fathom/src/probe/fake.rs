//! In-memory probe simulators used by tests.
//!
//! These speak the same wire protocols as the real probe gateware, so the
//! protocol clients and everything layered above them can be exercised
//! without hardware. Enabled with the `test` feature.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitvec::prelude::*;

use crate::jtag::TapState;
use crate::probe::sequencer::{
    CMD_BIT_LAST, CMD_DELAY, CMD_DELAY_RUN_TCK, CMD_GET_AUX, CMD_RUN_TCK, CMD_SET_AUX,
    CMD_SHIFT_TDI, CMD_SHIFT_TDIO, CMD_SHIFT_TDO, CMD_SHIFT_TMS, CMD_SYNC,
};
use crate::probe::{BytePipe, TransportError};
use crate::util::bits::{self, Bits};

// Mock pipe

#[derive(Default)]
struct MockPipeState {
    sent: Vec<u8>,
    responses: VecDeque<u8>,
}

/// A pipe that records everything sent and plays back canned responses.
pub struct MockPipe {
    state: Rc<RefCell<MockPipeState>>,
}

/// Inspection handle for a [`MockPipe`].
pub struct MockPipeHandle {
    state: Rc<RefCell<MockPipeState>>,
}

impl MockPipe {
    /// Creates a mock pipe and its inspection handle.
    pub fn new() -> (MockPipe, MockPipeHandle) {
        let state = Rc::new(RefCell::new(MockPipeState::default()));
        (
            MockPipe {
                state: state.clone(),
            },
            MockPipeHandle { state },
        )
    }
}

impl MockPipeHandle {
    /// All bytes sent into the pipe so far.
    pub fn sent(&self) -> Vec<u8> {
        self.state.borrow().sent.clone()
    }

    /// Clears the sent-byte record.
    pub fn clear_sent(&self) {
        self.state.borrow_mut().sent.clear();
    }

    /// Queues response bytes for subsequent receives.
    pub fn respond(&self, bytes: &[u8]) {
        self.state.borrow_mut().responses.extend(bytes);
    }
}

impl BytePipe for MockPipe {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.state.borrow_mut().sent.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.responses.len() < size {
            return Err(TransportError::Eof);
        }
        Ok(state.responses.drain(..size).collect())
    }

    fn recv_poll(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.responses.len() < size {
            return Ok(None);
        }
        Ok(Some(state.responses.drain(..size).collect()))
    }
}

// TAP chain simulator

/// Behavior of a single simulated TAP.
///
/// The chain simulator handles the state machine and shifting; models provide
/// the capture and update semantics of their IR and DR.
pub trait TapModel {
    /// Length of this TAP's instruction register.
    fn ir_length(&self) -> usize;

    /// Called when the TAP enters Test-Logic-Reset.
    fn reset(&mut self);

    /// Value loaded into the IR on Capture-IR. Must begin with the bits `1, 0`
    /// as required by IEEE 1149.1.
    fn capture_ir(&mut self) -> Bits {
        let mut value = bits::zeros(self.ir_length());
        value.set(0, true);
        value
    }

    /// Called when a new instruction is latched on Update-IR.
    fn update_ir(&mut self, ir: &BitSlice<u8, Lsb0>);

    /// Value loaded into the DR on Capture-DR; its length defines the DR
    /// length for this scan.
    fn capture_dr(&mut self) -> Bits;

    /// Called when new DR contents are latched on Update-DR.
    fn update_dr(&mut self, dr: &BitSlice<u8, Lsb0>);

    /// Called once per TCK cycle spent in Run-Test/Idle.
    fn tick_idle(&mut self) {}
}

/// A TAP with an IDCODE register and BYPASS, and no other data registers.
pub struct IdcodeTap {
    ir_length: usize,
    idcode: Option<u32>,
    idcode_selected: bool,
}

impl IdcodeTap {
    /// Creates a TAP that captures `idcode` after reset, or one that boots
    /// into BYPASS when `idcode` is `None`.
    pub fn new(ir_length: usize, idcode: Option<u32>) -> Self {
        IdcodeTap {
            ir_length,
            idcode,
            idcode_selected: idcode.is_some(),
        }
    }
}

impl TapModel for IdcodeTap {
    fn ir_length(&self) -> usize {
        self.ir_length
    }

    fn reset(&mut self) {
        self.idcode_selected = self.idcode.is_some();
    }

    fn update_ir(&mut self, _ir: &BitSlice<u8, Lsb0>) {
        // Any instruction written by a scan deselects IDCODE; the simulator
        // does not decode instructions beyond that.
        self.idcode_selected = false;
    }

    fn capture_dr(&mut self) -> Bits {
        match (self.idcode_selected, self.idcode) {
            (true, Some(idcode)) => bits::from_int(idcode as u64, 32),
            _ => bits::zeros(1),
        }
    }

    fn update_dr(&mut self, _dr: &BitSlice<u8, Lsb0>) {}
}

/// A software model of a JTAG scan chain behind the sequencer protocol.
///
/// TAP #0 is the device closest to TDO: its bits are shifted out first.
pub struct TapChainPipe {
    state: TapState,
    taps: Vec<Box<dyn TapModel>>,
    ir_chain: Bits,
    dr_chain: Bits,
    dr_lengths: Vec<usize>,
    aux: u8,

    in_buffer: Vec<u8>,
    out_queue: VecDeque<u8>,
}

impl TapChainPipe {
    /// Creates a chain from the given TAP models, starting in
    /// Test-Logic-Reset.
    pub fn new(mut taps: Vec<Box<dyn TapModel>>) -> Self {
        for tap in &mut taps {
            tap.reset();
        }
        TapChainPipe {
            state: TapState::TestLogicReset,
            taps,
            ir_chain: Bits::new(),
            dr_chain: Bits::new(),
            dr_lengths: Vec::new(),
            aux: 0,
            in_buffer: Vec::new(),
            out_queue: VecDeque::new(),
        }
    }

    /// Access to a TAP model, for inspection from tests.
    pub fn tap_mut(&mut self, index: usize) -> &mut dyn TapModel {
        &mut *self.taps[index]
    }

    fn shift(chain: &mut Bits, tdi: bool) -> bool {
        if chain.is_empty() {
            return tdi;
        }
        let tdo = chain[0];
        chain.remove(0);
        chain.push(tdi);
        tdo
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> bool {
        let mut tdo = true;
        match self.state {
            TapState::CaptureIr => {
                self.ir_chain = Bits::new();
                for tap in &mut self.taps {
                    self.ir_chain.extend_from_bitslice(&tap.capture_ir());
                }
            }
            TapState::CaptureDr => {
                self.dr_chain = Bits::new();
                self.dr_lengths.clear();
                for tap in &mut self.taps {
                    let captured = tap.capture_dr();
                    self.dr_lengths.push(captured.len());
                    self.dr_chain.extend_from_bitslice(&captured);
                }
            }
            TapState::ShiftIr => tdo = Self::shift(&mut self.ir_chain, tdi),
            TapState::ShiftDr => tdo = Self::shift(&mut self.dr_chain, tdi),
            TapState::RunTestIdle => {
                for tap in &mut self.taps {
                    tap.tick_idle();
                }
            }
            _ => {}
        }

        self.state = self.state.step(tms).expect("simulated TAP state is known");

        match self.state {
            TapState::TestLogicReset => {
                for tap in &mut self.taps {
                    tap.reset();
                }
            }
            TapState::UpdateIr => {
                let mut offset = 0;
                let chain = std::mem::take(&mut self.ir_chain);
                for tap in &mut self.taps {
                    let length = tap.ir_length();
                    tap.update_ir(&chain[offset..offset + length]);
                    offset += length;
                }
                self.ir_chain = chain;
            }
            TapState::UpdateDr => {
                let mut offset = 0;
                let chain = std::mem::take(&mut self.dr_chain);
                for (tap, &length) in self.taps.iter_mut().zip(&self.dr_lengths) {
                    tap.update_dr(&chain[offset..offset + length]);
                    offset += length;
                }
                self.dr_chain = chain;
            }
            _ => {}
        }

        tdo
    }

    fn process(&mut self) {
        loop {
            let Some(&header) = self.in_buffer.first() else {
                return;
            };
            let cmd = header & 0xf;
            let last = header & CMD_BIT_LAST != 0;

            let (count, mut consumed) = match cmd {
                CMD_SYNC | CMD_GET_AUX => (0, 1),
                CMD_SET_AUX => {
                    if self.in_buffer.len() < 2 {
                        return;
                    }
                    (0, 2)
                }
                _ => {
                    if self.in_buffer.len() < 3 {
                        return;
                    }
                    let count =
                        u16::from_le_bytes([self.in_buffer[1], self.in_buffer[2]]) as usize;
                    (count, 3)
                }
            };

            let payload_bytes = match cmd {
                CMD_SHIFT_TMS | CMD_SHIFT_TDI | CMD_SHIFT_TDIO => count.div_ceil(8),
                _ => 0,
            };
            if self.in_buffer.len() < consumed + payload_bytes {
                return;
            }
            let payload =
                bits::from_bytes(&self.in_buffer[consumed..consumed + payload_bytes], count);
            consumed += payload_bytes;

            match cmd {
                CMD_RUN_TCK | CMD_DELAY_RUN_TCK => {
                    for index in 0..count {
                        let tms = last && cmd == CMD_RUN_TCK && index == count - 1;
                        self.clock(tms, true);
                    }
                }
                CMD_SHIFT_TMS => {
                    for tms in payload.iter().by_vals() {
                        self.clock(tms, true);
                    }
                }
                CMD_SHIFT_TDI => {
                    for (index, tdi) in payload.iter().by_vals().enumerate() {
                        let tms = last && index == count - 1;
                        self.clock(tms, tdi);
                    }
                }
                CMD_SHIFT_TDO => {
                    let mut tdo = Bits::new();
                    for index in 0..count {
                        let tms = last && index == count - 1;
                        tdo.push(self.clock(tms, true));
                    }
                    self.out_queue.extend(bits::to_bytes(&tdo));
                }
                CMD_SHIFT_TDIO => {
                    let mut tdo = Bits::new();
                    for (index, tdi) in payload.iter().by_vals().enumerate() {
                        let tms = last && index == count - 1;
                        tdo.push(self.clock(tms, tdi));
                    }
                    self.out_queue.extend(bits::to_bytes(&tdo));
                }
                CMD_SYNC => self.out_queue.push_back(0),
                CMD_DELAY => {}
                CMD_GET_AUX => self.out_queue.push_back(self.aux),
                CMD_SET_AUX => self.aux = self.in_buffer[1],
                _ => panic!("unknown sequencer command {cmd:#x}"),
            }

            self.in_buffer.drain(..consumed);
        }
    }
}

impl BytePipe for TapChainPipe {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.in_buffer.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.process();
        Ok(())
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        self.process();
        if self.out_queue.len() < size {
            return Err(TransportError::Desynchronized(
                "simulated TAP chain has no response bytes pending",
            ));
        }
        Ok(self.out_queue.drain(..size).collect())
    }

    fn recv_poll(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError> {
        self.process();
        if self.out_queue.len() < size {
            return Ok(None);
        }
        Ok(Some(self.out_queue.drain(..size).collect()))
    }
}

// 25-series flash simulator

const QSPI_CMD_SELECT: u8 = 0;
const QSPI_CMD_TRANSFER: u8 = 1;
const QSPI_CMD_DELAY: u8 = 2;
const QSPI_CMD_SYNC: u8 = 3;

/// A 25-series SPI flash model behind the QSPI controller protocol.
///
/// The model is instantaneous: erase and program operations complete by the
/// time the status register can be read.
pub struct QspiFlashPipe {
    memory: Vec<u8>,
    sfdp: Vec<u8>,
    device_id: u8,
    manufacturer_id: u8,

    write_enabled: bool,
    selected: bool,
    opcode: Option<u8>,
    address: u32,
    byte_index: usize,
    dummy_cycles: usize,

    in_buffer: Vec<u8>,
    out_queue: VecDeque<u8>,
}

impl QspiFlashPipe {
    /// Creates a flash model of `size` bytes, fully erased.
    pub fn new(size: usize) -> Self {
        QspiFlashPipe {
            memory: vec![0xff; size],
            sfdp: Vec::new(),
            device_id: 0x14,
            manufacturer_id: 0xc2,
            write_enabled: false,
            selected: false,
            opcode: None,
            address: 0,
            byte_index: 0,
            dummy_cycles: 0,
            in_buffer: Vec::new(),
            out_queue: VecDeque::new(),
        }
    }

    /// Installs an SFDP image served via command 5Ah.
    pub fn set_sfdp(&mut self, sfdp: Vec<u8>) {
        self.sfdp = sfdp;
    }

    /// Direct access to the flash array, for seeding and inspection.
    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    fn mem(&self, address: u32) -> u8 {
        self.memory[address as usize % self.memory.len()]
    }

    fn clock_octet(&mut self, input: Option<u8>) -> u8 {
        if !self.selected {
            return 0xff;
        }
        let index = self.byte_index;
        self.byte_index += 1;
        if index == 0 {
            self.opcode = input;
            return 0xff;
        }
        let input_byte = input.unwrap_or(0xff);
        match self.opcode {
            // READ STATUS
            Some(0x05) => u8::from(self.write_enabled) << 1,
            // READ, plus commands that take a 24-bit address
            Some(0x03) | Some(0x02) | Some(0x20) | Some(0x52) | Some(0x0b) | Some(0x5a)
                if index <= 3 =>
            {
                self.address = (self.address << 8) | input_byte as u32;
                0xff
            }
            Some(0x03) => {
                let data = self.mem(self.address);
                self.address = self.address.wrapping_add(1);
                data
            }
            // FAST READ, one dummy byte after the address
            Some(0x0b) => {
                if index == 4 {
                    0xff
                } else {
                    let data = self.mem(self.address);
                    self.address = self.address.wrapping_add(1);
                    data
                }
            }
            // READ SFDP, one dummy byte after the address
            Some(0x5a) => {
                if index == 4 || self.sfdp.is_empty() {
                    0xff
                } else {
                    let data = self.sfdp[self.address as usize % self.sfdp.len()];
                    self.address = self.address.wrapping_add(1);
                    data
                }
            }
            // PAGE PROGRAM: flash can only clear bits, and wraps within a page
            Some(0x02) => {
                if self.write_enabled {
                    let page = self.address & !0xff;
                    let offset = (self.address & 0xff) as usize + (index - 4);
                    let address = (page | (offset % 0x100) as u32) as usize % self.memory.len();
                    self.memory[address] &= input_byte;
                }
                0xff
            }
            // READ MANUFACTURER/DEVICE ID
            Some(0x90) => match index {
                1..=3 => 0xff,
                _ if (index - 4) % 2 == 0 => self.manufacturer_id,
                _ => self.device_id,
            },
            // READ JEDEC ID
            Some(0x9f) => match index {
                1 => self.manufacturer_id,
                2 => 0x20,
                _ => self.device_id,
            },
            // READ DEVICE ID (also releases deep sleep)
            Some(0xab) => {
                if index <= 3 {
                    0xff
                } else {
                    self.device_id
                }
            }
            _ => 0xff,
        }
    }

    fn deselect(&mut self) {
        match self.opcode {
            Some(0x06) => self.write_enabled = true,
            Some(0x04) => self.write_enabled = false,
            Some(0x02) => self.write_enabled = false,
            Some(0x20) if self.write_enabled => {
                let base = (self.address as usize & !0xfff) % self.memory.len();
                self.memory[base..base + 0x1000].fill(0xff);
                self.write_enabled = false;
            }
            Some(0x52) if self.write_enabled => {
                let base = (self.address as usize & !0x7fff) % self.memory.len();
                self.memory[base..base + 0x8000].fill(0xff);
                self.write_enabled = false;
            }
            Some(0x60) if self.write_enabled => {
                self.memory.fill(0xff);
                self.write_enabled = false;
            }
            _ => {}
        }
        self.selected = false;
        self.opcode = None;
        self.address = 0;
        self.byte_index = 0;
        self.dummy_cycles = 0;
    }

    fn process(&mut self) {
        loop {
            let Some(&header) = self.in_buffer.first() else {
                return;
            };
            let cmd = header >> 4;
            let arg = header & 0xf;

            match cmd {
                QSPI_CMD_SELECT => {
                    if arg == 0 {
                        self.deselect();
                    } else {
                        self.selected = true;
                        self.byte_index = 0;
                    }
                    self.in_buffer.drain(..1);
                }
                QSPI_CMD_SYNC => {
                    self.out_queue.push_back(0);
                    self.in_buffer.drain(..1);
                }
                QSPI_CMD_DELAY => {
                    if self.in_buffer.len() < 3 {
                        return;
                    }
                    self.in_buffer.drain(..3);
                }
                QSPI_CMD_TRANSFER => {
                    if self.in_buffer.len() < 3 {
                        return;
                    }
                    let count =
                        u16::from_le_bytes([self.in_buffer[1], self.in_buffer[2]]) as usize;
                    match arg {
                        // Dummy: counted in cycles; whole octets advance the device
                        0 => {
                            self.dummy_cycles += count;
                            while self.dummy_cycles >= 8 {
                                self.dummy_cycles -= 8;
                                self.clock_octet(None);
                            }
                            self.in_buffer.drain(..3);
                        }
                        // Put modes
                        1 | 3 | 5 => {
                            if self.in_buffer.len() < 3 + count {
                                return;
                            }
                            for offset in 0..count {
                                let byte = self.in_buffer[3 + offset];
                                self.clock_octet(Some(byte));
                            }
                            self.in_buffer.drain(..3 + count);
                        }
                        // Get modes
                        2 | 4 | 6 => {
                            for _ in 0..count {
                                let byte = self.clock_octet(None);
                                self.out_queue.push_back(byte);
                            }
                            self.in_buffer.drain(..3);
                        }
                        // Swap
                        7 => {
                            if self.in_buffer.len() < 3 + count {
                                return;
                            }
                            for offset in 0..count {
                                let byte = self.in_buffer[3 + offset];
                                let response = self.clock_octet(Some(byte));
                                self.out_queue.push_back(response);
                            }
                            self.in_buffer.drain(..3 + count);
                        }
                        _ => panic!("unknown QSPI transfer mode {arg}"),
                    }
                }
                _ => panic!("unknown QSPI command {cmd:#x}"),
            }
        }
    }
}

impl BytePipe for QspiFlashPipe {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.in_buffer.extend_from_slice(data);
        self.process();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.process();
        Ok(())
    }

    fn recv(&mut self, size: usize) -> Result<Vec<u8>, TransportError> {
        self.process();
        if self.out_queue.len() < size {
            return Err(TransportError::Desynchronized(
                "simulated flash has no response bytes pending",
            ));
        }
        Ok(self.out_queue.drain(..size).collect())
    }

    fn recv_poll(&mut self, size: usize) -> Result<Option<Vec<u8>>, TransportError> {
        self.process();
        if self.out_queue.len() < size {
            return Ok(None);
        }
        Ok(Some(self.out_queue.drain(..size).collect()))
    }
}

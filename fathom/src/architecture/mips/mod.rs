//! MIPS EJTAG debug engine.
//!
//! The probe communicates with the target CPU through `dmseg`, a reserved
//! region of the virtual address space serviced by the debug probe: after a
//! debug exception with `ProbTrap` set, the CPU fetches its instructions from
//! the probe one word at a time (PrAcc handshake). The engine synthesizes a
//! small memory map inside `dmseg` (code, scratch and data areas) and runs
//! short instruction sequences through it to access registers and memory.

pub mod assembly;
pub mod ejtag;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::jtag::{JtagError, TapInterface};
use crate::probe::TransportError;
use crate::util::bits;
use crate::util::Endianness;

use assembly::{DERET, NOP, SDBBP, SYNC};
use ejtag::{
    cache_policy_name, Cp0Config, Cp0Config1, Cp0Debug, DrsegIbc, DrsegIbs, DrsegLayout,
    EjtagControl, Impcode, CACHE_POLICY_UNCACHED, CP0_BADVADDR, CP0_CAUSE, CP0_CONFIG,
    CP0_CONFIG1, CP0_DEBUG, CP0_DEPC, CP0_DESAVE, CP0_SR, DMSEG_ADDR, DMSEG_CODE_OFFSET,
    DMSEG_DATA_OFFSET, DMSEG_MASK, DMSEG_TEMP_OFFSET, DRSEG_DCR_ADDR, KSEG0_ADDR, KSEG1_ADDR,
    KSEG2_ADDR, KSEG3_ADDR, KSEGX_MASK, KUSEG_ADDR,
}; // register and segment definitions

/// Debug session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EjtagState {
    /// Target capabilities are being probed.
    Probe,
    /// The target is executing freely.
    Running,
    /// A debug exception is pending but the entry prologue has not run yet.
    Interrupted,
    /// A PrAcc instruction sequence is being serviced.
    PrAcc,
    /// The target is stopped inside the debug exception handler.
    Stopped,
}

impl std::fmt::Display for EjtagState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EjtagState::Probe => f.write_str("Probe"),
            EjtagState::Running => f.write_str("Running"),
            EjtagState::Interrupted => f.write_str("Interrupted"),
            EjtagState::PrAcc => f.write_str("PrAcc"),
            EjtagState::Stopped => f.write_str("Stopped"),
        }
    }
}

/// Errors produced by the EJTAG debug engine.
#[derive(Debug, thiserror::Error)]
pub enum EjtagError {
    /// An operation was attempted in the wrong session state.
    #[error("cannot {operation}: not in {expected} state")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// The state(s) the operation requires.
        expected: &'static str,
    },

    /// Rocc remained set across a CONTROL exchange.
    #[error("target has been unexpectedly reset")]
    TargetReset,

    /// The target was already in debug mode when probed.
    #[error("target already in debug mode")]
    AlreadyInDebugMode,

    /// ProbEn/ProbTrap did not latch.
    #[error("ProbTrap/ProbEn stuck low")]
    ProbeStuck,

    /// EjtagBrk did not cause a debug exception.
    #[error("failed to enter debug mode")]
    DebugInterruptFailed,

    /// A DMAAcc transfer never completed.
    #[error("DMAAcc: {operation} hang")]
    DmaHang {
        /// `"read"` or `"write"`.
        operation: &'static str,
    },

    /// A DMAAcc transfer reported an error.
    #[error("DMAAcc: {operation} error address={address:#010x} size={size}")]
    DmaError {
        /// `"read"` or `"write"`.
        operation: &'static str,
        /// The failing address.
        address: u64,
        /// Transfer size code.
        size: u8,
    },

    /// DM was low when a PrAcc sequence was started.
    #[error("Exec_PrAcc: DM low on entry")]
    PraccNotInDebugMode,

    /// PrAcc never went high while waiting for a processor access.
    #[error("Exec_PrAcc: PrAcc stuck low")]
    PraccStuck,

    /// The CPU accessed a dmseg address outside the synthetic memory map.
    #[error("Exec_PrAcc: address {address:#010x} out of range")]
    PraccAddressOutOfRange {
        /// The out-of-range address.
        address: u64,
    },

    /// The CPU attempted to write into the code area.
    #[error("Exec_PrAcc: write access to {area} at {address:#010x}")]
    PraccIllegalWrite {
        /// Name of the violated area.
        area: &'static str,
        /// The written address.
        address: u64,
    },

    /// A PrAcc sequence ran for more steps than the configured budget.
    #[error("Exec_PrAcc: step limit exceeded")]
    PraccStepLimit,

    /// CP0.Debug.NoSSt is set.
    #[error("target does not support single stepping")]
    NoSingleStep,

    /// All hardware breakpoint registers are in use.
    #[error("out of instruction breakpoint registers")]
    NoBreakpointSlots,

    /// The SDBBP instruction did not stick (e.g. the address is in ROM).
    #[error("software breakpoint at {address:#010x} did not stick")]
    BreakpointWriteFailed {
        /// Address of the breakpoint.
        address: u64,
    },

    /// The I-cache cannot be synchronized on this architecture release.
    #[error("cannot sync I-cache on unknown architecture release")]
    UnknownCacheSequence,

    /// A register number outside the GDB set was accessed.
    #[error("register {0} is not supported")]
    UnsupportedRegister(usize),

    /// The underlying TAP controller failed.
    #[error(transparent)]
    Jtag(#[from] JtagError),
}

/// Outcome of [`EjtagDebug::target_continue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The target took a debug exception (breakpoint or step).
    DebugException,
    /// The wait was cancelled and the target stopped on request.
    Interrupted,
}

const CONTROL_RETRIES: usize = 3;
const PRACC_STEP_BUDGET: usize = 1024;
const TEMP_AREA_WORDS: usize = 0x80;

/// MIPS EJTAG debug engine over a selected TAP.
pub struct EjtagDebug {
    tap: TapInterface,
    state: EjtagState,
    endian: Endianness,

    impcode: Impcode,
    control: EjtagControl,
    address_length: usize,
    drseg: DrsegLayout,
    /// Width of a target word in bits (32 or 64).
    word_bits: u32,
    /// Width of a target word in bytes.
    word_size: u32,
    mask: u64,

    pracc_probed: bool,
    cp0_config: Cp0Config,
    cp0_config1: Cp0Config1,
    cp0_debug: Cp0Debug,
    instr_breakpoints: Vec<Option<u64>>,
    soft_breakpoints: BTreeMap<u64, u32>,

    /// Maximum number of PrAcc accesses serviced per sequence.
    pub pracc_step_budget: usize,
}

impl EjtagDebug {
    /// Attaches to the CPU behind `tap`: reads IMPCODE, measures the ADDRESS
    /// register, enables the probe and leaves the target running.
    pub fn new(tap: TapInterface, endian: Endianness) -> Result<Self, EjtagError> {
        let mut this = EjtagDebug {
            tap,
            state: EjtagState::Probe,
            endian,
            impcode: Impcode(0),
            control: EjtagControl::default(),
            address_length: 32,
            drseg: DrsegLayout::new(0),
            word_bits: 32,
            word_size: 4,
            mask: 0xffff_ffff,
            pracc_probed: false,
            cp0_config: Cp0Config(0),
            cp0_config1: Cp0Config1(0),
            cp0_debug: Cp0Debug(0),
            instr_breakpoints: Vec::new(),
            soft_breakpoints: BTreeMap::new(),
            pracc_step_budget: PRACC_STEP_BUDGET,
        };
        this.probe()?;
        Ok(this)
    }

    /// The target byte order this engine was configured for.
    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// The current session state.
    pub fn state(&self) -> EjtagState {
        self.state
    }

    /// Whether the target is executing freely.
    pub fn is_running(&self) -> bool {
        self.state == EjtagState::Running
    }

    /// Width of a target word in bytes.
    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    /// Whether detaching requires cleanup (breakpoints or a stopped target).
    pub fn is_attached(&self) -> bool {
        !self.is_running()
            || self.instr_breakpoints.iter().any(Option::is_some)
            || !self.soft_breakpoints.is_empty()
    }

    fn check_state(
        &self,
        operation: &'static str,
        expected: &[EjtagState],
        name: &'static str,
    ) -> Result<(), EjtagError> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(EjtagError::InvalidState {
                operation,
                expected: name,
            })
        }
    }

    fn change_state(&mut self, state: EjtagState) {
        tracing::trace!("set state {state}");
        self.state = state;
    }

    // Low-level register manipulation

    fn read_impcode(&mut self) -> Result<(), EjtagError> {
        self.tap.write_ir(&ejtag::ir_impcode())?;
        let impcode_bits = self.tap.read_dr(32)?;
        self.impcode = Impcode(bits::to_int(&impcode_bits) as u32);
        tracing::debug!("read IMPCODE {:?}", self.impcode);
        Ok(())
    }

    fn exchange_control(
        &mut self,
        fields: impl FnOnce(&mut EjtagControl),
    ) -> Result<EjtagControl, EjtagError> {
        let mut control = self.control;
        control.set_pracc(true);
        if self.impcode.ejtag_ver() > 0 {
            // Some (but not all) EJTAG 1.x/2.0 cores implement Rocc
            // handshaking. It is ignored there, since on some cores Rocc
            // appears to be R/W, which breaks the handshaking mechanism.
            control.set_rocc(true);
        }
        fields(&mut control);

        tracing::trace!("write CONTROL {control:?}");
        self.tap.write_ir(&ejtag::ir_control())?;
        let control_bits = self
            .tap
            .exchange_dr(&bits::from_int(control.0 as u64, 32))?;
        let new_control = EjtagControl(bits::to_int(&control_bits) as u32);
        tracing::trace!("read CONTROL {new_control:?}");

        if self.impcode.ejtag_ver() > 0 && control.rocc() && new_control.rocc() {
            return Err(EjtagError::TargetReset);
        }
        Ok(new_control)
    }

    fn scan_address_length(&mut self) -> Result<(), EjtagError> {
        self.tap.write_ir(&ejtag::ir_address())?;
        self.address_length = self.tap.scan_dr_length(Some(64))?;
        tracing::debug!("scan ADDRESS length={}", self.address_length);
        Ok(())
    }

    fn read_address(&mut self) -> Result<u64, EjtagError> {
        self.tap.write_ir(&ejtag::ir_address())?;
        let mut address_bits = self.tap.read_dr(self.address_length)?;
        // The ADDRESS register omits the sign-extended upper bits.
        let sign = address_bits[self.address_length - 1];
        for _ in self.address_length..64 {
            address_bits.push(sign);
        }
        let address = bits::to_int(&address_bits) & self.mask;
        tracing::trace!("read ADDRESS {address:#x}");
        Ok(address)
    }

    fn write_address(&mut self, address: u64) -> Result<(), EjtagError> {
        // ADDRESS is only writable in EJTAG 1.x/2.0 with DMAAcc set.
        tracing::trace!("write ADDRESS {address:#x}");
        let address_bits = bits::from_int(address, self.address_length.min(64));
        self.tap.write_ir(&ejtag::ir_address())?;
        self.tap.write_dr(&address_bits)?;
        Ok(())
    }

    fn read_data(&mut self) -> Result<u64, EjtagError> {
        self.tap.write_ir(&ejtag::ir_data())?;
        let data_bits = self.tap.read_dr(self.word_bits as usize)?;
        let data = bits::to_int(&data_bits);
        tracing::trace!("read DATA {data:#x}");
        Ok(data)
    }

    fn write_data(&mut self, data: u64) -> Result<(), EjtagError> {
        tracing::trace!("write DATA {data:#x}");
        self.tap.write_ir(&ejtag::ir_data())?;
        self.tap
            .write_dr(&bits::from_int(data, self.word_bits as usize))?;
        Ok(())
    }

    // DMAAcc memory access (EJTAG 1.x/2.0 only; the only access mechanism
    // that works before the first debug entry there)

    fn dmaacc_read(&mut self, address: u64, size: u8) -> Result<u64, EjtagError> {
        tracing::debug!("DMAAcc: read address={address:#x} size={size}");
        // Make sure DMAAcc is set, or the ADDRESS register is not writable.
        self.exchange_control(|c| c.set_dmaacc(true))?;
        self.write_address(address)?;
        self.exchange_control(|c| {
            c.set_dmaacc(true);
            c.set_drwn(true);
            c.set_dsz(size);
            c.set_dstrt(true);
        })?;
        let mut control = None;
        for _ in 0..CONTROL_RETRIES {
            let read = self.exchange_control(|c| c.set_dmaacc(true))?;
            if !read.dstrt() {
                control = Some(read);
                break;
            }
        }
        let control = control.ok_or(EjtagError::DmaHang { operation: "read" })?;
        if control.derr() {
            return Err(EjtagError::DmaError {
                operation: "read",
                address,
                size,
            });
        }
        let data = self.read_data()?;
        tracing::debug!("DMAAcc: data={data:#x}");
        self.exchange_control(|c| c.set_dmaacc(false))?;
        Ok(data)
    }

    fn dmaacc_write(&mut self, address: u64, size: u8, data: u64) -> Result<(), EjtagError> {
        tracing::debug!("DMAAcc: write address={address:#x} size={size} data={data:#x}");
        self.exchange_control(|c| c.set_dmaacc(true))?;
        self.write_address(address)?;
        self.write_data(data)?;
        self.exchange_control(|c| {
            c.set_dmaacc(true);
            c.set_drwn(false);
            c.set_dsz(size);
            c.set_dstrt(true);
        })?;
        let mut control = None;
        for _ in 0..CONTROL_RETRIES {
            let read = self.exchange_control(|c| c.set_dmaacc(true))?;
            if !read.dstrt() {
                control = Some(read);
                break;
            }
        }
        let control = control.ok_or(EjtagError::DmaHang { operation: "write" })?;
        if control.derr() {
            return Err(EjtagError::DmaError {
                operation: "write",
                address,
                size,
            });
        }
        self.exchange_control(|c| c.set_dmaacc(false))?;
        Ok(())
    }

    // Probing

    fn probe(&mut self) -> Result<(), EjtagError> {
        self.check_state("probe", &[EjtagState::Probe], "Probe")?;

        self.read_impcode()?;
        tracing::info!("found CPU with IMPCODE={:#010x}", self.impcode.0);

        self.scan_address_length()?;

        self.word_bits = if self.impcode.mips32_64() { 64 } else { 32 };
        self.word_size = self.word_bits / 8;
        self.mask = if self.word_bits == 64 {
            u64::MAX
        } else {
            0xffff_ffff
        };
        self.drseg = DrsegLayout::new(self.impcode.ejtag_ver());

        tracing::info!(
            "found MIPS{} CPU {:#x} (EJTAG version {})",
            self.word_bits,
            self.impcode.type_info(),
            self.impcode.version_name(),
        );

        // Start by acknowledging any reset.
        let control = self.exchange_control(|c| c.set_rocc(false))?;
        if control.dm() {
            return Err(EjtagError::AlreadyInDebugMode);
        }

        if self.impcode.ejtag_ver() == 0 {
            tracing::warn!(
                "found cursed EJTAG 1.x/2.0 CPU, using undocumented DCR.MP bit to enable PrAcc"
            );
            // Disable memory protection for dmseg. The bit is documented as
            // NMIpend, but on EJTAG 1.x/2.0 it is actually MP. It can only be
            // cleared via DMAAcc, because PrAcc requires debug mode to
            // already work.
            let dcr = self.dmaacc_read(DRSEG_DCR_ADDR & self.mask, 2)?;
            self.dmaacc_write(DRSEG_DCR_ADDR & self.mask, 2, dcr & !(1 << 2))?;
        }

        // Enable the probe: the target fetches the debug handler from dmseg.
        self.control.set_prob_en(true);
        self.control.set_prob_trap(true);
        let mut latched = false;
        for _ in 0..CONTROL_RETRIES {
            let control = self.exchange_control(|_| ())?;
            if control.prob_en() && control.prob_trap() {
                latched = true;
                break;
            }
        }
        if !latched {
            return Err(EjtagError::ProbeStuck);
        }

        self.change_state(EjtagState::Running);
        Ok(())
    }

    // PrAcc state management

    fn ejtag_debug_interrupt(&mut self) -> Result<(), EjtagError> {
        self.check_state("assert debug interrupt", &[EjtagState::Running], "Running")?;
        self.exchange_control(|c| c.set_ejtagbrk(true))?;
        let control = self.exchange_control(|_| ())?;
        if control.ejtagbrk() {
            return Err(EjtagError::DebugInterruptFailed);
        }
        Ok(())
    }

    fn check_for_debug_interrupt(&mut self) -> Result<bool, EjtagError> {
        self.check_state(
            "check for debug interrupt",
            &[EjtagState::Running],
            "Running",
        )?;
        let control = self.exchange_control(|_| ())?;
        if control.dm() {
            self.change_state(EjtagState::Interrupted);
        }
        Ok(control.dm())
    }

    /// Services PrAcc accesses for one instruction sequence.
    ///
    /// The synthetic dmseg map has the code array at the debug exception
    /// vector, a scratch area, and the caller-provided data area. Servicing
    /// stops when the CPU fetches the first code word for the second time
    /// (the sequence branched back, entering `suspend_state`), when DM drops
    /// (the sequence executed DERET, entering Running), or when the step
    /// budget is exhausted.
    fn exec_pracc_bare(
        &mut self,
        code: &[u32],
        mut data: Vec<u64>,
        entry_state: EjtagState,
        entry_name: &'static str,
        suspend_state: EjtagState,
    ) -> Result<Vec<u64>, EjtagError> {
        self.check_state("execute PrAcc", &[entry_state], entry_name)?;
        self.change_state(EjtagState::PrAcc);

        let mut temp = [0u64; TEMP_AREA_WORDS];

        let code_beg = (DMSEG_ADDR + DMSEG_CODE_OFFSET) & self.mask;
        let code_end = code_beg + code.len() as u64 * 4;
        let temp_beg = (DMSEG_ADDR + DMSEG_TEMP_OFFSET) & self.mask;
        let temp_end = temp_beg + temp.len() as u64 * 4;
        let data_beg = (DMSEG_ADDR + DMSEG_DATA_OFFSET) & self.mask;
        let data_end = data_beg + data.len() as u64 * 4;

        for step in 0..self.pracc_step_budget {
            let mut pending = None;
            for _ in 0..CONTROL_RETRIES {
                let control = self.exchange_control(|_| ())?;
                if step == 0 && !control.dm() {
                    return Err(EjtagError::PraccNotInDebugMode);
                } else if !control.dm() {
                    tracing::trace!("Exec_PrAcc: debug return");
                    self.change_state(EjtagState::Running);
                    return Ok(data);
                } else if control.pracc() {
                    pending = Some(control);
                    break;
                }
            }
            let control = pending.ok_or(EjtagError::PraccStuck)?;

            let address = self.read_address()?;
            if step > 0 && address == code_beg {
                tracing::trace!("Exec_PrAcc: debug suspend");
                self.change_state(suspend_state);
                return Ok(data);
            }

            enum Area {
                Code,
                Temp,
                Data,
            }
            let (area, area_beg, writable, area_name) = if (code_beg..code_end).contains(&address)
            {
                (Area::Code, code_beg, false, "code")
            } else if (temp_beg..temp_end).contains(&address) {
                (Area::Temp, temp_beg, true, "temp")
            } else if (data_beg..data_end).contains(&address) {
                (Area::Data, data_beg, true, "data")
            } else {
                return Err(EjtagError::PraccAddressOutOfRange { address });
            };

            let offset = ((address - area_beg) / 4) as usize;
            if control.prnw() {
                if !writable {
                    return Err(EjtagError::PraccIllegalWrite {
                        area: area_name,
                        address,
                    });
                }
                let word = self.read_data()?;
                tracing::trace!(
                    "Exec_PrAcc: write {area_name} [{:#06x}] = {word:#x}",
                    address & 0xffff
                );
                match area {
                    Area::Temp => temp[offset] = word,
                    Area::Data => data[offset] = word,
                    Area::Code => unreachable!(),
                }
            } else {
                let word = match area {
                    Area::Code => code[offset] as u64,
                    Area::Temp => temp[offset],
                    Area::Data => data[offset],
                };
                tracing::trace!(
                    "Exec_PrAcc: read {area_name} [{:#06x}] = {word:#x}",
                    address & 0xffff
                );
                self.write_data(word)?;
            }

            self.exchange_control(|c| c.set_pracc(false))?;
        }

        Err(EjtagError::PraccStepLimit)
    }

    /// Runs `code` through PrAcc, appending the branch-to-self epilogue that
    /// makes the sequence refetch its first word when done.
    fn exec_pracc(&mut self, code: &[u32], data: Vec<u64>) -> Result<Vec<u64>, EjtagError> {
        let mut padded = code.to_vec();
        padded.push(assembly::b(-(code.len() as i32) - 1));
        padded.push(NOP);
        padded.push(NOP);
        self.exec_pracc_bare(
            &padded,
            data,
            EjtagState::Stopped,
            "Stopped",
            EjtagState::Stopped,
        )
    }

    // Register aliases used in the PrAcc code sequences: $1 holds the data
    // area pointer across the whole debug session, $2 is a scratch register.
    const R_DATA: u32 = 1;
    const R_ACC: u32 = 2;

    fn pracc_debug_enter(&mut self) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: debug enter");
        let (rdata, _) = (Self::R_DATA, Self::R_ACC);
        let data_pointer = (DMSEG_ADDR + DMSEG_DATA_OFFSET) & 0xffff_ffff;
        let code = [
            assembly::mtc0(rdata, CP0_DESAVE),
            assembly::lui(rdata, (data_pointer >> 16) as u32),
            assembly::ori(rdata, rdata, data_pointer as u32 & 0xffff),
        ];
        let mut padded = code.to_vec();
        padded.push(assembly::b(-(code.len() as i32) - 1));
        padded.push(NOP);
        padded.push(NOP);
        self.exec_pracc_bare(
            &padded,
            Vec::new(),
            EjtagState::Interrupted,
            "Interrupted",
            EjtagState::Stopped,
        )?;

        // Some target capabilities cannot be probed before the first stop, so
        // do it now if necessary.
        self.pracc_probe()?;
        Ok(())
    }

    fn pracc_debug_return(&mut self) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: debug return");
        let rdata = Self::R_DATA;
        self.exec_pracc_bare(
            &[
                assembly::mfc0(rdata, CP0_DESAVE),
                DERET,
                NOP,
                NOP,
                NOP,
            ],
            Vec::new(),
            EjtagState::Stopped,
            "Stopped",
            EjtagState::Interrupted,
        )?;
        Ok(())
    }

    fn pracc_single_step(&mut self) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: single step");
        let racc = Self::R_ACC;
        let data_pointer = (DMSEG_ADDR + DMSEG_DATA_OFFSET) & 0xffff_ffff;
        // Set SSt and return; the step completes with a new debug exception.
        self.exec_pracc_bare(
            &[
                assembly::mfc0(racc, CP0_DEBUG),
                assembly::ori(racc, racc, 0x0100),
                assembly::mtc0(racc, CP0_DEBUG),
                assembly::mfc0(racc, CP0_DESAVE),
                DERET,
                NOP,
                NOP,
                NOP,
            ],
            Vec::new(),
            EjtagState::Stopped,
            "Stopped",
            EjtagState::Stopped,
        )?;
        // Back in debug mode: clear SSt and restore the data pointer.
        self.exec_pracc(
            &[
                assembly::mtc0(racc, CP0_DESAVE),
                assembly::mfc0(racc, CP0_DEBUG),
                assembly::ori(racc, racc, 0x0100),
                assembly::xori(racc, racc, 0x0100),
                assembly::mtc0(racc, CP0_DEBUG),
                assembly::lui(racc, (data_pointer >> 16) as u32),
                assembly::ori(racc, racc, data_pointer as u32 & 0xffff),
            ],
            Vec::new(),
        )?;
        Ok(())
    }

    fn pracc_read_cp0(&mut self, cp0: (u32, u32)) -> Result<u64, EjtagError> {
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        let data = self.exec_pracc(
            &[
                assembly::sw(racc, -ws, rdata),
                assembly::mfc0(racc, cp0),
                assembly::sw(racc, 0, rdata),
                assembly::lw(racc, -ws, rdata),
                NOP,
            ],
            vec![0],
        )?;
        tracing::debug!("PrAcc: read CP0 {cp0:?} = {:#x}", data[0]);
        Ok(data[0])
    }

    fn pracc_write_cp0(&mut self, cp0: (u32, u32), value: u64) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: write CP0 {cp0:?} = {value:#x}");
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        self.exec_pracc(
            &[
                assembly::sw(racc, -ws, rdata),
                assembly::lw(racc, 0, rdata),
                assembly::mtc0(racc, cp0),
                assembly::lw(racc, -ws, rdata),
                NOP,
            ],
            vec![value],
        )?;
        Ok(())
    }

    fn pracc_probe(&mut self) -> Result<(), EjtagError> {
        if self.pracc_probed {
            return Ok(());
        }

        self.cp0_config = Cp0Config(self.pracc_read_cp0(CP0_CONFIG)? as u32);
        tracing::debug!("CP0.Config {:?}", self.cp0_config);
        tracing::info!(
            "target is a {} endian CPU, KSEG0 cache policy: {}",
            if self.cp0_config.be() { "big" } else { "little" },
            cache_policy_name(self.cp0_config.k0()),
        );

        self.cp0_config1 = Cp0Config1(self.pracc_read_cp0(CP0_CONFIG1)? as u32);
        tracing::debug!("CP0.Config1 {:?}", self.cp0_config1);

        self.cp0_debug = Cp0Debug(self.pracc_read_cp0(CP0_DEBUG)? as u32);
        tracing::debug!("CP0.Debug {:?}", self.cp0_debug);
        if self.cp0_debug.no_sst() {
            tracing::warn!("target does not support single-stepping");
        }

        let ibs = DrsegIbs(self.pracc_read_word(self.drseg.ibs())? as u32);
        self.instr_breakpoints = vec![None; ibs.bcn() as usize];
        tracing::info!(
            "target has {} instruction breakpoints",
            self.instr_breakpoints.len()
        );

        self.pracc_probed = true;
        Ok(())
    }

    fn pracc_get_registers(&mut self) -> Result<Vec<u64>, EjtagError> {
        tracing::debug!("PrAcc: get registers");
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        let mut code = vec![
            assembly::sw(racc, ws * 2, rdata),
            assembly::mfc0(racc, CP0_DESAVE),
            assembly::sw(racc, ws, rdata),
        ];
        for rn in 3..32 {
            code.push(assembly::sw(rn, ws * rn as i32, rdata));
        }
        code.extend([
            assembly::mfc0(racc, CP0_SR),
            assembly::sw(racc, ws * 32, rdata),
            assembly::mflo(racc),
            assembly::sw(racc, ws * 33, rdata),
            assembly::mfhi(racc),
            assembly::sw(racc, ws * 34, rdata),
            assembly::mfc0(racc, CP0_BADVADDR),
            assembly::sw(racc, ws * 35, rdata),
            assembly::mfc0(racc, CP0_CAUSE),
            assembly::sw(racc, ws * 36, rdata),
            assembly::mfc0(racc, CP0_DEPC),
            assembly::sw(racc, ws * 37, rdata),
            assembly::lw(racc, ws * 2, rdata),
            NOP,
        ]);
        self.exec_pracc(&code, vec![0; 38])
    }

    fn pracc_set_registers(&mut self, registers: &[u64]) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: set registers");
        debug_assert_eq!(registers.len(), 38);
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        let mut code = vec![
            assembly::sw(racc, ws * 2, rdata),
            assembly::lw(racc, ws, rdata),
            assembly::mtc0(racc, CP0_DESAVE),
        ];
        for rn in 3..32 {
            code.push(assembly::lw(rn, ws * rn as i32, rdata));
        }
        code.extend([
            assembly::lw(racc, ws * 32, rdata),
            assembly::mtc0(racc, CP0_SR),
            assembly::lw(racc, ws * 33, rdata),
            assembly::mtlo(racc),
            assembly::lw(racc, ws * 34, rdata),
            assembly::mthi(racc),
            assembly::lw(racc, ws * 35, rdata),
            assembly::mtc0(racc, CP0_BADVADDR),
            assembly::lw(racc, ws * 36, rdata),
            assembly::mtc0(racc, CP0_CAUSE),
            assembly::lw(racc, ws * 37, rdata),
            assembly::mtc0(racc, CP0_DEPC),
            assembly::lw(racc, ws * 2, rdata),
            NOP,
        ]);
        self.exec_pracc(&code, registers.to_vec())?;
        Ok(())
    }

    fn pracc_get_gpr(&mut self, number: u32) -> Result<u64, EjtagError> {
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        let data = if number != rdata {
            self.exec_pracc(&[assembly::sw(number, 0, rdata), NOP], vec![0])?
        } else {
            // $1 itself lives in DESAVE while the session is stopped.
            self.exec_pracc(
                &[
                    assembly::sw(racc, -ws, rdata),
                    assembly::mfc0(racc, CP0_DESAVE),
                    assembly::sw(racc, 0, rdata),
                    assembly::lw(racc, -ws, rdata),
                    NOP,
                ],
                vec![0],
            )?
        };
        tracing::debug!("PrAcc: get ${number} = {:#x}", data[0]);
        Ok(data[0])
    }

    fn pracc_set_gpr(&mut self, number: u32, value: u64) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: set ${number} = {value:#x}");
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let ws = self.word_size as i32;
        if number != rdata {
            self.exec_pracc(&[assembly::lw(number, 0, rdata), NOP], vec![value])?;
        } else {
            self.exec_pracc(
                &[
                    assembly::sw(racc, -ws, rdata),
                    assembly::lw(racc, 0, rdata),
                    assembly::mtc0(racc, CP0_DESAVE),
                    assembly::lw(racc, -ws, rdata),
                    NOP,
                ],
                vec![value],
            )?;
        }
        Ok(())
    }

    // PrAcc memory access

    fn pracc_copy_word(
        &mut self,
        address: u64,
        value: u64,
        is_read: bool,
    ) -> Result<u64, EjtagError> {
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let raddr = 3;
        let ws = self.word_size as i32;
        let data = self.exec_pracc(
            &[
                assembly::sw(raddr, -ws, rdata),
                assembly::sw(racc, -ws * 2, rdata),
                assembly::lui(raddr, (address >> 16) as u32),
                assembly::ori(raddr, raddr, address as u32 & 0xffff),
                assembly::lw(racc, 0, if is_read { raddr } else { rdata }),
                assembly::sw(racc, 0, if is_read { rdata } else { raddr }),
                assembly::lw(racc, -ws * 2, rdata),
                assembly::lw(raddr, -ws, rdata),
                NOP,
            ],
            vec![value],
        )?;
        Ok(data[0])
    }

    fn pracc_read_word(&mut self, address: u64) -> Result<u64, EjtagError> {
        let value = self.pracc_copy_word(address, 0, true)?;
        tracing::debug!("PrAcc: read [{address:#x}] = {value:#x}");
        Ok(value)
    }

    fn pracc_write_word(&mut self, address: u64, value: u64) -> Result<(), EjtagError> {
        tracing::debug!("PrAcc: write [{address:#x}] = {value:#x}");
        self.pracc_copy_word(address, value, false)?;
        Ok(())
    }

    /// Byte-granular copy between target memory and the dmseg data area.
    /// This is not efficient at all, but unaligned accesses to dmseg and
    /// endianness make word transfers subtle; one byte per data word works
    /// everywhere. Lengths are limited to the data area size per sequence.
    fn pracc_copy_memory(
        &mut self,
        address: u64,
        length: usize,
        data: Vec<u64>,
        is_read: bool,
    ) -> Result<Vec<u64>, EjtagError> {
        assert!(length <= 0x200);
        let (rdata, racc) = (Self::R_DATA, Self::R_ACC);
        let (rdst, rsrc, rlen) = (3, 4, 5);
        let ws = self.word_size as i32;
        self.exec_pracc(
            &[
                assembly::sw(rdst, -ws, rdata),
                assembly::sw(rsrc, -ws * 2, rdata),
                assembly::sw(rlen, -ws * 3, rdata),
                assembly::sw(racc, -ws * 4, rdata),
                assembly::lui(racc, (address >> 16) as u32),
                assembly::ori(racc, racc, address as u32 & 0xffff),
                assembly::or(rdst, 0, if is_read { rdata } else { racc }),
                assembly::or(rsrc, 0, if is_read { racc } else { rdata }),
                assembly::ori(rlen, 0, length as u32),
                if is_read {
                    assembly::lbu(racc, 0, rsrc)
                } else {
                    assembly::lw(racc, 0, rsrc)
                },
                assembly::addi(rsrc, rsrc, if is_read { 1 } else { 4 }),
                if is_read {
                    assembly::sw(racc, 0, rdst)
                } else {
                    assembly::sb(racc, 0, rdst)
                },
                assembly::addi(rdst, rdst, if is_read { 4 } else { 1 }),
                assembly::addi(rlen, rlen, -1),
                assembly::bgtz(rlen, -6),
                NOP,
                assembly::lw(racc, -ws * 4, rdata),
                assembly::lw(rlen, -ws * 3, rdata),
                assembly::lw(rsrc, -ws * 2, rdata),
                assembly::lw(rdst, -ws, rdata),
                NOP,
            ],
            data,
        )
    }

    // PrAcc cache operations

    fn pracc_sync_icache_r1(&mut self, address: u64) -> Result<(), EjtagError> {
        let (rdata, raddr) = (Self::R_DATA, 3);
        let ws = self.word_size as i32;
        self.exec_pracc(
            &[
                assembly::sw(raddr, -ws, rdata),
                assembly::lui(raddr, (address >> 16) as u32),
                assembly::cache(0b110_01, address as u32 & 0xffff, raddr), // D_HIT_WRITEBACK
                assembly::cache(0b100_00, address as u32 & 0xffff, raddr), // I_HIT_INVALIDATE
                SYNC,
                assembly::lw(raddr, -ws, rdata),
                NOP,
            ],
            Vec::new(),
        )?;
        Ok(())
    }

    fn pracc_sync_icache_r2(&mut self, address: u64) -> Result<(), EjtagError> {
        let (rdata, raddr) = (Self::R_DATA, 3);
        let ws = self.word_size as i32;
        self.exec_pracc(
            &[
                assembly::sw(raddr, -ws, rdata),
                assembly::lui(raddr, (address >> 16) as u32),
                assembly::synci(address as u32 & 0xffff, raddr),
                SYNC,
                assembly::lw(raddr, -ws, rdata),
                NOP,
            ],
            Vec::new(),
        )?;
        Ok(())
    }

    fn pracc_sync_icache(&mut self, address: u64) -> Result<(), EjtagError> {
        let policy = if address & DMSEG_MASK == DMSEG_ADDR & self.mask {
            CACHE_POLICY_UNCACHED
        } else if address & KSEGX_MASK & self.mask == KUSEG_ADDR & self.mask {
            self.cp0_config.ku()
        } else if address & KSEGX_MASK & self.mask == KSEG0_ADDR & self.mask {
            self.cp0_config.k0()
        } else if address & KSEGX_MASK & self.mask == KSEG1_ADDR & self.mask {
            CACHE_POLICY_UNCACHED
        } else if address & KSEGX_MASK & self.mask == KSEG2_ADDR & self.mask
            || address & KSEGX_MASK & self.mask == KSEG3_ADDR & self.mask
        {
            self.cp0_config.k23()
        } else {
            CACHE_POLICY_UNCACHED
        };

        if policy == CACHE_POLICY_UNCACHED {
            return Ok(());
        }

        match self.cp0_config.ar() {
            0 => {
                tracing::debug!("PrAcc: MIPS R1 I-cache sync");
                self.pracc_sync_icache_r1(address)
            }
            1 => {
                tracing::debug!("PrAcc: MIPS R2 I-cache sync");
                self.pracc_sync_icache_r2(address)
            }
            _ => Err(EjtagError::UnknownCacheSequence),
        }
    }

    // Public target operations

    /// Interrupts the target and runs the debug entry prologue.
    pub fn target_stop(&mut self) -> Result<(), EjtagError> {
        self.check_state("stop", &[EjtagState::Running], "Running")?;
        self.ejtag_debug_interrupt()?;
        self.check_for_debug_interrupt()?;
        self.pracc_debug_enter()
    }

    /// Resumes the target, waiting for the next debug exception. Between
    /// CONTROL polls, `interrupt` is consulted; once it reports a pending
    /// cancellation the target is stopped and `Interrupted` returned.
    pub fn target_continue(
        &mut self,
        interrupt: &mut dyn FnMut() -> Result<bool, TransportError>,
    ) -> Result<ResumeOutcome, EjtagError> {
        self.check_state("continue", &[EjtagState::Stopped], "Stopped")?;
        self.pracc_debug_return()?;
        if self.state == EjtagState::Interrupted {
            // The target re-entered debug mode before DERET finished, e.g.
            // because of a breakpoint on the next instruction.
            self.pracc_debug_enter()?;
            return Ok(ResumeOutcome::DebugException);
        }

        while self.state == EjtagState::Running {
            if interrupt().map_err(JtagError::Transport)? {
                self.target_stop()?;
                return Ok(ResumeOutcome::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(100));
            if self.check_for_debug_interrupt()? {
                self.pracc_debug_enter()?;
                return Ok(ResumeOutcome::DebugException);
            }
        }
        Ok(ResumeOutcome::DebugException)
    }

    /// Executes one instruction using the SSt bit of CP0.Debug.
    pub fn target_single_step(&mut self) -> Result<(), EjtagError> {
        self.check_state("single step", &[EjtagState::Stopped], "Stopped")?;
        if self.cp0_debug.no_sst() {
            return Err(EjtagError::NoSingleStep);
        }
        self.pracc_single_step()
    }

    /// Removes all breakpoints and resumes the target.
    pub fn target_detach(&mut self) -> Result<(), EjtagError> {
        if self.state == EjtagState::Running {
            self.target_stop()?;
        }
        for index in 0..self.instr_breakpoints.len() {
            if self.instr_breakpoints[index].is_some() {
                self.pracc_write_word(self.drseg.ibc(index), 0)?;
                self.instr_breakpoints[index] = None;
            }
        }
        for (address, saved_instr) in std::mem::take(&mut self.soft_breakpoints) {
            self.pracc_write_word(address, saved_instr as u64)?;
            self.pracc_sync_icache(address)?;
        }
        self.pracc_debug_return()
    }

    /// Reads all 38 registers in GDB order: r0..r31, sr, lo, hi, bad, cause,
    /// pc.
    pub fn target_get_registers(&mut self) -> Result<Vec<u64>, EjtagError> {
        self.check_state("get registers", &[EjtagState::Stopped], "Stopped")?;
        self.pracc_get_registers()
    }

    /// Writes all 38 registers in GDB order.
    pub fn target_set_registers(&mut self, registers: &[u64]) -> Result<(), EjtagError> {
        self.check_state("set registers", &[EjtagState::Stopped], "Stopped")?;
        self.pracc_set_registers(registers)
    }

    /// Reads one register by its GDB number.
    pub fn target_get_register(&mut self, number: usize) -> Result<u64, EjtagError> {
        self.check_state("get register", &[EjtagState::Stopped], "Stopped")?;
        match number {
            0..=31 => self.pracc_get_gpr(number as u32),
            37 => self.pracc_read_cp0(CP0_DEPC),
            _ => Err(EjtagError::UnsupportedRegister(number)),
        }
    }

    /// Writes one register by its GDB number.
    pub fn target_set_register(&mut self, number: usize, value: u64) -> Result<(), EjtagError> {
        self.check_state("set register", &[EjtagState::Stopped], "Stopped")?;
        match number {
            0..=31 => self.pracc_set_gpr(number as u32, value),
            37 => self.pracc_write_cp0(CP0_DEPC, value),
            _ => Err(EjtagError::UnsupportedRegister(number)),
        }
    }

    /// Reads target memory.
    pub fn target_read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, EjtagError> {
        self.check_state("read memory", &[EjtagState::Stopped], "Stopped")?;
        let ws = self.word_size as usize;
        if address % ws as u64 == 0 && length == ws {
            let word = self.pracc_read_word(address)?;
            Ok(self.endian.word_to_bytes(word, ws))
        } else {
            let mut data = Vec::with_capacity(length);
            let mut address = address;
            let mut remaining = length;
            while remaining > 0 {
                let chunk = remaining.min(0x200);
                let words =
                    self.pracc_copy_memory(address, chunk, vec![0; chunk], true)?;
                data.extend(words.into_iter().map(|word| word as u8));
                address += chunk as u64;
                remaining -= chunk;
            }
            Ok(data)
        }
    }

    /// Writes target memory.
    pub fn target_write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), EjtagError> {
        self.check_state("write memory", &[EjtagState::Stopped], "Stopped")?;
        let ws = self.word_size as usize;
        if address % ws as u64 == 0 && data.len() == ws {
            let word = self.endian.word_from_bytes(data);
            self.pracc_write_word(address, word)
        } else {
            let mut address = address;
            for chunk in data.chunks(0x200) {
                let words: Vec<u64> = chunk.iter().map(|&byte| byte as u64).collect();
                self.pracc_copy_memory(address, chunk.len(), words, false)?;
                address += chunk.len() as u64;
            }
            Ok(())
        }
    }

    /// Patches an SDBBP instruction at `address`, verifying the write (which
    /// fails silently in ROM) and synchronizing the I-cache.
    pub fn target_set_software_breakpoint(&mut self, address: u64) -> Result<(), EjtagError> {
        self.check_state(
            "set software breakpoint",
            &[EjtagState::Stopped],
            "Stopped",
        )?;
        let saved_instr = match self.soft_breakpoints.get(&address) {
            Some(&saved) => saved,
            None => self.pracc_read_word(address)? as u32,
        };
        self.pracc_write_word(address, SDBBP as u64)?;
        if self.pracc_read_word(address)? as u32 != SDBBP {
            return Err(EjtagError::BreakpointWriteFailed { address });
        }
        self.pracc_sync_icache(address)?;
        self.soft_breakpoints.insert(address, saved_instr);
        Ok(())
    }

    /// Restores the original instruction at `address`.
    pub fn target_clear_software_breakpoint(&mut self, address: u64) -> Result<(), EjtagError> {
        self.check_state(
            "clear software breakpoint",
            &[EjtagState::Stopped],
            "Stopped",
        )?;
        if let Some(saved_instr) = self.soft_breakpoints.remove(&address) {
            self.pracc_write_word(address, saved_instr as u64)?;
            self.pracc_sync_icache(address)?;
        }
        Ok(())
    }

    /// Programs a free drseg instruction breakpoint register to match
    /// `address` exactly.
    pub fn target_set_instr_breakpoint(&mut self, address: u64) -> Result<(), EjtagError> {
        self.check_state(
            "set instruction breakpoint",
            &[EjtagState::Stopped],
            "Stopped",
        )?;
        for index in 0..self.instr_breakpoints.len() {
            if self.instr_breakpoints[index].is_none() {
                self.pracc_write_word(self.drseg.iba(index), address)?;
                self.pracc_write_word(self.drseg.ibm(index), 0)?;
                let mut ibc = DrsegIbc::default();
                ibc.set_be(true);
                self.pracc_write_word(self.drseg.ibc(index), ibc.0 as u64)?;
                self.instr_breakpoints[index] = Some(address);
                return Ok(());
            }
        }
        Err(EjtagError::NoBreakpointSlots)
    }

    /// Releases the drseg instruction breakpoint matching `address`.
    pub fn target_clear_instr_breakpoint(&mut self, address: u64) -> Result<(), EjtagError> {
        self.check_state(
            "clear instruction breakpoint",
            &[EjtagState::Stopped],
            "Stopped",
        )?;
        for index in 0..self.instr_breakpoints.len() {
            if self.instr_breakpoints[index] == Some(address) {
                self.pracc_write_word(self.drseg.ibc(index), 0)?;
                self.instr_breakpoints[index] = None;
                return Ok(());
            }
        }
        Ok(())
    }
}

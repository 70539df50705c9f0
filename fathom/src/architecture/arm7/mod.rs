//! ARM7TDMI debug engine, driving the EmbeddedICE macrocell through the debug
//! sequencer pipe.
//!
//! Things the documentation does not make obvious about this core:
//!
//!  * Halt on DBGRQ is broken due to extensive errata; debug entry uses a
//!    breakpoint configured to activate on any instruction fetch instead.
//!  * DBGACK can be set without DBGRQ, and doubles as the signal that makes
//!    peripherals ignore side-effectful memory accesses while debugging.
//!  * A watchpoint unit that matches on two consecutive cycles misses the
//!    second one; see [`Arm7Debug::target_single_step`] for the workaround.
//!  * Byte and halfword loads from invalid addresses may return results that
//!    are not properly zero-extended.

mod context;
pub mod instr;
pub mod registers;
mod transaction;

use std::collections::BTreeMap;

use crate::jtag::IdCode;
use crate::probe::{BytePipe, TransportError};
use crate::util::Endianness;

pub use context::Arm7Context;
pub use transaction::{RangeHandle, Transaction, TransactionResults, WordHandle};

use registers::{DbgCtl, DbgSta, EiceReg, M_ABT, M_FIQ, M_IRQ, M_SVC, M_SYS, M_UND, PSR_T};
use transaction::{OP_CANCEL, OP_POLL_ACK, POLL_ACK_CANCELLABLE};

/// Errors produced by the ARM7TDMI debug engine.
#[derive(Debug, thiserror::Error)]
pub enum Arm7Error {
    /// The core did not assert DBGACK when it was expected to halt.
    #[error("core failed to halt")]
    HaltFailed,

    /// An operation that requires a halted core was attempted while running,
    /// or vice versa.
    #[error("cannot {operation}: core is {state}")]
    InvalidState {
        /// The rejected operation.
        operation: &'static str,
        /// `"running"` or `"halted"`.
        state: &'static str,
    },

    /// The requested breakpoint set needs more than the two available
    /// watchpoint units.
    #[error("cannot set a {kind:?} breakpoint: out of watchpoint units")]
    OutOfWatchpoints {
        /// Kind of the breakpoint that did not fit.
        kind: BreakpointKind,
    },

    /// A software breakpoint could not be written to or removed from target
    /// memory.
    #[error("failed to {action} breakpoint at {address:#010x}: written <{written}>, read <{read}>")]
    BreakpointVerifyFailed {
        /// `"set"` or `"clear"`.
        action: &'static str,
        /// Address of the breakpoint.
        address: u32,
        /// Code bytes that were written.
        written: String,
        /// Code bytes that were read back.
        read: String,
    },

    /// An attempt was made to clear a breakpoint that does not exist.
    #[error("cannot clear a {kind:?} breakpoint at {address:#010x}: breakpoint does not exist")]
    NoSuchBreakpoint {
        /// Address of the breakpoint.
        address: u32,
        /// Kind of the breakpoint.
        kind: BreakpointKind,
    },

    /// The underlying pipe failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Kind of an ARM7 breakpoint.
///
/// Hardware breakpoints consume one watchpoint unit each; all software
/// breakpoints of a given instruction set share one unit (it matches the
/// trap instruction pattern on any fetch), so the breakpoint set is feasible
/// as long as it needs at most two distinct watchpoint configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BreakpointKind {
    /// Hardware breakpoint on an ARM instruction fetch.
    HardArm,
    /// Hardware breakpoint on a Thumb instruction fetch.
    HardThumb,
    /// `BKPT` instruction patched into ARM code.
    SoftArm,
    /// `BKPT` instruction patched into Thumb code.
    SoftThumb,
}

impl BreakpointKind {
    fn is_soft(self) -> bool {
        matches!(self, BreakpointKind::SoftArm | BreakpointKind::SoftThumb)
    }

    fn is_thumb(self) -> bool {
        matches!(self, BreakpointKind::HardThumb | BreakpointKind::SoftThumb)
    }

    fn width(self) -> u32 {
        if self.is_thumb() {
            2
        } else {
            4
        }
    }
}

/// Outcome of waiting for the core to halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The core hit a breakpoint.
    Breakpoint,
    /// The wait was cancelled and the core was stopped on request.
    Interrupted,
}

/// ARM7TDMI debug engine.
pub struct Arm7Debug {
    pipe: Box<dyn BytePipe>,
    endian: Endianness,
    context: Option<Arm7Context>,
    breakpoints: BTreeMap<(u32, BreakpointKind), Option<Vec<u8>>>,
}

impl Arm7Debug {
    /// Creates a debug engine over a pipe connected to the ARM7 debug
    /// sequencer applet.
    pub fn new(pipe: Box<dyn BytePipe>, endian: Endianness) -> Self {
        Arm7Debug {
            pipe,
            endian,
            context: None,
            breakpoints: BTreeMap::new(),
        }
    }

    /// The target byte order this engine was configured for.
    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    /// Whether the core is halted and its context snapshot is available.
    pub fn is_halted(&self) -> bool {
        self.context.is_some()
    }

    /// The context snapshot taken on debug entry, while halted.
    pub fn context(&self) -> Option<&Arm7Context> {
        self.context.as_ref()
    }

    /// Mutable access to the context snapshot; changes are written back to
    /// the core on debug exit.
    pub fn context_mut(&mut self) -> Option<&mut Arm7Context> {
        self.context.as_mut()
    }

    fn check_halted(&self, operation: &'static str) -> Result<(), Arm7Error> {
        if self.is_halted() {
            Ok(())
        } else {
            Err(Arm7Error::InvalidState {
                operation,
                state: "running",
            })
        }
    }

    fn check_running(&self, operation: &'static str) -> Result<(), Arm7Error> {
        if self.is_halted() {
            Err(Arm7Error::InvalidState {
                operation,
                state: "halted",
            })
        } else {
            Ok(())
        }
    }

    /// Submits a transaction and reads back its response words.
    pub fn submit(&mut self, txn: Transaction) -> Result<TransactionResults, Arm7Error> {
        self.pipe.send(txn.buffer())?;
        self.pipe.flush()?;
        if txn.to_read() == 0 {
            return Ok(TransactionResults(Vec::new()));
        }
        let bytes = self.pipe.recv(4 * txn.to_read())?;
        let words = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(TransactionResults(words))
    }

    /// Reads the IDCODE of the TAP.
    pub fn identify(&mut self) -> Result<IdCode, Arm7Error> {
        let mut txn = Transaction::new();
        let idcode = txn.identify();
        let results = self.submit(txn)?;
        let idcode = IdCode(results.word(idcode));
        tracing::debug!("identify idcode={idcode}");
        Ok(idcode)
    }

    /// Waits until the core halts, or until `interrupt` reports a pending
    /// cancellation.
    ///
    /// Unlike every other operation, this one can be abandoned without losing
    /// sync with the probe: the poll is enqueued with the cancellable flag,
    /// which guarantees exactly one response word whether the poll completes
    /// or a `CANCEL` opcode follows it. After requesting cancellation, the
    /// response word is still awaited to keep the pipe synchronized; a second
    /// cancellation of the same poll is a bug in the caller.
    fn debug_wait(
        &mut self,
        interrupt: &mut dyn FnMut() -> Result<bool, TransportError>,
    ) -> Result<HaltReason, Arm7Error> {
        tracing::debug!("debug wait");
        // Make sure no in-flight bytes precede the poll.
        self.pipe.flush()?;
        self.pipe
            .send(&[(OP_POLL_ACK << 5) | POLL_ACK_CANCELLABLE])?;
        self.pipe.flush()?;
        loop {
            if self.pipe.recv_poll(4)?.is_some() {
                return Ok(HaltReason::Breakpoint);
            }
            if interrupt()? {
                tracing::debug!("  cancel");
                self.pipe.send(&[OP_CANCEL << 5])?;
                self.pipe.flush()?;
                self.pipe.recv(4)?;
                return Ok(HaltReason::Interrupted);
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    /// Requests debug entry using a breakpoint on any instruction fetch.
    /// DBGRQ cannot be used for this; it is broken by errata.
    fn debug_request(&mut self) -> Result<(), Arm7Error> {
        self.check_running("request debug entry")?;
        tracing::debug!("debug request (break)");
        // Configure watchpoint 0 to match any instruction fetch at all, saving
        // its previous configuration.
        let mut txn = Transaction::new();
        let old_ctrl_val = txn.eice_get(EiceReg::W0CtrlVal);
        let old_ctrl_msk = txn.eice_get(EiceReg::W0CtrlMsk);
        let old_addr_msk = txn.eice_get(EiceReg::W0AddrMsk);
        let old_data_msk = txn.eice_get(EiceReg::W0DataMsk);
        txn.eice_set(EiceReg::W0CtrlVal, 0); // disable first
        txn.eice_set(EiceReg::W0AddrMsk, 0);
        txn.eice_set(EiceReg::W0DataMsk, 0);
        txn.eice_set(EiceReg::W0CtrlMsk, 0b01 << 3); // PROT
        txn.eice_set(EiceReg::W0CtrlVal, 1 << 8); // ENABLE; PROT=0b00
        txn.eice_poll();
        let results = self.submit(txn)?;

        let mut txn = Transaction::new();
        txn.eice_set_raw(EiceReg::W0AddrMsk, results.word(old_addr_msk));
        txn.eice_set_raw(EiceReg::W0DataMsk, results.word(old_data_msk));
        txn.eice_set_raw(EiceReg::W0CtrlMsk, results.word(old_ctrl_msk));
        txn.eice_set_raw(EiceReg::W0CtrlVal, results.word(old_ctrl_val));
        self.submit(txn)?;
        Ok(())
    }

    /// Performs debug entry: asserts DBGACK and INTDIS, then executes the
    /// instruction prologue that snapshots all 37 architectural words.
    fn debug_enter(&mut self, is_dbgrq: bool) -> Result<(), Arm7Error> {
        self.check_running("enter debug state")?;
        tracing::debug!("debug enter");

        let mut txn = Transaction::new();
        let dbgsta = txn.eice_get(EiceReg::DbgSta);
        let results = self.submit(txn)?;
        let dbgsta = DbgSta(results.word(dbgsta));
        if !dbgsta.dbgack() {
            return Err(Arm7Error::HaltFailed);
        }
        let thumb = dbgsta.tbit();

        let mut txn = Transaction::new();
        // Indicate to the rest of the system that we are in debug mode, and
        // disable interrupts to avoid system speed instructions entering a trap.
        let mut ctl = DbgCtl(0);
        ctl.set_dbgack(true);
        ctl.set_intdis(true);
        txn.eice_set(EiceReg::DbgCtl, ctl.0);
        // Get R0, R15, CPSR.
        let (r0, pc) = if thumb {
            txn.t_dbg_enter()
        } else {
            txn.a_dbg_enter()
        };
        txn.a_mrs_cpsr(0);
        let cpsr = txn.a_str(0); // with T bit cleared
        // Get User/System mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_SYS);
        let regs_sys = txn.a_stm(0, 0x7ffe);
        // Get FIQ mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_FIQ);
        txn.a_mrs_spsr(1);
        let regs_fiq = txn.a_stm(0, 0x7f02);
        // Get IRQ mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_IRQ);
        txn.a_mrs_spsr(1);
        let regs_irq = txn.a_stm(0, 0x6002);
        // Get Supervisor mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_SVC);
        txn.a_mrs_spsr(1);
        let regs_svc = txn.a_stm(0, 0x6002);
        // Get Abort mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_ABT);
        txn.a_mrs_spsr(1);
        let regs_abt = txn.a_stm(0, 0x6002);
        // Get Undefined mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_UND);
        txn.a_mrs_spsr(1);
        let regs_und = txn.a_stm(0, 0x6002);
        // Restore CPSR.
        txn.a_msr_cpsr_fsxc(0);
        let results = self.submit(txn)?;

        let insn_size: u32 = if thumb { 2 } else { 4 };
        // The PC was captured by the prologue's `mov r0, pc` with three
        // instructions executed before it, plus the read-ahead of the ISA,
        // plus the debug entry latency.
        let prologue_adj = 3 * insn_size + if thumb { 4 } else { 8 };
        let entry_adj = if is_dbgrq { 2 * insn_size } else { 3 * insn_size };
        let r15 = results.word(pc).wrapping_sub(prologue_adj + entry_adj);

        let sys = results.range(regs_sys);
        let fiq = results.range(regs_fiq);
        let irq = results.range(regs_irq);
        let svc = results.range(regs_svc);
        let abt = results.range(regs_abt);
        let und = results.range(regs_und);
        let context = Arm7Context {
            cpsr: results.word(cpsr) | if thumb { PSR_T } else { 0 },
            r0: results.word(r0),
            r1: sys[0],
            r2: sys[1],
            r3: sys[2],
            r4: sys[3],
            r5: sys[4],
            r6: sys[5],
            r7: sys[6],
            r8_usr: sys[7],
            r9_usr: sys[8],
            r10_usr: sys[9],
            r11_usr: sys[10],
            r12_usr: sys[11],
            r13_usr: sys[12],
            r14_usr: sys[13],
            r15,
            r8_fiq: fiq[1],
            r9_fiq: fiq[2],
            r10_fiq: fiq[3],
            r11_fiq: fiq[4],
            r12_fiq: fiq[5],
            r13_fiq: fiq[6],
            r14_fiq: fiq[7],
            spsr_fiq: fiq[0],
            r13_irq: irq[1],
            r14_irq: irq[2],
            spsr_irq: irq[0],
            r13_svc: svc[1],
            r14_svc: svc[2],
            spsr_svc: svc[0],
            r13_abt: abt[1],
            r14_abt: abt[2],
            spsr_abt: abt[0],
            r13_und: und[1],
            r14_und: und[2],
            spsr_und: und[0],
        };
        tracing::debug!("entered debug state\n{context}");
        self.context = Some(context);
        Ok(())
    }

    /// Performs debug exit: writes the context snapshot back bank by bank and
    /// restarts the core.
    ///
    /// The core may re-enter debug mode immediately (on the very next cycle),
    /// e.g. if a watchpoint triggers on the next instruction. DBGACK set after
    /// the exit cannot be distinguished from a failure to exit; the latter
    /// only happens due to silicon errata (which have workarounds here) or
    /// probe implementation errors, so it is treated as "halted again".
    fn debug_exit(&mut self) -> Result<(), Arm7Error> {
        self.check_halted("exit debug state")?;
        let ctx = self.context.take().expect("checked above");
        tracing::debug!("debug exit\n{ctx}");
        let mut txn = Transaction::new();
        // Set Undefined mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_UND);
        txn.a_ldm(0, 0x6001, &[ctx.spsr_und, ctx.r13_und, ctx.r14_und], false);
        txn.a_msr_spsr_fsxc(0);
        // Set Abort mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_ABT);
        txn.a_ldm(0, 0x6001, &[ctx.spsr_abt, ctx.r13_abt, ctx.r14_abt], false);
        txn.a_msr_spsr_fsxc(0);
        // Set Supervisor mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_SVC);
        txn.a_ldm(0, 0x6001, &[ctx.spsr_svc, ctx.r13_svc, ctx.r14_svc], false);
        txn.a_msr_spsr_fsxc(0);
        // Set IRQ mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_IRQ);
        txn.a_ldm(0, 0x6001, &[ctx.spsr_irq, ctx.r13_irq, ctx.r14_irq], false);
        txn.a_msr_spsr_fsxc(0);
        // Set FIQ mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_FIQ);
        txn.a_ldm(
            0,
            0x7f01,
            &[
                ctx.spsr_fiq,
                ctx.r8_fiq,
                ctx.r9_fiq,
                ctx.r10_fiq,
                ctx.r11_fiq,
                ctx.r12_fiq,
                ctx.r13_fiq,
                ctx.r14_fiq,
            ],
            false,
        );
        txn.a_msr_spsr_fsxc(0);
        // Set User/System mode registers.
        txn.a_msr_cpsr_c(0xc0 | M_SYS);
        txn.a_ldm(
            0,
            0x7ffe,
            &[
                ctx.r1, ctx.r2, ctx.r3, ctx.r4, ctx.r5, ctx.r6, ctx.r7, ctx.r8_usr, ctx.r9_usr,
                ctx.r10_usr, ctx.r11_usr, ctx.r12_usr, ctx.r13_usr, ctx.r14_usr,
            ],
            false,
        );
        // Set R0, R15, CPSR.
        txn.a_ldr(0, ctx.cpsr & !PSR_T); // the T bit is set by the BX below
        txn.a_msr_cpsr_fsxc(0);
        if ctx.cpsr & PSR_T != 0 {
            txn.t_dbg_exit(ctx.r0, ctx.r15);
        } else {
            txn.a_dbg_exit(ctx.r0, ctx.r15);
        }
        txn.eice_set(EiceReg::DbgCtl, 0);
        self.submit(txn)?;
        Ok(())
    }

    fn collect_watchpoints(
        breakpoints: impl IntoIterator<Item = (u32, BreakpointKind)>,
    ) -> Vec<(BreakpointKind, Option<u32>)> {
        let mut watchpoints = Vec::new();
        for (address, kind) in breakpoints {
            let watchpoint = if kind.is_soft() {
                (kind, None)
            } else {
                (kind, Some(address))
            };
            if !watchpoints.contains(&watchpoint) {
                watchpoints.push(watchpoint);
            }
        }
        watchpoints
    }

    fn apply_watchpoints(&mut self) -> Result<(), Arm7Error> {
        let watchpoints = Self::collect_watchpoints(self.breakpoints.keys().copied());
        let mut txn = Transaction::new();
        for unit in 0..2 {
            txn.watchpt_clear(unit);
        }
        for (unit, (kind, address)) in watchpoints.into_iter().enumerate() {
            match (kind, address) {
                (BreakpointKind::HardArm, Some(address)) => {
                    txn.watchpt_fetch_addr(unit, address, 4)
                }
                (BreakpointKind::HardThumb, Some(address)) => {
                    txn.watchpt_fetch_addr(unit, address, 2)
                }
                (BreakpointKind::SoftArm, None) => {
                    txn.watchpt_fetch_data(unit, instr::a_bkpt(0), 4)
                }
                (BreakpointKind::SoftThumb, None) => {
                    txn.watchpt_fetch_data(unit, instr::t_bkpt(0), 2)
                }
                _ => unreachable!(),
            }
        }
        self.submit(txn)?;
        Ok(())
    }

    fn debug_resume(&mut self) -> Result<(), Arm7Error> {
        self.check_halted("resume")?;
        self.apply_watchpoints()?;
        self.debug_exit()
    }

    // Public target operations

    /// Halts the core if it is not already halted on a breakpoint, and takes
    /// the context snapshot.
    pub fn target_stop(&mut self) -> Result<(), Arm7Error> {
        self.check_running("stop")?;
        let mut txn = Transaction::new();
        // Clear watchpoints first to avoid a race against a breakpoint firing
        // between the status read below and the debug request.
        txn.watchpt_clear(0);
        txn.watchpt_clear(1);
        let dbgsta = txn.eice_get(EiceReg::DbgSta);
        let results = self.submit(txn)?;
        if !DbgSta(results.word(dbgsta)).dbgack() {
            self.debug_request()?;
        }
        self.debug_enter(false)
    }

    /// Resumes the core and waits until it halts again on a breakpoint, or
    /// until `interrupt` reports a pending cancellation (in which case the
    /// core is stopped). The context snapshot is refreshed either way.
    pub fn target_continue(
        &mut self,
        interrupt: &mut dyn FnMut() -> Result<bool, TransportError>,
    ) -> Result<HaltReason, Arm7Error> {
        self.debug_resume()?;
        let reason = self.debug_wait(interrupt)?;
        match reason {
            HaltReason::Breakpoint => self.debug_enter(false)?,
            // The poll was cancelled, so the core is still running: halt it
            // the same way an explicit stop would.
            HaltReason::Interrupted => self.target_stop()?,
        }
        Ok(reason)
    }

    /// Executes a single instruction.
    ///
    /// A watchpoint unit that signals a breakpoint on two consecutive cycles
    /// does not flag the second cycle correctly. To work around this, unit 1
    /// is first set up to trigger on the current PC and the core enters and
    /// re-exits debug state once, consuming the match; only then is the step
    /// pattern programmed. Consecutive single steps therefore work, but could
    /// still fail if unit 1 was used to enter debug state before this call.
    pub fn target_single_step(&mut self) -> Result<(), Arm7Error> {
        self.check_halted("single step")?;
        let context = self.context.expect("checked above");
        let width = if context.cpsr & PSR_T != 0 { 2 } else { 4 };

        let mut txn = Transaction::new();
        txn.watchpt_clear(0);
        txn.watchpt_fetch_addr(1, context.r15, width);
        self.submit(txn)?;
        self.debug_exit()?;
        let mut txn = Transaction::new();
        txn.eice_poll();
        self.submit(txn)?;
        self.debug_enter(false)?;

        let context = self.context.expect("re-entered debug state");
        let width = if context.cpsr & PSR_T != 0 { 2 } else { 4 };
        let mut txn = Transaction::new();
        txn.watchpt_step(context.r15, width);
        self.submit(txn)?;
        self.debug_exit()?;
        let mut txn = Transaction::new();
        txn.eice_poll();
        txn.watchpt_clear(0);
        self.submit(txn)?;
        self.debug_enter(false)
    }

    /// Removes all breakpoints and resumes the core.
    pub fn target_detach(&mut self) -> Result<(), Arm7Error> {
        self.check_halted("detach")?;
        self.clear_all_breakpoints()?;
        self.debug_resume()
    }

    // Memory access

    /// Reads target memory.
    ///
    /// Aligned 1/2/4-byte reads use a matching single access, since debuggers
    /// rely on "reasonable" access sizes for MMIO despite the remote protocol
    /// making no such promise. Larger or unaligned reads transfer head and
    /// tail bytes individually and the middle in 14-word `ldm` bursts.
    pub fn target_read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Arm7Error> {
        self.check_halted("read memory")?;
        if matches!(length, 1 | 2 | 4) && address as usize & (length - 1) == 0 {
            let mut txn = Transaction::new();
            txn.a_ldr(0, address);
            match length {
                1 => txn.a_ldrb_sys(1, 0, 0),
                2 => txn.a_ldrh_sys(1, 0, 0),
                4 => txn.a_ldm_sys(0, 0x2, false),
                _ => unreachable!(),
            }
            let data = txn.a_str(1);
            let results = self.submit(txn)?;
            let mask = (1u64 << (length * 8)) - 1;
            let data = results.word(data) as u64;
            if data & !mask != 0 {
                // Byte and halfword loads from invalid addresses may return
                // architecturally impossible results.
                tracing::warn!(
                    "read of size {length} at {address:#010x} returned illegal value {data:#010x}"
                );
            }
            Ok(self.endian.word_to_bytes(data & mask, length))
        } else if length > 0 {
            let mut head_bytes = if address & 0x3 != 0 {
                4 - (address as usize & 0x3)
            } else {
                0
            };
            head_bytes = head_bytes.min(length);
            let tail_bytes = (length - head_bytes) & 0x3;
            let mid_words = (length - head_bytes - tail_bytes) / 4;

            let mut txn = Transaction::new();
            txn.a_ldr(0, address);
            if head_bytes > 0 {
                txn.repeat(head_bytes, |txn| {
                    txn.a_ldrb_sys(1, 0, 1);
                    txn.a_str(1);
                });
            }
            if mid_words >= 14 {
                txn.repeat(mid_words / 14, |txn| {
                    txn.a_ldm_sys(0, 0x7ffe, true);
                    txn.a_stm(0, 0x7ffe);
                });
            }
            txn.repeat(mid_words % 14, |txn| {
                txn.a_ldm_sys(0, 0x2, true);
                txn.a_str(1);
            });
            if tail_bytes > 0 {
                txn.repeat(tail_bytes, |txn| {
                    txn.a_ldrb_sys(1, 0, 1);
                    txn.a_str(1);
                });
            }
            let results = self.submit(txn)?;
            let words = results.words();

            let mut data = Vec::with_capacity(length);
            for &byte in &words[..head_bytes] {
                data.push(byte as u8);
            }
            for &word in &words[head_bytes..head_bytes + mid_words] {
                data.extend_from_slice(&self.endian.word_to_bytes(word as u64, 4));
            }
            for &byte in &words[head_bytes + mid_words..] {
                data.push(byte as u8);
            }
            Ok(data)
        } else {
            Ok(Vec::new())
        }
    }

    /// Writes target memory. See [`Arm7Debug::target_read_memory`] for the
    /// access pattern.
    pub fn target_write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Arm7Error> {
        self.check_halted("write memory")?;
        if matches!(data.len(), 1 | 2 | 4) && address as usize & (data.len() - 1) == 0 {
            let word = self.endian.word_from_bytes(data) as u32;
            let mut txn = Transaction::new();
            txn.a_ldr(0, address);
            txn.a_ldr(1, word);
            match data.len() {
                1 => txn.a_strb_sys(1, 0, 0),
                2 => txn.a_strh_sys(1, 0, 0),
                4 => txn.a_stm_sys(0, 0x2, false),
                _ => unreachable!(),
            }
            self.submit(txn)?;
            Ok(())
        } else {
            let mut head_bytes = if address & 0x3 != 0 {
                4 - (address as usize & 0x3)
            } else {
                0
            };
            head_bytes = head_bytes.min(data.len());
            let tail_bytes = (data.len() - head_bytes) & 0x3;
            let mid_bytes = data.len() - head_bytes - tail_bytes;
            let head_data = &data[..head_bytes];
            let tail_data = &data[head_bytes + mid_bytes..];
            let mid_words: Vec<u32> = data[head_bytes..head_bytes + mid_bytes]
                .chunks_exact(4)
                .map(|chunk| self.endian.word_from_bytes(chunk) as u32)
                .collect();

            let mut txn = Transaction::new();
            txn.a_ldr(0, address);
            for &byte in head_data {
                txn.a_ldr(1, byte as u32);
                txn.a_strb_sys(1, 0, 1);
            }
            let mut index = 0;
            while index + 14 <= mid_words.len() {
                txn.a_ldm(0, 0x7ffe, &mid_words[index..index + 14], false);
                txn.a_stm_sys(0, 0x7ffe, true);
                index += 14;
            }
            while index < mid_words.len() {
                txn.a_ldr(1, mid_words[index]);
                txn.a_stm_sys(0, 0x2, true);
                index += 1;
            }
            for &byte in tail_data {
                txn.a_ldr(1, byte as u32);
                txn.a_strb_sys(1, 0, 1);
            }
            self.submit(txn)?;
            Ok(())
        }
    }

    // Breakpoints

    fn replace_code(
        &mut self,
        address: u32,
        code: &[u8],
        action: &'static str,
    ) -> Result<(), Arm7Error> {
        self.target_write_memory(address, code)?;
        let actual = self.target_read_memory(address, code.len())?;
        if actual != code {
            tracing::error!(
                "failed to {action} breakpoint at {address:#010x}: written <{}>, read <{}>",
                hex::encode(code),
                hex::encode(&actual),
            );
            return Err(Arm7Error::BreakpointVerifyFailed {
                action,
                address,
                written: hex::encode(code),
                read: hex::encode(&actual),
            });
        }
        Ok(())
    }

    /// Adds a breakpoint of the given kind at `address`. For software kinds,
    /// the trap instruction is written to memory and the original code saved.
    pub fn set_breakpoint(&mut self, address: u32, kind: BreakpointKind) -> Result<(), Arm7Error> {
        self.check_halted("set breakpoint")?;
        tracing::debug!("breakpoint set at={address:#010x} kind={kind:?}");
        if self.breakpoints.contains_key(&(address, kind)) {
            return Ok(()); // already set, nothing to do
        }
        let mut proposed: Vec<_> = self.breakpoints.keys().copied().collect();
        proposed.push((address, kind));
        if Self::collect_watchpoints(proposed).len() > 2 {
            return Err(Arm7Error::OutOfWatchpoints { kind });
        }
        let saved = if kind.is_soft() {
            let width = kind.width();
            let saved = self.target_read_memory(address, width as usize)?;
            let trap = if kind.is_thumb() {
                self.endian.word_to_bytes(instr::t_bkpt(0) as u64, 2)
            } else {
                self.endian.word_to_bytes(instr::a_bkpt(0) as u64, 4)
            };
            self.replace_code(address, &trap, "set")?;
            Some(saved)
        } else {
            None
        };
        self.breakpoints.insert((address, kind), saved);
        Ok(())
    }

    /// Removes a breakpoint, restoring the original code for software kinds.
    pub fn clear_breakpoint(
        &mut self,
        address: u32,
        kind: BreakpointKind,
    ) -> Result<(), Arm7Error> {
        self.check_halted("clear breakpoint")?;
        tracing::debug!("breakpoint clear at={address:#010x} kind={kind:?}");
        let Some(saved) = self.breakpoints.get(&(address, kind)).cloned() else {
            return Err(Arm7Error::NoSuchBreakpoint { address, kind });
        };
        if let Some(code) = saved {
            self.replace_code(address, &code, "clear")?;
        }
        self.breakpoints.remove(&(address, kind));
        Ok(())
    }

    /// Removes every breakpoint, restoring patched code.
    pub fn clear_all_breakpoints(&mut self) -> Result<(), Arm7Error> {
        self.check_halted("clear breakpoints")?;
        tracing::debug!("breakpoint clear all");
        for ((address, kind), saved) in std::mem::take(&mut self.breakpoints) {
            if kind.is_soft() {
                let code = saved.expect("software breakpoints save code");
                self.replace_code(address, &code, "clear")?;
            }
        }
        Ok(())
    }
}

mod hex {
    pub fn encode(bytes: &[u8]) -> String {
        bytes.iter().map(|byte| format!("{byte:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::MockPipe;
    use pretty_assertions::assert_eq;

    #[test]
    fn identify_reads_idcode() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&0x3ba00477u32.to_le_bytes());
        let mut arm = Arm7Debug::new(Box::new(pipe), Endianness::Little);
        assert_eq!(arm.identify().unwrap().raw(), 0x3ba00477);
        assert_eq!(handle.sent(), vec![transaction::OP_GET_ID << 5]);
    }

    #[test]
    fn debug_wait_completes_on_ack() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&[0x09, 0, 0, 0]); // DBGACK | TRANS1
        let mut arm = Arm7Debug::new(Box::new(pipe), Endianness::Little);
        let mut interrupt = || -> Result<bool, TransportError> {
            panic!("must not poll the interrupt when a word is pending")
        };
        let reason = arm.debug_wait(&mut interrupt).unwrap();
        assert_eq!(reason, HaltReason::Breakpoint);
        assert_eq!(handle.sent(), vec![(OP_POLL_ACK << 5) | POLL_ACK_CANCELLABLE]);
    }

    #[test]
    fn debug_wait_cancellation_keeps_pipe_synchronized() {
        let (pipe, handle) = MockPipe::new();
        let mut arm = Arm7Debug::new(Box::new(pipe), Endianness::Little);
        // No response is pending; the first interrupt poll requests
        // cancellation and the guaranteed response word appears afterwards.
        let responder = &handle;
        let mut interrupt = move || -> Result<bool, TransportError> {
            responder.respond(&[0, 0, 0, 0]);
            Ok(true)
        };
        let reason = arm.debug_wait(&mut interrupt).unwrap();
        assert_eq!(reason, HaltReason::Interrupted);
        assert_eq!(
            handle.sent(),
            vec![(OP_POLL_ACK << 5) | POLL_ACK_CANCELLABLE, OP_CANCEL << 5]
        );
    }

    #[test]
    fn aligned_word_read_uses_single_access() {
        let (pipe, handle) = MockPipe::new();
        // One response word: the value captured by `str r1`.
        handle.respond(&0xdeadbeefu32.to_le_bytes());
        let mut arm = Arm7Debug::new(Box::new(pipe), Endianness::Little);
        arm.context = Some(Arm7Context::default());
        let data = arm.target_read_memory(0x1000, 4).unwrap();
        assert_eq!(data, 0xdeadbeefu32.to_le_bytes().to_vec());
    }

    #[test]
    fn unaligned_read_splits_head_and_tail() {
        let (pipe, handle) = MockPipe::new();
        // Reading 7 bytes at address 1: 3 head bytes, 1 word, 0 tail.
        // Responses: 3 byte loads then 1 word load.
        handle.respond(&0x61u32.to_le_bytes());
        handle.respond(&0x62u32.to_le_bytes());
        handle.respond(&0x63u32.to_le_bytes());
        handle.respond(&0x64646464u32.to_le_bytes());
        let mut arm = Arm7Debug::new(Box::new(pipe), Endianness::Little);
        arm.context = Some(Arm7Context::default());
        let data = arm.target_read_memory(1, 7).unwrap();
        assert_eq!(data, vec![0x61, 0x62, 0x63, 0x64, 0x64, 0x64, 0x64]);
    }

    #[test]
    fn watchpoint_collapse() {
        use BreakpointKind::*;
        // All software breakpoints of one ISA share a single unit.
        let watchpoints = Arm7Debug::collect_watchpoints([
            (0x1000, SoftArm),
            (0x2000, SoftArm),
            (0x3000, SoftArm),
        ]);
        assert_eq!(watchpoints.len(), 1);

        // Hardware breakpoints take one unit each.
        let watchpoints =
            Arm7Debug::collect_watchpoints([(0x1000, HardArm), (0x2000, HardArm)]);
        assert_eq!(watchpoints.len(), 2);

        // Soft ARM + soft Thumb + hard does not fit in two units.
        let watchpoints = Arm7Debug::collect_watchpoints([
            (0x1000, SoftArm),
            (0x2000, SoftThumb),
            (0x3000, HardArm),
        ]);
        assert_eq!(watchpoints.len(), 3);
    }

    #[test]
    fn breakpoint_kind_widths() {
        assert_eq!(BreakpointKind::HardArm.width(), 4);
        assert_eq!(BreakpointKind::SoftThumb.width(), 2);
        assert!(BreakpointKind::SoftThumb.is_soft());
        assert!(!BreakpointKind::HardThumb.is_soft());
    }
}

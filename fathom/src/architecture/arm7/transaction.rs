//! Batcher for the ARM7 debug sequencer opcode protocol.
//!
//! Each opcode is one byte `[opcode:3 | arg1:5]`, optionally followed by a
//! 32-bit little-endian argument. The probe executes opcodes in order and
//! produces one 32-bit little-endian response word per `GET_REG`, `GET_BUS`,
//! `GET_ID`, and completed `POLL_ACK`.
//!
//! A transaction accumulates opcodes into a byte buffer together with the
//! count of expected response words. Commands that produce a response return
//! a handle, which is an index into the result vector that becomes available
//! once the transaction is submitted; using a handle before submission is
//! impossible by construction.

use super::instr;
use super::registers::EiceReg;

pub(super) const OP_GET_REG: u8 = 0b000;
pub(super) const OP_SET_REG: u8 = 0b001;
pub(super) const OP_GET_BUS: u8 = 0b010;
pub(super) const OP_PUT_BUS: u8 = 0b011;
pub(super) const OP_CANCEL: u8 = 0b100;
pub(super) const OP_RESTART: u8 = 0b101;
pub(super) const OP_POLL_ACK: u8 = 0b110;
pub(super) const OP_GET_ID: u8 = 0b111;

/// Marks a `POLL_ACK` opcode as cancellable; such polls always produce
/// exactly one response word, on completion or on cancellation.
pub(super) const POLL_ACK_CANCELLABLE: u8 = 1;

/// Handle to a single response word of a submitted transaction.
#[derive(Debug, Clone, Copy)]
pub struct WordHandle(pub(super) usize);

/// Handle to a run of consecutive response words of a submitted transaction.
#[derive(Debug, Clone, Copy)]
pub struct RangeHandle {
    pub(super) start: usize,
    pub(super) count: usize,
}

/// Response words of a submitted transaction.
#[derive(Debug)]
pub struct TransactionResults(pub(super) Vec<u32>);

impl TransactionResults {
    /// All response words in submission order. Useful for reading out the
    /// results of repeated command groups, whose handles cannot be named
    /// individually.
    pub fn words(&self) -> &[u32] {
        &self.0
    }

    /// The word a handle refers to.
    pub fn word(&self, handle: WordHandle) -> u32 {
        self.0[handle.0]
    }

    /// The words a range handle refers to.
    pub fn range(&self, handle: RangeHandle) -> &[u32] {
        &self.0[handle.start..handle.start + handle.count]
    }
}

/// An accumulated batch of debug sequencer opcodes.
#[derive(Debug, Default)]
pub struct Transaction {
    buffer: Vec<u8>,
    to_read: usize,
}

impl Transaction {
    /// Creates an empty transaction.
    pub fn new() -> Self {
        Transaction::default()
    }

    pub(super) fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(super) fn to_read(&self) -> usize {
        self.to_read
    }

    fn cmd(&mut self, opcode: u8, arg1: u8, arg2: Option<u32>) {
        self.buffer.push((opcode << 5) | (arg1 & 0x1f));
        if let Some(arg2) = arg2 {
            self.buffer.extend_from_slice(&arg2.to_le_bytes());
        }
    }

    fn ret(&mut self) -> WordHandle {
        let index = self.to_read;
        self.to_read += 1;
        WordHandle(index)
    }

    fn ret_range(&mut self, count: usize) -> RangeHandle {
        let start = self.to_read;
        self.to_read += count;
        RangeHandle { start, count }
    }

    /// Repeats all opcodes queued by `body` `count` times. Response words of
    /// the repeated group can only be retrieved positionally through
    /// [`TransactionResults::words`].
    pub fn repeat(&mut self, count: usize, body: impl FnOnce(&mut Transaction)) {
        let outer_buffer = std::mem::take(&mut self.buffer);
        let outer_to_read = std::mem::replace(&mut self.to_read, 0);
        body(self);
        let group_buffer = std::mem::take(&mut self.buffer);
        let group_to_read = std::mem::replace(&mut self.to_read, 0);
        self.buffer = outer_buffer;
        for _ in 0..count {
            self.buffer.extend_from_slice(&group_buffer);
        }
        self.to_read = outer_to_read + group_to_read * count;
    }

    /// Captures the IDCODE of the TAP.
    pub fn identify(&mut self) -> WordHandle {
        self.cmd(OP_GET_ID, 0, None);
        self.ret()
    }

    /// Reads an EmbeddedICE register.
    pub fn eice_get(&mut self, reg: EiceReg) -> WordHandle {
        self.cmd(OP_GET_REG, reg as u8, None);
        self.ret()
    }

    /// Writes an EmbeddedICE register. Mask registers are inverted here so
    /// that a 1 bit in `value` means "must match".
    pub fn eice_set(&mut self, reg: EiceReg, value: u32) {
        let value = if reg.is_mask() { !value } else { value };
        self.cmd(OP_SET_REG, reg as u8, Some(value));
    }

    /// Writes back a register value exactly as previously returned by
    /// [`Transaction::eice_get`], without the mask inversion.
    pub fn eice_set_raw(&mut self, reg: EiceReg, value: u32) {
        self.cmd(OP_SET_REG, reg as u8, Some(value));
    }

    /// Polls the debug status register until TRANS[1] and DBGACK are both
    /// high. A plain poll produces no response word until completion.
    pub fn eice_poll(&mut self) {
        self.cmd(OP_POLL_ACK, 0, None);
    }

    /// Configures a watchpoint unit to halt on any fetch of `address`, with
    /// `width` of 2 (Thumb) or 4 (ARM) bytes.
    pub fn watchpt_fetch_addr(&mut self, unit: usize, address: u32, width: u32) {
        let size = match width {
            4 => 0b10,
            2 => 0b01,
            _ => panic!("unsupported fetch width {width}"),
        };
        // Disable the unit before reprogramming it.
        self.eice_set(EiceReg::wx_ctrl_val(unit), 0);
        self.eice_set(EiceReg::wx_addr_msk(unit), 0xffffffff & !(width - 1));
        self.eice_set(EiceReg::wx_addr_val(unit), address);
        self.eice_set(EiceReg::wx_data_msk(unit), 0);
        self.eice_set(EiceReg::wx_data_val(unit), 0);
        self.eice_set(EiceReg::wx_ctrl_msk(unit), 0b01 << 3 | 0b11 << 1); // PROT, SIZE
        self.eice_set(
            EiceReg::wx_ctrl_val(unit),
            size << 1 | 1 << 8, // SIZE, ENABLE; PROT=0b00 selects fetches
        );
    }

    /// Configures a watchpoint unit to halt on any fetch of the data pattern
    /// `pattern` (used for software breakpoint trap instructions).
    pub fn watchpt_fetch_data(&mut self, unit: usize, pattern: u32, width: u32) {
        let data = match width {
            4 => pattern,
            2 => (pattern << 16) | (pattern & 0xffff),
            _ => panic!("unsupported fetch width {width}"),
        };
        self.eice_set(EiceReg::wx_ctrl_val(unit), 0);
        self.eice_set(EiceReg::wx_addr_msk(unit), 0);
        self.eice_set(EiceReg::wx_addr_val(unit), 0);
        self.eice_set(EiceReg::wx_data_msk(unit), 0xffffffff);
        self.eice_set(EiceReg::wx_data_val(unit), data);
        self.eice_set(EiceReg::wx_ctrl_msk(unit), 0b01 << 3); // PROT
        self.eice_set(EiceReg::wx_ctrl_val(unit), 1 << 8); // ENABLE
    }

    /// Configures watchpoint 1 to match only the instruction at `address`
    /// (left disabled), and watchpoint 0 to match any fetch *except* it via
    /// RANGE inversion. Used for single-stepping.
    pub fn watchpt_step(&mut self, address: u32, width: u32) {
        let size = match width {
            4 => 0b10,
            2 => 0b01,
            _ => panic!("unsupported fetch width {width}"),
        };
        self.eice_set(EiceReg::W1CtrlVal, 0);
        self.eice_set(EiceReg::W0CtrlVal, 0);
        // Watchpoint 1 matches only on the current instruction address. It
        // must not be enabled: its output feeds unit 0 through RANGE.
        self.eice_set(EiceReg::W1AddrMsk, 0xffffffff & !(width - 1));
        self.eice_set(EiceReg::W1AddrVal, address);
        self.eice_set(EiceReg::W1DataMsk, 0);
        self.eice_set(EiceReg::W1DataVal, 0);
        self.eice_set(EiceReg::W1CtrlMsk, 0b01 << 3 | 0b11 << 1); // PROT, SIZE
        self.eice_set(EiceReg::W1CtrlVal, size << 1); // SIZE only
        // Watchpoint 0 inverts the output of watchpoint 1, matching on every
        // instruction but the one at the given address.
        self.eice_set(EiceReg::W0AddrMsk, 0);
        self.eice_set(EiceReg::W0DataMsk, 0);
        self.eice_set(EiceReg::W0CtrlMsk, 1 << 7); // RANGE
        self.eice_set(EiceReg::W0CtrlVal, 1 << 8); // ENABLE, RANGE=0
    }

    /// Disables a watchpoint unit.
    pub fn watchpt_clear(&mut self, unit: usize) {
        self.eice_set(EiceReg::wx_ctrl_val(unit), 0);
    }

    pub(super) fn restart(&mut self) {
        self.cmd(OP_RESTART, 0, None);
    }

    /// Drives an ARM instruction onto the data bus. With `sys`, the *next*
    /// instruction after this one executes at system speed.
    fn a_exec(&mut self, insn: u32, sys: bool) {
        self.cmd(OP_PUT_BUS, sys as u8, Some(insn));
    }

    /// Drives a Thumb instruction onto both halves of the data bus.
    fn t_exec(&mut self, insn: u32, sys: bool) {
        debug_assert!(insn & !0xffff == 0);
        self.cmd(OP_PUT_BUS, sys as u8, Some((insn << 16) | insn));
    }

    /// Feeds data words to instructions executing out of the debug data bus.
    fn load(&mut self, words: &[u32]) {
        for &word in words {
            self.cmd(OP_PUT_BUS, 0, Some(word));
        }
    }

    /// Captures one word the core drives onto the data bus.
    fn store(&mut self) -> WordHandle {
        self.cmd(OP_GET_BUS, 0, None);
        self.ret()
    }

    fn store_range(&mut self, count: usize) -> RangeHandle {
        for _ in 0..count {
            self.cmd(OP_GET_BUS, 0, None);
        }
        self.ret_range(count)
    }

    /// Executes a load/store instruction at system speed, surrounded by the
    /// required nops, restart and re-entry poll.
    fn a_ld_st_sys(&mut self, insn: u32) {
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), true);
        self.a_exec(insn, false);
        self.restart();
        self.eice_poll();
        self.a_exec(instr::a_mov(8, 8), false);
    }

    /// `str rt, [r0]` in Thumb state; captures the stored word.
    pub fn t_str(&mut self, rt: u32) -> WordHandle {
        self.t_exec(instr::t_str(rt, 0), false);
        self.t_exec(instr::t_mov(8, 8), false);
        self.t_exec(instr::t_mov(8, 8), false);
        self.store()
    }

    /// `str rt, [r0]`; captures the stored word.
    pub fn a_str(&mut self, rt: u32) -> WordHandle {
        self.a_exec(instr::a_str(rt, 0), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.store()
    }

    /// `stm rn, {mask}`; captures one word per set mask bit.
    pub fn a_stm(&mut self, rn: u32, mask: u32) -> RangeHandle {
        self.a_exec(instr::a_stm(rn, mask, false), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.store_range(mask.count_ones() as usize)
    }

    /// `ldr rt, <imm32>` in Thumb state, feeding the literal over the bus.
    pub fn t_ldr(&mut self, rt: u32, imm32: u32) {
        self.t_exec(instr::t_ldr_lit(rt, 0), false);
        self.t_exec(instr::t_mov(8, 8), false);
        self.t_exec(instr::t_mov(8, 8), false);
        self.load(&[imm32]);
        self.t_exec(instr::t_mov(8, 8), false);
    }

    /// `ldr rt, <imm32>`, feeding the literal over the bus.
    pub fn a_ldr(&mut self, rt: u32, imm32: u32) {
        self.a_exec(instr::a_ldr(rt, 15, 0), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.load(&[imm32]);
        self.a_exec(instr::a_mov(8, 8), false);
    }

    /// `ldm rn{!}, {mask}`, feeding `words` over the bus.
    pub fn a_ldm(&mut self, rn: u32, mask: u32, words: &[u32], writeback: bool) {
        debug_assert_eq!(words.len(), mask.count_ones() as usize);
        self.a_exec(instr::a_ldm(rn, mask, writeback), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.load(words);
        self.a_exec(instr::a_mov(8, 8), false);
    }

    /// `stm rn{!}, {mask}` at system speed (accessing target memory).
    pub fn a_stm_sys(&mut self, rn: u32, mask: u32, writeback: bool) {
        self.a_ld_st_sys(instr::a_stm(rn, mask, writeback));
    }

    /// `strh rt, [rn], #imm` at system speed.
    pub fn a_strh_sys(&mut self, rt: u32, rn: u32, imm: u32) {
        self.a_ld_st_sys(instr::a_strh(rt, rn, imm));
    }

    /// `strb rt, [rn], #imm` at system speed.
    pub fn a_strb_sys(&mut self, rt: u32, rn: u32, imm: u32) {
        self.a_ld_st_sys(instr::a_strb(rt, rn, imm));
    }

    /// `ldm rn{!}, {mask}` at system speed.
    pub fn a_ldm_sys(&mut self, rn: u32, mask: u32, writeback: bool) {
        self.a_ld_st_sys(instr::a_ldm(rn, mask, writeback));
    }

    /// `ldrh rt, [rn], #imm` at system speed.
    pub fn a_ldrh_sys(&mut self, rt: u32, rn: u32, imm: u32) {
        self.a_ld_st_sys(instr::a_ldrh(rt, rn, imm));
    }

    /// `ldrb rt, [rn], #imm` at system speed.
    pub fn a_ldrb_sys(&mut self, rt: u32, rn: u32, imm: u32) {
        self.a_ld_st_sys(instr::a_ldrb(rt, rn, imm));
    }

    /// `mrs rd, cpsr`
    pub fn a_mrs_cpsr(&mut self, rd: u32) {
        self.a_exec(instr::a_mrs(rd, 0), false);
    }

    /// `mrs rd, spsr`
    pub fn a_mrs_spsr(&mut self, rd: u32) {
        self.a_exec(instr::a_mrs(rd, 1), false);
    }

    /// `msr cpsr_c, #imm`
    pub fn a_msr_cpsr_c(&mut self, imm: u32) {
        debug_assert!(imm < 0x100);
        self.a_exec(instr::a_msr_lit(0, 0x1, imm), false);
    }

    /// `msr cpsr_fsxc, rn`
    pub fn a_msr_cpsr_fsxc(&mut self, rn: u32) {
        self.a_exec(instr::a_msr_reg(0, 0xf, rn), false);
    }

    /// `msr spsr_fsxc, rn`
    pub fn a_msr_spsr_fsxc(&mut self, rn: u32) {
        self.a_exec(instr::a_msr_reg(1, 0xf, rn), false);
    }

    /// Debug entry prologue in Thumb state: captures R0 and the raw PC.
    pub fn t_dbg_enter(&mut self) -> (WordHandle, WordHandle) {
        let r0 = self.t_str(0);
        self.t_exec(instr::t_mov(0, 15), false);
        let pc = self.t_str(0);
        self.t_exec(instr::t_eor(0, 0), false);
        self.t_exec(instr::t_bx(0), false);
        self.t_exec(instr::t_mov(8, 8), false);
        self.t_exec(instr::t_mov(8, 8), false);
        (r0, pc)
    }

    /// Debug entry prologue in ARM state: captures R0 and the raw PC.
    pub fn a_dbg_enter(&mut self) -> (WordHandle, WordHandle) {
        let r0 = self.a_str(0);
        self.a_exec(instr::a_mov(0, 15), false);
        let pc = self.a_str(0);
        (r0, pc)
    }

    /// Debug exit epilogue resuming Thumb execution at `pc` with the given R0.
    pub fn t_dbg_exit(&mut self, r0: u32, pc: u32) {
        self.a_ldr(0, pc | 1);
        self.a_exec(instr::a_bx(0), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.t_ldr(0, r0);
        self.t_exec(instr::t_mov(8, 8), false);
        self.t_exec(instr::t_mov(8, 8), true);
        self.t_exec(instr::t_b(-7), false);
        self.restart();
    }

    /// Debug exit epilogue resuming ARM execution at `pc` with the given R0.
    pub fn a_dbg_exit(&mut self, r0: u32, pc: u32) {
        self.a_ldr(0, pc);
        self.a_exec(instr::a_mov(15, 0), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_ldr(0, r0);
        self.a_exec(instr::a_mov(8, 8), false);
        self.a_exec(instr::a_mov(8, 8), true);
        self.a_exec(instr::a_b(-7), false);
        self.restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn eice_set_inverts_masks() {
        let mut txn = Transaction::new();
        txn.eice_set(EiceReg::W0AddrMsk, 0xffff_fffc);
        assert_eq!(
            txn.buffer(),
            &[(OP_SET_REG << 5) | EiceReg::W0AddrMsk as u8, 0x03, 0, 0, 0]
        );
    }

    #[test]
    fn eice_set_passes_values_through() {
        let mut txn = Transaction::new();
        txn.eice_set(EiceReg::W0AddrVal, 0x1234_5678);
        assert_eq!(
            txn.buffer(),
            &[
                (OP_SET_REG << 5) | EiceReg::W0AddrVal as u8,
                0x78,
                0x56,
                0x34,
                0x12
            ]
        );
    }

    #[test]
    fn get_commands_allocate_response_words() {
        let mut txn = Transaction::new();
        let id = txn.identify();
        let sta = txn.eice_get(EiceReg::DbgSta);
        assert_eq!(txn.to_read(), 2);

        let results = TransactionResults(vec![0x3ba00477, 0x19]);
        assert_eq!(results.word(id), 0x3ba00477);
        assert_eq!(results.word(sta), 0x19);
    }

    #[test]
    fn stm_captures_one_word_per_register() {
        let mut txn = Transaction::new();
        let regs = txn.a_stm(0, 0x7ffe);
        assert_eq!(txn.to_read(), 14);
        let results = TransactionResults((0..14).collect());
        assert_eq!(results.range(regs).len(), 14);
    }

    #[test]
    fn repeat_duplicates_commands_and_responses() {
        let mut txn = Transaction::new();
        txn.a_ldr(0, 0x1000);
        let before = txn.buffer().len();
        txn.repeat(3, |txn| {
            txn.a_ldrb_sys(1, 0, 1);
            txn.a_str(1);
        });
        let mut group = Transaction::new();
        group.a_ldrb_sys(1, 0, 1);
        group.a_str(1);
        assert_eq!(txn.buffer().len(), before + 3 * group.buffer().len());
        assert_eq!(txn.to_read(), 3 * group.to_read());
    }

    #[test]
    fn thumb_exec_duplicates_halfwords() {
        let mut txn = Transaction::new();
        txn.t_ldr(0, 0);
        // First opcode drives `ldr r0, [pc, #0]` on both bus halves.
        assert_eq!(txn.buffer()[0], OP_PUT_BUS << 5);
        let insn = u32::from_le_bytes(txn.buffer()[1..5].try_into().unwrap());
        assert_eq!(insn, 0x4800_4800);
    }
}

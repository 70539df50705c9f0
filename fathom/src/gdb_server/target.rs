//! The interface a debug engine exposes to the GDB server, and its
//! implementations for the supported architectures.

use crate::architecture::arm7::{Arm7Debug, BreakpointKind};
use crate::architecture::mips::{EjtagDebug, EjtagError};
use crate::probe::TransportError;
use crate::util::Endianness;
use crate::Error;

/// Target description served for ARMv4T cores via `qXfer:features:read`.
pub const ARMV4T_TARGET_XML: &[u8] = br#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
    <architecture>armv4t</architecture>
    <feature name="org.gnu.gdb.arm.core">
        <reg name="r0" bitsize="32" type="uint32"/>
        <reg name="r1" bitsize="32" type="uint32"/>
        <reg name="r2" bitsize="32" type="uint32"/>
        <reg name="r3" bitsize="32" type="uint32"/>
        <reg name="r4" bitsize="32" type="uint32"/>
        <reg name="r5" bitsize="32" type="uint32"/>
        <reg name="r6" bitsize="32" type="uint32"/>
        <reg name="r7" bitsize="32" type="uint32"/>
        <reg name="r8" bitsize="32" type="uint32"/>
        <reg name="r9" bitsize="32" type="uint32"/>
        <reg name="r10" bitsize="32" type="uint32"/>
        <reg name="r11" bitsize="32" type="uint32"/>
        <reg name="r12" bitsize="32" type="uint32"/>
        <reg name="sp" bitsize="32" type="data_ptr"/>
        <reg name="lr" bitsize="32"/>
        <reg name="pc" bitsize="32" type="code_ptr"/>
        <reg name="cpsr" bitsize="32"/>
    </feature>
</target>"#;

/// Target description served for MIPS32 cores via `qXfer:features:read`.
/// The register order matches the raw GDB numbering: r0..r31, sr, lo, hi,
/// bad, cause, pc.
pub const MIPS32_TARGET_XML: &[u8] = br#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
    <architecture>mips</architecture>
    <feature name="org.gnu.gdb.mips.cpu">
        <reg name="r0" bitsize="32"/><reg name="r1" bitsize="32"/>
        <reg name="r2" bitsize="32"/><reg name="r3" bitsize="32"/>
        <reg name="r4" bitsize="32"/><reg name="r5" bitsize="32"/>
        <reg name="r6" bitsize="32"/><reg name="r7" bitsize="32"/>
        <reg name="r8" bitsize="32"/><reg name="r9" bitsize="32"/>
        <reg name="r10" bitsize="32"/><reg name="r11" bitsize="32"/>
        <reg name="r12" bitsize="32"/><reg name="r13" bitsize="32"/>
        <reg name="r14" bitsize="32"/><reg name="r15" bitsize="32"/>
        <reg name="r16" bitsize="32"/><reg name="r17" bitsize="32"/>
        <reg name="r18" bitsize="32"/><reg name="r19" bitsize="32"/>
        <reg name="r20" bitsize="32"/><reg name="r21" bitsize="32"/>
        <reg name="r22" bitsize="32"/><reg name="r23" bitsize="32"/>
        <reg name="r24" bitsize="32"/><reg name="r25" bitsize="32"/>
        <reg name="r26" bitsize="32"/><reg name="r27" bitsize="32"/>
        <reg name="r28" bitsize="32"/><reg name="r29" bitsize="32"/>
        <reg name="r30" bitsize="32"/><reg name="r31" bitsize="32"/>
        <reg name="sr" bitsize="32"/><reg name="lo" bitsize="32"/>
        <reg name="hi" bitsize="32"/><reg name="bad" bitsize="32"/>
        <reg name="cause" bitsize="32"/><reg name="pc" bitsize="32"/>
    </feature>
</target>"#;

/// Callback the server passes into [`GdbTarget::resume`]; returns `true` once
/// the debugger has requested an interrupt (`^C`).
pub type InterruptFn<'a> = &'a mut dyn FnMut() -> Result<bool, TransportError>;

/// A debug engine as seen by the GDB remote serial protocol server.
pub trait GdbTarget {
    /// Target word size, in bytes.
    fn word_size(&self) -> usize;

    /// Target byte order.
    fn endianness(&self) -> Endianness;

    /// Target triple.
    fn triple(&self) -> &'static str;

    /// Target description documents, keyed by annex name (notably
    /// `target.xml`).
    fn features(&self) -> Vec<(&'static str, &'static [u8])>;

    /// Whether the target is running. `false` when halted.
    fn is_running(&self) -> bool;

    /// Stops the target. Only called when running.
    fn stop(&mut self) -> Result<(), Error>;

    /// Resumes the target and waits for the next halt, polling `interrupt`
    /// while doing so. Only called when halted.
    fn resume(&mut self, interrupt: InterruptFn<'_>) -> Result<(), Error>;

    /// Single-steps the target. Only called when halted.
    fn single_step(&mut self) -> Result<(), Error>;

    /// Detaches from the target: clears all breakpoints and resumes it.
    fn detach(&mut self) -> Result<(), Error>;

    /// Returns all register values in the order GDB expects.
    fn get_registers(&mut self) -> Result<Vec<u64>, Error>;

    /// Updates all register values in the order GDB expects.
    fn set_registers(&mut self, values: &[u64]) -> Result<(), Error>;

    /// Returns one register value by its GDB number.
    fn get_register(&mut self, number: usize) -> Result<u64, Error>;

    /// Updates one register value by its GDB number.
    fn set_register(&mut self, number: usize, value: u64) -> Result<(), Error>;

    /// Reads target memory.
    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error>;

    /// Writes target memory.
    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error>;

    /// Sets a software breakpoint. Returns [`Error::NotImplemented`] when the
    /// breakpoint kind is unsupported; the server then reports the packet as
    /// unrecognized so GDB falls back to another mechanism.
    fn set_software_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error>;

    /// Clears a software breakpoint.
    fn clear_software_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error>;

    /// Sets a hardware breakpoint.
    fn set_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error>;

    /// Clears a hardware breakpoint.
    fn clear_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error>;
}

fn arm7_soft_kind(kind: usize) -> Result<BreakpointKind, Error> {
    match kind {
        4 => Ok(BreakpointKind::SoftArm),
        2 => Ok(BreakpointKind::SoftThumb),
        _ => Err(Error::NotImplemented("unsupported breakpoint kind")),
    }
}

fn arm7_hard_kind(kind: usize) -> Result<BreakpointKind, Error> {
    match kind {
        4 => Ok(BreakpointKind::HardArm),
        2 => Ok(BreakpointKind::HardThumb),
        _ => Err(Error::NotImplemented("unsupported breakpoint kind")),
    }
}

impl GdbTarget for Arm7Debug {
    fn word_size(&self) -> usize {
        4
    }

    fn endianness(&self) -> Endianness {
        Arm7Debug::endianness(self)
    }

    fn triple(&self) -> &'static str {
        "armv4t-none-eabi"
    }

    fn features(&self) -> Vec<(&'static str, &'static [u8])> {
        vec![("target.xml", ARMV4T_TARGET_XML)]
    }

    fn is_running(&self) -> bool {
        !self.is_halted()
    }

    fn stop(&mut self) -> Result<(), Error> {
        Ok(self.target_stop()?)
    }

    fn resume(&mut self, interrupt: InterruptFn<'_>) -> Result<(), Error> {
        self.target_continue(interrupt)?;
        Ok(())
    }

    fn single_step(&mut self) -> Result<(), Error> {
        Ok(self.target_single_step()?)
    }

    fn detach(&mut self) -> Result<(), Error> {
        Ok(self.target_detach()?)
    }

    fn get_registers(&mut self) -> Result<Vec<u64>, Error> {
        let context = self
            .context()
            .ok_or(Error::NotImplemented("registers are unavailable while running"))?;
        Ok((0..17)
            .map(|number| context.get_reg(number).expect("17 GDB registers") as u64)
            .collect())
    }

    fn set_registers(&mut self, values: &[u64]) -> Result<(), Error> {
        let context = self
            .context_mut()
            .ok_or(Error::NotImplemented("registers are unavailable while running"))?;
        for (number, &value) in values.iter().enumerate().take(17) {
            context.set_reg(number, value as u32);
        }
        Ok(())
    }

    fn get_register(&mut self, number: usize) -> Result<u64, Error> {
        let context = self
            .context()
            .ok_or(Error::NotImplemented("registers are unavailable while running"))?;
        context
            .get_reg(number)
            .map(|value| value as u64)
            .ok_or(Error::NotImplemented("unsupported register number"))
    }

    fn set_register(&mut self, number: usize, value: u64) -> Result<(), Error> {
        let context = self
            .context_mut()
            .ok_or(Error::NotImplemented("registers are unavailable while running"))?;
        context
            .set_reg(number, value as u32)
            .ok_or(Error::NotImplemented("unsupported register number"))
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        Ok(self.target_read_memory(address as u32, length)?)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        Ok(self.target_write_memory(address as u32, data)?)
    }

    fn set_software_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        Ok(self.set_breakpoint(address as u32, arm7_soft_kind(kind)?)?)
    }

    fn clear_software_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        Ok(self.clear_breakpoint(address as u32, arm7_soft_kind(kind)?)?)
    }

    fn set_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        Ok(self.set_breakpoint(address as u32, arm7_hard_kind(kind)?)?)
    }

    fn clear_hardware_breakpoint(&mut self, address: u64, kind: usize) -> Result<(), Error> {
        Ok(self.clear_breakpoint(address as u32, arm7_hard_kind(kind)?)?)
    }
}

impl GdbTarget for EjtagDebug {
    fn word_size(&self) -> usize {
        EjtagDebug::word_size(self) as usize
    }

    fn endianness(&self) -> Endianness {
        EjtagDebug::endianness(self)
    }

    fn triple(&self) -> &'static str {
        match EjtagDebug::endianness(self) {
            Endianness::Big => "mips-unknown-none",
            Endianness::Little => "mipsel-unknown-none",
        }
    }

    fn features(&self) -> Vec<(&'static str, &'static [u8])> {
        vec![("target.xml", MIPS32_TARGET_XML)]
    }

    fn is_running(&self) -> bool {
        EjtagDebug::is_running(self)
    }

    fn stop(&mut self) -> Result<(), Error> {
        Ok(self.target_stop()?)
    }

    fn resume(&mut self, interrupt: InterruptFn<'_>) -> Result<(), Error> {
        self.target_continue(interrupt)?;
        Ok(())
    }

    fn single_step(&mut self) -> Result<(), Error> {
        Ok(self.target_single_step()?)
    }

    fn detach(&mut self) -> Result<(), Error> {
        Ok(self.target_detach()?)
    }

    fn get_registers(&mut self) -> Result<Vec<u64>, Error> {
        Ok(self.target_get_registers()?)
    }

    fn set_registers(&mut self, values: &[u64]) -> Result<(), Error> {
        Ok(self.target_set_registers(values)?)
    }

    fn get_register(&mut self, number: usize) -> Result<u64, Error> {
        match self.target_get_register(number) {
            Err(EjtagError::UnsupportedRegister(_)) => {
                Err(Error::NotImplemented("unsupported register number"))
            }
            result => Ok(result?),
        }
    }

    fn set_register(&mut self, number: usize, value: u64) -> Result<(), Error> {
        match self.target_set_register(number, value) {
            Err(EjtagError::UnsupportedRegister(_)) => {
                Err(Error::NotImplemented("unsupported register number"))
            }
            result => Ok(result?),
        }
    }

    fn read_memory(&mut self, address: u64, length: usize) -> Result<Vec<u8>, Error> {
        Ok(self.target_read_memory(address, length)?)
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), Error> {
        Ok(self.target_write_memory(address, data)?)
    }

    fn set_software_breakpoint(&mut self, address: u64, _kind: usize) -> Result<(), Error> {
        Ok(self.target_set_software_breakpoint(address)?)
    }

    fn clear_software_breakpoint(&mut self, address: u64, _kind: usize) -> Result<(), Error> {
        Ok(self.target_clear_software_breakpoint(address)?)
    }

    fn set_hardware_breakpoint(&mut self, address: u64, _kind: usize) -> Result<(), Error> {
        Ok(self.target_set_instr_breakpoint(address)?)
    }

    fn clear_hardware_breakpoint(&mut self, address: u64, _kind: usize) -> Result<(), Error> {
        Ok(self.target_clear_instr_breakpoint(address)?)
    }
}

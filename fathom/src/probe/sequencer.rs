//! Client for the JTAG sequencer protocol.
//!
//! Each command is a single header byte `[reserved:3 | last:1 | cmd:4]`,
//! optionally followed by a 16-bit little-endian count and a bit payload
//! packed LSB-first into bytes. Shifts longer than 0xFFFF bits are split into
//! chunks, with the LAST flag asserted only on the final chunk. The probe
//! executes commands strictly in order; only `ShiftTdo`, `ShiftTdio`,
//! `GetAux` and `Sync` produce response bytes.

use bitvec::prelude::*;

use crate::probe::{BytePipe, TransportError};
use crate::util::bits::{self, Bits};

pub(crate) const CMD_RUN_TCK: u8 = 0;
pub(crate) const CMD_SHIFT_TDI: u8 = 1;
pub(crate) const CMD_SHIFT_TDO: u8 = 2;
pub(crate) const CMD_SHIFT_TDIO: u8 = 3;
pub(crate) const CMD_SHIFT_TMS: u8 = 4;
pub(crate) const CMD_SYNC: u8 = 5;
pub(crate) const CMD_DELAY: u8 = 6;
pub(crate) const CMD_DELAY_RUN_TCK: u8 = 7;
pub(crate) const CMD_GET_AUX: u8 = 8;
pub(crate) const CMD_SET_AUX: u8 = 9;

pub(crate) const CMD_BIT_LAST: u8 = 1 << 4;

/// Maximum number of bits or microseconds covered by a single command.
const CHUNK_MAX: usize = 0xffff;

/// By convention, aux bits 0:1 are TRST#.Z and TRST#.O if the probe adapter
/// provides TRST#.
pub const AUX_TRST_Z: u8 = 0b01;
/// See [`AUX_TRST_Z`].
pub const AUX_TRST_O: u8 = 0b10;

fn chunk_counts(mut count: usize, last: bool) -> Vec<(usize, bool)> {
    let mut chunks = Vec::new();
    while count > CHUNK_MAX {
        chunks.push((CHUNK_MAX, false));
        count -= CHUNK_MAX;
    }
    chunks.push((count, last));
    chunks
}

fn chunk_bits(data: &BitSlice<u8, Lsb0>, last: bool) -> Vec<(&BitSlice<u8, Lsb0>, bool)> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while data.len() - offset > CHUNK_MAX {
        chunks.push((&data[offset..offset + CHUNK_MAX], false));
        offset += CHUNK_MAX;
    }
    chunks.push((&data[offset..], last));
    chunks
}

/// Byte-oriented client for the JTAG sequencer pipe.
pub struct Sequencer {
    pipe: Box<dyn BytePipe>,
}

impl Sequencer {
    /// Wraps a probe pipe connected to the JTAG sequencer applet.
    pub fn new(pipe: Box<dyn BytePipe>) -> Self {
        Sequencer { pipe }
    }

    fn command(&mut self, cmd: u8, last: bool, count: Option<usize>) -> Result<(), TransportError> {
        let header = cmd | if last { CMD_BIT_LAST } else { 0 };
        match count {
            Some(count) => {
                debug_assert!(count <= CHUNK_MAX);
                let mut buffer = [0; 3];
                buffer[0] = header;
                buffer[1..3].copy_from_slice(&(count as u16).to_le_bytes());
                self.pipe.send(&buffer)
            }
            None => self.pipe.send(&[header]),
        }
    }

    /// Forces transmission of all batched commands.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        tracing::trace!("flush");
        self.pipe.flush()
    }

    /// Pulses TCK `count` times with TMS low and TDI high. With `last`, TMS is
    /// asserted on the final pulse.
    pub fn run_tck(&mut self, count: usize, last: bool) -> Result<(), TransportError> {
        for (count, chunk_last) in chunk_counts(count, last) {
            self.command(CMD_RUN_TCK, chunk_last, Some(count))?;
        }
        Ok(())
    }

    /// Shifts the given bits out on TMS.
    pub fn shift_tms(&mut self, tms: &BitSlice<u8, Lsb0>) -> Result<(), TransportError> {
        tracing::trace!("shift tms=<{}>", bits::dump(tms));
        for (chunk, _) in chunk_bits(tms, false) {
            self.command(CMD_SHIFT_TMS, false, Some(chunk.len()))?;
            self.pipe.send(&bits::to_bytes(chunk))?;
        }
        Ok(())
    }

    /// Shifts the given bits out on TDI, discarding TDO. With `last`, TMS is
    /// asserted on the final bit.
    pub fn shift_tdi(&mut self, tdi: &BitSlice<u8, Lsb0>, last: bool) -> Result<(), TransportError> {
        tracing::trace!("shift tdi=<{}>", bits::dump(tdi));
        for (chunk, chunk_last) in chunk_bits(tdi, last) {
            self.command(CMD_SHIFT_TDI, chunk_last, Some(chunk.len()))?;
            self.pipe.send(&bits::to_bytes(chunk))?;
        }
        Ok(())
    }

    /// Shifts `count` bits in from TDO with TDI held high. With `last`, TMS is
    /// asserted on the final bit.
    pub fn shift_tdo(&mut self, count: usize, last: bool) -> Result<Bits, TransportError> {
        let mut tdo = Bits::new();
        for (count, chunk_last) in chunk_counts(count, last) {
            self.command(CMD_SHIFT_TDO, chunk_last, Some(count))?;
            self.pipe.flush()?;
            let bytes = self.pipe.recv(count.div_ceil(8))?;
            tdo.extend_from_bitslice(&bits::from_bytes(&bytes, count));
        }
        tracing::trace!("shift tdo=<{}>", bits::dump(&tdo));
        Ok(tdo)
    }

    /// Shifts the given bits out on TDI while capturing TDO. The payload is
    /// sent and the response received interleaved, one chunk at a time.
    pub fn shift_tdio(
        &mut self,
        tdi: &BitSlice<u8, Lsb0>,
        last: bool,
    ) -> Result<Bits, TransportError> {
        tracing::trace!("shift tdio-o=<{}>", bits::dump(tdi));
        let mut tdo = Bits::new();
        for (chunk, chunk_last) in chunk_bits(tdi, last) {
            self.command(CMD_SHIFT_TDIO, chunk_last, Some(chunk.len()))?;
            let tdi_bytes = bits::to_bytes(chunk);
            self.pipe.send(&tdi_bytes)?;
            self.pipe.flush()?;
            let tdo_bytes = self.pipe.recv(tdi_bytes.len())?;
            tdo.extend_from_bitslice(&bits::from_bytes(&tdo_bytes, chunk.len()));
        }
        tracing::trace!("shift tdio-i=<{}>", bits::dump(&tdo));
        Ok(tdo)
    }

    /// Stops the clock for the given number of microseconds.
    pub fn delay_us(&mut self, duration: usize) -> Result<(), TransportError> {
        tracing::trace!("delay us={duration}");
        for (count, _) in chunk_counts(duration, false) {
            self.command(CMD_DELAY, false, Some(count))?;
        }
        Ok(())
    }

    /// Pulses TCK with TMS low, once per microsecond, for the given duration.
    pub fn delay_run_tck_us(&mut self, duration: usize) -> Result<(), TransportError> {
        tracing::trace!("delay pulse tck us={duration}");
        for (count, _) in chunk_counts(duration, false) {
            self.command(CMD_DELAY_RUN_TCK, false, Some(count))?;
        }
        Ok(())
    }

    /// Waits until every batched command has been executed. The sequencer
    /// produces exactly one response byte once it reaches this command.
    pub fn sync(&mut self) -> Result<(), TransportError> {
        tracing::trace!("sync-o");
        self.command(CMD_SYNC, false, None)?;
        self.pipe.flush()?;
        self.pipe.recv(1)?;
        tracing::trace!("sync-i");
        Ok(())
    }

    /// Updates the auxiliary sideband outputs.
    pub fn set_aux(&mut self, value: u8) -> Result<(), TransportError> {
        tracing::trace!("set aux={value:08b}");
        self.command(CMD_SET_AUX, false, None)?;
        self.pipe.send(&[value])
    }

    /// Samples the auxiliary sideband inputs.
    pub fn get_aux(&mut self) -> Result<u8, TransportError> {
        self.command(CMD_GET_AUX, false, None)?;
        self.pipe.flush()?;
        let value = self.pipe.recv(1)?[0];
        tracing::trace!("get aux={value:08b}");
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::MockPipe;
    use pretty_assertions::assert_eq;

    #[test]
    fn shift_tdi_encoding() {
        let (pipe, handle) = MockPipe::new();
        let mut seq = Sequencer::new(Box::new(pipe));
        seq.shift_tdi(&bits::from_int(0b0101, 4), true).unwrap();
        assert_eq!(
            handle.sent(),
            vec![CMD_SHIFT_TDI | CMD_BIT_LAST, 0x04, 0x00, 0b0101]
        );
    }

    #[test]
    fn shift_tdio_exchange() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&[0x5a]);
        let mut seq = Sequencer::new(Box::new(pipe));
        let tdo = seq.shift_tdio(&bits::from_int(0xff, 8), false).unwrap();
        assert_eq!(bits::to_int(&tdo), 0x5a);
        assert_eq!(handle.sent(), vec![CMD_SHIFT_TDIO, 0x08, 0x00, 0xff]);
    }

    #[test]
    fn run_tck_chunking() {
        let (pipe, handle) = MockPipe::new();
        let mut seq = Sequencer::new(Box::new(pipe));
        seq.run_tck(0x1_0001, true).unwrap();
        assert_eq!(
            handle.sent(),
            vec![
                CMD_RUN_TCK,
                0xff,
                0xff,
                CMD_RUN_TCK | CMD_BIT_LAST,
                0x02,
                0x00,
            ]
        );
    }

    #[test]
    fn shift_tdo_rounds_up_to_bytes() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&[0xff, 0x01]);
        let mut seq = Sequencer::new(Box::new(pipe));
        let tdo = seq.shift_tdo(9, true).unwrap();
        assert_eq!(tdo.len(), 9);
        assert_eq!(bits::to_int(&tdo), 0x1ff);
        assert_eq!(handle.sent(), vec![CMD_SHIFT_TDO | CMD_BIT_LAST, 0x09, 0x00]);
    }

    #[test]
    fn sync_consumes_one_byte() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&[0x00]);
        let mut seq = Sequencer::new(Box::new(pipe));
        seq.sync().unwrap();
        assert_eq!(handle.sent(), vec![CMD_SYNC]);
    }
}

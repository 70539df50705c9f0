//! Client for the QSPI controller protocol.
//!
//! Each command is a single header byte `[cmd:4 | arg:4]`; `Transfer` and
//! `Delay` are followed by a 16-bit little-endian count, and `Transfer` in a
//! put mode by the data octets. Responses are produced by get-mode transfers
//! (one octet per count) and by `Sync` (exactly one octet).

use crate::probe::{BytePipe, TransportError};
use crate::probe::pipe::hexdump;

const CMD_SELECT: u8 = 0;
const CMD_TRANSFER: u8 = 1;
const CMD_DELAY: u8 = 2;
const CMD_SYNC: u8 = 3;

/// Maximum number of octets or microseconds covered by a single command.
const CHUNK_MAX: usize = 0xffff;

/// Transfer mode of a QSPI octet, including the I/O line width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QspiMode {
    /// Clock only; all I/O lines high-Z.
    Dummy = 0,
    /// Write on IO0.
    PutX1 = 1,
    /// Read on IO1.
    GetX1 = 2,
    /// Write on IO0/IO1.
    PutX2 = 3,
    /// Read on IO0/IO1.
    GetX2 = 4,
    /// Write on IO0..IO3.
    PutX4 = 5,
    /// Read on IO0..IO3.
    GetX4 = 6,
    /// Normal SPI; write on IO0, read on IO1 simultaneously.
    Swap = 7,
}

impl QspiMode {
    fn put(width: usize) -> QspiMode {
        match width {
            1 => QspiMode::PutX1,
            2 => QspiMode::PutX2,
            4 => QspiMode::PutX4,
            _ => panic!("unsupported I/O width {width}"),
        }
    }

    fn get(width: usize) -> QspiMode {
        match width {
            1 => QspiMode::GetX1,
            2 => QspiMode::GetX2,
            4 => QspiMode::GetX4,
            _ => panic!("unsupported I/O width {width}"),
        }
    }
}

/// Byte-oriented client for the QSPI controller pipe.
pub struct QspiController {
    pipe: Box<dyn BytePipe>,
}

impl QspiController {
    /// Wraps a probe pipe connected to the QSPI controller applet.
    pub fn new(pipe: Box<dyn BytePipe>) -> Self {
        QspiController { pipe }
    }

    fn command(&mut self, cmd: u8, arg: u8, count: Option<usize>) -> Result<(), TransportError> {
        debug_assert!(arg <= 0xf);
        let header = (cmd << 4) | arg;
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
        self.pipe.flush()
    }

    /// Asserts the chip select for `index` and runs `body`, deasserting it
    /// again afterwards whether or not `body` succeeded. One dummy cycle is
    /// clocked after deassertion so the device sees CS# rise.
    pub fn with_select<T>(
        &mut self,
        index: usize,
        body: impl FnOnce(&mut Self) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        assert!(index < 8);
        tracing::trace!("select chip={index}");
        self.command(CMD_SELECT, 1 + index as u8, None)?;
        let result = body(self);
        tracing::trace!("deselect");
        self.command(CMD_SELECT, 0, None)?;
        self.command(CMD_TRANSFER, QspiMode::Dummy as u8, Some(1))?;
        self.flush()?;
        result
    }

    /// Writes octets at the given I/O width (1, 2 or 4 lines).
    pub fn write(&mut self, octets: &[u8], width: usize) -> Result<(), TransportError> {
        tracing::trace!("write={}", hexdump(octets));
        let mode = QspiMode::put(width);
        for chunk in octets.chunks(CHUNK_MAX) {
            self.command(CMD_TRANSFER, mode as u8, Some(chunk.len()))?;
            self.pipe.send(chunk)?;
        }
        Ok(())
    }

    /// Reads octets at the given I/O width (1, 2 or 4 lines).
    pub fn read(&mut self, count: usize, width: usize) -> Result<Vec<u8>, TransportError> {
        let mode = QspiMode::get(width);
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(CHUNK_MAX);
            self.command(CMD_TRANSFER, mode as u8, Some(chunk))?;
            remaining -= chunk;
        }
        self.pipe.flush()?;
        let octets = self.pipe.recv(count)?;
        tracing::trace!("read={}", hexdump(&octets));
        Ok(octets)
    }

    /// Writes octets on IO0 while reading IO1 (plain SPI exchange).
    pub fn exchange(&mut self, octets: &[u8]) -> Result<Vec<u8>, TransportError> {
        tracing::trace!("xchg-o={}", hexdump(octets));
        for chunk in octets.chunks(CHUNK_MAX) {
            self.command(CMD_TRANSFER, QspiMode::Swap as u8, Some(chunk.len()))?;
            self.pipe.send(chunk)?;
        }
        self.pipe.flush()?;
        let octets = self.pipe.recv(octets.len())?;
        tracing::trace!("xchg-i={}", hexdump(&octets));
        Ok(octets)
    }

    /// Clocks `count` cycles with all I/O lines high-Z.
    pub fn dummy(&mut self, count: usize) -> Result<(), TransportError> {
        tracing::trace!("dummy={count}");
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(CHUNK_MAX);
            self.command(CMD_TRANSFER, QspiMode::Dummy as u8, Some(chunk))?;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Stops the clock for the given number of microseconds.
    pub fn delay_us(&mut self, duration: usize) -> Result<(), TransportError> {
        tracing::trace!("delay us={duration}");
        let mut remaining = duration;
        loop {
            let chunk = remaining.min(CHUNK_MAX);
            self.command(CMD_DELAY, 0, Some(chunk))?;
            remaining -= chunk;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Waits until every batched command has been executed. The controller
    /// produces exactly one response octet once it reaches this command.
    pub fn sync(&mut self) -> Result<(), TransportError> {
        tracing::trace!("sync-o");
        self.command(CMD_SYNC, 0, None)?;
        self.pipe.flush()?;
        self.pipe.recv(1)?;
        tracing::trace!("sync-i");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::MockPipe;
    use pretty_assertions::assert_eq;

    #[test]
    fn select_scope_always_deselects() {
        let (pipe, handle) = MockPipe::new();
        let mut qspi = QspiController::new(Box::new(pipe));
        let result: Result<(), TransportError> = qspi.with_select(0, |qspi| {
            qspi.write(&[0xab], 1)?;
            Err(TransportError::Desynchronized("test"))
        });
        assert!(result.is_err());
        assert_eq!(
            handle.sent(),
            vec![
                0x01, // select chip 0
                0x11, 0x01, 0x00, 0xab, // put x1
                0x00, // deselect
                0x10, 0x01, 0x00, // 1 dummy cycle
            ]
        );
    }

    #[test]
    fn exchange_round_trip() {
        let (pipe, handle) = MockPipe::new();
        handle.respond(&[0x11, 0x22]);
        let mut qspi = QspiController::new(Box::new(pipe));
        let octets = qspi.exchange(&[0xaa, 0xbb]).unwrap();
        assert_eq!(octets, vec![0x11, 0x22]);
        assert_eq!(handle.sent(), vec![0x17, 0x02, 0x00, 0xaa, 0xbb]);
    }
}

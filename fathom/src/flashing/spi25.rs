//! Driver for 25-series SPI flash memories.
//!
//! Flashes vary in their response to unimplemented commands: some return 00,
//! some return FF, some tristate SO entirely. Identification therefore tries
//! several commands and lets the caller judge the result.

use crate::probe::qspi::QspiController;
use crate::probe::TransportError;

use super::sfdp::{SfdpError, SfdpParser};

/// Status register: erase or write in progress.
pub const BIT_WIP: u8 = 0b0000_0001;
/// Status register: write enable latch.
pub const BIT_WEL: u8 = 0b0000_0010;
/// Status register: block protection bits.
pub const MSK_PROT: u8 = 0b0011_1100;

/// Errors produced by the 25-series flash driver.
#[derive(Debug, thiserror::Error)]
pub enum Spi25Error {
    /// A program or erase command never started: the write enable latch was
    /// still set with no write in progress across two status reads.
    #[error("{command} command failed (status {status:08b})")]
    CommandFailed {
        /// The command that did not take effect.
        command: &'static str,
        /// The status register at the time of failure.
        status: u8,
    },

    /// A program or erase command stayed busy past the poll budget.
    #[error("{command} command timed out")]
    CommandTimeout {
        /// The command that timed out.
        command: &'static str,
    },

    /// A verify pass found differing contents.
    #[error(
        "verify failed: first differing byte at {address:#08x} \
         (expected {expected:#04x}, actual {actual:#04x})"
    )]
    VerifyMismatch {
        /// Address of the first difference.
        address: u32,
        /// The byte that was programmed.
        expected: u8,
        /// The byte that was read back.
        actual: u8,
    },

    /// The underlying pipe failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Progress callback: `(done, total, status)`. Called with `status = None`
/// once the operation completes.
pub type ProgressFn<'a> = &'a mut dyn FnMut(usize, usize, Option<&str>);

/// A no-op progress callback.
pub fn no_progress(_done: usize, _total: usize, _status: Option<&str>) {}

const WIP_POLL_BUDGET: usize = 1_000_000;

/// Driver for 25-series SPI flash memories on a QSPI controller.
pub struct Flash25 {
    qspi: QspiController,
}

impl Flash25 {
    /// Creates a driver over a QSPI controller with the flash on chip
    /// select 0.
    pub fn new(qspi: QspiController) -> Self {
        Flash25 { qspi }
    }

    fn command(
        &mut self,
        cmd: u8,
        arg: &[u8],
        dummy_bytes: usize,
        ret: usize,
    ) -> Result<Vec<u8>, Spi25Error> {
        tracing::trace!("cmd={cmd:02X} arg_len={} dummy={dummy_bytes} ret={ret}", arg.len());
        let result = self.qspi.with_select(0, |qspi| {
            let mut header = Vec::with_capacity(1 + arg.len());
            header.push(cmd);
            header.extend_from_slice(arg);
            qspi.write(&header, 1)?;
            qspi.dummy(dummy_bytes * 8)?;
            if ret > 0 {
                qspi.read(ret, 1)
            } else {
                Ok(Vec::new())
            }
        })?;
        Ok(result)
    }

    fn format_addr(address: u32) -> [u8; 3] {
        [(address >> 16) as u8, (address >> 8) as u8, address as u8]
    }

    /// Releases the flash from deep power-down.
    pub fn wakeup(&mut self) -> Result<(), Spi25Error> {
        tracing::debug!("wakeup");
        self.command(0xAB, &[], 4, 0)?;
        Ok(())
    }

    /// Puts the flash into deep power-down.
    pub fn deep_sleep(&mut self) -> Result<(), Spi25Error> {
        tracing::debug!("deep sleep");
        self.command(0xB9, &[], 0, 0)?;
        Ok(())
    }

    /// Reads the 8-bit legacy electronic signature.
    pub fn read_device_id(&mut self) -> Result<u8, Spi25Error> {
        tracing::debug!("read device ID");
        Ok(self.command(0xAB, &[], 3, 1)?[0])
    }

    /// Reads the manufacturer ID and 8-bit device ID.
    pub fn read_manufacturer_device_id(&mut self) -> Result<(u8, u8), Spi25Error> {
        tracing::debug!("read manufacturer/8-bit device ID");
        let result = self.command(0x90, &[], 3, 2)?;
        Ok((result[0], result[1]))
    }

    /// Reads the manufacturer ID and 16-bit device ID.
    pub fn read_manufacturer_long_device_id(&mut self) -> Result<(u8, u16), Spi25Error> {
        tracing::debug!("read manufacturer/16-bit device ID");
        let result = self.command(0x9F, &[], 0, 3)?;
        Ok((result[0], u16::from_be_bytes([result[1], result[2]])))
    }

    fn read_command(
        &mut self,
        mut address: u32,
        length: usize,
        chunk_size: usize,
        cmd: u8,
        dummy: usize,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<u8>, Spi25Error> {
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            progress(
                data.len(),
                length,
                Some(&format!("reading address {address:#08x}")),
            );
            let chunk_length = chunk_size.min(length - data.len());
            let chunk = self.command(cmd, &Self::format_addr(address), dummy, chunk_length)?;
            address += chunk.len() as u32;
            data.extend(chunk);
        }
        progress(data.len(), length, None);
        Ok(data)
    }

    /// Reads memory using the READ (03h) command. Addresses wrap at the
    /// device capacity.
    pub fn read(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Spi25Error> {
        self.read_with_progress(address, length, &mut no_progress)
    }

    /// [`Flash25::read`] with progress reporting.
    pub fn read_with_progress(
        &mut self,
        address: u32,
        length: usize,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<u8>, Spi25Error> {
        tracing::debug!("read addr={address:#08x} len={length}");
        self.read_command(address, length, 0x10000, 0x03, 0, progress)
    }

    /// Reads memory using the FAST READ (0Bh) command, which inserts one
    /// dummy byte after the address.
    pub fn fast_read(
        &mut self,
        address: u32,
        length: usize,
        progress: ProgressFn<'_>,
    ) -> Result<Vec<u8>, Spi25Error> {
        tracing::debug!("fast read addr={address:#08x} len={length}");
        self.read_command(address, length, 0x10000, 0x0B, 1, progress)
    }

    /// Reads the SFDP area using the 5Ah command.
    pub fn read_sfdp(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Spi25Error> {
        tracing::debug!("read sfdp addr={address:#08x} len={length}");
        self.read_command(address, length, 0x100, 0x5A, 1, &mut no_progress)
    }

    /// Parses the SFDP tables of this flash.
    pub fn parse_sfdp(&mut self) -> Result<SfdpParser, SfdpError> {
        SfdpParser::parse(&mut |offset, length| self.read_sfdp(offset, length))
    }

    /// Reads the status register.
    pub fn read_status(&mut self) -> Result<u8, Spi25Error> {
        let status = self.command(0x05, &[], 0, 1)?[0];
        tracing::trace!("read status={status:#010b}");
        Ok(status)
    }

    /// Sets the write enable latch.
    pub fn write_enable(&mut self) -> Result<(), Spi25Error> {
        tracing::trace!("write enable");
        self.command(0x06, &[], 0, 0)?;
        Ok(())
    }

    /// Clears the write enable latch.
    pub fn write_disable(&mut self) -> Result<(), Spi25Error> {
        tracing::trace!("write disable");
        self.command(0x04, &[], 0, 0)?;
        Ok(())
    }

    /// Whether a program or erase operation is still in progress.
    ///
    /// Some flashes have a race between WIP going low and WEL going low, so
    /// a set WEL with a clear WIP is only reported as a failed command after
    /// it is observed twice in a row.
    pub fn write_in_progress(&mut self, command: &'static str) -> Result<bool, Spi25Error> {
        let status = self.read_status()?;
        if status & BIT_WEL != 0 && status & BIT_WIP == 0 {
            let status = self.read_status()?;
            if status & BIT_WEL != 0 && status & BIT_WIP == 0 {
                return Err(Spi25Error::CommandFailed { command, status });
            }
        }
        Ok(status & BIT_WIP != 0)
    }

    fn wait_write_done(&mut self, command: &'static str) -> Result<(), Spi25Error> {
        for _ in 0..WIP_POLL_BUDGET {
            if !self.write_in_progress(command)? {
                return Ok(());
            }
        }
        Err(Spi25Error::CommandTimeout { command })
    }

    /// Writes the status register.
    pub fn write_status(&mut self, status: u8) -> Result<(), Spi25Error> {
        tracing::debug!("write status={status:#010b}");
        self.command(0x01, &[status], 0, 0)?;
        self.wait_write_done("WRITE STATUS")
    }

    /// Erases the sector containing `address` using the 20h command.
    pub fn sector_erase(&mut self, address: u32) -> Result<(), Spi25Error> {
        tracing::debug!("sector erase addr={address:#08x}");
        self.command(0x20, &Self::format_addr(address), 0, 0)?;
        self.wait_write_done("SECTOR ERASE")
    }

    /// Erases the block containing `address` using the 52h command.
    pub fn block_erase(&mut self, address: u32) -> Result<(), Spi25Error> {
        tracing::debug!("block erase addr={address:#08x}");
        self.command(0x52, &Self::format_addr(address), 0, 0)?;
        self.wait_write_done("BLOCK ERASE")
    }

    /// Erases the whole array using the 60h command.
    pub fn chip_erase(&mut self) -> Result<(), Spi25Error> {
        tracing::debug!("chip erase");
        self.command(0x60, &[], 0, 0)?;
        self.wait_write_done("CHIP ERASE")
    }

    /// Programs up to one page using the 02h command. The write wraps within
    /// the page; use [`Flash25::program`] for arbitrary ranges.
    pub fn page_program(&mut self, address: u32, data: &[u8]) -> Result<(), Spi25Error> {
        tracing::debug!("page program addr={address:#08x} len={}", data.len());
        let mut payload = Self::format_addr(address).to_vec();
        payload.extend_from_slice(data);
        self.command(0x02, &payload, 0, 0)?;
        self.wait_write_done("PAGE PROGRAM")
    }

    /// Programs an arbitrary range, splitting it on page boundaries and
    /// issuing WRITE ENABLE before each page.
    pub fn program(
        &mut self,
        mut address: u32,
        mut data: &[u8],
        page_size: u32,
        progress: ProgressFn<'_>,
    ) -> Result<(), Spi25Error> {
        let total = data.len();
        let mut done = 0;
        while !data.is_empty() {
            let chunk_len = (page_size - address % page_size).min(data.len() as u32) as usize;
            let (chunk, rest) = data.split_at(chunk_len);
            data = rest;

            progress(done, total, Some(&format!("programming page {address:#08x}")));
            self.write_enable()?;
            self.page_program(address, chunk)?;

            address += chunk_len as u32;
            done += chunk_len;
        }
        progress(done, total, None);
        Ok(())
    }

    /// Modifies an arbitrary range by read-modify-write per sector: reads
    /// back any partially covered sector, erases it, merges the new bytes in,
    /// and programs the merged image (skipped when it is all-0xFF).
    pub fn erase_program(
        &mut self,
        mut address: u32,
        mut data: &[u8],
        sector_size: u32,
        page_size: u32,
        progress: ProgressFn<'_>,
    ) -> Result<(), Spi25Error> {
        let total = data.len();
        let mut done = 0;
        while !data.is_empty() {
            let chunk_len = (sector_size - address % sector_size).min(data.len() as u32) as usize;
            let (chunk, rest) = data.split_at(chunk_len);
            data = rest;

            let sector_start = address & !(sector_size - 1);
            let sector_data = if address % sector_size == 0 && chunk_len == sector_size as usize {
                chunk.to_vec()
            } else {
                let mut sector_data = self.read(sector_start, sector_size as usize)?;
                let offset = (address % sector_size) as usize;
                sector_data[offset..offset + chunk_len].copy_from_slice(chunk);
                sector_data
            };

            progress(done, total, Some(&format!("erasing sector {sector_start:#08x}")));
            self.write_enable()?;
            self.sector_erase(sector_start)?;

            if sector_data.iter().any(|&byte| byte != 0xff) {
                self.program(sector_start, &sector_data, page_size, &mut |page_done,
                                                                          _page_total,
                                                                          status| {
                    progress(done + page_done, total, status)
                })?;
            }

            address += chunk_len as u32;
            done += chunk_len;
        }
        progress(done, total, None);
        Ok(())
    }

    /// Reads back a programmed range and reports the first difference.
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), Spi25Error> {
        let actual = self.read(address, expected.len())?;
        for (offset, (&expected_byte, &actual_byte)) in
            expected.iter().zip(actual.iter()).enumerate()
        {
            if expected_byte != actual_byte {
                return Err(Spi25Error::VerifyMismatch {
                    address: address + offset as u32,
                    expected: expected_byte,
                    actual: actual_byte,
                });
            }
        }
        tracing::debug!("verify PASS");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fake::QspiFlashPipe;
    use pretty_assertions::assert_eq;

    fn flash() -> Flash25 {
        let sim = QspiFlashPipe::new(0x10000);
        Flash25::new(QspiController::new(Box::new(sim)))
    }

    fn flash_with(setup: impl FnOnce(&mut QspiFlashPipe)) -> Flash25 {
        let mut sim = QspiFlashPipe::new(0x10000);
        setup(&mut sim);
        Flash25::new(QspiController::new(Box::new(sim)))
    }

    #[test]
    fn erased_flash_reads_ff() {
        let mut flash = flash();
        assert_eq!(flash.read(0, 4).unwrap(), vec![0xff; 4]);
    }

    #[test]
    fn page_program_round_trip() {
        let mut flash = flash();
        flash.write_enable().unwrap();
        flash.sector_erase(0).unwrap();
        flash.write_enable().unwrap();
        flash.page_program(0, b"Hello, world!").unwrap();
        assert_eq!(flash.read(0, 13).unwrap(), b"Hello, world!".to_vec());
    }

    #[test]
    fn program_respects_page_boundaries() {
        let mut flash = flash();
        // Program 300 bytes across a page boundary; without the page split
        // the write would wrap inside the first page.
        let data: Vec<u8> = (0..300).map(|value| value as u8).collect();
        flash.program(0xf0, &data, 0x100, &mut no_progress).unwrap();
        assert_eq!(flash.read(0xf0, 300).unwrap(), data);
    }

    #[test]
    fn erase_program_preserves_outside_range() {
        let mut flash = flash_with(|sim| {
            sim.memory_mut()[0x0000..0x2000].fill(0x55);
        });
        let data = vec![0xa5; 0x100];
        flash
            .erase_program(0x800, &data, 0x1000, 0x100, &mut no_progress)
            .unwrap();
        // Inside the programmed range: new data.
        assert_eq!(flash.read(0x800, 0x100).unwrap(), data);
        // Same sector, outside the range: preserved by read-modify-write.
        assert_eq!(flash.read(0x700, 0x100).unwrap(), vec![0x55; 0x100]);
        // Other sectors: untouched.
        assert_eq!(flash.read(0x1000, 4).unwrap(), vec![0x55; 4]);
    }

    #[test]
    fn identification_commands() {
        let mut flash = flash();
        let (manufacturer, device) = flash.read_manufacturer_long_device_id().unwrap();
        assert_eq!(manufacturer, 0xc2);
        assert_eq!(device, 0x2014);
        let (manufacturer, device) = flash.read_manufacturer_device_id().unwrap();
        assert_eq!((manufacturer, device), (0xc2, 0x14));
        assert_eq!(flash.read_device_id().unwrap(), 0x14);
    }

    #[test]
    fn sfdp_parsing_over_the_wire() {
        let mut flash = flash_with(|sim| {
            sim.set_sfdp(crate::flashing::sfdp::tests::sample_sfdp());
        });
        let sfdp = flash.parse_sfdp().unwrap();
        assert_eq!(sfdp.jedec_revision(), "JESD216");
        let params = sfdp.jedec_parameters().unwrap();
        assert_eq!(params.density_bytes(), 4 * 1024 * 1024);
    }

    #[test]
    fn verify_reports_first_difference() {
        let mut flash = flash_with(|sim| {
            sim.memory_mut()[0] = 0x12;
            sim.memory_mut()[1] = 0x34;
        });
        assert!(flash.verify(0, &[0x12, 0x34]).is_ok());
        let error = flash.verify(0, &[0x12, 0x35]).unwrap_err();
        assert!(matches!(
            error,
            Spi25Error::VerifyMismatch {
                address: 1,
                expected: 0x35,
                actual: 0x34
            }
        ));
    }
}

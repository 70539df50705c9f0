//! Serial Flash Discoverable Parameters (JESD216) parser.
//!
//! Only the initial JESD216 revision of the JEDEC flash parameter table is
//! decoded; later revisions are reported but their extra words are ignored.

use bitfield::bitfield;

use super::spi25::Spi25Error;

/// Errors produced while parsing SFDP data.
#[derive(Debug, thiserror::Error)]
pub enum SfdpError {
    /// The `SFDP` signature was not found at offset 0.
    #[error("SFDP signature not present")]
    NoSignature,

    /// The first parameter header must be the JEDEC header.
    #[error("SFDP parameter header 0 has incorrect vendor ID {vendor_id:#04x}")]
    BadFirstHeader {
        /// The offending vendor ID.
        vendor_id: u8,
    },

    /// The JEDEC flash parameter table is shorter than the mandatory 9 words.
    #[error("cannot parse {table}: table too small")]
    TableTooSmall {
        /// Name of the truncated table.
        table: String,
    },

    /// The address byte count field holds the reserved value.
    #[error("cannot parse {table}: invalid address byte count")]
    InvalidAddressByteCount {
        /// Name of the malformed table.
        table: String,
    },

    /// Reading the SFDP area failed.
    #[error(transparent)]
    Read(#[from] Spi25Error),
}

bitfield! {
    struct FlashParam0(u32);
    impl Debug;
    u8;
    block_sector_erase_size, _: 1, 0;
    bool;
    write_granularity_64, _: 2;
    volatile_wren_required, _: 3;
    u8;
    erase_4kbyte_opcode, _: 15, 8;
    bool;
    has_1_1_2_fast_read, _: 16;
    u8;
    address_byte_count, _: 18, 17;
    bool;
    has_double_transfer_rate, _: 19;
    has_1_2_2_fast_read, _: 20;
    has_1_4_4_fast_read, _: 21;
    has_1_1_4_fast_read, _: 22;
}

bitfield! {
    struct FlashParam1(u32);
    impl Debug;
    u32;
    density_value, _: 30, 0;
    bool;
    density_over_2gbit, _: 31;
}

bitfield! {
    struct FastReadPair(u32);
    impl Debug;
    u8;
    lo_wait_states, _: 4, 0;
    lo_mode_bits, _: 7, 5;
    lo_opcode, _: 15, 8;
    hi_wait_states, _: 20, 16;
    hi_mode_bits, _: 23, 21;
    hi_opcode, _: 31, 24;
}

bitfield! {
    struct FlashParam4(u32);
    impl Debug;
    bool;
    has_2_2_2_fast_read, _: 0;
    has_4_4_4_fast_read, _: 4;
}

bitfield! {
    struct SectorTypePair(u32);
    impl Debug;
    u8;
    lo_size, _: 7, 0;
    lo_opcode, _: 15, 8;
    hi_size, _: 23, 16;
    hi_opcode, _: 31, 24;
}

/// One fast-read mode advertised by the flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastReadMode {
    /// Read opcode.
    pub opcode: u8,
    /// Wait states (dummy clocks) after the address.
    pub wait_states: u8,
    /// Mode bits clocked after the address.
    pub mode_bits: u8,
}

/// Decoded JEDEC flash parameter table.
#[derive(Debug, Clone)]
pub struct JedecFlashParameters {
    /// Capacity in bits.
    pub density_bits: u64,
    /// Supported address widths in bytes; `{3}`, `{3, 4}` or `{4}`.
    pub address_byte_counts: Vec<u8>,
    /// Write granularity in bytes (1, or 64 for page-buffered parts).
    pub write_granularity: u32,
    /// Erasable sector sizes in bytes with their erase opcodes, up to four.
    pub sector_sizes: Vec<(u32, u8)>,
    /// Whether double transfer rate clocking is supported.
    pub has_double_transfer_rate: bool,
    /// Fast read modes keyed by `(command, address, data)` line counts.
    pub fast_read_modes: Vec<((u8, u8, u8), FastReadMode)>,
}

impl JedecFlashParameters {
    /// Capacity in bytes.
    pub fn density_bytes(&self) -> u64 {
        self.density_bits / 8
    }

    /// The fast read mode for the given line counts, if advertised.
    pub fn fast_read_mode(&self, lines: (u8, u8, u8)) -> Option<FastReadMode> {
        self.fast_read_modes
            .iter()
            .find(|(mode_lines, _)| *mode_lines == lines)
            .map(|(_, mode)| *mode)
    }
}

/// One parameter table of an SFDP image.
#[derive(Debug, Clone)]
pub struct SfdpTable {
    /// JEDEC vendor ID of the table, 0 for JEDEC itself.
    pub vendor_id: u8,
    /// Table ID; 0xFF is the JEDEC flash parameter table.
    pub table_id: u8,
    /// Table revision as (major, minor).
    pub revision: (u8, u8),
    /// Raw table contents.
    pub parameter: Vec<u8>,
    /// Decoded contents, for the JEDEC flash parameter table.
    pub jedec: Option<JedecFlashParameters>,
}

impl SfdpTable {
    /// Human-readable table name.
    pub fn name(&self) -> String {
        match (self.vendor_id, self.table_id) {
            (0x00, 0xff) => "JEDEC, Flash Parameter Table".to_owned(),
            (vendor_id, table_id) => {
                format!("Vendor {vendor_id:#04x}, Unknown Table {table_id:#04x}")
            }
        }
    }
}

/// Parsed SFDP image.
#[derive(Debug, Clone)]
pub struct SfdpParser {
    /// SFDP revision as (major, minor).
    pub version: (u8, u8),
    /// All discovered parameter tables.
    pub tables: Vec<SfdpTable>,
}

impl SfdpParser {
    /// The name of the JESD216 revision this image declares.
    pub fn jedec_revision(&self) -> &'static str {
        match self.version {
            (1, 0) => "JESD216",
            (1, 5) => "JESD216A",
            (1, 6) => "JESD216B",
            _ => "unknown JESD216 revision",
        }
    }

    /// The decoded JEDEC flash parameter table, if present.
    pub fn jedec_parameters(&self) -> Option<&JedecFlashParameters> {
        self.tables.iter().find_map(|table| table.jedec.as_ref())
    }

    /// Parses an SFDP image through the given reader, which receives an
    /// offset and a length (the 5Ah read command access pattern).
    pub fn parse(
        read: &mut dyn FnMut(u32, usize) -> Result<Vec<u8>, Spi25Error>,
    ) -> Result<Self, SfdpError> {
        let header = read(0, 8)?;
        if &header[0..4] != b"SFDP" {
            return Err(SfdpError::NoSignature);
        }
        let version = (header[5], header[4]);
        let num_param_headers = header[6] as usize;

        let mut tables = Vec::new();
        for index in 0..num_param_headers + 1 {
            let param_header = read(8 * (1 + index) as u32, 8)?;
            let vendor_id = param_header[0];
            let revision = (param_header[2], param_header[1]);
            let length_dwords = param_header[3] as usize;
            let pointer =
                u32::from_le_bytes([param_header[4], param_header[5], param_header[6], 0]);
            let table_id = param_header[7];

            if index == 0 && vendor_id != 0x00 {
                return Err(SfdpError::BadFirstHeader { vendor_id });
            }

            let parameter = read(pointer, length_dwords * 4)?;
            let mut table = SfdpTable {
                vendor_id,
                table_id,
                revision,
                parameter,
                jedec: None,
            };
            if vendor_id == 0x00 && table_id == 0xff {
                table.jedec = Some(Self::parse_jedec_table(&table)?);
            }
            tables.push(table);
        }

        Ok(SfdpParser { version, tables })
    }

    fn parse_jedec_table(table: &SfdpTable) -> Result<JedecFlashParameters, SfdpError> {
        let parameter = &table.parameter;
        if parameter.len() < 9 * 4 {
            return Err(SfdpError::TableTooSmall {
                table: table.name(),
            });
        }
        let word = |index: usize| {
            u32::from_le_bytes(parameter[index * 4..index * 4 + 4].try_into().unwrap())
        };
        let word0 = FlashParam0(word(0));
        let word1 = FlashParam1(word(1));
        let word2 = FastReadPair(word(2)); // 1-4-4 low, 1-1-4 high
        let word3 = FastReadPair(word(3)); // 1-1-2 low, 1-2-2 high
        let word4 = FlashParam4(word(4));
        let word5 = FastReadPair(word(5)); // 2-2-2 high
        let word6 = FastReadPair(word(6)); // 4-4-4 high
        let word7 = SectorTypePair(word(7));
        let word8 = SectorTypePair(word(8));

        let density_bits = if word1.density_over_2gbit() {
            1u64 << word1.density_value()
        } else {
            word1.density_value() as u64 + 1
        };

        let address_byte_counts = match word0.address_byte_count() {
            0b00 => vec![3],
            0b01 => vec![3, 4],
            0b10 => vec![4],
            _ => {
                return Err(SfdpError::InvalidAddressByteCount {
                    table: table.name(),
                })
            }
        };

        let write_granularity = if word0.write_granularity_64() { 64 } else { 1 };

        let mut sector_sizes = Vec::new();
        for (size, opcode) in [
            (word7.lo_size(), word7.lo_opcode()),
            (word7.hi_size(), word7.hi_opcode()),
            (word8.lo_size(), word8.lo_opcode()),
            (word8.hi_size(), word8.hi_opcode()),
        ] {
            if size > 0 {
                sector_sizes.push((1u32 << size, opcode));
            }
        }

        let mut fast_read_modes = Vec::new();
        if word0.has_1_1_2_fast_read() {
            fast_read_modes.push((
                (1, 1, 2),
                FastReadMode {
                    opcode: word3.lo_opcode(),
                    wait_states: word3.lo_wait_states(),
                    mode_bits: word3.lo_mode_bits(),
                },
            ));
        }
        if word0.has_1_1_4_fast_read() {
            fast_read_modes.push((
                (1, 1, 4),
                FastReadMode {
                    opcode: word2.hi_opcode(),
                    wait_states: word2.hi_wait_states(),
                    mode_bits: word2.hi_mode_bits(),
                },
            ));
        }
        if word0.has_1_2_2_fast_read() {
            fast_read_modes.push((
                (1, 2, 2),
                FastReadMode {
                    opcode: word3.hi_opcode(),
                    wait_states: word3.hi_wait_states(),
                    mode_bits: word3.hi_mode_bits(),
                },
            ));
        }
        if word0.has_1_4_4_fast_read() {
            fast_read_modes.push((
                (1, 4, 4),
                FastReadMode {
                    opcode: word2.lo_opcode(),
                    wait_states: word2.lo_wait_states(),
                    mode_bits: word2.lo_mode_bits(),
                },
            ));
        }
        if word4.has_2_2_2_fast_read() {
            fast_read_modes.push((
                (2, 2, 2),
                FastReadMode {
                    opcode: word5.hi_opcode(),
                    wait_states: word5.hi_wait_states(),
                    mode_bits: word5.hi_mode_bits(),
                },
            ));
        }
        if word4.has_4_4_4_fast_read() {
            fast_read_modes.push((
                (4, 4, 4),
                FastReadMode {
                    opcode: word6.hi_opcode(),
                    wait_states: word6.hi_wait_states(),
                    mode_bits: word6.hi_mode_bits(),
                },
            ));
        }

        Ok(JedecFlashParameters {
            density_bits,
            address_byte_counts,
            write_granularity,
            sector_sizes,
            has_double_transfer_rate: word0.has_double_transfer_rate(),
            fast_read_modes,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Builds a minimal JESD216 image for a 4 MiB flash with 4 KiB sectors
    /// (opcode 20h), 32 KiB blocks (opcode 52h) and a 1-1-2 fast read.
    pub(crate) fn sample_sfdp() -> Vec<u8> {
        let mut image = Vec::new();
        // SFDP header: signature, 1.0, one extra parameter header (NPH=0
        // means one header total; use 0).
        image.extend(b"SFDP");
        image.extend([0x00, 0x01, 0x00, 0xff]);
        // JEDEC parameter header: vendor 0, rev 1.0, 9 dwords, pointer 0x10,
        // table id 0xff.
        image.extend([0x00, 0x00, 0x01, 0x09, 0x10, 0x00, 0x00, 0xff]);
        // Table at 0x10.
        let word0: u32 = (1 << 16)           // 1-1-2 fast read
            | (0b01 << 17)                   // 3- or 4-byte addressing
            | (0x20 << 8)                    // 4 KiB erase opcode
            | 0b01;                          // 4 KiB erase supported
        let word1: u32 = 4 * 1024 * 1024 * 8 - 1; // density, bits minus one
        let word2: u32 = 0;
        let word3: u32 = 0x3b << 8 | 8; // 1-1-2: opcode 3Bh, 8 wait states
        let word4: u32 = 0;
        let word5: u32 = 0;
        let word6: u32 = 0;
        let word7: u32 = (0x52 << 24) | (15 << 16) | (0x20 << 8) | 12;
        let word8: u32 = 0;
        for word in [word0, word1, word2, word3, word4, word5, word6, word7, word8] {
            image.extend(word.to_le_bytes());
        }
        image
    }

    #[test]
    fn parses_sample_image() {
        let image = sample_sfdp();
        let parser = SfdpParser::parse(&mut |offset, length| {
            Ok(image[offset as usize..offset as usize + length].to_vec())
        })
        .unwrap();

        assert_eq!(parser.version, (1, 0));
        assert_eq!(parser.jedec_revision(), "JESD216");
        assert_eq!(parser.tables.len(), 1);

        let params = parser.jedec_parameters().unwrap();
        assert_eq!(params.density_bytes(), 4 * 1024 * 1024);
        assert_eq!(params.address_byte_counts, vec![3, 4]);
        assert_eq!(params.write_granularity, 1);
        assert_eq!(params.sector_sizes, vec![(1 << 12, 0x20), (1 << 15, 0x52)]);
        assert_eq!(
            params.fast_read_mode((1, 1, 2)),
            Some(FastReadMode {
                opcode: 0x3b,
                wait_states: 8,
                mode_bits: 0
            })
        );
        assert_eq!(params.fast_read_mode((4, 4, 4)), None);
    }

    #[test]
    fn rejects_bad_signature() {
        let result = SfdpParser::parse(&mut |_, length| Ok(vec![0; length]));
        assert!(matches!(result, Err(SfdpError::NoSignature)));
    }
}

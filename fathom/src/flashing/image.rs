//! Sparse memory image with a presence mask.

/// A byte image accompanied by a "present" bitmap, one mask byte per data
/// byte (0xFF when the byte has been written).
///
/// Images either grow on demand, or wrap at a fixed modulus; the latter suits
/// small sub-images addressed modulo their size, like UID and SFDP areas.
#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    data: Vec<u8>,
    mask: Vec<u8>,
    wrap: Option<usize>,
}

impl MemoryImage {
    /// Creates an image of `size` bytes, all absent.
    pub fn new(size: usize) -> Self {
        MemoryImage {
            data: vec![0; size],
            mask: vec![0; size],
            wrap: None,
        }
    }

    /// Creates an image of `wrap` bytes whose writes wrap around modulo the
    /// size.
    pub fn with_wrap(wrap: usize) -> Self {
        MemoryImage {
            data: vec![0; wrap],
            mask: vec![0; wrap],
            wrap: Some(wrap),
        }
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether no byte has been written yet.
    pub fn is_empty(&self) -> bool {
        !self.mask.iter().any(|&mask| mask != 0)
    }

    /// The image contents; absent bytes read as zero.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The presence bitmap, 0xFF per present byte.
    pub fn mask(&self) -> &[u8] {
        &self.mask
    }

    /// Reads `size` bytes at `addr`. Returns `None` when the range is out of
    /// bounds.
    pub fn read(&self, addr: usize, size: usize) -> Option<&[u8]> {
        if addr.checked_add(size)? > self.data.len() {
            return None;
        }
        Some(&self.data[addr..addr + size])
    }

    /// Reads `size` bytes at `addr`, but only if every byte of the range has
    /// been written.
    pub fn read_present(&self, addr: usize, size: usize) -> Option<&[u8]> {
        if self.mask.get(addr..addr + size)?.iter().any(|&m| m != 0xff) {
            return None;
        }
        self.read(addr, size)
    }

    /// Writes `chunk` at `addr`, growing the image (or wrapping) as needed.
    pub fn write(&mut self, addr: usize, chunk: &[u8]) {
        match self.wrap {
            None => {
                let end = addr + chunk.len();
                if end > self.data.len() {
                    self.data.resize(end, 0);
                    self.mask.resize(end, 0);
                }
                self.data[addr..end].copy_from_slice(chunk);
                self.mask[addr..end].fill(0xff);
            }
            Some(wrap) => {
                for (offset, &byte) in chunk.iter().enumerate() {
                    let byte_addr = (addr + offset) % wrap;
                    self.data[byte_addr] = byte;
                    self.mask[byte_addr] = 0xff;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn grows_on_write() {
        let mut image = MemoryImage::new(4);
        assert!(image.is_empty());
        image.write(2, &[0xaa, 0xbb, 0xcc]);
        assert_eq!(image.len(), 5);
        assert_eq!(image.data(), &[0, 0, 0xaa, 0xbb, 0xcc]);
        assert_eq!(image.mask(), &[0, 0, 0xff, 0xff, 0xff]);
        assert!(!image.is_empty());
    }

    #[test]
    fn present_reads_require_full_coverage() {
        let mut image = MemoryImage::new(8);
        image.write(0, &[1, 2, 3]);
        assert_eq!(image.read_present(0, 3), Some(&[1u8, 2, 3][..]));
        assert_eq!(image.read_present(0, 4), None);
        assert_eq!(image.read(0, 4), Some(&[1u8, 2, 3, 0][..]));
        assert_eq!(image.read(6, 4), None);
    }

    #[test]
    fn wrapping_image_stays_fixed_size() {
        let mut image = MemoryImage::with_wrap(4);
        image.write(2, &[0x11, 0x22, 0x33]);
        assert_eq!(image.len(), 4);
        assert_eq!(image.data(), &[0x33, 0, 0x11, 0x22]);
    }
}

use crate::error::{MuxError, Result};

/// A big-endian bit writer over a fixed byte slice.
///
/// Transport stream headers pack several fields into odd bit widths (33-bit
/// clock bases, 9-bit extensions, reserved runs of ones). `BitWriter` keeps
/// that packing readable:
///
/// ```
/// use tsmux::utils::BitWriter;
///
/// let mut buf = [0u8; 2];
/// let mut writer = BitWriter::new(&mut buf);
/// writer.write_bits(3, 0b101).unwrap();
/// writer.write_bits(13, 0x1fff).unwrap();
/// assert_eq!(buf, [0xbf, 0xff]);
/// ```
pub struct BitWriter<'a> {
    data: &'a mut [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitWriter<'a> {
    /// Creates a writer positioned at the first bit of `data`.
    pub fn new(data: &'a mut [u8]) -> Self {
        BitWriter {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    /// Writes a single bit.
    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        if self.byte_offset >= self.data.len() {
            return Err(MuxError::BufferTooSmall {
                needed: self.byte_offset + 1,
                available: self.data.len(),
            });
        }

        let mask = 0x80u8 >> self.bit_offset;
        if bit {
            self.data[self.byte_offset] |= mask;
        } else {
            self.data[self.byte_offset] &= !mask;
        }

        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
        Ok(())
    }

    /// Writes the low `n` bits of `value`, most significant first.
    pub fn write_bits(&mut self, n: u32, value: u64) -> Result<()> {
        if n > 64 {
            return Err(MuxError::InvalidSection(format!(
                "cannot write {} bits at once",
                n
            )));
        }
        if self.available_bits() < n as usize {
            return Err(MuxError::BufferTooSmall {
                needed: self.byte_offset + (self.bit_offset as usize + n as usize + 7) / 8,
                available: self.data.len(),
            });
        }
        for i in (0..n).rev() {
            self.write_bit((value >> i) & 1 == 1)?;
        }
        Ok(())
    }

    /// Number of bits that can still be written.
    pub fn available_bits(&self) -> usize {
        (self.data.len() - self.byte_offset) * 8 - self.bit_offset as usize
    }

    /// Number of whole bytes touched so far.
    pub fn bytes_written(&self) -> usize {
        self.byte_offset + usize::from(self.bit_offset != 0)
    }
}

/// A big-endian bit reader, the mirror of [`BitWriter`].
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

impl<'a> BitReader<'a> {
    /// Creates a reader positioned at the first bit of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        BitReader {
            data,
            byte_offset: 0,
            bit_offset: 0,
        }
    }

    /// Reads a single bit.
    pub fn read_bit(&mut self) -> Result<bool> {
        if self.byte_offset >= self.data.len() {
            return Err(MuxError::NotEnoughData {
                requested: 1,
                available: 0,
            });
        }

        let bit = (self.data[self.byte_offset] >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
        Ok(bit == 1)
    }

    /// Reads `n` bits (up to 64) as a big-endian number.
    pub fn read_bits(&mut self, n: u32) -> Result<u64> {
        if n > 64 {
            return Err(MuxError::InvalidSection(format!(
                "cannot read {} bits at once",
                n
            )));
        }
        let mut value = 0u64;
        for _ in 0..n {
            value = (value << 1) | u64::from(self.read_bit()?);
        }
        Ok(value)
    }

    /// Skips `n` bits.
    pub fn skip_bits(&mut self, n: u32) -> Result<()> {
        for _ in 0..n {
            self.read_bit()?;
        }
        Ok(())
    }

    /// Number of bits left to read.
    pub fn available_bits(&self) -> usize {
        (self.data.len() - self.byte_offset) * 8 - self.bit_offset as usize
    }
}

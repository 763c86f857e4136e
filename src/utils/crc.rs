/// CRC-32/MPEG-2 as used by every long-form PSI section (ISO/IEC 13818-1 Annex A).
///
/// Polynomial 0x04C11DB7, initial value 0xFFFFFFFF, no reflection, no final xor.
/// A section that carries its own trailing CRC checks to zero.
const POLYNOMIAL: u32 = 0x04C1_1DB7;

const TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ POLYNOMIAL
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC-32/MPEG-2 calculator.
///
/// ```
/// use tsmux::utils::Crc32Mpeg2;
///
/// let mut crc = Crc32Mpeg2::new();
/// crc.update(&[0x01]);
/// crc.update(&[0x01]);
/// assert_eq!(crc.finish(), Crc32Mpeg2::checksum(&[0x01, 0x01]));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Crc32Mpeg2 {
    state: u32,
}

impl Crc32Mpeg2 {
    /// Starts a new checksum.
    pub fn new() -> Self {
        Self { state: 0xFFFF_FFFF }
    }

    /// Feeds more bytes into the checksum.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            let index = ((self.state >> 24) ^ byte as u32) & 0xFF;
            self.state = (self.state << 8) ^ TABLE[index as usize];
        }
    }

    /// Returns the checksum of everything fed so far.
    pub fn finish(&self) -> u32 {
        self.state
    }

    /// One-shot checksum of `data`.
    pub fn checksum(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finish()
    }
}

impl Default for Crc32Mpeg2 {
    fn default() -> Self {
        Self::new()
    }
}

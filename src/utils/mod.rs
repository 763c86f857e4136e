//! # Utility Functions and Types
//!
//! Helpers shared by the transport stream writer:
//!
//! - Bit-level packing and unpacking of header fields
//! - CRC-32/MPEG-2 for PSI sections
//!
//! ```rust
//! use tsmux::utils::{BitReader, Crc32Mpeg2};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = [0b1011_0011u8];
//! let mut reader = BitReader::new(&data);
//! assert_eq!(reader.read_bits(3)?, 0b101);
//!
//! let crc = Crc32Mpeg2::checksum(b"123456789");
//! assert_eq!(crc, 0x0376_e6e7);
//! # Ok(())
//! # }
//! ```

/// Bit-level writer and reader
pub mod bits;

/// CRC calculation for PSI sections
pub mod crc;

pub use bits::{BitReader, BitWriter};
pub use crc::Crc32Mpeg2;

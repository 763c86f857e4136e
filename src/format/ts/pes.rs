use bytes::BufMut;

use super::types::*;
use crate::error::{MuxError, Result};

/// Length of the fixed `00 00 01 <id> <len:16>` prefix every PES packet starts with.
pub const PES_BASE_HEADER_SIZE: usize = 6;
/// Flags, flags and `PES_header_data_length` following the base header.
pub const PES_FULL_HEADER_EXTRA: usize = 3;

/// Packetized Elementary Stream (PES) header
///
/// Describes the header placed in front of each PES payload. Two layouts are
/// supported:
///
/// - the short form, just the 6-byte prefix, and
/// - the full form with PTS/DTS and an optional extended stream id
///   (ISO/IEC 13818-1 Amendment 2), optionally padded with stuffing bytes to a
///   fixed header data length.
///
/// ```
/// use tsmux::format::ts::pes::PesHeader;
///
/// let header = PesHeader::new(0xe0).with_full_header(true).with_pts(3600);
/// assert_eq!(header.len(), 14);
///
/// let mut buf = Vec::new();
/// header.write_to(&mut buf).unwrap();
/// assert_eq!(&buf[..4], &[0x00, 0x00, 0x01, 0xe0]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PesHeader {
    /// Stream identifier (0xe0 video, 0xc0 audio, 0xbd private stream 1, ...)
    pub stream_id: u8,
    /// Extended stream id, only used together with stream id 0xfd
    pub stream_id_extension: Option<u8>,
    /// Whether the optional header part is present
    pub full_header: bool,
    /// Data alignment indicator
    pub data_alignment: bool,
    /// Presentation Time Stamp (33 bits)
    pub pts: Option<u64>,
    /// Decoding Time Stamp (33 bits), only written when it differs from the PTS
    pub dts: Option<u64>,
    /// Fixed `PES_header_data_length`, padded with stuffing bytes
    pub header_data_length: Option<u8>,
    /// Payload bytes following the header, 0 for an unbounded packet
    pub payload_len: usize,
}

impl PesHeader {
    /// Creates a short-form header for `stream_id`.
    pub fn new(stream_id: u8) -> Self {
        Self {
            stream_id,
            ..Default::default()
        }
    }

    /// Enables or disables the optional header part.
    pub fn with_full_header(mut self, full_header: bool) -> Self {
        self.full_header = full_header;
        self
    }

    /// Sets the data alignment indicator.
    pub fn with_data_alignment(mut self, aligned: bool) -> Self {
        self.data_alignment = aligned;
        self
    }

    /// Sets the Presentation Time Stamp in 90 kHz ticks.
    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    /// Sets the Decoding Time Stamp in 90 kHz ticks.
    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Carries `extension` in a PES extension field.
    pub fn with_stream_id_extension(mut self, extension: u8) -> Self {
        self.stream_id_extension = Some(extension);
        self
    }

    /// Pads the optional header part to `length` bytes.
    pub fn with_header_data_length(mut self, length: u8) -> Self {
        self.header_data_length = Some(length);
        self
    }

    /// Sets the payload size used for `PES_packet_length`; 0 means unbounded.
    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    fn writes_pts(&self) -> bool {
        self.full_header && self.pts.is_some()
    }

    fn writes_dts(&self) -> bool {
        self.writes_pts() && self.dts.is_some() && self.dts != self.pts
    }

    fn unpadded_len(&self) -> usize {
        if !self.full_header {
            return PES_BASE_HEADER_SIZE;
        }
        let mut len = PES_BASE_HEADER_SIZE + PES_FULL_HEADER_EXTRA;
        if self.writes_dts() {
            len += 10;
        } else if self.writes_pts() {
            len += 5;
        }
        if self.stream_id_extension.is_some() {
            len += 3;
        }
        len
    }

    /// Total header length in bytes.
    pub fn len(&self) -> usize {
        let len = self.unpadded_len();
        match self.header_data_length {
            Some(fixed) if self.full_header => {
                len.max(PES_BASE_HEADER_SIZE + PES_FULL_HEADER_EXTRA + fixed as usize)
            }
            _ => len,
        }
    }

    /// Always false: a PES header is never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// The value of the `PES_packet_length` field.
    pub fn packet_length_field(&self) -> Result<u16> {
        if self.payload_len == 0 {
            return Ok(0);
        }
        let length = self.len() + self.payload_len - PES_BASE_HEADER_SIZE;
        u16::try_from(length).map_err(|_| MuxError::PesTooLarge(length))
    }

    /// Writes the header to `buf`.
    ///
    /// # Returns
    /// `Ok(())` if writing is successful, `Err` when the payload length does
    /// not fit the 16-bit length field.
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let total = self.len();
        if buf.remaining_mut() < total {
            return Err(MuxError::BufferTooSmall {
                needed: total,
                available: buf.remaining_mut(),
            });
        }

        buf.put_slice(&[0x00, 0x00, 0x01]);
        buf.put_u8(self.stream_id);
        buf.put_u16(self.packet_length_field()?);

        if !self.full_header {
            return Ok(());
        }

        // '10' marker bits, original_or_copy set
        let mut flags1 = 0x81u8;
        if self.data_alignment {
            flags1 |= 0x04;
        }
        buf.put_u8(flags1);

        let mut flags2 = 0u8;
        if self.writes_dts() {
            flags2 |= 0xc0;
        } else if self.writes_pts() {
            flags2 |= 0x80;
        }
        if self.stream_id_extension.is_some() {
            flags2 |= 0x01;
        }
        buf.put_u8(flags2);

        buf.put_u8((total - PES_BASE_HEADER_SIZE - PES_FULL_HEADER_EXTRA) as u8);

        if self.writes_dts() {
            write_timestamp(buf, 0x3, self.pts.unwrap_or_default());
            write_timestamp(buf, 0x1, self.dts.unwrap_or_default());
        } else if let Some(pts) = self.pts {
            write_timestamp(buf, 0x2, pts);
        }

        if let Some(extension) = self.stream_id_extension {
            // only PES_extension_flag_2 set
            buf.put_u8(0x0f);
            buf.put_u8(0x80 | 1);
            buf.put_u8(0x80 | extension);
        }

        for _ in self.unpadded_len()..total {
            buf.put_u8(0xff);
        }

        Ok(())
    }
}

/// Writes a 33-bit timestamp as the 5-byte PTS/DTS field with a 4-bit prefix.
pub fn write_timestamp<B: BufMut>(buf: &mut B, prefix: u8, ts: u64) {
    buf.put_u8((prefix << 4) | ((ts >> 29) & 0x0e) as u8 | 0x01);
    buf.put_u16((((ts >> 14) & 0xfffe) | 0x01) as u16);
    buf.put_u16((((ts << 1) & 0xfffe) | 0x01) as u16);
}

/// Reads back a timestamp written by [`write_timestamp`].
pub fn read_timestamp(data: &[u8]) -> Result<u64> {
    if data.len() < 5 {
        return Err(MuxError::NotEnoughData {
            requested: 5,
            available: data.len(),
        });
    }
    Ok((((data[0] >> 1) & 0x07) as u64) << 30
        | (data[1] as u64) << 22
        | ((data[2] >> 1) as u64) << 15
        | (data[3] as u64) << 7
        | (data[4] >> 1) as u64)
}

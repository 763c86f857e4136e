//! Builders for the PSI sections the muxer generates itself.
//!
//! Every builder returns a complete section, CRC included, ready to be handed
//! to [`Section`](super::section::Section) for packetization.

use bytes::{BufMut, Bytes, BytesMut};

use super::types::*;
use crate::error::{MuxError, Result};
use crate::utils::Crc32Mpeg2;

/// Largest `section_length` a PAT or PMT may announce.
pub const MAX_SECTION_LENGTH: usize = 1021;

/// Largest payload an 8-bit `descriptor_length` can describe.
pub const MAX_DESCRIPTOR_DATA: usize = 255;

pub const DESCRIPTOR_TAG_REGISTRATION: u8 = 0x05;
pub const DESCRIPTOR_TAG_ISO_639_LANGUAGE: u8 = 0x0a;
pub const DESCRIPTOR_TAG_J2K_VIDEO: u8 = 0x32;
pub const DESCRIPTOR_TAG_TELETEXT: u8 = 0x56;
pub const DESCRIPTOR_TAG_SUBTITLING: u8 = 0x59;
pub const DESCRIPTOR_TAG_DVB_AC3: u8 = 0x6a;
pub const DESCRIPTOR_TAG_DVB_EAC3: u8 = 0x7a;
pub const DESCRIPTOR_TAG_DVB_EXTENSION: u8 = 0x7f;
pub const DESCRIPTOR_TAG_ATSC_AC3: u8 = 0x81;
pub const DESCRIPTOR_TAG_ATSC_EAC3: u8 = 0xcc;

/// A tag/length/value descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub tag: u8,
    pub data: Vec<u8>,
}

impl Descriptor {
    pub fn new(tag: u8, data: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            data: data.into(),
        }
    }

    /// Registration descriptor carrying a four-character format identifier.
    pub fn registration(format_identifier: &[u8; 4]) -> Self {
        Self::new(DESCRIPTOR_TAG_REGISTRATION, format_identifier.to_vec())
    }

    /// ISO 639 language descriptor with audio_type 0 (undefined).
    pub fn iso_639_language(language: &[u8; 3]) -> Self {
        let mut data = language.to_vec();
        data.push(0);
        Self::new(DESCRIPTOR_TAG_ISO_639_LANGUAGE, data)
    }

    /// Encoded size, tag and length bytes included.
    pub fn len(&self) -> usize {
        2 + self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag);
        buf.put_u8(self.data.len() as u8);
        buf.put_slice(&self.data);
    }
}

fn descriptors_len(descriptors: &[Descriptor]) -> usize {
    descriptors.iter().map(Descriptor::len).sum()
}

fn check_descriptors(descriptors: &[Descriptor]) -> Result<()> {
    match descriptors.iter().find(|d| d.data.len() > MAX_DESCRIPTOR_DATA) {
        Some(desc) => Err(MuxError::InvalidSection(format!(
            "descriptor 0x{:02x} carries {} bytes, at most {} fit",
            desc.tag,
            desc.data.len(),
            MAX_DESCRIPTOR_DATA
        ))),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

/// One elementary stream row of a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStreamEntry {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Vec<Descriptor>,
}

/// Writes the long-form section header up to and including `last_section_number`.
fn put_long_header(buf: &mut BytesMut, table_id: u8, section_length: usize, id: u16, version: u8) {
    buf.put_u8(table_id);
    // section_syntax_indicator, '0', reserved
    buf.put_u16(0xb000 | (section_length as u16 & 0x0fff));
    buf.put_u16(id);
    // reserved, version, current_next_indicator
    buf.put_u8(0xc0 | ((version & 0x1f) << 1) | 0x01);
    buf.put_u8(0);
    buf.put_u8(0);
}

fn finish_section(mut buf: BytesMut) -> Bytes {
    let crc = Crc32Mpeg2::checksum(&buf);
    buf.put_u32(crc);
    buf.freeze()
}

/// Builds a single-section PAT.
pub fn build_pat(transport_stream_id: u16, version: u8, entries: &[PatEntry]) -> Result<Bytes> {
    // header after length (5) + entries + CRC
    let section_length = 5 + entries.len() * 4 + 4;
    if section_length > MAX_SECTION_LENGTH {
        return Err(MuxError::SectionTooLarge(section_length + 3));
    }

    let mut buf = BytesMut::with_capacity(section_length + 3);
    put_long_header(&mut buf, TABLE_ID_PAT, section_length, transport_stream_id, version);
    for entry in entries {
        buf.put_u16(entry.program_number);
        buf.put_u16(entry.pmt_pid & 0x1fff | 7 << 13);
    }
    Ok(finish_section(buf))
}

/// Builds a single-section PMT.
pub fn build_pmt(
    program_number: u16,
    version: u8,
    pcr_pid: u16,
    program_descriptors: &[Descriptor],
    streams: &[PmtStreamEntry],
) -> Result<Bytes> {
    check_descriptors(program_descriptors)?;
    for stream in streams {
        check_descriptors(&stream.descriptors)?;
    }

    let program_info_length = descriptors_len(program_descriptors);
    let streams_length: usize = streams
        .iter()
        .map(|s| 5 + descriptors_len(&s.descriptors))
        .sum();
    // header after length (5) + PCR PID + program info length + loops + CRC
    let section_length = 5 + 4 + program_info_length + streams_length + 4;
    if section_length > MAX_SECTION_LENGTH {
        return Err(MuxError::SectionTooLarge(section_length + 3));
    }

    let mut buf = BytesMut::with_capacity(section_length + 3);
    put_long_header(&mut buf, TABLE_ID_PMT, section_length, program_number, version);

    buf.put_u16(pcr_pid & 0x1fff | 7 << 13);
    buf.put_u16((program_info_length as u16) & 0x3ff | 0xf << 12);
    for desc in program_descriptors {
        desc.write_to(&mut buf);
    }

    for stream in streams {
        buf.put_u8(stream.stream_type);
        buf.put_u16(stream.pid & 0x1fff | 7 << 13);
        let es_info_length = descriptors_len(&stream.descriptors);
        buf.put_u16((es_info_length as u16) & 0x3ff | 0xf << 12);
        for desc in &stream.descriptors {
            desc.write_to(&mut buf);
        }
    }

    Ok(finish_section(buf))
}

/// Builds an SCTE-35 `splice_info_section` carrying a `splice_null()` command.
pub fn build_scte35_null() -> Bytes {
    let mut buf = BytesMut::with_capacity(20);
    buf.put_u8(TABLE_ID_SCTE35);
    // section_syntax_indicator 0, private 0, sap_type 3, length 17
    buf.put_u16(0x3000 | 17);
    buf.put_u8(0); // protocol_version
    buf.put_u8(0); // encrypted_packet, encryption_algorithm, pts_adjustment[32]
    buf.put_u32(0); // pts_adjustment[31..0]
    buf.put_u8(0); // cw_index
    buf.put_u16(0xfff0); // tier 0xfff, splice_command_length[11..8]
    buf.put_u8(0x00); // splice_command_length[7..0]
    buf.put_u8(0x00); // splice_command_type: splice_null
    buf.put_u16(0); // descriptor_loop_length
    finish_section(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pat_matches_reference() {
        let pat = build_pat(
            1,
            0,
            &[PatEntry {
                program_number: 1,
                pmt_pid: 0x1000,
            }],
        )
        .unwrap();
        assert_eq!(
            pat.as_ref(),
            &[
                0x00, 0xb0, 0x0d, 0x00, 0x01, 0xc1, 0x00, 0x00, 0x00, 0x01, 0xf0, 0x00, 0x2a,
                0xb1, 0x04, 0xb2
            ]
        );
    }

    #[test]
    fn test_pat_version() {
        let pat = build_pat(1, 3, &[]).unwrap();
        assert_eq!((pat[5] >> 1) & 0x1f, 3);
        assert_eq!(Crc32Mpeg2::checksum(&pat), 0);
    }

    #[test]
    fn test_pmt_layout() {
        let pmt = build_pmt(
            1,
            2,
            0x100,
            &[Descriptor::registration(b"CUEI")],
            &[
                PmtStreamEntry {
                    stream_type: 0x1b,
                    pid: 0x100,
                    descriptors: vec![],
                },
                PmtStreamEntry {
                    stream_type: 0x0f,
                    pid: 0x101,
                    descriptors: vec![Descriptor::iso_639_language(b"eng")],
                },
            ],
        )
        .unwrap();

        let section_length = (((pmt[1] & 0x0f) as usize) << 8) | pmt[2] as usize;
        assert_eq!(section_length + 3, pmt.len());
        assert_eq!(u16::from_be_bytes([pmt[3], pmt[4]]), 1);
        assert_eq!((pmt[5] >> 1) & 0x1f, 2);
        assert_eq!(u16::from_be_bytes([pmt[8], pmt[9]]) & 0x1fff, 0x100);
        assert_eq!(u16::from_be_bytes([pmt[10], pmt[11]]) & 0x0fff, 6);
        assert_eq!(&pmt[12..18], &[0x05, 0x04, b'C', b'U', b'E', b'I']);
        assert_eq!(pmt[18], 0x1b);
        assert_eq!(pmt[23], 0x0f);
        assert_eq!(&pmt[28..34], &[0x0a, 0x04, b'e', b'n', b'g', 0x00]);
        assert_eq!(Crc32Mpeg2::checksum(&pmt), 0);
    }

    #[test]
    fn test_pmt_too_large() {
        let streams: Vec<PmtStreamEntry> = (0..10)
            .map(|i| PmtStreamEntry {
                stream_type: 0x06,
                pid: 0x100 + i,
                descriptors: vec![Descriptor::new(0x80, vec![0u8; 120])],
            })
            .collect();
        assert!(matches!(
            build_pmt(1, 0, 0x100, &[], &streams),
            Err(MuxError::SectionTooLarge(_))
        ));
    }

    #[test]
    fn test_pmt_rejects_oversized_descriptor() {
        let streams = [PmtStreamEntry {
            stream_type: 0x06,
            pid: 0x100,
            descriptors: vec![Descriptor::new(0x80, vec![0u8; 300])],
        }];
        assert!(matches!(
            build_pmt(1, 0, 0x100, &[], &streams),
            Err(MuxError::InvalidSection(_))
        ));

        let program_descriptors = [Descriptor::new(0x80, vec![0u8; 256])];
        assert!(matches!(
            build_pmt(1, 0, 0x100, &program_descriptors, &[]),
            Err(MuxError::InvalidSection(_))
        ));

        let streams = [PmtStreamEntry {
            stream_type: 0x06,
            pid: 0x100,
            descriptors: vec![Descriptor::new(0x80, vec![0u8; 255])],
        }];
        let pmt = build_pmt(1, 0, 0x100, &[], &streams).unwrap();
        assert_eq!(pmt[17], 0x80);
        assert_eq!(pmt[18], 0xff);
    }

    #[test]
    fn test_scte35_null() {
        let section = build_scte35_null();
        assert_eq!(section.len(), 20);
        assert_eq!(section[0], TABLE_ID_SCTE35);
        assert_eq!((((section[1] & 0x0f) as usize) << 8) | section[2] as usize, 17);
        assert_eq!(section[13], 0x00);
        assert_eq!(Crc32Mpeg2::checksum(&section), 0);
    }
}

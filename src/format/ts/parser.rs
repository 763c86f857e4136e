//! Read-side helpers for inspecting muxer output.
//!
//! Only what is needed to check a stream the muxer produced: packet headers,
//! adaptation fields, PES headers and the PAT/PMT sections.

use bytes::{BufMut, Bytes, BytesMut};

use super::pes::read_timestamp;
use super::psi::Descriptor;
use super::types::*;
use crate::error::{MuxError, Result};
use crate::utils::{BitReader, Crc32Mpeg2};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    pub transport_priority: bool,
    pub pid: u16,
    pub scrambling_control: u8,
    pub has_adaptation: bool,
    pub has_payload: bool,
    pub continuity_counter: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdaptationField {
    /// Value of the adaptation_field_length byte.
    pub length: usize,
    pub discontinuity: bool,
    pub random_access: bool,
    pub es_priority: bool,
    pub pcr: Option<u64>,
    pub opcr: Option<u64>,
    pub splice_countdown: Option<i8>,
    pub private_data: Option<Vec<u8>>,
    pub extension: bool,
}

fn invalid(msg: &str) -> MuxError {
    MuxError::InvalidPacket(msg.into())
}

pub fn parse_header(data: &[u8]) -> Result<TsHeader> {
    if data.len() < TS_HEADER_SIZE {
        return Err(invalid("packet too short"));
    }
    if data[0] != SYNC_BYTE {
        return Err(invalid("bad sync byte"));
    }

    Ok(TsHeader {
        transport_error: (data[1] & 0x80) != 0,
        payload_unit_start: (data[1] & 0x40) != 0,
        transport_priority: (data[1] & 0x20) != 0,
        pid: (((data[1] & 0x1f) as u16) << 8) | data[2] as u16,
        scrambling_control: (data[3] >> 6) & 0x03,
        has_adaptation: (data[3] & 0x20) != 0,
        has_payload: (data[3] & 0x10) != 0,
        continuity_counter: data[3] & 0x0f,
    })
}

fn read_clock(data: &[u8]) -> Result<u64> {
    let mut reader = BitReader::new(data);
    let base = reader.read_bits(33)?;
    reader.skip_bits(6)?;
    let ext = reader.read_bits(9)?;
    Ok(base * 300 + ext)
}

/// Parses the adaptation field of a full packet, if it has one.
pub fn parse_adaptation_field(packet: &[u8]) -> Result<Option<AdaptationField>> {
    let header = parse_header(packet)?;
    if !header.has_adaptation {
        return Ok(None);
    }
    let length = *packet.get(TS_HEADER_SIZE).ok_or_else(|| invalid("no adaptation length"))? as usize;
    let end = TS_HEADER_SIZE + 1 + length;
    if end > packet.len() {
        return Err(invalid("adaptation field overruns packet"));
    }

    let mut field = AdaptationField {
        length,
        discontinuity: false,
        random_access: false,
        es_priority: false,
        pcr: None,
        opcr: None,
        splice_countdown: None,
        private_data: None,
        extension: false,
    };
    if length == 0 {
        return Ok(Some(field));
    }

    let flags = packet[TS_HEADER_SIZE + 1];
    field.discontinuity = (flags & 0x80) != 0;
    field.random_access = (flags & 0x40) != 0;
    field.es_priority = (flags & 0x20) != 0;
    field.extension = (flags & 0x01) != 0;

    let mut pos = TS_HEADER_SIZE + 2;
    let mut take = |n: usize| -> Result<usize> {
        if pos + n > end {
            return Err(invalid("adaptation field truncated"));
        }
        let at = pos;
        pos += n;
        Ok(at)
    };

    if flags & 0x10 != 0 {
        let at = take(6)?;
        field.pcr = Some(read_clock(&packet[at..at + 6])?);
    }
    if flags & 0x08 != 0 {
        let at = take(6)?;
        field.opcr = Some(read_clock(&packet[at..at + 6])?);
    }
    if flags & 0x04 != 0 {
        let at = take(1)?;
        field.splice_countdown = Some(packet[at] as i8);
    }
    if flags & 0x02 != 0 {
        let at = take(1)?;
        let len = packet[at] as usize;
        let at = take(len)?;
        field.private_data = Some(packet[at..at + len].to_vec());
    }

    Ok(Some(field))
}

/// The payload bytes of a full packet, empty when it carries none.
pub fn payload(packet: &[u8]) -> Result<&[u8]> {
    let header = parse_header(packet)?;
    if !header.has_payload {
        return Ok(&[]);
    }
    let start = match parse_adaptation_field(packet)? {
        Some(field) => TS_HEADER_SIZE + 1 + field.length,
        None => TS_HEADER_SIZE,
    };
    packet.get(start..).ok_or_else(|| invalid("payload offset past packet end"))
}

/// Collects one section across the packets of a PID.
#[derive(Debug)]
pub struct SectionAssembler {
    pid: u16,
    buf: BytesMut,
    started: bool,
}

impl SectionAssembler {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            buf: BytesMut::new(),
            started: false,
        }
    }

    /// Feeds a packet; returns the section once it is complete. Packets on
    /// other PIDs are ignored.
    pub fn push(&mut self, packet: &[u8]) -> Result<Option<Bytes>> {
        let header = parse_header(packet)?;
        if header.pid != self.pid {
            return Ok(None);
        }
        let mut data = payload(packet)?;
        if header.payload_unit_start {
            let pointer = *data.first().ok_or_else(|| invalid("missing pointer field"))? as usize;
            data = data
                .get(1 + pointer..)
                .ok_or_else(|| invalid("pointer field past payload"))?;
            self.buf.clear();
            self.started = true;
        } else if !self.started {
            return Ok(None);
        }
        self.buf.put_slice(data);

        if self.buf.len() < 3 {
            return Ok(None);
        }
        let total = 3 + ((((self.buf[1] & 0x0f) as usize) << 8) | self.buf[2] as usize);
        if self.buf.len() < total {
            return Ok(None);
        }
        self.started = false;
        let section = self.buf.split_to(total).freeze();
        self.buf.clear();
        Ok(Some(section))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatInfo {
    pub transport_stream_id: u16,
    pub version: u8,
    /// `(program_number, pmt_pid)` pairs.
    pub programs: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStreamInfo {
    pub stream_type: u8,
    pub pid: u16,
    pub descriptors: Vec<Descriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtInfo {
    pub program_number: u16,
    pub version: u8,
    pub pcr_pid: u16,
    pub program_descriptors: Vec<Descriptor>,
    pub streams: Vec<PmtStreamInfo>,
}

/// Checks the CRC of a long-form section and returns `(id, version, body)`.
fn long_section(section: &[u8], table_id: u8) -> Result<(u16, u8, &[u8])> {
    if section.len() < 12 {
        return Err(MuxError::InvalidSection("section too short".into()));
    }
    if section[0] != table_id {
        return Err(MuxError::InvalidSection(format!(
            "expected table_id 0x{:02x}, got 0x{:02x}",
            table_id, section[0]
        )));
    }
    let total = 3 + ((((section[1] & 0x0f) as usize) << 8) | section[2] as usize);
    if total < 12 || total > section.len() {
        return Err(MuxError::InvalidSection(format!("bad section_length for {} bytes", section.len())));
    }
    let (data, crc) = section[..total].split_at(total - 4);
    let expected = u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]);
    if Crc32Mpeg2::checksum(data) != expected {
        return Err(MuxError::InvalidSection("CRC mismatch".into()));
    }
    let id = ((section[3] as u16) << 8) | section[4] as u16;
    let version = (section[5] >> 1) & 0x1f;
    Ok((id, version, &data[8..]))
}

fn parse_descriptors(mut data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    while data.len() >= 2 {
        let len = data[1] as usize;
        if data.len() < 2 + len {
            return Err(MuxError::InvalidSection("descriptor truncated".into()));
        }
        descriptors.push(Descriptor::new(data[0], &data[2..2 + len]));
        data = &data[2 + len..];
    }
    Ok(descriptors)
}

pub fn parse_pat(section: &[u8]) -> Result<PatInfo> {
    let (transport_stream_id, version, body) = long_section(section, TABLE_ID_PAT)?;
    let programs = body
        .chunks_exact(4)
        .map(|entry| {
            (
                ((entry[0] as u16) << 8) | entry[1] as u16,
                (((entry[2] & 0x1f) as u16) << 8) | entry[3] as u16,
            )
        })
        .collect();
    Ok(PatInfo {
        transport_stream_id,
        version,
        programs,
    })
}

pub fn parse_pmt(section: &[u8]) -> Result<PmtInfo> {
    let (program_number, version, body) = long_section(section, TABLE_ID_PMT)?;
    if body.len() < 4 {
        return Err(MuxError::InvalidSection("PMT too short".into()));
    }
    let pcr_pid = (((body[0] & 0x1f) as u16) << 8) | body[1] as u16;
    let info_len = (((body[2] & 0x0f) as usize) << 8) | body[3] as usize;
    let mut pos = 4 + info_len;
    if pos > body.len() {
        return Err(MuxError::InvalidSection("program info truncated".into()));
    }
    let program_descriptors = parse_descriptors(&body[4..pos])?;

    let mut streams = Vec::new();
    while pos + 5 <= body.len() {
        let stream_type = body[pos];
        let pid = (((body[pos + 1] & 0x1f) as u16) << 8) | body[pos + 2] as u16;
        let es_info_len = (((body[pos + 3] & 0x0f) as usize) << 8) | body[pos + 4] as usize;
        pos += 5;
        if pos + es_info_len > body.len() {
            return Err(MuxError::InvalidSection("ES info truncated".into()));
        }
        streams.push(PmtStreamInfo {
            stream_type,
            pid,
            descriptors: parse_descriptors(&body[pos..pos + es_info_len])?,
        });
        pos += es_info_len;
    }

    Ok(PmtInfo {
        program_number,
        version,
        pcr_pid,
        program_descriptors,
        streams,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesInfo {
    pub stream_id: u8,
    pub packet_length: u16,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    /// Bytes before the PES payload.
    pub header_len: usize,
}

/// Parses the PES header at the start of a PUSI payload.
pub fn parse_pes_header(data: &[u8]) -> Result<PesInfo> {
    if data.len() < 6 || data[..3] != [0x00, 0x00, 0x01] {
        return Err(invalid("missing PES start code"));
    }
    let stream_id = data[3];
    let packet_length = ((data[4] as u16) << 8) | data[5] as u16;

    // streams without the optional header
    let short_form = matches!(stream_id, 0xbc | 0xbe | 0xbf | 0xf0 | 0xf1 | 0xf2 | 0xf8 | 0xff);
    if short_form || data.get(6).map_or(true, |b| b & 0xc0 != 0x80) {
        return Ok(PesInfo {
            stream_id,
            packet_length,
            pts: None,
            dts: None,
            header_len: 6,
        });
    }
    if data.len() < 9 {
        return Err(invalid("PES header truncated"));
    }
    let flags = data[7] >> 6;
    let header_len = 9 + data[8] as usize;
    if data.len() < header_len {
        return Err(invalid("PES header truncated"));
    }
    let pts = if flags & 0x02 != 0 {
        Some(read_timestamp(&data[9..])?)
    } else {
        None
    };
    let dts = if flags == 0x03 {
        Some(read_timestamp(&data[14..])?)
    } else {
        None
    };

    Ok(PesInfo {
        stream_id,
        packet_length,
        pts,
        dts,
        header_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::packet::{write_ts_header, PacketFlags, PacketInfo};
    use crate::format::ts::pes::PesHeader;
    use crate::format::ts::psi::{build_pat, build_pmt, PatEntry, PmtStreamEntry};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_header() {
        let header = parse_header(&[0x47, 0x41, 0x00, 0x1a]).unwrap();
        assert!(header.payload_unit_start);
        assert_eq!(header.pid, 0x100);
        assert!(header.has_payload);
        assert!(!header.has_adaptation);
        assert_eq!(header.continuity_counter, 0x0a);
        assert!(parse_header(&[0x46, 0, 0, 0]).is_err());
        assert!(parse_header(&[0x47]).is_err());
    }

    #[test]
    fn test_adaptation_pcr() {
        let mut pi = PacketInfo::new(0x100);
        pi.flags = PacketFlags::ADAPTATION | PacketFlags::WRITE_PCR | PacketFlags::RANDOM_ACCESS;
        pi.pcr = 27_000_000 * 10 + 123;
        let mut packet = [0u8; TS_PACKET_SIZE];
        write_ts_header(&mut packet, &pi, 100).unwrap();

        let field = parse_adaptation_field(&packet).unwrap().unwrap();
        assert_eq!(field.pcr, Some(27_000_000 * 10 + 123));
        assert!(field.random_access);
        assert_eq!(payload(&packet).unwrap().len(), 100);
    }

    #[test]
    fn test_sections() {
        let pat = build_pat(1, 3, &[PatEntry { program_number: 1, pmt_pid: 0x20 }]).unwrap();
        let info = parse_pat(&pat).unwrap();
        assert_eq!(info.version, 3);
        assert_eq!(info.programs, vec![(1, 0x20)]);

        let pmt = build_pmt(
            1,
            0,
            0x100,
            &[Descriptor::registration(b"CUEI")],
            &[PmtStreamEntry {
                stream_type: 0x1b,
                pid: 0x100,
                descriptors: vec![],
            }],
        )
        .unwrap();
        let info = parse_pmt(&pmt).unwrap();
        assert_eq!(info.pcr_pid, 0x100);
        assert_eq!(info.program_descriptors, vec![Descriptor::registration(b"CUEI")]);
        assert_eq!(info.streams[0].stream_type, 0x1b);

        let mut corrupt = pat.to_vec();
        corrupt[9] ^= 0xff;
        assert!(matches!(parse_pat(&corrupt), Err(MuxError::InvalidSection(_))));
        assert!(parse_pmt(&pat).is_err());
    }

    #[test]
    fn test_pes_header() {
        let mut buf = Vec::new();
        PesHeader::new(0xe0)
            .with_full_header(true)
            .with_pts(9000)
            .with_dts(6000)
            .write_to(&mut buf)
            .unwrap();
        let info = parse_pes_header(&buf).unwrap();
        assert_eq!(info.stream_id, 0xe0);
        assert_eq!(info.pts, Some(9000));
        assert_eq!(info.dts, Some(6000));
        assert_eq!(info.header_len, 19);
    }
}

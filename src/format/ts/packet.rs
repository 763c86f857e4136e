use bitflags::bitflags;
use bytes::Bytes;
use log::trace;

use super::types::*;
use crate::error::{MuxError, Result};
use crate::utils::BitWriter;

bitflags! {
    /// Per-packet requests carried by [`PacketInfo`].
    ///
    /// The low byte drives the adaptation field, the high bits describe the
    /// PES header the owning stream will emit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u32 {
        const ADAPTATION = 0x0001;
        const DISCONTINUITY = 0x0002;
        const RANDOM_ACCESS = 0x0004;
        const PRIORITY = 0x0008;
        const WRITE_PCR = 0x0010;
        const WRITE_OPCR = 0x0020;
        const WRITE_SPLICE = 0x0040;
        const WRITE_ADAPT_EXT = 0x0080;

        const PES_FULL_HEADER = 0x0100;
        const PES_WRITE_PTS = 0x0200;
        const PES_WRITE_PTS_DTS = 0x0400;
        const PES_EXT_STREAMID = 0x0800;
        const PES_DATA_ALIGNMENT = 0x1000;

        /// Flags that describe the stream rather than a single packet.
        const PERSISTENT = Self::PES_FULL_HEADER.bits()
            | Self::PES_EXT_STREAMID.bits()
            | Self::PES_DATA_ALIGNMENT.bits();
    }
}

/// Everything the header writer needs to know about the next packet of a PID.
#[derive(Debug, Clone, Default)]
pub struct PacketInfo {
    pub pid: u16,
    pub flags: PacketFlags,
    pub payload_unit_start: bool,
    /// 27 MHz value, written when `WRITE_PCR` is set.
    pub pcr: u64,
    /// 27 MHz value, written when `WRITE_OPCR` is set.
    pub opcr: u64,
    pub splice_countdown: i8,
    /// Transport private data; empty means none.
    pub private_data: Bytes,
}

impl PacketInfo {
    pub fn new(pid: u16) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }

    /// Drops the one-shot requests after a packet went out.
    pub fn reset_dynamic_flags(&mut self) {
        self.flags &= PacketFlags::PERSISTENT;
    }
}

/// Where the payload of a freshly written header starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    pub payload_offset: usize,
    pub payload_len: usize,
    /// Whether the packet carries payload, and thus advances the continuity counter.
    pub has_payload: bool,
}

fn write_clock_reference(buf: &mut [u8], value: u64) -> Result<()> {
    let base = value / 300;
    let ext = value % 300;
    let mut writer = BitWriter::new(buf);
    writer.write_bits(33, base)?;
    writer.write_bits(6, 0x3f)?;
    writer.write_bits(9, ext)
}

/// Writes an adaptation field at the start of `buf`, returning its total length
/// including the length byte.
///
/// Fields appear in the order the flags byte announces them: PCR, OPCR, splice
/// countdown, private data, a minimal extension. Whatever room is left up to
/// `min_length` is filled with `0xff` stuffing. Fails without touching `buf`
/// when the requested fields do not fit in a packet.
pub fn write_adaptation_field(buf: &mut [u8], pi: &PacketInfo, min_length: usize) -> Result<usize> {
    // A single zero length byte is the only way to stuff exactly one byte.
    if min_length == 1 && !pi.flags.contains(PacketFlags::ADAPTATION) {
        if buf.is_empty() {
            return Err(MuxError::BufferTooSmall {
                needed: 1,
                available: 0,
            });
        }
        buf[0] = 0;
        return Ok(1);
    }

    let mut flags = 0u8;
    let mut needed = 2;
    let requested = if pi.flags.contains(PacketFlags::ADAPTATION) {
        pi.flags
    } else {
        PacketFlags::empty()
    };

    if requested.contains(PacketFlags::DISCONTINUITY) {
        flags |= 0x80;
    }
    if requested.contains(PacketFlags::RANDOM_ACCESS) {
        flags |= 0x40;
    }
    if requested.contains(PacketFlags::PRIORITY) {
        flags |= 0x20;
    }
    if requested.contains(PacketFlags::WRITE_PCR) {
        flags |= 0x10;
        needed += 6;
    }
    if requested.contains(PacketFlags::WRITE_OPCR) {
        flags |= 0x08;
        needed += 6;
    }
    if requested.contains(PacketFlags::WRITE_SPLICE) {
        flags |= 0x04;
        needed += 1;
    }
    let write_private = !requested.is_empty() && !pi.private_data.is_empty();
    if write_private {
        if 1 + pi.private_data.len() > TS_PAYLOAD_SIZE - needed {
            return Err(MuxError::AdaptationFieldOverflow {
                needed: needed + 1 + pi.private_data.len(),
                available: TS_PAYLOAD_SIZE,
            });
        }
        flags |= 0x02;
        needed += 1 + pi.private_data.len();
    }
    if requested.contains(PacketFlags::WRITE_ADAPT_EXT) {
        flags |= 0x01;
        needed += 2;
    }

    let length = needed.max(min_length);
    if length > TS_PAYLOAD_SIZE || length > buf.len() {
        return Err(MuxError::AdaptationFieldOverflow {
            needed: length,
            available: buf.len().min(TS_PAYLOAD_SIZE),
        });
    }

    buf[0] = (length - 1) as u8;
    buf[1] = flags;
    let mut pos = 2;

    if flags & 0x10 != 0 {
        write_clock_reference(&mut buf[pos..pos + 6], pi.pcr)?;
        pos += 6;
    }
    if flags & 0x08 != 0 {
        write_clock_reference(&mut buf[pos..pos + 6], pi.opcr)?;
        pos += 6;
    }
    if flags & 0x04 != 0 {
        buf[pos] = pi.splice_countdown as u8;
        pos += 1;
    }
    if write_private {
        let len = pi.private_data.len();
        buf[pos] = len as u8;
        buf[pos + 1..pos + 1 + len].copy_from_slice(&pi.private_data);
        pos += 1 + len;
    }
    if flags & 0x01 != 0 {
        buf[pos] = 1;
        // ltw, piecewise rate and seamless splice all absent
        buf[pos + 1] = 0x1f;
        pos += 2;
    }

    buf[pos..length].fill(0xff);

    trace!(
        "adaptation field pid=0x{:04x} length={} flags=0x{:02x}",
        pi.pid,
        length,
        flags
    );
    Ok(length)
}

/// Writes the 4-byte transport header, plus an adaptation field when one is
/// requested or `stream_avail` cannot fill the payload, into `packet`.
///
/// The continuity counter nibble is left zero; see [`ContinuityCounters::stamp`].
pub fn write_ts_header(packet: &mut [u8], pi: &PacketInfo, stream_avail: usize) -> Result<PacketLayout> {
    if packet.len() < TS_PACKET_SIZE {
        return Err(MuxError::BufferTooSmall {
            needed: TS_PACKET_SIZE,
            available: packet.len(),
        });
    }

    packet[0] = SYNC_BYTE;
    packet[1] = ((pi.pid >> 8) & 0x1f) as u8;
    if pi.payload_unit_start {
        packet[1] |= 0x40;
    }
    packet[2] = (pi.pid & 0xff) as u8;

    let adapt_len = if pi.flags.contains(PacketFlags::ADAPTATION) || stream_avail < TS_PAYLOAD_SIZE {
        let min_length = TS_PAYLOAD_SIZE.saturating_sub(stream_avail);
        write_adaptation_field(&mut packet[TS_HEADER_SIZE..TS_PACKET_SIZE], pi, min_length)?
    } else {
        0
    };

    let payload_len = TS_PAYLOAD_SIZE - adapt_len;
    let has_payload = payload_len > 0 && stream_avail > 0;

    let mut b3 = 0u8;
    if adapt_len > 0 {
        b3 |= 0x20;
    }
    if has_payload {
        b3 |= 0x10;
    }
    packet[3] = b3;

    Ok(PacketLayout {
        payload_offset: TS_HEADER_SIZE + adapt_len,
        payload_len: if has_payload { payload_len } else { 0 },
        has_payload,
    })
}

/// Overwrites the continuity counter nibble of a written packet.
pub fn set_continuity_counter(packet: &mut [u8], cc: u8) {
    packet[3] = (packet[3] & 0xf0) | (cc & 0x0f);
}

/// Fills `packet` with a null packet (PID 0x1fff, all-`0xff` payload).
pub fn write_null_packet(packet: &mut [u8]) -> Result<()> {
    if packet.len() < TS_PACKET_SIZE {
        return Err(MuxError::BufferTooSmall {
            needed: TS_PACKET_SIZE,
            available: packet.len(),
        });
    }
    packet[0] = SYNC_BYTE;
    packet[1] = (PID_NULL >> 8) as u8;
    packet[2] = (PID_NULL & 0xff) as u8;
    packet[3] = 0x10;
    packet[TS_HEADER_SIZE..TS_PACKET_SIZE].fill(0xff);
    Ok(())
}

/// One 4-bit continuity counter per PID.
#[derive(Debug, Clone)]
pub struct ContinuityCounters {
    counters: Box<[u8]>,
}

impl ContinuityCounters {
    pub fn new() -> Self {
        Self {
            counters: vec![0u8; usize::from(PID_NULL) + 1].into_boxed_slice(),
        }
    }

    pub fn current(&self, pid: u16) -> u8 {
        self.counters[usize::from(pid & PID_NULL)]
    }

    /// Advances the counter of `pid` and returns the new value.
    pub fn advance(&mut self, pid: u16) -> u8 {
        let slot = &mut self.counters[usize::from(pid & PID_NULL)];
        *slot = (*slot + 1) & 0x0f;
        *slot
    }

    /// Stamps the counter into a packet written by [`write_ts_header`],
    /// advancing it only when the packet carries payload.
    pub fn stamp(&mut self, packet: &mut [u8], pid: u16, layout: &PacketLayout) -> u8 {
        let cc = if layout.has_payload {
            self.advance(pid)
        } else {
            self.current(pid)
        };
        set_continuity_counter(packet, cc);
        cc
    }

    pub fn reset(&mut self) {
        self.counters.fill(0);
    }
}

impl Default for ContinuityCounters {
    fn default() -> Self {
        Self::new()
    }
}

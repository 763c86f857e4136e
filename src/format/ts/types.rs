use std::time::Duration;

use crate::error::MuxError;

// Packet geometry
pub const TS_PACKET_SIZE: usize = 188;
pub const TS_HEADER_SIZE: usize = 4;
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - TS_HEADER_SIZE;
pub const SYNC_BYTE: u8 = 0x47;

// PIDs
pub const PID_PAT: u16 = 0x0000;
pub const PID_NULL: u16 = 0x1fff;
pub const START_PMT_PID: u16 = 0x0020;
pub const START_ES_PID: u16 = 0x0040;

// Table IDs
pub const TABLE_ID_PAT: u8 = 0x00;
pub const TABLE_ID_PMT: u8 = 0x02;
pub const TABLE_ID_SCTE35: u8 = 0xfc;

pub const START_PROGRAM_NUMBER: u16 = 1;
pub const MAX_PROGRAMS: usize = 253;
pub const DEFAULT_TRANSPORT_STREAM_ID: u16 = 1;

// Clocks
pub const PTS_HZ: u64 = 90_000;
pub const PCR_HZ: u64 = 27_000_000;
/// Largest value of a 33-bit PTS/DTS.
pub const MAX_TIMESTAMP: u64 = (1 << 33) - 1;
/// Offset added to every input timestamp so early PCR values never go negative.
pub const CLOCK_BASE: u64 = PTS_HZ * 60 * 60;
/// How far the PCR runs ahead of the presentation clock.
pub const PCR_ADVANCE: u64 = PTS_HZ / 8;
/// Byte position of the PCR field inside a packet carrying one.
pub const PCR_BYTE_OFFSET: u64 = 11;

// Default table and clock-reference intervals, in 90 kHz ticks
pub const DEFAULT_PAT_INTERVAL: u64 = PTS_HZ / 10;
pub const DEFAULT_PMT_INTERVAL: u64 = PTS_HZ / 10;
pub const DEFAULT_SI_INTERVAL: u64 = PTS_HZ / 10;
pub const DEFAULT_PCR_INTERVAL: u64 = PTS_HZ / 25;
pub const DEFAULT_SCTE35_NULL_INTERVAL: u64 = PTS_HZ * 5;

// PES stream ids
pub const STREAM_ID_PRIVATE_1: u8 = 0xbd;
pub const STREAM_ID_AUDIO: u8 = 0xc0;
pub const STREAM_ID_VIDEO: u8 = 0xe0;
pub const STREAM_ID_EXTENDED: u8 = 0xfd;

pub const STREAM_ID_EXT_LPCM: u8 = 0x80;
pub const STREAM_ID_EXT_AC3: u8 = 0x71;
pub const STREAM_ID_EXT_EAC3: u8 = 0x72;
pub const STREAM_ID_EXT_DTS: u8 = 0x82;

// PMT stream_type codes not tied to a queued elementary stream
pub const STREAM_TYPE_PRIVATE_DATA: u8 = 0x06;
pub const STREAM_TYPE_SCTE35: u8 = 0x86;
pub const STREAM_TYPE_ATSC_AC3: u8 = 0x81;
pub const STREAM_TYPE_ATSC_EAC3: u8 = 0x87;

/// Fixed PES header data length EN 300 472 requires for teletext.
pub const TELETEXT_HEADER_DATA_LENGTH: u8 = 36;

/// Elementary stream kinds the muxer knows how to packetize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Mpeg1Video,
    Mpeg2Video,
    Mpeg4Video,
    H264,
    H265,
    Jpeg2000,
    JpegXs,
    Mpeg1Audio,
    Mpeg2Audio,
    AacAdts,
    AacLatm,
    Ac3,
    Eac3,
    Dts,
    Lpcm,
    Opus,
    Teletext,
    DvbSubtitle,
    Klv,
    PrivateData,
}

impl StreamType {
    /// The `stream_type` byte announced in the PMT.
    pub fn code(&self) -> u8 {
        match self {
            StreamType::Mpeg1Video => 0x01,
            StreamType::Mpeg2Video => 0x02,
            StreamType::Mpeg4Video => 0x10,
            StreamType::H264 => 0x1b,
            StreamType::H265 => 0x24,
            StreamType::Jpeg2000 => 0x21,
            StreamType::JpegXs => 0x32,
            StreamType::Mpeg1Audio => 0x03,
            StreamType::Mpeg2Audio => 0x04,
            StreamType::AacAdts => 0x0f,
            StreamType::AacLatm => 0x11,
            StreamType::Lpcm => 0x80,
            StreamType::Ac3
            | StreamType::Eac3
            | StreamType::Dts
            | StreamType::Opus
            | StreamType::Teletext
            | StreamType::DvbSubtitle
            | StreamType::Klv
            | StreamType::PrivateData => STREAM_TYPE_PRIVATE_DATA,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(
            self,
            StreamType::Mpeg1Video
                | StreamType::Mpeg2Video
                | StreamType::Mpeg4Video
                | StreamType::H264
                | StreamType::H265
                | StreamType::Jpeg2000
                | StreamType::JpegXs
        )
    }

    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            StreamType::Mpeg1Audio
                | StreamType::Mpeg2Audio
                | StreamType::AacAdts
                | StreamType::AacLatm
                | StreamType::Ac3
                | StreamType::Eac3
                | StreamType::Dts
                | StreamType::Lpcm
                | StreamType::Opus
        )
    }
}

impl TryFrom<u8> for StreamType {
    type Error = MuxError;

    /// Maps an ISO/IEC 13818-1 `stream_type` back to a stream kind. Codes that
    /// are shared by several private-data carriers resolve to `PrivateData`.
    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x01 => StreamType::Mpeg1Video,
            0x02 => StreamType::Mpeg2Video,
            0x03 => StreamType::Mpeg1Audio,
            0x04 => StreamType::Mpeg2Audio,
            0x06 => StreamType::PrivateData,
            0x0f => StreamType::AacAdts,
            0x10 => StreamType::Mpeg4Video,
            0x11 => StreamType::AacLatm,
            0x1b => StreamType::H264,
            0x21 => StreamType::Jpeg2000,
            0x24 => StreamType::H265,
            0x32 => StreamType::JpegXs,
            0x80 => StreamType::Lpcm,
            STREAM_TYPE_ATSC_AC3 => StreamType::Ac3,
            STREAM_TYPE_ATSC_EAC3 => StreamType::Eac3,
            other => return Err(MuxError::UnsupportedStreamType(other)),
        })
    }
}

/// `val * num / denom` without intermediate overflow, rounding down.
pub fn uint64_scale(val: u64, num: u64, denom: u64) -> u64 {
    if denom == 0 {
        return u64::MAX;
    }
    let scaled = u128::from(val) * u128::from(num) / u128::from(denom);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

/// Converts a 90 kHz timestamp (already offset by [`CLOCK_BASE`]) to a 27 MHz PCR.
pub fn ts_to_pcr(ts: u64) -> u64 {
    ts.saturating_sub(PCR_ADVANCE).saturating_mul(PCR_HZ / PTS_HZ)
}

pub fn pcr_to_time(pcr: u64) -> Duration {
    Duration::from_nanos(uint64_scale(pcr, 1_000_000_000, PCR_HZ))
}

pub fn pts_to_time(pts: u64) -> Duration {
    Duration::from_nanos(uint64_scale(pts, 1_000_000_000, PTS_HZ))
}

pub fn time_to_pts(time: Duration) -> u64 {
    let nanos = u64::try_from(time.as_nanos()).unwrap_or(u64::MAX);
    uint64_scale(nanos, PTS_HZ, 1_000_000_000)
}

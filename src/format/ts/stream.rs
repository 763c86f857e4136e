use std::collections::VecDeque;
use std::fmt;

use log::{debug, trace, warn};

use super::packet::{PacketFlags, PacketInfo};
use super::pes::{PesHeader, PES_BASE_HEADER_SIZE};
use super::psi::*;
use super::types::*;
use crate::av::AccessUnit;
use crate::error::{MuxError, Result};

/// Called once with every access unit whose bytes have all been packetized.
pub type ReleaseHook = Box<dyn FnMut(AccessUnit) + Send>;

/// Where the stream is within the current PES packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PesState {
    /// The next byte handed out is the first byte of a PES header.
    Header,
    /// Inside a PES payload.
    Packet,
}

#[derive(Debug)]
struct QueuedUnit {
    unit: AccessUnit,
    consumed: usize,
}

impl QueuedUnit {
    fn remaining(&self) -> usize {
        self.unit.len() - self.consumed
    }
}

/// Produces the PMT `stream_type` and ES descriptors for a stream.
///
/// The muxer calls this whenever it rebuilds a PMT. Implement it to carry
/// regional or private descriptors the built-in sources do not know about.
pub trait DescriptorSource: Send {
    fn stream_type_code(&self, stream: &ElementaryStream) -> u8 {
        stream.stream_type().code()
    }

    fn es_descriptors(&self, stream: &ElementaryStream) -> Vec<Descriptor>;
}

/// DVB-flavoured descriptors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDescriptors;

/// ATSC A/52 descriptors for AC-3 audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtscAc3Descriptors;

/// ATSC A/52 Annex G descriptors for E-AC-3 audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtscEac3Descriptors;

/// Picture parameters carried in the J2K video descriptor of a JPEG 2000
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jpeg2000Params {
    /// Rsiz profile in the high byte, main level in the low nibble.
    pub profile_and_level: u16,
    pub horizontal_size: u32,
    pub vertical_size: u32,
    pub max_bitrate: u32,
    pub frame_rate_num: u16,
    pub frame_rate_den: u16,
    /// 1 sRGB, 2 Rec.601, 3 Rec.709.
    pub color_spec: u8,
    pub interlaced: bool,
}

impl Default for Jpeg2000Params {
    fn default() -> Self {
        Self {
            profile_and_level: 0,
            horizontal_size: 0,
            vertical_size: 0,
            max_bitrate: 0,
            frame_rate_num: 0,
            frame_rate_den: 0,
            color_spec: 1,
            interlaced: false,
        }
    }
}

impl Jpeg2000Params {
    /// Buffer size H.222.0 Table 2-104 assigns to the main level.
    fn max_buffer_size(&self) -> u32 {
        match self.profile_and_level & 0x0f {
            1..=3 => 1_250_000,
            4 => 2_500_000,
            5 => 5_000_000,
            6 => 10_000_000,
            _ => 0,
        }
    }

    fn descriptor(&self) -> Descriptor {
        let mut data = Vec::with_capacity(24);
        data.extend_from_slice(&self.profile_and_level.to_be_bytes());
        data.extend_from_slice(&self.horizontal_size.to_be_bytes());
        data.extend_from_slice(&self.vertical_size.to_be_bytes());
        data.extend_from_slice(&self.max_bitrate.to_be_bytes());
        data.extend_from_slice(&self.max_buffer_size().to_be_bytes());
        data.extend_from_slice(&self.frame_rate_den.to_be_bytes());
        data.extend_from_slice(&self.frame_rate_num.to_be_bytes());
        data.push(self.color_spec);
        // still_mode 0, interlaced_video, reserved
        data.push(if self.interlaced { 0x7f } else { 0x3f });
        Descriptor::new(DESCRIPTOR_TAG_J2K_VIDEO, data)
    }
}

fn language_or_undefined(stream: &ElementaryStream) -> [u8; 3] {
    stream.language.unwrap_or(*b"und")
}

impl DescriptorSource for DefaultDescriptors {
    fn es_descriptors(&self, stream: &ElementaryStream) -> Vec<Descriptor> {
        let mut out = Vec::new();
        match stream.stream_type() {
            StreamType::H265 => out.push(Descriptor::registration(b"HEVC")),
            StreamType::Ac3 => out.push(Descriptor::new(DESCRIPTOR_TAG_DVB_AC3, vec![0x00])),
            StreamType::Eac3 => out.push(Descriptor::new(DESCRIPTOR_TAG_DVB_EAC3, vec![0x00])),
            StreamType::Dts => out.push(Descriptor::registration(b"DTS1")),
            StreamType::Klv => out.push(Descriptor::registration(b"KLVA")),
            StreamType::Jpeg2000 => out.push(stream.jpeg2000.descriptor()),
            StreamType::Opus => {
                let channel_config = match stream.audio_channels {
                    Some(channels @ 1..=8) => channels,
                    _ => 0xff,
                };
                out.push(Descriptor::registration(b"Opus"));
                // extension tag 0x80: user defined, carries channel_config_code
                out.push(Descriptor::new(
                    DESCRIPTOR_TAG_DVB_EXTENSION,
                    vec![0x80, channel_config],
                ));
            }
            StreamType::Teletext => {
                let mut data = language_or_undefined(stream).to_vec();
                // initial teletext page, magazine 1, page 00
                data.extend_from_slice(&[0x09, 0x00]);
                out.push(Descriptor::new(DESCRIPTOR_TAG_TELETEXT, data));
            }
            StreamType::DvbSubtitle => {
                let mut data = language_or_undefined(stream).to_vec();
                // normal subtitles, composition page 1, ancillary page 1
                data.extend_from_slice(&[0x10, 0x00, 0x01, 0x00, 0x01]);
                out.push(Descriptor::new(DESCRIPTOR_TAG_SUBTITLING, data));
            }
            _ => {}
        }

        if stream.stream_type().is_audio() {
            if let Some(language) = &stream.language {
                out.push(Descriptor::iso_639_language(language));
            }
        }
        out
    }
}

impl DescriptorSource for AtscAc3Descriptors {
    fn stream_type_code(&self, _stream: &ElementaryStream) -> u8 {
        STREAM_TYPE_ATSC_AC3
    }

    fn es_descriptors(&self, stream: &ElementaryStream) -> Vec<Descriptor> {
        let num_channels: u8 = match stream.audio_channels {
            Some(1) => 0b0001,
            Some(2) => 0b0010,
            _ => 0b1101,
        };
        let mut out = vec![
            Descriptor::registration(b"AC-3"),
            Descriptor::new(
                DESCRIPTOR_TAG_ATSC_AC3,
                // 48 kHz, bsid 8; upper-limit 640 kbit/s; bsmod 0, full_svc; langcod
                vec![0x08, 0xc8, (num_channels << 1) | 0x01, 0x00],
            ),
        ];
        if let Some(language) = &stream.language {
            out.push(Descriptor::iso_639_language(language));
        }
        out
    }
}

impl DescriptorSource for AtscEac3Descriptors {
    fn stream_type_code(&self, _stream: &ElementaryStream) -> u8 {
        STREAM_TYPE_ATSC_EAC3
    }

    fn es_descriptors(&self, stream: &ElementaryStream) -> Vec<Descriptor> {
        let number_of_channels: u8 = match stream.audio_channels {
            Some(1) => 0b000,
            Some(2) => 0b010,
            _ => 0b100,
        };
        let mut out = vec![Descriptor::new(
            DESCRIPTOR_TAG_ATSC_EAC3,
            // no optional fields; full service, complete main
            vec![0x80, 0xc0 | number_of_channels],
        )];
        if let Some(language) = &stream.language {
            out.push(Descriptor::iso_639_language(language));
        }
        out
    }
}

/// Creates the [`ElementaryStream`]s a muxer hands out.
pub trait StreamFactory: Send {
    fn new_stream(
        &mut self,
        pid: u16,
        stream_type: StreamType,
        language: Option<&str>,
    ) -> Result<ElementaryStream>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStreamFactory;

impl StreamFactory for DefaultStreamFactory {
    fn new_stream(
        &mut self,
        pid: u16,
        stream_type: StreamType,
        language: Option<&str>,
    ) -> Result<ElementaryStream> {
        let mut stream = ElementaryStream::new(pid, stream_type);
        if let Some(language) = language {
            stream.set_language(language)?;
        }
        Ok(stream)
    }
}

/// Announces AC-3 and E-AC-3 the ATSC way.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtscStreamFactory;

impl StreamFactory for AtscStreamFactory {
    fn new_stream(
        &mut self,
        pid: u16,
        stream_type: StreamType,
        language: Option<&str>,
    ) -> Result<ElementaryStream> {
        let mut stream = DefaultStreamFactory.new_stream(pid, stream_type, language)?;
        match stream_type {
            StreamType::Ac3 => stream.set_descriptor_source(Box::new(AtscAc3Descriptors)),
            StreamType::Eac3 => stream.set_descriptor_source(Box::new(AtscEac3Descriptors)),
            _ => {}
        }
        Ok(stream)
    }
}

/// One elementary stream on its own PID, turning queued access units into
/// PES packets handed out in transport-packet-sized slices.
pub struct ElementaryStream {
    pid: u16,
    stream_type: StreamType,
    stream_id: u8,
    stream_id_ext: Option<u8>,
    pub(crate) pi: PacketInfo,

    state: PesState,
    queue: VecDeque<QueuedUnit>,
    bytes_avail: usize,

    /// Size of the PES being written, 0 while unbounded.
    cur_pes_payload_size: usize,
    pes_bytes_written: usize,
    pes_payload_size: usize,
    pes_header_data_length: Option<u8>,

    header_pts: Option<u64>,
    header_dts: Option<u64>,
    last_pts: Option<u64>,
    last_dts: Option<u64>,

    pub(crate) first_ts: Option<u64>,
    pub(crate) next_pcr: Option<u64>,
    pcr_ref: u32,

    pmt_index: Option<u32>,
    language: Option<[u8; 3]>,
    audio_channels: Option<u8>,
    jpeg2000: Jpeg2000Params,
    descriptors: Box<dyn DescriptorSource>,
    release: Option<ReleaseHook>,
}

impl fmt::Debug for ElementaryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementaryStream")
            .field("pid", &self.pid)
            .field("stream_type", &self.stream_type)
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .field("queued_units", &self.queue.len())
            .field("bytes_avail", &self.bytes_avail)
            .field("last_pts", &self.last_pts)
            .field("last_dts", &self.last_dts)
            .finish_non_exhaustive()
    }
}

impl ElementaryStream {
    /// Creates a stream with the PES layout `stream_type` calls for.
    pub fn new(pid: u16, stream_type: StreamType) -> Self {
        let mut flags = PacketFlags::PES_FULL_HEADER;
        let mut stream_id_ext = None;
        let mut pes_header_data_length = None;

        let stream_id = match stream_type {
            StreamType::Mpeg1Video
            | StreamType::Mpeg2Video
            | StreamType::Mpeg4Video
            | StreamType::H264
            | StreamType::H265 => STREAM_ID_VIDEO,
            StreamType::Mpeg1Audio | StreamType::Mpeg2Audio | StreamType::AacAdts | StreamType::AacLatm => {
                STREAM_ID_AUDIO
            }
            StreamType::Ac3 | StreamType::Eac3 | StreamType::Dts | StreamType::Lpcm => {
                stream_id_ext = Some(match stream_type {
                    StreamType::Ac3 => STREAM_ID_EXT_AC3,
                    StreamType::Eac3 => STREAM_ID_EXT_EAC3,
                    StreamType::Dts => STREAM_ID_EXT_DTS,
                    _ => STREAM_ID_EXT_LPCM,
                });
                flags |= PacketFlags::PES_EXT_STREAMID;
                STREAM_ID_EXTENDED
            }
            StreamType::Teletext => {
                flags |= PacketFlags::PES_DATA_ALIGNMENT;
                pes_header_data_length = Some(TELETEXT_HEADER_DATA_LENGTH);
                STREAM_ID_PRIVATE_1
            }
            StreamType::DvbSubtitle | StreamType::Klv => {
                flags |= PacketFlags::PES_DATA_ALIGNMENT;
                STREAM_ID_PRIVATE_1
            }
            StreamType::Jpeg2000 | StreamType::JpegXs | StreamType::Opus | StreamType::PrivateData => {
                STREAM_ID_PRIVATE_1
            }
        };

        let mut pi = PacketInfo::new(pid);
        pi.flags = flags;

        debug!(
            "new stream pid=0x{:04x} type={:?} stream_id=0x{:02x}",
            pid, stream_type, stream_id
        );

        Self {
            pid,
            stream_type,
            stream_id,
            stream_id_ext,
            pi,
            state: PesState::Header,
            queue: VecDeque::new(),
            bytes_avail: 0,
            cur_pes_payload_size: 0,
            pes_bytes_written: 0,
            pes_payload_size: 0,
            pes_header_data_length,
            header_pts: None,
            header_dts: None,
            last_pts: None,
            last_dts: None,
            first_ts: None,
            next_pcr: None,
            pcr_ref: 0,
            pmt_index: None,
            language: None,
            audio_channels: None,
            jpeg2000: Jpeg2000Params::default(),
            descriptors: Box::new(DefaultDescriptors),
            release: None,
        }
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn stream_id(&self) -> u8 {
        self.stream_id
    }

    pub fn stream_id_extension(&self) -> Option<u8> {
        self.stream_id_ext
    }

    pub fn state(&self) -> PesState {
        self.state
    }

    pub fn is_video(&self) -> bool {
        self.stream_type.is_video()
    }

    pub fn is_pcr(&self) -> bool {
        self.pcr_ref > 0
    }

    pub(crate) fn pcr_ref(&mut self) {
        self.pcr_ref += 1;
    }

    pub(crate) fn pcr_unref(&mut self) {
        self.pcr_ref = self.pcr_ref.saturating_sub(1);
        if self.pcr_ref == 0 {
            self.next_pcr = None;
            self.first_ts = None;
        }
    }

    pub fn last_pts(&self) -> Option<u64> {
        self.last_pts
    }

    pub fn last_dts(&self) -> Option<u64> {
        self.last_dts
    }

    pub fn pmt_index(&self) -> Option<u32> {
        self.pmt_index
    }

    /// Orders this stream within its program's PMT; unindexed streams follow
    /// indexed ones by ascending PID.
    pub fn set_pmt_index(&mut self, index: Option<u32>) {
        self.pmt_index = index;
    }

    pub fn language(&self) -> Option<&str> {
        self.language
            .as_ref()
            .and_then(|l| std::str::from_utf8(l).ok())
    }

    /// Sets the ISO 639-2 language code, e.g. `"eng"`.
    pub fn set_language(&mut self, language: &str) -> Result<()> {
        let bytes = language.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_alphabetic) {
            return Err(MuxError::Config(format!(
                "invalid ISO 639 language code {:?}",
                language
            )));
        }
        let mut code = [0u8; 3];
        code.copy_from_slice(&bytes.to_ascii_lowercase());
        self.language = Some(code);
        Ok(())
    }

    pub fn audio_channels(&self) -> Option<u8> {
        self.audio_channels
    }

    pub fn set_audio_channels(&mut self, channels: u8) {
        self.audio_channels = Some(channels);
    }

    pub fn jpeg2000_params(&self) -> &Jpeg2000Params {
        &self.jpeg2000
    }

    /// Sets the picture parameters announced for a JPEG 2000 stream.
    pub fn set_jpeg2000_params(&mut self, params: Jpeg2000Params) {
        if self.jpeg2000 != params {
            trace!("0x{:04x}: J2K parameters {:?}", self.pid, params);
        }
        self.jpeg2000 = params;
    }

    /// Forces every PES packet to carry exactly `size` payload bytes; 0 restores
    /// the per-type default.
    pub fn set_pes_payload_size(&mut self, size: usize) {
        self.pes_payload_size = size;
    }

    /// Pads PES headers to a fixed `PES_header_data_length`.
    pub fn set_pes_header_data_length(&mut self, length: Option<u8>) {
        self.pes_header_data_length = length;
    }

    pub fn set_descriptor_source(&mut self, source: Box<dyn DescriptorSource>) {
        self.descriptors = source;
    }

    /// Installs the hook that receives every fully packetized access unit.
    pub fn set_buffer_release<F>(&mut self, hook: F)
    where
        F: FnMut(AccessUnit) + Send + 'static,
    {
        self.release = Some(Box::new(hook));
    }

    /// The `stream_type` announced in the PMT.
    pub fn pmt_stream_type(&self) -> u8 {
        self.descriptors.stream_type_code(self)
    }

    pub fn es_descriptors(&self) -> Vec<Descriptor> {
        self.descriptors.es_descriptors(self)
    }

    fn release_unit(&mut self, unit: AccessUnit) {
        if let Some(hook) = self.release.as_mut() {
            hook(unit);
        }
    }

    /// Queues an access unit. Never fails.
    pub fn add_data(&mut self, mut unit: AccessUnit) {
        if unit.pts.is_none() && unit.dts.is_some() {
            unit.pts = unit.dts;
        }

        if self.bytes_avail == 0 {
            self.last_pts = unit.pts;
            self.last_dts = unit.dts;
        }

        if unit.is_empty() {
            self.release_unit(unit);
            return;
        }

        trace!(
            "pid 0x{:04x}: queued {} bytes pts={:?} dts={:?}",
            self.pid,
            unit.len(),
            unit.pts,
            unit.dts
        );
        self.bytes_avail += unit.len();
        self.queue.push_back(QueuedUnit { unit, consumed: 0 });
    }

    /// Bytes queued and not yet handed out.
    pub fn bytes_in_buffer(&self) -> usize {
        self.bytes_avail
    }

    fn payload_window(&self) -> usize {
        if self.cur_pes_payload_size != 0 {
            (self.cur_pes_payload_size - self.pes_bytes_written).min(self.bytes_avail)
        } else {
            self.bytes_avail
        }
    }

    /// Bytes [`get_data`](Self::get_data) can deliver right now, PES header included.
    pub fn bytes_avail(&self) -> usize {
        let mut avail = self.payload_window();
        if self.state == PesState::Header {
            avail += self.pes_header_length();
        }
        avail
    }

    pub fn at_pes_start(&self) -> bool {
        self.state == PesState::Header
    }

    fn pes_header(&self) -> PesHeader {
        let mut header = PesHeader::new(self.stream_id)
            .with_full_header(self.pi.flags.contains(PacketFlags::PES_FULL_HEADER))
            .with_data_alignment(self.pi.flags.contains(PacketFlags::PES_DATA_ALIGNMENT))
            .with_payload_len(self.cur_pes_payload_size);

        if self.pi.flags.contains(PacketFlags::PES_WRITE_PTS_DTS) {
            if let (Some(pts), Some(dts)) = (self.header_pts, self.header_dts) {
                header = header.with_pts(pts).with_dts(dts);
            }
        } else if self.pi.flags.contains(PacketFlags::PES_WRITE_PTS) {
            if let Some(pts) = self.header_pts {
                header = header.with_pts(pts);
            }
        }
        if self.pi.flags.contains(PacketFlags::PES_EXT_STREAMID) {
            if let Some(ext) = self.stream_id_ext {
                header = header.with_stream_id_extension(ext);
            }
        }
        if let Some(length) = self.pes_header_data_length {
            header = header.with_header_data_length(length);
        }
        header
    }

    /// Length of the PES header the next packet starts with.
    pub fn pes_header_length(&self) -> usize {
        self.pes_header().len()
    }

    /// Timestamps of the queued unit the first `bound` bytes end in, or of the
    /// first timestamped unit before that point.
    fn find_pts_dts_within(&self, bound: usize) -> (Option<u64>, Option<u64>) {
        let mut bound = bound;
        for queued in &self.queue {
            let size = queued.remaining();
            if bound <= size || queued.unit.pts.is_some() {
                return (queued.unit.pts, queued.unit.dts);
            }
            bound -= size;
        }
        (None, None)
    }

    /// Prepares the header of the next PES packet. Does nothing mid-packet.
    pub fn initialize_pes_packet(&mut self) {
        if self.state != PesState::Header {
            return;
        }

        let bound;
        if self.pes_payload_size != 0 {
            self.cur_pes_payload_size = self.pes_payload_size;
            bound = self.pes_payload_size;
        } else if self.is_video() {
            self.cur_pes_payload_size = 0;
            bound = self.bytes_avail;
        } else {
            self.cur_pes_payload_size = self.bytes_avail;
            bound = self.bytes_avail;
        }
        self.pes_bytes_written = 0;

        let (pts, dts) = self.find_pts_dts_within(bound);
        self.header_pts = pts.map(|ts| ts.saturating_add(CLOCK_BASE));
        self.header_dts = dts.map(|ts| ts.saturating_add(CLOCK_BASE));

        self.pi.flags -= PacketFlags::PES_WRITE_PTS | PacketFlags::PES_WRITE_PTS_DTS;
        match (self.header_pts, self.header_dts) {
            (Some(pts), Some(dts)) if pts != dts => self.pi.flags |= PacketFlags::PES_WRITE_PTS_DTS,
            (Some(_), _) => self.pi.flags |= PacketFlags::PES_WRITE_PTS,
            _ => {}
        }

        if self.queue.front().map_or(false, |q| q.unit.random_access) {
            self.pi.flags |= PacketFlags::ADAPTATION | PacketFlags::RANDOM_ACCESS;
        }

        if self.cur_pes_payload_size != 0 {
            let max_payload = u16::MAX as usize + PES_BASE_HEADER_SIZE - self.pes_header_length();
            if self.cur_pes_payload_size > max_payload {
                if self.is_video() && self.pes_payload_size == 0 {
                    self.cur_pes_payload_size = 0;
                } else {
                    warn!(
                        "pid 0x{:04x}: clamping PES payload {} to {}",
                        self.pid, self.cur_pes_payload_size, max_payload
                    );
                    self.cur_pes_payload_size = max_payload;
                }
            }
        }

        trace!(
            "pid 0x{:04x}: new PES payload={} pts={:?} dts={:?}",
            self.pid,
            self.cur_pes_payload_size,
            self.header_pts,
            self.header_dts
        );
    }

    /// Fills `buf` with the next bytes of the stream: the PES header first when
    /// a new packet starts, then queued payload.
    ///
    /// Fails without consuming anything when `buf` cannot hold the header or
    /// asks for more than is currently available.
    pub fn get_data(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut offset = 0;
        if self.state == PesState::Header {
            let header = self.pes_header();
            let header_len = header.len();
            if buf.len() < header_len {
                return Err(MuxError::BufferTooSmall {
                    needed: header_len,
                    available: buf.len(),
                });
            }
            if buf.len() - header_len > self.payload_window() {
                return Err(MuxError::NotEnoughData {
                    requested: buf.len() - header_len,
                    available: self.payload_window(),
                });
            }
            header.packet_length_field()?;

            let mut cursor = &mut buf[..header_len];
            header.write_to(&mut cursor)?;
            offset = header_len;
            self.state = PesState::Packet;
        } else if buf.len() > self.payload_window() {
            return Err(MuxError::NotEnoughData {
                requested: buf.len(),
                available: self.payload_window(),
            });
        }

        let len = buf.len() - offset;
        self.pes_bytes_written += len;
        if self.cur_pes_payload_size != 0 && self.pes_bytes_written == self.cur_pes_payload_size {
            self.state = PesState::Header;
            self.pes_bytes_written = 0;
        }

        while offset < buf.len() {
            let Some(head) = self.queue.front_mut() else {
                break;
            };
            let take = head.remaining().min(buf.len() - offset);
            buf[offset..offset + take]
                .copy_from_slice(&head.unit.data[head.consumed..head.consumed + take]);
            offset += take;
            self.consume(take);
        }

        Ok(())
    }

    fn consume(&mut self, len: usize) {
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        head.consumed += len;
        self.bytes_avail -= len;

        if head.unit.pts.is_some() {
            self.last_pts = head.unit.pts;
            self.last_dts = head.unit.dts;
        } else if head.unit.dts.is_some() {
            self.last_dts = head.unit.dts;
        }

        if head.remaining() == 0 {
            if let Some(done) = self.queue.pop_front() {
                self.release_unit(done.unit);
            }
            if self.queue.is_empty() && self.cur_pes_payload_size == 0 {
                self.state = PesState::Header;
                self.pes_bytes_written = 0;
            }
        }
    }
}

impl Drop for ElementaryStream {
    fn drop(&mut self) {
        while let Some(queued) = self.queue.pop_front() {
            self.release_unit(queued.unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::pes::read_timestamp;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use quickcheck_macros::quickcheck;
    use std::sync::{Arc, Mutex};

    fn unit(len: usize, fill: u8) -> AccessUnit {
        AccessUnit::new(vec![fill; len])
    }

    /// Pulls everything out of `stream` in chunks of at most `chunk` bytes,
    /// returning (payload bytes, header offsets).
    fn drain(stream: &mut ElementaryStream, chunk: usize) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut payload = Vec::new();
        let mut headers = Vec::new();
        while stream.bytes_in_buffer() > 0 {
            let at_start = stream.at_pes_start();
            if at_start {
                stream.initialize_pes_packet();
            }
            let header_len = if at_start { stream.pes_header_length() } else { 0 };
            let n = stream.bytes_avail().min(chunk).max(header_len);
            let mut buf = vec![0u8; n];
            stream.get_data(&mut buf).unwrap();
            if at_start {
                headers.push(buf[..header_len].to_vec());
            }
            payload.extend_from_slice(&buf[header_len..]);
        }
        (payload, headers)
    }

    #[test]
    fn test_stream_ids() {
        let video = ElementaryStream::new(0x100, StreamType::H264);
        assert_eq!(video.stream_id(), STREAM_ID_VIDEO);
        let dts = ElementaryStream::new(0x101, StreamType::Dts);
        assert_eq!(dts.stream_id(), STREAM_ID_EXTENDED);
        assert_eq!(dts.stream_id_extension(), Some(STREAM_ID_EXT_DTS));
        let teletext = ElementaryStream::new(0x102, StreamType::Teletext);
        assert_eq!(teletext.stream_id(), STREAM_ID_PRIVATE_1);
        assert_eq!(teletext.pes_header_length(), 45);
        assert_eq!(teletext.pmt_stream_type(), STREAM_TYPE_PRIVATE_DATA);
    }

    #[test]
    fn test_add_data_records_timestamps_on_empty_queue() {
        let mut stream = ElementaryStream::new(0x100, StreamType::AacAdts);
        stream.add_data(unit(10, 0).with_pts(900));
        stream.add_data(unit(10, 0).with_pts(1800));
        assert_eq!(stream.last_pts(), Some(900));
        assert_eq!(stream.bytes_in_buffer(), 20);

        let mut dts_only = ElementaryStream::new(0x101, StreamType::AacAdts);
        dts_only.add_data(unit(10, 0).with_dts(450));
        assert_eq!(dts_only.last_pts(), Some(450));
    }

    #[test]
    fn test_bounded_audio_pes() {
        let mut stream = ElementaryStream::new(0x101, StreamType::AacAdts);
        stream.add_data(unit(300, 1).with_pts(0));
        stream.add_data(unit(200, 2).with_pts(1920));
        stream.initialize_pes_packet();
        assert_eq!(stream.pes_header_length(), 14);
        assert_eq!(stream.bytes_avail(), 514);

        let mut first = vec![0u8; 184];
        stream.get_data(&mut first).unwrap();
        assert_eq!(u16::from_be_bytes([first[4], first[5]]) as usize, 14 + 500 - 6);
        assert_eq!(read_timestamp(&first[9..14]).unwrap(), CLOCK_BASE);

        // data added mid-packet does not extend the PES
        stream.add_data(unit(50, 3).with_pts(3840));
        assert_eq!(stream.bytes_avail(), 500 - 170);
        let mut rest = vec![0u8; 330];
        stream.get_data(&mut rest).unwrap();
        assert!(stream.at_pes_start());
        assert_eq!(rest[129], 1);
        assert_eq!(rest[130], 2);
        assert_eq!(stream.last_pts(), Some(1920));
        assert_eq!(stream.bytes_in_buffer(), 50);
    }

    #[test]
    fn test_fixed_payload_size() {
        let mut stream = ElementaryStream::new(0x101, StreamType::Mpeg2Audio);
        stream.set_pes_payload_size(100);
        stream.add_data(unit(250, 7).with_pts(0));
        let (payload, headers) = drain(&mut stream, 184);
        assert_eq!(payload.len(), 250);
        // 100 + 100 + 50 (the last one is still open)
        assert_eq!(headers.len(), 3);
        for header in &headers {
            assert_eq!(u16::from_be_bytes([header[4], header[5]]) as usize, header.len() + 100 - 6);
        }
        assert!(!stream.at_pes_start());
    }

    #[test]
    fn test_unbounded_video_ends_when_queue_drains() {
        let mut stream = ElementaryStream::new(0x100, StreamType::H264);
        stream.add_data(unit(1000, 0).with_pts(0).with_random_access(true));
        stream.initialize_pes_packet();
        assert!(stream.pi.flags.contains(PacketFlags::RANDOM_ACCESS));
        let header_len = stream.pes_header_length();
        let mut buf = vec![0u8; 1000 + header_len];
        stream.get_data(&mut buf).unwrap();
        assert_eq!(&buf[4..6], &[0, 0]);
        assert!(stream.at_pes_start());
    }

    #[test]
    fn test_pts_and_dts_flags() {
        let mut stream = ElementaryStream::new(0x100, StreamType::H264);
        stream.add_data(unit(10, 0).with_pts(3600).with_dts(0));
        stream.initialize_pes_packet();
        assert!(stream.pi.flags.contains(PacketFlags::PES_WRITE_PTS_DTS));
        assert_eq!(stream.pes_header_length(), 19);

        let mut same = ElementaryStream::new(0x101, StreamType::H264);
        same.add_data(unit(10, 0).with_pts(3600).with_dts(3600));
        same.initialize_pes_packet();
        assert!(same.pi.flags.contains(PacketFlags::PES_WRITE_PTS));
        assert!(!same.pi.flags.contains(PacketFlags::PES_WRITE_PTS_DTS));
    }

    #[test]
    fn test_pts_window_heuristic() {
        let mut stream = ElementaryStream::new(0x101, StreamType::Mpeg1Audio);
        stream.set_pes_payload_size(150);
        stream.add_data(unit(100, 0));
        stream.add_data(unit(100, 0).with_pts(900));
        stream.initialize_pes_packet();
        // the window ends inside the second unit, which carries the PTS
        assert!(stream.pi.flags.contains(PacketFlags::PES_WRITE_PTS));

        let mut untimed = ElementaryStream::new(0x102, StreamType::Mpeg1Audio);
        untimed.set_pes_payload_size(50);
        untimed.add_data(unit(100, 0));
        untimed.add_data(unit(100, 0).with_pts(900));
        untimed.initialize_pes_packet();
        assert!(!untimed.pi.flags.contains(PacketFlags::PES_WRITE_PTS));
        assert_eq!(untimed.pes_header_length(), 9);
    }

    #[test]
    fn test_get_data_errors() {
        let mut stream = ElementaryStream::new(0x101, StreamType::AacAdts);
        stream.add_data(unit(20, 0).with_pts(0));
        stream.initialize_pes_packet();
        let mut tiny = vec![0u8; 5];
        assert!(matches!(
            stream.get_data(&mut tiny),
            Err(MuxError::BufferTooSmall { .. })
        ));
        let mut huge = vec![0u8; 100];
        assert!(matches!(
            stream.get_data(&mut huge),
            Err(MuxError::NotEnoughData { .. })
        ));
        // nothing was consumed
        assert!(stream.at_pes_start());
        assert_eq!(stream.bytes_in_buffer(), 20);
    }

    #[test]
    fn test_release_hook_sees_each_unit_once() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = released.clone();
        let mut stream = ElementaryStream::new(0x100, StreamType::H264);
        stream.set_buffer_release(move |unit| sink.lock().unwrap().push(unit.data));

        stream.add_data(AccessUnit::new(Bytes::from_static(b"abc")).with_pts(0));
        stream.add_data(AccessUnit::new(Bytes::new()));
        stream.add_data(AccessUnit::new(Bytes::from_static(b"defgh")).with_pts(3000));
        drain(&mut stream, 184);
        stream.add_data(AccessUnit::new(Bytes::from_static(b"queued")));
        drop(stream);

        let released = released.lock().unwrap();
        assert_eq!(
            *released,
            vec![
                Bytes::new(),
                Bytes::from_static(b"abc"),
                Bytes::from_static(b"defgh"),
                Bytes::from_static(b"queued"),
            ]
        );
    }

    #[test]
    fn test_descriptors() {
        let mut audio = ElementaryStream::new(0x101, StreamType::AacAdts);
        audio.set_language("ENG").unwrap();
        assert_eq!(audio.language(), Some("eng"));
        assert_eq!(audio.es_descriptors(), vec![Descriptor::iso_639_language(b"eng")]);
        assert!(audio.set_language("english").is_err());

        let hevc = ElementaryStream::new(0x100, StreamType::H265);
        assert_eq!(hevc.es_descriptors(), vec![Descriptor::registration(b"HEVC")]);

        let subs = DefaultStreamFactory
            .new_stream(0x102, StreamType::DvbSubtitle, Some("fra"))
            .unwrap();
        let descriptors = subs.es_descriptors();
        assert_eq!(descriptors[0].tag, DESCRIPTOR_TAG_SUBTITLING);
        assert_eq!(&descriptors[0].data[..3], b"fra");
    }

    #[test]
    fn test_jpeg2000_descriptor() {
        let mut stream = ElementaryStream::new(0x100, StreamType::Jpeg2000);
        let default = stream.es_descriptors();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].tag, DESCRIPTOR_TAG_J2K_VIDEO);
        assert_eq!(default[0].data.len(), 24);
        assert_eq!(default[0].data[22], 1);

        stream.set_jpeg2000_params(Jpeg2000Params {
            profile_and_level: 0x0104,
            horizontal_size: 1920,
            vertical_size: 1080,
            max_bitrate: 150_000_000,
            frame_rate_num: 30000,
            frame_rate_den: 1001,
            color_spec: 3,
            interlaced: true,
        });
        let desc = &stream.es_descriptors()[0];
        assert_eq!(
            desc.data,
            vec![
                0x01, 0x04, // profile_and_level
                0x00, 0x00, 0x07, 0x80, // horizontal_size
                0x00, 0x00, 0x04, 0x38, // vertical_size
                0x08, 0xf0, 0xd1, 0x80, // max_bit_rate
                0x00, 0x26, 0x25, 0xa0, // max_buffer_size, level 4
                0x03, 0xe9, // DEN_frame_rate
                0x75, 0x30, // NUM_frame_rate
                0x03, // color_specification
                0x7f,
            ]
        );
    }

    #[test]
    fn test_atsc_factory() {
        let mut factory = AtscStreamFactory;
        let mut ac3 = factory.new_stream(0x101, StreamType::Ac3, None).unwrap();
        ac3.set_audio_channels(2);
        assert_eq!(ac3.pmt_stream_type(), STREAM_TYPE_ATSC_AC3);
        let descriptors = ac3.es_descriptors();
        assert_eq!(descriptors[1].tag, DESCRIPTOR_TAG_ATSC_AC3);
        assert_eq!(descriptors[1].data[2], (0b0010 << 1) | 1);

        let eac3 = factory.new_stream(0x102, StreamType::Eac3, Some("spa")).unwrap();
        assert_eq!(eac3.pmt_stream_type(), STREAM_TYPE_ATSC_EAC3);
        assert_eq!(eac3.es_descriptors().len(), 2);

        let aac = factory.new_stream(0x103, StreamType::AacAdts, None).unwrap();
        assert_eq!(aac.pmt_stream_type(), 0x0f);
    }

    struct Custom;

    impl DescriptorSource for Custom {
        fn stream_type_code(&self, _stream: &ElementaryStream) -> u8 {
            0x15
        }

        fn es_descriptors(&self, _stream: &ElementaryStream) -> Vec<Descriptor> {
            vec![Descriptor::new(0x26, vec![0xff, 0xff])]
        }
    }

    #[test]
    fn test_custom_descriptor_source() {
        let mut stream = ElementaryStream::new(0x100, StreamType::Klv);
        stream.set_descriptor_source(Box::new(Custom));
        assert_eq!(stream.pmt_stream_type(), 0x15);
        assert_eq!(stream.es_descriptors()[0].tag, 0x26);
    }

    #[quickcheck]
    fn prop_payload_roundtrip(units: Vec<Vec<u8>>, chunk: u8, video: bool) -> bool {
        let stream_type = if video {
            StreamType::H264
        } else {
            StreamType::Mpeg2Audio
        };
        let mut stream = ElementaryStream::new(0x100, stream_type);
        let mut expected = Vec::new();
        for (i, data) in units.into_iter().enumerate() {
            expected.extend_from_slice(&data);
            stream.add_data(AccessUnit::new(data).with_pts(i as u64 * 3000));
        }
        let chunk = usize::from(chunk).max(1) + 19;
        let (payload, _) = drain(&mut stream, chunk);
        payload == expected
    }

    #[quickcheck]
    fn prop_bounded_pes_emits_exactly_target(size: u16, chunk: u8) -> bool {
        let size = usize::from(size % 4000) + 1;
        let mut stream = ElementaryStream::new(0x101, StreamType::AacAdts);
        stream.add_data(AccessUnit::new(vec![0u8; size]).with_pts(0));
        stream.initialize_pes_packet();
        let header_len = stream.pes_header_length();
        let chunk = usize::from(chunk).max(1) + header_len;

        let mut emitted = 0;
        let mut first = true;
        while !stream.at_pes_start() || first {
            let n = stream.bytes_avail().min(chunk);
            let mut buf = vec![0u8; n];
            if stream.get_data(&mut buf).is_err() {
                return false;
            }
            emitted += if first { n - header_len } else { n };
            first = false;
        }
        emitted == size && stream.bytes_in_buffer() == 0
    }
}

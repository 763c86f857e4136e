use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::packet::*;
use super::program::Program;
use super::psi::{self, Descriptor, PatEntry, PmtStreamEntry};
use super::section::Section;
use super::sink::PacketSink;
use super::stream::{DefaultStreamFactory, ElementaryStream, StreamFactory};
use super::types::*;
use crate::av::AccessUnit;
use crate::config::MuxerConfig;
use crate::error::{MuxError, Result};

/// A muxer shared between threads.
pub type SharedMuxer<S> = Arc<Mutex<Muxer<S>>>;

fn is_due(deadline: Option<u64>, now: u64) -> bool {
    deadline.map_or(true, |deadline| now >= deadline)
}

/// Moves a deadline one interval forward, or re-anchors it on `now` when the
/// chained value would already be in the past.
fn reschedule(deadline: &mut Option<u64>, now: u64, interval: u64) {
    *deadline = Some(match deadline.map(|previous| previous.saturating_add(interval)) {
        Some(chained) if chained > now => chained,
        _ => now.saturating_add(interval),
    });
}

/// Converts a 90 kHz interval to 27 MHz ticks.
fn pcr_ticks(interval: u64) -> u64 {
    interval.saturating_mul(PCR_HZ / PTS_HZ)
}

fn next_version(current: u8, has_section: bool) -> u8 {
    if has_section {
        (current + 1) & 0x1f
    } else {
        current
    }
}

/// The transport stream multiplexer.
///
/// Owns every program and elementary stream of one output and decides, packet
/// by packet, what goes out next: tables when they are due, clock references,
/// padding in constant-bitrate mode, then stream data.
///
/// ```
/// use tsmux::{AccessUnit, Muxer, MuxerConfig, StreamType, VecSink};
///
/// # fn main() -> tsmux::Result<()> {
/// let mut muxer = Muxer::new(MuxerConfig::default(), VecSink::new());
/// let program = muxer.create_program(None)?;
/// let pid = muxer.create_stream(StreamType::H264, Some(0x100))?;
/// muxer.program_add_stream(program, pid)?;
///
/// muxer.add_data(pid, AccessUnit::new(vec![0u8; 1000]).with_pts(0))?;
/// while muxer.stream(pid).map_or(0, |s| s.bytes_in_buffer()) > 0 {
///     muxer.write_stream_packet(pid)?;
/// }
/// assert!(muxer.sink().len() >= 7);
/// # Ok(())
/// # }
/// ```
pub struct Muxer<S: PacketSink> {
    config: MuxerConfig,
    sink: S,
    factory: Box<dyn StreamFactory>,

    streams: Vec<ElementaryStream>,
    programs: Vec<Program>,
    si_sections: BTreeMap<u8, Section>,
    transport_id: u16,

    pat_section: Option<Section>,
    pat_version: u8,
    pat_changed: bool,
    next_pat_pcr: Option<u64>,
    pat_interval: u64,

    si_version: u8,
    si_written: bool,
    si_changed: bool,
    next_si_pcr: Option<u64>,
    si_interval: u64,

    pcr_interval: u64,
    bitrate: u64,
    n_bytes: u64,
    first_pcr_ts: Option<u64>,
    last_ts: u64,

    counters: ContinuityCounters,
    next_program_number: u16,
    next_pmt_pid: u16,
    next_stream_pid: u16,
}

impl<S: PacketSink> fmt::Debug for Muxer<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Muxer")
            .field("programs", &self.programs)
            .field("streams", &self.streams)
            .field("pat_version", &self.pat_version)
            .field("bitrate", &self.bitrate)
            .field("n_bytes", &self.n_bytes)
            .finish_non_exhaustive()
    }
}

impl<S: PacketSink> Muxer<S> {
    pub fn new(config: MuxerConfig, sink: S) -> Self {
        Self::with_stream_factory(config, sink, Box::new(DefaultStreamFactory))
    }

    /// Creates a muxer whose streams come from `factory`.
    pub fn with_stream_factory(config: MuxerConfig, sink: S, factory: Box<dyn StreamFactory>) -> Self {
        debug!(
            "new muxer bitrate={} pat_interval={} pcr_interval={}",
            config.bitrate, config.pat_interval, config.pcr_interval
        );
        Self {
            transport_id: config.transport_stream_id,
            pat_interval: config.pat_interval,
            si_interval: config.si_interval,
            pcr_interval: config.pcr_interval,
            bitrate: config.bitrate,
            config,
            sink,
            factory,
            streams: Vec::new(),
            programs: Vec::new(),
            si_sections: BTreeMap::new(),
            pat_section: None,
            pat_version: 0,
            pat_changed: true,
            next_pat_pcr: None,
            si_version: 0,
            si_written: false,
            si_changed: false,
            next_si_pcr: None,
            n_bytes: 0,
            first_pcr_ts: None,
            last_ts: CLOCK_BASE,
            counters: ContinuityCounters::new(),
            next_program_number: START_PROGRAM_NUMBER,
            next_pmt_pid: START_PMT_PID,
            next_stream_pid: START_ES_PID,
        }
    }

    pub fn into_shared(self) -> SharedMuxer<S> {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &MuxerConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Total bytes handed to the sink.
    pub fn bytes_written(&self) -> u64 {
        self.n_bytes
    }

    pub fn programs(&self) -> &[Program] {
        &self.programs
    }

    pub fn program(&self, number: u16) -> Option<&Program> {
        self.programs.iter().find(|p| p.number() == number)
    }

    pub fn stream(&self, pid: u16) -> Option<&ElementaryStream> {
        self.streams.iter().find(|s| s.pid() == pid)
    }

    pub fn stream_mut(&mut self, pid: u16) -> Option<&mut ElementaryStream> {
        self.streams.iter_mut().find(|s| s.pid() == pid)
    }

    /// Version of the PAT currently being repeated.
    pub fn pat_version(&self) -> u8 {
        self.pat_version
    }

    pub fn si_version(&self) -> u8 {
        self.si_version
    }

    pub fn pat_interval(&self) -> u64 {
        self.pat_interval
    }

    pub fn set_pat_interval(&mut self, interval: u64) {
        self.pat_interval = interval;
    }

    pub fn si_interval(&self) -> u64 {
        self.si_interval
    }

    pub fn set_si_interval(&mut self, interval: u64) {
        self.si_interval = interval;
    }

    pub fn pcr_interval(&self) -> u64 {
        self.pcr_interval
    }

    pub fn set_pcr_interval(&mut self, interval: u64) {
        self.pcr_interval = interval;
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    /// Sets the constant output bitrate in bit/s; 0 disables padding.
    pub fn set_bitrate(&mut self, bitrate: u64) {
        self.bitrate = bitrate;
    }

    pub fn set_pmt_interval(&mut self, program: u16, interval: u64) -> Result<()> {
        let pidx = self.program_index(program)?;
        self.programs[pidx].set_pmt_interval(interval);
        Ok(())
    }

    /// Enables SCTE-35 on a program, or disables it with `None`.
    pub fn set_scte35_pid(&mut self, program: u16, pid: Option<u16>) -> Result<()> {
        let pidx = self.program_index(program)?;
        if let Some(pid) = pid {
            if self.programs[pidx].scte35_pid() != Some(pid) && self.pid_in_use(pid) {
                return Err(MuxError::PidInUse(pid));
            }
        }
        self.programs[pidx].set_scte35_pid(pid)
    }

    pub fn set_scte35_interval(&mut self, program: u16, interval: u64) -> Result<()> {
        let pidx = self.program_index(program)?;
        self.programs[pidx].set_scte35_null_interval(interval);
        Ok(())
    }

    fn stream_index(&self, pid: u16) -> Result<usize> {
        self.streams
            .iter()
            .position(|s| s.pid() == pid)
            .ok_or(MuxError::UnknownStream(pid))
    }

    fn program_index(&self, number: u16) -> Result<usize> {
        self.programs
            .iter()
            .position(|p| p.number() == number)
            .ok_or(MuxError::UnknownProgram(number))
    }

    fn program_of(&self, pid: u16) -> Option<usize> {
        self.programs.iter().position(|p| p.contains(pid))
    }

    fn pid_in_use(&self, pid: u16) -> bool {
        pid == PID_PAT
            || pid == PID_NULL
            || self.streams.iter().any(|s| s.pid() == pid)
            || self
                .programs
                .iter()
                .any(|p| p.pmt_pid() == pid || p.scte35_pid() == Some(pid))
            || self.si_sections.values().any(|s| s.pid() == pid)
    }

    fn allocate_pmt_pid(&mut self) -> Result<u16> {
        let mut pid = self.next_pmt_pid;
        while self.pid_in_use(pid) {
            pid += 1;
            if pid >= PID_NULL {
                return Err(MuxError::PidsExhausted);
            }
        }
        self.next_pmt_pid = pid + 1;
        Ok(pid)
    }

    /// Creates a program. `None` (or 0) picks the next free program number; a
    /// requested number that is taken is bumped to the next free one.
    pub fn create_program(&mut self, number: Option<u16>) -> Result<u16> {
        if self.programs.len() >= MAX_PROGRAMS {
            return Err(MuxError::TooManyPrograms(MAX_PROGRAMS));
        }

        let requested = number.filter(|&n| n != 0);
        let mut number = requested.unwrap_or(self.next_program_number);
        while number == 0 || self.programs.iter().any(|p| p.number() == number) {
            number = number.wrapping_add(1);
        }
        match requested {
            Some(requested) if requested != number => {
                warn!("program number {} taken, using {}", requested, number)
            }
            None => self.next_program_number = number.wrapping_add(1),
            _ => {}
        }

        let overrides = self.config.programs.get(&number).cloned().unwrap_or_default();
        let pmt_pid = match overrides.pmt_pid {
            Some(pid) if self.pid_in_use(pid) => return Err(MuxError::PidInUse(pid)),
            Some(pid) => pid,
            None => self.allocate_pmt_pid()?,
        };
        let mut program = Program::new(
            number,
            pmt_pid,
            overrides.pmt_interval.unwrap_or(self.config.pmt_interval),
            self.config.scte35_null_interval,
        );

        let scte35_pid = self.config.scte35_pid;
        if scte35_pid != 0 {
            if self.pid_in_use(scte35_pid) || scte35_pid == pmt_pid {
                warn!(
                    "program {}: SCTE-35 PID 0x{:04x} already in use, leaving SCTE-35 off",
                    number, scte35_pid
                );
            } else {
                program.set_scte35_pid(Some(scte35_pid))?;
            }
        }

        debug!("created program {} with PMT on 0x{:04x}", number, pmt_pid);
        self.programs.push(program);
        self.pat_changed = true;
        Ok(number)
    }

    /// Hands out the next unused elementary stream PID, starting above 0x40.
    pub fn get_new_pid(&mut self) -> Result<u16> {
        loop {
            self.next_stream_pid += 1;
            if self.next_stream_pid >= PID_NULL {
                return Err(MuxError::PidsExhausted);
            }
            if !self.pid_in_use(self.next_stream_pid) {
                return Ok(self.next_stream_pid);
            }
        }
    }

    /// Creates an elementary stream, on `pid` or on an allocated PID.
    pub fn create_stream(&mut self, stream_type: StreamType, pid: Option<u16>) -> Result<u16> {
        let pid = match pid {
            Some(pid) if !(START_ES_PID..PID_NULL).contains(&pid) => {
                return Err(MuxError::InvalidPid(pid))
            }
            Some(pid) if self.pid_in_use(pid) => return Err(MuxError::PidInUse(pid)),
            Some(pid) => pid,
            None => self.get_new_pid()?,
        };

        let options = self.config.streams.get(&pid).cloned().unwrap_or_default();
        let mut stream = self
            .factory
            .new_stream(pid, stream_type, options.language.as_deref())?;
        if options.pmt_index.is_some() {
            stream.set_pmt_index(options.pmt_index);
        }
        self.streams.push(stream);
        Ok(pid)
    }

    /// Maps a stream into a program. The first stream of a program becomes its
    /// PCR stream unless the program config names another PID.
    pub fn program_add_stream(&mut self, program: u16, pid: u16) -> Result<()> {
        let sidx = self.stream_index(pid)?;
        if let Some(owner) = self.program_of(pid) {
            return Err(MuxError::StreamAlreadyMapped {
                pid,
                program: self.programs[owner].number(),
            });
        }
        let pidx = self.program_index(program)?;
        let pmt_index = self.streams[sidx].pmt_index();
        self.programs[pidx].add_stream(pid, pmt_index);

        let pcr_override = self.config.programs.get(&program).and_then(|p| p.pcr_pid);
        let take_pcr = match pcr_override {
            Some(pcr_pid) => pcr_pid == pid,
            None => self.programs[pidx].pcr_pid().is_none(),
        };
        if take_pcr {
            self.set_pcr_stream(program, Some(pid))?;
        }
        Ok(())
    }

    /// Makes `pid` the clock reference of `program`, or clears it with `None`.
    pub fn set_pcr_stream(&mut self, program: u16, pid: Option<u16>) -> Result<()> {
        let pidx = self.program_index(program)?;
        let new_idx = match pid {
            Some(pid) => Some(self.stream_index(pid)?),
            None => None,
        };
        let old = self.programs[pidx].pcr_pid();
        if old == pid {
            return Ok(());
        }

        if let Some(old_idx) = old.and_then(|old| self.stream_index(old).ok()) {
            self.streams[old_idx].pcr_unref();
        }
        if let Some(new_idx) = new_idx {
            self.streams[new_idx].pcr_ref();
        }

        let program = &mut self.programs[pidx];
        program.pcr_pid = pid;
        program.pmt_changed = true;
        debug!("program {}: PCR stream {:?} -> {:?}", program.number(), old, pid);
        Ok(())
    }

    /// Destroys a stream. Returns true when its program became empty and was
    /// removed as well.
    pub fn remove_stream(&mut self, pid: u16) -> Result<bool> {
        self.stream_index(pid)?;

        // a program may take its clock from a stream it does not carry
        let referencing: Vec<u16> = self
            .programs
            .iter()
            .filter(|p| p.pcr_pid() == Some(pid))
            .map(Program::number)
            .collect();
        for number in referencing {
            self.set_pcr_stream(number, None)?;
        }

        let mut program_removed = false;
        if let Some(pidx) = self.program_of(pid) {
            let number = self.programs[pidx].number();
            self.programs[pidx].remove_stream(pid);
            if self.programs[pidx].is_empty() {
                self.programs.remove(pidx);
                self.pat_changed = true;
                program_removed = true;
                debug!("removed empty program {}", number);
            }
        }

        let sidx = self.stream_index(pid)?;
        self.streams.remove(sidx);
        debug!("removed stream 0x{:04x}", pid);
        Ok(program_removed)
    }

    /// Queues an access unit on a stream.
    pub fn add_data(&mut self, pid: u16, unit: AccessUnit) -> Result<()> {
        self.stream_mut(pid)
            .ok_or(MuxError::UnknownStream(pid))?
            .add_data(unit);
        Ok(())
    }

    /// Adds or replaces a repeated SI section, keyed by its `table_id`.
    pub fn add_si_section(&mut self, pid: u16, data: Bytes) -> Result<()> {
        if pid == PID_PAT || pid >= PID_NULL {
            return Err(MuxError::InvalidPid(pid));
        }
        let reused = self.si_sections.values().any(|s| s.pid() == pid);
        if !reused && self.pid_in_use(pid) {
            return Err(MuxError::PidInUse(pid));
        }
        let section = Section::new(pid, data)?;
        debug!(
            "SI section table_id=0x{:02x} on 0x{:04x}",
            section.table_id(),
            pid
        );
        self.si_sections.insert(section.table_id(), section);
        self.si_changed = true;
        Ok(())
    }

    /// Packetizes `data` on `pid` immediately, outside the repetition schedule.
    pub fn send_section(&mut self, pid: u16, data: Bytes) -> Result<()> {
        let section = Section::new(pid, data)?;
        self.write_section(&section)
    }

    /// Sends an SCTE-35 section on the SCTE-35 PID of `program`.
    pub fn send_scte35(&mut self, program: u16, data: Bytes) -> Result<()> {
        let pidx = self.program_index(program)?;
        let pid = self.programs[pidx]
            .scte35_pid()
            .ok_or(MuxError::NoScte35Pid)?;
        self.send_section(pid, data)
    }

    pub fn resend_pat(&mut self) {
        self.pat_changed = true;
    }

    pub fn resend_si(&mut self) {
        self.si_changed = true;
    }

    pub fn resend_pmt(&mut self, program: u16) -> Result<()> {
        let pidx = self.program_index(program)?;
        self.programs[pidx].resend_pmt();
        Ok(())
    }

    /// Marks every table for an immediate rewrite, e.g. after a discontinuity.
    pub fn resend_all(&mut self) {
        self.resend_pat();
        self.resend_si();
        for program in &mut self.programs {
            program.resend_pmt();
        }
    }

    /// Drops every program, stream and schedule, optionally keeping the SI sections.
    pub fn reset(&mut self, keep_si: bool) {
        debug!("reset muxer keep_si={}", keep_si);
        self.streams.clear();
        self.programs.clear();
        if !keep_si {
            self.si_sections.clear();
            self.si_version = 0;
            self.si_written = false;
        }
        self.si_changed = !self.si_sections.is_empty();
        self.next_si_pcr = None;

        self.pat_section = None;
        self.pat_version = 0;
        self.pat_changed = true;
        self.next_pat_pcr = None;

        self.n_bytes = 0;
        self.first_pcr_ts = None;
        self.last_ts = CLOCK_BASE;
        self.counters.reset();
        self.next_program_number = START_PROGRAM_NUMBER;
        self.next_pmt_pid = START_PMT_PID;
        self.next_stream_pid = START_ES_PID;
    }

    fn pcr_at(&mut self, cur_ts: u64, extra_bytes: u64) -> u64 {
        if self.bitrate == 0 {
            return ts_to_pcr(cur_ts);
        }
        let first = *self.first_pcr_ts.get_or_insert(cur_ts);
        ts_to_pcr(first).saturating_add(uint64_scale(
            self.n_bytes + extra_bytes + PCR_BYTE_OFFSET,
            8 * PCR_HZ,
            self.bitrate,
        ))
    }

    /// PCR of the packet about to be written.
    fn current_pcr(&mut self, cur_ts: u64) -> u64 {
        self.pcr_at(cur_ts, 0)
    }

    /// PCR of the packet after that.
    fn next_pcr(&mut self, cur_ts: u64) -> u64 {
        self.pcr_at(cur_ts, TS_PACKET_SIZE as u64)
    }

    /// Whether stream `sidx` owes a PCR; advances its deadline when it does.
    fn pcr_due(&mut self, sidx: usize, cur_pcr: u64, next_pcr: u64) -> bool {
        let interval = pcr_ticks(self.pcr_interval);
        let stream = &mut self.streams[sidx];
        let deadline = stream.next_pcr;
        match deadline {
            Some(deadline) if next_pcr <= deadline => false,
            _ => {
                reschedule(&mut stream.next_pcr, cur_pcr, interval);
                true
            }
        }
    }

    fn allocate(&mut self) -> Result<BytesMut> {
        let mut packet = self
            .sink
            .allocate_packet()
            .ok_or(MuxError::AllocationFailed)?;
        packet.resize(TS_PACKET_SIZE, 0);
        Ok(packet)
    }

    fn emit(&mut self, packet: BytesMut, pcr: Option<u64>) -> Result<()> {
        self.n_bytes += packet.len() as u64;
        self.sink.write_packet(packet.freeze(), pcr)
    }

    /// Sends a packet, slipping in any PCR-only packets that fall due first.
    fn packet_out(&mut self, packet: BytesMut, pcr: Option<u64>) -> Result<()> {
        if self.bitrate == 0 || self.first_pcr_ts.is_none() {
            return self.emit(packet, pcr);
        }
        match pcr {
            None => {
                self.interpolate_pcrs(None)?;
                self.emit(packet, None)
            }
            // other programs get their PCR right behind this one
            Some(_) => {
                let pid = u16::from_be_bytes([packet[1], packet[2]]) & 0x1fff;
                self.emit(packet, pcr)?;
                self.interpolate_pcrs(Some(pid))
            }
        }
    }

    fn write_pcr_packet(&mut self, pid: u16, pcr: u64) -> Result<()> {
        let mut pi = PacketInfo::new(pid);
        pi.flags = PacketFlags::ADAPTATION | PacketFlags::WRITE_PCR;
        pi.pcr = pcr;

        let mut packet = self.allocate()?;
        let layout = write_ts_header(&mut packet, &pi, 0)?;
        self.counters.stamp(&mut packet, pid, &layout);
        trace!("PCR-only packet on 0x{:04x} pcr={}", pid, pcr);
        self.emit(packet, Some(pcr))
    }

    /// Writes PCR-only packets for every program whose PCR is due, except the
    /// one clocked from `skip`.
    fn interpolate_pcrs(&mut self, skip: Option<u16>) -> Result<()> {
        for pidx in 0..self.programs.len() {
            let program = &self.programs[pidx];
            if !program.wrote_si() {
                continue;
            }
            let Some(pcr_pid) = program.pcr_pid() else {
                continue;
            };
            if Some(pcr_pid) == skip {
                continue;
            }
            let Ok(sidx) = self.stream_index(pcr_pid) else {
                continue;
            };
            let cur = self.current_pcr(self.last_ts);
            let next = self.next_pcr(self.last_ts);
            if self.pcr_due(sidx, cur, next) {
                self.write_pcr_packet(pcr_pid, cur)?;
            }
        }
        Ok(())
    }

    /// Emits padding until the output catches up with `bitrate` at `cur_ts`.
    fn pad_stream(&mut self, sidx: usize, cur_ts: u64) -> Result<()> {
        if self.bitrate == 0 {
            return Ok(());
        }
        let Some(first_ts) = self.streams[sidx].first_ts else {
            return Ok(());
        };
        let elapsed = cur_ts.saturating_sub(first_ts);
        if elapsed == 0 {
            return Ok(());
        }

        let pid = self.streams[sidx].pid();
        let mut padding = 0u64;
        while uint64_scale((self.n_bytes + TS_PACKET_SIZE as u64) * 8, PTS_HZ, elapsed) <= self.bitrate {
            let cur = self.current_pcr(cur_ts);
            let next = self.next_pcr(cur_ts);
            if self.pcr_due(sidx, cur, next) {
                self.write_pcr_packet(pid, cur)?;
            } else {
                let mut packet = self.allocate()?;
                write_null_packet(&mut packet)?;
                self.packet_out(packet, None)?;
            }
            padding += 1;
        }
        if padding > 0 {
            trace!("padded {} packets before 0x{:04x}", padding, pid);
        }
        Ok(())
    }

    fn write_section(&mut self, section: &Section) -> Result<()> {
        let data = section.data().clone();
        let mut pi = section.packet_info().clone();
        // pointer_field
        let mut remaining = data.len() + 1;
        let mut offset = 0;
        let mut first = true;

        while remaining > 0 {
            pi.payload_unit_start = first;
            let mut packet = self.allocate()?;
            let layout = write_ts_header(&mut packet, &pi, remaining)?;
            self.counters.stamp(&mut packet, pi.pid, &layout);

            let mut pos = layout.payload_offset;
            let mut len = layout.payload_len;
            if first {
                packet[pos] = 0;
                pos += 1;
                len -= 1;
            }
            packet[pos..pos + len].copy_from_slice(&data[offset..offset + len]);
            offset += len;
            remaining -= layout.payload_len;
            first = false;

            self.packet_out(packet, None)?;
        }
        trace!(
            "section table_id=0x{:02x} on 0x{:04x}, {} bytes",
            section.table_id(),
            section.pid(),
            data.len()
        );
        Ok(())
    }

    fn write_pat(&mut self) -> Result<()> {
        if self.pat_changed || self.pat_section.is_none() {
            let entries: Vec<PatEntry> = self
                .programs
                .iter()
                .map(|p| PatEntry {
                    program_number: p.number(),
                    pmt_pid: p.pmt_pid(),
                })
                .collect();
            let version = next_version(self.pat_version, self.pat_section.is_some());
            let data = psi::build_pat(self.transport_id, version, &entries)?;
            self.pat_section = Some(Section::new(PID_PAT, data)?);
            self.pat_version = version;
            self.pat_changed = false;
            debug!("PAT version {} with {} programs", version, entries.len());
        }
        if let Some(section) = self.pat_section.clone() {
            self.write_section(&section)?;
        }
        Ok(())
    }

    fn write_si(&mut self) -> Result<()> {
        if self.si_changed {
            self.si_version = next_version(self.si_version, self.si_written);
            self.si_changed = false;
        }
        self.si_written = true;
        let sections: Vec<Section> = self.si_sections.values().cloned().collect();
        for section in &sections {
            self.write_section(section)?;
        }
        Ok(())
    }

    fn build_pmt(&self, pidx: usize, version: u8) -> Result<Section> {
        let program = &self.programs[pidx];
        let mut entries = Vec::new();
        for pid in program.stream_pids() {
            let stream = self.stream(pid).ok_or(MuxError::UnknownStream(pid))?;
            entries.push(PmtStreamEntry {
                stream_type: stream.pmt_stream_type(),
                pid,
                descriptors: stream.es_descriptors(),
            });
        }

        let mut program_descriptors = Vec::new();
        if let Some(scte35_pid) = program.scte35_pid() {
            program_descriptors.push(Descriptor::registration(b"CUEI"));
            entries.push(PmtStreamEntry {
                stream_type: STREAM_TYPE_SCTE35,
                pid: scte35_pid,
                descriptors: Vec::new(),
            });
        }

        let data = psi::build_pmt(
            program.number(),
            version,
            program.pcr_pid().unwrap_or(PID_NULL),
            &program_descriptors,
            &entries,
        )?;
        Section::new(program.pmt_pid(), data)
    }

    fn write_pmt(&mut self, pidx: usize) -> Result<()> {
        let program = &self.programs[pidx];
        if program.pmt_changed || program.pmt_section.is_none() {
            let version = next_version(program.pmt_version, program.pmt_section.is_some());
            let section = self.build_pmt(pidx, version)?;
            let program = &mut self.programs[pidx];
            program.pmt_section = Some(section);
            program.pmt_version = version;
            program.pmt_changed = false;
            debug!("program {}: PMT version {}", program.number(), version);
        }

        let program = &mut self.programs[pidx];
        program.wrote_si = true;
        if let Some(section) = program.pmt_section.clone() {
            self.write_section(&section)?;
        }
        Ok(())
    }

    /// Emits every table that is dirty or due, in PAT, SI, PMT, SCTE-35 order.
    fn rewrite_si(&mut self, cur_ts: u64) -> Result<()> {
        let mut next = self.next_pcr(cur_ts);

        if self.pat_changed || is_due(self.next_pat_pcr, next) {
            let interval = pcr_ticks(self.pat_interval);
            reschedule(&mut self.next_pat_pcr, next, interval);
            self.write_pat()?;
            next = self.next_pcr(cur_ts);
        }

        if !self.si_sections.is_empty() && (self.si_changed || is_due(self.next_si_pcr, next)) {
            let interval = pcr_ticks(self.si_interval);
            reschedule(&mut self.next_si_pcr, next, interval);
            self.write_si()?;
            next = self.next_pcr(cur_ts);
        }

        for pidx in 0..self.programs.len() {
            let program = &mut self.programs[pidx];
            if program.pmt_changed || is_due(program.next_pmt_pcr, next) {
                let interval = pcr_ticks(program.pmt_interval());
                reschedule(&mut program.next_pmt_pcr, next, interval);
                self.write_pmt(pidx)?;
                next = self.next_pcr(cur_ts);
            }
        }

        for pidx in 0..self.programs.len() {
            let program = &mut self.programs[pidx];
            let Some(section) = program.scte35_null_section.clone() else {
                continue;
            };
            if is_due(program.next_scte35_pcr, next) {
                let interval = pcr_ticks(program.scte35_null_interval());
                reschedule(&mut program.next_scte35_pcr, next, interval);
                self.write_section(&section)?;
                next = self.next_pcr(cur_ts);
            }
        }

        Ok(())
    }

    /// Writes exactly one data packet for `pid`, preceded by whatever tables,
    /// clock references or padding are due.
    pub fn write_stream_packet(&mut self, pid: u16) -> Result<()> {
        let sidx = self.stream_index(pid)?;
        if self.streams[sidx].bytes_in_buffer() == 0 {
            return Err(MuxError::NoData(pid));
        }
        let pidx = self.program_of(pid).ok_or(MuxError::StreamNotMapped(pid))?;

        if self.programs[pidx].pcr_pid().is_none() {
            let number = self.programs[pidx].number();
            let first = self.programs[pidx]
                .stream_pids()
                .first()
                .copied()
                .unwrap_or(pid);
            self.set_pcr_stream(number, Some(first))?;
        }

        let mut pcr = None;
        if self.streams[sidx].is_pcr() {
            let stream = &mut self.streams[sidx];
            let cur_ts = match stream.last_dts().or(stream.last_pts()) {
                Some(ts) => ts.saturating_add(CLOCK_BASE),
                None => self.last_ts,
            };
            if stream.first_ts.is_none() {
                stream.first_ts = Some(cur_ts);
            }
            self.last_ts = cur_ts;

            self.rewrite_si(cur_ts)?;
            self.pad_stream(sidx, cur_ts)?;

            let cur_pcr = self.current_pcr(cur_ts);
            let next_pcr = self.next_pcr(cur_ts);
            if self.pcr_due(sidx, cur_pcr, next_pcr) {
                let pi = &mut self.streams[sidx].pi;
                pi.flags |= PacketFlags::ADAPTATION | PacketFlags::WRITE_PCR;
                pi.pcr = cur_pcr;
                pcr = Some(cur_pcr);
                trace!("PCR {} on 0x{:04x}", cur_pcr, pid);
            }
        }

        let mut packet = self.allocate()?;
        let stream = &mut self.streams[sidx];
        stream.pi.payload_unit_start = stream.at_pes_start();
        if stream.pi.payload_unit_start {
            stream.initialize_pes_packet();
        }
        let avail = stream.bytes_avail();
        let layout = write_ts_header(&mut packet, &stream.pi, avail)?;
        self.counters.stamp(&mut packet, pid, &layout);
        let end = layout.payload_offset + layout.payload_len;
        stream.get_data(&mut packet[layout.payload_offset..end])?;

        let result = self.packet_out(packet, pcr);
        self.streams[sidx].pi.reset_dynamic_flags();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::sink::VecSink;
    use pretty_assertions::assert_eq;

    fn muxer() -> Muxer<VecSink> {
        Muxer::new(MuxerConfig::default(), VecSink::new())
    }

    #[test]
    fn test_reschedule() {
        let mut deadline = None;
        reschedule(&mut deadline, 100, 10);
        assert_eq!(deadline, Some(110));
        reschedule(&mut deadline, 112, 10);
        assert_eq!(deadline, Some(120));
        reschedule(&mut deadline, 1000, 10);
        assert_eq!(deadline, Some(1010));
        let mut late = Some(u64::MAX - 5);
        reschedule(&mut late, 0, 10);
        assert_eq!(late, Some(u64::MAX));
        assert_eq!(pcr_ticks(u64::MAX), u64::MAX);
        assert!(is_due(None, 0));
        assert!(is_due(Some(5), 5));
        assert!(!is_due(Some(6), 5));
    }

    #[test]
    fn test_program_numbers() {
        let mut mux = muxer();
        assert_eq!(mux.create_program(None).unwrap(), 1);
        assert_eq!(mux.create_program(Some(5)).unwrap(), 5);
        assert_eq!(mux.create_program(Some(5)).unwrap(), 6);
        assert_eq!(mux.create_program(None).unwrap(), 2);
        assert_eq!(mux.program(1).unwrap().pmt_pid(), 0x20);
        assert_eq!(mux.program(5).unwrap().pmt_pid(), 0x21);
    }

    #[test]
    fn test_program_limit() {
        let mut mux = muxer();
        for _ in 0..MAX_PROGRAMS {
            mux.create_program(None).unwrap();
        }
        assert!(matches!(
            mux.create_program(None),
            Err(MuxError::TooManyPrograms(253))
        ));
    }

    #[test]
    fn test_stream_pids() {
        let mut mux = muxer();
        assert_eq!(mux.create_stream(StreamType::H264, None).unwrap(), 0x41);
        assert_eq!(mux.create_stream(StreamType::AacAdts, Some(0x42)).unwrap(), 0x42);
        assert_eq!(mux.create_stream(StreamType::AacAdts, None).unwrap(), 0x43);
        assert!(matches!(
            mux.create_stream(StreamType::H264, Some(0x42)),
            Err(MuxError::PidInUse(0x42))
        ));
        assert!(matches!(
            mux.create_stream(StreamType::H264, Some(0x30)),
            Err(MuxError::InvalidPid(0x30))
        ));
        assert!(matches!(
            mux.create_stream(StreamType::H264, Some(PID_NULL)),
            Err(MuxError::InvalidPid(PID_NULL))
        ));
    }

    #[test]
    fn test_pcr_assignment() {
        let mut mux = muxer();
        let program = mux.create_program(None).unwrap();
        let video = mux.create_stream(StreamType::H264, None).unwrap();
        let audio = mux.create_stream(StreamType::AacAdts, None).unwrap();
        mux.program_add_stream(program, video).unwrap();
        mux.program_add_stream(program, audio).unwrap();
        assert_eq!(mux.program(program).unwrap().pcr_pid(), Some(video));
        assert!(mux.stream(video).unwrap().is_pcr());

        mux.set_pcr_stream(program, Some(audio)).unwrap();
        assert!(!mux.stream(video).unwrap().is_pcr());
        assert!(mux.stream(audio).unwrap().is_pcr());
        assert!(mux.set_pcr_stream(program, Some(0x99)).is_err());
        assert!(mux.stream(audio).unwrap().is_pcr());

        assert!(matches!(
            mux.program_add_stream(program, audio),
            Err(MuxError::StreamAlreadyMapped { .. })
        ));
    }

    #[test]
    fn test_pcr_override() {
        let config = MuxerConfig::default().with_program(
            1,
            crate::config::ProgramConfig {
                pcr_pid: Some(0x101),
                ..Default::default()
            },
        );
        let mut mux = Muxer::new(config, VecSink::new());
        mux.create_program(Some(1)).unwrap();
        mux.create_stream(StreamType::H264, Some(0x100)).unwrap();
        mux.create_stream(StreamType::AacAdts, Some(0x101)).unwrap();
        mux.program_add_stream(1, 0x100).unwrap();
        assert_eq!(mux.program(1).unwrap().pcr_pid(), None);
        mux.program_add_stream(1, 0x101).unwrap();
        assert_eq!(mux.program(1).unwrap().pcr_pid(), Some(0x101));
    }

    #[test]
    fn test_remove_streams() {
        let mut mux = muxer();
        let program = mux.create_program(None).unwrap();
        let video = mux.create_stream(StreamType::H264, None).unwrap();
        let audio = mux.create_stream(StreamType::AacAdts, None).unwrap();
        mux.program_add_stream(program, video).unwrap();
        mux.program_add_stream(program, audio).unwrap();

        assert!(!mux.remove_stream(video).unwrap());
        assert_eq!(mux.program(program).unwrap().pcr_pid(), None);

        // the next write re-resolves the PCR stream
        mux.add_data(audio, AccessUnit::new(vec![0u8; 10]).with_pts(0)).unwrap();
        mux.write_stream_packet(audio).unwrap();
        assert_eq!(mux.program(program).unwrap().pcr_pid(), Some(audio));

        assert!(mux.remove_stream(audio).unwrap());
        assert!(mux.program(program).is_none());
        assert!(matches!(mux.remove_stream(audio), Err(MuxError::UnknownStream(_))));
    }

    #[test]
    fn test_remove_pcr_stream_of_other_program() {
        let mut mux = muxer();
        let first = mux.create_program(None).unwrap();
        let second = mux.create_program(None).unwrap();
        let video = mux.create_stream(StreamType::H264, None).unwrap();
        let other = mux.create_stream(StreamType::H264, None).unwrap();
        mux.program_add_stream(first, video).unwrap();
        mux.program_add_stream(second, other).unwrap();
        mux.set_pcr_stream(first, Some(other)).unwrap();
        assert!(!mux.stream(video).unwrap().is_pcr());

        assert!(mux.remove_stream(other).unwrap());
        assert_eq!(mux.program(first).unwrap().pcr_pid(), None);
        assert!(mux.program(second).is_none());

        for frame in 0..5u64 {
            mux.add_data(video, AccessUnit::new(vec![0u8; 300]).with_pts(frame * 3600))
                .unwrap();
            while mux.stream(video).map_or(0, |s| s.bytes_in_buffer()) > 0 {
                mux.write_stream_packet(video).unwrap();
            }
        }
        assert_eq!(mux.program(first).unwrap().pcr_pid(), Some(video));

        let pids: Vec<u16> = mux
            .sink()
            .packets
            .iter()
            .map(|p| u16::from_be_bytes([p[1], p[2]]) & 0x1fff)
            .collect();
        assert!(pids.contains(&PID_PAT));
        assert!(pids.contains(&0x20));
        assert!(mux.sink().pcrs.iter().any(Option::is_some));
    }

    #[test]
    fn test_huge_intervals() {
        let config = MuxerConfig::default()
            .with_bitrate(1_000_000)
            .with_pat_interval(u64::MAX)
            .with_pmt_interval(u64::MAX)
            .with_pcr_interval(u64::MAX);
        let mut mux = Muxer::new(config, VecSink::new());
        let program = mux.create_program(None).unwrap();
        let pid = mux.create_stream(StreamType::H264, None).unwrap();
        mux.program_add_stream(program, pid).unwrap();

        for frame in 0..3u64 {
            mux.add_data(pid, AccessUnit::new(vec![0u8; 500]).with_pts(frame * 3600))
                .unwrap();
            while mux.stream(pid).map_or(0, |s| s.bytes_in_buffer()) > 0 {
                mux.write_stream_packet(pid).unwrap();
            }
        }

        let pats = mux
            .sink()
            .packets
            .iter()
            .filter(|p| u16::from_be_bytes([p[1], p[2]]) & 0x1fff == PID_PAT)
            .count();
        assert_eq!(pats, 1);
    }

    #[test]
    fn test_interpolated_pcr_follows_pcr_packet() {
        let mut mux = muxer();
        mux.set_bitrate(2_000_000);
        let mut pids = Vec::new();
        for _ in 0..2 {
            let program = mux.create_program(None).unwrap();
            let pid = mux.create_stream(StreamType::H264, None).unwrap();
            mux.program_add_stream(program, pid).unwrap();
            mux.add_data(pid, AccessUnit::new(vec![0u8; 10]).with_pts(0)).unwrap();
            mux.write_stream_packet(pid).unwrap();
            pids.push(pid);
        }

        let sidx = mux.stream_index(pids[1]).unwrap();
        mux.streams[sidx].next_pcr = None;
        let before = mux.sink().packets.len();

        let mut packet = mux.allocate().unwrap();
        packet[0] = SYNC_BYTE;
        packet[1..3].copy_from_slice(&pids[0].to_be_bytes());
        packet[3] = 0x20;
        mux.packet_out(packet, Some(1234)).unwrap();

        let out = &mux.sink().packets[before..];
        assert_eq!(out.len(), 2);
        assert_eq!(u16::from_be_bytes([out[0][1], out[0][2]]) & 0x1fff, pids[0]);
        assert_eq!(u16::from_be_bytes([out[1][1], out[1][2]]) & 0x1fff, pids[1]);
        assert_eq!(mux.sink().pcrs[before], Some(1234));
        assert!(mux.sink().pcrs[before + 1].is_some());
    }

    #[test]
    fn test_si_section_pids() {
        let mut mux = muxer();
        let program = mux.create_program(None).unwrap();
        let pid = mux.create_stream(StreamType::H264, None).unwrap();
        mux.program_add_stream(program, pid).unwrap();

        let sdt = Bytes::from_static(&[0x42, 0xf0, 0x00]);
        assert!(matches!(
            mux.add_si_section(pid, sdt.clone()),
            Err(MuxError::PidInUse(p)) if p == pid
        ));
        assert!(matches!(
            mux.add_si_section(0x20, sdt.clone()),
            Err(MuxError::PidInUse(0x20))
        ));
        assert!(matches!(
            mux.add_si_section(PID_PAT, sdt.clone()),
            Err(MuxError::InvalidPid(0))
        ));
        assert!(matches!(
            mux.add_si_section(0x2000, sdt.clone()),
            Err(MuxError::InvalidPid(0x2000))
        ));

        mux.add_si_section(0x11, sdt).unwrap();
        mux.add_si_section(0x11, Bytes::from_static(&[0x46, 0xf0, 0x00]))
            .unwrap();
        assert_eq!(mux.si_sections.len(), 2);
    }

    #[test]
    fn test_write_errors() {
        let mut mux = muxer();
        let pid = mux.create_stream(StreamType::H264, None).unwrap();
        assert!(matches!(mux.write_stream_packet(pid), Err(MuxError::NoData(_))));
        mux.add_data(pid, AccessUnit::new(vec![1u8; 10])).unwrap();
        assert!(matches!(
            mux.write_stream_packet(pid),
            Err(MuxError::StreamNotMapped(_))
        ));
        assert!(matches!(
            mux.add_data(0x999, AccessUnit::new(vec![1u8])),
            Err(MuxError::UnknownStream(0x999))
        ));
    }

    #[test]
    fn test_allocation_failure() {
        struct NoMemory;
        impl PacketSink for NoMemory {
            fn allocate_packet(&mut self) -> Option<BytesMut> {
                None
            }
            fn write_packet(&mut self, _packet: Bytes, _pcr: Option<u64>) -> Result<()> {
                Ok(())
            }
        }

        let mut mux = Muxer::new(MuxerConfig::default(), NoMemory);
        let program = mux.create_program(None).unwrap();
        let pid = mux.create_stream(StreamType::H264, None).unwrap();
        mux.program_add_stream(program, pid).unwrap();
        mux.add_data(pid, AccessUnit::new(vec![1u8; 10])).unwrap();
        assert!(matches!(
            mux.write_stream_packet(pid),
            Err(MuxError::AllocationFailed)
        ));
    }

    #[test]
    fn test_reset() {
        let mut mux = muxer();
        mux.add_si_section(0x11, Bytes::from_static(&[0x42, 0xf0, 0x00]))
            .unwrap();
        let program = mux.create_program(None).unwrap();
        let pid = mux.create_stream(StreamType::H264, None).unwrap();
        mux.program_add_stream(program, pid).unwrap();
        mux.add_data(pid, AccessUnit::new(vec![1u8; 10])).unwrap();
        mux.write_stream_packet(pid).unwrap();
        assert!(mux.bytes_written() > 0);

        mux.reset(true);
        assert!(mux.programs().is_empty());
        assert!(mux.stream(pid).is_none());
        assert_eq!(mux.bytes_written(), 0);
        assert_eq!(mux.si_sections.len(), 1);
        assert_eq!(mux.create_program(None).unwrap(), 1);

        mux.reset(false);
        assert!(mux.si_sections.is_empty());
    }

    #[test]
    fn test_shared() {
        let shared = muxer().into_shared();
        let handle = {
            let shared = shared.clone();
            std::thread::spawn(move || shared.lock().create_program(None).unwrap())
        };
        assert_eq!(handle.join().unwrap(), 1);
        assert_eq!(shared.lock().programs().len(), 1);
    }
}

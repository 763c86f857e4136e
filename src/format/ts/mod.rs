//! # MPEG Transport Stream (TS) muxing
//!
//! Turns timestamped access units from any number of elementary streams into
//! a sequence of 188-byte transport packets, including:
//!
//! - PES packetization with PTS/DTS and random-access signalling
//! - PAT and PMT generation with versioning and periodic repetition
//! - Caller-supplied SI sections and SCTE-35 splice sections
//! - PCR insertion, and null-packet padding for constant-bitrate output
//!
//! ## Example Usage
//!
//! ```rust
//! use tsmux::format::ts::{Muxer, StreamType, VecSink, TS_PACKET_SIZE};
//! use tsmux::{AccessUnit, MuxerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut muxer = Muxer::new(MuxerConfig::default().with_bitrate(2_000_000), VecSink::new());
//! let program = muxer.create_program(None)?;
//! let video = muxer.create_stream(StreamType::H264, None)?;
//! muxer.program_add_stream(program, video)?;
//!
//! for frame in 0..3u64 {
//!     muxer.add_data(video, AccessUnit::new(vec![0u8; 500]).with_pts(frame * 3600))?;
//!     while muxer.stream(video).map_or(0, |s| s.bytes_in_buffer()) > 0 {
//!         muxer.write_stream_packet(video)?;
//!     }
//! }
//!
//! let output = muxer.sink().to_bytes();
//! assert_eq!(output.len() % TS_PACKET_SIZE, 0);
//! # Ok(())
//! # }
//! ```

/// The multiplexer session and its scheduling
pub mod muxer;

/// Transport packet headers, adaptation fields and continuity counters
pub mod packet;

/// Read-side helpers for inspecting produced streams
pub mod parser;

/// PES header serialization
pub mod pes;

/// Program bookkeeping
pub mod program;

/// PAT, PMT and SCTE-35 section builders
pub mod psi;

/// Sections bound to a PID
pub mod section;

/// Packet output targets
pub mod sink;

/// Elementary streams and their PES packetizer
pub mod stream;

/// Core TS types and constants
pub mod types;


// Re-export commonly used types and constants
pub use muxer::{Muxer, SharedMuxer};
pub use packet::{PacketFlags, PacketInfo};
pub use pes::PesHeader;
pub use program::Program;
pub use psi::Descriptor;
pub use section::Section;
pub use sink::{ChannelSink, PacketSink, TsPacket, VecSink, WriterSink};
pub use stream::{
    AtscStreamFactory, DefaultStreamFactory, DescriptorSource, ElementaryStream, Jpeg2000Params,
    PesState, StreamFactory,
};
pub use types::{StreamType, PID_NULL, PID_PAT, PTS_HZ, PCR_HZ, TS_PACKET_SIZE};

#![doc(html_root_url = "https://docs.rs/tsmux/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::missing_crate_level_docs)]

//! # tsmux - MPEG-2 Transport Stream muxer
//!
//! `tsmux` multiplexes timestamped audio, video and data access units into an
//! MPEG-2 Transport Stream (ISO/IEC 13818-1) made of 188-byte packets, the way
//! broadcast and streaming pipelines expect it.
//!
//! ## Features
//!
//! - Any number of programs (up to 253) and elementary streams per output
//! - PES packetization for H.264, H.265, MPEG video/audio, AAC, AC-3, E-AC-3,
//!   DTS, LPCM, Opus, JPEG 2000, JPEG XS, teletext, DVB subtitles and KLV
//! - PAT/PMT generation with version tracking and configurable repetition
//! - Injected SI sections and SCTE-35 splice signalling with null heartbeats
//! - PCR insertion and constant-bitrate output with null-packet padding
//! - Pluggable packet sinks: in-memory, `std::io::Write`, tokio channels or
//!   closures
//!
//! ## Quick Start
//!
//! ```rust
//! use tsmux::{AccessUnit, Muxer, MuxerConfig, StreamType, WriterSink};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut muxer = Muxer::new(MuxerConfig::default(), WriterSink::new(Vec::new()));
//! let program = muxer.create_program(None)?;
//! let video = muxer.create_stream(StreamType::H264, None)?;
//! let audio = muxer.create_stream(StreamType::AacAdts, None)?;
//! muxer.program_add_stream(program, video)?;
//! muxer.program_add_stream(program, audio)?;
//!
//! muxer.add_data(video, AccessUnit::new(vec![0u8; 2000]).with_pts(0).with_random_access(true))?;
//! muxer.add_data(audio, AccessUnit::new(vec![0u8; 300]).with_pts(0))?;
//! for pid in [video, audio] {
//!     while muxer.stream(pid).map_or(0, |s| s.bytes_in_buffer()) > 0 {
//!         muxer.write_stream_packet(pid)?;
//!     }
//! }
//!
//! let ts = muxer.into_sink().into_inner();
//! assert_eq!(ts.len() % 188, 0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - `av`: access units handed to the muxer
//! - `config`: muxer options, loadable from files and the environment
//! - `error`: the crate error type and `Result` alias
//! - `format::ts`: the transport stream muxer itself
//! - `utils`: bit writing and the MPEG-2 CRC

/// Access units and timestamps
pub mod av;

/// Muxer configuration
pub mod config;

/// Error types and utilities
pub mod error;

/// Container formats
pub mod format;

/// Common utilities and helper functions
pub mod utils;

pub use av::AccessUnit;
pub use config::{MuxerConfig, ProgramConfig, StreamConfig};
pub use error::{MuxError, Result};
pub use format::ts::{Muxer, PacketSink, SharedMuxer, StreamType, VecSink, WriterSink};

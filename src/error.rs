use std::num::ParseIntError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PID 0x{0:04x} is already in use")]
    PidInUse(u16),

    #[error("PID 0x{0:04x} is outside the elementary stream range")]
    InvalidPid(u16),

    #[error("no free PID left to allocate")]
    PidsExhausted,

    #[error("too many programs, the limit is {0}")]
    TooManyPrograms(usize),

    #[error("unknown program {0}")]
    UnknownProgram(u16),

    #[error("unknown stream on PID 0x{0:04x}")]
    UnknownStream(u16),

    #[error("stream on PID 0x{pid:04x} already belongs to program {program}")]
    StreamAlreadyMapped { pid: u16, program: u16 },

    #[error("stream on PID 0x{0:04x} is not mapped to a program")]
    StreamNotMapped(u16),

    #[error("unsupported stream type 0x{0:02x}")]
    UnsupportedStreamType(u8),

    #[error("no data queued on PID 0x{0:04x}")]
    NoData(u16),

    #[error("buffer too small: need {needed} bytes, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("requested {requested} bytes but only {available} are available")]
    NotEnoughData { requested: usize, available: usize },

    #[error("adaptation field overflow: {needed} bytes needed, {available} left")]
    AdaptationFieldOverflow { needed: usize, available: usize },

    #[error("PES packet too large: {0} bytes")]
    PesTooLarge(usize),

    #[error("section too large: {0} bytes")]
    SectionTooLarge(usize),

    #[error("invalid section: {0}")]
    InvalidSection(String),

    #[error("invalid transport packet: {0}")]
    InvalidPacket(String),

    #[error("program has no SCTE-35 PID")]
    NoScte35Pid,

    #[error("packet allocation failed")]
    AllocationFailed,

    #[error("packet output failed: {0}")]
    Output(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),
}

pub type Result<T> = std::result::Result<T, MuxError>;

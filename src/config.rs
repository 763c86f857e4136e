use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::error::{MuxError, Result};
use crate::format::ts::types::*;

/// Overrides for a single program, keyed by program number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramConfig {
    pub pmt_pid: Option<u16>,
    pub pcr_pid: Option<u16>,
    pub pmt_interval: Option<u64>,
}

/// Options for a single elementary stream, keyed by PID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    pub language: Option<String>,
    pub pmt_index: Option<u32>,
}

/// Muxer options. Intervals are in 90 kHz ticks, the bitrate in bits per second
/// (0 disables constant-bitrate padding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerConfig {
    pub transport_stream_id: u16,
    pub pat_interval: u64,
    pub pmt_interval: u64,
    pub si_interval: u64,
    pub pcr_interval: u64,
    pub bitrate: u64,
    /// SCTE-35 PID given to new programs; 0 disables SCTE-35.
    pub scte35_pid: u16,
    pub scte35_null_interval: u64,
    pub programs: HashMap<u16, ProgramConfig>,
    pub streams: HashMap<u16, StreamConfig>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            transport_stream_id: DEFAULT_TRANSPORT_STREAM_ID,
            pat_interval: DEFAULT_PAT_INTERVAL,
            pmt_interval: DEFAULT_PMT_INTERVAL,
            si_interval: DEFAULT_SI_INTERVAL,
            pcr_interval: DEFAULT_PCR_INTERVAL,
            bitrate: 0,
            scte35_pid: 0,
            scte35_null_interval: DEFAULT_SCTE35_NULL_INTERVAL,
            programs: HashMap::new(),
            streams: HashMap::new(),
        }
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
fn parse_number(value: &str) -> Result<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => Ok(u64::from_str_radix(hex, 16)?),
        None => Ok(value.parse::<u64>()?),
    }
}

/// Repetition intervals are 90 kHz durations and must fit the 33-bit PTS range.
fn parse_interval(value: &str) -> Result<u64> {
    let interval = parse_number(value)?;
    if interval > MAX_TIMESTAMP {
        return Err(MuxError::Config(format!("interval {} exceeds 33 bits", value)));
    }
    Ok(interval)
}

fn parse_pid(value: &str) -> Result<u16> {
    let pid = parse_number(value)?;
    if pid >= u64::from(PID_NULL) {
        return Err(MuxError::Config(format!("PID {} out of range", value)));
    }
    Ok(pid as u16)
}

fn parse_u16(value: &str) -> Result<u16> {
    u16::try_from(parse_number(value)?)
        .map_err(|_| MuxError::Config(format!("{} does not fit 16 bits", value)))
}

impl MuxerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = bitrate;
        self
    }

    pub fn with_pat_interval(mut self, interval: u64) -> Self {
        self.pat_interval = interval;
        self
    }

    pub fn with_pmt_interval(mut self, interval: u64) -> Self {
        self.pmt_interval = interval;
        self
    }

    pub fn with_si_interval(mut self, interval: u64) -> Self {
        self.si_interval = interval;
        self
    }

    pub fn with_pcr_interval(mut self, interval: u64) -> Self {
        self.pcr_interval = interval;
        self
    }

    pub fn with_scte35(mut self, pid: u16, null_interval: u64) -> Self {
        self.scte35_pid = pid;
        self.scte35_null_interval = null_interval;
        self
    }

    pub fn with_program(mut self, number: u16, program: ProgramConfig) -> Self {
        self.programs.insert(number, program);
        self
    }

    pub fn with_stream(mut self, pid: u16, stream: StreamConfig) -> Self {
        self.streams.insert(pid, stream);
        self
    }

    /// Applies one `key = value` setting.
    ///
    /// Per-program keys take the program number as suffix (`pmt_pid.1`),
    /// per-stream keys the PID (`language.0x41`).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim().trim_matches('"').trim_matches('\'');
        let (name, target) = match key.trim().split_once('.') {
            Some((name, target)) => (name, Some(target)),
            None => (key.trim(), None),
        };

        match (name, target) {
            ("transport_stream_id", None) => self.transport_stream_id = parse_u16(value)?,
            ("pat_interval", None) => self.pat_interval = parse_interval(value)?,
            ("pmt_interval", None) => self.pmt_interval = parse_interval(value)?,
            ("si_interval", None) => self.si_interval = parse_interval(value)?,
            ("pcr_interval", None) => self.pcr_interval = parse_interval(value)?,
            ("bitrate", None) => self.bitrate = parse_number(value)?,
            ("scte35_pid", None) => self.scte35_pid = parse_pid(value)?,
            ("scte35_null_interval", None) => self.scte35_null_interval = parse_interval(value)?,
            ("pmt_pid", Some(program)) => {
                self.programs.entry(parse_u16(program)?).or_default().pmt_pid = Some(parse_pid(value)?)
            }
            ("pcr_pid", Some(program)) => {
                self.programs.entry(parse_u16(program)?).or_default().pcr_pid = Some(parse_pid(value)?)
            }
            ("pmt_interval", Some(program)) => {
                self.programs.entry(parse_u16(program)?).or_default().pmt_interval =
                    Some(parse_interval(value)?)
            }
            ("language", Some(pid)) => {
                self.streams.entry(parse_pid(pid)?).or_default().language = Some(value.to_string())
            }
            ("pmt_index", Some(pid)) => {
                let index = u32::try_from(parse_number(value)?)
                    .map_err(|_| MuxError::Config(format!("pmt_index {} too large", value)))?;
                self.streams.entry(parse_pid(pid)?).or_default().pmt_index = Some(index)
            }
            _ => return Err(MuxError::Config(format!("unknown key {}", key))),
        }
        Ok(())
    }

    /// Parses `key = value` lines; `#` starts a comment.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| MuxError::Config(format!("expected key = value, got {:?}", line)))?;
            config.set(key, value)?;
        }
        Ok(config)
    }

    /// Loads a config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        debug!("loaded muxer config from {}", path.as_ref().display());
        Self::parse(&content)
    }

    /// Defaults overridden by `TSMUX_*` environment variables, e.g.
    /// `TSMUX_BITRATE=5000000` or `TSMUX_PCR_INTERVAL=3600`.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(env::vars())
    }

    fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = Self::default();
        for (name, value) in vars {
            let Some(key) = name.strip_prefix("TSMUX_") else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            if let Err(e) = config.set(&key, &value) {
                warn!("ignoring {}: {}", name, e);
            }
        }
        Ok(config)
    }
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# tsmux configuration
# Intervals are in 90 kHz ticks (9000 = 100 ms).

transport_stream_id = 1
pat_interval = 9000
pmt_interval = 9000
si_interval = 9000
pcr_interval = 3600

# Constant bitrate in bit/s, 0 disables padding
bitrate = 0

# SCTE-35 PID for new programs, 0 disables
scte35_pid = 0
scte35_null_interval = 450000

# Per-program overrides
# pmt_pid.1 = 0x30
# pcr_pid.1 = 0x41

# Per-stream options
# language.0x42 = "eng"
# pmt_index.0x42 = 1
"#;
        fs::write(path, template)?;
    }
    Ok(())
}

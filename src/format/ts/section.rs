use bytes::Bytes;

use super::packet::PacketInfo;
use super::types::*;
use crate::error::{MuxError, Result};

/// A complete PSI/SI section bound to the PID it is carried on.
///
/// The muxer never looks inside `data` beyond the `table_id` byte; it only
/// splits it across transport packets behind a `pointer_field`.
#[derive(Debug, Clone)]
pub struct Section {
    pi: PacketInfo,
    data: Bytes,
}

impl Section {
    pub fn new(pid: u16, data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(MuxError::InvalidSection("empty section".into()));
        }
        if pid >= PID_NULL {
            return Err(MuxError::InvalidPid(pid));
        }
        Ok(Self {
            pi: PacketInfo::new(pid),
            data,
        })
    }

    pub fn pid(&self) -> u16 {
        self.pi.pid
    }

    pub fn table_id(&self) -> u8 {
        self.data[0]
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn packet_info(&self) -> &PacketInfo {
        &self.pi
    }

    /// Number of transport packets the section occupies, pointer field included.
    pub fn packet_count(&self) -> usize {
        (self.data.len() + 1 + TS_PAYLOAD_SIZE - 1) / TS_PAYLOAD_SIZE
    }
}

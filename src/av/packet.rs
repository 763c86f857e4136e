use bytes::Bytes;
use std::time::Duration;

use crate::format::ts::types::time_to_pts;

/// One unit of elementary stream data queued for packetization.
///
/// The muxer owns the unit from the moment it is queued until every byte has
/// been copied into transport packets, at which point the unit is handed back
/// through the stream's release hook (or dropped).
///
/// Timestamps are 90 kHz ticks. A DTS without a PTS is treated as the PTS.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub random_access: bool,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pts: None,
            dts: None,
            random_access: false,
        }
    }

    pub fn with_pts(mut self, pts: u64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn with_dts(mut self, dts: u64) -> Self {
        self.dts = Some(dts);
        self
    }

    /// Sets the PTS from a wall-clock position.
    pub fn with_pts_time(self, pts: Duration) -> Self {
        self.with_pts(time_to_pts(pts))
    }

    /// Marks the unit as a random access point (key frame).
    pub fn with_random_access(mut self, random_access: bool) -> Self {
        self.random_access = random_access;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

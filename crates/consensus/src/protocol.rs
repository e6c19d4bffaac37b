//! Time-based protocol schedule.
//!
//! The stake protocol upgrades by wall-clock switchover rather than by block
//! height: v2 introduced the masked coinstake timestamp, v3.1 moved locktime
//! enforcement to median-time-past.

pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum ProtocolVersion {
    V1,
    V2,
    V3_1,
}

#[derive(Clone, Copy, Debug)]
pub struct ProtocolSchedule {
    /// Switch time for protocol v2 (masked coinstake timestamps).
    pub v2_time: i64,
    /// Switch time for protocol v3.1 (median-time-past locktime cutoff).
    pub v3_1_time: i64,
}

impl ProtocolSchedule {
    pub fn version_at(&self, time: i64) -> ProtocolVersion {
        if time >= self.v3_1_time {
            ProtocolVersion::V3_1
        } else if time >= self.v2_time {
            ProtocolVersion::V2
        } else {
            ProtocolVersion::V1
        }
    }

    pub fn is_v2(&self, time: i64) -> bool {
        time >= self.v2_time
    }

    pub fn is_v3_1(&self, time: i64) -> bool {
        time >= self.v3_1_time
    }
}

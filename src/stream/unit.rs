use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::NtpSource;

/// Payload of one access unit.
#[derive(Debug, Clone)]
pub enum UnitPayload {
    /// NAL-structured codecs (H.264/H.265).
    NalUnits(Vec<Bytes>),
    /// Everything else: one opaque frame.
    Frame(Bytes),
}

impl UnitPayload {
    pub fn is_empty(&self) -> bool {
        match self {
            UnitPayload::NalUnits(n) => n.is_empty(),
            UnitPayload::Frame(f) => f.is_empty(),
        }
    }
}

/// One decoded-order element of a track: an access unit with its timing.
///
/// Within a track, `dts` is strictly increasing and `pts - dts >= 0`.
#[derive(Debug, Clone)]
pub struct Unit {
    pub payload: UnitPayload,
    /// Presentation timestamp in track time-scale ticks.
    pub pts: i64,
    /// Decode timestamp in track time-scale ticks.
    pub dts: i64,
    /// Absolute wall-clock anchor of this unit.
    pub ntp: DateTime<Utc>,
    /// Which clock produced `ntp`.
    pub ntp_source: NtpSource,
    /// The unit can be decoded without prior units.
    pub random_access: bool,
}

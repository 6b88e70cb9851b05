pub mod h264;
pub mod h265;
pub mod reorder;
pub mod rtcp;
pub mod simple;

use bytes::Bytes;
use webrtc::rtp::packet::Packet;

pub use reorder::PacketReorderer;
pub use rtcp::RtcpSync;

/// A reassembled access unit together with the RTP timestamp it was
/// carried under.
#[derive(Debug, Clone)]
pub struct DepacketizedUnit {
    pub timestamp: u32,
    pub payload: UnitPayload,
}

#[derive(Debug, Clone)]
pub enum UnitPayload {
    /// NAL-structured codecs (H.264/H.265).
    NalUnits(Vec<Bytes>),
    /// Everything else: one opaque frame.
    Frame(Bytes),
}

/// Recoverable depacketization outcomes. None of these abort the stream:
/// the packet (or pending fragment) is dropped and parsing continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepacketizeError {
    /// The packet was consumed but no access unit is complete yet.
    MorePacketsNeeded,
    /// A fragment continuation arrived without its start; discarded.
    NonStartingPacketAndNoPrevious,
    /// The payload violates the packetization format; discarded.
    Malformed(&'static str),
}

impl std::fmt::Display for DepacketizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepacketizeError::MorePacketsNeeded => write!(f, "more packets needed"),
            DepacketizeError::NonStartingPacketAndNoPrevious => {
                write!(f, "received a non-starting fragment without the previous one")
            }
            DepacketizeError::Malformed(msg) => write!(f, "malformed payload: {msg}"),
        }
    }
}

impl std::error::Error for DepacketizeError {}

/// Codec-specific, stateful RTP payload reassembly.
pub trait Depacketizer: Send {
    /// Feed one packet; yields zero or more completed access units.
    fn depacketize(&mut self, pkt: &Packet) -> Result<Vec<DepacketizedUnit>, DepacketizeError>;
}

/// Extends 32-bit RTP timestamps into a continuous signed 64-bit timeline,
/// surviving wrap-around by treating successive differences as signed
/// 32-bit quantities.
#[derive(Debug, Default)]
pub struct TimestampDecoder {
    last: Option<(u32, i64)>,
}

impl TimestampDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode relative to the first observed timestamp (which maps to
    /// `base`, normally 0).
    pub fn decode(&mut self, ts: u32, base: i64) -> i64 {
        match self.last {
            None => {
                self.last = Some((ts, base));
                base
            }
            Some((prev_ts, prev_val)) => {
                let diff = ts.wrapping_sub(prev_ts) as i32;
                let val = prev_val + diff as i64;
                self.last = Some((ts, val));
                val
            }
        }
    }
}

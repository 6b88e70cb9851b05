use bytes::BytesMut;
use webrtc::rtp::packet::Packet;

use super::{DepacketizeError, DepacketizedUnit, Depacketizer, UnitPayload};

/// Depacketizer for codecs whose RTP payload needs no reassembly: each
/// packet payload is a complete frame (audio), or frames span packets and
/// complete on the marker bit (M-JPEG and friends).
pub struct SimpleDepacketizer {
    accumulate_until_marker: bool,
    acc: BytesMut,
    acc_timestamp: Option<u32>,
}

impl SimpleDepacketizer {
    /// One packet, one frame.
    pub fn per_packet() -> Self {
        Self {
            accumulate_until_marker: false,
            acc: BytesMut::new(),
            acc_timestamp: None,
        }
    }

    /// Concatenate packets of one timestamp until the marker bit.
    pub fn marker_terminated() -> Self {
        Self {
            accumulate_until_marker: true,
            acc: BytesMut::new(),
            acc_timestamp: None,
        }
    }
}

impl Depacketizer for SimpleDepacketizer {
    fn depacketize(&mut self, pkt: &Packet) -> Result<Vec<DepacketizedUnit>, DepacketizeError> {
        if pkt.payload.is_empty() {
            return Ok(Vec::new());
        }

        if !self.accumulate_until_marker {
            return Ok(vec![DepacketizedUnit {
                timestamp: pkt.header.timestamp,
                payload: UnitPayload::Frame(pkt.payload.clone()),
            }]);
        }

        let mut out = Vec::new();
        if let Some(ts) = self.acc_timestamp {
            if ts != pkt.header.timestamp && !self.acc.is_empty() {
                out.push(DepacketizedUnit {
                    timestamp: ts,
                    payload: UnitPayload::Frame(std::mem::take(&mut self.acc).freeze()),
                });
            }
        }
        self.acc.extend_from_slice(&pkt.payload);
        self.acc_timestamp = Some(pkt.header.timestamp);

        if pkt.header.marker {
            out.push(DepacketizedUnit {
                timestamp: pkt.header.timestamp,
                payload: UnitPayload::Frame(std::mem::take(&mut self.acc).freeze()),
            });
            self.acc_timestamp = None;
        }

        if out.is_empty() {
            return Err(DepacketizeError::MorePacketsNeeded);
        }
        Ok(out)
    }
}

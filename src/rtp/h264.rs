use bytes::{Bytes, BytesMut};
use webrtc::rtp::packet::Packet;

use crate::codec::h264::{NAL_TYPE_FU_A, NAL_TYPE_FU_B, NAL_TYPE_STAP_A};

use super::{DepacketizeError, DepacketizedUnit, Depacketizer, UnitPayload};

/// Reassembles H.264 access units from RTP packets (packetization mode 1):
/// single NAL units, STAP-A aggregates and FU-A/FU-B fragments. The access
/// unit under assembly completes when the marker bit is set or when a
/// packet with a different timestamp arrives.
pub struct H264Depacketizer {
    acc: Vec<Bytes>,
    acc_timestamp: Option<u32>,
    fragment: Option<BytesMut>,
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self {
            acc: Vec::new(),
            acc_timestamp: None,
            fragment: None,
        }
    }

    fn flush_au(&mut self, out: &mut Vec<DepacketizedUnit>) {
        if let (false, Some(ts)) = (self.acc.is_empty(), self.acc_timestamp) {
            out.push(DepacketizedUnit {
                timestamp: ts,
                payload: UnitPayload::NalUnits(std::mem::take(&mut self.acc)),
            });
        }
        self.acc_timestamp = None;
    }
}

impl Depacketizer for H264Depacketizer {
    fn depacketize(&mut self, pkt: &Packet) -> Result<Vec<DepacketizedUnit>, DepacketizeError> {
        let payload = &pkt.payload;
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();

        // A timestamp change closes the previous access unit; an
        // interrupted fragment cannot survive it.
        if let Some(ts) = self.acc_timestamp {
            if ts != pkt.header.timestamp {
                self.fragment = None;
                self.flush_au(&mut out);
            }
        }

        let nal_type = payload[0] & 0x1F;
        match nal_type {
            1..=23 => {
                self.acc.push(payload.clone());
                self.acc_timestamp = Some(pkt.header.timestamp);
            }
            NAL_TYPE_STAP_A => {
                // One byte header, then (size | nalu)*.
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size =
                        ((payload[offset] as usize) << 8) | payload[offset + 1] as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        return Err(DepacketizeError::Malformed("STAP-A unit size"));
                    }
                    self.acc.push(payload.slice(offset..offset + size));
                    offset += size;
                }
                self.acc_timestamp = Some(pkt.header.timestamp);
            }
            NAL_TYPE_FU_A | NAL_TYPE_FU_B => {
                let header_len = if nal_type == NAL_TYPE_FU_B { 4 } else { 2 };
                if payload.len() <= header_len {
                    return Err(DepacketizeError::Malformed("FU payload too short"));
                }
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;

                if start {
                    // Rebuild the NAL header from F|NRI of the indicator
                    // plus the fragmented unit's type.
                    let reconstructed = (payload[0] & 0xE0) | (fu_header & 0x1F);
                    let mut frag = BytesMut::with_capacity(payload.len() - header_len + 1);
                    frag.extend_from_slice(&[reconstructed]);
                    frag.extend_from_slice(&payload[header_len..]);
                    self.fragment = Some(frag);
                } else {
                    match self.fragment.as_mut() {
                        Some(frag) => frag.extend_from_slice(&payload[header_len..]),
                        None => {
                            return Err(DepacketizeError::NonStartingPacketAndNoPrevious);
                        }
                    }
                }
                self.acc_timestamp = Some(pkt.header.timestamp);

                if end {
                    if let Some(frag) = self.fragment.take() {
                        self.acc.push(frag.freeze());
                    }
                }
            }
            _ => {
                return Err(DepacketizeError::Malformed("unsupported packetization type"));
            }
        }

        if pkt.header.marker {
            if self.fragment.is_some() {
                // Marker on an unfinished fragment: the tail is lost.
                self.fragment = None;
            }
            self.flush_au(&mut out);
        }

        if out.is_empty() {
            return Err(DepacketizeError::MorePacketsNeeded);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: &[u8], timestamp: u32, marker: bool) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.timestamp = timestamp;
        pkt.header.marker = marker;
        pkt.payload = Bytes::copy_from_slice(payload);
        pkt
    }

    fn nalus(units: Vec<DepacketizedUnit>) -> Vec<Bytes> {
        assert_eq!(units.len(), 1);
        match units.into_iter().next().unwrap().payload {
            UnitPayload::NalUnits(n) => n,
            UnitPayload::Frame(_) => panic!("expected NAL units"),
        }
    }

    #[test]
    fn test_single_nalu_with_marker() {
        let mut d = H264Depacketizer::new();
        let units = d
            .depacketize(&packet(&[0x65, 0xAA, 0xBB], 1000, true))
            .unwrap();
        assert_eq!(nalus(units), vec![Bytes::from_static(&[0x65, 0xAA, 0xBB])]);
    }

    #[test]
    fn test_stap_a() {
        // SPS + PPS + IDR in one aggregate.
        let mut payload = vec![0x78];
        for nalu in [&[0x67u8, 0x42][..], &[0x68, 0xCE], &[0x65, 0x88]] {
            payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            payload.extend_from_slice(nalu);
        }
        let mut d = H264Depacketizer::new();
        let units = d.depacketize(&packet(&payload, 2000, true)).unwrap();
        let n = nalus(units);
        assert_eq!(n.len(), 3);
        assert_eq!(n[0][0] & 0x1F, 7);
        assert_eq!(n[2][0] & 0x1F, 5);
    }

    #[test]
    fn test_fu_a_reassembly() {
        let mut d = H264Depacketizer::new();
        // FU indicator 0x7C (NRI 3, type 28), fragmenting an IDR (type 5).
        let r = d.depacketize(&packet(&[0x7C, 0x85, 1, 2], 3000, false));
        assert_eq!(r.unwrap_err(), DepacketizeError::MorePacketsNeeded);
        let r = d.depacketize(&packet(&[0x7C, 0x05, 3, 4], 3000, false));
        assert_eq!(r.unwrap_err(), DepacketizeError::MorePacketsNeeded);
        let units = d
            .depacketize(&packet(&[0x7C, 0x45, 5, 6], 3000, true))
            .unwrap();
        let n = nalus(units);
        assert_eq!(n, vec![Bytes::from_static(&[0x65, 1, 2, 3, 4, 5, 6])]);
    }

    #[test]
    fn test_fu_a_without_start_is_discarded() {
        let mut d = H264Depacketizer::new();
        let r = d.depacketize(&packet(&[0x7C, 0x05, 3, 4], 3000, false));
        assert_eq!(r.unwrap_err(), DepacketizeError::NonStartingPacketAndNoPrevious);
        // The stream recovers with the next complete unit.
        let units = d.depacketize(&packet(&[0x41, 0x9A], 6000, true)).unwrap();
        assert_eq!(nalus(units).len(), 1);
    }

    #[test]
    fn test_timestamp_change_completes_au() {
        let mut d = H264Depacketizer::new();
        let r = d.depacketize(&packet(&[0x41, 0x9A], 1000, false));
        assert_eq!(r.unwrap_err(), DepacketizeError::MorePacketsNeeded);
        // Next picture's first packet closes the previous one.
        let units = d.depacketize(&packet(&[0x41, 0x9B], 4000, true)).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].timestamp, 1000);
        assert_eq!(units[1].timestamp, 4000);
    }

    #[test]
    fn test_empty_payload_dropped() {
        let mut d = H264Depacketizer::new();
        assert!(d.depacketize(&packet(&[], 0, true)).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_stap_a() {
        let mut d = H264Depacketizer::new();
        let r = d.depacketize(&packet(&[0x78, 0x00, 0x10, 0x65], 0, true));
        assert!(matches!(r, Err(DepacketizeError::Malformed(_))));
    }
}

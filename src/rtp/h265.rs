use bytes::{Bytes, BytesMut};
use webrtc::rtp::codecs::h265::{H265Packet, H265Payload};
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Depacketizer as _;

use super::{DepacketizeError, DepacketizedUnit, Depacketizer, UnitPayload};

/// Reassembles H.265 access units from RTP packets: single NAL units,
/// aggregation packets (type 48) and fragmentation units (type 49). The
/// payload structure is parsed by the webrtc codec support; assembly and
/// access-unit grouping happen here. PACI packets are ignored.
pub struct H265Depacketizer {
    parser: H265Packet,
    acc: Vec<Bytes>,
    acc_timestamp: Option<u32>,
    fragment: Option<BytesMut>,
}

impl Default for H265Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl H265Depacketizer {
    pub fn new() -> Self {
        Self {
            parser: H265Packet::default(),
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

impl Depacketizer for H265Depacketizer {
    fn depacketize(&mut self, pkt: &Packet) -> Result<Vec<DepacketizedUnit>, DepacketizeError> {
        if pkt.payload.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();

        if let Some(ts) = self.acc_timestamp {
            if ts != pkt.header.timestamp {
                self.fragment = None;
                self.flush_au(&mut out);
            }
        }

        self.parser
            .depacketize(&pkt.payload)
            .map_err(|_| DepacketizeError::Malformed("H265 payload structure"))?;

        match self.parser.payload() {
            H265Payload::H265SingleNALUnitPacket(nal) => {
                let header = nal.payload_header();
                let body = nal.payload();
                let mut nalu = BytesMut::with_capacity(2 + body.len());
                nalu.extend_from_slice(&header.0.to_be_bytes());
                nalu.extend_from_slice(body.as_ref());
                self.acc.push(nalu.freeze());
            }
            H265Payload::H265AggregationPacket(ap) => {
                if let Some(first) = ap.first_unit() {
                    self.acc.push(first.nal_unit());
                }
                for unit in ap.other_units() {
                    self.acc.push(unit.nal_unit());
                }
            }
            H265Payload::H265FragmentationUnitPacket(fu) => {
                let header = fu.payload_header();
                let fu_header = fu.fu_header();
                let body = fu.payload();

                if fu_header.s() {
                    // Rebuild the 2-byte NAL header with the fragmented
                    // unit's type in place of the FU type.
                    let mut reconstructed = header.0;
                    reconstructed &= !(0b0111_1110 << 8);
                    reconstructed |= ((fu_header.fu_type() as u16) & 0x3F) << 9;
                    let mut frag = BytesMut::with_capacity(2 + body.len());
                    frag.extend_from_slice(&reconstructed.to_be_bytes());
                    frag.extend_from_slice(body.as_ref());
                    self.fragment = Some(frag);
                } else {
                    match self.fragment.as_mut() {
                        Some(frag) => frag.extend_from_slice(body.as_ref()),
                        None => {
                            return Err(DepacketizeError::NonStartingPacketAndNoPrevious);
                        }
                    }
                }

                if fu_header.e() {
                    if let Some(frag) = self.fragment.take() {
                        self.acc.push(frag.freeze());
                    }
                }
            }
            H265Payload::H265PACIPacket(_) => {}
        }
        self.acc_timestamp = Some(pkt.header.timestamp);

        if pkt.header.marker {
            if self.fragment.is_some() {
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

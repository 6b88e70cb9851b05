use std::collections::HashMap;

use webrtc::rtp::packet::Packet;

pub const DEFAULT_REORDER_WINDOW: u16 = 64;

/// A packet released by the reorderer. `late` marks packets that arrived
/// behind the delivery point; downstream may still accept them.
#[derive(Debug, Clone)]
pub struct DeliveredPacket {
    pub packet: Packet,
    pub late: bool,
}

/// Restores RTP sequence order within a sliding window.
///
/// Packets ahead of the expected sequence (up to `window`) are buffered
/// until the gap fills. A jump at or beyond the window gives up on the gap:
/// buffered packets drain in order, the missing sequences are counted as
/// lost, and delivery continues from the new position. Packets behind the
/// delivery point are released immediately, flagged late. 16-bit sequence
/// wrap-around is handled by signed relative distance.
pub struct PacketReorderer {
    window: u16,
    expected: Option<u16>,
    buffer: HashMap<u16, Packet>,
}

impl Default for PacketReorderer {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW)
    }
}

impl PacketReorderer {
    pub fn new(window: u16) -> Self {
        Self {
            window,
            expected: None,
            buffer: HashMap::new(),
        }
    }

    /// Feed one packet; returns the packets now deliverable in order plus
    /// the number of packets declared lost by this call.
    pub fn feed(&mut self, pkt: Packet) -> (Vec<DeliveredPacket>, u64) {
        let seq = pkt.header.sequence_number;
        let mut delivered = Vec::new();
        let mut lost = 0u64;

        let expected = match self.expected {
            None => {
                self.expected = Some(seq.wrapping_add(1));
                delivered.push(DeliveredPacket { packet: pkt, late: false });
                return (delivered, 0);
            }
            Some(e) => e,
        };

        let rel = seq.wrapping_sub(expected);
        if rel >= 0x8000 {
            // Behind the delivery point.
            delivered.push(DeliveredPacket { packet: pkt, late: true });
            return (delivered, 0);
        }

        if rel == 0 {
            delivered.push(DeliveredPacket { packet: pkt, late: false });
            self.expected = Some(seq.wrapping_add(1));
            self.drain_contiguous(&mut delivered);
        } else if rel < self.window {
            self.buffer.insert(seq, pkt);
        } else {
            // The gap outgrew the window: flush everything buffered before
            // this packet and account for what never arrived.
            let mut cursor = expected;
            while cursor != seq {
                match self.buffer.remove(&cursor) {
                    Some(p) => delivered.push(DeliveredPacket { packet: p, late: false }),
                    None => lost += 1,
                }
                cursor = cursor.wrapping_add(1);
            }
            delivered.push(DeliveredPacket { packet: pkt, late: false });
            self.expected = Some(seq.wrapping_add(1));
            self.drain_contiguous(&mut delivered);
        }

        (delivered, lost)
    }

    fn drain_contiguous(&mut self, delivered: &mut Vec<DeliveredPacket>) {
        while let Some(expected) = self.expected {
            match self.buffer.remove(&expected) {
                Some(p) => {
                    delivered.push(DeliveredPacket { packet: p, late: false });
                    self.expected = Some(expected.wrapping_add(1));
                }
                None => break,
            }
        }
    }

    /// Packets currently parked waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

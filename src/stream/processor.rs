use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use webrtc::rtp::packet::Packet;

use crate::codec::{h264, h265, DtsExtractor, Format};
use crate::config::NtpSource;
use crate::rtp::h264::H264Depacketizer;
use crate::rtp::h265::H265Depacketizer;
use crate::rtp::simple::SimpleDepacketizer;
use crate::rtp::{
    DepacketizeError, Depacketizer, PacketReorderer, RtcpSync, TimestampDecoder, UnitPayload,
};
use crate::stream::unit::{Unit, UnitPayload as StreamPayload};

const WARN_INTERVAL: Duration = Duration::from_secs(60);

/// Composes the per-format pipeline: packet reordering, payload
/// reassembly, wall-clock anchoring and DTS derivation. One processor per
/// (media, format) pair; fed by the single ingest task.
pub struct FormatProcessor {
    format: Format,
    clock_rate: u32,
    label: String,

    reorderer: PacketReorderer,
    depacketizer: Box<dyn Depacketizer>,
    rtcp: Arc<RtcpSync>,
    ts_decoder: TimestampDecoder,

    ntp_sources: Vec<NtpSource>,
    /// Wall clock + pts of the first access unit, for the monotonic
    /// fallback anchor.
    first_unit_anchor: Option<(DateTime<Utc>, i64)>,

    needs_dts: bool,
    dts_extractor: Option<DtsExtractor>,
    dts_depth: usize,
    last_dts: Option<i64>,

    lost_packets: u64,
    dropped_units: u64,
    last_warn: Option<Instant>,
}

impl FormatProcessor {
    pub fn new(media_id: usize, format: &Format, ntp_sources: &[NtpSource]) -> Self {
        let depacketizer: Box<dyn Depacketizer> = match format {
            Format::H264 { .. } => Box::new(H264Depacketizer::new()),
            Format::H265 { .. } => Box::new(H265Depacketizer::new()),
            Format::Mjpeg | Format::Mpeg4Video { .. } => {
                Box::new(SimpleDepacketizer::marker_terminated())
            }
            _ => Box::new(SimpleDepacketizer::per_packet()),
        };

        let (needs_dts, dts_depth) = match format {
            Format::H264 { sps, .. } => {
                let depth = sps
                    .as_deref()
                    .and_then(|s| h264::parse_sps(s).ok())
                    .map(|info| info.dts_depth())
                    .unwrap_or(0);
                (true, depth)
            }
            Format::H265 { .. } => (true, 0),
            _ => (false, 0),
        };

        Self {
            clock_rate: format.clock_rate(),
            label: format!("media{}/{}", media_id, format.name()),
            format: format.clone(),
            reorderer: PacketReorderer::default(),
            depacketizer,
            rtcp: Arc::new(RtcpSync::new(format.clock_rate())),
            ts_decoder: TimestampDecoder::new(),
            ntp_sources: ntp_sources.to_vec(),
            first_unit_anchor: None,
            needs_dts,
            dts_extractor: None,
            dts_depth,
            last_dts: None,
            lost_packets: 0,
            dropped_units: 0,
            last_warn: None,
        }
    }

    pub fn rtcp(&self) -> Arc<RtcpSync> {
        self.rtcp.clone()
    }

    pub fn lost_packets(&self) -> u64 {
        self.lost_packets
    }

    pub fn dropped_units(&self) -> u64 {
        self.dropped_units
    }

    /// Feed one RTP packet; returns the access units it completed, in
    /// decode order with strictly increasing DTS.
    pub fn process_rtp(
        &mut self,
        pkt: Packet,
        now: DateTime<Utc>,
        pts_hint: Option<i64>,
    ) -> Vec<Unit> {
        let (delivered, lost) = self.reorderer.feed(pkt);
        if lost > 0 {
            self.lost_packets += lost;
            self.warn_rate_limited(|| format!("{lost} RTP packets lost"));
        }

        let mut units = Vec::new();
        for d in delivered {
            let depacketized = match self.depacketizer.depacketize(&d.packet) {
                Ok(us) => us,
                Err(DepacketizeError::MorePacketsNeeded) => continue,
                Err(DepacketizeError::NonStartingPacketAndNoPrevious) => {
                    debug!("[processor] {} fragment without start, dropped", self.label);
                    continue;
                }
                Err(e) => {
                    self.warn_rate_limited(|| format!("packet dropped: {e}"));
                    continue;
                }
            };

            for au in depacketized {
                let pts = self
                    .ts_decoder
                    .decode(au.timestamp, pts_hint.unwrap_or(0));
                if let Some(unit) = self.finish_unit(au.payload, pts, au.timestamp, now) {
                    units.push(unit);
                }
            }
        }
        units
    }

    fn finish_unit(
        &mut self,
        payload: UnitPayload,
        pts: i64,
        rtp_ts: u32,
        now: DateTime<Utc>,
    ) -> Option<Unit> {
        let (payload, random_access) = match payload {
            UnitPayload::NalUnits(nalus) => {
                let ra = match &self.format {
                    Format::H265 { .. } => h265::is_random_access(&nalus),
                    _ => h264::is_random_access(&nalus),
                };
                (StreamPayload::NalUnits(nalus), ra)
            }
            UnitPayload::Frame(frame) => (StreamPayload::Frame(frame), true),
        };

        let dts = if self.needs_dts {
            match self.extract_dts(pts, random_access) {
                Some(dts) => dts,
                None => return None,
            }
        } else {
            pts
        };

        if let Some(last) = self.last_dts {
            if dts <= last {
                self.dropped_units += 1;
                self.warn_rate_limited(|| {
                    format!("unit dropped: dts {dts} does not advance past {last}")
                });
                return None;
            }
        }
        self.last_dts = Some(dts);

        let (ntp, ntp_source) = self.resolve_ntp(rtp_ts, pts, now);
        if self.first_unit_anchor.is_none() {
            self.first_unit_anchor = Some((now, pts));
        }

        Some(Unit {
            payload,
            pts,
            dts,
            ntp,
            ntp_source,
            random_access,
        })
    }

    fn extract_dts(&mut self, pts: i64, random_access: bool) -> Option<i64> {
        if self.dts_extractor.is_none() {
            if !random_access {
                // Not decodable yet; wait for a random-access unit.
                self.dropped_units += 1;
                return None;
            }
            self.dts_extractor = Some(DtsExtractor::new(self.dts_depth));
        }

        let extractor = self.dts_extractor.as_mut().expect("extractor present");
        match extractor.extract(pts) {
            Ok(dts) => Some(dts),
            Err(e) => {
                // Recoverable: drop this unit, come back at the next
                // random-access point with a wider window.
                self.dts_depth = extractor.suggested_depth();
                self.dts_extractor = None;
                self.last_dts = None;
                self.dropped_units += 1;
                self.warn_rate_limited(|| format!("unit dropped: {e}"));
                None
            }
        }
    }

    fn resolve_ntp(&self, rtp_ts: u32, pts: i64, now: DateTime<Utc>) -> (DateTime<Utc>, NtpSource) {
        for source in &self.ntp_sources {
            match source {
                NtpSource::Rtcp => {
                    if let Some(ntp) = self.rtcp.packet_ntp(rtp_ts) {
                        return (ntp, NtpSource::Rtcp);
                    }
                }
                NtpSource::FirstPacket => {
                    if let Some((anchor_now, anchor_pts)) = self.first_unit_anchor {
                        let nanos =
                            (pts - anchor_pts) * 1_000_000_000 / self.clock_rate as i64;
                        if let Some(ntp) =
                            anchor_now.checked_add_signed(chrono::Duration::nanoseconds(nanos))
                        {
                            return (ntp, NtpSource::FirstPacket);
                        }
                    } else {
                        // This unit becomes the anchor.
                        return (now, NtpSource::FirstPacket);
                    }
                }
                NtpSource::Arrival => return (now, NtpSource::Arrival),
            }
        }
        (now, NtpSource::Arrival)
    }

    fn warn_rate_limited(&mut self, msg: impl FnOnce() -> String) {
        let due = self
            .last_warn
            .map(|t| t.elapsed() >= WARN_INTERVAL)
            .unwrap_or(true);
        if due {
            warn!("[processor] {} {}", self.label, msg());
            self.last_warn = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::testdata::{PPS, SPS_640X480_POC2};
    use crate::config::default_ntp_sources;
    use bytes::Bytes;

    fn h264_format() -> Format {
        Format::H264 {
            payload_type: 96,
            sps: Some(SPS_640X480_POC2.to_vec()),
            pps: Some(PPS.to_vec()),
            packetization_mode: 1,
        }
    }

    fn idr_packet(seq: u16, ts: u32) -> Packet {
        let mut payload = vec![0x78];
        for nalu in [SPS_640X480_POC2, PPS, &[0x65, 0x88, 0x84][..]] {
            payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
            payload.extend_from_slice(nalu);
        }
        packet(&payload, seq, ts)
    }

    fn packet(payload: &[u8], seq: u16, ts: u32) -> Packet {
        let mut pkt = Packet::default();
        pkt.header.sequence_number = seq;
        pkt.header.timestamp = ts;
        pkt.header.marker = true;
        pkt.payload = Bytes::copy_from_slice(payload);
        pkt
    }

    #[test]
    fn test_drops_until_random_access() {
        let mut p = FormatProcessor::new(0, &h264_format(), &default_ntp_sources());
        let now = Utc::now();

        // Non-IDR slices before the first IDR are not decodable.
        let units = p.process_rtp(packet(&[0x41, 0x9A], 1, 0), now, None);
        assert!(units.is_empty());
        assert_eq!(p.dropped_units(), 1);

        let units = p.process_rtp(idr_packet(2, 3000), now, None);
        assert_eq!(units.len(), 1);
        assert!(units[0].random_access);
    }

    #[test]
    fn test_strictly_increasing_dts() {
        let mut p = FormatProcessor::new(0, &h264_format(), &default_ntp_sources());
        let now = Utc::now();

        let mut last = None;
        let mut count = 0;
        let first = p.process_rtp(idr_packet(0, 0), now, None);
        count += first.len();
        last = first.last().map(|u| u.dts).or(last);
        for i in 1..10u16 {
            let units = p.process_rtp(packet(&[0x41, 0x9A], i, i as u32 * 3000), now, None);
            for u in &units {
                assert!(Some(u.dts) > last);
                assert!(u.pts - u.dts >= 0);
                last = Some(u.dts);
            }
            count += units.len();
        }
        assert_eq!(count, 10);
    }

    #[test]
    fn test_reordered_packets_produce_ordered_units() {
        let mut p = FormatProcessor::new(0, &h264_format(), &default_ntp_sources());
        let now = Utc::now();

        let mut units = p.process_rtp(idr_packet(10, 0), now, None);
        // Sequence 12 arrives before 11; both complete after 11 fills the gap.
        units.extend(p.process_rtp(packet(&[0x41, 2], 12, 6000), now, None));
        assert_eq!(units.len(), 1);
        units.extend(p.process_rtp(packet(&[0x41, 1], 11, 3000), now, None));
        assert_eq!(units.len(), 3);
        assert_eq!(units[1].pts, 3000);
        assert_eq!(units[2].pts, 6000);
    }

    #[test]
    fn test_ntp_fallback_to_first_packet_anchor() {
        let mut p = FormatProcessor::new(0, &h264_format(), &default_ntp_sources());
        let now = Utc::now();

        let units = p.process_rtp(idr_packet(0, 0), now, None);
        assert_eq!(units[0].ntp_source, NtpSource::FirstPacket);
        assert_eq!(units[0].ntp, now);

        // One second later in RTP time, same arrival clock: the anchor
        // extrapolates instead of re-sampling.
        let units = p.process_rtp(packet(&[0x41, 1], 1, 90_000), now, None);
        assert_eq!(units[0].ntp_source, NtpSource::FirstPacket);
        assert_eq!((units[0].ntp - now).num_milliseconds(), 1_000);
    }

    #[test]
    fn test_rtcp_anchor_preferred() {
        let mut p = FormatProcessor::new(0, &h264_format(), &default_ntp_sources());
        let now = Utc::now();

        let base = now - chrono::Duration::seconds(5);
        p.rtcp().handle_sender_report(&webrtc::rtcp::sender_report::SenderReport {
            ssrc: 7,
            ntp_time: crate::rtp::rtcp::datetime_to_ntp(base),
            rtp_time: 0,
            ..Default::default()
        });

        let units = p.process_rtp(idr_packet(0, 90_000), now, None);
        assert_eq!(units[0].ntp_source, NtpSource::Rtcp);
        assert_eq!((units[0].ntp - base).num_milliseconds(), 1_000);
    }
}

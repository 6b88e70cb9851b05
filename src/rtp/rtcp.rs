use std::sync::RwLock;

use chrono::{DateTime, TimeZone, Utc};
use webrtc::rtcp::sender_report::SenderReport;

const UNIX_TO_NTP_EPOCH: i64 = 2_208_988_800;

/// Convert a 64-bit NTP timestamp to wall-clock time.
pub fn ntp_to_datetime(ntp: u64) -> DateTime<Utc> {
    let secs = (ntp >> 32) as i64 - UNIX_TO_NTP_EPOCH;
    let nanos = ((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32;
    Utc.timestamp_opt(secs, nanos as u32)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
}

/// Convert wall-clock time to a 64-bit NTP timestamp.
pub fn datetime_to_ntp(t: DateTime<Utc>) -> u64 {
    let secs = (t.timestamp() + UNIX_TO_NTP_EPOCH) as u64;
    let fraction = ((t.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | fraction
}

#[derive(Debug, Clone, Copy)]
struct SrAnchor {
    ssrc: u32,
    ntp: DateTime<Utc>,
    rtp_ts: u32,
}

/// Maps RTP timestamps to wall-clock time using RTCP Sender Reports.
///
/// Only the most recent report matters, so updates overwrite a single slot;
/// the RTCP receive task publishes into it while the ingest path reads.
pub struct RtcpSync {
    clock_rate: u32,
    anchor: RwLock<Option<SrAnchor>>,
}

impl RtcpSync {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            anchor: RwLock::new(None),
        }
    }

    pub fn handle_sender_report(&self, sr: &SenderReport) {
        let anchor = SrAnchor {
            ssrc: sr.ssrc,
            ntp: ntp_to_datetime(sr.ntp_time),
            rtp_ts: sr.rtp_time,
        };
        if let Ok(mut slot) = self.anchor.write() {
            *slot = Some(anchor);
        }
    }

    pub fn synced(&self) -> bool {
        self.anchor.read().map(|a| a.is_some()).unwrap_or(false)
    }

    pub fn last_ssrc(&self) -> Option<u32> {
        self.anchor.read().ok().and_then(|a| a.map(|a| a.ssrc))
    }

    /// Wall-clock time of an RTP timestamp, if a report has been seen.
    /// The RTP delta is signed 32-bit, so timestamps on either side of a
    /// wrap-around map correctly.
    pub fn packet_ntp(&self, rtp_ts: u32) -> Option<DateTime<Utc>> {
        let anchor = (*self.anchor.read().ok()?)?;
        let diff = rtp_ts.wrapping_sub(anchor.rtp_ts) as i32 as i64;
        let nanos = diff
            .checked_mul(1_000_000_000)?
            .checked_div(self.clock_rate as i64)?;
        anchor
            .ntp
            .checked_add_signed(chrono::Duration::nanoseconds(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ntp_roundtrip() {
        let t = Utc.with_ymd_and_hms(2025, 5, 12, 9, 28, 44).unwrap();
        let back = ntp_to_datetime(datetime_to_ntp(t));
        assert_eq!(back.timestamp(), t.timestamp());
    }

    #[test]
    fn test_no_report_no_mapping() {
        let sync = RtcpSync::new(90_000);
        assert!(!sync.synced());
        assert!(sync.packet_ntp(1234).is_none());
    }

    #[test]
    fn test_forward_mapping() {
        let sync = RtcpSync::new(90_000);
        let base = Utc.with_ymd_and_hms(2025, 5, 12, 9, 0, 0).unwrap();
        sync.handle_sender_report(&SenderReport {
            ssrc: 0x1234,
            ntp_time: datetime_to_ntp(base),
            rtp_time: 90_000,
            ..Default::default()
        });
        assert!(sync.synced());
        // One second of RTP time past the anchor.
        let t = sync.packet_ntp(180_000).unwrap();
        assert_eq!((t - base).num_milliseconds(), 1_000);
        // Half a second before the anchor.
        let t = sync.packet_ntp(45_000).unwrap();
        assert_eq!((t - base).num_milliseconds(), -500);
    }

    #[test]
    fn test_mapping_across_timestamp_wrap() {
        let sync = RtcpSync::new(90_000);
        let base = Utc.with_ymd_and_hms(2025, 5, 12, 9, 0, 0).unwrap();
        sync.handle_sender_report(&SenderReport {
            ssrc: 0x1234,
            ntp_time: datetime_to_ntp(base),
            rtp_time: u32::MAX - 44_999,
            ..Default::default()
        });
        // 45_000 ticks later, on the far side of the wrap.
        let t = sync.packet_ntp(1).unwrap();
        assert_eq!((t - base).num_milliseconds(), 500);
    }

    #[test]
    fn test_latest_report_wins() {
        let sync = RtcpSync::new(90_000);
        let base = Utc.with_ymd_and_hms(2025, 5, 12, 9, 0, 0).unwrap();
        sync.handle_sender_report(&SenderReport {
            ssrc: 1,
            ntp_time: datetime_to_ntp(base),
            rtp_time: 0,
            ..Default::default()
        });
        sync.handle_sender_report(&SenderReport {
            ssrc: 1,
            ntp_time: datetime_to_ntp(base + chrono::Duration::seconds(10)),
            rtp_time: 900_000,
            ..Default::default()
        });
        let t = sync.packet_ntp(900_000).unwrap();
        assert_eq!((t - base).num_seconds(), 10);
    }
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Container variant written by the recorder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// Fragmented MP4: init segment + repeated moof/mdat parts. A crash
    /// mid-segment leaves a truncated but playable file.
    #[default]
    Fmp4,
    /// Plain indexed MP4, finalized only when the segment closes.
    Mp4,
}

/// Where the absolute wall-clock anchor of each access unit comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NtpSource {
    /// RTCP Sender Report mapping (most accurate, needs RTCP).
    Rtcp,
    /// Monotonic clock anchored at the first received packet.
    FirstPacket,
    /// Wall clock sampled at packet arrival.
    Arrival,
}

pub fn default_ntp_sources() -> Vec<NtpSource> {
    vec![NtpSource::Rtcp, NtpSource::FirstPacket, NtpSource::Arrival]
}

/// Fan-out hub tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Per-reader queue capacity. 512 suits WebRTC ingest; pulled RTP
    /// sources typically use 1500.
    #[serde(default = "default_write_queue_size")]
    pub write_queue_size: usize,

    #[serde(default = "default_udp_max_payload_size")]
    pub udp_max_payload_size: usize,

    /// Preference order for unit wall-clock anchoring.
    #[serde(default = "default_ntp_sources")]
    pub ntp_sources: Vec<NtpSource>,
}

fn default_write_queue_size() -> usize {
    512
}

fn default_udp_max_payload_size() -> usize {
    1472
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            write_queue_size: default_write_queue_size(),
            udp_max_payload_size: default_udp_max_payload_size(),
            ntp_sources: default_ntp_sources(),
        }
    }
}

/// Recorder behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    #[serde(default)]
    pub record_format: RecordFormat,

    /// Length of one moof/mdat part inside a segment.
    #[serde(default = "default_part_duration_ms")]
    pub part_duration_ms: u64,

    /// Nominal segment length; the actual boundary waits for the next
    /// random-access sample.
    #[serde(default = "default_segment_duration_ms")]
    pub segment_duration_ms: u64,

    /// Filename template. Tokens: %path, %Y, %m, %d, %H, %M, %S,
    /// %f (microseconds). A numeric suffix is appended on collision.
    #[serde(default = "default_path_format")]
    pub path_format: String,

    /// Cooldown before re-creating a failed recorder instance.
    #[serde(default = "default_restart_pause_ms")]
    pub restart_pause_ms: u64,

    /// Restrict recording to video tracks.
    #[serde(default)]
    pub video_only: bool,
}

fn default_part_duration_ms() -> u64 {
    1_000
}

fn default_segment_duration_ms() -> u64 {
    10_000
}

fn default_restart_pause_ms() -> u64 {
    2_000
}

fn default_path_format() -> String {
    "%path/%Y-%m-%d_%H-%M-%S-%f".to_string()
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            record_format: RecordFormat::default(),
            part_duration_ms: default_part_duration_ms(),
            segment_duration_ms: default_segment_duration_ms(),
            path_format: default_path_format(),
            restart_pause_ms: default_restart_pause_ms(),
            video_only: false,
        }
    }
}

impl RecorderConfig {
    pub fn part_duration(&self) -> Duration {
        Duration::from_millis(self.part_duration_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.path_format.trim().is_empty() {
            anyhow::bail!("path_format cannot be empty");
        }
        if self.part_duration_ms == 0 {
            anyhow::bail!("part_duration_ms must be positive");
        }
        if self.segment_duration_ms < self.part_duration_ms {
            anyhow::bail!("segment_duration_ms must be >= part_duration_ms");
        }
        Ok(())
    }
}

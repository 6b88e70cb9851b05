pub mod g711;
pub mod h264;
pub mod h265;

use bytes::{BufMut, Bytes, BytesMut};

/// Track category.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Codec identity plus the parameters needed to depacketize it and to build
/// its ISO-BMFF sample description. Parameters discovered in-band
/// (SPS/PPS/VPS) are updated on copies held by each consumer; a live
/// recording picks them up at the next init segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    H264 {
        payload_type: u8,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
        packetization_mode: u8,
    },
    H265 {
        payload_type: u8,
        vps: Option<Vec<u8>>,
        sps: Option<Vec<u8>>,
        pps: Option<Vec<u8>>,
    },
    Vp8 {
        payload_type: u8,
    },
    Vp9 {
        payload_type: u8,
    },
    Av1 {
        payload_type: u8,
    },
    Mpeg4Video {
        payload_type: u8,
        config: Option<Vec<u8>>,
    },
    Mjpeg,
    Aac {
        payload_type: u8,
        sample_rate: u32,
        channel_count: u16,
        config: Option<Vec<u8>>,
    },
    Lpcm {
        payload_type: u8,
        bit_depth: u16,
        sample_rate: u32,
        channel_count: u16,
    },
    Opus {
        payload_type: u8,
        channel_count: u16,
    },
    G711 {
        payload_type: u8,
        mu_law: bool,
        sample_rate: u32,
        channel_count: u16,
    },
    G722,
    Mpeg1Audio,
}

impl Format {
    pub fn kind(&self) -> MediaKind {
        match self {
            Format::H264 { .. }
            | Format::H265 { .. }
            | Format::Vp8 { .. }
            | Format::Vp9 { .. }
            | Format::Av1 { .. }
            | Format::Mpeg4Video { .. }
            | Format::Mjpeg => MediaKind::Video,
            _ => MediaKind::Audio,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Format::H264 { payload_type, .. }
            | Format::H265 { payload_type, .. }
            | Format::Vp8 { payload_type }
            | Format::Vp9 { payload_type }
            | Format::Av1 { payload_type }
            | Format::Mpeg4Video { payload_type, .. }
            | Format::Aac { payload_type, .. }
            | Format::Lpcm { payload_type, .. }
            | Format::Opus { payload_type, .. }
            | Format::G711 { payload_type, .. } => *payload_type,
            Format::Mjpeg => 26,
            Format::G722 => 9,
            Format::Mpeg1Audio => 14,
        }
    }

    /// RTP clock rate, which is also the track time-scale.
    pub fn clock_rate(&self) -> u32 {
        match self {
            Format::H264 { .. }
            | Format::H265 { .. }
            | Format::Vp8 { .. }
            | Format::Vp9 { .. }
            | Format::Av1 { .. }
            | Format::Mpeg4Video { .. }
            | Format::Mjpeg
            | Format::Mpeg1Audio => 90_000,
            Format::Opus { .. } => 48_000,
            Format::Aac { sample_rate, .. } => *sample_rate,
            Format::Lpcm { sample_rate, .. } => *sample_rate,
            Format::G711 { sample_rate, .. } => *sample_rate,
            Format::G722 => 8_000,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::H264 { .. } => "H264",
            Format::H265 { .. } => "H265",
            Format::Vp8 { .. } => "VP8",
            Format::Vp9 { .. } => "VP9",
            Format::Av1 { .. } => "AV1",
            Format::Mpeg4Video { .. } => "MPEG-4 Video",
            Format::Mjpeg => "M-JPEG",
            Format::Aac { .. } => "AAC",
            Format::Lpcm { .. } => "LPCM",
            Format::Opus { .. } => "Opus",
            Format::G711 { mu_law: true, .. } => "G711 PCMU",
            Format::G711 { mu_law: false, .. } => "G711 PCMA",
            Format::G722 => "G722",
            Format::Mpeg1Audio => "MPEG-1 Audio",
        }
    }

    /// Whether the recorder can express this codec in an ISO-BMFF track.
    /// Everything else still flows through the fan-out for live readers.
    pub fn is_recordable(&self) -> bool {
        !matches!(
            self,
            Format::Vp8 { .. } | Format::Vp9 { .. } | Format::Av1 { .. } | Format::G722
        )
    }

    /// Build a format descriptor from a WebRTC track's codec parameters.
    /// Dynamic payload types are never guessed from RTP alone; the caller
    /// must hand over what SDP negotiated.
    pub fn from_webrtc_mime(
        mime_type: &str,
        payload_type: u8,
        fmtp_line: &str,
        channels: u16,
    ) -> Option<Format> {
        match mime_type.to_ascii_lowercase().as_str() {
            "video/h264" => Some(Format::H264 {
                payload_type,
                sps: None,
                pps: None,
                packetization_mode: 1,
            }),
            "video/h265" => Some(Format::H265 {
                payload_type,
                vps: None,
                sps: None,
                pps: None,
            }),
            "video/vp8" => Some(Format::Vp8 { payload_type }),
            "video/vp9" => Some(Format::Vp9 { payload_type }),
            "video/av1" => Some(Format::Av1 { payload_type }),
            "audio/opus" => Some(Format::Opus {
                payload_type,
                channel_count: if fmtp_line.contains("stereo=1") { 2 } else { 1 },
            }),
            "audio/pcmu" => Some(Format::G711 {
                payload_type,
                mu_law: true,
                sample_rate: 8_000,
                channel_count: if channels > 0 { channels } else { 1 },
            }),
            "audio/pcma" => Some(Format::G711 {
                payload_type,
                mu_law: false,
                sample_rate: 8_000,
                channel_count: if channels > 0 { channels } else { 1 },
            }),
            "audio/g722" => Some(Format::G722),
            _ => None,
        }
    }
}

/// One media section of the ingest description: a numeric id plus the
/// formats negotiated for it.
#[derive(Debug, Clone)]
pub struct MediaDescription {
    pub id: usize,
    pub kind: MediaKind,
    pub formats: Vec<Format>,
}

/// Convert an access unit into the 4-byte length-prefixed layout ISO-BMFF
/// samples use.
pub fn nal_units_to_length_prefixed(au: &[Bytes]) -> Bytes {
    let total: usize = au.iter().map(|n| 4 + n.len()).sum();
    let mut out = BytesMut::with_capacity(total);
    for nalu in au {
        out.put_u32(nalu.len() as u32);
        out.put_slice(nalu);
    }
    out.freeze()
}

/// Derives decode timestamps for codecs whose presentation order differs
/// from decode order (B-frames).
///
/// Presentation timestamps are queued into a window of `depth` entries;
/// once the window is full, the smallest in-flight PTS is the DTS of the
/// sample that just arrived. While the window fills, DTS counts up from
/// `first_pts - depth * frame_duration`. A PTS that would force DTS
/// backwards is a recoverable error: the caller drops the access unit and
/// re-initializes at the next random-access point, where
/// [`DtsExtractor::suggested_depth`] gives a window size that would have
/// accommodated the stream seen so far.
pub struct DtsExtractor {
    depth: usize,
    pending: Vec<i64>,
    first_pts: Option<i64>,
    prev_pts: Option<i64>,
    prev_dts: Option<i64>,
    frame_duration: i64,
    suggested_depth: usize,
}

/// DTS derivation failure; drop the access unit and re-initialize at the
/// next random-access point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonMonotoneDts {
    pub pts: i64,
    pub prev_dts: i64,
}

impl std::fmt::Display for NonMonotoneDts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unable to derive a monotone DTS (pts {} after dts {})",
            self.pts, self.prev_dts
        )
    }
}

impl std::error::Error for NonMonotoneDts {}

// Used when no inter-frame spacing has been observed yet (90 kHz, 30 fps).
const FALLBACK_FRAME_DURATION: i64 = 3_000;

impl DtsExtractor {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            pending: Vec::with_capacity(depth + 1),
            first_pts: None,
            prev_pts: None,
            prev_dts: None,
            frame_duration: 0,
            suggested_depth: depth,
        }
    }

    /// Window size that would have handled every reordering observed so far.
    pub fn suggested_depth(&self) -> usize {
        self.suggested_depth
    }

    pub fn extract(&mut self, pts: i64) -> Result<i64, NonMonotoneDts> {
        if let Some(prev) = self.prev_pts {
            let delta = (pts - prev).abs();
            if delta > 0 && (self.frame_duration == 0 || delta < self.frame_duration) {
                self.frame_duration = delta;
            }
        }
        self.prev_pts = Some(pts);
        let first = *self.first_pts.get_or_insert(pts);

        let dts = if self.depth == 0 {
            pts
        } else {
            self.pending.push(pts);
            if self.pending.len() <= self.depth {
                let fd = if self.frame_duration > 0 {
                    self.frame_duration
                } else {
                    FALLBACK_FRAME_DURATION
                };
                let remaining = (self.depth + 1 - self.pending.len()) as i64;
                // The spacing estimate may shrink while the window fills;
                // never step backwards because of it.
                let candidate = first - remaining * fd;
                match self.prev_dts {
                    Some(prev) => candidate.max(prev + 1),
                    None => candidate,
                }
            } else {
                let (idx, _) = self
                    .pending
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, v)| **v)
                    .expect("window is non-empty");
                self.pending.swap_remove(idx)
            }
        };

        match self.prev_dts {
            Some(prev) if dts <= prev => {
                self.suggested_depth = self.depth + 1;
                Err(NonMonotoneDts { pts, prev_dts: prev })
            }
            _ => {
                self.prev_dts = Some(dts);
                Ok(dts)
            }
        }
    }
}

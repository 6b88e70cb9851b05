pub mod fmp4;
pub mod mp4;

use anyhow::Result;
use bytes::Bytes;

use crate::codec::h264;

/// One media sample handed to a muxer. The payload is resolved lazily so
/// large samples are not held in memory past the moment they are written.
pub struct Sample {
    pub dts: i64,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload_size: u32,
    pub get_payload: PayloadGetter,
}

pub type PayloadGetter = Box<dyn FnOnce() -> Result<Bytes> + Send>;

impl Sample {
    pub fn from_bytes(dts: i64, pts_offset: i32, is_non_sync: bool, payload: Bytes) -> Self {
        Self {
            dts,
            pts_offset,
            is_non_sync,
            payload_size: payload.len() as u32,
            get_payload: Box::new(move || Ok(payload)),
        }
    }
}

/// Codec-specific sample description data for one track.
#[derive(Debug, Clone)]
pub enum TrackCodec {
    H264 {
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    H265 {
        vps: Vec<u8>,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    Mpeg4Video {
        config: Vec<u8>,
        width: u32,
        height: u32,
    },
    Mjpeg {
        width: u32,
        height: u32,
    },
    Aac {
        config: Option<Vec<u8>>,
        sample_rate: u32,
        channel_count: u16,
    },
    Opus {
        channel_count: u16,
    },
    Lpcm {
        bit_depth: u16,
        sample_rate: u32,
        channel_count: u16,
    },
    Mpeg1Audio,
}

impl TrackCodec {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            TrackCodec::H264 { .. }
                | TrackCodec::H265 { .. }
                | TrackCodec::Mpeg4Video { .. }
                | TrackCodec::Mjpeg { .. }
        )
    }

    /// Pixel dimensions for the visual sample entry; parameter sets win,
    /// then declared values, then a placeholder.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            TrackCodec::H264 { sps, .. } => h264::parse_sps(sps)
                .map(|i| (i.width, i.height))
                .unwrap_or((1280, 720)),
            TrackCodec::H265 { sps, .. } => crate::codec::h265::parse_sps(sps)
                .map(|i| (i.width, i.height))
                .unwrap_or((1280, 720)),
            TrackCodec::Mpeg4Video { width, height, .. }
            | TrackCodec::Mjpeg { width, height } => (*width, *height),
            _ => (0, 0),
        }
    }
}

/// Everything the muxer needs to describe one track in the init segment.
#[derive(Debug, Clone)]
pub struct TrackInit {
    pub id: u32,
    pub time_scale: u32,
    pub codec: TrackCodec,
}

// ======================= box-building helpers ==============================

pub(crate) fn make_box(typ: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(8 + payload.len());
    let size = (8 + payload.len()) as u32;
    v.extend_from_slice(&size.to_be_bytes());
    v.extend_from_slice(typ);
    v.extend_from_slice(payload);
    v
}

pub(crate) fn make_full_box(typ: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.extend_from_slice(&(((version as u32) << 24) | (flags & 0x00FF_FFFF)).to_be_bytes());
    body.extend_from_slice(payload);
    make_box(typ, &body)
}

pub(crate) fn unity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes()); // a
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes()); // d
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes()); // w
    m
}

/// MPEG-4 descriptor with base-128 expandable length.
fn put_descriptor(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    let mut len = content.len();
    let mut stack = Vec::new();
    loop {
        stack.push((len & 0x7F) as u8);
        len >>= 7;
        if len == 0 {
            break;
        }
    }
    while stack.len() > 1 {
        out.push(stack.pop().unwrap() | 0x80);
    }
    out.push(stack.pop().unwrap());
    out.extend_from_slice(content);
}

/// Elementary stream descriptor box shared by MPEG-flavored codecs.
pub(crate) fn build_esds(
    track_id: u32,
    object_type: u8,
    is_video: bool,
    decoder_config: &[u8],
) -> Vec<u8> {
    let stream_type = if is_video { 0x04u8 } else { 0x05u8 };

    let mut dcd = Vec::new();
    dcd.push(object_type);
    dcd.push((stream_type << 2) | 0x01); // streamType + reserved
    dcd.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    dcd.extend_from_slice(&0u32.to_be_bytes()); // maxBitrate
    dcd.extend_from_slice(&0u32.to_be_bytes()); // avgBitrate
    if !decoder_config.is_empty() {
        put_descriptor(&mut dcd, 0x05, decoder_config);
    }

    let mut es = Vec::new();
    es.extend_from_slice(&(track_id as u16).to_be_bytes());
    es.push(0); // flags
    put_descriptor(&mut es, 0x04, &dcd);
    put_descriptor(&mut es, 0x06, &[0x02]);

    let mut payload = Vec::new();
    put_descriptor(&mut payload, 0x03, &es);
    make_full_box(b"esds", 0, 0, &payload)
}

/// AudioSpecificConfig for AAC-LC, used when SDP carried no explicit one.
pub(crate) fn synthesize_aac_config(sample_rate: u32, channel_count: u16) -> Vec<u8> {
    const RATES: [u32; 13] = [
        96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
        8_000, 7_350,
    ];
    let freq_index = RATES
        .iter()
        .position(|&r| r == sample_rate)
        .unwrap_or(3) as u16;
    let v: u16 = (2 << 11) | (freq_index << 7) | ((channel_count & 0x0F) << 3);
    v.to_be_bytes().to_vec()
}

/// The codec-specific sample entry that goes into stsd.
pub(crate) fn build_sample_entry(track: &TrackInit) -> Vec<u8> {
    match &track.codec {
        TrackCodec::H264 { sps, pps } => {
            let avcc = make_box(b"avcC", &h264::build_avc_decoder_config(sps, pps));
            visual_sample_entry(b"avc1", track.codec.dimensions(), &avcc)
        }
        TrackCodec::H265 { vps, sps, pps } => {
            let hvcc_payload = crate::codec::h265::build_hevc_decoder_config(vps, sps, pps)
                .unwrap_or_default();
            let hvcc = make_box(b"hvcC", &hvcc_payload);
            visual_sample_entry(b"hvc1", track.codec.dimensions(), &hvcc)
        }
        TrackCodec::Mpeg4Video { config, .. } => {
            let esds = build_esds(track.id, 0x20, true, config);
            visual_sample_entry(b"mp4v", track.codec.dimensions(), &esds)
        }
        TrackCodec::Mjpeg { .. } => {
            let esds = build_esds(track.id, 0x6C, true, &[]);
            visual_sample_entry(b"mp4v", track.codec.dimensions(), &esds)
        }
        TrackCodec::Aac {
            config,
            sample_rate,
            channel_count,
        } => {
            let asc = config
                .clone()
                .unwrap_or_else(|| synthesize_aac_config(*sample_rate, *channel_count));
            let esds = build_esds(track.id, 0x40, false, &asc);
            audio_sample_entry(b"mp4a", *channel_count, 16, *sample_rate, &esds)
        }
        TrackCodec::Opus { channel_count } => {
            let mut dops = Vec::with_capacity(11);
            dops.push(0); // version
            dops.push(*channel_count as u8);
            dops.extend_from_slice(&312u16.to_be_bytes()); // pre-skip
            dops.extend_from_slice(&48_000u32.to_be_bytes());
            dops.extend_from_slice(&0i16.to_be_bytes()); // output gain
            dops.push(0); // channel mapping family
            let dops = make_box(b"dOps", &dops);
            audio_sample_entry(b"Opus", *channel_count, 16, 48_000, &dops)
        }
        TrackCodec::Lpcm {
            bit_depth,
            sample_rate,
            channel_count,
        } => {
            // Big-endian signed PCM.
            let mut pcmc = Vec::with_capacity(2);
            pcmc.push(0); // format flags
            pcmc.push(*bit_depth as u8);
            let pcmc = make_full_box(b"pcmC", 0, 0, &pcmc);
            audio_sample_entry(b"ipcm", *channel_count, *bit_depth, *sample_rate, &pcmc)
        }
        TrackCodec::Mpeg1Audio => {
            let esds = build_esds(track.id, 0x6B, false, &[]);
            audio_sample_entry(b"mp4a", 2, 16, 48_000, &esds)
        }
    }
}

fn visual_sample_entry(fourcc: &[u8; 4], (width, height): (u32, u32), codec_box: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(78 + codec_box.len());
    payload.extend_from_slice(&[0u8; 6]); // reserved
    payload.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index

    payload.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    payload.extend_from_slice(&[0u8; 12]); // pre_defined[3]

    payload.extend_from_slice(&(width as u16).to_be_bytes());
    payload.extend_from_slice(&(height as u16).to_be_bytes());

    payload.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // horizresolution 72dpi
    payload.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // vertresolution

    payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
    payload.extend_from_slice(&1u16.to_be_bytes()); // frame_count
    payload.extend_from_slice(&[0u8; 32]); // compressorname
    payload.extend_from_slice(&0x0018u16.to_be_bytes()); // depth
    payload.extend_from_slice(&0xFFFFu16.to_be_bytes()); // pre_defined

    payload.extend_from_slice(codec_box);
    make_box(fourcc, &payload)
}

fn audio_sample_entry(
    fourcc: &[u8; 4],
    channel_count: u16,
    sample_size: u16,
    sample_rate: u32,
    codec_box: &[u8],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(28 + codec_box.len());
    payload.extend_from_slice(&[0u8; 6]); // reserved
    payload.extend_from_slice(&1u16.to_be_bytes()); // data_reference_index

    payload.extend_from_slice(&[0u8; 8]); // reserved
    payload.extend_from_slice(&channel_count.to_be_bytes());
    payload.extend_from_slice(&sample_size.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    payload.extend_from_slice(&(sample_rate << 16).to_be_bytes()); // 16.16

    payload.extend_from_slice(codec_box);
    make_box(fourcc, &payload)
}

#[cfg(test)]
pub(crate) fn walk_boxes(data: &[u8]) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let typ = String::from_utf8_lossy(&data[offset + 4..offset + 8]).to_string();
        out.push((typ, size));
        if size < 8 {
            break;
        }
        offset += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::testdata::{PPS, SPS_640X480_POC2};

    #[test]
    fn test_make_box() {
        let b = make_box(b"free", &[1, 2, 3]);
        assert_eq!(&b[..4], &11u32.to_be_bytes());
        assert_eq!(&b[4..8], b"free");
        assert_eq!(&b[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_descriptor_long_length() {
        let mut out = Vec::new();
        put_descriptor(&mut out, 0x05, &vec![0u8; 300]);
        assert_eq!(out[0], 0x05);
        // 300 = 0b10_0101100: two length bytes.
        assert_eq!(out[1], 0x82);
        assert_eq!(out[2], 0x2C);
        assert_eq!(out.len(), 3 + 300);
    }

    #[test]
    fn test_avc1_sample_entry_carries_dimensions() {
        let track = TrackInit {
            id: 1,
            time_scale: 90_000,
            codec: TrackCodec::H264 {
                sps: SPS_640X480_POC2.to_vec(),
                pps: PPS.to_vec(),
            },
        };
        let entry = build_sample_entry(&track);
        assert_eq!(&entry[4..8], b"avc1");
        // width/height at fixed offsets inside the visual entry body.
        let width = u16::from_be_bytes([entry[8 + 24], entry[8 + 25]]);
        let height = u16::from_be_bytes([entry[8 + 26], entry[8 + 27]]);
        assert_eq!((width, height), (640, 480));
        let tail = &entry[entry.len() - 4..];
        assert_ne!(tail, b"avcC"); // avcC is embedded, not trailing
        assert!(entry.windows(4).any(|w| w == b"avcC"));
    }

    #[test]
    fn test_aac_config_synthesis() {
        // 48 kHz stereo AAC-LC: 0b00010_0011_0010_000 -> 0x11 0x90.
        assert_eq!(synthesize_aac_config(48_000, 2), vec![0x11, 0x90]);
    }

    #[test]
    fn test_opus_sample_entry() {
        let track = TrackInit {
            id: 2,
            time_scale: 48_000,
            codec: TrackCodec::Opus { channel_count: 2 },
        };
        let entry = build_sample_entry(&track);
        assert_eq!(&entry[4..8], b"Opus");
        assert!(entry.windows(4).any(|w| w == b"dOps"));
    }
}

//! End-to-end pipeline tests: RTP packets in, segment files out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use webrtc::rtp::packet::Packet;

use mediasink::codec::{Format, MediaDescription, MediaKind};
use mediasink::config::{RecordFormat, RecorderConfig, StreamConfig};
use mediasink::recorder::Recorder;
use mediasink::stream::Stream;

/// 640x480 Baseline, pic_order_cnt_type 2.
const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1E, 0xDA, 0x02, 0x80, 0xF4, 0x40];
const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];

fn h264_media() -> MediaDescription {
    MediaDescription {
        id: 0,
        kind: MediaKind::Video,
        formats: vec![Format::H264 {
            payload_type: 96,
            sps: None,
            pps: None,
            packetization_mode: 1,
        }],
    }
}

fn rtp(seq: u16, ts: u32, marker: bool, payload: Vec<u8>) -> Packet {
    let mut pkt = Packet::default();
    pkt.header.version = 2;
    pkt.header.payload_type = 96;
    pkt.header.sequence_number = seq;
    pkt.header.timestamp = ts;
    pkt.header.marker = marker;
    pkt.header.ssrc = 0xDECAFBAD;
    pkt.payload = Bytes::from(payload);
    pkt
}

/// STAP-A aggregate of SPS + PPS + IDR slice.
fn idr_payload() -> Vec<u8> {
    let idr: &[u8] = &[0x65, 0x88, 0x84, 0x21, 0xA0];
    let mut payload = vec![0x78];
    for nalu in [SPS, PPS, idr] {
        payload.extend_from_slice(&(nalu.len() as u16).to_be_bytes());
        payload.extend_from_slice(nalu);
    }
    payload
}

fn non_idr_payload(tag: u8) -> Vec<u8> {
    vec![0x41, 0x9A, tag]
}

fn walk_boxes(data: &[u8]) -> Vec<(String, usize, usize)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 8 <= data.len() {
        let size = u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        let typ = String::from_utf8_lossy(&data[offset + 4..offset + 8]).to_string();
        out.push((typ, size, offset));
        if size < 8 {
            break;
        }
        offset += size;
    }
    out
}

struct TrunInfo {
    sample_count: u32,
    data_offset: u32,
    /// (duration, size, flags, cts) per sample.
    samples: Vec<(u32, u32, u32, i32)>,
}

fn parse_truns(data: &[u8]) -> Vec<TrunInfo> {
    let mut out = Vec::new();
    for pos in 0..data.len().saturating_sub(4) {
        if &data[pos..pos + 4] != b"trun" {
            continue;
        }
        let count = u32::from_be_bytes(data[pos + 8..pos + 12].try_into().unwrap());
        let data_offset = u32::from_be_bytes(data[pos + 12..pos + 16].try_into().unwrap());
        let mut samples = Vec::new();
        let mut cursor = pos + 16;
        for _ in 0..count {
            let duration = u32::from_be_bytes(data[cursor..cursor + 4].try_into().unwrap());
            let size = u32::from_be_bytes(data[cursor + 4..cursor + 8].try_into().unwrap());
            let flags = u32::from_be_bytes(data[cursor + 8..cursor + 12].try_into().unwrap());
            let cts = i32::from_be_bytes(data[cursor + 12..cursor + 16].try_into().unwrap());
            samples.push((duration, size, flags, cts));
            cursor += 16;
        }
        out.push(TrunInfo {
            sample_count: count,
            data_offset,
            samples,
        });
    }
    out
}

fn split_length_prefixed(mut data: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while data.len() >= 4 {
        let len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        out.push(data[4..4 + len].to_vec());
        data = &data[4 + len..];
    }
    out
}

struct Harness {
    stream: Stream,
    recorder: Recorder,
    created: Arc<Mutex<Vec<PathBuf>>>,
    completed: Arc<Mutex<Vec<(PathBuf, Duration)>>>,
}

fn harness(dir: &std::path::Path, cfg: RecorderConfig, medias: Vec<MediaDescription>) -> Harness {
    let stream = Stream::new(StreamConfig::default(), medias);
    let cfg = RecorderConfig {
        path_format: format!("{}/{}", dir.display(), cfg.path_format),
        ..cfg
    };
    let mut recorder = Recorder::new(stream.clone(), cfg, "cam1");

    let created = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(Mutex::new(Vec::new()));
    let created_cb = created.clone();
    recorder.on_segment_create = Some(Arc::new(move |path: &std::path::Path| {
        created_cb.lock().unwrap().push(path.to_path_buf());
    }));
    let completed_cb = completed.clone();
    recorder.on_segment_complete =
        Some(Arc::new(move |path: &std::path::Path, duration: Duration| {
            completed_cb.lock().unwrap().push((path.to_path_buf(), duration));
        }));

    Harness {
        stream,
        recorder,
        created,
        completed,
    }
}

// Scenario: 1 second of 30 fps H.264, one NAL per packet, IDR first.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_h264_single_segment_recording() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(
        dir.path(),
        RecorderConfig::default(),
        vec![h264_media()],
    );
    h.recorder.initialize().unwrap();

    let now = Utc::now();
    h.stream.write_rtp_packet(0, 96, rtp(0, 0, true, idr_payload()), now, None);
    for i in 1..30u16 {
        h.stream.write_rtp_packet(
            0,
            96,
            rtp(i, i as u32 * 3000, true, non_idr_payload(i as u8)),
            now,
            None,
        );
    }
    h.recorder.close().await;

    let created = h.created.lock().unwrap().clone();
    let completed = h.completed.lock().unwrap().clone();
    assert_eq!(created.len(), 1, "one segment expected");
    assert_eq!(completed.len(), 1);
    assert_eq!(created[0], completed[0].0);
    assert!((completed[0].1.as_secs_f64() - 1.0).abs() < 1e-6);

    let data = std::fs::read(&created[0]).unwrap();
    let boxes = walk_boxes(&data);
    let types: Vec<&str> = boxes.iter().map(|(t, _, _)| t.as_str()).collect();
    assert_eq!(types, vec!["ftyp", "moov", "moof", "mdat"]);

    let truns = parse_truns(&data);
    assert_eq!(truns.len(), 1);
    assert_eq!(truns[0].sample_count, 30);
    for (i, (duration, _, flags, cts)) in truns[0].samples.iter().enumerate() {
        assert_eq!(*duration, 3000, "sample {i} duration");
        assert_eq!(*cts, 0, "sample {i} pts offset");
        if i == 0 {
            assert_eq!(*flags, 0x0200_0000, "first sample must be sync");
        } else {
            assert_eq!(*flags, 0x0101_0000);
        }
    }

    // Round-trip: the first sample's NAL units equal the RTP input.
    let (_, mdat_size, mdat_pos) = boxes
        .iter()
        .find(|(t, _, _)| t == "mdat")
        .cloned()
        .unwrap();
    let payload_start = mdat_pos + 8;
    assert_eq!(
        truns[0].data_offset as usize,
        payload_start - boxes.iter().find(|(t, _, _)| t == "moof").unwrap().2
    );
    let first_size = truns[0].samples[0].1 as usize;
    let nalus = split_length_prefixed(&data[payload_start..payload_start + first_size]);
    assert_eq!(nalus.len(), 3);
    assert_eq!(nalus[0], SPS);
    assert_eq!(nalus[1], PPS);
    assert_eq!(nalus[2], &[0x65, 0x88, 0x84, 0x21, 0xA0]);

    let total: usize = truns[0].samples.iter().map(|(_, s, _, _)| *s as usize).sum();
    assert_eq!(mdat_size, 8 + total);
}

// Scenario: 4 seconds, IDR every second, 2-second segments.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_segment_rotation_on_keyframes() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RecorderConfig {
        segment_duration_ms: 2_000,
        ..Default::default()
    };
    let mut h = harness(dir.path(), cfg, vec![h264_media()]);
    h.recorder.initialize().unwrap();

    let now = Utc::now();
    for i in 0..120u16 {
        let ts = i as u32 * 3000;
        let payload = if i % 30 == 0 {
            idr_payload()
        } else {
            non_idr_payload(i as u8)
        };
        h.stream.write_rtp_packet(0, 96, rtp(i, ts, true, payload), now, None);
    }
    h.recorder.close().await;

    let created = h.created.lock().unwrap().clone();
    let completed = h.completed.lock().unwrap().clone();
    assert_eq!(created.len(), 2, "two segments expected");
    assert_eq!(completed.len(), 2);
    for (_, duration) in &completed {
        assert!((duration.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    for path in &created {
        let data = std::fs::read(path).unwrap();
        let boxes = walk_boxes(&data);
        assert_eq!(boxes[0].0, "ftyp");
        // First video sample of every segment is a sync sample.
        let truns = parse_truns(&data);
        assert!(!truns.is_empty());
        assert_eq!(truns[0].samples[0].2, 0x0200_0000);
        // 2 s of samples per segment across its parts.
        let total: u32 = truns.iter().map(|t| t.sample_count).sum();
        assert_eq!(total, 60);
        // 1 s parts: at least two fragments per segment.
        assert!(truns.len() >= 2, "expected multiple parts, got {}", truns.len());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_mp4_recording() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RecorderConfig {
        record_format: RecordFormat::Mp4,
        ..Default::default()
    };
    let mut h = harness(dir.path(), cfg, vec![h264_media()]);
    h.recorder.initialize().unwrap();

    let now = Utc::now();
    h.stream.write_rtp_packet(0, 96, rtp(0, 0, true, idr_payload()), now, None);
    for i in 1..30u16 {
        h.stream.write_rtp_packet(
            0,
            96,
            rtp(i, i as u32 * 3000, true, non_idr_payload(i as u8)),
            now,
            None,
        );
    }
    h.recorder.close().await;

    let created = h.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    let data = std::fs::read(&created[0]).unwrap();
    let types: Vec<String> = walk_boxes(&data).into_iter().map(|(t, _, _)| t).collect();
    assert_eq!(types, vec!["ftyp", "moov", "mdat"]);

    // stsz: 30 samples.
    let stsz_pos = data.windows(4).position(|w| w == b"stsz").unwrap();
    let count = u32::from_be_bytes(data[stsz_pos + 12..stsz_pos + 16].try_into().unwrap());
    assert_eq!(count, 30);
}

// Reordered input must still produce an in-order recording.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_order_packets_recorded_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path(), RecorderConfig::default(), vec![h264_media()]);
    h.recorder.initialize().unwrap();

    let now = Utc::now();
    h.stream.write_rtp_packet(0, 96, rtp(100, 0, true, idr_payload()), now, None);
    // 102 before 101.
    h.stream
        .write_rtp_packet(0, 96, rtp(102, 6000, true, non_idr_payload(2)), now, None);
    h.stream
        .write_rtp_packet(0, 96, rtp(101, 3000, true, non_idr_payload(1)), now, None);
    for i in 3..5u16 {
        h.stream.write_rtp_packet(
            0,
            96,
            rtp(100 + i, i as u32 * 3000, true, non_idr_payload(i as u8)),
            now,
            None,
        );
    }
    h.recorder.close().await;

    let created = h.created.lock().unwrap().clone();
    let data = std::fs::read(&created[0]).unwrap();
    let truns = parse_truns(&data);
    assert_eq!(truns[0].sample_count, 5);
    // Strictly increasing DTS shows as uniform durations here.
    for (duration, _, _, _) in &truns[0].samples {
        assert_eq!(*duration, 3000);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_video_and_audio_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let medias = vec![
        h264_media(),
        MediaDescription {
            id: 1,
            kind: MediaKind::Audio,
            formats: vec![Format::Opus {
                payload_type: 111,
                channel_count: 2,
            }],
        },
    ];
    let cfg = RecorderConfig {
        segment_duration_ms: 2_000,
        ..Default::default()
    };
    let mut h = harness(dir.path(), cfg, medias);
    h.recorder.initialize().unwrap();

    let now = Utc::now();
    for i in 0..60u16 {
        let ts = i as u32 * 3000;
        let payload = if i % 30 == 0 {
            idr_payload()
        } else {
            non_idr_payload(i as u8)
        };
        h.stream.write_rtp_packet(0, 96, rtp(i, ts, true, payload), now, None);
        // 20 ms Opus frames riding alongside.
        let mut opus = rtp(i, i as u32 * 960, false, vec![0xFC, 0x01, i as u8]);
        opus.header.payload_type = 111;
        h.stream.write_rtp_packet(1, 111, opus, now, None);
    }
    h.recorder.close().await;

    let created = h.created.lock().unwrap().clone();
    assert_eq!(created.len(), 1);
    let data = std::fs::read(&created[0]).unwrap();

    // Two tracks in the init, audio samples in the fragments.
    assert_eq!(data.windows(4).filter(|w| w == b"trak").count(), 2);
    assert!(data.windows(4).any(|w| w == b"Opus"));
    let traf_count = data.windows(4).filter(|w| w == b"traf").count();
    assert!(traf_count >= 2, "audio and video trafs expected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_fails_without_recordable_tracks() {
    let dir = tempfile::tempdir().unwrap();
    let medias = vec![MediaDescription {
        id: 0,
        kind: MediaKind::Video,
        formats: vec![Format::Vp8 { payload_type: 97 }],
    }];
    let mut h = harness(dir.path(), RecorderConfig::default(), medias);
    assert!(h.recorder.initialize().is_err());
    assert!(h.created.lock().unwrap().is_empty());
}

// The H.264 depacketizer round-trips a fragmented stream exactly.
#[test]
fn test_depacketizer_round_trip() {
    use mediasink::rtp::h264::H264Depacketizer;
    use mediasink::rtp::{DepacketizeError, Depacketizer, UnitPayload};

    let big_nalu: Vec<u8> = {
        let mut n = vec![0x65];
        n.extend((0..3000u32).map(|i| i as u8));
        n
    };

    // Fragment the IDR into three FU-A packets.
    let chunks: Vec<&[u8]> = vec![&big_nalu[1..1001], &big_nalu[1001..2001], &big_nalu[2001..]];
    let mut depack = H264Depacketizer::new();
    let mut units = Vec::new();

    let mut feed = |payload: Vec<u8>, seq: u16, marker: bool| {
        let pkt = rtp(seq, 9000, marker, payload);
        match depack.depacketize(&pkt) {
            Ok(us) => units.extend(us),
            Err(DepacketizeError::MorePacketsNeeded) => {}
            Err(e) => panic!("unexpected: {e}"),
        }
    };

    for (i, chunk) in chunks.iter().enumerate() {
        let mut payload = vec![0x7C];
        let mut fu_header = 0x05u8;
        if i == 0 {
            fu_header |= 0x80;
        }
        if i + 1 == chunks.len() {
            fu_header |= 0x40;
        }
        payload.push(fu_header);
        payload.extend_from_slice(chunk);
        feed(payload, i as u16, i + 1 == chunks.len());
    }

    assert_eq!(units.len(), 1);
    match &units[0].payload {
        UnitPayload::NalUnits(nalus) => {
            assert_eq!(nalus.len(), 1);
            assert_eq!(&nalus[0][..], &big_nalu[..]);
        }
        _ => panic!("expected NAL units"),
    }
}

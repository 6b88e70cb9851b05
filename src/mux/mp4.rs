//! Plain (non-fragmented) MP4 muxer. Samples are collected per track and
//! the whole presentation - ftyp, moov with full sample tables, mdat - is
//! marshaled once on flush. Used when `record_format: mp4`; unlike the
//! fragmented variant, a crash before flush loses the segment.

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;

use super::{build_sample_entry, make_box, make_full_box, PayloadGetter, Sample, TrackInit};

struct QueuedSample {
    duration: u32,
    pts_offset: i32,
    is_non_sync: bool,
    payload_size: u32,
    get_payload: Option<PayloadGetter>,
}

struct Mp4Track {
    init: TrackInit,
    time_offset: i32,
    last_dts: i64,
    samples: Vec<QueuedSample>,
}

/// Indexed MP4 writer with the sample-acceptance rules shared with the
/// segment recorder: group-of-pictures before the first keyframe are
/// discarded, each sample's duration is back-filled from its successor,
/// and sync samples never carry a composition offset.
pub struct Mp4Muxer<W: Write> {
    w: W,
    tracks: Vec<Mp4Track>,
    current: Option<usize>,
}

impl<W: Write> Mp4Muxer<W> {
    pub fn new(w: W) -> Self {
        Self {
            w,
            tracks: Vec::new(),
            current: None,
        }
    }

    pub fn write_init(&mut self, tracks: Vec<TrackInit>) {
        self.tracks = tracks
            .into_iter()
            .map(|init| Mp4Track {
                init,
                time_offset: 0,
                last_dts: 0,
                samples: Vec::new(),
            })
            .collect();
        self.current = None;
    }

    pub fn set_track(&mut self, track_id: u32) -> Result<()> {
        self.current = Some(
            self.tracks
                .iter()
                .position(|t| t.init.id == track_id)
                .ok_or_else(|| anyhow!("unknown track {track_id}"))?,
        );
        Ok(())
    }

    pub fn last_dts(&self) -> Option<i64> {
        self.current.map(|i| self.tracks[i].last_dts)
    }

    pub fn write_sample(&mut self, sample: Sample) -> Result<()> {
        let track = self
            .current
            .map(|i| &mut self.tracks[i])
            .ok_or_else(|| anyhow!("no current track"))?;

        let Sample {
            dts,
            mut pts_offset,
            is_non_sync,
            payload_size,
            get_payload,
        } = sample;

        // Drop groups of pictures that precede the first usable keyframe.
        if (dts < 0 || (dts >= 0 && track.last_dts < 0)) && !is_non_sync {
            track.samples.clear();
        }

        if track.samples.is_empty() {
            track.time_offset = dts as i32;
        } else {
            let diff = (dts - track.last_dts).max(0);
            let last = track.samples.last_mut().expect("non-empty");
            last.duration = diff as u32;
        }

        // A leading keyframe with an edit-list offset confuses players
        // looking for timestamp zero.
        if !is_non_sync {
            pts_offset = 0;
        }

        track.samples.push(QueuedSample {
            duration: 0,
            pts_offset,
            is_non_sync,
            payload_size,
            get_payload: Some(get_payload),
        });
        track.last_dts = dts;
        Ok(())
    }

    /// Set the duration of the last accepted sample from the stream's
    /// final decode timestamp.
    pub fn write_final_dts(&mut self, dts: i64) -> Result<()> {
        let track = self
            .current
            .map(|i| &mut self.tracks[i])
            .ok_or_else(|| anyhow!("no current track"))?;
        if let Some(last) = track.samples.last_mut() {
            last.duration = (dts - track.last_dts).max(0) as u32;
        }
        Ok(())
    }

    /// Marshal the presentation and consume the muxer.
    pub fn flush(mut self) -> Result<()> {
        let ftyp = build_ftyp();

        // Chunk offsets depend on the moov size, which does not depend on
        // the offset values; measure with zeros, then rebuild for real.
        let probe = self.build_moov(&vec![0u32; self.tracks.len()]);
        let mdat_payload_start = (ftyp.len() + probe.len() + 8) as u32;

        let mut offsets = Vec::with_capacity(self.tracks.len());
        let mut cursor = mdat_payload_start;
        for track in &self.tracks {
            offsets.push(cursor);
            cursor += track
                .samples
                .iter()
                .map(|s| s.payload_size)
                .sum::<u32>();
        }
        let moov = self.build_moov(&offsets);
        debug_assert_eq!(moov.len(), probe.len());

        let mdat_size = 8 + (cursor - mdat_payload_start) as usize;

        self.w.write_all(&ftyp).context("write ftyp")?;
        self.w.write_all(&moov).context("write moov")?;
        self.w
            .write_all(&(mdat_size as u32).to_be_bytes())
            .context("write mdat header")?;
        self.w.write_all(b"mdat").context("write mdat header")?;
        for track in &mut self.tracks {
            for sample in &mut track.samples {
                let getter = sample.get_payload.take().expect("payload not yet resolved");
                let payload: Bytes = getter()?;
                self.w.write_all(&payload).context("write sample")?;
            }
        }
        self.w.flush().context("flush")?;
        Ok(())
    }

    fn build_moov(&self, chunk_offsets: &[u32]) -> Vec<u8> {
        let next_track_id = self.tracks.iter().map(|t| t.init.id).max().unwrap_or(0) + 1;

        let movie_duration_ms = self
            .tracks
            .iter()
            .map(|t| {
                let ticks: u64 = t.samples.iter().map(|s| s.duration as u64).sum();
                ticks * 1_000 / t.init.time_scale.max(1) as u64
            })
            .max()
            .unwrap_or(0) as u32;

        let mut payload = build_mvhd(movie_duration_ms, next_track_id);
        for (track, &offset) in self.tracks.iter().zip(chunk_offsets) {
            payload.extend_from_slice(&build_trak(track, offset));
        }
        make_box(b"moov", &payload)
    }
}

fn build_ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(b"mp42");
    payload.extend_from_slice(&1u32.to_be_bytes());
    payload.extend_from_slice(b"mp42");
    payload.extend_from_slice(b"mp41");
    payload.extend_from_slice(b"isom");
    make_box(b"ftyp", &payload)
}

fn build_mvhd(duration_ms: u32, next_track_id: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);
    payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    payload.extend_from_slice(&1_000u32.to_be_bytes()); // timescale
    payload.extend_from_slice(&duration_ms.to_be_bytes());
    payload.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate
    payload.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&super::unity_matrix());
    payload.extend_from_slice(&[0u8; 24]);
    payload.extend_from_slice(&next_track_id.to_be_bytes());
    make_full_box(b"mvhd", 0, 0, &payload)
}

fn build_trak(track: &Mp4Track, chunk_offset: u32) -> Vec<u8> {
    let duration_ticks: u64 = track.samples.iter().map(|s| s.duration as u64).sum();

    let tkhd = build_tkhd(track, duration_ticks);
    let mdia = build_mdia(track, duration_ticks, chunk_offset);

    let mut payload = Vec::with_capacity(tkhd.len() + mdia.len());
    payload.extend_from_slice(&tkhd);
    payload.extend_from_slice(&mdia);
    make_box(b"trak", &payload)
}

fn build_tkhd(track: &Mp4Track, duration_ticks: u64) -> Vec<u8> {
    let duration_ms =
        (duration_ticks * 1_000 / track.init.time_scale.max(1) as u64) as u32;
    let (width, height) = track.init.codec.dimensions();

    let mut payload = Vec::with_capacity(84);
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&track.init.id.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&duration_ms.to_be_bytes());
    payload.extend_from_slice(&[0u8; 8]);
    payload.extend_from_slice(&0u16.to_be_bytes()); // layer
    payload.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    let volume: u16 = if track.init.codec.is_video() { 0 } else { 0x0100 };
    payload.extend_from_slice(&volume.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&super::unity_matrix());
    payload.extend_from_slice(&(width << 16).to_be_bytes());
    payload.extend_from_slice(&(height << 16).to_be_bytes());
    make_full_box(b"tkhd", 0, 0x7, &payload)
}

fn build_mdia(track: &Mp4Track, duration_ticks: u64, chunk_offset: u32) -> Vec<u8> {
    let mut mdhd = Vec::with_capacity(20);
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&0u32.to_be_bytes());
    mdhd.extend_from_slice(&track.init.time_scale.to_be_bytes());
    mdhd.extend_from_slice(&(duration_ticks as u32).to_be_bytes());
    mdhd.extend_from_slice(&0x55C4u16.to_be_bytes()); // und
    mdhd.extend_from_slice(&0u16.to_be_bytes());
    let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd);

    let is_video = track.init.codec.is_video();
    let (handler, name): (&[u8; 4], &[u8]) = if is_video {
        (b"vide", b"VideoHandler\0")
    } else {
        (b"soun", b"SoundHandler\0")
    };
    let mut hdlr = Vec::with_capacity(20 + name.len());
    hdlr.extend_from_slice(&0u32.to_be_bytes());
    hdlr.extend_from_slice(handler);
    hdlr.extend_from_slice(&[0u8; 12]);
    hdlr.extend_from_slice(name);
    let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr);

    let minf = build_minf(track, chunk_offset);

    let mut payload = Vec::with_capacity(mdhd.len() + hdlr.len() + minf.len());
    payload.extend_from_slice(&mdhd);
    payload.extend_from_slice(&hdlr);
    payload.extend_from_slice(&minf);
    make_box(b"mdia", &payload)
}

fn build_minf(track: &Mp4Track, chunk_offset: u32) -> Vec<u8> {
    let header = if track.init.codec.is_video() {
        let mut vmhd = Vec::with_capacity(8);
        vmhd.extend_from_slice(&0u16.to_be_bytes());
        vmhd.extend_from_slice(&[0u8; 6]);
        make_full_box(b"vmhd", 0, 1, &vmhd)
    } else {
        let mut smhd = Vec::with_capacity(4);
        smhd.extend_from_slice(&[0u8; 4]);
        make_full_box(b"smhd", 0, 0, &smhd)
    };

    let url_box = make_full_box(b"url ", 0, 1, &[]);
    let mut dref = Vec::with_capacity(4 + url_box.len());
    dref.extend_from_slice(&1u32.to_be_bytes());
    dref.extend_from_slice(&url_box);
    let dinf = make_box(b"dinf", &make_full_box(b"dref", 0, 0, &dref));

    let stbl = build_stbl(track, chunk_offset);

    let mut payload = Vec::with_capacity(header.len() + dinf.len() + stbl.len());
    payload.extend_from_slice(&header);
    payload.extend_from_slice(&dinf);
    payload.extend_from_slice(&stbl);
    make_box(b"minf", &payload)
}

fn build_stbl(track: &Mp4Track, chunk_offset: u32) -> Vec<u8> {
    let entry = build_sample_entry(&track.init);
    let mut stsd = Vec::with_capacity(4 + entry.len());
    stsd.extend_from_slice(&1u32.to_be_bytes());
    stsd.extend_from_slice(&entry);
    let stsd = make_full_box(b"stsd", 0, 0, &stsd);

    // stts: run-length encoded durations.
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for s in &track.samples {
        match runs.last_mut() {
            Some((count, duration)) if *duration == s.duration => *count += 1,
            _ => runs.push((1, s.duration)),
        }
    }
    let mut stts = Vec::with_capacity(4 + runs.len() * 8);
    stts.extend_from_slice(&(runs.len() as u32).to_be_bytes());
    for (count, duration) in &runs {
        stts.extend_from_slice(&count.to_be_bytes());
        stts.extend_from_slice(&duration.to_be_bytes());
    }
    let stts = make_full_box(b"stts", 0, 0, &stts);

    // stss: sync table, only for video tracks with non-sync samples.
    let sync_indices: Vec<u32> = track
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_non_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let needs_stss =
        track.init.codec.is_video() && sync_indices.len() != track.samples.len();
    let stss = if needs_stss {
        let mut body = Vec::with_capacity(4 + sync_indices.len() * 4);
        body.extend_from_slice(&(sync_indices.len() as u32).to_be_bytes());
        for idx in &sync_indices {
            body.extend_from_slice(&idx.to_be_bytes());
        }
        Some(make_full_box(b"stss", 0, 0, &body))
    } else {
        None
    };

    // ctts: composition offsets, only when some sample has one.
    let ctts = if track.samples.iter().any(|s| s.pts_offset != 0) {
        let mut entries: Vec<(u32, i32)> = Vec::new();
        for s in &track.samples {
            match entries.last_mut() {
                Some((count, off)) if *off == s.pts_offset => *count += 1,
                _ => entries.push((1, s.pts_offset)),
            }
        }
        let mut body = Vec::with_capacity(4 + entries.len() * 8);
        body.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (count, off) in &entries {
            body.extend_from_slice(&count.to_be_bytes());
            body.extend_from_slice(&off.to_be_bytes());
        }
        Some(make_full_box(b"ctts", 1, 0, &body))
    } else {
        None
    };

    // One chunk holding every sample of the track.
    let mut stsc = Vec::with_capacity(16);
    stsc.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    stsc.extend_from_slice(&1u32.to_be_bytes()); // first_chunk
    stsc.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
    stsc.extend_from_slice(&1u32.to_be_bytes()); // sample_description_index
    let stsc = make_full_box(b"stsc", 0, 0, &stsc);

    let mut stsz = Vec::with_capacity(8 + track.samples.len() * 4);
    stsz.extend_from_slice(&0u32.to_be_bytes()); // sample_size: per-sample
    stsz.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
    for s in &track.samples {
        stsz.extend_from_slice(&s.payload_size.to_be_bytes());
    }
    let stsz = make_full_box(b"stsz", 0, 0, &stsz);

    let mut stco = Vec::with_capacity(8);
    stco.extend_from_slice(&1u32.to_be_bytes());
    stco.extend_from_slice(&chunk_offset.to_be_bytes());
    let stco = make_full_box(b"stco", 0, 0, &stco);

    let mut payload = Vec::new();
    payload.extend_from_slice(&stsd);
    payload.extend_from_slice(&stts);
    if let Some(stss) = stss {
        payload.extend_from_slice(&stss);
    }
    if let Some(ctts) = ctts {
        payload.extend_from_slice(&ctts);
    }
    payload.extend_from_slice(&stsc);
    payload.extend_from_slice(&stsz);
    payload.extend_from_slice(&stco);
    make_box(b"stbl", &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::testdata::{PPS, SPS_640X480_POC2};
    use crate::mux::{walk_boxes, TrackCodec};

    fn video_track() -> TrackInit {
        TrackInit {
            id: 1,
            time_scale: 90_000,
            codec: TrackCodec::H264 {
                sps: SPS_640X480_POC2.to_vec(),
                pps: PPS.to_vec(),
            },
        }
    }

    fn sample(dts: i64, sync: bool, payload: &'static [u8]) -> Sample {
        Sample::from_bytes(dts, 0, !sync, Bytes::from_static(payload))
    }

    #[test]
    fn test_basic_presentation() {
        let mut buf = Vec::new();
        let mut muxer = Mp4Muxer::new(&mut buf);
        muxer.write_init(vec![video_track()]);
        muxer.set_track(1).unwrap();
        muxer.write_sample(sample(0, true, &[1, 2, 3])).unwrap();
        muxer.write_sample(sample(3000, false, &[4, 5])).unwrap();
        muxer.write_sample(sample(6000, false, &[6])).unwrap();
        muxer.write_final_dts(9000).unwrap();
        muxer.flush().unwrap();

        let boxes = walk_boxes(&buf);
        assert_eq!(boxes[0].0, "ftyp");
        assert_eq!(boxes[1].0, "moov");
        assert_eq!(boxes[2].0, "mdat");
        assert_eq!(boxes[2].1, 8 + 6);

        // The single chunk offset points at the first payload byte.
        let stco_pos = buf.windows(4).position(|w| w == b"stco").unwrap();
        let offset =
            u32::from_be_bytes(buf[stco_pos + 12..stco_pos + 16].try_into().unwrap());
        assert_eq!(&buf[offset as usize..offset as usize + 3], &[1, 2, 3]);

        // stss marks only the first sample as sync.
        let stss_pos = buf.windows(4).position(|w| w == b"stss").unwrap();
        let count =
            u32::from_be_bytes(buf[stss_pos + 8..stss_pos + 12].try_into().unwrap());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_pre_keyframe_gop_dropped() {
        let mut buf = Vec::new();
        let mut muxer = Mp4Muxer::new(&mut buf);
        muxer.write_init(vec![video_track()]);
        muxer.set_track(1).unwrap();
        // Warm-up samples with negative decode time, then the keyframe.
        muxer.write_sample(sample(-6000, false, &[0xEE])).unwrap();
        muxer.write_sample(sample(-3000, false, &[0xEE])).unwrap();
        muxer.write_sample(sample(0, true, &[1])).unwrap();
        muxer.write_sample(sample(3000, false, &[2])).unwrap();
        muxer.write_final_dts(6000).unwrap();
        muxer.flush().unwrap();

        let stsz_pos = buf.windows(4).position(|w| w == b"stsz").unwrap();
        let count =
            u32::from_be_bytes(buf[stsz_pos + 12..stsz_pos + 16].try_into().unwrap());
        assert_eq!(count, 2);
    }

    #[test]
    fn test_sync_sample_offset_clamped() {
        let mut buf = Vec::new();
        let mut muxer = Mp4Muxer::new(&mut buf);
        muxer.write_init(vec![video_track()]);
        muxer.set_track(1).unwrap();
        muxer
            .write_sample(Sample::from_bytes(0, 6000, false, Bytes::from_static(&[1])))
            .unwrap();
        muxer
            .write_sample(Sample::from_bytes(3000, 6000, true, Bytes::from_static(&[2])))
            .unwrap();
        muxer.write_final_dts(6000).unwrap();
        muxer.flush().unwrap();

        let ctts_pos = buf.windows(4).position(|w| w == b"ctts").unwrap();
        let entries =
            u32::from_be_bytes(buf[ctts_pos + 8..ctts_pos + 12].try_into().unwrap());
        assert_eq!(entries, 2);
        let first_offset =
            i32::from_be_bytes(buf[ctts_pos + 16..ctts_pos + 20].try_into().unwrap());
        assert_eq!(first_offset, 0);
    }
}

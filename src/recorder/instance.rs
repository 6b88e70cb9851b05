use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{info, warn};

use crate::codec::{g711, h264, h265, nal_units_to_length_prefixed, Format};
use crate::config::{RecordFormat, RecorderConfig};
use crate::mux::fmp4::{build_fragment, build_init_segment, FragmentTrack, PartSample};
use crate::mux::mp4::Mp4Muxer;
use crate::mux::{Sample, TrackCodec, TrackInit};
use crate::stream::unit::{Unit, UnitPayload};

use super::path::PathFormatter;
use super::segment::SegmentFile;
use super::{OnSegmentComplete, OnSegmentCreate};

/// One recordable track of the subscribed stream.
#[derive(Debug, Clone)]
pub(crate) struct TrackSpec {
    pub media_id: usize,
    pub payload_type: u8,
    pub format: Format,
}

struct PendingSample {
    /// Decode time relative to this track's first sample in the segment.
    rel_dts: i64,
    pts_offset: i32,
    is_non_sync: bool,
    payload: Bytes,
}

struct RecTrack {
    spec: TrackSpec,
    mux_id: u32,
    time_scale: u32,
    /// Parameter sets changed in-band; forces a new segment at the next
    /// usable keyframe so the init describes what follows.
    params_changed: bool,

    seg_first_dts: Option<i64>,
    pending: Option<PendingSample>,
    part_samples: Vec<PartSample>,
    part_base: Option<i64>,
    last_duration: u32,
    last_end_rel: i64,
}

struct SegmentState {
    path: PathBuf,
    file: Option<SegmentFile>,
    mp4: Option<Mp4Muxer<File>>,
    /// Leading-track decode time at which the segment began (absolute).
    start_dts: i64,
    part_start_dts: i64,
    fragment_seq: u32,
}

/// Per-run recording state. Lives behind a mutex touched only by the
/// stream reader task (units) and the supervisor (finalize), never both at
/// once while units flow.
pub(crate) struct RecorderCore {
    cfg: RecorderConfig,
    path_name: String,
    formatter: PathFormatter,
    tracks: Vec<RecTrack>,
    leading: usize,
    segment: Option<SegmentState>,
    seg_duration_ticks: i64,
    part_duration_ticks: i64,
    on_segment_create: Option<OnSegmentCreate>,
    on_segment_complete: Option<OnSegmentComplete>,
}

impl RecorderCore {
    pub fn new(
        cfg: RecorderConfig,
        path_name: String,
        specs: Vec<TrackSpec>,
        on_segment_create: Option<OnSegmentCreate>,
        on_segment_complete: Option<OnSegmentComplete>,
    ) -> Result<Self> {
        cfg.validate()?;
        let formatter = PathFormatter::new(&cfg.path_format)?;
        if specs.is_empty() {
            bail!("no recordable tracks");
        }

        let tracks: Vec<RecTrack> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| RecTrack {
                time_scale: spec.format.clock_rate(),
                mux_id: i as u32 + 1,
                spec,
                params_changed: false,
                seg_first_dts: None,
                pending: None,
                part_samples: Vec::new(),
                part_base: None,
                last_duration: 0,
                last_end_rel: 0,
            })
            .collect();

        let leading = tracks
            .iter()
            .position(|t| t.spec.format.kind() == crate::codec::MediaKind::Video)
            .unwrap_or(0);
        let leading_scale = tracks[leading].time_scale as f64;

        Ok(Self {
            seg_duration_ticks: (cfg.segment_duration().as_secs_f64() * leading_scale) as i64,
            part_duration_ticks: (cfg.part_duration().as_secs_f64() * leading_scale) as i64,
            cfg,
            path_name,
            formatter,
            tracks,
            leading,
            segment: None,
            on_segment_create,
            on_segment_complete,
        })
    }

    pub(crate) fn track_keys(&self) -> Vec<(usize, u8)> {
        self.tracks
            .iter()
            .map(|t| (t.spec.media_id, t.spec.payload_type))
            .collect()
    }

    fn is_fmp4(&self) -> bool {
        self.cfg.record_format == RecordFormat::Fmp4
    }

    /// Entry point from the stream reader callback. An error means the
    /// instance is failed: the segment has already been closed short.
    pub fn on_unit(&mut self, idx: usize, unit: Unit) -> Result<()> {
        let Some(payload) = self.convert_payload(idx, &unit) else {
            return Ok(());
        };
        if payload.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.schedule(idx, &unit, payload) {
            self.abort_segment();
            return Err(e);
        }
        Ok(())
    }

    /// Orderly shutdown: flush what is buffered and close the file.
    pub fn finalize(&mut self) -> Result<()> {
        self.close_segment(None)
    }

    // ---- payload conversion ----

    fn convert_payload(&mut self, idx: usize, unit: &Unit) -> Option<Bytes> {
        let track = &mut self.tracks[idx];
        match (&mut track.spec.format, &unit.payload) {
            (Format::H264 { sps, pps, .. }, UnitPayload::NalUnits(nalus)) => {
                let (new_sps, new_pps) = h264::extract_parameter_sets(nalus);
                track.params_changed |= update_param(sps, new_sps);
                track.params_changed |= update_param(pps, new_pps);
                Some(nal_units_to_length_prefixed(nalus))
            }
            (Format::H265 { vps, sps, pps, .. }, UnitPayload::NalUnits(nalus)) => {
                let (new_vps, new_sps, new_pps) = h265::extract_parameter_sets(nalus);
                track.params_changed |= update_param(vps, new_vps);
                track.params_changed |= update_param(sps, new_sps);
                track.params_changed |= update_param(pps, new_pps);
                Some(nal_units_to_length_prefixed(nalus))
            }
            (Format::G711 { mu_law, .. }, UnitPayload::Frame(frame)) => {
                Some(g711::expand_frame(frame, *mu_law))
            }
            (_, UnitPayload::Frame(frame)) => Some(frame.clone()),
            (_, UnitPayload::NalUnits(nalus)) => Some(nal_units_to_length_prefixed(nalus)),
        }
    }

    fn track_ready(&self, idx: usize) -> bool {
        match &self.tracks[idx].spec.format {
            Format::H264 { sps, pps, .. } => sps.is_some() && pps.is_some(),
            Format::H265 { vps, sps, pps, .. } => {
                vps.is_some() && sps.is_some() && pps.is_some()
            }
            _ => true,
        }
    }

    // ---- scheduling ----

    fn schedule(&mut self, idx: usize, unit: &Unit, payload: Bytes) -> Result<()> {
        let is_leading = idx == self.leading;

        // Boundary check before enqueuing: the first keyframe at or past
        // the nominal length starts the next segment, as does one that
        // follows a parameter change.
        let rotate = match &self.segment {
            Some(seg) if is_leading && unit.random_access => {
                unit.dts - seg.start_dts >= self.seg_duration_ticks
                    || self.tracks.iter().any(|t| t.params_changed)
            }
            _ => false,
        };
        if rotate {
            self.close_segment(Some(unit.dts))?;
        }

        if self.segment.is_none() {
            if !(is_leading && unit.random_access && self.track_ready(self.leading)) {
                // Nothing before a usable keyframe is decodable.
                return Ok(());
            }
            self.open_segment(unit)?;
        }

        // Durations come from the successor, so each track runs one sample
        // behind.
        let (predecessor, rel_dts) = {
            let track = &mut self.tracks[idx];
            let rel_dts = match track.seg_first_dts {
                Some(first) => unit.dts - first,
                None => {
                    track.seg_first_dts = Some(unit.dts);
                    0
                }
            };
            (track.pending.take(), rel_dts)
        };
        if let Some(p) = predecessor {
            let duration = (rel_dts - p.rel_dts).max(0) as u32;
            self.commit_sample(idx, p, duration)?;
        }

        let track = &mut self.tracks[idx];
        // A sync sample never carries a composition offset; players
        // searching for timestamp zero trip over leading-keyframe edits.
        let pts_offset = if unit.random_access {
            0
        } else {
            (unit.pts - unit.dts) as i32
        };
        track.pending = Some(PendingSample {
            rel_dts,
            pts_offset,
            is_non_sync: !unit.random_access,
            payload,
        });
        track.last_end_rel = rel_dts;

        if is_leading && self.is_fmp4() {
            let part_start = self.segment.as_ref().expect("segment open").part_start_dts;
            if unit.dts - part_start >= self.part_duration_ticks {
                self.flush_part(unit.dts)?;
            }
        }
        Ok(())
    }

    fn commit_sample(&mut self, idx: usize, p: PendingSample, duration: u32) -> Result<()> {
        let mux_id = {
            let track = &mut self.tracks[idx];
            track.last_duration = duration;
            track.last_end_rel = p.rel_dts + duration as i64;
            track.mux_id
        };

        if self.is_fmp4() {
            let track = &mut self.tracks[idx];
            if track.part_base.is_none() {
                track.part_base = Some(p.rel_dts);
            }
            track.part_samples.push(PartSample {
                duration,
                pts_offset: p.pts_offset,
                is_non_sync: p.is_non_sync,
                payload: p.payload,
            });
        } else {
            let seg = self.segment.as_mut().expect("segment open");
            let muxer = seg.mp4.as_mut().expect("mp4 muxer present");
            muxer.set_track(mux_id)?;
            muxer.write_sample(Sample::from_bytes(
                p.rel_dts,
                p.pts_offset,
                p.is_non_sync,
                p.payload,
            ))?;
        }
        Ok(())
    }

    fn flush_part(&mut self, new_part_start: i64) -> Result<()> {
        let mut frag_tracks = Vec::new();
        for track in &mut self.tracks {
            if track.part_samples.is_empty() {
                continue;
            }
            frag_tracks.push(FragmentTrack {
                track_id: track.mux_id,
                base_dts: track.part_base.take().unwrap_or(0).max(0) as u64,
                samples: std::mem::take(&mut track.part_samples),
            });
        }

        let seg = self.segment.as_mut().expect("segment open");
        seg.part_start_dts = new_part_start;
        if frag_tracks.is_empty() {
            return Ok(());
        }
        let fragment = build_fragment(seg.fragment_seq, &frag_tracks);
        seg.fragment_seq += 1;
        seg.file
            .as_mut()
            .expect("fragmented segment file")
            .append(&fragment)
    }

    // ---- segment lifecycle ----

    fn open_segment(&mut self, unit: &Unit) -> Result<()> {
        let path = self
            .formatter
            .resolve_unique(&self.path_name, unit.ntp, "mp4");

        let inits = self
            .tracks
            .iter()
            .map(|t| track_init(t))
            .collect::<Result<Vec<_>>>()?;

        let state = match self.cfg.record_format {
            RecordFormat::Fmp4 => {
                let init = build_init_segment(&inits);
                let file = SegmentFile::create(&path, &init)?;
                SegmentState {
                    path: path.clone(),
                    file: Some(file),
                    mp4: None,
                    start_dts: unit.dts,
                    part_start_dts: unit.dts,
                    fragment_seq: 1,
                }
            }
            RecordFormat::Mp4 => {
                let file = SegmentFile::create(&path, &[])?;
                let (path_buf, file) = file.into_file();
                let mut muxer = Mp4Muxer::new(file);
                muxer.write_init(inits);
                SegmentState {
                    path: path_buf,
                    file: None,
                    mp4: Some(muxer),
                    start_dts: unit.dts,
                    part_start_dts: unit.dts,
                    fragment_seq: 1,
                }
            }
        };

        for track in &mut self.tracks {
            track.params_changed = false;
            track.seg_first_dts = None;
            track.pending = None;
            track.part_samples.clear();
            track.part_base = None;
            track.last_end_rel = 0;
        }
        self.segment = Some(state);

        if let Some(cb) = &self.on_segment_create {
            cb(&path);
        }
        Ok(())
    }

    /// Close the current segment. `close_dts` is the leading-track decode
    /// time the next segment starts at; absent on shutdown, where the last
    /// known spacing stands in.
    fn close_segment(&mut self, close_dts: Option<i64>) -> Result<()> {
        if self.segment.is_none() {
            return Ok(());
        }
        let start_dts = self.segment.as_ref().expect("segment open").start_dts;
        let leading_scale = self.tracks[self.leading].time_scale as i64;
        let elapsed_leading = close_dts.map(|d| (d - start_dts).max(0));

        for idx in 0..self.tracks.len() {
            let (pending, scale, last_duration) = {
                let t = &mut self.tracks[idx];
                (t.pending.take(), t.time_scale as i64, t.last_duration)
            };
            if let Some(p) = pending {
                let duration = match elapsed_leading {
                    Some(elapsed) => {
                        let end_rel = elapsed * scale / leading_scale;
                        (end_rel - p.rel_dts).max(0) as u32
                    }
                    None => last_duration,
                };
                self.commit_sample(idx, p, duration)?;
            }
        }

        if self.is_fmp4() {
            self.flush_part(0)?;
        }

        let seg = self.segment.take().expect("segment open");
        let duration_ticks =
            elapsed_leading.unwrap_or(self.tracks[self.leading].last_end_rel.max(0));
        let duration = Duration::from_secs_f64(duration_ticks as f64 / leading_scale as f64);

        let path = match (seg.file, seg.mp4) {
            (Some(file), _) => file.finalize()?,
            (None, Some(mut muxer)) => {
                for track in &self.tracks {
                    let end_rel = match elapsed_leading {
                        Some(elapsed) => elapsed * track.time_scale as i64 / leading_scale,
                        None => track.last_end_rel,
                    };
                    muxer.set_track(track.mux_id)?;
                    muxer.write_final_dts(end_rel)?;
                }
                muxer
                    .flush()
                    .with_context(|| format!("finalize {}", seg.path.display()))?;
                info!("[recorder] segment {} closed", seg.path.display());
                seg.path
            }
            (None, None) => seg.path,
        };

        for track in &mut self.tracks {
            track.seg_first_dts = None;
            track.part_base = None;
            track.last_end_rel = 0;
        }

        if let Some(cb) = &self.on_segment_complete {
            cb(&path, duration);
        }
        Ok(())
    }

    /// Write failure: keep whatever made it to disk, report the short
    /// segment, and let the supervisor restart us.
    fn abort_segment(&mut self) {
        let Some(seg) = self.segment.take() else {
            return;
        };
        for track in &mut self.tracks {
            track.pending = None;
            track.part_samples.clear();
            track.part_base = None;
            track.seg_first_dts = None;
        }
        let leading_scale = self.tracks[self.leading].time_scale as f64;
        let duration = Duration::from_secs_f64(
            self.tracks[self.leading].last_end_rel.max(0) as f64 / leading_scale,
        );
        let path = seg.path.clone();
        if let Some(file) = seg.file {
            let _ = file.finalize();
        }
        warn!("[recorder] segment {} aborted", path.display());
        if let Some(cb) = &self.on_segment_complete {
            cb(&path, duration);
        }
    }
}

fn update_param(slot: &mut Option<Vec<u8>>, new: Option<Vec<u8>>) -> bool {
    match new {
        Some(new) if slot.as_ref() != Some(&new) => {
            let changed = slot.is_some();
            *slot = Some(new);
            changed
        }
        _ => false,
    }
}

fn track_init(track: &RecTrack) -> Result<TrackInit> {
    let codec = match &track.spec.format {
        Format::H264 { sps, pps, .. } => TrackCodec::H264 {
            sps: sps.clone().unwrap_or_default(),
            pps: pps.clone().unwrap_or_default(),
        },
        Format::H265 { vps, sps, pps, .. } => TrackCodec::H265 {
            vps: vps.clone().unwrap_or_default(),
            sps: sps.clone().unwrap_or_default(),
            pps: pps.clone().unwrap_or_default(),
        },
        Format::Mpeg4Video { config, .. } => TrackCodec::Mpeg4Video {
            config: config.clone().unwrap_or_default(),
            width: 640,
            height: 480,
        },
        Format::Mjpeg => TrackCodec::Mjpeg {
            width: 640,
            height: 480,
        },
        Format::Aac {
            config,
            sample_rate,
            channel_count,
            ..
        } => TrackCodec::Aac {
            config: config.clone(),
            sample_rate: *sample_rate,
            channel_count: *channel_count,
        },
        Format::Opus { channel_count, .. } => TrackCodec::Opus {
            channel_count: *channel_count,
        },
        Format::Lpcm {
            bit_depth,
            sample_rate,
            channel_count,
            ..
        } => TrackCodec::Lpcm {
            bit_depth: *bit_depth,
            sample_rate: *sample_rate,
            channel_count: *channel_count,
        },
        Format::G711 {
            sample_rate,
            channel_count,
            ..
        } => TrackCodec::Lpcm {
            bit_depth: 16,
            sample_rate: *sample_rate,
            channel_count: *channel_count,
        },
        Format::Mpeg1Audio => TrackCodec::Mpeg1Audio,
        other => bail!("codec {} cannot be recorded", other.name()),
    };
    Ok(TrackInit {
        id: track.mux_id,
        time_scale: track.time_scale,
        codec,
    })
}

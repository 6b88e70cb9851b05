//! Fragmented-MP4 building blocks: a standards-compliant init segment
//! (ftyp + moov + mvex) and moof/mdat fragments, appended to one file so a
//! truncated recording stays playable up to the last complete part.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

use super::{build_sample_entry, make_box, make_full_box, unity_matrix, TrackInit};

/// A sample inside a part, payload already resolved.
#[derive(Debug, Clone)]
pub struct PartSample {
    pub duration: u32,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

/// One track's slice of a fragment.
#[derive(Debug, Clone)]
pub struct FragmentTrack {
    pub track_id: u32,
    /// Decode timestamp of the first sample, in track time-scale ticks,
    /// relative to the segment start.
    pub base_dts: u64,
    pub samples: Vec<PartSample>,
}

const MOVIE_TIMESCALE: u32 = 1_000;

/// Build the init segment: `ftyp` + `moov` with one trak per track and
/// fragment defaults in `mvex`.
pub fn build_init_segment(tracks: &[TrackInit]) -> Vec<u8> {
    let ftyp = build_ftyp();
    let moov = build_moov(tracks);

    let mut out = Vec::with_capacity(ftyp.len() + moov.len());
    out.extend_from_slice(&ftyp);
    out.extend_from_slice(&moov);
    out
}

fn build_ftyp() -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + 4 + 4 * 4);
    payload.extend_from_slice(b"mp42");
    payload.extend_from_slice(&1u32.to_be_bytes()); // minor_version
    payload.extend_from_slice(b"mp42");
    payload.extend_from_slice(b"mp41");
    payload.extend_from_slice(b"iso5");
    payload.extend_from_slice(b"iso6");
    make_box(b"ftyp", &payload)
}

fn build_moov(tracks: &[TrackInit]) -> Vec<u8> {
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;
    let mut payload = build_mvhd(next_track_id);
    for track in tracks {
        payload.extend_from_slice(&build_trak(track));
    }
    payload.extend_from_slice(&build_mvex(tracks));
    make_box(b"moov", &payload)
}

fn build_mvhd(next_track_id: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(96);
    payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    payload.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // duration, unknown up front
    payload.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
    payload.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    payload.extend_from_slice(&[0u8; 8]); // reserved
    payload.extend_from_slice(&unity_matrix());
    payload.extend_from_slice(&[0u8; 24]); // pre_defined[6]
    payload.extend_from_slice(&next_track_id.to_be_bytes());
    make_full_box(b"mvhd", 0, 0, &payload)
}

fn build_trak(track: &TrackInit) -> Vec<u8> {
    let tkhd = build_tkhd(track);
    let mdia = build_mdia(track);

    let mut payload = Vec::with_capacity(tkhd.len() + mdia.len());
    payload.extend_from_slice(&tkhd);
    payload.extend_from_slice(&mdia);
    make_box(b"trak", &payload)
}

fn build_tkhd(track: &TrackInit) -> Vec<u8> {
    let (width, height) = track.codec.dimensions();
    let mut payload = Vec::with_capacity(84);
    payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    payload.extend_from_slice(&track.id.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // reserved
    payload.extend_from_slice(&0u32.to_be_bytes()); // duration
    payload.extend_from_slice(&[0u8; 8]); // reserved
    payload.extend_from_slice(&0u16.to_be_bytes()); // layer
    payload.extend_from_slice(&0u16.to_be_bytes()); // alternate_group
    let volume: u16 = if track.codec.is_video() { 0 } else { 0x0100 };
    payload.extend_from_slice(&volume.to_be_bytes());
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    payload.extend_from_slice(&unity_matrix());
    payload.extend_from_slice(&(width << 16).to_be_bytes()); // 16.16
    payload.extend_from_slice(&(height << 16).to_be_bytes());
    // track_enabled | track_in_movie | track_in_preview
    make_full_box(b"tkhd", 0, 0x7, &payload)
}

fn build_mdia(track: &TrackInit) -> Vec<u8> {
    let mdhd = build_mdhd(track.time_scale);
    let hdlr = build_hdlr(track.codec.is_video());
    let minf = build_minf(track);

    let mut payload = Vec::with_capacity(mdhd.len() + hdlr.len() + minf.len());
    payload.extend_from_slice(&mdhd);
    payload.extend_from_slice(&hdlr);
    payload.extend_from_slice(&minf);
    make_box(b"mdia", &payload)
}

fn build_mdhd(time_scale: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(20);
    payload.extend_from_slice(&0u32.to_be_bytes()); // creation_time
    payload.extend_from_slice(&0u32.to_be_bytes()); // modification_time
    payload.extend_from_slice(&time_scale.to_be_bytes());
    payload.extend_from_slice(&0u32.to_be_bytes()); // duration
    payload.extend_from_slice(&0x55C4u16.to_be_bytes()); // language: und
    payload.extend_from_slice(&0u16.to_be_bytes()); // pre_defined
    make_full_box(b"mdhd", 0, 0, &payload)
}

fn build_hdlr(is_video: bool) -> Vec<u8> {
    let (handler, name): (&[u8; 4], &[u8]) = if is_video {
        (b"vide", b"VideoHandler\0")
    } else {
        (b"soun", b"SoundHandler\0")
    };
    let mut payload = Vec::with_capacity(20 + name.len());
    payload.extend_from_slice(&0u32.to_be_bytes()); // pre_defined
    payload.extend_from_slice(handler);
    payload.extend_from_slice(&[0u8; 12]); // reserved
    payload.extend_from_slice(name);
    make_full_box(b"hdlr", 0, 0, &payload)
}

fn build_minf(track: &TrackInit) -> Vec<u8> {
    let header = if track.codec.is_video() {
        build_vmhd()
    } else {
        build_smhd()
    };
    let dinf = build_dinf();
    let stbl = build_stbl(track);

    let mut payload = Vec::with_capacity(header.len() + dinf.len() + stbl.len());
    payload.extend_from_slice(&header);
    payload.extend_from_slice(&dinf);
    payload.extend_from_slice(&stbl);
    make_box(b"minf", &payload)
}

fn build_vmhd() -> Vec<u8> {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&0u16.to_be_bytes()); // graphicsmode
    payload.extend_from_slice(&[0u8; 6]); // opcolor
    make_full_box(b"vmhd", 0, 1, &payload)
}

fn build_smhd() -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&0u16.to_be_bytes()); // balance
    payload.extend_from_slice(&0u16.to_be_bytes()); // reserved
    make_full_box(b"smhd", 0, 0, &payload)
}

fn build_dinf() -> Vec<u8> {
    let url_box = make_full_box(b"url ", 0, 1, &[]); // self-contained
    let mut dref = Vec::with_capacity(4 + url_box.len());
    dref.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    dref.extend_from_slice(&url_box);
    let dref = make_full_box(b"dref", 0, 0, &dref);
    make_box(b"dinf", &dref)
}

fn build_stbl(track: &TrackInit) -> Vec<u8> {
    let stsd = build_stsd(track);
    let stts = make_full_box(b"stts", 0, 0, &0u32.to_be_bytes());
    let stsc = make_full_box(b"stsc", 0, 0, &0u32.to_be_bytes());
    let stsz = make_full_box(b"stsz", 0, 0, &[0u8; 8]);
    let stco = make_full_box(b"stco", 0, 0, &0u32.to_be_bytes());

    let mut payload =
        Vec::with_capacity(stsd.len() + stts.len() + stsc.len() + stsz.len() + stco.len());
    payload.extend_from_slice(&stsd);
    payload.extend_from_slice(&stts);
    payload.extend_from_slice(&stsc);
    payload.extend_from_slice(&stsz);
    payload.extend_from_slice(&stco);
    make_box(b"stbl", &payload)
}

fn build_stsd(track: &TrackInit) -> Vec<u8> {
    let entry = build_sample_entry(track);
    let mut payload = Vec::with_capacity(4 + entry.len());
    payload.extend_from_slice(&1u32.to_be_bytes()); // entry_count
    payload.extend_from_slice(&entry);
    make_full_box(b"stsd", 0, 0, &payload)
}

fn build_mvex(tracks: &[TrackInit]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 * tracks.len());
    for track in tracks {
        let mut trex = Vec::with_capacity(20);
        trex.extend_from_slice(&track.id.to_be_bytes());
        trex.extend_from_slice(&1u32.to_be_bytes()); // default_sample_description_index
        trex.extend_from_slice(&0u32.to_be_bytes()); // default_sample_duration
        trex.extend_from_slice(&0u32.to_be_bytes()); // default_sample_size
        trex.extend_from_slice(&0x0101_0000u32.to_be_bytes()); // default_sample_flags
        payload.extend_from_slice(&make_full_box(b"trex", 0, 0, &trex));
    }
    make_box(b"mvex", &payload)
}

// =========================== fragments =====================================

const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000; // depends_on = 2
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000; // depends_on = 1, non-sync

/// Build one `moof` + `mdat` part. Tracks with no samples are skipped.
pub fn build_fragment(seq_number: u32, tracks: &[FragmentTrack]) -> Vec<u8> {
    let tracks: Vec<&FragmentTrack> = tracks.iter().filter(|t| !t.samples.is_empty()).collect();
    let total_data: usize = tracks
        .iter()
        .flat_map(|t| t.samples.iter())
        .map(|s| s.payload.len())
        .sum();

    let mut out: Vec<u8> = Vec::with_capacity(1024 + total_data);

    // ---- moof ----
    let moof_start = out.len();
    out.extend_from_slice(&[0u8; 8]); // size + type, patched below

    // mfhd
    out.extend_from_slice(&16u32.to_be_bytes());
    out.extend_from_slice(b"mfhd");
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(&seq_number.to_be_bytes());

    let mut data_offset_positions = Vec::with_capacity(tracks.len());

    for track in &tracks {
        let traf_start = out.len();
        out.extend_from_slice(&[0u8; 8]); // traf header placeholder

        // tfhd: default-base-is-moof
        out.extend_from_slice(&16u32.to_be_bytes());
        out.extend_from_slice(b"tfhd");
        out.extend_from_slice(&0x0002_0000u32.to_be_bytes());
        out.extend_from_slice(&track.track_id.to_be_bytes());

        // tfdt (version 1, 64-bit base time)
        out.extend_from_slice(&20u32.to_be_bytes());
        out.extend_from_slice(b"tfdt");
        out.extend_from_slice(&0x0100_0000u32.to_be_bytes());
        out.extend_from_slice(&track.base_dts.to_be_bytes());

        // trun (version 1: signed composition offsets), with data offset,
        // duration, size, flags and cts per sample
        let trun_start = out.len();
        out.extend_from_slice(&[0u8; 4]); // size placeholder
        out.extend_from_slice(b"trun");
        out.extend_from_slice(&0x0100_0F01u32.to_be_bytes());
        out.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
        data_offset_positions.push(out.len());
        out.extend_from_slice(&[0u8; 4]); // data offset placeholder

        for s in &track.samples {
            out.extend_from_slice(&s.duration.to_be_bytes());
            out.extend_from_slice(&(s.payload.len() as u32).to_be_bytes());
            let flags = if s.is_non_sync {
                SAMPLE_FLAGS_NON_SYNC
            } else {
                SAMPLE_FLAGS_SYNC
            };
            out.extend_from_slice(&flags.to_be_bytes());
            out.extend_from_slice(&s.pts_offset.to_be_bytes());
        }

        let trun_size = (out.len() - trun_start) as u32;
        BigEndian::write_u32(&mut out[trun_start..trun_start + 4], trun_size);

        let traf_size = (out.len() - traf_start) as u32;
        BigEndian::write_u32(&mut out[traf_start..traf_start + 4], traf_size);
        out[traf_start + 4..traf_start + 8].copy_from_slice(b"traf");
    }

    let moof_size = (out.len() - moof_start) as u32;
    BigEndian::write_u32(&mut out[moof_start..moof_start + 4], moof_size);
    out[moof_start + 4..moof_start + 8].copy_from_slice(b"moof");

    // Each track's run starts where the previous track's payload ends.
    let mut run_offset = moof_size + 8;
    for (pos, track) in data_offset_positions.iter().zip(&tracks) {
        BigEndian::write_u32(&mut out[*pos..*pos + 4], run_offset);
        let track_bytes: usize = track.samples.iter().map(|s| s.payload.len()).sum();
        run_offset += track_bytes as u32;
    }

    // ---- mdat ----
    out.extend_from_slice(&((8 + total_data) as u32).to_be_bytes());
    out.extend_from_slice(b"mdat");
    for track in &tracks {
        for s in &track.samples {
            out.extend_from_slice(&s.payload);
        }
    }

    out
}

use std::io::Cursor;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use scuffle_h265::{
    ConstantFrameRate, HEVCDecoderConfigurationRecord, NALUnitType, NumTemporalLayers,
    ParallelismType, SpsNALUnit,
};

pub const NAL_TYPE_VPS: u8 = 32;
pub const NAL_TYPE_SPS: u8 = 33;
pub const NAL_TYPE_PPS: u8 = 34;
pub const NAL_TYPE_AP: u8 = 48;
pub const NAL_TYPE_FU: u8 = 49;

/// NAL unit type lives in bits 1..6 of the first header byte.
#[inline]
pub fn nal_unit_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

#[inline]
fn is_irap(nal_type: u8) -> bool {
    // BLA_W_LP .. CRA_NUT
    (16..=21).contains(&nal_type)
}

/// An access unit is a random-access point when it carries an IRAP slice.
pub fn is_random_access(au: &[Bytes]) -> bool {
    au.iter()
        .any(|n| !n.is_empty() && is_irap(nal_unit_type(n[0])))
}

/// Pull VPS/SPS/PPS out of an access unit for in-band parameter updates.
pub fn extract_parameter_sets(
    au: &[Bytes],
) -> (Option<Vec<u8>>, Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for nalu in au {
        if nalu.is_empty() {
            continue;
        }
        match nal_unit_type(nalu[0]) {
            NAL_TYPE_VPS => vps = Some(nalu.to_vec()),
            NAL_TYPE_SPS => sps = Some(nalu.to_vec()),
            NAL_TYPE_PPS => pps = Some(nalu.to_vec()),
            _ => {}
        }
    }
    (vps, sps, pps)
}

/// Fields pulled from an HEVC sequence parameter set.
#[derive(Debug, Clone)]
pub struct SpsInfo {
    pub width: u32,
    pub height: u32,
    pub codec_string: String,
}

/// Parse an SPS NAL unit (2-byte header included).
pub fn parse_sps(sps: &[u8]) -> Result<SpsInfo> {
    let parsed =
        SpsNALUnit::parse(Cursor::new(sps)).map_err(|e| anyhow!("HEVC SPS parse: {e:?}"))?;
    Ok(SpsInfo {
        width: parsed.rbsp.cropped_width() as u32,
        height: parsed.rbsp.cropped_height() as u32,
        codec_string: "hev1".to_string(),
    })
}

/// HEVCDecoderConfigurationRecord payload (the contents of the hvcC box).
pub fn build_hevc_decoder_config(vps: &[u8], sps: &[u8], pps: &[u8]) -> Result<Vec<u8>> {
    let parsed =
        SpsNALUnit::parse(Cursor::new(sps)).map_err(|e| anyhow!("HEVC SPS parse: {e:?}"))?;
    let profile = parsed.rbsp.profile_tier_level.general_profile.clone();
    let general_constraint_indicator_flags = if sps.len() >= 13 {
        ((sps[7] as u64) << 40)
            | ((sps[8] as u64) << 32)
            | ((sps[9] as u64) << 24)
            | ((sps[10] as u64) << 16)
            | ((sps[11] as u64) << 8)
            | (sps[12] as u64)
    } else {
        0
    };

    let config = HEVCDecoderConfigurationRecord {
        general_profile_space: profile.profile_space,
        general_tier_flag: profile.tier_flag,
        general_profile_idc: profile.profile_idc,
        general_profile_compatibility_flags: profile.profile_compatibility_flag,
        general_constraint_indicator_flags,
        general_level_idc: profile.level_idc.unwrap_or_default(),
        min_spatial_segmentation_idc: 0,
        parallelism_type: ParallelismType(0),
        chroma_format_idc: parsed.rbsp.chroma_format_idc,
        bit_depth_luma_minus8: parsed.rbsp.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: parsed.rbsp.bit_depth_chroma_minus8,
        avg_frame_rate: 0,
        constant_frame_rate: ConstantFrameRate(0),
        num_temporal_layers: NumTemporalLayers(parsed.rbsp.sps_max_sub_layers_minus1 + 1),
        temporal_id_nested: parsed.rbsp.sps_temporal_id_nesting_flag,
        length_size_minus_one: 3,
        arrays: vec![
            scuffle_h265::NaluArray {
                array_completeness: true,
                nal_unit_type: NALUnitType::VpsNut,
                nalus: vec![Bytes::copy_from_slice(vps)],
            },
            scuffle_h265::NaluArray {
                array_completeness: true,
                nal_unit_type: NALUnitType::SpsNut,
                nalus: vec![Bytes::copy_from_slice(sps)],
            },
            scuffle_h265::NaluArray {
                array_completeness: true,
                nal_unit_type: NALUnitType::PpsNut,
                nalus: vec![Bytes::copy_from_slice(pps)],
            },
        ],
    };

    let mut buf = Vec::new();
    config
        .mux(&mut buf)
        .map_err(|e| anyhow!("hvcC mux: {e:?}"))?;
    Ok(buf)
}

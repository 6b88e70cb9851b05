use anyhow::{anyhow, Result};
use bytes::Bytes;

pub const NAL_TYPE_NON_IDR: u8 = 1;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;
pub const NAL_TYPE_STAP_A: u8 = 24;
pub const NAL_TYPE_FU_A: u8 = 28;
pub const NAL_TYPE_FU_B: u8 = 29;

#[inline]
pub fn nal_unit_type(header: u8) -> u8 {
    header & 0x1F
}

/// An access unit is a random-access point when it carries an IDR slice.
pub fn is_random_access(au: &[Bytes]) -> bool {
    au.iter()
        .any(|n| !n.is_empty() && nal_unit_type(n[0]) == NAL_TYPE_IDR)
}

/// Pull SPS/PPS out of an access unit for in-band parameter updates.
pub fn extract_parameter_sets(au: &[Bytes]) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
    let mut sps = None;
    let mut pps = None;
    for nalu in au {
        if nalu.is_empty() {
            continue;
        }
        match nal_unit_type(nalu[0]) {
            NAL_TYPE_SPS => sps = Some(nalu.to_vec()),
            NAL_TYPE_PPS => pps = Some(nalu.to_vec()),
            _ => {}
        }
    }
    (sps, pps)
}

/// Fields pulled from a sequence parameter set.
#[derive(Debug, Clone)]
pub struct SpsInfo {
    pub width: u32,
    pub height: u32,
    /// RFC 6381 string, e.g. "avc1.42001e".
    pub codec_string: String,
    /// Frame reordering window the stream declares, when it declares one.
    pub reorder_depth: Option<usize>,
    /// pic_order_cnt_type == 2 forbids reordering outright.
    pub no_reordering: bool,
}

impl SpsInfo {
    /// Window size for DTS derivation: the declared reordering window,
    /// zero when reordering is impossible, zero otherwise (growing later
    /// through the extractor's recover-and-retry path).
    pub fn dts_depth(&self) -> usize {
        if self.no_reordering {
            0
        } else {
            self.reorder_depth.unwrap_or(0)
        }
    }
}

/// Parse an SPS NAL unit (header byte included).
pub fn parse_sps(sps: &[u8]) -> Result<SpsInfo> {
    use h264_reader::nal::sps::{PicOrderCntType, SeqParameterSet};
    use h264_reader::rbsp::{decode_nal, BitReader};

    if sps.len() < 4 {
        return Err(anyhow!("SPS too short: {} bytes", sps.len()));
    }

    let rbsp = decode_nal(sps).map_err(|e| anyhow!("SPS rbsp decode: {e:?}"))?;
    let parsed = SeqParameterSet::from_bits(BitReader::new(&rbsp[..]))
        .map_err(|e| anyhow!("SPS parse: {e:?}"))?;

    let (width, height) = parsed
        .pixel_dimensions()
        .map_err(|e| anyhow!("SPS dimensions: {e:?}"))?;

    let codec_string = format!("avc1.{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]);

    let reorder_depth = parsed
        .vui_parameters
        .as_ref()
        .and_then(|vui| vui.bitstream_restrictions.as_ref())
        .map(|b| b.max_num_reorder_frames as usize);

    Ok(SpsInfo {
        width,
        height,
        codec_string,
        reorder_depth,
        no_reordering: matches!(parsed.pic_order_cnt, PicOrderCntType::TypeTwo),
    })
}

/// AVCDecoderConfigurationRecord payload (the contents of the avcC box).
pub fn build_avc_decoder_config(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(11 + sps.len() + pps.len());
    payload.push(1); // configurationVersion
    payload.push(*sps.get(1).unwrap_or(&0)); // profile
    payload.push(*sps.get(2).unwrap_or(&0)); // compatibility
    payload.push(*sps.get(3).unwrap_or(&0)); // level

    // 6 bits reserved + 2 bits lengthSizeMinusOne (4-byte lengths)
    payload.push(0xFF);

    // 3 bits reserved + numOfSequenceParameterSets
    payload.push(0xE0 | 1);
    payload.extend_from_slice(&(sps.len() as u16).to_be_bytes());
    payload.extend_from_slice(sps);

    payload.push(1); // numOfPictureParameterSets
    payload.extend_from_slice(&(pps.len() as u16).to_be_bytes());
    payload.extend_from_slice(pps);

    payload
}

#[cfg(test)]
pub(crate) mod testdata {
    /// 640x480 Baseline, pic_order_cnt_type 2 (no reordering).
    pub const SPS_640X480_POC2: &[u8] = &[
        0x67, 0x42, 0x00, 0x1E, 0xDA, 0x02, 0x80, 0xF4, 0x40,
    ];

    pub const PPS: &[u8] = &[0x68, 0xCE, 0x38, 0x80];
}

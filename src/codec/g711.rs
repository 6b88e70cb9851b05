//! G.711 companding expansion. ISO-BMFF has no G.711 sample entry, so
//! recorded G.711 tracks are expanded to 16-bit LPCM on write.

use bytes::{BufMut, Bytes, BytesMut};

/// Decode one µ-law byte to a linear 16-bit sample.
pub fn mulaw_to_linear(b: u8) -> i16 {
    let b = !b;
    let exponent = ((b & 0x70) >> 4) as i16;
    let mantissa = (b & 0x0F) as i16;
    let magnitude = (((mantissa << 3) + 0x84) << exponent) - 0x84;
    if b & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Decode one A-law byte to a linear 16-bit sample.
pub fn alaw_to_linear(b: u8) -> i16 {
    let b = b ^ 0x55;
    let segment = ((b & 0x70) >> 4) as i16;
    let mantissa = (b & 0x0F) as i16;
    let magnitude = match segment {
        0 => (mantissa << 4) + 8,
        _ => ((mantissa << 4) + 0x108) << (segment - 1),
    };
    if b & 0x80 != 0 {
        magnitude
    } else {
        -magnitude
    }
}

/// Expand a companded frame to big-endian 16-bit LPCM.
pub fn expand_frame(frame: &[u8], mu_law: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(frame.len() * 2);
    for &b in frame {
        let sample = if mu_law {
            mulaw_to_linear(b)
        } else {
            alaw_to_linear(b)
        };
        out.put_i16(sample);
    }
    out.freeze()
}

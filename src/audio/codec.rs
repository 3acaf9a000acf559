//! G.711 mu-law companding
//!
//! Bit-exact with the standard companding tables. The backend and the
//! telephony provider both assume table-accurate values, so these are the
//! classic bias/clip constants, not an approximation.

/// Encoding bias added before the exponent scan (G.711).
const BIAS: i32 = 0x84;

/// Maximum magnitude accepted by the encoder before clipping.
const CLIP: i32 = 32635;

/// Decode one mu-law byte to a signed 16-bit linear PCM sample.
pub fn mulaw_to_linear(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let exponent = (b >> 4) & 0x07;
    let mantissa = b & 0x0F;

    let magnitude = (((mantissa as i32) << 3) + BIAS) << exponent;
    let sample = magnitude - BIAS;

    if sign != 0 { -sample as i16 } else { sample as i16 }
}

/// Encode a signed 16-bit linear PCM sample as one mu-law byte.
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign: u8 = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };

    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    // Highest set exponent bit, scanning down from segment 7.
    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && (magnitude & mask) == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

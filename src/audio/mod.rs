//! Audio transcoding primitives
//!
//! Pure, synchronous building blocks for the two media legs: G.711 mu-law
//! companding for the telephony side and linear-interpolation resampling
//! between the 8kHz telephony rate and the backend's PCM rate. Everything here
//! is CPU-only and runs inside a single frame interval; no allocation beyond
//! the output buffers.

pub mod codec;
pub mod resample;

pub use codec::{linear_to_mulaw, mulaw_to_linear};
pub use resample::resample_linear;

/// Decode a mu-law byte buffer into 16-bit linear PCM samples.
pub fn decode_mulaw(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| mulaw_to_linear(b)).collect()
}

/// Encode 16-bit linear PCM samples as mu-law bytes.
pub fn encode_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| linear_to_mulaw(s)).collect()
}

/// Serialize PCM samples as 16-bit little-endian bytes (the backend wire format).
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Parse 16-bit little-endian bytes into PCM samples. A trailing odd byte is
/// dropped rather than treated as an error.
pub fn pcm_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

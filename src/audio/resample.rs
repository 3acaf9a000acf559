//! Linear-interpolation sample rate conversion
//!
//! Chosen for minimal added latency and simplicity over audio fidelity: the
//! output is not band-limited and will alias on significant downsampling.
//! That trade-off is intentional for a voice relay where every millisecond of
//! buffering is audible.

/// Resample `samples` from `from_rate` to `to_rate`.
///
/// Equal rates return the input unchanged without copying. Otherwise the
/// output length is `max(1, floor(len * to_rate / from_rate))` and each output
/// sample interpolates linearly between its two nearest input neighbors, with
/// the right neighbor clamped to the final sample at the edge. An empty input
/// stays empty.
pub fn resample_linear(samples: Vec<i16>, from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples;
    }

    let len = samples.len();
    let out_len = ((len as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let ratio = from_rate as f64 / to_rate as f64;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let index = (pos as usize).min(len - 1);
        let frac = pos - index as f64;
        let left = samples[index] as f64;
        let right = samples[(index + 1).min(len - 1)] as f64;
        out.push((left + (right - left) * frac).round() as i16);
    }
    out
}

//! Linear-interpolation resampler.
//!
//! Converts mono `f32` blocks between the device rate and the 16 kHz wire rate. Each block is
//! resampled on its own (no state carried across calls), which keeps the function pure and is
//! good enough for speech.

/// Resample `input` from `src_rate` to `dst_rate`.
///
/// The output holds `round(N * dst_rate / src_rate)` samples. Output sample `i` sits at source
/// position `i * src_rate / dst_rate` and is interpolated between the two neighbouring input
/// samples; the right neighbour is clamped to the last input sample. Equal rates return the
/// input unchanged.
pub fn resample_linear(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || input.is_empty() || src_rate == 0 || dst_rate == 0 {
        return input.to_vec();
    }
    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = output_len(input.len(), src_rate, dst_rate);
    let last = input.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx0 = (pos.floor() as usize).min(last);
        let idx1 = (idx0 + 1).min(last);
        let frac = (pos - idx0 as f64) as f32;
        let frac = frac.clamp(0.0, 1.0);
        out.push(input[idx0] * (1.0 - frac) + input[idx1] * frac);
    }
    out
}

/// Output length for `len` input samples: `round(len * dst_rate / src_rate)`.
pub fn output_len(len: usize, src_rate: u32, dst_rate: u32) -> usize {
    if src_rate == dst_rate || src_rate == 0 {
        return len;
    }
    (len as f64 * dst_rate as f64 / src_rate as f64).round() as usize
}

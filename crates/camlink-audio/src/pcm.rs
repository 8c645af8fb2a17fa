//! Sample format conversion between normalized `f32` and wire `i16`.

/// Quantize one normalized sample to signed 16-bit.
///
/// The input is clamped to `[-1, 1]`; negative values scale by 32768 and non-negative values by
/// 32767 so both ends land exactly on `i16::MIN` and `i16::MAX`.
pub fn quantize(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32_768.0) as i16
    } else {
        (s * 32_767.0) as i16
    }
}

pub fn quantize_block(samples: &[f32]) -> Vec<i16> {
    samples.iter().copied().map(quantize).collect()
}

/// Convert wire samples to normalized `f32`, scaled by `gain`.
pub fn dequantize_block(samples: &[i16], gain: f32) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0 * gain).collect()
}

/// Clamp a user volume to `[0, 1]`; NaN counts as silence.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) }
}

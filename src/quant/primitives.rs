//! Stateless numeric quantization functions.
//!
//! None of these validate their input domain: callers are expected to feed
//! values in the documented range, and NaN/Inf pass through unspecified.

use crate::Tensor;
use half::f16;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarizeMode {
    /// Elementwise sign; zero stays zero. Pure.
    Deterministic,
    /// Unbiased stochastic rounding of a [-1, 1] value to {-1, +1}.
    Stochastic,
}

/// Binarize a tensor to {-1, 0, +1} (deterministic) or {-1, +1} (stochastic).
///
/// Stochastic mode treats the input as already living in [-1, 1]: remap to
/// [0, 1], add uniform noise centered at zero with unit range, clamp, round,
/// remap back. The random source is an explicit parameter so seeded runs
/// reproduce; deterministic mode never touches it.
pub fn binarize<R: Rng>(tensor: &Tensor, mode: BinarizeMode, rng: &mut R) -> Tensor {
    let data = tensor.data();
    let out: Vec<f32> = match mode {
        BinarizeMode::Deterministic => data.iter().map(|&v| sign(v)).collect(),
        BinarizeMode::Stochastic => data
            .iter()
            .map(|&v| {
                let noise: f32 = rng.gen::<f32>() - 0.5;
                ((v + 1.0) / 2.0 + noise).clamp(0.0, 1.0).round() * 2.0 - 1.0
            })
            .collect(),
    };
    drop(data);
    Tensor::new(out, tensor.shape())
}

#[inline]
fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Linear fixed-point quantization to `2^k - 1` levels.
#[inline]
pub fn quantize_linear(x: f32, k: u32) -> f32 {
    let levels = (2f64.powi(k as i32) - 1.0) as f32;
    (x * levels).round() / levels
}

/// Quantize a buffer in place with `quantize_linear`.
pub fn quantize_linear_slice(data: &mut [f32], k: u32) {
    let levels = (2f64.powi(k as i32) - 1.0) as f32;
    for v in data {
        *v = (*v * levels).round() / levels;
    }
}

/// Round to `k` significant decimal digits. Idempotent: a second
/// application is a fixed point.
#[inline]
pub fn quantize_decimal(x: f32, k: u32) -> f32 {
    let levels = 10f64.powi(k as i32) as f32;
    (x * levels).round() / levels
}

/// Round-trip through IEEE half precision.
#[inline]
pub fn half_round_trip(x: f32) -> f32 {
    f16::from_f32(x).to_f32()
}

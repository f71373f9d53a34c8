//! Weight-quantization and kernel-scale transfer.
//!
//! A pretrained dense network is factored, per eligible convolution, into a
//! frozen per-element sign tensor and a trainable per-(out,in)-channel scale
//! tensor. The scaled operator reconstructs its weight from the two at every
//! forward pass, quantizing the scales (and optionally the activations) to a
//! configurable bit width. Fine-tuning then updates only the scales.

pub mod factorize;
pub mod primitives;
pub mod scaled_conv;
pub mod transplant;

pub use factorize::factorize;
pub use primitives::{
    binarize, half_round_trip, quantize_decimal, quantize_linear, BinarizeMode,
};
pub use scaled_conv::ScaledConv2d;
pub use transplant::{transplant, TransplantError, TransplantReport};

/// Bit widths for the two quantization paths of a scaled convolution.
///
/// `activation_bits`: 32 leaves activations untouched, 16 round-trips them
/// through half precision, anything else applies linear fixed-point
/// quantization with `2^bits - 1` levels.
/// `scale_bits`: 16 round-trips the scales through half precision, anything
/// else rounds them to `scale_bits` significant decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantSpec {
    pub activation_bits: u32,
    pub scale_bits: u32,
}

impl Default for QuantSpec {
    fn default() -> Self {
        Self {
            activation_bits: 32,
            scale_bits: 16,
        }
    }
}

//! The scaled quantized convolution operator.

use std::cell::RefCell;
use std::rc::Rc;

use crate::nn::{join, Conv2d, Module};
use crate::quant::primitives::{half_round_trip, quantize_decimal, quantize_linear_slice};
use crate::quant::QuantSpec;
use crate::tape::Tape;
use crate::Tensor;

/// Convolution whose weight is reconstructed on every forward pass from a
/// frozen sign tensor and a trainable, quantized scale tensor.
///
/// The handle is cheaply clonable (`Rc` inner) so the same operator can sit
/// in the module tree and in the topology builder's binding-site manifest.
/// It is created empty by the builder and bound exactly once by
/// [`configure`](ScaledConv2d::configure) during transplant; running
/// `forward` before that is a fatal configuration error.
#[derive(Clone)]
pub struct ScaledConv2d {
    inner: Rc<RefCell<Option<Configured>>>,
    quantize_input: bool,
}

struct Configured {
    /// `(C_out·C_in, KH·KW)`, elements in {-1, 0, +1}; never receives
    /// gradients.
    sign: Tensor,
    /// `(C_out·C_in, 1, 1)`; the only trainable tensor of the operator.
    scales: Tensor,
    /// Shared with the source convolution's bias, trainable.
    bias: Option<Tensor>,
    in_channels: usize,
    out_channels: usize,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    spec: QuantSpec,
}

impl ScaledConv2d {
    /// An unconfigured placeholder. `quantize_input` is decided by the
    /// topology builder: the stem operator sees raw image input and turns
    /// it off, every later operator turns it on.
    pub fn placeholder(quantize_input: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(None)),
            quantize_input,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.borrow().is_some()
    }

    pub fn quantizes_input(&self) -> bool {
        self.quantize_input
    }

    /// `(in_channels, out_channels)` copied from the source convolution.
    pub fn channels(&self) -> (usize, usize) {
        let inner = self.inner.borrow();
        let c = inner.as_ref().expect("ScaledConv2d used before configure");
        (c.in_channels, c.out_channels)
    }

    /// Bind the factorized parameters and copy the operator metadata from
    /// `source`. Must be called exactly once, before the first forward.
    pub fn configure(&self, source: &Conv2d, sign: Tensor, scales: Tensor, spec: QuantSpec) {
        let (kh, kw) = source.kernel_size;
        let rows = source.out_channels * source.in_channels;

        assert!(
            self.inner.borrow().is_none(),
            "ScaledConv2d configured twice"
        );
        assert_eq!(
            sign.shape(),
            &[rows, kh * kw],
            "sign tensor does not match source kernel {}x{}x{}x{}",
            source.out_channels,
            source.in_channels,
            kh,
            kw
        );
        assert_eq!(
            scales.shape(),
            &[rows, 1, 1],
            "scale tensor must be per (out, in) channel pair"
        );
        assert!(
            scales.requires_grad,
            "scales must be trainable; signs are the frozen half"
        );
        assert!(
            !sign.requires_grad,
            "sign tensor must be detached from the tape"
        );

        *self.inner.borrow_mut() = Some(Configured {
            sign,
            scales,
            bias: source.bias.clone(),
            in_channels: source.in_channels,
            out_channels: source.out_channels,
            kernel_size: source.kernel_size,
            stride: source.stride,
            padding: source.padding,
            spec,
        });
    }

    /// The effective weight `sign ⊙ q(scales)` reshaped back to 4D.
    /// Gradients flow to the raw scales through a straight-through
    /// estimator on the quantizer and a row-sum on the broadcast.
    fn reconstruct_weight(&self, c: &Configured) -> Tensor {
        let q = quantize_scales(&c.scales, c.spec.scale_bits);
        let flat = scale_rows(&c.sign, &q);
        let (kh, kw) = c.kernel_size;
        flat.reshape(&[c.out_channels, c.in_channels, kh, kw])
    }
}

impl Module for ScaledConv2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        let inner = self.inner.borrow();
        let c = inner
            .as_ref()
            .expect("ScaledConv2d::forward called before configure");

        // Activation path. The input buffer is mutated in place; callers
        // must not rely on it being unmodified unless activation_bits == 32.
        // No tape node: the quantizer is straight-through for the input.
        if self.quantize_input && c.spec.activation_bits != 32 {
            let mut data = input.data_mut();
            if c.spec.activation_bits == 16 {
                for v in data.iter_mut() {
                    *v = half_round_trip(*v);
                }
            } else {
                quantize_linear_slice(&mut data, c.spec.activation_bits);
            }
        }

        let weight = self.reconstruct_weight(c);
        input.conv2d(&weight, c.bias.as_ref(), c.stride, c.padding, (1, 1))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let inner = self.inner.borrow();
        match inner.as_ref() {
            Some(c) => {
                let mut p = vec![c.scales.clone()];
                if let Some(b) = &c.bias {
                    p.push(b.clone());
                }
                p
            }
            None => Vec::new(),
        }
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        let inner = self.inner.borrow();
        if let Some(c) = inner.as_ref() {
            // The sign is serialized too: it cannot be re-derived from the
            // scales, and a checkpoint must restore the operator without
            // the parent network.
            dest.push((join(prefix, "sign"), c.sign.clone()));
            dest.push((join(prefix, "scales"), c.scales.clone()));
            if let Some(b) = &c.bias {
                dest.push((join(prefix, "bias"), b.clone()));
            }
        }
    }
}

impl std::fmt::Debug for ScaledConv2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        match inner.as_ref() {
            Some(c) => write!(
                f,
                "ScaledConv2d({} -> {}, k{}x{}, a{}/s{} bits)",
                c.in_channels,
                c.out_channels,
                c.kernel_size.0,
                c.kernel_size.1,
                c.spec.activation_bits,
                c.spec.scale_bits
            ),
            None => write!(f, "ScaledConv2d(unconfigured)"),
        }
    }
}

/// Quantize the scale tensor with a straight-through estimator: forward
/// quantizes, backward hands the gradient to the raw scales unchanged.
fn quantize_scales(scales: &Tensor, bits: u32) -> Tensor {
    let q: Vec<f32> = {
        let data = scales.data();
        if bits == 16 {
            data.iter().map(|&v| half_round_trip(v)).collect()
        } else {
            data.iter().map(|&v| quantize_decimal(v, bits)).collect()
        }
    };

    let mut out = Tensor::new(q, scales.shape());
    if scales.requires_grad {
        out.requires_grad = true;
        let raw = scales.clone();
        let out_clone = out.clone();
        Tape::push_unary_op(scales, &out, move || {
            if let Some(gout) = out_clone.grad.borrow().as_ref() {
                crate::ops::accumulate_grad(&raw, gout);
            }
        });
    }
    out
}

/// Multiply each row of `sign` `(R, S)` by the matching per-row scale
/// `(R, 1, 1)`. The sign is frozen, so the backward pass only produces the
/// row-summed gradient for the scales.
fn scale_rows(sign: &Tensor, scales: &Tensor) -> Tensor {
    let (r, s) = (sign.shape()[0], sign.shape()[1]);
    assert_eq!(scales.shape()[0], r, "one scale per sign row");

    let out_data: Vec<f32> = {
        let sd = sign.data();
        let qd = scales.data();
        let mut out = vec![0.0f32; r * s];
        for row in 0..r {
            let q = qd[row];
            for col in 0..s {
                out[row * s + col] = sd[row * s + col] * q;
            }
        }
        out
    };

    let mut out = Tensor::new(out_data, sign.shape());
    if scales.requires_grad {
        out.requires_grad = true;
        let sign_t = sign.clone();
        let scales_t = scales.clone();
        let out_clone = out.clone();
        Tape::push_binary_op(sign, scales, &out, move || {
            if let Some(gout) = out_clone.grad.borrow().as_ref() {
                let grad: Vec<f32> = {
                    let sd = sign_t.data();
                    (0..r)
                        .map(|row| {
                            (0..s)
                                .map(|col| gout[row * s + col] * sd[row * s + col])
                                .sum()
                        })
                        .collect()
                };
                crate::ops::accumulate_grad(&scales_t, &grad);
            }
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;

    #[test]
    fn scale_rows_broadcast_and_gradient() {
        Tape::reset();
        let sign = Tensor::new(vec![1.0, -1.0, 0.0, -1.0, 1.0, 1.0], &[2, 3]);
        let scales = Tensor::new(vec![2.0, 0.5], &[2, 1, 1]).requires_grad();

        let w = scale_rows(&sign, &scales);
        assert_eq!(&w.data()[..], &[2.0, -2.0, 0.0, -0.5, 0.5, 0.5]);

        let loss = w.mean();
        loss.backward();
        let g = scales.grad_ref().unwrap();
        // d mean / d scale[r] = sum(sign row) / 6
        assert!((g[0] - (1.0 - 1.0 + 0.0) / 6.0).abs() < 1e-6);
        assert!((g[1] - (-1.0 + 1.0 + 1.0) / 6.0).abs() < 1e-6);
    }

    #[test]
    fn quantize_scales_is_straight_through() {
        Tape::reset();
        let scales = Tensor::new(vec![0.123456, 0.654321], &[2, 1, 1]).requires_grad();
        let q = quantize_scales(&scales, 2);
        assert!((q.data()[0] - 0.12).abs() < 1e-6);
        assert!((q.data()[1] - 0.65).abs() < 1e-6);

        let loss = q.mean();
        loss.backward();
        let g = scales.grad_ref().unwrap();
        // STE: gradient reaches the raw scales untouched.
        assert!((g[0] - 0.5).abs() < 1e-6);
        assert!((g[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "before configure")]
    fn forward_before_configure_is_fatal() {
        let op = ScaledConv2d::placeholder(true);
        let x = Tensor::ones(&[1, 3, 4, 4]);
        let _ = op.forward(&x);
    }

    #[test]
    #[should_panic(expected = "configured twice")]
    fn double_configure_is_fatal() {
        let source = Conv2d::new(2, 2, (3, 3), (1, 1), (1, 1), false);
        let op = ScaledConv2d::placeholder(true);
        let sign = Tensor::zeros(&[4, 9]);
        let scales = Tensor::zeros(&[4, 1, 1]).requires_grad();
        op.configure(&source, sign.clone(), scales.clone(), QuantSpec::default());
        let scales2 = Tensor::zeros(&[4, 1, 1]).requires_grad();
        op.configure(&source, sign, scales2, QuantSpec::default());
    }
}

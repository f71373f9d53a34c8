use rand::rngs::StdRng;
use rand::SeedableRng;

use scalenet::nn::{Conv2d, Module};
use scalenet::quant::{
    binarize, factorize, half_round_trip, quantize_linear, BinarizeMode, QuantSpec, ScaledConv2d,
};
use scalenet::{Tape, Tensor};

/// Configure a scaled operator straight from a dense source conv.
fn configured_from(source: &Conv2d, spec: QuantSpec, quantize_input: bool) -> ScaledConv2d {
    let (weights, scales) = factorize(source);
    let mut rng = StdRng::seed_from_u64(0);
    let sign = binarize(&weights, BinarizeMode::Deterministic, &mut rng);
    let op = ScaledConv2d::placeholder(quantize_input);
    op.configure(source, sign, scales.requires_grad(), spec);
    op
}

#[test]
fn exact_reconstruction_matches_dense_conv() {
    Tape::reset();

    // One nonzero per (out, in) kernel row with a power-of-two magnitude:
    // the row norm equals that magnitude, is exactly representable in half
    // precision, and sign ⊙ scale reconstructs the kernel bit for bit.
    let source = Conv2d::new(3, 2, (3, 3), (1, 1), (1, 1), false);
    {
        let mut w = source.weight.data_mut();
        w.iter_mut().for_each(|v| *v = 0.0);
        let magnitudes = [0.5f32, -0.25, 1.0, -2.0, 0.125, 0.5];
        for (row, &m) in magnitudes.iter().enumerate() {
            w[row * 9 + row % 9] = m;
        }
    }

    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 32,
            scale_bits: 16,
        },
        true,
    );

    let x = Tensor::randn(&[2, 3, 5, 5]);
    let expected = source.forward(&x);
    let actual = op.forward(&x);

    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.data().iter().zip(expected.data().iter()) {
        assert!((a - e).abs() < 1e-5, "{} vs {}", a, e);
    }
}

#[test]
fn toy_network_forward_matches_sign_norm_reference() {
    Tape::reset();

    // The (4, 4, 3, 3) scenario: two nonzeros per row in a 3-4-5 ratio so
    // each row norm is a power of two (exact in half precision), all-ones
    // 8x8 input, activation_bits = 32, scale_bits = 16.
    let source = Conv2d::new(4, 4, (3, 3), (1, 1), (1, 1), false);
    let norms = [0.25f32, 0.5, 1.0, 2.0];
    {
        let mut w = source.weight.data_mut();
        w.iter_mut().for_each(|v| *v = 0.0);
        for row in 0..16 {
            let norm = norms[row % 4];
            let s1 = if row % 2 == 0 { 1.0 } else { -1.0 };
            w[row * 9 + row % 9] = s1 * 0.6 * norm; // 3/5 of the norm
            w[row * 9 + (row + 3) % 9] = -s1 * 0.8 * norm; // 4/5 of the norm
        }
    }

    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 32,
            scale_bits: 16,
        },
        true,
    );

    let x = Tensor::ones(&[1, 4, 8, 8]);
    let actual = op.forward(&x);

    // Reference: direct convolution with weight = sign(K) · norm(K).
    let reference_weight = {
        let w = source.weight.data();
        let mut rw = vec![0.0f32; w.len()];
        for row in 0..16 {
            let norm = norms[row % 4];
            for s in 0..9 {
                rw[row * 9 + s] = w[row * 9 + s].signum() * norm * (w[row * 9 + s] != 0.0) as u8 as f32;
            }
        }
        Tensor::new(rw, &[4, 4, 3, 3])
    };
    let expected = x.conv2d(&reference_weight, None, (1, 1), (1, 1), (1, 1));

    assert_eq!(actual.shape(), &[1, 4, 8, 8]);
    for (a, e) in actual.data().iter().zip(expected.data().iter()) {
        assert!((a - e).abs() < 1e-4, "{} vs {}", a, e);
    }
}

#[test]
fn activation_bits_32_leaves_input_untouched() {
    Tape::reset();
    let source = Conv2d::new(4, 2, (3, 3), (1, 1), (1, 1), false);
    let op = configured_from(&source, QuantSpec::default(), true);

    let x = Tensor::randn(&[1, 4, 6, 6]);
    let before = x.data().clone();
    let _ = op.forward(&x);
    assert_eq!(*x.data(), before);
}

#[test]
fn low_bit_activations_quantize_the_input_in_place() {
    Tape::reset();
    let source = Conv2d::new(4, 2, (3, 3), (1, 1), (1, 1), false);
    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 8,
            scale_bits: 16,
        },
        true,
    );

    let x = Tensor::new(vec![0.3; 4 * 6 * 6], &[1, 4, 6, 6]);
    let _ = op.forward(&x);
    let q = quantize_linear(0.3, 8);
    for &v in x.data().iter() {
        assert_eq!(v, q);
    }
}

#[test]
fn stem_operator_skips_activation_quantization() {
    Tape::reset();
    let source = Conv2d::new(3, 2, (3, 3), (1, 1), (1, 1), false);
    // quantize_input = false: the stem sees the raw image even at 8 bits.
    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 8,
            scale_bits: 16,
        },
        false,
    );

    let x = Tensor::new(vec![0.3; 3 * 6 * 6], &[1, 3, 6, 6]);
    let before = x.data().clone();
    let _ = op.forward(&x);
    assert_eq!(*x.data(), before);
}

#[test]
fn half_precision_activations_round_trip_in_place() {
    Tape::reset();
    let source = Conv2d::new(4, 2, (3, 3), (1, 1), (1, 1), false);
    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 16,
            scale_bits: 16,
        },
        true,
    );

    let raw = 1.0f32 / 3.0;
    let x = Tensor::new(vec![raw; 4 * 6 * 6], &[1, 4, 6, 6]);
    let _ = op.forward(&x);
    for &v in x.data().iter() {
        assert_eq!(v, half_round_trip(raw));
    }
}

#[test]
fn gradients_reach_scales_but_never_signs() {
    Tape::reset();
    let source = Conv2d::new(2, 2, (3, 3), (1, 1), (1, 1), false);
    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 32,
            scale_bits: 4,
        },
        true,
    );

    let x = Tensor::randn(&[1, 2, 6, 6]);
    let out = op.forward(&x);
    let loss = out.mean();
    loss.backward();

    let params = op.parameters();
    assert_eq!(params.len(), 1, "only the scales are trainable (no bias)");
    let scales = &params[0];
    assert!(scales.requires_grad);
    let grad = scales.grad_ref().expect("scales received no gradient");
    assert!(grad.iter().any(|&g| g != 0.0));

    // The sign tensor is a frozen buffer: present in the state, absent from
    // the parameters, and never tracked for gradients.
    let mut state = Vec::new();
    op.state("op", &mut state);
    let sign = &state.iter().find(|(n, _)| n == "op.sign").unwrap().1;
    assert!(!sign.requires_grad);
    assert!(sign.grad_ref().is_none());
}

#[test]
fn scale_step_moves_the_reconstructed_weight() {
    use scalenet::optim::{Optimizer, SGD};

    Tape::reset();
    let source = Conv2d::new(2, 2, (3, 3), (1, 1), (1, 1), false);
    let op = configured_from(
        &source,
        QuantSpec {
            activation_bits: 32,
            scale_bits: 6,
        },
        true,
    );

    let before = {
        let x = Tensor::ones(&[1, 2, 6, 6]);
        op.forward(&x).data().clone()
    };

    let mut optimizer = SGD::new(op.parameters(), 0.5, 0.0, 0.0);
    Tape::reset();
    let x = Tensor::ones(&[1, 2, 6, 6]);
    let loss = op.forward(&x).mean();
    loss.backward();
    optimizer.step();

    Tape::reset();
    let x = Tensor::ones(&[1, 2, 6, 6]);
    let after = op.forward(&x).data().clone();

    let moved = before
        .iter()
        .zip(after.iter())
        .any(|(b, a)| (b - a).abs() > 1e-6);
    assert!(moved, "optimizer step on the scales changed nothing");
}

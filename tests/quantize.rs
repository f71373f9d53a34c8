use rand::rngs::StdRng;
use rand::SeedableRng;

use scalenet::nn::Conv2d;
use scalenet::quant::{
    binarize, factorize, half_round_trip, quantize_decimal, quantize_linear, BinarizeMode,
};
use scalenet::Tensor;

#[test]
fn factorization_sign_and_scale_contract() {
    let conv = Conv2d::new(3, 4, (3, 3), (1, 1), (1, 1), false);
    {
        // Plant some exact zeros among the random weights.
        let mut w = conv.weight.data_mut();
        w[0] = 0.0;
        w[17] = 0.0;
        w[50] = 0.0;
    }

    let (weights, scales) = factorize(&conv);
    assert_eq!(weights.shape(), &[12, 9]);
    assert_eq!(scales.shape(), &[12, 1, 1]);

    // Scales are L2 norms: elementwise nonnegative.
    for &s in scales.data().iter() {
        assert!(s >= 0.0);
    }

    // Deterministic sign lands in {-1, 0, 1} with 0 exactly at zeros.
    let mut rng = StdRng::seed_from_u64(0);
    let sign = binarize(&weights, BinarizeMode::Deterministic, &mut rng);
    for (&s, &w) in sign.data().iter().zip(weights.data().iter()) {
        assert!(s == -1.0 || s == 0.0 || s == 1.0);
        assert_eq!(s == 0.0, w == 0.0);
        if w != 0.0 {
            assert_eq!(s, w.signum());
        }
    }
}

#[test]
fn scales_match_row_norms_exactly() {
    let conv = Conv2d::new(1, 2, (2, 2), (1, 1), (0, 0), false);
    conv.weight
        .data_mut()
        .copy_from_slice(&[0.3, -0.4, 0.0, 0.0, -1.0, 2.0, -2.0, 4.0]);

    let (_, scales) = factorize(&conv);
    assert!((scales.data()[0] - 0.5).abs() < 1e-6);
    assert!((scales.data()[1] - 5.0).abs() < 1e-6);
}

#[test]
fn decimal_quantization_is_idempotent() {
    let values = [
        -273.15f32, -3.2, -0.999, -0.1234567, 0.0, 0.001953125, 0.1, 0.333333, 1.5, 42.42, 287.5,
    ];
    for k in 1..=4u32 {
        for &v in &values {
            let once = quantize_decimal(v, k);
            let twice = quantize_decimal(once, k);
            assert_eq!(once, twice, "quantize_decimal({}, {}) not a fixed point", v, k);
        }
    }
}

#[test]
fn linear_quantization_error_is_bounded_by_half_step() {
    for k in 1..=8u32 {
        let levels = (2f64.powi(k as i32) - 1.0) as f32;
        let mut x = -1.0f32;
        while x <= 1.0 {
            let q = quantize_linear(x, k);
            assert!(
                (q - x).abs() <= 0.5 / levels + 1e-6,
                "k={} x={} q={}",
                k,
                x,
                q
            );
            x += 0.0625;
        }
    }
}

#[test]
fn high_precision_linear_quantization_is_near_identity() {
    for &x in &[-0.987f32, -0.25, 0.1, 0.5, 0.73] {
        let q = quantize_linear(x, 20);
        assert!((q - x).abs() < 1e-5);
    }
}

#[test]
fn half_round_trip_error_is_small_and_stable() {
    for &v in &[0.25f32, 1.0 / 3.0, 0.7071, 2.5] {
        let q = half_round_trip(v);
        assert!((q - v).abs() < v.abs() * 1e-3);
        assert_eq!(q, half_round_trip(q));
    }
}

#[test]
fn stochastic_binarization_is_unbiased_near_its_input() {
    // For x in [-1, 1] the stochastic rule rounds to +1 with probability
    // (x + 1) / 2, so the expectation equals x.
    let x = 0.2f32;
    let t = Tensor::new(vec![x], &[1]);
    let mut rng = StdRng::seed_from_u64(1234);

    let draws = 10_000;
    let mut sum = 0.0f64;
    for _ in 0..draws {
        let b = binarize(&t, BinarizeMode::Stochastic, &mut rng);
        let v = b.data()[0];
        assert!(v == 1.0 || v == -1.0);
        sum += v as f64;
    }
    let mean = sum / draws as f64;

    // 5 sigma of the sample mean is well under 0.05 at 10k draws.
    assert!(
        (mean - x as f64).abs() < 0.05,
        "sample mean {} too far from {}",
        mean,
        x
    );
}

#[test]
fn stochastic_binarization_saturates_at_the_rails() {
    let t = Tensor::new(vec![1.0, -1.0], &[2]);
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..100 {
        let b = binarize(&t, BinarizeMode::Stochastic, &mut rng);
        assert_eq!(b.data()[0], 1.0);
        assert_eq!(b.data()[1], -1.0);
    }
}

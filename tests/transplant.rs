use scalenet::checkpoint::{apply_state, load_state, save_state};
use scalenet::nn::Module;
use scalenet::quant::{transplant, QuantSpec, TransplantError};
use scalenet::resnet::{build_resnet, ConvSlot, DenseConvs, NetworkConfig, ScaledConvs};
use scalenet::{make_scalenet, ScaleNetConfig, Tape, Tensor};

fn spec() -> QuantSpec {
    QuantSpec {
        activation_bits: 32,
        scale_bits: 16,
    }
}

#[test]
fn transplant_aligns_sites_and_channel_metadata() {
    let config = NetworkConfig::cifar10(18);
    let parent = build_resnet(&config, &DenseConvs);
    let child = build_resnet(&config, &ScaledConvs);

    let report = transplant(&parent, &child, spec()).unwrap();
    assert_eq!(report.sites, 17);

    for (p, c) in parent.manifest().iter().zip(child.manifest().iter()) {
        let source = match &p.slot {
            ConvSlot::Dense(conv) => conv,
            _ => panic!("parent site {} is not dense", p.path),
        };
        let target = match &c.slot {
            ConvSlot::Scaled(op) => op,
            _ => panic!("child site {} is not scaled", c.path),
        };
        assert!(target.is_configured());
        assert_eq!(
            target.channels(),
            (source.in_channels, source.out_channels),
            "channel metadata diverged at {}",
            p.path
        );
    }
}

#[test]
fn mismatched_counts_fail_before_any_assignment() {
    let parent = build_resnet(&NetworkConfig::cifar10(18), &DenseConvs);
    let child = build_resnet(&NetworkConfig::cifar10(34), &ScaledConvs);

    match transplant(&parent, &child, spec()) {
        Err(TransplantError::StructuralMismatch { parent, child }) => {
            assert_eq!(parent, 17);
            assert_eq!(child, 33);
        }
        other => panic!("expected StructuralMismatch, got {:?}", other.map(|_| ())),
    }

    // The eager check must fire before any site is touched.
    for site in child.manifest() {
        if let ConvSlot::Scaled(op) = &site.slot {
            assert!(!op.is_configured());
        }
    }
}

#[test]
fn sign_initialization_matches_parent_kernels() {
    let config = NetworkConfig::cifar10(18);
    let parent = build_resnet(&config, &DenseConvs);
    let child = build_resnet(&config, &ScaledConvs);
    transplant(&parent, &child, spec()).unwrap();

    let parent_stem = match &parent.manifest()[0].slot {
        ConvSlot::Dense(conv) => conv,
        _ => unreachable!(),
    };
    let child_stem = match &child.manifest()[0].slot {
        ConvSlot::Scaled(op) => op,
        _ => unreachable!(),
    };

    let mut state = Vec::new();
    child_stem.state("stem", &mut state);
    let sign = &state.iter().find(|(n, _)| n == "stem.sign").unwrap().1;
    let scales = &state.iter().find(|(n, _)| n == "stem.scales").unwrap().1;

    let w = parent_stem.weight.data();
    assert_eq!(sign.len(), w.len());
    for (&s, &v) in sign.data().iter().zip(w.iter()) {
        if v != 0.0 {
            assert_eq!(s, v.signum());
        } else {
            assert_eq!(s, 0.0);
        }
    }

    // Scales hold the per-row L2 norm of the parent kernel.
    let spatial = 9;
    for (row, &s) in scales.data().iter().enumerate() {
        let norm: f32 = w[row * spatial..(row + 1) * spatial]
            .iter()
            .map(|&v| v * v)
            .sum::<f32>()
            .sqrt();
        assert!((s - norm).abs() < 1e-5);
    }
}

#[test]
fn remaining_state_copies_by_name_non_strict() {
    let config = NetworkConfig::cifar10(18);
    let parent = build_resnet(&config, &DenseConvs);
    let child = build_resnet(&config, &ScaledConvs);

    // Stamp recognizable values into the parent classifier and one
    // batch-norm tensor.
    let parent_state = parent.state_dict();
    let classifier = &parent_state
        .iter()
        .find(|(n, _)| n == "classifier.weight")
        .unwrap()
        .1;
    classifier.data_mut().iter_mut().for_each(|v| *v = 0.125);

    let bn_mean = &parent_state
        .iter()
        .find(|(n, _)| n.ends_with("running_mean"))
        .unwrap()
        .1;
    bn_mean.data_mut().iter_mut().for_each(|v| *v = 0.75);

    let report = transplant(&parent, &child, spec()).unwrap();
    assert!(report.copied > 0);
    // Each scaled site contributes its sign and scales to the skip count.
    assert!(report.skipped >= 2 * report.sites);

    let child_state = child.state_dict();
    let child_classifier = &child_state
        .iter()
        .find(|(n, _)| n == "classifier.weight")
        .unwrap()
        .1;
    assert!(child_classifier.data().iter().all(|&v| v == 0.125));

    let child_bn = &child_state
        .iter()
        .find(|(n, _)| n.ends_with("running_mean"))
        .unwrap()
        .1;
    assert!(child_bn.data().iter().all(|&v| v == 0.75));
}

#[test]
fn quantized_network_forward_has_classifier_shape() {
    Tape::reset();
    let config = ScaleNetConfig::new(NetworkConfig::cifar10(18), spec());
    let (net, report) = make_scalenet(&config).unwrap();
    assert_eq!(report.sites, 17);

    net.set_training(false);
    let x = Tensor::randn(&[1, 3, 32, 32]);
    let logits = net.forward(&x);
    assert_eq!(logits.shape(), &[1, 10]);
    assert!(logits.data().iter().all(|v| v.is_finite()));
}

#[test]
fn checkpoint_round_trips_sign_and_scales() {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use scalenet::nn::Conv2d;
    use scalenet::quant::{binarize, factorize, BinarizeMode, ScaledConv2d};

    let dir = std::env::temp_dir().join("scalenet-transplant-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("sconv.ckpt");

    // A configured operator saved to disk...
    let source = Conv2d::new(4, 4, (3, 3), (1, 1), (1, 1), false);
    let (weights, scales) = factorize(&source);
    let sign = binarize(&weights, BinarizeMode::Deterministic, &mut StdRng::seed_from_u64(3));
    let op_a = ScaledConv2d::placeholder(true);
    op_a.configure(&source, sign, scales.requires_grad(), spec());

    let mut state_a = Vec::new();
    op_a.state("features.0.0", &mut state_a);
    save_state(&path, &state_a).unwrap();

    // ...restores into a freshly configured operator with different signs.
    let other = Conv2d::new(4, 4, (3, 3), (1, 1), (1, 1), false);
    let (weights_b, scales_b) = factorize(&other);
    let sign_b = binarize(&weights_b, BinarizeMode::Deterministic, &mut StdRng::seed_from_u64(4));
    let op_b = ScaledConv2d::placeholder(true);
    op_b.configure(&other, sign_b, scales_b.requires_grad(), spec());

    let entries = load_state(&path).unwrap();
    let mut state_b = Vec::new();
    op_b.state("features.0.0", &mut state_b);
    let (loaded, skipped) = apply_state(&state_b, &entries);
    assert_eq!((loaded, skipped), (2, 0)); // sign + scales, no bias

    for ((name_a, t_a), (name_b, t_b)) in state_a.iter().zip(state_b.iter()) {
        assert_eq!(name_a, name_b);
        assert_eq!(*t_a.data(), *t_b.data(), "mismatch at {}", name_a);
    }
}

#[test]
fn pretrained_parent_loads_positionally() {
    use scalenet::checkpoint::load_positional;

    let network = NetworkConfig::cifar10(18);
    let donor = build_resnet(&network, &DenseConvs);

    // The zoo contract: tensors are consumed by enumeration order, names
    // are ignored entirely.
    let renamed: Vec<_> = donor
        .state_dict()
        .into_iter()
        .enumerate()
        .map(|(i, (_, t))| (format!("zoo.tensor{}", i), t))
        .collect();

    let parent = build_resnet(&network, &DenseConvs);
    load_positional(&parent.state_dict(), &renamed).unwrap();

    let child = build_resnet(&network, &ScaledConvs);
    transplant(&parent, &child, spec()).unwrap();

    // The child's stem sign must match the donor's stem kernel signs: the
    // zoo weights flowed through the parent into the factorization.
    let donor_stem = match &donor.manifest()[0].slot {
        ConvSlot::Dense(conv) => conv,
        _ => unreachable!(),
    };
    let child_stem = match &child.manifest()[0].slot {
        ConvSlot::Scaled(op) => op,
        _ => unreachable!(),
    };
    let mut state = Vec::new();
    child_stem.state("stem", &mut state);
    let sign = &state.iter().find(|(n, _)| n == "stem.sign").unwrap().1;

    for (&s, &v) in sign.data().iter().zip(donor_stem.weight.data().iter()) {
        if v != 0.0 {
            assert_eq!(s, v.signum());
        }
    }
}

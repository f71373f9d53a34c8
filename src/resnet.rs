//! Residual network topology with an injected convolution policy.
//!
//! One builder code path serves both the dense parent and the quantized
//! child: the `ConvPolicy` decides what each conv site materializes as, and
//! the builder records every spatial (quantization-eligible) site in an
//! ordered manifest of named binding sites. Transplant alignment rests on
//! that manifest, so the builder must stay the single source of topology.

use crate::activation::Activation;
use crate::nn::{join, BatchNorm2d, Conv2d, Linear, MaxPool2d, Module, Sequential};
use crate::quant::ScaledConv2d;
use crate::Tensor;

/// What a convolution binding site materializes as.
#[derive(Debug, Clone)]
pub enum ConvSlot {
    Dense(Conv2d),
    Scaled(ScaledConv2d),
}

impl Module for ConvSlot {
    fn forward(&self, input: &Tensor) -> Tensor {
        match self {
            ConvSlot::Dense(conv) => conv.forward(input),
            ConvSlot::Scaled(op) => op.forward(input),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        match self {
            ConvSlot::Dense(conv) => conv.parameters(),
            ConvSlot::Scaled(op) => op.parameters(),
        }
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        match self {
            ConvSlot::Dense(conv) => conv.state(prefix, dest),
            ConvSlot::Scaled(op) => op.state(prefix, dest),
        }
    }
}

/// A quantization-eligible convolution site declared by the builder.
#[derive(Debug, Clone)]
pub struct BindingSite {
    pub path: String,
    pub slot: ConvSlot,
}

/// Decides what the builder places at each convolution site.
pub trait ConvPolicy {
    /// Spatial convolution (kernel > 1); these sites are eligible for
    /// quantized replacement. `quantize_input` is false only for the stem,
    /// which sees the raw image.
    fn spatial(
        &self,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        quantize_input: bool,
    ) -> ConvSlot;

    /// Pointwise 1x1 convolution (bottleneck/downsample paths); stays dense.
    fn pointwise(&self, in_channels: usize, out_channels: usize, stride: usize) -> ConvSlot;
}

/// Every site is a plain dense convolution (the float parent).
pub struct DenseConvs;

impl ConvPolicy for DenseConvs {
    fn spatial(
        &self,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        _quantize_input: bool,
    ) -> ConvSlot {
        ConvSlot::Dense(Conv2d::new(
            in_channels,
            out_channels,
            (kernel, kernel),
            (stride, stride),
            (kernel / 2, kernel / 2),
            false,
        ))
    }

    fn pointwise(&self, in_channels: usize, out_channels: usize, stride: usize) -> ConvSlot {
        ConvSlot::Dense(Conv2d::new(
            in_channels,
            out_channels,
            (1, 1),
            (stride, stride),
            (0, 0),
            false,
        ))
    }
}

/// Spatial sites become unconfigured scaled operators (the quantized
/// child); pointwise sites stay dense.
pub struct ScaledConvs;

impl ConvPolicy for ScaledConvs {
    fn spatial(
        &self,
        _in_channels: usize,
        _out_channels: usize,
        _kernel: usize,
        _stride: usize,
        quantize_input: bool,
    ) -> ConvSlot {
        ConvSlot::Scaled(ScaledConv2d::placeholder(quantize_input))
    }

    fn pointwise(&self, in_channels: usize, out_channels: usize, stride: usize) -> ConvSlot {
        DenseConvs.pointwise(in_channels, out_channels, stride)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// 3x3 stem, no stem pooling, 4x4 final average pool (32x32 inputs).
    Cifar,
    /// 7x7/2 stem + 3x3/2 max pool, 7x7 final average pool (224x224 inputs).
    ImageNet,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub depth: usize,
    pub num_classes: usize,
    pub variant: Variant,
    pub activation: Activation,
}

impl NetworkConfig {
    pub fn cifar10(depth: usize) -> Self {
        Self {
            depth,
            num_classes: 10,
            variant: Variant::Cifar,
            activation: Activation::Relu,
        }
    }

    pub fn imagenet(depth: usize) -> Self {
        Self {
            depth,
            num_classes: 1000,
            variant: Variant::ImageNet,
            activation: Activation::Relu,
        }
    }
}

#[derive(Clone, Copy)]
enum BlockKind {
    Basic,
    Bottleneck,
}

fn block_table(depth: usize) -> ([usize; 4], BlockKind, usize) {
    match depth {
        18 => ([2, 2, 2, 2], BlockKind::Basic, 1),
        34 => ([3, 4, 6, 3], BlockKind::Basic, 1),
        50 => ([3, 4, 6, 3], BlockKind::Bottleneck, 4),
        101 => ([3, 4, 23, 3], BlockKind::Bottleneck, 4),
        152 => ([3, 8, 36, 3], BlockKind::Bottleneck, 4),
        other => panic!("unsupported ResNet depth {}", other),
    }
}

/// `act(body(x) + shortcut(x))`; the shortcut is a 1x1 conv + batch norm
/// when the block changes shape, identity otherwise.
struct ResidualBlock {
    body: Sequential,
    downsample: Option<Sequential>,
    act_out: Box<dyn Module>,
}

impl Module for ResidualBlock {
    fn forward(&self, input: &Tensor) -> Tensor {
        let out = self.body.forward(input);
        let shortcut = match &self.downsample {
            Some(ds) => ds.forward(input),
            None => input.clone(),
        };
        self.act_out.forward(&(&out + &shortcut))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.body.parameters();
        if let Some(ds) = &self.downsample {
            p.extend(ds.parameters());
        }
        p
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        self.body.state(&join(prefix, "body"), dest);
        if let Some(ds) = &self.downsample {
            ds.state(&join(prefix, "downsample"), dest);
        }
    }

    fn set_training(&self, training: bool) {
        self.body.set_training(training);
        if let Some(ds) = &self.downsample {
            ds.set_training(training);
        }
    }
}

pub struct ResNet {
    features: Sequential,
    classifier: Linear,
    pool_size: usize,
    manifest: Vec<BindingSite>,
}

impl ResNet {
    /// Ordered binding sites for the transplant protocol.
    pub fn manifest(&self) -> &[BindingSite] {
        &self.manifest
    }

    pub fn state_dict(&self) -> Vec<(String, Tensor)> {
        let mut dest = Vec::new();
        self.state("", &mut dest);
        dest
    }
}

impl Module for ResNet {
    fn forward(&self, input: &Tensor) -> Tensor {
        let x = self.features.forward(input);
        let x = x.avg_pool2d(self.pool_size);
        let n = x.shape()[0];
        let flat = x.len() / n;
        self.classifier.forward(&x.reshape(&[n, flat]))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = self.features.parameters();
        p.extend(self.classifier.parameters());
        p
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        self.features.state(&join(prefix, "features"), dest);
        self.classifier.state(&join(prefix, "classifier"), dest);
    }

    fn set_training(&self, training: bool) {
        self.features.set_training(training);
    }
}

struct Builder<'a> {
    policy: &'a dyn ConvPolicy,
    activation: Activation,
    manifest: Vec<BindingSite>,
}

impl Builder<'_> {
    fn spatial_conv(
        &mut self,
        path: String,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        quantize_input: bool,
    ) -> Box<dyn Module> {
        let slot = self
            .policy
            .spatial(in_channels, out_channels, kernel, stride, quantize_input);
        self.manifest.push(BindingSite {
            path,
            slot: slot.clone(),
        });
        Box::new(slot)
    }

    fn pointwise_conv(
        &self,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
    ) -> Box<dyn Module> {
        Box::new(self.policy.pointwise(in_channels, out_channels, stride))
    }

    fn act(&self) -> Box<dyn Module> {
        self.activation.module()
    }

    fn norm(&self, channels: usize) -> Box<dyn Module> {
        Box::new(BatchNorm2d::new(channels))
    }

    fn basic_body(
        &mut self,
        prefix: &str,
        in_channels: usize,
        planes: usize,
        stride: usize,
    ) -> Sequential {
        Sequential::new(vec![
            self.spatial_conv(format!("{}.conv1", prefix), in_channels, planes, 3, stride, true),
            self.norm(planes),
            self.act(),
            self.spatial_conv(format!("{}.conv2", prefix), planes, planes, 3, 1, true),
            self.norm(planes),
        ])
    }

    fn bottleneck_body(
        &mut self,
        prefix: &str,
        in_channels: usize,
        planes: usize,
        stride: usize,
    ) -> Sequential {
        Sequential::new(vec![
            self.pointwise_conv(in_channels, planes, 1),
            self.norm(planes),
            self.act(),
            self.spatial_conv(format!("{}.conv2", prefix), planes, planes, 3, stride, true),
            self.norm(planes),
            self.act(),
            self.pointwise_conv(planes, 4 * planes, 1),
            self.norm(4 * planes),
        ])
    }

    fn downsample(&self, in_channels: usize, out_channels: usize, stride: usize) -> Sequential {
        Sequential::new(vec![
            self.pointwise_conv(in_channels, out_channels, stride),
            self.norm(out_channels),
        ])
    }

    fn make_stage(
        &mut self,
        stage: usize,
        in_channels: &mut usize,
        planes: usize,
        blocks: usize,
        stride: usize,
        kind: BlockKind,
        expansion: usize,
    ) -> Sequential {
        let out_channels = planes * expansion;
        let mut layers: Vec<Box<dyn Module>> = Vec::with_capacity(blocks);

        for b in 0..blocks {
            let s = if b == 0 { stride } else { 1 };
            let needs_downsample = s != 1 || *in_channels != out_channels;
            let downsample =
                (b == 0 && needs_downsample).then(|| self.downsample(*in_channels, out_channels, s));

            let prefix = format!("stage{}.block{}", stage, b);
            let body = match kind {
                BlockKind::Basic => self.basic_body(&prefix, *in_channels, planes, s),
                BlockKind::Bottleneck => self.bottleneck_body(&prefix, *in_channels, planes, s),
            };

            layers.push(Box::new(ResidualBlock {
                body,
                downsample,
                act_out: self.act(),
            }));
            *in_channels = out_channels;
        }

        Sequential::new(layers)
    }
}

/// Build a residual network. Swapping only the policy is guaranteed to
/// preserve module count and manifest order, which the transplant relies on.
pub fn build_resnet(config: &NetworkConfig, policy: &dyn ConvPolicy) -> ResNet {
    let (blocks, kind, expansion) = block_table(config.depth);

    let mut builder = Builder {
        policy,
        activation: config.activation,
        manifest: Vec::new(),
    };

    let mut features: Vec<Box<dyn Module>> = Vec::new();

    // The stem sees raw image input, so its operator never quantizes
    // activations.
    match config.variant {
        Variant::Cifar => {
            features.push(Box::new(Sequential::new(vec![
                builder.spatial_conv("stem.conv".to_string(), 3, 64, 3, 1, false),
                builder.norm(64),
                builder.act(),
            ])));
        }
        Variant::ImageNet => {
            features.push(Box::new(Sequential::new(vec![
                builder.spatial_conv("stem.conv".to_string(), 3, 64, 7, 2, false),
                builder.norm(64),
                builder.act(),
                Box::new(MaxPool2d::new(3, 2, 1)),
            ])));
        }
    }

    let mut in_channels = 64;
    let planes = [64, 128, 256, 512];
    let strides = [1, 2, 2, 2];
    for stage in 0..4 {
        let seq = builder.make_stage(
            stage + 1,
            &mut in_channels,
            planes[stage],
            blocks[stage],
            strides[stage],
            kind,
            expansion,
        );
        features.push(Box::new(seq));
    }

    let pool_size = match config.variant {
        Variant::Cifar => 4,
        Variant::ImageNet => 7,
    };

    ResNet {
        features: Sequential::new(features),
        classifier: Linear::new(512 * expansion, config.num_classes, true),
        pool_size,
        manifest: builder.manifest,
    }
}

use crate::Tensor;
use rand::distributions::{Distribution, Uniform};
use std::cell::Cell;

/// Trait for any differentiable network component.
pub trait Module {
    fn forward(&self, input: &Tensor) -> Tensor;

    /// Trainable parameters, for the optimizer. Frozen buffers (signs,
    /// running statistics) are excluded.
    fn parameters(&self) -> Vec<Tensor>;

    /// Collect every named state tensor (parameters and buffers) under
    /// `prefix`. This is the seam used by checkpoints and the non-strict
    /// parameter transplant.
    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>);

    /// Switch train/eval behavior (batch-norm statistics). Default: no-op.
    fn set_training(&self, _training: bool) {}
}

pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Linear (fully connected) layer: `y = xWᵀ + b`
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, with_bias: bool) -> Self {
        // He-style uniform initialization
        let scale = (2.0 / in_features as f32).sqrt();
        let dist = Uniform::new_inclusive(-scale, scale);

        let mut rng = rand::thread_rng();
        let weight_data: Vec<f32> = (0..in_features * out_features)
            .map(|_| dist.sample(&mut rng))
            .collect();

        let weight = Tensor::new(weight_data, &[out_features, in_features]).requires_grad();

        let bias = with_bias
            .then(|| Tensor::new(vec![0.0; out_features], &[out_features]).requires_grad());

        Self { weight, bias }
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> Tensor {
        let mut out = input.matmul(&self.weight.transpose());
        if let Some(b) = &self.bias {
            out = out.add_broadcast(b);
        }
        out
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        dest.push((join(prefix, "weight"), self.weight.clone()));
        if let Some(b) = &self.bias {
            dest.push((join(prefix, "bias"), b.clone()));
        }
    }
}

/// Dense 2D convolution layer. Cloning shares the parameter tensors, so a
/// clone in a binding-site manifest aliases the layer inside the network.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: Tensor, // [out_channels, in_channels, kh, kw]
    pub bias: Option<Tensor>,
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
}

impl Conv2d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        with_bias: bool,
    ) -> Self {
        let (kh, kw) = kernel_size;
        let fan_in = in_channels * kh * kw;
        let scale = (2.0 / fan_in as f32).sqrt();
        let dist = Uniform::new_inclusive(-scale, scale);

        let mut rng = rand::thread_rng();
        let weight_data: Vec<f32> = (0..out_channels * fan_in)
            .map(|_| dist.sample(&mut rng))
            .collect();

        let weight =
            Tensor::new(weight_data, &[out_channels, in_channels, kh, kw]).requires_grad();
        let bias = with_bias
            .then(|| Tensor::new(vec![0.0; out_channels], &[out_channels]).requires_grad());

        Self {
            weight,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
        }
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.conv2d(
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
            (1, 1),
        )
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        dest.push((join(prefix, "weight"), self.weight.clone()));
        if let Some(b) = &self.bias {
            dest.push((join(prefix, "bias"), b.clone()));
        }
    }
}

/// Batch normalization over the channel dimension of [N, C, H, W] inputs.
pub struct BatchNorm2d {
    pub weight: Tensor, // gamma
    pub bias: Tensor,   // beta
    pub running_mean: Tensor,
    pub running_var: Tensor,
    channels: usize,
    momentum: f32,
    eps: f32,
    training: Cell<bool>,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        Self {
            weight: Tensor::ones(&[channels]).requires_grad(),
            bias: Tensor::zeros(&[channels]).requires_grad(),
            running_mean: Tensor::zeros(&[channels]),
            running_var: Tensor::ones(&[channels]),
            channels,
            momentum: 0.1,
            eps: 1e-5,
            training: Cell::new(true),
        }
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        assert_eq!(input.shape().len(), 4, "BatchNorm2d expects [N, C, H, W]");
        let (n, c, h, w) = (
            input.shape()[0],
            input.shape()[1],
            input.shape()[2],
            input.shape()[3],
        );
        assert_eq!(c, self.channels, "BatchNorm2d: channel mismatch");

        let plane = h * w;
        let reduce = (n * plane) as f32;
        let training = self.training.get();

        let (mean, var) = if training {
            let x = input.data();
            let mut mean = vec![0.0f32; c];
            let mut var = vec![0.0f32; c];
            for s in 0..n {
                for ch in 0..c {
                    let base = (s * c + ch) * plane;
                    mean[ch] += x[base..base + plane].iter().sum::<f32>();
                }
            }
            for m in &mut mean {
                *m /= reduce;
            }
            for s in 0..n {
                for ch in 0..c {
                    let base = (s * c + ch) * plane;
                    let m = mean[ch];
                    var[ch] += x[base..base + plane]
                        .iter()
                        .map(|&v| (v - m) * (v - m))
                        .sum::<f32>();
                }
            }
            for v in &mut var {
                *v /= reduce;
            }
            drop(x);

            // Update running statistics (no gradient tracking).
            {
                let mut rm = self.running_mean.data_mut();
                let mut rv = self.running_var.data_mut();
                for ch in 0..c {
                    rm[ch] = (1.0 - self.momentum) * rm[ch] + self.momentum * mean[ch];
                    rv[ch] = (1.0 - self.momentum) * rv[ch] + self.momentum * var[ch];
                }
            }
            (mean, var)
        } else {
            (
                self.running_mean.data().clone(),
                self.running_var.data().clone(),
            )
        };

        let inv_std: Vec<f32> = var.iter().map(|&v| 1.0 / (v + self.eps).sqrt()).collect();

        let mut xhat = vec![0.0f32; input.len()];
        let mut out_data = vec![0.0f32; input.len()];
        {
            let x = input.data();
            let g = self.weight.data();
            let b = self.bias.data();
            for s in 0..n {
                for ch in 0..c {
                    let base = (s * c + ch) * plane;
                    let m = mean[ch];
                    let is = inv_std[ch];
                    let gamma = g[ch];
                    let beta = b[ch];
                    for i in 0..plane {
                        let norm = (x[base + i] - m) * is;
                        xhat[base + i] = norm;
                        out_data[base + i] = gamma * norm + beta;
                    }
                }
            }
        }

        let mut output = Tensor::new(out_data, input.shape());

        if input.requires_grad || self.weight.requires_grad || self.bias.requires_grad {
            output.requires_grad = true;

            let x_in = input.clone();
            let gamma = self.weight.clone();
            let beta = self.bias.clone();
            let out = output.clone();

            crate::tape::Tape::push_binary_op(input, &self.weight, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if beta.requires_grad {
                        let mut gb = vec![0.0f32; c];
                        for s in 0..n {
                            for ch in 0..c {
                                let base = (s * c + ch) * plane;
                                gb[ch] += gout[base..base + plane].iter().sum::<f32>();
                            }
                        }
                        crate::ops::accumulate_grad(&beta, &gb);
                    }
                    if gamma.requires_grad {
                        let mut gg = vec![0.0f32; c];
                        for s in 0..n {
                            for ch in 0..c {
                                let base = (s * c + ch) * plane;
                                for i in 0..plane {
                                    gg[ch] += gout[base + i] * xhat[base + i];
                                }
                            }
                        }
                        crate::ops::accumulate_grad(&gamma, &gg);
                    }
                    if x_in.requires_grad {
                        let gd = gamma.data();
                        let mut gin = vec![0.0f32; x_in.len()];
                        if training {
                            // Per channel: gx = inv_std * gamma *
                            //   (g - mean(g) - xhat * mean(g * xhat))
                            let mut sum_g = vec![0.0f32; c];
                            let mut sum_gx = vec![0.0f32; c];
                            for s in 0..n {
                                for ch in 0..c {
                                    let base = (s * c + ch) * plane;
                                    for i in 0..plane {
                                        sum_g[ch] += gout[base + i];
                                        sum_gx[ch] += gout[base + i] * xhat[base + i];
                                    }
                                }
                            }
                            for s in 0..n {
                                for ch in 0..c {
                                    let base = (s * c + ch) * plane;
                                    let k = gd[ch] * inv_std[ch];
                                    let mg = sum_g[ch] / reduce;
                                    let mgx = sum_gx[ch] / reduce;
                                    for i in 0..plane {
                                        gin[base + i] = k
                                            * (gout[base + i] - mg - xhat[base + i] * mgx);
                                    }
                                }
                            }
                        } else {
                            // Running stats are constants in eval mode.
                            for s in 0..n {
                                for ch in 0..c {
                                    let base = (s * c + ch) * plane;
                                    let k = gd[ch] * inv_std[ch];
                                    for i in 0..plane {
                                        gin[base + i] = k * gout[base + i];
                                    }
                                }
                            }
                        }
                        drop(gd);
                        crate::ops::accumulate_grad(&x_in, &gin);
                    }
                }
            });
        }

        output
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone(), self.bias.clone()]
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        dest.push((join(prefix, "weight"), self.weight.clone()));
        dest.push((join(prefix, "bias"), self.bias.clone()));
        dest.push((join(prefix, "running_mean"), self.running_mean.clone()));
        dest.push((join(prefix, "running_var"), self.running_var.clone()));
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }
}

/// Max pooling layer (ImageNet-style stem).
pub struct MaxPool2d {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl MaxPool2d {
    pub fn new(kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel,
            stride,
            padding,
        }
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.max_pool2d(self.kernel, self.stride, self.padding)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state(&self, _prefix: &str, _dest: &mut Vec<(String, Tensor)>) {}
}

/// A stack of layers applied in sequence. State names are the layer index.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.layers.iter().fold(input.clone(), |x, l| l.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn state(&self, prefix: &str, dest: &mut Vec<(String, Tensor)>) {
        for (i, layer) in self.layers.iter().enumerate() {
            layer.state(&join(prefix, &i.to_string()), dest);
        }
    }

    fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }
}

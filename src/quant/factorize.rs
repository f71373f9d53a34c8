//! Kernel factorization: split a dense convolution kernel into the raw
//! material for a sign/scale decomposition.

use crate::nn::Conv2d;
use crate::Tensor;

/// Factor a conv kernel of shape `(C_out, C_in, KH, KW)` into
/// `weights` of shape `(C_out·C_in, KH·KW)` (the kernel rows, verbatim) and
/// `scales` of shape `(C_out·C_in, 1, 1)` holding each row's L2 norm.
///
/// Note that `sign(weights) * scales` does not reconstruct the kernel: the
/// scale is the row norm, not a per-element magnitude. That is the intended
/// decomposition; the scales are initialized from the norm and then
/// fine-tuned by the optimizer, while the signs stay frozen.
pub fn factorize(conv: &Conv2d) -> (Tensor, Tensor) {
    let shape = conv.weight.shape();
    assert_eq!(shape.len(), 4, "factorize: kernel must be 4D");
    let (c_out, c_in, kh, kw) = (shape[0], shape[1], shape[2], shape[3]);

    let rows = c_out * c_in;
    let spatial = kh * kw;

    let data = conv.weight.data();
    let weights = Tensor::new(data.clone(), &[rows, spatial]);

    let mut scales = vec![0.0f32; rows];
    for (r, s) in scales.iter_mut().enumerate() {
        let row = &data[r * spatial..(r + 1) * spatial];
        *s = row.iter().map(|&v| v * v).sum::<f32>().sqrt();
    }
    drop(data);

    (weights, Tensor::new(scales, &[rows, 1, 1]))
}

use crate::{gemm, tape::Tape, Tensor};
use std::ops::{Add, Mul, Sub};

// Helper to accumulate gradients into a tensor's grad buffer
#[inline]
pub fn accumulate_grad(t: &Tensor, src: &[f32]) {
    let mut slot = t.grad.borrow_mut();
    if slot.is_none() {
        *slot = Some(vec![0.0; t.len()]);
    }
    let g = slot.as_mut().unwrap();
    for (gi, &s) in g.iter_mut().zip(src) {
        *gi += s;
    }
}

#[inline]
pub fn accumulate_grad_scaled(t: &Tensor, src: &[f32], scale: f32) {
    let mut slot = t.grad.borrow_mut();
    if slot.is_none() {
        *slot = Some(vec![0.0; t.len()]);
    }
    let g = slot.as_mut().unwrap();
    for (gi, &s) in g.iter_mut().zip(src) {
        *gi += scale * s;
    }
}

// Borrow the grad buffer, zero-initializing it on first touch.
#[inline]
fn grad_slot(t: &Tensor) -> std::cell::RefMut<'_, Option<Vec<f32>>> {
    let mut slot = t.grad.borrow_mut();
    if slot.is_none() {
        *slot = Some(vec![0.0; t.len()]);
    }
    slot
}

impl Add for &Tensor {
    type Output = Tensor;
    fn add(self, other: &Tensor) -> Tensor {
        assert_eq!(self.len(), other.len(), "Tensor dimensions must match");

        let out_data: Vec<f32> = {
            let a = self.data();
            let b = other.data();
            a.iter().zip(b.iter()).map(|(&x, &y)| x + y).collect()
        };

        let mut out = Tensor::new(out_data, &self.shape);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad(&b, gout);
                    }
                }
            });
        }
        out
    }
}

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        assert_eq!(self.len(), other.len(), "Tensor dimensions must match");

        let out_data: Vec<f32> = {
            let a = self.data();
            let b = other.data();
            a.iter().zip(b.iter()).map(|(&x, &y)| x - y).collect()
        };

        let mut out = Tensor::new(out_data, &self.shape);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, gout);
                    }
                    if b.requires_grad {
                        accumulate_grad_scaled(&b, gout, -1.0);
                    }
                }
            });
        }
        out
    }
}

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        assert_eq!(self.len(), other.len(), "Tensor dimensions must match");

        let out_data: Vec<f32> = {
            let a = self.data();
            let b = other.data();
            a.iter().zip(b.iter()).map(|(&x, &y)| x * y).collect()
        };

        let mut out = Tensor::new(out_data, &self.shape);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad.borrow().as_ref() {
                    if a.requires_grad {
                        let grad: Vec<f32> = {
                            let bdat = b.data();
                            gout.iter().zip(bdat.iter()).map(|(&g, &v)| g * v).collect()
                        };
                        accumulate_grad(&a, &grad);
                    }
                    if b.requires_grad {
                        let grad: Vec<f32> = {
                            let adat = a.data();
                            gout.iter().zip(adat.iter()).map(|(&g, &v)| g * v).collect()
                        };
                        accumulate_grad(&b, &grad);
                    }
                }
            });
        }
        out
    }
}

// Owned/borrowed operator combinations
impl Add<&Tensor> for Tensor {
    type Output = Tensor;
    fn add(self, other: &Tensor) -> Tensor {
        (&self).add(other)
    }
}
impl Add<Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, other: Tensor) -> Tensor {
        self.add(&other)
    }
}
impl Add for Tensor {
    type Output = Tensor;
    fn add(self, other: Tensor) -> Tensor {
        (&self).add(&other)
    }
}
impl Sub<&Tensor> for Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        (&self).sub(other)
    }
}
impl Sub<Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, other: Tensor) -> Tensor {
        self.sub(&other)
    }
}
impl Sub for Tensor {
    type Output = Tensor;
    fn sub(self, other: Tensor) -> Tensor {
        (&self).sub(&other)
    }
}
impl Mul<&Tensor> for Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        (&self).mul(other)
    }
}
impl Mul<Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, other: Tensor) -> Tensor {
        self.mul(&other)
    }
}
impl Mul for Tensor {
    type Output = Tensor;
    fn mul(self, other: Tensor) -> Tensor {
        (&self).mul(&other)
    }
}

impl Tensor {
    /// Matrix multiplication through the sgemm front-end.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert_eq!(self.shape.len(), 2, "First tensor must be 2D");
        assert_eq!(other.shape.len(), 2, "Second tensor must be 2D");

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        assert_eq!(
            k, other.shape[0],
            "Inner dimensions must match: {}x{} @ {}x{}",
            m, k, other.shape[0], n
        );

        let mut result = vec![0.0f32; m * n];
        {
            let a_data = self.data();
            let b_data = other.data();
            gemm::sgemm_rowmajor(
                gemm::n(),
                gemm::n(),
                m as i32,
                n as i32,
                k as i32,
                1.0,
                &a_data,
                &b_data,
                0.0,
                &mut result,
            );
        }

        let mut output = Tensor::new(result, &[m, n]);

        if self.requires_grad || other.requires_grad {
            output.requires_grad = true;

            let a = self.clone();
            let b = other.clone();
            let out = output.clone();

            Tape::push_binary_op(self, other, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    if a.requires_grad {
                        // dL/dA = dL/dC @ Bᵀ
                        let bdat = b.data();
                        let mut slot = grad_slot(&a);
                        let ga = slot.as_mut().unwrap();
                        gemm::sgemm_rowmajor(
                            gemm::n(),
                            gemm::t(),
                            m as i32,
                            k as i32,
                            n as i32,
                            1.0,
                            gout,
                            &bdat,
                            1.0,
                            ga,
                        );
                    }
                    if b.requires_grad {
                        // dL/dB = Aᵀ @ dL/dC
                        let adat = a.data();
                        let mut slot = grad_slot(&b);
                        let gb = slot.as_mut().unwrap();
                        gemm::sgemm_rowmajor(
                            gemm::t(),
                            gemm::n(),
                            k as i32,
                            n as i32,
                            m as i32,
                            1.0,
                            &adat,
                            gout,
                            1.0,
                            gb,
                        );
                    }
                }
            });
        }

        output
    }

    /// Random tensor with values from the standard normal distribution
    pub fn randn(shape: &[usize]) -> Tensor {
        use rand_distr::{Distribution, StandardNormal};
        let mut rng = rand::thread_rng();

        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| StandardNormal.sample(&mut rng)).collect();

        Tensor::new(data, shape)
    }

    pub fn relu(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.max(0.0)).collect();
        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad: Vec<f32> = {
                        let x = input.data();
                        gout.iter()
                            .zip(x.iter())
                            .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
                            .collect()
                    };
                    accumulate_grad(&input, &grad);
                }
            });
        }

        output
    }

    pub fn tanh(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.tanh()).collect();
        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad: Vec<f32> = {
                        let y = out.data(); // tanh(x) from forward
                        gout.iter()
                            .zip(y.iter())
                            .map(|(&g, &t)| g * (1.0 - t * t))
                            .collect()
                    };
                    accumulate_grad(&input, &grad);
                }
            });
        }

        output
    }

    /// Hard tanh: clamp to [-1, 1]; gradient passes only inside the band.
    pub fn hardtanh(&self) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.clamp(-1.0, 1.0)).collect();
        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let grad: Vec<f32> = {
                        let x = input.data();
                        gout.iter()
                            .zip(x.iter())
                            .map(|(&g, &v)| if (-1.0..=1.0).contains(&v) { g } else { 0.0 })
                            .collect()
                    };
                    accumulate_grad(&input, &grad);
                }
            });
        }

        output
    }

    /// View with a new shape (element count preserved); gradient is an
    /// identity pass-through.
    pub fn reshape(&self, shape: &[usize]) -> Tensor {
        assert_eq!(
            self.len(),
            shape.iter().product::<usize>(),
            "reshape: cannot view {:?} as {:?}",
            self.shape(),
            shape
        );

        let mut output = Tensor::new(self.data().clone(), shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    accumulate_grad(&input, gout);
                }
            });
        }

        output
    }

    /// 2D convolution. Input [N, C, H, W], weight [O, C, KH, KW], output
    /// [N, O, OH, OW]. Forward runs im2col + sgemm per sample; backward
    /// computes weight/input gradients with sgemm and a col2im scatter.
    pub fn conv2d(
        &self,
        weight: &Tensor,
        bias: Option<&Tensor>,
        stride: (usize, usize),
        padding: (usize, usize),
        dilation: (usize, usize),
    ) -> Tensor {
        assert_eq!(self.shape.len(), 4, "conv2d: input must be [N, C, H, W]");
        assert_eq!(weight.shape.len(), 4, "conv2d: weight must be [O, C, KH, KW]");
        assert_eq!(
            self.shape[1], weight.shape[1],
            "conv2d: input channels {} do not match weight channels {}",
            self.shape[1], weight.shape[1]
        );

        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let (o, kh, kw) = (weight.shape[0], weight.shape[2], weight.shape[3]);
        if let Some(b) = bias {
            assert_eq!(b.len(), o, "conv2d: bias length must equal out channels");
        }

        let (sh, sw) = stride;
        let (ph, pw) = padding;
        let (dh, dw) = dilation;

        let oh = (h + 2 * ph - dh * (kh - 1) - 1) / sh + 1;
        let ow = (w + 2 * pw - dw * (kw - 1) - 1) / sw + 1;
        let ohw = oh * ow;
        let ckk = c * kh * kw;

        let dims = ConvDims {
            n,
            c,
            h,
            w,
            o,
            kh,
            kw,
            oh,
            ow,
            sh,
            sw,
            ph,
            pw,
            dh,
            dw,
        };

        let mut out_data = vec![0.0f32; n * o * ohw];
        {
            let x = self.data();
            let wd = weight.data();
            let mut col = vec![0.0f32; ckk * ohw];
            for s in 0..n {
                im2col(&x[s * c * h * w..(s + 1) * c * h * w], &dims, &mut col);
                gemm::sgemm_rowmajor(
                    gemm::n(),
                    gemm::n(),
                    o as i32,
                    ohw as i32,
                    ckk as i32,
                    1.0,
                    &wd,
                    &col,
                    0.0,
                    &mut out_data[s * o * ohw..(s + 1) * o * ohw],
                );
            }
            if let Some(b) = bias {
                let bd = b.data();
                for s in 0..n {
                    for oc in 0..o {
                        let base = (s * o + oc) * ohw;
                        let bv = bd[oc];
                        for v in &mut out_data[base..base + ohw] {
                            *v += bv;
                        }
                    }
                }
            }
        }

        let mut output = Tensor::new(out_data, &[n, o, oh, ow]);

        let any_grad =
            self.requires_grad || weight.requires_grad || bias.map_or(false, |b| b.requires_grad);
        if any_grad {
            output.requires_grad = true;

            let input = self.clone();
            let wt = weight.clone();
            let bt = bias.cloned();
            let out = output.clone();

            // Record against input and weight; the bias gradient is handled
            // inside the same closure.
            Tape::push_binary_op(self, weight, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    conv2d_backward(&input, &wt, bt.as_ref(), gout, &dims);
                }
            });
        }

        output
    }

    /// Non-overlapping average pooling with a square window.
    pub fn avg_pool2d(&self, k: usize) -> Tensor {
        assert_eq!(self.shape.len(), 4, "avg_pool2d: input must be [N, C, H, W]");
        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        assert!(
            h % k == 0 && w % k == 0,
            "avg_pool2d: window {} does not tile {}x{}",
            k,
            h,
            w
        );

        let (oh, ow) = (h / k, w / k);
        let inv = 1.0 / (k * k) as f32;

        let mut result = vec![0.0f32; n * c * oh * ow];
        {
            let x = self.data();
            for s in 0..n {
                for ch in 0..c {
                    let plane = (s * c + ch) * h * w;
                    for i in 0..oh {
                        for j in 0..ow {
                            let mut acc = 0.0;
                            for di in 0..k {
                                for dj in 0..k {
                                    acc += x[plane + (i * k + di) * w + (j * k + dj)];
                                }
                            }
                            result[(s * c + ch) * oh * ow + i * ow + j] = acc * inv;
                        }
                    }
                }
            }
        }

        let mut output = Tensor::new(result, &[n, c, oh, ow]);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let mut slot = grad_slot(&input);
                    let gin = slot.as_mut().unwrap();
                    for s in 0..n {
                        for ch in 0..c {
                            let plane = (s * c + ch) * h * w;
                            for i in 0..oh {
                                for j in 0..ow {
                                    let g = gout[(s * c + ch) * oh * ow + i * ow + j] * inv;
                                    for di in 0..k {
                                        for dj in 0..k {
                                            gin[plane + (i * k + di) * w + (j * k + dj)] += g;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });
        }

        output
    }

    /// Max pooling; gradient routes to the argmax of each window.
    pub fn max_pool2d(&self, kernel: usize, stride: usize, padding: usize) -> Tensor {
        assert_eq!(self.shape.len(), 4, "max_pool2d: input must be [N, C, H, W]");
        let (n, c, h, w) = (self.shape[0], self.shape[1], self.shape[2], self.shape[3]);
        let oh = (h + 2 * padding - kernel) / stride + 1;
        let ow = (w + 2 * padding - kernel) / stride + 1;

        let mut result = vec![0.0f32; n * c * oh * ow];
        let mut argmax = vec![0usize; n * c * oh * ow];
        {
            let x = self.data();
            for s in 0..n {
                for ch in 0..c {
                    let plane = (s * c + ch) * h * w;
                    for i in 0..oh {
                        for j in 0..ow {
                            let mut best = f32::NEG_INFINITY;
                            let mut best_idx = plane;
                            for di in 0..kernel {
                                for dj in 0..kernel {
                                    let ih = (i * stride + di) as isize - padding as isize;
                                    let iw = (j * stride + dj) as isize - padding as isize;
                                    if ih < 0 || iw < 0 || ih >= h as isize || iw >= w as isize {
                                        continue;
                                    }
                                    let idx = plane + ih as usize * w + iw as usize;
                                    if x[idx] > best {
                                        best = x[idx];
                                        best_idx = idx;
                                    }
                                }
                            }
                            let oidx = (s * c + ch) * oh * ow + i * ow + j;
                            result[oidx] = best;
                            argmax[oidx] = best_idx;
                        }
                    }
                }
            }
        }

        let mut output = Tensor::new(result, &[n, c, oh, ow]);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad.borrow().as_ref() {
                    let mut slot = grad_slot(&input);
                    let gin = slot.as_mut().unwrap();
                    for (oidx, &g) in gout.iter().enumerate() {
                        gin[argmax[oidx]] += g;
                    }
                }
            });
        }

        output
    }
}

#[derive(Clone, Copy)]
struct ConvDims {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    o: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
    sh: usize,
    sw: usize,
    ph: usize,
    pw: usize,
    dh: usize,
    dw: usize,
}

/// Unfold one sample's [C, H, W] plane into a [C·KH·KW, OH·OW] matrix.
fn im2col(x: &[f32], d: &ConvDims, col: &mut [f32]) {
    let ohw = d.oh * d.ow;
    for c in 0..d.c {
        for kh in 0..d.kh {
            for kw in 0..d.kw {
                let row = (c * d.kh + kh) * d.kw + kw;
                for i in 0..d.oh {
                    let ih = (i * d.sh + kh * d.dh) as isize - d.ph as isize;
                    for j in 0..d.ow {
                        let iw = (j * d.sw + kw * d.dw) as isize - d.pw as isize;
                        let v = if ih < 0 || iw < 0 || ih >= d.h as isize || iw >= d.w as isize {
                            0.0
                        } else {
                            x[c * d.h * d.w + ih as usize * d.w + iw as usize]
                        };
                        col[row * ohw + i * d.ow + j] = v;
                    }
                }
            }
        }
    }
}

/// Scatter a [C·KH·KW, OH·OW] gradient matrix back onto one sample's
/// [C, H, W] gradient plane.
fn col2im(gcol: &[f32], d: &ConvDims, gin: &mut [f32]) {
    let ohw = d.oh * d.ow;
    for c in 0..d.c {
        for kh in 0..d.kh {
            for kw in 0..d.kw {
                let row = (c * d.kh + kh) * d.kw + kw;
                for i in 0..d.oh {
                    let ih = (i * d.sh + kh * d.dh) as isize - d.ph as isize;
                    if ih < 0 || ih >= d.h as isize {
                        continue;
                    }
                    for j in 0..d.ow {
                        let iw = (j * d.sw + kw * d.dw) as isize - d.pw as isize;
                        if iw < 0 || iw >= d.w as isize {
                            continue;
                        }
                        gin[c * d.h * d.w + ih as usize * d.w + iw as usize] +=
                            gcol[row * ohw + i * d.ow + j];
                    }
                }
            }
        }
    }
}

fn conv2d_backward(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    gout: &[f32],
    d: &ConvDims,
) {
    let ohw = d.oh * d.ow;
    let ckk = d.c * d.kh * d.kw;
    let sample = d.c * d.h * d.w;

    if let Some(b) = bias {
        if b.requires_grad {
            let mut gb = vec![0.0f32; d.o];
            for s in 0..d.n {
                for oc in 0..d.o {
                    let base = (s * d.o + oc) * ohw;
                    gb[oc] += gout[base..base + ohw].iter().sum::<f32>();
                }
            }
            accumulate_grad(b, &gb);
        }
    }

    if weight.requires_grad {
        let x = input.data();
        let mut col = vec![0.0f32; ckk * ohw];
        let mut slot = grad_slot(weight);
        let gw = slot.as_mut().unwrap();
        for s in 0..d.n {
            im2col(&x[s * sample..(s + 1) * sample], d, &mut col);
            // gW += gout_s @ colᵀ
            gemm::sgemm_rowmajor(
                gemm::n(),
                gemm::t(),
                d.o as i32,
                ckk as i32,
                ohw as i32,
                1.0,
                &gout[s * d.o * ohw..(s + 1) * d.o * ohw],
                &col,
                1.0,
                gw,
            );
        }
    }

    if input.requires_grad {
        let wd = weight.data();
        let mut gcol = vec![0.0f32; ckk * ohw];
        let mut slot = grad_slot(input);
        let gin = slot.as_mut().unwrap();
        for s in 0..d.n {
            // gcol = Wᵀ @ gout_s
            gemm::sgemm_rowmajor(
                gemm::t(),
                gemm::n(),
                ckk as i32,
                ohw as i32,
                d.o as i32,
                1.0,
                &wd,
                &gout[s * d.o * ohw..(s + 1) * d.o * ohw],
                0.0,
                &mut gcol,
            );
            col2im(&gcol, d, &mut gin[s * sample..(s + 1) * sample]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tape;

    #[test]
    fn mul_grads() {
        Tape::reset();
        let x = Tensor::scalar(2.0).requires_grad();
        let y = Tensor::scalar(3.0).requires_grad();
        let z = &x * &y;
        z.backward();

        assert!((z.data()[0] - 6.0).abs() < 1e-6);
        assert!((x.grad_ref().unwrap()[0] - 3.0).abs() < 1e-6);
        assert!((y.grad_ref().unwrap()[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn matmul_shapes_and_grads() {
        Tape::reset();

        let a = Tensor::new(vec![1., 2., 3., 4., 5., 6.], &[2, 3]).requires_grad();
        let b = Tensor::new(vec![7., 8., 9., 10., 11., 12.], &[3, 2]).requires_grad();

        let c = a.matmul(&b);
        assert_eq!(c.shape(), &[2, 2]);
        // expected C (row-major): [[58, 64], [139, 154]]
        assert!((c.data()[0] - 58.0).abs() < 1e-4);
        assert!((c.data()[3] - 154.0).abs() < 1e-4);

        c.backward();
        // dC/dA = 1 @ Bᵀ: row i of grad = column sums of Bᵀ rows
        let ga = a.grad_ref().unwrap();
        assert!((ga[0] - (7.0 + 8.0)).abs() < 1e-4);
        let gb = b.grad_ref().unwrap();
        assert!((gb[0] - (1.0 + 4.0)).abs() < 1e-4);
    }

    #[test]
    fn conv2d_hand_computed() {
        Tape::reset();
        // 1 sample, 1 channel, 3x3 input; 1 filter 2x2, stride 1, no padding.
        let x = Tensor::new(
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
            &[1, 1, 3, 3],
        );
        let w = Tensor::new(vec![1.0, 0.0, 0.0, -1.0], &[1, 1, 2, 2]);
        let y = x.conv2d(&w, None, (1, 1), (0, 0), (1, 1));
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // out[i,j] = x[i,j] - x[i+1,j+1]
        let yd = y.data();
        assert_eq!(&yd[..], &[1.0 - 5.0, 2.0 - 6.0, 4.0 - 8.0, 5.0 - 9.0]);
    }

    #[test]
    fn conv2d_padding_and_stride() {
        Tape::reset();
        let x = Tensor::ones(&[1, 1, 4, 4]);
        let w = Tensor::ones(&[1, 1, 3, 3]);
        let y = x.conv2d(&w, None, (2, 2), (1, 1), (1, 1));
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // Top-left window covers 4 valid cells (padded corner), interior 9.
        assert_eq!(y.data()[0], 4.0);
        assert_eq!(y.data()[3], 9.0);
    }

    #[test]
    fn conv2d_weight_grad_finite_difference() {
        let x = Tensor::new(
            vec![0.5, -1.0, 2.0, 0.25, 1.5, -0.5, 0.75, 1.0, -2.0],
            &[1, 1, 3, 3],
        );
        let w_data = vec![0.2, -0.4, 0.6, 0.1];

        // Analytic gradient of mean(conv(x, w))
        Tape::reset();
        let w = Tensor::new(w_data.clone(), &[1, 1, 2, 2]).requires_grad();
        let y = x.conv2d(&w, None, (1, 1), (0, 0), (1, 1));
        let loss = y.mean();
        loss.backward();
        let analytic = w.grad_ref().unwrap().clone();

        // Central finite differences
        let eps = 1e-3;
        for i in 0..w_data.len() {
            let eval = |delta: f32| {
                let mut perturbed = w_data.clone();
                perturbed[i] += delta;
                let wp = Tensor::new(perturbed, &[1, 1, 2, 2]);
                let y = x.conv2d(&wp, None, (1, 1), (0, 0), (1, 1));
                let d = y.data();
                d.iter().sum::<f32>() / d.len() as f32
            };
            let numeric = (eval(eps) - eval(-eps)) / (2.0 * eps);
            assert!(
                (analytic[i] - numeric).abs() < 1e-2,
                "weight grad {} mismatch: analytic {} vs numeric {}",
                i,
                analytic[i],
                numeric
            );
        }
    }

    #[test]
    fn avg_pool_forward_backward() {
        Tape::reset();
        let x = Tensor::new((0..16).map(|i| i as f32).collect(), &[1, 1, 4, 4]).requires_grad();
        let y = x.avg_pool2d(2);
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_eq!(y.data()[0], (0.0 + 1.0 + 4.0 + 5.0) / 4.0);

        let loss = y.mean();
        loss.backward();
        let g = x.grad_ref().unwrap();
        // d mean / d x_i = 1/(4 windows) * 1/4
        assert!((g[0] - 1.0 / 16.0).abs() < 1e-6);
    }

    #[test]
    fn max_pool_routes_gradient() {
        Tape::reset();
        let x = Tensor::new(vec![1.0, 3.0, 2.0, 4.0], &[1, 1, 2, 2]).requires_grad();
        let y = x.max_pool2d(2, 2, 0);
        assert_eq!(y.data()[0], 4.0);
        y.backward();
        let g = x.grad_ref().unwrap();
        assert_eq!(&g[..], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn reshape_gradients_pass_through() {
        Tape::reset();
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).requires_grad();
        let flat = x.reshape(&[4]);
        let loss = flat.mean();
        loss.backward();
        let g = x.grad_ref().unwrap();
        for &v in g.iter() {
            assert!((v - 0.25).abs() < 1e-6);
        }
    }
}

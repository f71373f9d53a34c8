use crate::tape::Tape;
use crate::Tensor;

/// Row-wise softmax over the last dimension of a [batch, classes] tensor.
/// Shifted by the row max for numerical stability.
pub fn softmax(logits: &Tensor) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "softmax expects [batch, classes]");
    let (n, k) = (logits.shape()[0], logits.shape()[1]);
    let x = logits.data();

    let mut out = vec![0.0f32; n * k];
    for i in 0..n {
        let row = &x[i * k..(i + 1) * k];
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for j in 0..k {
            let e = (row[j] - max).exp();
            out[i * k + j] = e;
            sum += e;
        }
        for j in 0..k {
            out[i * k + j] /= sum;
        }
    }
    drop(x);

    Tensor::new(out, logits.shape())
}

/// Row-wise log-softmax, numerically stable.
pub fn log_softmax(logits: &Tensor) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "log_softmax expects [batch, classes]");
    let (n, k) = (logits.shape()[0], logits.shape()[1]);
    let x = logits.data();

    let mut out = vec![0.0f32; n * k];
    for i in 0..n {
        let row = &x[i * k..(i + 1) * k];
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum: f32 = row.iter().map(|&v| (v - max).exp()).sum::<f32>().ln();
        for j in 0..k {
            out[i * k + j] = row[j] - max - log_sum;
        }
    }
    drop(x);

    Tensor::new(out, logits.shape())
}

/// Cross-entropy loss (mean reduction) over class-index targets.
/// `logits`: [batch, classes], `targets`: [batch] of class indices.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Tensor {
    assert_eq!(logits.shape().len(), 2, "cross_entropy expects [batch, classes]");
    let (n, k) = (logits.shape()[0], logits.shape()[1]);
    assert_eq!(targets.len(), n, "cross_entropy: one target per row");

    let log_probs = log_softmax(logits);

    // forward: mean of -log p[target]
    let mut acc = 0.0f32;
    {
        let lp = log_probs.data();
        let t = targets.data();
        for i in 0..n {
            let target = t[i] as usize;
            assert!(target < k, "cross_entropy: target {} out of range", target);
            acc -= lp[i * k + target];
        }
    }
    let mut out = Tensor::scalar(acc / n as f32);

    if logits.requires_grad {
        out.requires_grad = true;

        let logit_t = logits.clone();
        let targ = targets.clone();
        let out_clone = out.clone();

        Tape::push_unary_op(logits, &out, move || {
            if let Some(gout) = out_clone.grad.borrow().as_ref() {
                let g = gout[0]; // scalar chain multiplier from upstream

                // dL/dlogit = (softmax - onehot) / N
                let probs = softmax(&logit_t);
                let grad: Vec<f32> = {
                    let p = probs.data();
                    let t = targ.data();
                    let mut grad = vec![0.0f32; n * k];
                    for i in 0..n {
                        let target = t[i] as usize;
                        for j in 0..k {
                            let indicator = if j == target { 1.0 } else { 0.0 };
                            grad[i * k + j] = g * (p[i * k + j] - indicator) / n as f32;
                        }
                    }
                    grad
                };
                crate::ops::accumulate_grad(&logit_t, &grad);
            }
        });
    }

    out
}

/// Fraction of rows whose argmax equals the target.
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> f32 {
    accuracy_topk(logits, targets, 1)
}

/// Fraction of rows whose target appears among the top-k logits.
pub fn accuracy_topk(logits: &Tensor, targets: &Tensor, topk: usize) -> f32 {
    assert_eq!(logits.shape().len(), 2);
    let (n, k) = (logits.shape()[0], logits.shape()[1]);
    assert!(topk >= 1 && topk <= k);

    let x = logits.data();
    let t = targets.data();
    let mut correct = 0usize;

    for i in 0..n {
        let row = &x[i * k..(i + 1) * k];
        let target = t[i] as usize;
        let target_score = row[target];
        // Rank of the target = number of strictly greater entries.
        let better = row.iter().filter(|&&v| v > target_score).count();
        if better < topk {
            correct += 1;
        }
    }

    correct as f32 / n as f32
}

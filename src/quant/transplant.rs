//! Parameter transplant between a dense parent network and a scaled child.
//!
//! Both networks come out of the same topology-builder code path, which
//! emits an ordered manifest of quantization-eligible binding sites. The
//! transplant walks the two manifests in lockstep, so alignment is by
//! declared structural path, never by reflective module filtering; the
//! count and path checks run eagerly, before any weight is moved.

use std::collections::HashMap;

use rand::thread_rng;
use thiserror::Error;

use crate::nn::Module;
use crate::quant::{binarize, factorize, BinarizeMode, QuantSpec};
use crate::resnet::{ConvSlot, ResNet};

#[derive(Debug, Error)]
pub enum TransplantError {
    #[error("eligible convolution counts differ: parent has {parent}, child has {child}")]
    StructuralMismatch { parent: usize, child: usize },

    #[error("binding site {index} differs: parent `{parent}` vs child `{child}`")]
    SiteMismatch {
        index: usize,
        parent: String,
        child: String,
    },

    #[error("binding site `{path}` holds the wrong operator kind (expected {expected})")]
    SlotKind { path: String, expected: &'static str },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("positional load expects {expected} tensors, found {found}")]
    PositionalMismatch { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransplantReport {
    /// Binding sites configured from factorized parent kernels.
    pub sites: usize,
    /// Remaining state tensors copied by name (batch norm, classifier,
    /// pointwise convs).
    pub copied: usize,
    /// Child state tensors with no matching parent key; the scaled
    /// operators' sign/scale tensors land here by construction.
    pub skipped: usize,
}

/// Initialize `child`'s scaled convolutions from `parent`'s dense ones,
/// then copy every remaining parameter by name, non-strict.
pub fn transplant(
    parent: &ResNet,
    child: &ResNet,
    spec: QuantSpec,
) -> Result<TransplantReport, TransplantError> {
    let p_sites = parent.manifest();
    let c_sites = child.manifest();

    if p_sites.len() != c_sites.len() {
        return Err(TransplantError::StructuralMismatch {
            parent: p_sites.len(),
            child: c_sites.len(),
        });
    }
    for (index, (p, c)) in p_sites.iter().zip(c_sites.iter()).enumerate() {
        if p.path != c.path {
            return Err(TransplantError::SiteMismatch {
                index,
                parent: p.path.clone(),
                child: c.path.clone(),
            });
        }
    }

    let mut rng = thread_rng();
    for (p, c) in p_sites.iter().zip(c_sites.iter()) {
        let source = match &p.slot {
            ConvSlot::Dense(conv) => conv,
            ConvSlot::Scaled(_) => {
                return Err(TransplantError::SlotKind {
                    path: p.path.clone(),
                    expected: "a dense convolution in the parent",
                })
            }
        };
        let target = match &c.slot {
            ConvSlot::Scaled(op) => op,
            ConvSlot::Dense(_) => {
                return Err(TransplantError::SlotKind {
                    path: c.path.clone(),
                    expected: "a scaled placeholder in the child",
                })
            }
        };

        let (weights, scales) = factorize(source);
        let sign = binarize(&weights, BinarizeMode::Deterministic, &mut rng);
        target.configure(source, sign, scales.requires_grad(), spec);
    }

    // Full-network variant: batch-norm statistics, the classifier and any
    // non-quantized conv transfer by key. Unmatched keys are skipped, never
    // copied positionally.
    let parent_state: HashMap<String, crate::Tensor> = {
        let mut dest = Vec::new();
        parent.state("", &mut dest);
        dest.into_iter().collect()
    };

    let mut child_state = Vec::new();
    child.state("", &mut child_state);

    let mut copied = 0usize;
    let mut skipped = 0usize;
    for (name, tensor) in child_state {
        match parent_state.get(&name) {
            Some(src) if src.shape() == tensor.shape() => {
                tensor.copy_from(src);
                copied += 1;
            }
            _ => skipped += 1,
        }
    }

    Ok(TransplantReport {
        sites: p_sites.len(),
        copied,
        skipped,
    })
}

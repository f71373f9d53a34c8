//! Assembly: build the dense parent, factorize it, and initialize the
//! quantized child from it.

use std::path::PathBuf;

use crate::checkpoint;
use crate::quant::{transplant, QuantSpec, TransplantError, TransplantReport};
use crate::resnet::{build_resnet, DenseConvs, NetworkConfig, ResNet, ScaledConvs};

#[derive(Debug, Clone)]
pub struct ScaleNetConfig {
    pub network: NetworkConfig,
    pub spec: QuantSpec,
    /// Checkpoint whose tensors fill the parent network positionally
    /// (enumeration order, not names) before factorization; this is the
    /// model-zoo contract. When absent the parent keeps its random
    /// initialization.
    pub pretrained: Option<PathBuf>,
}

impl ScaleNetConfig {
    pub fn new(network: NetworkConfig, spec: QuantSpec) -> Self {
        Self {
            network,
            spec,
            pretrained: None,
        }
    }
}

/// Build the quantized network: parent → factorize → transplant → child.
///
/// The parent is discarded afterwards; everything the child needs (signs,
/// scale initializers, shared biases, copied batch-norm/classifier state)
/// has been bound into it. Training the returned network updates only the
/// scale parameters and the non-quantized layers.
pub fn make_scalenet(
    config: &ScaleNetConfig,
) -> Result<(ResNet, TransplantReport), TransplantError> {
    let parent = build_resnet(&config.network, &DenseConvs);

    if let Some(path) = &config.pretrained {
        let entries = checkpoint::load_state(path)
            .map_err(|e| TransplantError::Checkpoint(e.to_string()))?;
        checkpoint::load_positional(&parent.state_dict(), &entries)?;
    }

    let child = build_resnet(&config.network, &ScaledConvs);
    let report = transplant(&parent, &child, config.spec)?;

    Ok((child, report))
}

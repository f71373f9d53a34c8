use crate::{nn::Module, Tensor};

/// ReLU activation as a module
pub struct ReLU;

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.relu()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state(&self, _prefix: &str, _dest: &mut Vec<(String, Tensor)>) {}
}

/// Tanh activation
pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.tanh()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state(&self, _prefix: &str, _dest: &mut Vec<(String, Tensor)>) {}
}

/// Hard tanh activation (clamp to [-1, 1])
pub struct Hardtanh;

impl Module for Hardtanh {
    fn forward(&self, input: &Tensor) -> Tensor {
        input.hardtanh()
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }

    fn state(&self, _prefix: &str, _dest: &mut Vec<(String, Tensor)>) {}
}

/// Activation selector used by the topology builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
    Hardtanh,
}

impl Activation {
    pub fn module(self) -> Box<dyn Module> {
        match self {
            Activation::Relu => Box::new(ReLU),
            Activation::Tanh => Box::new(Tanh),
            Activation::Hardtanh => Box::new(Hardtanh),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "relu" => Some(Activation::Relu),
            "tanh" => Some(Activation::Tanh),
            "htanh" | "hardtanh" => Some(Activation::Hardtanh),
            _ => None,
        }
    }
}

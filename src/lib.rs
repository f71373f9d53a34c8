pub mod activation;
pub mod checkpoint;
pub mod data;
pub mod gemm;
pub mod loss;
pub mod nn;
pub mod ops;
pub mod optim;
pub mod quant;
pub mod resnet;
pub mod scalenet;
pub mod tape;
pub mod tensor;
pub mod train;

pub use gemm::{n, sgemm_rowmajor, t};
pub use quant::{QuantSpec, ScaledConv2d};
pub use scalenet::{make_scalenet, ScaleNetConfig};
pub use tape::Tape;
pub use tensor::Tensor;
pub use train::{Metrics, Trainer};

//! Weight normalization for affine transforms.
//!
//! A `WeightNorm` stores each weight matrix as unnormalized row directions
//! plus one magnitude per row, rebuilds the normalized weights on every
//! evaluation, and hands them to a `PayloadBuilder` that assembles the
//! network using them. Gradients (reverse mode) and directional gradients
//! (forward mode) reaching the normalized weights are routed back to the
//! directions and magnitudes.

pub mod tensor;
pub mod graph;
pub mod rows;
pub mod dense;
pub mod builder;
pub mod serialize;
pub mod norm;
pub mod gradient;

pub use builder::{BuilderRegistry, DenseBuilder, DenseDescriptor, PayloadBuilder};
pub use dense::{DenseLayer, Layer, Network};
pub use graph::{
    constant, constant_r, zero_gradient, Gradient, NamedVector, Node, NodeRef, Param, ParamId,
    RGradient, RNode, RNodeRef, RVector,
};
pub use norm::WeightNorm;
pub use serialize::{load_checkpoint, load_checkpoint_with, save_checkpoint, DecodeError, EncodeError};

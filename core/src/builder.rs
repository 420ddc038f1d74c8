//! Payload builders: the extension point of the normalization engine.
//!
//! A builder receives the pooled (already normalized) weight vectors as
//! plain parameters and returns the network that consumes them. Builders are
//! persisted as a type tag plus an opaque payload; `BuilderRegistry` maps
//! tags back to decode functions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dense::{DenseLayer, Network};
use crate::graph::{NamedVector, Param};
use crate::serialize::{ensure_finite, DecodeError, EncodeError};

pub trait PayloadBuilder {
    /// Unique tag used to dispatch decoding.
    fn type_tag(&self) -> &'static str;

    /// Build the payload network from pooled parameters, one per
    /// direction/magnitude group, in group order. Panics on a count mismatch.
    fn create(&self, pooled: &[Param]) -> Network;

    /// Builder-specific descriptor bytes. Fails on values the descriptor
    /// format cannot represent.
    fn encode(&self) -> Result<Vec<u8>, EncodeError>;
}

/// Decode function for one builder type.
pub type DecodeBuilderFn = fn(&[u8]) -> Result<Box<dyn PayloadBuilder>, DecodeError>;

/// Tag → decoder map consulted when reading a persisted transform.
pub struct BuilderRegistry {
    decoders: HashMap<String, DecodeBuilderFn>,
}

impl BuilderRegistry {
    /// Registry with no builders.
    pub fn empty() -> Self {
        BuilderRegistry { decoders: HashMap::new() }
    }

    pub fn register(&mut self, tag: impl Into<String>, decode: DecodeBuilderFn) {
        self.decoders.insert(tag.into(), decode);
    }

    /// Builder: register and return self.
    pub fn with(mut self, tag: impl Into<String>, decode: DecodeBuilderFn) -> Self {
        self.register(tag, decode);
        self
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.decoders.contains_key(tag)
    }

    pub fn decode(&self, tag: &str, data: &[u8]) -> Result<Box<dyn PayloadBuilder>, DecodeError> {
        let decode = self.decoders.get(tag)
            .ok_or_else(|| DecodeError::UnknownTag(tag.to_string()))?;
        decode(data)
    }
}

impl Default for BuilderRegistry {
    /// Registry that knows the dense builder.
    fn default() -> Self {
        BuilderRegistry::empty().with(DenseBuilder::TAG, DenseBuilder::decode)
    }
}

// ── DenseBuilder ─────────────────────────────────────────────────────

/// Builds a single dense layer whose weight matrix is the pooled parameter.
#[derive(Clone, Debug)]
pub struct DenseBuilder {
    pub biases: Param,
    pub input_count: usize,
    pub output_count: usize,
}

/// Persisted form of `DenseBuilder`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseDescriptor {
    pub input_count: usize,
    pub output_count: usize,
    pub biases: NamedVector,
}

impl DenseBuilder {
    pub const TAG: &'static str = "weightnorm.DenseBuilder";

    pub fn descriptor(&self) -> DenseDescriptor {
        DenseDescriptor {
            input_count: self.input_count,
            output_count: self.output_count,
            biases: self.biases.to_named(),
        }
    }

    pub fn from_descriptor(d: DenseDescriptor) -> Result<Self, DecodeError> {
        if d.biases.data.len() != d.output_count {
            return Err(DecodeError::Inconsistent(format!(
                "dense builder: {} biases for {} outputs",
                d.biases.data.len(), d.output_count)));
        }
        Ok(DenseBuilder {
            biases: Param::from_named(d.biases),
            input_count: d.input_count,
            output_count: d.output_count,
        })
    }

    fn decode(data: &[u8]) -> Result<Box<dyn PayloadBuilder>, DecodeError> {
        let d: DenseDescriptor = serde_json::from_slice(data)?;
        Ok(Box::new(DenseBuilder::from_descriptor(d)?))
    }
}

impl PayloadBuilder for DenseBuilder {
    fn type_tag(&self) -> &'static str {
        Self::TAG
    }

    fn create(&self, pooled: &[Param]) -> Network {
        assert_eq!(pooled.len(), 1,
                   "dense builder expects exactly one pooled parameter, got {}", pooled.len());
        Network::default().with_layer(DenseLayer::with_params(
            self.input_count, self.output_count, pooled[0].clone(), self.biases.clone()))
    }

    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let d = self.descriptor();
        ensure_finite(&d.biases)?;
        Ok(serde_json::to_vec(&d)?)
    }
}

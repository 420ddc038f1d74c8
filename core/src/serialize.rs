//! Byte layout for persisted transforms.
//!
//! A container is a bincode-encoded list of opaque byte blocks (fixed-width
//! little-endian lengths). A typed block is a bincode `TypedBlock`: the
//! builder's type tag and its payload. Decoding is all-or-nothing: any
//! malformed input yields a `DecodeError` and no partial value.

use std::path::Path;

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::BuilderRegistry;
use crate::graph::NamedVector;
use crate::norm::WeightNorm;

/// Failure to decode persisted bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed container: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("expected {expected} blocks, found {found}")]
    BlockCount { expected: usize, found: usize },

    #[error("unknown builder type tag {0:?}")]
    UnknownTag(String),

    #[error("malformed block: {0}")]
    Json(#[from] serde_json::Error),

    #[error("inconsistent parameter groups: {0}")]
    Inconsistent(String),
}

/// Failure to encode a transform.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to encode block: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to encode container: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("{param}[{index}] is not finite")]
    NonFinite { param: String, index: usize },
}

/// Reject vectors that JSON cannot represent (NaN and infinities).
pub fn ensure_finite(v: &NamedVector) -> Result<(), EncodeError> {
    match v.data.iter().position(|x| !x.is_finite()) {
        Some(index) => Err(EncodeError::NonFinite { param: v.name.clone(), index }),
        None => Ok(()),
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

// ── Blocks ───────────────────────────────────────────────────────────

pub fn encode_blocks(blocks: &[&[u8]]) -> Result<Vec<u8>, EncodeError> {
    Ok(codec().serialize(blocks)?)
}

/// Split a container into exactly `expected` blocks.
pub fn decode_blocks(data: &[u8], expected: usize) -> Result<Vec<Vec<u8>>, DecodeError> {
    let blocks: Vec<Vec<u8>> = codec().deserialize(data)?;
    if blocks.len() != expected {
        return Err(DecodeError::BlockCount { expected, found: blocks.len() });
    }
    Ok(blocks)
}

/// Builder block: type tag plus builder-specific payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedBlock {
    pub tag: String,
    pub payload: Vec<u8>,
}

pub fn encode_typed(tag: &str, payload: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    Ok(codec().serialize(&TypedBlock { tag: tag.to_string(), payload })?)
}

pub fn decode_typed(data: &[u8]) -> Result<TypedBlock, DecodeError> {
    Ok(codec().deserialize(data)?)
}

// ── Checkpoint files ─────────────────────────────────────────────────

/// Save an encoded transform to a file.
pub fn save_checkpoint(path: &Path, norm: &WeightNorm) -> std::io::Result<()> {
    let bytes = norm.serialize()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, bytes)
}

/// Load a transform using the default builder registry.
pub fn load_checkpoint(path: &Path) -> std::io::Result<WeightNorm> {
    load_checkpoint_with(path, &BuilderRegistry::default())
}

/// Load a transform, resolving builder tags through `registry`.
pub fn load_checkpoint_with(path: &Path, registry: &BuilderRegistry) -> std::io::Result<WeightNorm> {
    let bytes = std::fs::read(path)?;
    WeightNorm::deserialize_with(&bytes, registry)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

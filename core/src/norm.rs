//! Weight normalization engine.
//!
//! Each weight matrix is stored as a direction group `W` (rows concatenated)
//! and a magnitude group `M` (one scalar per row). Every evaluation:
//!
//! 1. decomposes `W_i * M_i / ||W_i||` row-wise into a graph node,
//! 2. copies each decomposed vector into a fresh pooled `Param`,
//! 3. asks the `PayloadBuilder` for a network over the pooled params,
//! 4. applies that network to the input.
//!
//! The returned composite node routes gradient that reaches the pooled
//! params back through the decomposition into `W` and `M`. Pooled params
//! never appear in `parameters()` or in a gradient map seen by the caller.

use std::rc::Rc;

use tracing::{debug, trace};

use crate::builder::{BuilderRegistry, DenseBuilder, PayloadBuilder};
use crate::dense::{DenseLayer, Layer, Network};
use crate::graph::{
    div, div_r, Gradient, NamedVector, Node, NodeRef, Param, ParamId,
    RGradient, RNode, RNodeRef, RVector,
};
use crate::rows::{row_norms, row_norms_r, scale_rows, scale_rows_r};
use crate::serialize::{
    decode_blocks, decode_typed, encode_blocks, encode_typed, ensure_finite, DecodeError,
    EncodeError,
};
use crate::tensor;

/// Number of blocks in a persisted transform: directions, magnitudes, builder.
const BLOCK_COUNT: usize = 3;

pub struct WeightNorm {
    /// Unnormalized direction groups, one per weight matrix.
    pub weights: Vec<Param>,

    /// Magnitude groups. `mags[i]` has one entry per row of `weights[i]`,
    /// so its length also fixes the row count.
    pub mags: Vec<Param>,

    /// Builds the payload network from the normalized weights.
    pub creator: Box<dyn PayloadBuilder>,
}

/// Describe why (direction, magnitude) lengths cannot form groups.
fn group_error(weight_lens: &[usize], mag_lens: &[usize]) -> Option<String> {
    if weight_lens.len() != mag_lens.len() {
        return Some(format!("{} direction groups but {} magnitude groups",
                            weight_lens.len(), mag_lens.len()));
    }
    for (i, (&w, &m)) in weight_lens.iter().zip(mag_lens.iter()).enumerate() {
        if m == 0 || w % m != 0 {
            return Some(format!("group {i}: magnitude length {m} does not divide \
                                 direction length {w}"));
        }
    }
    None
}

impl WeightNorm {
    /// Panics unless every magnitude group evenly divides its direction group.
    pub fn new(weights: Vec<Param>, mags: Vec<Param>, creator: Box<dyn PayloadBuilder>) -> Self {
        let w: Vec<usize> = weights.iter().map(Param::len).collect();
        let m: Vec<usize> = mags.iter().map(Param::len).collect();
        if let Some(msg) = group_error(&w, &m) {
            panic!("invalid weight norm groups: {msg}");
        }
        WeightNorm { weights, mags, creator }
    }

    /// Normalized copy of a dense layer. The initial magnitude of each row is
    /// its norm, so outputs match the source layer. Biases stay shared with
    /// `layer`.
    pub fn from_dense(layer: &DenseLayer) -> Self {
        let w = layer.weights.value();
        let cols = layer.input_count;
        let mags: Vec<f64> = (0..layer.output_count)
            .map(|r| tensor::vec_norm_f64(&w[r * cols..(r + 1) * cols]))
            .collect();
        debug!(inputs = layer.input_count, outputs = layer.output_count,
               "weight norm from dense layer");
        WeightNorm::new(
            vec![Param::new("weights", w)],
            vec![Param::new("mags", mags)],
            Box::new(DenseBuilder {
                biases: layer.biases.clone(),
                input_count: layer.input_count,
                output_count: layer.output_count,
            }),
        )
    }

    /// Number of (direction, magnitude) groups.
    pub fn num_groups(&self) -> usize {
        self.weights.len()
    }

    // ── Decomposition ────────────────────────────────────────────

    fn normalize(&self) -> Vec<NodeRef> {
        trace!(groups = self.weights.len(), "decomposing weight groups");
        self.weights.iter().zip(self.mags.iter()).map(|(w, m)| {
            let weights = w.node();
            let norms = row_norms(weights.clone(), m.len());
            let scales = div(m.node(), norms);
            scale_rows(weights, scales)
        }).collect()
    }

    fn normalize_r(&self, rv: &RVector) -> Vec<RNodeRef> {
        trace!(groups = self.weights.len(), "decomposing weight groups (forward mode)");
        self.weights.iter().zip(self.mags.iter()).map(|(w, m)| {
            let weights = w.r_node(rv);
            let norms = row_norms_r(weights.clone(), m.len());
            let scales = div_r(m.r_node(rv), norms);
            scale_rows_r(weights, scales)
        }).collect()
    }

    fn raw_ids(&self) -> Vec<ParamId> {
        self.weights.iter().chain(self.mags.iter()).map(Param::id).collect()
    }

    fn norm_result(&self, build: impl FnOnce(&Network) -> NodeRef) -> NodeRef {
        let norm_res = self.normalize();
        let pool = pool_outputs(norm_res.iter().map(|n| n.output()));
        let net = self.creator.create(&pool);
        let result = build(&net);
        Rc::new(NormResult { raw: self.raw_ids(), norm_res, pool, result })
    }

    fn norm_r_result(&self, rv: &RVector,
                     build: impl FnOnce(&Network, &RVector) -> RNodeRef) -> RNodeRef {
        let norm_res = self.normalize_r(rv);
        let pool = pool_outputs(norm_res.iter().map(|n| n.output()));

        // Pooled leaves get their direction from the decomposition.
        let mut new_rv = rv.clone();
        for (p, n) in pool.iter().zip(norm_res.iter()) {
            new_rv.insert(p.id(), n.r_output().to_vec());
        }
        let net = self.creator.create(&pool);
        let result = build(&net, &new_rv);
        Rc::new(NormRResult { raw: self.raw_ids(), norm_res, pool, result })
    }

    // ── Persistence ──────────────────────────────────────────────

    /// Fails with `EncodeError::NonFinite` if any direction or magnitude
    /// holds NaN or an infinity, since such values would not decode.
    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        let weights: Vec<NamedVector> = self.weights.iter().map(Param::to_named).collect();
        let mags: Vec<NamedVector> = self.mags.iter().map(Param::to_named).collect();
        for v in weights.iter().chain(mags.iter()) {
            ensure_finite(v)?;
        }
        let weights_data = serde_json::to_vec(&weights)?;
        let mags_data = serde_json::to_vec(&mags)?;
        let creator_data = encode_typed(self.creator.type_tag(), self.creator.encode()?)?;
        encode_blocks(&[&weights_data[..], &mags_data[..], &creator_data[..]])
    }

    /// Decode with the default builder registry.
    pub fn deserialize(data: &[u8]) -> Result<Self, DecodeError> {
        Self::deserialize_with(data, &BuilderRegistry::default())
    }

    pub fn deserialize_with(data: &[u8], registry: &BuilderRegistry) -> Result<Self, DecodeError> {
        let blocks = decode_blocks(data, BLOCK_COUNT)?;
        let weights: Vec<NamedVector> = serde_json::from_slice(&blocks[0])?;
        let mags: Vec<NamedVector> = serde_json::from_slice(&blocks[1])?;
        let w: Vec<usize> = weights.iter().map(|v| v.data.len()).collect();
        let m: Vec<usize> = mags.iter().map(|v| v.data.len()).collect();
        if let Some(msg) = group_error(&w, &m) {
            return Err(DecodeError::Inconsistent(msg));
        }
        let block = decode_typed(&blocks[2])?;
        let creator = registry.decode(&block.tag, &block.payload)?;
        debug!(groups = weights.len(), builder = %block.tag, "decoded weight norm");
        Ok(WeightNorm {
            weights: weights.into_iter().map(Param::from_named).collect(),
            mags: mags.into_iter().map(Param::from_named).collect(),
            creator,
        })
    }
}

impl Layer for WeightNorm {
    fn apply(&self, input: NodeRef) -> NodeRef {
        self.norm_result(|net| net.apply(input))
    }

    fn apply_r(&self, rv: &RVector, input: RNodeRef) -> RNodeRef {
        self.norm_r_result(rv, |net, new_rv| net.apply_r(new_rv, input))
    }

    fn batch(&self, input: NodeRef, n: usize) -> NodeRef {
        self.norm_result(|net| net.batch(input, n))
    }

    fn batch_r(&self, rv: &RVector, input: RNodeRef, n: usize) -> RNodeRef {
        self.norm_r_result(rv, |net, new_rv| net.batch_r(new_rv, input, n))
    }

    /// Directions, then magnitudes, then payload parameters other than the
    /// pooled weights.
    fn parameters(&self) -> Vec<Param> {
        let mut res: Vec<Param> = self.weights.iter().chain(self.mags.iter()).cloned().collect();
        let norm_res = self.normalize();
        let pool = pool_outputs(norm_res.iter().map(|n| n.output()));
        let net = self.creator.create(&pool);
        for param in net.parameters() {
            if !pool.iter().any(|p| p.id() == param.id()) {
                res.push(param);
            }
        }
        res
    }
}

fn pool_outputs<'a>(outputs: impl Iterator<Item = &'a [f64]>) -> Vec<Param> {
    outputs.enumerate()
        .map(|(i, out)| Param::new(format!("pooled{i}"), out.to_vec()))
        .collect()
}

/// Target set naming only the pooled params. Constancy reads keys only, so
/// the slots stay empty.
fn pool_targets(pool: &[Param]) -> Gradient {
    pool.iter().map(|p| (p.id(), Vec::new())).collect()
}

// ── Pool scopes ──────────────────────────────────────────────────────
//
// Seed zero slots for the pooled params in the caller's maps, and remove
// them again when the scope ends, including on unwind.

struct PoolScope<'a> {
    g: &'a mut Gradient,
    pool: &'a [Param],
}

impl<'a> PoolScope<'a> {
    fn seed(g: &'a mut Gradient, pool: &'a [Param]) -> Self {
        for p in pool {
            g.insert(p.id(), vec![0.0; p.len()]);
        }
        PoolScope { g, pool }
    }

    fn grad(&mut self) -> &mut Gradient {
        &mut *self.g
    }

    /// Remove the pooled slots, returning them in pool order.
    fn take(self) -> Vec<Vec<f64>> {
        let pool = self.pool;
        pool.iter()
            .map(|p| self.g.remove(&p.id()).unwrap_or_else(|| vec![0.0; p.len()]))
            .collect()
    }
}

impl Drop for PoolScope<'_> {
    fn drop(&mut self) {
        for p in self.pool {
            self.g.remove(&p.id());
        }
    }
}

struct RPoolScope<'a> {
    rg: &'a mut RGradient,
    g: &'a mut Gradient,
    pool: &'a [Param],
}

impl<'a> RPoolScope<'a> {
    fn seed(rg: &'a mut RGradient, g: &'a mut Gradient, pool: &'a [Param]) -> Self {
        for p in pool {
            g.insert(p.id(), vec![0.0; p.len()]);
            rg.insert(p.id(), vec![0.0; p.len()]);
        }
        RPoolScope { rg, g, pool }
    }

    fn maps(&mut self) -> (&mut RGradient, &mut Gradient) {
        (&mut *self.rg, &mut *self.g)
    }

    /// Remove the pooled slots, returning (gradient, directional gradient)
    /// pairs in pool order.
    fn take(self) -> Vec<(Vec<f64>, Vec<f64>)> {
        let pool = self.pool;
        pool.iter().map(|p| {
            let up = self.g.remove(&p.id()).unwrap_or_else(|| vec![0.0; p.len()]);
            let up_r = self.rg.remove(&p.id()).unwrap_or_else(|| vec![0.0; p.len()]);
            (up, up_r)
        }).collect()
    }
}

impl Drop for RPoolScope<'_> {
    fn drop(&mut self) {
        for p in self.pool {
            self.g.remove(&p.id());
            self.rg.remove(&p.id());
        }
    }
}

// ── Composite results ────────────────────────────────────────────────

struct NormResult {
    /// Ids of the direction and magnitude groups.
    raw: Vec<ParamId>,
    norm_res: Vec<NodeRef>,
    pool: Vec<Param>,
    result: NodeRef,
}

impl NormResult {
    fn raw_params_constant(&self, g: &Gradient) -> bool {
        !self.raw.iter().any(|id| g.contains_key(id))
    }
}

impl Node for NormResult {
    fn output(&self) -> &[f64] {
        self.result.output()
    }

    fn constant(&self, g: &Gradient) -> bool {
        if !self.result.constant(g) {
            return false;
        }
        if self.raw_params_constant(g) {
            return true;
        }
        self.result.constant(&pool_targets(&self.pool))
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        if self.constant(g) {
            return;
        }
        let pool_upstream = {
            let mut scope = PoolScope::seed(g, &self.pool);
            self.result.propagate_gradient(upstream, scope.grad());
            scope.take()
        };
        for (node, up) in self.norm_res.iter().zip(pool_upstream.iter()) {
            node.propagate_gradient(up, g);
        }
    }
}

struct NormRResult {
    raw: Vec<ParamId>,
    norm_res: Vec<RNodeRef>,
    pool: Vec<Param>,
    result: RNodeRef,
}

impl NormRResult {
    fn raw_params_constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        !self.raw.iter().any(|id| g.contains_key(id) || rg.contains_key(id))
    }
}

impl RNode for NormRResult {
    fn output(&self) -> &[f64] {
        self.result.output()
    }

    fn r_output(&self) -> &[f64] {
        self.result.r_output()
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        if !self.result.constant(rg, g) {
            return false;
        }
        if self.raw_params_constant(rg, g) {
            return true;
        }
        self.result.constant(&pool_targets(&self.pool), &Gradient::new())
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        if self.constant(rg, g) {
            return;
        }
        let pool_upstream = {
            let mut scope = RPoolScope::seed(rg, g, &self.pool);
            let (scope_rg, scope_g) = scope.maps();
            self.result.propagate_r_gradient(upstream, upstream_r, scope_rg, scope_g);
            scope.take()
        };
        for (node, (up, up_r)) in self.norm_res.iter().zip(pool_upstream.iter()) {
            node.propagate_r_gradient(up, up_r, rg, g);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{constant, constant_r, zero_gradient};

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64, msg: &str) {
        assert_eq!(actual.len(), expected.len(), "{msg}: length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!((a - e).abs() < tol,
                    "{msg}[{i}]: actual={a} expected={e} diff={}", (a - e).abs());
        }
    }

    fn small_norm() -> WeightNorm {
        // One row [3, 4] scaled to magnitude 10, bias 1.
        WeightNorm::new(
            vec![Param::new("w", vec![3.0, 4.0])],
            vec![Param::new("m", vec![10.0])],
            Box::new(DenseBuilder {
                biases: Param::new("b", vec![1.0]),
                input_count: 2,
                output_count: 1,
            }),
        )
    }

    #[test]
    fn test_apply_uses_normalized_weights() {
        let norm = small_norm();
        let out = norm.apply(constant(vec![1.0, 1.0]));
        // normalized row = [6, 8]
        assert_close(out.output(), &[15.0], 1e-12, "out");
    }

    #[test]
    fn test_magnitude_gradient() {
        let norm = small_norm();
        let mut g = zero_gradient(&norm.parameters());
        norm.apply(constant(vec![1.0, 1.0])).propagate_gradient(&[1.0], &mut g);
        // out = m * (3 + 4) / 5 + b  →  d_m = 7/5
        assert_close(&g[&norm.mags[0].id()], &[1.4], 1e-12, "d_m");
        // d_b = 1
        let bias = &norm.parameters()[2];
        assert_close(&g[&bias.id()], &[1.0], 1e-12, "d_b");
        // d_w = m * (x/||w|| - w <w,x>/||w||^3) = 10 * ([0.2,0.2] - [3,4]*7/125)
        assert_close(&g[&norm.weights[0].id()],
                     &[10.0 * (0.2 - 21.0 / 125.0), 10.0 * (0.2 - 28.0 / 125.0)],
                     1e-12, "d_w");
    }

    #[test]
    fn test_pooled_slots_removed_after_backward() {
        let norm = small_norm();
        let params = norm.parameters();
        let mut g = zero_gradient(&params);
        norm.apply(constant(vec![1.0, -1.0])).propagate_gradient(&[1.0], &mut g);
        assert_eq!(g.len(), params.len());
        for p in &params {
            assert!(g.contains_key(&p.id()));
        }
    }

    #[test]
    fn test_constant_when_no_targets() {
        let norm = small_norm();
        let out = norm.apply(constant(vec![1.0, 1.0]));
        let mut g = Gradient::new();
        assert!(out.constant(&g));
        out.propagate_gradient(&[1.0], &mut g);
        assert!(g.is_empty());

        let unrelated = Param::new("other", vec![0.0]);
        let mut g = zero_gradient(&[unrelated.clone()]);
        assert!(out.constant(&g));
        out.propagate_gradient(&[1.0], &mut g);
        assert_eq!(g[&unrelated.id()], vec![0.0]);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn test_not_constant_for_magnitude_only() {
        let norm = small_norm();
        let out = norm.apply(constant(vec![1.0, 1.0]));
        let g = zero_gradient(&[norm.mags[0].clone()]);
        assert!(!out.constant(&g));
    }

    /// Payload with its own fixed layer; never reads the pooled weights.
    struct FixedBuilder {
        layer: DenseLayer,
    }

    impl PayloadBuilder for FixedBuilder {
        fn type_tag(&self) -> &'static str {
            "tests.FixedBuilder"
        }

        fn create(&self, _pooled: &[Param]) -> Network {
            Network::default().with_layer(self.layer.clone())
        }

        fn encode(&self) -> Result<Vec<u8>, EncodeError> {
            Ok(Vec::new())
        }
    }

    fn detached_norm() -> WeightNorm {
        WeightNorm::new(
            vec![Param::new("w", vec![3.0, 4.0])],
            vec![Param::new("m", vec![10.0])],
            Box::new(FixedBuilder {
                layer: DenseLayer::with_params(2, 1, Param::new("fw", vec![1.0, -1.0]),
                                               Param::new("fb", vec![0.5])),
            }),
        )
    }

    #[test]
    fn test_constant_when_payload_ignores_pool() {
        let norm = detached_norm();
        let out = norm.apply(constant(vec![1.0, 2.0]));
        let mags = norm.mags[0].clone();
        let mut g = zero_gradient(&[mags.clone()]);
        assert!(out.constant(&g));
        out.propagate_gradient(&[1.0], &mut g);
        assert_eq!(g.len(), 1);
        assert_eq!(g[&mags.id()], vec![0.0]);
    }

    #[test]
    fn test_pool_targets_are_key_only() {
        let pool = vec![Param::zeros("p0", 1 << 16), Param::zeros("p1", 3)];
        let targets = pool_targets(&pool);
        assert_eq!(targets.len(), 2);
        assert!(pool.iter().all(|p| targets[&p.id()].is_empty()));
    }

    #[test]
    fn test_r_constant_when_payload_ignores_pool() {
        let norm = detached_norm();
        let mags = norm.mags[0].clone();
        let mut rv = RVector::new();
        rv.insert(mags.id(), vec![1.0]);
        let out = norm.apply_r(&rv, constant_r(vec![1.0, 2.0]));
        assert_eq!(out.r_output(), &[0.0]);
        let mut g = zero_gradient(&[mags.clone()]);
        let mut rg = zero_gradient(&[mags.clone()]);
        assert!(out.constant(&rg, &g));
        out.propagate_r_gradient(&[1.0], &[1.0], &mut rg, &mut g);
        assert_eq!((g.len(), rg.len()), (1, 1));
        assert_eq!(g[&mags.id()], vec![0.0]);
        assert_eq!(rg[&mags.id()], vec![0.0]);
    }

    #[test]
    fn test_r_pooled_slots_removed() {
        let norm = small_norm();
        let params = norm.parameters();
        let rv: RVector = params.iter().map(|p| (p.id(), vec![1.0; p.len()])).collect();
        let out = norm.apply_r(&rv, constant_r(vec![1.0, 2.0]));
        let mut g = zero_gradient(&params);
        let mut rg = zero_gradient(&params);
        out.propagate_r_gradient(&[1.0], &[0.5], &mut rg, &mut g);
        assert_eq!(g.len(), params.len());
        assert_eq!(rg.len(), params.len());
    }

    #[test]
    fn test_pool_scope_cleans_up_on_unwind() {
        let pool = vec![Param::zeros("p", 2)];
        let mut g = Gradient::new();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut scope = PoolScope::seed(&mut g, &pool);
            assert!(scope.grad().contains_key(&pool[0].id()));
            panic!("payload failed");
        }));
        assert!(res.is_err());
        assert!(g.is_empty());
    }

    #[test]
    #[should_panic(expected = "does not divide")]
    fn test_new_rejects_uneven_groups() {
        WeightNorm::new(
            vec![Param::zeros("w", 5)],
            vec![Param::zeros("m", 2)],
            Box::new(DenseBuilder { biases: Param::zeros("b", 2), input_count: 2, output_count: 2 }),
        );
    }

    #[test]
    #[should_panic(expected = "magnitude groups")]
    fn test_new_rejects_group_count_mismatch() {
        WeightNorm::new(
            vec![Param::zeros("w", 4)],
            vec![],
            Box::new(DenseBuilder { biases: Param::zeros("b", 2), input_count: 2, output_count: 2 }),
        );
    }

    #[test]
    fn test_group_error_messages() {
        assert!(group_error(&[6, 4], &[3, 2]).is_none());
        assert!(group_error(&[6], &[0]).is_some());
        assert!(group_error(&[6], &[4]).is_some());
    }
}

/// Layers and the dense affine transform.
///
/// A `Layer` maps an input node to an output node, either for one example
/// or for `n` examples concatenated back to back. `Network` chains layers.
/// `DenseLayer` computes `y = W x + b` with `W` stored row-major as
/// `[output_count, input_count]`.

use std::rc::Rc;

use crate::graph::{Gradient, Node, NodeRef, Param, RGradient, RNode, RNodeRef, RVector};
use crate::tensor::{self, SimpleRng};

pub trait Layer {
    fn apply(&self, input: NodeRef) -> NodeRef {
        self.batch(input, 1)
    }

    fn apply_r(&self, rv: &RVector, input: RNodeRef) -> RNodeRef {
        self.batch_r(rv, input, 1)
    }

    /// Apply to `n` inputs stored contiguously in `input`.
    fn batch(&self, input: NodeRef, n: usize) -> NodeRef;

    fn batch_r(&self, rv: &RVector, input: RNodeRef, n: usize) -> RNodeRef;

    /// Learnable parameters, in a stable order.
    fn parameters(&self) -> Vec<Param>;
}

/// Sequential composition of layers.
#[derive(Default)]
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
}

impl Network {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Network { layers }
    }

    /// Builder: append a layer.
    pub fn with_layer(mut self, layer: impl Layer + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Layer for Network {
    fn apply(&self, input: NodeRef) -> NodeRef {
        self.layers.iter().fold(input, |x, layer| layer.apply(x))
    }

    fn apply_r(&self, rv: &RVector, input: RNodeRef) -> RNodeRef {
        self.layers.iter().fold(input, |x, layer| layer.apply_r(rv, x))
    }

    fn batch(&self, input: NodeRef, n: usize) -> NodeRef {
        self.layers.iter().fold(input, |x, layer| layer.batch(x, n))
    }

    fn batch_r(&self, rv: &RVector, input: RNodeRef, n: usize) -> RNodeRef {
        self.layers.iter().fold(input, |x, layer| layer.batch_r(rv, x, n))
    }

    fn parameters(&self) -> Vec<Param> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }
}

// ── DenseLayer ───────────────────────────────────────────────────────

/// Fully-connected layer: out = W x + b.
#[derive(Clone, Debug)]
pub struct DenseLayer {
    pub input_count: usize,
    pub output_count: usize,
    pub weights: Param,
    pub biases: Param,
}

impl DenseLayer {
    /// Zero-initialized layer.
    pub fn new(input_count: usize, output_count: usize) -> Self {
        DenseLayer {
            input_count,
            output_count,
            weights: Param::zeros("weights", input_count * output_count),
            biases: Param::zeros("biases", output_count),
        }
    }

    /// Initialize with small random values using Xavier-like scaling.
    pub fn new_random(input_count: usize, output_count: usize, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let scale = (6.0 / (input_count + output_count) as f64).sqrt();
        let mut w = vec![0.0; input_count * output_count];
        rng.fill_uniform(&mut w, scale);
        let mut b = vec![0.0; output_count];
        rng.fill_uniform(&mut b, scale);
        DenseLayer {
            input_count,
            output_count,
            weights: Param::new("weights", w),
            biases: Param::new("biases", b),
        }
    }

    /// Layer over existing parameters. Panics on size mismatch.
    pub fn with_params(input_count: usize, output_count: usize,
                       weights: Param, biases: Param) -> Self {
        assert_eq!(weights.len(), input_count * output_count,
                   "dense weights: expected {}x{} = {} values, got {}",
                   output_count, input_count, input_count * output_count, weights.len());
        assert_eq!(biases.len(), output_count,
                   "dense biases: expected {output_count} values, got {}", biases.len());
        DenseLayer { input_count, output_count, weights, biases }
    }
}

impl Layer for DenseLayer {
    fn batch(&self, input: NodeRef, n: usize) -> NodeRef {
        affine(self.weights.node(), self.biases.node(), input,
               self.output_count, self.input_count, n)
    }

    fn batch_r(&self, rv: &RVector, input: RNodeRef, n: usize) -> RNodeRef {
        affine_r(self.weights.r_node(rv), self.biases.r_node(rv), input,
                 self.output_count, self.input_count, n)
    }

    fn parameters(&self) -> Vec<Param> {
        vec![self.weights.clone(), self.biases.clone()]
    }
}

// ── Affine node: out[b, i] = sum_j W[i, j] x[b, j] + bias[i] ──────────

struct Affine {
    weights: NodeRef,
    biases: NodeRef,
    input: NodeRef,
    rows: usize,
    cols: usize,
    n: usize,
    out: Vec<f64>,
}

fn check_affine_shapes(w: usize, b: usize, x: usize, rows: usize, cols: usize, n: usize) {
    assert_eq!(w, rows * cols, "affine: weights length {w} != {rows}x{cols}");
    assert_eq!(b, rows, "affine: bias length {b} != {rows}");
    assert_eq!(x, n * cols, "affine: input length {x} != {n} x {cols}");
}

pub fn affine(weights: NodeRef, biases: NodeRef, input: NodeRef,
              rows: usize, cols: usize, n: usize) -> NodeRef {
    check_affine_shapes(weights.output().len(), biases.output().len(),
                        input.output().len(), rows, cols, n);
    let mut out = vec![0.0; n * rows];
    tensor::affine_f64(weights.output(), biases.output(), input.output(), &mut out, rows, cols, n);
    Rc::new(Affine { weights, biases, input, rows, cols, n, out })
}

impl Node for Affine {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn constant(&self, g: &Gradient) -> bool {
        self.weights.constant(g) && self.biases.constant(g) && self.input.constant(g)
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        let (rows, cols, n) = (self.rows, self.cols, self.n);
        let w = self.weights.output();
        let x = self.input.output();

        if !self.input.constant(g) {
            // d_x[b, j] = sum_i u[b, i] W[i, j]
            let mut d_x = vec![0.0; n * cols];
            for b in 0..n {
                for i in 0..rows {
                    let u = upstream[b * rows + i];
                    for j in 0..cols {
                        d_x[b * cols + j] += u * w[i * cols + j];
                    }
                }
            }
            self.input.propagate_gradient(&d_x, g);
        }
        if !self.weights.constant(g) {
            // d_W[i, j] = sum_b u[b, i] x[b, j]
            let mut d_w = vec![0.0; rows * cols];
            for b in 0..n {
                for i in 0..rows {
                    let u = upstream[b * rows + i];
                    for j in 0..cols {
                        d_w[i * cols + j] += u * x[b * cols + j];
                    }
                }
            }
            self.weights.propagate_gradient(&d_w, g);
        }
        if !self.biases.constant(g) {
            let mut d_b = vec![0.0; rows];
            for chunk in upstream.chunks(rows) {
                tensor::add_assign_f64(&mut d_b, chunk);
            }
            self.biases.propagate_gradient(&d_b, g);
        }
    }
}

struct AffineR {
    weights: RNodeRef,
    biases: RNodeRef,
    input: RNodeRef,
    rows: usize,
    cols: usize,
    n: usize,
    out: Vec<f64>,
    out_r: Vec<f64>,
}

pub fn affine_r(weights: RNodeRef, biases: RNodeRef, input: RNodeRef,
                rows: usize, cols: usize, n: usize) -> RNodeRef {
    check_affine_shapes(weights.output().len(), biases.output().len(),
                        input.output().len(), rows, cols, n);
    let mut out = vec![0.0; n * rows];
    tensor::affine_f64(weights.output(), biases.output(), input.output(), &mut out, rows, cols, n);

    // out' = W' x + W x' + b'
    let mut out_r = vec![0.0; n * rows];
    tensor::affine_f64(weights.r_output(), biases.r_output(), input.output(),
                       &mut out_r, rows, cols, n);
    let zero_bias = vec![0.0; rows];
    let mut w_xr = vec![0.0; n * rows];
    tensor::affine_f64(weights.output(), &zero_bias, input.r_output(), &mut w_xr, rows, cols, n);
    tensor::add_assign_f64(&mut out_r, &w_xr);

    Rc::new(AffineR { weights, biases, input, rows, cols, n, out, out_r })
}

impl RNode for AffineR {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn r_output(&self) -> &[f64] {
        &self.out_r
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        self.weights.constant(rg, g) && self.biases.constant(rg, g) && self.input.constant(rg, g)
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        let (rows, cols, n) = (self.rows, self.cols, self.n);
        let (w, w_r) = (self.weights.output(), self.weights.r_output());
        let (x, x_r) = (self.input.output(), self.input.r_output());

        if !self.input.constant(rg, g) {
            let mut d_x = vec![0.0; n * cols];
            let mut d_x_r = vec![0.0; n * cols];
            for b in 0..n {
                for i in 0..rows {
                    let (u, u_r) = (upstream[b * rows + i], upstream_r[b * rows + i]);
                    for j in 0..cols {
                        d_x[b * cols + j] += u * w[i * cols + j];
                        d_x_r[b * cols + j] += u_r * w[i * cols + j] + u * w_r[i * cols + j];
                    }
                }
            }
            self.input.propagate_r_gradient(&d_x, &d_x_r, rg, g);
        }
        if !self.weights.constant(rg, g) {
            let mut d_w = vec![0.0; rows * cols];
            let mut d_w_r = vec![0.0; rows * cols];
            for b in 0..n {
                for i in 0..rows {
                    let (u, u_r) = (upstream[b * rows + i], upstream_r[b * rows + i]);
                    for j in 0..cols {
                        d_w[i * cols + j] += u * x[b * cols + j];
                        d_w_r[i * cols + j] += u_r * x[b * cols + j] + u * x_r[b * cols + j];
                    }
                }
            }
            self.weights.propagate_r_gradient(&d_w, &d_w_r, rg, g);
        }
        if !self.biases.constant(rg, g) {
            let mut d_b = vec![0.0; rows];
            let mut d_b_r = vec![0.0; rows];
            for (chunk, chunk_r) in upstream.chunks(rows).zip(upstream_r.chunks(rows)) {
                tensor::add_assign_f64(&mut d_b, chunk);
                tensor::add_assign_f64(&mut d_b_r, chunk_r);
            }
            self.biases.propagate_r_gradient(&d_b, &d_b_r, rg, g);
        }
    }
}

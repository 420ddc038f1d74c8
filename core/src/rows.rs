// Row operators over flat row-major matrices.
//
// A vector of length R*W is read as R contiguous rows of width W.
// `row_norms` reduces each row to its Euclidean norm; `scale_rows` multiplies
// each row by one scalar.
//
// Zero rows are not guarded: the norm is 0 and its derivative divides by it,
// so gradients through an all-zero row are NaN. Callers that normalize by
// these norms see the same IEEE behavior in the forward pass.

use std::rc::Rc;

use crate::graph::{Gradient, Node, NodeRef, RGradient, RNode, RNodeRef};
use crate::tensor;

/// Row width for a `len`-element matrix with `rows` rows. Panics unless the
/// split is exact.
pub fn row_width(len: usize, rows: usize) -> usize {
    assert!(rows > 0, "row count must be positive");
    assert_eq!(len % rows, 0,
               "matrix of length {len} does not split into {rows} equal rows");
    len / rows
}

// ── RowNorms: out[i] = ||M[i, :]||_2 ─────────────────────────────────

struct RowNorms {
    input: NodeRef,
    width: usize,
    out: Vec<f64>,
}

pub fn row_norms(input: NodeRef, rows: usize) -> NodeRef {
    let width = row_width(input.output().len(), rows);
    let x = input.output();
    let out = (0..rows).map(|i| tensor::vec_norm_f64(&x[i * width..(i + 1) * width])).collect();
    Rc::new(RowNorms { input, width, out })
}

impl Node for RowNorms {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn constant(&self, g: &Gradient) -> bool {
        self.input.constant(g)
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        if self.input.constant(g) {
            return;
        }
        let x = self.input.output();
        let mut d_input = vec![0.0; x.len()];
        for (i, (&u, &norm)) in upstream.iter().zip(self.out.iter()).enumerate() {
            let base = i * self.width;
            // d_x = u * x / ||x||
            for j in base..base + self.width {
                d_input[j] = u * x[j] / norm;
            }
        }
        self.input.propagate_gradient(&d_input, g);
    }
}

struct RowNormsR {
    input: RNodeRef,
    width: usize,
    out: Vec<f64>,
    out_r: Vec<f64>,
}

pub fn row_norms_r(input: RNodeRef, rows: usize) -> RNodeRef {
    let width = row_width(input.output().len(), rows);
    let x = input.output();
    let x_r = input.r_output();
    let mut out = Vec::with_capacity(rows);
    let mut out_r = Vec::with_capacity(rows);
    for i in 0..rows {
        let row = &x[i * width..(i + 1) * width];
        let row_r = &x_r[i * width..(i + 1) * width];
        let norm = tensor::vec_norm_f64(row);
        out.push(norm);
        // ||x||' = <x, x'> / ||x||
        out_r.push(tensor::dot_f64(row, row_r) / norm);
    }
    Rc::new(RowNormsR { input, width, out, out_r })
}

impl RNode for RowNormsR {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn r_output(&self) -> &[f64] {
        &self.out_r
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        self.input.constant(rg, g)
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        if self.input.constant(rg, g) {
            return;
        }
        let x = self.input.output();
        let x_r = self.input.r_output();
        let mut d_input = vec![0.0; x.len()];
        let mut d_input_r = vec![0.0; x.len()];
        for i in 0..self.out.len() {
            let (u, u_r) = (upstream[i], upstream_r[i]);
            let (norm, norm_r) = (self.out[i], self.out_r[i]);
            let base = i * self.width;
            for j in base..base + self.width {
                d_input[j] = u * x[j] / norm;
                d_input_r[j] = (u_r * x[j] + u * x_r[j]) / norm
                    - u * x[j] * norm_r / (norm * norm);
            }
        }
        self.input.propagate_r_gradient(&d_input, &d_input_r, rg, g);
    }
}

// ── ScaleRows: out[i, j] = s[i] * M[i, j] ────────────────────────────
//
// The scale vector is read once into `scales` and used as a frozen value for
// both the matrix VJP and the per-row dot products; its own gradient is then
// pushed upstream in a single call.

struct ScaleRows {
    matrix: NodeRef,
    scale: NodeRef,
    width: usize,
    scales: Vec<f64>,
    out: Vec<f64>,
}

pub fn scale_rows(matrix: NodeRef, scale: NodeRef) -> NodeRef {
    let scales = scale.output().to_vec();
    let width = row_width(matrix.output().len(), scales.len());
    let m = matrix.output();
    let out = scales.iter().enumerate()
        .flat_map(|(i, &s)| m[i * width..(i + 1) * width].iter().map(move |x| s * x))
        .collect();
    Rc::new(ScaleRows { matrix, scale, width, scales, out })
}

impl Node for ScaleRows {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn constant(&self, g: &Gradient) -> bool {
        self.matrix.constant(g) && self.scale.constant(g)
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        let w = self.width;
        if !self.scale.constant(g) {
            // d_s[i] = <u[i, :], M[i, :]>
            let m = self.matrix.output();
            let d_scale: Vec<f64> = (0..self.scales.len())
                .map(|i| tensor::dot_f64(&upstream[i * w..(i + 1) * w], &m[i * w..(i + 1) * w]))
                .collect();
            self.scale.propagate_gradient(&d_scale, g);
        }
        if !self.matrix.constant(g) {
            // d_M[i, j] = u[i, j] * s[i]
            let d_matrix: Vec<f64> = self.scales.iter().enumerate()
                .flat_map(|(i, &s)| upstream[i * w..(i + 1) * w].iter().map(move |u| u * s))
                .collect();
            self.matrix.propagate_gradient(&d_matrix, g);
        }
    }
}

struct ScaleRowsR {
    matrix: RNodeRef,
    scale: RNodeRef,
    width: usize,
    scales: Vec<f64>,
    scales_r: Vec<f64>,
    out: Vec<f64>,
    out_r: Vec<f64>,
}

pub fn scale_rows_r(matrix: RNodeRef, scale: RNodeRef) -> RNodeRef {
    let scales = scale.output().to_vec();
    let scales_r = scale.r_output().to_vec();
    let width = row_width(matrix.output().len(), scales.len());
    let m = matrix.output();
    let m_r = matrix.r_output();
    let mut out = vec![0.0; m.len()];
    let mut out_r = vec![0.0; m.len()];
    for i in 0..scales.len() {
        for j in i * width..(i + 1) * width {
            out[j] = scales[i] * m[j];
            out_r[j] = scales_r[i] * m[j] + scales[i] * m_r[j];
        }
    }
    Rc::new(ScaleRowsR { matrix, scale, width, scales, scales_r, out, out_r })
}

impl RNode for ScaleRowsR {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn r_output(&self) -> &[f64] {
        &self.out_r
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        self.matrix.constant(rg, g) && self.scale.constant(rg, g)
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        let w = self.width;
        let rows = self.scales.len();
        if !self.scale.constant(rg, g) {
            let m = self.matrix.output();
            let m_r = self.matrix.r_output();
            let mut d_scale = vec![0.0; rows];
            let mut d_scale_r = vec![0.0; rows];
            for i in 0..rows {
                let span = i * w..(i + 1) * w;
                d_scale[i] = tensor::dot_f64(&upstream[span.clone()], &m[span.clone()]);
                d_scale_r[i] = tensor::dot_f64(&upstream_r[span.clone()], &m[span.clone()])
                    + tensor::dot_f64(&upstream[span.clone()], &m_r[span]);
            }
            self.scale.propagate_r_gradient(&d_scale, &d_scale_r, rg, g);
        }
        if !self.matrix.constant(rg, g) {
            let mut d_matrix = vec![0.0; upstream.len()];
            let mut d_matrix_r = vec![0.0; upstream.len()];
            for i in 0..rows {
                let (s, s_r) = (self.scales[i], self.scales_r[i]);
                for j in i * w..(i + 1) * w {
                    d_matrix[j] = upstream[j] * s;
                    d_matrix_r[j] = upstream_r[j] * s + upstream[j] * s_r;
                }
            }
            self.matrix.propagate_r_gradient(&d_matrix, &d_matrix_r, rg, g);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

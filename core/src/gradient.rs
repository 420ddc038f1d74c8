/// Gradient verification against central finite differences.
///
/// Provides:
/// - `check_gradients`: reverse-mode gradients of `dot(u, f(θ))`
/// - `check_r_output`: forward-mode directional derivative of `f(θ)`
/// - `check_r_gradients`: forward-over-reverse gradients
/// - `directional_mismatch`: agreement between the two modes
///
/// Graphs are rebuilt from the current parameter values for every
/// perturbation, so the closures passed in must build a fresh graph on
/// each call. Parameters are always restored before returning.

use tracing::warn;

use crate::graph::{
    zero_gradient, Gradient, Node, NodeRef, Param, RGradient, RNode, RNodeRef, RVector,
};
use crate::tensor::dot_f64;

/// Both values below this magnitude are auto-passed (below FD resolution).
const ABS_THRESHOLD: f64 = 1e-6;

/// Outcome of one gradient check.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GradCheckReport {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f64,
}

impl GradCheckReport {
    pub fn all_passed(&self) -> bool {
        self.checked == self.passed
    }

    /// Compare one analytical value with its numerical estimate.
    ///
    /// Relative error uses denominator max(|a|, |b|) and values where both
    /// sides are below `ABS_THRESHOLD` pass unconditionally.
    fn record(&mut self, name: &str, idx: usize, analytical: f64, numerical: f64, tol: f64) {
        self.checked += 1;
        let denom = analytical.abs().max(numerical.abs());
        if denom < ABS_THRESHOLD {
            self.passed += 1;
            return;
        }
        let rel_err = (analytical - numerical).abs() / denom;
        // NaN compares false, so it must be caught explicitly.
        if rel_err.is_nan() || rel_err > self.max_rel_err {
            self.max_rel_err = rel_err;
        }
        if rel_err < tol {
            self.passed += 1;
        } else {
            warn!("FAIL {name}[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                   rel_err={rel_err:.4e}");
        }
    }

    fn merge(&mut self, other: GradCheckReport) {
        self.checked += other.checked;
        self.passed += other.passed;
        if other.max_rel_err.is_nan() || other.max_rel_err > self.max_rel_err {
            self.max_rel_err = other.max_rel_err;
        }
    }
}

/// Reverse-mode gradient of `dot(upstream, f())` with respect to `params`.
pub fn reverse_gradient(params: &[Param], upstream: &[f64], f: &impl Fn() -> NodeRef) -> Gradient {
    let mut g = zero_gradient(params);
    f().propagate_gradient(upstream, &mut g);
    g
}

/// Run `eval` with every parameter shifted by `scale * rv[p]`, then restore.
fn with_shift<R>(params: &[Param], rv: &RVector, scale: f64, eval: impl FnOnce() -> R) -> R {
    let saved: Vec<Vec<f64>> = params.iter().map(Param::value).collect();
    for p in params {
        if let Some(dir) = rv.get(&p.id()) {
            p.update(|v| {
                for (x, d) in v.iter_mut().zip(dir.iter()) {
                    *x += scale * d;
                }
            });
        }
    }
    let res = eval();
    for (p, v) in params.iter().zip(saved) {
        p.set_value(v);
    }
    res
}

/// Check reverse-mode gradients of `dot(upstream, f())` for every component
/// of every parameter in `params`.
pub fn check_gradients(
    params: &[Param],
    upstream: &[f64],
    eps: f64,
    tol: f64,
    f: impl Fn() -> NodeRef,
) -> GradCheckReport {
    let g = reverse_gradient(params, upstream, &f);
    let loss = || dot_f64(upstream, f().output());
    let mut report = GradCheckReport::default();

    for p in params {
        for idx in 0..p.len() {
            let orig = p.with_value(|v| v[idx]);
            p.update(|v| v[idx] = orig + eps);
            let loss_plus = loss();
            p.update(|v| v[idx] = orig - eps);
            let loss_minus = loss();
            p.update(|v| v[idx] = orig);

            let numerical = (loss_plus - loss_minus) / (2.0 * eps);
            report.record(p.name(), idx, g[&p.id()][idx], numerical, tol);
        }
    }
    report
}

/// Check the forward-mode directional derivative of `f` along `rv`.
pub fn check_r_output(
    params: &[Param],
    rv: &RVector,
    eps: f64,
    tol: f64,
    f: impl Fn(&RVector) -> RNodeRef,
) -> GradCheckReport {
    let analytical = f(rv).r_output().to_vec();
    let plus = with_shift(params, rv, eps, || f(rv).output().to_vec());
    let minus = with_shift(params, rv, -eps, || f(rv).output().to_vec());

    let mut report = GradCheckReport::default();
    for (idx, a) in analytical.iter().enumerate() {
        let numerical = (plus[idx] - minus[idx]) / (2.0 * eps);
        report.record("r_output", idx, *a, numerical, tol);
    }
    report
}

/// Check forward-over-reverse gradients.
///
/// The directional gradient must match a central difference of the
/// reverse-mode gradient along `rv`, and the ordinary gradient computed by
/// the forward-mode graph must match the reverse-mode one.
pub fn check_r_gradients(
    params: &[Param],
    rv: &RVector,
    upstream: &[f64],
    eps: f64,
    tol: f64,
    f: impl Fn() -> NodeRef,
    f_r: impl Fn(&RVector) -> RNodeRef,
) -> GradCheckReport {
    let mut g: Gradient = zero_gradient(params);
    let mut rg: RGradient = zero_gradient(params);
    let upstream_r = vec![0.0; upstream.len()];
    f_r(rv).propagate_r_gradient(upstream, &upstream_r, &mut rg, &mut g);

    let expected = reverse_gradient(params, upstream, &f);
    let plus = with_shift(params, rv, eps, || reverse_gradient(params, upstream, &f));
    let minus = with_shift(params, rv, -eps, || reverse_gradient(params, upstream, &f));

    let mut report = GradCheckReport::default();
    for p in params {
        let id = p.id();
        for idx in 0..p.len() {
            let numerical = (plus[&id][idx] - minus[&id][idx]) / (2.0 * eps);
            report.record(p.name(), idx, rg[&id][idx], numerical, tol);
        }
    }

    let mut same = GradCheckReport::default();
    for p in params {
        let id = p.id();
        for idx in 0..p.len() {
            same.record(p.name(), idx, g[&id][idx], expected[&id][idx], tol);
        }
    }
    report.merge(same);
    report
}

/// |dot(u, r_output) - Σ_p dot(grad_p, v_p)|.
///
/// Both sides equal the directional derivative of `dot(u, f)` along `rv`,
/// one from forward mode and one from reverse mode.
pub fn directional_mismatch(
    params: &[Param],
    rv: &RVector,
    upstream: &[f64],
    f: impl Fn() -> NodeRef,
    f_r: impl Fn(&RVector) -> RNodeRef,
) -> f64 {
    let forward = dot_f64(upstream, f_r(rv).r_output());
    let g = reverse_gradient(params, upstream, &f);
    let reverse: f64 = params.iter()
        .filter_map(|p| rv.get(&p.id()).map(|v| dot_f64(&g[&p.id()], v)))
        .sum();
    (forward - reverse).abs()
}

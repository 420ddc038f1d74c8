/// Weight norm over dense payloads: bootstrap equivalence, parameter export,
/// and gradient routing in both differentiation modes.

use norm_test_utils::{check_close, rand_buf, rand_direction, two_layer_norm};

use weightnorm_core::gradient::{
    check_gradients, check_r_gradients, check_r_output, directional_mismatch,
};
use weightnorm_core::tensor::max_abs_diff_f64;
use weightnorm_core::{
    constant, constant_r, zero_gradient, DenseBuilder, DenseLayer, Layer, Network, Node, Param,
    RNode, WeightNorm,
};

const EPS: f64 = 1e-5;
const TOL: f64 = 1e-4;

fn report_ok(name: &str, r: weightnorm_core::gradient::GradCheckReport) {
    eprintln!("{name}: {}/{} pass, max_rel_err={:.4e}", r.passed, r.checked, r.max_rel_err);
    assert!(r.all_passed(), "{name}: {r:?}");
}

// ── Bootstrap ────────────────────────────────────────────────────────

#[test]
fn test_bootstrap_matches_dense() {
    let layer = DenseLayer::new_random(7, 4, 42);
    let norm = WeightNorm::from_dense(&layer);
    for seed in 1..5 {
        let x = rand_buf(7, seed * 11);
        let expected = layer.apply(constant(x.clone()));
        let actual = norm.apply(constant(x));
        let diff = max_abs_diff_f64(expected.output(), actual.output());
        assert!(diff < 1e-5, "seed={seed}: max diff {diff}");
    }
}

#[test]
fn test_bootstrap_magnitudes_are_row_norms() {
    let layer = DenseLayer::with_params(2, 2, Param::new("w", vec![3.0, 4.0, 0.0, -2.0]),
                                        Param::zeros("b", 2));
    let norm = WeightNorm::from_dense(&layer);
    assert_eq!(norm.num_groups(), 1);
    check_close("mags", &norm.mags[0].value(), &[5.0, 2.0], 1e-12);
    assert_eq!(norm.weights[0].value(), layer.weights.value());
    assert_ne!(norm.weights[0].id(), layer.weights.id(), "directions are a copy");
}

#[test]
fn test_bootstrap_batch_matches_dense() {
    let layer = DenseLayer::new_random(5, 3, 7);
    let norm = WeightNorm::from_dense(&layer);
    let xs = rand_buf(5 * 4, 99);
    let expected = layer.batch(constant(xs.clone()), 4);
    let actual = norm.batch(constant(xs), 4);
    assert!(max_abs_diff_f64(expected.output(), actual.output()) < 1e-5);
}

#[test]
fn test_bootstrap_zero_inputs() {
    // One magnitude per output row even when rows are empty.
    let layer = DenseLayer::new(0, 2);
    let norm = WeightNorm::from_dense(&layer);
    assert_eq!(norm.mags[0].value(), vec![0.0, 0.0]);
    check_close("out", norm.apply(constant(Vec::new())).output(), &[0.0, 0.0], 1e-12);
}

// ── Parameters ───────────────────────────────────────────────────────

#[test]
fn test_parameters_exclude_pooled() {
    let layer = DenseLayer::new_random(6, 3, 5);
    let norm = WeightNorm::from_dense(&layer);
    let params = norm.parameters();
    assert_eq!(params.len(), 3);
    assert_eq!(params[0].id(), norm.weights[0].id());
    assert_eq!(params[1].id(), norm.mags[0].id());
    assert_eq!(params[2].id(), layer.biases.id(), "bias shared with source layer");

    let again: Vec<_> = norm.parameters().iter().map(Param::id).collect();
    let first: Vec<_> = params.iter().map(Param::id).collect();
    assert_eq!(first, again, "parameter order must be stable");
}

#[test]
fn test_gradient_has_no_pooled_keys() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(4, 3, 9));
    let params = norm.parameters();
    let mut g = zero_gradient(&params);
    norm.apply(constant(rand_buf(4, 1))).propagate_gradient(&rand_buf(3, 2), &mut g);
    assert_eq!(g.len(), params.len());
    for p in &params {
        assert!(g[&p.id()].iter().all(|v| v.is_finite()), "{}", p.name());
    }

    let rv = rand_direction(&params, 3);
    let mut g = zero_gradient(&params);
    let mut rg = zero_gradient(&params);
    norm.apply_r(&rv, constant_r(rand_buf(4, 1)))
        .propagate_r_gradient(&rand_buf(3, 2), &rand_buf(3, 4), &mut rg, &mut g);
    assert_eq!(g.len(), params.len());
    assert_eq!(rg.len(), params.len());
}

#[test]
fn test_magnitude_only_target() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(4, 3, 13));
    let mut g = zero_gradient(&[norm.mags[0].clone()]);
    norm.apply(constant(rand_buf(4, 1))).propagate_gradient(&[1.0, 1.0, 1.0], &mut g);
    assert_eq!(g.len(), 1);
    assert!(g[&norm.mags[0].id()].iter().any(|v| *v != 0.0));
}

#[test]
fn test_updates_visible_to_new_graphs() {
    let layer = DenseLayer::with_params(2, 1, Param::new("w", vec![3.0, 4.0]),
                                        Param::zeros("b", 1));
    let norm = WeightNorm::from_dense(&layer);
    let x = vec![1.0, 1.0];
    let before = norm.apply(constant(x.clone()));
    norm.mags[0].update(|m| m[0] *= 2.0);
    let after = norm.apply(constant(x));
    check_close("before", before.output(), &[7.0], 1e-12);
    check_close("after", after.output(), &[14.0], 1e-12);
}

// ── Reverse mode ─────────────────────────────────────────────────────

#[test]
fn test_gradients_dense() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(5, 3, 21));
    // Move magnitudes away from the row norms.
    norm.mags[0].update(|m| m.iter_mut().for_each(|v| *v *= 1.7));
    let x = Param::new("x", rand_buf(5, 4));
    let mut params = norm.parameters();
    params.push(x.clone());
    let r = check_gradients(&params, &rand_buf(3, 5), EPS, TOL, || norm.apply(x.node()));
    report_ok("dense", r);
}

#[test]
fn test_gradients_batch() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(4, 3, 22));
    let xs = rand_buf(4 * 3, 6);
    let r = check_gradients(&norm.parameters(), &rand_buf(3 * 3, 7), EPS, TOL,
                            || norm.batch(constant(xs.clone()), 3));
    report_ok("batch", r);
}

#[test]
fn test_gradients_multi_group() {
    let norm = two_layer_norm(4, 5, 2, 31);
    let params = norm.parameters();
    assert_eq!(params.len(), 6);
    let x = rand_buf(4, 8);
    let r = check_gradients(&params, &rand_buf(2, 9), EPS, TOL,
                            || norm.apply(constant(x.clone())));
    report_ok("multi_group", r);
}

#[test]
fn test_gradients_stacked() {
    let net = Network::default()
        .with_layer(WeightNorm::from_dense(&DenseLayer::new_random(4, 6, 41)))
        .with_layer(WeightNorm::from_dense(&DenseLayer::new_random(6, 2, 42)));
    let params = net.parameters();
    assert_eq!(params.len(), 6);
    let x = rand_buf(4, 10);
    let r = check_gradients(&params, &rand_buf(2, 11), EPS, TOL,
                            || net.apply(constant(x.clone())));
    report_ok("stacked", r);
}

// ── Forward mode ─────────────────────────────────────────────────────

#[test]
fn test_r_output_dense() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(5, 3, 51));
    let x = Param::new("x", rand_buf(5, 12));
    let mut params = norm.parameters();
    params.push(x.clone());
    let rv = rand_direction(&params, 13);
    let r = check_r_output(&params, &rv, EPS, TOL, |rv| norm.apply_r(rv, x.r_node(rv)));
    report_ok("r_output", r);
}

#[test]
fn test_r_gradients_dense() {
    let norm = WeightNorm::from_dense(&DenseLayer::new_random(4, 3, 52));
    norm.mags[0].update(|m| m.iter_mut().for_each(|v| *v *= 0.6));
    let params = norm.parameters();
    let rv = rand_direction(&params, 14);
    let x = rand_buf(4, 15);
    let r = check_r_gradients(&params, &rv, &rand_buf(3, 16), EPS, TOL,
                              || norm.apply(constant(x.clone())),
                              |rv| norm.apply_r(rv, constant_r(x.clone())));
    report_ok("r_gradients", r);
}

#[test]
fn test_r_gradients_multi_group_batch() {
    let norm = two_layer_norm(3, 4, 2, 53);
    let params = norm.parameters();
    let rv = rand_direction(&params, 17);
    let xs = rand_buf(3 * 2, 18);
    let r = check_r_gradients(&params, &rv, &rand_buf(2 * 2, 19), EPS, TOL,
                              || norm.batch(constant(xs.clone()), 2),
                              |rv| norm.batch_r(rv, constant_r(xs.clone()), 2));
    report_ok("r_gradients_multi", r);
}

#[test]
fn test_directional_consistency() {
    let norm = two_layer_norm(4, 3, 3, 61);
    let params = norm.parameters();
    let rv = rand_direction(&params, 20);
    let x = rand_buf(4, 21);
    let mismatch = directional_mismatch(&params, &rv, &rand_buf(3, 22),
                                        || norm.apply(constant(x.clone())),
                                        |rv| norm.apply_r(rv, constant_r(x.clone())));
    assert!(mismatch < 1e-9, "mismatch={mismatch}");
}

#[test]
fn test_r_output_partial_direction() {
    // Only the magnitudes move: the output changes linearly in m.
    let layer = DenseLayer::with_params(2, 1, Param::new("w", vec![3.0, 4.0]),
                                        Param::zeros("b", 1));
    let norm = WeightNorm::from_dense(&layer);
    let mut rv = weightnorm_core::RVector::new();
    rv.insert(norm.mags[0].id(), vec![1.0]);
    let out = norm.apply_r(&rv, constant_r(vec![1.0, 1.0]));
    // d/dm (m * 7 / 5)
    check_close("r_output", out.r_output(), &[1.4], 1e-12);
}

// ── Edge cases ───────────────────────────────────────────────────────

#[test]
fn test_zero_row_is_nan() {
    let layer = DenseLayer::with_params(2, 2, Param::new("w", vec![0.0, 0.0, 1.0, 1.0]),
                                        Param::zeros("b", 2));
    let norm = WeightNorm::from_dense(&layer);
    let out = norm.apply(constant(vec![1.0, 2.0]));
    assert!(out.output()[0].is_nan());
    assert!((out.output()[1] - 3.0).abs() < 1e-12);

    // Non-zero magnitude over a zero row is NaN as well.
    let norm = WeightNorm::new(vec![Param::zeros("w", 2)], vec![Param::new("m", vec![1.0])],
                               Box::new(DenseBuilder {
                                   biases: Param::zeros("b", 1),
                                   input_count: 2,
                                   output_count: 1,
                               }));
    assert!(norm.apply(constant(vec![1.0, 2.0])).output()[0].is_nan());
}

#[test]
#[should_panic(expected = "exactly one pooled parameter")]
fn test_dense_builder_rejects_two_groups() {
    let norm = WeightNorm::new(
        vec![Param::new("w1", vec![1.0; 4]), Param::new("w2", vec![1.0; 4])],
        vec![Param::new("m1", vec![1.0; 2]), Param::new("m2", vec![1.0; 2])],
        Box::new(DenseBuilder { biases: Param::zeros("b", 2), input_count: 2, output_count: 2 }),
    );
    norm.apply(constant(vec![1.0, 1.0]));
}

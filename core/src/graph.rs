// Differentiable graph: parameters, gradient maps, and node traits.
//
// Reverse mode: every node exposes its output and pushes an upstream
// gradient into a `Gradient` map keyed by parameter id. Only parameters
// present as keys receive gradient, so the key set doubles as the set of
// requested targets and lets nodes skip work via `constant()`.
//
// Forward mode: `RNode` additionally carries the directional derivative
// (`r_output`) along an `RVector`, and propagates the pair
// (gradient, directional gradient) backwards.
//
// Leaves snapshot their parameter value at construction. A graph built
// before a parameter update keeps computing with the old value.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::tensor;

// ── Parameters ───────────────────────────────────────────────────────

static NEXT_PARAM_ID: AtomicUsize = AtomicUsize::new(1);

/// Identity of a parameter. Unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(usize);

struct ParamInner {
    id: ParamId,
    name: String,
    data: RefCell<Vec<f64>>,
}

/// Named leaf vector. Cloning shares the same underlying storage and id.
#[derive(Clone)]
pub struct Param(Rc<ParamInner>);

impl Param {
    pub fn new(name: impl Into<String>, data: Vec<f64>) -> Self {
        let id = ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed));
        Param(Rc::new(ParamInner { id, name: name.into(), data: RefCell::new(data) }))
    }

    pub fn zeros(name: impl Into<String>, len: usize) -> Self {
        Param::new(name, vec![0.0; len])
    }

    #[inline] pub fn id(&self) -> ParamId { self.0.id }
    #[inline] pub fn name(&self) -> &str { &self.0.name }

    pub fn len(&self) -> usize {
        self.0.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current value.
    pub fn value(&self) -> Vec<f64> {
        self.0.data.borrow().clone()
    }

    /// Borrow the current value for the duration of `f`.
    pub fn with_value<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        f(&self.0.data.borrow())
    }

    /// Replace the value. Length must not change.
    pub fn set_value(&self, data: Vec<f64>) {
        let mut cur = self.0.data.borrow_mut();
        assert_eq!(cur.len(), data.len(),
                   "set_value on {:?}: length {} -> {}", self.0.name, cur.len(), data.len());
        *cur = data;
    }

    /// Mutate the value in place (optimizer seam).
    pub fn update(&self, f: impl FnOnce(&mut [f64])) {
        f(&mut self.0.data.borrow_mut());
    }

    /// Reverse-mode leaf holding a snapshot of the current value.
    pub fn node(&self) -> NodeRef {
        Rc::new(ParamLeaf { id: self.id(), value: self.value() })
    }

    /// Forward-mode leaf. Direction comes from `rv`, zeros if absent.
    pub fn r_node(&self, rv: &RVector) -> RNodeRef {
        let value = self.value();
        let r_value = match rv.get(&self.id()) {
            Some(r) => {
                assert_eq!(r.len(), value.len(),
                           "direction for {:?} has length {}, expected {}",
                           self.0.name, r.len(), value.len());
                r.clone()
            }
            None => vec![0.0; value.len()],
        };
        Rc::new(RParamLeaf { id: self.id(), value, r_value })
    }

    pub fn to_named(&self) -> NamedVector {
        NamedVector { name: self.0.name.clone(), data: self.value() }
    }

    /// Fresh parameter (new id) holding the named vector's data.
    pub fn from_named(v: NamedVector) -> Self {
        Param::new(v.name, v.data)
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Serialized form of a parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedVector {
    pub name: String,
    pub data: Vec<f64>,
}

// ── Gradient maps ────────────────────────────────────────────────────

/// Accumulated gradients, keyed by parameter. Presence of a key marks the
/// parameter as a gradient target.
pub type Gradient = HashMap<ParamId, Vec<f64>>;

/// Accumulated directional gradients (forward-over-reverse).
pub type RGradient = HashMap<ParamId, Vec<f64>>;

/// Directional-derivative seed per parameter.
pub type RVector = HashMap<ParamId, Vec<f64>>;

/// Zero-filled gradient slots for every parameter in `params`.
pub fn zero_gradient(params: &[Param]) -> Gradient {
    params.iter().map(|p| (p.id(), vec![0.0; p.len()])).collect()
}

/// Add `delta` into `g[id]` if `id` is a target. No-op otherwise.
pub fn accumulate(g: &mut Gradient, id: ParamId, delta: &[f64]) {
    if let Some(slot) = g.get_mut(&id) {
        assert_eq!(slot.len(), delta.len(),
                   "accumulate size mismatch: slot={} delta={}", slot.len(), delta.len());
        tensor::add_assign_f64(slot, delta);
    }
}

// ── Node traits ──────────────────────────────────────────────────────

/// Reverse-mode graph node.
pub trait Node {
    fn output(&self) -> &[f64];

    /// True if no target in `g` is reachable from this node.
    fn constant(&self, g: &Gradient) -> bool;

    /// Push `upstream` (d loss / d output) into every reachable target.
    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient);
}

/// Forward-mode graph node.
pub trait RNode {
    fn output(&self) -> &[f64];

    /// Directional derivative of `output()` along the seeding `RVector`.
    fn r_output(&self) -> &[f64];

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool;

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient);
}

pub type NodeRef = Rc<dyn Node>;
pub type RNodeRef = Rc<dyn RNode>;

// ── Leaves ───────────────────────────────────────────────────────────

struct ParamLeaf {
    id: ParamId,
    value: Vec<f64>,
}

impl Node for ParamLeaf {
    fn output(&self) -> &[f64] {
        &self.value
    }

    fn constant(&self, g: &Gradient) -> bool {
        !g.contains_key(&self.id)
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        accumulate(g, self.id, upstream);
    }
}

struct RParamLeaf {
    id: ParamId,
    value: Vec<f64>,
    r_value: Vec<f64>,
}

impl RNode for RParamLeaf {
    fn output(&self) -> &[f64] {
        &self.value
    }

    fn r_output(&self) -> &[f64] {
        &self.r_value
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        !rg.contains_key(&self.id) && !g.contains_key(&self.id)
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        accumulate(g, self.id, upstream);
        accumulate(rg, self.id, upstream_r);
    }
}

/// Input with no parameter identity. Always constant.
struct ConstLeaf {
    value: Vec<f64>,
    r_value: Vec<f64>,
}

impl Node for ConstLeaf {
    fn output(&self) -> &[f64] {
        &self.value
    }

    fn constant(&self, _g: &Gradient) -> bool {
        true
    }

    fn propagate_gradient(&self, _upstream: &[f64], _g: &mut Gradient) {}
}

impl RNode for ConstLeaf {
    fn output(&self) -> &[f64] {
        &self.value
    }

    fn r_output(&self) -> &[f64] {
        &self.r_value
    }

    fn constant(&self, _rg: &RGradient, _g: &Gradient) -> bool {
        true
    }

    fn propagate_r_gradient(&self, _u: &[f64], _ur: &[f64],
                            _rg: &mut RGradient, _g: &mut Gradient) {}
}

pub fn constant(value: Vec<f64>) -> NodeRef {
    Rc::new(ConstLeaf { r_value: Vec::new(), value })
}

/// Constant input for forward mode; its directional derivative is zero.
pub fn constant_r(value: Vec<f64>) -> RNodeRef {
    Rc::new(ConstLeaf { r_value: vec![0.0; value.len()], value })
}

// ── Element-wise division: out = a / b ───────────────────────────────

struct Div {
    a: NodeRef,
    b: NodeRef,
    out: Vec<f64>,
}

/// Element-wise quotient. Division by zero follows IEEE semantics.
pub fn div(a: NodeRef, b: NodeRef) -> NodeRef {
    assert_eq!(a.output().len(), b.output().len(), "div: operand length mismatch");
    let out = a.output().iter().zip(b.output().iter()).map(|(x, y)| x / y).collect();
    Rc::new(Div { a, b, out })
}

impl Node for Div {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn constant(&self, g: &Gradient) -> bool {
        self.a.constant(g) && self.b.constant(g)
    }

    fn propagate_gradient(&self, upstream: &[f64], g: &mut Gradient) {
        let b = self.b.output();
        if !self.a.constant(g) {
            // d_a = u / b
            let d_a: Vec<f64> = upstream.iter().zip(b.iter()).map(|(u, b)| u / b).collect();
            self.a.propagate_gradient(&d_a, g);
        }
        if !self.b.constant(g) {
            // d_b = -u * out / b
            let d_b: Vec<f64> = (0..b.len()).map(|i| -upstream[i] * self.out[i] / b[i]).collect();
            self.b.propagate_gradient(&d_b, g);
        }
    }
}

struct DivR {
    a: RNodeRef,
    b: RNodeRef,
    out: Vec<f64>,
    out_r: Vec<f64>,
}

pub fn div_r(a: RNodeRef, b: RNodeRef) -> RNodeRef {
    assert_eq!(a.output().len(), b.output().len(), "div_r: operand length mismatch");
    let n = a.output().len();
    let (x, y) = (a.output(), b.output());
    let (x_r, y_r) = (a.r_output(), b.r_output());
    let mut out = vec![0.0; n];
    let mut out_r = vec![0.0; n];
    for i in 0..n {
        out[i] = x[i] / y[i];
        // (a/b)' = a'/b - a b'/b^2
        out_r[i] = x_r[i] / y[i] - x[i] * y_r[i] / (y[i] * y[i]);
    }
    Rc::new(DivR { a, b, out, out_r })
}

impl RNode for DivR {
    fn output(&self) -> &[f64] {
        &self.out
    }

    fn r_output(&self) -> &[f64] {
        &self.out_r
    }

    fn constant(&self, rg: &RGradient, g: &Gradient) -> bool {
        self.a.constant(rg, g) && self.b.constant(rg, g)
    }

    fn propagate_r_gradient(&self, upstream: &[f64], upstream_r: &[f64],
                            rg: &mut RGradient, g: &mut Gradient) {
        let (x, y) = (self.a.output(), self.b.output());
        let (x_r, y_r) = (self.a.r_output(), self.b.r_output());
        let n = x.len();
        if !self.a.constant(rg, g) {
            let mut d_a = vec![0.0; n];
            let mut d_a_r = vec![0.0; n];
            for i in 0..n {
                d_a[i] = upstream[i] / y[i];
                d_a_r[i] = upstream_r[i] / y[i] - upstream[i] * y_r[i] / (y[i] * y[i]);
            }
            self.a.propagate_r_gradient(&d_a, &d_a_r, rg, g);
        }
        if !self.b.constant(rg, g) {
            let mut d_b = vec![0.0; n];
            let mut d_b_r = vec![0.0; n];
            for i in 0..n {
                let y2 = y[i] * y[i];
                // d_b = -u a / b^2
                d_b[i] = -upstream[i] * x[i] / y2;
                d_b_r[i] = -(upstream_r[i] * x[i] + upstream[i] * x_r[i]) / y2
                    + 2.0 * upstream[i] * x[i] * y_r[i] / (y2 * y[i]);
            }
            self.b.propagate_r_gradient(&d_b, &d_b_r, rg, g);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

/// Flat-slice math shared by the graph nodes.
///
/// All operations are free functions on flat f64 slices with explicit dimensions.
/// Row-major layout throughout: a `[rows, cols]` matrix stores row `i` at
/// `i * cols .. (i + 1) * cols`.

/// Affine map over a batch: out[b, i] = sum_j W[i, j] * x[b, j] + bias[i].
/// `out` must be pre-allocated with n*rows elements (will be overwritten).
pub fn affine_f64(w: &[f64], bias: &[f64], x: &[f64], out: &mut [f64],
                  rows: usize, cols: usize, n: usize) {
    debug_assert_eq!(w.len(), rows * cols);
    debug_assert_eq!(bias.len(), rows);
    debug_assert_eq!(x.len(), n * cols);
    debug_assert_eq!(out.len(), n * rows);

    for b in 0..n {
        let xb = &x[b * cols..(b + 1) * cols];
        for i in 0..rows {
            out[b * rows + i] = dot_f64(&w[i * cols..(i + 1) * cols], xb) + bias[i];
        }
    }
}

/// Dot product: sum_i a[i] * b[i].
pub fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f64;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)). No epsilon floor.
pub fn vec_norm_f64(a: &[f64]) -> f64 {
    a.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Accumulate: acc[i] += a[i].
pub fn add_assign_f64(acc: &mut [f64], a: &[f64]) {
    debug_assert_eq!(acc.len(), a.len());
    for (e, g) in acc.iter_mut().zip(a.iter()) {
        *e += g;
    }
}

/// Largest absolute element-wise difference. NaN in either input propagates.
pub fn max_abs_diff_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut max = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = (x - y).abs();
        if d.is_nan() {
            return f64::NAN;
        }
        max = max.max(d);
    }
    max
}

/// Simple xorshift64 PRNG for deterministic weight init. Not crypto-safe.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [0, 1).
    pub fn unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        (2.0 * self.unit() - 1.0) * scale
    }

    /// Standard normal sample (Box-Muller).
    pub fn normal(&mut self) -> f64 {
        let u1 = self.unit().max(f64::MIN_POSITIVE);
        let u2 = self.unit();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Fill slice with uniform random values in [-scale, scale].
    pub fn fill_uniform(&mut self, buf: &mut [f64], scale: f64) {
        for v in buf.iter_mut() {
            *v = self.uniform(scale);
        }
    }

    /// Vector of `n` standard normal samples.
    pub fn normal_vec(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.normal()).collect()
    }
}

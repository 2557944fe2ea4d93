//! Random-variate generation for simulation scenarios.
//!
//! Everything here is driven by a seeded deterministic PRNG so that a
//! run with the same seed produces identical delay sequences on every
//! platform. Samplers are plain functions; the iterator types plug
//! straight into [`Simulation::generate`](crate::Simulation::generate)
//! as inter-arrival sequences (use `Iterator::take` to bound them).

// ── Deterministic RNG ─────────────────────────────────────────────────

/// SplitMix64 — a fast, high-quality deterministic PRNG.
///
/// Zero external dependencies. Produces identical sequences for a given
/// seed across all platforms.
#[derive(Debug, Clone)]
pub struct DeterministicRng {
    state: u64,
}

impl DeterministicRng {
    /// Create a new RNG from a seed.
    pub fn new(seed: u64) -> Self {
        DeterministicRng { state: seed }
    }

    /// Generate the next u64.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    /// Generate a uniform f64 in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate a uniform u64 in [min, max). Returns `min` if min >= max.
    pub fn next_range(&mut self, min: u64, max: u64) -> u64 {
        if min >= max {
            return min;
        }
        min + (self.next_u64() % (max - min))
    }
}

// ── One-shot samplers ─────────────────────────────────────────────────

/// Sample an exponential variate with rate `lambda` (mean `1/lambda`).
pub fn expovariate(rng: &mut DeterministicRng, lambda: f64) -> f64 {
    -(1.0 - rng.next_f64()).ln() / lambda
}

/// Sample a uniform variate in `[a, b)`.
pub fn uniform(rng: &mut DeterministicRng, a: f64, b: f64) -> f64 {
    a + (b - a) * rng.next_f64()
}

/// Sample an integer uniformly from `[from, until]` (inclusive).
pub fn uniform_int(rng: &mut DeterministicRng, from: i64, until: i64) -> i64 {
    from + (((1 + until - from) as f64 * rng.next_f64()).floor() as i64)
}

/// Sample an integer uniformly from `[mean - plus_or_minus,
/// mean + plus_or_minus]`.
pub fn random_int(rng: &mut DeterministicRng, mean: i64, plus_or_minus: i64) -> i64 {
    let r = ((2 * plus_or_minus + 1) as f64 * rng.next_f64()).floor() as i64;
    mean - plus_or_minus + r
}

// ── Infinite delay sequences ──────────────────────────────────────────

/// An endless stream of exponential inter-arrival delays.
#[derive(Debug, Clone)]
pub struct ExpoDelays {
    lambda: f64,
    rng: DeterministicRng,
}

impl ExpoDelays {
    /// Delays with rate `lambda`, driven by `rng`.
    pub fn new(lambda: f64, rng: DeterministicRng) -> Self {
        ExpoDelays { lambda, rng }
    }
}

impl Iterator for ExpoDelays {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        Some(expovariate(&mut self.rng, self.lambda))
    }
}

/// An endless stream of uniform delays in `[a, b)`.
#[derive(Debug, Clone)]
pub struct UniformDelays {
    a: f64,
    b: f64,
    rng: DeterministicRng,
}

impl UniformDelays {
    /// Delays uniform in `[a, b)`, driven by `rng`.
    pub fn new(a: f64, b: f64, rng: DeterministicRng) -> Self {
        UniformDelays { a, b, rng }
    }
}

impl Iterator for UniformDelays {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        Some(uniform(&mut self.rng, self.a, self.b))
    }
}

// ── Sequence combinators ──────────────────────────────────────────────

/// Prepend a lead-in delay to a sequence: the first arrival waits
/// `first`, the rest follow `rest`.
pub fn delayed(first: f64, rest: impl Iterator<Item = f64>) -> impl Iterator<Item = f64> {
    std::iter::once(first).chain(rest)
}

/// Cut a delay sequence off once the cumulative time (starting from
/// `starting_at`) would pass `only_until`. The delay that crosses the
/// bound is not yielded.
pub fn stop_at(
    starting_at: f64,
    only_until: f64,
    delays: impl Iterator<Item = f64>,
) -> impl Iterator<Item = f64> {
    delays
        .scan(starting_at, |elapsed, d| {
            *elapsed += d;
            Some((*elapsed, d))
        })
        .take_while(move |&(at, _)| at <= only_until)
        .map(|(_, d)| d)
}

// ── Discrete distribution ─────────────────────────────────────────────

/// A weighted discrete distribution over arbitrary values.
///
/// Weights need not sum to one; they are normalized at construction.
#[derive(Debug, Clone)]
pub struct Discrete<T> {
    /// `(normalized_weight, value)` in the caller's order.
    points: Vec<(f64, T)>,
}

impl<T> Discrete<T> {
    /// Build a distribution from `(weight, value)` pairs.
    pub fn new(points: Vec<(f64, T)>) -> Self {
        assert!(!points.is_empty(), "a discrete distribution needs at least one point");
        let total: f64 = points.iter().map(|(w, _)| w).sum();
        assert!(total > 0.0, "discrete distribution weights must sum to a positive value");
        let points = points.into_iter().map(|(w, v)| (w / total, v)).collect();
        Discrete { points }
    }

    /// Pick the value for an explicit uniform sample `u` in [0, 1).
    pub fn pick(&self, u: f64) -> &T {
        let mut accum = 0.0;
        let mut i = 0;
        while u >= accum && i < self.points.len() {
            accum += self.points[i].0;
            i += 1;
        }
        &self.points[i - 1].1
    }

    /// Pick a value using `rng`.
    pub fn sample(&self, rng: &mut DeterministicRng) -> &T {
        self.pick(rng.next_f64())
    }
}

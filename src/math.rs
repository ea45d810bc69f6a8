//! Per-flow pseudo-random distributions used for traffic generation.
//!
//! The original daemon (`fg_math.c`) draws from libgsl when available and
//! falls back to a hand-rolled approximation otherwise. We have no GSL
//! binding here, so every distribution is sampled with a standard
//! inverse-transform (or Box-Muller, for the normal family) construction
//! from a single per-flow uniform source. Parameter conventions match GSL's,
//! since that was the original's primary code path.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::Cell;

/// Stochastic distribution family for a traffic generator (§4.2/§4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Constant,
    Uniform,
    Exponential,
    Normal,
    Lognormal,
    Pareto,
    Weibull,
}

/// Owns the per-flow PRNG state. No process-wide hidden state: every flow
/// carries its own generator, seeded from its settings or from system
/// entropy if the seed is zero.
pub struct FlowRng {
    rng: StdRng,
    // Box-Muller produces values in pairs; stash the second one.
    spare_normal: Cell<Option<f64>>,
}

impl FlowRng {
    pub fn new(seed: u64) -> FlowRng {
        let rng = if seed == 0 {
            log::warn!("no random seed supplied, seeding from system entropy");
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        };
        FlowRng { rng, spare_normal: Cell::new(None) }
    }

    fn uniform01(&mut self) -> f64 {
        self.rng.gen_range(0.0..1.0)
    }

    pub fn bernoulli(&mut self, p: f64) -> bool {
        self.uniform01() <= p
    }

    pub fn uniform(&mut self, minval: f64, maxval: f64) -> f64 {
        minval + (maxval - minval) * self.uniform01()
    }

    pub fn exponential(&mut self, mean: f64) -> f64 {
        -mean * (1.0 - self.uniform01()).ln()
    }

    /// Box-Muller transform; caches the second sample of each pair.
    fn standard_normal(&mut self) -> f64 {
        if let Some(v) = self.spare_normal.take() {
            return v;
        }
        let u1: f64 = self.uniform01().max(f64::MIN_POSITIVE);
        let u2: f64 = self.uniform01();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        self.spare_normal.set(Some(r * theta.sin()));
        r * theta.cos()
    }

    pub fn normal(&mut self, mu: f64, sigma_square: f64) -> f64 {
        mu + sigma_square.sqrt() * self.standard_normal()
    }

    pub fn lognormal(&mut self, zeta: f64, sigma: f64) -> f64 {
        (zeta + sigma * self.standard_normal()).exp()
    }

    pub fn pareto(&mut self, k: f64, x_min: f64) -> f64 {
        x_min / self.uniform01().max(f64::MIN_POSITIVE).powf(1.0 / k)
    }

    pub fn weibull(&mut self, alpha: f64, beta: f64) -> f64 {
        alpha * (-self.uniform01().max(f64::MIN_POSITIVE).ln()).powf(1.0 / beta)
    }

    pub fn chisq(&mut self, nu: f64) -> f64 {
        let n = nu.round().max(1.0) as u32;
        (0..n).map(|_| self.standard_normal().powi(2)).sum()
    }

    /// Dispatches to the distribution named by `dist` with its two
    /// parameters, as `trafgen.c`'s `calculate()` does.
    pub fn sample(&mut self, dist: Distribution, param_one: f64, param_two: f64) -> f64 {
        match dist {
            Distribution::Constant => param_one,
            Distribution::Uniform => self.uniform(param_one, param_two),
            Distribution::Exponential => self.exponential(param_one),
            Distribution::Normal => self.normal(param_one, param_two),
            Distribution::Lognormal => self.lognormal(param_one, param_two),
            Distribution::Pareto => self.pareto(param_one, param_two),
            Distribution::Weibull => self.weibull(param_one, param_two),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_is_param_one() {
        let mut r = FlowRng::new(1);
        assert_eq!(r.sample(Distribution::Constant, 42.0, 0.0), 42.0);
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut r = FlowRng::new(7);
        for _ in 0..1000 {
            let v = r.uniform(10.0, 20.0);
            assert!((10.0..20.0).contains(&v));
        }
    }

    #[test]
    fn exponential_and_weibull_and_pareto_are_nonnegative() {
        let mut r = FlowRng::new(99);
        for _ in 0..1000 {
            assert!(r.exponential(5.0) >= 0.0);
            assert!(r.weibull(2.0, 1.5) >= 0.0);
            assert!(r.pareto(2.0, 3.0) >= 3.0);
        }
    }

    #[test]
    fn same_seed_reproduces_sequence() {
        let mut a = FlowRng::new(123);
        let mut b = FlowRng::new(123);
        for _ in 0..20 {
            assert_eq!(a.normal(0.0, 1.0), b.normal(0.0, 1.0));
        }
    }

    #[test]
    fn zero_seed_draws_from_entropy_without_panicking() {
        let mut r = FlowRng::new(0);
        let _ = r.uniform(0.0, 1.0);
    }
}

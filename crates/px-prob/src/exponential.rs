//! Exponential distribution.

use px_core::{Error, Result, Seed, Tensor};
use rand_distr::Distribution as _;

use crate::distribution::{Distribution, elementwise, flat_params, sample_elementwise};
use crate::params::{ParamValue, Parameters};

/// Log-PDF of an Exponential distribution at `x` with rate `rate`.
///
/// Support: `x >= 0`.
pub fn logpdf(x: f64, rate: f64) -> Result<f64> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::Validation(format!("rate must be finite and > 0, got {}", rate)));
    }
    if x < 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    Ok(rate.ln() - rate * x)
}

/// Batch of Exponential distributions.
#[derive(Debug, Clone)]
pub struct Exponential {
    rate: Tensor,
    name: Option<String>,
    legacy_seeds_only: bool,
}

impl Exponential {
    /// Create an Exponential with (tensor) `rate`.
    pub fn new(rate: impl Into<Tensor>) -> Result<Self> {
        let rate = rate.into();
        if rate.array().iter().any(|&r| !r.is_finite() || r <= 0.0) {
            return Err(Error::Validation("rate must be finite and > 0".into()));
        }
        Ok(Self { rate, name: None, legacy_seeds_only: false })
    }

    /// Attach an explicit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Only accept integer seeds when sampling (for pre-stateless samplers).
    pub fn with_legacy_seeds_only(mut self) -> Self {
        self.legacy_seeds_only = true;
        self
    }

    /// Rate parameter.
    pub fn rate(&self) -> &Tensor {
        &self.rate
    }
}

impl Distribution for Exponential {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("Exponential")
    }

    fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.rate.shape().to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        Vec::new()
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([("rate".to_string(), ParamValue::Tensor(self.rate.clone()))])
    }

    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor> {
        if self.legacy_seeds_only && !seed.is_stateful() {
            return Err(Error::Type(format!("{} only accepts integer seeds", self.name())));
        }
        let batch_shape = self.batch_shape();
        let p = flat_params(&[&self.rate], &batch_shape)?;
        sample_elementwise(sample_shape, &batch_shape, seed, |rng, i| {
            let d = rand_distr::Exp::new(p[0][i]).map_err(|e| Error::Validation(e.to_string()))?;
            Ok(d.sample(rng))
        })
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.rate], |r| logpdf(r[0], r[1]))
    }

    fn cdf(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.rate], |r| Ok(if r[0] < 0.0 { 0.0 } else { -(-r[1] * r[0]).exp_m1() }))
    }

    fn accepts_stateless_seed(&self) -> bool {
        !self.legacy_seeds_only
    }
}

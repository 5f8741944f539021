//! Gamma distribution.

use px_core::{Error, Result, Seed, Tensor};
use rand_distr::Distribution as _;
use statrs::function::gamma::{gamma_lr, ln_gamma};

use crate::distribution::{Distribution, elementwise, flat_params, parameter_batch_shape, sample_elementwise};
use crate::params::{ParamValue, Parameters};

/// Log-PDF of a Gamma distribution with `shape` and `rate` at `x`.
///
/// Parameterization:
/// - `shape > 0`
/// - `rate > 0` (inverse scale)
///
/// Support: `x >= 0`.
pub fn logpdf_shape_rate(x: f64, shape: f64, rate: f64) -> Result<f64> {
    if !shape.is_finite() || shape <= 0.0 {
        return Err(Error::Validation(format!("shape must be finite and > 0, got {}", shape)));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::Validation(format!("rate must be finite and > 0, got {}", rate)));
    }
    if x < 0.0 {
        return Ok(f64::NEG_INFINITY);
    }
    if x == 0.0 {
        if shape < 1.0 {
            return Ok(f64::INFINITY);
        }
        if shape > 1.0 {
            return Ok(f64::NEG_INFINITY);
        }
        // shape == 1 => exponential
        return Ok(rate.ln());
    }

    let ln_norm = shape * rate.ln() - ln_gamma(shape);
    Ok(ln_norm + (shape - 1.0) * x.ln() - rate * x)
}

/// Batch of Gamma distributions parameterized by `concentration` and `rate`.
#[derive(Debug, Clone)]
pub struct Gamma {
    concentration: Tensor,
    rate: Tensor,
    batch_shape: Vec<usize>,
    name: Option<String>,
}

impl Gamma {
    /// Create a Gamma; parameters broadcast to the batch shape.
    pub fn new(concentration: impl Into<Tensor>, rate: impl Into<Tensor>) -> Result<Self> {
        let concentration = concentration.into();
        let rate = rate.into();
        for (name, t) in [("concentration", &concentration), ("rate", &rate)] {
            if t.array().iter().any(|&v| !v.is_finite() || v <= 0.0) {
                return Err(Error::Validation(format!("{} must be finite and > 0", name)));
            }
        }
        let batch_shape = parameter_batch_shape(&[&concentration, &rate])?;
        Ok(Self { concentration, rate, batch_shape, name: None })
    }

    /// Attach an explicit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Distribution for Gamma {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("Gamma")
    }

    fn explicit_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.batch_shape.clone()
    }

    fn event_shape(&self) -> Vec<usize> {
        Vec::new()
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("concentration".to_string(), ParamValue::Tensor(self.concentration.clone())),
            ("rate".to_string(), ParamValue::Tensor(self.rate.clone())),
        ])
    }

    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor> {
        let p = flat_params(&[&self.concentration, &self.rate], &self.batch_shape)?;
        sample_elementwise(sample_shape, &self.batch_shape, seed, |rng, i| {
            let d = rand_distr::Gamma::new(p[0][i], 1.0 / p[1][i]).map_err(|e| Error::Validation(e.to_string()))?;
            Ok(d.sample(rng))
        })
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.concentration, &self.rate], |r| logpdf_shape_rate(r[0], r[1], r[2]))
    }

    fn cdf(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.concentration, &self.rate], |r| {
            Ok(if r[0] <= 0.0 { 0.0 } else { gamma_lr(r[1], r[2] * r[0]) })
        })
    }
}

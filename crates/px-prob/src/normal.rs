//! Normal distribution.

use px_core::{Error, Result, Seed, Tensor};
use rand_distr::Distribution as _;
use statrs::function::erf::erfc;

use crate::distribution::{Distribution, elementwise, flat_params, parameter_batch_shape, sample_elementwise};
use crate::params::{ParamValue, Parameters};

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Log-PDF of a Normal distribution `N(mu, sigma)` at `x`.
///
/// `log p(x) = -0.5 * ((x-mu)/sigma)^2 - ln(sigma) - ln(sqrt(2π))`
pub fn logpdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    let z = (x - mu) / sigma;
    Ok(-0.5 * z * z - sigma.ln() - LN_SQRT_2PI)
}

/// CDF of `N(mu, sigma)` at `x`.
pub fn cdf(x: f64, mu: f64, sigma: f64) -> Result<f64> {
    if !sigma.is_finite() || sigma <= 0.0 {
        return Err(Error::Validation(format!("sigma must be finite and > 0, got {}", sigma)));
    }
    Ok(0.5 * erfc(-(x - mu) / (sigma * std::f64::consts::SQRT_2)))
}

/// Batch of Normal distributions with tensor `loc` and `scale`.
#[derive(Debug, Clone)]
pub struct Normal {
    loc: Tensor,
    scale: Tensor,
    batch_shape: Vec<usize>,
    name: Option<String>,
}

impl Normal {
    /// Create a Normal; `loc` and `scale` broadcast to the batch shape.
    pub fn new(loc: impl Into<Tensor>, scale: impl Into<Tensor>) -> Result<Self> {
        let loc = loc.into();
        let scale = scale.into();
        if scale.array().iter().any(|&s| !s.is_finite() || s <= 0.0) {
            return Err(Error::Validation("scale must be finite and > 0".into()));
        }
        let batch_shape = parameter_batch_shape(&[&loc, &scale])?;
        Ok(Self { loc, scale, batch_shape, name: None })
    }

    /// Attach an explicit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Location parameter.
    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    /// Scale parameter.
    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

impl Distribution for Normal {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("Normal")
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
            ("loc".to_string(), ParamValue::Tensor(self.loc.clone())),
            ("scale".to_string(), ParamValue::Tensor(self.scale.clone())),
        ])
    }

    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor> {
        let p = flat_params(&[&self.loc, &self.scale], &self.batch_shape)?;
        sample_elementwise(sample_shape, &self.batch_shape, seed, |rng, i| {
            let d = rand_distr::Normal::new(p[0][i], p[1][i]).map_err(|e| Error::Validation(e.to_string()))?;
            Ok(d.sample(rng))
        })
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.loc, &self.scale], |r| logpdf(r[0], r[1], r[2]))
    }

    fn cdf(&self, x: &Tensor) -> Result<Tensor> {
        elementwise(&[x, &self.loc, &self.scale], |r| cdf(r[0], r[1], r[2]))
    }
}

//! Momentum distributions for preconditioned HMC.
//!
//! The momentum for state part `i` is a zero-mean normal with per-element
//! scale `1 / sqrt(variance_i)`: the diagonal mass matrix is the inverse of
//! the estimated state variance. Each part's distribution is tiled to the
//! state's batch (chain) shape, and its event covers the remaining dims.

use std::sync::Arc;

use px_core::{Error, Result, Seed, Tensor, sanitize_seed};
use px_prob::Distribution;
use px_prob::independent::Independent;
use px_prob::normal::Normal;

/// Smallest variance used to build a momentum scale.
pub const MIN_VARIANCE: f64 = 1e-10;

/// Independent zero-mean normal momenta, one per state part.
#[derive(Debug, Clone)]
pub struct MomentumDistribution {
    parts: Vec<Arc<Independent>>,
    variances: Vec<Tensor>,
}

impl MomentumDistribution {
    /// Build from the current state and per-part variance estimates.
    ///
    /// `batch_ndims` leading dims of every state part are batch (chain) dims.
    /// Each variance must broadcast against its part's event shape.
    pub fn new(state_parts: &[Tensor], batch_ndims: usize, variance_parts: &[Tensor]) -> Result<Self> {
        if state_parts.len() != variance_parts.len() {
            return Err(Error::Value(format!(
                "got {} state parts but {} variance parts",
                state_parts.len(),
                variance_parts.len()
            )));
        }
        let mut parts = Vec::with_capacity(state_parts.len());
        let mut variances = Vec::with_capacity(state_parts.len());
        for (i, (state, variance)) in state_parts.iter().zip(variance_parts).enumerate() {
            let shape = state.shape();
            if shape.len() < batch_ndims {
                return Err(Error::Validation(format!(
                    "state part {} has rank {}, below the batch rank {}",
                    i,
                    shape.len(),
                    batch_ndims
                )));
            }
            let variance = variance.map(|v| v.max(MIN_VARIANCE)).broadcast_to(shape)?;
            let scale = variance.map(|v| 1.0 / v.sqrt());
            let normal = Normal::new(Tensor::zeros(shape), scale)?;
            parts.push(Arc::new(Independent::new(Arc::new(normal), shape.len() - batch_ndims)?));
            variances.push(variance);
        }
        Ok(Self { parts, variances })
    }

    /// Number of state parts.
    pub fn num_parts(&self) -> usize {
        self.parts.len()
    }

    /// Batch shape shared by all parts.
    pub fn batch_shape(&self) -> Vec<usize> {
        self.parts.first().map(|p| p.batch_shape()).unwrap_or_default()
    }

    /// Per-part momentum variances, broadcast to the state shape.
    ///
    /// This is the inverse mass matrix diagonal.
    pub fn variances(&self) -> &[Tensor] {
        &self.variances
    }

    /// Draw one momentum per part.
    pub fn sample(&self, seed: &Seed) -> Result<Vec<Tensor>> {
        let keys = sanitize_seed(Some(seed), "momentum").split(self.parts.len());
        self.parts
            .iter()
            .zip(keys)
            .map(|(p, k)| p.sample(&[], &Seed::Stateless(k)))
            .collect()
    }

    /// Joint log density of `momentum`, one value per batch member.
    pub fn log_prob(&self, momentum: &[Tensor]) -> Result<Tensor> {
        if momentum.len() != self.parts.len() {
            return Err(Error::Value(format!("expected {} momentum parts, got {}", self.parts.len(), momentum.len())));
        }
        self.parts.iter().zip(momentum).try_fold(Tensor::scalar(0.0), |acc, (d, p)| acc.add(&d.log_prob(p)?))
    }

    /// Kinetic-energy gradient `dK/dp` per part, i.e. the velocity `M^{-1} p`.
    pub fn velocity(&self, momentum: &[Tensor]) -> Result<Vec<Tensor>> {
        momentum.iter().zip(&self.variances).map(|(p, v)| p.mul(v)).collect()
    }
}

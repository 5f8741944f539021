//! Diagonal mass-matrix adaptation.
//!
//! [`DiagonalMassMatrixAdaptation`] wraps an HMC-like kernel and keeps one
//! [`RunningVariance`] per state part. Before every inner step it rebuilds the
//! momentum distribution from the current variance estimates (the mass matrix
//! is the inverse of the estimated variance) and injects it into the inner
//! results through a caller-supplied setter. After the step, the new state is
//! folded into the accumulators.
//!
//! The wrapper is an adaptation stage, not a sampler: `is_calibrated` is
//! always `false`.

use std::fmt;
use std::sync::Arc;

use ndarray::Axis;
use px_core::traits::TransitionKernel;
use px_core::{Error, Result, Seed, Tensor};

use crate::preconditioning::MomentumDistribution;

/// Online mean and variance over batches of arrays.
///
/// Accumulators are values: [`RunningVariance::update`] returns a new
/// accumulator and leaves `self` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningVariance {
    num_samples: f64,
    mean: Tensor,
    sum_squared_residuals: Tensor,
}

impl RunningVariance {
    /// Empty accumulator for samples of `shape`.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self { num_samples: 0.0, mean: Tensor::zeros(shape), sum_squared_residuals: Tensor::zeros(shape) }
    }

    /// Accumulator that has already seen `num_samples` draws with the given
    /// `mean` and (population) `variance`.
    pub fn from_stats(num_samples: f64, mean: Tensor, variance: Tensor) -> Result<Self> {
        if !(num_samples.is_finite() && num_samples >= 0.0) {
            return Err(Error::Value(format!("num_samples must be finite and >= 0, got {}", num_samples)));
        }
        let variance = variance.broadcast_to(mean.shape())?;
        let sum_squared_residuals = variance.map(|v| v * num_samples);
        Ok(Self { num_samples, mean, sum_squared_residuals })
    }

    /// Fold in a batch of samples stacked along `axis` (or a single sample
    /// shaped like the mean when `axis` is `None`).
    pub fn update(&self, batch: &Tensor, axis: Option<usize>) -> Result<Self> {
        let data = match axis {
            Some(axis) => {
                if axis >= batch.rank() {
                    return Err(Error::Validation(format!("axis {} out of range for rank {}", axis, batch.rank())));
                }
                batch.array().clone()
            }
            None => batch.array().clone().insert_axis(Axis(0)),
        };
        let axis = Axis(axis.unwrap_or(0));
        let m = data.len_of(axis);
        if m == 0 {
            return Ok(self.clone());
        }
        let chunk_mean = data
            .mean_axis(axis)
            .ok_or_else(|| Error::Computation("mean of an empty batch".into()))?;
        let centered = &data - &chunk_mean.clone().insert_axis(axis);
        let chunk_ssr = centered.mapv(|v| v * v).sum_axis(axis);

        let chunk_mean = Tensor::from_array(chunk_mean);
        let chunk_ssr = Tensor::from_array(chunk_ssr);
        if chunk_mean.shape() != self.mean.shape() {
            return Err(Error::Validation(format!(
                "batch samples have shape {:?}, accumulator expects {:?}",
                chunk_mean.shape(),
                self.mean.shape()
            )));
        }

        // Chan et al. pairwise merge.
        let n = self.num_samples;
        let m = m as f64;
        let total = n + m;
        let delta = chunk_mean.sub(&self.mean)?;
        let mean = self.mean.add(&delta.map(|d| d * m / total))?;
        let sum_squared_residuals =
            self.sum_squared_residuals.add(&chunk_ssr)?.add(&delta.map(|d| d * d * n * m / total))?;
        Ok(Self { num_samples: total, mean, sum_squared_residuals })
    }

    /// Population variance (`ddof = 0`).
    pub fn variance(&self) -> Result<Tensor> {
        self.variance_with_ddof(0.0)
    }

    /// Variance with `ddof` delta degrees of freedom.
    ///
    /// Fails unless more than `ddof` samples have been folded in.
    pub fn variance_with_ddof(&self, ddof: f64) -> Result<Tensor> {
        let denom = self.num_samples - ddof;
        if !(denom > 0.0) {
            return Err(Error::Value(format!(
                "variance needs more than {} samples, accumulator has {}",
                ddof, self.num_samples
            )));
        }
        Ok(self.sum_squared_residuals.map(|s| s / denom))
    }

    /// Running mean.
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Number of samples folded in so far.
    pub fn num_samples(&self) -> f64 {
        self.num_samples
    }
}

/// Inner-kernel results that carry an HMC-style momentum distribution.
pub trait PreconditionedResults: Clone + Send {
    /// Target log density at the current state; its rank is the batch rank.
    fn target_log_prob(&self) -> &Tensor;

    /// Replace the momentum distribution used for the next step.
    fn with_accepted_momentum_distribution(self, momentum_distribution: MomentumDistribution) -> Self;

    /// Replace the momentum distribution recorded with the last proposal.
    ///
    /// Results without proposal bookkeeping keep the default.
    fn with_proposed_momentum_distribution(self, _momentum_distribution: MomentumDistribution) -> Self {
        self
    }
}

/// Injects a new momentum distribution into inner results.
pub type MomentumDistributionSetter<R> = Arc<dyn Fn(R, MomentumDistribution) -> R + Send + Sync>;

/// Default setter: replaces the momentum distribution of the accepted results.
pub fn hmc_like_momentum_distribution_setter<R: PreconditionedResults>(
    kernel_results: R,
    momentum_distribution: MomentumDistribution,
) -> R {
    kernel_results.with_accepted_momentum_distribution(momentum_distribution)
}

/// Results of [`DiagonalMassMatrixAdaptation`].
#[derive(Debug, Clone)]
pub struct DiagonalMassMatrixAdaptationResults<R> {
    /// Results of the inner kernel.
    pub inner_results: R,
    /// One accumulator per state part.
    pub running_variance: Vec<RunningVariance>,
}

/// Adapts the inner kernel's momentum distribution to the running variance
/// of the state.
pub struct DiagonalMassMatrixAdaptation<K: TransitionKernel> {
    inner_kernel: K,
    initial_running_variance: Vec<RunningVariance>,
    momentum_distribution_setter: MomentumDistributionSetter<K::Results>,
    name: String,
}

impl<K: TransitionKernel + fmt::Debug> fmt::Debug for DiagonalMassMatrixAdaptation<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagonalMassMatrixAdaptation")
            .field("name", &self.name)
            .field("inner_kernel", &self.inner_kernel)
            .field("initial_running_variance", &self.initial_running_variance)
            .finish()
    }
}

impl<K> DiagonalMassMatrixAdaptation<K>
where
    K: TransitionKernel,
    K::Results: PreconditionedResults + 'static,
{
    /// Wrap `inner_kernel`, starting from `initial_running_variance` (one
    /// accumulator per state part).
    pub fn new(inner_kernel: K, initial_running_variance: Vec<RunningVariance>) -> Self {
        Self {
            inner_kernel,
            initial_running_variance,
            momentum_distribution_setter: Arc::new(hmc_like_momentum_distribution_setter::<K::Results>),
            name: "diagonal_mass_matrix_adaptation".to_string(),
        }
    }
}

impl<K: TransitionKernel> DiagonalMassMatrixAdaptation<K> {
    /// Use a custom setter for the inner results.
    pub fn with_momentum_distribution_setter(mut self, setter: MomentumDistributionSetter<K::Results>) -> Self {
        self.momentum_distribution_setter = setter;
        self
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The wrapped kernel.
    pub fn inner_kernel(&self) -> &K {
        &self.inner_kernel
    }

    /// Accumulators used by `bootstrap_results`.
    pub fn initial_running_variance(&self) -> &[RunningVariance] {
        &self.initial_running_variance
    }
}

impl<K> TransitionKernel for DiagonalMassMatrixAdaptation<K>
where
    K: TransitionKernel,
    K::Results: PreconditionedResults,
{
    type Results = DiagonalMassMatrixAdaptationResults<K::Results>;

    fn one_step(
        &self,
        current_state: &[Tensor],
        previous_kernel_results: &Self::Results,
        seed: Option<&Seed>,
    ) -> Result<(Vec<Tensor>, Self::Results)> {
        let variance_parts = &previous_kernel_results.running_variance;
        let diags = variance_parts.iter().map(RunningVariance::variance).collect::<Result<Vec<_>>>()?;
        let batch_ndims = previous_kernel_results.inner_results.target_log_prob().rank();
        let momentum_distribution = MomentumDistribution::new(current_state, batch_ndims, &diags)?;
        let inner_results =
            (self.momentum_distribution_setter)(previous_kernel_results.inner_results.clone(), momentum_distribution);

        let (new_state, new_inner_results) = self.inner_kernel.one_step(current_state, &inner_results, seed)?;
        if new_state.len() != variance_parts.len() {
            return Err(Error::Value(format!(
                "{}: inner kernel returned {} state parts for {} accumulators",
                self.name,
                new_state.len(),
                variance_parts.len()
            )));
        }

        let mut new_variance_parts = Vec::with_capacity(variance_parts.len());
        for (variance_part, state_part) in variance_parts.iter().zip(&new_state) {
            let reshaped = fold_leading_dims(state_part, variance_part.mean().rank())?;
            new_variance_parts.push(variance_part.update(&reshaped, Some(0))?);
        }
        log::debug!(
            "{}: running variance now over {:?} samples",
            self.name,
            new_variance_parts.iter().map(RunningVariance::num_samples).collect::<Vec<_>>()
        );

        Ok((
            new_state,
            DiagonalMassMatrixAdaptationResults { inner_results: new_inner_results, running_variance: new_variance_parts },
        ))
    }

    fn bootstrap_results(&self, init_state: &[Tensor]) -> Result<Self::Results> {
        let variance_parts = self.initial_running_variance.clone();
        let diags = variance_parts.iter().map(RunningVariance::variance).collect::<Result<Vec<_>>>()?;

        let inner_results = self.inner_kernel.bootstrap_results(init_state)?;
        let batch_ndims = inner_results.target_log_prob().rank();
        let momentum_distribution = MomentumDistribution::new(init_state, batch_ndims, &diags)?;
        let inner_results = (self.momentum_distribution_setter)(inner_results, momentum_distribution.clone());
        let inner_results = inner_results.with_proposed_momentum_distribution(momentum_distribution);
        Ok(DiagonalMassMatrixAdaptationResults { inner_results, running_variance: variance_parts })
    }

    fn is_calibrated(&self) -> bool {
        false
    }
}

/// Collapse every dim left of the trailing `keep_rank` dims into one leading
/// sample axis.
fn fold_leading_dims(state: &Tensor, keep_rank: usize) -> Result<Tensor> {
    let shape = state.shape();
    if shape.len() < keep_rank {
        return Err(Error::Validation(format!(
            "state part of shape {:?} has lower rank than its variance ({})",
            shape, keep_rank
        )));
    }
    let num_reduce_dims = shape.len() - keep_rank;
    let mut new_shape = vec![shape[..num_reduce_dims].iter().product::<usize>()];
    new_shape.extend_from_slice(&shape[num_reduce_dims..]);
    state.reshape(&new_shape)
}

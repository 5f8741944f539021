//! The distribution capability consumed by transformed distributions and the
//! joint-model executor.

use std::fmt;

use px_core::tensor::broadcast_arrays;
use px_core::{DType, Error, Result, Seed, Tensor, broadcast_shapes};

use crate::params::Parameters;
use crate::transformed::TransformedDistribution;

/// A batch of probability distributions over tensors.
///
/// Samples have shape `sample_shape ++ batch_shape ++ event_shape`;
/// `log_prob` returns one value per batch member (and per sample).
pub trait Distribution: Send + Sync + fmt::Debug {
    /// Display name (defaults to the type name).
    fn name(&self) -> &str;

    /// Name given explicitly by the user, if any.
    fn explicit_name(&self) -> Option<&str> {
        None
    }

    /// Element dtype of samples.
    fn dtype(&self) -> DType {
        DType::F64
    }

    /// Shape of the batch of independent distributions.
    fn batch_shape(&self) -> Vec<usize>;

    /// Shape of a single event.
    fn event_shape(&self) -> Vec<usize>;

    /// Constructor parameters.
    fn parameters(&self) -> Parameters;

    /// Draw samples of shape `sample_shape ++ batch_shape ++ event_shape`.
    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor>;

    /// Log density at `x`.
    fn log_prob(&self, x: &Tensor) -> Result<Tensor>;

    /// Cumulative distribution function at `x`.
    fn cdf(&self, _x: &Tensor) -> Result<Tensor> {
        Err(Error::NotImplemented(format!("cdf is not implemented for {}", self.name())))
    }

    /// `false` for distributions that only accept legacy integer seeds.
    fn accepts_stateless_seed(&self) -> bool {
        true
    }

    /// Downcast to a transformed distribution.
    fn as_transformed(&self) -> Option<&TransformedDistribution> {
        None
    }
}

/// Broadcast batch shape of a set of parameter tensors.
pub(crate) fn parameter_batch_shape(params: &[&Tensor]) -> Result<Vec<usize>> {
    let mut shape = Vec::new();
    for p in params {
        shape = broadcast_shapes(&shape, p.shape())?;
    }
    Ok(shape)
}

/// Draw `prod(sample_shape)` rows of one value per batch member.
///
/// `draw(rng, i)` returns the sample for flattened batch index `i`.
pub(crate) fn sample_elementwise(
    sample_shape: &[usize],
    batch_shape: &[usize],
    seed: &Seed,
    mut draw: impl FnMut(&mut rand::rngs::StdRng, usize) -> Result<f64>,
) -> Result<Tensor> {
    let mut rng = seed.to_rng();
    let n_samples: usize = sample_shape.iter().product();
    let n_batch: usize = batch_shape.iter().product();
    let mut xs = Vec::with_capacity(n_samples * n_batch);
    for _ in 0..n_samples {
        for i in 0..n_batch {
            xs.push(draw(&mut rng, i)?);
        }
    }
    let shape: Vec<usize> = sample_shape.iter().chain(batch_shape).copied().collect();
    Tensor::from_shape_vec(&shape, xs)
}

/// Broadcast `params` to `batch_shape` and flatten.
pub(crate) fn flat_params(params: &[&Tensor], batch_shape: &[usize]) -> Result<Vec<Vec<f64>>> {
    params.iter().map(|p| Ok(p.broadcast_to(batch_shape)?.to_vec())).collect()
}

/// Apply `f` to each broadcast row of `args`.
pub(crate) fn elementwise(args: &[&Tensor], mut f: impl FnMut(&[f64]) -> Result<f64>) -> Result<Tensor> {
    let (shape, cols) = broadcast_arrays(args)?;
    let n: usize = shape.iter().product();
    let mut row = vec![0.0; cols.len()];
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        for (slot, col) in row.iter_mut().zip(&cols) {
            *slot = col[i];
        }
        out.push(f(&row)?);
    }
    Tensor::from_shape_vec(&shape, out)
}

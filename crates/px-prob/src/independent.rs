//! Reinterpret batch dimensions as event dimensions.

use std::sync::Arc;

use px_core::{DType, Error, Result, Seed, Tensor};

use crate::distribution::Distribution;
use crate::params::{ParamValue, Parameters};

/// Treats the rightmost `reinterpreted_batch_ndims` batch dims of a base
/// distribution as one joint event.
#[derive(Debug, Clone)]
pub struct Independent {
    distribution: Arc<dyn Distribution>,
    reinterpreted_batch_ndims: usize,
    name: String,
}

impl Independent {
    /// Wrap `distribution`.
    pub fn new(distribution: Arc<dyn Distribution>, reinterpreted_batch_ndims: usize) -> Result<Self> {
        let batch_rank = distribution.batch_shape().len();
        if reinterpreted_batch_ndims > batch_rank {
            return Err(Error::Value(format!(
                "reinterpreted_batch_ndims ({}) exceeds the batch rank ({}) of {}",
                reinterpreted_batch_ndims,
                batch_rank,
                distribution.name()
            )));
        }
        let name = format!("Independent{}", distribution.name());
        Ok(Self { distribution, reinterpreted_batch_ndims, name })
    }

    /// Base distribution.
    pub fn distribution(&self) -> &Arc<dyn Distribution> {
        &self.distribution
    }

    fn split(&self) -> usize {
        self.distribution.batch_shape().len() - self.reinterpreted_batch_ndims
    }
}

impl Distribution for Independent {
    fn name(&self) -> &str {
        &self.name
    }

    fn dtype(&self) -> DType {
        self.distribution.dtype()
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.distribution.batch_shape()[..self.split()].to_vec()
    }

    fn event_shape(&self) -> Vec<usize> {
        let mut shape = self.distribution.batch_shape()[self.split()..].to_vec();
        shape.extend(self.distribution.event_shape());
        shape
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("distribution".to_string(), ParamValue::Distribution(Arc::clone(&self.distribution))),
            ("reinterpreted_batch_ndims".to_string(), ParamValue::Int(self.reinterpreted_batch_ndims as i64)),
        ])
    }

    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor> {
        self.distribution.sample(sample_shape, seed)
    }

    fn log_prob(&self, x: &Tensor) -> Result<Tensor> {
        self.distribution.log_prob(x)?.sum_trailing(self.reinterpreted_batch_ndims)
    }

    fn accepts_stateless_seed(&self) -> bool {
        self.distribution.accepts_stateless_seed()
    }
}

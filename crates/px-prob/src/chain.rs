//! Composition of transforms.
//!
//! `Chain([f, g])` maps `x` to `f(g(x))`. Its minimal event ranks are derived
//! from the parts so that every part sees at least its own minimum, taking
//! into account rank changes between parts.

use std::sync::Arc;

use px_core::{DType, Error, Result, Tensor, Tree, Value};

use crate::bijector::{Bijector, BijectorConfig, BijectorImpl};
use crate::params::{Kwargs, ParamValue, Parameters};
use crate::shape::PartialShape;

/// Composite transform; applies its parts right to left.
#[derive(Debug, Clone)]
pub struct Chain {
    bijectors: Vec<Arc<Bijector>>,
    name: String,
}

fn leaf_min(b: &Bijector, min: &Tree<Option<usize>>) -> Result<i64> {
    match min {
        Tree::Leaf(Some(d)) => Ok(*d as i64),
        _ => Err(Error::NotImplemented(format!(
            "chain parts need a single static min_event_ndims; {} has {:?}",
            b.name(),
            min
        ))),
    }
}

/// Minimal event rank of the composition in one direction.
///
/// `parts` are given in application order; each is `(min_in, min_out)` for
/// that direction.
fn composed_min_event_ndims(parts: impl Iterator<Item = (i64, i64)>) -> i64 {
    let mut min_event_ndims = 0;
    let mut adjusted_max = 0;
    for (current_min, current_out_min) in parts {
        if adjusted_max < current_min {
            min_event_ndims += current_min - adjusted_max;
        }
        adjusted_max = adjusted_max.max(current_min);
        adjusted_max -= current_min - current_out_min;
    }
    min_event_ndims
}

impl Chain {
    /// Compose `bijectors` (applied last to first) into one transform.
    pub fn bijector(bijectors: Vec<Arc<Bijector>>, validate_args: bool, name: Option<String>) -> Result<Bijector> {
        let mut forward_parts = Vec::with_capacity(bijectors.len());
        for b in &bijectors {
            if !b.is_injective() {
                return Err(Error::NotImplemented(format!("chain part {} is not injective", b.name())));
            }
            forward_parts.push((leaf_min(b, b.forward_min_event_ndims())?, leaf_min(b, b.inverse_min_event_ndims())?));
        }
        let forward_min = composed_min_event_ndims(forward_parts.iter().rev().copied());
        let inverse_min = composed_min_event_ndims(forward_parts.iter().map(|&(f, i)| (i, f)));

        let name = name.unwrap_or_else(|| {
            let parts: Vec<&str> = bijectors.iter().map(|b| b.name()).collect();
            format!("chain_of_{}", parts.join("_of_"))
        });
        let is_constant_jacobian = bijectors.iter().all(|b| b.is_constant_jacobian());
        log::trace!("chain {} has min_event_ndims ({}, {})", name, forward_min, inverse_min);

        let config = BijectorConfig {
            validate_args,
            is_constant_jacobian,
            name: Some(name.clone()),
            ..BijectorConfig::with_min_event_ndims_pair(
                Tree::Leaf(Some(forward_min as usize)),
                Tree::Leaf(Some(inverse_min as usize)),
            )
        };
        Bijector::new(Chain { bijectors, name }, config)
    }

    /// Parts in composition order (the last one is applied first).
    pub fn bijectors(&self) -> &[Arc<Bijector>] {
        &self.bijectors
    }
}

impl BijectorImpl for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameters(&self) -> Option<Parameters> {
        let parts = self.bijectors.iter().map(|b| ParamValue::Bijector(Arc::clone(b))).collect();
        Some(Parameters::from([("bijectors".to_string(), ParamValue::List(parts))]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        self.bijectors.iter().rev().try_fold(x.clone(), |v, b| b.forward(&v))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        self.bijectors.iter().try_fold(y.clone(), |v, b| b.inverse_unique(&v))
    }

    fn forward_log_det_jacobian_reduced(
        &self,
        x: &Value,
        event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        let run = || -> Result<Tensor> {
            let mut ldj = Tensor::scalar(0.0);
            let mut x = x.clone();
            let mut event_ndims = event_ndims.clone();
            for b in self.bijectors.iter().rev() {
                ldj = ldj.add(&b.forward_log_det_jacobian(&x, Some(&event_ndims))?)?;
                x = b.forward(&x)?;
                event_ndims = b.forward_event_ndims(&event_ndims)?;
            }
            Ok(ldj)
        };
        Some(run())
    }

    fn inverse_log_det_jacobian_reduced(
        &self,
        y: &Value,
        event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        let run = || -> Result<Tensor> {
            let mut ldj = Tensor::scalar(0.0);
            let mut y = y.clone();
            let mut event_ndims = event_ndims.clone();
            for b in &self.bijectors {
                ldj = ldj.add(&b.inverse_log_det_jacobian(&y, Some(&event_ndims))?.unique()?)?;
                y = b.inverse_unique(&y)?;
                event_ndims = b.inverse_event_ndims(&event_ndims)?;
            }
            Ok(ldj)
        };
        Some(run())
    }

    fn forward_event_shape(&self, input: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        self.bijectors.iter().rev().try_fold(input.clone(), |s, b| b.forward_event_shape(&s))
    }

    fn forward_event_shape_tensor(&self, input: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        self.bijectors.iter().rev().try_fold(input.clone(), |s, b| b.forward_event_shape_tensor(&s))
    }

    fn inverse_event_shape(&self, output: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        self.bijectors.iter().try_fold(output.clone(), |s, b| b.inverse_event_shape(&s))
    }

    fn inverse_event_shape_tensor(&self, output: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        self.bijectors.iter().try_fold(output.clone(), |s, b| b.inverse_event_shape_tensor(&s))
    }

    fn forward_dtype(&self, input: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        self.bijectors.iter().rev().try_fold(input.clone(), |d, b| b.forward_dtype(Some(&d)))
    }

    fn inverse_dtype(&self, output: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        self.bijectors.iter().try_fold(output.clone(), |d, b| b.inverse_dtype(Some(&d)))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        // Increasing iff an even number of parts decrease.
        self.bijectors.iter().try_fold(Tensor::scalar(1.0).cast(DType::Bool), |acc, b| {
            let inc = b.is_increasing()?;
            Ok(acc.zip_with(&inc, |a, b| if (a > 0.5) == (b > 0.5) { 1.0 } else { 0.0 })?.cast(DType::Bool))
        })
    }

    fn as_chain(&self) -> Option<&Chain> {
        Some(self)
    }
}

//! Distributions pushed through a bijector.

use std::sync::Arc;

use px_core::tensor::broadcast_arrays;
use px_core::{DType, Error, Result, Seed, Tensor, Tree};

use crate::bijector::{Bijector, Preimage};
use crate::distribution::Distribution;
use crate::math::logsumexp;
use crate::params::{ParamValue, Parameters};

/// The distribution of `bijector.forward(X)` for `X ~ distribution`.
#[derive(Debug, Clone)]
pub struct TransformedDistribution {
    distribution: Arc<dyn Distribution>,
    bijector: Arc<Bijector>,
    name: String,
    explicit_name: Option<String>,
}

impl TransformedDistribution {
    /// Push `distribution` through `bijector`.
    pub fn new(distribution: Arc<dyn Distribution>, bijector: Arc<Bijector>) -> Result<Self> {
        let name = format!("{}_{}", bijector.name(), distribution.name());
        Ok(Self { distribution, bijector, name, explicit_name: None })
    }

    /// Attach an explicit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.name = name.clone();
        self.explicit_name = Some(name);
        self
    }

    /// Base distribution.
    pub fn distribution(&self) -> &Arc<dyn Distribution> {
        &self.distribution
    }

    /// The transform applied to base samples.
    pub fn bijector(&self) -> &Arc<Bijector> {
        &self.bijector
    }

    fn single(v: Tree<Tensor>) -> Result<Tensor> {
        v.into_leaf().ok_or_else(|| Error::Type("transformed distributions produce single tensors".into()))
    }
}

impl Distribution for TransformedDistribution {
    fn name(&self) -> &str {
        &self.name
    }

    fn explicit_name(&self) -> Option<&str> {
        self.explicit_name.as_deref()
    }

    fn dtype(&self) -> DType {
        let base = self.distribution.dtype();
        self.bijector
            .forward_dtype(Some(&Tree::Leaf(Some(base))))
            .ok()
            .and_then(|d| d.as_leaf().copied().flatten())
            .unwrap_or(base)
    }

    fn batch_shape(&self) -> Vec<usize> {
        self.distribution.batch_shape()
    }

    fn event_shape(&self) -> Vec<usize> {
        let base = self.distribution.event_shape();
        self.bijector
            .forward_event_shape_tensor(&Tree::Leaf(base.clone()))
            .ok()
            .and_then(Tree::into_leaf)
            .unwrap_or(base)
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            ("distribution".to_string(), ParamValue::Distribution(Arc::clone(&self.distribution))),
            ("bijector".to_string(), ParamValue::Bijector(Arc::clone(&self.bijector))),
        ])
    }

    fn sample(&self, sample_shape: &[usize], seed: &Seed) -> Result<Tensor> {
        let x = self.distribution.sample(sample_shape, seed)?;
        Self::single(self.bijector.forward(&Tree::Leaf(x))?)
    }

    fn log_prob(&self, y: &Tensor) -> Result<Tensor> {
        let y = Tree::Leaf(y.clone());
        let event_ndims = Tree::Leaf(self.event_shape().len() as i64);
        let xs = self.bijector.inverse(&y)?;
        let ildjs = self.bijector.inverse_log_det_jacobian(&y, Some(&event_ndims))?;
        match (xs, ildjs) {
            (Preimage::Unique(x), Preimage::Unique(ildj)) => {
                self.distribution.log_prob(&Self::single(x)?)?.add(&ildj)
            }
            (xs, ildjs) => {
                let branches = xs
                    .branches()
                    .into_iter()
                    .zip(ildjs.branches())
                    .map(|(x, ildj)| self.distribution.log_prob(&Self::single(x)?)?.add(&ildj))
                    .collect::<Result<Vec<_>>>()?;
                let refs: Vec<&Tensor> = branches.iter().collect();
                let (shape, cols) = broadcast_arrays(&refs)?;
                let n: usize = shape.iter().product();
                let mut row = vec![0.0; cols.len()];
                let out = (0..n)
                    .map(|i| {
                        for (slot, col) in row.iter_mut().zip(&cols) {
                            *slot = col[i];
                        }
                        logsumexp(&row)
                    })
                    .collect();
                Tensor::from_shape_vec(&shape, out)
            }
        }
    }

    fn cdf(&self, y: &Tensor) -> Result<Tensor> {
        if !self.bijector.is_injective() {
            return Err(Error::NotImplemented(format!("cdf of {} needs an injective bijector", self.name)));
        }
        let increasing = self.bijector.is_increasing()?;
        let x = Self::single(self.bijector.inverse_unique(&Tree::Leaf(y.clone()))?)?;
        let cdf = self.distribution.cdf(&x)?;
        cdf.zip_with(&increasing, |c, inc| if inc > 0.5 { c } else { 1.0 - c })
    }

    fn accepts_stateless_seed(&self) -> bool {
        self.distribution.accepts_stateless_seed()
    }

    fn as_transformed(&self) -> Option<&TransformedDistribution> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normal::{self, Normal};
    use crate::transforms::{AbsoluteValue, Exp, Scale};
    use approx::assert_relative_eq;
    use px_core::SeedKey;

    fn std_normal() -> Arc<dyn Distribution> {
        Arc::new(Normal::new(0.0, 1.0).unwrap())
    }

    #[test]
    fn test_log_normal_density() {
        let td = TransformedDistribution::new(std_normal(), Arc::new(Exp::bijector().unwrap())).unwrap();
        let y = Tensor::from_vec(vec![0.5, 2.0]);
        let lp = td.log_prob(&y).unwrap().to_vec();
        for (i, &v) in [0.5f64, 2.0].iter().enumerate() {
            let expected = normal::logpdf(v.ln(), 0.0, 1.0).unwrap() - v.ln();
            assert_relative_eq!(lp[i], expected, epsilon = 1e-12);
        }
        let cdf = td.cdf(&Tensor::scalar(1.0)).unwrap();
        assert_relative_eq!(cdf.item().unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_decreasing_bijector_flips_cdf() {
        let td = TransformedDistribution::new(std_normal(), Arc::new(Scale::bijector(-2.0).unwrap())).unwrap();
        let c = td.cdf(&Tensor::scalar(-2.0)).unwrap().item().unwrap();
        // P(-2X <= -2) = P(X >= 1)
        assert_relative_eq!(c, 1.0 - normal::cdf(1.0, 0.0, 1.0).unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn test_half_normal_sums_branches() {
        let td = TransformedDistribution::new(std_normal(), Arc::new(AbsoluteValue::bijector().unwrap())).unwrap();
        let lp = td.log_prob(&Tensor::scalar(0.7)).unwrap().item().unwrap();
        let expected = 2.0f64.ln() + normal::logpdf(0.7, 0.0, 1.0).unwrap();
        assert_relative_eq!(lp, expected, epsilon = 1e-12);
        assert!(matches!(td.cdf(&Tensor::scalar(0.7)), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn test_sample_is_forward_of_base_sample() {
        let base = std_normal();
        let td = TransformedDistribution::new(Arc::clone(&base), Arc::new(Exp::bijector().unwrap())).unwrap();
        let seed = Seed::Stateless(SeedKey::from_u64(5));
        let y = td.sample(&[3], &seed).unwrap();
        let x = base.sample(&[3], &seed).unwrap();
        assert_eq!(y.to_vec(), x.to_vec().iter().map(|v| v.exp()).collect::<Vec<_>>());
        assert!(td.as_transformed().is_some());
        assert_eq!(td.name(), "exp_Normal");
    }
}

//! Reference transforms.
//!
//! Scalar transforms act elementwise on every leaf. `Reshape` changes event
//! shape and rank, `JointMap` applies one transform per part of a structured
//! value, and `AbsoluteValue` is the non-injective example.

use std::sync::Arc;

use px_core::{DType, Error, Result, Tensor, Tree, Value};

use crate::bijector::{Bijector, BijectorConfig, BijectorImpl};
use crate::math::{log_sigmoid, sigmoid, softplus, softplus_inverse};
use crate::params::{Kwargs, ParamValue, Parameters};
use crate::shape::PartialShape;

fn single<'a>(v: &'a Value, what: &str) -> Result<&'a Tensor> {
    v.as_leaf().ok_or_else(|| Error::Type(format!("{} expects a single tensor, got {}", what, v.structure_string())))
}

fn map_leaves(v: &Value, f: impl Fn(f64) -> f64) -> Value {
    v.map(|t| t.map(&f))
}

fn increasing() -> Result<Tensor> {
    Ok(Tensor::scalar(1.0).cast(DType::Bool))
}

/// Identity: `y = x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Identity {
    /// Wrapped as a scalar bijector.
    pub fn bijector() -> Result<Bijector> {
        Bijector::new(Identity, BijectorConfig::with_min_event_ndims(0).constant_jacobian())
    }
}

impl BijectorImpl for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::new())
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(x.clone())
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(y.clone())
    }

    fn forward_log_det_jacobian(&self, _x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(Ok(Tensor::scalar(0.0)))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        increasing()
    }
}

/// Exp: `(-inf, inf) -> (0, inf)`, `y = exp(x)`, `log|J| = x`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exp;

impl Exp {
    /// Wrapped as a scalar bijector.
    pub fn bijector() -> Result<Bijector> {
        Bijector::new(Exp, BijectorConfig::with_min_event_ndims(0))
    }
}

impl BijectorImpl for Exp {
    fn name(&self) -> &str {
        "exp"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::new())
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(x, f64::exp))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(y, f64::ln))
    }

    fn forward_log_det_jacobian(&self, x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(single(x, "exp").cloned())
    }

    fn inverse_log_det_jacobian(&self, y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(single(y, "exp").map(|t| t.map(|v| -v.ln())))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        increasing()
    }
}

/// Shift: `y = x + shift`.
#[derive(Debug, Clone)]
pub struct Shift {
    shift: Tensor,
}

impl Shift {
    /// Shift by `shift` (broadcast against the input).
    pub fn new(shift: impl Into<Tensor>) -> Self {
        Self { shift: shift.into() }
    }

    /// Wrapped as a scalar bijector.
    pub fn bijector(shift: impl Into<Tensor>) -> Result<Bijector> {
        Bijector::new(Self::new(shift), BijectorConfig::with_min_event_ndims(0).constant_jacobian())
    }
}

impl BijectorImpl for Shift {
    fn name(&self) -> &str {
        "shift"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::from([("shift".to_string(), ParamValue::Tensor(self.shift.clone()))]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        x.try_map(|t| t.add(&self.shift))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        y.try_map(|t| t.sub(&self.shift))
    }

    fn forward_log_det_jacobian(&self, _x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(Ok(Tensor::scalar(0.0)))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        increasing()
    }

    fn parameter_batch_shape(&self) -> Option<Vec<usize>> {
        Some(self.shift.shape().to_vec())
    }
}

/// Scale: `y = scale * x`, `log|J| = log|scale|`.
#[derive(Debug, Clone)]
pub struct Scale {
    scale: Tensor,
}

impl Scale {
    /// Scale by `scale` (broadcast against the input).
    pub fn new(scale: impl Into<Tensor>) -> Self {
        Self { scale: scale.into() }
    }

    /// Wrapped as a scalar bijector.
    pub fn bijector(scale: impl Into<Tensor>) -> Result<Bijector> {
        Bijector::new(Self::new(scale), BijectorConfig::with_min_event_ndims(0).constant_jacobian())
    }
}

impl BijectorImpl for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::from([("scale".to_string(), ParamValue::Tensor(self.scale.clone()))]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        x.try_map(|t| t.mul(&self.scale))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        y.try_map(|t| t.div(&self.scale))
    }

    fn forward_log_det_jacobian(&self, _x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(Ok(self.scale.map(|s| s.abs().ln())))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        Ok(self.scale.map(|s| if s > 0.0 { 1.0 } else { 0.0 }).cast(DType::Bool))
    }

    fn parameter_batch_shape(&self) -> Option<Vec<usize>> {
        Some(self.scale.shape().to_vec())
    }
}

/// Softplus: `(-inf, inf) -> (0, inf)`, `y = log(1 + exp(x))`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Softplus;

impl Softplus {
    /// Wrapped as a scalar bijector.
    pub fn bijector() -> Result<Bijector> {
        Bijector::new(Softplus, BijectorConfig::with_min_event_ndims(0))
    }
}

impl BijectorImpl for Softplus {
    fn name(&self) -> &str {
        "softplus"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::new())
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(x, softplus))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(y, softplus_inverse))
    }

    fn forward_log_det_jacobian(&self, x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        // d/dx softplus(x) = sigmoid(x)
        Some(single(x, "softplus").map(|t| t.map(log_sigmoid)))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        increasing()
    }
}

/// Sigmoid: `(-inf, inf) -> (low, high)`, `y = low + (high - low) * sigmoid(x)`.
#[derive(Debug, Clone, Copy)]
pub struct Sigmoid {
    low: f64,
    high: f64,
}

impl Sigmoid {
    /// Map onto the open interval `(low, high)`.
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && high > low) {
            return Err(Error::Value(format!("sigmoid needs finite low < high, got ({}, {})", low, high)));
        }
        Ok(Self { low, high })
    }

    /// Wrapped as a scalar bijector.
    pub fn bijector(low: f64, high: f64) -> Result<Bijector> {
        Bijector::new(Self::new(low, high)?, BijectorConfig::with_min_event_ndims(0))
    }

    fn width(&self) -> f64 {
        self.high - self.low
    }
}

impl BijectorImpl for Sigmoid {
    fn name(&self) -> &str {
        "sigmoid"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::from([
            ("low".to_string(), ParamValue::Float(self.low)),
            ("high".to_string(), ParamValue::Float(self.high)),
        ]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(x, |v| self.low + self.width() * sigmoid(v)))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(y, |v| {
            let p = (v - self.low) / self.width();
            p.ln() - (-p).ln_1p()
        }))
    }

    fn forward_log_det_jacobian(&self, x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        let log_width = self.width().ln();
        Some(single(x, "sigmoid").map(|t| t.map(|v| log_width + log_sigmoid(v) + log_sigmoid(-v))))
    }

    fn is_increasing(&self) -> Result<Tensor> {
        increasing()
    }
}

/// Absolute value: `y = |x|`.
///
/// Every `y > 0` has the two preimages `-y` and `y`; both branches have unit
/// Jacobian.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteValue {
    validate_args: bool,
}

impl AbsoluteValue {
    /// Wrapped as a scalar bijector.
    pub fn bijector() -> Result<Bijector> {
        Bijector::new(AbsoluteValue::default(), BijectorConfig::with_min_event_ndims(0).constant_jacobian())
    }

    /// Wrapped as a scalar bijector that rejects negative inverse inputs.
    pub fn validated() -> Result<Bijector> {
        let config = BijectorConfig { validate_args: true, ..BijectorConfig::with_min_event_ndims(0).constant_jacobian() };
        Bijector::new(AbsoluteValue { validate_args: true }, config)
    }

    fn check(&self, y: &Value) -> Result<()> {
        if self.validate_args && y.flatten().iter().any(|t| t.array().iter().any(|&v| v < 0.0)) {
            return Err(Error::Validation("absolute value inverse requires y >= 0".into()));
        }
        Ok(())
    }
}

impl BijectorImpl for AbsoluteValue {
    fn name(&self) -> &str {
        "absolute_value"
    }

    fn parameters(&self) -> Option<Parameters> {
        Some(Parameters::new())
    }

    fn is_injective(&self) -> bool {
        false
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(map_leaves(x, f64::abs))
    }

    fn inverse_branches(&self, y: &Value, _kwargs: &Kwargs) -> Result<Vec<Value>> {
        self.check(y)?;
        Ok(vec![map_leaves(y, |v| -v), y.clone()])
    }

    fn inverse_log_det_jacobian_branches(&self, y: &Value, _kwargs: &Kwargs) -> Result<Vec<Tensor>> {
        self.check(y)?;
        let zeros = Tensor::zeros(single(y, "absolute_value")?.shape());
        Ok(vec![zeros.clone(), zeros])
    }
}

/// Reshape the trailing event dims from `event_shape_in` to `event_shape_out`.
///
/// Minimal event ranks are `len(event_shape_in)` forward and
/// `len(event_shape_out)` inverse, so ranks change through this transform.
#[derive(Debug, Clone)]
pub struct Reshape {
    event_shape_out: Vec<usize>,
    event_shape_in: Vec<usize>,
}

impl Reshape {
    /// Reshape events of shape `event_shape_in` into `event_shape_out`.
    pub fn new(event_shape_out: Vec<usize>, event_shape_in: Vec<usize>) -> Result<Self> {
        let n_out: usize = event_shape_out.iter().product();
        let n_in: usize = event_shape_in.iter().product();
        if n_out != n_in {
            return Err(Error::Value(format!(
                "cannot reshape events of shape {:?} ({} elements) into {:?} ({} elements)",
                event_shape_in, n_in, event_shape_out, n_out
            )));
        }
        Ok(Self { event_shape_out, event_shape_in })
    }

    /// Wrapped as a bijector.
    pub fn bijector(event_shape_out: Vec<usize>, event_shape_in: Vec<usize>) -> Result<Bijector> {
        let r = Self::new(event_shape_out, event_shape_in)?;
        let config = BijectorConfig::with_min_event_ndims_pair(
            Tree::Leaf(Some(r.event_shape_in.len())),
            Tree::Leaf(Some(r.event_shape_out.len())),
        )
        .constant_jacobian();
        Bijector::new(r, config)
    }

    fn batch_dims<'a>(shape: &'a [usize], event: &[usize]) -> Result<&'a [usize]> {
        let n = shape.len().checked_sub(event.len()).filter(|&n| shape[n..] == *event).ok_or_else(|| {
            Error::Validation(format!("input shape {:?} does not end with event shape {:?}", shape, event))
        })?;
        Ok(&shape[..n])
    }

    fn reshape(t: &Tensor, from: &[usize], to: &[usize]) -> Result<Tensor> {
        let batch = Self::batch_dims(t.shape(), from)?;
        let shape: Vec<usize> = batch.iter().chain(to).copied().collect();
        t.reshape(&shape)
    }

    fn static_shape(shape: &PartialShape, from: &[usize], to: &[usize]) -> Result<PartialShape> {
        let n = shape.len().checked_sub(from.len()).ok_or_else(|| {
            Error::Validation(format!("event shape {:?} has rank below {}", shape, from.len()))
        })?;
        for (dim, &want) in shape[n..].iter().zip(from) {
            if matches!(dim, Some(d) if *d != want) {
                return Err(Error::Validation(format!("event shape {:?} is incompatible with {:?}", shape, from)));
            }
        }
        Ok(shape[..n].iter().copied().chain(to.iter().map(|&d| Some(d))).collect())
    }
}

impl BijectorImpl for Reshape {
    fn name(&self) -> &str {
        "reshape"
    }

    fn parameters(&self) -> Option<Parameters> {
        let dims = |s: &[usize]| ParamValue::List(s.iter().map(|&d| ParamValue::Int(d as i64)).collect());
        Some(Parameters::from([
            ("event_shape_out".to_string(), dims(&self.event_shape_out)),
            ("event_shape_in".to_string(), dims(&self.event_shape_in)),
        ]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        x.try_map(|t| Self::reshape(t, &self.event_shape_in, &self.event_shape_out))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        y.try_map(|t| Self::reshape(t, &self.event_shape_out, &self.event_shape_in))
    }

    fn forward_log_det_jacobian(&self, x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(
            single(x, "reshape")
                .and_then(|t| Self::batch_dims(t.shape(), &self.event_shape_in))
                .map(Tensor::zeros),
        )
    }

    fn inverse_log_det_jacobian(&self, y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        Some(
            single(y, "reshape")
                .and_then(|t| Self::batch_dims(t.shape(), &self.event_shape_out))
                .map(Tensor::zeros),
        )
    }

    fn forward_event_shape(&self, input: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        input.try_map(|s| Self::static_shape(s, &self.event_shape_in, &self.event_shape_out))
    }

    fn forward_event_shape_tensor(&self, input: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        input.try_map(|s| {
            let batch = Self::batch_dims(s, &self.event_shape_in)?;
            Ok(batch.iter().chain(&self.event_shape_out).copied().collect())
        })
    }

    fn inverse_event_shape(&self, output: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        output.try_map(|s| Self::static_shape(s, &self.event_shape_out, &self.event_shape_in))
    }

    fn inverse_event_shape_tensor(&self, output: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        output.try_map(|s| {
            let batch = Self::batch_dims(s, &self.event_shape_out)?;
            Ok(batch.iter().chain(&self.event_shape_in).copied().collect())
        })
    }
}

/// Apply one transform per part of a structured value.
#[derive(Debug, Clone)]
pub struct JointMap {
    bijectors: Tree<Arc<Bijector>>,
}

impl JointMap {
    /// Wrap per-part transforms. Every part must be injective with a
    /// single-leaf minimal event rank.
    pub fn bijector(bijectors: Tree<Arc<Bijector>>) -> Result<Bijector> {
        let part_min = |b: &Arc<Bijector>, min: &Tree<Option<usize>>| -> Result<Option<usize>> {
            if !b.is_injective() {
                return Err(Error::NotImplemented(format!("JointMap part {} is not injective", b.name())));
            }
            min.as_leaf().copied().ok_or_else(|| {
                Error::NotImplemented(format!("JointMap part {} has structured min_event_ndims", b.name()))
            })
        };
        let forward_min = bijectors.try_map(|b| part_min(b, b.forward_min_event_ndims()))?;
        let inverse_min = bijectors.try_map(|b| part_min(b, b.inverse_min_event_ndims()))?;
        let is_constant_jacobian = bijectors.flatten().iter().all(|b| b.is_constant_jacobian());
        let config = BijectorConfig {
            is_constant_jacobian,
            ..BijectorConfig::with_min_event_ndims_pair(forward_min, inverse_min)
        };
        Bijector::new(JointMap { bijectors }, config)
    }

    /// Per-part transforms.
    pub fn bijectors(&self) -> &Tree<Arc<Bijector>> {
        &self.bijectors
    }

    fn sum_parts(parts: Vec<Tensor>) -> Result<Tensor> {
        parts.iter().try_fold(Tensor::scalar(0.0), |acc, p| acc.add(p))
    }
}

impl BijectorImpl for JointMap {
    fn name(&self) -> &str {
        "joint_map"
    }

    fn parameters(&self) -> Option<Parameters> {
        let parts = self.bijectors.flatten().into_iter().map(|b| ParamValue::Bijector(Arc::clone(b))).collect();
        Some(Parameters::from([("bijectors".to_string(), ParamValue::List(parts))]))
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        let parts = x.try_zip_with(&self.bijectors, |t, b| b.forward(&Tree::Leaf(t.clone())))?;
        parts.try_map(|v| single(v, "joint_map").cloned())
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        let parts = y.try_zip_with(&self.bijectors, |t, b| b.inverse_unique(&Tree::Leaf(t.clone())))?;
        parts.try_map(|v| single(v, "joint_map").cloned())
    }

    fn forward_log_det_jacobian(&self, x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        let ldj = x
            .try_zip_with(&self.bijectors, |t, b| b.forward_log_det_jacobian(&Tree::Leaf(t.clone()), None))
            .and_then(|parts| Self::sum_parts(parts.into_flat()));
        Some(ldj)
    }

    fn inverse_log_det_jacobian(&self, y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        let ldj = y
            .try_zip_with(&self.bijectors, |t, b| {
                b.inverse_log_det_jacobian(&Tree::Leaf(t.clone()), None)?.unique()
            })
            .and_then(|parts| Self::sum_parts(parts.into_flat()));
        Some(ldj)
    }

    fn forward_event_shape(&self, input: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        let parts = input.try_zip_with(&self.bijectors, |s, b| b.forward_event_shape(&Tree::Leaf(s.clone())))?;
        parts.try_map(|s| s.as_leaf().cloned().ok_or_else(|| Error::Type("part shape must be a leaf".into())))
    }

    fn forward_event_shape_tensor(&self, input: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        let parts =
            input.try_zip_with(&self.bijectors, |s, b| b.forward_event_shape_tensor(&Tree::Leaf(s.clone())))?;
        parts.try_map(|s| s.as_leaf().cloned().ok_or_else(|| Error::Type("part shape must be a leaf".into())))
    }

    fn inverse_event_shape(&self, output: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        let parts = output.try_zip_with(&self.bijectors, |s, b| b.inverse_event_shape(&Tree::Leaf(s.clone())))?;
        parts.try_map(|s| s.as_leaf().cloned().ok_or_else(|| Error::Type("part shape must be a leaf".into())))
    }

    fn inverse_event_shape_tensor(&self, output: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        let parts =
            output.try_zip_with(&self.bijectors, |s, b| b.inverse_event_shape_tensor(&Tree::Leaf(s.clone())))?;
        parts.try_map(|s| s.as_leaf().cloned().ok_or_else(|| Error::Type("part shape must be a leaf".into())))
    }

    fn forward_dtype(&self, input: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        let parts = input.try_zip_with(&self.bijectors, |d, b| b.forward_dtype(Some(&Tree::Leaf(*d))))?;
        parts.try_map(|d| d.as_leaf().copied().ok_or_else(|| Error::Type("part dtype must be a leaf".into())))
    }

    fn inverse_dtype(&self, output: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        let parts = output.try_zip_with(&self.bijectors, |d, b| b.inverse_dtype(Some(&Tree::Leaf(*d))))?;
        parts.try_map(|d| d.as_leaf().copied().ok_or_else(|| Error::Type("part dtype must be a leaf".into())))
    }
}

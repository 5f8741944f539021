//! The transformation contract shared by every bijector.
//!
//! A concrete transform implements [`BijectorImpl`] and supplies whichever
//! primitives it has. [`Bijector`] wraps it and provides the public surface:
//! input validation, the forward/inverse cache, log-det-Jacobian (LDJ)
//! resolution and reduction over event dimensions, event-shape, -rank and
//! dtype inference, parameter-based equality, and call dispatch.

use std::any::TypeId;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use finitediff::FiniteDiff;
use px_core::{DType, Error, Result, Tensor, Tree, Value};
use serde::{Deserialize, Serialize};

use crate::cache::{BijectorCache, get_attribute, set_attribute};
use crate::chain::Chain;
use crate::distribution::Distribution;
use crate::params::{Kwargs, Parameters, canonical_kwargs};
use crate::shape::{PartialShape, ReductionShape, known, reduction_rank, reduction_shape, validate_rank};
use crate::transformed::TransformedDistribution;

/// Environment variable that disables input dtype checks when set to a
/// non-empty value other than `0`/`false`.
pub const SKIP_DTYPE_CHECKS_ENV: &str = "PX_SKIP_DTYPE_CHECKS";

fn skip_dtype_checks() -> bool {
    static SKIP: OnceLock<bool> = OnceLock::new();
    *SKIP.get_or_init(|| {
        std::env::var(SKIP_DTYPE_CHECKS_ENV)
            .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false)
    })
}

fn next_instance_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Primitives of a concrete transform.
///
/// Every method has a default. The defaults either report the primitive as
/// missing (`NotImplemented`, or `None` for the LDJ primitives, which lets
/// [`Bijector`] try its fallbacks) or describe a shape- and dtype-preserving
/// map.
pub trait BijectorImpl: Send + Sync + fmt::Debug + 'static {
    /// Default display name.
    fn name(&self) -> &str;

    /// Constructor parameters. `None` makes every instance unique.
    fn parameters(&self) -> Option<Parameters> {
        None
    }

    /// `false` for maps with several preimage branches.
    fn is_injective(&self) -> bool {
        true
    }

    /// Forward map.
    fn forward(&self, _x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Err(Error::NotImplemented(format!("forward not implemented for {}", self.name())))
    }

    /// Inverse map (injective transforms).
    fn inverse(&self, _y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Err(Error::NotImplemented(format!("inverse not implemented for {}", self.name())))
    }

    /// All preimages of `y` (non-injective transforms).
    fn inverse_branches(&self, _y: &Value, _kwargs: &Kwargs) -> Result<Vec<Value>> {
        Err(Error::NotImplemented(format!("inverse branches not implemented for {}", self.name())))
    }

    /// Unreduced forward LDJ at `x`, if this transform has a direct formula.
    fn forward_log_det_jacobian(&self, _x: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        None
    }

    /// Unreduced inverse LDJ at `y`, if this transform has a direct formula.
    fn inverse_log_det_jacobian(&self, _y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        None
    }

    /// Unreduced inverse LDJ of every branch (non-injective transforms).
    fn inverse_log_det_jacobian_branches(&self, _y: &Value, _kwargs: &Kwargs) -> Result<Vec<Tensor>> {
        Err(Error::NotImplemented(format!("inverse LDJ branches not implemented for {}", self.name())))
    }

    /// Override of the whole reduced forward LDJ path.
    ///
    /// Composite transforms that propagate `event_ndims` through their parts
    /// implement this instead of the unreduced primitive.
    fn forward_log_det_jacobian_reduced(
        &self,
        _x: &Value,
        _event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        None
    }

    /// Override of the whole reduced inverse LDJ path.
    fn inverse_log_det_jacobian_reduced(
        &self,
        _y: &Value,
        _event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        None
    }

    /// Static output event shape for an input event shape.
    fn forward_event_shape(&self, input: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        Ok(input.clone())
    }

    /// Concrete output event shape for an input event shape.
    fn forward_event_shape_tensor(&self, input: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        Ok(input.clone())
    }

    /// Static input event shape for an output event shape.
    fn inverse_event_shape(&self, output: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        Ok(output.clone())
    }

    /// Concrete input event shape for an output event shape.
    fn inverse_event_shape_tensor(&self, output: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        Ok(output.clone())
    }

    /// Output dtype structure for an input dtype structure.
    fn forward_dtype(&self, input: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        Ok(input.clone())
    }

    /// Input dtype structure for an output dtype structure.
    fn inverse_dtype(&self, output: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
        Ok(output.clone())
    }

    /// `1` where the map increases, `0` where it decreases (scalar maps only).
    fn is_increasing(&self) -> Result<Tensor> {
        Err(Error::NotImplemented(format!("is_increasing not implemented for {}", self.name())))
    }

    /// Batch shape implied by the parameters.
    fn parameter_batch_shape(&self) -> Option<Vec<usize>> {
        None
    }

    /// Downcast to a chain.
    fn as_chain(&self) -> Option<&Chain> {
        None
    }
}

/// Construction-time settings of a [`Bijector`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BijectorConfig {
    /// Minimal input event rank (per input part). `None` entries are unknown.
    pub forward_min_event_ndims: Option<Tree<Option<usize>>>,
    /// Minimal output event rank (per output part).
    pub inverse_min_event_ndims: Option<Tree<Option<usize>>>,
    /// LDJ does not depend on the input.
    pub is_constant_jacobian: bool,
    /// Enable runtime argument checks.
    pub validate_args: bool,
    /// Declared element type.
    pub dtype: Option<Tree<Option<DType>>>,
    /// Display name; defaults to the transform's own name.
    pub name: Option<String>,
    /// Broadcast LDJ reduction segments across parts instead of requiring
    /// them to match.
    pub allow_event_shape_broadcasting: bool,
}

impl BijectorConfig {
    /// Config for a transform with the same minimal rank on both sides.
    pub fn with_min_event_ndims(ndims: usize) -> Self {
        Self { forward_min_event_ndims: Some(Tree::Leaf(Some(ndims))), ..Self::default() }
    }

    /// Config for a rank-changing transform.
    pub fn with_min_event_ndims_pair(forward: Tree<Option<usize>>, inverse: Tree<Option<usize>>) -> Self {
        Self { forward_min_event_ndims: Some(forward), inverse_min_event_ndims: Some(inverse), ..Self::default() }
    }

    /// Mark the LDJ as input-independent.
    pub fn constant_jacobian(mut self) -> Self {
        self.is_constant_jacobian = true;
        self
    }
}

/// Result of an inverse: one preimage, or one per branch.
#[derive(Debug, Clone, PartialEq)]
pub enum Preimage<T> {
    /// Injective transform.
    Unique(T),
    /// Non-injective transform; one entry per branch.
    Branches(Vec<T>),
}

impl<T> Preimage<T> {
    /// The unique preimage; `NotImplemented` for branched results.
    pub fn unique(self) -> Result<T> {
        match self {
            Preimage::Unique(v) => Ok(v),
            Preimage::Branches(b) => {
                Err(Error::NotImplemented(format!("expected a unique preimage, found {} branches", b.len())))
            }
        }
    }

    /// All branches (a unique preimage is a single branch).
    pub fn branches(self) -> Vec<T> {
        match self {
            Preimage::Unique(v) => vec![v],
            Preimage::Branches(b) => b,
        }
    }
}

/// Argument of [`Bijector::apply`].
#[derive(Debug, Clone)]
pub enum Operand {
    /// A structured value; apply the forward map.
    Value(Value),
    /// A distribution; wrap it in a transformed distribution.
    Distribution(Arc<dyn Distribution>),
    /// Another transform; compose into a two-element chain.
    Bijector(Arc<Bijector>),
    /// A chain; prepend to it.
    Chain(Arc<Bijector>),
}

impl From<Value> for Operand {
    fn from(v: Value) -> Self {
        Operand::Value(v)
    }
}

impl From<Tensor> for Operand {
    fn from(t: Tensor) -> Self {
        Operand::Value(Tree::Leaf(t))
    }
}

impl From<Arc<dyn Distribution>> for Operand {
    fn from(d: Arc<dyn Distribution>) -> Self {
        Operand::Distribution(d)
    }
}

impl From<Arc<Bijector>> for Operand {
    fn from(b: Arc<Bijector>) -> Self {
        if b.as_chain().is_some() { Operand::Chain(b) } else { Operand::Bijector(b) }
    }
}

/// Result of [`Bijector::apply`].
#[derive(Debug)]
pub enum Applied {
    /// Forward image of a value.
    Value(Value),
    /// Transformed distribution.
    Distribution(TransformedDistribution),
    /// Composite transform.
    Bijector(Bijector),
}

/// A transform together with its declared contract and result cache.
pub struct Bijector {
    inner: Box<dyn BijectorImpl>,
    type_id: TypeId,
    forward_min_event_ndims: Tree<Option<usize>>,
    inverse_min_event_ndims: Tree<Option<usize>>,
    is_constant_jacobian: bool,
    validate_args: bool,
    dtype: Option<Tree<Option<DType>>>,
    name: String,
    allow_event_shape_broadcasting: bool,
    instance_id: u64,
    cache: BijectorCache,
}

impl fmt::Debug for Bijector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bijector")
            .field("name", &self.name)
            .field("inner", &self.inner)
            .field("forward_min_event_ndims", &self.forward_min_event_ndims)
            .field("inverse_min_event_ndims", &self.inverse_min_event_ndims)
            .finish_non_exhaustive()
    }
}

impl Bijector {
    /// Wrap `inner` with the contract in `config`.
    ///
    /// At least one minimal event rank must be given; the other defaults to it.
    pub fn new<I: BijectorImpl>(inner: I, config: BijectorConfig) -> Result<Self> {
        let (forward_min, inverse_min) = match (config.forward_min_event_ndims, config.inverse_min_event_ndims) {
            (None, None) => {
                return Err(Error::Value(
                    "must specify at least one of `forward_min_event_ndims` and `inverse_min_event_ndims`".into(),
                ));
            }
            (Some(f), None) => (f.clone(), f),
            (None, Some(i)) => (i.clone(), i),
            (Some(f), Some(i)) => (f, i),
        };
        let name = config.name.unwrap_or_else(|| inner.name().to_string());
        Ok(Self {
            inner: Box::new(inner),
            type_id: TypeId::of::<I>(),
            forward_min_event_ndims: forward_min,
            inverse_min_event_ndims: inverse_min,
            is_constant_jacobian: config.is_constant_jacobian,
            validate_args: config.validate_args,
            dtype: config.dtype,
            name,
            allow_event_shape_broadcasting: config.allow_event_shape_broadcasting,
            instance_id: next_instance_id(),
            cache: BijectorCache::new(),
        })
    }

    /// Replace the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable runtime argument checks.
    pub fn with_validate_args(mut self, validate_args: bool) -> Self {
        self.validate_args = validate_args;
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether runtime argument checks are enabled.
    pub fn validate_args(&self) -> bool {
        self.validate_args
    }

    /// Whether the LDJ is input-independent.
    pub fn is_constant_jacobian(&self) -> bool {
        self.is_constant_jacobian
    }

    /// Whether the map is injective.
    pub fn is_injective(&self) -> bool {
        self.inner.is_injective()
    }

    /// Declared element type.
    pub fn dtype(&self) -> Option<&Tree<Option<DType>>> {
        self.dtype.as_ref()
    }

    /// Declared minimal input rank structure.
    pub fn forward_min_event_ndims(&self) -> &Tree<Option<usize>> {
        &self.forward_min_event_ndims
    }

    /// Declared minimal output rank structure.
    pub fn inverse_min_event_ndims(&self) -> &Tree<Option<usize>> {
        &self.inverse_min_event_ndims
    }

    /// `true` when every minimal rank is statically known.
    pub fn has_static_min_event_ndims(&self) -> bool {
        self.forward_min_event_ndims.flatten().iter().all(|d| d.is_some())
            && self.inverse_min_event_ndims.flatten().iter().all(|d| d.is_some())
    }

    /// Constructor parameters, if the transform declares any.
    pub fn parameters(&self) -> Option<Parameters> {
        self.inner.parameters()
    }

    /// Batch shape implied by the parameters.
    pub fn parameter_batch_shape(&self) -> Option<Vec<usize>> {
        self.inner.parameter_batch_shape()
    }

    /// Token unique to this instance.
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// The forward/inverse result cache.
    pub fn cache(&self) -> &BijectorCache {
        &self.cache
    }

    /// Downcast to a chain.
    pub fn as_chain(&self) -> Option<&Chain> {
        self.inner.as_chain()
    }

    /// The concrete transform.
    pub fn inner(&self) -> &dyn BijectorImpl {
        self.inner.as_ref()
    }

    /// The caller's `event_ndims` (validated non-negative), else the declared
    /// minimum. Known minimums are checked before any override runs.
    fn resolve_event_ndims(&self, event_ndims: Option<&Tree<i64>>, min: &Result<Tree<i64>>) -> Result<Tree<i64>> {
        match (event_ndims, min) {
            (Some(e), Ok(m)) => {
                reduction_rank(e, m)?;
                Ok(e.clone())
            }
            (Some(e), Err(_)) => {
                e.try_map(|&d| validate_rank(d))?;
                Ok(e.clone())
            }
            (None, Ok(m)) => Ok(m.clone()),
            (None, Err(err)) => Err(err.clone()),
        }
    }

    fn static_min(&self, min: &Tree<Option<usize>>) -> Result<Tree<i64>> {
        min.try_map(|d| d.map(|d| d as i64).ok_or(()))
            .map_err(|_| {
                Error::NotImplemented(format!(
                    "{} has unknown `min_event_ndims`; it must override the full LDJ call path",
                    self.name
                ))
            })
    }

    fn check_input(&self, v: &Value, min: &Tree<Option<usize>>, expected: Option<Tree<Option<DType>>>) -> Result<()> {
        if !min.is_leaf() {
            v.assert_same_structure(min)?;
        }
        if skip_dtype_checks() {
            return Ok(());
        }
        let Some(expected) = expected else { return Ok(()) };
        let expected = expected.coerce_structure(v)?;
        if !expected.same_structure(v) {
            return Err(Error::Type(format!(
                "{}: input structure {} does not match dtype structure {}",
                self.name,
                v.structure_string(),
                expected.structure_string()
            )));
        }
        for (t, d) in v.flatten().into_iter().zip(expected.flatten()) {
            match d {
                Some(d) if t.dtype() != *d => {
                    return Err(Error::Type(format!("{}: input has dtype {}, expected {}", self.name, t.dtype(), d)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn check_forward_input(&self, x: &Value) -> Result<()> {
        let expected = match &self.dtype {
            Some(_) => Some(self.inverse_dtype(None)?),
            None => None,
        };
        self.check_input(x, &self.forward_min_event_ndims, expected)
    }

    fn check_inverse_input(&self, y: &Value) -> Result<()> {
        let expected = match &self.dtype {
            Some(_) => Some(self.forward_dtype(None)?),
            None => None,
        };
        self.check_input(y, &self.inverse_min_event_ndims, expected)
    }

    /// Forward map `y = f(x)`.
    pub fn forward(&self, x: &Value) -> Result<Value> {
        self.forward_with(x, &Kwargs::new())
    }

    /// Forward map with call options.
    pub fn forward_with(&self, x: &Value, kwargs: &Kwargs) -> Result<Value> {
        self.check_forward_input(x)?;
        if !self.inner.is_injective() {
            return self.inner.forward(x, kwargs);
        }
        self.cache.forward(x, &canonical_kwargs(kwargs), |x| self.inner.forward(x, kwargs))
    }

    /// Inverse map. Non-injective transforms return every branch.
    pub fn inverse(&self, y: &Value) -> Result<Preimage<Value>> {
        self.inverse_with(y, &Kwargs::new())
    }

    /// Inverse map with call options.
    pub fn inverse_with(&self, y: &Value, kwargs: &Kwargs) -> Result<Preimage<Value>> {
        self.check_inverse_input(y)?;
        if !self.inner.is_injective() {
            return Ok(Preimage::Branches(self.inner.inverse_branches(y, kwargs)?));
        }
        let x = self.cache.inverse(y, &canonical_kwargs(kwargs), |y| self.inner.inverse(y, kwargs))?;
        Ok(Preimage::Unique(x))
    }

    /// Inverse of an injective transform.
    pub fn inverse_unique(&self, y: &Value) -> Result<Value> {
        self.inverse(y)?.unique()
    }

    /// Forward LDJ at `x`, summed over `event_ndims - forward_min_event_ndims`
    /// trailing dims. `event_ndims` defaults to `forward_min_event_ndims`.
    pub fn forward_log_det_jacobian(&self, x: &Value, event_ndims: Option<&Tree<i64>>) -> Result<Tensor> {
        self.forward_log_det_jacobian_with(x, event_ndims, &Kwargs::new())
    }

    /// Forward LDJ with call options.
    pub fn forward_log_det_jacobian_with(
        &self,
        x: &Value,
        event_ndims: Option<&Tree<i64>>,
        kwargs: &Kwargs,
    ) -> Result<Tensor> {
        if !self.inner.is_injective() {
            return Err(Error::NotImplemented(format!(
                "forward_log_det_jacobian is undefined for non-injective transform {}",
                self.name
            )));
        }
        self.check_forward_input(x)?;
        let min = self.static_min(&self.forward_min_event_ndims);
        let event_ndims = self.resolve_event_ndims(event_ndims, &min)?;
        if let Some(ldj) = self.inner.forward_log_det_jacobian_reduced(x, &event_ndims, kwargs) {
            return ldj;
        }
        let min = min?;
        let reduce_rank = reduction_rank(&event_ndims, &min)?;
        let unreduced = self.unreduced_forward_log_det_jacobian(x, kwargs)?;
        self.reduce_jacobian(unreduced, x, &event_ndims, &min, reduce_rank)
    }

    /// Inverse LDJ at `y`. Non-injective transforms return one per branch.
    ///
    /// `event_ndims` defaults to `inverse_min_event_ndims`.
    pub fn inverse_log_det_jacobian(&self, y: &Value, event_ndims: Option<&Tree<i64>>) -> Result<Preimage<Tensor>> {
        self.inverse_log_det_jacobian_with(y, event_ndims, &Kwargs::new())
    }

    /// Inverse LDJ with call options.
    pub fn inverse_log_det_jacobian_with(
        &self,
        y: &Value,
        event_ndims: Option<&Tree<i64>>,
        kwargs: &Kwargs,
    ) -> Result<Preimage<Tensor>> {
        self.check_inverse_input(y)?;
        let min = self.static_min(&self.inverse_min_event_ndims);
        let event_ndims = self.resolve_event_ndims(event_ndims, &min)?;
        if self.inner.is_injective() {
            if let Some(ldj) = self.inner.inverse_log_det_jacobian_reduced(y, &event_ndims, kwargs) {
                return ldj.map(Preimage::Unique);
            }
        }
        let min = min?;
        let reduce_rank = reduction_rank(&event_ndims, &min)?;
        if !self.inner.is_injective() {
            let branches = self.inner.inverse_log_det_jacobian_branches(y, kwargs)?;
            let reduced = branches
                .into_iter()
                .map(|ldj| self.reduce_jacobian(ldj, y, &event_ndims, &min, reduce_rank))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Preimage::Branches(reduced));
        }
        let unreduced = self.unreduced_inverse_log_det_jacobian(y, kwargs)?;
        self.reduce_jacobian(unreduced, y, &event_ndims, &min, reduce_rank).map(Preimage::Unique)
    }

    fn unreduced_forward_log_det_jacobian(&self, x: &Value, kwargs: &Kwargs) -> Result<Tensor> {
        let options = canonical_kwargs(kwargs);
        let attrs = self.cache.forward_attributes(x, &options);
        if let Some(ildj) = get_attribute(&attrs, "ildj") {
            return Ok(ildj.neg());
        }
        let ildj = match self.inner.forward_log_det_jacobian(x, kwargs) {
            Some(fldj) => fldj?.neg(),
            None => {
                let y = self.cache.forward(x, &options, |x| self.inner.forward(x, kwargs))?;
                match self.inner.inverse_log_det_jacobian(&y, kwargs) {
                    Some(ildj) => ildj?,
                    None => {
                        return self.numeric_log_det_jacobian(x, |v| self.inner.forward(v, kwargs), "forward");
                    }
                }
            }
        };
        set_attribute(&attrs, "ildj", ildj.clone());
        Ok(ildj.neg())
    }

    fn unreduced_inverse_log_det_jacobian(&self, y: &Value, kwargs: &Kwargs) -> Result<Tensor> {
        let options = canonical_kwargs(kwargs);
        let attrs = self.cache.inverse_attributes(y, &options);
        if let Some(ildj) = get_attribute(&attrs, "ildj") {
            return Ok(ildj);
        }
        let ildj = match self.inner.inverse_log_det_jacobian(y, kwargs) {
            Some(ildj) => ildj?,
            None => {
                let x = self.cache.inverse(y, &options, |y| self.inner.inverse(y, kwargs))?;
                match self.inner.forward_log_det_jacobian(&x, kwargs) {
                    Some(fldj) => fldj?.neg(),
                    None => {
                        return self.numeric_log_det_jacobian(y, |v| self.inner.inverse(v, kwargs), "inverse");
                    }
                }
            }
        };
        set_attribute(&attrs, "ildj", ildj.clone());
        Ok(ildj)
    }

    /// `log|f'(v)|` by central differences, for scalar transforms only.
    ///
    /// A scalar transform acts elementwise, so the gradient of `sum(f(v))`
    /// holds every diagonal derivative.
    fn numeric_log_det_jacobian(
        &self,
        input: &Value,
        f: impl Fn(&Value) -> Result<Value>,
        direction: &str,
    ) -> Result<Tensor> {
        let scalar = matches!(self.forward_min_event_ndims, Tree::Leaf(Some(0)))
            && matches!(self.inverse_min_event_ndims, Tree::Leaf(Some(0)));
        let Some(t) = input.as_leaf().filter(|_| scalar) else {
            return Err(Error::NotImplemented(format!(
                "neither a {direction} LDJ nor an inverse fallback is implemented for {}",
                self.name
            )));
        };
        log::debug!("{}: numerically differentiating the {} map", self.name, direction);

        let shape = t.shape().to_vec();
        let dtype = t.dtype();
        let closure_err: RefCell<Option<Error>> = RefCell::new(None);
        let total = |v: &Vec<f64>| -> f64 {
            let evaluated = Tensor::from_shape_vec(&shape, v.clone())
                .map(|t| t.cast(dtype))
                .and_then(|t| f(&Tree::Leaf(t)))
                .and_then(|out| out.into_leaf().ok_or_else(|| Error::Type("expected a single output".into())));
            match evaluated {
                Ok(out) => out.sum_all(),
                Err(e) => {
                    let mut slot = closure_err.borrow_mut();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    f64::NAN
                }
            }
        };
        let grad = t.to_vec().central_diff(&total);
        if let Some(e) = closure_err.into_inner() {
            return Err(e);
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(Error::Computation(format!("non-finite numerical derivative in {}", self.name)));
        }
        let ldj: Vec<f64> = grad.iter().map(|g| g.abs().ln()).collect();
        Ok(Tensor::from_shape_vec(&shape, ldj)?.cast(dtype))
    }

    fn reduce_jacobian(
        &self,
        unreduced: Tensor,
        input: &Value,
        event_ndims: &Tree<i64>,
        min: &Tree<i64>,
        reduce_rank: usize,
    ) -> Result<Tensor> {
        if reduce_rank == 0 {
            return Ok(unreduced);
        }
        let shapes = input.map(|t| known(t.shape()));
        let reduction = self.plan_reduction(&shapes, event_ndims, min)?;
        let first_rank = input.flatten().first().map(|t| t.rank()).unwrap_or(0);
        let first_event = event_ndims.coerce_structure(input)?.flatten().first().map(|&&e| e as usize).unwrap_or(0);
        let reduce_shape = reduction.resolve(&input.map(|t| t.shape().to_vec()), first_rank.saturating_sub(first_event))?;
        unreduced.mul(&Tensor::full(&reduce_shape, 1.0))?.sum_trailing(reduce_shape.len())
    }

    /// Reduction plan for the forward LDJ over inputs of (possibly partially
    /// known) `shapes`.
    ///
    /// Checks that depend on unknown dims come back in
    /// [`ReductionShape::pending`]; resolve the plan against concrete shapes
    /// before using a value reduced with it.
    pub fn forward_ldj_reduction(&self, shapes: &Tree<PartialShape>, event_ndims: &Tree<i64>) -> Result<ReductionShape> {
        let min = self.static_min(&self.forward_min_event_ndims)?;
        self.plan_reduction(shapes, event_ndims, &min)
    }

    /// Reduction plan for the inverse LDJ. See [`Bijector::forward_ldj_reduction`].
    pub fn inverse_ldj_reduction(&self, shapes: &Tree<PartialShape>, event_ndims: &Tree<i64>) -> Result<ReductionShape> {
        let min = self.static_min(&self.inverse_min_event_ndims)?;
        self.plan_reduction(shapes, event_ndims, &min)
    }

    fn plan_reduction(&self, shapes: &Tree<PartialShape>, event_ndims: &Tree<i64>, min: &Tree<i64>) -> Result<ReductionShape> {
        let parameter_batch_shape = self.inner.parameter_batch_shape();
        reduction_shape(
            shapes,
            event_ndims,
            min,
            parameter_batch_shape.as_deref(),
            self.allow_event_shape_broadcasting,
            self.validate_args,
        )
    }

    /// Static output event shape.
    pub fn forward_event_shape(&self, input_shape: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        self.inner.forward_event_shape(input_shape)
    }

    /// Concrete output event shape.
    pub fn forward_event_shape_tensor(&self, input_shape: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        self.inner.forward_event_shape_tensor(input_shape)
    }

    /// Static input event shape.
    pub fn inverse_event_shape(&self, output_shape: &Tree<PartialShape>) -> Result<Tree<PartialShape>> {
        self.inner.inverse_event_shape(output_shape)
    }

    /// Concrete input event shape.
    pub fn inverse_event_shape_tensor(&self, output_shape: &Tree<Vec<usize>>) -> Result<Tree<Vec<usize>>> {
        self.inner.inverse_event_shape_tensor(output_shape)
    }

    /// Output event ranks for input event ranks `event_ndims`.
    pub fn forward_event_ndims(&self, event_ndims: &Tree<i64>) -> Result<Tree<i64>> {
        let fmin = self.static_min(&self.forward_min_event_ndims)?;
        let imin = self.static_min(&self.inverse_min_event_ndims)?;
        let extra = reduction_rank(event_ndims, &fmin)? as i64;
        Ok(imin.map(|m| m + extra))
    }

    /// Input event ranks for output event ranks `event_ndims`.
    pub fn inverse_event_ndims(&self, event_ndims: &Tree<i64>) -> Result<Tree<i64>> {
        let fmin = self.static_min(&self.forward_min_event_ndims)?;
        let imin = self.static_min(&self.inverse_min_event_ndims)?;
        let extra = reduction_rank(event_ndims, &imin)? as i64;
        Ok(fmin.map(|m| m + extra))
    }

    /// Output dtype structure. `None` starts from the declared dtype.
    pub fn forward_dtype(&self, dtype: Option<&Tree<Option<DType>>>) -> Result<Tree<Option<DType>>> {
        let input = self.resolve_input_dtype(dtype, &self.forward_min_event_ndims)?;
        let output = self.inner.forward_dtype(&input)?;
        self.check_dtype_structure(&output, &self.inverse_min_event_ndims, &input)?;
        Ok(output)
    }

    /// Input dtype structure. `None` starts from the declared dtype.
    pub fn inverse_dtype(&self, dtype: Option<&Tree<Option<DType>>>) -> Result<Tree<Option<DType>>> {
        let input = self.resolve_input_dtype(dtype, &self.inverse_min_event_ndims)?;
        let output = self.inner.inverse_dtype(&input)?;
        self.check_dtype_structure(&output, &self.forward_min_event_ndims, &input)?;
        Ok(output)
    }

    fn resolve_input_dtype(
        &self,
        dtype: Option<&Tree<Option<DType>>>,
        min: &Tree<Option<usize>>,
    ) -> Result<Tree<Option<DType>>> {
        let own = self.dtype.clone().unwrap_or(Tree::Leaf(None));
        let Some(dtype) = dtype else {
            return own.broadcast_to_structure(min);
        };
        let dtype = dtype.coerce_structure(min)?;
        if self.dtype.is_some() {
            let own = own.coerce_structure(&dtype)?;
            dtype.zip_with(&own, |given, declared| match (given, declared) {
                (Some(g), Some(d)) if g != d => Err(Error::Type(format!(
                    "{}: dtype {} is incompatible with declared dtype {}",
                    self.name, g, d
                ))),
                _ => Ok(()),
            })?
            .into_flat()
            .into_iter()
            .collect::<Result<Vec<()>>>()?;
        }
        Ok(dtype)
    }

    fn check_dtype_structure(
        &self,
        output: &Tree<Option<DType>>,
        output_min: &Tree<Option<usize>>,
        input: &Tree<Option<DType>>,
    ) -> Result<()> {
        let expected_structured = !output_min.is_leaf();
        let ok = if expected_structured { output.same_structure(output_min) } else { output.same_structure(input) };
        if ok {
            Ok(())
        } else {
            Err(Error::NotImplemented(format!(
                "{}: dtype rule changed the output structure to {}; structure must be fixed at construction",
                self.name,
                output.structure_string()
            )))
        }
    }

    /// Monotonicity of a scalar transform (`1` increasing, `0` decreasing).
    pub fn is_increasing(&self) -> Result<Tensor> {
        let scalar = matches!(self.forward_min_event_ndims, Tree::Leaf(Some(0)))
            && matches!(self.inverse_min_event_ndims, Tree::Leaf(Some(0)));
        if !scalar {
            return Err(Error::NotImplemented(format!(
                "is_increasing is only defined for scalar transforms; {} has min_event_ndims {:?}",
                self.name, self.forward_min_event_ndims
            )));
        }
        self.inner.is_increasing()
    }

    /// Apply this transform to `operand`.
    ///
    /// Values are mapped forward, distributions are wrapped (a transformed
    /// distribution gets `self ∘ bijector` over its base), transforms are
    /// composed into a chain, and chains get `self` prepended.
    pub fn apply(self: &Arc<Self>, operand: impl Into<Operand>) -> Result<Applied> {
        match operand.into() {
            Operand::Value(x) => self.forward(&x).map(Applied::Value),
            Operand::Distribution(d) => {
                if let Some(td) = d.as_transformed() {
                    let composed = match self.apply(Arc::clone(td.bijector()))? {
                        Applied::Bijector(b) => b,
                        other => return Err(Error::Type(format!("composition produced {:?}", other))),
                    };
                    let out = TransformedDistribution::new(Arc::clone(td.distribution()), Arc::new(composed))?;
                    return Ok(Applied::Distribution(out));
                }
                TransformedDistribution::new(d, Arc::clone(self)).map(Applied::Distribution)
            }
            Operand::Bijector(b) => Chain::bijector(vec![Arc::clone(self), b], false, None).map(Applied::Bijector),
            Operand::Chain(c) => {
                let parts = match c.as_chain() {
                    Some(chain) => chain.bijectors().to_vec(),
                    None => vec![Arc::clone(&c)],
                };
                let mut all = Vec::with_capacity(parts.len() + 1);
                all.push(Arc::clone(self));
                all.extend(parts);
                Chain::bijector(all, c.validate_args(), Some(c.name().to_string())).map(Applied::Bijector)
            }
        }
    }
}

impl PartialEq for Bijector {
    fn eq(&self, other: &Self) -> bool {
        if self.instance_id == other.instance_id {
            return true;
        }
        if self.type_id != other.type_id || self.name != other.name || self.validate_args != other.validate_args {
            return false;
        }
        match (self.inner.parameters(), other.inner.parameters()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Bijector {}

impl Hash for Bijector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.inner.parameters() {
            Some(params) => {
                self.type_id.hash(state);
                self.name.hash(state);
                self.validate_args.hash(state);
                params.hash(state);
            }
            None => self.instance_id.hash(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transforms::{AbsoluteValue, Exp, Scale, Shift};
    use approx::assert_relative_eq;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::atomic::AtomicUsize;

    fn leaf(xs: Vec<f64>) -> Value {
        Tree::Leaf(Tensor::from_vec(xs))
    }

    fn hash_of(b: &Bijector) -> u64 {
        let mut s = DefaultHasher::new();
        b.hash(&mut s);
        s.finish()
    }

    /// Cubic map with only forward/inverse primitives.
    #[derive(Debug)]
    struct Cube;

    impl BijectorImpl for Cube {
        fn name(&self) -> &str {
            "cube"
        }

        fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
            Ok(x.map(|t| t.map(|v| v * v * v)))
        }

        fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
            Ok(y.map(|t| t.map(f64::cbrt)))
        }
    }

    /// Exp whose inverse LDJ counts its calls.
    #[derive(Debug)]
    struct CountingExp(Arc<AtomicUsize>);

    impl BijectorImpl for CountingExp {
        fn name(&self) -> &str {
            "counting_exp"
        }

        fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
            Ok(x.map(|t| t.map(f64::exp)))
        }

        fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
            Ok(y.map(|t| t.map(f64::ln)))
        }

        fn inverse_log_det_jacobian(&self, y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Some(y.as_leaf().map(|t| t.map(|v| -v.ln())).ok_or_else(|| Error::Type("leaf expected".into())))
        }
    }

    #[test]
    fn test_requires_some_min_event_ndims() {
        let err = Bijector::new(Cube, BijectorConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Value(_)));
        let b = Bijector::new(Cube, BijectorConfig { inverse_min_event_ndims: Some(Tree::Leaf(Some(1))), ..Default::default() })
            .unwrap();
        assert_eq!(b.forward_min_event_ndims(), &Tree::Leaf(Some(1)));
    }

    #[test]
    fn test_missing_primitive_is_not_implemented() {
        #[derive(Debug)]
        struct Nothing;
        impl BijectorImpl for Nothing {
            fn name(&self) -> &str {
                "nothing"
            }
        }
        let b = Bijector::new(Nothing, BijectorConfig::with_min_event_ndims(0)).unwrap();
        assert!(matches!(b.forward(&leaf(vec![1.0])), Err(Error::NotImplemented(_))));
        assert!(matches!(b.inverse(&leaf(vec![1.0])), Err(Error::NotImplemented(_))));
        assert!(matches!(b.is_increasing(), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn test_numeric_ldj_fallback() {
        let b = Bijector::new(Cube, BijectorConfig::with_min_event_ndims(0)).unwrap();
        let x = leaf(vec![0.5, 2.0]);
        let fldj = b.forward_log_det_jacobian(&x, None).unwrap().to_vec();
        assert_relative_eq!(fldj[0], (3.0 * 0.25f64).ln(), epsilon = 1e-5);
        assert_relative_eq!(fldj[1], 12.0f64.ln(), epsilon = 1e-5);

        let y = leaf(vec![8.0]);
        let ildj = b.inverse_log_det_jacobian(&y, None).unwrap().unique().unwrap();
        assert_relative_eq!(ildj.item().unwrap(), -(12.0f64).ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_numeric_fallback_only_for_scalar_transforms() {
        let b = Bijector::new(Cube, BijectorConfig::with_min_event_ndims(1)).unwrap();
        let err = b.forward_log_det_jacobian(&leaf(vec![1.0, 2.0]), None).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
    }

    #[test]
    fn test_ildj_after_forward_computes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let b = Bijector::new(CountingExp(Arc::clone(&calls)), BijectorConfig::with_min_event_ndims(0)).unwrap();
        let x = leaf(vec![0.1, 0.2]);
        let y = b.forward(&x).unwrap();
        let ildj = b.inverse_log_det_jacobian(&y, None).unwrap().unique().unwrap();
        let fldj = b.forward_log_det_jacobian(&x, None).unwrap();
        let again = b.inverse_log_det_jacobian(&y, None).unwrap().unique().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_relative_eq!(ildj.to_vec()[1], -0.2, epsilon = 1e-12);
        assert_eq!(fldj, ildj.neg());
        assert_eq!(again, ildj);
    }

    #[test]
    fn test_fldj_is_reduced_over_event_dims() {
        let b = Exp::bijector().unwrap();
        let x = Tree::Leaf(Tensor::from_shape_vec(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap());
        let full = b.forward_log_det_jacobian(&x, None).unwrap();
        assert_eq!(full.shape(), &[2, 3]);
        let reduced = b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(1))).unwrap();
        assert_eq!(reduced.to_vec(), vec![3.0, 12.0]);
        let err = b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(3)));
        assert!(matches!(err, Err(Error::Validation(_))));
        let err = b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(-1)));
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_constant_jacobian_broadcasts_before_reduction() {
        let b = Scale::bijector(Tensor::scalar(2.0)).unwrap();
        let x = Tree::Leaf(Tensor::zeros(&[4, 3]));
        let ldj = b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(1))).unwrap();
        assert_eq!(ldj.shape(), &[] as &[usize]);
        assert_relative_eq!(ldj.item().unwrap(), 3.0 * 2.0f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_non_injective_fldj_is_not_implemented() {
        let b = AbsoluteValue::bijector().unwrap();
        let err = b.forward_log_det_jacobian(&leaf(vec![1.0]), None).unwrap_err();
        assert!(matches!(err, Error::NotImplemented(_)));
        assert!(b.cache().is_empty());
    }

    #[test]
    fn test_dtype_checks() {
        let config = BijectorConfig { dtype: Some(Tree::Leaf(Some(DType::F32))), ..BijectorConfig::with_min_event_ndims(0) };
        let b = Bijector::new(Cube, config).unwrap();
        let err = b.forward(&leaf(vec![1.0])).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        let x = Tree::Leaf(Tensor::from_vec(vec![1.0]).cast(DType::F32));
        assert!(b.forward(&x).is_ok());
        assert_eq!(b.forward_dtype(None).unwrap(), Tree::Leaf(Some(DType::F32)));
        let err = b.forward_dtype(Some(&Tree::Leaf(Some(DType::F64)))).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn test_dtype_rule_cannot_change_structure() {
        #[derive(Debug)]
        struct Split;
        impl BijectorImpl for Split {
            fn name(&self) -> &str {
                "split"
            }
            fn forward_dtype(&self, input: &Tree<Option<DType>>) -> Result<Tree<Option<DType>>> {
                let d = input.as_leaf().copied().flatten();
                Ok(Tree::list_of([d, d]))
            }
        }
        let b = Bijector::new(Split, BijectorConfig::with_min_event_ndims(0)).unwrap();
        assert!(matches!(b.forward_dtype(None), Err(Error::NotImplemented(_))));
    }

    #[test]
    fn test_event_ndims_propagate() {
        let b = Exp::bijector().unwrap();
        assert_eq!(b.forward_event_ndims(&Tree::Leaf(2)).unwrap(), Tree::Leaf(2));
        assert!(b.inverse_event_ndims(&Tree::Leaf(-1)).is_err());
    }

    #[test]
    fn test_equality_by_parameters() {
        let a = Shift::bijector(Tensor::from_vec(vec![1.0, 2.0])).unwrap();
        let b = Shift::bijector(Tensor::from_vec(vec![1.0, 2.0])).unwrap();
        let c = Shift::bijector(Tensor::from_vec(vec![1.0, 3.0])).unwrap();
        let d = Scale::bijector(Tensor::from_vec(vec![1.0, 2.0])).unwrap();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_ne!(a, c);
        assert_ne!(a, d);

        let u1 = Bijector::new(Cube, BijectorConfig::with_min_event_ndims(0)).unwrap();
        let u2 = Bijector::new(Cube, BijectorConfig::with_min_event_ndims(0)).unwrap();
        assert_ne!(u1, u2, "transforms without parameters are unique");
        assert_eq!(u1, u1);
    }

    #[test]
    fn test_equality_includes_name_and_validation() {
        let base = Shift::bijector(1.0).unwrap();
        let renamed = Shift::bijector(1.0).unwrap().with_name("offset");
        let validated = Shift::bijector(1.0).unwrap().with_validate_args(true);
        assert_ne!(base, renamed);
        assert_ne!(base, validated);
        assert_ne!(hash_of(&base), hash_of(&renamed));
        assert_eq!(validated, Shift::bijector(1.0).unwrap().with_validate_args(true));
    }
}

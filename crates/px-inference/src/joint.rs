//! Joint distributions defined by a resumable model.
//!
//! A model is a pull-based driver: each call to [`ModelCoroutine::resume`]
//! receives the value drawn for the previously yielded distribution and
//! returns the next distribution (or [`Step::Done`]). The executor restarts
//! the model from the top on every `sample`/`log_prob` call; no driver state
//! is kept between calls.
//!
//! Distributions yielded as [`Yielded::Root`] receive the caller's full
//! `sample_shape`. Dependent distributions are sampled with an empty sample
//! shape, because their batch shape already carries the shape of the values
//! they were conditioned on.

use std::fmt;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use px_core::{Error, Result, Seed, SeedStream, Tensor, Tree, Value, sanitize_seed};
use px_prob::Distribution;
use serde::{Deserialize, Serialize};

const SEED_SALT: &str = "JointDistributionCoroutine";

/// A distribution handed out by a model, tagged with how it is sampled.
#[derive(Debug, Clone)]
pub enum Yielded {
    /// No parents; sampled with the caller's `sample_shape`.
    Root(Arc<dyn Distribution>),
    /// Conditioned on earlier values; sampled with an empty sample shape.
    Dependent(Arc<dyn Distribution>),
}

impl Yielded {
    /// Wrap a parentless distribution.
    pub fn root(d: impl Distribution + 'static) -> Self {
        Yielded::Root(Arc::new(d))
    }

    /// Wrap a conditional distribution.
    pub fn dependent(d: impl Distribution + 'static) -> Self {
        Yielded::Dependent(Arc::new(d))
    }

    /// The wrapped distribution.
    pub fn distribution(&self) -> &Arc<dyn Distribution> {
        match self {
            Yielded::Root(d) | Yielded::Dependent(d) => d,
        }
    }

    /// `true` for root distributions.
    pub fn is_root(&self) -> bool {
        matches!(self, Yielded::Root(_))
    }
}

/// Outcome of resuming a model.
#[derive(Debug, Clone)]
pub enum Step {
    /// The next distribution to draw from.
    Yield(Yielded),
    /// The model has no more distributions.
    Done,
}

/// A single run of a model.
///
/// The first call receives `None`; every later call receives the value drawn
/// for the distribution returned by the call before it.
pub trait ModelCoroutine: Send {
    /// Advance the model.
    fn resume(&mut self, sent: Option<Tensor>) -> Result<Step>;
}

/// One step of a [`SequentialModel`]: builds the next distribution from all
/// values drawn so far.
pub type ModelStep = Arc<dyn Fn(&[Tensor]) -> Result<Yielded> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    AwaitingFirstYield,
    Sampling(usize),
    Exhausted,
}

/// A model written as a list of steps, driven as an explicit state machine.
pub struct SequentialModel {
    steps: Arc<[ModelStep]>,
    values: Vec<Tensor>,
    state: DriverState,
}

impl SequentialModel {
    /// Start a fresh run over `steps`.
    pub fn new(steps: Arc<[ModelStep]>) -> Self {
        Self { steps, values: Vec::new(), state: DriverState::AwaitingFirstYield }
    }

    fn advance(&mut self, index: usize) -> Result<Step> {
        match self.steps.get(index) {
            Some(step) => {
                self.state = DriverState::Sampling(index);
                Ok(Step::Yield(step(&self.values)?))
            }
            None => {
                self.state = DriverState::Exhausted;
                Ok(Step::Done)
            }
        }
    }
}

impl fmt::Debug for SequentialModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialModel")
            .field("num_steps", &self.steps.len())
            .field("state", &self.state)
            .finish()
    }
}

impl ModelCoroutine for SequentialModel {
    fn resume(&mut self, sent: Option<Tensor>) -> Result<Step> {
        match self.state {
            DriverState::AwaitingFirstYield => {
                if sent.is_some() {
                    return Err(Error::Value("cannot send a value to a model that has not started".into()));
                }
                self.advance(0)
            }
            DriverState::Sampling(i) => {
                let value = sent.ok_or_else(|| Error::Value(format!("model resumed without a value for step {}", i)))?;
                self.values.push(value);
                self.advance(i + 1)
            }
            DriverState::Exhausted => Ok(Step::Done),
        }
    }
}

/// Supplies a fixed value for step `i`, or `None` to draw one.
type ValueSource<'a> = dyn Fn(usize, &dyn Distribution) -> Result<Option<Tensor>> + 'a;

/// Builds a fresh model run for every executor call.
pub type ModelFactory = Arc<dyn Fn() -> Box<dyn ModelCoroutine> + Send + Sync>;

/// Executor diagnostics and validation switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JointConfig {
    /// Check every drawn value against the requested sample shape.
    pub validate_args: bool,
    /// Emit a one-time warning when a distribution falls back to legacy seeds.
    pub warn_on_seed_fallback: bool,
}

impl Default for JointConfig {
    fn default() -> Self {
        Self { validate_args: false, warn_on_seed_fallback: true }
    }
}

/// A joint distribution over the values drawn while driving a model.
pub struct JointDistributionCoroutine {
    model: ModelFactory,
    sample_dtype: Option<Tree<px_core::DType>>,
    config: JointConfig,
    name: String,
    warned_seed_fallback: AtomicBool,
    names: OnceLock<Vec<String>>,
}

impl fmt::Debug for JointDistributionCoroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JointDistributionCoroutine")
            .field("name", &self.name)
            .field("sample_dtype", &self.sample_dtype)
            .field("config", &self.config)
            .finish()
    }
}

impl JointDistributionCoroutine {
    /// Executor over runs produced by `model`.
    pub fn new(model: ModelFactory) -> Self {
        Self {
            model,
            sample_dtype: None,
            config: JointConfig::default(),
            name: SEED_SALT.to_string(),
            warned_seed_fallback: AtomicBool::new(false),
            names: OnceLock::new(),
        }
    }

    /// Executor over a fixed list of steps.
    pub fn from_steps(steps: Vec<ModelStep>) -> Self {
        let steps: Arc<[ModelStep]> = steps.into();
        Self::new(Arc::new(move || Box::new(SequentialModel::new(Arc::clone(&steps))) as Box<dyn ModelCoroutine>))
    }

    /// Structure results like `template` instead of a named record.
    pub fn with_sample_dtype(mut self, template: Tree<px_core::DType>) -> Self {
        self.sample_dtype = Some(template);
        self.names = OnceLock::new();
        self
    }

    /// Replace the executor configuration.
    pub fn with_config(mut self, config: JointConfig) -> Self {
        self.config = config;
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

    /// Executor configuration.
    pub fn config(&self) -> &JointConfig {
        &self.config
    }

    /// Output structure template, if one was given.
    pub fn sample_dtype(&self) -> Option<&Tree<px_core::DType>> {
        self.sample_dtype.as_ref()
    }

    /// Draw one joint sample of shape `sample_shape` for every root.
    pub fn sample(&self, sample_shape: &[usize], seed: Option<&Seed>) -> Result<Value> {
        self.sample_with_values(sample_shape, seed, &[])
    }

    /// Draw a joint sample, substituting `values[i]` for step `i` where given.
    pub fn sample_with_values(
        &self,
        sample_shape: &[usize],
        seed: Option<&Seed>,
        values: &[Option<Tensor>],
    ) -> Result<Value> {
        let (ds, xs) = self.flat_sample_distributions(sample_shape, seed, values)?;
        self.unflatten_as(&ds, xs)
    }

    /// The distributions built during a sampling run, alongside the values.
    pub fn sample_distributions(
        &self,
        sample_shape: &[usize],
        seed: Option<&Seed>,
        values: &[Option<Tensor>],
    ) -> Result<(Tree<Arc<dyn Distribution>>, Value)> {
        let (ds, xs) = self.flat_sample_distributions(sample_shape, seed, values)?;
        let xs = self.unflatten_as(&ds, xs)?;
        Ok((self.unflatten_as(&ds, ds.clone())?, xs))
    }

    /// Per-step log densities of `value`, in the same structure as samples.
    pub fn log_prob_parts(&self, value: &Value) -> Result<Tree<Tensor>> {
        let (ds, parts) = self.flat_log_prob_parts(value)?;
        self.unflatten_as(&ds, parts)
    }

    /// Joint log density: the broadcast sum of every step's log density.
    pub fn log_prob(&self, value: &Value) -> Result<Tensor> {
        let (_, parts) = self.flat_log_prob_parts(value)?;
        parts.iter().try_fold(Tensor::scalar(0.0), |acc, lp| acc.add(lp))
    }

    /// Replays the model on `value` without drawing anything.
    fn flat_log_prob_parts(&self, value: &Value) -> Result<(Vec<Arc<dyn Distribution>>, Vec<Tensor>)> {
        let (ds, xs) = match (&self.sample_dtype, value) {
            (None, Tree::Dict(_) | Tree::Record(_)) => self.flatten_by_name(value)?,
            _ => {
                let given = self.model_flatten(value)?;
                let supply = |i: usize, _: &dyn Distribution| -> Result<Option<Tensor>> {
                    given.get(i).cloned().map(Some).ok_or_else(|| {
                        Error::Value(format!("model yielded more distributions than the {} values given", given.len()))
                    })
                };
                let (ds, xs) = self.drive(&[], None, &supply, false)?;
                if ds.len() != given.len() {
                    return Err(Error::Value(format!(
                        "model yielded {} distributions for {} values",
                        ds.len(),
                        given.len()
                    )));
                }
                (ds, xs)
            }
        };
        let parts = ds.iter().zip(&xs).map(|(d, x)| d.log_prob(x)).collect::<Result<Vec<_>>>()?;
        Ok((ds, parts))
    }

    /// Batch shape of every step, in the same structure as samples.
    pub fn batch_shapes(&self) -> Result<Tree<Vec<usize>>> {
        let ds = self.single_sample_distributions()?;
        self.unflatten_as(&ds, ds.iter().map(|d| d.batch_shape()).collect())
    }

    /// Event shape of every step, in the same structure as samples.
    pub fn event_shapes(&self) -> Result<Tree<Vec<usize>>> {
        let ds = self.single_sample_distributions()?;
        self.unflatten_as(&ds, ds.iter().map(|d| d.event_shape()).collect())
    }

    /// Name of every step.
    ///
    /// An explicit distribution name wins, then the key at that position of a
    /// `Dict`/`Record` template, then `var{index}`. Names are computed once
    /// per executor.
    pub fn resolve_names(&self) -> Result<Vec<String>> {
        if let Some(names) = self.names.get() {
            return Ok(names.clone());
        }
        let ds = self.single_sample_distributions()?;
        Ok(self.names_from(&ds))
    }

    /// Structure flat per-step results like samples.
    pub fn model_unflatten<T>(&self, xs: Vec<T>) -> Result<Tree<T>> {
        match &self.sample_dtype {
            Some(template) => template.pack_sequence_as(xs),
            None => record_with_names(self.resolve_names()?, xs),
        }
    }

    /// Flatten a structured value into per-step tensors.
    ///
    /// Without a template, named values are matched to steps by name and
    /// positional values are taken in order.
    pub fn model_flatten(&self, value: &Value) -> Result<Vec<Tensor>> {
        if let Some(template) = &self.sample_dtype {
            template.assert_same_structure(value)?;
            return Ok(value.flatten().into_iter().cloned().collect());
        }
        match value {
            Tree::Dict(_) | Tree::Record(_) => Ok(self.flatten_by_name(value)?.1),
            Tree::List(parts) => parts
                .iter()
                .enumerate()
                .map(|(i, p)| p.as_leaf().cloned().ok_or_else(|| Error::Value(format!("part {} is not a tensor", i))))
                .collect(),
            Tree::Leaf(x) => Ok(vec![x.clone()]),
        }
    }

    /// Drive the model, feeding each step the value stored under its name.
    fn flatten_by_name(&self, value: &Value) -> Result<(Vec<Arc<dyn Distribution>>, Vec<Tensor>)> {
        let supply = |i: usize, d: &dyn Distribution| -> Result<Option<Tensor>> {
            let name = step_name(i, d, None);
            value
                .get(&name)
                .and_then(Tree::as_leaf)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::Value(format!("no value named `{}`", name)))
        };
        let (ds, xs) = self.drive(&[], None, &supply, false)?;
        self.names_from(&ds);
        Ok((ds, xs))
    }

    /// Structure per-step results using the names of the run that built `ds`.
    fn unflatten_as<T>(&self, ds: &[Arc<dyn Distribution>], xs: Vec<T>) -> Result<Tree<T>> {
        match &self.sample_dtype {
            Some(template) => template.pack_sequence_as(xs),
            None => record_with_names(self.names_from(ds), xs),
        }
    }

    fn names_from(&self, ds: &[Arc<dyn Distribution>]) -> Vec<String> {
        if let Some(names) = self.names.get() {
            if names.len() == ds.len() {
                return names.clone();
            }
        }
        let template_names = self.sample_dtype.as_ref().map(flat_template_names);
        let names: Vec<String> =
            ds.iter().enumerate().map(|(i, d)| step_name(i, d.as_ref(), template_names.as_deref())).collect();
        let _ = self.names.set(names.clone());
        names
    }

    /// One silent run under a fixed legacy seed. Distributions that only
    /// accept integer seeds take the stateful path without a warning.
    fn single_sample_distributions(&self) -> Result<Vec<Arc<dyn Distribution>>> {
        let draw = |_: usize, _: &dyn Distribution| -> Result<Option<Tensor>> { Ok(None) };
        Ok(self.drive(&[], Some(&Seed::Stateful(0)), &draw, false)?.0)
    }

    fn flat_sample_distributions(
        &self,
        sample_shape: &[usize],
        seed: Option<&Seed>,
        values: &[Option<Tensor>],
    ) -> Result<(Vec<Arc<dyn Distribution>>, Vec<Tensor>)> {
        let supply = |i: usize, _: &dyn Distribution| -> Result<Option<Tensor>> { Ok(values.get(i).cloned().flatten()) };
        self.drive(sample_shape, seed, &supply, self.config.warn_on_seed_fallback)
    }

    /// Drive one run of the model. `supply` returns a fixed value for a step
    /// or `None` to draw one.
    fn drive(
        &self,
        sample_shape: &[usize],
        seed: Option<&Seed>,
        supply: &ValueSource<'_>,
        warn_on_fallback: bool,
    ) -> Result<(Vec<Arc<dyn Distribution>>, Vec<Tensor>)> {
        let mut seed_stream = match seed {
            Some(Seed::Stateful(s)) => Some(SeedStream::new(*s, SEED_SALT)),
            _ => None,
        };
        let mut key = sanitize_seed(seed, SEED_SALT);

        let mut run = (self.model)();
        let mut step = run.resume(None)?;
        if let Step::Yield(y) = &step {
            if !y.is_root() {
                return Err(Error::Value("first distribution yielded by coroutine must be wrapped in `Root`".into()));
            }
        }

        let mut ds = Vec::new();
        let mut xs = Vec::new();
        while let Step::Yield(yielded) = step {
            let index = ds.len();
            let d = Arc::clone(yielded.distribution());
            let stateful_seed = seed_stream.as_mut().map(SeedStream::next_seed);
            let (sample_key, rest) = key.split2();
            key = rest;
            let shape: &[usize] = if yielded.is_root() { sample_shape } else { &[] };

            let x = match supply(index, d.as_ref())? {
                Some(v) => v,
                None => match stateful_seed {
                    Some(s) if !d.accepts_stateless_seed() => {
                        if warn_on_fallback {
                            self.warn_seed_fallback(index, d.as_ref());
                        }
                        d.sample(shape, &Seed::Stateful(s))?
                    }
                    _ => d.sample(shape, &Seed::Stateless(sample_key))?,
                },
            };
            if self.config.validate_args {
                check_sample_shape(index, sample_shape, &x)?;
            }
            log::trace!("{}: step {} drew shape {:?}", self.name, index, x.shape());

            ds.push(d);
            xs.push(x.clone());
            step = run.resume(Some(x))?;
        }
        Ok((ds, xs))
    }

    fn warn_seed_fallback(&self, index: usize, d: &dyn Distribution) {
        if self.warned_seed_fallback.swap(true, Ordering::Relaxed) {
            return;
        }
        let component = d.explicit_name().map_or_else(|| "[None specified]".to_string(), |n| format!("\"{}\"", n));
        log::warn!(
            "falling back to stateful sampling for distribution #{} (0-based) with component name {} and name \"{}\"; \
             this distribution does not accept stateless seeds",
            index,
            component,
            d.name()
        );
    }
}

fn step_name(index: usize, d: &dyn Distribution, template_names: Option<&[Option<String>]>) -> String {
    match d.explicit_name() {
        Some(name) => name.to_string(),
        None => template_names
            .and_then(|names| names.get(index).cloned().flatten())
            .unwrap_or_else(|| format!("var{}", index)),
    }
}

fn record_with_names<T>(names: Vec<String>, xs: Vec<T>) -> Result<Tree<T>> {
    if names.len() != xs.len() {
        return Err(Error::Value(format!("expected {} parts, got {}", names.len(), xs.len())));
    }
    Ok(Tree::record_of(names.into_iter().zip(xs)))
}

/// Names at the top level of a `Dict`/`Record` template, one per leaf.
fn flat_template_names(template: &Tree<px_core::DType>) -> Vec<Option<String>> {
    match template {
        Tree::Dict(_) | Tree::Record(_) => template
            .keys()
            .into_iter()
            .flat_map(|k| {
                let n = template.get(k).map_or(0, Tree::num_leaves);
                let name = if n == 1 { Some(k.to_string()) } else { None };
                std::iter::repeat_n(name, n)
            })
            .collect(),
        _ => vec![None; template.num_leaves()],
    }
}

/// Leading dims of `x` must equal `sample_shape`.
fn check_sample_shape(index: usize, sample_shape: &[usize], x: &Tensor) -> Result<()> {
    let shape = x.shape();
    if shape.len() < sample_shape.len() || &shape[..sample_shape.len()] != sample_shape {
        return Err(Error::Value(format!(
            "samples yielded by distribution #{} are not consistent with `sample_shape` {:?} passed to \
             `JointDistributionCoroutine`; saw shape {:?}",
            index, sample_shape, shape
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use px_core::SeedKey;
    use px_prob::exponential::Exponential;
    use px_prob::normal::Normal;

    fn step(f: impl Fn(&[Tensor]) -> Result<Yielded> + Send + Sync + 'static) -> ModelStep {
        Arc::new(f)
    }

    fn two_normals() -> JointDistributionCoroutine {
        JointDistributionCoroutine::from_steps(vec![
            step(|_| Ok(Yielded::root(Normal::new(0.0, 1.0)?))),
            step(|prev| Ok(Yielded::dependent(Normal::new(prev[0].clone(), 0.5)?))),
        ])
    }

    #[test]
    fn test_sequential_model_state_machine() {
        let steps: Arc<[ModelStep]> = vec![step(|_| Ok(Yielded::root(Normal::new(0.0, 1.0)?)))].into();
        let mut m = SequentialModel::new(steps);
        assert!(m.resume(Some(Tensor::scalar(0.0))).is_err());
        assert!(matches!(m.resume(None).unwrap(), Step::Yield(Yielded::Root(_))));
        assert!(m.resume(None).is_err(), "a started model needs the drawn value");
        assert!(matches!(m.resume(Some(Tensor::scalar(0.0))).unwrap(), Step::Done));
        assert!(matches!(m.resume(None).unwrap(), Step::Done));
    }

    #[test]
    fn test_default_names_and_record_output() {
        let jd = two_normals();
        assert_eq!(jd.resolve_names().unwrap(), vec!["var0", "var1"]);
        let x = jd.sample(&[3], Some(&Seed::Stateless(SeedKey::from_u64(1)))).unwrap();
        assert_eq!(x.keys(), vec!["var0", "var1"]);
        assert_eq!(x.get("var1").unwrap().as_leaf().unwrap().shape(), &[3]);
    }

    #[test]
    fn test_explicit_names_win() {
        let jd = JointDistributionCoroutine::from_steps(vec![
            step(|_| Ok(Yielded::root(Normal::new(0.0, 1.0)?.with_name("mu")))),
            step(|prev| Ok(Yielded::dependent(Normal::new(prev[0].clone(), 1.0)?))),
        ]);
        assert_eq!(jd.resolve_names().unwrap(), vec!["mu", "var1"]);
    }

    #[test]
    fn test_template_structures_output() {
        let template = Tree::List(vec![Tree::Leaf(px_core::DType::F64), Tree::Leaf(px_core::DType::F64)]);
        let jd = two_normals().with_sample_dtype(template);
        let x = jd.sample(&[], Some(&Seed::Stateless(SeedKey::from_u64(2)))).unwrap();
        assert!(matches!(x, Tree::List(ref parts) if parts.len() == 2));
        assert_eq!(jd.model_flatten(&x).unwrap().len(), 2);
    }

    #[test]
    fn test_partial_values_are_substituted() {
        let jd = two_normals();
        let fixed = Tensor::from_vec(vec![10.0, 20.0]);
        let x = jd
            .sample_with_values(&[2], Some(&Seed::Stateless(SeedKey::from_u64(3))), &[Some(fixed.clone()), None])
            .unwrap();
        assert_eq!(x.get("var0").unwrap().as_leaf().unwrap(), &fixed);
        let g = x.get("var1").unwrap().as_leaf().unwrap().to_vec();
        assert!((g[0] - 10.0).abs() < 5.0 && (g[1] - 20.0).abs() < 5.0);
    }

    #[test]
    fn test_validation_names_offending_step() {
        // The dependent step ignores the root's sample shape.
        let jd = JointDistributionCoroutine::from_steps(vec![
            step(|_| Ok(Yielded::root(Normal::new(0.0, 1.0)?))),
            step(|_| Ok(Yielded::dependent(Normal::new(0.0, 1.0)?))),
        ])
        .with_config(JointConfig { validate_args: true, ..JointConfig::default() });
        let err = jd.sample(&[4], Some(&Seed::Stateless(SeedKey::from_u64(5)))).unwrap_err();
        match err {
            Error::Value(msg) => assert!(msg.contains("#1"), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stateless_seed_reproducible() {
        let jd = two_normals();
        let seed = Seed::Stateless(SeedKey::from_u64(11));
        assert_eq!(jd.sample(&[2], Some(&seed)).unwrap(), jd.sample(&[2], Some(&seed)).unwrap());
        let legacy = Seed::Stateful(11);
        assert_eq!(jd.sample(&[2], Some(&legacy)).unwrap(), jd.sample(&[2], Some(&legacy)).unwrap());
    }

    #[test]
    fn test_legacy_distribution_with_stateless_seed_fails() {
        let jd = JointDistributionCoroutine::from_steps(vec![step(|_| {
            Ok(Yielded::root(Exponential::new(1.0)?.with_legacy_seeds_only()))
        })]);
        let err = jd.sample(&[], Some(&Seed::Stateless(SeedKey::from_u64(1)))).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
    }

    #[test]
    fn test_log_prob_by_name() {
        let jd = two_normals();
        let value = Tree::dict_of([("var1", Tensor::scalar(0.5)), ("var0", Tensor::scalar(0.0))]);
        let lp = jd.log_prob(&value).unwrap().item().unwrap();
        let expected = px_prob::normal::logpdf(0.0, 0.0, 1.0).unwrap() + px_prob::normal::logpdf(0.5, 0.0, 0.5).unwrap();
        assert!((lp - expected).abs() < 1e-12);
    }

    #[test]
    fn test_config_json_defaults() {
        let cfg: JointConfig = serde_json::from_str(r#"{"validate_args": true}"#).unwrap();
        assert!(cfg.validate_args);
        assert!(cfg.warn_on_seed_fallback);
    }
}

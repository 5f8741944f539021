//! Contract tests across the public bijector surface.
//!
//! Covers:
//! - inverse(forward(x)) == x and fldj(x) == -ildj(forward(x)) for every injective transform
//! - reduction rank/shape examples
//! - the unreduced LDJ is computed at most once per cached pair
//! - non-injective inverses and their LDJ branches
//! - call dispatch over values, distributions, transforms and chains
//! - transforms with call-time minimal ranks that own the reduced LDJ path
//! - reduction plans over partially known shapes

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use approx::assert_relative_eq;
use px_core::{Error, Result, Seed, SeedKey, Tensor, Tree, Value};
use px_prob::chain::Chain;
use px_prob::normal::Normal;
use px_prob::shape::{PendingCheck, known, reduction_rank, reduction_shape};
use px_prob::transforms::{AbsoluteValue, Exp, Identity, JointMap, Reshape, Scale, Shift, Sigmoid, Softplus};
use px_prob::{Applied, Bijector, BijectorConfig, BijectorImpl, Distribution, Kwargs, TransformedDistribution};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn leaf(t: Tensor) -> Value {
    Tree::Leaf(t)
}

fn random_leaf(rng: &mut StdRng, shape: &[usize], lo: f64, hi: f64) -> Value {
    let n: usize = shape.iter().product();
    let xs = (0..n).map(|_| rng.random_range(lo..hi)).collect();
    leaf(Tensor::from_shape_vec(shape, xs).unwrap())
}

fn injective_transforms() -> Vec<(Bijector, f64, f64)> {
    vec![
        (Identity::bijector().unwrap(), -3.0, 3.0),
        (Exp::bijector().unwrap(), -3.0, 3.0),
        (Shift::bijector(Tensor::from_vec(vec![1.0, -2.0, 0.5])).unwrap(), -3.0, 3.0),
        (Scale::bijector(Tensor::from_vec(vec![2.0, -0.5, 3.0])).unwrap(), -3.0, 3.0),
        (Softplus::bijector().unwrap(), -3.0, 3.0),
        (Sigmoid::bijector(-1.0, 2.0).unwrap(), -3.0, 3.0),
        (Reshape::bijector(vec![3], vec![3]).unwrap(), -3.0, 3.0),
    ]
}

/// Exp whose only LDJ primitive is the inverse one, with a call counter.
#[derive(Debug)]
struct CountedExp(Arc<AtomicUsize>);

impl BijectorImpl for CountedExp {
    fn name(&self) -> &str {
        "counted_exp"
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(x.map(|t| t.map(f64::exp)))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(y.map(|t| t.map(f64::ln)))
    }

    fn inverse_log_det_jacobian(&self, y: &Value, _kwargs: &Kwargs) -> Option<Result<Tensor>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Some(Ok(y.as_leaf()?.map(|v| -v.ln())))
    }
}

// ---------------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------------

#[test]
fn test_round_trip_law() {
    let mut rng = StdRng::seed_from_u64(17);
    for (b, lo, hi) in injective_transforms() {
        for _ in 0..5 {
            let x = random_leaf(&mut rng, &[4, 3], lo, hi);
            let y = b.forward(&x).unwrap();
            let fresh = leaf(Tensor::from_shape_vec(&[4, 3], y.as_leaf().unwrap().to_vec()).unwrap());
            let back = b.inverse_unique(&fresh).unwrap();
            for (a, e) in back.as_leaf().unwrap().to_vec().iter().zip(x.as_leaf().unwrap().to_vec()) {
                assert_relative_eq!(*a, e, epsilon = 1e-9, max_relative = 1e-9);
            }
        }
    }
}

#[test]
fn test_fldj_is_minus_ildj_of_image() {
    let mut rng = StdRng::seed_from_u64(23);
    for (b, lo, hi) in injective_transforms() {
        let x = random_leaf(&mut rng, &[4, 3], lo, hi);
        let y = b.forward(&x).unwrap();
        let fresh = leaf(Tensor::from_shape_vec(&[4, 3], y.as_leaf().unwrap().to_vec()).unwrap());
        let event_ndims = Tree::Leaf(1);
        let fldj = b.forward_log_det_jacobian(&x, Some(&event_ndims)).unwrap();
        let ildj = b.inverse_log_det_jacobian(&fresh, Some(&event_ndims)).unwrap().unique().unwrap();
        let fldj = fldj.broadcast_to(&[4]).unwrap().to_vec();
        let ildj = ildj.broadcast_to(&[4]).unwrap().to_vec();
        for (f, i) in fldj.iter().zip(&ildj) {
            assert_relative_eq!(*f, -i, epsilon = 1e-8, max_relative = 1e-8);
        }
    }
}

#[test]
fn test_reduction_examples() {
    let a = Tree::dict_of([("a", 2), ("b", 3)]);
    assert_eq!(reduction_rank(&a, &Tree::dict_of([("a", 1), ("b", 2)])).unwrap(), 1);
    let err = reduction_rank(&a, &Tree::dict_of([("a", 1), ("b", 3)])).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let r = reduction_shape(&Tree::Leaf(known(&[1, 2, 3, 4])), &Tree::Leaf(2), &Tree::Leaf(1), None, false, true)
        .unwrap();
    assert_eq!(r.shape, known(&[3]));
}

#[test]
fn test_unreduced_ldj_computed_at_most_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let b = Bijector::new(CountedExp(Arc::clone(&calls)), BijectorConfig::with_min_event_ndims(0)).unwrap();
    let x = leaf(Tensor::from_vec(vec![0.5, 1.5, -1.0]));
    let y = b.forward(&x).unwrap();
    let ildj = b.inverse_log_det_jacobian(&y, None).unwrap().unique().unwrap();
    let ildj_reduced = b.inverse_log_det_jacobian(&y, Some(&Tree::Leaf(1))).unwrap().unique().unwrap();
    let fldj = b.forward_log_det_jacobian(&x, None).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_relative_eq!(ildj_reduced.item().unwrap(), -1.0, epsilon = 1e-12);
    assert_eq!(fldj.to_vec(), ildj.neg().to_vec());

    // Different call options are a different cache key.
    let mut kwargs = Kwargs::new();
    kwargs.insert("tag".into(), px_prob::ParamValue::Int(1));
    b.inverse_log_det_jacobian_with(&y, None, &kwargs).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_non_injective_branches() {
    let b = AbsoluteValue::bijector().unwrap();
    let y = leaf(Tensor::from_vec(vec![1.5, 3.0]));
    let xs = b.inverse(&y).unwrap().branches();
    assert_eq!(xs.len(), 2);
    assert_eq!(xs[0].as_leaf().unwrap().to_vec(), vec![-1.5, -3.0]);
    assert_eq!(xs[1].as_leaf().unwrap().to_vec(), vec![1.5, 3.0]);

    let ildj = b.inverse_log_det_jacobian(&y, None).unwrap().branches();
    assert_eq!(ildj.len(), 2);
    assert_eq!(ildj[0], ildj[1]);
    assert!(b.cache().is_empty(), "non-injective transforms never touch the cache");

    let err = b.forward_log_det_jacobian(&y, None).unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
}

// ---------------------------------------------------------------------------
// Call dispatch
// ---------------------------------------------------------------------------

#[test]
fn test_apply_to_value_is_forward() {
    let exp = Arc::new(Exp::bijector().unwrap());
    match exp.apply(Tensor::from_vec(vec![0.0])).unwrap() {
        Applied::Value(v) => assert_eq!(v.as_leaf().unwrap().to_vec(), vec![1.0]),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_apply_to_distribution_and_transformed() {
    let exp = Arc::new(Exp::bijector().unwrap());
    let base: Arc<dyn Distribution> = Arc::new(Normal::new(0.0, 1.0).unwrap());
    let td = match exp.apply(Arc::clone(&base)).unwrap() {
        Applied::Distribution(td) => td,
        other => panic!("unexpected {:?}", other),
    };
    assert!(Arc::ptr_eq(td.distribution(), &base));

    let scale = Arc::new(Scale::bijector(2.0).unwrap());
    let td: Arc<dyn Distribution> = Arc::new(td);
    let composed = match scale.apply(td).unwrap() {
        Applied::Distribution(d) => d,
        other => panic!("unexpected {:?}", other),
    };
    assert!(Arc::ptr_eq(composed.distribution(), &base), "re-wraps the base distribution");
    let chain = composed.bijector().as_chain().expect("bijector is a chain");
    assert_eq!(chain.bijectors().len(), 2);

    // Y = 2 exp(X)
    let direct = TransformedDistribution::new(
        Arc::clone(&base),
        Arc::new(
            Chain::bijector(vec![Arc::new(Scale::bijector(2.0).unwrap()), Arc::new(Exp::bijector().unwrap())], false, None)
                .unwrap(),
        ),
    )
    .unwrap();
    let y = Tensor::from_vec(vec![0.5, 3.0]);
    assert_eq!(composed.log_prob(&y).unwrap(), direct.log_prob(&y).unwrap());
}

#[test]
fn test_apply_to_bijector_and_chain() {
    let exp = Arc::new(Exp::bijector().unwrap());
    let shift = Arc::new(Shift::bijector(1.0).unwrap());
    let two = match exp.apply(Arc::clone(&shift)).unwrap() {
        Applied::Bijector(b) => b,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(two.as_chain().unwrap().bijectors().len(), 2);
    let y = two.forward(&leaf(Tensor::scalar(-1.0))).unwrap();
    assert_relative_eq!(y.as_leaf().unwrap().item().unwrap(), 1.0);

    let chain = Arc::new(
        Chain::bijector(vec![Arc::clone(&shift)], true, Some("shifted".into())).unwrap(),
    );
    let three = match exp.apply(Arc::clone(&chain)).unwrap() {
        Applied::Bijector(b) => b,
        other => panic!("unexpected {:?}", other),
    };
    let parts = three.as_chain().unwrap().bijectors();
    assert_eq!(parts.len(), 2, "prepends to the chain instead of nesting it");
    assert_eq!(parts[0], exp);
    assert!(three.validate_args());
    assert_eq!(three.name(), "shifted");
}

// ---------------------------------------------------------------------------
// Structured values
// ---------------------------------------------------------------------------

#[test]
fn test_joint_map_sample_and_density() {
    let parts = Tree::dict_of([
        ("scale", Arc::new(Softplus::bijector().unwrap())),
        ("loc", Arc::new(Identity::bijector().unwrap())),
    ]);
    let b = JointMap::bijector(parts).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let x = Tree::dict_of([
        ("scale", Tensor::from_vec((0..4).map(|_| rng.random_range(-2.0..2.0)).collect())),
        ("loc", Tensor::from_vec(vec![0.0; 4])),
    ]);
    let y = b.forward(&x).unwrap();
    let back = b.inverse_unique(&y).unwrap();
    assert!(back.get("scale").unwrap().as_leaf().unwrap().same_storage(x.get("scale").unwrap().as_leaf().unwrap()));

    let fldj = b.forward_log_det_jacobian(&x, Some(&Tree::dict_of([("scale", 1), ("loc", 1)]))).unwrap();
    let ildj = b.inverse_log_det_jacobian(&y, Some(&Tree::Leaf(1))).unwrap().unique().unwrap();
    assert_relative_eq!(fldj.item().unwrap(), -ildj.item().unwrap(), epsilon = 1e-12);

    let err = b.forward_log_det_jacobian(&x, Some(&Tree::dict_of([("scale", 1), ("loc", 0)])));
    assert!(matches!(err, Err(Error::Validation(_))));
}

#[test]
fn test_sampling_through_transformed_distribution_is_seeded() {
    let base: Arc<dyn Distribution> = Arc::new(Normal::new(Tensor::zeros(&[3]), 1.0).unwrap());
    let td = TransformedDistribution::new(base, Arc::new(Softplus::bijector().unwrap())).unwrap();
    let seed = Seed::Stateless(SeedKey::from_u64(99));
    let a = td.sample(&[5], &seed).unwrap();
    let b = td.sample(&[5], &seed).unwrap();
    assert_eq!(a.shape(), &[5, 3]);
    assert_eq!(a, b);
    assert!(a.to_vec().iter().all(|&v| v > 0.0));
}

// ---------------------------------------------------------------------------
// Unknown minimal ranks and partial shapes
// ---------------------------------------------------------------------------

/// Exp whose minimal rank is only known at call time; it reduces its own LDJ.
#[derive(Debug)]
struct DynamicRankExp;

impl DynamicRankExp {
    fn reduce(t: &Tensor, event_ndims: &Tree<i64>) -> Result<Tensor> {
        let n = *event_ndims.as_leaf().ok_or_else(|| Error::Type("expected a leaf rank".into()))?;
        t.sum_trailing(n as usize)
    }
}

impl BijectorImpl for DynamicRankExp {
    fn name(&self) -> &str {
        "dynamic_rank_exp"
    }

    fn forward(&self, x: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(x.map(|t| t.map(f64::exp)))
    }

    fn inverse(&self, y: &Value, _kwargs: &Kwargs) -> Result<Value> {
        Ok(y.map(|t| t.map(f64::ln)))
    }

    fn forward_log_det_jacobian_reduced(
        &self,
        x: &Value,
        event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        let t = x.as_leaf()?;
        Some(Self::reduce(t, event_ndims))
    }

    fn inverse_log_det_jacobian_reduced(
        &self,
        y: &Value,
        event_ndims: &Tree<i64>,
        _kwargs: &Kwargs,
    ) -> Option<Result<Tensor>> {
        let t = y.as_leaf()?;
        Some(Self::reduce(&t.map(|v| -v.ln()), event_ndims))
    }
}

#[test]
fn test_unknown_min_rank_uses_reduced_override() {
    let b = Bijector::new(
        DynamicRankExp,
        BijectorConfig::with_min_event_ndims_pair(Tree::Leaf(None), Tree::Leaf(None)),
    )
    .unwrap();
    let x = leaf(Tensor::from_shape_vec(&[2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap());

    let fldj = b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(1))).unwrap();
    assert_eq!(fldj.to_vec(), vec![3.0, 12.0]);

    let y = b.forward(&x).unwrap();
    let ildj = b.inverse_log_det_jacobian(&y, Some(&Tree::Leaf(1))).unwrap().unique().unwrap();
    for (a, e) in ildj.to_vec().iter().zip([-3.0, -12.0]) {
        assert_relative_eq!(*a, e, epsilon = 1e-12);
    }

    // Without an explicit rank there is nothing to fall back on.
    assert!(matches!(b.forward_log_det_jacobian(&x, None), Err(Error::NotImplemented(_))));
    assert!(matches!(b.forward_log_det_jacobian(&x, Some(&Tree::Leaf(-1))), Err(Error::Validation(_))));
}

#[test]
fn test_reduction_plan_defers_unknown_dims() {
    let b = Scale::bijector(Tensor::from_vec(vec![2.0, 0.5, 3.0])).unwrap().with_validate_args(true);
    let partial = Tree::Leaf(vec![None, None]);
    let plan = b.forward_ldj_reduction(&partial, &Tree::Leaf(1)).unwrap();
    assert_eq!(plan.shape, vec![None]);
    assert!(matches!(plan.pending.as_slice(), [PendingCheck::ParameterBatchCompatible { .. }]));

    assert_eq!(plan.resolve(&Tree::Leaf(vec![4, 3]), 1).unwrap(), vec![3]);
    assert!(matches!(plan.resolve(&Tree::Leaf(vec![4, 5]), 1), Err(Error::Validation(_))));

    // Concrete inputs run the same check eagerly.
    let bad = leaf(Tensor::zeros(&[4, 5]));
    assert!(matches!(b.forward_log_det_jacobian(&bad, Some(&Tree::Leaf(1))), Err(Error::Validation(_))));
    let good = leaf(Tensor::zeros(&[4, 3]));
    let ldj = b.forward_log_det_jacobian(&good, Some(&Tree::Leaf(1))).unwrap();
    assert!(ldj.to_vec().iter().all(|v| (v - 3.0f64.ln()).abs() < 1e-12));

    // Without validation nothing is deferred.
    let unchecked = Scale::bijector(Tensor::from_vec(vec![2.0, 0.5, 3.0])).unwrap();
    assert!(unchecked.forward_ldj_reduction(&partial, &Tree::Leaf(1)).unwrap().pending.is_empty());
}

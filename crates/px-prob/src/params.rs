//! Constructor parameters and call options.
//!
//! Bijector equality and hashing are defined over [`Parameters`]. Floats and
//! tensors compare by bit pattern (after folding `-0.0` into `0.0`), so `Eq`
//! and `Hash` agree even for NaN entries.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use px_core::Tensor;

use crate::bijector::Bijector;
use crate::distribution::Distribution;

/// A single parameter value.
#[derive(Debug, Clone)]
pub enum ParamValue {
    /// Scalar float.
    Float(f64),
    /// Integer.
    Int(i64),
    /// Boolean flag.
    Bool(bool),
    /// String.
    Str(String),
    /// Array-valued parameter.
    Tensor(Tensor),
    /// Sequence of parameters.
    List(Vec<ParamValue>),
    /// Nested bijector (compared structurally).
    Bijector(Arc<Bijector>),
    /// Nested distribution (compared by identity).
    Distribution(Arc<dyn Distribution>),
}

/// Named constructor parameters.
pub type Parameters = BTreeMap<String, ParamValue>;

/// Named call-time options forwarded to bijector primitives.
pub type Kwargs = BTreeMap<String, ParamValue>;

fn norm_bits(x: f64) -> u64 {
    if x == 0.0 { 0.0f64.to_bits() } else { x.to_bits() }
}

fn tensor_bits_eq(a: &Tensor, b: &Tensor) -> bool {
    a.dtype() == b.dtype()
        && a.shape() == b.shape()
        && a.array().iter().zip(b.array().iter()).all(|(x, y)| norm_bits(*x) == norm_bits(*y))
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        use ParamValue::*;
        match (self, other) {
            (Float(a), Float(b)) => norm_bits(*a) == norm_bits(*b),
            (Int(a), Int(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Tensor(a), Tensor(b)) => tensor_bits_eq(a, b),
            (List(a), List(b)) => a == b,
            (Bijector(a), Bijector(b)) => a == b,
            (Distribution(a), Distribution(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for ParamValue {}

impl Hash for ParamValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            ParamValue::Float(x) => norm_bits(*x).hash(state),
            ParamValue::Int(x) => x.hash(state),
            ParamValue::Bool(x) => x.hash(state),
            ParamValue::Str(x) => x.hash(state),
            ParamValue::Tensor(t) => t.hash_contents(state),
            ParamValue::List(xs) => xs.hash(state),
            ParamValue::Bijector(b) => b.hash(state),
            ParamValue::Distribution(d) => (Arc::as_ptr(d) as *const () as usize).hash(state),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(x: f64) -> Self {
        ParamValue::Float(x)
    }
}

impl From<Tensor> for ParamValue {
    fn from(t: Tensor) -> Self {
        ParamValue::Tensor(t)
    }
}

impl From<Arc<Bijector>> for ParamValue {
    fn from(b: Arc<Bijector>) -> Self {
        ParamValue::Bijector(b)
    }
}

impl ParamValue {
    /// Stable textual encoding, used to key cached results by call options.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            ParamValue::Float(x) => {
                let _ = write!(out, "f{:016x}", norm_bits(*x));
            }
            ParamValue::Int(x) => {
                let _ = write!(out, "i{}", x);
            }
            ParamValue::Bool(x) => {
                let _ = write!(out, "b{}", x);
            }
            ParamValue::Str(x) => {
                let _ = write!(out, "s{:?}", x);
            }
            ParamValue::Tensor(t) => {
                let _ = write!(out, "t{}{:?}[", t.dtype(), t.shape());
                for x in t.array().iter() {
                    let _ = write!(out, "{:016x},", norm_bits(*x));
                }
                out.push(']');
            }
            ParamValue::List(xs) => {
                out.push('[');
                for x in xs {
                    x.write_canonical(out);
                    out.push(',');
                }
                out.push(']');
            }
            ParamValue::Bijector(b) => {
                let _ = write!(out, "bij#{}", b.instance_id());
            }
            ParamValue::Distribution(d) => {
                let _ = write!(out, "dist@{:x}", Arc::as_ptr(d) as *const () as usize);
            }
        }
    }
}

/// Canonical encoding of a full option set (keys in sorted order).
pub fn canonical_kwargs(kwargs: &Kwargs) -> String {
    let mut out = String::new();
    for (k, v) in kwargs {
        out.push_str(k);
        out.push('=');
        v.write_canonical(&mut out);
        out.push(';');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn h(v: &ParamValue) -> u64 {
        let mut s = DefaultHasher::new();
        v.hash(&mut s);
        s.finish()
    }

    #[test]
    fn test_tensor_params_compare_elementwise() {
        let a = ParamValue::Tensor(Tensor::from_vec(vec![1.0, 2.0]));
        let b = ParamValue::Tensor(Tensor::from_vec(vec![1.0, 2.0]));
        let c = ParamValue::Tensor(Tensor::from_vec(vec![1.0, 3.0]));
        assert_eq!(a, b);
        assert_eq!(h(&a), h(&b));
        assert_ne!(a, c);
    }

    #[test]
    fn test_signed_zero_and_nan_are_consistent() {
        assert_eq!(ParamValue::Float(0.0), ParamValue::Float(-0.0));
        assert_eq!(h(&ParamValue::Float(0.0)), h(&ParamValue::Float(-0.0)));
        assert_eq!(ParamValue::Float(f64::NAN), ParamValue::Float(f64::NAN));
    }

    #[test]
    fn test_canonical_kwargs_is_order_independent() {
        let mut a = Kwargs::new();
        a.insert("x".into(), ParamValue::Int(1));
        a.insert("a".into(), ParamValue::Bool(true));
        let mut b = Kwargs::new();
        b.insert("a".into(), ParamValue::Bool(true));
        b.insert("x".into(), ParamValue::Int(1));
        assert_eq!(canonical_kwargs(&a), canonical_kwargs(&b));
        assert_eq!(canonical_kwargs(&Kwargs::new()), "");
    }
}

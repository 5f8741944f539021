//! Immutable n-d arrays with a logical dtype and a stable identity token.
//!
//! A [`Tensor`] owns its storage through an `Arc`, so clones are cheap and
//! share identity. Results of arithmetic are always fresh storage. The storage
//! address is what the bijector result cache keys on ([`Tensor::id`]), and
//! [`WeakTensor`] lets the cache observe a value without keeping it alive.
//!
//! All element data is held as `f64`; [`DType`] records the logical element
//! type used for dtype inference and checking.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use ndarray::{ArrayD, Axis, IxDyn};
use serde::{Deserialize, Serialize};

use crate::tree::Tree;
use crate::{Error, Result};

/// Logical element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// Half precision float.
    F16,
    /// Single precision float.
    F32,
    /// Double precision float.
    F64,
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// Boolean.
    Bool,
}

impl DType {
    /// `true` for the floating point types.
    pub fn is_floating(self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Canonical lowercase name.
    pub fn name(self) -> &'static str {
        match self {
            DType::F16 => "float16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::Bool => "bool",
        }
    }

    fn convert(self, x: f64) -> f64 {
        match self {
            DType::F16 | DType::F64 => x,
            DType::F32 => x as f32 as f64,
            DType::I32 => x.trunc().clamp(i32::MIN as f64, i32::MAX as f64),
            DType::I64 => x.trunc(),
            DType::Bool => {
                if x != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable identity token of a live tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

/// Shared immutable n-d array.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Arc<ArrayD<f64>>,
    dtype: DType,
}

/// Non-owning handle to a tensor's storage.
#[derive(Debug, Clone)]
pub struct WeakTensor {
    data: Weak<ArrayD<f64>>,
    dtype: DType,
}

impl WeakTensor {
    /// Recover the tensor if its storage is still alive.
    pub fn upgrade(&self) -> Option<Tensor> {
        self.data.upgrade().map(|data| Tensor { data, dtype: self.dtype })
    }

    /// `true` while at least one strong handle exists.
    pub fn is_alive(&self) -> bool {
        self.data.strong_count() > 0
    }

    /// `true` if `t` shares this handle's storage.
    pub fn refers_to(&self, t: &Tensor) -> bool {
        std::ptr::eq(self.data.as_ptr(), Arc::as_ptr(&t.data))
    }
}

/// Structured values: a tree of tensors.
pub type Value = Tree<Tensor>;

impl Tensor {
    /// Wrap an array with an explicit dtype. Elements are converted to `dtype`.
    pub fn new(data: ArrayD<f64>, dtype: DType) -> Self {
        let data = if matches!(dtype, DType::F16 | DType::F64) { data } else { data.mapv(|x| dtype.convert(x)) };
        Self { data: Arc::new(data), dtype }
    }

    /// Wrap an `f64` array.
    pub fn from_array(data: ArrayD<f64>) -> Self {
        Self { data: Arc::new(data), dtype: DType::F64 }
    }

    /// Rank-0 tensor.
    pub fn scalar(x: f64) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(&[]), x))
    }

    /// Rank-1 tensor.
    pub fn from_vec(xs: Vec<f64>) -> Self {
        Self::from_array(ndarray::Array1::from(xs).into_dyn())
    }

    /// Tensor of the given shape from row-major data.
    pub fn from_shape_vec(shape: &[usize], xs: Vec<f64>) -> Result<Self> {
        let len = xs.len();
        ArrayD::from_shape_vec(IxDyn(shape), xs)
            .map(Self::from_array)
            .map_err(|e| Error::Validation(format!("cannot build shape {:?} from {} values: {}", shape, len, e)))
    }

    /// Tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        Self::from_array(ArrayD::from_elem(IxDyn(shape), value))
    }

    /// Tensor filled with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    /// Number of elements.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Logical dtype.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Borrow the underlying array.
    pub fn array(&self) -> &ArrayD<f64> {
        &self.data
    }

    /// Row-major copy of the elements.
    pub fn to_vec(&self) -> Vec<f64> {
        self.data.iter().copied().collect()
    }

    /// The single element of a size-1 tensor.
    pub fn item(&self) -> Result<f64> {
        if self.size() != 1 {
            return Err(Error::Value(format!("expected a single element, got shape {:?}", self.shape())));
        }
        self.data.iter().next().copied().ok_or_else(|| Error::Value("empty tensor".into()))
    }

    /// Identity of the storage. Stable while any clone of this tensor is alive.
    pub fn id(&self) -> TensorId {
        TensorId(Arc::as_ptr(&self.data) as usize)
    }

    /// `true` if both handles share storage.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Weak handle to the storage.
    pub fn downgrade(&self) -> WeakTensor {
        WeakTensor { data: Arc::downgrade(&self.data), dtype: self.dtype }
    }

    /// Convert to `dtype`. Returns `self` unchanged when the dtype already matches.
    pub fn cast(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        Tensor::new((*self.data).clone(), dtype)
    }

    /// Elementwise map into fresh storage, keeping the dtype.
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        Tensor { data: Arc::new(self.data.mapv(f)), dtype: self.dtype }
    }

    /// Fallible elementwise map.
    pub fn try_map(&self, mut f: impl FnMut(f64) -> Result<f64>) -> Result<Tensor> {
        let xs = self.data.iter().map(|&x| f(x)).collect::<Result<Vec<_>>>()?;
        Ok(Tensor::from_shape_vec(self.shape(), xs)?.cast(self.dtype))
    }

    /// Broadcasting binary op; the result takes `self`'s dtype.
    pub fn zip_with(&self, other: &Tensor, f: impl Fn(f64, f64) -> f64) -> Result<Tensor> {
        self.try_zip_with(other, |a, b| Ok(f(a, b)))
    }

    /// Fallible broadcasting binary op.
    pub fn try_zip_with(&self, other: &Tensor, mut f: impl FnMut(f64, f64) -> Result<f64>) -> Result<Tensor> {
        let (shape, cols) = broadcast_arrays(&[self, other])?;
        let xs = cols[0].iter().zip(&cols[1]).map(|(&a, &b)| f(a, b)).collect::<Result<Vec<_>>>()?;
        Ok(Tensor::from_shape_vec(&shape, xs)?.cast(self.dtype))
    }

    /// Broadcasting `self + other`.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Broadcasting `self - other`.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Broadcasting `self * other`.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a * b)
    }

    /// Broadcasting `self / other`.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a / b)
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Tensor {
        self.map(|x| -x)
    }

    /// Sum over the last `k` axes.
    pub fn sum_trailing(&self, k: usize) -> Result<Tensor> {
        if k > self.rank() {
            return Err(Error::Validation(format!(
                "cannot reduce {} trailing axes of a rank-{} tensor",
                k,
                self.rank()
            )));
        }
        let mut a = (*self.data).clone();
        for _ in 0..k {
            let last = a.ndim() - 1;
            a = a.sum_axis(Axis(last));
        }
        Ok(Tensor { data: Arc::new(a), dtype: self.dtype })
    }

    /// Sum of all elements.
    pub fn sum_all(&self) -> f64 {
        self.data.sum()
    }

    /// Reinterpret with a new shape of equal size (row-major).
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let a = (*self.data)
            .clone()
            .into_shape_with_order(IxDyn(shape))
            .map_err(|e| Error::Validation(format!("cannot reshape {:?} to {:?}: {}", self.shape(), shape, e)))?;
        Ok(Tensor { data: Arc::new(a), dtype: self.dtype })
    }

    /// Broadcast to `shape`.
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        let view = self
            .data
            .broadcast(IxDyn(shape))
            .ok_or_else(|| Error::Validation(format!("cannot broadcast {:?} to {:?}", self.shape(), shape)))?;
        Ok(Tensor { data: Arc::new(view.to_owned()), dtype: self.dtype })
    }

    /// Slice `index` along the leading axis.
    pub fn get(&self, index: usize) -> Result<Tensor> {
        if self.rank() == 0 || index >= self.shape()[0] {
            return Err(Error::Value(format!("index {} out of range for shape {:?}", index, self.shape())));
        }
        Ok(Tensor { data: Arc::new(self.data.index_axis(Axis(0), index).to_owned()), dtype: self.dtype })
    }

    /// Stack equally-shaped tensors along a new leading axis.
    pub fn stack(parts: &[Tensor]) -> Result<Tensor> {
        let first = parts.first().ok_or_else(|| Error::Value("cannot stack zero tensors".into()))?;
        let views: Vec<_> = parts.iter().map(|t| t.data.view()).collect();
        let a = ndarray::stack(Axis(0), &views)
            .map_err(|e| Error::Validation(format!("cannot stack tensors: {}", e)))?;
        Ok(Tensor { data: Arc::new(a), dtype: first.dtype })
    }

    /// Bit-exact hash of shape, dtype and elements.
    pub fn hash_contents<H: Hasher>(&self, state: &mut H) {
        self.dtype.hash(state);
        self.shape().hash(state);
        for x in self.data.iter() {
            // Normalize -0.0 so equal tensors hash equally.
            let x = if *x == 0.0 { 0.0f64 } else { *x };
            x.to_bits().hash(state);
        }
    }
}

impl PartialEq for Tensor {
    /// Value equality: dtype, shape and elements.
    fn eq(&self, other: &Self) -> bool {
        self.dtype == other.dtype && *self.data == *other.data
    }
}

impl From<f64> for Tensor {
    fn from(x: f64) -> Self {
        Tensor::scalar(x)
    }
}

impl From<Vec<f64>> for Tensor {
    fn from(xs: Vec<f64>) -> Self {
        Tensor::from_vec(xs)
    }
}

/// Numpy-style broadcast of two static shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut out = vec![0; n];
    for i in 0..n {
        let da = if i < n - a.len() { 1 } else { a[i - (n - a.len())] };
        let db = if i < n - b.len() { 1 } else { b[i - (n - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::Validation(format!("shapes {:?} and {:?} are not broadcast-compatible", a, b)));
            }
        };
    }
    Ok(out)
}

/// Broadcast tensors to their common shape.
///
/// Returns the common shape and each tensor's elements in row-major order of
/// that shape.
pub fn broadcast_arrays(tensors: &[&Tensor]) -> Result<(Vec<usize>, Vec<Vec<f64>>)> {
    let mut shape: Vec<usize> = Vec::new();
    for t in tensors {
        shape = broadcast_shapes(&shape, t.shape())?;
    }
    let cols = tensors
        .iter()
        .map(|t| {
            t.data
                .broadcast(IxDyn(&shape))
                .map(|v| v.iter().copied().collect())
                .ok_or_else(|| Error::Validation(format!("cannot broadcast {:?} to {:?}", t.shape(), shape)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok((shape, cols))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[3, 1], &[4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shapes(&[3], &[4]).is_err());
    }

    #[test]
    fn test_identity_follows_storage() {
        let a = Tensor::from_vec(vec![1.0, 2.0]);
        let b = a.clone();
        let c = Tensor::from_vec(vec![1.0, 2.0]);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a, c, "value equality ignores identity");
    }

    #[test]
    fn test_weak_handle_dies_with_storage() {
        let a = Tensor::scalar(1.0);
        let w = a.downgrade();
        assert!(w.refers_to(&a));
        assert!(w.upgrade().is_some());
        drop(a);
        assert!(!w.is_alive());
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn test_sum_trailing_and_reshape() {
        let t = Tensor::from_shape_vec(&[2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(t.sum_trailing(1).unwrap().to_vec(), vec![6.0, 15.0]);
        assert_eq!(t.sum_trailing(2).unwrap().shape(), &[] as &[usize]);
        assert!(t.sum_trailing(3).is_err());
        assert_eq!(t.reshape(&[3, 2]).unwrap().shape(), &[3, 2]);
        assert!(t.reshape(&[4]).is_err());
    }

    #[test]
    fn test_zip_with_broadcasts() {
        let a = Tensor::from_shape_vec(&[2, 1], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_vec(vec![10.0, 20.0, 30.0]);
        let c = a.add(&b).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.to_vec(), vec![11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn test_cast_rounds_integers() {
        let t = Tensor::from_vec(vec![1.7, -2.2]).cast(DType::I32);
        assert_eq!(t.dtype(), DType::I32);
        assert_eq!(t.to_vec(), vec![1.0, -2.0]);
    }
}

//! Per-bijector memo table for forward/inverse results.
//!
//! Every entry is keyed by `(direction, identity of the input's leaves,
//! canonical call options)`. An entry observes its input weakly, so it never
//! keeps its own key alive. A value the cache *computed* is held strongly by
//! the entry keyed on the value it was computed from; the mirror entry keyed
//! on the computed value only refers back weakly.
//!
//! Both entries of a pair share one [`Attributes`] map, which is where the
//! unreduced log-det-Jacobian (`"ildj"`) is memoized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use px_core::{Result, Tensor, TensorId, Tree, Value, WeakTensor};

/// Which primitive produced (or would produce) the paired value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Keyed on an `x`; pairs with `forward(x)`.
    Forward,
    /// Keyed on a `y`; pairs with `inverse(y)`.
    Inverse,
}

impl Direction {
    fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Inverse,
            Direction::Inverse => Direction::Forward,
        }
    }
}

/// Named side results attached to a cached pair.
pub type Attributes = HashMap<String, Tensor>;

/// Shared handle to a pair's attributes.
pub type SharedAttributes = Arc<Mutex<Attributes>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    direction: Direction,
    ids: Vec<TensorId>,
    options: String,
}

#[derive(Debug)]
enum Paired {
    Strong(Value),
    Weak(Tree<WeakTensor>),
}

impl Paired {
    fn upgrade(&self) -> Option<Value> {
        match self {
            Paired::Strong(v) => Some(v.clone()),
            Paired::Weak(w) => w.try_map(|t| t.upgrade().ok_or(())).ok(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    input: Tree<WeakTensor>,
    paired: Option<Paired>,
    attrs: SharedAttributes,
}

impl Entry {
    fn is_alive(&self) -> bool {
        self.input.flatten().iter().all(|w| w.is_alive())
    }

    fn refers_to(&self, v: &Value) -> bool {
        self.input.same_structure(v)
            && self.input.flatten().iter().zip(v.flatten()).all(|(w, t)| w.refers_to(t))
    }
}

fn lock_attrs(attrs: &SharedAttributes) -> MutexGuard<'_, Attributes> {
    attrs.lock().unwrap_or_else(|e| e.into_inner())
}

/// Read a named attribute.
pub fn get_attribute(attrs: &SharedAttributes, name: &str) -> Option<Tensor> {
    lock_attrs(attrs).get(name).cloned()
}

/// Write a named attribute. Same-key writes overwrite.
pub fn set_attribute(attrs: &SharedAttributes, name: &str, value: Tensor) {
    lock_attrs(attrs).insert(name.to_string(), value);
}

/// The memo table owned by one bijector instance.
#[derive(Debug, Default)]
pub struct BijectorCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

fn ids_of(v: &Value) -> Vec<TensorId> {
    v.flatten().iter().map(|t| t.id()).collect()
}

fn shares_storage(a: &Value, b: &Value) -> bool {
    let bs = b.flatten();
    a.flatten().iter().any(|x| bs.iter().any(|y| x.same_storage(y)))
}

impl BijectorCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge(entries: &mut HashMap<CacheKey, Entry>) {
        // Dropping a dead entry can release the last strong handle of another
        // entry's key, so repeat until nothing changes.
        loop {
            let before = entries.len();
            entries.retain(|_, e| e.is_alive());
            if entries.len() == before {
                break;
            }
        }
    }

    fn key(direction: Direction, v: &Value, options: &str) -> CacheKey {
        CacheKey { direction, ids: ids_of(v), options: options.to_string() }
    }

    /// `forward(x)` through the cache.
    ///
    /// Returns the paired value if one is recorded for `x` (from an earlier
    /// forward of `x` or an earlier inverse that produced `x`); otherwise runs
    /// `compute` and records the pair.
    pub fn forward(&self, x: &Value, options: &str, compute: impl FnOnce(&Value) -> Result<Value>) -> Result<Value> {
        self.lookup_or_compute(Direction::Forward, x, options, compute)
    }

    /// `inverse(y)` through the cache. Symmetric to [`BijectorCache::forward`].
    pub fn inverse(&self, y: &Value, options: &str, compute: impl FnOnce(&Value) -> Result<Value>) -> Result<Value> {
        self.lookup_or_compute(Direction::Inverse, y, options, compute)
    }

    fn lookup_or_compute(
        &self,
        direction: Direction,
        input: &Value,
        options: &str,
        compute: impl FnOnce(&Value) -> Result<Value>,
    ) -> Result<Value> {
        let key = Self::key(direction, input, options);
        if let Some(hit) = self.lookup(&key, input) {
            log::trace!("bijector cache hit ({:?})", direction);
            return Ok(hit);
        }
        let output = compute(input)?;
        self.record(direction, input, &output, options);
        Ok(output)
    }

    fn lookup(&self, key: &CacheKey, input: &Value) -> Option<Value> {
        let entries = self.lock();
        let entry = entries.get(key)?;
        if !entry.refers_to(input) {
            return None;
        }
        entry.paired.as_ref()?.upgrade()
    }

    fn record(&self, direction: Direction, input: &Value, output: &Value, options: &str) {
        let mut entries = self.lock();
        Self::purge(&mut entries);

        let key_in = Self::key(direction, input, options);
        let key_out = Self::key(direction.flip(), output, options);
        let attrs = entries
            .get(&key_in)
            .filter(|e| e.refers_to(input))
            .or_else(|| entries.get(&key_out).filter(|e| e.refers_to(output)))
            .map(|e| Arc::clone(&e.attrs))
            .unwrap_or_default();

        let owned = if shares_storage(input, output) {
            Paired::Weak(output.map(Tensor::downgrade))
        } else {
            Paired::Strong(output.clone())
        };
        entries.insert(
            key_in,
            Entry { input: input.map(Tensor::downgrade), paired: Some(owned), attrs: Arc::clone(&attrs) },
        );
        entries.insert(
            key_out,
            Entry {
                input: output.map(Tensor::downgrade),
                paired: Some(Paired::Weak(input.map(Tensor::downgrade))),
                attrs,
            },
        );
    }

    /// Attributes shared by the pair keyed on `x` in the forward direction.
    pub fn forward_attributes(&self, x: &Value, options: &str) -> SharedAttributes {
        self.attributes(Direction::Forward, x, options)
    }

    /// Attributes shared by the pair keyed on `y` in the inverse direction.
    pub fn inverse_attributes(&self, y: &Value, options: &str) -> SharedAttributes {
        self.attributes(Direction::Inverse, y, options)
    }

    fn attributes(&self, direction: Direction, input: &Value, options: &str) -> SharedAttributes {
        let mut entries = self.lock();
        let key = Self::key(direction, input, options);
        if let Some(e) = entries.get(&key).filter(|e| e.refers_to(input)) {
            return Arc::clone(&e.attrs);
        }
        Self::purge(&mut entries);
        let attrs = SharedAttributes::default();
        entries.insert(key, Entry { input: input.map(Tensor::downgrade), paired: None, attrs: Arc::clone(&attrs) });
        attrs
    }

    /// Number of entries whose input is still alive.
    pub fn len(&self) -> usize {
        let mut entries = self.lock();
        Self::purge(&mut entries);
        entries.len()
    }

    /// `true` when no live entry exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

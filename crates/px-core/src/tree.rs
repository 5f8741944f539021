//! Nested structures ("trees") of ranks, shapes, dtypes and values.
//!
//! A [`Tree`] is either a single leaf or an ordered/named collection of
//! sub-trees. Flattening order is deterministic:
//! - `List` children in index order
//! - `Dict` children in sorted-key order
//! - `Record` children in declaration order
//!
//! Two trees have the *same structure* when they agree on every interior node
//! (variant, length and keys), regardless of leaf contents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A leaf or an ordered/named collection of sub-trees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tree<T> {
    /// A single value.
    Leaf(T),
    /// Positional children.
    List(Vec<Tree<T>>),
    /// Keyed children, flattened in sorted-key order.
    Dict(BTreeMap<String, Tree<T>>),
    /// Named children, flattened in declaration order.
    Record(Vec<(String, Tree<T>)>),
}

impl<T> From<T> for Tree<T> {
    fn from(value: T) -> Self {
        Tree::Leaf(value)
    }
}

impl<T> Tree<T> {
    /// Build a list of leaves.
    pub fn list_of(values: impl IntoIterator<Item = T>) -> Self {
        Tree::List(values.into_iter().map(Tree::Leaf).collect())
    }

    /// Build a dict of leaves.
    pub fn dict_of<K: Into<String>>(entries: impl IntoIterator<Item = (K, T)>) -> Self {
        Tree::Dict(entries.into_iter().map(|(k, v)| (k.into(), Tree::Leaf(v))).collect())
    }

    /// Build a record of leaves.
    pub fn record_of<K: Into<String>>(entries: impl IntoIterator<Item = (K, T)>) -> Self {
        Tree::Record(entries.into_iter().map(|(k, v)| (k.into(), Tree::Leaf(v))).collect())
    }

    /// `true` for a single leaf.
    pub fn is_leaf(&self) -> bool {
        matches!(self, Tree::Leaf(_))
    }

    /// Borrow the leaf value, if this is a leaf.
    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Tree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Take the leaf value, if this is a leaf.
    pub fn into_leaf(self) -> Option<T> {
        match self {
            Tree::Leaf(v) => Some(v),
            _ => None,
        }
    }

    /// Number of leaves.
    pub fn num_leaves(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::List(xs) => xs.iter().map(Tree::num_leaves).sum(),
            Tree::Dict(xs) => xs.values().map(Tree::num_leaves).sum(),
            Tree::Record(xs) => xs.iter().map(|(_, t)| t.num_leaves()).sum(),
        }
    }

    /// Leaves in flattening order.
    pub fn flatten(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.num_leaves());
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a T>) {
        match self {
            Tree::Leaf(v) => out.push(v),
            Tree::List(xs) => xs.iter().for_each(|t| t.collect_refs(out)),
            Tree::Dict(xs) => xs.values().for_each(|t| t.collect_refs(out)),
            Tree::Record(xs) => xs.iter().for_each(|(_, t)| t.collect_refs(out)),
        }
    }

    /// Consume the tree, returning leaves in flattening order.
    pub fn into_flat(self) -> Vec<T> {
        let mut out = Vec::new();
        self.collect_owned(&mut out);
        out
    }

    fn collect_owned(self, out: &mut Vec<T>) {
        match self {
            Tree::Leaf(v) => out.push(v),
            Tree::List(xs) => xs.into_iter().for_each(|t| t.collect_owned(out)),
            Tree::Dict(xs) => xs.into_values().for_each(|t| t.collect_owned(out)),
            Tree::Record(xs) => xs.into_iter().for_each(|(_, t)| t.collect_owned(out)),
        }
    }

    /// Apply `f` to every leaf, keeping the structure.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Tree<U> {
        self.map_inner(&mut f)
    }

    fn map_inner<U>(&self, f: &mut impl FnMut(&T) -> U) -> Tree<U> {
        match self {
            Tree::Leaf(v) => Tree::Leaf(f(v)),
            Tree::List(xs) => Tree::List(xs.iter().map(|t| t.map_inner(f)).collect()),
            Tree::Dict(xs) => Tree::Dict(xs.iter().map(|(k, t)| (k.clone(), t.map_inner(f))).collect()),
            Tree::Record(xs) => {
                Tree::Record(xs.iter().map(|(k, t)| (k.clone(), t.map_inner(f))).collect())
            }
        }
    }

    /// Fallible [`Tree::map`]; stops at the first error in flattening order.
    pub fn try_map<U, E>(&self, mut f: impl FnMut(&T) -> std::result::Result<U, E>) -> std::result::Result<Tree<U>, E> {
        self.try_map_inner(&mut f)
    }

    fn try_map_inner<U, E>(
        &self,
        f: &mut impl FnMut(&T) -> std::result::Result<U, E>,
    ) -> std::result::Result<Tree<U>, E> {
        Ok(match self {
            Tree::Leaf(v) => Tree::Leaf(f(v)?),
            Tree::List(xs) => Tree::List(xs.iter().map(|t| t.try_map_inner(f)).collect::<std::result::Result<_, E>>()?),
            Tree::Dict(xs) => Tree::Dict(
                xs.iter()
                    .map(|(k, t)| Ok((k.clone(), t.try_map_inner(f)?)))
                    .collect::<std::result::Result<_, E>>()?,
            ),
            Tree::Record(xs) => Tree::Record(
                xs.iter()
                    .map(|(k, t)| Ok((k.clone(), t.try_map_inner(f)?)))
                    .collect::<std::result::Result<_, E>>()?,
            ),
        })
    }

    /// The bare structure, with every leaf replaced by `()`.
    pub fn structure(&self) -> Tree<()> {
        self.map(|_| ())
    }

    /// `true` when both trees agree on every interior node.
    pub fn same_structure<U>(&self, other: &Tree<U>) -> bool {
        match (self, other) {
            (Tree::Leaf(_), Tree::Leaf(_)) => true,
            (Tree::List(a), Tree::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_structure(y))
            }
            (Tree::Dict(a), Tree::Dict(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, x), (kb, y))| ka == kb && x.same_structure(y))
            }
            (Tree::Record(a), Tree::Record(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|((ka, x), (kb, y))| ka == kb && x.same_structure(y))
            }
            _ => false,
        }
    }

    /// Fail with [`Error::Type`] unless both trees have the same structure.
    pub fn assert_same_structure<U>(&self, other: &Tree<U>) -> Result<()> {
        if self.same_structure(other) {
            Ok(())
        } else {
            Err(Error::Type(format!(
                "structures differ: {} vs {}",
                self.structure_string(),
                other.structure_string()
            )))
        }
    }

    /// Compact rendering of the structure (`*` marks a leaf).
    pub fn structure_string(&self) -> String {
        match self {
            Tree::Leaf(_) => "*".to_string(),
            Tree::List(xs) => {
                format!("[{}]", xs.iter().map(Tree::structure_string).collect::<Vec<_>>().join(", "))
            }
            Tree::Dict(xs) => format!(
                "{{{}}}",
                xs.iter().map(|(k, t)| format!("{k}: {}", t.structure_string())).collect::<Vec<_>>().join(", ")
            ),
            Tree::Record(xs) => format!(
                "({})",
                xs.iter().map(|(k, t)| format!("{k}={}", t.structure_string())).collect::<Vec<_>>().join(", ")
            ),
        }
    }

    /// Combine two trees of the same structure leaf by leaf.
    pub fn zip_with<U, V>(&self, other: &Tree<U>, mut f: impl FnMut(&T, &U) -> V) -> Result<Tree<V>> {
        self.assert_same_structure(other)?;
        let rhs = other.flatten();
        let mut i = 0;
        Ok(self.map(|a| {
            let v = f(a, rhs[i]);
            i += 1;
            v
        }))
    }

    /// Fallible [`Tree::zip_with`].
    pub fn try_zip_with<U, V>(&self, other: &Tree<U>, mut f: impl FnMut(&T, &U) -> Result<V>) -> Result<Tree<V>> {
        self.assert_same_structure(other)?;
        let rhs = other.flatten();
        let mut i = 0;
        self.try_map(|a| {
            let v = f(a, rhs[i]);
            i += 1;
            v
        })
    }

    /// Rebuild `flat` (in flattening order) into this tree's structure.
    pub fn pack_sequence_as<U>(&self, flat: Vec<U>) -> Result<Tree<U>> {
        let n = self.num_leaves();
        if flat.len() != n {
            return Err(Error::Value(format!(
                "cannot pack {} values into a structure with {} leaves",
                flat.len(),
                n
            )));
        }
        let mut it = flat.into_iter();
        self.try_map(|_| it.next().ok_or_else(|| Error::Value("ran out of values while packing".into())))
    }

    /// Number of direct children (`1` for a leaf).
    pub fn len(&self) -> usize {
        match self {
            Tree::Leaf(_) => 1,
            Tree::List(xs) => xs.len(),
            Tree::Dict(xs) => xs.len(),
            Tree::Record(xs) => xs.len(),
        }
    }

    /// `true` for an interior node without children.
    pub fn is_empty(&self) -> bool {
        !self.is_leaf() && self.len() == 0
    }

    /// Names of the direct children of a `Dict` or `Record`.
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Tree::Dict(xs) => xs.keys().map(String::as_str).collect(),
            Tree::Record(xs) => xs.iter().map(|(k, _)| k.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    /// Look up a direct child by name.
    pub fn get(&self, key: &str) -> Option<&Tree<T>> {
        match self {
            Tree::Dict(xs) => xs.get(key),
            Tree::Record(xs) => xs.iter().find(|(k, _)| k == key).map(|(_, t)| t),
            _ => None,
        }
    }
}

impl<T: Clone> Tree<T> {
    /// Replicate a leaf across `target`'s structure; otherwise require equal structure.
    pub fn broadcast_to_structure<U>(&self, target: &Tree<U>) -> Result<Tree<T>> {
        match self {
            Tree::Leaf(v) => Ok(target.map(|_| v.clone())),
            _ => {
                self.assert_same_structure(target)?;
                Ok(self.clone())
            }
        }
    }

    /// Structure of `reference` when it is structured, else `self`'s.
    ///
    /// Used where a leaf in one argument stands for "the same value everywhere"
    /// and the other argument carries the real structure.
    pub fn coerce_structure<U>(&self, reference: &Tree<U>) -> Result<Tree<T>> {
        if reference.is_leaf() { Ok(self.clone()) } else { self.broadcast_to_structure(reference) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Tree<i64> {
        let mut d = BTreeMap::new();
        d.insert("b".to_string(), Tree::Leaf(2));
        d.insert("a".to_string(), Tree::List(vec![Tree::Leaf(0), Tree::Leaf(1)]));
        Tree::Dict(d)
    }

    #[test]
    fn test_flatten_sorts_dict_keys() {
        let t = abc();
        assert_eq!(t.flatten(), vec![&0, &1, &2]);
        assert_eq!(t.num_leaves(), 3);
        assert_eq!(t.clone().into_flat(), vec![0, 1, 2]);
    }

    #[test]
    fn test_record_keeps_declaration_order() {
        let t = Tree::record_of([("z", 1), ("a", 2)]);
        assert_eq!(t.flatten(), vec![&1, &2]);
        assert_eq!(t.keys(), vec!["z", "a"]);
        assert_eq!(t.get("a"), Some(&Tree::Leaf(2)));
    }

    #[test]
    fn test_pack_sequence_as_roundtrip_structure() {
        let t = abc();
        let packed = t.pack_sequence_as(vec!["x", "y", "z"]).unwrap();
        assert!(packed.same_structure(&t));
        assert_eq!(packed.flatten(), vec![&"x", &"y", &"z"]);
        assert!(t.pack_sequence_as(vec![1]).is_err());
    }

    #[test]
    fn test_zip_with_rejects_mismatch() {
        let a = Tree::list_of([1, 2]);
        let b = Tree::list_of([3, 4, 5]);
        assert!(matches!(a.zip_with(&b, |x, y| x + y), Err(Error::Type(_))));
        let c = Tree::list_of([10, 20]);
        assert_eq!(a.zip_with(&c, |x, y| x + y).unwrap(), Tree::list_of([11, 22]));
    }

    #[test]
    fn test_broadcast_leaf_over_structure() {
        let target = abc();
        let b = Tree::Leaf(7).broadcast_to_structure(&target).unwrap();
        assert_eq!(b.into_flat(), vec![7, 7, 7]);
        let wrong = Tree::list_of([1, 2]);
        assert!(wrong.broadcast_to_structure(&target).is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let t = abc();
        let s = serde_json::to_string(&t).unwrap();
        let back: Tree<i64> = serde_json::from_str(&s).unwrap();
        assert_eq!(back, t);
    }
}

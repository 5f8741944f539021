//! Rank and shape bookkeeping for log-det-Jacobian reduction.
//!
//! A bijector computes its log-det-Jacobian (LDJ) at its minimal event rank.
//! When a caller asks for a larger `event_ndims`, the extra trailing dimensions
//! between `min_event_ndims` and `event_ndims` must be summed out. The helpers
//! here validate ranks, compute that common extra rank across a structured
//! input, and compute the shape being reduced over.
//!
//! Ranks are always known when these functions run. Individual dimensions may
//! not be ([`PartialShape`]); checks that depend on unknown dimensions are
//! returned as [`PendingCheck`]s, which must be verified against concrete
//! shapes (see [`ReductionShape::resolve`]) before the reduced value is used.

use px_core::{Error, Result, Tree};

/// A shape of known rank whose dimensions may be unknown.
pub type PartialShape = Vec<Option<usize>>;

/// Lift a concrete shape.
pub fn known(shape: &[usize]) -> PartialShape {
    shape.iter().map(|&d| Some(d)).collect()
}

/// `Some` only when every dimension is known.
pub fn to_static(shape: &[Option<usize>]) -> Option<Vec<usize>> {
    shape.iter().copied().collect()
}

/// Validate that `value` is a non-negative rank.
pub fn validate_rank(value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::Validation(format!("`ndims` must be non-negative, saw {}", value)))
}

fn align<'a>(a: &'a Tree<i64>, b: &'a Tree<i64>) -> Result<(Tree<i64>, Tree<i64>)> {
    match (a.is_leaf(), b.is_leaf()) {
        (true, false) => Ok((a.broadcast_to_structure(b)?, b.clone())),
        (false, true) => Ok((a.clone(), b.broadcast_to_structure(a)?)),
        _ => {
            a.assert_same_structure(b)?;
            Ok((a.clone(), b.clone()))
        }
    }
}

/// The common difference `event_ranks[i] - min_event_ranks[i]` over all leaves.
///
/// A leaf on either side stands for the same rank at every position of the
/// other side's structure.
pub fn reduction_rank(event_ranks: &Tree<i64>, min_event_ranks: &Tree<i64>) -> Result<usize> {
    let (event, min) = align(event_ranks, min_event_ranks)?;
    let event_flat = event.flatten();
    let min_flat = min.flatten();
    for &r in event_flat.iter().chain(min_flat.iter()) {
        validate_rank(*r)?;
    }
    let diffs: Vec<i64> = event_flat.iter().zip(&min_flat).map(|(&&e, &&m)| e - m).collect();
    let first = *diffs.first().ok_or_else(|| Error::Validation("cannot reduce over an empty structure".into()))?;
    if diffs.iter().any(|&d| d != first) {
        return Err(Error::Validation(format!(
            "differences between `event_ndims` and `min_event_ndims` must be equal for all elements \
             of the structured input; saw event_ndims={:?}, min_event_ndims={:?}",
            event_flat, min_flat
        )));
    }
    usize::try_from(first).map_err(|_| {
        Error::Validation(format!("`event_ndims` must be at least {:?}, saw {:?}", min_flat, event_flat))
    })
}

/// A check that could not be decided from partial shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingCheck {
    /// The reduced segments of every leaf must be identical.
    SegmentsEqual {
        /// Start of the segment within each flattened leaf's shape.
        begins: Vec<usize>,
        /// Segment length (the reduction rank).
        len: usize,
    },
    /// The trailing parameter batch dims must not expand the reduction shape.
    ParameterBatchCompatible {
        /// Start of the segment within the first leaf's shape.
        begin: usize,
        /// Segment length (the reduction rank).
        len: usize,
        /// Trailing part of the parameter batch shape inside the reduced dims.
        parameter_batch_in_ldj_shape: Vec<usize>,
    },
}

impl PendingCheck {
    /// Evaluate the check against concrete (flattened) shapes.
    pub fn verify(&self, shapes: &[&Vec<usize>]) -> Result<()> {
        match self {
            PendingCheck::SegmentsEqual { begins, len } => {
                let segs = segments(shapes, begins, *len)?;
                if segs.windows(2).any(|w| w[0] != w[1]) {
                    return Err(Error::Validation(format!(
                        "`event_shape` components to the left of `min_event_ndims` must be equal; saw {:?}",
                        segs
                    )));
                }
                Ok(())
            }
            PendingCheck::ParameterBatchCompatible { begin, len, parameter_batch_in_ldj_shape } => {
                let seg = segments(&shapes[..1.min(shapes.len())], &[*begin], *len)?;
                let seg = seg.into_iter().next().unwrap_or_default();
                check_parameter_batch(&seg, parameter_batch_in_ldj_shape)
            }
        }
    }
}

fn segments(shapes: &[&Vec<usize>], begins: &[usize], len: usize) -> Result<Vec<Vec<usize>>> {
    shapes
        .iter()
        .zip(begins)
        .map(|(s, &b)| {
            s.get(b..b + len).map(<[usize]>::to_vec).ok_or_else(|| {
                Error::Validation(format!("shape {:?} has no dims [{}, {})", s, b, b + len))
            })
        })
        .collect()
}

fn check_parameter_batch(ldj_reduce_shape: &[usize], parameter_batch_in_ldj_shape: &[usize]) -> Result<()> {
    let broadcast = px_core::broadcast_shapes(parameter_batch_in_ldj_shape, ldj_reduce_shape)?;
    if broadcast != ldj_reduce_shape {
        return Err(Error::Validation(format!(
            "broadcasting with bijector parameters changes the LDJ reduction shape from {:?} to {:?}",
            ldj_reduce_shape, broadcast
        )));
    }
    Ok(())
}

/// Output of [`reduction_shape`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReductionShape {
    /// Shape of the dimensions summed out of the LDJ.
    pub shape: PartialShape,
    /// Checks deferred until concrete shapes are known.
    pub pending: Vec<PendingCheck>,
}

impl ReductionShape {
    /// Verify pending checks against concrete shapes and return the concrete
    /// reduction shape.
    ///
    /// `shapes` must have the same structure as the partial shapes originally
    /// passed to [`reduction_shape`]; `begin` locates the reduced segment in
    /// the first flattened leaf.
    pub fn resolve(&self, shapes: &Tree<Vec<usize>>, begin: usize) -> Result<Vec<usize>> {
        let flat = shapes.flatten();
        for check in &self.pending {
            check.verify(&flat)?;
        }
        let first = flat.first().ok_or_else(|| Error::Validation("no shapes to resolve against".into()))?;
        self.shape
            .iter()
            .enumerate()
            .map(|(i, d)| match d {
                Some(d) => Ok(*d),
                None => first
                    .get(begin + i)
                    .copied()
                    .ok_or_else(|| Error::Validation(format!("shape {:?} is too short", first))),
            })
            .collect()
    }
}

/// Compute the shape of the dimensions between `min_event_ranks` and
/// `event_ranks` for every leaf of `shapes`.
///
/// Every leaf must have rank at least `event_ranks[i]`. Without
/// `allow_broadcasting` all reduced segments must be equal, and the trailing
/// dims of `parameter_batch_shape` must not expand them; with it the segments
/// are broadcast together.
pub fn reduction_shape(
    shapes: &Tree<PartialShape>,
    event_ranks: &Tree<i64>,
    min_event_ranks: &Tree<i64>,
    parameter_batch_shape: Option<&[usize]>,
    allow_broadcasting: bool,
    validate_args: bool,
) -> Result<ReductionShape> {
    let (event, min) = align(event_ranks, min_event_ranks)?;
    let event = event.coerce_structure(shapes)?;
    let reduce_rank = reduction_rank(&event, &min.coerce_structure(shapes)?)?;

    let flat_shapes = shapes.flatten();
    if flat_shapes.len() != event.num_leaves() {
        return Err(Error::Type(format!(
            "shape structure {} does not match event_ndims structure {}",
            shapes.structure_string(),
            event.structure_string()
        )));
    }

    let mut begins = Vec::with_capacity(flat_shapes.len());
    let mut segments: Vec<PartialShape> = Vec::with_capacity(flat_shapes.len());
    for (shape, &ev) in flat_shapes.iter().zip(event.flatten()) {
        let ev = validate_rank(ev)?;
        let rank = shape.len();
        if rank < ev {
            return Err(Error::Validation(format!("input must have rank at least {}, saw {}", ev, rank)));
        }
        let begin = rank - ev;
        begins.push(begin);
        segments.push(shape[begin..begin + reduce_rank].to_vec());
    }

    let mut pending = Vec::new();
    if segments.len() > 1 && !allow_broadcasting {
        let statics: Option<Vec<Vec<usize>>> = segments.iter().map(|s| to_static(s)).collect();
        match statics {
            Some(statics) => {
                if statics.windows(2).any(|w| w[0] != w[1]) {
                    return Err(Error::Validation(format!(
                        "`event_shape` components to the left of `min_event_ndims` must be equal; saw {:?}",
                        statics
                    )));
                }
            }
            None if validate_args => {
                pending.push(PendingCheck::SegmentsEqual { begins: begins.clone(), len: reduce_rank });
            }
            None => {}
        }
    }

    let mut shape = segments[0].clone();
    if allow_broadcasting {
        for s in &segments[1..] {
            shape = broadcast_partial_shapes(&shape, s)?;
        }
    } else if let Some(pbs) = parameter_batch_shape {
        let tail_len = reduce_rank.min(pbs.len());
        let parameter_batch_in_ldj_shape = pbs[pbs.len() - tail_len..].to_vec();
        match to_static(&shape) {
            Some(s) => check_parameter_batch(&s, &parameter_batch_in_ldj_shape)?,
            None if validate_args => pending.push(PendingCheck::ParameterBatchCompatible {
                begin: begins[0],
                len: reduce_rank,
                parameter_batch_in_ldj_shape,
            }),
            None => {}
        }
    }

    Ok(ReductionShape { shape, pending })
}

/// Broadcast two partial shapes. Unknown dims stay unknown unless the other
/// side forces a size other than 1.
pub fn broadcast_partial_shapes(a: &[Option<usize>], b: &[Option<usize>]) -> Result<PartialShape> {
    let n = a.len().max(b.len());
    let pad = |s: &[Option<usize>], i: usize| if i < n - s.len() { Some(1) } else { s[i - (n - s.len())] };
    (0..n)
        .map(|i| match (pad(a, i), pad(b, i)) {
            (Some(x), Some(y)) if x == y => Ok(Some(x)),
            (Some(1), other) | (other, Some(1)) => Ok(other),
            (Some(x), Some(y)) => {
                Err(Error::Validation(format!("dims {} and {} are not broadcast-compatible in {:?} vs {:?}", x, y, a, b)))
            }
            (None, Some(y)) | (Some(y), None) => Ok(Some(y)),
            (None, None) => Ok(None),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranks(a: i64, b: i64) -> Tree<i64> {
        Tree::dict_of([("a", a), ("b", b)])
    }

    #[test]
    fn test_validate_rank() {
        assert_eq!(validate_rank(3).unwrap(), 3);
        assert!(matches!(validate_rank(-1), Err(Error::Validation(_))));
    }

    #[test]
    fn test_reduction_rank_structured() {
        assert_eq!(reduction_rank(&ranks(2, 3), &ranks(1, 2)).unwrap(), 1);
        assert!(matches!(reduction_rank(&ranks(2, 3), &ranks(1, 3)), Err(Error::Validation(_))));
        assert!(matches!(reduction_rank(&ranks(0, 1), &ranks(1, 2)), Err(Error::Validation(_))));
    }

    #[test]
    fn test_reduction_rank_leaf_broadcasts() {
        assert_eq!(reduction_rank(&Tree::Leaf(2), &ranks(1, 1)).unwrap(), 1);
    }

    #[test]
    fn test_reduction_shape_single() {
        let r = reduction_shape(&Tree::Leaf(known(&[1, 2, 3, 4])), &Tree::Leaf(2), &Tree::Leaf(1), None, false, true)
            .unwrap();
        assert_eq!(r.shape, known(&[3]));
        assert!(r.pending.is_empty());
    }

    #[test]
    fn test_reduction_shape_structured() {
        let shapes = Tree::dict_of([("a", known(&[1, 2, 3, 4])), ("b", known(&[1, 2, 3, 4, 5]))]);
        let r = reduction_shape(&shapes, &ranks(2, 3), &ranks(1, 2), None, false, true).unwrap();
        assert_eq!(r.shape, known(&[3]));
    }

    #[test]
    fn test_reduction_shape_rejects_unequal_segments() {
        let shapes = Tree::dict_of([("a", known(&[2, 3])), ("b", known(&[4, 3]))]);
        let err = reduction_shape(&shapes, &ranks(2, 2), &ranks(1, 1), None, false, true).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let ok = reduction_shape(&shapes, &ranks(2, 2), &ranks(1, 1), None, true, true);
        assert!(ok.is_err(), "2 vs 4 does not broadcast either");
        let shapes = Tree::dict_of([("a", known(&[1, 3])), ("b", known(&[4, 3]))]);
        let r = reduction_shape(&shapes, &ranks(2, 2), &ranks(1, 1), None, true, true).unwrap();
        assert_eq!(r.shape, known(&[4]));
    }

    #[test]
    fn test_reduction_shape_rank_too_small() {
        let err = reduction_shape(&Tree::Leaf(known(&[3])), &Tree::Leaf(2), &Tree::Leaf(0), None, false, true);
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[test]
    fn test_parameter_batch_shape_cannot_expand() {
        let shapes = Tree::Leaf(known(&[5, 1, 3]));
        let err = reduction_shape(&shapes, &Tree::Leaf(2), &Tree::Leaf(1), Some(&[4]), false, true);
        assert!(matches!(err, Err(Error::Validation(_))));
        let ok = reduction_shape(&shapes, &Tree::Leaf(2), &Tree::Leaf(1), Some(&[7, 1]), false, true).unwrap();
        assert_eq!(ok.shape, known(&[1]));
    }

    #[test]
    fn test_unknown_dims_defer_checks() {
        let shapes = Tree::dict_of([("a", vec![None, Some(3)]), ("b", vec![Some(2), Some(3)])]);
        let r = reduction_shape(&shapes, &ranks(2, 2), &ranks(1, 1), None, false, true).unwrap();
        assert_eq!(r.pending.len(), 1);
        assert_eq!(r.shape, vec![None]);

        let good = Tree::dict_of([("a", vec![2, 3]), ("b", vec![2, 3])]);
        assert_eq!(r.resolve(&good, 0).unwrap(), vec![2]);
        let bad = Tree::dict_of([("a", vec![5, 3]), ("b", vec![2, 3])]);
        assert!(matches!(r.resolve(&bad, 0), Err(Error::Validation(_))));

        let unchecked = reduction_shape(&shapes, &ranks(2, 2), &ranks(1, 1), None, false, false).unwrap();
        assert!(unchecked.pending.is_empty());
    }
}

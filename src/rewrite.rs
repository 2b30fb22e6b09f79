//! Rewrite rules that simplify map-carrying computations in place of their originals.

use log::debug;
use std::{fmt::Debug, hash::Hash};

use crate::canonicalize::canonicalize_map_and_operands;
use crate::config::ComposeConfig;
use crate::fold::{fold_lower_bound, fold_upper_bound, FoldError};
use crate::map::AffineMap;
use crate::normalize::{compose_affine_map_and_operands, ComposeError};
use crate::ops::{ApplyOp, Bound, ForBounds, LoadOp, StoreOp};
use crate::value::ValueProvenance;
use crate::verify::VerifyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteResult<T> {
    Changed(T),
    Unchanged,
}

impl<T> RewriteResult<T> {
    pub fn is_changed(&self) -> bool {
        matches!(self, RewriteResult::Changed(_))
    }

    pub fn changed(self) -> Option<T> {
        match self {
            RewriteResult::Changed(t) => Some(t),
            RewriteResult::Unchanged => None,
        }
    }
}

/// A computation whose map and operands can be swapped for equivalent ones.
pub trait AffineMapOp<'c>: Sized {
    type Value: Copy + Eq + Hash + Debug;

    fn affine_map(&self) -> AffineMap<'c>;
    fn map_operands(&self) -> &[Self::Value];
    /// The same computation with `map` applied to `operands` instead.
    fn rebuild(&self, map: AffineMap<'c>, operands: &[Self::Value]) -> Self;
}

impl<'c, V: Copy + Eq + Hash + Debug> AffineMapOp<'c> for ApplyOp<'c, V> {
    type Value = V;

    fn affine_map(&self) -> AffineMap<'c> {
        self.map
    }

    fn map_operands(&self) -> &[V] {
        &self.operands
    }

    fn rebuild(&self, map: AffineMap<'c>, operands: &[V]) -> Self {
        ApplyOp {
            map,
            operands: operands.into(),
        }
    }
}

impl<'c, V: Copy + Eq + Hash + Debug> AffineMapOp<'c> for LoadOp<'c, V> {
    type Value = V;

    fn affine_map(&self) -> AffineMap<'c> {
        self.map
    }

    fn map_operands(&self) -> &[V] {
        &self.indices
    }

    fn rebuild(&self, map: AffineMap<'c>, operands: &[V]) -> Self {
        LoadOp {
            memref: self.memref,
            map,
            indices: operands.into(),
        }
    }
}

impl<'c, V: Copy + Eq + Hash + Debug> AffineMapOp<'c> for StoreOp<'c, V> {
    type Value = V;

    fn affine_map(&self) -> AffineMap<'c> {
        self.map
    }

    fn map_operands(&self) -> &[V] {
        &self.indices
    }

    fn rebuild(&self, map: AffineMap<'c>, operands: &[V]) -> Self {
        StoreOp {
            value: self.value,
            memref: self.memref,
            map,
            indices: operands.into(),
        }
    }
}

/// Composes the maps of producing applies into a computation's map.
#[derive(Debug, Clone, Default)]
pub struct SimplifyAffineOp {
    pub config: ComposeConfig,
}

impl SimplifyAffineOp {
    pub fn new(config: ComposeConfig) -> Self {
        SimplifyAffineOp { config }
    }

    pub fn match_and_rewrite<'c, O, P>(
        &self,
        values: &P,
        op: &O,
    ) -> Result<RewriteResult<O>, ComposeError>
    where
        O: AffineMapOp<'c>,
        P: ValueProvenance<'c, Value = O::Value>,
    {
        let old_map = op.affine_map();
        let old_operands = op.map_operands();
        let (map, operands) =
            compose_affine_map_and_operands(values, old_map, old_operands, &self.config)?;
        if map == old_map && operands.as_slice() == old_operands {
            return Ok(RewriteResult::Unchanged);
        }
        debug!("Rewrote {old_map} {old_operands:?} to {map} {operands:?}");
        Ok(RewriteResult::Changed(op.rebuild(map, &operands)))
    }
}

/// Canonicalize both bounds of a loop.
pub fn canonicalize_loop_bounds<'c, P: ValueProvenance<'c>>(
    values: &P,
    bounds: &ForBounds<'c, P::Value>,
) -> Result<RewriteResult<ForBounds<'c, P::Value>>, VerifyError> {
    let canonicalize = |bound: &Bound<'c, P::Value>| -> Result<_, VerifyError> {
        let (map, operands) = canonicalize_map_and_operands(values, bound.map, &bound.operands)?;
        Ok(Bound::new(map, &operands))
    };
    let lower = canonicalize(&bounds.lower)?;
    let upper = canonicalize(&bounds.upper)?;
    if lower == bounds.lower && upper == bounds.upper {
        return Ok(RewriteResult::Unchanged);
    }
    Ok(RewriteResult::Changed(ForBounds {
        lower,
        upper,
        step: bounds.step,
    }))
}

/// Replace each non-constant bound whose results all fold by its max (lower) or min (upper).
pub fn fold_loop_bounds<'c, P: ValueProvenance<'c>>(
    values: &P,
    bounds: &ForBounds<'c, P::Value>,
) -> Result<RewriteResult<ForBounds<'c, P::Value>>, FoldError> {
    let mut folded = bounds.clone();
    let mut changed = false;
    if bounds.lower.as_constant().is_none() {
        if let Some(v) = fold_lower_bound(values, bounds.lower.map, &bounds.lower.operands)? {
            folded.lower = Bound::constant(bounds.lower.map.context(), v);
            changed = true;
        }
    }
    if bounds.upper.as_constant().is_none() {
        if let Some(v) = fold_upper_bound(values, bounds.upper.map, &bounds.upper.operands)? {
            folded.upper = Bound::constant(bounds.upper.map.context(), v);
            changed = true;
        }
    }
    if !changed {
        return Ok(RewriteResult::Unchanged);
    }
    Ok(RewriteResult::Changed(folded))
}

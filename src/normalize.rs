//! Composition of a map with the maps of the applies producing its operands.
//!
//! Mathematical map composition always concatenates symbols: composing
//! `(d0)[s0] -> (d0 + s0)` with itself gives `(d0)[s0, s1] -> (d0 + s0 + s1)`, which only
//! equals `(d0)[s0] -> (d0 + s0 * 2)` if both symbols are bound to the same value. The
//! [AffineApplyNormalizer] keeps track of which operand each dimension and symbol stands
//! for so that such coincidences can be recovered by [canonicalize_map_and_operands]. A
//! symbol operand produced by an apply is locally rewritten as a dimension, so inlining its
//! producer is ordinary dimension substitution.

use log::{debug, warn};
use smallvec::SmallVec;
use std::collections::HashMap;

use crate::canonicalize::canonicalize_map_and_operands;
use crate::classify::is_producer;
use crate::config::ComposeConfig;
use crate::expr::AffineExpr;
use crate::map::{simplify_affine_map, AffineMap};
use crate::value::{Placement, ValueDef, ValueId, ValueProvenance, ValueTable};
use crate::verify::{verify_apply, verify_operand_count, VerifyError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ComposeError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("Producers of {map} remain after {iterations} rounds of composition")]
    IterationLimit { map: String, iterations: usize },
    #[error("Composition of {map} stopped making progress with producer operands left")]
    NoProgress { map: String },
}

/// The state of one composition: a map and the operands its dimensions and symbols are
/// bound to, numbered in discovery order.
#[derive(Debug, Clone)]
pub struct AffineApplyNormalizer<'c, V> {
    affine_map: AffineMap<'c>,
    dim_value_to_position: HashMap<V, usize>,
    reordered_dims: SmallVec<[V; 8]>,
    concatenated_symbols: SmallVec<[V; 8]>,
}

impl<'c, V> AffineApplyNormalizer<'c, V>
where
    V: Copy + Eq + std::hash::Hash + std::fmt::Debug,
{
    /// Compose `map` with the producers of `operands`, inlining as many levels of producers
    /// as `config.max_apply_depth` allows.
    pub fn new<P>(
        values: &P,
        map: AffineMap<'c>,
        operands: &[V],
        config: &ComposeConfig,
    ) -> Result<Self, VerifyError>
    where
        P: ValueProvenance<'c, Value = V>,
    {
        Self::with_depth(values, map, operands, config, 1)
    }

    fn empty(map: AffineMap<'c>) -> Self {
        AffineApplyNormalizer {
            affine_map: map,
            dim_value_to_position: HashMap::new(),
            reordered_dims: SmallVec::new(),
            concatenated_symbols: SmallVec::new(),
        }
    }

    fn with_depth<P>(
        values: &P,
        map: AffineMap<'c>,
        operands: &[V],
        config: &ComposeConfig,
        depth: usize,
    ) -> Result<Self, VerifyError>
    where
        P: ValueProvenance<'c, Value = V>,
    {
        verify_operand_count(map, operands)?;
        debug!("Input map: {map}");

        // The rewritten map refers to (dims, symbols produced by applies, other symbols).
        // Operands keep their order: rewritten symbols always follow the original dims, and
        // each operand is dispatched either to a dimension or to the concatenated symbols.
        let num_dims_before_rewrite = map.num_dims();
        let map = promote_composed_symbols_as_dims(
            values,
            map,
            &operands[num_dims_before_rewrite..],
        );
        debug!("Rewritten map: {map}");

        let ctx = map.context();
        let mut normalizer = Self::empty(map);
        let further_compose = depth <= config.max_apply_depth;
        let mut auxiliary_exprs = SmallVec::<[AffineExpr<'c>; 8]>::new();
        // Where each remaining symbol of `map` landed in the concatenated symbols.
        let mut own_symbol_slots = SmallVec::<[usize; 8]>::new();
        for (i, &operand) in operands.iter().enumerate() {
            match values.definition(operand) {
                ValueDef::Apply {
                    map: producer_map,
                    operands: producer_operands,
                } if further_compose => {
                    debug!("Compose producer of {operand:?} recursively: {producer_map}");
                    verify_apply(values, producer_map, producer_operands)?;
                    let nested = Self::with_depth(
                        values,
                        producer_map,
                        producer_operands,
                        config,
                        depth + 1,
                    )?;
                    debug!("Renumber into current normalizer: {}", nested.affine_map);
                    let renumbered = normalizer.renumber(&nested);
                    debug!("Recursive composition yields: {renumbered}");
                    auxiliary_exprs.push(renumbered.result(0));
                }
                ValueDef::Apply { .. } => {
                    auxiliary_exprs.push(normalizer.renumber_one_dim(operand));
                }
                _ if i < num_dims_before_rewrite => {
                    auxiliary_exprs.push(normalizer.renumber_one_dim(operand));
                }
                _ => {
                    own_symbol_slots.push(normalizer.concatenated_symbols.len());
                    normalizer.concatenated_symbols.push(operand);
                }
            }
        }

        if auxiliary_exprs.is_empty() {
            return Ok(normalizer);
        }

        let num_dims = normalizer.reordered_dims.len();
        let num_symbols = normalizer.concatenated_symbols.len();
        let auxiliary_map = AffineMap::get(ctx, num_dims, num_symbols, &auxiliary_exprs);
        debug!("Compose map: {map}");
        debug!("With map: {auxiliary_map}");

        // `compose` numbers `map`'s own symbols first. Put every symbol back at its position
        // in the concatenated symbols.
        let symbol_remapping = own_symbol_slots
            .iter()
            .map(|&slot| ctx.symbol(slot))
            .chain((0..num_symbols).map(|k| ctx.symbol(k)))
            .collect::<SmallVec<[_; 8]>>();
        let composed = map.compose(auxiliary_map).replace_dims_and_symbols(
            &[],
            &symbol_remapping,
            num_dims,
            num_symbols,
        );
        debug!("Result: {composed}");

        normalizer.affine_map = simplify_affine_map(composed);
        debug!("Simplified result: {}", normalizer.affine_map);
        Ok(normalizer)
    }

    /// The dimension `value` is bound to, assigning the next free one on first use.
    fn renumber_one_dim(&mut self, value: V) -> AffineExpr<'c> {
        let next = self.dim_value_to_position.len();
        let position = *self.dim_value_to_position.entry(value).or_insert_with(|| {
            self.reordered_dims.push(value);
            next
        });
        self.affine_map.context().dim(position)
    }

    /// Rewrite `other`'s map into this normalizer's numbering. Its dimension operands are
    /// unified with ours and its symbols are appended after ours.
    fn renumber(&mut self, other: &Self) -> AffineMap<'c> {
        let ctx = other.affine_map.context();
        let dim_remapping = other
            .reordered_dims
            .iter()
            .map(|&v| self.renumber_one_dim(v))
            .collect::<SmallVec<[_; 8]>>();
        let num_symbols = self.concatenated_symbols.len();
        let symbol_remapping = (0..other.concatenated_symbols.len())
            .map(|idx| ctx.symbol(num_symbols + idx))
            .collect::<SmallVec<[_; 8]>>();
        self.concatenated_symbols
            .extend(other.concatenated_symbols.iter().copied());
        other.affine_map.replace_dims_and_symbols(
            &dim_remapping,
            &symbol_remapping,
            self.reordered_dims.len(),
            self.concatenated_symbols.len(),
        )
    }

    /// Compose another (map, operands) pair and express it in this normalizer's numbering,
    /// so that two pairs can share one operand list.
    ///
    /// The other pair is normalized as a fresh, outermost pair. The returned operands cover
    /// everything this normalizer has seen so far, the other pair included.
    pub fn normalize<P>(
        &mut self,
        values: &P,
        map: AffineMap<'c>,
        operands: &[V],
        config: &ComposeConfig,
    ) -> Result<(AffineMap<'c>, SmallVec<[V; 8]>), VerifyError>
    where
        P: ValueProvenance<'c, Value = V>,
    {
        let other = Self::new(values, map, operands, config)?;
        let map = self.renumber(&other);
        Ok((map, self.operands()))
    }

    pub fn affine_map(&self) -> AffineMap<'c> {
        self.affine_map
    }

    /// The operands of [Self::affine_map]: its dimensions, then its symbols.
    pub fn operands(&self) -> SmallVec<[V; 8]> {
        self.reordered_dims
            .iter()
            .chain(&self.concatenated_symbols)
            .copied()
            .collect()
    }
}

/// Rewrite the symbols of `map` bound to apply results as new dimensions, numbered after
/// the existing ones in symbol order.
fn promote_composed_symbols_as_dims<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    symbols: &[P::Value],
) -> AffineMap<'c> {
    let ctx = map.context();
    let num_dims = map.num_dims();
    let mut num_new_dims = 0;
    let mut num_new_symbols = 0;
    let mut symbol_replacements = SmallVec::<[AffineExpr<'c>; 8]>::with_capacity(symbols.len());
    for &symbol in symbols {
        if is_producer(values, symbol) {
            symbol_replacements.push(ctx.dim(num_dims + num_new_dims));
            num_new_dims += 1;
        } else {
            symbol_replacements.push(ctx.symbol(num_new_symbols));
            num_new_symbols += 1;
        }
    }
    if num_new_dims == 0 {
        return map;
    }
    map.replace_dims_and_symbols(
        &[],
        &symbol_replacements,
        num_dims + num_new_dims,
        num_new_symbols,
    )
}

/// One round of composition: inline the producers of `operands` into `map`, then
/// canonicalize the result.
pub fn compose_affine_map_and_operands<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
    config: &ComposeConfig,
) -> Result<(AffineMap<'c>, SmallVec<[P::Value; 8]>), ComposeError> {
    let normalizer = AffineApplyNormalizer::new(values, map, operands, config)?;
    let (map, operands) =
        canonicalize_map_and_operands(values, normalizer.affine_map(), &normalizer.operands())?;
    // Deduplicated and folded operands may expose further simplification, which may in turn
    // leave some operands unused.
    let simplified = simplify_affine_map(map);
    if simplified == map {
        return Ok((map, operands));
    }
    Ok(canonicalize_map_and_operands(values, simplified, &operands)?)
}

/// Compose until no operand is the result of an apply.
pub fn fully_compose_affine_map_and_operands<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
    config: &ComposeConfig,
) -> Result<(AffineMap<'c>, SmallVec<[P::Value; 8]>), ComposeError> {
    let mut map = map;
    let mut operands = SmallVec::<[P::Value; 8]>::from_slice(operands);
    for _ in 0..config.max_compose_iterations {
        if !operands.iter().any(|o| is_producer(values, *o)) {
            return Ok((map, operands));
        }
        let (new_map, new_operands) =
            compose_affine_map_and_operands(values, map, &operands, config)?;
        if new_map == map && new_operands == operands {
            warn!("Composition of {map} with {operands:?} made no progress");
            return Err(ComposeError::NoProgress {
                map: map.to_string(),
            });
        }
        map = new_map;
        operands = new_operands;
    }
    if !operands.iter().any(|o| is_producer(values, *o)) {
        return Ok((map, operands));
    }
    warn!(
        "Giving up on {map} after {} rounds of composition",
        config.max_compose_iterations
    );
    Err(ComposeError::IterationLimit {
        map: map.to_string(),
        iterations: config.max_compose_iterations,
    })
}

/// Define an apply of `map` to `operands` with its producers composed in.
pub fn make_composed_apply<'c>(
    values: &mut ValueTable<'c>,
    placement: Placement,
    map: AffineMap<'c>,
    operands: &[ValueId],
    config: &ComposeConfig,
) -> Result<ValueId, ComposeError> {
    let (map, operands) = compose_affine_map_and_operands(values, map, operands, config)?;
    Ok(values.apply(placement, map, &operands)?)
}

//! Canonical forms of (map or set, operands) pairs: dimensions that are valid symbols become
//! symbols, unused and duplicate operands are dropped, and constant symbols are inlined.

use log::trace;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt::Display;

use crate::classify::{constant_value, is_valid_symbol};
use crate::context::Context;
use crate::expr::{AffineExpr, AffineExprKind};
use crate::map::AffineMap;
use crate::set::IntegerSet;
use crate::value::ValueProvenance;
use crate::verify::VerifyError;

/// Anything whose expressions range over a list of dimensions and symbols.
pub trait DimsAndSymbols<'c>: Copy + Eq + Display {
    fn context(&self) -> &'c Context;
    fn num_dims(&self) -> usize;
    fn num_symbols(&self) -> usize;
    fn walk_exprs(&self, callback: impl FnMut(AffineExpr<'c>));
    fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
        num_result_dims: usize,
        num_result_symbols: usize,
    ) -> Self;

    fn num_inputs(&self) -> usize {
        self.num_dims() + self.num_symbols()
    }
}

impl<'c> DimsAndSymbols<'c> for AffineMap<'c> {
    fn context(&self) -> &'c Context {
        AffineMap::context(self)
    }

    fn num_dims(&self) -> usize {
        AffineMap::num_dims(self)
    }

    fn num_symbols(&self) -> usize {
        AffineMap::num_symbols(self)
    }

    fn walk_exprs(&self, callback: impl FnMut(AffineExpr<'c>)) {
        AffineMap::walk_exprs(self, callback)
    }

    fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
        num_result_dims: usize,
        num_result_symbols: usize,
    ) -> Self {
        AffineMap::replace_dims_and_symbols(
            self,
            dim_replacements,
            sym_replacements,
            num_result_dims,
            num_result_symbols,
        )
    }
}

impl<'c> DimsAndSymbols<'c> for IntegerSet<'c> {
    fn context(&self) -> &'c Context {
        IntegerSet::context(self)
    }

    fn num_dims(&self) -> usize {
        IntegerSet::num_dims(self)
    }

    fn num_symbols(&self) -> usize {
        IntegerSet::num_symbols(self)
    }

    fn walk_exprs(&self, callback: impl FnMut(AffineExpr<'c>)) {
        IntegerSet::walk_exprs(self, callback)
    }

    fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
        num_result_dims: usize,
        num_result_symbols: usize,
    ) -> Self {
        IntegerSet::replace_dims_and_symbols(
            self,
            dim_replacements,
            sym_replacements,
            num_result_dims,
            num_result_symbols,
        )
    }
}

fn check_operand_count<'c, M: DimsAndSymbols<'c>, V>(
    map_or_set: M,
    operands: &[V],
) -> Result<(), VerifyError> {
    if map_or_set.num_inputs() != operands.len() {
        return Err(VerifyError::OperandCountMismatch {
            expected: map_or_set.num_inputs(),
            actual: operands.len(),
            map: map_or_set.to_string(),
        });
    }
    Ok(())
}

/// Turn dimensions bound to valid symbols into symbols, numbered after the existing ones.
/// The remaining dimensions are renumbered in order.
pub fn canonicalize_promoted_symbols<'c, M, P>(
    values: &P,
    map_or_set: M,
    operands: &[P::Value],
) -> Result<(M, SmallVec<[P::Value; 8]>), VerifyError>
where
    M: DimsAndSymbols<'c>,
    P: ValueProvenance<'c>,
{
    check_operand_count(map_or_set, operands)?;
    if operands.is_empty() {
        return Ok((map_or_set, SmallVec::new()));
    }

    let ctx = map_or_set.context();
    let num_dims = map_or_set.num_dims();
    let old_num_symbols = map_or_set.num_symbols();
    let mut result_operands = SmallVec::<[P::Value; 8]>::with_capacity(operands.len());
    let mut remapped_symbols = SmallVec::<[P::Value; 8]>::new();
    let mut dim_remapping = SmallVec::<[AffineExpr<'c>; 8]>::with_capacity(num_dims);
    for &operand in &operands[..num_dims] {
        if is_valid_symbol(values, operand) {
            trace!("Promoting dimension operand {operand:?} of {map_or_set} to a symbol");
            dim_remapping.push(ctx.symbol(old_num_symbols + remapped_symbols.len()));
            remapped_symbols.push(operand);
        } else {
            dim_remapping.push(ctx.dim(result_operands.len()));
            result_operands.push(operand);
        }
    }
    if remapped_symbols.is_empty() {
        return Ok((map_or_set, operands.into()));
    }
    let next_dim = result_operands.len();
    result_operands.extend_from_slice(&operands[num_dims..]);
    let num_symbols = old_num_symbols + remapped_symbols.len();
    result_operands.extend(remapped_symbols);
    let promoted = map_or_set.replace_dims_and_symbols(&dim_remapping, &[], next_dim, num_symbols);
    Ok((promoted, result_operands))
}

/// Drop unused parameters, merge parameters bound to the same operand, and inline symbols
/// bound to constants.
fn drop_unused_and_duplicates<'c, M, P>(
    values: &P,
    map_or_set: M,
    operands: &[P::Value],
) -> (M, SmallVec<[P::Value; 8]>)
where
    M: DimsAndSymbols<'c>,
    P: ValueProvenance<'c>,
{
    let ctx = map_or_set.context();
    let num_dims = map_or_set.num_dims();
    let (used_dims, used_symbols) = used_inputs(map_or_set);

    let mut result_operands = SmallVec::<[P::Value; 8]>::with_capacity(operands.len());
    let mut seen_dims = HashMap::<P::Value, AffineExpr<'c>>::new();
    let mut dim_remapping = SmallVec::<[AffineExpr<'c>; 8]>::with_capacity(num_dims);
    for (i, &operand) in operands[..num_dims].iter().enumerate() {
        if !used_dims[i] {
            // Never referenced, so whatever takes its place doesn't matter.
            dim_remapping.push(ctx.dim(i));
            continue;
        }
        let next = ctx.dim(seen_dims.len());
        let replacement = *seen_dims.entry(operand).or_insert_with(|| {
            result_operands.push(operand);
            next
        });
        dim_remapping.push(replacement);
    }
    let next_dim = seen_dims.len();

    let mut seen_symbols = HashMap::<P::Value, AffineExpr<'c>>::new();
    let mut symbol_remapping =
        SmallVec::<[AffineExpr<'c>; 8]>::with_capacity(map_or_set.num_symbols());
    for (i, &operand) in operands[num_dims..].iter().enumerate() {
        if !used_symbols[i] {
            symbol_remapping.push(ctx.symbol(i));
            continue;
        }
        // Constants bound to dimensions were already promoted to symbols.
        if let Some(c) = constant_value(values, operand) {
            trace!("Inlining constant operand {operand:?} = {c} into {map_or_set}");
            symbol_remapping.push(ctx.constant(c));
            continue;
        }
        if let Some(&dim) = seen_dims.get(&operand) {
            trace!("Merging symbol operand {operand:?} of {map_or_set} into {dim}");
            symbol_remapping.push(dim);
            continue;
        }
        let next = ctx.symbol(seen_symbols.len());
        let replacement = *seen_symbols.entry(operand).or_insert_with(|| {
            result_operands.push(operand);
            next
        });
        symbol_remapping.push(replacement);
    }
    let next_symbol = seen_symbols.len();
    if result_operands.len() == operands.len() {
        return (map_or_set, operands.into());
    }

    let canonical = map_or_set.replace_dims_and_symbols(
        &dim_remapping,
        &symbol_remapping,
        next_dim,
        next_symbol,
    );
    (canonical, result_operands)
}

fn used_inputs<'c, M: DimsAndSymbols<'c>>(
    map_or_set: M,
) -> (SmallVec<[bool; 8]>, SmallVec<[bool; 8]>) {
    let mut used_dims = SmallVec::<[bool; 8]>::from_elem(false, map_or_set.num_dims());
    let mut used_symbols = SmallVec::<[bool; 8]>::from_elem(false, map_or_set.num_symbols());
    map_or_set.walk_exprs(|e| match e.kind() {
        AffineExprKind::Dim(p) => used_dims[p] = true,
        AffineExprKind::Symbol(p) => used_symbols[p] = true,
        _ => {}
    });
    (used_dims, used_symbols)
}

fn canonicalize_map_or_set_and_operands<'c, M, P>(
    values: &P,
    map_or_set: M,
    operands: &[P::Value],
) -> Result<(M, SmallVec<[P::Value; 8]>), VerifyError>
where
    M: DimsAndSymbols<'c>,
    P: ValueProvenance<'c>,
{
    let (mut map_or_set, mut operands) =
        canonicalize_promoted_symbols(values, map_or_set, operands)?;
    if operands.is_empty() {
        return Ok((map_or_set, operands));
    }
    // Inlining a constant can fold away references to other parameters (`d0 * s0` with
    // `s0 = 0`), so repeat until everything left is used.
    loop {
        (map_or_set, operands) = drop_unused_and_duplicates(values, map_or_set, &operands);
        let (used_dims, used_symbols) = used_inputs(map_or_set);
        if used_dims.iter().chain(&used_symbols).all(|u| *u) {
            return Ok((map_or_set, operands));
        }
    }
}

/// Canonicalize `map` and its operands. The result computes the same values and is a fixed
/// point of this function.
pub fn canonicalize_map_and_operands<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<(AffineMap<'c>, SmallVec<[P::Value; 8]>), VerifyError> {
    canonicalize_map_or_set_and_operands(values, map, operands)
}

pub fn canonicalize_set_and_operands<'c, P: ValueProvenance<'c>>(
    values: &P,
    set: IntegerSet<'c>,
    operands: &[P::Value],
) -> Result<(IntegerSet<'c>, SmallVec<[P::Value; 8]>), VerifyError> {
    canonicalize_map_or_set_and_operands(values, set, operands)
}

#[cfg(test)]
mod tests {
    use super::{
        canonicalize_map_and_operands, canonicalize_promoted_symbols,
        canonicalize_set_and_operands,
    };
    use crate::context::Context;
    use crate::map::{arb_map_shape, build_map, AffineMap};
    use crate::parse::{parse_affine_map, parse_integer_set};
    use crate::value::{Placement, ValueId, ValueTable, ValueType};
    use crate::verify::VerifyError;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn map<'c>(ctx: &'c Context, src: &str) -> AffineMap<'c> {
        parse_affine_map(ctx, src).unwrap()
    }

    #[test]
    fn test_duplicate_dims_are_merged() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        let (m, operands) =
            canonicalize_map_and_operands(&values, map(&ctx, "(d0, d1) -> (d0, d1)"), &[i, i])
                .unwrap();
        assert_eq!(m, map(&ctx, "(d0) -> (d0, d0)"));
        assert_eq!(operands.as_slice(), &[i]);
    }

    #[test]
    fn test_symbol_bound_to_a_dim_operand_is_merged() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        let (m, operands) =
            canonicalize_map_and_operands(&values, map(&ctx, "(d0)[s0] -> (d0 + s0)"), &[i, i])
                .unwrap();
        assert_eq!(m, map(&ctx, "(d0) -> (d0 + d0)"));
        assert_eq!(operands.as_slice(), &[i]);
        assert_eq!(
            canonicalize_map_and_operands(&values, m, &operands).unwrap(),
            (m, operands)
        );
    }

    #[test]
    fn test_constant_dim_is_folded() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let c = values.constant(Placement::Nested, 7);
        let (m, operands) =
            canonicalize_map_and_operands(&values, map(&ctx, "(d0) -> (d0)"), &[c]).unwrap();
        assert_eq!(m, map(&ctx, "() -> (7)"));
        assert!(operands.is_empty());
    }

    #[test]
    fn test_symbol_valued_dim_is_promoted() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let i = values.induction_var();
        let k = values.argument(ValueType::Index);
        let (m, operands) = canonicalize_promoted_symbols(
            &values,
            map(&ctx, "(d0, d1)[s0] -> (d0 + d1 + s0)"),
            &[n, i, k],
        )
        .unwrap();
        assert_eq!(m, map(&ctx, "(d0)[s0, s1] -> (s1 + d0 + s0)"));
        assert_eq!(operands.as_slice(), &[i, k, n]);
    }

    #[test]
    fn test_unused_operands_are_dropped() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        let j = values.induction_var();
        let n = values.argument(ValueType::Index);
        let (m, operands) = canonicalize_map_and_operands(
            &values,
            map(&ctx, "(d0, d1)[s0] -> (d1 * 2)"),
            &[i, j, n],
        )
        .unwrap();
        assert_eq!(m, map(&ctx, "(d0) -> (d0 * 2)"));
        assert_eq!(operands.as_slice(), &[j]);
    }

    #[test]
    fn test_folding_a_zero_drops_what_it_multiplied() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let zero = values.constant(Placement::TopLevel, 0);
        let (m, operands) = canonicalize_map_and_operands(
            &values,
            map(&ctx, "()[s0, s1] -> (s0 * s1 + 1)"),
            &[n, zero],
        )
        .unwrap();
        assert_eq!(m, map(&ctx, "() -> (1)"));
        assert!(operands.is_empty());
    }

    #[test]
    fn test_canonicalize_set() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        let n = values.argument(ValueType::Index);
        let set = parse_integer_set(&ctx, "(d0, d1)[s0] : (d0 - s0 >= 0, d1 - d0 >= 0)").unwrap();
        let (canonical, operands) = canonicalize_set_and_operands(&values, set, &[i, i, n]).unwrap();
        assert_eq!(
            canonical,
            parse_integer_set(&ctx, "(d0)[s0] : (d0 - s0 >= 0, d0 - d0 >= 0)").unwrap()
        );
        assert_eq!(operands.as_slice(), &[i, n]);
    }

    #[test]
    fn test_mismatched_operands_are_rejected() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        assert!(matches!(
            canonicalize_map_and_operands(&values, map(&ctx, "(d0, d1) -> (d0)"), &[i]),
            Err(VerifyError::OperandCountMismatch { expected: 2, actual: 1, .. })
        ));
    }

    /// Three induction variables, two arguments, and a constant to bind parameters to.
    fn operand_pool<'c>() -> (ValueTable<'c>, Vec<ValueId>) {
        let mut values = ValueTable::new();
        let pool = vec![
            values.induction_var(),
            values.induction_var(),
            values.induction_var(),
            values.argument(ValueType::Index),
            values.argument(ValueType::Index),
            values.constant(Placement::TopLevel, 3),
        ];
        (values, pool)
    }

    proptest! {
        #[test]
        fn test_canonicalize_preserves_value_and_is_idempotent(
            shape in arb_map_shape(3, 2, 2),
            picks in proptest::collection::vec(0usize..6, 5),
            inputs in proptest::collection::vec(-8i64..9, 5),
        ) {
            let ctx = Context::new();
            let (values, pool) = operand_pool();
            let m = build_map(&ctx, 3, 2, &shape);
            let operands = picks.iter().map(|p| pool[*p]).collect::<Vec<_>>();
            let env = pool[..5].iter().copied().zip(inputs).collect::<HashMap<_, _>>();
            let bind = |ops: &[ValueId]| {
                ops.iter().map(|o| Some(values.interpret(*o, &env))).collect::<Vec<_>>()
            };

            let (canonical, canonical_operands) =
                canonicalize_map_and_operands(&values, m, &operands).unwrap();
            prop_assert_eq!(canonical.num_inputs(), canonical_operands.len());
            prop_assert_eq!(
                canonical.constant_fold(&bind(&canonical_operands)).unwrap(),
                m.constant_fold(&bind(&operands)).unwrap()
            );

            let (again, again_operands) =
                canonicalize_map_and_operands(&values, canonical, &canonical_operands).unwrap();
            prop_assert_eq!(again, canonical);
            prop_assert_eq!(again_operands, canonical_operands);
        }
    }
}

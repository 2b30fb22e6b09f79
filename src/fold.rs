use smallvec::SmallVec;

use crate::classify::constant_value;
use crate::expr::{AffineExprKind, EvalError};
use crate::map::AffineMap;
use crate::value::ValueProvenance;
use crate::verify::{verify_apply, verify_operand_count, VerifyError};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FoldError {
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// What a single-result apply folds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldResult<V> {
    /// One of its own operands.
    Operand(V),
    Constant(i64),
}

/// The constant value of each operand, if it has one.
pub fn operand_constants<'c, P: ValueProvenance<'c>>(
    values: &P,
    operands: &[P::Value],
) -> SmallVec<[Option<i64>; 8]> {
    operands
        .iter()
        .map(|o| constant_value(values, *o))
        .collect()
}

/// Fold an apply of `map` to `operands`.
///
/// A map returning a bare dimension or symbol folds to the operand bound to it. Otherwise
/// the apply folds to a constant if every operand it depends on is a constant. `Ok(None)`
/// means the apply doesn't fold.
/// A binding that isn't a valid apply is a [FoldError::Verify].
pub fn fold_apply<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<FoldResult<P::Value>>, FoldError> {
    verify_apply(values, map, operands)?;
    let result = map.result(0);
    match result.kind() {
        AffineExprKind::Dim(p) => return Ok(Some(FoldResult::Operand(operands[p]))),
        AffineExprKind::Symbol(p) => {
            return Ok(Some(FoldResult::Operand(operands[map.num_dims() + p])))
        }
        _ => {}
    }
    let folded = map.constant_fold(&operand_constants(values, operands))?;
    Ok(folded
        .and_then(|results| results.first().copied())
        .map(FoldResult::Constant))
}

fn fold_all<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<SmallVec<[i64; 4]>>, FoldError> {
    verify_operand_count(map, operands)?;
    Ok(map.constant_fold(&operand_constants(values, operands))?)
}

/// The smallest result of `map`, if all of them fold to constants.
pub fn fold_min<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<i64>, FoldError> {
    Ok(fold_all(values, map, operands)?.and_then(|results| results.into_iter().min()))
}

/// The largest result of `map`, if all of them fold to constants.
pub fn fold_max<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<i64>, FoldError> {
    Ok(fold_all(values, map, operands)?.and_then(|results| results.into_iter().max()))
}

/// A loop starts at the largest of its lower bound map's results.
pub fn fold_lower_bound<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<i64>, FoldError> {
    fold_max(values, map, operands)
}

/// A loop ends before the smallest of its upper bound map's results.
pub fn fold_upper_bound<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<Option<i64>, FoldError> {
    fold_min(values, map, operands)
}

use crate::classify::{is_valid_affine_index_operand, is_valid_dim, is_valid_symbol};
use crate::map::AffineMap;
use crate::value::{ValueProvenance, ValueType};

/// A violated construction contract of a map-carrying computation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("Operand count ({actual}) must match the dimension and symbol count ({expected}) of {map}")]
    OperandCountMismatch {
        expected: usize,
        actual: usize,
        map: String,
    },
    #[error("Operand {position} must have index type, but has type {found}")]
    NonIndexOperand { position: usize, found: ValueType },
    #[error("Map {map} must produce exactly one result, but produces {count}")]
    ResultCount { map: String, count: usize },
    #[error("Operand {position} cannot be used as a dimension id")]
    InvalidDim { position: usize },
    #[error("Operand {position} cannot be used as a symbol")]
    InvalidSymbol { position: usize },
    #[error("Index operand {position} must be a dimension or symbol identifier")]
    InvalidIndex { position: usize },
    #[error("Unknown value {0}")]
    UnknownValue(String),
}

pub(crate) fn verify_operand_count<V>(map: AffineMap<'_>, operands: &[V]) -> Result<(), VerifyError> {
    if operands.len() != map.num_inputs() {
        return Err(VerifyError::OperandCountMismatch {
            expected: map.num_inputs(),
            actual: operands.len(),
            map: map.to_string(),
        });
    }
    Ok(())
}

fn verify_index_types<'c, P: ValueProvenance<'c>>(
    values: &P,
    operands: &[P::Value],
) -> Result<(), VerifyError> {
    for (position, operand) in operands.iter().enumerate() {
        let found = values.value_type(*operand);
        if found != ValueType::Index {
            return Err(VerifyError::NonIndexOperand { position, found });
        }
    }
    Ok(())
}

/// Checks an apply: operand count matches the map's inputs, all operands are indices, and
/// the map has a single result.
pub fn verify_apply<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<(), VerifyError> {
    verify_operand_count(map, operands)?;
    verify_index_types(values, operands)?;
    if map.num_results() != 1 {
        return Err(VerifyError::ResultCount {
            map: map.to_string(),
            count: map.num_results(),
        });
    }
    Ok(())
}

/// Checks that the first `num_dims` operands are valid dimensions and the rest are valid
/// symbols.
pub fn verify_dim_and_symbol_identifiers<'c, P: ValueProvenance<'c>>(
    values: &P,
    operands: &[P::Value],
    num_dims: usize,
) -> Result<(), VerifyError> {
    for (position, operand) in operands.iter().enumerate() {
        if position < num_dims {
            if !is_valid_dim(values, *operand) {
                return Err(VerifyError::InvalidDim { position });
            }
        } else if !is_valid_symbol(values, *operand) {
            return Err(VerifyError::InvalidSymbol { position });
        }
    }
    Ok(())
}

/// Checks the index operands of a memory access through `map`.
pub fn verify_index_operands<'c, P: ValueProvenance<'c>>(
    values: &P,
    map: AffineMap<'c>,
    operands: &[P::Value],
) -> Result<(), VerifyError> {
    verify_operand_count(map, operands)?;
    verify_index_types(values, operands)?;
    for (position, operand) in operands.iter().enumerate() {
        if !is_valid_affine_index_operand(values, *operand) {
            return Err(VerifyError::InvalidIndex { position });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        verify_apply, verify_dim_and_symbol_identifiers, verify_index_operands, VerifyError,
    };
    use crate::context::Context;
    use crate::parse::parse_affine_map;
    use crate::value::{Placement, ValueTable, ValueType};

    #[test]
    fn test_verify_apply() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let x = values.argument(ValueType::Integer { width: 32 });
        let map = parse_affine_map(&ctx, "(d0)[s0] -> (d0 + s0)").unwrap();
        assert_eq!(verify_apply(&values, map, &[n, n]), Ok(()));
        assert_eq!(
            verify_apply(&values, map, &[n, x]),
            Err(VerifyError::NonIndexOperand {
                position: 1,
                found: ValueType::Integer { width: 32 }
            })
        );
        let two_results = parse_affine_map(&ctx, "(d0) -> (d0, d0)").unwrap();
        assert!(matches!(
            verify_apply(&values, two_results, &[n]),
            Err(VerifyError::ResultCount { count: 2, .. })
        ));
    }

    #[test]
    fn test_error_messages_are_readable() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let map = parse_affine_map(&ctx, "(d0)[s0] -> (d0 + s0)").unwrap();
        let err = verify_apply(&values, map, &[n]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operand count (1) must match the dimension and symbol count (2) of (d0)[s0] -> (d0 + s0)"
        );
    }

    #[test]
    fn test_verify_dim_and_symbol_identifiers() {
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let i = values.induction_var();
        assert_eq!(verify_dim_and_symbol_identifiers(&values, &[i, n], 1), Ok(()));
        assert_eq!(
            verify_dim_and_symbol_identifiers(&values, &[n, i], 1),
            Err(VerifyError::InvalidSymbol { position: 1 })
        );
    }

    #[test]
    fn test_verify_index_operands() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let i = values.induction_var();
        let junk = values.opaque(Placement::Nested, ValueType::Index);
        let map = parse_affine_map(&ctx, "(d0, d1) -> (d0, d1)").unwrap();
        assert_eq!(verify_index_operands(&values, map, &[i, i]), Ok(()));
        assert_eq!(
            verify_index_operands(&values, map, &[i, junk]),
            Err(VerifyError::InvalidIndex { position: 1 })
        );
    }
}

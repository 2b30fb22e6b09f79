//! Predicates deciding whether an operand may be used as a dimension or a symbol.

use crate::map::AffineMap;
use crate::value::{Extent, ValueDef, ValueProvenance, ValueType};

/// A value can be used as a dimension if it is defined at the top level, is a constant or
/// an affine loop's induction variable, is the size of a top-level memory object, or is an
/// apply whose operands are all valid dimensions.
pub fn is_valid_dim<'c, P: ValueProvenance<'c>>(values: &P, value: P::Value) -> bool {
    if values.value_type(value) != ValueType::Index {
        return false;
    }
    match values.definition(value) {
        ValueDef::FunctionArgument | ValueDef::InductionVar => true,
        ValueDef::RegionArgument => false,
        ValueDef::Constant(_) => true,
        ValueDef::Apply { operands, .. } => {
            values.is_top_level(value) || operands.iter().all(|o| is_valid_dim(values, *o))
        }
        ValueDef::DimSize {
            memref_top_level, ..
        } => values.is_top_level(value) || memref_top_level,
        ValueDef::Result => values.is_top_level(value),
    }
}

/// A value can be used as a symbol if it is defined at the top level, is a constant, is an
/// apply whose operands are all valid symbols, or is a size query whose extent is static or
/// itself a valid symbol.
pub fn is_valid_symbol<'c, P: ValueProvenance<'c>>(values: &P, value: P::Value) -> bool {
    if values.value_type(value) != ValueType::Index {
        return false;
    }
    if values.is_top_level(value) {
        return true;
    }
    match values.definition(value) {
        ValueDef::Constant(_) => true,
        ValueDef::Apply { operands, .. } => operands.iter().all(|o| is_valid_symbol(values, *o)),
        ValueDef::DimSize {
            memref_top_level,
            extent,
        } => {
            memref_top_level
                || match extent {
                    Extent::Static(_) => true,
                    Extent::Dynamic(v) => is_valid_symbol(values, v),
                    Extent::Unknown => false,
                }
        }
        ValueDef::FunctionArgument
        | ValueDef::InductionVar
        | ValueDef::RegionArgument
        | ValueDef::Result => false,
    }
}

/// Returns true if `value` may index an affine memory access.
pub fn is_valid_affine_index_operand<'c, P: ValueProvenance<'c>>(
    values: &P,
    value: P::Value,
) -> bool {
    is_valid_dim(values, value) || is_valid_symbol(values, value)
}

pub fn constant_value<'c, P: ValueProvenance<'c>>(values: &P, value: P::Value) -> Option<i64> {
    match values.definition(value) {
        ValueDef::Constant(c) => Some(c),
        _ => None,
    }
}

/// The map of the apply producing `value`, if it is one.
pub(crate) fn producer_map<'c, P: ValueProvenance<'c>>(
    values: &P,
    value: P::Value,
) -> Option<AffineMap<'c>> {
    match values.definition(value) {
        ValueDef::Apply { map, .. } => Some(map),
        _ => None,
    }
}

pub(crate) fn is_producer<'c, P: ValueProvenance<'c>>(values: &P, value: P::Value) -> bool {
    producer_map(values, value).is_some()
}

#[cfg(test)]
mod tests {
    use super::{constant_value, is_valid_affine_index_operand, is_valid_dim, is_valid_symbol};
    use crate::context::Context;
    use crate::parse::parse_affine_map;
    use crate::value::{Extent, Placement, ValueTable, ValueType};

    #[test]
    fn test_arguments_and_constants_are_dims_and_symbols() {
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let c = values.constant(Placement::Nested, 4);
        for v in [n, c] {
            assert!(is_valid_dim(&values, v));
            assert!(is_valid_symbol(&values, v));
        }
        assert_eq!(constant_value(&values, c), Some(4));
        assert_eq!(constant_value(&values, n), None);
    }

    #[test]
    fn test_induction_var_is_only_a_dim() {
        let mut values = ValueTable::new();
        let i = values.induction_var();
        assert!(is_valid_dim(&values, i));
        assert!(!is_valid_symbol(&values, i));
        assert!(is_valid_affine_index_operand(&values, i));
    }

    #[test]
    fn test_region_argument_is_neither() {
        let mut values = ValueTable::new();
        let r = values.region_argument(ValueType::Index);
        assert!(!is_valid_dim(&values, r));
        assert!(!is_valid_symbol(&values, r));
        assert!(!is_valid_affine_index_operand(&values, r));
    }

    #[test]
    fn test_non_index_values_are_neither() {
        let mut values = ValueTable::new();
        let x = values.argument(ValueType::Integer { width: 32 });
        assert!(!is_valid_dim(&values, x));
        assert!(!is_valid_symbol(&values, x));
    }

    #[test]
    fn test_nested_apply_inherits_from_operands() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let i = values.induction_var();
        let map = parse_affine_map(&ctx, "(d0) -> (d0 + 1)").unwrap();
        let of_n = values.apply(Placement::Nested, map, &[n]).unwrap();
        let of_i = values.apply(Placement::Nested, map, &[i]).unwrap();
        assert!(is_valid_symbol(&values, of_n));
        assert!(is_valid_dim(&values, of_n));
        assert!(!is_valid_symbol(&values, of_i));
        assert!(is_valid_dim(&values, of_i));
    }

    #[test]
    fn test_nested_opaque_result_is_neither() {
        let mut values = ValueTable::new();
        let x = values.opaque(Placement::Nested, ValueType::Index);
        assert!(!is_valid_affine_index_operand(&values, x));
        let y = values.opaque(Placement::TopLevel, ValueType::Index);
        assert!(is_valid_dim(&values, y));
        assert!(is_valid_symbol(&values, y));
    }

    #[test]
    fn test_dim_size_symbol_validity() {
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let i = values.induction_var();
        let top = values.dim_size(Placement::Nested, true, Extent::Unknown).unwrap();
        let fixed = values
            .dim_size(Placement::Nested, false, Extent::Static(8))
            .unwrap();
        let by_arg = values
            .dim_size(Placement::Nested, false, Extent::Dynamic(n))
            .unwrap();
        let by_iv = values
            .dim_size(Placement::Nested, false, Extent::Dynamic(i))
            .unwrap();
        assert!(is_valid_symbol(&values, top));
        assert!(is_valid_dim(&values, top));
        assert!(is_valid_symbol(&values, fixed));
        assert!(!is_valid_dim(&values, fixed));
        assert!(is_valid_symbol(&values, by_arg));
        assert!(!is_valid_symbol(&values, by_iv));
    }
}

//! Computations that carry a map and the operands bound to its inputs.

use itertools::Itertools;
use smallvec::SmallVec;
use std::fmt::{self, Debug, Display};

use crate::context::Context;
use crate::map::AffineMap;
use crate::value::ValueProvenance;
use crate::verify::{
    verify_apply, verify_dim_and_symbol_identifiers, verify_index_operands, VerifyError,
};

/// A single-result map applied to operands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOp<'c, V> {
    pub map: AffineMap<'c>,
    pub operands: SmallVec<[V; 4]>,
}

/// A read of `memref` at the indices computed by `map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOp<'c, V> {
    pub memref: V,
    pub map: AffineMap<'c>,
    pub indices: SmallVec<[V; 4]>,
}

/// A write of `value` to `memref` at the indices computed by `map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOp<'c, V> {
    pub value: V,
    pub memref: V,
    pub map: AffineMap<'c>,
    pub indices: SmallVec<[V; 4]>,
}

/// One bound of a loop: the max (lower) or min (upper) of the results of `map`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound<'c, V> {
    pub map: AffineMap<'c>,
    pub operands: SmallVec<[V; 4]>,
}

/// The iteration space of an affine loop, `lower <= i < upper` stepping by `step`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForBounds<'c, V> {
    pub lower: Bound<'c, V>,
    pub upper: Bound<'c, V>,
    pub step: i64,
}

impl<'c, V: Copy + Debug> ApplyOp<'c, V> {
    pub fn new<P: ValueProvenance<'c, Value = V>>(
        values: &P,
        map: AffineMap<'c>,
        operands: &[V],
    ) -> Result<Self, VerifyError> {
        verify_apply(values, map, operands)?;
        verify_dim_and_symbol_identifiers(values, operands, map.num_dims())?;
        Ok(ApplyOp {
            map,
            operands: operands.into(),
        })
    }
}

impl<'c, V: Copy + Debug> LoadOp<'c, V> {
    pub fn new<P: ValueProvenance<'c, Value = V>>(
        values: &P,
        memref: V,
        map: AffineMap<'c>,
        indices: &[V],
    ) -> Result<Self, VerifyError> {
        verify_index_operands(values, map, indices)?;
        Ok(LoadOp {
            memref,
            map,
            indices: indices.into(),
        })
    }
}

impl<'c, V: Copy + Debug> StoreOp<'c, V> {
    pub fn new<P: ValueProvenance<'c, Value = V>>(
        values: &P,
        value: V,
        memref: V,
        map: AffineMap<'c>,
        indices: &[V],
    ) -> Result<Self, VerifyError> {
        verify_index_operands(values, map, indices)?;
        Ok(StoreOp {
            value,
            memref,
            map,
            indices: indices.into(),
        })
    }
}

impl<'c, V: Copy> Bound<'c, V> {
    pub fn new(map: AffineMap<'c>, operands: &[V]) -> Self {
        Bound {
            map,
            operands: operands.into(),
        }
    }

    pub fn constant(ctx: &'c Context, value: i64) -> Self {
        Bound {
            map: AffineMap::constant_map(ctx, value),
            operands: SmallVec::new(),
        }
    }
}

impl<'c, V: Copy + Debug> ForBounds<'c, V> {
    /// Both bounds must have at least one result, and their operands must be valid
    /// dimensions and symbols.
    pub fn new<P: ValueProvenance<'c, Value = V>>(
        values: &P,
        lower: Bound<'c, V>,
        upper: Bound<'c, V>,
        step: i64,
    ) -> Result<Self, VerifyError> {
        for bound in [&lower, &upper] {
            if bound.map.num_results() == 0 {
                return Err(VerifyError::ResultCount {
                    map: bound.map.to_string(),
                    count: 0,
                });
            }
            verify_index_operands(values, bound.map, &bound.operands)?;
            verify_dim_and_symbol_identifiers(values, &bound.operands, bound.map.num_dims())?;
        }
        Ok(ForBounds { lower, upper, step })
    }

    /// The number of iterations, if both bounds are constant.
    pub fn constant_trip_count(&self) -> Option<u64> {
        let lower = self.lower.as_constant()?;
        let upper = self.upper.as_constant()?;
        if upper <= lower || self.step <= 0 {
            return Some(0);
        }
        u64::try_from(crate::expr::ceil_div_i64(upper - lower, self.step)).ok()
    }
}

impl<V: Display> Display for Bound<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let (true, Some(c)) = (self.operands.is_empty(), self.as_constant()) {
            return write!(f, "{c}");
        }
        write!(f, "{}", self.map)?;
        write_operands(f, self.map.num_dims(), &self.operands)
    }
}

impl<V> Bound<'_, V> {
    /// The bound's value if its map is a single constant.
    pub fn as_constant(&self) -> Option<i64> {
        self.map.single_constant_result()
    }
}

impl<V: Display> Display for ForBounds<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.lower, self.upper)?;
        if self.step != 1 {
            write!(f, " step {}", self.step)?;
        }
        Ok(())
    }
}

/// Write operands as `(dims)[symbols]`.
pub(crate) fn write_operands<V: Display>(
    f: &mut fmt::Formatter<'_>,
    num_dims: usize,
    operands: &[V],
) -> fmt::Result {
    let (dims, symbols) = operands.split_at(num_dims.min(operands.len()));
    write!(f, "({})", dims.iter().join(", "))?;
    if !symbols.is_empty() {
        write!(f, "[{}]", symbols.iter().join(", "))?;
    }
    Ok(())
}

impl<V: Display> Display for ApplyOp<'_, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "apply {} ", self.map)?;
        write_operands(f, self.map.num_dims(), &self.operands)
    }
}

#[cfg(test)]
mod tests {
    use super::{ApplyOp, Bound, ForBounds, LoadOp};
    use crate::context::Context;
    use crate::parse::parse_affine_map;
    use crate::value::{Placement, ValueTable, ValueType};
    use crate::verify::VerifyError;

    #[test]
    fn test_apply_checks_identifiers() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let i = values.induction_var();
        let m = parse_affine_map(&ctx, "(d0)[s0] -> (d0 + s0)").unwrap();
        let op = ApplyOp::new(&values, m, &[i, n]).unwrap();
        assert_eq!(op.to_string(), "apply (d0)[s0] -> (d0 + s0) (%1)[%0]");
        assert_eq!(
            ApplyOp::new(&values, m, &[n, i]),
            Err(VerifyError::InvalidSymbol { position: 1 })
        );
    }

    #[test]
    fn test_load_checks_indices() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let mem = values.argument(ValueType::Integer { width: 64 });
        let i = values.induction_var();
        let junk = values.opaque(Placement::Nested, ValueType::Index);
        let m = parse_affine_map(&ctx, "(d0) -> (d0)").unwrap();
        assert!(LoadOp::new(&values, mem, m, &[i]).is_ok());
        assert_eq!(
            LoadOp::new(&values, mem, m, &[junk]),
            Err(VerifyError::InvalidIndex { position: 0 })
        );
    }

    #[test]
    fn test_constant_trip_count() {
        let ctx = Context::new();
        let values = ValueTable::new();
        let bounds = ForBounds::new(
            &values,
            Bound::<crate::value::ValueId>::constant(&ctx, 0),
            Bound::constant(&ctx, 10),
            3,
        )
        .unwrap();
        assert_eq!(bounds.constant_trip_count(), Some(4));
        assert_eq!(bounds.to_string(), "0 to 10 step 3");
    }
}

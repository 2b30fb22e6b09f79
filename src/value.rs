use smallvec::SmallVec;
use std::{
    fmt::{self, Debug, Display},
    hash::Hash,
};

use crate::map::AffineMap;
use crate::verify::{verify_apply, VerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Index,
    Integer { width: u32 },
}

/// The extent of one dimension of a memory object, as seen by a size query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extent<V> {
    Static(i64),
    /// A dynamic size given by a value.
    Dynamic(V),
    /// A dynamic size whose defining value isn't known.
    Unknown,
}

/// How a value came to be. This is all the classifier and the normalizer need to know about
/// the enclosing IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueDef<'c, 'a, V> {
    FunctionArgument,
    /// The induction variable of an affine loop.
    InductionVar,
    /// An argument of any other region.
    RegionArgument,
    Constant(i64),
    /// The single result of applying `map` to `operands`.
    Apply {
        map: AffineMap<'c>,
        operands: &'a [V],
    },
    /// A query for one dimension's size of a memory object.
    DimSize {
        memref_top_level: bool,
        extent: Extent<V>,
    },
    /// The result of some other operation.
    Result,
}

/// The seam between map/operand algebra and the IR that owns the operands.
pub trait ValueProvenance<'c> {
    type Value: Copy + Eq + Hash + Debug;

    fn value_type(&self, value: Self::Value) -> ValueType;

    /// Returns true if `value` is defined directly in a function body (or is one of its
    /// arguments) rather than inside a nested region.
    fn is_top_level(&self, value: Self::Value) -> bool;

    fn definition(&self, value: Self::Value) -> ValueDef<'c, '_, Self::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(u32);

/// Where a new value is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    TopLevel,
    Nested,
}

#[derive(Debug, Clone)]
enum Def<'c> {
    FunctionArgument,
    InductionVar,
    RegionArgument,
    Constant(i64),
    Apply {
        map: AffineMap<'c>,
        operands: SmallVec<[ValueId; 4]>,
    },
    DimSize {
        memref_top_level: bool,
        extent: Extent<ValueId>,
    },
    Result,
}

#[derive(Debug, Clone)]
struct ValueInfo<'c> {
    ty: ValueType,
    top_level: bool,
    def: Def<'c>,
}

/// An append-only arena of values. A value can only be defined in terms of values created
/// before it, so producer chains are always acyclic.
#[derive(Debug, Clone, Default)]
pub struct ValueTable<'c> {
    values: Vec<ValueInfo<'c>>,
}

impl<'c> ValueTable<'c> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: ValueId) -> bool {
        (value.0 as usize) < self.values.len()
    }

    fn push(&mut self, ty: ValueType, placement: Placement, def: Def<'c>) -> ValueId {
        let id = ValueId(u32::try_from(self.values.len()).expect("too many values"));
        self.values.push(ValueInfo {
            ty,
            top_level: placement == Placement::TopLevel,
            def,
        });
        id
    }

    fn info(&self, value: ValueId) -> &ValueInfo<'c> {
        &self.values[value.0 as usize]
    }

    pub fn argument(&mut self, ty: ValueType) -> ValueId {
        self.push(ty, Placement::TopLevel, Def::FunctionArgument)
    }

    pub fn induction_var(&mut self) -> ValueId {
        self.push(ValueType::Index, Placement::Nested, Def::InductionVar)
    }

    pub fn region_argument(&mut self, ty: ValueType) -> ValueId {
        self.push(ty, Placement::Nested, Def::RegionArgument)
    }

    pub fn constant(&mut self, placement: Placement, value: i64) -> ValueId {
        self.push(ValueType::Index, placement, Def::Constant(value))
    }

    /// Define the result of applying `map` to `operands`, which must pass [verify_apply].
    pub fn apply(
        &mut self,
        placement: Placement,
        map: AffineMap<'c>,
        operands: &[ValueId],
    ) -> Result<ValueId, VerifyError> {
        if let Some(unknown) = operands.iter().find(|o| !self.contains(**o)) {
            return Err(VerifyError::UnknownValue(unknown.to_string()));
        }
        verify_apply(self, map, operands)?;
        Ok(self.push(
            ValueType::Index,
            placement,
            Def::Apply {
                map,
                operands: operands.into(),
            },
        ))
    }

    pub fn dim_size(
        &mut self,
        placement: Placement,
        memref_top_level: bool,
        extent: Extent<ValueId>,
    ) -> Result<ValueId, VerifyError> {
        if let Extent::Dynamic(v) = extent {
            if !self.contains(v) {
                return Err(VerifyError::UnknownValue(v.to_string()));
            }
        }
        Ok(self.push(
            ValueType::Index,
            placement,
            Def::DimSize {
                memref_top_level,
                extent,
            },
        ))
    }

    /// The result of an operation this table knows nothing else about.
    pub fn opaque(&mut self, placement: Placement, ty: ValueType) -> ValueId {
        self.push(ty, placement, Def::Result)
    }

    /// Interpret `value`, reading leaves (arguments, induction variables, opaque results)
    /// from `inputs`.
    #[cfg(test)]
    pub fn interpret(&self, value: ValueId, inputs: &std::collections::HashMap<ValueId, i64>) -> i64 {
        match &self.info(value).def {
            Def::Constant(c) => *c,
            Def::Apply { map, operands } => {
                let operand_values = operands
                    .iter()
                    .map(|o| Some(self.interpret(*o, inputs)))
                    .collect::<Vec<_>>();
                map.constant_fold(&operand_values).unwrap().unwrap()[0]
            }
            _ => inputs[&value],
        }
    }
}

impl<'c> ValueProvenance<'c> for ValueTable<'c> {
    type Value = ValueId;

    fn value_type(&self, value: ValueId) -> ValueType {
        self.info(value).ty
    }

    fn is_top_level(&self, value: ValueId) -> bool {
        self.info(value).top_level
    }

    fn definition(&self, value: ValueId) -> ValueDef<'c, '_, ValueId> {
        match &self.info(value).def {
            Def::FunctionArgument => ValueDef::FunctionArgument,
            Def::InductionVar => ValueDef::InductionVar,
            Def::RegionArgument => ValueDef::RegionArgument,
            Def::Constant(c) => ValueDef::Constant(*c),
            Def::Apply { map, operands } => ValueDef::Apply {
                map: *map,
                operands,
            },
            Def::DimSize {
                memref_top_level,
                extent,
            } => ValueDef::DimSize {
                memref_top_level: *memref_top_level,
                extent: *extent,
            },
            Def::Result => ValueDef::Result,
        }
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Index => write!(f, "index"),
            ValueType::Integer { width } => write!(f, "i{width}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Extent, Placement, ValueDef, ValueProvenance, ValueTable, ValueType};
    use crate::context::Context;
    use crate::parse::parse_affine_map;
    use crate::verify::VerifyError;

    #[test]
    fn test_apply_records_its_producer() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let map = parse_affine_map(&ctx, "(d0) -> (d0 + 1)").unwrap();
        let a = values.apply(Placement::TopLevel, map, &[n]).unwrap();
        assert_eq!(
            values.definition(a),
            ValueDef::Apply {
                map,
                operands: &[n]
            }
        );
        assert!(values.is_top_level(a));
    }

    #[test]
    fn test_apply_is_verified() {
        let ctx = Context::new();
        let mut values = ValueTable::new();
        let n = values.argument(ValueType::Index);
        let map = parse_affine_map(&ctx, "(d0)[s0] -> (d0 + s0)").unwrap();
        assert!(matches!(
            values.apply(Placement::TopLevel, map, &[n]),
            Err(VerifyError::OperandCountMismatch { .. })
        ));
    }

    #[test]
    fn test_values_from_another_table_are_rejected() {
        let mut other = ValueTable::new();
        other.argument(ValueType::Index);
        let foreign = other.argument(ValueType::Index);
        let mut values = ValueTable::new();
        assert!(matches!(
            values.dim_size(Placement::Nested, false, Extent::Dynamic(foreign)),
            Err(VerifyError::UnknownValue(_))
        ));
    }

    #[test]
    fn test_display() {
        let mut values = ValueTable::new();
        values.argument(ValueType::Index);
        let x = values.opaque(Placement::Nested, ValueType::Integer { width: 32 });
        assert_eq!(x.to_string(), "%1");
        assert_eq!(values.value_type(x).to_string(), "i32");
    }
}

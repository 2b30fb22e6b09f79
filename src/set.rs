use smallvec::SmallVec;
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

use crate::context::{Context, SetId, SetStorage};
use crate::expr::AffineExpr;
use crate::map::write_dims_and_symbols;

/// A uniqued conjunction of affine constraints over dimensions and symbols. Each constraint
/// is an expression that must be either `== 0` or `>= 0`.
#[derive(Clone, Copy)]
pub struct IntegerSet<'c> {
    ctx: &'c Context,
    id: SetId,
}

impl<'c> IntegerSet<'c> {
    pub fn get(
        ctx: &'c Context,
        num_dims: usize,
        num_symbols: usize,
        constraints: &[AffineExpr<'c>],
        eq_flags: &[bool],
    ) -> Self {
        assert_eq!(constraints.len(), eq_flags.len());
        let storage = SetStorage {
            num_dims,
            num_symbols,
            constraints: constraints.iter().map(|c| c.id()).collect(),
            eq_flags: eq_flags.into(),
        };
        IntegerSet {
            ctx,
            id: ctx.intern_set(storage),
        }
    }

    /// The canonical empty set, `1 == 0`.
    pub fn empty(ctx: &'c Context, num_dims: usize, num_symbols: usize) -> Self {
        IntegerSet::get(ctx, num_dims, num_symbols, &[ctx.constant(1)], &[true])
    }

    pub fn is_empty_integer_set(&self) -> bool {
        *self == IntegerSet::empty(self.ctx, self.num_dims(), self.num_symbols())
    }

    pub fn context(&self) -> &'c Context {
        self.ctx
    }

    fn storage(&self) -> SetStorage {
        self.ctx.set_storage(self.id)
    }

    pub fn num_dims(&self) -> usize {
        self.storage().num_dims
    }

    pub fn num_symbols(&self) -> usize {
        self.storage().num_symbols
    }

    pub fn num_inputs(&self) -> usize {
        let s = self.storage();
        s.num_dims + s.num_symbols
    }

    pub fn num_constraints(&self) -> usize {
        self.storage().constraints.len()
    }

    pub fn num_equalities(&self) -> usize {
        self.storage().eq_flags.iter().filter(|e| **e).count()
    }

    pub fn num_inequalities(&self) -> usize {
        self.num_constraints() - self.num_equalities()
    }

    pub fn constraints(&self) -> SmallVec<[AffineExpr<'c>; 4]> {
        self.storage()
            .constraints
            .iter()
            .map(|&id| AffineExpr::from_id(self.ctx, id))
            .collect()
    }

    pub fn eq_flags(&self) -> SmallVec<[bool; 4]> {
        self.storage().eq_flags.iter().copied().collect()
    }

    pub fn is_eq(&self, idx: usize) -> bool {
        self.storage().eq_flags[idx]
    }

    pub fn walk_exprs(&self, mut callback: impl FnMut(AffineExpr<'c>)) {
        for c in self.constraints() {
            c.walk(&mut callback);
        }
    }

    pub fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
        num_result_dims: usize,
        num_result_symbols: usize,
    ) -> Self {
        let constraints = self
            .constraints()
            .iter()
            .map(|c| c.replace_dims_and_symbols(dim_replacements, sym_replacements))
            .collect::<SmallVec<[_; 4]>>();
        IntegerSet::get(
            self.ctx,
            num_result_dims,
            num_result_symbols,
            &constraints,
            &self.eq_flags(),
        )
    }

    /// Returns whether the point given by `operands` (dimensions, then symbols) satisfies
    /// every constraint, or `None` if that depends on an unknown operand.
    pub fn contains(
        &self,
        operands: &[Option<i64>],
    ) -> Result<Option<bool>, crate::expr::EvalError> {
        let split = self.num_dims().min(operands.len());
        let (dims, syms) = operands.split_at(split);
        for (c, is_eq) in self.constraints().into_iter().zip(self.eq_flags()) {
            match c.evaluate(dims, syms)? {
                Some(v) if (is_eq && v == 0) || (!is_eq && v >= 0) => {}
                Some(_) => return Ok(Some(false)),
                None => return Ok(None),
            }
        }
        Ok(Some(true))
    }
}

impl PartialEq for IntegerSet<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.ctx, other.ctx) && self.id == other.id
    }
}

impl Eq for IntegerSet<'_> {}

impl Hash for IntegerSet<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for IntegerSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dims_and_symbols(f, self.num_dims(), self.num_symbols())?;
        write!(f, " : (")?;
        for (i, (c, is_eq)) in self
            .constraints()
            .into_iter()
            .zip(self.eq_flags())
            .enumerate()
        {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c} {} 0", if is_eq { "==" } else { ">=" })?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for IntegerSet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegerSet({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::IntegerSet;
    use crate::context::Context;
    use crate::parse::parse_integer_set;

    #[test]
    fn test_display_round_trips() {
        let ctx = Context::new();
        let src = "(d0)[s0] : (d0 - s0 >= 0, d0 == 0)";
        let set = parse_integer_set(&ctx, src).unwrap();
        assert_eq!(set.to_string(), src);
        assert_eq!(set.num_equalities(), 1);
        assert_eq!(set.num_inequalities(), 1);
    }

    #[test]
    fn test_replace_dims_and_symbols() {
        let ctx = Context::new();
        let set = parse_integer_set(&ctx, "(d0)[s0] : (d0 - s0 >= 0)").unwrap();
        let replaced = set.replace_dims_and_symbols(&[ctx.dim(0) * 2], &[ctx.constant(4)], 1, 0);
        assert_eq!(replaced, parse_integer_set(&ctx, "(d0) : (d0 * 2 - 4 >= 0)").unwrap());
    }

    #[test]
    fn test_contains() {
        let ctx = Context::new();
        let set = parse_integer_set(&ctx, "(d0)[s0] : (d0 - s0 >= 0, d0 mod 2 == 0)").unwrap();
        assert_eq!(set.contains(&[Some(4), Some(3)]), Ok(Some(true)));
        assert_eq!(set.contains(&[Some(5), Some(3)]), Ok(Some(false)));
        assert_eq!(set.contains(&[Some(2), Some(3)]), Ok(Some(false)));
        assert_eq!(set.contains(&[Some(4), None]), Ok(None));
    }

    #[test]
    fn test_empty_set() {
        let ctx = Context::new();
        let empty = IntegerSet::empty(&ctx, 1, 0);
        assert!(empty.is_empty_integer_set());
        assert_eq!(empty.contains(&[Some(0)]), Ok(Some(false)));
    }
}

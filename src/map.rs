use itertools::Itertools;
use smallvec::SmallVec;
use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
};

use crate::context::{Context, MapId, MapStorage};
use crate::expr::{AffineExpr, EvalError};
use crate::linear::simplify_affine_expr;

/// A uniqued affine map `(d0, ..., dn)[s0, ..., sm] -> (e0, ..., ek)`.
///
/// Like [AffineExpr], an `AffineMap` is a handle into its [Context] and compares by identity.
/// Maps are never mutated; every transformation returns a new map.
#[derive(Clone, Copy)]
pub struct AffineMap<'c> {
    ctx: &'c Context,
    id: MapId,
}

impl<'c> AffineMap<'c> {
    pub fn get(
        ctx: &'c Context,
        num_dims: usize,
        num_symbols: usize,
        results: &[AffineExpr<'c>],
    ) -> Self {
        debug_assert!(results.iter().all(|r| std::ptr::eq(r.context(), ctx)));
        let storage = MapStorage {
            num_dims,
            num_symbols,
            results: results.iter().map(|r| r.id()).collect(),
        };
        AffineMap {
            ctx,
            id: ctx.intern_map(storage),
        }
    }

    /// The map `() -> ()`.
    pub fn empty(ctx: &'c Context) -> Self {
        AffineMap::get(ctx, 0, 0, &[])
    }

    pub fn constant_map(ctx: &'c Context, value: i64) -> Self {
        AffineMap::get(ctx, 0, 0, &[ctx.constant(value)])
    }

    /// `(d0, ..., d{n-1}) -> (d0, ..., d{n-1})`
    pub fn multi_dim_identity(ctx: &'c Context, num_dims: usize) -> Self {
        let results = (0..num_dims).map(|i| ctx.dim(i)).collect::<SmallVec<[_; 4]>>();
        AffineMap::get(ctx, num_dims, 0, &results)
    }

    /// The map sending result `i` to dimension `permutation[i]`. `permutation` must be a
    /// permutation of `0..permutation.len()`.
    pub fn permutation(ctx: &'c Context, permutation: &[usize]) -> Self {
        let results = permutation
            .iter()
            .map(|&p| ctx.dim(p))
            .collect::<SmallVec<[_; 4]>>();
        let map = AffineMap::get(ctx, permutation.len(), 0, &results);
        debug_assert!(map.is_permutation(), "{permutation:?} is not a permutation");
        map
    }

    /// A map whose results are those of every map in `maps`, in order. Dimension and symbol
    /// counts are the maxima over `maps`.
    pub fn concat(ctx: &'c Context, maps: &[AffineMap<'c>]) -> Self {
        let num_dims = maps.iter().map(|m| m.num_dims()).max().unwrap_or(0);
        let num_symbols = maps.iter().map(|m| m.num_symbols()).max().unwrap_or(0);
        let results = maps
            .iter()
            .flat_map(|m| m.results())
            .collect::<SmallVec<[_; 8]>>();
        AffineMap::get(ctx, num_dims, num_symbols, &results)
    }

    pub fn context(&self) -> &'c Context {
        self.ctx
    }

    fn storage(&self) -> MapStorage {
        self.ctx.map_storage(self.id)
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

    pub fn num_results(&self) -> usize {
        self.storage().results.len()
    }

    pub fn results(&self) -> SmallVec<[AffineExpr<'c>; 4]> {
        self.storage()
            .results
            .iter()
            .map(|&id| AffineExpr::from_id(self.ctx, id))
            .collect()
    }

    pub fn result(&self, idx: usize) -> AffineExpr<'c> {
        AffineExpr::from_id(self.ctx, self.storage().results[idx])
    }

    /// Returns true for `(d0, ..., dn) -> (d0, ..., dn)`, ignoring symbols.
    pub fn is_identity(&self) -> bool {
        self.num_dims() == self.num_results()
            && self
                .results()
                .iter()
                .enumerate()
                .all(|(i, r)| r.as_dim() == Some(i))
    }

    /// Returns true if the map has no inputs and no results.
    pub fn is_empty(&self) -> bool {
        self.num_inputs() == 0 && self.num_results() == 0
    }

    pub fn is_single_constant(&self) -> bool {
        self.single_constant_result().is_some()
    }

    pub fn single_constant_result(&self) -> Option<i64> {
        match self.results().as_slice() {
            [r] => r.as_constant(),
            _ => None,
        }
    }

    pub fn walk_exprs(&self, mut callback: impl FnMut(AffineExpr<'c>)) {
        for r in self.results() {
            r.walk(&mut callback);
        }
    }

    /// The map with only the results at `result_positions`, in that order.
    pub fn sub_map(&self, result_positions: &[usize]) -> Self {
        let results = self.results();
        let picked = result_positions
            .iter()
            .map(|&i| results[i])
            .collect::<SmallVec<[_; 4]>>();
        AffineMap::get(self.ctx, self.num_dims(), self.num_symbols(), &picked)
    }

    /// Returns true if every result is a distinct dimension.
    pub fn is_projected_permutation(&self) -> bool {
        if self.num_symbols() > 0 {
            return false;
        }
        let mut seen = vec![false; self.num_dims()];
        for r in self.results() {
            match r.as_dim() {
                Some(d) if d < seen.len() && !seen[d] => seen[d] = true,
                _ => return false,
            }
        }
        true
    }

    pub fn is_permutation(&self) -> bool {
        self.num_dims() == self.num_results() && self.is_projected_permutation()
    }

    /// For a map whose dimension results cover every dimension, the map sending each
    /// dimension back to the (first) result position that produced it. Non-dimension
    /// results are ignored.
    pub fn inverse_permutation(&self) -> Option<Self> {
        if self.is_empty() {
            return Some(*self);
        }
        let mut exprs: SmallVec<[Option<AffineExpr<'c>>; 4]> =
            SmallVec::from_elem(None, self.num_dims());
        for (i, r) in self.results().into_iter().enumerate() {
            if let Some(slot) = r.as_dim().and_then(|d| exprs.get_mut(d)) {
                if slot.is_none() {
                    *slot = Some(self.ctx.dim(i));
                }
            }
        }
        let exprs = exprs.into_iter().collect::<Option<SmallVec<[_; 4]>>>()?;
        Some(AffineMap::get(self.ctx, self.num_results(), 0, &exprs))
    }

    /// Substitute `dim_replacements[i]` for `d{i}` and `sym_replacements[j]` for `s{j}` in
    /// every result, returning a map with the given dimension and symbol counts. References
    /// past the end of a replacement slice are kept as they are.
    pub fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
        num_result_dims: usize,
        num_result_symbols: usize,
    ) -> Self {
        let results = self
            .results()
            .iter()
            .map(|r| r.replace_dims_and_symbols(dim_replacements, sym_replacements))
            .collect::<SmallVec<[_; 4]>>();
        AffineMap::get(self.ctx, num_result_dims, num_result_symbols, &results)
    }

    /// Returns `self ∘ producer`: the results of `producer` are substituted for the
    /// dimensions of `self`.
    ///
    /// The result has `producer`'s dimensions and `self.num_symbols() +
    /// producer.num_symbols()` symbols, with `self`'s symbols first.
    pub fn compose(&self, producer: AffineMap<'c>) -> Self {
        assert_eq!(
            self.num_dims(),
            producer.num_results(),
            "cannot compose {self} with {producer}"
        );
        let num_dims = producer.num_dims();
        let num_symbols = self.num_symbols() + producer.num_symbols();
        let new_dims = (0..num_dims)
            .map(|i| self.ctx.dim(i))
            .collect::<SmallVec<[_; 8]>>();
        let new_symbols = (self.num_symbols()..num_symbols)
            .map(|i| self.ctx.symbol(i))
            .collect::<SmallVec<[_; 8]>>();
        let shifted_producer =
            producer.replace_dims_and_symbols(&new_dims, &new_symbols, num_dims, num_symbols);
        let results = self
            .results()
            .iter()
            .map(|r| r.compose(shifted_producer))
            .collect::<SmallVec<[_; 4]>>();
        AffineMap::get(self.ctx, num_dims, num_symbols, &results)
    }

    /// Evaluate every result given the constant value (if any) of each operand, dimensions
    /// first.
    ///
    /// Returns `Ok(None)` if any result depends on a non-constant operand.
    pub fn constant_fold(
        &self,
        operand_constants: &[Option<i64>],
    ) -> Result<Option<SmallVec<[i64; 4]>>, EvalError> {
        let split = self.num_dims().min(operand_constants.len());
        let (dims, syms) = operand_constants.split_at(split);
        let mut folded = SmallVec::new();
        for r in self.results() {
            match r.evaluate(dims, syms)? {
                Some(v) => folded.push(v),
                None => return Ok(None),
            }
        }
        Ok(Some(folded))
    }
}

impl PartialEq for AffineMap<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.ctx, other.ctx) && self.id == other.id
    }
}

impl Eq for AffineMap<'_> {}

impl Hash for AffineMap<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Display for AffineMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_dims_and_symbols(f, self.num_dims(), self.num_symbols())?;
        write!(f, " -> ({})", self.results().iter().join(", "))
    }
}

impl fmt::Debug for AffineMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffineMap({self})")
    }
}

/// Writes `(d0, d1)[s0]`, omitting the brackets when there are no symbols.
pub(crate) fn write_dims_and_symbols(
    f: &mut fmt::Formatter<'_>,
    num_dims: usize,
    num_symbols: usize,
) -> fmt::Result {
    write!(f, "({})", (0..num_dims).map(|i| format!("d{i}")).join(", "))?;
    if num_symbols > 0 {
        write!(f, "[{}]", (0..num_symbols).map(|i| format!("s{i}")).join(", "))?;
    }
    Ok(())
}

/// A non-uniqued affine map whose results can be changed in place while it is being
/// simplified.
#[derive(Debug, Clone)]
pub struct MutableAffineMap<'c> {
    ctx: &'c Context,
    results: SmallVec<[AffineExpr<'c>; 4]>,
    num_dims: usize,
    num_symbols: usize,
}

impl<'c> MutableAffineMap<'c> {
    pub fn new(map: AffineMap<'c>) -> Self {
        MutableAffineMap {
            ctx: map.context(),
            results: map.results(),
            num_dims: map.num_dims(),
            num_symbols: map.num_symbols(),
        }
    }

    pub fn result(&self, idx: usize) -> AffineExpr<'c> {
        self.results[idx]
    }

    pub fn num_results(&self) -> usize {
        self.results.len()
    }

    pub fn set_result(&mut self, idx: usize, result: AffineExpr<'c>) {
        self.results[idx] = result;
    }

    pub fn num_dims(&self) -> usize {
        self.num_dims
    }

    pub fn set_num_dims(&mut self, num_dims: usize) {
        self.num_dims = num_dims;
    }

    pub fn num_symbols(&self) -> usize {
        self.num_symbols
    }

    pub fn set_num_symbols(&mut self, num_symbols: usize) {
        self.num_symbols = num_symbols;
    }

    /// Returns true if the result at `idx` is known to always be a multiple of `factor`.
    pub fn is_multiple_of(&self, idx: usize, factor: i64) -> bool {
        if self.results[idx].is_multiple_of(factor) {
            return true;
        }
        simplify_affine_expr(self.results[idx]).is_multiple_of(factor)
    }

    /// Simplify every result in place.
    pub fn simplify(&mut self) {
        for r in &mut self.results {
            *r = simplify_affine_expr(*r);
        }
    }

    pub fn to_affine_map(&self) -> AffineMap<'c> {
        AffineMap::get(self.ctx, self.num_dims, self.num_symbols, &self.results)
    }
}

/// Simplify every result of `map`.
pub fn simplify_affine_map(map: AffineMap<'_>) -> AffineMap<'_> {
    let mut m = MutableAffineMap::new(map);
    m.simplify();
    m.to_affine_map()
}

#[cfg(test)]
pub fn arb_map_shape(
    num_dims: usize,
    num_symbols: usize,
    num_results: usize,
) -> impl proptest::strategy::Strategy<Value = Vec<crate::expr::ExprShape>> {
    proptest::collection::vec(
        crate::expr::arb_expr_shape(num_dims, num_symbols, false),
        num_results,
    )
}

#[cfg(test)]
pub fn build_map<'c>(
    ctx: &'c Context,
    num_dims: usize,
    num_symbols: usize,
    shape: &[crate::expr::ExprShape],
) -> AffineMap<'c> {
    let results = shape.iter().map(|s| s.build(ctx)).collect::<Vec<_>>();
    AffineMap::get(ctx, num_dims, num_symbols, &results)
}

#[cfg(test)]
mod tests {
    use super::{arb_map_shape, build_map, simplify_affine_map, AffineMap, MutableAffineMap};
    use crate::context::Context;
    use crate::parse::parse_affine_map;
    use proptest::prelude::*;

    fn map<'c>(ctx: &'c Context, src: &str) -> AffineMap<'c> {
        parse_affine_map(ctx, src).unwrap()
    }

    #[test]
    fn test_maps_are_uniqued() {
        let ctx = Context::new();
        let a = map(&ctx, "(d0)[s0] -> (d0 + s0)");
        let b = map(&ctx, "(i)[n] -> (i + n)");
        assert_eq!(a, b);
        assert_ne!(a, map(&ctx, "(d0, d1)[s0] -> (d0 + s0)"));
    }

    #[test]
    fn test_display() {
        let ctx = Context::new();
        assert_eq!(
            map(&ctx, "(d0, d1)[s0] -> (d0 + s0, d1 floordiv 2)").to_string(),
            "(d0, d1)[s0] -> (d0 + s0, d1 floordiv 2)"
        );
        assert_eq!(AffineMap::constant_map(&ctx, 7).to_string(), "() -> (7)");
        assert_eq!(AffineMap::empty(&ctx).to_string(), "() -> ()");
    }

    #[test]
    fn test_compose_numbers_producer_symbols_last() {
        let ctx = Context::new();
        let consumer = map(&ctx, "(d0)[s0] -> (d0 + s0)");
        let producer = map(&ctx, "(d0)[s0] -> (d0 * 2 + s0)");
        let composed = simplify_affine_map(consumer.compose(producer));
        assert_eq!(
            composed,
            simplify_affine_map(map(&ctx, "(d0)[s0, s1] -> (d0 * 2 + s1 + s0)"))
        );
    }

    #[test]
    fn test_compose_with_identity_is_noop() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0, d1)[s0] -> (d0 + s0, d1 mod 4)");
        assert_eq!(m.compose(AffineMap::multi_dim_identity(&ctx, 2)), m);
    }

    #[test]
    fn test_replace_dims_and_symbols() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0, d1)[s0] -> (d0 + d1 * s0)");
        let replaced = m.replace_dims_and_symbols(
            &[ctx.dim(1), ctx.dim(0)],
            &[ctx.constant(3)],
            2,
            0,
        );
        assert_eq!(replaced, map(&ctx, "(d0, d1) -> (d1 + d0 * 3)"));
    }

    #[test]
    fn test_identity_and_permutations() {
        let ctx = Context::new();
        assert!(AffineMap::multi_dim_identity(&ctx, 3).is_identity());
        let perm = AffineMap::permutation(&ctx, &[2, 0, 1]);
        assert!(perm.is_permutation());
        assert!(!perm.is_identity());
        let inverse = perm.inverse_permutation().unwrap();
        assert_eq!(inverse, map(&ctx, "(d0, d1, d2) -> (d1, d2, d0)"));
        assert!(perm.compose(inverse).is_identity());

        let projected = map(&ctx, "(d0, d1, d2) -> (d2, d0)");
        assert!(projected.is_projected_permutation());
        assert!(!projected.is_permutation());
        assert_eq!(projected.inverse_permutation(), None);
        assert!(!map(&ctx, "(d0, d1) -> (d0, d0)").is_projected_permutation());
    }

    #[test]
    fn test_sub_map_and_concat() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0, d1) -> (d0, d1, d0 + d1)");
        assert_eq!(m.sub_map(&[2, 0]), map(&ctx, "(d0, d1) -> (d0 + d1, d0)"));
        let a = map(&ctx, "(d0) -> (d0)");
        let b = map(&ctx, "(d0, d1)[s0] -> (d1 + s0)");
        assert_eq!(
            AffineMap::concat(&ctx, &[a, b]),
            map(&ctx, "(d0, d1)[s0] -> (d0, d1 + s0)")
        );
    }

    #[test]
    fn test_single_constant() {
        let ctx = Context::new();
        assert_eq!(AffineMap::constant_map(&ctx, 7).single_constant_result(), Some(7));
        assert!(!map(&ctx, "() -> (1, 2)").is_single_constant());
        assert!(AffineMap::empty(&ctx).is_empty());
    }

    #[test]
    fn test_constant_fold_floors_negative_operands() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0) -> (d0 floordiv 4)");
        assert_eq!(m.constant_fold(&[Some(-1)]).unwrap().unwrap().as_slice(), &[-1]);
    }

    #[test]
    fn test_constant_fold_with_unknown_operand() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0)[s0] -> (d0, s0)");
        assert_eq!(m.constant_fold(&[Some(1), None]), Ok(None));
        let m = map(&ctx, "(d0)[s0] -> (d0)");
        assert_eq!(
            m.constant_fold(&[Some(1), None]).unwrap().unwrap().as_slice(),
            &[1]
        );
    }

    #[test]
    fn test_constant_fold_zero_divisor_is_error() {
        let ctx = Context::new();
        let m = map(&ctx, "(d0)[s0] -> (d0 mod s0)");
        assert!(m.constant_fold(&[Some(5), Some(0)]).is_err());
    }

    #[test]
    fn test_mutable_map() {
        let ctx = Context::new();
        let mut m = MutableAffineMap::new(map(&ctx, "(d0, d1) -> (d0 * 4 + d1 * 8, d0)"));
        assert!(m.is_multiple_of(0, 4));
        assert!(!m.is_multiple_of(1, 4));
        m.set_result(1, ctx.dim(1) + ctx.dim(1));
        m.set_num_symbols(1);
        m.simplify();
        assert_eq!(
            m.to_affine_map(),
            map(&ctx, "(d0, d1)[s0] -> (d0 * 4 + d1 * 8, d1 * 2)")
        );
    }

    proptest! {
        #[test]
        fn test_compose_is_associative(
            a in arb_map_shape(2, 1, 1),
            b in arb_map_shape(2, 1, 2),
            c in arb_map_shape(1, 1, 2),
            inputs in proptest::collection::vec(-8i64..9, 4),
        ) {
            let ctx = Context::new();
            let a = build_map(&ctx, 2, 1, &a);
            let b = build_map(&ctx, 2, 1, &b);
            let c = build_map(&ctx, 1, 1, &c);
            let left = a.compose(b).compose(c);
            let right = a.compose(b.compose(c));
            prop_assert_eq!(left.num_inputs(), right.num_inputs());
            let inputs = inputs.into_iter().map(Some).collect::<Vec<_>>();
            prop_assert_eq!(left.constant_fold(&inputs), right.constant_fold(&inputs));
        }

        #[test]
        fn test_simplify_map_preserves_value(
            shape in arb_map_shape(2, 2, 3),
            inputs in proptest::collection::vec(-8i64..9, 4),
        ) {
            let ctx = Context::new();
            let m = build_map(&ctx, 2, 2, &shape);
            let inputs = inputs.into_iter().map(Some).collect::<Vec<_>>();
            prop_assert_eq!(
                m.constant_fold(&inputs),
                simplify_affine_map(m).constant_fold(&inputs)
            );
        }
    }
}

use divrem::{DivCeil, DivFloor, RemFloor};
use std::{
    cmp::Ordering,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    ops::{Add, Mul, Neg, Rem, Sub},
};

use crate::context::{Context, ExprId, ExprNode};
use crate::map::AffineMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BinaryKind {
    Add,
    /// The right-hand side is a constant in pure affine expressions.
    Mul,
    FloorDiv,
    CeilDiv,
    /// Always non-negative for a positive right-hand side.
    Mod,
}

/// A uniqued affine expression.
///
/// `AffineExpr` is a cheap handle into its [Context]. Two expressions are equal exactly when
/// they are the same uniqued node, which (since construction goes through the uniquing
/// table) is when they are structurally equal.
#[derive(Clone, Copy)]
pub struct AffineExpr<'c> {
    ctx: &'c Context,
    id: ExprId,
}

/// A one-level view of an [AffineExpr].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AffineExprKind<'c> {
    Dim(usize),
    Symbol(usize),
    Constant(i64),
    Binary(BinaryKind, AffineExpr<'c>, AffineExpr<'c>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("Division by zero while evaluating `{0}`")]
    DivisionByZero(String),
    #[error("Dimension d{0} has no operand")]
    UnboundDim(usize),
    #[error("Symbol s{0} has no operand")]
    UnboundSymbol(usize),
}

/// Things that can be turned into an [AffineExpr] in a given [Context]: expressions
/// themselves and integer constants.
pub trait IntoAffineExpr<'c> {
    fn into_affine_expr(self, ctx: &'c Context) -> AffineExpr<'c>;
}

impl<'c> IntoAffineExpr<'c> for AffineExpr<'c> {
    fn into_affine_expr(self, _ctx: &'c Context) -> AffineExpr<'c> {
        self
    }
}

impl<'c> IntoAffineExpr<'c> for i64 {
    fn into_affine_expr(self, ctx: &'c Context) -> AffineExpr<'c> {
        ctx.constant(self)
    }
}

impl<'c> IntoAffineExpr<'c> for i32 {
    fn into_affine_expr(self, ctx: &'c Context) -> AffineExpr<'c> {
        ctx.constant(i64::from(self))
    }
}

impl Context {
    pub fn dim(&self, position: usize) -> AffineExpr<'_> {
        self.wrap(ExprNode::Dim(position))
    }

    pub fn symbol(&self, position: usize) -> AffineExpr<'_> {
        self.wrap(ExprNode::Symbol(position))
    }

    pub fn constant(&self, value: i64) -> AffineExpr<'_> {
        self.wrap(ExprNode::Constant(value))
    }

    /// Build `lhs <kind> rhs`, applying the cheap local simplifications that keep uniqued
    /// expressions in a canonical shape (constants folded and kept on the right).
    pub fn binary<'c>(
        &'c self,
        kind: BinaryKind,
        lhs: AffineExpr<'c>,
        rhs: AffineExpr<'c>,
    ) -> AffineExpr<'c> {
        let simplified = match kind {
            BinaryKind::Add => simplify_add(self, lhs, rhs),
            BinaryKind::Mul => simplify_mul(self, lhs, rhs),
            BinaryKind::FloorDiv => simplify_floor_div(self, lhs, rhs),
            BinaryKind::CeilDiv => simplify_ceil_div(self, lhs, rhs),
            BinaryKind::Mod => simplify_mod(self, lhs, rhs),
        };
        if let Some(e) = simplified {
            return e;
        }
        // Canonicalize so that the symbolic or constant operand of a product is on the right.
        let (lhs, rhs) = if kind == BinaryKind::Mul
            && lhs.is_symbolic_or_constant()
            && !rhs.is_symbolic_or_constant()
        {
            (rhs, lhs)
        } else {
            (lhs, rhs)
        };
        self.wrap(ExprNode::Binary(kind, lhs.id, rhs.id))
    }

    fn wrap(&self, node: ExprNode) -> AffineExpr<'_> {
        AffineExpr {
            ctx: self,
            id: self.intern_expr(node),
        }
    }
}

fn simplify_add<'c>(
    ctx: &'c Context,
    lhs: AffineExpr<'c>,
    rhs: AffineExpr<'c>,
) -> Option<AffineExpr<'c>> {
    match (lhs.as_constant(), rhs.as_constant()) {
        (Some(l), Some(r)) => return Some(ctx.constant(l.wrapping_add(r))),
        (Some(_), None) => return Some(ctx.binary(BinaryKind::Add, rhs, lhs)),
        (None, Some(0)) => return Some(lhs),
        (None, Some(r)) => {
            // (x + c1) + c2 => x + (c1 + c2)
            if let AffineExprKind::Binary(BinaryKind::Add, x, c1) = lhs.kind() {
                if let Some(c1) = c1.as_constant() {
                    return Some(ctx.binary(BinaryKind::Add, x, ctx.constant(c1.wrapping_add(r))));
                }
            }
        }
        (None, None) => {}
    }
    None
}

fn simplify_mul<'c>(
    ctx: &'c Context,
    lhs: AffineExpr<'c>,
    rhs: AffineExpr<'c>,
) -> Option<AffineExpr<'c>> {
    match (lhs.as_constant(), rhs.as_constant()) {
        (Some(l), Some(r)) => Some(ctx.constant(l.wrapping_mul(r))),
        (Some(_), None) => Some(ctx.binary(BinaryKind::Mul, rhs, lhs)),
        (None, Some(1)) => Some(lhs),
        (None, Some(0)) => Some(rhs),
        (None, Some(r)) => {
            // (x * c1) * c2 => x * (c1 * c2)
            if let AffineExprKind::Binary(BinaryKind::Mul, x, c1) = lhs.kind() {
                if let Some(c1) = c1.as_constant() {
                    return Some(ctx.binary(BinaryKind::Mul, x, ctx.constant(c1.wrapping_mul(r))));
                }
            }
            None
        }
        (None, None) => None,
    }
}

fn simplify_floor_div<'c>(
    ctx: &'c Context,
    lhs: AffineExpr<'c>,
    rhs: AffineExpr<'c>,
) -> Option<AffineExpr<'c>> {
    let r = rhs.as_constant().filter(|r| *r >= 1)?;
    if let Some(l) = lhs.as_constant() {
        return Some(ctx.constant(floor_div_i64(l, r)));
    }
    if r == 1 {
        return Some(lhs);
    }
    // (x * c1) floordiv c2 => x * (c1 / c2) when c2 divides c1.
    if let AffineExprKind::Binary(BinaryKind::Mul, x, c1) = lhs.kind() {
        if let Some(c1) = c1.as_constant() {
            if c1 % r == 0 {
                return Some(ctx.binary(BinaryKind::Mul, x, ctx.constant(c1 / r)));
            }
        }
    }
    None
}

fn simplify_ceil_div<'c>(
    ctx: &'c Context,
    lhs: AffineExpr<'c>,
    rhs: AffineExpr<'c>,
) -> Option<AffineExpr<'c>> {
    let r = rhs.as_constant().filter(|r| *r >= 1)?;
    if let Some(l) = lhs.as_constant() {
        return Some(ctx.constant(ceil_div_i64(l, r)));
    }
    if r == 1 {
        return Some(lhs);
    }
    if let AffineExprKind::Binary(BinaryKind::Mul, x, c1) = lhs.kind() {
        if let Some(c1) = c1.as_constant() {
            if c1 % r == 0 {
                return Some(ctx.binary(BinaryKind::Mul, x, ctx.constant(c1 / r)));
            }
        }
    }
    None
}

fn simplify_mod<'c>(
    ctx: &'c Context,
    lhs: AffineExpr<'c>,
    rhs: AffineExpr<'c>,
) -> Option<AffineExpr<'c>> {
    let r = rhs.as_constant().filter(|r| *r >= 1)?;
    if let Some(l) = lhs.as_constant() {
        return Some(ctx.constant(mod_i64(l, r)));
    }
    if r == 1 {
        return Some(ctx.constant(0));
    }
    // (x * c1) mod c2 == 0 when c2 divides c1.
    if let AffineExprKind::Binary(BinaryKind::Mul, _, c1) = lhs.kind() {
        if c1.as_constant().is_some_and(|c1| c1 % r == 0) {
            return Some(ctx.constant(0));
        }
    }
    None
}

/// Floor division. Wraps on `i64::MIN / -1` like the other fixed-width operations.
pub(crate) fn floor_div_i64(lhs: i64, rhs: i64) -> i64 {
    debug_assert_ne!(rhs, 0);
    if rhs == -1 {
        return lhs.wrapping_neg();
    }
    DivFloor::div_floor(lhs, rhs)
}

pub(crate) fn ceil_div_i64(lhs: i64, rhs: i64) -> i64 {
    debug_assert_ne!(rhs, 0);
    if rhs == -1 {
        return lhs.wrapping_neg();
    }
    DivCeil::div_ceil(lhs, rhs)
}

/// Modulo taking the sign of the divisor, so the result is in `[0, rhs)` for positive `rhs`.
pub(crate) fn mod_i64(lhs: i64, rhs: i64) -> i64 {
    debug_assert_ne!(rhs, 0);
    if rhs == -1 {
        return 0;
    }
    RemFloor::rem_floor(lhs, rhs)
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    a = a.wrapping_abs();
    b = b.wrapping_abs();
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl<'c> AffineExpr<'c> {
    pub(crate) fn from_id(ctx: &'c Context, id: ExprId) -> Self {
        AffineExpr { ctx, id }
    }

    pub(crate) fn id(&self) -> ExprId {
        self.id
    }

    pub fn context(&self) -> &'c Context {
        self.ctx
    }

    pub fn kind(&self) -> AffineExprKind<'c> {
        match self.ctx.expr_node(self.id) {
            ExprNode::Dim(p) => AffineExprKind::Dim(p),
            ExprNode::Symbol(p) => AffineExprKind::Symbol(p),
            ExprNode::Constant(v) => AffineExprKind::Constant(v),
            ExprNode::Binary(k, l, r) => AffineExprKind::Binary(
                k,
                AffineExpr {
                    ctx: self.ctx,
                    id: l,
                },
                AffineExpr {
                    ctx: self.ctx,
                    id: r,
                },
            ),
        }
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self.ctx.expr_node(self.id) {
            ExprNode::Constant(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_dim(&self) -> Option<usize> {
        match self.ctx.expr_node(self.id) {
            ExprNode::Dim(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<usize> {
        match self.ctx.expr_node(self.id) {
            ExprNode::Symbol(p) => Some(p),
            _ => None,
        }
    }

    pub fn floor_div<R: IntoAffineExpr<'c>>(self, rhs: R) -> Self {
        let rhs = rhs.into_affine_expr(self.ctx);
        self.ctx.binary(BinaryKind::FloorDiv, self, rhs)
    }

    pub fn ceil_div<R: IntoAffineExpr<'c>>(self, rhs: R) -> Self {
        let rhs = rhs.into_affine_expr(self.ctx);
        self.ctx.binary(BinaryKind::CeilDiv, self, rhs)
    }

    pub fn modulo<R: IntoAffineExpr<'c>>(self, rhs: R) -> Self {
        let rhs = rhs.into_affine_expr(self.ctx);
        self.ctx.binary(BinaryKind::Mod, self, rhs)
    }

    /// Returns true if this expression involves no dimensions.
    pub fn is_symbolic_or_constant(&self) -> bool {
        match self.kind() {
            AffineExprKind::Dim(_) => false,
            AffineExprKind::Symbol(_) | AffineExprKind::Constant(_) => true,
            AffineExprKind::Binary(_, l, r) => {
                l.is_symbolic_or_constant() && r.is_symbolic_or_constant()
            }
        }
    }

    /// Returns true if multiplication, division, and modulo only ever involve a constant
    /// (on the right, for the latter two).
    pub fn is_pure_affine(&self) -> bool {
        match self.kind() {
            AffineExprKind::Dim(_) | AffineExprKind::Symbol(_) | AffineExprKind::Constant(_) => {
                true
            }
            AffineExprKind::Binary(BinaryKind::Add, l, r) => l.is_pure_affine() && r.is_pure_affine(),
            AffineExprKind::Binary(BinaryKind::Mul, l, r) => {
                l.is_pure_affine()
                    && r.is_pure_affine()
                    && (l.as_constant().is_some() || r.as_constant().is_some())
            }
            AffineExprKind::Binary(_, l, r) => l.is_pure_affine() && r.as_constant().is_some(),
        }
    }

    /// The greatest integer known to divide every value of this expression. Always
    /// non-negative; zero only for the constant zero.
    pub fn largest_known_divisor(&self) -> i64 {
        match self.kind() {
            AffineExprKind::Dim(_) | AffineExprKind::Symbol(_) => 1,
            AffineExprKind::Constant(v) => v.wrapping_abs(),
            AffineExprKind::Binary(BinaryKind::Mul, l, r) => l
                .largest_known_divisor()
                .wrapping_mul(r.largest_known_divisor()),
            AffineExprKind::Binary(BinaryKind::Add | BinaryKind::Mod, l, r) => {
                gcd(l.largest_known_divisor(), r.largest_known_divisor())
            }
            AffineExprKind::Binary(BinaryKind::FloorDiv | BinaryKind::CeilDiv, l, r) => {
                match r.as_constant() {
                    Some(c) if c != 0 => {
                        let lhs_div = l.largest_known_divisor();
                        // `i64::MIN % -1` overflows, but -1 divides everything.
                        match lhs_div.checked_rem(c) {
                            None | Some(0) => lhs_div.wrapping_div(c).wrapping_abs(),
                            Some(_) => 1,
                        }
                    }
                    _ => 1,
                }
            }
        }
    }

    pub fn is_multiple_of(&self, factor: i64) -> bool {
        if factor == 0 {
            return self.as_constant() == Some(0);
        }
        matches!(self.largest_known_divisor().checked_rem(factor), None | Some(0))
    }

    pub fn is_function_of_dim(&self, position: usize) -> bool {
        let mut found = false;
        self.walk(|e| found |= e.as_dim() == Some(position));
        found
    }

    /// Visit every node of this expression in post-order.
    pub fn walk(&self, mut callback: impl FnMut(AffineExpr<'c>)) {
        self.walk_inner(&mut callback);
    }

    fn walk_inner(&self, callback: &mut impl FnMut(AffineExpr<'c>)) {
        if let AffineExprKind::Binary(_, l, r) = self.kind() {
            l.walk_inner(callback);
            r.walk_inner(callback);
        }
        callback(*self);
    }

    /// Replace `d{i}` with `dim_replacements[i]` and `s{j}` with `sym_replacements[j]`.
    ///
    /// Positions beyond the end of a replacement slice are left unchanged. Rebuilt nodes go
    /// through the simplifying constructors, so substituting constants folds.
    pub fn replace_dims_and_symbols(
        &self,
        dim_replacements: &[AffineExpr<'c>],
        sym_replacements: &[AffineExpr<'c>],
    ) -> Self {
        match self.kind() {
            AffineExprKind::Dim(p) => dim_replacements.get(p).copied().unwrap_or(*self),
            AffineExprKind::Symbol(p) => sym_replacements.get(p).copied().unwrap_or(*self),
            AffineExprKind::Constant(_) => *self,
            AffineExprKind::Binary(kind, l, r) => {
                let new_l = l.replace_dims_and_symbols(dim_replacements, sym_replacements);
                let new_r = r.replace_dims_and_symbols(dim_replacements, sym_replacements);
                if new_l == l && new_r == r {
                    *self
                } else {
                    self.ctx.binary(kind, new_l, new_r)
                }
            }
        }
    }

    /// Substitute the results of `map` for this expression's dimensions.
    pub fn compose(&self, map: AffineMap<'c>) -> Self {
        self.replace_dims_and_symbols(&map.results(), &[])
    }

    /// Evaluate with the given operand values.
    ///
    /// Returns `Ok(None)` if any operand the expression depends on is `None`. A zero divisor
    /// is an error, even when the dividend is unknown.
    pub fn evaluate(&self, dims: &[Option<i64>], syms: &[Option<i64>]) -> Result<Option<i64>, EvalError> {
        match self.kind() {
            AffineExprKind::Dim(p) => dims.get(p).copied().ok_or(EvalError::UnboundDim(p)),
            AffineExprKind::Symbol(p) => syms.get(p).copied().ok_or(EvalError::UnboundSymbol(p)),
            AffineExprKind::Constant(v) => Ok(Some(v)),
            AffineExprKind::Binary(kind, l, r) => {
                let lv = l.evaluate(dims, syms)?;
                let rv = r.evaluate(dims, syms)?;
                if kind != BinaryKind::Add && kind != BinaryKind::Mul && rv == Some(0) {
                    return Err(EvalError::DivisionByZero(self.to_string()));
                }
                let (Some(lv), Some(rv)) = (lv, rv) else {
                    return Ok(None);
                };
                Ok(Some(match kind {
                    BinaryKind::Add => lv.wrapping_add(rv),
                    BinaryKind::Mul => lv.wrapping_mul(rv),
                    BinaryKind::FloorDiv => floor_div_i64(lv, rv),
                    BinaryKind::CeilDiv => ceil_div_i64(lv, rv),
                    BinaryKind::Mod => mod_i64(lv, rv),
                }))
            }
        }
    }
}

impl PartialEq for AffineExpr<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.ctx, other.ctx) && self.id == other.id
    }
}

impl Eq for AffineExpr<'_> {}

impl Hash for AffineExpr<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// Orders by uniquing index: stable within one Context, but otherwise arbitrary.
impl PartialOrd for AffineExpr<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AffineExpr<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl<'c, R: IntoAffineExpr<'c>> Add<R> for AffineExpr<'c> {
    type Output = Self;

    fn add(self, rhs: R) -> Self::Output {
        let rhs = rhs.into_affine_expr(self.ctx);
        self.ctx.binary(BinaryKind::Add, self, rhs)
    }
}

impl<'c, R: IntoAffineExpr<'c>> Sub<R> for AffineExpr<'c> {
    type Output = Self;

    fn sub(self, rhs: R) -> Self::Output {
        let rhs = rhs.into_affine_expr(self.ctx);
        self + (-rhs)
    }
}

impl<'c, R: IntoAffineExpr<'c>> Mul<R> for AffineExpr<'c> {
    type Output = Self;

    fn mul(self, rhs: R) -> Self::Output {
        let rhs = rhs.into_affine_expr(self.ctx);
        self.ctx.binary(BinaryKind::Mul, self, rhs)
    }
}

impl<'c, R: IntoAffineExpr<'c>> Rem<R> for AffineExpr<'c> {
    type Output = Self;

    fn rem(self, rhs: R) -> Self::Output {
        self.modulo(rhs)
    }
}

impl Neg for AffineExpr<'_> {
    type Output = Self;

    fn neg(self) -> Self::Output {
        self * -1i64
    }
}

impl Display for AffineExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, *self, false)
    }
}

impl fmt::Debug for AffineExpr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AffineExpr({self})")
    }
}

fn write_expr(f: &mut fmt::Formatter<'_>, expr: AffineExpr<'_>, tight: bool) -> fmt::Result {
    let (kind, lhs, rhs) = match expr.kind() {
        AffineExprKind::Dim(p) => return write!(f, "d{p}"),
        AffineExprKind::Symbol(p) => return write!(f, "s{p}"),
        AffineExprKind::Constant(v) => return write!(f, "{v}"),
        AffineExprKind::Binary(kind, lhs, rhs) => (kind, lhs, rhs),
    };

    if tight {
        write!(f, "(")?;
    }
    let op = match kind {
        BinaryKind::Add => None,
        BinaryKind::Mul => Some(" * "),
        BinaryKind::FloorDiv => Some(" floordiv "),
        BinaryKind::CeilDiv => Some(" ceildiv "),
        BinaryKind::Mod => Some(" mod "),
    };
    match op {
        Some(" * ") if rhs.as_constant() == Some(-1) => {
            write!(f, "-")?;
            write_expr(f, lhs, true)?;
        }
        Some(op) => {
            write_expr(f, lhs, true)?;
            write!(f, "{op}")?;
            write_expr(f, rhs, true)?;
        }
        None => {
            write_expr(f, lhs, false)?;
            write_add_rhs(f, rhs)?;
        }
    }
    if tight {
        write!(f, ")")?;
    }
    Ok(())
}

/// Print the right operand of an addition, turning negated terms into subtractions.
fn write_add_rhs(f: &mut fmt::Formatter<'_>, rhs: AffineExpr<'_>) -> fmt::Result {
    match rhs.kind() {
        AffineExprKind::Constant(c) if c < 0 && c != i64::MIN => write!(f, " - {}", -c),
        AffineExprKind::Binary(BinaryKind::Mul, x, c) => match c.as_constant() {
            Some(-1) => {
                write!(f, " - ")?;
                write_expr(f, x, true)
            }
            Some(c) if c < 0 && c != i64::MIN => {
                write!(f, " - ")?;
                write_expr(f, x, true)?;
                write!(f, " * {}", -c)
            }
            _ => {
                write!(f, " + ")?;
                write_expr(f, rhs, false)
            }
        },
        AffineExprKind::Binary(BinaryKind::Add, ..) => {
            write!(f, " + ")?;
            write_expr(f, rhs, true)
        }
        _ => {
            write!(f, " + ")?;
            write_expr(f, rhs, false)
        }
    }
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub enum ExprShape {
    Dim(usize),
    Symbol(usize),
    Constant(i64),
    Add(Box<ExprShape>, Box<ExprShape>),
    Product(Box<ExprShape>, Box<ExprShape>),
    Scale(Box<ExprShape>, i64),
    FloorDiv(Box<ExprShape>, i64),
    CeilDiv(Box<ExprShape>, i64),
    Mod(Box<ExprShape>, i64),
}

#[cfg(test)]
impl ExprShape {
    pub fn build<'c>(&self, ctx: &'c Context) -> AffineExpr<'c> {
        match self {
            ExprShape::Dim(p) => ctx.dim(*p),
            ExprShape::Symbol(p) => ctx.symbol(*p),
            ExprShape::Constant(v) => ctx.constant(*v),
            ExprShape::Add(l, r) => l.build(ctx) + r.build(ctx),
            ExprShape::Product(l, r) => l.build(ctx) * r.build(ctx),
            ExprShape::Scale(l, c) => l.build(ctx) * *c,
            ExprShape::FloorDiv(l, c) => l.build(ctx).floor_div(*c),
            ExprShape::CeilDiv(l, c) => l.build(ctx).ceil_div(*c),
            ExprShape::Mod(l, c) => l.build(ctx) % *c,
        }
    }
}

/// Expressions over `num_dims` dimensions and `num_symbols` symbols. Divisors are positive
/// constants. With `semi_affine`, products of two non-constant subtrees are generated too.
#[cfg(test)]
pub fn arb_expr_shape(
    num_dims: usize,
    num_symbols: usize,
    semi_affine: bool,
) -> impl proptest::strategy::Strategy<Value = ExprShape> {
    use proptest::prelude::*;
    use proptest::strategy::Union;

    let mut leaves: Vec<BoxedStrategy<ExprShape>> = vec![(-8i64..8)
        .prop_map(ExprShape::Constant)
        .boxed()];
    if num_dims > 0 {
        leaves.push((0..num_dims).prop_map(ExprShape::Dim).boxed());
    }
    if num_symbols > 0 {
        leaves.push((0..num_symbols).prop_map(ExprShape::Symbol).boxed());
    }
    Union::new(leaves).prop_recursive(4, 24, 2, move |inner| {
        let mut branches: Vec<(u32, BoxedStrategy<ExprShape>)> = vec![
            (
                3,
                (inner.clone(), inner.clone())
                    .prop_map(|(l, r)| ExprShape::Add(Box::new(l), Box::new(r)))
                    .boxed(),
            ),
            (
                2,
                (inner.clone(), -4i64..5)
                    .prop_map(|(l, c)| ExprShape::Scale(Box::new(l), c))
                    .boxed(),
            ),
            (
                1,
                (inner.clone(), 1i64..6)
                    .prop_map(|(l, c)| ExprShape::FloorDiv(Box::new(l), c))
                    .boxed(),
            ),
            (
                1,
                (inner.clone(), 1i64..6)
                    .prop_map(|(l, c)| ExprShape::CeilDiv(Box::new(l), c))
                    .boxed(),
            ),
            (
                1,
                (inner.clone(), 1i64..6)
                    .prop_map(|(l, c)| ExprShape::Mod(Box::new(l), c))
                    .boxed(),
            ),
        ];
        if semi_affine {
            branches.push((
                1,
                (inner.clone(), inner)
                    .prop_map(|(l, r)| ExprShape::Product(Box::new(l), Box::new(r)))
                    .boxed(),
            ));
        }
        Union::new_weighted(branches)
    })
}

#[cfg(test)]
mod tests {
    use super::{AffineExprKind, BinaryKind, EvalError};
    use crate::context::Context;
    use proptest::prelude::*;

    #[test]
    fn test_constants_fold_at_construction() {
        let ctx = Context::new();
        assert_eq!(ctx.constant(3) + 4, ctx.constant(7));
        assert_eq!(ctx.constant(3) * 4, ctx.constant(12));
        assert_eq!(ctx.constant(-7).floor_div(2), ctx.constant(-4));
        assert_eq!(ctx.constant(-7).ceil_div(2), ctx.constant(-3));
        assert_eq!(ctx.constant(-7) % 2, ctx.constant(1));
    }

    #[test]
    fn test_constant_moves_to_the_right() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let e = ctx.constant(2) + d0;
        assert_eq!(e, d0 + 2);
        assert_eq!(ctx.constant(3) * d0, d0 * 3);
    }

    #[test]
    fn test_identity_operands_vanish() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        assert_eq!(d0 + 0, d0);
        assert_eq!(d0 * 1, d0);
        assert_eq!(d0 * 0, ctx.constant(0));
        assert_eq!(d0.floor_div(1), d0);
        assert_eq!(d0 % 1, ctx.constant(0));
    }

    #[test]
    fn test_nested_constants_merge() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        assert_eq!((d0 + 1) + 2, d0 + 3);
        assert_eq!((d0 * 2) * 3, d0 * 6);
        assert_eq!((d0 * 8).floor_div(4), d0 * 2);
        assert_eq!((d0 * 8) % 4, ctx.constant(0));
    }

    #[test]
    fn test_zero_divisor_is_not_folded() {
        let ctx = Context::new();
        let e = ctx.constant(4).floor_div(0);
        assert!(matches!(
            e.kind(),
            AffineExprKind::Binary(BinaryKind::FloorDiv, ..)
        ));
        assert!(matches!(
            e.evaluate(&[], &[]),
            Err(EvalError::DivisionByZero(_))
        ));
    }

    #[test]
    fn test_symbolic_operand_of_product_goes_right() {
        let ctx = Context::new();
        let e = ctx.symbol(0) * ctx.dim(0);
        assert_eq!(e.to_string(), "d0 * s0");
        assert!(!e.is_pure_affine());
    }

    #[test]
    fn test_display() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let d1 = ctx.dim(1);
        let s0 = ctx.symbol(0);
        assert_eq!((d0 + s0 * 2).to_string(), "d0 + s0 * 2");
        assert_eq!((d0 - 1).to_string(), "d0 - 1");
        assert_eq!((d0 - d1).to_string(), "d0 - d1");
        assert_eq!((d0 - d1 * 3).to_string(), "d0 - d1 * 3");
        assert_eq!((d0 + 1).floor_div(4).to_string(), "(d0 + 1) floordiv 4");
        assert_eq!((-d0).to_string(), "-d0");
        assert_eq!((d0 % 3).ceil_div(2).to_string(), "(d0 mod 3) ceildiv 2");
    }

    #[test]
    fn test_largest_known_divisor() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let s0 = ctx.symbol(0);
        assert_eq!((d0 * 4 + s0 * 6).largest_known_divisor(), 2);
        assert_eq!((d0 * 12).floor_div(3).largest_known_divisor(), 4);
        assert_eq!((d0 * 2).floor_div(4).largest_known_divisor(), 1);
        assert!((d0 * 8 + 16).is_multiple_of(8));
        assert!(!(d0 * 8 + 4).is_multiple_of(8));
    }

    #[test]
    fn test_divisibility_by_minus_one_at_i64_min() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let e = (d0 * i64::MIN).floor_div(-1);
        assert_eq!(e.largest_known_divisor(), i64::MIN);
        assert!(e.is_multiple_of(-1));
        assert!(e.is_multiple_of(1));
        assert!((d0 * i64::MIN).is_multiple_of(-1));
        assert!(!(d0 * 3).is_multiple_of(-2));
    }

    #[test]
    fn test_is_function_of_dim() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let d1 = ctx.dim(1);
        let s0 = ctx.symbol(0);
        let e = (d1 % 4).floor_div(2) + s0;
        assert!(e.is_function_of_dim(1));
        assert!(!e.is_function_of_dim(0));
        assert!((d0 * 2 + (d1 + s0) % 3).is_function_of_dim(1));
        assert!(!ctx.symbol(1).is_function_of_dim(1));
        assert!(!ctx.constant(5).is_function_of_dim(0));
    }

    #[test]
    fn test_replace_dims_and_symbols_folds() {
        let ctx = Context::new();
        let e = (ctx.dim(0) + ctx.symbol(0)) * 2;
        let replaced = e.replace_dims_and_symbols(&[ctx.constant(3)], &[ctx.constant(4)]);
        assert_eq!(replaced, ctx.constant(14));
        let partial = e.replace_dims_and_symbols(&[ctx.dim(1)], &[]);
        assert_eq!(partial, (ctx.dim(1) + ctx.symbol(0)) * 2);
    }

    #[test]
    fn test_evaluate_unknown_operand() {
        let ctx = Context::new();
        let e = ctx.dim(0) + ctx.symbol(0);
        assert_eq!(e.evaluate(&[Some(1)], &[None]), Ok(None));
        assert_eq!(e.evaluate(&[Some(1)], &[Some(2)]), Ok(Some(3)));
        assert_eq!(e.evaluate(&[Some(1)], &[]), Err(EvalError::UnboundSymbol(0)));
    }

    #[test]
    fn test_walk_is_post_order() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let s0 = ctx.symbol(0);
        let e = d0 + s0;
        let mut seen = vec![];
        e.walk(|x| seen.push(x));
        assert_eq!(seen, vec![d0, s0, e]);
    }

    proptest! {
        #[test]
        fn test_floor_ceil_mod_identities(a in -1000i64..1000, b in 1i64..50) {
            let ctx = Context::new();
            let fd = ctx.dim(0).floor_div(b).evaluate(&[Some(a)], &[]).unwrap().unwrap();
            let cd = ctx.dim(0).ceil_div(b).evaluate(&[Some(a)], &[]).unwrap().unwrap();
            let m = (ctx.dim(0) % b).evaluate(&[Some(a)], &[]).unwrap().unwrap();
            prop_assert!(fd * b <= a && a < (fd + 1) * b);
            prop_assert!((cd - 1) * b < a && a <= cd * b);
            prop_assert_eq!(fd * b + m, a);
            prop_assert!((0..b).contains(&m));
        }
    }
}

//! Flattened, linear forms of affine expressions.
//!
//! An [AffineExpr] is flattened into a sum of coefficient-atom terms plus a constant, where an
//! atom is a dimension, a symbol, a floor/ceil division or modulo of another linear form by a
//! positive constant, or an opaque semi-affine subtree. Terms are kept sorted by atom, which
//! merges like terms and fixes the order [simplify_affine_expr] rebuilds them in.

use log::trace;
use std::{
    fmt::{self, Display},
    ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Rem, Sub},
};

use crate::context::Context;
use crate::expr::{ceil_div_i64, floor_div_i64, mod_i64, AffineExpr, AffineExprKind, BinaryKind};

pub type LinearExpr<'c> = AffineForm<NonAffine<Atom<'c>>>;

/// `AffineForm(terms, c)` is `sum(terms) + c`. Terms are sorted by atom, unique, and have
/// non-zero coefficients.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct AffineForm<T>(pub Vec<Term<T>>, pub i64);

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub struct Term<T>(pub i64, pub T);

/// An atom of a [LinearExpr]. Divisors are always at least 2.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone)]
pub enum NonAffine<T> {
    Leaf(T),
    FloorDiv(Box<AffineForm<NonAffine<T>>>, i64),
    CeilDiv(Box<AffineForm<NonAffine<T>>>, i64),
    Mod(Box<AffineForm<NonAffine<T>>>, i64),
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Atom<'c> {
    Dim(usize),
    Symbol(usize),
    /// A semi-affine subtree (e.g. a product of two dimensions) whose children have already
    /// been simplified.
    Opaque(AffineExpr<'c>),
}

#[derive(Clone, Copy)]
enum Rounding {
    Floor,
    Ceil,
}

impl<T> AffineForm<T> {
    pub const fn zero() -> Self {
        AffineForm(vec![], 0)
    }

    pub const fn constant(c: i64) -> Self {
        AffineForm(vec![], c)
    }

    pub fn as_constant(&self) -> Option<i64> {
        if self.0.is_empty() {
            Some(self.1)
        } else {
            None
        }
    }
}

impl<T> From<T> for AffineForm<T> {
    fn from(t: T) -> Self {
        AffineForm(vec![Term(1, t)], 0)
    }
}

impl<T> From<Term<T>> for AffineForm<T> {
    fn from(t: Term<T>) -> Self {
        if t.0 == 0 {
            return AffineForm::zero();
        }
        AffineForm(vec![t], 0)
    }
}

impl<T> PartialEq<i64> for AffineForm<T> {
    fn eq(&self, rhs: &i64) -> bool {
        self.0.is_empty() && self.1 == *rhs
    }
}

impl<T: Ord> Add for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: AffineForm<T>) -> Self::Output {
        self += rhs;
        self
    }
}

impl<T> Add<i64> for AffineForm<T> {
    type Output = Self;

    fn add(mut self, rhs: i64) -> Self::Output {
        self.1 = self.1.wrapping_add(rhs);
        self
    }
}

impl<T: Ord> AddAssign for AffineForm<T> {
    fn add_assign(&mut self, rhs: Self) {
        let AffineForm(terms, intercept) = self;
        *intercept = intercept.wrapping_add(rhs.1);
        for Term(c, s) in rhs.0 {
            match terms.binary_search_by(|Term(_, s2)| s2.cmp(&s)) {
                Ok(i) => terms[i].0 = terms[i].0.wrapping_add(c),
                Err(i) => terms.insert(i, Term(c, s)),
            }
        }
        terms.retain(|Term(c, _)| *c != 0);
    }
}

impl<T> Sub<i64> for AffineForm<T> {
    type Output = Self;

    fn sub(mut self, rhs: i64) -> Self::Output {
        self.1 = self.1.wrapping_sub(rhs);
        self
    }
}

impl<T> Mul<i64> for AffineForm<T> {
    type Output = Self;

    fn mul(mut self, rhs: i64) -> Self::Output {
        self *= rhs;
        self
    }
}

impl<T> MulAssign<i64> for AffineForm<T> {
    fn mul_assign(&mut self, rhs: i64) {
        self.0.iter_mut().for_each(|Term(c, _)| *c = c.wrapping_mul(rhs));
        self.0.retain(|Term(c, _)| *c != 0);
        self.1 = self.1.wrapping_mul(rhs);
    }
}

impl<T> Neg for AffineForm<T> {
    type Output = Self;

    fn neg(self) -> Self::Output {
        self * -1
    }
}

/// Floor division by a positive constant.
impl<T: Ord + Clone> Div<i64> for AffineForm<NonAffine<T>> {
    type Output = Self;

    fn div(mut self, rhs: i64) -> Self::Output {
        debug_assert!(rhs > 0);
        if rhs == 1 {
            self
        } else if self.0.is_empty() {
            AffineForm::constant(floor_div_i64(self.1, rhs))
        } else if self.div_through(rhs) {
            self
        } else {
            self.split_quotient(rhs, Rounding::Floor)
        }
    }
}

impl<T: Ord + Clone> AffineForm<NonAffine<T>> {
    /// Ceiling division by a positive constant.
    pub fn ceil_div(mut self, rhs: i64) -> Self {
        debug_assert!(rhs > 0);
        if rhs == 1 {
            self
        } else if self.0.is_empty() {
            AffineForm::constant(ceil_div_i64(self.1, rhs))
        } else if self.div_through(rhs) {
            self
        } else {
            self.split_quotient(rhs, Rounding::Ceil)
        }
    }

    /// Divide all coefficients and intercept by `rhs` if all are divisible. Returns `true` if so.
    fn div_through(&mut self, rhs: i64) -> bool {
        if self.1 % rhs == 0 && self.0.iter().all(|Term(c, _)| c % rhs == 0) {
            self.0.iter_mut().for_each(|Term(c, _)| *c /= rhs);
            self.1 /= rhs;
            true
        } else {
            false
        }
    }

    /// `(x floordiv a) floordiv b == x floordiv (a * b)` for positive `a` and `b`.
    fn merge_nested_floor_div(&self, rhs: i64) -> Option<Self> {
        match self.0.as_slice() {
            [Term(1, NonAffine::FloorDiv(inner, a))] if self.1 == 0 => {
                let divisor = a.checked_mul(rhs)?;
                Some(NonAffine::FloorDiv(inner.clone(), divisor).into())
            }
            _ => None,
        }
    }

    /// Pull every term whose coefficient is a multiple of `rhs` (and the intercept's quotient)
    /// out of the division, leaving the rest wrapped. Terms are never split between the two
    /// parts, so no atom is duplicated.
    fn split_quotient(self, rhs: i64, rounding: Rounding) -> Self {
        let AffineForm(terms, intercept) = self;
        let (divisible, rest): (Vec<_>, Vec<_>) =
            terms.into_iter().partition(|Term(c, _)| c % rhs == 0);

        let (mut quotient, remainder) = if divisible.is_empty() {
            (AffineForm::zero(), AffineForm(rest, intercept))
        } else {
            let q = divisible
                .into_iter()
                .map(|Term(c, s)| Term(c / rhs, s))
                .collect::<Vec<_>>();
            let intercept_q = floor_div_i64(intercept, rhs);
            (
                AffineForm(q, intercept_q),
                AffineForm(rest, mod_i64(intercept, rhs)),
            )
        };

        if let Some(c) = remainder.as_constant() {
            return quotient
                + match rounding {
                    Rounding::Floor => floor_div_i64(c, rhs),
                    Rounding::Ceil => ceil_div_i64(c, rhs),
                };
        }
        let wrapped = match rounding {
            Rounding::Floor => remainder
                .merge_nested_floor_div(rhs)
                .unwrap_or_else(|| NonAffine::FloorDiv(Box::new(remainder), rhs).into()),
            Rounding::Ceil => NonAffine::CeilDiv(Box::new(remainder), rhs).into(),
        };
        quotient += wrapped;
        quotient
    }
}

/// Modulo by a positive constant.
impl<T: Ord + Clone> Rem<i64> for AffineForm<NonAffine<T>> {
    type Output = Self;

    fn rem(self, rhs: i64) -> Self::Output {
        debug_assert!(rhs > 0);
        if rhs == 1 {
            return AffineForm::constant(0);
        }
        if self.0.is_empty() {
            return AffineForm::constant(mod_i64(self.1, rhs));
        }
        // Adding multiples of `rhs` doesn't change the result.
        let reduced_intercept = mod_i64(self.1, rhs);
        let mut reduced_terms: Vec<Term<NonAffine<T>>> = self
            .0
            .into_iter()
            .map(|Term(c, s)| (mod_i64(c, rhs), s))
            .filter_map(|(rc, s)| (rc != 0).then(|| Term(rc, s)))
            .collect();
        if reduced_terms.is_empty() {
            AffineForm::constant(reduced_intercept)
        } else if reduced_terms.len() == 1 && reduced_terms[0].0 == 1 && reduced_intercept == 0 {
            let Term(_, s) = reduced_terms.remove(0);
            (s % rhs).into()
        } else {
            NonAffine::Mod(Box::new(AffineForm(reduced_terms, reduced_intercept)), rhs).into()
        }
    }
}

impl<T: Ord + Clone> Rem<i64> for NonAffine<T> {
    type Output = Self;

    fn rem(self, rhs: i64) -> Self::Output {
        debug_assert!(rhs > 1);
        match self {
            leaf @ NonAffine::Leaf(_) => NonAffine::Mod(Box::new(leaf.into()), rhs),
            // e.g., (a mod 8) mod 2 == a mod 2
            NonAffine::Mod(a, r) if r % rhs == 0 => NonAffine::Mod(a, rhs),
            // e.g., (a mod 2) mod 8 == a mod 2
            NonAffine::Mod(a, r) if rhs % r == 0 => NonAffine::Mod(a, r),
            other => NonAffine::Mod(Box::new(other.into()), rhs),
        }
    }
}

impl<T> Default for AffineForm<T> {
    fn default() -> Self {
        AffineForm::zero()
    }
}

impl<'c> LinearExpr<'c> {
    /// Flatten `expr`. Semi-affine subtrees become [Atom::Opaque] after their children are
    /// simplified.
    pub fn from_expr(expr: AffineExpr<'c>) -> Self {
        match expr.kind() {
            AffineExprKind::Dim(p) => NonAffine::Leaf(Atom::Dim(p)).into(),
            AffineExprKind::Symbol(p) => NonAffine::Leaf(Atom::Symbol(p)).into(),
            AffineExprKind::Constant(c) => AffineForm::constant(c),
            AffineExprKind::Binary(kind, lhs, rhs) => {
                let l = Self::from_expr(lhs);
                let r = Self::from_expr(rhs);
                match (kind, l.as_constant(), r.as_constant()) {
                    (BinaryKind::Add, _, _) => l + r,
                    (BinaryKind::Mul, _, Some(c)) => l * c,
                    (BinaryKind::Mul, Some(c), _) => r * c,
                    (BinaryKind::FloorDiv, _, Some(c)) if c > 0 => l / c,
                    (BinaryKind::CeilDiv, _, Some(c)) if c > 0 => l.ceil_div(c),
                    (BinaryKind::Mod, _, Some(c)) if c > 0 => l % c,
                    _ => {
                        let ctx = expr.context();
                        Self::opaque(ctx.binary(kind, l.to_expr(ctx), r.to_expr(ctx)))
                    }
                }
            }
        }
    }

    fn opaque(expr: AffineExpr<'c>) -> Self {
        match expr.kind() {
            AffineExprKind::Dim(p) => NonAffine::Leaf(Atom::Dim(p)).into(),
            AffineExprKind::Symbol(p) => NonAffine::Leaf(Atom::Symbol(p)).into(),
            AffineExprKind::Constant(c) => AffineForm::constant(c),
            AffineExprKind::Binary(..) => NonAffine::Leaf(Atom::Opaque(expr)).into(),
        }
    }

    /// Rebuild as a left-associated sum in term order with the constant last.
    pub fn to_expr(&self, ctx: &'c Context) -> AffineExpr<'c> {
        let mut terms = self.0.iter().map(|Term(c, s)| s.to_expr(ctx) * *c);
        let Some(first) = terms.next() else {
            return ctx.constant(self.1);
        };
        terms.fold(first, |acc, t| acc + t) + self.1
    }
}

impl<'c> NonAffine<Atom<'c>> {
    fn to_expr(&self, ctx: &'c Context) -> AffineExpr<'c> {
        match self {
            NonAffine::Leaf(Atom::Dim(p)) => ctx.dim(*p),
            NonAffine::Leaf(Atom::Symbol(p)) => ctx.symbol(*p),
            NonAffine::Leaf(Atom::Opaque(e)) => *e,
            NonAffine::FloorDiv(v, d) => v.to_expr(ctx).floor_div(*d),
            NonAffine::CeilDiv(v, d) => v.to_expr(ctx).ceil_div(*d),
            NonAffine::Mod(v, m) => v.to_expr(ctx).modulo(*m),
        }
    }
}

/// Fully simplify `expr`: flatten it, merge like terms, fold what divides exactly, and
/// rebuild it in canonical order (dimensions, symbols, then nested terms, constant last).
pub fn simplify_affine_expr(expr: AffineExpr<'_>) -> AffineExpr<'_> {
    let form = LinearExpr::from_expr(expr);
    let simplified = form.to_expr(expr.context());
    if simplified != expr {
        trace!("simplified {expr} via {form} to {simplified}");
    }
    simplified
}

impl<T: Display> Display for AffineForm<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((first_term, rest_terms)) = self.0.split_first() else {
            return write!(f, "{}", self.1);
        };

        write_affine_term(f, first_term)?;
        for t in rest_terms {
            write!(f, " + ")?;
            write_affine_term(f, t)?;
        }
        if self.1 != 0 {
            write!(f, " + {}", self.1)?;
        }
        Ok(())
    }
}

impl<T: Display> Display for NonAffine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NonAffine::Leaf(v) => write!(f, "{v}"),
            NonAffine::FloorDiv(v, d) => write!(f, "({v}) floordiv {d}"),
            NonAffine::CeilDiv(v, d) => write!(f, "({v}) ceildiv {d}"),
            NonAffine::Mod(v, m) => write!(f, "({v}) mod {m}"),
        }
    }
}

impl Display for Atom<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Atom::Dim(p) => write!(f, "d{p}"),
            Atom::Symbol(p) => write!(f, "s{p}"),
            Atom::Opaque(e) => write!(f, "[{e}]"),
        }
    }
}

fn write_affine_term<T: Display>(f: &mut fmt::Formatter<'_>, t: &Term<T>) -> fmt::Result {
    if t.0 == 1 {
        write!(f, "({})", t.1)
    } else {
        write!(f, "{}({})", t.0, t.1)
    }
}

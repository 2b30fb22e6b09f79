pub mod canonicalize;
pub mod classify;
pub mod config;
pub mod context;
pub mod expr;
pub mod fold;
pub mod linear;
pub mod map;
pub mod normalize;
pub mod ops;
pub mod parse;
pub mod program;
pub mod rewrite;
pub mod set;
pub mod value;
pub mod verify;

pub use context::Context;
pub use expr::{AffineExpr, AffineExprKind, BinaryKind, EvalError};
pub use map::{AffineMap, MutableAffineMap};
pub use set::IntegerSet;

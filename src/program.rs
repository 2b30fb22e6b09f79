//! A small line-oriented program format for driving the rewrites from the command line:
//!
//! ```text
//! %n = arg
//! %c = const 4
//! for %i {
//!   %a = apply (d0)[s0] -> (d0 + s0) (%i)[%n]
//!   %b = apply (d0)[s0] -> (d0 * 2 + s0) (%a)[%c]
//! }
//! ```
//!
//! Values defined directly in the program body are top-level; values defined inside `for`
//! blocks are nested. Besides `arg`, `const` and `apply`, values may be defined by `opaque`
//! (a result nothing is known about), by `region_arg` (an argument of a non-affine region,
//! only inside `for` blocks) and by `dim top`, `dim static N` or `dim dynamic %v` (the size
//! of a memory object defined at the top level, of static extent `N`, or of dynamic extent
//! `%v`). `arg`, `region_arg` and `opaque` take an optional `: iN` type suffix.

use smallvec::SmallVec;
use std::collections::HashMap;

use crate::canonicalize::canonicalize_map_and_operands;
use crate::config::ComposeConfig;
use crate::context::Context;
use crate::fold::{fold_apply, FoldError, FoldResult};
use crate::map::AffineMap;
use crate::normalize::{fully_compose_affine_map_and_operands, ComposeError};
use crate::ops::ApplyOp;
use crate::parse::{parse_affine_map_prefix, ParseError};
use crate::value::{Extent, Placement, ValueDef, ValueId, ValueProvenance, ValueTable, ValueType};
use crate::verify::VerifyError;

#[derive(thiserror::Error, Debug)]
pub enum ProgramError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: {source}")]
    Map {
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("line {line}: {source}")]
    Verify {
        line: usize,
        #[source]
        source: VerifyError,
    },
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error(transparent)]
    Fold(#[from] FoldError),
}

/// What to do with every apply of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Compose producers in until none are left, then canonicalize.
    Compose,
    Canonicalize,
    Fold,
}

#[derive(Debug)]
pub struct Program<'c> {
    values: ValueTable<'c>,
    names: HashMap<ValueId, String>,
    by_name: HashMap<String, ValueId>,
    applies: Vec<ValueId>,
}

impl<'c> Program<'c> {
    pub fn parse(ctx: &'c Context, src: &str) -> Result<Self, ProgramError> {
        let mut program = Program {
            values: ValueTable::new(),
            names: HashMap::new(),
            by_name: HashMap::new(),
            applies: vec![],
        };
        let mut depth = 0usize;
        for (idx, raw) in src.lines().enumerate() {
            let line = idx + 1;
            let text = raw.split("//").next().unwrap_or_default().trim();
            if text.is_empty() {
                continue;
            }
            if text == "}" {
                depth = depth.checked_sub(1).ok_or_else(|| syntax(line, "unmatched `}`"))?;
                continue;
            }
            if let Some(header) = text.strip_prefix("for ") {
                let name = header
                    .strip_suffix('{')
                    .map(str::trim)
                    .ok_or_else(|| syntax(line, "expected `{` after the induction variable"))?;
                let iv = program.values.induction_var();
                program.define(line, name, iv)?;
                depth += 1;
                continue;
            }
            let placement = if depth == 0 {
                Placement::TopLevel
            } else {
                Placement::Nested
            };
            program.statement(ctx, line, text, placement)?;
        }
        if depth != 0 {
            return Err(syntax(src.lines().count(), "unclosed `for` block"));
        }
        Ok(program)
    }

    fn statement(
        &mut self,
        ctx: &'c Context,
        line: usize,
        text: &str,
        placement: Placement,
    ) -> Result<(), ProgramError> {
        let (name, rhs) = text
            .split_once('=')
            .ok_or_else(|| syntax(line, "expected `%name = ...`"))?;
        let name = name.trim();
        let rhs = rhs.trim();
        let (op, args) = rhs.split_once(char::is_whitespace).unwrap_or((rhs, ""));
        let args = args.trim();
        let value = match op {
            "arg" => {
                if placement != Placement::TopLevel {
                    return Err(syntax(line, "arguments must be defined at the top level"));
                }
                let ty = parse_type_suffix(line, args)?;
                self.values.argument(ty)
            }
            "region_arg" => {
                if placement == Placement::TopLevel {
                    return Err(syntax(line, "region arguments must be defined inside a block"));
                }
                let ty = parse_type_suffix(line, args)?;
                self.values.region_argument(ty)
            }
            "opaque" => {
                let ty = parse_type_suffix(line, args)?;
                self.values.opaque(placement, ty)
            }
            "const" => {
                let c = args
                    .parse::<i64>()
                    .map_err(|_| syntax(line, format!("invalid constant `{args}`")))?;
                self.values.constant(placement, c)
            }
            "dim" => {
                let (memref_top_level, extent) = match args.split_whitespace().collect::<Vec<_>>()[..]
                {
                    ["top"] => (true, Extent::Unknown),
                    ["static", n] => {
                        let n = n
                            .parse::<i64>()
                            .map_err(|_| syntax(line, format!("invalid extent `{n}`")))?;
                        (false, Extent::Static(n))
                    }
                    ["dynamic", v] => (false, Extent::Dynamic(self.lookup(line, v)?)),
                    _ => return Err(syntax(line, format!("invalid size query `dim {args}`"))),
                };
                self.values
                    .dim_size(placement, memref_top_level, extent)
                    .map_err(|source| ProgramError::Verify { line, source })?
            }
            "apply" => {
                let (map, rest) = parse_affine_map_prefix(ctx, args)
                    .map_err(|source| ProgramError::Map { line, source })?;
                let operands = self.operand_list(line, map, rest)?;
                let v = self
                    .values
                    .apply(placement, map, &operands)
                    .map_err(|source| ProgramError::Verify { line, source })?;
                self.applies.push(v);
                v
            }
            _ => return Err(syntax(line, format!("unknown operation `{op}`"))),
        };
        self.define(line, name, value)
    }

    fn define(&mut self, line: usize, name: &str, value: ValueId) -> Result<(), ProgramError> {
        if !name.starts_with('%') || name.len() < 2 {
            return Err(syntax(line, format!("invalid value name `{name}`")));
        }
        if self.by_name.insert(name.to_string(), value).is_some() {
            return Err(syntax(line, format!("`{name}` is already defined")));
        }
        self.names.insert(value, name.to_string());
        Ok(())
    }

    fn lookup(&self, line: usize, name: &str) -> Result<ValueId, ProgramError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| syntax(line, format!("`{name}` is not defined")))
    }

    /// Parse `(dims)[symbols]` after an apply's map.
    fn operand_list(
        &self,
        line: usize,
        map: AffineMap<'c>,
        text: &str,
    ) -> Result<SmallVec<[ValueId; 4]>, ProgramError> {
        let text = text.trim();
        let (dims, rest) = text
            .strip_prefix('(')
            .and_then(|t| t.split_once(')'))
            .ok_or_else(|| syntax(line, "expected `(` to start the dimension operands"))?;
        let rest = rest.trim();
        let symbols = if rest.is_empty() {
            ""
        } else {
            rest.strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .ok_or_else(|| syntax(line, "expected `[symbols]` after the dimension operands"))?
        };
        let split = |s: &str| {
            s.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(|n| self.lookup(line, n))
                .collect::<Result<SmallVec<[ValueId; 4]>, _>>()
        };
        let dims = split(dims)?;
        if dims.len() != map.num_dims() {
            return Err(syntax(
                line,
                format!(
                    "{map} takes {} dimension operands, but {} were given",
                    map.num_dims(),
                    dims.len()
                ),
            ));
        }
        let mut operands = dims;
        operands.extend(split(symbols)?);
        Ok(operands)
    }

    pub fn values(&self) -> &ValueTable<'c> {
        &self.values
    }

    pub fn name(&self, value: ValueId) -> &str {
        self.names.get(&value).map_or("%?", String::as_str)
    }

    pub fn value(&self, name: &str) -> Option<ValueId> {
        self.by_name.get(name).copied()
    }

    /// The applies of the program in definition order.
    pub fn applies(&self) -> &[ValueId] {
        &self.applies
    }

    fn apply_of(&self, value: ValueId) -> (AffineMap<'c>, &[ValueId]) {
        match self.values.definition(value) {
            ValueDef::Apply { map, operands } => (map, operands),
            _ => unreachable!("{value} is not an apply"),
        }
    }

    fn format_apply(&self, value: ValueId, map: AffineMap<'c>, operands: &[ValueId]) -> String {
        let op = ApplyOp {
            map,
            operands: operands.iter().map(|o| self.name(*o)).collect(),
        };
        format!("{} = {op}", self.name(value))
    }

    /// Run `pass` on every apply, returning one line per apply with its result.
    pub fn run(&self, pass: Pass, config: &ComposeConfig) -> Result<Vec<String>, ProgramError> {
        let mut lines = Vec::with_capacity(self.applies.len());
        for &value in &self.applies {
            let (map, operands) = self.apply_of(value);
            let line = match pass {
                Pass::Compose => {
                    let (map, operands) =
                        fully_compose_affine_map_and_operands(&self.values, map, operands, config)?;
                    let (map, operands) =
                        canonicalize_map_and_operands(&self.values, map, &operands)
                            .map_err(ComposeError::from)?;
                    self.format_apply(value, map, &operands)
                }
                Pass::Canonicalize => {
                    let (map, operands) = canonicalize_map_and_operands(&self.values, map, operands)
                        .map_err(ComposeError::from)?;
                    self.format_apply(value, map, &operands)
                }
                Pass::Fold => match fold_apply(&self.values, map, operands)? {
                    Some(FoldResult::Operand(o)) => format!("{} = {}", self.name(value), self.name(o)),
                    Some(FoldResult::Constant(c)) => format!("{} = {c}", self.name(value)),
                    None => self.format_apply(value, map, operands),
                },
            };
            lines.push(line);
        }
        Ok(lines)
    }
}

fn syntax(line: usize, message: impl Into<String>) -> ProgramError {
    ProgramError::Syntax {
        line,
        message: message.into(),
    }
}

fn parse_type_suffix(line: usize, args: &str) -> Result<ValueType, ProgramError> {
    let Some(ty) = args.strip_prefix(':').map(str::trim) else {
        return if args.is_empty() {
            Ok(ValueType::Index)
        } else {
            Err(syntax(line, format!("unexpected `{args}`")))
        };
    };
    match ty {
        "index" => Ok(ValueType::Index),
        _ => ty
            .strip_prefix('i')
            .and_then(|w| w.parse::<u32>().ok())
            .map(|width| ValueType::Integer { width })
            .ok_or_else(|| syntax(line, format!("unknown type `{ty}`"))),
    }
}

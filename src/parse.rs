//! Parsing of the textual syntax for affine expressions, maps, and integer sets:
//!
//! ```text
//! (d0, d1)[s0] -> (d0 + s0, d1 floordiv 2)
//! (i)[n] : (i - n >= 0, i mod 2 == 0)
//! ```

use smallvec::SmallVec;

use crate::context::Context;
use crate::expr::{AffineExpr, BinaryKind};
use crate::map::AffineMap;
use crate::set::IntegerSet;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    /// Byte offset into the parsed text.
    pub offset: usize,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'s> {
    Ident(&'s str),
    Int(i64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Plus,
    Minus,
    Star,
    Arrow,
    Colon,
    GreaterEq,
    LessEq,
    EqEq,
    Eof,
}

/// Parse a standalone expression whose dimensions and symbols are named `d0, d1, ...` and
/// `s0, s1, ...`.
pub fn parse_affine_expr<'c>(ctx: &'c Context, src: &str) -> Result<AffineExpr<'c>, ParseError> {
    let mut p = Parser::new(ctx, src);
    p.positional_names = true;
    let e = p.expr()?;
    p.expect_end()?;
    Ok(e)
}

pub fn parse_affine_map<'c>(ctx: &'c Context, src: &str) -> Result<AffineMap<'c>, ParseError> {
    let (map, rest) = parse_affine_map_prefix(ctx, src)?;
    let rest_offset = src.len() - rest.len();
    let mut p = Parser::new(ctx, rest);
    p.base_offset = rest_offset;
    p.expect_end()?;
    Ok(map)
}

/// Parse a map at the start of `src`, returning it with the unparsed remainder.
pub fn parse_affine_map_prefix<'c, 's>(
    ctx: &'c Context,
    src: &'s str,
) -> Result<(AffineMap<'c>, &'s str), ParseError> {
    let mut p = Parser::new(ctx, src);
    p.dims_and_symbols()?;
    p.expect(Token::Arrow, "expected `->`")?;
    p.expect(Token::LParen, "expected `(` to start the result list")?;
    let results = p.comma_separated(Token::RParen, |p| p.expr())?;
    let map = AffineMap::get(ctx, p.dim_names.len(), p.symbol_names.len(), &results);
    Ok((map, p.rest()))
}

pub fn parse_integer_set<'c>(ctx: &'c Context, src: &str) -> Result<IntegerSet<'c>, ParseError> {
    let mut p = Parser::new(ctx, src);
    p.dims_and_symbols()?;
    p.expect(Token::Colon, "expected `:`")?;
    p.expect(Token::LParen, "expected `(` to start the constraint list")?;
    let constraints = p.comma_separated(Token::RParen, |p| p.constraint())?;
    p.expect_end()?;
    let (exprs, eq_flags): (SmallVec<[_; 4]>, SmallVec<[_; 4]>) = constraints.into_iter().unzip();
    Ok(IntegerSet::get(
        ctx,
        p.dim_names.len(),
        p.symbol_names.len(),
        &exprs,
        &eq_flags,
    ))
}

struct Parser<'c, 's> {
    ctx: &'c Context,
    src: &'s str,
    pos: usize,
    base_offset: usize,
    peeked: Option<(Token<'s>, usize, usize)>,
    dim_names: Vec<&'s str>,
    symbol_names: Vec<&'s str>,
    positional_names: bool,
}

impl<'c, 's> Parser<'c, 's> {
    fn new(ctx: &'c Context, src: &'s str) -> Self {
        Parser {
            ctx,
            src,
            pos: 0,
            base_offset: 0,
            peeked: None,
            dim_names: vec![],
            symbol_names: vec![],
            positional_names: false,
        }
    }

    fn error<T>(&self, offset: usize, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            offset: self.base_offset + offset,
            message: message.into(),
        })
    }

    fn rest(&self) -> &'s str {
        let pos = self.peeked.map(|(_, start, _)| start).unwrap_or(self.pos);
        &self.src[pos..]
    }

    /// Returns the next token with its start and end offsets.
    fn lex(&self) -> Result<(Token<'s>, usize, usize), ParseError> {
        let bytes = self.src.as_bytes();
        let mut start = self.pos;
        while start < bytes.len() && bytes[start].is_ascii_whitespace() {
            start += 1;
        }
        let Some(&b) = bytes.get(start) else {
            return Ok((Token::Eof, start, start));
        };
        let two = |second: u8, tok: Token<'s>| -> Option<(Token<'s>, usize, usize)> {
            (bytes.get(start + 1) == Some(&second)).then_some((tok, start, start + 2))
        };
        let single = |tok: Token<'s>| Some((tok, start, start + 1));
        let lexed = match b {
            b'(' => single(Token::LParen),
            b')' => single(Token::RParen),
            b'[' => single(Token::LBracket),
            b']' => single(Token::RBracket),
            b',' => single(Token::Comma),
            b'+' => single(Token::Plus),
            b'*' => single(Token::Star),
            b':' => single(Token::Colon),
            b'-' => two(b'>', Token::Arrow).or_else(|| single(Token::Minus)),
            b'>' => two(b'=', Token::GreaterEq),
            b'<' => two(b'=', Token::LessEq),
            b'=' => two(b'=', Token::EqEq),
            b'0'..=b'9' => {
                let end = scan(bytes, start, |c| c.is_ascii_digit());
                let Ok(v) = self.src[start..end].parse::<i64>() else {
                    return self.error(start, "integer literal out of range");
                };
                Some((Token::Int(v), start, end))
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let end = scan(bytes, start, |c| c.is_ascii_alphanumeric() || c == b'_');
                Some((Token::Ident(&self.src[start..end]), start, end))
            }
            _ => None,
        };
        match lexed {
            Some(t) => Ok(t),
            None => self.error(start, format!("unexpected character `{}`", b as char)),
        }
    }

    fn peek(&mut self) -> Result<Token<'s>, ParseError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex()?);
        }
        Ok(self.peeked.map(|(t, _, _)| t).unwrap_or(Token::Eof))
    }

    fn peek_offset(&mut self) -> Result<usize, ParseError> {
        self.peek()?;
        Ok(self.peeked.map(|(_, s, _)| s).unwrap_or(self.pos))
    }

    fn bump(&mut self) -> Result<Token<'s>, ParseError> {
        let (tok, _, end) = match self.peeked.take() {
            Some(t) => t,
            None => self.lex()?,
        };
        self.pos = end;
        Ok(tok)
    }

    fn eat(&mut self, tok: Token<'s>) -> Result<bool, ParseError> {
        if self.peek()? == tok {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Token<'s>, message: &str) -> Result<(), ParseError> {
        if self.eat(tok)? {
            Ok(())
        } else {
            let offset = self.peek_offset()?;
            self.error(offset, message)
        }
    }

    fn expect_end(&mut self) -> Result<(), ParseError> {
        self.expect(Token::Eof, "expected end of input")
    }

    /// Parses items until `close`, which may directly follow the opening delimiter.
    fn comma_separated<T>(
        &mut self,
        close: Token<'s>,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<SmallVec<[T; 4]>, ParseError> {
        let mut items = SmallVec::new();
        if self.eat(close)? {
            return Ok(items);
        }
        loop {
            items.push(item(self)?);
            if self.eat(close)? {
                return Ok(items);
            }
            self.expect(Token::Comma, "expected `,` or a closing delimiter")?;
        }
    }

    fn identifier(&mut self) -> Result<&'s str, ParseError> {
        let offset = self.peek_offset()?;
        match self.bump()? {
            Token::Ident(name) if !is_keyword(name) => {
                if self.dim_names.contains(&name) || self.symbol_names.contains(&name) {
                    return self.error(offset, format!("redefinition of `{name}`"));
                }
                Ok(name)
            }
            _ => self.error(offset, "expected an identifier"),
        }
    }

    fn dims_and_symbols(&mut self) -> Result<(), ParseError> {
        self.expect(Token::LParen, "expected `(` to start the dimension list")?;
        self.comma_separated(Token::RParen, |p| {
            let name = p.identifier()?;
            p.dim_names.push(name);
            Ok(())
        })?;
        if self.eat(Token::LBracket)? {
            self.comma_separated(Token::RBracket, |p| {
                let name = p.identifier()?;
                p.symbol_names.push(name);
                Ok(())
            })?;
        }
        Ok(())
    }

    /// `lhs >= rhs`, `lhs <= rhs` or `lhs == rhs`, normalized against zero.
    fn constraint(&mut self) -> Result<(AffineExpr<'c>, bool), ParseError> {
        let lhs = self.expr()?;
        let offset = self.peek_offset()?;
        match self.bump()? {
            Token::GreaterEq => Ok((lhs - self.expr()?, false)),
            Token::LessEq => Ok((self.expr()? - lhs, false)),
            Token::EqEq => Ok((lhs - self.expr()?, true)),
            _ => self.error(offset, "expected `>=`, `<=` or `==`"),
        }
    }

    fn expr(&mut self) -> Result<AffineExpr<'c>, ParseError> {
        let mut acc = self.term()?;
        loop {
            if self.eat(Token::Plus)? {
                acc = acc + self.term()?;
            } else if self.eat(Token::Minus)? {
                acc = acc - self.term()?;
            } else {
                return Ok(acc);
            }
        }
    }

    fn term(&mut self) -> Result<AffineExpr<'c>, ParseError> {
        let mut acc = self.unary()?;
        loop {
            let kind = match self.peek()? {
                Token::Star => BinaryKind::Mul,
                Token::Ident("floordiv") => BinaryKind::FloorDiv,
                Token::Ident("ceildiv") => BinaryKind::CeilDiv,
                Token::Ident("mod") => BinaryKind::Mod,
                _ => return Ok(acc),
            };
            self.bump()?;
            let rhs = self.unary()?;
            acc = self.ctx.binary(kind, acc, rhs);
        }
    }

    fn unary(&mut self) -> Result<AffineExpr<'c>, ParseError> {
        if self.eat(Token::Minus)? {
            return Ok(-self.unary()?);
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<AffineExpr<'c>, ParseError> {
        let offset = self.peek_offset()?;
        match self.bump()? {
            Token::Int(v) => Ok(self.ctx.constant(v)),
            Token::LParen => {
                let e = self.expr()?;
                self.expect(Token::RParen, "expected `)`")?;
                Ok(e)
            }
            Token::Ident(name) if !is_keyword(name) => self.resolve(name, offset),
            _ => self.error(offset, "expected an affine expression"),
        }
    }

    fn resolve(&self, name: &str, offset: usize) -> Result<AffineExpr<'c>, ParseError> {
        if let Some(p) = self.dim_names.iter().position(|n| *n == name) {
            return Ok(self.ctx.dim(p));
        }
        if let Some(p) = self.symbol_names.iter().position(|n| *n == name) {
            return Ok(self.ctx.symbol(p));
        }
        if self.positional_names {
            let (prefix, digits) = name.split_at(1);
            if let Ok(p) = digits.parse::<usize>() {
                match prefix {
                    "d" => return Ok(self.ctx.dim(p)),
                    "s" => return Ok(self.ctx.symbol(p)),
                    _ => {}
                }
            }
        }
        self.error(offset, format!("use of undeclared identifier `{name}`"))
    }
}

fn is_keyword(name: &str) -> bool {
    matches!(name, "floordiv" | "ceildiv" | "mod")
}

fn scan(bytes: &[u8], start: usize, pred: impl Fn(u8) -> bool) -> usize {
    let mut end = start;
    while end < bytes.len() && pred(bytes[end]) {
        end += 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::{parse_affine_expr, parse_affine_map, parse_affine_map_prefix, parse_integer_set};
    use crate::context::Context;

    #[test]
    fn test_parse_expr_precedence() {
        let ctx = Context::new();
        let d0 = ctx.dim(0);
        let s0 = ctx.symbol(0);
        assert_eq!(parse_affine_expr(&ctx, "d0 + s0 * 2").unwrap(), d0 + s0 * 2);
        assert_eq!(
            parse_affine_expr(&ctx, "(d0 + 1) floordiv 4").unwrap(),
            (d0 + 1).floor_div(4)
        );
        assert_eq!(
            parse_affine_expr(&ctx, "d0 floordiv 2 mod 3").unwrap(),
            d0.floor_div(2) % 3
        );
        assert_eq!(parse_affine_expr(&ctx, "-d0 - 3").unwrap(), -d0 - 3);
    }

    #[test]
    fn test_parse_map_with_names() {
        let ctx = Context::new();
        let m = parse_affine_map(&ctx, "(i, j)[n] -> (i + n, j ceildiv 2)").unwrap();
        assert_eq!(m.num_dims(), 2);
        assert_eq!(m.num_symbols(), 1);
        assert_eq!(m.to_string(), "(d0, d1)[s0] -> (d0 + s0, d1 ceildiv 2)");
    }

    #[test]
    fn test_parse_map_without_inputs_or_results() {
        let ctx = Context::new();
        assert_eq!(parse_affine_map(&ctx, "() -> ()").unwrap().num_results(), 0);
        assert_eq!(parse_affine_map(&ctx, "()[] -> (4)").unwrap().to_string(), "() -> (4)");
    }

    #[test]
    fn test_display_round_trips() {
        let ctx = Context::new();
        for src in [
            "(d0)[s0] -> (d0 - s0 * 2 + 1)",
            "(d0, d1) -> ((d0 + d1) mod 8, -d0)",
            "(d0)[s0, s1] -> (d0 * s0, s1 floordiv 3)",
        ] {
            let m = parse_affine_map(&ctx, src).unwrap();
            assert_eq!(m.to_string(), src);
            assert_eq!(parse_affine_map(&ctx, &m.to_string()).unwrap(), m);
        }
    }

    #[test]
    fn test_parse_set_normalizes_constraints() {
        let ctx = Context::new();
        let a = parse_integer_set(&ctx, "(i)[n] : (i <= n - 1, i >= 0)").unwrap();
        let b = parse_integer_set(&ctx, "(d0)[s0] : (s0 - 1 - d0 >= 0, d0 >= 0)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_returns_rest() {
        let ctx = Context::new();
        let (m, rest) = parse_affine_map_prefix(&ctx, "(d0) -> (d0 + 1) (%a)[]").unwrap();
        assert_eq!(m.num_dims(), 1);
        assert_eq!(rest, " (%a)[]");
    }

    #[test]
    fn test_errors_carry_offsets() {
        let ctx = Context::new();
        let err = parse_affine_map(&ctx, "(d0) -> (d1)").unwrap_err();
        assert_eq!(err.offset, 9);
        let err = parse_affine_map(&ctx, "(d0) (d0)").unwrap_err();
        assert_eq!(err.offset, 5);
        let err = parse_affine_map(&ctx, "(d0, d0) -> (d0)").unwrap_err();
        assert_eq!(err.offset, 5);
        let err = parse_affine_map(&ctx, "(d0) -> (d0) x").unwrap_err();
        assert_eq!(err.offset, 13);
        assert!(parse_affine_expr(&ctx, "d0 + ?").is_err());
    }
}

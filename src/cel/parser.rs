// Copyright 2024 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lexer and recursive-descent parser.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! Expr    = Or ["?" Or ":" Expr]
//! Or      = And {"||" And}
//! And     = Rel {"&&" Rel}
//! Rel     = Add {("<"|"<="|">"|">="|"=="|"!="|"in") Add}
//! Add     = Mul {("+"|"-") Mul}
//! Mul     = Unary {("*"|"/"|"%") Unary}
//! Unary   = Member | "!"+ Member | "-"+ Member
//! Member  = Primary {"." IDENT ["(" args ")"] | "[" Expr "]"}
//! Primary = IDENT ["(" args ")"] | "(" Expr ")" | "[" list "]" | "{" map "}" | literal
//! ```

use super::ast::{BinaryOp, Expr, Literal, MacroKind, UnaryOp};
use super::CompileError;

/// Nesting limit for recursive productions.
const MAX_DEPTH: usize = 250;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(u64),
    Uint(u64),
    Double(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Comma,
    Colon,
    Question,
    Not,
    Minus,
    Plus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
    AndAnd,
    OrOr,
    Eof,
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek_byte(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte(0) {
                Some(b) if b.is_ascii_whitespace() => self.pos += 1,
                Some(b'/') if self.peek_byte(1) == Some(b'/') => {
                    while let Some(b) = self.peek_byte(0) {
                        if b == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn tokenize(mut self) -> Result<Vec<(Token, usize)>, CompileError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let start = self.pos;
            let b = match self.peek_byte(0) {
                Some(b) => b,
                None => {
                    out.push((Token::Eof, start));
                    return Ok(out);
                }
            };
            let token = match b {
                b'(' => self.single(Token::LParen),
                b')' => self.single(Token::RParen),
                b'[' => self.single(Token::LBracket),
                b']' => self.single(Token::RBracket),
                b'{' => self.single(Token::LBrace),
                b'}' => self.single(Token::RBrace),
                b',' => self.single(Token::Comma),
                b':' => self.single(Token::Colon),
                b'?' => self.single(Token::Question),
                b'+' => self.single(Token::Plus),
                b'-' => self.single(Token::Minus),
                b'*' => self.single(Token::Star),
                b'/' => self.single(Token::Slash),
                b'%' => self.single(Token::Percent),
                b'.' if !self.peek_byte(1).map_or(false, |c| c.is_ascii_digit()) => {
                    self.single(Token::Dot)
                }
                b'<' => self.one_or_two(b'=', Token::Lt, Token::Le),
                b'>' => self.one_or_two(b'=', Token::Gt, Token::Ge),
                b'!' => self.one_or_two(b'=', Token::Not, Token::Ne),
                b'=' if self.peek_byte(1) == Some(b'=') => {
                    self.pos += 2;
                    Token::EqEq
                }
                b'&' if self.peek_byte(1) == Some(b'&') => {
                    self.pos += 2;
                    Token::AndAnd
                }
                b'|' if self.peek_byte(1) == Some(b'|') => {
                    self.pos += 2;
                    Token::OrOr
                }
                b'\'' | b'"' => self.string(false)?,
                b'r' | b'R' if matches!(self.peek_byte(1), Some(b'\'') | Some(b'"')) => {
                    self.pos += 1;
                    self.string(true)?
                }
                b'0'..=b'9' | b'.' => self.number()?,
                b if b == b'_' || b.is_ascii_alphabetic() => self.ident(),
                _ => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    return Err(CompileError::new(start, format!("Syntax error: token recognition error at: '{}'", ch)));
                }
            };
            out.push((token, start));
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    fn one_or_two(&mut self, second: u8, one: Token, two: Token) -> Token {
        if self.peek_byte(1) == Some(second) {
            self.pos += 2;
            two
        } else {
            self.pos += 1;
            one
        }
    }

    fn ident(&mut self) -> Token {
        let start = self.pos;
        while let Some(b) = self.peek_byte(0) {
            if b == b'_' || b.is_ascii_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        match &self.src[start..self.pos] {
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "in" => Token::In,
            other => Token::Ident(other.to_string()),
        }
    }

    fn number(&mut self) -> Result<Token, CompileError> {
        let start = self.pos;
        if self.peek_byte(0) == Some(b'0') && matches!(self.peek_byte(1), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek_byte(0).map_or(false, |b| b.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            let value = u64::from_str_radix(&self.src[digits_start..self.pos], 16)
                .map_err(|_| CompileError::new(start, "invalid hex literal"))?;
            return Ok(self.int_suffix(value));
        }

        let mut is_double = false;
        while self.peek_byte(0).map_or(false, |b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek_byte(0) == Some(b'.') && self.peek_byte(1).map_or(false, |b| b.is_ascii_digit()) {
            is_double = true;
            self.pos += 1;
            while self.peek_byte(0).map_or(false, |b| b.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek_byte(0), Some(b'e') | Some(b'E')) {
            let mut ahead = 1;
            if matches!(self.peek_byte(1), Some(b'+') | Some(b'-')) {
                ahead = 2;
            }
            if self.peek_byte(ahead).map_or(false, |b| b.is_ascii_digit()) {
                is_double = true;
                self.pos += ahead;
                while self.peek_byte(0).map_or(false, |b| b.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }

        let text = &self.src[start..self.pos];
        if is_double {
            let value: f64 = text
                .parse()
                .map_err(|_| CompileError::new(start, format!("invalid double literal {}", text)))?;
            return Ok(Token::Double(value));
        }
        let value: u64 = text
            .parse()
            .map_err(|_| CompileError::new(start, format!("integer literal out of range: {}", text)))?;
        Ok(self.int_suffix(value))
    }

    fn int_suffix(&mut self, value: u64) -> Token {
        if matches!(self.peek_byte(0), Some(b'u') | Some(b'U')) {
            self.pos += 1;
            Token::Uint(value)
        } else {
            Token::Int(value)
        }
    }

    fn string(&mut self, raw: bool) -> Result<Token, CompileError> {
        let start = self.pos;
        let quote = self.bytes[self.pos];
        let triple = self.peek_byte(1) == Some(quote) && self.peek_byte(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let rest = &self.src[self.pos..];
            let ch = match rest.chars().next() {
                Some(ch) => ch,
                None => return Err(CompileError::new(start, "Syntax error: unterminated string literal")),
            };
            if ch as u32 == quote as u32 {
                if !triple {
                    self.pos += 1;
                    return Ok(Token::Str(out));
                }
                if self.peek_byte(1) == Some(quote) && self.peek_byte(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(Token::Str(out));
                }
            }
            if ch == '\n' && !triple {
                return Err(CompileError::new(start, "Syntax error: newline in string literal"));
            }
            if ch == '\\' && !raw {
                self.pos += 1;
                out.push(self.escape(start)?);
                continue;
            }
            out.push(ch);
            self.pos += ch.len_utf8();
        }
    }

    fn escape(&mut self, start: usize) -> Result<char, CompileError> {
        let b = self
            .peek_byte(0)
            .ok_or_else(|| CompileError::new(start, "Syntax error: unterminated escape"))?;
        self.pos += 1;
        let ch = match b {
            b'n' => '\n',
            b't' => '\t',
            b'r' => '\r',
            b'0' => '\0',
            b'\\' => '\\',
            b'\'' => '\'',
            b'"' => '"',
            b'`' => '`',
            b'?' => '?',
            b'u' | b'x' => {
                let width = if b == b'u' { 4 } else { 2 };
                let end = self.pos + width;
                let hex = self
                    .src
                    .get(self.pos..end)
                    .ok_or_else(|| CompileError::new(start, "Syntax error: truncated escape"))?;
                let code = u32::from_str_radix(hex, 16)
                    .map_err(|_| CompileError::new(start, "Syntax error: invalid escape"))?;
                self.pos = end;
                char::from_u32(code).ok_or_else(|| CompileError::new(start, "Syntax error: invalid code point"))?
            }
            other => {
                return Err(CompileError::new(
                    start,
                    format!("Syntax error: invalid escape sequence '\\{}'", other as char),
                ))
            }
        };
        Ok(ch)
    }
}

/// Parse an expression into its syntax tree.
pub fn parse(source: &str) -> Result<Expr, CompileError> {
    let tokens = Lexer::new(source).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expr()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(CompileError::new(
            parser.offset(),
            format!("Syntax error: extraneous input {}", describe(other)),
        )),
    }
}

fn describe(token: &Token) -> String {
    match token {
        Token::Ident(name) => format!("'{}'", name),
        Token::Eof => "<EOF>".to_string(),
        other => format!("{:?}", other),
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|(_, o)| *o)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), CompileError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(CompileError::new(
                self.offset(),
                format!(
                    "Syntax error: mismatched input {} expecting {:?}",
                    describe(self.peek()),
                    token
                ),
            ))
        }
    }

    fn enter(&mut self) -> Result<(), CompileError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(CompileError::new(self.offset(), "expression recursion limit exceeded"));
        }
        Ok(())
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        self.enter()?;
        let condition = self.or()?;
        let result = if self.eat(&Token::Question) {
            let then = self.or()?;
            self.expect(Token::Colon)?;
            let otherwise = self.expr()?;
            Expr::Conditional {
                condition: Box::new(condition),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            }
        } else {
            condition
        };
        self.depth -= 1;
        Ok(result)
    }

    // Each chained operator nests the tree one level and counts toward
    // MAX_DEPTH.
    fn or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.and()?;
        let mut nested = 0;
        while self.eat(&Token::OrOr) {
            self.enter()?;
            nested += 1;
            let rhs = self.and()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        self.depth -= nested;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.relation()?;
        let mut nested = 0;
        while self.eat(&Token::AndAnd) {
            self.enter()?;
            nested += 1;
            let rhs = self.relation()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        self.depth -= nested;
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.addition()?;
        let mut nested = 0;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                Token::EqEq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                Token::In => BinaryOp::In,
                _ => break,
            };
            self.advance();
            self.enter()?;
            nested += 1;
            let rhs = self.addition()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= nested;
        Ok(lhs)
    }

    fn addition(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.multiplication()?;
        let mut nested = 0;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            nested += 1;
            let rhs = self.multiplication()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= nested;
        Ok(lhs)
    }

    fn multiplication(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.unary()?;
        let mut nested = 0;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => break,
            };
            self.advance();
            self.enter()?;
            nested += 1;
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
        self.depth -= nested;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CompileError> {
        match self.peek() {
            Token::Not => {
                self.advance();
                self.enter()?;
                let operand = self.unary()?;
                self.depth -= 1;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            }
            Token::Minus => {
                self.advance();
                // -9223372036854775808 only fits when the sign is folded in.
                if let Token::Int(value) = *self.peek() {
                    if value == 1u64 << 63 {
                        self.advance();
                        return self.member_suffix(Expr::Literal(Literal::Int(i64::MIN)));
                    }
                }
                self.enter()?;
                let operand = self.unary()?;
                self.depth -= 1;
                Ok(match operand {
                    Expr::Literal(Literal::Int(i)) if i != i64::MIN => Expr::Literal(Literal::Int(-i)),
                    Expr::Literal(Literal::Double(d)) => Expr::Literal(Literal::Double(-d)),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(other),
                    },
                })
            }
            _ => self.member(),
        }
    }

    fn member(&mut self) -> Result<Expr, CompileError> {
        let primary = self.primary()?;
        self.member_suffix(primary)
    }

    fn member_suffix(&mut self, mut expr: Expr) -> Result<Expr, CompileError> {
        let mut nested = 0;
        loop {
            match self.peek() {
                Token::Dot | Token::LBracket => {
                    self.enter()?;
                    nested += 1;
                }
                _ => break,
            }
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let offset = self.offset();
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(CompileError::new(
                                offset,
                                format!("Syntax error: mismatched input {} expecting IDENTIFIER", describe(&other)),
                            ))
                        }
                    };
                    if self.eat(&Token::LParen) {
                        let args = self.args(Token::RParen)?;
                        expr = method_call(expr, name, args, offset)?;
                    } else {
                        expr = Expr::Select {
                            operand: Box::new(expr),
                            field: name,
                            test_only: false,
                        };
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index {
                        operand: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        self.depth -= nested;
        Ok(expr)
    }

    fn args(&mut self, close: Token) -> Result<Vec<Expr>, CompileError> {
        let mut args = Vec::new();
        if self.eat(&close) {
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            if self.eat(&close) {
                return Ok(args);
            }
            self.expect(Token::Comma)?;
            // trailing comma
            if self.eat(&close) {
                return Ok(args);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, CompileError> {
        let offset = self.offset();
        match self.advance() {
            Token::Int(value) => i64::try_from(value)
                .map(|v| Expr::Literal(Literal::Int(v)))
                .map_err(|_| CompileError::new(offset, format!("integer literal out of range: {}", value))),
            Token::Uint(value) => Ok(Expr::Literal(Literal::Uint(value))),
            Token::Double(value) => Ok(Expr::Literal(Literal::Double(value))),
            Token::Str(value) => Ok(Expr::Literal(Literal::String(value))),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::Null => Ok(Expr::Literal(Literal::Null)),
            Token::Dot => match self.advance() {
                Token::Ident(name) => self.ident_or_call(name, offset),
                other => Err(CompileError::new(
                    offset,
                    format!("Syntax error: mismatched input {} expecting IDENTIFIER", describe(&other)),
                )),
            },
            Token::Ident(name) => self.ident_or_call(name, offset),
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::List(self.args(Token::RBracket)?)),
            Token::LBrace => {
                let mut entries = Vec::new();
                if self.eat(&Token::RBrace) {
                    return Ok(Expr::Map(entries));
                }
                loop {
                    let key = self.expr()?;
                    self.expect(Token::Colon)?;
                    let value = self.expr()?;
                    entries.push((key, value));
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Map(entries));
                    }
                    self.expect(Token::Comma)?;
                    if self.eat(&Token::RBrace) {
                        return Ok(Expr::Map(entries));
                    }
                }
            }
            other => Err(CompileError::new(
                offset,
                format!("Syntax error: mismatched input {} expecting expression", describe(&other)),
            )),
        }
    }

    fn ident_or_call(&mut self, name: String, offset: usize) -> Result<Expr, CompileError> {
        if !self.eat(&Token::LParen) {
            return Ok(Expr::Ident(name));
        }
        let args = self.args(Token::RParen)?;
        if name == "has" {
            return match args.as_slice() {
                [Expr::Select { operand, field, .. }] => Ok(Expr::Select {
                    operand: operand.clone(),
                    field: field.clone(),
                    test_only: true,
                }),
                _ => Err(CompileError::new(offset, "invalid argument to has() macro")),
            };
        }
        Ok(Expr::Call {
            target: None,
            function: name,
            args,
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn method_call(target: Expr, name: String, mut args: Vec<Expr>, offset: usize) -> Result<Expr, CompileError> {
    let kind = match MacroKind::parse(&name) {
        Some(kind) => kind,
        None => {
            return Ok(Expr::Call {
                target: Some(Box::new(target)),
                function: name,
                args,
            })
        }
    };
    let var = match args.first() {
        Some(Expr::Ident(var)) => var.clone(),
        _ => return Err(CompileError::new(offset, format!("{} macro: argument must be a simple name", name))),
    };
    let (filter, step) = match (kind, args.len()) {
        (MacroKind::Map, 3) => {
            let step = args.remove(2);
            let filter = args.remove(1);
            (Some(Box::new(filter)), step)
        }
        (_, 2) => (None, args.remove(1)),
        _ => {
            return Err(CompileError::new(
                offset,
                format!("{} macro: wrong number of arguments", name),
            ))
        }
    };
    Ok(Expr::Comprehension {
        kind,
        range: Box::new(target),
        var,
        filter,
        step: Box::new(step),
    })
}

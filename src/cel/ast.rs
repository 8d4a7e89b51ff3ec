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

//! Expression syntax tree.

use std::fmt;

/// Literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    And,
    Or,
}

impl BinaryOp {
    /// Overload name as reported in diagnostics.
    pub fn function_name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "_+_",
            BinaryOp::Sub => "_-_",
            BinaryOp::Mul => "_*_",
            BinaryOp::Div => "_/_",
            BinaryOp::Rem => "_%_",
            BinaryOp::Eq => "_==_",
            BinaryOp::Ne => "_!=_",
            BinaryOp::Lt => "_<_",
            BinaryOp::Le => "_<=_",
            BinaryOp::Gt => "_>_",
            BinaryOp::Ge => "_>=_",
            BinaryOp::In => "@in",
            BinaryOp::And => "_&&_",
            BinaryOp::Or => "_||_",
        }
    }
}

/// Comprehension macros over lists and map keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    All,
    Exists,
    ExistsOne,
    Map,
    Filter,
}

impl MacroKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "all" => Some(MacroKind::All),
            "exists" => Some(MacroKind::Exists),
            "exists_one" => Some(MacroKind::ExistsOne),
            "map" => Some(MacroKind::Map),
            "filter" => Some(MacroKind::Filter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Ident(String),
    /// Field selection. `test_only` marks the `has()` form.
    Select {
        operand: Box<Expr>,
        field: String,
        test_only: bool,
    },
    Index {
        operand: Box<Expr>,
        index: Box<Expr>,
    },
    /// Global function call, or a method call when `target` is set.
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `range.macro(var, [filter,] step)`.
    Comprehension {
        kind: MacroKind,
        range: Box<Expr>,
        var: String,
        filter: Option<Box<Expr>>,
        step: Box<Expr>,
    },
}

impl fmt::Display for Expr {
    /// A compact rendering used in diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Literal::Null) => f.write_str("null"),
            Expr::Literal(Literal::Bool(b)) => write!(f, "{}", b),
            Expr::Literal(Literal::Int(i)) => write!(f, "{}", i),
            Expr::Literal(Literal::Uint(u)) => write!(f, "{}u", u),
            Expr::Literal(Literal::Double(d)) => write!(f, "{:?}", d),
            Expr::Literal(Literal::String(s)) => write!(f, "{:?}", s),
            Expr::Ident(name) => f.write_str(name),
            Expr::Select {
                operand,
                field,
                test_only: false,
            } => write!(f, "{}.{}", operand, field),
            Expr::Select {
                operand,
                field,
                test_only: true,
            } => write!(f, "has({}.{})", operand, field),
            Expr::Index { operand, index } => write!(f, "{}[{}]", operand, index),
            Expr::Call {
                target,
                function,
                args,
            } => {
                if let Some(target) = target {
                    write!(f, "{}.", target)?;
                }
                write!(f, "{}(", function)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Expr::Map(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                f.write_str("}")
            }
            Expr::Unary { op, operand } => match op {
                UnaryOp::Not => write!(f, "!{}", operand),
                UnaryOp::Neg => write!(f, "-{}", operand),
            },
            Expr::Binary { op, lhs, rhs } => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Rem => "%",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::In => "in",
                    BinaryOp::And => "&&",
                    BinaryOp::Or => "||",
                };
                write!(f, "{} {} {}", lhs, symbol, rhs)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => write!(f, "{} ? {} : {}", condition, then, otherwise),
            Expr::Comprehension {
                kind,
                range,
                var,
                filter,
                step,
            } => {
                let name = match kind {
                    MacroKind::All => "all",
                    MacroKind::Exists => "exists",
                    MacroKind::ExistsOne => "exists_one",
                    MacroKind::Map => "map",
                    MacroKind::Filter => "filter",
                };
                match filter {
                    Some(filter) => write!(f, "{}.{}({}, {}, {})", range, name, var, filter, step),
                    None => write!(f, "{}.{}({}, {})", range, name, var, step),
                }
            }
        }
    }
}

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

//! Tree-walking evaluator.

use super::ast::{BinaryOp, Expr, Literal, MacroKind, UnaryOp};
use super::authz::AccessCheck;
use super::value::{AccessTarget, Key, Value};
use dashmap::DashMap;
use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use thiserror::Error;

/// EvalError is a runtime evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("invalid type for field selection.")]
    InvalidFieldSelection,

    #[error("no matching overload for '{function}' applied to '({args})'")]
    NoMatchingOverload { function: String, args: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("modulus by zero")]
    ModulusByZero,

    #[error("return error for overflow")]
    Overflow,

    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(i64),

    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    #[error("{0}")]
    Invalid(String),

    #[error("evaluation canceled")]
    Canceled,
}

fn no_overload(function: &str, args: &[&Value]) -> EvalError {
    EvalError::NoMatchingOverload {
        function: function.to_string(),
        args: args
            .iter()
            .map(|v| v.type_name())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Activation holds the variables visible to an expression.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    vars: BTreeMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, value: Value) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

const REGEX_CACHE_CAPACITY: usize = 32;

/// RegexCache keeps the compiled patterns of `matches()` across evaluations
/// of one expression. Patterns past the capacity are compiled per call.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<String, Regex>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    fn is_match(&self, text: &str, pattern: &str) -> Result<bool, EvalError> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.is_match(text));
        }
        let re = Regex::new(pattern)
            .map_err(|e| EvalError::Invalid(format!("invalid regular expression '{}': {}", pattern, e)))?;
        let matched = re.is_match(text);
        if self.compiled.len() < REGEX_CACHE_CAPACITY {
            self.compiled.insert(pattern.to_string(), re);
        }
        Ok(matched)
    }
}

/// Evaluate `expr`. When `abort` is set, long-running loops stop with
/// [`EvalError::Canceled`].
pub fn evaluate(
    expr: &Expr,
    activation: &Activation,
    regexes: &RegexCache,
    abort: Option<&AtomicBool>,
) -> Result<Value, EvalError> {
    let mut interpreter = Interpreter {
        activation,
        locals: Vec::new(),
        regexes,
        abort,
    };
    interpreter.check_abort()?;
    interpreter.eval(expr)
}

struct Interpreter<'a> {
    activation: &'a Activation,
    locals: Vec<(String, Value)>,
    regexes: &'a RegexCache,
    abort: Option<&'a AtomicBool>,
}

impl<'a> Interpreter<'a> {
    fn check_abort(&self) -> Result<(), EvalError> {
        match self.abort {
            Some(flag) if flag.load(AtomicOrdering::Relaxed) => Err(EvalError::Canceled),
            _ => Ok(()),
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, EvalError> {
        if let Some((_, value)) = self.locals.iter().rev().find(|(n, _)| n == name) {
            return Ok(value.clone());
        }
        self.activation
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UndeclaredReference(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Literal(lit) => Ok(match lit {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Int(i) => Value::Int(*i),
                Literal::Uint(u) => Value::Uint(*u),
                Literal::Double(d) => Value::Double(*d),
                Literal::String(s) => Value::string(s),
            }),
            Expr::Ident(name) => self.lookup(name),
            Expr::Select {
                operand,
                field,
                test_only,
            } => {
                let target = self.eval(operand)?;
                select(&target, field, *test_only)
            }
            Expr::Index { operand, index } => {
                let target = self.eval(operand)?;
                let index = self.eval(index)?;
                index_value(&target, &index)
            }
            Expr::List(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::list(values))
            }
            Expr::Map(entries) => {
                let mut out = BTreeMap::new();
                for (k, v) in entries {
                    let key = self.eval(k)?;
                    let key = key
                        .as_key()
                        .ok_or_else(|| EvalError::Invalid(format!("unsupported key type: {}", key.type_name())))?;
                    let value = self.eval(v)?;
                    if out.insert(key.clone(), value).is_some() {
                        return Err(EvalError::Invalid(format!(
                            "Failed with repeated key: {}",
                            key.to_value()
                        )));
                    }
                }
                Ok(Value::Map(Arc::new(out)))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match (op, &value) {
                    (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                    (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow),
                    (UnaryOp::Neg, Value::Double(d)) => Ok(Value::Double(-d)),
                    (UnaryOp::Not, _) => Err(no_overload("!_", &[&value])),
                    (UnaryOp::Neg, _) => Err(no_overload("-_", &[&value])),
                }
            }
            Expr::Binary {
                op: BinaryOp::And,
                lhs,
                rhs,
            } => self.logical(lhs, rhs, false),
            Expr::Binary {
                op: BinaryOp::Or,
                lhs,
                rhs,
            } => self.logical(lhs, rhs, true),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => match self.eval(condition)? {
                Value::Bool(true) => self.eval(then),
                Value::Bool(false) => self.eval(otherwise),
                other => Err(no_overload("_?_:_", &[&other])),
            },
            Expr::Call {
                target,
                function,
                args,
            } => {
                let target = match target {
                    Some(target) => Some(self.eval(target)?),
                    None => None,
                };
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                match target {
                    Some(target) => call_method(&target, function, &args, self.regexes),
                    None => call_function(function, &args, self.regexes),
                }
            }
            Expr::Comprehension {
                kind,
                range,
                var,
                filter,
                step,
            } => {
                let range = self.eval(range)?;
                self.comprehension(*kind, &range, var, filter.as_deref(), step)
            }
        }
    }

    /// `&&` and `||` are commutative with respect to errors: a deciding
    /// operand wins over an erroring one on either side.
    fn logical(&mut self, lhs: &Expr, rhs: &Expr, short_circuit_on: bool) -> Result<Value, EvalError> {
        let function = if short_circuit_on { "_||_" } else { "_&&_" };
        let left = self.eval(lhs);
        if let Ok(Value::Bool(b)) = left {
            if b == short_circuit_on {
                return Ok(Value::Bool(b));
            }
        }
        let right = self.eval(rhs);
        if let Ok(Value::Bool(b)) = right {
            if b == short_circuit_on {
                return Ok(Value::Bool(b));
            }
        }
        match (left, right) {
            (Ok(Value::Bool(_)), Ok(Value::Bool(_))) => Ok(Value::Bool(!short_circuit_on)),
            (Err(e), _) => Err(e),
            (_, Err(e)) => Err(e),
            (Ok(l), Ok(r)) => Err(no_overload(function, &[&l, &r])),
        }
    }

    fn eval_bound(&mut self, var: &str, item: &Value, expr: &Expr) -> Result<Value, EvalError> {
        self.locals.push((var.to_string(), item.clone()));
        let result = self.eval(expr);
        self.locals.pop();
        result
    }

    fn comprehension(
        &mut self,
        kind: MacroKind,
        range: &Value,
        var: &str,
        filter: Option<&Expr>,
        step: &Expr,
    ) -> Result<Value, EvalError> {
        let items: Vec<Value> = match range {
            Value::List(items) => items.as_ref().clone(),
            Value::Map(entries) => entries.keys().map(Key::to_value).collect(),
            other => {
                let name = match kind {
                    MacroKind::All => "all",
                    MacroKind::Exists => "exists",
                    MacroKind::ExistsOne => "exists_one",
                    MacroKind::Map => "map",
                    MacroKind::Filter => "filter",
                };
                return Err(no_overload(name, &[other]));
            }
        };

        let mut first_error: Option<EvalError> = None;
        let mut matched = 0usize;
        let mut out = Vec::new();
        for item in items {
            self.check_abort()?;
            match kind {
                MacroKind::All | MacroKind::Exists => {
                    let decisive = kind == MacroKind::Exists;
                    match self.eval_bound(var, &item, step) {
                        Ok(Value::Bool(b)) if b == decisive => return Ok(Value::Bool(b)),
                        Ok(Value::Bool(_)) => {}
                        Ok(other) => {
                            first_error.get_or_insert(no_overload("_&&_", &[&other]));
                        }
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                MacroKind::ExistsOne => match self.eval_bound(var, &item, step)? {
                    Value::Bool(b) => matched += usize::from(b),
                    other => return Err(no_overload("exists_one", &[&other])),
                },
                MacroKind::Filter => match self.eval_bound(var, &item, step)? {
                    Value::Bool(true) => out.push(item),
                    Value::Bool(false) => {}
                    other => return Err(no_overload("filter", &[&other])),
                },
                MacroKind::Map => {
                    if let Some(filter) = filter {
                        match self.eval_bound(var, &item, filter)? {
                            Value::Bool(true) => {}
                            Value::Bool(false) => continue,
                            other => return Err(no_overload("map", &[&other])),
                        }
                    }
                    out.push(self.eval_bound(var, &item, step)?);
                }
            }
        }

        match kind {
            MacroKind::All | MacroKind::Exists => match first_error {
                Some(err) => Err(err),
                None => Ok(Value::Bool(kind == MacroKind::All)),
            },
            MacroKind::ExistsOne => Ok(Value::Bool(matched == 1)),
            MacroKind::Map | MacroKind::Filter => Ok(Value::list(out)),
        }
    }
}

fn select(target: &Value, field: &str, test_only: bool) -> Result<Value, EvalError> {
    match target {
        Value::Map(entries) => {
            let value = entries.get(&Key::from(field));
            if test_only {
                Ok(Value::Bool(value.is_some()))
            } else {
                value
                    .cloned()
                    .ok_or_else(|| EvalError::NoSuchKey(field.to_string()))
            }
        }
        Value::Null if !test_only => Err(EvalError::NoSuchKey(field.to_string())),
        Value::Authorizer(binding) if field == "requestResource" && !test_only => {
            Ok(Value::AccessTarget(Arc::new(AccessTarget {
                binding: binding.clone(),
                check: binding.request_resource.clone(),
            })))
        }
        _ => Err(EvalError::InvalidFieldSelection),
    }
}

fn as_index(index: &Value) -> Option<i64> {
    match index {
        Value::Int(i) => Some(*i),
        Value::Uint(u) => i64::try_from(*u).ok(),
        Value::Double(d) if d.fract() == 0.0 && d.is_finite() => Some(*d as i64),
        _ => None,
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, EvalError> {
    match target {
        Value::List(items) => {
            let i = as_index(index).ok_or_else(|| no_overload("_[_]", &[target, index]))?;
            usize::try_from(i)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or(EvalError::IndexOutOfBounds(i))
        }
        Value::Map(entries) => {
            let key = index
                .as_key()
                .ok_or_else(|| no_overload("_[_]", &[target, index]))?;
            entries
                .get(&key)
                .cloned()
                .ok_or_else(|| EvalError::NoSuchKey(index.to_string()))
        }
        Value::Null => Err(EvalError::NoSuchKey(index.to_string())),
        _ => Err(no_overload("_[_]", &[target, index])),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let overload = || no_overload(op.function_name(), &[lhs, rhs]);
    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs.equals(rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!lhs.equals(rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = lhs.compare(rhs).ok_or_else(overload)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::In => match rhs {
            Value::List(items) => Ok(Value::Bool(items.iter().any(|item| item.equals(lhs)))),
            Value::Map(entries) => Ok(Value::Bool(
                lhs.as_key().map_or(false, |key| entries.contains_key(&key)),
            )),
            _ => Err(overload()),
        },
        BinaryOp::Add => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int).ok_or(EvalError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => a.checked_add(*b).map(Value::Uint).ok_or(EvalError::Overflow),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::string(&format!("{}{}", a, b))),
            (Value::List(a), Value::List(b)) => {
                let mut joined = a.as_ref().clone();
                joined.extend(b.iter().cloned());
                Ok(Value::list(joined))
            }
            _ => Err(overload()),
        },
        BinaryOp::Sub => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int).ok_or(EvalError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => a.checked_sub(*b).map(Value::Uint).ok_or(EvalError::Overflow),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a - b)),
            _ => Err(overload()),
        },
        BinaryOp::Mul => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int).ok_or(EvalError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => a.checked_mul(*b).map(Value::Uint).ok_or(EvalError::Overflow),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a * b)),
            _ => Err(overload()),
        },
        BinaryOp::Div => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) | (Value::Uint(_), Value::Uint(0)) => Err(EvalError::DivisionByZero),
            (Value::Int(a), Value::Int(b)) => a.checked_div(*b).map(Value::Int).ok_or(EvalError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => Ok(Value::Uint(a / b)),
            (Value::Double(a), Value::Double(b)) => Ok(Value::Double(a / b)),
            _ => Err(overload()),
        },
        BinaryOp::Rem => match (lhs, rhs) {
            (Value::Int(_), Value::Int(0)) | (Value::Uint(_), Value::Uint(0)) => Err(EvalError::ModulusByZero),
            (Value::Int(a), Value::Int(b)) => a.checked_rem(*b).map(Value::Int).ok_or(EvalError::Overflow),
            (Value::Uint(a), Value::Uint(b)) => Ok(Value::Uint(a % b)),
            _ => Err(overload()),
        },
        BinaryOp::And | BinaryOp::Or => Err(overload()),
    }
}

fn size(value: &Value) -> Result<Value, EvalError> {
    let n = match value {
        Value::String(s) => s.chars().count(),
        Value::List(items) => items.len(),
        Value::Map(entries) => entries.len(),
        other => return Err(no_overload("size", &[other])),
    };
    i64::try_from(n).map(Value::Int).map_err(|_| EvalError::Overflow)
}

fn call_function(function: &str, args: &[Value], regexes: &RegexCache) -> Result<Value, EvalError> {
    let refs: Vec<&Value> = args.iter().collect();
    let overload = || no_overload(function, &refs);
    match (function, args) {
        ("size", [value]) => size(value),
        ("dyn", [value]) => Ok(value.clone()),
        ("matches", [Value::String(text), Value::String(pattern)]) => regexes.is_match(text, pattern).map(Value::Bool),
        ("string", [value]) => match value {
            Value::String(_) => Ok(value.clone()),
            Value::Bool(_) | Value::Int(_) | Value::Double(_) => Ok(Value::string(&value.to_string())),
            Value::Uint(u) => Ok(Value::string(&u.to_string())),
            _ => Err(overload()),
        },
        ("int", [value]) => match value {
            Value::Int(_) => Ok(value.clone()),
            Value::Uint(u) => i64::try_from(*u).map(Value::Int).map_err(|_| EvalError::Overflow),
            Value::Double(d) => {
                if d.is_finite() && *d > i64::MIN as f64 && *d < i64::MAX as f64 {
                    Ok(Value::Int(d.trunc() as i64))
                } else {
                    Err(EvalError::Overflow)
                }
            }
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| EvalError::Invalid(format!("cannot convert '{}' to int", s))),
            _ => Err(overload()),
        },
        ("uint", [value]) => match value {
            Value::Uint(_) => Ok(value.clone()),
            Value::Int(i) => u64::try_from(*i).map(Value::Uint).map_err(|_| EvalError::Overflow),
            Value::Double(d) => {
                if d.is_finite() && *d >= 0.0 && *d < u64::MAX as f64 {
                    Ok(Value::Uint(d.trunc() as u64))
                } else {
                    Err(EvalError::Overflow)
                }
            }
            Value::String(s) => s
                .parse::<u64>()
                .map(Value::Uint)
                .map_err(|_| EvalError::Invalid(format!("cannot convert '{}' to uint", s))),
            _ => Err(overload()),
        },
        ("double", [value]) => match value {
            Value::Double(_) => Ok(value.clone()),
            Value::Int(i) => Ok(Value::Double(*i as f64)),
            Value::Uint(u) => Ok(Value::Double(*u as f64)),
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| EvalError::Invalid(format!("cannot convert '{}' to double", s))),
            _ => Err(overload()),
        },
        ("bool", [value]) => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) => match s.as_ref() {
                "true" | "True" | "TRUE" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "False" | "FALSE" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(EvalError::Invalid(format!("cannot convert '{}' to bool", s))),
            },
            _ => Err(overload()),
        },
        _ => Err(overload()),
    }
}

fn string_arg<'v>(args: &'v [Value]) -> Option<&'v str> {
    match args {
        [Value::String(s)] => Some(s.as_ref()),
        _ => None,
    }
}

fn call_method(target: &Value, function: &str, args: &[Value], regexes: &RegexCache) -> Result<Value, EvalError> {
    let overload = || {
        let mut refs: Vec<&Value> = vec![target];
        refs.extend(args.iter());
        no_overload(function, &refs)
    };
    match target {
        Value::String(s) => match (function, args) {
            ("size", []) => size(target),
            ("lowerAscii", []) => Ok(Value::string(&s.to_ascii_lowercase())),
            ("upperAscii", []) => Ok(Value::string(&s.to_ascii_uppercase())),
            ("startsWith", _) => string_arg(args).map(|p| Value::Bool(s.starts_with(p))).ok_or_else(overload),
            ("endsWith", _) => string_arg(args).map(|p| Value::Bool(s.ends_with(p))).ok_or_else(overload),
            ("contains", _) => string_arg(args).map(|p| Value::Bool(s.contains(p))).ok_or_else(overload),
            ("matches", _) => match string_arg(args) {
                Some(pattern) => regexes.is_match(s, pattern).map(Value::Bool),
                None => Err(overload()),
            },
            _ => Err(overload()),
        },
        Value::List(_) | Value::Map(_) => match (function, args) {
            ("size", []) => size(target),
            _ => Err(overload()),
        },
        Value::Authorizer(binding) => {
            let mut check = AccessCheck::default();
            match (function, string_arg(args)) {
                ("group", Some(group)) => check.group = group.to_string(),
                ("path", Some(path)) => check.path = Some(path.to_string()),
                _ => return Err(overload()),
            }
            Ok(Value::AccessTarget(Arc::new(AccessTarget {
                binding: binding.clone(),
                check,
            })))
        }
        Value::AccessTarget(target_check) => {
            let arg = string_arg(args).ok_or_else(overload)?;
            let mut check = target_check.check.clone();
            let is_path = check.path.is_some();
            match function {
                "check" => {
                    check.verb = arg.to_string();
                    let binding = &target_check.binding;
                    let decision = binding.authorizer.authorize(&binding.user, &check);
                    return Ok(Value::Decision(Arc::new(decision)));
                }
                "resource" if !is_path => check.resource = arg.to_string(),
                "subresource" if !is_path => check.subresource = arg.to_string(),
                "namespace" if !is_path => check.namespace = arg.to_string(),
                "name" if !is_path => check.name = arg.to_string(),
                _ => return Err(overload()),
            }
            Ok(Value::AccessTarget(Arc::new(AccessTarget {
                binding: target_check.binding.clone(),
                check,
            })))
        }
        Value::Decision(decision) => match (function, args) {
            ("allowed", []) => Ok(Value::Bool(decision.allowed())),
            ("reason", []) => Ok(Value::string(&decision.reason)),
            ("errored", []) => Ok(Value::Bool(decision.error.is_some())),
            ("error", []) => Ok(Value::string(decision.error.as_deref().unwrap_or(""))),
            _ => Err(overload()),
        },
        _ => Err(overload()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::authz::{StaticAuthorizer, StaticRule};
    use super::super::parser::parse;
    use super::super::value::AuthorizerBinding;
    use super::*;
    use crate::admission::UserInfo;
    use serde_json::json;

    fn eval_with(source: &str, activation: &Activation) -> Result<Value, EvalError> {
        let expr = parse(source).unwrap();
        evaluate(&expr, activation, &RegexCache::new(), None)
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        eval_with(source, &Activation::new())
    }

    fn object_activation() -> Activation {
        Activation::new()
            .bind(
                "object",
                Value::from_json(&json!({
                    "metadata": {"name": "test-k8s", "labels": {"env": "prod"}},
                    "items": [1, 2, 3]
                })),
            )
            .bind("params", Value::Null)
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::Int(7));
        assert_eq!(eval("7 / 2").unwrap(), Value::Int(3));
        assert_eq!(eval("7 % 4 == 3").unwrap(), Value::Bool(true));
        assert_eq!(eval("'ab' + 'c' == 'abc'").unwrap(), Value::Bool(true));
        assert_eq!(eval("[1] + [2] == [1, 2]").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 < 2.5").unwrap(), Value::Bool(true));
        assert_eq!(eval("1 / 0").unwrap_err(), EvalError::DivisionByZero);
        assert_eq!(eval("9223372036854775807 + 1").unwrap_err(), EvalError::Overflow);
        assert_eq!(
            eval("1 + 'a'").unwrap_err().to_string(),
            "no matching overload for '_+_' applied to '(int, string)'"
        );
    }

    #[test]
    fn test_field_selection_errors() {
        let activation = object_activation();
        assert_eq!(
            eval_with("object.nonExistentProperty == 'x'", &activation)
                .unwrap_err()
                .to_string(),
            "no such key: nonExistentProperty"
        );
        assert_eq!(
            eval_with("params.metadata.name == 'x'", &activation)
                .unwrap_err()
                .to_string(),
            "no such key: metadata"
        );
        assert_eq!(
            eval_with("has(params.metadata)", &activation).unwrap_err().to_string(),
            "invalid type for field selection."
        );
        assert_eq!(
            eval_with("has(object.metadata.labels) && object.metadata.labels.env == 'prod'", &activation).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with("params != null && params.metadata.name == 'x'", &activation).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_logical_error_absorption() {
        let activation = object_activation();
        assert_eq!(
            eval_with("object.missing == 1 || true", &activation).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with("object.missing == 1 && false", &activation).unwrap(),
            Value::Bool(false)
        );
        assert!(eval_with("object.missing == 1 && true", &activation).is_err());
        assert!(eval("1 && true").is_err());
    }

    #[test]
    fn test_macros() {
        let activation = object_activation();
        assert_eq!(eval_with("object.items.all(i, i > 0)", &activation).unwrap(), Value::Bool(true));
        assert_eq!(eval_with("object.items.exists(i, i == 2)", &activation).unwrap(), Value::Bool(true));
        assert_eq!(eval_with("object.items.exists_one(i, i > 1)", &activation).unwrap(), Value::Bool(false));
        assert_eq!(
            eval_with("object.items.map(i, i * 10)", &activation).unwrap(),
            Value::list(vec![Value::Int(10), Value::Int(20), Value::Int(30)])
        );
        assert_eq!(
            eval_with("object.items.map(i, i > 1, i)", &activation).unwrap(),
            Value::list(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            eval_with("object.items.filter(i, i % 2 == 1).size()", &activation).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            eval_with("object.metadata.labels.all(k, k.startsWith('e'))", &activation).unwrap(),
            Value::Bool(true)
        );
        // a false element decides all() even when another element errors
        assert_eq!(eval("[0, 1].all(x, 1 / x > 5)").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("'Test-K8s'.lowerAscii()").unwrap(), Value::string("test-k8s"));
        assert_eq!(eval("'abc'.matches('^a.c$')").unwrap(), Value::Bool(true));
        assert_eq!(eval("matches('abc', 'z')").unwrap(), Value::Bool(false));
        assert_eq!(eval("size('héllo')").unwrap(), Value::Int(5));
        assert_eq!(eval("int('42') + 1").unwrap(), Value::Int(43));
        assert_eq!(eval("string(1.5)").unwrap(), Value::string("1.5"));
        assert!(eval("'a'.matches('(')").is_err());
        assert!(eval("(5).startsWith('a')").is_err());
    }

    #[test]
    fn test_map_literal_and_in() {
        assert_eq!(eval("{'a': 1}['a']").unwrap(), Value::Int(1));
        assert_eq!(eval("'a' in {'a': 1}").unwrap(), Value::Bool(true));
        assert_eq!(eval("3 in [1, 2]").unwrap(), Value::Bool(false));
        assert_eq!(eval("{'a': 1}['b']").unwrap_err().to_string(), "no such key: b");
        assert!(eval("{'a': 1, 'a': 2}").is_err());
        assert_eq!(eval("[1, 2][5]").unwrap_err(), EvalError::IndexOutOfBounds(5));
    }

    #[test]
    fn test_authorizer_builder() {
        let authorizer = StaticAuthorizer::new(vec![StaticRule {
            users: vec!["alice".to_string()],
            verbs: vec!["get".to_string()],
            api_groups: vec!["apps".to_string()],
            resources: vec!["deployments".to_string()],
            ..Default::default()
        }]);
        let binding = AuthorizerBinding {
            authorizer: Arc::new(authorizer),
            user: UserInfo::new("alice", &[]),
            request_resource: AccessCheck::resource("apps", "deployments"),
        };
        let activation = Activation::new().bind("authorizer", Value::Authorizer(Arc::new(binding)));

        assert_eq!(
            eval_with(
                "authorizer.group('apps').resource('deployments').namespace('default').check('get').allowed()",
                &activation
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            eval_with("authorizer.requestResource.check('delete').allowed()", &activation).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            eval_with("authorizer.path('/healthz').check('get').allowed()", &activation).unwrap(),
            Value::Bool(false)
        );
        assert!(eval_with("authorizer.path('/x').namespace('a')", &activation).is_err());
    }

    #[test]
    fn test_abort_flag_cancels() {
        let expr = parse("[1, 2, 3].all(x, x > 0)").unwrap();
        let abort = AtomicBool::new(true);
        assert_eq!(
            evaluate(&expr, &Activation::new(), &RegexCache::new(), Some(&abort)).unwrap_err(),
            EvalError::Canceled
        );
    }

    #[test]
    fn test_regexes_are_compiled_once() {
        let expr = parse("'abc'.matches('^a') && matches('xyz', 'y')").unwrap();
        let regexes = RegexCache::new();
        for _ in 0..3 {
            assert_eq!(evaluate(&expr, &Activation::new(), &regexes, None).unwrap(), Value::Bool(true));
        }
        assert_eq!(regexes.len(), 2);

        let patterns: Vec<String> = (0..40).map(|i| format!("'a{}'", i)).collect();
        let expr = parse(&format!("[{}].exists(p, 'b'.matches(p))", patterns.join(", "))).unwrap();
        let regexes = RegexCache::new();
        assert_eq!(evaluate(&expr, &Activation::new(), &regexes, None).unwrap(), Value::Bool(false));
        assert_eq!(regexes.len(), REGEX_CACHE_CAPACITY);

        let invalid = parse("'a'.matches('(')").unwrap();
        assert!(evaluate(&invalid, &Activation::new(), &regexes, None).is_err());
    }

    #[test]
    fn test_undeclared_reference() {
        assert_eq!(
            eval("unknown == 1").unwrap_err().to_string(),
            "undeclared reference to 'unknown'"
        );
    }
}

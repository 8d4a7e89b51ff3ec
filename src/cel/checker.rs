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

//! Advisory type checking against structural schemas.
//!
//! The checker never rejects an expression. It walks the syntax tree with
//! the best type information available and reports findings that likely
//! indicate a bug: fields the schema does not declare, operands that no
//! overload accepts, and results of the wrong type.

use super::ast::{BinaryOp, Expr, Literal, MacroKind, UnaryOp};
use super::{ResultKind, TypeEnv};
use crate::schema::{FieldLookup, SchemaType, Structural};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Ty<'s> {
    Dyn,
    Null,
    Bool,
    Int,
    Uint,
    Double,
    String,
    List(Box<Ty<'s>>),
    Map(Box<Ty<'s>>),
    Object(&'s Structural),
    Authorizer,
    AccessTarget,
    Decision,
}

impl<'s> Ty<'s> {
    fn of_schema(schema: &'s Structural) -> Self {
        if schema.int_or_string {
            return Ty::Dyn;
        }
        match schema.schema_type {
            SchemaType::Boolean => Ty::Bool,
            SchemaType::Integer => Ty::Int,
            SchemaType::Number => Ty::Double,
            SchemaType::String => Ty::String,
            SchemaType::Array => match &schema.items {
                Some(items) => Ty::List(Box::new(Ty::of_schema(items))),
                None => Ty::List(Box::new(Ty::Dyn)),
            },
            SchemaType::Object => match &schema.additional_properties {
                Some(values) if schema.properties.is_empty() => Ty::Map(Box::new(Ty::of_schema(values))),
                _ if schema.preserve_unknown_fields && schema.properties.is_empty() => Ty::Dyn,
                _ => Ty::Object(schema),
            },
            SchemaType::Untyped => Ty::Dyn,
        }
    }

    fn name(&self) -> String {
        match self {
            Ty::Dyn => "dyn".to_string(),
            Ty::Null => "null_type".to_string(),
            Ty::Bool => "bool".to_string(),
            Ty::Int => "int".to_string(),
            Ty::Uint => "uint".to_string(),
            Ty::Double => "double".to_string(),
            Ty::String => "string".to_string(),
            Ty::List(elem) => format!("list({})", elem.name()),
            Ty::Map(value) => format!("map(string, {})", value.name()),
            Ty::Object(_) => "object".to_string(),
            Ty::Authorizer => "Authorizer".to_string(),
            Ty::AccessTarget => "ResourceCheck".to_string(),
            Ty::Decision => "Decision".to_string(),
        }
    }

    fn is_dyn(&self) -> bool {
        matches!(self, Ty::Dyn)
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Uint | Ty::Double)
    }

    fn is_mapping(&self) -> bool {
        matches!(self, Ty::Map(_) | Ty::Object(_))
    }

    fn same_kind(&self, other: &Ty<'_>) -> bool {
        if self.is_mapping() && other.is_mapping() {
            return true;
        }
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    fn accepts_bool(&self) -> bool {
        matches!(self, Ty::Bool | Ty::Dyn)
    }
}

fn request_schema() -> Structural {
    let string = || Structural::of_type(SchemaType::String);
    let gvk = || Structural::object(vec![("group", string()), ("version", string()), ("kind", string())]);
    let gvr = || Structural::object(vec![("group", string()), ("version", string()), ("resource", string())]);
    Structural::object(vec![
        ("kind", gvk()),
        ("resource", gvr()),
        ("subResource", string()),
        ("requestKind", gvk()),
        ("requestResource", gvr()),
        ("requestSubResource", string()),
        ("name", string()),
        ("namespace", string()),
        ("operation", string()),
        (
            "userInfo",
            Structural::object(vec![
                ("username", string()),
                ("uid", string()),
                ("groups", Structural::array_of(string())),
                ("extra", Structural::map_of(Structural::array_of(string()))),
            ]),
        ),
        ("dryRun", Structural::of_type(SchemaType::Boolean)),
        ("options", Structural::preserve_unknown()),
    ])
}

struct Checker<'s> {
    vars: BTreeMap<&'static str, Ty<'s>>,
    locals: Vec<(String, Ty<'s>)>,
    warnings: Vec<String>,
}

/// Type-check `expr` and return the warnings found.
pub(crate) fn check(expr: &Expr, env: &TypeEnv, result: ResultKind) -> Vec<String> {
    let request = request_schema();
    let object = match &env.object {
        Some(schema) => Ty::of_schema(schema),
        None => Ty::Dyn,
    };
    let params = match &env.params {
        Some(schema) => Ty::of_schema(schema),
        None => Ty::Dyn,
    };

    let mut vars = BTreeMap::new();
    vars.insert("object", object.clone());
    vars.insert("oldObject", object);
    vars.insert("params", params);
    vars.insert("request", Ty::of_schema(&request));
    vars.insert("authorizer", Ty::Authorizer);

    let mut checker = Checker {
        vars,
        locals: Vec::new(),
        warnings: Vec::new(),
    };
    let ty = checker.infer(expr);
    match result {
        ResultKind::Bool if !ty.accepts_bool() => checker
            .warnings
            .push(format!("expected result type bool but found {}", ty.name())),
        ResultKind::String if !matches!(ty, Ty::String | Ty::Null | Ty::Dyn) => checker
            .warnings
            .push(format!("expected result type string but found {}", ty.name())),
        _ => {}
    }
    checker.warnings
}

impl<'s> Checker<'s> {
    fn no_overload(&mut self, function: &str, args: &[&Ty<'_>]) {
        let names: Vec<String> = args.iter().map(|t| t.name()).collect();
        self.warnings.push(format!(
            "found no matching overload for '{}' applied to '({})'",
            function,
            names.join(", ")
        ));
    }

    fn infer(&mut self, expr: &Expr) -> Ty<'s> {
        match expr {
            Expr::Literal(lit) => match lit {
                Literal::Null => Ty::Null,
                Literal::Bool(_) => Ty::Bool,
                Literal::Int(_) => Ty::Int,
                Literal::Uint(_) => Ty::Uint,
                Literal::Double(_) => Ty::Double,
                Literal::String(_) => Ty::String,
            },
            Expr::Ident(name) => {
                if let Some((_, ty)) = self.locals.iter().rev().find(|(n, _)| n == name) {
                    return ty.clone();
                }
                match self.vars.get(name.as_str()) {
                    Some(ty) => ty.clone(),
                    None => {
                        self.warnings.push(format!("undeclared reference to '{}'", name));
                        Ty::Dyn
                    }
                }
            }
            Expr::Select {
                operand,
                field,
                test_only,
            } => {
                let target = self.infer(operand);
                let ty = self.select(&target, field);
                if *test_only {
                    Ty::Bool
                } else {
                    ty
                }
            }
            Expr::Index { operand, index } => {
                let target = self.infer(operand);
                let index_ty = self.infer(index);
                match (&target, &index_ty) {
                    (Ty::List(elem), Ty::Int | Ty::Uint | Ty::Dyn) => elem.as_ref().clone(),
                    (Ty::Map(value), Ty::String | Ty::Dyn) => value.as_ref().clone(),
                    (Ty::Object(_), Ty::String | Ty::Dyn) | (Ty::Dyn, _) | (Ty::Null, _) => Ty::Dyn,
                    _ => {
                        self.no_overload("_[_]", &[&target, &index_ty]);
                        Ty::Dyn
                    }
                }
            }
            Expr::Call {
                target,
                function,
                args,
            } => {
                let receiver = target.as_ref().map(|t| self.infer(t));
                let arg_tys: Vec<Ty<'s>> = args.iter().map(|a| self.infer(a)).collect();
                match receiver {
                    Some(receiver) => self.method(&receiver, function, &arg_tys),
                    None => self.function(function, &arg_tys),
                }
            }
            Expr::List(items) => {
                let tys: Vec<Ty<'s>> = items.iter().map(|i| self.infer(i)).collect();
                Ty::List(Box::new(unify(&tys)))
            }
            Expr::Map(entries) => {
                let mut values = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    self.infer(k);
                    values.push(self.infer(v));
                }
                Ty::Map(Box::new(unify(&values)))
            }
            Expr::Unary { op, operand } => {
                let ty = self.infer(operand);
                match op {
                    UnaryOp::Not => {
                        if !ty.accepts_bool() {
                            self.no_overload("!_", &[&ty]);
                        }
                        Ty::Bool
                    }
                    UnaryOp::Neg => match ty {
                        Ty::Int | Ty::Double | Ty::Dyn => ty,
                        other => {
                            self.no_overload("-_", &[&other]);
                            Ty::Dyn
                        }
                    },
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let l = self.infer(lhs);
                let r = self.infer(rhs);
                self.binary(*op, &l, &r)
            }
            Expr::Conditional {
                condition,
                then,
                otherwise,
            } => {
                let cond = self.infer(condition);
                if !cond.accepts_bool() {
                    self.no_overload("_?_:_", &[&cond]);
                }
                let a = self.infer(then);
                let b = self.infer(otherwise);
                unify(&[a, b])
            }
            Expr::Comprehension {
                kind,
                range,
                var,
                filter,
                step,
            } => {
                let range_ty = self.infer(range);
                let elem = match &range_ty {
                    Ty::List(elem) => elem.as_ref().clone(),
                    Ty::Map(_) | Ty::Object(_) => Ty::String,
                    Ty::Dyn => Ty::Dyn,
                    other => {
                        self.warnings
                            .push(format!("expression of type '{}' cannot be the range of a comprehension", other.name()));
                        Ty::Dyn
                    }
                };
                self.locals.push((var.clone(), elem.clone()));
                if let Some(filter) = filter {
                    let f = self.infer(filter);
                    if !f.accepts_bool() {
                        self.no_overload("_&&_", &[&f]);
                    }
                }
                let step_ty = self.infer(step);
                self.locals.pop();
                match kind {
                    MacroKind::All | MacroKind::Exists | MacroKind::ExistsOne | MacroKind::Filter => {
                        if !step_ty.accepts_bool() {
                            self.no_overload("_&&_", &[&step_ty]);
                        }
                        if *kind == MacroKind::Filter {
                            Ty::List(Box::new(elem))
                        } else {
                            Ty::Bool
                        }
                    }
                    MacroKind::Map => Ty::List(Box::new(step_ty)),
                }
            }
        }
    }

    fn select(&mut self, target: &Ty<'s>, field: &str) -> Ty<'s> {
        match target {
            Ty::Object(schema) => match schema.field(field) {
                FieldLookup::Known(prop) => Ty::of_schema(prop),
                FieldLookup::Dynamic => Ty::Dyn,
                FieldLookup::Undefined => {
                    self.warnings.push(format!("undefined field '{}'", field));
                    Ty::Dyn
                }
            },
            Ty::Map(value) => value.as_ref().clone(),
            Ty::Authorizer if field == "requestResource" => Ty::AccessTarget,
            // Null selection is a runtime error, not a type error.
            Ty::Dyn | Ty::Null => Ty::Dyn,
            other => {
                self.warnings
                    .push(format!("type '{}' does not support field selection", other.name()));
                Ty::Dyn
            }
        }
    }

    fn binary(&mut self, op: BinaryOp, l: &Ty<'s>, r: &Ty<'s>) -> Ty<'s> {
        let either_dyn = l.is_dyn() || r.is_dyn();
        match op {
            BinaryOp::Eq | BinaryOp::Ne => {
                let ok = either_dyn
                    || matches!(l, Ty::Null)
                    || matches!(r, Ty::Null)
                    || (l.is_numeric() && r.is_numeric())
                    || l.same_kind(r);
                if !ok {
                    self.no_overload(op.function_name(), &[l, r]);
                }
                Ty::Bool
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ok = either_dyn
                    || (l.is_numeric() && r.is_numeric())
                    || (matches!(l, Ty::String | Ty::Bool) && l.same_kind(r));
                if !ok {
                    self.no_overload(op.function_name(), &[l, r]);
                }
                Ty::Bool
            }
            BinaryOp::In => {
                if !matches!(r, Ty::List(_) | Ty::Map(_) | Ty::Object(_) | Ty::Dyn) {
                    self.no_overload(op.function_name(), &[l, r]);
                }
                Ty::Bool
            }
            BinaryOp::And | BinaryOp::Or => {
                if !l.accepts_bool() || !r.accepts_bool() {
                    self.no_overload(op.function_name(), &[l, r]);
                }
                Ty::Bool
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
                if either_dyn {
                    return if l.is_dyn() { r.clone() } else { l.clone() };
                }
                let ok = match op {
                    BinaryOp::Add => {
                        (l.is_numeric() || matches!(l, Ty::String | Ty::List(_))) && l.same_kind(r)
                    }
                    BinaryOp::Rem => matches!(l, Ty::Int | Ty::Uint) && l.same_kind(r),
                    _ => l.is_numeric() && l.same_kind(r),
                };
                if ok {
                    l.clone()
                } else {
                    self.no_overload(op.function_name(), &[l, r]);
                    Ty::Dyn
                }
            }
        }
    }

    fn function(&mut self, function: &str, args: &[Ty<'s>]) -> Ty<'s> {
        let refs: Vec<&Ty<'s>> = args.iter().collect();
        match (function, args) {
            ("size", [arg]) => {
                if !matches!(arg, Ty::String | Ty::List(_) | Ty::Map(_) | Ty::Object(_) | Ty::Dyn) {
                    self.no_overload(function, &refs);
                }
                Ty::Int
            }
            ("matches", [a, b]) => {
                if !matches!(a, Ty::String | Ty::Dyn) || !matches!(b, Ty::String | Ty::Dyn) {
                    self.no_overload(function, &refs);
                }
                Ty::Bool
            }
            ("string", [_]) => Ty::String,
            ("int", [_]) => Ty::Int,
            ("uint", [_]) => Ty::Uint,
            ("double", [_]) => Ty::Double,
            ("bool", [_]) => Ty::Bool,
            ("dyn", [_]) => Ty::Dyn,
            _ => {
                self.warnings.push(format!("undeclared reference to '{}'", function));
                Ty::Dyn
            }
        }
    }

    fn method(&mut self, receiver: &Ty<'s>, function: &str, args: &[Ty<'s>]) -> Ty<'s> {
        let string_args = args.iter().all(|a| matches!(a, Ty::String | Ty::Dyn));
        match (receiver, function, args.len()) {
            (Ty::String | Ty::Dyn, "startsWith" | "endsWith" | "contains" | "matches", 1) if string_args => Ty::Bool,
            (Ty::String | Ty::Dyn, "lowerAscii" | "upperAscii", 0) => Ty::String,
            (Ty::String | Ty::List(_) | Ty::Map(_) | Ty::Object(_) | Ty::Dyn, "size", 0) => Ty::Int,
            (Ty::Authorizer, "group" | "path", 1) if string_args => Ty::AccessTarget,
            (Ty::AccessTarget, "resource" | "subresource" | "namespace" | "name", 1) if string_args => {
                Ty::AccessTarget
            }
            (Ty::AccessTarget, "check", 1) if string_args => Ty::Decision,
            (Ty::Decision, "allowed" | "errored", 0) => Ty::Bool,
            (Ty::Decision, "reason" | "error", 0) => Ty::String,
            (Ty::Dyn, _, _) => Ty::Dyn,
            _ => {
                let mut refs: Vec<&Ty<'s>> = vec![receiver];
                refs.extend(args.iter());
                self.no_overload(function, &refs);
                Ty::Dyn
            }
        }
    }
}

fn unify<'s>(tys: &[Ty<'s>]) -> Ty<'s> {
    match tys.split_first() {
        None => Ty::Dyn,
        Some((first, rest)) => {
            if rest.iter().all(|t| t.same_kind(first)) {
                first.clone()
            } else {
                Ty::Dyn
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;
    use std::sync::Arc;

    fn deployment_env() -> TypeEnv {
        let schema = Structural::object(vec![(
            "spec",
            Structural::object(vec![
                ("replicas", Structural::of_type(SchemaType::Integer)),
                ("paused", Structural::of_type(SchemaType::Boolean)),
            ]),
        )])
        .with_object_meta();
        TypeEnv {
            object: Some(Arc::new(schema)),
            params: None,
        }
    }

    fn warnings(source: &str, result: ResultKind) -> Vec<String> {
        check(&parse(source).unwrap(), &deployment_env(), result)
    }

    #[test]
    fn test_well_typed_expressions() {
        for source in [
            "object.spec.replicas < 5",
            "has(object.metadata.labels) && object.metadata.labels.env == 'prod'",
            "params != null && params.maxReplicas > object.spec.replicas",
            "object.metadata.name.startsWith('test-')",
            "request.userInfo.groups.exists(g, g == 'system:masters')",
            "authorizer.group('apps').resource('deployments').check('get').allowed()",
            "object.metadata.labels.all(k, k.size() < 64)",
        ] {
            assert!(warnings(source, ResultKind::Bool).is_empty(), "{}", source);
        }
    }

    #[test]
    fn test_undefined_field() {
        assert_eq!(
            warnings("object.spec.replica > 1", ResultKind::Bool),
            vec!["undefined field 'replica'".to_string()]
        );
    }

    #[test]
    fn test_incompatible_comparison() {
        assert_eq!(
            warnings("object.metadata.name == 1", ResultKind::Bool),
            vec!["found no matching overload for '_==_' applied to '(string, int)'".to_string()]
        );
        assert_eq!(
            warnings("object.spec.replicas + 'x' > 0", ResultKind::Bool)[0],
            "found no matching overload for '_+_' applied to '(int, string)'"
        );
    }

    #[test]
    fn test_wrong_receiver() {
        assert_eq!(
            warnings("object.spec.replicas.startsWith('1')", ResultKind::Bool),
            vec!["found no matching overload for 'startsWith' applied to '(int, string)'".to_string()]
        );
    }

    #[test]
    fn test_result_type() {
        assert_eq!(
            warnings("object.spec.replicas", ResultKind::Bool),
            vec!["expected result type bool but found int".to_string()]
        );
        assert!(warnings("object.metadata.name", ResultKind::String).is_empty());
        assert!(warnings("object.spec.paused ? 'yes' : null", ResultKind::String).is_empty());
    }

    #[test]
    fn test_without_schema_everything_is_dyn() {
        let env = TypeEnv::default();
        let expr = parse("object.anything.goes == 1 && params.x.y").unwrap();
        assert!(check(&expr, &env, ResultKind::Bool).is_empty());
        let expr = parse("nonsense == 1").unwrap();
        assert_eq!(
            check(&expr, &env, ResultKind::Bool),
            vec!["undeclared reference to 'nonsense'".to_string()]
        );
    }
}

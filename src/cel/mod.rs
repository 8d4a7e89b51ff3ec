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

//! Expression engine for admission expressions.
//!
//! Expressions are compiled once per (source, type environment, result
//! kind) and shared through [`ExpressionCache`]. Compilation parses the
//! source and runs an advisory type check; the resulting
//! [`CompiledExpression`] is immutable and may be evaluated concurrently.

pub mod ast;
pub mod authz;
mod checker;
mod eval;
mod parser;
pub mod value;

pub use authz::{
    AccessCheck, AuthorizationDecision, Authorizer, Decision, StaticAuthorizer, StaticRule,
};
pub use eval::{Activation, EvalError, RegexCache};
pub use value::{AuthorizerBinding, Key, Value};

use crate::schema::Structural;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// CompileError is a syntax error with the byte offset it was found at.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compilation failed at offset {offset}: {message}")]
pub struct CompileError {
    pub offset: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// Schemas the variables of an expression are checked against. A missing
/// schema leaves the variable dynamically typed.
#[derive(Debug, Clone, Default)]
pub struct TypeEnv {
    pub object: Option<Arc<Structural>>,
    pub params: Option<Arc<Structural>>,
}

impl TypeEnv {
    pub fn new(object: Option<Arc<Structural>>, params: Option<Arc<Structural>>) -> Self {
        Self { object, params }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.object.as_ref().map(|s| s.fingerprint()).hash(&mut hasher);
        self.params.as_ref().map(|s| s.fingerprint()).hash(&mut hasher);
        hasher.finish()
    }
}

/// Result type an expression is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultKind {
    /// Validations.
    Bool,
    /// Audit annotation values: a string, or null to omit the annotation.
    String,
}

/// A parsed and type-checked expression.
#[derive(Debug)]
pub struct CompiledExpression {
    source: String,
    ast: ast::Expr,
    result: ResultKind,
    warnings: Vec<String>,
    regexes: RegexCache,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn result_kind(&self) -> ResultKind {
        self.result
    }

    /// Type-check findings. Advisory only.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn evaluate(&self, activation: &Activation, abort: Option<&AtomicBool>) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, activation, &self.regexes, abort)
    }
}

/// Parse and type-check `source`.
pub fn compile(source: &str, env: &TypeEnv, result: ResultKind) -> Result<CompiledExpression, CompileError> {
    let ast = parser::parse(source)?;
    let warnings = checker::check(&ast, env, result);
    Ok(CompiledExpression {
        source: source.to_string(),
        ast,
        result,
        warnings,
        regexes: RegexCache::new(),
    })
}

type CacheKey = (String, u64, ResultKind);

/// ExpressionCache memoizes compilation, including failures, keyed by the
/// source text and the type environment fingerprint.
#[derive(Default)]
pub struct ExpressionCache {
    entries: DashMap<CacheKey, Result<Arc<CompiledExpression>, CompileError>>,
    compilations: AtomicU64,
}

impl ExpressionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile(
        &self,
        source: &str,
        env: &TypeEnv,
        result: ResultKind,
    ) -> Result<Arc<CompiledExpression>, CompileError> {
        let key = (source.to_string(), env.fingerprint(), result);
        if let Some(entry) = self.entries.get(&key) {
            return entry.value().clone();
        }
        match self.entries.entry(key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                self.compilations.fetch_add(1, Ordering::Relaxed);
                let compiled = compile(source, env, result).map(Arc::new);
                entry.insert(compiled.clone());
                compiled
            }
        }
    }

    /// Number of compilations performed so far.
    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries whose source is no longer referenced by anything.
    pub fn retain_sources(&self, keep: impl Fn(&str) -> bool) {
        self.entries.retain(|(source, _, _), _| keep(source));
    }
}

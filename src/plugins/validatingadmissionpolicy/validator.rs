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

//! Evaluation of one policy's validations and audit annotations against a
//! bound set of variables.

use crate::admission::{Attributes, GroupVersionResource, StatusReason};
use crate::api::admissionregistration::ValidatingAdmissionPolicy;
use crate::cel::{
    AccessCheck, Activation, Authorizer, AuthorizerBinding, EvalError, ExpressionCache, ResultKind,
    TypeEnv, Value,
};
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Outcome of a single validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pass,
    Fail,
    /// Compile or runtime error. Subject to the policy's failure policy.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    /// Position of the validation in the policy.
    pub index: usize,
    pub outcome: Outcome,
    pub expression: String,
    /// Human readable detail: the declared message, or one synthesized
    /// from the expression.
    pub message: String,
    pub reason: StatusReason,
}

/// Everything one policy evaluation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyEvaluation {
    pub validations: Vec<ValidationResult>,
    /// Audit annotations keyed `<policy>/<key>`, in declaration order.
    pub audit_annotations: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

/// Build the variables visible to expressions for a request.
pub fn activation(
    attributes: &dyn Attributes,
    matched: &GroupVersionResource,
    params: Option<&serde_json::Value>,
    authorizer: Option<&Arc<dyn Authorizer>>,
) -> Activation {
    let json_or_null = |value: Option<&serde_json::Value>| value.map_or(Value::Null, Value::from_json);
    let mut activation = Activation::new()
        .bind("object", json_or_null(attributes.get_object()))
        .bind("oldObject", json_or_null(attributes.get_old_object()))
        .bind("params", json_or_null(params))
        .bind("request", Value::from_json(&request_value(attributes, matched)));

    if let Some(authorizer) = authorizer {
        let resource = attributes.get_resource();
        let request_resource = AccessCheck {
            group: resource.group.clone(),
            version: resource.version.clone(),
            resource: resource.resource.clone(),
            subresource: attributes.get_subresource().to_string(),
            namespace: attributes.get_namespace().to_string(),
            name: attributes.get_name().to_string(),
            ..Default::default()
        };
        activation.insert(
            "authorizer",
            Value::Authorizer(Arc::new(AuthorizerBinding {
                authorizer: Arc::clone(authorizer),
                user: attributes.get_user_info().clone(),
                request_resource,
            })),
        );
    }
    activation
}

fn request_value(attributes: &dyn Attributes, matched: &GroupVersionResource) -> serde_json::Value {
    let kind = attributes.get_kind();
    let resource = attributes.get_resource();
    let user = attributes.get_user_info();
    json!({
        "kind": {"group": kind.group, "version": kind.version, "kind": kind.kind},
        "resource": {"group": matched.group, "version": matched.version, "resource": matched.resource},
        "subResource": attributes.get_subresource(),
        "requestKind": {"group": kind.group, "version": kind.version, "kind": kind.kind},
        "requestResource": {"group": resource.group, "version": resource.version, "resource": resource.resource},
        "requestSubResource": attributes.get_subresource(),
        "name": attributes.get_name(),
        "namespace": attributes.get_namespace(),
        "operation": attributes.get_operation().as_str(),
        "userInfo": {
            "username": user.username,
            "uid": user.uid,
            "groups": user.groups,
            "extra": user.extra,
        },
        "dryRun": attributes.is_dry_run(),
    })
}

/// Evaluate `policy` against `activation`.
///
/// Validations run in declaration order. A validation that does not compile
/// yields an error result and ends the evaluation of later validations.
/// Audit annotations are always evaluated; their failures only produce
/// warnings. Fails only when evaluation is canceled through `abort`.
pub fn evaluate(
    policy: &ValidatingAdmissionPolicy,
    env: &TypeEnv,
    activation: &Activation,
    expressions: &ExpressionCache,
    abort: Option<&AtomicBool>,
) -> Result<PolicyEvaluation, EvalError> {
    let mut out = PolicyEvaluation::default();

    for (index, validation) in policy.spec.validations.iter().enumerate() {
        let source = validation.expression.as_str();
        let reason = validation.reason.unwrap_or(StatusReason::Invalid);
        let declared = |synthesized: String| {
            if validation.message.is_empty() {
                synthesized
            } else {
                validation.message.clone()
            }
        };

        let compiled = match expressions.compile(source, env, ResultKind::Bool) {
            Ok(compiled) => compiled,
            Err(err) => {
                out.validations.push(ValidationResult {
                    index,
                    outcome: Outcome::Error,
                    expression: source.to_string(),
                    message: declared(format!("expression '{}' resulted in error: {}", source, err)),
                    reason,
                });
                break;
            }
        };

        let (outcome, message) = match compiled.evaluate(activation, abort) {
            Ok(Value::Bool(true)) => (Outcome::Pass, String::new()),
            Ok(Value::Bool(false)) => (Outcome::Fail, declared(format!("failed expression: {}", source))),
            Ok(other) => (
                Outcome::Error,
                declared(format!(
                    "expression '{}' resulted in error: validation expression must evaluate to bool, got {}",
                    source,
                    other.type_name()
                )),
            ),
            Err(EvalError::Canceled) => return Err(EvalError::Canceled),
            Err(err) => (
                Outcome::Error,
                declared(format!("expression '{}' resulted in error: {}", source, err)),
            ),
        };
        out.validations.push(ValidationResult {
            index,
            outcome,
            expression: source.to_string(),
            message,
            reason,
        });
    }

    for annotation in &policy.spec.audit_annotations {
        let source = annotation.value_expression.as_str();
        let failed = |err: String| {
            format!(
                "failed to evaluate audit annotation '{}' of ValidatingAdmissionPolicy '{}': {}",
                annotation.key,
                policy.name(),
                err
            )
        };
        let compiled = match expressions.compile(source, env, ResultKind::String) {
            Ok(compiled) => compiled,
            Err(err) => {
                out.warnings.push(failed(err.to_string()));
                continue;
            }
        };
        match compiled.evaluate(activation, abort) {
            Ok(Value::String(value)) => out
                .audit_annotations
                .push((format!("{}/{}", policy.name(), annotation.key), value.to_string())),
            Ok(Value::Null) => {}
            Ok(other) => out.warnings.push(failed(format!(
                "valueExpression must evaluate to a string or null, got {}",
                other.type_name()
            ))),
            Err(EvalError::Canceled) => return Err(EvalError::Canceled),
            Err(err) => out.warnings.push(failed(err.to_string())),
        }
    }

    Ok(out)
}

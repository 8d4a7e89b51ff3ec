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

//! Decision aggregation across every (policy, binding) pair matching a request.
//!
//! Pairs are evaluated in a stable order. Within a pair each parameter value
//! is evaluated in turn and every violation is surfaced through all of the
//! binding's validation actions. The first pair that denies ends the
//! evaluation; effects collected up to that point are kept.

use super::matching::{self, MatchError, Matcher};
use super::params::ParamResolver;
use super::validator::{self, Outcome, PolicyEvaluation, ValidationResult};
use super::Collaborators;
use crate::admission::{
    AdmissionError, AdmissionResponse, AdmissionResult, Attributes, GroupVersionResource,
    StatusReason,
};
use crate::api::admissionregistration::{
    FailurePolicy, ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding, ValidationAction,
};
use crate::api::meta;
use crate::cel::{Authorizer, EvalError, ExpressionCache, TypeEnv};
use crate::config::EngineConfig;
use crate::plugins::policytemplate::behavior;
use crate::schema::SchemaResolver;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// How a bound policy produces its validation results.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluator {
    /// The policy's expressions, with params resolved from the binding's paramRef.
    Expressions,
    /// The policy's expressions with a fixed `params` object.
    InlineParams(Arc<Value>),
    /// Every `{key: value}` must be present on the object's labels.
    RequiredLabels(BTreeMap<String, String>),
}

/// BoundPolicy is a policy joined with one of its bindings.
#[derive(Debug, Clone)]
pub struct BoundPolicy {
    pub policy: Arc<ValidatingAdmissionPolicy>,
    pub binding: Arc<ValidatingAdmissionPolicyBinding>,
    pub evaluator: Evaluator,
}

impl BoundPolicy {
    pub fn new(
        policy: Arc<ValidatingAdmissionPolicy>,
        binding: Arc<ValidatingAdmissionPolicyBinding>,
        evaluator: Evaluator,
    ) -> Self {
        Self {
            policy,
            binding,
            evaluator,
        }
    }
}

/// PolicySource enumerates bound policies in a stable order.
pub trait PolicySource: Send + Sync {
    fn bound_policies(&self) -> Vec<Arc<BoundPolicy>>;

    /// True once the initial state has been loaded.
    fn has_synced(&self) -> bool;
}

/// A bound policy that applies to a request, with the resource it matched through.
#[derive(Debug, Clone)]
pub struct PolicyMatch {
    pub bound: Arc<BoundPolicy>,
    pub resource: GroupVersionResource,
    /// Set when matching could not be decided; handled by the failure policy.
    pub unresolved: Option<MatchError>,
}

impl PolicyMatch {
    fn unresolved(bound: Arc<BoundPolicy>, attributes: &dyn Attributes, err: MatchError) -> Self {
        Self {
            bound,
            resource: attributes.get_resource().clone(),
            unresolved: Some(err),
        }
    }
}

/// One validation result attributed to the pair that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEntry {
    pub policy: String,
    pub binding: String,
    pub result: ValidationResult,
}

/// The first Deny reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub policy: String,
    pub binding: String,
    pub message: String,
    pub reason: StatusReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    AllowWithWarnings,
    Deny,
}

/// Decision is the aggregated outcome of one admission request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub results: Vec<DecisionEntry>,
    pub denial: Option<Denial>,
    pub warnings: Vec<String>,
    pub audit_annotations: BTreeMap<String, String>,
}

impl Decision {
    pub fn verdict(&self) -> Verdict {
        if self.denial.is_some() {
            Verdict::Deny
        } else if !self.warnings.is_empty() {
            Verdict::AllowWithWarnings
        } else {
            Verdict::Allow
        }
    }

    /// The error a denied request is rejected with.
    pub fn to_error(&self, attributes: &dyn Attributes) -> Option<AdmissionError> {
        self.denial.as_ref().map(|denial| {
            AdmissionError::forbidden(
                attributes.get_name(),
                attributes.get_resource().group_resource().to_string(),
                denial.reason,
                denial.message.clone(),
            )
        })
    }

    pub fn to_response(&self, uid: &str, attributes: &dyn Attributes) -> AdmissionResponse {
        let response = match self.to_error(attributes) {
            Some(err) => AdmissionResponse::from_error(uid, &err),
            None => AdmissionResponse::allowed(uid),
        };
        response
            .with_warnings(self.warnings.clone())
            .with_audit_annotations(self.audit_annotations.clone())
    }
}

/// Entry of the Audit action's annotation value.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidationFailure {
    message: String,
    policy: String,
    binding: String,
    expression_index: usize,
    validation_actions: Vec<ValidationAction>,
}

pub fn deny_message(policy: &str, binding: &str, detail: &str) -> String {
    format!(
        "ValidatingAdmissionPolicy '{}' with binding '{}' denied request: {}",
        policy, binding, detail
    )
}

pub fn warn_message(policy: &str, binding: &str, detail: &str) -> String {
    format!(
        "Validation failed for ValidatingAdmissionPolicy '{}' with binding '{}': {}",
        policy, binding, detail
    )
}

/// Dispatcher resolves matching pairs and reduces them to a decision.
pub struct Dispatcher {
    matcher: Matcher,
    params: ParamResolver,
    schemas: Arc<dyn SchemaResolver>,
    expressions: Arc<ExpressionCache>,
    authorizer: Option<Arc<dyn Authorizer>>,
    failure_key: String,
}

impl Dispatcher {
    pub fn new(collaborators: &Collaborators, config: &EngineConfig) -> Self {
        Self {
            matcher: Matcher::new(collaborators.cache.clone(), collaborators.mapper.clone()),
            params: ParamResolver::new(collaborators.cache.clone(), collaborators.mapper.clone()),
            schemas: collaborators.schemas.clone(),
            expressions: collaborators.expressions.clone(),
            authorizer: collaborators.authorizer.clone(),
            failure_key: config.validation_failure_key(),
        }
    }

    /// Bound policies from `sources` that apply to the request, in source order.
    pub fn resolve(&self, sources: &[Arc<dyn PolicySource>], attributes: &dyn Attributes) -> Vec<PolicyMatch> {
        if matching::is_exempt(attributes.get_resource()) {
            return Vec::new();
        }
        let mut matches = Vec::new();
        for source in sources {
            for bound in source.bound_policies() {
                let constraints = match &bound.policy.spec.match_constraints {
                    Some(constraints) => constraints,
                    None => continue,
                };
                let resource = match self.matcher.matches(constraints, attributes) {
                    Ok(Some(resource)) => resource,
                    Ok(None) => continue,
                    Err(err) => {
                        matches.push(PolicyMatch::unresolved(bound, attributes, err));
                        continue;
                    }
                };
                if let Some(overrides) = &bound.binding.spec.match_resources {
                    match self.matcher.matches(overrides, attributes) {
                        Ok(Some(_)) => {}
                        Ok(None) => continue,
                        Err(err) => {
                            matches.push(PolicyMatch::unresolved(bound, attributes, err));
                            continue;
                        }
                    }
                }
                matches.push(PolicyMatch {
                    bound,
                    resource,
                    unresolved: None,
                });
            }
        }
        matches
    }

    /// Evaluate `matches` against the request.
    pub fn decide(
        &self,
        matches: &[PolicyMatch],
        attributes: &dyn Attributes,
        abort: Option<&AtomicBool>,
    ) -> AdmissionResult<Decision> {
        let mut decision = Decision::default();
        let mut failures = Vec::new();

        for matched in matches {
            if abort.map_or(false, |flag| flag.load(Ordering::SeqCst)) {
                return Err(canceled());
            }
            let bound = &matched.bound;
            let policy = bound.policy.as_ref();
            let binding = bound.binding.as_ref();

            let evaluations = match self.evaluate(matched, attributes, abort) {
                Ok(Some(evaluations)) => evaluations,
                Ok(None) => continue,
                Err(EvalError::Canceled) => return Err(canceled()),
                Err(err) => return Err(AdmissionError::internal_error(err.to_string())),
            };

            for evaluation in evaluations {
                decision.warnings.extend(evaluation.warnings);
                decision.audit_annotations.extend(evaluation.audit_annotations);
                for result in evaluation.validations {
                    let violation = match result.outcome {
                        Outcome::Pass => false,
                        Outcome::Fail => true,
                        Outcome::Error => policy.failure_policy() == FailurePolicy::Fail,
                    };
                    if result.outcome == Outcome::Error && !violation {
                        debug!(
                            policy = policy.name(),
                            binding = binding.name(),
                            expression = %result.expression,
                            "ignoring evaluation error"
                        );
                    }
                    if violation {
                        self.apply_actions(&mut decision, &mut failures, policy, binding, &result);
                    }
                    decision.results.push(DecisionEntry {
                        policy: policy.name().to_string(),
                        binding: binding.name().to_string(),
                        result,
                    });
                }
            }

            if decision.denial.is_some() {
                break;
            }
        }

        if !failures.is_empty() {
            let value = serde_json::to_string(&failures)
                .map_err(|e| AdmissionError::internal_error(format!("encoding audit annotation: {}", e)))?;
            decision.audit_annotations.insert(self.failure_key.clone(), value);
        }
        Ok(decision)
    }

    fn apply_actions(
        &self,
        decision: &mut Decision,
        failures: &mut Vec<ValidationFailure>,
        policy: &ValidatingAdmissionPolicy,
        binding: &ValidatingAdmissionPolicyBinding,
        result: &ValidationResult,
    ) {
        for action in &binding.spec.validation_actions {
            match action {
                ValidationAction::Deny => {
                    if decision.denial.is_none() {
                        decision.denial = Some(Denial {
                            policy: policy.name().to_string(),
                            binding: binding.name().to_string(),
                            message: deny_message(policy.name(), binding.name(), &result.message),
                            reason: result.reason,
                        });
                    }
                }
                ValidationAction::Warn => decision
                    .warnings
                    .push(warn_message(policy.name(), binding.name(), &result.message)),
                ValidationAction::Audit => failures.push(ValidationFailure {
                    message: result.message.clone(),
                    policy: policy.name().to_string(),
                    binding: binding.name().to_string(),
                    expression_index: result.index,
                    validation_actions: binding.spec.validation_actions.clone(),
                }),
            }
        }
    }

    /// Evaluations of one pair, one per parameter value. None when the
    /// binding is invalid for this request.
    fn evaluate(
        &self,
        matched: &PolicyMatch,
        attributes: &dyn Attributes,
        abort: Option<&AtomicBool>,
    ) -> Result<Option<Vec<PolicyEvaluation>>, EvalError> {
        let bound = &matched.bound;
        let policy = bound.policy.as_ref();

        if let Some(err) = &matched.unresolved {
            return Ok(Some(vec![PolicyEvaluation {
                validations: vec![ValidationResult {
                    index: 0,
                    outcome: Outcome::Error,
                    expression: String::new(),
                    message: format!("failed to match request: {}", err),
                    reason: StatusReason::Invalid,
                }],
                ..Default::default()
            }]));
        }

        let params: Vec<Option<Arc<Value>>> = match &bound.evaluator {
            Evaluator::RequiredLabels(required) => {
                return Ok(Some(vec![PolicyEvaluation {
                    validations: required_labels(required, attributes),
                    ..Default::default()
                }]));
            }
            Evaluator::InlineParams(params) => vec![Some(params.clone())],
            Evaluator::Expressions => {
                match self.params.resolve(
                    policy.spec.param_kind.as_ref(),
                    bound.binding.spec.param_ref.as_ref(),
                    attributes.get_namespace(),
                ) {
                    Ok(resolved) => resolved.values(),
                    Err(err) => {
                        debug!(
                            policy = policy.name(),
                            binding = bound.binding.name(),
                            error = %err,
                            "binding has no usable params, skipping"
                        );
                        return Ok(None);
                    }
                }
            }
        };

        let param_schema = policy
            .spec
            .param_kind
            .as_ref()
            .and_then(|kind| self.schemas.resolve(&kind.gvk()).ok());
        let env = TypeEnv::new(None, param_schema);

        let mut out = Vec::with_capacity(params.len());
        for params in params {
            let activation = validator::activation(
                attributes,
                &matched.resource,
                params.as_deref(),
                self.authorizer.as_ref(),
            );
            out.push(validator::evaluate(policy, &env, &activation, &self.expressions, abort)?);
        }
        Ok(Some(out))
    }
}

fn canceled() -> AdmissionError {
    AdmissionError::canceled("admission decision canceled before completion")
}

fn required_labels(required: &BTreeMap<String, String>, attributes: &dyn Attributes) -> Vec<ValidationResult> {
    let labels = attributes
        .get_object()
        .or_else(|| attributes.get_old_object())
        .map(meta::object_labels)
        .unwrap_or_default();
    let (outcome, message) = match behavior::required_labels(required, &labels).map(|err| err.error_json()) {
        Some(Ok(report)) => (Outcome::Fail, report),
        Some(Err(err)) => (Outcome::Error, format!("failed to encode violations: {}", err)),
        None => (Outcome::Pass, String::new()),
    };
    vec![ValidationResult {
        index: 0,
        outcome,
        expression: String::new(),
        message,
        reason: StatusReason::Invalid,
    }]
}

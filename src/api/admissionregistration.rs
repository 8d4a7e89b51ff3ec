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

//! ValidatingAdmissionPolicy and ValidatingAdmissionPolicyBinding API types.

use super::meta::{LabelSelector, ObjectMeta};
use crate::admission::errors::{field_invalid, field_required, StatusReason};
use crate::admission::{AdmissionError, AdmissionResult, GroupVersionKind, GroupVersionResource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// API group served by this engine.
pub const GROUP_NAME: &str = "admissionregistration.polyfill.sigs.k8s.io";
/// Upstream API group whose policy objects are also exempt from matching.
pub const UPSTREAM_GROUP_NAME: &str = "admissionregistration.k8s.io";
pub const VERSION: &str = "v1alpha1";

pub const POLICY_KIND: &str = "ValidatingAdmissionPolicy";
pub const POLICY_RESOURCE: &str = "validatingadmissionpolicies";
pub const BINDING_KIND: &str = "ValidatingAdmissionPolicyBinding";
pub const BINDING_RESOURCE: &str = "validatingadmissionpolicybindings";

pub fn policy_gvr() -> GroupVersionResource {
    GroupVersionResource::new(GROUP_NAME, VERSION, POLICY_RESOURCE)
}

pub fn binding_gvr() -> GroupVersionResource {
    GroupVersionResource::new(GROUP_NAME, VERSION, BINDING_RESOURCE)
}

// ============================================================================
// Enums
// ============================================================================

/// FailurePolicy defines how to handle failures for the admission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Fail means that an error calling the policy causes the admission to fail.
    #[default]
    Fail,
    /// Ignore means that an error calling the policy is ignored.
    Ignore,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::Fail => "Fail",
            FailurePolicy::Ignore => "Ignore",
        }
    }
}

/// MatchPolicy defines how the match rules are used to match incoming requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Exact means requests should only match rules naming their exact group/version.
    Exact,
    /// Equivalent means requests also match rules naming an equivalent resource.
    #[default]
    Equivalent,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Exact => "Exact",
            MatchPolicy::Equivalent => "Equivalent",
        }
    }
}

/// ValidationAction specifies how a validation failure is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationAction {
    /// Deny rejects the request.
    Deny,
    /// Warn returns the failure to the client as a warning.
    Warn,
    /// Audit records the failure in the audit event.
    Audit,
}

impl ValidationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationAction::Deny => "Deny",
            ValidationAction::Warn => "Warn",
            ValidationAction::Audit => "Audit",
        }
    }
}

/// ScopeType restricts a rule to cluster-scoped or namespaced resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScopeType {
    Cluster,
    Namespaced,
    #[default]
    #[serde(rename = "*")]
    All,
}

// ============================================================================
// Match Types
// ============================================================================

/// NamedRuleWithOperations is a rule over operations and resources, optionally
/// restricted to a list of object names.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRuleWithOperations {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub operations: Vec<String>,
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub api_versions: Vec<String>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeType>,
}

impl NamedRuleWithOperations {
    /// Build a rule from string slices.
    pub fn new(groups: &[&str], versions: &[&str], resources: &[&str], operations: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            resource_names: Vec::new(),
            operations: owned(operations),
            api_groups: owned(groups),
            api_versions: owned(versions),
            resources: owned(resources),
            scope: None,
        }
    }

    pub fn with_resource_names(mut self, names: &[&str]) -> Self {
        self.resource_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_scope(mut self, scope: ScopeType) -> Self {
        self.scope = Some(scope);
        self
    }
}

/// MatchResources decides whether to run the admission control policy on an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,
    #[serde(default)]
    pub resource_rules: Vec<NamedRuleWithOperations>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_resource_rules: Vec<NamedRuleWithOperations>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_policy: Option<MatchPolicy>,
}

impl MatchResources {
    pub fn with_rules(rules: Vec<NamedRuleWithOperations>) -> Self {
        Self {
            resource_rules: rules,
            ..Default::default()
        }
    }

    pub fn effective_match_policy(&self) -> MatchPolicy {
        self.match_policy.unwrap_or_default()
    }
}

// ============================================================================
// Policy
// ============================================================================

/// ParamKind is the group/version/kind of the parameter resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamKind {
    pub api_version: String,
    pub kind: String,
}

impl ParamKind {
    pub fn new(api_version: &str, kind: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::from_api_version(&self.api_version, &self.kind)
    }
}

/// Validation is a single expression that must hold for an admitted object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validation {
    pub expression: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<StatusReason>,
}

impl Validation {
    pub fn new(expression: &str) -> Self {
        Self {
            expression: expression.to_string(),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn with_reason(mut self, reason: StatusReason) -> Self {
        self.reason = Some(reason);
        self
    }
}

/// AuditAnnotation describes an expression producing an audit annotation value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditAnnotation {
    pub key: String,
    pub value_expression: String,
}

/// ValidatingAdmissionPolicySpec is the specification of the desired behavior of the policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatingAdmissionPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_kind: Option<ParamKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_constraints: Option<MatchResources>,
    #[serde(default)]
    pub validations: Vec<Validation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audit_annotations: Vec<AuditAnnotation>,
}

/// ExpressionWarning is a type-checking warning for one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionWarning {
    pub field_ref: String,
    pub warning: String,
}

/// TypeChecking holds the results of type checking the policy's expressions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeChecking {
    #[serde(default)]
    pub expression_warnings: Vec<ExpressionWarning>,
}

/// ValidatingAdmissionPolicyStatus is the advisory status published for a policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatingAdmissionPolicyStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_checking: Option<TypeChecking>,
}

/// ValidatingAdmissionPolicy describes the definition of an admission validation policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidatingAdmissionPolicy {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ValidatingAdmissionPolicySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ValidatingAdmissionPolicyStatus>,
}

impl ValidatingAdmissionPolicy {
    pub fn new(name: &str, spec: ValidatingAdmissionPolicySpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.spec.failure_policy.unwrap_or_default()
    }

    /// Decode a policy from its JSON representation.
    pub fn from_value(value: &Value) -> AdmissionResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| AdmissionError::bad_request(format!("decoding {}: {}", POLICY_KIND, e)))
    }

    pub fn to_value(&self) -> AdmissionResult<Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| AdmissionError::internal_error(format!("encoding {}: {}", POLICY_KIND, e)))?;
        set_type_meta(&mut value, POLICY_KIND);
        Ok(value)
    }

    /// Validate the structural rules of a policy object.
    pub fn validate(&self) -> AdmissionResult<()> {
        let mut errors = Vec::new();
        if self.metadata.name.is_empty() {
            errors.push(field_required("metadata.name", ""));
        }
        if let Some(param_kind) = &self.spec.param_kind {
            if param_kind.api_version.is_empty() {
                errors.push(field_required("spec.paramKind.apiVersion", ""));
            }
            if param_kind.kind.is_empty() {
                errors.push(field_required("spec.paramKind.kind", ""));
            }
        }
        if self.spec.validations.is_empty() && self.spec.audit_annotations.is_empty() {
            errors.push(field_required(
                "spec.validations",
                "validations or auditAnnotations must contain at least one item",
            ));
        }
        for (i, validation) in self.spec.validations.iter().enumerate() {
            if validation.expression.trim().is_empty() {
                errors.push(field_required(&format!("spec.validations[{}].expression", i), ""));
            }
        }
        let mut keys = HashSet::new();
        for (i, annotation) in self.spec.audit_annotations.iter().enumerate() {
            let field = format!("spec.auditAnnotations[{}].key", i);
            if annotation.key.is_empty() {
                errors.push(field_required(&field, ""));
            } else if annotation.key.contains('/') {
                errors.push(field_invalid(&field, &annotation.key, "must not contain '/'"));
            } else if !keys.insert(annotation.key.as_str()) {
                errors.push(field_invalid(&field, &annotation.key, "duplicate key"));
            }
            if annotation.value_expression.trim().is_empty() {
                errors.push(field_required(
                    &format!("spec.auditAnnotations[{}].valueExpression", i),
                    "",
                ));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::invalid(POLICY_KIND, &self.metadata.name, errors))
        }
    }
}

// ============================================================================
// Binding
// ============================================================================

/// ParamRef references the parameter resource of a binding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

impl ParamRef {
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            selector: None,
        }
    }

    pub fn selected(namespace: &str, selector: LabelSelector) -> Self {
        Self {
            name: String::new(),
            namespace: namespace.to_string(),
            selector: Some(selector),
        }
    }
}

/// ValidatingAdmissionPolicyBindingSpec is the specification of the binding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatingAdmissionPolicyBindingSpec {
    pub policy_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_ref: Option<ParamRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_resources: Option<MatchResources>,
    #[serde(default)]
    pub validation_actions: Vec<ValidationAction>,
}

/// ValidatingAdmissionPolicyBinding binds a policy to parameters and actions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidatingAdmissionPolicyBinding {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ValidatingAdmissionPolicyBindingSpec,
}

impl ValidatingAdmissionPolicyBinding {
    pub fn new(name: &str, policy_name: &str, actions: &[ValidationAction]) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            spec: ValidatingAdmissionPolicyBindingSpec {
                policy_name: policy_name.to_string(),
                param_ref: None,
                match_resources: None,
                validation_actions: actions.to_vec(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn has_action(&self, action: ValidationAction) -> bool {
        self.spec.validation_actions.contains(&action)
    }

    pub fn from_value(value: &Value) -> AdmissionResult<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| AdmissionError::bad_request(format!("decoding {}: {}", BINDING_KIND, e)))
    }

    pub fn to_value(&self) -> AdmissionResult<Value> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| AdmissionError::internal_error(format!("encoding {}: {}", BINDING_KIND, e)))?;
        set_type_meta(&mut value, BINDING_KIND);
        Ok(value)
    }

    /// Validate the structural rules of a binding object.
    pub fn validate(&self) -> AdmissionResult<()> {
        let mut errors = Vec::new();
        if self.spec.policy_name.is_empty() {
            errors.push(field_required("spec.policyName", ""));
        }
        let actions = &self.spec.validation_actions;
        if actions.is_empty() {
            errors.push(field_required("spec.validationActions", ""));
        }
        let mut seen = HashSet::new();
        for (i, action) in actions.iter().enumerate() {
            if !seen.insert(*action) {
                errors.push(field_invalid(
                    &format!("spec.validationActions[{}]", i),
                    action.as_str(),
                    "duplicate action",
                ));
            }
        }
        if seen.contains(&ValidationAction::Deny) && seen.contains(&ValidationAction::Warn) {
            errors.push(field_invalid(
                "spec.validationActions",
                "Deny, Warn",
                "must not contain both Deny and Warn (repeating the same validation failure information in the API response and headers serves no purpose)",
            ));
        }
        if let Some(param_ref) = &self.spec.param_ref {
            match (param_ref.name.is_empty(), param_ref.selector.is_some()) {
                (false, true) => errors.push(field_invalid(
                    "spec.paramRef",
                    &param_ref.name,
                    "name and selector are mutually exclusive",
                )),
                (true, false) => errors.push(field_required(
                    "spec.paramRef",
                    "one of name or selector must be specified",
                )),
                _ => {}
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::invalid(BINDING_KIND, &self.metadata.name, errors))
        }
    }
}

fn set_type_meta(value: &mut Value, kind: &str) {
    if let Value::Object(map) = value {
        map.insert(
            "apiVersion".to_string(),
            Value::String(format!("{}/{}", GROUP_NAME, VERSION)),
        );
        map.insert("kind".to_string(), Value::String(kind.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_decodes_from_json() {
        let policy = ValidatingAdmissionPolicy::from_value(&json!({
            "apiVersion": "admissionregistration.polyfill.sigs.k8s.io/v1alpha1",
            "kind": "ValidatingAdmissionPolicy",
            "metadata": {"name": "validate-xyz.example.com"},
            "spec": {
                "paramKind": {"apiVersion": "v1", "kind": "ConfigMap"},
                "matchConstraints": {
                    "resourceRules": [{
                        "operations": ["CREATE"],
                        "apiGroups": [""],
                        "apiVersions": ["v1"],
                        "resources": ["namespaces"]
                    }]
                },
                "validations": [
                    {"expression": "object.metadata.name.endsWith('k8s')", "reason": "Forbidden"}
                ],
                "auditAnnotations": [
                    {"key": "example-key", "valueExpression": "'x'"}
                ]
            }
        }))
        .unwrap();

        assert_eq!(policy.name(), "validate-xyz.example.com");
        assert_eq!(policy.failure_policy(), FailurePolicy::Fail);
        assert_eq!(policy.spec.param_kind.as_ref().unwrap().gvk().kind, "ConfigMap");
        assert_eq!(policy.spec.validations[0].reason, Some(StatusReason::Forbidden));
        let constraints = policy.spec.match_constraints.as_ref().unwrap();
        assert_eq!(constraints.effective_match_policy(), MatchPolicy::Equivalent);
        assert!(policy.validate().is_ok());

        let encoded = policy.to_value().unwrap();
        assert_eq!(encoded["kind"], "ValidatingAdmissionPolicy");
        assert_eq!(encoded["spec"]["auditAnnotations"][0]["valueExpression"], "'x'");
    }

    #[test]
    fn test_policy_validation_errors() {
        let mut policy = ValidatingAdmissionPolicy::new("p", ValidatingAdmissionPolicySpec::default());
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("spec.validations"));

        policy.spec.audit_annotations = vec![
            AuditAnnotation {
                key: "k".to_string(),
                value_expression: "'a'".to_string(),
            },
            AuditAnnotation {
                key: "k".to_string(),
                value_expression: "'b'".to_string(),
            },
        ];
        let err = policy.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[test]
    fn test_binding_rejects_deny_and_warn() {
        let binding = ValidatingAdmissionPolicyBinding::new(
            "b",
            "p",
            &[ValidationAction::Deny, ValidationAction::Warn],
        );
        let err = binding.validate().unwrap_err();
        assert!(err.to_string().contains("must not contain both Deny and Warn"));

        let ok = ValidatingAdmissionPolicyBinding::new(
            "b",
            "p",
            &[ValidationAction::Warn, ValidationAction::Audit],
        );
        assert!(ok.validate().is_ok());
        assert!(ok.has_action(ValidationAction::Audit));
    }

    #[test]
    fn test_binding_requires_actions_and_param_ref_target() {
        let mut binding = ValidatingAdmissionPolicyBinding::new("b", "p", &[]);
        binding.spec.param_ref = Some(ParamRef::default());
        let msg = binding.validate().unwrap_err().to_string();
        assert!(msg.contains("spec.validationActions: Required value"));
        assert!(msg.contains("one of name or selector"));
    }

    #[test]
    fn test_scope_wire_names() {
        let rule: NamedRuleWithOperations = serde_json::from_value(json!({
            "operations": ["*"],
            "apiGroups": ["*"],
            "apiVersions": ["*"],
            "resources": ["*"],
            "scope": "*"
        }))
        .unwrap();
        assert_eq!(rule.scope, Some(ScopeType::All));
        let namespaced: ScopeType = serde_json::from_value(json!("Namespaced")).unwrap();
        assert_eq!(namespaced, ScopeType::Namespaced);
    }
}

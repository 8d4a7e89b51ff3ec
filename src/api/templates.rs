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

//! PolicyTemplate API types and the shape of template instances.

use super::admissionregistration::{FailurePolicy, MatchResources, Validation, ValidationAction};
use super::meta::ObjectMeta;
use crate::admission::{GroupVersionKind, GroupVersionResource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const GROUP_NAME: &str = "celadmissionpolyfill.k8s.io";
pub const VERSION: &str = "v0alpha2";
pub const TEMPLATE_KIND: &str = "PolicyTemplate";
pub const TEMPLATE_RESOURCE: &str = "policytemplates";

pub fn template_gvr() -> GroupVersionResource {
    GroupVersionResource::new(GROUP_NAME, VERSION, TEMPLATE_RESOURCE)
}

fn default_version() -> String {
    "v1".to_string()
}

/// Names of the kind generated for a template's instances.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateNames {
    pub kind: String,
    pub plural: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub singular: String,
}

/// InstanceScope is the scope of the generated instance kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstanceScope {
    #[default]
    Namespaced,
    Cluster,
}

impl InstanceScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceScope::Namespaced => "Namespaced",
            InstanceScope::Cluster => "Cluster",
        }
    }
}

/// TemplateBehavior is the enforcement logic carried by every instance of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TemplateBehavior {
    /// Objects must carry every label in the instance's `requiredLabels`
    /// map with exactly the declared value.
    RequiredLabels,
    /// Expression validations evaluated with the instance bound as `params`.
    #[serde(rename_all = "camelCase")]
    Validations {
        validations: Vec<Validation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_policy: Option<FailurePolicy>,
    },
}

impl TemplateBehavior {
    pub fn name(&self) -> &'static str {
        match self {
            TemplateBehavior::RequiredLabels => "RequiredLabels",
            TemplateBehavior::Validations { .. } => "Validations",
        }
    }
}

/// PolicyTemplateSpec declares the generated kind and the per-instance logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplateSpec {
    pub group: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub names: TemplateNames,
    #[serde(default)]
    pub scope: InstanceScope,
    /// OpenAPI v3 schema of the instance `spec.parameters` field.
    #[serde(default)]
    pub schema: Value,
    pub behavior: TemplateBehavior,
}

/// TemplatePhase is the lifecycle state of a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemplatePhase {
    #[default]
    Pending,
    Active,
    Removed,
}

impl fmt::Display for TemplatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TemplatePhase::Pending => "Pending",
            TemplatePhase::Active => "Active",
            TemplatePhase::Removed => "Removed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplateStatus {
    #[serde(default)]
    pub phase: TemplatePhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
}

/// PolicyTemplate is a reusable, parameterized policy definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PolicyTemplateSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PolicyTemplateStatus>,
}

impl PolicyTemplate {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Kind of the instances created from this template.
    pub fn instance_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::new(&self.spec.group, &self.spec.version, &self.spec.names.kind)
    }

    pub fn instance_gvr(&self) -> GroupVersionResource {
        GroupVersionResource::new(&self.spec.group, &self.spec.version, &self.spec.names.plural)
    }

    /// Name of the generated CustomResourceDefinition.
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.spec.names.plural, self.spec.group)
    }
}

/// InstanceSpec is the common shape of every template instance's spec.
/// Template-specific configuration sits beside the common fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub match_resources: MatchResources,
    #[serde(default = "default_actions")]
    pub validation_actions: Vec<ValidationAction>,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

fn default_actions() -> Vec<ValidationAction> {
    vec![ValidationAction::Deny]
}

/// TemplateInstance is a custom resource of a template's generated kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInstance {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: InstanceSpec,
}

impl TemplateInstance {
    /// Reads `spec.requiredLabels` as a string map. Non-string values are skipped.
    pub fn required_labels(&self) -> BTreeMap<String, String> {
        self.spec
            .parameters
            .get("requiredLabels")
            .and_then(Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn required_labels_template() -> Value {
        json!({
            "apiVersion": "celadmissionpolyfill.k8s.io/v0alpha2",
            "kind": "PolicyTemplate",
            "metadata": {"name": "requiredlabels"},
            "spec": {
                "group": "policy.acme.co",
                "names": {"kind": "RequiredLabels", "plural": "requiredlabels"},
                "schema": {
                    "type": "object",
                    "properties": {
                        "requiredLabels": {
                            "type": "object",
                            "additionalProperties": {"type": "string"}
                        }
                    }
                },
                "behavior": {"type": "RequiredLabels"}
            }
        })
    }

    #[test]
    fn test_template_decoding_and_names() {
        let template: PolicyTemplate = serde_json::from_value(required_labels_template()).unwrap();
        assert_eq!(template.spec.version, "v1");
        assert_eq!(template.spec.scope, InstanceScope::Namespaced);
        assert_eq!(template.crd_name(), "requiredlabels.policy.acme.co");
        assert_eq!(
            template.instance_gvr(),
            GroupVersionResource::new("policy.acme.co", "v1", "requiredlabels")
        );
        assert_eq!(template.spec.behavior, TemplateBehavior::RequiredLabels);
    }

    #[test]
    fn test_validations_behavior_decoding() {
        let behavior: TemplateBehavior = serde_json::from_value(json!({
            "type": "Validations",
            "validations": [{"expression": "object.metadata.name != params.spec.forbiddenName"}],
            "failurePolicy": "Ignore"
        }))
        .unwrap();
        match behavior {
            TemplateBehavior::Validations {
                validations,
                failure_policy,
            } => {
                assert_eq!(validations.len(), 1);
                assert_eq!(failure_policy, Some(FailurePolicy::Ignore));
            }
            other => panic!("unexpected behavior {:?}", other),
        }
    }

    #[test]
    fn test_instance_required_labels() {
        let instance: TemplateInstance = serde_json::from_value(json!({
            "apiVersion": "policy.acme.co/v1",
            "kind": "RequiredLabels",
            "metadata": {"name": "prod-ssh", "namespace": "default"},
            "spec": {
                "matchResources": {
                    "resourceRules": [{
                        "apiGroups": ["stable.example.com"],
                        "apiVersions": ["v1"],
                        "resources": ["basicunions"],
                        "operations": ["*"]
                    }]
                },
                "requiredLabels": {"ssh": "enabled", "env": "prod", "count": 1}
            }
        }))
        .unwrap();
        assert_eq!(instance.spec.validation_actions, vec![ValidationAction::Deny]);
        let labels = instance.required_labels();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["ssh"], "enabled");
        assert_eq!(labels["env"], "prod");
    }
}

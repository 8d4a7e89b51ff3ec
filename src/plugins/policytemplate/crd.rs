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

//! CustomResourceDefinitions generated for template instance kinds.

use super::TemplateError;
use crate::api::apiextensions::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion, CustomResourceValidation,
};
use crate::api::templates::{PolicyTemplate, TemplateBehavior};
use dashmap::DashMap;
use serde_json::{json, Map, Value};

/// CrdClient installs and removes generated CRDs.
pub trait CrdClient: Send + Sync {
    /// Create or replace a CRD.
    fn apply(&self, crd: CustomResourceDefinition) -> Result<(), TemplateError>;

    /// Delete a CRD. Returns false when it did not exist.
    fn delete(&self, name: &str) -> Result<bool, TemplateError>;

    fn get(&self, name: &str) -> Option<CustomResourceDefinition>;
}

/// Records applied CRDs in memory.
#[derive(Default)]
pub struct InMemoryCrdClient {
    crds: DashMap<String, CustomResourceDefinition>,
}

impl InMemoryCrdClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the installed CRDs, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.crds.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl CrdClient for InMemoryCrdClient {
    fn apply(&self, crd: CustomResourceDefinition) -> Result<(), TemplateError> {
        if crd.storage_version().is_none() {
            return Err(TemplateError::Crd {
                name: crd.name().to_string(),
                message: "no storage version".to_string(),
            });
        }
        self.crds.insert(crd.name().to_string(), crd);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<bool, TemplateError> {
        Ok(self.crds.remove(name).is_some())
    }

    fn get(&self, name: &str) -> Option<CustomResourceDefinition> {
        self.crds.get(name).map(|crd| crd.clone())
    }
}

/// Schema of the template-specific part of an instance spec. Templates that
/// do not declare one get the shape their behavior reads.
fn parameters_schema(template: &PolicyTemplate) -> Value {
    if !template.spec.schema.is_null() {
        return template.spec.schema.clone();
    }
    match template.spec.behavior {
        TemplateBehavior::RequiredLabels => json!({
            "type": "object",
            "properties": {
                "requiredLabels": {"type": "object", "additionalProperties": {"type": "string"}},
            },
        }),
        TemplateBehavior::Validations { .. } => json!({
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true,
        }),
    }
}

/// Build the CRD serving the template's instances. The instance spec carries
/// the common `matchResources` and `validationActions` fields next to the
/// template's own parameters.
pub fn generate_crd(template: &PolicyTemplate) -> CustomResourceDefinition {
    let parameters = parameters_schema(template);

    let mut spec = Map::new();
    spec.insert("type".to_string(), json!("object"));
    let mut properties = Map::new();
    properties.insert(
        "matchResources".to_string(),
        json!({"type": "object", "x-kubernetes-preserve-unknown-fields": true}),
    );
    properties.insert(
        "validationActions".to_string(),
        json!({"type": "array", "items": {"type": "string"}}),
    );
    if let Some(declared) = parameters.get("properties").and_then(Value::as_object) {
        for (name, schema) in declared {
            properties.insert(name.clone(), schema.clone());
        }
    }
    spec.insert("properties".to_string(), Value::Object(properties));
    for key in ["required", "x-kubernetes-preserve-unknown-fields"] {
        if let Some(value) = parameters.get(key) {
            spec.insert(key.to_string(), value.clone());
        }
    }

    let schema = json!({
        "type": "object",
        "properties": {
            "spec": Value::Object(spec),
            "status": {"type": "object", "x-kubernetes-preserve-unknown-fields": true},
        },
    });

    let names = &template.spec.names;
    let singular = if names.singular.is_empty() {
        names.kind.to_lowercase()
    } else {
        names.singular.clone()
    };
    CustomResourceDefinition::new(
        &template.crd_name(),
        CustomResourceDefinitionSpec {
            group: template.spec.group.clone(),
            names: CustomResourceDefinitionNames {
                kind: names.kind.clone(),
                plural: names.plural.clone(),
                singular,
                list_kind: format!("{}List", names.kind),
            },
            scope: template.spec.scope.as_str().to_string(),
            versions: vec![CustomResourceDefinitionVersion {
                name: template.spec.version.clone(),
                served: true,
                storage: true,
                schema: Some(CustomResourceValidation {
                    open_api_v3_schema: schema,
                }),
            }],
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::meta::ObjectMeta;
    use crate::api::templates::{InstanceScope, PolicyTemplateSpec, TemplateNames};
    use crate::schema::{FieldLookup, InMemorySchemaResolver, SchemaResolver};

    fn template(schema: Value) -> PolicyTemplate {
        PolicyTemplate {
            metadata: ObjectMeta::named("requiredlabels"),
            spec: PolicyTemplateSpec {
                group: "templates.example.com".to_string(),
                version: "v1".to_string(),
                names: TemplateNames {
                    kind: "RequiredLabel".to_string(),
                    plural: "requiredlabels".to_string(),
                    singular: String::new(),
                },
                scope: InstanceScope::Namespaced,
                schema,
                behavior: TemplateBehavior::RequiredLabels,
            },
            status: None,
        }
    }

    #[test]
    fn test_generated_names_and_scope() {
        let crd = generate_crd(&template(Value::Null));
        assert_eq!(crd.name(), "requiredlabels.templates.example.com");
        assert_eq!(crd.spec.names.list_kind, "RequiredLabelList");
        assert_eq!(crd.spec.names.singular, "requiredlabel");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.storage_version().unwrap().name, "v1");
    }

    #[test]
    fn test_generated_schema_is_structural() {
        let crd = generate_crd(&template(json!({
            "type": "object",
            "properties": {"maxLabels": {"type": "integer"}},
            "required": ["maxLabels"],
        })));
        let schema = InMemorySchemaResolver::new().resolve_crd(&crd).unwrap();
        let spec = match schema.field("spec") {
            FieldLookup::Known(spec) => spec,
            _ => panic!("spec is not declared"),
        };
        assert!(matches!(spec.field("maxLabels"), FieldLookup::Known(_)));
        assert!(matches!(spec.field("matchResources"), FieldLookup::Known(_)));
        assert!(matches!(spec.field("requiredLabels"), FieldLookup::Undefined));
        assert_eq!(spec.required, vec!["maxLabels".to_string()]);
    }

    #[test]
    fn test_default_parameters_for_behavior() {
        let crd = generate_crd(&template(Value::Null));
        let schema = InMemorySchemaResolver::new().resolve_crd(&crd).unwrap();
        let spec = match schema.field("spec") {
            FieldLookup::Known(spec) => spec,
            _ => panic!("spec is not declared"),
        };
        assert!(matches!(spec.field("requiredLabels"), FieldLookup::Known(_)));
    }

    #[test]
    fn test_in_memory_client() {
        let client = InMemoryCrdClient::new();
        client.apply(generate_crd(&template(Value::Null))).unwrap();
        assert_eq!(client.names(), vec!["requiredlabels.templates.example.com"]);
        assert!(client.delete("requiredlabels.templates.example.com").unwrap());
        assert!(!client.delete("requiredlabels.templates.example.com").unwrap());
        assert!(client.get("requiredlabels.templates.example.com").is_none());
    }
}

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

//! Structural schemas.
//!
//! A structural schema is an OpenAPI v3 schema restricted so that every
//! node has a single, explicit type. The expression type checker walks it
//! to resolve field references, and generated CRDs embed it.

use crate::admission::GroupVersionKind;
use crate::api::apiextensions::CustomResourceDefinition;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

/// SchemaError is returned when a schema cannot be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The schema violates a structural rule at `path`.
    #[error("{path}: {message}")]
    NotStructural { path: String, message: String },

    /// No schema is known for the kind yet.
    #[error("no schema available for {0}")]
    NotFound(String),
}

impl SchemaError {
    fn at(path: &str, message: impl Into<String>) -> Self {
        SchemaError::NotStructural {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// NotFound may resolve once the schema source catches up.
    pub fn is_transient(&self) -> bool {
        matches!(self, SchemaError::NotFound(_))
    }
}

/// Type of a schema node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SchemaType {
    Object,
    Array,
    String,
    Integer,
    Number,
    Boolean,
    /// No declared type (preserve-unknown-fields or int-or-string).
    #[default]
    Untyped,
}

impl SchemaType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "object" => Some(SchemaType::Object),
            "array" => Some(SchemaType::Array),
            "string" => Some(SchemaType::String),
            "integer" => Some(SchemaType::Integer),
            "number" => Some(SchemaType::Number),
            "boolean" => Some(SchemaType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Object => "object",
            SchemaType::Array => "array",
            SchemaType::String => "string",
            SchemaType::Integer => "integer",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Untyped => "",
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchemaType::Untyped => "dyn",
            other => other.as_str(),
        })
    }
}

/// Structural is one node of a structural schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Structural {
    pub schema_type: SchemaType,
    pub properties: BTreeMap<String, Structural>,
    pub items: Option<Box<Structural>>,
    pub additional_properties: Option<Box<Structural>>,
    pub nullable: bool,
    pub preserve_unknown_fields: bool,
    pub int_or_string: bool,
    pub required: Vec<String>,
}

/// Result of looking a field up on an object node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldLookup<'a> {
    /// The field is declared with this schema.
    Known(&'a Structural),
    /// The node accepts arbitrary fields; nothing is known statically.
    Dynamic,
    /// The node is typed and declares no such field.
    Undefined,
}

impl Structural {
    pub fn of_type(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            ..Default::default()
        }
    }

    pub fn object(properties: Vec<(&str, Structural)>) -> Self {
        Self {
            schema_type: SchemaType::Object,
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            ..Default::default()
        }
    }

    pub fn map_of(values: Structural) -> Self {
        Self {
            schema_type: SchemaType::Object,
            additional_properties: Some(Box::new(values)),
            ..Default::default()
        }
    }

    pub fn array_of(items: Structural) -> Self {
        Self {
            schema_type: SchemaType::Array,
            items: Some(Box::new(items)),
            ..Default::default()
        }
    }

    pub fn preserve_unknown() -> Self {
        Self {
            schema_type: SchemaType::Object,
            preserve_unknown_fields: true,
            ..Default::default()
        }
    }

    /// Convert an OpenAPI v3 schema document, enforcing structural rules.
    pub fn from_openapi(schema: &Value) -> Result<Self, SchemaError> {
        convert(schema, "")
    }

    /// Render back to an OpenAPI v3 schema document.
    pub fn to_openapi(&self) -> Value {
        let mut out = Map::new();
        if self.schema_type != SchemaType::Untyped {
            out.insert("type".to_string(), Value::String(self.schema_type.as_str().to_string()));
        }
        if !self.properties.is_empty() {
            let props = self
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_openapi()))
                .collect();
            out.insert("properties".to_string(), Value::Object(props));
        }
        if let Some(items) = &self.items {
            out.insert("items".to_string(), items.to_openapi());
        }
        if let Some(additional) = &self.additional_properties {
            out.insert("additionalProperties".to_string(), additional.to_openapi());
        }
        if self.nullable {
            out.insert("nullable".to_string(), Value::Bool(true));
        }
        if self.preserve_unknown_fields {
            out.insert("x-kubernetes-preserve-unknown-fields".to_string(), Value::Bool(true));
        }
        if self.int_or_string {
            out.insert("x-kubernetes-int-or-string".to_string(), Value::Bool(true));
        }
        if !self.required.is_empty() {
            out.insert(
                "required".to_string(),
                Value::Array(self.required.iter().cloned().map(Value::String).collect()),
            );
        }
        Value::Object(out)
    }

    /// Adds `apiVersion`, `kind` and the standard `metadata` fields to a
    /// top-level object schema that does not declare them.
    pub fn with_object_meta(mut self) -> Self {
        let string = || Structural::of_type(SchemaType::String);
        self.properties.entry("apiVersion".to_string()).or_insert_with(string);
        self.properties.entry("kind".to_string()).or_insert_with(string);
        self.properties.entry("metadata".to_string()).or_insert_with(|| {
            Structural::object(vec![
                ("name", string()),
                ("generateName", string()),
                ("namespace", string()),
                ("uid", string()),
                ("resourceVersion", string()),
                ("generation", Structural::of_type(SchemaType::Integer)),
                ("creationTimestamp", string()),
                ("labels", Structural::map_of(string())),
                ("annotations", Structural::map_of(string())),
            ])
        });
        self
    }

    /// Look up a field on this node.
    pub fn field(&self, name: &str) -> FieldLookup<'_> {
        if let Some(prop) = self.properties.get(name) {
            return FieldLookup::Known(prop);
        }
        if let Some(additional) = &self.additional_properties {
            return FieldLookup::Known(additional);
        }
        if self.preserve_unknown_fields || self.int_or_string || self.schema_type == SchemaType::Untyped {
            return FieldLookup::Dynamic;
        }
        FieldLookup::Undefined
    }

    /// Stable fingerprint of the schema, used to key compiled expressions.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

fn flag(node: &Map<String, Value>, key: &str) -> bool {
    node.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn convert(schema: &Value, path: &str) -> Result<Structural, SchemaError> {
    let node = schema
        .as_object()
        .ok_or_else(|| SchemaError::at(path, "schema must be an object"))?;

    let preserve_unknown_fields = flag(node, "x-kubernetes-preserve-unknown-fields");
    let int_or_string = flag(node, "x-kubernetes-int-or-string");

    let schema_type = match node.get("type") {
        Some(Value::String(t)) => SchemaType::parse(t)
            .ok_or_else(|| SchemaError::at(&join(path, "type"), format!("unsupported type {:?}", t)))?,
        Some(_) => return Err(SchemaError::at(&join(path, "type"), "must be a string")),
        None if preserve_unknown_fields || int_or_string => SchemaType::Untyped,
        None => return Err(SchemaError::at(&join(path, "type"), "must not be empty for specified object fields")),
    };

    let has_properties = node.contains_key("properties");
    let has_additional = node
        .get("additionalProperties")
        .map_or(false, |v| !matches!(v, Value::Bool(false)));
    if has_properties && has_additional {
        return Err(SchemaError::at(
            &join(path, "additionalProperties"),
            "additionalProperties and properties are mutually exclusive",
        ));
    }

    let mut out = Structural {
        schema_type,
        nullable: flag(node, "nullable"),
        preserve_unknown_fields,
        int_or_string,
        ..Default::default()
    };

    if let Some(props) = node.get("properties") {
        let props = props
            .as_object()
            .ok_or_else(|| SchemaError::at(&join(path, "properties"), "must be an object"))?;
        if schema_type != SchemaType::Object {
            return Err(SchemaError::at(&join(path, "properties"), "must only be set for objects"));
        }
        for (name, prop) in props {
            let prop_path = join(&join(path, "properties"), &format!("[{}]", name));
            out.properties.insert(name.clone(), convert(prop, &prop_path)?);
        }
    }

    match node.get("additionalProperties") {
        Some(Value::Bool(true)) => out.preserve_unknown_fields = true,
        Some(additional @ Value::Object(_)) => {
            out.additional_properties = Some(Box::new(convert(
                additional,
                &join(path, "additionalProperties"),
            )?));
        }
        _ => {}
    }

    if schema_type == SchemaType::Array {
        let items = node
            .get("items")
            .ok_or_else(|| SchemaError::at(&join(path, "items"), "must be specified for arrays"))?;
        out.items = Some(Box::new(convert(items, &join(path, "items"))?));
    }

    if let Some(required) = node.get("required").and_then(Value::as_array) {
        out.required = required
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
    }

    Ok(out)
}

/// SchemaResolver produces structural schemas for kinds.
pub trait SchemaResolver: Send + Sync {
    /// Schema of the given kind.
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<Arc<Structural>, SchemaError>;

    /// Schema declared by a CRD for its storage version.
    fn resolve_crd(&self, crd: &CustomResourceDefinition) -> Result<Arc<Structural>, SchemaError> {
        let version = crd
            .storage_version()
            .ok_or_else(|| SchemaError::at("spec.versions", "no served version"))?;
        let schema = version
            .schema
            .as_ref()
            .ok_or_else(|| SchemaError::at("spec.versions.schema", "openAPIV3Schema is required"))?;
        Ok(Arc::new(Structural::from_openapi(&schema.open_api_v3_schema)?))
    }
}

/// InMemorySchemaResolver serves schemas registered ahead of time.
#[derive(Default)]
pub struct InMemorySchemaResolver {
    schemas: DashMap<GroupVersionKind, Arc<Structural>>,
}

impl InMemorySchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, gvk: GroupVersionKind, schema: Structural) {
        self.schemas.insert(gvk, Arc::new(schema.with_object_meta()));
    }

    /// Register a schema given as an OpenAPI document.
    pub fn register_openapi(&self, gvk: GroupVersionKind, schema: &Value) -> Result<(), SchemaError> {
        self.register(gvk, Structural::from_openapi(schema)?);
        Ok(())
    }

    pub fn remove(&self, gvk: &GroupVersionKind) {
        self.schemas.remove(gvk);
    }
}

impl SchemaResolver for InMemorySchemaResolver {
    fn resolve(&self, gvk: &GroupVersionKind) -> Result<Arc<Structural>, SchemaError> {
        self.schemas
            .get(gvk)
            .map(|s| s.clone())
            .ok_or_else(|| SchemaError::NotFound(gvk.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_openapi_structural() {
        let schema = Structural::from_openapi(&json!({
            "type": "object",
            "properties": {
                "data": {"type": "object", "additionalProperties": {"type": "string"}},
                "items": {"type": "array", "items": {"type": "integer"}},
                "port": {"x-kubernetes-int-or-string": true},
                "extra": {"type": "object", "x-kubernetes-preserve-unknown-fields": true}
            },
            "required": ["data"]
        }))
        .unwrap();

        assert_eq!(schema.schema_type, SchemaType::Object);
        assert_eq!(schema.required, vec!["data".to_string()]);
        match schema.field("data") {
            FieldLookup::Known(data) => {
                assert!(matches!(data.field("anything"), FieldLookup::Known(s) if s.schema_type == SchemaType::String))
            }
            other => panic!("unexpected lookup {:?}", other),
        }
        assert_eq!(schema.field("missing"), FieldLookup::Undefined);
        match schema.field("extra") {
            FieldLookup::Known(extra) => assert_eq!(extra.field("x"), FieldLookup::Dynamic),
            other => panic!("unexpected lookup {:?}", other),
        }
    }

    #[test]
    fn test_from_openapi_rejects_non_structural() {
        let err = Structural::from_openapi(&json!({
            "type": "object",
            "properties": {"spec": {"properties": {}}}
        }))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "properties.[spec].type: must not be empty for specified object fields"
        );

        let err = Structural::from_openapi(&json!({"type": "array"})).unwrap_err();
        assert!(err.to_string().contains("must be specified for arrays"));

        let err = Structural::from_openapi(&json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": {"type": "string"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_openapi_round_trip_preserves_fingerprint() {
        let original = Structural::object(vec![
            ("name", Structural::of_type(SchemaType::String)),
            ("tags", Structural::array_of(Structural::of_type(SchemaType::String))),
        ]);
        let reparsed = Structural::from_openapi(&original.to_openapi()).unwrap();
        assert_eq!(original, reparsed);
        assert_eq!(original.fingerprint(), reparsed.fingerprint());

        let changed = Structural::object(vec![("name", Structural::of_type(SchemaType::Integer))]);
        assert_ne!(original.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_in_memory_resolver() {
        let resolver = InMemorySchemaResolver::new();
        let gvk = GroupVersionKind::new("", "v1", "ConfigMap");
        assert!(resolver.resolve(&gvk).unwrap_err().is_transient());

        resolver
            .register_openapi(
                gvk.clone(),
                &json!({"type": "object", "properties": {"data": {"type": "object", "additionalProperties": {"type": "string"}}}}),
            )
            .unwrap();
        let schema = resolver.resolve(&gvk).unwrap();
        assert!(matches!(schema.field("metadata"), FieldLookup::Known(_)));
        assert!(matches!(schema.field("data"), FieldLookup::Known(_)));
    }
}

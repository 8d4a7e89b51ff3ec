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

//! Object metadata and label selectors.
//!
//! Objects flow through the engine as untyped JSON; these helpers read the
//! well-known metadata fields out of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Labels as stored on an object.
pub type Labels = BTreeMap<String, String>;

/// ObjectMeta is the subset of object metadata the engine reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: Labels,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default)]
    pub generation: i64,
}

impl ObjectMeta {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            ..Default::default()
        }
    }
}

/// ObjectKey identifies an object by namespace and name.
/// Cluster-scoped objects use an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster(name: &str) -> Self {
        Self::new("", name)
    }

    pub fn of(object: &Value) -> Self {
        Self::new(object_namespace(object), object_name(object))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

fn metadata_str<'a>(object: &'a Value, field: &str) -> &'a str {
    object
        .get("metadata")
        .and_then(|m| m.get(field))
        .and_then(Value::as_str)
        .unwrap_or("")
}

/// Returns `metadata.name`, or "" when absent.
pub fn object_name(object: &Value) -> &str {
    metadata_str(object, "name")
}

/// Returns `metadata.namespace`, or "" when absent.
pub fn object_namespace(object: &Value) -> &str {
    metadata_str(object, "namespace")
}

/// Returns `metadata.labels`. Non-string values are ignored.
pub fn object_labels(object: &Value) -> Labels {
    object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

// ============================================================================
// Label Selectors
// ============================================================================

/// LabelSelectorOperator is the set of operators usable in a selector requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    /// Any operator this engine does not understand. It never matches.
    #[serde(other)]
    Unknown,
}

/// LabelSelectorRequirement is a selector that contains values, a key, and an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: LabelSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            LabelSelectorOperator::In => value.map_or(false, |v| self.values.contains(v)),
            LabelSelectorOperator::NotIn => value.map_or(true, |v| !self.values.contains(v)),
            LabelSelectorOperator::Exists => value.is_some(),
            LabelSelectorOperator::DoesNotExist => value.is_none(),
            LabelSelectorOperator::Unknown => false,
        }
    }
}

/// LabelSelector is a label query over a set of resources.
/// The requirements are ANDed. An empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: Labels,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    pub fn with_labels(labels: &[(&str, &str)]) -> Self {
        Self {
            match_labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn with_expression(mut self, key: &str, operator: LabelSelectorOperator, values: &[&str]) -> Self {
        self.match_expressions.push(LabelSelectorRequirement {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        });
        self
    }

    /// Check if the selector matches the given labels.
    pub fn matches(&self, labels: &Labels) -> bool {
        for (key, value) in &self.match_labels {
            match labels.get(key) {
                Some(v) if v == value => continue,
                _ => return false,
            }
        }
        self.match_expressions.iter().all(|req| req.matches(labels))
    }

    /// Check if the selector is empty (matches everything).
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_object_metadata_helpers() {
        let obj = json!({
            "metadata": {
                "name": "web",
                "namespace": "prod",
                "labels": {"app": "web", "replicas": 3}
            }
        });
        assert_eq!(object_name(&obj), "web");
        assert_eq!(object_namespace(&obj), "prod");
        assert_eq!(object_labels(&obj), labels(&[("app", "web")]));
        assert_eq!(ObjectKey::of(&obj).to_string(), "prod/web");
        assert_eq!(object_name(&json!(null)), "");
    }

    #[test]
    fn test_label_selector_match_labels() {
        let selector = LabelSelector::with_labels(&[("env", "prod")]);
        assert!(selector.matches(&labels(&[("env", "prod"), ("tier", "db")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));
        assert!(!selector.matches(&Labels::new()));
        assert!(LabelSelector::default().matches(&Labels::new()));
    }

    #[test]
    fn test_label_selector_expressions() {
        let selector = LabelSelector::default()
            .with_expression("env", LabelSelectorOperator::In, &["prod", "staging"])
            .with_expression("legacy", LabelSelectorOperator::DoesNotExist, &[]);
        assert!(selector.matches(&labels(&[("env", "staging")])));
        assert!(!selector.matches(&labels(&[("env", "staging"), ("legacy", "true")])));
        assert!(!selector.matches(&labels(&[("env", "dev")])));

        let not_in = LabelSelector::default().with_expression("env", LabelSelectorOperator::NotIn, &["prod"]);
        assert!(not_in.matches(&Labels::new()));
        assert!(!not_in.matches(&labels(&[("env", "prod")])));

        let exists = LabelSelector::default().with_expression("team", LabelSelectorOperator::Exists, &[]);
        assert!(exists.matches(&labels(&[("team", "a")])));
        assert!(!exists.matches(&Labels::new()));
    }

    #[test]
    fn test_unknown_operator_never_matches() {
        let selector: LabelSelector = serde_json::from_value(json!({
            "matchExpressions": [{"key": "env", "operator": "Gt", "values": ["1"]}]
        }))
        .unwrap();
        assert_eq!(selector.match_expressions[0].operator, LabelSelectorOperator::Unknown);
        assert!(!selector.matches(&labels(&[("env", "2")])));
    }
}

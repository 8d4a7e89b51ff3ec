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

//! Built-in template behaviors and the structured violation report they emit.

use crate::api::meta::Labels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const MISSING_LABELS_MESSAGE: &str = "missing one or more required labels";
pub const INVALID_LABELS_MESSAGE: &str = "invalid values provided on one or more labels";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViolationDetails {
    pub data: Vec<String>,
}

/// Violation is one rule category that failed, with the offending fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub message: String,
    pub details: ViolationDetails,
}

impl Violation {
    pub fn new(message: &str, mut data: Vec<String>) -> Self {
        data.sort();
        Self {
            message: message.to_string(),
            details: ViolationDetails { data },
        }
    }
}

/// DecisionError is the machine readable violation report. Callers match on
/// the order of its entries, so producers append categories in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Error)]
#[error("{}", render(&self.violations)?)]
pub struct DecisionError {
    pub violations: Vec<Violation>,
}

impl DecisionError {
    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// `[{"message": .., "details": {"data": [..]}}, ..]`
    pub fn error_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.violations)
    }
}

fn render(violations: &[Violation]) -> Result<String, fmt::Error> {
    serde_json::to_string(violations).map_err(|_| fmt::Error)
}

/// Check `labels` against the `{key: allowedValue}` map an instance requires.
/// Returns None when every required label is present with its allowed value.
pub fn required_labels(required: &BTreeMap<String, String>, labels: &Labels) -> Option<DecisionError> {
    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    for (key, allowed) in required {
        match labels.get(key) {
            None => missing.push(key.clone()),
            Some(value) if value != allowed => invalid.push(key.clone()),
            Some(_) => {}
        }
    }

    let mut err = DecisionError::default();
    if !missing.is_empty() {
        err.violations.push(Violation::new(MISSING_LABELS_MESSAGE, missing));
    }
    if !invalid.is_empty() {
        err.violations.push(Violation::new(INVALID_LABELS_MESSAGE, invalid));
    }
    if err.is_empty() {
        None
    } else {
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn required() -> BTreeMap<String, String> {
        labels(&[("ssh", "enabled"), ("env", "prod")])
    }

    #[test]
    fn test_all_labels_present() {
        let object = labels(&[("ssh", "enabled"), ("env", "prod"), ("verified", "true")]);
        assert_eq!(required_labels(&required(), &object), None);
    }

    #[test]
    fn test_invalid_value() {
        let object = labels(&[("ssh", "enabled"), ("env", "invalid_value"), ("verified", "true")]);
        let err = required_labels(&required(), &object).unwrap();
        assert_eq!(
            err.error_json().unwrap(),
            r#"[{"message":"invalid values provided on one or more labels","details":{"data":["env"]}}]"#
        );
    }

    #[test]
    fn test_missing_label() {
        let object = labels(&[("env", "prod"), ("verified", "true")]);
        let err = required_labels(&required(), &object).unwrap();
        assert_eq!(
            err.to_string(),
            r#"[{"message":"missing one or more required labels","details":{"data":["ssh"]}}]"#
        );
    }

    #[test]
    fn test_missing_before_invalid() {
        let object = labels(&[("env", "incorrect"), ("verified", "true")]);
        let err = required_labels(&required(), &object).unwrap();
        let messages: Vec<&str> = err.violations.iter().map(|v| v.message.as_str()).collect();
        assert_eq!(messages, vec![MISSING_LABELS_MESSAGE, INVALID_LABELS_MESSAGE]);
        assert_eq!(err.violations[0].details.data, vec!["ssh"]);
        assert_eq!(err.violations[1].details.data, vec!["env"]);
    }

    #[test]
    fn test_report_is_an_error() {
        let err = required_labels(&required(), &Labels::new()).unwrap();
        let report = err.error_json().unwrap();
        let source: &dyn std::error::Error = &err;
        assert_eq!(source.to_string(), report);
        assert!(source.source().is_none());
        assert_eq!(DecisionError::default().error_json().unwrap(), "[]");
    }

    #[test]
    fn test_data_is_sorted() {
        let required = labels(&[("b", "1"), ("a", "1"), ("c", "1")]);
        let err = required_labels(&required, &Labels::new()).unwrap();
        assert_eq!(err.violations[0].details.data, vec!["a", "b", "c"]);
    }
}

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

//! Admission response envelope handed back to the transport layer.

use super::errors::AdmissionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// AdmissionResponse describes an admission response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    /// UID is an identifier for the individual request/response.
    pub uid: String,
    /// Allowed indicates whether or not the admission request was permitted.
    pub allowed: bool,
    /// Status contains extra details into why an admission request was denied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    /// Warnings is a list of warning messages to return to the requesting API client.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// AuditAnnotations is a map of audit annotations for the admission response.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audit_annotations: BTreeMap<String, String>,
}

impl Default for AdmissionResponse {
    fn default() -> Self {
        Self {
            uid: String::new(),
            allowed: true,
            status: None,
            warnings: Vec::new(),
            audit_annotations: BTreeMap::new(),
        }
    }
}

impl AdmissionResponse {
    /// Create an allowed response.
    pub fn allowed(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            ..Self::default()
        }
    }

    /// Create a denied response with an explicit status.
    pub fn denied(uid: &str, code: u16, message: &str, reason: &str) -> Self {
        Self {
            uid: uid.to_string(),
            allowed: false,
            status: Some(ResponseStatus {
                code,
                message: message.to_string(),
                reason: reason.to_string(),
            }),
            ..Self::default()
        }
    }

    /// Convert an admission error into a response. Transient errors are
    /// rendered with their own reason so callers can tell them apart from
    /// policy denials.
    pub fn from_error(uid: &str, err: &AdmissionError) -> Self {
        let reason = err.status_reason();
        Self::denied(uid, reason.code(), &err.to_string(), reason.as_str())
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    pub fn with_audit_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.audit_annotations = annotations;
        self
    }
}

/// ResponseStatus contains details about the result of the admission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStatus {
    /// Code is the HTTP status code.
    pub code: u16,
    /// Message is a human-readable description.
    pub message: String,
    /// Reason is a machine-readable description.
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::errors::StatusReason;

    #[test]
    fn test_allowed_response_serialization() {
        let resp = AdmissionResponse::allowed("abc");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json, serde_json::json!({"uid": "abc", "allowed": true}));
    }

    #[test]
    fn test_from_forbidden_error() {
        let err = AdmissionError::forbidden(
            "endpoints1",
            "endpoints",
            StatusReason::Forbidden,
            "denied",
        );
        let resp = AdmissionResponse::from_error("u1", &err);
        assert!(!resp.allowed);
        let status = resp.status.unwrap();
        assert_eq!(status.code, 403);
        assert_eq!(status.reason, "Forbidden");
        assert_eq!(status.message, "endpoints \"endpoints1\" is forbidden: denied");
    }

    #[test]
    fn test_from_not_ready_error() {
        let resp = AdmissionResponse::from_error("u2", &AdmissionError::not_ready("policy source"));
        let status = resp.status.unwrap();
        assert_eq!(status.code, 503);
        assert!(status.message.contains("not yet synced"));
    }

    #[test]
    fn test_warnings_and_annotations() {
        let mut annotations = BTreeMap::new();
        annotations.insert("p/key".to_string(), "v".to_string());
        let resp = AdmissionResponse::allowed("u3")
            .with_warnings(vec!["w".to_string()])
            .with_audit_annotations(annotations);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["warnings"][0], "w");
        assert_eq!(json["auditAnnotations"]["p/key"], "v");
    }
}

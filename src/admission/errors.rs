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

//! Admission error types.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for admission operations.
pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Suffix carried by every transient readiness error.
pub const NOT_SYNCED_MESSAGE: &str = "not yet synced to use for admission";

/// AdmissionError represents errors that can occur during admission.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// BadRequest indicates a malformed request.
    #[error("{0}")]
    BadRequest(String),

    /// Forbidden is a policy-originated denial.
    #[error("{0}")]
    Forbidden(ForbiddenError),

    /// Invalid indicates an API object failed validation.
    #[error("{kind} \"{name}\" is invalid: {}", join_field_errors(.errors))]
    Invalid {
        kind: String,
        name: String,
        errors: Vec<FieldError>,
    },

    /// NotReady is transient: the engine's caches have not completed an initial list.
    #[error("{0} {}", NOT_SYNCED_MESSAGE)]
    NotReady(String),

    /// Canceled means the decision was abandoned before it completed.
    #[error("admission decision canceled: {0}")]
    Canceled(String),

    /// Aggregate represents multiple errors.
    #[error("{0}")]
    Aggregate(AggregateError),

    /// Internal represents an internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// NotFound indicates a resource was not found.
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: String, name: String },
}

impl AdmissionError {
    /// Create a new BadRequest error.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        AdmissionError::BadRequest(msg.into())
    }

    /// Create a new Forbidden error.
    pub fn forbidden(
        name: impl Into<String>,
        resource: impl Into<String>,
        reason: StatusReason,
        message: impl Into<String>,
    ) -> Self {
        AdmissionError::Forbidden(ForbiddenError {
            name: name.into(),
            resource: resource.into(),
            reason,
            message: message.into(),
        })
    }

    /// Create an Invalid error from a list of field errors.
    pub fn invalid(kind: impl Into<String>, name: impl Into<String>, errors: Vec<FieldError>) -> Self {
        AdmissionError::Invalid {
            kind: kind.into(),
            name: name.into(),
            errors,
        }
    }

    /// Create a transient not-ready error for the named component.
    pub fn not_ready(component: impl Into<String>) -> Self {
        AdmissionError::NotReady(component.into())
    }

    /// Create a Canceled error.
    pub fn canceled(msg: impl Into<String>) -> Self {
        AdmissionError::Canceled(msg.into())
    }

    /// Create an aggregate error from multiple errors.
    pub fn aggregate(errors: Vec<AdmissionError>) -> Self {
        AdmissionError::Aggregate(AggregateError { errors })
    }

    /// Create a NotFound error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        AdmissionError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal_error(msg: impl Into<String>) -> Self {
        AdmissionError::Internal(msg.into())
    }

    /// The status reason reported to the caller.
    pub fn status_reason(&self) -> StatusReason {
        match self {
            AdmissionError::BadRequest(_) => StatusReason::BadRequest,
            AdmissionError::Forbidden(err) => err.reason,
            AdmissionError::Invalid { .. } => StatusReason::Invalid,
            AdmissionError::NotReady(_) => StatusReason::ServiceUnavailable,
            AdmissionError::Canceled(_) => StatusReason::Timeout,
            AdmissionError::Aggregate(agg) => agg
                .errors
                .first()
                .map(|e| e.status_reason())
                .unwrap_or(StatusReason::InternalError),
            AdmissionError::Internal(_) => StatusReason::InternalError,
            AdmissionError::NotFound { .. } => StatusReason::NotFound,
        }
    }

    /// Transient errors must be retried by the caller, never reported as a deny.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdmissionError::NotReady(_) | AdmissionError::Canceled(_)
        )
    }

    /// True if this error originated from a policy rejecting the request.
    pub fn is_policy_denial(&self) -> bool {
        match self {
            AdmissionError::Forbidden(_) => true,
            AdmissionError::Aggregate(agg) => agg.errors.iter().any(|e| e.is_policy_denial()),
            _ => false,
        }
    }
}

/// StatusReason is the machine-readable reason attached to a failed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusReason {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestEntityTooLarge,
    Invalid,
    Timeout,
    InternalError,
    ServiceUnavailable,
}

impl StatusReason {
    /// HTTP status code carried with this reason.
    pub fn code(&self) -> u16 {
        match self {
            StatusReason::BadRequest => 400,
            StatusReason::Unauthorized => 401,
            StatusReason::Forbidden => 403,
            StatusReason::NotFound => 404,
            StatusReason::RequestEntityTooLarge => 413,
            StatusReason::Invalid => 422,
            StatusReason::Timeout => 504,
            StatusReason::InternalError => 500,
            StatusReason::ServiceUnavailable => 503,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusReason::BadRequest => "BadRequest",
            StatusReason::Unauthorized => "Unauthorized",
            StatusReason::Forbidden => "Forbidden",
            StatusReason::NotFound => "NotFound",
            StatusReason::RequestEntityTooLarge => "RequestEntityTooLarge",
            StatusReason::Invalid => "Invalid",
            StatusReason::Timeout => "Timeout",
            StatusReason::InternalError => "InternalError",
            StatusReason::ServiceUnavailable => "ServiceUnavailable",
        }
    }
}

impl fmt::Display for StatusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ForbiddenError is a denial of a request by an admission policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ForbiddenError {
    pub name: String,
    pub resource: String,
    pub reason: StatusReason,
    pub message: String,
}

impl ForbiddenError {
    pub fn code(&self) -> u16 {
        self.reason.code()
    }
}

impl fmt::Display for ForbiddenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" is forbidden: {}",
            self.resource, self.name, self.message
        )
    }
}

/// FieldError represents a field-level error.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub error_type: FieldErrorType,
    pub value: String,
    pub detail: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            FieldErrorType::NotSupported => {
                write!(
                    f,
                    "{}: Unsupported value: \"{}\": supported values: {}",
                    self.field, self.value, self.detail
                )
            }
            FieldErrorType::Required => {
                write!(f, "{}: Required value", self.field)?;
                if !self.detail.is_empty() {
                    write!(f, ": {}", self.detail)?;
                }
                Ok(())
            }
            FieldErrorType::Invalid => {
                write!(f, "{}: Invalid value: \"{}\"", self.field, self.value)?;
                if !self.detail.is_empty() {
                    write!(f, ": {}", self.detail)?;
                }
                Ok(())
            }
        }
    }
}

/// FieldErrorType represents the type of field error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldErrorType {
    /// NotSupported indicates the value is not in the list of supported values.
    NotSupported,
    /// Required indicates a required field is missing.
    Required,
    /// Invalid indicates an invalid value.
    Invalid,
}

fn join_field_errors(errors: &[FieldError]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    if parts.len() == 1 {
        parts.join("")
    } else {
        format!("[{}]", parts.join(", "))
    }
}

/// AggregateError represents multiple errors.
#[derive(Debug)]
pub struct AggregateError {
    pub errors: Vec<AdmissionError>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error_strings: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();
        write!(f, "[{}]", error_strings.join(", "))
    }
}

/// Helper function to create a "not supported" field error.
pub fn field_not_supported(field: &str, value: &str, supported: &[&str]) -> FieldError {
    FieldError {
        field: field.to_string(),
        error_type: FieldErrorType::NotSupported,
        value: value.to_string(),
        detail: supported
            .iter()
            .map(|s| format!("\"{}\"", s))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Helper function to create a "required" field error.
pub fn field_required(field: &str, detail: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        error_type: FieldErrorType::Required,
        value: String::new(),
        detail: detail.to_string(),
    }
}

/// Helper function to create an "invalid" field error.
pub fn field_invalid(field: &str, value: &str, detail: &str) -> FieldError {
    FieldError {
        field: field.to_string(),
        error_type: FieldErrorType::Invalid,
        value: value.to_string(),
        detail: detail.to_string(),
    }
}

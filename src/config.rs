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

//! Engine configuration.
//!
//! The admission plugin factory receives an optional configuration reader.
//! Its content is YAML (JSON is accepted as a subset); an absent reader
//! yields the defaults.

use crate::admission::{AdmissionError, AdmissionResult};
use crate::controller::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::time::Duration;

/// Configuration of the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Worker tasks draining each reconcile queue.
    pub workers: usize,

    /// Upper bound for a single admission decision, in milliseconds.
    pub decision_timeout_ms: u64,

    /// First requeue delay after a transient reconcile failure.
    pub backoff_base_ms: u64,

    /// Cap on the requeue delay.
    pub backoff_max_ms: u64,

    /// Number of matched kinds a policy is type-checked against.
    pub max_type_check_kinds: usize,

    /// Prefix of the annotation that summarizes Audit violations.
    pub audit_annotation_prefix: String,

    /// Reserved object name used by readiness probes.
    pub readiness_marker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            decision_timeout_ms: 10_000,
            backoff_base_ms: 5,
            backoff_max_ms: 60_000,
            max_type_check_kinds: 10,
            audit_annotation_prefix: "validation.policy.admission.k8s.io".to_string(),
            readiness_marker_name: "test-marker".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load the configuration, falling back to defaults when no reader is given.
    pub fn load(reader: Option<&mut dyn Read>) -> AdmissionResult<Self> {
        let reader = match reader {
            Some(reader) => reader,
            None => return Ok(Self::default()),
        };
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|e| AdmissionError::bad_request(format!("failed to read configuration: {}", e)))?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| AdmissionError::bad_request(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AdmissionResult<()> {
        if self.workers == 0 {
            return Err(AdmissionError::bad_request("workers must be at least 1"));
        }
        if self.decision_timeout_ms == 0 {
            return Err(AdmissionError::bad_request("decisionTimeoutMs must be positive"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(AdmissionError::bad_request(
                "backoffBaseMs must not exceed backoffMaxMs",
            ));
        }
        Ok(())
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Requeue policy of the reconcile queues.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.backoff_base(), self.backoff_max())
    }

    /// Key of the annotation summarizing Audit violations.
    pub fn validation_failure_key(&self) -> String {
        format!("{}/validation_failure", self.audit_annotation_prefix)
    }
}

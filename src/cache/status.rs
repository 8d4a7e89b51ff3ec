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

//! Write path for derived status. The engine never mutates the objects it
//! reads; it only publishes status subresources.

use crate::api::admissionregistration::ValidatingAdmissionPolicyStatus;
use crate::api::templates::PolicyTemplateStatus;
use dashmap::DashMap;

/// StatusPublisher writes status subresources back to the API server.
pub trait StatusPublisher: Send + Sync {
    fn publish_policy_status(&self, name: &str, status: ValidatingAdmissionPolicyStatus);

    fn publish_template_status(&self, name: &str, status: PolicyTemplateStatus);
}

/// Keeps the latest published status per object.
#[derive(Default)]
pub struct InMemoryStatusPublisher {
    policies: DashMap<String, ValidatingAdmissionPolicyStatus>,
    templates: DashMap<String, PolicyTemplateStatus>,
}

impl InMemoryStatusPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy_status(&self, name: &str) -> Option<ValidatingAdmissionPolicyStatus> {
        self.policies.get(name).map(|s| s.clone())
    }

    pub fn template_status(&self, name: &str) -> Option<PolicyTemplateStatus> {
        self.templates.get(name).map(|s| s.clone())
    }
}

impl StatusPublisher for InMemoryStatusPublisher {
    fn publish_policy_status(&self, name: &str, status: ValidatingAdmissionPolicyStatus) {
        self.policies.insert(name.to_string(), status);
    }

    fn publish_template_status(&self, name: &str, status: PolicyTemplateStatus) {
        self.templates.insert(name.to_string(), status);
    }
}

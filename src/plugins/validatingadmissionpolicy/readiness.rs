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

//! Readiness probing through a reserved marker object.
//!
//! A policy instrumented with the marker rule denies a no-op UPDATE of the
//! marker Endpoints object with a well-known message. Callers that just
//! created a binding send that update until the message shows up.

use super::dispatcher::Decision;
use crate::admission::{
    AdmissionResult, AttributesRecord, GroupVersionKind, GroupVersionResource, Operation,
};
use crate::api::admissionregistration::{
    MatchResources, NamedRuleWithOperations, ValidatingAdmissionPolicySpec, Validation,
};
use serde_json::json;

pub const MARKER_MESSAGE: &str = "marker denied; policy is ready";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The marker was denied or warned about: the binding is enforced.
    Ready,
    /// The request went through untouched. Retry shortly.
    Pending,
    /// The engine has not synced yet.
    NotSynced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerProbe {
    name: String,
}

impl MarkerProbe {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn marker_rule(&self) -> NamedRuleWithOperations {
        NamedRuleWithOperations::new(&[""], &["v1"], &["endpoints"], &["UPDATE"])
            .with_resource_names(&[&self.name])
    }

    /// Fails only for the marker object, so it is safe to run against any request.
    pub fn marker_validation(&self) -> Validation {
        Validation::new(&format!(
            "request.resource.resource != 'endpoints' || request.name != '{}'",
            self.name
        ))
        .with_message(MARKER_MESSAGE)
    }

    /// Add the marker rule and validation to a policy. The marker validation
    /// goes first, shifting the index of every declared validation by one.
    pub fn instrument(&self, spec: &mut ValidatingAdmissionPolicySpec) {
        let constraints = spec.match_constraints.get_or_insert_with(MatchResources::default);
        let rule = self.marker_rule();
        if !constraints.resource_rules.contains(&rule) {
            constraints.resource_rules.push(rule);
        }
        let validation = self.marker_validation();
        if !spec.validations.contains(&validation) {
            spec.validations.insert(0, validation);
        }
    }

    /// The no-op update a caller sends to probe readiness.
    pub fn attributes(&self, namespace: &str) -> AttributesRecord {
        let object = json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": {"name": self.name, "namespace": namespace},
        });
        AttributesRecord::new(
            GroupVersionResource::new("", "v1", "endpoints"),
            GroupVersionKind::new("", "v1", "Endpoints"),
            Operation::Update,
            Some(object.clone()),
            Some(object),
        )
        .with_namespace(namespace)
        .with_name(&self.name)
    }

    pub fn classify(&self, outcome: &AdmissionResult<Decision>) -> Readiness {
        match outcome {
            Err(err) if err.is_transient() => Readiness::NotSynced,
            Err(_) => Readiness::Pending,
            Ok(decision) => {
                let denied = decision
                    .denial
                    .as_ref()
                    .map_or(false, |denial| denial.message.contains(MARKER_MESSAGE));
                let warned = decision.warnings.iter().any(|w| w.contains(MARKER_MESSAGE));
                if denied || warned {
                    Readiness::Ready
                } else {
                    Readiness::Pending
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionError, StatusReason};
    use crate::plugins::validatingadmissionpolicy::dispatcher::Denial;
    use crate::plugins::validatingadmissionpolicy::matching::{rule_matches, RuleTarget};

    #[test]
    fn test_instrument_is_idempotent() {
        let probe = MarkerProbe::new("test-marker");
        let mut spec = ValidatingAdmissionPolicySpec {
            validations: vec![Validation::new("object.data.size() < 3")],
            ..Default::default()
        };
        probe.instrument(&mut spec);
        probe.instrument(&mut spec);
        assert_eq!(spec.validations.len(), 2);
        assert_eq!(spec.validations[0].message, MARKER_MESSAGE);
        assert_eq!(spec.match_constraints.unwrap().resource_rules.len(), 1);
    }

    #[test]
    fn test_marker_rule_matches_probe_only() {
        let probe = MarkerProbe::new("test-marker");
        let attrs = probe.attributes("default");
        assert!(rule_matches(&probe.marker_rule(), &RuleTarget::of(&attrs)));

        let other = MarkerProbe::new("other").attributes("default");
        assert!(!rule_matches(&probe.marker_rule(), &RuleTarget::of(&other)));
    }

    #[test]
    fn test_classify() {
        let probe = MarkerProbe::new("test-marker");
        let mut decision = Decision::default();
        assert_eq!(probe.classify(&Ok(decision.clone())), Readiness::Pending);

        decision.denial = Some(Denial {
            policy: "p".to_string(),
            binding: "b".to_string(),
            message: format!("ValidatingAdmissionPolicy 'p' with binding 'b' denied request: {}", MARKER_MESSAGE),
            reason: StatusReason::Invalid,
        });
        assert_eq!(probe.classify(&Ok(decision)), Readiness::Ready);

        let warned = Decision {
            warnings: vec![MARKER_MESSAGE.to_string()],
            ..Default::default()
        };
        assert_eq!(probe.classify(&Ok(warned)), Readiness::Ready);

        assert_eq!(
            probe.classify(&Err(AdmissionError::not_ready("policy cache"))),
            Readiness::NotSynced
        );
    }
}

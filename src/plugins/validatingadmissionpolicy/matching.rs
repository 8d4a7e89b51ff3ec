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

//! Match resolution: decides whether a request falls inside a policy's or
//! binding's `MatchResources`.

use crate::admission::{Attributes, GroupVersionResource, Operation};
use crate::api::admissionregistration::{
    self, MatchPolicy, MatchResources, NamedRuleWithOperations, ScopeType,
};
use crate::api::meta::{self, Labels, LabelSelector};
use crate::cache::{namespace_labels, ResourceCache, ResourceMapper};
use std::sync::Arc;
use thiserror::Error;

/// MatchError means the request could not be matched with the data at hand.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("namespace {0:?} not found in cache")]
    NamespaceNotFound(String),
}

/// The parts of a request that rules are evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct RuleTarget<'a> {
    pub resource: &'a GroupVersionResource,
    pub subresource: &'a str,
    pub operation: Operation,
    pub name: &'a str,
    pub namespaced: bool,
}

impl<'a> RuleTarget<'a> {
    pub fn of(attributes: &'a dyn Attributes) -> Self {
        let resource = attributes.get_resource();
        Self {
            resource,
            subresource: attributes.get_subresource(),
            operation: attributes.get_operation(),
            name: attributes.get_name(),
            namespaced: !attributes.get_namespace().is_empty() && !is_namespace_resource(resource),
        }
    }

    fn with_resource(self, resource: &'a GroupVersionResource) -> Self {
        Self { resource, ..self }
    }
}

fn is_namespace_resource(gvr: &GroupVersionResource) -> bool {
    gvr.group.is_empty() && gvr.resource == "namespaces"
}

fn list_matches(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == "*" || p == value)
}

/// True if `rule` covers the target.
pub fn rule_matches(rule: &NamedRuleWithOperations, target: &RuleTarget<'_>) -> bool {
    if !list_matches(&rule.operations, target.operation.as_str()) {
        return false;
    }
    if !list_matches(&rule.api_groups, &target.resource.group) {
        return false;
    }
    if !list_matches(&rule.api_versions, &target.resource.version) {
        return false;
    }

    let resource = &target.resource.resource;
    let resource_match = rule.resources.iter().any(|r| {
        if r == "*" {
            return target.subresource.is_empty();
        }
        if r == "*/*" {
            return true;
        }
        match r.split_once('/') {
            Some((res, sub)) => {
                (res == "*" || res == resource)
                    && (sub == "*" || sub == target.subresource)
                    && !target.subresource.is_empty()
            }
            None => r == resource && target.subresource.is_empty(),
        }
    });
    if !resource_match {
        return false;
    }

    match rule.scope.unwrap_or_default() {
        ScopeType::Cluster if target.namespaced => return false,
        ScopeType::Namespaced if !target.namespaced => return false,
        _ => {}
    }

    rule.resource_names.is_empty() || rule.resource_names.iter().any(|n| n == target.name)
}

/// Requests against this system's own policy objects are never matched.
pub fn is_exempt(resource: &GroupVersionResource) -> bool {
    (resource.group == admissionregistration::GROUP_NAME
        || resource.group == admissionregistration::UPSTREAM_GROUP_NAME)
        && (resource.resource == admissionregistration::POLICY_RESOURCE
            || resource.resource == admissionregistration::BINDING_RESOURCE)
}

/// Matcher evaluates `MatchResources` against requests, reading namespace
/// labels from the cache and resource equivalence from the mapper.
pub struct Matcher {
    cache: Arc<dyn ResourceCache>,
    mapper: Arc<ResourceMapper>,
}

impl Matcher {
    pub fn new(cache: Arc<dyn ResourceCache>, mapper: Arc<ResourceMapper>) -> Self {
        Self { cache, mapper }
    }

    /// Returns the resource the constraints matched through: the request's
    /// own resource, or an equivalent one under `Equivalent` match policy.
    /// None when the constraints do not cover the request.
    pub fn matches(
        &self,
        constraints: &MatchResources,
        attributes: &dyn Attributes,
    ) -> Result<Option<GroupVersionResource>, MatchError> {
        if !self.selectors_match(constraints, attributes)? {
            return Ok(None);
        }
        Ok(self.rules_match(constraints, attributes))
    }

    fn rules_match(&self, constraints: &MatchResources, attributes: &dyn Attributes) -> Option<GroupVersionResource> {

        let target = RuleTarget::of(attributes);
        if constraints
            .exclude_resource_rules
            .iter()
            .any(|rule| rule_matches(rule, &target))
        {
            return None;
        }

        if constraints.resource_rules.iter().any(|rule| rule_matches(rule, &target)) {
            return Some(target.resource.clone());
        }

        if constraints.effective_match_policy() == MatchPolicy::Equivalent {
            for equivalent in self.mapper.equivalent_resources(target.resource) {
                if &equivalent == target.resource {
                    continue;
                }
                let translated = target.with_resource(&equivalent);
                let excluded = constraints
                    .exclude_resource_rules
                    .iter()
                    .any(|rule| rule_matches(rule, &translated));
                if !excluded
                    && constraints
                        .resource_rules
                        .iter()
                        .any(|rule| rule_matches(rule, &translated))
                {
                    return Some(equivalent);
                }
            }
        }
        None
    }

    fn selectors_match(&self, constraints: &MatchResources, attributes: &dyn Attributes) -> Result<bool, MatchError> {
        if let Some(selector) = &constraints.object_selector {
            if !object_selector_matches(selector, attributes) {
                return Ok(false);
            }
        }
        match &constraints.namespace_selector {
            Some(selector) if !selector.is_empty() => self.namespace_selector_matches(selector, attributes),
            _ => Ok(true),
        }
    }

    /// A namespace missing from the cache is an error rather than an empty
    /// label set, which would satisfy `NotIn` and `DoesNotExist`.
    fn namespace_selector_matches(&self, selector: &LabelSelector, attributes: &dyn Attributes) -> Result<bool, MatchError> {
        let resource = attributes.get_resource();
        if is_namespace_resource(resource) {
            let labels = attributes
                .get_object()
                .or_else(|| attributes.get_old_object())
                .map(meta::object_labels)
                .unwrap_or_default();
            return Ok(selector.matches(&labels));
        }
        let namespace = attributes.get_namespace();
        if namespace.is_empty() {
            // Cluster-scoped objects are not filtered by namespace.
            return Ok(true);
        }
        let labels = namespace_labels(self.cache.as_ref(), namespace)
            .ok_or_else(|| MatchError::NamespaceNotFound(namespace.to_string()))?;
        Ok(selector.matches(&labels))
    }
}

fn object_selector_matches(selector: &LabelSelector, attributes: &dyn Attributes) -> bool {
    if selector.is_empty() {
        return true;
    }
    let labels_of = |object: Option<&serde_json::Value>| -> Option<Labels> { object.map(meta::object_labels) };
    [labels_of(attributes.get_object()), labels_of(attributes.get_old_object())]
        .iter()
        .flatten()
        .any(|labels| selector.matches(labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AttributesRecord, GroupResource, GroupVersionKind};
    use crate::api::meta::LabelSelectorOperator;
    use crate::cache::{InMemoryCache, ResourceMapping};
    use serde_json::json;

    fn deployments(version: &str) -> GroupVersionResource {
        GroupVersionResource::new("apps", version, "deployments")
    }

    fn request(gvr: GroupVersionResource, op: Operation, object: serde_json::Value) -> AttributesRecord {
        let kind = GroupVersionKind::new(&gvr.group, &gvr.version, "Deployment");
        AttributesRecord::new(gvr, kind, op, Some(object), None)
    }

    fn deployment(ns: &str, name: &str, labels: serde_json::Value) -> serde_json::Value {
        json!({"metadata": {"name": name, "namespace": ns, "labels": labels}})
    }

    fn matcher() -> (Arc<InMemoryCache>, Matcher) {
        let cache = Arc::new(InMemoryCache::new());
        let mapper = Arc::new(ResourceMapper::with_builtins());
        for version in ["v1", "v1beta1"] {
            mapper.register(ResourceMapping::new(
                GroupVersionKind::new("apps", version, "Deployment"),
                "deployments",
                true,
            ));
        }
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new("extensions", "v1beta1", "Deployment"),
            "deployments",
            true,
        ));
        mapper.add_equivalence(&[
            GroupResource::new("apps", "deployments"),
            GroupResource::new("extensions", "deployments"),
        ]);
        (cache.clone(), Matcher::new(cache, mapper))
    }

    #[test]
    fn test_rule_wildcards_and_subresources() {
        let gvr = deployments("v1");
        let target = RuleTarget {
            resource: &gvr,
            subresource: "",
            operation: Operation::Create,
            name: "web",
            namespaced: true,
        };
        assert!(rule_matches(&NamedRuleWithOperations::new(&["*"], &["*"], &["*"], &["*"]), &target));
        assert!(rule_matches(
            &NamedRuleWithOperations::new(&["apps"], &["v1"], &["deployments"], &["CREATE"]),
            &target
        ));
        assert!(!rule_matches(
            &NamedRuleWithOperations::new(&["apps"], &["v1"], &["deployments"], &["UPDATE"]),
            &target
        ));
        assert!(!rule_matches(
            &NamedRuleWithOperations::new(&["apps"], &["v1"], &["deployments/scale"], &["*"]),
            &target
        ));

        let scale = RuleTarget {
            subresource: "scale",
            ..target
        };
        assert!(!rule_matches(&NamedRuleWithOperations::new(&["*"], &["*"], &["*"], &["*"]), &scale));
        assert!(rule_matches(&NamedRuleWithOperations::new(&["*"], &["*"], &["*/scale"], &["*"]), &scale));
        assert!(rule_matches(&NamedRuleWithOperations::new(&["*"], &["*"], &["deployments/*"], &["*"]), &scale));
        assert!(rule_matches(&NamedRuleWithOperations::new(&["*"], &["*"], &["*/*"], &["*"]), &scale));

        let named = NamedRuleWithOperations::new(&["*"], &["*"], &["deployments"], &["*"]).with_resource_names(&["db"]);
        assert!(!rule_matches(&named, &target));
        assert!(rule_matches(&named, &RuleTarget { name: "db", ..target }));

        let cluster = NamedRuleWithOperations::new(&["*"], &["*"], &["*"], &["*"]).with_scope(ScopeType::Cluster);
        assert!(!rule_matches(&cluster, &target));
    }

    #[test]
    fn test_exclude_rules_remove_wildcard_matches() {
        let (_, matcher) = matcher();
        let mut constraints = MatchResources::with_rules(vec![NamedRuleWithOperations::new(
            &["*"],
            &["*"],
            &["*"],
            &["*"],
        )]);
        constraints.exclude_resource_rules = vec![NamedRuleWithOperations::new(
            &["apps"],
            &["*"],
            &["deployments"],
            &["*"],
        )];

        let excluded = request(deployments("v1"), Operation::Create, deployment("default", "web", json!({})));
        assert_eq!(matcher.matches(&constraints, &excluded), Ok(None));

        let configmap = AttributesRecord::new(
            GroupVersionResource::new("", "v1", "configmaps"),
            GroupVersionKind::new("", "v1", "ConfigMap"),
            Operation::Create,
            Some(deployment("default", "cfg", json!({}))),
            None,
        );
        assert!(matcher.matches(&constraints, &configmap).unwrap().is_some());
    }

    #[test]
    fn test_match_policy_exact_and_equivalent() {
        let (_, matcher) = matcher();
        let rules = vec![NamedRuleWithOperations::new(&["apps"], &["v1"], &["deployments"], &["*"])];
        let mut constraints = MatchResources::with_rules(rules);

        let beta = request(deployments("v1beta1"), Operation::Create, deployment("default", "web", json!({})));
        assert_eq!(matcher.matches(&constraints, &beta), Ok(Some(deployments("v1"))));

        let legacy = request(
            GroupVersionResource::new("extensions", "v1beta1", "deployments"),
            Operation::Create,
            deployment("default", "web", json!({})),
        );
        assert_eq!(matcher.matches(&constraints, &legacy), Ok(Some(deployments("v1"))));

        constraints.match_policy = Some(MatchPolicy::Exact);
        assert_eq!(matcher.matches(&constraints, &beta), Ok(None));
        let v1 = request(deployments("v1"), Operation::Create, deployment("default", "web", json!({})));
        assert_eq!(matcher.matches(&constraints, &v1), Ok(Some(deployments("v1"))));
    }

    #[test]
    fn test_selectors() {
        let (cache, matcher) = matcher();
        for (name, env) in [("prod", "prod"), ("dev", "dev")] {
            cache.upsert(
                &GroupVersionResource::new("", "v1", "namespaces"),
                json!({"metadata": {"name": name, "labels": {"env": env}}}),
            );
        }
        let mut constraints =
            MatchResources::with_rules(vec![NamedRuleWithOperations::new(&["*"], &["*"], &["*"], &["*"])]);
        constraints.namespace_selector = Some(LabelSelector::with_labels(&[("env", "prod")]));
        constraints.object_selector =
            Some(LabelSelector::default().with_expression("tier", LabelSelectorOperator::In, &["web", "api"]));

        let in_prod = request(deployments("v1"), Operation::Create, deployment("prod", "a", json!({"tier": "web"})));
        assert!(matcher.matches(&constraints, &in_prod).unwrap().is_some());

        let wrong_tier = request(deployments("v1"), Operation::Create, deployment("prod", "a", json!({"tier": "db"})));
        assert!(matcher.matches(&constraints, &wrong_tier).unwrap().is_none());

        let elsewhere = request(deployments("v1"), Operation::Create, deployment("dev", "a", json!({"tier": "web"})));
        assert!(matcher.matches(&constraints, &elsewhere).unwrap().is_none());

        // Namespace requests are matched against their own labels.
        let namespace = AttributesRecord::new(
            GroupVersionResource::new("", "v1", "namespaces"),
            GroupVersionKind::new("", "v1", "Namespace"),
            Operation::Update,
            Some(json!({"metadata": {"name": "other", "labels": {"env": "prod", "tier": "api"}}})),
            None,
        );
        assert!(matcher.matches(&constraints, &namespace).unwrap().is_some());
    }

    #[test]
    fn test_unknown_namespace_is_an_error() {
        let (_, matcher) = matcher();
        let mut constraints =
            MatchResources::with_rules(vec![NamedRuleWithOperations::new(&["*"], &["*"], &["*"], &["*"])]);
        constraints.namespace_selector =
            Some(LabelSelector::default().with_expression("env", LabelSelectorOperator::NotIn, &["prod"]));

        let unknown = request(deployments("v1"), Operation::Create, deployment("ghost", "a", json!({})));
        assert_eq!(
            matcher.matches(&constraints, &unknown),
            Err(MatchError::NamespaceNotFound("ghost".to_string()))
        );
    }

    #[test]
    fn test_self_exemption() {
        assert!(is_exempt(&admissionregistration::policy_gvr()));
        assert!(is_exempt(&admissionregistration::binding_gvr()));
        assert!(is_exempt(&GroupVersionResource::new(
            admissionregistration::UPSTREAM_GROUP_NAME,
            "v1",
            admissionregistration::BINDING_RESOURCE
        )));
        assert!(!is_exempt(&deployments("v1")));
    }
}

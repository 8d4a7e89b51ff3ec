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

//! Keeps the policy and binding index in step with the cache and publishes
//! type-checking status for policies.

use super::dispatcher::{BoundPolicy, Evaluator, PolicySource};
use super::Collaborators;
use crate::admission::{GroupVersionKind, GroupVersionResource};
use crate::api::admissionregistration::{
    self, ExpressionWarning, TypeChecking, ValidatingAdmissionPolicy,
    ValidatingAdmissionPolicyBinding, ValidatingAdmissionPolicyStatus,
};
use crate::api::meta;
use crate::cache::{CacheEvent, ResourceCache, ResourceMapper, StatusPublisher};
use crate::cel::{ExpressionCache, ResultKind, TypeEnv};
use crate::config::EngineConfig;
use crate::controller::{spawn_workers, wait_for_cache_sync, ExponentialBackoff, ReconcileError, Reconciler, WorkQueue};
use crate::schema::{SchemaResolver, Structural};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Work item of the policy controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyKey {
    Policy(String),
    Binding(String),
}

impl PolicyKey {
    /// Key for a cache event, if the event concerns policies or bindings.
    pub fn for_event(event: &CacheEvent) -> Option<Self> {
        if !is_policy_group(&event.gvr) {
            return None;
        }
        match event.gvr.resource.as_str() {
            admissionregistration::POLICY_RESOURCE => Some(PolicyKey::Policy(event.key.name.clone())),
            admissionregistration::BINDING_RESOURCE => Some(PolicyKey::Binding(event.key.name.clone())),
            _ => None,
        }
    }
}

fn is_policy_group(gvr: &GroupVersionResource) -> bool {
    gvr.group == admissionregistration::GROUP_NAME
}

/// PolicyIndex holds the decoded policies and bindings the dispatcher reads.
#[derive(Default)]
pub struct PolicyIndex {
    policies: DashMap<String, Arc<ValidatingAdmissionPolicy>>,
    bindings: DashMap<String, Arc<ValidatingAdmissionPolicyBinding>>,
    synced: AtomicBool,
}

impl PolicyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(&self, name: &str) -> Option<Arc<ValidatingAdmissionPolicy>> {
        self.policies.get(name).map(|p| p.clone())
    }

    pub fn binding(&self, name: &str) -> Option<Arc<ValidatingAdmissionPolicyBinding>> {
        self.bindings.get(name).map(|b| b.clone())
    }

    pub fn upsert_policy(&self, policy: ValidatingAdmissionPolicy) {
        self.policies.insert(policy.name().to_string(), Arc::new(policy));
    }

    pub fn remove_policy(&self, name: &str) -> Option<Arc<ValidatingAdmissionPolicy>> {
        self.policies.remove(name).map(|(_, p)| p)
    }

    pub fn upsert_binding(&self, binding: ValidatingAdmissionPolicyBinding) {
        self.bindings.insert(binding.name().to_string(), Arc::new(binding));
    }

    pub fn remove_binding(&self, name: &str) -> Option<Arc<ValidatingAdmissionPolicyBinding>> {
        self.bindings.remove(name).map(|(_, b)| b)
    }

    /// Called once every policy and binding in the cache has been reconciled.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// True if any indexed policy declares `source`.
    pub fn references(&self, source: &str) -> bool {
        self.policies.iter().any(|entry| {
            let spec = &entry.value().spec;
            spec.validations.iter().any(|v| v.expression == source)
                || spec.audit_annotations.iter().any(|a| a.value_expression == source)
        })
    }
}

impl PolicySource for PolicyIndex {
    /// Bindings ordered by name, each joined to its policy. Bindings whose
    /// policy is not indexed are left out.
    fn bound_policies(&self) -> Vec<Arc<BoundPolicy>> {
        let mut bindings: Vec<Arc<ValidatingAdmissionPolicyBinding>> =
            self.bindings.iter().map(|entry| entry.value().clone()).collect();
        bindings.sort_by(|a, b| a.name().cmp(b.name()));
        bindings
            .into_iter()
            .filter_map(|binding| {
                let policy = self.policy(&binding.spec.policy_name)?;
                Some(Arc::new(BoundPolicy::new(policy, binding, Evaluator::Expressions)))
            })
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// PolicyController reconciles policies and bindings from the cache.
pub struct PolicyController {
    cache: Arc<dyn ResourceCache>,
    mapper: Arc<ResourceMapper>,
    schemas: Arc<dyn SchemaResolver>,
    status: Arc<dyn StatusPublisher>,
    expressions: Arc<ExpressionCache>,
    index: Arc<PolicyIndex>,
    published: DashMap<String, ValidatingAdmissionPolicyStatus>,
    max_type_check_kinds: usize,
    workers: usize,
    backoff: ExponentialBackoff,
}

impl PolicyController {
    pub fn new(collaborators: &Collaborators, index: Arc<PolicyIndex>, config: &EngineConfig) -> Self {
        Self {
            cache: collaborators.cache.clone(),
            mapper: collaborators.mapper.clone(),
            schemas: collaborators.schemas.clone(),
            status: collaborators.status.clone(),
            expressions: collaborators.expressions.clone(),
            index,
            published: DashMap::new(),
            max_type_check_kinds: config.max_type_check_kinds,
            workers: config.workers,
            backoff: config.backoff(),
        }
    }

    pub fn index(&self) -> &Arc<PolicyIndex> {
        &self.index
    }

    /// Reconcile every policy and binding in the cache, dropping index
    /// entries whose objects are gone, then mark the index synced. Returns
    /// the keys that failed transiently.
    pub fn sync_all(&self) -> Vec<PolicyKey> {
        let mut retry = Vec::new();
        for key in self.all_keys() {
            if let Err(err) = self.reconcile(&key) {
                warn!(key = ?key, error = %err, "initial sync failed");
                if err.is_transient() {
                    retry.push(key);
                }
            }
        }
        self.index.mark_synced();
        retry
    }

    fn all_keys(&self) -> Vec<PolicyKey> {
        let mut keys: Vec<PolicyKey> = Vec::new();
        let mut policies: HashSet<String> = self.index.policies.iter().map(|e| e.key().clone()).collect();
        let mut bindings: HashSet<String> = self.index.bindings.iter().map(|e| e.key().clone()).collect();
        for object in self.cache.list(&admissionregistration::policy_gvr(), None) {
            policies.insert(meta::object_name(&object).to_string());
        }
        for object in self.cache.list(&admissionregistration::binding_gvr(), None) {
            bindings.insert(meta::object_name(&object).to_string());
        }
        keys.extend(policies.into_iter().map(PolicyKey::Policy));
        keys.extend(bindings.into_iter().map(PolicyKey::Binding));
        keys
    }

    /// Load the index once the cache has synced, then drain cache events
    /// into a work queue until the event stream closes.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<CacheEvent>) {
        wait_for_cache_sync(self.cache.as_ref()).await;
        let queue = WorkQueue::new(self.backoff);
        for key in self.sync_all() {
            queue.add_rate_limited(key);
        }
        info!("policy index synced");
        let handles = spawn_workers(queue.clone(), self.clone(), self.workers);
        while let Some(event) = events.recv().await {
            if let Some(key) = PolicyKey::for_event(&event) {
                queue.add(key);
            }
        }
        queue.shut_down();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "policy worker exited abnormally");
            }
        }
    }

    fn sync_policy(&self, name: &str) -> Result<(), ReconcileError> {
        let object = match self.cache.get(&admissionregistration::policy_gvr(), "", name) {
            Some(object) => object,
            None => {
                if let Some(removed) = self.index.remove_policy(name) {
                    info!(policy = name, "policy removed");
                    self.forget_expressions(&removed);
                }
                self.published.remove(name);
                return Ok(());
            }
        };

        let policy = ValidatingAdmissionPolicy::from_value(&object)
            .and_then(|policy| policy.validate().map(|_| policy))
            .map_err(|err| {
                // An object that no longer decodes stops being enforced.
                self.index.remove_policy(name);
                ReconcileError::Permanent(err.to_string())
            })?;

        let status = ValidatingAdmissionPolicyStatus {
            observed_generation: policy.metadata.generation,
            type_checking: Some(self.type_check(&policy)),
        };
        debug!(policy = name, generation = policy.metadata.generation, "policy synced");
        self.index.upsert_policy(policy);

        let changed = self.published.get(name).map_or(true, |previous| *previous != status);
        if changed {
            self.status.publish_policy_status(name, status.clone());
            self.published.insert(name.to_string(), status);
        }
        Ok(())
    }

    fn sync_binding(&self, name: &str) -> Result<(), ReconcileError> {
        let object = match self.cache.get(&admissionregistration::binding_gvr(), "", name) {
            Some(object) => object,
            None => {
                if self.index.remove_binding(name).is_some() {
                    info!(binding = name, "binding removed");
                }
                return Ok(());
            }
        };
        let binding = ValidatingAdmissionPolicyBinding::from_value(&object)
            .and_then(|binding| binding.validate().map(|_| binding))
            .map_err(|err| {
                self.index.remove_binding(name);
                ReconcileError::Permanent(err.to_string())
            })?;
        debug!(binding = name, policy = %binding.spec.policy_name, "binding synced");
        self.index.upsert_binding(binding);
        Ok(())
    }

    fn forget_expressions(&self, removed: &ValidatingAdmissionPolicy) {
        let sources: HashSet<&str> = removed
            .spec
            .validations
            .iter()
            .map(|v| v.expression.as_str())
            .chain(removed.spec.audit_annotations.iter().map(|a| a.value_expression.as_str()))
            .collect();
        self.expressions
            .retain_sources(|source| !sources.contains(source) || self.index.references(source));
    }

    /// Check every expression against the schemas of the kinds the policy
    /// matches, falling back to an untyped object when none resolve.
    fn type_check(&self, policy: &ValidatingAdmissionPolicy) -> TypeChecking {
        let params = policy
            .spec
            .param_kind
            .as_ref()
            .and_then(|kind| self.schemas.resolve(&kind.gvk()).ok());
        let kinds = self.matched_kinds(policy);
        let envs: Vec<(Option<GroupVersionKind>, TypeEnv)> = if kinds.is_empty() {
            vec![(None, TypeEnv::new(None, params))]
        } else {
            kinds
                .into_iter()
                .map(|(gvk, schema)| (Some(gvk), TypeEnv::new(Some(schema), params.clone())))
                .collect()
        };

        let mut warnings = Vec::new();
        let spec = &policy.spec;
        let expressions = spec
            .validations
            .iter()
            .enumerate()
            .map(|(i, v)| {
                (format!("spec.validations[{}].expression", i), v.expression.as_str(), ResultKind::Bool)
            })
            .chain(spec.audit_annotations.iter().enumerate().map(|(i, a)| {
                (
                    format!("spec.auditAnnotations[{}].valueExpression", i),
                    a.value_expression.as_str(),
                    ResultKind::String,
                )
            }));
        for (field_ref, source, result) in expressions {
            let mut lines = Vec::new();
            for (gvk, env) in &envs {
                let found = match self.expressions.compile(source, env, result) {
                    Ok(compiled) => compiled.warnings().to_vec(),
                    Err(err) => vec![err.to_string()],
                };
                for warning in found {
                    match gvk {
                        Some(gvk) => lines.push(format!("{}: {}", gvk, warning)),
                        None => lines.push(warning),
                    }
                }
            }
            if !lines.is_empty() {
                warnings.push(ExpressionWarning {
                    field_ref,
                    warning: lines.join("\n"),
                });
            }
        }
        TypeChecking {
            expression_warnings: warnings,
        }
    }

    /// Concrete kinds named by the policy's resource rules that have a schema.
    fn matched_kinds(&self, policy: &ValidatingAdmissionPolicy) -> Vec<(GroupVersionKind, Arc<Structural>)> {
        let rules = match &policy.spec.match_constraints {
            Some(constraints) => &constraints.resource_rules,
            None => return Vec::new(),
        };
        let mut seen = HashSet::new();
        let mut kinds = Vec::new();
        for rule in rules {
            for group in &rule.api_groups {
                for version in &rule.api_versions {
                    for resource in &rule.resources {
                        if kinds.len() >= self.max_type_check_kinds {
                            return kinds;
                        }
                        let resource = resource.split('/').next().unwrap_or_default();
                        if group == "*" || version == "*" || resource == "*" {
                            continue;
                        }
                        let gvr = GroupVersionResource::new(group, version, resource);
                        let gvk = match self.mapper.kind_for(&gvr) {
                            Some(gvk) => gvk,
                            None => continue,
                        };
                        if !seen.insert(gvk.clone()) {
                            continue;
                        }
                        if let Ok(schema) = self.schemas.resolve(&gvk) {
                            kinds.push((gvk, schema));
                        }
                    }
                }
            }
        }
        kinds
    }
}

impl Reconciler<PolicyKey> for PolicyController {
    fn reconcile(&self, key: &PolicyKey) -> Result<(), ReconcileError> {
        match key {
            PolicyKey::Policy(name) => self.sync_policy(name),
            PolicyKey::Binding(name) => self.sync_binding(name),
        }
    }
}

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

//! PolicyTemplate materialization.
//!
//! A template moves from Pending to Active once the schema of its generated
//! kind resolves; the CRD is applied and instances of the kind start being
//! enforced. Each instance becomes one bound policy, stored in a table per
//! generated resource. Deleting the template removes the CRD and every
//! instance registration.

pub mod behavior;
pub mod crd;

pub use behavior::{required_labels, DecisionError, Violation};
pub use crd::{generate_crd, CrdClient, InMemoryCrdClient};

use crate::admission::{AttributesRecord, GroupVersionKind, GroupVersionResource, Operation};
use crate::api::admissionregistration::{
    FailurePolicy, ValidatingAdmissionPolicy, ValidatingAdmissionPolicyBinding,
    ValidatingAdmissionPolicySpec,
};
use crate::api::meta::{self, ObjectKey};
use crate::api::templates::{
    self, InstanceScope, PolicyTemplate, PolicyTemplateStatus, TemplateBehavior, TemplateInstance,
    TemplatePhase,
};
use crate::cache::{CacheEvent, ResourceCache, ResourceMapper, ResourceMapping, StatusPublisher};
use crate::config::EngineConfig;
use crate::controller::{
    spawn_workers, wait_for_cache_sync, ExponentialBackoff, ReconcileError, Reconciler, WorkQueue,
};
use crate::plugins::validatingadmissionpolicy::{
    BoundPolicy, Collaborators, Dispatcher, Evaluator, PolicySource,
};
use crate::schema::{SchemaError, SchemaResolver};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

/// Violation message for instances whose match could not be decided.
pub const UNRESOLVED_MATCH_MESSAGE: &str = "failed to match request";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("decoding {kind} {name:?}: {message}")]
    Decode {
        kind: String,
        name: String,
        message: String,
    },

    #[error("schema of template {template:?}: {source}")]
    Schema {
        template: String,
        #[source]
        source: SchemaError,
    },

    #[error("CustomResourceDefinition {name:?}: {message}")]
    Crd { name: String, message: String },

    #[error("instance {name:?}: {message}")]
    InvalidInstance { name: String, message: String },
}

impl TemplateError {
    pub fn is_transient(&self) -> bool {
        match self {
            TemplateError::Schema { source, .. } => source.is_transient(),
            TemplateError::Crd { .. } => true,
            _ => false,
        }
    }
}

impl From<TemplateError> for ReconcileError {
    fn from(err: TemplateError) -> Self {
        if err.is_transient() {
            ReconcileError::Transient(err.to_string())
        } else {
            ReconcileError::Permanent(err.to_string())
        }
    }
}

type InstanceTable = Arc<RwLock<BTreeMap<ObjectKey, Arc<BoundPolicy>>>>;

struct ActiveTemplate {
    template: Arc<PolicyTemplate>,
    resource: GroupVersionResource,
}

/// TemplateRegistry holds active templates and the bound policy of every
/// instance, one table per generated resource.
#[derive(Default)]
pub struct TemplateRegistry {
    templates: DashMap<String, ActiveTemplate>,
    instances: DashMap<GroupVersionResource, InstanceTable>,
    synced: AtomicBool,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once every template in the cache has been reconciled.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    pub fn is_active(&self, template: &str) -> bool {
        self.templates.contains_key(template)
    }

    /// Number of instances registered for a template.
    pub fn instance_count(&self, template: &str) -> usize {
        self.templates
            .get(template)
            .and_then(|active| self.instances.get(&active.resource).map(|table| table.read().len()))
            .unwrap_or(0)
    }

    /// The active template whose generated resource is `resource`.
    pub fn template_for(&self, resource: &GroupVersionResource) -> Option<Arc<PolicyTemplate>> {
        self.templates
            .iter()
            .find(|entry| &entry.value().resource == resource)
            .map(|entry| entry.value().template.clone())
    }

    fn activate(&self, template: Arc<PolicyTemplate>) {
        let resource = template.instance_gvr();
        self.instances
            .entry(resource.clone())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())));
        self.templates
            .insert(template.name().to_string(), ActiveTemplate { template, resource });
    }

    fn deactivate(&self, template: &str) -> Option<Arc<PolicyTemplate>> {
        let (_, active) = self.templates.remove(template)?;
        self.instances.remove(&active.resource);
        Some(active.template)
    }

    fn table(&self, resource: &GroupVersionResource) -> Option<InstanceTable> {
        self.instances.get(resource).map(|table| table.clone())
    }

    fn insert_instance(&self, resource: &GroupVersionResource, key: ObjectKey, bound: Arc<BoundPolicy>) {
        if let Some(table) = self.table(resource) {
            table.write().insert(key, bound);
        }
    }

    fn remove_instance(&self, resource: &GroupVersionResource, key: &ObjectKey) -> bool {
        self.table(resource)
            .map_or(false, |table| table.write().remove(key).is_some())
    }

    fn instance_keys(&self, resource: &GroupVersionResource) -> Vec<ObjectKey> {
        self.table(resource)
            .map(|table| table.read().keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl PolicySource for TemplateRegistry {
    /// Instances ordered by template name, then by instance key.
    fn bound_policies(&self) -> Vec<Arc<BoundPolicy>> {
        let mut active: Vec<(String, GroupVersionResource)> = self
            .templates
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().resource.clone()))
            .collect();
        active.sort();
        active
            .into_iter()
            .filter_map(|(_, resource)| self.table(&resource))
            .flat_map(|table| table.read().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Work item of the template controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateKey {
    Template(String),
    Instance {
        resource: GroupVersionResource,
        key: ObjectKey,
    },
}

/// TemplateController drives templates through their lifecycle and keeps
/// the instance registrations current.
pub struct TemplateController {
    cache: Arc<dyn ResourceCache>,
    mapper: Arc<ResourceMapper>,
    schemas: Arc<dyn SchemaResolver>,
    status: Arc<dyn StatusPublisher>,
    crds: Arc<dyn CrdClient>,
    registry: Arc<TemplateRegistry>,
    dispatcher: Dispatcher,
    workers: usize,
    backoff: ExponentialBackoff,
}

impl TemplateController {
    pub fn new(
        collaborators: &Collaborators,
        crds: Arc<dyn CrdClient>,
        registry: Arc<TemplateRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            cache: collaborators.cache.clone(),
            mapper: collaborators.mapper.clone(),
            schemas: collaborators.schemas.clone(),
            status: collaborators.status.clone(),
            crds,
            registry,
            dispatcher: Dispatcher::new(collaborators, config),
            workers: config.workers,
            backoff: config.backoff(),
        }
    }

    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Key for a cache event, if it concerns a template or an instance of an
    /// active template.
    pub fn key_for(&self, event: &CacheEvent) -> Option<TemplateKey> {
        if event.gvr.group == templates::GROUP_NAME && event.gvr.resource == templates::TEMPLATE_RESOURCE {
            return Some(TemplateKey::Template(event.key.name.clone()));
        }
        self.registry.template_for(&event.gvr).map(|_| TemplateKey::Instance {
            resource: event.gvr.clone(),
            key: event.key.clone(),
        })
    }

    /// Reconcile every template in the cache together with its instances,
    /// then mark the registry synced. Returns the keys that failed
    /// transiently.
    pub fn sync_all(&self) -> Vec<TemplateKey> {
        let mut names: BTreeSet<String> = self
            .cache
            .list(&templates::template_gvr(), None)
            .iter()
            .map(|object| meta::object_name(object).to_string())
            .collect();
        names.extend(self.registry.templates.iter().map(|entry| entry.key().clone()));

        let mut retry = Vec::new();
        for name in names {
            let key = TemplateKey::Template(name);
            if let Err(err) = self.reconcile(&key) {
                warn!(key = ?key, error = %err, "initial sync failed");
                if err.is_transient() {
                    retry.push(key);
                }
            }
        }
        self.registry.mark_synced();
        retry
    }

    /// Load the registry once the cache has synced, then drain cache events
    /// into a work queue until the event stream closes.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<CacheEvent>) {
        wait_for_cache_sync(self.cache.as_ref()).await;
        let queue = WorkQueue::new(self.backoff);
        for key in self.sync_all() {
            queue.add_rate_limited(key);
        }
        info!(templates = self.registry.templates.len(), "template registry synced");
        let handles = spawn_workers(queue.clone(), self.clone(), self.workers);
        while let Some(event) = events.recv().await {
            if let Some(key) = self.key_for(&event) {
                queue.add(key);
            }
        }
        queue.shut_down();
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "template worker exited abnormally");
            }
        }
    }

    /// Run only the label requirements of template instances that cover the
    /// request, matched the way admission matches them. Violations of all
    /// instances are merged into one report.
    pub fn validate_instances(
        &self,
        resource: &GroupVersionResource,
        old: Option<&Value>,
        object: Option<&Value>,
    ) -> Result<(), DecisionError> {
        let current = match object.or(old) {
            Some(current) => current,
            None => return Ok(()),
        };
        let operation = match (old, object) {
            (None, _) => Operation::Create,
            (Some(_), None) => Operation::Delete,
            (Some(_), Some(_)) => Operation::Update,
        };
        let kind = self
            .mapper
            .kind_for(resource)
            .unwrap_or_else(|| GroupVersionKind::new(&resource.group, &resource.version, ""));
        let attributes = AttributesRecord::new(resource.clone(), kind, operation, object.cloned(), old.cloned());
        let labels = meta::object_labels(current);
        let sources = [self.registry.clone() as Arc<dyn PolicySource>];

        let mut missing = BTreeSet::new();
        let mut invalid = BTreeSet::new();
        let mut unresolved = BTreeSet::new();
        for matched in self.dispatcher.resolve(&sources, &attributes) {
            let required = match &matched.bound.evaluator {
                Evaluator::RequiredLabels(required) => required,
                _ => continue,
            };
            if let Some(err) = &matched.unresolved {
                if matched.bound.policy.failure_policy() == FailurePolicy::Fail {
                    unresolved.insert(err.to_string());
                }
                continue;
            }
            if let Some(err) = required_labels(required, &labels) {
                for violation in err.violations {
                    let into = if violation.message == behavior::MISSING_LABELS_MESSAGE {
                        &mut missing
                    } else {
                        &mut invalid
                    };
                    into.extend(violation.details.data);
                }
            }
        }

        let mut err = DecisionError::default();
        for (message, data) in [
            (behavior::MISSING_LABELS_MESSAGE, missing),
            (behavior::INVALID_LABELS_MESSAGE, invalid),
            (UNRESOLVED_MATCH_MESSAGE, unresolved),
        ] {
            if !data.is_empty() {
                err.violations.push(Violation::new(message, data.into_iter().collect()));
            }
        }
        if err.is_empty() {
            Ok(())
        } else {
            Err(err)
        }
    }

    fn publish(&self, template: &str, phase: TemplatePhase, message: String, generation: i64) {
        self.status.publish_template_status(
            template,
            PolicyTemplateStatus {
                phase,
                message,
                observed_generation: generation,
            },
        );
    }

    fn sync_template(&self, name: &str) -> Result<(), ReconcileError> {
        let object = match self.cache.get(&templates::template_gvr(), "", name) {
            Some(object) => object,
            None => {
                self.teardown(name)?;
                return Ok(());
            }
        };

        let template: PolicyTemplate = match serde_json::from_value(object.as_ref().clone()) {
            Ok(template) => template,
            Err(err) => {
                let err = TemplateError::Decode {
                    kind: templates::TEMPLATE_KIND.to_string(),
                    name: name.to_string(),
                    message: err.to_string(),
                };
                self.publish(name, TemplatePhase::Pending, err.to_string(), 0);
                return Err(err.into());
            }
        };
        let generation = template.metadata.generation;

        // A template that changed its generated kind leaves the old kind behind.
        if let Some(previous) = self.registry.templates.get(name).map(|a| a.template.clone()) {
            if previous.instance_gvr() != template.instance_gvr() {
                self.teardown(name)?;
            }
        }

        let definition = generate_crd(&template);
        if let Err(source) = self.schemas.resolve_crd(&definition) {
            let err = TemplateError::Schema {
                template: name.to_string(),
                source,
            };
            self.publish(name, TemplatePhase::Pending, err.to_string(), generation);
            return Err(err.into());
        }
        self.crds.apply(definition)?;
        self.mapper.register(ResourceMapping::new(
            template.instance_gvk(),
            &template.spec.names.plural,
            template.spec.scope == InstanceScope::Namespaced,
        ));

        let template = Arc::new(template);
        let resource = template.instance_gvr();
        self.registry.activate(template.clone());
        self.sync_instances(&template, &resource);
        info!(
            template = name,
            kind = %template.instance_gvk(),
            instances = self.registry.instance_count(name),
            "template active"
        );
        self.publish(name, TemplatePhase::Active, String::new(), generation);
        Ok(())
    }

    /// Rebuild every instance of a freshly activated template.
    fn sync_instances(&self, template: &PolicyTemplate, resource: &GroupVersionResource) {
        let mut present = BTreeSet::new();
        for object in self.cache.list(resource, None) {
            let key = ObjectKey::of(&object);
            match self.upsert_instance(template, resource, key.clone(), &object) {
                Ok(()) => {
                    present.insert(key);
                }
                Err(err) => warn!(template = template.name(), instance = %key, error = %err, "skipping instance"),
            }
        }
        for key in self.registry.instance_keys(resource) {
            if !present.contains(&key) {
                self.registry.remove_instance(resource, &key);
            }
        }
    }

    fn teardown(&self, name: &str) -> Result<(), ReconcileError> {
        let template = match self.registry.deactivate(name) {
            Some(template) => template,
            None => return Ok(()),
        };
        self.mapper.unregister(&template.instance_gvk());
        self.crds.delete(&template.crd_name())?;
        info!(template = name, "template removed");
        self.publish(
            name,
            TemplatePhase::Removed,
            String::new(),
            template.metadata.generation,
        );
        Ok(())
    }

    fn sync_instance(&self, resource: &GroupVersionResource, key: &ObjectKey) -> Result<(), ReconcileError> {
        let template = match self.registry.template_for(resource) {
            Some(template) => template,
            None => return Ok(()),
        };
        match self.cache.get(resource, &key.namespace, &key.name) {
            Some(object) => {
                if let Err(err) = self.upsert_instance(&template, resource, key.clone(), &object) {
                    self.registry.remove_instance(resource, key);
                    return Err(err.into());
                }
                Ok(())
            }
            None => {
                if self.registry.remove_instance(resource, key) {
                    debug!(template = template.name(), instance = %key, "instance removed");
                }
                Ok(())
            }
        }
    }

    /// Register or replace the bound policy of one instance.
    fn upsert_instance(
        &self,
        template: &PolicyTemplate,
        resource: &GroupVersionResource,
        key: ObjectKey,
        object: &Arc<Value>,
    ) -> Result<(), TemplateError> {
        let instance: TemplateInstance =
            serde_json::from_value(object.as_ref().clone()).map_err(|err| TemplateError::Decode {
                kind: template.spec.names.kind.clone(),
                name: key.to_string(),
                message: err.to_string(),
            })?;
        let bound = instance_policy(template, &key, &instance, object.clone())?;
        self.registry.insert_instance(resource, key, Arc::new(bound));
        Ok(())
    }
}

/// The policy and binding an instance stands for. The policy is named after
/// the template and the binding after the instance.
fn instance_policy(
    template: &PolicyTemplate,
    key: &ObjectKey,
    instance: &TemplateInstance,
    object: Arc<Value>,
) -> Result<BoundPolicy, TemplateError> {
    let (validations, failure_policy, evaluator) = match &template.spec.behavior {
        TemplateBehavior::RequiredLabels => {
            (Vec::new(), None, Evaluator::RequiredLabels(instance.required_labels()))
        }
        TemplateBehavior::Validations {
            validations,
            failure_policy,
        } => (validations.clone(), *failure_policy, Evaluator::InlineParams(object)),
    };
    let policy = ValidatingAdmissionPolicy::new(
        template.name(),
        ValidatingAdmissionPolicySpec {
            match_constraints: Some(instance.spec.match_resources.clone()),
            validations,
            failure_policy,
            ..Default::default()
        },
    );
    let binding = ValidatingAdmissionPolicyBinding::new(
        &format!("{}/{}", template.spec.names.plural, key),
        template.name(),
        &instance.spec.validation_actions,
    );
    binding.validate().map_err(|err| TemplateError::InvalidInstance {
        name: key.to_string(),
        message: err.to_string(),
    })?;
    Ok(BoundPolicy::new(Arc::new(policy), Arc::new(binding), evaluator))
}

impl Reconciler<TemplateKey> for TemplateController {
    fn reconcile(&self, key: &TemplateKey) -> Result<(), ReconcileError> {
        match key {
            TemplateKey::Template(name) => self.sync_template(name),
            TemplateKey::Instance { resource, key } => self.sync_instance(resource, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ValidationInterface;
    use crate::api::admissionregistration::Validation;
    use crate::api::meta::ObjectMeta;
    use crate::api::templates::{PolicyTemplateSpec, TemplateNames};
    use crate::cache::{InMemoryCache, InMemoryStatusPublisher};
    use crate::plugins::validatingadmissionpolicy::{Plugin, Verdict};
    use crate::schema::InMemorySchemaResolver;
    use serde_json::json;
    use std::time::Duration;

    const GROUP: &str = "templates.example.com";

    struct Env {
        cache: Arc<InMemoryCache>,
        mapper: Arc<ResourceMapper>,
        status: Arc<InMemoryStatusPublisher>,
        crds: Arc<InMemoryCrdClient>,
        controller: Arc<TemplateController>,
        plugin: Plugin,
    }

    fn env() -> Env {
        let env = unsynced();
        env.cache.mark_synced();
        env.controller.sync_all();
        env.plugin.controller().sync_all();
        env
    }

    fn unsynced() -> Env {
        let cache = Arc::new(InMemoryCache::new());
        let mapper = Arc::new(ResourceMapper::with_builtins());
        let status = Arc::new(InMemoryStatusPublisher::new());
        let crds = Arc::new(InMemoryCrdClient::new());
        let registry = Arc::new(TemplateRegistry::new());
        let collaborators = Collaborators::new(cache.clone(), mapper.clone())
            .with_schemas(Arc::new(InMemorySchemaResolver::new()))
            .with_status(status.clone())
            .with_source(registry.clone());
        let config = EngineConfig::default();
        let controller = Arc::new(TemplateController::new(&collaborators, crds.clone(), registry, &config));
        let plugin = Plugin::new(collaborators, config);
        Env {
            cache,
            mapper,
            status,
            crds,
            controller,
            plugin,
        }
    }

    fn template(name: &str, kind: &str, plural: &str, behavior: TemplateBehavior, schema: Value) -> PolicyTemplate {
        PolicyTemplate {
            metadata: ObjectMeta::named(name),
            spec: PolicyTemplateSpec {
                group: GROUP.to_string(),
                version: "v1".to_string(),
                names: TemplateNames {
                    kind: kind.to_string(),
                    plural: plural.to_string(),
                    singular: String::new(),
                },
                scope: InstanceScope::Namespaced,
                schema,
                behavior,
            },
            status: None,
        }
    }

    fn required_labels_template() -> PolicyTemplate {
        template(
            "requiredlabels",
            "RequiredLabel",
            "requiredlabels",
            TemplateBehavior::RequiredLabels,
            Value::Null,
        )
    }

    fn instances() -> GroupVersionResource {
        GroupVersionResource::new(GROUP, "v1", "requiredlabels")
    }

    fn configmap_rules() -> Value {
        json!({"resourceRules": [{
            "apiGroups": [""], "apiVersions": ["v1"], "resources": ["configmaps"], "operations": ["CREATE"],
        }]})
    }

    fn labels_instance(name: &str, labels: Value) -> Value {
        json!({
            "apiVersion": format!("{}/v1", GROUP),
            "kind": "RequiredLabel",
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"requiredLabels": labels, "matchResources": configmap_rules()},
        })
    }

    fn configmap(labels: Value) -> Value {
        json!({"metadata": {"name": "cfg", "namespace": "default", "labels": labels}})
    }

    fn create(object: Value) -> AttributesRecord {
        AttributesRecord::new(
            GroupVersionResource::new("", "v1", "configmaps"),
            GroupVersionKind::new("", "v1", "ConfigMap"),
            Operation::Create,
            Some(object),
            None,
        )
        .with_namespace("default")
        .with_name("cfg")
    }

    impl Env {
        fn apply_template(&self, template: &PolicyTemplate) -> Result<(), ReconcileError> {
            self.cache
                .upsert(&templates::template_gvr(), serde_json::to_value(template).unwrap());
            self.controller
                .reconcile(&TemplateKey::Template(template.name().to_string()))
        }

        fn apply_instance(&self, object: Value) {
            let key = self.cache.upsert(&instances(), object);
            self.controller
                .reconcile(&TemplateKey::Instance {
                    resource: instances(),
                    key,
                })
                .unwrap();
        }
    }

    #[test]
    fn test_template_becomes_active() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();

        let status = env.status.template_status("requiredlabels").unwrap();
        assert_eq!(status.phase, TemplatePhase::Active);
        assert_eq!(env.crds.names(), vec!["requiredlabels.templates.example.com"]);
        assert_eq!(
            env.mapper.resource_for(&GroupVersionKind::new(GROUP, "v1", "RequiredLabel")),
            Some(instances())
        );
    }

    #[test]
    fn test_required_labels_decisions() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        env.apply_instance(labels_instance("prod", json!({"ssh": "enabled", "env": "prod"})));

        let configmaps = GroupVersionResource::new("", "v1", "configmaps");
        let ok = configmap(json!({"ssh": "enabled", "env": "prod", "verified": "true"}));
        assert_eq!(env.controller.validate_instances(&configmaps, None, Some(&ok)), Ok(()));

        let cases = [
            (json!({"ssh": "enabled", "env": "invalid_value", "verified": "true"}),
             r#"[{"message":"invalid values provided on one or more labels","details":{"data":["env"]}}]"#),
            (json!({"env": "prod", "verified": "true"}),
             r#"[{"message":"missing one or more required labels","details":{"data":["ssh"]}}]"#),
            (json!({"env": "incorrect", "verified": "true"}),
             r#"[{"message":"missing one or more required labels","details":{"data":["ssh"]}},{"message":"invalid values provided on one or more labels","details":{"data":["env"]}}]"#),
        ];
        for (labels, expected) in cases {
            let object = configmap(labels);
            let err = env
                .controller
                .validate_instances(&configmaps, None, Some(&object))
                .unwrap_err();
            assert_eq!(err.error_json().unwrap(), expected);

            let denied = env.plugin.validate(&create(object)).unwrap_err();
            assert!(denied.to_string().ends_with(&format!(
                "ValidatingAdmissionPolicy 'requiredlabels' with binding 'requiredlabels/default/prod' denied request: {}",
                expected
            )));
        }

        assert!(env.plugin.validate(&create(ok)).is_ok());
    }

    #[test]
    fn test_validate_instances_honors_selectors() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        let mut instance = labels_instance("web", json!({"ssh": "enabled"}));
        instance["spec"]["matchResources"]["objectSelector"] = json!({"matchLabels": {"tier": "web"}});
        env.apply_instance(instance);

        let configmaps = GroupVersionResource::new("", "v1", "configmaps");
        let db = configmap(json!({"tier": "db"}));
        assert_eq!(env.controller.validate_instances(&configmaps, None, Some(&db)), Ok(()));
        assert!(env.plugin.validate(&create(db)).is_ok());

        let web = configmap(json!({"tier": "web"}));
        let err = env
            .controller
            .validate_instances(&configmaps, None, Some(&web))
            .unwrap_err();
        assert_eq!(err.violations[0].message, behavior::MISSING_LABELS_MESSAGE);
        assert!(env.plugin.validate(&create(web)).is_err());

        let secrets = GroupVersionResource::new("", "v1", "secrets");
        let secret = configmap(json!({"tier": "web"}));
        assert_eq!(env.controller.validate_instances(&secrets, None, Some(&secret)), Ok(()));
    }

    #[test]
    fn test_validate_instances_unknown_namespace() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        let mut instance = labels_instance("scoped", json!({"ssh": "enabled"}));
        instance["spec"]["matchResources"]["namespaceSelector"] = json!({"matchExpressions": [
            {"key": "env", "operator": "NotIn", "values": ["prod"]},
        ]});
        env.apply_instance(instance);

        let configmaps = GroupVersionResource::new("", "v1", "configmaps");
        let object = configmap(json!({"ssh": "enabled"}));
        let err = env
            .controller
            .validate_instances(&configmaps, None, Some(&object))
            .unwrap_err();
        assert_eq!(
            err.violations,
            vec![Violation::new(
                UNRESOLVED_MATCH_MESSAGE,
                vec!["namespace \"default\" not found in cache".to_string()]
            )]
        );

        env.cache.upsert(
            &GroupVersionResource::new("", "v1", "namespaces"),
            json!({"metadata": {"name": "default", "labels": {"env": "dev"}}}),
        );
        assert_eq!(env.controller.validate_instances(&configmaps, None, Some(&object)), Ok(()));
    }

    #[test]
    fn test_registry_must_load_before_deciding() {
        let env = unsynced();
        env.cache.upsert(
            &templates::template_gvr(),
            serde_json::to_value(required_labels_template()).unwrap(),
        );
        env.cache.upsert(&instances(), labels_instance("prod", json!({"ssh": "enabled"})));
        env.cache.mark_synced();
        env.plugin.controller().sync_all();

        let request = create(configmap(json!({})));
        let err = env.plugin.validate(&request).unwrap_err();
        assert!(err.is_transient(), "{}", err);
        assert!(!env.controller.registry().has_synced());

        assert!(env.controller.sync_all().is_empty());
        assert!(env.controller.registry().has_synced());
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 1);
        let err = env.plugin.validate(&request).unwrap_err();
        assert!(err.is_policy_denial(), "{}", err);
    }

    #[test]
    fn test_instance_replay_is_idempotent() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        let instance = labels_instance("prod", json!({"ssh": "enabled"}));
        env.apply_instance(instance.clone());
        env.apply_instance(instance);
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 1);
        assert_eq!(env.controller.registry().bound_policies().len(), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        env.apply_instance(labels_instance("ssh", json!({"ssh": "enabled"})));
        env.apply_instance(labels_instance("env", json!({"env": "prod"})));
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 2);

        let only_ssh = create(configmap(json!({"ssh": "enabled"})));
        assert!(env.plugin.validate(&only_ssh).is_err());

        env.cache.delete(&instances(), "default", "env");
        env.controller
            .reconcile(&TemplateKey::Instance {
                resource: instances(),
                key: ObjectKey::new("default", "env"),
            })
            .unwrap();
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 1);
        assert!(env.plugin.validate(&only_ssh).is_ok());
    }

    #[test]
    fn test_schema_error_keeps_template_pending() {
        let env = env();
        let broken = template(
            "broken",
            "Broken",
            "brokens",
            TemplateBehavior::RequiredLabels,
            json!({"type": "object", "properties": {"limit": {"description": "untyped"}}}),
        );
        let err = env.apply_template(&broken).unwrap_err();
        assert!(!err.is_transient());
        let status = env.status.template_status("broken").unwrap();
        assert_eq!(status.phase, TemplatePhase::Pending);
        assert!(status.message.contains("limit"), "{}", status.message);
        assert!(env.crds.names().is_empty());
        assert!(!env.controller.registry().is_active("broken"));

        let fixed = template(
            "broken",
            "Broken",
            "brokens",
            TemplateBehavior::RequiredLabels,
            json!({"type": "object", "properties": {"limit": {"type": "integer"}}}),
        );
        env.apply_template(&fixed).unwrap();
        assert_eq!(env.status.template_status("broken").unwrap().phase, TemplatePhase::Active);
    }

    #[test]
    fn test_template_removal_tears_down() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        env.apply_instance(labels_instance("prod", json!({"ssh": "enabled"})));

        env.cache.delete(&templates::template_gvr(), "", "requiredlabels");
        env.controller
            .reconcile(&TemplateKey::Template("requiredlabels".to_string()))
            .unwrap();

        assert_eq!(env.status.template_status("requiredlabels").unwrap().phase, TemplatePhase::Removed);
        assert!(env.crds.names().is_empty());
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 0);
        assert!(env.controller.registry().bound_policies().is_empty());
        assert_eq!(env.mapper.resource_for(&GroupVersionKind::new(GROUP, "v1", "RequiredLabel")), None);
        assert!(env.plugin.validate(&create(configmap(json!({})))).is_ok());
    }

    #[test]
    fn test_instances_created_before_activation() {
        let env = env();
        env.cache.upsert(&instances(), labels_instance("early", json!({"ssh": "enabled"})));
        env.apply_template(&required_labels_template()).unwrap();
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 1);
    }

    #[test]
    fn test_expression_template() {
        let env = env();
        let prefixes = template(
            "nameprefix",
            "NamePrefix",
            "nameprefixes",
            TemplateBehavior::Validations {
                validations: vec![Validation::new("object.metadata.name.startsWith(params.spec.prefix)")
                    .with_message("name must carry the team prefix")],
                failure_policy: Some(FailurePolicy::Fail),
            },
            json!({"type": "object", "properties": {"prefix": {"type": "string"}}}),
        );
        env.apply_template(&prefixes).unwrap();

        let resource = GroupVersionResource::new(GROUP, "v1", "nameprefixes");
        let key = env.cache.upsert(
            &resource,
            json!({
                "metadata": {"name": "team-a", "namespace": "default"},
                "spec": {"prefix": "team-a-", "matchResources": configmap_rules(), "validationActions": ["Warn"]},
            }),
        );
        env.controller
            .reconcile(&TemplateKey::Instance { resource, key })
            .unwrap();

        let decision = env.plugin.decide(&create(configmap(json!({}))), None).unwrap();
        assert_eq!(decision.verdict(), Verdict::AllowWithWarnings);
        assert_eq!(
            decision.warnings,
            vec!["Validation failed for ValidatingAdmissionPolicy 'nameprefix' with binding 'nameprefixes/default/team-a': name must carry the team prefix"]
        );
    }

    #[test]
    fn test_invalid_instance_actions_are_rejected() {
        let env = env();
        env.apply_template(&required_labels_template()).unwrap();
        let mut instance = labels_instance("both", json!({"ssh": "enabled"}));
        instance["spec"]["validationActions"] = json!(["Deny", "Warn"]);
        let key = env.cache.upsert(&instances(), instance);
        let err = env
            .controller
            .reconcile(&TemplateKey::Instance {
                resource: instances(),
                key,
            })
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 0);
    }

    #[tokio::test]
    async fn test_run_materializes_from_events() {
        let env = env();
        let events = env.cache.subscribe();
        let task = tokio::spawn(env.controller.clone().run(events));

        env.cache.upsert(
            &templates::template_gvr(),
            serde_json::to_value(required_labels_template()).unwrap(),
        );
        for _ in 0..100 {
            if env.controller.registry().is_active("requiredlabels") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        env.cache.upsert(&instances(), labels_instance("prod", json!({"ssh": "enabled"})));
        for _ in 0..100 {
            if env.controller.registry().instance_count("requiredlabels") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(env.controller.registry().instance_count("requiredlabels"), 1);
        task.abort();
    }
}

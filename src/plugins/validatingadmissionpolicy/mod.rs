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

//! ValidatingAdmissionPolicy admission plugin.
//!
//! Policies and bindings are read from the resource cache by the policy
//! controller into an index. Each request is matched against the index and
//! any additional policy sources (template instances), evaluated and reduced
//! to a single decision.

pub mod controller;
pub mod dispatcher;
pub mod matching;
pub mod params;
pub mod readiness;
pub mod validator;

pub use controller::{PolicyController, PolicyIndex, PolicyKey};
pub use dispatcher::{
    BoundPolicy, Decision, DecisionEntry, Denial, Dispatcher, Evaluator, PolicyMatch, PolicySource,
    Verdict,
};
pub use readiness::{MarkerProbe, Readiness, MARKER_MESSAGE};

use crate::admission::{
    AdmissionError, AdmissionResponse, AdmissionResult, Attributes, AttributesRecord, Handler,
    Interface, Operation, Plugins, ValidationInterface,
};
use crate::cache::{InMemoryStatusPublisher, ResourceCache, ResourceMapper, StatusPublisher};
use crate::cel::{Authorizer, ExpressionCache};
use crate::config::EngineConfig;
use crate::schema::{InMemorySchemaResolver, SchemaResolver};
use parking_lot::RwLock;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

pub const PLUGIN_NAME: &str = "ValidatingAdmissionPolicy";

/// The services the plugin reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn ResourceCache>,
    pub mapper: Arc<ResourceMapper>,
    pub schemas: Arc<dyn SchemaResolver>,
    pub status: Arc<dyn StatusPublisher>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub expressions: Arc<ExpressionCache>,
    /// Policy sources consulted after the policy index, in order.
    pub sources: Vec<Arc<dyn PolicySource>>,
}

impl Collaborators {
    /// Collaborators with an empty schema resolver, an in-memory status
    /// publisher and no authorizer.
    pub fn new(cache: Arc<dyn ResourceCache>, mapper: Arc<ResourceMapper>) -> Self {
        Self {
            cache,
            mapper,
            schemas: Arc::new(InMemorySchemaResolver::new()),
            status: Arc::new(InMemoryStatusPublisher::new()),
            authorizer: None,
            expressions: Arc::new(ExpressionCache::new()),
            sources: Vec::new(),
        }
    }

    pub fn with_schemas(mut self, schemas: Arc<dyn SchemaResolver>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_status(mut self, status: Arc<dyn StatusPublisher>) -> Self {
        self.status = status;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.sources.push(source);
        self
    }
}

/// Register the plugin. Each instance gets its own policy index.
pub fn register(plugins: &Plugins, collaborators: Collaborators) {
    plugins.register(
        PLUGIN_NAME,
        Arc::new(move |config: Option<&mut dyn Read>| {
            let config = EngineConfig::load(config)?;
            Ok(Arc::new(Plugin::new(collaborators.clone(), config)) as Arc<dyn ValidationInterface>)
        }),
    );
}

/// Plugin is the admission plugin serving ValidatingAdmissionPolicies.
pub struct Plugin {
    handler: Handler,
    config: EngineConfig,
    cache: Arc<dyn ResourceCache>,
    controller: Arc<PolicyController>,
    dispatcher: Dispatcher,
    sources: RwLock<Vec<Arc<dyn PolicySource>>>,
}

impl Plugin {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        let index = Arc::new(PolicyIndex::new());
        let controller = Arc::new(PolicyController::new(&collaborators, index.clone(), &config));
        let mut sources: Vec<Arc<dyn PolicySource>> = vec![index as Arc<dyn PolicySource>];
        sources.extend(collaborators.sources.iter().cloned());
        Self {
            handler: Handler::new_all(),
            dispatcher: Dispatcher::new(&collaborators, &config),
            cache: collaborators.cache.clone(),
            controller,
            sources: RwLock::new(sources),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The controller feeding this plugin's policy index.
    pub fn controller(&self) -> Arc<PolicyController> {
        self.controller.clone()
    }

    pub fn policies(&self) -> &Arc<PolicyIndex> {
        self.controller.index()
    }

    pub fn add_source(&self, source: Arc<dyn PolicySource>) {
        self.sources.write().push(source);
    }

    /// Decide on a request. Reports a transient error until the cache and
    /// every policy source have synced.
    pub fn decide(&self, attributes: &dyn Attributes, abort: Option<&AtomicBool>) -> AdmissionResult<Decision> {
        let sources = self.sources.read().clone();
        if !self.cache.has_synced() || !sources.iter().all(|source| source.has_synced()) {
            return Err(AdmissionError::not_ready(PLUGIN_NAME));
        }
        let matches = self.dispatcher.resolve(&sources, attributes);
        self.dispatcher.decide(&matches, attributes, abort)
    }

    /// Decide on a blocking worker, abandoning the decision when it outlives
    /// the configured timeout.
    pub async fn decide_with_timeout(self: &Arc<Self>, attributes: AttributesRecord) -> AdmissionResult<Decision> {
        let abort = Arc::new(AtomicBool::new(false));
        let plugin = Arc::clone(self);
        let flag = Arc::clone(&abort);
        let task = tokio::task::spawn_blocking(move || plugin.decide(&attributes, Some(&flag)));

        match tokio::time::timeout(self.config.decision_timeout(), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(AdmissionError::internal_error(format!("decision worker failed: {}", err))),
            Err(_) => {
                abort.store(true, Ordering::SeqCst);
                warn!(timeout = ?self.config.decision_timeout(), "admission decision timed out");
                Err(AdmissionError::canceled(format!(
                    "no decision within {:?}",
                    self.config.decision_timeout()
                )))
            }
        }
    }

    /// Full admission review: decision, warnings and audit annotations.
    pub async fn review(self: &Arc<Self>, uid: &str, attributes: AttributesRecord) -> AdmissionResponse {
        match self.decide_with_timeout(attributes.clone()).await {
            Ok(decision) => decision.to_response(uid, &attributes),
            Err(err) => AdmissionResponse::from_error(uid, &err),
        }
    }
}

impl Interface for Plugin {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }
}

impl ValidationInterface for Plugin {
    fn validate(&self, attributes: &dyn Attributes) -> AdmissionResult<()> {
        let decision = self.decide(attributes, None)?;
        match decision.to_error(attributes) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

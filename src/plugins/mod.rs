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

//! Admission plugins module.

pub mod policytemplate;
pub mod validatingadmissionpolicy;

use crate::admission::Plugins;
use crate::config::EngineConfig;
use policytemplate::{CrdClient, TemplateController, TemplateRegistry};
use std::sync::Arc;
use validatingadmissionpolicy::Collaborators;

/// Plugins in execution order.
pub const ALL_ORDERED_PLUGINS: &[&str] = &[validatingadmissionpolicy::PLUGIN_NAME];

/// Register all admission plugins. Instances of active policy templates are
/// enforced by the same plugin; the returned controller materializes them
/// using `config` for its workers and retry backoff.
pub fn register_all_admission_plugins(
    plugins: &Plugins,
    collaborators: Collaborators,
    crds: Arc<dyn CrdClient>,
    config: &EngineConfig,
) -> Arc<TemplateController> {
    let registry = Arc::new(TemplateRegistry::new());
    let collaborators = collaborators.with_source(registry.clone());
    let templates = Arc::new(TemplateController::new(&collaborators, crds, registry, config));
    validatingadmissionpolicy::register(plugins, collaborators);
    templates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryCache, ResourceMapper};
    use policytemplate::InMemoryCrdClient;
    use validatingadmissionpolicy::PolicySource;

    #[test]
    fn test_register_all_admission_plugins() {
        let plugins = Plugins::new();
        let collaborators = Collaborators::new(Arc::new(InMemoryCache::new()), Arc::new(ResourceMapper::with_builtins()));
        let templates = register_all_admission_plugins(
            &plugins,
            collaborators,
            Arc::new(InMemoryCrdClient::new()),
            &EngineConfig::default(),
        );
        for name in ALL_ORDERED_PLUGINS {
            assert!(plugins.is_registered(name));
        }
        assert!(plugins.new_from_plugins(validatingadmissionpolicy::PLUGIN_NAME, None).is_ok());
        assert_eq!(templates.registry().instance_count("anything"), 0);
        assert!(!templates.registry().has_synced());
        assert!(templates.sync_all().is_empty());
        assert!(templates.registry().has_synced());
    }
}

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

//! Plugin registry for admission controllers.

use super::errors::{AdmissionError, AdmissionResult};
use super::interfaces::ValidationInterface;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

/// Factory creates an admission plugin instance from an optional config stream.
///
/// Factories are closures so that they can capture the engine the plugin
/// is served from.
pub type Factory = Arc<
    dyn Fn(Option<&mut dyn Read>) -> AdmissionResult<Arc<dyn ValidationInterface>> + Send + Sync,
>;

/// Plugins is a registry of admission plugins.
#[derive(Default)]
pub struct Plugins {
    registry: RwLock<BTreeMap<String, Factory>>,
}

impl Plugins {
    /// Create a new empty plugin registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new admission plugin with the given name and factory.
    /// A second registration under the same name replaces the first.
    pub fn register(&self, name: &str, factory: Factory) {
        self.registry.write().insert(name.to_string(), factory);
    }

    /// Get a factory for the given plugin name.
    pub fn get_factory(&self, name: &str) -> Option<Factory> {
        self.registry.read().get(name).cloned()
    }

    /// Get all registered plugin names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        self.registry.read().keys().cloned().collect()
    }

    /// Check if a plugin is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.read().contains_key(name)
    }

    /// Create a new instance of the named plugin.
    pub fn new_from_plugins(
        &self,
        name: &str,
        config: Option<&mut dyn Read>,
    ) -> AdmissionResult<Arc<dyn ValidationInterface>> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| AdmissionError::internal_error(format!("unknown admission plugin: {}", name)))?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{Attributes, Handler, Interface, Operation};

    struct TestPlugin {
        handler: Handler,
    }

    impl Interface for TestPlugin {
        fn handles(&self, operation: Operation) -> bool {
            self.handler.handles(operation)
        }
    }

    impl ValidationInterface for TestPlugin {
        fn validate(&self, _attributes: &dyn Attributes) -> AdmissionResult<()> {
            Ok(())
        }
    }

    fn test_factory() -> Factory {
        Arc::new(|_config| {
            Ok(Arc::new(TestPlugin {
                handler: Handler::new(&[Operation::Create, Operation::Update]),
            }) as Arc<dyn ValidationInterface>)
        })
    }

    #[test]
    fn test_plugins_register() {
        let plugins = Plugins::new();
        plugins.register("TestPlugin", test_factory());

        assert!(plugins.is_registered("TestPlugin"));
        assert!(!plugins.is_registered("Unknown"));
        assert_eq!(plugins.registered_names(), vec!["TestPlugin".to_string()]);
    }

    #[test]
    fn test_plugins_new_from_plugins() {
        let plugins = Plugins::new();
        plugins.register("TestPlugin", test_factory());

        let plugin = plugins.new_from_plugins("TestPlugin", None).unwrap();
        assert!(plugin.handles(Operation::Create));
        assert!(plugin.handles(Operation::Update));
        assert!(!plugin.handles(Operation::Delete));
    }

    #[test]
    fn test_plugins_unknown_plugin() {
        let plugins = Plugins::new();
        let result = plugins.new_from_plugins("Unknown", None);
        assert!(result.is_err());
    }
}

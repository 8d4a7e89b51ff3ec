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

//! Parameter resolution for bindings.

use crate::admission::{GroupVersionKind, GroupVersionResource};
use crate::api::admissionregistration::{ParamKind, ParamRef};
use crate::api::meta;
use crate::cache::{ResourceCache, ResourceMapper};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Parameters a binding resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedParams {
    /// No parameters: `params` is null.
    None,
    /// A single named object.
    Single(Arc<Value>),
    /// Every object matching a selector; the policy is evaluated once per object.
    List(Vec<Arc<Value>>),
}

impl ResolvedParams {
    /// The values `params` takes, in evaluation order.
    pub fn values(&self) -> Vec<Option<Arc<Value>>> {
        match self {
            ResolvedParams::None => vec![None],
            ResolvedParams::Single(object) => vec![Some(object.clone())],
            ResolvedParams::List(objects) => objects.iter().cloned().map(Some).collect(),
        }
    }
}

/// ParamError makes a binding invalid: it contributes nothing until the
/// condition clears, whatever the failure policy says.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("no resource is registered for param kind {0}")]
    UnknownKind(GroupVersionKind),

    #[error("param {kind} {name:?} not found")]
    NotFound { kind: String, name: String },

    #[error("no params of kind {0} match the binding selector")]
    NoMatches(String),

    #[error("paramRef.namespace is required for namespaced param kind {0} on a cluster-scoped request")]
    NamespaceRequired(String),
}

/// ParamResolver serves parameter objects from the local cache.
pub struct ParamResolver {
    cache: Arc<dyn ResourceCache>,
    mapper: Arc<ResourceMapper>,
}

impl ParamResolver {
    pub fn new(cache: Arc<dyn ResourceCache>, mapper: Arc<ResourceMapper>) -> Self {
        Self { cache, mapper }
    }

    /// Resolve the params of a binding for a request in `request_namespace`.
    pub fn resolve(
        &self,
        param_kind: Option<&ParamKind>,
        param_ref: Option<&ParamRef>,
        request_namespace: &str,
    ) -> Result<ResolvedParams, ParamError> {
        let (param_kind, param_ref) = match (param_kind, param_ref) {
            (Some(kind), Some(reference)) => (kind, reference),
            _ => return Ok(ResolvedParams::None),
        };

        let gvk = param_kind.gvk();
        let gvr = self
            .mapper
            .resource_for(&gvk)
            .ok_or_else(|| ParamError::UnknownKind(gvk.clone()))?;
        let namespace = self.namespace_for(&gvr, param_ref, request_namespace)?;

        if !param_ref.name.is_empty() {
            return self
                .cache
                .get(&gvr, namespace, &param_ref.name)
                .map(ResolvedParams::Single)
                .ok_or_else(|| ParamError::NotFound {
                    kind: gvk.kind.clone(),
                    name: meta::ObjectKey::new(namespace, &param_ref.name).to_string(),
                });
        }

        let selector = param_ref.selector.clone().unwrap_or_default();
        let scope = if namespace.is_empty() { None } else { Some(namespace) };
        let matched: Vec<Arc<Value>> = self
            .cache
            .list(&gvr, scope)
            .into_iter()
            .filter(|object| selector.matches(&meta::object_labels(object)))
            .collect();
        if matched.is_empty() {
            return Err(ParamError::NoMatches(gvk.kind));
        }
        Ok(ResolvedParams::List(matched))
    }

    fn namespace_for<'a>(
        &self,
        gvr: &GroupVersionResource,
        param_ref: &'a ParamRef,
        request_namespace: &'a str,
    ) -> Result<&'a str, ParamError> {
        if !self.mapper.is_namespaced(gvr) {
            return Ok("");
        }
        if !param_ref.namespace.is_empty() {
            return Ok(&param_ref.namespace);
        }
        if request_namespace.is_empty() {
            return Err(ParamError::NamespaceRequired(gvr.to_string()));
        }
        Ok(request_namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::meta::LabelSelector;
    use crate::cache::InMemoryCache;
    use serde_json::json;

    fn configmaps() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "configmaps")
    }

    fn resolver() -> (Arc<InMemoryCache>, ParamResolver) {
        let cache = Arc::new(InMemoryCache::new());
        let mapper = Arc::new(ResourceMapper::with_builtins());
        (cache.clone(), ParamResolver::new(cache, mapper))
    }

    fn configmap(ns: &str, name: &str, labels: Value) -> Value {
        json!({"metadata": {"name": name, "namespace": ns, "labels": labels}, "data": {"max": "3"}})
    }

    #[test]
    fn test_no_param_kind_or_ref_resolves_to_none() {
        let (_, resolver) = resolver();
        assert_eq!(resolver.resolve(None, None, "default").unwrap(), ResolvedParams::None);
        let kind = ParamKind::new("v1", "ConfigMap");
        assert_eq!(resolver.resolve(Some(&kind), None, "default").unwrap(), ResolvedParams::None);
        assert_eq!(ResolvedParams::None.values(), vec![None]);
    }

    #[test]
    fn test_named_param() {
        let (cache, resolver) = resolver();
        let kind = ParamKind::new("v1", "ConfigMap");
        let reference = ParamRef::named("", "limits");

        let err = resolver.resolve(Some(&kind), Some(&reference), "default").unwrap_err();
        assert_eq!(
            err,
            ParamError::NotFound {
                kind: "ConfigMap".to_string(),
                name: "default/limits".to_string()
            }
        );

        cache.upsert(&configmaps(), configmap("default", "limits", json!({})));
        match resolver.resolve(Some(&kind), Some(&reference), "default").unwrap() {
            ResolvedParams::Single(object) => assert_eq!(object["data"]["max"], "3"),
            other => panic!("unexpected params {:?}", other),
        }

        // A cluster-scoped request needs an explicit namespace for namespaced params.
        assert!(matches!(
            resolver.resolve(Some(&kind), Some(&reference), ""),
            Err(ParamError::NamespaceRequired(_))
        ));
        let explicit = ParamRef::named("default", "limits");
        assert!(resolver.resolve(Some(&kind), Some(&explicit), "").is_ok());
    }

    #[test]
    fn test_selector_params() {
        let (cache, resolver) = resolver();
        let kind = ParamKind::new("v1", "ConfigMap");
        let reference = ParamRef::selected("default", LabelSelector::with_labels(&[("policy", "on")]));

        assert!(matches!(
            resolver.resolve(Some(&kind), Some(&reference), "default"),
            Err(ParamError::NoMatches(_))
        ));

        cache.upsert(&configmaps(), configmap("default", "b", json!({"policy": "on"})));
        cache.upsert(&configmaps(), configmap("default", "a", json!({"policy": "on"})));
        cache.upsert(&configmaps(), configmap("default", "c", json!({"policy": "off"})));
        cache.upsert(&configmaps(), configmap("other", "d", json!({"policy": "on"})));

        let params = resolver.resolve(Some(&kind), Some(&reference), "default").unwrap();
        let names: Vec<String> = params
            .values()
            .into_iter()
            .flatten()
            .map(|o| meta::object_name(&o).to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_unknown_kind() {
        let (_, resolver) = resolver();
        let kind = ParamKind::new("example.com/v1", "Missing");
        let reference = ParamRef::named("default", "x");
        assert!(matches!(
            resolver.resolve(Some(&kind), Some(&reference), "default"),
            Err(ParamError::UnknownKind(_))
        ));
    }
}

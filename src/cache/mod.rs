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

//! Local, eventually-consistent mirror of API objects.
//!
//! Every read on the admission path is served from here. The store is
//! sharded per resource: writers lock only the shard of the resource they
//! touch, so a burst of ConfigMap updates never serializes policy lookups.

mod mapper;
mod status;

pub use mapper::{ResourceMapper, ResourceMapping};
pub use status::{InMemoryStatusPublisher, StatusPublisher};

use crate::admission::GroupVersionResource;
use crate::api::meta::{self, ObjectKey};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Kind of change carried by a cache event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Added,
    Updated,
    Deleted,
}

/// CacheEvent notifies subscribers that an object changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub action: EventAction,
    pub gvr: GroupVersionResource,
    pub key: ObjectKey,
}

/// ResourceCache is the read side of the local object mirror.
pub trait ResourceCache: Send + Sync {
    /// Get a single object. Cluster-scoped objects use an empty namespace.
    fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Option<Arc<Value>>;

    /// List objects of a resource, ordered by namespace then name.
    /// `None` lists across all namespaces.
    fn list(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Vec<Arc<Value>>;

    /// True once the initial full list has been observed.
    fn has_synced(&self) -> bool;
}

type Shard = Arc<RwLock<BTreeMap<ObjectKey, Arc<Value>>>>;

/// InMemoryCache is an informer-style store backed by per-resource shards.
#[derive(Default)]
pub struct InMemoryCache {
    shards: DashMap<GroupVersionResource, Shard>,
    synced: AtomicBool,
    resource_version: AtomicU64,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CacheEvent>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, gvr: &GroupVersionResource) -> Shard {
        self.shards
            .entry(gvr.clone())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .clone()
    }

    /// Insert or replace an object. A fresh `metadata.resourceVersion` is stamped on it.
    pub fn upsert(&self, gvr: &GroupVersionResource, mut object: Value) -> ObjectKey {
        let key = ObjectKey::of(&object);
        let version = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }

        let previous = {
            let shard = self.shard(gvr);
            let mut entries = shard.write();
            entries.insert(key.clone(), Arc::new(object))
        };
        let action = if previous.is_some() {
            EventAction::Updated
        } else {
            EventAction::Added
        };
        trace!(resource = %gvr, key = %key, ?action, "cache upsert");
        self.notify(CacheEvent {
            action,
            gvr: gvr.clone(),
            key: key.clone(),
        });
        key
    }

    /// Remove an object. Returns the removed object, if any.
    pub fn delete(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Option<Arc<Value>> {
        let key = ObjectKey::new(namespace, name);
        let removed = self
            .shards
            .get(gvr)
            .and_then(|shard| shard.write().remove(&key));
        if removed.is_some() {
            trace!(resource = %gvr, key = %key, "cache delete");
            self.notify(CacheEvent {
                action: EventAction::Deleted,
                gvr: gvr.clone(),
                key,
            });
        }
        removed
    }

    /// Mark the initial list as complete.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// Subscribe to change events published after this call.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CacheEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, event: CacheEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl ResourceCache for InMemoryCache {
    fn get(&self, gvr: &GroupVersionResource, namespace: &str, name: &str) -> Option<Arc<Value>> {
        let shard = self.shards.get(gvr)?.clone();
        let entries = shard.read();
        entries.get(&ObjectKey::new(namespace, name)).cloned()
    }

    fn list(&self, gvr: &GroupVersionResource, namespace: Option<&str>) -> Vec<Arc<Value>> {
        let shard = match self.shards.get(gvr) {
            Some(shard) => shard.clone(),
            None => return Vec::new(),
        };
        let entries = shard.read();
        entries
            .iter()
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .map(|(_, object)| object.clone())
            .collect()
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Labels of the namespace object named `namespace`, if it is cached.
pub fn namespace_labels(cache: &dyn ResourceCache, namespace: &str) -> Option<meta::Labels> {
    let gvr = GroupVersionResource::new("", "v1", "namespaces");
    cache
        .get(&gvr, "", namespace)
        .map(|ns| meta::object_labels(&ns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn configmaps() -> GroupVersionResource {
        GroupVersionResource::new("", "v1", "configmaps")
    }

    fn configmap(ns: &str, name: &str) -> Value {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}})
    }

    #[test]
    fn test_upsert_get_delete() {
        let cache = InMemoryCache::new();
        cache.upsert(&configmaps(), configmap("default", "a"));

        let got = cache.get(&configmaps(), "default", "a").unwrap();
        assert_eq!(meta::object_name(&got), "a");
        assert_eq!(got["metadata"]["resourceVersion"], "1");
        assert!(cache.get(&configmaps(), "other", "a").is_none());

        assert!(cache.delete(&configmaps(), "default", "a").is_some());
        assert!(cache.get(&configmaps(), "default", "a").is_none());
        assert!(cache.delete(&configmaps(), "default", "a").is_none());
    }

    #[test]
    fn test_list_is_ordered_by_namespace_then_name() {
        let cache = InMemoryCache::new();
        cache.upsert(&configmaps(), configmap("b", "z"));
        cache.upsert(&configmaps(), configmap("a", "y"));
        cache.upsert(&configmaps(), configmap("b", "a"));

        let keys: Vec<String> = cache
            .list(&configmaps(), None)
            .iter()
            .map(|o| ObjectKey::of(o).to_string())
            .collect();
        assert_eq!(keys, vec!["a/y", "b/a", "b/z"]);
        assert_eq!(cache.list(&configmaps(), Some("a")).len(), 1);
        assert!(cache
            .list(&GroupVersionResource::new("", "v1", "secrets"), None)
            .is_empty());
    }

    #[test]
    fn test_subscribe_receives_events() {
        let cache = InMemoryCache::new();
        let mut events = cache.subscribe();
        cache.upsert(&configmaps(), configmap("default", "a"));
        cache.upsert(&configmaps(), configmap("default", "a"));
        cache.delete(&configmaps(), "default", "a");

        let actions: Vec<EventAction> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![EventAction::Added, EventAction::Updated, EventAction::Deleted]
        );
    }

    #[test]
    fn test_synced_flag_and_namespace_labels() {
        let cache = InMemoryCache::new();
        assert!(!cache.has_synced());
        cache.mark_synced();
        assert!(cache.has_synced());

        cache.upsert(
            &GroupVersionResource::new("", "v1", "namespaces"),
            json!({"metadata": {"name": "prod", "labels": {"env": "prod"}}}),
        );
        let labels = namespace_labels(&cache, "prod").unwrap();
        assert_eq!(labels.get("env").map(String::as_str), Some("prod"));
        assert!(namespace_labels(&cache, "missing").is_none());
    }
}

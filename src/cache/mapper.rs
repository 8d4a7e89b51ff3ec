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

//! Kind to resource mapping, scope and version equivalence.

use crate::admission::{GroupResource, GroupVersionKind, GroupVersionResource};
use crate::api::{admissionregistration, templates};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// ResourceMapping associates a kind with the resource serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMapping {
    pub gvk: GroupVersionKind,
    pub resource: GroupVersionResource,
    pub namespaced: bool,
}

impl ResourceMapping {
    pub fn new(gvk: GroupVersionKind, plural: &str, namespaced: bool) -> Self {
        let resource = GroupVersionResource::new(&gvk.group, &gvk.version, plural);
        Self {
            gvk,
            resource,
            namespaced,
        }
    }
}

/// ResourceMapper answers kind/resource lookups.
///
/// Resources with the same group and resource name are equivalent across
/// versions. Further equivalence between groups (e.g. a resource moved from
/// `extensions` to `apps`) is registered explicitly.
#[derive(Default)]
pub struct ResourceMapper {
    by_kind: DashMap<GroupVersionKind, ResourceMapping>,
    by_resource: DashMap<GroupVersionResource, ResourceMapping>,
    equivalence_groups: RwLock<Vec<BTreeSet<GroupResource>>>,
}

impl ResourceMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mapper preloaded with core kinds and this engine's own kinds.
    pub fn with_builtins() -> Self {
        let mapper = Self::new();
        for (kind, plural, namespaced) in [
            ("Namespace", "namespaces", false),
            ("ConfigMap", "configmaps", true),
            ("Secret", "secrets", true),
            ("Endpoints", "endpoints", true),
        ] {
            mapper.register(ResourceMapping::new(
                GroupVersionKind::new("", "v1", kind),
                plural,
                namespaced,
            ));
        }
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new(
                admissionregistration::GROUP_NAME,
                admissionregistration::VERSION,
                admissionregistration::POLICY_KIND,
            ),
            admissionregistration::POLICY_RESOURCE,
            false,
        ));
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new(
                admissionregistration::GROUP_NAME,
                admissionregistration::VERSION,
                admissionregistration::BINDING_KIND,
            ),
            admissionregistration::BINDING_RESOURCE,
            false,
        ));
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new(templates::GROUP_NAME, templates::VERSION, templates::TEMPLATE_KIND),
            templates::TEMPLATE_RESOURCE,
            false,
        ));
        mapper
    }

    /// Register or replace a mapping.
    pub fn register(&self, mapping: ResourceMapping) {
        self.by_resource.insert(mapping.resource.clone(), mapping.clone());
        self.by_kind.insert(mapping.gvk.clone(), mapping);
    }

    /// Remove the mapping for a kind.
    pub fn unregister(&self, gvk: &GroupVersionKind) {
        if let Some((_, mapping)) = self.by_kind.remove(gvk) {
            self.by_resource.remove(&mapping.resource);
        }
    }

    /// Declare that the given group/resources serve the same objects.
    pub fn add_equivalence(&self, resources: &[GroupResource]) {
        self.equivalence_groups
            .write()
            .push(resources.iter().cloned().collect());
    }

    pub fn resource_for(&self, gvk: &GroupVersionKind) -> Option<GroupVersionResource> {
        self.by_kind.get(gvk).map(|m| m.resource.clone())
    }

    pub fn kind_for(&self, gvr: &GroupVersionResource) -> Option<GroupVersionKind> {
        self.by_resource.get(gvr).map(|m| m.gvk.clone())
    }

    pub fn mapping_for_kind(&self, gvk: &GroupVersionKind) -> Option<ResourceMapping> {
        self.by_kind.get(gvk).map(|m| m.clone())
    }

    /// Scope of a resource. Unknown resources are reported as namespaced.
    pub fn is_namespaced(&self, gvr: &GroupVersionResource) -> bool {
        self.by_resource.get(gvr).map_or(true, |m| m.namespaced)
    }

    /// All registered resources equivalent to `gvr`, sorted, including `gvr` itself.
    pub fn equivalent_resources(&self, gvr: &GroupVersionResource) -> Vec<GroupVersionResource> {
        let mut group_resources: BTreeSet<GroupResource> = BTreeSet::new();
        group_resources.insert(gvr.group_resource());
        for group in self.equivalence_groups.read().iter() {
            if group.contains(&gvr.group_resource()) {
                group_resources.extend(group.iter().cloned());
            }
        }

        let mut out: BTreeSet<GroupVersionResource> = self
            .by_resource
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|candidate| group_resources.contains(&candidate.group_resource()))
            .collect();
        out.insert(gvr.clone());
        out.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pandas(version: &str) -> ResourceMapping {
        ResourceMapping::new(
            GroupVersionKind::new("awesome.bears.com", version, "Panda"),
            "pandas",
            false,
        )
    }

    #[test]
    fn test_builtins() {
        let mapper = ResourceMapper::with_builtins();
        let ns = GroupVersionResource::new("", "v1", "namespaces");
        assert!(!mapper.is_namespaced(&ns));
        assert_eq!(mapper.kind_for(&ns).unwrap().kind, "Namespace");
        assert_eq!(
            mapper.resource_for(&GroupVersionKind::new("", "v1", "ConfigMap")),
            Some(GroupVersionResource::new("", "v1", "configmaps"))
        );
        assert!(!mapper.is_namespaced(&admissionregistration::binding_gvr()));
    }

    #[test]
    fn test_equivalent_versions() {
        let mapper = ResourceMapper::new();
        mapper.register(pandas("v1"));
        mapper.register(pandas("v2"));

        let v1 = GroupVersionResource::new("awesome.bears.com", "v1", "pandas");
        let equivalents = mapper.equivalent_resources(&v1);
        assert_eq!(
            equivalents,
            vec![v1.clone(), GroupVersionResource::new("awesome.bears.com", "v2", "pandas")]
        );

        mapper.unregister(&GroupVersionKind::new("awesome.bears.com", "v2", "Panda"));
        assert_eq!(mapper.equivalent_resources(&v1), vec![v1]);
    }

    #[test]
    fn test_explicit_equivalence_across_groups() {
        let mapper = ResourceMapper::new();
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new("apps", "v1", "Deployment"),
            "deployments",
            true,
        ));
        mapper.register(ResourceMapping::new(
            GroupVersionKind::new("extensions", "v1beta1", "Deployment"),
            "deployments",
            true,
        ));
        mapper.add_equivalence(&[
            GroupResource::new("apps", "deployments"),
            GroupResource::new("extensions", "deployments"),
        ]);

        let equivalents =
            mapper.equivalent_resources(&GroupVersionResource::new("extensions", "v1beta1", "deployments"));
        assert!(equivalents.contains(&GroupVersionResource::new("apps", "v1", "deployments")));
        assert_eq!(equivalents.len(), 2);
    }
}

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

//! Admission attributes that describe an admission request.

use super::interfaces::Operation;
use crate::api::meta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// GroupVersionResource identifies a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// Returns just the group and resource portion.
    pub fn group_resource(&self) -> GroupResource {
        GroupResource {
            group: self.group.clone(),
            resource: self.resource.clone(),
        }
    }

    /// Returns the same resource at another version.
    pub fn with_version(&self, version: &str) -> Self {
        Self::new(&self.group, version, &self.resource)
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// GroupResource identifies a resource without version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// GroupVersionKind identifies a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupVersionKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl GroupVersionKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

    /// Build a GVK from an `apiVersion` string ("v1" or "group/version") and a kind.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        match api_version.split_once('/') {
            Some((group, version)) => Self::new(group, version, kind),
            None => Self::new("", api_version, kind),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for GroupVersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, Kind={}", self.api_version(), self.kind)
    }
}

/// UserInfo describes the user that issued the request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl UserInfo {
    pub fn new(username: &str, groups: &[&str]) -> Self {
        Self {
            username: username.to_string(),
            uid: String::new(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            extra: BTreeMap::new(),
        }
    }
}

/// Attributes is used by admission controllers to get information about a request
/// that is used to make an admission decision.
pub trait Attributes: Send + Sync {
    /// Returns the name of the object as presented in the request.
    fn get_name(&self) -> &str;

    /// Returns the namespace associated with the request (if any).
    fn get_namespace(&self) -> &str;

    /// Returns the resource being requested.
    fn get_resource(&self) -> &GroupVersionResource;

    /// Returns the name of the subresource being requested.
    fn get_subresource(&self) -> &str;

    /// Returns the operation being performed.
    fn get_operation(&self) -> Operation;

    /// Returns the object from the incoming request.
    fn get_object(&self) -> Option<&Value>;

    /// Returns the existing object (only populated for UPDATE and DELETE requests).
    fn get_old_object(&self) -> Option<&Value>;

    /// Returns the kind of object being manipulated.
    fn get_kind(&self) -> &GroupVersionKind;

    /// Returns the user that issued the request.
    fn get_user_info(&self) -> &UserInfo;

    /// Check if this request is a dry run.
    fn is_dry_run(&self) -> bool;
}

/// AttributesRecord is a concrete implementation of Attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributesRecord {
    pub name: String,
    pub namespace: String,
    pub resource: GroupVersionResource,
    pub subresource: String,
    pub operation: Operation,
    pub object: Option<Value>,
    pub old_object: Option<Value>,
    pub kind: GroupVersionKind,
    pub user_info: UserInfo,
    pub dry_run: bool,
}

impl AttributesRecord {
    /// Create a new AttributesRecord. Name and namespace are taken from the
    /// object (or the old object on DELETE) when present.
    pub fn new(
        resource: GroupVersionResource,
        kind: GroupVersionKind,
        operation: Operation,
        object: Option<Value>,
        old_object: Option<Value>,
    ) -> Self {
        let source = object.as_ref().or(old_object.as_ref());
        let name = source.map(meta::object_name).unwrap_or_default().to_string();
        let namespace = source
            .map(meta::object_namespace)
            .unwrap_or_default()
            .to_string();
        Self {
            name,
            namespace,
            resource,
            subresource: String::new(),
            operation,
            object,
            old_object,
            kind,
            user_info: UserInfo::default(),
            dry_run: false,
        }
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_subresource(mut self, subresource: &str) -> Self {
        self.subresource = subresource.to_string();
        self
    }

    pub fn with_user_info(mut self, user_info: UserInfo) -> Self {
        self.user_info = user_info;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl Attributes for AttributesRecord {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn get_namespace(&self) -> &str {
        &self.namespace
    }

    fn get_resource(&self) -> &GroupVersionResource {
        &self.resource
    }

    fn get_subresource(&self) -> &str {
        &self.subresource
    }

    fn get_operation(&self) -> Operation {
        self.operation
    }

    fn get_object(&self) -> Option<&Value> {
        self.object.as_ref()
    }

    fn get_old_object(&self) -> Option<&Value> {
        self.old_object.as_ref()
    }

    fn get_kind(&self) -> &GroupVersionKind {
        &self.kind
    }

    fn get_user_info(&self) -> &UserInfo {
        &self.user_info
    }

    fn is_dry_run(&self) -> bool {
        self.dry_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attributes_record_takes_identity_from_object() {
        let object = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "settings", "namespace": "default"}
        });
        let attrs = AttributesRecord::new(
            GroupVersionResource::new("", "v1", "configmaps"),
            GroupVersionKind::new("", "v1", "ConfigMap"),
            Operation::Create,
            Some(object),
            None,
        );

        assert_eq!(attrs.get_name(), "settings");
        assert_eq!(attrs.get_namespace(), "default");
        assert_eq!(attrs.get_operation(), Operation::Create);
        assert!(attrs.get_old_object().is_none());
    }

    #[test]
    fn test_attributes_record_delete_uses_old_object() {
        let old = json!({"metadata": {"name": "gone", "namespace": "ns1"}});
        let attrs = AttributesRecord::new(
            GroupVersionResource::new("", "v1", "secrets"),
            GroupVersionKind::new("", "v1", "Secret"),
            Operation::Delete,
            None,
            Some(old),
        );
        assert_eq!(attrs.get_name(), "gone");
        assert_eq!(attrs.get_namespace(), "ns1");
    }

    #[test]
    fn test_group_version_resource() {
        let gvr = GroupVersionResource::new("apps", "v1", "deployments");
        assert_eq!(gvr.to_string(), "apps/v1/deployments");
        assert_eq!(gvr.group_resource().to_string(), "deployments.apps");
        assert_eq!(gvr.with_version("v1beta1").version, "v1beta1");

        let core = GroupVersionResource::new("", "v1", "namespaces");
        assert_eq!(core.group_resource().to_string(), "namespaces");
    }

    #[test]
    fn test_gvk_from_api_version() {
        let gvk = GroupVersionKind::from_api_version("policy.acme.co/v1", "RequiredLabels");
        assert_eq!(gvk.group, "policy.acme.co");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.api_version(), "policy.acme.co/v1");

        let core = GroupVersionKind::from_api_version("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.to_string(), "v1, Kind=ConfigMap");
    }
}

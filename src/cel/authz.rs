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

//! Secondary authorization checks exposed to expressions as `authorizer`.

use crate::admission::UserInfo;
use std::fmt;

/// AccessCheck describes one access question. Either `path` is set
/// (non-resource request) or the resource fields are.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AccessCheck {
    pub verb: String,
    pub path: Option<String>,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub subresource: String,
    pub namespace: String,
    pub name: String,
}

impl AccessCheck {
    pub fn resource(group: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            ..Default::default()
        }
    }

    pub fn path(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            ..Default::default()
        }
    }
}

impl fmt::Display for AccessCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = &self.path {
            return write!(f, "{} {}", self.verb, path);
        }
        write!(f, "{} {}", self.verb, self.resource)?;
        if !self.subresource.is_empty() {
            write!(f, "/{}", self.subresource)?;
        }
        if !self.group.is_empty() {
            write!(f, ".{}", self.group)?;
        }
        if !self.namespace.is_empty() {
            write!(f, " in namespace {}", self.namespace)?;
        }
        if !self.name.is_empty() {
            write!(f, " named {}", self.name)?;
        }
        Ok(())
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    NoOpinion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationDecision {
    pub decision: Decision,
    pub reason: String,
    pub error: Option<String>,
}

impl AuthorizationDecision {
    pub fn allow(reason: &str) -> Self {
        Self {
            decision: Decision::Allow,
            reason: reason.to_string(),
            error: None,
        }
    }

    pub fn no_opinion(reason: &str) -> Self {
        Self {
            decision: Decision::NoOpinion,
            reason: reason.to_string(),
            error: None,
        }
    }

    pub fn allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// Authorizer answers access checks on behalf of the requesting user.
/// Implementations must not mutate shared state.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, user: &UserInfo, check: &AccessCheck) -> AuthorizationDecision;
}

/// A rule of the static authorizer. Empty lists and `*` match anything.
#[derive(Debug, Clone, Default)]
pub struct StaticRule {
    pub users: Vec<String>,
    pub groups: Vec<String>,
    pub verbs: Vec<String>,
    pub api_groups: Vec<String>,
    pub resources: Vec<String>,
    pub namespaces: Vec<String>,
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.is_empty() || patterns.iter().any(|p| p == "*" || p == value)
}

impl StaticRule {
    fn matches(&self, user: &UserInfo, check: &AccessCheck) -> bool {
        let subject = (self.users.is_empty() && self.groups.is_empty())
            || self.users.iter().any(|u| u == &user.username)
            || self.groups.iter().any(|g| user.groups.contains(g));
        let resource = if check.subresource.is_empty() {
            check.resource.clone()
        } else {
            format!("{}/{}", check.resource, check.subresource)
        };
        subject
            && matches_any(&self.verbs, &check.verb)
            && matches_any(&self.api_groups, &check.group)
            && matches_any(&self.resources, &resource)
            && matches_any(&self.namespaces, &check.namespace)
    }
}

/// StaticAuthorizer allows exactly what its rules list.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    rules: Vec<StaticRule>,
}

impl StaticAuthorizer {
    pub fn new(rules: Vec<StaticRule>) -> Self {
        Self { rules }
    }

    /// An authorizer that has no opinion on anything.
    pub fn deny_all() -> Self {
        Self::default()
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, user: &UserInfo, check: &AccessCheck) -> AuthorizationDecision {
        if self.rules.iter().any(|rule| rule.matches(user, check)) {
            AuthorizationDecision::allow("")
        } else {
            AuthorizationDecision::no_opinion(&format!(
                "user {:?} cannot {}",
                user.username, check
            ))
        }
    }
}

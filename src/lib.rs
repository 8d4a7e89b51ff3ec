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

//! ValidatingAdmissionPolicy enforcement for Kubernetes admission.
//!
//! Policies and bindings are read from a local object cache, compiled once
//! and evaluated against each admission request. PolicyTemplates add
//! generated custom resource kinds whose instances are enforced as
//! additional policies.

pub mod admission;
pub mod api;
pub mod cache;
pub mod cel;
pub mod config;
pub mod controller;
pub mod plugins;
pub mod schema;

// Re-export commonly used types
pub use admission::{
    AdmissionError, AdmissionResponse, AdmissionResult, Attributes, AttributesRecord, Handler,
    Interface, Operation, ValidationInterface,
};
pub use config::EngineConfig;
pub use plugins::validatingadmissionpolicy::{Collaborators, Decision, Plugin, Verdict};

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

//! Admission controller interfaces and types.
//!
//! Request attributes, the validating plugin interfaces, the plugin
//! registry, the error taxonomy and the response envelope.

pub mod attributes;
pub mod errors;
mod handler;
mod interfaces;
mod plugins;
pub mod response;

pub use attributes::{
    Attributes, AttributesRecord, GroupResource, GroupVersionKind, GroupVersionResource, UserInfo,
};
pub use errors::{AdmissionError, AdmissionResult, StatusReason};
pub use handler::Handler;
pub use interfaces::{Interface, Operation, ValidationInterface};
pub use plugins::{Factory, Plugins};
pub use response::{AdmissionResponse, ResponseStatus};

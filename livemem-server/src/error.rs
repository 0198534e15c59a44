// Copyright 2025 Livemem (https://github.com/livemem)
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

//! Service errors and the tool envelope.
//!
//! Domain services never throw across the tool boundary: every operation
//! returns `ServiceResult`, and failures are mapped to the conventional
//! envelope statuses (`error`, `not_found`, `forbidden`, `conflict`,
//! `already_exists`) with a human-readable message.

use livemem_core::ValidationError;
use livemem_storage::StorageError;
use serde_json::{json, Value};
use thiserror::Error;

/// Result type for every domain operation. The success value is the tool
/// envelope body (it already carries its `status` field).
pub type ServiceResult = Result<Value, ServiceError>;

/// Failure classes a domain operation can report.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Bad input; the message names the field.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    /// An exclusive operation is already running.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    AlreadyExists(String),

    /// Object store or language model failure after bounded retries.
    #[error("{0}")]
    Upstream(String),

    /// A stored object that must be JSON is unreadable. Never silently
    /// rewritten.
    #[error("{0}")]
    Corruption(String),
}

impl ServiceError {
    pub fn status(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "error",
            ServiceError::NotFound(_) => "not_found",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::AlreadyExists(_) => "already_exists",
            ServiceError::Upstream(_) => "error",
            ServiceError::Corruption(_) => "error",
        }
    }

    /// The envelope this error turns into at the tool boundary.
    pub fn envelope(&self) -> Value {
        json!({
            "status": self.status(),
            "message": self.to_string(),
        })
    }

    pub fn space_not_found(space_id: &str) -> Self {
        ServiceError::NotFound(format!("space '{space_id}' not found"))
    }
}

impl From<ValidationError> for ServiceError {
    fn from(e: ValidationError) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::CorruptJson { .. } => ServiceError::Corruption(e.to_string()),
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_to_envelope_codes() {
        assert_eq!(ServiceError::Validation("x".into()).status(), "error");
        assert_eq!(ServiceError::NotFound("x".into()).status(), "not_found");
        assert_eq!(ServiceError::Forbidden("x".into()).status(), "forbidden");
        assert_eq!(ServiceError::Conflict("x".into()).status(), "conflict");
        assert_eq!(
            ServiceError::AlreadyExists("x".into()).status(),
            "already_exists"
        );
        assert_eq!(ServiceError::Upstream("x".into()).status(), "error");
    }

    #[test]
    fn envelope_carries_message() {
        let envelope = ServiceError::space_not_found("demo").envelope();
        assert_eq!(envelope["status"], "not_found");
        assert_eq!(envelope["message"], "space 'demo' not found");
    }
}

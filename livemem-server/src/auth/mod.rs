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

//! Request authentication and per-call capability checks.
//!
//! The transport resolves the bearer header once per request into an
//! [`Identity`] and threads it into every tool call; there is no global
//! request state. Two validation modes:
//!
//! 1. the configured bootstrap credential authenticates as a synthetic
//!    admin with universal scope (first-start path);
//! 2. anything else is looked up by hash in the token registry.

pub mod tokens;

use livemem_core::Permission;

use crate::error::ServiceError;
use self::tokens::TokenRegistry;

/// The authenticated caller of one request.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub permissions: Vec<Permission>,
    /// Space ids this identity may touch; empty means universal.
    pub space_ids: Vec<String>,
    /// Leading characters of the credential hash, for audit lines.
    pub hash_prefix: String,
}

impl Identity {
    fn bootstrap() -> Self {
        Self {
            name: "admin".to_string(),
            permissions: vec![Permission::Admin, Permission::Read, Permission::Write],
            space_ids: Vec::new(),
            hash_prefix: "bootstrap".to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.contains(&Permission::Admin)
    }

    /// Scope containment: pass iff admin, universal scope, or the space is
    /// in the allow list.
    pub fn allows_space(&self, space_id: &str) -> bool {
        self.is_admin()
            || self.space_ids.is_empty()
            || self.space_ids.iter().any(|s| s == space_id)
    }

    pub fn check_access(&self, space_id: &str) -> Result<(), ServiceError> {
        if self.allows_space(space_id) {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "access to space '{space_id}' denied"
            )))
        }
    }

    pub fn check_write(&self) -> Result<(), ServiceError> {
        if self.permissions.contains(&Permission::Write) || self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "'write' permission required".to_string(),
            ))
        }
    }

    pub fn check_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "'admin' permission required".to_string(),
            ))
        }
    }
}

/// Converts a bearer credential into an [`Identity`].
pub struct AuthGate {
    registry: std::sync::Arc<TokenRegistry>,
    bootstrap_key: String,
}

impl AuthGate {
    pub fn new(registry: std::sync::Arc<TokenRegistry>, bootstrap_key: String) -> Self {
        Self {
            registry,
            bootstrap_key,
        }
    }

    /// Resolve a raw bearer value. `None` means the request is anonymous;
    /// every authenticated tool then fails with `forbidden`.
    pub async fn resolve(&self, bearer: Option<&str>) -> Option<Identity> {
        let raw = bearer?;
        if raw.is_empty() {
            return None;
        }

        if !self.bootstrap_key.is_empty() && raw == self.bootstrap_key {
            return Some(Identity::bootstrap());
        }

        match self.registry.validate(raw).await {
            Ok(Some(record)) => {
                let hash_prefix = record.hash.chars().take(19).collect();
                Some(Identity {
                    name: record.name,
                    permissions: record.permissions,
                    space_ids: record.space_ids,
                    hash_prefix,
                })
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "token validation failed");
                None
            }
        }
    }
}

/// One audit line per authenticated tool call.
pub fn audit(identity: &Identity, tool: &str, space: &str) {
    tracing::info!(
        identity = %identity.name,
        hash = %identity.hash_prefix,
        tool = %tool,
        space = %space,
        "tool call"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemem_storage::Storage;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn gate() -> (AuthGate, Arc<TokenRegistry>) {
        let registry = Arc::new(TokenRegistry::new(
            Storage::in_memory(),
            Arc::new(Mutex::new(())),
        ));
        (
            AuthGate::new(registry.clone(), "boot-secret".to_string()),
            registry,
        )
    }

    #[tokio::test]
    async fn bootstrap_key_is_universal_admin() {
        let (gate, _) = gate();
        let identity = gate.resolve(Some("boot-secret")).await.unwrap();
        assert!(identity.is_admin());
        assert!(identity.space_ids.is_empty());
        assert!(identity.check_access("anything").is_ok());
        assert!(identity.check_admin().is_ok());
    }

    #[tokio::test]
    async fn unknown_and_missing_bearers_are_anonymous() {
        let (gate, _) = gate();
        assert!(gate.resolve(None).await.is_none());
        assert!(gate.resolve(Some("")).await.is_none());
        assert!(gate.resolve(Some("lm_bogus")).await.is_none());
    }

    #[tokio::test]
    async fn scoped_token_resolves_with_scope() {
        let (gate, registry) = gate();
        let created = registry.create("t1", "read,write", "a", 0).await.unwrap();
        let raw = created["token"].as_str().unwrap();

        let identity = gate.resolve(Some(raw)).await.unwrap();
        assert_eq!(identity.name, "t1");
        assert!(identity.check_access("a").is_ok());
        assert!(identity.check_access("b").is_err());
        assert!(identity.check_write().is_ok());
        assert!(identity.check_admin().is_err());
    }

    #[test]
    fn read_only_identity_cannot_write() {
        let identity = Identity {
            name: "reader".into(),
            permissions: vec![Permission::Read],
            space_ids: vec![],
            hash_prefix: "sha256:abc".into(),
        };
        assert!(identity.check_access("any").is_ok());
        assert!(identity.check_write().is_err());
    }
}

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

//! Token registry persisted as `_system/tokens.json`.
//!
//! Every mutation is a read-modify-write of the single registry object and
//! runs under the global tokens mutex. The plain credential exists only in
//! the creation response; storage carries the SHA-256 digest.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::RngCore;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::Mutex;

use livemem_core::{Permission, TokenFile, TokenRecord, ValidationError, TOKENS_KEY};
use livemem_storage::Storage;

use crate::error::{ServiceError, ServiceResult};

/// Prefix of every issued credential.
pub const TOKEN_PREFIX: &str = "lm_";

pub struct TokenRegistry {
    storage: Storage,
    lock: Arc<Mutex<()>>,
}

impl TokenRegistry {
    pub fn new(storage: Storage, lock: Arc<Mutex<()>>) -> Self {
        Self { storage, lock }
    }

    /// `lm_` + 43 url-safe base64 chars (32 random bytes).
    pub fn generate_credential() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Storage key of a credential: `sha256:<hex>`.
    pub fn hash_credential(raw: &str) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(raw.as_bytes())))
    }

    async fn load(&self) -> Result<TokenFile, ServiceError> {
        Ok(self
            .storage
            .get_json::<TokenFile>(TOKENS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, file: &TokenFile) -> Result<(), ServiceError> {
        self.storage.put_json(TOKENS_KEY, file).await?;
        Ok(())
    }

    /// Create a token. The plain value is returned exactly once.
    pub async fn create(
        &self,
        name: &str,
        permissions_csv: &str,
        space_ids_csv: &str,
        expires_in_days: u32,
    ) -> ServiceResult {
        if name.trim().is_empty() {
            return Err(ValidationError::Required("name").into());
        }
        let permissions = Permission::parse_csv(permissions_csv)?;
        let space_ids = livemem_core::validate::parse_csv_list(space_ids_csv);
        for space_id in &space_ids {
            livemem_core::validate::validate_space_id(space_id)?;
        }

        let raw = Self::generate_credential();
        let hash = Self::hash_credential(&raw);

        let now = Utc::now();
        let expires_at = if expires_in_days > 0 {
            Some((now + Duration::days(expires_in_days as i64)).to_rfc3339())
        } else {
            None
        };

        let record = TokenRecord {
            hash,
            name: name.to_string(),
            permissions: permissions.clone(),
            space_ids: space_ids.clone(),
            created_at: now.to_rfc3339(),
            expires_at: expires_at.clone(),
            last_used_at: None,
            revoked: false,
        };

        {
            let _guard = self.lock.lock().await;
            let mut file = self.load().await?;
            file.tokens.push(record);
            self.save(&file).await?;
        }

        tracing::info!(name = %name, "token created");

        Ok(json!({
            "status": "created",
            "name": name,
            "token": raw,
            "permissions": permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
            "space_ids": space_ids,
            "expires_at": expires_at,
            "warning": "This token will never be shown again. Store it now.",
        }))
    }

    /// Metadata for every token; hashes truncated, plain values never kept.
    pub async fn list(&self) -> ServiceResult {
        let file = self.load().await?;
        let tokens: Vec<_> = file
            .tokens
            .iter()
            .map(|t| {
                json!({
                    "hash": format!("{}...", &t.hash[..t.hash.len().min(20)]),
                    "name": t.name,
                    "permissions": t.permissions.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
                    "space_ids": t.space_ids,
                    "created_at": t.created_at,
                    "expires_at": t.expires_at,
                    "last_used_at": t.last_used_at,
                    "revoked": t.revoked,
                })
            })
            .collect();
        Ok(json!({
            "status": "ok",
            "total": tokens.len(),
            "tokens": tokens,
        }))
    }

    /// Soft-delete a token by hash or truncated hash prefix.
    pub async fn revoke(&self, hash_prefix: &str) -> ServiceResult {
        let needle = hash_prefix.trim_end_matches('.');
        if needle.is_empty() {
            return Err(ValidationError::Required("token_hash").into());
        }

        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let record = file
            .tokens
            .iter_mut()
            .find(|t| t.hash.starts_with(needle))
            .ok_or_else(|| ServiceError::NotFound("token not found".to_string()))?;
        record.revoked = true;
        let name = record.name.clone();
        self.save(&file).await?;

        tracing::info!(name = %name, "token revoked");
        Ok(json!({"status": "ok", "message": format!("token '{name}' revoked")}))
    }

    /// Change a token's scope and/or permissions. Empty arguments mean
    /// "leave unchanged".
    pub async fn update(
        &self,
        hash_prefix: &str,
        space_ids_csv: &str,
        permissions_csv: &str,
    ) -> ServiceResult {
        let needle = hash_prefix.trim_end_matches('.');
        if needle.is_empty() {
            return Err(ValidationError::Required("token_hash").into());
        }

        let new_permissions = if permissions_csv.trim().is_empty() {
            None
        } else {
            Some(Permission::parse_csv(permissions_csv)?)
        };
        let new_space_ids = if space_ids_csv.trim().is_empty() {
            None
        } else {
            let ids = livemem_core::validate::parse_csv_list(space_ids_csv);
            for space_id in &ids {
                livemem_core::validate::validate_space_id(space_id)?;
            }
            Some(ids)
        };

        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let record = file
            .tokens
            .iter_mut()
            .find(|t| t.hash.starts_with(needle))
            .ok_or_else(|| ServiceError::NotFound("token not found".to_string()))?;

        if let Some(permissions) = new_permissions {
            record.permissions = permissions;
        }
        if let Some(space_ids) = new_space_ids {
            record.space_ids = space_ids;
        }
        let name = record.name.clone();
        self.save(&file).await?;

        tracing::info!(name = %name, "token updated");
        Ok(json!({"status": "ok", "message": format!("token '{name}' updated")}))
    }

    /// Resolve a raw credential to its record. Revoked and expired tokens
    /// resolve to `None`.
    ///
    /// The registry is single-writer: the load, lookup and freshness check
    /// run under the tokens mutex so a concurrent revoke or update is never
    /// observed half-applied. Only the `last_used_at` write-back is out of
    /// band; it re-reads the registry so it touches nothing but that field,
    /// and a failed refresh never fails the request.
    pub async fn validate(&self, raw: &str) -> Result<Option<TokenRecord>, ServiceError> {
        let hash = Self::hash_credential(raw);
        let now = Utc::now().to_rfc3339();

        let mut resolved = {
            let _guard = self.lock.lock().await;
            let file = self.load().await?;
            let Some(record) = file.tokens.iter().find(|t| t.hash == hash) else {
                return Ok(None);
            };
            if record.revoked || record.is_expired(&now) {
                return Ok(None);
            }
            record.clone()
        };
        resolved.last_used_at = Some(now.clone());

        if let Err(e) = self.touch_last_used(&hash, &now).await {
            tracing::debug!(error = %e, "last_used_at refresh failed");
        }

        Ok(Some(resolved))
    }

    /// Persist `last_used_at` for one record, against a fresh copy of the
    /// registry so nothing else is overwritten.
    async fn touch_last_used(&self, hash: &str, now: &str) -> Result<(), ServiceError> {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        if let Some(record) = file.tokens.iter_mut().find(|t| t.hash == hash) {
            record.last_used_at = Some(now.to_string());
            self.save(&file).await?;
        }
        Ok(())
    }
}

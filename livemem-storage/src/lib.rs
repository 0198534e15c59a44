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

//! Object-store layer.
//!
//! A single `Storage` façade over a pluggable backend:
//!
//! - [`s3::S3Backend`] speaks the S3 REST protocol directly over reqwest,
//!   with dual signature dispatch for vendors that want legacy signing on
//!   the data plane and modern signing on the metadata plane;
//! - [`memory::MemoryBackend`] is an ordered in-memory map for development
//!   and testing with identical observable semantics.
//!
//! Missing keys are an absent value, never an error. `list` paginates
//! internally; callers always see the complete result.

pub mod memory;
pub mod s3;
mod sign;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use s3::{S3Backend, S3Config};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can escape the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Network-level failure after retries.
    #[error("storage request failed: {0}")]
    Transport(String),

    /// The store answered with a status we do not handle.
    #[error("storage returned status {status} for '{key}': {message}")]
    Unexpected {
        status: u16,
        key: String,
        message: String,
    },

    /// A stored object that should be JSON is not. Surfaced, never
    /// silently rewritten.
    #[error("corrupt JSON object at '{key}': {message}")]
    CorruptJson { key: String, message: String },

    /// Bad endpoint or credentials configuration.
    #[error("storage configuration: {0}")]
    Config(String),
}

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Last-modified stamp as reported by the store (ISO-8601).
    pub modified: String,
}

/// An object fetched together with its listing entry.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    pub key: String,
    pub content: String,
    pub size: u64,
    pub modified: String,
}

/// Outcome of a connectivity probe.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub ok: bool,
    pub latency_ms: f64,
    pub message: Option<String>,
}

/// The operations every backend must provide.
#[async_trait]
pub trait ObjectStoreBackend: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()>;
    async fn head(&self, key: &str) -> StorageResult<bool>;
    /// Complete listing under a prefix; pagination handled internally.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>>;
    /// Common prefixes ("directories") under a prefix.
    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> StorageResult<Vec<String>>;
    /// Cheap reachability probe (HEAD bucket or equivalent).
    async fn probe(&self) -> StorageResult<()>;
}

/// Typed façade shared by every service.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn ObjectStoreBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn ObjectStoreBackend>) -> Self {
        Self { backend }
    }

    /// In-memory storage for development and tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.backend.get(key).await
    }

    pub async fn get_text(&self, key: &str) -> StorageResult<Option<String>> {
        match self.backend.get(key).await? {
            Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            None => Ok(None),
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let value =
                    serde_json::from_slice(&bytes).map_err(|e| StorageError::CorruptJson {
                        key: key.to_string(),
                        message: e.to_string(),
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn put_text(&self, key: &str, content: &str) -> StorageResult<()> {
        self.backend
            .put(
                key,
                content.as_bytes().to_vec(),
                "text/plain; charset=utf-8",
            )
            .await
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> StorageResult<()> {
        let body = serde_json::to_vec_pretty(value).map_err(|e| StorageError::CorruptJson {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.backend.put(key, body, "application/json").await
    }

    pub async fn put_bytes(&self, key: &str, body: Vec<u8>, content_type: &str) -> StorageResult<()> {
        self.backend.put(key, body, content_type).await
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        self.backend.delete(key).await
    }

    /// Delete a set of keys one by one, best effort. The vendor rejects
    /// batch delete on the legacy-signed data plane, and a partial failure
    /// must not abort the rest.
    pub async fn delete_many(&self, keys: &[String]) -> usize {
        let mut deleted = 0;
        for key in keys {
            match self.backend.delete(key).await {
                Ok(()) => deleted += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "delete failed, continuing");
                }
            }
        }
        deleted
    }

    pub async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        self.backend.copy(source_key, dest_key).await
    }

    pub async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.backend.head(key).await
    }

    pub async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        self.backend.list(prefix).await
    }

    pub async fn list_prefixes(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.backend.list_prefixes(prefix, "/").await
    }

    /// List a prefix and fetch every object's content, optionally skipping
    /// `.keep` sentinels. Objects deleted between list and get are skipped.
    pub async fn load_prefix(
        &self,
        prefix: &str,
        exclude_keep: bool,
    ) -> StorageResult<Vec<FetchedObject>> {
        let objects = self.backend.list(prefix).await?;
        let mut out = Vec::with_capacity(objects.len());
        for info in objects {
            if exclude_keep && info.key.ends_with(".keep") {
                continue;
            }
            if let Some(bytes) = self.backend.get(&info.key).await? {
                out.push(FetchedObject {
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                    key: info.key,
                    size: info.size,
                    modified: info.modified,
                });
            }
        }
        Ok(out)
    }

    /// Probe the store and measure latency.
    pub async fn test_connection(&self) -> ConnectionReport {
        let start = Instant::now();
        match self.backend.probe().await {
            Ok(()) => ConnectionReport {
                ok: true,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                message: None,
            },
            Err(e) => ConnectionReport {
                ok: false,
                latency_ms: start.elapsed().as_secs_f64() * 1000.0,
                message: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let storage = Storage::in_memory();
        let value = serde_json::json!({"a": 1, "b": ["x", "y"]});
        storage.put_json("t/obj.json", &value).await.unwrap();

        let back: serde_json::Value = storage.get_json("t/obj.json").await.unwrap().unwrap();
        assert_eq!(back, value);

        let missing: Option<serde_json::Value> = storage.get_json("t/missing").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn corrupt_json_is_an_error_not_absent() {
        let storage = Storage::in_memory();
        storage.put_text("t/bad.json", "{not json").await.unwrap();
        let err = storage
            .get_json::<serde_json::Value>("t/bad.json")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::CorruptJson { .. }));
    }

    #[tokio::test]
    async fn load_prefix_skips_keep() {
        let storage = Storage::in_memory();
        storage.put_text("s/live/.keep", "").await.unwrap();
        storage.put_text("s/live/a.md", "alpha").await.unwrap();
        storage.put_text("s/live/b.md", "beta").await.unwrap();

        let all = storage.load_prefix("s/live/", true).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|o| !o.key.ends_with(".keep")));

        let with_keep = storage.load_prefix("s/live/", false).await.unwrap();
        assert_eq!(with_keep.len(), 3);
    }

    #[tokio::test]
    async fn delete_many_is_best_effort() {
        let storage = Storage::in_memory();
        storage.put_text("s/a", "1").await.unwrap();
        storage.put_text("s/b", "2").await.unwrap();
        let deleted = storage
            .delete_many(&["s/a".to_string(), "s/missing".to_string(), "s/b".to_string()])
            .await;
        // Deleting a missing key is a no-op success on the store.
        assert_eq!(deleted, 3);
        assert!(!storage.exists("s/a").await.unwrap());
    }
}

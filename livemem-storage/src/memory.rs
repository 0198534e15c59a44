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

//! In-memory backend for development and testing.
//!
//! A `BTreeMap` keyed by object key reproduces the lexicographic listing
//! order of a real bucket. Production uses [`crate::s3::S3Backend`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use crate::{ObjectInfo, ObjectStoreBackend, StorageResult};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified: String,
}

/// Ordered in-memory object store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects, for assertions in tests.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.objects.read().await.get(key).map(|o| o.data.clone()))
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> StorageResult<()> {
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data: body,
                modified: chrono::Utc::now().to_rfc3339(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        // Deleting a missing key succeeds, like the real store.
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        if let Some(obj) = objects.get(source_key).cloned() {
            objects.insert(dest_key.to_string(), obj);
        }
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectInfo>> {
        Ok(self
            .objects
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                modified: o.modified.clone(),
            })
            .collect())
    }

    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> StorageResult<Vec<String>> {
        let objects = self.objects.read().await;
        let mut prefixes = Vec::new();
        for key in objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k)
        {
            let rest = &key[prefix.len()..];
            if let Some(pos) = rest.find(delimiter) {
                let common = format!("{prefix}{}{delimiter}", &rest[..pos]);
                if prefixes.last() != Some(&common) && !prefixes.contains(&common) {
                    prefixes.push(common);
                }
            }
        }
        Ok(prefixes)
    }

    async fn probe(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn list_is_prefix_scoped_and_ordered() {
        let store = MemoryBackend::new();
        for key in ["b/2", "a/1", "a/2", "ab/1"] {
            store.put(key, b"x".to_vec(), "text/plain").await.unwrap();
        }
        let listed = store.list("a/").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
    }

    #[tokio::test]
    async fn prefixes_deduplicate() {
        let store = MemoryBackend::new();
        for key in [
            "alpha/_meta.json",
            "alpha/live/x.md",
            "beta/_meta.json",
            "_system/tokens.json",
        ] {
            store.put(key, b"{}".to_vec(), "application/json").await.unwrap();
        }
        let prefixes = store.list_prefixes("", "/").await.unwrap();
        assert_eq!(prefixes, vec!["_system/", "alpha/", "beta/"]);
    }

    #[tokio::test]
    async fn copy_then_get() {
        let store = MemoryBackend::new();
        store.put("src", b"payload".to_vec(), "text/plain").await.unwrap();
        store.copy("src", "dst").await.unwrap();
        assert_eq!(store.get("dst").await.unwrap().unwrap(), b"payload");
    }
}

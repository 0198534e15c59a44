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

//! Space snapshots under the reserved `_backups/` prefix.
//!
//! A snapshot is a server-side copy of every object in the space into
//! `_backups/{space}/{timestamp}/`, plus a `_backup.json` descriptor. The
//! descriptor never travels: restore and download exclude it so a restored
//! space is byte-identical to the source.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;

use livemem_core::{
    backup_prefix, meta_key, parse_backup_id, BackupMeta, ValidationError, BACKUPS_PREFIX,
    BACKUP_META_FILE,
};
use livemem_storage::Storage;

use crate::archive::build_targz;
use crate::auth::Identity;
use crate::error::{ServiceError, ServiceResult};

pub struct BackupService {
    storage: Storage,
    retention_count: usize,
}

impl BackupService {
    pub fn new(storage: Storage, retention_count: usize) -> Self {
        Self {
            storage,
            retention_count,
        }
    }

    /// Snapshot a space. Write permission suffices; admin is not required.
    pub async fn create(&self, space_id: &str, description: &str) -> ServiceResult {
        if !self.storage.exists(&meta_key(space_id)).await? {
            return Err(ServiceError::space_not_found(space_id));
        }

        let now = Utc::now();
        let timestamp = now.format("%Y-%m-%dT%H-%M-%S").to_string();
        let prefix = backup_prefix(space_id, &timestamp);
        let backup_id = format!("{space_id}/{timestamp}");

        let objects = self.storage.list(&format!("{space_id}/")).await?;
        let mut total_size = 0u64;
        for object in &objects {
            let relative = &object.key[space_id.len() + 1..];
            self.storage
                .copy(&object.key, &format!("{prefix}{relative}"))
                .await?;
            total_size += object.size;
        }

        let descriptor = BackupMeta {
            backup_id: backup_id.clone(),
            space_id: space_id.to_string(),
            timestamp: timestamp.clone(),
            description: description.to_string(),
            files_count: objects.len() as u64,
            total_size,
            created_at: now.to_rfc3339(),
        };
        self.storage
            .put_json(&format!("{prefix}{BACKUP_META_FILE}"), &descriptor)
            .await?;

        let pruned = self.apply_retention(space_id).await?;

        tracing::info!(space = %space_id, backup = %backup_id, "backup created");

        Ok(json!({
            "status": "created",
            "backup_id": backup_id,
            "space_id": space_id,
            "timestamp": now.to_rfc3339(),
            "description": description,
            "files_backed_up": objects.len(),
            "total_size": total_size,
            "retention_pruned": pruned,
        }))
    }

    /// Keep the newest `retention_count` snapshots per space; ties at
    /// minute granularity break by the timestamp string itself.
    async fn apply_retention(&self, space_id: &str) -> Result<usize, ServiceError> {
        if self.retention_count == 0 {
            return Ok(0);
        }

        let mut timestamps: Vec<String> = self
            .storage
            .list_prefixes(&format!("{BACKUPS_PREFIX}/{space_id}/"))
            .await?
            .iter()
            .filter_map(|p| {
                p.trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .map(String::from)
            })
            .collect();
        timestamps.sort();

        let mut pruned = 0;
        while timestamps.len() > self.retention_count {
            let oldest = timestamps.remove(0);
            let prefix = backup_prefix(space_id, &oldest);
            let keys: Vec<String> = self
                .storage
                .list(&prefix)
                .await?
                .into_iter()
                .map(|o| o.key)
                .collect();
            self.storage.delete_many(&keys).await;
            pruned += 1;
            tracing::info!(space = %space_id, timestamp = %oldest, "retention pruned snapshot");
        }
        Ok(pruned)
    }

    /// List snapshots, scope-filtered by the identity.
    pub async fn list(&self, space_id: &str, identity: &Identity) -> ServiceResult {
        let space_ids = if space_id.is_empty() {
            self.storage
                .list_prefixes(&format!("{BACKUPS_PREFIX}/"))
                .await?
                .iter()
                .filter_map(|p| {
                    p.trim_end_matches('/')
                        .rsplit('/')
                        .next()
                        .map(String::from)
                })
                .collect()
        } else {
            vec![space_id.to_string()]
        };

        let mut backups = Vec::new();
        for sid in space_ids {
            if !identity.allows_space(&sid) {
                continue;
            }
            for prefix in self
                .storage
                .list_prefixes(&format!("{BACKUPS_PREFIX}/{sid}/"))
                .await?
            {
                let Some(timestamp) = prefix.trim_end_matches('/').rsplit('/').next() else {
                    continue;
                };
                let mut entry = json!({
                    "backup_id": format!("{sid}/{timestamp}"),
                    "space_id": sid,
                    "timestamp": timestamp,
                });
                if let Some(descriptor) = self
                    .storage
                    .get_json::<BackupMeta>(&format!("{prefix}{BACKUP_META_FILE}"))
                    .await
                    .unwrap_or(None)
                {
                    entry["description"] = json!(descriptor.description);
                    entry["files_count"] = json!(descriptor.files_count);
                    entry["total_size"] = json!(descriptor.total_size);
                }
                backups.push(entry);
            }
        }

        Ok(json!({
            "status": "ok",
            "total": backups.len(),
            "backups": backups,
        }))
    }

    /// Restore a snapshot into its original space id. The space must not
    /// exist; delete it first if it does.
    pub async fn restore(&self, backup_id: &str, confirm: bool) -> ServiceResult {
        if !confirm {
            return Err(ValidationError::ConfirmRequired.into());
        }
        let (space_id, timestamp) = parse_backup_id(backup_id)?;
        let prefix = backup_prefix(space_id, timestamp);

        let objects = self.storage.list(&prefix).await?;
        if objects.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "backup '{backup_id}' not found"
            )));
        }

        if self.storage.exists(&meta_key(space_id)).await? {
            return Err(ServiceError::AlreadyExists(format!(
                "space '{space_id}' already exists; delete it before restoring"
            )));
        }

        let mut restored = 0;
        for object in &objects {
            let relative = &object.key[prefix.len()..];
            if relative == BACKUP_META_FILE {
                continue;
            }
            self.storage
                .copy(&object.key, &format!("{space_id}/{relative}"))
                .await?;
            restored += 1;
        }

        tracing::info!(backup = %backup_id, files = restored, "backup restored");

        Ok(json!({
            "status": "ok",
            "backup_id": backup_id,
            "space_id": space_id,
            "files_restored": restored,
        }))
    }

    /// Snapshot as a base64 tar.gz.
    pub async fn download(&self, backup_id: &str) -> ServiceResult {
        let (space_id, timestamp) = parse_backup_id(backup_id)?;
        let prefix = backup_prefix(space_id, timestamp);

        let objects = self.storage.load_prefix(&prefix, false).await?;
        if objects.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "backup '{backup_id}' not found"
            )));
        }

        let entries: Vec<(String, Vec<u8>)> = objects
            .iter()
            .filter(|o| &o.key[prefix.len()..] != BACKUP_META_FILE)
            .map(|o| {
                (
                    o.key[prefix.len()..].to_string(),
                    o.content.as_bytes().to_vec(),
                )
            })
            .collect();
        let archive = build_targz(&entries)?;

        Ok(json!({
            "status": "ok",
            "backup_id": backup_id,
            "archive_base64": BASE64.encode(&archive),
            "archive_size": archive.len(),
            "files_count": entries.len(),
        }))
    }

    /// Remove a snapshot.
    pub async fn delete(&self, backup_id: &str, confirm: bool) -> ServiceResult {
        if !confirm {
            return Err(ValidationError::ConfirmRequired.into());
        }
        let (space_id, timestamp) = parse_backup_id(backup_id)?;
        let prefix = backup_prefix(space_id, timestamp);

        let keys: Vec<String> = self
            .storage
            .list(&prefix)
            .await?
            .into_iter()
            .map(|o| o.key)
            .collect();
        if keys.is_empty() {
            return Err(ServiceError::NotFound(format!(
                "backup '{backup_id}' not found"
            )));
        }

        let deleted = self.storage.delete_many(&keys).await;
        tracing::info!(backup = %backup_id, files = deleted, "backup deleted");

        Ok(json!({
            "status": "deleted",
            "backup_id": backup_id,
            "files_deleted": deleted,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::SpaceRepo;
    use livemem_core::Permission;

    fn admin() -> Identity {
        Identity {
            name: "admin".into(),
            permissions: vec![Permission::Admin, Permission::Read, Permission::Write],
            space_ids: vec![],
            hash_prefix: "bootstrap".into(),
        }
    }

    async fn setup() -> (BackupService, SpaceRepo, Storage) {
        let storage = Storage::in_memory();
        let spaces = SpaceRepo::new(storage.clone());
        spaces.create("demo", "d", "rules", "").await.unwrap();
        (BackupService::new(storage.clone(), 5), spaces, storage)
    }

    #[tokio::test]
    async fn create_mirrors_the_space_and_writes_a_descriptor() {
        let (backups, _, storage) = setup().await;
        storage.put_text("demo/bank/a.md", "alpha").await.unwrap();

        let created = backups.create("demo", "before refactor").await.unwrap();
        assert_eq!(created["status"], "created");
        assert_eq!(created["files_backed_up"], 5);

        let backup_id = created["backup_id"].as_str().unwrap();
        let (space, ts) = parse_backup_id(backup_id).unwrap();
        let prefix = backup_prefix(space, ts);
        assert!(storage
            .exists(&format!("{prefix}_meta.json"))
            .await
            .unwrap());
        let descriptor: BackupMeta = storage
            .get_json(&format!("{prefix}_backup.json"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(descriptor.description, "before refactor");
    }

    #[tokio::test]
    async fn restore_round_trips_and_refuses_existing_space() {
        let (backups, spaces, storage) = setup().await;
        storage.put_text("demo/bank/a.md", "alpha").await.unwrap();
        let created = backups.create("demo", "").await.unwrap();
        let backup_id = created["backup_id"].as_str().unwrap().to_string();

        let err = backups.restore(&backup_id, true).await.unwrap_err();
        assert_eq!(err.status(), "already_exists");

        spaces.delete("demo", true).await.unwrap();
        let restored = backups.restore(&backup_id, true).await.unwrap();
        assert_eq!(restored["files_restored"], 5);
        assert_eq!(
            storage.get_text("demo/bank/a.md").await.unwrap().unwrap(),
            "alpha"
        );
        // The descriptor did not travel.
        assert!(!storage.exists("demo/_backup.json").await.unwrap());
    }

    #[tokio::test]
    async fn restore_requires_confirm_and_valid_id() {
        let (backups, _, _) = setup().await;
        assert!(backups.restore("demo/2026-01-01T00-00-00", false).await.is_err());
        assert!(backups.restore("demo", true).await.is_err());
        assert_eq!(
            backups
                .restore("ghost/2026-01-01T00-00-00", true)
                .await
                .unwrap_err()
                .status(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_n() {
        let (_, _, storage) = setup().await;
        let backups = BackupService::new(storage.clone(), 2);
        for ts in [
            "2026-01-01T00-00-00",
            "2026-01-02T00-00-00",
            "2026-01-03T00-00-00",
        ] {
            storage
                .put_text(&format!("_backups/demo/{ts}/_meta.json"), "{}")
                .await
                .unwrap();
        }

        let pruned = backups.apply_retention("demo").await.unwrap();
        assert_eq!(pruned, 1);
        let remaining = storage.list_prefixes("_backups/demo/").await.unwrap();
        assert_eq!(
            remaining,
            vec![
                "_backups/demo/2026-01-02T00-00-00/",
                "_backups/demo/2026-01-03T00-00-00/"
            ]
        );
    }

    #[tokio::test]
    async fn list_is_scope_filtered() {
        let (backups, spaces, _) = setup().await;
        spaces.create("other", "", "r", "").await.unwrap();
        backups.create("demo", "").await.unwrap();
        backups.create("other", "").await.unwrap();

        let all = backups.list("", &admin()).await.unwrap();
        assert_eq!(all["total"], 2);

        let scoped = Identity {
            name: "t".into(),
            permissions: vec![Permission::Read],
            space_ids: vec!["demo".into()],
            hash_prefix: "sha256:x".into(),
        };
        let filtered = backups.list("", &scoped).await.unwrap();
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["backups"][0]["space_id"], "demo");
    }

    #[tokio::test]
    async fn download_and_delete() {
        let (backups, _, storage) = setup().await;
        let created = backups.create("demo", "").await.unwrap();
        let backup_id = created["backup_id"].as_str().unwrap().to_string();

        let downloaded = backups.download(&backup_id).await.unwrap();
        assert_eq!(downloaded["files_count"], 4);
        assert!(downloaded["archive_size"].as_u64().unwrap() > 0);

        let deleted = backups.delete(&backup_id, true).await.unwrap();
        assert_eq!(deleted["status"], "deleted");
        assert!(storage.list("_backups/demo/").await.unwrap().is_empty());
    }
}

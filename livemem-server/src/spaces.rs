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

//! Space lifecycle: create, list, info, rules, summary, export, delete.
//!
//! A space is one top-level key prefix. `_rules.md` is written exactly once
//! at creation and never mutated afterwards; everything else under the
//! prefix is service-managed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;

use livemem_core::{
    bank_prefix, basename, live_prefix, meta_key, rules_key, synthesis_key, validate, NoteKey,
    SpaceMeta,
};
use livemem_storage::Storage;

use crate::archive::build_targz;
use crate::auth::Identity;
use crate::error::{ServiceError, ServiceResult};

pub struct SpaceRepo {
    storage: Storage,
}

impl SpaceRepo {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn exists(&self, space_id: &str) -> Result<bool, ServiceError> {
        Ok(self.storage.exists(&meta_key(space_id)).await?)
    }

    pub async fn require(&self, space_id: &str) -> Result<(), ServiceError> {
        if self.exists(space_id).await? {
            Ok(())
        } else {
            Err(ServiceError::space_not_found(space_id))
        }
    }

    pub async fn load_meta(&self, space_id: &str) -> Result<SpaceMeta, ServiceError> {
        self.storage
            .get_json::<SpaceMeta>(&meta_key(space_id))
            .await?
            .ok_or_else(|| ServiceError::space_not_found(space_id))
    }

    pub async fn save_meta(&self, meta: &SpaceMeta) -> Result<(), ServiceError> {
        self.storage.put_json(&meta_key(&meta.space_id), meta).await?;
        Ok(())
    }

    /// Create a space: `_meta.json`, the immutable `_rules.md` and the two
    /// sentinel objects.
    pub async fn create(
        &self,
        space_id: &str,
        description: &str,
        rules: &str,
        owner: &str,
    ) -> ServiceResult {
        validate::validate_space_id(space_id)?;
        validate::validate_description(description)?;
        validate::validate_rules(rules)?;

        if self.exists(space_id).await? {
            return Err(ServiceError::AlreadyExists(format!(
                "space '{space_id}' already exists"
            )));
        }

        let now = Utc::now().to_rfc3339();
        let mut meta = SpaceMeta::new(space_id, description, owner, &now);
        meta.rules_size = rules.len() as u64;

        self.save_meta(&meta).await?;
        self.storage.put_text(&rules_key(space_id), rules).await?;
        self.storage
            .put_text(&format!("{}{}", live_prefix(space_id), livemem_core::KEEP_FILE), "")
            .await?;
        self.storage
            .put_text(&format!("{}{}", bank_prefix(space_id), livemem_core::KEEP_FILE), "")
            .await?;

        tracing::info!(space = %space_id, "space created");

        Ok(json!({
            "status": "created",
            "space_id": space_id,
            "description": description,
            "rules_size": meta.rules_size,
            "created_at": now,
        }))
    }

    /// List spaces visible to the identity, with note/bank counts.
    pub async fn list(&self, identity: &Identity) -> ServiceResult {
        let prefixes = self.storage.list_prefixes("").await?;

        let mut spaces = Vec::new();
        for prefix in prefixes {
            // System prefixes (_system/, _backups/) are not spaces.
            if prefix.starts_with('_') {
                continue;
            }
            let space_id = prefix.trim_end_matches('/').to_string();
            if !identity.allows_space(&space_id) {
                continue;
            }
            let Some(meta) = self
                .storage
                .get_json::<SpaceMeta>(&meta_key(&space_id))
                .await?
            else {
                continue; // prefix without metadata is not a valid space
            };

            let live_count = self.count_objects(&live_prefix(&space_id)).await?;
            let bank_count = self.count_objects(&bank_prefix(&space_id)).await?;

            spaces.push(json!({
                "space_id": space_id,
                "description": meta.description,
                "owner": meta.owner,
                "created_at": meta.created_at,
                "live_notes_count": live_count,
                "bank_files_count": bank_count,
            }));
        }

        Ok(json!({
            "status": "ok",
            "total": spaces.len(),
            "spaces": spaces,
        }))
    }

    /// Detailed stats for one space.
    pub async fn info(&self, space_id: &str) -> ServiceResult {
        let meta = self.load_meta(space_id).await?;

        let live_objects = self.storage.list(&live_prefix(space_id)).await?;
        let live_files: Vec<_> = live_objects
            .iter()
            .filter(|o| !o.key.ends_with(livemem_core::KEEP_FILE))
            .collect();

        // Note keys sort chronologically, so the extremes come from the
        // parsed key stamps.
        let mut stamps: Vec<String> = live_files
            .iter()
            .filter_map(|o| NoteKey::parse(basename(&o.key)).map(|k| k.stamp))
            .collect();
        stamps.sort();

        let bank_objects = self.storage.list(&bank_prefix(space_id)).await?;
        let bank_files: Vec<_> = bank_objects
            .iter()
            .filter(|o| !o.key.ends_with(livemem_core::KEEP_FILE))
            .collect();

        let synthesis_exists = self.storage.exists(&synthesis_key(space_id)).await?;

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "description": meta.description,
            "owner": meta.owner,
            "created_at": meta.created_at,
            "live": {
                "notes_count": live_files.len(),
                "total_size": live_files.iter().map(|o| o.size).sum::<u64>(),
                "oldest_note": stamps.first(),
                "newest_note": stamps.last(),
            },
            "bank": {
                "files_count": bank_files.len(),
                "total_size": bank_files.iter().map(|o| o.size).sum::<u64>(),
                "files": bank_files.iter().map(|o| basename(&o.key)).collect::<Vec<_>>(),
            },
            "last_consolidation": meta.last_consolidation,
            "consolidation_count": meta.consolidation_count,
            "total_notes_processed": meta.total_notes_processed,
            "synthesis_exists": synthesis_exists,
        }))
    }

    pub async fn rules(&self, space_id: &str) -> ServiceResult {
        let rules = self
            .storage
            .get_text(&rules_key(space_id))
            .await?
            .ok_or_else(|| ServiceError::space_not_found(space_id))?;
        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "rules": rules,
        }))
    }

    /// Info + rules + full bank content + synthesis: the one call an agent
    /// makes at startup.
    pub async fn summary(&self, space_id: &str) -> ServiceResult {
        let meta = self.load_meta(space_id).await?;
        let rules = self
            .storage
            .get_text(&rules_key(space_id))
            .await?
            .unwrap_or_default();

        let bank = self
            .storage
            .load_prefix(&bank_prefix(space_id), true)
            .await?;
        let bank_files: Vec<_> = bank
            .iter()
            .map(|o| {
                json!({
                    "filename": basename(&o.key),
                    "content": o.content,
                    "size": o.size,
                })
            })
            .collect();

        let synthesis = self.storage.get_text(&synthesis_key(space_id)).await?;

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "description": meta.description,
            "rules": rules,
            "bank_file_count": bank_files.len(),
            "bank_files": bank_files,
            "synthesis": synthesis,
        }))
    }

    /// Whole space as a base64 tar.gz, read-only.
    pub async fn export(&self, space_id: &str) -> ServiceResult {
        self.require(space_id).await?;

        let objects = self
            .storage
            .load_prefix(&format!("{space_id}/"), false)
            .await?;
        let entries: Vec<(String, Vec<u8>)> = objects
            .iter()
            .map(|o| {
                (
                    o.key[space_id.len() + 1..].to_string(),
                    o.content.as_bytes().to_vec(),
                )
            })
            .collect();

        let archive = build_targz(&entries)?;

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "archive_base64": BASE64.encode(&archive),
            "archive_size": archive.len(),
            "files_count": entries.len(),
        }))
    }

    /// Delete a space and everything under it. Irreversible; the caller
    /// must pass `confirm=true`.
    pub async fn delete(&self, space_id: &str, confirm: bool) -> ServiceResult {
        if !confirm {
            return Err(livemem_core::ValidationError::ConfirmRequired.into());
        }
        self.require(space_id).await?;

        let objects = self.storage.list(&format!("{space_id}/")).await?;
        let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
        let deleted = self.storage.delete_many(&keys).await;

        tracing::info!(space = %space_id, files = deleted, "space deleted");

        Ok(json!({
            "status": "deleted",
            "space_id": space_id,
            "files_deleted": deleted,
        }))
    }

    async fn count_objects(&self, prefix: &str) -> Result<usize, ServiceError> {
        Ok(self
            .storage
            .list(prefix)
            .await?
            .iter()
            .filter(|o| !o.key.ends_with(livemem_core::KEEP_FILE))
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livemem_core::Permission;

    fn admin() -> Identity {
        Identity {
            name: "admin".into(),
            permissions: vec![Permission::Admin, Permission::Read, Permission::Write],
            space_ids: vec![],
            hash_prefix: "bootstrap".into(),
        }
    }

    fn repo() -> (SpaceRepo, Storage) {
        let storage = Storage::in_memory();
        (SpaceRepo::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn create_writes_the_four_objects() {
        let (repo, storage) = repo();
        let result = repo
            .create("demo", "a demo", "# Rules\n- one file", "alice")
            .await
            .unwrap();
        assert_eq!(result["status"], "created");

        assert!(storage.exists("demo/_meta.json").await.unwrap());
        assert!(storage.exists("demo/_rules.md").await.unwrap());
        assert!(storage.exists("demo/live/.keep").await.unwrap());
        assert!(storage.exists("demo/bank/.keep").await.unwrap());
    }

    #[tokio::test]
    async fn create_twice_preserves_rules() {
        let (repo, storage) = repo();
        repo.create("demo", "", "original rules", "").await.unwrap();
        let err = repo.create("demo", "", "other rules", "").await.unwrap_err();
        assert_eq!(err.status(), "already_exists");
        assert_eq!(
            storage.get_text("demo/_rules.md").await.unwrap().unwrap(),
            "original rules"
        );
    }

    #[tokio::test]
    async fn create_validates_inputs() {
        let (repo, _) = repo();
        assert!(repo.create("_bad", "", "", "").await.is_err());
        assert!(repo
            .create("ok", &"d".repeat(501), "", "")
            .await
            .is_err());
        assert!(repo
            .create("ok", "", &"r".repeat(50_001), "")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn list_filters_by_scope_and_skips_system_prefixes() {
        let (repo, storage) = repo();
        repo.create("alpha", "", "", "").await.unwrap();
        repo.create("beta", "", "", "").await.unwrap();
        storage
            .put_text("_system/tokens.json", "{\"version\":1,\"tokens\":[]}")
            .await
            .unwrap();

        let all = repo.list(&admin()).await.unwrap();
        assert_eq!(all["total"], 2);

        let scoped = Identity {
            name: "t".into(),
            permissions: vec![Permission::Read],
            space_ids: vec!["beta".into()],
            hash_prefix: "sha256:x".into(),
        };
        let filtered = repo.list(&scoped).await.unwrap();
        assert_eq!(filtered["total"], 1);
        assert_eq!(filtered["spaces"][0]["space_id"], "beta");
    }

    #[tokio::test]
    async fn info_reports_counts_and_synthesis() {
        let (repo, storage) = repo();
        repo.create("demo", "", "rules", "").await.unwrap();
        storage
            .put_text("demo/live/20260220T180000_cline_todo_a1b2c3d4.md", "note")
            .await
            .unwrap();
        storage.put_text("demo/bank/journal.md", "bank").await.unwrap();

        let info = repo.info("demo").await.unwrap();
        assert_eq!(info["live"]["notes_count"], 1);
        assert_eq!(info["bank"]["files_count"], 1);
        assert_eq!(info["bank"]["files"][0], "journal.md");
        assert_eq!(info["live"]["oldest_note"], "20260220T180000");
        assert_eq!(info["synthesis_exists"], false);
    }

    #[tokio::test]
    async fn delete_requires_confirm_and_removes_everything() {
        let (repo, storage) = repo();
        repo.create("demo", "", "rules", "").await.unwrap();

        let err = repo.delete("demo", false).await.unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(storage.exists("demo/_meta.json").await.unwrap());

        let result = repo.delete("demo", true).await.unwrap();
        assert_eq!(result["status"], "deleted");
        assert!(storage.list("demo/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn export_contains_every_object() {
        let (repo, storage) = repo();
        repo.create("demo", "", "rules", "").await.unwrap();
        storage.put_text("demo/bank/a.md", "alpha").await.unwrap();

        let result = repo.export("demo").await.unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["files_count"], 5);
        assert!(result["archive_size"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn missing_space_is_not_found() {
        let (repo, _) = repo();
        assert_eq!(repo.info("nope").await.unwrap_err().status(), "not_found");
        assert_eq!(repo.rules("nope").await.unwrap_err().status(), "not_found");
        assert_eq!(
            repo.export("nope").await.unwrap_err().status(),
            "not_found"
        );
    }
}

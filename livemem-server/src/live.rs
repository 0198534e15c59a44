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

//! Live notes: append-only writes, filtered reads, substring search.
//!
//! Notes are the multi-agent collaboration surface. One note is one object
//! with a key that never collides, so writes take no locks and never
//! serialize against each other or against a running consolidation.

use chrono::Utc;
use serde_json::json;

use livemem_core::{basename, live_key, live_prefix, meta_key, note, validate, NoteCategory};
use livemem_storage::Storage;

use crate::error::{ServiceError, ServiceResult};

pub struct LiveNotes {
    storage: Storage,
}

impl LiveNotes {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Append one note. Exactly one PUT, no locks.
    pub async fn note(
        &self,
        space_id: &str,
        category: &str,
        content: &str,
        agent: &str,
        tags_csv: &str,
    ) -> ServiceResult {
        let category = NoteCategory::parse(category)?;
        validate::validate_agent(agent)?;
        validate::validate_content(content)?;

        if !self.storage.exists(&meta_key(space_id)).await? {
            return Err(ServiceError::space_not_found(space_id));
        }

        let tags = validate::parse_csv_list(tags_csv);
        let now = Utc::now();
        let filename = note::NoteKey::compose(now, agent, category);
        let body = note::compose_note_body(&now, agent, category, &tags, space_id, content);

        self.storage
            .put_text(&live_key(space_id, &filename), &body)
            .await?;

        Ok(json!({
            "status": "created",
            "space_id": space_id,
            "filename": filename,
            "category": category.as_str(),
            "agent": agent,
            "size": body.len(),
            "timestamp": now.to_rfc3339(),
        }))
    }

    /// Recent notes, newest first, with optional filters.
    pub async fn read(
        &self,
        space_id: &str,
        limit: usize,
        category: &str,
        agent: &str,
        since: &str,
    ) -> ServiceResult {
        if !self.storage.exists(&meta_key(space_id)).await? {
            return Err(ServiceError::space_not_found(space_id));
        }

        let mut notes = self.load_parsed(space_id).await?;
        notes.retain(|n| {
            (category.is_empty() || n.category == category)
                && (agent.is_empty() || n.agent == agent)
                && (since.is_empty() || n.timestamp.as_str() >= since)
        });
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let matched = notes.len();
        notes.truncate(limit);

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "total": notes.len(),
            "has_more": matched > limit,
            "notes": notes,
        }))
    }

    /// Case-insensitive substring search over note bodies.
    pub async fn search(&self, space_id: &str, query: &str, limit: usize) -> ServiceResult {
        if query.is_empty() {
            return Err(livemem_core::ValidationError::Required("query").into());
        }
        if !self.storage.exists(&meta_key(space_id)).await? {
            return Err(ServiceError::space_not_found(space_id));
        }

        let needle = query.to_lowercase();
        let mut notes = self.load_parsed(space_id).await?;
        notes.retain(|n| n.content.to_lowercase().contains(&needle));
        notes.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let matched = notes.len();
        notes.truncate(limit);

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "query": query,
            "total": notes.len(),
            "has_more": matched > limit,
            "notes": notes,
        }))
    }

    async fn load_parsed(&self, space_id: &str) -> Result<Vec<note::LiveNote>, ServiceError> {
        let objects = self
            .storage
            .load_prefix(&live_prefix(space_id), true)
            .await?;
        // Malformed notes are skipped silently; they stay for GC.
        Ok(objects
            .iter()
            .filter_map(|o| note::parse_note_body(basename(&o.key), &o.content))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spaces::SpaceRepo;
    use livemem_core::validate::MAX_CONTENT_LEN;

    async fn setup() -> (LiveNotes, Storage) {
        let storage = Storage::in_memory();
        SpaceRepo::new(storage.clone())
            .create("demo", "", "rules", "")
            .await
            .unwrap();
        (LiveNotes::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn note_writes_a_distinct_object() {
        let (live, storage) = setup().await;
        let first = live
            .note("demo", "observation", "build ok", "cline", "")
            .await
            .unwrap();
        let second = live
            .note("demo", "observation", "build ok", "cline", "")
            .await
            .unwrap();
        assert_ne!(first["filename"], second["filename"]);

        let listed = storage.list("demo/live/").await.unwrap();
        // .keep + two notes
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn note_body_round_trips_through_read() {
        let (live, _) = setup().await;
        live.note("demo", "decision", "pick X", "cline", "arch,api")
            .await
            .unwrap();

        let result = live.read("demo", 50, "", "", "").await.unwrap();
        assert_eq!(result["total"], 1);
        let note = &result["notes"][0];
        assert_eq!(note["content"], "pick X");
        assert_eq!(note["category"], "decision");
        assert_eq!(note["agent"], "cline");
        assert_eq!(note["tags"], json!(["arch", "api"]));
    }

    #[tokio::test]
    async fn content_boundary_is_exact() {
        let (live, _) = setup().await;
        let at_limit = "x".repeat(MAX_CONTENT_LEN);
        assert!(live
            .note("demo", "observation", &at_limit, "a", "")
            .await
            .is_ok());

        let over = "x".repeat(MAX_CONTENT_LEN + 1);
        let err = live
            .note("demo", "observation", &over, "a", "")
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(err.to_string().contains("content"));
    }

    #[tokio::test]
    async fn invalid_inputs_are_rejected() {
        let (live, _) = setup().await;
        assert!(live.note("demo", "rant", "x", "a", "").await.is_err());
        assert!(live.note("demo", "todo", "x", "_bad", "").await.is_err());
        assert_eq!(
            live.note("missing", "todo", "x", "a", "")
                .await
                .unwrap_err()
                .status(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn read_filters_compose() {
        let (live, _) = setup().await;
        live.note("demo", "todo", "one", "alice", "").await.unwrap();
        live.note("demo", "todo", "two", "bob", "").await.unwrap();
        live.note("demo", "issue", "three", "alice", "").await.unwrap();

        let todos = live.read("demo", 50, "todo", "", "").await.unwrap();
        assert_eq!(todos["total"], 2);

        let alice = live.read("demo", 50, "", "alice", "").await.unwrap();
        assert_eq!(alice["total"], 2);

        let both = live.read("demo", 50, "todo", "alice", "").await.unwrap();
        assert_eq!(both["total"], 1);
        assert_eq!(both["notes"][0]["content"], "one");
    }

    #[tokio::test]
    async fn read_limit_sets_has_more() {
        let (live, _) = setup().await;
        for i in 0..3 {
            live.note("demo", "progress", &format!("n{i}"), "a", "")
                .await
                .unwrap();
        }
        let result = live.read("demo", 2, "", "", "").await.unwrap();
        assert_eq!(result["total"], 2);
        assert_eq!(result["has_more"], true);
    }

    #[tokio::test]
    async fn search_is_case_insensitive() {
        let (live, _) = setup().await;
        live.note("demo", "insight", "The Cache pattern works", "a", "")
            .await
            .unwrap();
        live.note("demo", "insight", "unrelated", "a", "").await.unwrap();

        let result = live.search("demo", "cache", 20).await.unwrap();
        assert_eq!(result["total"], 1);
        assert!(result["notes"][0]["content"]
            .as_str()
            .unwrap()
            .contains("Cache"));
    }
}

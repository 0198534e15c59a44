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

//! The consolidation engine: live notes → memory bank.
//!
//! One language-model call per run. The pipeline snapshots the selected
//! note keys before doing anything else; the delete phase at the end
//! operates on that snapshot only, so notes written mid-run always survive.
//! Commit order is bank files, synthesis, metadata, then deletes — any
//! failure before the delete phase leaves every live note in place and the
//! next run retries.
//!
//! The caller holds the space's consolidation lock for the whole run.

use chrono::Utc;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use livemem_core::{
    bank_key, bank_prefix, basename, live_prefix, meta_key, rules_key, synthesis_key, BankAction,
    ConsolidationReply, NoteKey, SpaceMeta,
};
use livemem_storage::Storage;

use crate::error::{ServiceError, ServiceResult};
use crate::llm::{ChatMessage, LanguageModel, TokenUsage};

const SYSTEM_PROMPT: &str = "\
You are an assistant that maintains memory banks for collaborative projects.

Your mission: fold working notes into structured Markdown files according to
precise rules.

You receive:
1. the RULES that define the memory bank structure
2. the PREVIOUS SYNTHESIS (context from earlier consolidations)
3. the new LIVE NOTES to integrate
4. the current BANK FILES to update

You must return a JSON object with:
- \"bank_files\": the list of bank files you created or updated
- \"synthesis\": the residual synthesis of the notes you processed

Rules:
- follow the structure defined by the RULES exactly
- integrate the new information from the live notes
- keep existing information that is still relevant
- drop information the new notes make obsolete
- every bank file is pure Markdown, no front-matter
- the synthesis is concise but covers the key points
- if a bank file needs no change, DO NOT include it in bank_files";

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));
static JSON_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```json\s*(.*?)\s*```").expect("valid regex"));
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```\s*(.*?)\s*```").expect("valid regex"));

pub struct Consolidator {
    storage: Storage,
    llm: Arc<dyn LanguageModel>,
    timeout: Duration,
    max_notes: usize,
    max_tokens: u32,
    temperature: f32,
}

struct CollectedInputs {
    rules: String,
    synthesis: Option<String>,
    notes: Vec<NoteInput>,
    notes_remaining: usize,
    bank: Vec<(String, String)>,
}

struct NoteInput {
    key: String,
    content: String,
}

impl Consolidator {
    pub fn new(
        storage: Storage,
        llm: Arc<dyn LanguageModel>,
        timeout: Duration,
        max_notes: usize,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            storage,
            llm,
            timeout,
            max_notes,
            max_tokens,
            temperature,
        }
    }

    /// Run one consolidation. `agent_filter` restricts the note set to one
    /// agent; empty means all notes. The caller already holds the space's
    /// consolidation lock.
    pub async fn consolidate(&self, space_id: &str, agent_filter: &str) -> ServiceResult {
        let started = Instant::now();

        let meta = self
            .storage
            .get_json::<SpaceMeta>(&meta_key(space_id))
            .await?
            .ok_or_else(|| ServiceError::space_not_found(space_id))?;

        let inputs = self.collect_inputs(space_id, agent_filter).await?;
        if inputs.notes.is_empty() {
            return Ok(json!({
                "status": "ok",
                "space_id": space_id,
                "notes_processed": 0,
                "message": "no new notes to consolidate",
            }));
        }

        // Snapshot: only these keys may be deleted at the end, whatever is
        // written to live/ in the meantime.
        let snapshot: Vec<String> = inputs.notes.iter().map(|n| n.key.clone()).collect();

        let messages = self.build_prompt(space_id, &inputs);
        let (reply, usage) = self.call_model(messages).await?;
        reply.validate()?;

        let mut result = self
            .commit(space_id, meta, &reply, &snapshot, inputs.notes_remaining, usage)
            .await?;

        result["duration_seconds"] =
            json!((started.elapsed().as_secs_f64() * 10.0).round() / 10.0);
        tracing::info!(
            space = %space_id,
            notes = snapshot.len(),
            "consolidation complete"
        );
        Ok(result)
    }

    async fn collect_inputs(
        &self,
        space_id: &str,
        agent_filter: &str,
    ) -> Result<CollectedInputs, ServiceError> {
        let rules = self
            .storage
            .get_text(&rules_key(space_id))
            .await?
            .unwrap_or_default();
        let synthesis = self.storage.get_text(&synthesis_key(space_id)).await?;

        let mut notes: Vec<NoteInput> = self
            .storage
            .load_prefix(&live_prefix(space_id), true)
            .await?
            .into_iter()
            .filter(|o| {
                agent_filter.is_empty()
                    || NoteKey::parse(basename(&o.key))
                        .map(|k| k.agent == agent_filter)
                        .unwrap_or(false)
            })
            .map(|o| NoteInput {
                key: o.key,
                content: o.content,
            })
            .collect();
        // Keys embed the timestamp, so key order is chronological order.
        notes.sort_by(|a, b| a.key.cmp(&b.key));

        let notes_remaining = notes.len().saturating_sub(self.max_notes);
        notes.truncate(self.max_notes);

        let bank = self
            .storage
            .load_prefix(&bank_prefix(space_id), true)
            .await?
            .into_iter()
            .map(|o| (basename(&o.key).to_string(), o.content))
            .collect();

        Ok(CollectedInputs {
            rules,
            synthesis,
            notes,
            notes_remaining,
            bank,
        })
    }

    fn build_prompt(&self, space_id: &str, inputs: &CollectedInputs) -> Vec<ChatMessage> {
        let mut notes_section = String::new();
        let total = inputs.notes.len();
        for (index, note) in inputs.notes.iter().enumerate() {
            notes_section.push_str(&format!(
                "\n--- Note {}/{total} ---\n{}\n",
                index + 1,
                note.content
            ));
        }

        let bank_section = if inputs.bank.is_empty() {
            "No bank files yet. This is the first consolidation; create the files the rules ask for.".to_string()
        } else {
            let mut section = String::new();
            for (filename, content) in &inputs.bank {
                section.push_str(&format!(
                    "\n--- File: {filename} ---\n{content}\n--- End file: {filename} ---\n"
                ));
            }
            section
        };

        let user_prompt = format!(
            "=== RULES FOR SPACE \"{space_id}\" ===\n\
             {rules}\n\n\
             === PREVIOUS SYNTHESIS ===\n\
             {synthesis}\n\n\
             === LIVE NOTES TO INTEGRATE ({total} notes) ===\n\
             {notes_section}\n\
             === CURRENT BANK FILES ===\n\
             {bank_section}\n\
             === INSTRUCTIONS ===\n\
             Return a JSON object with exactly this structure:\n\
             {{\n\
             \x20 \"bank_files\": [\n\
             \x20   {{\n\
             \x20     \"filename\": \"file_name.md\",\n\
             \x20     \"content\": \"full Markdown content of the file\",\n\
             \x20     \"action\": \"created\" or \"updated\"\n\
             \x20   }}\n\
             \x20 ],\n\
             \x20 \"synthesis\": \"Markdown content of the residual synthesis\"\n\
             }}\n\n\
             IMPORTANT:\n\
             - include ONLY files that were modified or created\n\
             - unchanged files MUST NOT appear in bank_files\n\
             - the residual synthesis summarizes the processed notes\n\
             - bank file content is pure Markdown",
            rules = inputs.rules,
            synthesis = inputs
                .synthesis
                .as_deref()
                .unwrap_or("none — first consolidation"),
        );

        vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(user_prompt),
        ]
    }

    /// Call the model, parse the structured reply. One retry with a
    /// stricter reformulation on a malformed reply; a second failure aborts
    /// without touching any note.
    async fn call_model(
        &self,
        mut messages: Vec<ChatMessage>,
    ) -> Result<(ConsolidationReply, Option<TokenUsage>), ServiceError> {
        for attempt in 0..2 {
            let outcome = tokio::time::timeout(
                self.timeout,
                self.llm
                    .chat(messages.clone(), self.max_tokens, self.temperature),
            )
            .await
            .map_err(|_| {
                ServiceError::Upstream(format!(
                    "language model call timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ServiceError::Upstream(format!("language model call failed: {e}")))?;

            let extracted = extract_json(&outcome.content);
            match serde_json::from_str::<ConsolidationReply>(&extracted) {
                Ok(reply) => return Ok((reply, outcome.usage)),
                Err(e) if attempt == 0 => {
                    tracing::warn!(error = %e, "model reply is not the expected JSON, retrying");
                    messages.push(ChatMessage::assistant(outcome.content));
                    messages.push(ChatMessage::user(
                        "Your reply was not a valid JSON object with \"bank_files\" and \
                         \"synthesis\". Return ONLY that JSON object, nothing else.",
                    ));
                }
                Err(_) => {
                    return Err(ServiceError::Upstream(
                        "language model returned invalid JSON after retry".to_string(),
                    ));
                }
            }
        }
        unreachable!("two attempts always return or error");
    }

    /// Commit phase. Ordered: bank files, synthesis, metadata, then the
    /// snapshot deletes. A failure anywhere before the deletes aborts with
    /// the live notes intact.
    async fn commit(
        &self,
        space_id: &str,
        mut meta: SpaceMeta,
        reply: &ConsolidationReply,
        snapshot: &[String],
        notes_remaining: usize,
        usage: Option<TokenUsage>,
    ) -> ServiceResult {
        let mut files_created = 0u64;
        let mut files_updated = 0u64;

        for file in &reply.bank_files {
            self.storage
                .put_text(&bank_key(space_id, &file.filename), &file.content)
                .await?;
            match file.action {
                BankAction::Created => files_created += 1,
                BankAction::Updated => files_updated += 1,
            }
        }

        let now = Utc::now().to_rfc3339();
        let synthesis_md = format!(
            "---\nconsolidated_at: \"{now}\"\nnotes_processed: {}\n---\n\n{}",
            snapshot.len(),
            reply.synthesis,
        );
        self.storage
            .put_text(&synthesis_key(space_id), &synthesis_md)
            .await?;

        meta.last_consolidation = Some(now);
        meta.consolidation_count += 1;
        meta.total_notes_processed += snapshot.len() as u64;
        self.storage.put_json(&meta_key(space_id), &meta).await?;

        // Only now is it safe to drop the consumed notes.
        self.storage.delete_many(snapshot).await;

        let bank_total = self
            .storage
            .list(&bank_prefix(space_id))
            .await?
            .iter()
            .filter(|o| !o.key.ends_with(livemem_core::KEEP_FILE))
            .count() as u64;
        let files_unchanged = bank_total.saturating_sub(files_created + files_updated);

        let usage = usage.unwrap_or_default();
        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "notes_processed": snapshot.len(),
            "notes_remaining": notes_remaining,
            "bank_files_created": files_created,
            "bank_files_updated": files_updated,
            "bank_files_unchanged": files_unchanged,
            "synthesis_size": reply.synthesis.len(),
            "llm_tokens_used": usage.total_tokens,
            "llm_prompt_tokens": usage.prompt_tokens,
            "llm_completion_tokens": usage.completion_tokens,
        }))
    }
}

/// Pull the JSON object out of a model reply that may wrap it in thinking
/// blocks, code fences, or prose.
fn extract_json(text: &str) -> String {
    let text = THINK_RE.replace_all(text, "");

    if let Some(captures) = JSON_FENCE_RE.captures(&text) {
        return captures[1].trim().to_string();
    }
    if let Some(captures) = FENCE_RE.captures(&text) {
        let candidate = captures[1].trim();
        if candidate.starts_with('{') {
            return candidate.to_string();
        }
    }

    let first = text.find('{');
    let last = text.rfind('}');
    if let (Some(first), Some(last)) = (first, last) {
        if last > first {
            return text[first..=last].to_string();
        }
    }

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;
    use crate::spaces::SpaceRepo;
    use async_trait::async_trait;
    use livemem_storage::{MemoryBackend, ObjectStoreBackend, StorageError, StorageResult};

    const GOOD_REPLY: &str = r##"{
        "bank_files": [
            {"filename": "journal.md", "content": "# Journal\n\n- build ok\n- pick X\n- write tests", "action": "created"}
        ],
        "synthesis": "Three notes consolidated into the journal."
    }"##;

    fn consolidator(storage: Storage, model: Arc<MockModel>) -> Consolidator {
        Consolidator::new(
            storage,
            model,
            Duration::from_secs(30),
            500,
            1000,
            0.3,
        )
    }

    async fn seed_space(storage: &Storage) {
        SpaceRepo::new(storage.clone())
            .create("demo", "demo space", "one file: journal.md", "")
            .await
            .unwrap();
    }

    async fn seed_note(storage: &Storage, stamp: &str, agent: &str, body: &str) -> String {
        let key = format!("demo/live/{stamp}_{agent}_observation_a1b2c3d4.md");
        let content = format!(
            "---\ntimestamp: \"2026-02-20T18:00:00+00:00\"\nagent: \"{agent}\"\ncategory: \"observation\"\ntags: []\nspace_id: \"demo\"\n---\n\n{body}"
        );
        storage.put_text(&key, &content).await.unwrap();
        key
    }

    #[tokio::test]
    async fn happy_path_writes_bank_and_deletes_notes() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        seed_note(&storage, "20260220T180000", "cline", "build ok").await;
        seed_note(&storage, "20260220T180001", "cline", "pick X").await;
        seed_note(&storage, "20260220T180002", "cline", "write tests").await;

        let model = Arc::new(MockModel::with_reply(GOOD_REPLY));
        let result = consolidator(storage.clone(), model.clone())
            .consolidate("demo", "")
            .await
            .unwrap();

        assert_eq!(result["status"], "ok");
        assert_eq!(result["notes_processed"], 3);
        assert_eq!(result["bank_files_created"], 1);
        assert_eq!(result["notes_remaining"], 0);

        let bank = storage.get_text("demo/bank/journal.md").await.unwrap().unwrap();
        assert!(bank.contains("build ok"));

        let synthesis = storage.get_text("demo/_synthesis.md").await.unwrap().unwrap();
        assert!(synthesis.starts_with("---\nconsolidated_at:"));
        assert!(synthesis.contains("notes_processed: 3"));

        // live/ holds only the sentinel now.
        let live = storage.list("demo/live/").await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].key.ends_with(".keep"));

        let meta: SpaceMeta = storage.get_json("demo/_meta.json").await.unwrap().unwrap();
        assert_eq!(meta.consolidation_count, 1);
        assert_eq!(meta.total_notes_processed, 3);
        assert!(meta.last_consolidation.is_some());
    }

    #[tokio::test]
    async fn zero_notes_skips_the_model() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;

        let model = Arc::new(MockModel::new());
        let result = consolidator(storage, model.clone())
            .consolidate("demo", "")
            .await
            .unwrap();

        assert_eq!(result["status"], "ok");
        assert_eq!(result["notes_processed"], 0);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn agent_filter_leaves_other_notes_alone() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        let alice_key = seed_note(&storage, "20260220T180000", "alice", "mine").await;
        let bob_key = seed_note(&storage, "20260220T180001", "bob", "his").await;

        let model = Arc::new(MockModel::with_reply(GOOD_REPLY));
        let result = consolidator(storage.clone(), model)
            .consolidate("demo", "alice")
            .await
            .unwrap();

        assert_eq!(result["notes_processed"], 1);
        assert!(!storage.exists(&alice_key).await.unwrap());
        assert!(storage.exists(&bob_key).await.unwrap());
    }

    #[tokio::test]
    async fn malformed_reply_retries_once_then_succeeds() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        seed_note(&storage, "20260220T180000", "cline", "note").await;

        let model = Arc::new(MockModel::new());
        model.push_reply("I think the answer is maybe 42?");
        model.push_reply(format!("```json\n{GOOD_REPLY}\n```"));

        let result = consolidator(storage, model.clone())
            .consolidate("demo", "")
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(model.call_count(), 2);

        // The retry appended the bad reply and a stricter instruction.
        let second_call = &model.calls()[1];
        assert_eq!(second_call.len(), 4);
        assert_eq!(second_call[2].role, "assistant");
        assert!(second_call[3].content.contains("ONLY"));
    }

    #[tokio::test]
    async fn double_failure_aborts_without_deleting() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        let key = seed_note(&storage, "20260220T180000", "cline", "note").await;

        let model = Arc::new(MockModel::new());
        model.push_reply("garbage");
        model.push_reply("more garbage");

        let err = consolidator(storage.clone(), model)
            .consolidate("demo", "")
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(storage.exists(&key).await.unwrap());
        assert!(!storage.exists("demo/_synthesis.md").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_filename_aborts_without_deleting() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        let key = seed_note(&storage, "20260220T180000", "cline", "note").await;

        let reply = r#"{
            "bank_files": [{"filename": "../escape.md", "content": "x", "action": "created"}],
            "synthesis": "s"
        }"#;
        let err = consolidator(storage.clone(), Arc::new(MockModel::with_reply(reply)))
            .consolidate("demo", "")
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");
        assert!(storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn oversize_set_reports_notes_remaining() {
        let storage = Storage::in_memory();
        seed_space(&storage).await;
        let k1 = seed_note(&storage, "20260220T180000", "cline", "oldest").await;
        let k2 = seed_note(&storage, "20260220T180001", "cline", "middle").await;
        let k3 = seed_note(&storage, "20260220T180002", "cline", "newest").await;

        let mut engine = consolidator(
            storage.clone(),
            Arc::new(MockModel::with_reply(GOOD_REPLY)),
        );
        engine.max_notes = 2;

        let result = engine.consolidate("demo", "").await.unwrap();
        assert_eq!(result["notes_processed"], 2);
        assert_eq!(result["notes_remaining"], 1);

        // Exactly the two oldest snapshotted notes are gone.
        assert!(!storage.exists(&k1).await.unwrap());
        assert!(!storage.exists(&k2).await.unwrap());
        assert!(storage.exists(&k3).await.unwrap());
    }

    // Backend that fails every PUT on one specific key.
    struct FailingPut {
        inner: MemoryBackend,
        fail_key: String,
    }

    #[async_trait]
    impl ObjectStoreBackend for FailingPut {
        async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> StorageResult<()> {
            if key == self.fail_key {
                return Err(StorageError::Transport("injected write failure".into()));
            }
            self.inner.put(key, body, content_type).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            self.inner.delete(key).await
        }
        async fn copy(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
            self.inner.copy(source_key, dest_key).await
        }
        async fn head(&self, key: &str) -> StorageResult<bool> {
            self.inner.head(key).await
        }
        async fn list(&self, prefix: &str) -> StorageResult<Vec<livemem_storage::ObjectInfo>> {
            self.inner.list(prefix).await
        }
        async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> StorageResult<Vec<String>> {
            self.inner.list_prefixes(prefix, delimiter).await
        }
        async fn probe(&self) -> StorageResult<()> {
            self.inner.probe().await
        }
    }

    #[tokio::test]
    async fn crash_during_commit_leaves_notes_intact() {
        let storage = Storage::new(Arc::new(FailingPut {
            inner: MemoryBackend::new(),
            fail_key: "demo/bank/second.md".to_string(),
        }));
        seed_space(&storage).await;
        let key = seed_note(&storage, "20260220T180000", "cline", "note").await;

        let reply = r#"{
            "bank_files": [
                {"filename": "first.md", "content": "a", "action": "created"},
                {"filename": "second.md", "content": "b", "action": "created"}
            ],
            "synthesis": "s"
        }"#;
        let err = consolidator(storage.clone(), Arc::new(MockModel::with_reply(reply)))
            .consolidate("demo", "")
            .await
            .unwrap_err();
        assert_eq!(err.status(), "error");

        // The first bank write may have landed, but nothing after the
        // failure did and the note survived.
        assert!(!storage.exists("demo/_synthesis.md").await.unwrap());
        assert!(storage.exists(&key).await.unwrap());
        let meta: SpaceMeta = storage.get_json("demo/_meta.json").await.unwrap().unwrap();
        assert_eq!(meta.consolidation_count, 0);
    }

    #[test]
    fn json_extraction_variants() {
        assert_eq!(extract_json(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(
            extract_json("<think>hmm, tricky</think>{\"a\":1}"),
            "{\"a\":1}"
        );
        assert_eq!(
            extract_json("Here is the result: {\"a\":1} as requested."),
            "{\"a\":1}"
        );
    }
}

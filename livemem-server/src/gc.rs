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

//! Garbage collection of orphaned live notes.
//!
//! Notes are normally consumed by the agent's own consolidation. When an
//! agent disappears, its notes linger; the collector finds notes older than
//! a threshold and either folds them into the bank through a forced
//! consolidation (default) or deletes them outright (data-loss path).
//!
//! The forced path first writes a synthetic notice note under the orphaned
//! agent's name, so the consolidation leaves a visible trace in the bank.

use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use livemem_core::{basename, live_prefix, meta_key, NoteKey};
use livemem_storage::Storage;

use crate::consolidator::Consolidator;
use crate::error::ServiceResult;
use crate::live::LiveNotes;
use crate::locks::LockRegistry;

pub struct GarbageCollector {
    storage: Storage,
    live: Arc<LiveNotes>,
    consolidator: Arc<Consolidator>,
    locks: Arc<LockRegistry>,
}

struct SpaceScan {
    total_notes: usize,
    old_keys: Vec<String>,
    old_size: u64,
    by_agent: BTreeMap<String, usize>,
    oldest: Option<String>,
}

impl GarbageCollector {
    pub fn new(
        storage: Storage,
        live: Arc<LiveNotes>,
        consolidator: Arc<Consolidator>,
        locks: Arc<LockRegistry>,
    ) -> Self {
        Self {
            storage,
            live,
            consolidator,
            locks,
        }
    }

    /// Entry point for `admin_gc_notes`.
    ///
    /// - `confirm=false`: dry-run report.
    /// - `confirm=true`: consolidate the orphans per (space, agent), or
    ///   delete them without a model call when `delete_only` is set.
    pub async fn run(
        &self,
        space_id: &str,
        max_age_days: u32,
        confirm: bool,
        delete_only: bool,
    ) -> ServiceResult {
        let cutoff = Utc::now() - Duration::days(max_age_days as i64);
        let cutoff_stamp = cutoff.format("%Y%m%dT%H%M%S").to_string();

        let space_ids = if space_id.is_empty() {
            self.all_space_ids().await?
        } else {
            vec![space_id.to_string()]
        };

        let mut scans: BTreeMap<String, SpaceScan> = BTreeMap::new();
        let mut total_old = 0usize;
        let mut total_size = 0u64;
        for sid in &space_ids {
            if !self.storage.exists(&meta_key(sid)).await? {
                continue;
            }
            let scan = self.scan_space(sid, &cutoff_stamp).await?;
            if !scan.old_keys.is_empty() {
                total_old += scan.old_keys.len();
                total_size += scan.old_size;
                scans.insert(sid.clone(), scan);
            }
        }

        let mut report = json!({
            "status": "ok",
            "max_age_days": max_age_days,
            "cutoff_date": cutoff.to_rfc3339(),
            "total_old_notes": total_old,
            "total_old_size": total_size,
            "spaces": self.space_report(&scans),
        });

        if !confirm {
            report["action"] = json!("scan");
            return Ok(report);
        }

        if delete_only {
            let mut deleted = 0;
            for scan in scans.values() {
                deleted += self.storage.delete_many(&scan.old_keys).await;
            }
            report["action"] = json!("delete");
            report["status"] = json!("deleted");
            report["deleted"] = json!(deleted);
            report["message"] = json!(format!(
                "{deleted} orphaned notes deleted WITHOUT consolidation in {} space(s)",
                scans.len()
            ));
            tracing::warn!(deleted, "gc deleted orphaned notes without consolidation");
            return Ok(report);
        }

        // Forced consolidation, one run per (space, agent).
        let mut consolidated = 0u64;
        let mut details = Map::new();
        for (sid, scan) in &scans {
            let mut per_agent = Map::new();
            for (agent, count) in &scan.by_agent {
                let notice = format!(
                    "GARBAGE COLLECTOR — forced consolidation\n\n\
                     The garbage collector found {count} orphaned notes from agent \
                     '{agent}' older than {max_age_days} days. The agent never \
                     consolidated them; they are now folded into the memory bank.\n\n\
                     Note: this consolidation is automatic. The integrated notes may \
                     lack context because the agent is no longer active."
                );
                if let Err(e) = self
                    .live
                    .note(sid, "observation", &notice, agent, "gc")
                    .await
                {
                    per_agent.insert(agent.clone(), json!({"status": "error", "message": e.to_string()}));
                    continue;
                }

                let Some(_guard) = self.locks.try_consolidation(sid) else {
                    per_agent.insert(
                        agent.clone(),
                        json!({"status": "skipped", "reason": "consolidation already in progress"}),
                    );
                    continue;
                };

                match self.consolidator.consolidate(sid, agent).await {
                    Ok(result) => {
                        let processed = result["notes_processed"].as_u64().unwrap_or(0);
                        consolidated += processed;
                        tracing::info!(space = %sid, agent = %agent, notes = processed, "gc consolidated orphans");
                        per_agent.insert(
                            agent.clone(),
                            json!({
                                "status": result["status"],
                                "notes_processed": processed,
                                "bank_files_created": result["bank_files_created"],
                                "bank_files_updated": result["bank_files_updated"],
                            }),
                        );
                    }
                    Err(e) => {
                        per_agent.insert(
                            agent.clone(),
                            json!({"status": e.status(), "message": e.to_string()}),
                        );
                    }
                }
            }
            details.insert(sid.clone(), Value::Object(per_agent));
        }

        report["action"] = json!("consolidate");
        report["consolidated"] = json!(consolidated);
        report["consolidation_details"] = Value::Object(details);
        report["message"] = json!(format!(
            "gc consolidated {consolidated} orphaned notes in {} space(s)",
            scans.len()
        ));
        Ok(report)
    }

    async fn all_space_ids(&self) -> Result<Vec<String>, crate::error::ServiceError> {
        Ok(self
            .storage
            .list_prefixes("")
            .await?
            .into_iter()
            .filter(|p| !p.starts_with('_'))
            .map(|p| p.trim_end_matches('/').to_string())
            .collect())
    }

    async fn scan_space(
        &self,
        space_id: &str,
        cutoff_stamp: &str,
    ) -> Result<SpaceScan, crate::error::ServiceError> {
        let objects = self.storage.list(&live_prefix(space_id)).await?;
        let mut scan = SpaceScan {
            total_notes: 0,
            old_keys: Vec::new(),
            old_size: 0,
            by_agent: BTreeMap::new(),
            oldest: None,
        };

        for object in objects {
            let Some(key) = NoteKey::parse(basename(&object.key)) else {
                continue;
            };
            scan.total_notes += 1;
            if key.stamp.as_str() < cutoff_stamp {
                scan.old_size += object.size;
                scan.old_keys.push(object.key.clone());
                *scan.by_agent.entry(key.agent).or_insert(0) += 1;
                if scan.oldest.as_deref().map(|o| key.stamp.as_str() < o).unwrap_or(true) {
                    scan.oldest = Some(key.stamp);
                }
            }
        }
        Ok(scan)
    }

    fn space_report(&self, scans: &BTreeMap<String, SpaceScan>) -> Value {
        let mut out = Map::new();
        for (sid, scan) in scans {
            out.insert(
                sid.clone(),
                json!({
                    "total_notes": scan.total_notes,
                    "old_notes": scan.old_keys.len(),
                    "old_notes_size": scan.old_size,
                    "by_agent": &scan.by_agent,
                    "oldest": &scan.oldest,
                }),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModel;
    use crate::spaces::SpaceRepo;
    use std::time::Duration as StdDuration;

    const REPLY: &str = r##"{
        "bank_files": [{"filename": "journal.md", "content": "# Journal", "action": "created"}],
        "synthesis": "gc sweep"
    }"##;

    async fn setup(model: Arc<MockModel>) -> (GarbageCollector, Storage) {
        let storage = Storage::in_memory();
        SpaceRepo::new(storage.clone())
            .create("demo", "", "rules", "")
            .await
            .unwrap();
        let live = Arc::new(LiveNotes::new(storage.clone()));
        let consolidator = Arc::new(Consolidator::new(
            storage.clone(),
            model,
            StdDuration::from_secs(30),
            500,
            1000,
            0.3,
        ));
        let locks = Arc::new(LockRegistry::new());
        (
            GarbageCollector::new(storage.clone(), live, consolidator, locks),
            storage,
        )
    }

    async fn seed_old_note(storage: &Storage, agent: &str, suffix: &str) -> String {
        // Ten days in the past, well beyond the default threshold.
        let stamp = (Utc::now() - Duration::days(10)).format("%Y%m%dT%H%M%S");
        let key = format!("demo/live/{stamp}_{agent}_observation_{suffix}.md");
        let body = format!(
            "---\ntimestamp: \"2026-02-10T12:00:00+00:00\"\nagent: \"{agent}\"\ncategory: \"observation\"\ntags: []\nspace_id: \"demo\"\n---\n\norphaned"
        );
        storage.put_text(&key, &body).await.unwrap();
        key
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching() {
        let (gc, storage) = setup(Arc::new(MockModel::new())).await;
        let key = seed_old_note(&storage, "ghost", "a1b2c3d4").await;

        let report = gc.run("demo", 7, false, false).await.unwrap();
        assert_eq!(report["action"], "scan");
        assert_eq!(report["total_old_notes"], 1);
        assert_eq!(report["spaces"]["demo"]["by_agent"]["ghost"], 1);
        assert!(storage.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn fresh_notes_are_not_orphans() {
        let (gc, storage) = setup(Arc::new(MockModel::new())).await;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S");
        storage
            .put_text(
                &format!("demo/live/{stamp}_alive_todo_a1b2c3d4.md"),
                "---\ntimestamp: \"x\"\nagent: \"alive\"\ncategory: \"todo\"\n---\n\nnew",
            )
            .await
            .unwrap();

        let report = gc.run("demo", 7, false, false).await.unwrap();
        assert_eq!(report["total_old_notes"], 0);
    }

    #[tokio::test]
    async fn delete_only_removes_without_model_call() {
        let model = Arc::new(MockModel::new());
        let (gc, storage) = setup(model.clone()).await;
        let key = seed_old_note(&storage, "ghost", "a1b2c3d4").await;

        let report = gc.run("demo", 7, true, true).await.unwrap();
        assert_eq!(report["status"], "deleted");
        assert_eq!(report["deleted"], 1);
        assert!(!storage.exists(&key).await.unwrap());
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn consolidate_path_writes_notice_and_sweeps() {
        let model = Arc::new(MockModel::with_reply(REPLY));
        let (gc, storage) = setup(model.clone()).await;
        seed_old_note(&storage, "ghost", "a1b2c3d4").await;
        seed_old_note(&storage, "ghost", "b2c3d4e5").await;

        let report = gc.run("demo", 7, true, false).await.unwrap();
        assert_eq!(report["action"], "consolidate");
        // Two orphans plus the notice note.
        assert_eq!(report["consolidated"], 3);
        assert_eq!(
            report["consolidation_details"]["demo"]["ghost"]["notes_processed"],
            3
        );

        // The notice reached the model prompt, so the trace lands in the bank.
        let prompt = &model.calls()[0][1].content;
        assert!(prompt.contains("GARBAGE COLLECTOR"));
        assert!(prompt.contains("2 orphaned notes"));

        // live/ holds only the sentinel afterwards.
        let live = storage.list("demo/live/").await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn held_lock_skips_the_space() {
        let model = Arc::new(MockModel::with_reply(REPLY));
        let (gc, storage) = setup(model.clone()).await;
        seed_old_note(&storage, "ghost", "a1b2c3d4").await;

        let _guard = gc.locks.try_consolidation("demo").unwrap();
        let report = gc.run("demo", 7, true, false).await.unwrap();
        assert_eq!(
            report["consolidation_details"]["demo"]["ghost"]["status"],
            "skipped"
        );
        assert_eq!(model.call_count(), 0);
        // Orphans and notice still present for the next sweep.
        assert!(storage.list("demo/live/").await.unwrap().len() > 1);
    }
}

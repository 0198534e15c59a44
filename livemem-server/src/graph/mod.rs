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

//! One-way bridge into an external knowledge-graph service.
//!
//! The bridge republishes a space's bank files into a remote memory with
//! delete-then-reingest semantics and cleans up remote documents that no
//! longer exist in the bank. Only `_meta.json` is ever mutated locally;
//! remote failures surface in the envelope and touch nothing else.

pub mod client;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use livemem_core::{bank_prefix, basename, GraphTarget};
use livemem_storage::Storage;

use crate::error::{ServiceError, ServiceResult};
use crate::spaces::SpaceRepo;
use client::{GraphConnector, GraphRemote};

/// Ontology labels the remote extractor understands.
pub const ALLOWED_ONTOLOGIES: [&str; 5] =
    ["general", "legal", "cloud", "managed-services", "presales"];

/// Per-call timeout when pushing documents (ingestion is slow).
const PUSH_TIMEOUT: Duration = Duration::from_secs(180);
/// Per-call timeout for probes and stats.
const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

pub struct GraphBridge {
    storage: Storage,
    spaces: Arc<SpaceRepo>,
    connector: Arc<dyn GraphConnector>,
}

impl GraphBridge {
    pub fn new(
        storage: Storage,
        spaces: Arc<SpaceRepo>,
        connector: Arc<dyn GraphConnector>,
    ) -> Self {
        Self {
            storage,
            spaces,
            connector,
        }
    }

    /// Connect a space to a remote memory: probe the service, create the
    /// memory if it does not exist, persist the configuration.
    pub async fn connect(
        &self,
        space_id: &str,
        url: &str,
        token: &str,
        memory_id: &str,
        ontology: &str,
    ) -> ServiceResult {
        let mut meta = self.spaces.load_meta(space_id).await?;

        if url.is_empty() || memory_id.is_empty() {
            return Err(ServiceError::Validation(
                "url and memory_id are required".to_string(),
            ));
        }
        if !ALLOWED_ONTOLOGIES.contains(&ontology) {
            return Err(ServiceError::Validation(format!(
                "invalid ontology '{ontology}': expected one of {}",
                ALLOWED_ONTOLOGIES.join(", ")
            )));
        }

        let mut remote = self.connector.connect(url, token, PROBE_TIMEOUT).await?;

        let health = remote.call_tool("system_health", json!({})).await?;
        if health["status"] == "error" {
            return Err(ServiceError::Upstream(format!(
                "graph service unavailable: {}",
                health["message"].as_str().unwrap_or("unknown error")
            )));
        }

        let memories = remote.call_tool("memory_list", json!({})).await?;
        let existing: Vec<&str> = memories["memories"]
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(|m| m["memory_id"].as_str().or_else(|| m["id"].as_str()))
                    .collect()
            })
            .unwrap_or_default();

        let mut memory_created = false;
        if !existing.contains(&memory_id) {
            let created = remote
                .call_tool(
                    "memory_create",
                    json!({
                        "memory_id": memory_id,
                        "name": format!("Live Memory — {space_id}"),
                        "description": format!("Memory bank synchronized from live-memory space '{space_id}'"),
                        "ontology": ontology,
                    }),
                )
                .await?;
            if created["status"] == "error" {
                return Err(ServiceError::Upstream(format!(
                    "cannot create memory '{memory_id}': {}",
                    created["message"].as_str().unwrap_or("")
                )));
            }
            memory_created = true;
            tracing::info!(memory = %memory_id, ontology = %ontology, "remote memory created");
        }

        meta.graph_memory = Some(GraphTarget {
            url: url.to_string(),
            token: token.to_string(),
            memory_id: memory_id.to_string(),
            ontology: ontology.to_string(),
            connected_at: Utc::now().to_rfc3339(),
            last_push_at: None,
            push_count: 0,
            last_stats: None,
        });
        self.spaces.save_meta(&meta).await?;

        tracing::info!(space = %space_id, memory = %memory_id, "space connected to graph service");

        Ok(json!({
            "status": "ok",
            "connected": true,
            "space_id": space_id,
            "graph_memory": {
                "url": url,
                "memory_id": memory_id,
                "ontology": ontology,
                "memory_created": memory_created,
            },
        }))
    }

    /// Push the bank: delete-then-reingest every current file, then remove
    /// remote documents that are no longer in the bank.
    pub async fn push(&self, space_id: &str) -> ServiceResult {
        let started = Instant::now();
        let mut meta = self.spaces.load_meta(space_id).await?;
        let Some(mut target) = meta.graph_memory.clone() else {
            return Err(ServiceError::Validation(format!(
                "space '{space_id}' is not connected to a graph service; use graph_connect first"
            )));
        };

        let bank: Vec<(String, String)> = self
            .storage
            .load_prefix(&bank_prefix(space_id), true)
            .await?
            .into_iter()
            .map(|o| (basename(&o.key).to_string(), o.content))
            .collect();

        if bank.is_empty() {
            return Ok(json!({
                "status": "ok",
                "space_id": space_id,
                "message": "no bank files to push",
                "pushed": 0,
                "cleaned_orphans": 0,
                "errors": 0,
            }));
        }

        let mut remote = self
            .connector
            .connect(&target.url, &target.token, PUSH_TIMEOUT)
            .await?;
        let memory_id = target.memory_id.clone();

        let listed = remote
            .call_tool("document_list", json!({"memory_id": memory_id}))
            .await?;
        let existing: Vec<String> = listed["documents"]
            .as_array()
            .map(|docs| {
                docs.iter()
                    .filter_map(|d| d["filename"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        tracing::info!(
            space = %space_id,
            memory = %memory_id,
            bank_files = bank.len(),
            remote_docs = existing.len(),
            "graph push starting"
        );

        let mut pushed = 0u64;
        let mut deleted_before_reingest = 0u64;
        let mut errors = 0u64;
        let mut error_details = Vec::new();

        for (filename, content) in &bank {
            // Delete first so re-ingestion never duplicates; an absent
            // document is fine.
            let deleted = remote
                .call_tool(
                    "document_delete",
                    json!({"memory_id": memory_id, "filename": filename}),
                )
                .await?;
            if deleted["status"] != "error" && existing.contains(filename) {
                deleted_before_reingest += 1;
            }

            let ingested = remote
                .call_tool(
                    "memory_ingest",
                    json!({
                        "memory_id": memory_id,
                        "filename": filename,
                        "content_base64": BASE64.encode(content.as_bytes()),
                        "ontology": target.ontology,
                    }),
                )
                .await?;
            if ingested["status"] == "error" {
                errors += 1;
                error_details.push(json!({
                    "filename": filename,
                    "error": ingested["message"],
                }));
                tracing::warn!(file = %filename, "graph ingest failed");
            } else {
                pushed += 1;
            }
        }

        // Remote documents with no bank counterpart are stale.
        let mut cleaned = 0u64;
        for orphan in existing
            .iter()
            .filter(|name| !bank.iter().any(|(f, _)| f == *name))
        {
            let deleted = remote
                .call_tool(
                    "document_delete",
                    json!({"memory_id": memory_id, "filename": orphan}),
                )
                .await?;
            if deleted["status"] != "error" {
                cleaned += 1;
                tracing::info!(file = %orphan, "cleaned orphaned remote document");
            }
        }

        // Refresh the cached stats; a failure here is not a push failure.
        let stats = remote
            .call_tool("memory_stats", json!({"memory_id": memory_id}))
            .await
            .unwrap_or_else(|e| json!({"status": "error", "message": e.to_string()}));
        if stats["status"] != "error" {
            target.last_stats = Some(json!({
                "document_count": stats["document_count"],
                "entity_count": stats["entity_count"],
                "relation_count": stats["relation_count"],
            }));
        }

        target.last_push_at = Some(Utc::now().to_rfc3339());
        target.push_count += 1;
        meta.graph_memory = Some(target);
        self.spaces.save_meta(&meta).await?;

        let duration = (started.elapsed().as_secs_f64() * 10.0).round() / 10.0;
        tracing::info!(
            space = %space_id,
            pushed,
            cleaned,
            errors,
            duration,
            "graph push complete"
        );

        let mut result = json!({
            "status": "ok",
            "space_id": space_id,
            "memory_id": memory_id,
            "pushed": pushed,
            "deleted_before_reingest": deleted_before_reingest,
            "cleaned_orphans": cleaned,
            "errors": errors,
            "duration_seconds": duration,
        });
        if !error_details.is_empty() {
            result["error_details"] = json!(error_details);
        }
        Ok(result)
    }

    /// Local configuration plus remote stats and document list.
    pub async fn status(&self, space_id: &str) -> ServiceResult {
        let meta = self.spaces.load_meta(space_id).await?;
        let Some(target) = meta.graph_memory else {
            return Ok(json!({
                "status": "ok",
                "space_id": space_id,
                "connected": false,
                "message": "no graph connection configured",
            }));
        };

        let config = json!({
            "url": target.url,
            "memory_id": target.memory_id,
            "ontology": target.ontology,
        });

        let mut remote = match self
            .connector
            .connect(&target.url, &target.token, PROBE_TIMEOUT)
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                return Ok(json!({
                    "status": "ok",
                    "space_id": space_id,
                    "connected": true,
                    "reachable": false,
                    "config": config,
                    "last_push_at": target.last_push_at,
                    "push_count": target.push_count,
                    "error": e.to_string(),
                }));
            }
        };

        let stats = remote
            .call_tool("memory_stats", json!({"memory_id": target.memory_id}))
            .await?;
        let (graph_stats, top_entities) = if stats["status"] != "error" {
            (
                json!({
                    "document_count": stats["document_count"],
                    "entity_count": stats["entity_count"],
                    "relation_count": stats["relation_count"],
                }),
                stats["top_entities"].clone(),
            )
        } else {
            (Value::Null, Value::Null)
        };

        let listed = remote
            .call_tool("document_list", json!({"memory_id": target.memory_id}))
            .await?;
        let documents = listed["documents"].clone();

        Ok(json!({
            "status": "ok",
            "space_id": space_id,
            "connected": true,
            "reachable": true,
            "config": config,
            "last_push_at": target.last_push_at,
            "push_count": target.push_count,
            "graph_stats": graph_stats,
            "graph_documents": documents,
            "top_entities": top_entities,
        }))
    }

    /// Forget the connection. Remote data is left intact.
    pub async fn disconnect(&self, space_id: &str) -> ServiceResult {
        let mut meta = self.spaces.load_meta(space_id).await?;
        let Some(target) = meta.graph_memory.take() else {
            return Ok(json!({
                "status": "ok",
                "space_id": space_id,
                "message": "space is not connected to a graph service",
            }));
        };

        self.spaces.save_meta(&meta).await?;
        tracing::info!(space = %space_id, memory = %target.memory_id, "graph disconnected");

        Ok(json!({
            "status": "ok",
            "disconnected": true,
            "space_id": space_id,
            "was_connected_to": {
                "url": target.url,
                "memory_id": target.memory_id,
                "push_count": target.push_count,
            },
        }))
    }
}

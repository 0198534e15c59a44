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

//! The tool surface: catalogue and dispatch.
//!
//! Every tool is a thin wrapper: resolve the identity, apply the declared
//! permission and scope checks, call the domain service, return the
//! envelope. `system_health` and `system_about` are anonymous; everything
//! else requires an authenticated identity.

use serde_json::{json, Map, Value};

use livemem_core::{bank_key, bank_prefix, basename, meta_key, validate};

use crate::auth::{audit, Identity};
use crate::error::{ServiceError, ServiceResult};
use crate::mcp::protocol::Tool;
use crate::AppState;

// =============================================================================
// Catalogue
// =============================================================================

fn tool(name: &str, description: &str, schema: Value) -> Tool {
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: schema,
    }
}

fn schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// The 30 tools this server exposes.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        // ── System ──────────────────────────────────────────────
        tool(
            "system_health",
            "Service health: storage connectivity and configured model.",
            schema(json!({}), &[]),
        ),
        tool(
            "system_about",
            "Server name, version and tool catalogue.",
            schema(json!({}), &[]),
        ),
        // ── Space ───────────────────────────────────────────────
        tool(
            "space_create",
            "Create a memory space with its immutable rules.",
            schema(
                json!({
                    "space_id": {"type": "string", "description": "Unique id, alphanumeric plus '-' and '_', max 64 chars"},
                    "description": {"type": "string"},
                    "rules": {"type": "string", "description": "Markdown rules defining the memory bank structure"},
                    "owner": {"type": "string"},
                }),
                &["space_id", "rules"],
            ),
        ),
        tool(
            "space_list",
            "List accessible spaces with note and bank counts.",
            schema(json!({}), &[]),
        ),
        tool(
            "space_info",
            "Detailed statistics for one space.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "space_rules",
            "The immutable rules of a space.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "space_summary",
            "Rules, bank content and synthesis in one call (agent startup).",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "space_export",
            "Export a whole space as a base64 tar.gz archive.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "space_delete",
            "Delete a space and all of its data. Irreversible; admin only.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "confirm": {"type": "boolean", "description": "Must be true"},
                }),
                &["space_id", "confirm"],
            ),
        ),
        // ── Live ────────────────────────────────────────────────
        tool(
            "live_note",
            "Append one timestamped note. No locks, no conflicts.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "category": {"type": "string", "description": "observation, decision, todo, insight, question, progress or issue"},
                    "content": {"type": "string"},
                    "agent": {"type": "string", "description": "Authoring agent; defaults to the identity name"},
                    "tags": {"type": "string", "description": "Comma-separated tags"},
                }),
                &["space_id", "category", "content"],
            ),
        ),
        tool(
            "live_read",
            "Recent notes, newest first, with optional filters.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "limit": {"type": "integer", "default": 50},
                    "category": {"type": "string"},
                    "agent": {"type": "string"},
                    "since": {"type": "string", "description": "ISO-8601 lower bound"},
                }),
                &["space_id"],
            ),
        ),
        tool(
            "live_search",
            "Case-insensitive substring search over note bodies.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "default": 20},
                }),
                &["space_id", "query"],
            ),
        ),
        // ── Bank ────────────────────────────────────────────────
        tool(
            "bank_read",
            "Read one memory-bank file.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "filename": {"type": "string"},
                }),
                &["space_id", "filename"],
            ),
        ),
        tool(
            "bank_read_all",
            "Read the whole memory bank in one call.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "bank_list",
            "List memory-bank files without their content.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "bank_consolidate",
            "Fold live notes into the memory bank through the language model. One run per space at a time.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "agent": {"type": "string", "description": "Restrict to one agent's notes; admin only for other agents or all"},
                }),
                &["space_id"],
            ),
        ),
        // ── Graph ───────────────────────────────────────────────
        tool(
            "graph_connect",
            "Connect a space to an external knowledge-graph service.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "url": {"type": "string", "description": "SSE base URL of the graph service"},
                    "token": {"type": "string"},
                    "memory_id": {"type": "string"},
                    "ontology": {"type": "string", "default": "general"},
                }),
                &["space_id", "url", "token", "memory_id"],
            ),
        ),
        tool(
            "graph_push",
            "Republish the bank into the connected graph memory (delete-then-reingest).",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "graph_status",
            "Connection status and remote graph statistics.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        tool(
            "graph_disconnect",
            "Remove the graph connection; remote data is kept.",
            schema(json!({"space_id": {"type": "string"}}), &["space_id"]),
        ),
        // ── Backup ──────────────────────────────────────────────
        tool(
            "backup_create",
            "Snapshot a space under the reserved backups prefix.",
            schema(
                json!({
                    "space_id": {"type": "string"},
                    "description": {"type": "string"},
                }),
                &["space_id"],
            ),
        ),
        tool(
            "backup_list",
            "List snapshots, optionally for one space.",
            schema(json!({"space_id": {"type": "string"}}), &[]),
        ),
        tool(
            "backup_download",
            "Download a snapshot as a base64 tar.gz archive.",
            schema(json!({"backup_id": {"type": "string"}}), &["backup_id"]),
        ),
        tool(
            "backup_restore",
            "Restore a snapshot; the space must not exist. Admin only.",
            schema(
                json!({
                    "backup_id": {"type": "string"},
                    "confirm": {"type": "boolean"},
                }),
                &["backup_id", "confirm"],
            ),
        ),
        tool(
            "backup_delete",
            "Delete a snapshot. Admin only.",
            schema(
                json!({
                    "backup_id": {"type": "string"},
                    "confirm": {"type": "boolean"},
                }),
                &["backup_id", "confirm"],
            ),
        ),
        // ── Admin ───────────────────────────────────────────────
        tool(
            "admin_create_token",
            "Create an access token. The plain value is shown exactly once.",
            schema(
                json!({
                    "name": {"type": "string"},
                    "permissions": {"type": "string", "description": "Comma-separated: read, write, admin"},
                    "space_ids": {"type": "string", "description": "Comma-separated scope; empty means all spaces"},
                    "expires_in_days": {"type": "integer", "default": 0},
                }),
                &["name", "permissions"],
            ),
        ),
        tool(
            "admin_list_tokens",
            "List tokens (metadata only, hashes truncated).",
            schema(json!({}), &[]),
        ),
        tool(
            "admin_revoke_token",
            "Revoke a token by hash or truncated hash.",
            schema(json!({"token_hash": {"type": "string"}}), &["token_hash"]),
        ),
        tool(
            "admin_update_token",
            "Change a token's scope or permissions.",
            schema(
                json!({
                    "token_hash": {"type": "string"},
                    "space_ids": {"type": "string"},
                    "permissions": {"type": "string"},
                }),
                &["token_hash"],
            ),
        ),
        tool(
            "admin_gc_notes",
            "Find notes older than a threshold and consolidate or delete them.",
            schema(
                json!({
                    "space_id": {"type": "string", "description": "Empty scans every space"},
                    "max_age_days": {"type": "integer", "default": 7},
                    "confirm": {"type": "boolean", "default": false},
                    "delete_only": {"type": "boolean", "default": false},
                }),
                &[],
            ),
        ),
    ]
}

// =============================================================================
// Dispatch
// =============================================================================

fn arg_str<'a>(args: &'a Map<String, Value>, key: &str) -> &'a str {
    args.get(key).and_then(|v| v.as_str()).unwrap_or("")
}

fn arg_bool(args: &Map<String, Value>, key: &str) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn arg_u64(args: &Map<String, Value>, key: &str, default: u64) -> u64 {
    args.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

/// Execute one tool call. Always returns an envelope; service failures are
/// converted here, never thrown.
pub async fn dispatch(
    state: &AppState,
    identity: Option<&Identity>,
    name: &str,
    args: &Map<String, Value>,
) -> Value {
    match dispatch_inner(state, identity, name, args).await {
        Ok(envelope) => envelope,
        Err(e) => e.envelope(),
    }
}

async fn dispatch_inner(
    state: &AppState,
    identity: Option<&Identity>,
    name: &str,
    args: &Map<String, Value>,
) -> ServiceResult {
    // Anonymous tools first.
    match name {
        "system_health" => return system_health(state).await,
        "system_about" => return Ok(system_about()),
        _ => {}
    }

    let identity = identity.ok_or_else(|| {
        ServiceError::Forbidden("authentication required".to_string())
    })?;

    let space = arg_str(args, "space_id");
    audit(identity, name, space);

    match name {
        // ── Space ───────────────────────────────────────────────
        "space_create" => {
            identity.check_write()?;
            let owner = match arg_str(args, "owner") {
                "" => identity.name.as_str(),
                explicit => explicit,
            };
            state
                .spaces
                .create(space, arg_str(args, "description"), arg_str(args, "rules"), owner)
                .await
        }
        "space_list" => {
            state.spaces.list(identity).await
        }
        "space_info" => {
            identity.check_access(space)?;
            state.spaces.info(space).await
        }
        "space_rules" => {
            identity.check_access(space)?;
            state.spaces.rules(space).await
        }
        "space_summary" => {
            identity.check_access(space)?;
            state.spaces.summary(space).await
        }
        "space_export" => {
            identity.check_access(space)?;
            state.spaces.export(space).await
        }
        "space_delete" => {
            identity.check_admin()?;
            identity.check_access(space)?;
            state.spaces.delete(space, arg_bool(args, "confirm")).await
        }

        // ── Live ────────────────────────────────────────────────
        "live_note" => {
            identity.check_access(space)?;
            identity.check_write()?;
            let agent = match arg_str(args, "agent") {
                "" => identity.name.as_str(),
                explicit => explicit,
            };
            state
                .live
                .note(
                    space,
                    arg_str(args, "category"),
                    arg_str(args, "content"),
                    agent,
                    arg_str(args, "tags"),
                )
                .await
        }
        "live_read" => {
            identity.check_access(space)?;
            state
                .live
                .read(
                    space,
                    arg_u64(args, "limit", 50) as usize,
                    arg_str(args, "category"),
                    arg_str(args, "agent"),
                    arg_str(args, "since"),
                )
                .await
        }
        "live_search" => {
            identity.check_access(space)?;
            state
                .live
                .search(space, arg_str(args, "query"), arg_u64(args, "limit", 20) as usize)
                .await
        }

        // ── Bank ────────────────────────────────────────────────
        "bank_read" => {
            identity.check_access(space)?;
            let filename = arg_str(args, "filename");
            validate::validate_bank_filename(filename)?;
            let content = state
                .storage
                .get_text(&bank_key(space, filename))
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("file '{filename}' not found in '{space}'"))
                })?;
            Ok(json!({
                "status": "ok",
                "space_id": space,
                "filename": filename,
                "size": content.len(),
                "content": content,
            }))
        }
        "bank_read_all" => {
            identity.check_access(space)?;
            require_space(state, space).await?;
            let files: Vec<Value> = state
                .storage
                .load_prefix(&bank_prefix(space), true)
                .await?
                .iter()
                .map(|o| {
                    json!({
                        "filename": basename(&o.key),
                        "content": o.content,
                        "size": o.size,
                    })
                })
                .collect();
            let total_size: u64 = files.iter().filter_map(|f| f["size"].as_u64()).sum();
            Ok(json!({
                "status": "ok",
                "space_id": space,
                "file_count": files.len(),
                "total_size": total_size,
                "files": files,
            }))
        }
        "bank_list" => {
            identity.check_access(space)?;
            require_space(state, space).await?;
            let files: Vec<Value> = state
                .storage
                .list(&bank_prefix(space))
                .await?
                .iter()
                .filter(|o| !o.key.ends_with(livemem_core::KEEP_FILE))
                .map(|o| {
                    json!({
                        "filename": basename(&o.key),
                        "size": o.size,
                        "last_modified": o.modified,
                    })
                })
                .collect();
            Ok(json!({
                "status": "ok",
                "space_id": space,
                "file_count": files.len(),
                "files": files,
            }))
        }
        "bank_consolidate" => {
            identity.check_access(space)?;
            identity.check_write()?;
            // A non-admin consolidates its own notes only; targeting another
            // agent (or all agents) is an admin capability.
            let requested = arg_str(args, "agent");
            let agent_filter = if identity.is_admin() {
                requested
            } else if requested.is_empty() || requested == identity.name {
                identity.name.as_str()
            } else {
                return Err(ServiceError::Forbidden(
                    "non-admin identities may only consolidate their own notes".to_string(),
                ));
            };

            let Some(_guard) = state.locks.try_consolidation(space) else {
                return Err(ServiceError::Conflict(format!(
                    "consolidation already running for '{space}'; retry in a few minutes"
                )));
            };
            state.consolidator.consolidate(space, agent_filter).await
        }

        // ── Graph ───────────────────────────────────────────────
        "graph_connect" => {
            identity.check_access(space)?;
            identity.check_write()?;
            let ontology = match arg_str(args, "ontology") {
                "" => "general",
                explicit => explicit,
            };
            state
                .graph
                .connect(
                    space,
                    arg_str(args, "url"),
                    arg_str(args, "token"),
                    arg_str(args, "memory_id"),
                    ontology,
                )
                .await
        }
        "graph_push" => {
            identity.check_access(space)?;
            identity.check_write()?;
            state.graph.push(space).await
        }
        "graph_status" => {
            identity.check_access(space)?;
            state.graph.status(space).await
        }
        "graph_disconnect" => {
            identity.check_access(space)?;
            identity.check_write()?;
            state.graph.disconnect(space).await
        }

        // ── Backup ──────────────────────────────────────────────
        "backup_create" => {
            identity.check_access(space)?;
            identity.check_write()?;
            state
                .backups
                .create(space, arg_str(args, "description"))
                .await
        }
        "backup_list" => {
            if !space.is_empty() {
                identity.check_access(space)?;
            }
            state.backups.list(space, identity).await
        }
        "backup_download" => {
            let backup_id = arg_str(args, "backup_id");
            let (backup_space, _) = livemem_core::parse_backup_id(backup_id)?;
            identity.check_access(backup_space)?;
            state.backups.download(backup_id).await
        }
        "backup_restore" => {
            identity.check_admin()?;
            let backup_id = arg_str(args, "backup_id");
            let (backup_space, _) = livemem_core::parse_backup_id(backup_id)?;
            identity.check_access(backup_space)?;
            state
                .backups
                .restore(backup_id, arg_bool(args, "confirm"))
                .await
        }
        "backup_delete" => {
            identity.check_admin()?;
            let backup_id = arg_str(args, "backup_id");
            let (backup_space, _) = livemem_core::parse_backup_id(backup_id)?;
            identity.check_access(backup_space)?;
            state
                .backups
                .delete(backup_id, arg_bool(args, "confirm"))
                .await
        }

        // ── Admin ───────────────────────────────────────────────
        "admin_create_token" => {
            identity.check_admin()?;
            state
                .tokens
                .create(
                    arg_str(args, "name"),
                    arg_str(args, "permissions"),
                    arg_str(args, "space_ids"),
                    arg_u64(args, "expires_in_days", 0) as u32,
                )
                .await
        }
        "admin_list_tokens" => {
            identity.check_admin()?;
            state.tokens.list().await
        }
        "admin_revoke_token" => {
            identity.check_admin()?;
            state.tokens.revoke(arg_str(args, "token_hash")).await
        }
        "admin_update_token" => {
            identity.check_admin()?;
            state
                .tokens
                .update(
                    arg_str(args, "token_hash"),
                    arg_str(args, "space_ids"),
                    arg_str(args, "permissions"),
                )
                .await
        }
        "admin_gc_notes" => {
            identity.check_admin()?;
            state
                .gc
                .run(
                    space,
                    arg_u64(args, "max_age_days", 7) as u32,
                    arg_bool(args, "confirm"),
                    arg_bool(args, "delete_only"),
                )
                .await
        }

        other => Err(ServiceError::NotFound(format!("unknown tool '{other}'"))),
    }
}

async fn require_space(state: &AppState, space_id: &str) -> Result<(), ServiceError> {
    if state.storage.exists(&meta_key(space_id)).await? {
        Ok(())
    } else {
        Err(ServiceError::space_not_found(space_id))
    }
}

async fn system_health(state: &AppState) -> ServiceResult {
    let report = state.storage.test_connection().await;
    Ok(json!({
        "status": if report.ok { "ok" } else { "error" },
        "service": "live-memory",
        "version": env!("CARGO_PKG_VERSION"),
        "storage": {
            "ok": report.ok,
            "latency_ms": (report.latency_ms * 10.0).round() / 10.0,
            "message": report.message,
        },
        "llm": {
            "model": state.llm.model_name(),
            "configured": !state.settings.llm.api_url.is_empty(),
        },
    }))
}

fn system_about() -> Value {
    let definitions = tool_definitions();
    let mut categories = serde_json::Map::new();
    for definition in &definitions {
        let category = definition.name.split('_').next().unwrap_or("other");
        categories
            .entry(category.to_string())
            .or_insert_with(|| json!([]))
            .as_array_mut()
            .expect("category arrays")
            .push(json!(definition.name));
    }
    json!({
        "status": "ok",
        "name": "Live Memory",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Shared working memory for collaborative AI agents",
        "tool_count": definitions.len(),
        "tools": categories,
    })
}

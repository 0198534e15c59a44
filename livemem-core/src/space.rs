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

//! Space metadata (`_meta.json`).

use serde::{Deserialize, Serialize};

/// Connection of a space to an external knowledge-graph service.
///
/// Stored inside `_meta.json` under `graph_memory`; absent when the space is
/// not connected. The bearer token is stored verbatim — the store is the
/// trust boundary here, and the bridge needs it back for every push.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphTarget {
    pub url: String,
    pub token: String,
    pub memory_id: String,
    pub ontology: String,
    #[serde(default)]
    pub connected_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_push_at: Option<String>,
    #[serde(default)]
    pub push_count: u64,
    /// Cached remote `memory_stats` summary from the last push.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stats: Option<serde_json::Value>,
}

/// Mutable space metadata, one `_meta.json` per space.
///
/// Created by `space_create`, counters bumped by each consolidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceMeta {
    pub space_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub rules_size: u64,
    #[serde(default)]
    pub last_consolidation: Option<String>,
    #[serde(default)]
    pub consolidation_count: u64,
    #[serde(default)]
    pub total_notes_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_memory: Option<GraphTarget>,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_version() -> u32 {
    1
}

impl SpaceMeta {
    pub fn new(space_id: &str, description: &str, owner: &str, created_at: &str) -> Self {
        Self {
            space_id: space_id.to_string(),
            description: description.to_string(),
            owner: owner.to_string(),
            created_at: created_at.to_string(),
            rules_size: 0,
            last_consolidation: None,
            consolidation_count: 0,
            total_notes_processed: 0,
            graph_memory: None,
            version: 1,
        }
    }
}

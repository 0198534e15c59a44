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

//! Object-store key layout.
//!
//! All durable state lives under one bucket with path-like keys:
//!
//! ```text
//! {space}/_meta.json
//! {space}/_rules.md
//! {space}/_synthesis.md
//! {space}/live/{note-key}
//! {space}/bank/{file}.md
//! _system/tokens.json
//! _backups/{space}/{timestamp}/...
//! ```

/// Registry of every authentication token, global to the bucket.
pub const TOKENS_KEY: &str = "_system/tokens.json";

/// Root prefix for space snapshots.
pub const BACKUPS_PREFIX: &str = "_backups";

/// Sentinel object that keeps an otherwise-empty prefix listable.
pub const KEEP_FILE: &str = ".keep";

/// Descriptor written alongside each backup snapshot.
pub const BACKUP_META_FILE: &str = "_backup.json";

pub fn meta_key(space_id: &str) -> String {
    format!("{space_id}/_meta.json")
}

pub fn rules_key(space_id: &str) -> String {
    format!("{space_id}/_rules.md")
}

pub fn synthesis_key(space_id: &str) -> String {
    format!("{space_id}/_synthesis.md")
}

pub fn live_prefix(space_id: &str) -> String {
    format!("{space_id}/live/")
}

pub fn live_key(space_id: &str, filename: &str) -> String {
    format!("{space_id}/live/{filename}")
}

pub fn bank_prefix(space_id: &str) -> String {
    format!("{space_id}/bank/")
}

pub fn bank_key(space_id: &str, filename: &str) -> String {
    format!("{space_id}/bank/{filename}")
}

pub fn backup_prefix(space_id: &str, timestamp: &str) -> String {
    format!("{BACKUPS_PREFIX}/{space_id}/{timestamp}/")
}

/// Final path segment of a key (the filename).
pub fn basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

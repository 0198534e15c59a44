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

//! Input validation shared by every tool entry point.
//!
//! Limits protect the consolidation prompt and the store from runaway
//! payloads; identifier rules keep keys unambiguous on the object store.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum length of a live-note body, in characters.
pub const MAX_CONTENT_LEN: usize = 100_000;

/// Maximum length of a space's rules document.
pub const MAX_RULES_LEN: usize = 50_000;

/// Maximum length of a space description.
pub const MAX_DESCRIPTION_LEN: usize = 500;

/// Space ids and agent names: alphanumeric start, then `[A-Za-z0-9_-]`,
/// 64 chars total at most.
static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid regex"));

/// Backup ids: `{space_id}/{YYYY-MM-DDTHH-MM-SS}`.
static BACKUP_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+/\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}$").expect("valid regex")
});

/// A rejected input. The message names the offending field so the tool
/// envelope can surface it verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid space_id '{0}': expected alphanumeric start, then letters, digits, '-' or '_', 1-64 chars")]
    SpaceId(String),

    #[error("invalid agent '{0}': expected alphanumeric start, then letters, digits, '-' or '_', 1-64 chars")]
    Agent(String),

    #[error("invalid category '{0}': expected one of observation, decision, todo, insight, question, progress, issue")]
    Category(String),

    #[error("content too large: {0} chars (limit {MAX_CONTENT_LEN})")]
    ContentTooLarge(usize),

    #[error("rules too large: {0} chars (limit {MAX_RULES_LEN})")]
    RulesTooLarge(usize),

    #[error("description too large: {0} chars (limit {MAX_DESCRIPTION_LEN})")]
    DescriptionTooLarge(usize),

    #[error("invalid filename '{0}': path traversal is not allowed")]
    BankFilename(String),

    #[error("invalid backup_id '{0}': expected 'space_id/YYYY-MM-DDTHH-MM-SS'")]
    BackupId(String),

    #[error("invalid permission '{0}': expected read, write or admin")]
    Permission(String),

    #[error("{0} is required")]
    Required(&'static str),

    #[error("destructive operation: pass confirm=true to proceed")]
    ConfirmRequired,
}

pub fn validate_space_id(space_id: &str) -> Result<(), ValidationError> {
    if ID_RE.is_match(space_id) {
        Ok(())
    } else {
        Err(ValidationError::SpaceId(space_id.to_string()))
    }
}

pub fn validate_agent(agent: &str) -> Result<(), ValidationError> {
    if ID_RE.is_match(agent) {
        Ok(())
    } else {
        Err(ValidationError::Agent(agent.to_string()))
    }
}

pub fn validate_content(content: &str) -> Result<(), ValidationError> {
    let len = content.chars().count();
    if len > MAX_CONTENT_LEN {
        return Err(ValidationError::ContentTooLarge(len));
    }
    Ok(())
}

pub fn validate_rules(rules: &str) -> Result<(), ValidationError> {
    let len = rules.chars().count();
    if len > MAX_RULES_LEN {
        return Err(ValidationError::RulesTooLarge(len));
    }
    Ok(())
}

pub fn validate_description(description: &str) -> Result<(), ValidationError> {
    let len = description.chars().count();
    if len > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::DescriptionTooLarge(len));
    }
    Ok(())
}

/// Bank filenames come from tool arguments and from the language model;
/// both paths must reject traversal.
pub fn validate_bank_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty()
        || filename.starts_with('/')
        || filename.contains("..")
        || filename.contains('\\')
    {
        return Err(ValidationError::BankFilename(filename.to_string()));
    }
    Ok(())
}

pub fn validate_backup_id(backup_id: &str) -> Result<(), ValidationError> {
    if BACKUP_ID_RE.is_match(backup_id) {
        Ok(())
    } else {
        Err(ValidationError::BackupId(backup_id.to_string()))
    }
}

/// Split a comma-separated list, trimming and dropping empties.
pub fn parse_csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn space_id_boundaries() {
        assert!(validate_space_id("a").is_ok());
        assert!(validate_space_id("0leading-digit").is_ok());
        assert!(validate_space_id(&"x".repeat(64)).is_ok());
        assert!(validate_space_id(&"x".repeat(65)).is_err());
        assert!(validate_space_id("_leading-underscore").is_err());
        assert!(validate_space_id("-leading-dash").is_err());
        assert!(validate_space_id("").is_err());
        assert!(validate_space_id("has space").is_err());
        assert!(validate_space_id("dot.dot").is_err());
    }

    #[test]
    fn content_boundary() {
        assert!(validate_content(&"x".repeat(MAX_CONTENT_LEN)).is_ok());
        assert!(validate_content(&"x".repeat(MAX_CONTENT_LEN + 1)).is_err());
    }

    #[test]
    fn bank_filename_rejects_traversal() {
        assert!(validate_bank_filename("journal.md").is_ok());
        assert!(validate_bank_filename("notes/journal.md").is_ok());
        assert!(validate_bank_filename("").is_err());
        assert!(validate_bank_filename("/etc/passwd").is_err());
        assert!(validate_bank_filename("../escape.md").is_err());
        assert!(validate_bank_filename("a/../b.md").is_err());
    }

    #[test]
    fn backup_id_shape() {
        assert!(validate_backup_id("demo/2026-01-31T08-30-00").is_ok());
        assert!(validate_backup_id("demo/2026-01-31").is_err());
        assert!(validate_backup_id("demo").is_err());
        assert!(validate_backup_id("demo/2026-01-31T08:30:00").is_err());
    }

    #[test]
    fn csv_parsing() {
        assert_eq!(parse_csv_list("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(parse_csv_list("").is_empty());
        assert!(parse_csv_list(" , ").is_empty());
    }
}

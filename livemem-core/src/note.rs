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

//! Live notes: categories, key encoding and front-matter.
//!
//! Every note is one immutable object under `{space}/live/`. The key packs
//! the write time, the authoring agent and the category so that listings
//! can be filtered without fetching bodies:
//!
//! ```text
//! {YYYYMMDD}T{HHMMSS}_{agent}_{category}_{8-hex}.md
//! ```
//!
//! The random suffix keeps keys unique even when two agents with the same
//! name write the same category within one second. The body carries a small
//! front-matter block followed by free Markdown:
//!
//! ```text
//! ---
//! timestamp: "2026-02-20T18:00:00+00:00"
//! agent: "cline"
//! category: "observation"
//! tags: ["build","ci"]
//! space_id: "demo"
//! ---
//!
//! Build is green again after the cache fix.
//! ```

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// The seven note categories agents may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteCategory {
    Observation,
    Decision,
    Todo,
    Insight,
    Question,
    Progress,
    Issue,
}

impl NoteCategory {
    pub const ALL: [NoteCategory; 7] = [
        NoteCategory::Observation,
        NoteCategory::Decision,
        NoteCategory::Todo,
        NoteCategory::Insight,
        NoteCategory::Question,
        NoteCategory::Progress,
        NoteCategory::Issue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::Observation => "observation",
            NoteCategory::Decision => "decision",
            NoteCategory::Todo => "todo",
            NoteCategory::Insight => "insight",
            NoteCategory::Question => "question",
            NoteCategory::Progress => "progress",
            NoteCategory::Issue => "issue",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == raw)
            .ok_or_else(|| ValidationError::Category(raw.to_string()))
    }
}

impl std::fmt::Display for NoteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fields packed into a note filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteKey {
    /// Compact UTC stamp, `YYYYMMDDTHHMMSS`.
    pub stamp: String,
    pub agent: String,
    pub category: String,
    pub suffix: String,
}

impl NoteKey {
    /// Compose a fresh filename for a note written now.
    pub fn compose(now: DateTime<Utc>, agent: &str, category: NoteCategory) -> String {
        let stamp = now.format("%Y%m%dT%H%M%S");
        let suffix = random_suffix();
        format!("{stamp}_{agent}_{category}_{suffix}.md")
    }

    /// Decode a note filename.
    ///
    /// Agents may contain underscores, so the filename is parsed from both
    /// ends: the stamp is the first segment, the suffix and category the
    /// last two, and whatever remains in the middle is the agent.
    pub fn parse(filename: &str) -> Option<NoteKey> {
        let base = filename.strip_suffix(".md")?;
        let (stamp, rest) = base.split_once('_')?;
        if stamp.len() != 15 || stamp.as_bytes()[8] != b'T' {
            return None;
        }
        let (rest, suffix) = rest.rsplit_once('_')?;
        if suffix.len() != 8 || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let (agent, category) = rest.rsplit_once('_')?;
        if agent.is_empty() || category.is_empty() {
            return None;
        }
        Some(NoteKey {
            stamp: stamp.to_string(),
            agent: agent.to_string(),
            category: category.to_string(),
            suffix: suffix.to_string(),
        })
    }
}

/// Eight random lowercase hex characters.
pub fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// A parsed live note, front-matter plus body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveNote {
    pub filename: String,
    pub timestamp: String,
    pub agent: String,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub content: String,
}

/// Render the full note body (front-matter + content).
pub fn compose_note_body(
    timestamp: &DateTime<Utc>,
    agent: &str,
    category: NoteCategory,
    tags: &[String],
    space_id: &str,
    content: &str,
) -> String {
    let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
    format!(
        "---\n\
         timestamp: \"{}\"\n\
         agent: \"{agent}\"\n\
         category: \"{category}\"\n\
         tags: {tags_json}\n\
         space_id: \"{space_id}\"\n\
         ---\n\n\
         {content}",
        timestamp.to_rfc3339(),
    )
}

/// Parse a stored note body back into its parts.
///
/// Returns `None` for malformed front-matter; callers skip such objects
/// silently. The front-matter is a flat `key: value` block, no YAML
/// library needed.
pub fn parse_note_body(filename: &str, raw: &str) -> Option<LiveNote> {
    let (front, body) = split_front_matter(raw)?;

    let mut timestamp = String::new();
    let mut agent = String::new();
    let mut category = String::new();
    let mut tags = Vec::new();

    for line in front.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        match key.trim() {
            "timestamp" => timestamp = value.to_string(),
            "agent" => agent = value.to_string(),
            "category" => category = value.to_string(),
            "tags" => {
                if let Ok(parsed) = serde_json::from_str::<Vec<String>>(value) {
                    tags = parsed;
                }
            }
            _ => {}
        }
    }

    if timestamp.is_empty() || agent.is_empty() || category.is_empty() {
        return None;
    }

    Some(LiveNote {
        filename: filename.to_string(),
        timestamp,
        agent,
        category,
        tags,
        content: body.trim().to_string(),
    })
}

fn split_front_matter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let body = rest[end + 4..].trim_start_matches(['\n', '\r']);
    Some((front, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn category_round_trip() {
        for cat in NoteCategory::ALL {
            assert_eq!(NoteCategory::parse(cat.as_str()).unwrap(), cat);
        }
        assert!(NoteCategory::parse("rant").is_err());
    }

    #[test]
    fn key_compose_and_parse() {
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 18, 0, 0).unwrap();
        let filename = NoteKey::compose(now, "cline", NoteCategory::Decision);
        let key = NoteKey::parse(&filename).unwrap();
        assert_eq!(key.stamp, "20260220T180000");
        assert_eq!(key.agent, "cline");
        assert_eq!(key.category, "decision");
        assert_eq!(key.suffix.len(), 8);
    }

    #[test]
    fn key_parse_agent_with_underscores() {
        let key = NoteKey::parse("20260220T180000_my_agent_2_todo_a1b2c3d4.md").unwrap();
        assert_eq!(key.agent, "my_agent_2");
        assert_eq!(key.category, "todo");
    }

    #[test]
    fn key_parse_rejects_garbage() {
        assert!(NoteKey::parse(".keep").is_none());
        assert!(NoteKey::parse("20260220T180000_cline.md").is_none());
        assert!(NoteKey::parse("nodate_cline_todo_a1b2c3d4.md").is_none());
        assert!(NoteKey::parse("20260220T180000_cline_todo_nothex!!.md").is_none());
    }

    #[test]
    fn note_body_round_trip() {
        let now = Utc.with_ymd_and_hms(2026, 2, 20, 18, 0, 0).unwrap();
        let tags = vec!["build".to_string(), "ci".to_string()];
        let body = compose_note_body(
            &now,
            "cline",
            NoteCategory::Observation,
            &tags,
            "demo",
            "Build is green.",
        );
        let note = parse_note_body("f.md", &body).unwrap();
        assert_eq!(note.agent, "cline");
        assert_eq!(note.category, "observation");
        assert_eq!(note.tags, tags);
        assert_eq!(note.content, "Build is green.");
        assert!(note.timestamp.starts_with("2026-02-20T18:00:00"));
    }

    #[test]
    fn malformed_front_matter_is_skipped() {
        assert!(parse_note_body("f.md", "no front matter at all").is_none());
        assert!(parse_note_body("f.md", "---\nbroken").is_none());
        // Missing mandatory fields
        assert!(parse_note_body("f.md", "---\ntags: []\n---\n\nbody").is_none());
    }
}

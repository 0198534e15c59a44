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

//! Bank files and the consolidation reply shape.
//!
//! Bank files are pure Markdown, named by the language model according to
//! the space rules; the server never hard-codes filenames. The structured
//! reply the model must return is exactly `ConsolidationReply`.

use serde::{Deserialize, Serialize};

use crate::validate::{validate_bank_filename, ValidationError};

/// What the model did to a bank file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BankAction {
    Created,
    Updated,
}

/// One bank file the model created or rewrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankFileUpdate {
    pub filename: String,
    pub content: String,
    pub action: BankAction,
}

/// The structured consolidation reply:
/// `{"bank_files": [...], "synthesis": "..."}`.
///
/// Deserialization already rejects non-string content and unknown actions;
/// `validate` adds the filename rules on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationReply {
    pub bank_files: Vec<BankFileUpdate>,
    pub synthesis: String,
}

impl ConsolidationReply {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for file in &self.bank_files {
            validate_bank_filename(&file.filename)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_parses_and_validates() {
        let raw = r##"{
            "bank_files": [
                {"filename": "journal.md", "content": "# Journal", "action": "created"},
                {"filename": "context.md", "content": "updated", "action": "updated"}
            ],
            "synthesis": "Two notes folded in."
        }"##;
        let reply: ConsolidationReply = serde_json::from_str(raw).unwrap();
        assert_eq!(reply.bank_files.len(), 2);
        assert!(reply.validate().is_ok());
    }

    #[test]
    fn reply_rejects_bad_action_and_traversal() {
        let bad_action = r#"{
            "bank_files": [{"filename": "a.md", "content": "x", "action": "deleted"}],
            "synthesis": ""
        }"#;
        assert!(serde_json::from_str::<ConsolidationReply>(bad_action).is_err());

        let traversal = r#"{
            "bank_files": [{"filename": "../a.md", "content": "x", "action": "created"}],
            "synthesis": ""
        }"#;
        let reply: ConsolidationReply = serde_json::from_str(traversal).unwrap();
        assert!(reply.validate().is_err());
    }

    #[test]
    fn reply_rejects_non_string_content() {
        let raw = r#"{
            "bank_files": [{"filename": "a.md", "content": 42, "action": "created"}],
            "synthesis": ""
        }"#;
        assert!(serde_json::from_str::<ConsolidationReply>(raw).is_err());
    }
}

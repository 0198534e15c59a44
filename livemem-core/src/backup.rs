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

//! Backup snapshot descriptors.

use serde::{Deserialize, Serialize};

use crate::validate::{validate_backup_id, ValidationError};

/// Descriptor stored inside each snapshot prefix as `_backup.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMeta {
    /// `{space_id}/{YYYY-MM-DDTHH-MM-SS}`
    pub backup_id: String,
    pub space_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub description: String,
    pub files_count: u64,
    pub total_size: u64,
    pub created_at: String,
}

/// Split a validated backup id into `(space_id, timestamp)`.
pub fn parse_backup_id(backup_id: &str) -> Result<(&str, &str), ValidationError> {
    validate_backup_id(backup_id)?;
    // The regex guarantees exactly one '/'.
    backup_id
        .split_once('/')
        .ok_or_else(|| ValidationError::BackupId(backup_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backup_id_splits() {
        let (space, ts) = parse_backup_id("demo/2026-01-31T08-30-00").unwrap();
        assert_eq!(space, "demo");
        assert_eq!(ts, "2026-01-31T08-30-00");
        assert!(parse_backup_id("demo").is_err());
    }
}

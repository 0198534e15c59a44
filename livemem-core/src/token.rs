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

//! Token records (`_system/tokens.json`).
//!
//! The plain credential never reaches the store: records carry only the
//! `sha256:<hex>` digest. Revocation is a soft delete so the audit trail
//! survives.

use serde::{Deserialize, Serialize};

use crate::validate::ValidationError;

/// Permission levels a token may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        match raw {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "admin" => Ok(Permission::Admin),
            other => Err(ValidationError::Permission(other.to_string())),
        }
    }

    /// Parse a comma-separated permission list, e.g. `"read,write"`.
    pub fn parse_csv(raw: &str) -> Result<Vec<Permission>, ValidationError> {
        let mut out = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let perm = Permission::parse(part)?;
            if !out.contains(&perm) {
                out.push(perm);
            }
        }
        if out.is_empty() {
            return Err(ValidationError::Required("permissions"));
        }
        Ok(out)
    }
}

/// One stored token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// `sha256:<hex>` of the plain credential; also the lookup key.
    pub hash: String,
    pub name: String,
    pub permissions: Vec<Permission>,
    /// Space ids this token may touch; empty means universal.
    #[serde(default)]
    pub space_ids: Vec<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
    #[serde(default)]
    pub revoked: bool,
}

impl TokenRecord {
    /// Expired compares ISO-8601 strings; both sides are UTC RFC 3339 so the
    /// lexicographic order is the chronological order.
    pub fn is_expired(&self, now_iso: &str) -> bool {
        match &self.expires_at {
            Some(exp) => exp.as_str() < now_iso,
            None => false,
        }
    }

    pub fn has_permission(&self, perm: Permission) -> bool {
        self.permissions.contains(&perm)
    }
}

/// The whole registry, persisted as a single JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub tokens: Vec<TokenRecord>,
}

fn default_version() -> u32 {
    1
}

impl Default for TokenFile {
    fn default() -> Self {
        Self {
            version: 1,
            tokens: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_csv() {
        assert_eq!(
            Permission::parse_csv("read, write").unwrap(),
            vec![Permission::Read, Permission::Write]
        );
        // Duplicates collapse
        assert_eq!(
            Permission::parse_csv("read,read").unwrap(),
            vec![Permission::Read]
        );
        assert!(Permission::parse_csv("root").is_err());
        assert!(Permission::parse_csv("").is_err());
    }

    #[test]
    fn expiry_comparison() {
        let mut record = TokenRecord {
            hash: "sha256:ab".into(),
            name: "t".into(),
            permissions: vec![Permission::Read],
            space_ids: vec![],
            created_at: "2026-01-01T00:00:00+00:00".into(),
            expires_at: None,
            last_used_at: None,
            revoked: false,
        };
        assert!(!record.is_expired("2026-06-01T00:00:00+00:00"));
        record.expires_at = Some("2026-03-01T00:00:00+00:00".into());
        assert!(record.is_expired("2026-06-01T00:00:00+00:00"));
        assert!(!record.is_expired("2026-02-01T00:00:00+00:00"));
    }
}

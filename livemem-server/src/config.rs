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

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Live Memory server configuration.
///
/// Built once from the environment at startup and injected everywhere as an
/// immutable value.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub consolidation: ConsolidationSection,
    #[serde(default)]
    pub backup: BackupSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StorageSection {
    /// S3-compatible endpoint URL. Empty selects the in-memory backend
    /// (development only).
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmSection {
    /// OpenAI-compatible endpoint. The URL already includes the version
    /// path segment; nothing is appended.
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthSection {
    /// Bootstrap admin credential. Must be changed in production.
    #[serde(default = "default_bootstrap_key")]
    pub bootstrap_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsolidationSection {
    /// Hard wall-clock timeout per language-model call, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Oldest-first cap on notes per consolidation.
    #[serde(default = "default_max_notes")]
    pub max_notes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackupSection {
    /// Snapshots kept per space after each backup_create.
    #[serde(default = "default_retention")]
    pub retention_count: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8002
}

fn default_bucket() -> String {
    "live-mem".to_string()
}

fn default_region() -> String {
    "fr1".to_string()
}

fn default_model() -> String {
    "qwen3-2507:235b".to_string()
}

fn default_max_tokens() -> u32 {
    100_000
}

fn default_temperature() -> f32 {
    0.3
}

fn default_bootstrap_key() -> String {
    "change_me_in_production".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_max_notes() -> usize {
    500
}

fn default_retention() -> usize {
    5
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            bootstrap_key: default_bootstrap_key(),
        }
    }
}

impl Default for ConsolidationSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_notes: default_max_notes(),
        }
    }
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            retention_count: default_retention(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSection::default(),
            storage: StorageSection {
                bucket: default_bucket(),
                region: default_region(),
                ..StorageSection::default()
            },
            llm: LlmSection::default(),
            auth: AuthSection::default(),
            consolidation: ConsolidationSection::default(),
            backup: BackupSection::default(),
        }
    }
}

impl Settings {
    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - LIVEMEM_HOST, LIVEMEM_PORT
    /// - LIVEMEM_S3_ENDPOINT, LIVEMEM_S3_ACCESS_KEY, LIVEMEM_S3_SECRET_KEY,
    ///   LIVEMEM_S3_BUCKET, LIVEMEM_S3_REGION
    /// - LIVEMEM_LLM_API_URL, LIVEMEM_LLM_API_KEY, LIVEMEM_LLM_MODEL,
    ///   LIVEMEM_LLM_MAX_TOKENS, LIVEMEM_LLM_TEMPERATURE
    /// - LIVEMEM_BOOTSTRAP_KEY
    /// - LIVEMEM_CONSOLIDATION_TIMEOUT, LIVEMEM_CONSOLIDATION_MAX_NOTES
    /// - LIVEMEM_BACKUP_RETENTION
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(host) = std::env::var("LIVEMEM_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("LIVEMEM_PORT") {
            if let Ok(val) = port.parse() {
                config.server.port = val;
            }
        }

        if let Ok(endpoint) = std::env::var("LIVEMEM_S3_ENDPOINT") {
            config.storage.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var("LIVEMEM_S3_ACCESS_KEY") {
            config.storage.access_key = key;
        }
        if let Ok(secret) = std::env::var("LIVEMEM_S3_SECRET_KEY") {
            config.storage.secret_key = secret;
        }
        if let Ok(bucket) = std::env::var("LIVEMEM_S3_BUCKET") {
            config.storage.bucket = bucket;
        }
        if let Ok(region) = std::env::var("LIVEMEM_S3_REGION") {
            config.storage.region = region;
        }

        if let Ok(url) = std::env::var("LIVEMEM_LLM_API_URL") {
            config.llm.api_url = url;
        }
        if let Ok(key) = std::env::var("LIVEMEM_LLM_API_KEY") {
            config.llm.api_key = key;
        }
        if let Ok(model) = std::env::var("LIVEMEM_LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(max_tokens) = std::env::var("LIVEMEM_LLM_MAX_TOKENS") {
            if let Ok(val) = max_tokens.parse() {
                config.llm.max_tokens = val;
            }
        }
        if let Ok(temp) = std::env::var("LIVEMEM_LLM_TEMPERATURE") {
            if let Ok(val) = temp.parse() {
                config.llm.temperature = val;
            }
        }

        if let Ok(key) = std::env::var("LIVEMEM_BOOTSTRAP_KEY") {
            config.auth.bootstrap_key = key;
        }

        if let Ok(timeout) = std::env::var("LIVEMEM_CONSOLIDATION_TIMEOUT") {
            if let Ok(val) = timeout.parse() {
                config.consolidation.timeout_secs = val;
            }
        }
        if let Ok(max_notes) = std::env::var("LIVEMEM_CONSOLIDATION_MAX_NOTES") {
            if let Ok(val) = max_notes.parse() {
                config.consolidation.max_notes = val;
            }
        }

        if let Ok(retention) = std::env::var("LIVEMEM_BACKUP_RETENTION") {
            if let Ok(val) = retention.parse() {
                config.backup.retention_count = val;
            }
        }

        config
    }

    /// Validate configuration before the server starts.
    pub fn validate(&self) -> Result<()> {
        if !self.storage.endpoint.is_empty() {
            url::Url::parse(&self.storage.endpoint)
                .map_err(|e| anyhow::anyhow!("invalid LIVEMEM_S3_ENDPOINT: {e}"))?;
            if self.storage.access_key.is_empty() || self.storage.secret_key.is_empty() {
                anyhow::bail!("S3 endpoint configured but access/secret key missing");
            }
        }
        if self.storage.bucket.is_empty() {
            anyhow::bail!("LIVEMEM_S3_BUCKET must not be empty");
        }
        if !self.llm.api_url.is_empty() {
            url::Url::parse(&self.llm.api_url)
                .map_err(|e| anyhow::anyhow!("invalid LIVEMEM_LLM_API_URL: {e}"))?;
        }
        if self.auth.bootstrap_key == default_bootstrap_key() {
            tracing::warn!("bootstrap key is the default value; change it in production");
        }
        if self.consolidation.max_notes == 0 {
            anyhow::bail!("LIVEMEM_CONSOLIDATION_MAX_NOTES must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Settings::default();
        assert_eq!(config.server.port, 8002);
        assert_eq!(config.storage.bucket, "live-mem");
        assert_eq!(config.consolidation.timeout_secs, 600);
        assert_eq!(config.consolidation.max_notes, 500);
        assert_eq!(config.backup.retention_count, 5);
        assert!((config.llm.temperature - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("LIVEMEM_PORT", "9999");
        std::env::set_var("LIVEMEM_S3_BUCKET", "test-bucket");
        std::env::set_var("LIVEMEM_CONSOLIDATION_MAX_NOTES", "42");

        let config = Settings::from_env();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.storage.bucket, "test-bucket");
        assert_eq!(config.consolidation.max_notes, 42);

        std::env::remove_var("LIVEMEM_PORT");
        std::env::remove_var("LIVEMEM_S3_BUCKET");
        std::env::remove_var("LIVEMEM_CONSOLIDATION_MAX_NOTES");
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let mut config = Settings::default();
        config.storage.endpoint = "not a url".into();
        assert!(config.validate().is_err());

        config.storage.endpoint = "https://s3.example.com".into();
        config.storage.access_key = "k".into();
        config.storage.secret_key = "s".into();
        assert!(config.validate().is_ok());
    }
}

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

//! Live Memory server.
//!
//! Shared working memory for collaborative AI agents: spaces of append-only
//! notes on an object store, folded into a Markdown memory bank by a
//! language-model consolidation pipeline, exposed through an authenticated
//! MCP tool surface.

pub mod archive;
pub mod auth;
pub mod backup;
pub mod config;
pub mod consolidator;
pub mod error;
pub mod gc;
pub mod graph;
pub mod live;
pub mod llm;
pub mod locks;
pub mod mcp;
pub mod spaces;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use livemem_storage::{S3Backend, S3Config, Storage};

use auth::tokens::TokenRegistry;
use auth::AuthGate;
use backup::BackupService;
use config::Settings;
use consolidator::Consolidator;
use gc::GarbageCollector;
use graph::client::{GraphConnector, SseConnector};
use graph::GraphBridge;
use live::LiveNotes;
use llm::{LanguageModel, OpenAiCompatibleModel};
use locks::LockRegistry;
use spaces::SpaceRepo;

/// Every dependency of the tool surface, injected once at startup. No
/// hidden globals; configuration is immutable after build.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub storage: Storage,
    pub locks: Arc<LockRegistry>,
    pub tokens: Arc<TokenRegistry>,
    pub auth: Arc<AuthGate>,
    pub spaces: Arc<SpaceRepo>,
    pub live: Arc<LiveNotes>,
    pub consolidator: Arc<Consolidator>,
    pub gc: Arc<GarbageCollector>,
    pub backups: Arc<BackupService>,
    pub graph: Arc<GraphBridge>,
    pub llm: Arc<dyn LanguageModel>,
}

impl AppState {
    /// Wire the services together. Tests pass an in-memory storage, a
    /// scripted model and a fake graph connector.
    pub fn build(
        settings: Settings,
        storage: Storage,
        llm: Arc<dyn LanguageModel>,
        connector: Arc<dyn GraphConnector>,
    ) -> Self {
        let settings = Arc::new(settings);
        let locks = Arc::new(LockRegistry::new());
        let tokens = Arc::new(TokenRegistry::new(storage.clone(), locks.tokens()));
        let auth = Arc::new(AuthGate::new(
            tokens.clone(),
            settings.auth.bootstrap_key.clone(),
        ));
        let spaces = Arc::new(SpaceRepo::new(storage.clone()));
        let live = Arc::new(LiveNotes::new(storage.clone()));
        let consolidator = Arc::new(Consolidator::new(
            storage.clone(),
            llm.clone(),
            Duration::from_secs(settings.consolidation.timeout_secs),
            settings.consolidation.max_notes,
            settings.llm.max_tokens,
            settings.llm.temperature,
        ));
        let gc = Arc::new(GarbageCollector::new(
            storage.clone(),
            live.clone(),
            consolidator.clone(),
            locks.clone(),
        ));
        let backups = Arc::new(BackupService::new(
            storage.clone(),
            settings.backup.retention_count,
        ));
        let graph = Arc::new(GraphBridge::new(storage.clone(), spaces.clone(), connector));

        Self {
            settings,
            storage,
            locks,
            tokens,
            auth,
            spaces,
            live,
            consolidator,
            gc,
            backups,
            graph,
            llm,
        }
    }
}

/// Start the server: tracing, storage, model, router, listener.
pub async fn run_server(settings: Settings) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "livemem_server=info,livemem_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting Live Memory server");
    settings.validate()?;

    let storage = if settings.storage.endpoint.is_empty() {
        tracing::warn!("no S3 endpoint configured; using the in-memory store (development only)");
        Storage::in_memory()
    } else {
        Storage::new(Arc::new(S3Backend::new(S3Config {
            endpoint: settings.storage.endpoint.clone(),
            access_key: settings.storage.access_key.clone(),
            secret_key: settings.storage.secret_key.clone(),
            bucket: settings.storage.bucket.clone(),
            region: settings.storage.region.clone(),
        })?))
    };

    if settings.llm.api_url.is_empty() {
        tracing::warn!("no language-model endpoint configured; consolidation will fail");
    }
    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatibleModel::new(
        &settings.llm.api_url,
        &settings.llm.api_key,
        &settings.llm.model,
    ));

    let host = settings.server.host.clone();
    let port = settings.server.port;
    let state = AppState::build(settings, storage, llm, Arc::new(SseConnector));

    print_banner(&host, port);

    let app = mcp::router(state);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!(host = %host, port, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Startup banner on stderr: the registered tools by category.
fn print_banner(host: &str, port: u16) {
    let definitions = mcp::tools::tool_definitions();
    let mut lines = String::new();
    for category in ["system", "space", "live", "bank", "graph", "backup", "admin"] {
        let names: Vec<&str> = definitions
            .iter()
            .filter(|t| t.name.starts_with(&format!("{category}_")))
            .map(|t| t.name.as_str())
            .collect();
        if !names.is_empty() {
            lines.push_str(&format!("  {:<7} {}\n", category, names.join(", ")));
        }
    }
    eprintln!(
        "Live Memory MCP server v{}\n{} tools:\n{}  http://{host}:{port}/mcp  (requests)\n  http://{host}:{port}/mcp/sse  (event stream)",
        env!("CARGO_PKG_VERSION"),
        definitions.len(),
        lines,
    );
}

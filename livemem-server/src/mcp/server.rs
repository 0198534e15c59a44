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

//! HTTP binding of the tool surface.
//!
//! `POST /mcp` carries JSON-RPC requests; `GET /mcp/sse` is the long-lived
//! event stream; `GET /health` is anonymous. The bearer credential is
//! resolved once per request and threaded into the handler as a value
//! (falling back to a `?token=` query parameter for browser SSE clients).

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream;
use serde_json::Map;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::mcp::handlers::McpHandler;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION};
use crate::mcp::tools;
use crate::AppState;

#[derive(Clone)]
pub struct McpServerState {
    pub handler: Arc<McpHandler>,
    pub app: AppState,
}

/// Build the server router.
pub fn router(app: AppState) -> Router {
    let state = McpServerState {
        handler: Arc::new(McpHandler::new(app.clone())),
        app,
    };
    Router::new()
        .route("/mcp", post(handle_mcp_request))
        .route("/mcp/sse", get(handle_mcp_sse))
        .route("/health", get(handle_health))
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    query.get("token").cloned()
}

/// JSON-RPC over HTTP POST.
async fn handle_mcp_request(
    State(state): State<McpServerState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    let bearer = extract_bearer(&headers, &query);
    let identity = state.app.auth.resolve(bearer.as_deref()).await;
    Json(state.handler.handle_request(identity, request).await)
}

/// Anonymous health probe (same payload as the `system_health` tool).
async fn handle_health(State(state): State<McpServerState>) -> Json<serde_json::Value> {
    Json(tools::dispatch(&state.app, None, "system_health", &Map::new()).await)
}

/// Event stream: announces server info, then keepalives.
async fn handle_mcp_sse(
    State(_state): State<McpServerState>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let init_event = Event::default().event("init").data(
        serde_json::to_string(&serde_json::json!({
            "protocol_version": MCP_PROTOCOL_VERSION,
            "server_name": "live-memory",
            "server_version": env!("CARGO_PKG_VERSION"),
        }))
        .unwrap_or_default(),
    );

    let stream = stream::once(async move { Ok(init_event) });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

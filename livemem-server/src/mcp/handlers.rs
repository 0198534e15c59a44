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

//! MCP request handler.
//!
//! Dispatches JSON-RPC requests (initialize, tools) with the per-request
//! identity threaded in from the transport. Tool execution runs in its own
//! task so a panic in a tool becomes an `error` envelope instead of tearing
//! down the connection.

use serde_json::{json, Map, Value};
use tracing::{error, info, warn};

use crate::auth::Identity;
use crate::mcp::protocol::*;
use crate::mcp::tools::{dispatch, tool_definitions};
use crate::AppState;

pub struct McpHandler {
    state: AppState,
}

impl McpHandler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Handle one JSON-RPC request with the transport-resolved identity.
    pub async fn handle_request(
        &self,
        identity: Option<Identity>,
        request: JsonRpcRequest,
    ) -> JsonRpcResponse {
        info!(method = %request.method, "MCP request");

        match request.method.as_str() {
            "ping" => JsonRpcResponse::success(request.id, json!({})),

            "initialize" => self.handle_initialize(request.id),
            "initialized" | "notifications/initialized" => {
                JsonRpcResponse::success(request.id, json!({}))
            }

            "tools/list" => {
                let result = ListToolsResult {
                    tools: tool_definitions(),
                    next_cursor: None,
                };
                JsonRpcResponse::success(
                    request.id,
                    serde_json::to_value(result).unwrap_or_default(),
                )
            }
            "tools/call" => self.handle_tools_call(identity, request.id, request.params).await,

            _ => {
                warn!(method = %request.method, "unknown MCP method");
                JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(&request.method))
            }
        }
    }

    fn handle_initialize(&self, id: JsonRpcId) -> JsonRpcResponse {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
                logging: Some(LoggingCapability {}),
            },
            server_info: ServerInfo {
                name: "live-memory".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
    }

    async fn handle_tools_call(
        &self,
        identity: Option<Identity>,
        id: JsonRpcId,
        params: Option<Value>,
    ) -> JsonRpcResponse {
        let call_params: CallToolParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        id,
                        JsonRpcError::invalid_params(format!("Invalid tool call params: {}", e)),
                    )
                }
            },
            None => {
                return JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("Missing tool call params"),
                )
            }
        };

        let state = self.state.clone();
        let name = call_params.name.clone();
        let args: Map<String, Value> = call_params.arguments.into_iter().collect();

        // Own task: a panicking tool yields an error envelope, nothing more.
        let envelope = match tokio::spawn(async move {
            dispatch(&state, identity.as_ref(), &name, &args).await
        })
        .await
        {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(tool = %call_params.name, error = %e, "tool execution panicked");
                json!({
                    "status": "error",
                    "message": format!("internal error executing '{}'", call_params.name),
                })
            }
        };

        JsonRpcResponse::success(
            id,
            serde_json::to_value(CallToolResult::from_envelope(&envelope)).unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::graph::client::SseConnector;
    use crate::llm::MockModel;
    use livemem_storage::Storage;
    use std::sync::Arc;

    fn handler() -> McpHandler {
        McpHandler::new(AppState::build(
            Settings::default(),
            Storage::in_memory(),
            Arc::new(MockModel::new()),
            Arc::new(SseConnector),
        ))
    }

    fn request(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: JsonRpcId::Number(1),
        }
    }

    #[tokio::test]
    async fn ping_and_initialize() {
        let handler = handler();

        let pong = handler.handle_request(None, request("ping", None)).await;
        assert!(pong.result.is_some());

        let init = handler
            .handle_request(None, request("initialize", Some(json!({}))))
            .await;
        let result = init.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "live-memory");
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn tools_list_has_the_catalogue() {
        let handler = handler();
        let response = handler.handle_request(None, request("tools/list", None)).await;
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 30);
    }

    #[tokio::test]
    async fn tools_call_wraps_the_envelope_as_text() {
        let handler = handler();
        let response = handler
            .handle_request(
                None,
                request(
                    "tools/call",
                    Some(json!({"name": "system_about", "arguments": {}})),
                ),
            )
            .await;
        let result = response.result.unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        let envelope: Value = serde_json::from_str(text).unwrap();
        assert_eq!(envelope["status"], "ok");
        assert_eq!(envelope["tool_count"], 30);
    }

    #[tokio::test]
    async fn unauthenticated_tool_call_is_forbidden_in_the_envelope() {
        let handler = handler();
        let response = handler
            .handle_request(
                None,
                request(
                    "tools/call",
                    Some(json!({"name": "space_list", "arguments": {}})),
                ),
            )
            .await;
        let result = response.result.unwrap();
        let envelope: Value =
            serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap();
        assert_eq!(envelope["status"], "forbidden");
    }

    #[tokio::test]
    async fn unknown_method_is_a_jsonrpc_error() {
        let handler = handler();
        let response = handler
            .handle_request(None, request("prompts/list", None))
            .await;
        assert_eq!(response.error.unwrap().code, -32601);
    }
}

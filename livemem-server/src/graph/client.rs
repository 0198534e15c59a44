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

//! Minimal MCP-over-SSE client for the remote knowledge-graph service.
//!
//! The remote exposes the standard flow: a long-lived `GET /sse` stream
//! that first announces a session endpoint, then carries JSON-RPC replies;
//! requests are short POSTs to that endpoint. This client performs the
//! `initialize` handshake and then calls tools by name. Tool replies arrive
//! wrapped as `result.content[0].text` JSON and are unwrapped here.

use futures::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::ServiceError;

/// How long to wait for the session endpoint and the handshake reply.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected remote that can execute named tools.
#[async_trait::async_trait]
pub trait GraphRemote: Send {
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, ServiceError>;
}

/// Opens connections to a remote graph service. The default implementation
/// dials SSE; tests substitute a fake.
#[async_trait::async_trait]
pub trait GraphConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Box<dyn GraphRemote>, ServiceError>;
}

/// Production connector.
pub struct SseConnector;

#[async_trait::async_trait]
impl GraphConnector for SseConnector {
    async fn connect(
        &self,
        url: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Box<dyn GraphRemote>, ServiceError> {
        let client = SseClient::connect(url, token, timeout).await?;
        Ok(Box::new(client))
    }
}

pub struct SseClient {
    http: reqwest::Client,
    session_url: String,
    responses: mpsc::Receiver<Value>,
    request_id: i64,
    timeout: Duration,
    listener: JoinHandle<()>,
}

impl SseClient {
    /// Open the SSE stream, wait for the session endpoint, run the
    /// `initialize` handshake.
    pub async fn connect(url: &str, token: &str, timeout: Duration) -> Result<Self, ServiceError> {
        // Accept both ".../sse" and the bare base URL.
        let base = url.trim_end_matches('/');
        let base = base.strip_suffix("/sse").unwrap_or(base).to_string();

        let mut headers = reqwest::header::HeaderMap::new();
        if !token.is_empty() {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| ServiceError::Validation("invalid graph token".to_string()))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ServiceError::Upstream(e.to_string()))?;

        let (response_tx, responses) = mpsc::channel(32);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let listener = tokio::spawn(listen_sse(
            http.clone(),
            base.clone(),
            response_tx,
            endpoint_tx,
        ));

        let session_url = match tokio::time::timeout(CONNECT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(endpoint)) => {
                if endpoint.starts_with("http") {
                    endpoint
                } else {
                    format!("{base}{endpoint}")
                }
            }
            _ => {
                listener.abort();
                return Err(ServiceError::Upstream(format!(
                    "no SSE endpoint from {base}/sse; is the graph service running?"
                )));
            }
        };

        let mut client = Self {
            http,
            session_url,
            responses,
            request_id: 0,
            timeout,
            listener,
        };

        let init_id = client.next_id();
        client
            .post(json!({
                "jsonrpc": "2.0",
                "id": init_id,
                "method": "initialize",
                "params": {
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "livemem-bridge", "version": env!("CARGO_PKG_VERSION")},
                },
            }))
            .await?;
        client.recv(CONNECT_TIMEOUT).await.map_err(|_| {
            ServiceError::Upstream("graph service did not answer initialize".to_string())
        })?;

        client
            .post(json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            }))
            .await?;

        tracing::info!(url = %base, "connected to graph service");
        Ok(client)
    }

    fn next_id(&mut self) -> i64 {
        self.request_id += 1;
        self.request_id
    }

    async fn post(&self, body: Value) -> Result<(), ServiceError> {
        self.http
            .post(&self.session_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("graph request failed: {e}")))?;
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Value, ServiceError> {
        match tokio::time::timeout(timeout, self.responses.recv()).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(ServiceError::Upstream(
                "graph connection closed".to_string(),
            )),
            Err(_) => Err(ServiceError::Upstream(format!(
                "graph call timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }
}

#[async_trait::async_trait]
impl GraphRemote for SseClient {
    async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, ServiceError> {
        let id = self.next_id();
        self.post(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {"name": name, "arguments": arguments},
        }))
        .await?;

        let response = self.recv(self.timeout).await?;

        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Ok(json!({"status": "error", "message": message}));
        }

        // Tool replies are JSON inside result.content[0].text.
        let result = response.get("result").cloned().unwrap_or(Value::Null);
        if let Some(text) = result
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|item| item.get("text"))
            .and_then(|t| t.as_str())
        {
            return Ok(serde_json::from_str(text)
                .unwrap_or_else(|_| json!({"status": "ok", "raw": text})));
        }
        Ok(result)
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Background task: read the SSE stream, hand the session endpoint to the
/// waiter, queue JSON-RPC replies.
async fn listen_sse(
    http: reqwest::Client,
    base: String,
    responses: mpsc::Sender<Value>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let response = match http.get(format!("{base}/sse")).send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "SSE connect failed");
            return;
        }
    };

    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event = String::new();
    let mut data = String::new();

    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line = buffer[..pos].trim_end_matches('\r').to_string();
            buffer.drain(..=pos);

            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            } else if line.is_empty() && !data.is_empty() {
                dispatch_event(&event, &data, &mut endpoint_tx, &responses).await;
                event.clear();
                data.clear();
            }
        }
    }
    tracing::debug!("SSE listener closed");
}

async fn dispatch_event(
    event: &str,
    data: &str,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
    responses: &mpsc::Sender<Value>,
) {
    match event {
        "endpoint" => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(data.to_string());
            }
        }
        _ => {
            let Ok(value) = serde_json::from_str::<Value>(data) else {
                return;
            };
            // Progress notifications are not replies.
            if value.get("method").is_some() {
                return;
            }
            if value.get("result").is_some() || value.get("error").is_some() {
                let _ = responses.send(value).await;
            }
        }
    }
}

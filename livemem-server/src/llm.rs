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

//! Language-model client.
//!
//! The consolidation engine only needs one chat completion per run, so the
//! seam is a single-method trait. Production talks to an OpenAI-compatible
//! endpoint (the configured URL already includes the version path segment);
//! tests inject [`MockModel`] with scripted replies.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client as OpenAIClient,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<ChatOutcome>;

    fn model_name(&self) -> &str;
}

/// Chat completions against any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleModel {
    client: OpenAIClient<OpenAIConfig>,
    model: String,
}

impl OpenAiCompatibleModel {
    pub fn new(api_url: &str, api_key: &str, model: &str) -> Self {
        let config = OpenAIConfig::new()
            .with_api_base(api_url.trim_end_matches('/'))
            .with_api_key(api_key);
        Self {
            client: OpenAIClient::with_config(config),
            model: model.to_string(),
        }
    }

    fn convert_messages(messages: Vec<ChatMessage>) -> Vec<ChatCompletionRequestMessage> {
        messages
            .into_iter()
            .filter_map(|msg| match msg.role.as_str() {
                "system" => ChatCompletionRequestSystemMessageArgs::default()
                    .content(msg.content)
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::System),
                "user" => ChatCompletionRequestUserMessageArgs::default()
                    .content(msg.content)
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::User),
                "assistant" => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(msg.content)
                    .build()
                    .ok()
                    .map(ChatCompletionRequestMessage::Assistant),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<ChatOutcome> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::convert_messages(messages))
            .max_tokens(max_tokens)
            .temperature(temperature)
            .build()?;

        let response = self.client.chat().create(request).await?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        let usage = response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ChatOutcome { content, usage })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Scripted model for development and tests. Replies are popped in order;
/// every received prompt is recorded for assertions.
#[derive(Default)]
pub struct MockModel {
    replies: Mutex<VecDeque<anyhow::Result<String>>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(reply: impl Into<String>) -> Self {
        let model = Self::default();
        model.push_reply(reply);
        model
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message)));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        _max_tokens: u32,
        _temperature: f32,
    ) -> anyhow::Result<ChatOutcome> {
        self.calls.lock().unwrap().push(messages);
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(content)) => Ok(ChatOutcome {
                content,
                usage: Some(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                }),
            }),
            Some(Err(e)) => Err(e),
            None => Err(anyhow::anyhow!("mock model has no scripted reply")),
        }
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_pops_replies_in_order() {
        let model = MockModel::new();
        model.push_reply("one");
        model.push_reply("two");

        let first = model.chat(vec![ChatMessage::user("hi")], 10, 0.0).await.unwrap();
        assert_eq!(first.content, "one");
        let second = model.chat(vec![], 10, 0.0).await.unwrap();
        assert_eq!(second.content, "two");
        assert!(model.chat(vec![], 10, 0.0).await.is_err());
        assert_eq!(model.call_count(), 3);
    }
}

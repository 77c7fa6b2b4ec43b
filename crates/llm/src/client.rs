use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use ampere_config::LlmConfig;

use crate::{ChatMessage, ChatRequest, Completion, LlmError, Role, ToolCall};

/// Prompt used by the liveness check; a healthy provider echoes the phrase.
pub const LIVENESS_PROMPT: &str =
    "Say 'OpenAI API is working correctly!' in exactly those words.";

/// Longest SSE line accepted from the provider.
const MAX_SSE_LINE_BYTES: usize = 1 << 20;

/// A language-model backend able to run one generation call.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError>;

    /// Like [`complete`](Self::complete), but text tokens are sent through
    /// `tx` as they arrive.  The returned completion still carries the full
    /// text and every tool call.
    ///
    /// The default implementation delivers the whole text as a single token.
    async fn complete_stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        let completion = self.complete(request).await?;
        if !completion.content.is_empty() {
            let _ = tx.send(completion.content.clone()).await;
        }
        Ok(completion)
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            request_timeout: config.request_timeout(),
            idle_timeout: config.stream_idle_timeout(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    /// Ask the provider for a fixed phrase within `timeout`.
    pub async fn check_liveness(&self, timeout: Duration) -> Result<String, LlmError> {
        let request = ChatRequest::new("", vec![ChatMessage::user(LIVENESS_PROMPT)]);
        tokio::time::timeout(timeout, self.complete(&request))
            .await
            .map_err(|_| LlmError::Timeout(timeout))?
            .map(|completion| completion.content)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(request.messages.iter().map(wire_message));

        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(tools) = &request.tools {
            payload["tools"] = tools.clone();
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn send(
        &self,
        payload: &Value,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, LlmError> {
        if !self.has_api_key() {
            return Err(LlmError::MissingApiKey);
        }

        let mut builder = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(payload);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|err| {
            LlmError::from_transport(err, timeout.unwrap_or(self.idle_timeout))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatProvider for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        let payload = self.payload(request, false);
        let response = self.send(&payload, Some(self.request_timeout)).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| LlmError::from_transport(err, self.request_timeout))?;
        parse_completion(&body)
    }

    async fn complete_stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        let payload = self.payload(request, true);
        let response = tokio::time::timeout(self.idle_timeout, self.send(&payload, None))
            .await
            .map_err(|_| LlmError::Timeout(self.idle_timeout))??;

        let body = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        let codec = LinesCodec::new_with_max_length(MAX_SSE_LINE_BYTES);
        let mut lines = FramedRead::new(StreamReader::new(body), codec);
        let mut sse = SseAccumulator::default();

        loop {
            let next = tokio::time::timeout(self.idle_timeout, lines.next())
                .await
                .map_err(|_| LlmError::Timeout(self.idle_timeout))?;
            let Some(line) = next else { break };
            let line = line.map_err(|err| LlmError::Stream(err.to_string()))?;

            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                break;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    if let Some(token) = sse.absorb(&chunk) {
                        if tx.send(token).await.is_err() {
                            debug!("token receiver dropped; abandoning provider stream");
                            return Ok(sse.finish());
                        }
                    }
                }
                Err(err) => warn!(%err, "skipping undecodable SSE chunk"),
            }
        }

        Ok(sse.finish())
    }
}

fn wire_message(message: &ChatMessage) -> Value {
    match message.role {
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id.clone().unwrap_or_default(),
            "content": message.content,
        }),
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }
                    })
                })
                .collect::<Vec<_>>();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                json!(message.content)
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
        role => json!({ "role": role, "content": message.content }),
    }
}

fn parse_completion(body: &Value) -> Result<Completion, LlmError> {
    let choice = body
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or_else(|| LlmError::InvalidResponse(format!("response has no choices: {body}")))?;
    let message = &choice["message"];

    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    Ok(Completion {
        content: message["content"].as_str().unwrap_or_default().to_string(),
        tool_calls,
        finish_reason: choice["finish_reason"].as_str().map(ToString::to_string),
    })
}

fn parse_tool_call(call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let raw_args = function
        .get("arguments")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ToolCall {
        id: call["id"].as_str().unwrap_or_default().to_string(),
        name,
        arguments: decode_arguments(raw_args),
    })
}

fn decode_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Folds OpenAI `chat.completion.chunk` deltas into one completion.
#[derive(Debug, Default)]
struct SseAccumulator {
    content: String,
    calls: BTreeMap<u64, PartialCall>,
    finish_reason: Option<String>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl SseAccumulator {
    /// Absorb one chunk; returns its text token, if any.
    fn absorb(&mut self, chunk: &Value) -> Option<String> {
        let choice = chunk.get("choices")?.get(0)?;
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            self.finish_reason = Some(reason.to_string());
        }
        let delta = choice.get("delta")?;

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    entry.id = id.to_string();
                }
                if let Some(function) = call.get("function") {
                    if let Some(name) = function.get("name").and_then(Value::as_str) {
                        entry.name.push_str(name);
                    }
                    if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        let token = delta
            .get("content")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())?;
        self.content.push_str(token);
        Some(token.to_string())
    }

    fn finish(self) -> Completion {
        let tool_calls = self
            .calls
            .into_values()
            .filter(|call| !call.name.is_empty())
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                arguments: decode_arguments(&call.arguments),
            })
            .collect();
        Completion {
            content: self.content,
            tool_calls,
            finish_reason: self.finish_reason,
        }
    }
}

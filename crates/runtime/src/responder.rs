//! Producer side of the streaming path.
//!
//! Drives streaming provider calls with every tool available and writes the
//! activity out as protocol lines: text tokens as `text-delta`, each tool
//! round as `tool-call` / `tool-result` pairs, then one `finish`.  A provider
//! failure becomes a `3:` error part and the stream ends without `finish`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ampere_config::PipelineConfig;
use ampere_llm::{ChatProvider, ChatRequest, Conversation, StreamEvent, encode_error_line, encode_line};
use ampere_tools::ToolRegistry;

use crate::prompts::ASSISTANT_SYSTEM_PROMPT;
use crate::tool_loop::{append_round, execute_tool_calls};

/// Finish reason emitted when the round cap cuts the model off mid tool use.
pub const CAPPED_FINISH_REASON: &str = "tool-calls";

const TOKEN_BUFFER: usize = 64;

/// The consumer dropped its end of the stream.
#[derive(Debug)]
struct Disconnected;

pub struct StreamResponder {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    max_roundtrips: usize,
}

impl StreamResponder {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: Arc<ToolRegistry>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            tools,
            max_roundtrips: config.max_tool_roundtrips,
        }
    }

    /// Answer `conversation`, writing protocol lines into `out`.
    ///
    /// Returns once `finish` or an error part has been written, or as soon
    /// as `out` is closed.
    pub async fn respond(&self, conversation: Conversation, out: mpsc::Sender<String>) {
        if self.drive(conversation, &out).await.is_err() {
            debug!("stream consumer went away; stopping responder");
        }
    }

    async fn drive(&self, conversation: Conversation, out: &mpsc::Sender<String>) -> Result<(), Disconnected> {
        let mut messages = conversation.turns().to_vec();
        let tools = (self.max_roundtrips > 0).then(|| self.tools.openai_tools());
        let mut rounds = 0;

        loop {
            let mut request = ChatRequest::new(ASSISTANT_SYSTEM_PROMPT, messages.clone());
            if let Some(tools) = &tools {
                request = request.with_tools(tools.clone());
            }

            let (token_tx, token_rx) = mpsc::channel(TOKEN_BUFFER);
            let (completion, forwarded) = tokio::join!(
                self.provider.complete_stream(&request, token_tx),
                forward_tokens(token_rx, out),
            );
            forwarded?;

            let completion = match completion {
                Ok(completion) => completion,
                Err(err) => {
                    warn!(%err, round = rounds, "provider failed while streaming");
                    return send(out, encode_error_line(&err.to_string())).await;
                }
            };

            if !completion.has_tool_calls() {
                let reason = completion
                    .finish_reason
                    .as_deref()
                    .map(|r| r.replace('_', "-"))
                    .unwrap_or_else(|| "stop".to_string());
                debug!(%reason, rounds, "stream complete");
                return send(out, encode_line(&StreamEvent::Finish { reason })).await;
            }

            info!(round = rounds, count = completion.tool_calls.len(), "model requested tool calls");
            for call in &completion.tool_calls {
                let event = StreamEvent::ToolCall {
                    name: call.name.clone(),
                    args: call.arguments.clone(),
                };
                send(out, encode_line(&event)).await?;
            }

            let executions = execute_tool_calls(&completion.tool_calls, &self.tools).await;
            for exec in &executions {
                if let Some(result) = exec.result() {
                    let event = StreamEvent::ToolResult {
                        name: exec.tool_name.clone(),
                        result: result.clone(),
                    };
                    send(out, encode_line(&event)).await?;
                }
            }

            rounds += 1;
            if rounds >= self.max_roundtrips {
                warn!(rounds, "tool round cap reached before the model answered");
                let finish = StreamEvent::Finish {
                    reason: CAPPED_FINISH_REASON.to_string(),
                };
                return send(out, encode_line(&finish)).await;
            }
            append_round(&mut messages, completion.content, completion.tool_calls, &executions);
        }
    }
}

async fn send(out: &mpsc::Sender<String>, line: String) -> Result<(), Disconnected> {
    out.send(line).await.map_err(|_| Disconnected)
}

async fn forward_tokens(mut tokens: mpsc::Receiver<String>, out: &mpsc::Sender<String>) -> Result<(), Disconnected> {
    while let Some(token) = tokens.recv().await {
        send(out, encode_line(&StreamEvent::TextDelta { text: token })).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedProvider, call, static_registry};
    use ampere_llm::{AssembledResponse, Completion, LlmError, ResponseAssembler, StreamFrameDecoder};
    use serde_json::json;

    fn responder(provider: Arc<dyn ChatProvider>) -> StreamResponder {
        StreamResponder::new(provider, Arc::new(static_registry()), &PipelineConfig::default())
    }

    async fn collect(responder: &StreamResponder, question: &str) -> Vec<String> {
        let (tx, mut rx) = mpsc::channel(1024);
        responder.respond(Conversation::from_user(question), tx).await;
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    fn assemble(lines: &[String]) -> AssembledResponse {
        let mut decoder = StreamFrameDecoder::new();
        let mut assembler = ResponseAssembler::new();
        for line in lines {
            for event in decoder.decode_chunk(line.as_bytes()) {
                assembler.apply(&event);
            }
        }
        assembler.finish()
    }

    #[tokio::test]
    async fn text_answer_streams_deltas_then_finish() {
        let provider = ScriptedProvider::new(vec![Ok(Completion::text("The peak hour is 6pm."))]);
        let lines = collect(&responder(provider), "What's my peak usage?").await;

        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "0:{\"type\":\"text-delta\",\"textDelta\":\"The \"}\n");
        assert_eq!(lines[5], "0:{\"type\":\"finish\",\"finishReason\":\"stop\"}\n");

        let response = assemble(&lines);
        assert_eq!(response.text, "The peak hour is 6pm.");
        assert!(response.stream_finished);
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let provider = ScriptedProvider::new(vec![
            Ok(Completion::tools(vec![call("c1", "get_weather_data", json!({ "city": "Delhi" }))])),
            Ok(Completion::text("It is hot.")),
        ]);
        let lines = collect(&responder(provider.clone()), "Weather?").await;

        let response = assemble(&lines);
        assert_eq!(response.tool_call_count, 1);
        assert_eq!(response.tool_result_count, 1);
        assert_eq!(response.text, "It is hot.");
        assert!(response.stream_finished);

        let second = &provider.requests()[1];
        assert_eq!(second.system, ASSISTANT_SYSTEM_PROMPT);
        assert_eq!(second.messages.len(), 3);
    }

    #[tokio::test]
    async fn round_cap_finishes_with_tool_calls_reason() {
        let ask = || -> Result<Completion, LlmError> {
            Ok(Completion::tools(vec![call("c", "get_energy_usage_summary", json!({}))]))
        };
        let provider = ScriptedProvider::new(vec![ask(), ask(), ask(), ask()]);
        let lines = collect(&responder(provider.clone()), "Peak?").await;

        assert_eq!(provider.calls(), 3);
        assert_eq!(
            lines.last().map(String::as_str),
            Some("0:{\"type\":\"finish\",\"finishReason\":\"tool-calls\"}\n")
        );
        let response = assemble(&lines);
        assert!(!response.had_any_content);
        assert_eq!(response.tool_call_count, 3);
        assert_eq!(response.tool_result_count, 3);
    }

    #[tokio::test]
    async fn rejected_call_emits_call_without_result() {
        let provider = ScriptedProvider::new(vec![
            Ok(Completion::tools(vec![call("c", "get_weather_data", json!({}))])),
            Ok(Completion::text("Which city?")),
        ]);
        let response = assemble(&collect(&responder(provider), "Weather?").await);
        assert_eq!(response.tool_call_count, 1);
        assert_eq!(response.tool_result_count, 0);
        assert_eq!(response.text, "Which city?");
    }

    #[tokio::test]
    async fn provider_failure_emits_error_part_without_finish() {
        let provider = ScriptedProvider::new(vec![Err(LlmError::Unreachable("dns failure".into()))]);
        let lines = collect(&responder(provider), "Peak?").await;

        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("3:\"provider unreachable: dns failure\""));
        assert!(!assemble(&lines).stream_finished);
    }

    #[tokio::test]
    async fn provider_finish_reason_is_kebab_cased() {
        let provider = ScriptedProvider::new(vec![Ok(Completion {
            content: "Cut".into(),
            tool_calls: vec![],
            finish_reason: Some("content_filter".into()),
        })]);
        let lines = collect(&responder(provider), "Peak?").await;
        assert_eq!(
            lines.last().map(String::as_str),
            Some("0:{\"type\":\"finish\",\"finishReason\":\"content-filter\"}\n")
        );
    }

    #[tokio::test]
    async fn closed_consumer_stops_the_responder() {
        let provider = ScriptedProvider::new(vec![
            Ok(Completion::tools(vec![call("c", "get_energy_usage_summary", json!({}))])),
            Ok(Completion::text("never sent")),
        ]);
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        responder(provider.clone()).respond(Conversation::from_user("Peak?"), tx).await;
        assert_eq!(provider.calls(), 1);
    }
}

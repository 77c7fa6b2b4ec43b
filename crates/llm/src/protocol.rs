//! Line-delimited event protocol spoken by the streaming entry point.
//!
//! Every event is one line: the marker `0:` followed by a JSON envelope whose
//! `type` field selects the variant.  Error parts use the `3:` marker and
//! carry a JSON string.  Anything else on the wire is ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

const EVENT_MARKER: &str = "0:";
const ERROR_MARKER: &str = "3:";

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Incremental text, appended to the running answer.
    TextDelta {
        #[serde(rename = "textDelta")]
        text: String,
    },
    /// Complete replacement of the running answer.
    Text { text: String },
    ToolCall {
        #[serde(rename = "toolName")]
        name: String,
        args: Value,
    },
    ToolResult {
        #[serde(rename = "toolName")]
        name: String,
        result: Value,
    },
    Finish {
        #[serde(rename = "finishReason")]
        reason: String,
    },
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text-delta",
            Self::Text { .. } => "text",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::Finish { .. } => "finish",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` envelope: {source}")]
    Body {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct TextDeltaBody {
    #[serde(rename = "textDelta")]
    text_delta: String,
}

#[derive(Deserialize)]
struct TextBody {
    text: String,
}

#[derive(Deserialize)]
struct ToolCallBody {
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize)]
struct ToolResultBody {
    #[serde(rename = "toolName")]
    tool_name: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct FinishBody {
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
}

fn body<T: DeserializeOwned>(kind: &'static str, envelope: Value) -> Result<T, DecodeError> {
    serde_json::from_value(envelope).map_err(|source| DecodeError::Body { kind, source })
}

fn decode_text_delta(envelope: Value) -> Result<StreamEvent, DecodeError> {
    let body: TextDeltaBody = body("text-delta", envelope)?;
    Ok(StreamEvent::TextDelta { text: body.text_delta })
}

fn decode_text(envelope: Value) -> Result<StreamEvent, DecodeError> {
    let body: TextBody = body("text", envelope)?;
    Ok(StreamEvent::Text { text: body.text })
}

fn decode_tool_call(envelope: Value) -> Result<StreamEvent, DecodeError> {
    let body: ToolCallBody = body("tool-call", envelope)?;
    Ok(StreamEvent::ToolCall {
        name: body.tool_name,
        args: body.args,
    })
}

fn decode_tool_result(envelope: Value) -> Result<StreamEvent, DecodeError> {
    let body: ToolResultBody = body("tool-result", envelope)?;
    Ok(StreamEvent::ToolResult {
        name: body.tool_name,
        result: body.result,
    })
}

fn decode_finish(envelope: Value) -> Result<StreamEvent, DecodeError> {
    let body: FinishBody = body("finish", envelope)?;
    Ok(StreamEvent::Finish {
        reason: body.finish_reason.unwrap_or_else(|| "stop".to_string()),
    })
}

/// Encode `event` as one protocol line, newline included.
pub fn encode_line(event: &StreamEvent) -> String {
    // Serializing a closed enum of strings and JSON values cannot fail.
    let json = serde_json::to_string(event).unwrap_or_default();
    format!("{EVENT_MARKER}{json}\n")
}

/// Encode a provider failure as an error part.
pub fn encode_error_line(message: &str) -> String {
    let json = serde_json::to_string(message).unwrap_or_default();
    format!("{ERROR_MARKER}{json}\n")
}

/// Decode a single protocol line.
///
/// Returns `Ok(None)` for lines without the event marker and for envelopes
/// with an unrecognized `type`.
pub fn decode_line(line: &str) -> Result<Option<StreamEvent>, DecodeError> {
    let line = line.trim_end_matches('\r');
    let Some(payload) = line.strip_prefix(EVENT_MARKER) else {
        return Ok(None);
    };

    let envelope: Value = serde_json::from_str(payload)?;
    let kind = envelope
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?
        .to_string();

    let event = match kind.as_str() {
        "text-delta" => decode_text_delta(envelope)?,
        "text" => decode_text(envelope)?,
        "tool-call" => decode_tool_call(envelope)?,
        "tool-result" => decode_tool_result(envelope)?,
        "finish" => decode_finish(envelope)?,
        other => {
            trace!(kind = other, "ignoring unknown envelope type");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Chunk-at-a-time decoder for the event protocol.
///
/// Holds no partial-line state: each chunk is split on newlines on its own.
/// Lines that fail to decode are logged and counted, never fatal.  The
/// message of the last `3:` error part is kept for the caller.
#[derive(Debug, Default)]
pub struct StreamFrameDecoder {
    dropped: usize,
    error_part: Option<String>,
}

impl StreamFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode_chunk(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let text = String::from_utf8_lossy(chunk);
        let mut events = Vec::new();

        for line in text.split('\n') {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(payload) = line.strip_prefix(ERROR_MARKER) {
                let payload = payload.trim();
                let message = serde_json::from_str::<String>(payload).unwrap_or_else(|_| payload.to_string());
                warn!(%message, "stream carried an error part");
                self.error_part = Some(message);
                continue;
            }
            match decode_line(line) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(err) => {
                    self.dropped += 1;
                    warn!(%err, line, "skipping undecodable stream line");
                }
            }
        }
        events
    }

    /// Lines dropped so far because they failed to decode.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Message of the last `3:` error part seen, if any.
    pub fn error_part(&self) -> Option<&str> {
        self.error_part.as_deref()
    }
}

//! Tool execution shared by the streaming and two-phase paths.
//!
//! The calls of one model turn run concurrently; results come back in call
//! order and are fed to the model as tool-role messages.

use futures::future::join_all;
use serde_json::{Value, json};
use tracing::{info, warn};

use ampere_llm::{ChatMessage, ToolCall};
use ampere_tools::{ToolError, ToolRegistry};

/// Record of a single tool call within one round.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    pub call_id: String,
    pub tool_name: String,
    pub args: Value,
    /// `Err` when the call was rejected before running (unknown tool or bad
    /// arguments).  Backend failures are `Ok` with an `{"error": ...}` payload.
    pub outcome: Result<Value, ToolError>,
}

impl ToolExecution {
    /// The tool's result, if the tool actually ran.
    pub fn result(&self) -> Option<&Value> {
        self.outcome.as_ref().ok()
    }

    /// What the model sees for this call.
    pub fn feedback(&self) -> String {
        match &self.outcome {
            Ok(result) => result.to_string(),
            Err(err) => json!({ "error": err.to_string() }).to_string(),
        }
    }
}

/// Execute a batch of tool calls, running them in parallel.
pub async fn execute_tool_calls(calls: &[ToolCall], registry: &ToolRegistry) -> Vec<ToolExecution> {
    if calls.is_empty() {
        return vec![];
    }

    let futs = calls.iter().map(|call| async move {
        let outcome = registry.invoke(&call.name, &call.arguments).await;
        if let Err(err) = &outcome {
            warn!(tool = %call.name, %err, "tool call rejected");
        }
        ToolExecution {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
            outcome,
        }
    });

    let executions = join_all(futs).await;
    info!(
        calls = executions.len(),
        results = executions.iter().filter(|e| e.result().is_some()).count(),
        "tool round finished"
    );
    executions
}

/// Append the assistant's tool-call turn and one tool-role message per call.
pub fn append_round(
    messages: &mut Vec<ChatMessage>,
    content: String,
    calls: Vec<ToolCall>,
    executions: &[ToolExecution],
) {
    messages.push(ChatMessage::assistant_tool_calls(content, calls));
    for exec in executions {
        messages.push(ChatMessage::tool_result(&exec.call_id, exec.feedback()));
    }
}

//! Two-phase pipeline: bounded tool gathering, then one template-bound
//! analysis call over everything gathered.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use ampere_config::PipelineConfig;
use ampere_llm::{ChatMessage, ChatProvider, ChatRequest, Conversation, LlmError};
use ampere_tools::ToolRegistry;

use crate::error::PipelineError;
use crate::prompts::{ANALYSIS_SYSTEM_PROMPT, GATHER_SYSTEM_PROMPT, STOP_PHRASE, analysis_prompt};
use crate::tool_loop::{append_round, execute_tool_calls};

/// Outcome of a two-phase run.  Serializes as the `/api/chat-enhanced`
/// success body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    #[serde(rename = "message")]
    pub text: String,
    pub tool_calls_made: usize,
    pub tool_results_received: usize,
}

#[derive(Debug, Default)]
struct Gathered {
    calls_made: usize,
    results: Vec<Value>,
}

pub struct TwoPhaseSynthesizer {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    max_roundtrips: usize,
    timeout: Duration,
}

impl TwoPhaseSynthesizer {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: Arc<ToolRegistry>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            tools,
            max_roundtrips: config.max_tool_roundtrips,
            timeout: config.synthesis_timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gather, then synthesize.  Either the full answer or an error; never
    /// a partial answer.
    pub async fn run(&self, conversation: &Conversation) -> Result<SynthesisResult, PipelineError> {
        conversation.validate()?;
        match tokio::time::timeout(self.timeout, self.run_phases(conversation)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(timeout = ?self.timeout, "two-phase pipeline timed out");
                Err(PipelineError::Provider(LlmError::Timeout(self.timeout)))
            }
        }
    }

    async fn run_phases(&self, conversation: &Conversation) -> Result<SynthesisResult, PipelineError> {
        info!("phase 1: gathering energy data");
        let gathered = self.gather(conversation).await.map_err(PipelineError::Provider)?;
        info!(
            tool_calls = gathered.calls_made,
            tool_results = gathered.results.len(),
            "phase 1 complete"
        );

        info!("phase 2: generating analysis");
        let prompt = analysis_prompt(conversation.last_user_message(), &gathered.results);
        let request = ChatRequest::new(ANALYSIS_SYSTEM_PROMPT, vec![ChatMessage::user(prompt)]);
        let completion = self
            .provider
            .complete(&request)
            .await
            .map_err(PipelineError::Synthesis)?;

        let text = completion.content.trim();
        if text.is_empty() {
            return Err(PipelineError::Synthesis(LlmError::InvalidResponse(
                "analysis came back empty".to_string(),
            )));
        }
        info!(chars = text.len(), "phase 2 complete");

        Ok(SynthesisResult {
            text: text.to_string(),
            tool_calls_made: gathered.calls_made,
            tool_results_received: gathered.results.len(),
        })
    }

    async fn gather(&self, conversation: &Conversation) -> Result<Gathered, LlmError> {
        let mut messages = conversation.turns().to_vec();
        let tools = self.tools.openai_tools();
        let mut gathered = Gathered::default();

        for round in 0..self.max_roundtrips {
            let request =
                ChatRequest::new(GATHER_SYSTEM_PROMPT, messages.clone()).with_tools(tools.clone());
            let completion = self.provider.complete(&request).await?;

            if !completion.has_tool_calls() {
                debug!(round, "model stopped requesting tools");
                break;
            }

            let executions = execute_tool_calls(&completion.tool_calls, &self.tools).await;
            gathered.calls_made += executions.len();
            gathered
                .results
                .extend(executions.iter().filter_map(|e| e.result().cloned()));

            if completion.content.contains(STOP_PHRASE) {
                debug!(round, "model signalled data collection complete");
                break;
            }
            if round + 1 == self.max_roundtrips {
                warn!(rounds = self.max_roundtrips, "tool round cap reached; stopping gathering");
                break;
            }
            append_round(&mut messages, completion.content, completion.tool_calls, &executions);
        }

        Ok(gathered)
    }
}

use ampere_llm::{ConversationError, LlmError};
use thiserror::Error;

/// Every way one chat request can fail after its single failover attempt.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid conversation: {0}")]
    Validation(String),
    /// A generation call failed during streaming or gathering.
    #[error("provider error: {0}")]
    Provider(#[source] LlmError),
    /// Gathering succeeded but the analysis call failed.
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] LlmError),
    #[error("the assistant returned an empty response")]
    EmptyResponse,
    #[error("the assistant is still processing your request; please try again")]
    StillProcessing,
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    /// `true` when the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::StillProcessing => true,
            Self::Provider(err) | Self::Synthesis(err) => err.is_unreachable(),
            _ => false,
        }
    }
}

impl From<ConversationError> for PipelineError {
    fn from(err: ConversationError) -> Self {
        Self::Validation(err.to_string())
    }
}

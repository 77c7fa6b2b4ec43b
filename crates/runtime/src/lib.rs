//! Request pipeline of the energy assistant: the streaming responder, the
//! two-phase synthesizer, the failover orchestrator that chooses between
//! them, and the HTTP surface that exposes both.

mod error;
mod events;
mod orchestrator;
pub mod prompts;
mod responder;
mod server;
mod synthesizer;
mod tool_loop;
mod transport;

#[cfg(test)]
mod test_support;

pub use error::PipelineError;
pub use events::PipelineEvent;
pub use orchestrator::{
    AnswerPath, EventStream, FailoverOrchestrator, FinalAnswer, StreamSource, Synthesize, Verdict, classify,
};
pub use responder::{CAPPED_FINISH_REASON, StreamResponder};
pub use server::{AppState, ChatBody, ErrorBody, router, serve};
pub use synthesizer::{SynthesisResult, TwoPhaseSynthesizer};
pub use tool_loop::{ToolExecution, append_round, execute_tool_calls};
pub use transport::{LocalStreamSource, RemoteStreamSource, RemoteSynthesizer};

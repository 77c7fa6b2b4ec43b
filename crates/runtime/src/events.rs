use ampere_llm::StreamEvent;

/// Progress reported while a request is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// UI status line, e.g. "Analyzing your energy data...".
    Status(String),
    /// Incremental answer text.
    Token(String),
    /// The running answer was replaced wholesale.
    Replace(String),
    /// Raw decoded event, reported only under the debug strategy.
    Decoded(StreamEvent),
    /// The stream ended with tool work but no text; the request is being
    /// re-run through the two-phase pipeline.
    FailingOver,
}

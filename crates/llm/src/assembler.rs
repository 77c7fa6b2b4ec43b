use crate::protocol::StreamEvent;

pub const STATUS_ANALYZING: &str = "Analyzing your energy data...";
pub const STATUS_RETRIEVING: &str = "Retrieving results...";

/// What the consumer of a stream ended up with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledResponse {
    pub text: String,
    pub tool_call_count: usize,
    pub tool_result_count: usize,
    /// At least one non-empty text event was seen.
    pub had_any_content: bool,
    /// A `finish` event arrived before the input ended.
    pub stream_finished: bool,
}

impl AssembledResponse {
    pub fn had_tool_activity(&self) -> bool {
        self.tool_call_count > 0 || self.tool_result_count > 0
    }
}

/// Whether the assembler wants more events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

/// Folds [`StreamEvent`]s, in arrival order, into an [`AssembledResponse`].
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    response: AssembledResponse,
    status: Option<&'static str>,
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamEvent) -> Flow {
        if self.response.stream_finished {
            return Flow::Finished;
        }

        match event {
            StreamEvent::TextDelta { text } => {
                self.response.text.push_str(text);
                self.note_content(text);
            }
            StreamEvent::Text { text } => {
                self.response.text.clone_from(text);
                self.note_content(text);
            }
            StreamEvent::ToolCall { .. } => {
                self.response.tool_call_count += 1;
                self.status = Some(STATUS_ANALYZING);
            }
            StreamEvent::ToolResult { .. } => {
                self.response.tool_result_count += 1;
                self.status = Some(STATUS_RETRIEVING);
            }
            StreamEvent::Finish { .. } => {
                self.response.stream_finished = true;
                return Flow::Finished;
            }
        }
        Flow::Continue
    }

    fn note_content(&mut self, text: &str) {
        if !text.is_empty() {
            self.response.had_any_content = true;
            self.status = None;
        }
    }

    /// Status line for the UI while no text has arrived yet.
    pub fn status(&self) -> Option<&'static str> {
        self.status
    }

    pub fn finish(self) -> AssembledResponse {
        self.response
    }
}

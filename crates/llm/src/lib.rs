//! Provider client, conversation types and the streaming event protocol.

pub mod assembler;
pub mod client;
pub mod error;
pub mod protocol;
pub mod types;

pub use assembler::{AssembledResponse, Flow, ResponseAssembler, STATUS_ANALYZING, STATUS_RETRIEVING};
pub use client::{ChatProvider, LIVENESS_PROMPT, OpenAiClient};
pub use error::LlmError;
pub use protocol::{DecodeError, StreamEvent, StreamFrameDecoder, decode_line, encode_error_line, encode_line};
pub use types::{
    ChatMessage, ChatRequest, Completion, Conversation, ConversationError, Role, ToolCall,
};

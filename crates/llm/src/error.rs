use std::time::Duration;

use thiserror::Error;

/// Failures of a generation call.
///
/// The variants keep "provider unreachable" (`Unreachable`, `Timeout`)
/// apart from "provider answered but the answer is unusable" (`Status`,
/// `InvalidResponse`, `Stream`).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API key not configured")]
    MissingApiKey,
    #[error("provider unreachable: {0}")]
    Unreachable(String),
    #[error("provider did not respond within {0:?}")]
    Timeout(Duration),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("provider returned unusable output: {0}")]
    InvalidResponse(String),
    #[error("provider stream interrupted: {0}")]
    Stream(String),
}

impl LlmError {
    pub(crate) fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() || err.is_body() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Unreachable(err.to_string())
        }
    }

    /// `true` when the provider could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }

    /// Rebuild the error behind a `3:` stream error part from its message.
    ///
    /// Only the unreachable/unusable split survives the wire: unreachable
    /// messages come back as [`Unreachable`](Self::Unreachable), everything
    /// else as [`Stream`](Self::Stream).
    pub fn from_error_part(message: &str) -> Self {
        if let Some(cause) = message.strip_prefix(UNREACHABLE_PREFIX) {
            Self::Unreachable(cause.to_string())
        } else if message.starts_with(TIMEOUT_PREFIX) {
            Self::Unreachable(message.to_string())
        } else {
            Self::Stream(message.to_string())
        }
    }
}

const UNREACHABLE_PREFIX: &str = "provider unreachable: ";
const TIMEOUT_PREFIX: &str = "provider did not respond within";

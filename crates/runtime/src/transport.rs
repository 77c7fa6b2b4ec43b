//! In-process and HTTP implementations of the orchestrator's two seams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::debug;

use ampere_llm::{Conversation, LlmError};

use crate::error::PipelineError;
use crate::orchestrator::{EventStream, StreamSource, Synthesize};
use crate::responder::StreamResponder;
use crate::server::{ChatBody, ErrorBody};
use crate::synthesizer::SynthesisResult;

const LINE_BUFFER: usize = 64;

/// Longest protocol line accepted from a remote server.
const MAX_LINE_BYTES: usize = 1 << 20;

/// Adapt a channel of protocol lines into a byte stream.
pub(crate) fn line_stream<E>(rx: mpsc::Receiver<String>) -> impl Stream<Item = Result<Bytes, E>> + Send + 'static
where
    E: Send + 'static,
{
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|line| (Ok(Bytes::from(line)), rx))
    })
}

// ── In-process ───────────────────────────────────────────────────────────────

/// Runs the [`StreamResponder`] on a task; every chunk is one encoded line.
/// Dropping the stream stops the responder at its next write.
pub struct LocalStreamSource {
    responder: Arc<StreamResponder>,
}

impl LocalStreamSource {
    pub fn new(responder: Arc<StreamResponder>) -> Self {
        Self { responder }
    }
}

#[async_trait]
impl StreamSource for LocalStreamSource {
    async fn open(&self, conversation: &Conversation) -> Result<EventStream, PipelineError> {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let responder = self.responder.clone();
        let conversation = conversation.clone();
        tokio::spawn(async move { responder.respond(conversation, tx).await });
        Ok(line_stream(rx).boxed())
    }
}

// ── HTTP ─────────────────────────────────────────────────────────────────────

fn transport_error(err: reqwest::Error, timeout: Duration) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Provider(LlmError::Timeout(timeout))
    } else {
        PipelineError::Provider(LlmError::Unreachable(err.to_string()))
    }
}

/// Map a non-2xx reply from the server back into the error taxonomy.
fn error_from_reply(status: u16, body: &str) -> PipelineError {
    let details = serde_json::from_str::<ErrorBody>(body)
        .map(|envelope| envelope.details.unwrap_or(envelope.error))
        .unwrap_or_else(|_| body.to_string());
    match status {
        400 => PipelineError::Validation(details),
        _ => PipelineError::Provider(LlmError::Status { status, body: details }),
    }
}

async fn post(
    client: &reqwest::Client,
    url: &str,
    conversation: &Conversation,
    timeout: Duration,
    whole_request: bool,
) -> Result<reqwest::Response, PipelineError> {
    let mut builder = client.post(url).json(&ChatBody {
        messages: conversation.clone(),
    });
    if whole_request {
        builder = builder.timeout(timeout);
    }
    let response = tokio::time::timeout(timeout, builder.send())
        .await
        .map_err(|_| PipelineError::Provider(LlmError::Timeout(timeout)))?
        .map_err(|err| transport_error(err, timeout))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(error_from_reply(status.as_u16(), &body))
}

/// `POST {url}/api/chat`, re-framed into whole protocol lines.
pub struct RemoteStreamSource {
    client: reqwest::Client,
    url: String,
    idle_timeout: Duration,
}

impl RemoteStreamSource {
    pub fn new(base_url: &str, idle_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/chat", base_url.trim_end_matches('/')),
            idle_timeout,
        }
    }
}

#[async_trait]
impl StreamSource for RemoteStreamSource {
    async fn open(&self, conversation: &Conversation) -> Result<EventStream, PipelineError> {
        debug!(url = %self.url, "opening remote stream");
        let response = post(&self.client, &self.url, conversation, self.idle_timeout, false).await?;

        let body = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        let codec = LinesCodec::new_with_max_length(MAX_LINE_BYTES);
        let lines = FramedRead::new(StreamReader::new(body), codec);
        let idle = self.idle_timeout;

        let stream = futures::stream::unfold(Some(lines), move |state| async move {
            let mut lines = state?;
            match tokio::time::timeout(idle, lines.next()).await {
                Err(_) => Some((Err(PipelineError::Provider(LlmError::Timeout(idle))), None)),
                Ok(None) => None,
                Ok(Some(Ok(line))) => Some((Ok(Bytes::from(format!("{line}\n"))), Some(lines))),
                Ok(Some(Err(err))) => Some((
                    Err(PipelineError::Provider(LlmError::Stream(err.to_string()))),
                    None,
                )),
            }
        });
        Ok(stream.boxed())
    }
}

/// `POST {url}/api/chat-enhanced`.
pub struct RemoteSynthesizer {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RemoteSynthesizer {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/chat-enhanced", base_url.trim_end_matches('/')),
            timeout,
        }
    }
}

#[async_trait]
impl Synthesize for RemoteSynthesizer {
    async fn synthesize(&self, conversation: &Conversation) -> Result<SynthesisResult, PipelineError> {
        debug!(url = %self.url, "requesting remote synthesis");
        let response = post(&self.client, &self.url, conversation, self.timeout, true).await?;
        response
            .json::<SynthesisResult>()
            .await
            .map_err(|err| PipelineError::Synthesis(LlmError::InvalidResponse(err.to_string())))
    }
}

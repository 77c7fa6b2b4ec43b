//! Per-request response strategy with one-shot failover.
//!
//! The streaming path is consumed to the end and classified.  Only the
//! "tool work, finished, no text" signature is re-run through the two-phase
//! pipeline, once, for that request alone.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use ampere_config::{AppConfig, Strategy};
use ampere_llm::{
    AssembledResponse, ChatProvider, Conversation, Flow, LlmError, OpenAiClient, ResponseAssembler,
    StreamEvent, StreamFrameDecoder,
};
use ampere_tools::default_registry;

use crate::error::PipelineError;
use crate::events::PipelineEvent;
use crate::responder::StreamResponder;
use crate::synthesizer::{SynthesisResult, TwoPhaseSynthesizer};
use crate::transport::{LocalStreamSource, RemoteStreamSource, RemoteSynthesizer};

/// Raw protocol bytes, in whatever chunks the transport delivers.
pub type EventStream = BoxStream<'static, Result<Bytes, PipelineError>>;

/// Opens the streaming path for one conversation.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn open(&self, conversation: &Conversation) -> Result<EventStream, PipelineError>;
}

/// Runs the two-phase pipeline for one conversation.
#[async_trait]
pub trait Synthesize: Send + Sync {
    async fn synthesize(&self, conversation: &Conversation) -> Result<SynthesisResult, PipelineError>;
}

#[async_trait]
impl Synthesize for TwoPhaseSynthesizer {
    async fn synthesize(&self, conversation: &Conversation) -> Result<SynthesisResult, PipelineError> {
        self.run(conversation).await
    }
}

/// Which path produced the answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerPath {
    Streamed,
    Synthesized,
    FailedOver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswer {
    pub text: String,
    pub path: AnswerPath,
    pub tool_calls: usize,
    pub tool_results: usize,
}

impl FinalAnswer {
    fn from_synthesis(result: SynthesisResult, path: AnswerPath) -> Self {
        Self {
            text: result.text,
            path,
            tool_calls: result.tool_calls_made,
            tool_results: result.tool_results_received,
        }
    }
}

/// What a fully consumed stream calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Text arrived; return it whether or not the stream finished.
    Answer,
    /// Tool work and a `finish`, but no text.
    FailOver,
    /// Tool work, no text, no `finish`.
    StillProcessing,
    Empty,
}

pub fn classify(response: &AssembledResponse) -> Verdict {
    if response.had_any_content {
        Verdict::Answer
    } else if response.had_tool_activity() && response.stream_finished {
        Verdict::FailOver
    } else if response.had_tool_activity() {
        Verdict::StillProcessing
    } else {
        Verdict::Empty
    }
}

fn report(progress: Option<&mpsc::UnboundedSender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}

pub struct FailoverOrchestrator {
    source: Arc<dyn StreamSource>,
    synthesizer: Arc<dyn Synthesize>,
}

impl FailoverOrchestrator {
    pub fn new(source: Arc<dyn StreamSource>, synthesizer: Arc<dyn Synthesize>) -> Self {
        Self { source, synthesizer }
    }

    /// Both paths in-process, against the configured provider and backend.
    pub fn local(config: &AppConfig) -> Self {
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiClient::new(&config.llm));
        let tools = Arc::new(default_registry(&config.backend));
        let responder = StreamResponder::new(provider.clone(), tools.clone(), &config.pipeline);
        let synthesizer = TwoPhaseSynthesizer::new(provider, tools, &config.pipeline);
        Self::new(
            Arc::new(LocalStreamSource::new(Arc::new(responder))),
            Arc::new(synthesizer),
        )
    }

    /// Both paths through a running server at `base_url`.
    pub fn remote(base_url: &str, config: &AppConfig) -> Self {
        Self::new(
            Arc::new(RemoteStreamSource::new(base_url, config.llm.stream_idle_timeout())),
            Arc::new(RemoteSynthesizer::new(base_url, config.pipeline.synthesis_timeout())),
        )
    }

    /// Answer one conversation under `strategy`.
    ///
    /// `cancel` aborts the streaming path; the two-phase path always runs to
    /// completion or its own timeout.
    pub async fn run(
        &self,
        conversation: Conversation,
        strategy: Strategy,
        cancel: &CancellationToken,
        progress: Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Result<FinalAnswer, PipelineError> {
        conversation.validate()?;

        if strategy == Strategy::TwoPhase {
            info!("answering through the two-phase pipeline");
            let result = self.synthesizer.synthesize(&conversation).await?;
            return Ok(FinalAnswer::from_synthesis(result, AnswerPath::Synthesized));
        }

        let debug = strategy == Strategy::Debug;
        let (response, interrupted) = self.consume(&conversation, debug, cancel, progress).await?;
        let verdict = classify(&response);
        info!(
            ?verdict,
            chars = response.text.len(),
            tool_calls = response.tool_call_count,
            tool_results = response.tool_result_count,
            finished = response.stream_finished,
            "stream consumed"
        );

        if verdict == Verdict::Answer {
            return Ok(FinalAnswer {
                text: response.text,
                path: AnswerPath::Streamed,
                tool_calls: response.tool_call_count,
                tool_results: response.tool_result_count,
            });
        }
        if let Some(err) = interrupted {
            return Err(err);
        }

        match verdict {
            Verdict::FailOver if !debug => {
                warn!("stream finished with tool activity but no text; failing over to two-phase");
                report(progress, PipelineEvent::FailingOver);
                let result = self.synthesizer.synthesize(&conversation).await?;
                Ok(FinalAnswer::from_synthesis(result, AnswerPath::FailedOver))
            }
            Verdict::StillProcessing => Err(PipelineError::StillProcessing),
            _ => Err(PipelineError::EmptyResponse),
        }
    }

    /// Read the stream to its end (or `finish`).  A transport error ends
    /// consumption early and is handed back alongside what was assembled, as
    /// is the provider failure carried by a `3:` error part.
    async fn consume(
        &self,
        conversation: &Conversation,
        debug: bool,
        cancel: &CancellationToken,
        progress: Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Result<(AssembledResponse, Option<PipelineError>), PipelineError> {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            opened = self.source.open(conversation) => opened?,
        };

        let mut decoder = StreamFrameDecoder::new();
        let mut assembler = ResponseAssembler::new();
        let mut status = None;
        let mut interrupted = None;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("streaming request cancelled");
                    return Err(PipelineError::Cancelled);
                }
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(err)) => {
                    warn!(%err, "stream interrupted");
                    interrupted = Some(err);
                    break;
                }
            };

            for event in decoder.decode_chunk(&chunk) {
                trace!(kind = event.kind(), "decoded stream event");
                if debug {
                    report(progress, PipelineEvent::Decoded(event.clone()));
                }
                match &event {
                    StreamEvent::TextDelta { text } if !text.is_empty() => {
                        report(progress, PipelineEvent::Token(text.clone()));
                    }
                    StreamEvent::Text { text } => {
                        report(progress, PipelineEvent::Replace(text.clone()));
                    }
                    _ => {}
                }

                let flow = assembler.apply(&event);
                if assembler.status() != status {
                    status = assembler.status();
                    if let Some(line) = status {
                        report(progress, PipelineEvent::Status(line.to_string()));
                    }
                }
                if flow == Flow::Finished {
                    break 'read;
                }
            }
        }

        if decoder.dropped() > 0 {
            warn!(dropped = decoder.dropped(), "stream contained undecodable lines");
        }
        if interrupted.is_none() {
            interrupted = decoder
                .error_part()
                .map(|message| PipelineError::Provider(LlmError::from_error_part(message)));
        }
        Ok((assembler.finish(), interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use ampere_config::PipelineConfig;
    use ampere_llm::{Completion, encode_error_line, encode_line};

    use crate::test_support::{ScriptedProvider, call, static_registry};
    use serde_json::json;

    /// Replays one scripted chunk list per `open`.
    struct ScriptedSource {
        scripts: Mutex<VecDeque<Vec<Result<Bytes, PipelineError>>>>,
        opens: AtomicUsize,
        hang_after: bool,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Vec<Result<Bytes, PipelineError>>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opens: AtomicUsize::new(0),
                hang_after: false,
            })
        }

        fn hanging(chunks: Vec<Result<Bytes, PipelineError>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(vec![chunks].into()),
                opens: AtomicUsize::new(0),
                hang_after: true,
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn open(&self, _conversation: &Conversation) -> Result<EventStream, PipelineError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let chunks = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let stream = futures::stream::iter(chunks);
            if self.hang_after {
                Ok(stream.chain(futures::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }
    }

    struct FixedSynth {
        calls: AtomicUsize,
    }

    impl FixedSynth {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Synthesize for FixedSynth {
        async fn synthesize(&self, _conversation: &Conversation) -> Result<SynthesisResult, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SynthesisResult {
                text: "**⚡ EXECUTIVE SUMMARY** Peak usage is 18:00-21:00.".into(),
                tool_calls_made: 1,
                tool_results_received: 1,
            })
        }
    }

    fn line(event: StreamEvent) -> Result<Bytes, PipelineError> {
        Ok(Bytes::from(encode_line(&event)))
    }

    fn delta(text: &str) -> Result<Bytes, PipelineError> {
        line(StreamEvent::TextDelta { text: text.into() })
    }

    fn finish(reason: &str) -> Result<Bytes, PipelineError> {
        line(StreamEvent::Finish { reason: reason.into() })
    }

    fn tool_call() -> Result<Bytes, PipelineError> {
        line(StreamEvent::ToolCall {
            name: "get_energy_usage_summary".into(),
            args: json!({}),
        })
    }

    fn tool_result() -> Result<Bytes, PipelineError> {
        line(StreamEvent::ToolResult {
            name: "get_energy_usage_summary".into(),
            result: json!({ "peak_hour": "18:00" }),
        })
    }

    fn tool_only_stream() -> Vec<Result<Bytes, PipelineError>> {
        vec![tool_call(), tool_result(), finish("tool-calls")]
    }

    fn peak_question() -> Conversation {
        Conversation::from_user("What's my peak usage?")
    }

    async fn run(
        orchestrator: &FailoverOrchestrator,
        strategy: Strategy,
    ) -> Result<FinalAnswer, PipelineError> {
        orchestrator
            .run(peak_question(), strategy, &CancellationToken::new(), None)
            .await
    }

    #[test]
    fn classify_covers_every_signature() {
        let mut response = AssembledResponse::default();
        assert_eq!(classify(&response), Verdict::Empty);
        response.stream_finished = true;
        assert_eq!(classify(&response), Verdict::Empty);
        response.tool_call_count = 1;
        assert_eq!(classify(&response), Verdict::FailOver);
        response.stream_finished = false;
        assert_eq!(classify(&response), Verdict::StillProcessing);
        response.had_any_content = true;
        assert_eq!(classify(&response), Verdict::Answer);
    }

    #[tokio::test]
    async fn tool_only_stream_fails_over_once() {
        let source = ScriptedSource::new(vec![tool_only_stream()]);
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(source.clone(), synth.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let answer = orchestrator
            .run(peak_question(), Strategy::Streaming, &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();

        assert_eq!(answer.path, AnswerPath::FailedOver);
        assert_eq!(answer.tool_calls, 1);
        assert!(answer.text.starts_with("**⚡ EXECUTIVE SUMMARY**"));
        assert_eq!(synth.calls(), 1);

        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(
            events,
            vec![
                PipelineEvent::Status("Analyzing your energy data...".into()),
                PipelineEvent::Status("Retrieving results...".into()),
                PipelineEvent::FailingOver,
            ]
        );
    }

    #[tokio::test]
    async fn streamed_text_is_returned_without_failover() {
        let chunks = ["The ", "peak ", "hour ", "is ", "6pm."]
            .into_iter()
            .map(delta)
            .chain([finish("stop")])
            .collect();
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(ScriptedSource::new(vec![chunks]), synth.clone());

        let answer = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(answer.text, "The peak hour is 6pm.");
        assert_eq!(answer.path, AnswerPath::Streamed);
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn text_without_finish_still_counts() {
        let source = ScriptedSource::new(vec![vec![tool_call(), tool_result(), delta("Evenings.")]]);
        let orchestrator = FailoverOrchestrator::new(source, FixedSynth::new());
        let answer = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(answer.text, "Evenings.");
        assert_eq!(answer.tool_calls, 1);
    }

    #[tokio::test]
    async fn unfinished_tool_activity_is_still_processing() {
        let synth = FixedSynth::new();
        let source = ScriptedSource::new(vec![vec![tool_call(), tool_result()]]);
        let orchestrator = FailoverOrchestrator::new(source, synth.clone());

        let err = run(&orchestrator, Strategy::Streaming).await.unwrap_err();
        assert!(matches!(err, PipelineError::StillProcessing));
        assert!(err.is_retryable());
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn finish_alone_is_empty() {
        let synth = FixedSynth::new();
        let orchestrator =
            FailoverOrchestrator::new(ScriptedSource::new(vec![vec![finish("stop")]]), synth.clone());

        let err = run(&orchestrator, Strategy::Streaming).await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResponse));
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn garbage_between_envelopes_does_not_break_decoding() {
        let chunks = vec![
            delta("Peak "),
            Ok(Bytes::from_static(b"0:{\"type\":\"text-delta\",\"textDe\n")),
            delta("at 6pm."),
            finish("stop"),
        ];
        let orchestrator = FailoverOrchestrator::new(ScriptedSource::new(vec![chunks]), FixedSynth::new());
        let answer = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(answer.text, "Peak at 6pm.");
    }

    #[tokio::test]
    async fn two_phase_strategy_skips_streaming() {
        let source = ScriptedSource::new(vec![]);
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(source.clone(), synth.clone());

        let answer = run(&orchestrator, Strategy::TwoPhase).await.unwrap();
        assert_eq!(answer.path, AnswerPath::Synthesized);
        assert_eq!(source.opens(), 0);
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn debug_strategy_reports_events_and_never_fails_over() {
        let synth = FixedSynth::new();
        let orchestrator =
            FailoverOrchestrator::new(ScriptedSource::new(vec![tool_only_stream()]), synth.clone());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = orchestrator
            .run(peak_question(), Strategy::Debug, &CancellationToken::new(), Some(&tx))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptyResponse));
        assert_eq!(synth.calls(), 0);

        drop(tx);
        let mut decoded = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, PipelineEvent::Decoded(_)) {
                decoded += 1;
            }
        }
        assert_eq!(decoded, 3);
    }

    #[tokio::test]
    async fn failover_does_not_leak_into_the_next_request() {
        let source = ScriptedSource::new(vec![tool_only_stream(), vec![delta("Hi."), finish("stop")]]);
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(source.clone(), synth.clone());

        let first = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(first.path, AnswerPath::FailedOver);

        let second = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(second.path, AnswerPath::Streamed);
        assert_eq!(source.opens(), 2);
        assert_eq!(synth.calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_tears_down_the_read_loop() {
        let source = ScriptedSource::hanging(vec![tool_call()]);
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(source, synth.clone());

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = orchestrator
            .run(peak_question(), Strategy::Streaming, &cancel, None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn interrupted_stream_without_text_reports_the_transport_error() {
        let chunks = vec![
            tool_call(),
            Err(PipelineError::Provider(LlmError::Stream("connection reset".into()))),
        ];
        let synth = FixedSynth::new();
        let orchestrator = FailoverOrchestrator::new(ScriptedSource::new(vec![chunks]), synth.clone());

        let err = run(&orchestrator, Strategy::Streaming).await.unwrap_err();
        assert!(matches!(err, PipelineError::Provider(LlmError::Stream(_))));
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn invalid_conversation_never_opens_a_stream() {
        let source = ScriptedSource::new(vec![]);
        let orchestrator = FailoverOrchestrator::new(source.clone(), FixedSynth::new());
        let err = orchestrator
            .run(Conversation::default(), Strategy::Streaming, &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(source.opens(), 0);
    }

    fn over_local_responder(provider: Arc<ScriptedProvider>, synth: Arc<FixedSynth>) -> FailoverOrchestrator {
        let responder = StreamResponder::new(provider, Arc::new(static_registry()), &PipelineConfig::default());
        FailoverOrchestrator::new(Arc::new(LocalStreamSource::new(Arc::new(responder))), synth)
    }

    #[tokio::test]
    async fn unreachable_provider_surfaces_as_provider_error() {
        let provider = ScriptedProvider::new(vec![Err(LlmError::Unreachable("connection refused".into()))]);
        let synth = FixedSynth::new();
        let orchestrator = over_local_responder(provider, synth.clone());

        let err = run(&orchestrator, Strategy::Streaming).await.unwrap_err();
        assert!(matches!(&err, PipelineError::Provider(LlmError::Unreachable(cause)) if cause == "connection refused"));
        assert_eq!(err.to_string(), "provider error: provider unreachable: connection refused");
        assert!(err.is_retryable());
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn provider_rejection_after_tool_round_is_not_still_processing() {
        let provider = ScriptedProvider::new(vec![
            Ok(Completion::tools(vec![call("c1", "get_energy_usage_summary", json!({}))])),
            Err(LlmError::Status {
                status: 401,
                body: "bad key".into(),
            }),
        ]);
        let synth = FixedSynth::new();
        let orchestrator = over_local_responder(provider, synth.clone());

        let err = run(&orchestrator, Strategy::Streaming).await.unwrap_err();
        assert!(
            matches!(&err, PipelineError::Provider(LlmError::Stream(message)) if message == "provider returned HTTP 401: bad key")
        );
        assert!(!err.is_retryable());
        assert_eq!(synth.calls(), 0);
    }

    #[tokio::test]
    async fn text_before_an_error_part_is_still_the_answer() {
        let chunks = vec![
            delta("Peak is 6pm."),
            Ok(Bytes::from(encode_error_line("provider stream interrupted: reset"))),
        ];
        let orchestrator = FailoverOrchestrator::new(ScriptedSource::new(vec![chunks]), FixedSynth::new());
        let answer = run(&orchestrator, Strategy::Streaming).await.unwrap();
        assert_eq!(answer.text, "Peak is 6pm.");
        assert_eq!(answer.path, AnswerPath::Streamed);
    }
}

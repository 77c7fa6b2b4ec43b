//! HTTP entry points for both response paths.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info};

use ampere_config::AppConfig;
use ampere_llm::{ChatMessage, ChatProvider, ChatRequest, Conversation, LIVENESS_PROMPT, LlmError, OpenAiClient};
use ampere_tools::{ToolRegistry, ToolSpec, default_registry};

use crate::error::PipelineError;
use crate::responder::StreamResponder;
use crate::synthesizer::{SynthesisResult, TwoPhaseSynthesizer};
use crate::transport::line_stream;

const LINE_BUFFER: usize = 64;

/// Request body of both chat endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatBody {
    pub messages: Conversation,
}

/// Failure envelope returned with a non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Application state shared across routes.
#[derive(Clone)]
pub struct AppState {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<ToolRegistry>,
    responder: Arc<StreamResponder>,
    synthesizer: Arc<TwoPhaseSynthesizer>,
    api_key_present: bool,
    health_timeout: Duration,
}

impl AppState {
    pub fn new(provider: Arc<dyn ChatProvider>, tools: Arc<ToolRegistry>, config: &AppConfig) -> Self {
        let responder = StreamResponder::new(provider.clone(), tools.clone(), &config.pipeline);
        let synthesizer = TwoPhaseSynthesizer::new(provider.clone(), tools.clone(), &config.pipeline);
        Self {
            provider,
            tools,
            responder: Arc::new(responder),
            synthesizer: Arc::new(synthesizer),
            api_key_present: config.llm.has_api_key(),
            health_timeout: config.llm.health_timeout(),
        }
    }

    /// State backed by the configured OpenAI-compatible provider and the
    /// energy backend.
    pub fn from_config(config: &AppConfig) -> Self {
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiClient::new(&config.llm));
        let tools = Arc::new(default_registry(&config.backend));
        Self::new(provider, tools, config)
    }

    fn require_api_key(&self) -> Result<(), ApiError> {
        if self.api_key_present {
            Ok(())
        } else {
            Err(ApiError::MissingApiKey)
        }
    }
}

/// Create router with all routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/chat-enhanced", post(chat_enhanced))
        .route("/api/test-openai", get(test_openai))
        .route("/api/tools", get(list_tools))
        .with_state(state)
}

/// Bind `[server] bind` and serve until Ctrl-C.
pub async fn serve(config: &AppConfig) -> Result<()> {
    if !config.llm.has_api_key() {
        tracing::warn!("no API key configured; chat endpoints will answer 500");
    }
    let state = AppState::from_config(config);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(addr = %listener.local_addr()?, tools = state.tools.len(), "energy assistant listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────────────────

enum ApiError {
    MissingApiKey,
    Pipeline(PipelineError),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        ApiError::Pipeline(err)
    }
}

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
        PipelineError::Provider(LlmError::Timeout(_)) | PipelineError::Synthesis(LlmError::Timeout(_)) => {
            StatusCode::GATEWAY_TIMEOUT
        }
        PipelineError::Provider(_) | PipelineError::Synthesis(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingApiKey => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "OpenAI API key not configured".to_string(),
                    details: None,
                }),
            )
                .into_response(),
            ApiError::Pipeline(err) => {
                let status = status_for(&err);
                error!(%err, status = status.as_u16(), "request failed");
                (
                    status,
                    Json(ErrorBody {
                        error: "Failed to process request".to_string(),
                        details: Some(err.to_string()),
                    }),
                )
                    .into_response()
            }
        }
    }
}

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST /api/chat - stream protocol lines as they are produced
async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> Result<Response, ApiError> {
    state.require_api_key()?;
    body.messages.validate().map_err(PipelineError::from)?;

    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let responder = state.responder.clone();
    tokio::spawn(async move { responder.respond(body.messages, tx).await });

    let stream = Body::from_stream(line_stream::<Infallible>(rx));
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], stream).into_response())
}

/// POST /api/chat-enhanced - gather, then synthesize
async fn chat_enhanced(
    State(state): State<AppState>,
    Json(body): Json<ChatBody>,
) -> Result<Json<SynthesisResult>, ApiError> {
    state.require_api_key()?;
    let result = state.synthesizer.run(&body.messages).await?;
    info!(
        tool_calls = result.tool_calls_made,
        tool_results = result.tool_results_received,
        "two-phase request complete"
    );
    Ok(Json(result))
}

/// GET /api/test-openai - provider liveness check
async fn test_openai(State(state): State<AppState>) -> Response {
    if !state.api_key_present {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "OpenAI API key not configured",
                "apiKeyPresent": false,
            })),
        )
            .into_response();
    }

    let request = ChatRequest::new("", vec![ChatMessage::user(LIVENESS_PROMPT)]);
    let outcome = tokio::time::timeout(state.health_timeout, state.provider.complete(&request))
        .await
        .unwrap_or(Err(LlmError::Timeout(state.health_timeout)));

    match outcome {
        Ok(completion) => Json(json!({
            "success": true,
            "message": completion.content,
            "apiKeyPresent": true,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "error": "OpenAI API test failed",
                "details": err.to_string(),
                "apiKeyPresent": true,
            })),
        )
            .into_response(),
    }
}

/// GET /api/tools - registered tool specs
async fn list_tools(State(state): State<AppState>) -> Json<Vec<ToolSpec>> {
    Json(state.tools.list_specs())
}

//! Scripted provider and in-memory tools for pipeline tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use ampere_config::AppConfig;
use ampere_llm::{ChatProvider, ChatRequest, Completion, LlmError, ToolCall};
use ampere_tools::{Tool, ToolParam, ToolRegistry, ToolSpec};

use crate::server::{AppState, router};

/// Provider that replays a fixed list of answers and records every request.
pub(crate) struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new(script: Vec<Result<Completion, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn next(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".into())))
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, LlmError> {
        self.next(request)
    }

    async fn complete_stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        let completion = self.next(request)?;
        for token in completion.content.split_inclusive(' ') {
            let _ = tx.send(token.to_string()).await;
        }
        Ok(completion)
    }
}

pub(crate) fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

struct StaticTool {
    name: &'static str,
    params: Vec<ToolParam>,
    result: Value,
}

#[async_trait]
impl Tool for StaticTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: format!("static {}", self.name),
            params: self.params.clone(),
        }
    }

    async fn run(&self, args: &Map<String, Value>) -> Value {
        let mut result = self.result.clone();
        if let (Some(out), false) = (result.as_object_mut(), args.is_empty()) {
            out.extend(args.clone());
        }
        result
    }
}

/// Registry with a usage summary and a weather tool that never touch the
/// network.  The weather tool echoes its arguments into the result.
pub(crate) fn static_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::default();
    registry.register(Box::new(StaticTool {
        name: "get_energy_usage_summary",
        params: vec![],
        result: json!({ "peak_hour": "18:00", "total_kwh": 412.5 }),
    }));
    registry.register(Box::new(StaticTool {
        name: "get_weather_data",
        params: vec![ToolParam::required("city", "city name")],
        result: json!({ "temp_c": 31 }),
    }));
    registry
}

/// Serve the HTTP routes on an ephemeral port, backed by `provider` and
/// [`static_registry`].  Returns the base URL.
pub(crate) async fn spawn_server(provider: Arc<ScriptedProvider>) -> String {
    spawn_server_with(provider, true).await
}

pub(crate) async fn spawn_server_with(provider: Arc<ScriptedProvider>, api_key_present: bool) -> String {
    let mut config = AppConfig::default();
    if api_key_present {
        config.llm.api_key = "test-key".to_string();
    }
    let state = AppState::new(provider, Arc::new(static_registry()), &config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(state)).await.unwrap() });
    format!("http://{addr}")
}

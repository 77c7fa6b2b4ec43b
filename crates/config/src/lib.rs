use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Response strategy ─────────────────────────────────────────────────────────

/// How a single chat request is answered.
///
/// | Strategy    | Behaviour                                                        |
/// |-------------|------------------------------------------------------------------|
/// | `streaming` | Stream first; fail over to the two-phase pipeline once when the  |
/// |             | model did tool work but never produced text.                     |
/// | `two-phase` | Skip streaming and run gather-then-synthesize directly.          |
/// | `debug`     | Stream only, report every decoded event, never fail over.        |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Streaming,
    TwoPhase,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    /// Overridden at runtime by `OPENAI_BASE_URL` when set.
    pub base_url: String,
    pub model: String,
    /// API key.  `OPENAI_API_KEY` takes precedence over the file value.
    pub api_key: String,
    /// Upper bound for a single non-streaming generation call.
    pub request_timeout_secs: u64,
    /// Maximum silence between two reads of a streaming response.
    pub stream_idle_timeout_secs: u64,
    /// Bound for the provider liveness check.
    pub health_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            request_timeout_secs: 60,
            stream_idle_timeout_secs: 30,
            health_timeout_secs: 5,
        }
    }
}

impl LlmConfig {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// Energy data backend queried by the tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Overridden at runtime by `AMPERE_BACKEND_URL` when set.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            timeout_secs: 5,
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model↔tool round-trips allowed per request, on both the streaming and
    /// the two-phase path.
    pub max_tool_roundtrips: usize,
    pub strategy: Strategy,
    /// Upper bound for a whole two-phase run (gathering + synthesis).
    pub synthesis_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_tool_roundtrips: 3,
            strategy: Strategy::Streaming,
            synthesis_timeout_secs: 180,
        }
    }
}

impl PipelineConfig {
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.synthesis_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// When non-empty, `ampere ask` talks to this server instead of running
    /// the pipeline in-process.
    pub remote_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            remote_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub backend: BackendConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // Env overrides take precedence over the config file.
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }
        if let Ok(url) = env::var("OPENAI_BASE_URL") {
            if !url.is_empty() {
                config.llm.base_url = url;
            }
        }
        if let Ok(url) = env::var("AMPERE_BACKEND_URL") {
            if !url.is_empty() {
                config.backend.base_url = url;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Remote server URL for `ask`, if one is configured.
    pub fn remote_url(&self) -> Option<&str> {
        let url = self.server.remote_url.trim();
        (!url.is_empty()).then_some(url)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

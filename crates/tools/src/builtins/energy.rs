//! Energy backend tools.
//!
//! Each tool is one HTTP GET against the energy backend.  A 2xx JSON body is
//! returned as-is; every other outcome is folded into
//! `{"error": "Failed to fetch <label>: <cause>"}`.

use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use ampere_config::BackendConfig;

use crate::{Tool, ToolParam, ToolSpec};

/// Characters escaped inside a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Why a backend fetch produced no usable JSON.
#[derive(Debug, Error)]
pub enum ToolFetchError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(String),
    #[error("HTTP error! status: {0}")]
    Status(u16),
    #[error("response body is not JSON: {0}")]
    Decode(String),
}

/// Thin GET-only client for the energy backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &BackendConfig) -> Self {
        Self::with_timeout(&config.base_url, config.timeout())
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// GET `{base}/{path}` and decode the body as JSON.
    pub async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, ToolFetchError> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        debug!(%url, "backend GET");

        let response = self
            .client
            .get(&url)
            .query(query)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolFetchError::Status(status.as_u16()));
        }
        response.json::<Value>().await.map_err(|err| {
            if err.is_timeout() {
                ToolFetchError::Timeout(self.timeout)
            } else {
                ToolFetchError::Decode(err.to_string())
            }
        })
    }

    fn classify(&self, err: reqwest::Error) -> ToolFetchError {
        if err.is_timeout() {
            ToolFetchError::Timeout(self.timeout)
        } else {
            ToolFetchError::Transport(err.to_string())
        }
    }
}

/// Fold a fetch outcome into the payload handed back to the model.
fn fold(label: &str, outcome: Result<Value, ToolFetchError>) -> Value {
    match outcome {
        Ok(data) => data,
        Err(err) => {
            warn!(%err, label, "backend fetch failed");
            json!({ "error": format!("Failed to fetch {label}: {err}") })
        }
    }
}

fn device_path(device_name: &str) -> String {
    format!("device/{}", utf8_percent_encode(device_name, PATH_SEGMENT))
}

fn string_arg<'a>(args: &'a Map<String, Value>, name: &str) -> &'a str {
    args.get(name).and_then(Value::as_str).unwrap_or_default()
}

// ── Parameterless tools ──────────────────────────────────────────────────────

pub struct EnergyUsageSummaryTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for EnergyUsageSummaryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_energy_usage_summary".to_string(),
            description: "Analyzes the user's overall energy usage patterns, including peak usage \
                hours and total consumption across morning, afternoon, evening and night."
                .to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &Map<String, Value>) -> Value {
        fold("energy usage summary", self.backend.get_json("peak", &[]).await)
    }
}

pub struct DeviceConsumptionTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for DeviceConsumptionTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_device_consumption_data".to_string(),
            description: "Retrieves energy consumption for all smart devices: current power, \
                total energy, peak usage and efficiency.  Use it to find high-consuming devices \
                and idle loads."
                .to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &Map<String, Value>) -> Value {
        fold("device consumption data", self.backend.get_json("devices", &[]).await)
    }
}

pub struct PredictedBillTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for PredictedBillTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_predicted_bill_and_tariff".to_string(),
            description: "Forecasts the end-of-month electricity bill from current consumption \
                and applies the tiered TNEB LT-1A tariff, with a slab-wise breakdown."
                .to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &Map<String, Value>) -> Value {
        fold("predicted bill and tariff data", self.backend.get_json("predict", &[]).await)
    }
}

pub struct EnergySuggestionsTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for EnergySuggestionsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_general_energy_suggestions".to_string(),
            description: "Fetches general energy-saving suggestions derived from overall usage \
                patterns."
                .to_string(),
            params: vec![],
        }
    }

    async fn run(&self, _args: &Map<String, Value>) -> Value {
        fold("general energy suggestions", self.backend.get_json("suggestions", &[]).await)
    }
}

// ── Parameterized tools ──────────────────────────────────────────────────────

pub struct DeviceDetailsTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for DeviceDetailsTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_specific_device_details".to_string(),
            description: "Retrieves hourly and daily usage, efficiency and backend suggestions \
                for one smart device."
                .to_string(),
            params: vec![ToolParam::required(
                "device_name",
                "Exact device name, e.g. 'AC', 'Fridge', 'Television', 'Light', 'Fan', \
                 'Washing Machine'.",
            )],
        }
    }

    async fn run(&self, args: &Map<String, Value>) -> Value {
        let device = string_arg(args, "device_name");
        let outcome = self.backend.get_json(&device_path(device), &[]).await;
        fold(&format!("details for {device}"), outcome)
    }
}

pub struct WeatherTool {
    pub backend: BackendClient,
}

#[async_trait]
impl Tool for WeatherTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "get_weather_data".to_string(),
            description: "Fetches current temperature, condition and humidity for a city, for \
                context-aware heating and cooling advice."
                .to_string(),
            params: vec![ToolParam::required(
                "city",
                "City name, e.g. 'Chennai', 'Delhi', 'Mumbai'.",
            )],
        }
    }

    async fn run(&self, args: &Map<String, Value>) -> Value {
        let city = string_arg(args, "city");
        let outcome = self.backend.get_json("weather", &[("city", city)]).await;
        fold(&format!("weather data for {city}"), outcome)
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info};

// ── Tool specs ───────────────────────────────────────────────────────────────

/// JSON-friendly type hint for a tool parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }

    /// `true` when `value` is acceptable for this type.  No coercion: the
    /// string `"3"` is not an integer.
    pub fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Describes a single parameter that a tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    pub description: String,
    pub required: bool,
    #[serde(default)]
    pub param_type: ParamType,
}

impl ToolParam {
    /// Required string parameter.
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
            param_type: ParamType::String,
        }
    }
}

/// Static metadata about a tool, used by the model to decide which tool to call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ToolParam>,
}

impl ToolSpec {
    /// Generate the OpenAI-compatible `tools` array element for this tool.
    ///
    /// ```json
    /// {
    ///   "type": "function",
    ///   "function": {
    ///     "name": "get_weather_data",
    ///     "description": "...",
    ///     "parameters": {
    ///       "type": "object",
    ///       "properties": { ... },
    ///       "required": [...]
    ///     }
    ///   }
    /// }
    /// ```
    pub fn to_openai_tool_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required: Vec<String> = Vec::new();

        for p in &self.params {
            properties.insert(
                p.name.clone(),
                json!({
                    "type": p.param_type.as_str(),
                    "description": p.description,
                }),
            );
            if p.required {
                required.push(p.name.clone());
            }
        }

        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            }
        })
    }

    /// Check `args` against the declared parameters.
    ///
    /// Arguments must be a JSON object.  Every required parameter must be
    /// present and non-null, and every supplied declared parameter must have
    /// the declared type.  Undeclared keys pass through untouched.
    pub fn validate<'a>(&self, args: &'a Value) -> Result<&'a Map<String, Value>, ValidationError> {
        let Some(object) = args.as_object() else {
            return Err(ValidationError::NotAnObject {
                tool: self.name.clone(),
                found: json_type(args),
            });
        };

        for param in &self.params {
            match object.get(&param.name) {
                None | Some(Value::Null) if param.required => {
                    return Err(ValidationError::MissingParam {
                        tool: self.name.clone(),
                        param: param.name.clone(),
                    });
                }
                None | Some(Value::Null) => {}
                Some(value) if !param.param_type.accepts(value) => {
                    return Err(ValidationError::WrongType {
                        tool: self.name.clone(),
                        param: param.name.clone(),
                        expected: param.param_type.as_str(),
                        found: json_type(value),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(object)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert a slice of `ToolSpec` into the `tools` JSON array accepted by
/// OpenAI-compatible `/chat/completions` endpoints.
pub fn specs_to_openai_tools(specs: &[ToolSpec]) -> Value {
    Value::Array(specs.iter().map(ToolSpec::to_openai_tool_schema).collect())
}

// ── Errors ───────────────────────────────────────────────────────────────────

/// A tool call whose arguments do not match the tool's parameters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{tool}: arguments must be a JSON object, got {found}")]
    NotAnObject { tool: String, found: &'static str },
    #[error("{tool}: missing required parameter `{param}`")]
    MissingParam { tool: String, param: String },
    #[error("{tool}: parameter `{param}` must be {expected}, got {found}")]
    WrongType {
        tool: String,
        param: String,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

// ── Tool trait and registry ──────────────────────────────────────────────────

/// A data-fetch operation the model may call.
///
/// `run` receives arguments that already passed [`ToolSpec::validate`] and
/// never fails: backend problems come back as an `{"error": ...}` payload the
/// model can still reason about.
#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn run(&self, args: &Map<String, Value>) -> Value;
}

/// Fixed set of tools available for the lifetime of the process.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn list_specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    /// Look a tool up by name.  The first registered tool wins on duplicates.
    pub fn resolve(&self, name: &str) -> Result<&dyn Tool, ToolError> {
        self.tools
            .iter()
            .find(|t| t.spec().name == name)
            .map(|t| t.as_ref())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    /// OpenAI `tools` array for every registered tool.
    pub fn openai_tools(&self) -> Value {
        specs_to_openai_tools(&self.list_specs())
    }

    /// Resolve, validate and run one tool call.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<Value, ToolError> {
        let tool = self.resolve(name)?;
        let args = tool.spec().validate(args)?;
        info!(tool = name, "invoking tool");
        let result = tool.run(args).await;
        debug!(tool = name, result = %result, "tool finished");
        Ok(result)
    }
}

// ── Built-in tools ───────────────────────────────────────────────────────────

pub mod builtins;
pub use builtins::{
    BackendClient, DeviceConsumptionTool, DeviceDetailsTool, EnergySuggestionsTool,
    EnergyUsageSummaryTool, PredictedBillTool, ToolFetchError, WeatherTool, default_registry,
};

// ── ToolRegistry tests ───────────────────────────────────────────────────────

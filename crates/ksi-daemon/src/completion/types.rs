//! Request, response, and failure types for the completion subsystem.

use serde_json::Value;
use std::time::Duration;

use ksi_core::KsiError;
use ksi_core::envelope::{EventContext, prefixed_id};

/// A queued completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub request_id: String,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
    pub prompt: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub max_turns: Option<u64>,
    /// Per-request override of the attempt timeout ladder, seconds.
    pub timeout_attempts: Option<Vec<u64>>,
    /// Per-request override of the progress watchdog, seconds.
    pub progress_timeout_secs: Option<u64>,
    pub priority: i64,
    pub client_id: Option<String>,
}

impl CompletionRequest {
    /// Parse a `completion:async` payload. The prompt is the only required
    /// field; ids are generated or taken from context.
    pub fn from_value(
        data: &Value,
        ctx: &EventContext,
        default_model: &str,
    ) -> Result<Self, KsiError> {
        let prompt = data
            .get("prompt")
            .and_then(Value::as_str)
            .ok_or_else(|| KsiError::bad_request("prompt is required"))?
            .to_string();

        let str_list = |field: &str| -> Vec<String> {
            data.get(field)
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            request_id: data
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| prefixed_id("req")),
            agent_id: data
                .get("agent_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| ctx.agent_id.clone()),
            session_id: data
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            prompt,
            model: data
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(default_model)
                .to_string(),
            allowed_tools: str_list("allowed_tools"),
            disallowed_tools: str_list("disallowed_tools"),
            max_turns: data.get("max_turns").and_then(Value::as_u64),
            timeout_attempts: data.get("timeout_attempts").and_then(Value::as_array).map(
                |a| {
                    a.iter()
                        .filter_map(Value::as_u64)
                        .collect()
                },
            ),
            progress_timeout_secs: data.get("progress_timeout").and_then(Value::as_u64),
            priority: data.get("priority").and_then(Value::as_i64).unwrap_or(0),
            client_id: data
                .get("client_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| ctx.client_id.clone()),
        })
    }

    /// Queue key: requests sharing a key run strictly serially.
    pub fn queue_key(&self) -> String {
        self.session_id
            .clone()
            .or_else(|| self.agent_id.clone())
            .unwrap_or_else(|| self.request_id.clone())
    }
}

/// Per-request lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// One provider subprocess invocation.
#[derive(Debug, Clone)]
pub struct ProviderInvocation {
    pub prompt: String,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub session_id: Option<String>,
    pub max_turns: Option<u64>,
    pub attempt_timeout: Duration,
    pub progress_timeout: Duration,
}

/// Parsed provider output.
#[derive(Debug, Clone, Default)]
pub struct ProviderResponse {
    /// The response text delivered to the caller.
    pub text: String,
    /// Provider-issued session token for resumption, when present.
    pub session_id: Option<String>,
    pub usage: Option<Value>,
    /// The full decoded provider document, when stdout was valid JSON.
    pub metadata: Option<Value>,
    pub raw_stdout: String,
    pub stderr: String,
    /// Set when stdout was not valid JSON; the raw text is still the
    /// response.
    pub json_decode_error: Option<String>,
}

/// How a provider invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum ProviderFailure {
    /// Attempt or progress budget exceeded, or the process died to
    /// SIGKILL/SIGTERM. Retryable; consumes one attempt.
    #[error("provider timed out after {elapsed_secs}s ({reason})")]
    Timeout { elapsed_secs: u64, reason: String },

    /// Exit code 1 with stderr content: attributable to the input, never
    /// retried.
    #[error("provider rejected the request: {stderr}")]
    Logical { stderr: String },

    /// The binary could not be spawned, or failed in a way retries cannot
    /// fix.
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("provider invocation cancelled")]
    Cancelled,

    #[error("provider internal failure: {message}")]
    Internal { message: String },
}

impl ProviderFailure {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The stable wire code reported in the terminal `completion:result`.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Logical { .. } => "provider_logical",
            Self::Unavailable { .. } => "provider_unavailable",
            Self::Cancelled => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

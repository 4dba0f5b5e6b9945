//! Stable error taxonomy for daemon replies.
//!
//! Every failure that crosses the dispatcher boundary is reduced to one of
//! these kinds and serialised as a `{code, message, details?}` object in the
//! reply list. The `code` strings are part of the wire protocol and must not
//! change.

use serde_json::{Value, json};

/// Errors with structured variants, one per stable wire code.
#[derive(Debug, thiserror::Error)]
pub enum KsiError {
    /// Malformed envelope, missing required fields, or an event nobody
    /// handles.
    #[error("bad request: {message}")]
    BadRequest { message: String },

    /// Entity/rule not found, duplicate id, or a violated store constraint.
    #[error("precondition failed: {message}")]
    Precondition { message: String },

    /// A completion attempt exceeded its budget or its progress watchdog,
    /// or a correlated request timed out.
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// The provider subprocess failed in a way attributable to its input.
    #[error("provider logical error: {message}")]
    ProviderLogical { message: String },

    /// The provider subprocess could not be spawned or was killed for good.
    #[error("provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    /// The provider produced output we could not interpret. The response is
    /// still delivered alongside this diagnostic.
    #[error("malformed provider output: {message}")]
    MalformedOutput { message: String },

    /// Explicit cancellation by a client or the daemon.
    #[error("cancelled: {message}")]
    Cancelled { message: String },

    /// Handler bug or unhandled failure inside the daemon.
    #[error("internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl KsiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn internal_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The stable wire code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "bad_request",
            Self::Precondition { .. } => "precondition",
            Self::Timeout { .. } => "timeout",
            Self::ProviderLogical { .. } => "provider_logical",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::MalformedOutput { .. } => "malformed_output",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }

    /// Serialise as the `{code, message, details?}` reply object.
    pub fn to_value(&self) -> Value {
        let mut obj = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        if let Self::Internal {
            source: Some(src), ..
        } = self
        {
            obj["error"]["details"] = json!({ "source": src.to_string() });
        }
        obj
    }
}

/// Returns `true` if a reply value is an error object produced by
/// [`KsiError::to_value`].
pub fn is_error_value(value: &Value) -> bool {
    value.get("error").is_some_and(|e| e.get("code").is_some())
}

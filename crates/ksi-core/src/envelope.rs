//! Event envelopes and the `_ksi_context` metadata block.
//!
//! Every frame on the wire and every in-daemon emission is an envelope:
//!
//! ```json
//! {"event":"agent:spawn","data":{...},"_ksi_context":{"correlation_id":"..."}}
//! ```
//!
//! Envelopes are immutable once emitted; routing and replies always build new
//! ones. System metadata lives under `_ksi_context` and is re-stamped at each
//! hop, with the exception of `_agent_id`, which propagates unchanged so that
//! agent-originated chains stay attributed to their agent.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Client ids that identify external CLI tooling rather than agents.
///
/// Requests from these clients get standard event JSON in discovery replies;
/// agent requests get the tool-use flavoured format.
pub const CLI_CLIENT_IDS: &[&str] = &["ksi-cli", "ksi-client", "web-ui"];

/// System metadata carried under the `_ksi_context` key of an envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventContext {
    /// Opaque token tying a request to its single reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Per-connection identity assigned by the transport (or supplied by a
    /// client that maintains a stable identity across reconnects).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Set when the envelope originated inside an agent. Propagated, never
    /// fabricated.
    #[serde(rename = "_agent_id", skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// RFC 3339 stamp applied when the daemon first sees the envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Re-emission depth for routed envelopes; bounds transformer cycles.
    #[serde(rename = "_route_depth", default, skip_serializing_if = "is_zero")]
    pub route_depth: u32,

    /// Unknown context fields are preserved round-trip.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl EventContext {
    /// Fresh context with a newly generated correlation id.
    pub fn with_correlation() -> Self {
        Self {
            correlation_id: Some(new_correlation_id()),
            ..Default::default()
        }
    }

    /// Stamp transport-level metadata: client id (if not already claimed by
    /// the client) and the receive timestamp.
    pub fn stamp(&mut self, client_id: &str) {
        if self.client_id.is_none() {
            self.client_id = Some(client_id.to_string());
        }
        self.timestamp = Some(now_iso());
    }

    /// The minimal context propagated to downstream emissions: `_agent_id`
    /// only. All other system fields are re-stamped per hop.
    pub fn propagate(&self) -> EventContext {
        EventContext {
            agent_id: self.agent_id.clone(),
            ..Default::default()
        }
    }

    /// A child context for a routed re-emission: agent attribution plus an
    /// incremented route depth.
    pub fn route_child(&self) -> EventContext {
        EventContext {
            agent_id: self.agent_id.clone(),
            route_depth: self.route_depth + 1,
            ..Default::default()
        }
    }

    /// Whether this context originates from an agent rather than an external
    /// tool.
    ///
    /// `_agent_id` presence is definitive. Otherwise the known CLI client ids
    /// are external tools, and the coordination client id `claude-code` is
    /// treated as an agent.
    pub fn is_agent(&self) -> bool {
        if self.agent_id.is_some() {
            return true;
        }
        match self.client_id.as_deref() {
            Some(id) if CLI_CLIENT_IDS.contains(&id) => false,
            Some("claude-code") => true,
            _ => false,
        }
    }
}

/// A single event envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Dotted event name, e.g. `agent:spawn`.
    pub event: String,

    /// Free-form payload.
    #[serde(default)]
    pub data: Value,

    /// System metadata.
    #[serde(rename = "_ksi_context", default)]
    pub context: EventContext,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            context: EventContext::default(),
        }
    }

    pub fn with_context(event: impl Into<String>, data: Value, context: EventContext) -> Self {
        Self {
            event: event.into(),
            data,
            context,
        }
    }

    /// Build the reply envelope for this request: same event name, reply
    /// payload, and the request's correlation id carried over.
    pub fn reply(&self, data: Value) -> Envelope {
        Envelope {
            event: self.event.clone(),
            data,
            context: EventContext {
                correlation_id: self.context.correlation_id.clone(),
                client_id: self.context.client_id.clone(),
                timestamp: Some(now_iso()),
                ..Default::default()
            },
        }
    }

    /// Serialise as one newline-terminated wire frame.
    pub fn to_frame(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Current UTC time as RFC 3339.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Current UTC time as fractional epoch seconds, the store's native stamp.
pub fn now_epoch() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Epoch seconds to RFC 3339, for the `*_iso` convenience fields in replies.
pub fn epoch_to_iso(epoch: f64) -> String {
    chrono::DateTime::from_timestamp_millis((epoch * 1000.0) as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// New opaque correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short random id with a type prefix, e.g. `agent_3fa9c1d2`.
pub fn prefixed_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

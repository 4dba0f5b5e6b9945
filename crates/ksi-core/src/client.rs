//! Async client for the daemon's Unix socket.
//!
//! The protocol is newline-delimited JSON envelopes over a persistent
//! connection. Every request carries a correlation id and receives exactly
//! one reply envelope with the same id; envelopes pushed by the daemon for
//! monitor subscriptions arrive interleaved and are buffered for
//! [`EventClient::next_event`].
//!
//! # Platform Notes
//!
//! Unix domain sockets are only available on Unix platforms; this module is
//! compiled there only.

#![cfg(unix)]

use serde_json::{Value, json};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use crate::envelope::{Envelope, EventContext, new_correlation_id};
use crate::error::{KsiError, is_error_value};

/// Default wait for a correlated reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// A connected daemon client.
pub struct EventClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: Option<String>,
    /// Streamed envelopes received while waiting for a reply.
    buffered: VecDeque<Envelope>,
}

impl EventClient {
    /// Connect to the daemon socket.
    pub async fn connect(socket_path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            client_id: None,
            buffered: VecDeque::new(),
        })
    }

    /// Claim a stable client identity. The daemon keys its reply replay
    /// queue on this id, so a reconnecting client sees frames it missed.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Send one event and await its correlated reply.
    pub async fn request(&mut self, event: &str, data: Value) -> Result<Value, KsiError> {
        self.request_with_timeout(event, data, DEFAULT_REPLY_TIMEOUT)
            .await
    }

    /// Send one event and await its correlated reply within `timeout`.
    pub async fn request_with_timeout(
        &mut self,
        event: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, KsiError> {
        let correlation_id = new_correlation_id();
        let envelope = Envelope::with_context(
            event,
            data,
            EventContext {
                correlation_id: Some(correlation_id.clone()),
                client_id: self.client_id.clone(),
                ..Default::default()
            },
        );
        self.send(&envelope).await?;

        let wait = tokio::time::timeout(timeout, self.read_reply(&correlation_id));
        match wait.await {
            Ok(result) => result,
            Err(_) => Err(KsiError::timeout(format!(
                "no reply for {event} within {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Next streamed (non-reply) envelope, if one arrives within `timeout`.
    pub async fn next_event(&mut self, timeout: Duration) -> Option<Envelope> {
        if let Some(env) = self.buffered.pop_front() {
            return Some(env);
        }
        match tokio::time::timeout(timeout, self.read_envelope()).await {
            Ok(Ok(envelope)) => envelope,
            _ => None,
        }
    }

    /// Poll the monitor log until the terminal `completion:result` for
    /// `request_id` appears.
    ///
    /// # Arguments
    ///
    /// * `poll_interval` - Delay between `monitor:get_events` queries.
    /// * `overall` - Total wait budget before giving up with a timeout.
    pub async fn wait_for_completion(
        &mut self,
        request_id: &str,
        poll_interval: Duration,
        overall: Duration,
    ) -> Result<Value, KsiError> {
        let deadline = tokio::time::Instant::now() + overall;
        loop {
            let reply = self
                .request(
                    "monitor:get_events",
                    json!({
                        "patterns": ["completion:result"],
                        "limit": 100,
                        "reverse": true,
                    }),
                )
                .await?;
            if let Some(entries) = reply.get("events").and_then(Value::as_array) {
                for entry in entries {
                    if entry["data"]["request_id"] == request_id {
                        return Ok(entry["data"].clone());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(KsiError::timeout(format!(
                    "completion {request_id} did not finish within {}s",
                    overall.as_secs()
                )));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), KsiError> {
        let frame = envelope
            .to_frame()
            .map_err(|e| KsiError::internal_with("failed to serialise envelope", e))?;
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| KsiError::internal_with("socket write failed", e))?;
        self.writer
            .flush()
            .await
            .map_err(|e| KsiError::internal_with("socket flush failed", e))?;
        Ok(())
    }

    /// Read envelopes until the one carrying `correlation_id`, buffering
    /// everything else.
    async fn read_reply(&mut self, correlation_id: &str) -> Result<Value, KsiError> {
        loop {
            match self.read_envelope().await? {
                None => {
                    return Err(KsiError::internal("connection closed while awaiting reply"));
                }
                Some(env) => {
                    if env.context.correlation_id.as_deref() == Some(correlation_id) {
                        if is_error_value(&env.data) {
                            debug!(event = %env.event, "daemon returned error reply");
                        }
                        return Ok(env.data);
                    }
                    self.buffered.push_back(env);
                }
            }
        }
    }

    /// Read one envelope; `Ok(None)` only at EOF. Unparseable lines are
    /// logged and skipped.
    async fn read_envelope(&mut self) -> Result<Option<Envelope>, KsiError> {
        loop {
            let mut line = String::new();
            let n = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|e| KsiError::internal_with("socket read failed", e))?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Envelope>(trimmed) {
                Ok(env) => return Ok(Some(env)),
                Err(e) => {
                    warn!("skipping unparseable frame from daemon: {e}");
                }
            }
        }
    }
}

/// Check whether a daemon appears to be running by reading its PID file and
/// probing the process.
///
/// Returns `false` on any error (missing file, invalid PID, dead process).
pub fn daemon_is_running(pid_path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(pid_path) else {
        return false;
    };
    let Ok(pid) = content.trim().parse::<i32>() else {
        return false;
    };
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid, 0) == 0 }
}

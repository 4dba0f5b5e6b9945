//! Unix socket server for client↔daemon IPC.
//!
//! The daemon listens on `<run_dir>/ksi.sock`. Frames are newline-delimited
//! JSON envelopes over a persistent connection:
//!
//! 1. Client connects and sends envelopes, one per line.
//! 2. Every inbound envelope is dispatched and answered with exactly one
//!    reply envelope carrying the request's correlation id: a value, an
//!    error object, or a timeout error.
//! 3. Envelopes matching the connection's monitor subscription stream in
//!    between replies.
//!
//! Inbound envelopes are processed strictly in receive order per
//! connection. The per-connection outbound queue is bounded; on overflow
//! the frame is dropped with a `transport:event_dropped` journal entry, and
//! direct replies are parked in a replay queue keyed by the client id so a
//! reconnecting client (one that claims a stable `client_id`) sees them.
//!
//! Malformed JSON produces a `transport:bad_frame` event and leaves the
//! connection open; a write failure closes the connection with
//! `transport:disconnect`.
//!
//! ## Platform availability
//!
//! The socket server is only compiled and active on Unix platforms.

use anyhow::Result;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use ksi_core::KsiError;
use ksi_core::config::KsiConfig;
use ksi_core::envelope::{Envelope, EventContext, new_correlation_id};
use ksi_core::pattern::{EventPattern, any_match, parse_patterns};

use crate::dispatcher::EventDispatcher;
use crate::monitor::MonitorLog;
use crate::runtime_config::RuntimeLimits;

/// Roles a connection may claim with `admin:identify`.
pub const ADMIN_ROLES: &[&str] = &["monitor", "control", "metrics", "debug"];

/// Replay entries retained per absent client.
const REPLAY_DEPTH: usize = 100;

// ── Connection registry ──────────────────────────────────────────────────────

struct ClientEntry {
    nonce: u64,
    tx: tokio::sync::mpsc::Sender<String>,
    role: Option<String>,
    patterns: Vec<EventPattern>,
}

/// Shared per-connection state: outbound senders, admin roles, monitor
/// subscriptions, and the reply replay queue for absent clients.
#[derive(Default)]
pub struct ConnectionRegistry {
    clients: Mutex<HashMap<String, ClientEntry>>,
    replay: Mutex<HashMap<String, VecDeque<String>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection and drain any replayed frames for the id.
    fn register(&self, client_id: &str, nonce: u64, tx: tokio::sync::mpsc::Sender<String>) {
        let replayed = self
            .replay
            .lock()
            .unwrap()
            .remove(client_id)
            .unwrap_or_default();
        for frame in &replayed {
            let _ = tx.try_send(frame.clone());
        }
        if !replayed.is_empty() {
            debug!(client_id, count = replayed.len(), "replayed queued frames");
        }
        self.clients.lock().unwrap().insert(
            client_id.to_string(),
            ClientEntry {
                nonce,
                tx,
                role: None,
                patterns: Vec::new(),
            },
        );
    }

    /// Remove a connection, but only the one that registered under `nonce`
    /// (a reconnect under the same id may already have replaced it).
    fn deregister(&self, client_id: &str, nonce: u64) {
        let mut clients = self.clients.lock().unwrap();
        if clients.get(client_id).is_some_and(|e| e.nonce == nonce) {
            clients.remove(client_id);
        }
    }

    fn set_role(&self, client_id: &str, role: &str) {
        if let Some(entry) = self.clients.lock().unwrap().get_mut(client_id) {
            entry.role = Some(role.to_string());
        }
    }

    fn role(&self, client_id: &str) -> Option<String> {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .and_then(|e| e.role.clone())
    }

    fn set_patterns(&self, client_id: &str, patterns: Vec<EventPattern>) {
        if let Some(entry) = self.clients.lock().unwrap().get_mut(client_id) {
            entry.patterns = patterns;
        }
    }

    fn matches_subscription(&self, client_id: &str, event: &str) -> bool {
        self.clients
            .lock()
            .unwrap()
            .get(client_id)
            .map(|e| any_match(&e.patterns, event))
            .unwrap_or(false)
    }

    fn queue_replay(&self, client_id: &str, frame: String) {
        let mut replay = self.replay.lock().unwrap();
        let queue = replay.entry(client_id.to_string()).or_default();
        queue.push_back(frame);
        while queue.len() > REPLAY_DEPTH {
            queue.pop_front();
        }
    }
}

// ── Server lifecycle ─────────────────────────────────────────────────────────

/// A handle to the running socket server.
///
/// Dropping this handle removes the socket and PID files from disk.
pub struct SocketServerHandle {
    socket_path: PathBuf,
    pid_path: PathBuf,
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        for path in [&self.socket_path, &self.pid_path] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("failed to remove {}: {e}", path.display());
                } else {
                    debug!("removed {}", path.display());
                }
            }
        }
    }
}

/// Start the socket server.
///
/// # Platform Behaviour
///
/// On non-Unix platforms this function returns `Ok(None)` immediately.
pub async fn start_socket_server(
    cfg: &KsiConfig,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<MonitorLog>,
    registry: Arc<ConnectionRegistry>,
    limits: Arc<RuntimeLimits>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<Option<SocketServerHandle>> {
    #[cfg(unix)]
    {
        start_unix_socket_server(cfg, dispatcher, monitor, registry, limits, cancel)
            .await
            .map(Some)
    }

    #[cfg(not(unix))]
    {
        let _ = (cfg, dispatcher, monitor, registry, limits, cancel);
        info!("Unix socket server not available on this platform");
        Ok(None)
    }
}

#[cfg(unix)]
async fn start_unix_socket_server(
    cfg: &KsiConfig,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<MonitorLog>,
    registry: Arc<ConnectionRegistry>,
    limits: Arc<RuntimeLimits>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<SocketServerHandle> {
    use tokio::net::UnixListener;

    let socket_path = cfg.socket_path();
    let pid_path = cfg.pid_path();
    std::fs::create_dir_all(&cfg.run_dir)?;

    // A previous daemon may have crashed without cleanup.
    if socket_path.exists() {
        warn!("removing stale socket file: {}", socket_path.display());
        std::fs::remove_file(&socket_path)?;
    }

    let pid = std::process::id();
    std::fs::write(&pid_path, format!("{pid}\n"))?;
    debug!("wrote PID {pid} to {}", pid_path.display());

    let listener = UnixListener::bind(&socket_path)?;
    info!("socket server listening on {}", socket_path.display());

    let accept_path = socket_path.clone();
    tokio::spawn(async move {
        run_accept_loop(
            listener,
            dispatcher,
            monitor,
            registry,
            limits,
            cancel,
            accept_path,
        )
        .await;
    });

    Ok(SocketServerHandle {
        socket_path,
        pid_path,
    })
}

#[cfg(unix)]
async fn run_accept_loop(
    listener: tokio::net::UnixListener,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<MonitorLog>,
    registry: Arc<ConnectionRegistry>,
    limits: Arc<RuntimeLimits>,
    cancel: tokio_util::sync::CancellationToken,
    socket_path: PathBuf,
) {
    info!("socket accept loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("socket server cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let dispatcher = dispatcher.clone();
                        let monitor = monitor.clone();
                        let registry = registry.clone();
                        let limits = limits.clone();
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(
                                stream, dispatcher, monitor, registry, limits, conn_cancel,
                            )
                            .await
                            {
                                error!("connection handler error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("accept error on {}: {e}", socket_path.display());
                        // Brief pause before retrying to avoid a tight error loop
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
    info!("socket accept loop stopped");
}

#[cfg(unix)]
async fn handle_connection(
    stream: tokio::net::UnixStream,
    dispatcher: Arc<EventDispatcher>,
    monitor: Arc<MonitorLog>,
    registry: Arc<ConnectionRegistry>,
    limits: Arc<RuntimeLimits>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    // The first frame decides the client identity: a client that stamps its
    // own client_id keeps it across reconnects (and gets its replay queue
    // drained); otherwise the connection gets a fresh UUID.
    let mut first_line = String::new();
    let n = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        r = reader.read_line(&mut first_line) => r?,
    };
    if n == 0 {
        debug!("client disconnected without sending a frame");
        return Ok(());
    }
    let first_parse = serde_json::from_str::<Envelope>(first_line.trim());
    let client_id = first_parse
        .as_ref()
        .ok()
        .and_then(|e| e.context.client_id.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let nonce = rand_nonce();

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(limits.connection_queue_depth());
    registry.register(&client_id, nonce, tx.clone());
    debug!(client_id, "connection established");

    // Writer task: drains the outbound queue; a failed write tears the
    // connection down.
    let writer_cancel = cancel.clone();
    let writer_dispatcher = dispatcher.clone();
    let writer_client = client_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_half.write_all(frame.as_bytes()).await {
                warn!(client_id = %writer_client, "socket write failed: {e}");
                writer_dispatcher
                    .emit(
                        "transport:disconnect",
                        json!({ "client_id": writer_client, "reason": "write_failed" }),
                        EventContext::default(),
                    )
                    .await;
                writer_cancel.cancel();
                break;
            }
            let _ = write_half.flush().await;
        }
    });

    // Subscription pump: streams journal events matching this connection's
    // monitor subscription.
    let pump_registry = registry.clone();
    let pump_monitor = monitor.clone();
    let pump_client = client_id.clone();
    let pump_tx = tx.clone();
    let pump_cancel = cancel.clone();
    let pump_task = tokio::spawn(async move {
        let mut stream = pump_monitor.subscribe();
        loop {
            tokio::select! {
                _ = pump_cancel.cancelled() => break,
                received = stream.recv() => {
                    let envelope = match received {
                        Ok(envelope) => envelope,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(client_id = %pump_client, skipped, "subscription stream lagged");
                            continue;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    };
                    if !pump_registry.matches_subscription(&pump_client, &envelope.event) {
                        continue;
                    }
                    let Ok(frame) = envelope.to_frame() else { continue };
                    if pump_tx.try_send(frame).is_err() {
                        // Queue overflow: drop with a (non-broadcast) warning
                        // entry so the journal shows the loss.
                        pump_monitor.record_local(&Envelope::new(
                            "transport:event_dropped",
                            json!({
                                "client_id": pump_client,
                                "event": envelope.event,
                            }),
                        ));
                    }
                }
            }
        }
    });

    // Process the first frame, then everything after it, in receive order.
    match first_parse {
        Ok(envelope) => {
            process_envelope(
                envelope, &client_id, &dispatcher, &monitor, &registry, &tx,
            )
            .await;
        }
        Err(e) => {
            emit_bad_frame(&dispatcher, &client_id, &e.to_string()).await;
        }
    }

    loop {
        let mut line = String::new();
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            r = reader.read_line(&mut line) => match r {
                Ok(n) => n,
                Err(e) => {
                    warn!(client_id, "socket read failed: {e}");
                    break;
                }
            },
        };
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(trimmed) {
            Ok(envelope) => {
                process_envelope(
                    envelope, &client_id, &dispatcher, &monitor, &registry, &tx,
                )
                .await;
            }
            Err(e) => {
                emit_bad_frame(&dispatcher, &client_id, &e.to_string()).await;
            }
        }
    }

    registry.deregister(&client_id, nonce);
    pump_task.abort();
    drop(tx);
    let _ = writer_task.await;
    dispatcher
        .emit(
            "transport:disconnect",
            json!({ "client_id": client_id, "reason": "closed" }),
            EventContext::default(),
        )
        .await;
    debug!(client_id, "connection closed");
    Ok(())
}

#[cfg(unix)]
async fn emit_bad_frame(dispatcher: &Arc<EventDispatcher>, client_id: &str, error: &str) {
    warn!(client_id, "bad frame: {error}");
    dispatcher
        .emit(
            "transport:bad_frame",
            json!({ "client_id": client_id, "error": error }),
            EventContext::default(),
        )
        .await;
}

/// Dispatch one inbound envelope and send its single reply.
#[cfg(unix)]
async fn process_envelope(
    mut envelope: Envelope,
    client_id: &str,
    dispatcher: &Arc<EventDispatcher>,
    monitor: &Arc<MonitorLog>,
    registry: &Arc<ConnectionRegistry>,
    tx: &tokio::sync::mpsc::Sender<String>,
) {
    envelope.context.stamp(client_id);
    if envelope.context.correlation_id.is_none() {
        envelope.context.correlation_id = Some(new_correlation_id());
    }

    // Connection-scoped events are handled here, where the registry is;
    // they are journaled like everything else.
    let reply_value = match envelope.event.as_str() {
        "admin:identify" => {
            monitor.record(&envelope);
            handle_identify(registry, client_id, &envelope.data)
        }
        "monitor:subscribe" => {
            monitor.record(&envelope);
            handle_subscribe(registry, client_id, &envelope.data)
        }
        "monitor:unsubscribe" => {
            monitor.record(&envelope);
            registry.set_patterns(client_id, Vec::new());
            json!({ "status": "unsubscribed" })
        }
        _ => {
            let outcome = dispatcher
                .emit(
                    &envelope.event,
                    envelope.data.clone(),
                    envelope.context.clone(),
                )
                .await;
            if outcome.handler_count == 0 {
                KsiError::bad_request(format!(
                    "no handler registered for {}",
                    envelope.event
                ))
                .to_value()
            } else {
                if outcome.results.len() > 1 {
                    warn!(
                        event = %envelope.event,
                        results = outcome.results.len(),
                        "multiple handler replies; sending the first"
                    );
                }
                outcome
                    .into_single()
                    .unwrap_or_else(|| json!({ "status": "ok" }))
            }
        }
    };

    let reply = envelope.reply(reply_value);
    let Ok(frame) = reply.to_frame() else { return };
    if tx.try_send(frame.clone()).is_err() {
        // Direct replies survive overflow through the replay queue.
        registry.queue_replay(client_id, frame);
        monitor.record_local(&Envelope::new(
            "transport:event_dropped",
            json!({
                "client_id": client_id,
                "event": reply.event,
                "queued_for_replay": true,
            }),
        ));
    }
}

#[cfg(unix)]
fn handle_identify(
    registry: &Arc<ConnectionRegistry>,
    client_id: &str,
    data: &Value,
) -> Value {
    let Some(role) = data.get("role").and_then(Value::as_str) else {
        return KsiError::bad_request("role is required").to_value();
    };
    if !ADMIN_ROLES.contains(&role) {
        return KsiError::bad_request(format!(
            "role must be one of {ADMIN_ROLES:?} (got {role:?})"
        ))
        .to_value();
    }
    registry.set_role(client_id, role);
    info!(client_id, role, "connection identified");
    json!({ "status": "identified", "role": role })
}

#[cfg(unix)]
fn handle_subscribe(
    registry: &Arc<ConnectionRegistry>,
    client_id: &str,
    data: &Value,
) -> Value {
    let raw: Vec<String> = data
        .get("patterns")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if raw.is_empty() {
        return KsiError::bad_request("patterns list is required").to_value();
    }
    // The firehose is reserved for identified admin connections.
    if raw.iter().any(|p| p == "*") && registry.role(client_id).is_none() {
        return KsiError::bad_request(
            "subscription to '*' requires an admin:identify role",
        )
        .to_value();
    }
    let patterns = match parse_patterns(&raw) {
        Ok(p) => p,
        Err(e) => return e.to_value(),
    };
    registry.set_patterns(client_id, patterns);
    json!({ "status": "subscribed", "patterns": raw })
}

#[cfg(unix)]
fn rand_nonce() -> u64 {
    let id = uuid::Uuid::new_v4();
    u64::from_le_bytes(id.as_bytes()[..8].try_into().unwrap_or_default())
}

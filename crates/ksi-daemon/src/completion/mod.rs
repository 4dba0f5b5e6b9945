//! Completion subsystem: per-session serial queues, subprocess supervision,
//! progressive retries, and terminal result delivery.
//!
//! Requests are keyed by `session_id`, else `agent_id`, else their own id;
//! within a key they run strictly serially, across keys in parallel bounded
//! by the configured worker pool. A single supervisor task owns the queues
//! and the request→cancellation map; everything else talks to it over a
//! command channel.
//!
//! Every request produces exactly one terminal `completion:result` envelope
//! with `status` in `{completed, error, cancelled}`. A timed-out attempt
//! retries with the next rung of the timeout ladder and a fresh session (the
//! stuck process may have poisoned the old one); logical provider errors
//! never retry.

pub mod provider;
pub mod types;

use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ksi_core::KsiError;
use ksi_core::config::CompletionConfig;
use ksi_core::envelope::EventContext;
use ksi_core::tool_use::{extract_event_blocks, validate_event_data};

use crate::dispatcher::EventDispatcher;
use crate::runtime_config::RuntimeLimits;
use provider::CompletionProvider;
use types::{CompletionRequest, ProviderInvocation, RequestState};

enum Command {
    Submit(CompletionRequest),
    Cancel {
        request_id: String,
        reply: oneshot::Sender<Result<Value, KsiError>>,
    },
    Status {
        reply: oneshot::Sender<Value>,
    },
}

struct DoneMsg {
    request_id: String,
    key: String,
    state: RequestState,
}

#[derive(Default)]
struct KeyQueue {
    pending: VecDeque<CompletionRequest>,
    running: bool,
}

struct ActiveRun {
    token: CancellationToken,
}

/// Handle to the completion supervisor.
pub struct CompletionService {
    tx: mpsc::Sender<Command>,
}

impl CompletionService {
    /// Spawn the supervisor task and return its handle.
    pub fn start(
        provider: Arc<dyn CompletionProvider>,
        dispatcher: Arc<EventDispatcher>,
        cfg: CompletionConfig,
        limits: Arc<RuntimeLimits>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Command>(256);
        let (done_tx, mut done_rx) = mpsc::channel::<DoneMsg>(64);

        let mut supervisor = Supervisor {
            provider,
            dispatcher,
            cfg,
            limits,
            queues: HashMap::new(),
            active: HashMap::new(),
            states: HashMap::new(),
            key_of: HashMap::new(),
            running_count: 0,
            done_tx,
            cancel: cancel.clone(),
        };

        tokio::spawn(async move {
            info!("completion supervisor started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => supervisor.handle_command(cmd).await,
                        None => break,
                    },
                    done = done_rx.recv() => {
                        if let Some(done) = done {
                            supervisor.handle_done(done);
                        }
                    }
                }
            }
            info!("completion supervisor stopped");
        });

        Arc::new(Self { tx })
    }

    /// Enqueue a request.
    pub async fn submit(&self, request: CompletionRequest) -> Result<(), KsiError> {
        self.tx
            .send(Command::Submit(request))
            .await
            .map_err(|_| KsiError::internal("completion supervisor is not running"))
    }

    /// Cancel a queued or running request.
    pub async fn cancel(&self, request_id: &str) -> Result<Value, KsiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel {
                request_id: request_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| KsiError::internal("completion supervisor is not running"))?;
        rx.await
            .map_err(|_| KsiError::internal("completion supervisor dropped the reply"))?
    }

    /// Queue and request-state snapshot.
    pub async fn status(&self) -> Result<Value, KsiError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| KsiError::internal("completion supervisor is not running"))?;
        rx.await
            .map_err(|_| KsiError::internal("completion supervisor dropped the reply"))
    }
}

struct Supervisor {
    provider: Arc<dyn CompletionProvider>,
    dispatcher: Arc<EventDispatcher>,
    cfg: CompletionConfig,
    limits: Arc<RuntimeLimits>,
    queues: HashMap<String, KeyQueue>,
    active: HashMap<String, ActiveRun>,
    states: HashMap<String, RequestState>,
    key_of: HashMap<String, String>,
    running_count: usize,
    done_tx: mpsc::Sender<DoneMsg>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit(request) => {
                let key = request.queue_key();
                debug!(
                    request_id = %request.request_id,
                    key = %key,
                    "completion request queued"
                );
                self.states
                    .insert(request.request_id.clone(), RequestState::Queued);
                self.key_of.insert(request.request_id.clone(), key.clone());
                self.queues.entry(key).or_default().pending.push_back(request);
                self.pump();
            }
            Command::Cancel { request_id, reply } => {
                let result = self.cancel_request(&request_id).await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn cancel_request(&mut self, request_id: &str) -> Result<Value, KsiError> {
        if let Some(run) = self.active.get(request_id) {
            run.token.cancel();
            return Ok(json!({ "request_id": request_id, "status": "cancelling" }));
        }

        // Not running: maybe still queued.
        if let Some(key) = self.key_of.get(request_id).cloned() {
            if let Some(queue) = self.queues.get_mut(&key) {
                if let Some(pos) = queue
                    .pending
                    .iter()
                    .position(|r| r.request_id == request_id)
                {
                    let request = queue.pending.remove(pos).unwrap();
                    self.states
                        .insert(request_id.to_string(), RequestState::Cancelled);
                    emit_terminal(
                        &self.dispatcher,
                        &request,
                        RequestState::Cancelled,
                        json!({}),
                        0,
                        0,
                    )
                    .await;
                    return Ok(json!({ "request_id": request_id, "status": "cancelled" }));
                }
            }
            if let Some(state) = self.states.get(request_id) {
                return Ok(json!({ "request_id": request_id, "status": state.as_str() }));
            }
        }
        Err(KsiError::precondition(format!(
            "completion request {request_id} not found"
        )))
    }

    fn snapshot(&self) -> Value {
        let queued: usize = self.queues.values().map(|q| q.pending.len()).sum();
        let requests: serde_json::Map<String, Value> = self
            .states
            .iter()
            .map(|(id, state)| (id.clone(), json!(state.as_str())))
            .collect();
        json!({
            "running": self.running_count,
            "queued": queued,
            "keys": self.queues.len(),
            "requests": requests,
        })
    }

    fn handle_done(&mut self, done: DoneMsg) {
        self.active.remove(&done.request_id);
        self.states.insert(done.request_id.clone(), done.state);
        if let Some(queue) = self.queues.get_mut(&done.key) {
            queue.running = false;
            if queue.pending.is_empty() {
                self.queues.remove(&done.key);
            }
        }
        self.running_count = self.running_count.saturating_sub(1);

        // Keep the state map from growing without bound over a long daemon
        // life.
        if self.states.len() > 4096 {
            let terminal: Vec<String> = self
                .states
                .iter()
                .filter(|(_, s)| s.is_terminal())
                .map(|(id, _)| id.clone())
                .take(self.states.len() - 2048)
                .collect();
            for id in terminal {
                self.states.remove(&id);
                self.key_of.remove(&id);
            }
        }

        self.pump();
    }

    /// Start as many requests as the serial-per-key and global-pool rules
    /// allow.
    fn pump(&mut self) {
        let max = self.limits.completion_concurrency();
        while self.running_count < max {
            let next_key = self
                .queues
                .iter()
                .find(|(_, q)| !q.running && !q.pending.is_empty())
                .map(|(k, _)| k.clone());
            let Some(key) = next_key else { break };

            let queue = self.queues.get_mut(&key).unwrap();
            let request = queue.pending.pop_front().unwrap();
            queue.running = true;
            self.running_count += 1;

            let token = self.cancel.child_token();
            self.active.insert(
                request.request_id.clone(),
                ActiveRun {
                    token: token.clone(),
                },
            );
            self.states
                .insert(request.request_id.clone(), RequestState::Running);

            debug!(request_id = %request.request_id, key = %key, "completion starting");
            tokio::spawn(run_request(
                self.provider.clone(),
                self.dispatcher.clone(),
                self.cfg.clone(),
                request,
                key,
                token,
                self.done_tx.clone(),
            ));
        }
    }
}

/// Drive one request through its attempt ladder to a single terminal event.
async fn run_request(
    provider: Arc<dyn CompletionProvider>,
    dispatcher: Arc<EventDispatcher>,
    cfg: CompletionConfig,
    request: CompletionRequest,
    key: String,
    token: CancellationToken,
    done_tx: mpsc::Sender<DoneMsg>,
) {
    let started = Instant::now();
    let attempts = request
        .timeout_attempts
        .clone()
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| cfg.timeout_attempts.clone());
    let progress = Duration::from_secs(
        request
            .progress_timeout_secs
            .unwrap_or(cfg.progress_timeout_secs),
    );
    let total = attempts.len();
    let mut session_id = request.session_id.clone();
    let mut final_state = RequestState::Error;

    'attempts: for (attempt, timeout_secs) in attempts.iter().enumerate() {
        let invocation = ProviderInvocation {
            prompt: request.prompt.clone(),
            model: request.model.clone(),
            allowed_tools: request.allowed_tools.clone(),
            disallowed_tools: request.disallowed_tools.clone(),
            session_id: session_id.clone(),
            max_turns: request.max_turns,
            attempt_timeout: Duration::from_secs(*timeout_secs),
            progress_timeout: progress,
        };

        match provider.complete(invocation, token.clone()).await {
            Ok(response) => {
                let mut extra = json!({
                    "response": response.text,
                    "raw_stdout": response.raw_stdout,
                    "stderr": response.stderr,
                });
                if let Some(s) = &response.session_id {
                    extra["session_id"] = json!(s);
                }
                if let Some(u) = &response.usage {
                    extra["usage"] = u.clone();
                }
                if let Some(m) = &response.metadata {
                    extra["provider_metadata"] = m.clone();
                }
                if let Some(e) = &response.json_decode_error {
                    extra["json_decode_error"] = json!(e);
                }
                emit_terminal(
                    &dispatcher,
                    &request,
                    RequestState::Completed,
                    extra,
                    started.elapsed().as_millis() as u64,
                    attempt + 1,
                )
                .await;
                final_state = RequestState::Completed;
                break 'attempts;
            }
            Err(failure) if failure.is_retryable() && attempt + 1 < total => {
                warn!(
                    request_id = %request.request_id,
                    attempt = attempt + 1,
                    total,
                    next_timeout = attempts[attempt + 1],
                    "completion attempt timed out, retrying"
                );
                // The old process may have been wedged mid-conversation;
                // resume would inherit that, so retries start fresh.
                session_id = None;
                tokio::select! {
                    _ = tokio::time::sleep(cfg.retry_backoff()) => {}
                    _ = token.cancelled() => {
                        emit_terminal(
                            &dispatcher,
                            &request,
                            RequestState::Cancelled,
                            json!({}),
                            started.elapsed().as_millis() as u64,
                            attempt + 1,
                        )
                        .await;
                        final_state = RequestState::Cancelled;
                        break 'attempts;
                    }
                }
            }
            Err(failure) => {
                let state = match failure {
                    types::ProviderFailure::Cancelled => RequestState::Cancelled,
                    _ => RequestState::Error,
                };
                let extra = if state == RequestState::Error {
                    json!({
                        "error": {
                            "code": failure.error_code(),
                            "message": failure.to_string(),
                        }
                    })
                } else {
                    json!({})
                };
                emit_terminal(
                    &dispatcher,
                    &request,
                    state,
                    extra,
                    started.elapsed().as_millis() as u64,
                    attempt + 1,
                )
                .await;
                final_state = state;
                break 'attempts;
            }
        }
    }

    let _ = done_tx
        .send(DoneMsg {
            request_id: request.request_id.clone(),
            key,
            state: final_state,
        })
        .await;
}

/// Emit the single terminal `completion:result` for a request.
async fn emit_terminal(
    dispatcher: &Arc<EventDispatcher>,
    request: &CompletionRequest,
    state: RequestState,
    mut extra: Value,
    duration_ms: u64,
    attempts: usize,
) {
    let mut data = json!({
        "request_id": request.request_id,
        "status": state.as_str(),
        "duration_ms": duration_ms,
        "attempts": attempts,
    });
    if let Some(agent_id) = &request.agent_id {
        data["agent_id"] = json!(agent_id);
    }
    if let Some(client_id) = &request.client_id {
        data["client_id"] = json!(client_id);
    }
    if let Some(obj) = extra.as_object_mut() {
        for (k, v) in std::mem::take(obj) {
            data[k] = v;
        }
    }
    dispatcher
        .emit("completion:result", data, EventContext::default())
        .await;
}

/// Register the `completion:*` request handlers.
pub fn register_handlers(
    dispatcher: &Arc<EventDispatcher>,
    service: Arc<CompletionService>,
    default_model: String,
) {
    {
        let service = service.clone();
        let default_model = default_model.clone();
        dispatcher.on("completion:async", 0, move |data, ctx| {
            let service = service.clone();
            let default_model = default_model.clone();
            async move {
                let request = CompletionRequest::from_value(&data, &ctx, &default_model)?;
                let request_id = request.request_id.clone();
                service.submit(request).await?;
                Ok(Some(json!({ "request_id": request_id, "status": "queued" })))
            }
        });
    }

    {
        let service = service.clone();
        dispatcher.on("completion:cancel", 0, move |data, _ctx| {
            let service = service.clone();
            async move {
                let request_id = data
                    .get("request_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("request_id is required"))?;
                Ok(Some(service.cancel(request_id).await?))
            }
        });
    }

    dispatcher.on("completion:status", 0, move |_data, _ctx| {
        let service = service.clone();
        async move { Ok(Some(service.status().await?)) }
    });
}

/// Register the tool-use extraction tap on `completion:result`: embedded
/// event blocks in a completed response are re-emitted as first-class
/// envelopes, attributed to the agent that produced them.
pub fn register_extraction(dispatcher: &Arc<EventDispatcher>) {
    let weak: Weak<EventDispatcher> = Arc::downgrade(dispatcher);
    dispatcher.on("completion:result", -10, move |data, _ctx| {
        let weak = weak.clone();
        async move {
            if data.get("status").and_then(Value::as_str) != Some("completed") {
                return Ok(None);
            }
            let Some(response) = data.get("response").and_then(Value::as_str) else {
                return Ok(None);
            };
            let Some(dispatcher) = weak.upgrade() else {
                return Ok(None);
            };
            let agent_id = data
                .get("agent_id")
                .and_then(Value::as_str)
                .map(str::to_string);

            for block in extract_event_blocks(response) {
                if let Err(reason) = validate_event_data(&block.event, &block.data) {
                    warn!(event = %block.event, "skipping extracted event: {reason}");
                    continue;
                }
                let mut payload = if block.data.is_object() {
                    block.data.clone()
                } else {
                    json!({ "value": block.data })
                };
                payload["_extracted_from_response"] = json!(true);
                if let Some(id) = &block.tool_use_id {
                    payload["_tool_use_id"] = json!(id);
                }
                let ctx = EventContext {
                    agent_id: agent_id.clone(),
                    ..Default::default()
                };
                debug!(event = %block.event, "re-emitting extracted event");
                dispatcher.emit(&block.event, payload, ctx).await;
            }
            Ok(None)
        }
    });
}

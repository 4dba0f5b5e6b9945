//! Agent lifecycle: spawn, terminate, per-agent workers, peer messaging.
//!
//! An agent is an entity of type `agent` plus a runtime record: a bounded
//! message queue drained by a cooperative worker task, an optional provider
//! session id, a permission profile, and a sandbox directory. Spawning
//! resolves a composition profile into the agent's prompt and tool
//! permissions and writes the per-agent MCP config; terminating cancels the
//! worker, removes those files, and deletes the entity, which cascades any
//! routing rules scoped to the agent.

use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ksi_core::KsiError;
use ksi_core::config::KsiConfig;
use ksi_core::envelope::{EventContext, prefixed_id};

use crate::completion::CompletionService;
use crate::completion::types::CompletionRequest;
use crate::dispatcher::EventDispatcher;
use crate::runtime_config::RuntimeLimits;

/// Agent runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Initializing,
    Ready,
    Failed,
    Stopped,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

/// A resolved composition profile.
#[derive(Debug, Clone)]
pub struct Composition {
    pub name: String,
    pub prompt: String,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub permission_profile: String,
}

impl Composition {
    fn fallback(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prompt: "You are a cooperating agent in a multi-agent system.".to_string(),
            model: None,
            allowed_tools: Vec::new(),
            permission_profile: "standard".to_string(),
        }
    }
}

/// Resolves composition names to profiles. The daemon ships a file-backed
/// resolver; tests substitute their own.
pub trait CompositionResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Composition, KsiError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CompositionFile {
    prompt: Option<String>,
    model: Option<String>,
    allowed_tools: Vec<String>,
    permission_profile: Option<String>,
}

/// Reads `<compositions_dir>/<name>.toml`; a missing file resolves to the
/// built-in fallback profile so spawning never depends on local files.
pub struct FileCompositionResolver {
    dir: PathBuf,
}

impl FileCompositionResolver {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl CompositionResolver for FileCompositionResolver {
    fn resolve(&self, name: &str) -> Result<Composition, KsiError> {
        let path = self.dir.join(format!("{name}.toml"));
        if !path.exists() {
            return Ok(Composition::fallback(name));
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| KsiError::internal_with("failed to read composition", e))?;
        let file: CompositionFile = toml::from_str(&raw).map_err(|e| {
            KsiError::bad_request(format!("composition {name} is not valid TOML: {e}"))
        })?;
        let fallback = Composition::fallback(name);
        Ok(Composition {
            name: name.to_string(),
            prompt: file.prompt.unwrap_or(fallback.prompt),
            model: file.model,
            allowed_tools: file.allowed_tools,
            permission_profile: file.permission_profile.unwrap_or(fallback.permission_profile),
        })
    }
}

/// Messages an agent worker can receive.
#[derive(Debug)]
pub enum AgentMessage {
    /// A completion request on behalf of this agent.
    Completion(Value),
    /// A direct message from a peer (or an external client).
    Peer { from: Option<String>, payload: Value },
    /// A broadcast from another agent.
    Broadcast { from: Option<String>, payload: Value },
    CompositionUpdate(String),
    RoleNegotiation(Value),
}

struct AgentHandle {
    queue: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
    status: AgentStatus,
    composition: String,
    session_id: Arc<Mutex<Option<String>>>,
    sandbox_dir: PathBuf,
    mcp_config_path: PathBuf,
}

/// The agent registry and lifecycle operations.
pub struct AgentService {
    dispatcher: Arc<EventDispatcher>,
    completion: Arc<CompletionService>,
    resolver: Arc<dyn CompositionResolver>,
    cfg: Arc<KsiConfig>,
    limits: Arc<RuntimeLimits>,
    agents: Mutex<HashMap<String, AgentHandle>>,
    cancel: CancellationToken,
}

impl AgentService {
    pub fn new(
        dispatcher: Arc<EventDispatcher>,
        completion: Arc<CompletionService>,
        resolver: Arc<dyn CompositionResolver>,
        cfg: Arc<KsiConfig>,
        limits: Arc<RuntimeLimits>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            completion,
            resolver,
            cfg,
            limits,
            agents: Mutex::new(HashMap::new()),
            cancel,
        })
    }

    pub fn count(&self) -> usize {
        self.agents.lock().unwrap().len()
    }

    /// Spawn a new agent.
    pub async fn spawn(&self, data: &Value) -> Result<Value, KsiError> {
        let agent_id = data
            .get("agent_id")
            .or_else(|| data.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| prefixed_id("agent"));
        if self.agents.lock().unwrap().contains_key(&agent_id) {
            return Err(KsiError::precondition(format!(
                "agent {agent_id} already exists"
            )));
        }

        let composition_name = data
            .get("composition")
            .and_then(Value::as_str)
            .unwrap_or("default");
        let composition = self.resolver.resolve(composition_name)?;
        let permission_profile = data
            .get("permission_profile")
            .and_then(Value::as_str)
            .unwrap_or(&composition.permission_profile)
            .to_string();

        let sandbox_dir = self.cfg.sandbox_dir(&agent_id);
        std::fs::create_dir_all(&sandbox_dir)
            .map_err(|e| KsiError::internal_with("failed to create sandbox", e))?;

        let mcp_config_path = self.cfg.mcp_config_path(&agent_id);
        write_mcp_config(&mcp_config_path, &agent_id, &self.cfg)?;

        let mut properties = Map::new();
        properties.insert("status".into(), json!(AgentStatus::Ready.as_str()));
        properties.insert("composition".into(), json!(composition.name));
        properties.insert("permission_profile".into(), json!(permission_profile));
        properties.insert(
            "sandbox_dir".into(),
            json!(sandbox_dir.display().to_string()),
        );
        if let Some(model) = &composition.model {
            properties.insert("model".into(), json!(model));
        }

        // The entity is created through the dispatcher so the emission is
        // journaled like any other state change.
        let created = self
            .dispatcher
            .emit(
                "state:entity:create",
                json!({ "id": agent_id, "type": "agent", "properties": properties }),
                EventContext::default(),
            )
            .await;
        if let Some(first) = created.first() {
            if crate::dispatcher::reply_is_error(first) {
                let _ = std::fs::remove_file(&mcp_config_path);
                let _ = std::fs::remove_dir_all(&sandbox_dir);
                return Err(KsiError::precondition(format!(
                    "could not persist agent {agent_id}: {}",
                    first["error"]["message"].as_str().unwrap_or("store error")
                )));
            }
        }

        let (queue_tx, queue_rx) = mpsc::channel(self.limits.agent_queue_depth());
        let cancel = self.cancel.child_token();
        let session_id = Arc::new(Mutex::new(
            data.get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        ));

        let worker = AgentWorker {
            agent_id: agent_id.clone(),
            dispatcher: self.dispatcher.clone(),
            completion: self.completion.clone(),
            resolver: self.resolver.clone(),
            composition: composition.clone(),
            session_id: session_id.clone(),
        };
        tokio::spawn(worker.run(queue_rx, cancel.clone()));

        self.agents.lock().unwrap().insert(
            agent_id.clone(),
            AgentHandle {
                queue: queue_tx,
                cancel,
                status: AgentStatus::Ready,
                composition: composition.name.clone(),
                session_id,
                sandbox_dir,
                mcp_config_path,
            },
        );

        info!(agent_id, composition = %composition.name, "agent spawned");
        self.dispatcher
            .emit(
                "agent:spawned",
                json!({ "agent_id": agent_id, "composition": composition.name }),
                EventContext::default(),
            )
            .await;

        Ok(json!({
            "agent_id": agent_id,
            "status": "created",
            "composition": composition.name,
        }))
    }

    /// Terminate an agent: stop the worker, remove its files, and delete the
    /// entity (cascading scoped routing rules and relationships).
    pub async fn terminate(&self, agent_id: &str) -> Result<Value, KsiError> {
        let handle = self
            .agents
            .lock()
            .unwrap()
            .remove(agent_id)
            .ok_or_else(|| KsiError::precondition(format!("agent {agent_id} not found")))?;

        handle.cancel.cancel();
        if let Err(e) = std::fs::remove_file(&handle.mcp_config_path) {
            debug!(agent_id, "mcp config removal: {e}");
        }
        if let Err(e) = std::fs::remove_dir_all(&handle.sandbox_dir) {
            debug!(agent_id, "sandbox removal: {e}");
        }

        self.dispatcher
            .emit(
                "state:entity:delete",
                json!({ "id": agent_id }),
                EventContext::default(),
            )
            .await;
        self.dispatcher
            .emit(
                "agent:terminated",
                json!({ "agent_id": agent_id }),
                EventContext::default(),
            )
            .await;

        info!(agent_id, "agent terminated");
        Ok(json!({ "agent_id": agent_id, "status": "terminated" }))
    }

    /// Stop every agent; used during daemon shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.agents.lock().unwrap().keys().cloned().collect();
        for agent_id in ids {
            if let Err(e) = self.terminate(&agent_id).await {
                warn!(agent_id, "shutdown terminate failed: {e}");
            }
        }
    }

    pub fn list(&self) -> Value {
        let agents = self.agents.lock().unwrap();
        let mut items: Vec<Value> = agents
            .iter()
            .map(|(id, h)| {
                json!({
                    "agent_id": id,
                    "status": h.status.as_str(),
                    "composition": h.composition,
                    "session_id": h.session_id.lock().unwrap().clone(),
                })
            })
            .collect();
        items.sort_by_key(|v| v["agent_id"].as_str().unwrap_or_default().to_string());
        json!({ "count": items.len(), "agents": items })
    }

    /// Deliver a direct message to one agent's queue.
    pub fn send_message(
        &self,
        agent_id: &str,
        message: AgentMessage,
    ) -> Result<Value, KsiError> {
        let agents = self.agents.lock().unwrap();
        let Some(handle) = agents.get(agent_id) else {
            warn!(agent_id, "dropping message for absent agent");
            return Err(KsiError::precondition(format!(
                "agent {agent_id} not found"
            )));
        };
        match handle.queue.try_send(message) {
            Ok(()) => Ok(json!({ "status": "sent", "agent_id": agent_id })),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(agent_id, "agent queue full, message dropped");
                Ok(json!({
                    "status": "dropped",
                    "agent_id": agent_id,
                    "reason": "queue_full",
                }))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(KsiError::precondition(format!(
                "agent {agent_id} is stopping"
            ))),
        }
    }

    /// Enqueue a broadcast to every agent except the sender.
    pub fn broadcast(&self, from: Option<&str>, payload: &Value) -> Value {
        let agents = self.agents.lock().unwrap();
        let mut recipients = 0usize;
        for (id, handle) in agents.iter() {
            if Some(id.as_str()) == from {
                continue;
            }
            let msg = AgentMessage::Broadcast {
                from: from.map(str::to_string),
                payload: payload.clone(),
            };
            if handle.queue.try_send(msg).is_ok() {
                recipients += 1;
            } else {
                warn!(agent_id = %id, "broadcast dropped for agent");
            }
        }
        json!({ "status": "broadcast", "recipients": recipients })
    }

    /// Peers visible to a requester. Agents get the tool-use flavoured
    /// format hint; external tools get plain event JSON.
    pub fn discover_peers(&self, ctx: &EventContext) -> Value {
        let requester = ctx.agent_id.as_deref();
        let agents = self.agents.lock().unwrap();
        let peers: Vec<Value> = agents
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != requester)
            .map(|(id, h)| {
                json!({
                    "agent_id": id,
                    "status": h.status.as_str(),
                    "composition": h.composition,
                })
            })
            .collect();
        json!({
            "count": peers.len(),
            "peers": peers,
            "format": if ctx.is_agent() { "ksi_tool_use" } else { "event" },
        })
    }

    /// Resolve and apply a new composition for an agent.
    pub async fn update_composition(
        &self,
        agent_id: &str,
        composition_name: &str,
    ) -> Result<Value, KsiError> {
        let composition = self.resolver.resolve(composition_name)?;
        {
            let mut agents = self.agents.lock().unwrap();
            let handle = agents
                .get_mut(agent_id)
                .ok_or_else(|| KsiError::precondition(format!("agent {agent_id} not found")))?;
            handle.composition = composition.name.clone();
        }
        self.dispatcher
            .emit(
                "state:entity:update",
                json!({
                    "id": agent_id,
                    "properties": { "composition": composition.name },
                }),
                EventContext::default(),
            )
            .await;
        Ok(json!({
            "agent_id": agent_id,
            "status": "updated",
            "composition": composition.name,
        }))
    }

    /// Record a provider session id against an agent for resumption.
    pub fn record_session(&self, agent_id: &str, session_id: &str) {
        let agents = self.agents.lock().unwrap();
        if let Some(handle) = agents.get(agent_id) {
            *handle.session_id.lock().unwrap() = Some(session_id.to_string());
        }
    }
}

/// The per-agent cooperative worker.
struct AgentWorker {
    agent_id: String,
    dispatcher: Arc<EventDispatcher>,
    completion: Arc<CompletionService>,
    resolver: Arc<dyn CompositionResolver>,
    composition: Composition,
    session_id: Arc<Mutex<Option<String>>>,
}

impl AgentWorker {
    async fn run(mut self, mut queue: mpsc::Receiver<AgentMessage>, cancel: CancellationToken) {
        debug!(agent_id = %self.agent_id, "agent worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = queue.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }
        debug!(agent_id = %self.agent_id, "agent worker stopped");
    }

    async fn handle(&mut self, msg: AgentMessage) {
        match msg {
            AgentMessage::Completion(data) => self.run_completion(data).await,
            AgentMessage::Peer { from, payload }
            | AgentMessage::Broadcast { from, payload } => {
                self.deliver_message(from, payload).await;
            }
            AgentMessage::CompositionUpdate(name) => match self.resolver.resolve(&name) {
                Ok(composition) => {
                    info!(agent_id = %self.agent_id, composition = %name, "composition updated");
                    self.composition = composition;
                }
                Err(e) => warn!(agent_id = %self.agent_id, "composition update failed: {e}"),
            },
            AgentMessage::RoleNegotiation(payload) => {
                self.dispatcher
                    .emit(
                        "agent:role_updated",
                        json!({ "agent_id": self.agent_id, "negotiation": payload }),
                        self.agent_context(),
                    )
                    .await;
            }
        }
    }

    /// Forward a completion request, filling in the agent's session and tool
    /// permissions.
    async fn run_completion(&self, data: Value) {
        let ctx = self.agent_context();
        let mut request = match CompletionRequest::from_value(&data, &ctx, "sonnet") {
            Ok(r) => r,
            Err(e) => {
                warn!(agent_id = %self.agent_id, "invalid completion request: {e}");
                return;
            }
        };
        request.agent_id = Some(self.agent_id.clone());
        if request.session_id.is_none() {
            request.session_id = self.session_id.lock().unwrap().clone();
        }
        if request.allowed_tools.is_empty() {
            request.allowed_tools = self.composition.allowed_tools.clone();
        }
        if let Some(model) = &self.composition.model {
            if data.get("model").is_none() {
                request.model = model.clone();
            }
        }
        if let Err(e) = self.completion.submit(request).await {
            warn!(agent_id = %self.agent_id, "completion submit failed: {e}");
        }
    }

    /// A message addressed to this agent: an embedded event is emitted on
    /// the agent's behalf; anything else is surfaced for observers.
    async fn deliver_message(&self, from: Option<String>, payload: Value) {
        if let (Some(event), Some(data)) = (
            payload.get("event").and_then(Value::as_str),
            payload.get("data"),
        ) {
            self.dispatcher
                .emit(event, data.clone(), self.agent_context())
                .await;
            return;
        }
        self.dispatcher
            .emit(
                "agent:message_received",
                json!({
                    "agent_id": self.agent_id,
                    "from": from,
                    "payload": payload,
                }),
                self.agent_context(),
            )
            .await;
    }

    fn agent_context(&self) -> EventContext {
        EventContext {
            agent_id: Some(self.agent_id.clone()),
            ..Default::default()
        }
    }
}

fn write_mcp_config(path: &PathBuf, agent_id: &str, cfg: &KsiConfig) -> Result<(), KsiError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| KsiError::internal_with("failed to create mcp config dir", e))?;
    }
    let config = json!({
        "agent_id": agent_id,
        "socket": cfg.socket_path().display().to_string(),
    });
    std::fs::write(path, serde_json::to_string_pretty(&config).unwrap_or_default())
        .map_err(|e| KsiError::internal_with("failed to write mcp config", e))
}

/// Register the `agent:*` handlers plus the session-capture tap on
/// `completion:result`.
pub fn register_handlers(dispatcher: &Arc<EventDispatcher>, service: Arc<AgentService>) {
    {
        let service = service.clone();
        dispatcher.on("agent:spawn", 0, move |data, _ctx| {
            let service = service.clone();
            async move { Ok(Some(service.spawn(&data).await?)) }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:terminate", 0, move |data, _ctx| {
            let service = service.clone();
            async move {
                let agent_id = data
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("agent_id is required"))?;
                Ok(Some(service.terminate(agent_id).await?))
            }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:list", 0, move |_data, _ctx| {
            let service = service.clone();
            async move { Ok(Some(service.list())) }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:send_message", 0, move |data, ctx| {
            let service = service.clone();
            async move {
                let agent_id = data
                    .get("agent_id")
                    .or_else(|| data.get("to"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("agent_id is required"))?;
                let payload = data
                    .get("message")
                    .or_else(|| data.get("payload"))
                    .cloned()
                    .ok_or_else(|| KsiError::bad_request("message is required"))?;
                let message = match payload.get("type").and_then(Value::as_str) {
                    Some("composition_update") => {
                        let name = payload
                            .get("composition")
                            .and_then(Value::as_str)
                            .ok_or_else(|| KsiError::bad_request("composition is required"))?;
                        AgentMessage::CompositionUpdate(name.to_string())
                    }
                    Some("role_negotiation") => AgentMessage::RoleNegotiation(payload),
                    _ if payload.get("prompt").is_some() => AgentMessage::Completion(payload),
                    _ => AgentMessage::Peer {
                        from: ctx.agent_id.clone(),
                        payload,
                    },
                };
                Ok(Some(service.send_message(agent_id, message)?))
            }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:broadcast", 0, move |data, ctx| {
            let service = service.clone();
            async move {
                let payload = data
                    .get("message")
                    .or_else(|| data.get("payload"))
                    .cloned()
                    .ok_or_else(|| KsiError::bad_request("message is required"))?;
                Ok(Some(service.broadcast(ctx.agent_id.as_deref(), &payload)))
            }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:discover_peers", 0, move |_data, ctx| {
            let service = service.clone();
            async move { Ok(Some(service.discover_peers(&ctx))) }
        });
    }
    {
        let service = service.clone();
        dispatcher.on("agent:update_composition", 0, move |data, _ctx| {
            let service = service.clone();
            async move {
                let agent_id = data
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("agent_id is required"))?;
                let composition = data
                    .get("composition")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("composition is required"))?;
                Ok(Some(
                    service.update_composition(agent_id, composition).await?,
                ))
            }
        });
    }

    // Capture provider sessions so the next completion for the agent can
    // resume the conversation.
    {
        let service = service.clone();
        dispatcher.on("completion:result", 5, move |data, _ctx| {
            let service = service.clone();
            async move {
                if data.get("status").and_then(Value::as_str) == Some("completed") {
                    if let (Some(agent_id), Some(session_id)) = (
                        data.get("agent_id").and_then(Value::as_str),
                        data.get("session_id").and_then(Value::as_str),
                    ) {
                        service.record_session(agent_id, session_id);
                    }
                }
                Ok(None)
            }
        });
    }
}

//! System surface: health, shutdown, and the startup context event.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::AgentService;
use crate::completion::CompletionService;
use crate::dispatcher::EventDispatcher;

/// Register `system:health`, `system:shutdown`, and the `system:context`
/// observer.
pub fn register_handlers(
    dispatcher: &Arc<EventDispatcher>,
    started: Instant,
    cancel: CancellationToken,
    agents: Arc<AgentService>,
    completion: Arc<CompletionService>,
) {
    {
        let agents = agents.clone();
        let completion = completion.clone();
        dispatcher.on("system:health", 0, move |_data, _ctx| {
            let agents = agents.clone();
            let completion = completion.clone();
            async move {
                let queue = completion.status().await.unwrap_or_else(|_| json!({}));
                Ok(Some(json!({
                    "status": "healthy",
                    "version": env!("CARGO_PKG_VERSION"),
                    "uptime_s": started.elapsed().as_secs(),
                    "active_agents": agents.count(),
                    "completions_running": queue.get("running").cloned().unwrap_or(json!(0)),
                    "completions_queued": queue.get("queued").cloned().unwrap_or(json!(0)),
                })))
            }
        });
    }

    dispatcher.on("system:shutdown", 0, move |_data, _ctx| {
        let cancel = cancel.clone();
        async move {
            info!("shutdown requested over the event surface");
            cancel.cancel();
            Ok(Some(json!({ "status": "shutting_down" })))
        }
    });

    // Late-bound handlers hook startup through this event; the daemon also
    // emits it so the journal marks the moment the fabric came up.
    dispatcher.on("system:context", 0, move |_data: Value, _ctx| async move {
        info!("event fabric context established");
        Ok(None)
    });
}

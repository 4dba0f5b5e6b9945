//! Daemon assembly and main loop.
//!
//! Construction order follows the dependency graph: monitor journal, then
//! the dispatcher, then the store and every service that registers handlers
//! against the dispatcher, then the socket transport, then the background
//! sweeps. Shutdown reverses it: stop accepting, stop agents, let the
//! socket handle clean its files on drop.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use ksi_core::config::KsiConfig;
use ksi_core::envelope::EventContext;

use crate::agent::{AgentService, CompositionResolver, FileCompositionResolver};
use crate::completion::provider::{CliProvider, CompletionProvider};
use crate::completion::{self, CompletionService};
use crate::dispatcher::EventDispatcher;
use crate::monitor::{self, MonitorLog};
use crate::routing::{self, RoutingService};
use crate::runtime_config::{self, RuntimeLimits};
use crate::state::{StateStore, handlers as state_handlers};
use crate::system;

use super::socket::{ConnectionRegistry, start_socket_server};

/// The daemon, configured but not yet running.
pub struct Daemon {
    cfg: KsiConfig,
    provider: Option<Arc<dyn CompletionProvider>>,
    resolver: Option<Arc<dyn CompositionResolver>>,
}

impl Daemon {
    pub fn new(cfg: KsiConfig) -> Self {
        Self {
            cfg,
            provider: None,
            resolver: None,
        }
    }

    /// Substitute the completion provider (tests use stubs here).
    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Substitute the composition resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn CompositionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Run until the cancellation token fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let started = Instant::now();
        let cfg = Arc::new(self.cfg);
        std::fs::create_dir_all(&cfg.home_dir)
            .with_context(|| format!("failed to create {}", cfg.home_dir.display()))?;

        let limits = RuntimeLimits::new(cfg.limits.clone());
        let log_monitor = MonitorLog::new(cfg.monitor.clone(), Some(cfg.log_path.clone()));
        let dispatcher = EventDispatcher::new(log_monitor.clone(), limits.clone());

        let store = Arc::new(StateStore::open(&cfg.db_path).map_err(|e| anyhow::anyhow!("{e}"))?);
        state_handlers::register_handlers(&dispatcher, store.clone(), limits.clone());
        monitor::register_handlers(&dispatcher, log_monitor.clone());

        let routing = RoutingService::new(store.clone());
        routing
            .load_from_store()
            .map_err(|e| anyhow::anyhow!("failed to restore routing rules: {e}"))?;
        routing::register_handlers(&dispatcher, routing.clone());

        let provider: Arc<dyn CompletionProvider> = self.provider.unwrap_or_else(|| {
            Arc::new(CliProvider::new(
                cfg.completion.claude_bin.clone(),
                Some(cfg.home_dir.clone()),
            ))
        });
        let completion_service = CompletionService::start(
            provider,
            dispatcher.clone(),
            cfg.completion.clone(),
            limits.clone(),
            cancel.child_token(),
        );
        completion::register_handlers(
            &dispatcher,
            completion_service.clone(),
            cfg.completion.default_model.clone(),
        );
        completion::register_extraction(&dispatcher);

        let resolver: Arc<dyn CompositionResolver> = self.resolver.unwrap_or_else(|| {
            Arc::new(FileCompositionResolver::new(cfg.compositions_dir()))
        });
        let agents = AgentService::new(
            dispatcher.clone(),
            completion_service.clone(),
            resolver,
            cfg.clone(),
            limits.clone(),
            cancel.child_token(),
        );
        crate::agent::register_handlers(&dispatcher, agents.clone());

        runtime_config::register_handlers(&dispatcher, limits.clone());
        system::register_handlers(
            &dispatcher,
            started,
            cancel.clone(),
            agents.clone(),
            completion_service.clone(),
        );

        let registry = ConnectionRegistry::new();
        let socket_handle = start_socket_server(
            &cfg,
            dispatcher.clone(),
            log_monitor.clone(),
            registry,
            limits.clone(),
            cancel.clone(),
        )
        .await
        .context("failed to start socket server")?;

        spawn_sweeps(
            routing.clone(),
            log_monitor.clone(),
            cancel.clone(),
        );

        dispatcher
            .emit(
                "system:context",
                json!({ "version": env!("CARGO_PKG_VERSION") }),
                EventContext::default(),
            )
            .await;
        info!("daemon ready on {}", cfg.socket_path().display());

        cancel.cancelled().await;

        info!("daemon shutting down");
        agents.shutdown_all().await;
        drop(socket_handle);
        info!("daemon stopped");
        Ok(())
    }
}

/// Background maintenance: routing TTL expiry every second, monitor age
/// trimming every minute.
fn spawn_sweeps(
    routing: Arc<RoutingService>,
    monitor: Arc<MonitorLog>,
    cancel: CancellationToken,
) {
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let expired = routing.expire_sweep();
                        if expired > 0 {
                            debug!(expired, "routing expiry sweep");
                        }
                    }
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    monitor.trim_expired();
                }
            }
        }
    });
}

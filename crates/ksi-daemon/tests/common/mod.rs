//! Shared fixtures for daemon integration tests.

#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use ksi_core::config::{KsiConfig, LimitsConfig, MonitorConfig};
use ksi_core::pattern::parse_patterns;
use ksi_daemon::dispatcher::EventDispatcher;
use ksi_daemon::monitor::MonitorLog;
use ksi_daemon::routing::{self, RoutingService};
use ksi_daemon::runtime_config::RuntimeLimits;
use ksi_daemon::state::{StateStore, handlers as state_handlers};

/// An in-process event fabric: dispatcher, journal, store, routing.
pub struct TestFabric {
    pub dispatcher: Arc<EventDispatcher>,
    pub monitor: Arc<MonitorLog>,
    pub store: Arc<StateStore>,
    pub routing: Arc<RoutingService>,
    pub limits: Arc<RuntimeLimits>,
}

pub fn fabric() -> TestFabric {
    // Honors KSI_LOG so failing tests can be rerun with tracing on.
    ksi_core::logging::init();

    let limits = RuntimeLimits::new(LimitsConfig::default());
    let monitor = MonitorLog::new(MonitorConfig::default(), None);
    let dispatcher = EventDispatcher::new(monitor.clone(), limits.clone());

    let store = Arc::new(StateStore::open_in_memory().unwrap());
    state_handlers::register_handlers(&dispatcher, store.clone(), limits.clone());
    ksi_daemon::monitor::register_handlers(&dispatcher, monitor.clone());

    let routing = RoutingService::new(store.clone());
    routing::register_handlers(&dispatcher, routing.clone());

    TestFabric {
        dispatcher,
        monitor,
        store,
        routing,
        limits,
    }
}

/// Journal entries for one event pattern.
pub fn journal(monitor: &MonitorLog, pattern: &str) -> Vec<Value> {
    let patterns = parse_patterns(&[pattern.to_string()]).unwrap();
    monitor.get_events(&patterns, None, None, 10_000, false)
}

/// Poll the journal until a predicate matches one entry, or panic after the
/// timeout.
pub async fn wait_for_entry(
    monitor: &MonitorLog,
    pattern: &str,
    timeout: Duration,
    predicate: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(entry) = journal(monitor, pattern).into_iter().find(&predicate) {
            return entry;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("no {pattern} entry matched within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// A daemon configuration rooted in a temp directory.
pub fn test_config(home: &std::path::Path) -> KsiConfig {
    KsiConfig {
        home_dir: home.to_path_buf(),
        run_dir: home.join("run"),
        db_path: home.join("ksi.db"),
        log_path: home.join("events.jsonl"),
        monitor: MonitorConfig::default(),
        limits: LimitsConfig::default(),
        completion: ksi_core::config::CompletionConfig {
            retry_backoff_secs: 0,
            ..Default::default()
        },
    }
}

//! Runtime-tunable resource limits and the `runtime:config:*` event surface.
//!
//! Limits start from [`LimitsConfig`] and may be overridden at runtime
//! through `runtime:config:set`. Overrides are validated against a fixed key
//! schema and apply immediately: every consumer reads the live value at the
//! point of use rather than caching it.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

use ksi_core::KsiError;
use ksi_core::config::LimitsConfig;

use crate::dispatcher::EventDispatcher;

/// The runtime-configurable keys, with a short description each.
pub const CONFIG_KEYS: &[(&str, &str)] = &[
    (
        "connection_queue_depth",
        "Per-connection outbound queue depth",
    ),
    ("agent_queue_depth", "Per-agent message queue depth"),
    ("max_route_depth", "Maximum transformer re-emission depth"),
    ("max_traversal_depth", "Maximum graph traversal depth"),
    (
        "correlation_timeout_ms",
        "Default wait for a correlated reply (ms)",
    ),
    (
        "completion_poll_interval_ms",
        "Completion polling interval (ms)",
    ),
    (
        "completion_concurrency",
        "Global completion worker pool size",
    ),
];

/// Live resource limits shared across the daemon.
#[derive(Debug)]
pub struct RuntimeLimits {
    defaults: LimitsConfig,
    overrides: RwLock<HashMap<String, u64>>,
}

impl RuntimeLimits {
    pub fn new(defaults: LimitsConfig) -> Arc<Self> {
        Arc::new(Self {
            defaults,
            overrides: RwLock::new(HashMap::new()),
        })
    }

    fn default_for(&self, key: &str) -> Option<u64> {
        let d = &self.defaults;
        match key {
            "connection_queue_depth" => Some(d.connection_queue_depth),
            "agent_queue_depth" => Some(d.agent_queue_depth),
            "max_route_depth" => Some(d.max_route_depth),
            "max_traversal_depth" => Some(d.max_traversal_depth),
            "correlation_timeout_ms" => Some(d.correlation_timeout_ms),
            "completion_poll_interval_ms" => Some(d.completion_poll_interval_ms),
            "completion_concurrency" => Some(d.completion_concurrency),
            _ => None,
        }
    }

    /// Current effective value for a known key.
    pub fn get(&self, key: &str) -> Option<u64> {
        if let Some(v) = self.overrides.read().unwrap().get(key) {
            return Some(*v);
        }
        self.default_for(key)
    }

    /// Set a runtime override. Unknown keys and zero values are rejected.
    pub fn set(&self, key: &str, value: &Value) -> Result<u64, KsiError> {
        if self.default_for(key).is_none() {
            return Err(KsiError::bad_request(format!("unknown config key: {key}")));
        }
        let parsed = value
            .as_u64()
            .filter(|v| *v > 0)
            .ok_or_else(|| {
                KsiError::bad_request(format!("config {key} requires a positive integer"))
            })?;
        self.overrides
            .write()
            .unwrap()
            .insert(key.to_string(), parsed);
        info!(key, value = parsed, "runtime config updated");
        Ok(parsed)
    }

    /// Drop one override, or all of them.
    pub fn reset(&self, key: Option<&str>) -> Result<(), KsiError> {
        match key {
            Some(k) => {
                if self.default_for(k).is_none() {
                    return Err(KsiError::bad_request(format!("unknown config key: {k}")));
                }
                self.overrides.write().unwrap().remove(k);
            }
            None => self.overrides.write().unwrap().clear(),
        }
        Ok(())
    }

    /// All keys with effective value and source.
    pub fn snapshot(&self) -> Value {
        let overrides = self.overrides.read().unwrap();
        let mut out = serde_json::Map::new();
        for (key, _) in CONFIG_KEYS {
            let source = if overrides.contains_key(*key) {
                "runtime"
            } else {
                "default"
            };
            out.insert(
                (*key).to_string(),
                json!({ "value": self.get(key), "source": source }),
            );
        }
        Value::Object(out)
    }

    pub fn connection_queue_depth(&self) -> usize {
        self.get("connection_queue_depth").unwrap_or(256) as usize
    }

    pub fn agent_queue_depth(&self) -> usize {
        self.get("agent_queue_depth").unwrap_or(64) as usize
    }

    pub fn max_route_depth(&self) -> u32 {
        self.get("max_route_depth").unwrap_or(8) as u32
    }

    pub fn max_traversal_depth(&self) -> u32 {
        self.get("max_traversal_depth").unwrap_or(5) as u32
    }

    pub fn correlation_timeout_ms(&self) -> u64 {
        self.get("correlation_timeout_ms").unwrap_or(30_000)
    }

    pub fn completion_concurrency(&self) -> usize {
        self.get("completion_concurrency").unwrap_or(2) as usize
    }
}

/// Register the `runtime:config:{get,set,reset,query}` handlers.
pub fn register_handlers(dispatcher: &Arc<EventDispatcher>, limits: Arc<RuntimeLimits>) {
    {
        let limits = limits.clone();
        dispatcher.on("runtime:config:get", 0, move |data, _ctx| {
            let limits = limits.clone();
            async move {
                match data.get("key").and_then(Value::as_str) {
                    Some(key) => {
                        let value = limits
                            .get(key)
                            .ok_or_else(|| {
                                KsiError::bad_request(format!("unknown config key: {key}"))
                            })?;
                        let source = if limits.snapshot()[key]["source"] == "runtime" {
                            "runtime"
                        } else {
                            "default"
                        };
                        Ok(Some(json!({ "key": key, "value": value, "source": source })))
                    }
                    None => Ok(Some(json!({ "runtime_config": limits.snapshot() }))),
                }
            }
        });
    }

    {
        let limits = limits.clone();
        dispatcher.on("runtime:config:set", 0, move |data, _ctx| {
            let limits = limits.clone();
            async move {
                let key = data
                    .get("key")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("key is required"))?;
                let value = data
                    .get("value")
                    .ok_or_else(|| KsiError::bad_request("value is required"))?;
                let applied = limits.set(key, value)?;
                Ok(Some(json!({
                    "status": "updated",
                    "key": key,
                    "value": applied,
                })))
            }
        });
    }

    {
        let limits = limits.clone();
        dispatcher.on("runtime:config:reset", 0, move |data, _ctx| {
            let limits = limits.clone();
            async move {
                let key = data.get("key").and_then(Value::as_str);
                limits.reset(key)?;
                Ok(Some(match key {
                    Some(k) => json!({ "status": "reset", "key": k }),
                    None => json!({ "status": "reset" }),
                }))
            }
        });
    }

    dispatcher.on("runtime:config:query", 0, move |data, _ctx| {
        let limits = limits.clone();
        async move {
            match data.get("key").and_then(Value::as_str) {
                Some(key) => {
                    let description = CONFIG_KEYS
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, d)| *d)
                        .ok_or_else(|| {
                            KsiError::bad_request(format!("unknown config key: {key}"))
                        })?;
                    Ok(Some(json!({
                        "key": key,
                        "description": description,
                        "value": limits.get(key),
                    })))
                }
                None => {
                    let keys: Vec<Value> = CONFIG_KEYS
                        .iter()
                        .map(|(k, d)| json!({ "key": k, "description": d }))
                        .collect();
                    Ok(Some(json!({ "keys": keys })))
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_overrides() {
        let limits = RuntimeLimits::new(LimitsConfig::default());
        assert_eq!(limits.max_route_depth(), 8);
        assert_eq!(limits.get("max_route_depth"), Some(8));

        limits.set("max_route_depth", &json!(3)).unwrap();
        assert_eq!(limits.max_route_depth(), 3);
        assert_eq!(limits.snapshot()["max_route_depth"]["source"], "runtime");

        limits.reset(Some("max_route_depth")).unwrap();
        assert_eq!(limits.max_route_depth(), 8);
        assert_eq!(limits.snapshot()["max_route_depth"]["source"], "default");
    }

    #[test]
    fn test_validation() {
        let limits = RuntimeLimits::new(LimitsConfig::default());
        assert!(limits.set("no_such_key", &json!(1)).is_err());
        assert!(limits.set("max_route_depth", &json!(0)).is_err());
        assert!(limits.set("max_route_depth", &json!("three")).is_err());
        assert!(limits.reset(Some("no_such_key")).is_err());
    }

    #[test]
    fn test_reset_all() {
        let limits = RuntimeLimits::new(LimitsConfig::default());
        limits.set("agent_queue_depth", &json!(7)).unwrap();
        limits.set("completion_concurrency", &json!(9)).unwrap();
        limits.reset(None).unwrap();
        assert_eq!(limits.agent_queue_depth(), 64);
        assert_eq!(limits.completion_concurrency(), 2);
    }
}

//! Append-only monitor journal.
//!
//! Every emission in the daemon is recorded here before its handlers run, so
//! the journal is the authoritative record for completion polling and test
//! assertions. Queries are served from a bounded in-memory window; a JSONL
//! file sink mirrors the window durably, best-effort, with size rotation.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::debug;

use ksi_core::config::MonitorConfig;
use ksi_core::envelope::Envelope;
use ksi_core::pattern::{EventPattern, any_match};

/// Broadcast capacity for live subscribers; laggards drop frames.
const STREAM_CAPACITY: usize = 1024;

/// One journal entry.
#[derive(Debug, Clone)]
pub struct MonitorEntry {
    pub timestamp: DateTime<Utc>,
    pub event_name: String,
    pub data: Value,
    pub client_id: Option<String>,
    pub agent_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl MonitorEntry {
    fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            timestamp: Utc::now(),
            event_name: envelope.event.clone(),
            data: envelope.data.clone(),
            client_id: envelope.context.client_id.clone(),
            agent_id: envelope.context.agent_id.clone(),
            correlation_id: envelope.context.correlation_id.clone(),
        }
    }

    fn to_value(&self) -> Value {
        let mut obj = json!({
            "timestamp": self.timestamp.to_rfc3339(),
            "event_name": self.event_name,
            "data": self.data,
        });
        if let Some(v) = &self.client_id {
            obj["client_id"] = json!(v);
        }
        if let Some(v) = &self.agent_id {
            obj["agent_id"] = json!(v);
        }
        if let Some(v) = &self.correlation_id {
            obj["correlation_id"] = json!(v);
        }
        obj
    }
}

#[derive(Default)]
struct Window {
    entries: VecDeque<Arc<MonitorEntry>>,
    total_recorded: u64,
    per_event: HashMap<String, u64>,
}

/// The monitor journal.
pub struct MonitorLog {
    cfg: MonitorConfig,
    window: Mutex<Window>,
    sink_path: Option<PathBuf>,
    stream: broadcast::Sender<Arc<Envelope>>,
}

impl MonitorLog {
    pub fn new(cfg: MonitorConfig, sink_path: Option<PathBuf>) -> Arc<Self> {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Arc::new(Self {
            cfg,
            window: Mutex::new(Window::default()),
            sink_path,
            stream,
        })
    }

    /// Record an emission and fan it out to live subscribers.
    pub fn record(&self, envelope: &Envelope) {
        self.record_local(envelope);
        let _ = self.stream.send(Arc::new(envelope.clone()));
    }

    /// Record without broadcasting. Used for transport bookkeeping events
    /// whose broadcast would feed back into the very queue that overflowed.
    pub fn record_local(&self, envelope: &Envelope) {
        let entry = Arc::new(MonitorEntry::from_envelope(envelope));
        {
            let mut window = self.window.lock().unwrap();
            window.entries.push_back(entry.clone());
            window.total_recorded += 1;
            *window.per_event.entry(entry.event_name.clone()).or_insert(0) += 1;
            while window.entries.len() > self.cfg.max_entries {
                window.entries.pop_front();
            }
        }
        self.append_to_sink(&entry);
    }

    /// Live stream of every broadcast emission.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.stream.subscribe()
    }

    /// Query the in-memory window.
    ///
    /// Empty `patterns` matches every event. `since`/`until` are inclusive
    /// bounds; `reverse` returns newest first; `limit` applies after
    /// ordering.
    pub fn get_events(
        &self,
        patterns: &[EventPattern],
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
        reverse: bool,
    ) -> Vec<Value> {
        let window = self.window.lock().unwrap();
        let iter = window.entries.iter().filter(|e| {
            (patterns.is_empty() || any_match(patterns, &e.event_name))
                && since.is_none_or(|s| e.timestamp >= s)
                && until.is_none_or(|u| e.timestamp <= u)
        });
        let mut selected: Vec<&Arc<MonitorEntry>> = iter.collect();
        if reverse {
            selected.reverse();
        }
        selected
            .into_iter()
            .take(limit)
            .map(|e| e.to_value())
            .collect()
    }

    /// Journal statistics.
    pub fn stats(&self) -> Value {
        let window = self.window.lock().unwrap();
        let oldest = window.entries.front().map(|e| e.timestamp.to_rfc3339());
        let newest = window.entries.back().map(|e| e.timestamp.to_rfc3339());
        json!({
            "total_recorded": window.total_recorded,
            "window_entries": window.entries.len(),
            "per_event": window.per_event,
            "oldest": oldest,
            "newest": newest,
        })
    }

    /// Drop entries older than the configured age. Returns the trim count.
    pub fn trim_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.cfg.max_age_secs as i64);
        let mut window = self.window.lock().unwrap();
        let before = window.entries.len();
        while window
            .entries
            .front()
            .is_some_and(|e| e.timestamp < cutoff)
        {
            window.entries.pop_front();
        }
        let trimmed = before - window.entries.len();
        if trimmed > 0 {
            debug!(trimmed, "monitor window trimmed by age");
        }
        trimmed
    }

    /// This sink is intentionally fail-open: any I/O error is swallowed.
    fn append_to_sink(&self, entry: &MonitorEntry) {
        let Some(path) = &self.sink_path else {
            return;
        };
        let _ = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            rotate_if_needed(path, self.cfg.file_max_bytes, self.cfg.file_max_files)?;
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            file.write_all(entry.to_value().to_string().as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
            Ok(())
        })();
    }
}

fn rotated_path(path: &Path, idx: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), idx))
}

fn rotate_if_needed(path: &Path, max_bytes: u64, max_files: u32) -> std::io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    if fs::metadata(path)?.len() < max_bytes {
        return Ok(());
    }
    for idx in (1..max_files).rev() {
        let src = rotated_path(path, idx);
        let dst = rotated_path(path, idx + 1);
        if src.exists() {
            let _ = fs::rename(&src, &dst);
        }
    }
    let _ = fs::rename(path, rotated_path(path, 1));
    Ok(())
}

/// Register the monitor query handlers. Subscription management lives in
/// the transport, where the per-connection state is.
pub fn register_handlers(
    dispatcher: &std::sync::Arc<crate::dispatcher::EventDispatcher>,
    monitor: Arc<MonitorLog>,
) {
    use ksi_core::KsiError;
    use ksi_core::pattern::parse_patterns;

    {
        let monitor = monitor.clone();
        dispatcher.on("monitor:get_events", 0, move |data, _ctx| {
            let monitor = monitor.clone();
            async move {
                let raw_patterns: Vec<String> = data
                    .get("patterns")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let patterns = parse_patterns(&raw_patterns)
                    .map_err(|e| KsiError::bad_request(e.to_string()))?;
                let since = parse_time_bound(data.get("since"));
                let until = parse_time_bound(data.get("until"));
                let limit = data
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(100) as usize;
                let reverse = data
                    .get("reverse")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let events = monitor.get_events(&patterns, since, until, limit, reverse);
                Ok(Some(json!({ "count": events.len(), "events": events })))
            }
        });
    }

    dispatcher.on("monitor:get_stats", 0, move |_data, _ctx| {
        let monitor = monitor.clone();
        async move { Ok(Some(monitor.stats())) }
    });
}

/// Parse a `since`/`until` request field: RFC 3339 string or epoch seconds.
pub fn parse_time_bound(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let epoch = n.as_f64()?;
            DateTime::from_timestamp_millis((epoch * 1000.0) as i64)
        }
        _ => None,
    }
}

//! Event dispatcher: name→handler tables, ordered emission, correlation.
//!
//! Handlers register against a literal event name or a suffix-glob pattern.
//! For one emission, every matching handler runs in priority order (higher
//! first, ties by registration order); side effects from one handler are
//! visible to the next. A handler that fails is isolated: its error becomes a
//! `{code, message, details?}` object in the result list and the remaining
//! handlers still run.
//!
//! Every emission is appended to the monitor journal *before* handlers run,
//! so the journal always contains the envelope by the time a caller observes
//! any handler result.
//!
//! Request/response uses pending-correlation futures rather than exceptions:
//! [`EventDispatcher::request`] registers a oneshot under the correlation id
//! and exactly one of result, error, or timeout resolves it.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use ksi_core::envelope::{Envelope, EventContext, new_correlation_id, now_iso};
use ksi_core::error::is_error_value;
use ksi_core::pattern::EventPattern;
use ksi_core::KsiError;

use crate::monitor::MonitorLog;
use crate::runtime_config::RuntimeLimits;

/// Boxed handler future; `Ok(None)` means the handler had nothing to reply.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Value>, KsiError>> + Send>>;

type BoxedHandler = Arc<dyn Fn(Value, EventContext) -> HandlerFuture + Send + Sync>;

/// Opaque id returned by [`EventDispatcher::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Registration {
    id: u64,
    pattern: EventPattern,
    priority: i32,
    handler: BoxedHandler,
}

#[derive(Default)]
struct Tables {
    literal: HashMap<String, Vec<Arc<Registration>>>,
    wildcard: Vec<Arc<Registration>>,
}

/// Outcome of one emission.
#[derive(Debug)]
pub struct EmitResult {
    /// How many handlers matched (including ones that returned nothing).
    pub handler_count: usize,
    /// Non-void handler returns, in handler order. Failed handlers appear
    /// as error objects.
    pub results: Vec<Value>,
}

impl EmitResult {
    pub fn first(&self) -> Option<&Value> {
        self.results.first()
    }

    pub fn into_single(mut self) -> Option<Value> {
        if self.results.is_empty() {
            None
        } else {
            Some(self.results.swap_remove(0))
        }
    }
}

type PendingReply = oneshot::Sender<Result<Value, KsiError>>;

type TapFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type BoxedTap = Arc<dyn Fn(String, Value, EventContext) -> TapFuture + Send + Sync>;

/// The dispatcher. One per daemon; shared by `Arc`.
pub struct EventDispatcher {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<String, PendingReply>>,
    monitor: Arc<MonitorLog>,
    limits: Arc<RuntimeLimits>,
    /// Post-dispatch hook; the routing core hangs its transformer
    /// application off this so it sees the concrete event name.
    tap: RwLock<Option<BoxedTap>>,
}

impl EventDispatcher {
    pub fn new(monitor: Arc<MonitorLog>, limits: Arc<RuntimeLimits>) -> Arc<Self> {
        Arc::new(Self {
            tables: RwLock::new(Tables::default()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            monitor,
            limits,
            tap: RwLock::new(None),
        })
    }

    /// Install the post-dispatch tap. The tap runs after the handlers of
    /// every emission (the depth-abort path excluded) and may re-emit.
    pub fn set_tap<F, Fut>(&self, tap: F)
    where
        F: Fn(String, Value, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedTap = Arc::new(move |event, data, ctx| Box::pin(tap(event, data, ctx)));
        *self.tap.write().unwrap() = Some(boxed);
    }

    pub fn monitor(&self) -> &Arc<MonitorLog> {
        &self.monitor
    }

    pub fn limits(&self) -> &Arc<RuntimeLimits> {
        &self.limits
    }

    /// Register a handler. Panics only on an invalid pattern, which is a
    /// programming error for in-daemon registrations; use [`Self::try_on`]
    /// for patterns arriving from outside.
    pub fn on<F, Fut>(&self, pattern: &str, priority: i32, handler: F) -> SubscriptionId
    where
        F: Fn(Value, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, KsiError>> + Send + 'static,
    {
        self.try_on(pattern, priority, handler)
            .unwrap_or_else(|e| panic!("invalid subscription pattern {pattern:?}: {e}"))
    }

    /// Register a handler for a pattern that may be invalid.
    pub fn try_on<F, Fut>(
        &self,
        pattern: &str,
        priority: i32,
        handler: F,
    ) -> Result<SubscriptionId, KsiError>
    where
        F: Fn(Value, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, KsiError>> + Send + 'static,
    {
        let compiled = EventPattern::parse(pattern)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let boxed: BoxedHandler = Arc::new(move |data, ctx| Box::pin(handler(data, ctx)));
        let registration = Arc::new(Registration {
            id,
            pattern: compiled,
            priority,
            handler: boxed,
        });

        let mut tables = self.tables.write().unwrap();
        match &registration.pattern {
            EventPattern::Literal(name) => {
                tables
                    .literal
                    .entry(name.clone())
                    .or_default()
                    .push(registration);
            }
            EventPattern::Wildcard { .. } => tables.wildcard.push(registration),
        }
        Ok(SubscriptionId(id))
    }

    /// Unregister a handler. Returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut tables = self.tables.write().unwrap();
        let mut removed = false;
        for regs in tables.literal.values_mut() {
            let before = regs.len();
            regs.retain(|r| r.id != id.0);
            removed |= regs.len() != before;
        }
        tables.literal.retain(|_, regs| !regs.is_empty());
        let before = tables.wildcard.len();
        tables.wildcard.retain(|r| r.id != id.0);
        removed | (tables.wildcard.len() != before)
    }

    fn matching(&self, event: &str) -> Vec<Arc<Registration>> {
        let tables = self.tables.read().unwrap();
        let mut regs: Vec<Arc<Registration>> = tables
            .literal
            .get(event)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        regs.extend(
            tables
                .wildcard
                .iter()
                .filter(|r| r.pattern.matches(event))
                .cloned(),
        );
        // Priority descending; registration order breaks ties.
        regs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        regs
    }

    /// Whether any handler matches the event name.
    pub fn has_handlers(&self, event: &str) -> bool {
        !self.matching(event).is_empty()
    }

    /// Emit an event: journal it, run matching handlers in order, collect
    /// non-void returns, and resolve any pending correlation.
    pub async fn emit(&self, event: &str, data: Value, mut context: EventContext) -> EmitResult {
        if context.timestamp.is_none() {
            context.timestamp = Some(now_iso());
        }

        let max_depth = self.limits.max_route_depth();
        if context.route_depth > max_depth {
            let error = KsiError::internal(format!(
                "routing depth {} exceeds limit {max_depth} for {event}",
                context.route_depth
            ));
            warn!(event, depth = context.route_depth, "emit chain aborted");
            self.monitor.record(&Envelope::with_context(
                "event:error",
                json!({
                    "source_event": event,
                    "error": error.to_value()["error"],
                }),
                context.propagate(),
            ));
            if let Some(cid) = &context.correlation_id {
                self.resolve_pending(cid, Err(KsiError::internal(error.to_string())));
            }
            return EmitResult {
                handler_count: 0,
                results: vec![error.to_value()],
            };
        }

        let envelope = Envelope::with_context(event, data.clone(), context.clone());
        self.monitor.record(&envelope);

        let regs = self.matching(event);
        let handler_count = regs.len();
        let mut results = Vec::new();
        for reg in regs {
            match (reg.handler)(data.clone(), context.clone()).await {
                Ok(Some(value)) => results.push(value),
                Ok(None) => {}
                Err(err) => {
                    warn!(event, error = %err, "handler failed");
                    results.push(err.to_value());
                }
            }
        }

        if let Some(cid) = &context.correlation_id {
            self.settle_after_emit(cid, handler_count, &results);
        }

        let tap = self.tap.read().unwrap().clone();
        if let Some(tap) = tap {
            tap(event.to_string(), data, context).await;
        }

        EmitResult {
            handler_count,
            results,
        }
    }

    /// Emit and expect exactly one reply; warns when the handler count says
    /// otherwise and returns the first result.
    pub async fn emit_single(
        &self,
        event: &str,
        data: Value,
        context: EventContext,
    ) -> Option<Value> {
        let outcome = self.emit(event, data, context).await;
        if outcome.results.len() != 1 {
            warn!(
                event,
                results = outcome.results.len(),
                "emit_single expected exactly one result"
            );
        }
        outcome.into_single()
    }

    /// Emit and await the correlated reply with the default timeout.
    pub async fn request(
        &self,
        event: &str,
        data: Value,
        context: EventContext,
    ) -> Result<Value, KsiError> {
        let timeout = Duration::from_millis(self.limits.correlation_timeout_ms());
        self.request_with_timeout(event, data, context, timeout).await
    }

    /// Emit and await the correlated reply. Exactly one of result, error, or
    /// timeout resolves the wait.
    pub async fn request_with_timeout(
        &self,
        event: &str,
        data: Value,
        mut context: EventContext,
        timeout: Duration,
    ) -> Result<Value, KsiError> {
        let correlation_id = context
            .correlation_id
            .get_or_insert_with(new_correlation_id)
            .clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(correlation_id.clone(), tx);

        let _ = self.emit(event, data, context).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(KsiError::internal("reply channel dropped")),
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(KsiError::timeout(format!(
                    "no reply for {event} within {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Explicit reply to a pending correlated request. Returns whether a
    /// waiter was resolved.
    pub fn reply(&self, correlation_id: &str, value: Value) -> bool {
        self.resolve_pending(correlation_id, Ok(value))
    }

    fn resolve_pending(&self, correlation_id: &str, result: Result<Value, KsiError>) -> bool {
        let sender = self.pending.lock().unwrap().remove(correlation_id);
        match sender {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// After an emission, settle the pending waiter from the synchronous
    /// handler results: first value wins, no-handler becomes an error, and a
    /// silent handler set leaves the waiter pending for an async `reply`.
    fn settle_after_emit(&self, correlation_id: &str, handler_count: usize, results: &[Value]) {
        let has_waiter = self.pending.lock().unwrap().contains_key(correlation_id);
        if !has_waiter {
            return;
        }
        if let Some(first) = results.first() {
            self.resolve_pending(correlation_id, Ok(first.clone()));
        } else if handler_count == 0 {
            self.resolve_pending(
                correlation_id,
                Err(KsiError::bad_request("no handler registered for event")),
            );
        } else {
            debug!(correlation_id, "handlers silent, awaiting async reply");
        }
    }
}

/// Reply value helper: whether a reply is an error object.
pub fn reply_is_error(value: &Value) -> bool {
    is_error_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_core::config::{LimitsConfig, MonitorConfig};
    use std::sync::atomic::AtomicUsize;

    fn dispatcher() -> Arc<EventDispatcher> {
        let monitor = MonitorLog::new(MonitorConfig::default(), None);
        let limits = RuntimeLimits::new(LimitsConfig::default());
        EventDispatcher::new(monitor, limits)
    }

    #[tokio::test]
    async fn test_priority_order_then_registration_order() {
        let d = dispatcher();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 0), ("high", 10), ("mid_a", 5), ("mid_b", 5)] {
            let order = order.clone();
            d.on("order:test", priority, move |_data, _ctx| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(name);
                    Ok(Some(json!(name)))
                }
            });
        }

        let outcome = d.emit("order:test", json!({}), EventContext::default()).await;
        assert_eq!(outcome.handler_count, 4);
        assert_eq!(
            *order.lock().unwrap(),
            vec!["high", "mid_a", "mid_b", "low"]
        );
    }

    #[tokio::test]
    async fn test_wildcard_and_literal_both_fire() {
        let d = dispatcher();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            d.on("agent:*", 0, move |_d, _c| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            });
        }
        {
            let hits = hits.clone();
            d.on("agent:spawn", 0, move |_d, _c| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                }
            });
        }

        let outcome = d.emit("agent:spawn", json!({}), EventContext::default()).await;
        assert_eq!(outcome.handler_count, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let outcome = d
            .emit("agent:terminate", json!({}), EventContext::default())
            .await;
        assert_eq!(outcome.handler_count, 1);
    }

    #[tokio::test]
    async fn test_results_contain_only_non_void_returns() {
        let d = dispatcher();
        d.on("mix:event", 10, |_d, _c| async { Ok(Some(json!("value"))) });
        d.on("mix:event", 0, |_d, _c| async { Ok(None) });

        let outcome = d.emit("mix:event", json!({}), EventContext::default()).await;
        assert_eq!(outcome.handler_count, 2);
        assert_eq!(outcome.results, vec![json!("value")]);
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let d = dispatcher();
        let ran_after = Arc::new(AtomicUsize::new(0));
        d.on("fail:event", 10, |_d, _c| async {
            Err(KsiError::precondition("entity not found"))
        });
        {
            let ran_after = ran_after.clone();
            d.on("fail:event", 0, move |_d, _c| {
                let ran_after = ran_after.clone();
                async move {
                    ran_after.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(json!({"status": "ok"})))
                }
            });
        }

        let outcome = d.emit("fail:event", json!({}), EventContext::default()).await;
        assert_eq!(outcome.results.len(), 2);
        assert!(reply_is_error(&outcome.results[0]));
        assert_eq!(outcome.results[0]["error"]["code"], "precondition");
        assert_eq!(outcome.results[1]["status"], "ok");
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_emit_single_returns_first_and_warns_on_extra() {
        let d = dispatcher();
        d.on("single:event", 10, |_d, _c| async { Ok(Some(json!("first"))) });
        d.on("single:event", 0, |_d, _c| async { Ok(Some(json!("second"))) });

        let value = d
            .emit_single("single:event", json!({}), EventContext::default())
            .await;
        assert_eq!(value, Some(json!("first")));

        let none = d
            .emit_single("single:none", json!({}), EventContext::default())
            .await;
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_off_unregisters() {
        let d = dispatcher();
        let id = d.on("gone:event", 0, |_d, _c| async { Ok(Some(json!(1))) });
        assert!(d.has_handlers("gone:event"));
        assert!(d.off(id));
        assert!(!d.has_handlers("gone:event"));
        assert!(!d.off(id));
    }

    #[tokio::test]
    async fn test_monitor_records_before_handler_result() {
        let d = dispatcher();
        let monitor = d.monitor().clone();
        {
            let monitor = monitor.clone();
            d.on("journal:check", 0, move |_d, ctx| {
                let monitor = monitor.clone();
                async move {
                    // The emission is already journaled when the handler runs.
                    let events = monitor.get_events(&[], None, None, 100, true);
                    let found = events.iter().any(|e| {
                        e["event_name"] == "journal:check"
                            && e["correlation_id"] == ctx.correlation_id.as_deref().unwrap()
                    });
                    Ok(Some(json!({"journaled": found})))
                }
            });
        }
        let mut ctx = EventContext::default();
        ctx.correlation_id = Some("corr-journal".into());
        let outcome = d.emit("journal:check", json!({}), ctx).await;
        assert_eq!(outcome.results[0]["journaled"], true);
    }

    #[tokio::test]
    async fn test_request_resolves_from_handler_return() {
        let d = dispatcher();
        d.on("req:event", 0, |_d, _c| async { Ok(Some(json!({"answer": 42}))) });
        let reply = d
            .request("req:event", json!({}), EventContext::default())
            .await
            .unwrap();
        assert_eq!(reply["answer"], 42);
    }

    #[tokio::test]
    async fn test_request_without_handler_is_bad_request() {
        let d = dispatcher();
        let err = d
            .request("nobody:home", json!({}), EventContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn test_request_times_out_on_silent_handler() {
        let d = dispatcher();
        d.on("silent:event", 0, |_d, _c| async { Ok(None) });
        let err = d
            .request_with_timeout(
                "silent:event",
                json!({}),
                EventContext::default(),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "timeout");
    }

    #[tokio::test]
    async fn test_async_reply_resolves_request() {
        let d = dispatcher();
        {
            let d2 = Arc::downgrade(&d);
            d.on("deferred:event", 0, move |_data, ctx| {
                let d2 = d2.clone();
                async move {
                    let cid = ctx.correlation_id.clone().unwrap();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        if let Some(d) = d2.upgrade() {
                            d.reply(&cid, json!({"deferred": true}));
                        }
                    });
                    Ok(None)
                }
            });
        }
        let reply = d
            .request_with_timeout(
                "deferred:event",
                json!({}),
                EventContext::default(),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply["deferred"], true);
    }

    #[tokio::test]
    async fn test_route_depth_bound_aborts_chain() {
        let d = dispatcher();
        let mut ctx = EventContext::default();
        ctx.route_depth = d.limits().max_route_depth() + 1;
        let outcome = d.emit("deep:event", json!({}), ctx).await;
        assert_eq!(outcome.handler_count, 0);
        assert!(reply_is_error(&outcome.results[0]));

        // The abort leaves an error event in the journal.
        let errors = d.monitor().get_events(
            &ksi_core::pattern::parse_patterns(&["event:error".to_string()]).unwrap(),
            None,
            None,
            10,
            false,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["data"]["source_event"], "deep:event");
    }

    #[tokio::test]
    async fn test_side_effects_visible_to_later_handlers() {
        let d = dispatcher();
        let shared = Arc::new(Mutex::new(0u32));
        {
            let shared = shared.clone();
            d.on("chain:event", 10, move |_d, _c| {
                let shared = shared.clone();
                async move {
                    *shared.lock().unwrap() = 7;
                    Ok(None)
                }
            });
        }
        {
            let shared = shared.clone();
            d.on("chain:event", 0, move |_d, _c| {
                let shared = shared.clone();
                async move {
                    let seen = *shared.lock().unwrap();
                    Ok(Some(json!({"seen": seen})))
                }
            });
        }
        let outcome = d.emit("chain:event", json!({}), EventContext::default()).await;
        assert_eq!(outcome.results[0]["seen"], 7);
    }
}

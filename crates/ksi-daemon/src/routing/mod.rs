//! Dynamic routing rules: TTL-scoped transformers persisted in the store.
//!
//! A routing rule watches a source pattern and re-emits matching events under
//! a new name, optionally filtered by a condition and rewritten through a
//! mapping template. Rules are persisted as entities of type `routing_rule`
//! so they survive restarts; the live compiled table is rebuilt from the
//! store at startup.
//!
//! Rule CRUD keeps store and live table in step: the store write lands
//! first, then the compiled rule is swapped in; if compilation fails the
//! store write is rolled back and the request fails.
//!
//! `parent_scope` ties a rule's life to another entity (usually an agent).
//! A reverse index `parent_id → rule_ids` is consulted on every
//! `state:entity:delete` and cascades transitively, so rules parented on
//! deleted rules die too.

pub mod transformer;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

use ksi_core::KsiError;
use ksi_core::envelope::{EventContext, now_epoch, prefixed_id};
use ksi_core::pattern::EventPattern;

use crate::dispatcher::EventDispatcher;
use crate::state::StateStore;
use transformer::{Expr, parse_condition, render_mapping};

/// Entity type under which rules are persisted.
pub const RULE_ENTITY_TYPE: &str = "routing_rule";

/// Default rule priority.
pub const DEFAULT_RULE_PRIORITY: i64 = 100;

/// The entity a rule's life is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentScope {
    #[serde(rename = "type")]
    pub scope_type: String,
    pub id: String,
}

/// A routing rule as stored and listed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub rule_id: String,
    pub source_pattern: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Value>,
    pub priority: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    /// Epoch seconds after which the rule stops matching.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_scope: Option<ParentScope>,
    pub created_by: String,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl RoutingRule {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn to_properties(&self) -> Map<String, Value> {
        let mut props = Map::new();
        props.insert("source_pattern".into(), json!(self.source_pattern));
        props.insert("target".into(), json!(self.target));
        if let Some(c) = &self.condition {
            props.insert("condition".into(), json!(c));
        }
        if let Some(m) = &self.mapping {
            props.insert("mapping".into(), m.clone());
        }
        props.insert("priority".into(), json!(self.priority));
        if let Some(t) = self.ttl_seconds {
            props.insert("ttl_seconds".into(), json!(t));
        }
        if let Some(e) = self.expires_at {
            props.insert("expires_at".into(), json!(e));
        }
        if let Some(p) = &self.parent_scope {
            props.insert("parent_scope".into(), serde_json::to_value(p).unwrap_or(Value::Null));
        }
        props.insert("created_by".into(), json!(self.created_by));
        props.insert("created_at".into(), json!(self.created_at));
        if let Some(m) = &self.metadata {
            props.insert("metadata".into(), m.clone());
        }
        props
    }

    fn from_entity(entity: &Value) -> Option<Self> {
        let props = entity.get("properties")?.as_object()?;
        Some(Self {
            rule_id: entity.get("id")?.as_str()?.to_string(),
            source_pattern: props.get("source_pattern")?.as_str()?.to_string(),
            target: props.get("target")?.as_str()?.to_string(),
            condition: props
                .get("condition")
                .and_then(Value::as_str)
                .map(str::to_string),
            mapping: props.get("mapping").cloned(),
            priority: props
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_RULE_PRIORITY),
            ttl_seconds: props.get("ttl_seconds").and_then(Value::as_u64),
            expires_at: props.get("expires_at").and_then(Value::as_f64),
            parent_scope: props
                .get("parent_scope")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            created_by: props
                .get("created_by")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            created_at: props
                .get("created_at")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            metadata: props.get("metadata").cloned(),
        })
    }
}

/// A rule with its compiled pattern and condition.
pub struct CompiledRule {
    pub rule: RoutingRule,
    pattern: EventPattern,
    condition: Option<Expr>,
}

impl CompiledRule {
    fn compile(rule: RoutingRule) -> Result<Self, KsiError> {
        let pattern = EventPattern::parse(&rule.source_pattern)?;
        let condition = match &rule.condition {
            Some(src) => Some(parse_condition(src).map_err(|e| {
                KsiError::bad_request(format!("invalid condition for {}: {e}", rule.rule_id))
            })?),
            None => None,
        };
        Ok(Self {
            rule,
            pattern,
            condition,
        })
    }
}

#[derive(Default)]
struct Table {
    by_id: HashMap<String, Arc<CompiledRule>>,
    by_parent: HashMap<String, HashSet<String>>,
}

impl Table {
    fn insert(&mut self, compiled: Arc<CompiledRule>) {
        if let Some(parent) = &compiled.rule.parent_scope {
            self.by_parent
                .entry(parent.id.clone())
                .or_default()
                .insert(compiled.rule.rule_id.clone());
        }
        self.by_id.insert(compiled.rule.rule_id.clone(), compiled);
    }

    fn remove(&mut self, rule_id: &str) -> Option<Arc<CompiledRule>> {
        let compiled = self.by_id.remove(rule_id)?;
        if let Some(parent) = &compiled.rule.parent_scope {
            if let Some(set) = self.by_parent.get_mut(&parent.id) {
                set.remove(rule_id);
                if set.is_empty() {
                    self.by_parent.remove(&parent.id);
                }
            }
        }
        Some(compiled)
    }
}

/// The routing core. One per daemon; shared by `Arc`.
pub struct RoutingService {
    store: Arc<StateStore>,
    table: Mutex<Table>,
}

impl RoutingService {
    pub fn new(store: Arc<StateStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            table: Mutex::new(Table::default()),
        })
    }

    /// Rebuild the live table from persisted rules; expired rules found
    /// during the scan are deleted. Returns the number of live rules.
    pub fn load_from_store(&self) -> Result<usize, KsiError> {
        let entities =
            self.store
                .query_entities(Some(RULE_ENTITY_TYPE), &Map::new(), None, None, true)?;
        let now = now_epoch();
        let mut loaded = 0usize;
        for entity in &entities {
            let Some(rule) = RoutingRule::from_entity(entity) else {
                warn!("skipping malformed routing_rule entity: {entity}");
                continue;
            };
            if rule.is_expired(now) {
                let _ = self.store.delete_entity(&rule.rule_id);
                continue;
            }
            match CompiledRule::compile(rule) {
                Ok(compiled) => {
                    self.table.lock().unwrap().insert(Arc::new(compiled));
                    loaded += 1;
                }
                Err(e) => warn!("skipping uncompilable routing rule: {e}"),
            }
        }
        info!(loaded, "routing rules restored from store");
        Ok(loaded)
    }

    /// Create a rule from an `routing:add_rule` payload.
    pub fn add_rule(&self, data: &Value, ctx: &EventContext) -> Result<Value, KsiError> {
        let source_pattern = data
            .get("source_pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| KsiError::bad_request("source_pattern is required"))?
            .to_string();
        let target = data
            .get("target")
            .and_then(Value::as_str)
            .ok_or_else(|| KsiError::bad_request("target is required"))?
            .to_string();
        let rule_id = data
            .get("rule_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| prefixed_id("rule"));
        let now = now_epoch();
        let ttl_seconds = data
            .get("ttl")
            .or_else(|| data.get("ttl_seconds"))
            .and_then(Value::as_u64);

        let rule = RoutingRule {
            rule_id: rule_id.clone(),
            source_pattern,
            target,
            condition: data
                .get("condition")
                .and_then(Value::as_str)
                .map(str::to_string),
            mapping: data.get("mapping").filter(|m| !m.is_null()).cloned(),
            priority: data
                .get("priority")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_RULE_PRIORITY),
            ttl_seconds,
            expires_at: ttl_seconds.map(|t| now + t as f64),
            parent_scope: data
                .get("parent_scope")
                .and_then(|v| serde_json::from_value(v.clone()).ok()),
            created_by: ctx
                .agent_id
                .clone()
                .or_else(|| ctx.client_id.clone())
                .or_else(|| {
                    data.get("created_by")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| "daemon".to_string()),
            created_at: now,
            metadata: data.get("metadata").cloned(),
        };

        // Store first, then the live swap; roll the store back if the rule
        // does not compile.
        self.store
            .create_entity(Some(rule_id.clone()), RULE_ENTITY_TYPE, &rule.to_properties())?;
        match CompiledRule::compile(rule.clone()) {
            Ok(compiled) => {
                self.table.lock().unwrap().insert(Arc::new(compiled));
                debug!(rule_id, "routing rule added");
                Ok(json!({ "status": "created", "rule_id": rule_id, "rule": rule }))
            }
            Err(e) => {
                let _ = self.store.delete_entity(&rule_id);
                Err(e)
            }
        }
    }

    /// Merge updates into an existing rule.
    pub fn update_rule(&self, data: &Value) -> Result<Value, KsiError> {
        let rule_id = data
            .get("rule_id")
            .and_then(Value::as_str)
            .ok_or_else(|| KsiError::bad_request("rule_id is required"))?
            .to_string();

        let mut rule = {
            let table = self.table.lock().unwrap();
            table
                .by_id
                .get(&rule_id)
                .map(|c| c.rule.clone())
                .ok_or_else(|| KsiError::precondition(format!("rule {rule_id} not found")))?
        };

        if let Some(v) = data.get("source_pattern").and_then(Value::as_str) {
            rule.source_pattern = v.to_string();
        }
        if let Some(v) = data.get("target").and_then(Value::as_str) {
            rule.target = v.to_string();
        }
        if let Some(v) = data.get("condition") {
            rule.condition = v.as_str().map(str::to_string);
        }
        if let Some(v) = data.get("mapping") {
            rule.mapping = if v.is_null() { None } else { Some(v.clone()) };
        }
        if let Some(v) = data.get("priority").and_then(Value::as_i64) {
            rule.priority = v;
        }
        if let Some(v) = data.get("ttl").or_else(|| data.get("ttl_seconds")) {
            rule.ttl_seconds = v.as_u64();
            rule.expires_at = rule.ttl_seconds.map(|t| now_epoch() + t as f64);
        }
        if let Some(v) = data.get("parent_scope") {
            rule.parent_scope = serde_json::from_value(v.clone()).ok();
        }

        // Validate before touching the store so a bad update leaves the old
        // rule intact everywhere.
        let compiled = CompiledRule::compile(rule.clone())?;
        self.store.update_entity(&rule_id, &rule.to_properties())?;
        {
            let mut table = self.table.lock().unwrap();
            table.remove(&rule_id);
            table.insert(Arc::new(compiled));
        }
        debug!(rule_id, "routing rule updated");
        Ok(json!({ "status": "updated", "rule_id": rule_id, "rule": rule }))
    }

    /// Remove one rule from store and live table.
    pub fn remove_rule(&self, rule_id: &str) -> Result<Value, KsiError> {
        let existed = self.store.delete_entity(rule_id)?;
        let live = self.table.lock().unwrap().remove(rule_id).is_some();
        if !existed && !live {
            return Err(KsiError::precondition(format!("rule {rule_id} not found")));
        }
        debug!(rule_id, "routing rule removed");
        Ok(json!({ "status": "removed", "rule_id": rule_id }))
    }

    /// Non-expired rules, highest priority first, ties oldest first.
    pub fn list_rules(&self) -> Value {
        let now = now_epoch();
        let mut rules: Vec<RoutingRule> = {
            let table = self.table.lock().unwrap();
            table
                .by_id
                .values()
                .map(|c| c.rule.clone())
                .filter(|r| !r.is_expired(now))
                .collect()
        };
        sort_rules(&mut rules);
        json!({ "count": rules.len(), "rules": rules })
    }

    /// Delete every rule scoped to `entity_id`, transitively.
    pub fn cascade_delete_parent(&self, entity_id: &str) -> Vec<String> {
        let direct: Vec<String> = {
            let table = self.table.lock().unwrap();
            table
                .by_parent
                .get(entity_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        let mut removed = Vec::new();
        for rule_id in direct {
            if self.table.lock().unwrap().remove(&rule_id).is_some() {
                let _ = self.store.delete_entity(&rule_id);
                removed.push(rule_id.clone());
                // A rule can itself be a parent scope.
                removed.extend(self.cascade_delete_parent(&rule_id));
            }
        }
        if !removed.is_empty() {
            info!(parent = entity_id, count = removed.len(), "cascaded routing rules");
        }
        removed
    }

    /// Drop every expired rule from store and table. Returns the count.
    pub fn expire_sweep(&self) -> usize {
        let now = now_epoch();
        let expired: Vec<String> = {
            let table = self.table.lock().unwrap();
            table
                .by_id
                .values()
                .filter(|c| c.rule.is_expired(now))
                .map(|c| c.rule.rule_id.clone())
                .collect()
        };
        for rule_id in &expired {
            self.table.lock().unwrap().remove(rule_id);
            let _ = self.store.delete_entity(rule_id);
            debug!(rule_id, "routing rule expired");
        }
        expired.len()
    }

    fn matching(&self, event: &str) -> Vec<Arc<CompiledRule>> {
        let now = now_epoch();
        let mut rules: Vec<Arc<CompiledRule>> = {
            let table = self.table.lock().unwrap();
            table
                .by_id
                .values()
                .filter(|c| !c.rule.is_expired(now) && c.pattern.matches(event))
                .cloned()
                .collect()
        };
        rules.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(
                    a.rule
                        .created_at
                        .partial_cmp(&b.rule.created_at)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(a.rule.rule_id.cmp(&b.rule.rule_id))
        });
        rules
    }

    /// Apply every matching rule to one emission, re-emitting through the
    /// dispatcher. A failure inside one rule's condition or mapping only
    /// suppresses that rule.
    pub async fn apply(
        &self,
        dispatcher: &Arc<EventDispatcher>,
        event: &str,
        data: &Value,
        ctx: &EventContext,
    ) {
        for compiled in self.matching(event) {
            if let Some(condition) = &compiled.condition {
                match condition.eval(data, ctx) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            rule_id = %compiled.rule.rule_id,
                            "condition evaluation failed: {e}"
                        );
                        continue;
                    }
                }
            }
            let new_data = match &compiled.rule.mapping {
                Some(mapping) => render_mapping(mapping, data),
                None => data.clone(),
            };
            debug!(
                rule_id = %compiled.rule.rule_id,
                source = event,
                target = %compiled.rule.target,
                "routing rule fired"
            );
            dispatcher
                .emit(&compiled.rule.target, new_data, ctx.route_child())
                .await;
        }
    }
}

fn sort_rules(rules: &mut [RoutingRule]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(
                a.created_at
                    .partial_cmp(&b.created_at)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.rule_id.cmp(&b.rule_id))
    });
}

/// Register rule CRUD handlers, the transformer tap, and the parent-scope
/// cascade hook.
pub fn register_handlers(dispatcher: &Arc<EventDispatcher>, routing: Arc<RoutingService>) {
    {
        let routing = routing.clone();
        dispatcher.on("routing:add_rule", 0, move |data, ctx| {
            let routing = routing.clone();
            async move { Ok(Some(routing.add_rule(&data, &ctx)?)) }
        });
    }
    {
        let routing = routing.clone();
        dispatcher.on("routing:update_rule", 0, move |data, _ctx| {
            let routing = routing.clone();
            async move { Ok(Some(routing.update_rule(&data)?)) }
        });
    }
    {
        let routing = routing.clone();
        dispatcher.on("routing:remove_rule", 0, move |data, _ctx| {
            let routing = routing.clone();
            async move {
                let rule_id = data
                    .get("rule_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| KsiError::bad_request("rule_id is required"))?;
                Ok(Some(routing.remove_rule(rule_id)?))
            }
        });
    }
    {
        let routing = routing.clone();
        dispatcher.on("routing:list_rules", 0, move |_data, _ctx| {
            let routing = routing.clone();
            async move { Ok(Some(routing.list_rules())) }
        });
    }

    // Cascade before the store handler deletes the entity row.
    {
        let routing = routing.clone();
        dispatcher.on("state:entity:delete", 100, move |data, _ctx| {
            let routing = routing.clone();
            async move {
                if let Some(id) = data.get("id").and_then(Value::as_str) {
                    routing.cascade_delete_parent(id);
                }
                Ok(None)
            }
        });
    }

    // The transformer tap runs after the handlers of every emission; its
    // re-emissions go back through the dispatcher with an incremented route
    // depth.
    let weak: Weak<EventDispatcher> = Arc::downgrade(dispatcher);
    dispatcher.set_tap(move |event, data, ctx| {
        let routing = routing.clone();
        let weak = weak.clone();
        async move {
            if let Some(dispatcher) = weak.upgrade() {
                routing.apply(&dispatcher, &event, &data, &ctx).await;
            }
        }
    });
}

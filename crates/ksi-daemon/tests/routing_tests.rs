//! Integration tests for the routing/transformer core.

mod common;

use common::{fabric, journal, wait_for_entry};
use ksi_core::envelope::EventContext;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_echo_through_a_transformer() {
    let f = fabric();

    let reply = f
        .dispatcher
        .request(
            "routing:add_rule",
            json!({
                "source_pattern": "test:src",
                "target": "test:dst",
                "mapping": { "value": "{{x}}" },
                "ttl": 60,
            }),
            EventContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply["status"], "created");

    f.dispatcher
        .emit("test:src", json!({"x": 42}), EventContext::default())
        .await;

    let src = journal(&f.monitor, "test:src");
    assert_eq!(src.len(), 1);
    let dst = wait_for_entry(&f.monitor, "test:dst", Duration::from_secs(2), |_| true).await;
    assert_eq!(dst["data"], json!({"value": 42}));
}

#[tokio::test]
async fn test_rule_without_mapping_forwards_data() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({"source_pattern": "fwd:src", "target": "fwd:dst"}),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit("fwd:src", json!({"a": 1, "b": [2, 3]}), EventContext::default())
        .await;

    let dst = wait_for_entry(&f.monitor, "fwd:dst", Duration::from_secs(2), |_| true).await;
    assert_eq!(dst["data"], json!({"a": 1, "b": [2, 3]}));
}

#[tokio::test]
async fn test_condition_gates_the_rule() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({
                "source_pattern": "cond:src",
                "target": "cond:dst",
                "condition": "kind == 'good' and score >= 3",
            }),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit(
            "cond:src",
            json!({"kind": "bad", "score": 9}),
            EventContext::default(),
        )
        .await;
    f.dispatcher
        .emit(
            "cond:src",
            json!({"kind": "good", "score": 2}),
            EventContext::default(),
        )
        .await;
    assert!(journal(&f.monitor, "cond:dst").is_empty());

    f.dispatcher
        .emit(
            "cond:src",
            json!({"kind": "good", "score": 3}),
            EventContext::default(),
        )
        .await;
    let dst = wait_for_entry(&f.monitor, "cond:dst", Duration::from_secs(2), |_| true).await;
    assert_eq!(dst["data"]["kind"], "good");
}

#[tokio::test]
async fn test_ttl_expiry_stops_matching() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({
                "source_pattern": "ttl:src",
                "target": "ttl:dst",
                "ttl": 1,
            }),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit("ttl:src", json!({"n": 1}), EventContext::default())
        .await;
    assert_eq!(journal(&f.monitor, "ttl:dst").len(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The rule is past its expiry: no further emissions, with or without
    // the sweeper having run.
    f.dispatcher
        .emit("ttl:src", json!({"n": 2}), EventContext::default())
        .await;
    assert_eq!(journal(&f.monitor, "ttl:dst").len(), 1);

    let swept = f.routing.expire_sweep();
    assert_eq!(swept, 1);
    let listed = f.routing.list_rules();
    assert_eq!(listed["count"], 0);
}

#[tokio::test]
async fn test_parent_scope_cascade() {
    let f = fabric();

    f.dispatcher
        .emit(
            "state:entity:create",
            json!({"id": "agent_a", "type": "agent"}),
            EventContext::default(),
        )
        .await;
    let reply = f
        .routing
        .add_rule(
            &json!({
                "rule_id": "scoped_rule",
                "source_pattern": "scoped:src",
                "target": "scoped:dst",
                "parent_scope": {"type": "agent", "id": "agent_a"},
            }),
            &EventContext::default(),
        )
        .unwrap();
    assert_eq!(reply["rule_id"], "scoped_rule");

    // Delete the parent entity; the scoped rule must die with it.
    f.dispatcher
        .emit(
            "state:entity:delete",
            json!({"id": "agent_a"}),
            EventContext::default(),
        )
        .await;

    let listed = f.routing.list_rules();
    assert_eq!(listed["count"], 0);
    assert!(
        f.store.get_entity("scoped_rule", false, false).unwrap().is_none(),
        "rule entity should be deleted from the store"
    );

    f.dispatcher
        .emit("scoped:src", json!({}), EventContext::default())
        .await;
    assert!(journal(&f.monitor, "scoped:dst").is_empty());
}

#[tokio::test]
async fn test_cascade_is_transitive_through_rules() {
    let f = fabric();
    f.dispatcher
        .emit(
            "state:entity:create",
            json!({"id": "agent_root", "type": "agent"}),
            EventContext::default(),
        )
        .await;
    f.routing
        .add_rule(
            &json!({
                "rule_id": "rule_child",
                "source_pattern": "c:src",
                "target": "c:dst",
                "parent_scope": {"type": "agent", "id": "agent_root"},
            }),
            &EventContext::default(),
        )
        .unwrap();
    f.routing
        .add_rule(
            &json!({
                "rule_id": "rule_grandchild",
                "source_pattern": "g:src",
                "target": "g:dst",
                "parent_scope": {"type": "routing_rule", "id": "rule_child"},
            }),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit(
            "state:entity:delete",
            json!({"id": "agent_root"}),
            EventContext::default(),
        )
        .await;

    assert_eq!(f.routing.list_rules()["count"], 0);
}

#[tokio::test]
async fn test_priority_orders_rule_emissions() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({
                "rule_id": "low",
                "source_pattern": "prio:src",
                "target": "prio:low",
                "priority": 1,
            }),
            &EventContext::default(),
        )
        .unwrap();
    f.routing
        .add_rule(
            &json!({
                "rule_id": "high",
                "source_pattern": "prio:src",
                "target": "prio:high",
                "priority": 10,
            }),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit("prio:src", json!({}), EventContext::default())
        .await;

    let all = f.monitor.get_events(
        &ksi_core::pattern::parse_patterns(&["prio:*".to_string()]).unwrap(),
        None,
        None,
        100,
        false,
    );
    let names: Vec<&str> = all
        .iter()
        .map(|e| e["event_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["prio:src", "prio:high", "prio:low"]);
}

#[tokio::test]
async fn test_routing_cycle_is_depth_bounded() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({"source_pattern": "loop:a", "target": "loop:b"}),
            &EventContext::default(),
        )
        .unwrap();
    f.routing
        .add_rule(
            &json!({"source_pattern": "loop:b", "target": "loop:a"}),
            &EventContext::default(),
        )
        .unwrap();

    f.dispatcher
        .emit("loop:a", json!({}), EventContext::default())
        .await;

    let depth_limit = f.limits.max_route_depth() as usize;
    let a_count = journal(&f.monitor, "loop:a").len();
    let b_count = journal(&f.monitor, "loop:b").len();
    // The chain stops at the bound instead of spinning forever.
    assert!(a_count + b_count <= depth_limit + 2);
    assert_eq!(journal(&f.monitor, "event:error").len(), 1);
}

#[tokio::test]
async fn test_update_and_remove_rule() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({
                "rule_id": "mut_rule",
                "source_pattern": "mut:src",
                "target": "mut:dst",
            }),
            &EventContext::default(),
        )
        .unwrap();

    let updated = f
        .routing
        .update_rule(&json!({"rule_id": "mut_rule", "target": "mut:dst2"}))
        .unwrap();
    assert_eq!(updated["rule"]["target"], "mut:dst2");

    f.dispatcher
        .emit("mut:src", json!({}), EventContext::default())
        .await;
    assert!(journal(&f.monitor, "mut:dst").is_empty());
    assert_eq!(journal(&f.monitor, "mut:dst2").len(), 1);

    f.routing.remove_rule("mut_rule").unwrap();
    assert!(f.routing.remove_rule("mut_rule").is_err());
    f.dispatcher
        .emit("mut:src", json!({}), EventContext::default())
        .await;
    assert_eq!(journal(&f.monitor, "mut:dst2").len(), 1);
}

#[tokio::test]
async fn test_invalid_rule_rolls_back_the_store_write() {
    let f = fabric();
    let err = f
        .routing
        .add_rule(
            &json!({
                "rule_id": "bad_rule",
                "source_pattern": "bad:src",
                "target": "bad:dst",
                "condition": "this is ( not valid",
            }),
            &EventContext::default(),
        )
        .unwrap_err();
    assert_eq!(err.code(), "bad_request");
    assert!(
        f.store.get_entity("bad_rule", false, false).unwrap().is_none(),
        "failed compile must roll the entity back"
    );
}

#[tokio::test]
async fn test_rules_reload_from_store() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({
                "rule_id": "persisted",
                "source_pattern": "persist:src",
                "target": "persist:dst",
                "priority": 7,
            }),
            &EventContext::default(),
        )
        .unwrap();

    // A fresh routing service over the same store sees the rule.
    let reloaded = ksi_daemon::RoutingService::new(f.store.clone());
    assert_eq!(reloaded.load_from_store().unwrap(), 1);
    let listed = reloaded.list_rules();
    assert_eq!(listed["rules"][0]["rule_id"], "persisted");
    assert_eq!(listed["rules"][0]["priority"], 7);
}

#[tokio::test]
async fn test_agent_attribution_propagates_through_routing() {
    let f = fabric();
    f.routing
        .add_rule(
            &json!({"source_pattern": "attr:src", "target": "attr:dst"}),
            &EventContext::default(),
        )
        .unwrap();

    let ctx = EventContext {
        agent_id: Some("agent_42".into()),
        ..Default::default()
    };
    f.dispatcher.emit("attr:src", json!({}), ctx).await;

    let dst = wait_for_entry(&f.monitor, "attr:dst", Duration::from_secs(2), |_| true).await;
    assert_eq!(dst["agent_id"], "agent_42");
}
